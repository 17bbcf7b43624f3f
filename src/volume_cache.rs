use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use log::warn;
use parking_lot::Mutex;
use thiserror::Error;

/// Invoked as `(bytes_loaded, bytes_total)` after every received chunk, in
/// strictly increasing order, ending with `bytes_loaded == bytes_total`.
pub type ProgressCallback = Arc<dyn Fn(u64, u64) + Send + Sync>;

#[derive(Debug, Clone, Error)]
pub enum TransferError {
    #[error("HTTP {status} for {url}")]
    Status { status: u16, url: String },

    #[error("request timed out: {0}")]
    Timeout(String),

    #[error("network error: {0}")]
    Network(String),

    #[error("could not initialize HTTP client: {0}")]
    Client(String),
}

/// Byte transport for volume resources. Abstracted so the cache (and tests)
/// are independent of the HTTP stack.
#[async_trait]
pub trait VolumeFetcher: Send + Sync {
    async fn fetch(
        &self,
        resource_id: &str,
        progress: Option<ProgressCallback>,
    ) -> Result<Vec<u8>, TransferError>;
}

/// Downloads a volume resource over HTTP (`GET {base}/{id}/download`).
pub struct HttpVolumeFetcher {
    client: reqwest::Client,
    base_url: String,
}

impl HttpVolumeFetcher {
    pub fn new(base_url: impl Into<String>) -> Result<Self, TransferError> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|err| TransferError::Client(err.to_string()))?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    fn download_url(&self, resource_id: &str) -> String {
        format!("{}/{}/download", self.base_url, resource_id)
    }

    fn classify(url: &str, err: reqwest::Error) -> TransferError {
        if err.is_timeout() {
            TransferError::Timeout(url.to_string())
        } else {
            TransferError::Network(err.to_string())
        }
    }
}

#[async_trait]
impl VolumeFetcher for HttpVolumeFetcher {
    async fn fetch(
        &self,
        resource_id: &str,
        progress: Option<ProgressCallback>,
    ) -> Result<Vec<u8>, TransferError> {
        let url = self.download_url(resource_id);
        let mut response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|err| Self::classify(&url, err))?;

        let status = response.status();
        if !status.is_success() {
            return Err(TransferError::Status {
                status: status.as_u16(),
                url,
            });
        }

        let total = response.content_length();
        match (total, progress) {
            (Some(total), Some(on_progress)) if total > 0 => {
                let mut buffer = Vec::with_capacity(total as usize);
                let mut loaded = 0u64;
                while let Some(chunk) = response
                    .chunk()
                    .await
                    .map_err(|err| Self::classify(&url, err))?
                {
                    loaded += chunk.len() as u64;
                    buffer.extend_from_slice(&chunk);
                    on_progress(loaded, total);
                }
                Ok(buffer)
            }
            (_, progress) => {
                // No declared size: bulk read with one terminal callback.
                let bytes = response
                    .bytes()
                    .await
                    .map_err(|err| Self::classify(&url, err))?;
                if let Some(on_progress) = progress {
                    on_progress(bytes.len() as u64, bytes.len() as u64);
                }
                Ok(bytes.to_vec())
            }
        }
    }
}

type TransferFuture = Shared<BoxFuture<'static, Result<Arc<Vec<u8>>, TransferError>>>;

struct CachedTransfer {
    future: TransferFuture,
    completed: Arc<AtomicBool>,
    // Identity token so a stale transfer cannot evict its replacement.
    token: Arc<()>,
}

/// Memoizes downloads so each resource id is transferred at most once.
///
/// Concurrent `fetch`/`fetch_with_progress` calls for the same id share a
/// single in-flight transfer and resolve to the same buffer. A failed
/// transfer removes its memo entry, so the next call starts fresh.
pub struct VolumeCache {
    fetcher: Arc<dyn VolumeFetcher>,
    entries: Arc<Mutex<HashMap<String, CachedTransfer>>>,
}

impl VolumeCache {
    pub fn new(fetcher: Arc<dyn VolumeFetcher>) -> Self {
        Self {
            fetcher,
            entries: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub async fn fetch(&self, resource_id: &str) -> Result<Arc<Vec<u8>>, TransferError> {
        self.transfer(resource_id, None).await
    }

    /// Like [`fetch`](Self::fetch), reporting byte-level progress. If the
    /// resource already finished downloading, the callback fires once with
    /// `(total, total)` and the cached buffer is returned. A caller joining
    /// an in-flight transfer shares the result without progress reports.
    pub async fn fetch_with_progress(
        &self,
        resource_id: &str,
        on_progress: ProgressCallback,
    ) -> Result<Arc<Vec<u8>>, TransferError> {
        let replay = {
            let entries = self.entries.lock();
            entries
                .get(resource_id)
                .is_some_and(|entry| entry.completed.load(Ordering::Acquire))
        };
        if replay {
            let buffer = self.transfer(resource_id, None).await?;
            on_progress(buffer.len() as u64, buffer.len() as u64);
            return Ok(buffer);
        }
        self.transfer(resource_id, Some(on_progress)).await
    }

    /// Drop the memo entry for `resource_id`. Only used for explicit memory
    /// reclamation; successful transfers stay cached until then.
    pub fn clear(&self, resource_id: &str) {
        self.entries.lock().remove(resource_id);
    }

    async fn transfer(
        &self,
        resource_id: &str,
        progress: Option<ProgressCallback>,
    ) -> Result<Arc<Vec<u8>>, TransferError> {
        let future = {
            let mut entries = self.entries.lock();
            if let Some(entry) = entries.get(resource_id) {
                entry.future.clone()
            } else {
                let completed = Arc::new(AtomicBool::new(false));
                let token = Arc::new(());
                let fetcher = Arc::clone(&self.fetcher);
                let map = Arc::clone(&self.entries);
                let id = resource_id.to_string();
                let done = Arc::clone(&completed);
                let own_token = Arc::clone(&token);

                let future: TransferFuture = async move {
                    match fetcher.fetch(&id, progress).await {
                        Ok(bytes) => {
                            done.store(true, Ordering::Release);
                            Ok(Arc::new(bytes))
                        }
                        Err(err) => {
                            let mut entries = map.lock();
                            if entries
                                .get(&id)
                                .is_some_and(|entry| Arc::ptr_eq(&entry.token, &own_token))
                            {
                                entries.remove(&id);
                            }
                            Err(err)
                        }
                    }
                }
                .boxed()
                .shared();

                // Detached driver: a viewer torn down mid-transfer stops
                // polling, but the download still completes and is memoized.
                tokio::spawn(future.clone().map(|_| ()));

                entries.insert(
                    resource_id.to_string(),
                    CachedTransfer {
                        future: future.clone(),
                        completed,
                        token,
                    },
                );
                future
            }
        };

        future.await
    }
}

/// Best-effort fetch of a `.json` sidecar resource. Transfer or parse
/// failures are logged and reported as `None`, never as an error.
pub async fn fetch_sidecar_metadata(
    fetcher: &dyn VolumeFetcher,
    resource_id: &str,
) -> Option<serde_json::Value> {
    let bytes = match fetcher.fetch(resource_id, None).await {
        Ok(bytes) => bytes,
        Err(err) => {
            warn!("sidecar metadata fetch failed for {resource_id}: {err}");
            return None;
        }
    };
    match serde_json::from_slice(&bytes) {
        Ok(value) => Some(value),
        Err(err) => {
            warn!("sidecar metadata for {resource_id} is not valid JSON: {err}");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    struct ScriptedFetcher {
        calls: AtomicUsize,
        fail_first: bool,
        payload: Vec<u8>,
    }

    impl ScriptedFetcher {
        fn new(payload: Vec<u8>) -> Self {
            Self {
                calls: AtomicUsize::new(0),
                fail_first: false,
                payload,
            }
        }

        fn failing_once(payload: Vec<u8>) -> Self {
            Self {
                fail_first: true,
                ..Self::new(payload)
            }
        }

        fn call_count(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl VolumeFetcher for ScriptedFetcher {
        async fn fetch(
            &self,
            _resource_id: &str,
            progress: Option<ProgressCallback>,
        ) -> Result<Vec<u8>, TransferError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(5)).await;
            if self.fail_first && call == 0 {
                return Err(TransferError::Network("connection reset".into()));
            }
            if let Some(on_progress) = progress {
                let total = self.payload.len() as u64;
                let mut loaded = 0;
                while loaded < total {
                    loaded = (loaded + 2).min(total);
                    on_progress(loaded, total);
                }
            }
            Ok(self.payload.clone())
        }
    }

    #[tokio::test]
    async fn concurrent_fetches_share_one_transfer() {
        let fetcher = Arc::new(ScriptedFetcher::new(vec![1, 2, 3, 4, 5]));
        let cache = VolumeCache::new(fetcher.clone());

        let (a, b) = tokio::join!(cache.fetch("res"), cache.fetch("res"));
        let (a, b) = (a.unwrap(), b.unwrap());

        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(fetcher.call_count(), 1);
    }

    #[tokio::test]
    async fn progress_call_joins_an_in_flight_plain_fetch() {
        let fetcher = Arc::new(ScriptedFetcher::new(vec![3; 4]));
        let cache = VolumeCache::new(fetcher.clone());

        let on_progress: ProgressCallback = Arc::new(|_, _| {});
        let (a, b) = tokio::join!(
            cache.fetch("res"),
            cache.fetch_with_progress("res", on_progress)
        );

        assert!(Arc::ptr_eq(&a.unwrap(), &b.unwrap()));
        assert_eq!(fetcher.call_count(), 1);
    }

    #[tokio::test]
    async fn distinct_resources_transfer_independently() {
        let fetcher = Arc::new(ScriptedFetcher::new(vec![9]));
        let cache = VolumeCache::new(fetcher.clone());

        cache.fetch("a").await.unwrap();
        cache.fetch("b").await.unwrap();
        assert_eq!(fetcher.call_count(), 2);
    }

    #[tokio::test]
    async fn failed_transfer_clears_the_memo() {
        let fetcher = Arc::new(ScriptedFetcher::failing_once(vec![7, 7]));
        let cache = VolumeCache::new(fetcher.clone());

        assert!(cache.fetch("res").await.is_err());
        let retried = cache.fetch("res").await.unwrap();
        assert_eq!(*retried, vec![7, 7]);
        assert_eq!(fetcher.call_count(), 2);
    }

    #[tokio::test]
    async fn progress_reports_increase_and_terminate_at_total() {
        let fetcher = Arc::new(ScriptedFetcher::new(vec![0; 7]));
        let cache = VolumeCache::new(fetcher);

        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        cache
            .fetch_with_progress(
                "res",
                Arc::new(move |loaded, total| sink.lock().push((loaded, total))),
            )
            .await
            .unwrap();

        let seen = seen.lock();
        assert!(!seen.is_empty());
        for pair in seen.windows(2) {
            assert!(pair[0].0 < pair[1].0);
        }
        assert_eq!(*seen.last().unwrap(), (7, 7));
    }

    #[tokio::test]
    async fn completed_transfer_replays_terminal_progress() {
        let fetcher = Arc::new(ScriptedFetcher::new(vec![0; 5]));
        let cache = VolumeCache::new(fetcher.clone());

        cache.fetch("res").await.unwrap();

        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let buffer = cache
            .fetch_with_progress(
                "res",
                Arc::new(move |loaded, total| sink.lock().push((loaded, total))),
            )
            .await
            .unwrap();

        assert_eq!(buffer.len(), 5);
        assert_eq!(*seen.lock(), vec![(5, 5)]);
        assert_eq!(fetcher.call_count(), 1);
    }

    #[tokio::test]
    async fn clear_forces_a_fresh_transfer() {
        let fetcher = Arc::new(ScriptedFetcher::new(vec![1]));
        let cache = VolumeCache::new(fetcher.clone());

        cache.fetch("res").await.unwrap();
        cache.clear("res");
        cache.fetch("res").await.unwrap();
        assert_eq!(fetcher.call_count(), 2);
    }

    #[tokio::test]
    async fn sidecar_parse_failure_is_tolerated() {
        let fetcher = ScriptedFetcher::new(b"not json at all".to_vec());
        assert!(fetch_sidecar_metadata(&fetcher, "meta").await.is_none());

        let fetcher = ScriptedFetcher::new(br#"{"Modality": "MR"}"#.to_vec());
        let value = fetch_sidecar_metadata(&fetcher, "meta").await.unwrap();
        assert_eq!(value["Modality"], "MR");
    }
}
