use std::time::Duration;

use image::RgbaImage;
use log::error;
use thiserror::Error;
use web_time::Instant;

use crate::config::ViewerConfig;
use crate::enums::Orientation;
use crate::volume::{Volume, VolumeInfo};
use crate::volume_cache::{ProgressCallback, TransferError, VolumeCache};
use crate::volume_decoder::{FormatError, NiftiDecoder};
use crate::windowing::{self, WindowState};

/// One rendered slice, ready for display.
pub struct SliceFrame {
    pub image: RgbaImage,
    pub orientation: Orientation,
    pub slice_index: usize,
}

/// Seam between the viewer engine and whatever puts pixels on screen. A GPU
/// rendering engine plugs in here as an alternative adapter.
pub trait PresentationSurface: Send {
    /// Fired once per successful volume load, before the first frame.
    fn volume_loaded(&mut self, info: &VolumeInfo);

    fn present_frame(&mut self, frame: &SliceFrame);
}

#[derive(Debug, Error)]
pub enum LoadError {
    #[error(transparent)]
    Transfer(#[from] TransferError),

    #[error(transparent)]
    Format(#[from] FormatError),
}

impl LoadError {
    /// Human-readable classification for the retry dialog.
    pub fn user_message(&self) -> String {
        match self {
            LoadError::Transfer(TransferError::Status { status, .. }) => match status {
                404 => "File not found. The NIfTI file may have been deleted or moved.".into(),
                403 => "Access denied. You do not have permission to view this file.".into(),
                500..=599 => "Server error. Please contact your administrator.".into(),
                status => format!("Download failed with HTTP status {status}."),
            },
            LoadError::Transfer(TransferError::Timeout(_)) => {
                "Request timeout. The file is too large or the connection is slow. Please try again."
                    .into()
            }
            LoadError::Transfer(TransferError::Network(_))
            | LoadError::Transfer(TransferError::Client(_)) => {
                "Network error. Please check your internet connection and try again.".into()
            }
            LoadError::Format(_) => {
                "Invalid NIfTI file format. The file may be corrupted.".into()
            }
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum TimerSlot {
    Playback,
    Scrub,
    Window,
    Level,
}

#[derive(Clone, Copy, Debug)]
enum TimerTask {
    PlaybackTick,
    ApplyScrub(usize),
    ApplyWindow(f32),
    ApplyLevel(f32),
}

/// Per-instance deadline queue. One pending task per slot; rescheduling a
/// slot replaces its previous deadline and value, which is what debouncing
/// needs. No process-global timer state.
struct TimerQueue {
    pending: Vec<(TimerSlot, Instant, TimerTask)>,
}

impl TimerQueue {
    fn new() -> Self {
        Self {
            pending: Vec::new(),
        }
    }

    fn schedule(&mut self, slot: TimerSlot, deadline: Instant, task: TimerTask) {
        self.pending.retain(|(pending_slot, _, _)| *pending_slot != slot);
        self.pending.push((slot, deadline, task));
    }

    fn cancel(&mut self, slot: TimerSlot) {
        self.pending.retain(|(pending_slot, _, _)| *pending_slot != slot);
    }

    fn clear(&mut self) {
        self.pending.clear();
    }

    fn next_deadline(&self) -> Option<Instant> {
        self.pending.iter().map(|(_, deadline, _)| *deadline).min()
    }

    fn take_due(&mut self, now: Instant) -> Vec<TimerTask> {
        let mut due: Vec<(Instant, TimerTask)> = Vec::new();
        self.pending.retain(|(_, deadline, task)| {
            if *deadline <= now {
                due.push((*deadline, *task));
                false
            } else {
                true
            }
        });
        due.sort_by_key(|(deadline, _)| *deadline);
        due.into_iter().map(|(_, task)| task).collect()
    }
}

struct Playback {
    playing: bool,
    interval: Duration,
}

/// Drives slice extraction and windowing from navigation, playback and
/// window/level events, and pushes the resulting frames to a
/// [`PresentationSurface`].
///
/// All methods run on one logical timeline; the only suspension point is the
/// volume download inside [`load`](Self::load).
pub struct ViewerController {
    config: ViewerConfig,
    surface: Option<Box<dyn PresentationSurface>>,
    volume: Option<Volume>,
    orientation: Orientation,
    slice_index: usize,
    window: WindowState,
    zoom: f32,
    playback: Playback,
    timers: TimerQueue,
}

impl ViewerController {
    pub fn new(surface: Box<dyn PresentationSurface>) -> Self {
        Self::with_config(surface, ViewerConfig::default())
    }

    pub fn with_config(surface: Box<dyn PresentationSurface>, config: ViewerConfig) -> Self {
        Self {
            playback: Playback {
                playing: false,
                interval: config.playback.initial_interval,
            },
            surface: Some(surface),
            volume: None,
            orientation: Orientation::Axial,
            slice_index: 0,
            window: WindowState::default(),
            zoom: 1.0,
            timers: TimerQueue::new(),
            config,
        }
    }

    /// Download (through the memoizing cache), decode and install a volume,
    /// then notify the surface and render the initial slice.
    ///
    /// # Errors
    ///
    /// Returns [`LoadError`] on transfer or format failure; a retry simply
    /// calls `load` again, since a failed transfer already cleared its memo.
    pub async fn load(
        &mut self,
        cache: &VolumeCache,
        resource_id: &str,
        progress: Option<ProgressCallback>,
    ) -> Result<(), LoadError> {
        let buffer = match progress {
            Some(on_progress) => cache.fetch_with_progress(resource_id, on_progress).await?,
            None => cache.fetch(resource_id).await?,
        };
        let volume = NiftiDecoder::decode(&buffer)?;
        self.install_volume(volume);
        Ok(())
    }

    fn install_volume(&mut self, volume: Volume) {
        let info = volume.info();
        let header = volume.header();
        // Calibrated display range wins; otherwise derive one from the data.
        self.window = if header.cal_min < header.cal_max {
            WindowState::from_bounds(header.cal_min, header.cal_max)
        } else {
            let (global_min, global_max) = volume.global_range();
            windowing::auto_level(
                volume.voxels(),
                global_min,
                global_max,
                &self.config.auto_level,
            )
        };
        self.volume = Some(volume);
        self.slice_index = self.max_slice_index() / 2;
        if let Some(surface) = self.surface.as_mut() {
            surface.volume_loaded(&info);
        }
        self.render();
    }

    pub fn orientation(&self) -> Orientation {
        self.orientation
    }

    pub fn slice_index(&self) -> usize {
        self.slice_index
    }

    pub fn window(&self) -> WindowState {
        self.window
    }

    pub fn zoom(&self) -> f32 {
        self.zoom
    }

    pub fn is_playing(&self) -> bool {
        self.playback.playing
    }

    pub fn playback_interval(&self) -> Duration {
        self.playback.interval
    }

    /// Highest valid slice index for the current orientation.
    pub fn max_slice_index(&self) -> usize {
        self.volume
            .as_ref()
            .map(|volume| volume.slice_count(self.orientation).saturating_sub(1))
            .unwrap_or(0)
    }

    /// Switch viewing plane. The slice index from the previous orientation
    /// is meaningless in the new one, so the view resets to the middle.
    pub fn set_orientation(&mut self, orientation: Orientation) {
        if self.orientation == orientation {
            return;
        }
        self.orientation = orientation;
        self.slice_index = self.max_slice_index() / 2;
        self.render();
    }

    /// Jump to `index`, clamped to the valid range, and render.
    pub fn set_slice(&mut self, index: usize) {
        self.slice_index = index.min(self.max_slice_index());
        self.render();
    }

    /// Advance one slice, wrapping past the end back to slice 0.
    pub fn next_slice(&mut self) {
        let max = self.max_slice_index();
        self.slice_index = if self.slice_index >= max {
            0
        } else {
            self.slice_index + 1
        };
        self.render();
    }

    /// Step back one slice, wrapping from 0 to the last slice.
    pub fn previous_slice(&mut self) {
        let max = self.max_slice_index();
        self.slice_index = if self.slice_index == 0 {
            max
        } else {
            self.slice_index - 1
        };
        self.render();
    }

    pub fn first_slice(&mut self) {
        self.set_slice(0);
    }

    pub fn last_slice(&mut self) {
        self.set_slice(self.max_slice_index());
    }

    /// Raw slider input. Values arriving faster than the debounce window are
    /// coalesced; only the last one triggers a slice change.
    pub fn scrub_input(&mut self, index: usize, now: Instant) {
        self.timers.schedule(
            TimerSlot::Scrub,
            now + self.config.scrub_debounce,
            TimerTask::ApplyScrub(index),
        );
    }

    /// Apply a window/level pair immediately and render.
    pub fn set_window_level(&mut self, level: f32, width: f32) {
        self.window = WindowState::new(level, width);
        self.render();
    }

    /// Debounced width-slider input.
    pub fn window_input(&mut self, width: f32, now: Instant) {
        self.timers.schedule(
            TimerSlot::Window,
            now + self.config.window_level_debounce,
            TimerTask::ApplyWindow(width),
        );
    }

    /// Debounced level-slider input.
    pub fn level_input(&mut self, level: f32, now: Instant) {
        self.timers.schedule(
            TimerSlot::Level,
            now + self.config.window_level_debounce,
            TimerTask::ApplyLevel(level),
        );
    }

    /// Recompute the display window from the volume intensities.
    pub fn auto_level(&mut self) -> Option<WindowState> {
        let volume = self.volume.as_ref()?;
        let (global_min, global_max) = volume.global_range();
        let window = windowing::auto_level(
            volume.voxels(),
            global_min,
            global_max,
            &self.config.auto_level,
        );
        self.window = window;
        self.render();
        Some(window)
    }

    /// Start autoplay, or accelerate it when already playing: each repeated
    /// `play` multiplies the interval by the speed factor down to the
    /// configured minimum. Every activation steps one slice immediately.
    pub fn play(&mut self, now: Instant) {
        if self.volume.is_none() {
            return;
        }
        if self.playback.playing {
            let faster = self
                .playback
                .interval
                .mul_f32(self.config.playback.speed_factor);
            self.playback.interval = faster.max(self.config.playback.min_interval);
        } else {
            self.playback.playing = true;
        }
        self.step(now);
    }

    /// Stop autoplay and reset the interval, so the next play starts slow.
    pub fn pause(&mut self) {
        self.playback.playing = false;
        self.playback.interval = self.config.playback.initial_interval;
        self.timers.cancel(TimerSlot::Playback);
    }

    fn step(&mut self, now: Instant) {
        if !self.playback.playing {
            return;
        }
        self.next_slice();
        self.timers.schedule(
            TimerSlot::Playback,
            now + self.playback.interval,
            TimerTask::PlaybackTick,
        );
    }

    pub fn zoom_in(&mut self) {
        self.zoom *= self.config.zoom_in_factor;
    }

    pub fn zoom_out(&mut self) {
        self.zoom *= self.config.zoom_out_factor;
    }

    pub fn reset_zoom(&mut self) {
        self.zoom = 1.0;
    }

    /// Earliest pending timer deadline, if any. Lets an async driver sleep
    /// exactly as long as needed before calling
    /// [`advance_timers`](Self::advance_timers).
    pub fn next_deadline(&self) -> Option<Instant> {
        self.timers.next_deadline()
    }

    /// Fire every timer task whose deadline has passed, in deadline order.
    pub fn advance_timers(&mut self, now: Instant) {
        for task in self.timers.take_due(now) {
            match task {
                TimerTask::PlaybackTick => self.step(now),
                TimerTask::ApplyScrub(index) => self.set_slice(index),
                TimerTask::ApplyWindow(width) => {
                    self.set_window_level(self.window.level, width)
                }
                TimerTask::ApplyLevel(level) => {
                    self.set_window_level(level, self.window.width)
                }
            }
        }
    }

    /// Sleep until the next scheduled deadline and fire it. Returns `false`
    /// when no timer is pending.
    pub async fn tick(&mut self) -> bool {
        let Some(deadline) = self.next_deadline() else {
            return false;
        };
        let now = Instant::now();
        if deadline > now {
            tokio::time::sleep(deadline - now).await;
        }
        self.advance_timers(Instant::now());
        true
    }

    /// Release the volume buffer, the presentation surface and all pending
    /// timers. Skipping this on shutdown keeps the voxel data alive.
    pub fn teardown(&mut self) {
        self.pause();
        self.timers.clear();
        self.volume = None;
        self.surface = None;
    }

    fn render(&mut self) {
        let Some(volume) = self.volume.as_ref() else {
            return;
        };
        // Navigation clamps before we get here; a range miss is a bug.
        let slice = match volume.extract_slice(self.orientation, self.slice_index) {
            Ok(slice) => slice,
            Err(err) => {
                error!("slice extraction failed: {err}");
                return;
            }
        };
        let rgba = windowing::to_grayscale(&slice.samples, self.window);
        let Some(image) = RgbaImage::from_raw(slice.width as u32, slice.height as u32, rgba)
        else {
            error!(
                "frame buffer does not match slice dimensions {}x{}",
                slice.width, slice.height
            );
            return;
        };
        let frame = SliceFrame {
            image,
            orientation: self.orientation,
            slice_index: self.slice_index,
        };
        if let Some(surface) = self.surface.as_mut() {
            surface.present_frame(&frame);
        }
    }
}
