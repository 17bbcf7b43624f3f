use std::sync::Arc;

use nifti_volume::enums::Orientation;
use nifti_volume::volume_cache::{HttpVolumeFetcher, VolumeCache};
use nifti_volume::volume_decoder::NiftiDecoder;
use nifti_volume::windowing;

#[tokio::main(flavor = "current_thread")]
async fn main() {
    let mut args = std::env::args().skip(1);
    let endpoint = args
        .next()
        .expect("usage: nifti-volume <download-endpoint> <resource-id>");
    let resource_id = args
        .next()
        .expect("usage: nifti-volume <download-endpoint> <resource-id>");

    let fetcher = HttpVolumeFetcher::new(endpoint).expect("should have built HTTP client");
    let cache = VolumeCache::new(Arc::new(fetcher));
    let buffer = cache
        .fetch_with_progress(
            &resource_id,
            Arc::new(|loaded, total| {
                eprintln!("{:.1} / {:.1} MB", loaded as f64 / 1e6, total as f64 / 1e6);
            }),
        )
        .await
        .expect("should have downloaded volume");

    let volume = NiftiDecoder::decode(&buffer).expect("should have decoded NIfTI volume");
    let (global_min, global_max) = volume.global_range();
    let window =
        windowing::auto_level(volume.voxels(), global_min, global_max, &Default::default());

    let index = volume.slice_count(Orientation::Axial) / 2;
    let slice = volume
        .extract_slice(Orientation::Axial, index)
        .expect("middle slice is in range");
    let pixels = windowing::to_grayscale(&slice.samples, window);
    image::RgbaImage::from_raw(slice.width as u32, slice.height as u32, pixels)
        .expect("frame buffer matches slice dimensions")
        .save("slice.png")
        .expect("should have saved slice image");
}
