//! # NIfTI-volume library
//!
//! This crate serves a high-level API for browsing NIfTI volumes
//! slice-by-slice

//!
//! A volume is downloaded once through a memoizing, single-flight cache,
//! decoded from its NIfTI-1 byte layout (optionally gzip-compressed) into a
//! typed voxel buffer, and then sliced in the three different medical axes:
//!  - Axial
//!  - Coronal
//!  - Sagittal
//!
//!  Raw intensities are mapped to displayable grayscale through a
//!  window/level transform with a percentile-based auto-level heuristic,
//!  and a navigation controller drives orientation switching, debounced
//!  scrubbing and speed-ramping autoplay against a pluggable presentation
//!  surface. Volumes are assumed to have the following properties:
//!   - NIfTI-1 single-file layout (`n+1` magic; NIfTI-2 is rejected)
//!   - One of the uint8, int16, int32, float32 or float64 datatypes
//!   - At least three spatial dimensions (extra frames of 4-D acquisitions
//!     are ignored)
//!
//!   Contributions are highly welcome!
//!
//! # Examples
//!
//! ## Rendering the middle axial slice of a remote volume
//!
//! Download a NIfTI file once, auto-level it and save the middle axial
//! slice as a PNG.
//!
//! ```no_run
//! # use nifti_volume::enums::Orientation;
//! # use nifti_volume::volume_cache::{HttpVolumeFetcher, VolumeCache};
//! # use nifti_volume::volume_decoder::NiftiDecoder;
//! # use nifti_volume::windowing;
//! # use std::sync::Arc;
//! # async fn run() {
//! let fetcher = HttpVolumeFetcher::new("https://example.org/api/v1/file")
//!     .expect("should have built HTTP client");
//! let cache = VolumeCache::new(Arc::new(fetcher));
//! let buffer = cache
//!     .fetch("5f2d...")
//!     .await
//!     .expect("should have downloaded volume");
//! let volume = NiftiDecoder::decode(&buffer).expect("should have decoded volume");
//!
//! let (global_min, global_max) = volume.global_range();
//! let window =
//!     windowing::auto_level(volume.voxels(), global_min, global_max, &Default::default());
//! let slice = volume
//!     .extract_slice(Orientation::Axial, volume.slice_count(Orientation::Axial) / 2)
//!     .expect("middle slice is in range");
//! let pixels = windowing::to_grayscale(&slice.samples, window);
//! image::RgbaImage::from_raw(slice.width as u32, slice.height as u32, pixels)
//!     .expect("frame buffer matches slice dimensions")
//!     .save("slice.png")
//!     .expect("should have saved image");
//! # }
//! ```

pub mod config;
pub mod controller;
pub mod enums;
pub mod volume;
pub mod volume_cache;
pub mod volume_decoder;
pub mod windowing;
