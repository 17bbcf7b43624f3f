use crate::volume::{SampleBuffer, VoxelData};

use num_traits::AsPrimitive;
use rayon::prelude::*;

/// Linear contrast window: `level` is the center intensity, `width` the span
/// mapped onto the 0-255 display range.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WindowState {
    pub level: f32,
    pub width: f32,
}

impl WindowState {
    pub fn new(level: f32, width: f32) -> Self {
        Self { level, width }
    }

    pub fn from_bounds(min: f32, max: f32) -> Self {
        Self {
            level: (min + max) / 2.0,
            width: max - min,
        }
    }

    /// Window bounds as `(min, max)`.
    pub fn bounds(&self) -> (f32, f32) {
        (self.level - self.width / 2.0, self.level + self.width / 2.0)
    }
}

impl Default for WindowState {
    fn default() -> Self {
        WindowPreset::Default.window()
    }
}

/// Clinical window/level presets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WindowPreset {
    Default,
    Brain,
    Bone,
    Lung,
    Abdomen,
    Liver,
}

impl WindowPreset {
    pub fn window(self) -> WindowState {
        match self {
            WindowPreset::Default => WindowState::new(50.0, 400.0),
            WindowPreset::Brain => WindowState::new(40.0, 80.0),
            WindowPreset::Bone => WindowState::new(700.0, 400.0),
            WindowPreset::Lung => WindowState::new(-500.0, 1500.0),
            WindowPreset::Abdomen => WindowState::new(60.0, 360.0),
            WindowPreset::Liver => WindowState::new(80.0, 150.0),
        }
    }
}

/// Heuristic constants for [`auto_level`]. None of them is an invariant.
#[derive(Debug, Clone)]
pub struct AutoLevelConfig {
    /// Volumes at or below this voxel count use the global-range path.
    pub small_volume_threshold: usize,
    /// Upper bound on the number of sampled intensities.
    pub sample_cap: usize,
    /// Minimum finite samples required for the percentile estimate.
    pub min_samples: usize,
    pub lower_percentile: f32,
    pub upper_percentile: f32,
    /// Per-side narrowing applied to the global range on small volumes.
    pub range_margin: f32,
}

impl Default for AutoLevelConfig {
    fn default() -> Self {
        Self {
            small_volume_threshold: 1000,
            sample_cap: 4096,
            min_samples: 16,
            lower_percentile: 0.02,
            upper_percentile: 0.98,
            range_margin: 0.05,
        }
    }
}

/// Map `samples` through `window` into an RGBA8 buffer of length
/// `samples.len() * 4`. Values at or below the window minimum map to 0,
/// values at or above the maximum to 255, everything between linearly.
/// R, G and B carry the gray value; alpha is fixed at 255.
pub fn to_grayscale(samples: &SampleBuffer, window: WindowState) -> Vec<u8> {
    let (min, max) = window.bounds();
    match samples {
        SampleBuffer::UInt8(v) => map_window(v, min, max),
        SampleBuffer::Int16(v) => map_window(v, min, max),
        SampleBuffer::Int32(v) => map_window(v, min, max),
        SampleBuffer::Float32(v) => map_window(v, min, max),
        SampleBuffer::Float64(v) => map_window(v, min, max),
    }
}

fn map_window<T>(samples: &[T], min: f32, max: f32) -> Vec<u8>
where
    T: AsPrimitive<f32> + Sync,
{
    // Degenerate windows are a caller error; clamp instead of dividing by zero.
    let range = (max - min).max(f32::EPSILON);
    samples
        .par_iter()
        .flat_map_iter(|&sample| {
            let value: f32 = sample.as_();
            let gray = if value <= min {
                0
            } else if value >= max {
                255
            } else {
                ((value - min) / range * 255.0).round() as u8
            };
            [gray, gray, gray, 255]
        })
        .collect()
}

/// Compute a display window from the volume intensities.
///
/// Large volumes are sampled at a fixed stride and windowed on the 2nd/98th
/// percentile of the finite samples; small volumes use the global range
/// narrowed by a fixed margin. Both paths fall back to the global range when
/// they would produce an empty window, so the returned width is always
/// positive.
pub fn auto_level(
    voxels: &VoxelData,
    global_min: f32,
    global_max: f32,
    config: &AutoLevelConfig,
) -> WindowState {
    let (mut min, mut max) = if voxels.len() > config.small_volume_threshold {
        percentile_bounds(voxels, config).unwrap_or((global_min, global_max))
    } else {
        let range = global_max - global_min;
        (
            global_min + config.range_margin * range,
            global_max - config.range_margin * range,
        )
    };

    if min >= max {
        min = global_min;
        max = global_max;
    }
    if min >= max {
        // Constant volume; keep the window usable.
        max = min + 1.0;
    }

    WindowState::from_bounds(min, max)
}

fn percentile_bounds(voxels: &VoxelData, config: &AutoLevelConfig) -> Option<(f32, f32)> {
    let stride = (voxels.len() / config.sample_cap).max(1);
    let mut values: Vec<f32> = voxels
        .sample_values(stride)
        .into_iter()
        .filter(|v| v.is_finite())
        .collect();
    if values.len() < config.min_samples {
        return None;
    }

    values.sort_by(|a, b| a.total_cmp(b));
    let last = values.len() - 1;
    let lo = ((last as f32) * config.lower_percentile).round() as usize;
    let hi = ((last as f32) * config.upper_percentile).round() as usize;
    Some((values[lo.min(last)], values[hi.min(last)]))
}
