use std::time::Duration;

use crate::windowing::AutoLevelConfig;

/// Autoplay timing.
///
/// Repeated play commands multiply the current interval by `speed_factor`
/// until `min_interval` is reached; pausing restores `initial_interval`.
#[derive(Debug, Clone)]
pub struct PlaybackConfig {
    pub initial_interval: Duration,
    pub min_interval: Duration,
    pub speed_factor: f32,
}

impl Default for PlaybackConfig {
    fn default() -> Self {
        Self {
            initial_interval: Duration::from_millis(500),
            min_interval: Duration::from_millis(50),
            speed_factor: 0.5,
        }
    }
}

/// Tunable viewer behavior.
#[derive(Debug, Clone)]
pub struct ViewerConfig {
    pub playback: PlaybackConfig,
    /// Coalescing delay for slice-slider input.
    pub scrub_debounce: Duration,
    /// Coalescing delay for window and level slider input.
    pub window_level_debounce: Duration,
    pub zoom_in_factor: f32,
    pub zoom_out_factor: f32,
    pub auto_level: AutoLevelConfig,
}

impl Default for ViewerConfig {
    fn default() -> Self {
        Self {
            playback: PlaybackConfig::default(),
            scrub_debounce: Duration::from_millis(50),
            window_level_debounce: Duration::from_millis(50),
            zoom_in_factor: 1.2,
            zoom_out_factor: 0.8,
            auto_level: AutoLevelConfig::default(),
        }
    }
}
