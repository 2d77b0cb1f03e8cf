//! Engine configuration

use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::{EngineError, Result};
use crate::manifest::TrackType;

/// How a manual bitrate change transitions between representations
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SwitchingMode {
    /// Let already-buffered data play out; only new segments use the new
    /// representation
    Seamless,
    /// Flush the old representation's data and re-buffer from the current
    /// position
    Direct,
}

/// Buffer goal configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BufferConfig {
    /// How many seconds of media ahead of the playback position each buffer
    /// tries to hold
    pub wanted_buffer_ahead_secs: f64,

    /// Upper bound on retained media ahead of the position, in seconds.
    /// `None` means unbounded (subject to per-type hard caps).
    pub max_buffer_ahead_secs: Option<f64>,

    /// Upper bound on retained media behind the position, in seconds.
    /// `None` means unbounded (subject to per-type hard caps).
    pub max_buffer_behind_secs: Option<f64>,

    /// Transition policy applied when a new representation is selected
    pub switching_mode: SwitchingMode,
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            wanted_buffer_ahead_secs: 30.0,
            max_buffer_ahead_secs: None,
            max_buffer_behind_secs: None,
            switching_mode: SwitchingMode::Seamless,
        }
    }
}

/// Serialized buffer queue tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Watchdog period in milliseconds. The queue re-checks the decoder
    /// buffer at this interval to recover from a lost completion event.
    pub flushing_interval_ms: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            flushing_interval_ms: 500,
        }
    }
}

/// Widening applied to parser-reported append windows, in seconds.
/// Guards against zero-width windows and frame-boundary rounding.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppendWindowSecurities {
    pub start_secs: f64,
    pub end_secs: f64,
}

impl Default for AppendWindowSecurities {
    fn default() -> Self {
        Self {
            start_secs: 0.1,
            end_secs: 0.1,
        }
    }
}

/// Segment loader retry policy
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackoffConfig {
    /// Delay before the first retry, in milliseconds
    pub initial_backoff_delay_ms: u64,

    /// Cap on the (doubling) retry delay, in milliseconds
    pub maximum_backoff_delay_ms: u64,

    /// Maximum retries for regular (server-side) failures
    pub max_retry: u32,

    /// Maximum retries while the device is offline
    pub max_retry_offline: u32,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_backoff_delay_ms: 200,
            maximum_backoff_delay_ms: 3000,
            max_retry: 4,
            max_retry_offline: 10,
        }
    }
}

/// Garbage collection hard limits
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GcConfig {
    /// Hard cap, in seconds, on retained media for text and image buffers,
    /// applied on top of whatever `BufferConfig` allows
    pub custom_type_hard_cap_secs: f64,
}

impl Default for GcConfig {
    fn default() -> Self {
        Self {
            // 5 hours: sparse tracks are cheap but not free
            custom_type_hard_cap_secs: 5.0 * 60.0 * 60.0,
        }
    }
}

impl GcConfig {
    /// Hard upper bound on buffer-ahead for the given type, if any
    pub fn hard_max_ahead(&self, ty: TrackType) -> Option<f64> {
        match ty {
            TrackType::Text | TrackType::Image => Some(self.custom_type_hard_cap_secs),
            TrackType::Audio | TrackType::Video => None,
        }
    }

    /// Hard upper bound on buffer-behind for the given type, if any
    pub fn hard_max_behind(&self, ty: TrackType) -> Option<f64> {
        match ty {
            TrackType::Text | TrackType::Image => Some(self.custom_type_hard_cap_secs),
            TrackType::Audio | TrackType::Video => None,
        }
    }
}

/// Complete engine configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub buffer: BufferConfig,
    pub queue: QueueConfig,
    pub append_window: AppendWindowSecurities,
    pub backoff: BackoffConfig,
    pub gc: GcConfig,
}

impl EngineConfig {
    /// Load configuration from a TOML file. Missing sections fall back to
    /// their defaults.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        toml::from_str(&contents).map_err(|e| EngineError::Config(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.buffer.wanted_buffer_ahead_secs, 30.0);
        assert!(config.buffer.max_buffer_ahead_secs.is_none());
        assert_eq!(config.buffer.switching_mode, SwitchingMode::Seamless);
        assert_eq!(config.queue.flushing_interval_ms, 500);
        assert_eq!(config.backoff.initial_backoff_delay_ms, 200);
    }

    #[test]
    fn test_hard_caps_only_for_custom_types() {
        let gc = GcConfig::default();
        assert!(gc.hard_max_ahead(TrackType::Video).is_none());
        assert!(gc.hard_max_behind(TrackType::Audio).is_none());
        assert_eq!(gc.hard_max_ahead(TrackType::Text), Some(18000.0));
        assert_eq!(gc.hard_max_behind(TrackType::Image), Some(18000.0));
    }

    #[test]
    fn test_from_file_partial_sections() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "[buffer]\nwanted_buffer_ahead_secs = 12.5\nmax_buffer_ahead_secs = 60.0\n\
             max_buffer_behind_secs = 30.0\nswitching_mode = \"direct\"\n"
        )
        .unwrap();
        let config = EngineConfig::from_file(file.path()).unwrap();
        assert_eq!(config.buffer.wanted_buffer_ahead_secs, 12.5);
        assert_eq!(config.buffer.switching_mode, SwitchingMode::Direct);
        // untouched sections keep their defaults
        assert_eq!(config.queue.flushing_interval_ms, 500);
        assert_eq!(config.backoff.max_retry, 4);
    }

    #[test]
    fn test_from_file_missing() {
        assert!(EngineConfig::from_file("/nonexistent/config.toml").is_err());
    }
}
