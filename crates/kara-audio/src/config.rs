//! Engine configuration file.
//!
//! Uses RON (Rust Object Notation) so configurations stay human-readable and
//! diff cleanly. Every field has a default, so a file only needs to name what
//! it changes.

use crate::effects::{DelayTime, EffectSpec};
use kara_core::{Frames, SampleRate};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Highest configuration format version this build understands.
pub const CONFIG_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Format version for future compatibility
    pub version: u32,

    /// Preferred device sample rate (Hz); `None` takes the device default
    pub sample_rate: Option<SampleRate>,

    /// Render sub-block size (frames)
    pub block_size: Frames,

    /// Tap ring capacity, in tap blocks
    pub tap_ring_blocks: usize,

    /// Frames per persisted buffer when writing PCM
    pub tap_frames: Frames,

    /// Packets per persisted buffer when compressing
    pub packets_per_buffer: usize,

    /// Wait after an interruption ends before resuming (ms)
    pub settle_delay_ms: u64,

    /// Persistence worker poll interval (ms)
    pub worker_poll_ms: u64,

    /// Delay time used when an effect name is given without one
    pub default_delay: DelayTime,

    /// Capture monitor gain (0 keeps the microphone off the speakers)
    pub monitor_gain: f32,

    /// Effect applied when none is requested
    pub default_effect: EffectSpec,

    /// Bound of the compressed packet channel
    pub packet_queue: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            version: CONFIG_VERSION,
            sample_rate: None,
            block_size: kara_core::block_sizes::BLOCK_512,
            tap_ring_blocks: 256,
            tap_frames: 4096,
            packets_per_buffer: 8,
            settle_delay_ms: 1000,
            worker_poll_ms: 5,
            default_delay: DelayTime::default(),
            monitor_gain: 0.0,
            default_effect: EffectSpec::None,
            packet_queue: 64,
        }
    }
}

impl EngineConfig {
    pub const fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay_ms)
    }

    pub const fn worker_poll_interval(&self) -> Duration {
        Duration::from_millis(self.worker_poll_ms)
    }

    /// Save to a RON file
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), ConfigError> {
        let ron_string = ron::ser::to_string_pretty(self, ron::ser::PrettyConfig::default())
            .map_err(|e| ConfigError::SerializationFailed(e.to_string()))?;

        std::fs::write(path.as_ref(), ron_string).map_err(|e| ConfigError::IoError(e.to_string()))?;

        Ok(())
    }

    /// Load from a RON file
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let ron_string =
            std::fs::read_to_string(path.as_ref()).map_err(|e| ConfigError::IoError(e.to_string()))?;
        Self::from_ron(&ron_string)
    }

    pub fn from_ron(text: &str) -> Result<Self, ConfigError> {
        let config: Self =
            ron::from_str(text).map_err(|e| ConfigError::DeserializationFailed(e.to_string()))?;

        if config.version > CONFIG_VERSION {
            return Err(ConfigError::UnsupportedVersion(config.version));
        }
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.block_size == 0 {
            return Err(ConfigError::InvalidData("block_size must be non-zero".into()));
        }
        if self.tap_ring_blocks == 0 {
            return Err(ConfigError::InvalidData("tap_ring_blocks must be non-zero".into()));
        }
        if self.tap_frames == 0 || self.packets_per_buffer == 0 {
            return Err(ConfigError::InvalidData(
                "persisted buffers must hold at least one frame".into(),
            ));
        }
        if !(0.0..=2.0).contains(&self.monitor_gain) {
            return Err(ConfigError::InvalidData(format!(
                "monitor_gain {} outside 0..=2",
                self.monitor_gain
            )));
        }
        Ok(())
    }
}

/// Errors that can occur while loading or saving a configuration
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    IoError(String),

    #[error("Serialization failed: {0}")]
    SerializationFailed(String),

    #[error("Deserialization failed: {0}")]
    DeserializationFailed(String),

    #[error("Unsupported config version: {0}")]
    UnsupportedVersion(u32),

    #[error("Invalid config data: {0}")]
    InvalidData(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::effects::ReverbPreset;

    #[test]
    fn test_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.version, 1);
        assert_eq!(config.tap_frames, 4096);
        assert_eq!(config.packets_per_buffer, 8);
        assert_eq!(config.settle_delay(), Duration::from_secs(1));
        assert_eq!(config.monitor_gain, 0.0);
        assert!(config.default_effect.is_none());
    }

    #[test]
    fn test_save_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("kara.ron");
        let config = EngineConfig {
            settle_delay_ms: 250,
            default_effect: EffectSpec::Reverb(Some(ReverbPreset::LargeHall)),
            ..EngineConfig::default()
        };
        config.save(&path).unwrap();
        assert_eq!(EngineConfig::load(&path).unwrap(), config);
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let config = EngineConfig::from_ron("(settle_delay_ms: 10, block_size: 128)").unwrap();
        assert_eq!(config.settle_delay_ms, 10);
        assert_eq!(config.block_size, 128);
        assert_eq!(config.tap_frames, 4096);
    }

    #[test]
    fn test_rejects_newer_version_and_bad_values() {
        assert!(matches!(
            EngineConfig::from_ron("(version: 2)"),
            Err(ConfigError::UnsupportedVersion(2))
        ));
        assert!(matches!(
            EngineConfig::from_ron("(block_size: 0)"),
            Err(ConfigError::InvalidData(_))
        ));
        assert!(matches!(
            EngineConfig::from_ron("(default_delay: 3.0)"),
            Err(ConfigError::DeserializationFailed(_))
        ));
        assert!(matches!(
            EngineConfig::load("/nonexistent/kara.ron"),
            Err(ConfigError::IoError(_))
        ));
    }
}
