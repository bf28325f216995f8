//! Playback configuration and config file paths
//!
//! `PlaybackConfig` carries every tunable of the engine. It is plain serde
//! data with defaults for every field, so a partial JSON file works.
//!
//! Path priority for the config file:
//! 1. CLI `--config FILE`
//! 2. `GRIDPLAY_CONFIG` environment variable
//! 3. Platform config dir from dirs-next (`~/.config/gridplay/gridplay.json` on Linux)

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::core::fetch::FetchPolicy;
use crate::core::player::SPEED_PRESETS;
use crate::entities::Metadata;

/// Environment override for the config file location
pub const CONFIG_ENV: &str = "GRIDPLAY_CONFIG";

/// Seconds of 1x playback the default look-ahead covers
const LOOK_AHEAD_SECONDS: f64 = 2.0;

/// Smallest automatic look-ahead, in frames
const MIN_LOOK_AHEAD: usize = 2;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PlaybackConfig {
    /// Max resident frames (None = look-ahead window at max speed + margin)
    pub capacity_frames: Option<usize>,
    /// Extra frames on top of the automatic capacity
    pub capacity_margin: usize,
    /// Frames that must be resident before playback may start
    pub initial_batch_size: usize,
    /// Base look-ahead K in frames (None = about 2 s of 1x playback)
    pub look_ahead_base_count: Option<usize>,
    pub max_retries: u32,
    pub backoff_base_ms: u64,
    pub backoff_cap_ms: u64,
    /// Upper bound on frames advanced by a single tick
    pub max_frame_skip_per_tick: usize,
    /// Per-attempt fetch timeout (0 = none)
    pub fetch_timeout_ms: u64,
    /// Resume playing after a scrub that interrupted playback
    pub resume_after_scrub: bool,
    /// Background fetches issued per tick beyond the window
    pub background_batch: usize,
    /// Worker threads (0 = 75% of CPUs)
    pub worker_threads: usize,
}

impl Default for PlaybackConfig {
    fn default() -> Self {
        Self {
            capacity_frames: None,
            capacity_margin: 8,
            initial_batch_size: 10,
            look_ahead_base_count: None,
            max_retries: 3,
            backoff_base_ms: 50,
            backoff_cap_ms: 2000,
            max_frame_skip_per_tick: 8,
            fetch_timeout_ms: 5000,
            resume_after_scrub: false,
            background_batch: 4,
            worker_threads: 0,
        }
    }
}

/// Configuration validation errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("initial_batch_size must be at least 1")]
    InitialBatch,
    #[error("max_frame_skip_per_tick must be at least 1")]
    FrameSkip,
    #[error("capacity_frames must be at least 1")]
    Capacity,
    #[error("look_ahead_base_count must be at least 1")]
    LookAhead,
    #[error("backoff_cap_ms ({cap}) is below backoff_base_ms ({base})")]
    Backoff { base: u64, cap: u64 },
}

impl PlaybackConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.initial_batch_size == 0 {
            return Err(ConfigError::InitialBatch);
        }
        if self.max_frame_skip_per_tick == 0 {
            return Err(ConfigError::FrameSkip);
        }
        if self.capacity_frames == Some(0) {
            return Err(ConfigError::Capacity);
        }
        if self.look_ahead_base_count == Some(0) {
            return Err(ConfigError::LookAhead);
        }
        if self.backoff_cap_ms < self.backoff_base_ms {
            return Err(ConfigError::Backoff {
                base: self.backoff_base_ms,
                cap: self.backoff_cap_ms,
            });
        }
        Ok(())
    }

    pub fn fetch_policy(&self) -> FetchPolicy {
        FetchPolicy {
            max_retries: self.max_retries,
            backoff_base_ms: self.backoff_base_ms,
            backoff_cap_ms: self.backoff_cap_ms,
            timeout_ms: self.fetch_timeout_ms,
        }
    }

    /// Base look-ahead K for a dataset
    pub fn look_ahead(&self, meta: &Metadata) -> usize {
        self.look_ahead_base_count.unwrap_or_else(|| {
            ((LOOK_AHEAD_SECONDS / meta.time_interval()).ceil() as usize).max(MIN_LOOK_AHEAD)
        })
    }

    /// Initial batch clamped to the dataset
    pub fn initial_batch(&self, meta: &Metadata) -> usize {
        self.initial_batch_size.min(meta.total_frames()).max(1)
    }

    /// Store capacity for a dataset.
    ///
    /// Automatic capacity fits the widest window (fastest preset) plus the
    /// margin, and never less than the initial batch.
    pub fn capacity(&self, meta: &Metadata) -> usize {
        if let Some(cap) = self.capacity_frames {
            return cap.max(1);
        }
        let max_speed = SPEED_PRESETS.iter().copied().fold(1.0, f64::max);
        let widest = (self.look_ahead(meta) as f64 * max_speed).ceil() as usize + 1;
        (widest + self.capacity_margin).max(self.initial_batch(meta))
    }

    /// Load from JSON file
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config: {}", path.display()))?;
        let config: Self = serde_json::from_str(&text)
            .with_context(|| format!("Failed to parse config: {}", path.display()))?;
        config
            .validate()
            .with_context(|| format!("Invalid config: {}", path.display()))?;
        Ok(config)
    }

    /// Save as pretty JSON, creating parent directories
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("Failed to create config directory: {}", parent.display()))?;
            }
        }
        let text = serde_json::to_string_pretty(self)?;
        std::fs::write(path, text).with_context(|| format!("Failed to write config: {}", path.display()))?;
        Ok(())
    }

    /// Load from the resolved path, falling back to defaults if none exists
    pub fn load_or_default(cli_path: Option<PathBuf>) -> Result<Self> {
        match resolve_path(cli_path) {
            Some(path) if path.exists() => {
                log::info!("Loading config: {}", path.display());
                Self::load(&path)
            }
            Some(path) => {
                log::debug!("No config at {}, using defaults", path.display());
                Ok(Self::default())
            }
            None => Ok(Self::default()),
        }
    }
}

/// Platform default config file
pub fn default_path() -> Option<PathBuf> {
    dirs_next::config_dir().map(|dir| dir.join("gridplay").join("gridplay.json"))
}

/// Config file location: CLI → ENV → platform default
pub fn resolve_path(cli_path: Option<PathBuf>) -> Option<PathBuf> {
    cli_path
        .or_else(|| std::env::var(CONFIG_ENV).ok().map(PathBuf::from))
        .or_else(default_path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entities::MeshDimensions;

    fn meta(total: usize, interval: f64) -> Metadata {
        Metadata::new(total, interval, MeshDimensions::new(8, 8), None).unwrap()
    }

    #[test]
    fn test_defaults_are_valid() {
        let config = PlaybackConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.initial_batch_size, 10);
        assert_eq!(config.max_retries, 3);
        assert!(!config.resume_after_scrub);
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = PlaybackConfig::default();
        config.max_frame_skip_per_tick = 0;
        assert_eq!(config.validate(), Err(ConfigError::FrameSkip));

        let mut config = PlaybackConfig::default();
        config.backoff_base_ms = 100;
        config.backoff_cap_ms = 10;
        assert!(matches!(config.validate(), Err(ConfigError::Backoff { .. })));

        let mut config = PlaybackConfig::default();
        config.capacity_frames = Some(0);
        assert_eq!(config.validate(), Err(ConfigError::Capacity));
    }

    #[test]
    fn test_auto_look_ahead_and_capacity() {
        let config = PlaybackConfig::default();
        // 2 s at 0.1 s per frame
        assert_eq!(config.look_ahead(&meta(100, 0.1)), 20);
        // Long intervals fall back to the minimum
        assert_eq!(config.look_ahead(&meta(5, 15.0)), 2);
        // 2 * 10x + 1 + margin 8
        assert_eq!(config.capacity(&meta(5, 15.0)), 29);

        let config = PlaybackConfig {
            capacity_frames: Some(3),
            ..Default::default()
        };
        assert_eq!(config.capacity(&meta(100, 1.0)), 3);
        assert_eq!(config.initial_batch(&meta(4, 1.0)), 4);
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config: PlaybackConfig = serde_json::from_str(r#"{"max_retries": 7}"#).unwrap();
        assert_eq!(config.max_retries, 7);
        assert_eq!(config.initial_batch_size, 10);
    }

    #[test]
    fn test_save_and_load_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("gridplay.json");
        let config = PlaybackConfig {
            resume_after_scrub: true,
            look_ahead_base_count: Some(6),
            ..Default::default()
        };
        config.save(&path).unwrap();
        assert_eq!(PlaybackConfig::load(&path).unwrap(), config);
        assert_eq!(PlaybackConfig::load_or_default(Some(path)).unwrap(), config);
    }

    #[test]
    fn test_load_rejects_invalid_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.json");
        std::fs::write(&path, r#"{"initial_batch_size": 0}"#).unwrap();
        assert!(PlaybackConfig::load(&path).is_err());
        assert_eq!(
            PlaybackConfig::load_or_default(Some(dir.path().join("missing.json"))).unwrap(),
            PlaybackConfig::default()
        );
    }
}
