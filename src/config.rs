use std::path::{Path, PathBuf};

use directories::ProjectDirs;
use serde::Deserialize;

use crate::canon::OverlaySettings;
use crate::graph::LoopSettings;
use crate::session::{PlaybackMode, SessionSettings, eternal_loop_default};

/// Application configuration loaded from TOML config file.
/// Every field has a default, so the config file is optional.
#[derive(Debug, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct AppConfig {
    /// Mode used when `simulate` has no `--mode`.
    pub mode: PlaybackMode,
    /// Seed for the jukebox walk. Unset = seeded from the clock.
    pub seed: Option<u64>,
    /// Number of parallel workers for `batch`. 0 = auto-detect (cores / 2, min 1).
    pub workers: usize,
    pub canon_advanced: bool,
    pub eternal_advanced: bool,
    pub canon_overlay: OverlaySettings,
    pub eternal_overlay: OverlaySettings,
    pub jukebox_loop: LoopSettings,
    pub eternal_loop: LoopSettings,
}

impl Default for AppConfig {
    fn default() -> Self {
        let session = SessionSettings::default();
        Self {
            mode: PlaybackMode::default(),
            seed: None,
            workers: 0,
            canon_advanced: session.canon_advanced,
            eternal_advanced: session.eternal_advanced,
            canon_overlay: session.canon_overlay,
            eternal_overlay: session.eternal_overlay,
            jukebox_loop: session.jukebox_loop,
            eternal_loop: eternal_loop_default(),
        }
    }
}

impl AppConfig {
    /// Load config from `~/.config/beatwalk/config.toml`.
    /// Returns default config if file doesn't exist.
    pub fn load() -> Self {
        match Self::config_path() {
            Some(path) if path.exists() => Self::load_from(&path),
            _ => {
                log::debug!("No config file found, using defaults");
                Self::default()
            }
        }
    }

    /// Load config from an explicit path.
    /// Logs a warning and returns defaults if the file can't be read or parsed.
    pub fn load_from(path: &Path) -> Self {
        match std::fs::read_to_string(path) {
            Ok(contents) => match toml::from_str::<AppConfig>(&contents) {
                Ok(config) => {
                    log::info!("Loaded config from {}", path.display());
                    config
                }
                Err(e) => {
                    log::warn!("Failed to parse {}: {}. Using defaults.", path.display(), e);
                    Self::default()
                }
            },
            Err(e) => {
                log::warn!("Failed to read {}: {}. Using defaults.", path.display(), e);
                Self::default()
            }
        }
    }

    /// Resolve worker count: 0 → auto-detect (cores / 2, min 1).
    pub fn resolve_workers(&self) -> usize {
        if self.workers > 0 {
            self.workers
        } else {
            let cores = std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(2);
            (cores / 2).max(1)
        }
    }

    /// Seed from config, else from the wall clock.
    pub fn resolve_seed(&self) -> u64 {
        self.seed.unwrap_or_else(|| {
            std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .map(|d| d.as_nanos() as u64)
                .unwrap_or(0)
        })
    }

    /// The tunable groups handed to a session, clamped into range.
    pub fn session_settings(&self) -> SessionSettings {
        SessionSettings {
            canon_advanced: self.canon_advanced,
            eternal_advanced: self.eternal_advanced,
            canon_overlay: self.canon_overlay.clone(),
            eternal_overlay: self.eternal_overlay.clone(),
            jukebox_loop: self.jukebox_loop.clone().sanitized(),
            eternal_loop: self.eternal_loop.clone().sanitized(),
        }
    }

    /// Get the config file path.
    pub fn config_path() -> Option<PathBuf> {
        ProjectDirs::from("", "", crate::APP_NAME)
            .map(|dirs| dirs.config_dir().join("config.toml"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::EdgeDirection;
    use std::io::Write;

    fn write_config(contents: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_defaults() {
        let config = AppConfig::default();
        assert_eq!(config.mode, PlaybackMode::Canon);
        assert_eq!(config.canon_overlay.musicality, 65);
        assert_eq!(config.eternal_overlay.musicality, 60);
        assert_eq!(config.jukebox_loop.max_sequential_beats, 36);
        assert_eq!(config.eternal_loop.max_sequential_beats, 90);
        assert_eq!(config.eternal_loop.loop_threshold, 0.76);
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let file = write_config(
            r#"
mode = "eternal"
seed = 42
eternal_advanced = true

[canon_overlay]
dwell_beats = 10

[jukebox_loop]
loop_threshold = 0.7
direction = "backward-only"
"#,
        );
        let config = AppConfig::load_from(file.path());
        assert_eq!(config.mode, PlaybackMode::Eternal);
        assert_eq!(config.seed, Some(42));
        assert!(config.eternal_advanced);
        assert!(!config.canon_advanced);
        assert_eq!(config.canon_overlay.dwell_beats, 10);
        assert_eq!(config.canon_overlay.musicality, 65);
        assert_eq!(config.jukebox_loop.loop_threshold, 0.7);
        assert_eq!(config.jukebox_loop.direction, EdgeDirection::BackwardOnly);
        assert_eq!(config.jukebox_loop.min_loop_beats, 12);
        assert_eq!(config.eternal_loop, eternal_loop_default());
    }

    #[test]
    fn test_invalid_file_falls_back() {
        let file = write_config("mode = 7\n[[[");
        assert_eq!(AppConfig::load_from(file.path()), AppConfig::default());
    }

    #[test]
    fn test_missing_file_falls_back() {
        let dir = tempfile::tempdir().unwrap();
        let config = AppConfig::load_from(&dir.path().join("absent.toml"));
        assert_eq!(config, AppConfig::default());
    }

    #[test]
    fn test_session_settings_are_sanitized() {
        let file = write_config(
            r#"
[eternal_loop]
min_loop_beats = 1
max_sequential_beats = 2
loop_threshold = 3.0
"#,
        );
        let settings = AppConfig::load_from(file.path()).session_settings();
        assert_eq!(settings.eternal_loop.min_loop_beats, 4);
        assert_eq!(settings.eternal_loop.max_sequential_beats, 6);
        assert_eq!(settings.eternal_loop.loop_threshold, 0.99);
    }

    #[test]
    fn test_resolve_workers() {
        let config = AppConfig {
            workers: 3,
            ..Default::default()
        };
        assert_eq!(config.resolve_workers(), 3);
        assert!(AppConfig::default().resolve_workers() >= 1);
        let seeded = AppConfig {
            seed: Some(9),
            ..Default::default()
        };
        assert_eq!(seeded.resolve_seed(), 9);
    }
}
