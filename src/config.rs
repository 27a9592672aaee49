use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::info;

use crate::constants;
use crate::models::provider::{StreamQuality, TranslationType};

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub general: GeneralConfig,

    pub stream: StreamConfig,

    pub registry: RegistryConfig,

    pub downloads: DownloadsConfig,

    pub worker: WorkerConfig,

    pub sessions: SessionsConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    /// Catalog backend tag: "anilist" or "jikan".
    pub media_api: String,

    /// Default provider tag.
    pub provider: String,

    /// Which side wins when local and remote progress disagree.
    pub preferred_tracker: PreferredTracker,

    pub log_level: String,

    /// Decorate user-facing messages with icons.
    pub icons: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum PreferredTracker {
    #[default]
    Local,
    Remote,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            media_api: "anilist".to_string(),
            provider: "allanime".to_string(),
            preferred_tracker: PreferredTracker::Local,
            log_level: "info".to_string(),
            icons: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamConfig {
    /// Player backend: "mpv", "vlc" or "syncplay".
    pub player: String,

    pub quality: StreamQuality,

    pub translation_type: TranslationType,

    /// Preferred server name; empty means "first offered".
    pub server: String,

    pub auto_next: bool,

    /// Percent watched at which an episode counts as complete.
    pub episode_complete_at: f64,

    pub use_ipc: bool,

    /// Seconds to wait for the mpv IPC socket before falling back.
    pub ipc_connect_timeout_secs: u64,

    /// Seconds to wait for a single IPC command response.
    pub ipc_command_timeout_secs: u64,

    /// Refuse remote progress updates that would move backwards.
    pub force_forward_tracking: bool,

    /// Extra args appended to the player command line, comma separated.
    pub player_args: String,

    /// Args prepended before the player executable, comma separated.
    pub pre_args: String,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            player: "mpv".to_string(),
            quality: StreamQuality::Q1080,
            translation_type: TranslationType::Sub,
            server: String::new(),
            auto_next: false,
            episode_complete_at: 80.0,
            use_ipc: false,
            ipc_connect_timeout_secs: 5,
            ipc_command_timeout_secs: 5,
            force_forward_tracking: true,
            player_args: String::new(),
            pre_args: String::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    /// Root of the registry tree; defaults to the app data dir.
    pub media_dir: PathBuf,

    /// Seconds a writer waits for the registry lock.
    pub lock_timeout_secs: u64,

    /// Seconds after which a foreign lock is considered stale.
    pub lock_stale_timeout_secs: u64,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            media_dir: constants::registry_dir(),
            lock_timeout_secs: 300,
            lock_stale_timeout_secs: 300,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DownloadsConfig {
    pub downloads_dir: PathBuf,

    pub max_concurrent_downloads: usize,

    /// Attempts before a job is parked as FAILED.
    pub max_retries: u32,

    /// Merge downloaded subtitles into an mkv with ffmpeg.
    pub merge_subtitles: bool,

    /// Delete the separate video/subtitle files after a successful merge.
    pub clean_after_merge: bool,

    /// Use underscore-only filename sanitization.
    pub restricted_filenames: bool,

    pub no_check_certificate: bool,

    pub force_ffmpeg: bool,

    pub hls_use_mpegts: bool,

    pub hls_use_h264: bool,

    /// Days a terminal queue row lives before `clean` removes it.
    pub completed_job_max_age_days: i64,
}

impl Default for DownloadsConfig {
    fn default() -> Self {
        Self {
            downloads_dir: constants::default_downloads_dir(),
            max_concurrent_downloads: 3,
            max_retries: 3,
            merge_subtitles: false,
            clean_after_merge: false,
            restricted_filenames: false,
            no_check_certificate: false,
            force_ffmpeg: false,
            hls_use_mpegts: false,
            hls_use_h264: false,
            completed_job_max_age_days: 7,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Minutes between catalog notification polls (minimum 1).
    pub notification_check_interval: u64,

    /// Minutes between download-queue resume sweeps.
    pub download_check_interval: u64,

    /// Minutes between failed-download retry sweeps.
    pub download_check_failed_interval: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            notification_check_interval: 15,
            download_check_interval: 5,
            download_check_failed_interval: 30,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionsConfig {
    pub dir: PathBuf,
}

impl Default for SessionsConfig {
    fn default() -> Self {
        Self {
            dir: constants::sessions_dir(),
        }
    }
}

impl Config {
    pub fn load() -> Result<Self> {
        for path in Self::config_paths() {
            if path.exists() {
                info!("Loading config from: {}", path.display());
                return Self::load_from_path(&path);
            }
        }

        info!("No config file found, using defaults");
        Ok(Self::default())
    }

    pub fn load_from_path(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Self = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        Ok(config)
    }

    pub fn save_to_path(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        info!("Config saved to: {}", path.display());
        Ok(())
    }

    fn config_paths() -> Vec<PathBuf> {
        vec![
            PathBuf::from("config.toml"),
            constants::app_config_dir().join("config.toml"),
        ]
    }

    pub fn default_config_path() -> PathBuf {
        constants::app_config_dir().join("config.toml")
    }

    pub fn create_default_if_missing() -> Result<bool> {
        let path = Self::default_config_path();
        if path.exists() {
            Ok(false)
        } else {
            Self::default().save_to_path(&path)?;
            info!("Created default config file: {}", path.display());
            Ok(true)
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.downloads.max_concurrent_downloads == 0 {
            anyhow::bail!("downloads.max_concurrent_downloads must be > 0");
        }
        if !(0.0..=100.0).contains(&self.stream.episode_complete_at) {
            anyhow::bail!("stream.episode_complete_at must be a percentage (0-100)");
        }
        if self.worker.notification_check_interval == 0 {
            anyhow::bail!("worker.notification_check_interval must be at least 1 minute");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        Config::default().validate().unwrap();
    }

    #[test]
    fn toml_round_trip_keeps_sections() {
        let config = Config::default();
        let text = toml::to_string_pretty(&config).unwrap();
        let back: Config = toml::from_str(&text).unwrap();
        assert_eq!(back.general.media_api, "anilist");
        assert_eq!(back.downloads.max_concurrent_downloads, 3);
        assert_eq!(back.stream.episode_complete_at, 80.0);
    }

    #[test]
    fn partial_config_fills_defaults() {
        let config: Config = toml::from_str("[stream]\nuse_ipc = true\n").unwrap();
        assert!(config.stream.use_ipc);
        assert_eq!(config.general.provider, "allanime");
    }
}
