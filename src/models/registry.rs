//! On-disk registry documents.
//!
//! One `registry.json` index per catalog api plus one record file per title.
//! A major-version bump in `REGISTRY_VERSION` makes older files unreadable on
//! purpose; the loader refuses rather than rewrites.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;

use super::media::{MediaItem, UserMediaListStatus};
use crate::utils::time::completion_percentage;

pub const REGISTRY_VERSION: &str = "1.0";

/// Major component of a "major.minor" version string.
pub fn major_version(version: &str) -> &str {
    version.split('.').next().unwrap_or(version)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum DownloadStatus {
    #[default]
    NotDownloaded,
    Queued,
    Downloading,
    Completed,
    Failed,
    Paused,
    Cancelled,
}

impl DownloadStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::NotDownloaded => "not_downloaded",
            Self::Queued => "queued",
            Self::Downloading => "downloading",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Paused => "paused",
            Self::Cancelled => "cancelled",
        }
    }

    /// Terminal rows are eligible for GC; non-terminal rows make up the
    /// download queue.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

/// Per-episode download record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MediaEpisode {
    pub episode_number: String,
    #[serde(default)]
    pub download_status: DownloadStatus,
    pub file_path: Option<PathBuf>,
    pub download_date: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,

    pub file_size: Option<u64>,
    pub quality: Option<String>,
    pub provider_name: Option<String>,
    pub server_name: Option<String>,
    #[serde(default)]
    pub subtitle_paths: Vec<PathBuf>,
    #[serde(default)]
    pub download_attempts: u32,
    pub last_error: Option<String>,
    #[serde(default = "default_priority")]
    pub priority: i32,
    pub created_at: Option<DateTime<Utc>>,
}

fn default_priority() -> i32 {
    5
}

impl MediaEpisode {
    pub fn new(episode_number: &str) -> Self {
        Self {
            episode_number: episode_number.to_string(),
            download_status: DownloadStatus::NotDownloaded,
            file_path: None,
            download_date: None,
            started_at: None,
            completed_at: None,
            file_size: None,
            quality: None,
            provider_name: None,
            server_name: None,
            subtitle_paths: Vec::new(),
            download_attempts: 0,
            last_error: None,
            priority: default_priority(),
            created_at: Some(Utc::now()),
        }
    }
}

/// Aggregate owned by the registry: one file per record on disk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MediaRecord {
    pub media_item: MediaItem,
    #[serde(default)]
    pub media_episodes: Vec<MediaEpisode>,
}

impl MediaRecord {
    pub fn new(media_item: MediaItem) -> Self {
        Self {
            media_item,
            media_episodes: Vec::new(),
        }
    }

    pub fn episode(&self, episode_number: &str) -> Option<&MediaEpisode> {
        self.media_episodes
            .iter()
            .find(|e| e.episode_number == episode_number)
    }

    pub fn episode_mut(&mut self, episode_number: &str) -> Option<&mut MediaEpisode> {
        self.media_episodes
            .iter_mut()
            .find(|e| e.episode_number == episode_number)
    }
}

/// Per-(media_api, media_id) user-facing state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MediaRegistryIndexEntry {
    pub media_id: i64,
    pub media_api: String,

    pub status: Option<UserMediaListStatus>,
    #[serde(default = "default_progress")]
    pub progress: String,
    /// "HH:MM:SS"
    pub last_watch_position: Option<String>,
    /// "HH:MM:SS"
    pub total_duration: Option<String>,
    pub last_watched: Option<DateTime<Utc>>,

    #[serde(default)]
    pub score: f64,
    #[serde(default)]
    pub repeat: u32,
    #[serde(default)]
    pub notes: String,

    /// Highest episode the background worker has notified about; guards
    /// against duplicate desktop notifications.
    pub last_notified_episode: Option<String>,
}

fn default_progress() -> String {
    "0".to_string()
}

impl MediaRegistryIndexEntry {
    pub fn new(media_id: i64, media_api: &str) -> Self {
        Self {
            media_id,
            media_api: media_api.to_string(),
            status: None,
            progress: default_progress(),
            last_watch_position: None,
            total_duration: None,
            last_watched: None,
            score: 0.0,
            repeat: 0,
            notes: String::new(),
            last_notified_episode: None,
        }
    }

    pub fn key(&self) -> String {
        format!("{}_{}", self.media_api, self.media_id)
    }

    /// Derived completion percentage of the last watch position.
    pub fn watch_completion_percentage(&self) -> f64 {
        match (&self.last_watch_position, &self.total_duration) {
            (Some(pos), Some(total)) => completion_percentage(pos, total),
            _ => 0.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MediaRegistryIndex {
    pub version: String,
    pub last_updated: DateTime<Utc>,
    #[serde(default)]
    pub media_index: HashMap<String, MediaRegistryIndexEntry>,
}

impl Default for MediaRegistryIndex {
    fn default() -> Self {
        Self {
            version: REGISTRY_VERSION.to_string(),
            last_updated: Utc::now(),
            media_index: HashMap::new(),
        }
    }
}

impl MediaRegistryIndex {
    pub fn media_count(&self) -> usize {
        self.media_index.len()
    }

    pub fn status_breakdown(&self) -> HashMap<String, usize> {
        let mut breakdown = HashMap::new();
        for entry in self.media_index.values() {
            let key = entry
                .status
                .map(|s| s.as_str().to_string())
                .unwrap_or_else(|| "untracked".to_string());
            *breakdown.entry(key).or_insert(0) += 1;
        }
        breakdown
    }

    pub fn api_breakdown(&self) -> HashMap<String, usize> {
        let mut breakdown = HashMap::new();
        for entry in self.media_index.values() {
            *breakdown.entry(entry.media_api.clone()).or_insert(0) += 1;
        }
        breakdown
    }
}

/// Aggregate download statistics across every record.
#[derive(Debug, Clone, Default, Serialize)]
pub struct DownloadStatistics {
    pub total_episodes: usize,
    pub downloaded: usize,
    pub failed: usize,
    pub queued: usize,
    pub downloading: usize,
    pub paused: usize,
    pub total_size_bytes: u64,
    pub by_quality: HashMap<String, usize>,
    pub by_provider: HashMap<String, usize>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn index_json_round_trips() {
        let mut index = MediaRegistryIndex::default();
        let mut entry = MediaRegistryIndexEntry::new(42, "anilist");
        entry.progress = "7.5".to_string();
        entry.status = Some(UserMediaListStatus::Watching);
        entry.last_watch_position = Some("00:12:00".to_string());
        entry.total_duration = Some("00:24:00".to_string());
        index.media_index.insert(entry.key(), entry);

        let json = serde_json::to_string_pretty(&index).unwrap();
        let back: MediaRegistryIndex = serde_json::from_str(&json).unwrap();
        assert_eq!(index, back);
    }

    #[test]
    fn completion_percentage_is_derived() {
        let mut entry = MediaRegistryIndexEntry::new(1, "anilist");
        assert_eq!(entry.watch_completion_percentage(), 0.0);
        entry.last_watch_position = Some("00:18:00".to_string());
        entry.total_duration = Some("00:24:00".to_string());
        assert_eq!(entry.watch_completion_percentage(), 75.0);
    }

    #[test]
    fn major_version_extraction() {
        assert_eq!(major_version("1.0"), "1");
        assert_eq!(major_version("2.13"), "2");
        assert_eq!(major_version("3"), "3");
    }
}
