//! Persistent local media registry.
//!
//! The registry is the sole writer of on-disk user state and the authority
//! for "what is local". Layout per catalog api:
//!
//! ```text
//! registry/
//! └── {api}/
//!     ├── registry.json      index of per-title user state
//!     └── {media_id}.json    one MediaRecord per title
//! ```
//!
//! Every write goes to a temp file in the same directory and is renamed into
//! place under a cross-process lock file. Index reads are cached and
//! revalidated by file mtime.

pub mod export;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Mutex;
use std::time::Duration;

use anyhow::Result;
use chrono::Utc;
use tracing::{debug, error, warn};

use crate::config::RegistryConfig;
use crate::error::ToriiError;
use crate::models::media::{
    MediaItem, MediaSearchParams, MediaSearchResult, MediaSort, PageInfo, UserMediaListStatus,
};
use crate::models::registry::{
    DownloadStatistics, DownloadStatus, MediaEpisode, MediaRecord, MediaRegistryIndex,
    MediaRegistryIndexEntry, REGISTRY_VERSION, major_version,
};
use crate::utils::fs::{FileLock, atomic_write, check_file_modified};

/// Partial update for [`MediaRegistry::update_media_index_entry`]. Only the
/// populated fields are applied.
#[derive(Debug, Default, Clone)]
pub struct IndexEntryUpdate {
    pub watched: bool,
    pub media_item: Option<MediaItem>,
    pub progress: Option<String>,
    pub status: Option<UserMediaListStatus>,
    pub last_watch_position: Option<String>,
    pub total_duration: Option<String>,
    pub score: Option<f64>,
    pub repeat: Option<u32>,
    pub notes: Option<String>,
    pub last_notified_episode: Option<String>,
}

/// Partial update for [`MediaRegistry::update_episode_download_status`].
#[derive(Debug, Default, Clone)]
pub struct EpisodeStatusUpdate {
    pub file_path: Option<PathBuf>,
    pub file_size: Option<u64>,
    pub quality: Option<String>,
    pub provider_name: Option<String>,
    pub server_name: Option<String>,
    pub subtitle_paths: Option<Vec<PathBuf>>,
    pub error_message: Option<String>,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct RegistryStats {
    pub total_media: usize,
    pub by_api: HashMap<String, usize>,
    pub by_status: HashMap<String, usize>,
    pub last_updated: String,
}

struct IndexCache {
    index: Option<MediaRegistryIndex>,
    mtime: f64,
}

pub struct MediaRegistry {
    media_api: String,
    registry_dir: PathBuf,
    index_file: PathBuf,
    lock_file: PathBuf,
    config: RegistryConfig,
    cache: Mutex<IndexCache>,
}

impl MediaRegistry {
    pub fn new(media_api: &str, config: RegistryConfig) -> Result<Self> {
        let registry_dir = config.media_dir.join(media_api);
        std::fs::create_dir_all(&registry_dir)?;

        Ok(Self {
            media_api: media_api.to_string(),
            index_file: registry_dir.join("registry.json"),
            lock_file: config.media_dir.join("registry.lock"),
            registry_dir,
            config,
            cache: Mutex::new(IndexCache {
                index: None,
                mtime: 0.0,
            }),
        })
    }

    pub fn media_api(&self) -> &str {
        &self.media_api
    }

    fn key_for(&self, media_id: i64) -> String {
        format!("{}_{}", self.media_api, media_id)
    }

    fn record_path(&self, media_id: i64) -> PathBuf {
        self.registry_dir.join(format!("{media_id}.json"))
    }

    fn lock(&self) -> FileLock {
        FileLock::with_timeouts(
            self.lock_file.clone(),
            Duration::from_secs(self.config.lock_timeout_secs),
            Duration::from_secs(self.config.lock_stale_timeout_secs),
        )
    }

    /// Load (or lazily create) the index, revalidating the cache by mtime.
    /// A major-version mismatch is fatal for the operation and leaves the
    /// file untouched.
    pub fn load_index(&self) -> Result<MediaRegistryIndex, ToriiError> {
        let mut cache = self.cache.lock().expect("registry cache poisoned");

        let (mtime, modified) = check_file_modified(&self.index_file, cache.mtime);
        if !modified {
            if let Some(index) = &cache.index {
                return Ok(index.clone());
            }
        }

        let index = if self.index_file.exists() {
            let contents = std::fs::read_to_string(&self.index_file)?;
            let index: MediaRegistryIndex =
                serde_json::from_str(&contents).map_err(|source| ToriiError::MalformedDocument {
                    path: self.index_file.clone(),
                    source,
                })?;
            if major_version(&index.version) != major_version(REGISTRY_VERSION) {
                return Err(ToriiError::RegistryVersion {
                    found: index.version.clone(),
                    supported: REGISTRY_VERSION.to_string(),
                });
            }
            index
        } else {
            let index = MediaRegistryIndex::default();
            self.write_index(&index)?;
            index
        };

        cache.mtime = mtime.max(crate::utils::fs::file_mtime(&self.index_file));
        cache.index = Some(index.clone());
        debug!(entries = index.media_count(), "loaded registry index");
        Ok(index)
    }

    fn write_index(&self, index: &MediaRegistryIndex) -> Result<(), ToriiError> {
        let contents = serde_json::to_vec_pretty(index).map_err(|source| {
            ToriiError::MalformedDocument {
                path: self.index_file.clone(),
                source,
            }
        })?;
        atomic_write(&self.index_file, &contents)
            .map_err(|err| ToriiError::Config(err.to_string()))?;
        Ok(())
    }

    fn save_index(&self, mut index: MediaRegistryIndex) -> Result<(), ToriiError> {
        let _guard = self
            .lock()
            .acquire()
            .map_err(|err| ToriiError::Config(err.to_string()))?;
        index.last_updated = Utc::now();
        self.write_index(&index)?;

        let mut cache = self.cache.lock().expect("registry cache poisoned");
        cache.mtime = crate::utils::fs::file_mtime(&self.index_file);
        cache.index = Some(index);
        debug!("saved registry index");
        Ok(())
    }

    // -- index entries ------------------------------------------------------

    pub fn get_media_index_entry(&self, media_id: i64) -> Option<MediaRegistryIndexEntry> {
        match self.load_index() {
            Ok(index) => index.media_index.get(&self.key_for(media_id)).cloned(),
            Err(err) => {
                error!(media_id, error = %err, "failed to load registry index");
                None
            }
        }
    }

    /// Idempotent: a second call returns the same entry without mutating the
    /// file again.
    pub fn get_or_create_index_entry(
        &self,
        media_id: i64,
    ) -> Result<MediaRegistryIndexEntry, ToriiError> {
        if let Some(entry) = self.get_media_index_entry(media_id) {
            return Ok(entry);
        }
        let mut index = self.load_index()?;
        let entry = MediaRegistryIndexEntry::new(media_id, &self.media_api);
        index.media_index.insert(entry.key(), entry.clone());
        self.save_index(index)?;
        Ok(entry)
    }

    pub fn save_media_index_entry(&self, entry: MediaRegistryIndexEntry) -> bool {
        let mut index = match self.load_index() {
            Ok(index) => index,
            Err(err) => {
                error!(error = %err, "cannot save index entry");
                return false;
            }
        };
        index.media_index.insert(entry.key(), entry);
        match self.save_index(index) {
            Ok(()) => true,
            Err(err) => {
                error!(error = %err, "cannot save index entry");
                false
            }
        }
    }

    /// Central index mutation. Applies only the populated fields and the
    /// status state machine: progress is clamped to the episode count when a
    /// COMPLETED update carries one; an entry with no status becomes
    /// WATCHING; a COMPLETED entry being watched again becomes REPEATING.
    pub fn update_media_index_entry(&self, media_id: i64, update: IndexEntryUpdate) -> bool {
        if let Some(media_item) = &update.media_item {
            if self.get_or_create_record(media_item).is_err() {
                return false;
            }
        }

        let mut index = match self.load_index() {
            Ok(index) => index,
            Err(err) => {
                error!(media_id, error = %err, "cannot update index entry");
                return false;
            }
        };

        let key = self.key_for(media_id);
        let entry = index
            .media_index
            .entry(key)
            .or_insert_with(|| MediaRegistryIndexEntry::new(media_id, &self.media_api));

        if let Some(progress) = &update.progress {
            entry.progress = progress.clone();
        }
        if let Some(status) = update.status {
            entry.status = Some(status);
        }

        let episodes_known = update
            .media_item
            .as_ref()
            .and_then(|item| item.episodes)
            .filter(|count| *count > 0);
        if update.progress.is_some()
            && update.status == Some(UserMediaListStatus::Completed)
            && episodes_known.is_some()
        {
            entry.progress = episodes_known.unwrap_or_default().to_string();
        } else if entry.status.is_none() {
            entry.status = Some(UserMediaListStatus::Watching);
        } else if entry.status == Some(UserMediaListStatus::Completed) && update.status.is_none() {
            entry.status = Some(UserMediaListStatus::Repeating);
        }

        if let Some(position) = update.last_watch_position {
            entry.last_watch_position = Some(position);
        }
        if let Some(duration) = update.total_duration {
            entry.total_duration = Some(duration);
        }
        if let Some(score) = update.score {
            entry.score = score;
        }
        if let Some(repeat) = update.repeat {
            entry.repeat = repeat;
        }
        if let Some(notes) = update.notes {
            entry.notes = notes;
        }
        if let Some(episode) = update.last_notified_episode {
            entry.last_notified_episode = Some(episode);
        }
        if update.watched {
            entry.last_watched = Some(Utc::now());
        }

        match self.save_index(index) {
            Ok(()) => true,
            Err(err) => {
                error!(media_id, error = %err, "cannot update index entry");
                false
            }
        }
    }

    // -- records ------------------------------------------------------------

    pub fn get_media_record(&self, media_id: i64) -> Option<MediaRecord> {
        let path = self.record_path(media_id);
        if !path.exists() {
            return None;
        }
        let contents = match std::fs::read_to_string(&path) {
            Ok(contents) => contents,
            Err(err) => {
                error!(media_id, error = %err, "failed to read media record");
                return None;
            }
        };
        match serde_json::from_str(&contents) {
            Ok(record) => Some(record),
            Err(err) => {
                error!(media_id, error = %err, "malformed media record");
                None
            }
        }
    }

    pub fn save_media_record(&self, record: &MediaRecord) -> bool {
        let media_id = record.media_item.id;
        if self.get_or_create_index_entry(media_id).is_err() {
            return false;
        }

        let guard = match self.lock().acquire() {
            Ok(guard) => guard,
            Err(err) => {
                error!(media_id, error = %err, "cannot lock registry");
                return false;
            }
        };
        let contents = match serde_json::to_vec_pretty(record) {
            Ok(contents) => contents,
            Err(err) => {
                error!(media_id, error = %err, "cannot serialize media record");
                return false;
            }
        };
        let result = atomic_write(&self.record_path(media_id), &contents);
        drop(guard);

        match result {
            Ok(()) => {
                debug!(media_id, "saved media record");
                true
            }
            Err(err) => {
                error!(media_id, error = %err, "failed to write media record");
                false
            }
        }
    }

    /// Fetch the record, creating it when absent. An existing record gets its
    /// media_item replaced wholesale; episode rows are preserved.
    pub fn get_or_create_record(&self, media_item: &MediaItem) -> Result<MediaRecord, ToriiError> {
        let record = match self.get_media_record(media_item.id) {
            Some(mut record) => {
                record.media_item = media_item.clone();
                record
            }
            None => MediaRecord::new(media_item.clone()),
        };
        if !self.save_media_record(&record) {
            return Err(ToriiError::Config(format!(
                "failed to persist record for media {}",
                media_item.id
            )));
        }
        Ok(record)
    }

    pub fn get_all_media_records(&self) -> Vec<MediaRecord> {
        let entries = match std::fs::read_dir(&self.registry_dir) {
            Ok(entries) => entries,
            Err(err) => {
                error!(error = %err, "cannot list registry dir");
                return Vec::new();
            }
        };

        let mut records = Vec::new();
        for entry in entries.flatten() {
            let path = entry.path();
            if !path.is_file() {
                warn!(path = %path.display(), "registry dir is impure; ignoring");
                continue;
            }
            let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            if stem == "registry" {
                continue;
            }
            if let Ok(media_id) = stem.parse::<i64>() {
                if let Some(record) = self.get_media_record(media_id) {
                    records.push(record);
                }
            }
        }
        records
    }

    pub fn remove_media_record(&self, media_id: i64) -> bool {
        {
            let guard = match self.lock().acquire() {
                Ok(guard) => guard,
                Err(err) => {
                    error!(media_id, error = %err, "cannot lock registry");
                    return false;
                }
            };
            let path = self.record_path(media_id);
            if path.exists() {
                if let Err(err) = std::fs::remove_file(&path) {
                    error!(media_id, error = %err, "failed to delete media record");
                    drop(guard);
                    return false;
                }
            }
        }

        let mut index = match self.load_index() {
            Ok(index) => index,
            Err(err) => {
                error!(media_id, error = %err, "cannot update index after removal");
                return false;
            }
        };
        if index.media_index.remove(&self.key_for(media_id)).is_some() {
            if let Err(err) = self.save_index(index) {
                error!(media_id, error = %err, "cannot save index after removal");
                return false;
            }
            debug!(media_id, "removed media record");
        }
        true
    }

    // -- download state ------------------------------------------------------

    /// Upsert the episode row for (media, episode) and stamp status-driven
    /// metadata. FAILED always increments the attempt counter; COMPLETED
    /// without a file path is tolerated with a warning.
    pub fn update_episode_download_status(
        &self,
        media_id: i64,
        episode_number: &str,
        status: DownloadStatus,
        update: EpisodeStatusUpdate,
    ) -> bool {
        let Some(mut record) = self.get_media_record(media_id) else {
            error!(media_id, "no media record for episode status update");
            return false;
        };

        if record.episode(episode_number).is_none() {
            record
                .media_episodes
                .push(MediaEpisode::new(episode_number));
        }
        let episode = record
            .episode_mut(episode_number)
            .expect("row upserted above");

        episode.download_status = status;
        match status {
            DownloadStatus::Downloading => episode.started_at = Some(Utc::now()),
            DownloadStatus::Completed => {
                episode.completed_at = Some(Utc::now());
                episode.download_date = Some(Utc::now());
            }
            DownloadStatus::Failed => episode.download_attempts += 1,
            _ => {}
        }

        if let Some(path) = update.file_path {
            episode.file_path = Some(path);
        } else if status == DownloadStatus::Completed && episode.file_path.is_none() {
            warn!(
                media_id,
                episode_number, "completed status set without file_path"
            );
        }
        if let Some(size) = update.file_size {
            episode.file_size = Some(size);
        }
        if let Some(quality) = update.quality {
            episode.quality = Some(quality);
        }
        if let Some(provider) = update.provider_name {
            episode.provider_name = Some(provider);
        }
        if let Some(server) = update.server_name {
            episode.server_name = Some(server);
        }
        if let Some(subs) = update.subtitle_paths {
            episode.subtitle_paths = subs;
        }
        if let Some(message) = update.error_message {
            episode.last_error = Some(message);
        }

        self.save_media_record(&record)
    }

    pub fn get_episodes_by_download_status(&self, status: DownloadStatus) -> Vec<(i64, String)> {
        let mut episodes = Vec::new();
        for record in self.get_all_media_records() {
            for episode in &record.media_episodes {
                if episode.download_status == status {
                    episodes.push((record.media_item.id, episode.episode_number.clone()));
                }
            }
        }
        episodes
    }

    pub fn get_download_statistics(&self) -> DownloadStatistics {
        let mut stats = DownloadStatistics::default();
        for record in self.get_all_media_records() {
            for episode in &record.media_episodes {
                stats.total_episodes += 1;
                match episode.download_status {
                    DownloadStatus::Completed => stats.downloaded += 1,
                    DownloadStatus::Failed => stats.failed += 1,
                    DownloadStatus::Queued => stats.queued += 1,
                    DownloadStatus::Downloading => stats.downloading += 1,
                    DownloadStatus::Paused => stats.paused += 1,
                    _ => {}
                }
                if let Some(size) = episode.file_size {
                    stats.total_size_bytes += size;
                }
                if let Some(quality) = &episode.quality {
                    *stats.by_quality.entry(quality.clone()).or_insert(0) += 1;
                }
                if let Some(provider) = &episode.provider_name {
                    *stats.by_provider.entry(provider.clone()).or_insert(0) += 1;
                }
            }
        }
        stats
    }

    /// Remove terminal episode rows older than `max_age_days`. Returns the
    /// number of rows dropped.
    pub fn clean_completed_jobs(&self, max_age_days: i64) -> usize {
        let cutoff = Utc::now() - chrono::Duration::days(max_age_days);
        let mut removed = 0;

        for mut record in self.get_all_media_records() {
            let before = record.media_episodes.len();
            record.media_episodes.retain(|episode| {
                let done = episode.download_status.is_terminal();
                let old = episode
                    .completed_at
                    .or(episode.download_date)
                    .map(|ts| ts < cutoff)
                    .unwrap_or(false);
                !(done && old)
            });
            let dropped = before - record.media_episodes.len();
            if dropped > 0 && self.save_media_record(&record) {
                removed += dropped;
            }
        }

        if removed > 0 {
            debug!(removed, "cleaned old completed jobs");
        }
        removed
    }

    /// COMPLETED rows whose file vanished from disk are downgraded so the
    /// queue can pick them up again. Returns the downgraded count.
    pub fn reconcile_missing_files(&self) -> usize {
        let mut downgraded = 0;
        for mut record in self.get_all_media_records() {
            let mut dirty = false;
            for episode in &mut record.media_episodes {
                if episode.download_status == DownloadStatus::Completed {
                    let missing = episode
                        .file_path
                        .as_ref()
                        .map(|p| !p.exists())
                        .unwrap_or(true);
                    if missing {
                        episode.download_status = DownloadStatus::NotDownloaded;
                        episode.file_path = None;
                        dirty = true;
                        downgraded += 1;
                    }
                }
            }
            if dirty {
                self.save_media_record(&record);
            }
        }
        downgraded
    }

    // -- notifications ------------------------------------------------------

    pub fn get_seen_notifications(&self) -> HashMap<i64, String> {
        let mut seen = HashMap::new();
        if let Ok(index) = self.load_index() {
            for entry in index.media_index.values() {
                if let Some(episode) = &entry.last_notified_episode {
                    seen.insert(entry.media_id, episode.clone());
                }
            }
        }
        seen
    }

    // -- queries ------------------------------------------------------------

    pub fn get_recently_watched(&self, limit: Option<usize>) -> MediaSearchResult {
        let Ok(index) = self.load_index() else {
            return MediaSearchResult::default();
        };

        let mut entries: Vec<&MediaRegistryIndexEntry> = index.media_index.values().collect();
        entries.sort_by(|a, b| b.last_watched.cmp(&a.last_watched));

        let mut media = Vec::new();
        for entry in entries {
            if let Some(limit) = limit {
                if media.len() >= limit {
                    break;
                }
            }
            if let Some(record) = self.get_media_record(entry.media_id) {
                media.push(record.media_item);
            }
        }

        MediaSearchResult {
            page_info: PageInfo {
                total: index.media_count(),
                ..PageInfo::default()
            },
            media,
        }
    }

    pub fn get_media_by_status(&self, status: UserMediaListStatus) -> MediaSearchResult {
        let Ok(index) = self.load_index() else {
            return MediaSearchResult::default();
        };

        let mut entries: Vec<&MediaRegistryIndexEntry> = index
            .media_index
            .values()
            .filter(|entry| entry.status == Some(status))
            .collect();
        entries.sort_by(|a, b| b.last_watched.cmp(&a.last_watched));

        let media: Vec<MediaItem> = entries
            .iter()
            .filter_map(|entry| self.get_media_record(entry.media_id))
            .map(|record| record.media_item)
            .collect();

        MediaSearchResult {
            page_info: PageInfo {
                total: media.len(),
                ..PageInfo::default()
            },
            media,
        }
    }

    /// In-memory query engine over every record: text match across titles
    /// and synonyms, set containment for genres/tags/formats/statuses, range
    /// filters, on_list, sorting and pagination.
    pub fn search_for_media(&self, params: &MediaSearchParams) -> MediaSearchResult {
        let Ok(index) = self.load_index() else {
            return MediaSearchResult::default();
        };

        let all: Vec<MediaItem> = index
            .media_index
            .values()
            .filter_map(|entry| self.get_media_record(entry.media_id))
            .map(|record| record.media_item)
            .collect();

        let mut filtered: Vec<MediaItem> =
            all.into_iter().filter(|m| matches_filters(m, params)).collect();
        sort_media(&mut filtered, params, &index, &self.media_api);

        let page = params.page.unwrap_or(1).max(1);
        let per_page = params.per_page.unwrap_or(15).max(1);
        let total = filtered.len();
        let start = (page - 1) * per_page;
        let end = (start + per_page).min(total);
        let media = if start < total {
            filtered[start..end].to_vec()
        } else {
            Vec::new()
        };

        MediaSearchResult {
            page_info: PageInfo {
                total,
                current_page: page,
                has_next_page: end < total,
                per_page,
            },
            media,
        }
    }

    pub fn get_registry_stats(&self) -> RegistryStats {
        match self.load_index() {
            Ok(index) => RegistryStats {
                total_media: index.media_count(),
                by_api: index.api_breakdown(),
                by_status: index.status_breakdown(),
                last_updated: index.last_updated.to_rfc3339(),
            },
            Err(err) => {
                error!(error = %err, "failed to compute registry stats");
                RegistryStats {
                    total_media: 0,
                    by_api: HashMap::new(),
                    by_status: HashMap::new(),
                    last_updated: String::new(),
                }
            }
        }
    }
}

fn text_matches(media: &MediaItem, query: &str) -> bool {
    let query = query.to_lowercase();
    let hit = |s: &Option<String>| {
        s.as_deref()
            .map(|v| v.to_lowercase().contains(&query))
            .unwrap_or(false)
    };
    hit(&media.title.english)
        || hit(&media.title.romaji)
        || hit(&media.title.native)
        || media
            .synonyms
            .iter()
            .any(|s| s.to_lowercase().contains(&query))
}

fn matches_filters(media: &MediaItem, params: &MediaSearchParams) -> bool {
    if let Some(query) = &params.query {
        if !query.is_empty() && !text_matches(media, query) {
            return false;
        }
    }
    if let Some(status) = params.status {
        if media.status != status {
            return false;
        }
    }
    if let Some(statuses) = &params.status_in {
        if !statuses.contains(&media.status) {
            return false;
        }
    }
    if let Some(statuses) = &params.status_not_in {
        if statuses.contains(&media.status) {
            return false;
        }
    }
    if let Some(genres) = &params.genre_in {
        if !genres.iter().any(|g| media.genres.contains(g)) {
            return false;
        }
    }
    if let Some(genres) = &params.genre_not_in {
        if genres.iter().any(|g| media.genres.contains(g)) {
            return false;
        }
    }
    if let Some(tags) = &params.tag_in {
        if !tags
            .iter()
            .any(|t| media.tags.iter().any(|mt| &mt.name == t))
        {
            return false;
        }
    }
    if let Some(tags) = &params.tag_not_in {
        if tags
            .iter()
            .any(|t| media.tags.iter().any(|mt| &mt.name == t))
        {
            return false;
        }
    }
    if let Some(formats) = &params.format_in {
        match media.format {
            Some(format) if formats.contains(&format) => {}
            _ => return false,
        }
    }
    if let Some(media_type) = params.media_type {
        if media.media_type != media_type {
            return false;
        }
    }
    if let Some(min) = params.score_greater {
        if media.average_score.map(|s| s < min).unwrap_or(true) {
            return false;
        }
    }
    if let Some(max) = params.score_lesser {
        if media.average_score.map(|s| s > max).unwrap_or(true) {
            return false;
        }
    }
    if let Some(min) = params.popularity_greater {
        if media.popularity.map(|p| p < min).unwrap_or(true) {
            return false;
        }
    }
    if let Some(max) = params.popularity_lesser {
        if media.popularity.map(|p| p > max).unwrap_or(true) {
            return false;
        }
    }
    if let Some(ids) = &params.id_in {
        if !ids.contains(&media.id) {
            return false;
        }
    }
    if let Some(on_list) = params.on_list {
        if on_list != media.user_status.is_some() {
            return false;
        }
    }
    true
}

fn sort_media(
    media: &mut [MediaItem],
    params: &MediaSearchParams,
    index: &MediaRegistryIndex,
    media_api: &str,
) {
    let sort = params.sort.unwrap_or(MediaSort::Title);
    match sort {
        MediaSort::PopularityDesc | MediaSort::TrendingDesc => {
            // The registry has no trending signal; popularity stands in.
            media.sort_by(|a, b| b.popularity.unwrap_or(0).cmp(&a.popularity.unwrap_or(0)));
        }
        MediaSort::ScoreDesc => {
            media.sort_by(|a, b| {
                b.average_score
                    .unwrap_or(0.0)
                    .total_cmp(&a.average_score.unwrap_or(0.0))
            });
        }
        MediaSort::FavouritesDesc => {
            media.sort_by(|a, b| b.favourites.unwrap_or(0).cmp(&a.favourites.unwrap_or(0)));
        }
        MediaSort::UpdatedAtDesc => {
            // Most recently watched first, as tracked in the index.
            media.sort_by(|a, b| {
                let watched = |m: &MediaItem| {
                    index
                        .media_index
                        .get(&format!("{media_api}_{}", m.id))
                        .and_then(|e| e.last_watched)
                };
                watched(b).cmp(&watched(a))
            });
        }
        MediaSort::Title | MediaSort::SearchMatch => {
            media.sort_by(|a, b| {
                let key = |m: &MediaItem| {
                    m.title
                        .english
                        .clone()
                        .or_else(|| m.title.romaji.clone())
                        .unwrap_or_default()
                };
                key(a).cmp(&key(b))
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn registry() -> (TempDir, MediaRegistry) {
        let dir = TempDir::new().unwrap();
        let config = RegistryConfig {
            media_dir: dir.path().to_path_buf(),
            lock_timeout_secs: 5,
            lock_stale_timeout_secs: 60,
        };
        let registry = MediaRegistry::new("anilist", config).unwrap();
        (dir, registry)
    }

    fn item(id: i64, english: &str, romaji: &str) -> MediaItem {
        MediaItem::with_id_and_title(id, english, romaji)
    }

    #[test]
    fn get_or_create_index_entry_is_idempotent() {
        let (_dir, registry) = registry();
        let first = registry.get_or_create_index_entry(7).unwrap();
        let mtime_after_first = crate::utils::fs::file_mtime(&registry.index_file);
        let second = registry.get_or_create_index_entry(7).unwrap();
        assert_eq!(first, second);
        assert_eq!(
            crate::utils::fs::file_mtime(&registry.index_file),
            mtime_after_first
        );
    }

    #[test]
    fn record_round_trips_deeply() {
        let (_dir, registry) = registry();
        let mut record = MediaRecord::new(item(1001, "Foo", "Foo"));
        record.media_episodes.push(MediaEpisode::new("7.5"));
        assert!(registry.save_media_record(&record));

        let loaded = registry.get_media_record(1001).unwrap();
        assert_eq!(loaded, record);
    }

    #[test]
    fn get_or_create_record_replaces_item_but_keeps_episodes() {
        let (_dir, registry) = registry();
        let mut record = MediaRecord::new(item(5, "Old Title", "Old"));
        record.media_episodes.push(MediaEpisode::new("1"));
        registry.save_media_record(&record);

        let updated = registry
            .get_or_create_record(&item(5, "New Title", "New"))
            .unwrap();
        assert_eq!(updated.media_item.title.english.as_deref(), Some("New Title"));
        assert_eq!(updated.media_episodes.len(), 1);
    }

    #[test]
    fn status_state_machine() {
        let (_dir, registry) = registry();
        registry.get_or_create_record(&item(9, "Foo", "Foo")).unwrap();

        // No status yet: becomes WATCHING.
        registry.update_media_index_entry(
            9,
            IndexEntryUpdate {
                progress: Some("3".into()),
                ..Default::default()
            },
        );
        let entry = registry.get_media_index_entry(9).unwrap();
        assert_eq!(entry.status, Some(UserMediaListStatus::Watching));
        assert_eq!(entry.progress, "3");

        // COMPLETED entry watched again: promoted to REPEATING.
        let mut entry = entry;
        entry.status = Some(UserMediaListStatus::Completed);
        registry.save_media_index_entry(entry);
        registry.update_media_index_entry(
            9,
            IndexEntryUpdate {
                progress: Some("1".into()),
                watched: true,
                ..Default::default()
            },
        );
        let entry = registry.get_media_index_entry(9).unwrap();
        assert_eq!(entry.status, Some(UserMediaListStatus::Repeating));
        assert!(entry.last_watched.is_some());
    }

    #[test]
    fn completed_update_clamps_progress_to_episode_count() {
        let (_dir, registry) = registry();
        let mut media = item(12, "Foo", "Foo");
        media.episodes = Some(24);

        registry.update_media_index_entry(
            12,
            IndexEntryUpdate {
                media_item: Some(media),
                progress: Some("999".into()),
                status: Some(UserMediaListStatus::Completed),
                ..Default::default()
            },
        );
        let entry = registry.get_media_index_entry(12).unwrap();
        assert_eq!(entry.progress, "24");
        assert_eq!(entry.status, Some(UserMediaListStatus::Completed));
    }

    #[test]
    fn failed_download_increments_attempts() {
        let (_dir, registry) = registry();
        registry.get_or_create_record(&item(42, "Foo", "Foo")).unwrap();

        registry.update_episode_download_status(
            42,
            "1",
            DownloadStatus::Queued,
            EpisodeStatusUpdate::default(),
        );
        registry.update_episode_download_status(
            42,
            "1",
            DownloadStatus::Failed,
            EpisodeStatusUpdate {
                error_message: Some("boom".into()),
                ..Default::default()
            },
        );
        registry.update_episode_download_status(
            42,
            "1",
            DownloadStatus::Queued,
            EpisodeStatusUpdate::default(),
        );
        registry.update_episode_download_status(
            42,
            "1",
            DownloadStatus::Failed,
            EpisodeStatusUpdate::default(),
        );

        let record = registry.get_media_record(42).unwrap();
        let episode = record.episode("1").unwrap();
        assert_eq!(episode.download_attempts, 2);
        assert_eq!(episode.last_error.as_deref(), Some("boom"));
    }

    #[test]
    fn version_mismatch_is_fatal_and_preserves_file() {
        let (_dir, registry) = registry();
        let doc = r#"{"version": "99.0", "last_updated": "2024-01-01T00:00:00Z", "media_index": {}}"#;
        std::fs::write(&registry.index_file, doc).unwrap();

        let err = registry.load_index().unwrap_err();
        assert!(matches!(err, ToriiError::RegistryVersion { .. }));
        assert_eq!(std::fs::read_to_string(&registry.index_file).unwrap(), doc);

        // Mutations refuse too.
        assert!(!registry.update_media_index_entry(1, IndexEntryUpdate::default()));
    }

    #[test]
    fn search_with_no_filters_sorts_by_title() {
        let (_dir, registry) = registry();
        for (id, english) in [(1, "Zeta"), (2, "Alpha"), (3, "Midway")] {
            registry
                .get_or_create_record(&item(id, english, english))
                .unwrap();
        }

        let result = registry.search_for_media(&MediaSearchParams {
            sort: Some(MediaSort::Title),
            ..Default::default()
        });
        let titles: Vec<&str> = result
            .media
            .iter()
            .map(|m| m.title.english.as_deref().unwrap())
            .collect();
        assert_eq!(titles, vec!["Alpha", "Midway", "Zeta"]);
        assert_eq!(result.page_info.total, 3);
    }

    #[test]
    fn search_text_matches_synonyms() {
        let (_dir, registry) = registry();
        let mut media = item(77, "Frieren: Beyond Journey's End", "Sousou no Frieren");
        media.synonyms.push("Frieren at the Funeral".to_string());
        registry.get_or_create_record(&media).unwrap();

        let result = registry.search_for_media(&MediaSearchParams {
            query: Some("funeral".into()),
            ..Default::default()
        });
        assert_eq!(result.media.len(), 1);

        let miss = registry.search_for_media(&MediaSearchParams {
            query: Some("bleach".into()),
            ..Default::default()
        });
        assert!(miss.media.is_empty());
    }

    #[test]
    fn clean_completed_jobs_on_clean_registry_is_noop() {
        let (_dir, registry) = registry();
        registry.get_or_create_record(&item(1, "Foo", "Foo")).unwrap();
        assert_eq!(registry.clean_completed_jobs(i64::MAX / 2), 0);
    }

    #[test]
    fn seen_notifications_reflect_index() {
        let (_dir, registry) = registry();
        registry.get_or_create_record(&item(7, "Foo", "Foo")).unwrap();
        registry.update_media_index_entry(
            7,
            IndexEntryUpdate {
                last_notified_episode: Some("5".into()),
                ..Default::default()
            },
        );

        let seen = registry.get_seen_notifications();
        assert_eq!(seen.get(&7).map(String::as_str), Some("5"));
    }

    #[test]
    fn remove_media_record_deletes_file_and_entry() {
        let (_dir, registry) = registry();
        registry.get_or_create_record(&item(3, "Foo", "Foo")).unwrap();
        assert!(registry.record_path(3).exists());

        assert!(registry.remove_media_record(3));
        assert!(!registry.record_path(3).exists());
        assert!(registry.get_media_index_entry(3).is_none());
    }
}
