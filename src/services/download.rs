//! Download queue service.
//!
//! The queue has no datastore of its own: it is the set of registry episode
//! rows whose status is QUEUED, DOWNLOADING, PAUSED or FAILED. A bounded
//! worker pool drains it; rows survive process restarts and are re-submitted
//! by `resume_unfinished_downloads`.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::{Context, Result, bail};
use futures::StreamExt;
use tokio::sync::{Mutex, Semaphore};
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::downloader::{DownloadParams, Downloader};
use crate::models::media::MediaItem;
use crate::models::provider::{
    Anime, AnimeParams, EpisodeStreamsParams, SearchParams, Server, TranslationType,
};
use crate::models::registry::{DownloadStatus, MediaRecord};
use crate::providers::{AnimeProvider, resolver};
use crate::registry::{EpisodeStatusUpdate, MediaRegistry};

type JobKey = (i64, String);

pub struct DownloadService {
    config: Arc<Config>,
    registry: Arc<MediaRegistry>,
    provider: Arc<dyn AnimeProvider>,
    downloader: Arc<Downloader>,
    semaphore: Arc<Semaphore>,
    running: Arc<AtomicBool>,
    in_flight: Arc<Mutex<HashMap<JobKey, Arc<AtomicBool>>>>,
    tasks: Mutex<Vec<tokio::task::JoinHandle<()>>>,
}

impl DownloadService {
    pub fn new(
        config: Arc<Config>,
        registry: Arc<MediaRegistry>,
        provider: Arc<dyn AnimeProvider>,
    ) -> Self {
        let max = config.downloads.max_concurrent_downloads.max(1);
        Self {
            downloader: Arc::new(Downloader::new(config.downloads.clone())),
            semaphore: Arc::new(Semaphore::new(max)),
            running: Arc::new(AtomicBool::new(false)),
            in_flight: Arc::new(Mutex::new(HashMap::new())),
            tasks: Mutex::new(Vec::new()),
            config,
            registry,
            provider,
        }
    }

    /// Idempotent; brings the worker pool up.
    pub fn start(&self) {
        if !self.running.swap(true, Ordering::SeqCst) {
            info!(
                max_concurrent = self.config.downloads.max_concurrent_downloads,
                "download service started"
            );
        }
    }

    /// Drain signal: no new submissions, in-flight jobs are asked to stop
    /// and their rows parked as PAUSED.
    pub async fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        info!("download service stopping");

        for flag in self.in_flight.lock().await.values() {
            flag.store(true, Ordering::Relaxed);
        }
        let mut tasks = self.tasks.lock().await;
        for task in tasks.drain(..) {
            let _ = task.await;
        }
        info!("download service stopped");
    }

    /// Queue one episode. Returns true iff a row was (re)queued — an
    /// existing non-terminal row for the same (media, episode) is left
    /// alone.
    pub fn add_to_queue(&self, media_item: &MediaItem, episode: &str) -> bool {
        let Ok(record) = self.registry.get_or_create_record(media_item) else {
            return false;
        };

        if let Some(row) = record.episode(episode) {
            if matches!(
                row.download_status,
                DownloadStatus::Queued | DownloadStatus::Downloading | DownloadStatus::Paused
            ) {
                debug!(
                    media_id = media_item.id,
                    episode, "already queued, skipping"
                );
                return false;
            }
            if row.download_status == DownloadStatus::Completed {
                let still_there = row.file_path.as_ref().map(|p| p.exists()).unwrap_or(false);
                if still_there {
                    debug!(media_id = media_item.id, episode, "already downloaded");
                    return false;
                }
            }
        }

        let queued = self.registry.update_episode_download_status(
            media_item.id,
            episode,
            DownloadStatus::Queued,
            EpisodeStatusUpdate {
                provider_name: Some(self.provider.name().as_str().to_string()),
                ..Default::default()
            },
        );
        if queued {
            info!(media_id = media_item.id, episode, "episode queued");
        }
        queued
    }

    /// Cancel one job: the row flips to CANCELLED and, if it is mid-flight,
    /// the downloader aborts before its next chunk write.
    pub async fn cancel_job(&self, media_id: i64, episode: &str) -> bool {
        if let Some(flag) = self.in_flight.lock().await.get(&(media_id, episode.to_string())) {
            flag.store(true, Ordering::Relaxed);
        }
        let current = self
            .registry
            .get_media_record(media_id)
            .and_then(|r| r.episode(episode).map(|e| e.download_status));
        if !matches!(
            current,
            Some(DownloadStatus::Queued | DownloadStatus::Downloading | DownloadStatus::Paused)
        ) {
            return false;
        }
        self.registry.update_episode_download_status(
            media_id,
            episode,
            DownloadStatus::Cancelled,
            EpisodeStatusUpdate::default(),
        )
    }

    /// Requeue crashed DOWNLOADING rows, then submit everything QUEUED to
    /// the pool in (priority asc, created_at asc) order.
    pub async fn resume_unfinished_downloads(self: &Arc<Self>) {
        for (media_id, episode) in self
            .registry
            .get_episodes_by_download_status(DownloadStatus::Downloading)
        {
            warn!(media_id, episode = %episode, "found interrupted download, requeueing");
            self.registry.update_episode_download_status(
                media_id,
                &episode,
                DownloadStatus::Queued,
                EpisodeStatusUpdate::default(),
            );
        }

        let mut pending: Vec<(i32, chrono::DateTime<chrono::Utc>, JobKey)> = Vec::new();
        for record in self.registry.get_all_media_records() {
            for row in &record.media_episodes {
                if row.download_status == DownloadStatus::Queued {
                    pending.push((
                        row.priority,
                        row.created_at.unwrap_or_default(),
                        (record.media_item.id, row.episode_number.clone()),
                    ));
                }
            }
        }
        pending.sort_by(|a, b| (a.0, a.1).cmp(&(b.0, b.1)));

        if !pending.is_empty() {
            info!(count = pending.len(), "submitting queued downloads");
        }
        for (_, _, key) in pending {
            self.submit(key).await;
        }
    }

    /// FAILED rows that still have retry budget go back to QUEUED and are
    /// resubmitted.
    pub async fn retry_failed_downloads(self: &Arc<Self>) {
        let max_retries = self.config.downloads.max_retries;
        let mut retried = Vec::new();

        for record in self.registry.get_all_media_records() {
            for row in &record.media_episodes {
                if row.download_status == DownloadStatus::Failed
                    && row.download_attempts < max_retries
                {
                    retried.push((record.media_item.id, row.episode_number.clone()));
                }
            }
        }

        for (media_id, episode) in retried {
            info!(media_id, episode = %episode, "retrying failed download");
            self.registry.update_episode_download_status(
                media_id,
                &episode,
                DownloadStatus::Queued,
                EpisodeStatusUpdate::default(),
            );
            self.submit((media_id, episode)).await;
        }
    }

    async fn submit(self: &Arc<Self>, key: JobKey) {
        if !self.running.load(Ordering::SeqCst) {
            debug!("service not running, submission deferred");
            return;
        }

        let mut in_flight = self.in_flight.lock().await;
        if in_flight.contains_key(&key) {
            return;
        }
        let cancel = Arc::new(AtomicBool::new(false));
        in_flight.insert(key.clone(), cancel.clone());
        drop(in_flight);

        let service = Arc::clone(self);
        let task = tokio::spawn(async move {
            // The permit bounds in-flight jobs to max_concurrent_downloads
            // and is held for the whole job.
            let Ok(_permit) = service.semaphore.clone().acquire_owned().await else {
                return;
            };
            service.run_job(&key, cancel).await;
            service.in_flight.lock().await.remove(&key);
        });
        self.tasks.lock().await.push(task);
    }

    async fn run_job(&self, key: &JobKey, cancel: Arc<AtomicBool>) {
        let (media_id, episode) = key;

        // The row may have been cancelled or completed while waiting for a
        // pool slot.
        let current = self
            .registry
            .get_media_record(*media_id)
            .and_then(|r| r.episode(episode).map(|e| e.download_status));
        if current != Some(DownloadStatus::Queued) {
            return;
        }
        if cancel.load(Ordering::Relaxed) {
            return;
        }

        self.registry.update_episode_download_status(
            *media_id,
            episode,
            DownloadStatus::Downloading,
            EpisodeStatusUpdate::default(),
        );

        let record = self.registry.get_media_record(*media_id);
        let result = match record {
            Some(record) => self.download_one(&record, episode, Some(cancel.clone())).await,
            None => Err(anyhow::anyhow!("media record vanished")),
        };

        match result {
            Ok((path, size, quality, server_name, subs)) => {
                self.registry.update_episode_download_status(
                    *media_id,
                    episode,
                    DownloadStatus::Completed,
                    EpisodeStatusUpdate {
                        file_path: Some(path),
                        file_size: size,
                        quality,
                        server_name: Some(server_name),
                        subtitle_paths: Some(subs),
                        ..Default::default()
                    },
                );
                info!(media_id, episode = %episode, "download completed");
            }
            Err(err) if cancel.load(Ordering::Relaxed) => {
                // Explicit cancellation already stamped the row CANCELLED;
                // a drain-stop parks it as PAUSED instead.
                let current = self
                    .registry
                    .get_media_record(*media_id)
                    .and_then(|r| r.episode(episode).map(|e| e.download_status));
                if current != Some(DownloadStatus::Cancelled) {
                    warn!(media_id, episode = %episode, "download interrupted, pausing");
                    self.registry.update_episode_download_status(
                        *media_id,
                        episode,
                        DownloadStatus::Paused,
                        EpisodeStatusUpdate {
                            error_message: Some(err.to_string()),
                            ..Default::default()
                        },
                    );
                }
            }
            Err(err) => {
                error!(media_id, episode = %episode, error = %err, "download failed");
                // FAILED increments the attempt counter; rows with budget
                // left go straight back to QUEUED for the next retry sweep.
                self.registry.update_episode_download_status(
                    *media_id,
                    episode,
                    DownloadStatus::Failed,
                    EpisodeStatusUpdate {
                        error_message: Some(err.to_string()),
                        ..Default::default()
                    },
                );
                let attempts = self
                    .registry
                    .get_media_record(*media_id)
                    .and_then(|r| r.episode(episode).map(|e| e.download_attempts))
                    .unwrap_or(u32::MAX);
                if attempts < self.config.downloads.max_retries {
                    self.registry.update_episode_download_status(
                        *media_id,
                        episode,
                        DownloadStatus::Queued,
                        EpisodeStatusUpdate::default(),
                    );
                }
            }
        }
    }

    /// Resolve the provider entry for a catalog item: search with the
    /// preferred title, bind the best fuzzy match, fetch the full anime.
    pub async fn resolve_provider_anime(&self, media_item: &MediaItem) -> Result<Anime> {
        let query = media_item
            .title
            .romaji
            .clone()
            .or_else(|| media_item.title.english.clone())
            .context("media item has no searchable title")?;

        let results = self
            .provider
            .search(&SearchParams {
                query: query.clone(),
                translation_type: self.config.stream.translation_type,
            })
            .await?
            .context("no provider results")?;

        let titles: Vec<&str> = results.results.iter().map(|r| r.title.as_str()).collect();
        let best = resolver::resolve_best_match(self.provider.name(), titles, media_item)
            .context("resolver found no candidate")?;
        let hit = results
            .results
            .iter()
            .find(|r| r.title == best)
            .expect("resolved title comes from the result set");

        self.provider
            .get(&AnimeParams {
                id: hit.id.clone(),
                query,
            })
            .await?
            .context("provider returned no anime for resolved id")
    }

    async fn first_server(
        &self,
        anime: &Anime,
        query: &str,
        episode: &str,
    ) -> Result<Server> {
        let mut stream = self
            .provider
            .episode_streams(&EpisodeStreamsParams {
                anime_id: anime.id.clone(),
                query: query.to_string(),
                episode: episode.to_string(),
                translation_type: self.config.stream.translation_type,
                quality: Some(self.config.stream.quality),
                server: None,
                subtitles: true,
            })
            .await?
            .context("no streams found")?;

        stream.next().await.context("stream iterator was empty")
    }

    #[allow(clippy::type_complexity)]
    async fn download_one(
        &self,
        record: &MediaRecord,
        episode: &str,
        cancel: Option<Arc<AtomicBool>>,
    ) -> Result<(std::path::PathBuf, Option<u64>, Option<String>, String, Vec<std::path::PathBuf>)>
    {
        let media_item = &record.media_item;
        let anime = self.resolve_provider_anime(media_item).await?;
        let query = anime.title.clone();
        let server = self.first_server(&anime, &query, episode).await?;

        let link = server
            .best_link(self.config.stream.quality)
            .context("server carried no links")?;

        let episode_title = server
            .episode_title
            .clone()
            .unwrap_or_else(|| format!("Episode {episode}"));
        let params = DownloadParams {
            url: link.link.clone(),
            anime_title: media_item.title.preferred().to_string(),
            episode_title,
            subtitles: server.subtitles.iter().map(|s| s.url.clone()).collect(),
            headers: server.headers.clone(),
            force_unknown_ext: false,
            silent: true,
            merge: self.config.downloads.merge_subtitles,
            clean: self.config.downloads.clean_after_merge,
            prompt: false,
            progress_hooks: Vec::new(),
            cancelled: cancel,
        };

        let result = self.downloader.download(params).await;
        if !result.success {
            bail!(
                "{}",
                result
                    .error_message
                    .unwrap_or_else(|| "download failed".to_string())
            );
        }
        let path = result
            .merged_path
            .or(result.video_path)
            .context("download reported success without a file")?;
        let size = tokio::fs::metadata(&path).await.ok().map(|m| m.len());

        Ok((
            path,
            size,
            Some(link.quality.as_str().to_string()),
            server.name.clone(),
            result.subtitle_paths,
        ))
    }

    /// Foreground path used by the CLI `download` command: queue rows are
    /// stamped for visibility but the downloads run inline, in order.
    pub async fn download_episodes_sync(
        &self,
        media_item: &MediaItem,
        episodes: &[String],
    ) -> Result<usize> {
        let record = self
            .registry
            .get_or_create_record(media_item)
            .map_err(|err| anyhow::anyhow!(err.to_string()))?;

        let mut succeeded = 0;
        for episode in episodes {
            self.registry.update_episode_download_status(
                media_item.id,
                episode,
                DownloadStatus::Downloading,
                EpisodeStatusUpdate::default(),
            );
            match self.download_one(&record, episode, None).await {
                Ok((path, size, quality, server_name, subs)) => {
                    self.registry.update_episode_download_status(
                        media_item.id,
                        episode,
                        DownloadStatus::Completed,
                        EpisodeStatusUpdate {
                            file_path: Some(path),
                            file_size: size,
                            quality,
                            server_name: Some(server_name),
                            subtitle_paths: Some(subs),
                            ..Default::default()
                        },
                    );
                    succeeded += 1;
                }
                Err(err) => {
                    error!(episode = %episode, error = %err, "episode download failed");
                    self.registry.update_episode_download_status(
                        media_item.id,
                        episode,
                        DownloadStatus::Failed,
                        EpisodeStatusUpdate {
                            error_message: Some(err.to_string()),
                            ..Default::default()
                        },
                    );
                }
            }
        }
        Ok(succeeded)
    }

    pub fn clean_completed_jobs(&self, max_age_days: i64) -> usize {
        self.registry.clean_completed_jobs(max_age_days)
    }

    /// Snapshot of every non-terminal (plus FAILED) row, i.e. the queue.
    pub fn queue_snapshot(&self) -> Vec<(i64, String, DownloadStatus)> {
        let mut rows = Vec::new();
        for record in self.registry.get_all_media_records() {
            for row in &record.media_episodes {
                if matches!(
                    row.download_status,
                    DownloadStatus::Queued
                        | DownloadStatus::Downloading
                        | DownloadStatus::Paused
                        | DownloadStatus::Failed
                ) {
                    rows.push((
                        record.media_item.id,
                        row.episode_number.clone(),
                        row.download_status,
                    ));
                }
            }
        }
        rows
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RegistryConfig;
    use crate::models::provider::SearchResults;
    use crate::providers::{ProviderName, ServerStream};
    use async_trait::async_trait;
    use tempfile::TempDir;

    /// Provider stub that never finds anything, so jobs fail fast.
    struct EmptyProvider;

    #[async_trait]
    impl AnimeProvider for EmptyProvider {
        fn name(&self) -> ProviderName {
            ProviderName::AllAnime
        }
        async fn search(&self, _params: &SearchParams) -> Result<Option<SearchResults>> {
            Ok(None)
        }
        async fn get(&self, _params: &AnimeParams) -> Result<Option<Anime>> {
            Ok(None)
        }
        async fn episode_streams(
            &self,
            _params: &EpisodeStreamsParams,
        ) -> Result<Option<ServerStream>> {
            Ok(None)
        }
    }

    fn setup() -> (TempDir, Arc<DownloadService>) {
        let dir = TempDir::new().unwrap();
        let mut config = Config::default();
        config.registry.media_dir = dir.path().to_path_buf();
        config.registry.lock_timeout_secs = 5;
        config.downloads.downloads_dir = dir.path().join("downloads");
        config.downloads.max_retries = 2;
        let registry =
            Arc::new(MediaRegistry::new("anilist", config.registry.clone()).unwrap());
        let service = Arc::new(DownloadService::new(
            Arc::new(config),
            registry,
            Arc::new(EmptyProvider),
        ));
        (dir, service)
    }

    fn media(id: i64) -> MediaItem {
        MediaItem::with_id_and_title(id, "Foo", "Foo")
    }

    #[tokio::test]
    async fn add_to_queue_rejects_duplicates() {
        let (_dir, service) = setup();
        let item = media(42);

        assert!(service.add_to_queue(&item, "1"));
        assert!(!service.add_to_queue(&item, "1"));
        assert!(service.add_to_queue(&item, "2"));

        let queue = service.queue_snapshot();
        assert_eq!(queue.len(), 2);
        assert!(queue.iter().all(|(_, _, s)| *s == DownloadStatus::Queued));
    }

    #[tokio::test]
    async fn resume_requeues_crashed_downloads() {
        let (_dir, service) = setup();
        let item = media(42);
        service.add_to_queue(&item, "1");

        // Simulate a crash mid-download.
        service.registry.update_episode_download_status(
            42,
            "1",
            DownloadStatus::Downloading,
            EpisodeStatusUpdate::default(),
        );

        // Not started: submission is deferred but the row still flips back.
        service.resume_unfinished_downloads().await;
        let record = service.registry.get_media_record(42).unwrap();
        assert_eq!(
            record.episode("1").unwrap().download_status,
            DownloadStatus::Queued
        );
    }

    #[tokio::test]
    async fn failing_jobs_cycle_back_to_queued_until_budget_runs_out() {
        let (_dir, service) = setup();
        let item = media(7);
        service.add_to_queue(&item, "1");
        service.start();

        // Each sweep runs the job once; the empty provider makes it fail.
        for _ in 0..3 {
            service.resume_unfinished_downloads().await;
            let mut tasks = service.tasks.lock().await;
            for task in tasks.drain(..) {
                task.await.unwrap();
            }
        }

        let record = service.registry.get_media_record(7).unwrap();
        let row = record.episode("1").unwrap();
        // max_retries = 2: two failures exhaust the budget and the row
        // parks as FAILED.
        assert_eq!(row.download_status, DownloadStatus::Failed);
        assert_eq!(row.download_attempts, 2);
        assert!(row.last_error.is_some());

        // The retry sweep refuses rows without budget.
        service.retry_failed_downloads().await;
        let record = service.registry.get_media_record(7).unwrap();
        assert_eq!(
            record.episode("1").unwrap().download_status,
            DownloadStatus::Failed
        );
    }

    #[tokio::test]
    async fn cancel_flips_rows_to_cancelled() {
        let (_dir, service) = setup();
        let item = media(8);
        service.add_to_queue(&item, "3");

        assert!(service.cancel_job(8, "3").await);
        let record = service.registry.get_media_record(8).unwrap();
        assert_eq!(
            record.episode("3").unwrap().download_status,
            DownloadStatus::Cancelled
        );

        // Cancelling a terminal row is a no-op.
        assert!(!service.cancel_job(8, "3").await);
    }

    #[tokio::test]
    async fn stop_is_idempotent() {
        let (_dir, service) = setup();
        service.start();
        service.stop().await;
        service.stop().await;
    }
}
