//! Cross-service scenarios: queue resumability, notification dedupe,
//! forward-only tracking and index durability under concurrent readers.

use std::sync::{Arc, Mutex};

use anyhow::Result;
use async_trait::async_trait;
use tempfile::TempDir;

use torii::clients::MediaApiClient;
use torii::config::Config;
use torii::models::media::{
    AiringScheduleItem, Character, MediaItem, MediaReview, MediaSearchParams, MediaSearchResult,
    Notification, NotificationType, UpdateUserMediaListEntryParams, UserListItem,
    UserMediaListSearchParams, UserProfile,
};
use torii::models::registry::DownloadStatus;
use torii::providers::create_provider;
use torii::registry::{EpisodeStatusUpdate, IndexEntryUpdate, MediaRegistry};
use torii::services::download::DownloadService;
use torii::services::notification::NotificationService;
use torii::services::watch_history::WatchHistoryService;

fn test_config(dir: &TempDir) -> Config {
    let mut config = Config::default();
    config.registry.media_dir = dir.path().join("registry");
    config.registry.lock_timeout_secs = 5;
    config.downloads.downloads_dir = dir.path().join("downloads");
    config
}

fn registry(config: &Config) -> Arc<MediaRegistry> {
    Arc::new(MediaRegistry::new("anilist", config.registry.clone()).unwrap())
}

fn media(id: i64, english: &str, romaji: &str) -> MediaItem {
    MediaItem::with_id_and_title(id, english, romaji)
}

/// Catalog stub: authenticated, serves a fixed notification batch, records
/// every list-entry push.
struct StubCatalog {
    notifications: Vec<Notification>,
    pushes: Mutex<Vec<(i64, Option<String>)>>,
}

impl StubCatalog {
    fn new(notifications: Vec<Notification>) -> Self {
        Self {
            notifications,
            pushes: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl MediaApiClient for StubCatalog {
    async fn authenticate(&mut self, _token: &str) -> Option<UserProfile> {
        None
    }

    fn is_authenticated(&self) -> bool {
        true
    }

    async fn get_viewer_profile(&self) -> Result<Option<UserProfile>> {
        Ok(None)
    }

    async fn search_media(&self, _params: &MediaSearchParams) -> Result<Option<MediaSearchResult>> {
        Ok(None)
    }

    async fn search_media_list(
        &self,
        _params: &UserMediaListSearchParams,
    ) -> Result<Option<MediaSearchResult>> {
        Ok(None)
    }

    async fn get_media(&self, _media_id: i64) -> Result<Option<MediaItem>> {
        Ok(None)
    }

    async fn update_list_entry(&self, params: &UpdateUserMediaListEntryParams) -> bool {
        self.pushes
            .lock()
            .unwrap()
            .push((params.media_id, params.progress.clone()));
        true
    }

    async fn delete_list_entry(&self, _media_id: i64) -> bool {
        true
    }

    async fn get_recommendations_for(&self, _media_id: i64) -> Result<Vec<MediaItem>> {
        Ok(Vec::new())
    }

    async fn get_characters_of(&self, _media_id: i64) -> Result<Vec<Character>> {
        Ok(Vec::new())
    }

    async fn get_related_anime_for(&self, _media_id: i64) -> Result<Vec<MediaItem>> {
        Ok(Vec::new())
    }

    async fn get_airing_schedule_for(&self, _media_id: i64) -> Result<Vec<AiringScheduleItem>> {
        Ok(Vec::new())
    }

    async fn get_reviews_for(&self, _media_id: i64) -> Result<Vec<MediaReview>> {
        Ok(Vec::new())
    }

    async fn get_notifications(&self) -> Result<Option<Vec<Notification>>> {
        Ok(Some(self.notifications.clone()))
    }
}

fn airing_notification(media_id: i64, episode: i32) -> Notification {
    Notification {
        id: (media_id * 1000) + episode as i64,
        kind: NotificationType::Airing,
        episode: Some(episode),
        contexts: Vec::new(),
        created_at: chrono::Utc::now(),
        media: media(media_id, "Foo", "Foo"),
    }
}

#[tokio::test]
async fn queue_survives_a_crash() {
    let dir = TempDir::new().unwrap();
    let config = Arc::new(test_config(&dir));
    let reg = registry(&config);
    let provider: Arc<dyn torii::providers::AnimeProvider> =
        Arc::from(create_provider("allanime").unwrap());

    let service = Arc::new(DownloadService::new(
        Arc::clone(&config),
        Arc::clone(&reg),
        Arc::clone(&provider),
    ));
    let item = media(42, "Foo", "Foo");
    for episode in ["1", "2", "3", "4", "5"] {
        assert!(service.add_to_queue(&item, episode));
    }

    // Two rows were mid-flight when the process died.
    for episode in ["1", "2"] {
        reg.update_episode_download_status(
            42,
            episode,
            DownloadStatus::Downloading,
            EpisodeStatusUpdate::default(),
        );
    }
    drop(service);

    // Fresh process: a new service over the same registry.
    let reg2 = registry(&config);
    let service2 = Arc::new(DownloadService::new(
        Arc::clone(&config),
        Arc::clone(&reg2),
        provider,
    ));
    service2.resume_unfinished_downloads().await;

    let record = reg2.get_media_record(42).unwrap();
    for episode in ["1", "2", "3", "4", "5"] {
        assert_eq!(
            record.episode(episode).unwrap().download_status,
            DownloadStatus::Queued,
            "episode {episode} should be queued after resume"
        );
    }
}

#[tokio::test]
async fn notifications_are_not_repeated() {
    let dir = TempDir::new().unwrap();
    let config = test_config(&dir);
    let reg = registry(&config);

    // Already notified about episode 5 of media 7.
    reg.get_or_create_record(&media(7, "Foo", "Foo")).unwrap();
    reg.update_media_index_entry(
        7,
        IndexEntryUpdate {
            last_notified_episode: Some("5".into()),
            ..Default::default()
        },
    );

    let catalog: Arc<dyn MediaApiClient> = Arc::new(StubCatalog::new(vec![
        airing_notification(7, 5),
        airing_notification(7, 6),
    ]));
    let service = NotificationService::new(Arc::clone(&reg), catalog);

    // Episode 5 is old news, 6 fires exactly once.
    let shown = service.check_and_notify().await.unwrap();
    assert_eq!(shown, 1);
    assert_eq!(
        reg.get_seen_notifications().get(&7).map(String::as_str),
        Some("6")
    );

    // Immediate second poll with the same payload fires nothing.
    let shown = service.check_and_notify().await.unwrap();
    assert_eq!(shown, 0);
}

#[tokio::test]
async fn forward_only_tracking_suppresses_backwards_pushes() {
    let dir = TempDir::new().unwrap();
    let config = test_config(&dir);
    let reg = registry(&config);

    let catalog = Arc::new(StubCatalog::new(Vec::new()));
    let api: Arc<dyn MediaApiClient> = catalog.clone();
    let service = WatchHistoryService::new(&config, Arc::clone(&reg), Some(api));

    // Remote knows episode 5; local has watched 7.
    let mut item = media(11, "Foo", "Foo");
    item.user_status = Some(UserListItem {
        progress: Some(5),
        ..Default::default()
    });
    reg.get_or_create_record(&item).unwrap();
    reg.update_media_index_entry(
        11,
        IndexEntryUpdate {
            progress: Some("7".into()),
            ..Default::default()
        },
    );

    // Pushing 3 must not decrease the remote side.
    service
        .update(&item, Some("3".into()), None, None, None)
        .await;
    assert!(catalog.pushes.lock().unwrap().is_empty());
    // The local write still happened.
    assert_eq!(reg.get_media_index_entry(11).unwrap().progress, "3");

    // Pushing 8 goes through.
    service
        .update(&item, Some("8".into()), None, None, None)
        .await;
    let pushes = catalog.pushes.lock().unwrap();
    assert_eq!(pushes.len(), 1);
    assert_eq!(pushes[0], (11, Some("8".to_string())));
    drop(pushes);
    assert_eq!(reg.get_media_index_entry(11).unwrap().progress, "8");
}

#[tokio::test]
async fn index_writes_are_atomic_under_concurrent_readers() {
    let dir = TempDir::new().unwrap();
    let config = test_config(&dir);
    let reg = registry(&config);
    reg.get_or_create_record(&media(1, "Seed", "Seed")).unwrap();

    let index_path = config.registry.media_dir.join("anilist").join("registry.json");
    let stop = Arc::new(std::sync::atomic::AtomicBool::new(false));

    // Readers hammer the file while the writer churns entries. Every read
    // must parse as a complete JSON document.
    let mut readers = Vec::new();
    for _ in 0..2 {
        let path = index_path.clone();
        let stop = Arc::clone(&stop);
        readers.push(std::thread::spawn(move || {
            while !stop.load(std::sync::atomic::Ordering::Relaxed) {
                let contents = std::fs::read_to_string(&path).unwrap();
                serde_json::from_str::<serde_json::Value>(&contents)
                    .expect("reader observed a torn registry index");
            }
        }));
    }

    for i in 2..40 {
        reg.get_or_create_record(&media(i, "Foo", "Foo")).unwrap();
    }

    stop.store(true, std::sync::atomic::Ordering::Relaxed);
    for reader in readers {
        reader.join().unwrap();
    }

    let index = reg.load_index().unwrap();
    assert_eq!(index.media_count(), 39);
}

#[tokio::test]
async fn completed_episodes_with_files_satisfy_the_invariant() {
    let dir = TempDir::new().unwrap();
    let config = test_config(&dir);
    let reg = registry(&config);
    reg.get_or_create_record(&media(3, "Foo", "Foo")).unwrap();

    let file = dir.path().join("ep1.mp4");
    std::fs::write(&file, b"video").unwrap();
    reg.update_episode_download_status(
        3,
        "1",
        DownloadStatus::Completed,
        EpisodeStatusUpdate {
            file_path: Some(file.clone()),
            file_size: Some(5),
            ..Default::default()
        },
    );

    // Invariant holds while the file exists.
    let record = reg.get_media_record(3).unwrap();
    let row = record.episode("1").unwrap();
    assert_eq!(row.download_status, DownloadStatus::Completed);
    assert!(row.file_path.as_ref().unwrap().exists());

    // When the file vanishes, reconciliation downgrades the row.
    std::fs::remove_file(&file).unwrap();
    assert_eq!(reg.reconcile_missing_files(), 1);
    let record = reg.get_media_record(3).unwrap();
    assert_eq!(
        record.episode("1").unwrap().download_status,
        DownloadStatus::NotDownloaded
    );
}
