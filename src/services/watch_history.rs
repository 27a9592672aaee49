//! Watch-history tracking.
//!
//! Reconciles local registry progress with the remote catalog under a
//! configurable precedence, pushes remote updates only past the completion
//! threshold, and optionally refuses remote pushes that would move progress
//! backwards.

use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::clients::MediaApiClient;
use crate::config::{Config, PreferredTracker};
use crate::models::media::{
    MediaItem, UpdateUserMediaListEntryParams, UserMediaListStatus,
};
use crate::models::player::PlayerResult;
use crate::registry::{IndexEntryUpdate, MediaRegistry};
use crate::utils::time::completion_percentage;

pub struct WatchHistoryService {
    registry: Arc<MediaRegistry>,
    api: Option<Arc<dyn MediaApiClient>>,
    episode_complete_at: f64,
    preferred_tracker: PreferredTracker,
    force_forward_tracking: bool,
}

impl WatchHistoryService {
    pub fn new(
        config: &Config,
        registry: Arc<MediaRegistry>,
        api: Option<Arc<dyn MediaApiClient>>,
    ) -> Self {
        Self {
            registry,
            api,
            episode_complete_at: config.stream.episode_complete_at,
            preferred_tracker: config.general.preferred_tracker,
            force_forward_tracking: config.stream.force_forward_tracking,
        }
    }

    /// A push that would decrease remote progress is suppressed when
    /// forward-only tracking is on. Comparison is numeric when both sides
    /// parse.
    fn forward_guard(&self, media_item: &MediaItem, new_progress: &str) -> bool {
        if !self.force_forward_tracking {
            return true;
        }
        let remote = media_item
            .user_status
            .as_ref()
            .and_then(|u| u.progress)
            .unwrap_or(0) as f64;
        match new_progress.parse::<f64>() {
            Ok(new) if new < remote => {
                info!(
                    media_id = media_item.id,
                    new_progress, remote, "suppressing backwards remote progress push"
                );
                false
            }
            _ => true,
        }
    }

    /// Record a finished playback. The local write always happens; the
    /// remote push only when the episode crossed the completion threshold
    /// and the catalog is authenticated.
    pub async fn track(&self, media_item: &MediaItem, player_result: &PlayerResult) {
        info!(
            media_id = media_item.id,
            episode = %player_result.episode,
            stop_time = ?player_result.stop_time,
            total_time = ?player_result.total_time,
            "updating watch history"
        );

        let status = media_item
            .user_status
            .as_ref()
            .and_then(|u| u.status)
            .filter(|s| *s == UserMediaListStatus::Completed)
            .map(|_| UserMediaListStatus::Repeating);

        self.registry.update_media_index_entry(
            media_item.id,
            IndexEntryUpdate {
                watched: true,
                media_item: Some(media_item.clone()),
                progress: Some(player_result.episode.clone()),
                status,
                last_watch_position: player_result.stop_time.clone(),
                total_duration: player_result.total_time.clone(),
                ..Default::default()
            },
        );

        if let (Some(stop), Some(total)) = (&player_result.stop_time, &player_result.total_time) {
            let completion = completion_percentage(stop, total);
            if completion < self.episode_complete_at {
                debug!(
                    completion,
                    threshold = self.episode_complete_at,
                    "below completion threshold, keeping local only"
                );
                return;
            }
        }

        let Some(api) = &self.api else {
            warn!("no catalog client, remote progress not updated");
            return;
        };
        if !api.is_authenticated() {
            warn!("not logged in, remote progress not updated");
            return;
        }
        if !self.forward_guard(media_item, &player_result.episode) {
            return;
        }

        let accepted = api
            .update_list_entry(&UpdateUserMediaListEntryParams {
                media_id: media_item.id,
                status,
                progress: Some(player_result.episode.clone()),
                score: None,
            })
            .await;
        if accepted {
            info!(media_id = media_item.id, episode = %player_result.episode, "remote progress updated");
        } else {
            warn!(media_id = media_item.id, "failed to update remote progress");
        }
    }

    /// Decide which episode to play next and from where.
    ///
    /// Local and remote progress are reconciled under `preferred_tracker`;
    /// a mostly-finished episode bumps the local side forward and discards
    /// the resume offset. "0" or unknown coerces to "1".
    pub fn get_episode(&self, media_item: &MediaItem) -> (String, Option<String>) {
        let remote = media_item
            .user_status
            .as_ref()
            .and_then(|u| u.progress)
            .map(|p| p.to_string());

        let entry = self.registry.get_media_index_entry(media_item.id);
        let mut start_time = None;
        let local = match &entry {
            Some(entry) => {
                start_time = entry.last_watch_position.clone();
                let mut local = Some(entry.progress.clone());
                if let (Some(position), Some(total)) =
                    (&entry.last_watch_position, &entry.total_duration)
                {
                    if completion_percentage(position, total) >= self.episode_complete_at {
                        start_time = None;
                        if let Ok(n) = entry.progress.parse::<i64>() {
                            local = Some((n + 1).to_string());
                        }
                    }
                }
                local
            }
            None => remote.clone(),
        };

        let remote = remote.or_else(|| local.clone());

        let episode = if local != remote {
            match self.preferred_tracker {
                PreferredTracker::Local => local,
                PreferredTracker::Remote => remote,
            }
        } else {
            local
        };

        let episode = match episode.as_deref() {
            None | Some("0") | Some("") => "1".to_string(),
            Some(other) => other.to_string(),
        };
        (episode, start_time)
    }

    /// Update list state locally and remotely in one step.
    pub async fn update(
        &self,
        media_item: &MediaItem,
        progress: Option<String>,
        status: Option<UserMediaListStatus>,
        score: Option<f64>,
        notes: Option<String>,
    ) {
        self.registry.update_media_index_entry(
            media_item.id,
            IndexEntryUpdate {
                media_item: Some(media_item.clone()),
                progress: progress.clone(),
                status,
                score,
                notes,
                ..Default::default()
            },
        );

        let Some(api) = &self.api else {
            warn!("not logged in, remote list not updated");
            return;
        };
        if !api.is_authenticated() {
            warn!("not logged in, remote list not updated");
            return;
        }
        if let Some(progress) = &progress {
            if !self.forward_guard(media_item, progress) {
                return;
            }
        }
        api.update_list_entry(&UpdateUserMediaListEntryParams {
            media_id: media_item.id,
            status,
            progress,
            score,
        })
        .await;
    }

    /// Items the user streams but never tracked land on the PLANNING list.
    pub async fn add_media_to_list_if_not_present(&self, media_item: &MediaItem) {
        let Some(api) = &self.api else { return };
        if !api.is_authenticated() {
            return;
        }
        if media_item.user_status.is_none() {
            info!(
                media_id = media_item.id,
                title = media_item.title.preferred(),
                "not on list, adding as planning"
            );
            self.update(media_item, None, Some(UserMediaListStatus::Planning), None, None)
                .await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RegistryConfig;
    use crate::models::media::UserListItem;
    use tempfile::TempDir;

    fn setup(preferred: PreferredTracker) -> (TempDir, WatchHistoryService) {
        let dir = TempDir::new().unwrap();
        let registry = Arc::new(
            MediaRegistry::new(
                "anilist",
                RegistryConfig {
                    media_dir: dir.path().to_path_buf(),
                    lock_timeout_secs: 5,
                    lock_stale_timeout_secs: 60,
                },
            )
            .unwrap(),
        );
        let mut config = Config::default();
        config.general.preferred_tracker = preferred;
        let service = WatchHistoryService::new(&config, registry, None);
        (dir, service)
    }

    fn media(id: i64) -> MediaItem {
        MediaItem::with_id_and_title(id, "Foo", "Foo")
    }

    #[test]
    fn zero_progress_coerces_to_one() {
        let (_dir, service) = setup(PreferredTracker::Local);
        let (episode, start) = service.get_episode(&media(1));
        assert_eq!(episode, "1");
        assert!(start.is_none());
    }

    #[test]
    fn finished_episode_bumps_local_and_drops_resume() {
        let (_dir, service) = setup(PreferredTracker::Local);
        let item = media(2);
        service.registry.get_or_create_record(&item).unwrap();
        service.registry.update_media_index_entry(
            2,
            IndexEntryUpdate {
                progress: Some("4".into()),
                last_watch_position: Some("00:22:00".into()),
                total_duration: Some("00:24:00".into()),
                ..Default::default()
            },
        );

        let (episode, start) = service.get_episode(&item);
        assert_eq!(episode, "5");
        assert!(start.is_none());
    }

    #[test]
    fn unfinished_episode_keeps_resume_offset() {
        let (_dir, service) = setup(PreferredTracker::Local);
        let item = media(3);
        service.registry.get_or_create_record(&item).unwrap();
        service.registry.update_media_index_entry(
            3,
            IndexEntryUpdate {
                progress: Some("4".into()),
                last_watch_position: Some("00:05:00".into()),
                total_duration: Some("00:24:00".into()),
                ..Default::default()
            },
        );

        let (episode, start) = service.get_episode(&item);
        assert_eq!(episode, "4");
        assert_eq!(start.as_deref(), Some("00:05:00"));
    }

    #[test]
    fn preferred_tracker_breaks_disagreements() {
        let (_dir, local_service) = setup(PreferredTracker::Local);
        let mut item = media(4);
        item.user_status = Some(UserListItem {
            progress: Some(9),
            ..Default::default()
        });
        local_service.registry.get_or_create_record(&item).unwrap();
        local_service.registry.update_media_index_entry(
            4,
            IndexEntryUpdate {
                progress: Some("6".into()),
                ..Default::default()
            },
        );

        let (episode, _) = local_service.get_episode(&item);
        assert_eq!(episode, "6");

        let (_dir2, remote_service) = setup(PreferredTracker::Remote);
        remote_service.registry.get_or_create_record(&item).unwrap();
        remote_service.registry.update_media_index_entry(
            4,
            IndexEntryUpdate {
                progress: Some("6".into()),
                ..Default::default()
            },
        );
        let (episode, _) = remote_service.get_episode(&item);
        assert_eq!(episode, "9");
    }

    #[test]
    fn forward_guard_blocks_backwards_pushes_only() {
        let (_dir, service) = setup(PreferredTracker::Local);
        let mut item = media(5);
        item.user_status = Some(UserListItem {
            progress: Some(5),
            ..Default::default()
        });

        assert!(!service.forward_guard(&item, "3"));
        assert!(service.forward_guard(&item, "5"));
        assert!(service.forward_guard(&item, "8"));
        // Non-numeric progress is never suppressed.
        assert!(service.forward_guard(&item, "OVA"));
    }

    #[tokio::test]
    async fn track_writes_local_state() {
        let (_dir, service) = setup(PreferredTracker::Local);
        let item = media(6);
        service
            .track(
                &item,
                &PlayerResult {
                    episode: "2".into(),
                    stop_time: Some("00:20:00".into()),
                    total_time: Some("00:24:00".into()),
                },
            )
            .await;

        let entry = service.registry.get_media_index_entry(6).unwrap();
        assert_eq!(entry.progress, "2");
        assert_eq!(entry.last_watch_position.as_deref(), Some("00:20:00"));
        assert!(entry.last_watched.is_some());
        assert_eq!(entry.status, Some(UserMediaListStatus::Watching));
    }
}
