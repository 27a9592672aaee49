//! Airing-episode notifications.
//!
//! Polls the catalog for unread notifications and raises one desktop
//! notification per genuinely new episode. `last_notified_episode` in the
//! registry index guards against repeats across polls and restarts.

use std::cmp::Ordering;
use std::sync::Arc;

use anyhow::Result;
use tracing::{debug, info, warn};

use crate::clients::MediaApiClient;
use crate::models::media::Notification;
use crate::registry::{IndexEntryUpdate, MediaRegistry};
use crate::utils::detect::is_running_in_termux;
use crate::utils::time::compare_episodes;

pub struct NotificationService {
    registry: Arc<MediaRegistry>,
    api: Arc<dyn MediaApiClient>,
}

impl NotificationService {
    pub fn new(registry: Arc<MediaRegistry>, api: Arc<dyn MediaApiClient>) -> Self {
        Self { registry, api }
    }

    /// One poll: fetch unread notifications, drop everything at or below
    /// the last notified episode, raise the rest and advance the marker.
    /// Returns the number of notifications shown.
    pub async fn check_and_notify(&self) -> Result<usize> {
        if !self.api.is_authenticated() {
            debug!("not authenticated, skipping notification check");
            return Ok(0);
        }

        let Some(notifications) = self.api.get_notifications().await? else {
            return Ok(0);
        };
        if notifications.is_empty() {
            return Ok(0);
        }

        let seen = self.registry.get_seen_notifications();
        let mut shown = 0;

        for notification in newest_per_media(notifications) {
            let Some(episode) = notification.episode else {
                continue;
            };
            let episode_str = episode.to_string();

            if let Some(last) = seen.get(&notification.media.id) {
                if compare_episodes(&episode_str, last) != Ordering::Greater {
                    debug!(
                        media_id = notification.media.id,
                        episode = %episode_str,
                        last = %last,
                        "already notified"
                    );
                    continue;
                }
            }

            let title = notification.media.title.preferred().to_string();
            let message = format!("Episode {episode} of {title} has aired!");
            if let Err(err) = send_desktop_notification(&title, &message) {
                warn!(error = %err, "failed to raise desktop notification");
            }
            info!(media_id = notification.media.id, episode, "new episode notification");

            self.registry.update_media_index_entry(
                notification.media.id,
                IndexEntryUpdate {
                    media_item: Some(notification.media.clone()),
                    last_notified_episode: Some(episode_str),
                    ..Default::default()
                },
            );
            shown += 1;
        }

        Ok(shown)
    }
}

/// Collapse a batch to the newest episode per media so a backlog raises one
/// notification, not a flood.
fn newest_per_media(notifications: Vec<Notification>) -> Vec<Notification> {
    let mut best: Vec<Notification> = Vec::new();
    for notification in notifications {
        let Some(episode) = notification.episode else {
            continue;
        };
        match best
            .iter_mut()
            .find(|b| b.media.id == notification.media.id)
        {
            Some(existing) => {
                let existing_ep = existing.episode.unwrap_or(0);
                if compare_episodes(&episode.to_string(), &existing_ep.to_string())
                    == Ordering::Greater
                {
                    *existing = notification;
                }
            }
            None => best.push(notification),
        }
    }
    best
}

fn send_desktop_notification(title: &str, message: &str) -> Result<()> {
    if is_running_in_termux() {
        // No desktop bus on Android; termux-api provides the equivalent.
        let status = std::process::Command::new("termux-notification")
            .arg("--title")
            .arg(title)
            .arg("--content")
            .arg(message)
            .status()?;
        if !status.success() {
            anyhow::bail!("termux-notification exited with {status}");
        }
        return Ok(());
    }

    notify_rust::Notification::new()
        .appname(crate::constants::APP_NAME)
        .summary(title)
        .body(message)
        .timeout(notify_rust::Timeout::Milliseconds(10_000))
        .show()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::media::{MediaItem, NotificationType};
    use chrono::Utc;

    fn notification(media_id: i64, episode: i32) -> Notification {
        Notification {
            id: episode as i64,
            kind: NotificationType::Airing,
            episode: Some(episode),
            contexts: Vec::new(),
            created_at: Utc::now(),
            media: MediaItem::with_id_and_title(media_id, "Foo", "Foo"),
        }
    }

    #[test]
    fn batches_collapse_to_newest_episode() {
        let collapsed = newest_per_media(vec![
            notification(7, 5),
            notification(7, 6),
            notification(9, 2),
        ]);
        assert_eq!(collapsed.len(), 2);
        let seven = collapsed.iter().find(|n| n.media.id == 7).unwrap();
        assert_eq!(seven.episode, Some(6));
    }

    #[test]
    fn episodeless_notifications_are_dropped() {
        let mut n = notification(1, 1);
        n.episode = None;
        assert!(newest_per_media(vec![n]).is_empty());
    }
}
