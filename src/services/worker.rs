//! Background worker.
//!
//! Three independently timed periodic tasks in one loop: the catalog
//! notification poll, the download-queue resume sweep and the failed-retry
//! sweep. Tasks are strictly serialized, each wrapped so one failure cannot
//! starve the others, and the loop sleeps until the nearest deadline capped
//! at 30 seconds so shutdown signals are honored promptly.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::Notify;
use tracing::{error, info};

use crate::config::WorkerConfig;
use crate::services::download::DownloadService;
use crate::services::notification::NotificationService;

const MAX_SLEEP: Duration = Duration::from_secs(30);

pub struct BackgroundWorker {
    config: WorkerConfig,
    notifications: Option<Arc<NotificationService>>,
    downloads: Arc<DownloadService>,
    stop: Arc<Notify>,
    stopped: std::sync::atomic::AtomicBool,
}

impl BackgroundWorker {
    pub fn new(
        config: WorkerConfig,
        notifications: Option<Arc<NotificationService>>,
        downloads: Arc<DownloadService>,
    ) -> Self {
        Self {
            config,
            notifications,
            downloads,
            stop: Arc::new(Notify::new()),
            stopped: std::sync::atomic::AtomicBool::new(false),
        }
    }

    pub fn stop_handle(&self) -> Arc<Notify> {
        Arc::clone(&self.stop)
    }

    fn is_stopped(&self) -> bool {
        self.stopped.load(std::sync::atomic::Ordering::SeqCst)
    }

    fn mark_stopped(&self) {
        self.stopped
            .store(true, std::sync::atomic::Ordering::SeqCst);
    }

    /// Run until a shutdown signal arrives. Installs SIGINT/SIGTERM handlers
    /// and always stops the download service on the way out.
    pub async fn run(&self) {
        info!("background worker starting");

        // Intervals are configured in minutes with a one-minute floor.
        let notification_interval =
            Duration::from_secs(self.config.notification_check_interval.max(1) * 60);
        let download_interval =
            Duration::from_secs(self.config.download_check_interval.max(1) * 60);
        let retry_interval =
            Duration::from_secs(self.config.download_check_failed_interval.max(1) * 60);

        self.downloads.start();

        // First execution of every task happens immediately.
        let now = Instant::now();
        let mut next_notification = now;
        let mut next_download = now;
        let mut next_retry = now;

        let stop = Arc::clone(&self.stop);
        let signal_stop = Arc::clone(&self.stop);
        let signal_task = tokio::spawn(async move {
            if wait_for_shutdown_signal().await {
                signal_stop.notify_waiters();
            }
        });

        loop {
            if self.is_stopped() {
                break;
            }
            let now = Instant::now();

            if now >= next_notification {
                if let Some(notifications) = &self.notifications {
                    info!("checking for notifications");
                    if let Err(err) = notifications.check_and_notify().await {
                        error!(error = %err, "error during notification check");
                    }
                }
                next_notification = now + notification_interval;
            }

            if now >= next_download {
                self.downloads.resume_unfinished_downloads().await;
                next_download = now + download_interval;
            }

            if now >= next_retry {
                self.downloads.retry_failed_downloads().await;
                next_retry = now + retry_interval;
            }

            let nearest = [next_notification, next_download, next_retry]
                .into_iter()
                .min()
                .unwrap_or_else(|| now + MAX_SLEEP);
            let wait = nearest.saturating_duration_since(Instant::now()).min(MAX_SLEEP);

            tokio::select! {
                _ = tokio::time::sleep(wait) => {}
                _ = stop.notified() => {
                    self.mark_stopped();
                    break;
                }
            }
        }

        signal_task.abort();
        self.downloads.stop().await;
        info!("background worker stopped");
    }

    pub fn stop(&self) {
        self.mark_stopped();
        self.stop.notify_waiters();
    }
}

/// Resolves true when SIGINT or SIGTERM arrives.
async fn wait_for_shutdown_signal() -> bool {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        let mut sigterm = match signal(SignalKind::terminate()) {
            Ok(sigterm) => sigterm,
            Err(err) => {
                error!(error = %err, "failed to install SIGTERM handler");
                return tokio::signal::ctrl_c().await.is_ok();
            }
        };
        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                info!("received SIGINT, shutting down background worker");
                result.is_ok()
            }
            _ = sigterm.recv() => {
                info!("received SIGTERM, shutting down background worker");
                true
            }
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await.is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::registry::MediaRegistry;

    #[tokio::test]
    async fn stop_terminates_the_loop() {
        let dir = tempfile::TempDir::new().unwrap();
        let mut config = Config::default();
        config.registry.media_dir = dir.path().to_path_buf();
        let registry = Arc::new(MediaRegistry::new("anilist", config.registry.clone()).unwrap());
        let provider = crate::providers::create_provider("allanime").unwrap();
        let downloads = Arc::new(DownloadService::new(
            Arc::new(config.clone()),
            registry,
            Arc::from(provider),
        ));

        let worker = Arc::new(BackgroundWorker::new(config.worker.clone(), None, downloads));
        let runner = {
            let worker = Arc::clone(&worker);
            tokio::spawn(async move { worker.run().await })
        };

        // Give the loop a moment to start, then stop it.
        tokio::time::sleep(Duration::from_millis(200)).await;
        worker.stop();
        tokio::time::timeout(Duration::from_secs(5), runner)
            .await
            .expect("worker did not stop in time")
            .unwrap();
    }
}
