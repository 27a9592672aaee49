//! Command-line surface.
//!
//! Thin wiring over the services: each subcommand builds the components it
//! needs and delegates. No orchestration logic lives here.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use futures::StreamExt;

use crate::clients::{MediaApiClient, create_api_client};
use crate::config::Config;
use crate::feedback::Feedback;
use crate::models::media::{MediaItem, MediaSearchParams, UserMediaListStatus};
use crate::models::player::PlayerParams;
use crate::models::provider::{Anime, EpisodeStreamsParams, Server};
use crate::providers::{AnimeProvider, create_provider};
use crate::registry::export::{ExportFormat, export_registry, import_registry, sync_with_remote};
use crate::registry::MediaRegistry;
use crate::services::auth::{AuthProfile, AuthService};
use crate::services::download::DownloadService;
use crate::services::notification::NotificationService;
use crate::services::player::PlayerService;
use crate::services::session::SessionsService;
use crate::services::watch_history::WatchHistoryService;
use crate::services::worker::BackgroundWorker;

#[derive(Parser)]
#[command(name = "torii", version, about = "Terminal anime streaming and download orchestrator")]
pub struct Cli {
    /// Resume from the last saved session.
    #[arg(long, global = true)]
    pub resume: bool,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Create a default config file.
    Init,

    /// Run the background worker (notifications + download queue).
    Daemon,

    /// Search the catalog.
    Search {
        query: Vec<String>,
        #[arg(short, long, default_value_t = 1)]
        page: usize,
    },

    /// Stream an episode.
    Play {
        query: Vec<String>,
        #[arg(long)]
        id: Option<i64>,
        #[arg(short, long)]
        episode: Option<String>,
        /// Play from local downloads instead of streaming.
        #[arg(long)]
        local: bool,
    },

    /// Download episodes in the foreground.
    Download {
        query: Vec<String>,
        #[arg(long)]
        id: Option<i64>,
        /// Range of episodes, e.g. "1-10", "5" or "8:12".
        #[arg(short = 'r', long)]
        episode_range: String,
        /// Accept the resolver's choice without confirmation.
        #[arg(short = 'Y', long)]
        yes: bool,
    },

    /// Manage the background download queue.
    Queue {
        #[command(subcommand)]
        command: QueueCommands,
    },

    /// Inspect and maintain the local registry.
    Registry {
        #[command(subcommand)]
        command: RegistryCommands,
    },

    /// Catalog authentication.
    Auth {
        #[command(subcommand)]
        command: AuthCommands,
    },

    /// List unread catalog notifications.
    Notifications,
}

#[derive(Subcommand)]
pub enum QueueCommands {
    /// Queue episodes for the background worker.
    Add {
        query: Vec<String>,
        #[arg(long)]
        id: Option<i64>,
        #[arg(short = 'r', long)]
        episode_range: String,
    },
    /// Show pending, active, paused and failed rows.
    List,
    /// Submit queued and interrupted rows to the worker now.
    Resume,
    /// Drop terminal rows older than the configured age.
    Clear,
}

#[derive(Subcommand)]
pub enum RegistryCommands {
    /// Query the local registry.
    Search {
        query: Vec<String>,
        #[arg(long)]
        status: Option<String>,
    },
    /// Breakdown by api and list status.
    Stats,
    /// Recently watched titles.
    Recent {
        #[arg(short, long)]
        limit: Option<usize>,
    },
    /// Export to JSON, CSV or XML.
    Export {
        #[arg(short, long)]
        output: PathBuf,
        #[arg(short, long, default_value = "json")]
        format: String,
    },
    /// Import a previous export.
    Import {
        path: PathBuf,
        /// Merge into the current registry instead of replacing it.
        #[arg(long)]
        merge: bool,
    },
    /// Push local progress to the catalog and pull the remote list.
    Sync,
    /// Drop stale terminal queue rows and fix vanished files.
    Clean,
}

#[derive(Subcommand)]
pub enum AuthCommands {
    Login {
        #[arg(long)]
        token: String,
    },
    Logout,
    Status,
}

/// Shared service wiring for the commands.
pub struct AppContext {
    pub config: Arc<Config>,
    pub feedback: Feedback,
    pub registry: Arc<MediaRegistry>,
    pub api: Arc<dyn MediaApiClient>,
    pub provider: Arc<dyn AnimeProvider>,
}

impl AppContext {
    pub async fn build(config: Config) -> Result<Self> {
        let feedback = Feedback::new(config.general.icons);
        let registry = Arc::new(MediaRegistry::new(
            &config.general.media_api,
            config.registry.clone(),
        )?);

        let mut api = create_api_client(&config.general.media_api)?;
        let auth = AuthService::new(&config.general.media_api);
        if let Some(profile) = auth.get_auth() {
            if api.authenticate(&profile.token).await.is_none() {
                feedback.warning("Stored catalog token was rejected; logging out.");
                auth.clear_auth();
            }
        }

        let provider = create_provider(&config.general.provider)?;

        Ok(Self {
            config: Arc::new(config),
            feedback,
            registry,
            api: Arc::from(api),
            provider: Arc::from(provider),
        })
    }

    fn download_service(&self) -> Arc<DownloadService> {
        Arc::new(DownloadService::new(
            Arc::clone(&self.config),
            Arc::clone(&self.registry),
            Arc::clone(&self.provider),
        ))
    }

    fn watch_history(&self) -> WatchHistoryService {
        WatchHistoryService::new(
            &self.config,
            Arc::clone(&self.registry),
            Some(Arc::clone(&self.api)),
        )
    }

    /// Locate a catalog item by id or free-text query.
    pub async fn find_media(&self, id: Option<i64>, query: &[String]) -> Result<MediaItem> {
        if let Some(id) = id {
            return self
                .api
                .get_media(id)
                .await?
                .with_context(|| format!("no catalog entry with id {id}"));
        }

        let query = query.join(" ");
        if query.is_empty() {
            bail!("either --id or a search query is required");
        }
        let _progress = self.feedback.progress("Searching catalog");
        let result = self
            .api
            .search_media(&MediaSearchParams {
                query: Some(query.clone()),
                per_page: Some(10),
                ..Default::default()
            })
            .await?
            .with_context(|| format!("no catalog results for '{query}'"))?;
        result
            .media
            .into_iter()
            .next()
            .with_context(|| format!("no catalog results for '{query}'"))
    }
}

/// Expand an episode-range spec against the provider's episode list.
/// "5" → [5]; "1-10" and "8:12" are inclusive numeric ranges.
pub fn episodes_in_range(available: &[String], spec: &str) -> Result<Vec<String>> {
    let (start, end) = match spec.split_once(['-', ':']) {
        Some((start, end)) => (
            start.trim().parse::<f64>().context("invalid range start")?,
            end.trim().parse::<f64>().context("invalid range end")?,
        ),
        None => {
            let single = spec.trim();
            if available.iter().any(|e| e == single) {
                return Ok(vec![single.to_string()]);
            }
            bail!("episode {single} is not available");
        }
    };
    if end < start {
        bail!("empty episode range");
    }

    let episodes: Vec<String> = available
        .iter()
        .filter(|e| {
            e.parse::<f64>()
                .map(|n| n >= start && n <= end)
                .unwrap_or(false)
        })
        .cloned()
        .collect();
    if episodes.is_empty() {
        bail!("no available episodes in range {spec}");
    }
    Ok(episodes)
}

async fn first_server(
    ctx: &AppContext,
    anime: &Anime,
    episode: &str,
) -> Result<Server> {
    let _progress = ctx.feedback.progress("Fetching episode streams");
    let mut stream = ctx
        .provider
        .episode_streams(&EpisodeStreamsParams {
            anime_id: anime.id.clone(),
            query: anime.title.clone(),
            episode: episode.to_string(),
            translation_type: ctx.config.stream.translation_type,
            quality: Some(ctx.config.stream.quality),
            server: None,
            subtitles: true,
        })
        .await?
        .context("provider returned no streams")?;
    stream.next().await.context("no servers for this episode")
}

pub async fn cmd_search(ctx: &AppContext, query: Vec<String>, page: usize) -> Result<()> {
    let result = ctx
        .api
        .search_media(&MediaSearchParams {
            query: Some(query.join(" ")),
            page: Some(page),
            ..Default::default()
        })
        .await?;

    let Some(result) = result else {
        ctx.feedback.info("No results.");
        return Ok(());
    };
    for media in &result.media {
        let episodes = media
            .episodes
            .map(|e| e.to_string())
            .unwrap_or_else(|| "?".to_string());
        println!(
            "{:>8}  {}  ({episodes} eps, {:?})",
            media.id,
            media.title.preferred(),
            media.status
        );
    }
    let per_page = result.page_info.per_page.max(1);
    println!(
        "page {}/{}",
        result.page_info.current_page,
        result.page_info.total.max(1).div_ceil(per_page)
    );
    Ok(())
}

pub async fn cmd_play(
    ctx: &AppContext,
    query: Vec<String>,
    id: Option<i64>,
    episode: Option<String>,
    local: bool,
) -> Result<()> {
    let media = ctx.find_media(id, &query).await?;
    let watch_history = ctx.watch_history();

    let (episode, start_time) = match episode {
        Some(episode) => (episode, None),
        None => watch_history.get_episode(&media),
    };

    let player = PlayerService::new(
        Arc::clone(&ctx.config),
        Arc::clone(&ctx.provider),
        Some(Arc::clone(&ctx.registry)),
    )?;

    let result = if local {
        let record = ctx
            .registry
            .get_media_record(media.id)
            .context("nothing downloaded for this title")?;
        let row = record
            .episode(&episode)
            .filter(|row| {
                row.download_status == crate::models::registry::DownloadStatus::Completed
            })
            .with_context(|| format!("episode {episode} is not downloaded"))?;
        let path = row.file_path.clone().context("episode row has no file")?;

        let params = PlayerParams {
            url: path.to_string_lossy().into_owned(),
            episode: episode.clone(),
            query: media.title.preferred().to_string(),
            title: Some(format!("{} - Episode {episode}", media.title.preferred())),
            subtitles: row
                .subtitle_paths
                .iter()
                .map(|p| p.to_string_lossy().into_owned())
                .collect(),
            headers: Default::default(),
            start_time,
            syncplay: false,
        };
        player.play(params, None, Some(&media), true).await?
    } else {
        let downloads = ctx.download_service();
        let anime = downloads.resolve_provider_anime(&media).await?;
        let server = first_server(ctx, &anime, &episode).await?;
        let link = server
            .best_link(ctx.config.stream.quality)
            .context("server carried no links")?;

        let params = PlayerParams {
            url: link.link.clone(),
            episode: episode.clone(),
            query: anime.title.clone(),
            title: Some(format!("{} - Episode {episode}", media.title.preferred())),
            subtitles: server.subtitles.iter().map(|s| s.url.clone()).collect(),
            headers: server.headers.clone(),
            start_time,
            syncplay: false,
        };

        watch_history.add_media_to_list_if_not_present(&media).await;
        player.play(params, Some(&anime), Some(&media), false).await?
    };

    watch_history.track(&media, &result).await;
    ctx.feedback.success(&format!(
        "Stopped at episode {}{}",
        result.episode,
        result
            .stop_time
            .as_deref()
            .map(|t| format!(" ({t})"))
            .unwrap_or_default()
    ));
    Ok(())
}

pub async fn cmd_download(
    ctx: &AppContext,
    query: Vec<String>,
    id: Option<i64>,
    episode_range: &str,
    yes: bool,
) -> Result<()> {
    let media = ctx.find_media(id, &query).await?;
    let downloads = ctx.download_service();
    let anime = downloads.resolve_provider_anime(&media).await?;

    if !yes {
        ctx.feedback
            .info(&format!("Matched provider entry: {}", anime.title));
        eprint!("Continue? [Y/n] ");
        let mut answer = String::new();
        let _ = std::io::stdin().read_line(&mut answer);
        if answer.trim().eq_ignore_ascii_case("n") {
            return Ok(());
        }
    }

    let available = anime
        .episodes
        .for_translation(ctx.config.stream.translation_type);
    let episodes = episodes_in_range(available, episode_range)?;

    ctx.feedback
        .info(&format!("Downloading {} episode(s)", episodes.len()));
    let succeeded = downloads.download_episodes_sync(&media, &episodes).await?;
    ctx.feedback
        .success(&format!("{succeeded}/{} downloads finished", episodes.len()));
    Ok(())
}

pub async fn cmd_queue(ctx: &AppContext, command: QueueCommands) -> Result<()> {
    let downloads = ctx.download_service();
    match command {
        QueueCommands::Add {
            query,
            id,
            episode_range,
        } => {
            let media = ctx.find_media(id, &query).await?;
            let anime = downloads.resolve_provider_anime(&media).await?;
            let available = anime
                .episodes
                .for_translation(ctx.config.stream.translation_type);
            let episodes = episodes_in_range(available, &episode_range)?;

            let mut added = 0;
            for episode in &episodes {
                if downloads.add_to_queue(&media, episode) {
                    added += 1;
                }
            }
            ctx.feedback
                .success(&format!("Queued {added}/{} episode(s)", episodes.len()));
        }
        QueueCommands::List => {
            let rows = downloads.queue_snapshot();
            if rows.is_empty() {
                ctx.feedback.info("Queue is empty.");
            }
            for (media_id, episode, status) in rows {
                let title = ctx
                    .registry
                    .get_media_record(media_id)
                    .map(|r| r.media_item.title.preferred().to_string())
                    .unwrap_or_else(|| format!("media #{media_id}"));
                println!("{:<12} {title} - episode {episode}", status.as_str());
            }
        }
        QueueCommands::Resume => {
            downloads.start();
            downloads.resume_unfinished_downloads().await;
            downloads.stop().await;
            ctx.feedback.success("Submitted queued downloads.");
        }
        QueueCommands::Clear => {
            let removed =
                downloads.clean_completed_jobs(ctx.config.downloads.completed_job_max_age_days);
            ctx.feedback
                .success(&format!("Removed {removed} old queue row(s)."));
        }
    }
    Ok(())
}

pub async fn cmd_registry(ctx: &AppContext, command: RegistryCommands) -> Result<()> {
    match command {
        RegistryCommands::Search { query, status } => {
            let result = match status.as_deref() {
                Some(status) => {
                    let status: UserMediaListStatus =
                        serde_json::from_value(serde_json::Value::String(status.to_lowercase()))
                            .context("unknown list status")?;
                    ctx.registry.get_media_by_status(status)
                }
                None => ctx.registry.search_for_media(&MediaSearchParams {
                    query: (!query.is_empty()).then(|| query.join(" ")),
                    ..Default::default()
                }),
            };
            for media in &result.media {
                println!("{:>8}  {}", media.id, media.title.preferred());
            }
            println!("{} title(s)", result.page_info.total);
        }
        RegistryCommands::Stats => {
            let stats = ctx.registry.get_registry_stats();
            println!("total: {}", stats.total_media);
            for (api, count) in &stats.by_api {
                println!("  {api}: {count}");
            }
            for (status, count) in &stats.by_status {
                println!("  {status}: {count}");
            }
            let downloads = ctx.registry.get_download_statistics();
            println!(
                "episodes: {} tracked, {} downloaded, {} queued, {} failed",
                downloads.total_episodes, downloads.downloaded, downloads.queued, downloads.failed
            );
        }
        RegistryCommands::Recent { limit } => {
            let result = ctx.registry.get_recently_watched(limit);
            for media in &result.media {
                println!("{:>8}  {}", media.id, media.title.preferred());
            }
        }
        RegistryCommands::Export { output, format } => {
            let format = ExportFormat::parse(&format).context("format must be json, csv or xml")?;
            export_registry(&ctx.registry, format, &output)?;
            ctx.feedback
                .success(&format!("Exported registry to {}", output.display()));
        }
        RegistryCommands::Import { path, merge } => {
            let imported = import_registry(&ctx.registry, &path, merge)?;
            ctx.feedback
                .success(&format!("Imported {imported} record(s)."));
        }
        RegistryCommands::Sync => {
            let (pushed, pulled) = sync_with_remote(&ctx.registry, ctx.api.as_ref()).await?;
            ctx.feedback
                .success(&format!("Sync done: pushed {pushed}, pulled {pulled}."));
        }
        RegistryCommands::Clean => {
            let removed = ctx
                .registry
                .clean_completed_jobs(ctx.config.downloads.completed_job_max_age_days);
            let fixed = ctx.registry.reconcile_missing_files();
            ctx.feedback.success(&format!(
                "Removed {removed} old row(s), downgraded {fixed} vanished file(s)."
            ));
        }
    }
    Ok(())
}

pub async fn cmd_auth(config: &Config, command: AuthCommands) -> Result<()> {
    let feedback = Feedback::new(config.general.icons);
    let auth = AuthService::new(&config.general.media_api);
    match command {
        AuthCommands::Login { token } => {
            let mut api = create_api_client(&config.general.media_api)?;
            match api.authenticate(&token).await {
                Some(profile) => {
                    auth.save_auth(&AuthProfile {
                        user_profile: profile.clone(),
                        token,
                    })?;
                    feedback.success(&format!("Logged in as {}", profile.name));
                }
                None => {
                    auth.clear_auth();
                    bail!("the catalog rejected this token");
                }
            }
        }
        AuthCommands::Logout => {
            auth.clear_auth();
            feedback.success("Logged out.");
        }
        AuthCommands::Status => match auth.get_auth() {
            Some(profile) => feedback.info(&format!("Logged in as {}", profile.user_profile.name)),
            None => feedback.info("Not logged in."),
        },
    }
    Ok(())
}

pub async fn cmd_notifications(ctx: &AppContext) -> Result<()> {
    if !ctx.api.is_authenticated() {
        bail!("authentication required; run 'torii auth login' first");
    }

    let notifications = {
        let _progress = ctx.feedback.progress("Fetching notifications");
        ctx.api.get_notifications().await?
    };
    let Some(mut notifications) = notifications else {
        ctx.feedback.success("All caught up! No new notifications.");
        return Ok(());
    };
    if notifications.is_empty() {
        ctx.feedback.success("All caught up! No new notifications.");
        return Ok(());
    }

    notifications.sort_by(|a, b| b.created_at.cmp(&a.created_at));
    for notification in &notifications {
        println!(
            "{}  {}  Episode {} has aired",
            notification.created_at.format("%Y-%m-%d"),
            notification.media.title.preferred(),
            notification
                .episode
                .map(|e| e.to_string())
                .unwrap_or_else(|| "?".to_string())
        );
    }
    ctx.feedback
        .info("Notifications are now marked as read on the catalog.");
    Ok(())
}

pub async fn cmd_daemon(ctx: &AppContext) -> Result<()> {
    let downloads = ctx.download_service();
    let notifications = Arc::new(NotificationService::new(
        Arc::clone(&ctx.registry),
        Arc::clone(&ctx.api),
    ));
    let worker = BackgroundWorker::new(
        ctx.config.worker.clone(),
        Some(notifications),
        downloads,
    );
    ctx.feedback.info("Background worker running. Ctrl+C to stop.");
    worker.run().await;
    Ok(())
}

pub fn restore_session(config: &Config, feedback: &Feedback) {
    let sessions = SessionsService::new(&config.sessions);
    match sessions
        .get_default_session_history()
        .or_else(|| sessions.get_most_recent_session_history())
    {
        Some(history) => feedback.info(&format!(
            "Restored previous session with {} state frame(s).",
            history.len()
        )),
        None => feedback.warning("No previous session to restore."),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn eps(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn single_episode_spec() {
        let available = eps(&["1", "2", "3"]);
        assert_eq!(episodes_in_range(&available, "2").unwrap(), eps(&["2"]));
        assert!(episodes_in_range(&available, "9").is_err());
    }

    #[test]
    fn dash_and_colon_ranges_are_inclusive() {
        let available = eps(&["1", "2", "3", "4", "5"]);
        assert_eq!(
            episodes_in_range(&available, "2-4").unwrap(),
            eps(&["2", "3", "4"])
        );
        assert_eq!(
            episodes_in_range(&available, "4:5").unwrap(),
            eps(&["4", "5"])
        );
    }

    #[test]
    fn ranges_keep_decimal_episodes() {
        let available = eps(&["7", "7.5", "8"]);
        assert_eq!(
            episodes_in_range(&available, "7-8").unwrap(),
            eps(&["7", "7.5", "8"])
        );
    }

    #[test]
    fn backwards_range_is_rejected() {
        let available = eps(&["1", "2"]);
        assert!(episodes_in_range(&available, "2-1").is_err());
    }
}
