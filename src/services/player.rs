//! Player service.
//!
//! Launches the external media player, either plainly (scraping the exit
//! output for the last playback position) or handing the session to the IPC
//! controller. Torrent URLs are proxied through a local torrent streamer and
//! Termux goes through Android activity intents.

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::OnceLock;

use anyhow::{Context, Result};
use async_trait::async_trait;
use regex::Regex;
use tracing::{info, warn};

use crate::config::Config;
use crate::downloader::torrent_regex;
use crate::error::ToriiError;
use crate::models::media::MediaItem;
use crate::models::player::{PlayerParams, PlayerResult};
use crate::models::provider::Anime;
use crate::providers::AnimeProvider;
use crate::registry::MediaRegistry;
use crate::services::ipc::MpvIpcSession;
use crate::utils::detect::is_running_in_termux;

fn av_time_pattern() -> &'static Regex {
    static INSTANCE: OnceLock<Regex> = OnceLock::new();
    INSTANCE.get_or_init(|| {
        Regex::new(r"AV: ([0-9:]+) / ([0-9:]+) \(([0-9]+)%\)").expect("Invalid Regex")
    })
}

/// One-shot playback suppression: set once, consumed on read. Callers must
/// not read it twice expecting the same answer.
#[derive(Default)]
pub struct OneShotFlag(AtomicBool);

impl OneShotFlag {
    pub fn set(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    /// Returns the flag and clears it.
    pub fn take(&self) -> bool {
        self.0.swap(false, Ordering::SeqCst)
    }
}

/// A player backend: plain playback plus (optionally) IPC-managed spawning.
#[async_trait]
pub trait BasePlayer: Send + Sync {
    async fn play(&self, params: &PlayerParams) -> Result<PlayerResult>;

    /// Spawn the player attached to a control socket. Backends without an
    /// IPC surface return an error and the caller falls back to plain play.
    fn spawn_with_ipc(
        &self,
        params: &PlayerParams,
        socket_path: &str,
    ) -> Result<tokio::process::Child>;
}

fn which(binary: &str) -> Result<PathBuf> {
    let path = std::env::var_os("PATH").unwrap_or_default();
    for dir in std::env::split_paths(&path) {
        let candidate = dir.join(binary);
        if candidate.is_file() {
            return Ok(candidate);
        }
    }
    anyhow::bail!(ToriiError::Player(format!("'{binary}' not found in PATH")))
}

fn split_args(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

pub struct MpvPlayer {
    player_args: String,
    pre_args: String,
}

impl MpvPlayer {
    pub fn new(config: &Config) -> Self {
        Self {
            player_args: config.stream.player_args.clone(),
            pre_args: config.stream.pre_args.clone(),
        }
    }

    /// Common mpv CLI options shared by plain and IPC launches.
    fn cli_options(&self, params: &PlayerParams) -> Vec<String> {
        let mut args = Vec::new();
        if !params.headers.is_empty() {
            let blob: Vec<String> = params
                .headers
                .iter()
                .map(|(k, v)| format!("{k}:{v}"))
                .collect();
            args.push(format!("--http-header-fields={}", blob.join(",")));
        }
        for sub in &params.subtitles {
            args.push(format!("--sub-file={sub}"));
        }
        if let Some(start) = &params.start_time {
            args.push(format!("--start={start}"));
        }
        if let Some(title) = &params.title {
            args.push(format!("--title={title}"));
        }
        args.extend(split_args(&self.player_args));
        args
    }

    fn command(&self, executable: PathBuf) -> (PathBuf, Vec<String>) {
        let pre = split_args(&self.pre_args);
        match pre.split_first() {
            Some((head, tail)) => {
                let mut args: Vec<String> = tail.to_vec();
                args.push(executable.to_string_lossy().into_owned());
                (PathBuf::from(head), args)
            }
            None => (executable, Vec::new()),
        }
    }
}

#[async_trait]
impl BasePlayer for MpvPlayer {
    async fn play(&self, params: &PlayerParams) -> Result<PlayerResult> {
        let executable = which("mpv")?;
        let (program, mut args) = self.command(executable);
        args.push(params.url.clone());
        args.extend(self.cli_options(params));

        info!(episode = %params.episode, "launching mpv");
        let output = tokio::process::Command::new(program)
            .args(&args)
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .output()
            .await
            .context("failed to run mpv")?;

        // The last AV line of the status output carries where playback
        // stopped.
        let stdout = String::from_utf8_lossy(&output.stdout);
        let mut stop_time = None;
        let mut total_time = None;
        for line in stdout.lines().rev() {
            if let Some(caps) = av_time_pattern().captures(line.trim()) {
                stop_time = Some(caps[1].to_string());
                total_time = Some(caps[2].to_string());
                break;
            }
        }

        Ok(PlayerResult {
            episode: params.episode.clone(),
            stop_time,
            total_time,
        })
    }

    fn spawn_with_ipc(
        &self,
        params: &PlayerParams,
        socket_path: &str,
    ) -> Result<tokio::process::Child> {
        let executable = which("mpv")?;
        let (program, mut args) = self.command(executable);
        args.push(format!("--input-ipc-server={socket_path}"));
        args.push("--idle=yes".to_string());
        args.push("--force-window=yes".to_string());
        args.push(params.url.clone());
        args.extend(self.cli_options(params));

        info!(socket = socket_path, "starting mpv with IPC");
        tokio::process::Command::new(program)
            .args(&args)
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .context("failed to spawn mpv")
    }
}

pub struct VlcPlayer {
    player_args: String,
}

impl VlcPlayer {
    pub fn new(config: &Config) -> Self {
        Self {
            player_args: config.stream.player_args.clone(),
        }
    }
}

#[async_trait]
impl BasePlayer for VlcPlayer {
    async fn play(&self, params: &PlayerParams) -> Result<PlayerResult> {
        let executable = which("vlc")?;
        let mut args = vec![params.url.clone(), "--play-and-exit".to_string()];
        for sub in &params.subtitles {
            args.push(format!("--sub-file={sub}"));
        }
        if let Some(start) = &params.start_time {
            args.push(format!(
                "--start-time={}",
                crate::utils::time::time_to_seconds(start)
            ));
        }
        if let Some(title) = &params.title {
            args.push(format!("--meta-title={title}"));
        }
        if let Some(referer) = params.headers.get("Referer") {
            args.push(format!("--http-referrer={referer}"));
        }
        args.extend(split_args(&self.player_args));

        info!(episode = %params.episode, "launching vlc");
        let status = tokio::process::Command::new(executable)
            .args(&args)
            .status()
            .await
            .context("failed to run vlc")?;
        if !status.success() {
            warn!(%status, "vlc exited abnormally");
        }
        // VLC reports no playback position on exit.
        Ok(PlayerResult::bare(&params.episode))
    }

    fn spawn_with_ipc(&self, _params: &PlayerParams, _socket_path: &str) -> Result<tokio::process::Child> {
        anyhow::bail!(ToriiError::Player("vlc has no IPC control plane".into()))
    }
}

/// Syncplay wraps mpv for watch-together sessions.
pub struct SyncplayPlayer {
    inner: MpvPlayer,
}

impl SyncplayPlayer {
    pub fn new(config: &Config) -> Self {
        Self {
            inner: MpvPlayer::new(config),
        }
    }
}

#[async_trait]
impl BasePlayer for SyncplayPlayer {
    async fn play(&self, params: &PlayerParams) -> Result<PlayerResult> {
        let executable = which("syncplay")?;
        let mut args = vec![params.url.clone()];
        let mpv_args = self.inner.cli_options(params);
        if !mpv_args.is_empty() {
            args.push("--".to_string());
            args.extend(mpv_args);
        }

        info!(episode = %params.episode, "launching syncplay");
        tokio::process::Command::new(executable)
            .args(&args)
            .status()
            .await
            .context("failed to run syncplay")?;
        Ok(PlayerResult::bare(&params.episode))
    }

    fn spawn_with_ipc(&self, _params: &PlayerParams, _socket_path: &str) -> Result<tokio::process::Child> {
        anyhow::bail!(ToriiError::Player("syncplay sessions are not IPC-managed".into()))
    }
}

pub fn create_player(config: &Config) -> Result<Box<dyn BasePlayer>> {
    match config.stream.player.as_str() {
        "mpv" => Ok(Box::new(MpvPlayer::new(config))),
        "vlc" => Ok(Box::new(VlcPlayer::new(config))),
        "syncplay" => Ok(Box::new(SyncplayPlayer::new(config))),
        other => anyhow::bail!(ToriiError::Player(format!("Unsupported player: '{other}'"))),
    }
}

pub struct PlayerService {
    config: Arc<Config>,
    provider: Arc<dyn AnimeProvider>,
    registry: Option<Arc<MediaRegistry>>,
    player: Arc<dyn BasePlayer>,
    pub dont_play: OneShotFlag,
}

impl PlayerService {
    pub fn new(
        config: Arc<Config>,
        provider: Arc<dyn AnimeProvider>,
        registry: Option<Arc<MediaRegistry>>,
    ) -> Result<Self> {
        let player: Arc<dyn BasePlayer> = Arc::from(create_player(&config)?);
        Ok(Self {
            config,
            provider,
            registry,
            player,
            dont_play: OneShotFlag::default(),
        })
    }

    /// Route one playback: IPC when enabled and there is a live anime handle
    /// (streaming) or a registry (local downloads); plain otherwise.
    pub async fn play(
        &self,
        params: PlayerParams,
        anime: Option<&Anime>,
        media_item: Option<&MediaItem>,
        local: bool,
    ) -> Result<PlayerResult> {
        if self.dont_play.take() {
            return Ok(PlayerResult::bare(&params.episode));
        }

        if is_running_in_termux() {
            return self.play_on_termux(&params).await;
        }

        if torrent_regex().is_match(&params.url) {
            return self.play_torrent(&params).await;
        }

        if self.config.stream.use_ipc {
            let registry = if local { self.registry.clone() } else { None };
            if anime.is_some() || registry.is_some() {
                let session = MpvIpcSession::new(
                    Arc::clone(&self.config),
                    Arc::clone(&self.provider),
                    Arc::clone(&self.player),
                );
                return session
                    .play(params, anime.cloned(), media_item.cloned(), registry)
                    .await;
            }
            warn!(
                url = %params.url,
                "IPC requested but no anime handle or registry; playing plainly"
            );
        }

        self.player.play(&params).await
    }

    /// Android path: hand the URL to the mpv activity via an intent.
    async fn play_on_termux(&self, params: &PlayerParams) -> Result<PlayerResult> {
        if torrent_regex().is_match(&params.url) {
            anyhow::bail!(ToriiError::Player("cannot play torrents on termux".into()));
        }
        tokio::process::Command::new("am")
            .args([
                "start",
                "--user",
                "0",
                "-a",
                "android.intent.action.VIEW",
                "-d",
                &params.url,
                "-n",
                "is.xyz.mpv/.MPVActivity",
            ])
            .status()
            .await
            .context("failed to fire android intent")?;
        Ok(PlayerResult::bare(&params.episode))
    }

    /// Torrents stream through webtorrent, which proxies into a local HTTP
    /// endpoint consumed by mpv.
    async fn play_torrent(&self, params: &PlayerParams) -> Result<PlayerResult> {
        let webtorrent = which("webtorrent")
            .context("please install webtorrent-cli in order to stream torrents")?;
        info!("streaming torrent via webtorrent");
        tokio::process::Command::new(webtorrent)
            .arg(&params.url)
            .arg("--mpv")
            .status()
            .await
            .context("failed to run webtorrent")?;
        Ok(PlayerResult::bare(&params.episode))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn av_line_parses() {
        let caps = av_time_pattern()
            .captures("AV: 00:10:22 / 00:23:40 (43%) A-V:  0.000")
            .unwrap();
        assert_eq!(&caps[1], "00:10:22");
        assert_eq!(&caps[2], "00:23:40");
        assert_eq!(&caps[3], "43");
    }

    #[test]
    fn one_shot_flag_consumes_on_read() {
        let flag = OneShotFlag::default();
        assert!(!flag.take());
        flag.set();
        assert!(flag.take());
        assert!(!flag.take());
    }

    #[test]
    fn mpv_options_include_headers_and_subs() {
        let player = MpvPlayer {
            player_args: "--fullscreen".into(),
            pre_args: String::new(),
        };
        let mut params = PlayerParams {
            url: "http://x/v.mp4".into(),
            episode: "1".into(),
            ..Default::default()
        };
        params.headers.insert("Referer".into(), "http://x/".into());
        params.subtitles.push("http://x/en.srt".into());
        params.start_time = Some("00:01:00".into());
        params.title = Some("Foo - Episode 1".into());

        let options = player.cli_options(&params);
        assert!(options.contains(&"--http-header-fields=Referer:http://x/".to_string()));
        assert!(options.contains(&"--sub-file=http://x/en.srt".to_string()));
        assert!(options.contains(&"--start=00:01:00".to_string()));
        assert!(options.contains(&"--title=Foo - Episode 1".to_string()));
        assert!(options.contains(&"--fullscreen".to_string()));
    }

    #[test]
    fn unknown_player_is_rejected() {
        let mut config = Config::default();
        config.stream.player = "wmp".into();
        assert!(create_player(&config).is_err());
    }
}
