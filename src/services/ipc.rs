//! mpv IPC control plane.
//!
//! One playback session owns a private Unix socket speaking mpv's
//! newline-delimited JSON protocol. A dedicated reader task splits the byte
//! stream into messages and classifies them: responses (carrying both
//! `request_id` and `error`) wake the command sender blocked on that id,
//! everything else lands on the event queue. The controller loop selects
//! over the event queue, the background fetch-result queue and the child
//! process exit, and never performs blocking network I/O itself — episode
//! switches run on short-lived fetch tasks.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use serde_json::{Value, json};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::{Mutex, mpsc, oneshot};
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::error::ToriiError;
use crate::models::media::MediaItem;
use crate::models::player::{PlayerParams, PlayerResult};
use crate::models::provider::{
    Anime, EpisodeStreamsParams, Server, StreamQuality, TranslationType,
};
use crate::providers::AnimeProvider;
use crate::registry::MediaRegistry;
use crate::services::player::BasePlayer;
use crate::utils::time::{episode_sort_key, format_time};

const SCRIPT_PREFIX: &str = "torii";
/// Responses that arrived with no waiter are parked and swept after this.
const ORPHAN_TTL: Duration = Duration::from_secs(30);

/// What the reader found in one line.
enum Classified {
    Response { request_id: u64, payload: Value },
    Event(Value),
}

/// Responses have both a `request_id` and an `error` field; events do not.
fn classify(message: Value) -> Classified {
    let is_response = message.get("request_id").is_some() && message.get("error").is_some();
    if is_response {
        let request_id = message
            .get("request_id")
            .and_then(Value::as_u64)
            .unwrap_or_default();
        Classified::Response {
            request_id,
            payload: message,
        }
    } else {
        Classified::Event(message)
    }
}

type PendingMap = Arc<StdMutex<HashMap<u64, oneshot::Sender<Value>>>>;
type OrphanMap = Arc<StdMutex<HashMap<u64, (Instant, Value)>>>;

/// Socket client: write half guarded for command senders, read half owned by
/// the reader task.
struct IpcClient {
    writer: Mutex<OwnedWriteHalf>,
    request_counter: StdMutex<u64>,
    pending: PendingMap,
    orphans: OrphanMap,
    command_timeout: Duration,
    reader: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl IpcClient {
    /// Retry-connect until mpv opens the socket or the timeout elapses.
    async fn connect(
        socket_path: &str,
        connect_timeout: Duration,
        command_timeout: Duration,
    ) -> Result<(Self, mpsc::UnboundedReceiver<Value>)> {
        let deadline = Instant::now() + connect_timeout;
        let stream = loop {
            match UnixStream::connect(socket_path).await {
                Ok(stream) => break stream,
                Err(_) if Instant::now() < deadline => {
                    tokio::time::sleep(Duration::from_millis(200)).await;
                }
                Err(err) => {
                    return Err(ToriiError::Ipc(format!(
                        "failed to connect to mpv socket {socket_path}: {err}"
                    ))
                    .into());
                }
            }
        };
        info!(socket = socket_path, "connected to mpv IPC socket");

        let (read_half, write_half) = stream.into_split();
        let pending: PendingMap = Arc::new(StdMutex::new(HashMap::new()));
        let orphans: OrphanMap = Arc::new(StdMutex::new(HashMap::new()));
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        let reader = tokio::spawn(read_loop(
            read_half,
            Arc::clone(&pending),
            Arc::clone(&orphans),
            events_tx,
        ));

        Ok((
            Self {
                writer: Mutex::new(write_half),
                request_counter: StdMutex::new(0),
                pending,
                orphans,
                command_timeout,
                reader: Mutex::new(Some(reader)),
            },
            events_rx,
        ))
    }

    /// Send one command and wait for its correlated response. A timeout is a
    /// soft error returned to the caller; the session stays up.
    async fn send_command(&self, args: Vec<Value>) -> Result<Value> {
        let (request_id, rx) = {
            let mut counter = self.request_counter.lock().expect("counter poisoned");
            *counter += 1;
            let request_id = *counter;
            let (tx, rx) = oneshot::channel();
            self.pending
                .lock()
                .expect("pending map poisoned")
                .insert(request_id, tx);
            (request_id, rx)
        };

        let line = format!(
            "{}\n",
            json!({ "command": args, "request_id": request_id })
        );
        {
            let mut writer = self.writer.lock().await;
            writer
                .write_all(line.as_bytes())
                .await
                .context("mpv socket write failed")?;
        }

        match tokio::time::timeout(self.command_timeout, rx).await {
            Ok(Ok(payload)) => Ok(payload),
            Ok(Err(_)) => {
                anyhow::bail!(ToriiError::Ipc("reader dropped the response channel".into()))
            }
            Err(_) => {
                self.pending
                    .lock()
                    .expect("pending map poisoned")
                    .remove(&request_id);
                anyhow::bail!(ToriiError::Ipc(format!(
                    "timeout waiting for response to request {request_id}"
                )))
            }
        }
    }

    /// Drop parked responses nobody claimed within the TTL.
    fn sweep_orphans(&self) {
        let mut orphans = self.orphans.lock().expect("orphan map poisoned");
        let before = orphans.len();
        orphans.retain(|_, (at, _)| at.elapsed() < ORPHAN_TTL);
        if orphans.len() < before {
            debug!(dropped = before - orphans.len(), "swept orphan responses");
        }
    }

    async fn shutdown(&self) {
        if let Some(reader) = self.reader.lock().await.take() {
            reader.abort();
            let _ = reader.await;
        }
    }
}

/// Reader task: blocking reads on the socket, newline framing, JSON parse,
/// classification. Any terminal condition posts a synthetic shutdown event
/// so the controller exits deterministically.
async fn read_loop(
    read_half: OwnedReadHalf,
    pending: PendingMap,
    orphans: OrphanMap,
    events_tx: mpsc::UnboundedSender<Value>,
) {
    let mut lines = BufReader::new(read_half).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                if line.is_empty() {
                    continue;
                }
                let message: Value = match serde_json::from_str(&line) {
                    Ok(message) => message,
                    Err(err) => {
                        // Malformed JSON from mpv is logged and dropped.
                        warn!(error = %err, snippet = &line[..line.len().min(100)], "undecodable mpv message");
                        continue;
                    }
                };
                match classify(message) {
                    Classified::Response { request_id, payload } => {
                        let waiter = pending
                            .lock()
                            .expect("pending map poisoned")
                            .remove(&request_id);
                        match waiter {
                            Some(tx) => {
                                let _ = tx.send(payload);
                            }
                            None => {
                                orphans
                                    .lock()
                                    .expect("orphan map poisoned")
                                    .insert(request_id, (Instant::now(), payload));
                            }
                        }
                    }
                    Classified::Event(event) => {
                        let _ = events_tx.send(event);
                    }
                }
            }
            Ok(None) => {
                info!("mpv IPC socket closed");
                let _ = events_tx.send(json!({ "event": "shutdown" }));
                break;
            }
            Err(err) => {
                error!(error = %err, "error in IPC read loop");
                let _ = events_tx.send(json!({ "event": "shutdown" }));
                break;
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FetchKind {
    Next,
    Previous,
    Reload,
    Custom,
}

impl FetchKind {
    fn label(self) -> &'static str {
        match self {
            Self::Next => "next",
            Self::Previous => "previous",
            Self::Reload => "current",
            Self::Custom => "selected",
        }
    }
}

enum FetchOutcome {
    Streams { episode: String, servers: Vec<Server> },
    LocalFile { episode: String, path: std::path::PathBuf },
    Error { message: String },
}

/// Dynamic state of one playback session.
struct PlayerState {
    query: String,
    episode: String,
    servers: Vec<Server>,
    preferred_server: Option<String>,
    quality: StreamQuality,
    translation_type: TranslationType,
    auto_next: bool,
    media_item: Option<MediaItem>,
    stop_time_secs: f64,
    total_time_secs: f64,
    fetching: bool,
    first_file: bool,
    local_path: Option<std::path::PathBuf>,
}

impl PlayerState {
    fn reset_timers(&mut self) {
        self.stop_time_secs = 0.0;
        self.total_time_secs = 0.0;
    }

    fn current_server(&self) -> Option<&Server> {
        if let Some(name) = &self.preferred_server {
            if let Some(server) = self.servers.iter().find(|s| &s.name == name) {
                return Some(server);
            }
        }
        self.servers.first()
    }

    fn stream_url(&self) -> Option<String> {
        if let Some(path) = &self.local_path {
            return Some(path.to_string_lossy().into_owned());
        }
        self.current_server()
            .and_then(|server| server.best_link(self.quality))
            .map(|link| link.link.clone())
    }

    fn subtitles(&self) -> Vec<String> {
        self.current_server()
            .map(|server| server.subtitles.iter().map(|s| s.url.clone()).collect())
            .unwrap_or_default()
    }

    fn episode_title(&self) -> String {
        if let Some(media_item) = &self.media_item {
            if let Some(streaming) = media_item.streaming_episodes.get(&self.episode) {
                return streaming.title.clone();
            }
            return format!(
                "{} - Episode {}",
                media_item.title.preferred(),
                self.episode
            );
        }
        if let Some(server) = self.current_server() {
            if let Some(title) = &server.episode_title {
                return title.clone();
            }
        }
        format!("Episode {}", self.episode)
    }

    fn result(&self) -> PlayerResult {
        PlayerResult {
            episode: self.episode.clone(),
            stop_time: (self.stop_time_secs > 0.0).then(|| format_time(self.stop_time_secs)),
            total_time: (self.total_time_secs > 0.0).then(|| format_time(self.total_time_secs)),
        }
    }
}

pub struct MpvIpcSession {
    config: Arc<Config>,
    provider: Arc<dyn AnimeProvider>,
    player: Arc<dyn BasePlayer>,
}

impl MpvIpcSession {
    pub fn new(
        config: Arc<Config>,
        provider: Arc<dyn AnimeProvider>,
        player: Arc<dyn BasePlayer>,
    ) -> Self {
        Self {
            config,
            provider,
            player,
        }
    }

    pub async fn play(
        &self,
        params: PlayerParams,
        anime: Option<Anime>,
        media_item: Option<MediaItem>,
        registry: Option<Arc<MediaRegistry>>,
    ) -> Result<PlayerResult> {
        let socket_path = std::env::temp_dir()
            .join(format!(
                "mpv_ipc_{}_{}.sock",
                std::process::id(),
                uuid::Uuid::new_v4()
            ))
            .to_string_lossy()
            .into_owned();

        let mut child = self.player.spawn_with_ipc(&params, &socket_path)?;
        tokio::time::sleep(Duration::from_secs(1)).await;

        let connected = IpcClient::connect(
            &socket_path,
            Duration::from_secs(self.config.stream.ipc_connect_timeout_secs),
            Duration::from_secs(self.config.stream.ipc_command_timeout_secs),
        )
        .await;

        let (client, events_rx) = match connected {
            Ok(pair) => pair,
            Err(err) => {
                // The socket never came up: tear the orphan player down and
                // offer plain playback.
                warn!(error = %err, "IPC connection failed, falling back");
                let _ = child.start_kill();
                let _ = std::fs::remove_file(&socket_path);
                if confirm_fallback() {
                    return self.player.play(&params).await;
                }
                return Ok(PlayerResult::bare(&params.episode));
            }
        };

        let state = PlayerState {
            query: params.query.clone(),
            episode: params.episode.clone(),
            servers: Vec::new(),
            preferred_server: (!self.config.stream.server.is_empty())
                .then(|| self.config.stream.server.clone()),
            quality: self.config.stream.quality,
            translation_type: self.config.stream.translation_type,
            auto_next: self.config.stream.auto_next,
            media_item,
            stop_time_secs: 0.0,
            total_time_secs: 0.0,
            fetching: false,
            first_file: true,
            local_path: None,
        };

        let outcome = self
            .run_session(&client, events_rx, &mut child, state, anime, registry)
            .await;

        // Cleanup happens regardless of how the session ended: stop the
        // player, join the reader, remove the socket.
        let _ = client.send_command(vec![json!("quit")]).await;
        match tokio::time::timeout(Duration::from_secs(3), child.wait()).await {
            Ok(_) => {}
            Err(_) => {
                let _ = child.start_kill();
                let _ = child.wait().await;
            }
        }
        client.shutdown().await;
        let _ = std::fs::remove_file(&socket_path);

        outcome
    }

    async fn run_session(
        &self,
        client: &IpcClient,
        mut events_rx: mpsc::UnboundedReceiver<Value>,
        child: &mut tokio::process::Child,
        mut state: PlayerState,
        anime: Option<Anime>,
        registry: Option<Arc<MediaRegistry>>,
    ) -> Result<PlayerResult> {
        self.setup_observers(client).await;
        self.setup_keybindings(client).await;

        let (fetch_tx, mut fetch_rx) = mpsc::unbounded_channel::<FetchOutcome>();
        let mut gc_tick = tokio::time::interval(Duration::from_secs(10));
        gc_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                event = events_rx.recv() => {
                    let Some(event) = event else { break };
                    if event.get("event").and_then(Value::as_str) == Some("shutdown") {
                        info!("mpv shut down");
                        break;
                    }
                    self.handle_event(client, &mut state, &event, &anime, &registry, &fetch_tx)
                        .await;
                }
                Some(outcome) = fetch_rx.recv() => {
                    self.handle_fetch_outcome(client, &mut state, outcome).await;
                }
                _ = child.wait() => {
                    info!("mpv process exited");
                    break;
                }
                _ = gc_tick.tick() => {
                    client.sweep_orphans();
                }
            }
        }

        Ok(state.result())
    }

    async fn setup_observers(&self, client: &IpcClient) {
        for command in [
            vec![json!("request_log_messages"), json!("info")],
            vec![json!("observe_property"), json!(1), json!("time-pos")],
            vec![json!("observe_property"), json!(2), json!("duration")],
            vec![json!("observe_property"), json!(3), json!("percent-pos")],
            vec![json!("observe_property"), json!(4), json!("filename")],
        ] {
            if let Err(err) = client.send_command(command).await {
                warn!(error = %err, "failed to set up mpv observer");
            }
        }
    }

    async fn setup_keybindings(&self, client: &IpcClient) {
        let bindings = [
            ("shift+n", "next-episode", "Next Episode"),
            ("shift+p", "previous-episode", "Previous Episode"),
            ("shift+a", "toggle-auto-next", "Toggle Auto-Next"),
            ("shift+t", "toggle-translation", "Toggle Translation"),
            ("shift+r", "reload-episode", "Reload Episode"),
        ];
        for (key, token, description) in bindings {
            let command = vec![
                json!("keybind"),
                json!(key),
                json!(format!("script-message {SCRIPT_PREFIX}-{token}")),
            ];
            match client.send_command(command).await {
                Ok(response) => {
                    if response.get("error").and_then(Value::as_str) != Some("success") {
                        warn!(key, "failed to bind key");
                        self.show_text(client, &format!("Error binding '{description}' key"), 3000)
                            .await;
                    }
                }
                Err(err) => warn!(key, error = %err, "keybind command failed"),
            }
        }
        self.show_text(
            client,
            "torii: Shift+N=Next, Shift+P=Prev, Shift+R=Reload",
            3000,
        )
        .await;
    }

    async fn show_text(&self, client: &IpcClient, text: &str, duration_ms: u64) {
        let _ = client
            .send_command(vec![
                json!("show-text"),
                json!(text),
                json!(duration_ms.to_string()),
            ])
            .await;
    }

    async fn handle_event(
        &self,
        client: &IpcClient,
        state: &mut PlayerState,
        event: &Value,
        anime: &Option<Anime>,
        registry: &Option<Arc<MediaRegistry>>,
        fetch_tx: &mpsc::UnboundedSender<FetchOutcome>,
    ) {
        match event.get("event").and_then(Value::as_str) {
            Some("property-change") => {
                let name = event.get("name").and_then(Value::as_str);
                let data = event.get("data").and_then(Value::as_f64);
                match (name, data) {
                    (Some("time-pos"), Some(value)) => state.stop_time_secs = value,
                    (Some("duration"), Some(value)) => state.total_time_secs = value,
                    (Some("percent-pos"), Some(value)) => {
                        if state.auto_next
                            && value >= self.config.stream.episode_complete_at
                            && !state.fetching
                        {
                            debug!(percent = value, "auto-next threshold crossed");
                            self.request_episode(
                                client, state, FetchKind::Next, None, anime, registry, fetch_tx,
                            )
                            .await;
                        }
                    }
                    _ => {}
                }
            }
            Some("client-message") => {
                let args: Vec<&str> = event
                    .get("args")
                    .and_then(Value::as_array)
                    .map(|a| a.iter().filter_map(Value::as_str).collect())
                    .unwrap_or_default();
                let Some((&token, rest)) = args.split_first() else {
                    return;
                };
                self.handle_client_message(client, state, token, rest, anime, registry, fetch_tx)
                    .await;
            }
            Some("file-loaded") => {
                self.configure_loaded_file(client, state).await;
            }
            Some(other) => debug!(event = other, "mpv event"),
            None => {}
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn handle_client_message(
        &self,
        client: &IpcClient,
        state: &mut PlayerState,
        token: &str,
        rest: &[&str],
        anime: &Option<Anime>,
        registry: &Option<Arc<MediaRegistry>>,
        fetch_tx: &mpsc::UnboundedSender<FetchOutcome>,
    ) {
        let stripped = token
            .strip_prefix(&format!("{SCRIPT_PREFIX}-"))
            .unwrap_or(token);
        match stripped {
            "next-episode" => {
                self.request_episode(client, state, FetchKind::Next, None, anime, registry, fetch_tx)
                    .await;
            }
            "previous-episode" => {
                self.request_episode(
                    client, state, FetchKind::Previous, None, anime, registry, fetch_tx,
                )
                .await;
            }
            "reload-episode" => {
                self.request_episode(
                    client, state, FetchKind::Reload, None, anime, registry, fetch_tx,
                )
                .await;
            }
            "toggle-auto-next" => {
                state.auto_next = !state.auto_next;
                let text = if state.auto_next {
                    "Auto-next enabled"
                } else {
                    "Auto-next disabled"
                };
                self.show_text(client, text, 2000).await;
            }
            "toggle-translation" => {
                state.translation_type = state.translation_type.toggled();
                self.show_text(
                    client,
                    &format!("Switching to {}...", state.translation_type.as_str()),
                    2000,
                )
                .await;
                self.request_episode(
                    client, state, FetchKind::Reload, None, anime, registry, fetch_tx,
                )
                .await;
            }
            "select-episode" => {
                if let Some(episode) = rest.first() {
                    self.request_episode(
                        client,
                        state,
                        FetchKind::Custom,
                        Some(episode.to_string()),
                        anime,
                        registry,
                        fetch_tx,
                    )
                    .await;
                }
            }
            "select-server" => {
                let Some(server) = rest.first() else { return };
                if state.servers.iter().any(|s| s.name == *server) {
                    state.preferred_server = Some(server.to_string());
                    self.request_episode(
                        client, state, FetchKind::Reload, None, anime, registry, fetch_tx,
                    )
                    .await;
                } else {
                    let available: Vec<&str> =
                        state.servers.iter().map(|s| s.name.as_str()).collect();
                    self.show_text(
                        client,
                        &format!(
                            "Server '{server}' not available. Available: {}",
                            available.join(", ")
                        ),
                        3000,
                    )
                    .await;
                }
            }
            "select-quality" => {
                let quality = match rest.first().copied() {
                    Some("360") => Some(StreamQuality::Q360),
                    Some("480") => Some(StreamQuality::Q480),
                    Some("720") => Some(StreamQuality::Q720),
                    Some("1080") => Some(StreamQuality::Q1080),
                    _ => None,
                };
                match quality {
                    Some(quality) => {
                        state.quality = quality;
                        if let Some(url) = state.stream_url() {
                            state.reset_timers();
                            self.show_text(
                                client,
                                &format!("Switching to {}p", quality.as_str()),
                                2000,
                            )
                            .await;
                            let _ = client
                                .send_command(vec![json!("loadfile"), json!(url)])
                                .await;
                        }
                    }
                    None => {
                        self.show_text(client, "Invalid quality (360/480/720/1080)", 3000)
                            .await;
                    }
                }
            }
            other => debug!(token = other, "unhandled client-message"),
        }
    }

    /// Navigate-or-fetch: reject when a fetch is already in flight, else
    /// flag the session busy and spawn the background worker.
    #[allow(clippy::too_many_arguments)]
    async fn request_episode(
        &self,
        client: &IpcClient,
        state: &mut PlayerState,
        kind: FetchKind,
        custom_episode: Option<String>,
        anime: &Option<Anime>,
        registry: &Option<Arc<MediaRegistry>>,
        fetch_tx: &mpsc::UnboundedSender<FetchOutcome>,
    ) {
        if state.fetching {
            self.show_text(client, "Player is busy. Please wait.", 2000).await;
            return;
        }
        state.fetching = true;
        self.show_text(client, &format!("Fetching {} episode...", kind.label()), 2000)
            .await;

        let tx = fetch_tx.clone();
        let provider = Arc::clone(&self.provider);
        let current_episode = state.episode.clone();
        let translation = state.translation_type;
        let query = state.query.clone();
        let quality = state.quality;
        let media_id = state.media_item.as_ref().map(|m| m.id);

        if let Some(anime) = anime.clone() {
            tokio::spawn(async move {
                let outcome = fetch_streams(
                    provider,
                    anime,
                    query,
                    current_episode,
                    translation,
                    quality,
                    kind,
                    custom_episode,
                )
                .await;
                let _ = tx.send(outcome);
            });
        } else if let (Some(registry), Some(media_id)) = (registry.clone(), media_id) {
            tokio::spawn(async move {
                let outcome =
                    fetch_local_file(registry, media_id, current_episode, kind, custom_episode);
                let _ = tx.send(outcome);
            });
        } else {
            state.fetching = false;
            self.show_text(client, "No episode source available.", 2000).await;
        }
    }

    async fn handle_fetch_outcome(
        &self,
        client: &IpcClient,
        state: &mut PlayerState,
        outcome: FetchOutcome,
    ) {
        state.fetching = false;
        match outcome {
            FetchOutcome::Streams { episode, servers } => {
                state.episode = episode;
                state.servers = servers;
                state.local_path = None;
                state.reset_timers();
                self.show_text(client, &format!("Fetched {}", state.episode_title()), 2000)
                    .await;
                if let Some(url) = state.stream_url() {
                    let _ = client
                        .send_command(vec![json!("loadfile"), json!(url)])
                        .await;
                }
            }
            FetchOutcome::LocalFile { episode, path } => {
                state.episode = episode;
                state.servers = Vec::new();
                state.reset_timers();
                let display = path.display().to_string();
                state.local_path = Some(path);
                self.show_text(client, &format!("Fetched {display}"), 2000).await;
                let _ = client
                    .send_command(vec![json!("loadfile"), json!(display)])
                    .await;
            }
            FetchOutcome::Error { message } => {
                self.show_text(client, &format!("Error: {message}"), 3000).await;
            }
        }
    }

    /// On `file-loaded`: nothing for the launch file (mpv already got its
    /// flags on the command line); for every later file seek to zero, set
    /// the window title and side-load subtitles with the first selected.
    async fn configure_loaded_file(&self, client: &IpcClient, state: &mut PlayerState) {
        if state.first_file {
            state.first_file = false;
            return;
        }

        let _ = client
            .send_command(vec![json!("seek"), json!(0), json!("absolute")])
            .await;
        let _ = client
            .send_command(vec![
                json!("set_property"),
                json!("title"),
                json!(state.episode_title()),
            ])
            .await;

        for (i, sub_url) in state.subtitles().iter().enumerate() {
            let flag = if i == 0 { "select" } else { "auto" };
            let _ = client
                .send_command(vec![json!("sub-add"), json!(sub_url), json!(flag)])
                .await;
        }
    }
}

/// Ask before silently downgrading a requested IPC session.
fn confirm_fallback() -> bool {
    eprint!("Failed to play with IPC. Continue without it? [Y/n] ");
    let mut answer = String::new();
    let _ = std::io::stdin().read_line(&mut answer);
    !answer.trim().eq_ignore_ascii_case("n")
}

fn target_episode(
    available: &[String],
    current: &str,
    kind: FetchKind,
    custom: Option<&str>,
) -> Result<String, String> {
    if available.is_empty() {
        return Err("No episodes available.".to_string());
    }
    let index = available.iter().position(|e| e == current);
    match kind {
        FetchKind::Next => {
            let index = index.ok_or_else(|| "Current episode unknown.".to_string())?;
            if index + 1 >= available.len() {
                return Err("Already at the last episode.".to_string());
            }
            Ok(available[index + 1].clone())
        }
        FetchKind::Previous => {
            let index = index.ok_or_else(|| "Current episode unknown.".to_string())?;
            if index == 0 {
                return Err("Already at first episode.".to_string());
            }
            Ok(available[index - 1].clone())
        }
        FetchKind::Reload => Ok(current.to_string()),
        FetchKind::Custom => {
            let wanted = custom.ok_or_else(|| "No episode given.".to_string())?;
            if available.iter().any(|e| e == wanted) {
                Ok(wanted.to_string())
            } else {
                Err(format!("Invalid episode. Available: {}", available.join(", ")))
            }
        }
    }
}

/// Streaming fetch path: resolve the target episode from the provider's
/// episode list and collect its servers (the blocking network part, safely
/// off the controller loop).
#[allow(clippy::too_many_arguments)]
async fn fetch_streams(
    provider: Arc<dyn AnimeProvider>,
    anime: Anime,
    query: String,
    current_episode: String,
    translation: TranslationType,
    _quality: StreamQuality,
    kind: FetchKind,
    custom_episode: Option<String>,
) -> FetchOutcome {
    let available = anime.episodes.for_translation(translation);
    let target = match target_episode(available, &current_episode, kind, custom_episode.as_deref())
    {
        Ok(target) => target,
        Err(message) => return FetchOutcome::Error { message },
    };

    let stream = provider
        .episode_streams(&EpisodeStreamsParams {
            anime_id: anime.id.clone(),
            query,
            episode: target.clone(),
            translation_type: translation,
            quality: None,
            server: None,
            subtitles: true,
        })
        .await;

    match stream {
        Ok(Some(stream)) => {
            use futures::StreamExt;
            let servers: Vec<Server> = stream.collect().await;
            if servers.is_empty() {
                FetchOutcome::Error {
                    message: format!("No streams found for episode {target}"),
                }
            } else {
                FetchOutcome::Streams {
                    episode: target,
                    servers,
                }
            }
        }
        Ok(None) => FetchOutcome::Error {
            message: format!("No streams found for episode {target}"),
        },
        Err(err) => {
            error!(error = %err, "episode fetch task failed");
            FetchOutcome::Error {
                message: err.to_string(),
            }
        }
    }
}

/// Local-downloads fetch path: the episode list is whatever the registry has
/// COMPLETED with a file still on disk.
fn fetch_local_file(
    registry: Arc<MediaRegistry>,
    media_id: i64,
    current_episode: String,
    kind: FetchKind,
    custom_episode: Option<String>,
) -> FetchOutcome {
    let Some(record) = registry.get_media_record(media_id) else {
        return FetchOutcome::Error {
            message: "No downloaded episodes found for this anime.".to_string(),
        };
    };

    let mut downloaded: Vec<(String, std::path::PathBuf)> = record
        .media_episodes
        .iter()
        .filter(|e| e.download_status == crate::models::registry::DownloadStatus::Completed)
        .filter_map(|e| {
            let path = e.file_path.clone()?;
            path.exists().then(|| (e.episode_number.clone(), path))
        })
        .collect();
    downloaded.sort_by(|a, b| episode_sort_key(&a.0).total_cmp(&episode_sort_key(&b.0)));

    let available: Vec<String> = downloaded.iter().map(|(e, _)| e.clone()).collect();
    match target_episode(&available, &current_episode, kind, custom_episode.as_deref()) {
        Ok(target) => {
            let path = downloaded
                .into_iter()
                .find(|(e, _)| *e == target)
                .map(|(_, p)| p)
                .expect("target comes from the available list");
            FetchOutcome::LocalFile {
                episode: target,
                path,
            }
        }
        Err(message) => FetchOutcome::Error { message },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn responses_and_events_classify_by_fields() {
        let response = json!({"request_id": 3, "error": "success"});
        assert!(matches!(
            classify(response),
            Classified::Response { request_id: 3, .. }
        ));

        // request_id alone is not enough: both fields are required.
        let event = json!({"request_id": 3, "event": "property-change"});
        assert!(matches!(classify(event), Classified::Event(_)));

        let plain_event = json!({"event": "file-loaded"});
        assert!(matches!(classify(plain_event), Classified::Event(_)));
    }

    #[test]
    fn target_episode_enforces_bounds() {
        let eps: Vec<String> = ["1", "2", "3"].map(String::from).to_vec();

        assert_eq!(target_episode(&eps, "1", FetchKind::Next, None).unwrap(), "2");
        assert_eq!(
            target_episode(&eps, "2", FetchKind::Previous, None).unwrap(),
            "1"
        );
        assert_eq!(
            target_episode(&eps, "2", FetchKind::Reload, None).unwrap(),
            "2"
        );
        assert!(target_episode(&eps, "3", FetchKind::Next, None).is_err());
        assert!(target_episode(&eps, "1", FetchKind::Previous, None).is_err());
        assert_eq!(
            target_episode(&eps, "1", FetchKind::Custom, Some("3")).unwrap(),
            "3"
        );
        assert!(target_episode(&eps, "1", FetchKind::Custom, Some("9")).is_err());
    }

    #[tokio::test]
    async fn commands_round_trip_over_a_socket_pair() {
        let dir = tempfile::tempdir().unwrap();
        let socket_path = dir.path().join("mpv.sock");
        let listener = tokio::net::UnixListener::bind(&socket_path).unwrap();

        // Fake mpv: answer every command with error=success, then push one
        // event.
        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let (read_half, mut write_half) = stream.into_split();
            let mut lines = BufReader::new(read_half).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                let request: Value = serde_json::from_str(&line).unwrap();
                let id = request["request_id"].as_u64().unwrap();
                let response = format!("{}\n", json!({"request_id": id, "error": "success"}));
                write_half.write_all(response.as_bytes()).await.unwrap();
                if request["command"][0] == "quit" {
                    break;
                }
                let event = format!("{}\n", json!({"event": "property-change", "name": "time-pos", "data": 4.2}));
                write_half.write_all(event.as_bytes()).await.unwrap();
            }
        });

        let (client, mut events) = IpcClient::connect(
            socket_path.to_str().unwrap(),
            Duration::from_secs(2),
            Duration::from_secs(2),
        )
        .await
        .unwrap();

        let response = client
            .send_command(vec![json!("observe_property"), json!(1), json!("time-pos")])
            .await
            .unwrap();
        assert_eq!(response["error"], "success");

        let event = events.recv().await.unwrap();
        assert_eq!(event["name"], "time-pos");

        let _ = client.send_command(vec![json!("quit")]).await;
        client.shutdown().await;
        let _ = server.await;
    }

    #[tokio::test]
    async fn command_timeout_is_soft() {
        let dir = tempfile::tempdir().unwrap();
        let socket_path = dir.path().join("mpv.sock");
        let listener = tokio::net::UnixListener::bind(&socket_path).unwrap();

        // A server that never answers.
        let server = tokio::spawn(async move {
            let (_stream, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(5)).await;
        });

        let (client, _events) = IpcClient::connect(
            socket_path.to_str().unwrap(),
            Duration::from_secs(2),
            Duration::from_millis(100),
        )
        .await
        .unwrap();

        let err = client.send_command(vec![json!("get_property"), json!("pause")]).await;
        assert!(err.is_err());
        client.shutdown().await;
        server.abort();
    }
}
