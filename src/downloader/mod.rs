//! Episode downloader.
//!
//! Routes by URL shape: magnet/torrent links go to an external torrent
//! fetcher, HLS playlists go through ffmpeg, everything else streams over
//! HTTP in chunks with progress hooks. Destination files are
//! `{downloads_dir}/{sanitized anime}/{sanitized episode}{ext}`.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::OnceLock;

use anyhow::{Context, Result, bail};
use futures::StreamExt;
use regex::Regex;
use reqwest::Client;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

use crate::config::DownloadsConfig;
use crate::constants::random_user_agent;
use crate::utils::fs::sanitize_filename;

/// `magnet:?xt=urn:btih:…` or a `.torrent` URL.
pub fn torrent_regex() -> &'static Regex {
    static INSTANCE: OnceLock<Regex> = OnceLock::new();
    INSTANCE.get_or_init(|| {
        Regex::new(
            r"(?i)^(?:magnet:\?xt=urn:btih:[a-z0-9]{32,40}.*|https?://.*\.torrent)$",
        )
        .expect("Invalid Regex")
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProgressStatus {
    Downloading,
    Finished,
    Error,
}

#[derive(Debug, Clone)]
pub struct DownloadProgress {
    pub downloaded_bytes: u64,
    pub total_bytes: Option<u64>,
    pub filename: String,
    pub status: ProgressStatus,
    pub error: Option<String>,
}

/// Progress hooks may fail; failures are logged and never interrupt the
/// download.
pub type ProgressHook = Arc<dyn Fn(&DownloadProgress) -> Result<()> + Send + Sync>;

#[derive(Clone, Default)]
pub struct DownloadParams {
    pub url: String,
    pub anime_title: String,
    pub episode_title: String,
    pub subtitles: Vec<String>,
    pub headers: HashMap<String, String>,
    pub force_unknown_ext: bool,
    pub silent: bool,
    pub merge: bool,
    pub clean: bool,
    /// When the target exists: false keeps it (treated as already done),
    /// true asks on the terminal.
    pub prompt: bool,
    pub progress_hooks: Vec<ProgressHook>,
    /// Checked between chunk writes; flipping it aborts the download.
    pub cancelled: Option<Arc<AtomicBool>>,
}

#[derive(Debug, Clone, Default)]
pub struct DownloadResult {
    pub success: bool,
    pub video_path: Option<PathBuf>,
    pub subtitle_paths: Vec<PathBuf>,
    pub merged_path: Option<PathBuf>,
    pub anime_title: String,
    pub episode_title: String,
    pub error_message: Option<String>,
}

pub struct Downloader {
    client: Client,
    config: DownloadsConfig,
}

impl Downloader {
    pub fn new(config: DownloadsConfig) -> Self {
        let mut builder = Client::builder().user_agent(random_user_agent());
        if config.no_check_certificate {
            builder = builder.danger_accept_invalid_certs(true);
        }
        Self {
            client: builder.build().unwrap_or_else(|_| Client::new()),
            config,
        }
    }

    pub async fn download(&self, params: DownloadParams) -> DownloadResult {
        let mut result = DownloadResult {
            anime_title: params.anime_title.clone(),
            episode_title: params.episode_title.clone(),
            ..Default::default()
        };

        match self.download_inner(&params).await {
            Ok((video_path, subtitle_paths)) => {
                result.video_path = Some(video_path.clone());
                result.subtitle_paths = subtitle_paths.clone();
                if params.merge && !subtitle_paths.is_empty() {
                    match self
                        .merge_subtitles(&params, &video_path, &subtitle_paths)
                        .await
                    {
                        Ok(merged) => result.merged_path = merged,
                        Err(err) => {
                            warn!(error = %err, "subtitle merge failed");
                            result.error_message = Some(err.to_string());
                        }
                    }
                }
                result.success = true;
            }
            Err(err) => {
                result.error_message = Some(err.to_string());
            }
        }
        result
    }

    async fn download_inner(&self, params: &DownloadParams) -> Result<(PathBuf, Vec<PathBuf>)> {
        let dest_dir = self.destination_dir(&params.anime_title);
        tokio::fs::create_dir_all(&dest_dir).await?;

        let video_path = if torrent_regex().is_match(&params.url) {
            self.download_torrent(params, &dest_dir).await?
        } else if self.is_hls(&params.url) {
            self.download_hls(params, &dest_dir).await?
        } else {
            self.download_http(params, &dest_dir).await?
        };

        let mut subtitle_paths = Vec::new();
        if !params.subtitles.is_empty() {
            subtitle_paths = self.download_subtitles(params, &dest_dir).await;
        }

        Ok((video_path, subtitle_paths))
    }

    fn destination_dir(&self, anime_title: &str) -> PathBuf {
        self.config
            .downloads_dir
            .join(sanitize_filename(anime_title, self.config.restricted_filenames))
    }

    fn episode_stem(&self, episode_title: &str) -> String {
        sanitize_filename(episode_title, self.config.restricted_filenames)
    }

    fn is_hls(&self, url: &str) -> bool {
        let path = url::Url::parse(url)
            .map(|u| u.path().to_string())
            .unwrap_or_else(|_| url.to_string());
        path.ends_with(".m3u8") || self.config.force_ffmpeg
    }

    /// Extension for the target file: URL path first, then Content-Type,
    /// then Content-Disposition, then `.mp4`.
    async fn file_extension(&self, url: &str, headers: &HashMap<String, String>) -> String {
        if let Ok(parsed) = url::Url::parse(url) {
            let path = Path::new(parsed.path());
            if let Some(ext) = path.extension().and_then(|e| e.to_str()) {
                return format!(".{ext}");
            }
        }

        let mut request = self.client.head(url);
        for (key, value) in headers {
            request = request.header(key, value);
        }
        if let Ok(response) = request.send().await {
            if let Some(content_type) = response
                .headers()
                .get(reqwest::header::CONTENT_TYPE)
                .and_then(|v| v.to_str().ok())
            {
                let essence = content_type.split(';').next().unwrap_or_default().trim();
                match essence {
                    "video/mp4" => return ".mp4".to_string(),
                    "video/webm" => return ".webm".to_string(),
                    "video/x-matroska" => return ".mkv".to_string(),
                    "video/x-msvideo" => return ".avi".to_string(),
                    "video/quicktime" => return ".mov".to_string(),
                    _ => {
                        if let Some(exts) = mime_guess::get_mime_extensions_str(essence) {
                            if let Some(ext) = exts.first() {
                                if essence.starts_with("video/") {
                                    return format!(".{ext}");
                                }
                            }
                        }
                    }
                }
            }
            if let Some(disposition) = response
                .headers()
                .get(reqwest::header::CONTENT_DISPOSITION)
                .and_then(|v| v.to_str().ok())
            {
                if let Some(filename) = disposition
                    .split("filename=")
                    .nth(1)
                    .map(|f| f.trim_matches(['"', '\'', ' '].as_slice()))
                {
                    if let Some(ext) = Path::new(filename).extension().and_then(|e| e.to_str()) {
                        return format!(".{ext}");
                    }
                }
            }
        }

        ".mp4".to_string()
    }

    /// Existing-target policy: keep without prompt, otherwise ask.
    fn keep_existing(&self, target: &Path, prompt: bool) -> bool {
        if !target.exists() {
            return false;
        }
        if !prompt {
            info!(path = %target.display(), "file already exists, keeping");
            return true;
        }
        eprint!("File exists: {}. Overwrite? [y/N] ", target.display());
        let mut answer = String::new();
        let _ = std::io::stdin().read_line(&mut answer);
        !answer.trim().eq_ignore_ascii_case("y")
    }

    async fn download_http(&self, params: &DownloadParams, dest_dir: &Path) -> Result<PathBuf> {
        let mut extension = self.file_extension(&params.url, &params.headers).await;
        if params.force_unknown_ext && extension == ".mp4" {
            extension = ".unknown_video".to_string();
        }
        let target = dest_dir.join(format!("{}{extension}", self.episode_stem(&params.episode_title)));

        if self.keep_existing(&target, params.prompt) {
            return Ok(target);
        }

        let mut request = self.client.get(&params.url);
        for (key, value) in &params.headers {
            request = request.header(key, value);
        }

        let response = request
            .send()
            .await
            .context("failed to open download stream")?
            .error_for_status()
            .context("download request rejected")?;
        let total_bytes = response.content_length();
        let filename = target
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();

        if !params.silent {
            info!(file = %filename, "starting download");
        }

        let tmp_path = target.with_extension(format!(
            "{}.part",
            target
                .extension()
                .and_then(|e| e.to_str())
                .unwrap_or("bin")
        ));
        let mut file = tokio::fs::File::create(&tmp_path).await?;
        let mut downloaded: u64 = 0;
        let mut stream = response.bytes_stream();

        let outcome: Result<()> = async {
            while let Some(chunk) = stream.next().await {
                if let Some(cancelled) = &params.cancelled {
                    if cancelled.load(Ordering::Relaxed) {
                        bail!("download cancelled");
                    }
                }
                let chunk = chunk.context("stream interrupted")?;
                file.write_all(&chunk).await?;
                downloaded += chunk.len() as u64;
                run_hooks(
                    &params.progress_hooks,
                    &DownloadProgress {
                        downloaded_bytes: downloaded,
                        total_bytes,
                        filename: filename.clone(),
                        status: ProgressStatus::Downloading,
                        error: None,
                    },
                );
            }
            Ok(())
        }
        .await;

        if let Err(err) = outcome {
            let _ = tokio::fs::remove_file(&tmp_path).await;
            run_hooks(
                &params.progress_hooks,
                &DownloadProgress {
                    downloaded_bytes: downloaded,
                    total_bytes,
                    filename: filename.clone(),
                    status: ProgressStatus::Error,
                    error: Some(err.to_string()),
                },
            );
            return Err(err);
        }

        file.sync_all().await?;
        drop(file);
        tokio::fs::rename(&tmp_path, &target).await?;

        run_hooks(
            &params.progress_hooks,
            &DownloadProgress {
                downloaded_bytes: downloaded,
                total_bytes: total_bytes.or(Some(downloaded)),
                filename,
                status: ProgressStatus::Finished,
                error: None,
            },
        );

        // ".unknown_video" markers are normalized after the fact.
        if target.extension().and_then(|e| e.to_str()) == Some("unknown_video") {
            let normalized = target.with_extension("mp4");
            tokio::fs::rename(&target, &normalized).await?;
            return Ok(normalized);
        }
        if !params.silent {
            info!(path = %target.display(), "download completed");
        }
        Ok(target)
    }

    /// HLS playlists always go through the transcoder. A raw byte dump of an
    /// .m3u8 stream would yield a useless file, so a missing ffmpeg is a
    /// hard error here.
    async fn download_hls(&self, params: &DownloadParams, dest_dir: &Path) -> Result<PathBuf> {
        let ffmpeg = which("ffmpeg")
            .context("ffmpeg is required to download HLS streams; please install it")?;

        let extension = if self.config.hls_use_mpegts { ".ts" } else { ".mp4" };
        let target = dest_dir.join(format!("{}{extension}", self.episode_stem(&params.episode_title)));
        if self.keep_existing(&target, params.prompt) {
            return Ok(target);
        }

        let mut cmd = tokio::process::Command::new(ffmpeg);
        cmd.arg("-hide_banner").arg("-y");
        if !params.headers.is_empty() {
            let header_blob: String = params
                .headers
                .iter()
                .map(|(k, v)| format!("{k}: {v}\r\n"))
                .collect();
            cmd.arg("-headers").arg(header_blob);
        }
        cmd.arg("-i").arg(&params.url);
        if self.config.hls_use_h264 {
            cmd.arg("-c:v").arg("libx264").arg("-c:a").arg("copy");
        } else {
            cmd.arg("-c").arg("copy");
        }
        if self.config.hls_use_mpegts {
            cmd.arg("-f").arg("mpegts");
        }
        cmd.arg(&target);

        debug!(url = %params.url, "transcoding HLS stream");
        let output = cmd.output().await.context("failed to spawn ffmpeg")?;
        if !output.status.success() {
            let _ = tokio::fs::remove_file(&target).await;
            bail!(
                "ffmpeg failed: {}",
                String::from_utf8_lossy(&output.stderr)
                    .lines()
                    .last()
                    .unwrap_or("unknown error")
            );
        }
        Ok(target)
    }

    async fn download_torrent(&self, params: &DownloadParams, dest_dir: &Path) -> Result<PathBuf> {
        let webtorrent = which("webtorrent")
            .context("webtorrent-cli is required to download torrents; please install it")?;

        let output = tokio::process::Command::new(webtorrent)
            .arg("download")
            .arg(&params.url)
            .arg("--out")
            .arg(dest_dir)
            .output()
            .await
            .context("failed to spawn webtorrent")?;
        if !output.status.success() {
            bail!(
                "webtorrent failed: {}",
                String::from_utf8_lossy(&output.stderr)
                    .lines()
                    .last()
                    .unwrap_or("unknown error")
            );
        }

        // The torrent names its own payload; take the newest file.
        let mut newest: Option<(std::time::SystemTime, PathBuf)> = None;
        let mut entries = tokio::fs::read_dir(dest_dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.is_file() {
                if let Ok(modified) = entry.metadata().await.and_then(|m| m.modified()) {
                    if newest.as_ref().map(|(t, _)| modified > *t).unwrap_or(true) {
                        newest = Some((modified, path));
                    }
                }
            }
        }
        newest
            .map(|(_, path)| path)
            .context("torrent download produced no files")
    }

    async fn download_subtitles(&self, params: &DownloadParams, dest_dir: &Path) -> Vec<PathBuf> {
        let stem = self.episode_stem(&params.episode_title);
        let mut paths = Vec::new();

        for (i, sub_url) in params.subtitles.iter().enumerate() {
            let mut request = self.client.get(sub_url);
            for (key, value) in &params.headers {
                request = request.header(key, value);
            }
            let response = match request.send().await.and_then(|r| r.error_for_status()) {
                Ok(response) => response,
                Err(err) => {
                    warn!(index = i, error = %err, "failed to download subtitle");
                    continue;
                }
            };

            let ext = url::Url::parse(sub_url)
                .ok()
                .and_then(|u| {
                    Path::new(u.path())
                        .extension()
                        .and_then(|e| e.to_str())
                        .map(str::to_string)
                })
                .unwrap_or_else(|| "srt".to_string());
            let filename = if params.subtitles.len() == 1 {
                format!("{stem}.{ext}")
            } else {
                format!("{stem}.{i}.{ext}")
            };
            let path = dest_dir.join(filename);

            match response.bytes().await {
                Ok(bytes) => match tokio::fs::write(&path, &bytes).await {
                    Ok(()) => {
                        debug!(path = %path.display(), "downloaded subtitle");
                        paths.push(path);
                    }
                    Err(err) => warn!(index = i, error = %err, "failed to write subtitle"),
                },
                Err(err) => warn!(index = i, error = %err, "failed to read subtitle body"),
            }
        }
        paths
    }

    /// Mux the video with every subtitle file into an mkv. Streams are
    /// copied; the result lands in a temp file in the same directory and is
    /// renamed over the final target.
    async fn merge_subtitles(
        &self,
        params: &DownloadParams,
        video_path: &Path,
        subtitle_paths: &[PathBuf],
    ) -> Result<Option<PathBuf>> {
        let ffmpeg = which("ffmpeg")
            .context("please install ffmpeg in order to merge subtitles")?;

        let stem = video_path
            .file_stem()
            .and_then(|s| s.to_str())
            .context("video path has no stem")?;
        let final_path = video_path.with_file_name(format!("{stem}.mkv"));
        let tmp_path = video_path.with_file_name(format!(".{stem}.merge.mkv"));

        let mut cmd = tokio::process::Command::new(ffmpeg);
        cmd.arg("-hide_banner").arg("-y").arg("-i").arg(video_path);
        for sub in subtitle_paths {
            cmd.arg("-i").arg(sub);
        }
        cmd.arg("-c").arg("copy").arg("-map").arg("0:v").arg("-map").arg("0:a");
        for i in 1..=subtitle_paths.len() {
            cmd.arg("-map").arg(format!("{i}:s"));
        }
        cmd.arg(&tmp_path);

        info!(video = %video_path.display(), subs = subtitle_paths.len(), "merging subtitles");
        let output = cmd.output().await.context("failed to spawn ffmpeg")?;
        if !output.status.success() {
            let _ = tokio::fs::remove_file(&tmp_path).await;
            bail!(
                "ffmpeg merge failed: {}",
                String::from_utf8_lossy(&output.stderr)
                    .lines()
                    .last()
                    .unwrap_or("unknown error")
            );
        }

        tokio::fs::rename(&tmp_path, &final_path).await?;

        if params.clean {
            let _ = tokio::fs::remove_file(video_path).await;
            for sub in subtitle_paths {
                let _ = tokio::fs::remove_file(sub).await;
            }
        }

        info!(path = %final_path.display(), "subtitles merged");
        Ok(Some(final_path))
    }
}

fn run_hooks(hooks: &[ProgressHook], progress: &DownloadProgress) {
    for hook in hooks {
        if let Err(err) = hook(progress) {
            warn!(error = %err, "progress hook failed");
        }
    }
}

fn which(binary: &str) -> Result<PathBuf> {
    let path = std::env::var_os("PATH").unwrap_or_default();
    for dir in std::env::split_paths(&path) {
        let candidate = dir.join(binary);
        if candidate.is_file() {
            return Ok(candidate);
        }
    }
    bail!("'{binary}' not found in PATH")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn torrent_urls_are_recognized() {
        assert!(torrent_regex().is_match(
            "magnet:?xt=urn:btih:aaaabbbbccccddddeeeeffff0000111122223333&dn=x"
        ));
        assert!(torrent_regex().is_match("https://nyaa.si/download/1.torrent"));
        assert!(!torrent_regex().is_match("https://example.com/video.mp4"));
    }

    #[tokio::test]
    async fn extension_prefers_url_path() {
        let downloader = Downloader::new(DownloadsConfig::default());
        let ext = downloader
            .file_extension("https://cdn.example/video/ep1.mkv?sig=abc", &HashMap::new())
            .await;
        assert_eq!(ext, ".mkv");
    }

    #[tokio::test]
    async fn extension_defaults_to_mp4() {
        let downloader = Downloader::new(DownloadsConfig::default());
        // No dot in the path and an unreachable host: falls through to .mp4.
        let ext = downloader
            .file_extension("http://127.0.0.1:1/streams/ep1", &HashMap::new())
            .await;
        assert_eq!(ext, ".mp4");
    }

    #[test]
    fn hls_detection_uses_path_not_query() {
        let downloader = Downloader::new(DownloadsConfig::default());
        assert!(downloader.is_hls("https://cdn.example/master.m3u8?token=x"));
        assert!(!downloader.is_hls("https://cdn.example/video.mp4?playlist=.m3u8"));
    }

    #[test]
    fn failing_hooks_are_isolated() {
        let hook: ProgressHook = Arc::new(|_| anyhow::bail!("hook exploded"));
        run_hooks(
            &[hook],
            &DownloadProgress {
                downloaded_bytes: 1,
                total_bytes: None,
                filename: "x".into(),
                status: ProgressStatus::Downloading,
                error: None,
            },
        );
    }
}
