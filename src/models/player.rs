use std::collections::HashMap;

/// Everything a player backend needs to start one playback.
#[derive(Debug, Clone, Default)]
pub struct PlayerParams {
    pub url: String,
    pub episode: String,
    /// Query that located the anime; providers may need it again mid-session.
    pub query: String,
    pub title: Option<String>,
    pub subtitles: Vec<String>,
    pub headers: HashMap<String, String>,
    /// "HH:MM:SS" resume offset.
    pub start_time: Option<String>,
    pub syncplay: bool,
}

/// What came back from a playback session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlayerResult {
    pub episode: String,
    /// "HH:MM:SS" where playback stopped, when known.
    pub stop_time: Option<String>,
    /// "HH:MM:SS" total duration, when known.
    pub total_time: Option<String>,
}

impl PlayerResult {
    pub fn bare(episode: &str) -> Self {
        Self {
            episode: episode.to_string(),
            stop_time: None,
            total_time: None,
        }
    }
}
