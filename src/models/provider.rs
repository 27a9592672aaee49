//! Provider-side data model.
//!
//! Providers are scrapers; their ids are opaque strings and their episode
//! identifiers may be non-integer ("7.5").

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TranslationType {
    Sub,
    Dub,
    Raw,
}

impl TranslationType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Sub => "sub",
            Self::Dub => "dub",
            Self::Raw => "raw",
        }
    }

    /// Sub/dub flip used by the player's translation hot-swap.
    pub fn toggled(self) -> Self {
        match self {
            Self::Dub => Self::Sub,
            _ => Self::Dub,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum StreamQuality {
    #[serde(rename = "360")]
    Q360,
    #[serde(rename = "480")]
    Q480,
    #[default]
    #[serde(rename = "720")]
    Q720,
    #[serde(rename = "1080")]
    Q1080,
}

impl StreamQuality {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Q360 => "360",
            Self::Q480 => "480",
            Self::Q720 => "720",
            Self::Q1080 => "1080",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct AnimeEpisodes {
    #[serde(default)]
    pub sub: Vec<String>,
    #[serde(default)]
    pub dub: Vec<String>,
    #[serde(default)]
    pub raw: Vec<String>,
}

impl AnimeEpisodes {
    pub fn for_translation(&self, translation: TranslationType) -> &[String] {
        match translation {
            TranslationType::Sub => &self.sub,
            TranslationType::Dub => &self.dub,
            TranslationType::Raw => &self.raw,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderSearchResult {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub other_titles: Vec<String>,
    #[serde(default)]
    pub episodes: AnimeEpisodes,
    pub media_type: Option<String>,
    pub poster: Option<String>,
    pub year: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct ProviderPageInfo {
    pub total: Option<usize>,
    pub per_page: Option<usize>,
    pub current_page: Option<usize>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct SearchResults {
    pub page_info: ProviderPageInfo,
    pub results: Vec<ProviderSearchResult>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EpisodeInfo {
    pub id: String,
    pub episode: String,
    pub title: Option<String>,
    pub poster: Option<String>,
    pub duration: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Anime {
    pub id: String,
    pub title: String,
    pub episodes: AnimeEpisodes,
    pub episodes_info: Option<Vec<EpisodeInfo>>,
    pub media_type: Option<String>,
    pub poster: Option<String>,
    pub year: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EpisodeStream {
    pub link: String,
    pub title: Option<String>,
    #[serde(default)]
    pub quality: StreamQuality,
    pub format: Option<String>,
    pub hls: Option<bool>,
    pub mp4: Option<bool>,
    pub priority: Option<i32>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subtitle {
    pub url: String,
    pub language: Option<String>,
}

/// One hosting location for an episode. The links are quality-tagged; the
/// subtitles and headers apply to every link on the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Server {
    pub name: String,
    pub links: Vec<EpisodeStream>,
    pub episode_title: Option<String>,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    #[serde(default)]
    pub subtitles: Vec<Subtitle>,
    #[serde(default)]
    pub audio: Vec<String>,
}

impl Server {
    /// Pick the link closest to the wanted quality, preferring exact matches
    /// and falling back to the first link.
    pub fn best_link(&self, quality: StreamQuality) -> Option<&EpisodeStream> {
        self.links
            .iter()
            .find(|l| l.quality == quality)
            .or_else(|| self.links.first())
    }
}

// ---------------------------------------------------------------------------
// Request parameter types

#[derive(Debug, Clone)]
pub struct SearchParams {
    pub query: String,
    pub translation_type: TranslationType,
}

#[derive(Debug, Clone)]
pub struct AnimeParams {
    pub id: String,
    /// Some providers need the original query to re-derive session state.
    pub query: String,
}

#[derive(Debug, Clone)]
pub struct EpisodeStreamsParams {
    pub anime_id: String,
    pub query: String,
    pub episode: String,
    pub translation_type: TranslationType,
    pub quality: Option<StreamQuality>,
    pub server: Option<String>,
    pub subtitles: bool,
}
