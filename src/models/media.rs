//! Generic catalog data model.
//!
//! Every catalog backend (AniList GraphQL, Jikan REST) maps its wire types
//! into these structures; the rest of the engine never sees remote JSON.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum MediaType {
    #[default]
    #[serde(rename = "ANIME")]
    Anime,
    #[serde(rename = "MANGA")]
    Manga,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MediaStatus {
    #[default]
    Finished,
    Releasing,
    NotYetReleased,
    Cancelled,
    Hiatus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MediaFormat {
    #[default]
    Tv,
    TvShort,
    Movie,
    Special,
    Ova,
    Ona,
    Music,
    Novel,
    OneShot,
    Manga,
}

/// List status as the user's catalog tracks it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UserMediaListStatus {
    Watching,
    Planning,
    Completed,
    Dropped,
    Paused,
    Repeating,
}

impl UserMediaListStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Watching => "watching",
            Self::Planning => "planning",
            Self::Completed => "completed",
            Self::Dropped => "dropped",
            Self::Paused => "paused",
            Self::Repeating => "repeating",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MediaSort {
    Title,
    #[default]
    SearchMatch,
    ScoreDesc,
    PopularityDesc,
    FavouritesDesc,
    TrendingDesc,
    UpdatedAtDesc,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MediaSeason {
    Winter,
    Spring,
    Summer,
    Fall,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NotificationType {
    Airing,
    RelatedMediaAddition,
    MediaDataChange,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct MediaTitle {
    pub english: Option<String>,
    pub romaji: Option<String>,
    pub native: Option<String>,
}

impl MediaTitle {
    /// Display title, preferring english.
    pub fn preferred(&self) -> &str {
        self.english
            .as_deref()
            .or(self.romaji.as_deref())
            .or(self.native.as_deref())
            .unwrap_or("Unknown")
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct MediaImage {
    pub large: Option<String>,
    pub medium: Option<String>,
    pub extra_large: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaTrailer {
    pub id: String,
    pub site: String,
    pub thumbnail_url: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AiringSchedule {
    pub episode: i32,
    pub airing_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AiringScheduleItem {
    pub episode: i32,
    pub airing_at: Option<DateTime<Utc>>,
    pub time_until_airing: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Studio {
    pub id: Option<i64>,
    pub name: String,
    pub is_animation_studio: Option<bool>,
}

/// Descriptive tag with its 0-100 relevance rank.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaTagItem {
    pub name: String,
    pub rank: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamingEpisode {
    pub title: String,
    pub thumbnail: Option<String>,
}

/// The user's list entry as embedded in a catalog response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct UserListItem {
    pub id: Option<i64>,
    pub status: Option<UserMediaListStatus>,
    pub progress: Option<i32>,
    pub score: Option<f64>,
    pub repeat: Option<i32>,
    pub notes: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// Canonical description of a title as known by the catalog.
///
/// Mutated only by whole-object replacement.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MediaItem {
    pub id: i64,
    pub id_mal: Option<i64>,
    pub title: MediaTitle,
    #[serde(rename = "type", default)]
    pub media_type: MediaType,
    #[serde(default)]
    pub status: MediaStatus,
    pub format: Option<MediaFormat>,

    pub cover_image: Option<MediaImage>,
    pub banner_image: Option<String>,
    pub trailer: Option<MediaTrailer>,

    pub description: Option<String>,
    pub episodes: Option<i32>,
    /// Per-episode duration in minutes.
    pub duration: Option<i32>,
    #[serde(default)]
    pub genres: Vec<String>,
    #[serde(default)]
    pub tags: Vec<MediaTagItem>,
    #[serde(default)]
    pub studios: Vec<Studio>,
    #[serde(default)]
    pub synonyms: Vec<String>,

    pub average_score: Option<f64>,
    pub popularity: Option<i64>,
    pub favourites: Option<i64>,

    pub start_date: Option<DateTime<Utc>>,
    pub end_date: Option<DateTime<Utc>>,

    pub next_airing: Option<AiringSchedule>,

    /// Episode number → streaming episode info, where the catalog knows it.
    #[serde(default)]
    pub streaming_episodes: HashMap<String, StreamingEpisode>,

    pub user_status: Option<UserListItem>,
}

impl MediaItem {
    /// Minimal item for code paths that only need an identity.
    pub fn with_id_and_title(id: i64, english: &str, romaji: &str) -> Self {
        Self {
            id,
            id_mal: None,
            title: MediaTitle {
                english: Some(english.to_string()),
                romaji: Some(romaji.to_string()),
                native: None,
            },
            media_type: MediaType::Anime,
            status: MediaStatus::Finished,
            format: None,
            cover_image: None,
            banner_image: None,
            trailer: None,
            description: None,
            episodes: None,
            duration: None,
            genres: Vec::new(),
            tags: Vec::new(),
            studios: Vec::new(),
            synonyms: Vec::new(),
            average_score: None,
            popularity: None,
            favourites: None,
            start_date: None,
            end_date: None,
            next_airing: None,
            streaming_episodes: HashMap::new(),
            user_status: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    pub id: i64,
    #[serde(rename = "type")]
    pub kind: NotificationType,
    pub episode: Option<i32>,
    #[serde(default)]
    pub contexts: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub media: MediaItem,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageInfo {
    pub total: usize,
    pub current_page: usize,
    pub has_next_page: bool,
    pub per_page: usize,
}

impl Default for PageInfo {
    fn default() -> Self {
        Self {
            total: 0,
            current_page: 1,
            has_next_page: false,
            per_page: 15,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct MediaSearchResult {
    pub page_info: PageInfo,
    pub media: Vec<MediaItem>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserProfile {
    pub id: i64,
    pub name: String,
    pub avatar_url: Option<String>,
    pub banner_url: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaReview {
    pub summary: Option<String>,
    pub body: String,
    pub author: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Character {
    pub id: Option<i64>,
    pub name: String,
    pub image_url: Option<String>,
    pub description: Option<String>,
    pub gender: Option<String>,
    pub age: Option<String>,
}

// ---------------------------------------------------------------------------
// Query parameter types

/// Search parameters shared by the remote catalog and the local registry
/// query engine.
#[derive(Debug, Clone, Default)]
pub struct MediaSearchParams {
    pub query: Option<String>,
    pub page: Option<usize>,
    pub per_page: Option<usize>,
    pub sort: Option<MediaSort>,
    pub id_in: Option<Vec<i64>>,
    pub genre_in: Option<Vec<String>>,
    pub genre_not_in: Option<Vec<String>>,
    pub tag_in: Option<Vec<String>>,
    pub tag_not_in: Option<Vec<String>>,
    pub status: Option<MediaStatus>,
    pub status_in: Option<Vec<MediaStatus>>,
    pub status_not_in: Option<Vec<MediaStatus>>,
    pub popularity_greater: Option<i64>,
    pub popularity_lesser: Option<i64>,
    pub score_greater: Option<f64>,
    pub score_lesser: Option<f64>,
    pub season: Option<MediaSeason>,
    pub season_year: Option<i32>,
    pub start_date_greater: Option<i64>,
    pub start_date_lesser: Option<i64>,
    pub end_date_greater: Option<i64>,
    pub end_date_lesser: Option<i64>,
    pub format_in: Option<Vec<MediaFormat>>,
    pub media_type: Option<MediaType>,
    pub on_list: Option<bool>,
}

#[derive(Debug, Clone, Default)]
pub struct UserMediaListSearchParams {
    pub status: Option<UserMediaListStatus>,
    pub page: Option<usize>,
    pub per_page: Option<usize>,
    pub media_type: Option<MediaType>,
}

#[derive(Debug, Clone, Default)]
pub struct UpdateUserMediaListEntryParams {
    pub media_id: i64,
    pub status: Option<UserMediaListStatus>,
    pub progress: Option<String>,
    pub score: Option<f64>,
}
