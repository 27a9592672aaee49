//! Catalog clients.
//!
//! A catalog is the user's remote media-list service. Each backend maps its
//! wire format into the generic model in [`crate::models::media`]; enum
//! values with no generic equivalent map to the nearest documented value or
//! are dropped.

pub mod anilist;
pub mod jikan;

use anyhow::Result;
use async_trait::async_trait;

use crate::models::media::{
    AiringScheduleItem, Character, MediaItem, MediaReview, MediaSearchParams, MediaSearchResult,
    Notification, UpdateUserMediaListEntryParams, UserMediaListSearchParams, UserProfile,
};

/// Uniform catalog operation set.
///
/// Lookups return `Ok(None)` on empty results; only transport and decode
/// failures surface as errors. Mutations report success as `bool`.
#[async_trait]
pub trait MediaApiClient: Send + Sync {
    /// Stores the token on success; clears any stored token on failure.
    async fn authenticate(&mut self, token: &str) -> Option<UserProfile>;

    fn is_authenticated(&self) -> bool;

    async fn get_viewer_profile(&self) -> Result<Option<UserProfile>>;

    async fn search_media(&self, params: &MediaSearchParams) -> Result<Option<MediaSearchResult>>;

    /// Requires authentication; filters by the user's list status.
    async fn search_media_list(
        &self,
        params: &UserMediaListSearchParams,
    ) -> Result<Option<MediaSearchResult>>;

    async fn get_media(&self, media_id: i64) -> Result<Option<MediaItem>>;

    /// Returns true iff the remote accepted the mutation without errors.
    async fn update_list_entry(&self, params: &UpdateUserMediaListEntryParams) -> bool;

    /// Idempotent: deleting an absent entry is not an error.
    async fn delete_list_entry(&self, media_id: i64) -> bool;

    async fn get_recommendations_for(&self, media_id: i64) -> Result<Vec<MediaItem>>;

    async fn get_characters_of(&self, media_id: i64) -> Result<Vec<Character>>;

    async fn get_related_anime_for(&self, media_id: i64) -> Result<Vec<MediaItem>>;

    async fn get_airing_schedule_for(&self, media_id: i64) -> Result<Vec<AiringScheduleItem>>;

    async fn get_reviews_for(&self, media_id: i64) -> Result<Vec<MediaReview>>;

    /// Unread notifications only. Fetching marks them read server-side.
    async fn get_notifications(&self) -> Result<Option<Vec<Notification>>>;
}

/// Factory keyed by the catalog tag from config.
pub fn create_api_client(media_api: &str) -> Result<Box<dyn MediaApiClient>> {
    match media_api {
        "anilist" => Ok(Box::new(anilist::AniListClient::new())),
        "jikan" => Ok(Box::new(jikan::JikanClient::new())),
        other => anyhow::bail!("Unsupported media api: '{other}'"),
    }
}
