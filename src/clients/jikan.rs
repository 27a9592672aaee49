//! Jikan (MyAnimeList) REST catalog client.
//!
//! Jikan is unauthenticated and read-only: list mutations and notifications
//! report failure/empty, which the trait contract allows.

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use tracing::warn;

use super::MediaApiClient;
use crate::constants::random_user_agent;
use crate::models::media::{
    AiringScheduleItem, Character, MediaFormat, MediaImage, MediaItem, MediaReview,
    MediaSearchParams, MediaSearchResult, MediaStatus, MediaTitle, MediaType, Notification,
    PageInfo, UpdateUserMediaListEntryParams, UserMediaListSearchParams, UserProfile,
};

const JIKAN_API: &str = "https://api.jikan.moe/v4";

#[derive(Deserialize)]
struct JikanImages {
    jpg: Option<JikanImageSet>,
}

#[derive(Deserialize)]
struct JikanImageSet {
    image_url: Option<String>,
    large_image_url: Option<String>,
}

#[derive(Deserialize)]
struct JikanTitle {
    #[serde(rename = "type")]
    kind: String,
    title: String,
}

#[derive(Deserialize)]
struct JikanNamed {
    name: String,
}

#[derive(Deserialize)]
struct JikanAnime {
    mal_id: i64,
    titles: Option<Vec<JikanTitle>>,
    #[serde(rename = "type")]
    format: Option<String>,
    episodes: Option<i32>,
    status: Option<String>,
    duration: Option<String>,
    score: Option<f64>,
    popularity: Option<i64>,
    favorites: Option<i64>,
    synopsis: Option<String>,
    genres: Option<Vec<JikanNamed>>,
    studios: Option<Vec<JikanNamed>>,
    images: Option<JikanImages>,
}

#[derive(Deserialize)]
struct JikanPagination {
    last_visible_page: Option<usize>,
    has_next_page: Option<bool>,
    current_page: Option<usize>,
    items: Option<JikanPaginationItems>,
}

#[derive(Deserialize)]
struct JikanPaginationItems {
    total: Option<usize>,
    per_page: Option<usize>,
}

#[derive(Deserialize)]
struct JikanPage {
    data: Vec<JikanAnime>,
    pagination: Option<JikanPagination>,
}

#[derive(Deserialize)]
struct JikanSingle {
    data: Option<JikanAnime>,
}

fn map_status(status: Option<&str>) -> MediaStatus {
    match status {
        Some("Currently Airing") => MediaStatus::Releasing,
        Some("Not yet aired") => MediaStatus::NotYetReleased,
        _ => MediaStatus::Finished,
    }
}

fn map_format(format: Option<&str>) -> Option<MediaFormat> {
    match format? {
        "TV" => Some(MediaFormat::Tv),
        "Movie" => Some(MediaFormat::Movie),
        "OVA" => Some(MediaFormat::Ova),
        "ONA" => Some(MediaFormat::Ona),
        "Special" => Some(MediaFormat::Special),
        "Music" => Some(MediaFormat::Music),
        _ => None,
    }
}

/// "24 min per ep" → 24.
fn map_duration(duration: Option<&str>) -> Option<i32> {
    duration?
        .split_whitespace()
        .next()
        .and_then(|n| n.parse().ok())
}

fn map_anime(a: JikanAnime) -> MediaItem {
    let mut title = MediaTitle::default();
    let mut synonyms = Vec::new();
    for t in a.titles.unwrap_or_default() {
        match t.kind.as_str() {
            "English" => title.english = Some(t.title),
            "Default" => title.romaji = Some(t.title),
            "Japanese" => title.native = Some(t.title),
            _ => synonyms.push(t.title),
        }
    }

    let cover = a.images.and_then(|i| i.jpg).map(|set| MediaImage {
        large: set.large_image_url.clone(),
        medium: set.image_url,
        extra_large: set.large_image_url,
    });

    MediaItem {
        // MAL id doubles as the catalog id for this backend.
        id: a.mal_id,
        id_mal: Some(a.mal_id),
        title,
        media_type: MediaType::Anime,
        status: map_status(a.status.as_deref()),
        format: map_format(a.format.as_deref()),
        cover_image: cover,
        banner_image: None,
        trailer: None,
        description: a.synopsis,
        episodes: a.episodes,
        duration: map_duration(a.duration.as_deref()),
        genres: a
            .genres
            .unwrap_or_default()
            .into_iter()
            .map(|g| g.name)
            .collect(),
        tags: Vec::new(),
        studios: a
            .studios
            .unwrap_or_default()
            .into_iter()
            .map(|s| crate::models::media::Studio {
                id: None,
                name: s.name,
                is_animation_studio: Some(true),
            })
            .collect(),
        synonyms,
        average_score: a.score.map(|s| s * 10.0),
        popularity: a.popularity,
        favourites: a.favorites,
        start_date: None,
        end_date: None,
        next_airing: None,
        streaming_episodes: Default::default(),
        user_status: None,
    }
}

pub struct JikanClient {
    client: Client,
}

impl Default for JikanClient {
    fn default() -> Self {
        Self::new()
    }
}

impl JikanClient {
    pub fn new() -> Self {
        Self {
            client: Client::builder()
                .user_agent(random_user_agent())
                .build()
                .unwrap_or_else(|_| Client::new()),
        }
    }
}

#[async_trait]
impl MediaApiClient for JikanClient {
    async fn authenticate(&mut self, _token: &str) -> Option<UserProfile> {
        warn!("Jikan does not support authentication");
        None
    }

    fn is_authenticated(&self) -> bool {
        false
    }

    async fn get_viewer_profile(&self) -> Result<Option<UserProfile>> {
        Ok(None)
    }

    async fn search_media(&self, params: &MediaSearchParams) -> Result<Option<MediaSearchResult>> {
        let mut url = format!(
            "{JIKAN_API}/anime?page={}&limit={}&sfw=true",
            params.page.unwrap_or(1),
            params.per_page.unwrap_or(15).min(25)
        );
        if let Some(query) = &params.query {
            url.push_str(&format!("&q={}", urlencoding::encode(query)));
        }
        if let Some(score) = params.score_greater {
            url.push_str(&format!("&min_score={}", score / 10.0));
        }

        let page: JikanPage = self
            .client
            .get(&url)
            .send()
            .await
            .context("Jikan request failed")?
            .json()
            .await
            .context("Jikan returned malformed JSON")?;

        if page.data.is_empty() {
            return Ok(None);
        }

        let page_info = page
            .pagination
            .map(|p| PageInfo {
                total: p.items.as_ref().and_then(|i| i.total).unwrap_or(0),
                current_page: p.current_page.or(p.last_visible_page).unwrap_or(1),
                has_next_page: p.has_next_page.unwrap_or(false),
                per_page: p.items.and_then(|i| i.per_page).unwrap_or(15),
            })
            .unwrap_or_default();

        Ok(Some(MediaSearchResult {
            page_info,
            media: page.data.into_iter().map(map_anime).collect(),
        }))
    }

    async fn search_media_list(
        &self,
        _params: &UserMediaListSearchParams,
    ) -> Result<Option<MediaSearchResult>> {
        Ok(None)
    }

    async fn get_media(&self, media_id: i64) -> Result<Option<MediaItem>> {
        let single: JikanSingle = self
            .client
            .get(format!("{JIKAN_API}/anime/{media_id}"))
            .send()
            .await
            .context("Jikan request failed")?
            .json()
            .await
            .context("Jikan returned malformed JSON")?;
        Ok(single.data.map(map_anime))
    }

    async fn update_list_entry(&self, _params: &UpdateUserMediaListEntryParams) -> bool {
        false
    }

    async fn delete_list_entry(&self, _media_id: i64) -> bool {
        false
    }

    async fn get_recommendations_for(&self, media_id: i64) -> Result<Vec<MediaItem>> {
        #[derive(Deserialize)]
        struct Entry {
            entry: JikanAnime,
        }
        #[derive(Deserialize)]
        struct Recs {
            data: Vec<Entry>,
        }

        let recs: Recs = self
            .client
            .get(format!("{JIKAN_API}/anime/{media_id}/recommendations"))
            .send()
            .await?
            .json()
            .await
            .context("Jikan returned malformed JSON")?;
        Ok(recs.data.into_iter().map(|e| map_anime(e.entry)).collect())
    }

    async fn get_characters_of(&self, media_id: i64) -> Result<Vec<Character>> {
        #[derive(Deserialize)]
        struct CharImages {
            jpg: Option<JikanImageSet>,
        }
        #[derive(Deserialize)]
        struct Char {
            mal_id: Option<i64>,
            name: String,
            images: Option<CharImages>,
        }
        #[derive(Deserialize)]
        struct Entry {
            character: Char,
        }
        #[derive(Deserialize)]
        struct Chars {
            data: Vec<Entry>,
        }

        let chars: Chars = self
            .client
            .get(format!("{JIKAN_API}/anime/{media_id}/characters"))
            .send()
            .await?
            .json()
            .await
            .context("Jikan returned malformed JSON")?;
        Ok(chars
            .data
            .into_iter()
            .map(|e| Character {
                id: e.character.mal_id,
                name: e.character.name,
                image_url: e
                    .character
                    .images
                    .and_then(|i| i.jpg)
                    .and_then(|j| j.image_url),
                description: None,
                gender: None,
                age: None,
            })
            .collect())
    }

    async fn get_related_anime_for(&self, media_id: i64) -> Result<Vec<MediaItem>> {
        #[derive(Deserialize)]
        struct RelEntry {
            mal_id: i64,
            #[serde(rename = "type")]
            kind: String,
        }
        #[derive(Deserialize)]
        struct Relation {
            entry: Vec<RelEntry>,
        }
        #[derive(Deserialize)]
        struct Relations {
            data: Vec<Relation>,
        }

        let relations: Relations = self
            .client
            .get(format!("{JIKAN_API}/anime/{media_id}/relations"))
            .send()
            .await?
            .json()
            .await
            .context("Jikan returned malformed JSON")?;

        let mut related = Vec::new();
        for relation in relations.data {
            for entry in relation.entry.into_iter().filter(|e| e.kind == "anime") {
                if let Some(item) = self.get_media(entry.mal_id).await? {
                    related.push(item);
                }
            }
        }
        Ok(related)
    }

    async fn get_airing_schedule_for(&self, _media_id: i64) -> Result<Vec<AiringScheduleItem>> {
        Ok(Vec::new())
    }

    async fn get_reviews_for(&self, media_id: i64) -> Result<Vec<MediaReview>> {
        #[derive(Deserialize)]
        struct User {
            username: String,
        }
        #[derive(Deserialize)]
        struct Review {
            review: String,
            user: User,
        }
        #[derive(Deserialize)]
        struct Reviews {
            data: Vec<Review>,
        }

        let reviews: Reviews = self
            .client
            .get(format!("{JIKAN_API}/anime/{media_id}/reviews"))
            .send()
            .await?
            .json()
            .await
            .context("Jikan returned malformed JSON")?;
        Ok(reviews
            .data
            .into_iter()
            .map(|r| MediaReview {
                summary: None,
                body: r.review,
                author: r.user.username,
            })
            .collect())
    }

    async fn get_notifications(&self) -> Result<Option<Vec<Notification>>> {
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duration_strings_parse() {
        assert_eq!(map_duration(Some("24 min per ep")), Some(24));
        assert_eq!(map_duration(Some("Unknown")), None);
        assert_eq!(map_duration(None), None);
    }

    #[test]
    fn titles_split_into_fields_and_synonyms() {
        let raw = serde_json::json!({
            "mal_id": 5,
            "titles": [
                {"type": "Default", "title": "Shingeki no Kyojin"},
                {"type": "English", "title": "Attack on Titan"},
                {"type": "Synonym", "title": "AoT"}
            ]
        });
        let anime: JikanAnime = serde_json::from_value(raw).unwrap();
        let item = map_anime(anime);
        assert_eq!(item.title.english.as_deref(), Some("Attack on Titan"));
        assert_eq!(item.title.romaji.as_deref(), Some("Shingeki no Kyojin"));
        assert_eq!(item.synonyms, vec!["AoT".to_string()]);
    }
}
