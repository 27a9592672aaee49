//! AniList GraphQL catalog client.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use reqwest::Client;
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::{debug, warn};

use super::MediaApiClient;
use crate::constants::random_user_agent;
use crate::models::media::{
    AiringSchedule, AiringScheduleItem, Character, MediaFormat, MediaImage, MediaItem,
    MediaReview, MediaSearchParams, MediaSearchResult, MediaSort, MediaStatus, MediaTagItem,
    MediaTitle, MediaTrailer, MediaType, Notification, NotificationType, PageInfo, StreamingEpisode,
    Studio, UpdateUserMediaListEntryParams, UserListItem, UserMediaListSearchParams,
    UserMediaListStatus, UserProfile,
};

const ANILIST_API: &str = "https://graphql.anilist.co";

/// Shared field selection for every query that returns media.
const MEDIA_FIELDS: &str = r#"
    id
    idMal
    title { romaji english native }
    type
    status
    format
    episodes
    duration
    genres
    synonyms
    description(asHtml: false)
    tags { name rank }
    studios { nodes { id name isAnimationStudio } }
    coverImage { large medium extraLarge }
    bannerImage
    trailer { id site thumbnail }
    averageScore
    popularity
    favourites
    startDate { year month day }
    endDate { year month day }
    nextAiringEpisode { episode airingAt }
    streamingEpisodes { title thumbnail }
    mediaListEntry { id status progress score repeat notes }
"#;

fn search_media_query() -> String {
    format!(
        r#"
        query (
            $query: String, $page: Int, $perPage: Int, $sort: [MediaSort],
            $idIn: [Int], $genreIn: [String], $genreNotIn: [String],
            $tagIn: [String], $tagNotIn: [String],
            $status: MediaStatus, $statusIn: [MediaStatus], $statusNotIn: [MediaStatus],
            $popularityGreater: Int, $popularityLesser: Int,
            $averageScoreGreater: Int, $averageScoreLesser: Int,
            $season: MediaSeason, $seasonYear: Int,
            $startDateGreater: FuzzyDateInt, $startDateLesser: FuzzyDateInt,
            $endDateGreater: FuzzyDateInt, $endDateLesser: FuzzyDateInt,
            $formatIn: [MediaFormat], $type: MediaType, $onList: Boolean
        ) {{
            Page(page: $page, perPage: $perPage) {{
                pageInfo {{ total currentPage hasNextPage perPage }}
                media(
                    search: $query, sort: $sort, id_in: $idIn,
                    genre_in: $genreIn, genre_not_in: $genreNotIn,
                    tag_in: $tagIn, tag_not_in: $tagNotIn,
                    status: $status, status_in: $statusIn, status_not_in: $statusNotIn,
                    popularity_greater: $popularityGreater, popularity_lesser: $popularityLesser,
                    averageScore_greater: $averageScoreGreater, averageScore_lesser: $averageScoreLesser,
                    season: $season, seasonYear: $seasonYear,
                    startDate_greater: $startDateGreater, startDate_lesser: $startDateLesser,
                    endDate_greater: $endDateGreater, endDate_lesser: $endDateLesser,
                    format_in: $formatIn, type: $type, onList: $onList
                ) {{ {MEDIA_FIELDS} }}
            }}
        }}
    "#
    )
}

fn user_list_query() -> String {
    format!(
        r#"
        query ($userId: Int, $status: MediaListStatus, $page: Int, $perPage: Int, $type: MediaType) {{
            Page(page: $page, perPage: $perPage) {{
                pageInfo {{ total currentPage hasNextPage perPage }}
                mediaList(userId: $userId, status: $status, type: $type, sort: UPDATED_TIME_DESC) {{
                    status
                    progress
                    score
                    repeat
                    notes
                    media {{ {MEDIA_FIELDS} }}
                }}
            }}
        }}
    "#
    )
}

fn media_by_id_query() -> String {
    format!(
        r#"
        query ($id: Int) {{
            Media(id: $id) {{ {MEDIA_FIELDS} }}
        }}
    "#
    )
}

const GET_VIEWER: &str = r#"
    query {
        Viewer { id name avatar { large } bannerImage }
    }
"#;

const SAVE_LIST_ENTRY: &str = r#"
    mutation ($mediaId: Int, $status: MediaListStatus, $progress: Int, $scoreRaw: Int) {
        SaveMediaListEntry(mediaId: $mediaId, status: $status, progress: $progress, scoreRaw: $scoreRaw) {
            id
            status
        }
    }
"#;

const GET_LIST_ENTRY_ID: &str = r#"
    query ($mediaId: Int) {
        MediaList(mediaId: $mediaId) { id }
    }
"#;

const DELETE_LIST_ENTRY: &str = r#"
    mutation ($id: Int) {
        DeleteMediaListEntry(id: $id) { deleted }
    }
"#;

const GET_NOTIFICATIONS: &str = r#"
    query {
        Page(page: 1, perPage: 25) {
            notifications(type: AIRING, resetNotificationCount: true) {
                ... on AiringNotification {
                    id
                    episode
                    contexts
                    createdAt
                    media {
                        id
                        idMal
                        title { romaji english native }
                        episodes
                        status
                        coverImage { large medium extraLarge }
                    }
                }
            }
        }
    }
"#;

// ---------------------------------------------------------------------------
// Wire types

#[derive(Deserialize)]
struct GqlResponse<T> {
    data: Option<T>,
    errors: Option<Vec<Value>>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct GqlTitle {
    romaji: Option<String>,
    english: Option<String>,
    native: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct GqlImage {
    large: Option<String>,
    medium: Option<String>,
    extra_large: Option<String>,
}

#[derive(Deserialize)]
struct GqlTag {
    name: String,
    rank: Option<u32>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct GqlStudioNode {
    id: Option<i64>,
    name: String,
    is_animation_studio: Option<bool>,
}

#[derive(Deserialize)]
struct GqlStudios {
    nodes: Vec<GqlStudioNode>,
}

#[derive(Deserialize)]
struct GqlTrailer {
    id: Option<String>,
    site: Option<String>,
    thumbnail: Option<String>,
}

#[derive(Deserialize)]
struct GqlFuzzyDate {
    year: Option<i32>,
    month: Option<u32>,
    day: Option<u32>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct GqlAiring {
    episode: i32,
    airing_at: Option<i64>,
}

#[derive(Deserialize)]
struct GqlStreamingEpisode {
    title: Option<String>,
    thumbnail: Option<String>,
}

#[derive(Deserialize)]
struct GqlListEntry {
    id: Option<i64>,
    status: Option<String>,
    progress: Option<i32>,
    score: Option<f64>,
    repeat: Option<i32>,
    notes: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct GqlMedia {
    id: i64,
    id_mal: Option<i64>,
    title: GqlTitle,
    #[serde(rename = "type")]
    media_type: Option<String>,
    status: Option<String>,
    format: Option<String>,
    episodes: Option<i32>,
    duration: Option<i32>,
    genres: Option<Vec<String>>,
    synonyms: Option<Vec<String>>,
    description: Option<String>,
    tags: Option<Vec<GqlTag>>,
    studios: Option<GqlStudios>,
    cover_image: Option<GqlImage>,
    banner_image: Option<String>,
    trailer: Option<GqlTrailer>,
    average_score: Option<f64>,
    popularity: Option<i64>,
    favourites: Option<i64>,
    start_date: Option<GqlFuzzyDate>,
    end_date: Option<GqlFuzzyDate>,
    next_airing_episode: Option<GqlAiring>,
    streaming_episodes: Option<Vec<GqlStreamingEpisode>>,
    media_list_entry: Option<GqlListEntry>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct GqlPageInfo {
    total: Option<usize>,
    current_page: Option<usize>,
    has_next_page: Option<bool>,
    per_page: Option<usize>,
}

fn map_list_status(status: &str) -> Option<UserMediaListStatus> {
    match status {
        "CURRENT" => Some(UserMediaListStatus::Watching),
        "PLANNING" => Some(UserMediaListStatus::Planning),
        "COMPLETED" => Some(UserMediaListStatus::Completed),
        "DROPPED" => Some(UserMediaListStatus::Dropped),
        "PAUSED" => Some(UserMediaListStatus::Paused),
        "REPEATING" => Some(UserMediaListStatus::Repeating),
        _ => None,
    }
}

fn remote_list_status(status: UserMediaListStatus) -> &'static str {
    match status {
        UserMediaListStatus::Watching => "CURRENT",
        UserMediaListStatus::Planning => "PLANNING",
        UserMediaListStatus::Completed => "COMPLETED",
        UserMediaListStatus::Dropped => "DROPPED",
        UserMediaListStatus::Paused => "PAUSED",
        UserMediaListStatus::Repeating => "REPEATING",
    }
}

fn map_status(status: Option<&str>) -> MediaStatus {
    match status {
        Some("RELEASING") => MediaStatus::Releasing,
        Some("NOT_YET_RELEASED") => MediaStatus::NotYetReleased,
        Some("CANCELLED") => MediaStatus::Cancelled,
        Some("HIATUS") => MediaStatus::Hiatus,
        _ => MediaStatus::Finished,
    }
}

fn map_format(format: Option<&str>) -> Option<MediaFormat> {
    match format? {
        "TV" => Some(MediaFormat::Tv),
        "TV_SHORT" => Some(MediaFormat::TvShort),
        "MOVIE" => Some(MediaFormat::Movie),
        "SPECIAL" => Some(MediaFormat::Special),
        "OVA" => Some(MediaFormat::Ova),
        "ONA" => Some(MediaFormat::Ona),
        "MUSIC" => Some(MediaFormat::Music),
        "NOVEL" => Some(MediaFormat::Novel),
        "ONE_SHOT" => Some(MediaFormat::OneShot),
        "MANGA" => Some(MediaFormat::Manga),
        _ => None,
    }
}

fn map_fuzzy_date(date: Option<GqlFuzzyDate>) -> Option<DateTime<Utc>> {
    let date = date?;
    Utc.with_ymd_and_hms(date.year?, date.month.unwrap_or(1), date.day.unwrap_or(1), 0, 0, 0)
        .single()
}

/// Episode number embedded in a streaming episode title ("Episode 7 - ...").
fn episode_number_of(title: &str) -> Option<String> {
    let rest = title.strip_prefix("Episode ")?;
    let number: String = rest
        .chars()
        .take_while(|c| c.is_ascii_digit() || *c == '.')
        .collect();
    (!number.is_empty()).then_some(number)
}

fn map_media(m: GqlMedia) -> MediaItem {
    let streaming_episodes = m
        .streaming_episodes
        .unwrap_or_default()
        .into_iter()
        .filter_map(|ep| {
            let title = ep.title?;
            let number = episode_number_of(&title)?;
            Some((
                number,
                StreamingEpisode {
                    title,
                    thumbnail: ep.thumbnail,
                },
            ))
        })
        .collect();

    let user_status = m.media_list_entry.map(|entry| UserListItem {
        id: entry.id,
        status: entry.status.as_deref().and_then(map_list_status),
        progress: entry.progress,
        score: entry.score,
        repeat: entry.repeat,
        notes: entry.notes,
        started_at: None,
        completed_at: None,
    });

    MediaItem {
        id: m.id,
        id_mal: m.id_mal,
        title: MediaTitle {
            english: m.title.english,
            romaji: m.title.romaji,
            native: m.title.native,
        },
        media_type: match m.media_type.as_deref() {
            Some("MANGA") => MediaType::Manga,
            _ => MediaType::Anime,
        },
        status: map_status(m.status.as_deref()),
        format: map_format(m.format.as_deref()),
        cover_image: m.cover_image.map(|img| MediaImage {
            large: img.large,
            medium: img.medium,
            extra_large: img.extra_large,
        }),
        banner_image: m.banner_image,
        trailer: m.trailer.and_then(|t| {
            Some(MediaTrailer {
                id: t.id?,
                site: t.site?,
                thumbnail_url: t.thumbnail,
            })
        }),
        description: m.description,
        episodes: m.episodes,
        duration: m.duration,
        genres: m.genres.unwrap_or_default(),
        tags: m
            .tags
            .unwrap_or_default()
            .into_iter()
            .map(|t| MediaTagItem {
                name: t.name,
                rank: t.rank,
            })
            .collect(),
        studios: m
            .studios
            .map(|s| {
                s.nodes
                    .into_iter()
                    .map(|n| Studio {
                        id: n.id,
                        name: n.name,
                        is_animation_studio: n.is_animation_studio,
                    })
                    .collect()
            })
            .unwrap_or_default(),
        synonyms: m.synonyms.unwrap_or_default(),
        average_score: m.average_score,
        popularity: m.popularity,
        favourites: m.favourites,
        start_date: map_fuzzy_date(m.start_date),
        end_date: map_fuzzy_date(m.end_date),
        next_airing: m.next_airing_episode.map(|a| AiringSchedule {
            episode: a.episode,
            airing_at: a.airing_at.and_then(|ts| Utc.timestamp_opt(ts, 0).single()),
        }),
        streaming_episodes,
        user_status,
    }
}

fn map_page_info(info: GqlPageInfo) -> PageInfo {
    PageInfo {
        total: info.total.unwrap_or(0),
        current_page: info.current_page.unwrap_or(1),
        has_next_page: info.has_next_page.unwrap_or(false),
        per_page: info.per_page.unwrap_or(15),
    }
}

fn remote_sort(sort: MediaSort) -> &'static str {
    match sort {
        MediaSort::Title => "TITLE_ENGLISH",
        MediaSort::SearchMatch => "SEARCH_MATCH",
        MediaSort::ScoreDesc => "SCORE_DESC",
        MediaSort::PopularityDesc => "POPULARITY_DESC",
        MediaSort::FavouritesDesc => "FAVOURITES_DESC",
        MediaSort::TrendingDesc => "TRENDING_DESC",
        MediaSort::UpdatedAtDesc => "UPDATED_AT_DESC",
    }
}

// ---------------------------------------------------------------------------

pub struct AniListClient {
    client: Client,
    token: Option<String>,
    user_profile: Option<UserProfile>,
}

impl Default for AniListClient {
    fn default() -> Self {
        Self::new()
    }
}

impl AniListClient {
    pub fn new() -> Self {
        Self {
            client: Client::builder()
                .user_agent(random_user_agent())
                .build()
                .unwrap_or_else(|_| Client::new()),
            token: None,
            user_profile: None,
        }
    }

    async fn execute<T: serde::de::DeserializeOwned>(
        &self,
        query: &str,
        variables: Value,
    ) -> Result<T> {
        let mut request = self
            .client
            .post(ANILIST_API)
            .json(&json!({ "query": query, "variables": variables }));
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }

        let response: GqlResponse<T> = request
            .send()
            .await
            .context("AniList request failed")?
            .json()
            .await
            .context("AniList returned malformed JSON")?;

        if let Some(errors) = &response.errors {
            anyhow::bail!("AniList returned errors: {errors:?}");
        }
        response
            .data
            .context("AniList response carried no data")
    }

    async fn fetch_media_page(&self, query: &str, variables: Value) -> Result<Option<MediaSearchResult>> {
        #[derive(Deserialize)]
        #[serde(rename_all = "camelCase")]
        struct Page {
            page_info: GqlPageInfo,
            media: Vec<GqlMedia>,
        }
        #[derive(Deserialize)]
        struct Data {
            #[serde(rename = "Page")]
            page: Page,
        }

        let data: Data = self.execute(query, variables).await?;
        if data.page.media.is_empty() {
            return Ok(None);
        }
        Ok(Some(MediaSearchResult {
            page_info: map_page_info(data.page.page_info),
            media: data.page.media.into_iter().map(map_media).collect(),
        }))
    }
}

#[async_trait]
impl MediaApiClient for AniListClient {
    async fn authenticate(&mut self, token: &str) -> Option<UserProfile> {
        self.token = Some(token.to_string());
        match self.get_viewer_profile().await {
            Ok(Some(profile)) => {
                self.user_profile = Some(profile.clone());
                Some(profile)
            }
            _ => {
                self.token = None;
                self.user_profile = None;
                None
            }
        }
    }

    fn is_authenticated(&self) -> bool {
        self.user_profile.is_some()
    }

    async fn get_viewer_profile(&self) -> Result<Option<UserProfile>> {
        if self.token.is_none() {
            return Ok(None);
        }

        #[derive(Deserialize)]
        struct Avatar {
            large: Option<String>,
        }
        #[derive(Deserialize)]
        #[serde(rename_all = "camelCase")]
        struct Viewer {
            id: i64,
            name: String,
            avatar: Option<Avatar>,
            banner_image: Option<String>,
        }
        #[derive(Deserialize)]
        struct Data {
            #[serde(rename = "Viewer")]
            viewer: Option<Viewer>,
        }

        let data: Data = self.execute(GET_VIEWER, json!({})).await?;
        Ok(data.viewer.map(|v| UserProfile {
            id: v.id,
            name: v.name,
            avatar_url: v.avatar.and_then(|a| a.large),
            banner_url: v.banner_image,
        }))
    }

    async fn search_media(&self, params: &MediaSearchParams) -> Result<Option<MediaSearchResult>> {
        let mut variables = json!({
            "page": params.page.unwrap_or(1),
            "perPage": params.per_page.unwrap_or(15),
            // Adult content is excluded unless the caller filters genres
            // explicitly; anime is the default type.
            "genreNotIn": params.genre_not_in.clone().unwrap_or_else(|| vec!["Hentai".to_string()]),
            "type": params.media_type.map(|t| if t == MediaType::Manga { "MANGA" } else { "ANIME" }).unwrap_or("ANIME"),
        });
        let vars = variables.as_object_mut().expect("object literal");

        if let Some(query) = &params.query {
            vars.insert("query".into(), json!(query));
        }
        if let Some(sort) = params.sort {
            vars.insert("sort".into(), json!([remote_sort(sort)]));
        }
        if let Some(ids) = &params.id_in {
            vars.insert("idIn".into(), json!(ids));
        }
        if let Some(genres) = &params.genre_in {
            vars.insert("genreIn".into(), json!(genres));
        }
        if let Some(tags) = &params.tag_in {
            vars.insert("tagIn".into(), json!(tags));
        }
        if let Some(tags) = &params.tag_not_in {
            vars.insert("tagNotIn".into(), json!(tags));
        }
        if let Some(status) = params.status {
            vars.insert("status".into(), json!(status));
        }
        if let Some(statuses) = &params.status_in {
            vars.insert("statusIn".into(), json!(statuses));
        }
        if let Some(statuses) = &params.status_not_in {
            vars.insert("statusNotIn".into(), json!(statuses));
        }
        if let Some(v) = params.popularity_greater {
            vars.insert("popularityGreater".into(), json!(v));
        }
        if let Some(v) = params.popularity_lesser {
            vars.insert("popularityLesser".into(), json!(v));
        }
        if let Some(v) = params.score_greater {
            vars.insert("averageScoreGreater".into(), json!(v as i64));
        }
        if let Some(v) = params.score_lesser {
            vars.insert("averageScoreLesser".into(), json!(v as i64));
        }
        if let Some(season) = params.season {
            vars.insert("season".into(), json!(season));
        }
        if let Some(year) = params.season_year {
            vars.insert("seasonYear".into(), json!(year));
        }
        if let Some(v) = params.start_date_greater {
            vars.insert("startDateGreater".into(), json!(v));
        }
        if let Some(v) = params.start_date_lesser {
            vars.insert("startDateLesser".into(), json!(v));
        }
        if let Some(v) = params.end_date_greater {
            vars.insert("endDateGreater".into(), json!(v));
        }
        if let Some(v) = params.end_date_lesser {
            vars.insert("endDateLesser".into(), json!(v));
        }
        if let Some(formats) = &params.format_in {
            vars.insert("formatIn".into(), json!(formats));
        }
        if let Some(on_list) = params.on_list {
            vars.insert("onList".into(), json!(on_list));
        }

        self.fetch_media_page(&search_media_query(), variables).await
    }

    async fn search_media_list(
        &self,
        params: &UserMediaListSearchParams,
    ) -> Result<Option<MediaSearchResult>> {
        let Some(profile) = &self.user_profile else {
            warn!("Cannot fetch user list: not authenticated");
            return Ok(None);
        };

        #[derive(Deserialize)]
        struct ListEntry {
            status: Option<String>,
            progress: Option<i32>,
            score: Option<f64>,
            repeat: Option<i32>,
            notes: Option<String>,
            media: GqlMedia,
        }
        #[derive(Deserialize)]
        #[serde(rename_all = "camelCase")]
        struct Page {
            page_info: GqlPageInfo,
            media_list: Vec<ListEntry>,
        }
        #[derive(Deserialize)]
        struct Data {
            #[serde(rename = "Page")]
            page: Page,
        }

        let variables = json!({
            "userId": profile.id,
            "status": params.status.map(remote_list_status),
            "page": params.page.unwrap_or(1),
            "perPage": params.per_page.unwrap_or(15),
            "type": params.media_type.map(|t| if t == MediaType::Manga { "MANGA" } else { "ANIME" }).unwrap_or("ANIME"),
        });

        let data: Data = self.execute(&user_list_query(), variables).await?;
        if data.page.media_list.is_empty() {
            return Ok(None);
        }

        let media = data
            .page
            .media_list
            .into_iter()
            .map(|entry| {
                let mut item = map_media(entry.media);
                // The list query carries the user state beside the media; fold
                // it in so callers see one shape.
                item.user_status = Some(UserListItem {
                    id: None,
                    status: entry.status.as_deref().and_then(map_list_status),
                    progress: entry.progress,
                    score: entry.score,
                    repeat: entry.repeat,
                    notes: entry.notes,
                    started_at: None,
                    completed_at: None,
                });
                item
            })
            .collect();

        Ok(Some(MediaSearchResult {
            page_info: map_page_info(data.page.page_info),
            media,
        }))
    }

    async fn get_media(&self, media_id: i64) -> Result<Option<MediaItem>> {
        #[derive(Deserialize)]
        struct Data {
            #[serde(rename = "Media")]
            media: Option<GqlMedia>,
        }

        let data: Data = self
            .execute(&media_by_id_query(), json!({ "id": media_id }))
            .await?;
        Ok(data.media.map(map_media))
    }

    async fn update_list_entry(&self, params: &UpdateUserMediaListEntryParams) -> bool {
        if self.token.is_none() {
            return false;
        }

        // Decimal episode identifiers are truncated for the remote API.
        let progress = params
            .progress
            .as_deref()
            .and_then(|p| p.parse::<f64>().ok())
            .map(|p| p as i64);
        let score_raw = params.score.map(|s| (s * 10.0) as i64);

        let mut variables = json!({ "mediaId": params.media_id });
        let vars = variables.as_object_mut().expect("object literal");
        if let Some(status) = params.status {
            vars.insert("status".into(), json!(remote_list_status(status)));
        }
        if let Some(progress) = progress {
            vars.insert("progress".into(), json!(progress));
        }
        if let Some(score_raw) = score_raw {
            vars.insert("scoreRaw".into(), json!(score_raw));
        }

        match self.execute::<Value>(SAVE_LIST_ENTRY, variables).await {
            Ok(_) => true,
            Err(err) => {
                warn!(media_id = params.media_id, error = %err, "failed to update list entry");
                false
            }
        }
    }

    async fn delete_list_entry(&self, media_id: i64) -> bool {
        if self.token.is_none() {
            return false;
        }

        #[derive(Deserialize)]
        struct ListIdData {
            #[serde(rename = "MediaList")]
            media_list: Option<ListId>,
        }
        #[derive(Deserialize)]
        struct ListId {
            id: i64,
        }

        let entry: Result<ListIdData> = self
            .execute(GET_LIST_ENTRY_ID, json!({ "mediaId": media_id }))
            .await;
        let Ok(ListIdData {
            media_list: Some(ListId { id }),
        }) = entry
        else {
            // Nothing to delete.
            return true;
        };

        #[derive(Deserialize)]
        struct DeleteData {
            #[serde(rename = "DeleteMediaListEntry")]
            delete: Option<Deleted>,
        }
        #[derive(Deserialize)]
        struct Deleted {
            deleted: Option<bool>,
        }

        match self
            .execute::<DeleteData>(DELETE_LIST_ENTRY, json!({ "id": id }))
            .await
        {
            Ok(data) => data.delete.and_then(|d| d.deleted).unwrap_or(false),
            Err(err) => {
                warn!(media_id, error = %err, "failed to delete list entry");
                false
            }
        }
    }

    async fn get_recommendations_for(&self, media_id: i64) -> Result<Vec<MediaItem>> {
        let query = format!(
            r#"
            query ($id: Int) {{
                Media(id: $id) {{
                    recommendations(page: 1, perPage: 25, sort: RATING_DESC) {{
                        nodes {{ mediaRecommendation {{ {MEDIA_FIELDS} }} }}
                    }}
                }}
            }}
        "#
        );

        #[derive(Deserialize)]
        #[serde(rename_all = "camelCase")]
        struct Node {
            media_recommendation: Option<GqlMedia>,
        }
        #[derive(Deserialize)]
        struct Recs {
            nodes: Vec<Node>,
        }
        #[derive(Deserialize)]
        struct Media {
            recommendations: Option<Recs>,
        }
        #[derive(Deserialize)]
        struct Data {
            #[serde(rename = "Media")]
            media: Option<Media>,
        }

        let data: Data = self.execute(&query, json!({ "id": media_id })).await?;
        Ok(data
            .media
            .and_then(|m| m.recommendations)
            .map(|r| {
                r.nodes
                    .into_iter()
                    .filter_map(|n| n.media_recommendation)
                    .map(map_media)
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn get_characters_of(&self, media_id: i64) -> Result<Vec<Character>> {
        const QUERY: &str = r#"
            query ($id: Int) {
                Media(id: $id) {
                    characters(page: 1, perPage: 25, sort: ROLE) {
                        nodes {
                            id
                            name { full }
                            image { large }
                            description
                            gender
                            age
                        }
                    }
                }
            }
        "#;

        #[derive(Deserialize)]
        struct Name {
            full: Option<String>,
        }
        #[derive(Deserialize)]
        struct Image {
            large: Option<String>,
        }
        #[derive(Deserialize)]
        struct Node {
            id: Option<i64>,
            name: Name,
            image: Option<Image>,
            description: Option<String>,
            gender: Option<String>,
            age: Option<String>,
        }
        #[derive(Deserialize)]
        struct Characters {
            nodes: Vec<Node>,
        }
        #[derive(Deserialize)]
        struct Media {
            characters: Option<Characters>,
        }
        #[derive(Deserialize)]
        struct Data {
            #[serde(rename = "Media")]
            media: Option<Media>,
        }

        let data: Data = self.execute(QUERY, json!({ "id": media_id })).await?;
        Ok(data
            .media
            .and_then(|m| m.characters)
            .map(|c| {
                c.nodes
                    .into_iter()
                    .map(|n| Character {
                        id: n.id,
                        name: n.name.full.unwrap_or_default(),
                        image_url: n.image.and_then(|i| i.large),
                        description: n.description,
                        gender: n.gender,
                        age: n.age,
                    })
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn get_related_anime_for(&self, media_id: i64) -> Result<Vec<MediaItem>> {
        let query = format!(
            r#"
            query ($id: Int) {{
                Media(id: $id) {{
                    relations {{ nodes {{ {MEDIA_FIELDS} }} }}
                }}
            }}
        "#
        );

        #[derive(Deserialize)]
        struct Relations {
            nodes: Vec<GqlMedia>,
        }
        #[derive(Deserialize)]
        struct Media {
            relations: Option<Relations>,
        }
        #[derive(Deserialize)]
        struct Data {
            #[serde(rename = "Media")]
            media: Option<Media>,
        }

        let data: Data = self.execute(&query, json!({ "id": media_id })).await?;
        Ok(data
            .media
            .and_then(|m| m.relations)
            .map(|r| {
                r.nodes
                    .into_iter()
                    .filter(|m| m.media_type.as_deref() == Some("ANIME"))
                    .map(map_media)
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn get_airing_schedule_for(&self, media_id: i64) -> Result<Vec<AiringScheduleItem>> {
        const QUERY: &str = r#"
            query ($id: Int) {
                Media(id: $id) {
                    airingSchedule(page: 1, perPage: 100) {
                        nodes { episode airingAt timeUntilAiring }
                    }
                }
            }
        "#;

        #[derive(Deserialize)]
        #[serde(rename_all = "camelCase")]
        struct Node {
            episode: i32,
            airing_at: Option<i64>,
            time_until_airing: Option<i64>,
        }
        #[derive(Deserialize)]
        struct Schedule {
            nodes: Vec<Node>,
        }
        #[derive(Deserialize)]
        #[serde(rename_all = "camelCase")]
        struct Media {
            airing_schedule: Option<Schedule>,
        }
        #[derive(Deserialize)]
        struct Data {
            #[serde(rename = "Media")]
            media: Option<Media>,
        }

        let data: Data = self.execute(QUERY, json!({ "id": media_id })).await?;
        Ok(data
            .media
            .and_then(|m| m.airing_schedule)
            .map(|s| {
                s.nodes
                    .into_iter()
                    .map(|n| AiringScheduleItem {
                        episode: n.episode,
                        airing_at: n.airing_at.and_then(|ts| Utc.timestamp_opt(ts, 0).single()),
                        time_until_airing: n.time_until_airing,
                    })
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn get_reviews_for(&self, media_id: i64) -> Result<Vec<MediaReview>> {
        const QUERY: &str = r#"
            query ($id: Int) {
                Media(id: $id) {
                    reviews(page: 1, perPage: 10) {
                        nodes {
                            summary
                            body(asHtml: false)
                            user { name }
                        }
                    }
                }
            }
        "#;

        #[derive(Deserialize)]
        struct User {
            name: String,
        }
        #[derive(Deserialize)]
        struct Node {
            summary: Option<String>,
            body: String,
            user: User,
        }
        #[derive(Deserialize)]
        struct Reviews {
            nodes: Vec<Node>,
        }
        #[derive(Deserialize)]
        struct Media {
            reviews: Option<Reviews>,
        }
        #[derive(Deserialize)]
        struct Data {
            #[serde(rename = "Media")]
            media: Option<Media>,
        }

        let data: Data = self.execute(QUERY, json!({ "id": media_id })).await?;
        Ok(data
            .media
            .and_then(|m| m.reviews)
            .map(|r| {
                r.nodes
                    .into_iter()
                    .map(|n| MediaReview {
                        summary: n.summary,
                        body: n.body,
                        author: n.user.name,
                    })
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn get_notifications(&self) -> Result<Option<Vec<Notification>>> {
        if !self.is_authenticated() {
            debug!("Cannot fetch notifications: not authenticated");
            return Ok(None);
        }

        #[derive(Deserialize)]
        #[serde(rename_all = "camelCase")]
        struct GqlNotification {
            id: Option<i64>,
            episode: Option<i32>,
            contexts: Option<Vec<String>>,
            created_at: Option<i64>,
            media: Option<GqlMedia>,
        }
        #[derive(Deserialize)]
        struct Page {
            notifications: Vec<GqlNotification>,
        }
        #[derive(Deserialize)]
        struct Data {
            #[serde(rename = "Page")]
            page: Page,
        }

        let data: Data = self.execute(GET_NOTIFICATIONS, json!({})).await?;
        let notifications: Vec<Notification> = data
            .page
            .notifications
            .into_iter()
            .filter_map(|n| {
                Some(Notification {
                    id: n.id?,
                    kind: NotificationType::Airing,
                    episode: n.episode,
                    contexts: n.contexts.unwrap_or_default(),
                    created_at: n
                        .created_at
                        .and_then(|ts| Utc.timestamp_opt(ts, 0).single())
                        .unwrap_or_else(Utc::now),
                    media: map_media(n.media?),
                })
            })
            .collect();

        Ok(Some(notifications))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn list_status_maps_both_ways() {
        assert_eq!(map_list_status("CURRENT"), Some(UserMediaListStatus::Watching));
        assert_eq!(remote_list_status(UserMediaListStatus::Watching), "CURRENT");
        assert_eq!(map_list_status("UNKNOWN_FUTURE_STATE"), None);
    }

    #[test]
    fn streaming_episode_titles_yield_numbers() {
        assert_eq!(episode_number_of("Episode 7 - The Journey"), Some("7".to_string()));
        assert_eq!(episode_number_of("Episode 7.5 - Recap"), Some("7.5".to_string()));
        assert_eq!(episode_number_of("Trailer"), None);
    }

    #[test]
    fn media_mapping_survives_sparse_payloads() {
        let raw = serde_json::json!({
            "id": 1001,
            "title": { "romaji": "Foo" }
        });
        let media: GqlMedia = serde_json::from_value(raw).unwrap();
        let item = map_media(media);
        assert_eq!(item.id, 1001);
        assert_eq!(item.title.preferred(), "Foo");
        assert_eq!(item.status, MediaStatus::Finished);
        assert!(item.user_status.is_none());
    }
}
