//! AllAnime provider.
//!
//! Speaks the allanime GraphQL API over GET requests. Stream source URLs come
//! back obfuscated (hex with a one-byte XOR); each decrypted source resolves
//! to a JSON endpoint carrying the actual quality-tagged links, which is done
//! lazily per server.

use std::collections::HashMap;
use std::sync::Mutex;

use anyhow::{Context, Result};
use async_trait::async_trait;
use futures::StreamExt;
use reqwest::Client;
use serde::Deserialize;
use serde_json::json;
use tracing::debug;

use super::{AnimeProvider, ProviderName, ServerStream, provider_client};
use crate::models::provider::{
    Anime, AnimeEpisodes, AnimeParams, EpisodeStream, EpisodeStreamsParams, ProviderPageInfo,
    ProviderSearchResult, SearchParams, SearchResults, Server, StreamQuality, Subtitle,
};
use crate::utils::time::episode_sort_key;

const API_BASE: &str = "https://api.allanime.day/api";
const CLOCK_BASE: &str = "https://allanime.day";

const SEARCH_GQL: &str = r#"query ($search: SearchInput, $limit: Int, $page: Int, $translationType: VaildTranslationTypeEnumType, $countryOrigin: VaildCountryOriginEnumType) {
    shows(search: $search, limit: $limit, page: $page, translationType: $translationType, countryOrigin: $countryOrigin) {
        pageInfo { total }
        edges { _id name englishName nativeName availableEpisodesDetail type thumbnail season { year } }
    }
}"#;

const SHOW_GQL: &str = r#"query ($showId: String!) {
    show(_id: $showId) {
        _id name englishName nativeName availableEpisodesDetail type thumbnail season { year }
    }
}"#;

const EPISODE_GQL: &str = r#"query ($showId: String!, $translationType: VaildTranslationTypeEnumType!, $episodeString: String!) {
    episode(showId: $showId, translationType: $translationType, episodeString: $episodeString) {
        episodeString sourceUrls notes
    }
}"#;

#[derive(Deserialize)]
struct GqlData<T> {
    data: Option<T>,
}

#[derive(Deserialize)]
struct EpisodesDetail {
    #[serde(default)]
    sub: Vec<String>,
    #[serde(default)]
    dub: Vec<String>,
    #[serde(default)]
    raw: Vec<String>,
}

#[derive(Deserialize)]
struct Season {
    year: Option<i32>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct Show {
    #[serde(rename = "_id")]
    id: String,
    name: String,
    english_name: Option<String>,
    native_name: Option<String>,
    available_episodes_detail: Option<EpisodesDetail>,
    #[serde(rename = "type")]
    media_type: Option<String>,
    thumbnail: Option<String>,
    season: Option<Season>,
}

#[derive(Deserialize)]
struct ShowsPage {
    shows: Shows,
}

#[derive(Deserialize)]
struct Shows {
    #[serde(rename = "pageInfo")]
    page_info: Option<TotalInfo>,
    edges: Vec<Show>,
}

#[derive(Deserialize)]
struct TotalInfo {
    total: Option<usize>,
}

#[derive(Deserialize)]
struct ShowData {
    show: Option<Show>,
}

#[derive(Deserialize)]
struct EpisodeData {
    episode: Option<Episode>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct Episode {
    episode_string: Option<String>,
    source_urls: Vec<SourceUrl>,
    notes: Option<String>,
}

#[derive(Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
struct SourceUrl {
    source_url: String,
    source_name: String,
    priority: Option<f64>,
}

#[derive(Deserialize)]
struct ClockResponse {
    links: Vec<ClockLink>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ClockLink {
    link: String,
    hls: Option<bool>,
    mp4: Option<bool>,
    resolution_str: Option<String>,
    #[serde(default)]
    subtitles: Vec<ClockSubtitle>,
    headers: Option<HashMap<String, String>>,
}

#[derive(Deserialize)]
struct ClockSubtitle {
    src: String,
    lang: Option<String>,
}

/// Hex-decode then XOR each byte with 56. Obfuscated urls start with "--".
fn decrypt_source_url(encrypted: &str) -> Option<String> {
    let hex = encrypted.strip_prefix("--")?;
    if hex.len() % 2 != 0 {
        return None;
    }
    let mut out = Vec::with_capacity(hex.len() / 2);
    for i in (0..hex.len()).step_by(2) {
        let byte = u8::from_str_radix(&hex[i..i + 2], 16).ok()?;
        out.push(byte ^ 56);
    }
    String::from_utf8(out).ok()
}

fn parse_quality(resolution: Option<&str>) -> StreamQuality {
    let digits: String = resolution
        .unwrap_or_default()
        .chars()
        .take_while(|c| c.is_ascii_digit())
        .collect();
    match digits.as_str() {
        "360" => StreamQuality::Q360,
        "480" => StreamQuality::Q480,
        "1080" => StreamQuality::Q1080,
        _ => StreamQuality::Q720,
    }
}

fn sorted_episodes(mut episodes: Vec<String>) -> Vec<String> {
    episodes.sort_by(|a, b| episode_sort_key(a).total_cmp(&episode_sort_key(b)));
    episodes
}

fn map_show(show: Show) -> ProviderSearchResult {
    let episodes = show
        .available_episodes_detail
        .map(|d| AnimeEpisodes {
            sub: sorted_episodes(d.sub),
            dub: sorted_episodes(d.dub),
            raw: sorted_episodes(d.raw),
        })
        .unwrap_or_default();

    let mut other_titles = Vec::new();
    if let Some(english) = show.english_name {
        other_titles.push(english);
    }
    if let Some(native) = show.native_name {
        other_titles.push(native);
    }

    ProviderSearchResult {
        id: show.id,
        title: show.name,
        other_titles,
        episodes,
        media_type: show.media_type,
        poster: show.thumbnail,
        year: show.season.and_then(|s| s.year).map(|y| y.to_string()),
    }
}

pub struct AllAnime {
    client: Client,
    search_cache: Mutex<HashMap<String, SearchResults>>,
}

impl Default for AllAnime {
    fn default() -> Self {
        Self::new()
    }
}

impl AllAnime {
    pub fn new() -> Self {
        Self {
            client: provider_client(ProviderName::AllAnime),
            search_cache: Mutex::new(HashMap::new()),
        }
    }

    async fn graphql<T: serde::de::DeserializeOwned>(
        &self,
        query: &str,
        variables: serde_json::Value,
    ) -> Result<Option<T>> {
        let response = self
            .client
            .get(API_BASE)
            .query(&[("variables", variables.to_string()), ("query", query.to_string())])
            .send()
            .await
            .context("allanime request failed")?;

        let data: GqlData<T> = response
            .json()
            .await
            .context("allanime returned malformed JSON")?;
        Ok(data.data)
    }

    /// Resolve one obfuscated source into a server, fetching the link list
    /// endpoint when required. Returns None (and logs) on any failure so the
    /// stream skips to the next source.
    async fn resolve_source(
        client: Client,
        source: SourceUrl,
        episode_title: Option<String>,
    ) -> Option<Server> {
        let url = if source.source_url.starts_with("--") {
            decrypt_source_url(&source.source_url)?
        } else {
            source.source_url.clone()
        };

        if let Some(path) = url.strip_prefix("/apivtwo/clock?") {
            let endpoint = format!("{CLOCK_BASE}/apivtwo/clock.json?{path}");
            let clock: ClockResponse = match client.get(&endpoint).send().await {
                Ok(resp) => match resp.json().await {
                    Ok(clock) => clock,
                    Err(err) => {
                        debug!(source = %source.source_name, error = %err, "bad clock payload");
                        return None;
                    }
                },
                Err(err) => {
                    debug!(source = %source.source_name, error = %err, "clock fetch failed");
                    return None;
                }
            };

            let mut headers = HashMap::new();
            let mut subtitles = Vec::new();
            let links: Vec<EpisodeStream> = clock
                .links
                .into_iter()
                .map(|l| {
                    if let Some(h) = l.headers {
                        headers.extend(h);
                    }
                    for sub in l.subtitles {
                        subtitles.push(Subtitle {
                            url: sub.src,
                            language: sub.lang,
                        });
                    }
                    EpisodeStream {
                        quality: parse_quality(l.resolution_str.as_deref()),
                        link: l.link,
                        title: None,
                        format: None,
                        hls: l.hls,
                        mp4: l.mp4,
                        priority: source.priority.map(|p| p as i32),
                    }
                })
                .collect();

            if links.is_empty() {
                return None;
            }
            Some(Server {
                name: source.source_name,
                links,
                episode_title,
                headers,
                subtitles,
                audio: Vec::new(),
            })
        } else if url.starts_with("http") {
            // Direct-hosted mp4 (sharepoint, wixmp, ...): the url is the link.
            Some(Server {
                name: source.source_name,
                links: vec![EpisodeStream {
                    link: url,
                    title: None,
                    quality: StreamQuality::Q720,
                    format: None,
                    hls: None,
                    mp4: Some(true),
                    priority: source.priority.map(|p| p as i32),
                }],
                episode_title,
                headers: HashMap::new(),
                subtitles: Vec::new(),
                audio: Vec::new(),
            })
        } else {
            debug!(source = %source.source_name, "unsupported source url shape");
            None
        }
    }
}

#[async_trait]
impl AnimeProvider for AllAnime {
    fn name(&self) -> ProviderName {
        ProviderName::AllAnime
    }

    async fn search(&self, params: &SearchParams) -> Result<Option<SearchResults>> {
        let cache_key = format!("{}:{}", params.translation_type.as_str(), params.query);
        if let Some(hit) = self.search_cache.lock().unwrap().get(&cache_key) {
            return Ok(Some(hit.clone()));
        }

        let variables = json!({
            "search": { "allowAdult": false, "allowUnknown": false, "query": params.query },
            "limit": 40,
            "page": 1,
            "translationType": params.translation_type.as_str(),
            "countryOrigin": "ALL",
        });

        let Some(page) = self.graphql::<ShowsPage>(SEARCH_GQL, variables).await? else {
            return Ok(None);
        };
        if page.shows.edges.is_empty() {
            return Ok(None);
        }

        let results = SearchResults {
            page_info: ProviderPageInfo {
                total: page.shows.page_info.and_then(|p| p.total),
                per_page: Some(40),
                current_page: Some(1),
            },
            results: page.shows.edges.into_iter().map(map_show).collect(),
        };

        self.search_cache
            .lock()
            .unwrap()
            .insert(cache_key, results.clone());
        Ok(Some(results))
    }

    async fn get(&self, params: &AnimeParams) -> Result<Option<Anime>> {
        let Some(data) = self
            .graphql::<ShowData>(SHOW_GQL, json!({ "showId": params.id }))
            .await?
        else {
            return Ok(None);
        };

        Ok(data.show.map(|show| {
            let mapped = map_show(show);
            Anime {
                id: mapped.id,
                title: mapped.title,
                episodes: mapped.episodes,
                episodes_info: None,
                media_type: mapped.media_type,
                poster: mapped.poster,
                year: mapped.year,
            }
        }))
    }

    async fn episode_streams(&self, params: &EpisodeStreamsParams) -> Result<Option<ServerStream>> {
        let variables = json!({
            "showId": params.anime_id,
            "translationType": params.translation_type.as_str(),
            "episodeString": params.episode,
        });

        let Some(data) = self.graphql::<EpisodeData>(EPISODE_GQL, variables).await? else {
            return Ok(None);
        };
        let Some(episode) = data.episode else {
            return Ok(None);
        };

        let episode_title = episode
            .notes
            .clone()
            .or_else(|| episode.episode_string.map(|e| format!("Episode {e}")));

        // Preference order is priority-descending; resolution happens lazily
        // as the caller pulls.
        let mut sources = episode.source_urls;
        sources.sort_by(|a, b| {
            b.priority
                .unwrap_or(0.0)
                .total_cmp(&a.priority.unwrap_or(0.0))
        });
        if sources.is_empty() {
            return Ok(None);
        }
        debug!(count = sources.len(), episode = %params.episode, "allanime sources found");

        let client = self.client.clone();
        let stream = futures::stream::iter(sources)
            .then(move |source| {
                let client = client.clone();
                let title = episode_title.clone();
                async move { Self::resolve_source(client, source, title).await }
            })
            .filter_map(|server| async { server });

        Ok(Some(Box::pin(stream)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn source_url_decryption() {
        // "--" + hex of each byte of "/a" xor 56: '/'^56=0x17, 'a'^56=0x59
        assert_eq!(decrypt_source_url("--1759"), Some("/a".to_string()));
        assert_eq!(decrypt_source_url("not-encrypted"), None);
        assert_eq!(decrypt_source_url("--xyz"), None);
    }

    #[test]
    fn resolution_strings_map_to_qualities() {
        assert_eq!(parse_quality(Some("1080p")), StreamQuality::Q1080);
        assert_eq!(parse_quality(Some("480 alt")), StreamQuality::Q480);
        assert_eq!(parse_quality(None), StreamQuality::Q720);
    }

    #[test]
    fn episode_lists_are_sorted_numerically() {
        let sorted = sorted_episodes(vec!["10".into(), "2".into(), "7.5".into(), "1".into()]);
        assert_eq!(sorted, vec!["1", "2", "7.5", "10"]);
    }
}
