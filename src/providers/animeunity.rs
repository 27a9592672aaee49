//! AnimeUnity provider.
//!
//! The archive page embeds its records as HTML-escaped JSON; episodes come
//! from a paginated info API; the embed page carries the HLS playlist url.

use std::collections::HashMap;
use std::sync::OnceLock;

use anyhow::{Context, Result};
use async_trait::async_trait;
use regex::Regex;
use reqwest::Client;
use serde::Deserialize;
use tracing::debug;

use super::{AnimeProvider, ProviderName, ServerStream, provider_client};
use crate::models::provider::{
    Anime, AnimeEpisodes, AnimeParams, EpisodeInfo, EpisodeStream, EpisodeStreamsParams,
    ProviderPageInfo, ProviderSearchResult, SearchParams, SearchResults, Server, StreamQuality,
    TranslationType,
};

const SITE_BASE: &str = "https://www.animeunity.so";
const EPISODES_PER_PAGE: u32 = 120;

#[derive(Deserialize)]
struct ArchiveRecord {
    id: i64,
    slug: String,
    title_eng: Option<String>,
    title_it: Option<String>,
    title: Option<String>,
    episodes_count: Option<u32>,
    #[serde(rename = "type")]
    media_type: Option<String>,
    imageurl: Option<String>,
    date: Option<String>,
    dub: Option<serde_json::Value>,
}

#[derive(Deserialize)]
struct InfoApiResponse {
    #[serde(default)]
    episodes: Vec<InfoEpisode>,
    episodes_count: Option<u32>,
}

#[derive(Deserialize)]
struct InfoEpisode {
    id: i64,
    number: String,
}

struct UnityRegex {
    archive_records: Regex,
    playlist_url: Regex,
    playlist_token: Regex,
    playlist_expires: Regex,
}

impl UnityRegex {
    fn get() -> &'static Self {
        static INSTANCE: OnceLock<UnityRegex> = OnceLock::new();
        INSTANCE.get_or_init(|| Self {
            archive_records: Regex::new(r#"<archivio records="([^"]+)""#).expect("Invalid Regex"),
            playlist_url: Regex::new(r#"url:\s*'([^']+)'"#).expect("Invalid Regex"),
            playlist_token: Regex::new(r#"'token':\s*'([^']+)'"#).expect("Invalid Regex"),
            playlist_expires: Regex::new(r#"'expires':\s*'([^']+)'"#).expect("Invalid Regex"),
        })
    }
}

fn is_dubbed(record: &ArchiveRecord) -> bool {
    match &record.dub {
        Some(serde_json::Value::Bool(b)) => *b,
        Some(serde_json::Value::Number(n)) => n.as_i64() == Some(1),
        Some(serde_json::Value::String(s)) => s == "1",
        _ => false,
    }
}

fn map_record(record: ArchiveRecord) -> ProviderSearchResult {
    let dubbed = is_dubbed(&record);
    let numbers: Vec<String> = (1..=record.episodes_count.unwrap_or(0))
        .map(|n| n.to_string())
        .collect();
    let title = record
        .title_eng
        .clone()
        .or(record.title.clone())
        .or(record.title_it.clone())
        .unwrap_or_else(|| record.slug.clone());
    let mut other_titles = Vec::new();
    for alt in [record.title, record.title_it] {
        if let Some(alt) = alt {
            if alt != title {
                other_titles.push(alt);
            }
        }
    }

    ProviderSearchResult {
        id: format!("{}-{}", record.id, record.slug),
        title,
        other_titles,
        episodes: if dubbed {
            AnimeEpisodes {
                sub: Vec::new(),
                dub: numbers,
                raw: Vec::new(),
            }
        } else {
            AnimeEpisodes {
                sub: numbers,
                dub: Vec::new(),
                raw: Vec::new(),
            }
        },
        media_type: record.media_type,
        poster: record.imageurl,
        year: record.date.and_then(|d| d.get(..4).map(str::to_string)),
    }
}

pub struct AnimeUnity {
    client: Client,
}

impl Default for AnimeUnity {
    fn default() -> Self {
        Self::new()
    }
}

impl AnimeUnity {
    pub fn new() -> Self {
        Self {
            client: provider_client(ProviderName::AnimeUnity),
        }
    }

    async fn fetch_episodes(&self, anime_id: &str) -> Result<Vec<InfoEpisode>> {
        let numeric: &str = anime_id.split('-').next().unwrap_or(anime_id);
        let mut all = Vec::new();
        let mut start = 1u32;
        loop {
            let end = start + EPISODES_PER_PAGE - 1;
            let response: InfoApiResponse = self
                .client
                .get(format!(
                    "{SITE_BASE}/info_api/{numeric}/1?start_range={start}&end_range={end}"
                ))
                .send()
                .await
                .context("animeunity info api failed")?
                .json()
                .await
                .context("animeunity info api returned malformed JSON")?;

            let total = response.episodes_count.unwrap_or(0);
            all.extend(response.episodes);
            if all.len() as u32 >= total || total == 0 {
                break;
            }
            start = end + 1;
        }
        Ok(all)
    }
}

#[async_trait]
impl AnimeProvider for AnimeUnity {
    fn name(&self) -> ProviderName {
        ProviderName::AnimeUnity
    }

    async fn search(&self, params: &SearchParams) -> Result<Option<SearchResults>> {
        let html = self
            .client
            .get(format!(
                "{SITE_BASE}/archivio?title={}",
                urlencoding::encode(&params.query)
            ))
            .send()
            .await
            .context("animeunity search failed")?
            .text()
            .await?;

        let Some(raw) = UnityRegex::get()
            .archive_records
            .captures(&html)
            .map(|c| c[1].to_string())
        else {
            return Ok(None);
        };
        let decoded = html_escape::decode_html_entities(&raw).to_string();
        let records: Vec<ArchiveRecord> =
            serde_json::from_str(&decoded).context("animeunity archive records unparseable")?;
        if records.is_empty() {
            return Ok(None);
        }

        let wants_dub = params.translation_type == TranslationType::Dub;
        let results: Vec<ProviderSearchResult> = records
            .into_iter()
            .filter(|r| is_dubbed(r) == wants_dub)
            .map(map_record)
            .collect();
        if results.is_empty() {
            return Ok(None);
        }

        Ok(Some(SearchResults {
            page_info: ProviderPageInfo {
                total: Some(results.len()),
                per_page: None,
                current_page: Some(1),
            },
            results,
        }))
    }

    async fn get(&self, params: &AnimeParams) -> Result<Option<Anime>> {
        let episodes = self.fetch_episodes(&params.id).await?;
        if episodes.is_empty() {
            return Ok(None);
        }

        let info: Vec<EpisodeInfo> = episodes
            .iter()
            .map(|e| EpisodeInfo {
                id: e.id.to_string(),
                episode: e.number.clone(),
                title: None,
                poster: None,
                duration: None,
            })
            .collect();
        let numbers: Vec<String> = episodes.into_iter().map(|e| e.number).collect();

        Ok(Some(Anime {
            id: params.id.clone(),
            title: params.query.clone(),
            episodes: AnimeEpisodes {
                sub: numbers.clone(),
                dub: numbers,
                raw: Vec::new(),
            },
            episodes_info: Some(info),
            media_type: None,
            poster: None,
            year: None,
        }))
    }

    async fn episode_streams(&self, params: &EpisodeStreamsParams) -> Result<Option<ServerStream>> {
        let episodes = self.fetch_episodes(&params.anime_id).await?;
        let Some(episode) = episodes.iter().find(|e| e.number == params.episode) else {
            return Ok(None);
        };

        let embed_url = self
            .client
            .get(format!("{SITE_BASE}/embed-url/{}", episode.id))
            .send()
            .await
            .context("animeunity embed-url failed")?
            .text()
            .await?
            .trim()
            .to_string();
        if !embed_url.starts_with("http") {
            return Ok(None);
        }

        let embed_page = self
            .client
            .get(&embed_url)
            .send()
            .await
            .context("animeunity embed page failed")?
            .text()
            .await?;

        let re = UnityRegex::get();
        let Some(playlist) = re.playlist_url.captures(&embed_page).map(|c| c[1].to_string())
        else {
            debug!("no playlist url in vixcloud embed");
            return Ok(None);
        };
        // Token and expiry are query parameters of the playlist.
        let token = re.playlist_token.captures(&embed_page).map(|c| c[1].to_string());
        let expires = re
            .playlist_expires
            .captures(&embed_page)
            .map(|c| c[1].to_string());
        let mut link = playlist;
        if let (Some(token), Some(expires)) = (token, expires) {
            let sep = if link.contains('?') { '&' } else { '?' };
            link = format!("{link}{sep}token={token}&expires={expires}");
        }

        let server = Server {
            name: "vixcloud".to_string(),
            links: vec![EpisodeStream {
                link,
                title: None,
                quality: StreamQuality::Q1080,
                format: Some("hls".to_string()),
                hls: Some(true),
                mp4: None,
                priority: None,
            }],
            episode_title: Some(format!("Episode {}", params.episode)),
            headers: HashMap::from([("Referer".to_string(), embed_url)]),
            subtitles: Vec::new(),
            audio: Vec::new(),
        };

        Ok(Some(Box::pin(futures::stream::iter(vec![server]))))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn archive_records_decode_from_escaped_json() {
        let raw = r#"[{"id":42,"slug":"frieren","title_eng":"Frieren","episodes_count":28,"dub":0,"date":"2023-09-29"}]"#;
        let records: Vec<ArchiveRecord> = serde_json::from_str(raw).unwrap();
        let result = map_record(records.into_iter().next().unwrap());
        assert_eq!(result.id, "42-frieren");
        assert_eq!(result.title, "Frieren");
        assert_eq!(result.episodes.sub.len(), 28);
        assert_eq!(result.year.as_deref(), Some("2023"));
    }

    #[test]
    fn dub_flag_accepts_every_wire_shape() {
        for (value, expected) in [
            (serde_json::json!(1), true),
            (serde_json::json!(0), false),
            (serde_json::json!(true), true),
            (serde_json::json!("1"), true),
        ] {
            let record = ArchiveRecord {
                id: 1,
                slug: "x".into(),
                title_eng: None,
                title_it: None,
                title: None,
                episodes_count: None,
                media_type: None,
                imageurl: None,
                date: None,
                dub: Some(value),
            };
            assert_eq!(is_dubbed(&record), expected);
        }
    }
}
