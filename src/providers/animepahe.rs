//! AnimePahe provider.
//!
//! AnimePahe exposes a small JSON API: `m=search` for titles, `m=release`
//! for the paginated episode list of a release, and `m=links` for the kwik
//! links of one episode. Episode identifiers map to per-episode session ids,
//! so `get` walks the release pages once and keeps the mapping.

use std::collections::HashMap;
use std::sync::Mutex;

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use tracing::debug;

use super::{AnimeProvider, ProviderName, ServerStream, provider_client};
use crate::models::provider::{
    Anime, AnimeEpisodes, AnimeParams, EpisodeInfo, EpisodeStream, EpisodeStreamsParams,
    ProviderPageInfo, ProviderSearchResult, SearchParams, SearchResults, Server, StreamQuality,
};

const API_BASE: &str = "https://animepahe.ru/api";

#[derive(Deserialize)]
struct SearchResponse {
    #[serde(default)]
    data: Vec<SearchItem>,
    total: Option<usize>,
    per_page: Option<usize>,
    current_page: Option<usize>,
}

#[derive(Deserialize)]
struct SearchItem {
    session: String,
    title: String,
    #[serde(rename = "type")]
    media_type: Option<String>,
    episodes: Option<u32>,
    poster: Option<String>,
    year: Option<i32>,
}

#[derive(Deserialize)]
struct ReleaseResponse {
    #[serde(default)]
    data: Vec<ReleaseEpisode>,
    last_page: Option<u32>,
}

#[derive(Deserialize)]
struct ReleaseEpisode {
    session: String,
    episode: serde_json::Number,
    title: Option<String>,
    snapshot: Option<String>,
    duration: Option<String>,
}

#[derive(Deserialize)]
struct LinksResponse {
    #[serde(default)]
    data: Vec<HashMap<String, LinkEntry>>,
}

#[derive(Deserialize)]
struct LinkEntry {
    kwik: Option<String>,
    #[serde(rename = "kwik_pahewin")]
    kwik_pahewin: Option<String>,
    audio: Option<String>,
}

fn quality_of(label: &str) -> StreamQuality {
    match label {
        "360" => StreamQuality::Q360,
        "480" => StreamQuality::Q480,
        "1080" => StreamQuality::Q1080,
        _ => StreamQuality::Q720,
    }
}

pub struct AnimePahe {
    client: Client,
    /// anime session → (episode number → episode session).
    episode_sessions: Mutex<HashMap<String, HashMap<String, String>>>,
}

impl Default for AnimePahe {
    fn default() -> Self {
        Self::new()
    }
}

impl AnimePahe {
    pub fn new() -> Self {
        Self {
            client: provider_client(ProviderName::AnimePahe),
            episode_sessions: Mutex::new(HashMap::new()),
        }
    }

    async fn fetch_release_page(&self, id: &str, page: u32) -> Result<ReleaseResponse> {
        self.client
            .get(API_BASE)
            .query(&[
                ("m", "release"),
                ("id", id),
                ("sort", "episode_asc"),
                ("page", &page.to_string()),
            ])
            .send()
            .await
            .context("animepahe release request failed")?
            .json()
            .await
            .context("animepahe returned malformed release JSON")
    }
}

#[async_trait]
impl AnimeProvider for AnimePahe {
    fn name(&self) -> ProviderName {
        ProviderName::AnimePahe
    }

    async fn search(&self, params: &SearchParams) -> Result<Option<SearchResults>> {
        let response: SearchResponse = self
            .client
            .get(API_BASE)
            .query(&[("m", "search"), ("q", params.query.as_str())])
            .send()
            .await
            .context("animepahe search failed")?
            .json()
            .await
            .context("animepahe returned malformed search JSON")?;

        if response.data.is_empty() {
            return Ok(None);
        }

        let results = response
            .data
            .into_iter()
            .map(|item| {
                // The search payload only carries a count; identifiers are
                // synthesized and refined by `get`.
                let episodes: Vec<String> =
                    (1..=item.episodes.unwrap_or(0)).map(|n| n.to_string()).collect();
                ProviderSearchResult {
                    id: item.session,
                    title: item.title,
                    other_titles: Vec::new(),
                    episodes: AnimeEpisodes {
                        sub: episodes.clone(),
                        dub: Vec::new(),
                        raw: episodes,
                    },
                    media_type: item.media_type,
                    poster: item.poster,
                    year: item.year.map(|y| y.to_string()),
                }
            })
            .collect();

        Ok(Some(SearchResults {
            page_info: ProviderPageInfo {
                total: response.total,
                per_page: response.per_page,
                current_page: response.current_page,
            },
            results,
        }))
    }

    async fn get(&self, params: &AnimeParams) -> Result<Option<Anime>> {
        let mut sessions = HashMap::new();
        let mut episodes = Vec::new();
        let mut info = Vec::new();

        let mut page = 1;
        loop {
            let release = self.fetch_release_page(&params.id, page).await?;
            if release.data.is_empty() {
                break;
            }
            for ep in release.data {
                let number = ep.episode.to_string();
                sessions.insert(number.clone(), ep.session.clone());
                info.push(EpisodeInfo {
                    id: ep.session,
                    episode: number.clone(),
                    title: ep.title,
                    poster: ep.snapshot,
                    duration: ep.duration,
                });
                episodes.push(number);
            }
            match release.last_page {
                Some(last) if page < last => page += 1,
                _ => break,
            }
        }

        if episodes.is_empty() {
            return Ok(None);
        }

        self.episode_sessions
            .lock()
            .unwrap()
            .insert(params.id.clone(), sessions);

        Ok(Some(Anime {
            id: params.id.clone(),
            title: params.query.clone(),
            episodes: AnimeEpisodes {
                sub: episodes.clone(),
                dub: Vec::new(),
                raw: episodes,
            },
            episodes_info: Some(info),
            media_type: None,
            poster: None,
            year: None,
        }))
    }

    async fn episode_streams(&self, params: &EpisodeStreamsParams) -> Result<Option<ServerStream>> {
        let session = self
            .episode_sessions
            .lock()
            .unwrap()
            .get(&params.anime_id)
            .and_then(|m| m.get(&params.episode))
            .cloned();

        let Some(session) = session else {
            debug!(episode = %params.episode, "no cached session; was `get` called first?");
            return Ok(None);
        };

        let links: LinksResponse = self
            .client
            .get(API_BASE)
            .query(&[
                ("m", "links"),
                ("id", session.as_str()),
                ("p", "kwik"),
            ])
            .send()
            .await
            .context("animepahe links request failed")?
            .json()
            .await
            .context("animepahe returned malformed links JSON")?;

        let mut streams = Vec::new();
        for entry in links.data {
            for (label, link) in entry {
                let Some(url) = link.kwik_pahewin.or(link.kwik) else {
                    continue;
                };
                let is_dub = link.audio.as_deref() == Some("eng");
                if (params.translation_type == crate::models::provider::TranslationType::Dub)
                    != is_dub
                {
                    continue;
                }
                streams.push(EpisodeStream {
                    link: url,
                    title: None,
                    quality: quality_of(&label),
                    format: None,
                    hls: Some(true),
                    mp4: None,
                    priority: None,
                });
            }
        }

        if streams.is_empty() {
            return Ok(None);
        }

        let server = Server {
            name: "kwik".to_string(),
            links: streams,
            episode_title: Some(format!("Episode {}", params.episode)),
            headers: HashMap::from([(
                "Referer".to_string(),
                "https://kwik.cx/".to_string(),
            )]),
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
    fn quality_labels_map() {
        assert_eq!(quality_of("1080"), StreamQuality::Q1080);
        assert_eq!(quality_of("720"), StreamQuality::Q720);
        assert_eq!(quality_of("strange"), StreamQuality::Q720);
    }

    #[test]
    fn release_episode_numbers_keep_decimals() {
        let raw = serde_json::json!({
            "session": "abc",
            "episode": 7.5
        });
        let ep: ReleaseEpisode = serde_json::from_value(raw).unwrap();
        assert_eq!(ep.episode.to_string(), "7.5");
    }
}
