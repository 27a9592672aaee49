//! HiAnime provider.
//!
//! Search results come from server-rendered HTML; episode and server lists
//! come from the site's ajax endpoints which wrap HTML fragments in JSON.
//! The fragments are regular enough that a small regex table covers them.

use std::collections::HashMap;
use std::sync::OnceLock;

use anyhow::{Context, Result};
use async_trait::async_trait;
use futures::StreamExt;
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

const SITE_BASE: &str = "https://hianime.to";

struct HiAnimeRegex {
    film_item: Regex,
    film_id: Regex,
    film_name: Regex,
    tick_sub: Regex,
    tick_dub: Regex,
    poster: Regex,
    episode_item: Regex,
    server_item: Regex,
}

impl HiAnimeRegex {
    fn get() -> &'static Self {
        static INSTANCE: OnceLock<HiAnimeRegex> = OnceLock::new();
        INSTANCE.get_or_init(|| Self {
            film_item: Regex::new(r#"(?s)<div class="flw-item">(.*?)</div>\s*</div>\s*</div>"#)
                .expect("Invalid Regex"),
            film_id: Regex::new(r#"href="/watch/[^"]*-(\d+)[?"]"#).expect("Invalid Regex"),
            film_name: Regex::new(r#"(?s)class="film-name">\s*<a[^>]*title="([^"]+)""#)
                .expect("Invalid Regex"),
            tick_sub: Regex::new(r#"tick-item tick-sub">\s*(\d+)"#).expect("Invalid Regex"),
            tick_dub: Regex::new(r#"tick-item tick-dub">\s*(\d+)"#).expect("Invalid Regex"),
            poster: Regex::new(r#"data-src="([^"]+)""#).expect("Invalid Regex"),
            episode_item: Regex::new(
                r#"(?s)class="ssl-item\s+ep-item"[^>]*data-number="([^"]+)"[^>]*data-id="(\d+)"[^>]*title="([^"]*)""#,
            )
            .expect("Invalid Regex"),
            server_item: Regex::new(
                r#"(?s)class="server-item"[^>]*data-type="(\w+)"[^>]*data-id="(\d+)"[^>]*>\s*<a[^>]*>([^<]+)</a>"#,
            )
            .expect("Invalid Regex"),
        })
    }
}

#[derive(Deserialize)]
struct AjaxHtml {
    html: String,
}

#[derive(Deserialize)]
struct AjaxSources {
    link: Option<String>,
    #[serde(rename = "type")]
    kind: Option<String>,
}

fn parse_search_html(html: &str) -> Vec<ProviderSearchResult> {
    let re = HiAnimeRegex::get();
    re.film_item
        .captures_iter(html)
        .filter_map(|cap| {
            let fragment = cap.get(1)?.as_str();
            let id = re.film_id.captures(fragment)?.get(1)?.as_str().to_string();
            let title = re
                .film_name
                .captures(fragment)?
                .get(1)?
                .as_str()
                .to_string();
            let title = html_escape::decode_html_entities(&title).to_string();
            let sub_count: u32 = re
                .tick_sub
                .captures(fragment)
                .and_then(|c| c.get(1)?.as_str().parse().ok())
                .unwrap_or(0);
            let dub_count: u32 = re
                .tick_dub
                .captures(fragment)
                .and_then(|c| c.get(1)?.as_str().parse().ok())
                .unwrap_or(0);
            let poster = re
                .poster
                .captures(fragment)
                .map(|c| c[1].to_string());

            Some(ProviderSearchResult {
                id,
                title,
                other_titles: Vec::new(),
                episodes: AnimeEpisodes {
                    sub: (1..=sub_count).map(|n| n.to_string()).collect(),
                    dub: (1..=dub_count).map(|n| n.to_string()).collect(),
                    raw: Vec::new(),
                },
                media_type: None,
                poster,
                year: None,
            })
        })
        .collect()
}

pub struct HiAnime {
    client: Client,
}

impl Default for HiAnime {
    fn default() -> Self {
        Self::new()
    }
}

impl HiAnime {
    pub fn new() -> Self {
        Self {
            client: provider_client(ProviderName::HiAnime),
        }
    }

    async fn episode_list(&self, anime_id: &str) -> Result<Vec<EpisodeInfo>> {
        let ajax: AjaxHtml = self
            .client
            .get(format!("{SITE_BASE}/ajax/v2/episode/list/{anime_id}"))
            .send()
            .await
            .context("hianime episode list failed")?
            .json()
            .await
            .context("hianime returned malformed episode JSON")?;

        let re = HiAnimeRegex::get();
        Ok(re
            .episode_item
            .captures_iter(&ajax.html)
            .map(|cap| EpisodeInfo {
                episode: cap[1].to_string(),
                id: cap[2].to_string(),
                title: Some(html_escape::decode_html_entities(&cap[3]).to_string()),
                poster: None,
                duration: None,
            })
            .collect())
    }

    /// Fetch the embed link behind one server entry; logged-and-skipped on
    /// failure so the stream moves on to the next server.
    async fn resolve_server(
        client: Client,
        source_id: String,
        server_name: String,
        episode_title: Option<String>,
    ) -> Option<Server> {
        let sources: AjaxSources = match client
            .get(format!("{SITE_BASE}/ajax/v2/episode/sources?id={source_id}"))
            .send()
            .await
        {
            Ok(resp) => match resp.json().await {
                Ok(s) => s,
                Err(err) => {
                    debug!(server = %server_name, error = %err, "bad sources payload");
                    return None;
                }
            },
            Err(err) => {
                debug!(server = %server_name, error = %err, "sources fetch failed");
                return None;
            }
        };

        let link = sources.link?;
        Some(Server {
            name: server_name,
            links: vec![EpisodeStream {
                link,
                title: None,
                quality: StreamQuality::Q1080,
                format: sources.kind,
                hls: Some(true),
                mp4: None,
                priority: None,
            }],
            episode_title,
            headers: HashMap::from([("Referer".to_string(), format!("{SITE_BASE}/"))]),
            subtitles: Vec::new(),
            audio: Vec::new(),
        })
    }
}

#[async_trait]
impl AnimeProvider for HiAnime {
    fn name(&self) -> ProviderName {
        ProviderName::HiAnime
    }

    async fn search(&self, params: &SearchParams) -> Result<Option<SearchResults>> {
        let html = self
            .client
            .get(format!(
                "{SITE_BASE}/search?keyword={}",
                urlencoding::encode(&params.query)
            ))
            .send()
            .await
            .context("hianime search failed")?
            .text()
            .await
            .context("hianime search returned no body")?;

        let results = parse_search_html(&html);
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
        let episodes_info = self.episode_list(&params.id).await?;
        if episodes_info.is_empty() {
            return Ok(None);
        }

        let numbers: Vec<String> = episodes_info.iter().map(|e| e.episode.clone()).collect();
        Ok(Some(Anime {
            id: params.id.clone(),
            title: params.query.clone(),
            episodes: AnimeEpisodes {
                sub: numbers.clone(),
                dub: numbers,
                raw: Vec::new(),
            },
            episodes_info: Some(episodes_info),
            media_type: None,
            poster: None,
            year: None,
        }))
    }

    async fn episode_streams(&self, params: &EpisodeStreamsParams) -> Result<Option<ServerStream>> {
        // Episode number → ajax episode id.
        let episodes = self.episode_list(&params.anime_id).await?;
        let Some(episode) = episodes.iter().find(|e| e.episode == params.episode) else {
            return Ok(None);
        };

        let ajax: AjaxHtml = self
            .client
            .get(format!(
                "{SITE_BASE}/ajax/v2/episode/servers?episodeId={}",
                episode.id
            ))
            .send()
            .await
            .context("hianime servers request failed")?
            .json()
            .await
            .context("hianime returned malformed servers JSON")?;

        let wanted = match params.translation_type {
            TranslationType::Dub => "dub",
            _ => "sub",
        };

        let re = HiAnimeRegex::get();
        let servers: Vec<(String, String)> = re
            .server_item
            .captures_iter(&ajax.html)
            .filter(|cap| &cap[1] == wanted)
            .map(|cap| (cap[2].to_string(), cap[3].trim().to_string()))
            .collect();

        if servers.is_empty() {
            return Ok(None);
        }

        let episode_title = episode.title.clone();
        let client = self.client.clone();
        let stream = futures::stream::iter(servers)
            .then(move |(source_id, name)| {
                let client = client.clone();
                let title = episode_title.clone();
                async move { Self::resolve_server(client, source_id, name, title).await }
            })
            .filter_map(|server| async { server });

        Ok(Some(Box::pin(stream)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
        <div class="flw-item">
            <img data-src="https://img.example/poster.jpg">
            <div class="tick-item tick-sub">12</div>
            <div class="tick-item tick-dub">10</div>
            <a href="/watch/attack-on-titan-112?ref=search" class="film-poster-ahref"></a>
            <h3 class="film-name">
                <a href="/attack-on-titan-112" title="Attack on Titan">Attack on Titan</a>
            </h3>
        </div>
        </div>
        </div>
    "#;

    #[test]
    fn search_html_parses_into_results() {
        let results = parse_search_html(SAMPLE);
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].id, "112");
        assert_eq!(results[0].title, "Attack on Titan");
        assert_eq!(results[0].episodes.sub.len(), 12);
        assert_eq!(results[0].episodes.dub.len(), 10);
    }

    #[test]
    fn episode_fragments_parse() {
        let html = r#"<a class="ssl-item  ep-item" data-number="5" data-id="98765" title="The Battle">"#;
        let caps = HiAnimeRegex::get().episode_item.captures(html).unwrap();
        assert_eq!(&caps[1], "5");
        assert_eq!(&caps[2], "98765");
        assert_eq!(&caps[3], "The Battle");
    }
}
