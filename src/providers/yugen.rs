//! Yugen provider.
//!
//! Server-rendered pages for discovery, a JSON embed API for streams. One
//! server ("yugen") per episode with an HLS playlist.

use std::collections::HashMap;
use std::sync::OnceLock;

use anyhow::{Context, Result};
use async_trait::async_trait;
use regex::Regex;
use reqwest::Client;
use serde::Deserialize;

use super::{AnimeProvider, ProviderName, ServerStream, provider_client};
use crate::models::provider::{
    Anime, AnimeEpisodes, AnimeParams, EpisodeStream, EpisodeStreamsParams, ProviderPageInfo,
    ProviderSearchResult, SearchParams, SearchResults, Server, StreamQuality, TranslationType,
};

const SITE_BASE: &str = "https://yugenanime.tv";

struct YugenRegex {
    search_item: Regex,
    episode_link: Regex,
    embed_frame: Regex,
}

impl YugenRegex {
    fn get() -> &'static Self {
        static INSTANCE: OnceLock<YugenRegex> = OnceLock::new();
        INSTANCE.get_or_init(|| Self {
            search_item: Regex::new(
                r#"href="/anime/(\d+)/([a-z0-9-]+)/"[^>]*class="anime-meta"[^>]*title="([^"]+)""#,
            )
            .expect("Invalid Regex"),
            episode_link: Regex::new(r#"href="/watch/\d+/[a-z0-9-]+/(\d+)/""#)
                .expect("Invalid Regex"),
            embed_frame: Regex::new(r#"id="main-embed"[^>]*src="[^"]*/e/([^/"]+)/?""#)
                .expect("Invalid Regex"),
        })
    }
}

#[derive(Deserialize)]
struct EmbedResponse {
    #[serde(default)]
    hls: Vec<String>,
}

pub struct Yugen {
    client: Client,
}

impl Default for Yugen {
    fn default() -> Self {
        Self::new()
    }
}

impl Yugen {
    pub fn new() -> Self {
        Self {
            client: provider_client(ProviderName::Yugen),
        }
    }

    /// "id/slug" is the provider id; both halves are needed to build urls.
    fn split_id(id: &str) -> Option<(&str, &str)> {
        id.split_once('/')
    }

    async fn episode_numbers(&self, numeric_id: &str, slug: &str, dub: bool) -> Result<Vec<String>> {
        let path = if dub { "watch/?sort=episode&dub=1" } else { "watch/" };
        let html = self
            .client
            .get(format!("{SITE_BASE}/anime/{numeric_id}/{slug}/{path}"))
            .send()
            .await
            .context("yugen episode page failed")?
            .text()
            .await?;

        let re = YugenRegex::get();
        let mut numbers: Vec<String> = re
            .episode_link
            .captures_iter(&html)
            .map(|c| c[1].to_string())
            .collect();
        numbers.sort_by(|a, b| {
            crate::utils::time::episode_sort_key(a).total_cmp(&crate::utils::time::episode_sort_key(b))
        });
        numbers.dedup();
        Ok(numbers)
    }
}

#[async_trait]
impl AnimeProvider for Yugen {
    fn name(&self) -> ProviderName {
        ProviderName::Yugen
    }

    async fn search(&self, params: &SearchParams) -> Result<Option<SearchResults>> {
        let html = self
            .client
            .get(format!(
                "{SITE_BASE}/discover/?q={}",
                urlencoding::encode(&params.query)
            ))
            .send()
            .await
            .context("yugen search failed")?
            .text()
            .await?;

        let re = YugenRegex::get();
        let results: Vec<ProviderSearchResult> = re
            .search_item
            .captures_iter(&html)
            .map(|cap| ProviderSearchResult {
                id: format!("{}/{}", &cap[1], &cap[2]),
                title: html_escape::decode_html_entities(&cap[3]).to_string(),
                other_titles: Vec::new(),
                episodes: AnimeEpisodes::default(),
                media_type: None,
                poster: None,
                year: None,
            })
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
        let Some((numeric_id, slug)) = Self::split_id(&params.id) else {
            return Ok(None);
        };

        let sub = self.episode_numbers(numeric_id, slug, false).await?;
        let dub = self
            .episode_numbers(numeric_id, slug, true)
            .await
            .unwrap_or_default();
        if sub.is_empty() && dub.is_empty() {
            return Ok(None);
        }

        Ok(Some(Anime {
            id: params.id.clone(),
            title: params.query.clone(),
            episodes: AnimeEpisodes {
                sub,
                dub,
                raw: Vec::new(),
            },
            episodes_info: None,
            media_type: None,
            poster: None,
            year: None,
        }))
    }

    async fn episode_streams(&self, params: &EpisodeStreamsParams) -> Result<Option<ServerStream>> {
        let Some((numeric_id, slug)) = Self::split_id(&params.anime_id) else {
            return Ok(None);
        };

        let dub_suffix = if params.translation_type == TranslationType::Dub {
            "dub/"
        } else {
            ""
        };
        let html = self
            .client
            .get(format!(
                "{SITE_BASE}/watch/{numeric_id}/{slug}/{}/{dub_suffix}",
                params.episode
            ))
            .send()
            .await
            .context("yugen watch page failed")?
            .text()
            .await?;

        let Some(embed_id) = YugenRegex::get()
            .embed_frame
            .captures(&html)
            .map(|c| c[1].to_string())
        else {
            return Ok(None);
        };

        let embed: EmbedResponse = self
            .client
            .post(format!("{SITE_BASE}/api/embed/"))
            .form(&[("id", embed_id.as_str()), ("ac", "0")])
            .send()
            .await
            .context("yugen embed api failed")?
            .json()
            .await
            .context("yugen embed api returned malformed JSON")?;

        if embed.hls.is_empty() {
            return Ok(None);
        }

        let server = Server {
            name: "yugen".to_string(),
            links: embed
                .hls
                .into_iter()
                .map(|link| EpisodeStream {
                    link,
                    title: None,
                    quality: StreamQuality::Q1080,
                    format: Some("hls".to_string()),
                    hls: Some(true),
                    mp4: None,
                    priority: None,
                })
                .collect(),
            episode_title: Some(format!("Episode {}", params.episode)),
            headers: HashMap::from([("Referer".to_string(), format!("{SITE_BASE}/"))]),
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
    fn search_items_parse() {
        let html = r#"<a href="/anime/130/one-piece/" class="anime-meta" title="One Piece">"#;
        let caps = YugenRegex::get().search_item.captures(html).unwrap();
        assert_eq!(&caps[1], "130");
        assert_eq!(&caps[2], "one-piece");
        assert_eq!(&caps[3], "One Piece");
    }

    #[test]
    fn composite_ids_split() {
        assert_eq!(Yugen::split_id("130/one-piece"), Some(("130", "one-piece")));
        assert_eq!(Yugen::split_id("bare"), None);
    }
}
