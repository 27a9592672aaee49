//! Nyaa torrent provider.
//!
//! Wraps the nyaa.si RSS feed in the provider contract. Search results are
//! grouped under the query itself; episode numbers are parsed out of release
//! titles and streams are magnet links, one server per release ordered by
//! seeders.

use std::collections::HashMap;
use std::sync::OnceLock;

use anyhow::{Context, Result};
use async_trait::async_trait;
use regex::Regex;
use reqwest::Client;
use url::Url;

use super::{AnimeProvider, ProviderName, ServerStream, provider_client};
use crate::models::provider::{
    Anime, AnimeEpisodes, AnimeParams, EpisodeStream, EpisodeStreamsParams, ProviderPageInfo,
    ProviderSearchResult, SearchParams, SearchResults, Server, StreamQuality,
};
use crate::utils::time::episode_sort_key;

const NYAA_RSS_BASE: &str = "https://nyaa.si/?page=rss";

#[derive(Debug, Clone)]
struct NyaaTorrent {
    title: String,
    seeders: u32,
    info_hash: String,
    size: String,
}

impl NyaaTorrent {
    fn magnet_link(&self) -> String {
        format!(
            "magnet:?xt=urn:btih:{}&dn={}",
            self.info_hash,
            urlencoding::encode(&self.title)
        )
    }
}

/// Consolidates regexes for RSS parsing to avoid per-call overhead.
struct NyaaRegex {
    title: Regex,
    seeders: Regex,
    info_hash: Regex,
    size: Regex,
    item: Regex,
    episode: Regex,
    resolution: Regex,
}

impl NyaaRegex {
    fn get() -> &'static Self {
        static INSTANCE: OnceLock<NyaaRegex> = OnceLock::new();
        INSTANCE.get_or_init(|| Self {
            title: Regex::new(r"<title>([^<]*)</title>").expect("Invalid Regex"),
            seeders: Regex::new(r"<nyaa:seeders>([^<]*)</nyaa:seeders>").expect("Invalid Regex"),
            info_hash: Regex::new(r"<nyaa:infoHash>([^<]*)</nyaa:infoHash>")
                .expect("Invalid Regex"),
            size: Regex::new(r"<nyaa:size>([^<]*)</nyaa:size>").expect("Invalid Regex"),
            item: Regex::new(r"(?s)<item>(.*?)</item>").expect("Invalid Regex"),
            episode: Regex::new(r"(?i)(?:\s-\s|\bE|\bEp\.?\s?)(\d{1,4}(?:\.\d)?)\b")
                .expect("Invalid Regex"),
            resolution: Regex::new(r"(\d{3,4})p").expect("Invalid Regex"),
        })
    }
}

fn extract_tag(xml: &str, re: &Regex) -> String {
    re.captures(xml)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().to_string())
        .unwrap_or_default()
}

fn parse_item(item_xml: &str) -> NyaaTorrent {
    let re = NyaaRegex::get();
    NyaaTorrent {
        title: html_escape::decode_html_entities(&extract_tag(item_xml, &re.title)).to_string(),
        seeders: extract_tag(item_xml, &re.seeders).parse().unwrap_or(0),
        info_hash: extract_tag(item_xml, &re.info_hash),
        size: extract_tag(item_xml, &re.size),
    }
}

fn parse_rss_items(xml: &str) -> Vec<NyaaTorrent> {
    let re = NyaaRegex::get();
    re.item
        .captures_iter(xml)
        .filter_map(|c| c.get(1))
        .map(|m| parse_item(m.as_str()))
        .collect()
}

/// Episode number parsed from a release title, e.g.
/// "[SubsPlease] Frieren - 07 (1080p)" → "07".
fn episode_of(title: &str) -> Option<String> {
    NyaaRegex::get()
        .episode
        .captures(title)
        .map(|c| c[1].to_string())
}

fn quality_of(title: &str) -> StreamQuality {
    match NyaaRegex::get()
        .resolution
        .captures(title)
        .map(|c| c[1].to_string())
        .as_deref()
    {
        Some("360") => StreamQuality::Q360,
        Some("480") => StreamQuality::Q480,
        Some("720") => StreamQuality::Q720,
        _ => StreamQuality::Q1080,
    }
}

pub struct Nyaa {
    client: Client,
}

impl Default for Nyaa {
    fn default() -> Self {
        Self::new()
    }
}

impl Nyaa {
    pub fn new() -> Self {
        Self {
            client: provider_client(ProviderName::Nyaa),
        }
    }

    async fn fetch_feed(&self, query: &str) -> Result<Vec<NyaaTorrent>> {
        let mut url = Url::parse(NYAA_RSS_BASE).expect("Invalid base URL");
        url.query_pairs_mut()
            .append_pair("q", query)
            // English-translated anime, no remakes.
            .append_pair("c", "1_2")
            .append_pair("f", "1");

        let xml = self
            .client
            .get(url.as_str())
            .send()
            .await
            .context("nyaa rss request failed")?
            .text()
            .await?;
        Ok(parse_rss_items(&xml))
    }
}

#[async_trait]
impl AnimeProvider for Nyaa {
    fn name(&self) -> ProviderName {
        ProviderName::Nyaa
    }

    async fn search(&self, params: &SearchParams) -> Result<Option<SearchResults>> {
        let torrents = self.fetch_feed(&params.query).await?;
        if torrents.is_empty() {
            return Ok(None);
        }

        let mut episodes: Vec<String> = torrents
            .iter()
            .filter_map(|t| episode_of(&t.title))
            .collect();
        episodes.sort_by(|a, b| episode_sort_key(a).total_cmp(&episode_sort_key(b)));
        episodes.dedup();

        // The feed is flat; the query itself names the anime and doubles as
        // the provider id.
        let result = ProviderSearchResult {
            id: params.query.clone(),
            title: params.query.clone(),
            other_titles: Vec::new(),
            episodes: AnimeEpisodes {
                sub: episodes.clone(),
                dub: Vec::new(),
                raw: episodes,
            },
            media_type: None,
            poster: None,
            year: None,
        };

        Ok(Some(SearchResults {
            page_info: ProviderPageInfo {
                total: Some(1),
                per_page: None,
                current_page: Some(1),
            },
            results: vec![result],
        }))
    }

    async fn get(&self, params: &AnimeParams) -> Result<Option<Anime>> {
        let results = self
            .search(&SearchParams {
                query: params.id.clone(),
                translation_type: crate::models::provider::TranslationType::Sub,
            })
            .await?;
        Ok(results.and_then(|r| r.results.into_iter().next()).map(|r| Anime {
            id: r.id,
            title: r.title,
            episodes: r.episodes,
            episodes_info: None,
            media_type: None,
            poster: None,
            year: None,
        }))
    }

    async fn episode_streams(&self, params: &EpisodeStreamsParams) -> Result<Option<ServerStream>> {
        let mut torrents: Vec<NyaaTorrent> = self
            .fetch_feed(&params.anime_id)
            .await?
            .into_iter()
            .filter(|t| episode_of(&t.title).as_deref() == Some(params.episode.as_str()))
            .collect();
        if torrents.is_empty() {
            return Ok(None);
        }
        torrents.sort_by(|a, b| b.seeders.cmp(&a.seeders));

        let servers: Vec<Server> = torrents
            .into_iter()
            .map(|t| Server {
                name: format!("nyaa ({} seeders, {})", t.seeders, t.size),
                links: vec![EpisodeStream {
                    link: t.magnet_link(),
                    title: Some(t.title.clone()),
                    quality: quality_of(&t.title),
                    format: Some("torrent".to_string()),
                    hls: None,
                    mp4: None,
                    priority: None,
                }],
                episode_title: Some(t.title),
                headers: HashMap::new(),
                subtitles: Vec::new(),
                audio: Vec::new(),
            })
            .collect();

        Ok(Some(Box::pin(futures::stream::iter(servers))))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ITEM: &str = r#"
        <item>
            <title>[SubsPlease] Sousou no Frieren - 07 (1080p) [ABCD1234].mkv</title>
            <pubDate>Fri, 20 Oct 2023 15:31:00 -0000</pubDate>
            <nyaa:seeders>482</nyaa:seeders>
            <nyaa:infoHash>aaaabbbbccccddddeeeeffff0000111122223333</nyaa:infoHash>
            <nyaa:size>1.3 GiB</nyaa:size>
        </item>
    "#;

    #[test]
    fn rss_items_parse() {
        let torrents = parse_rss_items(ITEM);
        assert_eq!(torrents.len(), 1);
        assert_eq!(torrents[0].seeders, 482);
        assert!(torrents[0].magnet_link().starts_with("magnet:?xt=urn:btih:aaaabbbb"));
    }

    #[test]
    fn episode_numbers_parse_from_titles() {
        assert_eq!(
            episode_of("[SubsPlease] Frieren - 07 (1080p)"),
            Some("07".to_string())
        );
        assert_eq!(episode_of("[Group] Show - 11.5 [720p]"), Some("11.5".to_string()));
        assert_eq!(episode_of("[Group] Movie (1080p)"), None);
    }

    #[test]
    fn quality_parses_from_titles() {
        assert_eq!(quality_of("Show - 01 (720p)"), StreamQuality::Q720);
        assert_eq!(quality_of("Show - 01"), StreamQuality::Q1080);
    }
}
