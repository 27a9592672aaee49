//! Scraping providers.
//!
//! Every provider speaks the same three-operation contract: search, get,
//! episode_streams. Streams come back as a lazy ordered [`ServerStream`] —
//! the order is the preference order and the caller may stop after the first
//! server without paying for the rest.

pub mod allanime;
pub mod animepahe;
pub mod animeunity;
pub mod hianime;
pub mod nyaa;
pub mod resolver;
pub mod yugen;

use std::pin::Pin;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use futures::Stream;
use reqwest::Client;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, USER_AGENT};

use crate::constants::random_user_agent;
use crate::models::provider::{Anime, AnimeParams, EpisodeStreamsParams, SearchParams, SearchResults, Server};

/// Lazy, ordered stream of servers for one episode.
pub type ServerStream = Pin<Box<dyn Stream<Item = Server> + Send>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProviderName {
    AllAnime,
    AnimePahe,
    HiAnime,
    AnimeUnity,
    Yugen,
    Nyaa,
}

impl ProviderName {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::AllAnime => "allanime",
            Self::AnimePahe => "animepahe",
            Self::HiAnime => "hianime",
            Self::AnimeUnity => "animeunity",
            Self::Yugen => "yugen",
            Self::Nyaa => "nyaa",
        }
    }

    pub fn parse(tag: &str) -> Option<Self> {
        match tag.to_ascii_lowercase().as_str() {
            "allanime" => Some(Self::AllAnime),
            "animepahe" => Some(Self::AnimePahe),
            "hianime" => Some(Self::HiAnime),
            "animeunity" => Some(Self::AnimeUnity),
            "yugen" => Some(Self::Yugen),
            "nyaa" => Some(Self::Nyaa),
            _ => None,
        }
    }

    /// Required HTTP headers, declared at type level per provider.
    pub fn headers(self) -> Vec<(&'static str, &'static str)> {
        match self {
            Self::AllAnime => vec![
                ("Referer", "https://allmanga.to/"),
                ("Origin", "https://allmanga.to"),
            ],
            Self::AnimePahe => vec![
                ("Referer", "https://animepahe.ru/"),
                ("Cookie", "__ddg2_=1234567890"),
            ],
            Self::HiAnime => vec![
                ("Referer", "https://hianime.to/"),
                ("X-Requested-With", "XMLHttpRequest"),
            ],
            Self::AnimeUnity => vec![("Referer", "https://www.animeunity.so/")],
            Self::Yugen => vec![
                ("Referer", "https://yugenanime.tv/"),
                ("X-Requested-With", "XMLHttpRequest"),
            ],
            Self::Nyaa => vec![],
        }
    }

    /// Title-normalizer metadata for the resolver: strip patterns the
    /// provider tends to append to otherwise canonical titles. Identity when
    /// empty.
    pub fn title_strip_patterns(self) -> &'static [&'static str] {
        match self {
            // These two decorate titles with parenthesized qualifiers.
            Self::AllAnime => &[r"\s*\((dub|sub|uncensored|[0-9]{4})\)\s*$"],
            Self::HiAnime => &[r"\s*\((dub|sub|uncensored)\)\s*$"],
            _ => &[],
        }
    }
}

impl std::fmt::Display for ProviderName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The uniform provider contract.
///
/// Empty results are `Ok(None)` / empty streams; only hard failures
/// (transport, parse) are errors. Network and parse failures during lazy
/// server resolution are logged inside the stream so iteration ends cleanly.
#[async_trait]
pub trait AnimeProvider: Send + Sync {
    fn name(&self) -> ProviderName;

    async fn search(&self, params: &SearchParams) -> Result<Option<SearchResults>>;

    async fn get(&self, params: &AnimeParams) -> Result<Option<Anime>>;

    async fn episode_streams(&self, params: &EpisodeStreamsParams) -> Result<Option<ServerStream>>;
}

/// HTTP client carrying the provider's declared headers plus a random UA.
pub(crate) fn provider_client(name: ProviderName) -> Client {
    let mut headers = HeaderMap::new();
    headers.insert(USER_AGENT, HeaderValue::from_static(random_user_agent()));
    for (key, value) in name.headers() {
        if let (Ok(key), Ok(value)) = (
            HeaderName::from_bytes(key.as_bytes()),
            HeaderValue::from_str(value),
        ) {
            headers.insert(key, value);
        }
    }
    Client::builder()
        .default_headers(headers)
        .timeout(Duration::from_secs(30))
        .build()
        .unwrap_or_else(|_| Client::new())
}

/// Factory keyed by the provider tag.
pub fn create_provider(tag: &str) -> Result<Box<dyn AnimeProvider>> {
    let name =
        ProviderName::parse(tag).ok_or_else(|| anyhow::anyhow!("Unknown provider: '{tag}'"))?;
    Ok(match name {
        ProviderName::AllAnime => Box::new(allanime::AllAnime::new()),
        ProviderName::AnimePahe => Box::new(animepahe::AnimePahe::new()),
        ProviderName::HiAnime => Box::new(hianime::HiAnime::new()),
        ProviderName::AnimeUnity => Box::new(animeunity::AnimeUnity::new()),
        ProviderName::Yugen => Box::new(yugen::Yugen::new()),
        ProviderName::Nyaa => Box::new(nyaa::Nyaa::new()),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_tag_round_trips_through_the_factory() {
        for tag in ["allanime", "animepahe", "hianime", "animeunity", "yugen", "nyaa"] {
            let provider = create_provider(tag).unwrap();
            assert_eq!(provider.name().as_str(), tag);
        }
        assert!(create_provider("gogoanime").is_err());
    }
}
