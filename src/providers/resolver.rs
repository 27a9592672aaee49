//! Title resolver.
//!
//! Binds a catalog entry to the right provider search result: every candidate
//! title is normalized with the provider's strip patterns, compared against
//! the catalog's romaji and english titles, and the best fuzzy score wins.

use regex::Regex;
use strsim::normalized_levenshtein;
use tracing::debug;

use super::ProviderName;
use crate::models::media::MediaItem;

/// Apply the provider's normalizer to a candidate title. Identity when the
/// provider declares no strip patterns.
pub fn normalize_title(provider: ProviderName, title: &str) -> String {
    let mut normalized = title.to_lowercase();
    for pattern in provider.title_strip_patterns() {
        if let Ok(re) = Regex::new(&format!("(?i){pattern}")) {
            normalized = re.replace_all(&normalized, "").into_owned();
        }
    }
    normalized.trim().to_string()
}

fn ratio(a: &str, b: &str) -> f64 {
    normalized_levenshtein(a, b)
}

/// Score one candidate against the media item: the max of its similarity to
/// the lowercased romaji and english titles.
fn score_candidate(provider: ProviderName, candidate: &str, media_item: &MediaItem) -> f64 {
    let normalized = normalize_title(provider, candidate);
    let mut best: f64 = 0.0;
    if let Some(romaji) = &media_item.title.romaji {
        best = best.max(ratio(&normalized, &romaji.to_lowercase()));
    }
    if let Some(english) = &media_item.title.english {
        best = best.max(ratio(&normalized, &english.to_lowercase()));
    }
    best
}

/// Pick the provider result title that best matches the catalog item.
///
/// Ties break by score, not input order: an equal-scoring later candidate
/// never displaces an earlier one, and reordering the input cannot change
/// which title wins when one strictly outscores the rest.
pub fn resolve_best_match<'a>(
    provider: ProviderName,
    candidates: impl IntoIterator<Item = &'a str>,
    media_item: &MediaItem,
) -> Option<&'a str> {
    let mut best: Option<(&'a str, f64)> = None;
    for candidate in candidates {
        let score = score_candidate(provider, candidate, media_item);
        debug!(candidate, score, "resolver candidate");
        match &best {
            Some((_, best_score)) if score <= *best_score => {}
            _ => best = Some((candidate, score)),
        }
    }
    best.map(|(title, _)| title)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn aot() -> MediaItem {
        MediaItem::with_id_and_title(16498, "Attack on Titan", "Shingeki no Kyojin")
    }

    #[test]
    fn exact_match_beats_spinoff() {
        let media = aot();
        let picked = resolve_best_match(
            ProviderName::AllAnime,
            ["Attack on Titan", "Attack on Titan: Junior High"],
            &media,
        );
        assert_eq!(picked, Some("Attack on Titan"));
    }

    #[test]
    fn result_is_order_independent() {
        let media = aot();
        let picked = resolve_best_match(
            ProviderName::AllAnime,
            ["Attack on Titan: Junior High", "Attack on Titan"],
            &media,
        );
        assert_eq!(picked, Some("Attack on Titan"));
    }

    #[test]
    fn romaji_titles_match_too() {
        let media = aot();
        let picked = resolve_best_match(
            ProviderName::AnimePahe,
            ["Shingeki no Kyojin", "Shingeki no Bahamut"],
            &media,
        );
        assert_eq!(picked, Some("Shingeki no Kyojin"));
    }

    #[test]
    fn provider_normalizer_strips_qualifiers() {
        assert_eq!(
            normalize_title(ProviderName::AllAnime, "Attack on Titan (Dub)"),
            "attack on titan"
        );
        // Identity for providers without strip patterns.
        assert_eq!(
            normalize_title(ProviderName::Nyaa, "Attack on Titan (Dub)"),
            "attack on titan (dub)"
        );
    }

    #[test]
    fn empty_candidates_resolve_to_none() {
        let media = aot();
        assert_eq!(
            resolve_best_match(ProviderName::AllAnime, std::iter::empty::<&str>(), &media),
            None
        );
    }
}
