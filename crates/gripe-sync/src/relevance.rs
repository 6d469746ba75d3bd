//! Relevance gate: text normalization, lexicon, pluggable filters.

use std::path::Path;

use anyhow::{Context, Result};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tokio::fs;
use tracing::debug;

pub const MIN_NORMALIZED_CHARS: usize = 25;
const MIN_ASCII_LETTERS: usize = 15;
const MAX_NON_ASCII_RATIO: f64 = 0.15;

static URL_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"https?://\S+").expect("valid url pattern"));
// Letter and number categories only: marks and symbols go too.
static NON_WORD_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[^\p{L}\p{N}\s]").expect("valid non-word pattern"));

/// Lowercase, drop URLs, replace anything outside `\p{L}`/`\p{N}`/whitespace with a space,
/// collapse whitespace. Also the dedup key.
pub fn normalize_text(text: &str) -> String {
    let lowered = text.to_lowercase();
    let without_urls = URL_PATTERN.replace_all(&lowered, " ");
    NON_WORD_PATTERN
        .replace_all(&without_urls, " ")
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

/// Cheap script heuristic, not a language detector.
pub fn is_likely_english(normalized: &str) -> bool {
    let total = normalized.chars().count();
    if total == 0 {
        return false;
    }
    let ascii_letters = normalized.chars().filter(char::is_ascii_alphabetic).count();
    let non_ascii = normalized.chars().filter(|c| !c.is_ascii()).count();
    ascii_letters >= MIN_ASCII_LETTERS && (non_ascii as f64 / total as f64) < MAX_NON_ASCII_RATIO
}

/// Vocabularies for the keyword filter. Missing lists in a YAML file fall back to the built-in ones.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Lexicon {
    /// Complaint and defect vocabulary.
    pub negative: Vec<String>,
    /// Ownership and usage vocabulary.
    pub product: Vec<String>,
    /// Engagement chatter that disqualifies an item outright.
    pub irrelevant: Vec<String>,
}

fn owned(terms: &[&str]) -> Vec<String> {
    terms.iter().map(ToString::to_string).collect()
}

impl Default for Lexicon {
    fn default() -> Self {
        Self {
            negative: owned(&[
                "leak", "leaks", "drip", "spill", "spills", "smell", "odor", "stinks", "hard",
                "difficult", "impossible", "pain", "painful", "noisy", "loud", "heavy", "bulky",
                "broken", "broke", "breaks", "fragile", "flimsy", "cheap", "slow", "late",
                "refund", "return", "bad", "worst", "rust", "mold", "crack", "cracked", "stain",
                "stains", "dirty",
            ]),
            product: owned(&[
                "bought", "buy", "using", "works", "doesn't", "doesnt", "stopped", "after",
                "week", "month", "review", "problem", "issue", "quality", "clean", "size", "fit",
                "seal", "cap", "lid", "battery", "charge",
            ]),
            irrelevant: owned(&[
                "subscribe",
                "channel",
                "like the video",
                "handsome",
                "cute",
                "song",
                "music",
                "lyrics",
                "asmr",
                "shorts",
            ]),
        }
    }
}

impl Lexicon {
    pub fn from_yaml_str(text: &str) -> Result<Self> {
        serde_yaml::from_str(text).context("parsing lexicon yaml")
    }

    /// Reads `path`, or returns the built-in lexicon when the file does not exist.
    pub async fn load(path: &Path) -> Result<Self> {
        if !fs::try_exists(path).await.unwrap_or(false) {
            debug!(path = %path.display(), "no lexicon file; using built-in vocabulary");
            return Ok(Self::default());
        }
        let text = fs::read_to_string(path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        Self::from_yaml_str(&text).with_context(|| format!("loading {}", path.display()))
    }
}

/// Normalize terms the same way item text is normalized, dropping empties.
pub fn normalize_terms<S: AsRef<str>>(terms: &[S]) -> Vec<String> {
    terms
        .iter()
        .map(|t| normalize_text(t.as_ref()))
        .filter(|t| !t.is_empty())
        .collect()
}

fn contains_any(haystack: &str, terms: &[String]) -> bool {
    terms.iter().any(|t| haystack.contains(t.as_str()))
}

pub trait RelevanceFilter: Send + Sync {
    fn name(&self) -> &'static str;

    /// `normalized` must be the output of [`normalize_text`].
    fn accepts_normalized(&self, normalized: &str) -> bool;

    fn is_relevant(&self, text: &str) -> bool {
        self.accepts_normalized(&normalize_text(text))
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct KeepAllFilter;

impl RelevanceFilter for KeepAllFilter {
    fn name(&self) -> &'static str {
        "keep_all"
    }

    fn accepts_normalized(&self, _normalized: &str) -> bool {
        true
    }
}

/// Precision-biased gate: long enough, likely English, no chatter marker, and at least one
/// negative plus one product-context term.
#[derive(Debug, Clone)]
pub struct KeywordRelevanceFilter {
    negative: Vec<String>,
    product: Vec<String>,
    irrelevant: Vec<String>,
}

impl KeywordRelevanceFilter {
    pub fn new(lexicon: &Lexicon) -> Self {
        Self {
            negative: normalize_terms(&lexicon.negative),
            product: normalize_terms(&lexicon.product),
            irrelevant: normalize_terms(&lexicon.irrelevant),
        }
    }
}

impl Default for KeywordRelevanceFilter {
    fn default() -> Self {
        Self::new(&Lexicon::default())
    }
}

impl RelevanceFilter for KeywordRelevanceFilter {
    fn name(&self) -> &'static str {
        "keyword"
    }

    fn accepts_normalized(&self, normalized: &str) -> bool {
        if normalized.chars().count() < MIN_NORMALIZED_CHARS {
            return false;
        }
        if !is_likely_english(normalized) {
            return false;
        }
        if contains_any(normalized, &self.irrelevant) {
            return false;
        }
        contains_any(normalized, &self.negative) && contains_any(normalized, &self.product)
    }
}
