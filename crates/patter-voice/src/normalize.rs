//! **Utterance Normalizer** — turn raw recognized text into a stable lookup key.
//!
//! Lowercases, trims, collapses internal whitespace runs to a single space, and
//! strips a configurable punctuation set. Pure and infallible: empty in, empty out.

use serde::{Deserialize, Serialize};

fn default_punctuation() -> String {
    ".,!?;:'\"()[]{}<>…—".to_string()
}

/// Which characters to strip before keyword lookup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NormalizerConfig {
    /// Characters removed from the utterance before matching (default: common punctuation).
    #[serde(default = "default_punctuation")]
    pub punctuation: String,
}

impl Default for NormalizerConfig {
    fn default() -> Self {
        Self {
            punctuation: default_punctuation(),
        }
    }
}

/// Normalize a recognized utterance for keyword lookup.
///
/// Deterministic and side-effect free; safe to call on every recognition event.
pub fn normalize(raw: &str, config: &NormalizerConfig) -> String {
    let stripped: String = raw
        .chars()
        .filter(|c| !config.punctuation.contains(*c))
        .collect();
    stripped
        .to_lowercase()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}
