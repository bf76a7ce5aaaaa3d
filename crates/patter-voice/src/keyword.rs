//! **Keyword Table** — the fast path: normalized phrase → canned response chunks.
//!
//! The table is built once at startup and immutable afterwards, so lookups are
//! safe from any number of turns without synchronization. Matching runs in tiers
//! (Exact, then Prefix, then Contains); within a tier the winner is the highest
//! priority, then the longest pattern, then the earliest-inserted entry.

use crate::error::{VoiceError, VoiceResult};
use crate::normalize::{normalize, NormalizerConfig};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use tracing::{debug, info, warn};

/// How a pattern is matched against the normalized utterance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MatchKind {
    /// The whole utterance equals the pattern.
    Exact,
    /// The utterance starts with the pattern, followed by a word boundary.
    Prefix,
    /// The pattern occurs anywhere in the utterance as a whole word/phrase.
    Contains,
}

/// One canned phrase → response mapping.
#[derive(Debug, Clone)]
pub struct KeywordEntry {
    /// Normalized at table construction with the same normalizer used for lookups.
    pub pattern: String,
    pub match_kind: MatchKind,
    /// Response as an ordered sequence of chunks (streamed in order on a hit).
    pub response: Vec<String>,
    /// Higher wins within a tier; ties broken by pattern length, then insertion order.
    pub priority: i32,
}

impl KeywordEntry {
    pub fn new(
        pattern: impl Into<String>,
        match_kind: MatchKind,
        response: Vec<String>,
        priority: i32,
    ) -> Self {
        Self {
            pattern: pattern.into(),
            match_kind,
            response,
            priority,
        }
    }

    /// Convenience for a single-chunk response.
    pub fn single(
        pattern: impl Into<String>,
        match_kind: MatchKind,
        response: impl Into<String>,
        priority: i32,
    ) -> Self {
        Self::new(pattern, match_kind, vec![response.into()], priority)
    }
}

/// Immutable table of canned responses. Construct once, share via `Arc`.
#[derive(Debug, Clone, Default)]
pub struct KeywordTable {
    entries: Vec<KeywordEntry>,
    /// Exact-tier index: pattern → entry position, pre-resolved for tie-breaks.
    exact: HashMap<String, usize>,
}

// --- structured file format ------------------------------------------------
// TOML:                              JSON:
//   [[entries]]                        { "entries": [ { "pattern": "...",
//   pattern = "what time"                "match": "prefix",
//   match = "prefix"                     "response": "..." } ] }
//   response = "..."
// `response` may be a single string or an array of chunk strings.

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum ResponseField {
    One(String),
    Many(Vec<String>),
}

#[derive(Debug, Deserialize)]
struct FileEntry {
    pattern: String,
    #[serde(rename = "match", alias = "match_kind")]
    match_kind: MatchKind,
    response: ResponseField,
    #[serde(default)]
    priority: i32,
}

#[derive(Debug, Deserialize)]
struct TableFile {
    entries: Vec<FileEntry>,
}

impl KeywordTable {
    /// Build a table from entries, normalizing each pattern with `normalizer` so
    /// patterns and lookup keys go through the same pipeline. Entries with an
    /// empty pattern or empty response are skipped with a warning.
    pub fn new(entries: Vec<KeywordEntry>, normalizer: &NormalizerConfig) -> Self {
        let mut kept = Vec::with_capacity(entries.len());
        for mut entry in entries {
            entry.pattern = normalize(&entry.pattern, normalizer);
            if entry.pattern.is_empty() {
                warn!("skipping keyword entry with empty pattern");
                continue;
            }
            if entry.response.iter().all(|c| c.is_empty()) {
                warn!(pattern = %entry.pattern, "skipping keyword entry with empty response");
                continue;
            }
            kept.push(entry);
        }
        let mut exact: HashMap<String, usize> = HashMap::new();
        for (i, entry) in kept.iter().enumerate() {
            if entry.match_kind != MatchKind::Exact {
                continue;
            }
            match exact.get(&entry.pattern) {
                Some(&prev) if kept[prev].priority >= entry.priority => {}
                _ => {
                    exact.insert(entry.pattern.clone(), i);
                }
            }
        }
        info!(entries = kept.len(), "keyword table built");
        Self {
            entries: kept,
            exact,
        }
    }

    /// Load the table from a structured file (TOML by `.toml` extension, JSON otherwise).
    /// A malformed file is a fatal startup error.
    pub fn load(path: impl AsRef<Path>, normalizer: &NormalizerConfig) -> VoiceResult<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|e| {
            VoiceError::TableLoad(format!("{}: {}", path.display(), e))
        })?;
        let file: TableFile = if path.extension().and_then(|e| e.to_str()) == Some("toml") {
            toml::from_str(&raw)
                .map_err(|e| VoiceError::TableLoad(format!("{}: {}", path.display(), e)))?
        } else {
            serde_json::from_str(&raw)
                .map_err(|e| VoiceError::TableLoad(format!("{}: {}", path.display(), e)))?
        };
        let entries = file
            .entries
            .into_iter()
            .map(|e| KeywordEntry {
                pattern: e.pattern,
                match_kind: e.match_kind,
                response: match e.response {
                    ResponseField::One(s) => vec![s],
                    ResponseField::Many(v) => v,
                },
                priority: e.priority,
            })
            .collect();
        Ok(Self::new(entries, normalizer))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Look up a canned response for a normalized utterance.
    ///
    /// Tiers are tried in order (Exact, Prefix, Contains); the first tier with a
    /// candidate wins. `None` means no match, never an error.
    pub fn lookup(&self, normalized_text: &str) -> Option<&KeywordEntry> {
        if normalized_text.is_empty() {
            return None;
        }
        // Exact tier is a hash lookup; tie-breaks were resolved at build time.
        if let Some(&i) = self.exact.get(normalized_text) {
            let entry = &self.entries[i];
            debug!(pattern = %entry.pattern, kind = ?MatchKind::Exact, "keyword match");
            return Some(entry);
        }
        for tier in [MatchKind::Prefix, MatchKind::Contains] {
            let best = self
                .entries
                .iter()
                .enumerate()
                .filter(|(_, e)| e.match_kind == tier && tier_matches(tier, &e.pattern, normalized_text))
                .max_by(|(ia, a), (ib, b)| {
                    a.priority
                        .cmp(&b.priority)
                        .then(a.pattern.len().cmp(&b.pattern.len()))
                        // earlier insertion wins on a full tie
                        .then(ib.cmp(ia))
                });
            if let Some((_, entry)) = best {
                debug!(pattern = %entry.pattern, kind = ?tier, "keyword match");
                return Some(entry);
            }
        }
        None
    }
}

fn tier_matches(kind: MatchKind, pattern: &str, text: &str) -> bool {
    match kind {
        MatchKind::Exact => text == pattern,
        MatchKind::Prefix => text
            .strip_prefix(pattern)
            .map(|rest| rest.is_empty() || rest.starts_with(' '))
            .unwrap_or(false),
        MatchKind::Contains => text.match_indices(pattern).any(|(i, _)| {
            let bytes = text.as_bytes();
            let end = i + pattern.len();
            let before_ok = i == 0 || bytes[i - 1] == b' ';
            let after_ok = end == text.len() || bytes[end] == b' ';
            before_ok && after_ok
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table(entries: Vec<KeywordEntry>) -> KeywordTable {
        KeywordTable::new(entries, &NormalizerConfig::default())
    }

    #[test]
    fn exact_match_wins_over_looser_tiers() {
        let t = table(vec![
            KeywordEntry::single("hello", MatchKind::Contains, "contains", 5),
            KeywordEntry::single("hello", MatchKind::Exact, "exact", 0),
        ]);
        assert_eq!(t.lookup("hello").unwrap().response[0], "exact");
    }

    #[test]
    fn prefix_requires_word_boundary() {
        let t = table(vec![KeywordEntry::single(
            "what time",
            MatchKind::Prefix,
            "clock",
            0,
        )]);
        assert!(t.lookup("what time is it").is_some());
        assert!(t.lookup("what time").is_some());
        assert!(t.lookup("what timeline fits").is_none());
    }

    #[test]
    fn contains_matches_whole_phrase_only() {
        let t = table(vec![KeywordEntry::single("help", MatchKind::Contains, "aid", 0)]);
        assert!(t.lookup("i need help now").is_some());
        assert!(t.lookup("help").is_some());
        assert!(t.lookup("that was unhelpful").is_none());
    }

    #[test]
    fn longest_pattern_wins_on_equal_priority() {
        let t = table(vec![
            KeywordEntry::single("help", MatchKind::Contains, "A", 1),
            KeywordEntry::single("help me", MatchKind::Contains, "B", 1),
        ]);
        assert_eq!(t.lookup("i need help me please").unwrap().response[0], "B");
    }

    #[test]
    fn higher_priority_beats_longer_pattern() {
        let t = table(vec![
            KeywordEntry::single("good morning sunshine", MatchKind::Contains, "long", 0),
            KeywordEntry::single("good morning", MatchKind::Contains, "prio", 10),
        ]);
        assert_eq!(
            t.lookup("good morning sunshine").unwrap().response[0],
            "prio"
        );
    }

    #[test]
    fn insertion_order_breaks_full_ties() {
        let t = table(vec![
            KeywordEntry::single("one", MatchKind::Contains, "first", 0),
            KeywordEntry::single("two", MatchKind::Contains, "second", 0),
        ]);
        // "one" and "two" have equal priority and length; earlier entry wins
        assert_eq!(t.lookup("one two").unwrap().response[0], "first");
    }

    #[test]
    fn no_match_returns_none() {
        let t = table(vec![KeywordEntry::single("hello", MatchKind::Exact, "hi", 0)]);
        assert!(t.lookup("goodbye").is_none());
        assert!(t.lookup("").is_none());
    }

    #[test]
    fn patterns_are_normalized_at_load() {
        let t = table(vec![KeywordEntry::single(
            "  What   TIME?  ",
            MatchKind::Prefix,
            "clock",
            0,
        )]);
        assert!(t.lookup("what time is it").is_some());
    }

    #[test]
    fn empty_entries_are_skipped() {
        let t = table(vec![
            KeywordEntry::single("...", MatchKind::Exact, "never", 0),
            KeywordEntry::new("ok", MatchKind::Exact, vec![], 0),
        ]);
        assert!(t.is_empty());
    }

    #[test]
    fn loads_toml_file() {
        use std::io::Write;
        let mut f = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            f,
            r#"
[[entries]]
pattern = "what time"
match = "prefix"
response = "I don't have access to the current time."

[[entries]]
pattern = "hello"
match = "exact"
response = ["Hi", " there."]
priority = 2
"#
        )
        .unwrap();
        let t = KeywordTable::load(f.path(), &NormalizerConfig::default()).unwrap();
        assert_eq!(t.len(), 2);
        let hit = t.lookup("hello").unwrap();
        assert_eq!(hit.response, vec!["Hi".to_string(), " there.".to_string()]);
        assert_eq!(hit.priority, 2);
    }

    #[test]
    fn loads_json_file() {
        use std::io::Write;
        let mut f = tempfile::Builder::new().suffix(".json").tempfile().unwrap();
        write!(
            f,
            r#"{{"entries": [{{"pattern": "goodbye", "match": "exact", "response": "Bye!"}}]}}"#
        )
        .unwrap();
        let t = KeywordTable::load(f.path(), &NormalizerConfig::default()).unwrap();
        assert_eq!(t.lookup("goodbye").unwrap().response[0], "Bye!");
    }

    #[test]
    fn malformed_file_is_fatal() {
        use std::io::Write;
        let mut f = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(f, "entries = 12").unwrap();
        let err = KeywordTable::load(f.path(), &NormalizerConfig::default());
        assert!(matches!(err, Err(VoiceError::TableLoad(_))));
    }
}
