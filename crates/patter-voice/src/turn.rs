//! Value objects for one conversation turn: utterances, chunks, and turn status.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A finalized user utterance. Created once per recognition event, never mutated.
#[derive(Debug, Clone)]
pub struct Utterance {
    /// Text exactly as the recognizer produced it.
    pub raw_text: String,
    /// Normalized lookup key (see `normalize`).
    pub normalized_text: String,
    /// Monotonic id assigned by the dispatcher.
    pub turn_id: u64,
    /// When the finalized recognition event was received.
    pub received_at: DateTime<Utc>,
}

impl Utterance {
    pub fn new(raw_text: impl Into<String>, normalized_text: impl Into<String>, turn_id: u64) -> Self {
        Self {
            raw_text: raw_text.into(),
            normalized_text: normalized_text.into(),
            turn_id,
            received_at: Utc::now(),
        }
    }
}

/// Input event from the speech-recognition collaborator.
/// Interim (non-final) recognitions are not actionable and are ignored.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecognitionEvent {
    pub raw_text: String,
    pub is_final: bool,
}

/// One incremental unit of a streamed response.
///
/// `sequence_no` is strictly increasing within a turn; the sink uses it to
/// detect drops and duplicates.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResponseChunk {
    pub turn_id: u64,
    pub sequence_no: u64,
    pub text: String,
    pub is_final: bool,
}

/// Turn state machine:
/// Pending → {KeywordWon | FallbackStarted} → FallbackWon → {Completed | Cancelled | Failed}.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnStatus {
    /// Created, lookup not yet resolved.
    Pending,
    /// Keyword table matched; canned chunks are streaming. The fallback responder is never started.
    KeywordWon,
    /// No keyword match; the fallback responder has been invoked.
    FallbackStarted,
    /// First fallback chunk has been forwarded downstream.
    FallbackWon,
    /// All chunks delivered and the stream closed.
    Completed,
    /// Superseded by a newer utterance (barge-in). No terminal message is emitted.
    Cancelled,
    /// Provider error or turn timeout; exactly one terminal apology chunk was emitted.
    Failed,
}

impl TurnStatus {
    /// Whether this status ends the turn.
    pub fn is_terminal(&self) -> bool {
        matches!(self, TurnStatus::Completed | TurnStatus::Cancelled | TurnStatus::Failed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TurnStatus::Pending => "pending",
            TurnStatus::KeywordWon => "keyword_won",
            TurnStatus::FallbackStarted => "fallback_started",
            TurnStatus::FallbackWon => "fallback_won",
            TurnStatus::Completed => "completed",
            TurnStatus::Cancelled => "cancelled",
            TurnStatus::Failed => "failed",
        }
    }
}

/// One completed user/assistant exchange, kept as context for the fallback responder.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextTurn {
    pub user: String,
    pub assistant: String,
}
