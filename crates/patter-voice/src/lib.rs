//! # Patter Voice — hybrid keyword/generative turn dispatch
//!
//! Decides, for each finalized user utterance, whether to answer immediately
//! from a table of known phrases or to fall back to a slower generative
//! responder, without blocking the fast path and without losing responses
//! when the fallback fails, times out, or is interrupted by barge-in.
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────────────────────────────────────────────────────────┐
//! │                      Hybrid Dispatcher                         │
//! │  ┌────────────┐   ┌───────────────┐   ┌───────────────────┐   │
//! │  │ Normalizer │ → │ Keyword Table │ → │  canned chunks    │   │
//! │  └────────────┘   │  (sync, fast) │   │  (KeywordWon)     │   │
//! │                   └───────┬───────┘   └─────────┬─────────┘   │
//! │                        no match                 ↓             │
//! │                   ┌───────────────┐   ┌───────────────────┐   │
//! │                   │   Fallback    │ → │ ordered chunk     │ → Sink
//! │                   │   Responder   │   │ stream (bounded)  │   │
//! │                   │ (async task)  │   └───────────────────┘   │
//! │                   └───────┬───────┘                           │
//! │                     barge-in → CancellationToken, grace       │
//! └────────────────────────────────────────────────────────────────┘
//! ```
//!
//! The keyword lookup always runs inline on the caller's task; only the
//! fallback path spawns. At most one non-cancelled turn is active per
//! conversation, and exactly one source's chunks are delivered per turn.

pub mod config;
pub mod dispatcher;
pub mod error;
pub mod keyword;
pub mod normalize;
pub mod responder;
pub mod sink;
pub mod turn;

pub use config::{AdapterMode, VoiceConfig};
pub use dispatcher::{DispatcherConfig, HybridDispatcher, TurnHandle, DEFAULT_APOLOGY};
pub use error::{VoiceError, VoiceResult};
pub use keyword::{KeywordEntry, KeywordTable, MatchKind};
pub use normalize::{normalize, NormalizerConfig};
pub use responder::{FallbackResponder, MockResponder, DEFAULT_INSTRUCTIONS};
pub use sink::{chunk_waveform, ChunkDefect, SinkConfig, SyntheticSink, TurnArtifact};
pub use turn::{ContextTurn, RecognitionEvent, ResponseChunk, TurnStatus, Utterance};
