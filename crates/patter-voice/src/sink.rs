//! **Synthetic Response Sink** — deterministic, codec-free consumption of a turn's chunks.
//!
//! Concatenates chunk text in `sequence_no` order and maps each accepted chunk to
//! a fixed-rate sine segment whose duration is a pure function of chunk length.
//! Out-of-order or duplicate sequence numbers are flagged as defects (never
//! silently reordered or accepted) and mark the artifact invalid; they never
//! crash the consuming task.

use crate::dispatcher::TurnHandle;
use crate::turn::ResponseChunk;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use tokio::sync::mpsc;
use tracing::warn;

fn default_sample_rate() -> u32 {
    16000
}

fn default_ms_per_char() -> u64 {
    20
}

/// Synthetic playback parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SinkConfig {
    /// Waveform sample rate (default 16000 Hz).
    #[serde(default = "default_sample_rate")]
    pub sample_rate: u32,
    /// Synthetic duration per character of chunk text (default 20ms).
    #[serde(default = "default_ms_per_char")]
    pub ms_per_char: u64,
}

impl Default for SinkConfig {
    fn default() -> Self {
        Self {
            sample_rate: default_sample_rate(),
            ms_per_char: default_ms_per_char(),
        }
    }
}

/// A sequencing defect observed in the chunk stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChunkDefect {
    OutOfOrder { expected: u64, got: u64 },
    DuplicateSequence(u64),
}

/// Deterministic artifact of one consumed turn.
#[derive(Debug, Clone)]
pub struct TurnArtifact {
    pub turn_id: Option<u64>,
    /// Accepted chunk text, concatenated in sequence order.
    pub transcript: String,
    /// Synthetic waveform: one fixed-duration sine segment per accepted chunk.
    pub waveform: Vec<f32>,
    /// Number of accepted chunks.
    pub chunk_count: usize,
    pub defects: Vec<ChunkDefect>,
    /// Whether a chunk marked `is_final` was seen before the stream closed.
    pub saw_final: bool,
}

impl TurnArtifact {
    /// An artifact is valid iff the stream had no sequencing defects.
    pub fn is_valid(&self) -> bool {
        self.defects.is_empty()
    }
}

/// Map one chunk's text to a synthetic sine segment. Pure function of chunk
/// length and sink config; no codec involved.
pub fn chunk_waveform(text: &str, config: &SinkConfig) -> Vec<f32> {
    let ms = text.chars().count() as u64 * config.ms_per_char;
    let samples = (config.sample_rate as u64 * ms / 1000) as usize;
    (0..samples)
        .map(|i| {
            let t = i as f32 / config.sample_rate as f32;
            (2.0 * std::f32::consts::PI * 440.0 * t).sin() * 0.5
        })
        .collect()
}

/// Consumes one turn's chunk stream, incrementally or all at once.
/// Runs strictly downstream of the dispatcher and never mutates turn state.
pub struct SyntheticSink {
    config: SinkConfig,
    turn_id: Option<u64>,
    next_seq: u64,
    transcript: String,
    waveform: Vec<f32>,
    chunk_count: usize,
    defects: Vec<ChunkDefect>,
    saw_final: bool,
}

impl SyntheticSink {
    pub fn new(config: SinkConfig) -> Self {
        Self {
            config,
            turn_id: None,
            next_seq: 0,
            transcript: String::new(),
            waveform: Vec::new(),
            chunk_count: 0,
            defects: Vec::new(),
            saw_final: false,
        }
    }

    /// Feed one chunk (streaming playback simulation). Defective chunks are
    /// flagged and rejected, not applied.
    pub fn push(&mut self, chunk: &ResponseChunk) {
        if self.turn_id.is_none() {
            self.turn_id = Some(chunk.turn_id);
        }
        match chunk.sequence_no.cmp(&self.next_seq) {
            Ordering::Less => {
                warn!(
                    turn_id = chunk.turn_id,
                    sequence_no = chunk.sequence_no,
                    "duplicate sequence number in chunk stream"
                );
                self.defects.push(ChunkDefect::DuplicateSequence(chunk.sequence_no));
            }
            Ordering::Greater => {
                warn!(
                    turn_id = chunk.turn_id,
                    expected = self.next_seq,
                    got = chunk.sequence_no,
                    "out-of-order chunk in stream"
                );
                self.defects.push(ChunkDefect::OutOfOrder {
                    expected: self.next_seq,
                    got: chunk.sequence_no,
                });
            }
            Ordering::Equal => {
                self.next_seq += 1;
                self.transcript.push_str(&chunk.text);
                self.waveform.extend(chunk_waveform(&chunk.text, &self.config));
                self.chunk_count += 1;
                if chunk.is_final {
                    self.saw_final = true;
                }
            }
        }
    }

    pub fn finish(self) -> TurnArtifact {
        TurnArtifact {
            turn_id: self.turn_id,
            transcript: self.transcript,
            waveform: self.waveform,
            chunk_count: self.chunk_count,
            defects: self.defects,
            saw_final: self.saw_final,
        }
    }

    /// Drain a raw chunk receiver to close and produce the artifact.
    pub async fn consume(config: SinkConfig, mut rx: mpsc::Receiver<ResponseChunk>) -> TurnArtifact {
        let mut sink = Self::new(config);
        while let Some(chunk) = rx.recv().await {
            sink.push(&chunk);
        }
        sink.finish()
    }

    /// Drain a dispatcher turn handle to close and produce the artifact.
    pub async fn drain_turn(config: SinkConfig, handle: &mut TurnHandle) -> TurnArtifact {
        let mut sink = Self::new(config);
        while let Some(chunk) = handle.recv_chunk().await {
            sink.push(&chunk);
        }
        sink.finish()
    }
}
