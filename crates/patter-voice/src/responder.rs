//! **Fallback Responder** — the slow, generative response seam and its mock.
//!
//! Implement `FallbackResponder` for a live LLM/voice provider; the dispatcher
//! only ever talks to the trait. `MockResponder` is the deterministic
//! substitution for tests and `adapter_mode = "mock"` runs: scripted replies,
//! controllable latency, failure injection, and a call-count spy.

use crate::error::{VoiceError, VoiceResult};
use crate::turn::{ContextTurn, Utterance};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Default personality instructions for live responders. Carried as an opaque
/// value; the core never interprets it.
pub const DEFAULT_INSTRUCTIONS: &str = "You are a helpful voice AI assistant. \
The user is interacting with you via voice, even if you perceive the conversation as text. \
Your responses are concise, to the point, and without any complex formatting or punctuation \
including emojis, asterisks, or other symbols.";

/// Capability that produces a response for an utterance that missed the keyword table.
///
/// Contract:
/// - push incremental text chunks into `out` as they become available;
/// - observe `cancel` within the configured grace period and return
///   `Err(VoiceError::Cancelled)` instead of emitting further chunks;
/// - return `Err(VoiceError::Provider(_))` on network/quota/malformed-output
///   failures (the dispatcher reports these, it does not retry);
/// - a dropped `out` receiver means the dispatcher has moved on; stop and
///   return `Ok(())`.
#[async_trait]
pub trait FallbackResponder: Send + Sync {
    async fn generate(
        &self,
        context: &[ContextTurn],
        utterance: &Utterance,
        cancel: CancellationToken,
        out: mpsc::Sender<String>,
    ) -> VoiceResult<()>;
}

#[derive(Debug, Clone)]
enum MockBehavior {
    Respond,
    Fail(String),
    /// Never produces a chunk; only returns once cancelled.
    Stall,
}

/// Deterministic responder for tests and offline development.
pub struct MockResponder {
    script: HashMap<String, Vec<String>>,
    default_reply: Vec<String>,
    chunk_delay: Duration,
    behavior: MockBehavior,
    calls: AtomicUsize,
}

impl Default for MockResponder {
    fn default() -> Self {
        Self::new()
    }
}

impl MockResponder {
    pub fn new() -> Self {
        Self {
            script: HashMap::new(),
            default_reply: vec!["I'm not sure how to help with that.".to_string()],
            chunk_delay: Duration::ZERO,
            behavior: MockBehavior::Respond,
            calls: AtomicUsize::new(0),
        }
    }

    /// Script a reply (as chunks) for a specific normalized utterance.
    pub fn with_script(mut self, normalized_utterance: impl Into<String>, chunks: Vec<&str>) -> Self {
        self.script.insert(
            normalized_utterance.into(),
            chunks.into_iter().map(String::from).collect(),
        );
        self
    }

    /// Reply used when no script matches.
    pub fn with_default_reply(mut self, chunks: Vec<&str>) -> Self {
        self.default_reply = chunks.into_iter().map(String::from).collect();
        self
    }

    /// Delay before each chunk, to simulate provider latency.
    pub fn with_chunk_delay(mut self, delay: Duration) -> Self {
        self.chunk_delay = delay;
        self
    }

    /// Always fail with a provider error.
    pub fn failing(mut self, message: impl Into<String>) -> Self {
        self.behavior = MockBehavior::Fail(message.into());
        self
    }

    /// Never complete; used to exercise the turn timeout.
    pub fn stalling(mut self) -> Self {
        self.behavior = MockBehavior::Stall;
        self
    }

    /// How many times `generate` has been invoked (the spy for fast-path assertions).
    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl FallbackResponder for MockResponder {
    async fn generate(
        &self,
        _context: &[ContextTurn],
        utterance: &Utterance,
        cancel: CancellationToken,
        out: mpsc::Sender<String>,
    ) -> VoiceResult<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match &self.behavior {
            MockBehavior::Fail(message) => Err(VoiceError::Provider(message.clone())),
            MockBehavior::Stall => {
                cancel.cancelled().await;
                Err(VoiceError::Cancelled)
            }
            MockBehavior::Respond => {
                let chunks = self
                    .script
                    .get(&utterance.normalized_text)
                    .unwrap_or(&self.default_reply)
                    .clone();
                for text in chunks {
                    if self.chunk_delay.is_zero() {
                        if cancel.is_cancelled() {
                            return Err(VoiceError::Cancelled);
                        }
                    } else {
                        tokio::select! {
                            _ = cancel.cancelled() => return Err(VoiceError::Cancelled),
                            _ = tokio::time::sleep(self.chunk_delay) => {}
                        }
                    }
                    if out.send(text).await.is_err() {
                        debug!(turn_id = utterance.turn_id, "mock responder: receiver gone, stopping");
                        return Ok(());
                    }
                }
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn utterance(normalized: &str) -> Utterance {
        Utterance::new(normalized, normalized, 1)
    }

    #[tokio::test]
    async fn scripted_reply_is_deterministic() {
        let mock = MockResponder::new().with_script("ping", vec!["pong ", "pong"]);
        let (tx, mut rx) = mpsc::channel(8);
        mock.generate(&[], &utterance("ping"), CancellationToken::new(), tx)
            .await
            .unwrap();
        assert_eq!(rx.recv().await.unwrap(), "pong ");
        assert_eq!(rx.recv().await.unwrap(), "pong");
        assert!(rx.recv().await.is_none());
        assert_eq!(mock.call_count(), 1);
    }

    #[tokio::test]
    async fn unscripted_utterance_gets_default_reply() {
        let mock = MockResponder::new().with_default_reply(vec!["fallback"]);
        let (tx, mut rx) = mpsc::channel(8);
        mock.generate(&[], &utterance("unknown"), CancellationToken::new(), tx)
            .await
            .unwrap();
        assert_eq!(rx.recv().await.unwrap(), "fallback");
    }

    #[tokio::test]
    async fn failure_injection_surfaces_provider_error() {
        let mock = MockResponder::new().failing("quota exceeded");
        let (tx, _rx) = mpsc::channel(8);
        let err = mock
            .generate(&[], &utterance("x"), CancellationToken::new(), tx)
            .await;
        assert!(matches!(err, Err(VoiceError::Provider(_))));
        assert_eq!(mock.call_count(), 1);
    }

    #[tokio::test]
    async fn stalling_responder_reacts_to_cancel() {
        let mock = MockResponder::new().stalling();
        let (tx, _rx) = mpsc::channel(8);
        let cancel = CancellationToken::new();
        let cancel2 = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            cancel2.cancel();
        });
        let err = mock.generate(&[], &utterance("x"), cancel, tx).await;
        assert!(matches!(err, Err(VoiceError::Cancelled)));
    }

    #[tokio::test]
    async fn delayed_chunks_stop_on_cancel() {
        let mock = MockResponder::new()
            .with_default_reply(vec!["a", "b", "c"])
            .with_chunk_delay(Duration::from_millis(50));
        let (tx, mut rx) = mpsc::channel(8);
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = mock.generate(&[], &utterance("x"), cancel, tx).await;
        assert!(matches!(err, Err(VoiceError::Cancelled)));
        assert!(rx.try_recv().is_err());
    }
}
