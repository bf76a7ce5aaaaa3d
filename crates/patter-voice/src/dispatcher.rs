//! **Hybrid Dispatcher** — race the keyword fast path against the generative fallback.
//!
//! One dispatcher per conversation. For each finalized utterance it queries the
//! keyword table synchronously; on a hit the canned chunks stream immediately and
//! the fallback responder is never started. On a miss the responder runs in its
//! own task behind a bounded channel, with cooperative cancellation for barge-in
//! and an overall turn timeout. Exactly one source's output reaches the sink per
//! turn, and at most one non-cancelled turn is active per conversation.

use crate::config::VoiceConfig;
use crate::error::VoiceError;
use crate::keyword::KeywordTable;
use crate::normalize::{normalize, NormalizerConfig};
use crate::responder::FallbackResponder;
use crate::turn::{ContextTurn, RecognitionEvent, ResponseChunk, TurnStatus, Utterance};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Provider-neutral message emitted as the single terminal chunk of a failed turn.
pub const DEFAULT_APOLOGY: &str =
    "I'm sorry, I'm having trouble answering right now. Please try again.";

/// Configuration for per-turn dispatch behavior.
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// Overall budget for the fallback path before the turn fails (default: 10s).
    pub fallback_timeout: Duration,
    /// How long a cancelled responder gets to wind down before we stop waiting (default: 300ms).
    pub cancellation_grace: Duration,
    /// Bound on the in-flight chunk queue per turn (default: 32).
    pub chunk_capacity: usize,
    /// Fallback-of-last-resort message for failed turns.
    pub apology: String,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            fallback_timeout: Duration::from_secs(10),
            cancellation_grace: Duration::from_millis(300),
            chunk_capacity: 32,
            apology: DEFAULT_APOLOGY.to_string(),
        }
    }
}

impl DispatcherConfig {
    /// Derive dispatch settings from the external configuration surface.
    pub fn from_voice_config(cfg: &VoiceConfig) -> Self {
        Self {
            fallback_timeout: Duration::from_millis(cfg.fallback_timeout_ms),
            cancellation_grace: Duration::from_millis(cfg.cancellation_grace_ms),
            ..Self::default()
        }
    }
}

/// Caller-side handle for one turn: the ordered chunk stream plus status observation.
pub struct TurnHandle {
    pub turn_id: u64,
    chunks: Option<mpsc::Receiver<ResponseChunk>>,
    status_rx: watch::Receiver<TurnStatus>,
}

impl TurnHandle {
    /// Receive the next chunk; `None` once the stream is closed (or after `close`).
    pub async fn recv_chunk(&mut self) -> Option<ResponseChunk> {
        match self.chunks {
            Some(ref mut rx) => rx.recv().await,
            None => None,
        }
    }

    /// Drain the stream to close and return everything received.
    pub async fn collect_chunks(&mut self) -> Vec<ResponseChunk> {
        let mut chunks = Vec::new();
        while let Some(chunk) = self.recv_chunk().await {
            chunks.push(chunk);
        }
        chunks
    }

    /// Close the output stream. Idempotent: closing twice is a no-op.
    pub fn close(&mut self) {
        if self.chunks.take().is_some() {
            debug!(turn_id = self.turn_id, "turn output stream closed by caller");
        }
    }

    /// Current turn status.
    pub fn status(&self) -> TurnStatus {
        *self.status_rx.borrow()
    }

    /// Wait until the turn reaches a terminal status and return it.
    pub async fn wait_terminal(&mut self) -> TurnStatus {
        loop {
            let status = *self.status_rx.borrow();
            if status.is_terminal() {
                return status;
            }
            if self.status_rx.changed().await.is_err() {
                return *self.status_rx.borrow();
            }
        }
    }
}

struct ActiveTurn {
    turn_id: u64,
    cancel: CancellationToken,
}

/// Per-turn context shared with the emitter/forwarder tasks. The dispatcher is
/// the sole writer of turn state; these tasks are its extension for one turn.
struct TurnCtx {
    turn_id: u64,
    utterance: Utterance,
    cancel: CancellationToken,
    chunk_tx: mpsc::Sender<ResponseChunk>,
    status_tx: watch::Sender<TurnStatus>,
    seq: AtomicU64,
    active: Arc<Mutex<Option<ActiveTurn>>>,
    history: Arc<Mutex<Vec<ContextTurn>>>,
}

enum SendOutcome {
    Sent,
    Cancelled,
    /// The consumer dropped the receiving half; treated like cancellation.
    Closed,
}

impl TurnCtx {
    async fn send_chunk(&self, text: String, is_final: bool) -> SendOutcome {
        let chunk = ResponseChunk {
            turn_id: self.turn_id,
            sequence_no: self.seq.fetch_add(1, Ordering::SeqCst),
            text,
            is_final,
        };
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => SendOutcome::Cancelled,
            sent = self.chunk_tx.send(chunk) => {
                if sent.is_ok() { SendOutcome::Sent } else { SendOutcome::Closed }
            }
        }
    }

    async fn finish(&self, status: TurnStatus) {
        let _ = self.status_tx.send(status);
        let mut active = self.active.lock().await;
        if active.as_ref().map(|a| a.turn_id) == Some(self.turn_id) {
            *active = None;
        }
        info!(turn_id = self.turn_id, status = status.as_str(), "turn finished");
    }

    async fn record_exchange(&self, assistant: String) {
        self.history.lock().await.push(ContextTurn {
            user: self.utterance.raw_text.clone(),
            assistant,
        });
    }
}

/// The per-conversation dispatcher. Share via `Arc`; `dispatch` may be called
/// from anywhere, turn creation and cancellation are serialized internally.
pub struct HybridDispatcher {
    table: Arc<KeywordTable>,
    responder: Arc<dyn FallbackResponder>,
    normalizer: NormalizerConfig,
    config: DispatcherConfig,
    next_turn_id: AtomicU64,
    active: Arc<Mutex<Option<ActiveTurn>>>,
    history: Arc<Mutex<Vec<ContextTurn>>>,
}

impl HybridDispatcher {
    pub fn new(
        table: Arc<KeywordTable>,
        responder: Arc<dyn FallbackResponder>,
        config: DispatcherConfig,
    ) -> Self {
        Self {
            table,
            responder,
            normalizer: NormalizerConfig::default(),
            config,
            next_turn_id: AtomicU64::new(0),
            active: Arc::new(Mutex::new(None)),
            history: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Override the normalizer (e.g. a custom punctuation set).
    pub fn with_normalizer(mut self, normalizer: NormalizerConfig) -> Self {
        self.normalizer = normalizer;
        self
    }

    /// Snapshot of the conversation history passed to the fallback responder.
    pub async fn context(&self) -> Vec<ContextTurn> {
        self.history.lock().await.clone()
    }

    /// Entry point for the speech-recognition collaborator. Interim recognitions
    /// are not actionable and return `None` without touching any turn state.
    pub async fn handle_recognition(&self, event: RecognitionEvent) -> Option<TurnHandle> {
        if !event.is_final {
            debug!("ignoring interim recognition event");
            return None;
        }
        Some(self.dispatch(&event.raw_text).await)
    }

    /// Dispatch one finalized utterance: cancel any in-flight turn (barge-in),
    /// then stream a response from exactly one source.
    pub async fn dispatch(&self, raw_text: &str) -> TurnHandle {
        let turn_id = self.next_turn_id.fetch_add(1, Ordering::SeqCst);
        let normalized = normalize(raw_text, &self.normalizer);
        let utterance = Utterance::new(raw_text, normalized, turn_id);
        let cancel = CancellationToken::new();

        {
            let mut active = self.active.lock().await;
            if let Some(stale) = active.take() {
                info!(
                    stale_turn = stale.turn_id,
                    new_turn = turn_id,
                    "barge-in: cancelling in-flight turn"
                );
                stale.cancel.cancel();
            }
            *active = Some(ActiveTurn {
                turn_id,
                cancel: cancel.clone(),
            });
        }

        let (chunk_tx, chunk_rx) = mpsc::channel(self.config.chunk_capacity);
        let (status_tx, status_rx) = watch::channel(TurnStatus::Pending);
        let ctx = TurnCtx {
            turn_id,
            utterance,
            cancel,
            chunk_tx,
            status_tx,
            seq: AtomicU64::new(0),
            active: Arc::clone(&self.active),
            history: Arc::clone(&self.history),
        };

        // Fast path: synchronous, bounded lookup. Never async.
        if let Some(entry) = self.table.lookup(&ctx.utterance.normalized_text) {
            info!(turn_id, pattern = %entry.pattern, "keyword hit: fast path");
            let _ = ctx.status_tx.send(TurnStatus::KeywordWon);
            let response = entry.response.clone();
            tokio::spawn(emit_keyword_response(ctx, response));
        } else {
            info!(turn_id, "no keyword match: invoking fallback responder");
            let _ = ctx.status_tx.send(TurnStatus::FallbackStarted);
            let responder = Arc::clone(&self.responder);
            let context = self.history.lock().await.clone();
            let config = self.config.clone();
            tokio::spawn(run_fallback_turn(ctx, responder, context, config));
        }

        TurnHandle {
            turn_id,
            chunks: Some(chunk_rx),
            status_rx,
        }
    }
}

/// Stream canned chunks for a keyword hit. The last chunk is marked final.
async fn emit_keyword_response(ctx: TurnCtx, response: Vec<String>) {
    let last = response.len().saturating_sub(1);
    let mut transcript = String::new();
    for (i, text) in response.into_iter().enumerate() {
        transcript.push_str(&text);
        match ctx.send_chunk(text, i == last).await {
            SendOutcome::Sent => {}
            SendOutcome::Cancelled | SendOutcome::Closed => {
                ctx.finish(TurnStatus::Cancelled).await;
                return;
            }
        }
    }
    ctx.record_exchange(transcript).await;
    ctx.finish(TurnStatus::Completed).await;
}

enum ForwardEnd {
    /// The responder closed its channel; transcript holds the full reply.
    Drained(String),
    Cancelled,
    ConsumerGone,
}

/// Forward responder output downstream, assigning sequence numbers. Holds one
/// chunk of lookahead so the last chunk can be marked final when the responder's
/// channel closes.
async fn forward_chunks(ctx: &TurnCtx, mut raw_rx: mpsc::Receiver<String>) -> ForwardEnd {
    let mut transcript = String::new();
    let mut pending: Option<String> = None;
    loop {
        let incoming = tokio::select! {
            biased;
            _ = ctx.cancel.cancelled() => return ForwardEnd::Cancelled,
            text = raw_rx.recv() => text,
        };
        match incoming {
            Some(text) => {
                if pending.is_none() && transcript.is_empty() {
                    let _ = ctx.status_tx.send(TurnStatus::FallbackWon);
                }
                if let Some(prev) = pending.take() {
                    transcript.push_str(&prev);
                    match ctx.send_chunk(prev, false).await {
                        SendOutcome::Sent => {}
                        SendOutcome::Cancelled => return ForwardEnd::Cancelled,
                        SendOutcome::Closed => return ForwardEnd::ConsumerGone,
                    }
                }
                pending = Some(text);
            }
            None => {
                if let Some(prev) = pending.take() {
                    transcript.push_str(&prev);
                    match ctx.send_chunk(prev, true).await {
                        SendOutcome::Sent => {}
                        SendOutcome::Cancelled => return ForwardEnd::Cancelled,
                        SendOutcome::Closed => return ForwardEnd::ConsumerGone,
                    }
                }
                return ForwardEnd::Drained(transcript);
            }
        }
    }
}

/// Give a cancelled responder its grace period to wind down, then stop waiting.
/// The underlying call is never forcibly terminated; its output channel is
/// already closed, so a laggard exits on its next send.
async fn await_responder_grace(
    generator: JoinHandle<crate::error::VoiceResult<()>>,
    grace: Duration,
    turn_id: u64,
) {
    match tokio::time::timeout(grace, generator).await {
        Ok(Ok(Ok(()))) | Ok(Ok(Err(VoiceError::Cancelled))) => {
            debug!(turn_id, "responder wound down after cancellation");
        }
        Ok(Ok(Err(e))) => {
            debug!(turn_id, error = %e, "responder errored while cancelling");
        }
        Ok(Err(e)) => {
            warn!(turn_id, error = %e, "responder task panicked during cancellation");
        }
        Err(_) => {
            warn!(turn_id, grace_ms = grace.as_millis() as u64, "responder exceeded cancellation grace period");
        }
    }
}

/// Drive one fallback turn: spawn the responder, forward its chunks under the
/// overall timeout, and resolve the terminal status.
async fn run_fallback_turn(
    ctx: TurnCtx,
    responder: Arc<dyn FallbackResponder>,
    context: Vec<ContextTurn>,
    config: DispatcherConfig,
) {
    let (raw_tx, raw_rx) = mpsc::channel::<String>(config.chunk_capacity);
    // Child token: a barge-in (parent) cancels the responder too, but a turn
    // timeout cancels only the responder so the apology can still go out.
    let responder_cancel = ctx.cancel.child_token();
    let gen_cancel = responder_cancel.clone();
    let gen_utterance = ctx.utterance.clone();
    let generator = tokio::spawn(async move {
        responder
            .generate(&context, &gen_utterance, gen_cancel, raw_tx)
            .await
    });

    let forwarded = tokio::time::timeout(config.fallback_timeout, forward_chunks(&ctx, raw_rx)).await;

    match forwarded {
        Err(_elapsed) => {
            // Turn timeout. Dropping the forward future also dropped raw_rx,
            // so the responder unblocks on its next send.
            warn!(
                turn_id = ctx.turn_id,
                timeout_ms = config.fallback_timeout.as_millis() as u64,
                "fallback responder exceeded turn timeout"
            );
            responder_cancel.cancel();
            await_responder_grace(generator, config.cancellation_grace, ctx.turn_id).await;
            emit_failure(&ctx, &config.apology).await;
        }
        Ok(ForwardEnd::Cancelled) => {
            await_responder_grace(generator, config.cancellation_grace, ctx.turn_id).await;
            ctx.finish(TurnStatus::Cancelled).await;
        }
        Ok(ForwardEnd::ConsumerGone) => {
            debug!(turn_id = ctx.turn_id, "chunk consumer went away mid-turn");
            responder_cancel.cancel();
            await_responder_grace(generator, config.cancellation_grace, ctx.turn_id).await;
            ctx.finish(TurnStatus::Cancelled).await;
        }
        Ok(ForwardEnd::Drained(transcript)) => match generator.await {
            Ok(Ok(())) => {
                ctx.record_exchange(transcript).await;
                ctx.finish(TurnStatus::Completed).await;
            }
            Ok(Err(VoiceError::Cancelled)) => {
                ctx.finish(TurnStatus::Cancelled).await;
            }
            Ok(Err(e)) => {
                warn!(turn_id = ctx.turn_id, error = %e, "fallback responder failed");
                emit_failure(&ctx, &config.apology).await;
            }
            Err(e) => {
                // Panic inside the responder stays contained at this boundary.
                warn!(turn_id = ctx.turn_id, error = %e, "fallback responder task failed");
                emit_failure(&ctx, &config.apology).await;
            }
        },
    }
}

/// Emit exactly one terminal apology chunk, then close the stream as `Failed`.
async fn emit_failure(ctx: &TurnCtx, apology: &str) {
    match ctx.send_chunk(apology.to_string(), true).await {
        SendOutcome::Sent => {}
        SendOutcome::Cancelled | SendOutcome::Closed => {
            // Superseded while apologizing; the new turn's output takes over.
            ctx.finish(TurnStatus::Cancelled).await;
            return;
        }
    }
    ctx.finish(TurnStatus::Failed).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keyword::{KeywordEntry, KeywordTable, MatchKind};
    use crate::responder::MockResponder;

    fn keyword_table(entries: Vec<KeywordEntry>) -> Arc<KeywordTable> {
        Arc::new(KeywordTable::new(entries, &NormalizerConfig::default()))
    }

    fn quick_config() -> DispatcherConfig {
        DispatcherConfig {
            fallback_timeout: Duration::from_millis(500),
            cancellation_grace: Duration::from_millis(100),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn keyword_hit_streams_canned_chunks_in_order() {
        let table = keyword_table(vec![KeywordEntry::new(
            "hello",
            MatchKind::Exact,
            vec!["Hi ".to_string(), "there.".to_string()],
            0,
        )]);
        let responder = Arc::new(MockResponder::new());
        let dispatcher = HybridDispatcher::new(table, responder.clone(), quick_config());

        let mut handle = dispatcher.dispatch("Hello!").await;
        let chunks = handle.collect_chunks().await;

        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].sequence_no, 0);
        assert_eq!(chunks[0].text, "Hi ");
        assert!(!chunks[0].is_final);
        assert_eq!(chunks[1].sequence_no, 1);
        assert!(chunks[1].is_final);
        assert_eq!(handle.wait_terminal().await, TurnStatus::Completed);
        assert_eq!(responder.call_count(), 0);
    }

    #[tokio::test]
    async fn miss_invokes_responder_exactly_once() {
        let table = keyword_table(vec![]);
        let responder = Arc::new(MockResponder::new().with_default_reply(vec!["gen ", "reply"]));
        let dispatcher = HybridDispatcher::new(table, responder.clone(), quick_config());

        let mut handle = dispatcher.dispatch("something novel").await;
        let chunks = handle.collect_chunks().await;

        assert_eq!(responder.call_count(), 1);
        assert_eq!(chunks.len(), 2);
        assert!(chunks.last().unwrap().is_final);
        assert_eq!(handle.wait_terminal().await, TurnStatus::Completed);
    }

    #[tokio::test]
    async fn provider_error_yields_single_apology_chunk() {
        let table = keyword_table(vec![]);
        let responder = Arc::new(MockResponder::new().failing("network down"));
        let dispatcher = HybridDispatcher::new(table, responder, quick_config());

        let mut handle = dispatcher.dispatch("anything").await;
        let chunks = handle.collect_chunks().await;

        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].text, DEFAULT_APOLOGY);
        assert!(chunks[0].is_final);
        assert_eq!(handle.wait_terminal().await, TurnStatus::Failed);
    }

    #[tokio::test]
    async fn completed_turns_accumulate_context() {
        let table = keyword_table(vec![KeywordEntry::single(
            "hi",
            MatchKind::Exact,
            "Hello!",
            0,
        )]);
        let responder = Arc::new(MockResponder::new().with_default_reply(vec!["Generated."]));
        let dispatcher = HybridDispatcher::new(table, responder, quick_config());

        let mut h1 = dispatcher.dispatch("hi").await;
        h1.collect_chunks().await;
        h1.wait_terminal().await;
        let mut h2 = dispatcher.dispatch("tell me more").await;
        h2.collect_chunks().await;
        h2.wait_terminal().await;

        let context = dispatcher.context().await;
        assert_eq!(context.len(), 2);
        assert_eq!(context[0].user, "hi");
        assert_eq!(context[0].assistant, "Hello!");
        assert_eq!(context[1].assistant, "Generated.");
    }

    #[tokio::test]
    async fn interim_recognition_is_ignored() {
        let table = keyword_table(vec![]);
        let responder = Arc::new(MockResponder::new());
        let dispatcher = HybridDispatcher::new(table, responder.clone(), quick_config());

        let handle = dispatcher
            .handle_recognition(RecognitionEvent {
                raw_text: "partial te".to_string(),
                is_final: false,
            })
            .await;

        assert!(handle.is_none());
        assert_eq!(responder.call_count(), 0);
    }

    #[tokio::test]
    async fn turn_ids_are_monotonic() {
        let table = keyword_table(vec![KeywordEntry::single("a", MatchKind::Exact, "x", 0)]);
        let responder = Arc::new(MockResponder::new());
        let dispatcher = HybridDispatcher::new(table, responder, quick_config());

        let mut h1 = dispatcher.dispatch("a").await;
        h1.collect_chunks().await;
        h1.wait_terminal().await;
        let h2 = dispatcher.dispatch("a").await;
        assert!(h2.turn_id > h1.turn_id);
    }
}
