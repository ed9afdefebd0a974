//! Per-recording orchestration.
//!
//! ## Lifecycle
//!
//! ```text
//! SessionManager::start_session()
//!     └─► Session::start()        new → active, context + selection captured
//!         └─► on_chunk_ready()    one worker thread per emitted chunk:
//!         │                       fan-out (device × provider) → early
//!         │                       consensus → outcome into its slot
//!         └─► finalize(final)     active → finalizing, background thread:
//!                                 final chunk, await in-flight, aggregate,
//!                                 correct, output → complete
//! ```
//!
//! Chunk outcomes land in slots reserved at emission time, so aggregation
//! preserves emission order even when a later chunk transcribes faster than
//! an earlier one. The consensus short-circuit cancels only the current
//! chunk's pending jobs; `finalize` never cancels, it awaits.

use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam_channel::Receiver;
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::json;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::audio::buffer::AudioChunk;
use crate::config::{ConfigSnapshot, ConfigStore};
use crate::consensus::check_consensus;
use crate::context::{AppContext, ContextProbe};
use crate::correct::CorrectionClient;
use crate::history::TranscriptionHistory;
use crate::metrics::MetricsWriter;
use crate::output::{OutputMethod, OutputWriter};
use crate::providers::{ProviderRegistry, TranscriptionResult};

/// Per-chunk fan-out deadline; `finalize` also waits at most this long for
/// each outstanding chunk.
pub const CHUNK_TIMEOUT: Duration = Duration::from_secs(30);

/// Broadcast capacity for session events.
const EVENT_CAP: usize = 256;

/// Everything one chunk's fan-out produced.
#[derive(Debug, Clone)]
pub struct ChunkOutcome {
    pub results: Vec<TranscriptionResult>,
    /// Set iff the consensus checker found agreement.
    pub consensus: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionPhase {
    Started,
    Rejected,
    Finalizing,
    Completed,
}

/// Emitted on the manager's broadcast channel as sessions move through
/// their lifecycle.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionEvent {
    pub session_id: String,
    pub phase: SessionPhase,
    pub detail: Option<String>,
}

/// Process-owned collaborators handed to every session. No hidden globals:
/// the host builds these once at startup and passes them in.
#[derive(Clone)]
pub struct SessionDeps {
    pub registry: Arc<ProviderRegistry>,
    pub output: Arc<OutputWriter>,
    pub probe: Arc<dyn ContextProbe>,
    pub corrector: Arc<CorrectionClient>,
    pub history: Arc<TranscriptionHistory>,
    pub metrics: Option<Arc<MetricsWriter>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Lifecycle {
    New,
    Active,
    Finalizing,
    Complete,
}

struct SessionState {
    lifecycle: Lifecycle,
    context: Option<AppContext>,
    selection: Option<String>,
    started_at: Option<Instant>,
    /// Chunk outcomes, slot-indexed in emission order. `None` = in flight.
    outcomes: Vec<Option<ChunkOutcome>>,
    /// Done signals for spawned chunk threads (disconnect = finished).
    in_flight: Vec<Receiver<()>>,
    output_method: Option<OutputMethod>,
    final_text: String,
}

/// One recording, admission to completion.
pub struct Session {
    id: Uuid,
    snapshot: Arc<ConfigSnapshot>,
    deps: SessionDeps,
    events: broadcast::Sender<SessionEvent>,
    on_complete: Box<dyn Fn(Uuid) + Send + Sync>,
    state: Mutex<SessionState>,
}

impl Session {
    pub fn new(
        id: Uuid,
        snapshot: Arc<ConfigSnapshot>,
        deps: SessionDeps,
        events: broadcast::Sender<SessionEvent>,
        on_complete: Box<dyn Fn(Uuid) + Send + Sync>,
    ) -> Self {
        Self {
            id,
            snapshot,
            deps,
            events,
            on_complete,
            state: Mutex::new(SessionState {
                lifecycle: Lifecycle::New,
                context: None,
                selection: None,
                started_at: None,
                outcomes: Vec::new(),
                in_flight: Vec::new(),
                output_method: None,
                final_text: String::new(),
            }),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    /// True from admission until `complete`; the manager's busy test.
    pub fn is_active(&self) -> bool {
        self.state.lock().lifecycle != Lifecycle::Complete
    }

    /// Delivery path of the finished session, for metrics.
    pub fn output_method(&self) -> Option<OutputMethod> {
        self.state.lock().output_method
    }

    /// The text this session delivered; empty until complete (or when the
    /// session produced nothing).
    pub fn final_text(&self) -> String {
        self.state.lock().final_text.clone()
    }

    /// Completed chunk outcomes in emission order.
    pub fn chunk_outcomes(&self) -> Vec<ChunkOutcome> {
        self.state
            .lock()
            .outcomes
            .iter()
            .flatten()
            .cloned()
            .collect()
    }

    /// Capture app context and any selection; publish the started event.
    pub fn start(&self) {
        // Probing can shell out to the OS; do it before taking the lock.
        let context = self.deps.probe.app_context();
        let selection = self.deps.probe.selected_text();

        {
            let mut state = self.state.lock();
            if state.lifecycle != Lifecycle::New {
                return;
            }
            state.lifecycle = Lifecycle::Active;
            state.started_at = Some(Instant::now());
            state.context = context.clone();
            state.selection = selection;
        }

        if let Some(metrics) = &self.deps.metrics {
            metrics.log(
                "session_start",
                json!({
                    "session_id": self.id.to_string(),
                    "app": context.as_ref().map(|c| c.app_name.clone()),
                    "bundle_id": context.as_ref().map(|c| c.bundle_id.clone()),
                    "devices": self.snapshot.enabled_devices,
                    "providers": self.snapshot.enabled_providers,
                }),
            );
        }
        self.send_event(SessionPhase::Started, None);
        info!(session_id = %self.id, "session started");
    }

    /// The audio engine's chunk sink. Holds only a weak reference so a
    /// completed session cannot be kept alive by the engine.
    pub fn chunk_sink(self: &Arc<Self>) -> crate::audio::ChunkSink {
        let weak = Arc::downgrade(self);
        Arc::new(move |chunk: AudioChunk| {
            if let Some(session) = weak.upgrade() {
                session.on_chunk_ready(chunk);
            }
        })
    }

    /// Mid-recording chunk intake: reserve the next outcome slot and fan the
    /// chunk out on a worker thread.
    pub fn on_chunk_ready(self: &Arc<Self>, chunk: AudioChunk) {
        if chunk.is_empty() {
            return;
        }

        let slot = {
            let mut state = self.state.lock();
            if state.lifecycle != Lifecycle::Active {
                debug!(session_id = %self.id, "chunk dropped outside active phase");
                return;
            }
            state.outcomes.push(None);
            let slot = state.outcomes.len() - 1;
            let (done_tx, done_rx) = crossbeam_channel::bounded::<()>(0);
            state.in_flight.push(done_rx);

            let session = Arc::clone(self);
            let spawned = std::thread::Builder::new()
                .name(format!("quorate-chunk-{}", slot + 1))
                .spawn(move || {
                    session.process_chunk(chunk, slot);
                    drop(done_tx);
                });
            if spawned.is_err() {
                warn!(session_id = %self.id, "failed to spawn chunk worker");
                state.in_flight.pop();
            }
            slot
        };

        if let Some(metrics) = &self.deps.metrics {
            metrics.log(
                "chunk_received",
                json!({
                    "session_id": self.id.to_string(),
                    "chunk_num": slot + 1,
                }),
            );
        }
    }

    /// Transcribe one chunk across all providers × devices, short-circuiting
    /// on early consensus, and store the outcome in its reserved slot.
    fn process_chunk(&self, chunk: AudioChunk, slot: usize) {
        let chunk_num = slot + 1;
        let threshold = self.snapshot.consensus_threshold;
        let max_words = self.snapshot.consensus_max_words;

        let dispatch = self.deps.registry.dispatch_chunk(&chunk);
        let deadline = Instant::now() + CHUNK_TIMEOUT;
        let mut results: Vec<TranscriptionResult> = Vec::with_capacity(dispatch.expected());
        let mut consensus = None;

        while results.len() < dispatch.expected() {
            match dispatch.receiver().recv_deadline(deadline) {
                Ok(result) => {
                    debug!(
                        session_id = %self.id,
                        chunk_num,
                        provider = result.provider.as_str(),
                        device = result.device.as_str(),
                        latency_ms = result.latency_ms,
                        text_preview = %preview(&result.text),
                        "transcription arrived"
                    );
                    if let Some(metrics) = &self.deps.metrics {
                        metrics.log(
                            "transcription",
                            json!({
                                "session_id": self.id.to_string(),
                                "chunk_num": chunk_num,
                                "provider": result.provider,
                                "device": result.device,
                                "latency_ms": result.latency_ms,
                            }),
                        );
                    }
                    results.push(result);

                    if results.len() >= threshold {
                        if let Some(text) = check_consensus(&results, threshold, max_words) {
                            info!(
                                session_id = %self.id,
                                chunk_num,
                                consensus = %preview(&text),
                                "consensus reached, cancelling stragglers"
                            );
                            dispatch.cancel();
                            consensus = Some(text);
                            break;
                        }
                    }
                }
                Err(_) => {
                    warn!(
                        session_id = %self.id,
                        chunk_num,
                        collected = results.len(),
                        "chunk fan-out timed out"
                    );
                    dispatch.cancel();
                    break;
                }
            }
        }

        if let Some(metrics) = &self.deps.metrics {
            metrics.log(
                "consensus",
                json!({
                    "session_id": self.id.to_string(),
                    "chunk_num": chunk_num,
                    "reached": consensus.is_some(),
                    "results": results.len(),
                }),
            );
        }

        let mut state = self.state.lock();
        if state.lifecycle == Lifecycle::Complete {
            // Terminal: a straggling chunk after completion is dropped.
            return;
        }
        if let Some(cell) = state.outcomes.get_mut(slot) {
            *cell = Some(ChunkOutcome { results, consensus });
        }
    }

    /// Key released: hand over the final chunk and move processing to a
    /// background thread so the input path stays responsive.
    pub fn finalize(self: &Arc<Self>, final_chunk: AudioChunk) {
        {
            let mut state = self.state.lock();
            if state.lifecycle != Lifecycle::Active {
                return;
            }
            state.lifecycle = Lifecycle::Finalizing;
        }
        self.send_event(SessionPhase::Finalizing, None);

        let session = Arc::clone(self);
        let spawned = std::thread::Builder::new()
            .name("quorate-finalize".into())
            .spawn(move || session.finalize_impl(final_chunk));
        if spawned.is_err() {
            warn!(session_id = %self.id, "failed to spawn finalize thread");
            self.complete(None, "");
        }
    }

    fn finalize_impl(&self, final_chunk: AudioChunk) {
        let finalize_started = Instant::now();

        // The final chunk is transcribed inline on this thread.
        if !final_chunk.is_empty() {
            let slot = {
                let mut state = self.state.lock();
                state.outcomes.push(None);
                state.outcomes.len() - 1
            };
            self.process_chunk(final_chunk, slot);
        }

        // Await the mid-recording chunks; never cancel them.
        let waiters = std::mem::take(&mut self.state.lock().in_flight);
        for done in waiters {
            if done.recv_timeout(CHUNK_TIMEOUT).is_ok() {
                continue; // only disconnects arrive, but be explicit
            }
        }

        let (outcomes, context, selection, started_at) = {
            let state = self.state.lock();
            let unfinished = state.outcomes.iter().filter(|o| o.is_none()).count();
            if unfinished > 0 {
                warn!(session_id = %self.id, unfinished, "chunks still unfinished at aggregation");
            }
            (
                state.outcomes.iter().flatten().cloned().collect::<Vec<_>>(),
                state.context.clone(),
                state.selection.clone(),
                state.started_at,
            )
        };

        let (chunk_texts, all_results) = aggregate(&outcomes);
        if chunk_texts.is_empty() {
            info!(session_id = %self.id, "no transcription results, nothing to output");
            self.complete(None, "");
            return;
        }
        let raw_combined = chunk_texts.join(" ");
        info!(
            session_id = %self.id,
            chunks = outcomes.len(),
            transcriptions = all_results.len(),
            "aggregated"
        );

        // Text-editing mode: the utterance is a command over the selection.
        if let Some(selection) = selection {
            info!(session_id = %self.id, "text edit mode");
            let edited = self
                .deps
                .corrector
                .edit_selection(&selection, &raw_combined, &self.snapshot);
            match self.deps.output.replace_selection(&edited) {
                Ok(()) => {
                    self.deps.history.add(&edited);
                    self.log_output(OutputMethod::Replaced, &edited, started_at, finalize_started);
                    self.complete(Some(OutputMethod::Replaced), &edited);
                }
                Err(e) => {
                    warn!(session_id = %self.id, "selection replacement failed: {e}");
                    self.complete(None, &edited);
                }
            }
            return;
        }

        // Fast path: a single chunk that already has consensus skips the
        // correction stage entirely.
        if outcomes.len() == 1 {
            if let Some(text) = outcomes[0].consensus.clone() {
                info!(session_id = %self.id, "fast path (single-chunk consensus)");
                self.deliver_final(&text, context.as_ref(), started_at, finalize_started);
                return;
            }
        }

        let history_context = self.deps.history.context();
        let current = self.deps.probe.app_context();
        let window_unchanged = match (&context, &current) {
            (Some(at_start), Some(now)) => at_start.bundle_id == now.bundle_id,
            // Without both contexts a change cannot be established; type.
            _ => true,
        };

        if window_unchanged {
            // Stream the correction straight into the foreground app. The
            // output mutex is held for the whole response.
            let stream = self.deps.output.begin_stream();
            let on_delta = |fragment: &str| stream.push(fragment);
            let outcome = self.deps.corrector.correct(
                &all_results,
                context.as_ref(),
                &history_context,
                &self.snapshot,
                Some(&on_delta),
            );

            if outcome.text.is_empty() {
                warn!(session_id = %self.id, "correction failed, typing longest raw transcription");
                stream.type_text(&raw_combined);
                drop(stream);
                self.deps.history.add(&raw_combined);
                self.log_output(OutputMethod::Typed, &raw_combined, started_at, finalize_started);
                self.complete(Some(OutputMethod::Typed), &raw_combined);
            } else {
                drop(stream);
                if let Some(metrics) = &self.deps.metrics {
                    metrics.log(
                        "llm_correction",
                        json!({
                            "session_id": self.id.to_string(),
                            "backend": outcome.backend,
                            "model": outcome.model,
                            "latency_ms": outcome.latency_ms,
                            "streamed": true,
                        }),
                    );
                }
                self.deps.history.add(&outcome.text);
                self.log_output(OutputMethod::Streamed, &outcome.text, started_at, finalize_started);
                self.complete(Some(OutputMethod::Streamed), &outcome.text);
            }
        } else {
            // Window changed before correction: no streaming, deliver via
            // clipboard plus a notification.
            let outcome = self.deps.corrector.correct(
                &all_results,
                context.as_ref(),
                &history_context,
                &self.snapshot,
                None,
            );
            let text = if outcome.text.is_empty() {
                raw_combined
            } else {
                outcome.text
            };
            if let Err(e) = self.deps.output.copy_to_clipboard(&text) {
                warn!(session_id = %self.id, "clipboard delivery failed: {e}");
            }
            self.deps
                .output
                .notify("Quorate", "Window changed — copied to clipboard");
            self.deps.history.add(&text);
            self.log_output(OutputMethod::Clipboard, &text, started_at, finalize_started);
            self.complete(Some(OutputMethod::Clipboard), &text);
        }
    }

    /// The §-output procedure for already-final text: re-query the window
    /// and type, or fall back to clipboard on a change.
    fn deliver_final(
        &self,
        text: &str,
        context: Option<&AppContext>,
        started_at: Option<Instant>,
        finalize_started: Instant,
    ) {
        let expected = context.map(|c| c.bundle_id.as_str());
        match self
            .deps
            .output
            .deliver(text, expected, self.deps.probe.as_ref())
        {
            Ok(method) => {
                self.deps.history.add(text);
                self.log_output(method, text, started_at, finalize_started);
                self.complete(Some(method), text);
            }
            Err(e) => {
                warn!(session_id = %self.id, "output failed: {e}");
                self.complete(None, text);
            }
        }
    }

    fn log_output(
        &self,
        method: OutputMethod,
        text: &str,
        started_at: Option<Instant>,
        finalize_started: Instant,
    ) {
        let words = text.split_whitespace().count();
        let processing_secs = finalize_started.elapsed().as_secs_f64();
        let total_secs = started_at
            .map(|t| t.elapsed().as_secs_f64())
            .unwrap_or(processing_secs);
        info!(
            session_id = %self.id,
            method = method.as_str(),
            words,
            total_secs = format_args!("{total_secs:.2}"),
            processing_secs = format_args!("{processing_secs:.2}"),
            "output delivered"
        );
        if let Some(metrics) = &self.deps.metrics {
            metrics.log(
                "output",
                json!({
                    "session_id": self.id.to_string(),
                    "method": method.as_str(),
                    "words": words,
                }),
            );
        }
    }

    fn complete(&self, method: Option<OutputMethod>, final_text: &str) {
        let chunks = {
            let mut state = self.state.lock();
            state.lifecycle = Lifecycle::Complete;
            state.output_method = method;
            state.final_text = final_text.to_string();
            state.outcomes.iter().flatten().count()
        };
        if let Some(metrics) = &self.deps.metrics {
            metrics.log(
                "session_complete",
                json!({
                    "session_id": self.id.to_string(),
                    "chunks": chunks,
                    "method": method.map(OutputMethod::as_str),
                }),
            );
        }
        self.send_event(SessionPhase::Completed, method.map(|m| m.as_str().to_string()));
        (self.on_complete)(self.id);
    }

    fn send_event(&self, phase: SessionPhase, detail: Option<String>) {
        let _ = self.events.send(SessionEvent {
            session_id: self.id.to_string(),
            phase,
            detail,
        });
    }
}

/// Per chunk: consensus text if present, else the result with the most
/// words (ties to the earliest arrival). Also flattens every result for the
/// correction prompt.
fn aggregate(outcomes: &[ChunkOutcome]) -> (Vec<String>, Vec<TranscriptionResult>) {
    let mut chunk_texts = Vec::new();
    let mut all_results = Vec::new();

    for outcome in outcomes {
        all_results.extend(outcome.results.iter().cloned());
        if let Some(consensus) = &outcome.consensus {
            chunk_texts.push(consensus.clone());
            continue;
        }
        let mut best: Option<(&TranscriptionResult, usize)> = None;
        for result in &outcome.results {
            let words = result.text.split_whitespace().count();
            let better = match best {
                Some((_, best_words)) => words > best_words,
                None => true,
            };
            if better {
                best = Some((result, words));
            }
        }
        if let Some((result, words)) = best {
            if words > 0 {
                chunk_texts.push(result.text.clone());
            }
        }
    }
    (chunk_texts, all_results)
}

fn preview(text: &str) -> String {
    if text.chars().count() > 50 {
        let mut cut: String = text.chars().take(50).collect();
        cut.push('…');
        cut
    } else {
        text.to_string()
    }
}

// ---------------------------------------------------------------------------
// Session manager
// ---------------------------------------------------------------------------

/// Admission control: at most one session at a time, reject-on-busy with an
/// audible cue, no queueing.
pub struct SessionManager {
    store: Arc<ConfigStore>,
    deps: SessionDeps,
    active: Mutex<Option<Arc<Session>>>,
    events: broadcast::Sender<SessionEvent>,
}

impl SessionManager {
    pub fn new(store: Arc<ConfigStore>, deps: SessionDeps) -> Arc<Self> {
        let (events, _) = broadcast::channel(EVENT_CAP);
        Arc::new(Self {
            store,
            deps,
            active: Mutex::new(None),
            events,
        })
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    /// Admit a new session, or reject with a busy cue when one is active.
    pub fn start_session(self: &Arc<Self>) -> Option<Arc<Session>> {
        let session = {
            let mut slot = self.active.lock();
            if let Some(existing) = slot.as_ref() {
                if existing.is_active() {
                    info!(session_id = %existing.id(), "busy — rejecting trigger");
                    self.deps.output.busy_cue();
                    let _ = self.events.send(SessionEvent {
                        session_id: existing.id().to_string(),
                        phase: SessionPhase::Rejected,
                        detail: Some("busy".into()),
                    });
                    return None;
                }
            }

            let id = Uuid::new_v4();
            let snapshot = self.store.snapshot();
            let manager = Arc::downgrade(self);
            let session = Arc::new(Session::new(
                id,
                snapshot,
                self.deps.clone(),
                self.events.clone(),
                Box::new(move |done| {
                    if let Some(manager) = manager.upgrade() {
                        manager.clear_slot(done);
                    }
                }),
            ));
            *slot = Some(Arc::clone(&session));
            session
        };

        // Context capture can shell out; run it outside the slot lock.
        session.start();
        Some(session)
    }

    pub fn is_busy(&self) -> bool {
        self.active
            .lock()
            .as_ref()
            .map(|s| s.is_active())
            .unwrap_or(false)
    }

    /// The session currently holding the slot, if any.
    pub fn active_session(&self) -> Option<Arc<Session>> {
        self.active.lock().clone()
    }

    /// Emergency reset: abandon whatever is in the slot. The abandoned
    /// session's completion callback still runs but cannot clear a
    /// successor (ids are compared).
    pub fn force_clear(&self) {
        if let Some(session) = self.active.lock().take() {
            warn!(session_id = %session.id(), "session abandoned by emergency reset");
        }
    }

    fn clear_slot(&self, id: Uuid) {
        let mut slot = self.active.lock();
        if slot.as_ref().map(|s| s.id()) == Some(id) {
            *slot = None;
        }
    }
}
