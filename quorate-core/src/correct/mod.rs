//! Language-model correction of aggregated transcripts.
//!
//! The client builds one prompt from every transcript the session collected,
//! routes it through [`router::CorrectionRouter`], and retries exactly once
//! on a fallback backend when the first returns nothing. Streaming callers
//! get fragments in order; their concatenation is the returned text.

pub mod http;
pub mod router;

use std::time::Instant;

use tracing::{info, warn};

use crate::config::ConfigSnapshot;
use crate::context::{AppContext, RigorLevel};
use crate::providers::TranscriptionResult;
use http::{BackendRegistry, ChatRequest};
use router::{BackendDescriptor, CorrectionRouter};

/// Routing bias for selection editing: always treat as a long input so the
/// quality backend wins.
const EDITING_WORD_COUNT: usize = 50;

const DEFAULT_SYSTEM_PROMPT: &str = "\
You are a dictation cleanup assistant. You receive one or more raw \
speech-to-text transcriptions of the same utterance and return a single \
cleaned version.

Clean up:
- Remove pure filler sounds: \"um\", \"uh\", \"er\", \"ah\", \"hmm\"
- Fix obvious transcription mistakes and mis-heard words
- Apply self-corrections: keep the correction, drop the mistake \
(\"Tuesday, no wait, Friday\" becomes \"Friday\")
- Fix grammar and add sensible punctuation

Be conservative. When unsure, keep the speaker's original words, natural \
style, and all substantive content. Keep intentional phrases like \"I mean\" \
at the start of a sentence and tag questions like \"right?\" at the end.

Obey meta-commands instead of transcribing them: \"scratch that\", \
\"never mind\", and similar remove the content they refer to.

When several transcriptions are given, merge the most plausible parts of \
each. Return only the cleaned text, nothing else.";

const DEFAULT_EDITING_PROMPT: &str = "\
You are a text editing assistant. Apply the user's requested change \
precisely and return only the edited text.";

/// Result of one correction call, with metadata for the metrics log.
#[derive(Debug, Clone, Default)]
pub struct CorrectionOutcome {
    /// Empty when every routed backend failed.
    pub text: String,
    pub backend: Option<String>,
    pub model: Option<String>,
    pub latency_ms: u64,
    pub streamed: bool,
}

/// Prompt assembly + backend invocation + fallback.
pub struct CorrectionClient {
    router: CorrectionRouter,
    backends: BackendRegistry,
}

impl CorrectionClient {
    pub fn new(router: CorrectionRouter, backends: BackendRegistry) -> Self {
        Self { router, backends }
    }

    /// Correct and merge `results` into one clean utterance.
    pub fn correct(
        &self,
        results: &[TranscriptionResult],
        context: Option<&AppContext>,
        history_context: &str,
        snapshot: &ConfigSnapshot,
        on_delta: Option<&dyn Fn(&str)>,
    ) -> CorrectionOutcome {
        if results.is_empty() {
            return CorrectionOutcome::default();
        }

        let prompt = build_prompt(results, context, history_context);
        let system_prompt = build_system_prompt(snapshot);

        // Route on the longest single transcription, not the sum — the sum
        // grows with mic/provider count, not utterance length.
        let word_count = results
            .iter()
            .map(|r| r.text.split_whitespace().count())
            .max()
            .unwrap_or(0);

        self.invoke_with_fallback(&prompt, &system_prompt, word_count, snapshot, on_delta)
    }

    /// Apply a spoken editing command to selected text.
    ///
    /// Falls back to the untouched selection when every backend fails, so a
    /// dead network can never destroy the user's selection.
    pub fn edit_selection(
        &self,
        selection: &str,
        utterance: &str,
        snapshot: &ConfigSnapshot,
    ) -> String {
        let prompt = format!(
            "TASK: {utterance}\n\nORIGINAL TEXT:\n{selection}\n\n\
             INSTRUCTIONS: Apply the task to the original text above. Return ONLY the edited \
             text, nothing else. No explanations, no formatting, no extra content."
        );
        let system_prompt = if snapshot.editing_prompt.trim().is_empty() {
            DEFAULT_EDITING_PROMPT.to_string()
        } else {
            snapshot.editing_prompt.clone()
        };

        let outcome =
            self.invoke_with_fallback(&prompt, &system_prompt, EDITING_WORD_COUNT, snapshot, None);
        if outcome.text.is_empty() {
            selection.to_string()
        } else {
            outcome.text
        }
    }

    fn invoke_with_fallback(
        &self,
        prompt: &str,
        system_prompt: &str,
        word_count: usize,
        snapshot: &ConfigSnapshot,
        on_delta: Option<&dyn Fn(&str)>,
    ) -> CorrectionOutcome {
        let Some(primary) = self.router.select(snapshot, word_count) else {
            warn!("no correction backend available (no credentials or all backing off)");
            return CorrectionOutcome::default();
        };

        let start = Instant::now();
        let text = self.invoke(&primary, prompt, system_prompt, snapshot, on_delta);
        if !text.is_empty() {
            self.router.health().record_success(primary.name);
            let latency_ms = start.elapsed().as_millis() as u64;
            info!(backend = primary.name, word_count, latency_ms, "correction complete");
            return CorrectionOutcome {
                text,
                backend: Some(primary.name.to_string()),
                model: Some(primary.model.to_string()),
                latency_ms,
                streamed: on_delta.is_some(),
            };
        }

        self.router.health().record_failure(primary.name);
        let Some(fallback) = self.router.fallback(snapshot, primary.name) else {
            warn!(backend = primary.name, "correction failed with no fallback available");
            return CorrectionOutcome::default();
        };

        info!(from = primary.name, to = fallback.name, "correction falling back");
        let text = self.invoke(&fallback, prompt, system_prompt, snapshot, on_delta);
        let latency_ms = start.elapsed().as_millis() as u64;
        if text.is_empty() {
            self.router.health().record_failure(fallback.name);
            warn!("all correction backends failed");
            return CorrectionOutcome::default();
        }
        self.router.health().record_success(fallback.name);
        CorrectionOutcome {
            text,
            backend: Some(fallback.name.to_string()),
            model: Some(fallback.model.to_string()),
            latency_ms,
            streamed: on_delta.is_some(),
        }
    }

    fn invoke(
        &self,
        backend: &BackendDescriptor,
        prompt: &str,
        system_prompt: &str,
        snapshot: &ConfigSnapshot,
        on_delta: Option<&dyn Fn(&str)>,
    ) -> String {
        let Some(implementation) = self.backends.get(backend.name) else {
            warn!(backend = backend.name, "no implementation registered");
            return String::new();
        };
        let request = ChatRequest {
            system_prompt,
            user_prompt: prompt,
            api_key: router::credential(snapshot, backend.name),
            model: backend.model,
        };
        implementation.complete(&request, on_delta)
    }
}

fn build_system_prompt(snapshot: &ConfigSnapshot) -> String {
    let mut prompt = if snapshot.system_prompt.trim().is_empty() {
        DEFAULT_SYSTEM_PROMPT.to_string()
    } else {
        snapshot.system_prompt.clone()
    };
    if !snapshot.custom_instructions.trim().is_empty() {
        prompt.push_str("\n\nUser preferences:\n");
        prompt.push_str(snapshot.custom_instructions.trim());
    }
    prompt
}

/// Assemble the user prompt: context lines, prior output, style hint, then
/// one `[provider/device]: text` line per unique transcription.
fn build_prompt(
    results: &[TranscriptionResult],
    context: Option<&AppContext>,
    history_context: &str,
) -> String {
    // Deduplicate repeats so identical transcriptions don't burn tokens.
    let mut seen: Vec<String> = Vec::new();
    let mut unique: Vec<&TranscriptionResult> = Vec::new();
    for r in results {
        let key = r
            .text
            .to_lowercase()
            .split_whitespace()
            .collect::<Vec<_>>()
            .join(" ");
        if key.is_empty() || seen.contains(&key) {
            continue;
        }
        seen.push(key);
        unique.push(r);
    }

    let transcription_lines = unique
        .iter()
        .map(|r| format!("[{}/{}]: {}", r.provider, r.device, r.text))
        .collect::<Vec<_>>()
        .join("\n");

    let mut context_lines: Vec<String> = Vec::new();
    if let Some(ctx) = context {
        context_lines.push(format!("Active application: {}", ctx.app_name));
        if !ctx.window_title.is_empty() {
            context_lines.push(format!("Window: {}", ctx.window_title));
        }
    }
    if !history_context.is_empty() {
        context_lines.push(format!(
            "Previous context (for reference only, do not include in output): {history_context}"
        ));
    }

    let style_note = match context.map(|c| c.rigor) {
        Some(RigorLevel::High) => Some("Style: formal (strict grammar)"),
        Some(RigorLevel::Low) => Some("Style: casual (preserve natural speech)"),
        _ => None,
    };

    let mut sections: Vec<String> = Vec::new();
    if !context_lines.is_empty() {
        sections.push(context_lines.join("\n"));
    }
    if let Some(note) = style_note {
        sections.push(note.to_string());
    }
    sections.push(format!("Transcriptions:\n{transcription_lines}"));
    sections.join("\n\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::ChatBackend;
    use router::HealthTracker;
    use std::sync::Arc;

    fn result(provider: &str, device: &str, text: &str) -> TranscriptionResult {
        TranscriptionResult {
            text: text.into(),
            provider: provider.into(),
            device: device.into(),
            latency_ms: 50,
            confidence: None,
        }
    }

    fn snapshot() -> ConfigSnapshot {
        ConfigSnapshot {
            enabled_devices: vec![],
            preroll_seconds: 1.0,
            silence_threshold: 2.0,
            sample_rate: 16_000,
            double_tap_threshold: 0.3,
            toggle_mode_timeout: 600.0,
            enabled_providers: vec![],
            consensus_threshold: 2,
            consensus_max_words: 15,
            groq_api_key: "gk".into(),
            gemini_api_key: "mk".into(),
            openrouter_api_key: "ok".into(),
            custom_instructions: String::new(),
            system_prompt: String::new(),
            editing_prompt: String::new(),
        }
    }

    struct ScriptedBackend {
        name: &'static str,
        reply: String,
        fragments: Vec<String>,
        calls: parking_lot::Mutex<Vec<String>>,
    }

    impl ScriptedBackend {
        fn replying(name: &'static str, reply: &str) -> Arc<Self> {
            Arc::new(Self {
                name,
                reply: reply.into(),
                fragments: vec![],
                calls: parking_lot::Mutex::new(vec![]),
            })
        }

        fn failing(name: &'static str) -> Arc<Self> {
            Self::replying(name, "")
        }

        fn streaming(name: &'static str, fragments: &[&str]) -> Arc<Self> {
            Arc::new(Self {
                name,
                reply: fragments.concat(),
                fragments: fragments.iter().map(|s| s.to_string()).collect(),
                calls: parking_lot::Mutex::new(vec![]),
            })
        }
    }

    impl ChatBackend for ScriptedBackend {
        fn name(&self) -> &str {
            self.name
        }

        fn complete(&self, req: &ChatRequest<'_>, on_delta: Option<&dyn Fn(&str)>) -> String {
            self.calls.lock().push(req.user_prompt.to_string());
            if let Some(on_delta) = on_delta {
                if self.fragments.is_empty() {
                    if !self.reply.is_empty() {
                        on_delta(&self.reply);
                    }
                } else {
                    for f in &self.fragments {
                        on_delta(f);
                    }
                }
            }
            self.reply.clone()
        }
    }

    fn client_with(backends: BackendRegistry) -> CorrectionClient {
        CorrectionClient::new(
            CorrectionRouter::new(Arc::new(HealthTracker::new())),
            backends,
        )
    }

    #[test]
    fn prompt_orders_context_style_then_transcriptions() {
        let ctx = AppContext::new("Mail", "Re: budget", "com.apple.mail");
        let results = vec![result("pa", "d1", "send the budget")];
        let prompt = build_prompt(&results, Some(&ctx), "earlier text");

        let ctx_pos = prompt.find("Active application: Mail").unwrap();
        let window_pos = prompt.find("Window: Re: budget").unwrap();
        let hist_pos = prompt.find("Previous context").unwrap();
        let style_pos = prompt.find("Style: formal (strict grammar)").unwrap();
        let lines_pos = prompt.find("[pa/d1]: send the budget").unwrap();
        assert!(ctx_pos < window_pos && window_pos < hist_pos);
        assert!(hist_pos < style_pos && style_pos < lines_pos);
    }

    #[test]
    fn prompt_omits_sections_without_content() {
        let results = vec![result("pa", "d1", "hello")];
        let prompt = build_prompt(&results, None, "");
        assert!(prompt.starts_with("Transcriptions:"));
        assert!(!prompt.contains("Style:"));
        assert!(!prompt.contains("Previous context"));
    }

    #[test]
    fn low_rigor_uses_casual_hint_normal_omits() {
        let low = AppContext::new("Terminal", "", "com.apple.Terminal");
        let results = vec![result("pa", "d1", "ls -la")];
        assert!(build_prompt(&results, Some(&low), "")
            .contains("Style: casual (preserve natural speech)"));

        let normal = AppContext::new("Editor", "", "com.example.editor");
        assert!(!build_prompt(&results, Some(&normal), "").contains("Style:"));
    }

    #[test]
    fn prompt_deduplicates_by_normalized_text_keeping_order() {
        let results = vec![
            result("pa", "d1", "Hello world"),
            result("pb", "d1", "hello   world"),
            result("pa", "d2", "different text"),
            result("pb", "d2", ""),
        ];
        let prompt = build_prompt(&results, None, "");
        assert!(prompt.contains("[pa/d1]: Hello world"));
        assert!(!prompt.contains("[pb/d1]"));
        let first = prompt.find("[pa/d1]").unwrap();
        let second = prompt.find("[pa/d2]").unwrap();
        assert!(first < second);
    }

    #[test]
    fn custom_instructions_append_as_user_preferences() {
        let mut snap = snapshot();
        snap.custom_instructions = "All lowercase in chat apps.".into();
        let prompt = build_system_prompt(&snap);
        assert!(prompt.contains("User preferences:\nAll lowercase in chat apps."));
        assert!(prompt.starts_with("You are a dictation cleanup assistant."));
    }

    #[test]
    fn configured_system_prompt_replaces_default() {
        let mut snap = snapshot();
        snap.system_prompt = "Echo the input.".into();
        assert!(build_system_prompt(&snap).starts_with("Echo the input."));
    }

    #[test]
    fn short_input_routes_to_fastest_backend() {
        let groq = ScriptedBackend::replying("groq", "cleaned");
        let gemini = ScriptedBackend::failing("gemini");
        let client = client_with(
            BackendRegistry::empty()
                .with_backend(groq.clone())
                .with_backend(gemini.clone()),
        );

        let outcome = client.correct(
            &[result("pa", "d1", "short words")],
            None,
            "",
            &snapshot(),
            None,
        );
        assert_eq!(outcome.text, "cleaned");
        assert_eq!(outcome.backend.as_deref(), Some("groq"));
        assert_eq!(groq.calls.lock().len(), 1);
        assert!(gemini.calls.lock().is_empty());
    }

    #[test]
    fn empty_reply_falls_back_once_by_priority() {
        // Long input → gemini primary. Gemini fails, groq (priority 2) wins.
        let long_text = "word ".repeat(30);
        let gemini = ScriptedBackend::failing("gemini");
        let groq = ScriptedBackend::replying("groq", "recovered");
        let client = client_with(
            BackendRegistry::empty()
                .with_backend(gemini.clone())
                .with_backend(groq.clone()),
        );

        let outcome = client.correct(
            &[result("pa", "d1", &long_text)],
            None,
            "",
            &snapshot(),
            None,
        );
        assert_eq!(outcome.text, "recovered");
        assert_eq!(outcome.backend.as_deref(), Some("groq"));
        assert_eq!(gemini.calls.lock().len(), 1);
        assert_eq!(groq.calls.lock().len(), 1);
    }

    #[test]
    fn all_backends_failing_returns_empty() {
        let client = client_with(
            BackendRegistry::empty()
                .with_backend(ScriptedBackend::failing("groq"))
                .with_backend(ScriptedBackend::failing("gemini"))
                .with_backend(ScriptedBackend::failing("openrouter")),
        );
        let outcome = client.correct(&[result("pa", "d1", "hi")], None, "", &snapshot(), None);
        assert!(outcome.text.is_empty());
        assert!(outcome.backend.is_none());
    }

    #[test]
    fn streaming_fragments_concatenate_to_returned_text() {
        let groq = ScriptedBackend::streaming("groq", &["Test", "ing ", "done."]);
        let client = client_with(BackendRegistry::empty().with_backend(groq));

        let collected = parking_lot::Mutex::new(String::new());
        let outcome = client.correct(
            &[result("pa", "d1", "testing done")],
            None,
            "",
            &snapshot(),
            Some(&|frag: &str| collected.lock().push_str(frag)),
        );
        assert_eq!(outcome.text, "Testing done.");
        assert_eq!(*collected.lock(), outcome.text);
        assert!(outcome.streamed);
    }

    #[test]
    fn repeated_failures_push_backend_into_backoff() {
        let health = Arc::new(HealthTracker::new());
        let groq = ScriptedBackend::failing("groq");
        let gemini = ScriptedBackend::replying("gemini", "ok");
        let client = CorrectionClient::new(
            CorrectionRouter::new(Arc::clone(&health)),
            BackendRegistry::empty()
                .with_backend(groq.clone())
                .with_backend(gemini.clone()),
        );

        for _ in 0..3 {
            client.correct(&[result("pa", "d1", "short")], None, "", &snapshot(), None);
        }
        // groq has 3 consecutive failures → backing off; gemini becomes
        // primary even for short inputs.
        client.correct(&[result("pa", "d1", "short")], None, "", &snapshot(), None);
        assert_eq!(groq.calls.lock().len(), 3);
        assert_eq!(gemini.calls.lock().len(), 4);
    }

    #[test]
    fn edit_selection_returns_selection_when_backends_fail() {
        let client = client_with(
            BackendRegistry::empty()
                .with_backend(ScriptedBackend::failing("groq"))
                .with_backend(ScriptedBackend::failing("gemini"))
                .with_backend(ScriptedBackend::failing("openrouter")),
        );
        let edited = client.edit_selection("original text", "make it shout", &snapshot());
        assert_eq!(edited, "original text");
    }

    #[test]
    fn edit_selection_biases_to_quality_backend() {
        let gemini = ScriptedBackend::replying("gemini", "EDITED");
        let groq = ScriptedBackend::replying("groq", "wrong backend");
        let client = client_with(
            BackendRegistry::empty()
                .with_backend(gemini.clone())
                .with_backend(groq.clone()),
        );
        let edited = client.edit_selection("original", "uppercase it", &snapshot());
        assert_eq!(edited, "EDITED");
        assert_eq!(gemini.calls.lock().len(), 1);
        assert!(groq.calls.lock().is_empty());

        let prompt = gemini.calls.lock()[0].clone();
        assert!(prompt.starts_with("TASK: uppercase it"));
        assert!(prompt.contains("ORIGINAL TEXT:\noriginal"));
    }

    #[test]
    fn no_results_short_circuits() {
        let groq = ScriptedBackend::replying("groq", "never");
        let client = client_with(BackendRegistry::empty().with_backend(groq.clone()));
        let outcome = client.correct(&[], None, "", &snapshot(), None);
        assert!(outcome.text.is_empty());
        assert!(groq.calls.lock().is_empty());
    }
}
