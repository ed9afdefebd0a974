//! Serialized text delivery: typing, clipboard, selection replacement.
//!
//! One process-wide mutex orders every output operation, including whole
//! streamed corrections — the guard is taken once and held across all
//! deltas, so two sessions (or a session and a stray notification path) can
//! never interleave keystrokes.
//!
//! Typing is chunked by UTF-16 code units because synthetic-keystroke APIs
//! cap events at a code-unit count; a surrogate pair is never split across
//! events and a short sleep between events avoids coalescing loss.

use std::time::Duration;

use parking_lot::{Mutex, MutexGuard};
use tracing::{debug, info, warn};

use crate::context::ContextProbe;
use crate::error::Result;

/// Largest number of UTF-16 code units per synthetic keystroke event.
const MAX_EVENT_UNITS: usize = 20;

/// Pause between keystroke events so the target app keeps up.
const INTER_EVENT_SLEEP: Duration = Duration::from_millis(8);

/// Wait after a synthetic paste before restoring the clipboard.
const PASTE_SETTLE: Duration = Duration::from_millis(100);

/// Which delivery path a session's output took.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputMethod {
    Typed,
    Streamed,
    Clipboard,
    /// Selection replacement via the clipboard-paste round trip.
    Replaced,
}

impl OutputMethod {
    pub fn as_str(self) -> &'static str {
        match self {
            OutputMethod::Typed => "typed",
            OutputMethod::Streamed => "streamed",
            OutputMethod::Clipboard => "clipboard",
            OutputMethod::Replaced => "replaced",
        }
    }
}

/// OS primitives the writer drives. The host crate implements these with
/// real keystroke/clipboard/notification APIs; tests use recording fakes.
pub trait OutputSink: Send + Sync {
    /// Deliver one batch of keystrokes (≤ [`MAX_EVENT_UNITS`] UTF-16 units).
    fn send_keystrokes(&self, text: &str) -> Result<()>;

    fn set_clipboard(&self, text: &str) -> Result<()>;

    fn clipboard(&self) -> Result<String>;

    /// Synthesize the platform paste shortcut.
    fn paste_shortcut(&self) -> Result<()>;

    /// Best-effort notification; must not fail.
    fn notify(&self, title: &str, body: &str);

    /// Short audible cue for "busy, try again".
    fn busy_cue(&self) {}
}

/// The process-wide output writer.
pub struct OutputWriter {
    sink: Box<dyn OutputSink>,
    lock: Mutex<()>,
}

impl OutputWriter {
    pub fn new(sink: Box<dyn OutputSink>) -> Self {
        Self {
            sink,
            lock: Mutex::new(()),
        }
    }

    /// Type `text` at the OS cursor.
    pub fn type_text(&self, text: &str) -> Result<()> {
        let _guard = self.lock.lock();
        self.type_locked(text)
    }

    pub fn copy_to_clipboard(&self, text: &str) -> Result<()> {
        let _guard = self.lock.lock();
        self.sink.set_clipboard(text)
    }

    /// Replace the current selection: save the clipboard, paste `text`, then
    /// restore the clipboard — on every exit path, including paste failure.
    pub fn replace_selection(&self, text: &str) -> Result<()> {
        let _guard = self.lock.lock();
        let saved = match self.sink.clipboard() {
            Ok(prev) => Some(prev),
            Err(e) => {
                debug!("clipboard read before replace failed: {e}");
                None
            }
        };

        let pasted = (|| {
            self.sink.set_clipboard(text)?;
            self.sink.paste_shortcut()?;
            std::thread::sleep(PASTE_SETTLE);
            Ok(())
        })();

        if let Some(prev) = saved {
            if let Err(e) = self.sink.set_clipboard(&prev) {
                warn!("clipboard restore failed: {e}");
            }
        }
        pasted
    }

    pub fn notify(&self, title: &str, body: &str) {
        self.sink.notify(title, body);
    }

    pub fn busy_cue(&self) {
        self.sink.busy_cue();
    }

    /// Session output procedure: re-query the frontmost app and type, unless
    /// the window changed since the session started — then clipboard plus a
    /// notification. Returns the path taken.
    pub fn deliver(
        &self,
        text: &str,
        expected_bundle: Option<&str>,
        probe: &dyn ContextProbe,
    ) -> Result<OutputMethod> {
        let _guard = self.lock.lock();
        let current = probe.app_context();
        let changed = match (expected_bundle, &current) {
            (Some(expected), Some(ctx)) => ctx.bundle_id != expected,
            _ => false,
        };

        if changed {
            info!("window changed since session start, routing to clipboard");
            self.sink.set_clipboard(text)?;
            self.sink
                .notify("Quorate", "Window changed — copied to clipboard");
            return Ok(OutputMethod::Clipboard);
        }

        self.type_locked(text)?;
        Ok(OutputMethod::Typed)
    }

    /// Take the output lock for the duration of a streamed correction.
    /// Deltas pushed through the guard type in reception order.
    pub fn begin_stream(&self) -> OutputStream<'_> {
        OutputStream {
            _guard: self.lock.lock(),
            sink: self.sink.as_ref(),
        }
    }

    fn type_locked(&self, text: &str) -> Result<()> {
        let chunks = utf16_chunks(text, MAX_EVENT_UNITS);
        let last = chunks.len().saturating_sub(1);
        for (i, chunk) in chunks.iter().enumerate() {
            self.sink.send_keystrokes(chunk)?;
            if i != last {
                std::thread::sleep(INTER_EVENT_SLEEP);
            }
        }
        Ok(())
    }
}

/// Holds the output mutex across a streamed response.
pub struct OutputStream<'a> {
    _guard: MutexGuard<'a, ()>,
    sink: &'a dyn OutputSink,
}

impl OutputStream<'_> {
    /// Type one fragment under the held lock.
    pub fn push(&self, fragment: &str) {
        for (i, chunk) in utf16_chunks(fragment, MAX_EVENT_UNITS).iter().enumerate() {
            if i != 0 {
                std::thread::sleep(INTER_EVENT_SLEEP);
            }
            if let Err(e) = self.sink.send_keystrokes(chunk) {
                warn!("streamed keystroke failed: {e}");
                return;
            }
        }
    }

    /// Type a full string under the held lock (raw-fallback path).
    pub fn type_text(&self, text: &str) {
        self.push(text);
    }
}

/// Split into pieces of at most `max_units` UTF-16 code units without ever
/// splitting a character (and therefore never a surrogate pair).
fn utf16_chunks(text: &str, max_units: usize) -> Vec<String> {
    let mut chunks = Vec::new();
    let mut current = String::new();
    let mut units = 0usize;

    for c in text.chars() {
        let len = c.len_utf16();
        if units + len > max_units && !current.is_empty() {
            chunks.push(std::mem::take(&mut current));
            units = 0;
        }
        current.push(c);
        units += len;
    }
    if !current.is_empty() {
        chunks.push(current);
    }
    chunks
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::{AppContext, ContextProbe};
    use crate::error::QuorateError;
    use std::sync::Arc;

    #[derive(Debug, Clone, PartialEq, Eq)]
    enum Call {
        Keys(String),
        SetClipboard(String),
        Paste,
        Notify(String),
    }

    #[derive(Default)]
    struct FakeSink {
        calls: Mutex<Vec<Call>>,
        clipboard: Mutex<String>,
        fail_paste: bool,
    }

    impl OutputSink for FakeSink {
        fn send_keystrokes(&self, text: &str) -> Result<()> {
            self.calls.lock().push(Call::Keys(text.to_string()));
            Ok(())
        }

        fn set_clipboard(&self, text: &str) -> Result<()> {
            *self.clipboard.lock() = text.to_string();
            self.calls.lock().push(Call::SetClipboard(text.to_string()));
            Ok(())
        }

        fn clipboard(&self) -> Result<String> {
            Ok(self.clipboard.lock().clone())
        }

        fn paste_shortcut(&self) -> Result<()> {
            if self.fail_paste {
                return Err(QuorateError::Output("paste rejected".into()));
            }
            self.calls.lock().push(Call::Paste);
            Ok(())
        }

        fn notify(&self, _title: &str, body: &str) {
            self.calls.lock().push(Call::Notify(body.to_string()));
        }
    }

    struct FixedProbe(Option<AppContext>);

    impl ContextProbe for FixedProbe {
        fn app_context(&self) -> Option<AppContext> {
            self.0.clone()
        }
    }

    fn writer() -> (Arc<FakeSink>, OutputWriter) {
        let sink = Arc::new(FakeSink::default());
        let handle = Arc::clone(&sink);

        struct Forward(Arc<FakeSink>);
        impl OutputSink for Forward {
            fn send_keystrokes(&self, text: &str) -> Result<()> {
                self.0.send_keystrokes(text)
            }
            fn set_clipboard(&self, text: &str) -> Result<()> {
                self.0.set_clipboard(text)
            }
            fn clipboard(&self) -> Result<String> {
                self.0.clipboard()
            }
            fn paste_shortcut(&self) -> Result<()> {
                self.0.paste_shortcut()
            }
            fn notify(&self, title: &str, body: &str) {
                self.0.notify(title, body)
            }
        }

        (sink, OutputWriter::new(Box::new(Forward(handle))))
    }

    fn typed(sink: &FakeSink) -> String {
        sink.calls
            .lock()
            .iter()
            .filter_map(|c| match c {
                Call::Keys(s) => Some(s.clone()),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn chunks_respect_utf16_unit_cap() {
        let text = "a".repeat(45);
        let chunks = utf16_chunks(&text, 20);
        assert_eq!(
            chunks.iter().map(String::len).collect::<Vec<_>>(),
            vec![20, 20, 5]
        );
    }

    #[test]
    fn astral_characters_count_two_units_and_never_split() {
        // Each emoji is one surrogate pair = 2 UTF-16 units.
        let text = "😀".repeat(15);
        let chunks = utf16_chunks(&text, 20);
        assert_eq!(chunks.len(), 2);
        for chunk in &chunks {
            let units: usize = chunk.chars().map(char::len_utf16).sum();
            assert!(units <= 20);
            // Valid UTF-8 chunk boundaries guarantee unbroken pairs.
            assert!(chunk.chars().all(|c| c == '😀'));
        }
    }

    #[test]
    fn mixed_text_keeps_pair_at_boundary_together() {
        // 19 ASCII units then an astral char: the pair moves to chunk two.
        let text = format!("{}😀", "x".repeat(19));
        let chunks = utf16_chunks(&text, 20);
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0], "x".repeat(19));
        assert_eq!(chunks[1], "😀");
    }

    #[test]
    fn typed_chunks_reassemble_exactly() {
        let (sink, writer) = writer();
        let text = "Hello, wörld! 😀 end.";
        writer.type_text(text).unwrap();
        assert_eq!(typed(&sink), text);
    }

    #[test]
    fn deliver_types_when_window_unchanged() {
        let (sink, writer) = writer();
        let probe = FixedProbe(Some(AppContext::new("Mail", "", "com.foo")));
        let method = writer.deliver("hello", Some("com.foo"), &probe).unwrap();
        assert_eq!(method, OutputMethod::Typed);
        assert_eq!(typed(&sink), "hello");
    }

    #[test]
    fn deliver_routes_to_clipboard_on_window_change() {
        let (sink, writer) = writer();
        let probe = FixedProbe(Some(AppContext::new("Other", "", "com.bar")));
        let method = writer.deliver("hello", Some("com.foo"), &probe).unwrap();
        assert_eq!(method, OutputMethod::Clipboard);
        assert_eq!(typed(&sink), "");
        let calls = sink.calls.lock();
        assert!(calls.contains(&Call::SetClipboard("hello".into())));
        assert!(calls
            .iter()
            .any(|c| matches!(c, Call::Notify(b) if b.contains("Window changed"))));
    }

    #[test]
    fn deliver_types_when_context_is_unavailable() {
        let (sink, writer) = writer();
        let probe = FixedProbe(None);
        let method = writer.deliver("hello", Some("com.foo"), &probe).unwrap();
        assert_eq!(method, OutputMethod::Typed);
        assert_eq!(typed(&sink), "hello");
    }

    #[test]
    fn replace_selection_restores_clipboard() {
        let (sink, writer) = writer();
        sink.set_clipboard("precious").unwrap();
        sink.calls.lock().clear();

        writer.replace_selection("replacement").unwrap();
        let calls = sink.calls.lock().clone();
        assert_eq!(
            calls,
            vec![
                Call::SetClipboard("replacement".into()),
                Call::Paste,
                Call::SetClipboard("precious".into()),
            ]
        );
        assert_eq!(*sink.clipboard.lock(), "precious");
    }

    #[test]
    fn replace_selection_restores_clipboard_even_when_paste_fails() {
        let sink = Arc::new(FakeSink {
            fail_paste: true,
            ..Default::default()
        });

        struct Forward(Arc<FakeSink>);
        impl OutputSink for Forward {
            fn send_keystrokes(&self, text: &str) -> Result<()> {
                self.0.send_keystrokes(text)
            }
            fn set_clipboard(&self, text: &str) -> Result<()> {
                self.0.set_clipboard(text)
            }
            fn clipboard(&self) -> Result<String> {
                self.0.clipboard()
            }
            fn paste_shortcut(&self) -> Result<()> {
                self.0.paste_shortcut()
            }
            fn notify(&self, title: &str, body: &str) {
                self.0.notify(title, body)
            }
        }

        let writer = OutputWriter::new(Box::new(Forward(Arc::clone(&sink))));
        sink.set_clipboard("precious").unwrap();

        assert!(writer.replace_selection("new text").is_err());
        assert_eq!(*sink.clipboard.lock(), "precious");
    }

    #[test]
    fn stream_guard_types_fragments_in_order() {
        let (sink, writer) = writer();
        {
            let stream = writer.begin_stream();
            stream.push("Hello, ");
            stream.push("world");
            stream.push(".");
        }
        assert_eq!(typed(&sink), "Hello, world.");
    }

    #[test]
    fn stream_guard_excludes_other_writers_until_dropped() {
        let (sink, writer) = writer();
        let writer = Arc::new(writer);
        let stream = writer.begin_stream();
        stream.push("A");

        let contender = Arc::clone(&writer);
        let handle = std::thread::spawn(move || {
            contender.type_text("B").unwrap();
        });

        // Give the contender a moment to block on the output mutex.
        std::thread::sleep(Duration::from_millis(30));
        stream.push("A2");
        drop(stream);
        handle.join().unwrap();

        assert_eq!(typed(&sink), "AA2B");
    }
}
