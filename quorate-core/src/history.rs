//! Recent-output history fed to the correction prompt as prior context.

use std::time::{Duration, Instant};

use parking_lot::Mutex;

const MAX_ENTRIES: usize = 5;
const MAX_AGE: Duration = Duration::from_secs(300);

/// Keeps the last few finalized transcriptions within a time window.
pub struct TranscriptionHistory {
    entries: Mutex<Vec<(Instant, String)>>,
}

impl Default for TranscriptionHistory {
    fn default() -> Self {
        Self::new()
    }
}

impl TranscriptionHistory {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(Vec::new()),
        }
    }

    pub fn add(&self, text: &str) {
        self.add_at(text, Instant::now());
    }

    pub fn add_at(&self, text: &str, now: Instant) {
        let trimmed = text.trim();
        if trimmed.is_empty() {
            return;
        }
        let mut entries = self.entries.lock();
        entries.push((now, trimmed.to_string()));
        Self::prune(&mut entries, now);
    }

    /// Recent entries joined with `" | "`, oldest first. Empty string when
    /// nothing recent exists.
    pub fn context(&self) -> String {
        self.context_at(Instant::now())
    }

    pub fn context_at(&self, now: Instant) -> String {
        let mut entries = self.entries.lock();
        Self::prune(&mut entries, now);
        entries
            .iter()
            .map(|(_, t)| t.as_str())
            .collect::<Vec<_>>()
            .join(" | ")
    }

    fn prune(entries: &mut Vec<(Instant, String)>, now: Instant) {
        entries.retain(|(t, _)| now.duration_since(*t) <= MAX_AGE);
        if entries.len() > MAX_ENTRIES {
            let drop = entries.len() - MAX_ENTRIES;
            entries.drain(..drop);
        }
    }
}
