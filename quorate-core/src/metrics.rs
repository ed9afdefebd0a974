//! Append-only JSONL metrics log.
//!
//! One line per event, `{"ts": ..., "event": ..., ...fields}`. Writes are
//! best-effort; a full disk must never take the dictation path down.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;

use parking_lot::Mutex;
use serde_json::{json, Value};
use tracing::warn;

pub struct MetricsWriter {
    file: Mutex<File>,
}

impl MetricsWriter {
    pub fn open(path: &Path) -> std::io::Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            file: Mutex::new(file),
        })
    }

    /// Append one event. `fields` must be a JSON object; its keys are merged
    /// beside `ts` and `event`.
    pub fn log(&self, event: &str, fields: Value) {
        let mut line = json!({
            "ts": chrono::Utc::now().to_rfc3339(),
            "event": event,
        });
        if let (Some(obj), Some(extra)) = (line.as_object_mut(), fields.as_object()) {
            for (k, v) in extra {
                obj.insert(k.clone(), v.clone());
            }
        }

        let mut file = self.file.lock();
        if let Err(e) = writeln!(file, "{line}") {
            warn!(event, "metrics write failed: {e}");
        }
    }
}
