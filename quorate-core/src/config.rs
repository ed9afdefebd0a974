//! Configuration store with immutable per-session snapshots.
//!
//! Settings live in `settings.json` and API keys in `.env` under the data
//! directory; environment variables override file values. The store records
//! the files' modification times and rebuilds + atomically swaps the current
//! [`ConfigSnapshot`] when either changes. Sessions copy the snapshot once at
//! start and never consult the store again, so a mid-recording edit cannot
//! produce a half-old, half-new session.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

/// Immutable view of all tunables for one session.
#[derive(Debug, Clone)]
pub struct ConfigSnapshot {
    // Audio
    pub enabled_devices: Vec<String>,
    pub preroll_seconds: f64,
    pub silence_threshold: f64,
    pub sample_rate: u32,

    // Input
    pub double_tap_threshold: f64,
    pub toggle_mode_timeout: f64,

    // Transcription
    pub enabled_providers: Vec<String>,

    // Consensus
    pub consensus_threshold: usize,
    pub consensus_max_words: usize,

    // Credentials
    pub groq_api_key: String,
    pub gemini_api_key: String,
    pub openrouter_api_key: String,

    // Prompting
    pub custom_instructions: String,
    pub system_prompt: String,
    pub editing_prompt: String,
}

/// The user-editable settings file (`settings.json`).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[serde(default)]
pub struct SettingsFile {
    pub enabled_devices: Vec<String>,
    pub enabled_providers: Vec<String>,
    pub trigger_key: String,
    pub preroll_seconds: f64,
    pub silence_threshold: f64,
    pub sample_rate: u32,
    pub double_tap_threshold: f64,
    pub toggle_mode_timeout: f64,
    pub consensus_threshold: usize,
    pub consensus_max_words: usize,
    pub custom_instructions: String,
    pub system_prompt: String,
    pub editing_prompt: String,
}

impl Default for SettingsFile {
    fn default() -> Self {
        Self {
            enabled_devices: Vec::new(),
            enabled_providers: vec!["groq".into()],
            trigger_key: "alt_r".into(),
            preroll_seconds: 1.0,
            silence_threshold: 2.0,
            sample_rate: 16_000,
            double_tap_threshold: 0.3,
            toggle_mode_timeout: 600.0,
            consensus_threshold: 2,
            consensus_max_words: 15,
            custom_instructions: String::new(),
            system_prompt: String::new(),
            editing_prompt: String::new(),
        }
    }
}

impl SettingsFile {
    fn normalize(&mut self) {
        self.sample_rate = self.sample_rate.clamp(8_000, 48_000);
        self.preroll_seconds = self.preroll_seconds.clamp(0.0, 10.0);
        self.silence_threshold = self.silence_threshold.clamp(0.2, 30.0);
        self.double_tap_threshold = self.double_tap_threshold.clamp(0.05, 2.0);
        self.toggle_mode_timeout = self.toggle_mode_timeout.clamp(5.0, 3_600.0);
        self.consensus_threshold = self.consensus_threshold.max(1);
        self.consensus_max_words = self.consensus_max_words.max(1);
        self.enabled_devices.retain(|d| !d.trim().is_empty());
        self.enabled_providers.retain(|p| !p.trim().is_empty());
    }
}

#[derive(Debug, Clone, Default)]
struct Credentials {
    groq: String,
    gemini: String,
    openrouter: String,
}

struct StoreState {
    snapshot: Arc<ConfigSnapshot>,
    trigger_key: String,
    settings_mtime: Option<SystemTime>,
    env_mtime: Option<SystemTime>,
}

/// Process-owned configuration handle, passed by reference into the session
/// manager at startup.
pub struct ConfigStore {
    settings_path: PathBuf,
    env_path: PathBuf,
    state: RwLock<StoreState>,
}

impl ConfigStore {
    /// Load from `dir/settings.json` and `dir/.env`. Missing files fall back
    /// to defaults; a malformed settings file is logged and ignored.
    pub fn load(dir: &Path) -> Self {
        let settings_path = dir.join("settings.json");
        let env_path = dir.join(".env");
        let (snapshot, trigger_key) = build_snapshot(&settings_path, &env_path);
        let state = StoreState {
            snapshot: Arc::new(snapshot),
            trigger_key,
            settings_mtime: mtime(&settings_path),
            env_mtime: mtime(&env_path),
        };
        Self {
            settings_path,
            env_path,
            state: RwLock::new(state),
        }
    }

    /// Current snapshot. Checks file modification times first and swaps in a
    /// freshly built snapshot when either file changed.
    pub fn snapshot(&self) -> Arc<ConfigSnapshot> {
        let settings_mtime = mtime(&self.settings_path);
        let env_mtime = mtime(&self.env_path);
        {
            let state = self.state.read();
            if state.settings_mtime == settings_mtime && state.env_mtime == env_mtime {
                return Arc::clone(&state.snapshot);
            }
        }

        let mut state = self.state.write();
        // Re-check under the write lock; another thread may have swapped.
        if state.settings_mtime != settings_mtime || state.env_mtime != env_mtime {
            let (snapshot, trigger_key) = build_snapshot(&self.settings_path, &self.env_path);
            info!("configuration changed on disk, snapshot swapped");
            state.snapshot = Arc::new(snapshot);
            state.trigger_key = trigger_key;
            state.settings_mtime = settings_mtime;
            state.env_mtime = env_mtime;
        }
        Arc::clone(&state.snapshot)
    }

    /// The configured trigger key name (e.g. `"alt_r"`, `"f12"`).
    pub fn trigger_key(&self) -> String {
        let _ = self.snapshot();
        self.state.read().trigger_key.clone()
    }

    pub fn settings_path(&self) -> &Path {
        &self.settings_path
    }

    /// Persist a settings file; the next `snapshot()` call picks it up.
    pub fn save_settings(&self, settings: &SettingsFile) -> std::io::Result<()> {
        if let Some(parent) = self.settings_path.parent() {
            fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(settings).map_err(std::io::Error::other)?;
        fs::write(&self.settings_path, json)
    }
}

fn mtime(path: &Path) -> Option<SystemTime> {
    fs::metadata(path).and_then(|m| m.modified()).ok()
}

fn build_snapshot(settings_path: &Path, env_path: &Path) -> (ConfigSnapshot, String) {
    let mut settings = fs::read_to_string(settings_path)
        .ok()
        .and_then(|raw| match serde_json::from_str::<SettingsFile>(&raw) {
            Ok(s) => Some(s),
            Err(e) => {
                warn!(path = %settings_path.display(), "malformed settings file: {e}");
                None
            }
        })
        .unwrap_or_default();
    settings.normalize();

    let mut creds = parse_env_file(env_path);
    for (var, slot) in [
        ("GROQ_API_KEY", &mut creds.groq),
        ("GEMINI_API_KEY", &mut creds.gemini),
        ("OPENROUTER_API_KEY", &mut creds.openrouter),
    ] {
        if let Ok(value) = std::env::var(var) {
            if !value.trim().is_empty() {
                *slot = value.trim().to_string();
            }
        }
    }

    let trigger_key = settings.trigger_key.clone();
    let snapshot = ConfigSnapshot {
        enabled_devices: settings.enabled_devices,
        preroll_seconds: settings.preroll_seconds,
        silence_threshold: settings.silence_threshold,
        sample_rate: settings.sample_rate,
        double_tap_threshold: settings.double_tap_threshold,
        toggle_mode_timeout: settings.toggle_mode_timeout,
        enabled_providers: settings.enabled_providers,
        consensus_threshold: settings.consensus_threshold,
        consensus_max_words: settings.consensus_max_words,
        groq_api_key: creds.groq,
        gemini_api_key: creds.gemini,
        openrouter_api_key: creds.openrouter,
        custom_instructions: settings.custom_instructions,
        system_prompt: settings.system_prompt,
        editing_prompt: settings.editing_prompt,
    };
    (snapshot, trigger_key)
}

fn parse_env_file(path: &Path) -> Credentials {
    let mut creds = Credentials::default();
    let Ok(raw) = fs::read_to_string(path) else {
        return creds;
    };
    for line in raw.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let Some((key, value)) = line.split_once('=') else {
            continue;
        };
        let value = value.trim().trim_matches(|c| c == '"' || c == '\'').to_string();
        match key.trim() {
            "GROQ_API_KEY" => creds.groq = value,
            "GEMINI_API_KEY" => creds.gemini = value,
            "OPENROUTER_API_KEY" => creds.openrouter = value,
            _ => {}
        }
    }
    creds
}
