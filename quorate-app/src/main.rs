//! Quorate headless host.
//!
//! Wires the core engine to the OS: a global key listener drives the input
//! controller, the audio engine owns the microphone streams, and sessions
//! deliver text through the enigo/arboard output sink.

mod inject;
mod keyboard;
mod probe;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use quorate_core::{
    audio::device,
    providers::{gemini::GeminiProvider, groq::GroqWhisperProvider, DEFAULT_WORKERS},
    session::SessionDeps,
    AudioEngine, BackendRegistry, ConfigStore, ContextProbe, CorrectionClient, CorrectionRouter,
    HealthTracker, InputController, InputHooks, MetricsWriter, OutputWriter, ProviderRegistry,
    SessionManager, TranscriptionHistory,
};
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

fn data_dir() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("quorate")
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let dir = data_dir();
    let store = Arc::new(ConfigStore::load(&dir));
    let snapshot = store.snapshot();
    info!(config = %dir.display(), "configuration loaded");

    // ── Audio ────────────────────────────────────────────────────────────
    let engine = Arc::new(AudioEngine::new(
        snapshot.sample_rate,
        snapshot.preroll_seconds,
        snapshot.silence_threshold,
    ));

    let configured_devices = if snapshot.enabled_devices.is_empty() {
        let available = device::list_input_devices();
        let fallback = available
            .iter()
            .find(|d| d.is_default)
            .or_else(|| available.first())
            .map(|d| d.name.clone());
        match fallback {
            Some(name) => {
                info!(device = name.as_str(), "no devices configured, using default input");
                vec![name]
            }
            None => Vec::new(),
        }
    } else {
        snapshot.enabled_devices.clone()
    };

    let opened = engine
        .open_streams(&configured_devices)
        .context("no usable input device")?;
    info!(devices = ?opened, "audio capture running");

    // ── Transcription providers ──────────────────────────────────────────
    let registry = Arc::new(ProviderRegistry::new(DEFAULT_WORKERS));
    for name in &snapshot.enabled_providers {
        match name.as_str() {
            "groq" => registry.register(Arc::new(GroqWhisperProvider::new(
                snapshot.groq_api_key.clone(),
                snapshot.sample_rate,
            ))),
            "gemini" => registry.register(Arc::new(GeminiProvider::new(
                snapshot.openrouter_api_key.clone(),
                snapshot.sample_rate,
            ))),
            other => warn!(provider = other, "unknown transcription provider in settings"),
        }
    }
    if registry.is_empty() {
        warn!("no transcription providers initialized — check API keys in .env");
    }

    // ── Session collaborators ────────────────────────────────────────────
    let output = Arc::new(OutputWriter::new(Box::new(inject::DesktopSink::spawn()?)));
    let probe: Arc<dyn ContextProbe> = Arc::new(probe::DesktopProbe);
    let corrector = Arc::new(CorrectionClient::new(
        CorrectionRouter::new(Arc::new(HealthTracker::new())),
        BackendRegistry::http_defaults(),
    ));
    let metrics = match MetricsWriter::open(&dir.join("metrics.jsonl")) {
        Ok(writer) => Some(Arc::new(writer)),
        Err(e) => {
            warn!("metrics log unavailable: {e}");
            None
        }
    };

    let manager = SessionManager::new(
        Arc::clone(&store),
        SessionDeps {
            registry: Arc::clone(&registry),
            output: Arc::clone(&output),
            probe,
            corrector,
            history: Arc::new(TranscriptionHistory::new()),
            metrics,
        },
    );

    // ── Recording intents ────────────────────────────────────────────────
    let start_engine = Arc::clone(&engine);
    let start_manager = Arc::clone(&manager);
    let on_start = Arc::new(move || {
        let Some(session) = start_manager.start_session() else {
            return; // busy cue already played
        };
        start_engine.set_sink(session.chunk_sink());
        if let Err(e) = start_engine.start_recording() {
            error!("failed to start recording: {e}");
        }
    });

    let stop_engine = Arc::clone(&engine);
    let stop_manager = Arc::clone(&manager);
    let on_stop = Arc::new(move || {
        let final_chunk = match stop_engine.stop_recording() {
            Ok(chunk) => chunk,
            Err(e) => {
                debug!("stop without active recording: {e}");
                return;
            }
        };
        match stop_manager.active_session() {
            Some(session) => session.finalize(final_chunk),
            None => warn!("recording stopped with no active session"),
        }
    });

    let reset_engine = Arc::clone(&engine);
    let reset_manager = Arc::clone(&manager);
    let reset_output = Arc::clone(&output);
    let on_emergency_reset = Arc::new(move || {
        let _ = reset_engine.stop_recording();
        reset_manager.force_clear();
        reset_output.notify("Quorate", "Emergency reset");
        info!("emergency reset complete");
    });

    // ── Input ────────────────────────────────────────────────────────────
    let controller = Arc::new(InputController::new(
        Duration::from_secs_f64(snapshot.double_tap_threshold),
        Duration::from_secs_f64(snapshot.toggle_mode_timeout),
        InputHooks {
            on_start,
            on_stop,
            on_emergency_reset,
        },
    ));
    let trigger = keyboard::trigger_key_from_name(&store.trigger_key());
    keyboard::spawn_listener(controller, trigger);
    info!(trigger = ?trigger, "listening for the trigger key");

    // ── Run until killed ─────────────────────────────────────────────────
    let mut events = manager.subscribe();
    loop {
        match events.blocking_recv() {
            Ok(event) => debug!(
                session_id = event.session_id.as_str(),
                phase = ?event.phase,
                detail = event.detail.as_deref().unwrap_or(""),
                "session event"
            ),
            Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(skipped, "session event stream lagged");
            }
            Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
        }
    }

    engine.shutdown();
    registry.shutdown();
    Ok(())
}
