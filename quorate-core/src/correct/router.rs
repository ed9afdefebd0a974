//! Correction backend routing.
//!
//! Short inputs go to the fastest available backend, long inputs to the
//! highest-quality one. Backends that keep failing are excluded with an
//! exponential backoff so a degraded endpoint stops burning latency budget
//! across sessions.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::config::ConfigSnapshot;

/// Inputs below this word count route by latency instead of quality.
pub const SHORT_INPUT_WORD_THRESHOLD: usize = 20;

/// Failures before a backend starts backing off.
const BACKOFF_AFTER_FAILURES: u32 = 3;

/// Backoff ceiling.
const MAX_BACKOFF: Duration = Duration::from_secs(300);

pub const GROQ_MODEL: &str = "openai/gpt-oss-120b";
pub const GEMINI_MODEL: &str = "gemini-3-flash-preview";
pub const OPENROUTER_MODEL: &str = "google/gemini-2.5-flash";

/// A correction backend's routing characteristics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackendDescriptor {
    pub name: &'static str,
    /// Estimated round-trip for routing decisions.
    pub nominal_latency_ms: u64,
    /// Lower = better quality.
    pub priority: u8,
    pub model: &'static str,
}

/// The fixed backend table.
pub const BACKENDS: &[BackendDescriptor] = &[
    BackendDescriptor {
        name: "groq",
        nominal_latency_ms: 400,
        priority: 2,
        model: GROQ_MODEL,
    },
    BackendDescriptor {
        name: "gemini",
        nominal_latency_ms: 700,
        priority: 1,
        model: GEMINI_MODEL,
    },
    BackendDescriptor {
        name: "openrouter",
        nominal_latency_ms: 900,
        priority: 3,
        model: OPENROUTER_MODEL,
    },
];

/// The credential a backend needs, read from the session snapshot.
pub fn credential<'a>(snapshot: &'a ConfigSnapshot, backend: &str) -> &'a str {
    match backend {
        "groq" => &snapshot.groq_api_key,
        "gemini" => &snapshot.gemini_api_key,
        "openrouter" => &snapshot.openrouter_api_key,
        _ => "",
    }
}

#[derive(Debug, Default, Clone)]
struct Health {
    consecutive_failures: u32,
    backoff_until: Option<Instant>,
}

/// Process-wide backend health, shared across sessions. Created once at
/// startup and injected wherever routing happens.
#[derive(Default)]
pub struct HealthTracker {
    state: Mutex<HashMap<String, Health>>,
}

impl HealthTracker {
    pub fn new() -> Self {
        Self::default()
    }

    fn in_backoff(&self, name: &str, now: Instant) -> bool {
        self.state
            .lock()
            .get(name)
            .and_then(|h| h.backoff_until)
            .map(|until| now < until)
            .unwrap_or(false)
    }

    pub fn record_failure(&self, name: &str) {
        self.record_failure_at(name, Instant::now());
    }

    pub fn record_failure_at(&self, name: &str, now: Instant) {
        let mut state = self.state.lock();
        let health = state.entry(name.to_string()).or_default();
        health.consecutive_failures += 1;
        if health.consecutive_failures >= BACKOFF_AFTER_FAILURES {
            let exp = health.consecutive_failures.min(30);
            let backoff = Duration::from_secs(1 << exp).min(MAX_BACKOFF);
            health.backoff_until = Some(now + backoff);
            warn!(
                backend = name,
                failures = health.consecutive_failures,
                backoff_secs = backoff.as_secs(),
                "correction backend backing off"
            );
        }
    }

    pub fn record_success(&self, name: &str) {
        let mut state = self.state.lock();
        let health = state.entry(name.to_string()).or_default();
        health.consecutive_failures = 0;
        health.backoff_until = None;
    }
}

/// Picks a backend from credentials, input size, and health.
pub struct CorrectionRouter {
    health: Arc<HealthTracker>,
}

impl CorrectionRouter {
    pub fn new(health: Arc<HealthTracker>) -> Self {
        Self { health }
    }

    pub fn health(&self) -> &Arc<HealthTracker> {
        &self.health
    }

    fn available_at(&self, snapshot: &ConfigSnapshot, now: Instant) -> Vec<BackendDescriptor> {
        BACKENDS
            .iter()
            .filter(|b| !credential(snapshot, b.name).trim().is_empty())
            .filter(|b| !self.health.in_backoff(b.name, now))
            .copied()
            .collect()
    }

    /// Best backend for an input of `word_count` words, or `None` when no
    /// credentialed backend is currently healthy.
    pub fn select(&self, snapshot: &ConfigSnapshot, word_count: usize) -> Option<BackendDescriptor> {
        self.select_at(snapshot, word_count, Instant::now())
    }

    pub fn select_at(
        &self,
        snapshot: &ConfigSnapshot,
        word_count: usize,
        now: Instant,
    ) -> Option<BackendDescriptor> {
        let available = self.available_at(snapshot, now);
        if available.is_empty() {
            return None;
        }
        let chosen = if word_count < SHORT_INPUT_WORD_THRESHOLD {
            available.iter().min_by_key(|b| b.nominal_latency_ms)
        } else {
            available.iter().min_by_key(|b| b.priority)
        }
        .copied();
        if let Some(b) = chosen {
            debug!(backend = b.name, word_count, "correction backend selected");
        }
        chosen
    }

    /// Next-best backend by priority, excluding the one that just failed.
    pub fn fallback(&self, snapshot: &ConfigSnapshot, exclude: &str) -> Option<BackendDescriptor> {
        self.fallback_at(snapshot, exclude, Instant::now())
    }

    pub fn fallback_at(
        &self,
        snapshot: &ConfigSnapshot,
        exclude: &str,
        now: Instant,
    ) -> Option<BackendDescriptor> {
        self.available_at(snapshot, now)
            .into_iter()
            .filter(|b| b.name != exclude)
            .min_by_key(|b| b.priority)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot(groq: &str, gemini: &str, openrouter: &str) -> ConfigSnapshot {
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
            groq_api_key: groq.into(),
            gemini_api_key: gemini.into(),
            openrouter_api_key: openrouter.into(),
            custom_instructions: String::new(),
            system_prompt: String::new(),
            editing_prompt: String::new(),
        }
    }

    #[test]
    fn short_input_picks_lowest_latency() {
        let router = CorrectionRouter::new(Arc::new(HealthTracker::new()));
        let snap = snapshot("gk", "mk", "ok");
        let backend = router.select(&snap, 5).unwrap();
        assert_eq!(backend.name, "groq");
    }

    #[test]
    fn long_input_picks_best_priority() {
        let router = CorrectionRouter::new(Arc::new(HealthTracker::new()));
        let snap = snapshot("gk", "mk", "ok");
        let backend = router.select(&snap, 40).unwrap();
        assert_eq!(backend.name, "gemini");
    }

    #[test]
    fn threshold_boundary_routes_by_quality_at_exactly_twenty() {
        let router = CorrectionRouter::new(Arc::new(HealthTracker::new()));
        let snap = snapshot("gk", "mk", "ok");
        assert_eq!(router.select(&snap, 19).unwrap().name, "groq");
        assert_eq!(router.select(&snap, 20).unwrap().name, "gemini");
    }

    #[test]
    fn missing_credentials_exclude_backends() {
        let router = CorrectionRouter::new(Arc::new(HealthTracker::new()));
        let snap = snapshot("", "mk", "");
        assert_eq!(router.select(&snap, 5).unwrap().name, "gemini");
        assert!(router.select(&snapshot("", "", ""), 5).is_none());
    }

    #[test]
    fn three_failures_back_off_for_eight_seconds() {
        let health = Arc::new(HealthTracker::new());
        let router = CorrectionRouter::new(Arc::clone(&health));
        let snap = snapshot("gk", "mk", "ok");
        let now = Instant::now();

        health.record_failure_at("groq", now);
        health.record_failure_at("groq", now);
        assert_eq!(router.select_at(&snap, 5, now).unwrap().name, "groq");

        health.record_failure_at("groq", now);
        // 2^3 = 8 s backoff; groq is skipped despite the lowest latency.
        assert_eq!(router.select_at(&snap, 5, now).unwrap().name, "gemini");
        assert_eq!(
            router
                .select_at(&snap, 5, now + Duration::from_secs(7))
                .unwrap()
                .name,
            "gemini"
        );
        // Backoff expired.
        assert_eq!(
            router
                .select_at(&snap, 5, now + Duration::from_secs(9))
                .unwrap()
                .name,
            "groq"
        );
    }

    #[test]
    fn success_resets_failure_count() {
        let health = Arc::new(HealthTracker::new());
        let router = CorrectionRouter::new(Arc::clone(&health));
        let snap = snapshot("gk", "", "");
        let now = Instant::now();

        for _ in 0..3 {
            health.record_failure_at("groq", now);
        }
        assert!(router.select_at(&snap, 5, now).is_none());

        health.record_success("groq");
        assert_eq!(router.select_at(&snap, 5, now).unwrap().name, "groq");
    }

    #[test]
    fn backoff_is_capped() {
        let health = HealthTracker::new();
        let now = Instant::now();
        for _ in 0..20 {
            health.record_failure_at("groq", now);
        }
        let until = health
            .state
            .lock()
            .get("groq")
            .and_then(|h| h.backoff_until)
            .unwrap();
        assert!(until <= now + MAX_BACKOFF);
    }

    #[test]
    fn fallback_excludes_failed_backend_and_uses_priority() {
        let router = CorrectionRouter::new(Arc::new(HealthTracker::new()));
        let snap = snapshot("gk", "mk", "ok");
        let fallback = router.fallback(&snap, "gemini").unwrap();
        assert_eq!(fallback.name, "groq");
        assert!(router.fallback(&snapshot("", "mk", ""), "gemini").is_none());
    }
}
