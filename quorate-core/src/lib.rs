//! # quorate-core
//!
//! Push-to-talk dictation engine: multi-microphone capture fanned out to
//! several speech-to-text providers, reconciled by consensus, corrected by a
//! language model when consensus fails, and delivered at the cursor.
//!
//! ## Architecture
//!
//! ```text
//! Trigger key → InputController → SessionManager → Session
//!                                                     │ chunk sink
//! Microphones → AudioEngine (pre-roll + silence chunking)
//!                                                     │ AudioChunk
//!                               ProviderRegistry fan-out (device × provider)
//!                                                     │ TranscriptionResults
//!                               consensus ── hit ──► OutputWriter (typed)
//!                                   │ miss
//!                               CorrectionRouter → CorrectionClient
//!                                                     │ streamed deltas
//!                                               OutputWriter (typed / clipboard)
//! ```
//!
//! Device callbacks only touch buffers under the engine mutex; everything
//! that can block (transcription, correction, typing) runs on worker or
//! background threads.

#![forbid(unsafe_code)]
#![warn(clippy::all)]

pub mod audio;
pub mod config;
pub mod consensus;
pub mod context;
pub mod correct;
pub mod error;
pub mod history;
pub mod input;
pub mod metrics;
pub mod output;
pub mod providers;
pub mod session;

// Convenience re-exports for downstream crates
pub use audio::{buffer::AudioChunk, AudioEngine};
pub use config::{ConfigSnapshot, ConfigStore};
pub use context::{AppContext, ContextProbe, RigorLevel};
pub use correct::{
    http::BackendRegistry,
    router::{CorrectionRouter, HealthTracker},
    CorrectionClient,
};
pub use error::QuorateError;
pub use history::TranscriptionHistory;
pub use input::{ControlKey, InputController, InputHooks};
pub use metrics::MetricsWriter;
pub use output::{OutputMethod, OutputSink, OutputWriter};
pub use providers::{ProviderRegistry, TranscriptionProvider, TranscriptionResult};
pub use session::{Session, SessionEvent, SessionManager, SessionPhase};
