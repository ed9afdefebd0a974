//! Speech-to-text provider contract and parallel dispatch.
//!
//! Providers never raise into the dispatch path: a failed call returns an
//! empty `text` with its measured latency so the session's bookkeeping stays
//! uniform. The registry owns a fixed worker pool; per-chunk dispatch shares
//! one cooperative cancel flag so a consensus short-circuit can stop queued
//! jobs before they run. Jobs already running are not interrupted — their
//! results land in a dropped receiver and are discarded.

pub mod gemini;
pub mod groq;

use std::io::Cursor;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, Sender};
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::audio::buffer::AudioChunk;
use crate::error::Result;

/// Default transcription worker pool size; sized for providers × microphones.
pub const DEFAULT_WORKERS: usize = 12;

/// One provider's transcription of one device's audio. Immutable once made.
#[derive(Debug, Clone)]
pub struct TranscriptionResult {
    pub text: String,
    pub provider: String,
    pub device: String,
    pub latency_ms: u64,
    pub confidence: Option<f32>,
}

impl TranscriptionResult {
    /// The uniform failure shape: empty text, measured latency.
    pub fn empty(provider: &str, device: &str, latency_ms: u64) -> Self {
        Self {
            text: String::new(),
            provider: provider.to_string(),
            device: device.to_string(),
            latency_ms,
            confidence: None,
        }
    }
}

/// Contract for speech-to-text backends.
///
/// `transcribe` must be thread-safe from the caller's perspective; backends
/// with single-threaded inference serialize internally. It must return within
/// its own deadline and never panic — failures become empty results.
pub trait TranscriptionProvider: Send + Sync {
    fn name(&self) -> &str;

    /// Load weights or build a client. Idempotent. A failing provider is
    /// excluded from dispatch without affecting its peers.
    fn initialize(&self) -> Result<()>;

    /// Transcribe mono f32 audio at the session sample rate.
    fn transcribe(&self, samples: &[f32], device: &str) -> TranscriptionResult;

    /// Release resources. Idempotent.
    fn shutdown(&self);
}

struct Job {
    provider: Arc<dyn TranscriptionProvider>,
    samples: Arc<[f32]>,
    device: String,
    cancelled: Arc<AtomicBool>,
    result_tx: Sender<TranscriptionResult>,
}

/// In-flight fan-out for one chunk.
pub struct ChunkDispatch {
    rx: Receiver<TranscriptionResult>,
    cancelled: Arc<AtomicBool>,
    expected: usize,
}

impl ChunkDispatch {
    /// Number of jobs submitted (≤ devices × providers).
    pub fn expected(&self) -> usize {
        self.expected
    }

    pub fn receiver(&self) -> &Receiver<TranscriptionResult> {
        &self.rx
    }

    /// Cooperatively cancel jobs that have not started. Running calls finish
    /// but their results are discarded once this dispatch is dropped.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }
}

/// Registry of initialized providers plus the shared transcription pool.
pub struct ProviderRegistry {
    providers: Mutex<Vec<Arc<dyn TranscriptionProvider>>>,
    job_tx: Mutex<Option<Sender<Job>>>,
    workers: Mutex<Vec<std::thread::JoinHandle<()>>>,
}

impl ProviderRegistry {
    pub fn new(worker_count: usize) -> Self {
        let (job_tx, job_rx) = crossbeam_channel::unbounded::<Job>();
        let workers = (0..worker_count.max(1))
            .map(|i| {
                let rx = job_rx.clone();
                std::thread::Builder::new()
                    .name(format!("quorate-stt-{i}"))
                    .spawn(move || worker_loop(rx))
                    .expect("spawn transcription worker")
            })
            .collect();
        Self {
            providers: Mutex::new(Vec::new()),
            job_tx: Mutex::new(Some(job_tx)),
            workers: Mutex::new(workers),
        }
    }

    /// Initialize and register a provider. Initialization failure excludes
    /// the provider but is not an error for the registry.
    pub fn register(&self, provider: Arc<dyn TranscriptionProvider>) {
        match provider.initialize() {
            Ok(()) => {
                info!(provider = provider.name(), "transcription provider ready");
                self.providers.lock().push(provider);
            }
            Err(e) => {
                warn!(provider = provider.name(), "provider initialization failed: {e}");
            }
        }
    }

    pub fn provider_names(&self) -> Vec<String> {
        self.providers
            .lock()
            .iter()
            .map(|p| p.name().to_string())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.providers.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.providers.lock().is_empty()
    }

    /// Submit one job per `(device, provider)` pair with non-empty audio.
    pub fn dispatch_chunk(&self, chunk: &AudioChunk) -> ChunkDispatch {
        let providers = self.providers.lock().clone();
        let (result_tx, rx) = crossbeam_channel::unbounded();
        let cancelled = Arc::new(AtomicBool::new(false));
        let mut expected = 0;

        let job_tx = self.job_tx.lock().clone();
        if let Some(job_tx) = job_tx {
            for (device, samples) in chunk.tracks() {
                if samples.is_empty() {
                    continue;
                }
                let shared: Arc<[f32]> = Arc::from(samples);
                for provider in &providers {
                    let job = Job {
                        provider: Arc::clone(provider),
                        samples: Arc::clone(&shared),
                        device: device.to_string(),
                        cancelled: Arc::clone(&cancelled),
                        result_tx: result_tx.clone(),
                    };
                    if job_tx.send(job).is_ok() {
                        expected += 1;
                    }
                }
            }
        }

        ChunkDispatch {
            rx,
            cancelled,
            expected,
        }
    }

    /// Run every provider on one device's audio, collecting whatever arrives
    /// before `timeout`. Stragglers are cancelled cooperatively.
    pub fn transcribe_all(
        &self,
        samples: &[f32],
        device: &str,
        sample_rate: u32,
        timeout: Duration,
    ) -> Vec<TranscriptionResult> {
        let mut chunk = AudioChunk::new(sample_rate);
        chunk.push_track(device, samples.to_vec());
        let dispatch = self.dispatch_chunk(&chunk);

        let deadline = Instant::now() + timeout;
        let mut results = Vec::with_capacity(dispatch.expected());
        while results.len() < dispatch.expected() {
            match dispatch.receiver().recv_deadline(deadline) {
                Ok(r) => results.push(r),
                Err(_) => {
                    warn!(device, collected = results.len(), "transcribe_all timed out");
                    dispatch.cancel();
                    break;
                }
            }
        }
        results
    }

    /// Shut down all providers and stop the worker pool. Queued jobs drain
    /// before the workers exit.
    pub fn shutdown(&self) {
        let providers = std::mem::take(&mut *self.providers.lock());
        for provider in &providers {
            provider.shutdown();
        }
        // Dropping the sole sender closes the channel and ends the workers.
        self.job_tx.lock().take();
        for handle in std::mem::take(&mut *self.workers.lock()) {
            let _ = handle.join();
        }
        debug!("provider registry shut down");
    }
}

fn worker_loop(rx: Receiver<Job>) {
    while let Ok(job) = rx.recv() {
        if job.cancelled.load(Ordering::SeqCst) {
            continue;
        }
        let result = job.provider.transcribe(&job.samples, &job.device);
        // A dropped receiver means the chunk moved on; discard silently.
        let _ = job.result_tx.send(result);
    }
}

/// Encode mono f32 samples as 16-bit PCM WAV for upload.
pub fn wav_bytes(samples: &[f32], sample_rate: u32) -> Vec<u8> {
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };
    let mut cursor = Cursor::new(Vec::new());
    {
        let mut writer = hound::WavWriter::new(&mut cursor, spec).expect("in-memory wav writer");
        for &s in samples {
            let v = (s.clamp(-1.0, 1.0) * 32767.0) as i16;
            writer.write_sample(v).expect("in-memory wav sample");
        }
        writer.finalize().expect("in-memory wav finalize");
    }
    cursor.into_inner()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    struct FakeProvider {
        name: String,
        text: String,
        delay: Duration,
        calls: Arc<AtomicUsize>,
        fail_init: bool,
    }

    impl FakeProvider {
        fn fast(name: &str, text: &str) -> Arc<Self> {
            Arc::new(Self {
                name: name.into(),
                text: text.into(),
                delay: Duration::ZERO,
                calls: Arc::new(AtomicUsize::new(0)),
                fail_init: false,
            })
        }
    }

    impl TranscriptionProvider for FakeProvider {
        fn name(&self) -> &str {
            &self.name
        }

        fn initialize(&self) -> Result<()> {
            if self.fail_init {
                return Err(crate::error::QuorateError::Config("no key".into()));
            }
            Ok(())
        }

        fn transcribe(&self, _samples: &[f32], device: &str) -> TranscriptionResult {
            self.calls.fetch_add(1, Ordering::SeqCst);
            std::thread::sleep(self.delay);
            TranscriptionResult {
                text: self.text.clone(),
                provider: self.name.clone(),
                device: device.to_string(),
                latency_ms: self.delay.as_millis() as u64,
                confidence: None,
            }
        }

        fn shutdown(&self) {}
    }

    fn chunk_with(devices: &[(&str, usize)]) -> AudioChunk {
        let mut chunk = AudioChunk::new(16_000);
        for (name, samples) in devices {
            chunk.push_track(*name, vec![0.1; *samples]);
        }
        chunk
    }

    #[test]
    fn dispatch_counts_device_provider_pairs() {
        let registry = ProviderRegistry::new(4);
        registry.register(FakeProvider::fast("pa", "hello"));
        registry.register(FakeProvider::fast("pb", "hello"));

        let chunk = chunk_with(&[("d1", 160), ("d2", 160), ("empty", 0)]);
        let dispatch = registry.dispatch_chunk(&chunk);
        // Two non-empty devices × two providers.
        assert_eq!(dispatch.expected(), 4);

        let mut got = 0;
        while got < 4 {
            dispatch
                .receiver()
                .recv_timeout(Duration::from_secs(1))
                .unwrap();
            got += 1;
        }
    }

    #[test]
    fn failed_initialization_excludes_only_that_provider() {
        let registry = ProviderRegistry::new(2);
        registry.register(Arc::new(FakeProvider {
            name: "broken".into(),
            text: String::new(),
            delay: Duration::ZERO,
            calls: Arc::new(AtomicUsize::new(0)),
            fail_init: true,
        }));
        registry.register(FakeProvider::fast("ok", "fine"));
        assert_eq!(registry.provider_names(), vec!["ok".to_string()]);
    }

    #[test]
    fn cancel_skips_jobs_that_have_not_started() {
        // One worker so queued jobs wait behind the slow one.
        let registry = ProviderRegistry::new(1);
        let slow = Arc::new(FakeProvider {
            name: "slow".into(),
            text: "slow".into(),
            delay: Duration::from_millis(120),
            calls: Arc::new(AtomicUsize::new(0)),
            fail_init: false,
        });
        let counted = Arc::new(FakeProvider {
            name: "counted".into(),
            text: "later".into(),
            delay: Duration::ZERO,
            calls: Arc::new(AtomicUsize::new(0)),
            fail_init: false,
        });
        let counted_calls = Arc::clone(&counted.calls);
        registry.register(slow);
        registry.register(counted);

        let chunk = chunk_with(&[("d1", 160)]);
        let dispatch = registry.dispatch_chunk(&chunk);
        assert_eq!(dispatch.expected(), 2);

        // Cancel while the first job is still sleeping on the only worker.
        std::thread::sleep(Duration::from_millis(20));
        dispatch.cancel();

        // The slow in-flight job still completes and reports.
        let first = dispatch
            .receiver()
            .recv_timeout(Duration::from_secs(1))
            .unwrap();
        assert_eq!(first.provider, "slow");

        // The queued job was skipped before running.
        std::thread::sleep(Duration::from_millis(60));
        assert_eq!(counted_calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn transcribe_all_collects_all_results() {
        let registry = ProviderRegistry::new(4);
        registry.register(FakeProvider::fast("pa", "alpha"));
        registry.register(FakeProvider::fast("pb", "beta"));

        let results =
            registry.transcribe_all(&[0.1; 320], "desk", 16_000, Duration::from_secs(1));
        assert_eq!(results.len(), 2);
        assert!(results.iter().all(|r| r.device == "desk"));
    }

    #[test]
    fn wav_bytes_has_riff_header_and_length() {
        let bytes = wav_bytes(&[0.0, 0.5, -0.5, 1.0], 16_000);
        assert_eq!(&bytes[0..4], b"RIFF");
        assert_eq!(&bytes[8..12], b"WAVE");
        // 44-byte canonical header + 4 samples × 2 bytes.
        assert_eq!(bytes.len(), 44 + 8);
    }
}
