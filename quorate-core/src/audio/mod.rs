//! Multi-device audio capture with pre-roll and silence-based chunking.
//!
//! ## Callback contract
//!
//! Every device callback funnels into [`AudioEngine::ingest`]:
//!
//! ```text
//! 1. Under the engine mutex: drop the block if shut down / unknown device.
//! 2. Not recording  → append to that device's pre-roll ring.
//! 3. Recording      → append to that device's chunk builder; on the
//!    reference device (index 0) run silence accounting and possibly emit.
//! 4. Emission: flush builders into an AudioChunk, release the mutex,
//!    invoke the sink, re-acquire, and bail out if recording stopped while
//!    the lock was released.
//! ```
//!
//! Silence is tracked on the reference device only — independent per-device
//! detection would desynchronise chunk boundaries across microphones and the
//! per-chunk fan-out depends on all tracks covering the same window.
//!
//! ## Threading
//!
//! `cpal::Stream` is `!Send` on Windows/macOS, so all streams are created and
//! dropped on one dedicated holder thread. The engine mutex is held only for
//! buffer bookkeeping; the chunk sink is always invoked with the lock
//! released.

pub mod buffer;
pub mod device;

use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, info};

use crate::error::{QuorateError, Result};
use buffer::{AudioChunk, ChunkBuilder, PrerollRing};

/// Fixed capture block size in samples (~64 ms at 16 kHz).
pub const BLOCK_SIZE: usize = 1024;

/// Blocks quieter than this (dBFS) count as silence.
pub const SILENCE_THRESHOLD_DB: f64 = -35.0;

/// Chunks shorter than this are never emitted mid-recording.
pub const MIN_CHUNK_SECONDS: f64 = 5.0;

/// How much silence to keep at the end of an emitted chunk.
pub const TRAILING_SILENCE_SECONDS: f64 = 0.5;

/// Callback receiving emitted chunks. Invoked with the engine mutex released.
pub type ChunkSink = Arc<dyn Fn(AudioChunk) + Send + Sync>;

struct DeviceState {
    name: String,
    preroll: PrerollRing,
    builder: ChunkBuilder,
}

struct EngineState {
    sample_rate: u32,
    silence_threshold_secs: f64,
    preroll_capacity: usize,
    devices: Vec<DeviceState>,
    recording: bool,
    shut_down: bool,
    silence_duration: f64,
    sink: Option<ChunkSink>,
}

/// The capture engine. Lives from process start to shutdown; sessions attach
/// and detach their chunk sinks around each recording.
pub struct AudioEngine {
    state: Arc<Mutex<EngineState>>,
    #[cfg(feature = "audio-cpal")]
    capture: Mutex<Option<CaptureHandle>>,
}

impl AudioEngine {
    pub fn new(sample_rate: u32, preroll_seconds: f64, silence_threshold_secs: f64) -> Self {
        let preroll_capacity = (preroll_seconds * sample_rate as f64).round() as usize;
        Self {
            state: Arc::new(Mutex::new(EngineState {
                sample_rate,
                silence_threshold_secs,
                preroll_capacity,
                devices: Vec::new(),
                recording: false,
                shut_down: false,
                silence_duration: 0.0,
                sink: None,
            })),
            #[cfg(feature = "audio-cpal")]
            capture: Mutex::new(None),
        }
    }

    /// Register a device by name. The first registered device is the
    /// silence-detection reference. Duplicate names are ignored.
    pub fn register_device(&self, name: &str) {
        let mut state = self.state.lock();
        if state.devices.iter().any(|d| d.name == name) {
            return;
        }
        let preroll_capacity = state.preroll_capacity;
        state.devices.push(DeviceState {
            name: name.to_string(),
            preroll: PrerollRing::new(preroll_capacity),
            builder: ChunkBuilder::new(),
        });
    }

    /// Names of the registered devices, reference device first.
    pub fn device_names(&self) -> Vec<String> {
        self.state
            .lock()
            .devices
            .iter()
            .map(|d| d.name.clone())
            .collect()
    }

    /// Install the chunk sink for the upcoming recording.
    pub fn set_sink(&self, sink: ChunkSink) {
        self.state.lock().sink = Some(sink);
    }

    /// Detach the chunk sink; no further emissions reach the old sink.
    pub fn clear_sink(&self) {
        self.state.lock().sink = None;
    }

    pub fn is_recording(&self) -> bool {
        self.state.lock().recording
    }

    /// Begin a recording: seed every chunk builder from its pre-roll (the
    /// ring keeps filling) and reset silence accounting.
    pub fn start_recording(&self) -> Result<()> {
        let mut state = self.state.lock();
        if state.shut_down {
            return Err(QuorateError::AudioStream("engine shut down".into()));
        }
        if state.recording {
            return Err(QuorateError::AlreadyRecording);
        }
        state.recording = true;
        state.silence_duration = 0.0;
        for dev in &mut state.devices {
            let seed = dev.preroll.snapshot();
            dev.builder.seed(seed);
        }
        debug!(devices = state.devices.len(), "recording started");
        Ok(())
    }

    /// Stop recording and return the final chunk.
    ///
    /// The sink is detached under the same lock, so no `on_chunk_ready`
    /// fires after this returns.
    pub fn stop_recording(&self) -> Result<AudioChunk> {
        let mut state = self.state.lock();
        if !state.recording {
            return Err(QuorateError::NotRecording);
        }
        state.recording = false;
        state.sink = None;
        state.silence_duration = 0.0;
        let chunk = flush_builders(&mut state);
        debug!(duration_secs = chunk.duration_secs(), "recording stopped");
        Ok(chunk)
    }

    /// Release all capture resources. Blocks in flight are silently dropped.
    pub fn shutdown(&self) {
        {
            let mut state = self.state.lock();
            state.shut_down = true;
            state.recording = false;
            state.sink = None;
            state.devices.clear();
        }
        #[cfg(feature = "audio-cpal")]
        {
            if let Some(handle) = self.capture.lock().take() {
                handle.stop();
            }
        }
        info!("audio engine shut down");
    }

    /// Feed one callback block from `device`. This is the device-callback
    /// body; tests drive it directly with synthetic blocks.
    pub fn ingest(&self, device: &str, block: &[f32]) {
        deliver_block(&self.state, device, block);
    }
}

fn deliver_block(state: &Arc<Mutex<EngineState>>, device: &str, block: &[f32]) {
    let mut guard = state.lock();
    if guard.shut_down {
        return;
    }
    let Some(idx) = guard.devices.iter().position(|d| d.name == device) else {
        return;
    };

    if !guard.recording {
        guard.devices[idx].preroll.push_block(block);
        return;
    }

    guard.devices[idx].builder.push_block(block);
    if idx != 0 {
        return;
    }

    // Silence accounting, reference device only.
    let sample_rate = guard.sample_rate as f64;
    if is_silent(block) {
        guard.silence_duration += block.len() as f64 / sample_rate;
        if guard.silence_duration >= guard.silence_threshold_secs {
            let chunk_secs = guard.devices[0].builder.len_samples() as f64 / sample_rate;
            if chunk_secs >= MIN_CHUNK_SECONDS {
                let excess = guard.silence_duration - TRAILING_SILENCE_SECONDS;
                if excess > 0.0 {
                    let trim = (excess * sample_rate) as usize;
                    for dev in &mut guard.devices {
                        dev.builder.trim_trailing(trim);
                    }
                }
                let chunk = flush_builders(&mut guard);
                guard.silence_duration = 0.0;
                let sink = guard.sink.clone();
                drop(guard);

                // Sink runs without the engine lock; see module docs.
                if let (Some(sink), false) = (sink, chunk.is_empty()) {
                    sink(chunk);
                }

                let guard = state.lock();
                if !guard.recording {
                    // stop_recording() won the race while the lock was free.
                    return;
                }
                return;
            }
            // Long silence but the chunk is still too short: restart the
            // accumulator and keep building.
            guard.silence_duration = 0.0;
        }
    } else {
        guard.silence_duration = 0.0;
    }
}

fn flush_builders(state: &mut EngineState) -> AudioChunk {
    let mut chunk = AudioChunk::new(state.sample_rate);
    for dev in &mut state.devices {
        chunk.push_track(dev.name.clone(), dev.builder.take());
    }
    chunk
}

/// Block-level silence test: dBFS below [`SILENCE_THRESHOLD_DB`] or true zero.
fn is_silent(block: &[f32]) -> bool {
    if block.is_empty() {
        return true;
    }
    let sum_sq: f64 = block.iter().map(|s| (*s as f64) * (*s as f64)).sum();
    let rms = (sum_sq / block.len() as f64).sqrt();
    if rms == 0.0 {
        return true;
    }
    20.0 * rms.log10() < SILENCE_THRESHOLD_DB
}

// ---------------------------------------------------------------------------
// cpal stream plumbing
// ---------------------------------------------------------------------------

#[cfg(feature = "audio-cpal")]
struct CaptureHandle {
    stop: Arc<std::sync::atomic::AtomicBool>,
    thread: std::thread::JoinHandle<()>,
}

#[cfg(feature = "audio-cpal")]
impl CaptureHandle {
    fn stop(self) {
        self.stop.store(true, std::sync::atomic::Ordering::SeqCst);
        self.thread.thread().unpark();
        let _ = self.thread.join();
    }
}

#[cfg(feature = "audio-cpal")]
impl AudioEngine {
    /// Resolve `configured` device names and open one mono f32 input stream
    /// per match at the engine sample rate.
    ///
    /// Streams are created (and later dropped) on a dedicated holder thread
    /// because `cpal::Stream` is not `Send`. Devices that fail to resolve or
    /// open are skipped with a log; the engine starts with the remainder.
    ///
    /// # Errors
    /// Returns `QuorateError::NoInputDevice` when no configured device opened.
    pub fn open_streams(&self, configured: &[String]) -> Result<Vec<String>> {
        use std::sync::atomic::{AtomicBool, Ordering};

        let sample_rate = self.state.lock().sample_rate;
        let state = Arc::clone(&self.state);
        let stop = Arc::new(AtomicBool::new(false));
        let stop_for_thread = Arc::clone(&stop);
        let configured: Vec<String> = configured.to_vec();
        let (open_tx, open_rx) = std::sync::mpsc::channel::<Vec<String>>();

        let thread = std::thread::Builder::new()
            .name("quorate-capture".into())
            .spawn(move || {
                let streams = open_all_streams(&state, &configured, sample_rate);
                let opened: Vec<String> = streams.iter().map(|(name, _)| name.clone()).collect();
                let _ = open_tx.send(opened);

                while !stop_for_thread.load(Ordering::SeqCst) {
                    std::thread::park_timeout(std::time::Duration::from_millis(250));
                }
                // Streams drop here, on the thread that created them.
                drop(streams);
            })
            .map_err(|e| QuorateError::AudioStream(e.to_string()))?;

        let opened = open_rx
            .recv()
            .map_err(|_| QuorateError::AudioStream("capture thread died during open".into()))?;

        if opened.is_empty() {
            stop.store(true, std::sync::atomic::Ordering::SeqCst);
            thread.thread().unpark();
            let _ = thread.join();
            return Err(QuorateError::NoInputDevice);
        }

        *self.capture.lock() = Some(CaptureHandle { stop, thread });
        Ok(opened)
    }
}

#[cfg(feature = "audio-cpal")]
fn open_all_streams(
    state: &Arc<Mutex<EngineState>>,
    configured: &[String],
    sample_rate: u32,
) -> Vec<(String, cpal::Stream)> {
    use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};

    let host = cpal::default_host();
    let devices: Vec<(String, cpal::Device)> = match host.input_devices() {
        Ok(iter) => iter
            .enumerate()
            .map(|(idx, d)| {
                let name = d
                    .name()
                    .unwrap_or_else(|_| format!("Input Device {}", idx + 1));
                (name, d)
            })
            .collect(),
        Err(e) => {
            tracing::warn!("failed to enumerate input devices: {e}");
            return Vec::new();
        }
    };
    let names: Vec<&str> = devices.iter().map(|(n, _)| n.as_str()).collect();

    let mut streams = Vec::new();
    for wanted in configured {
        let Some(idx) = device::resolve_device(wanted, &names) else {
            tracing::warn!(configured = wanted.as_str(), "input device not found, skipping");
            continue;
        };
        let (resolved_name, dev) = &devices[idx];

        let config = cpal::StreamConfig {
            channels: 1,
            sample_rate: cpal::SampleRate(sample_rate),
            buffer_size: cpal::BufferSize::Fixed(BLOCK_SIZE as u32),
        };

        let cb_state = Arc::clone(state);
        let cb_name = resolved_name.clone();
        let stream = dev.build_input_stream(
            &config,
            move |data: &[f32], _info| deliver_block(&cb_state, &cb_name, data),
            |err| tracing::error!("audio stream error: {err}"),
            None,
        );

        match stream {
            Ok(s) => {
                if let Err(e) = s.play() {
                    tracing::warn!(device = resolved_name.as_str(), "failed to start stream: {e}");
                    continue;
                }
                info!(device = resolved_name.as_str(), sample_rate, "input stream opened");
                // Register before storing so callbacks find their state.
                {
                    let mut guard = state.lock();
                    if !guard.devices.iter().any(|d| &d.name == resolved_name) {
                        let cap = guard.preroll_capacity;
                        guard.devices.push(DeviceState {
                            name: resolved_name.clone(),
                            preroll: PrerollRing::new(cap),
                            builder: ChunkBuilder::new(),
                        });
                    }
                }
                streams.push((resolved_name.clone(), s));
            }
            Err(e) => {
                tracing::warn!(device = resolved_name.as_str(), "failed to open stream: {e}");
            }
        }
    }
    streams
}
