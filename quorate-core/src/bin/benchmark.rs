//! Synthetic dictation benchmark.
//!
//! Drives the capture engine with generated speech/silence patterns and
//! simulated-latency providers, then reports per-chunk fan-out latency and
//! consensus rate. No devices, no network — this measures the engine and
//! dispatch machinery, not any real backend.

fn main() {
    if let Err(e) = run() {
        eprintln!("benchmark failed: {e}");
        std::process::exit(1);
    }
}

fn run() -> Result<(), String> {
    use std::sync::Arc;
    use std::time::{Duration, Instant};

    use parking_lot::Mutex;
    use serde::Serialize;

    use quorate_core::audio::buffer::AudioChunk;
    use quorate_core::consensus::check_consensus;
    use quorate_core::error::Result as CoreResult;
    use quorate_core::{AudioEngine, ProviderRegistry, TranscriptionProvider, TranscriptionResult};

    const RATE: u32 = 16_000;
    const BLOCK: usize = 1024;

    #[derive(Debug)]
    struct Args {
        utterances: usize,
        devices: usize,
        providers: usize,
        latency_ms: u64,
        consensus_threshold: usize,
        output: Option<std::path::PathBuf>,
    }

    #[derive(Debug, Clone, Serialize)]
    struct ChunkResult {
        chunk_num: usize,
        jobs: usize,
        results: usize,
        fanout_ms: f64,
        consensus: bool,
    }

    #[derive(Debug, Serialize)]
    struct Summary {
        utterances: usize,
        devices: usize,
        providers: usize,
        simulated_latency_ms: u64,
        chunks: usize,
        p50_fanout_ms: f64,
        p95_fanout_ms: f64,
        avg_fanout_ms: f64,
        consensus_rate: f64,
        cases: Vec<ChunkResult>,
    }

    fn parse_args() -> Result<Args, String> {
        let mut args = Args {
            utterances: 4,
            devices: 2,
            providers: 2,
            latency_ms: 25,
            consensus_threshold: 2,
            output: None,
        };

        let mut it = std::env::args().skip(1);
        while let Some(arg) = it.next() {
            let mut take = |name: &str| {
                it.next().ok_or_else(|| format!("missing value for {name}"))
            };
            match arg.as_str() {
                "--utterances" => {
                    args.utterances = take("--utterances")?
                        .parse::<usize>()
                        .map_err(|_| "invalid value for --utterances".to_string())?
                        .clamp(1, 64);
                }
                "--devices" => {
                    args.devices = take("--devices")?
                        .parse::<usize>()
                        .map_err(|_| "invalid value for --devices".to_string())?
                        .clamp(1, 8);
                }
                "--providers" => {
                    args.providers = take("--providers")?
                        .parse::<usize>()
                        .map_err(|_| "invalid value for --providers".to_string())?
                        .clamp(1, 8);
                }
                "--latency-ms" => {
                    args.latency_ms = take("--latency-ms")?
                        .parse::<u64>()
                        .map_err(|_| "invalid value for --latency-ms".to_string())?
                        .min(2_000);
                }
                "--threshold" => {
                    args.consensus_threshold = take("--threshold")?
                        .parse::<usize>()
                        .map_err(|_| "invalid value for --threshold".to_string())?
                        .max(1);
                }
                "--output" => {
                    args.output = Some(std::path::PathBuf::from(take("--output")?));
                }
                "--help" | "-h" => {
                    println!(
                        "Usage: cargo run -p quorate-core --bin benchmark -- \\\n  [--utterances <n>] [--devices <n>] [--providers <n>] \\\n  [--latency-ms <n>] [--threshold <n>] [--output <file.json>]"
                    );
                    std::process::exit(0);
                }
                other => return Err(format!("unknown argument: {other}")),
            }
        }
        Ok(args)
    }

    struct SimulatedProvider {
        name: String,
        latency: Duration,
    }

    impl TranscriptionProvider for SimulatedProvider {
        fn name(&self) -> &str {
            &self.name
        }

        fn initialize(&self) -> CoreResult<()> {
            Ok(())
        }

        fn transcribe(&self, samples: &[f32], device: &str) -> TranscriptionResult {
            std::thread::sleep(self.latency);
            TranscriptionResult {
                text: format!("utterance of {} samples", samples.len() / BLOCK * BLOCK),
                provider: self.name.clone(),
                device: device.to_string(),
                latency_ms: self.latency.as_millis() as u64,
                confidence: Some(0.9),
            }
        }

        fn shutdown(&self) {}
    }

    fn percentile(sorted: &[f64], p: f64) -> f64 {
        if sorted.is_empty() {
            return 0.0;
        }
        let idx = ((sorted.len() as f64 - 1.0) * p).round() as usize;
        sorted[idx.min(sorted.len() - 1)]
    }

    let args = parse_args()?;

    let engine = AudioEngine::new(RATE, 1.0, 2.0);
    let device_names: Vec<String> = (0..args.devices).map(|i| format!("mic-{i}")).collect();
    for name in &device_names {
        engine.register_device(name);
    }

    let registry = ProviderRegistry::new((args.devices * args.providers).max(4));
    for i in 0..args.providers {
        registry.register(Arc::new(SimulatedProvider {
            name: format!("sim-{i}"),
            latency: Duration::from_millis(args.latency_ms),
        }));
    }

    // Collect emitted chunks through the engine's sink, then append each
    // recording's final chunk, mirroring a session's intake.
    let chunks: Arc<Mutex<Vec<AudioChunk>>> = Arc::new(Mutex::new(Vec::new()));

    let feed = |seconds: f64, amplitude: f32| {
        let total = (seconds * RATE as f64) as usize;
        let mut fed = 0;
        while fed < total {
            let n = BLOCK.min(total - fed);
            let block = vec![amplitude; n];
            for name in &device_names {
                engine.ingest(name, &block);
            }
            fed += n;
        }
    };

    for utterance in 0..args.utterances {
        engine.set_sink({
            let sink_chunks = Arc::clone(&chunks);
            Arc::new(move |chunk| sink_chunks.lock().push(chunk))
        });
        engine
            .start_recording()
            .map_err(|e| format!("start_recording: {e}"))?;
        // Long utterances cross the silence boundary and emit mid-stream.
        let speech_secs = 3.0 + (utterance % 2) as f64 * 4.0;
        feed(speech_secs, 0.5);
        feed(2.5, 0.0);
        let final_chunk = engine
            .stop_recording()
            .map_err(|e| format!("stop_recording: {e}"))?;
        if !final_chunk.is_empty() {
            chunks.lock().push(final_chunk);
        }
    }

    let collected = std::mem::take(&mut *chunks.lock());
    let mut cases = Vec::with_capacity(collected.len());
    for (i, chunk) in collected.iter().enumerate() {
        let started = Instant::now();
        let dispatch = registry.dispatch_chunk(chunk);
        let deadline = started + Duration::from_secs(30);
        let mut results = Vec::with_capacity(dispatch.expected());
        while results.len() < dispatch.expected() {
            match dispatch.receiver().recv_deadline(deadline) {
                Ok(r) => results.push(r),
                Err(_) => {
                    dispatch.cancel();
                    break;
                }
            }
        }
        let fanout_ms = started.elapsed().as_secs_f64() * 1_000.0;
        let consensus = check_consensus(&results, args.consensus_threshold, 10).is_some();
        cases.push(ChunkResult {
            chunk_num: i + 1,
            jobs: dispatch.expected(),
            results: results.len(),
            fanout_ms,
            consensus,
        });
    }
    registry.shutdown();
    engine.shutdown();

    let mut sorted: Vec<f64> = cases.iter().map(|c| c.fanout_ms).collect();
    sorted.sort_by(|a, b| a.total_cmp(b));
    let avg = if sorted.is_empty() {
        0.0
    } else {
        sorted.iter().sum::<f64>() / sorted.len() as f64
    };
    let consensus_rate = if cases.is_empty() {
        0.0
    } else {
        cases.iter().filter(|c| c.consensus).count() as f64 / cases.len() as f64
    };

    let summary = Summary {
        utterances: args.utterances,
        devices: args.devices,
        providers: args.providers,
        simulated_latency_ms: args.latency_ms,
        chunks: cases.len(),
        p50_fanout_ms: percentile(&sorted, 0.50),
        p95_fanout_ms: percentile(&sorted, 0.95),
        avg_fanout_ms: avg,
        consensus_rate,
        cases,
    };

    println!(
        "chunks={} p50={:.1}ms p95={:.1}ms avg={:.1}ms consensus={:.0}%",
        summary.chunks,
        summary.p50_fanout_ms,
        summary.p95_fanout_ms,
        summary.avg_fanout_ms,
        summary.consensus_rate * 100.0
    );

    if let Some(path) = &args.output {
        let json = serde_json::to_string_pretty(&summary)
            .map_err(|e| format!("serialize summary: {e}"))?;
        std::fs::write(path, json).map_err(|e| format!("write {}: {e}", path.display()))?;
        println!("summary written to {}", path.display());
    }

    Ok(())
}
