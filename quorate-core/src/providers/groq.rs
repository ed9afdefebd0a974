//! Groq Whisper cloud transcription.

use std::sync::OnceLock;
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use super::{wav_bytes, TranscriptionProvider, TranscriptionResult};
use crate::error::{QuorateError, Result};

const ENDPOINT: &str = "https://api.groq.com/openai/v1/audio/transcriptions";
const DEFAULT_MODEL: &str = "whisper-large-v3";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(20);

/// Whisper via Groq's OpenAI-compatible audio endpoint. The WAV payload is
/// built in memory and uploaded as multipart form data.
pub struct GroqWhisperProvider {
    api_key: String,
    model: String,
    sample_rate: u32,
    client: OnceLock<reqwest::blocking::Client>,
}

impl GroqWhisperProvider {
    pub fn new(api_key: String, sample_rate: u32) -> Self {
        Self {
            api_key,
            model: DEFAULT_MODEL.to_string(),
            sample_rate,
            client: OnceLock::new(),
        }
    }

    fn request(&self, samples: &[f32]) -> anyhow::Result<String> {
        let client = self
            .client
            .get()
            .ok_or_else(|| anyhow::anyhow!("provider not initialized"))?;

        let wav = wav_bytes(samples, self.sample_rate);
        let part = reqwest::blocking::multipart::Part::bytes(wav)
            .file_name("audio.wav")
            .mime_str("audio/wav")?;
        let form = reqwest::blocking::multipart::Form::new()
            .text("model", self.model.clone())
            .text("temperature", "0")
            .part("file", part);

        let response = client
            .post(ENDPOINT)
            .bearer_auth(&self.api_key)
            .multipart(form)
            .send()?;

        let status = response.status();
        if !status.is_success() {
            anyhow::bail!("transcription request failed with status {status}");
        }
        let body: serde_json::Value = response.json()?;
        Ok(body["text"].as_str().unwrap_or_default().to_string())
    }
}

impl TranscriptionProvider for GroqWhisperProvider {
    fn name(&self) -> &str {
        "groq"
    }

    fn initialize(&self) -> Result<()> {
        if self.api_key.trim().is_empty() {
            return Err(QuorateError::Config("groq API key missing".into()));
        }
        if self.client.get().is_none() {
            let client = reqwest::blocking::Client::builder()
                .timeout(REQUEST_TIMEOUT)
                .build()
                .map_err(|e| QuorateError::Config(format!("http client: {e}")))?;
            let _ = self.client.set(client);
        }
        Ok(())
    }

    fn transcribe(&self, samples: &[f32], device: &str) -> TranscriptionResult {
        let start = Instant::now();
        match self.request(samples) {
            Ok(text) => {
                let latency_ms = start.elapsed().as_millis() as u64;
                debug!(device, latency_ms, "groq transcription complete");
                TranscriptionResult {
                    text: text.trim().to_string(),
                    provider: self.name().to_string(),
                    device: device.to_string(),
                    latency_ms,
                    confidence: None,
                }
            }
            Err(e) => {
                let latency_ms = start.elapsed().as_millis() as u64;
                warn!(device, "groq transcription failed: {e}");
                TranscriptionResult::empty(self.name(), device, latency_ms)
            }
        }
    }

    fn shutdown(&self) {}
}
