//! Gemini audio transcription via OpenRouter.
//!
//! Gemini is multimodal: the WAV goes base64-encoded inside an
//! OpenAI-compatible chat body with an `input_audio` content part.

use std::sync::OnceLock;
use std::time::{Duration, Instant};

use base64::Engine as _;
use serde_json::json;
use tracing::{debug, warn};

use super::{wav_bytes, TranscriptionProvider, TranscriptionResult};
use crate::error::{QuorateError, Result};

const ENDPOINT: &str = "https://openrouter.ai/api/v1/chat/completions";
const DEFAULT_MODEL: &str = "google/gemini-2.5-flash";
const TRANSCRIBE_PROMPT: &str = "Transcribe this speech exactly as spoken.";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(20);

pub struct GeminiProvider {
    api_key: String,
    model: String,
    sample_rate: u32,
    client: OnceLock<reqwest::blocking::Client>,
}

impl GeminiProvider {
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

        let audio = base64::engine::general_purpose::STANDARD
            .encode(wav_bytes(samples, self.sample_rate));
        let body = json!({
            "model": self.model,
            "messages": [{
                "role": "user",
                "content": [
                    {"type": "text", "text": TRANSCRIBE_PROMPT},
                    {"type": "input_audio", "input_audio": {"data": audio, "format": "wav"}},
                ],
            }],
            "temperature": 0.0,
            "max_tokens": 4000,
        });

        let response = client
            .post(ENDPOINT)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()?;

        let status = response.status();
        if !status.is_success() {
            anyhow::bail!("transcription request failed with status {status}");
        }
        let body: serde_json::Value = response.json()?;
        Ok(body["choices"][0]["message"]["content"]
            .as_str()
            .unwrap_or_default()
            .to_string())
    }
}

impl TranscriptionProvider for GeminiProvider {
    fn name(&self) -> &str {
        "gemini"
    }

    fn initialize(&self) -> Result<()> {
        if self.api_key.trim().is_empty() {
            return Err(QuorateError::Config("openrouter API key missing".into()));
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
                debug!(device, latency_ms, "gemini transcription complete");
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
                warn!(device, "gemini transcription failed: {e}");
                TranscriptionResult::empty(self.name(), device, latency_ms)
            }
        }
    }

    fn shutdown(&self) {}
}
