//! HTTP chat backends for the correction stage.
//!
//! Groq and OpenRouter speak the OpenAI chat-completions dialect (including
//! SSE streaming); Gemini uses its own `generateContent` shape and returns in
//! one piece, which streaming callers receive as a single delta.
//!
//! A mid-stream error aborts the read and returns whatever accumulated; the
//! session treats an empty return as backend failure.

use std::collections::HashMap;
use std::io::{BufRead, BufReader};
use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use tracing::{debug, warn};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(15);
const MAX_COMPLETION_TOKENS: u32 = 2000;
const TEMPERATURE: f64 = 0.3;

/// One correction call.
pub struct ChatRequest<'a> {
    pub system_prompt: &'a str,
    pub user_prompt: &'a str,
    pub api_key: &'a str,
    pub model: &'a str,
}

/// A language-model backend. Returns the final text; empty means failure.
/// With `on_delta`, fragments arrive in order, none empty, none after the
/// call returns, and their concatenation equals the returned string.
pub trait ChatBackend: Send + Sync {
    fn name(&self) -> &str;
    fn complete(&self, req: &ChatRequest<'_>, on_delta: Option<&dyn Fn(&str)>) -> String;
}

/// Name → backend lookup used by the correction client. The default set is
/// HTTP; tests swap in scripted fakes.
pub struct BackendRegistry {
    map: HashMap<String, Arc<dyn ChatBackend>>,
}

impl BackendRegistry {
    pub fn empty() -> Self {
        Self {
            map: HashMap::new(),
        }
    }

    /// The production set: groq + openrouter (OpenAI dialect) and gemini.
    pub fn http_defaults() -> Self {
        Self::empty()
            .with_backend(Arc::new(OpenAiCompatBackend::new(
                "groq",
                "https://api.groq.com/openai/v1/chat/completions",
            )))
            .with_backend(Arc::new(OpenAiCompatBackend::new(
                "openrouter",
                "https://openrouter.ai/api/v1/chat/completions",
            )))
            .with_backend(Arc::new(GeminiChatBackend::new()))
    }

    pub fn with_backend(mut self, backend: Arc<dyn ChatBackend>) -> Self {
        self.map.insert(backend.name().to_string(), backend);
        self
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn ChatBackend>> {
        self.map.get(name).cloned()
    }
}

fn blocking_client() -> Option<reqwest::blocking::Client> {
    match reqwest::blocking::Client::builder()
        .timeout(REQUEST_TIMEOUT)
        .build()
    {
        Ok(c) => Some(c),
        Err(e) => {
            warn!("failed to build http client: {e}");
            None
        }
    }
}

/// Strip the SSE framing from one line: `data: {...}` → payload.
/// Comments, blank lines, and other fields yield `None`.
pub(crate) fn sse_data_payload(line: &str) -> Option<&str> {
    let line = line.trim();
    if line.is_empty() || line.starts_with(':') {
        return None;
    }
    line.strip_prefix("data:").map(str::trim_start)
}

/// Pull the streamed delta fragment out of one chat-completion chunk.
pub(crate) fn stream_delta(chunk: &Value) -> Option<String> {
    chunk["choices"][0]["delta"]["content"]
        .as_str()
        .filter(|s| !s.is_empty())
        .map(ToOwned::to_owned)
}

/// Groq / OpenRouter style chat completions.
pub struct OpenAiCompatBackend {
    name: &'static str,
    endpoint: &'static str,
    client: Option<reqwest::blocking::Client>,
}

impl OpenAiCompatBackend {
    pub fn new(name: &'static str, endpoint: &'static str) -> Self {
        Self {
            name,
            endpoint,
            client: blocking_client(),
        }
    }

    fn call(&self, req: &ChatRequest<'_>, on_delta: Option<&dyn Fn(&str)>) -> anyhow::Result<String> {
        let client = self
            .client
            .as_ref()
            .ok_or_else(|| anyhow::anyhow!("no http client"))?;
        let stream = on_delta.is_some();
        let body = json!({
            "model": req.model,
            "messages": [
                {"role": "system", "content": req.system_prompt},
                {"role": "user", "content": req.user_prompt},
            ],
            "temperature": TEMPERATURE,
            "max_tokens": MAX_COMPLETION_TOKENS,
            "stream": stream,
        });

        let response = client
            .post(self.endpoint)
            .bearer_auth(req.api_key)
            .json(&body)
            .send()?;
        let status = response.status();
        if !status.is_success() {
            anyhow::bail!("chat request failed with status {status}");
        }

        if let Some(on_delta) = on_delta {
            let mut collected = String::new();
            let reader = BufReader::new(response);
            for line in reader.lines() {
                let line = match line {
                    Ok(l) => l,
                    Err(e) => {
                        // Stream broke mid-response; keep what we have.
                        warn!(backend = self.name, "stream read error: {e}");
                        break;
                    }
                };
                let Some(payload) = sse_data_payload(&line) else {
                    continue;
                };
                if payload == "[DONE]" {
                    break;
                }
                let Ok(chunk) = serde_json::from_str::<Value>(payload) else {
                    continue;
                };
                if chunk.get("error").is_some() {
                    warn!(backend = self.name, "stream error payload: {chunk}");
                    break;
                }
                if let Some(fragment) = stream_delta(&chunk) {
                    on_delta(&fragment);
                    collected.push_str(&fragment);
                }
            }
            Ok(collected)
        } else {
            let body: Value = response.json()?;
            Ok(body["choices"][0]["message"]["content"]
                .as_str()
                .unwrap_or_default()
                .to_string())
        }
    }
}

impl ChatBackend for OpenAiCompatBackend {
    fn name(&self) -> &str {
        self.name
    }

    fn complete(&self, req: &ChatRequest<'_>, on_delta: Option<&dyn Fn(&str)>) -> String {
        match self.call(req, on_delta) {
            Ok(text) => {
                debug!(backend = self.name, chars = text.len(), "chat completion done");
                text
            }
            Err(e) => {
                warn!(backend = self.name, "chat completion failed: {e}");
                String::new()
            }
        }
    }
}

/// Direct Gemini `generateContent`. No token streaming; callers that asked
/// for deltas get the whole answer as one fragment.
pub struct GeminiChatBackend {
    client: Option<reqwest::blocking::Client>,
}

impl GeminiChatBackend {
    pub fn new() -> Self {
        Self {
            client: blocking_client(),
        }
    }

    fn call(&self, req: &ChatRequest<'_>) -> anyhow::Result<String> {
        let client = self
            .client
            .as_ref()
            .ok_or_else(|| anyhow::anyhow!("no http client"))?;
        let url = format!(
            "https://generativelanguage.googleapis.com/v1beta/models/{}:generateContent?key={}",
            req.model, req.api_key
        );
        let body = json!({
            "contents": [
                {"role": "user", "parts": [{"text": format!("{}\n\n{}", req.system_prompt, req.user_prompt)}]}
            ],
            "generationConfig": {
                "temperature": TEMPERATURE,
                "maxOutputTokens": MAX_COMPLETION_TOKENS,
                "thinkingConfig": {"thinkingBudget": 0},
            },
        });

        let response = client.post(&url).json(&body).send()?;
        let status = response.status();
        if !status.is_success() {
            anyhow::bail!("chat request failed with status {status}");
        }
        let body: Value = response.json()?;
        Ok(body["candidates"][0]["content"]["parts"][0]["text"]
            .as_str()
            .unwrap_or_default()
            .to_string())
    }
}

impl Default for GeminiChatBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl ChatBackend for GeminiChatBackend {
    fn name(&self) -> &str {
        "gemini"
    }

    fn complete(&self, req: &ChatRequest<'_>, on_delta: Option<&dyn Fn(&str)>) -> String {
        match self.call(req) {
            Ok(text) => {
                if let (Some(on_delta), false) = (on_delta, text.is_empty()) {
                    on_delta(&text);
                }
                text
            }
            Err(e) => {
                warn!(backend = "gemini", "chat completion failed: {e}");
                String::new()
            }
        }
    }
}
