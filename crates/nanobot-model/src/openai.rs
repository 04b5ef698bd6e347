// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! OpenAI-compatible chat-completions driver.
//!
//! One driver covers every endpoint that speaks the standard
//! `/chat/completions` wire format (OpenRouter, OpenAI, local servers,
//! gateways). Resilience is built in: a per-request timeout plus a hard
//! safety-net timeout, transport retries, and a process-wide circuit
//! breaker that short-circuits calls to an error response while open.

use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures::StreamExt;
use serde_json::{json, Value};
use tracing::{debug, error, warn};

use crate::{
    errors::{mask_secret, redact_secret},
    provider::{ChatOptions, ChatProvider, StreamEventStream},
    stream::{parse_lenient_arguments, StreamAssembler, StreamEvent},
    ChatMessage, ChatResponse, MessageContent, Role, ToolCallRequest, Usage,
};

/// Timeout / retry / breaker knobs, mirrored from the provider config.
#[derive(Debug, Clone)]
pub struct Resilience {
    pub timeout: Duration,
    pub max_retries: u32,
    pub circuit_breaker_threshold: u32,
    pub circuit_breaker_cooldown: Duration,
}

impl Default for Resilience {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(120),
            max_retries: 2,
            circuit_breaker_threshold: 5,
            circuit_breaker_cooldown: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Default)]
struct BreakerState {
    consecutive_failures: u32,
    open_until: Option<Instant>,
}

pub struct OpenAiProvider {
    chat_url: String,
    api_key: Option<String>,
    default_model: String,
    prompt_caching: bool,
    resilience: Resilience,
    client: reqwest::Client,
    breaker: Mutex<BreakerState>,
}

impl OpenAiProvider {
    pub fn new(
        base_url: &str,
        api_key: Option<String>,
        default_model: impl Into<String>,
        prompt_caching: bool,
        resilience: Resilience,
    ) -> Self {
        if let Some(key) = &api_key {
            debug!(api_key = %mask_secret(key), "provider initialized");
        }
        Self {
            chat_url: format!("{}/chat/completions", base_url.trim_end_matches('/')),
            api_key,
            default_model: default_model.into(),
            prompt_caching,
            resilience,
            client: reqwest::Client::new(),
            breaker: Mutex::new(BreakerState::default()),
        }
    }

    /// Error text when the circuit is open, else None. A call arriving after
    /// the cooldown acts as the single half-open probe.
    fn check_breaker(&self) -> Option<String> {
        let rc = &self.resilience;
        if rc.circuit_breaker_threshold == 0 {
            return None;
        }
        let state = self.breaker.lock().unwrap();
        if state.consecutive_failures < rc.circuit_breaker_threshold {
            return None;
        }
        match state.open_until {
            Some(until) if Instant::now() < until => Some(format!(
                "Circuit breaker open: {} consecutive failures. Retry after {}s cooldown.",
                state.consecutive_failures,
                until.saturating_duration_since(Instant::now()).as_secs()
            )),
            _ => None,
        }
    }

    fn record_result(&self, success: bool) {
        let rc = &self.resilience;
        if rc.circuit_breaker_threshold == 0 {
            return;
        }
        let mut state = self.breaker.lock().unwrap();
        if success {
            state.consecutive_failures = 0;
            state.open_until = None;
        } else {
            state.consecutive_failures += 1;
            if state.consecutive_failures >= rc.circuit_breaker_threshold {
                state.open_until = Some(Instant::now() + rc.circuit_breaker_cooldown);
                warn!(
                    failures = state.consecutive_failures,
                    cooldown_secs = rc.circuit_breaker_cooldown.as_secs(),
                    "circuit breaker opened"
                );
            }
        }
    }

    /// Serialize messages to the wire, keeping only the standard keys.
    /// Internal fields (`timestamp`, `reasoning_content`, `_tool_details`)
    /// never leave the process; assistant messages always carry `content`.
    fn wire_messages(&self, messages: &[ChatMessage]) -> Vec<Value> {
        let last_user = messages.iter().rposition(|m| m.role == Role::User);
        messages
            .iter()
            .enumerate()
            .map(|(idx, m)| {
                let mut obj = json!({
                    "role": m.role,
                    "content": &m.content,
                });
                if let Some(tc) = &m.tool_calls {
                    if !tc.is_empty() {
                        obj["tool_calls"] = serde_json::to_value(tc).unwrap_or(Value::Null);
                    }
                }
                if let Some(id) = &m.tool_call_id {
                    obj["tool_call_id"] = json!(id);
                }
                if let Some(name) = &m.name {
                    obj["name"] = json!(name);
                }
                if self.prompt_caching {
                    apply_cache_control(&mut obj, m, idx, last_user);
                }
                obj
            })
            .collect()
    }

    fn request_body(
        &self,
        messages: &[ChatMessage],
        tools: Option<&[Value]>,
        opts: &ChatOptions,
        stream: bool,
    ) -> Value {
        let mut body = json!({
            "model": opts.model,
            "messages": self.wire_messages(messages),
            "max_tokens": opts.max_tokens.max(1),
            "temperature": opts.temperature,
        });
        if let Some(tools) = tools {
            if !tools.is_empty() {
                let mut tools = tools.to_vec();
                if self.prompt_caching {
                    if let Some(last) = tools.last_mut() {
                        last["cache_control"] = json!({"type": "ephemeral"});
                    }
                }
                body["tools"] = Value::Array(tools);
                body["tool_choice"] = json!("auto");
            }
        }
        if stream {
            body["stream"] = json!(true);
            body["stream_options"] = json!({"include_usage": true});
        }
        body
    }

    async fn post(&self, body: &Value) -> anyhow::Result<reqwest::Response> {
        let mut req = self
            .client
            .post(&self.chat_url)
            .timeout(self.resilience.timeout)
            .json(body);
        if let Some(key) = &self.api_key {
            req = req.bearer_auth(key);
        }
        let resp = req.send().await?;
        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            anyhow::bail!("provider returned {status}: {text}");
        }
        Ok(resp)
    }

    fn redact(&self, text: &str) -> String {
        redact_secret(text, self.api_key.as_deref())
    }

    fn parse_response(&self, body: &Value) -> ChatResponse {
        let choice = &body["choices"][0];
        let message = &choice["message"];
        let tool_calls = message["tool_calls"]
            .as_array()
            .map(|calls| {
                calls
                    .iter()
                    .enumerate()
                    .filter_map(|(idx, tc)| {
                        let name = tc["function"]["name"].as_str()?;
                        if name.is_empty() {
                            return None;
                        }
                        let raw_args = &tc["function"]["arguments"];
                        let arguments = match raw_args {
                            Value::String(s) => parse_lenient_arguments(s),
                            Value::Object(map) => map.clone(),
                            _ => serde_json::Map::new(),
                        };
                        let id = tc["id"]
                            .as_str()
                            .filter(|s| !s.is_empty())
                            .map(str::to_string)
                            .unwrap_or_else(|| format!("call_{idx}"));
                        Some(ToolCallRequest {
                            id,
                            name: name.to_string(),
                            arguments,
                        })
                    })
                    .collect()
            })
            .unwrap_or_default();

        let usage = body.get("usage").filter(|u| u.is_object()).map(|u| Usage {
            prompt_tokens: u["prompt_tokens"].as_u64().unwrap_or(0),
            completion_tokens: u["completion_tokens"].as_u64().unwrap_or(0),
            total_tokens: u["total_tokens"].as_u64().unwrap_or(0),
        });

        ChatResponse {
            content: message["content"].as_str().map(str::to_string),
            tool_calls,
            finish_reason: choice["finish_reason"]
                .as_str()
                .filter(|s| !s.is_empty())
                .unwrap_or("stop")
                .to_string(),
            usage,
            reasoning_content: message["reasoning_content"].as_str().map(str::to_string),
        }
    }
}

/// Attach `cache_control` markers: the first block of the system message
/// (the static prompt half) and the last block of the last user message.
/// The dynamic system block is deliberately left uncached.
fn apply_cache_control(obj: &mut Value, msg: &ChatMessage, idx: usize, last_user: Option<usize>) {
    let ctrl = json!({"type": "ephemeral"});
    match msg.role {
        Role::System => match &msg.content {
            MessageContent::Text(text) => {
                obj["content"] = json!([{"type": "text", "text": text, "cache_control": ctrl}]);
            }
            MessageContent::Blocks(_) => {
                if let Some(first) = obj["content"].get_mut(0) {
                    first["cache_control"] = ctrl;
                }
            }
            MessageContent::Null => {}
        },
        Role::User if Some(idx) == last_user => match &msg.content {
            MessageContent::Text(text) => {
                obj["content"] = json!([{"type": "text", "text": text, "cache_control": ctrl}]);
            }
            MessageContent::Blocks(_) => {
                if let Some(arr) = obj["content"].as_array_mut() {
                    if let Some(last) = arr.last_mut() {
                        last["cache_control"] = ctrl;
                    }
                }
            }
            MessageContent::Null => {}
        },
        _ => {}
    }
}

#[async_trait]
impl ChatProvider for OpenAiProvider {
    fn default_model(&self) -> &str {
        &self.default_model
    }

    async fn chat(
        &self,
        messages: &[ChatMessage],
        tools: Option<&[Value]>,
        opts: &ChatOptions,
    ) -> anyhow::Result<ChatResponse> {
        if let Some(cb) = self.check_breaker() {
            return Ok(ChatResponse::error(format!("Error calling LLM: {cb}")));
        }

        let body = self.request_body(messages, tools, opts, false);
        let safety = self.resilience.timeout + Duration::from_secs(30);

        let mut last_err = String::new();
        for attempt in 0..=self.resilience.max_retries {
            if attempt > 0 {
                tokio::time::sleep(Duration::from_millis(250 * attempt as u64)).await;
            }
            let result = tokio::time::timeout(safety, self.post(&body)).await;
            match result {
                Err(_) => {
                    last_err = "request timed out".into();
                }
                Ok(Err(e)) => {
                    last_err = self.redact(&e.to_string());
                }
                Ok(Ok(resp)) => match resp.json::<Value>().await {
                    Ok(json) => {
                        self.record_result(true);
                        return Ok(self.parse_response(&json));
                    }
                    Err(e) => {
                        last_err = self.redact(&e.to_string());
                    }
                },
            }
            warn!(attempt, error = %last_err, "llm call attempt failed");
        }

        self.record_result(false);
        error!(model = %opts.model, error = %last_err, "llm call failed");
        Ok(ChatResponse::error(format!("Error calling LLM: {last_err}")))
    }

    async fn stream_chat(
        &self,
        messages: &[ChatMessage],
        tools: Option<&[Value]>,
        opts: &ChatOptions,
    ) -> anyhow::Result<StreamEventStream> {
        if let Some(cb) = self.check_breaker() {
            let done = StreamEvent::Done(ChatResponse::error(format!("Error calling LLM: {cb}")));
            return Ok(Box::pin(futures::stream::iter(vec![done])));
        }

        let body = self.request_body(messages, tools, opts, true);
        let safety = self.resilience.timeout + Duration::from_secs(30);
        let started = tokio::time::timeout(safety, self.post(&body)).await;

        let resp = match started {
            Err(_) => {
                self.record_result(false);
                let done =
                    StreamEvent::Done(ChatResponse::error("Error calling LLM: request timed out"));
                return Ok(Box::pin(futures::stream::iter(vec![done])));
            }
            Ok(Err(e)) => {
                self.record_result(false);
                let msg = self.redact(&e.to_string());
                let done = StreamEvent::Done(ChatResponse::error(format!("Error calling LLM: {msg}")));
                return Ok(Box::pin(futures::stream::iter(vec![done])));
            }
            Ok(Ok(resp)) => resp,
        };

        let (tx, rx) = futures::channel::mpsc::unbounded();
        let api_key = self.api_key.clone();
        tokio::spawn(async move {
            let mut assembler = StreamAssembler::new();
            let mut bytes = resp.bytes_stream();
            let mut line_buf = String::new();
            let mut failed: Option<String> = None;

            'outer: while let Some(chunk) = bytes.next().await {
                let chunk = match chunk {
                    Ok(c) => c,
                    Err(e) => {
                        failed = Some(redact_secret(&e.to_string(), api_key.as_deref()));
                        break;
                    }
                };
                line_buf.push_str(&String::from_utf8_lossy(&chunk));
                while let Some(pos) = line_buf.find('\n') {
                    let line = line_buf[..pos].trim().to_string();
                    line_buf.drain(..=pos);
                    let Some(data) = line.strip_prefix("data:") else {
                        continue;
                    };
                    let data = data.trim();
                    if data == "[DONE]" {
                        break 'outer;
                    }
                    if let Ok(value) = serde_json::from_str::<Value>(data) {
                        if let Some(delta) = assembler.push_chunk(&value) {
                            let _ = tx.unbounded_send(StreamEvent::TextDelta(delta));
                        }
                    }
                }
            }

            let response = match failed {
                Some(err) => ChatResponse::error(format!("Error calling LLM: {err}")),
                None => assembler.finish(),
            };
            let _ = tx.unbounded_send(StreamEvent::Done(response));
        });

        self.record_result(true);
        Ok(Box::pin(rx))
    }

    fn supports_streaming(&self) -> bool {
        true
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
