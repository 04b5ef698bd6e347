// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Provider-agnostic stream events and the chunk-to-response assembler.

use serde_json::Value;

use crate::{ChatResponse, ToolCallRequest, Usage};

/// One event in a streamed completion.
#[derive(Debug, Clone)]
pub enum StreamEvent {
    /// A text fragment from the model.
    TextDelta(String),
    /// The stream finished; carries the fully assembled response.
    Done(ChatResponse),
}

/// Accumulates OpenAI-style streaming chunks into a single [`ChatResponse`].
///
/// Tool-call deltas arrive interleaved and partially keyed: the first chunk
/// of a call carries `id`/`name`, later chunks only an `index` plus argument
/// fragments. Buffers are keyed by id, falling back to index, so fragments
/// land on the right call regardless of ordering.
#[derive(Debug, Default)]
pub struct StreamAssembler {
    content: String,
    reasoning: String,
    finish_reason: Option<String>,
    usage: Option<Usage>,
    // (key, id, name, argument buffer) in first-seen order
    tool_buffers: Vec<(String, String, String, String)>,
}

impl StreamAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one parsed chunk (the JSON object of an SSE `data:` line).
    /// Returns the text delta, if the chunk carried one.
    pub fn push_chunk(&mut self, chunk: &Value) -> Option<String> {
        if let Some(usage) = chunk.get("usage").filter(|u| !u.is_null()) {
            self.usage = Some(Usage {
                prompt_tokens: usage["prompt_tokens"].as_u64().unwrap_or(0),
                completion_tokens: usage["completion_tokens"].as_u64().unwrap_or(0),
                total_tokens: usage["total_tokens"].as_u64().unwrap_or(0),
            });
        }

        let choice = chunk.get("choices").and_then(|c| c.get(0))?;
        if let Some(fr) = choice.get("finish_reason").and_then(Value::as_str) {
            if !fr.is_empty() {
                self.finish_reason = Some(fr.to_string());
            }
        }

        let delta = choice.get("delta")?;
        if let Some(r) = delta.get("reasoning_content").and_then(Value::as_str) {
            self.reasoning.push_str(r);
        }
        self.accumulate_tool_deltas(delta);

        let text = delta.get("content").and_then(Value::as_str)?;
        if text.is_empty() {
            return None;
        }
        self.content.push_str(text);
        Some(text.to_string())
    }

    fn accumulate_tool_deltas(&mut self, delta: &Value) {
        let Some(calls) = delta.get("tool_calls").and_then(Value::as_array) else {
            return;
        };
        for (seq, tc) in calls.iter().enumerate() {
            let id = tc.get("id").and_then(Value::as_str).unwrap_or("");
            let index = tc.get("index").and_then(Value::as_u64);
            let key = if !id.is_empty() {
                id.to_string()
            } else if let Some(i) = index {
                format!("idx_{i}")
            } else {
                format!("seq_{seq}")
            };

            let buf = match self.tool_buffers.iter_mut().find(|(k, ..)| *k == key) {
                Some(b) => b,
                None => {
                    self.tool_buffers
                        .push((key.clone(), key.clone(), String::new(), String::new()));
                    self.tool_buffers.last_mut().unwrap()
                }
            };
            if !id.is_empty() {
                buf.1 = id.to_string();
            }
            if let Some(fun) = tc.get("function") {
                if let Some(name) = fun.get("name").and_then(Value::as_str) {
                    if !name.is_empty() {
                        buf.2 = name.to_string();
                    }
                }
                if let Some(args) = fun.get("arguments").and_then(Value::as_str) {
                    buf.3.push_str(args);
                }
            }
        }
    }

    /// Finalize into a response. Calls with an empty name cannot be
    /// dispatched and are dropped.
    pub fn finish(self) -> ChatResponse {
        let mut tool_calls = Vec::new();
        for (i, (_, id, name, args)) in self.tool_buffers.into_iter().enumerate() {
            if name.is_empty() {
                continue;
            }
            let arguments = parse_lenient_arguments(&args);
            let id = if id.is_empty() { format!("call_{i}") } else { id };
            tool_calls.push(ToolCallRequest {
                id,
                name,
                arguments,
            });
        }
        let finish_reason = match self.finish_reason {
            Some(fr) => fr,
            None if !tool_calls.is_empty() => "tool_calls".into(),
            None => "stop".into(),
        };
        ChatResponse {
            content: if self.content.is_empty() {
                None
            } else {
                Some(self.content)
            },
            tool_calls,
            finish_reason,
            usage: self.usage,
            reasoning_content: if self.reasoning.is_empty() {
                None
            } else {
                Some(self.reasoning)
            },
        }
    }
}

/// Parse tool-call arguments leniently: invalid or non-object JSON becomes
/// an empty object so one malformed call cannot sink the whole turn.
pub fn parse_lenient_arguments(raw: &str) -> serde_json::Map<String, Value> {
    if raw.trim().is_empty() {
        return serde_json::Map::new();
    }
    match serde_json::from_str::<Value>(raw) {
        Ok(Value::Object(map)) => map,
        _ => serde_json::Map::new(),
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
