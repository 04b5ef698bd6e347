// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Deterministic providers for tests. No network access.

use std::sync::Mutex;

use async_trait::async_trait;

use crate::{
    provider::{ChatOptions, ChatProvider},
    ChatMessage, ChatResponse, ToolCallRequest,
};

/// A pre-scripted provider. Each `chat` call pops the next response from the
/// front of the queue; when the queue is empty the `fallback` response is
/// returned. Requests are recorded so tests can inspect what was sent.
pub struct ScriptedProvider {
    responses: Mutex<Vec<ScriptedResult>>,
    fallback: ChatResponse,
    /// Every (messages, had_tools) pair seen by `chat`, in call order.
    pub requests: Mutex<Vec<(Vec<ChatMessage>, bool)>>,
}

enum ScriptedResult {
    Ok(ChatResponse),
    Err(String),
}

impl ScriptedProvider {
    pub fn new(responses: Vec<ChatResponse>) -> Self {
        Self {
            responses: Mutex::new(responses.into_iter().map(ScriptedResult::Ok).collect()),
            fallback: text_response("[script exhausted]"),
            requests: Mutex::new(Vec::new()),
        }
    }

    /// Provider that always returns the same text reply.
    pub fn always_text(reply: impl Into<String>) -> Self {
        let mut p = Self::new(vec![]);
        p.fallback = text_response(reply);
        p
    }

    /// Queue an `Err` (exception-path) result at the given position.
    pub fn push_error(&self, message: impl Into<String>) {
        self.responses
            .lock()
            .unwrap()
            .push(ScriptedResult::Err(message.into()));
    }

    pub fn calls_made(&self) -> usize {
        self.requests.lock().unwrap().len()
    }
}

#[async_trait]
impl ChatProvider for ScriptedProvider {
    fn default_model(&self) -> &str {
        "scripted-mock"
    }

    async fn chat(
        &self,
        messages: &[ChatMessage],
        tools: Option<&[serde_json::Value]>,
        _opts: &ChatOptions,
    ) -> anyhow::Result<ChatResponse> {
        self.requests
            .lock()
            .unwrap()
            .push((messages.to_vec(), tools.is_some_and(|t| !t.is_empty())));
        let mut queue = self.responses.lock().unwrap();
        if queue.is_empty() {
            return Ok(self.fallback.clone());
        }
        match queue.remove(0) {
            ScriptedResult::Ok(r) => Ok(r),
            ScriptedResult::Err(e) => Err(anyhow::anyhow!(e)),
        }
    }
}

/// Build a plain text response with `finish_reason = "stop"`.
pub fn text_response(text: impl Into<String>) -> ChatResponse {
    ChatResponse {
        content: Some(text.into()),
        finish_reason: "stop".into(),
        ..ChatResponse::default()
    }
}

/// Build a response requesting a single tool call.
pub fn tool_call_response(
    id: impl Into<String>,
    name: impl Into<String>,
    arguments: serde_json::Value,
) -> ChatResponse {
    let arguments = match arguments {
        serde_json::Value::Object(map) => map,
        _ => serde_json::Map::new(),
    };
    ChatResponse {
        content: None,
        tool_calls: vec![ToolCallRequest {
            id: id.into(),
            name: name.into(),
            arguments,
        }],
        finish_reason: "tool_calls".into(),
        ..ChatResponse::default()
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
