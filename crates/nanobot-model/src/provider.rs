// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::pin::Pin;

use async_trait::async_trait;
use futures::Stream;

use crate::{stream::StreamEvent, ChatMessage, ChatResponse};

pub type StreamEventStream = Pin<Box<dyn Stream<Item = StreamEvent> + Send>>;

/// Parameters common to every completion call.
#[derive(Debug, Clone)]
pub struct ChatOptions {
    pub model: String,
    pub max_tokens: u32,
    pub temperature: f32,
}

#[async_trait]
pub trait ChatProvider: Send + Sync {
    /// Model used when the caller does not specify one.
    fn default_model(&self) -> &str;

    /// Send a completion request.
    ///
    /// Failures the driver can absorb come back as a response with
    /// `finish_reason == "error"`; `Err` is reserved for failures the caller
    /// should classify itself (the turn runner retries transient ones and
    /// re-raises fatal ones).
    async fn chat(
        &self,
        messages: &[ChatMessage],
        tools: Option<&[serde_json::Value]>,
        opts: &ChatOptions,
    ) -> anyhow::Result<ChatResponse>;

    /// Optional streaming contract: text deltas followed by a final `Done`
    /// carrying the assembled response.
    ///
    /// The default implementation performs a regular `chat` call and replays
    /// it as a two-event stream, so callers can treat every provider as
    /// streaming-capable.
    async fn stream_chat(
        &self,
        messages: &[ChatMessage],
        tools: Option<&[serde_json::Value]>,
        opts: &ChatOptions,
    ) -> anyhow::Result<StreamEventStream> {
        let response = self.chat(messages, tools, opts).await?;
        let mut events = Vec::new();
        if let Some(text) = response.content.clone() {
            if !text.is_empty() {
                events.push(StreamEvent::TextDelta(text));
            }
        }
        events.push(StreamEvent::Done(response));
        Ok(Box::pin(futures::stream::iter(events)))
    }

    /// True when the driver implements native streaming (rather than the
    /// replay fallback above). Reported by the health endpoint diagnostics.
    fn supports_streaming(&self) -> bool {
        false
    }
}
