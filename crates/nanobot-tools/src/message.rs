// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Tool that sends a message to a chat channel via the outbound bus.
//!
//! The orchestrator sets the routing context before each turn; the
//! `sent_in_turn` flag tells it to suppress the default outbound when the
//! model already replied through this tool.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::{json, Value};

use nanobot_bus::{MessageBus, OutboundMessage};

use crate::details::{details_with_op, OP_MESSAGE};
use crate::tool::{JsonMap, Tool, ToolCapability, ToolExecutionResult};

#[derive(Debug, Clone, Default)]
struct RoutingContext {
    channel: String,
    chat_id: String,
    message_id: Option<String>,
}

pub struct MessageTool {
    bus: Arc<MessageBus>,
    context: Mutex<RoutingContext>,
    sent_in_turn: AtomicBool,
}

impl MessageTool {
    pub fn new(bus: Arc<MessageBus>) -> Self {
        Self {
            bus,
            context: Mutex::new(RoutingContext::default()),
            sent_in_turn: AtomicBool::new(false),
        }
    }

    /// Update routing for the conversation being processed.
    pub fn set_context(&self, channel: &str, chat_id: &str, message_id: Option<String>) {
        let mut ctx = self.context.lock().unwrap();
        ctx.channel = channel.to_string();
        ctx.chat_id = chat_id.to_string();
        ctx.message_id = message_id;
    }

    /// Reset the per-turn reply flag; called at the start of each turn.
    pub fn start_turn(&self) {
        self.sent_in_turn.store(false, Ordering::SeqCst);
    }

    /// Whether the model sent at least one reply during the current turn.
    pub fn sent_in_turn(&self) -> bool {
        self.sent_in_turn.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Tool for MessageTool {
    fn name(&self) -> &str {
        "message"
    }
    fn description(&self) -> &str {
        "Send a message to the current chat channel. Use only when you need to reply \
         before finishing the turn; plain responses are delivered automatically."
    }
    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "content": {"type": "string", "description": "The message text to send"},
                "chat_id": {"type": "string",
                            "description": "Optional chat override; defaults to the current chat"},
            },
            "required": ["content"],
        })
    }
    fn capability(&self) -> ToolCapability {
        ToolCapability::Messaging
    }

    async fn execute(&self, params: &JsonMap) -> anyhow::Result<ToolExecutionResult> {
        let content = params.get("content").and_then(Value::as_str).unwrap_or("");
        let ctx = self.context.lock().unwrap().clone();
        if ctx.channel.is_empty() || ctx.chat_id.is_empty() {
            return Ok(ToolExecutionResult::err(
                "Error: no routing context set for the message tool",
            ));
        }
        let chat_id = params
            .get("chat_id")
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
            .unwrap_or(&ctx.chat_id)
            .to_string();

        self.bus
            .publish_outbound(OutboundMessage::new(&ctx.channel, &chat_id, content));
        self.sent_in_turn.store(true, Ordering::SeqCst);

        let mut details = details_with_op(
            OP_MESSAGE,
            &[
                ("channel", json!(ctx.channel)),
                ("chat_id", json!(chat_id)),
                ("sent", json!(true)),
            ],
        );
        if let Some(message_id) = &ctx.message_id {
            details.insert("message_id".into(), json!(message_id));
        }
        Ok(ToolExecutionResult::ok_with_details("Message sent.", details))
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
