// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Tool that hands a task to the subagent manager.
//!
//! The manager lives in the core crate; this tool talks to it through the
//! [`SpawnHandler`] trait so the tools crate stays free of that dependency.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::details::{details_with_op, OP_SPAWN};
use crate::tool::{JsonMap, Tool, ToolCapability, ToolExecutionResult};

/// Implemented by the subagent manager.
#[async_trait]
pub trait SpawnHandler: Send + Sync {
    /// Start a background task; the returned string is shown to the model.
    async fn spawn(
        &self,
        task: &str,
        label: Option<&str>,
        origin_channel: &str,
        origin_chat_id: &str,
        session_key: Option<&str>,
    ) -> String;
}

#[derive(Debug, Clone, Default)]
struct SpawnContext {
    channel: String,
    chat_id: String,
}

pub struct SpawnTool {
    handler: Arc<dyn SpawnHandler>,
    context: Mutex<SpawnContext>,
}

impl SpawnTool {
    pub fn new(handler: Arc<dyn SpawnHandler>) -> Self {
        Self {
            handler,
            context: Mutex::new(SpawnContext::default()),
        }
    }

    pub fn set_context(&self, channel: &str, chat_id: &str) {
        let mut ctx = self.context.lock().unwrap();
        ctx.channel = channel.to_string();
        ctx.chat_id = chat_id.to_string();
    }
}

#[async_trait]
impl Tool for SpawnTool {
    fn name(&self) -> &str {
        "spawn"
    }
    fn description(&self) -> &str {
        "Spawn a background subagent to work on a task. You will be notified when it completes."
    }
    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "task": {"type": "string", "description": "Task description for the subagent"},
                "label": {"type": "string", "description": "Optional short label for the task"},
            },
            "required": ["task"],
        })
    }
    fn capability(&self) -> ToolCapability {
        ToolCapability::Subagents
    }

    async fn execute(&self, params: &JsonMap) -> anyhow::Result<ToolExecutionResult> {
        let task = params.get("task").and_then(Value::as_str).unwrap_or("");
        let label = params.get("label").and_then(Value::as_str);
        let ctx = self.context.lock().unwrap().clone();
        let (channel, chat_id) = if ctx.channel.is_empty() {
            ("cli".to_string(), "direct".to_string())
        } else {
            (ctx.channel.clone(), ctx.chat_id.clone())
        };
        let session_key = format!("{channel}:{chat_id}");

        let text = self
            .handler
            .spawn(task, label, &channel, &chat_id, Some(&session_key))
            .await;

        let mut details = details_with_op(
            OP_SPAWN,
            &[
                ("origin_channel", json!(channel)),
                ("origin_chat_id", json!(chat_id)),
                ("task_len", json!(task.len())),
            ],
        );
        if let Some(label) = label {
            details.insert("label".into(), json!(label));
        }
        let is_error = text.starts_with("Cannot spawn");
        Ok(ToolExecutionResult {
            text,
            details: Some(details),
            is_error,
        })
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    struct RecordingHandler {
        calls: Mutex<Vec<(String, Option<String>, String, String)>>,
        reply: String,
    }

    #[async_trait]
    impl SpawnHandler for RecordingHandler {
        async fn spawn(
            &self,
            task: &str,
            label: Option<&str>,
            origin_channel: &str,
            origin_chat_id: &str,
            _session_key: Option<&str>,
        ) -> String {
            self.calls.lock().unwrap().push((
                task.to_string(),
                label.map(str::to_string),
                origin_channel.to_string(),
                origin_chat_id.to_string(),
            ));
            self.reply.clone()
        }
    }

    #[tokio::test]
    async fn spawns_with_routing_context() {
        let handler = Arc::new(RecordingHandler {
            calls: Mutex::new(Vec::new()),
            reply: "Subagent [label] started (id: abc).".into(),
        });
        let tool = SpawnTool::new(handler.clone());
        tool.set_context("telegram", "42");

        let mut params = JsonMap::new();
        params.insert("task".into(), json!("research rust crates"));
        params.insert("label".into(), json!("research"));
        let result = tool.execute(&params).await.unwrap();
        assert!(!result.is_error);

        let calls = handler.calls.lock().unwrap();
        assert_eq!(calls[0].0, "research rust crates");
        assert_eq!(calls[0].1.as_deref(), Some("research"));
        assert_eq!(calls[0].2, "telegram");
        assert_eq!(calls[0].3, "42");

        let details = result.details.unwrap();
        assert_eq!(details["op"], json!("spawn"));
        assert_eq!(details["task_len"], json!(20));
        assert_eq!(details["label"], json!("research"));
    }

    #[tokio::test]
    async fn refusal_reply_is_an_error_result() {
        let handler = Arc::new(RecordingHandler {
            calls: Mutex::new(Vec::new()),
            reply: "Cannot spawn subagent: limit of 5 concurrent subagents reached. Wait for one to finish.".into(),
        });
        let tool = SpawnTool::new(handler);
        let mut params = JsonMap::new();
        params.insert("task".into(), json!("x"));
        let result = tool.execute(&params).await.unwrap();
        assert!(result.is_error);
    }
}
