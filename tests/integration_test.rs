// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Cross-crate integration: agent loop + sessions + background memory
//! consolidation, driven by the scripted mock provider.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;

use nanobot_bus::{InboundMessage, MessageBus};
use nanobot_config::Config;
use nanobot_core::AgentLoop;
use nanobot_model::mock::{text_response, tool_call_response, ScriptedProvider};
use nanobot_model::provider::{ChatOptions, ChatProvider};
use nanobot_model::{ChatMessage, ChatResponse};

fn test_config(workspace: &std::path::Path, memory_window: usize) -> Config {
    let mut config = Config::default();
    config.agent.workspace = workspace.to_path_buf();
    config.agent.memory_window = memory_window;
    config.channels.send_progress = false;
    config.tools.audit_tool_calls = false;
    config
}

async fn start_agent(config: &Config, provider: Arc<ScriptedProvider>) -> (Arc<AgentLoop>, Arc<MessageBus>) {
    let bus = Arc::new(MessageBus::new());
    let agent = Arc::new(AgentLoop::new(config, provider, false, Arc::clone(&bus)).unwrap());
    let runner = Arc::clone(&agent);
    tokio::spawn(async move { runner.run().await });
    tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    (agent, bus)
}

#[tokio::test]
async fn conversation_survives_agent_restart() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(dir.path(), 100);

    {
        let provider = Arc::new(ScriptedProvider::new(vec![text_response("nice to meet you")]));
        let (agent, bus) = start_agent(&config, provider).await;
        bus.publish_inbound(InboundMessage::new("telegram", "u", "5", "my name is Ada"));
        assert_eq!(bus.consume_outbound().await.content, "nice to meet you");
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        agent.stop();
    }

    // A fresh agent over the same workspace loads the stored history and
    // sends it back to the provider.
    let provider = Arc::new(ScriptedProvider::new(vec![text_response("you said Ada")]));
    let (agent, bus) = start_agent(&config, Arc::clone(&provider)).await;
    bus.publish_inbound(InboundMessage::new("telegram", "u", "5", "what is my name?"));
    assert_eq!(bus.consume_outbound().await.content, "you said Ada");

    let requests = provider.requests.lock().unwrap();
    let sent = &requests[0].0;
    let full_text: String = sent.iter().map(|m| m.text()).collect::<Vec<_>>().join("\n");
    assert!(full_text.contains("my name is Ada"), "history replayed");
    drop(requests);
    agent.stop();
}

/// Answers by request shape: consolidation calls (the `save_memory` tool is
/// offered) get a save_memory tool call, everything else gets plain text.
/// This keeps the background-consolidation race deterministic.
struct ShapeAwareProvider;

#[async_trait]
impl ChatProvider for ShapeAwareProvider {
    fn default_model(&self) -> &str {
        "shape-aware-mock"
    }

    async fn chat(
        &self,
        _messages: &[ChatMessage],
        tools: Option<&[serde_json::Value]>,
        _opts: &ChatOptions,
    ) -> anyhow::Result<ChatResponse> {
        let is_consolidation = tools.is_some_and(|tools| {
            tools
                .iter()
                .any(|t| t["function"]["name"] == json!("save_memory"))
        });
        if is_consolidation {
            return Ok(tool_call_response(
                "c1",
                "save_memory",
                json!({
                    "history_entry": "[2026-03-01 10:00] Consolidated the early small talk.",
                    "memory_update": "## Facts\n- user enjoys short questions\n",
                    "daily_sections": {"topics": ["small talk"]},
                }),
            ));
        }
        Ok(text_response("turn reply"))
    }
}

#[tokio::test]
async fn long_session_triggers_background_consolidation() {
    let dir = tempfile::tempdir().unwrap();
    // Tiny window: once the session exceeds 3 messages, the next inbound
    // schedules a background consolidation (keep = 1).
    let config = test_config(dir.path(), 3);

    let bus = Arc::new(MessageBus::new());
    let agent = Arc::new(
        AgentLoop::new(&config, Arc::new(ShapeAwareProvider), false, Arc::clone(&bus)).unwrap(),
    );
    let runner = Arc::clone(&agent);
    tokio::spawn(async move { runner.run().await });
    tokio::time::sleep(std::time::Duration::from_millis(10)).await;

    for (i, content) in ["q1", "q2", "q3"].iter().enumerate() {
        bus.publish_inbound(InboundMessage::new("telegram", "u", "8", *content));
        let out = bus.consume_outbound().await;
        assert!(!out.content.is_empty(), "turn {i} produced a reply");
    }

    // After turn 2 the session holds 4 messages (> 3); turn 3 schedules the
    // background consolidation, which writes the memory files.
    tokio::time::sleep(std::time::Duration::from_millis(500)).await;
    let history = std::fs::read_to_string(dir.path().join("memory").join("HISTORY.md"))
        .unwrap_or_default();
    assert!(
        history.contains("Consolidated the early small talk"),
        "history written: {history:?}"
    );
    let memory_md = std::fs::read_to_string(dir.path().join("memory").join("MEMORY.md"))
        .unwrap_or_default();
    assert!(memory_md.contains("short questions"));
    assert!(
        !dir.path()
            .join("memory")
            .join("consolidation-in-progress.json")
            .exists(),
        "progress marker cleared"
    );

    // The session watermark advanced and was persisted.
    let session_text =
        std::fs::read_to_string(dir.path().join("sessions").join("telegram_8.jsonl")).unwrap();
    let metadata: serde_json::Value =
        serde_json::from_str(session_text.lines().next().unwrap()).unwrap();
    assert!(
        metadata["last_consolidated"].as_u64().unwrap() > 0,
        "{metadata}"
    );
    agent.stop();
}

#[tokio::test]
async fn observability_rows_are_parseable_jsonl() {
    let dir = tempfile::tempdir().unwrap();
    let memory = nanobot_memory::MemoryStore::new(dir.path()).unwrap();
    memory.append_guard_metric("k1", "excessive_shrink", 500, 100, "preview one");
    memory.append_guard_metric("k2", "contains_code_block", 10, 900, "preview two");

    let path = dir
        .path()
        .join("memory")
        .join("observability")
        .join("memory-update-guard-metrics.jsonl");
    let text = std::fs::read_to_string(path).unwrap();
    for line in text.lines() {
        let row: serde_json::Value = serde_json::from_str(line).unwrap();
        assert!(row["ts"].is_string());
        assert!(row["session_key"].is_string());
        assert!(row["reason"].is_string());
    }
}
