// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! End-to-end scenarios over the turn runner, orchestrator, and commands,
//! driven by the scripted mock provider. No network access.

use std::sync::{Arc, Mutex};

use serde_json::json;
use tokio::sync::mpsc;

use nanobot_bus::{InboundMessage, MessageBus};
use nanobot_config::Config;
use nanobot_model::mock::{text_response, tool_call_response, ScriptedProvider};
use nanobot_model::provider::ChatOptions;
use nanobot_model::{ChatMessage, ChatResponse};
use nanobot_tools::{build_standard_registry, StandardToolOptions, ToolRegistry};

use crate::agent::AgentLoop;
use crate::events::TurnEvent;
use crate::runner::{SteerDecision, TurnHooks, TurnRunner};

fn chat_opts() -> ChatOptions {
    ChatOptions {
        model: "scripted-mock".into(),
        max_tokens: 1024,
        temperature: 0.0,
    }
}

fn runner_with(
    provider: Arc<ScriptedProvider>,
    tools: Arc<ToolRegistry>,
    max_iterations: u32,
) -> TurnRunner {
    TurnRunner::new(provider, tools, chat_opts(), max_iterations, 2)
}

fn exec_registry(dir: &std::path::Path) -> Arc<ToolRegistry> {
    let mut options = StandardToolOptions::default();
    options.audit = false;
    Arc::new(build_standard_registry(dir, &options, None, None))
}

fn initial_messages(user: &str) -> Vec<ChatMessage> {
    vec![ChatMessage::system("sys"), ChatMessage::user(user)]
}

async fn collect_events(mut rx: mpsc::UnboundedReceiver<TurnEvent>) -> Vec<serde_json::Value> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event.to_json());
    }
    events
}

fn test_config(workspace: &std::path::Path) -> Config {
    let mut config = Config::default();
    config.agent.workspace = workspace.to_path_buf();
    config.channels.send_progress = false;
    config.tools.audit_tool_calls = false;
    config
}

async fn start_agent(
    workspace: &std::path::Path,
    provider: Arc<ScriptedProvider>,
) -> (Arc<AgentLoop>, Arc<MessageBus>) {
    let bus = Arc::new(MessageBus::new());
    let config = test_config(workspace);
    let agent = Arc::new(AgentLoop::new(&config, provider, false, Arc::clone(&bus)).unwrap());
    let runner = Arc::clone(&agent);
    tokio::spawn(async move { runner.run().await });
    tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    (agent, bus)
}

// ── Scenario: simple turn ─────────────────────────────────────────────────────

#[tokio::test]
async fn simple_turn_produces_outbound_and_persists_session() {
    let dir = tempfile::tempdir().unwrap();
    let provider = Arc::new(ScriptedProvider::new(vec![text_response("hello")]));
    let (agent, bus) = start_agent(dir.path(), Arc::clone(&provider)).await;

    bus.publish_inbound(InboundMessage::new("telegram", "u1", "42", "hi"));
    let out = bus.consume_outbound().await;
    assert_eq!(out.channel, "telegram");
    assert_eq!(out.chat_id, "42");
    assert_eq!(out.content, "hello");

    // Session file holds [user "hi", assistant "hello"].
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    let session_file = dir.path().join("sessions").join("telegram_42.jsonl");
    let text = std::fs::read_to_string(session_file).unwrap();
    let lines: Vec<&str> = text.lines().collect();
    assert_eq!(lines.len(), 3, "metadata + 2 messages: {text}");
    assert!(lines[1].contains("\"hi\""));
    assert!(lines[2].contains("\"hello\""));
    agent.stop();
}

// ── Scenario: tool roundtrip with event stream ────────────────────────────────

#[tokio::test]
async fn tool_roundtrip_emits_ordered_events() {
    let dir = tempfile::tempdir().unwrap();
    let provider = Arc::new(ScriptedProvider::new(vec![
        tool_call_response("c1", "exec", json!({"command": "echo hi"})),
        text_response("Done"),
    ]));
    let runner = runner_with(Arc::clone(&provider), exec_registry(dir.path()), 10);

    let (tx, rx) = mpsc::unbounded_channel();
    let mut hooks = TurnHooks::passthrough("turn_runner");
    hooks.on_event = Some(tx);

    let outcome = runner.run(initial_messages("run it"), &hooks).await.unwrap();
    assert_eq!(outcome.final_content.as_deref(), Some("Done"));
    assert_eq!(outcome.tools_used, vec!["exec"]);

    let events = collect_events(rx).await;
    let types: Vec<&str> = events.iter().map(|e| e["type"].as_str().unwrap()).collect();
    assert_eq!(types, vec!["turn_start", "tool_start", "tool_end", "turn_end"]);
    let sequences: Vec<u64> = events.iter().map(|e| e["sequence"].as_u64().unwrap()).collect();
    assert_eq!(sequences, vec![1, 2, 3, 4]);
    assert!(events.iter().all(|e| e["namespace"] == json!("nanobot.turn")));
    assert_eq!(events[2]["is_error"], json!(false));
    assert_eq!(events[2]["detail_op"], json!("exec"));
    assert_eq!(events[3]["iterations"], json!(2));
    assert_eq!(events[3]["tool_count"], json!(1));
    assert_eq!(events[3]["completed"], json!(true));
    assert_eq!(events[3]["max_iterations_reached"], json!(false));

    // The turn history pairs the tool result with its call id.
    let tool_msg = outcome
        .messages
        .iter()
        .find(|m| m.role == nanobot_model::Role::Tool)
        .unwrap();
    assert_eq!(tool_msg.tool_call_id.as_deref(), Some("c1"));
    assert!(tool_msg.text().contains("hi"));
}

// ── Scenario: follow-up interruption at a tool boundary ───────────────────────

#[tokio::test]
async fn steering_interrupts_after_tool_and_names_next_followup() {
    let dir = tempfile::tempdir().unwrap();
    let provider = Arc::new(ScriptedProvider::new(vec![tool_call_response(
        "c1",
        "exec",
        json!({"command": "echo step"}),
    )]));
    let runner = runner_with(Arc::clone(&provider), exec_registry(dir.path()), 10);

    let (tx, rx) = mpsc::unbounded_channel();
    let mut hooks = TurnHooks::passthrough("turn_runner");
    hooks.on_event = Some(tx);
    hooks.should_interrupt_after_tool = Some(Arc::new(|| {
        Some(SteerDecision {
            interrupt: true,
            reason: Some("pending_followup".into()),
            pending_followup_count: Some(1),
            next_followup_preview: Some("second".into()),
        })
    }));

    let outcome = runner.run(initial_messages("first"), &hooks).await.unwrap();
    let final_content = outcome.final_content.unwrap();
    assert!(final_content.contains("paused this task"), "{final_content}");
    assert!(final_content.contains("second"));

    let events = collect_events(rx).await;
    let end = events.last().unwrap();
    assert_eq!(end["type"], json!("turn_end"));
    assert_eq!(end["interrupted_for_followup"], json!(true));
    assert_eq!(end["interrupted_after_tool"], json!("exec"));
    assert_eq!(end["next_followup_preview"], json!("second"));
}

// ── Scenario: follow-up FIFO through the orchestrator ─────────────────────────

#[tokio::test]
async fn followup_is_processed_after_interrupted_turn() {
    let dir = tempfile::tempdir().unwrap();
    let provider = Arc::new(ScriptedProvider::new(vec![
        // Turn 1: a slow tool call so the follow-up lands mid-turn.
        tool_call_response("c1", "exec", json!({"command": "sleep 1"})),
        // Turn 2 (the follow-up): a plain answer.
        text_response("answer to second"),
    ]));
    let (agent, bus) = start_agent(dir.path(), Arc::clone(&provider)).await;

    bus.publish_inbound(InboundMessage::new("telegram", "u1", "7", "first"));
    tokio::time::sleep(std::time::Duration::from_millis(200)).await;
    bus.publish_inbound(InboundMessage::new("telegram", "u1", "7", "second"));

    let first_out = bus.consume_outbound().await;
    assert!(
        first_out.content.contains("paused this task"),
        "turn 1 should be interrupted: {}",
        first_out.content
    );
    assert!(first_out.content.contains("second"));

    let second_out = bus.consume_outbound().await;
    assert_eq!(second_out.content, "answer to second");

    // Both turns landed in the session in FIFO order.
    tokio::time::sleep(std::time::Duration::from_millis(100)).await;
    let text =
        std::fs::read_to_string(dir.path().join("sessions").join("telegram_7.jsonl")).unwrap();
    let first_pos = text.find("first").unwrap();
    let second_pos = text.find("\"second\"").unwrap();
    assert!(first_pos < second_pos);
    agent.stop();
}

// ── Scenario: /new resets the session and archives in the background ──────────

#[tokio::test]
async fn new_command_resets_session_and_archives() {
    let dir = tempfile::tempdir().unwrap();
    let provider = Arc::new(ScriptedProvider::new(vec![
        text_response("hello"),
        tool_call_response(
            "c1",
            "save_memory",
            json!({
                "history_entry": "[2026-03-01 10:00] Archived one greeting exchange.",
                "memory_update": "## Facts\n- greeted the user\n",
            }),
        ),
    ]));
    let (agent, bus) = start_agent(dir.path(), Arc::clone(&provider)).await;

    bus.publish_inbound(InboundMessage::new("telegram", "u1", "9", "hi"));
    assert_eq!(bus.consume_outbound().await.content, "hello");

    bus.publish_inbound(InboundMessage::new("telegram", "u1", "9", "/new"));
    let out = bus.consume_outbound().await;
    assert_eq!(out.content, "New session started.");

    // Background archival writes HISTORY.md; the live session is empty.
    tokio::time::sleep(std::time::Duration::from_millis(300)).await;
    let history = std::fs::read_to_string(dir.path().join("memory").join("HISTORY.md"))
        .unwrap_or_default();
    assert!(history.contains("Archived one greeting exchange"), "{history}");
    let session_text =
        std::fs::read_to_string(dir.path().join("sessions").join("telegram_9.jsonl")).unwrap();
    assert_eq!(session_text.lines().count(), 1, "metadata only after /new");
    agent.stop();
}

// ── Scenario: /help and /stop ─────────────────────────────────────────────────

#[tokio::test]
async fn help_and_stop_commands_reply_without_provider_calls() {
    let dir = tempfile::tempdir().unwrap();
    let provider = Arc::new(ScriptedProvider::new(vec![]));
    let (agent, bus) = start_agent(dir.path(), Arc::clone(&provider)).await;

    bus.publish_inbound(InboundMessage::new("cli", "u", "direct", "/help"));
    let help = bus.consume_outbound().await;
    assert!(help.content.contains("/new"));
    assert!(help.content.contains("/stop"));

    bus.publish_inbound(InboundMessage::new("cli", "u", "direct", "/stop"));
    let stop = bus.consume_outbound().await;
    assert_eq!(stop.content, "No active task to stop.");

    assert_eq!(provider.calls_made(), 0);
    agent.stop();
}

// ── Boundary: fatal error finish is surfaced with zero retries ────────────────

#[tokio::test]
async fn fatal_error_finish_returns_text_without_retry() {
    let dir = tempfile::tempdir().unwrap();
    let provider = Arc::new(ScriptedProvider::new(vec![ChatResponse::error(
        "Authentication failed: invalid api key",
    )]));
    let runner = runner_with(Arc::clone(&provider), exec_registry(dir.path()), 10);

    let outcome = runner
        .run(initial_messages("hi"), &TurnHooks::passthrough("turn_runner"))
        .await
        .unwrap();
    assert_eq!(
        outcome.final_content.as_deref(),
        Some("Authentication failed: invalid api key")
    );
    assert_eq!(provider.calls_made(), 1, "zero retries");
}

// ── Boundary: retryable error finish retries then succeeds ────────────────────

#[tokio::test]
async fn retryable_error_finish_is_retried() {
    let dir = tempfile::tempdir().unwrap();
    let provider = Arc::new(ScriptedProvider::new(vec![
        ChatResponse::error("503 Service Unavailable, please try again later"),
        text_response("recovered"),
    ]));
    let runner = runner_with(Arc::clone(&provider), exec_registry(dir.path()), 10);

    let outcome = runner
        .run(initial_messages("hi"), &TurnHooks::passthrough("turn_runner"))
        .await
        .unwrap();
    assert_eq!(outcome.final_content.as_deref(), Some("recovered"));
    assert_eq!(provider.calls_made(), 2);
}

// ── Boundary: context overflow forces one aggressive compaction ───────────────

#[tokio::test]
async fn context_overflow_triggers_aggressive_guard_once() {
    let dir = tempfile::tempdir().unwrap();
    let provider = Arc::new(ScriptedProvider::new(vec![
        ChatResponse::error("This model's maximum context length is 8192 tokens"),
        text_response("fits now"),
    ]));
    let runner = runner_with(Arc::clone(&provider), exec_registry(dir.path()), 10);

    let aggressive_flags: Arc<Mutex<Vec<bool>>> = Arc::new(Mutex::new(Vec::new()));
    let flags = Arc::clone(&aggressive_flags);
    let mut hooks = TurnHooks::passthrough("turn_runner");
    hooks.guard = Arc::new(move |messages, start, aggressive| {
        flags.lock().unwrap().push(aggressive);
        (messages, start)
    });

    let outcome = runner.run(initial_messages("hi"), &hooks).await.unwrap();
    assert_eq!(outcome.final_content.as_deref(), Some("fits now"));
    assert_eq!(*aggressive_flags.lock().unwrap(), vec![false, true]);
}

// ── Boundary: exception retry path with backoff ───────────────────────────────

#[tokio::test]
async fn transient_exception_is_retried_and_fatal_is_not() {
    let dir = tempfile::tempdir().unwrap();
    let provider = Arc::new(ScriptedProvider::new(vec![]));
    provider.push_error("connection reset by peer");
    let registry = exec_registry(dir.path());

    // Transient: retried, then the fallback text response is served.
    let runner = runner_with(Arc::clone(&provider), Arc::clone(&registry), 10);
    let outcome = runner
        .run(initial_messages("hi"), &TurnHooks::passthrough("turn_runner"))
        .await
        .unwrap();
    assert!(outcome.final_content.is_some());
    assert_eq!(provider.calls_made(), 2);

    // Fatal: re-raised without retry.
    let fatal_provider = Arc::new(ScriptedProvider::new(vec![]));
    fatal_provider.push_error("401 Unauthorized");
    let runner = runner_with(Arc::clone(&fatal_provider), registry, 10);
    let err = runner
        .run(initial_messages("hi"), &TurnHooks::passthrough("turn_runner"))
        .await
        .unwrap_err();
    assert!(err.to_string().contains("Unauthorized"));
    assert_eq!(fatal_provider.calls_made(), 1);
}

// ── Boundary: max iterations message ──────────────────────────────────────────

#[tokio::test]
async fn max_iterations_yields_fixed_message() {
    let dir = tempfile::tempdir().unwrap();
    let provider = Arc::new(ScriptedProvider::new(vec![
        tool_call_response("c1", "exec", json!({"command": "echo a"})),
        tool_call_response("c2", "exec", json!({"command": "echo b"})),
        tool_call_response("c3", "exec", json!({"command": "echo c"})),
    ]));
    let runner = runner_with(Arc::clone(&provider), exec_registry(dir.path()), 2);

    let (tx, rx) = mpsc::unbounded_channel();
    let mut hooks = TurnHooks::passthrough("turn_runner");
    hooks.on_event = Some(tx);
    let outcome = runner.run(initial_messages("loop"), &hooks).await.unwrap();
    let final_content = outcome.final_content.unwrap();
    assert!(final_content.contains("maximum number of tool call iterations (2)"));

    let events = collect_events(rx).await;
    assert_eq!(events.last().unwrap()["max_iterations_reached"], json!(true));
}

// ── Progress publishing ───────────────────────────────────────────────────────

#[tokio::test]
async fn progress_messages_carry_progress_metadata() {
    let dir = tempfile::tempdir().unwrap();
    let provider = Arc::new(ScriptedProvider::new(vec![
        tool_call_response("c1", "exec", json!({"command": "echo hi"})),
        text_response("final answer"),
    ]));
    let bus = Arc::new(MessageBus::new());
    let mut config = test_config(dir.path());
    config.channels.send_progress = true;
    let agent = Arc::new(AgentLoop::new(&config, provider, false, Arc::clone(&bus)).unwrap());
    let runner = Arc::clone(&agent);
    tokio::spawn(async move { runner.run().await });
    tokio::time::sleep(std::time::Duration::from_millis(10)).await;

    bus.publish_inbound(InboundMessage::new("telegram", "u", "11", "run it"));
    let progress = bus.consume_outbound().await;
    assert_eq!(progress.metadata.get("_progress"), Some(&json!(true)));
    assert_eq!(progress.metadata.get("_tool_hint"), Some(&json!(true)));
    assert!(progress.content.contains("exec("), "{}", progress.content);

    let final_out = bus.consume_outbound().await;
    assert_eq!(final_out.content, "final answer");
    assert!(final_out.metadata.get("_progress").is_none());
    agent.stop();
}

// ── Message-tool suppression of the default outbound ──────────────────────────

#[tokio::test]
async fn message_tool_reply_suppresses_default_outbound() {
    let dir = tempfile::tempdir().unwrap();
    let provider = Arc::new(ScriptedProvider::new(vec![
        tool_call_response("c1", "message", json!({"content": "direct reply"})),
        text_response("summary the user never sees twice"),
    ]));
    let (agent, bus) = start_agent(dir.path(), Arc::clone(&provider)).await;

    bus.publish_inbound(InboundMessage::new("telegram", "u1", "3", "ping"));
    let first = bus.consume_outbound().await;
    assert_eq!(first.content, "direct reply", "tool-sent message arrives");

    // No second outbound: the default reply is suppressed. The bus stays
    // empty after the turn settles.
    tokio::time::sleep(std::time::Duration::from_millis(200)).await;
    assert_eq!(bus.outbound_depth(), 0);
    agent.stop();
}
