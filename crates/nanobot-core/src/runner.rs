// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! The LLM↔tool iteration loop for one turn.
//!
//! Each iteration re-guards the message list, calls the provider (with
//! bounded retries for transient exceptions and one forced aggressive
//! compaction on context overflow), executes any requested tools through
//! the registry, and emits the typed event stream. A steering callback can
//! interrupt the loop at a tool boundary so queued follow-ups get served.

use std::sync::Arc;
use std::sync::OnceLock;
use std::time::Duration;

use regex::Regex;
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{info, warn};

use nanobot_model::{
    is_context_length_error, is_fatal_provider_error, is_retryable_error,
    provider::{ChatOptions, ChatProvider},
    ChatMessage, ChatResponse, ToolCallRequest,
};
use nanobot_tools::ToolRegistry;

use crate::events::{InterruptionInfo, RetryCounters, TurnEvent, TurnEventMeta};

/// Backoff for transient provider retries: capped exponential.
const RETRY_BACKOFF_BASE_MS: u64 = 500;
const RETRY_BACKOFF_CAP_MS: u64 = 8_000;

/// Keys of tool `details` persisted into session history.
const SESSION_TOOL_DETAIL_KEYS: &[&str] = &[
    "op",
    "path",
    "requested_path",
    "first_changed_line",
    "replacement_count",
    "diff_truncated",
    "channel",
    "chat_id",
    "message_id",
    "attachment_count",
    "sent",
    "accepted",
    "origin_channel",
    "origin_chat_id",
    "label",
    "task_len",
    "blocked",
    "timed_out",
    "exit_code",
];

fn think_block_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?s)<think>.*?</think>").expect("static pattern"))
}

/// Remove `<think>…</think>` blocks some models embed in content.
pub fn strip_think(text: &str) -> Option<String> {
    let stripped = think_block_re().replace_all(text, "").trim().to_string();
    if stripped.is_empty() {
        None
    } else {
        Some(stripped)
    }
}

/// Format tool calls as a concise hint, e.g. `web_search("query…")`.
pub fn tool_hint(tool_calls: &[ToolCallRequest]) -> String {
    tool_calls
        .iter()
        .map(|tc| {
            let first_string = tc.arguments.values().next().and_then(Value::as_str);
            match first_string {
                Some(val) if val.chars().count() > 40 => {
                    let short: String = val.chars().take(40).collect();
                    format!("{}(\"{short}…\")", tc.name)
                }
                Some(val) => format!("{}(\"{val}\")", tc.name),
                None => tc.name.clone(),
            }
        })
        .collect::<Vec<_>>()
        .join(", ")
}

/// Keep a compact, versioned subset of tool details for session persistence.
pub fn session_tool_details(details: Option<&serde_json::Map<String, Value>>) -> Option<Value> {
    let details = details?;
    if details.is_empty() {
        return None;
    }
    let mut compact = serde_json::Map::new();
    for key in SESSION_TOOL_DETAIL_KEYS {
        if let Some(value) = details.get(*key) {
            compact.insert((*key).to_string(), value.clone());
        }
    }
    if compact.is_empty() {
        return None;
    }
    Some(serde_json::json!({
        "schema_version": 1,
        "tool": details.get("op"),
        "data": compact,
    }))
}

/// Decision returned by the steering callback after a tool call.
#[derive(Debug, Clone, Default)]
pub struct SteerDecision {
    pub interrupt: bool,
    pub reason: Option<String>,
    pub pending_followup_count: Option<usize>,
    pub next_followup_preview: Option<String>,
}

/// Progress sink: `(text, is_tool_hint)`.
pub type ProgressFn = Arc<dyn Fn(&str, bool) + Send + Sync>;
/// Steering callback: consulted after each tool execution.
pub type SteerFn = Arc<dyn Fn() -> Option<SteerDecision> + Send + Sync>;
/// Message-list guard: `(messages, current_turn_start, aggressive)` →
/// re-budgeted `(messages, current_turn_start)`.
pub type GuardFn = Arc<dyn Fn(Vec<ChatMessage>, usize, bool) -> (Vec<ChatMessage>, usize) + Send + Sync>;

/// Per-run wiring supplied by the orchestrator (or the subagent manager).
#[derive(Clone)]
pub struct TurnHooks {
    pub guard: GuardFn,
    pub on_progress: Option<ProgressFn>,
    pub on_event: Option<mpsc::UnboundedSender<TurnEvent>>,
    pub event_source: String,
    pub should_interrupt_after_tool: Option<SteerFn>,
}

impl TurnHooks {
    /// Hooks with an identity guard and no observers (subagent default).
    pub fn passthrough(event_source: &str) -> Self {
        Self {
            guard: Arc::new(|messages, start, _| (messages, start)),
            on_progress: None,
            on_event: None,
            event_source: event_source.to_string(),
            should_interrupt_after_tool: None,
        }
    }
}

#[derive(Debug)]
pub struct TurnOutcome {
    pub final_content: Option<String>,
    pub tools_used: Vec<String>,
    pub messages: Vec<ChatMessage>,
}

pub struct TurnRunner {
    provider: Arc<dyn ChatProvider>,
    tools: Arc<ToolRegistry>,
    opts: ChatOptions,
    max_iterations: u32,
    llm_retry_max: u32,
}

struct EventEmitter {
    sender: Option<mpsc::UnboundedSender<TurnEvent>>,
    turn_id: String,
    sequence: u64,
    source: String,
}

impl EventEmitter {
    fn emit(&mut self, build: impl FnOnce(TurnEventMeta) -> TurnEvent) {
        let Some(sender) = &self.sender else { return };
        self.sequence += 1;
        let meta = TurnEventMeta {
            turn_id: self.turn_id.clone(),
            sequence: self.sequence,
            timestamp_ms: chrono::Utc::now().timestamp_millis() as u64,
            source: self.source.clone(),
        };
        let _ = sender.send(build(meta));
    }
}

impl TurnRunner {
    pub fn new(
        provider: Arc<dyn ChatProvider>,
        tools: Arc<ToolRegistry>,
        opts: ChatOptions,
        max_iterations: u32,
        llm_retry_max: u32,
    ) -> Self {
        Self {
            provider,
            tools,
            opts,
            max_iterations,
            llm_retry_max,
        }
    }

    /// Run the iterative turn loop.
    ///
    /// Returns `Err` only for fatal provider exceptions (credentials); every
    /// other failure mode resolves to a final content. A `turn_end` event is
    /// emitted on every path.
    pub async fn run(
        &self,
        initial_messages: Vec<ChatMessage>,
        hooks: &TurnHooks,
    ) -> anyhow::Result<TurnOutcome> {
        let mut messages = initial_messages;
        let mut current_turn_start = messages.len().saturating_sub(1);
        let mut iteration = 0u32;
        let mut final_content: Option<String> = None;
        let mut tools_used: Vec<String> = Vec::new();
        let mut retries = RetryCounters::default();
        let mut interruption: Option<InterruptionInfo> = None;
        let mut overflow_compaction_used = false;
        let mut force_aggressive_guard = false;

        let mut emitter = EventEmitter {
            sender: hooks.on_event.clone(),
            turn_id: format!("turn_{}", &uuid::Uuid::new_v4().simple().to_string()[..12]),
            sequence: 0,
            source: hooks.event_source.clone(),
        };
        let initial_count = messages.len();
        let max_iterations = self.max_iterations;
        emitter.emit(|meta| TurnEvent::TurnStart {
            meta,
            initial_message_count: initial_count,
            max_iterations,
        });

        let definitions = self.tools.definitions();

        'iterations: while iteration < self.max_iterations {
            iteration += 1;
            let guarded = (hooks.guard)(messages, current_turn_start, force_aggressive_guard);
            messages = guarded.0;
            current_turn_start = guarded.1;
            force_aggressive_guard = false;

            let response = match self
                .call_with_exception_retries(&messages, &definitions, &mut retries)
                .await
            {
                Ok(r) => r,
                Err(e) => {
                    self.emit_turn_end(
                        &mut emitter,
                        iteration,
                        &tools_used,
                        false,
                        false,
                        None,
                        retries,
                    );
                    return Err(e);
                }
            };

            if response.finish_reason == "error" {
                let content = response.content.clone().unwrap_or_default();
                if is_context_length_error(&content) {
                    retries.llm_error_finish_overflow_count += 1;
                    if !overflow_compaction_used {
                        overflow_compaction_used = true;
                        retries.llm_overflow_compaction_retries += 1;
                        force_aggressive_guard = true;
                        warn!("context overflow reported; forcing aggressive compaction and retrying");
                        continue 'iterations;
                    }
                } else if is_retryable_error(&content)
                    && retries.llm_error_finish_retry_count < self.llm_retry_max
                {
                    retries.llm_error_finish_retry_count += 1;
                    retries.llm_error_finish_retryable_count += 1;
                    backoff_sleep(retries.llm_error_finish_retry_count).await;
                    continue 'iterations;
                } else if !is_retryable_error(&content) {
                    retries.llm_error_finish_fatal_count += 1;
                }
                // Surface the error text as the final content, no retry.
                messages.push(ChatMessage::assistant(content.clone()));
                final_content = Some(content);
                break 'iterations;
            }

            if response.has_tool_calls() {
                if let Some(progress) = &hooks.on_progress {
                    if let Some(clean) = response.content.as_deref().and_then(strip_think) {
                        progress(&clean, false);
                    }
                    progress(&tool_hint(&response.tool_calls), true);
                }

                let records: Vec<_> = response.tool_calls.iter().map(|tc| tc.to_record()).collect();
                messages.push(ChatMessage::assistant_tool_calls(
                    response.content.clone(),
                    records,
                    response.reasoning_content.clone(),
                ));

                for tool_call in &response.tool_calls {
                    tools_used.push(tool_call.name.clone());
                    info!(
                        tool = %tool_call.name,
                        args = %truncate_for_log(&tool_call.arguments_json()),
                        "tool call"
                    );
                    let tc_iteration = iteration;
                    emitter.emit(|meta| TurnEvent::ToolStart {
                        meta,
                        iteration: tc_iteration,
                        tool: tool_call.name.clone(),
                        tool_call_id: tool_call.id.clone(),
                        arguments: Value::Object(tool_call.arguments.clone()),
                    });

                    let result = self.tools.execute(&tool_call.name, &tool_call.arguments).await;

                    emitter.emit(|meta| TurnEvent::ToolEnd {
                        meta,
                        iteration: tc_iteration,
                        tool: tool_call.name.clone(),
                        tool_call_id: tool_call.id.clone(),
                        is_error: result.is_error,
                        has_details: result.details.is_some(),
                        detail_op: result.detail_op().map(str::to_string),
                    });

                    let mut tool_msg =
                        ChatMessage::tool_result(&tool_call.id, &tool_call.name, &result.text);
                    tool_msg.tool_details = session_tool_details(result.details.as_ref());
                    messages.push(tool_msg);

                    if let Some(steer) = &hooks.should_interrupt_after_tool {
                        if let Some(decision) = steer() {
                            if decision.interrupt {
                                final_content = Some(interruption_content(&decision));
                                interruption = Some(InterruptionInfo {
                                    reason: decision
                                        .reason
                                        .unwrap_or_else(|| "pending_followup".into()),
                                    interrupted_at_iteration: iteration,
                                    interrupted_after_tool: tool_call.name.clone(),
                                    pending_followup_count: decision.pending_followup_count,
                                    next_followup_preview: decision.next_followup_preview,
                                });
                                info!(
                                    tool = %tool_call.name,
                                    iteration,
                                    "turn interrupted for pending follow-up"
                                );
                                break 'iterations;
                            }
                        }
                    }
                }
            } else {
                let content = response.content.clone().unwrap_or_default();
                let mut assistant = ChatMessage::assistant(content.clone());
                assistant.reasoning_content = response.reasoning_content.clone();
                messages.push(assistant);
                final_content = strip_think(&content);
                break 'iterations;
            }
        }

        let mut max_iterations_reached = false;
        if final_content.is_none() && iteration >= self.max_iterations {
            warn!(max_iterations = self.max_iterations, "max iterations reached");
            max_iterations_reached = true;
            final_content = Some(format!(
                "I reached the maximum number of tool call iterations ({}) without completing \
                 the task. You can try breaking the task into smaller steps.",
                self.max_iterations
            ));
        }

        self.emit_turn_end(
            &mut emitter,
            iteration,
            &tools_used,
            final_content.is_some(),
            max_iterations_reached,
            interruption,
            retries,
        );

        Ok(TurnOutcome {
            final_content,
            tools_used,
            messages,
        })
    }

    /// Call the provider, retrying transient exceptions with backoff;
    /// fatal exceptions (credentials) re-raise immediately.
    async fn call_with_exception_retries(
        &self,
        messages: &[ChatMessage],
        definitions: &[Value],
        retries: &mut RetryCounters,
    ) -> anyhow::Result<ChatResponse> {
        let mut attempt = 0u32;
        loop {
            match self.provider.chat(messages, Some(definitions), &self.opts).await {
                Ok(response) => return Ok(response),
                Err(e) => {
                    let text = e.to_string();
                    if is_fatal_provider_error(&text) {
                        return Err(e);
                    }
                    if attempt >= self.llm_retry_max {
                        return Err(e);
                    }
                    attempt += 1;
                    retries.llm_exception_retry_count += 1;
                    warn!(attempt, error = %text, "transient provider error, retrying");
                    backoff_sleep(attempt).await;
                }
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn emit_turn_end(
        &self,
        emitter: &mut EventEmitter,
        iterations: u32,
        tools_used: &[String],
        completed: bool,
        max_iterations_reached: bool,
        interruption: Option<InterruptionInfo>,
        retries: RetryCounters,
    ) {
        let tool_count = tools_used.len();
        let interrupted = interruption.is_some();
        emitter.emit(|meta| TurnEvent::TurnEnd {
            meta,
            iterations,
            tool_count,
            completed,
            max_iterations_reached,
            interrupted_for_followup: interrupted,
            interruption,
            retries,
        });
    }
}

fn interruption_content(decision: &SteerDecision) -> String {
    if let Some(preview) = decision
        .next_followup_preview
        .as_deref()
        .filter(|p| !p.is_empty())
    {
        return format!(
            "A newer message arrived, so I paused this task and will handle it next: {preview}"
        );
    }
    if let Some(count) = decision.pending_followup_count.filter(|c| *c > 0) {
        return format!(
            "A newer message arrived, so I paused this task and will handle the next queued \
             message now ({count} waiting)."
        );
    }
    "A newer message arrived, so I paused this task and will handle the newer message next."
        .to_string()
}

async fn backoff_sleep(attempt: u32) {
    let millis = (RETRY_BACKOFF_BASE_MS << attempt.min(6)).min(RETRY_BACKOFF_CAP_MS);
    tokio::time::sleep(Duration::from_millis(millis)).await;
}

fn truncate_for_log(text: &str) -> String {
    if text.len() <= 200 {
        return text.to_string();
    }
    let mut cut = 200;
    while !text.is_char_boundary(cut) {
        cut -= 1;
    }
    format!("{}…", &text[..cut])
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
