// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Typed turn-event payloads emitted by the turn runner.
//!
//! Events serialize to JSON rows carrying the namespace and schema version;
//! `sequence` is monotonic within a turn starting at 1, and `turn_id` is
//! unique across the process lifetime.

use serde_json::{json, Value};

pub const TURN_EVENT_NAMESPACE: &str = "nanobot.turn";
pub const TURN_EVENT_VERSION: u32 = 1;

pub const TURN_EVENT_TURN_START: &str = "turn_start";
pub const TURN_EVENT_TOOL_START: &str = "tool_start";
pub const TURN_EVENT_TOOL_END: &str = "tool_end";
pub const TURN_EVENT_TURN_END: &str = "turn_end";

/// Fields common to every event of one turn.
#[derive(Debug, Clone)]
pub struct TurnEventMeta {
    pub turn_id: String,
    pub sequence: u64,
    pub timestamp_ms: u64,
    pub source: String,
}

/// Retry counters reported on `turn_end`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RetryCounters {
    pub llm_exception_retry_count: u32,
    pub llm_error_finish_retry_count: u32,
    pub llm_overflow_compaction_retries: u32,
    pub llm_error_finish_overflow_count: u32,
    pub llm_error_finish_retryable_count: u32,
    pub llm_error_finish_fatal_count: u32,
}

impl RetryCounters {
    /// Total provider retries of any kind during the turn.
    pub fn total(&self) -> u32 {
        self.llm_exception_retry_count
            + self.llm_error_finish_retry_count
            + self.llm_overflow_compaction_retries
    }
}

/// Details attached to `turn_end` when a follow-up interrupted the turn.
#[derive(Debug, Clone)]
pub struct InterruptionInfo {
    pub reason: String,
    pub interrupted_at_iteration: u32,
    pub interrupted_after_tool: String,
    pub pending_followup_count: Option<usize>,
    pub next_followup_preview: Option<String>,
}

#[derive(Debug, Clone)]
pub enum TurnEvent {
    TurnStart {
        meta: TurnEventMeta,
        initial_message_count: usize,
        max_iterations: u32,
    },
    ToolStart {
        meta: TurnEventMeta,
        iteration: u32,
        tool: String,
        tool_call_id: String,
        arguments: Value,
    },
    ToolEnd {
        meta: TurnEventMeta,
        iteration: u32,
        tool: String,
        tool_call_id: String,
        is_error: bool,
        has_details: bool,
        detail_op: Option<String>,
    },
    TurnEnd {
        meta: TurnEventMeta,
        iterations: u32,
        tool_count: usize,
        completed: bool,
        max_iterations_reached: bool,
        interrupted_for_followup: bool,
        interruption: Option<InterruptionInfo>,
        retries: RetryCounters,
    },
}

impl TurnEvent {
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::TurnStart { .. } => TURN_EVENT_TURN_START,
            Self::ToolStart { .. } => TURN_EVENT_TOOL_START,
            Self::ToolEnd { .. } => TURN_EVENT_TOOL_END,
            Self::TurnEnd { .. } => TURN_EVENT_TURN_END,
        }
    }

    pub fn meta(&self) -> &TurnEventMeta {
        match self {
            Self::TurnStart { meta, .. }
            | Self::ToolStart { meta, .. }
            | Self::ToolEnd { meta, .. }
            | Self::TurnEnd { meta, .. } => meta,
        }
    }

    /// Serialize to the on-wire JSON row.
    pub fn to_json(&self) -> Value {
        let meta = self.meta();
        let mut row = json!({
            "namespace": TURN_EVENT_NAMESPACE,
            "version": TURN_EVENT_VERSION,
            "type": self.event_type(),
            "turn_id": meta.turn_id,
            "sequence": meta.sequence,
            "timestamp_ms": meta.timestamp_ms,
            "source": meta.source,
        });
        match self {
            Self::TurnStart {
                initial_message_count,
                max_iterations,
                ..
            } => {
                row["initial_message_count"] = json!(initial_message_count);
                row["max_iterations"] = json!(max_iterations);
            }
            Self::ToolStart {
                iteration,
                tool,
                tool_call_id,
                arguments,
                ..
            } => {
                row["iteration"] = json!(iteration);
                row["tool"] = json!(tool);
                row["tool_call_id"] = json!(tool_call_id);
                row["arguments"] = arguments.clone();
            }
            Self::ToolEnd {
                iteration,
                tool,
                tool_call_id,
                is_error,
                has_details,
                detail_op,
                ..
            } => {
                row["iteration"] = json!(iteration);
                row["tool"] = json!(tool);
                row["tool_call_id"] = json!(tool_call_id);
                row["is_error"] = json!(is_error);
                row["has_details"] = json!(has_details);
                row["detail_op"] = json!(detail_op);
            }
            Self::TurnEnd {
                iterations,
                tool_count,
                completed,
                max_iterations_reached,
                interrupted_for_followup,
                interruption,
                retries,
                ..
            } => {
                row["iterations"] = json!(iterations);
                row["tool_count"] = json!(tool_count);
                row["completed"] = json!(completed);
                row["max_iterations_reached"] = json!(max_iterations_reached);
                row["interrupted_for_followup"] = json!(interrupted_for_followup);
                row["llm_retry_count"] = json!(retries.total());
                row["llm_exception_retry_count"] = json!(retries.llm_exception_retry_count);
                row["llm_error_finish_retry_count"] = json!(retries.llm_error_finish_retry_count);
                row["llm_overflow_compaction_retries"] =
                    json!(retries.llm_overflow_compaction_retries);
                row["llm_error_finish_overflow_count"] =
                    json!(retries.llm_error_finish_overflow_count);
                row["llm_error_finish_retryable_count"] =
                    json!(retries.llm_error_finish_retryable_count);
                row["llm_error_finish_fatal_count"] = json!(retries.llm_error_finish_fatal_count);
                if let Some(info) = interruption {
                    row["interruption_reason"] = json!(info.reason);
                    row["interrupted_at_iteration"] = json!(info.interrupted_at_iteration);
                    row["interrupted_after_tool"] = json!(info.interrupted_after_tool);
                    if let Some(count) = info.pending_followup_count {
                        row["pending_followup_count"] = json!(count);
                    }
                    if let Some(preview) = &info.next_followup_preview {
                        row["next_followup_preview"] = json!(preview);
                    }
                }
            }
        }
        row
    }
}

/// Manifest exposed by the health endpoint's `?debug=events` view.
pub fn turn_event_capabilities() -> Value {
    let events: Vec<Value> = [
        TURN_EVENT_TURN_START,
        TURN_EVENT_TOOL_START,
        TURN_EVENT_TOOL_END,
        TURN_EVENT_TURN_END,
    ]
    .iter()
    .map(|t| json!({"type": t, "kind": format!("{TURN_EVENT_NAMESPACE}.{t}")}))
    .collect();
    json!({
        "namespace": TURN_EVENT_NAMESPACE,
        "version": TURN_EVENT_VERSION,
        "events": events,
    })
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
