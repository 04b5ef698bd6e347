// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Chunked, crash-resumable consolidation of session messages into
//! long-term memory via one `save_memory` provider tool call per chunk.
//!
//! Progress is persisted after every processed chunk so a crashed run
//! resumes where it stopped. A context-length error halves the chunk and
//! retries; a single-message overflow or a plain-text response is fatal for
//! this run (no progress is lost, a later call retries).

use chrono::Local;
use serde_json::{json, Value};
use tracing::{info, warn};

use nanobot_model::{is_context_length_error, ChatMessage, ChatProvider, ChatResponse};
use nanobot_sessions::Session;

use crate::guard;
use crate::routing;
use crate::store::{
    ConsolidationProgress, DailySectionsMode, MemoryStore, CONSOLIDATION_REPLY_RESERVE_TOKENS,
    CONSOLIDATION_TOOLCALL_RETRIES,
};

/// OpenAI-format schema for the single consolidation tool.
pub fn save_memory_tool() -> Vec<Value> {
    vec![json!({
        "type": "function",
        "function": {
            "name": "save_memory",
            "description": "Save the memory consolidation result to persistent storage.",
            "parameters": {
                "type": "object",
                "properties": {
                    "history_entry": {
                        "type": "string",
                        "description": "A paragraph (2-5 sentences) summarizing key events/decisions/topics. \
                                        Start with [YYYY-MM-DD HH:MM]. Include detail useful for grep search.",
                    },
                    "memory_update": {
                        "type": "string",
                        "description": "Full updated long-term memory as markdown. Include all existing \
                                        facts plus new ones. Return unchanged if nothing new.",
                    },
                    "daily_sections": {
                        "type": "object",
                        "description": "Optional structured daily memory bullets for daily log sections.",
                        "properties": {
                            "topics": {"type": "array", "items": {"type": "string"}},
                            "decisions": {"type": "array", "items": {"type": "string"}},
                            "tool_activity": {"type": "array", "items": {"type": "string"}},
                            "open_questions": {"type": "array", "items": {"type": "string"}},
                        },
                    },
                },
                "required": ["history_entry", "memory_update"],
            },
        },
    })]
}

#[derive(Debug)]
struct ConsolidationScope {
    snapshot_len: usize,
    keep_count: usize,
    old_messages: Vec<ChatMessage>,
    start_index: usize,
    target_last: usize,
    archive_all: bool,
}

#[derive(Debug)]
enum ChunkStatus {
    Processed(usize),
    RetrySmaller(usize),
    Fatal,
}

struct CallMeta {
    preferred_retry_used: bool,
    tool_call_has_daily_sections: bool,
}

impl MemoryStore {
    /// Consolidate old messages into MEMORY.md + HISTORY.md + daily files.
    ///
    /// Returns `true` on success (including no-op). In incremental mode at
    /// most one chunk is processed per call; `archive_all` loops until the
    /// whole scope is summarized and then resets `last_consolidated` to 0.
    pub async fn consolidate(
        &self,
        session: &mut Session,
        provider: &dyn ChatProvider,
        model: &str,
        archive_all: bool,
        memory_window: usize,
    ) -> bool {
        let scope = match self.build_recovery_scope(session, archive_all) {
            Some(scope) => Some(scope),
            None => Self::build_consolidation_scope(session, archive_all, memory_window),
        };
        let Some(scope) = scope else {
            self.clear_progress();
            return true;
        };

        let mut progress = ConsolidationProgress {
            version: 1,
            updated_at: Local::now().format("%Y-%m-%dT%H:%M:%S").to_string(),
            session_key: session.key.clone(),
            start_index: scope.start_index,
            target_last: scope.target_last,
            archive_all: scope.archive_all,
            keep_count: scope.keep_count,
            snapshot_len: scope.snapshot_len,
            processed_count: 0,
        };
        self.write_progress(&progress);

        let mut pending: Vec<ChatMessage> = scope.old_messages.clone();
        let mut processed_count = 0usize;

        while !pending.is_empty() {
            let current_memory = self.read_long_term();
            let mut chunk_len = self.fit_chunk_by_soft_budget(&pending, &current_memory).len();
            if chunk_len == 0 {
                break;
            }

            loop {
                let status = self
                    .process_chunk(session, provider, model, &pending[..chunk_len], &current_memory)
                    .await;
                match status {
                    ChunkStatus::RetrySmaller(next_len) => {
                        chunk_len = next_len.max(1);
                        continue;
                    }
                    ChunkStatus::Fatal => return false,
                    ChunkStatus::Processed(n) => {
                        processed_count += n;
                        progress.processed_count = processed_count;
                        progress.updated_at =
                            Local::now().format("%Y-%m-%dT%H:%M:%S").to_string();
                        self.write_progress(&progress);
                        pending.drain(..n);
                        if !scope.archive_all {
                            // One chunk per incremental pass keeps latency bounded.
                            session.last_consolidated = scope
                                .target_last
                                .min(scope.start_index + processed_count);
                            info!(
                                snapshot_len = scope.snapshot_len,
                                last_consolidated = session.last_consolidated,
                                processed_messages = processed_count,
                                partial = session.last_consolidated < scope.target_last,
                                "memory consolidation done"
                            );
                            self.clear_progress();
                            return true;
                        }
                        break;
                    }
                }
            }
        }

        if scope.archive_all {
            session.last_consolidated = 0;
        } else {
            session.last_consolidated = scope.target_last.min(scope.start_index + processed_count);
        }
        info!(
            snapshot_len = scope.snapshot_len,
            last_consolidated = session.last_consolidated,
            processed_messages = processed_count,
            "memory consolidation done"
        );
        self.clear_progress();
        true
    }

    /// Resume scope from a matching progress marker, clearing stale markers.
    fn build_recovery_scope(
        &self,
        session: &Session,
        archive_all: bool,
    ) -> Option<ConsolidationScope> {
        let progress = self.read_progress()?;
        if progress.session_key.is_empty() || progress.session_key != session.key {
            return None;
        }
        if progress.archive_all != archive_all {
            // Caller changed mode; ignore stale progress for safety.
            return None;
        }

        let start_index = progress.start_index + progress.processed_count;
        let target_last = progress.target_last;
        let snapshot_len = session.messages.len();
        if snapshot_len <= start_index || target_last <= start_index {
            self.clear_progress();
            return None;
        }
        let end_index = snapshot_len.min(target_last);
        let old_messages = session.messages[start_index..end_index].to_vec();
        if old_messages.is_empty() {
            self.clear_progress();
            return None;
        }
        info!(
            start_index,
            target_last,
            recover_count = old_messages.len(),
            archive_all,
            "memory consolidation recovery scope loaded"
        );
        Some(ConsolidationScope {
            snapshot_len,
            keep_count: progress.keep_count,
            old_messages,
            start_index,
            target_last,
            archive_all,
        })
    }

    /// Snapshot the session length once so concurrent appends cannot shift
    /// chunk boundaries mid-run.
    fn build_consolidation_scope(
        session: &Session,
        archive_all: bool,
        memory_window: usize,
    ) -> Option<ConsolidationScope> {
        let snapshot_len = session.messages.len();
        if archive_all {
            info!(message_count = snapshot_len, "memory consolidation (archive_all)");
            return Some(ConsolidationScope {
                snapshot_len,
                keep_count: 0,
                old_messages: session.messages[..snapshot_len].to_vec(),
                start_index: session.last_consolidated,
                target_last: 0,
                archive_all: true,
            });
        }

        let keep_count = memory_window / 2;
        if snapshot_len <= keep_count {
            return None;
        }
        if snapshot_len <= session.last_consolidated {
            return None;
        }
        let old_messages =
            session.messages[session.last_consolidated..snapshot_len - keep_count].to_vec();
        if old_messages.is_empty() {
            return None;
        }
        info!(
            to_consolidate = old_messages.len(),
            keep = keep_count,
            "memory consolidation"
        );
        Some(ConsolidationScope {
            snapshot_len,
            keep_count,
            old_messages,
            start_index: session.last_consolidated,
            target_last: snapshot_len - keep_count,
            archive_all: false,
        })
    }

    async fn process_chunk(
        &self,
        session: &Session,
        provider: &dyn ChatProvider,
        model: &str,
        chunk: &[ChatMessage],
        current_memory: &str,
    ) -> ChunkStatus {
        let lines = Self::format_consolidation_lines(chunk);
        if lines.is_empty() {
            // Nothing useful to summarize; just mark the messages processed.
            return ChunkStatus::Processed(chunk.len());
        }
        let (prompt_memory, memory_truncated) =
            self.fit_memory_context_by_soft_budget(current_memory, &lines);
        if memory_truncated {
            warn!(
                memory_chars = current_memory.len(),
                prompt_memory_chars = prompt_memory.len(),
                chunk_messages = chunk.len(),
                "consolidation prompt truncating long-term memory context"
            );
        }
        let prompt = Self::build_consolidation_prompt(&prompt_memory, &lines);

        let (response, call_meta) = self.call_consolidation_llm(provider, model, &prompt).await;

        if response.finish_reason == "error"
            && is_context_length_error(response.content.as_deref().unwrap_or(""))
        {
            if chunk.len() <= 1 {
                warn!("memory consolidation failed: prompt exceeds context even for single message");
                return ChunkStatus::Fatal;
            }
            return ChunkStatus::RetrySmaller((chunk.len() / 2).max(1));
        }

        if !response.has_tool_calls() {
            if response.finish_reason == "error" {
                warn!(
                    error = response.content.as_deref().unwrap_or("(empty)"),
                    "memory consolidation LLM call failed"
                );
            } else {
                warn!("memory consolidation: LLM did not call save_memory, skipping");
            }
            return ChunkStatus::Fatal;
        }

        let args = response.tool_calls[0].arguments.clone();
        self.apply_save_memory(
            &session.key,
            &args,
            current_memory,
            memory_truncated,
            &call_meta,
        );
        ChunkStatus::Processed(chunk.len())
    }

    /// One provider call, retried once with a stricter system prompt when
    /// the response is missing the required tool payload.
    async fn call_consolidation_llm(
        &self,
        provider: &dyn ChatProvider,
        model: &str,
        prompt: &str,
    ) -> (ChatResponse, CallMeta) {
        let tools = save_memory_tool();
        let opts = nanobot_model::provider::ChatOptions {
            model: model.to_string(),
            max_tokens: CONSOLIDATION_REPLY_RESERVE_TOKENS as u32,
            temperature: 0.0,
        };
        let require_daily = self.daily_sections_mode.requires_daily_sections();

        let mut response = ChatResponse::error("Error calling LLM: no attempt made");
        let mut preferred_retry_used = false;
        let mut has_daily_sections = false;
        for attempt in 0..=CONSOLIDATION_TOOLCALL_RETRIES {
            let strict = attempt > 0;
            let messages = vec![
                ChatMessage::system(Self::consolidation_system_prompt(strict)),
                ChatMessage::user(prompt),
            ];
            response = match provider.chat(&messages, Some(&tools), &opts).await {
                Ok(r) => r,
                Err(e) => ChatResponse::error(format!("Error calling LLM: {e}")),
            };

            has_daily_sections = tool_call_has_daily_sections(&response);
            if response.has_tool_calls() && (!require_daily || has_daily_sections) {
                break;
            }
            if response.finish_reason == "error" {
                break;
            }
            if attempt < CONSOLIDATION_TOOLCALL_RETRIES {
                warn!(
                    retry = attempt + 1,
                    has_tool_calls = response.has_tool_calls(),
                    has_daily_sections,
                    "consolidation response missing required tool payload, retrying"
                );
                preferred_retry_used = true;
            }
        }
        (
            response,
            CallMeta {
                preferred_retry_used,
                tool_call_has_daily_sections: has_daily_sections,
            },
        )
    }

    /// Apply one `save_memory` tool call: history append, daily routing,
    /// then the sanitize → merge → guard → conflict → write pipeline.
    fn apply_save_memory(
        &self,
        session_key: &str,
        args: &serde_json::Map<String, Value>,
        current_memory: &str,
        memory_truncated: bool,
        call_meta: &CallMeta,
    ) {
        self.step_history_and_daily(session_key, args, call_meta);
        self.step_memory_update(session_key, args, current_memory, memory_truncated);
    }

    fn step_history_and_daily(
        &self,
        session_key: &str,
        args: &serde_json::Map<String, Value>,
        call_meta: &CallMeta,
    ) {
        let (entry_text, entry_reason) = Self::normalize_history_entry(args.get("history_entry"));
        let Some(entry_text) = entry_text else {
            warn!(reason = entry_reason, "skipped history_entry due to quality gate");
            return;
        };

        if let Err(e) = self.append_history(&entry_text) {
            warn!(error = %e, "failed to append history entry");
            return;
        }
        let date_str = Self::history_entry_date(&entry_text);
        let raw_daily_sections = args.get("daily_sections");
        let plan = routing::resolve_daily_routing(
            &entry_text,
            raw_daily_sections,
            self.daily_sections_mode,
        );
        let (_, structured_ok, details) =
            self.append_daily_sections(&date_str, plan.sections_payload.as_ref());

        let mut structured_source = plan.structured_source.clone();
        if !structured_ok {
            if self.daily_sections_mode == DailySectionsMode::Required {
                warn!(
                    date = %date_str,
                    reason = %details.reason,
                    "daily structured write required; skipping unstructured fallback"
                );
            } else {
                structured_source = "fallback_unstructured".into();
                self.append_daily_history_entry(&entry_text);
            }
        }

        self.append_daily_routing_metric(
            session_key,
            &date_str,
            structured_ok,
            &details.reason,
            &details,
            &structured_source,
            plan.model_daily_sections_ok,
            &plan.model_daily_sections_reason,
            call_meta.preferred_retry_used,
            call_meta.tool_call_has_daily_sections,
        );
    }

    fn step_memory_update(
        &self,
        session_key: &str,
        args: &serde_json::Map<String, Value>,
        current_memory: &str,
        memory_truncated: bool,
    ) {
        let Some(update_raw) = args.get("memory_update") else {
            return;
        };
        let update = match update_raw {
            Value::String(s) => s.clone(),
            Value::Null => return,
            other => other.to_string(),
        };
        if update.is_empty() {
            return;
        }

        let (update, sanitize_details) = guard::sanitize_memory_update(&update, current_memory);
        let sanitize_changes = sanitize_details.change_count();
        if sanitize_changes > 0 {
            warn!(
                removed_sections = ?sanitize_details.removed_sections,
                removed_transient_status_line_count =
                    sanitize_details.removed_transient_status_line_count,
                removed_duplicate_bullet_count = sanitize_details.removed_duplicate_bullet_count,
                "sanitized long-term memory update"
            );
            self.append_sanitize_metric(session_key, &sanitize_details);
        }

        if memory_truncated {
            // The model only saw a truncated MEMORY.md; writing its candidate
            // back would destroy the parts it never saw.
            warn!(
                current_memory_chars = current_memory.len(),
                returned_memory_chars = update.len(),
                "skipping memory_update write because long-term memory context was truncated"
            );
            self.append_outcome_metric(session_key, "truncated_skip", None, sanitize_changes, false, 0);
            return;
        }

        let (update, merge_applied) =
            Self::merge_memory_update_with_current(current_memory, &update);

        if update == current_memory {
            self.append_outcome_metric(session_key, "no_change", None, sanitize_changes, merge_applied, 0);
            return;
        }

        if let Some(reason) = guard::memory_update_guard_reason(current_memory, &update) {
            warn!(
                reason,
                current_memory_chars = current_memory.len(),
                returned_memory_chars = update.len(),
                "skipping memory_update write due to guard"
            );
            self.append_guard_metric(
                session_key,
                reason,
                current_memory.len(),
                update.len(),
                &guard::truncate_log_sample(&update),
            );
            self.append_outcome_metric(
                session_key,
                "guard_rejected",
                Some(reason),
                sanitize_changes,
                merge_applied,
                0,
            );
            return;
        }

        let conflicts = self.detect_preference_conflicts(current_memory, &update);
        let resolution = self.preference_conflict_strategy;
        for conflict in &conflicts {
            warn!(
                key = %conflict.key,
                old_value = %conflict.old_value,
                new_value = %conflict.new_value,
                resolution = resolution.as_str(),
                "memory preference conflict detected"
            );
            self.append_conflict_metric(session_key, conflict, resolution.as_str());
        }
        if !conflicts.is_empty() && resolution.rejects_write() {
            let reason = format!("preference_conflict_{}", resolution.as_str());
            self.append_outcome_metric(
                session_key,
                "guard_rejected",
                Some(&reason),
                sanitize_changes,
                merge_applied,
                conflicts.len(),
            );
            return;
        }

        if let Err(e) = self.write_long_term(&update) {
            warn!(error = %e, "failed to write long-term memory");
            return;
        }
        let outcome = if sanitize_changes > 0 {
            "sanitize_modified"
        } else {
            "written"
        };
        self.append_outcome_metric(
            session_key,
            outcome,
            None,
            sanitize_changes,
            merge_applied,
            conflicts.len(),
        );
    }
}

fn tool_call_has_daily_sections(response: &ChatResponse) -> bool {
    response
        .tool_calls
        .first()
        .and_then(|tc| tc.arguments.get("daily_sections"))
        .is_some_and(|v| !v.is_null())
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use nanobot_model::mock::{text_response, tool_call_response, ScriptedProvider};
    use serde_json::json;

    fn store() -> (tempfile::TempDir, MemoryStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = MemoryStore::new(dir.path()).unwrap();
        (dir, store)
    }

    fn session_with_messages(count: usize) -> Session {
        let mut session = Session::new("telegram:42");
        for i in 0..count {
            let mut m = ChatMessage::user(format!("user message number {i}"));
            m.timestamp = Some("2026-03-01T10:00:00".into());
            session.messages.push(m);
        }
        session
    }

    fn save_memory_response(history_entry: &str, memory_update: &str) -> nanobot_model::ChatResponse {
        tool_call_response(
            "call_1",
            "save_memory",
            json!({
                "history_entry": history_entry,
                "memory_update": memory_update,
                "daily_sections": {"topics": ["talked about tests"]},
            }),
        )
    }

    #[tokio::test]
    async fn small_session_is_a_noop_success() {
        let (_dir, store) = store();
        let provider = ScriptedProvider::new(vec![]);
        let mut session = session_with_messages(10);
        let ok = store.consolidate(&mut session, &provider, "m", false, 100).await;
        assert!(ok);
        assert_eq!(session.last_consolidated, 0);
        assert_eq!(provider.calls_made(), 0);
        assert!(!store.progress_file_exists());
    }

    #[tokio::test]
    async fn incremental_consolidation_advances_watermark_and_writes_files() {
        let (_dir, store) = store();
        let provider = ScriptedProvider::new(vec![save_memory_response(
            "[2026-03-01 10:00] Summarized a long chat about tests.",
            "## Facts\n- user writes rust tests\n",
        )]);
        let mut session = session_with_messages(12);
        let ok = store.consolidate(&mut session, &provider, "m", false, 10).await;
        assert!(ok);
        // keep = 5, target_last = 7; the whole scope fits one chunk.
        assert_eq!(session.last_consolidated, 7);
        assert!(store.read_history().contains("Summarized a long chat"));
        assert!(store.read_long_term().contains("user writes rust tests"));
        assert!(!store.progress_file_exists(), "marker cleared on clean exit");
    }

    #[tokio::test]
    async fn plain_text_response_fails_without_advancing() {
        let (_dir, store) = store();
        // Both the initial call and the strict retry return plain text.
        let provider = ScriptedProvider::new(vec![
            text_response("I refuse to call tools"),
            text_response("still refusing"),
        ]);
        let mut session = session_with_messages(12);
        let ok = store.consolidate(&mut session, &provider, "m", false, 10).await;
        assert!(!ok);
        assert_eq!(session.last_consolidated, 0);
        assert_eq!(store.read_long_term(), "");
        assert_eq!(provider.calls_made(), 2, "one strict retry");
    }

    #[tokio::test]
    async fn context_overflow_halves_chunk_and_still_advances() {
        let (_dir, store) = store();
        let provider = ScriptedProvider::new(vec![
            nanobot_model::ChatResponse::error(
                "This model's maximum context length is 8192 tokens",
            ),
            save_memory_response(
                "[2026-03-01 10:00] Partial consolidation after halving.",
                "## Facts\n- halved chunk\n",
            ),
        ]);
        let mut session = session_with_messages(20);
        let ok = store.consolidate(&mut session, &provider, "m", false, 10).await;
        assert!(ok);
        // scope = [0, 15); first chunk (15 msgs) overflows, halved to 7.
        assert!(session.last_consolidated > 0);
        assert!(session.last_consolidated < 15);
        assert!(!store.progress_file_exists());
    }

    #[tokio::test]
    async fn single_message_overflow_is_fatal() {
        let (_dir, store) = store();
        // Every response is a context error; with repeated halving the chunk
        // reaches one message and the run must fail.
        let provider = ScriptedProvider::new(
            (0..16)
                .map(|_| {
                    nanobot_model::ChatResponse::error("prompt exceeds maximum context length")
                })
                .collect(),
        );
        let mut session = session_with_messages(12);
        let ok = store.consolidate(&mut session, &provider, "m", false, 10).await;
        assert!(!ok);
        assert_eq!(session.last_consolidated, 0);
    }

    #[tokio::test]
    async fn archive_all_processes_everything_and_resets_watermark() {
        let (_dir, store) = store();
        let provider = ScriptedProvider::new(vec![save_memory_response(
            "[2026-03-01 10:00] Archived the whole session before reset.",
            "## Facts\n- archived\n",
        )]);
        let mut session = session_with_messages(8);
        session.last_consolidated = 3;
        let ok = store.consolidate(&mut session, &provider, "m", true, 10).await;
        assert!(ok);
        assert_eq!(session.last_consolidated, 0);
        assert!(store.read_history().contains("Archived the whole session"));
    }

    #[tokio::test]
    async fn recovery_scope_resumes_from_marker() {
        let (_dir, store) = store();
        store.write_progress(&ConsolidationProgress {
            version: 1,
            updated_at: "2026-03-01T10:00:00".into(),
            session_key: "telegram:42".into(),
            start_index: 0,
            target_last: 7,
            archive_all: false,
            keep_count: 5,
            snapshot_len: 12,
            processed_count: 4,
        });
        let provider = ScriptedProvider::new(vec![save_memory_response(
            "[2026-03-01 10:05] Resumed consolidation tail.",
            "## Facts\n- resumed\n",
        )]);
        let mut session = session_with_messages(12);
        let ok = store.consolidate(&mut session, &provider, "m", false, 10).await;
        assert!(ok);
        // Recovery processed messages [4,7); watermark lands on target.
        assert_eq!(session.last_consolidated, 7);
        // The provider prompt must contain only the recovered tail.
        let requests = provider.requests.lock().unwrap();
        let prompt = requests[0].0[1].text();
        assert!(prompt.contains("user message number 4"));
        assert!(!prompt.contains("user message number 3"));
    }

    #[tokio::test]
    async fn mismatched_marker_is_cleared_and_ignored() {
        let (_dir, store) = store();
        store.write_progress(&ConsolidationProgress {
            version: 1,
            updated_at: "t".into(),
            session_key: "other:1".into(),
            start_index: 0,
            target_last: 7,
            archive_all: false,
            keep_count: 5,
            snapshot_len: 12,
            processed_count: 4,
        });
        let provider = ScriptedProvider::new(vec![save_memory_response(
            "[2026-03-01 10:00] Fresh scope.",
            "## Facts\n- fresh\n",
        )]);
        let mut session = session_with_messages(12);
        let ok = store.consolidate(&mut session, &provider, "m", false, 10).await;
        assert!(ok);
        let requests = provider.requests.lock().unwrap();
        let prompt = requests[0].0[1].text();
        assert!(prompt.contains("user message number 0"), "fresh scope from 0");
    }

    #[tokio::test]
    async fn guard_rejection_leaves_memory_untouched_and_records_metric() {
        let (dir, store) = store();
        let current = format!("## One\n{}\n## Two\n- b\n", "- a\n".repeat(40));
        store.write_long_term(&current).unwrap();
        // Unstructured candidate, long enough to trip the guard.
        let candidate = "just one long unstructured paragraph without any markdown markers that keeps going for a while to pass the length threshold".to_string();
        let provider = ScriptedProvider::new(vec![tool_call_response(
            "c1",
            "save_memory",
            json!({
                "history_entry": "[2026-03-01 10:00] Guarded update attempt.",
                "memory_update": candidate,
            }),
        )]);
        let mut session = session_with_messages(12);
        let ok = store.consolidate(&mut session, &provider, "m", false, 10).await;
        assert!(ok, "guard rejection still advances consolidation");
        assert!(session.last_consolidated > 0);
        assert_eq!(store.read_long_term(), current, "MEMORY.md unchanged");
        let guard_metrics = std::fs::read_to_string(
            dir.path()
                .join("memory")
                .join("observability")
                .join("memory-update-guard-metrics.jsonl"),
        )
        .unwrap();
        let row: Value = serde_json::from_str(guard_metrics.lines().next().unwrap()).unwrap();
        assert!(
            row["reason"] == "excessive_shrink" || row["reason"] == "unstructured_candidate",
            "{row}"
        );
    }

    #[tokio::test]
    async fn invalid_history_entry_skips_daily_but_memory_update_applies() {
        let (_dir, store) = store();
        let provider = ScriptedProvider::new(vec![tool_call_response(
            "c1",
            "save_memory",
            json!({
                "history_entry": "has a ``` fence so it is rejected",
                "memory_update": "## Facts\n- still written\n",
            }),
        )]);
        let mut session = session_with_messages(12);
        let ok = store.consolidate(&mut session, &provider, "m", false, 10).await;
        assert!(ok);
        assert_eq!(store.read_history(), "", "history skipped");
        assert!(store.read_long_term().contains("still written"));
    }

    #[tokio::test]
    async fn keep_old_strategy_rejects_conflicting_write() {
        let (_dir, store) = store();
        let store = store.with_policies("compatible", "keep_old", &["language".to_string()]);
        store
            .write_long_term("## Preferences\n- language: English\n")
            .unwrap();
        let provider = ScriptedProvider::new(vec![tool_call_response(
            "c1",
            "save_memory",
            json!({
                "history_entry": "[2026-03-01 10:00] Preference change request.",
                "memory_update": "## Preferences\n- language: Deutsch\n",
            }),
        )]);
        let mut session = session_with_messages(12);
        assert!(store.consolidate(&mut session, &provider, "m", false, 10).await);
        assert!(store.read_long_term().contains("English"), "old value kept");
    }
}
