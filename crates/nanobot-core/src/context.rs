// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Prompt assembly under a hard token budget.
//!
//! History passes through a fixed compaction pipeline (sliding window,
//! error-echo removal, truncation, dedup, same-role collapse) and is then
//! packed backward in user-anchored chunks until the budget is full.
//! Tool-protocol messages are never merged, deduplicated, or split from
//! their assistant anchor.

use std::path::{Path, PathBuf};

use chrono::Local;
use tracing::warn;

use nanobot_memory::MemoryStore;
use nanobot_model::{ChatMessage, ContentBlock, MessageContent, Role};
use nanobot_tools::tool::required_params;
use nanobot_tools::{ToolCapability, ToolRegistry};

/// Reserved for the model reply when budgeting history.
pub const REPLY_RESERVE_TOKENS: usize = 4096;
/// Sliding window: number of most recent user turns kept before budgeting.
const MAX_HISTORY_TURNS: usize = 20;
const ASSISTANT_SUMMARY_CHARS: usize = 300;
const ERROR_PREFIXES: &[&str] = &["Error calling LLM:", "error:", "Error:"];

/// In-loop guard caps for current-turn messages.
const IN_LOOP_TOOL_RESULT_MAX_CHARS: usize = 4000;
const IN_LOOP_ASSISTANT_TEXT_MAX_CHARS: usize = 1000;
/// Aggressive-compaction caps applied after a context overflow.
const AGGRESSIVE_TOOL_RESULT_MAX_CHARS: usize = 1000;
const AGGRESSIVE_ASSISTANT_TEXT_MAX_CHARS: usize = 400;

/// Catalog switches to compact mode past either threshold.
const CATALOG_COMPACT_TOOL_COUNT: usize = 12;
const CATALOG_COMPACT_TOTAL_CHARS: usize = 2400;

/// Token count for plain text: chars/4 with a floor of one for non-empty
/// strings (BPE-free estimate).
pub fn count_tokens(text: &str) -> usize {
    if text.is_empty() {
        0
    } else {
        (text.len() / 4).max(1)
    }
}

/// Builds the message list sent to the LLM.
pub struct ContextBuilder {
    workspace: PathBuf,
    max_context_tokens: usize,
}

impl ContextBuilder {
    pub fn new(workspace: &Path, max_context_tokens: usize) -> Self {
        Self {
            workspace: workspace.to_path_buf(),
            max_context_tokens,
        }
    }

    pub fn max_context_tokens(&self) -> usize {
        self.max_context_tokens
    }

    // ── Token estimation ──────────────────────────────────────────────────────

    /// Estimate tokens for one message: content text, protocol keys, and
    /// every tool_calls entry. Image blocks count as `len(url)/4`.
    pub fn estimate_message_tokens(msg: &ChatMessage) -> usize {
        let mut total = 0usize;
        match &msg.content {
            MessageContent::Text(t) => total += count_tokens(t),
            MessageContent::Blocks(blocks) => {
                for block in blocks {
                    match block {
                        ContentBlock::Text { text } => total += count_tokens(text),
                        ContentBlock::ImageUrl { image_url } => {
                            total += (image_url.url.len() / 4).max(1);
                        }
                    }
                }
            }
            MessageContent::Null => {}
        }
        if let Some(id) = &msg.tool_call_id {
            total += count_tokens(id);
        }
        if let Some(name) = &msg.name {
            total += count_tokens(name);
        }
        if let Some(tool_calls) = &msg.tool_calls {
            for tc in tool_calls {
                total += count_tokens(&tc.id);
                total += count_tokens(&tc.kind);
                total += count_tokens(&tc.function.name);
                total += count_tokens(&tc.function.arguments);
            }
        }
        total
    }

    fn estimate_total(messages: &[ChatMessage]) -> usize {
        messages.iter().map(Self::estimate_message_tokens).sum()
    }

    // ── Compaction pipeline ───────────────────────────────────────────────────

    fn can_dedupe(msg: &ChatMessage) -> bool {
        match msg.role {
            Role::User => true,
            Role::Assistant => !msg.is_tool_protocol(),
            _ => false,
        }
    }

    fn can_merge_assistants(prev: &ChatMessage, curr: &ChatMessage) -> bool {
        prev.role == Role::Assistant
            && curr.role == Role::Assistant
            && !prev.is_tool_protocol()
            && !curr.is_tool_protocol()
            && matches!(prev.content, MessageContent::Text(_))
            && matches!(curr.content, MessageContent::Text(_))
    }

    fn drop_leading_non_user(history: Vec<ChatMessage>) -> Vec<ChatMessage> {
        match history.iter().position(|m| m.role == Role::User) {
            Some(idx) => history.into_iter().skip(idx).collect(),
            None => Vec::new(),
        }
    }

    /// Split history into chunks anchored at user messages, so trimming can
    /// only drop whole turns and never break tool-call pairing.
    fn split_history_chunks(history: Vec<ChatMessage>) -> Vec<Vec<ChatMessage>> {
        let mut chunks: Vec<Vec<ChatMessage>> = Vec::new();
        let mut current: Vec<ChatMessage> = Vec::new();
        for msg in history {
            if msg.role == Role::User && !current.is_empty() {
                chunks.push(std::mem::take(&mut current));
            }
            current.push(msg);
        }
        if !current.is_empty() {
            chunks.push(current);
        }
        chunks
    }

    /// The fixed compaction pipeline applied before budgeting.
    pub fn compact_history(&self, history: Vec<ChatMessage>) -> Vec<ChatMessage> {
        if history.is_empty() {
            return history;
        }

        // 0. Sliding window over the last N user turns.
        let user_indices: Vec<usize> = history
            .iter()
            .enumerate()
            .filter(|(_, m)| m.role == Role::User)
            .map(|(i, _)| i)
            .collect();
        let history: Vec<ChatMessage> = if user_indices.len() > MAX_HISTORY_TURNS {
            let start = user_indices[user_indices.len() - MAX_HISTORY_TURNS];
            history.into_iter().skip(start).collect()
        } else {
            history
        };

        // 1. Drop assistant plain-text messages that merely echo errors.
        let cleaned: Vec<ChatMessage> = history
            .into_iter()
            .filter(|m| {
                !(m.role == Role::Assistant
                    && !m.is_tool_protocol()
                    && ERROR_PREFIXES.iter().any(|p| m.text().starts_with(p)))
            })
            .collect();

        // 2. Truncate long plain assistant replies to summary length.
        let truncated: Vec<ChatMessage> = cleaned
            .into_iter()
            .map(|mut m| {
                if m.role == Role::Assistant && !m.is_tool_protocol() {
                    if let MessageContent::Text(text) = &m.content {
                        if text.len() > ASSISTANT_SUMMARY_CHARS {
                            m.content = MessageContent::Text(truncate_with_notice(
                                text,
                                ASSISTANT_SUMMARY_CHARS,
                            ));
                        }
                    }
                }
                m
            })
            .collect();

        // 3. Deduplicate consecutive identical plain-text messages.
        let mut deduped: Vec<ChatMessage> = Vec::with_capacity(truncated.len());
        for m in truncated {
            if let Some(prev) = deduped.last() {
                if prev.role == m.role
                    && Self::can_dedupe(prev)
                    && Self::can_dedupe(&m)
                    && prev.text() == m.text()
                {
                    continue;
                }
            }
            deduped.push(m);
        }

        // 4. Collapse same-role runs: keep only the last of consecutive user
        //    messages (earlier ones were never answered), merge consecutive
        //    plain assistant messages.
        let mut merged: Vec<ChatMessage> = Vec::with_capacity(deduped.len());
        for m in deduped {
            let same_role = merged.last().is_some_and(|prev| prev.role == m.role);
            if same_role {
                if m.role == Role::User {
                    *merged.last_mut().unwrap() = m;
                    continue;
                }
                let prev = merged.last().unwrap();
                if Self::can_merge_assistants(prev, &m) {
                    let combined = format!("{}\n{}", prev.text(), m.text());
                    merged.last_mut().unwrap().content = MessageContent::Text(combined);
                    continue;
                }
            }
            merged.push(m);
        }

        // 5. Drop malformed leading history until the first user message.
        Self::drop_leading_non_user(merged)
    }

    /// Trim history to the budget by whole user-anchored chunks, packed from
    /// the most recent backward.
    pub fn trim_history(&self, history: Vec<ChatMessage>, budget_tokens: usize) -> Vec<ChatMessage> {
        if history.is_empty() || budget_tokens == 0 {
            return Vec::new();
        }
        let history = Self::drop_leading_non_user(history);
        if history.is_empty() {
            return Vec::new();
        }
        if Self::estimate_total(&history) <= budget_tokens {
            return history;
        }

        let chunks = Self::split_history_chunks(history);
        let mut kept_reversed: Vec<Vec<ChatMessage>> = Vec::new();
        let mut kept_total = 0usize;
        for chunk in chunks.into_iter().rev() {
            let chunk_tokens = Self::estimate_total(&chunk);
            if kept_total + chunk_tokens > budget_tokens {
                break;
            }
            kept_total += chunk_tokens;
            kept_reversed.push(chunk);
        }
        kept_reversed.into_iter().rev().flatten().collect()
    }

    // ── System prompt ─────────────────────────────────────────────────────────

    /// The stable block: identity, guidelines, and the tool catalog. Marked
    /// cacheable by providers that support prompt caching.
    fn static_system_block(&self, tools: &ToolRegistry) -> String {
        let workspace = self.workspace.display();
        let catalog = render_tool_catalog(tools);
        format!(
            "# nanobot\n\n\
             You are nanobot, a helpful AI assistant.\n\n\
             ## Workspace\n\
             Your workspace is at: {workspace}\n\
             - Long-term memory: {workspace}/memory/MEMORY.md\n\
             - History log: {workspace}/memory/HISTORY.md (grep-searchable)\n\n\
             Reply directly with text for conversations. Only use the 'message' tool to send \
             to a specific chat channel.\n\n\
             ## Tool Call Guidelines\n\
             - Before calling tools, you may briefly state your intent, but NEVER predict or \
             describe the expected result before receiving it.\n\
             - Before modifying a file, read it first to confirm its current content.\n\
             - Do not assume a file or directory exists - use list_dir or read_file to verify.\n\
             - After writing or editing a file, re-read it if accuracy matters.\n\
             - If a tool call fails, analyze the error before retrying with a different approach.\n\n\
             {catalog}\n\n\
             ## Memory\n\
             - Remember important facts: write to {workspace}/memory/MEMORY.md\n\
             - Recall past events: grep {workspace}/memory/HISTORY.md"
        )
    }

    /// The volatile block: current time, memory snippet, session routing.
    /// Never cached.
    fn dynamic_system_block(
        &self,
        memory: &MemoryStore,
        channel: Option<&str>,
        chat_id: Option<&str>,
    ) -> String {
        let now = Local::now().format("%Y-%m-%d %H:%M (%A)");
        let mut parts = vec![format!("## Current Time\n{now}")];
        let memory_context = memory.memory_context();
        if !memory_context.is_empty() {
            parts.push(format!("# Memory\n\n{memory_context}"));
        }
        let recent = memory.recent_daily_context(7, 12, 1200, false);
        if !recent.is_empty() {
            parts.push(format!("## Recent Days\n{recent}"));
        }
        if let (Some(channel), Some(chat_id)) = (channel, chat_id) {
            parts.push(format!(
                "## Current Session\nChannel: {channel}\nChat ID: {chat_id}"
            ));
        }
        parts.join("\n\n")
    }

    /// The system message as [static, dynamic] text blocks so the provider
    /// can cache the static prefix.
    pub fn system_message(
        &self,
        tools: &ToolRegistry,
        memory: &MemoryStore,
        channel: Option<&str>,
        chat_id: Option<&str>,
    ) -> ChatMessage {
        ChatMessage::system(MessageContent::Blocks(vec![
            ContentBlock::text(self.static_system_block(tools)),
            ContentBlock::text(self.dynamic_system_block(memory, channel, chat_id)),
        ]))
    }

    // ── Current message with media ────────────────────────────────────────────

    /// Build the current user content, compressing image attachments into
    /// data-URL blocks. Unreadable or non-image files are skipped.
    pub fn build_user_content(&self, text: &str, media: &[String]) -> MessageContent {
        if media.is_empty() {
            return MessageContent::Text(text.to_string());
        }
        let mut blocks: Vec<ContentBlock> = Vec::new();
        for path in media {
            match nanobot_image::compress_image(Path::new(path)) {
                Ok(encoded) => blocks.push(ContentBlock::image(encoded.into_data_url())),
                Err(e) => {
                    warn!(path = %path, error = %e, "dropping media attachment");
                }
            }
        }
        if blocks.is_empty() {
            return MessageContent::Text(text.to_string());
        }
        blocks.push(ContentBlock::text(text));
        MessageContent::Blocks(blocks)
    }

    // ── Full assembly ─────────────────────────────────────────────────────────

    /// Build the complete message list for an LLM call.
    pub fn build_messages(
        &self,
        history: Vec<ChatMessage>,
        current_message: &str,
        media: &[String],
        tools: &ToolRegistry,
        memory: &MemoryStore,
        channel: Option<&str>,
        chat_id: Option<&str>,
    ) -> Vec<ChatMessage> {
        let system = self.system_message(tools, memory, channel, chat_id);
        let user_content = self.build_user_content(current_message, media);
        let current = ChatMessage::user(user_content);

        let budget = self
            .max_context_tokens
            .saturating_sub(Self::estimate_message_tokens(&system))
            .saturating_sub(Self::estimate_message_tokens(&current))
            .saturating_sub(REPLY_RESERVE_TOKENS);

        let compacted = self.compact_history(history);
        let mut trimmed = self.trim_history(compacted, budget);

        // A trailing unanswered user message is superseded by the current one.
        if trimmed.last().is_some_and(|m| m.role == Role::User) {
            trimmed.pop();
        }

        let mut messages = Vec::with_capacity(trimmed.len() + 2);
        messages.push(system);
        messages.extend(trimmed);
        messages.push(current);
        messages
    }

    // ── In-loop guard ─────────────────────────────────────────────────────────

    /// Re-budget messages before each LLM iteration.
    ///
    /// The system prefix and the current-turn suffix are preserved intact
    /// (large tool results and assistant texts within the turn may be
    /// truncated in place); the history in between is re-compacted and
    /// trimmed to the remaining budget. `aggressive` halves the budget and
    /// tightens the in-place caps, used once after a context overflow.
    pub fn guard_loop_messages(
        &self,
        messages: Vec<ChatMessage>,
        current_turn_start: usize,
        aggressive: bool,
    ) -> (Vec<ChatMessage>, usize) {
        if messages.is_empty() {
            return (messages, current_turn_start);
        }
        let system_count = usize::from(messages[0].role == Role::System);
        let current_turn_start = current_turn_start.clamp(system_count, messages.len());

        let system_part: Vec<ChatMessage> = messages[..system_count].to_vec();
        let history: Vec<ChatMessage> = messages[system_count..current_turn_start].to_vec();
        let current_turn: Vec<ChatMessage> = messages[current_turn_start..].to_vec();

        let (tool_cap, assistant_cap) = if aggressive {
            (AGGRESSIVE_TOOL_RESULT_MAX_CHARS, AGGRESSIVE_ASSISTANT_TEXT_MAX_CHARS)
        } else {
            (IN_LOOP_TOOL_RESULT_MAX_CHARS, IN_LOOP_ASSISTANT_TEXT_MAX_CHARS)
        };
        let guarded_current: Vec<ChatMessage> = current_turn
            .into_iter()
            .map(|m| truncate_runtime_message(m, tool_cap, assistant_cap))
            .collect();

        let fixed_tokens =
            Self::estimate_total(&system_part) + Self::estimate_total(&guarded_current);
        let max_ctx = if aggressive {
            self.max_context_tokens / 2
        } else {
            self.max_context_tokens
        };
        let history_budget = max_ctx
            .saturating_sub(REPLY_RESERVE_TOKENS)
            .saturating_sub(fixed_tokens);

        let compacted = if history.is_empty() {
            Vec::new()
        } else {
            self.compact_history(history)
        };
        let trimmed = self.trim_history(compacted, history_budget);
        let new_turn_start = system_count + trimmed.len();

        let mut guarded = system_part;
        guarded.extend(trimmed);
        guarded.extend(guarded_current);

        let total = Self::estimate_total(&guarded);
        if total + REPLY_RESERVE_TOKENS > max_ctx {
            warn!(
                total_tokens = total,
                reserve = REPLY_RESERVE_TOKENS,
                max_context_tokens = max_ctx,
                "loop context budget exceeded after guard"
            );
        }
        (guarded, new_turn_start)
    }
}

fn truncate_with_notice(text: &str, cap: usize) -> String {
    let mut cut = cap.min(text.len());
    while !text.is_char_boundary(cut) {
        cut -= 1;
    }
    format!("{}\n... (truncated)", &text[..cut])
}

/// Reduce oversized content in current-turn runtime messages.
fn truncate_runtime_message(
    mut msg: ChatMessage,
    tool_cap: usize,
    assistant_cap: usize,
) -> ChatMessage {
    if let MessageContent::Text(text) = &msg.content {
        let cap = match msg.role {
            Role::Tool if text.len() > tool_cap => Some(tool_cap),
            Role::Assistant
                if msg.tool_calls.as_ref().map_or(true, |tc| tc.is_empty())
                    && text.len() > assistant_cap =>
            {
                Some(assistant_cap)
            }
            _ => None,
        };
        if let Some(cap) = cap {
            msg.content = MessageContent::Text(truncate_with_notice(text, cap));
        }
    }
    msg
}

// ── Tool catalog rendering ────────────────────────────────────────────────────

const CAPABILITY_ORDER: &[ToolCapability] = &[
    ToolCapability::Filesystem,
    ToolCapability::Shell,
    ToolCapability::Web,
    ToolCapability::Messaging,
    ToolCapability::Subagents,
    ToolCapability::Other,
];

/// Preferred in-group ordering; unlisted tools sort alphabetically after.
const PREFERRED_TOOL_ORDER: &[&str] = &[
    "read_file",
    "write_file",
    "edit_file",
    "list_dir",
    "exec",
    "web_search",
    "web_fetch",
    "message",
    "spawn",
];

fn preferred_rank(name: &str) -> usize {
    PREFERRED_TOOL_ORDER
        .iter()
        .position(|n| *n == name)
        .unwrap_or(PREFERRED_TOOL_ORDER.len())
}

/// Render the runtime tool catalog grouped by capability. Falls back to a
/// compact name + required-params listing when the catalog grows large;
/// risk notes appear in full mode only.
fn render_tool_catalog(tools: &ToolRegistry) -> String {
    let all = tools.tools();
    if all.is_empty() {
        return "## Available Tools\n(none registered)".to_string();
    }

    let full_chars: usize = all
        .iter()
        .map(|t| t.name().len() + t.description().len())
        .sum();
    let compact = all.len() > CATALOG_COMPACT_TOOL_COUNT || full_chars > CATALOG_COMPACT_TOTAL_CHARS;

    let mut out = vec!["## Available Tools".to_string()];
    for capability in CAPABILITY_ORDER {
        let mut group: Vec<_> = all
            .iter()
            .filter(|t| t.capability() == *capability)
            .collect();
        if group.is_empty() {
            continue;
        }
        group.sort_by(|a, b| {
            preferred_rank(a.name())
                .cmp(&preferred_rank(b.name()))
                .then_with(|| a.name().cmp(b.name()))
        });

        out.push(format!("\n### {}", capability.label()));
        for tool in group {
            let required = required_params(&tool.parameters_schema());
            let required = if required.is_empty() {
                String::new()
            } else {
                format!("({})", required.join(", "))
            };
            if compact {
                out.push(format!("- {}{required}", tool.name()));
            } else {
                let mut line = format!("- {}{required}: {}", tool.name(), tool.description());
                if let Some(note) = tool.risk_note() {
                    line.push_str(&format!(" [caution: {note}]"));
                }
                out.push(line);
            }
        }
    }
    out.join("\n")
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use nanobot_model::ToolCallRecord;

    fn builder() -> (tempfile::TempDir, ContextBuilder, MemoryStore) {
        let dir = tempfile::tempdir().unwrap();
        let builder = ContextBuilder::new(dir.path(), 30_000);
        let memory = MemoryStore::new(dir.path()).unwrap();
        (dir, builder, memory)
    }

    fn tool_turn(id: &str, text: &str) -> Vec<ChatMessage> {
        vec![
            ChatMessage::assistant_tool_calls(
                None,
                vec![ToolCallRecord::new(id, "exec", "{}".into())],
                None,
            ),
            ChatMessage::tool_result(id, "exec", text),
        ]
    }

    // ── token estimation ──────────────────────────────────────────────────────

    #[test]
    fn count_tokens_floor_and_empty() {
        assert_eq!(count_tokens(""), 0);
        assert_eq!(count_tokens("ab"), 1);
        assert_eq!(count_tokens("12345678"), 2);
    }

    #[test]
    fn message_estimate_includes_tool_call_fields() {
        let msg = ChatMessage::assistant_tool_calls(
            None,
            vec![ToolCallRecord::new(
                "call_123",
                "exec",
                r#"{"command":"echo hi"}"#.into(),
            )],
            None,
        );
        let tokens = ContextBuilder::estimate_message_tokens(&msg);
        // id(2) + type(2) + name(1) + args(5) = 10
        assert_eq!(tokens, 10);
    }

    #[test]
    fn message_estimate_counts_image_urls() {
        let msg = ChatMessage::user(MessageContent::Blocks(vec![
            ContentBlock::image("d".repeat(400)),
            ContentBlock::text("what?"),
        ]));
        assert_eq!(ContextBuilder::estimate_message_tokens(&msg), 100 + 1);
    }

    // ── compaction pipeline ───────────────────────────────────────────────────

    #[test]
    fn sliding_window_keeps_last_n_user_turns() {
        let (_d, builder, _m) = builder();
        let mut history = Vec::new();
        for i in 0..30 {
            history.push(ChatMessage::user(format!("q{i}")));
            history.push(ChatMessage::assistant(format!("a{i}")));
        }
        let compacted = builder.compact_history(history);
        let users: Vec<String> = compacted
            .iter()
            .filter(|m| m.role == Role::User)
            .map(|m| m.text())
            .collect();
        assert_eq!(users.len(), 20);
        assert_eq!(users[0], "q10");
    }

    #[test]
    fn error_echoes_are_dropped() {
        let (_d, builder, _m) = builder();
        let history = vec![
            ChatMessage::user("hi"),
            ChatMessage::assistant("Error calling LLM: boom"),
            ChatMessage::assistant("real answer"),
        ];
        let compacted = builder.compact_history(history);
        assert!(compacted.iter().all(|m| !m.text().contains("boom")));
        assert!(compacted.iter().any(|m| m.text() == "real answer"));
    }

    #[test]
    fn long_assistant_replies_are_truncated() {
        let (_d, builder, _m) = builder();
        let history = vec![
            ChatMessage::user("hi"),
            ChatMessage::assistant("x".repeat(1000)),
        ];
        let compacted = builder.compact_history(history);
        let reply = compacted[1].text();
        assert!(reply.len() < 1000);
        assert!(reply.ends_with("... (truncated)"));
    }

    #[test]
    fn consecutive_identical_messages_dedupe() {
        let (_d, builder, _m) = builder();
        let history = vec![
            ChatMessage::user("hi"),
            ChatMessage::assistant("same"),
            ChatMessage::assistant("same"),
        ];
        let compacted = builder.compact_history(history);
        assert_eq!(compacted.len(), 2);
    }

    #[test]
    fn consecutive_user_messages_keep_only_last() {
        let (_d, builder, _m) = builder();
        let history = vec![
            ChatMessage::user("first question"),
            ChatMessage::user("second question"),
            ChatMessage::assistant("answer"),
        ];
        let compacted = builder.compact_history(history);
        assert_eq!(compacted.len(), 2);
        assert_eq!(compacted[0].text(), "second question");
    }

    #[test]
    fn consecutive_plain_assistants_merge_with_newline() {
        let (_d, builder, _m) = builder();
        let history = vec![
            ChatMessage::user("hi"),
            ChatMessage::assistant("part one"),
            ChatMessage::assistant("part two"),
        ];
        let compacted = builder.compact_history(history);
        assert_eq!(compacted.len(), 2);
        assert_eq!(compacted[1].text(), "part one\npart two");
    }

    #[test]
    fn tool_protocol_messages_are_never_merged_or_deduped() {
        let (_d, builder, _m) = builder();
        let mut history = vec![ChatMessage::user("run")];
        history.extend(tool_turn("c1", "out"));
        history.extend(tool_turn("c2", "out"));
        let compacted = builder.compact_history(history);
        // user + 2×(assistant tool_call + tool result)
        assert_eq!(compacted.len(), 5);
        // Pairing invariant: every tool message's id matches the immediately
        // preceding assistant tool_calls entry.
        for (i, m) in compacted.iter().enumerate() {
            if m.role == Role::Tool {
                let prev = &compacted[i - 1];
                let ids: Vec<&str> = prev
                    .tool_calls
                    .as_ref()
                    .unwrap()
                    .iter()
                    .map(|tc| tc.id.as_str())
                    .collect();
                assert!(ids.contains(&m.tool_call_id.as_deref().unwrap()));
            }
        }
    }

    #[test]
    fn leading_non_user_messages_are_dropped() {
        let (_d, builder, _m) = builder();
        let history = vec![
            ChatMessage::assistant("orphan"),
            ChatMessage::user("hi"),
            ChatMessage::assistant("reply"),
        ];
        let compacted = builder.compact_history(history);
        assert_eq!(compacted[0].role, Role::User);
    }

    // ── trimming ──────────────────────────────────────────────────────────────

    #[test]
    fn trim_keeps_whole_chunks_from_the_back() {
        let (_d, builder, _m) = builder();
        let mut history = Vec::new();
        for i in 0..5 {
            history.push(ChatMessage::user(format!("question number {i} padded out")));
            history.push(ChatMessage::assistant("answer ".repeat(40)));
        }
        // Budget fits roughly two turns (each turn ≈ 8 + 70 tokens).
        let trimmed = builder.trim_history(history, 170);
        assert!(!trimmed.is_empty());
        assert_eq!(trimmed[0].role, Role::User);
        let users: Vec<String> = trimmed
            .iter()
            .filter(|m| m.role == Role::User)
            .map(|m| m.text())
            .collect();
        assert!(users.last().unwrap().contains("number 4"), "most recent kept");
        assert!(users.len() < 5, "older turns dropped");
    }

    #[test]
    fn trim_zero_budget_returns_empty() {
        let (_d, builder, _m) = builder();
        let history = vec![ChatMessage::user("hi")];
        assert!(builder.trim_history(history, 0).is_empty());
    }

    #[test]
    fn trim_never_splits_a_tool_chunk() {
        let (_d, builder, _m) = builder();
        let mut history = vec![ChatMessage::user("old question")];
        history.push(ChatMessage::assistant("old answer"));
        let mut recent = vec![ChatMessage::user("run the tool")];
        recent.extend(tool_turn("c9", &"x".repeat(2000)));
        history.extend(recent);
        // Budget too small for the recent chunk → everything is dropped
        // rather than splitting the tool pair.
        let trimmed = builder.trim_history(history.clone(), 100);
        let has_orphan_tool = trimmed
            .iter()
            .enumerate()
            .any(|(i, m)| m.role == Role::Tool && (i == 0 || trimmed[i - 1].tool_calls.is_none()));
        assert!(!has_orphan_tool);
    }

    // ── assembly ──────────────────────────────────────────────────────────────

    #[test]
    fn build_messages_sandwiches_history_between_system_and_current() {
        let (_d, builder, memory) = builder();
        let tools = ToolRegistry::new(false);
        let history = vec![ChatMessage::user("old"), ChatMessage::assistant("reply")];
        let messages = builder.build_messages(
            history,
            "new question",
            &[],
            &tools,
            &memory,
            Some("telegram"),
            Some("42"),
        );
        assert_eq!(messages[0].role, Role::System);
        assert_eq!(messages.last().unwrap().text(), "new question");
        assert_eq!(messages.len(), 4);
    }

    #[test]
    fn build_messages_drops_trailing_unanswered_user() {
        let (_d, builder, memory) = builder();
        let tools = ToolRegistry::new(false);
        let history = vec![
            ChatMessage::user("answered"),
            ChatMessage::assistant("yes"),
            ChatMessage::user("unanswered"),
        ];
        let messages =
            builder.build_messages(history, "current", &[], &tools, &memory, None, None);
        assert!(!messages.iter().any(|m| m.text() == "unanswered"));
    }

    #[test]
    fn system_message_has_static_and_dynamic_blocks() {
        let (_d, builder, memory) = builder();
        memory.write_long_term("- knows rust\n").unwrap();
        let tools = ToolRegistry::new(false);
        let system = builder.system_message(&tools, &memory, Some("cli"), Some("direct"));
        let MessageContent::Blocks(blocks) = &system.content else {
            panic!("system prompt must be [static, dynamic] blocks");
        };
        assert_eq!(blocks.len(), 2);
        let ContentBlock::Text { text: static_text } = &blocks[0] else {
            panic!()
        };
        let ContentBlock::Text { text: dynamic_text } = &blocks[1] else {
            panic!()
        };
        assert!(static_text.contains("Tool Call Guidelines"));
        assert!(dynamic_text.contains("Current Time"));
        assert!(dynamic_text.contains("knows rust"));
        assert!(dynamic_text.contains("Channel: cli"));
    }

    // ── guard ─────────────────────────────────────────────────────────────────

    #[test]
    fn guard_preserves_system_and_current_turn_shape() {
        let (_d, builder, _m) = builder();
        let mut messages = vec![ChatMessage::system("sys")];
        messages.push(ChatMessage::user("old question"));
        messages.push(ChatMessage::assistant("old answer"));
        let turn_start = messages.len();
        messages.push(ChatMessage::user("current question"));
        messages.extend(tool_turn("c1", "tool output"));

        let (guarded, new_start) = builder.guard_loop_messages(messages, turn_start, false);
        assert_eq!(guarded[0].role, Role::System);
        assert_eq!(guarded[new_start].text(), "current question");
        let tail: Vec<_> = guarded[new_start..].iter().map(|m| m.role).collect();
        assert_eq!(tail, vec![Role::User, Role::Assistant, Role::Tool]);
    }

    #[test]
    fn guard_truncates_oversized_current_turn_tool_results() {
        let (_d, builder, _m) = builder();
        let mut messages = vec![ChatMessage::system("sys"), ChatMessage::user("q")];
        let turn_start = 1;
        messages.extend(tool_turn("c1", &"y".repeat(10_000)));
        let (guarded, _) = builder.guard_loop_messages(messages, turn_start, false);
        let tool_msg = guarded.iter().find(|m| m.role == Role::Tool).unwrap();
        assert!(tool_msg.text().len() <= IN_LOOP_TOOL_RESULT_MAX_CHARS + 20);
        assert!(tool_msg.text().ends_with("... (truncated)"));
    }

    #[test]
    fn aggressive_guard_tightens_caps() {
        let (_d, builder, _m) = builder();
        let mut messages = vec![ChatMessage::system("sys"), ChatMessage::user("q")];
        messages.extend(tool_turn("c1", &"y".repeat(10_000)));
        let (guarded, _) = builder.guard_loop_messages(messages, 1, true);
        let tool_msg = guarded.iter().find(|m| m.role == Role::Tool).unwrap();
        assert!(tool_msg.text().len() <= AGGRESSIVE_TOOL_RESULT_MAX_CHARS + 20);
    }

    // ── catalog ───────────────────────────────────────────────────────────────

    #[test]
    fn catalog_groups_by_capability_with_required_params() {
        let dir = tempfile::tempdir().unwrap();
        let registry = nanobot_tools::build_standard_registry(
            dir.path(),
            &nanobot_tools::StandardToolOptions::default(),
            None,
            None,
        );
        let catalog = render_tool_catalog(&registry);
        assert!(catalog.contains("### Filesystem"));
        assert!(catalog.contains("### Shell"));
        assert!(catalog.contains("read_file(path)"));
        let fs_pos = catalog.find("### Filesystem").unwrap();
        let shell_pos = catalog.find("### Shell").unwrap();
        assert!(fs_pos < shell_pos, "preferred group order");
        // Few tools → full mode with descriptions and risk notes.
        assert!(catalog.contains("Read the contents"));
        assert!(catalog.contains("caution:"));
    }
}
