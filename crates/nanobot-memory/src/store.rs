// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! File ownership for the `memory/` directory: MEMORY.md, HISTORY.md,
//! per-day bullet files, the consolidation progress marker, and the
//! observability JSONL files.

use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use chrono::{Local, NaiveDate};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::guard;
use crate::io::{atomic_append_text, atomic_write_text, parse_h2_sections, render_h2_sections};
use crate::routing::{self, DAILY_SECTION_KEYS};

pub const CHARS_PER_TOKEN: usize = 4;
pub const CONSOLIDATION_SOFT_INPUT_TOKENS: usize = 24_000;
pub const CONSOLIDATION_REPLY_RESERVE_TOKENS: usize = 4_096;
pub const CONSOLIDATION_TOOLCALL_RETRIES: u32 = 1;
pub const HISTORY_ENTRY_MAX_CHARS: usize = 600;
pub const MEMORY_TRUNCATION_NOTICE: &str =
    "\n\n[... long-term memory truncated for consolidation ...]\n\n";

fn history_entry_date_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^\[(20\d{2}-\d{2}-\d{2})(?:\s+\d{2}:\d{2})?\]").expect("static pattern")
    })
}

fn daily_file_date_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^(20\d{2}-\d{2}-\d{2})\.md$").expect("static pattern"))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DailySectionsMode {
    Compatible,
    Preferred,
    Required,
}

impl DailySectionsMode {
    pub fn parse(s: &str) -> Self {
        match s.trim().to_lowercase().as_str() {
            "preferred" => Self::Preferred,
            "required" => Self::Required,
            _ => Self::Compatible,
        }
    }

    pub fn requires_daily_sections(self) -> bool {
        matches!(self, Self::Preferred | Self::Required)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PreferenceConflictStrategy {
    KeepNew,
    KeepOld,
    AskUser,
    Merge,
}

impl PreferenceConflictStrategy {
    pub fn parse(s: &str) -> Self {
        match s.trim().to_lowercase().as_str() {
            "keep_old" => Self::KeepOld,
            "ask_user" => Self::AskUser,
            "merge" => Self::Merge,
            _ => Self::KeepNew,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::KeepNew => "keep_new",
            Self::KeepOld => "keep_old",
            Self::AskUser => "ask_user",
            Self::Merge => "merge",
        }
    }

    /// Strategies that reject the write when a conflict exists.
    pub fn rejects_write(self) -> bool {
        matches!(self, Self::KeepOld | Self::AskUser)
    }
}

/// Crash-recovery marker written before and during consolidation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsolidationProgress {
    pub version: u32,
    pub updated_at: String,
    pub session_key: String,
    pub start_index: usize,
    pub target_last: usize,
    pub archive_all: bool,
    pub keep_count: usize,
    pub snapshot_len: usize,
    pub processed_count: usize,
}

/// Outcome details of one structured daily write.
#[derive(Debug, Clone)]
pub struct DailyWriteDetails {
    pub reason: String,
    pub keys: Vec<String>,
    pub bullet_count: usize,
    pub created: bool,
}

/// Two-layer memory: MEMORY.md (long-term facts) + HISTORY.md
/// (grep-searchable log) + per-day bullet files.
pub struct MemoryStore {
    pub memory_dir: PathBuf,
    observability_dir: PathBuf,
    memory_file: PathBuf,
    history_file: PathBuf,
    progress_file: PathBuf,
    pub daily_sections_mode: DailySectionsMode,
    pub preference_conflict_strategy: PreferenceConflictStrategy,
    preference_conflict_keys: Vec<String>,
}

impl MemoryStore {
    pub fn new(workspace: &Path) -> std::io::Result<Self> {
        let memory_dir = workspace.join("memory");
        let observability_dir = memory_dir.join("observability");
        std::fs::create_dir_all(&observability_dir)?;
        Ok(Self {
            memory_file: memory_dir.join("MEMORY.md"),
            history_file: memory_dir.join("HISTORY.md"),
            progress_file: memory_dir.join("consolidation-in-progress.json"),
            memory_dir,
            observability_dir,
            daily_sections_mode: DailySectionsMode::Compatible,
            preference_conflict_strategy: PreferenceConflictStrategy::KeepNew,
            preference_conflict_keys: vec!["language".into(), "communication_style".into()],
        })
    }

    pub fn with_policies(
        mut self,
        daily_sections_mode: &str,
        preference_conflict_strategy: &str,
        preference_conflict_keys: &[String],
    ) -> Self {
        self.daily_sections_mode = DailySectionsMode::parse(daily_sections_mode);
        self.preference_conflict_strategy =
            PreferenceConflictStrategy::parse(preference_conflict_strategy);
        let keys: Vec<String> = preference_conflict_keys
            .iter()
            .map(|k| k.trim().to_lowercase())
            .filter(|k| !k.is_empty())
            .collect();
        if !keys.is_empty() {
            self.preference_conflict_keys = keys;
        }
        self
    }

    // ── Long-term memory and history ──────────────────────────────────────────

    pub fn read_long_term(&self) -> String {
        std::fs::read_to_string(&self.memory_file).unwrap_or_default()
    }

    pub fn write_long_term(&self, content: &str) -> std::io::Result<()> {
        atomic_write_text(&self.memory_file, content)
    }

    /// Append one history entry followed by a blank separator line.
    pub fn append_history(&self, entry: &str) -> std::io::Result<()> {
        atomic_append_text(&self.history_file, &format!("{}\n\n", entry.trim_end()))
    }

    pub fn read_history(&self) -> String {
        std::fs::read_to_string(&self.history_file).unwrap_or_default()
    }

    pub fn memory_context(&self) -> String {
        let long_term = self.read_long_term();
        if long_term.is_empty() {
            String::new()
        } else {
            format!("## Long-term Memory\n{long_term}")
        }
    }

    // ── History entry normalization ───────────────────────────────────────────

    /// Quality gate for model-provided history entries: collapse whitespace,
    /// reject empties/fences, cap at 600 chars, prepend the current
    /// timestamp when the `[YYYY-MM-DD HH:MM]` prefix is missing.
    pub fn normalize_history_entry(entry: Option<&Value>) -> (Option<String>, &'static str) {
        let Some(entry) = entry else {
            return (None, "missing");
        };
        let Some(raw) = entry.as_str() else {
            return (None, "invalid_type");
        };
        let text = raw.split_whitespace().collect::<Vec<_>>().join(" ");
        if text.is_empty() {
            return (None, "empty");
        }
        if text.contains("```") {
            return (None, "contains_code_block");
        }
        let mut text = if text.chars().count() > HISTORY_ENTRY_MAX_CHARS {
            let capped: String = text.chars().take(HISTORY_ENTRY_MAX_CHARS - 3).collect();
            format!("{}...", capped.trim_end())
        } else {
            text
        };
        if !history_entry_date_re().is_match(&text) {
            text = format!("[{}] {}", Local::now().format("%Y-%m-%d %H:%M"), text);
        }
        (Some(text), "ok")
    }

    /// Date (YYYY-MM-DD) from an entry's prefix, today when absent.
    pub fn history_entry_date(entry: &str) -> String {
        history_entry_date_re()
            .captures(entry.trim())
            .map(|c| c[1].to_string())
            .unwrap_or_else(|| Local::now().format("%Y-%m-%d").to_string())
    }

    // ── Daily files ───────────────────────────────────────────────────────────

    pub fn daily_file(&self, date_str: &str) -> PathBuf {
        self.memory_dir.join(format!("{date_str}.md"))
    }

    fn daily_template(date_str: &str) -> String {
        let sections: String = DAILY_SECTION_KEYS
            .iter()
            .map(|(_, name)| format!("## {name}\n\n"))
            .collect();
        format!("# {date_str}\n\n{sections}")
    }

    /// Append `- <bullet>` under the target H2 section, creating an
    /// `## Entries` section when the target is absent. Verbatim duplicates
    /// within the section are skipped. Returns whether a line was written.
    fn append_bullet_to_daily_section(
        &self,
        daily_file: &Path,
        section: &str,
        bullet: &str,
    ) -> std::io::Result<bool> {
        let text = std::fs::read_to_string(daily_file)?;
        let mut target = format!("## {section}");
        let mut idx = text.find(&target);
        if idx.is_none() {
            target = "## Entries".into();
            idx = text.find(&target);
        }
        let Some(idx) = idx else {
            atomic_append_text(daily_file, &format!("\n## Entries\n\n- {bullet}\n"))?;
            return Ok(true);
        };

        let insert_at = text[idx + target.len()..]
            .find("\n## ")
            .map(|p| idx + target.len() + p)
            .unwrap_or(text.len());
        let section_body = &text[idx..insert_at];
        let line = format!("\n- {bullet}\n");
        if section_body.contains(&line) || section_body.ends_with(&format!("\n- {bullet}")) {
            return Ok(false);
        }
        let mut prefix = text[..insert_at].to_string();
        let suffix = &text[insert_at..];
        if !prefix.ends_with('\n') {
            prefix.push('\n');
        }
        atomic_write_text(daily_file, &format!("{prefix}- {bullet}\n{suffix}"))?;
        Ok(true)
    }

    /// Write a structured `daily_sections` payload into the daily file.
    pub fn append_daily_sections(
        &self,
        date_str: &str,
        sections: Option<&Value>,
    ) -> (PathBuf, bool, DailyWriteDetails) {
        let daily_file = self.daily_file(date_str);
        let (normalized, reason) = routing::normalize_daily_sections(sections);
        let Some(normalized) = normalized else {
            return (
                daily_file,
                false,
                DailyWriteDetails {
                    reason,
                    keys: vec![],
                    bullet_count: 0,
                    created: false,
                },
            );
        };

        let mut created = false;
        if !daily_file.exists() {
            if let Err(e) = atomic_write_text(&daily_file, &Self::daily_template(date_str)) {
                warn!(error = %e, file = %daily_file.display(), "failed to create daily file");
                return (
                    daily_file,
                    false,
                    DailyWriteDetails {
                        reason: "io_error".into(),
                        keys: vec![],
                        bullet_count: 0,
                        created: false,
                    },
                );
            }
            created = true;
        }

        let mut wrote = 0usize;
        for (schema_key, section_name) in DAILY_SECTION_KEYS {
            for bullet in normalized.get(*schema_key).into_iter().flatten() {
                match self.append_bullet_to_daily_section(&daily_file, section_name, bullet) {
                    Ok(true) => wrote += 1,
                    Ok(false) => {}
                    Err(e) => {
                        warn!(error = %e, section = section_name, "daily bullet write failed")
                    }
                }
            }
        }
        let details = DailyWriteDetails {
            reason: "ok".into(),
            keys: normalized.keys().cloned().collect(),
            bullet_count: wrote,
            created,
        };
        debug!(
            date = date_str,
            created,
            bullet_count = wrote,
            file = %daily_file.display(),
            "daily structured sections appended"
        );
        (daily_file, true, details)
    }

    /// Unstructured fallback: one compacted bullet classified by heuristic.
    pub fn append_daily_history_entry(&self, entry: &str) -> PathBuf {
        let date_str = Self::history_entry_date(entry);
        let daily_file = self.daily_file(&date_str);
        if !daily_file.exists() {
            if let Err(e) = atomic_write_text(&daily_file, &Self::daily_template(&date_str)) {
                warn!(error = %e, "failed to create daily file");
                return daily_file;
            }
        }
        let section = routing::daily_section_for_entry(entry);
        let bullet = routing::compact_fallback_bullet(&routing::history_entry_body(entry));
        let (bullet, _) = routing::sanitize_daily_bullet(&Value::String(bullet));
        if let Some(bullet) = bullet {
            if let Err(e) = self.append_bullet_to_daily_section(&daily_file, section, &bullet) {
                warn!(error = %e, section, "daily fallback write failed");
            }
        }
        daily_file
    }

    /// Compact recent-daily snippet for recall-style queries.
    pub fn recent_daily_context(
        &self,
        days: u32,
        max_bullets: usize,
        max_chars: usize,
        include_tool_activity: bool,
    ) -> String {
        let window_days = days.max(1) as i64;
        let bullet_budget = max_bullets.max(1);
        let char_budget = max_chars.max(200);
        let cutoff = Local::now().date_naive() - chrono::Duration::days(window_days - 1);

        let mut allowed: Vec<&str> = vec!["Topics", "Decisions", "Open Questions", "Entries"];
        if include_tool_activity {
            allowed.push("Tool Activity");
        }

        let mut dated_files: Vec<(String, PathBuf)> = Vec::new();
        if let Ok(entries) = std::fs::read_dir(&self.memory_dir) {
            for entry in entries.flatten() {
                let name = entry.file_name().to_string_lossy().to_string();
                let Some(caps) = daily_file_date_re().captures(&name) else {
                    continue;
                };
                let date_str = caps[1].to_string();
                let Ok(date) = NaiveDate::parse_from_str(&date_str, "%Y-%m-%d") else {
                    continue;
                };
                if date >= cutoff {
                    dated_files.push((date_str, entry.path()));
                }
            }
        }
        dated_files.sort_by(|a, b| b.0.cmp(&a.0));

        let mut lines: Vec<String> = Vec::new();
        let mut total_chars = 0usize;
        for (date_str, path) in dated_files {
            let Ok(text) = std::fs::read_to_string(&path) else {
                continue;
            };
            let mut current_section = String::new();
            for raw in text.lines() {
                if let Some(h) = raw.strip_prefix("## ") {
                    current_section = h.trim().to_string();
                    continue;
                }
                let Some(bullet) = raw.strip_prefix("- ") else {
                    continue;
                };
                if !current_section.is_empty() && !allowed.contains(&current_section.as_str()) {
                    continue;
                }
                let bullet = bullet.trim();
                if bullet.is_empty() {
                    continue;
                }
                let label = if current_section.is_empty() {
                    String::new()
                } else {
                    format!(" [{current_section}]")
                };
                let line = format!("- {date_str}{label}: {bullet}");
                let projected = total_chars + line.len() + 1;
                if lines.len() >= bullet_budget || projected > char_budget {
                    return lines.join("\n");
                }
                total_chars = projected;
                lines.push(line);
            }
        }
        lines.join("\n")
    }

    // ── Merge ─────────────────────────────────────────────────────────────────

    /// Merge a sanitized candidate with the current memory: preserve
    /// current's section order and bullets, append new sections and new
    /// (deduplicated) bullets from the candidate. Returns the candidate
    /// unchanged when either side lacks H2 structure.
    pub fn merge_memory_update_with_current(
        current_memory: &str,
        candidate_update: &str,
    ) -> (String, bool) {
        if current_memory.trim().is_empty() || candidate_update.trim().is_empty() {
            return (candidate_update.to_string(), false);
        }
        let (cur_preamble, cur_sections) = parse_h2_sections(current_memory);
        let (cand_preamble, cand_sections) = parse_h2_sections(candidate_update);
        if cur_sections.is_empty() || cand_sections.is_empty() {
            return (candidate_update.to_string(), false);
        }

        let mut merged: Vec<(String, Vec<String>)> = cur_sections.clone();
        for (heading, cand_lines) in &cand_sections {
            match merged.iter_mut().find(|(h, _)| h == heading) {
                Some((_, lines)) => {
                    *lines = Self::merge_section_lines(lines, cand_lines);
                }
                None => merged.push((heading.clone(), cand_lines.clone())),
            }
        }

        let preamble = if cur_preamble.iter().any(|l| !l.trim().is_empty()) {
            cur_preamble
        } else {
            cand_preamble
        };
        let merged_text = render_h2_sections(&preamble, &merged);
        if merged_text.is_empty() {
            (candidate_update.to_string(), false)
        } else {
            (merged_text, true)
        }
    }

    /// Append candidate lines not already present; bullets compare
    /// case-insensitively with collapsed whitespace, other lines verbatim.
    fn merge_section_lines(current: &[String], candidate: &[String]) -> Vec<String> {
        fn bullet_key(line: &str) -> Option<String> {
            line.trim().strip_prefix("- ").map(|b| {
                b.split_whitespace()
                    .collect::<Vec<_>>()
                    .join(" ")
                    .to_lowercase()
            })
        }

        let mut merged: Vec<String> = current.to_vec();
        let mut seen_lines: Vec<String> = current
            .iter()
            .map(|l| l.trim().to_string())
            .filter(|l| !l.is_empty())
            .collect();
        let mut seen_bullets: Vec<String> = current.iter().filter_map(|l| bullet_key(l)).collect();

        for line in candidate {
            let stripped = line.trim().to_string();
            if stripped.is_empty() {
                continue;
            }
            if let Some(key) = bullet_key(line) {
                if seen_bullets.contains(&key) {
                    continue;
                }
                seen_bullets.push(key);
            } else if seen_lines.contains(&stripped) {
                continue;
            }
            seen_lines.push(stripped);
            merged.push(line.clone());
        }
        merged
    }

    // ── Policy wrappers ───────────────────────────────────────────────────────

    pub fn detect_preference_conflicts(
        &self,
        current_memory: &str,
        candidate_update: &str,
    ) -> Vec<guard::PreferenceConflict> {
        let patterns: Vec<(&str, Regex)> = guard::preference_key_patterns()
            .iter()
            .filter(|(k, _)| self.preference_conflict_keys.iter().any(|ck| ck == k))
            .map(|(k, p)| (*k, p.clone()))
            .collect();
        let patterns = if patterns.is_empty() {
            guard::preference_key_patterns()
                .iter()
                .map(|(k, p)| (*k, p.clone()))
                .collect()
        } else {
            patterns
        };
        guard::detect_preference_conflicts(current_memory, candidate_update, &patterns)
    }

    // ── Observability metrics ─────────────────────────────────────────────────

    fn append_metric(&self, filename: &str, mut row: Value) {
        row["ts"] = json!(Local::now().format("%Y-%m-%dT%H:%M:%S").to_string());
        let path = self.observability_dir.join(filename);
        let line = format!("{row}\n");
        if let Err(e) = atomic_append_text(&path, &line) {
            warn!(file = %path.display(), error = %e, "failed to append metric row");
        }
    }

    #[allow(clippy::too_many_arguments)]
    pub fn append_daily_routing_metric(
        &self,
        session_key: &str,
        date_str: &str,
        structured_daily_ok: bool,
        fallback_reason: &str,
        details: &DailyWriteDetails,
        structured_source: &str,
        model_daily_sections_ok: bool,
        model_daily_sections_reason: &str,
        preferred_retry_used: bool,
        tool_call_has_daily_sections: bool,
    ) {
        self.append_metric(
            "daily-routing-metrics.jsonl",
            json!({
                "session_key": session_key,
                "date": date_str,
                "structured_daily_ok": structured_daily_ok,
                "fallback_used": !structured_daily_ok,
                "fallback_reason": fallback_reason,
                "structured_keys": &details.keys,
                "structured_bullet_count": details.bullet_count,
                "structured_source": structured_source,
                "model_daily_sections_ok": model_daily_sections_ok,
                "model_daily_sections_reason": model_daily_sections_reason,
                "preferred_retry_used": preferred_retry_used,
                "tool_call_has_daily_sections": tool_call_has_daily_sections,
            }),
        );
    }

    pub fn append_guard_metric(
        &self,
        session_key: &str,
        reason: &str,
        current_memory_chars: usize,
        returned_memory_chars: usize,
        candidate_preview: &str,
    ) {
        self.append_metric(
            "memory-update-guard-metrics.jsonl",
            json!({
                "session_key": session_key,
                "reason": reason,
                "current_memory_chars": current_memory_chars,
                "returned_memory_chars": returned_memory_chars,
                "candidate_preview": candidate_preview,
            }),
        );
    }

    pub fn append_sanitize_metric(&self, session_key: &str, details: &guard::SanitizeDetails) {
        self.append_metric(
            "memory-update-sanitize-metrics.jsonl",
            json!({
                "session_key": session_key,
                "removed_recent_topic_section_count": details.removed_recent_topic_sections.len(),
                "removed_transient_status_line_count": details.removed_transient_status_line_count,
                "removed_duplicate_bullet_count": details.removed_duplicate_bullet_count,
                "removed_recent_topic_sections":
                    details.removed_recent_topic_sections.iter().take(3).collect::<Vec<_>>(),
                "removed_transient_status_sections":
                    details.removed_transient_status_sections.iter().take(3).collect::<Vec<_>>(),
                "removed_duplicate_bullet_sections":
                    details.duplicate_bullet_section_samples.iter().take(3).collect::<Vec<_>>(),
            }),
        );
    }

    pub fn append_conflict_metric(
        &self,
        session_key: &str,
        conflict: &guard::PreferenceConflict,
        resolution: &str,
    ) {
        self.append_metric(
            "memory-conflict-metrics.jsonl",
            json!({
                "session_key": session_key,
                "conflict_key": &conflict.key,
                "old_value": &conflict.old_value,
                "new_value": &conflict.new_value,
                "resolution": resolution,
            }),
        );
    }

    pub fn append_outcome_metric(
        &self,
        session_key: &str,
        outcome: &str,
        guard_reason: Option<&str>,
        sanitize_changes: usize,
        merge_applied: bool,
        conflict_count: usize,
    ) {
        self.append_metric(
            "memory-update-outcome.jsonl",
            json!({
                "session_key": session_key,
                "outcome": outcome,
                "guard_reason": guard_reason,
                "sanitize_changes": sanitize_changes,
                "merge_applied": merge_applied,
                "conflict_count": conflict_count,
            }),
        );
    }

    // ── Progress marker ───────────────────────────────────────────────────────

    pub fn write_progress(&self, progress: &ConsolidationProgress) {
        match serde_json::to_string(progress) {
            Ok(payload) => {
                if let Err(e) = atomic_write_text(&self.progress_file, &payload) {
                    warn!(error = %e, "failed to write consolidation progress");
                }
            }
            Err(e) => warn!(error = %e, "failed to serialize consolidation progress"),
        }
    }

    pub fn read_progress(&self) -> Option<ConsolidationProgress> {
        let text = std::fs::read_to_string(&self.progress_file).ok()?;
        serde_json::from_str(&text).ok()
    }

    pub fn clear_progress(&self) {
        if self.progress_file.exists() {
            let _ = std::fs::remove_file(&self.progress_file);
        }
    }

    pub fn progress_file_exists(&self) -> bool {
        self.progress_file.exists()
    }

    // ── Consolidation prompt budgeting ────────────────────────────────────────

    /// Coarse token estimate for consolidation budgeting.
    pub fn estimate_tokens(text: &str) -> usize {
        if text.is_empty() {
            0
        } else {
            (text.len() / CHARS_PER_TOKEN).max(1)
        }
    }

    /// Render messages as `[timestamp] ROLE: content` lines; messages
    /// without textual content are skipped.
    pub fn format_consolidation_lines(messages: &[nanobot_model::ChatMessage]) -> Vec<String> {
        messages
            .iter()
            .filter_map(|m| {
                let content = m.text();
                if content.is_empty() {
                    return None;
                }
                let ts = m.timestamp.as_deref().unwrap_or("?");
                let ts = &ts[..ts.len().min(16)];
                let role = format!("{:?}", m.role).to_uppercase();
                Some(format!("[{ts}] {role}: {content}"))
            })
            .collect()
    }

    pub fn build_consolidation_prompt(current_memory: &str, lines: &[String]) -> String {
        let memory = if current_memory.is_empty() {
            "(empty)"
        } else {
            current_memory
        };
        format!(
            "Process this conversation and call the save_memory tool with your consolidation.\n\n\
             ## Current Long-term Memory\n{memory}\n\n\
             ## Conversation to Process\n{}",
            lines.join("\n")
        )
    }

    pub fn consolidation_system_prompt(strict_tool_call: bool) -> String {
        let base = "You are a memory consolidation agent. Call the save_memory tool with your \
            consolidation of the conversation. Treat MEMORY.md as long-term stable facts only \
            (user preferences, durable project context, stable environment constraints). Do NOT \
            copy recent discussion topics, knowledge-answer content, long summaries, tables, or \
            tool outputs into memory_update; those belong in history_entry only. Temporary \
            system/API error statuses, one-off incidents, and dated operational notes should \
            usually stay out of memory_update (or be reduced to a durable configuration fact \
            only). Prefer including daily_sections with concise bullets for \
            Topics/Decisions/Tool Activity/Open Questions whenever history_entry has meaningful \
            content; only omit a section when there is truly no relevant bullet.";
        if !strict_tool_call {
            return base.to_string();
        }
        format!(
            "{base} Do not reply with plain text. You MUST call save_memory exactly once with \
             both history_entry and memory_update."
        )
    }

    /// Greedily take a prefix of `messages` that fits the soft input budget
    /// (always at least one message).
    pub fn fit_chunk_by_soft_budget<'a>(
        &self,
        messages: &'a [nanobot_model::ChatMessage],
        current_memory: &str,
    ) -> &'a [nanobot_model::ChatMessage] {
        if messages.is_empty() {
            return messages;
        }
        let (budget_memory, _) = self.fit_memory_context_by_soft_budget(current_memory, &[]);
        let scaffold = Self::build_consolidation_prompt(&budget_memory, &[]);
        let budget = CONSOLIDATION_SOFT_INPUT_TOKENS
            .saturating_sub(Self::estimate_tokens(&scaffold))
            .saturating_sub(CONSOLIDATION_REPLY_RESERVE_TOKENS)
            .max(1);

        let mut total = 0usize;
        let mut count = 0usize;
        for m in messages {
            let lines = Self::format_consolidation_lines(std::slice::from_ref(m));
            let delta = if lines.is_empty() {
                1
            } else {
                Self::estimate_tokens(&lines.join("\n"))
            };
            if count > 0 && total + delta > budget {
                break;
            }
            total += delta;
            count += 1;
        }
        &messages[..count.max(1)]
    }

    /// Trim long-term memory to fit the consolidation input budget with a
    /// head+tail slice around the truncation notice.
    /// Returns `(memory_for_prompt, was_truncated)`.
    pub fn fit_memory_context_by_soft_budget(
        &self,
        current_memory: &str,
        lines: &[String],
    ) -> (String, bool) {
        if current_memory.is_empty() {
            return (current_memory.to_string(), false);
        }
        let prompt_without_memory = Self::build_consolidation_prompt("", lines);
        let available = CONSOLIDATION_SOFT_INPUT_TOKENS as i64
            - CONSOLIDATION_REPLY_RESERVE_TOKENS as i64
            - Self::estimate_tokens(&prompt_without_memory) as i64;
        if available <= 0 {
            return (String::new(), true);
        }
        let available = available as usize;
        if Self::estimate_tokens(current_memory) <= available {
            return (current_memory.to_string(), false);
        }

        let max_chars = (available * CHARS_PER_TOKEN).max(64);
        let notice = MEMORY_TRUNCATION_NOTICE;
        if max_chars <= notice.len() {
            return (notice.trim().to_string(), true);
        }
        let room = max_chars - notice.len();
        let mut head_chars = (room / 2).max(1);
        let mut tail_chars = (room - head_chars).max(1);

        let slice = |head: usize, tail: usize| -> String {
            let head_end = floor_char_boundary(current_memory, head.min(current_memory.len()));
            let tail_start = ceil_char_boundary(
                current_memory,
                current_memory.len().saturating_sub(tail),
            );
            format!(
                "{}{}{}",
                &current_memory[..head_end],
                notice,
                &current_memory[tail_start..]
            )
        };

        let mut trimmed = slice(head_chars, tail_chars);
        while Self::estimate_tokens(&trimmed) > available && (head_chars > 16 || tail_chars > 16) {
            head_chars = ((head_chars as f64 * 0.85) as usize).max(16);
            tail_chars = ((tail_chars as f64 * 0.85) as usize).max(16);
            trimmed = slice(head_chars, tail_chars);
        }
        (trimmed, true)
    }
}

fn floor_char_boundary(s: &str, mut idx: usize) -> usize {
    idx = idx.min(s.len());
    while idx > 0 && !s.is_char_boundary(idx) {
        idx -= 1;
    }
    idx
}

fn ceil_char_boundary(s: &str, mut idx: usize) -> usize {
    idx = idx.min(s.len());
    while idx < s.len() && !s.is_char_boundary(idx) {
        idx += 1;
    }
    idx
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
