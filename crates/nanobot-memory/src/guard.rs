// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Syntactic sanitize/guard/conflict policy for long-term memory updates.
//!
//! Everything here is a pure function over text, so the policy is testable
//! without touching disk or a provider. The store applies it before any
//! MEMORY.md write.

use std::collections::{HashMap, HashSet};
use std::sync::OnceLock;

use regex::Regex;

// ─── Thresholds ───────────────────────────────────────────────────────────────

pub const SHRINK_GUARD_RATIO: f64 = 0.4;
pub const MIN_HEADING_RETAIN_RATIO: f64 = 0.5;
pub const MIN_STRUCTURED_CHARS: usize = 120;
pub const MAX_UPDATE_CHARS: usize = 12_000;
pub const URL_LINE_MIN_COUNT: usize = 3;
pub const URL_LINE_RATIO_GUARD: f64 = 0.2;
pub const DATE_LINE_MIN_COUNT: usize = 3;
pub const DATE_LINE_RATIO_GUARD: f64 = 0.2;
pub const DUPLICATE_LINE_MIN_COUNT: usize = 4;
pub const DUPLICATE_LINE_RATIO_GUARD: f64 = 0.4;
const LOG_SAMPLE_LIMIT: usize = 3;
const LOG_SAMPLE_CHARS: usize = 120;

fn regex_set(patterns: &[&str]) -> Vec<Regex> {
    patterns
        .iter()
        .map(|p| Regex::new(p).expect("static pattern"))
        .collect()
}

/// Section headings that are recent-topic dumps, not durable facts.
fn section_reject_patterns() -> &'static Vec<Regex> {
    static SET: OnceLock<Vec<Regex>> = OnceLock::new();
    SET.get_or_init(|| {
        regex_set(&[
            r"(今天|今日|近期).*(讨论|主题)",
            r"(?i)today.*(discussion|topics?)",
            r"(?i)recent.*(discussion|topics?)",
            r"\b20\d{2}-\d{2}-\d{2}\b",
        ])
    })
}

/// Section headings describing transient system/API status.
fn transient_section_patterns() -> &'static Vec<Regex> {
    static SET: OnceLock<Vec<Regex>> = OnceLock::new();
    SET.get_or_init(|| {
        regex_set(&[
            r"(?i)(system|technical).*(issues?|status)",
            r"(?i)(api|service).*(issues?|status|errors?)",
            r"(系统|技术).*(问题|状态)",
            r"(接口|服务).*(问题|状态|报错)",
        ])
    })
}

/// Lines inside a transient-status section that are themselves transient.
fn transient_line_patterns() -> &'static Vec<Regex> {
    static SET: OnceLock<Vec<Regex>> = OnceLock::new();
    SET.get_or_init(|| {
        regex_set(&[
            r"\b20\d{2}-\d{2}-\d{2}\b",
            r"(?i)\b(today|yesterday|recently|currently|temporary|temporarily)\b",
            r"(?i)\b(error|failed|failure|timeout|timed out|unavailable)\b",
            r"\b(4\d{2}|5\d{2})\b",
            r"(报错|错误|失败|超时|不可用|临时)",
        ])
    })
}

fn date_token_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\b20\d{2}-\d{2}-\d{2}\b").expect("static pattern"))
}

fn ws_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\s+").expect("static pattern"))
}

/// Preference keys extractable from a `## Preferences` section.
pub fn preference_key_patterns() -> &'static Vec<(&'static str, Regex)> {
    static SET: OnceLock<Vec<(&'static str, Regex)>> = OnceLock::new();
    SET.get_or_init(|| {
        vec![
            ("language", Regex::new(r"(?i)(语言|language)").unwrap()),
            (
                "communication_style",
                Regex::new(r"(?i)(沟通风格|communication style)").unwrap(),
            ),
            ("timezone", Regex::new(r"(?i)(时区|time ?zone)").unwrap()),
            (
                "output_format",
                Regex::new(r"(?i)(输出格式|格式|output format)").unwrap(),
            ),
            ("tone", Regex::new(r"(?i)(语气|tone)").unwrap()),
        ]
    })
}

fn matches_any(text: &str, patterns: &[Regex]) -> bool {
    patterns.iter().any(|p| p.is_match(text))
}

/// Compress whitespace and cap a string for log/metric samples.
pub fn truncate_log_sample(text: &str) -> String {
    let compact = ws_re().replace_all(text.trim(), " ").to_string();
    if compact.len() <= LOG_SAMPLE_CHARS {
        return compact;
    }
    let mut cut = LOG_SAMPLE_CHARS - 3;
    while !compact.is_char_boundary(cut) {
        cut -= 1;
    }
    format!("{}...", compact[..cut].trim_end())
}

// ─── Sanitize ─────────────────────────────────────────────────────────────────

/// Classification stats from one sanitize pass.
#[derive(Debug, Default, Clone)]
pub struct SanitizeDetails {
    pub removed_sections: Vec<String>,
    pub removed_recent_topic_sections: Vec<String>,
    pub removed_transient_status_sections: Vec<String>,
    pub removed_transient_status_line_count: usize,
    pub removed_duplicate_bullet_count: usize,
    pub recent_topic_section_samples: Vec<String>,
    pub transient_status_line_samples: Vec<String>,
    pub duplicate_bullet_section_samples: Vec<String>,
}

impl SanitizeDetails {
    pub fn change_count(&self) -> usize {
        self.removed_sections.len()
            + self.removed_transient_status_line_count
            + self.removed_duplicate_bullet_count
    }
}

/// Remove short-lived/topic-dump content from a candidate memory update.
///
/// Single pass over lines: reject whole sections whose heading matches the
/// recent-topic patterns, scrub transient lines inside status sections
/// (dropping the heading too if the section empties), then dedupe bullet
/// lines per section. Falls back to `current_memory` when the result is
/// empty. Idempotent: sanitizing a sanitized text is a no-op.
pub fn sanitize_memory_update(update: &str, current_memory: &str) -> (String, SanitizeDetails) {
    let mut details = SanitizeDetails::default();
    if update.trim().is_empty() {
        return (update.to_string(), details);
    }

    let lines: Vec<&str> = update.lines().collect();
    let mut kept: Vec<String> = Vec::new();
    let mut i = 0usize;
    while i < lines.len() {
        let line = lines[i];
        if let Some(heading) = line.strip_prefix("## ").map(str::trim) {
            if matches_any(heading, section_reject_patterns()) {
                details.removed_sections.push(heading.to_string());
                details
                    .removed_recent_topic_sections
                    .push(heading.to_string());
                if details.recent_topic_section_samples.len() < LOG_SAMPLE_LIMIT {
                    details
                        .recent_topic_section_samples
                        .push(truncate_log_sample(heading));
                }
                i += 1;
                while i < lines.len() && !lines[i].starts_with("## ") {
                    i += 1;
                }
                continue;
            }
            if matches_any(heading, transient_section_patterns()) {
                let mut section_lines: Vec<String> = vec![line.to_string()];
                let mut removed_in_section = 0usize;
                i += 1;
                while i < lines.len() && !lines[i].starts_with("## ") {
                    let candidate = lines[i];
                    if !candidate.trim().is_empty()
                        && matches_any(candidate, transient_line_patterns())
                    {
                        removed_in_section += 1;
                        details.removed_transient_status_line_count += 1;
                        if details.transient_status_line_samples.len() < LOG_SAMPLE_LIMIT {
                            details
                                .transient_status_line_samples
                                .push(truncate_log_sample(candidate));
                        }
                        i += 1;
                        continue;
                    }
                    section_lines.push(candidate.to_string());
                    i += 1;
                }
                if section_lines[1..].iter().any(|s| !s.trim().is_empty()) {
                    kept.extend(section_lines);
                } else {
                    details
                        .removed_sections
                        .push(format!("{heading} (transient status only)"));
                    details
                        .removed_transient_status_sections
                        .push(heading.to_string());
                }
                if removed_in_section > 0 {
                    details
                        .removed_transient_status_sections
                        .push(heading.to_string());
                }
                continue;
            }
        }
        kept.push(line.to_string());
        i += 1;
    }

    let (deduped, removed_dupes, dupe_samples) = dedupe_bullets_by_section(&kept);
    details.removed_duplicate_bullet_count = removed_dupes;
    details.duplicate_bullet_section_samples = dupe_samples;
    details.removed_transient_status_sections.sort();
    details.removed_transient_status_sections.dedup();

    let joined = deduped.join("\n");
    let trimmed = joined.trim();
    let sanitized = if trimmed.is_empty() {
        current_memory.to_string()
    } else if update.ends_with('\n') {
        format!("{trimmed}\n")
    } else {
        trimmed.to_string()
    };
    (sanitized, details)
}

/// Drop repeated `- ` bullets within each H2 section, comparing
/// case-insensitively with collapsed whitespace. First occurrence wins.
pub fn dedupe_bullets_by_section(lines: &[String]) -> (Vec<String>, usize, Vec<String>) {
    let mut kept: Vec<String> = Vec::new();
    let mut seen: HashSet<(String, String)> = HashSet::new();
    let mut current_heading = "(root)".to_string();
    let mut removed = 0usize;
    let mut section_samples: Vec<String> = Vec::new();

    for line in lines {
        if let Some(heading) = line.strip_prefix("## ").map(str::trim) {
            current_heading = if heading.is_empty() {
                "(untitled)".into()
            } else {
                heading.to_string()
            };
            kept.push(line.clone());
            continue;
        }
        let stripped = line.trim();
        let Some(bullet) = stripped.strip_prefix("- ") else {
            kept.push(line.clone());
            continue;
        };
        let normalized = normalize_bullet_text(bullet);
        if normalized.is_empty() {
            kept.push(line.clone());
            continue;
        }
        let key = (current_heading.clone(), normalized);
        if seen.contains(&key) {
            removed += 1;
            if !section_samples.contains(&current_heading)
                && section_samples.len() < LOG_SAMPLE_LIMIT
            {
                section_samples.push(current_heading.clone());
            }
            continue;
        }
        seen.insert(key);
        kept.push(line.clone());
    }
    (kept, removed, section_samples)
}

fn normalize_bullet_text(text: &str) -> String {
    ws_re().replace_all(text.trim(), " ").to_lowercase()
}

// ─── Guard ────────────────────────────────────────────────────────────────────

pub fn extract_h2_headings(text: &str) -> Vec<String> {
    text.lines()
        .filter_map(|l| l.strip_prefix("## "))
        .map(str::trim)
        .filter(|h| !h.is_empty())
        .map(str::to_string)
        .collect()
}

pub fn has_structured_markers(text: &str) -> bool {
    text.lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .any(|l| l.starts_with("## ") || l.starts_with("- "))
}

/// Reject reason for a candidate update, or None when the write may proceed.
/// Checks run in a fixed order so metrics stay comparable over time.
pub fn memory_update_guard_reason(current_memory: &str, candidate_update: &str) -> Option<&'static str> {
    let current = current_memory.trim();
    let candidate = candidate_update.trim();
    if candidate.is_empty() {
        return Some("empty_candidate");
    }
    if current.is_empty() {
        return None;
    }
    let current_len = current.chars().count();
    let candidate_len = candidate.chars().count();
    if candidate_len > MAX_UPDATE_CHARS {
        return Some("candidate_too_long");
    }
    if candidate.contains("```") {
        return Some("contains_code_block");
    }
    if current_len >= 200 && (candidate_len as f64) < current_len as f64 * SHRINK_GUARD_RATIO {
        return Some("excessive_shrink");
    }
    if candidate_len >= MIN_STRUCTURED_CHARS && !has_structured_markers(candidate) {
        return Some("unstructured_candidate");
    }

    let non_empty: Vec<&str> = candidate
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .collect();
    if !non_empty.is_empty() {
        let total = non_empty.len() as f64;
        let date_lines = non_empty
            .iter()
            .filter(|l| date_token_re().is_match(l))
            .count();
        if date_lines >= DATE_LINE_MIN_COUNT && date_lines as f64 / total >= DATE_LINE_RATIO_GUARD {
            return Some("date_line_overflow");
        }
        let url_lines = non_empty
            .iter()
            .filter(|l| l.contains("http://") || l.contains("https://"))
            .count();
        if url_lines >= URL_LINE_MIN_COUNT && url_lines as f64 / total >= URL_LINE_RATIO_GUARD {
            return Some("url_line_overflow");
        }
        let mut content_counts: HashMap<String, usize> = HashMap::new();
        for line in &non_empty {
            if line.starts_with("## ") {
                continue;
            }
            let text = line.strip_prefix("- ").unwrap_or(line);
            let normalized = normalize_bullet_text(text);
            if !normalized.is_empty() {
                *content_counts.entry(normalized).or_insert(0) += 1;
            }
        }
        let content_total: usize = content_counts.values().sum();
        if let Some(&max_dupes) = content_counts.values().max() {
            if max_dupes >= DUPLICATE_LINE_MIN_COUNT
                && max_dupes as f64 / content_total as f64 >= DUPLICATE_LINE_RATIO_GUARD
            {
                return Some("duplicate_line_overflow");
            }
        }
    }

    let current_h2 = extract_h2_headings(current);
    if !current_h2.is_empty() {
        let candidate_h2: HashSet<String> = extract_h2_headings(candidate).into_iter().collect();
        let kept = current_h2.iter().filter(|h| candidate_h2.contains(*h)).count();
        if (kept as f64 / current_h2.len() as f64) < MIN_HEADING_RETAIN_RATIO {
            return Some("heading_retention_too_low");
        }
    }
    None
}

// ─── Preference conflicts ─────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub struct PreferenceConflict {
    pub key: String,
    pub old_value: String,
    pub new_value: String,
}

/// Extract preference values from bullets under a `Preferences` H2 heading
/// (English or Chinese variants).
pub fn extract_preference_values(
    text: &str,
    key_patterns: &[(&str, Regex)],
) -> HashMap<String, String> {
    let mut values = HashMap::new();
    let mut in_preferences = false;
    for raw in text.lines() {
        let line = raw.trim();
        if let Some(heading) = line.strip_prefix("## ") {
            let h = heading.trim().to_lowercase();
            in_preferences = matches!(h.as_str(), "preferences" | "偏好" | "用户偏好");
            continue;
        }
        if !in_preferences || !line.starts_with('-') {
            continue;
        }
        let item = line.trim_start_matches('-').trim();
        for (key, pattern) in key_patterns {
            if pattern.is_match(item) {
                let value = item
                    .split_once(':')
                    .map(|(_, v)| v.trim())
                    .or_else(|| item.split_once('：').map(|(_, v)| v.trim()))
                    .unwrap_or(item);
                values.insert(key.to_string(), value.to_string());
            }
        }
    }
    values
}

/// Keys present in both texts with different values.
pub fn detect_preference_conflicts(
    current_memory: &str,
    candidate_update: &str,
    key_patterns: &[(&str, Regex)],
) -> Vec<PreferenceConflict> {
    let current_vals = extract_preference_values(current_memory, key_patterns);
    let candidate_vals = extract_preference_values(candidate_update, key_patterns);
    let mut conflicts = Vec::new();
    for (key, old_value) in &current_vals {
        let Some(new_value) = candidate_vals.get(key) else {
            continue;
        };
        if !new_value.is_empty() && new_value != old_value {
            conflicts.push(PreferenceConflict {
                key: key.clone(),
                old_value: old_value.clone(),
                new_value: new_value.clone(),
            });
        }
    }
    conflicts.sort_by(|a, b| a.key.cmp(&b.key));
    conflicts
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
