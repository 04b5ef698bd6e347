// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Daily routing policy: which payload ends up in today's daily file.
//!
//! Resolution order: the model's own `daily_sections` → partial salvage →
//! synthesis from the history entry → `required_missing` / unstructured
//! fallback, depending on the configured mode.

use std::collections::BTreeMap;
use std::sync::OnceLock;

use regex::Regex;
use serde_json::Value;

use crate::store::DailySectionsMode;

/// Schema keys in write order, paired with their H2 section names.
pub const DAILY_SECTION_KEYS: &[(&str, &str)] = &[
    ("topics", "Topics"),
    ("decisions", "Decisions"),
    ("tool_activity", "Tool Activity"),
    ("open_questions", "Open Questions"),
];

pub const DAILY_BULLET_MAX_CHARS: usize = 240;
const SYNTH_MAX_BULLETS: usize = 4;
const SYNTH_MIN_BULLET_CHARS: usize = 8;

pub type DailySections = BTreeMap<String, Vec<String>>;

fn synth_exclude_patterns() -> &'static Vec<Regex> {
    static SET: OnceLock<Vec<Regex>> = OnceLock::new();
    SET.get_or_init(|| {
        [
            r"\b(4\d{2}|5\d{2})\b",
            r"(?i)\b(error|failed|failure|timeout|timed out|unavailable|temporary)\b",
            r"(报错|错误|失败|超时|不可用|临时)",
        ]
        .iter()
        .map(|p| Regex::new(p).unwrap())
        .collect()
    })
}

fn fallback_prefix_patterns() -> &'static Vec<Regex> {
    static SET: OnceLock<Vec<Regex>> = OnceLock::new();
    SET.get_or_init(|| {
        [
            r"(?i)^(?:User|Assistant|System)\s+(?:asked|requested|shared|sent|provided|explained|confirmed|discussed)\s+",
            r"^(?:用户|助手|系统)(?:询问|请求|分享|发送|提供|解释|确认|讨论)(?:了)?",
        ]
        .iter()
        .map(|p| Regex::new(p).unwrap())
        .collect()
    })
}

fn meta_clause_patterns() -> &'static Vec<Regex> {
    static SET: OnceLock<Vec<Regex>> = OnceLock::new();
    SET.get_or_init(|| {
        [
            r"(?i)\bThis interaction indicates\b.*$",
            r"(?i)\baligns with user's established interest\b.*$",
            r"(?i)\bNo new information added\b.*$",
        ]
        .iter()
        .map(|p| Regex::new(p).unwrap())
        .collect()
    })
}

fn ws_collapse(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Normalize one bullet: collapse whitespace, reject non-strings/fences,
/// cap length. Returns `(bullet, reason)`.
pub fn sanitize_daily_bullet(item: &Value) -> (Option<String>, &'static str) {
    let Some(s) = item.as_str() else {
        return (None, "invalid_item");
    };
    let text = ws_collapse(s);
    if text.is_empty() {
        return (None, "empty_item");
    }
    if text.contains("```") {
        return (None, "contains_code_block");
    }
    if text.chars().count() > DAILY_BULLET_MAX_CHARS {
        let capped: String = text.chars().take(DAILY_BULLET_MAX_CHARS - 3).collect();
        return (Some(format!("{}...", capped.trim_end())), "ok");
    }
    (Some(text), "ok")
}

/// Strict normalization of the model's `daily_sections` payload.
/// Any invalid section or item rejects the whole payload.
pub fn normalize_daily_sections(value: Option<&Value>) -> (Option<DailySections>, String) {
    let Some(value) = value else {
        return (None, "missing".into());
    };
    let Some(obj) = value.as_object() else {
        return (None, "not_object".into());
    };
    let mut normalized = DailySections::new();
    for (key, _) in DAILY_SECTION_KEYS {
        let Some(raw) = obj.get(*key) else {
            continue;
        };
        if raw.is_null() {
            continue;
        }
        let Some(items) = raw.as_array() else {
            return (None, format!("invalid_type:{key}"));
        };
        let mut bullets = Vec::new();
        for item in items {
            let (bullet, reason) = sanitize_daily_bullet(item);
            if reason == "invalid_item" {
                return (None, format!("invalid_item:{key}"));
            }
            if let Some(b) = bullet {
                bullets.push(b);
            }
        }
        if !bullets.is_empty() {
            normalized.insert(key.to_string(), bullets);
        }
    }
    if normalized.is_empty() {
        return (None, "empty".into());
    }
    (Some(normalized), "ok".into())
}

/// Best-effort salvage: keep valid list-of-string sections, drop the rest.
pub fn coerce_partial_daily_sections(value: Option<&Value>) -> Option<DailySections> {
    let obj = value?.as_object()?;
    let mut normalized = DailySections::new();
    for (key, _) in DAILY_SECTION_KEYS {
        let Some(items) = obj.get(*key).and_then(Value::as_array) else {
            continue;
        };
        let bullets: Vec<String> = items
            .iter()
            .filter_map(|item| sanitize_daily_bullet(item).0)
            .collect();
        if !bullets.is_empty() {
            normalized.insert(key.to_string(), bullets);
        }
    }
    if normalized.is_empty() {
        None
    } else {
        Some(normalized)
    }
}

/// Strip the `[YYYY-MM-DD HH:MM]` prefix from a history entry.
pub fn history_entry_body(entry: &str) -> String {
    let text = entry.trim();
    if text.starts_with('[') {
        if let Some((_, rest)) = text.split_once(']') {
            return rest.trim().to_string();
        }
    }
    text.to_string()
}

/// Remove templated narration ("User asked …", trailing meta clauses) from a
/// fallback bullet while keeping its core content.
pub fn compact_fallback_bullet(text: &str) -> String {
    let mut compact = ws_collapse(text);
    if compact.is_empty() {
        return compact;
    }
    for pattern in fallback_prefix_patterns() {
        compact = pattern.replace(&compact, "").trim().to_string();
    }
    for pattern in meta_clause_patterns() {
        compact = pattern.replace(&compact, "").trim().to_string();
    }
    compact
        .trim_start_matches(|c: char| c == '-' || c == ':' || c == ';' || c.is_whitespace())
        .to_string()
}

/// Keyword classification of a bullet into one of the four daily sections.
pub fn daily_section_for_entry(entry: &str) -> &'static str {
    let body = history_entry_body(entry).to_lowercase();
    const DECISION: &[&str] = &["decid", "decision", "选择", "决定", "方案"];
    const OPEN: &[&str] = &[
        "open item",
        "follow-up",
        "follow up",
        "todo",
        "next step",
        "待办",
        "后续",
        "未完成",
    ];
    const TOOL: &[&str] = &[
        "tool",
        "command",
        "exec",
        "edited",
        "modified",
        "created",
        "read_file",
        "write_file",
        "edit_file",
        "bash",
    ];
    if DECISION.iter().any(|k| body.contains(k)) {
        return "Decisions";
    }
    if OPEN.iter().any(|k| body.contains(k)) {
        return "Open Questions";
    }
    if TOOL.iter().any(|k| body.contains(k)) {
        return "Tool Activity";
    }
    "Topics"
}

/// Synthesize bullets from a history entry: split on sentence terminators,
/// filter short/transient/duplicate candidates, classify each, keep at most
/// [`SYNTH_MAX_BULLETS`].
pub fn synthesize_daily_sections(entry: &str) -> Option<DailySections> {
    let compact = compact_fallback_bullet(&history_entry_body(entry));
    if compact.is_empty() {
        return None;
    }
    let mut candidates: Vec<String> = compact
        .split(['。', '！', '？', '!', '?', ';', '；', '.'])
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .map(str::to_string)
        .collect();
    if candidates.is_empty() {
        candidates.push(compact);
    }

    let mut sections = DailySections::new();
    let mut seen: Vec<String> = Vec::new();
    let mut used = 0usize;
    for part in candidates {
        let (bullet, _) = sanitize_daily_bullet(&Value::String(part));
        let Some(bullet) = bullet else { continue };
        if bullet.chars().count() < SYNTH_MIN_BULLET_CHARS {
            continue;
        }
        if synth_exclude_patterns().iter().any(|p| p.is_match(&bullet)) {
            continue;
        }
        let normalized = ws_collapse(&bullet).to_lowercase();
        if seen.contains(&normalized) {
            continue;
        }
        seen.push(normalized);
        let section = daily_section_for_entry(&bullet);
        let Some((key, _)) = DAILY_SECTION_KEYS.iter().find(|(_, name)| *name == section) else {
            continue;
        };
        sections.entry(key.to_string()).or_default().push(bullet);
        used += 1;
        if used >= SYNTH_MAX_BULLETS {
            break;
        }
    }
    if sections.is_empty() {
        None
    } else {
        Some(sections)
    }
}

/// The resolved daily write plan.
#[derive(Debug, Clone)]
pub struct DailyRoutingPlan {
    /// Payload handed to the structured daily writer; None means "write
    /// nothing" (required mode with no usable payload).
    pub sections_payload: Option<Value>,
    pub structured_source: String,
    pub model_daily_sections_ok: bool,
    pub model_daily_sections_reason: String,
}

/// Resolve the best payload for the structured daily write.
pub fn resolve_daily_routing(
    entry_text: &str,
    raw_daily_sections: Option<&Value>,
    mode: DailySectionsMode,
) -> DailyRoutingPlan {
    let (_, model_reason) = normalize_daily_sections(raw_daily_sections);
    if model_reason == "ok" {
        return DailyRoutingPlan {
            sections_payload: raw_daily_sections.cloned(),
            structured_source: "model".into(),
            model_daily_sections_ok: true,
            model_daily_sections_reason: "ok".into(),
        };
    }

    if let Some(salvaged) = coerce_partial_daily_sections(raw_daily_sections) {
        let salvaged_value = serde_json::to_value(&salvaged).unwrap_or(Value::Null);
        if raw_daily_sections != Some(&salvaged_value) {
            return DailyRoutingPlan {
                sections_payload: Some(salvaged_value),
                structured_source: "salvaged_model_partial".into(),
                model_daily_sections_ok: false,
                model_daily_sections_reason: model_reason,
            };
        }
    }

    if let Some(synthesized) = synthesize_daily_sections(entry_text) {
        let source = if raw_daily_sections.is_none() {
            "synthesized_missing"
        } else {
            "synthesized_after_invalid"
        };
        return DailyRoutingPlan {
            sections_payload: serde_json::to_value(&synthesized).ok(),
            structured_source: source.into(),
            model_daily_sections_ok: false,
            model_daily_sections_reason: model_reason,
        };
    }

    if mode == DailySectionsMode::Required {
        return DailyRoutingPlan {
            sections_payload: None,
            structured_source: "required_missing".into(),
            model_daily_sections_ok: false,
            model_daily_sections_reason: model_reason,
        };
    }
    DailyRoutingPlan {
        sections_payload: raw_daily_sections.cloned(),
        structured_source: "fallback_unstructured".into(),
        model_daily_sections_ok: false,
        model_daily_sections_reason: model_reason,
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn normalize_accepts_well_formed_payload() {
        let payload = json!({"topics": ["rust", "memory"], "decisions": ["use tokio"]});
        let (normalized, reason) = normalize_daily_sections(Some(&payload));
        assert_eq!(reason, "ok");
        let normalized = normalized.unwrap();
        assert_eq!(normalized["topics"], vec!["rust", "memory"]);
    }

    #[test]
    fn normalize_rejects_non_list_section() {
        let payload = json!({"topics": "not a list"});
        let (normalized, reason) = normalize_daily_sections(Some(&payload));
        assert!(normalized.is_none());
        assert_eq!(reason, "invalid_type:topics");
    }

    #[test]
    fn normalize_rejects_non_string_item() {
        let payload = json!({"topics": ["ok", 42]});
        let (_, reason) = normalize_daily_sections(Some(&payload));
        assert_eq!(reason, "invalid_item:topics");
    }

    #[test]
    fn normalize_missing_and_empty_reasons() {
        assert_eq!(normalize_daily_sections(None).1, "missing");
        assert_eq!(
            normalize_daily_sections(Some(&json!({"topics": []}))).1,
            "empty"
        );
        assert_eq!(normalize_daily_sections(Some(&json!("str"))).1, "not_object");
    }

    #[test]
    fn salvage_keeps_valid_sections_only() {
        let payload = json!({"topics": ["good"], "decisions": "broken"});
        let salvaged = coerce_partial_daily_sections(Some(&payload)).unwrap();
        assert_eq!(salvaged.len(), 1);
        assert_eq!(salvaged["topics"], vec!["good"]);
    }

    #[test]
    fn routing_prefers_model_payload() {
        let payload = json!({"topics": ["a"]});
        let plan = resolve_daily_routing("entry", Some(&payload), DailySectionsMode::Compatible);
        assert_eq!(plan.structured_source, "model");
        assert!(plan.model_daily_sections_ok);
    }

    #[test]
    fn routing_salvages_partial_payload() {
        let payload = json!({"topics": ["good"], "decisions": 7});
        let plan = resolve_daily_routing("entry", Some(&payload), DailySectionsMode::Compatible);
        assert_eq!(plan.structured_source, "salvaged_model_partial");
        assert_eq!(plan.model_daily_sections_reason, "invalid_type:decisions");
    }

    #[test]
    fn routing_synthesizes_when_payload_missing() {
        let entry = "[2026-03-01 10:00] Discussed the deployment plan. Decided to use blue-green rollout.";
        let plan = resolve_daily_routing(entry, None, DailySectionsMode::Compatible);
        assert_eq!(plan.structured_source, "synthesized_missing");
        let payload = plan.sections_payload.unwrap();
        assert!(payload.get("decisions").is_some(), "{payload}");
    }

    #[test]
    fn routing_required_mode_writes_nothing_when_unusable() {
        let plan = resolve_daily_routing("[2026-03-01 10:00] x", None, DailySectionsMode::Required);
        assert_eq!(plan.structured_source, "required_missing");
        assert!(plan.sections_payload.is_none());
    }

    #[test]
    fn routing_falls_back_unstructured_in_compatible_mode() {
        // Entry too short to synthesize anything.
        let plan = resolve_daily_routing("[2026-03-01 10:00] ok", None, DailySectionsMode::Compatible);
        assert_eq!(plan.structured_source, "fallback_unstructured");
    }

    #[test]
    fn classification_heuristics() {
        assert_eq!(daily_section_for_entry("we decided to ship"), "Decisions");
        assert_eq!(daily_section_for_entry("todo: check the logs"), "Open Questions");
        assert_eq!(daily_section_for_entry("edited config file"), "Tool Activity");
        assert_eq!(daily_section_for_entry("talked about cats"), "Topics");
    }

    #[test]
    fn synthesis_filters_transient_and_short_parts() {
        let entry = "[2026-03-01 10:00] Reviewed architecture for the importer. ok. Request failed with 503.";
        let sections = synthesize_daily_sections(entry).unwrap();
        let all: Vec<&String> = sections.values().flatten().collect();
        assert_eq!(all.len(), 1, "{all:?}");
        assert!(all[0].contains("architecture"));
    }

    #[test]
    fn synthesis_caps_bullet_count() {
        let entry = format!(
            "[2026-03-01 10:00] {}",
            (0..8)
                .map(|i| format!("Discussed subsystem number {i} in depth"))
                .collect::<Vec<_>>()
                .join(". ")
        );
        let sections = synthesize_daily_sections(&entry).unwrap();
        let total: usize = sections.values().map(Vec::len).sum();
        assert_eq!(total, 4);
    }

    #[test]
    fn compact_fallback_strips_narration_prefix() {
        let out = compact_fallback_bullet("User asked about the weather in Berlin");
        assert_eq!(out, "about the weather in Berlin");
    }

    #[test]
    fn bullet_sanitizer_caps_length() {
        let long = Value::String("x".repeat(500));
        let (bullet, reason) = sanitize_daily_bullet(&long);
        assert_eq!(reason, "ok");
        assert!(bullet.unwrap().chars().count() <= DAILY_BULLET_MAX_CHARS);
    }

    #[test]
    fn bullet_sanitizer_rejects_fences_and_non_strings() {
        assert_eq!(sanitize_daily_bullet(&json!(1)).1, "invalid_item");
        assert_eq!(
            sanitize_daily_bullet(&json!("has ``` fence")).1,
            "contains_code_block"
        );
        assert_eq!(sanitize_daily_bullet(&json!("   ")).1, "empty_item");
    }
}
