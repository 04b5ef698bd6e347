// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Atomic file primitives and markdown H2 section parsing.
//!
//! Replacement writes go through a temp file + rename so readers never see a
//! partial MEMORY.md. Appends use a single `write` on an `O_APPEND` handle
//! so concurrent JSONL rows are never torn.

use std::io::Write;
use std::path::Path;

/// Replace `path` atomically with `content`.
pub fn atomic_write_text(path: &Path, content: &str) -> std::io::Result<()> {
    let dir = path.parent().unwrap_or(Path::new("."));
    std::fs::create_dir_all(dir)?;
    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    tmp.write_all(content.as_bytes())?;
    tmp.flush()?;
    tmp.persist(path).map_err(|e| e.error)?;
    Ok(())
}

/// Append `content` to `path` in one write call, creating the file if absent.
pub fn atomic_append_text(path: &Path, content: &str) -> std::io::Result<()> {
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir)?;
    }
    let mut file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)?;
    file.write_all(content.as_bytes())
}

/// Parse markdown into preamble lines and `(heading, body_lines)` sections,
/// splitting on `## ` headings. A repeated heading folds into the first
/// occurrence, preserving first-seen order.
pub fn parse_h2_sections(text: &str) -> (Vec<String>, Vec<(String, Vec<String>)>) {
    let mut preamble: Vec<String> = Vec::new();
    let mut sections: Vec<(String, Vec<String>)> = Vec::new();
    let mut current: Option<usize> = None;

    for raw_line in text.lines() {
        if let Some(heading) = h2_heading(raw_line) {
            current = Some(
                sections
                    .iter()
                    .position(|(h, _)| h == &heading)
                    .unwrap_or_else(|| {
                        sections.push((heading.clone(), Vec::new()));
                        sections.len() - 1
                    }),
            );
            continue;
        }
        match current {
            None => preamble.push(raw_line.to_string()),
            Some(idx) => sections[idx].1.push(raw_line.to_string()),
        }
    }
    (preamble, sections)
}

/// Render preamble and sections back to markdown text.
pub fn render_h2_sections(preamble: &[String], sections: &[(String, Vec<String>)]) -> String {
    let mut parts: Vec<String> = Vec::new();
    let preamble_text = preamble.join("\n");
    let preamble_text = preamble_text.trim_matches('\n');
    if !preamble_text.is_empty() {
        parts.push(preamble_text.to_string());
    }
    for (heading, lines) in sections {
        let body = lines.join("\n");
        let body = body.trim_matches('\n');
        if body.is_empty() {
            parts.push(format!("## {heading}"));
        } else {
            parts.push(format!("## {heading}\n{body}"));
        }
    }
    let rendered = parts.join("\n\n");
    let rendered = rendered.trim_end();
    if rendered.is_empty() {
        String::new()
    } else {
        format!("{rendered}\n")
    }
}

/// `## Heading` → `Some("Heading")`.
pub fn h2_heading(line: &str) -> Option<String> {
    line.strip_prefix("## ")
        .map(|h| h.trim().to_string())
        .filter(|h| !h.is_empty())
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn atomic_write_replaces_content() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("MEMORY.md");
        atomic_write_text(&path, "first").unwrap();
        atomic_write_text(&path, "second").unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "second");
    }

    #[test]
    fn atomic_append_accumulates() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("HISTORY.md");
        atomic_append_text(&path, "a\n").unwrap();
        atomic_append_text(&path, "b\n").unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "a\nb\n");
    }

    #[test]
    fn parse_splits_preamble_and_sections() {
        let (pre, sections) = parse_h2_sections("intro\n\n## One\n- a\n\n## Two\n- b\n");
        assert_eq!(pre[0], "intro");
        assert_eq!(sections.len(), 2);
        assert_eq!(sections[0].0, "One");
        assert!(sections[0].1.contains(&"- a".to_string()));
    }

    #[test]
    fn duplicate_headings_fold_into_first() {
        let (_, sections) = parse_h2_sections("## A\n- 1\n## B\n- x\n## A\n- 2\n");
        assert_eq!(sections.len(), 2);
        assert_eq!(sections[0].1, vec!["- 1", "- 2"]);
    }

    #[test]
    fn render_round_trips_parse() {
        let text = "intro\n\n## One\n- a\n\n## Two\n- b\n";
        let (pre, sections) = parse_h2_sections(text);
        let rendered = render_h2_sections(&pre, &sections);
        let (pre2, sections2) = parse_h2_sections(&rendered);
        assert_eq!(pre.join("\n").trim(), pre2.join("\n").trim());
        assert_eq!(sections, sections2);
    }

    #[test]
    fn render_empty_section_keeps_heading() {
        let rendered = render_h2_sections(&[], &[("Topics".into(), vec![])]);
        assert_eq!(rendered, "## Topics\n");
    }

    #[test]
    fn h2_heading_trims_and_rejects_empty() {
        assert_eq!(h2_heading("##  Spaced  ").as_deref(), Some("Spaced"));
        assert_eq!(h2_heading("### deeper"), None);
        assert_eq!(h2_heading("## "), None);
        assert_eq!(h2_heading("plain"), None);
    }
}
