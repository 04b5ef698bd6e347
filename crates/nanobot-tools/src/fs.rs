// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Filesystem tools: read, write, edit, list.
//!
//! Safety contract: when a workspace restriction is active, paths must
//! resolve inside the workspace root, every symlink along the requested
//! path must resolve inside it too, and writes refuse to follow a symlink
//! at the final component. Allowed and blocked operations both emit audit
//! events.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::{info, warn};

use crate::details::{
    file_details_base, OP_EDIT_FILE, OP_LIST_DIR, OP_READ_FILE, OP_WRITE_FILE,
};
use crate::tool::{JsonMap, Tool, ToolCapability, ToolExecutionResult};

const DIFF_PREVIEW_MAX_CHARS: usize = 4000;

/// Shared configuration for the filesystem tool family.
#[derive(Clone)]
pub struct FsToolConfig {
    pub workspace: PathBuf,
    /// None disables containment (paths may point anywhere).
    pub allowed_dir: Option<PathBuf>,
    pub max_read_bytes: usize,
    pub audit: bool,
}

impl FsToolConfig {
    pub fn new(workspace: &Path, restrict_to_workspace: bool, max_read_bytes: usize, audit: bool) -> Self {
        Self {
            workspace: workspace.to_path_buf(),
            allowed_dir: restrict_to_workspace.then(|| workspace.to_path_buf()),
            max_read_bytes,
            audit,
        }
    }
}

/// Walk each component of `path` and verify every symlink resolves inside
/// `allowed_dir`.
fn check_symlink_chain(path: &Path, allowed_dir: &Path) -> Result<(), String> {
    let allowed = allowed_dir
        .canonicalize()
        .map_err(|e| format!("cannot resolve allowed directory: {e}"))?;
    let mut current = PathBuf::new();
    for part in path.components() {
        current.push(part);
        let Ok(meta) = std::fs::symlink_metadata(&current) else {
            // Path does not exist yet (e.g. a file about to be created).
            continue;
        };
        if meta.file_type().is_symlink() {
            let target = current
                .canonicalize()
                .map_err(|e| format!("cannot resolve symlink {}: {e}", current.display()))?;
            if !target.starts_with(&allowed) {
                return Err(format!(
                    "Symlink {} points to {} which is outside allowed directory {}",
                    current.display(),
                    target.display(),
                    allowed_dir.display()
                ));
            }
        }
    }
    Ok(())
}

/// Expand `~` and join relative paths onto the workspace root, without
/// resolving symlinks.
fn join_workspace(path: &str, config: &FsToolConfig) -> PathBuf {
    let mut p = PathBuf::from(path);
    if let Ok(stripped) = p.strip_prefix("~") {
        if let Some(home) = std::env::var_os("HOME") {
            p = PathBuf::from(home).join(stripped);
        }
    }
    if p.is_relative() {
        p = config.workspace.join(p);
    }
    p
}

/// Resolve `path` against the workspace (if relative) and enforce the
/// directory restriction. Returns the resolved path or a refusal message.
fn resolve_path(path: &str, config: &FsToolConfig) -> Result<PathBuf, String> {
    let p = join_workspace(path, config);

    // Resolve the deepest existing ancestor so containment also holds for
    // paths that do not exist yet.
    let resolved = match p.canonicalize() {
        Ok(r) => r,
        Err(_) => {
            let parent = p.parent().unwrap_or(Path::new("/"));
            match (parent.canonicalize(), p.file_name()) {
                (Ok(parent_resolved), Some(name)) => parent_resolved.join(name),
                (Ok(parent_resolved), None) => parent_resolved,
                _ => p.clone(),
            }
        }
    };

    if let Some(allowed_dir) = &config.allowed_dir {
        let allowed = allowed_dir
            .canonicalize()
            .map_err(|e| format!("cannot resolve allowed directory: {e}"))?;
        if !resolved.starts_with(&allowed) {
            return Err(format!(
                "Path {} is outside allowed directory {}",
                path,
                allowed_dir.display()
            ));
        }
        check_symlink_chain(&p, allowed_dir)?;
    }
    Ok(resolved)
}

/// Write refusing to follow a symlink at the final component. The check
/// runs on the requested (unresolved) path so an aliased target inside the
/// workspace is still refused.
fn safe_write(requested: &Path, resolved: &Path, content: &str) -> Result<(), String> {
    for candidate in [requested, resolved] {
        if let Ok(meta) = std::fs::symlink_metadata(candidate) {
            if meta.file_type().is_symlink() {
                return Err(format!(
                    "Refusing to write through symlink: {}",
                    candidate.display()
                ));
            }
        }
    }
    std::fs::write(resolved, content).map_err(|e| format!("write failed: {e}"))
}

/// 1-based line number of the first detected change.
fn first_changed_line(old_content: &str, new_content: &str) -> Option<usize> {
    let old_lines: Vec<&str> = old_content.lines().collect();
    let new_lines: Vec<&str> = new_content.lines().collect();
    for (idx, (old_line, new_line)) in old_lines.iter().zip(new_lines.iter()).enumerate() {
        if old_line != new_line {
            return Some(idx + 1);
        }
    }
    if old_lines.len() != new_lines.len() {
        return Some(old_lines.len().min(new_lines.len()) + 1);
    }
    None
}

fn param_str<'a>(params: &'a JsonMap, key: &str) -> &'a str {
    params.get(key).and_then(Value::as_str).unwrap_or("")
}

// ─── read_file ────────────────────────────────────────────────────────────────

pub struct ReadFileTool {
    config: Arc<FsToolConfig>,
}

impl ReadFileTool {
    pub fn new(config: Arc<FsToolConfig>) -> Self {
        Self { config }
    }
}

#[async_trait]
impl Tool for ReadFileTool {
    fn name(&self) -> &str {
        "read_file"
    }
    fn description(&self) -> &str {
        "Read the contents of a file at the given path."
    }
    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "path": {"type": "string", "description": "The file path to read"},
                "offset": {"type": "integer", "minimum": 1,
                           "description": "Optional 1-based line number to start reading from"},
                "limit": {"type": "integer", "minimum": 1,
                          "description": "Optional maximum number of lines to return"},
            },
            "required": ["path"],
        })
    }
    fn capability(&self) -> ToolCapability {
        ToolCapability::Filesystem
    }

    async fn execute(&self, params: &JsonMap) -> anyhow::Result<ToolExecutionResult> {
        let path = param_str(params, "path");
        let offset = params.get("offset").and_then(Value::as_u64).map(|v| v as usize);
        let limit = params.get("limit").and_then(Value::as_u64).map(|v| v as usize);

        let file_path = match resolve_path(path, &self.config) {
            Ok(p) => p,
            Err(reason) => {
                if self.config.audit {
                    warn!(target: "nanobot::audit", path, reason = %reason, "file_read_blocked");
                }
                return Ok(ToolExecutionResult::err(format!("Error: {reason}")));
            }
        };
        if !file_path.exists() {
            return Ok(ToolExecutionResult::err(format!("Error: File not found: {path}")));
        }
        if !file_path.is_file() {
            return Ok(ToolExecutionResult::err(format!("Error: Not a file: {path}")));
        }

        let mut content = match std::fs::read_to_string(&file_path) {
            Ok(c) => c,
            Err(e) => {
                return Ok(ToolExecutionResult::err(format!("Error reading file: {e}")))
            }
        };
        if content.len() > self.config.max_read_bytes {
            let mut cut = self.config.max_read_bytes;
            while !content.is_char_boundary(cut) {
                cut -= 1;
            }
            content.truncate(cut);
            content.push_str("\n... (truncated)");
        }
        let total_lines = content.lines().count();

        if offset.is_some() || limit.is_some() {
            let lines: Vec<&str> = content.lines().collect();
            let start = offset.unwrap_or(1).saturating_sub(1);
            if start >= lines.len() && !lines.is_empty() {
                return Ok(ToolExecutionResult::err(format!(
                    "Error: Offset {} is beyond end of file ({} lines total)",
                    offset.unwrap_or(1),
                    lines.len()
                )));
            }
            let end = match limit {
                Some(l) => (start + l).min(lines.len()),
                None => lines.len(),
            };
            let mut selected = lines[start..end].join("\n");
            if end < lines.len() {
                selected.push_str(&format!(
                    "\n\n[Showing lines {}-{} of {}. Use offset={} to continue.]",
                    start + 1,
                    end,
                    lines.len(),
                    end + 1
                ));
            }
            content = selected;
        }

        if self.config.audit {
            info!(target: "nanobot::audit", path = %file_path.display(), "file_read");
        }
        let mut details = file_details_base(OP_READ_FILE, &file_path, path);
        details.insert("bytes_read".into(), json!(content.len()));
        details.insert("total_lines".into(), json!(total_lines));
        Ok(ToolExecutionResult::ok_with_details(content, details))
    }
}

// ─── write_file ───────────────────────────────────────────────────────────────

pub struct WriteFileTool {
    config: Arc<FsToolConfig>,
}

impl WriteFileTool {
    pub fn new(config: Arc<FsToolConfig>) -> Self {
        Self { config }
    }
}

#[async_trait]
impl Tool for WriteFileTool {
    fn name(&self) -> &str {
        "write_file"
    }
    fn description(&self) -> &str {
        "Write content to a file at the given path. Creates parent directories if needed."
    }
    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "path": {"type": "string", "description": "The file path to write to"},
                "content": {"type": "string", "description": "The content to write"},
            },
            "required": ["path", "content"],
        })
    }
    fn capability(&self) -> ToolCapability {
        ToolCapability::Filesystem
    }
    fn risk_note(&self) -> Option<&str> {
        Some("overwrites existing files without confirmation")
    }

    async fn execute(&self, params: &JsonMap) -> anyhow::Result<ToolExecutionResult> {
        let path = param_str(params, "path");
        let content = param_str(params, "content");

        let file_path = match resolve_path(path, &self.config) {
            Ok(p) => p,
            Err(reason) => {
                if self.config.audit {
                    warn!(target: "nanobot::audit", path, reason = %reason, "file_write_blocked");
                }
                return Ok(ToolExecutionResult::err(format!("Error: {reason}")));
            }
        };
        let requested = join_workspace(path, &self.config);
        let existed_before = file_path.exists();
        if let Some(parent) = file_path.parent() {
            if let Err(e) = std::fs::create_dir_all(parent) {
                return Ok(ToolExecutionResult::err(format!("Error writing file: {e}")));
            }
        }
        if let Err(reason) = safe_write(&requested, &file_path, content) {
            if self.config.audit {
                warn!(target: "nanobot::audit", path, reason = %reason, "file_write_blocked");
            }
            return Ok(ToolExecutionResult::err(format!("Error: {reason}")));
        }

        if self.config.audit {
            info!(target: "nanobot::audit", path = %file_path.display(), "file_written");
        }
        let mut details = file_details_base(OP_WRITE_FILE, &file_path, path);
        details.insert("bytes_written".into(), json!(content.len()));
        details.insert("file_existed".into(), json!(existed_before));
        Ok(ToolExecutionResult::ok_with_details(
            format!("Successfully wrote {} bytes to {}", content.len(), file_path.display()),
            details,
        ))
    }
}

// ─── edit_file ────────────────────────────────────────────────────────────────

pub struct EditFileTool {
    config: Arc<FsToolConfig>,
}

impl EditFileTool {
    pub fn new(config: Arc<FsToolConfig>) -> Self {
        Self { config }
    }
}

#[async_trait]
impl Tool for EditFileTool {
    fn name(&self) -> &str {
        "edit_file"
    }
    fn description(&self) -> &str {
        "Edit a file by replacing old_text with new_text. The old_text must exist exactly in the file."
    }
    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "path": {"type": "string", "description": "The file path to edit"},
                "old_text": {"type": "string", "description": "The exact text to find and replace"},
                "new_text": {"type": "string", "description": "The text to replace with"},
            },
            "required": ["path", "old_text", "new_text"],
        })
    }
    fn capability(&self) -> ToolCapability {
        ToolCapability::Filesystem
    }

    async fn execute(&self, params: &JsonMap) -> anyhow::Result<ToolExecutionResult> {
        let path = param_str(params, "path");
        let old_text = param_str(params, "old_text");
        let new_text = param_str(params, "new_text");

        let file_path = match resolve_path(path, &self.config) {
            Ok(p) => p,
            Err(reason) => {
                if self.config.audit {
                    warn!(target: "nanobot::audit", path, reason = %reason, "file_edit_blocked");
                }
                return Ok(ToolExecutionResult::err(format!("Error: {reason}")));
            }
        };
        if !file_path.exists() {
            return Ok(ToolExecutionResult::err(format!("Error: File not found: {path}")));
        }
        let content = match std::fs::read_to_string(&file_path) {
            Ok(c) => c,
            Err(e) => return Ok(ToolExecutionResult::err(format!("Error editing file: {e}"))),
        };

        let count = content.matches(old_text).count();
        if count == 0 {
            return Ok(ToolExecutionResult::err(format!(
                "Error: old_text not found in {path}. Verify the file content with read_file first."
            )));
        }
        if count > 1 {
            return Ok(ToolExecutionResult::err(format!(
                "Error: old_text appears {count} times. Please provide more context to make it unique."
            )));
        }

        let new_content = content.replacen(old_text, new_text, 1);
        let first_changed = first_changed_line(&content, &new_content);
        let (mut diff_text, mut diff_truncated) = (diff_preview(&content, &new_content, path), false);
        if diff_text.len() > DIFF_PREVIEW_MAX_CHARS {
            let mut cut = DIFF_PREVIEW_MAX_CHARS;
            while !diff_text.is_char_boundary(cut) {
                cut -= 1;
            }
            diff_text.truncate(cut);
            diff_text.push_str("\n... (diff truncated)");
            diff_truncated = true;
        }
        let requested = join_workspace(path, &self.config);
        if let Err(reason) = safe_write(&requested, &file_path, &new_content) {
            if self.config.audit {
                warn!(target: "nanobot::audit", path, reason = %reason, "file_edit_blocked");
            }
            return Ok(ToolExecutionResult::err(format!("Error: {reason}")));
        }

        if self.config.audit {
            info!(target: "nanobot::audit", path = %file_path.display(), "file_edited");
        }
        let line_hint = first_changed
            .map(|l| format!(" (first change at line {l})"))
            .unwrap_or_default();
        let mut details = file_details_base(OP_EDIT_FILE, &file_path, path);
        details.insert("first_changed_line".into(), json!(first_changed));
        details.insert("replacement_count".into(), json!(1));
        details.insert("diff_truncated".into(), json!(diff_truncated));
        details.insert("old_text_len".into(), json!(old_text.len()));
        details.insert("new_text_len".into(), json!(new_text.len()));
        Ok(ToolExecutionResult::ok_with_details(
            format!(
                "Successfully edited {}{line_hint}\n\nDiff:\n{diff_text}",
                file_path.display()
            ),
            details,
        ))
    }
}

/// Minimal line-level change preview (changed lines around the first edit).
fn diff_preview(old: &str, new: &str, path: &str) -> String {
    let old_lines: Vec<&str> = old.lines().collect();
    let new_lines: Vec<&str> = new.lines().collect();
    let first = first_changed_line(old, new).unwrap_or(1).saturating_sub(1);

    // Trailing unchanged lines are identical in both; show the changed span.
    let mut old_end = old_lines.len();
    let mut new_end = new_lines.len();
    while old_end > first && new_end > first && old_lines[old_end - 1] == new_lines[new_end - 1] {
        old_end -= 1;
        new_end -= 1;
    }

    let mut out = vec![
        format!("--- {path} (before)"),
        format!("+++ {path} (after)"),
        format!("@@ line {} @@", first + 1),
    ];
    for line in &old_lines[first.min(old_end)..old_end] {
        out.push(format!("-{line}"));
    }
    for line in &new_lines[first.min(new_end)..new_end] {
        out.push(format!("+{line}"));
    }
    out.join("\n")
}

// ─── list_dir ─────────────────────────────────────────────────────────────────

pub struct ListDirTool {
    config: Arc<FsToolConfig>,
}

impl ListDirTool {
    pub fn new(config: Arc<FsToolConfig>) -> Self {
        Self { config }
    }
}

#[async_trait]
impl Tool for ListDirTool {
    fn name(&self) -> &str {
        "list_dir"
    }
    fn description(&self) -> &str {
        "List the contents of a directory."
    }
    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "path": {"type": "string", "description": "The directory path to list"},
            },
            "required": ["path"],
        })
    }
    fn capability(&self) -> ToolCapability {
        ToolCapability::Filesystem
    }

    async fn execute(&self, params: &JsonMap) -> anyhow::Result<ToolExecutionResult> {
        let path = param_str(params, "path");
        let dir_path = match resolve_path(path, &self.config) {
            Ok(p) => p,
            Err(reason) => {
                if self.config.audit {
                    warn!(target: "nanobot::audit", path, reason = %reason, "dir_list_blocked");
                }
                return Ok(ToolExecutionResult::err(format!("Error: {reason}")));
            }
        };
        if !dir_path.exists() {
            return Ok(ToolExecutionResult::err(format!(
                "Error: Directory not found: {path}"
            )));
        }
        if !dir_path.is_dir() {
            return Ok(ToolExecutionResult::err(format!("Error: Not a directory: {path}")));
        }

        let mut entries: Vec<(bool, String)> = match std::fs::read_dir(&dir_path) {
            Ok(rd) => rd
                .flatten()
                .map(|e| {
                    let is_dir = e.path().is_dir();
                    (is_dir, e.file_name().to_string_lossy().to_string())
                })
                .collect(),
            Err(e) => {
                return Ok(ToolExecutionResult::err(format!(
                    "Error listing directory: {e}"
                )))
            }
        };
        entries.sort_by(|a, b| a.1.cmp(&b.1));

        if self.config.audit {
            info!(target: "nanobot::audit", path = %dir_path.display(), "dir_listed");
        }
        let has_directories = entries.iter().any(|(is_dir, _)| *is_dir);
        let mut details = file_details_base(OP_LIST_DIR, &dir_path, path);
        details.insert("item_count".into(), json!(entries.len()));
        details.insert("has_directories".into(), json!(has_directories));

        if entries.is_empty() {
            return Ok(ToolExecutionResult::ok_with_details(
                format!("Directory {path} is empty"),
                details,
            ));
        }
        let listing = entries
            .iter()
            .map(|(is_dir, name)| {
                if *is_dir {
                    format!("[dir]  {name}")
                } else {
                    format!("[file] {name}")
                }
            })
            .collect::<Vec<_>>()
            .join("\n");
        Ok(ToolExecutionResult::ok_with_details(listing, details))
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
