// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Shell execution tool with a best-effort safety guard and hard timeout.

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::warn;

use crate::details::{details_with_op, OP_EXEC};
use crate::tool::{JsonMap, Tool, ToolCapability, ToolExecutionResult};

const DEFAULT_DENY_PATTERNS: &[&str] = &[
    "rm -rf /",
    "rm -fr /",
    "mkfs",
    "dd if=",
    ":(){",
    "> /dev/sd",
    "shutdown",
    "reboot",
    "poweroff",
];

const HARD_REJECT_COMMANDS: &[&str] = &["mkfs", "diskpart", "shutdown", "reboot", "poweroff"];
const REJECT_FIRST_TOKENS: &[&str] = &["sudo", "su", "eval", "exec"];

pub struct ExecTool {
    workspace: PathBuf,
    timeout: Duration,
    max_output_bytes: usize,
    deny_patterns: Vec<String>,
    audit: bool,
}

impl ExecTool {
    pub fn new(workspace: PathBuf, timeout: Duration, max_output_bytes: usize, audit: bool) -> Self {
        Self {
            workspace,
            timeout,
            max_output_bytes,
            deny_patterns: DEFAULT_DENY_PATTERNS.iter().map(|s| s.to_string()).collect(),
            audit,
        }
    }

    /// Return the refusal text when the command is blocked, else None.
    fn guard(&self, command: &str) -> Option<String> {
        let normalized: String = command
            .trim()
            .chars()
            .map(|c| if c == '\t' || c == '\n' || c == '\r' { ' ' } else { c })
            .collect();
        let lower = normalized.to_lowercase();

        for pattern in &self.deny_patterns {
            if lower.contains(pattern) {
                self.audit_blocked(command, &format!("deny_pattern matched: {pattern}"));
                return Some(
                    "Error: Command blocked by safety guard (dangerous pattern detected)".into(),
                );
            }
        }

        let tokens: Vec<&str> = normalized.split_whitespace().collect();
        let Some(first_raw) = tokens.first() else {
            return None;
        };
        let first = first_raw.rsplit('/').next().unwrap_or(first_raw);
        if HARD_REJECT_COMMANDS.contains(&first) || REJECT_FIRST_TOKENS.contains(&first) {
            self.audit_blocked(command, "structural_check");
            return Some(format!(
                "Error: Command blocked by safety guard (dangerous command: {first})"
            ));
        }
        if first == "rm" {
            for tok in &tokens[1..] {
                let dangerous = (tok.starts_with('-')
                    && !tok.starts_with("--")
                    && (tok.contains('r') || tok.contains('f')))
                    || *tok == "--recursive"
                    || *tok == "--force";
                if dangerous {
                    self.audit_blocked(command, "structural_check");
                    return Some(
                        "Error: Command blocked by safety guard (dangerous rm flags)".into(),
                    );
                }
            }
        }
        None
    }

    fn audit_blocked(&self, command: &str, reason: &str) {
        if self.audit {
            warn!(target: "nanobot::audit", command, reason, "shell_command_blocked");
        }
    }

    fn format_output(&self, stdout: &[u8], stderr: &[u8], exit_code: Option<i32>) -> String {
        let mut parts: Vec<String> = Vec::new();
        if !stdout.is_empty() {
            parts.push(String::from_utf8_lossy(stdout).to_string());
        }
        let stderr_text = String::from_utf8_lossy(stderr);
        if !stderr_text.trim().is_empty() {
            parts.push(format!("STDERR:\n{stderr_text}"));
        }
        if let Some(code) = exit_code {
            if code != 0 {
                parts.push(format!("\nExit code: {code}"));
            }
        }
        let mut result = if parts.is_empty() {
            "(no output)".to_string()
        } else {
            parts.join("\n")
        };
        if result.len() > self.max_output_bytes {
            let omitted = result.len() - self.max_output_bytes;
            let mut cut = self.max_output_bytes;
            while !result.is_char_boundary(cut) {
                cut -= 1;
            }
            result.truncate(cut);
            result.push_str(&format!("\n... (truncated, {omitted} more chars)"));
        }
        result
    }
}

#[async_trait]
impl Tool for ExecTool {
    fn name(&self) -> &str {
        "exec"
    }
    fn description(&self) -> &str {
        "Execute a shell command in the workspace and return its output."
    }
    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "command": {"type": "string", "description": "The shell command to execute"},
            },
            "required": ["command"],
        })
    }
    fn capability(&self) -> ToolCapability {
        ToolCapability::Shell
    }
    fn risk_note(&self) -> Option<&str> {
        Some("runs arbitrary shell commands; destructive patterns are blocked best-effort")
    }

    async fn execute(&self, params: &JsonMap) -> anyhow::Result<ToolExecutionResult> {
        let command = params
            .get("command")
            .and_then(Value::as_str)
            .unwrap_or_default();

        if let Some(refusal) = self.guard(command) {
            let details = details_with_op(OP_EXEC, &[("blocked", json!(true))]);
            return Ok(ToolExecutionResult::err_with_details(refusal, details));
        }

        let child = tokio::process::Command::new("sh")
            .arg("-c")
            .arg(command)
            .current_dir(&self.workspace)
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(true)
            .spawn();
        let child = match child {
            Ok(c) => c,
            Err(e) => {
                return Ok(ToolExecutionResult::err(format!(
                    "Error executing command: {e}"
                )))
            }
        };

        match tokio::time::timeout(self.timeout, child.wait_with_output()).await {
            Err(_) => {
                let details = details_with_op(OP_EXEC, &[("timed_out", json!(true))]);
                Ok(ToolExecutionResult::err_with_details(
                    format!(
                        "Error: Command timed out after {} seconds",
                        self.timeout.as_secs()
                    ),
                    details,
                ))
            }
            Ok(Err(e)) => Ok(ToolExecutionResult::err(format!(
                "Error executing command: {e}"
            ))),
            Ok(Ok(output)) => {
                let exit_code = output.status.code();
                let text = self.format_output(&output.stdout, &output.stderr, exit_code);
                let details = details_with_op(
                    OP_EXEC,
                    &[
                        ("exit_code", json!(exit_code)),
                        ("timed_out", json!(false)),
                    ],
                );
                Ok(ToolExecutionResult {
                    text,
                    details: Some(details),
                    is_error: !output.status.success(),
                })
            }
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn tool(timeout_secs: u64) -> (tempfile::TempDir, ExecTool) {
        let dir = tempfile::tempdir().unwrap();
        let tool = ExecTool::new(
            dir.path().to_path_buf(),
            Duration::from_secs(timeout_secs),
            10_000,
            false,
        );
        (dir, tool)
    }

    fn params(command: &str) -> JsonMap {
        let mut map = JsonMap::new();
        map.insert("command".into(), json!(command));
        map
    }

    #[tokio::test]
    async fn echo_succeeds_with_exit_code_detail() {
        let (_dir, tool) = tool(10);
        let result = tool.execute(&params("echo hi")).await.unwrap();
        assert!(!result.is_error);
        assert!(result.text.contains("hi"));
        let details = result.details.unwrap();
        assert_eq!(details["op"], json!("exec"));
        assert_eq!(details["exit_code"], json!(0));
    }

    #[tokio::test]
    async fn nonzero_exit_is_error_with_code() {
        let (_dir, tool) = tool(10);
        let result = tool.execute(&params("exit 3")).await.unwrap();
        assert!(result.is_error);
        assert!(result.text.contains("Exit code: 3"));
        assert_eq!(result.details.unwrap()["exit_code"], json!(3));
    }

    #[tokio::test]
    async fn stderr_is_labelled() {
        let (_dir, tool) = tool(10);
        let result = tool.execute(&params("echo oops 1>&2")).await.unwrap();
        assert!(result.text.contains("STDERR:"));
        assert!(result.text.contains("oops"));
    }

    #[tokio::test]
    async fn timeout_kills_and_reports() {
        let (_dir, tool) = tool(1);
        let result = tool.execute(&params("sleep 5")).await.unwrap();
        assert!(result.is_error);
        assert!(result.text.contains("timed out after 1 seconds"));
        assert_eq!(result.details.unwrap()["timed_out"], json!(true));
    }

    #[tokio::test]
    async fn dangerous_patterns_are_blocked() {
        let (_dir, tool) = tool(10);
        for cmd in ["rm -rf / --no-preserve-root", "sudo ls", "rm -r subdir", "mkfs.ext4 /dev/sda"] {
            let result = tool.execute(&params(cmd)).await.unwrap();
            assert!(result.is_error, "{cmd} should be blocked");
            assert!(result.text.contains("blocked by safety guard"), "{cmd}");
            assert_eq!(result.details.unwrap()["blocked"], json!(true));
        }
    }

    #[tokio::test]
    async fn runs_in_workspace_cwd() {
        let (dir, tool) = tool(10);
        let result = tool.execute(&params("pwd")).await.unwrap();
        let canonical = dir.path().canonicalize().unwrap();
        assert!(result.text.trim().ends_with(
            canonical.file_name().unwrap().to_str().unwrap()
        ));
    }

    #[tokio::test]
    async fn long_output_is_truncated_with_notice() {
        let (_dir, tool) = tool(10);
        let result = tool.execute(&params("yes x | head -20000")).await.unwrap();
        assert!(result.text.len() <= 10_100);
        assert!(result.text.contains("truncated"));
    }
}
