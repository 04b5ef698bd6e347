// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use serde_json::Value;
use tracing::{info, warn};

use crate::tool::{tool_definition, validate_params, JsonMap, Tool, ToolExecutionResult};

/// Appended to every error result so the model analyses before retrying.
const ERROR_HINT: &str = "\n\n[Analyze the error above and try a different approach.]";

/// Param keys whose values are replaced with a length placeholder in audit
/// events (file bodies are not audit material).
const REDACT_KEYS: &[&str] = &["new_content"];
/// Param keys truncated to 200 chars in audit events.
const TRUNCATE_KEYS: &[&str] = &["content", "task", "message", "command"];

/// Registry for agent tools: lookup, validation, execution wrapping, audit.
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
    order: Vec<String>,
    audit: bool,
}

impl ToolRegistry {
    pub fn new(audit: bool) -> Self {
        Self {
            tools: HashMap::new(),
            order: Vec::new(),
            audit,
        }
    }

    pub fn register(&mut self, tool: Arc<dyn Tool>) {
        let name = tool.name().to_string();
        if !self.tools.contains_key(&name) {
            self.order.push(name.clone());
        }
        self.tools.insert(name, tool);
    }

    pub fn unregister(&mut self, name: &str) {
        self.tools.remove(name);
        self.order.retain(|n| n != name);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).cloned()
    }

    pub fn has(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    /// Registered names in registration order.
    pub fn tool_names(&self) -> Vec<String> {
        self.order.clone()
    }

    /// Registered tools in registration order (for catalog rendering).
    pub fn tools(&self) -> Vec<Arc<dyn Tool>> {
        self.order
            .iter()
            .filter_map(|n| self.tools.get(n).cloned())
            .collect()
    }

    /// All tool definitions in OpenAI function format.
    pub fn definitions(&self) -> Vec<Value> {
        self.tools().iter().map(|t| tool_definition(t.as_ref())).collect()
    }

    /// Sanitize parameters for audit logging: redact bulky keys, truncate
    /// long free-text values.
    fn sanitize_params(params: &JsonMap) -> JsonMap {
        let mut sanitized = JsonMap::new();
        for (key, value) in params {
            if REDACT_KEYS.contains(&key.as_str()) {
                let len = match value {
                    Value::String(s) => s.len(),
                    other => other.to_string().len(),
                };
                sanitized.insert(key.clone(), Value::String(format!("<{len} chars>")));
                continue;
            }
            if TRUNCATE_KEYS.contains(&key.as_str()) {
                if let Value::String(s) = value {
                    if s.len() > 200 {
                        let mut cut = 200;
                        while !s.is_char_boundary(cut) {
                            cut -= 1;
                        }
                        sanitized.insert(key.clone(), Value::String(format!("{}...", &s[..cut])));
                        continue;
                    }
                }
            }
            sanitized.insert(key.clone(), value.clone());
        }
        sanitized
    }

    /// Execute a tool and return a structured result. Unknown tools,
    /// validation failures, and execution errors all come back as error
    /// results with the retry hint appended; nothing propagates as `Err`.
    pub async fn execute(&self, name: &str, params: &JsonMap) -> ToolExecutionResult {
        let Some(tool) = self.tools.get(name) else {
            return ToolExecutionResult::err(format!(
                "Error: Tool '{name}' not found. Available: {}",
                self.tool_names().join(", ")
            ));
        };

        if self.audit {
            info!(
                target: "nanobot::audit",
                tool = name,
                params = %serde_json::Value::Object(Self::sanitize_params(params)),
                "tool_call_started"
            );
        }

        let started = Instant::now();
        let errors = validate_params(&tool.parameters_schema(), params);
        if !errors.is_empty() {
            if self.audit {
                warn!(target: "nanobot::audit", tool = name, error = "invalid_params", "tool_call_failed");
            }
            return ToolExecutionResult::err(format!(
                "Error: Invalid parameters for tool '{name}': {}{ERROR_HINT}",
                errors.join("; ")
            ));
        }

        match tool.execute(params).await {
            Ok(mut result) => {
                if result.text.starts_with("Error") && !result.text.ends_with(ERROR_HINT) {
                    result.text.push_str(ERROR_HINT);
                    result.is_error = true;
                }
                if self.audit {
                    info!(
                        target: "nanobot::audit",
                        tool = name,
                        duration_ms = started.elapsed().as_millis() as u64,
                        result_length = result.text.len(),
                        is_error = result.is_error,
                        detail_op = result.detail_op().unwrap_or(""),
                        "tool_call_completed"
                    );
                }
                result
            }
            Err(e) => {
                if self.audit {
                    warn!(
                        target: "nanobot::audit",
                        tool = name,
                        error = %e,
                        duration_ms = started.elapsed().as_millis() as u64,
                        "tool_call_failed"
                    );
                }
                ToolExecutionResult::err(format!("Error executing {name}: {e}{ERROR_HINT}"))
            }
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
