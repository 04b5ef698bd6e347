// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use async_trait::async_trait;
use serde_json::{json, Value};

pub type JsonMap = serde_json::Map<String, Value>;

/// Capability group a tool belongs to; the context builder uses this to
/// group the runtime tool catalog in the system prompt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ToolCapability {
    Filesystem,
    Shell,
    Web,
    Messaging,
    Subagents,
    Other,
}

impl ToolCapability {
    pub fn label(self) -> &'static str {
        match self {
            Self::Filesystem => "Filesystem",
            Self::Shell => "Shell",
            Self::Web => "Web",
            Self::Messaging => "Messaging",
            Self::Subagents => "Subagents",
            Self::Other => "Other",
        }
    }
}

/// Structured result of one tool execution.
///
/// `details.op` identifies the operation; only a whitelisted subset of
/// `details` is persisted into session history by the turn runner.
#[derive(Debug, Clone, Default)]
pub struct ToolExecutionResult {
    pub text: String,
    pub details: Option<JsonMap>,
    pub is_error: bool,
}

impl ToolExecutionResult {
    pub fn ok(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            details: None,
            is_error: false,
        }
    }

    pub fn ok_with_details(text: impl Into<String>, details: JsonMap) -> Self {
        Self {
            text: text.into(),
            details: Some(details),
            is_error: false,
        }
    }

    pub fn err(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            details: None,
            is_error: true,
        }
    }

    pub fn err_with_details(text: impl Into<String>, details: JsonMap) -> Self {
        Self {
            text: text.into(),
            details: Some(details),
            is_error: true,
        }
    }

    pub fn detail_op(&self) -> Option<&str> {
        self.details
            .as_ref()
            .and_then(|d| d.get("op"))
            .and_then(Value::as_str)
    }
}

/// Trait every agent tool implements.
#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;
    fn description(&self) -> &str;
    /// JSON Schema of the parameters object.
    fn parameters_schema(&self) -> Value;
    fn capability(&self) -> ToolCapability {
        ToolCapability::Other
    }
    /// Short caution shown in the full-mode tool catalog for risky tools.
    fn risk_note(&self) -> Option<&str> {
        None
    }
    /// Execute with already-validated parameters. `Err` is converted into an
    /// error result by the registry; tools may also return
    /// `ToolExecutionResult { is_error: true }` directly.
    async fn execute(&self, params: &JsonMap) -> anyhow::Result<ToolExecutionResult>;
}

/// OpenAI function-call definition for a tool.
pub fn tool_definition(tool: &dyn Tool) -> Value {
    json!({
        "type": "function",
        "function": {
            "name": tool.name(),
            "description": tool.description(),
            "parameters": tool.parameters_schema(),
        }
    })
}

/// Required parameter names declared by a tool's schema.
pub fn required_params(schema: &Value) -> Vec<String> {
    schema["required"]
        .as_array()
        .map(|req| {
            req.iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

/// Validate `params` against the tool's schema: required keys present and
/// declared property types respected. Returns a list of problems.
pub fn validate_params(schema: &Value, params: &JsonMap) -> Vec<String> {
    let mut errors = Vec::new();
    for name in required_params(schema) {
        match params.get(&name) {
            None | Some(Value::Null) => {
                errors.push(format!("missing required parameter '{name}'"));
            }
            _ => {}
        }
    }
    if let Some(properties) = schema["properties"].as_object() {
        for (name, value) in params {
            let Some(expected) = properties.get(name).and_then(|p| p["type"].as_str()) else {
                continue;
            };
            let ok = match expected {
                "string" => value.is_string(),
                "integer" => value.is_i64() || value.is_u64(),
                "number" => value.is_number(),
                "boolean" => value.is_boolean(),
                "array" => value.is_array(),
                "object" => value.is_object(),
                _ => true,
            };
            if !ok && !value.is_null() {
                errors.push(format!("parameter '{name}' must be a {expected}"));
            }
        }
    }
    errors
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
