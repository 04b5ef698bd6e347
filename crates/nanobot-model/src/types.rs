use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

// ─── Roles and content ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

/// A single typed block in a multi-part message body.
///
/// Images are carried as data URLs (`data:<mime>;base64,<b64>`) in the
/// OpenAI `image_url` envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Text { text: String },
    ImageUrl { image_url: ImageUrl },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageUrl {
    pub url: String,
}

impl ContentBlock {
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text { text: text.into() }
    }

    pub fn image(url: impl Into<String>) -> Self {
        Self::ImageUrl {
            image_url: ImageUrl { url: url.into() },
        }
    }
}

/// Message body: plain text, an ordered block list, or null.
///
/// `Null` exists because strict providers require assistant messages to carry
/// a `content` key even when the turn is tool-calls only; serializing the
/// variant produces JSON `null` rather than omitting the key.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    Blocks(Vec<ContentBlock>),
    #[default]
    Null,
}

impl MessageContent {
    /// Plain text of this body: the string itself, or the concatenation of
    /// text blocks joined by a space (matching how multi-part bodies are
    /// flattened for compaction comparisons).
    pub fn as_text(&self) -> String {
        match self {
            Self::Text(t) => t.clone(),
            Self::Blocks(blocks) => blocks
                .iter()
                .filter_map(|b| match b {
                    ContentBlock::Text { text } => Some(text.as_str()),
                    ContentBlock::ImageUrl { .. } => None,
                })
                .collect::<Vec<_>>()
                .join(" "),
            Self::Null => String::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        match self {
            Self::Text(t) => t.is_empty(),
            Self::Blocks(b) => b.is_empty(),
            Self::Null => true,
        }
    }
}

impl From<&str> for MessageContent {
    fn from(s: &str) -> Self {
        Self::Text(s.to_string())
    }
}

impl From<String> for MessageContent {
    fn from(s: String) -> Self {
        Self::Text(s)
    }
}

// ─── Tool call records ────────────────────────────────────────────────────────

/// A tool call as stored in assistant messages and sent on the wire.
/// `function.arguments` is always a JSON-encoded string.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCallRecord {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub function: FunctionCall,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionCall {
    pub name: String,
    /// JSON-encoded argument object.
    pub arguments: String,
}

impl ToolCallRecord {
    pub fn new(id: impl Into<String>, name: impl Into<String>, arguments_json: String) -> Self {
        Self {
            id: id.into(),
            kind: "function".into(),
            function: FunctionCall {
                name: name.into(),
                arguments: arguments_json,
            },
        }
    }
}

/// A tool invocation request parsed out of a provider response.
/// Arguments are decoded leniently into a JSON object.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolCallRequest {
    pub id: String,
    pub name: String,
    pub arguments: serde_json::Map<String, serde_json::Value>,
}

impl ToolCallRequest {
    /// Serialize arguments back to the wire string form.
    pub fn arguments_json(&self) -> String {
        serde_json::Value::Object(self.arguments.clone()).to_string()
    }

    pub fn to_record(&self) -> ToolCallRecord {
        ToolCallRecord::new(&self.id, &self.name, self.arguments_json())
    }
}

// ─── Chat message ─────────────────────────────────────────────────────────────

/// One conversation message in the OpenAI-compatible shape.
///
/// Optional fields are role-specific: `tool_calls` / `reasoning_content`
/// appear only on assistant messages, `tool_call_id` / `name` only on tool
/// messages, and `_tool_details` carries the whitelisted compact tool
/// metadata persisted with session history (never sent to the provider).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    #[serde(default)]
    pub content: MessageContent,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ToolCallRecord>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning_content: Option<String>,
    #[serde(
        default,
        rename = "_tool_details",
        skip_serializing_if = "Option::is_none"
    )]
    pub tool_details: Option<serde_json::Value>,
}

impl ChatMessage {
    fn bare(role: Role, content: MessageContent) -> Self {
        Self {
            role,
            content,
            tool_calls: None,
            tool_call_id: None,
            name: None,
            timestamp: None,
            reasoning_content: None,
            tool_details: None,
        }
    }

    pub fn system(content: impl Into<MessageContent>) -> Self {
        Self::bare(Role::System, content.into())
    }

    pub fn user(content: impl Into<MessageContent>) -> Self {
        Self::bare(Role::User, content.into())
    }

    pub fn assistant(content: impl Into<MessageContent>) -> Self {
        Self::bare(Role::Assistant, content.into())
    }

    /// Assistant message carrying tool calls; `content` may be null.
    pub fn assistant_tool_calls(
        content: Option<String>,
        tool_calls: Vec<ToolCallRecord>,
        reasoning_content: Option<String>,
    ) -> Self {
        let mut msg = Self::bare(
            Role::Assistant,
            content.map(MessageContent::Text).unwrap_or_default(),
        );
        msg.tool_calls = Some(tool_calls);
        msg.reasoning_content = reasoning_content;
        msg
    }

    /// `role=tool` result message paired to an assistant tool call.
    pub fn tool_result(
        tool_call_id: impl Into<String>,
        tool_name: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        let mut msg = Self::bare(Role::Tool, MessageContent::Text(content.into()));
        msg.tool_call_id = Some(tool_call_id.into());
        msg.name = Some(tool_name.into());
        msg
    }

    /// Plain text of the message body.
    pub fn text(&self) -> String {
        self.content.as_text()
    }

    /// True for messages that carry tool-call protocol semantics: a tool
    /// role, a non-empty `tool_calls` list, or a `tool_call_id`. These must
    /// never be merged or deduplicated by history compaction.
    pub fn is_tool_protocol(&self) -> bool {
        if self.role == Role::Tool {
            return true;
        }
        self.tool_calls.as_ref().is_some_and(|tc| !tc.is_empty()) || self.tool_call_id.is_some()
    }
}

// ─── Provider response ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Usage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
}

/// Response from one provider call.
///
/// Failures the driver absorbs (timeouts, HTTP errors, open circuit) come
/// back as `finish_reason == "error"` with the error text in `content`, so
/// callers can classify without unwinding.
#[derive(Debug, Clone, Default)]
pub struct ChatResponse {
    pub content: Option<String>,
    pub tool_calls: Vec<ToolCallRequest>,
    /// "stop" | "tool_calls" | "error" | "length" (provider strings pass
    /// through untouched).
    pub finish_reason: String,
    pub usage: Option<Usage>,
    pub reasoning_content: Option<String>,
}

impl ChatResponse {
    pub fn has_tool_calls(&self) -> bool {
        !self.tool_calls.is_empty()
    }

    pub fn error(text: impl Into<String>) -> Self {
        Self {
            content: Some(text.into()),
            finish_reason: "error".into(),
            ..Self::default()
        }
    }
}

/// Stable-ordered JSON used by persistence signatures.
pub fn sorted_json(value: &serde_json::Value) -> String {
    fn sort(value: &serde_json::Value) -> serde_json::Value {
        match value {
            serde_json::Value::Object(map) => {
                let sorted: BTreeMap<_, _> = map.iter().map(|(k, v)| (k.clone(), sort(v))).collect();
                serde_json::to_value(sorted).unwrap_or(serde_json::Value::Null)
            }
            serde_json::Value::Array(items) => {
                serde_json::Value::Array(items.iter().map(sort).collect())
            }
            other => other.clone(),
        }
    }
    sort(value).to_string()
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn assistant_without_text_serializes_null_content() {
        let msg = ChatMessage::assistant_tool_calls(
            None,
            vec![ToolCallRecord::new("c1", "exec", "{}".into())],
            None,
        );
        let json = serde_json::to_value(&msg).unwrap();
        assert!(json.get("content").unwrap().is_null(), "{json}");
    }

    #[test]
    fn tool_call_arguments_stay_json_strings_on_wire() {
        let msg = ChatMessage::assistant_tool_calls(
            Some("ok".into()),
            vec![ToolCallRecord::new(
                "c1",
                "exec",
                r#"{"command":"echo hi"}"#.into(),
            )],
            None,
        );
        let json = serde_json::to_value(&msg).unwrap();
        let args = &json["tool_calls"][0]["function"]["arguments"];
        assert!(args.is_string());
        assert_eq!(args.as_str().unwrap(), r#"{"command":"echo hi"}"#);
    }

    #[test]
    fn tool_result_round_trips_through_json() {
        let msg = ChatMessage::tool_result("c9", "read_file", "file body");
        let json = serde_json::to_string(&msg).unwrap();
        let back: ChatMessage = serde_json::from_str(&json).unwrap();
        assert_eq!(back, msg);
        assert_eq!(back.tool_call_id.as_deref(), Some("c9"));
    }

    #[test]
    fn tool_details_uses_underscore_key() {
        let mut msg = ChatMessage::tool_result("c1", "exec", "out");
        msg.tool_details = Some(serde_json::json!({"schema_version": 1}));
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains("\"_tool_details\""), "{json}");
    }

    #[test]
    fn multimodal_body_deserializes_into_blocks() {
        let json = r#"{"role":"user","content":[
            {"type":"image_url","image_url":{"url":"data:image/jpeg;base64,AA"}},
            {"type":"text","text":"what is this?"}]}"#;
        let msg: ChatMessage = serde_json::from_str(json).unwrap();
        match &msg.content {
            MessageContent::Blocks(blocks) => assert_eq!(blocks.len(), 2),
            other => panic!("expected blocks, got {other:?}"),
        }
        assert_eq!(msg.text(), "what is this?");
    }

    #[test]
    fn missing_content_key_defaults_to_null() {
        let msg: ChatMessage = serde_json::from_str(r#"{"role":"assistant"}"#).unwrap();
        assert_eq!(msg.content, MessageContent::Null);
    }

    #[test]
    fn tool_protocol_detection() {
        assert!(ChatMessage::tool_result("c", "t", "x").is_tool_protocol());
        assert!(ChatMessage::assistant_tool_calls(
            None,
            vec![ToolCallRecord::new("c", "t", "{}".into())],
            None
        )
        .is_tool_protocol());
        assert!(!ChatMessage::assistant("plain").is_tool_protocol());
        assert!(!ChatMessage::user("plain").is_tool_protocol());
    }

    #[test]
    fn empty_tool_calls_list_is_not_protocol() {
        let mut msg = ChatMessage::assistant("text");
        msg.tool_calls = Some(vec![]);
        assert!(!msg.is_tool_protocol());
    }

    #[test]
    fn tool_call_request_serializes_arguments_back_to_string() {
        let mut args = serde_json::Map::new();
        args.insert("path".into(), serde_json::Value::String("a.txt".into()));
        let req = ToolCallRequest {
            id: "c1".into(),
            name: "read_file".into(),
            arguments: args,
        };
        assert_eq!(req.arguments_json(), r#"{"path":"a.txt"}"#);
        assert_eq!(req.to_record().function.name, "read_file");
    }

    #[test]
    fn sorted_json_is_key_order_independent() {
        let a: serde_json::Value = serde_json::from_str(r#"{"b":1,"a":{"d":2,"c":3}}"#).unwrap();
        let b: serde_json::Value = serde_json::from_str(r#"{"a":{"c":3,"d":2},"b":1}"#).unwrap();
        assert_eq!(sorted_json(&a), sorted_json(&b));
    }

    #[test]
    fn error_response_is_error_finish() {
        let r = ChatResponse::error("boom");
        assert_eq!(r.finish_reason, "error");
        assert!(!r.has_tool_calls());
        assert_eq!(r.content.as_deref(), Some("boom"));
    }
}
