//! MCP method payloads.
//!
//! Covers the subset of the protocol the gateway uses on both sides:
//! `initialize`, `tools/list`, `tools/call`, `shutdown`, plus the
//! notifications it forwards. Field names follow the MCP JSON convention
//! (camelCase).

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

pub const PROTOCOL_VERSION: &str = "2025-06-18";

pub mod methods {
    pub const INITIALIZE: &str = "initialize";
    pub const TOOLS_LIST: &str = "tools/list";
    pub const TOOLS_CALL: &str = "tools/call";
    pub const SHUTDOWN: &str = "shutdown";
    pub const NOTIF_INITIALIZED: &str = "notifications/initialized";
    pub const NOTIF_CANCELLED: &str = "notifications/cancelled";
    pub const NOTIF_TOOLS_CHANGED: &str = "notifications/tools/list_changed";
}

/// Client or server identity exchanged during `initialize`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Implementation {
    pub name: String,
    pub version: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitializeParams {
    pub protocol_version: String,
    #[serde(default)]
    pub capabilities: Value,
    pub client_info: Implementation,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitializeResult {
    pub protocol_version: String,
    #[serde(default)]
    pub capabilities: Value,
    pub server_info: Implementation,
}

/// Tool schema as it appears on the wire.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WireTool {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub input_schema: Value,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolsListResult {
    pub tools: Vec<WireTool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_cursor: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallToolParams {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub arguments: Option<Map<String, Value>>,
}

/// One item of tool output content.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentItem {
    Text {
        text: String,
    },
    Image {
        data: String,
        #[serde(rename = "mimeType")]
        mime_type: String,
    },
    Resource {
        resource: Value,
    },
}

impl ContentItem {
    pub fn text(text: impl Into<String>) -> Self {
        ContentItem::Text { text: text.into() }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            ContentItem::Text { text } => Some(text),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallToolResult {
    #[serde(default)]
    pub content: Vec<ContentItem>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_error: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub structured_content: Option<Value>,
}

impl CallToolResult {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            content: vec![ContentItem::text(text)],
            is_error: None,
            structured_content: None,
        }
    }

    pub fn json(value: Value) -> Self {
        Self {
            content: vec![ContentItem::text(value.to_string())],
            is_error: None,
            structured_content: Some(value),
        }
    }

    pub fn error(text: impl Into<String>) -> Self {
        Self {
            content: vec![ContentItem::text(text)],
            is_error: Some(true),
            structured_content: None,
        }
    }

    pub fn reported_error(&self) -> bool {
        self.is_error.unwrap_or(false)
    }

    /// Best-effort JSON view of the result: the structured content when
    /// present, otherwise the first text item parsed as JSON, otherwise the
    /// raw text as a string value.
    pub fn to_value(&self) -> Value {
        if let Some(v) = &self.structured_content {
            return v.clone();
        }
        match self.content.first().and_then(ContentItem::as_text) {
            Some(text) => serde_json::from_str(text).unwrap_or(Value::String(text.to_string())),
            None => Value::Null,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn wire_tool_uses_camel_case_schema_key() {
        let tool = WireTool {
            name: "read_file".to_string(),
            title: None,
            description: Some("Read a file".to_string()),
            input_schema: json!({"type": "object"}),
        };
        let raw = serde_json::to_value(&tool).unwrap();
        assert!(raw.get("inputSchema").is_some());
        assert!(raw.get("input_schema").is_none());
    }

    #[test]
    fn call_result_text_round_trip() {
        let result = CallToolResult::text("hello");
        let raw = serde_json::to_string(&result).unwrap();
        let parsed: CallToolResult = serde_json::from_str(&raw).unwrap();
        assert_eq!(parsed.content[0].as_text(), Some("hello"));
        assert!(!parsed.reported_error());
    }

    #[test]
    fn to_value_prefers_structured_content() {
        let result = CallToolResult {
            content: vec![ContentItem::text("ignored")],
            is_error: None,
            structured_content: Some(json!({"x": 1})),
        };
        assert_eq!(result.to_value(), json!({"x": 1}));
    }

    #[test]
    fn to_value_parses_json_text() {
        let result = CallToolResult::text(r#"{"a":[1,2]}"#);
        assert_eq!(result.to_value(), json!({"a": [1, 2]}));
    }

    #[test]
    fn to_value_falls_back_to_plain_text() {
        let result = CallToolResult::text("plain words");
        assert_eq!(result.to_value(), json!("plain words"));
    }

    #[test]
    fn content_item_tags() {
        let item: ContentItem = serde_json::from_value(json!({"type": "text", "text": "x"})).unwrap();
        assert_eq!(item.as_text(), Some("x"));
    }
}
