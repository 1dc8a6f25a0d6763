//! Tool descriptors and the qualified `server:tool` naming scheme.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use tmg_wire::mcp::WireTool;

/// Identity of a tool: the pair `(server-id, tool-name)` rendered as
/// `server:tool`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct QualifiedName {
    server: String,
    tool: String,
}

impl QualifiedName {
    pub fn new(server: impl Into<String>, tool: impl Into<String>) -> Self {
        Self {
            server: server.into(),
            tool: tool.into(),
        }
    }

    /// Parse `server:tool`. The first colon separates the halves, so tool
    /// names may themselves contain colons.
    pub fn parse(raw: &str) -> Option<Self> {
        let (server, tool) = raw.split_once(':')?;
        if server.is_empty() || tool.is_empty() {
            return None;
        }
        Some(Self::new(server, tool))
    }

    pub fn server(&self) -> &str {
        &self.server
    }

    pub fn tool(&self) -> &str {
        &self.tool
    }
}

impl std::fmt::Display for QualifiedName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.server, self.tool)
    }
}

/// Cached schema + metadata for one upstream tool. Immutable while the
/// owning upstream connection exists; replaced wholesale on refresh.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDescriptor {
    pub name: QualifiedName,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    pub description: String,
    pub input_schema: Value,
    /// Content hash over name, description and canonical schema. A changed
    /// hash invalidates the embedding and the graph node attributes.
    pub content_hash: String,
}

impl ToolDescriptor {
    pub fn from_wire(server: &str, tool: WireTool) -> Self {
        let name = QualifiedName::new(server, tool.name);
        let description = tool.description.unwrap_or_default();
        let schema_canonical = tool.input_schema.to_string();
        let content_hash = tmg_wire::content_hash(&[
            &name.to_string(),
            &description,
            &schema_canonical,
        ]);
        Self {
            name,
            title: tool.title,
            description,
            input_schema: tool.input_schema,
            content_hash,
        }
    }

    /// Text indexed for semantic search: name, title, description and
    /// schema-derived keywords concatenated into one document.
    pub fn document(&self) -> String {
        let mut doc = String::with_capacity(128);
        doc.push_str(self.name.tool());
        doc.push(' ');
        if let Some(title) = &self.title {
            doc.push_str(title);
            doc.push(' ');
        }
        doc.push_str(&self.description);
        for keyword in schema_keywords(&self.input_schema) {
            doc.push(' ');
            doc.push_str(&keyword);
        }
        doc
    }
}

/// Property names and declared types pulled out of a JSON schema, used to
/// enrich the indexable document and to infer schema compatibility when
/// suggesting DAG chains.
pub fn schema_keywords(schema: &Value) -> Vec<String> {
    let mut keywords = Vec::new();
    collect_keywords(schema, &mut keywords, 0);
    keywords
}

fn collect_keywords(schema: &Value, out: &mut Vec<String>, depth: usize) {
    if depth > 4 {
        return;
    }
    let Some(obj) = schema.as_object() else {
        return;
    };
    if let Some(props) = obj.get("properties").and_then(Value::as_object) {
        for (key, sub) in props {
            out.push(key.clone());
            if let Some(ty) = sub.get("type").and_then(Value::as_str) {
                out.push(ty.to_string());
            }
            collect_keywords(sub, out, depth + 1);
        }
    }
    if let Some(items) = obj.get("items") {
        collect_keywords(items, out, depth + 1);
    }
}

/// Receives descriptor sets as upstream sessions discover them. Implemented
/// by the registry; kept as a trait so the connection manager does not
/// depend on registry internals.
#[async_trait::async_trait]
pub trait DescriptorSink: Send + Sync {
    /// Replace the descriptor set for one server.
    async fn publish(&self, server: &str, tools: Vec<ToolDescriptor>);

    /// Drop all descriptors attributed to a server (shutdown, eviction).
    async fn remove_server(&self, server: &str);
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn wire_tool(name: &str, description: &str, schema: Value) -> WireTool {
        WireTool {
            name: name.to_string(),
            title: None,
            description: Some(description.to_string()),
            input_schema: schema,
        }
    }

    #[test]
    fn qualified_name_round_trip() {
        let name = QualifiedName::new("fs", "read_file");
        assert_eq!(name.to_string(), "fs:read_file");
        assert_eq!(QualifiedName::parse("fs:read_file"), Some(name));
    }

    #[test]
    fn qualified_name_rejects_bare_names() {
        assert!(QualifiedName::parse("read_file").is_none());
        assert!(QualifiedName::parse(":x").is_none());
        assert!(QualifiedName::parse("x:").is_none());
    }

    #[test]
    fn tool_names_may_contain_colons() {
        let name = QualifiedName::parse("srv:ns:tool").unwrap();
        assert_eq!(name.server(), "srv");
        assert_eq!(name.tool(), "ns:tool");
    }

    #[test]
    fn content_hash_tracks_schema_changes() {
        let a = ToolDescriptor::from_wire("fs", wire_tool("read", "Read", json!({"type": "object"})));
        let b = ToolDescriptor::from_wire(
            "fs",
            wire_tool("read", "Read", json!({"type": "object", "required": ["path"]})),
        );
        assert_ne!(a.content_hash, b.content_hash);
    }

    #[test]
    fn content_hash_stable_for_identical_tools() {
        let schema = json!({"type": "object"});
        let a = ToolDescriptor::from_wire("fs", wire_tool("read", "Read", schema.clone()));
        let b = ToolDescriptor::from_wire("fs", wire_tool("read", "Read", schema));
        assert_eq!(a.content_hash, b.content_hash);
    }

    #[test]
    fn document_includes_schema_keywords() {
        let schema = json!({
            "type": "object",
            "properties": {
                "path": {"type": "string"},
                "recursive": {"type": "boolean"}
            }
        });
        let descriptor = ToolDescriptor::from_wire("fs", wire_tool("list", "List files", schema));
        let doc = descriptor.document();
        assert!(doc.contains("path"));
        assert!(doc.contains("recursive"));
        assert!(doc.contains("boolean"));
    }
}
