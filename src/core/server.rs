//! JSON-RPC dispatch shared by the stdio and HTTP routers.

use std::sync::Arc;

use serde_json::json;
use tracing::{debug, warn};

use tmg_wire::jsonrpc::{Message, Request, Response, RpcError};
use tmg_wire::mcp::{
    methods, CallToolParams, Implementation, InitializeResult, WireTool, PROTOCOL_VERSION,
};
use tmg_wire::CallContext;

use super::gateway::Gateway;

pub struct McpServer {
    gateway: Arc<Gateway>,
}

impl McpServer {
    pub fn new(gateway: Arc<Gateway>) -> Self {
        Self { gateway }
    }

    pub fn gateway(&self) -> &Arc<Gateway> {
        &self.gateway
    }

    /// Handle one inbound frame. Returns the serialized response, or
    /// `None` for notifications and unparseable-but-ignorable input.
    pub async fn handle_frame(&self, raw: &str) -> Option<String> {
        let message = match Message::parse(raw) {
            Ok(message) => message,
            Err(e) => {
                // Parse errors get a JSON-RPC error with a null id.
                let error = json!({
                    "jsonrpc": "2.0",
                    "id": null,
                    "error": {
                        "code": RpcError::PARSE_ERROR,
                        "message": format!("parse error: {}", e),
                    },
                });
                return Some(error.to_string());
            }
        };
        match message {
            Message::Request(request) => {
                let response = self.handle_request(request).await;
                serde_json::to_string(&response).ok()
            }
            Message::Notification(notification) => {
                debug!(method = %notification.method, "client notification");
                None
            }
            Message::Response(_) => {
                warn!("unexpected response frame from client");
                None
            }
        }
    }

    async fn handle_request(&self, request: Request) -> Response {
        let id = request.id.clone();
        match request.method.as_str() {
            methods::INITIALIZE => {
                let result = InitializeResult {
                    protocol_version: PROTOCOL_VERSION.to_string(),
                    capabilities: json!({"tools": {"listChanged": true}}),
                    server_info: Implementation {
                        name: "tool-mesh-gateway".to_string(),
                        version: env!("CARGO_PKG_VERSION").to_string(),
                    },
                };
                match serde_json::to_value(result) {
                    Ok(value) => Response::ok(id, value),
                    Err(e) => Response::err(id, RpcError::internal(e.to_string())),
                }
            }
            methods::TOOLS_LIST => {
                let tools = self.list_tools();
                Response::ok(id, json!({ "tools": tools }))
            }
            methods::TOOLS_CALL => {
                let params: CallToolParams = match request
                    .params
                    .and_then(|params| serde_json::from_value(params).ok())
                {
                    Some(params) => params,
                    None => {
                        return Response::err(
                            id,
                            RpcError::invalid_params("tools/call requires `name`"),
                        );
                    }
                };
                let ctx = CallContext::unbounded();
                let result = self
                    .gateway
                    .handle_tool_call(&params.name, params.arguments, &ctx)
                    .await;
                match serde_json::to_value(result) {
                    Ok(value) => Response::ok(id, value),
                    Err(e) => Response::err(id, RpcError::internal(e.to_string())),
                }
            }
            methods::SHUTDOWN => Response::ok(id, json!({})),
            other => Response::err(id, RpcError::method_not_found(other)),
        }
    }

    /// Meta-tools first, then the proxied upstream catalog under qualified
    /// names.
    fn list_tools(&self) -> Vec<WireTool> {
        let mut tools = Gateway::meta_tools();
        let snapshot = self.gateway.registry().snapshot();
        let mut proxied: Vec<WireTool> = snapshot
            .tools
            .values()
            .map(|descriptor| WireTool {
                name: descriptor.name.to_string(),
                title: descriptor.title.clone(),
                description: Some(descriptor.description.clone()),
                input_schema: descriptor.input_schema.clone(),
            })
            .collect();
        proxied.sort_by(|a, b| a.name.cmp(&b.name));
        tools.extend(proxied);
        tools
    }
}
