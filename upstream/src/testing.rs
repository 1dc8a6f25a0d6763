//! In-process mock upstreams for unit and integration tests.
//!
//! A `MockUpstream` answers the MCP handshake, serves a configurable tool
//! set, and lets tests inject EOFs, withhold responses and count
//! reconnects. It implements `TransportFactory`, so the real manager,
//! session and supervision code paths run unmodified against it.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use serde_json::{json, Value};
use tokio::sync::mpsc;

use tmg_wire::jsonrpc::{Request, Response, RpcError};
use tmg_wire::mcp::{methods, CallToolParams, CallToolResult, Implementation, InitializeResult};
use tmg_wire::{GatewayError, GatewayResult, Message};

use crate::config::UpstreamServerConfig;
use crate::manager::TransportFactory;
use crate::transport::Transport;

type ToolHandler = Box<dyn Fn(Value) -> Result<CallToolResult, RpcError> + Send + Sync>;

pub struct MockUpstream {
    name: String,
    tools: Arc<RwLock<Vec<tmg_wire::mcp::WireTool>>>,
    handlers: Arc<RwLock<HashMap<String, ToolHandler>>>,
    hold: Arc<AtomicBool>,
    fail_connects: Arc<AtomicBool>,
    connect_count: Arc<AtomicUsize>,
    calls: Arc<Mutex<Vec<(String, Value)>>>,
    current: Arc<Mutex<Option<Arc<MockTransport>>>>,
}

impl MockUpstream {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            tools: Arc::new(RwLock::new(Vec::new())),
            handlers: Arc::new(RwLock::new(HashMap::new())),
            hold: Arc::new(AtomicBool::new(false)),
            fail_connects: Arc::new(AtomicBool::new(false)),
            connect_count: Arc::new(AtomicUsize::new(0)),
            calls: Arc::new(Mutex::new(Vec::new())),
            current: Arc::new(Mutex::new(None)),
        }
    }

    /// Register a tool with a handler for its calls.
    pub fn with_tool<F>(self, name: &str, handler: F) -> Self
    where
        F: Fn(Value) -> CallToolResult + Send + Sync + 'static,
    {
        self.with_described_tool(name, &format!("mock tool {}", name), handler)
    }

    pub fn with_described_tool<F>(self, name: &str, description: &str, handler: F) -> Self
    where
        F: Fn(Value) -> CallToolResult + Send + Sync + 'static,
    {
        self.tools.write().push(tmg_wire::mcp::WireTool {
            name: name.to_string(),
            title: None,
            description: Some(description.to_string()),
            input_schema: json!({"type": "object"}),
        });
        self.handlers
            .write()
            .insert(name.to_string(), Box::new(move |args| Ok(handler(args))));
        self
    }

    /// Register a tool whose calls always fail at the JSON-RPC level.
    pub fn with_tool_error(self, name: &str, code: i64, message: &str) -> Self {
        self.tools.write().push(tmg_wire::mcp::WireTool {
            name: name.to_string(),
            title: None,
            description: Some("always fails".to_string()),
            input_schema: json!({"type": "object"}),
        });
        let message = message.to_string();
        self.handlers.write().insert(
            name.to_string(),
            Box::new(move |_| Err(RpcError::new(code, message.clone()))),
        );
        self
    }

    /// Build a fresh transport, as a reconnect would.
    pub fn transport(&self) -> Arc<dyn Transport> {
        self.connect_count.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::unbounded_channel();
        let transport = Arc::new(MockTransport {
            server_name: self.name.clone(),
            tools: Arc::clone(&self.tools),
            handlers: Arc::clone(&self.handlers),
            hold: Arc::clone(&self.hold),
            calls: Arc::clone(&self.calls),
            inbound_tx: Mutex::new(Some(tx)),
            inbound_rx: tokio::sync::Mutex::new(rx),
        });
        *self.current.lock() = Some(Arc::clone(&transport));
        transport
    }

    /// Stop answering requests; calls hang until EOF or timeout.
    pub fn hold_responses(&self) {
        self.hold.store(true, Ordering::Relaxed);
    }

    pub fn release_responses(&self) {
        self.hold.store(false, Ordering::Relaxed);
    }

    /// Terminate the current transport as an unexpected EOF.
    pub fn inject_eof(&self) {
        if let Some(transport) = self.current.lock().as_ref() {
            transport.inbound_tx.lock().take();
        }
    }

    pub fn set_fail_connects(&self, fail: bool) {
        self.fail_connects.store(fail, Ordering::Relaxed);
    }

    pub fn connect_count(&self) -> usize {
        self.connect_count.load(Ordering::Relaxed)
    }

    /// Recorded `(tool, arguments)` pairs, in arrival order.
    pub fn calls(&self) -> Vec<(String, Value)> {
        self.calls.lock().clone()
    }
}

#[async_trait]
impl TransportFactory for MockUpstream {
    async fn connect(&self, _config: &UpstreamServerConfig) -> GatewayResult<Arc<dyn Transport>> {
        if self.fail_connects.load(Ordering::Relaxed) {
            return Err(GatewayError::transport("mock connect refused"));
        }
        Ok(self.transport())
    }
}

pub struct MockTransport {
    server_name: String,
    tools: Arc<RwLock<Vec<tmg_wire::mcp::WireTool>>>,
    handlers: Arc<RwLock<HashMap<String, ToolHandler>>>,
    hold: Arc<AtomicBool>,
    calls: Arc<Mutex<Vec<(String, Value)>>>,
    inbound_tx: Mutex<Option<mpsc::UnboundedSender<String>>>,
    inbound_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<String>>,
}

impl MockTransport {
    fn respond(&self, response: Response) {
        if let Some(tx) = self.inbound_tx.lock().as_ref() {
            if let Ok(frame) = serde_json::to_string(&response) {
                let _ = tx.send(frame);
            }
        }
    }

    fn handle_request(&self, request: Request) {
        let id = request.id.clone();
        match request.method.as_str() {
            methods::INITIALIZE => {
                let result = InitializeResult {
                    protocol_version: tmg_wire::mcp::PROTOCOL_VERSION.to_string(),
                    capabilities: json!({"tools": {}}),
                    server_info: Implementation {
                        name: self.server_name.clone(),
                        version: "1.0.0".to_string(),
                    },
                };
                self.respond(Response::ok(id, serde_json::to_value(result).unwrap()));
            }
            methods::TOOLS_LIST => {
                let tools = self.tools.read().clone();
                self.respond(Response::ok(id, json!({ "tools": tools })));
            }
            methods::TOOLS_CALL => {
                let params: CallToolParams = match request
                    .params
                    .and_then(|p| serde_json::from_value(p).ok())
                {
                    Some(p) => p,
                    None => {
                        self.respond(Response::err(id, RpcError::invalid_params("bad params")));
                        return;
                    }
                };
                let args = params
                    .arguments
                    .map(Value::Object)
                    .unwrap_or(Value::Null);
                self.calls.lock().push((params.name.clone(), args.clone()));

                let handlers = self.handlers.read();
                let outcome = match handlers.get(&params.name) {
                    Some(handler) => handler(args),
                    None => Ok(CallToolResult::text("ok")),
                };
                match outcome {
                    Ok(result) => {
                        self.respond(Response::ok(id, serde_json::to_value(result).unwrap()))
                    }
                    Err(error) => self.respond(Response::err(id, error)),
                }
            }
            methods::SHUTDOWN => {
                self.respond(Response::ok(id, json!({})));
            }
            other => {
                self.respond(Response::err(id, RpcError::method_not_found(other)));
            }
        }
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn send(&self, frame: &str) -> GatewayResult<()> {
        if self.inbound_tx.lock().is_none() {
            return Err(GatewayError::transport("mock transport closed"));
        }
        match Message::parse(frame) {
            Ok(Message::Request(request)) => {
                if self.hold.load(Ordering::Relaxed) {
                    // Swallow the request; the caller waits.
                    return Ok(());
                }
                self.handle_request(request);
            }
            Ok(Message::Notification(_)) | Ok(Message::Response(_)) => {}
            Err(e) => return Err(GatewayError::protocol(format!("mock parse: {}", e))),
        }
        Ok(())
    }

    async fn recv(&self) -> GatewayResult<Option<String>> {
        let mut rx = self.inbound_rx.lock().await;
        Ok(rx.recv().await)
    }

    async fn close(&self) {
        self.inbound_tx.lock().take();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn mock_answers_handshake() {
        let upstream = MockUpstream::new("m");
        let transport = upstream.transport();
        let request = Request::new(1u64, methods::INITIALIZE, Some(json!({
            "protocolVersion": "x",
            "capabilities": {},
            "clientInfo": {"name": "t", "version": "0"}
        })));
        transport
            .send(&serde_json::to_string(&request).unwrap())
            .await
            .unwrap();
        let frame = transport.recv().await.unwrap().unwrap();
        match Message::parse(&frame).unwrap() {
            Message::Response(r) => assert!(!r.is_error()),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn each_transport_counts_as_a_connect() {
        let upstream = MockUpstream::new("m");
        let _a = upstream.transport();
        let _b = upstream.transport();
        assert_eq!(upstream.connect_count(), 2);
    }

    #[tokio::test]
    async fn calls_are_recorded() {
        let upstream = MockUpstream::new("m").with_tool("echo", CallToolResult::json);
        let transport = upstream.transport();
        let request = Request::new(
            2u64,
            methods::TOOLS_CALL,
            Some(json!({"name": "echo", "arguments": {"k": 1}})),
        );
        transport
            .send(&serde_json::to_string(&request).unwrap())
            .await
            .unwrap();
        let _ = transport.recv().await.unwrap();
        assert_eq!(upstream.calls().len(), 1);
        assert_eq!(upstream.calls()[0].0, "echo");
    }
}
