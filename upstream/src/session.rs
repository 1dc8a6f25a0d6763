//! One multiplexed MCP session over one transport.
//!
//! A session has a single writer and a single reader task. The reader
//! demuxes responses by request id into per-request oneshot channels;
//! notifications go to the session's notification sink. On read error or
//! EOF the session turns unhealthy and every pending request fails with a
//! retryable transport error.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use serde_json::{json, Value};
use tokio::sync::{mpsc, oneshot, watch, Semaphore};
use tracing::{debug, info, warn};

use tmg_wire::jsonrpc::{Notification, Request, RequestId, Response, RpcError};
use tmg_wire::mcp::{
    methods, CallToolParams, CallToolResult, Implementation, InitializeParams, InitializeResult,
    ToolsListResult, WireTool, PROTOCOL_VERSION,
};
use tmg_wire::{CallContext, ErrorKind, GatewayError, GatewayResult, Message};

use crate::transport::Transport;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthState {
    Starting,
    Healthy,
    Unhealthy,
    Closed,
}

type PendingTable = Arc<DashMap<u64, oneshot::Sender<Response>>>;

pub struct UpstreamSession {
    server_id: String,
    transport: Arc<dyn Transport>,
    next_id: AtomicU64,
    pending: PendingTable,
    health_tx: watch::Sender<HealthState>,
    last_seen: Arc<parking_lot::Mutex<Instant>>,
    in_flight: Arc<Semaphore>,
    server_info: parking_lot::Mutex<Option<Implementation>>,
}

impl UpstreamSession {
    /// Wrap a connected transport and start the reader task. The session is
    /// `Starting` until the MCP handshake completes.
    pub fn start(
        server_id: impl Into<String>,
        transport: Arc<dyn Transport>,
        max_in_flight: usize,
        notifications: mpsc::Sender<(String, Notification)>,
    ) -> Arc<Self> {
        let server_id = server_id.into();
        let (health_tx, _) = watch::channel(HealthState::Starting);
        let session = Arc::new(Self {
            server_id: server_id.clone(),
            transport: Arc::clone(&transport),
            next_id: AtomicU64::new(1),
            pending: Arc::new(DashMap::new()),
            health_tx,
            last_seen: Arc::new(parking_lot::Mutex::new(Instant::now())),
            in_flight: Arc::new(Semaphore::new(max_in_flight.max(1))),
            server_info: parking_lot::Mutex::new(None),
        });

        let reader = ReaderContext {
            server_id,
            transport,
            pending: Arc::clone(&session.pending),
            health: session.health_tx.clone(),
            last_seen: Arc::clone(&session.last_seen),
            notifications,
        };
        tokio::spawn(reader.run());

        session
    }

    pub fn server_id(&self) -> &str {
        &self.server_id
    }

    pub fn health(&self) -> HealthState {
        *self.health_tx.borrow()
    }

    pub fn health_watch(&self) -> watch::Receiver<HealthState> {
        self.health_tx.subscribe()
    }

    pub fn server_info(&self) -> Option<Implementation> {
        self.server_info.lock().clone()
    }

    /// True when the session has no in-flight requests and has been silent
    /// for at least `idle_timeout`.
    pub fn is_idle(&self, idle_timeout: Duration) -> bool {
        self.pending.is_empty() && self.last_seen.lock().elapsed() >= idle_timeout
    }

    /// Perform the MCP handshake: `initialize` then the initialized
    /// notification. Transitions the session to `Healthy`.
    pub async fn initialize(
        &self,
        client_info: &Implementation,
        ctx: &CallContext,
    ) -> GatewayResult<InitializeResult> {
        let params = InitializeParams {
            protocol_version: PROTOCOL_VERSION.to_string(),
            capabilities: json!({}),
            client_info: client_info.clone(),
        };
        let response = self
            .request(methods::INITIALIZE, Some(serde_json::to_value(&params)?), ctx)
            .await?;
        let result = Self::expect_result(response, ErrorKind::UpstreamProtocol)?;
        let parsed: InitializeResult = serde_json::from_value(result)
            .map_err(|e| GatewayError::protocol(format!("malformed initialize result: {}", e)))?;

        self.notify(methods::NOTIF_INITIALIZED, None).await?;

        *self.server_info.lock() = Some(parsed.server_info.clone());
        self.health_tx.send_replace(HealthState::Healthy);
        info!(
            server = %self.server_id,
            upstream = %parsed.server_info.name,
            version = %parsed.server_info.version,
            "handshake complete"
        );
        Ok(parsed)
    }

    /// List the server's tools, following pagination cursors.
    pub async fn list_tools(&self, ctx: &CallContext) -> GatewayResult<Vec<WireTool>> {
        let mut tools = Vec::new();
        let mut cursor: Option<String> = None;
        loop {
            let params = cursor.as_ref().map(|c| json!({ "cursor": c }));
            let response = self.request(methods::TOOLS_LIST, params, ctx).await?;
            let result = Self::expect_result(response, ErrorKind::UpstreamProtocol)?;
            let page: ToolsListResult = serde_json::from_value(result)
                .map_err(|e| GatewayError::protocol(format!("malformed tools/list: {}", e)))?;
            tools.extend(page.tools);
            match page.next_cursor {
                Some(next) => cursor = Some(next),
                None => break,
            }
        }
        Ok(tools)
    }

    /// Invoke one tool. A JSON-RPC error from the upstream surfaces
    /// verbatim as `UPSTREAM_TOOL_ERROR`; results with `isError` are
    /// returned as-is for the caller to interpret.
    pub async fn call_tool(
        &self,
        tool: &str,
        arguments: Option<serde_json::Map<String, Value>>,
        ctx: &CallContext,
    ) -> GatewayResult<CallToolResult> {
        let params = CallToolParams {
            name: tool.to_string(),
            arguments,
        };
        let response = self
            .request(methods::TOOLS_CALL, Some(serde_json::to_value(&params)?), ctx)
            .await?;
        let result = Self::expect_result(response, ErrorKind::UpstreamToolError)?;
        serde_json::from_value(result)
            .map_err(|e| GatewayError::protocol(format!("malformed tools/call result: {}", e)))
    }

    /// Issue a raw request and await the matching response.
    pub async fn request(
        &self,
        method: &str,
        params: Option<Value>,
        ctx: &CallContext,
    ) -> GatewayResult<Response> {
        ctx.check()?;
        match self.health() {
            HealthState::Unhealthy => {
                return Err(GatewayError::transport(format!(
                    "session '{}' is unhealthy",
                    self.server_id
                )));
            }
            HealthState::Closed => {
                return Err(GatewayError::transport(format!(
                    "session '{}' is closed",
                    self.server_id
                )));
            }
            HealthState::Starting | HealthState::Healthy => {}
        }

        // Backpressure: suspend until the session has capacity.
        let semaphore = Arc::clone(&self.in_flight);
        let _permit = ctx
            .run(async move {
                semaphore
                    .acquire_owned()
                    .await
                    .map_err(|_| GatewayError::transport("session capacity closed"))
            })
            .await?;

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.pending.insert(id, tx);

        // Whatever path we exit through, the pending slot must not leak.
        let pending = Arc::clone(&self.pending);
        let _cleanup = scopeguard::guard((), move |_| {
            pending.remove(&id);
        });

        let frame = serde_json::to_string(&Request::new(id, method, params))
            .map_err(|e| GatewayError::internal(format!("encode request: {}", e)))?;
        if let Err(e) = self.transport.send(&frame).await {
            self.mark_unhealthy("write failure");
            return Err(e);
        }

        match ctx
            .run(async {
                rx.await
                    .map_err(|_| GatewayError::transport("session dropped in-flight request"))
            })
            .await
        {
            Ok(response) => Ok(response),
            Err(err) => {
                if matches!(err.kind, ErrorKind::Timeout | ErrorKind::Cancelled) {
                    self.send_cancellation(id).await;
                }
                Err(err)
            }
        }
    }

    /// Fire-and-forget notification.
    pub async fn notify(&self, method: &str, params: Option<Value>) -> GatewayResult<()> {
        let frame = serde_json::to_string(&Notification::new(method, params))
            .map_err(|e| GatewayError::internal(format!("encode notification: {}", e)))?;
        self.transport.send(&frame).await
    }

    /// Graceful shutdown: MCP `shutdown`, then transport teardown. Safe to
    /// call more than once.
    pub async fn shutdown(&self, grace: Duration) {
        if self.health() == HealthState::Closed {
            return;
        }
        self.health_tx.send_replace(HealthState::Closed);

        let ctx = CallContext::with_timeout(grace);
        if let Err(e) = ctx
            .run(async {
                self.request_unchecked(methods::SHUTDOWN, None).await?;
                Ok(())
            })
            .await
        {
            debug!(server = %self.server_id, error = %e, "shutdown request failed");
        }

        self.transport.close().await;
        self.fail_pending();
    }

    /// Close without the MCP goodbye; used for idle teardown.
    pub async fn close(&self) {
        self.health_tx.send_replace(HealthState::Closed);
        self.transport.close().await;
        self.fail_pending();
    }

    fn fail_pending(&self) {
        // Dropping the senders resolves every waiter with a retryable
        // transport error.
        self.pending.clear();
    }

    fn mark_unhealthy(&self, reason: &str) {
        if self.health() != HealthState::Closed {
            warn!(server = %self.server_id, reason, "session unhealthy");
            self.health_tx.send_replace(HealthState::Unhealthy);
        }
        self.fail_pending();
    }

    /// Shutdown-path request that skips the health gate (the session is
    /// already marked `Closed` by then).
    async fn request_unchecked(&self, method: &str, params: Option<Value>) -> GatewayResult<Response> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.pending.insert(id, tx);
        let pending = Arc::clone(&self.pending);
        let _cleanup = scopeguard::guard((), move |_| {
            pending.remove(&id);
        });
        let frame = serde_json::to_string(&Request::new(id, method, params))
            .map_err(|e| GatewayError::internal(format!("encode request: {}", e)))?;
        self.transport.send(&frame).await?;
        rx.await
            .map_err(|_| GatewayError::transport("session dropped in-flight request"))
    }

    async fn send_cancellation(&self, id: u64) {
        let notification = Notification::new(
            methods::NOTIF_CANCELLED,
            Some(json!({ "requestId": id })),
        );
        if let Ok(frame) = serde_json::to_string(&notification) {
            let _ = self.transport.send(&frame).await;
        }
    }

    fn expect_result(response: Response, error_kind: ErrorKind) -> GatewayResult<Value> {
        if let Some(rpc_error) = response.error {
            return Err(GatewayError::new(error_kind, rpc_error.message.clone())
                .with_details(json!({ "code": rpc_error.code, "data": rpc_error.data })));
        }
        response
            .result
            .ok_or_else(|| GatewayError::protocol("response carried neither result nor error"))
    }
}

/// State captured by the reader task; independent of the session handle so
/// the task keeps running while callers hold only an `Arc<UpstreamSession>`.
struct ReaderContext {
    server_id: String,
    transport: Arc<dyn Transport>,
    pending: PendingTable,
    health: watch::Sender<HealthState>,
    last_seen: Arc<parking_lot::Mutex<Instant>>,
    notifications: mpsc::Sender<(String, Notification)>,
}

impl ReaderContext {
    async fn run(self) {
        loop {
            match self.transport.recv().await {
                Ok(Some(frame)) => {
                    *self.last_seen.lock() = Instant::now();
                    self.route(&frame).await;
                }
                Ok(None) => {
                    info!(server = %self.server_id, "upstream EOF");
                    break;
                }
                Err(e) => {
                    warn!(server = %self.server_id, error = %e, "upstream read error");
                    break;
                }
            }
        }

        if *self.health.borrow() != HealthState::Closed {
            self.health.send_replace(HealthState::Unhealthy);
        }
        // Fail pending requests; waiters observe a retryable transport error.
        self.pending.clear();
    }

    async fn route(&self, frame: &str) {
        match Message::parse(frame) {
            Ok(Message::Response(response)) => {
                let id = match &response.id {
                    RequestId::Num(n) => Some(*n),
                    RequestId::Str(s) => s.parse().ok(),
                };
                match id.and_then(|id| self.pending.remove(&id)) {
                    Some((_, tx)) => {
                        let _ = tx.send(response);
                    }
                    None => {
                        debug!(server = %self.server_id, id = %response.id, "unmatched response")
                    }
                }
            }
            Ok(Message::Notification(notification)) => {
                if self
                    .notifications
                    .try_send((self.server_id.clone(), notification))
                    .is_err()
                {
                    debug!(server = %self.server_id, "notification sink full, dropped");
                }
            }
            Ok(Message::Request(request)) => {
                // Server-initiated requests are outside the gateway's MCP
                // subset; answer with method-not-found so the upstream can
                // move on.
                warn!(
                    server = %self.server_id,
                    method = %request.method,
                    "unsupported server-initiated request"
                );
                let response =
                    Response::err(request.id, RpcError::method_not_found(&request.method));
                if let Ok(frame) = serde_json::to_string(&response) {
                    let _ = self.transport.send(&frame).await;
                }
            }
            Err(e) => {
                warn!(server = %self.server_id, error = %e, "malformed frame from upstream");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockUpstream;
    use serde_json::json;

    fn notif_channel() -> mpsc::Sender<(String, Notification)> {
        mpsc::channel(16).0
    }

    #[tokio::test]
    async fn handshake_reaches_healthy() {
        let upstream = MockUpstream::new("mock");
        let session = UpstreamSession::start(
            "mock",
            upstream.transport(),
            8,
            notif_channel(),
        );
        assert_eq!(session.health(), HealthState::Starting);

        let info = Implementation {
            name: "tmg".to_string(),
            version: "0.0.0".to_string(),
        };
        let ctx = CallContext::with_timeout(Duration::from_secs(1));
        session.initialize(&info, &ctx).await.unwrap();
        assert_eq!(session.health(), HealthState::Healthy);
    }

    #[tokio::test]
    async fn concurrent_calls_demux_by_id() {
        let upstream = MockUpstream::new("mock").with_tool("echo", |args| {
            CallToolResult::json(json!({ "echo": args }))
        });
        let session = UpstreamSession::start("mock", upstream.transport(), 8, notif_channel());
        let info = Implementation {
            name: "tmg".to_string(),
            version: "0".to_string(),
        };
        let ctx = CallContext::with_timeout(Duration::from_secs(1));
        session.initialize(&info, &ctx).await.unwrap();

        let mut handles = Vec::new();
        for i in 0..8u32 {
            let session = Arc::clone(&session);
            let ctx = ctx.clone();
            handles.push(tokio::spawn(async move {
                let mut args = serde_json::Map::new();
                args.insert("i".to_string(), json!(i));
                let result = session.call_tool("echo", Some(args), &ctx).await.unwrap();
                (i, result.to_value())
            }));
        }
        for handle in handles {
            let (i, value) = handle.await.unwrap();
            assert_eq!(value["echo"]["i"], json!(i));
        }
    }

    #[tokio::test]
    async fn eof_fails_pending_with_retryable_error() {
        let upstream = MockUpstream::new("mock");
        let session = UpstreamSession::start("mock", upstream.transport(), 8, notif_channel());
        let info = Implementation {
            name: "tmg".to_string(),
            version: "0".to_string(),
        };
        let ctx = CallContext::with_timeout(Duration::from_secs(1));
        session.initialize(&info, &ctx).await.unwrap();

        upstream.hold_responses();
        let pending_session = Arc::clone(&session);
        let pending_ctx = CallContext::with_timeout(Duration::from_secs(5));
        let pending = tokio::spawn(async move {
            pending_session
                .call_tool("anything", None, &pending_ctx)
                .await
        });

        tokio::time::sleep(Duration::from_millis(50)).await;
        upstream.inject_eof();

        let err = pending.await.unwrap().unwrap_err();
        assert_eq!(err.kind, ErrorKind::UpstreamTransport);
        assert!(err.retryable);
        assert_eq!(session.health(), HealthState::Unhealthy);
        assert!(session.pending.is_empty());
    }

    #[tokio::test]
    async fn timeout_does_not_kill_the_session() {
        let upstream = MockUpstream::new("mock");
        let session = UpstreamSession::start("mock", upstream.transport(), 8, notif_channel());
        let info = Implementation {
            name: "tmg".to_string(),
            version: "0".to_string(),
        };
        let ctx = CallContext::with_timeout(Duration::from_secs(1));
        session.initialize(&info, &ctx).await.unwrap();

        upstream.hold_responses();
        let short = CallContext::with_timeout(Duration::from_millis(30));
        let err = session.call_tool("slow", None, &short).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::Timeout);
        assert_eq!(session.health(), HealthState::Healthy);
        assert!(session.pending.is_empty());
    }

    #[tokio::test]
    async fn upstream_rpc_error_is_surfaced_verbatim() {
        let upstream = MockUpstream::new("mock").with_tool_error("broken", -32000, "tool exploded");
        let session = UpstreamSession::start("mock", upstream.transport(), 8, notif_channel());
        let info = Implementation {
            name: "tmg".to_string(),
            version: "0".to_string(),
        };
        let ctx = CallContext::with_timeout(Duration::from_secs(1));
        session.initialize(&info, &ctx).await.unwrap();

        let err = session.call_tool("broken", None, &ctx).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::UpstreamToolError);
        assert_eq!(err.message, "tool exploded");
    }
}
