//! Transports: stdio child processes and HTTP endpoints.
//!
//! A transport moves opaque frames; sessions own message semantics. The
//! stdio transport writes newline-delimited JSON to a child's stdin and
//! reads frames off its stdout; the HTTP transport POSTs each frame and
//! feeds response bodies back through an inbound queue so both flavors
//! expose the same read loop to the session.

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, warn};

use tmg_wire::framing::{write_line, LineReader};
use tmg_wire::{GatewayError, GatewayResult};

use crate::config::LaunchSpec;

/// Grace period between closing a child's stdin and force-killing it.
const CHILD_DRAIN_GRACE: Duration = Duration::from_millis(100);

#[async_trait]
pub trait Transport: Send + Sync {
    /// Write one outbound frame. Serialized by the caller's send path.
    async fn send(&self, frame: &str) -> GatewayResult<()>;

    /// Next inbound frame; `None` means EOF. Only the session's reader
    /// task calls this.
    async fn recv(&self) -> GatewayResult<Option<String>>;

    /// Release the underlying resource. Idempotent.
    async fn close(&self);
}

/// Build a transport from a launch spec.
pub async fn connect(spec: &LaunchSpec) -> GatewayResult<Arc<dyn Transport>> {
    match spec {
        LaunchSpec::Stdio { command, args, env } => {
            let transport = StdioTransport::spawn(command, args, env).await?;
            Ok(Arc::new(transport))
        }
        LaunchSpec::Http {
            url,
            token,
            headers,
        } => {
            let transport = HttpTransport::new(url, token.as_deref(), headers)?;
            Ok(Arc::new(transport))
        }
    }
}

/// Child process speaking newline-delimited MCP on stdio.
pub struct StdioTransport {
    stdin: Mutex<Option<ChildStdin>>,
    reader: Mutex<LineReader<ChildStdout>>,
    child: Mutex<Option<Child>>,
}

impl StdioTransport {
    pub async fn spawn(
        command: &str,
        args: &[String],
        env: &HashMap<String, String>,
    ) -> GatewayResult<Self> {
        let mut child = Command::new(command)
            .args(args)
            .envs(env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| GatewayError::transport(format!("spawn '{}': {}", command, e)))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| GatewayError::internal("child stdin not piped"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| GatewayError::internal("child stdout not piped"))?;

        Ok(Self {
            stdin: Mutex::new(Some(stdin)),
            reader: Mutex::new(LineReader::new(stdout)),
            child: Mutex::new(Some(child)),
        })
    }
}

#[async_trait]
impl Transport for StdioTransport {
    async fn send(&self, frame: &str) -> GatewayResult<()> {
        let mut guard = self.stdin.lock().await;
        let stdin = guard
            .as_mut()
            .ok_or_else(|| GatewayError::transport("child stdin closed"))?;
        write_line(stdin, frame)
            .await
            .map_err(|e| GatewayError::transport(format!("write to child: {}", e)))
    }

    async fn recv(&self) -> GatewayResult<Option<String>> {
        let mut reader = self.reader.lock().await;
        reader
            .next_frame()
            .await
            .map_err(|e| GatewayError::transport(format!("read from child: {}", e)))
    }

    async fn close(&self) {
        // Dropping stdin signals EOF; give the child a moment to flush,
        // then make sure it is gone.
        self.stdin.lock().await.take();
        tokio::time::sleep(CHILD_DRAIN_GRACE).await;
        if let Some(mut child) = self.child.lock().await.take() {
            match child.try_wait() {
                Ok(Some(status)) => debug!(%status, "child exited on its own"),
                _ => {
                    if let Err(e) = child.kill().await {
                        warn!(error = %e, "failed to kill child process");
                    }
                }
            }
        }
    }
}

/// JSON-RPC over a single HTTP POST endpoint. Each sent request produces
/// one response body, which is queued for the session's reader; empty
/// bodies (notification acknowledgements) produce nothing.
pub struct HttpTransport {
    url: String,
    client: reqwest::Client,
    inbound_tx: Mutex<Option<mpsc::UnboundedSender<String>>>,
    inbound_rx: Mutex<mpsc::UnboundedReceiver<String>>,
}

impl HttpTransport {
    pub fn new(
        url: &str,
        token: Option<&str>,
        headers: &HashMap<String, String>,
    ) -> GatewayResult<Self> {
        url::Url::parse(url)
            .map_err(|e| GatewayError::config(format!("invalid upstream url '{}': {}", url, e)))?;

        let mut header_map = reqwest::header::HeaderMap::new();
        header_map.insert(
            reqwest::header::CONTENT_TYPE,
            reqwest::header::HeaderValue::from_static("application/json"),
        );
        if let Some(token) = token {
            let value = format!("Bearer {}", token)
                .parse()
                .map_err(|_| GatewayError::config("invalid auth token"))?;
            header_map.insert(reqwest::header::AUTHORIZATION, value);
        }
        for (key, value) in headers {
            let name: reqwest::header::HeaderName = key
                .parse()
                .map_err(|_| GatewayError::config(format!("invalid header name '{}'", key)))?;
            let value = value
                .parse()
                .map_err(|_| GatewayError::config(format!("invalid header value for '{}'", key)))?;
            header_map.insert(name, value);
        }

        let client = reqwest::Client::builder()
            .default_headers(header_map)
            .connect_timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| GatewayError::transport(format!("build http client: {}", e)))?;

        let (tx, rx) = mpsc::unbounded_channel();
        Ok(Self {
            url: url.to_string(),
            client,
            inbound_tx: Mutex::new(Some(tx)),
            inbound_rx: Mutex::new(rx),
        })
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn send(&self, frame: &str) -> GatewayResult<()> {
        let response = self
            .client
            .post(&self.url)
            .body(frame.to_string())
            .send()
            .await
            .map_err(|e| GatewayError::transport(format!("http post: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            return Err(GatewayError::transport(format!(
                "upstream returned http {}",
                status
            )));
        }
        let body = response
            .text()
            .await
            .map_err(|e| GatewayError::transport(format!("http body: {}", e)))?;
        if body.trim().is_empty() {
            return Ok(());
        }
        let guard = self.inbound_tx.lock().await;
        if let Some(tx) = guard.as_ref() {
            let _ = tx.send(body);
        }
        Ok(())
    }

    async fn recv(&self) -> GatewayResult<Option<String>> {
        let mut rx = self.inbound_rx.lock().await;
        Ok(rx.recv().await)
    }

    async fn close(&self) {
        // Dropping the sender ends the reader with EOF.
        self.inbound_tx.lock().await.take();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn http_transport_rejects_bad_url() {
        assert!(HttpTransport::new("not a url", None, &HashMap::new()).is_err());
    }

    #[tokio::test]
    async fn http_close_yields_eof() {
        let transport =
            HttpTransport::new("http://127.0.0.1:1/mcp", None, &HashMap::new()).unwrap();
        transport.close().await;
        assert!(transport.recv().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn stdio_round_trip_with_cat() {
        // `cat` echoes lines straight back, which is enough to exercise the
        // framing path end to end.
        let transport = StdioTransport::spawn("cat", &[], &HashMap::new()).await.unwrap();
        transport.send("{\"ping\":1}").await.unwrap();
        let frame = transport.recv().await.unwrap().unwrap();
        assert_eq!(frame, "{\"ping\":1}");
        transport.close().await;
    }

    #[tokio::test]
    async fn stdio_recv_sees_eof_after_close() {
        let transport = StdioTransport::spawn("cat", &[], &HashMap::new()).await.unwrap();
        transport.close().await;
        assert!(transport.recv().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn spawn_failure_is_a_transport_error() {
        let err = StdioTransport::spawn("definitely-not-a-binary-xyz", &[], &HashMap::new())
            .await
            .unwrap_err();
        assert_eq!(err.kind, tmg_wire::ErrorKind::UpstreamTransport);
        assert!(err.retryable);
    }
}
