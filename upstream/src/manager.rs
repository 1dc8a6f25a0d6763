//! Upstream manager: N supervised MCP sessions behind one call surface.
//!
//! Static servers come from configuration at startup. Individual connect
//! failures are reported but do not prevent other servers from starting;
//! servers marked `required` make startup fail. Unhealthy sessions are
//! restarted with exponential backoff up to an attempt budget, idle stdio
//! sessions are closed and respawned transparently on the next call.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::Value;
use tokio::sync::{mpsc, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use tmg_discovery::descriptor::{DescriptorSink, ToolDescriptor};
use tmg_wire::jsonrpc::Notification;
use tmg_wire::mcp::{CallToolResult, Implementation};
use tmg_wire::{CallContext, GatewayError, GatewayResult};

use crate::config::{RestartPolicy, UpstreamConfig, UpstreamServerConfig};
use crate::session::{HealthState, UpstreamSession};
use crate::transport::{self, Transport};

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);
const SUPERVISOR_POLL: Duration = Duration::from_secs(5);
const IDLE_SWEEP_INTERVAL: Duration = Duration::from_secs(30);
const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);
const NOTIFICATION_BUFFER: usize = 256;

/// Seam for producing transports; tests substitute in-process mocks while
/// production uses stdio/HTTP.
#[async_trait]
pub trait TransportFactory: Send + Sync {
    async fn connect(&self, config: &UpstreamServerConfig) -> GatewayResult<Arc<dyn Transport>>;
}

pub struct DefaultTransportFactory;

#[async_trait]
impl TransportFactory for DefaultTransportFactory {
    async fn connect(&self, config: &UpstreamServerConfig) -> GatewayResult<Arc<dyn Transport>> {
        transport::connect(&config.launch).await
    }
}

struct ManagedServer {
    config: UpstreamServerConfig,
    session: RwLock<Option<Arc<UpstreamSession>>>,
    /// Serializes respawn attempts across the supervisor and on-demand paths.
    restart_lock: tokio::sync::Mutex<()>,
    tools: parking_lot::Mutex<Vec<ToolDescriptor>>,
}

#[derive(Debug, Clone)]
pub struct UpstreamManagerStats {
    pub server_count: usize,
    pub healthy_count: usize,
    pub tool_count: usize,
}

pub struct UpstreamManager {
    servers: DashMap<String, Arc<ManagedServer>>,
    sink: Arc<dyn DescriptorSink>,
    factory: Arc<dyn TransportFactory>,
    restart: RestartPolicy,
    client_info: Implementation,
    notifications_tx: mpsc::Sender<(String, Notification)>,
    notifications_rx: parking_lot::Mutex<Option<mpsc::Receiver<(String, Notification)>>>,
    shutdown: CancellationToken,
}

impl UpstreamManager {
    pub async fn start(
        config: UpstreamConfig,
        sink: Arc<dyn DescriptorSink>,
    ) -> GatewayResult<Arc<Self>> {
        Self::start_with_factory(config, sink, Arc::new(DefaultTransportFactory)).await
    }

    pub async fn start_with_factory(
        config: UpstreamConfig,
        sink: Arc<dyn DescriptorSink>,
        factory: Arc<dyn TransportFactory>,
    ) -> GatewayResult<Arc<Self>> {
        let (notifications_tx, notifications_rx) = mpsc::channel(NOTIFICATION_BUFFER);
        let manager = Arc::new(Self {
            servers: DashMap::new(),
            sink,
            factory,
            restart: config.restart.clone(),
            client_info: Implementation {
                name: "tool-mesh-gateway".to_string(),
                version: env!("CARGO_PKG_VERSION").to_string(),
            },
            notifications_tx,
            notifications_rx: parking_lot::Mutex::new(Some(notifications_rx)),
            shutdown: CancellationToken::new(),
        });

        for server_config in config.servers {
            let name = server_config.name.clone();
            let managed = Arc::new(ManagedServer {
                config: server_config,
                session: RwLock::new(None),
                restart_lock: tokio::sync::Mutex::new(()),
                tools: parking_lot::Mutex::new(Vec::new()),
            });
            manager.servers.insert(name.clone(), Arc::clone(&managed));

            match manager.connect_and_publish(&managed).await {
                Ok(()) => info!(server = %name, "connected"),
                Err(e) if managed.config.required => {
                    error!(server = %name, error = %e, "required server failed to start");
                    // Stop supervisors spawned for earlier servers before
                    // surfacing the fatal error.
                    manager.shutdown.cancel();
                    return Err(e);
                }
                Err(e) => {
                    error!(server = %name, error = %e, "server failed to start");
                }
            }
            Arc::clone(&manager).spawn_supervisor(name);
        }

        Arc::clone(&manager).spawn_idle_sweeper();
        if let Some(interval) = config.refresh_interval {
            Arc::clone(&manager).spawn_background_refresh(interval);
        }

        Ok(manager)
    }

    /// Current merged descriptor set with server attribution.
    pub fn list_tools(&self) -> Vec<ToolDescriptor> {
        let mut tools = Vec::new();
        for entry in self.servers.iter() {
            tools.extend(entry.tools.lock().iter().cloned());
        }
        tools
    }

    pub fn server_names(&self) -> Vec<String> {
        self.servers.iter().map(|e| e.key().clone()).collect()
    }

    pub fn has_server(&self, server: &str) -> bool {
        self.servers.contains_key(server)
    }

    /// Invoke a tool on one upstream. Applies the server's default call
    /// timeout when the caller set no deadline; respawns idle or broken
    /// sessions on demand.
    pub async fn call(
        &self,
        server: &str,
        tool: &str,
        arguments: Option<serde_json::Map<String, Value>>,
        ctx: &CallContext,
    ) -> GatewayResult<CallToolResult> {
        let managed = self
            .servers
            .get(server)
            .map(|e| Arc::clone(e.value()))
            .ok_or_else(|| GatewayError::validation(format!("unknown server '{}'", server)))?;

        let session = self.ready_session(&managed).await?;
        let call_ctx = if ctx.deadline().is_none() {
            ctx.child_with_timeout(managed.config.call_timeout)
        } else {
            ctx.child()
        };
        session.call_tool(tool, arguments, &call_ctx).await
    }

    /// Re-list tools from a healthy session and publish the result.
    pub async fn refresh_server(&self, server: &str) -> GatewayResult<()> {
        let managed = self
            .servers
            .get(server)
            .map(|e| Arc::clone(e.value()))
            .ok_or_else(|| GatewayError::validation(format!("unknown server '{}'", server)))?;
        let session = {
            let guard = managed.session.read().await;
            guard
                .clone()
                .ok_or_else(|| GatewayError::transport(format!("server '{}' not connected", server)))?
        };
        let ctx = CallContext::with_timeout(HANDSHAKE_TIMEOUT);
        let wire_tools = session.list_tools(&ctx).await?;
        let descriptors: Vec<ToolDescriptor> = wire_tools
            .into_iter()
            .map(|t| ToolDescriptor::from_wire(server, t))
            .collect();
        *managed.tools.lock() = descriptors.clone();
        self.sink.publish(server, descriptors).await;
        Ok(())
    }

    /// Receiver for upstream notifications; can be taken once.
    pub fn take_notifications(&self) -> Option<mpsc::Receiver<(String, Notification)>> {
        self.notifications_rx.lock().take()
    }

    pub fn stats(&self) -> UpstreamManagerStats {
        let mut healthy = 0usize;
        let mut tools = 0usize;
        for entry in self.servers.iter() {
            tools += entry.tools.lock().len();
            if let Ok(guard) = entry.session.try_read() {
                if let Some(session) = guard.as_ref() {
                    if session.health() == HealthState::Healthy {
                        healthy += 1;
                    }
                }
            }
        }
        UpstreamManagerStats {
            server_count: self.servers.len(),
            healthy_count: healthy,
            tool_count: tools,
        }
    }

    /// Graceful shutdown: MCP goodbye, grace period, hard teardown.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        for entry in self.servers.iter() {
            let session = entry.session.write().await.take();
            if let Some(session) = session {
                session.shutdown(SHUTDOWN_GRACE).await;
            }
        }
        info!("upstream manager shut down");
    }

    // ------------------------------------------------------------------
    // Connection lifecycle
    // ------------------------------------------------------------------

    async fn connect_and_publish(&self, managed: &Arc<ManagedServer>) -> GatewayResult<()> {
        let name = managed.config.name.clone();
        let transport = self.factory.connect(&managed.config).await?;
        let session = UpstreamSession::start(
            name.clone(),
            transport,
            managed.config.max_in_flight,
            self.notifications_tx.clone(),
        );

        let ctx = CallContext::with_timeout(HANDSHAKE_TIMEOUT);
        if let Err(e) = session.initialize(&self.client_info, &ctx).await {
            session.close().await;
            return Err(e);
        }
        let wire_tools = match session.list_tools(&ctx).await {
            Ok(tools) => tools,
            Err(e) => {
                session.close().await;
                return Err(e);
            }
        };

        let descriptors: Vec<ToolDescriptor> = wire_tools
            .into_iter()
            .map(|t| ToolDescriptor::from_wire(&name, t))
            .collect();
        *managed.tools.lock() = descriptors.clone();
        *managed.session.write().await = Some(session);
        self.sink.publish(&name, descriptors).await;
        Ok(())
    }

    /// Session ready for calls; closed or missing sessions get one
    /// on-demand respawn attempt.
    async fn ready_session(&self, managed: &Arc<ManagedServer>) -> GatewayResult<Arc<UpstreamSession>> {
        {
            let guard = managed.session.read().await;
            if let Some(session) = guard.as_ref() {
                if matches!(session.health(), HealthState::Healthy | HealthState::Starting) {
                    return Ok(Arc::clone(session));
                }
            }
        }

        let _guard = managed.restart_lock.lock().await;
        // Another caller or the supervisor may have fixed it meanwhile.
        {
            let guard = managed.session.read().await;
            if let Some(session) = guard.as_ref() {
                if matches!(session.health(), HealthState::Healthy | HealthState::Starting) {
                    return Ok(Arc::clone(session));
                }
            }
        }
        debug!(server = %managed.config.name, "respawning session on demand");
        self.connect_and_publish(managed).await?;
        let guard = managed.session.read().await;
        guard
            .clone()
            .ok_or_else(|| GatewayError::internal("respawn produced no session"))
    }

    async fn restart_with_budget(&self, managed: &Arc<ManagedServer>, token: &CancellationToken) {
        let _guard = managed.restart_lock.lock().await;
        {
            let guard = managed.session.read().await;
            if let Some(session) = guard.as_ref() {
                if session.health() == HealthState::Healthy {
                    return;
                }
            }
        }

        let name = managed.config.name.clone();
        for attempt in 1..=self.restart.max_attempts {
            if token.is_cancelled() {
                return;
            }
            let delay = self.restart.delay(attempt);
            tokio::select! {
                _ = token.cancelled() => return,
                _ = tokio::time::sleep(delay) => {}
            }
            match self.connect_and_publish(managed).await {
                Ok(()) => {
                    info!(server = %name, attempt, "session restored");
                    return;
                }
                Err(e) => {
                    warn!(server = %name, attempt, error = %e, "restart attempt failed");
                }
            }
        }
        error!(server = %name, "restart budget exhausted; server stays down until next call");
        *managed.session.write().await = None;
    }

    // ------------------------------------------------------------------
    // Background tasks
    // ------------------------------------------------------------------

    fn spawn_supervisor(self: Arc<Self>, name: String) {
        let token = self.shutdown.child_token();
        tokio::spawn(async move {
            loop {
                if token.is_cancelled() {
                    return;
                }
                let managed = match self.servers.get(&name) {
                    Some(entry) => Arc::clone(entry.value()),
                    None => return,
                };
                let session = managed.session.read().await.clone();
                match session {
                    Some(session) => {
                        let mut watch = session.health_watch();
                        let needs_restart = loop {
                            match *watch.borrow() {
                                HealthState::Unhealthy => break true,
                                // Deliberate close (idle, shutdown); wait for
                                // replacement rather than restarting.
                                HealthState::Closed => break false,
                                HealthState::Starting | HealthState::Healthy => {}
                            }
                            tokio::select! {
                                _ = token.cancelled() => return,
                                changed = watch.changed() => {
                                    if changed.is_err() {
                                        break true;
                                    }
                                }
                            }
                        };
                        if needs_restart {
                            self.restart_with_budget(&managed, &token).await;
                        } else {
                            tokio::select! {
                                _ = token.cancelled() => return,
                                _ = tokio::time::sleep(SUPERVISOR_POLL) => {}
                            }
                        }
                    }
                    None => {
                        tokio::select! {
                            _ = token.cancelled() => return,
                            _ = tokio::time::sleep(SUPERVISOR_POLL) => {}
                        }
                    }
                }
            }
        });
    }

    fn spawn_idle_sweeper(self: Arc<Self>) {
        let token = self.shutdown.child_token();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(IDLE_SWEEP_INTERVAL);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = token.cancelled() => return,
                    _ = interval.tick() => {}
                }
                for entry in self.servers.iter() {
                    let Some(idle_timeout) = entry.config.idle_timeout else {
                        continue;
                    };
                    let managed = Arc::clone(entry.value());
                    let should_close = {
                        let guard = managed.session.read().await;
                        guard.as_ref().is_some_and(|s| {
                            s.health() == HealthState::Healthy && s.is_idle(idle_timeout)
                        })
                    };
                    if should_close {
                        info!(server = %managed.config.name, "closing idle session");
                        let session = managed.session.write().await.take();
                        if let Some(session) = session {
                            session.close().await;
                        }
                    }
                }
            }
        });
    }

    fn spawn_background_refresh(self: Arc<Self>, refresh_interval: Duration) {
        let token = self.shutdown.child_token();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(refresh_interval);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = token.cancelled() => return,
                    _ = interval.tick() => {}
                }
                let names = self.server_names();
                for name in names {
                    let connected = match self.servers.get(&name) {
                        Some(entry) => {
                            let guard = entry.session.read().await;
                            guard
                                .as_ref()
                                .is_some_and(|s| s.health() == HealthState::Healthy)
                        }
                        None => false,
                    };
                    if !connected {
                        continue;
                    }
                    if let Err(e) = self.refresh_server(&name).await {
                        warn!(server = %name, error = %e, "background refresh failed");
                    }
                }
                debug!("background refresh cycle complete");
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::UpstreamServerConfig;
    use crate::testing::MockUpstream;
    use serde_json::json;
    use tmg_wire::ErrorKind;

    struct NullSink;

    #[async_trait]
    impl DescriptorSink for NullSink {
        async fn publish(&self, _server: &str, _tools: Vec<ToolDescriptor>) {}
        async fn remove_server(&self, _server: &str) {}
    }

    fn server_config(name: &str) -> UpstreamServerConfig {
        UpstreamServerConfig::stdio(name, "unused", vec![])
    }

    async fn manager_with(
        upstream: Arc<MockUpstream>,
        config: UpstreamServerConfig,
    ) -> Arc<UpstreamManager> {
        UpstreamManager::start_with_factory(
            UpstreamConfig {
                servers: vec![config],
                restart: RestartPolicy {
                    initial_backoff: Duration::from_millis(10),
                    max_backoff: Duration::from_millis(50),
                    max_attempts: 3,
                },
                refresh_interval: None,
            },
            Arc::new(NullSink),
            upstream,
        )
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn empty_config_starts() {
        let manager = UpstreamManager::start_with_factory(
            UpstreamConfig::default(),
            Arc::new(NullSink),
            Arc::new(MockUpstream::new("unused")),
        )
        .await
        .unwrap();
        assert_eq!(manager.stats().server_count, 0);
    }

    #[tokio::test]
    async fn call_round_trip() {
        let upstream = Arc::new(
            MockUpstream::new("files").with_tool("read", |args| {
                CallToolResult::json(json!({"got": args}))
            }),
        );
        let manager = manager_with(Arc::clone(&upstream), server_config("files")).await;

        let mut args = serde_json::Map::new();
        args.insert("path".to_string(), json!("a.txt"));
        let result = manager
            .call("files", "read", Some(args), &CallContext::unbounded())
            .await
            .unwrap();
        assert_eq!(result.to_value()["got"]["path"], "a.txt");
        assert_eq!(manager.list_tools().len(), 1);
    }

    #[tokio::test]
    async fn unknown_server_is_a_validation_error() {
        let manager = UpstreamManager::start_with_factory(
            UpstreamConfig::default(),
            Arc::new(NullSink),
            Arc::new(MockUpstream::new("unused")),
        )
        .await
        .unwrap();
        let err = manager
            .call("ghost", "tool", None, &CallContext::unbounded())
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::Validation);
    }

    #[tokio::test]
    async fn required_server_failure_fails_startup() {
        let upstream = Arc::new(MockUpstream::new("req"));
        upstream.set_fail_connects(true);
        let mut config = server_config("req");
        config.required = true;

        let result = UpstreamManager::start_with_factory(
            UpstreamConfig {
                servers: vec![config],
                restart: RestartPolicy::default(),
                refresh_interval: None,
            },
            Arc::new(NullSink),
            upstream,
        )
        .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn optional_server_failure_does_not_fail_startup() {
        let upstream = Arc::new(MockUpstream::new("opt"));
        upstream.set_fail_connects(true);
        let manager = UpstreamManager::start_with_factory(
            UpstreamConfig {
                servers: vec![server_config("opt")],
                restart: RestartPolicy {
                    initial_backoff: Duration::from_millis(10),
                    max_backoff: Duration::from_millis(20),
                    max_attempts: 1,
                },
                refresh_interval: None,
            },
            Arc::new(NullSink),
            upstream,
        )
        .await
        .unwrap();
        assert_eq!(manager.stats().healthy_count, 0);
        manager.shutdown().await;
    }

    #[tokio::test]
    async fn session_restarts_after_eof() {
        let upstream = Arc::new(
            MockUpstream::new("flaky").with_tool("ping", |_| CallToolResult::text("pong")),
        );
        let manager = manager_with(Arc::clone(&upstream), server_config("flaky")).await;
        assert_eq!(upstream.connect_count(), 1);

        upstream.inject_eof();
        // Give the supervisor time to notice and reconnect (10-50ms backoff).
        tokio::time::sleep(Duration::from_millis(300)).await;

        let result = manager
            .call("flaky", "ping", None, &CallContext::with_timeout(Duration::from_secs(1)))
            .await
            .unwrap();
        assert_eq!(result.content[0].as_text(), Some("pong"));
        assert!(upstream.connect_count() >= 2);
        manager.shutdown().await;
    }

    #[tokio::test]
    async fn shutdown_closes_sessions() {
        let upstream = Arc::new(MockUpstream::new("s"));
        let manager = manager_with(Arc::clone(&upstream), server_config("s")).await;
        assert_eq!(manager.stats().healthy_count, 1);
        manager.shutdown().await;
        assert_eq!(manager.stats().healthy_count, 0);
    }
}
