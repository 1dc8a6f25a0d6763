//! Gateway configuration.
//!
//! Deserialized from YAML by the CLI and validated before any subsystem
//! starts. Each section converts into the owning crate's native config
//! type.

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use dagrun::{EngineConfig, RetryPolicy, SpeculationConfig, SuggestConfig};
use tmg_discovery::SearchWeights;
use tmg_sandbox::{SandboxConfig, SandboxLimits};
use tmg_upstream::{LaunchSpec, RestartPolicy, UpstreamConfig, UpstreamServerConfig};
use tmg_wire::{GatewayError, GatewayResult};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GatewayConfig {
    #[serde(default)]
    pub upstream_servers: Vec<UpstreamServerEntry>,
    #[serde(default = "defaults::max_concurrency")]
    pub max_concurrency: usize,
    #[serde(default)]
    pub sandbox: SandboxSection,
    #[serde(default)]
    pub cache: CacheSection,
    #[serde(default)]
    pub search: SearchSection,
    #[serde(default)]
    pub speculation: SpeculationSection,
    #[serde(default)]
    pub pending: PendingSection,
    #[serde(default)]
    pub graph: GraphSection,
    #[serde(default)]
    pub approvals: ApprovalsSection,
    /// Background tool re-listing cadence; disabled when absent.
    #[serde(default)]
    pub refresh_interval_secs: Option<u64>,
    #[serde(default = "defaults::listen")]
    pub listen: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct UpstreamServerEntry {
    pub name: String,
    /// Launch command for stdio servers; mutually exclusive with `url`.
    #[serde(default)]
    pub command: Vec<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    /// Endpoint for HTTP servers; mutually exclusive with `command`.
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub token: Option<String>,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    #[serde(default)]
    pub required: bool,
    #[serde(default)]
    pub idle_timeout_secs: Option<u64>,
    #[serde(default = "defaults::call_timeout_secs")]
    pub call_timeout_secs: u64,
    #[serde(default = "defaults::max_in_flight")]
    pub max_in_flight: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SandboxSection {
    #[serde(default = "defaults::worker_command")]
    pub worker_command: Vec<String>,
    #[serde(default = "defaults::sandbox_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "defaults::sandbox_memory_mb")]
    pub memory_limit_mb: u64,
    #[serde(default)]
    pub allowed_read_paths: Vec<String>,
    #[serde(default)]
    pub allowed_env: Vec<String>,
    #[serde(default = "defaults::yes")]
    pub pii_protection: bool,
    /// Tool count added to the allow-list from intent search.
    #[serde(default = "defaults::sandbox_search_k")]
    pub intent_search_k: usize,
}

impl Default for SandboxSection {
    fn default() -> Self {
        Self {
            worker_command: defaults::worker_command(),
            timeout_secs: defaults::sandbox_timeout_secs(),
            memory_limit_mb: defaults::sandbox_memory_mb(),
            allowed_read_paths: Vec::new(),
            allowed_env: Vec::new(),
            pii_protection: true,
            intent_search_k: defaults::sandbox_search_k(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CacheSection {
    #[serde(default = "defaults::yes")]
    pub enabled: bool,
    #[serde(default = "defaults::cache_capacity")]
    pub capacity: usize,
    #[serde(default = "defaults::cache_ttl_secs")]
    pub ttl_secs: u64,
}

impl Default for CacheSection {
    fn default() -> Self {
        Self {
            enabled: true,
            capacity: defaults::cache_capacity(),
            ttl_secs: defaults::cache_ttl_secs(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SearchSection {
    #[serde(default)]
    pub weights: WeightsEntry,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct WeightsEntry {
    pub alpha: f64,
    pub beta: f64,
    pub gamma: f64,
}

impl Default for WeightsEntry {
    fn default() -> Self {
        let defaults = SearchWeights::default();
        Self {
            alpha: defaults.alpha,
            beta: defaults.beta,
            gamma: defaults.gamma,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SpeculationSection {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "defaults::speculation_threshold")]
    pub threshold: f64,
    #[serde(default = "defaults::speculation_max")]
    pub max_concurrent: usize,
}

impl Default for SpeculationSection {
    fn default() -> Self {
        Self {
            enabled: false,
            threshold: defaults::speculation_threshold(),
            max_concurrent: defaults::speculation_max(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PendingSection {
    #[serde(default = "defaults::pending_ttl_secs")]
    pub ttl_default_secs: u64,
    #[serde(default = "defaults::dependency_ttl_secs")]
    pub dependency_ttl_secs: u64,
}

impl Default for PendingSection {
    fn default() -> Self {
        Self {
            ttl_default_secs: defaults::pending_ttl_secs(),
            dependency_ttl_secs: defaults::dependency_ttl_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GraphSection {
    #[serde(default = "defaults::decay_lambda")]
    pub decay_lambda: f64,
}

impl Default for GraphSection {
    fn default() -> Self {
        Self {
            decay_lambda: defaults::decay_lambda(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ApprovalsSection {
    /// When set, tools and capabilities outside the allow-list trigger a
    /// dependency-approval pause instead of executing.
    #[serde(default)]
    pub require_approval: bool,
    #[serde(default)]
    pub allow: Vec<String>,
}

mod defaults {
    pub fn max_concurrency() -> usize {
        10
    }
    pub fn listen() -> String {
        "127.0.0.1:8848".to_string()
    }
    pub fn call_timeout_secs() -> u64 {
        30
    }
    pub fn max_in_flight() -> usize {
        64
    }
    pub fn worker_command() -> Vec<String> {
        vec!["tmg-sandbox-worker".to_string()]
    }
    pub fn sandbox_timeout_secs() -> u64 {
        30
    }
    pub fn sandbox_memory_mb() -> u64 {
        512
    }
    pub fn sandbox_search_k() -> usize {
        5
    }
    pub fn yes() -> bool {
        true
    }
    pub fn cache_capacity() -> usize {
        100
    }
    pub fn cache_ttl_secs() -> u64 {
        600
    }
    pub fn speculation_threshold() -> f64 {
        0.8
    }
    pub fn speculation_max() -> usize {
        2
    }
    pub fn pending_ttl_secs() -> u64 {
        3600
    }
    pub fn dependency_ttl_secs() -> u64 {
        300
    }
    pub fn decay_lambda() -> f64 {
        0.99
    }
}

impl GatewayConfig {
    pub fn load(path: &Path) -> GatewayResult<Self> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| GatewayError::config(format!("read {}: {}", path.display(), e)))?;
        Self::from_yaml(&raw)
    }

    pub fn from_yaml(raw: &str) -> GatewayResult<Self> {
        let config: Self = serde_yaml::from_str(raw)
            .map_err(|e| GatewayError::config(format!("parse config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> GatewayResult<()> {
        for server in &self.upstream_servers {
            let has_command = !server.command.is_empty();
            let has_url = server.url.is_some();
            if has_command == has_url {
                return Err(GatewayError::config(format!(
                    "server '{}' must set exactly one of `command` or `url`",
                    server.name
                )));
            }
        }
        let weights = &self.search.weights;
        let total = weights.alpha + weights.beta + weights.gamma;
        if (total - 1.0).abs() > 1e-6 {
            return Err(GatewayError::config(format!(
                "search weights must sum to 1.0 (got {})",
                total
            )));
        }
        if weights.alpha < 0.0 || weights.beta < 0.0 || weights.gamma < 0.0 {
            return Err(GatewayError::config("search weights must be non-negative"));
        }
        if !(0.0..=1.0).contains(&self.graph.decay_lambda) || self.graph.decay_lambda == 0.0 {
            return Err(GatewayError::config("graph.decay_lambda must be in (0, 1]"));
        }
        if self.max_concurrency == 0 {
            return Err(GatewayError::config("max_concurrency must be at least 1"));
        }
        Ok(())
    }

    pub fn upstream_config(&self) -> UpstreamConfig {
        UpstreamConfig {
            servers: self
                .upstream_servers
                .iter()
                .map(|entry| {
                    let launch = match &entry.url {
                        Some(url) => LaunchSpec::Http {
                            url: url.clone(),
                            token: entry.token.clone(),
                            headers: entry.headers.clone(),
                        },
                        None => LaunchSpec::Stdio {
                            command: entry.command[0].clone(),
                            args: entry.command[1..].to_vec(),
                            env: entry.env.clone(),
                        },
                    };
                    UpstreamServerConfig {
                        name: entry.name.clone(),
                        launch,
                        required: entry.required,
                        idle_timeout: entry.idle_timeout_secs.map(Duration::from_secs),
                        max_in_flight: entry.max_in_flight,
                        call_timeout: Duration::from_secs(entry.call_timeout_secs),
                    }
                })
                .collect(),
            restart: RestartPolicy::default(),
            refresh_interval: self.refresh_interval_secs.map(Duration::from_secs),
        }
    }

    pub fn sandbox_config(&self) -> SandboxConfig {
        SandboxConfig {
            worker_command: self.sandbox.worker_command.clone(),
            limits: SandboxLimits {
                timeout: Duration::from_secs(self.sandbox.timeout_secs),
                memory_limit: self.sandbox.memory_limit_mb * 1024 * 1024,
                allowed_read_paths: self.sandbox.allowed_read_paths.clone(),
                allowed_env: self.sandbox.allowed_env.clone(),
                allow_network: false,
                pii_protection: self.sandbox.pii_protection,
            },
            cache_enabled: self.cache.enabled,
            cache_capacity: self.cache.capacity,
            cache_ttl: Duration::from_secs(self.cache.ttl_secs),
            kill_grace: tmg_sandbox::limits::DEFAULT_KILL_GRACE,
        }
    }

    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            max_concurrency: self.max_concurrency,
            retry: RetryPolicy::default(),
            approval_ttl: Duration::from_secs(self.pending.ttl_default_secs),
            dependency_ttl: Duration::from_secs(self.pending.dependency_ttl_secs),
            speculation: SpeculationConfig {
                enabled: self.speculation.enabled,
                threshold: self.speculation.threshold,
                max_concurrent: self.speculation.max_concurrent,
                ..SpeculationConfig::default()
            },
            max_dag_depth: 4,
        }
    }

    pub fn search_weights(&self) -> SearchWeights {
        SearchWeights {
            alpha: self.search.weights.alpha,
            beta: self.search.weights.beta,
            gamma: self.search.weights.gamma,
        }
    }

    pub fn suggest_config(&self) -> SuggestConfig {
        SuggestConfig::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_yaml_uses_defaults() {
        let config = GatewayConfig::from_yaml("{}").unwrap();
        assert_eq!(config.max_concurrency, 10);
        assert!(config.cache.enabled);
        assert_eq!(config.cache.capacity, 100);
        assert!(config.sandbox.pii_protection);
        assert_eq!(config.graph.decay_lambda, 0.99);
        assert_eq!(config.pending.ttl_default_secs, 3600);
    }

    #[test]
    fn full_config_parses() {
        let raw = r#"
upstream_servers:
  - name: fs
    command: ["mcp-fs", "--root", "/data"]
    idle_timeout_secs: 300
  - name: web
    url: "https://mcp.example.com/rpc"
    token: "abc"
    required: true
max_concurrency: 4
sandbox:
  timeout_secs: 10
  memory_limit_mb: 128
  pii_protection: false
search:
  weights: {alpha: 0.5, beta: 0.3, gamma: 0.2}
speculation:
  enabled: true
  threshold: 0.9
graph:
  decay_lambda: 0.95
"#;
        let config = GatewayConfig::from_yaml(raw).unwrap();
        assert_eq!(config.upstream_servers.len(), 2);
        let upstream = config.upstream_config();
        assert!(matches!(upstream.servers[0].launch, LaunchSpec::Stdio { .. }));
        assert!(matches!(upstream.servers[1].launch, LaunchSpec::Http { .. }));
        assert!(upstream.servers[1].required);
        assert_eq!(
            upstream.servers[0].idle_timeout,
            Some(Duration::from_secs(300))
        );
        assert!(!config.sandbox_config().limits.pii_protection);
        assert!(config.engine_config().speculation.enabled);
        assert_eq!(config.search_weights().alpha, 0.5);
    }

    #[test]
    fn server_with_both_command_and_url_is_rejected() {
        let raw = r#"
upstream_servers:
  - name: bad
    command: ["x"]
    url: "http://y"
"#;
        assert!(GatewayConfig::from_yaml(raw).is_err());
    }

    #[test]
    fn server_with_neither_is_rejected() {
        let raw = "upstream_servers:\n  - name: bad\n";
        assert!(GatewayConfig::from_yaml(raw).is_err());
    }

    #[test]
    fn weights_must_sum_to_one() {
        let raw = "search:\n  weights: {alpha: 0.9, beta: 0.5, gamma: 0.1}\n";
        let err = GatewayConfig::from_yaml(raw).unwrap_err();
        assert!(err.message.contains("sum to 1.0"));
    }

    #[test]
    fn bad_lambda_is_rejected() {
        let raw = "graph:\n  decay_lambda: 1.5\n";
        assert!(GatewayConfig::from_yaml(raw).is_err());
    }

    #[test]
    fn unknown_keys_are_rejected() {
        assert!(GatewayConfig::from_yaml("surprise: true\n").is_err());
    }

    #[test]
    fn load_reads_a_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tmg.yaml");
        std::fs::write(&path, "max_concurrency: 3\n").unwrap();
        let config = GatewayConfig::load(&path).unwrap();
        assert_eq!(config.max_concurrency, 3);

        let err = GatewayConfig::load(&dir.path().join("missing.yaml")).unwrap_err();
        assert_eq!(err.kind, tmg_wire::ErrorKind::Config);
    }
}
