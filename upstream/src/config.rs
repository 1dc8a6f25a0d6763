//! Upstream server launch specs and restart tuning.

use std::collections::HashMap;
use std::time::Duration;

/// How to reach one upstream server.
#[derive(Debug, Clone)]
pub enum LaunchSpec {
    /// Spawn a child process speaking newline-delimited MCP on stdio.
    Stdio {
        command: String,
        args: Vec<String>,
        env: HashMap<String, String>,
    },
    /// POST JSON-RPC to a single HTTP endpoint.
    Http {
        url: String,
        token: Option<String>,
        headers: HashMap<String, String>,
    },
}

#[derive(Debug, Clone)]
pub struct UpstreamServerConfig {
    pub name: String,
    pub launch: LaunchSpec,
    /// Startup failure of a required server is fatal to the gateway.
    pub required: bool,
    /// Close the session after this long without traffic; the next call
    /// respawns it transparently. `None` disables idle shutdown.
    pub idle_timeout: Option<Duration>,
    /// Bounded in-flight requests per session.
    pub max_in_flight: usize,
    /// Default per-call deadline when the caller sets none.
    pub call_timeout: Duration,
}

impl UpstreamServerConfig {
    pub fn stdio(name: impl Into<String>, command: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            name: name.into(),
            launch: LaunchSpec::Stdio {
                command: command.into(),
                args,
                env: HashMap::new(),
            },
            required: false,
            idle_timeout: None,
            max_in_flight: DEFAULT_MAX_IN_FLIGHT,
            call_timeout: DEFAULT_CALL_TIMEOUT,
        }
    }

    pub fn http(name: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            launch: LaunchSpec::Http {
                url: url.into(),
                token: None,
                headers: HashMap::new(),
            },
            required: false,
            idle_timeout: None,
            max_in_flight: DEFAULT_MAX_IN_FLIGHT,
            call_timeout: DEFAULT_CALL_TIMEOUT,
        }
    }
}

pub const DEFAULT_MAX_IN_FLIGHT: usize = 64;
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(300);

/// Supervised restart schedule: exponential backoff with jitter.
#[derive(Debug, Clone)]
pub struct RestartPolicy {
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub max_attempts: u32,
}

impl Default for RestartPolicy {
    fn default() -> Self {
        Self {
            initial_backoff: Duration::from_millis(250),
            max_backoff: Duration::from_secs(30),
            max_attempts: 5,
        }
    }
}

impl RestartPolicy {
    /// delay = min(initial * 2^(attempt-1), max) plus up to 25% jitter.
    pub fn delay(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        let exponent = attempt.saturating_sub(1).min(20);
        let base_ms = self.initial_backoff.as_millis() as u64;
        let raw = base_ms
            .saturating_mul(1u64 << exponent)
            .min(self.max_backoff.as_millis() as u64);
        let jitter = (raw as f64 * 0.25 * rand::random::<f64>()) as u64;
        Duration::from_millis(raw + jitter)
    }
}

#[derive(Debug, Clone, Default)]
pub struct UpstreamConfig {
    pub servers: Vec<UpstreamServerConfig>,
    pub restart: RestartPolicy,
    /// Re-list tools from healthy sessions on this cadence. `None`
    /// disables background refresh.
    pub refresh_interval: Option<Duration>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_grows_exponentially_and_caps() {
        let policy = RestartPolicy::default();
        let d1 = policy.delay(1);
        let d3 = policy.delay(3);
        assert!(d1 >= Duration::from_millis(250));
        assert!(d1 < Duration::from_millis(313));
        assert!(d3 >= Duration::from_millis(1000));
        // Far past the cap.
        let d20 = policy.delay(20);
        assert!(d20 <= Duration::from_millis(37_500 + 1));
        assert!(d20 >= Duration::from_secs(30));
    }

    #[test]
    fn zero_attempt_has_no_delay() {
        assert_eq!(RestartPolicy::default().delay(0), Duration::ZERO);
    }

    #[test]
    fn stdio_config_defaults() {
        let cfg = UpstreamServerConfig::stdio("fs", "mcp-fs", vec!["--root".into(), "/tmp".into()]);
        assert!(!cfg.required);
        assert_eq!(cfg.max_in_flight, DEFAULT_MAX_IN_FLIGHT);
        assert_eq!(cfg.call_timeout, DEFAULT_CALL_TIMEOUT);
    }
}
