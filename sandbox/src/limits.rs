//! Sandbox resource limits and capability flags.

use std::time::Duration;

use serde::{Deserialize, Serialize};

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_MEMORY_LIMIT: u64 = 512 * 1024 * 1024;
pub const DEFAULT_KILL_GRACE: Duration = Duration::from_secs(2);

/// Limits and capability flags for one execution. Default-deny: no
/// filesystem access outside the allow-list, no network egress, no
/// subprocesses, no environment beyond the allow-list.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxLimits {
    #[serde(with = "duration_millis")]
    pub timeout: Duration,
    pub memory_limit: u64,
    pub allowed_read_paths: Vec<String>,
    pub allowed_env: Vec<String>,
    pub allow_network: bool,
    pub pii_protection: bool,
}

impl Default for SandboxLimits {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_TIMEOUT,
            memory_limit: DEFAULT_MEMORY_LIMIT,
            allowed_read_paths: Vec::new(),
            allowed_env: Vec::new(),
            allow_network: false,
            pii_protection: true,
        }
    }
}

impl SandboxLimits {
    /// Apply per-request overrides on top of the configured defaults.
    pub fn with_overrides(
        &self,
        timeout: Option<Duration>,
        memory_limit: Option<u64>,
        pii_protection: Option<bool>,
    ) -> Self {
        Self {
            timeout: timeout.unwrap_or(self.timeout),
            memory_limit: memory_limit.unwrap_or(self.memory_limit),
            pii_protection: pii_protection.unwrap_or(self.pii_protection),
            ..self.clone()
        }
    }
}

mod duration_millis {
    use super::*;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}
