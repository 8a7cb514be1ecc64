// Configuration structs

use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};

use crate::gateway::Capability;

#[derive(Debug, Clone, Default)]
pub struct Config {
    pub server: ServerConfig,
    pub tool: ToolConfig,
    pub evolve: EvolveConfig,
}

/// HTTP server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Bind address (e.g., "127.0.0.1:8000")
    #[serde(default = "default_bind_address")]
    pub bind_address: String,

    /// Enable API key authentication
    #[serde(default)]
    pub auth_enabled: bool,

    /// Valid API keys for authentication
    #[serde(default)]
    pub api_keys: Vec<String>,

    /// Sustained requests per second per client IP
    #[serde(default = "default_requests_per_second")]
    pub requests_per_second: f64,

    /// Burst capacity above the sustained rate
    #[serde(default = "default_burst")]
    pub burst: f64,
}

/// External code-generation tool configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolConfig {
    /// Tool binary name or path
    #[serde(default = "default_binary")]
    pub binary: String,

    /// Primary capability tier requested by default
    #[serde(default = "default_primary_tier")]
    pub primary_tier: String,

    /// Fallback tier tried once when the primary fails
    #[serde(default = "default_fallback_tier")]
    pub fallback_tier: Option<String>,

    /// Per-invocation timeout in seconds
    #[serde(default = "default_tool_timeout")]
    pub timeout_secs: u64,

    /// Capabilities granted when a request doesn't name its own
    #[serde(default = "default_capabilities")]
    pub default_capabilities: Vec<Capability>,
}

/// Evolution engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvolveConfig {
    /// Verification command timeout in seconds (distinct from the tool timeout)
    #[serde(default = "default_verify_timeout")]
    pub verify_timeout_secs: u64,

    /// Upper bound accepted for a submission's max_iterations
    #[serde(default = "default_iteration_cap")]
    pub max_iterations_cap: u32,
}

fn default_bind_address() -> String {
    "127.0.0.1:8000".to_string()
}

fn default_requests_per_second() -> f64 {
    10.0
}

fn default_burst() -> f64 {
    20.0
}

fn default_binary() -> String {
    "claude".to_string()
}

fn default_primary_tier() -> String {
    "sonnet".to_string()
}

fn default_fallback_tier() -> Option<String> {
    Some("haiku".to_string())
}

fn default_tool_timeout() -> u64 {
    300
}

fn default_capabilities() -> Vec<Capability> {
    vec![
        Capability::Read,
        Capability::Search,
        Capability::Edit,
        Capability::Write,
        Capability::Execute,
    ]
}

fn default_verify_timeout() -> u64 {
    60
}

fn default_iteration_cap() -> u32 {
    20
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
            auth_enabled: false,
            api_keys: vec![],
            requests_per_second: default_requests_per_second(),
            burst: default_burst(),
        }
    }
}

impl Default for ToolConfig {
    fn default() -> Self {
        Self {
            binary: default_binary(),
            primary_tier: default_primary_tier(),
            fallback_tier: default_fallback_tier(),
            timeout_secs: default_tool_timeout(),
            default_capabilities: default_capabilities(),
        }
    }
}

impl Default for EvolveConfig {
    fn default() -> Self {
        Self {
            verify_timeout_secs: default_verify_timeout(),
            max_iterations_cap: default_iteration_cap(),
        }
    }
}

impl Config {
    pub fn validate(&self) -> Result<()> {
        if self.tool.binary.trim().is_empty() {
            bail!("tool.binary must not be empty");
        }
        if self.tool.timeout_secs == 0 {
            bail!("tool.timeout_secs must be positive");
        }
        if self.evolve.verify_timeout_secs == 0 {
            bail!("evolve.verify_timeout_secs must be positive");
        }
        if self.evolve.max_iterations_cap == 0 {
            bail!("evolve.max_iterations_cap must be positive");
        }
        if self.server.auth_enabled && self.server.api_keys.is_empty() {
            bail!("server.auth_enabled requires at least one api key");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        Config::default().validate().unwrap();
    }

    #[test]
    fn test_auth_without_keys_rejected() {
        let mut config = Config::default();
        config.server.auth_enabled = true;
        assert!(config.validate().is_err());

        config.server.api_keys = vec!["secret".to_string()];
        config.validate().unwrap();
    }

    #[test]
    fn test_zero_timeouts_rejected() {
        let mut config = Config::default();
        config.tool.timeout_secs = 0;
        assert!(config.validate().is_err());
    }
}
