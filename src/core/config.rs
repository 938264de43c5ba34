use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::fs;
use std::path::Path;

const DEFAULT_HEALTH_PERIOD_SECONDS: u64 = 5;
const DEFAULT_FORWARD_DEADLINE_MS: u64 = 5000;

fn default_true() -> bool {
    true
}

fn default_health_period() -> u64 {
    DEFAULT_HEALTH_PERIOD_SECONDS
}

fn default_forward_deadline() -> u64 {
    DEFAULT_FORWARD_DEADLINE_MS
}

fn default_store_url() -> String {
    "redis://127.0.0.1:6379".to_string()
}

/// Top-level configuration for a Trellis node.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub node: NodeConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub gateway: GatewayConfig,
    #[serde(default)]
    pub health: HealthConfig,
    #[serde(default)]
    pub forward: ForwardConfig,
    #[serde(default)]
    pub telemetry: TelemetryConfig,
}

/// Identity and bind address of this node.
#[derive(Debug, Clone, Deserialize)]
pub struct NodeConfig {
    pub id: String,
    /// Node type, the first segment of routes this node serves.
    #[serde(rename = "type")]
    pub node_type: String,
    pub host: String,
    pub port: u16,
    #[serde(default)]
    pub hostname: Option<String>,
    #[serde(default = "default_version")]
    pub version: String,
}

fn default_version() -> String {
    env!("CARGO_PKG_VERSION").to_string()
}

#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StoreBackend {
    Memory,
    Redis,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StoreConfig {
    pub backend: StoreBackend,
    #[serde(default = "default_store_url")]
    pub url: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::Redis,
            url: default_store_url(),
        }
    }
}

/// Gateway nodes hold client connections; pure backend nodes disable this.
#[derive(Debug, Clone, Deserialize)]
pub struct GatewayConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self { enabled: true }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct HealthConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_health_period")]
    pub period_seconds: u64,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            period_seconds: DEFAULT_HEALTH_PERIOD_SECONDS,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ForwardConfig {
    #[serde(default = "default_forward_deadline")]
    pub deadline_ms: u64,
}

impl Default for ForwardConfig {
    fn default() -> Self {
        Self {
            deadline_ms: DEFAULT_FORWARD_DEADLINE_MS,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct TelemetryConfig {
    /// Log filter directive, e.g. `info` or `trellis=debug`.
    #[serde(default)]
    pub log_level: Option<String>,
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path_ref = path.as_ref();
        let data = fs::read_to_string(path_ref)
            .with_context(|| format!("unable to read config {}", path_ref.display()))?;
        let cfg: Self = toml::from_str(&data)
            .with_context(|| format!("invalid TOML config {}", path_ref.display()))?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<()> {
        if self.node.id.is_empty() {
            bail!("node.id must be non-empty");
        }
        if self.node.node_type.is_empty() {
            bail!("node.type must be non-empty");
        }
        if self.node.node_type.contains('.') {
            bail!("node.type must not contain '.'");
        }
        if self.node.host.is_empty() {
            bail!("node.host must be non-empty");
        }
        if self.node.port == 0 {
            bail!("node.port must be non-zero");
        }
        if self.health.period_seconds == 0 {
            bail!("health.period_seconds must be non-zero");
        }
        if self.forward.deadline_ms == 0 {
            bail!("forward.deadline_ms must be non-zero");
        }
        if self.store.backend == StoreBackend::Redis && self.store.url.is_empty() {
            bail!("store.url must be non-empty for the redis backend");
        }
        Ok(())
    }

    pub fn hostname(&self) -> String {
        self.node
            .hostname
            .clone()
            .unwrap_or_else(|| self.node.host.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(raw: &str) -> Result<Config> {
        let cfg: Config = toml::from_str(raw)?;
        cfg.validate()?;
        Ok(cfg)
    }

    #[test]
    fn minimal_config_fills_defaults() {
        let cfg = parse(
            r#"
            [node]
            id = "chat-1"
            type = "chat"
            host = "127.0.0.1"
            port = 9100
            "#,
        )
        .unwrap();
        assert!(cfg.gateway.enabled);
        assert!(cfg.health.enabled);
        assert_eq!(cfg.health.period_seconds, 5);
        assert_eq!(cfg.forward.deadline_ms, 5000);
        assert_eq!(cfg.store.backend, StoreBackend::Redis);
        assert_eq!(cfg.hostname(), "127.0.0.1");
    }

    #[test]
    fn dotted_node_type_is_rejected() {
        let err = parse(
            r#"
            [node]
            id = "chat-1"
            type = "chat.room"
            host = "127.0.0.1"
            port = 9100
            "#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("node.type"));
    }

    #[test]
    fn memory_backend_parses() {
        let cfg = parse(
            r#"
            [node]
            id = "gate-1"
            type = "gate"
            host = "0.0.0.0"
            port = 9000

            [store]
            backend = "memory"

            [gateway]
            enabled = false
            "#,
        )
        .unwrap();
        assert_eq!(cfg.store.backend, StoreBackend::Memory);
        assert!(!cfg.gateway.enabled);
    }
}
