use serde::{Deserialize, Serialize};
use std::path::PathBuf;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub gateway: GatewayConfig,

    #[serde(default)]
    pub oracle: OracleConfig,

    #[serde(default)]
    pub limits: LimitsConfig,

    #[serde(default)]
    pub schema: SchemaConfig,

    #[serde(default)]
    pub safety: SafetyConfig,

    #[serde(default)]
    pub pool: PoolConfig,

    #[serde(default)]
    pub sessions: SessionConfig,

    #[serde(default)]
    pub data_dir: Option<PathBuf>,

    #[serde(default)]
    pub log_dir: Option<PathBuf>,

    #[serde(default)]
    pub log_level: Option<String>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            gateway: GatewayConfig::default(),
            oracle: OracleConfig::default(),
            limits: LimitsConfig::default(),
            schema: SchemaConfig::default(),
            safety: SafetyConfig::default(),
            pool: PoolConfig::default(),
            sessions: SessionConfig::default(),
            data_dir: None,
            log_dir: None,
            log_level: Some("info".to_string()),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,

    /// Bearer token required on WebSocket handshake. `None` disables the
    /// check (local playground mode).
    #[serde(default)]
    pub api_key: Option<String>,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            api_key: None,
        }
    }
}

/// The language-model endpoint. Absence of a reachable oracle degrades
/// the planner and the final summary to deterministic fallbacks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OracleConfig {
    #[serde(default)]
    pub enabled: bool,

    #[serde(default = "default_oracle_base_url")]
    pub base_url: String,

    #[serde(default = "default_oracle_model")]
    pub model: String,

    #[serde(default)]
    pub api_key: Option<String>,

    #[serde(default = "default_oracle_timeout_ms")]
    pub timeout_ms: u64,
}

impl Default for OracleConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            base_url: default_oracle_base_url(),
            model: default_oracle_model(),
            api_key: None,
            timeout_ms: default_oracle_timeout_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitsConfig {
    /// Hard cap injected into every read and aggregation.
    #[serde(default = "default_row_cap")]
    pub row_cap: i64,

    /// Wall-clock budget for a single database statement.
    #[serde(default = "default_query_timeout_ms")]
    pub query_timeout_ms: u64,

    /// Wall-clock budget for the connection preflight probe.
    #[serde(default = "default_preflight_timeout_ms")]
    pub preflight_timeout_ms: u64,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            row_cap: default_row_cap(),
            query_timeout_ms: default_query_timeout_ms(),
            preflight_timeout_ms: default_preflight_timeout_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchemaConfig {
    /// Snapshot freshness window.
    #[serde(default = "default_schema_ttl_ms")]
    pub ttl_ms: u64,

    /// Sample size per collection when inferring document schemas.
    #[serde(default = "default_sample_size")]
    pub sample_size: usize,
}

impl Default for SchemaConfig {
    fn default() -> Self {
        Self {
            ttl_ms: default_schema_ttl_ms(),
            sample_size: default_sample_size(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SafetyConfig {
    /// Replace SQL text with `[redacted]` in user-facing responses.
    #[serde(default)]
    pub redact_sql: bool,
}

impl Default for SafetyConfig {
    fn default() -> Self {
        Self { redact_sql: false }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    #[serde(default = "default_pool_max_size")]
    pub max_size: u32,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_size: default_pool_max_size(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Sessions idle longer than this are marked inactive by the sweep.
    #[serde(default = "default_idle_timeout_mins")]
    pub idle_timeout_mins: u64,

    /// Sessions inactive longer than this are removed from storage.
    #[serde(default = "default_expiry_days")]
    pub expiry_days: u64,

    #[serde(default = "default_max_per_user")]
    pub max_per_user: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            idle_timeout_mins: default_idle_timeout_mins(),
            expiry_days: default_expiry_days(),
            max_per_user: default_max_per_user(),
        }
    }
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    4700
}

fn default_oracle_base_url() -> String {
    "http://localhost:11434".to_string()
}

fn default_oracle_model() -> String {
    "llama3.1".to_string()
}

fn default_oracle_timeout_ms() -> u64 {
    30_000
}

fn default_row_cap() -> i64 {
    1000
}

fn default_query_timeout_ms() -> u64 {
    15_000
}

fn default_preflight_timeout_ms() -> u64 {
    5_000
}

fn default_schema_ttl_ms() -> u64 {
    86_400_000
}

fn default_sample_size() -> usize {
    10
}

fn default_pool_max_size() -> u32 {
    5
}

fn default_idle_timeout_mins() -> u64 {
    60
}

fn default_expiry_days() -> u64 {
    30
}

fn default_max_per_user() -> usize {
    20
}

#[cfg(test)]
mod tests {
    use super::AppConfig;

    #[test]
    fn defaults_cover_every_section() {
        let config = AppConfig::default();
        assert_eq!(config.gateway.host, "127.0.0.1");
        assert_eq!(config.limits.row_cap, 1000);
        assert_eq!(config.limits.query_timeout_ms, 15_000);
        assert_eq!(config.limits.preflight_timeout_ms, 5_000);
        assert_eq!(config.schema.ttl_ms, 86_400_000);
        assert_eq!(config.sessions.expiry_days, 30);
        assert!(!config.safety.redact_sql);
        assert!(!config.oracle.enabled);
    }

    #[test]
    fn partial_yaml_keeps_defaults_for_missing_sections() {
        let raw = "
limits:
  row_cap: 250
safety:
  redact_sql: true
";
        let config: AppConfig = serde_yaml::from_str(raw).expect("yaml should parse");
        assert_eq!(config.limits.row_cap, 250);
        assert!(config.safety.redact_sql);
        // Untouched sections fall back to defaults.
        assert_eq!(config.limits.query_timeout_ms, 15_000);
        assert_eq!(config.pool.max_size, 5);
    }
}
