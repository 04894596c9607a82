use std::collections::HashMap;

use config::{Config, ConfigError, Environment, File};
use secrecy::Secret;
use serde::Deserialize;

#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub retry: RetrySettings,
    pub circuit_breaker: CircuitBreakerSettings,
    pub http: HttpSettings,
    pub guardrail: GuardrailSettings,
    pub store: StoreConfig,
    pub security: SecurityConfig,
    pub observability: ObservabilityConfig,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub enable_cors: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".into(),
            port: 8000,
            enable_cors: true,
        }
    }
}

/// Retry tunables for outbound platform calls.
#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct RetrySettings {
    pub max_attempts: u32,
    pub initial_delay_secs: f64,
    pub max_delay_secs: f64,
    pub exponential_base: f64,
    pub jitter: bool,
    pub retryable_status_codes: Vec<u16>,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay_secs: 1.0,
            max_delay_secs: 60.0,
            exponential_base: 2.0,
            jitter: true,
            retryable_status_codes: vec![429, 500, 502, 503, 504],
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct CircuitBreakerSettings {
    pub failure_threshold: u32,
    pub recovery_timeout_secs: f64,
}

impl Default for CircuitBreakerSettings {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            recovery_timeout_secs: 60.0,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct HttpSettings {
    /// Overall per-request timeout.
    pub timeout_secs: f64,
    pub user_agent: String,
    /// Base URL overrides keyed by platform slug (e.g. `shopify`).
    pub base_urls: HashMap<String, String>,
}

impl Default for HttpSettings {
    fn default() -> Self {
        Self {
            timeout_secs: 30.0,
            user_agent: format!("marketops/{}", env!("CARGO_PKG_VERSION")),
            base_urls: HashMap::new(),
        }
    }
}

/// Cost guardrail limits. Enforced only when `low_cost_mode` is on.
#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct GuardrailSettings {
    pub low_cost_mode: bool,
    pub rate_limit_rpm: u32,
    pub daily_request_quota: u64,
    pub daily_token_quota: u64,
    pub monthly_cap_usd: f64,
}

impl Default for GuardrailSettings {
    fn default() -> Self {
        Self {
            low_cost_mode: false,
            rate_limit_rpm: 60,
            daily_request_quota: 5_000,
            daily_token_quota: 1_000_000,
            monthly_cap_usd: 100.0,
        }
    }
}

#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct StoreConfig {
    /// SQLite database path. In-memory store when unset.
    pub sqlite_path: Option<String>,
}

#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct SecurityConfig {
    /// Base64-encoded 32-byte key for credential encryption at rest.
    pub encryption_key: Option<Secret<String>>,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ObservabilityConfig {
    pub json_logs: bool,
    pub service_name: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            json_logs: false,
            service_name: "marketops".into(),
        }
    }
}

impl AppConfig {
    pub fn load() -> Result<Self, ConfigError> {
        let env = std::env::var("MARKETOPS_ENV").unwrap_or_else(|_| "development".into());

        let s = Config::builder()
            .add_source(File::with_name("config/default").required(false))
            .add_source(File::with_name(&format!("config/{}", env)).required(false))
            .add_source(File::with_name("config/local").required(false))
            // Map APP__GUARDRAIL__RATE_LIMIT_RPM=30 to guardrail.rate_limit_rpm
            .add_source(Environment::with_prefix("APP").separator("__"))
            .build()?;

        s.try_deserialize()
    }
}
