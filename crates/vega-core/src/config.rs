//! Configuration parsing for the vega runtime.
//!
//! All components read their settings from a single JSON config file. The
//! only mandatory section is `accounts`; every tunable has a serde default.
//!
//! # Example config
//!
//! ```json
//! {
//!   "engine": { "module_name": "vega", "log_path": "/var/log/vega" },
//!   "accounts": [{
//!     "account_id": "ZX1234",
//!     "credentials": { "api_key": "...", "access_token": "..." },
//!     "max_connections": 3,
//!     "max_instruments_per_connection": 3000
//!   }],
//!   "pipeline": { "max_batch_size": 100, "flush_interval_ms": 100 },
//!   "rate_limits": [{ "category": "orders", "capacity": 10, "refill_per_sec": 10.0 }],
//!   "bus": { "kind": "udp", "addr": "127.0.0.1:9100" },
//!   "subscriptions": [{ "instrument_token": 256265, "mode": "full" }]
//! }
//! ```

use std::collections::HashSet;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Result, VegaError};
use crate::resilience::{BackoffConfig, CircuitBreakerConfig, DailyReset, RateLimitConfig};
use crate::time_util::MarketHours;
use crate::types::{AccountId, EndpointCategory, StreamMode};

/// Top-level application config, deserialized from a JSON file.
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    /// Process metadata (name, log path).
    #[serde(default)]
    pub engine: EngineMeta,

    /// Broker accounts. Each gets its own pool, session and breaker.
    pub accounts: Vec<AccountConfig>,

    #[serde(default)]
    pub broker: BrokerEndpoints,

    #[serde(default)]
    pub pool: PoolSettings,

    #[serde(default)]
    pub pipeline: PipelineSettings,

    #[serde(default)]
    pub executor: ExecutorSettings,

    #[serde(default)]
    pub breakers: BreakerSettings,

    #[serde(default = "default_rate_limits")]
    pub rate_limits: Vec<RateLimitConfig>,

    /// Time of day at which every rate-limit bucket refills.
    #[serde(default)]
    pub rate_limit_reset: Option<DailyReset>,

    #[serde(default)]
    pub market: MarketHours,

    #[serde(default)]
    pub bus: BusConfig,

    /// JSON array of instrument metadata served by the static registry.
    pub instruments_path: Option<PathBuf>,

    /// Subscription targets loaded at startup.
    #[serde(default)]
    pub subscriptions: Vec<SubscriptionConfig>,
}

/// Process metadata block.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct EngineMeta {
    pub module_name: Option<String>,
    pub log_path: Option<String>,
    pub log_level: Option<String>,
    pub json_logs: Option<bool>,
}

impl EngineMeta {
    pub fn module_name(&self) -> &str {
        self.module_name.as_deref().unwrap_or("vega")
    }
}

// ---------------------------------------------------------------------------
// Accounts
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct AccountConfig {
    pub account_id: AccountId,
    pub credentials: Credentials,
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    #[serde(default = "default_max_instruments")]
    pub max_instruments_per_connection: usize,
}

impl AccountConfig {
    /// Upper bound on concurrently subscribed tokens for this account.
    pub fn capacity(&self) -> usize {
        self.max_connections * self.max_instruments_per_connection
    }
}

/// Brokerage API credentials. Immutable after load.
#[derive(Clone, Default, Deserialize)]
pub struct Credentials {
    pub api_key: String,
    pub api_secret: Option<String>,
    /// Session token; if absent, `request_token` + `api_secret` are exchanged
    /// for one at startup.
    pub access_token: Option<String>,
    pub request_token: Option<String>,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("api_key", &self.api_key)
            .field("api_secret", &self.api_secret.as_ref().map(|_| "***"))
            .field("access_token", &self.access_token.as_ref().map(|_| "***"))
            .field("request_token", &self.request_token.as_ref().map(|_| "***"))
            .finish()
    }
}

fn default_max_connections() -> usize {
    3
}

fn default_max_instruments() -> usize {
    3000
}

#[derive(Debug, Clone, Deserialize)]
pub struct BrokerEndpoints {
    #[serde(default = "default_rest_url")]
    pub rest_url: String,
    #[serde(default = "default_ws_url")]
    pub ws_url: String,
    #[serde(default = "default_http_timeout_ms")]
    pub http_timeout_ms: u64,
    #[serde(default = "default_ping_interval_ms")]
    pub ws_ping_interval_ms: u64,
}

impl Default for BrokerEndpoints {
    fn default() -> Self {
        Self {
            rest_url: default_rest_url(),
            ws_url: default_ws_url(),
            http_timeout_ms: default_http_timeout_ms(),
            ws_ping_interval_ms: default_ping_interval_ms(),
        }
    }
}

fn default_rest_url() -> String {
    "https://api.kite.trade".to_string()
}

fn default_ws_url() -> String {
    "wss://ws.kite.trade".to_string()
}

fn default_http_timeout_ms() -> u64 {
    7_000
}

fn default_ping_interval_ms() -> u64 {
    10_000
}

// ---------------------------------------------------------------------------
// Connection pool
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct PoolSettings {
    /// Tokens per transport subscribe call.
    #[serde(default = "default_subscribe_batch")]
    pub subscribe_batch_size: usize,
    #[serde(default = "default_subscribe_timeout_ms")]
    pub subscribe_timeout_ms: u64,
    /// Extra attempts after a failed or timed-out batch.
    #[serde(default = "default_subscribe_retries")]
    pub subscribe_retries: u32,
    #[serde(default = "default_health_interval_ms")]
    pub health_check_interval_ms: u64,
    /// A connected socket with no tick for this long during market hours is
    /// considered stale.
    #[serde(default = "default_stale_after_ms")]
    pub stale_after_ms: u64,
    #[serde(default)]
    pub reconnect: BackoffConfig,
    #[serde(default = "default_close_grace_ms")]
    pub close_grace_ms: u64,
    /// Close connections whose last token was unsubscribed.
    #[serde(default = "default_true")]
    pub close_idle_connections: bool,
    /// Period of the runtime's target-set reconciliation across accounts.
    #[serde(default = "default_reconcile_interval_ms")]
    pub reconcile_interval_ms: u64,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            subscribe_batch_size: default_subscribe_batch(),
            subscribe_timeout_ms: default_subscribe_timeout_ms(),
            subscribe_retries: default_subscribe_retries(),
            health_check_interval_ms: default_health_interval_ms(),
            stale_after_ms: default_stale_after_ms(),
            reconnect: BackoffConfig::default(),
            close_grace_ms: default_close_grace_ms(),
            close_idle_connections: true,
            reconcile_interval_ms: default_reconcile_interval_ms(),
        }
    }
}

impl PoolSettings {
    pub fn subscribe_timeout(&self) -> Duration {
        Duration::from_millis(self.subscribe_timeout_ms)
    }

    pub fn health_check_interval(&self) -> Duration {
        Duration::from_millis(self.health_check_interval_ms.max(1))
    }

    pub fn stale_after(&self) -> Duration {
        Duration::from_millis(self.stale_after_ms)
    }

    pub fn close_grace(&self) -> Duration {
        Duration::from_millis(self.close_grace_ms)
    }

    pub fn reconcile_interval(&self) -> Duration {
        Duration::from_millis(self.reconcile_interval_ms.max(1))
    }
}

fn default_subscribe_batch() -> usize {
    200
}

fn default_subscribe_timeout_ms() -> u64 {
    5_000
}

fn default_subscribe_retries() -> u32 {
    2
}

fn default_health_interval_ms() -> u64 {
    5_000
}

fn default_stale_after_ms() -> u64 {
    30_000
}

fn default_close_grace_ms() -> u64 {
    3_000
}

fn default_reconcile_interval_ms() -> u64 {
    30_000
}

fn default_true() -> bool {
    true
}

// ---------------------------------------------------------------------------
// Tick pipeline
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct PipelineSettings {
    /// Capacity of the connection → pipeline hand-off queue (in frames).
    #[serde(default = "default_handoff_capacity")]
    pub handoff_capacity: usize,
    #[serde(default = "default_max_batch_size")]
    pub max_batch_size: usize,
    #[serde(default = "default_flush_interval_ms")]
    pub flush_interval_ms: u64,
    /// Hard cap on snapshots held per category while publishing is failing.
    #[serde(default = "default_max_pending")]
    pub max_pending_per_category: usize,
    #[serde(default = "default_greeks_workers")]
    pub greeks_workers: usize,
    #[serde(default = "default_greeks_queue")]
    pub greeks_queue_capacity: usize,
    #[serde(default = "default_publish_timeout_ms")]
    pub publish_timeout_ms: u64,
    /// Annualized, continuously compounded.
    #[serde(default = "default_risk_free_rate")]
    pub risk_free_rate: f64,
    /// Ticks stamped further than this into the future are rejected.
    #[serde(default = "default_max_future_skew_ms")]
    pub max_future_skew_ms: i64,
    /// Spot source for options whose metadata names no underlying.
    pub default_underlying_token: Option<u32>,
    #[serde(default = "default_underlying_channel")]
    pub underlying_channel: String,
    #[serde(default = "default_option_channel")]
    pub option_channel: String,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            handoff_capacity: default_handoff_capacity(),
            max_batch_size: default_max_batch_size(),
            flush_interval_ms: default_flush_interval_ms(),
            max_pending_per_category: default_max_pending(),
            greeks_workers: default_greeks_workers(),
            greeks_queue_capacity: default_greeks_queue(),
            publish_timeout_ms: default_publish_timeout_ms(),
            risk_free_rate: default_risk_free_rate(),
            max_future_skew_ms: default_max_future_skew_ms(),
            default_underlying_token: None,
            underlying_channel: default_underlying_channel(),
            option_channel: default_option_channel(),
        }
    }
}

impl PipelineSettings {
    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms.max(1))
    }

    pub fn publish_timeout(&self) -> Duration {
        Duration::from_millis(self.publish_timeout_ms)
    }
}

fn default_handoff_capacity() -> usize {
    8192
}

fn default_max_batch_size() -> usize {
    100
}

fn default_flush_interval_ms() -> u64 {
    100
}

fn default_max_pending() -> usize {
    5_000
}

fn default_greeks_workers() -> usize {
    2
}

fn default_greeks_queue() -> usize {
    1024
}

fn default_publish_timeout_ms() -> u64 {
    1_000
}

fn default_risk_free_rate() -> f64 {
    0.065
}

fn default_max_future_skew_ms() -> i64 {
    5 * 60 * 1_000
}

fn default_underlying_channel() -> String {
    "ticks:underlying".to_string()
}

fn default_option_channel() -> String {
    "ticks:options".to_string()
}

// ---------------------------------------------------------------------------
// Order executor
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct ExecutorSettings {
    #[serde(default = "default_workers")]
    pub workers: usize,
    /// Hard cap on live tasks in the store.
    #[serde(default = "default_max_tasks")]
    pub max_tasks: usize,
    /// Terminal tasks older than this are eligible for cleanup.
    #[serde(default = "default_retention_secs")]
    pub retention_secs: u64,
    /// How long an idempotency key maps to its task.
    #[serde(default = "default_idempotency_window_secs")]
    pub idempotency_window_secs: u64,
    /// Executions allowed before a retryable task is dead-lettered.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_backoff_base")]
    pub backoff_base: f64,
    #[serde(default = "default_backoff_cap_secs")]
    pub backoff_cap_secs: u64,
    #[serde(default = "default_call_timeout_ms")]
    pub call_timeout_ms: u64,
    /// Longest wait for an `orders` rate-limit token.
    #[serde(default = "default_rate_limit_wait_ms")]
    pub rate_limit_wait_ms: u64,
    /// Longest wait for an account lease.
    #[serde(default = "default_lease_timeout_ms")]
    pub lease_timeout_ms: u64,
    #[serde(default = "default_cleanup_interval_secs")]
    pub cleanup_interval_secs: u64,
}

impl Default for ExecutorSettings {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            max_tasks: default_max_tasks(),
            retention_secs: default_retention_secs(),
            idempotency_window_secs: default_idempotency_window_secs(),
            max_attempts: default_max_attempts(),
            backoff_base: default_backoff_base(),
            backoff_cap_secs: default_backoff_cap_secs(),
            call_timeout_ms: default_call_timeout_ms(),
            rate_limit_wait_ms: default_rate_limit_wait_ms(),
            lease_timeout_ms: default_lease_timeout_ms(),
            cleanup_interval_secs: default_cleanup_interval_secs(),
        }
    }
}

impl ExecutorSettings {
    pub fn retention(&self) -> Duration {
        Duration::from_secs(self.retention_secs)
    }

    pub fn idempotency_window(&self) -> Duration {
        Duration::from_secs(self.idempotency_window_secs)
    }

    pub fn backoff_cap(&self) -> Duration {
        Duration::from_secs(self.backoff_cap_secs)
    }

    pub fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.call_timeout_ms)
    }

    pub fn rate_limit_wait(&self) -> Duration {
        Duration::from_millis(self.rate_limit_wait_ms)
    }

    pub fn lease_timeout(&self) -> Duration {
        Duration::from_millis(self.lease_timeout_ms)
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_secs.max(1))
    }
}

fn default_workers() -> usize {
    4
}

fn default_max_tasks() -> usize {
    10_000
}

fn default_retention_secs() -> u64 {
    3_600
}

fn default_idempotency_window_secs() -> u64 {
    24 * 3_600
}

fn default_max_attempts() -> u32 {
    5
}

fn default_backoff_base() -> f64 {
    2.0
}

fn default_backoff_cap_secs() -> u64 {
    60
}

fn default_call_timeout_ms() -> u64 {
    10_000
}

fn default_rate_limit_wait_ms() -> u64 {
    5_000
}

fn default_lease_timeout_ms() -> u64 {
    30_000
}

fn default_cleanup_interval_secs() -> u64 {
    60
}

// ---------------------------------------------------------------------------
// Breakers, rate limits, bus
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Deserialize)]
pub struct BreakerSettings {
    /// Template for each account's brokerage session breaker.
    #[serde(default)]
    pub session: CircuitBreakerConfig,
    /// Breaker around the message bus.
    #[serde(default)]
    pub publisher: CircuitBreakerConfig,
}

fn default_rate_limits() -> Vec<RateLimitConfig> {
    vec![
        RateLimitConfig {
            category: EndpointCategory::Orders,
            capacity: 10,
            refill_per_sec: 10.0,
        },
        RateLimitConfig {
            category: EndpointCategory::Quotes,
            capacity: 1,
            refill_per_sec: 1.0,
        },
        RateLimitConfig {
            category: EndpointCategory::Historical,
            capacity: 3,
            refill_per_sec: 3.0,
        },
        RateLimitConfig {
            category: EndpointCategory::Subscriptions,
            capacity: 20,
            refill_per_sec: 20.0,
        },
    ]
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum BusConfig {
    /// Datagrams to a downstream fan-out process.
    Udp { addr: SocketAddr },
    /// In-process broadcast channel.
    Broadcast {
        #[serde(default = "default_broadcast_capacity")]
        capacity: usize,
    },
}

impl Default for BusConfig {
    fn default() -> Self {
        Self::Broadcast {
            capacity: default_broadcast_capacity(),
        }
    }
}

fn default_broadcast_capacity() -> usize {
    1024
}

/// One subscription target from the subscription store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubscriptionConfig {
    pub instrument_token: u32,
    #[serde(default)]
    pub mode: StreamMode,
    pub account_id: Option<AccountId>,
}

// ---------------------------------------------------------------------------
// Loading and validation
// ---------------------------------------------------------------------------

impl AppConfig {
    /// Reject configurations the runtime must refuse to start with.
    pub fn validate(&self) -> Result<()> {
        if self.accounts.is_empty() {
            return Err(VegaError::Config("no accounts configured".into()));
        }
        let mut seen = HashSet::new();
        for acc in &self.accounts {
            if !seen.insert(acc.account_id.as_str()) {
                return Err(VegaError::Config(format!(
                    "duplicate account_id '{}'",
                    acc.account_id
                )));
            }
            validate_credentials(acc)?;
            if acc.max_connections == 0 || acc.max_instruments_per_connection == 0 {
                return Err(VegaError::Config(format!(
                    "account '{}' has zero connection capacity",
                    acc.account_id
                )));
            }
        }
        for sub in &self.subscriptions {
            if let Some(id) = &sub.account_id {
                if !seen.contains(id.as_str()) {
                    return Err(VegaError::Config(format!(
                        "subscription {} references unknown account '{id}'",
                        sub.instrument_token
                    )));
                }
            }
        }
        if self.pool.subscribe_batch_size == 0 {
            return Err(VegaError::Config("pool.subscribe_batch_size must be > 0".into()));
        }
        if self.pipeline.max_batch_size == 0 || self.pipeline.handoff_capacity == 0 {
            return Err(VegaError::Config(
                "pipeline.max_batch_size and handoff_capacity must be > 0".into(),
            ));
        }
        if self.pipeline.greeks_workers == 0 {
            return Err(VegaError::Config("pipeline.greeks_workers must be > 0".into()));
        }
        if self.executor.workers == 0 || self.executor.max_tasks == 0 {
            return Err(VegaError::Config("executor.workers and max_tasks must be > 0".into()));
        }
        Ok(())
    }
}

fn validate_credentials(acc: &AccountConfig) -> Result<()> {
    let c = &acc.credentials;
    let present = |v: &Option<String>| v.as_deref().is_some_and(|s| !s.is_empty());
    if c.api_key.is_empty() {
        return Err(VegaError::Config(format!(
            "account '{}' is missing api_key",
            acc.account_id
        )));
    }
    if !present(&c.access_token) && !(present(&c.request_token) && present(&c.api_secret)) {
        return Err(VegaError::Config(format!(
            "account '{}' needs access_token or request_token + api_secret",
            acc.account_id
        )));
    }
    Ok(())
}

/// Load and parse a JSON config file.
pub fn load_config(path: &std::path::Path) -> anyhow::Result<AppConfig> {
    let content = std::fs::read_to_string(path)?;
    let config: AppConfig = serde_json::from_str(&content)?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"{
        "accounts": [{
            "account_id": "AB1234",
            "credentials": { "api_key": "k", "access_token": "t" }
        }]
    }"#;

    #[test]
    fn defaults_fill_everything() {
        let cfg: AppConfig = serde_json::from_str(MINIMAL).unwrap();
        cfg.validate().unwrap();
        assert_eq!(cfg.accounts[0].capacity(), 9_000);
        assert_eq!(cfg.pipeline.max_batch_size, 100);
        assert_eq!(cfg.executor.max_attempts, 5);
        assert_eq!(cfg.rate_limits.len(), 4);
        assert!(matches!(cfg.bus, BusConfig::Broadcast { .. }));
        assert_eq!(cfg.engine.module_name(), "vega");
    }

    #[test]
    fn missing_credentials_are_fatal() {
        let cfg: AppConfig = serde_json::from_str(
            r#"{ "accounts": [{ "account_id": "A", "credentials": { "api_key": "k" } }] }"#,
        )
        .unwrap();
        assert!(matches!(cfg.validate(), Err(VegaError::Config(_))));

        let cfg: AppConfig = serde_json::from_str(
            r#"{ "accounts": [{ "account_id": "A",
                 "credentials": { "api_key": "k", "request_token": "r", "api_secret": "s" } }] }"#,
        )
        .unwrap();
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn duplicate_and_unknown_accounts_rejected() {
        let dup = r#"{ "accounts": [
            { "account_id": "A", "credentials": { "api_key": "k", "access_token": "t" } },
            { "account_id": "A", "credentials": { "api_key": "k", "access_token": "t" } }
        ] }"#;
        let cfg: AppConfig = serde_json::from_str(dup).unwrap();
        assert!(cfg.validate().is_err());

        let unknown = r#"{
            "accounts": [{ "account_id": "A", "credentials": { "api_key": "k", "access_token": "t" } }],
            "subscriptions": [{ "instrument_token": 1, "account_id": "B" }]
        }"#;
        let cfg: AppConfig = serde_json::from_str(unknown).unwrap();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn udp_bus_and_reset_parse() {
        let json = r#"{
            "accounts": [{ "account_id": "A", "credentials": { "api_key": "k", "access_token": "t" } }],
            "bus": { "kind": "udp", "addr": "127.0.0.1:9100" },
            "rate_limit_reset": { "at": "08:00:00", "utc_offset_minutes": 330 },
            "market": { "open": "09:15:00", "close": "15:30:00" }
        }"#;
        let cfg: AppConfig = serde_json::from_str(json).unwrap();
        assert!(matches!(cfg.bus, BusConfig::Udp { .. }));
        assert_eq!(cfg.rate_limit_reset.unwrap().utc_offset_minutes, 330);
        assert_eq!(cfg.market.utc_offset_minutes, 330);
    }

    #[test]
    fn credentials_debug_redacts_secrets() {
        let c = Credentials {
            api_key: "key".into(),
            access_token: Some("secret-token".into()),
            ..Default::default()
        };
        let s = format!("{c:?}");
        assert!(s.contains("key"));
        assert!(!s.contains("secret-token"));
    }
}
