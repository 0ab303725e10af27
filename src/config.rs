//! Configuration types
//!
//! Hot-reloadable options for connections and resilience knobs. Durations
//! are stored as milliseconds for configuration-format friendliness, with
//! `Duration` accessors for runtime use. Validation is explicit predicates,
//! asserted by the registration helper at startup.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

use crate::driver::IsolationLevel;
use crate::error::{Error, Result};

fn default_true() -> bool {
    true
}

// ============================================================================
// DbOptions
// ============================================================================

/// Connection name used when nothing else is configured
pub const FALLBACK_CONNECTION_NAME: &str = "defaultDatabase";

fn default_connection_name() -> String {
    FALLBACK_CONNECTION_NAME.to_string()
}

fn default_command_timeout_ms() -> u64 {
    30_000
}

fn default_isolation() -> IsolationLevel {
    IsolationLevel::ReadCommitted
}

/// Core execution options; read once per execution and treated as frozen.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DbOptions {
    /// Logical name used when a query names no connection
    #[serde(default = "default_connection_name")]
    pub default_connection_name: String,

    /// Global command timeout in milliseconds; strictly positive
    #[serde(default = "default_command_timeout_ms")]
    pub command_timeout_ms: u64,

    /// Isolation applied when a query carries no hint
    #[serde(default = "default_isolation")]
    pub default_isolation: IsolationLevel,

    /// Routing hint reserved for read/write-splitting middleware
    #[serde(default)]
    pub prefer_read_only_connection: bool,

    /// Logical name → connection string; looked up case-insensitively.
    /// May be empty at startup and populated by the configuration loader.
    #[serde(default)]
    pub connection_strings: HashMap<String, String>,
}

impl Default for DbOptions {
    fn default() -> Self {
        Self {
            default_connection_name: default_connection_name(),
            command_timeout_ms: default_command_timeout_ms(),
            default_isolation: default_isolation(),
            prefer_read_only_connection: false,
            connection_strings: HashMap::new(),
        }
    }
}

impl DbOptions {
    /// Global command timeout as a `Duration`
    pub fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.command_timeout_ms)
    }

    /// Case-insensitive connection-string lookup
    pub fn connection_string(&self, name: &str) -> Option<&str> {
        self.connection_strings
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Insert or replace a connection string, treating the name
    /// case-insensitively.
    pub fn set_connection_string(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        self.connection_strings
            .retain(|k, _| !k.eq_ignore_ascii_case(&name));
        self.connection_strings.insert(name, value.into());
    }

    /// Startup validation: positive timeout, non-blank default name.
    pub fn validate(&self) -> Result<()> {
        if self.command_timeout_ms == 0 {
            return Err(Error::config("command_timeout_ms must be positive"));
        }
        if self.default_connection_name.trim().is_empty() {
            return Err(Error::config("default_connection_name must not be blank"));
        }
        Ok(())
    }
}

// ============================================================================
// DbResilienceOptions
// ============================================================================

/// Retry knobs
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryOptions {
    /// Total attempts; 0 disables retry entirely
    #[serde(default = "RetryOptions::default_max_attempts")]
    pub max_attempts: u32,

    /// First-retry delay in milliseconds
    #[serde(default = "RetryOptions::default_base_delay_ms")]
    pub base_delay_ms: u64,

    /// Exponential growth factor applied per attempt
    #[serde(default = "RetryOptions::default_backoff_exponent")]
    pub backoff_exponent: f64,

    /// Apply full jitter to each delay
    #[serde(default = "default_true")]
    pub use_jitter: bool,
}

impl RetryOptions {
    fn default_max_attempts() -> u32 {
        3
    }

    fn default_base_delay_ms() -> u64 {
        100
    }

    fn default_backoff_exponent() -> f64 {
        2.0
    }

    /// Base delay as a `Duration`
    pub fn base_delay(&self) -> Duration {
        Duration::from_millis(self.base_delay_ms)
    }
}

impl Default for RetryOptions {
    fn default() -> Self {
        Self {
            max_attempts: Self::default_max_attempts(),
            base_delay_ms: Self::default_base_delay_ms(),
            backoff_exponent: Self::default_backoff_exponent(),
            use_jitter: true,
        }
    }
}

/// Per-attempt timeout knobs
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeoutOptions {
    /// Enable the per-attempt wall-clock cap
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Cap in milliseconds; strictly positive when enabled
    #[serde(default = "TimeoutOptions::default_per_attempt_ms")]
    pub per_attempt_ms: u64,
}

impl TimeoutOptions {
    fn default_per_attempt_ms() -> u64 {
        30_000
    }

    /// Per-attempt cap as a `Duration`
    pub fn per_attempt(&self) -> Duration {
        Duration::from_millis(self.per_attempt_ms)
    }
}

impl Default for TimeoutOptions {
    fn default() -> Self {
        Self {
            enabled: true,
            per_attempt_ms: Self::default_per_attempt_ms(),
        }
    }
}

/// Circuit-breaker knobs
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitBreakerOptions {
    /// Enable the breaker
    #[serde(default)]
    pub enabled: bool,

    /// Transient failures within the sampling window that open the circuit
    #[serde(default = "CircuitBreakerOptions::default_failure_threshold")]
    pub failure_threshold: u32,

    /// Rolling window in milliseconds over which failures are counted
    #[serde(default = "CircuitBreakerOptions::default_sampling_window_ms")]
    pub sampling_window_ms: u64,

    /// How long the circuit stays open before a half-open probe
    #[serde(default = "CircuitBreakerOptions::default_break_duration_ms")]
    pub break_duration_ms: u64,
}

impl CircuitBreakerOptions {
    fn default_failure_threshold() -> u32 {
        5
    }

    fn default_sampling_window_ms() -> u64 {
        30_000
    }

    fn default_break_duration_ms() -> u64 {
        30_000
    }

    /// Sampling window as a `Duration`
    pub fn sampling_window(&self) -> Duration {
        Duration::from_millis(self.sampling_window_ms)
    }

    /// Break duration as a `Duration`
    pub fn break_duration(&self) -> Duration {
        Duration::from_millis(self.break_duration_ms)
    }
}

impl Default for CircuitBreakerOptions {
    fn default() -> Self {
        Self {
            enabled: false,
            failure_threshold: Self::default_failure_threshold(),
            sampling_window_ms: Self::default_sampling_window_ms(),
            break_duration_ms: Self::default_break_duration_ms(),
        }
    }
}

/// Bulkhead knobs
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BulkheadOptions {
    /// Enable the bulkhead
    #[serde(default)]
    pub enabled: bool,

    /// Concurrent executions admitted
    #[serde(default = "BulkheadOptions::default_max_concurrent")]
    pub max_concurrent: u32,

    /// Executions allowed to wait for a permit; overflow is rejected
    #[serde(default = "BulkheadOptions::default_max_queued")]
    pub max_queued: u32,
}

impl BulkheadOptions {
    fn default_max_concurrent() -> u32 {
        64
    }

    fn default_max_queued() -> u32 {
        256
    }
}

impl Default for BulkheadOptions {
    fn default() -> Self {
        Self {
            enabled: false,
            max_concurrent: Self::default_max_concurrent(),
            max_queued: Self::default_max_queued(),
        }
    }
}

/// Rate-limiter knobs
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimiterOptions {
    /// Enable the rate limiter
    #[serde(default)]
    pub enabled: bool,

    /// Token-bucket capacity, replenished in full each period
    #[serde(default = "RateLimiterOptions::default_permit_limit")]
    pub permit_limit: u32,

    /// Replenishment period in milliseconds
    #[serde(default = "RateLimiterOptions::default_replenishment_period_ms")]
    pub replenishment_period_ms: u64,
}

impl RateLimiterOptions {
    fn default_permit_limit() -> u32 {
        1_000
    }

    fn default_replenishment_period_ms() -> u64 {
        1_000
    }

    /// Replenishment period as a `Duration`
    pub fn replenishment_period(&self) -> Duration {
        Duration::from_millis(self.replenishment_period_ms)
    }
}

impl Default for RateLimiterOptions {
    fn default() -> Self {
        Self {
            enabled: false,
            permit_limit: Self::default_permit_limit(),
            replenishment_period_ms: Self::default_replenishment_period_ms(),
        }
    }
}

/// Resilience pipeline options; one frozen snapshot builds one pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DbResilienceOptions {
    /// Master switch; false yields an empty pipeline
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Retry policy
    #[serde(default)]
    pub retry: RetryOptions,

    /// Per-attempt timeout policy
    #[serde(default)]
    pub timeout: TimeoutOptions,

    /// Circuit-breaker policy
    #[serde(default)]
    pub circuit_breaker: CircuitBreakerOptions,

    /// Bulkhead policy
    #[serde(default)]
    pub bulkhead: BulkheadOptions,

    /// Rate-limiter policy
    #[serde(default)]
    pub rate_limiter: RateLimiterOptions,
}

impl Default for DbResilienceOptions {
    fn default() -> Self {
        Self {
            enabled: true,
            retry: RetryOptions::default(),
            timeout: TimeoutOptions::default(),
            circuit_breaker: CircuitBreakerOptions::default(),
            bulkhead: BulkheadOptions::default(),
            rate_limiter: RateLimiterOptions::default(),
        }
    }
}

impl DbResilienceOptions {
    /// Startup validation of every enabled section.
    pub fn validate(&self) -> Result<()> {
        if self.retry.max_attempts > 0 && self.retry.backoff_exponent < 1.0 {
            return Err(Error::config("retry.backoff_exponent must be >= 1.0"));
        }
        if self.timeout.enabled && self.timeout.per_attempt_ms == 0 {
            return Err(Error::config("timeout.per_attempt_ms must be positive"));
        }
        if self.circuit_breaker.enabled {
            if self.circuit_breaker.failure_threshold == 0 {
                return Err(Error::config(
                    "circuit_breaker.failure_threshold must be positive",
                ));
            }
            if self.circuit_breaker.sampling_window_ms == 0 {
                return Err(Error::config(
                    "circuit_breaker.sampling_window_ms must be positive",
                ));
            }
        }
        if self.bulkhead.enabled && self.bulkhead.max_concurrent == 0 {
            return Err(Error::config("bulkhead.max_concurrent must be positive"));
        }
        if self.rate_limiter.enabled {
            if self.rate_limiter.permit_limit == 0 {
                return Err(Error::config("rate_limiter.permit_limit must be positive"));
            }
            if self.rate_limiter.replenishment_period_ms == 0 {
                return Err(Error::config(
                    "rate_limiter.replenishment_period_ms must be positive",
                ));
            }
        }
        Ok(())
    }
}

// ============================================================================
// Configuration loader
// ============================================================================

/// Section prefix holding connection strings in an external settings source
pub const CONNECTION_STRINGS_SECTION: &str = "connection_strings";

/// External key/value settings with case-insensitive keys.
pub trait KeyValueSource: Send + Sync {
    /// Look up one key (case-insensitive)
    fn get(&self, key: &str) -> Option<String>;

    /// All entries under `prefix:`, with the prefix stripped
    fn section(&self, prefix: &str) -> Vec<(String, String)>;

    /// Dedicated connection-string lookup for a logical name
    fn connection_string(&self, name: &str) -> Option<String> {
        self.get(&format!("{CONNECTION_STRINGS_SECTION}:{name}"))
    }
}

/// In-memory [`KeyValueSource`]
#[derive(Debug, Clone, Default)]
pub struct MapSource {
    entries: Vec<(String, String)>,
}

impl MapSource {
    /// Create an empty source
    pub fn new() -> Self {
        Self::default()
    }

    /// Add one entry
    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.entries.push((key.into(), value.into()));
        self
    }
}

impl KeyValueSource for MapSource {
    fn get(&self, key: &str) -> Option<String> {
        self.entries
            .iter()
            .rev()
            .find(|(k, _)| k.eq_ignore_ascii_case(key))
            .map(|(_, v)| v.clone())
    }

    fn section(&self, prefix: &str) -> Vec<(String, String)> {
        let full = format!("{prefix}:");
        self.entries
            .iter()
            .filter_map(|(k, v)| {
                let head = k.get(..full.len())?;
                let tail = k.get(full.len()..)?;
                if !tail.is_empty() && head.eq_ignore_ascii_case(&full) {
                    Some((tail.to_string(), v.clone()))
                } else {
                    None
                }
            })
            .collect()
    }
}

/// Post-configure step: merge the connection-strings section of an external
/// settings source into the options map, then resolve the default connection
/// name through the dedicated lookup. Blank values are ignored. Idempotent;
/// run once per configuration snapshot.
pub fn apply_connection_strings(options: &mut DbOptions, source: &dyn KeyValueSource) {
    for (name, value) in source.section(CONNECTION_STRINGS_SECTION) {
        if value.trim().is_empty() {
            continue;
        }
        options.set_connection_string(name, value);
    }

    let default_name = options.default_connection_name.clone();
    if let Some(value) = source.connection_string(&default_name) {
        if !value.trim().is_empty() {
            options.set_connection_string(default_name, value);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_db_options_defaults() {
        let opts = DbOptions::default();
        assert_eq!(opts.default_connection_name, "defaultDatabase");
        assert_eq!(opts.command_timeout(), Duration::from_secs(30));
        assert_eq!(opts.default_isolation, IsolationLevel::ReadCommitted);
        assert!(!opts.prefer_read_only_connection);
        assert!(opts.connection_strings.is_empty());
        opts.validate().unwrap();
    }

    #[test]
    fn test_db_options_validation() {
        let mut opts = DbOptions {
            command_timeout_ms: 0,
            ..Default::default()
        };
        assert!(opts.validate().is_err());

        opts.command_timeout_ms = 1;
        opts.default_connection_name = "  ".into();
        assert!(opts.validate().is_err());
    }

    #[test]
    fn test_connection_string_case_insensitive() {
        let mut opts = DbOptions::default();
        opts.set_connection_string("Reports", "server=A");
        assert_eq!(opts.connection_string("reports"), Some("server=A"));
        assert_eq!(opts.connection_string("REPORTS"), Some("server=A"));

        // Replacement is case-insensitive too: one live entry per name
        opts.set_connection_string("REPORTS", "server=B");
        assert_eq!(opts.connection_string("reports"), Some("server=B"));
        assert_eq!(opts.connection_strings.len(), 1);
    }

    #[test]
    fn test_resilience_defaults_and_validation() {
        let opts = DbResilienceOptions::default();
        assert!(opts.enabled);
        assert_eq!(opts.retry.max_attempts, 3);
        assert!(opts.timeout.enabled);
        assert!(!opts.circuit_breaker.enabled);
        assert!(!opts.bulkhead.enabled);
        assert!(!opts.rate_limiter.enabled);
        opts.validate().unwrap();

        let mut bad = DbResilienceOptions::default();
        bad.timeout.per_attempt_ms = 0;
        assert!(bad.validate().is_err());

        let mut bad = DbResilienceOptions::default();
        bad.circuit_breaker.enabled = true;
        bad.circuit_breaker.failure_threshold = 0;
        assert!(bad.validate().is_err());

        let mut bad = DbResilienceOptions::default();
        bad.retry.backoff_exponent = 0.5;
        assert!(bad.validate().is_err());
    }

    #[test]
    fn test_resilience_deserializes_with_defaults() {
        let opts: DbResilienceOptions = serde_json::from_str("{}").unwrap();
        assert!(opts.enabled);
        assert_eq!(opts.retry.base_delay_ms, 100);

        let opts: DbResilienceOptions =
            serde_json::from_str(r#"{"retry": {"max_attempts": 7}}"#).unwrap();
        assert_eq!(opts.retry.max_attempts, 7);
        assert_eq!(opts.retry.backoff_exponent, 2.0);
    }

    #[test]
    fn test_apply_connection_strings_merges_section() {
        let mut opts = DbOptions::default();
        let source = MapSource::new()
            .with("connection_strings:reports", "server=R")
            .with("connection_strings:blank", "   ")
            .with("CONNECTION_STRINGS:audit", "server=A");

        apply_connection_strings(&mut opts, &source);
        assert_eq!(opts.connection_string("reports"), Some("server=R"));
        assert_eq!(opts.connection_string("audit"), Some("server=A"));
        assert_eq!(opts.connection_string("blank"), None);
    }

    #[test]
    fn test_apply_connection_strings_resolves_default_name() {
        let mut opts = DbOptions::default();
        let source = MapSource::new().with("connection_strings:defaultDatabase", "server=D");

        apply_connection_strings(&mut opts, &source);
        assert_eq!(
            opts.connection_string("defaultDatabase"),
            Some("server=D")
        );
    }

    #[test]
    fn test_apply_connection_strings_idempotent() {
        let mut opts = DbOptions::default();
        let source = MapSource::new().with("connection_strings:reports", "server=R");

        apply_connection_strings(&mut opts, &source);
        apply_connection_strings(&mut opts, &source);
        assert_eq!(opts.connection_strings.len(), 1);
        assert_eq!(opts.connection_string("reports"), Some("server=R"));
    }
}
