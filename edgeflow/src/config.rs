//! Runtime configuration.
//!
//! Every field has a serde default, so a partial JSON document (or none at
//! all) yields a usable configuration. Environment variables prefixed with
//! `EDGEFLOW_` override file values.

use anyhow::Context as _;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EdgeflowConfig {
    /// Smart cache settings.
    #[serde(default)]
    pub cache: CacheConfig,
    /// Request coalescer settings.
    #[serde(default)]
    pub coalescer: CoalescerConfig,
    /// Changelist transaction settings.
    #[serde(default)]
    pub changelist: ChangelistConfig,
    /// Workflow executor settings.
    #[serde(default)]
    pub workflow: WorkflowConfig,
    /// Recovery strategy settings.
    #[serde(default)]
    pub recovery: RecoveryConfig,
}

impl EdgeflowConfig {
    /// Creates a configuration with defaults.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Parses a JSON document.
    ///
    /// # Errors
    ///
    /// Returns an error if the document is not valid configuration JSON.
    pub fn from_json_str(json: &str) -> anyhow::Result<Self> {
        serde_json::from_str(json).context("invalid edgeflow configuration")
    }

    /// Reads a JSON configuration file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        Self::from_json_str(&raw).with_context(|| format!("in {}", path.display()))
    }

    /// Applies `EDGEFLOW_*` environment variable overrides.
    ///
    /// # Errors
    ///
    /// Returns an error if a set variable cannot be parsed.
    pub fn apply_env_overrides(self) -> anyhow::Result<Self> {
        self.apply_overrides_from(|key| std::env::var(key).ok())
    }

    /// Applies overrides from an arbitrary lookup, keyed by env variable name.
    ///
    /// # Errors
    ///
    /// Returns an error if a present value cannot be parsed.
    pub fn apply_overrides_from<F>(mut self, lookup: F) -> anyhow::Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        fn parse<T: std::str::FromStr>(key: &str, raw: &str) -> anyhow::Result<T>
        where
            T::Err: std::fmt::Display,
        {
            raw.trim()
                .parse::<T>()
                .map_err(|e| anyhow::anyhow!("invalid value for {key}: {e}"))
        }

        macro_rules! override_field {
            ($key:literal, $field:expr) => {
                if let Some(raw) = lookup($key) {
                    $field = parse($key, &raw)?;
                }
            };
        }

        override_field!("EDGEFLOW_CACHE_CAPACITY", self.cache.capacity);
        override_field!("EDGEFLOW_CACHE_DEFAULT_TTL_SECONDS", self.cache.default_ttl_seconds);
        override_field!("EDGEFLOW_COALESCER_GRACE_WINDOW_MS", self.coalescer.grace_window_ms);
        override_field!("EDGEFLOW_CHANGELIST_EXPIRY_SECONDS", self.changelist.expiry_seconds);
        override_field!("EDGEFLOW_CHANGELIST_AUTO_RECOVER", self.changelist.auto_recover);
        override_field!("EDGEFLOW_WORKFLOW_MAX_CONCURRENCY", self.workflow.max_concurrency);
        override_field!(
            "EDGEFLOW_WORKFLOW_MAX_RECOVERY_ATTEMPTS",
            self.workflow.max_recovery_attempts
        );
        override_field!("EDGEFLOW_RECOVERY_MAX_WAIT_SECONDS", self.recovery.max_wait_seconds);

        if let Some(raw) = lookup("EDGEFLOW_WORKFLOW_DEFAULT_TASK_TIMEOUT_SECONDS") {
            self.workflow.default_task_timeout_seconds =
                Some(parse("EDGEFLOW_WORKFLOW_DEFAULT_TASK_TIMEOUT_SECONDS", &raw)?);
        }

        Ok(self)
    }

    /// Sets the cache section.
    #[must_use]
    pub fn with_cache(mut self, cache: CacheConfig) -> Self {
        self.cache = cache;
        self
    }

    /// Sets the coalescer section.
    #[must_use]
    pub fn with_coalescer(mut self, coalescer: CoalescerConfig) -> Self {
        self.coalescer = coalescer;
        self
    }

    /// Sets the changelist section.
    #[must_use]
    pub fn with_changelist(mut self, changelist: ChangelistConfig) -> Self {
        self.changelist = changelist;
        self
    }

    /// Sets the workflow section.
    #[must_use]
    pub fn with_workflow(mut self, workflow: WorkflowConfig) -> Self {
        self.workflow = workflow;
        self
    }

    /// Sets the recovery section.
    #[must_use]
    pub fn with_recovery(mut self, recovery: RecoveryConfig) -> Self {
        self.recovery = recovery;
        self
    }
}

/// Smart cache configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Maximum number of entries across all tenants.
    #[serde(default = "default_capacity")]
    pub capacity: usize,
    /// TTL used when an operation does not set its own.
    #[serde(default = "default_ttl_seconds")]
    pub default_ttl_seconds: u64,
}

fn default_capacity() -> usize {
    1000
}

fn default_ttl_seconds() -> u64 {
    300
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            capacity: default_capacity(),
            default_ttl_seconds: default_ttl_seconds(),
        }
    }
}

impl CacheConfig {
    /// Sets the capacity.
    #[must_use]
    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity;
        self
    }

    /// Sets the default TTL.
    #[must_use]
    pub fn with_default_ttl(mut self, ttl: Duration) -> Self {
        self.default_ttl_seconds = ttl.as_secs();
        self
    }

    /// Default TTL as a `Duration`.
    #[must_use]
    pub fn default_ttl(&self) -> Duration {
        Duration::from_secs(self.default_ttl_seconds)
    }
}

/// Request coalescer configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoalescerConfig {
    /// How long a resolved result keeps serving new callers.
    #[serde(default = "default_grace_window_ms")]
    pub grace_window_ms: u64,
}

fn default_grace_window_ms() -> u64 {
    100
}

impl Default for CoalescerConfig {
    fn default() -> Self {
        Self {
            grace_window_ms: default_grace_window_ms(),
        }
    }
}

impl CoalescerConfig {
    /// Sets the grace window.
    #[must_use]
    pub fn with_grace_window(mut self, window: Duration) -> Self {
        self.grace_window_ms = u64::try_from(window.as_millis()).unwrap_or(u64::MAX);
        self
    }

    /// Grace window as a `Duration`.
    #[must_use]
    pub fn grace_window(&self) -> Duration {
        Duration::from_millis(self.grace_window_ms)
    }
}

/// Changelist transaction configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangelistConfig {
    /// Lifetime of a transaction from `begin`.
    #[serde(default = "default_expiry_seconds")]
    pub expiry_seconds: u64,
    /// Discard and replay automatically when a transaction expires.
    #[serde(default = "default_true")]
    pub auto_recover: bool,
}

fn default_expiry_seconds() -> u64 {
    1800
}

fn default_true() -> bool {
    true
}

impl Default for ChangelistConfig {
    fn default() -> Self {
        Self {
            expiry_seconds: default_expiry_seconds(),
            auto_recover: default_true(),
        }
    }
}

impl ChangelistConfig {
    /// Sets the expiry.
    #[must_use]
    pub fn with_expiry(mut self, expiry: Duration) -> Self {
        self.expiry_seconds = expiry.as_secs();
        self
    }

    /// Enables or disables auto-recovery.
    #[must_use]
    pub fn with_auto_recover(mut self, enabled: bool) -> Self {
        self.auto_recover = enabled;
        self
    }

    /// Expiry as a `Duration`.
    #[must_use]
    pub fn expiry(&self) -> Duration {
        Duration::from_secs(self.expiry_seconds)
    }
}

/// Workflow executor configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowConfig {
    /// Maximum tasks running at once within a workflow.
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,
    /// Timeout applied to tasks that do not declare one.
    #[serde(default)]
    pub default_task_timeout_seconds: Option<u64>,
    /// Auto-recovery rounds per triggering failure.
    #[serde(default = "default_max_recovery_attempts")]
    pub max_recovery_attempts: u32,
}

fn default_max_concurrency() -> usize {
    8
}

fn default_max_recovery_attempts() -> u32 {
    1
}

impl Default for WorkflowConfig {
    fn default() -> Self {
        Self {
            max_concurrency: default_max_concurrency(),
            default_task_timeout_seconds: None,
            max_recovery_attempts: default_max_recovery_attempts(),
        }
    }
}

impl WorkflowConfig {
    /// Sets the concurrency limit.
    #[must_use]
    pub fn with_max_concurrency(mut self, limit: usize) -> Self {
        self.max_concurrency = limit;
        self
    }

    /// Sets the default task timeout.
    #[must_use]
    pub fn with_default_task_timeout(mut self, timeout: Duration) -> Self {
        self.default_task_timeout_seconds = Some(timeout.as_secs());
        self
    }

    /// Sets the recovery bound.
    #[must_use]
    pub fn with_max_recovery_attempts(mut self, attempts: u32) -> Self {
        self.max_recovery_attempts = attempts;
        self
    }

    /// Default task timeout as a `Duration`.
    #[must_use]
    pub fn default_task_timeout(&self) -> Option<Duration> {
        self.default_task_timeout_seconds.map(Duration::from_secs)
    }
}

/// Recovery strategy configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecoveryConfig {
    /// Upper bound on any wait-and-retry delay, including server hints.
    #[serde(default = "default_max_wait_seconds")]
    pub max_wait_seconds: u64,
    /// Wait used when the error carries no retry hint.
    #[serde(default = "default_retry_base_delay_ms")]
    pub retry_base_delay_ms: u64,
}

fn default_max_wait_seconds() -> u64 {
    60
}

fn default_retry_base_delay_ms() -> u64 {
    1000
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            max_wait_seconds: default_max_wait_seconds(),
            retry_base_delay_ms: default_retry_base_delay_ms(),
        }
    }
}

impl RecoveryConfig {
    /// Sets the wait cap.
    #[must_use]
    pub fn with_max_wait(mut self, max_wait: Duration) -> Self {
        self.max_wait_seconds = max_wait.as_secs();
        self
    }

    /// Sets the base retry delay.
    #[must_use]
    pub fn with_retry_base_delay(mut self, delay: Duration) -> Self {
        self.retry_base_delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
        self
    }

    /// Wait cap as a `Duration`.
    #[must_use]
    pub fn max_wait(&self) -> Duration {
        Duration::from_secs(self.max_wait_seconds)
    }

    /// Base retry delay as a `Duration`.
    #[must_use]
    pub fn retry_base_delay(&self) -> Duration {
        Duration::from_millis(self.retry_base_delay_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = EdgeflowConfig::new();
        assert_eq!(config.cache.capacity, 1000);
        assert_eq!(config.cache.default_ttl(), Duration::from_secs(300));
        assert_eq!(config.coalescer.grace_window(), Duration::from_millis(100));
        assert_eq!(config.changelist.expiry(), Duration::from_secs(1800));
        assert!(config.changelist.auto_recover);
        assert_eq!(config.workflow.max_concurrency, 8);
        assert_eq!(config.workflow.max_recovery_attempts, 1);
        assert!(config.workflow.default_task_timeout().is_none());
        assert_eq!(config.recovery.max_wait(), Duration::from_secs(60));
    }

    #[test]
    fn test_huge_durations_saturate() {
        let coalescer = CoalescerConfig::default().with_grace_window(Duration::MAX);
        assert_eq!(coalescer.grace_window_ms, u64::MAX);

        let recovery = RecoveryConfig::default().with_retry_base_delay(Duration::MAX);
        assert_eq!(recovery.retry_base_delay_ms, u64::MAX);

        let exact = CoalescerConfig::default().with_grace_window(Duration::from_millis(250));
        assert_eq!(exact.grace_window(), Duration::from_millis(250));
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config =
            EdgeflowConfig::from_json_str(r#"{"cache": {"capacity": 10}, "workflow": {}}"#).unwrap();
        assert_eq!(config.cache.capacity, 10);
        assert_eq!(config.cache.default_ttl_seconds, 300);
        assert_eq!(config.workflow.max_concurrency, 8);
    }

    #[test]
    fn test_invalid_json() {
        assert!(EdgeflowConfig::from_json_str("{not json").is_err());
    }

    #[test]
    fn test_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"changelist": {{"expiry_seconds": 60, "auto_recover": false}}}}"#)
            .unwrap();

        let config = EdgeflowConfig::from_file(file.path()).unwrap();
        assert_eq!(config.changelist.expiry_seconds, 60);
        assert!(!config.changelist.auto_recover);

        assert!(EdgeflowConfig::from_file("/definitely/not/here.json").is_err());
    }

    #[test]
    fn test_overrides() {
        let vars: HashMap<&str, &str> = [
            ("EDGEFLOW_CACHE_CAPACITY", "5"),
            ("EDGEFLOW_CHANGELIST_AUTO_RECOVER", "false"),
            ("EDGEFLOW_WORKFLOW_DEFAULT_TASK_TIMEOUT_SECONDS", " 30 "),
        ]
        .into_iter()
        .collect();

        let config = EdgeflowConfig::new()
            .apply_overrides_from(|k| vars.get(k).map(|v| (*v).to_string()))
            .unwrap();

        assert_eq!(config.cache.capacity, 5);
        assert!(!config.changelist.auto_recover);
        assert_eq!(config.workflow.default_task_timeout(), Some(Duration::from_secs(30)));
    }

    #[test]
    fn test_override_parse_error() {
        let err = EdgeflowConfig::new()
            .apply_overrides_from(|k| (k == "EDGEFLOW_CACHE_CAPACITY").then(|| "lots".to_string()))
            .unwrap_err();
        assert!(err.to_string().contains("EDGEFLOW_CACHE_CAPACITY"));
    }
}
