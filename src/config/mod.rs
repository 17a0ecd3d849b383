use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::Duration;

use serde::Deserialize;

use crate::services::gateway::GatewayTimeouts;
use crate::services::queue::{BackoffPolicy, BackoffType, QueueSettings};
use crate::services::scheduler::SchedulerSettings;
use crate::services::worker::WorkerSettings;

#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum QueueBackendKind {
    Redis,
    Memory,
}

#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Json,
    Pretty,
}

/// Flat environment configuration, read once at process start.
#[derive(Debug, Deserialize)]
pub struct AppConfig {
    /// Server bind address (e.g., "0.0.0.0:3000"). Ignored by the worker binary.
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,

    /// Prometheus scrape address of the headless worker binary.
    #[serde(default = "default_worker_metrics_addr")]
    pub worker_metrics_addr: String,

    #[serde(default = "default_log_format")]
    pub log_format: LogFormat,

    #[serde(default = "default_queue_backend")]
    pub queue_backend: QueueBackendKind,

    #[serde(default = "default_queue_name")]
    pub queue_name: String,

    #[serde(default = "default_redis_host")]
    pub redis_host: String,

    #[serde(default = "default_redis_port")]
    pub redis_port: u16,

    pub redis_username: Option<String>,

    pub redis_password: Option<String>,

    /// Attempt limit per submit job
    #[serde(default = "default_submit_job_attempts")]
    pub submit_job_attempts: u32,

    #[serde(default = "default_backoff_type")]
    pub submit_job_backoff_type: BackoffType,

    #[serde(default = "default_backoff_delay_ms")]
    pub submit_job_backoff_delay_ms: u64,

    #[serde(default = "default_worker_concurrency")]
    pub worker_concurrency: usize,

    #[serde(default = "default_poll_interval_ms")]
    pub worker_poll_interval_ms: u64,

    #[serde(default = "default_drain_timeout_ms")]
    pub worker_drain_timeout_ms: u64,

    #[serde(default = "default_retention")]
    pub max_completed_jobs: usize,

    #[serde(default = "default_retention")]
    pub max_failed_jobs: usize,

    /// Promotes delayed jobs and recovers stalled ones. Without a scheduler
    /// somewhere on the queue, retries never run.
    #[serde(default = "default_true")]
    pub scheduler_enabled: bool,

    #[serde(default = "default_poll_interval_ms")]
    pub scheduler_poll_interval_ms: u64,

    #[serde(default = "default_stall_timeout_ms")]
    pub stall_timeout_ms: u64,

    #[serde(default = "default_max_stalled_count")]
    pub max_stalled_count: u32,

    /// `tenant=url` pairs separated by `;`
    pub ledger_gateways: String,

    /// `key=tenant` pairs separated by `;`
    pub api_keys: String,

    #[serde(default = "default_ledger_channel")]
    pub ledger_channel: String,

    #[serde(default = "default_ledger_contract")]
    pub ledger_contract: String,

    /// Whether the ledger rejects a second application of an invocation id.
    #[serde(default = "default_true")]
    pub ledger_exactly_once: bool,

    #[serde(default = "default_evaluate_timeout_ms")]
    pub ledger_evaluate_timeout_ms: u64,

    #[serde(default = "default_endorse_timeout_ms")]
    pub ledger_endorse_timeout_ms: u64,

    #[serde(default = "default_submit_timeout_ms")]
    pub ledger_submit_timeout_ms: u64,

    #[serde(default = "default_commit_timeout_ms")]
    pub ledger_commit_timeout_ms: u64,
}

fn default_bind_addr() -> String {
    "0.0.0.0:3000".to_string()
}

fn default_worker_metrics_addr() -> String {
    "0.0.0.0:9100".to_string()
}

fn default_log_format() -> LogFormat {
    LogFormat::Json
}

fn default_queue_backend() -> QueueBackendKind {
    QueueBackendKind::Redis
}

fn default_queue_name() -> String {
    "submit".to_string()
}

fn default_redis_host() -> String {
    "localhost".to_string()
}

fn default_redis_port() -> u16 {
    6379
}

fn default_submit_job_attempts() -> u32 {
    5
}

fn default_backoff_type() -> BackoffType {
    BackoffType::Fixed
}

fn default_backoff_delay_ms() -> u64 {
    3000
}

fn default_worker_concurrency() -> usize {
    5
}

fn default_poll_interval_ms() -> u64 {
    1000
}

fn default_drain_timeout_ms() -> u64 {
    30_000
}

fn default_retention() -> usize {
    1000
}

fn default_true() -> bool {
    true
}

fn default_stall_timeout_ms() -> u64 {
    30_000
}

fn default_max_stalled_count() -> u32 {
    1
}

fn default_ledger_channel() -> String {
    "mychannel".to_string()
}

fn default_ledger_contract() -> String {
    "basic".to_string()
}

fn default_evaluate_timeout_ms() -> u64 {
    5_000
}

fn default_endorse_timeout_ms() -> u64 {
    15_000
}

fn default_submit_timeout_ms() -> u64 {
    5_000
}

fn default_commit_timeout_ms() -> u64 {
    300_000
}

/// Checked settings derived from [`AppConfig`].
#[derive(Debug, Clone)]
pub struct Settings {
    pub bind_addr: String,
    pub worker_metrics_addr: SocketAddr,
    pub log_format: LogFormat,
    pub queue_backend: QueueBackendKind,
    pub redis_url: String,
    pub queue: QueueSettings,
    pub worker: WorkerSettings,
    pub scheduler: SchedulerSettings,
    pub ledger: LedgerSettings,
    /// API key to tenant id.
    pub api_keys: HashMap<String, String>,
}

#[derive(Debug, Clone)]
pub struct LedgerSettings {
    /// Tenant id to gateway base URL.
    pub gateways: HashMap<String, String>,
    pub channel: String,
    pub contract: String,
    pub exactly_once: bool,
    pub timeouts: GatewayTimeouts,
}

impl AppConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();
        Ok(envy::from_env()?)
    }

    pub fn validate(self) -> Result<Settings, ConfigError> {
        if self.submit_job_attempts == 0 {
            return Err(ConfigError::invalid("SUBMIT_JOB_ATTEMPTS", "must be at least 1"));
        }
        if self.worker_concurrency == 0 {
            return Err(ConfigError::invalid("WORKER_CONCURRENCY", "must be at least 1"));
        }
        if self.stall_timeout_ms < 2 {
            return Err(ConfigError::invalid("STALL_TIMEOUT_MS", "must be at least 2"));
        }
        if self.queue_name.trim().is_empty() {
            return Err(ConfigError::invalid("QUEUE_NAME", "must not be empty"));
        }

        let gateways = parse_pairs("LEDGER_GATEWAYS", &self.ledger_gateways)?;
        if gateways.is_empty() {
            return Err(ConfigError::invalid("LEDGER_GATEWAYS", "at least one tenant is required"));
        }
        let api_keys = parse_pairs("API_KEYS", &self.api_keys)?;
        for tenant in api_keys.values() {
            if !gateways.contains_key(tenant) {
                return Err(ConfigError::invalid(
                    "API_KEYS",
                    format!("tenant {} has no ledger gateway", tenant),
                ));
            }
        }

        let worker_metrics_addr = self.worker_metrics_addr.parse().map_err(|_| {
            ConfigError::invalid("WORKER_METRICS_ADDR", "must be a socket address")
        })?;

        let redis_url = redis_url(
            &self.redis_host,
            self.redis_port,
            self.redis_username.as_deref(),
            self.redis_password.as_deref(),
        );

        Ok(Settings {
            bind_addr: self.bind_addr,
            worker_metrics_addr,
            log_format: self.log_format,
            queue_backend: self.queue_backend,
            redis_url,
            queue: QueueSettings {
                name: self.queue_name,
                max_attempts: self.submit_job_attempts,
                backoff: BackoffPolicy {
                    kind: self.submit_job_backoff_type,
                    delay: Duration::from_millis(self.submit_job_backoff_delay_ms),
                },
                max_completed: self.max_completed_jobs,
                max_failed: self.max_failed_jobs,
                stall_timeout: Duration::from_millis(self.stall_timeout_ms),
                max_stalled_count: self.max_stalled_count,
            },
            worker: WorkerSettings {
                concurrency: self.worker_concurrency,
                poll_interval: Duration::from_millis(self.worker_poll_interval_ms),
                drain_timeout: Duration::from_millis(self.worker_drain_timeout_ms),
            },
            scheduler: SchedulerSettings {
                enabled: self.scheduler_enabled,
                poll_interval: Duration::from_millis(self.scheduler_poll_interval_ms),
            },
            ledger: LedgerSettings {
                gateways,
                channel: self.ledger_channel,
                contract: self.ledger_contract,
                exactly_once: self.ledger_exactly_once,
                timeouts: GatewayTimeouts {
                    evaluate: Duration::from_millis(self.ledger_evaluate_timeout_ms),
                    endorse: Duration::from_millis(self.ledger_endorse_timeout_ms),
                    submit: Duration::from_millis(self.ledger_submit_timeout_ms),
                    commit_status: Duration::from_millis(self.ledger_commit_timeout_ms),
                },
            },
            api_keys,
        })
    }
}

fn redis_url(host: &str, port: u16, username: Option<&str>, password: Option<&str>) -> String {
    match (username, password) {
        (Some(user), Some(pass)) => format!("redis://{}:{}@{}:{}/", user, pass, host, port),
        (None, Some(pass)) => format!("redis://:{}@{}:{}/", pass, host, port),
        _ => format!("redis://{}:{}/", host, port),
    }
}

/// Parse `a=b;c=d` into a map. Blank segments are ignored.
fn parse_pairs(key: &'static str, raw: &str) -> Result<HashMap<String, String>, ConfigError> {
    let mut pairs = HashMap::new();
    for segment in raw.split(';').map(str::trim).filter(|s| !s.is_empty()) {
        let (left, right) = segment
            .split_once('=')
            .map(|(l, r)| (l.trim(), r.trim()))
            .filter(|(l, r)| !l.is_empty() && !r.is_empty())
            .ok_or_else(|| ConfigError::invalid(key, format!("malformed entry '{}'", segment)))?;
        if pairs.insert(left.to_string(), right.to_string()).is_some() {
            return Err(ConfigError::invalid(key, format!("duplicate entry '{}'", left)));
        }
    }
    Ok(pairs)
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read configuration from environment: {0}")]
    Env(#[from] envy::Error),

    #[error("Invalid configuration value for {key}: {message}")]
    Invalid { key: &'static str, message: String },
}

impl ConfigError {
    fn invalid(key: &'static str, message: impl Into<String>) -> Self {
        ConfigError::Invalid {
            key,
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::queue::BackoffType;

    fn vars(extra: &[(&str, &str)]) -> Vec<(String, String)> {
        let mut v = vec![
            ("LEDGER_GATEWAYS".to_string(), "Org1MSP=http://gw1:8080; Org2MSP=http://gw2:8080".to_string()),
            ("API_KEYS".to_string(), "k1=Org1MSP;k2=Org2MSP".to_string()),
        ];
        v.retain(|(k, _)| !extra.iter().any(|(ek, _)| ek == k));
        v.extend(extra.iter().map(|(k, val)| (k.to_string(), val.to_string())));
        v
    }

    fn load(extra: &[(&str, &str)]) -> Result<Settings, ConfigError> {
        envy::from_iter::<_, AppConfig>(vars(extra))?.validate()
    }

    #[test]
    fn test_defaults() {
        let settings = load(&[]).unwrap();
        assert_eq!(settings.queue.max_attempts, 5);
        assert_eq!(settings.queue.backoff.kind, BackoffType::Fixed);
        assert_eq!(settings.queue.backoff.delay, Duration::from_millis(3000));
        assert_eq!(settings.queue.max_completed, 1000);
        assert_eq!(settings.queue.max_failed, 1000);
        assert_eq!(settings.worker.concurrency, 5);
        assert!(settings.scheduler.enabled);
        assert_eq!(settings.queue_backend, QueueBackendKind::Redis);
        assert_eq!(settings.redis_url, "redis://localhost:6379/");
        assert_eq!(settings.api_keys.get("k2").map(String::as_str), Some("Org2MSP"));
        assert_eq!(
            settings.ledger.gateways.get("Org1MSP").map(String::as_str),
            Some("http://gw1:8080")
        );
    }

    #[test]
    fn test_overrides() {
        let settings = load(&[
            ("SUBMIT_JOB_BACKOFF_TYPE", "exponential"),
            ("SUBMIT_JOB_ATTEMPTS", "3"),
            ("SCHEDULER_ENABLED", "false"),
            ("QUEUE_BACKEND", "memory"),
            ("REDIS_PASSWORD", "s3cret"),
        ])
        .unwrap();
        assert_eq!(settings.queue.backoff.kind, BackoffType::Exponential);
        assert_eq!(settings.queue.max_attempts, 3);
        assert!(!settings.scheduler.enabled);
        assert_eq!(settings.queue_backend, QueueBackendKind::Memory);
        assert_eq!(settings.redis_url, "redis://:s3cret@localhost:6379/");
    }

    #[test]
    fn test_rejects_zero_attempts_and_concurrency() {
        assert!(matches!(
            load(&[("SUBMIT_JOB_ATTEMPTS", "0")]),
            Err(ConfigError::Invalid { key: "SUBMIT_JOB_ATTEMPTS", .. })
        ));
        assert!(matches!(
            load(&[("WORKER_CONCURRENCY", "0")]),
            Err(ConfigError::Invalid { key: "WORKER_CONCURRENCY", .. })
        ));
    }

    #[test]
    fn test_rejects_api_key_for_unknown_tenant() {
        let err = load(&[("API_KEYS", "k3=Org3MSP")]).unwrap_err();
        assert!(err.to_string().contains("Org3MSP"));
    }

    #[test]
    fn test_rejects_malformed_pairs() {
        assert!(load(&[("LEDGER_GATEWAYS", "Org1MSP")]).is_err());
        assert!(load(&[("LEDGER_GATEWAYS", "")]).is_err());
        assert!(parse_pairs("X", "a=1;a=2").is_err());
    }

    #[test]
    fn test_missing_required_variable() {
        let result = envy::from_iter::<_, AppConfig>(Vec::<(String, String)>::new());
        assert!(result.is_err());
    }
}
