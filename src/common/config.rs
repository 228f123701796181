//! Configuration for kvsentinel components

use crate::common::{Error, Result};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Environment prefix, e.g. `KVSENTINEL__CLUSTER__SIZE=5`
pub const ENV_PREFIX: &str = "KVSENTINEL";

/// Global configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub cluster: ClusterConfig,

    #[serde(default)]
    pub sentinel: SentinelSettings,

    #[serde(default)]
    pub retry: RetryConfig,

    #[serde(default)]
    pub auth: AuthConfig,

    #[serde(default)]
    pub health: HealthConfig,

    /// Logging level
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            cluster: ClusterConfig::default(),
            sentinel: SentinelSettings::default(),
            retry: RetryConfig::default(),
            auth: AuthConfig::default(),
            health: HealthConfig::default(),
            log_level: default_log_level(),
        }
    }
}

impl Config {
    /// Load configuration from an optional TOML file, then environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(false));
        }
        let config: Config = builder
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__"),
            )
            .build()?
            .try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.cluster.name.is_empty() {
            return Err(Error::InvalidConfig("cluster.name cannot be empty".into()));
        }
        if self.cluster.headless_service.is_empty() {
            return Err(Error::InvalidConfig(
                "cluster.headless_service cannot be empty".into(),
            ));
        }
        if self.cluster.size == 0 {
            return Err(Error::InvalidConfig("cluster.size must be at least 1".into()));
        }
        if self.sentinel.quorum == 0 || self.sentinel.quorum > self.cluster.size {
            return Err(Error::InvalidConfig(format!(
                "sentinel.quorum must be between 1 and cluster.size ({}), got {}",
                self.cluster.size, self.sentinel.quorum
            )));
        }
        if self.sentinel.down_after_ms == 0 || self.sentinel.failover_timeout_ms == 0 {
            return Err(Error::InvalidConfig(
                "sentinel timeouts must be non-zero".into(),
            ));
        }
        if self.sentinel.parallel_syncs == 0 {
            return Err(Error::InvalidConfig(
                "sentinel.parallel_syncs must be at least 1".into(),
            ));
        }
        if self.retry.dns_attempts == 0 || self.retry.master_attempts == 0 {
            return Err(Error::InvalidConfig("retry budgets must be non-zero".into()));
        }
        Ok(())
    }
}

/// Cluster topology and naming
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterConfig {
    /// Logical name of the monitored master
    #[serde(default = "default_cluster_name")]
    pub name: String,

    /// Member hostnames are `{node_prefix}-{ordinal}`
    #[serde(default = "default_node_prefix")]
    pub node_prefix: String,

    /// Headless service that publishes every member address
    #[serde(default = "default_headless_service")]
    pub headless_service: String,

    /// Load-balanced service in front of the monitor agents
    #[serde(default = "default_service")]
    pub service: String,

    /// Number of members (ordinals `0..size`)
    #[serde(default = "default_size")]
    pub size: usize,

    #[serde(default = "default_data_port")]
    pub data_port: u16,

    #[serde(default = "default_sentinel_port")]
    pub sentinel_port: u16,

    /// Overrides the `HOSTNAME` environment variable
    #[serde(default)]
    pub hostname: Option<String>,

    /// Directory with role-specific data server config files
    #[serde(default = "default_conf_dir")]
    pub conf_dir: PathBuf,

    /// Where the rendered monitor configuration is persisted
    #[serde(default = "default_sentinel_conf")]
    pub sentinel_conf: PathBuf,
}

fn default_cluster_name() -> String {
    "mymaster".to_string()
}
fn default_node_prefix() -> String {
    "redis-node".to_string()
}
fn default_headless_service() -> String {
    "redis-headless.default.svc.cluster.local".to_string()
}
fn default_service() -> String {
    "redis.default.svc.cluster.local".to_string()
}
fn default_size() -> usize {
    3
}
fn default_data_port() -> u16 {
    6379
}
fn default_sentinel_port() -> u16 {
    26379
}
fn default_conf_dir() -> PathBuf {
    PathBuf::from("/opt/bitnami/redis/etc")
}
fn default_sentinel_conf() -> PathBuf {
    PathBuf::from("/opt/bitnami/redis-sentinel/etc/sentinel.conf")
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            name: default_cluster_name(),
            node_prefix: default_node_prefix(),
            headless_service: default_headless_service(),
            service: default_service(),
            size: default_size(),
            data_port: default_data_port(),
            sentinel_port: default_sentinel_port(),
            hostname: None,
            conf_dir: default_conf_dir(),
            sentinel_conf: default_sentinel_conf(),
        }
    }
}

impl ClusterConfig {
    /// Short hostname of the member at `ordinal`
    pub fn member_hostname(&self, ordinal: usize) -> String {
        format!("{}-{}", self.node_prefix, ordinal)
    }

    /// Fully qualified name under the headless service
    pub fn full_hostname(&self, hostname: &str) -> String {
        format!("{}.{}", hostname, self.headless_service)
    }

    /// This member's short hostname
    pub fn self_hostname(&self) -> Result<String> {
        if let Some(hostname) = &self.hostname {
            return Ok(hostname.clone());
        }
        std::env::var("HOSTNAME")
            .map_err(|_| Error::InvalidConfig("HOSTNAME is not set".into()))
    }
}

/// Monitor-level settings persisted by every agent
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SentinelSettings {
    /// Agents that must agree before the master is objectively down
    #[serde(default = "default_quorum")]
    pub quorum: usize,

    #[serde(default = "default_down_after")]
    pub down_after_ms: u64,

    #[serde(default = "default_failover_timeout")]
    pub failover_timeout_ms: u64,

    /// Replicas resynced concurrently after a promotion
    #[serde(default = "default_parallel_syncs")]
    pub parallel_syncs: usize,

    /// Supervision tick of the built-in agent
    #[serde(default = "default_tick")]
    pub tick_ms: u64,

    /// Discovery reconciliation interval of the built-in agent
    #[serde(default = "default_reconcile")]
    pub reconcile_interval_ms: u64,
}

fn default_quorum() -> usize {
    2
}
fn default_down_after() -> u64 {
    60_000
}
fn default_failover_timeout() -> u64 {
    18_000
}
fn default_parallel_syncs() -> usize {
    1
}
fn default_tick() -> u64 {
    1_000
}
fn default_reconcile() -> u64 {
    10_000
}

impl Default for SentinelSettings {
    fn default() -> Self {
        Self {
            quorum: default_quorum(),
            down_after_ms: default_down_after(),
            failover_timeout_ms: default_failover_timeout(),
            parallel_syncs: default_parallel_syncs(),
            tick_ms: default_tick(),
            reconcile_interval_ms: default_reconcile(),
        }
    }
}

impl SentinelSettings {
    pub fn down_after(&self) -> Duration {
        Duration::from_millis(self.down_after_ms)
    }

    pub fn failover_timeout(&self) -> Duration {
        Duration::from_millis(self.failover_timeout_ms)
    }

    pub fn tick(&self) -> Duration {
        Duration::from_millis(self.tick_ms)
    }

    pub fn reconcile_interval(&self) -> Duration {
        Duration::from_millis(self.reconcile_interval_ms)
    }
}

/// Retry budgets for the blocking startup and shutdown waits
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_dns_attempts")]
    pub dns_attempts: usize,

    #[serde(default = "default_dns_delay")]
    pub dns_delay_ms: u64,

    #[serde(default = "default_master_attempts")]
    pub master_attempts: usize,

    #[serde(default = "default_master_delay")]
    pub master_delay_ms: u64,

    /// Upper bound for exponential backoff
    #[serde(default = "default_max_delay")]
    pub max_delay_ms: u64,

    /// Graceful handover budget for pre-stop hooks
    #[serde(default = "default_prestop_timeout")]
    pub prestop_timeout_secs: u64,

    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,

    /// Per-command network timeout
    #[serde(default = "default_command_timeout")]
    pub command_timeout_ms: u64,
}

fn default_dns_attempts() -> usize {
    12
}
fn default_dns_delay() -> u64 {
    1_000
}
fn default_master_attempts() -> usize {
    12
}
fn default_master_delay() -> u64 {
    1_000
}
fn default_max_delay() -> u64 {
    5_000
}
fn default_prestop_timeout() -> u64 {
    20
}
fn default_poll_interval() -> u64 {
    1_000
}
fn default_command_timeout() -> u64 {
    3_000
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            dns_attempts: default_dns_attempts(),
            dns_delay_ms: default_dns_delay(),
            master_attempts: default_master_attempts(),
            master_delay_ms: default_master_delay(),
            max_delay_ms: default_max_delay(),
            prestop_timeout_secs: default_prestop_timeout(),
            poll_interval_ms: default_poll_interval(),
            command_timeout_ms: default_command_timeout(),
        }
    }
}

impl RetryConfig {
    pub fn dns_policy(&self) -> RetryPolicy {
        RetryPolicy {
            attempts: self.dns_attempts,
            initial_delay: Duration::from_millis(self.dns_delay_ms),
            max_delay: Duration::from_millis(self.max_delay_ms),
        }
    }

    pub fn master_policy(&self) -> RetryPolicy {
        RetryPolicy {
            attempts: self.master_attempts,
            initial_delay: Duration::from_millis(self.master_delay_ms),
            max_delay: Duration::from_millis(self.max_delay_ms),
        }
    }

    pub fn prestop_timeout(&self) -> Duration {
        Duration::from_secs(self.prestop_timeout_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.command_timeout_ms)
    }
}

/// Bounded exponential backoff
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub attempts: usize,
    pub initial_delay: Duration,
    pub max_delay: Duration,
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (0-based), capped at `max_delay`
    pub fn delay_for(&self, attempt: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt.min(16) as u32).unwrap_or(u32::MAX);
        self.initial_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }
}

/// Credentials for monitor and data-plane commands
#[derive(Clone, Default, Serialize, Deserialize)]
pub struct AuthConfig {
    #[serde(default)]
    pub password: Option<String>,

    /// Read instead of `password` when present
    #[serde(default)]
    pub password_file: Option<PathBuf>,
}

impl std::fmt::Debug for AuthConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthConfig")
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("password_file", &self.password_file)
            .finish()
    }
}

impl AuthConfig {
    /// Resolve the effective password, preferring the file.
    pub fn resolve(&self) -> Result<Option<String>> {
        if let Some(path) = &self.password_file {
            if path.exists() {
                let contents = std::fs::read_to_string(path)?;
                return Ok(Some(contents.trim_end_matches(['\n', '\r']).to_string()));
            }
        }
        Ok(self.password.clone().filter(|p| !p.is_empty()))
    }
}

/// Health endpoint and probe settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthConfig {
    #[serde(default = "default_health_bind")]
    pub bind_addr: SocketAddr,

    #[serde(default = "default_probe_timeout")]
    pub probe_timeout_secs: u64,
}

fn default_health_bind() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 9121))
}
fn default_probe_timeout() -> u64 {
    3
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            bind_addr: default_health_bind(),
            probe_timeout_secs: default_probe_timeout(),
        }
    }
}

impl HealthConfig {
    pub fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.probe_timeout_secs)
    }
}
