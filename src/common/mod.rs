//! Common utilities and types shared across kvsentinel

pub mod config;
pub mod error;
pub mod hash;
pub mod metrics;
pub mod types;
pub mod utils;

pub use config::{
    AuthConfig, ClusterConfig, Config, HealthConfig, RetryConfig, RetryPolicy, SentinelSettings,
};
pub use error::{Error, Result};
pub use hash::MonitorId;
pub use metrics::METRICS;
pub use types::{NodeAddr, Role};
pub use utils::{parse_duration, poll_until, retry_with_backoff, timestamp_now};
