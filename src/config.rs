//! Configuration frozen onto requests at acceptance time.
//!
//! A [`FetchConfig`] travels with every request as an `Arc`, so changing
//! the client defaults never affects requests already in flight or in
//! queue. Per-server scheduling knobs live in [`ServerPolicy`] and are
//! consulted once, when the server record is created.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use http::HeaderMap;
use serde::{Deserialize, Serialize};
use url::Url;

/// Default number of redirects before a fetch is failed
pub const DEFAULT_MAX_REDIRECTS: u32 = 5;
/// Default ceiling for the caller-visible retry counter
pub const DEFAULT_MAX_RETRIES: u32 = 3;
/// Default per-exchange response deadline in seconds
pub const DEFAULT_RESPONSE_TIMEOUT_SECS: u64 = 20;
/// Default ceiling on decoded response body size in bytes
pub const DEFAULT_MAX_BODY_SIZE: u64 = 10 * 1024 * 1024;
/// Default user agent
pub const DEFAULT_USER_AGENT: &str = concat!("trawl/", env!("CARGO_PKG_VERSION"));

/// Per-fetch configuration.
///
/// One immutable snapshot of these values is attached to each request
/// when it is accepted and rides along through every redirect hop.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FetchConfig {
    /// Whole-fetch deadline, measured from acceptance. Fires even while
    /// the request is still waiting in queue. `None` disables it.
    #[serde(default, with = "humantime_serde")]
    pub timeout: Option<Duration>,
    /// Deadline for each network exchange, measured from dispatch
    #[serde(with = "humantime_serde")]
    pub response_timeout: Duration,
    /// Redirect hops to follow before failing with
    /// [`TooManyRedirects`](crate::ErrorKind::TooManyRedirects)
    pub max_redirects: u32,
    /// Ceiling for the caller-visible retry counter
    pub max_retries: u32,
    /// Ceiling on the decoded response body, in bytes
    pub max_body_size: u64,
    /// Transparently decode `gzip` and `deflate` response bodies
    pub decompress: bool,
    /// `User-Agent` header value
    pub user_agent: String,
    /// Forward proxy to route this fetch through. HTTPS targets are
    /// tunneled with `CONNECT`.
    pub proxy: Option<Url>,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            timeout: None,
            response_timeout: Duration::from_secs(DEFAULT_RESPONSE_TIMEOUT_SECS),
            max_redirects: DEFAULT_MAX_REDIRECTS,
            max_retries: DEFAULT_MAX_RETRIES,
            max_body_size: DEFAULT_MAX_BODY_SIZE,
            decompress: true,
            user_agent: DEFAULT_USER_AGENT.to_string(),
            proxy: None,
        }
    }
}

/// How many connections a server record may run at once.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum ConcurrencyMode {
    /// One connection for the whole server, ever
    Serial,
    /// One connection per resolved address
    #[default]
    PerAddress,
    /// As many connections as the global budget allows
    Unlimited,
}

/// Scheduling policy for one server record.
///
/// Consulted once when the server record is created; later changes only
/// affect servers created afterwards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerPolicy {
    /// Connection concurrency mode
    pub concurrency: ConcurrencyMode,
    /// Failure fraction in the rolling window above which the server is
    /// disabled, in `0.0..=1.0`
    pub max_error_rate: f64,
    /// Number of most recent exchanges the rolling window remembers
    pub error_window: usize,
}

impl Default for ServerPolicy {
    fn default() -> Self {
        Self {
            concurrency: ConcurrencyMode::default(),
            max_error_rate: 0.5,
            error_window: 10,
        }
    }
}

/// Everything the engine thread needs to know, assembled by
/// [`ClientBuilder`](crate::ClientBuilder) and handed over at spawn.
#[derive(Debug, Clone)]
pub(crate) struct EngineConfig {
    /// Global ceiling on simultaneously active connections
    pub max_connections: usize,
    /// Global download throttle in bytes per second, `None` for unlimited
    pub rx_speed_max: Option<u64>,
    /// Capacity of the request and result queues
    pub queue_capacity: usize,
    /// Politeness interval applied to every host without an override
    pub host_interval: Duration,
    /// Per-host politeness overrides, keyed by lowercase host name
    pub host_intervals: HashMap<String, Duration>,
    /// Policy applied to every server without an override
    pub server_policy: ServerPolicy,
    /// Per-server policy overrides, keyed by the host name that first
    /// resolves to the server
    pub server_policies: HashMap<String, ServerPolicy>,
    /// Idle host records kept around for politeness continuity
    pub host_cache_limit: usize,
    /// Idle server records kept around for connection reuse
    pub server_cache_limit: usize,
    /// Age at which a cached DNS answer is refreshed
    pub dns_refresh: Duration,
    /// Back-off before a failed DNS lookup is attempted again
    pub dns_retry: Duration,
    /// Local address to bind outgoing sockets to
    pub local_addr: Option<IpAddr>,
    /// Skip server certificate verification
    pub accept_invalid_certs: bool,
    /// Headers merged under every request's own headers
    pub custom_headers: HeaderMap,
    /// Default per-fetch configuration
    pub defaults: Arc<FetchConfig>,
}

impl EngineConfig {
    /// Politeness interval for `host`, with overrides applied.
    pub(crate) fn interval_for(&self, host: &str) -> Duration {
        self.host_intervals
            .get(host)
            .copied()
            .unwrap_or(self.host_interval)
    }

    /// Server policy for a server first reached through `host`.
    pub(crate) fn policy_for(&self, host: &str) -> ServerPolicy {
        self.server_policies
            .get(host)
            .cloned()
            .unwrap_or_else(|| self.server_policy.clone())
    }
}
