//! The public face of the engine.
//!
//! This module defines two structs, [`Client`] and [`ClientBuilder`].
//! `Client` owns a running engine thread: requests go in through
//! [`Client::put_request`], results come back through
//! [`Client::result`] in completion order.
//! `ClientBuilder` exposes a finer level of granularity for building
//! a `Client`.
//!
//! For convenience, a free function [`fetch`] is provided for ad-hoc
//! fetches.

use std::collections::HashMap;
use std::fmt;
use std::net::IpAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam_channel::{Receiver, Sender, TrySendError, bounded};
use http::{HeaderMap, HeaderValue};
use log::warn;
use typed_builder::TypedBuilder;
use url::Url;

use crate::channel::HostKey;
use crate::config::{
    DEFAULT_MAX_BODY_SIZE, DEFAULT_MAX_REDIRECTS, DEFAULT_MAX_RETRIES,
    DEFAULT_RESPONSE_TIMEOUT_SECS, DEFAULT_USER_AGENT, EngineConfig, FetchConfig, ServerPolicy,
};
use crate::dns::{GaiResolver, Resolve};
use crate::engine::{Deliver, Engine};
use crate::types::{ErrorKind, FetchRequest, FetchResult, RequestId, Result};

/// Default ceiling on simultaneously open connections, 64.
pub const DEFAULT_MAX_CONNECTIONS: usize = 64;
/// Default politeness interval between fetches to one host, 1 second.
pub const DEFAULT_HOST_INTERVAL: Duration = Duration::from_secs(1);
/// Default capacity of the request and result queues, 1024.
pub const DEFAULT_QUEUE_CAPACITY: usize = 1024;
/// Default number of idle host records kept around, 1024.
pub const DEFAULT_HOST_CACHE_LIMIT: usize = 1024;
/// Default number of idle server records kept around, 256.
pub const DEFAULT_SERVER_CACHE_LIMIT: usize = 256;
/// Default age at which a cached DNS answer is re-resolved, 5 minutes.
pub const DEFAULT_DNS_REFRESH: Duration = Duration::from_secs(300);
/// Default back-off before a failed DNS lookup is retried, 30 seconds.
pub const DEFAULT_DNS_RETRY: Duration = Duration::from_secs(30);

/// Caller-supplied sink for finished fetches.
///
/// The callback runs on the engine thread, so it must not block; hand
/// the result off and return.
#[derive(Clone)]
pub struct ResultCallback(Arc<dyn Fn(FetchResult) + Send + Sync>);

impl ResultCallback {
    /// Wrap a closure for use with [`ClientBuilder::result_callback`].
    pub fn new(callback: impl Fn(FetchResult) + Send + Sync + 'static) -> Self {
        Self(Arc::new(callback))
    }

    pub(crate) fn call(&self, result: FetchResult) {
        (self.0)(result);
    }
}

impl fmt::Debug for ResultCallback {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ResultCallback")
    }
}

/// Running counters for one client, updated by the engine thread.
#[derive(Debug, Default)]
pub struct ClientStats {
    accepted: AtomicU64,
    succeeded: AtomicU64,
    failed: AtomicU64,
    pending: AtomicU64,
}

impl ClientStats {
    /// Requests accepted by `put_request` so far.
    #[must_use]
    pub fn accepted(&self) -> u64 {
        self.accepted.load(Ordering::Relaxed)
    }

    /// Fetches that completed with a 2xx response.
    #[must_use]
    pub fn succeeded(&self) -> u64 {
        self.succeeded.load(Ordering::Relaxed)
    }

    /// Fetches that completed any other way.
    #[must_use]
    pub fn failed(&self) -> u64 {
        self.failed.load(Ordering::Relaxed)
    }

    /// Accepted requests whose result has not been emitted yet.
    #[must_use]
    pub fn pending(&self) -> u64 {
        self.pending.load(Ordering::Relaxed)
    }

    pub(crate) fn record_accepted(&self) {
        self.accepted.fetch_add(1, Ordering::Relaxed);
        self.pending.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_result(&self, result: &FetchResult) {
        if result.is_success() {
            self.succeeded.fetch_add(1, Ordering::Relaxed);
        } else {
            self.failed.fetch_add(1, Ordering::Relaxed);
        }
        self.pending.fetch_sub(1, Ordering::Relaxed);
    }
}

/// Builder for [`Client`].
///
/// See crate-level documentation for usage example.
#[derive(TypedBuilder, Debug, Clone)]
#[builder(field_defaults(default, setter(into)))]
#[builder(builder_method(doc = "
Create a builder for building `ClientBuilder`.

On the builder call, call methods with same name as its fields to set their values.

Finally, call `.build()` to create the instance of `ClientBuilder`.
"))]
pub struct ClientBuilder {
    /// Ceiling on simultaneously open connections across all servers.
    #[builder(default = DEFAULT_MAX_CONNECTIONS)]
    max_connections: usize,
    /// Minimum spacing between two fetches to the same host.
    ///
    /// This is the politeness clock: no matter how many requests pile
    /// up for one host, dispatches to it stay at least this far apart.
    #[builder(default = DEFAULT_HOST_INTERVAL)]
    host_interval: Duration,
    /// Per-host politeness overrides, keyed by host name.
    host_intervals: HashMap<String, Duration>,
    /// Scheduling policy applied to every server without an override.
    server_policy: ServerPolicy,
    /// Per-server policy overrides, keyed by the host name the server
    /// was first reached through.
    server_policies: HashMap<String, ServerPolicy>,
    /// Capacity of the bounded request and result queues.
    #[builder(default = DEFAULT_QUEUE_CAPACITY)]
    queue_capacity: usize,
    /// Download throttle over all connections, in bytes per second.
    /// `None` disables throttling.
    rx_speed_max: Option<u64>,
    /// Idle host records kept cached so politeness clocks survive
    /// bursts of traffic to the same hosts.
    #[builder(default = DEFAULT_HOST_CACHE_LIMIT)]
    host_cache_limit: usize,
    /// Idle server records kept cached for connection reuse.
    #[builder(default = DEFAULT_SERVER_CACHE_LIMIT)]
    server_cache_limit: usize,
    /// Age at which a cached DNS answer is re-resolved in the
    /// background.
    #[builder(default = DEFAULT_DNS_REFRESH)]
    dns_refresh: Duration,
    /// How long a failed DNS lookup poisons its host before another
    /// attempt is made.
    #[builder(default = DEFAULT_DNS_RETRY)]
    dns_retry: Duration,
    /// Local address to bind outgoing sockets to.
    local_addr: Option<IpAddr>,
    /// When `true`, accept invalid TLS certificates.
    ///
    /// ## Warning
    ///
    /// You should think very carefully before using this. If invalid
    /// certificates are trusted, any certificate for any site will be
    /// trusted for use, expired ones included.
    accept_invalid_certs: bool,
    /// Headers set on every request, underneath the request's own.
    custom_headers: HeaderMap,
    /// Whole-fetch deadline, measured from acceptance. Fires even while
    /// a request is still waiting in queue. `None` disables it.
    timeout: Option<Duration>,
    /// Deadline for each network exchange, measured from dispatch.
    #[builder(default = Duration::from_secs(DEFAULT_RESPONSE_TIMEOUT_SECS))]
    response_timeout: Duration,
    /// Maximum number of redirects per fetch before returning an error.
    #[builder(default = DEFAULT_MAX_REDIRECTS)]
    max_redirects: u32,
    /// Ceiling for the caller-visible retry counter.
    #[builder(default = DEFAULT_MAX_RETRIES)]
    max_retries: u32,
    /// Ceiling on response body size, in bytes.
    #[builder(default = DEFAULT_MAX_BODY_SIZE)]
    max_body_size: u64,
    /// Transparently decode `gzip` and `deflate` response bodies.
    #[builder(default = true)]
    decompress: bool,
    /// User agent sent with every request.
    #[builder(default_code = "String::from(DEFAULT_USER_AGENT)")]
    user_agent: String,
    /// Forward proxy to route every fetch through. HTTPS targets are
    /// tunneled with `CONNECT`.
    proxy: Option<Url>,
    /// Deliver results to this callback, on the engine thread, instead
    /// of the result queue. [`Client::result`] then always returns
    /// `None`.
    result_callback: Option<ResultCallback>,
    /// Name resolution override; `None` uses the system resolver.
    resolver: Option<Arc<dyn Resolve>>,
}

impl Default for ClientBuilder {
    #[must_use]
    #[inline]
    fn default() -> Self {
        Self::builder().build()
    }
}

impl ClientBuilder {
    /// Instantiates a [`Client`] and starts its engine thread.
    ///
    /// # Errors
    ///
    /// Returns an `Err` if:
    /// - The user agent is not a valid header value.
    /// - The proxy URL has no usable host.
    /// - The OS poller or the engine thread cannot be created.
    pub fn client(self) -> Result<Client> {
        let Self {
            max_connections,
            host_interval,
            host_intervals,
            server_policy,
            server_policies,
            queue_capacity,
            rx_speed_max,
            host_cache_limit,
            server_cache_limit,
            dns_refresh,
            dns_retry,
            local_addr,
            accept_invalid_certs,
            custom_headers,
            timeout,
            response_timeout,
            max_redirects,
            max_retries,
            max_body_size,
            decompress,
            user_agent,
            proxy,
            result_callback,
            resolver,
        } = self;

        // Surface unusable values now rather than on the first fetch.
        HeaderValue::from_str(&user_agent).map_err(ErrorKind::InvalidHeader)?;
        if let Some(proxy) = &proxy {
            HostKey::from_url(proxy)?;
        }

        let defaults = Arc::new(FetchConfig {
            timeout,
            response_timeout,
            max_redirects,
            max_retries,
            max_body_size,
            decompress,
            user_agent,
            proxy,
        });
        // Host names out of the URL parser arrive lowercased; overrides
        // must match.
        let host_intervals = host_intervals
            .into_iter()
            .map(|(host, interval)| (host.to_lowercase(), interval))
            .collect();
        let server_policies = server_policies
            .into_iter()
            .map(|(host, policy)| (host.to_lowercase(), policy))
            .collect();
        let config = Arc::new(EngineConfig {
            max_connections: max_connections.max(1),
            rx_speed_max,
            queue_capacity: queue_capacity.max(1),
            host_interval,
            host_intervals,
            server_policy,
            server_policies,
            host_cache_limit,
            server_cache_limit,
            dns_refresh,
            dns_retry,
            local_addr,
            accept_invalid_certs,
            custom_headers,
            defaults,
        });

        let (requests, request_rx) = bounded(config.queue_capacity);
        let (deliver, results) = match result_callback {
            Some(callback) => (Deliver::Callback(callback), None),
            None => {
                let (tx, rx) = bounded(config.queue_capacity);
                (Deliver::Queue(tx), Some(rx))
            }
        };
        let stats = Arc::new(ClientStats::default());
        let shutdown = Arc::new(AtomicBool::new(false));
        let resolve = resolver.unwrap_or_else(|| Arc::new(GaiResolver));
        let engine = Engine::spawn(
            Arc::clone(&config),
            resolve,
            request_rx,
            deliver,
            Arc::clone(&stats),
            Arc::clone(&shutdown),
        )?;

        Ok(Client {
            config,
            requests,
            results,
            next_id: AtomicU64::new(1),
            stats,
            shutdown,
            engine: Some(engine),
        })
    }
}

/// Handle to a running fetch engine.
///
/// Submitting is non-blocking and fails fast when the bounded queue is
/// full; results arrive in completion order, which is unrelated to
/// submission order. Dropping the client shuts the engine down and
/// fails whatever is still pending with
/// [`Canceled`](ErrorKind::Canceled).
///
/// See [`ClientBuilder`] which contains sane defaults for all
/// configuration options.
#[derive(Debug)]
pub struct Client {
    config: Arc<EngineConfig>,
    requests: Sender<(RequestId, FetchRequest)>,
    results: Option<Receiver<FetchResult>>,
    next_id: AtomicU64,
    stats: Arc<ClientStats>,
    shutdown: Arc<AtomicBool>,
    engine: Option<JoinHandle<()>>,
}

impl Client {
    /// Queue a fetch.
    ///
    /// Validation is synchronous: a request that comes back `Ok` will
    /// produce exactly one [`FetchResult`] carrying the returned
    /// [`RequestId`]. The call never blocks on the network.
    ///
    /// # Errors
    ///
    /// - [`ErrorKind::UnsupportedScheme`] or
    ///   [`ErrorKind::InvalidUrlHost`] for URLs the engine cannot fetch
    /// - [`ErrorKind::RetriesExhausted`] when the request's retry
    ///   counter is already past the configured ceiling
    /// - [`ErrorKind::QueueFull`] when the bounded request queue is at
    ///   capacity
    /// - [`ErrorKind::Canceled`] when the engine has already shut down
    pub fn put_request(&self, request: FetchRequest) -> Result<RequestId> {
        request.validate()?;
        let limit = request
            .config
            .as_deref()
            .unwrap_or(&self.config.defaults)
            .max_retries;
        if request.retry > limit {
            return Err(ErrorKind::RetriesExhausted(limit));
        }
        let id = RequestId(self.next_id.fetch_add(1, Ordering::Relaxed));
        match self.requests.try_send((id, request)) {
            Ok(()) => {
                self.stats.record_accepted();
                Ok(id)
            }
            Err(TrySendError::Full(_)) => Err(ErrorKind::QueueFull),
            Err(TrySendError::Disconnected(_)) => Err(ErrorKind::Canceled),
        }
    }

    /// Wait for the next finished fetch.
    ///
    /// Returns `None` once the engine has shut down and every result
    /// was taken, or when the client was built with a result callback.
    #[must_use]
    pub fn result(&self) -> Option<FetchResult> {
        self.results.as_ref()?.recv().ok()
    }

    /// Take a finished fetch without blocking.
    #[must_use]
    pub fn try_result(&self) -> Option<FetchResult> {
        self.results.as_ref()?.try_recv().ok()
    }

    /// Wait up to `timeout` for the next finished fetch.
    #[must_use]
    pub fn result_timeout(&self, timeout: Duration) -> Option<FetchResult> {
        self.results.as_ref()?.recv_timeout(timeout).ok()
    }

    /// Counters shared with the engine thread.
    #[must_use]
    pub fn stats(&self) -> &ClientStats {
        &self.stats
    }

    /// Stop the engine and wait for its thread to exit.
    ///
    /// Everything still queued or in flight fails with
    /// [`Canceled`](ErrorKind::Canceled); those results stay readable
    /// until the result queue is drained. Calling `close` twice is
    /// fine.
    pub fn close(&mut self) {
        self.shutdown.store(true, Ordering::Relaxed);
        if let Some(engine) = self.engine.take() {
            if engine.join().is_err() {
                warn!("engine thread panicked during shutdown");
            }
        }
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        self.close();
    }
}

/// A convenience function to fetch a single URL.
///
/// This spins up a whole engine for one fetch; for anything beyond
/// ad-hoc use, build a [`Client`] and keep it around. See documentation
/// of [`ClientBuilder`] for the available knobs.
///
/// # Errors
///
/// Returns an `Err` if:
/// - `request` cannot be turned into a [`FetchRequest`].
/// - The client cannot be built (see [`ClientBuilder::client`] for
///   failure cases).
/// - The request is rejected (see [`Client::put_request`]).
/// - The engine shuts down before producing a result.
pub fn fetch<T, E>(request: T) -> Result<FetchResult>
where
    FetchRequest: TryFrom<T, Error = E>,
    ErrorKind: From<E>,
{
    let client = ClientBuilder::builder().build().client()?;
    client.put_request(request.try_into()?)?;
    client.result().ok_or(ErrorKind::Canceled)
}
