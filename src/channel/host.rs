use std::collections::VecDeque;
use std::fmt::Display;
use std::time::{Duration, Instant};

use url::Url;

use crate::ErrorKind;
use crate::channel::registry::ServerId;
use crate::resource::Resource;
use crate::types::{PRIORITY_LEVELS, RequestId, Scheme};

/// Scheduling identity of a host.
///
/// Two URLs share a host channel exactly when scheme, lowercase host
/// name and effective port all match.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub(crate) struct HostKey {
    pub scheme: Scheme,
    pub host: String,
    pub port: u16,
}

impl HostKey {
    pub(crate) fn from_url(url: &Url) -> Result<Self, ErrorKind> {
        let scheme = Scheme::from_url(url)?;
        let host = url
            .host_str()
            .ok_or(ErrorKind::InvalidUrlHost)?
            .to_ascii_lowercase();
        let port = url.port().unwrap_or_else(|| scheme.default_port());
        Ok(Self { scheme, host, port })
    }

    /// `host` or `host:port`, port omitted when it is the scheme default.
    pub(crate) fn authority(&self) -> String {
        if self.port == self.scheme.default_port() {
            self.host.clone()
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }

    /// Always `host:port`, as `CONNECT` requires.
    pub(crate) fn authority_with_port(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl Display for HostKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}://{}:{}", self.scheme, self.host, self.port)
    }
}

/// Where a host stands with the resolver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum DnsState {
    /// Never submitted
    Unresolved,
    /// A lookup is in flight
    Pending,
    /// Addresses are known and bound to a server record
    Resolved {
        /// When the answer arrived, for staleness checks
        at: Instant,
    },
    /// The last lookup failed; requests fail fast until the retry
    /// window has passed
    Failed {
        at: Instant,
        reason: String,
    },
}

/// Per-host admission state: the politeness clock and the priority
/// wait queue.
///
/// A host channel never talks to the network itself. It parks resources
/// until its server record has capacity and the politeness interval has
/// elapsed, then hands them over one at a time.
#[derive(Debug)]
pub(crate) struct HostChannel {
    pub key: HostKey,
    pub dns: DnsState,
    /// Minimum spacing between two dispatches for this host
    pub interval: Duration,
    /// When this host last dispatched a resource
    pub last_fetch: Option<Instant>,
    /// Server record this host is bound to, once DNS has answered
    pub server: Option<ServerId>,
    /// Resources currently leased into the reactor
    pub in_flight: usize,
    queues: [VecDeque<Resource>; PRIORITY_LEVELS],
    queued: usize,
}

impl HostChannel {
    pub(crate) fn new(key: HostKey, interval: Duration) -> Self {
        Self {
            key,
            dns: DnsState::Unresolved,
            interval,
            last_fetch: None,
            server: None,
            in_flight: 0,
            queues: std::array::from_fn(|_| VecDeque::new()),
            queued: 0,
        }
    }

    /// Park a resource, keeping arrival order within its level.
    pub(crate) fn push(&mut self, resource: Resource) {
        self.queues[resource.priority.index()].push_back(resource);
        self.queued += 1;
    }

    /// Take the most urgent waiting resource.
    pub(crate) fn pop(&mut self) -> Option<Resource> {
        for queue in &mut self.queues {
            if let Some(resource) = queue.pop_front() {
                self.queued -= 1;
                return Some(resource);
            }
        }
        None
    }

    /// Pull a specific resource out of the queue, wherever it sits.
    pub(crate) fn remove(&mut self, id: RequestId) -> Option<Resource> {
        for queue in &mut self.queues {
            if let Some(pos) = queue.iter().position(|r| r.id == id) {
                self.queued -= 1;
                return queue.remove(pos);
            }
        }
        None
    }

    /// Empty every level, oldest and most urgent first.
    pub(crate) fn drain_all(&mut self) -> Vec<Resource> {
        let mut out = Vec::with_capacity(self.queued);
        for queue in &mut self.queues {
            out.extend(queue.drain(..));
        }
        self.queued = 0;
        out
    }

    pub(crate) const fn queued(&self) -> usize {
        self.queued
    }

    pub(crate) const fn is_empty(&self) -> bool {
        self.queued == 0
    }

    /// Resources attached to this host, queued or in flight. The host
    /// record may only be evicted at zero.
    pub(crate) const fn refcount(&self) -> usize {
        self.queued + self.in_flight
    }

    /// Earliest instant the politeness clock allows the next dispatch.
    /// `None` means immediately.
    pub(crate) fn ready_at(&self) -> Option<Instant> {
        if self.interval.is_zero() {
            return None;
        }
        self.last_fetch.map(|last| last + self.interval)
    }

    /// Whether the politeness clock allows a dispatch at `now`.
    pub(crate) fn is_ready(&self, now: Instant) -> bool {
        self.ready_at().is_none_or(|at| at <= now)
    }

    /// Stamp the politeness clock.
    pub(crate) fn mark_fetch(&mut self, now: Instant) {
        self.last_fetch = Some(now);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FetchConfig;
    use crate::types::{FetchRequest, Priority};
    use http::HeaderMap;
    use std::sync::Arc;

    fn key() -> HostKey {
        HostKey::from_url(&Url::parse("http://example.com/").unwrap()).unwrap()
    }

    fn resource(id: u64, priority: Priority) -> Resource {
        let request = FetchRequest::try_from("http://example.com/")
            .unwrap()
            .with_priority(priority);
        Resource::new(
            RequestId(id),
            request,
            &Arc::new(FetchConfig::default()),
            &HeaderMap::new(),
        )
    }

    #[test]
    fn test_pop_prefers_urgent_levels() {
        let mut host = HostChannel::new(key(), Duration::ZERO);
        host.push(resource(1, Priority::LOWEST));
        host.push(resource(2, Priority::NORMAL));
        host.push(resource(3, Priority::HIGHEST));
        assert_eq!(host.pop().unwrap().id, RequestId(3));
        assert_eq!(host.pop().unwrap().id, RequestId(2));
        assert_eq!(host.pop().unwrap().id, RequestId(1));
        assert!(host.pop().is_none());
    }

    #[test]
    fn test_fifo_within_level() {
        let mut host = HostChannel::new(key(), Duration::ZERO);
        for id in 1..=3 {
            host.push(resource(id, Priority::NORMAL));
        }
        assert_eq!(host.pop().unwrap().id, RequestId(1));
        assert_eq!(host.pop().unwrap().id, RequestId(2));
        assert_eq!(host.pop().unwrap().id, RequestId(3));
    }

    #[test]
    fn test_remove_by_id() {
        let mut host = HostChannel::new(key(), Duration::ZERO);
        host.push(resource(1, Priority::NORMAL));
        host.push(resource(2, Priority::NORMAL));
        let removed = host.remove(RequestId(1)).unwrap();
        assert_eq!(removed.id, RequestId(1));
        assert_eq!(host.queued(), 1);
        assert!(host.remove(RequestId(1)).is_none());
    }

    #[test]
    fn test_politeness_clock() {
        let mut host = HostChannel::new(key(), Duration::from_millis(100));
        let now = Instant::now();
        assert!(host.is_ready(now));
        host.mark_fetch(now);
        assert!(!host.is_ready(now));
        assert!(host.is_ready(now + Duration::from_millis(100)));
    }

    #[test]
    fn test_zero_interval_is_always_ready() {
        let mut host = HostChannel::new(key(), Duration::ZERO);
        let now = Instant::now();
        host.mark_fetch(now);
        assert!(host.is_ready(now));
        assert_eq!(host.ready_at(), None);
    }

    #[test]
    fn test_authority_forms() {
        let key = HostKey {
            scheme: Scheme::Https,
            host: "example.com".to_string(),
            port: 443,
        };
        assert_eq!(key.authority(), "example.com");
        assert_eq!(key.authority_with_port(), "example.com:443");
        assert_eq!(key.to_string(), "https://example.com:443");
    }
}
