use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use log::{debug, warn};

use crate::channel::host::{DnsState, HostChannel, HostKey};
use crate::channel::registry::{HostId, Registry, ServerId};
use crate::channel::server::{ServerChannel, ServerKey};
use crate::config::EngineConfig;
use crate::reactor::conn::Connection;
use crate::resource::Resource;
use crate::types::{ErrorKind, FetchResult, RequestId};

/// A resolver lookup the caller should run for a queued host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct DnsQuery {
    pub host_id: HostId,
    pub name: String,
    pub port: u16,
}

/// Outcome of queuing a resource.
#[derive(Debug)]
pub(crate) enum Admission {
    /// Queued; the host is already bound or a lookup is in flight.
    Queued(HostId),
    /// Queued; the caller must submit this lookup.
    QueuedDns(HostId, DnsQuery),
    /// Rejected synchronously, already turned into a terminal result.
    Rejected(Box<FetchResult>),
}

/// A resource paired with its leased connection, ready for the reactor.
#[derive(Debug)]
pub(crate) struct Dispatch {
    pub resource: Resource,
    pub conn: Connection,
    pub host: HostId,
    pub server: ServerId,
}

/// Owns the scheduling graph: host records, server records and the
/// relationships between them.
///
/// Everything here runs on the engine thread. The manager decides which
/// resource goes out next; it never touches a socket itself.
#[derive(Debug)]
pub(crate) struct ChannelManager {
    registry: Registry,
    config: Arc<EngineConfig>,
}

impl ChannelManager {
    pub(crate) fn new(config: Arc<EngineConfig>) -> Self {
        Self {
            registry: Registry::new(config.host_cache_limit, config.server_cache_limit),
            config,
        }
    }

    /// Queue a resource on its host channel, creating the host record
    /// on first contact.
    ///
    /// Fails fast when the host's last lookup failed inside the retry
    /// window; otherwise the resource waits for capacity, politeness
    /// and, if needed, the resolver.
    pub(crate) fn add_resource(&mut self, resource: Resource, now: Instant) -> Admission {
        let key = match resource.host_key() {
            Ok(key) => key,
            Err(e) => return Admission::Rejected(Box::new(resource.fail(e))),
        };
        // Proxied resources resolve and dial the proxy, not the target.
        let connect = match resource.connect_key() {
            Ok(key) => key,
            Err(e) => return Admission::Rejected(Box::new(resource.fail(e))),
        };
        let id = resource.id;
        let host_id = match self.registry.host_id(&key) {
            Some(id) => id,
            None => {
                let interval = self.config.interval_for(&key.host);
                self.registry
                    .insert_host(HostChannel::new(key.clone(), interval))
            }
        };
        self.registry.revive_host(host_id);
        let Some(host) = self.registry.host_mut(host_id) else {
            return Admission::Rejected(Box::new(resource.fail(ErrorKind::Canceled)));
        };
        host.push(resource);
        let server = host.server;
        let dns = host.dns.clone();
        match (server, dns) {
            (Some(server_id), dns) => {
                if let Some(server) = self.registry.server_mut(server_id) {
                    server.host_has_work(host_id);
                }
                self.registry.revive_server(server_id);
                let refresh = match dns {
                    DnsState::Resolved { at } => {
                        now.duration_since(at) > self.config.dns_refresh
                    }
                    DnsState::Failed { at, .. } => {
                        now.duration_since(at) >= self.config.dns_retry
                    }
                    _ => false,
                };
                if refresh {
                    if let Some(host) = self.registry.host_mut(host_id) {
                        host.dns = DnsState::Pending;
                    }
                    debug!("refreshing addresses for {}", connect.host);
                    return Admission::QueuedDns(
                        host_id,
                        DnsQuery {
                            host_id,
                            name: connect.host,
                            port: connect.port,
                        },
                    );
                }
                Admission::Queued(host_id)
            }
            (None, DnsState::Pending) => Admission::Queued(host_id),
            (None, DnsState::Failed { at, reason })
                if now.duration_since(at) < self.config.dns_retry =>
            {
                let Some(rejected) =
                    self.registry.host_mut(host_id).and_then(|h| h.remove(id))
                else {
                    return Admission::Queued(host_id);
                };
                self.park_if_idle(host_id);
                self.sweep_caches();
                Admission::Rejected(Box::new(rejected.fail(ErrorKind::Dns {
                    host: connect.host,
                    reason,
                })))
            }
            (None, _) => {
                if let Some(host) = self.registry.host_mut(host_id) {
                    host.dns = DnsState::Pending;
                }
                Admission::QueuedDns(
                    host_id,
                    DnsQuery {
                        host_id,
                        name: connect.host,
                        port: connect.port,
                    },
                )
            }
        }
    }

    /// Bind a host to the server record its addresses identify,
    /// creating or rebinding as needed. Hosts resolving to the same
    /// address set share one record and its connection budget.
    pub(crate) fn dns_resolved(
        &mut self,
        host_id: HostId,
        addrs: Vec<SocketAddr>,
        now: Instant,
    ) -> Vec<FetchResult> {
        if addrs.is_empty() {
            return self.dns_failed(host_id, "resolved to no addresses".to_string(), now);
        }
        // The host may have been evicted while the lookup ran.
        let Some(host) = self.registry.host_mut(host_id) else {
            return Vec::new();
        };
        host.dns = DnsState::Resolved { at: now };
        let scheme = host.key.scheme;
        let host_name = host.key.host.clone();
        let has_work = !host.is_empty();
        let old = host.server;
        let key = ServerKey::new(addrs, self.config.local_addr, scheme);
        if let Some(old_id) = old {
            if self.registry.server(old_id).is_some_and(|s| s.key == key) {
                return Vec::new();
            }
            // The address set changed; move the host over.
            if let Some(server) = self.registry.server_mut(old_id) {
                server.detach_host(host_id);
            }
            self.recompute_min_interval(old_id);
            self.park_server_if_idle(old_id);
        }
        let server_id = match self.registry.server_id(&key) {
            Some(id) => id,
            None => {
                let policy = self.config.policy_for(&host_name);
                self.registry
                    .insert_server(ServerChannel::new(key, policy))
            }
        };
        if let Some(host) = self.registry.host_mut(host_id) {
            host.server = Some(server_id);
        }
        if let Some(server) = self.registry.server_mut(server_id) {
            server.attach_host(host_id, has_work);
        }
        self.recompute_min_interval(server_id);
        if has_work {
            self.registry.revive_server(server_id);
        }
        Vec::new()
    }

    /// Record a lookup failure. Unbound hosts drain their queue into
    /// terminal results; a bound host keeps serving on its last good
    /// binding until the retry window reopens.
    pub(crate) fn dns_failed(
        &mut self,
        host_id: HostId,
        reason: String,
        now: Instant,
    ) -> Vec<FetchResult> {
        let Some(host) = self.registry.host_mut(host_id) else {
            return Vec::new();
        };
        host.dns = DnsState::Failed {
            at: now,
            reason: reason.clone(),
        };
        if host.server.is_some() {
            warn!("address refresh for {} failed: {reason}", host.key.host);
            return Vec::new();
        }
        let name = host.key.host.clone();
        let drained = host.drain_all();
        warn!("lookup for {name} failed: {reason}");
        let results = drained
            .into_iter()
            .map(|r| {
                r.fail(ErrorKind::Dns {
                    host: name.clone(),
                    reason: reason.clone(),
                })
            })
            .collect();
        self.park_if_idle(host_id);
        self.sweep_caches();
        results
    }

    /// Pop the next dispatchable exchange, honoring both politeness
    /// clocks and the server's concurrency budget. Hosts sharing a
    /// server take turns via wait-list rotation.
    pub(crate) fn pop_ready(&mut self, now: Instant) -> Option<Dispatch> {
        for server_id in self.registry.server_ids() {
            let dispatchable = self.registry.server(server_id).is_some_and(|s| {
                s.waiting_hosts() > 0 && s.has_capacity() && s.is_ready(now)
            });
            if !dispatchable {
                continue;
            }
            let rotations = self
                .registry
                .server(server_id)
                .map_or(0, ServerChannel::waiting_hosts);
            for _ in 0..rotations {
                let Some(host_id) = self
                    .registry
                    .server_mut(server_id)
                    .and_then(ServerChannel::rotate_waiting_host)
                else {
                    break;
                };
                let (ready, empty, host_key) = match self.registry.host(host_id) {
                    Some(host) => (host.is_ready(now), host.is_empty(), host.key.clone()),
                    None => {
                        // Stale wait-list entry for an evicted host.
                        if let Some(server) = self.registry.server_mut(server_id) {
                            server.detach_host(host_id);
                        }
                        continue;
                    }
                };
                if empty {
                    if let Some(server) = self.registry.server_mut(server_id) {
                        server.host_went_idle(host_id);
                    }
                    continue;
                }
                if !ready {
                    continue;
                }
                let Some(conn) = self
                    .registry
                    .server_mut(server_id)
                    .and_then(|s| s.lease(&host_key))
                else {
                    break;
                };
                let Some(resource) =
                    self.registry.host_mut(host_id).and_then(HostChannel::pop)
                else {
                    self.release_connection(server_id, conn, true);
                    continue;
                };
                let mut drained = false;
                if let Some(host) = self.registry.host_mut(host_id) {
                    host.in_flight += 1;
                    host.mark_fetch(now);
                    drained = host.is_empty();
                }
                if let Some(server) = self.registry.server_mut(server_id) {
                    server.mark_fetch(now);
                    if drained {
                        server.host_went_idle(host_id);
                    }
                }
                return Some(Dispatch {
                    resource,
                    conn,
                    host: host_id,
                    server: server_id,
                });
            }
        }
        None
    }

    /// Earliest instant any queued resource could dispatch, for poll
    /// timeout derivation. `None` means nothing is waiting.
    pub(crate) fn next_ready_at(&self, now: Instant) -> Option<Instant> {
        let mut nearest: Option<Instant> = None;
        for (_, server) in self.registry.server_entries() {
            if server.waiting_hosts() == 0 || !server.has_capacity() {
                continue;
            }
            let server_at = server.ready_at().unwrap_or(now);
            for host_id in server.waiting_host_ids() {
                let Some(host) = self.registry.host(host_id) else {
                    continue;
                };
                if host.is_empty() {
                    continue;
                }
                let at = server_at.max(host.ready_at().unwrap_or(now));
                nearest = Some(nearest.map_or(at, |n| n.min(at)));
            }
        }
        nearest
    }

    /// Return a leased connection to its server's pool.
    pub(crate) fn release_connection(
        &mut self,
        server_id: ServerId,
        mut conn: Connection,
        reusable: bool,
    ) {
        let Some(server) = self.registry.server_mut(server_id) else {
            // Server disabled or evicted while the exchange ran.
            conn.close();
            return;
        };
        server.release(conn, reusable);
        self.park_server_if_idle(server_id);
    }

    pub(crate) fn record_success(&mut self, server_id: ServerId, elapsed: std::time::Duration) {
        if let Some(server) = self.registry.server_mut(server_id) {
            server.stats.record_success(elapsed);
        }
    }

    /// Record a failure; `true` means the error rate tripped the
    /// breaker and the caller should disable the server.
    pub(crate) fn record_failure(&mut self, server_id: ServerId) -> bool {
        self.registry.server_mut(server_id).is_some_and(|server| {
            server.stats.record_failure();
            server.stats.is_tripped()
        })
    }

    /// A dispatched resource reached a terminal result.
    pub(crate) fn resource_done(&mut self, host_id: HostId) {
        if let Some(host) = self.registry.host_mut(host_id) {
            host.in_flight = host.in_flight.saturating_sub(1);
        }
        self.park_if_idle(host_id);
        self.sweep_caches();
    }

    /// Disable a server: drop its pool, fail everything its member
    /// hosts still have queued, and reset those hosts for a fresh
    /// resolve. In-flight exchanges finish on their own.
    pub(crate) fn break_server(&mut self, server_id: ServerId) -> Vec<FetchResult> {
        let Some(mut server) = self.registry.remove_server(server_id) else {
            return Vec::new();
        };
        warn!(
            "error rate {:.2} tripped the breaker for {:?}",
            server.stats.error_rate(),
            server.key.addrs
        );
        server.close_pool();
        let mut results = Vec::new();
        let members: Vec<HostId> = server.member_hosts().collect();
        for host_id in members {
            let drained = match self.registry.host_mut(host_id) {
                Some(host) => {
                    host.server = None;
                    host.dns = DnsState::Unresolved;
                    host.drain_all()
                }
                None => continue,
            };
            results.extend(
                drained
                    .into_iter()
                    .map(|r| r.fail(ErrorKind::ServerDisabled)),
            );
            self.park_if_idle(host_id);
        }
        self.sweep_caches();
        results
    }

    /// Pull a still-queued resource out for the timeout sweep. Never
    /// touches the network; dispatched resources are not cancelable.
    pub(crate) fn remove_queued(&mut self, host_id: HostId, id: RequestId) -> Option<Resource> {
        let resource = self.registry.host_mut(host_id).and_then(|h| h.remove(id))?;
        let (empty, server) = self
            .registry
            .host(host_id)
            .map_or((true, None), |h| (h.is_empty(), h.server));
        if empty {
            if let Some(server_id) = server {
                if let Some(s) = self.registry.server_mut(server_id) {
                    s.host_went_idle(host_id);
                }
            }
        }
        self.park_if_idle(host_id);
        self.sweep_caches();
        Some(resource)
    }

    /// Tear down every record, failing whatever is still queued.
    pub(crate) fn shutdown(&mut self) -> Vec<FetchResult> {
        self.registry
            .drain_all()
            .into_iter()
            .flat_map(|mut host| host.drain_all())
            .map(|r| r.fail(ErrorKind::Canceled))
            .collect()
    }

    pub(crate) fn host_count(&self) -> usize {
        self.registry.host_count()
    }

    pub(crate) fn server_count(&self) -> usize {
        self.registry.server_count()
    }

    fn park_if_idle(&mut self, host_id: HostId) {
        let Some((refcount, server)) = self
            .registry
            .host(host_id)
            .map(|h| (h.refcount(), h.server))
        else {
            return;
        };
        if refcount > 0 {
            return;
        }
        if let Some(server_id) = server {
            if let Some(s) = self.registry.server_mut(server_id) {
                s.host_went_idle(host_id);
            }
            self.park_server_if_idle(server_id);
        }
        self.registry.mark_host_idle(host_id);
    }

    fn park_server_if_idle(&mut self, server_id: ServerId) {
        if self
            .registry
            .server(server_id)
            .is_some_and(ServerChannel::is_idle)
        {
            self.registry.mark_server_idle(server_id);
        }
    }

    /// Keep the server's dispatch spacing at the tightest politeness
    /// interval any member host asks for.
    fn recompute_min_interval(&mut self, server_id: ServerId) {
        let members: Vec<HostId> = match self.registry.server(server_id) {
            Some(server) => server.member_hosts().collect(),
            None => return,
        };
        let min = members
            .iter()
            .filter_map(|&id| self.registry.host(id))
            .map(|h| h.interval)
            .min()
            .unwrap_or_default();
        if let Some(server) = self.registry.server_mut(server_id) {
            server.min_interval = min;
        }
    }

    fn sweep_caches(&mut self) {
        for (host_id, host) in self.registry.evict_idle_hosts() {
            if let Some(server_id) = host.server {
                if let Some(server) = self.registry.server_mut(server_id) {
                    server.detach_host(host_id);
                }
                self.recompute_min_interval(server_id);
                self.park_server_if_idle(server_id);
            }
            debug!("evicted idle host {}", host.key);
        }
        for (_, mut server) in self.registry.evict_idle_servers() {
            server.close_pool();
            for member in server.member_hosts().collect::<Vec<_>>() {
                if let Some(host) = self.registry.host_mut(member) {
                    host.server = None;
                    host.dns = DnsState::Unresolved;
                }
            }
            debug!("evicted idle server {:?}", server.key.addrs);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::time::Duration;

    use http::HeaderMap;

    use crate::config::{ConcurrencyMode, FetchConfig, ServerPolicy};
    use crate::types::{FetchRequest, Priority, Status};

    fn config(mode: ConcurrencyMode) -> Arc<EngineConfig> {
        Arc::new(EngineConfig {
            max_connections: 16,
            rx_speed_max: None,
            queue_capacity: 64,
            host_interval: Duration::ZERO,
            host_intervals: HashMap::new(),
            server_policy: ServerPolicy {
                concurrency: mode,
                ..ServerPolicy::default()
            },
            server_policies: HashMap::new(),
            host_cache_limit: 64,
            server_cache_limit: 64,
            dns_refresh: Duration::from_secs(300),
            dns_retry: Duration::from_secs(30),
            local_addr: None,
            accept_invalid_certs: false,
            custom_headers: HeaderMap::new(),
            defaults: Arc::new(FetchConfig::default()),
        })
    }

    fn resource(id: u64, url: &str) -> Resource {
        Resource::new(
            RequestId(id),
            FetchRequest::try_from(url).unwrap(),
            &Arc::new(FetchConfig::default()),
            &HeaderMap::new(),
        )
    }

    fn addr(s: &str) -> SocketAddr {
        s.parse().unwrap()
    }

    #[test]
    fn test_first_contact_triggers_lookup() {
        let mut mgr = ChannelManager::new(config(ConcurrencyMode::PerAddress));
        let now = Instant::now();
        let Admission::QueuedDns(_, query) =
            mgr.add_resource(resource(1, "http://example.com/a"), now)
        else {
            panic!("expected a lookup");
        };
        assert_eq!(query.name, "example.com");
        assert_eq!(query.port, 80);
        // Second resource rides the in-flight lookup.
        assert!(matches!(
            mgr.add_resource(resource(2, "http://example.com/b"), now),
            Admission::Queued(_)
        ));
    }

    #[test]
    fn test_serial_admits_one_at_a_time() {
        let mut mgr = ChannelManager::new(config(ConcurrencyMode::Serial));
        let now = Instant::now();
        let Admission::QueuedDns(host_id, _) =
            mgr.add_resource(resource(1, "http://example.com/a"), now)
        else {
            panic!("expected a lookup");
        };
        mgr.add_resource(resource(2, "http://example.com/b"), now);
        mgr.dns_resolved(host_id, vec![addr("127.0.0.1:80")], now);
        let first = mgr.pop_ready(now).unwrap();
        assert!(mgr.pop_ready(now).is_none());
        mgr.release_connection(first.server, first.conn, false);
        mgr.resource_done(first.host);
        assert!(mgr.pop_ready(now).is_some());
    }

    #[test]
    fn test_aliases_share_one_server_record() {
        let mut mgr = ChannelManager::new(config(ConcurrencyMode::PerAddress));
        let now = Instant::now();
        let Admission::QueuedDns(a, _) =
            mgr.add_resource(resource(1, "http://a.example.com/"), now)
        else {
            panic!();
        };
        let Admission::QueuedDns(b, _) =
            mgr.add_resource(resource(2, "http://b.example.com/"), now)
        else {
            panic!();
        };
        let addrs = vec![addr("10.0.0.1:80"), addr("10.0.0.2:80")];
        mgr.dns_resolved(a, addrs.clone(), now);
        mgr.dns_resolved(b, addrs, now);
        assert_eq!(mgr.host_count(), 2);
        assert_eq!(mgr.server_count(), 1);
    }

    #[test]
    fn test_lookup_failure_drains_and_fails_fast() {
        let mut mgr = ChannelManager::new(config(ConcurrencyMode::PerAddress));
        let now = Instant::now();
        let Admission::QueuedDns(host_id, _) =
            mgr.add_resource(resource(1, "http://bad.example.com/"), now)
        else {
            panic!();
        };
        let results = mgr.dns_failed(host_id, "nxdomain".to_string(), now);
        assert_eq!(results.len(), 1);
        assert!(matches!(
            &results[0].status,
            Status::Error(ErrorKind::Dns { .. })
        ));
        // Inside the retry window new arrivals are rejected outright.
        let soon = now + Duration::from_secs(1);
        assert!(matches!(
            mgr.add_resource(resource(2, "http://bad.example.com/"), soon),
            Admission::Rejected(_)
        ));
        // Past the window the lookup is retried.
        let later = now + Duration::from_secs(60);
        assert!(matches!(
            mgr.add_resource(resource(3, "http://bad.example.com/"), later),
            Admission::QueuedDns(..)
        ));
    }

    #[test]
    fn test_break_server_fails_queued_and_resets_host() {
        let mut mgr = ChannelManager::new(config(ConcurrencyMode::Unlimited));
        let now = Instant::now();
        let Admission::QueuedDns(host_id, _) =
            mgr.add_resource(resource(1, "http://example.com/a"), now)
        else {
            panic!();
        };
        mgr.add_resource(resource(2, "http://example.com/b"), now);
        mgr.dns_resolved(host_id, vec![addr("127.0.0.1:80")], now);
        let dispatch = mgr.pop_ready(now).unwrap();
        let results = mgr.break_server(dispatch.server);
        // Only the still-queued resource fails; the in-flight one
        // finishes through the reactor.
        assert_eq!(results.len(), 1);
        assert!(matches!(
            &results[0].status,
            Status::Error(ErrorKind::ServerDisabled)
        ));
        assert_eq!(mgr.server_count(), 0);
        // The host needs a fresh resolve before it can dispatch again.
        assert!(matches!(
            mgr.add_resource(resource(3, "http://example.com/c"), now),
            Admission::QueuedDns(..)
        ));
    }

    #[test]
    fn test_politeness_spaces_dispatches() {
        let mut config = config(ConcurrencyMode::Unlimited);
        Arc::get_mut(&mut config)
            .unwrap()
            .host_intervals
            .insert("example.com".to_string(), Duration::from_millis(50));
        let mut mgr = ChannelManager::new(config);
        let now = Instant::now();
        let Admission::QueuedDns(host_id, _) =
            mgr.add_resource(resource(1, "http://example.com/a"), now)
        else {
            panic!();
        };
        mgr.add_resource(resource(2, "http://example.com/b"), now);
        mgr.dns_resolved(host_id, vec![addr("127.0.0.1:80")], now);
        assert!(mgr.pop_ready(now).is_some());
        assert!(mgr.pop_ready(now).is_none());
        assert_eq!(
            mgr.next_ready_at(now),
            Some(now + Duration::from_millis(50))
        );
        assert!(mgr.pop_ready(now + Duration::from_millis(50)).is_some());
    }

    #[test]
    fn test_priority_decides_dispatch_order() {
        let mut mgr = ChannelManager::new(config(ConcurrencyMode::Unlimited));
        let now = Instant::now();
        let mut low = resource(1, "http://example.com/low");
        low.priority = Priority::LOWEST;
        let Admission::QueuedDns(host_id, _) = mgr.add_resource(low, now) else {
            panic!();
        };
        let mut high = resource(2, "http://example.com/high");
        high.priority = Priority::HIGHEST;
        mgr.add_resource(high, now);
        mgr.dns_resolved(host_id, vec![addr("127.0.0.1:80")], now);
        assert_eq!(mgr.pop_ready(now).unwrap().resource.id, RequestId(2));
        assert_eq!(mgr.pop_ready(now).unwrap().resource.id, RequestId(1));
    }

    #[test]
    fn test_idle_host_evicted_and_recreated() {
        let mut config = config(ConcurrencyMode::Unlimited);
        Arc::get_mut(&mut config).unwrap().host_cache_limit = 1;
        let mut mgr = ChannelManager::new(config);
        let now = Instant::now();
        let Admission::QueuedDns(a, _) =
            mgr.add_resource(resource(1, "http://a.example.com/"), now)
        else {
            panic!();
        };
        mgr.dns_resolved(a, vec![addr("10.0.0.1:80")], now);
        let dispatch = mgr.pop_ready(now).unwrap();
        mgr.release_connection(dispatch.server, dispatch.conn, false);
        mgr.resource_done(dispatch.host);
        // Second host pushes the record count over the limit; the next
        // destruction sweep evicts the idle first host.
        let Admission::QueuedDns(b, _) =
            mgr.add_resource(resource(2, "http://b.example.com/"), now)
        else {
            panic!();
        };
        mgr.dns_resolved(b, vec![addr("10.0.0.2:80")], now);
        let dispatch = mgr.pop_ready(now).unwrap();
        mgr.release_connection(dispatch.server, dispatch.conn, false);
        mgr.resource_done(dispatch.host);
        assert_eq!(mgr.host_count(), 1);
        // The evicted host comes back as a fresh record.
        assert!(matches!(
            mgr.add_resource(resource(3, "http://a.example.com/"), now),
            Admission::QueuedDns(..)
        ));
    }

    #[test]
    fn test_shutdown_fails_queued_resources() {
        let mut mgr = ChannelManager::new(config(ConcurrencyMode::PerAddress));
        let now = Instant::now();
        mgr.add_resource(resource(1, "http://example.com/a"), now);
        mgr.add_resource(resource(2, "http://other.example.com/b"), now);
        let results = mgr.shutdown();
        assert_eq!(results.len(), 2);
        assert!(
            results
                .iter()
                .all(|r| matches!(&r.status, Status::Error(ErrorKind::Canceled)))
        );
        assert_eq!(mgr.host_count(), 0);
    }
}
