use std::collections::VecDeque;
use std::net::{IpAddr, SocketAddr};
use std::time::{Duration, Instant};

use crate::channel::host::HostKey;
use crate::channel::registry::HostId;
use crate::channel::stats::RollingStats;
use crate::config::{ConcurrencyMode, ServerPolicy};
use crate::reactor::conn::Connection;
use crate::types::Scheme;

/// Identity of a server record.
///
/// Hosts that resolve to the same sorted address set, use the same
/// local bind address and speak the same scheme share one server
/// record, its connection pool and its politeness clock. This is what
/// keeps dozens of vanity domains on one CDN box from each getting
/// their own connection budget.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub(crate) struct ServerKey {
    /// Resolved addresses, sorted and deduplicated
    pub addrs: Vec<SocketAddr>,
    pub local: Option<IpAddr>,
    pub scheme: Scheme,
}

impl ServerKey {
    pub(crate) fn new(mut addrs: Vec<SocketAddr>, local: Option<IpAddr>, scheme: Scheme) -> Self {
        addrs.sort();
        addrs.dedup();
        Self {
            addrs,
            local,
            scheme,
        }
    }

    /// First address, used by connection modes that dial a single one.
    pub(crate) fn primary(&self) -> Option<SocketAddr> {
        self.addrs.first().copied()
    }
}

/// Connection pool and scheduling state for one physical server.
#[derive(Debug)]
pub(crate) struct ServerChannel {
    pub key: ServerKey,
    pub policy: ServerPolicy,
    pub stats: RollingStats,
    /// Floor on the spacing between any two dispatches to this server:
    /// the minimum politeness interval over member hosts
    pub min_interval: Duration,
    pub last_fetch: Option<Instant>,
    /// Member hosts with queued work, rotated round-robin
    wait_hosts: VecDeque<HostId>,
    /// Member hosts without queued work
    idle_hosts: Vec<HostId>,
    pool: Vec<Connection>,
    leased: usize,
}

impl ServerChannel {
    pub(crate) fn new(key: ServerKey, policy: ServerPolicy) -> Self {
        let stats = RollingStats::new(&policy);
        let mut server = Self {
            key,
            policy,
            stats,
            min_interval: Duration::ZERO,
            last_fetch: None,
            wait_hosts: VecDeque::new(),
            idle_hosts: Vec::new(),
            pool: Vec::new(),
            leased: 0,
        };
        server.seed_pool();
        server
    }

    /// Pre-create the connection slots the concurrency mode allows.
    fn seed_pool(&mut self) {
        let local = self.key.local;
        match self.policy.concurrency {
            ConcurrencyMode::Serial => {
                if let Some(addr) = self.key.primary() {
                    self.pool.push(Connection::new(addr, local));
                }
            }
            ConcurrencyMode::PerAddress => {
                for addr in self.key.addrs.clone() {
                    self.pool.push(Connection::new(addr, local));
                }
            }
            ConcurrencyMode::Unlimited => {}
        }
    }

    /// Take a connection for an exchange to `host`, preferring one with
    /// a live transport that can carry the host without a handshake.
    ///
    /// Returns `None` when the mode's budget is exhausted.
    pub(crate) fn lease(&mut self, host: &HostKey) -> Option<Connection> {
        let conn = match self.pool.iter().position(|c| c.is_reusable_for(host)) {
            Some(pos) => Some(self.pool.swap_remove(pos)),
            None => self.pool.pop(),
        };
        let conn = match (conn, self.policy.concurrency) {
            (Some(conn), _) => conn,
            (None, ConcurrencyMode::Unlimited) => {
                Connection::new(self.key.primary()?, self.key.local)
            }
            (None, _) => return None,
        };
        self.leased += 1;
        Some(conn)
    }

    /// Return a leased connection.
    ///
    /// Reusable connections go back into the pool with their transport
    /// intact. Dead ones still return their *slot* under bounded modes,
    /// so the budget is restored; under `Unlimited` they just go away.
    pub(crate) fn release(&mut self, mut conn: Connection, reusable: bool) {
        self.leased = self.leased.saturating_sub(1);
        if reusable && conn.is_open() {
            conn.finish_keep_alive();
            self.pool.push(conn);
            return;
        }
        conn.close();
        if self.policy.concurrency != ConcurrencyMode::Unlimited {
            self.pool.push(conn);
        }
    }

    /// Whether a lease could succeed right now.
    pub(crate) fn has_capacity(&self) -> bool {
        !self.pool.is_empty() || self.policy.concurrency == ConcurrencyMode::Unlimited
    }

    pub(crate) const fn leased(&self) -> usize {
        self.leased
    }

    /// Server-level politeness gate.
    pub(crate) fn is_ready(&self, now: Instant) -> bool {
        self.ready_at().is_none_or(|at| at <= now)
    }

    pub(crate) fn ready_at(&self) -> Option<Instant> {
        if self.min_interval.is_zero() {
            return None;
        }
        self.last_fetch.map(|last| last + self.min_interval)
    }

    pub(crate) fn mark_fetch(&mut self, now: Instant) {
        self.last_fetch = Some(now);
    }

    /// Attach a member host, placing it on the right list.
    pub(crate) fn attach_host(&mut self, id: HostId, has_work: bool) {
        self.detach_host(id);
        if has_work {
            self.wait_hosts.push_back(id);
        } else {
            self.idle_hosts.push(id);
        }
    }

    pub(crate) fn detach_host(&mut self, id: HostId) {
        self.wait_hosts.retain(|&h| h != id);
        self.idle_hosts.retain(|&h| h != id);
    }

    /// A member host gained queued work.
    pub(crate) fn host_has_work(&mut self, id: HostId) {
        if !self.wait_hosts.contains(&id) {
            self.idle_hosts.retain(|&h| h != id);
            self.wait_hosts.push_back(id);
        }
    }

    /// A member host's queue drained.
    pub(crate) fn host_went_idle(&mut self, id: HostId) {
        self.wait_hosts.retain(|&h| h != id);
        if !self.idle_hosts.contains(&id) {
            self.idle_hosts.push(id);
        }
    }

    /// Rotate the waiting-host list: front host moves to the back and
    /// is returned. Fairness across hosts sharing this server.
    pub(crate) fn rotate_waiting_host(&mut self) -> Option<HostId> {
        let id = self.wait_hosts.pop_front()?;
        self.wait_hosts.push_back(id);
        Some(id)
    }

    pub(crate) fn waiting_hosts(&self) -> usize {
        self.wait_hosts.len()
    }

    /// Hosts attached to this server, waiting or idle.
    pub(crate) fn member_hosts(&self) -> impl Iterator<Item = HostId> + '_ {
        self.wait_hosts.iter().chain(self.idle_hosts.iter()).copied()
    }

    /// Hosts currently on the wait list.
    pub(crate) fn waiting_host_ids(&self) -> impl Iterator<Item = HostId> + '_ {
        self.wait_hosts.iter().copied()
    }

    /// Whether this record has nothing in flight and nothing queued.
    /// Idle member hosts do not keep a server alive.
    pub(crate) fn is_idle(&self) -> bool {
        self.wait_hosts.is_empty() && self.leased == 0
    }

    /// Drop every pooled transport, e.g. when the server is disabled.
    pub(crate) fn close_pool(&mut self) {
        for conn in &mut self.pool {
            conn.close();
        }
        self.pool.clear();
    }
}
