use std::collections::{HashMap, VecDeque};

use crate::channel::host::{HostChannel, HostKey};
use crate::channel::server::{ServerChannel, ServerKey};

/// Slot index of a host record. Stable for the record's lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct HostId(pub(crate) usize);

/// Slot index of a server record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct ServerId(pub(crate) usize);

/// Slab of records with stable indices and slot reuse.
#[derive(Debug)]
pub(crate) struct Arena<T> {
    slots: Vec<Option<T>>,
    free: Vec<usize>,
    len: usize,
}

impl<T> Arena<T> {
    pub(crate) const fn new() -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            len: 0,
        }
    }

    pub(crate) fn insert(&mut self, value: T) -> usize {
        self.len += 1;
        match self.free.pop() {
            Some(idx) => {
                self.slots[idx] = Some(value);
                idx
            }
            None => {
                self.slots.push(Some(value));
                self.slots.len() - 1
            }
        }
    }

    pub(crate) fn get(&self, idx: usize) -> Option<&T> {
        self.slots.get(idx).and_then(Option::as_ref)
    }

    pub(crate) fn get_mut(&mut self, idx: usize) -> Option<&mut T> {
        self.slots.get_mut(idx).and_then(Option::as_mut)
    }

    pub(crate) fn remove(&mut self, idx: usize) -> Option<T> {
        let value = self.slots.get_mut(idx)?.take()?;
        self.free.push(idx);
        self.len -= 1;
        Some(value)
    }

    pub(crate) const fn len(&self) -> usize {
        self.len
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = (usize, &T)> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(idx, slot)| slot.as_ref().map(|value| (idx, value)))
    }

    pub(crate) fn iter_mut(&mut self) -> impl Iterator<Item = (usize, &mut T)> {
        self.slots
            .iter_mut()
            .enumerate()
            .filter_map(|(idx, slot)| slot.as_mut().map(|value| (idx, value)))
    }
}

/// Owns every host and server record, the key-to-id indexes, and the
/// idle caches that bound how many records outlive their queues.
#[derive(Debug)]
pub(crate) struct Registry {
    hosts: Arena<HostChannel>,
    servers: Arena<ServerChannel>,
    host_index: HashMap<HostKey, HostId>,
    server_index: HashMap<ServerKey, ServerId>,
    /// Drained hosts kept for politeness and DNS state, oldest first
    idle_hosts: VecDeque<HostId>,
    idle_servers: VecDeque<ServerId>,
    host_cache_limit: usize,
    server_cache_limit: usize,
}

impl Registry {
    pub(crate) fn new(host_cache_limit: usize, server_cache_limit: usize) -> Self {
        Self {
            hosts: Arena::new(),
            servers: Arena::new(),
            host_index: HashMap::new(),
            server_index: HashMap::new(),
            idle_hosts: VecDeque::new(),
            idle_servers: VecDeque::new(),
            host_cache_limit: host_cache_limit.max(1),
            server_cache_limit: server_cache_limit.max(1),
        }
    }

    pub(crate) fn host(&self, id: HostId) -> Option<&HostChannel> {
        self.hosts.get(id.0)
    }

    pub(crate) fn host_mut(&mut self, id: HostId) -> Option<&mut HostChannel> {
        self.hosts.get_mut(id.0)
    }

    pub(crate) fn server(&self, id: ServerId) -> Option<&ServerChannel> {
        self.servers.get(id.0)
    }

    pub(crate) fn server_mut(&mut self, id: ServerId) -> Option<&mut ServerChannel> {
        self.servers.get_mut(id.0)
    }

    pub(crate) fn host_id(&self, key: &HostKey) -> Option<HostId> {
        self.host_index.get(key).copied()
    }

    pub(crate) fn server_id(&self, key: &ServerKey) -> Option<ServerId> {
        self.server_index.get(key).copied()
    }

    pub(crate) fn insert_host(&mut self, host: HostChannel) -> HostId {
        let key = host.key.clone();
        let id = HostId(self.hosts.insert(host));
        self.host_index.insert(key, id);
        id
    }

    pub(crate) fn insert_server(&mut self, server: ServerChannel) -> ServerId {
        let key = server.key.clone();
        let id = ServerId(self.servers.insert(server));
        self.server_index.insert(key, id);
        id
    }

    pub(crate) fn remove_host(&mut self, id: HostId) -> Option<HostChannel> {
        let host = self.hosts.remove(id.0)?;
        self.host_index.remove(&host.key);
        self.idle_hosts.retain(|&h| h != id);
        Some(host)
    }

    pub(crate) fn remove_server(&mut self, id: ServerId) -> Option<ServerChannel> {
        let server = self.servers.remove(id.0)?;
        self.server_index.remove(&server.key);
        self.idle_servers.retain(|&s| s != id);
        Some(server)
    }

    /// Park a drained host on the idle cache.
    pub(crate) fn mark_host_idle(&mut self, id: HostId) {
        if !self.idle_hosts.contains(&id) {
            self.idle_hosts.push_back(id);
        }
    }

    /// Take a host back off the idle cache when new work arrives.
    /// Hosts on the cache are eviction candidates; live ones must not be.
    pub(crate) fn revive_host(&mut self, id: HostId) {
        self.idle_hosts.retain(|&h| h != id);
    }

    pub(crate) fn mark_server_idle(&mut self, id: ServerId) {
        if !self.idle_servers.contains(&id) {
            self.idle_servers.push_back(id);
        }
    }

    pub(crate) fn revive_server(&mut self, id: ServerId) {
        self.idle_servers.retain(|&s| s != id);
    }

    pub(crate) fn host_count(&self) -> usize {
        self.hosts.len()
    }

    pub(crate) fn server_count(&self) -> usize {
        self.servers.len()
    }

    pub(crate) fn server_ids(&self) -> Vec<ServerId> {
        self.servers.iter().map(|(idx, _)| ServerId(idx)).collect()
    }

    pub(crate) fn server_entries(&self) -> impl Iterator<Item = (ServerId, &ServerChannel)> {
        self.servers
            .iter()
            .map(|(idx, server)| (ServerId(idx), server))
    }

    /// Evict the oldest idle hosts once the record count passes the
    /// cache limit. Evicts a tenth of the limit per sweep, at least
    /// one, so a burst of new hosts does not stall on one-by-one
    /// eviction. Returns the evicted records with their old ids so the
    /// caller can detach them from server lists.
    pub(crate) fn evict_idle_hosts(&mut self) -> Vec<(HostId, HostChannel)> {
        let mut evicted = Vec::new();
        if self.hosts.len() <= self.host_cache_limit {
            return evicted;
        }
        let batch = (self.host_cache_limit / 10).max(1);
        while evicted.len() < batch {
            let Some(id) = self.idle_hosts.pop_front() else {
                break;
            };
            if let Some(host) = self.hosts.remove(id.0) {
                self.host_index.remove(&host.key);
                evicted.push((id, host));
            }
        }
        evicted
    }

    /// Same sweep for idle server records.
    pub(crate) fn evict_idle_servers(&mut self) -> Vec<(ServerId, ServerChannel)> {
        let mut evicted = Vec::new();
        if self.servers.len() <= self.server_cache_limit {
            return evicted;
        }
        let batch = (self.server_cache_limit / 10).max(1);
        while evicted.len() < batch {
            let Some(id) = self.idle_servers.pop_front() else {
                break;
            };
            if let Some(server) = self.servers.remove(id.0) {
                self.server_index.remove(&server.key);
                evicted.push((id, server));
            }
        }
        evicted
    }

    /// Tear everything down, yielding the host records so callers can
    /// fail whatever is still queued.
    pub(crate) fn drain_all(&mut self) -> Vec<HostChannel> {
        let mut hosts = Vec::new();
        let ids: Vec<usize> = self.hosts.iter_mut().map(|(idx, _)| idx).collect();
        for idx in ids {
            if let Some(host) = self.hosts.remove(idx) {
                hosts.push(host);
            }
        }
        let server_ids: Vec<usize> = self.servers.iter_mut().map(|(idx, _)| idx).collect();
        for idx in server_ids {
            if let Some(mut server) = self.servers.remove(idx) {
                server.close_pool();
            }
        }
        self.host_index.clear();
        self.server_index.clear();
        self.idle_hosts.clear();
        self.idle_servers.clear();
        hosts
    }
}
