use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, SendTimeoutError, Sender, TryRecvError};
use log::{debug, error, trace, warn};

use crate::channel::{Admission, ChannelManager, Dispatch, HostId, HostKey, ServerId};
use crate::client::{ClientStats, ResultCallback};
use crate::config::EngineConfig;
use crate::dns::{DnsAnswer, Resolve, Resolver};
use crate::message::{HttpResponseSink, decode_body};
use crate::reactor::conn::Connection;
use crate::reactor::{CompletedExchange, Reactor, tls};
use crate::redirect;
use crate::resource::{ProxyPhase, Resource};
use crate::types::{Document, ErrorKind, FetchRequest, FetchResult, RequestId, Status};

/// Upper bound on one poll turn when nothing sets a nearer wakeup.
const IDLE_TICK: Duration = Duration::from_millis(25);
/// How long to wait on a full result queue before dropping a result.
const RESULT_PATIENCE: Duration = Duration::from_secs(1);

/// How finished results leave the engine.
pub(crate) enum Deliver {
    Queue(Sender<FetchResult>),
    Callback(ResultCallback),
}

impl std::fmt::Debug for Deliver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Queue(_) => f.write_str("Deliver::Queue"),
            Self::Callback(_) => f.write_str("Deliver::Callback"),
        }
    }
}

/// The engine thread: scheduler and reactor under one loop.
///
/// Every channel record, resource and connection is confined to this
/// thread. Callers talk to it through the bounded request queue, the
/// result path and a shutdown flag; nothing else is shared.
#[derive(Debug)]
pub(crate) struct Engine {
    config: Arc<EngineConfig>,
    manager: ChannelManager,
    reactor: Reactor,
    resolver: Resolver,
    tls_config: Arc<rustls::ClientConfig>,
    requests: Receiver<(RequestId, FetchRequest)>,
    deliver: Deliver,
    stats: Arc<ClientStats>,
    shutdown: Arc<AtomicBool>,
    /// Whole-fetch deadlines of still-queued resources
    timeouts: BTreeMap<(Instant, u64), HostId>,
    /// Owning host/server of every exchange in the reactor
    active: HashMap<RequestId, (HostId, ServerId)>,
}

impl Engine {
    /// Build the engine and start its thread.
    pub(crate) fn spawn(
        config: Arc<EngineConfig>,
        resolve: Arc<dyn Resolve>,
        requests: Receiver<(RequestId, FetchRequest)>,
        deliver: Deliver,
        stats: Arc<ClientStats>,
        shutdown: Arc<AtomicBool>,
    ) -> Result<JoinHandle<()>, ErrorKind> {
        let reactor = Reactor::new(config.max_connections, config.rx_speed_max)?;
        let resolver = Resolver::spawn(resolve)?;
        let tls_config = tls::client_config(config.accept_invalid_certs);
        let engine = Self {
            manager: ChannelManager::new(Arc::clone(&config)),
            config,
            reactor,
            resolver,
            tls_config,
            requests,
            deliver,
            stats,
            shutdown,
            timeouts: BTreeMap::new(),
            active: HashMap::new(),
        };
        thread::Builder::new()
            .name("trawl-engine".to_string())
            .spawn(move || engine.run())
            .map_err(ErrorKind::Io)
    }

    fn run(mut self) {
        debug!(
            "engine started, {} connection slots",
            self.config.max_connections
        );
        loop {
            for completed in self.reactor.take_finished() {
                self.handle_completion(completed);
            }
            if self.shutdown.load(Ordering::Relaxed) {
                break;
            }
            if self.drain_requests() {
                // Every client handle is gone; nobody can see further
                // results.
                break;
            }
            self.drain_answers();
            while self.reactor.available() > 0 {
                let Some(dispatch) = self.manager.pop_ready(Instant::now()) else {
                    break;
                };
                self.start_exchange(dispatch);
            }
            self.sweep_queued_deadlines();
            let timeout = self.poll_timeout();
            if let Err(e) = self.reactor.poll(timeout) {
                error!("poller failed: {e}");
                break;
            }
        }
        self.teardown();
    }

    /// Pull inbound requests; `true` means the client side disconnected.
    fn drain_requests(&mut self) -> bool {
        loop {
            match self.requests.try_recv() {
                Ok((id, request)) => {
                    let resource = Resource::new(
                        id,
                        request,
                        &self.config.defaults,
                        &self.config.custom_headers,
                    );
                    self.admit(resource);
                }
                Err(TryRecvError::Empty) => return false,
                Err(TryRecvError::Disconnected) => return true,
            }
        }
    }

    fn drain_answers(&mut self) {
        let answers: Vec<DnsAnswer> = self.resolver.try_answers().collect();
        for answer in answers {
            let now = Instant::now();
            let results = match answer.result {
                Ok(addrs) => self.manager.dns_resolved(answer.host_id, addrs, now),
                Err(reason) => self.manager.dns_failed(answer.host_id, reason, now),
            };
            for result in results {
                self.emit(result);
            }
        }
    }

    /// Queue a resource, indexing its whole-fetch deadline and kicking
    /// off a resolver lookup when the host needs one.
    fn admit(&mut self, resource: Resource) {
        let id = resource.id;
        let deadline = resource.deadline;
        let now = Instant::now();
        match self.manager.add_resource(resource, now) {
            Admission::Queued(host_id) => {
                if let Some(deadline) = deadline {
                    self.timeouts.insert((deadline, id.0), host_id);
                }
            }
            Admission::QueuedDns(host_id, query) => {
                if let Some(deadline) = deadline {
                    self.timeouts.insert((deadline, id.0), host_id);
                }
                if let Err(reason) = self.resolver.submit(query) {
                    for result in self.manager.dns_failed(host_id, reason, now) {
                        self.emit(result);
                    }
                }
            }
            Admission::Rejected(result) => self.emit(*result),
        }
    }

    /// Stage the popped exchange onto its connection and hand both to
    /// the reactor.
    fn start_exchange(&mut self, dispatch: Dispatch) {
        let Dispatch {
            mut resource,
            mut conn,
            host,
            server,
        } = dispatch;
        // Once dispatched, only the response deadline applies.
        if let Some(deadline) = resource.deadline {
            self.timeouts.remove(&(deadline, resource.id.0));
        }
        let target = match resource.host_key() {
            Ok(target) => target,
            Err(kind) => {
                self.manager.release_connection(server, conn, true);
                self.manager.resource_done(host);
                self.emit(resource.fail(kind));
                return;
            }
        };
        if let Err(kind) = self.prepare(&mut resource, &mut conn, &target) {
            self.manager.release_connection(server, conn, false);
            self.manager.resource_done(host);
            self.emit(resource.fail(kind));
            return;
        }
        trace!("dispatching {} to {}", resource.id, conn.addr);
        self.active.insert(resource.id, (host, server));
        if let Err((conn, resource)) = self.reactor.submit(conn, resource) {
            error!("reactor refused an exchange at capacity");
            self.active.remove(&resource.id);
            self.manager.release_connection(server, conn, false);
            self.manager.resource_done(host);
            self.emit(resource.fail(ErrorKind::Canceled));
        }
    }

    /// Stage request bytes, sink and TLS/proxy state for the next hop.
    fn prepare(
        &self,
        resource: &mut Resource,
        conn: &mut Connection,
        target: &HostKey,
    ) -> Result<(), ErrorKind> {
        // A pooled connection pinned to another origin cannot carry
        // this exchange.
        if conn.is_open() && !conn.is_reusable_for(target) {
            conn.close();
        }
        if resource.proxy.is_some() {
            if target.scheme.is_tls() {
                if conn.is_open() && conn.tunnel.as_ref() == Some(target) {
                    // Tunnel and TLS session both survive keep-alive;
                    // skip straight to the request.
                    if let Some(proxy) = &mut resource.proxy {
                        proxy.phase = Some(ProxyPhase::Tunneling);
                    }
                    resource.sink = Some(resource.new_sink());
                    let request = resource.request_bytes(false)?;
                    conn.stage(request, None)?;
                } else {
                    if let Some(proxy) = &mut resource.proxy {
                        proxy.phase = Some(ProxyPhase::Connect);
                    }
                    // CONNECT responses carry no body.
                    resource.sink = Some(HttpResponseSink::new(true, 0));
                    let request = resource.connect_bytes()?;
                    conn.stage(request, None)?;
                }
            } else {
                // Plain HTTP rides the proxy with an absolute-form
                // request line, no tunnel.
                if let Some(proxy) = &mut resource.proxy {
                    proxy.phase = None;
                }
                resource.sink = Some(resource.new_sink());
                let request = resource.request_bytes(true)?;
                conn.stage(request, None)?;
            }
            return Ok(());
        }
        resource.sink = Some(resource.new_sink());
        let request = resource.request_bytes(false)?;
        let tls = if target.scheme.is_tls() {
            let name = tls::server_name(&target.host)?;
            Some((name, Arc::clone(&self.tls_config), target.host.clone()))
        } else {
            None
        };
        conn.stage(request, tls)?;
        Ok(())
    }

    fn handle_completion(&mut self, completed: CompletedExchange) {
        let CompletedExchange {
            resource,
            conn,
            keep_alive,
            error,
            elapsed,
        } = completed;
        let Some(&(host, server)) = self.active.get(&resource.id) else {
            error!("finished exchange {} has no active record", resource.id);
            let kind = error.unwrap_or(ErrorKind::Canceled);
            self.emit(resource.fail(kind));
            return;
        };
        match error {
            Some(kind) => self.fail_exchange(host, server, resource, conn, kind),
            None if resource.needs_connect() => {
                self.finish_connect(host, server, resource, conn);
            }
            None => self.finish_response(host, server, resource, conn, keep_alive, elapsed),
        }
    }

    /// A proxy `CONNECT` exchange finished; on 2xx the same connection
    /// continues with TLS and the real request over the tunnel.
    fn finish_connect(
        &mut self,
        host: HostId,
        server: ServerId,
        mut resource: Resource,
        mut conn: Connection,
    ) {
        let parts = resource.sink.take().and_then(HttpResponseSink::into_parts);
        let Some((code, _, _)) = parts else {
            let kind = ErrorKind::InvalidResponse("proxy sent no response".to_string());
            self.fail_exchange(host, server, resource, conn, kind);
            return;
        };
        if !code.is_success() {
            self.fail_exchange(host, server, resource, conn, ErrorKind::Proxy(code));
            return;
        }
        if !conn.is_open() {
            let kind = ErrorKind::InvalidResponse("proxy closed the tunnel".to_string());
            self.fail_exchange(host, server, resource, conn, kind);
            return;
        }
        if let Err(kind) = self.stage_tunnel(&mut resource, &mut conn) {
            self.fail_exchange(host, server, resource, conn, kind);
            return;
        }
        // The active record stays; this is the same logical fetch.
        if let Err((conn, resource)) = self.reactor.submit(conn, resource) {
            self.fail_exchange(host, server, resource, conn, ErrorKind::Canceled);
        }
    }

    /// Switch a connection whose `CONNECT` succeeded over to the
    /// origin: pin the tunnel, layer TLS, stage the real request.
    fn stage_tunnel(&self, resource: &mut Resource, conn: &mut Connection) -> Result<(), ErrorKind> {
        let target = resource.host_key()?;
        conn.tunnel = Some(target.clone());
        if target.scheme.is_tls() {
            let name = tls::server_name(&target.host)?;
            conn.start_tls(name, Arc::clone(&self.tls_config), target.host.clone())?;
        }
        let request = resource.request_bytes(false)?;
        conn.stage(request, None)?;
        resource.sink = Some(resource.new_sink());
        if let Some(proxy) = &mut resource.proxy {
            proxy.phase = Some(ProxyPhase::Tunneling);
        }
        debug!("tunnel to {target} established");
        Ok(())
    }

    /// Interpret a complete response: follow a redirect, or deliver.
    fn finish_response(
        &mut self,
        host: HostId,
        server: ServerId,
        mut resource: Resource,
        conn: Connection,
        keep_alive: bool,
        elapsed: Duration,
    ) {
        let parts = resource.sink.take().and_then(HttpResponseSink::into_parts);
        let Some((code, headers, raw_body)) = parts else {
            let kind = ErrorKind::InvalidResponse("incomplete response".to_string());
            self.fail_exchange(host, server, resource, conn, kind);
            return;
        };
        self.active.remove(&resource.id);
        self.manager.release_connection(server, conn, keep_alive);
        // Server errors feed the breaker; everything the server
        // answered coherently counts as healthy.
        if code.is_server_error() {
            if self.manager.record_failure(server) {
                for result in self.manager.break_server(server) {
                    self.emit(result);
                }
            }
        } else {
            self.manager.record_success(server, elapsed);
        }
        self.manager.resource_done(host);

        let body = if resource.config.decompress {
            match decode_body(&headers, raw_body) {
                Ok(body) => body,
                Err(kind) => {
                    self.emit(resource.fail(kind));
                    return;
                }
            }
        } else {
            raw_body
        };
        match redirect::plan(&resource, code, &headers, &body) {
            Ok(Some(plan)) => {
                trace!("{} redirects to {}", resource.url, plan.target);
                redirect::apply(&mut resource, plan);
                self.admit(resource);
            }
            Ok(None) if code.is_success() => {
                let status = Status::Fetched(Document {
                    code,
                    headers,
                    body,
                });
                self.emit(resource.into_result(status));
            }
            Ok(None) => self.emit(resource.fail(ErrorKind::Http(code))),
            Err(kind) => self.emit(resource.fail(kind)),
        }
    }

    /// Terminal failure of a dispatched exchange: return the slot,
    /// update the breaker, deliver the error.
    fn fail_exchange(
        &mut self,
        host: HostId,
        server: ServerId,
        resource: Resource,
        conn: Connection,
        kind: ErrorKind,
    ) {
        self.active.remove(&resource.id);
        self.manager.release_connection(server, conn, false);
        if kind.counts_against_server() && self.manager.record_failure(server) {
            for result in self.manager.break_server(server) {
                self.emit(result);
            }
        }
        self.manager.resource_done(host);
        self.emit(resource.fail(kind));
    }

    /// Fail still-queued resources whose whole-fetch deadline passed.
    /// Nothing here touches the network.
    fn sweep_queued_deadlines(&mut self) {
        let now = Instant::now();
        loop {
            let Some((&(deadline, id), &host_id)) = self.timeouts.first_key_value() else {
                break;
            };
            if deadline > now {
                break;
            }
            self.timeouts.remove(&(deadline, id));
            let Some(resource) = self.manager.remove_queued(host_id, RequestId(id)) else {
                continue;
            };
            let waited = resource.config.timeout.unwrap_or_default();
            debug!("request {} timed out before dispatch", resource.id);
            self.emit(resource.fail(ErrorKind::QueuedTimeout(waited)));
        }
    }

    fn poll_timeout(&self) -> Duration {
        let now = Instant::now();
        let mut timeout = IDLE_TICK;
        if let Some(at) = self.manager.next_ready_at(now) {
            timeout = timeout.min(at.saturating_duration_since(now));
        }
        if let Some((&(deadline, _), _)) = self.timeouts.first_key_value() {
            timeout = timeout.min(deadline.saturating_duration_since(now));
        }
        timeout
    }

    fn emit(&mut self, result: FetchResult) {
        self.stats.record_result(&result);
        match &self.deliver {
            Deliver::Queue(tx) => match tx.send_timeout(result, RESULT_PATIENCE) {
                Ok(()) => {}
                Err(SendTimeoutError::Timeout(result)) => {
                    warn!("result queue full, dropping result for {}", result.url);
                }
                Err(SendTimeoutError::Disconnected(_)) => {}
            },
            Deliver::Callback(callback) => callback.call(result),
        }
    }

    fn teardown(&mut self) {
        debug!("engine stopping");
        self.reactor.close_all();
        for completed in self.reactor.take_finished() {
            self.handle_completion(completed);
        }
        for result in self.manager.shutdown() {
            self.emit(result);
        }
        // Requests accepted into the inbound queue but never picked up
        // still owe the caller a result.
        while let Ok((id, request)) = self.requests.try_recv() {
            let resource = Resource::new(
                id,
                request,
                &self.config.defaults,
                &self.config.custom_headers,
            );
            self.emit(resource.fail(ErrorKind::Canceled));
        }
    }
}
