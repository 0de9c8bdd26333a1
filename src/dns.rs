use std::fmt::Debug;
use std::io;
use std::net::{IpAddr, SocketAddr, ToSocketAddrs};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{Receiver, Sender, bounded};
use log::trace;

use crate::channel::{DnsQuery, HostId};

const QUEUE_DEPTH: usize = 256;
const ANSWER_PATIENCE: Duration = Duration::from_secs(1);

/// Hostname to address-set resolution.
///
/// Implementations run on the resolver worker thread, so a slow lookup
/// never stalls the engine loop. The error is a plain string; the
/// engine only carries it into the result's failure reason.
pub trait Resolve: Send + Sync + Debug + 'static {
    fn resolve(&self, host: &str, port: u16) -> Result<Vec<SocketAddr>, String>;
}

/// System resolver, `getaddrinfo` via `ToSocketAddrs`.
#[derive(Debug, Clone, Copy, Default)]
pub struct GaiResolver;

impl Resolve for GaiResolver {
    fn resolve(&self, host: &str, port: u16) -> Result<Vec<SocketAddr>, String> {
        // IP literals skip the system resolver. IPv6 hosts arrive
        // bracketed from the URL authority.
        let bare = host
            .strip_prefix('[')
            .and_then(|h| h.strip_suffix(']'))
            .unwrap_or(host);
        if let Ok(ip) = bare.parse::<IpAddr>() {
            return Ok(vec![SocketAddr::new(ip, port)]);
        }
        let addrs: Vec<SocketAddr> = (bare, port)
            .to_socket_addrs()
            .map_err(|e| e.to_string())?
            .collect();
        if addrs.is_empty() {
            return Err("resolved to no addresses".to_string());
        }
        Ok(addrs)
    }
}

/// A finished lookup on its way back to the engine loop.
#[derive(Debug)]
pub(crate) struct DnsAnswer {
    pub host_id: HostId,
    pub result: Result<Vec<SocketAddr>, String>,
}

/// Handle to the resolver worker thread.
///
/// Jobs go out on a bounded queue and answers come back on another;
/// the engine polls answers in its loop. Dropping the handle closes
/// the job queue and joins the worker.
#[derive(Debug)]
pub(crate) struct Resolver {
    jobs: Option<Sender<DnsQuery>>,
    answers: Receiver<DnsAnswer>,
    handle: Option<JoinHandle<()>>,
}

impl Resolver {
    pub(crate) fn spawn(resolver: Arc<dyn Resolve>) -> io::Result<Self> {
        let (job_tx, job_rx) = bounded::<DnsQuery>(QUEUE_DEPTH);
        let (answer_tx, answer_rx) = bounded::<DnsAnswer>(QUEUE_DEPTH);
        let handle = thread::Builder::new()
            .name("trawl-dns".to_string())
            .spawn(move || worker(&*resolver, &job_rx, &answer_tx))?;
        Ok(Self {
            jobs: Some(job_tx),
            answers: answer_rx,
            handle: Some(handle),
        })
    }

    /// Hand a lookup to the worker without blocking.
    pub(crate) fn submit(&self, query: DnsQuery) -> Result<(), String> {
        let Some(jobs) = &self.jobs else {
            return Err("resolver stopped".to_string());
        };
        jobs.try_send(query)
            .map_err(|_| "resolver queue full".to_string())
    }

    /// Drain whatever answers have arrived.
    pub(crate) fn try_answers(&self) -> impl Iterator<Item = DnsAnswer> + '_ {
        self.answers.try_iter()
    }
}

impl Drop for Resolver {
    fn drop(&mut self) {
        // Closing the job queue lets the worker run down; then join.
        self.jobs.take();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

fn worker(resolver: &dyn Resolve, jobs: &Receiver<DnsQuery>, answers: &Sender<DnsAnswer>) {
    for job in jobs {
        trace!("resolving {}:{}", job.name, job.port);
        let result = resolver.resolve(&job.name, job.port);
        let answer = DnsAnswer {
            host_id: job.host_id,
            result,
        };
        // A full answer queue means the engine stopped draining;
        // give it a moment, then let the answer go.
        if answers.send_timeout(answer, ANSWER_PATIENCE).is_err() {
            break;
        }
    }
}
