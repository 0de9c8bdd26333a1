//! The I/O core: a `mio` poll loop driving every active exchange
//! through its connection state machine.
//!
//! The reactor owns nothing but sockets and in-flight exchanges. It
//! does not know about hosts, politeness or retries; it is handed a
//! staged connection plus a resource, runs the exchange to a terminal
//! state and parks the outcome for the engine to collect.

pub(crate) mod conn;
mod throttle;
pub(crate) mod tls;

use std::io;
use std::thread;
use std::time::{Duration, Instant};

use log::{debug, trace};
use mio::{Events, Interest, Poll, Token};

use crate::ErrorKind;
use crate::message::{Append, MessageSink};
use crate::reactor::conn::{ConnState, Connection, Flow, ReadEvent, Want};
use crate::reactor::throttle::Throttle;
use crate::resource::Resource;

const EVENT_CAPACITY: usize = 1024;
const SCRATCH_BYTES: usize = 16 * 1024;

/// One in-flight exchange: a connection, the resource driving it, and
/// the response deadline.
#[derive(Debug)]
struct Exchange {
    conn: Connection,
    resource: Resource,
    started: Instant,
    due: Instant,
    /// Readiness we want next
    want: Option<Want>,
    /// Readiness the poller is currently armed for
    registered: Option<Want>,
}

/// A finished exchange on its way back to the engine.
#[derive(Debug)]
pub(crate) struct CompletedExchange {
    pub resource: Resource,
    pub conn: Connection,
    /// Whether the transport survived and may return to the pool
    pub keep_alive: bool,
    /// `None` is success; the response still has to be interpreted
    pub error: Option<ErrorKind>,
    pub elapsed: Duration,
}

/// Progress of one exchange after a readiness event.
enum Step {
    Continue,
    Done { error: Option<ErrorKind> },
}

#[derive(Debug)]
pub(crate) struct Reactor {
    poll: Poll,
    events: Events,
    slots: Vec<Option<Exchange>>,
    free: Vec<usize>,
    /// Submitted but not yet opened/registered
    pending: Vec<usize>,
    finished: Vec<CompletedExchange>,
    throttle: Throttle,
    scratch: Vec<u8>,
    capacity: usize,
    active: usize,
}

impl Reactor {
    pub(crate) fn new(capacity: usize, rx_speed_max: Option<u64>) -> io::Result<Self> {
        Ok(Self {
            poll: Poll::new()?,
            events: Events::with_capacity(EVENT_CAPACITY),
            slots: Vec::new(),
            free: Vec::new(),
            pending: Vec::new(),
            finished: Vec::new(),
            throttle: Throttle::new(rx_speed_max),
            scratch: vec![0; SCRATCH_BYTES],
            capacity: capacity.max(1),
            active: 0,
        })
    }

    /// Free admission slots.
    pub(crate) fn available(&self) -> usize {
        self.capacity.saturating_sub(self.active)
    }

    pub(crate) const fn in_flight(&self) -> usize {
        self.active
    }

    /// Admit a staged exchange. The socket is opened and registered on
    /// the next `poll`. At capacity, both halves come back unchanged.
    pub(crate) fn submit(
        &mut self,
        conn: Connection,
        mut resource: Resource,
    ) -> Result<(), (Connection, Resource)> {
        if self.available() == 0 {
            return Err((conn, resource));
        }
        let started = Instant::now();
        resource.first_dispatch.get_or_insert(started);
        let mut due = started + resource.config.response_timeout;
        if let Some(deadline) = resource.deadline {
            due = due.min(deadline);
        }
        let exchange = Exchange {
            conn,
            resource,
            started,
            due,
            want: None,
            registered: None,
        };
        let idx = match self.free.pop() {
            Some(idx) => {
                self.slots[idx] = Some(exchange);
                idx
            }
            None => {
                self.slots.push(Some(exchange));
                self.slots.len() - 1
            }
        };
        self.pending.push(idx);
        self.active += 1;
        Ok(())
    }

    /// One reactor turn: open what is pending, wait for readiness at
    /// most `timeout`, drive the affected exchanges, sweep deadlines.
    pub(crate) fn poll(&mut self, timeout: Duration) -> io::Result<()> {
        self.register_pending();
        let mut wait = timeout;
        if self.active > 0 {
            let now = Instant::now();
            if let Some(nearest) = self.slots.iter().flatten().map(|ex| ex.due).min() {
                wait = wait.min(nearest.saturating_duration_since(now));
            }
        }
        if !self.finished.is_empty() {
            wait = Duration::ZERO;
        }
        match self.poll.poll(&mut self.events, Some(wait)) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::Interrupted => return Ok(()),
            Err(e) => return Err(e),
        }
        let tokens: Vec<usize> = self.events.iter().map(|event| event.token().0).collect();
        for idx in tokens {
            self.drive(idx);
        }
        self.sweep_deadlines();
        if let Some(pause) = self.throttle.pause(Instant::now()) {
            trace!("receive budget spent, pausing {pause:?}");
            thread::sleep(pause);
        }
        Ok(())
    }

    /// Collect every exchange that reached a terminal state.
    pub(crate) fn take_finished(&mut self) -> Vec<CompletedExchange> {
        std::mem::take(&mut self.finished)
    }

    /// Fail everything still in flight, e.g. at shutdown.
    pub(crate) fn close_all(&mut self) {
        let occupied: Vec<usize> = self
            .slots
            .iter()
            .enumerate()
            .filter_map(|(idx, slot)| slot.as_ref().map(|_| idx))
            .collect();
        for idx in occupied {
            self.complete(idx, Some(ErrorKind::Canceled));
        }
        self.pending.clear();
    }

    fn register_pending(&mut self) {
        for idx in std::mem::take(&mut self.pending) {
            if let Err(e) = self.arm(idx) {
                self.complete(idx, Some(e));
            }
        }
    }

    /// Open the socket if needed and register for the first
    /// writability event.
    fn arm(&mut self, idx: usize) -> Result<(), ErrorKind> {
        let Some(exchange) = self.slots.get_mut(idx).and_then(Option::as_mut) else {
            return Ok(());
        };
        if !exchange.conn.is_open() {
            exchange.conn.open().map_err(ErrorKind::Io)?;
        }
        let Some(stream) = exchange.conn.socket_mut() else {
            return Err(ErrorKind::Io(io::Error::from(io::ErrorKind::NotConnected)));
        };
        self.poll
            .registry()
            .register(stream, Token(idx), Interest::WRITABLE)
            .map_err(ErrorKind::Io)?;
        exchange.want = Some(Want::Write);
        exchange.registered = Some(Want::Write);
        Ok(())
    }

    fn drive(&mut self, idx: usize) {
        let now = Instant::now();
        let outcome = {
            let Some(exchange) = self.slots.get_mut(idx).and_then(Option::as_mut) else {
                return;
            };
            step(exchange, &mut self.scratch, &mut self.throttle, now)
        };
        match outcome {
            Step::Continue => self.rearm(idx),
            Step::Done { error } => self.complete(idx, error),
        }
    }

    /// Adjust poller interest when the wanted readiness changed.
    /// Edge-triggered readiness re-fires without help as long as the
    /// interest set stays the same.
    fn rearm(&mut self, idx: usize) {
        let Some(exchange) = self.slots.get_mut(idx).and_then(Option::as_mut) else {
            return;
        };
        let (Some(want), Some(registered)) = (exchange.want, exchange.registered) else {
            return;
        };
        if want == registered {
            return;
        }
        let Some(stream) = exchange.conn.socket_mut() else {
            return;
        };
        let interest = match want {
            Want::Read => Interest::READABLE,
            Want::Write => Interest::WRITABLE,
        };
        if self
            .poll
            .registry()
            .reregister(stream, Token(idx), interest)
            .is_ok()
        {
            exchange.registered = Some(want);
        }
    }

    fn sweep_deadlines(&mut self) {
        let now = Instant::now();
        let overdue: Vec<(usize, Duration)> = self
            .slots
            .iter()
            .enumerate()
            .filter_map(|(idx, slot)| {
                slot.as_ref()
                    .filter(|ex| ex.due <= now)
                    .map(|ex| (idx, ex.resource.config.response_timeout))
            })
            .collect();
        for (idx, timeout) in overdue {
            debug!("exchange {idx} exceeded its response deadline");
            self.complete(idx, Some(ErrorKind::ResponseTimeout(timeout)));
        }
    }

    fn complete(&mut self, idx: usize, error: Option<ErrorKind>) {
        let Some(mut exchange) = self.slots.get_mut(idx).and_then(Option::take) else {
            return;
        };
        self.free.push(idx);
        self.active -= 1;
        if exchange.registered.is_some() {
            if let Some(stream) = exchange.conn.socket_mut() {
                let _ = self.poll.registry().deregister(stream);
            }
        }
        let keep_alive = error.is_none()
            && exchange
                .resource
                .sink
                .as_ref()
                .is_some_and(MessageSink::is_keep_alive);
        if keep_alive {
            exchange.conn.finish_keep_alive();
        } else {
            exchange.conn.close();
        }
        self.finished.push(CompletedExchange {
            resource: exchange.resource,
            conn: exchange.conn,
            keep_alive,
            error,
            elapsed: exchange.started.elapsed(),
        });
    }
}

/// Advance one exchange as far as the socket allows.
fn step(
    exchange: &mut Exchange,
    scratch: &mut [u8],
    throttle: &mut Throttle,
    now: Instant,
) -> Step {
    loop {
        match exchange.conn.state {
            ConnState::Closed => {
                return Step::Done {
                    error: Some(ErrorKind::Io(io::Error::from(io::ErrorKind::NotConnected))),
                };
            }
            // A reused pooled socket re-enters here; the SO_ERROR check
            // doubles as a liveness probe before the request goes out.
            ConnState::Connecting | ConnState::Finished => {
                match exchange.conn.connect_finished() {
                    Ok(true) => {
                        exchange.conn.state = if exchange.conn.needs_handshake() {
                            ConnState::Handshaking(Want::Write)
                        } else {
                            ConnState::Sending(Want::Write)
                        };
                    }
                    Ok(false) => {
                        exchange.want = Some(Want::Write);
                        return Step::Continue;
                    }
                    Err(e) => return Step::Done { error: Some(ErrorKind::Io(e)) },
                }
            }
            ConnState::Handshaking(_) => match exchange.conn.drive_handshake() {
                Ok(None) => exchange.conn.state = ConnState::Sending(Want::Write),
                Ok(Some(want)) => {
                    exchange.conn.state = ConnState::Handshaking(want);
                    exchange.want = Some(want);
                    return Step::Continue;
                }
                Err(e) => return Step::Done { error: Some(e) },
            },
            ConnState::Sending(_) => match exchange.conn.drive_send() {
                // Fall through to reading: with TLS the handshake may
                // already have pulled response records off the wire.
                Ok(Flow::Done) => exchange.conn.state = ConnState::Reading(Want::Read),
                Ok(Flow::Blocked(want)) => {
                    exchange.conn.state = ConnState::Sending(want);
                    exchange.want = Some(want);
                    return Step::Continue;
                }
                Err(e) => return Step::Done { error: Some(e) },
            },
            ConnState::Reading(_) => loop {
                match exchange.conn.drive_read(scratch) {
                    Ok(ReadEvent::Data(n)) => {
                        throttle.on_read(n, now);
                        let Some(sink) = exchange.resource.sink.as_mut() else {
                            return Step::Done {
                                error: Some(ErrorKind::InvalidResponse(
                                    "no response sink attached".to_string(),
                                )),
                            };
                        };
                        match sink.append(&scratch[..n]) {
                            Append::Complete => return Step::Done { error: None },
                            Append::More => {}
                            Append::Invalid(kind) => return Step::Done { error: Some(kind) },
                        }
                    }
                    Ok(ReadEvent::Eof) => {
                        let Some(sink) = exchange.resource.sink.as_mut() else {
                            return Step::Done {
                                error: Some(ErrorKind::InvalidResponse(
                                    "no response sink attached".to_string(),
                                )),
                            };
                        };
                        return match sink.eof() {
                            Append::Complete => Step::Done { error: None },
                            Append::Invalid(kind) => Step::Done { error: Some(kind) },
                            Append::More => Step::Done {
                                error: Some(ErrorKind::InvalidResponse(
                                    "connection closed mid-response".to_string(),
                                )),
                            },
                        };
                    }
                    Ok(ReadEvent::Blocked(want)) => {
                        exchange.conn.state = ConnState::Reading(want);
                        exchange.want = Some(want);
                        return Step::Continue;
                    }
                    Err(e) => return Step::Done { error: Some(e) },
                }
            },
        }
    }
}
