use std::io::{self, Read, Write};
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Instant;

use mio::net::TcpStream;
use rustls::pki_types::ServerName;
use rustls::{ClientConfig, ClientConnection};

use crate::ErrorKind;
use crate::channel::HostKey;

/// Which readiness a blocked operation is waiting for.
///
/// TLS decouples the logical direction from the socket direction: a
/// handshake step that is logically "connecting" may be blocked on
/// either a read or a write, and the poller has to know which.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Want {
    Read,
    Write,
}

/// Life cycle of one connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ConnState {
    /// No socket
    Closed,
    /// Non-blocking connect in flight, waiting for writability
    Connecting,
    /// TLS handshake in progress, blocked in the given direction
    Handshaking(Want),
    /// Request bytes draining to the peer
    Sending(Want),
    /// Response bytes streaming into the sink
    Reading(Want),
    /// Exchange complete; the socket is idle and may be reused
    Finished,
}

/// Progress of a send after a readiness event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Flow {
    /// The request is fully flushed
    Done,
    /// Blocked; re-arm for the given readiness
    Blocked(Want),
}

/// Outcome of one read attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ReadEvent {
    /// `n` plaintext bytes were placed into the scratch buffer
    Data(usize),
    /// The peer closed the stream
    Eof,
    /// Blocked; re-arm for the given readiness
    Blocked(Want),
}

/// One TCP connection to one resolved address, possibly TLS-wrapped,
/// possibly tunneled through a proxy.
///
/// Connections are owned by a server record's pool while idle and by a
/// reactor slot while an exchange runs. They never share a thread
/// boundary.
#[derive(Debug)]
pub(crate) struct Connection {
    /// Resolved address this connection dials
    pub(crate) addr: SocketAddr,
    /// Local address to bind before connecting
    pub(crate) local: Option<IpAddr>,
    pub(crate) state: ConnState,
    stream: Option<TcpStream>,
    tls: Option<ClientConnection>,
    /// Host name the TLS session was established for
    tls_host: Option<String>,
    /// Whether the current request has been handed to the TLS writer
    tls_buffered: bool,
    write_buf: Vec<u8>,
    written: usize,
    /// Origin a `CONNECT` tunnel has been established to, sticky across
    /// keep-alive reuse
    pub(crate) tunnel: Option<HostKey>,
    pub(crate) last_used: Instant,
}

impl Connection {
    pub(crate) fn new(addr: SocketAddr, local: Option<IpAddr>) -> Self {
        Self {
            addr,
            local,
            state: ConnState::Closed,
            stream: None,
            tls: None,
            tls_host: None,
            tls_buffered: false,
            write_buf: Vec::new(),
            written: 0,
            tunnel: None,
            last_used: Instant::now(),
        }
    }

    /// A new unconnected connection with the same dialing identity.
    pub(crate) fn fresh(&self) -> Self {
        Self::new(self.addr, self.local)
    }

    pub(crate) const fn is_open(&self) -> bool {
        self.stream.is_some()
    }

    pub(crate) fn socket_mut(&mut self) -> Option<&mut TcpStream> {
        self.stream.as_mut()
    }

    /// Whether a leased pooled connection can carry an exchange to
    /// `host` without a fresh handshake.
    ///
    /// Plain connections serve any host behind the same address; a TLS
    /// session is pinned to the name it authenticated, and a proxy
    /// tunnel to the origin it was established for.
    pub(crate) fn is_reusable_for(&self, host: &HostKey) -> bool {
        if !matches!(self.state, ConnState::Finished) || self.stream.is_none() {
            return false;
        }
        match (&self.tunnel, &self.tls_host) {
            (Some(tunnel), _) => tunnel == host,
            (None, Some(tls_host)) => tls_host == &host.host,
            (None, None) => true,
        }
    }

    /// Stage the next exchange: request bytes plus, for TLS targets
    /// without a live session, the handshake parameters.
    ///
    /// Does not touch the network; the reactor opens or re-checks the
    /// socket when the connection is submitted.
    pub(crate) fn stage(
        &mut self,
        request: Vec<u8>,
        tls: Option<(ServerName<'static>, Arc<ClientConfig>, String)>,
    ) -> Result<(), ErrorKind> {
        self.write_buf = request;
        self.written = 0;
        self.tls_buffered = false;
        if let Some((name, config, host)) = tls {
            if self.tls.is_none() {
                self.tls = Some(ClientConnection::new(config, name)?);
                self.tls_host = Some(host);
            }
        }
        self.state = if self.stream.is_some() {
            // Reused socket: the reactor re-checks it with SO_ERROR on
            // the first writability event, same as a fresh connect.
            ConnState::Finished
        } else {
            ConnState::Closed
        };
        Ok(())
    }

    /// Wrap an established tunnel in TLS to the origin.
    pub(crate) fn start_tls(
        &mut self,
        name: ServerName<'static>,
        config: Arc<ClientConfig>,
        host: String,
    ) -> Result<(), ErrorKind> {
        self.tls = Some(ClientConnection::new(config, name)?);
        self.tls_host = Some(host);
        self.tls_buffered = false;
        Ok(())
    }

    pub(crate) fn needs_handshake(&self) -> bool {
        self.tls.as_ref().is_some_and(|tls| tls.is_handshaking())
    }

    /// Begin the non-blocking connect.
    pub(crate) fn open(&mut self) -> io::Result<()> {
        let stream = match self.local {
            None => TcpStream::connect(self.addr)?,
            Some(ip) => {
                let domain = socket2::Domain::for_address(self.addr);
                let socket =
                    socket2::Socket::new(domain, socket2::Type::STREAM, Some(socket2::Protocol::TCP))?;
                socket.set_nonblocking(true)?;
                socket.bind(&SocketAddr::new(ip, 0).into())?;
                match socket.connect(&self.addr.into()) {
                    Ok(()) => {}
                    Err(e) if connect_in_progress(&e) => {}
                    Err(e) => return Err(e),
                }
                TcpStream::from_std(socket.into())
            }
        };
        let _ = stream.set_nodelay(true);
        self.stream = Some(stream);
        self.state = ConnState::Connecting;
        Ok(())
    }

    /// Resolve a pending connect after a writability event.
    ///
    /// `Ok(true)` means the socket is connected, `Ok(false)` a spurious
    /// wakeup, `Err` the `SO_ERROR` the kernel recorded.
    pub(crate) fn connect_finished(&mut self) -> io::Result<bool> {
        let stream = self.stream_mut()?;
        if let Some(e) = stream.take_error()? {
            return Err(e);
        }
        match stream.peer_addr() {
            Ok(_) => Ok(true),
            Err(e)
                if e.kind() == io::ErrorKind::NotConnected
                    || connect_in_progress(&e) =>
            {
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    /// Run the TLS handshake as far as the socket allows.
    ///
    /// `Ok(None)` means the handshake is complete.
    pub(crate) fn drive_handshake(&mut self) -> Result<Option<Want>, ErrorKind> {
        let (Some(tls), Some(stream)) = (&mut self.tls, &mut self.stream) else {
            return Err(ErrorKind::Io(io::Error::from(io::ErrorKind::NotConnected)));
        };
        while tls.is_handshaking() {
            if tls.wants_write() {
                match tls.write_tls(stream) {
                    Ok(_) => {}
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                        return Ok(Some(Want::Write));
                    }
                    Err(e) => return Err(ErrorKind::Io(e)),
                }
            } else if tls.wants_read() {
                match tls.read_tls(stream) {
                    Ok(0) => {
                        return Err(ErrorKind::Io(io::Error::from(
                            io::ErrorKind::UnexpectedEof,
                        )));
                    }
                    Ok(_) => {
                        if let Err(e) = tls.process_new_packets() {
                            // Flush the alert we owe the peer before
                            // reporting the failure.
                            let _ = tls.write_tls(stream);
                            return Err(ErrorKind::Tls(e));
                        }
                    }
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                        return Ok(Some(Want::Read));
                    }
                    Err(e) => return Err(ErrorKind::Io(e)),
                }
            } else {
                break;
            }
        }
        Ok(None)
    }

    /// Push request bytes toward the peer.
    pub(crate) fn drive_send(&mut self) -> Result<Flow, ErrorKind> {
        if self.tls.is_some() {
            if !self.tls_buffered {
                let Some(tls) = &mut self.tls else {
                    return Err(ErrorKind::Io(io::Error::from(io::ErrorKind::NotConnected)));
                };
                tls.writer()
                    .write_all(&self.write_buf)
                    .map_err(ErrorKind::Io)?;
                self.tls_buffered = true;
            }
            let (Some(tls), Some(stream)) = (&mut self.tls, &mut self.stream) else {
                return Err(ErrorKind::Io(io::Error::from(io::ErrorKind::NotConnected)));
            };
            while tls.wants_write() {
                match tls.write_tls(stream) {
                    Ok(_) => {}
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                        return Ok(Flow::Blocked(Want::Write));
                    }
                    Err(e) => return Err(ErrorKind::Io(e)),
                }
            }
            Ok(Flow::Done)
        } else {
            let Some(stream) = self.stream.as_mut() else {
                return Err(ErrorKind::Io(io::Error::from(io::ErrorKind::NotConnected)));
            };
            while self.written < self.write_buf.len() {
                match stream.write(&self.write_buf[self.written..]) {
                    Ok(0) => {
                        return Err(ErrorKind::Io(io::Error::from(io::ErrorKind::WriteZero)));
                    }
                    Ok(n) => self.written += n,
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                        return Ok(Flow::Blocked(Want::Write));
                    }
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                    Err(e) => return Err(ErrorKind::Io(e)),
                }
            }
            Ok(Flow::Done)
        }
    }

    /// Pull response bytes into `buf`.
    pub(crate) fn drive_read(&mut self, buf: &mut [u8]) -> Result<ReadEvent, ErrorKind> {
        if self.tls.is_none() {
            let stream = self.stream_mut().map_err(ErrorKind::Io)?;
            return loop {
                match stream.read(buf) {
                    Ok(0) => break Ok(ReadEvent::Eof),
                    Ok(n) => break Ok(ReadEvent::Data(n)),
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                        break Ok(ReadEvent::Blocked(Want::Read));
                    }
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                    Err(e) => break Err(ErrorKind::Io(e)),
                }
            };
        }

        let (Some(tls), Some(stream)) = (&mut self.tls, &mut self.stream) else {
            return Err(ErrorKind::Io(io::Error::from(io::ErrorKind::NotConnected)));
        };
        let mut saw_tcp_eof = false;
        loop {
            match tls.reader().read(buf) {
                Ok(0) => return Ok(ReadEvent::Eof),
                Ok(n) => return Ok(ReadEvent::Data(n)),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
                // A peer that drops the link without close_notify still
                // ends the stream; the sink judges whether the message
                // was complete.
                Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
                    return Ok(ReadEvent::Eof);
                }
                Err(e) => return Err(ErrorKind::Io(e)),
            }
            if saw_tcp_eof {
                return Ok(ReadEvent::Eof);
            }
            match tls.read_tls(stream) {
                Ok(0) => saw_tcp_eof = true,
                Ok(_) => {}
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    return Ok(ReadEvent::Blocked(Want::Read));
                }
                Err(e) => return Err(ErrorKind::Io(e)),
            }
            if let Err(e) = tls.process_new_packets() {
                let _ = tls.write_tls(stream);
                return Err(ErrorKind::Tls(e));
            }
        }
    }

    /// Tear the transport down, politely closing a TLS session.
    pub(crate) fn close(&mut self) {
        if let (Some(tls), Some(stream)) = (&mut self.tls, &mut self.stream) {
            tls.send_close_notify();
            let _ = tls.write_tls(stream);
        }
        self.stream = None;
        self.tls = None;
        self.tls_host = None;
        self.tls_buffered = false;
        self.write_buf.clear();
        self.written = 0;
        self.tunnel = None;
        self.state = ConnState::Closed;
    }

    /// Finish an exchange, keeping the transport for reuse.
    pub(crate) fn finish_keep_alive(&mut self) {
        self.write_buf.clear();
        self.written = 0;
        self.tls_buffered = false;
        self.last_used = Instant::now();
        self.state = ConnState::Finished;
    }

    fn stream_mut(&mut self) -> io::Result<&mut TcpStream> {
        self.stream
            .as_mut()
            .ok_or_else(|| io::Error::from(io::ErrorKind::NotConnected))
    }
}

/// Non-blocking `connect(2)` reports readiness later; these errors mean
/// "in progress", not failure.
fn connect_in_progress(e: &io::Error) -> bool {
    #[cfg(unix)]
    if e.raw_os_error() == Some(libc::EINPROGRESS) {
        return true;
    }
    e.kind() == io::ErrorKind::WouldBlock
}
