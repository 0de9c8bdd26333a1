//! Shared test helpers.
//!
//! The mock server is a real TCP listener on a loopback port serving
//! canned HTTP/1.1 responses. It speaks just enough HTTP to honor
//! keep-alive, request bodies and `HEAD`, so connection-reuse paths
//! get exercised over actual sockets.

use std::collections::VecDeque;
use std::io::{Read as _, Write as _};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::{Arc, Mutex};
use std::thread;

use url::Url;

/// Serialize an HTTP/1.1 response with a `Content-Length` header.
pub(crate) fn http_response(
    code: u16,
    reason: &str,
    headers: &[(&str, &str)],
    body: &[u8],
) -> Vec<u8> {
    let mut response = format!("HTTP/1.1 {code} {reason}\r\n").into_bytes();
    for (name, value) in headers {
        response.extend_from_slice(format!("{name}: {value}\r\n").as_bytes());
    }
    response.extend_from_slice(format!("Content-Length: {}\r\n\r\n", body.len()).as_bytes());
    response.extend_from_slice(body);
    response
}

/// A canned-response HTTP server on a loopback port.
///
/// # Panics
///
/// Panics on socket errors, so it should only be used for testing.
pub(crate) struct MockServer {
    addr: SocketAddr,
    requests: Arc<Mutex<Vec<Vec<u8>>>>,
}

impl MockServer {
    /// Serve `response` to every request, on every connection.
    pub(crate) fn respond_with(response: Vec<u8>) -> Self {
        Self::start(move |_| Some(response.clone()))
    }

    /// Serve scripted responses in request order, across connections.
    /// Once the script runs out, connections close without a response.
    pub(crate) fn respond_in_order(responses: Vec<Vec<u8>>) -> Self {
        let script = Mutex::new(VecDeque::from(responses));
        Self::start(move |_| script.lock().unwrap().pop_front())
    }

    fn start(next: impl Fn(&[u8]) -> Option<Vec<u8>> + Send + Sync + 'static) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let requests = Arc::new(Mutex::new(Vec::new()));
        let seen = Arc::clone(&requests);
        let next = Arc::new(next);
        thread::spawn(move || {
            for stream in listener.incoming() {
                let Ok(stream) = stream else { break };
                let next = Arc::clone(&next);
                let seen = Arc::clone(&seen);
                thread::spawn(move || serve(stream, &*next, &seen));
            }
        });
        Self { addr, requests }
    }

    pub(crate) fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Base URL of the server.
    pub(crate) fn url(&self) -> Url {
        Url::parse(&format!("http://{}/", self.addr)).unwrap()
    }

    /// URL of `path` on the server.
    pub(crate) fn url_for(&self, path: &str) -> Url {
        self.url().join(path).unwrap()
    }

    /// Raw requests received so far, in arrival order.
    pub(crate) fn requests(&self) -> Vec<Vec<u8>> {
        self.requests.lock().unwrap().clone()
    }
}

/// Answer requests on one connection until the script runs out or the
/// peer hangs up.
fn serve(
    mut stream: TcpStream,
    next: &dyn Fn(&[u8]) -> Option<Vec<u8>>,
    seen: &Mutex<Vec<Vec<u8>>>,
) {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 4096];
    loop {
        let head_end = loop {
            if let Some(pos) = find_head_end(&buf) {
                break pos;
            }
            match stream.read(&mut chunk) {
                Ok(0) | Err(_) => return,
                Ok(n) => buf.extend_from_slice(&chunk[..n]),
            }
        };
        let body_len = content_length(&buf[..head_end]);
        while buf.len() < head_end + body_len {
            match stream.read(&mut chunk) {
                Ok(0) | Err(_) => return,
                Ok(n) => buf.extend_from_slice(&chunk[..n]),
            }
        }
        let request: Vec<u8> = buf.drain(..head_end + body_len).collect();
        seen.lock().unwrap().push(request.clone());
        let Some(mut response) = next(&request) else {
            return;
        };
        if request.starts_with(b"HEAD ") {
            // HEAD answers keep the headers but drop the body.
            if let Some(pos) = find_head_end(&response) {
                response.truncate(pos);
            }
        }
        if stream.write_all(&response).is_err() {
            return;
        }
    }
}

fn find_head_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n").map(|p| p + 4)
}

/// `Content-Length` of the request head, 0 when absent.
fn content_length(head: &[u8]) -> usize {
    let head = String::from_utf8_lossy(head);
    head.lines()
        .find_map(|line| {
            let (name, value) = line.split_once(':')?;
            name.eq_ignore_ascii_case("content-length")
                .then(|| value.trim().parse().ok())?
        })
        .unwrap_or(0)
}
