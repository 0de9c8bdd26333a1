//! Incremental response assembly.
//!
//! The reactor hands every received byte slice to a [`MessageSink`] and
//! only looks at the verdict: keep reading, done, or broken. All HTTP
//! framing knowledge (status line, headers, `Content-Length`, chunked
//! transfer coding) lives here, behind the sink, so the connection state
//! machine stays protocol-agnostic.

use std::io::Read;

use bytes::{Bytes, BytesMut};
use http::{HeaderMap, HeaderName, HeaderValue, StatusCode};

use crate::ErrorKind;

/// Ceiling on the response head (status line plus headers).
const MAX_HEAD_BYTES: usize = 64 * 1024;
/// Ceiling on a single chunk-size or trailer line.
const MAX_LINE_BYTES: usize = 8 * 1024;
/// Header slots handed to the parser.
const MAX_HEADERS: usize = 100;

/// Verdict after feeding bytes into a sink.
#[derive(Debug)]
pub enum Append {
    /// The message is complete; stop reading
    Complete,
    /// The message needs more bytes
    More,
    /// The byte stream is not a valid message
    Invalid(ErrorKind),
}

/// Incremental consumer of one response's bytes.
///
/// The engine creates one sink per exchange and the reactor feeds it
/// every slice read off the socket, in order. `eof` is called when the
/// peer closes the connection before the sink reported completion.
pub trait MessageSink {
    /// Consume the next slice of received bytes.
    fn append(&mut self, data: &[u8]) -> Append;

    /// The peer closed the connection.
    ///
    /// For messages delimited by connection close this is the normal
    /// end; for everything else it is truncation.
    fn eof(&mut self) -> Append;

    /// Whether the connection may be reused once the message completes.
    fn is_keep_alive(&self) -> bool;
}

#[derive(Debug)]
enum Phase {
    Head,
    FixedBody { remaining: u64 },
    EofBody,
    Chunked(ChunkPhase),
    Done,
}

#[derive(Debug)]
enum ChunkPhase {
    Size,
    Data { remaining: u64 },
    DataCrlf { skipped: u8 },
    Trailer,
}

/// Default [`MessageSink`]: a buffered HTTP/1.x response.
#[derive(Debug)]
pub(crate) struct HttpResponseSink {
    phase: Phase,
    head: Vec<u8>,
    line: Vec<u8>,
    code: Option<StatusCode>,
    headers: HeaderMap,
    body: BytesMut,
    keep_alive: bool,
    head_request: bool,
    max_body: u64,
}

impl HttpResponseSink {
    pub(crate) fn new(head_request: bool, max_body: u64) -> Self {
        Self {
            phase: Phase::Head,
            head: Vec::new(),
            line: Vec::new(),
            code: None,
            headers: HeaderMap::new(),
            body: BytesMut::new(),
            keep_alive: false,
            head_request,
            max_body,
        }
    }

    /// Tear the sink apart into response pieces.
    ///
    /// Returns `None` unless the message completed.
    pub(crate) fn into_parts(self) -> Option<(StatusCode, HeaderMap, Bytes)> {
        match self.phase {
            Phase::Done => Some((self.code?, self.headers, self.body.freeze())),
            _ => None,
        }
    }

    fn parse_head(&mut self, head_end: usize) -> Result<(), ErrorKind> {
        let mut slots = [httparse::EMPTY_HEADER; MAX_HEADERS];
        let mut response = httparse::Response::new(&mut slots);
        match response.parse(&self.head[..head_end]) {
            Ok(httparse::Status::Complete(_)) => {}
            Ok(httparse::Status::Partial) => {
                return Err(ErrorKind::InvalidResponse(
                    "truncated response head".to_string(),
                ));
            }
            Err(e) => return Err(ErrorKind::InvalidResponse(e.to_string())),
        }

        let raw_code = response
            .code
            .ok_or_else(|| ErrorKind::InvalidResponse("missing status code".to_string()))?;
        let code = StatusCode::from_u16(raw_code)
            .map_err(|_| ErrorKind::InvalidResponse(format!("bad status code {raw_code}")))?;

        let mut headers = HeaderMap::with_capacity(response.headers.len());
        for header in response.headers.iter() {
            let name = HeaderName::from_bytes(header.name.as_bytes())
                .map_err(|_| ErrorKind::InvalidResponse(format!("bad header `{}`", header.name)))?;
            let value = HeaderValue::from_bytes(header.value).map_err(|_| {
                ErrorKind::InvalidResponse(format!("bad value for header `{}`", header.name))
            })?;
            headers.append(name, value);
        }

        let http11 = response.version == Some(1);
        self.code = Some(code);
        self.keep_alive = keep_alive(http11, &headers);

        let chunked = headers
            .get(http::header::TRANSFER_ENCODING)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|v| v.to_ascii_lowercase().contains("chunked"));

        let content_length = match headers.get(http::header::CONTENT_LENGTH) {
            Some(value) => {
                let text = value.to_str().map_err(|_| {
                    ErrorKind::InvalidResponse("unreadable Content-Length".to_string())
                })?;
                Some(text.trim().parse::<u64>().map_err(|_| {
                    ErrorKind::InvalidResponse(format!("bad Content-Length `{text}`"))
                })?)
            }
            None => None,
        };

        self.headers = headers;

        let bodyless = self.head_request
            || code.is_informational()
            || code == StatusCode::NO_CONTENT
            || code == StatusCode::NOT_MODIFIED;

        self.phase = if bodyless {
            Phase::Done
        } else if chunked {
            Phase::Chunked(ChunkPhase::Size)
        } else if let Some(length) = content_length {
            if length == 0 {
                Phase::Done
            } else {
                Phase::FixedBody { remaining: length }
            }
        } else {
            // No framing at all: the body runs until the peer closes.
            self.keep_alive = false;
            Phase::EofBody
        };
        Ok(())
    }

    fn push_body(&mut self, data: &[u8]) -> Result<(), ErrorKind> {
        if self.max_body > 0 && (self.body.len() + data.len()) as u64 > self.max_body {
            return Err(ErrorKind::BodyTooLarge(self.max_body));
        }
        self.body.extend_from_slice(data);
        Ok(())
    }

    fn append_body(&mut self, mut data: &[u8]) -> Append {
        while !data.is_empty() {
            match &mut self.phase {
                Phase::Head => unreachable!("head already parsed"),
                Phase::Done => {
                    // Trailing bytes after a complete message; a broken
                    // peer, but not our problem to diagnose.
                    log::trace!("ignoring {} bytes past end of response", data.len());
                    return Append::Complete;
                }
                Phase::EofBody => {
                    if let Err(e) = self.push_body(data) {
                        return Append::Invalid(e);
                    }
                    return Append::More;
                }
                Phase::FixedBody { remaining } => {
                    let take = usize::try_from(*remaining).map_or(data.len(), |r| r.min(data.len()));
                    *remaining -= take as u64;
                    let done = *remaining == 0;
                    let (chunk, rest) = data.split_at(take);
                    if let Err(e) = self.push_body(chunk) {
                        return Append::Invalid(e);
                    }
                    data = rest;
                    if done {
                        self.phase = Phase::Done;
                        return Append::Complete;
                    }
                }
                Phase::Chunked(chunk_phase) => match chunk_phase {
                    ChunkPhase::Size => {
                        match take_line(&mut self.line, &mut data) {
                            Ok(Some(line)) => {
                                let size_text = line
                                    .split(|&b| b == b';')
                                    .next()
                                    .unwrap_or(&[]);
                                let size_text = String::from_utf8_lossy(size_text);
                                match u64::from_str_radix(size_text.trim(), 16) {
                                    Ok(0) => self.phase = Phase::Chunked(ChunkPhase::Trailer),
                                    Ok(size) => {
                                        self.phase =
                                            Phase::Chunked(ChunkPhase::Data { remaining: size });
                                    }
                                    Err(_) => {
                                        return Append::Invalid(ErrorKind::InvalidResponse(
                                            format!("bad chunk size `{}`", size_text.trim()),
                                        ));
                                    }
                                }
                            }
                            Ok(None) => return Append::More,
                            Err(e) => return Append::Invalid(e),
                        }
                    }
                    ChunkPhase::Data { remaining } => {
                        let take =
                            usize::try_from(*remaining).map_or(data.len(), |r| r.min(data.len()));
                        *remaining -= take as u64;
                        let done = *remaining == 0;
                        let (chunk, rest) = data.split_at(take);
                        if let Err(e) = self.push_body(chunk) {
                            return Append::Invalid(e);
                        }
                        data = rest;
                        if done {
                            self.phase = Phase::Chunked(ChunkPhase::DataCrlf { skipped: 0 });
                        }
                    }
                    ChunkPhase::DataCrlf { skipped } => {
                        let (byte, rest) = (data[0], &data[1..]);
                        data = rest;
                        match byte {
                            b'\n' => self.phase = Phase::Chunked(ChunkPhase::Size),
                            b'\r' if *skipped == 0 => *skipped = 1,
                            _ => {
                                return Append::Invalid(ErrorKind::InvalidResponse(
                                    "missing CRLF after chunk data".to_string(),
                                ));
                            }
                        }
                    }
                    ChunkPhase::Trailer => match take_line(&mut self.line, &mut data) {
                        Ok(Some(line)) => {
                            if line.is_empty() {
                                self.phase = Phase::Done;
                                return Append::Complete;
                            }
                            // Trailer headers are parsed and dropped.
                        }
                        Ok(None) => return Append::More,
                        Err(e) => return Append::Invalid(e),
                    },
                },
            }
        }
        match self.phase {
            Phase::Done => Append::Complete,
            _ => Append::More,
        }
    }
}

impl MessageSink for HttpResponseSink {
    fn append(&mut self, data: &[u8]) -> Append {
        if let Phase::Head = self.phase {
            if self.head.len() + data.len() > MAX_HEAD_BYTES {
                return Append::Invalid(ErrorKind::InvalidResponse(
                    "response head too large".to_string(),
                ));
            }
            self.head.extend_from_slice(data);
            let Some(head_end) = find_head_end(&self.head) else {
                return Append::More;
            };
            if let Err(e) = self.parse_head(head_end) {
                return Append::Invalid(e);
            }
            if self.code.is_some_and(|c| c == StatusCode::CONTINUE) {
                // Interim 100 Continue: discard it and parse the real
                // response from whatever follows.
                let leftover = self.head.split_off(head_end);
                self.head.clear();
                self.code = None;
                self.headers = HeaderMap::new();
                self.phase = Phase::Head;
                return self.append(&leftover);
            }
            let leftover = self.head.split_off(head_end);
            if matches!(self.phase, Phase::Done) {
                return Append::Complete;
            }
            return self.append_body(&leftover);
        }
        self.append_body(data)
    }

    fn eof(&mut self) -> Append {
        self.keep_alive = false;
        match self.phase {
            Phase::EofBody => {
                self.phase = Phase::Done;
                Append::Complete
            }
            Phase::Done => Append::Complete,
            Phase::Head | Phase::FixedBody { .. } | Phase::Chunked(_) => Append::Invalid(
                ErrorKind::Io(std::io::Error::from(std::io::ErrorKind::UnexpectedEof)),
            ),
        }
    }

    fn is_keep_alive(&self) -> bool {
        self.keep_alive
    }
}

/// HTTP/1.1 defaults to keep-alive, HTTP/1.0 to close; an explicit
/// `Connection` header overrides either way.
fn keep_alive(http11: bool, headers: &HeaderMap) -> bool {
    let connection = headers
        .get(http::header::CONNECTION)
        .and_then(|v| v.to_str().ok())
        .map(str::to_ascii_lowercase);
    match connection {
        Some(tokens) if tokens.split(',').any(|t| t.trim() == "close") => false,
        Some(tokens) if tokens.split(',').any(|t| t.trim() == "keep-alive") => true,
        _ => http11,
    }
}

fn find_head_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n").map(|p| p + 4)
}

/// Accumulate bytes into `line` until a `\n`, returning the completed
/// line without its trailing CRLF. Consumes from `data` in place.
fn take_line(line: &mut Vec<u8>, data: &mut &[u8]) -> Result<Option<Vec<u8>>, ErrorKind> {
    match data.iter().position(|&b| b == b'\n') {
        Some(pos) => {
            line.extend_from_slice(&data[..pos]);
            *data = &data[pos + 1..];
            if line.last() == Some(&b'\r') {
                line.pop();
            }
            Ok(Some(std::mem::take(line)))
        }
        None => {
            line.extend_from_slice(data);
            *data = &[];
            if line.len() > MAX_LINE_BYTES {
                return Err(ErrorKind::InvalidResponse("oversized line".to_string()));
            }
            Ok(None)
        }
    }
}

/// Decode a response body according to its `Content-Encoding`.
///
/// Unknown encodings pass through untouched; a stream that fails to
/// decode is an error, not silently delivered garbage.
pub(crate) fn decode_body(headers: &HeaderMap, body: Bytes) -> Result<Bytes, ErrorKind> {
    let encoding = headers
        .get(http::header::CONTENT_ENCODING)
        .and_then(|v| v.to_str().ok())
        .map(str::to_ascii_lowercase);
    match encoding.as_deref() {
        Some("gzip" | "x-gzip") => {
            let mut out = Vec::new();
            flate2::read::MultiGzDecoder::new(body.as_ref())
                .read_to_end(&mut out)
                .map_err(|e| ErrorKind::Decompress(e.to_string()))?;
            Ok(Bytes::from(out))
        }
        Some("deflate") => {
            // Servers disagree on whether "deflate" means zlib-wrapped
            // or raw; try the spec-compliant wrapper first.
            let mut out = Vec::new();
            match flate2::read::ZlibDecoder::new(body.as_ref()).read_to_end(&mut out) {
                Ok(_) => Ok(Bytes::from(out)),
                Err(_) => {
                    let mut out = Vec::new();
                    flate2::read::DeflateDecoder::new(body.as_ref())
                        .read_to_end(&mut out)
                        .map_err(|e| ErrorKind::Decompress(e.to_string()))?;
                    Ok(Bytes::from(out))
                }
            }
        }
        Some(other) if other != "identity" => {
            log::debug!("passing through unknown content encoding `{other}`");
            Ok(body)
        }
        _ => Ok(body),
    }
}
