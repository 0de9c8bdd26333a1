//! One in-flight fetch and its bookkeeping.
//!
//! A [`Resource`] is created when a request is accepted, waits in a host
//! queue, rides a connection through the reactor, and is finally torn
//! down into a [`FetchResult`]. Redirects reuse the same `Resource`,
//! rewriting its target hop by hop.

use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use http::{HeaderMap, Method};
use url::{Position, Url};

use crate::ErrorKind;
use crate::channel::HostKey;
use crate::config::FetchConfig;
use crate::message::HttpResponseSink;
use crate::types::{FetchRequest, FetchResult, FetchTiming, Priority, RequestId, Status};

/// Where a proxied fetch currently stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ProxyPhase {
    /// The `CONNECT` request still has to happen
    Connect,
    /// The tunnel is up; speak TLS to the origin through it
    Tunneling,
}

/// Proxy routing state carried by a resource.
#[derive(Debug, Clone)]
pub(crate) struct ProxyState {
    /// The forward proxy itself
    pub url: Url,
    /// `None` for plain-HTTP fetches, which use absolute-form request
    /// lines instead of a tunnel
    pub phase: Option<ProxyPhase>,
}

#[derive(Debug)]
pub(crate) struct Resource {
    pub id: RequestId,
    /// Current hop target
    pub url: Url,
    /// The URL as originally requested
    pub original_url: Url,
    pub method: Method,
    /// Merged headers: client-wide custom headers underneath, request
    /// headers on top
    pub headers: HeaderMap,
    pub body: Option<Bytes>,
    pub priority: Priority,
    pub retry: u32,
    pub config: Arc<FetchConfig>,
    pub accepted_at: Instant,
    /// Whole-fetch deadline, `None` when the config disables it
    pub deadline: Option<Instant>,
    /// When the resource first left a wait queue for a connection
    pub first_dispatch: Option<Instant>,
    /// Redirect targets followed so far, in order
    pub redirects: Vec<Url>,
    pub proxy: Option<ProxyState>,
    /// Response sink for the exchange currently in flight
    pub sink: Option<HttpResponseSink>,
}

impl Resource {
    /// Build a resource from an accepted request.
    ///
    /// `defaults` and `custom_headers` are the client-wide settings
    /// frozen onto this fetch at acceptance time.
    pub(crate) fn new(
        id: RequestId,
        request: FetchRequest,
        defaults: &Arc<FetchConfig>,
        custom_headers: &HeaderMap,
    ) -> Self {
        let config = request.config.unwrap_or_else(|| Arc::clone(defaults));
        let mut headers = custom_headers.clone();
        for (name, value) in &request.headers {
            headers.insert(name.clone(), value.clone());
        }
        let accepted_at = Instant::now();
        let deadline = config.timeout.map(|t| accepted_at + t);
        let proxy = config.proxy.as_ref().map(|proxy_url| ProxyState {
            url: proxy_url.clone(),
            phase: None,
        });
        Self {
            id,
            original_url: request.url.clone(),
            url: request.url,
            method: request.method,
            headers,
            body: request.body,
            priority: request.priority,
            retry: request.retry,
            config,
            accepted_at,
            deadline,
            first_dispatch: None,
            redirects: Vec::new(),
            proxy,
            sink: None,
        }
    }

    /// Scheduling key of the current hop.
    pub(crate) fn host_key(&self) -> Result<HostKey, ErrorKind> {
        HostKey::from_url(&self.url)
    }

    /// Key of the host a connection must actually be opened to: the
    /// proxy when one is configured, the origin otherwise.
    pub(crate) fn connect_key(&self) -> Result<HostKey, ErrorKind> {
        match &self.proxy {
            Some(proxy) => HostKey::from_url(&proxy.url),
            None => self.host_key(),
        }
    }

    /// Whether the exchange about to be dispatched is a proxy `CONNECT`.
    pub(crate) fn needs_connect(&self) -> bool {
        matches!(
            self.proxy,
            Some(ProxyState {
                phase: Some(ProxyPhase::Connect),
                ..
            })
        )
    }

    /// Fresh sink for the next exchange of this resource.
    pub(crate) fn new_sink(&self) -> HttpResponseSink {
        HttpResponseSink::new(self.method == Method::HEAD, self.config.max_body_size)
    }

    /// Serialize the request for the current hop.
    ///
    /// `absolute_form` selects the request-line shape used when talking
    /// plain HTTP through a forward proxy.
    pub(crate) fn request_bytes(&self, absolute_form: bool) -> Result<Vec<u8>, ErrorKind> {
        let host_key = self.host_key()?;
        let mut out = Vec::with_capacity(256);

        out.extend_from_slice(self.method.as_str().as_bytes());
        out.push(b' ');
        if absolute_form {
            out.extend_from_slice(self.url[..Position::AfterQuery].as_bytes());
        } else {
            out.extend_from_slice(self.url[Position::BeforePath..Position::AfterQuery].as_bytes());
        }
        out.extend_from_slice(b" HTTP/1.1\r\n");

        if !self.headers.contains_key(http::header::HOST) {
            put_header(&mut out, "Host", host_key.authority().as_bytes());
        }
        if !self.headers.contains_key(http::header::USER_AGENT) {
            put_header(&mut out, "User-Agent", self.config.user_agent.as_bytes());
        }
        if !self.headers.contains_key(http::header::ACCEPT) {
            put_header(&mut out, "Accept", b"*/*");
        }
        if self.config.decompress && !self.headers.contains_key(http::header::ACCEPT_ENCODING) {
            put_header(&mut out, "Accept-Encoding", b"gzip, deflate");
        }
        for (name, value) in &self.headers {
            if name == http::header::CONTENT_LENGTH {
                continue;
            }
            put_header(&mut out, name.as_str(), value.as_bytes());
        }
        if let Some(body) = &self.body {
            put_header(
                &mut out,
                "Content-Length",
                body.len().to_string().as_bytes(),
            );
        }
        out.extend_from_slice(b"\r\n");
        if let Some(body) = &self.body {
            out.extend_from_slice(body);
        }
        Ok(out)
    }

    /// Serialize the `CONNECT` request that opens a tunnel to the
    /// current hop's origin.
    pub(crate) fn connect_bytes(&self) -> Result<Vec<u8>, ErrorKind> {
        let target = self.host_key()?;
        let authority = target.authority_with_port();
        let mut out = Vec::with_capacity(128);
        out.extend_from_slice(b"CONNECT ");
        out.extend_from_slice(authority.as_bytes());
        out.extend_from_slice(b" HTTP/1.1\r\n");
        put_header(&mut out, "Host", authority.as_bytes());
        put_header(&mut out, "User-Agent", self.config.user_agent.as_bytes());
        out.extend_from_slice(b"\r\n");
        Ok(out)
    }

    /// Tear the resource down into its terminal result.
    pub(crate) fn into_result(self, status: Status) -> FetchResult {
        let total = self.accepted_at.elapsed();
        let queued = self
            .first_dispatch
            .map_or(total, |d| d.saturating_duration_since(self.accepted_at));
        FetchResult {
            id: self.id,
            url: self.original_url,
            redirects: self.redirects,
            status,
            timing: FetchTiming { queued, total },
            retry: self.retry,
        }
    }

    /// Shorthand for a failed teardown.
    pub(crate) fn fail(self, kind: ErrorKind) -> FetchResult {
        self.into_result(Status::Error(kind))
    }
}

fn put_header(out: &mut Vec<u8>, name: &str, value: &[u8]) {
    out.extend_from_slice(name.as_bytes());
    out.extend_from_slice(b": ");
    out.extend_from_slice(value);
    out.extend_from_slice(b"\r\n");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Scheme;
    use http::HeaderValue;

    fn resource(url: &str) -> Resource {
        let request = FetchRequest::try_from(url).unwrap();
        Resource::new(
            RequestId(1),
            request,
            &Arc::new(FetchConfig::default()),
            &HeaderMap::new(),
        )
    }

    #[test]
    fn test_host_key() {
        let key = resource("https://Example.COM/path").host_key().unwrap();
        assert_eq!(key.scheme, Scheme::Https);
        assert_eq!(key.host, "example.com");
        assert_eq!(key.port, 443);

        let key = resource("http://example.com:8080/").host_key().unwrap();
        assert_eq!(key.port, 8080);
    }

    #[test]
    fn test_request_bytes_origin_form() {
        let bytes = resource("http://example.com/a/b?q=1")
            .request_bytes(false)
            .unwrap();
        let text = String::from_utf8(bytes).unwrap();
        assert!(text.starts_with("GET /a/b?q=1 HTTP/1.1\r\n"));
        assert!(text.contains("Host: example.com\r\n"));
        assert!(text.contains(&format!("User-Agent: {}\r\n", crate::config::DEFAULT_USER_AGENT)));
        assert!(text.contains("Accept-Encoding: gzip, deflate\r\n"));
        assert!(text.ends_with("\r\n\r\n"));
    }

    #[test]
    fn test_request_bytes_absolute_form() {
        let bytes = resource("http://example.com/x").request_bytes(true).unwrap();
        let text = String::from_utf8(bytes).unwrap();
        assert!(text.starts_with("GET http://example.com/x HTTP/1.1\r\n"));
    }

    #[test]
    fn test_host_header_keeps_explicit_port() {
        let bytes = resource("http://example.com:8080/")
            .request_bytes(false)
            .unwrap();
        let text = String::from_utf8(bytes).unwrap();
        assert!(text.contains("Host: example.com:8080\r\n"));
    }

    #[test]
    fn test_request_headers_override_defaults() {
        let mut request = FetchRequest::try_from("http://example.com/").unwrap();
        request
            .headers
            .insert(http::header::USER_AGENT, HeaderValue::from_static("custom"));
        let resource = Resource::new(
            RequestId(2),
            request,
            &Arc::new(FetchConfig::default()),
            &HeaderMap::new(),
        );
        let text = String::from_utf8(resource.request_bytes(false).unwrap()).unwrap();
        assert!(text.contains("User-Agent: custom\r\n"));
        assert!(!text.contains(crate::config::DEFAULT_USER_AGENT));
    }

    #[test]
    fn test_body_gets_content_length() {
        let request = FetchRequest::try_from("http://example.com/submit")
            .unwrap()
            .with_method(Method::POST)
            .with_body(&b"payload"[..]);
        let resource = Resource::new(
            RequestId(3),
            request,
            &Arc::new(FetchConfig::default()),
            &HeaderMap::new(),
        );
        let bytes = resource.request_bytes(false).unwrap();
        let text = String::from_utf8(bytes).unwrap();
        assert!(text.starts_with("POST /submit HTTP/1.1\r\n"));
        assert!(text.contains("Content-Length: 7\r\n"));
        assert!(text.ends_with("\r\n\r\npayload"));
    }

    #[test]
    fn test_connect_bytes() {
        let text =
            String::from_utf8(resource("https://secure.example.com/").connect_bytes().unwrap())
                .unwrap();
        assert!(text.starts_with("CONNECT secure.example.com:443 HTTP/1.1\r\n"));
        assert!(text.contains("Host: secure.example.com:443\r\n"));
        assert!(text.ends_with("\r\n\r\n"));
    }

    #[test]
    fn test_custom_headers_merge_under_request_headers() {
        let mut custom = HeaderMap::new();
        custom.insert("x-team", HeaderValue::from_static("crawl"));
        custom.insert("x-shared", HeaderValue::from_static("from-client"));
        let mut request = FetchRequest::try_from("http://example.com/").unwrap();
        request
            .headers
            .insert("x-shared", HeaderValue::from_static("from-request"));
        let resource = Resource::new(
            RequestId(4),
            request,
            &Arc::new(FetchConfig::default()),
            &custom,
        );
        assert_eq!(resource.headers["x-team"], "crawl");
        assert_eq!(resource.headers["x-shared"], "from-request");
    }

    #[test]
    fn test_queued_timing_for_never_dispatched() {
        let resource = resource("http://example.com/");
        let result = resource.fail(ErrorKind::Canceled);
        assert_eq!(result.timing.queued, result.timing.total);
    }
}
