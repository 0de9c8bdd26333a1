use std::fmt::Display;
use std::sync::Arc;

use bytes::Bytes;
use http::{HeaderMap, Method};
use url::Url;

use crate::config::FetchConfig;
use crate::types::scheme::Scheme;
use crate::{ErrorKind, Priority};

/// A single URL to fetch, together with everything the engine needs to
/// schedule it.
///
/// Requests are plain data; the cheapest way to build one is
/// `FetchRequest::new(url)`, or `"https://example.com".try_into()?`
/// when starting from a string. The `with_*` methods are chainable.
#[derive(Debug, Clone)]
pub struct FetchRequest {
    /// The URL to fetch
    pub url: Url,
    /// HTTP method, `GET` unless overridden
    pub method: Method,
    /// Extra headers for this request, merged over the client defaults
    pub headers: HeaderMap,
    /// Request body, sent as-is with a `Content-Length` header
    pub body: Option<Bytes>,
    /// Dispatch priority within the owning host's wait queue
    pub priority: Priority,
    /// Caller-maintained retry counter.
    ///
    /// The engine never retries on its own. A caller that wants retry
    /// semantics resubmits a failed URL with this counter bumped; once
    /// it exceeds the configured ceiling the request is rejected
    /// outright with [`ErrorKind::RetriesExhausted`].
    pub retry: u32,
    /// Per-request configuration override; `None` uses the client's
    /// defaults, frozen at the time the request is accepted
    pub config: Option<Arc<FetchConfig>>,
}

impl FetchRequest {
    /// Create a request for `url` with default method, priority and
    /// configuration.
    #[must_use]
    pub fn new(url: Url) -> Self {
        Self {
            url,
            method: Method::GET,
            headers: HeaderMap::new(),
            body: None,
            priority: Priority::NORMAL,
            retry: 0,
            config: None,
        }
    }

    #[must_use]
    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    #[must_use]
    pub fn with_method(mut self, method: Method) -> Self {
        self.method = method;
        self
    }

    #[must_use]
    pub fn with_headers(mut self, headers: HeaderMap) -> Self {
        self.headers = headers;
        self
    }

    #[must_use]
    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = Some(body.into());
        self
    }

    #[must_use]
    pub const fn with_retry(mut self, retry: u32) -> Self {
        self.retry = retry;
        self
    }

    #[must_use]
    pub fn with_config(mut self, config: Arc<FetchConfig>) -> Self {
        self.config = Some(config);
        self
    }

    /// Check that the engine can actually fetch this URL.
    ///
    /// Rejects non-HTTP schemes and URLs without a host. Called at the
    /// queue boundary so invalid input fails synchronously instead of
    /// producing a dead queue entry.
    pub(crate) fn validate(&self) -> Result<(), ErrorKind> {
        Scheme::from_url(&self.url)?;
        if self.url.host_str().is_none() {
            return Err(ErrorKind::InvalidUrlHost);
        }
        Ok(())
    }
}

impl TryFrom<&str> for FetchRequest {
    type Error = ErrorKind;

    fn try_from(s: &str) -> Result<Self, Self::Error> {
        let url = Url::parse(s).map_err(|e| ErrorKind::InvalidUrl(s.to_string(), e))?;
        let request = Self::new(url);
        request.validate()?;
        Ok(request)
    }
}

impl TryFrom<String> for FetchRequest {
    type Error = ErrorKind;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        Self::try_from(s.as_str())
    }
}

impl From<Url> for FetchRequest {
    fn from(url: Url) -> Self {
        Self::new(url)
    }
}

impl Display for FetchRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {}", self.method, self.url)
    }
}
