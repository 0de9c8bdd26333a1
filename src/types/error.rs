use serde::{Serialize, Serializer};
use std::hash::Hash;
use std::time::Duration;
use thiserror::Error;

use http::StatusCode;

/// Coarse classification of an [`ErrorKind`].
///
/// Groups are what the scheduler acts on: failures in the `Io`, `Tls`,
/// `Dns` and `Http` groups count against a server's rolling error window,
/// while `Rule` and `Canceled` failures never reach the network and leave
/// server statistics untouched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorGroup {
    /// Protocol-level failure in the HTTP exchange
    Http,
    /// TLS handshake or record-layer failure
    Tls,
    /// Socket-level failure
    Io,
    /// Name resolution failure
    Dns,
    /// The server was disabled by its rolling error window
    Server,
    /// The request violated a local rule before touching the network
    Rule,
    /// The engine shut down while the request was still pending
    Canceled,
}

/// Possible errors when fetching with `trawl`
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum ErrorKind {
    /// The given string can not be parsed into a valid URL
    #[error("cannot parse `{0}` as a URL: {1}")]
    InvalidUrl(String, url::ParseError),
    /// The URL scheme is not one the engine speaks
    #[error("unsupported URL scheme `{0}`, expected http or https")]
    UnsupportedScheme(String),
    /// An URL with an invalid host was found
    #[error("URL is missing a host")]
    InvalidUrlHost,
    /// The given header could not be parsed.
    /// A possible error when converting a `HeaderValue` from a string or byte
    /// slice.
    #[error("header could not be parsed")]
    InvalidHeader(#[from] http::header::InvalidHeaderValue),
    /// The bounded request queue is full and the request was not accepted
    #[error("request queue is full")]
    QueueFull,
    /// Name resolution failed for the given host
    #[error("DNS lookup for `{host}` failed: {reason}")]
    Dns {
        /// Host name that failed to resolve
        host: String,
        /// Resolver-provided failure reason
        reason: String,
    },
    /// Any form of socket I/O error during connect, send or receive
    #[error("network I/O error")]
    Io(#[from] std::io::Error),
    /// TLS handshake or record processing failed
    #[error("TLS error")]
    Tls(#[from] rustls::Error),
    /// The forward proxy refused the CONNECT request
    #[error("proxy refused tunnel with status {0}")]
    Proxy(StatusCode),
    /// The server answered with a terminal status outside the 2xx range
    #[error("server responded with {0}")]
    Http(StatusCode),
    /// The response could not be parsed as HTTP
    #[error("malformed HTTP response: {0}")]
    InvalidResponse(String),
    /// A redirect status arrived without a usable `Location` header
    #[error("redirect status {0} without a Location header")]
    MissingRedirectLocation(StatusCode),
    /// The redirect chain exceeded the configured ceiling
    #[error("too many redirects (limit: {0})")]
    TooManyRedirects(u32),
    /// The response body exceeded the configured ceiling
    #[error("response body larger than {0} bytes")]
    BodyTooLarge(u64),
    /// The response body claimed a content encoding it did not have
    #[error("cannot decompress response body: {0}")]
    Decompress(String),
    /// The caller-visible retry counter exceeded the configured ceiling
    #[error("retry limit reached (limit: {0})")]
    RetriesExhausted(u32),
    /// The server was disabled after too many failures in its rolling window
    #[error("server disabled due to excessive error rate")]
    ServerDisabled,
    /// The whole-fetch deadline passed while the request was still queued
    #[error("timed out after {0:?} while waiting for dispatch")]
    QueuedTimeout(Duration),
    /// The server did not complete the exchange within the response window
    #[error("no response within {0:?}")]
    ResponseTimeout(Duration),
    /// The engine shut down before the request completed
    #[error("request canceled")]
    Canceled,
}

impl ErrorKind {
    /// Classify this error for scheduling decisions.
    #[must_use]
    pub const fn group(&self) -> ErrorGroup {
        match self {
            Self::InvalidUrl(..)
            | Self::UnsupportedScheme(_)
            | Self::InvalidUrlHost
            | Self::InvalidHeader(_)
            | Self::QueueFull
            | Self::TooManyRedirects(_)
            | Self::RetriesExhausted(_)
            | Self::QueuedTimeout(_) => ErrorGroup::Rule,
            Self::Io(_) | Self::ResponseTimeout(_) => ErrorGroup::Io,
            Self::Tls(_) => ErrorGroup::Tls,
            Self::Dns { .. } => ErrorGroup::Dns,
            Self::ServerDisabled => ErrorGroup::Server,
            Self::Proxy(_)
            | Self::Http(_)
            | Self::InvalidResponse(_)
            | Self::MissingRedirectLocation(_)
            | Self::BodyTooLarge(_)
            | Self::Decompress(_) => ErrorGroup::Http,
            Self::Canceled => ErrorGroup::Canceled,
        }
    }

    /// Return the numeric detail behind this error (if any).
    ///
    /// For I/O errors this is the OS error code, for proxy and redirect
    /// errors the HTTP status code.
    #[must_use]
    pub fn code(&self) -> Option<i32> {
        match self {
            Self::Io(e) => e.raw_os_error(),
            Self::Http(code) | Self::Proxy(code) | Self::MissingRedirectLocation(code) => {
                Some(i32::from(code.as_u16()))
            }
            _ => None,
        }
    }

    /// Return more details about the underlying failure (if any)
    #[must_use]
    pub fn details(&self) -> Option<String> {
        match self {
            Self::Io(e) => Some(e.to_string()),
            Self::Tls(e) => Some(e.to_string()),
            Self::Dns { reason, .. } => Some(reason.clone()),
            Self::InvalidUrl(_, e) => Some(e.to_string()),
            Self::InvalidResponse(msg) | Self::Decompress(msg) => Some(msg.clone()),
            _ => None,
        }
    }

    /// Whether this failure counts against the owning server's rolling
    /// error window.
    #[must_use]
    pub const fn counts_against_server(&self) -> bool {
        matches!(
            self.group(),
            ErrorGroup::Http | ErrorGroup::Tls | ErrorGroup::Io | ErrorGroup::Dns
        )
    }
}

impl PartialEq for ErrorKind {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::InvalidUrl(s1, e1), Self::InvalidUrl(s2, e2)) => s1 == s2 && e1 == e2,
            (Self::UnsupportedScheme(s1), Self::UnsupportedScheme(s2)) => s1 == s2,
            (Self::Io(e1), Self::Io(e2)) => e1.kind() == e2.kind(),
            (Self::Tls(e1), Self::Tls(e2)) => e1 == e2,
            (
                Self::Dns {
                    host: h1,
                    reason: r1,
                },
                Self::Dns {
                    host: h2,
                    reason: r2,
                },
            ) => h1 == h2 && r1 == r2,
            (Self::Proxy(c1), Self::Proxy(c2))
            | (Self::Http(c1), Self::Http(c2))
            | (Self::MissingRedirectLocation(c1), Self::MissingRedirectLocation(c2)) => c1 == c2,
            (Self::InvalidResponse(m1), Self::InvalidResponse(m2))
            | (Self::Decompress(m1), Self::Decompress(m2)) => m1 == m2,
            (Self::TooManyRedirects(n1), Self::TooManyRedirects(n2))
            | (Self::RetriesExhausted(n1), Self::RetriesExhausted(n2)) => n1 == n2,
            (Self::BodyTooLarge(n1), Self::BodyTooLarge(n2)) => n1 == n2,
            (Self::QueuedTimeout(d1), Self::QueuedTimeout(d2))
            | (Self::ResponseTimeout(d1), Self::ResponseTimeout(d2)) => d1 == d2,
            (Self::InvalidHeader(_), Self::InvalidHeader(_))
            | (Self::InvalidUrlHost, Self::InvalidUrlHost)
            | (Self::QueueFull, Self::QueueFull)
            | (Self::ServerDisabled, Self::ServerDisabled)
            | (Self::Canceled, Self::Canceled) => true,
            _ => false,
        }
    }
}

impl Eq for ErrorKind {}

impl Hash for ErrorKind {
    fn hash<H>(&self, state: &mut H)
    where
        H: std::hash::Hasher,
    {
        std::mem::discriminant(self).hash(state);
        match self {
            Self::InvalidUrl(s, e) => (s, e.to_string()).hash(state),
            Self::UnsupportedScheme(s) | Self::InvalidResponse(s) | Self::Decompress(s) => {
                s.hash(state);
            }
            Self::Io(e) => e.kind().hash(state),
            Self::Tls(e) => e.to_string().hash(state),
            Self::Dns { host, reason } => (host, reason).hash(state),
            Self::Http(code) | Self::Proxy(code) | Self::MissingRedirectLocation(code) => {
                code.hash(state);
            }
            Self::TooManyRedirects(n) | Self::RetriesExhausted(n) => n.hash(state),
            Self::BodyTooLarge(n) => n.hash(state),
            Self::QueuedTimeout(d) | Self::ResponseTimeout(d) => d.hash(state),
            Self::InvalidHeader(e) => e.to_string().hash(state),
            Self::InvalidUrlHost | Self::QueueFull | Self::ServerDisabled | Self::Canceled => {}
        }
    }
}

impl Serialize for ErrorKind {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.collect_str(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;

    #[test]
    fn test_group_classification() {
        assert_eq!(ErrorKind::QueueFull.group(), ErrorGroup::Rule);
        assert_eq!(ErrorKind::TooManyRedirects(5).group(), ErrorGroup::Rule);
        assert_eq!(
            ErrorKind::QueuedTimeout(Duration::from_secs(1)).group(),
            ErrorGroup::Rule
        );
        assert_eq!(
            ErrorKind::ResponseTimeout(Duration::from_secs(1)).group(),
            ErrorGroup::Io
        );
        assert_eq!(
            ErrorKind::Io(io::Error::from(io::ErrorKind::ConnectionRefused)).group(),
            ErrorGroup::Io
        );
        assert_eq!(ErrorKind::ServerDisabled.group(), ErrorGroup::Server);
        assert_eq!(ErrorKind::Canceled.group(), ErrorGroup::Canceled);
        assert_eq!(
            ErrorKind::Dns {
                host: "example.com".into(),
                reason: "NXDOMAIN".into()
            }
            .group(),
            ErrorGroup::Dns
        );
    }

    #[test]
    fn test_rule_errors_do_not_count_against_server() {
        assert!(!ErrorKind::QueueFull.counts_against_server());
        assert!(!ErrorKind::Canceled.counts_against_server());
        assert!(!ErrorKind::ServerDisabled.counts_against_server());
        assert!(
            ErrorKind::Io(io::Error::from(io::ErrorKind::TimedOut)).counts_against_server()
        );
        assert!(ErrorKind::Proxy(StatusCode::BAD_GATEWAY).counts_against_server());
    }

    #[test]
    fn test_io_errors_compare_by_kind() {
        let a = ErrorKind::Io(io::Error::new(io::ErrorKind::ConnectionReset, "a"));
        let b = ErrorKind::Io(io::Error::new(io::ErrorKind::ConnectionReset, "b"));
        assert_eq!(a, b);
        let c = ErrorKind::Io(io::Error::from(io::ErrorKind::BrokenPipe));
        assert_ne!(a, c);
    }

    #[test]
    fn test_error_code() {
        assert_eq!(
            ErrorKind::Proxy(StatusCode::FORBIDDEN).code(),
            Some(403)
        );
        assert_eq!(ErrorKind::Http(StatusCode::NOT_FOUND).code(), Some(404));
        assert_eq!(ErrorKind::Http(StatusCode::NOT_FOUND).group(), ErrorGroup::Http);
        assert_eq!(ErrorKind::Canceled.code(), None);
    }
}
