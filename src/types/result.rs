use std::fmt::Display;
use std::time::Duration;

use serde::Serialize;
use url::Url;

use crate::Status;

/// Opaque ticket identifying an accepted request.
///
/// Returned by [`Client::put_request`](crate::Client::put_request) and
/// echoed on the matching [`FetchResult`], so callers can correlate
/// results that arrive out of order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(transparent)]
pub struct RequestId(pub(crate) u64);

impl Display for RequestId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Wall-clock accounting for one fetch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FetchTiming {
    /// Time from acceptance until the first dispatch to a connection
    pub queued: Duration,
    /// Time from acceptance until the result was emitted, all redirect
    /// hops included
    pub total: Duration,
}

/// The terminal outcome of one fetch, exactly one per accepted request.
#[derive(Debug, PartialEq)]
pub struct FetchResult {
    /// Ticket returned by `put_request`
    pub id: RequestId,
    /// The URL as originally requested
    pub url: Url,
    /// Redirect targets that were followed, in order. Empty when the
    /// first response was terminal; the last entry is the final URL.
    pub redirects: Vec<Url>,
    /// What came back
    pub status: Status,
    /// Wall-clock accounting
    pub timing: FetchTiming,
    /// Caller-visible retry counter, echoed back unchanged
    pub retry: u32,
}

impl FetchResult {
    /// The URL the terminal response came from.
    #[must_use]
    pub fn final_url(&self) -> &Url {
        self.redirects.last().unwrap_or(&self.url)
    }

    /// Number of redirect hops that were followed.
    #[must_use]
    pub fn redirect_count(&self) -> usize {
        self.redirects.len()
    }

    /// Returns `true` if a complete 2xx response arrived.
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.status.is_success()
    }
}

impl Display for FetchResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} [{}] {}",
            self.status.icon(),
            self.status.code_as_string(),
            self.url
        )?;
        if !self.redirects.is_empty() {
            write!(f, " (-> {})", self.final_url())?;
        }
        Ok(())
    }
}
