use std::fmt::Display;

use bytes::Bytes;
use http::{HeaderMap, StatusCode};
use serde::ser::SerializeStruct;
use serde::{Serialize, Serializer};

use crate::ErrorKind;

const ICON_OK: &str = "✔";
const ICON_ERROR: &str = "✗";
const ICON_TIMEOUT: &str = "⧖";

/// A fully received HTTP response.
///
/// The body is the raw payload after transfer decoding (and, when
/// enabled, content decoding); redirect bookkeeping lives on the
/// surrounding [`FetchResult`](crate::FetchResult).
#[derive(Debug, Clone, PartialEq)]
pub struct Document {
    /// Final HTTP status code
    pub code: StatusCode,
    /// Response headers as received
    pub headers: HeaderMap,
    /// Response body
    pub body: Bytes,
}

impl Document {
    /// Value of the `Content-Type` header, if present and valid UTF-8.
    #[must_use]
    pub fn content_type(&self) -> Option<&str> {
        self.headers
            .get(http::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
    }
}

/// Outcome of a fetch.
#[allow(variant_size_differences)]
#[derive(Debug, PartialEq)]
pub enum Status {
    /// The exchange completed with a 2xx status and produced a response
    /// document.
    ///
    /// Non-2xx terminal statuses are reported as
    /// [`ErrorKind::Http`](crate::ErrorKind::Http) instead, carrying the
    /// status code.
    Fetched(Document),
    /// The fetch failed before a complete response arrived
    Error(ErrorKind),
}

impl Status {
    /// Returns `true` if a complete response with a 2xx status arrived
    #[inline]
    #[must_use]
    pub fn is_success(&self) -> bool {
        matches!(self, Status::Fetched(doc) if doc.code.is_success())
    }

    /// Returns `true` if the fetch failed in transit
    #[inline]
    #[must_use]
    pub const fn is_error(&self) -> bool {
        matches!(self, Status::Error(_))
    }

    /// Returns `true` if the fetch failed on a deadline
    #[inline]
    #[must_use]
    pub const fn is_timeout(&self) -> bool {
        matches!(
            self,
            Status::Error(ErrorKind::QueuedTimeout(_) | ErrorKind::ResponseTimeout(_))
        )
    }

    /// Return the HTTP status code (if any)
    #[must_use]
    pub fn code(&self) -> Option<StatusCode> {
        match self {
            Status::Fetched(doc) => Some(doc.code),
            Status::Error(e) => e
                .code()
                .and_then(|c| u16::try_from(c).ok())
                .and_then(|c| StatusCode::from_u16(c).ok()),
        }
    }

    /// Return the HTTP status code as string (if any)
    #[must_use]
    pub fn code_as_string(&self) -> String {
        match self {
            Status::Fetched(doc) => doc.code.as_str().to_string(),
            Status::Error(e) if self.is_timeout() => match e.code() {
                Some(code) => code.to_string(),
                None => "TIMEOUT".to_string(),
            },
            Status::Error(e) => match e.code() {
                Some(code) => code.to_string(),
                None => "ERROR".to_string(),
            },
        }
    }

    /// Return more details about the status (if any)
    #[must_use]
    pub fn details(&self) -> Option<String> {
        match self {
            Status::Fetched(doc) => doc.code.canonical_reason().map(String::from),
            Status::Error(e) => e.details(),
        }
    }

    #[must_use]
    /// Return a unicode icon to visualize the status
    pub fn icon(&self) -> &str {
        if self.is_timeout() {
            return ICON_TIMEOUT;
        }
        match self {
            Status::Fetched(_) => ICON_OK,
            Status::Error(_) => ICON_ERROR,
        }
    }
}

impl Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Status::Fetched(doc) => write!(f, "{}", doc.code),
            Status::Error(e) => write!(f, "{e}"),
        }
    }
}

impl Serialize for Status {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let mut s;

        if let Some(code) = self.code() {
            s = serializer.serialize_struct("Status", 2)?;
            s.serialize_field("text", &self.to_string())?;
            s.serialize_field("code", &code.as_u16())?;
        } else if let Some(details) = self.details() {
            s = serializer.serialize_struct("Status", 2)?;
            s.serialize_field("text", &self.to_string())?;
            s.serialize_field("details", &details)?;
        } else {
            s = serializer.serialize_struct("Status", 1)?;
            s.serialize_field("text", &self.to_string())?;
        }

        s.end()
    }
}

impl From<ErrorKind> for Status {
    fn from(e: ErrorKind) -> Self {
        Self::Error(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn doc(code: u16) -> Document {
        Document {
            code: StatusCode::from_u16(code).unwrap(),
            headers: HeaderMap::new(),
            body: Bytes::from_static(b"hello"),
        }
    }

    #[test]
    fn test_status_serialization() {
        let fetched = Status::Fetched(doc(200));
        let serialized = serde_json::to_string(&fetched).unwrap();
        assert_eq!("{\"text\":\"200 OK\",\"code\":200}", serialized);

        let timeout = Status::Error(ErrorKind::ResponseTimeout(Duration::from_secs(3)));
        let serialized = serde_json::to_string(&timeout).unwrap();
        assert_eq!("{\"text\":\"no response within 3s\"}", serialized);
    }

    #[test]
    fn test_success_requires_2xx() {
        assert!(Status::Fetched(doc(200)).is_success());
        assert!(Status::Fetched(doc(204)).is_success());
        assert!(!Status::Error(ErrorKind::Http(StatusCode::NOT_FOUND)).is_success());
        assert!(!Status::Error(ErrorKind::Canceled).is_success());
    }

    #[test]
    fn test_status_code() {
        assert_eq!(Status::Fetched(doc(200)).code().unwrap(), 200);
        assert_eq!(
            Status::Error(ErrorKind::Http(StatusCode::NOT_FOUND))
                .code()
                .unwrap(),
            404
        );
        assert_eq!(
            Status::Error(ErrorKind::Proxy(StatusCode::BAD_GATEWAY))
                .code()
                .unwrap(),
            502
        );
        assert_eq!(Status::Error(ErrorKind::Canceled).code(), None);
    }

    #[test]
    fn test_icons() {
        assert_eq!(Status::Fetched(doc(200)).icon(), "✔");
        assert_eq!(Status::Error(ErrorKind::Canceled).icon(), "✗");
        assert_eq!(
            Status::Error(ErrorKind::QueuedTimeout(Duration::from_secs(1))).icon(),
            "⧖"
        );
    }
}
