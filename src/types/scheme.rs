use std::fmt::Display;

use serde::{Deserialize, Serialize};
use url::Url;

use crate::ErrorKind;

/// URL scheme the engine can speak.
///
/// Everything else (`mailto:`, `file:`, `ftp:`, ...) is rejected at the
/// queue boundary with [`ErrorKind::UnsupportedScheme`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Scheme {
    /// Plain-text HTTP
    Http,
    /// HTTP over TLS
    Https,
}

impl Scheme {
    /// Extract the scheme from a URL, rejecting anything the engine
    /// cannot fetch.
    pub fn from_url(url: &Url) -> Result<Self, ErrorKind> {
        match url.scheme() {
            "http" => Ok(Self::Http),
            "https" => Ok(Self::Https),
            other => Err(ErrorKind::UnsupportedScheme(other.to_string())),
        }
    }

    /// Port used when the URL does not carry an explicit one.
    #[must_use]
    pub const fn default_port(self) -> u16 {
        match self {
            Self::Http => 80,
            Self::Https => 443,
        }
    }

    /// Whether connections for this scheme run a TLS handshake.
    #[must_use]
    pub const fn is_tls(self) -> bool {
        matches!(self, Self::Https)
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Http => "http",
            Self::Https => "https",
        }
    }
}

impl Display for Scheme {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
