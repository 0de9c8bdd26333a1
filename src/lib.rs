//! `trawl` is a library for polite, high-concurrency web fetching.
//! "Hello world" example:
//! ```no_run
//! use trawl::Result;
//!
//! fn main() -> Result<()> {
//!     let result = trawl::fetch("https://example.com")?;
//!     println!("{result}");
//!     Ok(())
//! }
//! ```
//!
//! For more specific use-cases you can build a client yourself, using
//! the [`ClientBuilder`], which grants full control over concurrency,
//! politeness and per-server policies:
//!
//! ```no_run
//! use trawl::{ClientBuilder, ErrorKind, Result};
//!
//! fn main() -> Result<()> {
//!     let client = ClientBuilder::builder()
//!         .host_interval(std::time::Duration::from_secs(2))
//!         .build()
//!         .client()?;
//!     client.put_request("https://example.com".try_into()?)?;
//!     let result = client.result().ok_or(ErrorKind::Canceled)?;
//!     assert!(result.status.is_success());
//!     Ok(())
//! }
//! ```
//!
//! Requests go in through a bounded queue and never block on the
//! network; results come back in completion order. One engine thread
//! multiplexes every connection, spaces fetches to the same host by a
//! politeness interval, pools keep-alive connections per server and
//! disables servers whose recent exchanges keep failing.

#[cfg(doctest)]
doc_comment::doctest!("../README.md");

mod channel;
mod client;
mod config;
mod dns;
mod engine;
mod message;
mod reactor;
mod redirect;
mod resource;
mod types;

#[cfg(test)]
mod test_utils;

pub use client::{
    Client, ClientBuilder, ClientStats, DEFAULT_DNS_REFRESH, DEFAULT_DNS_RETRY,
    DEFAULT_HOST_CACHE_LIMIT, DEFAULT_HOST_INTERVAL, DEFAULT_MAX_CONNECTIONS,
    DEFAULT_QUEUE_CAPACITY, DEFAULT_SERVER_CACHE_LIMIT, ResultCallback, fetch,
};
pub use config::{
    ConcurrencyMode, DEFAULT_MAX_BODY_SIZE, DEFAULT_MAX_REDIRECTS, DEFAULT_MAX_RETRIES,
    DEFAULT_RESPONSE_TIMEOUT_SECS, DEFAULT_USER_AGENT, FetchConfig, ServerPolicy,
};
pub use dns::{GaiResolver, Resolve};
pub use types::*;
