//! The scheduling layer: which resource goes out next, and when.
//!
//! Admission is two-level. Every target host gets a `HostChannel` with
//! its own politeness clock and priority queue; hosts that resolve to
//! the same address set share a `ServerChannel`, which owns the
//! connection pool, the concurrency budget and the rolling error
//! statistics. The `ChannelManager` wires the two together and is the
//! only mutator of either.

mod host;
mod manager;
mod registry;
mod server;
mod stats;

pub(crate) use host::HostKey;
pub(crate) use manager::{Admission, ChannelManager, Dispatch, DnsQuery};
pub(crate) use registry::{HostId, ServerId};
