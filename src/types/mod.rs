#![allow(unreachable_pub)]

mod error;
mod priority;
mod request;
mod result;
mod scheme;
mod status;

pub use error::{ErrorGroup, ErrorKind};
pub use priority::{PRIORITY_LEVELS, Priority};
pub use request::FetchRequest;
pub use result::{FetchResult, FetchTiming, RequestId};
pub use scheme::Scheme;
pub use status::{Document, Status};

/// The lib's `Result` type
pub type Result<T> = std::result::Result<T, crate::ErrorKind>;
