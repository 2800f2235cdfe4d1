#![warn(missing_docs, unreachable_pub)]
#![deny(unused_must_use, rust_2018_idioms)]
#![doc(test(
    no_crate_inject,
    attr(deny(warnings, rust_2018_idioms), allow(dead_code, unused_variables))
))]

//! Mutable resources over an immutable, content-addressed chunk store.
//!
//! A resource is registered once through a content-addressed metadata chunk
//! and then updated by publishing one-chunk updates at keys derived from
//! `(period, version, name hash)`. Readers discover the newest update with a
//! bounded backward walk over periods. Updates may carry a recoverable
//! signature checked against an ownership oracle.

/// Wire layouts of metadata and update chunks.
pub mod codec;

/// Mapping between block heights and update periods.
pub mod period;

mod error;
mod handler;
mod pool;

pub use error::{ResourceError, ResourceResult};
pub use handler::{
    is_safe_name, to_safe_name, LookupParams, Resource, ResourceHandler, ResourceHandlerParams,
    DEFAULT_RETRIEVE_TIMEOUT, DEFAULT_STORE_TIMEOUT,
};
pub use pool::{HasherPool, HASHER_COUNT};
