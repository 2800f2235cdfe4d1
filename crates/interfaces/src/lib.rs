#![warn(missing_docs, unreachable_pub)]
#![deny(unused_must_use, rust_2018_idioms)]
#![doc(test(
    no_crate_inject,
    attr(deny(warnings, rust_2018_idioms), allow(dead_code, unused_variables))
))]

//! Contracts between the comb engines and the subsystems they consume: the
//! chunk network, the block-height oracle, the signing and ownership oracles,
//! and the name-resolution oracle.

/// Chunks, the chunk store contract, and chunk validation.
mod chunk;

/// Block-height oracle.
mod block;

/// Signing oracle.
mod signer;

/// Ownership oracle.
mod owner;

/// Name-resolution oracle.
mod name;

pub use block::{BlockEstimator, BlockSource, BlockSourceError};
pub use chunk::{
    Chunk, ChunkStore, ChunkStoreError, ChunkValidator, ContentAddressValidator, StoreError,
    StoredSignal,
};
pub use name::{LabelNameHasher, NameHasher};
pub use owner::{OwnerValidator, OwnerValidatorError};
pub use signer::{KeypairSigner, Signer, SignerError};

#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;
