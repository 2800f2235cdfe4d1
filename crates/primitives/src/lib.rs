#![warn(missing_docs, unreachable_pub)]
#![deny(unused_must_use, rust_2018_idioms)]
#![doc(test(
    no_crate_inject,
    attr(deny(warnings, rust_2018_idioms), allow(dead_code, unused_variables))
))]

//! Primitive types shared by the comb mutable-resource engine and the
//! overlay routing table.

use std::fmt;

pub mod crypto;

pub use alloy_primitives::{self, hex, keccak256, Address, B256};

/// Storage key of a chunk in the content-addressed store.
pub type ChunkKey = B256;

/// 32-byte overlay address of a node.
pub type OverlayAddress = B256;

/// Byte length of a recoverable ECDSA signature.
pub const SIGNATURE_LENGTH: usize = 65;

/// Maximum byte length of a chunk body.
pub const CHUNK_SIZE: usize = 4096;

/// Byte length of the fixed-size portion of a resource metadata chunk:
/// `0x0000 || start_block || frequency`.
pub const METADATA_CHUNK_OFFSET: usize = 18;

/// Digest size of the chunk hash in bytes.
pub const HASH_SIZE: usize = 32;

/// A 65-byte recoverable ECDSA signature laid out as `r || s || recovery_id`.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct RecoverableSignature(pub [u8; SIGNATURE_LENGTH]);

impl RecoverableSignature {
    /// Returns the raw signature bytes.
    pub const fn as_bytes(&self) -> &[u8; SIGNATURE_LENGTH] {
        &self.0
    }

    /// Parses a signature from a byte slice, which must be exactly 65 bytes.
    pub fn from_slice(data: &[u8]) -> Option<Self> {
        let bytes: [u8; SIGNATURE_LENGTH] = data.try_into().ok()?;
        Some(Self(bytes))
    }
}

impl From<[u8; SIGNATURE_LENGTH]> for RecoverableSignature {
    fn from(bytes: [u8; SIGNATURE_LENGTH]) -> Self {
        Self(bytes)
    }
}

impl AsRef<[u8]> for RecoverableSignature {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Debug for RecoverableSignature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RecoverableSignature({})", hex::encode(self.0))
    }
}

impl fmt::Display for RecoverableSignature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signature_from_slice_checks_length() {
        assert!(RecoverableSignature::from_slice(&[0u8; 64]).is_none());
        assert!(RecoverableSignature::from_slice(&[0u8; 66]).is_none());
        assert!(RecoverableSignature::from_slice(&[0u8; 65]).is_some());
    }

    #[test]
    fn signature_display_is_hex() {
        let sig = RecoverableSignature([0xab; 65]);
        assert_eq!(sig.to_string(), "ab".repeat(65));
    }
}
