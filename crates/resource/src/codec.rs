//! Binary layouts of resource metadata and update chunks.
//!
//! A metadata chunk body is `0x0000 || start_block || frequency || name`;
//! the two leading zero bytes disambiguate it from update chunks, whose
//! first field is a header length that is always at least 9. An update
//! chunk body is
//!
//! ```text
//! header_length (u16 le) || data_length (u16 le) ||
//! period (u32 le) || version (u32 le) || name || payload || [signature]
//! ```
//!
//! where `header_length = 8 + |name|` and a `data_length` of zero signals
//! that the payload is a self-describing multihash. All integers are
//! little-endian. This module is the single place chunk bytes are read.

use crate::error::{ResourceError, ResourceResult};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use comb_primitives::{RecoverableSignature, METADATA_CHUNK_OFFSET, SIGNATURE_LENGTH};
use tracing::warn;

/// Absolute minimum length of an update chunk body: the four header bytes,
/// period, version, one byte of name and one byte of data.
pub const MIN_UPDATE_LENGTH: usize = 14;

/// Decoded body of a resource metadata chunk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceMetadata {
    /// Block height at which the resource was registered.
    pub start_block: u64,
    /// Update frequency in blocks.
    pub frequency: u64,
    /// Resource identifier.
    pub name: String,
}

impl ResourceMetadata {
    /// Encodes the metadata chunk body.
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(METADATA_CHUNK_OFFSET + self.name.len());
        buf.put_u16_le(0);
        buf.put_u64_le(self.start_block);
        buf.put_u64_le(self.frequency);
        buf.put_slice(self.name.as_bytes());
        buf.freeze()
    }

    /// Decodes a metadata chunk body.
    pub fn decode(data: &[u8]) -> ResourceResult<Self> {
        if data.len() < 2 || data[..2] != [0, 0] {
            return Err(ResourceError::CorruptData(
                "chunk is not a resource metadata chunk".to_string(),
            ));
        }
        if data.len() <= METADATA_CHUNK_OFFSET {
            return Err(ResourceError::NothingToReturn(format!(
                "invalid chunk length {}, should be minimum {}",
                data.len(),
                METADATA_CHUNK_OFFSET + 1
            )));
        }
        let mut buf = &data[2..];
        let start_block = buf.get_u64_le();
        let frequency = buf.get_u64_le();
        let name = std::str::from_utf8(&data[METADATA_CHUNK_OFFSET..])
            .map_err(|_| ResourceError::CorruptData("name is not valid utf-8".to_string()))?
            .to_string();
        Ok(Self { start_block, frequency, name })
    }
}

/// Decoded body of a resource update chunk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceUpdate {
    /// Update period, starting at 1.
    pub period: u32,
    /// Version within the period, starting at 1.
    pub version: u32,
    /// Resource identifier.
    pub name: String,
    /// Update payload.
    pub payload: Bytes,
    /// Whether the payload is a self-describing multihash.
    pub multihash: bool,
    /// Trailing signature, present iff signing is enabled.
    pub signature: Option<RecoverableSignature>,
}

impl ResourceUpdate {
    fn encode_body(&self) -> BytesMut {
        let header_length = self.name.len() + 8;
        // a declared data length of zero marks multihash content
        let declared = if self.multihash { 0 } else { self.payload.len() };
        let mut buf = BytesMut::with_capacity(4 + header_length + self.payload.len());
        buf.put_u16_le(header_length as u16);
        buf.put_u16_le(declared as u16);
        buf.put_u32_le(self.period);
        buf.put_u32_le(self.version);
        buf.put_slice(self.name.as_bytes());
        buf.put_slice(&self.payload);
        buf
    }

    /// Returns the bytes covered by the update signature: the encoded body
    /// without the trailing signature itself.
    pub fn signed_body(&self) -> Bytes {
        self.encode_body().freeze()
    }

    /// Encodes the update chunk body, including the signature when present.
    pub fn encode(&self) -> Bytes {
        let mut buf = self.encode_body();
        if let Some(sig) = &self.signature {
            buf.put_slice(sig.as_bytes());
        }
        buf.freeze()
    }

    /// Decodes an update chunk body.
    ///
    /// `signing_enabled` states whether a trailing signature is expected;
    /// without it the signature bytes are not interpreted.
    pub fn decode(data: &[u8], signing_enabled: bool) -> ResourceResult<Self> {
        if data.len() < MIN_UPDATE_LENGTH {
            return Err(ResourceError::NothingToReturn(format!(
                "chunk of {} bytes cannot be a resource update",
                data.len()
            )));
        }
        let mut buf = &data[..];
        let header_length = buf.get_u16_le() as usize;
        let data_length = buf.get_u16_le() as usize;

        if data_length == 0 {
            // multihash content: both leading varints must at least be readable
            let offset = header_length + 4;
            if offset >= data.len() {
                return Err(ResourceError::CorruptData(
                    "multihash lies beyond the chunk end".to_string(),
                ));
            }
            let rest = &data[offset..];
            let Some((_, read)) = uvarint(rest) else {
                return Err(ResourceError::CorruptData(
                    "corrupt multihash, hash id varint could not be read".to_string(),
                ));
            };
            if uvarint(&rest[read..]).is_none() {
                return Err(ResourceError::CorruptData(
                    "corrupt multihash, hash length field could not be read".to_string(),
                ));
            }
        }

        // total length excluding any signature; for multihash content the
        // declared data length is zero and the payload length is read below
        let body_length = header_length + data_length + 4;
        if body_length > data.len() || body_length < MIN_UPDATE_LENGTH {
            return Err(ResourceError::NothingToReturn(format!(
                "reported header length {header_length} + data length {data_length} does not fit chunk of {} bytes",
                data.len()
            )));
        }

        let period = buf.get_u32_le();
        let version = buf.get_u32_le();

        if header_length < 9 {
            return Err(ResourceError::CorruptData(format!(
                "header length {header_length} leaves no room for a name"
            )));
        }
        let name_length = header_length - 8;
        let name = std::str::from_utf8(&data[12..12 + name_length])
            .map_err(|_| ResourceError::CorruptData("name is not valid utf-8".to_string()))?
            .to_string();
        let mut cursor = 12 + name_length;

        let (payload_length, multihash) = if data_length == 0 {
            let length = multihash_length(&data[cursor..]);
            if length == 0 {
                return Err(ResourceError::CorruptData("invalid multihash payload".to_string()));
            }
            let boundary = cursor + length;
            if data.len() != boundary && data.len() < boundary + SIGNATURE_LENGTH {
                return Err(ResourceError::CorruptData(
                    "multihash does not align with the chunk end".to_string(),
                ));
            }
            (length, true)
        } else {
            (data_length, false)
        };
        let payload = Bytes::copy_from_slice(&data[cursor..cursor + payload_length]);
        cursor += payload_length;

        let signature = if signing_enabled {
            let end = cursor + SIGNATURE_LENGTH;
            if data.len() < end {
                return Err(ResourceError::CorruptData(
                    "signature missing or truncated".to_string(),
                ));
            }
            RecoverableSignature::from_slice(&data[cursor..end])
        } else {
            None
        };

        Ok(Self { period, version, name, payload, multihash, signature })
    }
}

/// Returns the encoded length of the multihash at the start of `data`:
/// `uvarint(hash type) || uvarint(hash length) || hash`. Returns 0 if the
/// bytes do not parse as a multihash.
pub fn multihash_length(data: &[u8]) -> usize {
    let Some((_, mut cursor)) = uvarint(data) else {
        warn!(target: "storage::resource", "corrupt multihash data, hash type is unreadable");
        return 0;
    };
    let Some((hash_length, read)) = uvarint(&data[cursor..]) else {
        warn!(target: "storage::resource", "corrupt multihash data, hash length is unreadable");
        return 0;
    };
    cursor += read;
    let hash_length = hash_length as usize;
    if data.len() - cursor < hash_length {
        warn!(
            target: "storage::resource",
            "corrupt multihash data, hash does not align with data boundary"
        );
        return 0;
    }
    cursor + hash_length
}

/// Decodes an unsigned LEB128 varint, returning the value and the number of
/// bytes read, or `None` if the buffer ends mid-varint or overflows 64 bits.
fn uvarint(data: &[u8]) -> Option<(u64, usize)> {
    let mut value = 0u64;
    let mut shift = 0u32;
    for (i, byte) in data.iter().enumerate() {
        if i == 10 {
            return None;
        }
        if *byte < 0x80 {
            if i == 9 && *byte > 1 {
                return None;
            }
            return Some((value | ((*byte as u64) << shift), i + 1));
        }
        value |= ((byte & 0x7f) as u64) << shift;
        shift += 7;
    }
    None
}
