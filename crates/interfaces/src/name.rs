use comb_primitives::{keccak256, B256};

/// Oracle mapping an identifier to its canonical 32-byte hash.
pub trait NameHasher: Send + Sync {
    /// Canonical hash of the identifier. Pure and deterministic.
    fn name_hash(&self, name: &str) -> B256;
}

/// Hierarchical keccak256 namehash over dot-separated labels.
///
/// The hash of the empty name is all zeroes; each label folds in from the
/// rightmost: `node = keccak256(node || keccak256(label))`.
#[derive(Debug, Default, Clone, Copy)]
pub struct LabelNameHasher;

impl NameHasher for LabelNameHasher {
    fn name_hash(&self, name: &str) -> B256 {
        let mut node = B256::ZERO;
        if name.is_empty() {
            return node;
        }
        for label in name.rsplit('.') {
            let mut buf = [0u8; 64];
            buf[..32].copy_from_slice(node.as_slice());
            buf[32..].copy_from_slice(keccak256(label.as_bytes()).as_slice());
            node = keccak256(buf);
        }
        node
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_name_hashes_to_zero() {
        assert_eq!(LabelNameHasher.name_hash(""), B256::ZERO);
    }

    #[test]
    fn label_order_matters() {
        let hasher = LabelNameHasher;
        assert_ne!(hasher.name_hash("foo.bar"), hasher.name_hash("bar.foo"));
        assert_ne!(hasher.name_hash("foo.bar"), hasher.name_hash("foobar"));
    }

    #[test]
    fn hash_is_deterministic() {
        let hasher = LabelNameHasher;
        assert_eq!(hasher.name_hash("foo.bar"), hasher.name_hash("foo.bar"));
    }
}
