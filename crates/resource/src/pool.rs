//! A bounded pool of reusable keccak256 hashers.

use comb_primitives::B256;
use parking_lot::Mutex;
use sha3::{Digest, Keccak256};

/// Number of hashers the pool is pre-seeded with.
pub const HASHER_COUNT: usize = 8;

/// A bounded stack of reusable 32-byte hashers.
///
/// Acquisition and release never block beyond the guard itself; when the
/// stack is empty a fresh hasher is constructed, and releases beyond the
/// capacity are dropped.
#[derive(Debug)]
pub struct HasherPool {
    free: Mutex<Vec<Keccak256>>,
    capacity: usize,
}

impl Default for HasherPool {
    fn default() -> Self {
        Self::new(HASHER_COUNT)
    }
}

impl HasherPool {
    /// Creates a pool pre-seeded with `capacity` hashers.
    pub fn new(capacity: usize) -> Self {
        Self { free: Mutex::new((0..capacity).map(|_| Keccak256::new()).collect()), capacity }
    }

    /// Hashes the concatenation of `parts` with a pooled hasher.
    pub fn hash(&self, parts: &[&[u8]]) -> B256 {
        let mut hasher = self.acquire();
        for part in parts {
            hasher.update(part);
        }
        let digest = hasher.finalize_reset();
        self.release(hasher);
        B256::from_slice(&digest)
    }

    fn acquire(&self) -> Keccak256 {
        self.free.lock().pop().unwrap_or_default()
    }

    fn release(&self, hasher: Keccak256) {
        let mut free = self.free.lock();
        if free.len() < self.capacity {
            free.push(hasher);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use comb_primitives::keccak256;

    #[test]
    fn pooled_hash_matches_one_shot_keccak() {
        let pool = HasherPool::default();
        let digest = pool.hash(&[b"abc", b"def"]);
        assert_eq!(digest, keccak256(b"abcdef"));
    }

    #[test]
    fn hashers_are_reusable_after_release() {
        let pool = HasherPool::new(1);
        let first = pool.hash(&[b"one"]);
        let second = pool.hash(&[b"one"]);
        assert_eq!(first, second);
    }

    #[test]
    fn empty_pool_constructs_fresh_hashers() {
        let pool = HasherPool::new(0);
        assert_eq!(pool.hash(&[b"abc"]), keccak256(b"abc"));
    }
}
