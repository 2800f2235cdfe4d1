//! In-memory oracle implementations for tests.

use crate::{
    BlockSource, BlockSourceError, Chunk, ChunkStore, ChunkStoreError, ChunkValidator,
    OwnerValidator, OwnerValidatorError, StoreError,
};
use comb_primitives::{Address, ChunkKey};
use parking_lot::Mutex;
use std::{
    collections::{HashMap, HashSet},
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

/// A [`ChunkStore`] backed by a map.
///
/// When validators are registered, a chunk must be accepted by at least one
/// of them to enter the store.
#[derive(Default)]
pub struct MemoryChunkStore {
    chunks: Mutex<HashMap<ChunkKey, bytes::Bytes>>,
    validators: Vec<Arc<dyn ChunkValidator>>,
    failing: AtomicBool,
}

impl MemoryChunkStore {
    /// Creates an empty store with no validators.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a validator consulted on every `put`.
    pub fn with_validator(mut self, validator: Arc<dyn ChunkValidator>) -> Self {
        self.validators.push(validator);
        self
    }

    /// Makes every subsequent `put` report a store failure.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::Relaxed);
    }

    /// Whether a chunk is stored under `key`.
    pub fn contains(&self, key: &ChunkKey) -> bool {
        self.chunks.lock().contains_key(key)
    }

    /// Number of stored chunks.
    pub fn len(&self) -> usize {
        self.chunks.lock().len()
    }

    /// Whether the store holds no chunks.
    pub fn is_empty(&self) -> bool {
        self.chunks.lock().is_empty()
    }
}

#[async_trait::async_trait]
impl ChunkStore for MemoryChunkStore {
    fn put(&self, chunk: Chunk) {
        if self.failing.load(Ordering::Relaxed) {
            chunk.mark_stored(Err(StoreError("simulated store failure".to_string())));
            return;
        }
        if !self.validators.is_empty()
            && !self.validators.iter().any(|v| v.validate(&chunk.key, &chunk.data))
        {
            chunk.mark_stored(Err(StoreError("chunk rejected by validators".to_string())));
            return;
        }
        self.chunks.lock().insert(chunk.key, chunk.data.clone());
        chunk.mark_stored(Ok(()));
    }

    async fn get(&self, key: ChunkKey, _timeout: Duration) -> Result<Chunk, ChunkStoreError> {
        let data = self.chunks.lock().get(&key).cloned();
        data.map(|data| Chunk::new(key, data)).ok_or(ChunkStoreError::NotFound(key))
    }
}

/// A [`BlockSource`] with an externally settable height.
#[derive(Debug, Default)]
pub struct TestBlockSource {
    height: AtomicU64,
}

impl TestBlockSource {
    /// Creates a source reporting `height`.
    pub fn new(height: u64) -> Self {
        Self { height: AtomicU64::new(height) }
    }

    /// Sets the reported head height.
    pub fn set_height(&self, height: u64) {
        self.height.store(height, Ordering::Relaxed);
    }
}

#[async_trait::async_trait]
impl BlockSource for TestBlockSource {
    async fn head_block_number(&self, _name: &str) -> Result<u64, BlockSourceError> {
        Ok(self.height.load(Ordering::Relaxed))
    }
}

/// An [`OwnerValidator`] over an adjustable set of approved addresses.
#[derive(Debug, Default)]
pub struct TestOwnerValidator {
    approved: Mutex<HashSet<Address>>,
}

impl TestOwnerValidator {
    /// Creates a validator approving exactly the given addresses.
    pub fn approving(addresses: impl IntoIterator<Item = Address>) -> Self {
        Self { approved: Mutex::new(addresses.into_iter().collect()) }
    }

    /// Creates a validator rejecting every address.
    pub fn rejecting() -> Self {
        Self::default()
    }

    /// Approves an address.
    pub fn approve(&self, address: Address) {
        self.approved.lock().insert(address);
    }

    /// Revokes a previously approved address.
    pub fn revoke(&self, address: Address) {
        self.approved.lock().remove(&address);
    }
}

impl OwnerValidator for TestOwnerValidator {
    fn validate_owner(&self, _name: &str, address: Address) -> Result<bool, OwnerValidatorError> {
        Ok(self.approved.lock().contains(&address))
    }
}
