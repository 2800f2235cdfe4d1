use bytes::Bytes;
use comb_primitives::{keccak256, ChunkKey};
use std::{sync::Arc, time::Duration};
use tokio::sync::watch;

/// Error reported through a chunk's stored signal when persisting fails.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("chunk not stored: {0}")]
pub struct StoreError(pub String);

/// Errors returned by chunk retrieval.
#[derive(Debug, thiserror::Error)]
pub enum ChunkStoreError {
    /// No chunk exists under the key.
    #[error("chunk {0} not found")]
    NotFound(ChunkKey),
    /// Retrieval did not finish within the given timeout.
    #[error("chunk {0} retrieve timed out")]
    Timeout(ChunkKey),
    /// Underlying store failure.
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Single-shot acknowledgement that a chunk has been persisted.
///
/// Producers attach one of these to every chunk; the store resolves it at
/// most once, and any number of clones can await the outcome.
#[derive(Clone, Debug)]
pub struct StoredSignal {
    tx: Arc<watch::Sender<Option<Result<(), StoreError>>>>,
}

impl StoredSignal {
    fn new() -> Self {
        let (tx, _rx) = watch::channel(None);
        Self { tx: Arc::new(tx) }
    }

    /// Resolves the signal. Only the first resolution is observed.
    pub fn resolve(&self, result: Result<(), StoreError>) {
        self.tx.send_if_modified(|slot| {
            if slot.is_none() {
                *slot = Some(result);
                true
            } else {
                false
            }
        });
    }

    /// Waits until the store acknowledged the chunk, or reported a failure.
    pub async fn stored(&self) -> Result<(), StoreError> {
        let mut rx = self.tx.subscribe();
        loop {
            let resolved = rx.borrow_and_update().clone();
            if let Some(result) = resolved {
                return result;
            }
            // the sender lives in self, so changed() cannot fail while we hold it
            if rx.changed().await.is_err() {
                return Err(StoreError("stored signal dropped".to_string()));
            }
        }
    }
}

/// A fixed-size content blob addressed by a 32-byte key.
#[derive(Clone, Debug)]
pub struct Chunk {
    /// Storage key of the chunk.
    pub key: ChunkKey,
    /// Chunk body.
    pub data: Bytes,
    stored: StoredSignal,
}

impl Chunk {
    /// Creates a chunk stored under an explicit key.
    pub fn new(key: ChunkKey, data: impl Into<Bytes>) -> Self {
        Self { key, data: data.into(), stored: StoredSignal::new() }
    }

    /// Creates a chunk keyed by the keccak256 content address of its body.
    pub fn content_addressed(data: impl Into<Bytes>) -> Self {
        let data = data.into();
        Self::new(keccak256(&data), data)
    }

    /// Returns the stored signal attached to this chunk.
    pub fn stored_signal(&self) -> &StoredSignal {
        &self.stored
    }

    /// Resolves the stored signal; called by the store once the chunk is
    /// persisted or rejected.
    pub fn mark_stored(&self, result: Result<(), StoreError>) {
        self.stored.resolve(result)
    }

    /// Waits for the store to acknowledge persistence of this chunk.
    pub async fn stored(&self) -> Result<(), StoreError> {
        self.stored.stored().await
    }
}

/// Content-addressed chunk storage.
#[async_trait::async_trait]
pub trait ChunkStore: Send + Sync {
    /// Hands the chunk to the store. Must not block; persistence is
    /// acknowledged asynchronously through the chunk's stored signal.
    fn put(&self, chunk: Chunk);

    /// Retrieves the chunk stored under `key`, waiting up to `timeout`.
    async fn get(&self, key: ChunkKey, timeout: Duration) -> Result<Chunk, ChunkStoreError>;
}

/// Gatekeeper invoked by the store on every chunk write.
pub trait ChunkValidator: Send + Sync {
    /// Returns whether the chunk may enter the store.
    fn validate(&self, key: &ChunkKey, data: &[u8]) -> bool;
}

/// Accepts chunks whose key is the keccak256 content address of the body.
#[derive(Debug, Default, Clone, Copy)]
pub struct ContentAddressValidator;

impl ChunkValidator for ContentAddressValidator {
    fn validate(&self, key: &ChunkKey, data: &[u8]) -> bool {
        keccak256(data) == *key
    }
}
