//! The mutable resource engine.
//!
//! Simulates a mutable document on top of an immutable, content-addressed
//! chunk store. The root entry of a resource is a content-addressed metadata
//! chunk recording the registration block, the update frequency, and the
//! identifier. Updates are published at predictable keys derived from
//! `(period, version, name hash)` and discovered by a bounded backward walk
//! over periods, with a forward scan over versions within a period.

use crate::{
    codec::{multihash_length, ResourceMetadata, ResourceUpdate},
    error::{ResourceError, ResourceResult},
    period,
    pool::{HasherPool, HASHER_COUNT},
};
use bytes::Bytes;
use comb_interfaces::{
    BlockSource, Chunk, ChunkStore, ChunkValidator, NameHasher, OwnerValidator, Signer,
};
use comb_primitives::{crypto, Address, ChunkKey, B256, CHUNK_SIZE, SIGNATURE_LENGTH};
use parking_lot::RwLock;
use std::{
    collections::HashMap,
    sync::Arc,
    time::{Duration, Instant},
};
use tracing::{debug, error, trace};

/// Default time the engine waits for the store to acknowledge an update.
pub const DEFAULT_STORE_TIMEOUT: Duration = Duration::from_millis(4000);

/// Default time allowed for a single chunk retrieval during lookups.
pub const DEFAULT_RETRIEVE_TIMEOUT: Duration = Duration::from_millis(100);

/// Bounds for the backward period search in lookups.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct LookupParams {
    /// Whether the search is bounded at all.
    pub limit: bool,
    /// Maximum number of period hops when `limit` is set.
    pub max: u32,
}

impl LookupParams {
    /// A search bounded only by period 1.
    pub const fn unbounded() -> Self {
        Self { limit: false, max: 0 }
    }

    /// A search bounded to `max` period hops.
    pub const fn bounded(max: u32) -> Self {
        Self { limit: true, max }
    }
}

/// The state of one mutable resource as currently loaded in the index.
///
/// Returned values are snapshots; the handler keeps the live entry.
#[derive(Debug, Clone)]
pub struct Resource {
    name: String,
    name_hash: B256,
    start_block: u64,
    frequency: u64,
    last_period: u32,
    version: u32,
    last_key: ChunkKey,
    data: Bytes,
    multihash: bool,
    updated: Option<Instant>,
}

impl Resource {
    /// Resource identifier.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Canonical hash of the identifier.
    pub fn name_hash(&self) -> B256 {
        self.name_hash
    }

    /// Block height at which the resource was registered.
    pub fn start_block(&self) -> u64 {
        self.start_block
    }

    /// Update frequency in blocks.
    pub fn frequency(&self) -> u64 {
        self.frequency
    }

    /// Period of the update currently loaded.
    pub fn last_period(&self) -> u32 {
        self.last_period
    }

    /// Version of the update currently loaded.
    pub fn version(&self) -> u32 {
        self.version
    }

    /// Chunk key of the update currently loaded.
    pub fn last_key(&self) -> ChunkKey {
        self.last_key
    }

    /// Payload of the update currently loaded.
    pub fn data(&self) -> &Bytes {
        &self.data
    }

    /// Whether the loaded payload is a self-describing multihash.
    pub fn is_multihash(&self) -> bool {
        self.multihash
    }

    /// Whether the entry has ever been refreshed from a chunk or created
    /// locally.
    pub fn is_synced(&self) -> bool {
        self.updated.is_some()
    }
}

/// Construction parameters for [`ResourceHandler`].
pub struct ResourceHandlerParams {
    /// Source of the current block height.
    pub block_source: Arc<dyn BlockSource>,
    /// Canonical identifier hashing.
    pub name_hasher: Arc<dyn NameHasher>,
    /// Update signing; `None` publishes unsigned updates.
    pub signer: Option<Arc<dyn Signer>>,
    /// Ownership oracle; `None` skips authorisation checks.
    pub owner_validator: Option<Arc<dyn OwnerValidator>>,
    /// Default bounds for backward period searches.
    pub query_max_periods: LookupParams,
    /// Time to wait for store acknowledgement of an update.
    pub store_timeout: Duration,
    /// Time allowed per chunk retrieval.
    pub retrieve_timeout: Duration,
}

impl ResourceHandlerParams {
    /// Creates parameters with defaults for everything but the required
    /// oracles.
    pub fn new(block_source: Arc<dyn BlockSource>, name_hasher: Arc<dyn NameHasher>) -> Self {
        Self {
            block_source,
            name_hasher,
            signer: None,
            owner_validator: None,
            query_max_periods: LookupParams::unbounded(),
            store_timeout: DEFAULT_STORE_TIMEOUT,
            retrieve_timeout: DEFAULT_RETRIEVE_TIMEOUT,
        }
    }

    /// Enables signing of published updates.
    pub fn with_signer(mut self, signer: Arc<dyn Signer>) -> Self {
        self.signer = Some(signer);
        self
    }

    /// Enables ownership checks against the given oracle.
    pub fn with_owner_validator(mut self, validator: Arc<dyn OwnerValidator>) -> Self {
        self.owner_validator = Some(validator);
        self
    }

    /// Sets the default backward search bounds.
    pub fn with_query_max_periods(mut self, params: LookupParams) -> Self {
        self.query_max_periods = params;
        self
    }

    /// Sets the store acknowledgement timeout.
    pub fn with_store_timeout(mut self, timeout: Duration) -> Self {
        self.store_timeout = timeout;
        self
    }

    /// Sets the per-retrieval timeout.
    pub fn with_retrieve_timeout(mut self, timeout: Duration) -> Self {
        self.retrieve_timeout = timeout;
        self
    }
}

/// Handler for mutable resources over a content-addressed chunk store.
pub struct ResourceHandler {
    chunk_store: RwLock<Option<Arc<dyn ChunkStore>>>,
    block_source: Arc<dyn BlockSource>,
    name_hasher: Arc<dyn NameHasher>,
    signer: Option<Arc<dyn Signer>>,
    owner_validator: Option<Arc<dyn OwnerValidator>>,
    resources: RwLock<HashMap<B256, Resource>>,
    hash_pool: HasherPool,
    query_max_periods: LookupParams,
    store_timeout: Duration,
    retrieve_timeout: Duration,
}

impl ResourceHandler {
    /// Creates a handler; bind a store with [`Self::set_store`] before
    /// publishing or looking anything up.
    pub fn new(params: ResourceHandlerParams) -> Self {
        Self {
            chunk_store: RwLock::new(None),
            block_source: params.block_source,
            name_hasher: params.name_hasher,
            signer: params.signer,
            owner_validator: params.owner_validator,
            resources: RwLock::new(HashMap::new()),
            hash_pool: HasherPool::new(HASHER_COUNT),
            query_max_periods: params.query_max_periods,
            store_timeout: params.store_timeout,
            retrieve_timeout: params.retrieve_timeout,
        }
    }

    /// Binds the chunk store backend.
    pub fn set_store(&self, store: Arc<dyn ChunkStore>) {
        *self.chunk_store.write() = Some(store);
    }

    /// Whether published chunks are checked against an ownership oracle.
    pub fn is_validated(&self) -> bool {
        self.owner_validator.is_some()
    }

    fn store(&self) -> ResourceResult<Arc<dyn ChunkStore>> {
        self.chunk_store.read().clone().ok_or_else(|| {
            ResourceError::Init("bind a chunk store before this operation".to_string())
        })
    }

    /// Key of the update chunk for `(period, version, name_hash)`.
    ///
    /// Never the content hash of the body; the derived location is what
    /// makes the resource mutable at a predictable address.
    fn update_chunk_key(&self, period: u32, version: u32, name_hash: B256) -> ChunkKey {
        self.hash_pool.hash(&[
            &period.to_le_bytes(),
            &version.to_le_bytes(),
            name_hash.as_slice(),
        ])
    }

    /// The digest signed for an update: the chunk key followed by the body
    /// without its signature.
    fn key_data_digest(&self, key: &ChunkKey, body: &[u8]) -> B256 {
        self.hash_pool.hash(&[key.as_slice(), body])
    }

    fn check_access(&self, name: &str, address: Address) -> ResourceResult<bool> {
        match &self.owner_validator {
            None => Ok(true),
            Some(validator) => Ok(validator.validate_owner(name, address)?),
        }
    }

    async fn head_block(&self, name: &str) -> ResourceResult<u64> {
        Ok(self.block_source.head_block_number(name).await?)
    }

    fn resource(&self, name_hash: &B256) -> Option<Resource> {
        self.resources.read().get(name_hash).cloned()
    }

    fn synced_resource(&self, name_hash: &B256) -> ResourceResult<Resource> {
        let rsrc = self
            .resource(name_hash)
            .ok_or_else(|| ResourceError::NotFound("resource does not exist".to_string()))?;
        if !rsrc.is_synced() {
            return Err(ResourceError::NotSynced("resource is not synced".to_string()));
        }
        Ok(rsrc)
    }

    /// Name and currently loaded payload of a synced resource.
    pub fn content(&self, name_hash: &B256) -> ResourceResult<(String, Bytes)> {
        let rsrc = self.synced_resource(name_hash)?;
        Ok((rsrc.name, rsrc.data))
    }

    /// Period of the update currently loaded for a synced resource.
    pub fn last_period(&self, name_hash: &B256) -> ResourceResult<u32> {
        Ok(self.synced_resource(name_hash)?.last_period)
    }

    /// Version of the update currently loaded for a synced resource.
    pub fn version(&self, name_hash: &B256) -> ResourceResult<u32> {
        Ok(self.synced_resource(name_hash)?.version)
    }

    /// Update period covering `block` for the loaded resource.
    pub fn block_to_period(&self, name_hash: &B256, block: u64) -> ResourceResult<u32> {
        let rsrc = self
            .resource(name_hash)
            .ok_or_else(|| ResourceError::NotFound("resource does not exist".to_string()))?;
        period::next_period(rsrc.start_block, block, rsrc.frequency)
    }

    /// Block height corresponding to `period` for the loaded resource.
    pub fn period_to_block(&self, name_hash: &B256, period: u32) -> ResourceResult<u64> {
        let rsrc = self
            .resource(name_hash)
            .ok_or_else(|| ResourceError::NotFound("resource does not exist".to_string()))?;
        Ok(period::period_to_block(rsrc.start_block, period, rsrc.frequency))
    }

    /// Registers a new mutable resource identified by `name`, updated every
    /// `frequency` blocks from the current head onward.
    ///
    /// Publishes the content-addressed metadata chunk and seeds the index.
    /// When a signer is configured, its key must pass the ownership check
    /// for `name`.
    pub async fn new_resource(
        &self,
        name: &str,
        frequency: u64,
    ) -> ResourceResult<(ChunkKey, Resource)> {
        if frequency == 0 {
            return Err(ResourceError::InvalidValue("frequency cannot be 0".to_string()));
        }
        if !is_safe_name(name) {
            return Err(ResourceError::InvalidValue(format!("invalid name: '{name}'")));
        }
        let store = self.store()?;
        let name_hash = self.name_hasher.name_hash(name);

        if let Some(signer) = &self.signer {
            let signature = signer.sign(name_hash)?;
            let address = crypto::recover_signer(&signature, &name_hash).map_err(|err| {
                ResourceError::InvalidSignature(format!(
                    "retrieve address from signature fail: {err}"
                ))
            })?;
            if !self.check_access(name, address)? {
                return Err(ResourceError::Unauthorized(format!("not owner of '{name}'")));
            }
        }

        let current_block = self.head_block(name).await?;
        let metadata = ResourceMetadata {
            start_block: current_block,
            frequency,
            name: name.to_string(),
        };
        let body = metadata.encode();
        let key = self.hash_pool.hash(&[&body]);
        store.put(Chunk::new(key, body));
        debug!(
            target: "storage::resource",
            name, %name_hash, start_block = current_block, frequency, "new resource"
        );

        let rsrc = Resource {
            name: name.to_string(),
            name_hash,
            start_block: current_block,
            frequency,
            last_period: 0,
            version: 0,
            last_key: ChunkKey::ZERO,
            data: Bytes::new(),
            multihash: false,
            updated: Some(Instant::now()),
        };
        self.resources.write().insert(name_hash, rsrc.clone());
        Ok((key, rsrc))
    }

    /// Retrieves a resource metadata chunk and seeds the index entry from it.
    ///
    /// The entry starts out unsynced; follow with a lookup to load an update.
    pub async fn load_resource(&self, key: ChunkKey) -> ResourceResult<Resource> {
        let store = self.store()?;
        let chunk = store
            .get(key, self.retrieve_timeout)
            .await
            .map_err(|err| ResourceError::NotFound(err.to_string()))?;

        let metadata = ResourceMetadata::decode(&chunk.data)?;
        let name_hash = self.name_hasher.name_hash(&metadata.name);
        let rsrc = Resource {
            name: metadata.name,
            name_hash,
            start_block: metadata.start_block,
            frequency: metadata.frequency,
            last_period: 0,
            version: 0,
            last_key: ChunkKey::ZERO,
            data: Bytes::new(),
            multihash: false,
            updated: None,
        };
        trace!(
            target: "storage::resource",
            root_key = %key, name = %rsrc.name, %name_hash,
            start_block = rsrc.start_block, frequency = rsrc.frequency,
            "resource index load"
        );
        self.resources.write().insert(name_hash, rsrc.clone());
        Ok(rsrc)
    }

    /// Publishes an update with the given payload at the next period.
    ///
    /// Returns the chunk key of the published update.
    pub async fn update(&self, name: &str, data: &[u8]) -> ResourceResult<ChunkKey> {
        self.update_inner(name, data, false).await
    }

    /// Publishes an update whose payload is a self-describing multihash.
    pub async fn update_multihash(&self, name: &str, data: &[u8]) -> ResourceResult<ChunkKey> {
        if multihash_length(data) == 0 {
            return Err(ResourceError::NothingToReturn("invalid multihash".to_string()));
        }
        self.update_inner(name, data, true).await
    }

    async fn update_inner(
        &self,
        name: &str,
        data: &[u8],
        multihash: bool,
    ) -> ResourceResult<ChunkKey> {
        if data.is_empty() {
            return Err(ResourceError::InvalidValue("updates cannot be empty".to_string()));
        }
        let store = self.store()?;

        let signature_length = if self.signer.is_some() { SIGNATURE_LENGTH } else { 0 };
        let name_hash = self.name_hasher.name_hash(name);
        let rsrc = self
            .resource(&name_hash)
            .ok_or_else(|| ResourceError::NotFound(format!("resource '{name}' not in index")))?;
        if !rsrc.is_synced() {
            return Err(ResourceError::NotSynced("resource object not in sync".to_string()));
        }

        // an update cannot span chunks
        let datalimit = CHUNK_SIZE.saturating_sub(signature_length + name.len() + 12);
        if data.len() > datalimit {
            return Err(ResourceError::DataOverflow(format!(
                "data overflow: {} / {datalimit} bytes",
                data.len()
            )));
        }

        let current_block = self.head_block(name).await?;
        let next_period = period::next_period(rsrc.start_block, current_block, rsrc.frequency)?;

        // another update in the same period bumps the version
        let version = if rsrc.last_period == next_period { rsrc.version + 1 } else { 1 };

        let key = self.update_chunk_key(next_period, version, name_hash);
        let mut update = ResourceUpdate {
            period: next_period,
            version,
            name: name.to_string(),
            payload: Bytes::copy_from_slice(data),
            multihash,
            signature: None,
        };

        if let Some(signer) = &self.signer {
            let digest = self.key_data_digest(&key, &update.signed_body());
            let signature = signer.sign(digest)?;
            let address = crypto::recover_signer(&signature, &digest).map_err(|err| {
                ResourceError::InvalidSignature(format!("invalid data/signature: {err}"))
            })?;
            if !self.check_access(name, address)? {
                return Err(ResourceError::Unauthorized(format!(
                    "address {address} does not have access to update {name}"
                )));
            }
            update.signature = Some(signature);
        }

        let chunk = Chunk::new(key, update.encode());
        store.put(chunk.clone());
        match tokio::time::timeout(self.store_timeout, chunk.stored()).await {
            Err(_) => return Err(ResourceError::Io("chunk store timeout".to_string())),
            Ok(Err(err)) => return Err(err.into()),
            Ok(Ok(())) => {}
        }
        trace!(
            target: "storage::resource",
            name, %key, current_block, period = next_period, version, multihash,
            "resource update"
        );

        let mut resources = self.resources.write();
        if let Some(entry) = resources.get_mut(&name_hash) {
            entry.last_period = next_period;
            entry.version = version;
            entry.data = update.payload.clone();
        }
        Ok(key)
    }

    /// Retrieves the update at a specific `(period, version)` location.
    ///
    /// With `refresh` unset, a request for the location already loaded is
    /// served from the index without touching the store.
    pub async fn lookup_version(
        &self,
        name_hash: B256,
        period: u32,
        version: u32,
        refresh: bool,
        max_lookup: Option<LookupParams>,
    ) -> ResourceResult<Resource> {
        self.loaded(&name_hash)?;
        self.lookup(name_hash, period, version, refresh, max_lookup).await
    }

    /// Retrieves the latest version of the update at `period`.
    pub async fn lookup_historical(
        &self,
        name_hash: B256,
        period: u32,
        refresh: bool,
        max_lookup: Option<LookupParams>,
    ) -> ResourceResult<Resource> {
        self.loaded(&name_hash)?;
        self.lookup(name_hash, period, 0, refresh, max_lookup).await
    }

    /// Retrieves the most recent update, walking back from the period of the
    /// current block height.
    pub async fn lookup_latest(
        &self,
        name_hash: B256,
        refresh: bool,
        max_lookup: Option<LookupParams>,
    ) -> ResourceResult<Resource> {
        let rsrc = self.loaded(&name_hash)?;
        let current_block = self.head_block(&rsrc.name).await?;
        let next_period = period::next_period(rsrc.start_block, current_block, rsrc.frequency)?;
        self.lookup(name_hash, next_period, 0, refresh, max_lookup).await
    }

    /// Retrieves the update logically preceding the one currently loaded.
    ///
    /// Steps the in-memory cursor back one version, or to the latest version
    /// of the previous period, and re-enters the lookup. At the oldest update
    /// this fails with [`ResourceError::NothingToReturn`].
    pub async fn lookup_previous(
        &self,
        name_hash: B256,
        max_lookup: Option<LookupParams>,
    ) -> ResourceResult<Resource> {
        let (period, version) = {
            let mut resources = self.resources.write();
            let rsrc = resources.get_mut(&name_hash).ok_or_else(|| {
                ResourceError::NothingToReturn("resource not loaded".to_string())
            })?;
            if !rsrc.is_synced() {
                return Err(ResourceError::NotSynced(
                    "lookup_previous requires a synced resource".to_string(),
                ));
            }
            if rsrc.last_period == 0 {
                return Err(ResourceError::NothingToReturn("resource not found".to_string()));
            }
            if rsrc.version > 1 {
                rsrc.version -= 1;
                (rsrc.last_period, rsrc.version)
            } else if rsrc.last_period == 1 {
                return Err(ResourceError::NothingToReturn(
                    "current update is the oldest".to_string(),
                ));
            } else {
                rsrc.version = 0;
                rsrc.last_period -= 1;
                (rsrc.last_period, 0)
            }
        };
        // the cursor just moved, so the already-loaded location must not be served
        match self.lookup(name_hash, period, version, true, max_lookup).await {
            // walked past the oldest update: the history boundary
            Err(ResourceError::NotFound(_)) => Err(ResourceError::NothingToReturn(
                "no earlier update".to_string(),
            )),
            other => other,
        }
    }

    /// By-name variant of [`Self::lookup_version`].
    pub async fn lookup_version_by_name(
        &self,
        name: &str,
        period: u32,
        version: u32,
        refresh: bool,
        max_lookup: Option<LookupParams>,
    ) -> ResourceResult<Resource> {
        self.lookup_version(self.name_hasher.name_hash(name), period, version, refresh, max_lookup)
            .await
    }

    /// By-name variant of [`Self::lookup_historical`].
    pub async fn lookup_historical_by_name(
        &self,
        name: &str,
        period: u32,
        refresh: bool,
        max_lookup: Option<LookupParams>,
    ) -> ResourceResult<Resource> {
        self.lookup_historical(self.name_hasher.name_hash(name), period, refresh, max_lookup).await
    }

    /// By-name variant of [`Self::lookup_latest`].
    pub async fn lookup_latest_by_name(
        &self,
        name: &str,
        refresh: bool,
        max_lookup: Option<LookupParams>,
    ) -> ResourceResult<Resource> {
        self.lookup_latest(self.name_hasher.name_hash(name), refresh, max_lookup).await
    }

    /// By-name variant of [`Self::lookup_previous`].
    pub async fn lookup_previous_by_name(
        &self,
        name: &str,
        max_lookup: Option<LookupParams>,
    ) -> ResourceResult<Resource> {
        self.lookup_previous(self.name_hasher.name_hash(name), max_lookup).await
    }

    fn loaded(&self, name_hash: &B256) -> ResourceResult<Resource> {
        self.resource(name_hash)
            .ok_or_else(|| ResourceError::NothingToReturn("resource not loaded".to_string()))
    }

    /// Backward walk over periods, with a forward scan over versions within
    /// a period when no specific version is requested.
    async fn lookup(
        &self,
        name_hash: B256,
        mut period: u32,
        version: u32,
        refresh: bool,
        max_lookup: Option<LookupParams>,
    ) -> ResourceResult<Resource> {
        let store = self.store()?;
        if period == 0 {
            return Err(ResourceError::InvalidValue("period must be > 0".to_string()));
        }

        let specific = version > 0;
        let mut version = if specific { version } else { 1 };

        if !refresh && specific {
            // the requested location is already loaded
            if let Some(rsrc) = self.resource(&name_hash) {
                if rsrc.is_synced() && rsrc.last_period == period && rsrc.version == version {
                    return Ok(rsrc);
                }
            }
        }

        let max_lookup = max_lookup.unwrap_or(self.query_max_periods);
        let mut hops = 0u32;
        trace!(
            target: "storage::resource",
            period, version, limit = max_lookup.limit, max = max_lookup.max, "resource lookup"
        );
        while period > 0 {
            if max_lookup.limit && hops > max_lookup.max {
                return Err(ResourceError::PeriodDepth(format!(
                    "lookup exceeded max period hops ({})",
                    max_lookup.max
                )));
            }
            let key = self.update_chunk_key(period, version, name_hash);
            if let Ok(mut chunk) = store.get(key, self.retrieve_timeout).await {
                if specific {
                    return self.commit_update(name_hash, &chunk);
                }
                // walk versions forward until one is missing
                trace!(
                    target: "storage::resource",
                    period, %key, "update found, checking for version updates"
                );
                loop {
                    let next_version = version + 1;
                    let next_key = self.update_chunk_key(period, next_version, name_hash);
                    match store.get(next_key, self.retrieve_timeout).await {
                        Err(_) => return self.commit_update(name_hash, &chunk),
                        Ok(next) => {
                            chunk = next;
                            version = next_version;
                            trace!(
                                target: "storage::resource",
                                period, version, key = %next_key, "version update found"
                            );
                        }
                    }
                }
            }
            trace!(
                target: "storage::resource",
                period, %key, "update not found, checking previous period"
            );
            period -= 1;
            hops += 1;
        }
        Err(ResourceError::NotFound("no updates found".to_string()))
    }

    /// Refreshes the index entry from a retrieved update chunk.
    fn commit_update(&self, name_hash: B256, chunk: &Chunk) -> ResourceResult<Resource> {
        let update = ResourceUpdate::decode(&chunk.data, self.signer.is_some())?;
        let entry_name = self
            .resources
            .read()
            .get(&name_hash)
            .map(|rsrc| rsrc.name.clone())
            .ok_or_else(|| ResourceError::NothingToReturn("resource not loaded".to_string()))?;
        if entry_name != update.name {
            return Err(ResourceError::NothingToReturn(format!(
                "update belongs to '{}', but have '{entry_name}'",
                update.name
            )));
        }
        if let Some(signature) = &update.signature {
            let digest = self.key_data_digest(&chunk.key, &update.signed_body());
            crypto::recover_signer(signature, &digest).map_err(|err| {
                ResourceError::Unauthorized(format!("invalid signature: {err}"))
            })?;
        }

        let mut resources = self.resources.write();
        let rsrc = resources
            .get_mut(&name_hash)
            .ok_or_else(|| ResourceError::NothingToReturn("resource not loaded".to_string()))?;
        rsrc.last_key = chunk.key;
        rsrc.last_period = update.period;
        rsrc.version = update.version;
        rsrc.updated = Some(Instant::now());
        rsrc.data = update.payload.clone();
        rsrc.multihash = update.multihash;
        debug!(
            target: "storage::resource",
            name = %rsrc.name, key = %chunk.key, period = rsrc.last_period,
            version = rsrc.version, "resource synced"
        );
        Ok(rsrc.clone())
    }
}

impl ChunkValidator for ResourceHandler {
    /// Classifies a chunk on its way into the store.
    ///
    /// An update chunk is accepted when its key matches the derived update
    /// location (unsigned), or when the recovered signer passes the
    /// ownership check (signed). Bytes that do not parse as an update are
    /// accepted as a metadata chunk on a structural check only.
    fn validate(&self, key: &ChunkKey, data: &[u8]) -> bool {
        match ResourceUpdate::decode(data, self.signer.is_some()) {
            Ok(update) => match &update.signature {
                None => {
                    let name_hash = self.name_hasher.name_hash(&update.name);
                    self.update_chunk_key(update.period, update.version, name_hash) == *key
                }
                Some(signature) => {
                    let digest = self.key_data_digest(key, &update.signed_body());
                    let Ok(address) = crypto::recover_signer(signature, &digest) else {
                        error!(target: "storage::resource", "invalid signature on resource chunk");
                        return false;
                    };
                    self.check_access(&update.name, address).unwrap_or(false)
                }
            },
            Err(_) => {
                if data.len() >= comb_primitives::METADATA_CHUNK_OFFSET && data[..2] == [0, 0] {
                    return true;
                }
                error!(target: "storage::resource", "invalid resource chunk");
                false
            }
        }
    }
}

/// Returns the IDNA ASCII form of `name`.
pub fn to_safe_name(name: &str) -> ResourceResult<String> {
    idna::domain_to_ascii(name)
        .map_err(|_| ResourceError::InvalidValue(format!("name '{name}' has no ascii form")))
}

/// A name is safe when it is non-empty and equals its own IDNA ASCII form.
pub fn is_safe_name(name: &str) -> bool {
    if name.is_empty() {
        return false;
    }
    idna::domain_to_ascii(name).map(|ascii| ascii == name).unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use comb_interfaces::{
        test_utils::{MemoryChunkStore, TestBlockSource, TestOwnerValidator},
        ChunkStoreError, ContentAddressValidator, KeypairSigner, LabelNameHasher, NameHasher,
    };
    use comb_primitives::keccak256;

    const NAME: &str = "foo.bar";

    fn name_hash(name: &str) -> B256 {
        LabelNameHasher.name_hash(name)
    }

    fn sample_multihash() -> Vec<u8> {
        let mut data = vec![0x12, 0x20];
        data.extend_from_slice(&[0xaa; 32]);
        data
    }

    struct TestSetup {
        handler: Arc<ResourceHandler>,
        store: Arc<MemoryChunkStore>,
        blocks: Arc<TestBlockSource>,
        owners: Arc<TestOwnerValidator>,
        signer_address: Option<Address>,
    }

    fn setup(signed: bool) -> TestSetup {
        let blocks = Arc::new(TestBlockSource::new(4200));
        let owners = Arc::new(TestOwnerValidator::rejecting());
        let mut params = ResourceHandlerParams::new(blocks.clone(), Arc::new(LabelNameHasher));
        let mut signer_address = None;
        if signed {
            let signer = KeypairSigner::new(B256::repeat_byte(0x17)).unwrap();
            signer_address = Some(signer.address());
            owners.approve(signer.address());
            params =
                params.with_signer(Arc::new(signer)).with_owner_validator(owners.clone());
        }
        let handler = Arc::new(ResourceHandler::new(params));
        let store = Arc::new(MemoryChunkStore::new());
        handler.set_store(store.clone());
        TestSetup { handler, store, blocks, owners, signer_address }
    }

    #[tokio::test]
    async fn create_and_read_back() {
        let t = setup(false);
        let (key, rsrc) = t.handler.new_resource(NAME, 42).await.unwrap();
        assert!(rsrc.is_synced());
        assert_eq!(rsrc.start_block(), 4200);

        // metadata chunk body: 00 00 | start block | frequency | name
        let chunk = t.store.get(key, Duration::from_millis(100)).await.unwrap();
        let mut expected = vec![0u8, 0];
        expected.extend_from_slice(&4200u64.to_le_bytes());
        expected.extend_from_slice(&42u64.to_le_bytes());
        expected.extend_from_slice(NAME.as_bytes());
        assert_eq!(&chunk.data[..], &expected[..]);
        assert_eq!(chunk.key, keccak256(&expected));

        // no updates published yet
        let err = t.handler.lookup_latest(name_hash(NAME), false, None).await.unwrap_err();
        assert!(matches!(err, ResourceError::NotFound(_)));
    }

    #[tokio::test]
    async fn single_update_lands_at_derived_key() {
        let t = setup(false);
        t.handler.new_resource(NAME, 42).await.unwrap();

        t.blocks.set_height(4242);
        let key = t.handler.update(NAME, b"hello").await.unwrap();

        // period (4242 - 4200) / 42 + 1 = 2, version 1
        let nh = name_hash(NAME);
        let mut keyed = Vec::new();
        keyed.extend_from_slice(&2u32.to_le_bytes());
        keyed.extend_from_slice(&1u32.to_le_bytes());
        keyed.extend_from_slice(nh.as_slice());
        assert_eq!(key, keccak256(&keyed));

        let rsrc = t.handler.lookup_latest(nh, false, None).await.unwrap();
        assert_eq!(rsrc.data().as_ref(), b"hello");
        assert_eq!(rsrc.last_period(), 2);
        assert_eq!(rsrc.version(), 1);
    }

    #[tokio::test]
    async fn version_collision_walks_back_to_the_oldest() {
        let t = setup(false);
        t.handler.new_resource(NAME, 42).await.unwrap();
        t.blocks.set_height(4242);
        t.handler.update(NAME, b"hello").await.unwrap();
        t.blocks.set_height(4244);
        t.handler.update(NAME, b"world").await.unwrap();

        let nh = name_hash(NAME);
        let latest = t.handler.lookup_latest(nh, false, None).await.unwrap();
        assert_eq!(latest.data().as_ref(), b"world");
        assert_eq!((latest.last_period(), latest.version()), (2, 2));

        let previous = t.handler.lookup_previous(nh, None).await.unwrap();
        assert_eq!(previous.data().as_ref(), b"hello");
        assert_eq!((previous.last_period(), previous.version()), (2, 1));

        // the first update is the oldest
        let err = t.handler.lookup_previous(nh, None).await.unwrap_err();
        assert!(matches!(err, ResourceError::NothingToReturn(_)));
    }

    #[tokio::test]
    async fn backsearch_is_bounded_by_lookup_params() {
        let t = setup(false);
        t.handler.new_resource(NAME, 42).await.unwrap();
        t.blocks.set_height(4210);
        t.handler.update(NAME, b"early").await.unwrap(); // period 1

        // current block now maps to period 11; the update is 10 periods back
        t.blocks.set_height(4620);
        let nh = name_hash(NAME);
        let err = t
            .handler
            .lookup_latest(nh, false, Some(LookupParams::bounded(3)))
            .await
            .unwrap_err();
        assert!(matches!(err, ResourceError::PeriodDepth(_)));

        let rsrc = t.handler.lookup_latest(nh, false, None).await.unwrap();
        assert_eq!(rsrc.data().as_ref(), b"early");
        assert_eq!(rsrc.last_period(), 1);
    }

    #[tokio::test]
    async fn unauthorized_update_leaves_the_index_untouched() {
        let t = setup(true);
        t.handler.new_resource(NAME, 42).await.unwrap();
        t.blocks.set_height(4242);
        t.handler.update(NAME, b"hello").await.unwrap();

        t.owners.revoke(t.signer_address.unwrap());
        let nh = name_hash(NAME);
        let before = t.handler.version(&nh).unwrap();
        let err = t.handler.update(NAME, b"evil").await.unwrap_err();
        assert!(matches!(err, ResourceError::Unauthorized(_)));
        assert_eq!(t.handler.version(&nh).unwrap(), before);
        assert_eq!(t.handler.content(&nh).unwrap().1.as_ref(), b"hello");
    }

    #[tokio::test]
    async fn unauthorized_name_registration_is_rejected() {
        let t = setup(true);
        t.owners.revoke(t.signer_address.unwrap());
        let err = t.handler.new_resource(NAME, 42).await.unwrap_err();
        assert!(matches!(err, ResourceError::Unauthorized(_)));
    }

    #[tokio::test]
    async fn signed_updates_pass_the_store_validators() {
        let blocks = Arc::new(TestBlockSource::new(4200));
        let signer = KeypairSigner::new(B256::repeat_byte(0x17)).unwrap();
        let signer_address = signer.address();
        let owners = Arc::new(TestOwnerValidator::approving([signer_address]));
        let handler = Arc::new(ResourceHandler::new(
            ResourceHandlerParams::new(blocks.clone(), Arc::new(LabelNameHasher))
                .with_signer(Arc::new(signer))
                .with_owner_validator(owners.clone()),
        ));
        // production wiring: content-addressed chunks or validated resource chunks
        let store = Arc::new(
            MemoryChunkStore::new()
                .with_validator(Arc::new(ContentAddressValidator))
                .with_validator(handler.clone()),
        );
        handler.set_store(store.clone());

        handler.new_resource(NAME, 42).await.unwrap();
        blocks.set_height(4242);
        let key = handler.update(NAME, b"hello").await.unwrap();
        assert!(store.contains(&key));

        let rsrc = handler.lookup_latest(name_hash(NAME), false, None).await.unwrap();
        assert_eq!(rsrc.data().as_ref(), b"hello");

        // the signed chunk alone convinces the validator, until ownership lapses
        let chunk = store.get(key, Duration::from_millis(100)).await.unwrap();
        assert!(handler.validate(&chunk.key, &chunk.data));
        owners.revoke(signer_address);
        assert!(!handler.validate(&chunk.key, &chunk.data));
    }

    #[tokio::test]
    async fn validator_classifies_chunks() {
        let t = setup(false);
        // metadata chunks are accepted on a structural check only
        let metadata =
            ResourceMetadata { start_block: 1, frequency: 1, name: NAME.to_string() }.encode();
        assert!(t.handler.validate(&keccak256(&metadata), &metadata));
        assert!(t.handler.validate(&B256::repeat_byte(9), &metadata));

        // unsigned updates are accepted iff the key matches the derived location
        let update = ResourceUpdate {
            period: 2,
            version: 1,
            name: NAME.to_string(),
            payload: Bytes::from_static(b"x"),
            multihash: false,
            signature: None,
        };
        let key = t.handler.update_chunk_key(2, 1, name_hash(NAME));
        assert!(t.handler.validate(&key, &update.encode()));
        assert!(!t.handler.validate(&B256::repeat_byte(9), &update.encode()));

        // anything else is rejected
        assert!(!t.handler.validate(&key, &[1, 2, 3]));
    }

    #[tokio::test]
    async fn load_resource_rebuilds_the_index() {
        let t = setup(false);
        let (meta_key, _) = t.handler.new_resource(NAME, 42).await.unwrap();
        t.blocks.set_height(4242);
        t.handler.update(NAME, b"hello").await.unwrap();

        // a fresh handler sharing only the store
        let other = ResourceHandler::new(ResourceHandlerParams::new(
            t.blocks.clone(),
            Arc::new(LabelNameHasher),
        ));
        other.set_store(t.store.clone());

        let rsrc = other.load_resource(meta_key).await.unwrap();
        assert!(!rsrc.is_synced());
        let err = other.update(NAME, b"too early").await.unwrap_err();
        assert!(matches!(err, ResourceError::NotSynced(_)));

        let nh = name_hash(NAME);
        let synced = other.lookup_latest(nh, false, None).await.unwrap();
        assert_eq!(synced.data().as_ref(), b"hello");
        assert_eq!(other.content(&nh).unwrap().1.as_ref(), b"hello");
        assert_eq!(other.last_period(&nh).unwrap(), 2);
    }

    #[tokio::test]
    async fn load_resource_rejects_non_metadata_chunks() {
        let t = setup(false);
        t.handler.new_resource(NAME, 42).await.unwrap();
        t.blocks.set_height(4242);
        let update_key = t.handler.update(NAME, b"hello").await.unwrap();

        let err = t.handler.load_resource(update_key).await.unwrap_err();
        assert!(matches!(err, ResourceError::CorruptData(_)));
        let err = t.handler.load_resource(B256::repeat_byte(3)).await.unwrap_err();
        assert!(matches!(err, ResourceError::NotFound(_)));
    }

    #[tokio::test]
    async fn multihash_updates_set_the_flag_and_zero_length() {
        let t = setup(false);
        t.handler.new_resource(NAME, 42).await.unwrap();
        t.blocks.set_height(4242);

        let mh = sample_multihash();
        let key = t.handler.update_multihash(NAME, &mh).await.unwrap();
        let chunk = t.store.get(key, Duration::from_millis(100)).await.unwrap();
        assert_eq!(&chunk.data[2..4], &[0, 0]); // declared data length marks a multihash

        let rsrc = t.handler.lookup_latest(name_hash(NAME), false, None).await.unwrap();
        assert!(rsrc.is_multihash());
        assert_eq!(rsrc.data().as_ref(), &mh[..]);

        let err = t.handler.update_multihash(NAME, &[0xff]).await.unwrap_err();
        assert!(matches!(err, ResourceError::NothingToReturn(_)));
    }

    #[tokio::test]
    async fn historical_and_version_lookups() {
        let t = setup(false);
        t.handler.new_resource(NAME, 42).await.unwrap();
        t.blocks.set_height(4242);
        t.handler.update(NAME, b"hello").await.unwrap();
        t.blocks.set_height(4244);
        t.handler.update(NAME, b"world").await.unwrap();
        t.blocks.set_height(4284);
        t.handler.update(NAME, b"again").await.unwrap(); // period 3

        let nh = name_hash(NAME);
        let historical = t.handler.lookup_historical(nh, 2, false, None).await.unwrap();
        assert_eq!(historical.data().as_ref(), b"world");
        let pinned = t.handler.lookup_version(nh, 2, 1, false, None).await.unwrap();
        assert_eq!(pinned.data().as_ref(), b"hello");
        let latest = t.handler.lookup_latest_by_name(NAME, false, None).await.unwrap();
        assert_eq!(latest.data().as_ref(), b"again");
        assert_eq!(latest.last_period(), 3);
    }

    #[tokio::test]
    async fn update_guards() {
        let t = setup(false);
        let nh = name_hash(NAME);

        let err = t.handler.update(NAME, b"data").await.unwrap_err();
        assert!(matches!(err, ResourceError::NotFound(_)));
        let err = t.handler.lookup_latest(nh, false, None).await.unwrap_err();
        assert!(matches!(err, ResourceError::NothingToReturn(_)));

        t.handler.new_resource(NAME, 42).await.unwrap();
        let err = t.handler.update(NAME, b"").await.unwrap_err();
        assert!(matches!(err, ResourceError::InvalidValue(_)));

        let overflow = vec![0u8; CHUNK_SIZE];
        let err = t.handler.update(NAME, &overflow).await.unwrap_err();
        assert!(matches!(err, ResourceError::DataOverflow(_)));

        t.blocks.set_height(4100); // before the start block
        let err = t.handler.update(NAME, b"data").await.unwrap_err();
        assert!(matches!(err, ResourceError::InvalidValue(_)));
    }

    #[tokio::test]
    async fn new_resource_guards() {
        let t = setup(false);
        let err = t.handler.new_resource(NAME, 0).await.unwrap_err();
        assert!(matches!(err, ResourceError::InvalidValue(_)));
        let err = t.handler.new_resource("føø.bar", 42).await.unwrap_err();
        assert!(matches!(err, ResourceError::InvalidValue(_)));
        let err = t.handler.new_resource("", 42).await.unwrap_err();
        assert!(matches!(err, ResourceError::InvalidValue(_)));
    }

    #[tokio::test]
    async fn operations_require_a_bound_store() {
        let handler = ResourceHandler::new(ResourceHandlerParams::new(
            Arc::new(TestBlockSource::new(4200)),
            Arc::new(LabelNameHasher),
        ));
        let err = handler.new_resource(NAME, 42).await.unwrap_err();
        assert!(matches!(err, ResourceError::Init(_)));
        let err = handler.load_resource(B256::repeat_byte(1)).await.unwrap_err();
        assert!(matches!(err, ResourceError::Init(_)));
    }

    #[tokio::test]
    async fn store_failures_surface_as_io() {
        let t = setup(false);
        t.handler.new_resource(NAME, 42).await.unwrap();
        t.blocks.set_height(4242);
        t.store.set_failing(true);
        let err = t.handler.update(NAME, b"hello").await.unwrap_err();
        assert!(matches!(err, ResourceError::Io(_)));
    }

    #[tokio::test]
    async fn missing_store_acknowledgement_times_out() {
        struct SilentStore;
        #[async_trait::async_trait]
        impl ChunkStore for SilentStore {
            fn put(&self, _chunk: Chunk) {}
            async fn get(
                &self,
                key: ChunkKey,
                _timeout: Duration,
            ) -> Result<Chunk, ChunkStoreError> {
                Err(ChunkStoreError::NotFound(key))
            }
        }

        let blocks = Arc::new(TestBlockSource::new(4200));
        let handler = ResourceHandler::new(
            ResourceHandlerParams::new(blocks.clone(), Arc::new(LabelNameHasher))
                .with_store_timeout(Duration::from_millis(10)),
        );
        handler.set_store(Arc::new(SilentStore));

        handler.new_resource(NAME, 42).await.unwrap();
        blocks.set_height(4242);
        let err = handler.update(NAME, b"hello").await.unwrap_err();
        assert_eq!(err, ResourceError::Io("chunk store timeout".to_string()));
    }

    #[tokio::test]
    async fn period_helpers_follow_the_loaded_entry() {
        let t = setup(false);
        t.handler.new_resource(NAME, 42).await.unwrap();
        let nh = name_hash(NAME);
        assert_eq!(t.handler.block_to_period(&nh, 4242).unwrap(), 2);
        assert_eq!(t.handler.period_to_block(&nh, 2).unwrap(), 4284);
    }

    #[test]
    fn safe_names() {
        assert!(is_safe_name("foo.bar"));
        assert!(!is_safe_name(""));
        assert!(!is_safe_name("føø.bar"));

        let safe = to_safe_name("føø.bar").unwrap();
        assert!(safe.starts_with("xn--"));
        assert!(is_safe_name(&safe));
    }
}
