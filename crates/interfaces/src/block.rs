use std::time::{Duration, SystemTime};

/// Error from a block-height query.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("block source: {0}")]
pub struct BlockSourceError(pub String);

/// Oracle for the current block height of the chain backing a name registry.
#[async_trait::async_trait]
pub trait BlockSource: Send + Sync {
    /// Returns the current head block number for the chain backing `name`.
    async fn head_block_number(&self, name: &str) -> Result<u64, BlockSourceError>;
}

/// A [`BlockSource`] that estimates the head block number by linearly
/// interpolating elapsed wall-clock time since a known chain start.
///
/// Useful when no chain client is available; the estimate should err on the
/// low side (a slightly long `average` period) so readers never look past the
/// real head.
#[derive(Debug, Clone)]
pub struct BlockEstimator {
    start: SystemTime,
    average: Duration,
}

impl BlockEstimator {
    /// Creates an estimator from the chain start time and the average block
    /// period observed on that chain.
    pub fn new(start: SystemTime, average: Duration) -> Self {
        assert!(!average.is_zero(), "average block period must be non-zero");
        Self { start, average }
    }
}

#[async_trait::async_trait]
impl BlockSource for BlockEstimator {
    async fn head_block_number(&self, _name: &str) -> Result<u64, BlockSourceError> {
        let elapsed = SystemTime::now()
            .duration_since(self.start)
            .map_err(|_| BlockSourceError("chain start time is in the future".to_string()))?;
        Ok((elapsed.as_nanos() / self.average.as_nanos()) as u64)
    }
}
