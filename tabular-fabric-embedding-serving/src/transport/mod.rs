pub mod memory;

use crate::errors::ServingError;
use async_trait::async_trait;
use std::sync::Arc;

/// Outbound call state for one remote embedding shard.
#[async_trait]
pub trait ShardClient: Send + Sync {
    fn endpoint(&self) -> &str;

    /// Cheap reachability check used while a model loads.
    async fn ping(&self) -> Result<(), ServingError>;

    /// Fetches the rows of `table` for `ids`, flattened to `ids.len() * dim` values.
    /// Ids the shard does not hold come back as zero rows.
    async fn lookup(&self, table: &str, ids: &[u64], dim: usize) -> Result<Vec<f32>, ServingError>;
}

pub trait ShardConnector: Send + Sync {
    fn connect(&self, endpoint: &str) -> Result<Arc<dyn ShardClient>, ServingError>;
}
