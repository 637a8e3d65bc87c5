use std::collections::HashMap;

use futures::future::try_join_all;
use itertools::Itertools;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::errors::ServingError;
use crate::models::sparse_embedding_bag::descriptor::ModelDescriptor;
use crate::models::sparse_embedding_bag::pooling::{pool, PoolingMode};
use crate::pool::ClientContextPool;
use crate::reactor::ReactorHandle;

#[derive(Debug, Clone)]
pub struct FieldContext {
    name: String,
    table: String,
    dim: usize,
    pooling: PoolingMode,
    shards: Vec<String>,
    offset: usize,
}

impl FieldContext {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    pub fn pooling(&self) -> PoolingMode {
        self.pooling
    }

    pub fn shards(&self) -> &[String] {
        &self.shards
    }

    /// Start of this field's segment within an output row.
    pub fn offset(&self) -> usize {
        self.offset
    }

    pub fn shard_for(&self, id: u64) -> usize {
        (id % self.shards.len() as u64) as usize
    }
}

/// Resolved, read-only serving state of one loaded sparse embedding bag model.
pub struct SparseEmbeddingBagContext {
    name: String,
    fields: Vec<FieldContext>,
    input_names: Vec<String>,
    output_names: Vec<String>,
    output_width: usize,
    contexts: ClientContextPool,
}

impl SparseEmbeddingBagContext {
    /// Resolves every field against its shards. Any unreachable shard fails the whole build.
    pub async fn build(
        descriptor: ModelDescriptor,
        contexts: &ClientContextPool,
        reactor: &ReactorHandle,
    ) -> Result<Self, ServingError> {
        descriptor.validate()?;

        let mut checks = JoinSet::new();
        for field in &descriptor.fields {
            for endpoint in field.shards.iter().unique() {
                let contexts = contexts.clone();
                let field_name = field.name.clone();
                let endpoint = endpoint.clone();
                checks.spawn_on(
                    async move {
                        let ctx = contexts.acquire(&endpoint).await?;
                        ctx.client().ping().await.map_err(|e| {
                            warn!("field {} shard {} unreachable: {}", field_name, endpoint, e);
                            e
                        })?;
                        debug!("field {} shard {} reachable", field_name, endpoint);
                        Ok::<(), ServingError>(())
                    },
                    reactor.tokio_handle(),
                );
            }
        }
        while let Some(check) = checks.join_next().await {
            check.map_err(|e| ServingError::joined("shard check", e))??;
        }

        let mut offset = 0;
        let fields = descriptor
            .fields
            .iter()
            .map(|field| {
                let resolved = FieldContext {
                    name: field.name.clone(),
                    table: field.table().to_string(),
                    dim: field.dim,
                    pooling: field.pooling,
                    shards: field.shards.clone(),
                    offset,
                };
                offset += field.dim;
                resolved
            })
            .collect::<Vec<_>>();

        info!(
            "sparse embedding bag {} resolved, fields: {}, output width: {}",
            descriptor.name,
            fields.len(),
            offset
        );
        Ok(SparseEmbeddingBagContext {
            name: descriptor.name.clone(),
            input_names: fields.iter().map(|f| f.name.clone()).collect(),
            output_names: vec![descriptor.output_name().to_string()],
            output_width: offset,
            fields,
            contexts: contexts.clone(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn fields(&self) -> &[FieldContext] {
        &self.fields
    }

    pub fn input_names(&self) -> &[String] {
        &self.input_names
    }

    pub fn output_names(&self) -> &[String] {
        &self.output_names
    }

    /// Sum of all field dimensions.
    pub fn output_width(&self) -> usize {
        self.output_width
    }

    /// Looks up every id of one row of `field` and pools the vectors.
    ///
    /// Ids are grouped by shard and de-duplicated per request; repeated ids
    /// still contribute once per occurrence to the pooled vector.
    pub async fn lookup_row(&self, field: usize, ids: &[u64]) -> Result<Vec<f32>, ServingError> {
        let field = self.fields.get(field).ok_or_else(|| ServingError::SchemaError {
            msg: format!("field index {} out of range", field),
        })?;
        if ids.is_empty() {
            return Ok(vec![0.0; field.dim]);
        }

        let by_shard = ids
            .iter()
            .copied()
            .unique()
            .into_group_map_by(|id| field.shard_for(*id));

        let lookups = by_shard
            .into_iter()
            .map(|(shard, shard_ids)| self.lookup_shard(field, shard, shard_ids))
            .collect::<Vec<_>>();
        let fetched = try_join_all(lookups).await?;

        let mut vectors: HashMap<u64, &[f32]> = HashMap::with_capacity(ids.len());
        for (shard_ids, values) in &fetched {
            for (id, vector) in shard_ids.iter().zip(values.chunks(field.dim)) {
                vectors.insert(*id, vector);
            }
        }
        Ok(pool(
            field.pooling,
            field.dim,
            ids.iter().filter_map(|id| vectors.get(id).copied()),
        ))
    }

    async fn lookup_shard(
        &self,
        field: &FieldContext,
        shard: usize,
        shard_ids: Vec<u64>,
    ) -> Result<(Vec<u64>, Vec<f32>), ServingError> {
        let endpoint = &field.shards[shard];
        let ctx = self.contexts.acquire(endpoint).await?;
        let values = ctx
            .client()
            .lookup(&field.table, &shard_ids, field.dim)
            .await?;
        if values.len() != shard_ids.len() * field.dim {
            return Err(ServingError::SchemaError {
                msg: format!(
                    "shard {} returned {} values for {} ids of dim {}",
                    endpoint,
                    values.len(),
                    shard_ids.len(),
                    field.dim
                ),
            });
        }
        Ok((shard_ids, values))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::sparse_embedding_bag::descriptor::FieldDescriptor;
    use crate::transport::memory::{InMemoryConnector, InMemoryShard};
    use std::sync::Arc;
    use std::time::Duration;

    fn descriptor(shards: Vec<&str>) -> ModelDescriptor {
        ModelDescriptor {
            version: 1,
            name: "ctr".to_string(),
            output_name: None,
            fields: vec![
                FieldDescriptor {
                    name: "user_id".to_string(),
                    table: None,
                    dim: 2,
                    pooling: PoolingMode::Sum,
                    shards: shards.iter().map(|s| s.to_string()).collect(),
                },
                FieldDescriptor {
                    name: "item_id".to_string(),
                    table: None,
                    dim: 3,
                    pooling: PoolingMode::Max,
                    shards: vec!["mem://0".to_string()],
                },
            ],
        }
    }

    fn pool_with(shards: &[Arc<InMemoryShard>]) -> ClientContextPool {
        let mut connector = InMemoryConnector::new();
        for shard in shards {
            connector.register(shard.clone());
        }
        ClientContextPool::new(Arc::new(connector), 4, Duration::from_secs(1))
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_build_offsets_and_names() {
        let shards = [
            Arc::new(InMemoryShard::new("mem://0")),
            Arc::new(InMemoryShard::new("mem://1")),
        ];
        let contexts = pool_with(&shards);
        let reactor = ReactorHandle::current().unwrap();
        let descriptor = descriptor(vec!["mem://0", "mem://1"]);
        let context = SparseEmbeddingBagContext::build(descriptor, &contexts, &reactor)
            .await
            .unwrap();
        assert_eq!(context.input_names(), &["user_id".to_string(), "item_id".to_string()]);
        assert_eq!(context.output_names(), &["sparse_embedding".to_string()]);
        assert_eq!(context.output_width(), 5);
        assert_eq!(context.fields()[1].offset(), 2);
        assert_eq!(contexts.available(), 4);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_build_fails_on_unreachable_shard() {
        let down = Arc::new(InMemoryShard::new("mem://1"));
        down.set_available(false);
        let contexts = pool_with(&[Arc::new(InMemoryShard::new("mem://0")), down]);
        let reactor = ReactorHandle::current().unwrap();
        let descriptor = descriptor(vec!["mem://0", "mem://1"]);
        let result = SparseEmbeddingBagContext::build(descriptor, &contexts, &reactor).await;
        assert!(matches!(result, Err(ServingError::ShardUnavailable { .. })));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_lookup_row_routes_and_dedupes() {
        let shard0 = Arc::new(InMemoryShard::new("mem://0"));
        let shard1 = Arc::new(InMemoryShard::new("mem://1"));
        shard0.insert("user_id", 4, vec![1.0, 1.0]);
        shard1.insert("user_id", 3, vec![0.5, 2.0]);
        shard1.insert("user_id", 7, vec![1.5, -1.0]);
        let contexts = pool_with(&[shard0.clone(), shard1.clone()]);
        let reactor = ReactorHandle::current().unwrap();
        let descriptor = descriptor(vec!["mem://0", "mem://1"]);
        let context = SparseEmbeddingBagContext::build(descriptor, &contexts, &reactor)
            .await
            .unwrap();

        let pooled = context.lookup_row(0, &[3, 7, 4, 3]).await.unwrap();
        assert_eq!(pooled, vec![3.5, 4.0]);
        assert_eq!(shard0.lookup_count(), 1);
        assert_eq!(shard1.lookup_count(), 1);

        assert_eq!(context.lookup_row(1, &[]).await.unwrap(), vec![0.0; 3]);
        assert!(context.lookup_row(2, &[1]).await.is_err());
    }
}
