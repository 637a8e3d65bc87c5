#![allow(dead_code)]

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tabular_fabric_embedding_serving::base::ModelServe;
use tabular_fabric_embedding_serving::models::sparse_embedding_bag::descriptor::DESCRIPTOR_FILE_NAME;
use tabular_fabric_embedding_serving::models::sparse_embedding_bag::SparseEmbeddingBagModel;
use tabular_fabric_embedding_serving::pool::ClientContextPool;
use tabular_fabric_embedding_serving::reactor::ReactorHandle;
use tabular_fabric_embedding_serving::transport::memory::{InMemoryConnector, InMemoryShard};
use tabular_fabric_embedding_serving::transport::ShardClient;
use tempfile::TempDir;

pub const USER_DIM: usize = 8;
pub const ITEM_DIM: usize = 4;
pub const NUM_IDS: u64 = 64;

pub const DESCRIPTOR: &str = r#"{
    "version": 1,
    "name": "ctr_sparse",
    "output_name": "sparse_embedding",
    "fields": [
        {"name": "user_id", "dim": 8, "pooling": "sum", "shards": ["mem://shard-0", "mem://shard-1"]},
        {"name": "item_id", "table": "items", "dim": 4, "pooling": "max", "shards": ["mem://shard-1"]}
    ]
}"#;

/// Deterministic row for `id`, exact in f32 so sums compare with `==`.
pub fn vector_for(id: u64, dim: usize) -> Vec<f32> {
    (0..dim).map(|j| (id as f32) * 0.5 - j as f32).collect()
}

pub struct Deployment {
    pub dir: TempDir,
    pub shards: Vec<Arc<InMemoryShard>>,
    pub contexts: ClientContextPool,
}

impl Deployment {
    pub fn location(&self) -> String {
        self.dir.path().to_string_lossy().to_string()
    }

    pub fn shard(&self, endpoint: &str) -> Arc<InMemoryShard> {
        self.shards
            .iter()
            .find(|s| s.endpoint() == endpoint)
            .cloned()
            .unwrap()
    }
}

pub fn deployment(
    shards: Vec<InMemoryShard>,
    capacity: usize,
    acquire_timeout: Duration,
) -> Deployment {
    let dir = tempfile::tempdir().unwrap();
    write_descriptor(dir.path(), DESCRIPTOR);

    let shards = shards.into_iter().map(Arc::new).collect::<Vec<_>>();
    for id in 0..NUM_IDS {
        let user_shard = &shards[(id % 2) as usize];
        user_shard.insert("user_id", id, vector_for(id, USER_DIM));
        shards[1].insert("items", id, vector_for(id, ITEM_DIM));
    }

    let mut connector = InMemoryConnector::new();
    for shard in &shards {
        connector.register(shard.clone());
    }
    Deployment {
        dir,
        shards,
        contexts: ClientContextPool::new(Arc::new(connector), capacity, acquire_timeout),
    }
}

pub fn default_shards() -> Vec<InMemoryShard> {
    vec![
        InMemoryShard::new("mem://shard-0"),
        InMemoryShard::new("mem://shard-1"),
    ]
}

pub fn write_descriptor(dir: &Path, content: &str) {
    std::fs::write(dir.join(DESCRIPTOR_FILE_NAME), content).unwrap();
}

pub async fn loaded_model(
    deployment: &Deployment,
    predict_timeout: Duration,
) -> SparseEmbeddingBagModel {
    let mut model = SparseEmbeddingBagModel::with_timeouts(
        ReactorHandle::current().unwrap(),
        Duration::from_secs(5),
        predict_timeout,
    );
    model
        .load(&deployment.location(), &deployment.contexts)
        .await
        .unwrap();
    model
}

pub fn sum_of(ids: &[u64], dim: usize) -> Vec<f32> {
    let mut out = vec![0.0; dim];
    for id in ids {
        for (o, v) in out.iter_mut().zip(vector_for(*id, dim)) {
            *o += v;
        }
    }
    out
}

pub fn max_of(ids: &[u64], dim: usize) -> Vec<f32> {
    if ids.is_empty() {
        return vec![0.0; dim];
    }
    let mut out = vec![f32::MIN; dim];
    for id in ids {
        for (o, v) in out.iter_mut().zip(vector_for(*id, dim)) {
            *o = o.max(v);
        }
    }
    out
}

pub fn expected_row(user_ids: &[u64], item_ids: &[u64]) -> Vec<f32> {
    let mut row = sum_of(user_ids, USER_DIM);
    row.extend(max_of(item_ids, ITEM_DIM));
    row
}
