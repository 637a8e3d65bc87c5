use std::sync::Arc;
use std::time::{Duration, Instant};

use tabular_fabric_embedding_serving::base::{ModelServe, SparseBatch};
use tabular_fabric_embedding_serving::config::ServingConfig;
use tabular_fabric_embedding_serving::models::sparse_embedding_bag::descriptor::DESCRIPTOR_FILE_NAME;
use tabular_fabric_embedding_serving::models::sparse_embedding_bag::SparseEmbeddingBagModel;
use tabular_fabric_embedding_serving::pool::ClientContextPool;
use tabular_fabric_embedding_serving::reactor::{Reactor, SharedServerBuilder};
use tabular_fabric_embedding_serving::trace::init_tracing;
use tabular_fabric_embedding_serving::transport::memory::{InMemoryConnector, InMemoryShard};
use tracing::info;

const DESCRIPTOR: &str = r#"{
    "version": 1,
    "name": "movielens_sparse",
    "fields": [
        {"name": "user_id", "dim": 8, "pooling": "sum", "shards": ["mem://shard-0", "mem://shard-1"]},
        {"name": "movie_id", "dim": 8, "pooling": "mean", "shards": ["mem://shard-0", "mem://shard-1"]},
        {"name": "genre", "dim": 4, "pooling": "max", "shards": ["mem://shard-1"]}
    ]
}"#;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = ServingConfig::from_env()?;
    init_tracing("embedding-bag-infer", &config);

    let shards = vec![
        Arc::new(InMemoryShard::new("mem://shard-0").with_latency(Duration::from_millis(2))),
        Arc::new(InMemoryShard::new("mem://shard-1").with_jitter(3)),
    ];
    for id in 0..1000u64 {
        let shard = &shards[(id % 2) as usize];
        let vector = (0..8).map(|j| ((id + j) % 17) as f32 / 17.0).collect::<Vec<_>>();
        shard.insert("user_id", id, vector.clone());
        shard.insert("movie_id", id, vector);
    }
    for genre in 0..20u64 {
        let vector = (0..4).map(|j| (genre * 4 + j) as f32).collect::<Vec<_>>();
        shards[1].insert("genre", genre, vector);
    }
    let mut connector = InMemoryConnector::new();
    for shard in &shards {
        connector.register(shard.clone());
    }
    let contexts = ClientContextPool::from_config(Arc::new(connector), &config);

    let model_dir = tempfile::tempdir()?;
    std::fs::write(model_dir.path().join(DESCRIPTOR_FILE_NAME), DESCRIPTOR)?;
    let location = model_dir.path().to_string_lossy().to_string();

    let reactor = Reactor::new(&SharedServerBuilder::from_config(&config))?;
    let mut model = SparseEmbeddingBagModel::from_config(reactor.handle(), &config);

    reactor.block_on(model.load(&location, &contexts))?;
    info!("loaded model: {}", model.info());

    let rows = 64u64;
    let batch = SparseBatch::new(
        model.input_names().to_vec(),
        vec![
            (0..rows).map(|r| vec![r, r + 1]).collect(),
            (0..rows).map(|r| (0..(r % 5)).map(|k| r * 10 + k).collect()).collect(),
            (0..rows).map(|r| vec![r % 20]).collect(),
        ],
    )?;

    let timer = Instant::now();
    let output = reactor.block_on(model.predict(batch))?;
    info!(
        "predicted {} rows of width {} in {:?}",
        output.num_rows(),
        output.width(),
        timer.elapsed()
    );

    let record_batch = output.to_record_batch()?;
    info!("output schema: {:?}", record_batch.schema());
    Ok(())
}
