//! In-process shards, used by the demo driver and the tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use async_trait::async_trait;

use crate::errors::ServingError;
use crate::transport::{ShardClient, ShardConnector};

pub struct InMemoryShard {
    endpoint: String,
    tables: RwLock<HashMap<String, HashMap<u64, Vec<f32>>>>,
    available: AtomicBool,
    latency: Option<Duration>,
    ping_latency: Option<Duration>,
    jitter_ms: u64,
    padded: AtomicBool,
    lookups: AtomicU64,
}

impl InMemoryShard {
    pub fn new(endpoint: &str) -> Self {
        InMemoryShard {
            endpoint: endpoint.to_string(),
            tables: RwLock::new(HashMap::new()),
            available: AtomicBool::new(true),
            latency: None,
            ping_latency: None,
            jitter_ms: 0,
            padded: AtomicBool::new(false),
            lookups: AtomicU64::new(0),
        }
    }

    /// Every lookup sleeps for `latency` before answering.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    /// Every ping sleeps for `latency` before answering.
    pub fn with_ping_latency(mut self, latency: Duration) -> Self {
        self.ping_latency = Some(latency);
        self
    }

    /// Every lookup sleeps up to `max_ms`, derived from the requested ids, so
    /// different requests complete out of order.
    pub fn with_jitter(mut self, max_ms: u64) -> Self {
        self.jitter_ms = max_ms;
        self
    }

    pub fn insert(&self, table: &str, id: u64, vector: Vec<f32>) {
        self.tables
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(table.to_string())
            .or_default()
            .insert(id, vector);
    }

    /// While set, every lookup answers with one value too many.
    pub fn set_padded(&self, padded: bool) {
        self.padded.store(padded, Ordering::SeqCst);
    }

    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    pub fn lookup_count(&self) -> u64 {
        self.lookups.load(Ordering::SeqCst)
    }

    fn check_available(&self) -> Result<(), ServingError> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(ServingError::ShardUnavailable {
                endpoint: self.endpoint.clone(),
                msg: "connection refused".to_string(),
            })
        }
    }

    fn delay_for(&self, ids: &[u64]) -> Option<Duration> {
        let jitter = if self.jitter_ms > 0 {
            let seed = ids
                .iter()
                .fold(17u64, |acc, id| acc.wrapping_mul(31).wrapping_add(*id));
            Some(Duration::from_millis(seed % (self.jitter_ms + 1)))
        } else {
            None
        };
        match (self.latency, jitter) {
            (Some(l), Some(j)) => Some(l + j),
            (l, j) => l.or(j),
        }
    }
}

#[async_trait]
impl ShardClient for InMemoryShard {
    fn endpoint(&self) -> &str {
        &self.endpoint
    }

    async fn ping(&self) -> Result<(), ServingError> {
        if let Some(latency) = self.ping_latency {
            tokio::time::sleep(latency).await;
        }
        self.check_available()
    }

    async fn lookup(
        &self,
        table: &str,
        ids: &[u64],
        dim: usize,
    ) -> Result<Vec<f32>, ServingError> {
        if let Some(delay) = self.delay_for(ids) {
            tokio::time::sleep(delay).await;
        }
        self.check_available()?;
        self.lookups.fetch_add(1, Ordering::SeqCst);

        let tables = self.tables.read().unwrap_or_else(PoisonError::into_inner);
        let rows = tables.get(table);
        let mut values = Vec::with_capacity(ids.len() * dim);
        for id in ids {
            match rows.and_then(|rows| rows.get(id)) {
                Some(vector) if vector.len() == dim => values.extend_from_slice(vector),
                Some(vector) => {
                    return Err(ServingError::SchemaError {
                        msg: format!(
                            "table {} id {} has dim {}, expected {}",
                            table,
                            id,
                            vector.len(),
                            dim
                        ),
                    })
                }
                None => values.extend(std::iter::repeat(0.0).take(dim)),
            }
        }
        if self.padded.load(Ordering::SeqCst) {
            values.push(0.0);
        }
        Ok(values)
    }
}

/// Routes endpoints to registered [`InMemoryShard`]s. Unknown endpoints are unreachable.
#[derive(Default)]
pub struct InMemoryConnector {
    shards: HashMap<String, Arc<InMemoryShard>>,
}

impl InMemoryConnector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, shard: Arc<InMemoryShard>) {
        self.shards.insert(shard.endpoint.clone(), shard);
    }
}

impl ShardConnector for InMemoryConnector {
    fn connect(&self, endpoint: &str) -> Result<Arc<dyn ShardClient>, ServingError> {
        match self.shards.get(endpoint) {
            Some(shard) => Ok(shard.clone() as Arc<dyn ShardClient>),
            None => Err(ServingError::ShardUnavailable {
                endpoint: endpoint.to_string(),
                msg: "no route to shard".to_string(),
            }),
        }
    }
}
