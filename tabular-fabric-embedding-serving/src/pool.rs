use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, info};

use crate::config::ServingConfig;
use crate::errors::ServingError;
use crate::transport::{ShardClient, ShardConnector};

/// Bounded set of outbound call contexts shared by every model in the process.
///
/// Acquisition beyond `capacity` queues on a semaphore; a waiter that is not
/// served within `acquire_timeout` fails with [`ServingError::PoolExhausted`].
/// Clones share the same slots.
#[derive(Clone)]
pub struct ClientContextPool {
    inner: Arc<PoolInner>,
}

struct PoolInner {
    connector: Arc<dyn ShardConnector>,
    clients: Mutex<HashMap<String, Arc<dyn ShardClient>>>,
    permits: Arc<Semaphore>,
    capacity: usize,
    acquire_timeout: Duration,
}

/// A checked-out context. The slot returns to the pool when this is dropped.
pub struct PooledContext {
    client: Arc<dyn ShardClient>,
    _permit: OwnedSemaphorePermit,
}

impl PooledContext {
    pub fn client(&self) -> &dyn ShardClient {
        self.client.as_ref()
    }
}

impl ClientContextPool {
    pub fn new(
        connector: Arc<dyn ShardConnector>,
        capacity: usize,
        acquire_timeout: Duration,
    ) -> Self {
        info!(
            "client context pool created, capacity: {}, acquire_timeout: {:?}",
            capacity, acquire_timeout
        );
        ClientContextPool {
            inner: Arc::new(PoolInner {
                connector,
                clients: Mutex::new(HashMap::new()),
                permits: Arc::new(Semaphore::new(capacity)),
                capacity,
                acquire_timeout,
            }),
        }
    }

    pub fn from_config(connector: Arc<dyn ShardConnector>, config: &ServingConfig) -> Self {
        ClientContextPool::new(connector, config.pool_capacity, config.pool_acquire_timeout())
    }

    pub fn capacity(&self) -> usize {
        self.inner.capacity
    }

    pub fn available(&self) -> usize {
        self.inner.permits.available_permits()
    }

    pub async fn acquire(&self, endpoint: &str) -> Result<PooledContext, ServingError> {
        let inner = &self.inner;
        let started = Instant::now();
        let permit = match tokio::time::timeout(
            inner.acquire_timeout,
            inner.permits.clone().acquire_owned(),
        )
        .await
        {
            Ok(Ok(permit)) => permit,
            Ok(Err(_)) => {
                return Err(ServingError::GenericError {
                    msg: "client context pool closed".to_string(),
                })
            }
            Err(_) => {
                return Err(ServingError::PoolExhausted {
                    capacity: inner.capacity,
                    waited: started.elapsed(),
                })
            }
        };
        let client = inner.client_for(endpoint)?;
        Ok(PooledContext {
            client,
            _permit: permit,
        })
    }
}

impl PoolInner {
    fn client_for(&self, endpoint: &str) -> Result<Arc<dyn ShardClient>, ServingError> {
        let mut clients = self.clients.lock().map_err(|e| ServingError::GenericError {
            msg: format!("client cache poisoned: {}", e),
        })?;
        if let Some(client) = clients.get(endpoint) {
            return Ok(client.clone());
        }
        let client = self.connector.connect(endpoint)?;
        debug!("connected shard client: {}", endpoint);
        clients.insert(endpoint.to_string(), client.clone());
        Ok(client)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::memory::{InMemoryConnector, InMemoryShard};

    fn pool(capacity: usize, timeout: Duration) -> ClientContextPool {
        let mut connector = InMemoryConnector::new();
        connector.register(Arc::new(InMemoryShard::new("mem://0")));
        ClientContextPool::new(Arc::new(connector), capacity, timeout)
    }

    #[tokio::test]
    async fn test_release_on_drop() {
        let pool = pool(2, Duration::from_millis(50));
        let ctx = pool.acquire("mem://0").await.unwrap();
        assert_eq!(ctx.client().endpoint(), "mem://0");
        assert_eq!(pool.available(), 1);
        drop(ctx);
        assert_eq!(pool.available(), 2);
    }

    #[tokio::test]
    async fn test_exhaustion_times_out() {
        let pool = pool(1, Duration::from_millis(20));
        let _held = pool.acquire("mem://0").await.unwrap();
        let err = pool.acquire("mem://0").await.err().unwrap();
        assert!(matches!(err, ServingError::PoolExhausted { capacity: 1, .. }));
    }

    #[tokio::test]
    async fn test_waiter_is_served_after_release() {
        let pool = pool(1, Duration::from_secs(5));
        let held = pool.acquire("mem://0").await.unwrap();
        let waiter = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.acquire("mem://0").await.map(|_| ()) })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        drop(held);
        assert!(waiter.await.unwrap().is_ok());
        assert_eq!(pool.available(), 1);
    }

    #[tokio::test]
    async fn test_unknown_endpoint_releases_slot() {
        let pool = pool(1, Duration::from_millis(20));
        assert!(matches!(
            pool.acquire("mem://9").await,
            Err(ServingError::ShardUnavailable { .. })
        ));
        assert_eq!(pool.available(), 1);
    }
}
