use crate::errors::ServingError;
use dotenv_config::EnvConfig;
use dotenvy::dotenv;
use std::time::Duration;
use tracing::info;

const NUMERIC_KEYS: &[&str] = &[
    "TABULAR_EMBEDDING_SERVING_WORKER_THREADS",
    "TABULAR_EMBEDDING_SERVING_POOL_CAPACITY",
    "TABULAR_EMBEDDING_SERVING_POOL_ACQUIRE_TIMEOUT_MS",
    "TABULAR_EMBEDDING_SERVING_LOAD_TIMEOUT_MS",
    "TABULAR_EMBEDDING_SERVING_PREDICT_TIMEOUT_MS",
];

#[derive(Debug, EnvConfig, Clone)]
pub struct ServingConfig {
    #[env_config(name = "TABULAR_EMBEDDING_SERVING_WORKER_THREADS", default = 4)]
    pub worker_threads: usize,

    #[env_config(
        name = "TABULAR_EMBEDDING_SERVING_THREAD_NAME",
        default = "embedding-serving-reactor"
    )]
    pub thread_name: String,

    #[env_config(name = "TABULAR_EMBEDDING_SERVING_POOL_CAPACITY", default = 64)]
    pub pool_capacity: usize,

    #[env_config(
        name = "TABULAR_EMBEDDING_SERVING_POOL_ACQUIRE_TIMEOUT_MS",
        default = 1000
    )]
    pub pool_acquire_timeout_ms: u64,

    #[env_config(name = "TABULAR_EMBEDDING_SERVING_LOAD_TIMEOUT_MS", default = 30000)]
    pub load_timeout_ms: u64,

    #[env_config(name = "TABULAR_EMBEDDING_SERVING_PREDICT_TIMEOUT_MS", default = 200)]
    pub predict_timeout_ms: u64,

    #[env_config(name = "TABULAR_EMBEDDING_SERVING_TIMEZONE", default = "Asia/Shanghai")]
    pub timezone: String,

    #[env_config(name = "TABULAR_LOG_FORMAT", default = "text")]
    pub log_format: String,

    #[env_config(name = "TABULAR_LOG_LEVEL", default = "INFO")]
    pub log_level: String,
}

impl Default for ServingConfig {
    fn default() -> Self {
        ServingConfig {
            worker_threads: 4,
            thread_name: "embedding-serving-reactor".to_string(),
            pool_capacity: 64,
            pool_acquire_timeout_ms: 1000,
            load_timeout_ms: 30000,
            predict_timeout_ms: 200,
            timezone: "Asia/Shanghai".to_string(),
            log_format: "text".to_string(),
            log_level: "INFO".to_string(),
        }
    }
}

impl ServingConfig {
    /// Reads the process environment, after merging a `.env` file when one exists.
    pub fn from_env() -> Result<Self, ServingError> {
        if let Ok(path) = dotenv() {
            info!("config loaded from env file: {:?}", path);
        }
        // init() panics on an unparsable number, so reject those up front
        for key in NUMERIC_KEYS {
            if let Ok(value) = std::env::var(key) {
                check_numeric(key, &value)?;
            }
        }
        ServingConfig::init().map_err(|e| ServingError::GenericError {
            msg: format!("invalid serving config: {:?}", e),
        })
    }

    pub fn pool_acquire_timeout(&self) -> Duration {
        Duration::from_millis(self.pool_acquire_timeout_ms)
    }

    pub fn load_timeout(&self) -> Duration {
        Duration::from_millis(self.load_timeout_ms)
    }

    pub fn predict_timeout(&self) -> Duration {
        Duration::from_millis(self.predict_timeout_ms)
    }
}

fn check_numeric(key: &str, value: &str) -> Result<u64, ServingError> {
    value
        .to_lowercase()
        .parse::<u64>()
        .map_err(|e| ServingError::GenericError {
            msg: format!("invalid serving config: {}={:?}: {}", key, value, e),
        })
}
