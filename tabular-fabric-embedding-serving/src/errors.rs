use arrow::error::ArrowError;
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinError;

#[derive(Error, Debug)]
pub enum ServingError {
    #[error("reactor construction failed: {msg}")]
    ConstructionError { msg: String },

    #[error("failed to load model from {location}: {source}")]
    LoadError {
        location: String,
        source: Box<ServingError>,
    },

    #[error("predict failed on model {model}: {source}")]
    PredictError {
        model: String,
        source: Box<ServingError>,
    },

    #[error("model {model} is not loaded")]
    NotLoaded { model: String },

    #[error("model {model} is already loaded")]
    AlreadyLoaded { model: String },

    #[error("schema error: {msg}")]
    SchemaError { msg: String },

    #[error("descriptor error: {msg}")]
    DescriptorError { msg: String },

    #[error("shard {endpoint} unavailable: {msg}")]
    ShardUnavailable { endpoint: String, msg: String },

    #[error("client context pool exhausted, capacity {capacity}, waited {waited:?}")]
    PoolExhausted { capacity: usize, waited: Duration },

    #[error("{op} timed out after {timeout:?}")]
    Timeout { op: String, timeout: Duration },

    #[error("cancelled: {msg}")]
    Cancelled { msg: String },

    #[error("io error: {source}")]
    IoError { source: std::io::Error },

    #[error("json error: {source}")]
    JsonError { source: serde_json::Error },

    #[error("arrow error: {source}")]
    ArrowError { source: ArrowError },

    #[error("generic error: {msg}")]
    GenericError { msg: String },

    #[error("unspecified serving error: {msg}, {source}")]
    UnspecifiedError { msg: String, source: anyhow::Error },
}

/// Coarse failure taxonomy used by callers deciding whether a model is still servable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    /// Process start fault, not recoverable per call.
    Construction,
    /// The model never became servable.
    Load,
    /// One call failed; the model stays servable.
    Predict,
    /// Client pool saturation outlasted the acquire timeout.
    ResourceExhaustion,
}

impl ServingError {
    pub fn load(location: impl Into<String>, source: ServingError) -> Self {
        ServingError::LoadError {
            location: location.into(),
            source: Box::new(source),
        }
    }

    pub fn predict(model: impl Into<String>, source: ServingError) -> Self {
        ServingError::PredictError {
            model: model.into(),
            source: Box::new(source),
        }
    }

    /// The innermost cause, looking through load and predict wrappers.
    pub fn root_cause(&self) -> &ServingError {
        match self {
            ServingError::LoadError { source, .. } | ServingError::PredictError { source, .. } => {
                source.root_cause()
            }
            other => other,
        }
    }

    /// Maps a failed spawned task: an abort is a cancellation, a panic is a bug.
    pub fn joined(task: &str, e: JoinError) -> Self {
        if e.is_panic() {
            ServingError::GenericError {
                msg: format!("{} panicked: {}", task, e),
            }
        } else {
            ServingError::Cancelled {
                msg: format!("{} aborted: {}", task, e),
            }
        }
    }

    pub fn failure_class(&self) -> FailureClass {
        match self {
            ServingError::ConstructionError { .. } => FailureClass::Construction,
            ServingError::LoadError { .. } => FailureClass::Load,
            ServingError::PredictError { source, .. } => match source.as_ref() {
                ServingError::PoolExhausted { .. } => FailureClass::ResourceExhaustion,
                _ => FailureClass::Predict,
            },
            ServingError::PoolExhausted { .. } => FailureClass::ResourceExhaustion,
            _ => FailureClass::Predict,
        }
    }
}

impl From<String> for ServingError {
    fn from(msg: String) -> Self {
        ServingError::GenericError { msg }
    }
}

impl From<anyhow::Error> for ServingError {
    fn from(err: anyhow::Error) -> Self {
        ServingError::UnspecifiedError {
            msg: err.to_string(),
            source: err,
        }
    }
}

impl From<std::io::Error> for ServingError {
    fn from(err: std::io::Error) -> Self {
        ServingError::IoError { source: err }
    }
}

impl From<serde_json::Error> for ServingError {
    fn from(err: serde_json::Error) -> Self {
        ServingError::JsonError { source: err }
    }
}

impl From<ArrowError> for ServingError {
    fn from(err: ArrowError) -> Self {
        ServingError::ArrowError { source: err }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_root_cause_looks_through_wrappers() {
        let err = ServingError::predict(
            "ctr",
            ServingError::ShardUnavailable {
                endpoint: "mem://shard-0".to_string(),
                msg: "down".to_string(),
            },
        );
        assert!(matches!(
            err.root_cause(),
            ServingError::ShardUnavailable { endpoint, .. } if endpoint == "mem://shard-0"
        ));
        assert_eq!(err.failure_class(), FailureClass::Predict);
    }

    #[test]
    fn test_failure_class() {
        let exhausted = ServingError::PoolExhausted {
            capacity: 2,
            waited: Duration::from_millis(5),
        };
        assert_eq!(
            ServingError::predict("ctr", exhausted).failure_class(),
            FailureClass::ResourceExhaustion
        );
        let load = ServingError::load(
            "/models/ctr",
            ServingError::DescriptorError {
                msg: "no fields".to_string(),
            },
        );
        assert_eq!(load.failure_class(), FailureClass::Load);
        assert!(load.to_string().contains("/models/ctr"));
        assert_eq!(
            ServingError::ConstructionError { msg: "x".to_string() }.failure_class(),
            FailureClass::Construction
        );
    }

    #[test]
    fn test_from_string() {
        let err: ServingError = "boom".to_string().into();
        assert_eq!(err.to_string(), "generic error: boom");
    }

    #[tokio::test]
    async fn test_joined_separates_panics_from_aborts() {
        let panicked = tokio::spawn(async {
            panic!("bad index");
        })
        .await
        .err()
        .unwrap();
        let err = ServingError::joined("row lookup", panicked);
        assert!(matches!(err, ServingError::GenericError { .. }));
        assert!(err.to_string().contains("row lookup panicked"));

        let pending = tokio::spawn(std::future::pending::<()>());
        pending.abort();
        let aborted = pending.await.err().unwrap();
        assert!(matches!(
            ServingError::joined("row lookup", aborted),
            ServingError::Cancelled { .. }
        ));
    }
}
