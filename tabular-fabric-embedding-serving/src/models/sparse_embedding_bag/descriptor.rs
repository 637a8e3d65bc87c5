use std::collections::HashSet;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::errors::ServingError;
use crate::models::sparse_embedding_bag::pooling::PoolingMode;

pub const DESCRIPTOR_FILE_NAME: &str = "sparse_embedding_bag.json";
pub const DESCRIPTOR_VERSION: u32 = 1;
pub const DEFAULT_OUTPUT_NAME: &str = "sparse_embedding";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldDescriptor {
    pub name: String,
    #[serde(default)]
    pub table: Option<String>,
    pub dim: usize,
    pub pooling: PoolingMode,
    pub shards: Vec<String>,
}

impl FieldDescriptor {
    pub fn table(&self) -> &str {
        self.table.as_deref().unwrap_or(&self.name)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelDescriptor {
    pub version: u32,
    pub name: String,
    #[serde(default)]
    pub output_name: Option<String>,
    pub fields: Vec<FieldDescriptor>,
}

impl ModelDescriptor {
    pub fn output_name(&self) -> &str {
        self.output_name.as_deref().unwrap_or(DEFAULT_OUTPUT_NAME)
    }

    pub fn parse(content: &str) -> Result<Self, ServingError> {
        let descriptor: ModelDescriptor =
            serde_json::from_str(content).map_err(|e| ServingError::DescriptorError {
                msg: format!("malformed descriptor: {}", e),
            })?;
        descriptor.validate()?;
        Ok(descriptor)
    }

    /// Reads the descriptor at `location`, or inside it when `location` is a directory.
    pub async fn read(location: &str) -> Result<Self, ServingError> {
        let path = descriptor_path(location).await?;
        debug!("reading model descriptor: {:?}", path);
        let content = tokio::fs::read_to_string(&path)
            .await
            .map_err(|e| ServingError::DescriptorError {
                msg: format!("cannot read {}: {}", path.display(), e),
            })?;
        ModelDescriptor::parse(&content)
    }

    pub fn validate(&self) -> Result<(), ServingError> {
        if self.version != DESCRIPTOR_VERSION {
            return Err(ServingError::DescriptorError {
                msg: format!(
                    "unsupported descriptor version {}, expected {}",
                    self.version, DESCRIPTOR_VERSION
                ),
            });
        }
        if self.fields.is_empty() {
            return Err(ServingError::DescriptorError {
                msg: format!("model {} declares no fields", self.name),
            });
        }
        let mut seen = HashSet::new();
        for field in &self.fields {
            if !seen.insert(field.name.as_str()) {
                return Err(ServingError::DescriptorError {
                    msg: format!("duplicate field {}", field.name),
                });
            }
            if field.dim == 0 {
                return Err(ServingError::DescriptorError {
                    msg: format!("field {} has zero dimension", field.name),
                });
            }
            if field.shards.is_empty() {
                return Err(ServingError::DescriptorError {
                    msg: format!("field {} has no shards", field.name),
                });
            }
        }
        Ok(())
    }
}

async fn descriptor_path(location: &str) -> Result<PathBuf, ServingError> {
    let path = Path::new(location);
    let metadata = tokio::fs::metadata(path)
        .await
        .map_err(|e| ServingError::DescriptorError {
            msg: format!("cannot stat {}: {}", location, e),
        })?;
    if metadata.is_dir() {
        Ok(path.join(DESCRIPTOR_FILE_NAME))
    } else {
        Ok(path.to_path_buf())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DESCRIPTOR: &str = r#"{
        "version": 1,
        "name": "ctr",
        "fields": [
            {"name": "user_id", "dim": 8, "pooling": "sum", "shards": ["mem://0", "mem://1"]},
            {"name": "item_id", "table": "items", "dim": 4, "pooling": "mean", "shards": ["mem://0"]}
        ]
    }"#;

    #[test]
    fn test_parse_defaults() {
        let descriptor = ModelDescriptor::parse(DESCRIPTOR).unwrap();
        assert_eq!(descriptor.output_name(), DEFAULT_OUTPUT_NAME);
        assert_eq!(descriptor.fields[0].table(), "user_id");
        assert_eq!(descriptor.fields[1].table(), "items");
        assert_eq!(descriptor.fields[1].pooling, PoolingMode::Mean);
    }

    #[test]
    fn test_rejects_unknown_pooling() {
        let content = DESCRIPTOR.replace("\"mean\"", "\"median\"");
        assert!(matches!(
            ModelDescriptor::parse(&content),
            Err(ServingError::DescriptorError { .. })
        ));
    }

    #[test]
    fn test_rejects_invalid_fields() {
        let mut descriptor = ModelDescriptor::parse(DESCRIPTOR).unwrap();
        descriptor.fields[1].name = "user_id".to_string();
        assert!(descriptor.validate().is_err());

        let mut descriptor = ModelDescriptor::parse(DESCRIPTOR).unwrap();
        descriptor.fields[0].dim = 0;
        assert!(descriptor.validate().is_err());

        let mut descriptor = ModelDescriptor::parse(DESCRIPTOR).unwrap();
        descriptor.fields[0].shards.clear();
        assert!(descriptor.validate().is_err());

        let mut descriptor = ModelDescriptor::parse(DESCRIPTOR).unwrap();
        descriptor.version = 2;
        assert!(descriptor.validate().is_err());

        let mut descriptor = ModelDescriptor::parse(DESCRIPTOR).unwrap();
        descriptor.fields.clear();
        assert!(descriptor.validate().is_err());
    }

    #[tokio::test]
    async fn test_read_from_dir_and_file() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join(DESCRIPTOR_FILE_NAME);
        std::fs::write(&file, DESCRIPTOR).unwrap();

        let from_dir = ModelDescriptor::read(dir.path().to_str().unwrap()).await.unwrap();
        let from_file = ModelDescriptor::read(file.to_str().unwrap()).await.unwrap();
        assert_eq!(from_dir, from_file);

        let missing = dir.path().join("nope");
        assert!(ModelDescriptor::read(missing.to_str().unwrap()).await.is_err());
    }
}
