use std::sync::Arc;
use std::time::{Duration, Instant};

use itertools::Itertools;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::base::{DenseBatch, ModelServe, SparseBatch};
use crate::config::ServingConfig;
use crate::errors::ServingError;
use crate::models::sparse_embedding_bag::context::SparseEmbeddingBagContext;
use crate::models::sparse_embedding_bag::descriptor::ModelDescriptor;
use crate::pool::ClientContextPool;
use crate::reactor::ReactorHandle;

pub const BACKEND_KIND: &str = "sparse_embedding_bag";

const NO_NAMES: &[String] = &[];

/// Looks up sparse ids on remote shards, pools them per field and assembles
/// one dense row per input row.
///
/// The model owns its context exclusively; it can be moved but not cloned.
pub struct SparseEmbeddingBagModel {
    reactor: ReactorHandle,
    load_timeout: Duration,
    predict_timeout: Duration,
    context: Option<Arc<SparseEmbeddingBagContext>>,
}

impl SparseEmbeddingBagModel {
    pub fn new(reactor: ReactorHandle) -> Self {
        let config = ServingConfig::default();
        SparseEmbeddingBagModel::with_timeouts(
            reactor,
            config.load_timeout(),
            config.predict_timeout(),
        )
    }

    pub fn from_config(reactor: ReactorHandle, config: &ServingConfig) -> Self {
        SparseEmbeddingBagModel::with_timeouts(
            reactor,
            config.load_timeout(),
            config.predict_timeout(),
        )
    }

    pub fn with_timeouts(
        reactor: ReactorHandle,
        load_timeout: Duration,
        predict_timeout: Duration,
    ) -> Self {
        SparseEmbeddingBagModel {
            reactor,
            load_timeout,
            predict_timeout,
            context: None,
        }
    }

    pub fn context(&self) -> Option<&SparseEmbeddingBagContext> {
        self.context.as_deref()
    }

    fn loaded_context(&self) -> Result<Arc<SparseEmbeddingBagContext>, ServingError> {
        self.context.clone().ok_or_else(|| ServingError::NotLoaded {
            model: self.name().to_string(),
        })
    }

    fn validate_input(
        context: &SparseEmbeddingBagContext,
        input: &SparseBatch,
    ) -> Result<(), ServingError> {
        if input.num_fields() != context.input_names().len() {
            return Err(ServingError::SchemaError {
                msg: format!(
                    "expected {} fields, got {}",
                    context.input_names().len(),
                    input.num_fields()
                ),
            });
        }
        if let Some((expected, got)) = context
            .input_names()
            .iter()
            .zip(input.field_names())
            .find(|(expected, got)| expected != got)
        {
            return Err(ServingError::SchemaError {
                msg: format!("expected field {}, got {}", expected, got),
            });
        }
        Ok(())
    }
}

impl ModelServe for SparseEmbeddingBagModel {
    type Input = SparseBatch;
    type Output = DenseBatch;

    async fn load(
        &mut self,
        location: &str,
        contexts: &ClientContextPool,
    ) -> Result<(), ServingError> {
        if self.context.is_some() {
            return Err(ServingError::load(
                location,
                ServingError::AlreadyLoaded {
                    model: self.name().to_string(),
                },
            ));
        }

        let started = Instant::now();
        let reactor = &self.reactor;
        let resolve = async {
            let descriptor = ModelDescriptor::read(location).await?;
            SparseEmbeddingBagContext::build(descriptor, contexts, reactor).await
        };
        let context = match tokio::time::timeout(self.load_timeout, resolve).await {
            Ok(Ok(context)) => context,
            Ok(Err(e)) => {
                warn!("failed to load {}: {}", location, e);
                return Err(ServingError::load(location, e));
            }
            Err(_) => {
                warn!("loading {} timed out after {:?}", location, self.load_timeout);
                return Err(ServingError::load(
                    location,
                    ServingError::Timeout {
                        op: "load".to_string(),
                        timeout: self.load_timeout,
                    },
                ));
            }
        };

        info!(
            "loaded model {} from {} in {:?}",
            context.name(),
            location,
            started.elapsed()
        );
        self.context = Some(Arc::new(context));
        Ok(())
    }

    async fn do_predict(&self, input: SparseBatch) -> Result<DenseBatch, ServingError> {
        let context = self.loaded_context()?;
        Self::validate_input(&context, &input)?;

        let num_rows = input.num_rows();
        let width = context.output_width();

        // dropping the set aborts every outstanding lookup and frees its pool slots
        let mut lookups = JoinSet::new();
        for (field, rows) in input.into_columns().into_iter().enumerate() {
            for (row, ids) in rows.into_iter().enumerate() {
                if ids.is_empty() {
                    continue;
                }
                let context = context.clone();
                lookups.spawn_on(
                    async move {
                        let pooled = context.lookup_row(field, &ids).await?;
                        Ok::<_, ServingError>((field, row, pooled))
                    },
                    self.reactor.tokio_handle(),
                );
            }
        }
        debug!(
            "model {} fanned out {} row lookups for {} rows",
            context.name(),
            lookups.len(),
            num_rows
        );

        let mut values = vec![0.0f32; num_rows * width];
        while let Some(joined) = lookups.join_next().await {
            let (field, row, pooled) =
                joined.map_err(|e| ServingError::joined("row lookup", e))??;
            let start = row * width + context.fields()[field].offset();
            values[start..start + pooled.len()].copy_from_slice(&pooled);
        }

        DenseBatch::new(&context.output_names()[0], width, values)
    }

    fn is_loaded(&self) -> bool {
        self.context.is_some()
    }

    fn name(&self) -> &str {
        self.context
            .as_ref()
            .map(|context| context.name())
            .unwrap_or(BACKEND_KIND)
    }

    fn info(&self) -> String {
        match self.context.as_ref() {
            None => format!("SparseEmbeddingBagModel(backend={}, unloaded)", BACKEND_KIND),
            Some(context) => format!(
                "SparseEmbeddingBagModel(name={}, backend={}, fields=[{}], output={}[{}])",
                context.name(),
                BACKEND_KIND,
                context
                    .fields()
                    .iter()
                    .map(|f| format!(
                        "{}:dim={}:{}:shards={}",
                        f.name(),
                        f.dim(),
                        f.pooling(),
                        f.shards().len()
                    ))
                    .join(", "),
                context.output_names().join(","),
                context.output_width(),
            ),
        }
    }

    fn input_names(&self) -> &[String] {
        self.context
            .as_ref()
            .map(|context| context.input_names())
            .unwrap_or(NO_NAMES)
    }

    fn output_names(&self) -> &[String] {
        self.context
            .as_ref()
            .map(|context| context.output_names())
            .unwrap_or(NO_NAMES)
    }

    fn predict_timeout(&self) -> Duration {
        self.predict_timeout
    }
}
