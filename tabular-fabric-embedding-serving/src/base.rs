use crate::errors::ServingError;
use crate::pool::ClientContextPool;
use arrow::array::{ArrayRef, FixedSizeListBuilder, Float32Builder};
use arrow::record_batch::RecordBatch;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

/// Sparse lookup input: for each field, one id list per sample row.
#[derive(Debug, Clone, PartialEq)]
pub struct SparseBatch {
    field_names: Vec<String>,
    field_ids: Vec<Vec<Vec<u64>>>,
    num_rows: usize,
}

impl SparseBatch {
    pub fn new(
        field_names: Vec<String>,
        field_ids: Vec<Vec<Vec<u64>>>,
    ) -> Result<Self, ServingError> {
        if field_names.len() != field_ids.len() {
            return Err(ServingError::SchemaError {
                msg: format!(
                    "{} field names for {} id columns",
                    field_names.len(),
                    field_ids.len()
                ),
            });
        }
        let num_rows = field_ids.first().map_or(0, |rows| rows.len());
        if let Some(pos) = field_ids.iter().position(|rows| rows.len() != num_rows) {
            return Err(ServingError::SchemaError {
                msg: format!(
                    "field {} has {} rows, expected {}",
                    field_names[pos],
                    field_ids[pos].len(),
                    num_rows
                ),
            });
        }
        Ok(SparseBatch {
            field_names,
            field_ids,
            num_rows,
        })
    }

    pub fn field_names(&self) -> &[String] {
        &self.field_names
    }

    pub fn num_fields(&self) -> usize {
        self.field_names.len()
    }

    pub fn num_rows(&self) -> usize {
        self.num_rows
    }

    /// Id lists of field `field`, one per row.
    pub fn field(&self, field: usize) -> Option<&[Vec<u64>]> {
        self.field_ids.get(field).map(|rows| rows.as_slice())
    }

    pub fn into_columns(self) -> Vec<Vec<Vec<u64>>> {
        self.field_ids
    }
}

/// Dense output handed to the downstream tensor engine, row-major.
#[derive(Debug, Clone, PartialEq)]
pub struct DenseBatch {
    column_name: String,
    width: usize,
    num_rows: usize,
    values: Vec<f32>,
}

impl DenseBatch {
    pub fn new(column_name: &str, width: usize, values: Vec<f32>) -> Result<Self, ServingError> {
        let num_rows = match width {
            0 if values.is_empty() => 0,
            0 => {
                return Err(ServingError::SchemaError {
                    msg: "zero width batch with values".to_string(),
                })
            }
            w if values.len() % w != 0 => {
                return Err(ServingError::SchemaError {
                    msg: format!("{} values do not divide into rows of {}", values.len(), w),
                })
            }
            w => values.len() / w,
        };
        Ok(DenseBatch {
            column_name: column_name.to_string(),
            width,
            num_rows,
            values,
        })
    }

    pub fn column_name(&self) -> &str {
        &self.column_name
    }

    pub fn width(&self) -> usize {
        self.width
    }

    pub fn num_rows(&self) -> usize {
        self.num_rows
    }

    pub fn row(&self, row: usize) -> Option<&[f32]> {
        if row >= self.num_rows {
            return None;
        }
        Some(&self.values[row * self.width..(row + 1) * self.width])
    }

    pub fn values(&self) -> &[f32] {
        &self.values
    }

    /// One `FixedSizeList<Float32>` column of `width` per row.
    pub fn to_record_batch(&self) -> Result<RecordBatch, ServingError> {
        let width = i32::try_from(self.width).map_err(|_| ServingError::SchemaError {
            msg: format!("row width {} exceeds arrow list size", self.width),
        })?;
        let mut builder = FixedSizeListBuilder::new(Float32Builder::new(), width);
        for row in self.values.chunks(self.width.max(1)) {
            builder.values().append_slice(row);
            builder.append(true);
        }
        let column: ArrayRef = Arc::new(builder.finish());
        Ok(RecordBatch::try_from_iter(vec![(
            self.column_name.as_str(),
            column,
        )])?)
    }
}

/// Lifecycle every model backend implements. Dispatch is static: serving code
/// is generic over `M: ModelServe` and no future is boxed.
pub trait ModelServe: Send + Sync {
    type Input: Send;
    type Output: Send;

    /// Performs all I/O needed to reach a servable state. Must complete before any predict.
    fn load(
        &mut self,
        location: &str,
        contexts: &ClientContextPool,
    ) -> impl Future<Output = Result<(), ServingError>> + Send;

    /// Backend specific prediction. Callers go through [`ModelServe::predict`].
    fn do_predict(
        &self,
        input: Self::Input,
    ) -> impl Future<Output = Result<Self::Output, ServingError>> + Send;

    fn is_loaded(&self) -> bool;

    fn name(&self) -> &str;

    fn info(&self) -> String;

    fn input_names(&self) -> &[String];

    fn output_names(&self) -> &[String];

    fn predict_timeout(&self) -> Duration;

    fn predict(
        &self,
        input: Self::Input,
    ) -> impl Future<Output = Result<Self::Output, ServingError>> + Send {
        self.predict_with_deadline(input, self.predict_timeout())
    }

    fn predict_with_deadline(
        &self,
        input: Self::Input,
        deadline: Duration,
    ) -> impl Future<Output = Result<Self::Output, ServingError>> + Send {
        async move {
            if !self.is_loaded() {
                return Err(ServingError::predict(
                    self.name(),
                    ServingError::NotLoaded {
                        model: self.name().to_string(),
                    },
                ));
            }
            match tokio::time::timeout(deadline, self.do_predict(input)).await {
                Ok(Ok(output)) => Ok(output),
                Ok(Err(e @ ServingError::PredictError { .. })) => Err(e),
                Ok(Err(e)) => Err(ServingError::predict(self.name(), e)),
                Err(_) => Err(ServingError::predict(
                    self.name(),
                    ServingError::Timeout {
                        op: "predict".to_string(),
                        timeout: deadline,
                    },
                )),
            }
        }
    }
}

/// Loads any backend, failing if it is already loaded.
pub async fn load_model<M: ModelServe>(
    model: &mut M,
    location: &str,
    contexts: &ClientContextPool,
) -> Result<(), ServingError> {
    if model.is_loaded() {
        return Err(ServingError::load(
            location,
            ServingError::AlreadyLoaded {
                model: model.name().to_string(),
            },
        ));
    }
    model.load(location, contexts).await
}
