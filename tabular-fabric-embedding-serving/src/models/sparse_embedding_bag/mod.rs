pub mod context;
pub mod descriptor;
pub mod model;
pub mod pooling;

pub use context::{FieldContext, SparseEmbeddingBagContext};
pub use descriptor::{FieldDescriptor, ModelDescriptor};
pub use model::SparseEmbeddingBagModel;
pub use pooling::PoolingMode;
