use crate::errors::ServingError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Per-field aggregation fixed at export time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PoolingMode {
    Sum,
    Mean,
    Max,
}

impl FromStr for PoolingMode {
    type Err = ServingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "sum" => Ok(PoolingMode::Sum),
            "mean" => Ok(PoolingMode::Mean),
            "max" => Ok(PoolingMode::Max),
            other => Err(ServingError::DescriptorError {
                msg: format!("unknown pooling mode: {}", other),
            }),
        }
    }
}

impl fmt::Display for PoolingMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PoolingMode::Sum => "sum",
            PoolingMode::Mean => "mean",
            PoolingMode::Max => "max",
        };
        write!(f, "{}", name)
    }
}

/// Pools `vectors` (each of length `dim`) into one vector written to `out`.
/// No vectors leaves `out` all zero.
pub fn pool_into<'a, I>(mode: PoolingMode, dim: usize, vectors: I, out: &mut [f32])
where
    I: IntoIterator<Item = &'a [f32]>,
{
    debug_assert_eq!(out.len(), dim);
    out.iter_mut().for_each(|v| *v = 0.0);

    let mut count = 0usize;
    for vector in vectors {
        match mode {
            PoolingMode::Sum | PoolingMode::Mean => {
                out.iter_mut().zip(vector).for_each(|(o, v)| *o += *v);
            }
            PoolingMode::Max if count == 0 => out.copy_from_slice(&vector[..dim]),
            PoolingMode::Max => {
                out.iter_mut().zip(vector).for_each(|(o, v)| *o = o.max(*v));
            }
        }
        count += 1;
    }

    if mode == PoolingMode::Mean && count > 1 {
        let n = count as f32;
        out.iter_mut().for_each(|o| *o /= n);
    }
}

pub fn pool<'a, I>(mode: PoolingMode, dim: usize, vectors: I) -> Vec<f32>
where
    I: IntoIterator<Item = &'a [f32]>,
{
    let mut out = vec![0.0; dim];
    pool_into(mode, dim, vectors, &mut out);
    out
}
