//! Fixed-length, L2-normalized feature vectors and the small set of kernels
//! every other component needs (dot, cosine, squared distance).

use std::sync::Arc;

#[cfg(feature = "simd")]
use wide::f32x4;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Default embedding dimension.
pub const DEFAULT_DIM: usize = 128;

/// Norms below this are treated as zero.
const NORM_EPS: f32 = 1.0e-12;

/// An immutable, L2-normalized feature vector.
///
/// Cloning is cheap (shared buffer), so the vector can be handed to the
/// quantizer, the directory and the bank without copying.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(from = "Vec<f32>", into = "Vec<f32>"))]
pub struct FeatureVector {
    values: Arc<[f32]>,
}

impl FeatureVector {
    /// Normalize `values` to unit length.
    ///
    /// Non-finite components are zeroed first. A vector with no energy left
    /// stays all-zero; callers that need a usable pattern should go through
    /// the encoder, which substitutes its default vector.
    pub fn from_raw(mut values: Vec<f32>) -> Self {
        for v in values.iter_mut() {
            if !v.is_finite() {
                *v = 0.0;
            }
        }
        l2_normalize(&mut values);
        Self {
            values: values.into(),
        }
    }

    pub fn zeros(dim: usize) -> Self {
        Self {
            values: vec![0.0; dim].into(),
        }
    }

    /// Unit vector with every component equal to `1/sqrt(dim)`.
    pub fn uniform(dim: usize) -> Self {
        let c = if dim == 0 { 0.0 } else { 1.0 / (dim as f32).sqrt() };
        Self {
            values: vec![c; dim].into(),
        }
    }

    /// Normalized mean of `parts`. Returns `None` for an empty slice or
    /// mismatched dimensions.
    pub fn mean_of(parts: &[FeatureVector]) -> Option<Self> {
        let first = parts.first()?;
        let dim = first.dim();
        let mut acc = vec![0.0f32; dim];
        for p in parts {
            if p.dim() != dim {
                return None;
            }
            for (a, &v) in acc.iter_mut().zip(p.as_slice()) {
                *a += v;
            }
        }
        Some(Self::from_raw(acc))
    }

    #[inline]
    pub fn as_slice(&self) -> &[f32] {
        &self.values
    }

    #[inline]
    pub fn dim(&self) -> usize {
        self.values.len()
    }

    pub fn norm(&self) -> f32 {
        dot(&self.values, &self.values).sqrt()
    }

    pub fn is_zero(&self) -> bool {
        self.norm() <= NORM_EPS
    }

    pub fn dot(&self, other: &FeatureVector) -> f32 {
        dot(&self.values, &other.values)
    }

    pub fn cosine(&self, other: &FeatureVector) -> f32 {
        cosine(&self.values, &other.values)
    }

    pub fn to_vec(&self) -> Vec<f32> {
        self.values.to_vec()
    }
}

impl From<Vec<f32>> for FeatureVector {
    fn from(values: Vec<f32>) -> Self {
        Self::from_raw(values)
    }
}

impl From<FeatureVector> for Vec<f32> {
    fn from(v: FeatureVector) -> Self {
        v.to_vec()
    }
}

/// Scale `values` to unit length in place. Returns the original norm.
pub fn l2_normalize(values: &mut [f32]) -> f32 {
    let norm = dot(values, values).sqrt();
    if norm > NORM_EPS {
        let inv = 1.0 / norm;
        for v in values.iter_mut() {
            *v *= inv;
        }
    }
    norm
}

/// Dot product over the common prefix of `a` and `b`.
#[cfg(not(feature = "simd"))]
#[inline]
pub fn dot(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

/// Dot product over the common prefix of `a` and `b` (4 lanes at a time).
#[cfg(feature = "simd")]
pub fn dot(a: &[f32], b: &[f32]) -> f32 {
    let n = a.len().min(b.len());
    let simd_end = n - (n % 4);
    let mut acc = f32x4::splat(0.0);
    for i in (0..simd_end).step_by(4) {
        let x = f32x4::from([a[i], a[i + 1], a[i + 2], a[i + 3]]);
        let y = f32x4::from([b[i], b[i + 1], b[i + 2], b[i + 3]]);
        acc = acc + x * y;
    }
    let mut sum: f32 = acc.to_array().iter().sum();
    for i in simd_end..n {
        sum += a[i] * b[i];
    }
    sum
}

pub fn cosine(a: &[f32], b: &[f32]) -> f32 {
    let na = dot(a, a).sqrt();
    let nb = dot(b, b).sqrt();
    if na <= NORM_EPS || nb <= NORM_EPS {
        return 0.0;
    }
    (dot(a, b) / (na * nb)).clamp(-1.0, 1.0)
}

pub fn squared_distance(a: &[f32], b: &[f32]) -> f32 {
    a.iter()
        .zip(b)
        .map(|(x, y)| {
            let d = x - y;
            d * d
        })
        .sum()
}

/// Fold `values` into `width` buckets (bucket `i % width`) and normalize.
///
/// Gives a fixed-width signature of a longer vector; used for neuron weights.
pub fn fold(values: &[f32], width: usize) -> Vec<f32> {
    let mut out = vec![0.0f32; width];
    if width == 0 {
        return out;
    }
    for (i, &v) in values.iter().enumerate() {
        out[i % width] += v;
    }
    l2_normalize(&mut out);
    out
}
