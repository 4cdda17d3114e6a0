//! Distance and centroid primitives.

use crate::error::PeopleError;
use crate::kmeans::{KMEANS_SEED, kmeans};

/// Below this many vectors a person is represented by its plain centroid.
const MULTI_CENTROID_MIN: usize = 10;

/// One extra representative per this many vectors.
const VECTORS_PER_CENTROID: usize = 20;

/// Dot product with f64 accumulation.
pub(crate) fn dot(a: &[f32], b: &[f32]) -> f64 {
    a.iter()
        .zip(b)
        .map(|(&x, &y)| (x as f64) * (y as f64))
        .sum()
}

/// Euclidean length with f64 accumulation.
pub(crate) fn norm(v: &[f32]) -> f64 {
    dot(v, v).sqrt()
}

/// Cosine distance `1 - (a·b)/(|a||b|)`, in `[0, 2]`.
///
/// Zero-norm inputs have no direction and yield
/// [`PeopleError::DegenerateVector`]; callers skip such items.
pub fn cosine_distance(a: &[f32], b: &[f32]) -> Result<f32, PeopleError> {
    if a.len() != b.len() {
        return Err(PeopleError::DimensionMismatch {
            expected: a.len(),
            got: b.len(),
        });
    }
    let denom = norm(a) * norm(b);
    if denom == 0.0 || !denom.is_finite() {
        return Err(PeopleError::DegenerateVector);
    }
    // Clamp to [-1, 1] to handle floating point errors.
    let similarity = (dot(a, b) / denom).clamp(-1.0, 1.0);
    Ok((1.0 - similarity) as f32)
}

/// Cosine distance between two vectors already of unit length.
pub(crate) fn unit_distance(a: &[f32], b: &[f32]) -> f32 {
    (1.0 - dot(a, b).clamp(-1.0, 1.0)) as f32
}

/// Normalizes a vector to unit length in-place. Zero vectors are left as
/// they are (their norm is taken to be 1).
pub fn l2_normalize(v: &mut [f32]) {
    let n = norm(v);
    if n > 0.0 {
        let scale = (1.0 / n) as f32;
        for x in v.iter_mut() {
            *x *= scale;
        }
    }
}

/// Component-wise mean. Vectors whose length differs from the first one's
/// are ignored. Returns `None` for an empty input.
pub fn centroid<V: AsRef<[f32]>>(vectors: &[V]) -> Option<Vec<f32>> {
    let dim = vectors.first()?.as_ref().len();
    let mut sum = vec![0.0f64; dim];
    let mut count = 0usize;
    for v in vectors {
        let v = v.as_ref();
        if v.len() != dim {
            continue;
        }
        for (s, &x) in sum.iter_mut().zip(v) {
            *s += x as f64;
        }
        count += 1;
    }
    let n = count as f64;
    Some(sum.into_iter().map(|s| (s / n) as f32).collect())
}

/// Representative centers for a set of vectors.
///
/// Fewer than 10 vectors give `[centroid]`. Otherwise
/// `k = min(max_k, max(1, count / 20))` centers are extracted with seeded
/// k-means, so large sets keep distinct poses (frontal, profile) apart.
/// Falls back to `[centroid]` if k-means cannot run.
pub fn multi_centroid<V: AsRef<[f32]>>(vectors: &[V], max_k: usize) -> Vec<Vec<f32>> {
    let Some(mean) = centroid(vectors) else {
        return Vec::new();
    };
    let count = vectors.len();
    if count < MULTI_CENTROID_MIN {
        return vec![mean];
    }
    let k = max_k.min((count / VECTORS_PER_CENTROID).max(1));
    if k <= 1 {
        return vec![mean];
    }
    match kmeans(vectors, k, KMEANS_SEED) {
        Some(centers) => centers,
        None => {
            tracing::debug!(count, k, "people: k-means failed, falling back to mean");
            vec![mean]
        }
    }
}
