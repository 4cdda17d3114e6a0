use std::collections::VecDeque;

use crate::error::PeopleError;
use crate::vector::unit_distance;

/// Label of a point that belongs to no cluster.
pub const NOISE: i32 = -1;

const UNDEFINED: i32 = 0;

/// Runs the DBSCAN clustering algorithm using cosine distance.
///
/// # Parameters
/// - `vectors`: the data points (L2-normalized embeddings)
/// - `eps`: maximum cosine distance (1 - cosine_similarity) for neighbors
/// - `min_samples`: minimum neighborhood size, the point itself included,
///   for a point to be a core point
///
/// # Returns
/// Cluster labels for each vector. [`NOISE`] (-1) means unassigned.
/// Positive labels (1, 2, ...) identify clusters.
///
/// Malformed input (mixed dimensions, non-finite components, `eps` outside
/// `(0, 2]`, `min_samples == 0`) is rejected with
/// [`PeopleError::Clustering`].
pub fn dbscan<V: AsRef<[f32]>>(
    vectors: &[V],
    eps: f32,
    min_samples: usize,
) -> Result<Vec<i32>, PeopleError> {
    validate(vectors, eps, min_samples)?;

    let n = vectors.len();
    let mut labels = vec![UNDEFINED; n];
    // Id of the cluster whose seed set last queued each point.
    let mut queued = vec![UNDEFINED; n];
    let mut cluster_id: i32 = 0;

    for i in 0..n {
        if labels[i] != UNDEFINED {
            continue;
        }

        let neighbors = range_query(vectors, i, eps);
        if neighbors.len() < min_samples {
            labels[i] = NOISE;
            continue;
        }

        // Start a new cluster.
        cluster_id += 1;
        labels[i] = cluster_id;

        // Seed set: neighbors minus point i.
        queued[i] = cluster_id;
        let mut seed: VecDeque<usize> = VecDeque::new();
        for j in neighbors {
            if queued[j] != cluster_id {
                queued[j] = cluster_id;
                seed.push_back(j);
            }
        }

        while let Some(q) = seed.pop_front() {
            if labels[q] == NOISE {
                // Border point: reachable but not core.
                labels[q] = cluster_id;
            }
            if labels[q] != UNDEFINED {
                continue;
            }
            labels[q] = cluster_id;

            let q_neighbors = range_query(vectors, q, eps);
            if q_neighbors.len() >= min_samples {
                for j in q_neighbors {
                    if queued[j] != cluster_id {
                        queued[j] = cluster_id;
                        seed.push_back(j);
                    }
                }
            }
        }
    }

    Ok(labels)
}

fn validate<V: AsRef<[f32]>>(vectors: &[V], eps: f32, min_samples: usize) -> Result<(), PeopleError> {
    if !eps.is_finite() || eps <= 0.0 || eps > 2.0 {
        return Err(PeopleError::Clustering(format!("eps must be in (0, 2], got {eps}")));
    }
    if min_samples == 0 {
        return Err(PeopleError::Clustering("min_samples must be positive".into()));
    }
    let Some(first) = vectors.first() else {
        return Ok(());
    };
    let dim = first.as_ref().len();
    for (i, v) in vectors.iter().enumerate() {
        let v = v.as_ref();
        if v.len() != dim {
            return Err(PeopleError::Clustering(format!(
                "vector {i} has dimension {}, expected {dim}",
                v.len()
            )));
        }
        if v.iter().any(|x| !x.is_finite()) {
            return Err(PeopleError::Clustering(format!("vector {i} has non-finite components")));
        }
    }
    Ok(())
}

/// Returns indices of all vectors within eps cosine distance of vectors[idx].
fn range_query<V: AsRef<[f32]>>(vectors: &[V], idx: usize, eps: f32) -> Vec<usize> {
    let q = vectors[idx].as_ref();
    vectors
        .iter()
        .enumerate()
        .filter(|(_, v)| unit_distance(q, v.as_ref()) <= eps)
        .map(|(i, _)| i)
        .collect()
}
