//! Seeded k-means used to extract several representative centers per person.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// Fixed seed so repeated passes derive identical representatives.
pub(crate) const KMEANS_SEED: u64 = 42;

const MAX_ITERATIONS: usize = 50;

fn squared_euclidean(a: &[f32], b: &[f32]) -> f64 {
    a.iter()
        .zip(b)
        .map(|(&x, &y)| {
            let d = (x - y) as f64;
            d * d
        })
        .sum()
}

fn nearest(centers: &[Vec<f32>], v: &[f32]) -> usize {
    let mut best = 0;
    let mut best_d = f64::MAX;
    for (i, c) in centers.iter().enumerate() {
        let d = squared_euclidean(c, v);
        if d < best_d {
            best_d = d;
            best = i;
        }
    }
    best
}

/// Picks the first center at random from `seed`, then repeatedly takes the
/// point farthest from all chosen centers.
fn init_centers<V: AsRef<[f32]>>(vectors: &[V], k: usize, seed: u64) -> Vec<Vec<f32>> {
    let mut rng = StdRng::seed_from_u64(seed);
    let first = rng.gen_range(0..vectors.len());
    let mut centers = vec![vectors[first].as_ref().to_vec()];

    let mut min_dist: Vec<f64> = vectors
        .iter()
        .map(|v| squared_euclidean(v.as_ref(), &centers[0]))
        .collect();

    while centers.len() < k {
        let (far_idx, far_d) = min_dist
            .iter()
            .copied()
            .enumerate()
            .fold((0, -1.0), |best, (i, d)| if d > best.1 { (i, d) } else { best });
        if far_d <= 0.0 {
            // Every remaining point coincides with a chosen center.
            break;
        }
        let c = vectors[far_idx].as_ref().to_vec();
        for (d, v) in min_dist.iter_mut().zip(vectors) {
            *d = d.min(squared_euclidean(v.as_ref(), &c));
        }
        centers.push(c);
    }
    centers
}

/// Lloyd's k-means under squared Euclidean distance.
///
/// Returns `None` when the input cannot be partitioned into `k` groups
/// (too few points, mixed dimensions, `k == 0`). May return fewer than `k`
/// centers when the data holds fewer distinct points.
pub(crate) fn kmeans<V: AsRef<[f32]>>(vectors: &[V], k: usize, seed: u64) -> Option<Vec<Vec<f32>>> {
    let n = vectors.len();
    if k == 0 || n < k {
        return None;
    }
    let dim = vectors[0].as_ref().len();
    if dim == 0 || vectors.iter().any(|v| v.as_ref().len() != dim) {
        return None;
    }

    let mut centers = init_centers(vectors, k, seed);
    let mut assignment = vec![usize::MAX; n];

    for _ in 0..MAX_ITERATIONS {
        let mut changed = false;
        for (a, v) in assignment.iter_mut().zip(vectors) {
            let c = nearest(&centers, v.as_ref());
            if *a != c {
                *a = c;
                changed = true;
            }
        }
        if !changed {
            break;
        }

        let mut sums = vec![vec![0.0f64; dim]; centers.len()];
        let mut counts = vec![0usize; centers.len()];
        for (&a, v) in assignment.iter().zip(vectors) {
            counts[a] += 1;
            for (s, &x) in sums[a].iter_mut().zip(v.as_ref()) {
                *s += x as f64;
            }
        }
        for ((center, sum), &count) in centers.iter_mut().zip(sums).zip(&counts) {
            // An emptied cluster keeps its previous center.
            if count > 0 {
                let n = count as f64;
                *center = sum.into_iter().map(|s| (s / n) as f32).collect();
            }
        }
    }

    Some(centers)
}
