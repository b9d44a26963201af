use ndarray::{Array2, ArrayView1, ArrayView2, Zip};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rayon::prelude::*;
use std::ops::RangeInclusive;

use super::similarity::SpectralEmbedding;

/// Segment-to-cluster ratio that sounds best: each cluster recurs in about
/// four separate places in the song.
pub const TARGET_SEGMENT_RATIO: f64 = 4.0;
pub const DEFAULT_CLUSTER_RANGE: RangeInclusive<usize> = 4..=50;

const FIXED_MAX_ITER: usize = 300;
const SCAN_MAX_ITER: usize = 1000;
const N_INIT: usize = 10;

/// Outcome of clustering: the chosen count and one label per beat.
#[derive(Clone, Debug)]
pub struct ClusterSelection {
    pub clusters: usize,
    pub labels: Vec<usize>,
    pub segment_ratio: f64,
}

/// Cluster the embedding. `requested == 0` scans `range` and picks a count
/// automatically; anything else is used as-is (clamped to the beat count).
pub fn select_clusters(
    embedding: &SpectralEmbedding,
    requested: usize,
    range: RangeInclusive<usize>,
    seed: u64,
) -> ClusterSelection {
    let n = embedding.len();

    if requested > 0 {
        let k = requested.min(n).max(1);
        let mut rng = StdRng::seed_from_u64(seed);
        let labels = kmeans(embedding.features(k).view(), k, N_INIT, FIXED_MAX_ITER, &mut rng);
        let segment_ratio = segment_ratio(&labels, k);
        return ClusterSelection {
            clusters: k,
            labels,
            segment_ratio,
        };
    }

    let hi = (*range.end()).min(n).max(1);
    let lo = (*range.start()).clamp(1, hi);
    log::info!("Scanning cluster counts {}..={}", lo, hi);

    let mut candidates: Vec<ClusterSelection> = (lo..=hi)
        .into_par_iter()
        .map(|k| {
            let mut rng = StdRng::seed_from_u64(seed ^ (k as u64).wrapping_mul(0x9E37_79B9_7F4A_7C15));
            let labels = kmeans(embedding.features(k).view(), k, N_INIT, SCAN_MAX_ITER, &mut rng);
            let segment_ratio = segment_ratio(&labels, k);
            log::debug!("k={:>2}: segment ratio {:.3}", k, segment_ratio);
            ClusterSelection {
                clusters: k,
                labels,
                segment_ratio,
            }
        })
        .collect();

    let scores: Vec<(usize, f64)> = candidates.iter().map(|c| (c.clusters, c.segment_ratio)).collect();
    let chosen = choose_cluster_count(&scores).unwrap_or(lo);

    let idx = candidates
        .iter()
        .position(|c| c.clusters == chosen)
        .unwrap_or(0);
    candidates.swap_remove(idx)
}

/// Largest cluster count whose ratio reaches `min(best ratio, 4)`.
///
/// When no count gets near the target the best available ratio becomes the
/// bar, so the scan always produces an answer.
pub fn choose_cluster_count(scores: &[(usize, f64)]) -> Option<usize> {
    let best = scores
        .iter()
        .map(|&(_, ratio)| ratio)
        .max_by(|a, b| a.total_cmp(b))?;

    if best < TARGET_SEGMENT_RATIO {
        log::warn!(
            "No cluster count reached segment ratio {:.1} (best {:.2}); using best available",
            TARGET_SEGMENT_RATIO,
            best
        );
    }

    let bar = best.min(TARGET_SEGMENT_RATIO) - 1e-9;
    scores
        .iter()
        .filter(|&&(_, ratio)| ratio >= bar)
        .map(|&(k, _)| k)
        .max()
}

pub fn segment_ratio(labels: &[usize], k: usize) -> f64 {
    if k == 0 {
        return 0.0;
    }
    let mut segs = vec![0usize; k];
    let mut last: Option<usize> = None;
    for &label in labels {
        if last != Some(label) {
            if let Some(count) = segs.get_mut(label) {
                *count += 1;
            }
            last = Some(label);
        }
    }
    segs.iter().sum::<usize>() as f64 / k as f64
}

/// k-means with k-means++ seeding over the rows of `points`; the best of
/// `n_init` restarts by inertia.
pub fn kmeans(points: ArrayView2<f64>, k: usize, n_init: usize, max_iter: usize, rng: &mut StdRng) -> Vec<usize> {
    let n = points.nrows();
    if n == 0 || k == 0 {
        return Vec::new();
    }
    let k = k.min(n);

    let mut best: Option<(f64, Vec<usize>)> = None;
    for _ in 0..n_init.max(1) {
        let mut centers = seed_centers(points, k, rng);
        let (labels, inertia) = lloyd(points, &mut centers, max_iter);
        if best.as_ref().map_or(true, |(b, _)| inertia < *b) {
            best = Some((inertia, labels));
        }
    }
    best.map(|(_, labels)| labels).unwrap_or_default()
}

fn seed_centers(points: ArrayView2<f64>, k: usize, rng: &mut StdRng) -> Array2<f64> {
    let n = points.nrows();
    let mut centers = Array2::zeros((k, points.ncols()));
    centers.row_mut(0).assign(&points.row(rng.gen_range(0..n)));

    let mut nearest: Vec<f64> = points.rows().into_iter().map(|p| sq_dist(p, centers.row(0))).collect();
    for c in 1..k {
        let total: f64 = nearest.iter().sum();
        let pick = if total > 0.0 {
            let mut target = rng.gen_range(0.0..total);
            nearest
                .iter()
                .position(|&d| {
                    target -= d;
                    target < 0.0
                })
                .unwrap_or(n - 1)
        } else {
            rng.gen_range(0..n)
        };
        let center = points.row(pick);
        centers.row_mut(c).assign(&center);
        for (d, p) in nearest.iter_mut().zip(points.rows()) {
            *d = d.min(sq_dist(p, center));
        }
    }
    centers
}

fn lloyd(points: ArrayView2<f64>, centers: &mut Array2<f64>, max_iter: usize) -> (Vec<usize>, f64) {
    let k = centers.nrows();
    let mut labels = vec![usize::MAX; points.nrows()];

    for _ in 0..max_iter.max(1) {
        let mut changed = false;
        for (label, p) in labels.iter_mut().zip(points.rows()) {
            let nearest = nearest_center(p, centers.view());
            if *label != nearest {
                *label = nearest;
                changed = true;
            }
        }
        if !changed {
            break;
        }

        let mut sums = Array2::<f64>::zeros(centers.raw_dim());
        let mut counts = vec![0usize; k];
        for (&label, p) in labels.iter().zip(points.rows()) {
            counts[label] += 1;
            let mut sum = sums.row_mut(label);
            sum += &p;
        }
        for c in 0..k {
            if counts[c] > 0 {
                centers.row_mut(c).assign(&(&sums.row(c) / counts[c] as f64));
            } else {
                // re-seed an empty cluster on the point farthest from its center
                let far = farthest_point(points, &labels, centers.view());
                centers.row_mut(c).assign(&points.row(far));
            }
        }
    }

    let inertia = labels
        .iter()
        .zip(points.rows())
        .map(|(&label, p)| sq_dist(p, centers.row(label)))
        .sum();
    (labels, inertia)
}

fn nearest_center(p: ArrayView1<f64>, centers: ArrayView2<f64>) -> usize {
    centers
        .rows()
        .into_iter()
        .enumerate()
        .map(|(i, c)| (i, sq_dist(p, c)))
        .min_by(|a, b| a.1.total_cmp(&b.1))
        .map(|(i, _)| i)
        .unwrap_or(0)
}

fn farthest_point(points: ArrayView2<f64>, labels: &[usize], centers: ArrayView2<f64>) -> usize {
    points
        .rows()
        .into_iter()
        .zip(labels)
        .enumerate()
        .map(|(i, (p, &label))| (i, sq_dist(p, centers.row(label))))
        .max_by(|a, b| a.1.total_cmp(&b.1))
        .map(|(i, _)| i)
        .unwrap_or(0)
}

fn sq_dist(a: ArrayView1<f64>, b: ArrayView1<f64>) -> f64 {
    Zip::from(a).and(b).fold(0.0, |acc, &x, &y| acc + (x - y).powi(2))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn segment_ratio_counts_runs_per_label() {
        // label 0 appears in 3 runs, label 1 in 2
        let labels = [0, 0, 1, 0, 1, 1, 0];
        assert!((segment_ratio(&labels, 2) - 2.5).abs() < 1e-12);
        // an unused label drags the average down
        assert!((segment_ratio(&labels, 3) - 5.0 / 3.0).abs() < 1e-12);
    }

    #[test]
    fn picks_the_only_count_reaching_target() {
        let scores: Vec<(usize, f64)> = (4..=10)
            .map(|k| (k, if k == 6 { 4.0 } else { 2.0 }))
            .collect();
        assert_eq!(choose_cluster_count(&scores), Some(6));
    }

    #[test]
    fn prefers_largest_count_at_or_above_target() {
        let scores = vec![(4, 6.0), (5, 4.5), (6, 4.0), (7, 3.9), (8, 4.2), (9, 1.0)];
        assert_eq!(choose_cluster_count(&scores), Some(8));
    }

    #[test]
    fn degrades_to_best_ratio_when_target_unreachable() {
        let scores = vec![(4, 1.5), (5, 2.5), (6, 2.5), (7, 1.0)];
        assert_eq!(choose_cluster_count(&scores), Some(6));
        assert_eq!(choose_cluster_count(&[]), None);
    }

    #[test]
    fn kmeans_separates_obvious_blobs() {
        // even rows near the origin, odd rows near (10, 10)
        let points = Array2::from_shape_fn((20, 2), |(i, d)| {
            let step = (i / 2) as f64 * 0.01;
            match (i % 2, d) {
                (0, 0) => step,
                (0, _) => 0.0,
                (_, 0) => 10.0,
                _ => 10.0 + step,
            }
        });
        let mut rng = StdRng::seed_from_u64(7);
        let labels = kmeans(points.view(), 2, 5, 100, &mut rng);
        for pair in labels.chunks(2) {
            assert_ne!(pair[0], pair[1]);
        }
        assert!(labels.iter().step_by(2).all(|&l| l == labels[0]));
    }

    #[test]
    fn kmeans_is_deterministic_for_a_seed() {
        let points = Array2::from_shape_fn((30, 2), |(i, d)| {
            if d == 0 { (i % 7) as f64 } else { (i % 3) as f64 * 2.0 }
        });
        let a = kmeans(points.view(), 4, 3, 50, &mut StdRng::seed_from_u64(11));
        let b = kmeans(points.view(), 4, 3, 50, &mut StdRng::seed_from_u64(11));
        assert_eq!(a, b);
    }

    #[test]
    fn fixed_count_is_used_directly() {
        let n = 16;
        let evecs = Array2::from_shape_fn((n, 4), |(i, d)| {
            let group = (i / 4) as f64;
            [1.0, group, (group * 1.3).sin(), 0.0][d]
        });
        let mut cnorm = evecs.mapv(|v| v * v);
        cnorm.accumulate_axis_inplace(ndarray::Axis(1), |&prev, cur| *cur += prev);
        cnorm.mapv_inplace(f64::sqrt);
        let embedding = SpectralEmbedding {
            eigenvalues: ndarray::Array1::zeros(4),
            evecs,
            cnorm,
        };
        let selection = select_clusters(&embedding, 3, DEFAULT_CLUSTER_RANGE, 1);
        assert_eq!(selection.clusters, 3);
        assert_eq!(selection.labels.len(), n);
        assert!(selection.labels.iter().all(|&l| l < 3));
    }
}
