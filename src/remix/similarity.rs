use faer::{Mat, Side};
use ndarray::{s, Array1, Array2, ArrayView1, ArrayView2, Axis, Zip};

use crate::audio::BeatFeatures;
use crate::error::{RemixError, Result};

/// Beats closer than this never link in the recurrence matrix.
pub const RECURRENCE_WIDTH: usize = 3;
/// Diagonal smoothing window for the recurrence matrix.
pub const LAG_FILTER_SIZE: usize = 7;
/// Beat-axis smoothing window for eigenvectors.
pub const EIGENVECTOR_FILTER_SIZE: usize = 9;

/// Laplacian eigenvectors (ascending eigenvalue order), one row per beat,
/// plus their row-wise cumulative norms.
#[derive(Clone, Debug)]
pub struct SpectralEmbedding {
    pub eigenvalues: Array1<f64>,
    pub evecs: Array2<f64>,
    pub cnorm: Array2<f64>,
}

impl SpectralEmbedding {
    pub fn len(&self) -> usize {
        self.evecs.nrows()
    }

    pub fn is_empty(&self) -> bool {
        self.evecs.is_empty()
    }

    /// First `k` eigenvector components of every beat, scaled by the
    /// cumulative norm of those components.
    pub fn features(&self, k: usize) -> Array2<f64> {
        let k = k.max(1).min(self.evecs.ncols());
        let mut x = self.evecs.slice(s![.., ..k]).to_owned();
        if k == 0 {
            return x;
        }
        for (mut row, &norm) in x.rows_mut().into_iter().zip(self.cnorm.column(k - 1)) {
            if norm > 0.0 {
                row /= norm;
            } else {
                row.fill(0.0);
            }
        }
        x
    }
}

pub fn build_embedding(features: &BeatFeatures) -> Result<SpectralEmbedding> {
    features.validate()?;

    log::info!("Building recurrence matrix over {} beats", features.len());
    let recurrence = recurrence_affinity(features.chroma.view(), RECURRENCE_WIDTH);
    let filtered = timelag_median_filter(recurrence.view(), LAG_FILTER_SIZE);

    let path = path_affinity(features.mfcc.view());
    let (mu, combined) = balance(filtered.view(), path.view());
    log::debug!("Recurrence/path balance mu = {:.4}", mu);

    let laplacian = normalized_laplacian(combined.view());
    spectral_embedding(laplacian.view())
}

/// Symmetric k-nearest-neighbour recurrence affinity between the rows of
/// `columns`.
///
/// A link between beats `i` and `j` survives only if each is among the
/// other's nearest neighbours and `|i - j| >= width`. Surviving links carry
/// `exp(-d / bandwidth)`, with the bandwidth taken as the median distance to
/// each beat's farthest kept neighbour.
pub fn recurrence_affinity(columns: ArrayView2<f32>, width: usize) -> Array2<f64> {
    let n = columns.nrows();
    if n == 0 {
        return Array2::zeros((0, 0));
    }

    let mut distances = Array2::<f64>::zeros((n, n));
    Zip::indexed(&mut distances).par_for_each(|(i, j), d| {
        *d = euclidean(columns.row(i), columns.row(j));
    });

    let base = (n as isize - 2 * width as isize + 1).max(1) as f64;
    let k = 2 * base.sqrt().ceil() as usize;

    let mut neighbours = Array2::from_elem((n, n), false);
    for (i, mut row) in neighbours.rows_mut().into_iter().enumerate() {
        let mut eligible: Vec<usize> = (0..n).filter(|&j| i.abs_diff(j) >= width).collect();
        eligible.sort_by(|&a, &b| distances[[i, a]].total_cmp(&distances[[i, b]]));
        for &j in eligible.iter().take(k) {
            row[j] = true;
        }
    }
    let linked = Zip::from(&neighbours)
        .and(neighbours.t())
        .map_collect(|&ij, &ji| ij && ji);

    let mut row_max: Vec<f64> = distances
        .rows()
        .into_iter()
        .zip(linked.rows())
        .filter_map(|(dist, links)| {
            dist.iter()
                .zip(links)
                .filter(|&(_, &l)| l)
                .map(|(&d, _)| d)
                .max_by(|a, b| a.total_cmp(b))
        })
        .collect();
    let bandwidth = median_f64(&mut row_max);

    Zip::from(&distances).and(&linked).map_collect(|&d, &l| match (l, bandwidth > 0.0) {
        (false, _) => 0.0,
        (true, true) => (-d / bandwidth).exp(),
        (true, false) => 1.0,
    })
}

/// Median filter along each diagonal (time-lag axis) of a recurrence
/// matrix. Isolated links are suppressed while repeated stretches, which
/// show up as diagonal stripes, survive. The result is symmetrized.
pub fn timelag_median_filter(rec: ArrayView2<f64>, size: usize) -> Array2<f64> {
    let n = rec.nrows();
    let mut out = Array2::<f64>::zeros((n, n));

    for offset in 0..n {
        // below the main diagonal: rec[offset + i, i], zero-padded at the end
        let lower = filter_diagonal(rec.slice(s![offset.., ..]).diag(), n, 0..n - offset, size);
        out.slice_mut(s![offset.., ..]).diag_mut().assign(&lower);
        if offset > 0 {
            // above: rec[i, offset + i], zero-padded at the start
            let upper = filter_diagonal(rec.slice(s![.., offset..]).diag(), n, offset..n, size);
            out.slice_mut(s![.., offset..]).diag_mut().assign(&upper);
        }
    }

    (&out + &out.t()) * 0.5
}

fn filter_diagonal(diag: ArrayView1<f64>, n: usize, span: std::ops::Range<usize>, size: usize) -> Array1<f64> {
    let mut series = Array1::zeros(n);
    series.slice_mut(s![span.clone()]).assign(&diag);
    median_filter_1d(series.view(), size).slice(s![span]).to_owned()
}

/// Gaussian-kernel affinity between temporally adjacent beats only, scaled
/// by the median squared step.
pub fn path_affinity(columns: ArrayView2<f32>) -> Array2<f64> {
    let n = columns.nrows();
    let mut path = Array2::zeros((n, n));
    if n < 2 {
        return path;
    }

    let steps: Vec<f64> = (1..n)
        .map(|i| euclidean(columns.row(i - 1), columns.row(i)).powi(2))
        .collect();
    let sigma = median_f64(&mut steps.clone());

    for (i, d) in steps.iter().enumerate() {
        let weight = if sigma > 0.0 { (-d / sigma).exp() } else { 1.0 };
        path[[i, i + 1]] = weight;
        path[[i + 1, i]] = weight;
    }
    path
}

/// Combine recurrence and path affinities as `mu * rec + (1 - mu) * path`,
/// where `mu` balances the two by degree.
pub fn balance(rec: ArrayView2<f64>, path: ArrayView2<f64>) -> (f64, Array2<f64>) {
    let deg_rec = rec.sum_axis(Axis(1));
    let deg_path = path.sum_axis(Axis(1));
    let deg_total = &deg_path + &deg_rec;

    let denominator = deg_total.dot(&deg_total);
    let mu = if denominator > 0.0 {
        deg_path.dot(&deg_total) / denominator
    } else {
        0.5
    };

    (mu, &rec * mu + &path * (1.0 - mu))
}

/// `I - D^-1/2 A D^-1/2`, ignoring self-loops. Isolated beats get an
/// all-zero row.
pub fn normalized_laplacian(affinity: ArrayView2<f64>) -> Array2<f64> {
    let n = affinity.nrows();
    let degree = affinity.sum_axis(Axis(1)) - &affinity.diag();
    let scale = degree.mapv(|d| if d > 0.0 { d.sqrt().recip() } else { 0.0 });

    Array2::from_shape_fn((n, n), |(i, j)| {
        if i == j {
            if degree[i] > 0.0 { 1.0 } else { 0.0 }
        } else {
            -affinity[[i, j]] * scale[i] * scale[j]
        }
    })
}

/// Eigendecomposition of a symmetric Laplacian, followed by beat-axis
/// median smoothing and cumulative normalization of the eigenvectors.
pub fn spectral_embedding(laplacian: ArrayView2<f64>) -> Result<SpectralEmbedding> {
    let n = laplacian.nrows();
    if n == 0 {
        return Err(RemixError::TooFewBeats { found: 0 });
    }

    let mat = Mat::<f64>::from_fn(n, n, |i, j| laplacian[[i, j]]);
    let evd = mat.selfadjoint_eigendecomposition(Side::Lower);
    let u = evd.u();
    let s = evd.s().column_vector();

    let eigenvalues = Array1::from_shape_fn(n, |i| s.read(i));
    if eigenvalues.iter().any(|v| !v.is_finite()) {
        return Err(RemixError::Internal("Laplacian eigendecomposition diverged".into()));
    }
    let raw = Array2::from_shape_fn((n, n), |(i, j)| u.read(i, j));

    let mut evecs = Array2::<f64>::zeros((n, n));
    for (mut smoothed, column) in evecs.columns_mut().into_iter().zip(raw.columns()) {
        smoothed.assign(&median_filter_1d(column, EIGENVECTOR_FILTER_SIZE));
    }

    let mut cnorm = evecs.mapv(|v| v * v);
    cnorm.accumulate_axis_inplace(Axis(1), |&prev, cur| *cur += prev);
    cnorm.mapv_inplace(f64::sqrt);

    Ok(SpectralEmbedding {
        eigenvalues,
        evecs,
        cnorm,
    })
}

// half-sample symmetric reflection at the edges
pub fn median_filter_1d(values: ArrayView1<f64>, size: usize) -> Array1<f64> {
    let n = values.len();
    if n == 0 || size <= 1 {
        return values.to_owned();
    }
    let half = (size / 2) as isize;
    let mut window = Vec::with_capacity(size);
    Array1::from_shape_fn(n, |i| {
        window.clear();
        for offset in -half..=half {
            window.push(values[reflect(i as isize + offset, n)]);
        }
        window.sort_by(|a, b| a.total_cmp(b));
        window[window.len() / 2]
    })
}

fn reflect(mut idx: isize, n: usize) -> usize {
    let n = n as isize;
    loop {
        if idx < 0 {
            idx = -idx - 1;
        } else if idx >= n {
            idx = 2 * n - idx - 1;
        } else {
            return idx as usize;
        }
    }
}

fn euclidean(a: ArrayView1<f32>, b: ArrayView1<f32>) -> f64 {
    Zip::from(a)
        .and(b)
        .fold(0.0f64, |acc, &x, &y| acc + (x as f64 - y as f64).powi(2))
        .sqrt()
}

pub(crate) fn median_f64(values: &mut [f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.sort_by(|a, b| a.total_cmp(b));
    let mid = values.len() / 2;
    if values.len() % 2 == 0 {
        0.5 * (values[mid - 1] + values[mid])
    } else {
        values[mid]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    /// Four distinct harmonic "chords" repeated in order.
    fn repeating_columns(repeats: usize) -> Array2<f32> {
        Array2::from_shape_fn((repeats * 4, 4), |(i, d)| {
            let jitter = 0.01 * (i / 4) as f32;
            let on = if d == i % 4 { 1.0 } else { 0.0 };
            on + jitter
        })
    }

    #[test]
    fn recurrence_skips_near_diagonal_and_is_symmetric() {
        let rec = recurrence_affinity(repeating_columns(6).view(), RECURRENCE_WIDTH);
        assert_eq!(rec, rec.t());
        for ((i, j), &v) in rec.indexed_iter() {
            assert!((0.0..=1.0).contains(&v));
            if i.abs_diff(j) < RECURRENCE_WIDTH {
                assert_eq!(v, 0.0);
            }
        }
    }

    #[test]
    fn recurrence_links_repeated_chords() {
        let rec = recurrence_affinity(repeating_columns(6).view(), RECURRENCE_WIDTH);
        // beat 8 repeats the chord of beats 4 and 12
        assert!(rec[[8, 4]] > 0.9);
        assert!(rec[[8, 12]] > 0.9);
        assert!(rec[[8, 4]] > rec[[8, 13]]);
    }

    #[test]
    fn lag_filter_keeps_stripes_and_drops_isolated_links() {
        let n = 20;
        let mut rec = Array2::zeros((n, n));
        for i in 0..n - 5 {
            rec[[i, i + 5]] = 1.0;
            rec[[i + 5, i]] = 1.0;
        }
        rec[[15, 2]] = 1.0;
        rec[[2, 15]] = 1.0;

        let filtered = timelag_median_filter(rec.view(), LAG_FILTER_SIZE);
        assert_eq!(filtered[[7, 12]], 1.0);
        assert_eq!(filtered[[12, 7]], 1.0);
        assert_eq!(filtered[[15, 2]], 0.0);
    }

    #[test]
    fn path_affinity_is_tridiagonal() {
        let columns = array![[0.0f32], [1.0], [1.0], [3.0]];
        let path = path_affinity(columns.view());
        assert_eq!(path[[0, 2]], 0.0);
        assert_eq!(path[[1, 2]], 1.0);
        assert_eq!(path[[0, 1]], path[[1, 0]]);
        // squared steps 1, 0, 4 -> sigma 1
        assert!((path[[0, 1]] - (-1.0f64).exp()).abs() < 1e-12);
        assert!((path[[2, 3]] - (-4.0f64).exp()).abs() < 1e-12);
    }

    #[test]
    fn balance_weights_by_degree() {
        let rec = array![[0.0, 1.0], [1.0, 0.0]];
        let path = array![[0.0, 1.0], [1.0, 0.0]];
        let (mu, combined) = balance(rec.view(), path.view());
        assert!((mu - 0.5).abs() < 1e-12);
        assert!((combined[[0, 1]] - 1.0).abs() < 1e-12);
    }

    #[test]
    fn balance_leans_towards_the_denser_graph() {
        // path degree 1 per beat, recurrence degree 3: mu = 1*4 / 4^2
        let rec = Array2::<f64>::from_elem((4, 4), 1.0) - Array2::<f64>::eye(4);
        let path = array![
            [0.0, 1.0, 0.0, 0.0],
            [1.0, 0.0, 0.0, 0.0],
            [0.0, 0.0, 0.0, 1.0],
            [0.0, 0.0, 1.0, 0.0]
        ];
        let (mu, _) = balance(rec.view(), path.view());
        assert!((mu - 0.25).abs() < 1e-12);
    }

    #[test]
    fn laplacian_of_a_pair_and_an_isolated_beat() {
        let affinity = array![[5.0, 2.0, 0.0], [2.0, 0.0, 0.0], [0.0, 0.0, 0.0]];
        let lap = normalized_laplacian(affinity.view());
        assert_eq!(lap.diag(), array![1.0, 1.0, 0.0]);
        assert!((lap[[0, 1]] + 1.0).abs() < 1e-12);
        assert_eq!(lap.row(2), array![0.0, 0.0, 0.0]);
    }

    #[test]
    fn median_filter_reflects_at_edges() {
        let out = median_filter_1d(array![5.0, 1.0, 1.0, 9.0, 1.0].view(), 3);
        assert_eq!(out, array![5.0, 1.0, 1.0, 1.0, 1.0]);
    }

    #[test]
    fn disconnected_blocks_give_two_null_eigenvalues() {
        let n = 12;
        let affinity = Array2::from_shape_fn((n, n), |(i, j)| {
            if i != j && (i < 6) == (j < 6) { 1.0 } else { 0.0 }
        });
        let embedding = spectral_embedding(normalized_laplacian(affinity.view()).view()).unwrap();
        assert!(embedding.eigenvalues[0].abs() < 1e-9);
        assert!(embedding.eigenvalues[1].abs() < 1e-9);
        assert!(embedding.eigenvalues[2] > 0.5);

        let features = embedding.features(2);
        assert_eq!(features.dim(), (n, 2));
        for row in features.rows() {
            assert!((row.dot(&row).sqrt() - 1.0).abs() < 1e-6);
        }
    }

    #[test]
    fn build_embedding_over_repeating_features() {
        let chroma = repeating_columns(8);
        let n = chroma.nrows();
        let features = BeatFeatures {
            beat_times: (0..n).map(|i| i as f32 * 0.5).collect(),
            tempo: 120.0,
            mfcc: chroma.clone(),
            chroma,
            amplitude: vec![0.5; n],
        };
        let embedding = build_embedding(&features).unwrap();
        assert_eq!(embedding.len(), n);
        assert_eq!(embedding.cnorm.ncols(), n);
        for row in embedding.cnorm.rows() {
            assert!(row.iter().all(|v| v.is_finite()));
            assert!(row.windows(2).into_iter().all(|w| w[1] >= w[0]));
        }
        assert!(embedding.eigenvalues.windows(2).into_iter().all(|w| w[1] >= w[0] - 1e-9));
    }
}
