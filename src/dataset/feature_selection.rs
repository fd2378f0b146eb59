//! Feature scoring (mutual information, model importances) and selection

use kiddo::{KdTree, SquaredEuclidean};
use ndarray::{Array1, Array2, ArrayView1};
use std::fmt;
use std::str::FromStr;
use tracing::info;

use crate::data::utils::{mean, quantile};
use crate::error::{PipelineError, Result};
use crate::model::FeatureImportance;

const EULER_GAMMA: f64 = 0.577_215_664_901_532_9;

/// Digamma values ψ(1..=n), from ψ(m + 1) = ψ(m) + 1/m
fn digamma_table(n: usize) -> Vec<f64> {
    let mut table = Vec::with_capacity(n + 1);
    table.push(f64::NAN);
    let mut value = -EULER_GAMMA;
    for m in 1..=n {
        table.push(value);
        value += 1.0 / m as f64;
    }
    table
}

/// Relative amplitude of the jitter separating tied values
const JITTER_SCALE: f64 = 1e-10;

/// Deterministic value in [0, 1) for index `i` (splitmix64)
fn unit_noise(i: usize, stream: u64) -> f64 {
    let mut z = (i as u64)
        .wrapping_add(stream.wrapping_mul(0x9e37_79b9_7f4a_7c15))
        .wrapping_add(0x9e37_79b9_7f4a_7c15);
    z = (z ^ (z >> 30)).wrapping_mul(0xbf58_476d_1ce4_e5b9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94d0_49bb_1331_11eb);
    z ^= z >> 31;
    (z >> 11) as f64 / (1u64 << 53) as f64
}

/// Values scaled to unit variance, plus a tiny jitter so that indicator
/// columns do not stack thousands of points on one coordinate
fn standardized(values: ArrayView1<f64>, stream: u64) -> Vec<f64> {
    let n = values.len() as f64;
    let avg = values.sum() / n;
    let std = (values.iter().map(|v| (v - avg).powi(2)).sum::<f64>() / n).sqrt();
    let scaled: Vec<f64> = if std > 0.0 {
        values.iter().map(|v| v / std).collect()
    } else {
        values.to_vec()
    };
    let amplitude = JITTER_SCALE * scaled.iter().map(|v| v.abs()).sum::<f64>().max(n) / n;
    scaled
        .iter()
        .enumerate()
        .map(|(i, v)| v + amplitude * unit_noise(i, stream))
        .collect()
}

fn chebyshev(a: &[f64; 2], b: &[f64; 2]) -> f64 {
    (a[0] - b[0]).abs().max((a[1] - b[1]).abs())
}

/// Distance from each point to its k-th nearest neighbour in the max norm,
/// the point itself excluded.
///
/// The tree answers Euclidean queries: the k Euclidean neighbours bound the
/// max-norm radius from above, and every point within that max-norm radius
/// lies within √2 times it in the Euclidean norm.
fn kth_chebyshev_distances(points: &[[f64; 2]], k: usize) -> Vec<f64> {
    let mut tree: KdTree<f64, 2> = KdTree::new();
    for (i, p) in points.iter().enumerate() {
        tree.add(p, i as u64);
    }

    let mut distances = Vec::with_capacity(points.len());
    let mut candidates = Vec::new();
    for (i, p) in points.iter().enumerate() {
        candidates.clear();
        candidates.extend(
            tree.nearest_n::<SquaredEuclidean>(p, k + 1)
                .into_iter()
                .filter(|nb| nb.item as usize != i)
                .take(k)
                .map(|nb| chebyshev(p, &points[nb.item as usize])),
        );
        let bound = candidates.iter().copied().fold(0.0, f64::max);

        let radius = 2.0 * bound * bound * (1.0 + 1e-9) + f64::MIN_POSITIVE;
        candidates.clear();
        candidates.extend(
            tree.within_unsorted::<SquaredEuclidean>(p, radius)
                .into_iter()
                .filter(|nb| nb.item as usize != i)
                .map(|nb| chebyshev(p, &points[nb.item as usize])),
        );
        let kth = if candidates.len() >= k {
            let (_, d, _) = candidates.select_nth_unstable_by(k - 1, |a, b| a.total_cmp(b));
            *d
        } else {
            bound
        };
        distances.push(kth);
    }
    distances
}

/// Points of `sorted` strictly closer than `radius` to `center`; exact
/// duplicates when the radius is zero
fn count_within(sorted: &[f64], center: f64, radius: f64) -> usize {
    if radius > 0.0 {
        let lo = sorted.partition_point(|v| *v <= center - radius);
        let hi = sorted.partition_point(|v| *v < center + radius);
        hi - lo
    } else {
        let lo = sorted.partition_point(|v| *v < center);
        let hi = sorted.partition_point(|v| *v <= center);
        hi - lo
    }
}

/// Kraskov-Stögbauer-Grassberger estimate of I(x; y) in nats, clipped at 0
fn ksg_mutual_info(x: ArrayView1<f64>, y: ArrayView1<f64>, n_neighbors: usize) -> f64 {
    let n = x.len();
    if n_neighbors == 0 || n <= n_neighbors {
        return 0.0;
    }
    let xs = standardized(x, 0);
    let ys = standardized(y, 1);

    let mut sorted_x = xs.clone();
    sorted_x.sort_by(|a, b| a.total_cmp(b));
    let mut sorted_y = ys.clone();
    sorted_y.sort_by(|a, b| a.total_cmp(b));

    let points: Vec<[f64; 2]> = xs.iter().zip(&ys).map(|(x, y)| [*x, *y]).collect();
    let radii = kth_chebyshev_distances(&points, n_neighbors);

    let psi = digamma_table(n + 1);
    let mut sum_psi = 0.0;
    for (i, radius) in radii.into_iter().enumerate() {
        // counts exclude the point itself
        let nx = count_within(&sorted_x, xs[i], radius).saturating_sub(1);
        let ny = count_within(&sorted_y, ys[i], radius).saturating_sub(1);
        sum_psi += psi[nx + 1] + psi[ny + 1];
    }

    let mi = psi[n] + psi[n_neighbors] - sum_psi / n as f64;
    mi.max(0.0)
}

fn sort_descending(mut scores: Vec<(String, f64)>) -> Vec<(String, f64)> {
    scores.sort_by(|a, b| b.1.total_cmp(&a.1));
    scores
}

fn check_names(x: &Array2<f64>, y: &Array1<f64>, feature_names: &[String]) -> Result<()> {
    if x.ncols() != feature_names.len() || x.nrows() != y.len() {
        return Err(PipelineError::Shape(format!(
            "{}x{} features, {} targets, {} names",
            x.nrows(),
            x.ncols(),
            y.len(),
            feature_names.len()
        )));
    }
    Ok(())
}

/// Mutual information between each feature and the target, descending
pub fn compute_mutual_info(
    x: &Array2<f64>,
    y: &Array1<f64>,
    feature_names: &[String],
    n_neighbors: usize,
) -> Result<Vec<(String, f64)>> {
    check_names(x, y, feature_names)?;
    let scores = feature_names
        .iter()
        .enumerate()
        .map(|(j, name)| (name.clone(), ksg_mutual_info(x.column(j), y.view(), n_neighbors)))
        .collect();
    Ok(sort_descending(scores))
}

/// Importances reported by `estimator`, descending. An unfitted estimator
/// is fitted first and its training MAPE logged.
pub fn compute_importances<E: FeatureImportance + ?Sized>(
    x: &Array2<f64>,
    y: &Array1<f64>,
    feature_names: &[String],
    estimator: &mut E,
) -> Result<Vec<(String, f64)>> {
    check_names(x, y, feature_names)?;
    if !estimator.is_fitted() {
        estimator.fit(x, y)?;
        info!("{} fitted.", estimator.name());
        let metrics = estimator.score(x, y, false)?;
        info!("Train MAPE: {:.2}%", 100.0 * metrics.mape);
    }
    let importances = estimator.feature_importances()?;
    if importances.len() != feature_names.len() {
        return Err(PipelineError::Shape(format!(
            "{} importances for {} features",
            importances.len(),
            feature_names.len()
        )));
    }
    Ok(sort_descending(
        feature_names.iter().cloned().zip(importances).collect(),
    ))
}

/// Cut-off applied to feature scores
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Threshold {
    Mean,
    Quantile(f64),
    Value(f64),
}

const QUANTILE_KEYS: &[(&str, f64)] = &[
    ("25%", 0.25),
    ("50%", 0.5),
    ("75%", 0.75),
    ("90%", 0.9),
    ("95%", 0.95),
    ("99%", 0.99),
];

impl FromStr for Threshold {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        if s == "mean" {
            return Ok(Threshold::Mean);
        }
        if let Some((_, q)) = QUANTILE_KEYS.iter().find(|(k, _)| *k == s) {
            return Ok(Threshold::Quantile(*q));
        }
        s.parse::<f64>()
            .ok()
            .filter(|v| v.is_finite())
            .map(Threshold::Value)
            .ok_or_else(|| PipelineError::InvalidThreshold(s.to_string()))
    }
}

impl fmt::Display for Threshold {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Threshold::Mean => f.write_str("mean"),
            Threshold::Quantile(q) => write!(f, "{}%", q * 100.0),
            Threshold::Value(v) => write!(f, "{}", v),
        }
    }
}

impl Threshold {
    /// Numeric cut-off for `scores`
    pub fn resolve(&self, scores: &[f64]) -> Option<f64> {
        match self {
            Threshold::Mean => mean(scores),
            Threshold::Quantile(q) => quantile(scores, *q),
            Threshold::Value(v) => Some(*v),
        }
    }
}

/// Names whose score is strictly greater than the threshold
pub fn select_above_threshold(scores: &[(String, f64)], threshold: &Threshold) -> Vec<String> {
    let values: Vec<f64> = scores.iter().map(|(_, v)| *v).collect();
    let Some(cut) = threshold.resolve(&values) else {
        return Vec::new();
    };
    let selected: Vec<String> = scores
        .iter()
        .filter(|(_, v)| *v > cut)
        .map(|(n, _)| n.clone())
        .collect();
    info!(
        "{} of {} features above threshold {} ({:.4})",
        selected.len(),
        scores.len(),
        threshold,
        cut
    );
    selected
}
