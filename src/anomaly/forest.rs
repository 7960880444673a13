//! Isolation forest over feature vectors
//!
//! An ensemble of randomized partitioning trees: each tree recursively
//! splits a bootstrap sample on a random feature at a random cut point, so
//! outliers isolate in fewer splits and earn shorter average path lengths.
//! Scores follow the usual convention: `score_samples` is higher for normal
//! points, and the decision function subtracts a contamination-derived
//! offset so outliers land below zero.

use rand::rngs::StdRng;
use rand::seq::index;
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::config::AnomalyConfig;
use crate::features::{FeatureVector, NUM_FEATURES};

/// Euler-Mascheroni constant, for the average-path-length normalizer.
const EULER_GAMMA: f64 = 0.577_215_664_901_532_9;

#[derive(Debug, Clone, Serialize, Deserialize)]
enum IsoNode {
    Leaf {
        size: usize,
    },
    Split {
        feature: usize,
        threshold: f64,
        left: Box<IsoNode>,
        right: Box<IsoNode>,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct IsoTree {
    root: IsoNode,
}

impl IsoTree {
    fn path_length(&self, x: &FeatureVector) -> f64 {
        let mut node = &self.root;
        let mut depth = 0.0;
        loop {
            match node {
                IsoNode::Leaf { size } => return depth + average_path_length(*size),
                IsoNode::Split {
                    feature,
                    threshold,
                    left,
                    right,
                } => {
                    node = if x[*feature] <= *threshold { left } else { right };
                    depth += 1.0;
                }
            }
        }
    }
}

/// Expected path length of an unsuccessful BST search over `n` points.
fn average_path_length(n: usize) -> f64 {
    match n {
        0 | 1 => 0.0,
        2 => 1.0,
        _ => {
            let n = n as f64;
            2.0 * ((n - 1.0).ln() + EULER_GAMMA) - 2.0 * (n - 1.0) / n
        }
    }
}

fn build_tree(
    rows: &[FeatureVector],
    features: &[usize],
    depth: usize,
    depth_cap: usize,
    rng: &mut StdRng,
) -> IsoNode {
    if rows.len() <= 1 || depth >= depth_cap {
        return IsoNode::Leaf { size: rows.len() };
    }

    // A random feature with spread; give up after a few constant draws.
    for _ in 0..features.len().max(1) {
        let feature = features[rng.gen_range(0..features.len())];
        let (mut lo, mut hi) = (f64::INFINITY, f64::NEG_INFINITY);
        for row in rows {
            lo = lo.min(row[feature]);
            hi = hi.max(row[feature]);
        }
        if hi - lo <= f64::EPSILON {
            continue;
        }

        let threshold = lo + rng.gen::<f64>() * (hi - lo);
        let (left, right): (Vec<FeatureVector>, Vec<FeatureVector>) =
            rows.iter().copied().partition(|r| r[feature] <= threshold);
        if left.is_empty() || right.is_empty() {
            return IsoNode::Leaf { size: rows.len() };
        }
        return IsoNode::Split {
            feature,
            threshold,
            left: Box::new(build_tree(&left, features, depth + 1, depth_cap, rng)),
            right: Box::new(build_tree(&right, features, depth + 1, depth_cap, rng)),
        };
    }
    IsoNode::Leaf { size: rows.len() }
}

/// A fitted isolation forest.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IsolationForest {
    trees: Vec<IsoTree>,
    sample_size: usize,
    /// Contamination-quantile offset over the training scores.
    offset: f64,
}

impl IsolationForest {
    /// Fit on the pooled vectors.
    pub fn fit(data: &[FeatureVector], cfg: &AnomalyConfig, rng: &mut StdRng) -> Self {
        let n = data.len();
        if n == 0 {
            return Self {
                trees: Vec::new(),
                sample_size: 0,
                offset: -0.5,
            };
        }
        let sample_size = cfg.max_samples.min(n).max(1);
        let depth_cap = (sample_size as f64).log2().ceil().max(1.0) as usize;
        let n_features = (((NUM_FEATURES as f64) * cfg.max_features).round() as usize)
            .clamp(1, NUM_FEATURES);

        let mut trees = Vec::with_capacity(cfg.n_estimators);
        for _ in 0..cfg.n_estimators {
            let rows: Vec<FeatureVector> = if cfg.bootstrap {
                (0..sample_size).map(|_| data[rng.gen_range(0..n)]).collect()
            } else {
                index::sample(rng, n, sample_size)
                    .into_iter()
                    .map(|i| data[i])
                    .collect()
            };
            let features = index::sample(rng, NUM_FEATURES, n_features).into_vec();
            trees.push(IsoTree {
                root: build_tree(&rows, &features, 0, depth_cap, rng),
            });
        }

        let mut forest = Self {
            trees,
            sample_size,
            offset: 0.0,
        };

        // Offset at the contamination quantile of the training scores, so
        // roughly that fraction of the pool sits below zero.
        let mut scores: Vec<f64> = data.iter().map(|x| forest.score_samples(x)).collect();
        scores.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
        forest.offset = percentile(&scores, cfg.contamination * 100.0);
        forest
    }

    /// Normality score in [-1, 0): closer to -1 is more anomalous.
    pub fn score_samples(&self, x: &FeatureVector) -> f64 {
        if self.trees.is_empty() {
            return -0.5;
        }
        let mean_path: f64 = self
            .trees
            .iter()
            .map(|t| t.path_length(x))
            .sum::<f64>()
            / self.trees.len() as f64;
        let norm = average_path_length(self.sample_size).max(f64::EPSILON);
        -(2f64.powf(-mean_path / norm))
    }

    /// Signed margin: negative means outlier. More negative, more anomalous.
    pub fn decision_function(&self, x: &FeatureVector) -> f64 {
        self.score_samples(x) - self.offset
    }

    /// Hard outlier vote.
    pub fn is_outlier(&self, x: &FeatureVector) -> bool {
        self.decision_function(x) < 0.0
    }
}

/// Linear-interpolated percentile over pre-sorted values.
fn percentile(sorted: &[f64], pct: f64) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    let rank = (pct / 100.0) * (sorted.len() - 1) as f64;
    let lo = rank.floor() as usize;
    let hi = rank.ceil() as usize;
    if lo == hi {
        sorted[lo]
    } else {
        let frac = rank - lo as f64;
        sorted[lo] * (1.0 - frac) + sorted[hi] * frac
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    /// Tight cluster around a fixed center with deterministic jitter.
    fn clustered(n: usize) -> Vec<FeatureVector> {
        let mut rng = StdRng::seed_from_u64(7);
        (0..n)
            .map(|_| {
                let mut row = [0.0; NUM_FEATURES];
                for v in row.iter_mut() {
                    *v = 10.0 + rng.gen::<f64>() * 0.5;
                }
                FeatureVector(row)
            })
            .collect()
    }

    fn far_outlier() -> FeatureVector {
        FeatureVector([300.0; NUM_FEATURES])
    }

    #[test]
    fn outlier_scores_below_cluster_scores() {
        let data = clustered(100);
        let mut rng = StdRng::seed_from_u64(42);
        let forest = IsolationForest::fit(&data, &AnomalyConfig::default(), &mut rng);

        let inlier_score = forest.score_samples(&data[0]);
        let outlier_score = forest.score_samples(&far_outlier());
        assert!(
            outlier_score < inlier_score,
            "outlier {outlier_score} should score below inlier {inlier_score}"
        );
    }

    #[test]
    fn far_outlier_gets_negative_decision() {
        let data = clustered(100);
        let mut rng = StdRng::seed_from_u64(42);
        let forest = IsolationForest::fit(&data, &AnomalyConfig::default(), &mut rng);
        assert!(forest.is_outlier(&far_outlier()));
        assert!(forest.decision_function(&far_outlier()) < 0.0);
    }

    #[test]
    fn most_of_the_cluster_is_inlier() {
        let data = clustered(120);
        let mut rng = StdRng::seed_from_u64(42);
        let forest = IsolationForest::fit(&data, &AnomalyConfig::default(), &mut rng);
        let flagged = data.iter().filter(|v| forest.is_outlier(v)).count();
        // Contamination is 10%; allow slack for the quantile interpolation.
        assert!(
            flagged <= data.len() / 4,
            "{flagged} of {} inliers flagged",
            data.len()
        );
    }

    #[test]
    fn average_path_length_growth() {
        assert_eq!(average_path_length(0), 0.0);
        assert_eq!(average_path_length(1), 0.0);
        assert_eq!(average_path_length(2), 1.0);
        assert!(average_path_length(256) > average_path_length(16));
    }

    #[test]
    fn percentile_interpolates() {
        let vals = [0.0, 1.0, 2.0, 3.0, 4.0];
        assert_eq!(percentile(&vals, 0.0), 0.0);
        assert_eq!(percentile(&vals, 100.0), 4.0);
        assert!((percentile(&vals, 50.0) - 2.0).abs() < 1e-12);
        assert!((percentile(&vals, 10.0) - 0.4).abs() < 1e-12);
    }

    #[test]
    fn constant_data_fits_without_panic() {
        let data = vec![FeatureVector::zeros(); 50];
        let mut rng = StdRng::seed_from_u64(1);
        let forest = IsolationForest::fit(&data, &AnomalyConfig::default(), &mut rng);
        // Every tree collapses to a single leaf; scores are uniform.
        let s = forest.score_samples(&FeatureVector::zeros());
        assert!(s.is_finite());
    }
}
