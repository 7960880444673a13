//! Gradient-boosted decision trees for binary outcomes
//!
//! Small, heavily regularized boosting on the 32-column feature space:
//! depth-capped trees, minimum leaf/split sizes, per-round row subsampling,
//! per-split feature subsampling (sqrt of the feature count), shrinkage,
//! and early stopping against an internal validation slice. The estimator
//! budget is a ceiling, not a target.

use std::cmp::Ordering;

use rand::rngs::StdRng;
use rand::seq::index;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::ModelConfig;
use crate::error::{EngineError, Result};
use crate::features::{FeatureVector, NUM_FEATURES};
use crate::model::metrics;

/// Newton leaf steps are clamped so a saturated node cannot blow up the
/// margin in one round.
const MAX_LEAF_VALUE: f64 = 4.0;

#[derive(Debug, Clone, Serialize, Deserialize)]
enum Node {
    Leaf {
        value: f64,
    },
    Split {
        feature: usize,
        threshold: f64,
        left: Box<Node>,
        right: Box<Node>,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct RegressionTree {
    root: Node,
}

impl RegressionTree {
    fn predict(&self, x: &FeatureVector) -> f64 {
        let mut node = &self.root;
        loop {
            match node {
                Node::Leaf { value } => return *value,
                Node::Split {
                    feature,
                    threshold,
                    left,
                    right,
                } => {
                    node = if x[*feature] <= *threshold { left } else { right };
                }
            }
        }
    }
}

struct SplitCandidate {
    feature: usize,
    threshold: f64,
    gain: f64,
}

/// Builds one tree against the current pseudo-residuals.
struct TreeBuilder<'a> {
    x: &'a [FeatureVector],
    grad: &'a [f64],
    hess: &'a [f64],
    cfg: &'a ModelConfig,
    n_split_features: usize,
}

impl<'a> TreeBuilder<'a> {
    fn build(&self, rows: &[usize], depth: usize, rng: &mut StdRng, importances: &mut [f64]) -> Node {
        if depth >= self.cfg.max_depth || rows.len() < self.cfg.min_samples_split {
            return self.leaf(rows);
        }
        let split = match self.best_split(rows, rng) {
            Some(s) => s,
            None => return self.leaf(rows),
        };

        let (left_rows, right_rows): (Vec<usize>, Vec<usize>) = rows
            .iter()
            .copied()
            .partition(|&i| self.x[i][split.feature] <= split.threshold);
        importances[split.feature] += split.gain;

        Node::Split {
            feature: split.feature,
            threshold: split.threshold,
            left: Box::new(self.build(&left_rows, depth + 1, rng, importances)),
            right: Box::new(self.build(&right_rows, depth + 1, rng, importances)),
        }
    }

    fn leaf(&self, rows: &[usize]) -> Node {
        let g: f64 = rows.iter().map(|&i| self.grad[i]).sum();
        let h: f64 = rows.iter().map(|&i| self.hess[i]).sum();
        let value = (g / h.max(1e-6)).clamp(-MAX_LEAF_VALUE, MAX_LEAF_VALUE);
        Node::Leaf { value }
    }

    /// Best variance-reduction split over a random feature subset.
    fn best_split(&self, rows: &[usize], rng: &mut StdRng) -> Option<SplitCandidate> {
        let features = index::sample(rng, NUM_FEATURES, self.n_split_features);
        let mut best: Option<SplitCandidate> = None;

        for feature in features {
            let mut vals: Vec<(f64, f64)> = rows
                .iter()
                .map(|&i| (self.x[i][feature], self.grad[i]))
                .collect();
            vals.sort_by(|a, b| a.0.partial_cmp(&b.0).unwrap_or(Ordering::Equal));

            let n = vals.len() as f64;
            let total_sum: f64 = vals.iter().map(|(_, g)| g).sum();
            let total_sq: f64 = vals.iter().map(|(_, g)| g * g).sum();
            let parent_sse = total_sq - total_sum * total_sum / n;

            let mut left_sum = 0.0;
            let mut left_sq = 0.0;
            for i in 1..vals.len() {
                left_sum += vals[i - 1].1;
                left_sq += vals[i - 1].1 * vals[i - 1].1;

                // Can't separate identical values.
                if vals[i].0 - vals[i - 1].0 <= f64::EPSILON {
                    continue;
                }
                let n_left = i;
                let n_right = vals.len() - i;
                if n_left < self.cfg.min_samples_leaf || n_right < self.cfg.min_samples_leaf {
                    continue;
                }

                let right_sum = total_sum - left_sum;
                let right_sq = total_sq - left_sq;
                let left_sse = left_sq - left_sum * left_sum / n_left as f64;
                let right_sse = right_sq - right_sum * right_sum / n_right as f64;
                let gain = parent_sse - left_sse - right_sse;

                if gain > 1e-12 && best.as_ref().map_or(true, |b| gain > b.gain) {
                    best = Some(SplitCandidate {
                        feature,
                        threshold: (vals[i - 1].0 + vals[i].0) / 2.0,
                        gain,
                    });
                }
            }
        }
        best
    }
}

/// A fitted boosted ensemble.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GradientBoostedTrees {
    trees: Vec<RegressionTree>,
    init_score: f64,
    learning_rate: f64,
    feature_importances: Vec<f64>,
}

impl GradientBoostedTrees {
    /// Fit on labelled rows. Logistic loss, Newton leaf values.
    pub fn fit(x: &[FeatureVector], y: &[bool], cfg: &ModelConfig) -> Result<Self> {
        if x.len() != y.len() {
            return Err(EngineError::Training(format!(
                "feature/label length mismatch: {} vs {}",
                x.len(),
                y.len()
            )));
        }
        if x.len() < 2 {
            return Err(EngineError::Training(format!(
                "need at least 2 rows to fit, have {}",
                x.len()
            )));
        }

        let mut rng = StdRng::seed_from_u64(cfg.seed);
        let n = x.len();

        // Internal early-stopping slice, carved off before boosting so the
        // stopping criterion never sees training rows.
        let es_n = ((n as f64) * cfg.validation_fraction).round() as usize;
        let use_early_stop = es_n >= 2 && n - es_n >= 4;
        let mut order: Vec<usize> = (0..n).collect();
        order.shuffle(&mut rng);
        let (boost_idx, es_idx) = if use_early_stop {
            order.split_at(n - es_n)
        } else {
            (&order[..], &order[..0])
        };

        let xb: Vec<FeatureVector> = boost_idx.iter().map(|&i| x[i]).collect();
        let yb: Vec<f64> = boost_idx.iter().map(|&i| if y[i] { 1.0 } else { 0.0 }).collect();
        let xe: Vec<FeatureVector> = es_idx.iter().map(|&i| x[i]).collect();
        let ye: Vec<bool> = es_idx.iter().map(|&i| y[i]).collect();

        let base_rate = (yb.iter().sum::<f64>() / yb.len() as f64).clamp(1e-6, 1.0 - 1e-6);
        let init_score = (base_rate / (1.0 - base_rate)).ln();

        let nb = xb.len();
        let mut f_boost = vec![init_score; nb];
        let mut f_es = vec![init_score; xe.len()];
        let mut grad = vec![0.0; nb];
        let mut hess = vec![0.0; nb];
        let mut importances = vec![0.0; NUM_FEATURES];
        let mut trees: Vec<RegressionTree> = Vec::new();

        let n_split_features = ((NUM_FEATURES as f64).sqrt().ceil() as usize).min(NUM_FEATURES);
        let sample_n = ((nb as f64) * cfg.subsample).floor().max(1.0) as usize;

        let mut best_loss = f64::INFINITY;
        let mut stale_rounds = 0usize;

        for round in 0..cfg.n_estimators {
            for j in 0..nb {
                let p = sigmoid(f_boost[j]);
                grad[j] = yb[j] - p;
                hess[j] = (p * (1.0 - p)).max(1e-12);
            }

            let rows = index::sample(&mut rng, nb, sample_n.min(nb)).into_vec();
            let builder = TreeBuilder {
                x: &xb,
                grad: &grad,
                hess: &hess,
                cfg,
                n_split_features,
            };
            let tree = RegressionTree {
                root: builder.build(&rows, 0, &mut rng, &mut importances),
            };

            for j in 0..nb {
                f_boost[j] += cfg.learning_rate * tree.predict(&xb[j]);
            }
            for (j, xv) in xe.iter().enumerate() {
                f_es[j] += cfg.learning_rate * tree.predict(xv);
            }
            trees.push(tree);

            if use_early_stop {
                let probs: Vec<f64> = f_es.iter().map(|f| sigmoid(*f)).collect();
                let loss = metrics::log_loss(&probs, &ye);
                if loss < best_loss - cfg.early_stopping_tol {
                    best_loss = loss;
                    stale_rounds = 0;
                } else {
                    stale_rounds += 1;
                    if stale_rounds >= cfg.early_stopping_patience {
                        debug!(
                            rounds = round + 1,
                            budget = cfg.n_estimators,
                            "early stopping: validation loss flat"
                        );
                        break;
                    }
                }
            }
        }

        let total_gain: f64 = importances.iter().sum();
        if total_gain > 0.0 {
            for v in &mut importances {
                *v /= total_gain;
            }
        }

        Ok(Self {
            trees,
            init_score,
            learning_rate: cfg.learning_rate,
            feature_importances: importances,
        })
    }

    /// Raw additive margin (log-odds scale).
    pub fn predict_margin(&self, x: &FeatureVector) -> f64 {
        let tree_sum: f64 = self.trees.iter().map(|t| t.predict(x)).sum();
        self.init_score + self.learning_rate * tree_sum
    }

    /// Probability of the positive outcome.
    pub fn predict_proba(&self, x: &FeatureVector) -> f64 {
        sigmoid(self.predict_margin(x))
    }

    /// Trees actually fitted (early stopping may undercut the budget).
    pub fn estimators_used(&self) -> usize {
        self.trees.len()
    }

    /// Normalized split-gain importance per feature column.
    pub fn feature_importances(&self) -> &[f64] {
        &self.feature_importances
    }
}

/// K-fold cross-validated accuracy over contiguous folds.
///
/// Returns (mean, std) across folds; a sanity signal against overfitting,
/// not a generalization estimate.
pub fn cross_val_accuracy(
    x: &[FeatureVector],
    y: &[bool],
    cfg: &ModelConfig,
    folds: usize,
) -> (f64, f64) {
    let n = x.len();
    if folds < 2 || n < folds * 2 {
        return (0.0, 0.0);
    }

    let base = n / folds;
    let extra = n % folds;
    let mut scores = Vec::with_capacity(folds);
    let mut start = 0usize;

    for fold in 0..folds {
        let size = base + usize::from(fold < extra);
        let end = start + size;

        let test_x = &x[start..end];
        let test_y = &y[start..end];
        let train_x: Vec<FeatureVector> = x[..start].iter().chain(&x[end..]).copied().collect();
        let train_y: Vec<bool> = y[..start].iter().chain(&y[end..]).copied().collect();
        start = end;

        let model = match GradientBoostedTrees::fit(&train_x, &train_y, cfg) {
            Ok(m) => m,
            Err(_) => continue,
        };
        let probs: Vec<f64> = test_x.iter().map(|v| model.predict_proba(v)).collect();
        scores.push(metrics::accuracy(&probs, test_y));
    }

    if scores.is_empty() {
        return (0.0, 0.0);
    }
    let mean = scores.iter().sum::<f64>() / scores.len() as f64;
    let var =
        scores.iter().map(|s| (s - mean) * (s - mean)).sum::<f64>() / scores.len() as f64;
    (mean, var.sqrt())
}

pub(crate) fn sigmoid(x: f64) -> f64 {
    1.0 / (1.0 + (-x).exp())
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Outcome driven by one feature with a little determinism-friendly noise.
    fn synthetic(n: usize) -> (Vec<FeatureVector>, Vec<bool>) {
        let mut x = Vec::with_capacity(n);
        let mut y = Vec::with_capacity(n);
        for i in 0..n {
            let mut row = [0.0; NUM_FEATURES];
            let driver = (i % 11) as f64 - 5.0;
            row[22] = driver;
            row[3] = 50.0 + ((i * 7) % 13) as f64;
            row[14] = 0.5 + driver * 0.02;
            x.push(FeatureVector(row));
            y.push(driver > 0.0);
        }
        (x, y)
    }

    #[test]
    fn learns_a_separable_rule() {
        let (x, y) = synthetic(120);
        let model = GradientBoostedTrees::fit(&x, &y, &ModelConfig::default()).unwrap();
        let probs: Vec<f64> = x.iter().map(|v| model.predict_proba(v)).collect();
        let acc = metrics::accuracy(&probs, &y);
        assert!(acc > 0.8, "training accuracy {acc} too low for separable data");
    }

    #[test]
    fn probabilities_stay_in_unit_interval() {
        let (x, y) = synthetic(80);
        let model = GradientBoostedTrees::fit(&x, &y, &ModelConfig::default()).unwrap();
        let mut extreme = FeatureVector::zeros();
        extreme.0[22] = 1e6;
        for v in x.iter().chain(std::iter::once(&extreme)) {
            let p = model.predict_proba(v);
            assert!((0.0..=1.0).contains(&p), "p={p}");
        }
    }

    #[test]
    fn early_stopping_respects_budget() {
        let (x, y) = synthetic(100);
        let cfg = ModelConfig::default();
        let model = GradientBoostedTrees::fit(&x, &y, &cfg).unwrap();
        assert!(model.estimators_used() >= 1);
        assert!(model.estimators_used() <= cfg.n_estimators);
    }

    #[test]
    fn importances_are_normalized_and_point_at_the_driver() {
        let (x, y) = synthetic(120);
        let model = GradientBoostedTrees::fit(&x, &y, &ModelConfig::default()).unwrap();
        let imp = model.feature_importances();
        let sum: f64 = imp.iter().sum();
        assert!((sum - 1.0).abs() < 1e-9, "importance sum {sum}");
        let top = imp
            .iter()
            .enumerate()
            .max_by(|a, b| a.1.partial_cmp(b.1).unwrap())
            .unwrap()
            .0;
        assert_eq!(top, 22, "expected the driving feature to dominate");
    }

    #[test]
    fn fit_is_deterministic_for_a_fixed_seed() {
        let (x, y) = synthetic(90);
        let cfg = ModelConfig::default();
        let a = GradientBoostedTrees::fit(&x, &y, &cfg).unwrap();
        let b = GradientBoostedTrees::fit(&x, &y, &cfg).unwrap();
        for v in x.iter().take(10) {
            assert_eq!(a.predict_proba(v), b.predict_proba(v));
        }
    }

    #[test]
    fn rejects_degenerate_input() {
        let cfg = ModelConfig::default();
        assert!(GradientBoostedTrees::fit(&[], &[], &cfg).is_err());
        let x = vec![FeatureVector::zeros()];
        assert!(GradientBoostedTrees::fit(&x, &[true], &cfg).is_err());
        assert!(GradientBoostedTrees::fit(&x, &[true, false], &cfg).is_err());
    }

    #[test]
    fn single_class_fit_predicts_that_class() {
        let (x, _) = synthetic(60);
        let y = vec![true; 60];
        let model = GradientBoostedTrees::fit(&x, &y, &ModelConfig::default()).unwrap();
        let p = model.predict_proba(&x[0]);
        assert!(p > 0.9, "all-wins history should predict near 1.0, got {p}");
    }

    #[test]
    fn cross_validation_reports_sane_numbers() {
        let (x, y) = synthetic(100);
        let (mean, std) = cross_val_accuracy(&x, &y, &ModelConfig::default(), 5);
        assert!((0.0..=1.0).contains(&mean));
        assert!(std >= 0.0);
        assert!(mean > 0.6, "cv accuracy {mean} too low for separable data");
    }
}
