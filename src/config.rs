//! Tunable configuration for every component
//!
//! The drift thresholds and Page-Hinkley parameters are empirically chosen
//! operating points, not derived constants, so they are all plain fields
//! with defaults the orchestrator can override per deployment.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Configuration for the supervised pick model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Minimum labelled samples before the model makes real predictions.
    pub min_training_samples: usize,
    /// Auto-retrain after this many new results since the last train.
    pub retrain_interval: usize,
    /// Estimator budget for the boosted ensemble.
    pub n_estimators: usize,
    /// Maximum tree depth.
    pub max_depth: usize,
    /// Shrinkage applied to each tree's contribution.
    pub learning_rate: f64,
    /// Row subsample fraction per boosting round.
    pub subsample: f64,
    /// Minimum rows in a leaf.
    pub min_samples_leaf: usize,
    /// Minimum rows required to attempt a split.
    pub min_samples_split: usize,
    /// Fraction of TRAIN held out internally for early stopping.
    pub validation_fraction: f64,
    /// Rounds without improvement before early stop.
    pub early_stopping_patience: usize,
    /// Minimum loss improvement that counts as progress.
    pub early_stopping_tol: f64,
    /// Fraction of all samples reserved for calibration (VALIDATION).
    pub val_split: f64,
    /// Fraction of all samples reserved for final evaluation (HOLDOUT).
    pub holdout_split: f64,
    /// Folds for the cross-validation sanity check.
    pub cv_folds: usize,
    /// Train-minus-validation accuracy gap that logs an overfitting warning.
    pub overfit_gap_warn: f64,
    /// Seed for the shuffle/split and all subsampling.
    pub seed: u64,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            min_training_samples: 50,
            retrain_interval: 25,
            n_estimators: 200,
            max_depth: 4,
            learning_rate: 0.05,
            subsample: 0.8,
            min_samples_leaf: 5,
            min_samples_split: 10,
            validation_fraction: 0.15,
            early_stopping_patience: 20,
            early_stopping_tol: 1e-4,
            val_split: 0.2,
            holdout_split: 0.1,
            cv_folds: 5,
            overfit_gap_warn: 0.15,
            seed: 42,
        }
    }
}

/// Configuration for the unsupervised anomaly detector.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnomalyConfig {
    /// Minimum pooled vectors before a fit is attempted.
    pub min_fit_samples: usize,
    /// Expected proportion of anomalies in the pool.
    pub contamination: f64,
    /// Per-feature |z| above which a feature counts as anomalous.
    pub z_score_threshold: f64,
    /// Features with |z| above the threshold needed to flag on z-scores alone.
    pub z_feature_count: usize,
    /// Trees in the isolation forest.
    pub n_estimators: usize,
    /// Fraction of features sampled per tree.
    pub max_features: f64,
    /// Sample rows with replacement per tree.
    pub bootstrap: bool,
    /// Per-tree row sample ceiling.
    pub max_samples: usize,
    /// Rolling pool retention.
    pub pool_capacity: usize,
    /// Detected-anomaly audit log retention.
    pub audit_capacity: usize,
    /// Seed for tree construction.
    pub seed: u64,
}

impl Default for AnomalyConfig {
    fn default() -> Self {
        Self {
            min_fit_samples: 30,
            contamination: 0.10,
            z_score_threshold: 2.5,
            z_feature_count: 3,
            n_estimators: 100,
            max_features: 0.8,
            bootstrap: true,
            max_samples: 256,
            pool_capacity: 500,
            audit_capacity: 100,
            seed: 42,
        }
    }
}

/// Configuration for the drift monitor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitorConfig {
    /// Rolling evaluation window (the prediction buffer holds 2x this).
    pub window_size: usize,
    /// Resolved predictions required before any drift test runs.
    pub min_resolved: usize,
    /// Rolling accuracy below this trips performance drift.
    pub min_accuracy: f64,
    /// AUC approximation below this trips concept drift.
    pub min_auc: f64,
    /// Brier score above this trips calibration drift.
    pub max_brier: f64,
    /// Per-feature PSI above this trips data drift.
    pub psi_threshold: f64,
    /// Page-Hinkley sensitivity (delta).
    pub page_hinkley_delta: f64,
    /// Page-Hinkley detection threshold (lambda).
    pub page_hinkley_lambda: f64,
    /// Error observations required before the PH test is eligible.
    pub page_hinkley_min_obs: usize,
    /// Accuracy below this (without a trip) recommends closer monitoring.
    pub watch_accuracy: f64,
    /// Brier above this (without a trip) recommends closer monitoring.
    pub watch_brier: f64,
    /// Fixed-width probability bins for the calibration-error metric.
    pub ece_bins: usize,
    /// Histogram bins for the frozen feature baselines.
    pub psi_bins: usize,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            window_size: 50,
            min_resolved: 10,
            min_accuracy: 0.52,
            min_auc: 0.55,
            max_brier: 0.30,
            psi_threshold: 0.20,
            page_hinkley_delta: 0.005,
            page_hinkley_lambda: 50.0,
            page_hinkley_min_obs: 20,
            watch_accuracy: 0.55,
            watch_brier: 0.25,
            ece_bins: 5,
            psi_bins: 10,
        }
    }
}

/// Top-level configuration threaded through [`crate::engine::PickEngine`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EngineConfig {
    pub model: ModelConfig,
    pub anomaly: AnomalyConfig,
    pub monitor: MonitorConfig,
    /// Root directory for logs and snapshots. `None` runs fully in memory.
    pub data_dir: Option<PathBuf>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_operating_points() {
        let m = ModelConfig::default();
        assert_eq!(m.min_training_samples, 50);
        assert_eq!(m.retrain_interval, 25);
        assert_eq!(m.max_depth, 4);

        let a = AnomalyConfig::default();
        assert_eq!(a.min_fit_samples, 30);
        assert!((a.contamination - 0.10).abs() < 1e-12);

        let mon = MonitorConfig::default();
        assert!((mon.page_hinkley_lambda - 50.0).abs() < 1e-12);
        assert_eq!(mon.window_size, 50);
    }
}
