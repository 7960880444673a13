//! Supervised pick model
//!
//! Gradient-boosted classifier over the 32-column feature space, learning
//! from recorded pick outcomes. Lifecycle:
//!
//! 1. `FeatureEngine::extract` builds the vector
//! 2. `PickModel::predict` returns a calibrated win probability
//! 3. After the game settles, `PickModel::record` appends the outcome
//! 4. Auto-retrain fires every `retrain_interval` results once the minimum
//!    sample count is met
//!
//! Anti-overfitting guards: disjoint train/validation/holdout split, early
//! stopping, 5-fold cross-validation, a train-vs-validation gap warning,
//! and Platt calibration fit only on rows the ensemble never saw. A train
//! either publishes a complete new `(ensemble, calibrator, version)` tuple
//! in one atomic swap or leaves the serving model byte-for-byte untouched.

pub mod boosting;
pub mod calibration;
pub mod metrics;

use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, RwLock};

use chrono::{DateTime, Utc};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use crate::config::ModelConfig;
use crate::error::Result;
use crate::features::{FeatureVector, FEATURE_NAMES};
use crate::store::{load_snapshot, save_snapshot, DataDir, JsonlLog};

use boosting::{cross_val_accuracy, GradientBoostedTrees};
use calibration::PlattCalibrator;

const RECORDS_FILE: &str = "training_records.jsonl";
const MODEL_FILE: &str = "model.json";
const META_FILE: &str = "model_meta.json";

/// One labelled outcome, as appended to the training log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainingRecord {
    pub features: FeatureVector,
    pub won: bool,
    pub game_key: String,
    pub pick_type: String,
    pub recorded_at: DateTime<Utc>,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

/// Confidence band attached to every prediction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Confidence {
    High,
    Medium,
    Low,
    Untrained,
    Error,
}

impl Confidence {
    /// Band from distance to the coin-flip line.
    pub fn from_probability(p: f64) -> Self {
        let edge = (p - 0.5).abs();
        if edge >= 0.15 {
            Confidence::High
        } else if edge >= 0.08 {
            Confidence::Medium
        } else {
            Confidence::Low
        }
    }
}

impl std::fmt::Display for Confidence {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Confidence::High => "HIGH",
            Confidence::Medium => "MEDIUM",
            Confidence::Low => "LOW",
            Confidence::Untrained => "UNTRAINED",
            Confidence::Error => "ERROR",
        };
        write!(f, "{s}")
    }
}

/// Structured output of [`PickModel::predict`].
#[derive(Debug, Clone, Serialize)]
pub struct Prediction {
    pub win_probability: f64,
    pub confidence: Confidence,
    pub model_version: u64,
    pub sample_size: usize,
    pub is_trained: bool,
    /// Set when the model degraded to the neutral output.
    pub reason: Option<String>,
}

/// Outcome of one `train()` run.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum TrainOutcome {
    Trained(TrainMetrics),
    InsufficientData { total: usize, needed: usize },
    Failed { error: String },
}

impl TrainOutcome {
    pub fn is_trained(&self) -> bool {
        matches!(self, TrainOutcome::Trained(_))
    }
}

/// Metrics from a successful training run.
#[derive(Debug, Clone, Serialize)]
pub struct TrainMetrics {
    pub model_version: u64,
    pub total_samples: usize,
    pub train_size: usize,
    pub val_size: usize,
    pub holdout_size: usize,
    pub estimators_used: usize,
    pub cv_accuracy: f64,
    pub cv_std: f64,
    pub train_accuracy: f64,
    pub val_accuracy: f64,
    pub overfit_gap: f64,
    /// Holdout numbers are the only trustworthy generalization estimates.
    pub holdout_accuracy: f64,
    pub holdout_auc: f64,
    pub holdout_brier: f64,
    pub holdout_log_loss: f64,
    pub win_rate: f64,
    /// Importance ranking, highest first.
    pub feature_importance: Vec<(String, f64)>,
    pub trained_at: DateTime<Utc>,
}

/// Status of one `record()` call.
#[derive(Debug, Clone, Serialize)]
pub struct RecordStatus {
    pub recorded: bool,
    pub total_samples: usize,
    pub results_since_train: usize,
    /// Whether an auto-retrain fired (see `train_outcome` for its result).
    pub retrained: bool,
    pub train_outcome: Option<TrainOutcome>,
    pub samples_needed: Option<usize>,
    pub next_retrain_in: Option<usize>,
}

/// Model state for dashboards and the orchestrator.
#[derive(Debug, Clone, Serialize)]
pub struct ModelStatus {
    pub is_trained: bool,
    pub model_version: u64,
    pub total_samples: usize,
    pub results_since_train: usize,
    pub last_trained_at: Option<DateTime<Utc>>,
    pub min_samples_required: usize,
    pub retrain_interval: usize,
}

/// The atomically-published serving tuple.
#[derive(Debug, Serialize, Deserialize)]
struct PublishedModel {
    ensemble: GradientBoostedTrees,
    calibrator: PlattCalibrator,
    version: u64,
}

/// Small metadata snapshot updated on every record/train.
#[derive(Debug, Serialize, Deserialize)]
struct ModelMeta {
    model_version: u64,
    results_since_train: usize,
    last_trained_at: Option<DateTime<Utc>>,
    is_trained: bool,
}

struct PickStore {
    records: JsonlLog<TrainingRecord>,
    dir: DataDir,
}

struct PickState {
    records: Vec<TrainingRecord>,
    model_version: u64,
    results_since_train: usize,
    last_trained_at: Option<DateTime<Utc>>,
    store: Option<PickStore>,
}

impl PickState {
    fn persist_record(&mut self, record: &TrainingRecord) {
        let meta = ModelMeta {
            model_version: self.model_version,
            results_since_train: self.results_since_train,
            last_trained_at: self.last_trained_at,
            is_trained: self.model_version > 0,
        };
        if let Some(store) = &mut self.store {
            if let Err(e) = store.records.append(record) {
                warn!(error = %e, "failed to persist training record");
            }
            if let Err(e) = save_snapshot(&store.dir.file(META_FILE), &meta) {
                warn!(error = %e, "failed to persist model metadata");
            }
        }
    }
}

/// Supervised win-probability model with explicit retrain lifecycle.
pub struct PickModel {
    config: ModelConfig,
    state: Mutex<PickState>,
    published: RwLock<Option<Arc<PublishedModel>>>,
}

impl PickModel {
    /// Ephemeral in-memory model.
    pub fn new(config: ModelConfig) -> Self {
        Self {
            config,
            state: Mutex::new(PickState {
                records: Vec::new(),
                model_version: 0,
                results_since_train: 0,
                last_trained_at: None,
                store: None,
            }),
            published: RwLock::new(None),
        }
    }

    /// Open with persistence: replays the training log and restores the
    /// last published model snapshot, if any.
    pub fn open(config: ModelConfig, dir: &DataDir) -> Result<Self> {
        let records_log: JsonlLog<TrainingRecord> = JsonlLog::open(dir.file(RECORDS_FILE))?;
        let records = records_log.replay()?;
        let meta: Option<ModelMeta> = load_snapshot(&dir.file(META_FILE))?;
        let published: Option<PublishedModel> = match load_snapshot(&dir.file(MODEL_FILE)) {
            Ok(p) => p,
            Err(e) => {
                warn!(error = %e, "model snapshot unreadable; starting untrained");
                None
            }
        };

        if !records.is_empty() {
            info!(
                samples = records.len(),
                version = meta.as_ref().map(|m| m.model_version).unwrap_or(0),
                "restored training history"
            );
        }

        let state = PickState {
            records,
            model_version: meta.as_ref().map(|m| m.model_version).unwrap_or(0),
            results_since_train: meta.as_ref().map(|m| m.results_since_train).unwrap_or(0),
            last_trained_at: meta.as_ref().and_then(|m| m.last_trained_at),
            store: Some(PickStore {
                records: records_log,
                dir: dir.clone(),
            }),
        };

        Ok(Self {
            config,
            state: Mutex::new(state),
            published: RwLock::new(published.map(Arc::new)),
        })
    }

    fn lock_state(&self) -> MutexGuard<'_, PickState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Predict win probability for one feature vector.
    ///
    /// Never fails: below the sample floor it returns the neutral 0.5 with
    /// an `Untrained` label, and any non-finite internal output degrades to
    /// 0.5 with an `Error` label.
    pub fn predict(&self, features: &FeatureVector) -> Prediction {
        let (sample_size, version) = {
            let s = self.lock_state();
            (s.records.len(), s.model_version)
        };
        let published = self
            .published
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone();

        let model = match published {
            Some(m) if sample_size >= self.config.min_training_samples => m,
            _ => {
                return Prediction {
                    win_probability: 0.5,
                    confidence: Confidence::Untrained,
                    model_version: version,
                    sample_size,
                    is_trained: false,
                    reason: Some(format!(
                        "need {} samples, have {}",
                        self.config.min_training_samples, sample_size
                    )),
                };
            }
        };

        let raw = model.ensemble.predict_proba(features);
        let prob = model.calibrator.calibrate(raw);
        if !prob.is_finite() {
            error!(raw, "non-finite calibrated probability; degrading to neutral");
            return Prediction {
                win_probability: 0.5,
                confidence: Confidence::Error,
                model_version: model.version,
                sample_size,
                is_trained: true,
                reason: Some("non-finite model output".to_string()),
            };
        }

        Prediction {
            win_probability: prob,
            confidence: Confidence::from_probability(prob),
            model_version: model.version,
            sample_size,
            is_trained: true,
            reason: None,
        }
    }

    /// Record a settled outcome, persisting before returning. Fires an
    /// auto-retrain once enough new results have accumulated.
    pub fn record(
        &self,
        features: &FeatureVector,
        won: bool,
        game_key: &str,
        pick_type: &str,
        metadata: HashMap<String, String>,
    ) -> RecordStatus {
        let (total, since) = {
            let mut s = self.lock_state();
            let record = TrainingRecord {
                features: *features,
                won,
                game_key: game_key.to_string(),
                pick_type: pick_type.to_string(),
                recorded_at: Utc::now(),
                metadata,
            };
            s.records.push(record.clone());
            s.results_since_train += 1;
            s.persist_record(&record);
            (s.records.len(), s.results_since_train)
        };

        let mut status = RecordStatus {
            recorded: true,
            total_samples: total,
            results_since_train: since,
            retrained: false,
            train_outcome: None,
            samples_needed: None,
            next_retrain_in: None,
        };

        if total >= self.config.min_training_samples && since >= self.config.retrain_interval {
            info!(total, since, "auto-retrain triggered");
            let outcome = self.train();
            status.retrained = true;
            status.train_outcome = Some(outcome);
            status.results_since_train = self.lock_state().results_since_train;
        } else if total < self.config.min_training_samples {
            status.samples_needed = Some(self.config.min_training_samples - total);
        } else {
            status.next_retrain_in = Some(self.config.retrain_interval - since);
        }
        status
    }

    /// Run the full training pipeline on the accumulated records.
    ///
    /// Publishes a new model version only if every step (including the
    /// snapshot write) succeeds; otherwise the serving model is untouched.
    pub fn train(&self) -> TrainOutcome {
        let (x, y) = {
            let s = self.lock_state();
            let x: Vec<FeatureVector> = s.records.iter().map(|r| r.features).collect();
            let y: Vec<bool> = s.records.iter().map(|r| r.won).collect();
            (x, y)
        };

        if x.len() < self.config.min_training_samples {
            return TrainOutcome::InsufficientData {
                total: x.len(),
                needed: self.config.min_training_samples,
            };
        }

        match self.train_pipeline(&x, &y) {
            Ok(metrics) => TrainOutcome::Trained(metrics),
            Err(e) => {
                error!(error = %e, "training pipeline failed; serving model untouched");
                TrainOutcome::Failed {
                    error: e.to_string(),
                }
            }
        }
    }

    fn train_pipeline(&self, x: &[FeatureVector], y: &[bool]) -> Result<TrainMetrics> {
        let cfg = &self.config;
        let total = x.len();

        let wins = y.iter().filter(|w| **w).count();
        let win_rate = wins as f64 / total as f64;
        if !(0.1..=0.9).contains(&win_rate) {
            warn!(win_rate, "extreme class imbalance; model may not generalize");
        }

        // Disjoint split: holdout is never trained or calibrated on.
        let (train_idx, val_idx, holdout_idx) = split_indices(total, cfg);
        let gather = |idx: &[usize]| -> (Vec<FeatureVector>, Vec<bool>) {
            (
                idx.iter().map(|&i| x[i]).collect(),
                idx.iter().map(|&i| y[i]).collect(),
            )
        };
        let (x_train, y_train) = gather(&train_idx);
        let (x_val, y_val) = gather(&val_idx);
        let (x_holdout, y_holdout) = gather(&holdout_idx);
        info!(
            train = x_train.len(),
            val = x_val.len(),
            holdout = x_holdout.len(),
            "training split"
        );

        let ensemble = GradientBoostedTrees::fit(&x_train, &y_train, cfg)?;
        info!(
            estimators = ensemble.estimators_used(),
            budget = cfg.n_estimators,
            "ensemble fitted"
        );

        let (cv_accuracy, cv_std) = cross_val_accuracy(&x_train, &y_train, cfg, cfg.cv_folds);
        info!(cv_accuracy, cv_std, "cross-validation accuracy");

        let train_probs: Vec<f64> = x_train.iter().map(|v| ensemble.predict_proba(v)).collect();
        let val_probs: Vec<f64> = x_val.iter().map(|v| ensemble.predict_proba(v)).collect();
        let train_accuracy = metrics::accuracy(&train_probs, &y_train);
        let val_accuracy = metrics::accuracy(&val_probs, &y_val);
        let overfit_gap = train_accuracy - val_accuracy;
        if overfit_gap > cfg.overfit_gap_warn {
            warn!(
                train_accuracy,
                val_accuracy, overfit_gap, "overfitting detected"
            );
        }

        // Calibrate on validation only; the ensemble never saw these rows.
        let calibrator = PlattCalibrator::fit(&val_probs, &y_val);

        let holdout_probs: Vec<f64> = x_holdout
            .iter()
            .map(|v| calibrator.calibrate(ensemble.predict_proba(v)))
            .collect();
        let holdout_accuracy = metrics::accuracy(&holdout_probs, &y_holdout);
        let holdout_auc = metrics::approx_auc(&holdout_probs, &y_holdout);
        let holdout_brier = metrics::brier_score(&holdout_probs, &y_holdout);
        let holdout_log_loss = metrics::log_loss(&holdout_probs, &y_holdout);
        info!(
            holdout_accuracy,
            holdout_auc, holdout_brier, holdout_log_loss, "holdout evaluation"
        );

        let mut feature_importance: Vec<(String, f64)> = FEATURE_NAMES
            .iter()
            .zip(ensemble.feature_importances())
            .map(|(name, imp)| (name.to_string(), *imp))
            .collect();
        feature_importance.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(Ordering::Equal));

        let estimators_used = ensemble.estimators_used();

        // Publish: snapshot to disk first, then one atomic swap. A failed
        // write returns here with version and serving model unchanged.
        let trained_at = Utc::now();
        let version;
        {
            let mut s = self.lock_state();
            version = s.model_version + 1;
            let published = Arc::new(PublishedModel {
                ensemble,
                calibrator,
                version,
            });
            if let Some(store) = &s.store {
                save_snapshot(&store.dir.file(MODEL_FILE), published.as_ref())?;
            }
            s.model_version = version;
            s.results_since_train = 0;
            s.last_trained_at = Some(trained_at);

            let meta = ModelMeta {
                model_version: version,
                results_since_train: 0,
                last_trained_at: Some(trained_at),
                is_trained: true,
            };
            if let Some(store) = &s.store {
                if let Err(e) = save_snapshot(&store.dir.file(META_FILE), &meta) {
                    warn!(error = %e, "failed to persist model metadata after train");
                }
            }

            *self.published.write().unwrap_or_else(|e| e.into_inner()) = Some(published);
        }
        info!(version, "model trained and published");

        Ok(TrainMetrics {
            model_version: version,
            total_samples: total,
            train_size: x_train.len(),
            val_size: x_val.len(),
            holdout_size: x_holdout.len(),
            estimators_used,
            cv_accuracy,
            cv_std,
            train_accuracy,
            val_accuracy,
            overfit_gap,
            holdout_accuracy,
            holdout_auc,
            holdout_brier,
            holdout_log_loss,
            win_rate,
            feature_importance,
            trained_at,
        })
    }

    /// Current state for dashboards and the orchestrator.
    pub fn get_status(&self) -> ModelStatus {
        let s = self.lock_state();
        ModelStatus {
            is_trained: s.model_version > 0,
            model_version: s.model_version,
            total_samples: s.records.len(),
            results_since_train: s.results_since_train,
            last_trained_at: s.last_trained_at,
            min_samples_required: self.config.min_training_samples,
            retrain_interval: self.config.retrain_interval,
        }
    }
}

/// Seeded shuffle split into disjoint TRAIN / VALIDATION / HOLDOUT index
/// sets. Validation and holdout are floor-bounded at 5 rows each.
fn split_indices(total: usize, cfg: &ModelConfig) -> (Vec<usize>, Vec<usize>, Vec<usize>) {
    let mut indices: Vec<usize> = (0..total).collect();
    let mut rng = StdRng::seed_from_u64(cfg.seed);
    indices.shuffle(&mut rng);

    let holdout_n = ((total as f64 * cfg.holdout_split) as usize).max(5).min(total);
    let val_n = ((total as f64 * cfg.val_split) as usize).max(5).min(total.saturating_sub(holdout_n));
    let train_n = total - holdout_n - val_n;

    let train = indices[..train_n].to_vec();
    let val = indices[train_n..train_n + val_n].to_vec();
    let holdout = indices[train_n + val_n..].to_vec();
    (train, val, holdout)
}
