//! Continuous model-health monitoring
//!
//! Watches the live prediction stream and runs three independent drift
//! tests over the latest evaluation window of resolved predictions:
//! - Performance floor: rolling accuracy / AUC / Brier against thresholds
//! - Page-Hinkley: sequential change-point test on prediction error
//! - PSI: per-feature distribution shift against baselines frozen when the
//!   window first filled
//!
//! Any trip recommends a retrain; the caller resets the Page-Hinkley
//! accumulator immediately after that retrain publishes.

pub mod drift;

use std::collections::BTreeMap;
use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::config::MonitorConfig;
use crate::error::Result;
use crate::features::{FeatureVector, FEATURE_NAMES, NUM_FEATURES};
use crate::model::metrics;
use crate::store::{load_snapshot, save_snapshot, DataDir, JsonlLog};

use drift::{count_into_bins, psi, FeatureBaseline, PageHinkley};

const PREDICTIONS_FILE: &str = "predictions.jsonl";
const DRIFT_EVENTS_FILE: &str = "drift_events.jsonl";
const BASELINES_FILE: &str = "monitor_baselines.json";

/// One logged prediction, resolved or pending.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggedPrediction {
    pub features: FeatureVector,
    pub predicted_prob: f64,
    pub actual_won: Option<bool>,
    pub game_key: String,
    pub timestamp: DateTime<Utc>,
}

/// Which drift family tripped first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DriftType {
    Performance,
    Concept,
    Calibration,
    Data,
}

/// What the monitor recommends the orchestrator do.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Recommendation {
    Retrain,
    Monitor,
    Ok,
    InsufficientData,
}

/// Metrics snapshot from one health check.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HealthMetrics {
    pub accuracy: f64,
    pub brier_score: f64,
    pub auc_approx: f64,
    pub calibration_error: f64,
    pub resolved_predictions: usize,
    pub window_size: usize,
    /// Present once the Page-Hinkley test has enough observations.
    pub page_hinkley_stat: Option<f64>,
    /// Per-feature-index PSI, present once baselines are frozen.
    pub psi_scores: Option<BTreeMap<usize, f64>>,
}

/// Structured output of [`ModelMonitor::check_health`].
#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub healthy: bool,
    pub drift_detected: bool,
    pub drift_type: Option<DriftType>,
    pub drift_evidence: Vec<String>,
    pub metrics: HealthMetrics,
    pub recommendation: Recommendation,
}

/// Audit entry for one detected drift episode. Never deleted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DriftEvent {
    pub drift_type: DriftType,
    pub evidence: Vec<String>,
    pub metrics: HealthMetrics,
    pub timestamp: DateTime<Utc>,
}

struct MonitorStore {
    predictions: JsonlLog<LoggedPrediction>,
    drift_events: JsonlLog<DriftEvent>,
    dir: DataDir,
}

struct MonitorState {
    predictions: VecDeque<LoggedPrediction>,
    baselines: Option<Vec<FeatureBaseline>>,
    drift_events: Vec<DriftEvent>,
    page_hinkley: PageHinkley,
    store: Option<MonitorStore>,
}

/// Observes the live prediction stream and judges model health.
pub struct ModelMonitor {
    config: MonitorConfig,
    state: Mutex<MonitorState>,
}

impl ModelMonitor {
    /// Ephemeral in-memory monitor.
    pub fn new(config: MonitorConfig) -> Self {
        let ph = PageHinkley::new(config.page_hinkley_delta);
        Self {
            config,
            state: Mutex::new(MonitorState {
                predictions: VecDeque::new(),
                baselines: None,
                drift_events: Vec::new(),
                page_hinkley: ph,
                store: None,
            }),
        }
    }

    /// Open with persistence. The window and Page-Hinkley accumulators are
    /// rebuilt by replaying the retained prediction log in order; frozen
    /// baselines come back from their own snapshot.
    pub fn open(config: MonitorConfig, dir: &DataDir) -> Result<Self> {
        let capacity = config.window_size * 2;
        let predictions_log: JsonlLog<LoggedPrediction> =
            JsonlLog::with_retention(dir.file(PREDICTIONS_FILE), capacity)?;
        let drift_log: JsonlLog<DriftEvent> = JsonlLog::open(dir.file(DRIFT_EVENTS_FILE))?;

        let mut predictions: VecDeque<LoggedPrediction> = predictions_log.replay()?.into();
        while predictions.len() > capacity {
            predictions.pop_front();
        }

        let mut page_hinkley = PageHinkley::new(config.page_hinkley_delta);
        for p in &predictions {
            if let Some(won) = p.actual_won {
                let target = if won { 1.0 } else { 0.0 };
                page_hinkley.observe((p.predicted_prob - target).abs());
            }
        }

        let baselines: Option<Vec<FeatureBaseline>> =
            load_snapshot(&dir.file(BASELINES_FILE)).unwrap_or_else(|e| {
                warn!(error = %e, "baseline snapshot unreadable; refreezing later");
                None
            });
        let drift_events = drift_log.replay()?;

        if !predictions.is_empty() {
            info!(
                predictions = predictions.len(),
                drift_events = drift_events.len(),
                "restored monitor state"
            );
        }

        Ok(Self {
            config,
            state: Mutex::new(MonitorState {
                predictions,
                baselines,
                drift_events,
                page_hinkley,
                store: Some(MonitorStore {
                    predictions: predictions_log,
                    drift_events: drift_log,
                    dir: dir.clone(),
                }),
            }),
        })
    }

    fn lock_state(&self) -> MutexGuard<'_, MonitorState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Log a prediction, persisting before returning. Supply
    /// `actual_won` once the game settles to feed the drift tests.
    pub fn log_prediction(
        &self,
        features: &FeatureVector,
        predicted_prob: f64,
        actual_won: Option<bool>,
        game_key: &str,
    ) {
        let capacity = self.config.window_size * 2;
        let mut s = self.lock_state();

        let entry = LoggedPrediction {
            features: *features,
            predicted_prob,
            actual_won,
            game_key: game_key.to_string(),
            timestamp: Utc::now(),
        };
        s.predictions.push_back(entry.clone());
        while s.predictions.len() > capacity {
            s.predictions.pop_front();
        }

        if let Some(won) = actual_won {
            let target = if won { 1.0 } else { 0.0 };
            s.page_hinkley.observe((predicted_prob - target).abs());
        }

        // Freeze per-feature baselines the first time the window fills.
        if s.baselines.is_none() && s.predictions.len() >= self.config.window_size {
            let baselines = freeze_baselines(&s.predictions, self.config.psi_bins);
            if let Some(store) = &s.store {
                if let Err(e) = save_snapshot(&store.dir.file(BASELINES_FILE), &baselines) {
                    warn!(error = %e, "failed to persist frozen baselines");
                }
            }
            info!(
                window = s.predictions.len(),
                "froze feature baselines for PSI comparison"
            );
            s.baselines = Some(baselines);
        }

        if let Some(store) = &mut s.store {
            if let Err(e) = store.predictions.append(&entry) {
                warn!(error = %e, "failed to persist prediction");
            }
        }
    }

    /// Run every drift test over the latest window of resolved predictions.
    pub fn check_health(&self) -> HealthReport {
        let mut s = self.lock_state();

        let resolved: Vec<LoggedPrediction> = s
            .predictions
            .iter()
            .filter(|p| p.actual_won.is_some())
            .cloned()
            .collect();

        if resolved.len() < self.config.min_resolved {
            return HealthReport {
                healthy: true,
                drift_detected: false,
                drift_type: None,
                drift_evidence: Vec::new(),
                metrics: HealthMetrics {
                    resolved_predictions: resolved.len(),
                    ..Default::default()
                },
                recommendation: Recommendation::InsufficientData,
            };
        }

        let start = resolved.len().saturating_sub(self.config.window_size);
        let recent = &resolved[start..];
        let probs: Vec<f64> = recent.iter().map(|p| p.predicted_prob).collect();
        let actuals: Vec<bool> = recent.iter().map(|p| p.actual_won.unwrap_or(false)).collect();

        let accuracy = metrics::accuracy(&probs, &actuals);
        let brier = metrics::brier_score(&probs, &actuals);
        let auc = metrics::approx_auc(&probs, &actuals);
        let ece = metrics::expected_calibration_error(&probs, &actuals, self.config.ece_bins);

        let mut health = HealthMetrics {
            accuracy,
            brier_score: brier,
            auc_approx: auc,
            calibration_error: ece,
            resolved_predictions: resolved.len(),
            window_size: recent.len(),
            page_hinkley_stat: None,
            psi_scores: None,
        };

        let mut drift_type: Option<DriftType> = None;
        let mut evidence: Vec<String> = Vec::new();

        // Rolling performance floor.
        if accuracy < self.config.min_accuracy {
            drift_type.get_or_insert(DriftType::Performance);
            evidence.push(format!(
                "accuracy {accuracy:.3} < threshold {:.2}",
                self.config.min_accuracy
            ));
        }
        if auc < self.config.min_auc {
            drift_type.get_or_insert(DriftType::Concept);
            evidence.push(format!(
                "AUC {auc:.3} < threshold {:.2}",
                self.config.min_auc
            ));
        }
        if brier > self.config.max_brier {
            drift_type.get_or_insert(DriftType::Calibration);
            evidence.push(format!(
                "Brier {brier:.4} > threshold {:.2}",
                self.config.max_brier
            ));
        }

        // Sequential change-point test.
        if s.page_hinkley.count() >= self.config.page_hinkley_min_obs {
            let stat = s.page_hinkley.statistic();
            health.page_hinkley_stat = Some(stat);
            if stat > self.config.page_hinkley_lambda {
                drift_type.get_or_insert(DriftType::Concept);
                evidence.push(format!(
                    "Page-Hinkley stat {stat:.2} > lambda {:.1}",
                    self.config.page_hinkley_lambda
                ));
            }
        }

        // Feature-distribution shift against the frozen baselines.
        if let Some(baselines) = &s.baselines {
            let rows: Vec<&FeatureVector> = recent.iter().map(|p| &p.features).collect();
            if rows.len() >= self.config.min_resolved {
                let mut scores = BTreeMap::new();
                for (i, baseline) in baselines.iter().enumerate().take(NUM_FEATURES) {
                    let column: Vec<f64> = rows.iter().map(|f| f[i]).collect();
                    let current = count_into_bins(&column, &baseline.bin_edges);
                    let score = psi(&baseline.histogram, &current);
                    scores.insert(i, score);
                    if score > self.config.psi_threshold {
                        drift_type.get_or_insert(DriftType::Data);
                        evidence.push(format!(
                            "feature '{}' PSI {score:.3} > {:.2}",
                            FEATURE_NAMES[i], self.config.psi_threshold
                        ));
                    }
                }
                health.psi_scores = Some(scores);
            }
        }

        let drift_detected = drift_type.is_some();
        let recommendation = if drift_detected {
            warn!(
                drift_type = ?drift_type,
                evidence = ?evidence,
                "drift detected"
            );
            let event = DriftEvent {
                drift_type: drift_type.unwrap_or(DriftType::Performance),
                evidence: evidence.clone(),
                metrics: health.clone(),
                timestamp: Utc::now(),
            };
            s.drift_events.push(event.clone());
            if let Some(store) = &mut s.store {
                if let Err(e) = store.drift_events.append(&event) {
                    warn!(error = %e, "failed to persist drift event");
                }
            }
            Recommendation::Retrain
        } else if accuracy < self.config.watch_accuracy || brier > self.config.watch_brier {
            Recommendation::Monitor
        } else {
            Recommendation::Ok
        };

        HealthReport {
            healthy: !drift_detected,
            drift_detected,
            drift_type,
            drift_evidence: evidence,
            metrics: health,
            recommendation,
        }
    }

    /// Clear the Page-Hinkley accumulators. Call immediately after a
    /// drift-triggered retrain publishes a new model.
    pub fn reset_page_hinkley(&self) {
        let mut s = self.lock_state();
        s.page_hinkley.reset();
        info!("Page-Hinkley accumulator reset after retrain");
    }

    /// The append-only drift audit log.
    pub fn get_drift_history(&self) -> Vec<DriftEvent> {
        self.lock_state().drift_events.clone()
    }
}

fn freeze_baselines(window: &VecDeque<LoggedPrediction>, bins: usize) -> Vec<FeatureBaseline> {
    (0..NUM_FEATURES)
        .map(|i| {
            let column: Vec<f64> = window.iter().map(|p| p.features[i]).collect();
            FeatureBaseline::from_values(&column, bins)
        })
        .collect()
}
