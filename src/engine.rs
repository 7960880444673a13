//! Engine facade wiring the four ML components together
//!
//! One explicitly-constructed instance bundles the feature engine, pick
//! model, anomaly detector, and drift monitor, so the orchestrator threads
//! a single handle through its constructor instead of touching global
//! state. The facade also owns the one cross-component invariant: the
//! Page-Hinkley accumulator resets only immediately after a
//! drift-triggered retrain actually publishes.

use std::collections::HashMap;

use serde::Serialize;
use tracing::info;

use crate::anomaly::{AnomalyDetector, AnomalyReport, DetectorStatus};
use crate::config::EngineConfig;
use crate::error::{EngineError, Result};
use crate::features::{FeatureEngine, FeatureVector, GameInput};
use crate::model::{ModelStatus, PickModel, Prediction, RecordStatus, TrainOutcome};
use crate::monitor::{HealthReport, ModelMonitor, Recommendation};
use crate::store::DataDir;

/// Combined analysis payload for one game.
#[derive(Debug, Clone, Serialize)]
pub struct GameAnalysis {
    pub game_key: String,
    pub features: FeatureVector,
    pub prediction: Prediction,
    pub anomaly: AnomalyReport,
}

/// Aggregated component statuses.
#[derive(Debug, Clone, Serialize)]
pub struct EngineStatus {
    pub model: ModelStatus,
    pub anomaly: DetectorStatus,
    pub drift_events: usize,
}

/// The ML core as one handle: analyze games, record outcomes, retrain on
/// drift.
pub struct PickEngine {
    features: FeatureEngine,
    model: PickModel,
    anomaly: AnomalyDetector,
    monitor: ModelMonitor,
}

impl PickEngine {
    /// Fully in-memory engine (tests, backtests, dry runs).
    pub fn new(config: EngineConfig) -> Self {
        Self {
            features: FeatureEngine::new(),
            model: PickModel::new(config.model),
            anomaly: AnomalyDetector::new(config.anomaly),
            monitor: ModelMonitor::new(config.monitor),
        }
    }

    /// Engine with synchronous persistence under `config.data_dir`.
    pub fn open(config: EngineConfig) -> Result<Self> {
        let root = config.data_dir.clone().ok_or_else(|| {
            EngineError::Persistence("engine config has no data_dir".to_string())
        })?;
        let dir = DataDir::open(root)?;
        info!(dir = %dir.root().display(), "opening pick engine");
        Ok(Self {
            features: FeatureEngine::new(),
            model: PickModel::open(config.model, &dir)?,
            anomaly: AnomalyDetector::open(config.anomaly, &dir)?,
            monitor: ModelMonitor::open(config.monitor, &dir)?,
        })
    }

    /// Analysis-time path: extract, predict, pool, and anomaly-check one
    /// game. Never fails; degraded components return neutral payloads.
    pub fn analyze(&self, game: &GameInput) -> GameAnalysis {
        let features = self.features.extract_game(game);
        let prediction = self.model.predict(&features);
        self.anomaly.ingest(&features, &game.game_key);
        let anomaly = self.anomaly.detect(&features, &game.game_key);
        GameAnalysis {
            game_key: game.game_key.clone(),
            features,
            prediction,
            anomaly,
        }
    }

    /// Settlement-time path: record the outcome for training and feed the
    /// drift monitor. `predicted_prob` is the probability served at
    /// analysis time.
    pub fn record_result(
        &self,
        game: &GameInput,
        predicted_prob: f64,
        won: bool,
        pick_type: &str,
        metadata: HashMap<String, String>,
    ) -> RecordStatus {
        let features = self.features.extract_game(game);
        let status = self
            .model
            .record(&features, won, &game.game_key, pick_type, metadata);
        self.monitor
            .log_prediction(&features, predicted_prob, Some(won), &game.game_key);
        status
    }

    /// Run the health check and act on its recommendation: a retrain is
    /// attempted, and only a published new version resets Page-Hinkley.
    pub fn check_and_retrain(&self) -> (HealthReport, Option<TrainOutcome>) {
        let report = self.monitor.check_health();
        if report.recommendation != Recommendation::Retrain {
            return (report, None);
        }

        info!(
            drift_type = ?report.drift_type,
            "drift recommendation: retraining"
        );
        let outcome = self.model.train();
        if outcome.is_trained() {
            self.monitor.reset_page_hinkley();
        }
        (report, Some(outcome))
    }

    pub fn status(&self) -> EngineStatus {
        EngineStatus {
            model: self.model.get_status(),
            anomaly: self.anomaly.get_status(),
            drift_events: self.monitor.get_drift_history().len(),
        }
    }

    pub fn feature_engine(&self) -> &FeatureEngine {
        &self.features
    }

    pub fn model(&self) -> &PickModel {
        &self.model
    }

    pub fn anomaly_detector(&self) -> &AnomalyDetector {
        &self.anomaly
    }

    pub fn monitor(&self) -> &ModelMonitor {
        &self.monitor
    }
}
