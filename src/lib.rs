//! ML core for the sharpline sports-analytics pipeline
//!
//! Consumes per-game betting-market data (odds, public splits, detected
//! market signals, schedule context) and produces:
//! - Win-probability predictions from a gradient-boosted classifier with
//!   calibrated probabilities and anti-overfitting guards
//! - Unsupervised anomaly flags from an isolation-forest detector
//! - Continuous drift judgments (performance floor, Page-Hinkley,
//!   feature-distribution PSI) recommending when to retrain
//!
//! Scraping, the rule-based signal engine, alerting, and scheduling live in
//! sibling services; this crate only consumes their outputs as feature
//! inputs and returns structured, serializable payloads.

pub mod anomaly;
pub mod config;
pub mod engine;
pub mod error;
pub mod features;
pub mod model;
pub mod monitor;
pub mod store;

pub use anomaly::{AnomalyDetector, AnomalyReport, DetectorStatus, Severity};
pub use config::{AnomalyConfig, EngineConfig, ModelConfig, MonitorConfig};
pub use engine::{EngineStatus, GameAnalysis, PickEngine};
pub use error::{EngineError, Result};
pub use features::{
    FeatureEngine, FeatureVector, GameContext, GameInput, OddsData, Signal, SignalCategory,
    SignalKind, SignalProfile, FEATURE_NAMES, NUM_FEATURES,
};
pub use model::{
    Confidence, ModelStatus, PickModel, Prediction, RecordStatus, TrainMetrics, TrainOutcome,
    TrainingRecord,
};
pub use monitor::{
    DriftEvent, DriftType, HealthMetrics, HealthReport, LoggedPrediction, ModelMonitor,
    Recommendation,
};
