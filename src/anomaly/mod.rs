//! Unsupervised anomaly detection on game feature vectors
//!
//! Two layers, no labels required:
//! 1. An isolation forest learns what normal game profiles look like and
//!    votes on outliers
//! 2. Per-feature z-scores against the fitted baseline identify WHICH
//!    columns are unusual (sharp line moves, book disagreements, strange
//!    public splits)
//!
//! A vector is anomalous if the forest says so OR at least three features
//! sit past the z-score threshold; either condition alone suffices.

pub mod forest;

use std::collections::HashMap;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, RwLock};

use chrono::{DateTime, Utc};
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::config::AnomalyConfig;
use crate::error::Result;
use crate::features::{FeatureVector, FEATURE_NAMES, NUM_FEATURES};
use crate::store::{load_snapshot, save_snapshot, DataDir, JsonlLog};

use forest::IsolationForest;

const POOL_FILE: &str = "anomaly_pool.jsonl";
const AUDIT_FILE: &str = "anomalies.jsonl";
const SNAPSHOT_FILE: &str = "anomaly_model.json";

/// Severity band for a single feature's z-score.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Severity {
    Extreme,
    High,
    Moderate,
    Low,
}

impl Severity {
    pub fn from_z(z: f64) -> Self {
        let z = z.abs();
        if z >= 4.0 {
            Severity::Extreme
        } else if z >= 3.0 {
            Severity::High
        } else if z >= 2.5 {
            Severity::Moderate
        } else {
            Severity::Low
        }
    }
}

/// One of the top contributing features in a detection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeatureAnomaly {
    pub feature: String,
    pub z_score: f64,
    pub severity: Severity,
}

/// Structured output of [`AnomalyDetector::detect`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnomalyReport {
    pub is_anomaly: bool,
    /// Forest decision margin; more negative is more anomalous.
    pub anomaly_score: f64,
    /// Features past the z-score threshold.
    pub anomalous_features: Vec<String>,
    pub z_scores: HashMap<String, f64>,
    /// The three most extreme features, whatever their severity.
    pub top_anomalies: Vec<FeatureAnomaly>,
    pub game_key: String,
    /// Set when the detector degraded to the safe default.
    pub reason: Option<String>,
    /// Set when the report was flagged and logged.
    pub timestamp: Option<DateTime<Utc>>,
}

impl AnomalyReport {
    fn not_fitted(game_key: &str) -> Self {
        Self {
            is_anomaly: false,
            anomaly_score: 0.0,
            anomalous_features: Vec::new(),
            z_scores: HashMap::new(),
            top_anomalies: Vec::new(),
            game_key: game_key.to_string(),
            reason: Some("detector not yet fitted".to_string()),
            timestamp: None,
        }
    }
}

/// Detector state for dashboards.
#[derive(Debug, Clone, Serialize)]
pub struct DetectorStatus {
    pub is_fitted: bool,
    pub fit_count: usize,
    pub historical_samples: usize,
    pub detected_anomalies: usize,
    pub min_samples_required: usize,
    pub contamination: f64,
}

/// One pooled vector, as persisted to the pool log.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct PoolEntry {
    features: FeatureVector,
    game_key: String,
}

/// The atomically-published fitted tuple: forest plus z-score baseline.
#[derive(Debug, Serialize, Deserialize)]
struct FittedDetector {
    forest: IsolationForest,
    baseline_mean: Vec<f64>,
    baseline_std: Vec<f64>,
    fit_count: usize,
}

struct DetectorStore {
    pool: JsonlLog<PoolEntry>,
    audit: JsonlLog<AnomalyReport>,
    dir: DataDir,
}

struct DetectorState {
    pool: VecDeque<PoolEntry>,
    ingested_total: usize,
    fit_count: usize,
    detected: VecDeque<AnomalyReport>,
    store: Option<DetectorStore>,
}

/// Unsupervised outlier model over accumulated feature vectors.
pub struct AnomalyDetector {
    config: AnomalyConfig,
    state: Mutex<DetectorState>,
    fitted: RwLock<Option<Arc<FittedDetector>>>,
}

impl AnomalyDetector {
    /// Ephemeral in-memory detector.
    pub fn new(config: AnomalyConfig) -> Self {
        Self {
            config,
            state: Mutex::new(DetectorState {
                pool: VecDeque::new(),
                ingested_total: 0,
                fit_count: 0,
                detected: VecDeque::new(),
                store: None,
            }),
            fitted: RwLock::new(None),
        }
    }

    /// Open with persistence: replays the pool and audit logs and restores
    /// the last fitted snapshot, if any.
    pub fn open(config: AnomalyConfig, dir: &DataDir) -> Result<Self> {
        let pool_log: JsonlLog<PoolEntry> =
            JsonlLog::with_retention(dir.file(POOL_FILE), config.pool_capacity)?;
        let audit_log: JsonlLog<AnomalyReport> =
            JsonlLog::with_retention(dir.file(AUDIT_FILE), config.audit_capacity)?;

        let mut pool: VecDeque<PoolEntry> = pool_log.replay()?.into();
        while pool.len() > config.pool_capacity {
            pool.pop_front();
        }
        let mut detected: VecDeque<AnomalyReport> = audit_log.replay()?.into();
        while detected.len() > config.audit_capacity {
            detected.pop_front();
        }

        let fitted: Option<FittedDetector> = match load_snapshot(&dir.file(SNAPSHOT_FILE)) {
            Ok(f) => f,
            Err(e) => {
                warn!(error = %e, "anomaly snapshot unreadable; starting unfitted");
                None
            }
        };
        let fit_count = fitted.as_ref().map(|f| f.fit_count).unwrap_or(0);

        if !pool.is_empty() {
            info!(
                samples = pool.len(),
                anomalies = detected.len(),
                fit_count,
                "restored anomaly detector state"
            );
        }

        Ok(Self {
            config,
            state: Mutex::new(DetectorState {
                ingested_total: pool.len(),
                pool,
                fit_count,
                detected,
                store: Some(DetectorStore {
                    pool: pool_log,
                    audit: audit_log,
                    dir: dir.clone(),
                }),
            }),
            fitted: RwLock::new(fitted.map(Arc::new)),
        })
    }

    fn lock_state(&self) -> MutexGuard<'_, DetectorState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn read_fitted(&self) -> Option<Arc<FittedDetector>> {
        self.fitted.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Add a game's features to the historical pool, persisting before
    /// returning. Auto-(re)fits every `min_fit_samples` ingests once the
    /// pool is large enough.
    pub fn ingest(&self, features: &FeatureVector, game_key: &str) {
        let should_fit = {
            let mut s = self.lock_state();
            let entry = PoolEntry {
                features: *features,
                game_key: game_key.to_string(),
            };
            s.pool.push_back(entry.clone());
            while s.pool.len() > self.config.pool_capacity {
                s.pool.pop_front();
            }
            s.ingested_total += 1;
            if let Some(store) = &mut s.store {
                if let Err(e) = store.pool.append(&entry) {
                    warn!(error = %e, "failed to persist pool entry");
                }
            }

            let fitted = self.read_fitted().is_some();
            s.pool.len() >= self.config.min_fit_samples
                && (!fitted || s.ingested_total % self.config.min_fit_samples == 0)
        };

        if should_fit {
            self.fit(None);
        }
    }

    /// Fit the forest and z-score baseline.
    ///
    /// Uses the accumulated pool unless an explicit matrix is supplied.
    /// Warns and no-ops below `min_fit_samples`. The new tuple is built
    /// entirely off-lock and published in one swap.
    pub fn fit(&self, explicit: Option<&[FeatureVector]>) {
        let (data, fit_count) = {
            let s = self.lock_state();
            let data: Vec<FeatureVector> = match explicit {
                Some(m) => m.to_vec(),
                None => s.pool.iter().map(|e| e.features).collect(),
            };
            (data, s.fit_count)
        };

        if data.len() < self.config.min_fit_samples {
            warn!(
                samples = data.len(),
                needed = self.config.min_fit_samples,
                "not enough samples to fit anomaly detector"
            );
            return;
        }

        let mut rng = StdRng::seed_from_u64(self.config.seed);
        let forest = IsolationForest::fit(&data, &self.config, &mut rng);
        let (baseline_mean, baseline_std) = column_stats(&data);
        let fitted = Arc::new(FittedDetector {
            forest,
            baseline_mean,
            baseline_std,
            fit_count: fit_count + 1,
        });

        {
            let mut s = self.lock_state();
            s.fit_count += 1;
            if let Some(store) = &s.store {
                if let Err(e) = save_snapshot(&store.dir.file(SNAPSHOT_FILE), fitted.as_ref()) {
                    warn!(error = %e, "failed to persist anomaly snapshot");
                }
            }
            *self.fitted.write().unwrap_or_else(|e| e.into_inner()) = Some(fitted);
            info!(
                samples = data.len(),
                fit_count = s.fit_count,
                "anomaly detector fitted"
            );
        }
    }

    /// Score one vector. Safe default (non-anomalous, with a reason) before
    /// any fit; never an error.
    pub fn detect(&self, features: &FeatureVector, game_key: &str) -> AnomalyReport {
        let fitted = match self.read_fitted() {
            Some(f) => f,
            None => return AnomalyReport::not_fitted(game_key),
        };

        let score = fitted.forest.decision_function(features);
        let forest_vote = fitted.forest.is_outlier(features);

        let mut z_scores = HashMap::with_capacity(NUM_FEATURES);
        let mut ranked: Vec<(usize, f64)> = Vec::with_capacity(NUM_FEATURES);
        let mut anomalous_features = Vec::new();
        for i in 0..NUM_FEATURES {
            let z = (features[i] - fitted.baseline_mean[i]) / fitted.baseline_std[i];
            z_scores.insert(FEATURE_NAMES[i].to_string(), z);
            ranked.push((i, z));
            if z.abs() > self.config.z_score_threshold {
                anomalous_features.push(FEATURE_NAMES[i].to_string());
            }
        }
        ranked.sort_by(|a, b| {
            b.1.abs()
                .partial_cmp(&a.1.abs())
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        let top_anomalies: Vec<FeatureAnomaly> = ranked
            .iter()
            .take(3)
            .map(|(i, z)| FeatureAnomaly {
                feature: FEATURE_NAMES[*i].to_string(),
                z_score: *z,
                severity: Severity::from_z(*z),
            })
            .collect();

        let is_anomaly = forest_vote || anomalous_features.len() >= self.config.z_feature_count;
        let mut report = AnomalyReport {
            is_anomaly,
            anomaly_score: score,
            anomalous_features,
            z_scores,
            top_anomalies,
            game_key: game_key.to_string(),
            reason: None,
            timestamp: None,
        };

        if report.is_anomaly {
            report.timestamp = Some(Utc::now());
            warn!(
                game_key,
                score,
                features = ?report.anomalous_features,
                "anomaly detected"
            );
            let mut s = self.lock_state();
            s.detected.push_back(report.clone());
            while s.detected.len() > self.config.audit_capacity {
                s.detected.pop_front();
            }
            if let Some(store) = &mut s.store {
                if let Err(e) = store.audit.append(&report) {
                    warn!(error = %e, "failed to persist anomaly report");
                }
            }
        }

        report
    }

    /// Score a slate of games, order preserved. Missing keys score with an
    /// empty key.
    pub fn detect_batch(&self, rows: &[FeatureVector], game_keys: &[String]) -> Vec<AnomalyReport> {
        rows.iter()
            .enumerate()
            .map(|(i, row)| {
                let key = game_keys.get(i).map(String::as_str).unwrap_or("");
                self.detect(row, key)
            })
            .collect()
    }

    pub fn get_status(&self) -> DetectorStatus {
        let s = self.lock_state();
        DetectorStatus {
            is_fitted: self.read_fitted().is_some(),
            fit_count: s.fit_count,
            historical_samples: s.pool.len(),
            detected_anomalies: s.detected.len(),
            min_samples_required: self.config.min_fit_samples,
            contamination: self.config.contamination,
        }
    }
}

/// Per-column mean and std over the pool, std floored away from zero.
fn column_stats(data: &[FeatureVector]) -> (Vec<f64>, Vec<f64>) {
    let n = data.len() as f64;
    let mut mean = vec![0.0; NUM_FEATURES];
    for row in data {
        for (m, v) in mean.iter_mut().zip(row.as_slice()) {
            *m += v;
        }
    }
    for m in &mut mean {
        *m /= n;
    }
    let mut std = vec![0.0; NUM_FEATURES];
    for row in data {
        for i in 0..NUM_FEATURES {
            let d = row[i] - mean[i];
            std[i] += d * d;
        }
    }
    for s in &mut std {
        *s = (*s / n).sqrt() + 1e-8;
    }
    (mean, std)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::Rng;

    /// Tight cluster: every feature near 10 with +/-0.25 of jitter.
    fn clustered(n: usize, seed: u64) -> Vec<FeatureVector> {
        let mut rng = StdRng::seed_from_u64(seed);
        (0..n)
            .map(|_| {
                let mut row = [0.0; NUM_FEATURES];
                for v in row.iter_mut() {
                    *v = 10.0 + (rng.gen::<f64>() - 0.5) * 0.5;
                }
                FeatureVector(row)
            })
            .collect()
    }

    #[test]
    fn detect_before_fit_is_a_safe_default() {
        let detector = AnomalyDetector::new(AnomalyConfig::default());
        let report = detector.detect(&FeatureVector::zeros(), "LAL@BOS");
        assert!(!report.is_anomaly);
        assert_eq!(report.anomaly_score, 0.0);
        assert!(report.anomalous_features.is_empty());
        assert!(report.reason.is_some());
        assert_eq!(report.game_key, "LAL@BOS");
    }

    #[test]
    fn fit_below_minimum_is_a_noop() {
        let detector = AnomalyDetector::new(AnomalyConfig::default());
        for (i, v) in clustered(10, 1).iter().enumerate() {
            detector.ingest(v, &format!("g{i}"));
        }
        detector.fit(None);
        let status = detector.get_status();
        assert!(!status.is_fitted);
        assert_eq!(status.fit_count, 0);
    }

    #[test]
    fn ten_sigma_outlier_is_flagged_with_extreme_features() {
        let detector = AnomalyDetector::new(AnomalyConfig::default());
        let data = clustered(50, 2);
        detector.fit(Some(&data));
        assert!(detector.get_status().is_fitted);

        // Mean ~10, std ~0.14: +10 sigma on every feature.
        let outlier = FeatureVector([11.5; NUM_FEATURES]);
        let report = detector.detect(&outlier, "weird-game");
        assert!(report.is_anomaly);
        assert!(report.anomalous_features.len() >= 1);
        assert!(report
            .z_scores
            .values()
            .any(|z| z.abs() > 2.5));
        assert_eq!(report.top_anomalies.len(), 3);
        assert_eq!(report.top_anomalies[0].severity, Severity::Extreme);
        assert!(report.timestamp.is_some());
    }

    #[test]
    fn cluster_member_is_not_flagged() {
        let detector = AnomalyDetector::new(AnomalyConfig::default());
        let data = clustered(100, 3);
        detector.fit(Some(&data));
        let report = detector.detect(&data[50], "normal-game");
        // A mid-cluster member has near-zero z-scores everywhere.
        assert!(report.anomalous_features.is_empty());
        assert!(report.z_scores.values().all(|z| z.abs() < 2.5));
    }

    #[test]
    fn auto_fit_triggers_on_pool_growth_and_refits_every_interval() {
        let detector = AnomalyDetector::new(AnomalyConfig::default());
        let data = clustered(60, 4);
        for (i, v) in data.iter().take(29).enumerate() {
            detector.ingest(v, &format!("g{i}"));
        }
        assert_eq!(detector.get_status().fit_count, 0);

        detector.ingest(&data[29], "g29");
        assert_eq!(detector.get_status().fit_count, 1);

        // 30 more ingests: second fit at ingest 60.
        for (i, v) in data.iter().skip(30).enumerate() {
            detector.ingest(v, &format!("h{i}"));
        }
        assert_eq!(detector.get_status().fit_count, 2);
        assert_eq!(detector.get_status().historical_samples, 60);
    }

    #[test]
    fn detect_batch_preserves_order() {
        let detector = AnomalyDetector::new(AnomalyConfig::default());
        let data = clustered(40, 5);
        detector.fit(Some(&data));

        let rows = vec![data[0], FeatureVector([99.0; NUM_FEATURES]), data[1]];
        let keys = vec!["a".to_string(), "b".to_string(), "c".to_string()];
        let reports = detector.detect_batch(&rows, &keys);
        assert_eq!(reports.len(), 3);
        assert_eq!(reports[0].game_key, "a");
        assert_eq!(reports[1].game_key, "b");
        assert_eq!(reports[2].game_key, "c");
        assert!(reports[1].is_anomaly);
    }

    #[test]
    fn audit_log_is_bounded() {
        let mut config = AnomalyConfig::default();
        config.audit_capacity = 5;
        let detector = AnomalyDetector::new(config);
        let data = clustered(40, 6);
        detector.fit(Some(&data));

        for i in 0..20 {
            let outlier = FeatureVector([50.0 + i as f64; NUM_FEATURES]);
            let report = detector.detect(&outlier, &format!("o{i}"));
            assert!(report.is_anomaly);
        }
        assert_eq!(detector.get_status().detected_anomalies, 5);
    }

    #[test]
    fn persistence_round_trip_restores_pool_and_fit() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = DataDir::open(tmp.path()).unwrap();
        {
            let detector = AnomalyDetector::open(AnomalyConfig::default(), &dir).unwrap();
            for (i, v) in clustered(35, 7).iter().enumerate() {
                detector.ingest(v, &format!("g{i}"));
            }
            assert!(detector.get_status().is_fitted);
        }
        let reopened = AnomalyDetector::open(AnomalyConfig::default(), &dir).unwrap();
        let status = reopened.get_status();
        assert_eq!(status.historical_samples, 35);
        assert!(status.is_fitted);
        assert!(status.fit_count >= 1);

        // Restored forest still detects without a refit.
        let report = reopened.detect(&FeatureVector([99.0; NUM_FEATURES]), "after-restart");
        assert!(report.is_anomaly);
    }
}
