//! Probability calibration (Platt scaling)
//!
//! Maps raw ensemble scores to well-calibrated probabilities by fitting a
//! sigmoid `p = 1 / (1 + exp(-(a*score + b)))` on held-out validation
//! pairs the ensemble never trained on. Calibrated probabilities are what
//! the confidence bands and Brier/ECE monitoring are judged against.

use serde::{Deserialize, Serialize};

use crate::model::boosting::sigmoid;

/// Gradient-descent schedule for the two-parameter sigmoid fit.
const FIT_ITERATIONS: usize = 500;
const FIT_LEARNING_RATE: f64 = 0.1;

/// Calibrated outputs are clamped inside the open unit interval.
const PROB_FLOOR: f64 = 0.001;
const PROB_CEIL: f64 = 0.999;

/// A fitted Platt calibrator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlattCalibrator {
    a: f64,
    b: f64,
    samples_fit: usize,
}

impl Default for PlattCalibrator {
    fn default() -> Self {
        // Near-identity sigmoid around 0.5 until fitted.
        Self {
            a: 1.0,
            b: -0.5,
            samples_fit: 0,
        }
    }
}

impl PlattCalibrator {
    /// Fit on (raw score, outcome) pairs from the validation slice.
    pub fn fit(scores: &[f64], outcomes: &[bool]) -> Self {
        let mut cal = Self::default();
        if scores.is_empty() || scores.len() != outcomes.len() {
            return cal;
        }

        let n = scores.len() as f64;
        for _ in 0..FIT_ITERATIONS {
            let mut grad_a = 0.0;
            let mut grad_b = 0.0;
            for (score, won) in scores.iter().zip(outcomes) {
                let pred = sigmoid(cal.a * score + cal.b);
                let target = if *won { 1.0 } else { 0.0 };
                let err = pred - target;
                grad_a += err * score;
                grad_b += err;
            }
            cal.a -= FIT_LEARNING_RATE * grad_a / n;
            cal.b -= FIT_LEARNING_RATE * grad_b / n;
        }

        cal.samples_fit = scores.len();
        cal
    }

    /// Map a raw score to a calibrated probability.
    pub fn calibrate(&self, raw: f64) -> f64 {
        sigmoid(self.a * raw + self.b).clamp(PROB_FLOOR, PROB_CEIL)
    }

    pub fn samples_fit(&self) -> usize {
        self.samples_fit
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unfitted_calibrator_is_gentle_and_bounded() {
        let cal = PlattCalibrator::default();
        let mid = cal.calibrate(0.5);
        assert!((mid - 0.5).abs() < 0.01);
        assert!(cal.calibrate(-100.0) >= PROB_FLOOR);
        assert!(cal.calibrate(100.0) <= PROB_CEIL);
    }

    #[test]
    fn fit_preserves_monotonicity_on_informative_scores() {
        // Higher raw score, higher win rate.
        let scores: Vec<f64> = (0..100).map(|i| i as f64 / 100.0).collect();
        let outcomes: Vec<bool> = (0..100).map(|i| i % 100 >= 40).collect();
        let cal = PlattCalibrator::fit(&scores, &outcomes);

        let lo = cal.calibrate(0.1);
        let mid = cal.calibrate(0.5);
        let hi = cal.calibrate(0.9);
        assert!(lo <= mid && mid <= hi);
    }

    #[test]
    fn fit_pulls_overconfident_scores_toward_base_rate() {
        // Scores say 0.9 but the outcome is a coin flip.
        let scores = vec![0.9; 200];
        let outcomes: Vec<bool> = (0..200).map(|i| i % 2 == 0).collect();
        let cal = PlattCalibrator::fit(&scores, &outcomes);
        let p = cal.calibrate(0.9);
        assert!(
            (p - 0.5).abs() < 0.1,
            "calibrated {p}, expected near the 0.5 base rate"
        );
    }

    #[test]
    fn degenerate_input_falls_back_to_default() {
        let cal = PlattCalibrator::fit(&[], &[]);
        assert_eq!(cal.samples_fit(), 0);
        let mismatched = PlattCalibrator::fit(&[0.5], &[]);
        assert_eq!(mismatched.samples_fit(), 0);
    }

    #[test]
    fn output_always_in_clamped_range() {
        let scores = vec![0.2, 0.8];
        let outcomes = vec![false, true];
        let cal = PlattCalibrator::fit(&scores, &outcomes);
        for raw in [-10.0, 0.0, 0.3, 0.7, 1.0, 10.0] {
            let p = cal.calibrate(raw);
            assert!((PROB_FLOOR..=PROB_CEIL).contains(&p));
        }
    }
}
