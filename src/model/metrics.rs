//! Classification metrics shared by training and monitoring
//!
//! All helpers are total over their inputs: empty slices and single-class
//! outcome sets return neutral values instead of failing, because these
//! feed advisory status payloads, not assertions.

/// Fraction of probabilities on the correct side of 0.5.
pub fn accuracy(probs: &[f64], actuals: &[bool]) -> f64 {
    if probs.is_empty() {
        return 0.0;
    }
    let correct = probs
        .iter()
        .zip(actuals)
        .filter(|(p, won)| (**p >= 0.5) == **won)
        .count();
    correct as f64 / probs.len() as f64
}

/// Mean squared error between predicted probabilities and outcomes.
pub fn brier_score(probs: &[f64], actuals: &[bool]) -> f64 {
    if probs.is_empty() {
        return 0.0;
    }
    let sum: f64 = probs
        .iter()
        .zip(actuals)
        .map(|(p, won)| {
            let target = if *won { 1.0 } else { 0.0 };
            (p - target) * (p - target)
        })
        .sum();
    sum / probs.len() as f64
}

/// Negative log-likelihood with probabilities clamped away from 0 and 1.
pub fn log_loss(probs: &[f64], actuals: &[bool]) -> f64 {
    if probs.is_empty() {
        return 0.0;
    }
    let sum: f64 = probs
        .iter()
        .zip(actuals)
        .map(|(p, won)| {
            let p = p.clamp(1e-9, 1.0 - 1e-9);
            if *won {
                -p.ln()
            } else {
                -(1.0 - p).ln()
            }
        })
        .sum();
    sum / probs.len() as f64
}

/// AUC approximation via pairwise concordance between positive and negative
/// outcome scores. Returns 0.5 when only one class is present.
pub fn approx_auc(probs: &[f64], actuals: &[bool]) -> f64 {
    let pos: Vec<f64> = probs
        .iter()
        .zip(actuals)
        .filter(|(_, won)| **won)
        .map(|(p, _)| *p)
        .collect();
    let neg: Vec<f64> = probs
        .iter()
        .zip(actuals)
        .filter(|(_, won)| !**won)
        .map(|(p, _)| *p)
        .collect();
    if pos.is_empty() || neg.is_empty() {
        return 0.5;
    }
    let concordant = pos
        .iter()
        .flat_map(|p| neg.iter().map(move |n| (p, n)))
        .filter(|(p, n)| p > n)
        .count();
    concordant as f64 / (pos.len() * neg.len()) as f64
}

/// Expected Calibration Error over fixed-width probability bins.
pub fn expected_calibration_error(probs: &[f64], actuals: &[bool], n_bins: usize) -> f64 {
    if probs.is_empty() || n_bins == 0 {
        return 0.0;
    }
    let width = 1.0 / n_bins as f64;
    let mut weighted_gap = 0.0;
    for bin in 0..n_bins {
        let lo = bin as f64 * width;
        let hi = lo + width;
        let last = bin == n_bins - 1;
        let members: Vec<(f64, bool)> = probs
            .iter()
            .zip(actuals)
            .filter(|(p, _)| **p >= lo && (**p < hi || (last && **p <= hi)))
            .map(|(p, won)| (*p, *won))
            .collect();
        if members.is_empty() {
            continue;
        }
        let avg_pred: f64 = members.iter().map(|(p, _)| p).sum::<f64>() / members.len() as f64;
        let avg_actual =
            members.iter().filter(|(_, won)| *won).count() as f64 / members.len() as f64;
        weighted_gap += members.len() as f64 * (avg_pred - avg_actual).abs();
    }
    weighted_gap / probs.len() as f64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accuracy_counts_correct_side() {
        let probs = [0.9, 0.8, 0.3, 0.6];
        let actuals = [true, false, false, true];
        // 0.9->win ok, 0.8->loss wrong, 0.3->loss ok, 0.6->win ok
        assert!((accuracy(&probs, &actuals) - 0.75).abs() < 1e-12);
        assert_eq!(accuracy(&[], &[]), 0.0);
    }

    #[test]
    fn brier_matches_hand_computation() {
        let probs = [1.0, 0.0];
        let actuals = [true, true];
        // (0^2 + 1^2) / 2
        assert!((brier_score(&probs, &actuals) - 0.5).abs() < 1e-12);
    }

    #[test]
    fn log_loss_penalizes_confident_misses() {
        let good = log_loss(&[0.9], &[true]);
        let bad = log_loss(&[0.1], &[true]);
        assert!(bad > good);
        // Hard zero is clamped, not infinite.
        assert!(log_loss(&[0.0], &[true]).is_finite());
    }

    #[test]
    fn auc_is_concordance() {
        // Positives always scored above negatives: perfect separation.
        let probs = [0.9, 0.8, 0.2, 0.1];
        let actuals = [true, true, false, false];
        assert!((approx_auc(&probs, &actuals) - 1.0).abs() < 1e-12);

        // One discordant pair out of four.
        let probs = [0.9, 0.15, 0.2, 0.1];
        let actuals = [true, true, false, false];
        assert!((approx_auc(&probs, &actuals) - 0.75).abs() < 1e-12);
    }

    #[test]
    fn auc_neutral_on_single_class() {
        assert_eq!(approx_auc(&[0.7, 0.8], &[true, true]), 0.5);
        assert_eq!(approx_auc(&[], &[]), 0.5);
    }

    #[test]
    fn ece_zero_when_perfectly_calibrated_bins() {
        // One bin at 0.5 with a 50% hit rate.
        let probs = [0.5, 0.5];
        let actuals = [true, false];
        assert!(expected_calibration_error(&probs, &actuals, 5) < 1e-12);
    }

    #[test]
    fn ece_large_when_confident_and_wrong() {
        let probs = [0.95; 10];
        let actuals = [false; 10];
        let ece = expected_calibration_error(&probs, &actuals, 5);
        assert!(ece > 0.9);
    }

    #[test]
    fn ece_includes_probability_one() {
        // p == 1.0 must land in the last bin rather than fall off the edge.
        let probs = [1.0, 1.0];
        let actuals = [true, true];
        assert!(expected_calibration_error(&probs, &actuals, 5) < 1e-12);
    }
}
