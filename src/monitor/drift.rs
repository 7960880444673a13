//! Streaming drift statistics
//!
//! The sequential Page-Hinkley accumulator over prediction error, plus the
//! histogram / PSI machinery used for feature-distribution drift.

use serde::{Deserialize, Serialize};

/// Page-Hinkley test for an upward shift in the mean of a scalar stream.
///
/// Tracks the cumulative deviation of observations from their running mean
/// (minus a sensitivity term) and its running minimum; the test statistic
/// is the gap between the two. Reset only immediately after a
/// drift-triggered retrain, so the accumulator always reflects the serving
/// model's own error stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PageHinkley {
    delta: f64,
    sum: f64,
    min: f64,
    count: usize,
    mean: f64,
}

impl PageHinkley {
    pub fn new(delta: f64) -> Self {
        Self {
            delta,
            sum: 0.0,
            min: f64::INFINITY,
            count: 0,
            mean: 0.0,
        }
    }

    /// Feed one error observation.
    pub fn observe(&mut self, error: f64) {
        self.count += 1;
        self.mean += (error - self.mean) / self.count as f64;
        self.sum += error - self.mean - self.delta;
        self.min = self.min.min(self.sum);
    }

    /// Current test statistic: cumulative deviation minus its running
    /// minimum. Zero before any observation.
    pub fn statistic(&self) -> f64 {
        if self.count == 0 {
            return 0.0;
        }
        self.sum - self.min
    }

    pub fn count(&self) -> usize {
        self.count
    }

    /// Clear all accumulators (new baseline after a retrain).
    pub fn reset(&mut self) {
        self.sum = 0.0;
        self.min = f64::INFINITY;
        self.count = 0;
        self.mean = 0.0;
    }
}

/// Frozen distribution for one feature column.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeatureBaseline {
    pub mean: f64,
    pub std: f64,
    pub histogram: Vec<f64>,
    pub bin_edges: Vec<f64>,
}

impl FeatureBaseline {
    /// Freeze a column's distribution into `bins` equal-width bins.
    pub fn from_values(values: &[f64], bins: usize) -> Self {
        let n = values.len() as f64;
        let mean = values.iter().sum::<f64>() / n.max(1.0);
        let var = values.iter().map(|v| (v - mean) * (v - mean)).sum::<f64>() / n.max(1.0);
        let (histogram, bin_edges) = histogram(values, bins);
        Self {
            mean,
            std: var.sqrt() + 1e-8,
            histogram,
            bin_edges,
        }
    }
}

/// Equal-width histogram over `[min, max]`; a constant column widens to a
/// unit range around the value. Returns (counts, edges).
pub fn histogram(values: &[f64], bins: usize) -> (Vec<f64>, Vec<f64>) {
    let bins = bins.max(1);
    if values.is_empty() {
        return (vec![0.0; bins], linspace(0.0, 1.0, bins + 1));
    }
    let mut lo = values.iter().copied().fold(f64::INFINITY, f64::min);
    let mut hi = values.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    if hi - lo <= f64::EPSILON {
        lo -= 0.5;
        hi += 0.5;
    }
    let edges = linspace(lo, hi, bins + 1);
    (count_into_bins(values, &edges), edges)
}

/// Count values into pre-frozen bin edges. Values outside the edge range
/// are dropped, matching how the baseline was built; the rightmost bin is
/// closed on both sides.
pub fn count_into_bins(values: &[f64], edges: &[f64]) -> Vec<f64> {
    let bins = edges.len().saturating_sub(1);
    let mut counts = vec![0.0; bins];
    if bins == 0 {
        return counts;
    }
    for &v in values {
        if v < edges[0] || v > edges[bins] {
            continue;
        }
        let mut idx = bins - 1;
        for b in 0..bins {
            if v < edges[b + 1] {
                idx = b;
                break;
            }
        }
        counts[idx] += 1.0;
    }
    counts
}

/// Population Stability Index between two binned distributions.
///
/// Both histograms are normalized to proportions and clamped away from
/// zero before the log, so empty bins contribute a large-but-finite term.
pub fn psi(baseline_counts: &[f64], current_counts: &[f64]) -> f64 {
    let base_total: f64 = baseline_counts.iter().sum::<f64>() + 1e-8;
    let curr_total: f64 = current_counts.iter().sum::<f64>() + 1e-8;
    baseline_counts
        .iter()
        .zip(current_counts)
        .map(|(b, c)| {
            let bp = (b / base_total).clamp(1e-6, 1.0);
            let cp = (c / curr_total).clamp(1e-6, 1.0);
            (cp - bp) * (cp / bp).ln()
        })
        .sum()
}

fn linspace(lo: f64, hi: f64, points: usize) -> Vec<f64> {
    if points < 2 {
        return vec![lo];
    }
    let step = (hi - lo) / (points - 1) as f64;
    (0..points).map(|i| lo + step * i as f64).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn page_hinkley_quiet_on_stable_stream() {
        let mut ph = PageHinkley::new(0.005);
        for _ in 0..200 {
            ph.observe(0.3);
        }
        assert!(ph.statistic() < 1.0, "stat {} on a flat stream", ph.statistic());
        assert_eq!(ph.count(), 200);
    }

    #[test]
    fn page_hinkley_trips_on_sustained_error_shift() {
        let mut ph = PageHinkley::new(0.005);
        // Calm period establishes a low mean...
        for _ in 0..100 {
            ph.observe(0.1);
        }
        // ...then the model starts missing badly.
        for _ in 0..400 {
            ph.observe(0.9);
        }
        assert!(
            ph.statistic() > 50.0,
            "stat {} should exceed lambda after a sustained shift",
            ph.statistic()
        );
    }

    #[test]
    fn page_hinkley_reset_clears_state() {
        let mut ph = PageHinkley::new(0.005);
        for _ in 0..50 {
            ph.observe(0.8);
        }
        ph.reset();
        assert_eq!(ph.count(), 0);
        assert_eq!(ph.statistic(), 0.0);
    }

    #[test]
    fn histogram_covers_range_and_constant_columns() {
        let (counts, edges) = histogram(&[1.0, 2.0, 3.0, 4.0], 4);
        assert_eq!(counts.len(), 4);
        assert_eq!(edges.len(), 5);
        assert_eq!(counts.iter().sum::<f64>(), 4.0);

        // Constant column gets a widened range instead of zero-width bins.
        let (counts, edges) = histogram(&[7.0; 10], 10);
        assert_eq!(counts.iter().sum::<f64>(), 10.0);
        assert!(edges[0] < 7.0 && *edges.last().unwrap() > 7.0);
    }

    #[test]
    fn count_into_bins_drops_out_of_range_values() {
        let edges = linspace(0.0, 1.0, 11);
        let counts = count_into_bins(&[-5.0, 0.5, 0.95, 1.0, 7.0], &edges);
        assert_eq!(counts.iter().sum::<f64>(), 3.0);
        // The right edge is inclusive.
        assert_eq!(counts[9], 2.0);
    }

    #[test]
    fn psi_near_zero_for_identical_histograms() {
        let h = vec![5.0, 10.0, 20.0, 10.0, 5.0];
        assert!(psi(&h, &h).abs() < 1e-9);
    }

    #[test]
    fn psi_large_for_disjoint_histograms() {
        let base = vec![10.0, 10.0, 0.0, 0.0];
        let curr = vec![0.0, 0.0, 10.0, 10.0];
        assert!(psi(&base, &curr) > 0.20);
    }

    #[test]
    fn psi_moderate_for_small_shift() {
        let base = vec![10.0, 20.0, 40.0, 20.0, 10.0];
        let curr = vec![12.0, 22.0, 38.0, 18.0, 10.0];
        let v = psi(&base, &curr);
        assert!(v > 0.0 && v < 0.20, "psi {v}");
    }
}
