//! Feature engineering for the pick model and anomaly detector
//!
//! Converts raw per-game market data into fixed 32-dimension vectors:
//! - Spread features (open/current/movement, public split, RLM flag, range)
//! - Total features (same shape as spread)
//! - Moneyline features (odds, implied probability, spread divergence)
//! - Book consensus features (count, stdevs, max disagreement)
//! - Signal-profile features (counts, confidence mass, signal flags)
//! - Context features (rest, ATS records, broadcast)
//!
//! Extraction is total: any missing or malformed upstream field becomes
//! `0.0`, and the column order is a compatibility contract every downstream
//! model depends on by index.

use std::collections::HashMap;

use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Number of features in every extracted vector.
pub const NUM_FEATURES: usize = 32;

/// Column names, in vector order.
pub const FEATURE_NAMES: [&str; NUM_FEATURES] = [
    // Spread (6)
    "spread_open",
    "spread_current",
    "spread_movement",
    "spread_public_pct",
    "spread_rlm_flag",
    "spread_range_across_books",
    // Total (6)
    "total_open",
    "total_current",
    "total_movement",
    "total_over_pct",
    "total_rlm_flag",
    "total_range_across_books",
    // Moneyline (4)
    "home_ml_odds",
    "away_ml_odds",
    "ml_implied_prob_home",
    "ml_spread_divergence",
    // Book consensus (4)
    "book_count",
    "spread_stdev",
    "total_stdev",
    "max_line_diff",
    // Signal profile (6)
    "primary_signal_count",
    "confirmation_signal_count",
    "total_confidence_add",
    "has_rlm",
    "has_line_freeze",
    "has_book_disagreement",
    // Context (6)
    "hours_to_tipoff",
    "home_rest_days",
    "away_rest_days",
    "home_ats_pct",
    "away_ats_pct",
    "is_national_tv",
];

/// Line movement below this many points is treated as noise, not reverse
/// movement.
const RLM_MOVEMENT_THRESHOLD: f64 = 0.5;

/// Rough spread-to-probability conversion: each point of spread ~ 3%.
const SPREAD_PROB_PER_POINT: f64 = 0.03;

/// A fixed-length feature vector.
///
/// The 32-column invariant lives in the type; rows produced by
/// [`FeatureEngine`] are immutable values downstream code indexes by
/// [`FEATURE_NAMES`] position.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FeatureVector(pub [f64; NUM_FEATURES]);

impl FeatureVector {
    pub fn zeros() -> Self {
        Self([0.0; NUM_FEATURES])
    }

    pub fn as_slice(&self) -> &[f64] {
        &self.0
    }

    /// Named view, for reports and debugging.
    pub fn named(&self) -> HashMap<String, f64> {
        FEATURE_NAMES
            .iter()
            .zip(self.0.iter())
            .map(|(name, v)| (name.to_string(), *v))
            .collect()
    }
}

impl Default for FeatureVector {
    fn default() -> Self {
        Self::zeros()
    }
}

impl std::ops::Index<usize> for FeatureVector {
    type Output = f64;

    fn index(&self, idx: usize) -> &f64 {
        &self.0[idx]
    }
}

/// One side of the market: opening line, current line, public split.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SpreadOdds {
    pub open: Option<Decimal>,
    pub current: Option<Decimal>,
    /// Percentage of public bets on the favorite side (0-100).
    pub public_pct: Option<Decimal>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TotalOdds {
    pub open: Option<Decimal>,
    pub current: Option<Decimal>,
    /// Percentage of public bets on the over (0-100).
    pub over_pct: Option<Decimal>,
}

/// American moneyline odds for both sides.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MoneylineOdds {
    pub home_ml: Option<Decimal>,
    pub away_ml: Option<Decimal>,
}

/// Cross-book consensus statistics from the odds scraper.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BookConsensus {
    pub book_count: Option<u32>,
    pub spread_stdev: Option<Decimal>,
    pub total_stdev: Option<Decimal>,
    pub max_line_diff: Option<Decimal>,
    pub spread_range: Option<Decimal>,
    pub total_range: Option<Decimal>,
}

/// Raw odds payload for one game, as delivered by the scraping service.
///
/// Every field is optional: a partially-scraped book still extracts.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct OddsData {
    pub spread: SpreadOdds,
    pub total: TotalOdds,
    pub moneyline: MoneylineOdds,
    pub books: BookConsensus,
}

/// Market-signal families produced by the external rule engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignalKind {
    ReverseLineMovement,
    LineFreeze,
    BookDisagreement,
    SteamMove,
    PublicFade,
}

/// How much weight the rule engine assigns a signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignalCategory {
    Primary,
    Confirmation,
}

/// One detected market signal with its confidence contribution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Signal {
    pub kind: SignalKind,
    pub category: SignalCategory,
    pub confidence_add: f64,
}

/// The rule engine's full signal read for one game.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SignalProfile {
    pub signals: Vec<Signal>,
}

impl SignalProfile {
    fn has_kind(&self, kind: SignalKind) -> bool {
        self.signals.iter().any(|s| s.kind == kind)
    }

    fn count_category(&self, category: SignalCategory) -> usize {
        self.signals.iter().filter(|s| s.category == category).count()
    }
}

/// Schedule and situational context from the scheduler service.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct GameContext {
    pub hours_to_tipoff: Option<f64>,
    pub home_rest_days: Option<f64>,
    pub away_rest_days: Option<f64>,
    /// Against-the-spread win percentage (0-100).
    pub home_ats_pct: Option<f64>,
    pub away_ats_pct: Option<f64>,
    pub is_national_tv: bool,
}

/// Everything known about one game at analysis time.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct GameInput {
    pub game_key: String,
    pub odds_data: Option<OddsData>,
    pub signal_profile: Option<SignalProfile>,
    pub context: Option<GameContext>,
}

/// Stateless extractor from raw game data to [`FeatureVector`] rows.
#[derive(Debug, Clone, Copy, Default)]
pub struct FeatureEngine;

impl FeatureEngine {
    pub fn new() -> Self {
        Self
    }

    /// Build a 32-element feature vector from raw analysis data.
    ///
    /// Total function: missing, malformed, or non-finite inputs become
    /// `0.0`. The models downstream are trained with that convention.
    pub fn extract(
        &self,
        odds_data: Option<&OddsData>,
        signal_profile: Option<&SignalProfile>,
        context: Option<&GameContext>,
    ) -> FeatureVector {
        let mut vec = [0.0; NUM_FEATURES];
        let default_odds = OddsData::default();
        let default_ctx = GameContext::default();
        let odds = odds_data.unwrap_or(&default_odds);
        let ctx = context.unwrap_or(&default_ctx);

        // Spread
        let s_open = dec_or_zero(odds.spread.open);
        let s_curr = dec_or_zero(odds.spread.current);
        let s_pub = dec_or_zero(odds.spread.public_pct);
        vec[0] = s_open;
        vec[1] = s_curr;
        vec[2] = if s_open != 0.0 && s_curr != 0.0 {
            s_curr - s_open
        } else {
            0.0
        };
        vec[3] = s_pub;
        vec[4] = rlm_flag(s_open, s_curr, s_pub);
        vec[5] = dec_or_zero(odds.books.spread_range);

        // Total
        let t_open = dec_or_zero(odds.total.open);
        let t_curr = dec_or_zero(odds.total.current);
        let t_over = dec_or_zero(odds.total.over_pct);
        vec[6] = t_open;
        vec[7] = t_curr;
        vec[8] = if t_open != 0.0 && t_curr != 0.0 {
            t_curr - t_open
        } else {
            0.0
        };
        vec[9] = t_over;
        vec[10] = rlm_flag(t_open, t_curr, t_over);
        vec[11] = dec_or_zero(odds.books.total_range);

        // Moneyline
        let home_ml = dec_or_zero(odds.moneyline.home_ml);
        let away_ml = dec_or_zero(odds.moneyline.away_ml);
        vec[12] = home_ml;
        vec[13] = away_ml;
        vec[14] = ml_implied_prob(home_ml);
        vec[15] = ml_spread_divergence(home_ml, s_curr);

        // Book consensus
        vec[16] = odds.books.book_count.map(f64::from).unwrap_or(0.0);
        vec[17] = dec_or_zero(odds.books.spread_stdev);
        vec[18] = dec_or_zero(odds.books.total_stdev);
        vec[19] = dec_or_zero(odds.books.max_line_diff);

        // Signal profile
        if let Some(profile) = signal_profile {
            vec[20] = profile.count_category(SignalCategory::Primary) as f64;
            vec[21] = profile.count_category(SignalCategory::Confirmation) as f64;
            vec[22] = profile
                .signals
                .iter()
                .map(|s| finite_or_zero(s.confidence_add))
                .sum();
            vec[23] = flag(profile.has_kind(SignalKind::ReverseLineMovement));
            vec[24] = flag(profile.has_kind(SignalKind::LineFreeze));
            vec[25] = flag(profile.has_kind(SignalKind::BookDisagreement));
        }

        // Context
        vec[26] = opt_or_zero(ctx.hours_to_tipoff);
        vec[27] = opt_or_zero(ctx.home_rest_days);
        vec[28] = opt_or_zero(ctx.away_rest_days);
        vec[29] = opt_or_zero(ctx.home_ats_pct);
        vec[30] = opt_or_zero(ctx.away_ats_pct);
        vec[31] = flag(ctx.is_national_tv);

        FeatureVector(vec)
    }

    /// Extract one game's vector from its full input bundle.
    pub fn extract_game(&self, game: &GameInput) -> FeatureVector {
        self.extract(
            game.odds_data.as_ref(),
            game.signal_profile.as_ref(),
            game.context.as_ref(),
        )
    }

    /// Extract a whole slate, preserving order. Empty in, empty out.
    pub fn extract_batch(&self, games: &[GameInput]) -> Vec<FeatureVector> {
        games.iter().map(|g| self.extract_game(g)).collect()
    }
}

fn flag(b: bool) -> f64 {
    if b {
        1.0
    } else {
        0.0
    }
}

fn finite_or_zero(v: f64) -> f64 {
    if v.is_finite() {
        v
    } else {
        0.0
    }
}

fn opt_or_zero(v: Option<f64>) -> f64 {
    finite_or_zero(v.unwrap_or(0.0))
}

fn dec_or_zero(v: Option<Decimal>) -> f64 {
    finite_or_zero(v.and_then(|d| d.to_f64()).unwrap_or(0.0))
}

/// 1.0 if the line moved opposite to the public money direction, else 0.0.
///
/// Requires all three inputs to be present (non-zero): a heavy public side
/// (>55% or <45%) combined with movement past the noise threshold in the
/// direction the public is NOT pushing.
fn rlm_flag(open_line: f64, current_line: f64, public_pct: f64) -> f64 {
    if open_line == 0.0 || current_line == 0.0 || public_pct == 0.0 {
        return 0.0;
    }
    let movement = current_line - open_line;
    if public_pct > 55.0 && movement > RLM_MOVEMENT_THRESHOLD {
        return 1.0;
    }
    if public_pct < 45.0 && movement < -RLM_MOVEMENT_THRESHOLD {
        return 1.0;
    }
    0.0
}

/// American odds to implied probability.
fn ml_implied_prob(ml_odds: f64) -> f64 {
    if ml_odds == 0.0 {
        return 0.0;
    }
    if ml_odds > 0.0 {
        100.0 / (ml_odds + 100.0)
    } else {
        ml_odds.abs() / (ml_odds.abs() + 100.0)
    }
}

/// Gap between moneyline-implied and spread-implied win probability, in
/// percentage points. Larger gaps indicate potential mispricing.
fn ml_spread_divergence(home_ml: f64, spread: f64) -> f64 {
    if home_ml == 0.0 || spread == 0.0 {
        return 0.0;
    }
    let ml_prob = ml_implied_prob(home_ml);
    let direction = if spread < 0.0 { 1.0 } else { -1.0 };
    let spread_prob = (0.5 + spread.abs() * SPREAD_PROB_PER_POINT * direction).clamp(0.05, 0.95);
    (ml_prob - spread_prob).abs() * 100.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn full_odds() -> OddsData {
        OddsData {
            spread: SpreadOdds {
                open: Some(dec!(-6.5)),
                current: Some(dec!(-5.5)),
                public_pct: Some(dec!(68)),
            },
            total: TotalOdds {
                open: Some(dec!(221.5)),
                current: Some(dec!(224.0)),
                over_pct: Some(dec!(61)),
            },
            moneyline: MoneylineOdds {
                home_ml: Some(dec!(-250)),
                away_ml: Some(dec!(205)),
            },
            books: BookConsensus {
                book_count: Some(7),
                spread_stdev: Some(dec!(0.4)),
                total_stdev: Some(dec!(0.9)),
                max_line_diff: Some(dec!(1.5)),
                spread_range: Some(dec!(1.0)),
                total_range: Some(dec!(2.0)),
            },
        }
    }

    #[test]
    fn extract_with_no_inputs_is_all_zeros() {
        let engine = FeatureEngine::new();
        let vec = engine.extract(None, None, None);
        assert_eq!(vec.as_slice().len(), NUM_FEATURES);
        assert!(vec.as_slice().iter().all(|v| *v == 0.0));
    }

    #[test]
    fn extract_with_partial_odds_never_panics() {
        let engine = FeatureEngine::new();
        let odds = OddsData {
            spread: SpreadOdds {
                open: Some(dec!(-3)),
                ..Default::default()
            },
            ..Default::default()
        };
        let vec = engine.extract(Some(&odds), None, None);
        assert_eq!(vec[0], -3.0);
        // Movement needs both lines present.
        assert_eq!(vec[2], 0.0);
        assert_eq!(vec[4], 0.0);
    }

    #[test]
    fn spread_features_populate_in_order() {
        let engine = FeatureEngine::new();
        let vec = engine.extract(Some(&full_odds()), None, None);
        assert_eq!(vec[0], -6.5);
        assert_eq!(vec[1], -5.5);
        assert!((vec[2] - 1.0).abs() < 1e-12);
        assert_eq!(vec[3], 68.0);
        assert_eq!(vec[16], 7.0);
    }

    #[test]
    fn rlm_flag_fires_only_against_public_direction() {
        // Public heavy on favorite, line moved away from them past 0.5.
        assert_eq!(rlm_flag(-6.5, -5.5, 68.0), 1.0);
        // Public heavy, line moved with them.
        assert_eq!(rlm_flag(-6.5, -7.5, 68.0), 0.0);
        // Public light (<45), line dropped against them.
        assert_eq!(rlm_flag(-4.0, -5.0, 38.0), 1.0);
        // Sub-threshold movement is noise.
        assert_eq!(rlm_flag(-6.5, -6.2, 68.0), 0.0);
        // Balanced public never flags.
        assert_eq!(rlm_flag(-6.5, -5.0, 50.0), 0.0);
        // Missing inputs never flag.
        assert_eq!(rlm_flag(0.0, -5.0, 68.0), 0.0);
    }

    #[test]
    fn rlm_flag_is_binary_for_arbitrary_inputs() {
        for open in [-12.0, -3.5, 0.0, 2.5, 9.0] {
            for curr in [-11.0, -4.0, 0.0, 3.0, 10.0] {
                for public in [0.0, 20.0, 44.9, 55.1, 90.0] {
                    let f = rlm_flag(open, curr, public);
                    assert!(f == 0.0 || f == 1.0);
                }
            }
        }
    }

    #[test]
    fn moneyline_implied_probability() {
        // Favorite: |odds| / (|odds| + 100)
        assert!((ml_implied_prob(-150.0) - 0.6).abs() < 1e-9);
        // Underdog: 100 / (odds + 100)
        assert!((ml_implied_prob(300.0) - 0.25).abs() < 1e-9);
        assert_eq!(ml_implied_prob(0.0), 0.0);
    }

    #[test]
    fn ml_spread_divergence_stays_in_percentage_bounds() {
        for ml in [-10000.0, -500.0, -110.0, 120.0, 800.0, 10000.0] {
            for spread in [-30.0, -7.5, -1.0, 1.0, 12.0, 30.0] {
                let d = ml_spread_divergence(ml, spread);
                assert!((0.0..=100.0).contains(&d), "divergence {d} out of range");
            }
        }
        assert_eq!(ml_spread_divergence(0.0, -5.0), 0.0);
        assert_eq!(ml_spread_divergence(-150.0, 0.0), 0.0);
    }

    #[test]
    fn signal_profile_counts_and_flags() {
        let engine = FeatureEngine::new();
        let profile = SignalProfile {
            signals: vec![
                Signal {
                    kind: SignalKind::ReverseLineMovement,
                    category: SignalCategory::Primary,
                    confidence_add: 8.0,
                },
                Signal {
                    kind: SignalKind::LineFreeze,
                    category: SignalCategory::Primary,
                    confidence_add: 5.0,
                },
                Signal {
                    kind: SignalKind::SteamMove,
                    category: SignalCategory::Confirmation,
                    confidence_add: 2.5,
                },
            ],
        };
        let vec = engine.extract(None, Some(&profile), None);
        assert_eq!(vec[20], 2.0);
        assert_eq!(vec[21], 1.0);
        assert!((vec[22] - 15.5).abs() < 1e-9);
        assert_eq!(vec[23], 1.0);
        assert_eq!(vec[24], 1.0);
        assert_eq!(vec[25], 0.0);
    }

    #[test]
    fn context_features_with_non_finite_values_zeroed() {
        let engine = FeatureEngine::new();
        let ctx = GameContext {
            hours_to_tipoff: Some(f64::NAN),
            home_rest_days: Some(2.0),
            away_rest_days: Some(f64::INFINITY),
            home_ats_pct: Some(55.0),
            away_ats_pct: None,
            is_national_tv: true,
        };
        let vec = engine.extract(None, None, Some(&ctx));
        assert_eq!(vec[26], 0.0);
        assert_eq!(vec[27], 2.0);
        assert_eq!(vec[28], 0.0);
        assert_eq!(vec[29], 55.0);
        assert_eq!(vec[30], 0.0);
        assert_eq!(vec[31], 1.0);
    }

    #[test]
    fn batch_preserves_order_and_handles_empty() {
        let engine = FeatureEngine::new();
        assert!(engine.extract_batch(&[]).is_empty());

        let games = vec![
            GameInput {
                game_key: "LAL@BOS".into(),
                odds_data: Some(full_odds()),
                ..Default::default()
            },
            GameInput {
                game_key: "DEN@PHX".into(),
                ..Default::default()
            },
        ];
        let rows = engine.extract_batch(&games);
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0][0], -6.5);
        assert!(rows[1].as_slice().iter().all(|v| *v == 0.0));
    }

    #[test]
    fn feature_names_match_vector_width() {
        assert_eq!(FEATURE_NAMES.len(), NUM_FEATURES);
        let named = FeatureVector::zeros().named();
        assert_eq!(named.len(), NUM_FEATURES);
    }
}
