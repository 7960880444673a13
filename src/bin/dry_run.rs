//! Dry-run simulation for the ML core
//!
//! Feeds a synthetic season through the full pipeline (analyze, settle,
//! health check) and reports model status, anomaly counts, and drift
//! events. Writes the final status payload to logs/ for inspection.

use std::collections::HashMap;
use std::fs::File;
use std::io::Write;

use chrono::Utc;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use sharpline::{
    EngineConfig, GameInput, OddsData, PickEngine, Signal, SignalCategory, SignalKind,
    SignalProfile,
};
use sharpline::features::{BookConsensus, GameContext, MoneylineOdds, SpreadOdds, TotalOdds};

const GAMES: usize = 200;

fn synthetic_game(i: usize, rng: &mut StdRng) -> GameInput {
    let spread = -8.0 + rng.gen::<f64>() * 12.0;
    let movement = (rng.gen::<f64>() - 0.5) * 2.0;
    let public = 35.0 + rng.gen::<f64>() * 40.0;
    let total = 210.0 + rng.gen::<f64>() * 25.0;

    let mut signals = Vec::new();
    if public > 60.0 && movement > 0.5 {
        signals.push(Signal {
            kind: SignalKind::ReverseLineMovement,
            category: SignalCategory::Primary,
            confidence_add: 8.0,
        });
    }
    if rng.gen::<f64>() < 0.2 {
        signals.push(Signal {
            kind: SignalKind::BookDisagreement,
            category: SignalCategory::Confirmation,
            confidence_add: 3.0,
        });
    }

    GameInput {
        game_key: format!("sim-{i:04}"),
        odds_data: Some(OddsData {
            spread: SpreadOdds {
                open: Decimal::try_from(spread).ok(),
                current: Decimal::try_from(spread + movement).ok(),
                public_pct: Decimal::try_from(public).ok(),
            },
            total: TotalOdds {
                open: Decimal::try_from(total).ok(),
                current: Decimal::try_from(total + movement).ok(),
                over_pct: Some(dec!(55)),
            },
            moneyline: MoneylineOdds {
                home_ml: Some(dec!(-160)),
                away_ml: Some(dec!(140)),
            },
            books: BookConsensus {
                book_count: Some(5 + (i % 4) as u32),
                spread_stdev: Decimal::try_from(rng.gen::<f64>()).ok(),
                ..Default::default()
            },
        }),
        signal_profile: Some(SignalProfile { signals }),
        context: Some(GameContext {
            hours_to_tipoff: Some(2.0 + rng.gen::<f64>() * 8.0),
            home_rest_days: Some((i % 4) as f64),
            away_rest_days: Some(((i + 1) % 4) as f64),
            home_ats_pct: Some(45.0 + rng.gen::<f64>() * 15.0),
            away_ats_pct: Some(45.0 + rng.gen::<f64>() * 15.0),
            is_national_tv: i % 9 == 0,
        }),
    }
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .init();

    println!("sharpline dry run: {GAMES} synthetic games");
    println!("started at {}", Utc::now());
    println!("{}", "-".repeat(50));

    let engine = PickEngine::new(EngineConfig::default());
    let mut rng = StdRng::seed_from_u64(1234);
    let mut anomalies = 0usize;

    for i in 0..GAMES {
        let game = synthetic_game(i, &mut rng);
        let analysis = engine.analyze(&game);
        if analysis.anomaly.is_anomaly {
            anomalies += 1;
        }

        // Settle: an RLM signal gives a real edge, the rest is noise.
        let edge = if analysis.features[23] > 0.0 { 0.62 } else { 0.5 };
        let won = rng.gen::<f64>() < edge;
        engine.record_result(
            &game,
            analysis.prediction.win_probability,
            won,
            "spread",
            HashMap::new(),
        );

        if (i + 1) % 50 == 0 {
            let (health, retrain) = engine.check_and_retrain();
            println!(
                "game {:>3}: accuracy={:.3} brier={:.3} recommendation={:?} retrained={}",
                i + 1,
                health.metrics.accuracy,
                health.metrics.brier_score,
                health.recommendation,
                retrain.map(|o| o.is_trained()).unwrap_or(false),
            );
        }
    }

    let status = engine.status();
    println!("{}", "-".repeat(50));
    println!("model version:     {}", status.model.model_version);
    println!("training samples:  {}", status.model.total_samples);
    println!("anomaly fits:      {}", status.anomaly.fit_count);
    println!("anomalies flagged: {anomalies}");
    println!("drift events:      {}", status.drift_events);

    std::fs::create_dir_all("logs")?;
    let out_path = format!("logs/dry_run_{}.json", Utc::now().format("%Y%m%d_%H%M%S"));
    let mut file = File::create(&out_path)?;
    writeln!(file, "{}", serde_json::to_string_pretty(&status)?)?;
    println!("status written to {out_path}");

    Ok(())
}
