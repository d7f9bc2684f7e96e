use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::DateTime;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::{info, warn};

use matchcast::calibration::{Outcome, Prob3};
use matchcast::clock::ManualClock;
use matchcast::config::{self, EngineConfig};
use matchcast::context::{Importance, MatchContext, Weather};
use matchcast::engine::{ForecastEngine, PredictionRequest};
use matchcast::ensemble::{ModelVote, SubModel};
use matchcast::logging;
use matchcast::monitor::{DriftSeverity, MarketOdds};
use matchcast::poisson::{ExpectedScore, PoissonScoreModel};
use matchcast::store::{KeyValueStore, MemoryStore, SqliteStore};

const LEAGUES: [&str; 4] = ["Premier League", "La Liga", "Serie A", "Bundesliga"];
const BOOK_MARGIN: f64 = 1.06;

fn main() -> Result<()> {
    config::load_dotenv();
    logging::init();

    let matches = parse_usize_arg("--matches").unwrap_or(600).clamp(1, 100_000);
    let seed = parse_u64_arg("--seed").unwrap_or(7);
    let degrade_after = parse_usize_arg("--degrade-after");
    let report_every = parse_usize_arg("--report-every")
        .unwrap_or(100)
        .clamp(1, 100_000);
    let noise = parse_f64_arg("--noise").unwrap_or(0.05).clamp(0.0, 0.3);

    let clock = Arc::new(ManualClock::new(
        DateTime::from_timestamp(1_722_470_400, 0).context("replay start time")?,
    ));
    let mut cfg = EngineConfig::from_env()?;
    let store: Arc<dyn KeyValueStore> = match parse_path_arg("--db") {
        Some(path) => Arc::new(
            SqliteStore::open(&path, cfg.store_timeout, clock.clone())
                .with_context(|| format!("open {}", path.display()))?,
        ),
        None => {
            cfg.db_path = None;
            Arc::new(MemoryStore::new(clock.clone()))
        }
    };
    let engine = ForecastEngine::new(cfg, store, clock.clone());
    let truth = PoissonScoreModel::new();
    let mut rng = StdRng::seed_from_u64(seed);

    info!(matches, seed, degrade_after, "synthetic replay starting");

    let mut worst = DriftSeverity::None;
    for idx in 0..matches {
        let degraded = degrade_after.is_some_and(|at| idx >= at);
        let xg = ExpectedScore {
            home: rng.gen_range(0.7..2.4),
            away: rng.gen_range(0.5..2.0),
        };
        let true_probs = truth.predict(xg.home, xg.away).probs;
        let actual = sample_outcome(true_probs, &mut rng);

        // A degraded model reads the fixture back to front.
        let seen = if degraded {
            Prob3::new(true_probs.away, true_probs.draw, true_probs.home)
        } else {
            true_probs
        };
        let votes = [
            ModelVote::new(SubModel::Dense, jitter(seen, noise, &mut rng)),
            ModelVote::new(SubModel::Lstm, jitter(seen, noise, &mut rng)),
            ModelVote::new(SubModel::Cnn, jitter(seen, noise, &mut rng)),
        ];

        let mut context = MatchContext::new(LEAGUES[rng.gen_range(0..LEAGUES.len())]);
        if rng.gen_bool(0.3) {
            context = context.with_importance(if rng.gen_bool(0.5) {
                Importance::High
            } else {
                Importance::Low
            });
        }
        if rng.gen_bool(0.2) {
            context = context.with_weather(Weather::Poor);
        }

        let odds = MarketOdds {
            home: 1.0 / (true_probs.home * BOOK_MARGIN),
            draw: 1.0 / (true_probs.draw * BOOK_MARGIN),
            away: 1.0 / (true_probs.away * BOOK_MARGIN),
        };

        let forecast = engine.predict(&PredictionRequest {
            match_id: format!("syn-{idx:05}"),
            votes,
            context,
            expected_goals: Some(xg),
            odds: Some(odds),
        });
        engine.record_result(&forecast.prediction_id, actual)?;
        clock.advance(chrono::Duration::hours(3));

        if (idx + 1) % report_every == 0 {
            engine.retrain_isotonic();
            let metrics = engine.metrics();
            let drift = engine.detect_drift();
            worst = worst.max(drift.severity);
            println!(
                "{:>6}  acc={:.3} brier={:.4} roi={:+.1}%  drift={:?} health={:?}",
                idx + 1,
                metrics.accuracy,
                metrics.brier_score,
                metrics.roi,
                drift.severity,
                engine.health_check().status
            );
        }
    }

    let drift = engine.detect_drift();
    worst = worst.max(drift.severity);
    if worst >= DriftSeverity::High {
        warn!(severity = ?worst, "replay ended with drift");
    }
    println!("Worst drift seen: {worst:?}");
    if let Some(baseline) = drift.baseline {
        println!(
            "Baseline: acc={:.3} brier={:.4} roi={:+.1}%",
            baseline.accuracy, baseline.brier_score, baseline.roi
        );
    }
    println!("Contexts tracked: {}", engine.context_summaries().len());
    Ok(())
}

fn sample_outcome(p: Prob3, rng: &mut impl Rng) -> Outcome {
    let u: f64 = rng.r#gen();
    if u < p.home {
        Outcome::Home
    } else if u < p.home + p.draw {
        Outcome::Draw
    } else {
        Outcome::Away
    }
}

fn jitter(p: Prob3, noise: f64, rng: &mut impl Rng) -> Prob3 {
    if noise <= 0.0 {
        return p;
    }
    let mut shake = |v: f64| (v + rng.gen_range(-noise..noise)).max(0.01);
    Prob3::new(shake(p.home), shake(p.draw), shake(p.away)).normalized()
}

fn parse_path_arg(name: &str) -> Option<PathBuf> {
    let args = std::env::args().skip(1).collect::<Vec<_>>();
    for (idx, arg) in args.iter().enumerate() {
        if let Some(raw) = arg.strip_prefix(&format!("{name}=")) {
            return Some(PathBuf::from(raw.trim()));
        }
        if arg == name
            && let Some(next) = args.get(idx + 1)
        {
            return Some(PathBuf::from(next.trim()));
        }
    }
    None
}

fn parse_f64_arg(name: &str) -> Option<f64> {
    parse_arg(name).and_then(|raw| raw.parse::<f64>().ok())
}

fn parse_usize_arg(name: &str) -> Option<usize> {
    parse_arg(name).and_then(|raw| raw.parse::<usize>().ok())
}

fn parse_u64_arg(name: &str) -> Option<u64> {
    parse_arg(name).and_then(|raw| raw.parse::<u64>().ok())
}

fn parse_arg(name: &str) -> Option<String> {
    let args = std::env::args().skip(1).collect::<Vec<_>>();
    for (idx, arg) in args.iter().enumerate() {
        if let Some(raw) = arg.strip_prefix(&format!("{name}=")) {
            return Some(raw.trim().to_string());
        }
        if arg == name
            && let Some(next) = args.get(idx + 1)
        {
            return Some(next.trim().to_string());
        }
    }
    None
}
