use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result, anyhow};
use chrono::DateTime;
use rayon::prelude::*;
use tracing::info;

use matchcast::calibration::{self, Outcome, Prob3};
use matchcast::clock::{Clock, ManualClock};
use matchcast::config::{self, EngineConfig};
use matchcast::context::{Importance, MatchContext, Weather};
use matchcast::engine::{ForecastEngine, PredictionRequest};
use matchcast::ensemble::{ModelVote, SubModel};
use matchcast::logging;
use matchcast::monitor::MarketOdds;
use matchcast::poisson::{ExpectedScore, PoissonScoreModel};
use matchcast::store::{KeyValueStore, MemoryStore, SqliteStore};

const DEFAULT_RETRAIN_EVERY: usize = 50;

#[derive(Debug, serde::Deserialize)]
struct Votes {
    dense: [f64; 3],
    lstm: [f64; 3],
    cnn: [f64; 3],
}

#[derive(Debug, serde::Deserialize)]
struct BacktestCase {
    match_id: String,
    league: String,
    #[serde(default)]
    importance: Option<Importance>,
    #[serde(default)]
    weather: Option<Weather>,
    votes: Votes,
    #[serde(default)]
    expected_goals: Option<ExpectedScore>,
    #[serde(default)]
    odds: Option<MarketOdds>,
    home_goals: i32,
    away_goals: i32,
}

impl BacktestCase {
    fn request(&self) -> PredictionRequest {
        PredictionRequest {
            match_id: self.match_id.clone(),
            votes: [
                ModelVote::new(SubModel::Dense, Prob3::from_array(self.votes.dense)),
                ModelVote::new(SubModel::Lstm, Prob3::from_array(self.votes.lstm)),
                ModelVote::new(SubModel::Cnn, Prob3::from_array(self.votes.cnn)),
            ],
            context: MatchContext {
                league: self.league.clone(),
                importance: self.importance,
                weather: self.weather,
            },
            expected_goals: self.expected_goals,
            odds: self.odds,
        }
    }

    fn outcome(&self) -> Outcome {
        calibration::classify_outcome(self.home_goals, self.away_goals)
    }
}

fn main() -> Result<()> {
    config::load_dotenv();
    logging::init();

    let path = std::env::args()
        .nth(1)
        .filter(|arg| !arg.starts_with("--"))
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("tests/fixtures/backtest_matches.json"));
    let retrain_every = parse_usize_arg("--retrain-every")
        .unwrap_or(DEFAULT_RETRAIN_EVERY)
        .clamp(1, 10_000);
    let show_reliability = has_flag("--reliability");

    let raw = fs::read_to_string(&path).with_context(|| format!("read {}", path.display()))?;
    let cases: Vec<BacktestCase> =
        serde_json::from_str(&raw).with_context(|| format!("parse {}", path.display()))?;
    if cases.is_empty() {
        return Err(anyhow!("no matches in {}", path.display()));
    }

    let clock = Arc::new(ManualClock::new(
        DateTime::from_timestamp(1_722_470_400, 0).context("fixture start time")?,
    ));
    let mut cfg = EngineConfig::from_env()?;
    let store: Arc<dyn KeyValueStore> = match parse_db_path_arg() {
        Some(db) => Arc::new(SqliteStore::open(&db, cfg.store_timeout, clock.clone())?),
        None => {
            cfg.db_path = None;
            Arc::new(MemoryStore::new(clock.clone()))
        }
    };
    let engine = ForecastEngine::new(cfg, store, clock.clone());

    let mut raw_preds = Vec::with_capacity(cases.len());
    let mut served_preds = Vec::with_capacity(cases.len());
    let mut outcomes = Vec::with_capacity(cases.len());

    for (idx, case) in cases.iter().enumerate() {
        let forecast = engine.predict(&case.request());
        let actual = case.outcome();
        engine
            .record_result(&forecast.prediction_id, actual)
            .with_context(|| format!("record result for {}", case.match_id))?;

        raw_preds.push(forecast.ensemble.probabilities);
        served_preds.push(forecast.probabilities);
        outcomes.push(actual);

        if (idx + 1) % retrain_every == 0 {
            let samples = engine.retrain_isotonic();
            info!(at = idx + 1, samples, "periodic isotonic retrain");
        }
        clock.advance(chrono::Duration::hours(6));
    }

    // Poisson model scored on its own, in parallel; it never feeds the served triple.
    let model = PoissonScoreModel::new();
    let poisson: Vec<(Prob3, Outcome)> = cases
        .par_iter()
        .filter_map(|case| {
            let xg = case.expected_goals?;
            Some((model.predict(xg.home, xg.away).probs, case.outcome()))
        })
        .collect();
    let (poisson_preds, poisson_outcomes): (Vec<Prob3>, Vec<Outcome>) =
        poisson.into_iter().unzip();

    println!("Replayed {} matches from {}", cases.len(), path.display());
    println!("Finished at {}", clock.now().format("%Y-%m-%d %H:%M"));
    print_metrics("Ensemble (raw)", calibration::evaluate_probs(&raw_preds, &outcomes));
    print_metrics("Served (calibrated)", calibration::evaluate_probs(&served_preds, &outcomes));
    print_metrics(
        "Poisson",
        calibration::evaluate_probs(&poisson_preds, &poisson_outcomes),
    );
    let empirical = vec![calibration::empirical_outcome_probs(&outcomes); outcomes.len()];
    print_metrics("Empirical baseline", calibration::evaluate_probs(&empirical, &outcomes));

    if show_reliability {
        for class in Outcome::ALL {
            println!("Reliability ({}):", class.label());
            for bin in calibration::reliability_bins(&served_preds, &outcomes, class, 10) {
                if bin.count == 0 {
                    continue;
                }
                println!(
                    "  [{:.1}, {:.1}) n={:<4} pred={:.3} actual={:.3}",
                    bin.bucket_start, bin.bucket_end, bin.count, bin.avg_pred, bin.actual_rate
                );
            }
        }
    }

    let metrics = engine.metrics();
    println!("Rolling window:");
    println!(
        "  outcomes={} pending={} accuracy={:.3} brier={:.4} roi={:.1}% over {} bets",
        metrics.total_predictions,
        metrics.pending,
        metrics.accuracy,
        metrics.brier_score,
        metrics.roi,
        metrics.bets
    );
    for outcome in Outcome::ALL {
        let stats = metrics.by_outcome.get(outcome);
        println!(
            "  {:<5} n={:<4} correct={:<4} accuracy={:.3}",
            outcome.label(),
            stats.total,
            stats.correct,
            stats.accuracy
        );
    }

    let drift = engine.detect_drift();
    match drift.baseline {
        Some(_) => println!(
            "Drift: {:?} (accuracy {:+.3}, brier {:+.4}, roi {:+.1})",
            drift.severity,
            drift.metrics.accuracy_drift,
            drift.metrics.brier_drift,
            drift.metrics.roi_drift
        ),
        None => println!("Drift: no baseline yet"),
    }

    let health = engine.health_check();
    println!("Health: {:?}", health.status);
    for reason in &health.reasons {
        println!("  - {reason}");
    }

    println!("Confidence bands:");
    for row in engine.confidence_bands() {
        println!(
            "  {:<12} n={:<4} accuracy={:.3} expected={:.3} error={:+.3}",
            row.band, row.predictions, row.accuracy, row.expected_accuracy, row.calibration_error
        );
    }

    println!("Context curves:");
    for summary in engine.context_summaries() {
        println!(
            "  {:<28} samples={:<4} mature={} error={:.4}",
            summary.context_key, summary.sample_size, summary.mature, summary.calibration_error
        );
    }

    Ok(())
}

fn parse_db_path_arg() -> Option<PathBuf> {
    let args = std::env::args().skip(1).collect::<Vec<_>>();
    for (idx, arg) in args.iter().enumerate() {
        if let Some(raw) = arg.strip_prefix("--db=") {
            return Some(PathBuf::from(raw.trim()));
        }
        if arg == "--db"
            && let Some(next) = args.get(idx + 1)
        {
            return Some(PathBuf::from(next.trim()));
        }
    }
    None
}

fn parse_usize_arg(name: &str) -> Option<usize> {
    let args = std::env::args().skip(1).collect::<Vec<_>>();
    for (idx, arg) in args.iter().enumerate() {
        if let Some(raw) = arg.strip_prefix(&format!("{name}="))
            && let Ok(v) = raw.trim().parse::<usize>()
        {
            return Some(v);
        }
        if arg == name
            && let Some(next) = args.get(idx + 1)
            && let Ok(v) = next.trim().parse::<usize>()
        {
            return Some(v);
        }
    }
    None
}

fn has_flag(name: &str) -> bool {
    std::env::args().skip(1).any(|arg| arg == name)
}

fn print_metrics(label: &str, metrics: calibration::Metrics) {
    println!("{label}:");
    println!(
        "  samples={} brier={:.4} log_loss={:.4} accuracy={:.3}",
        metrics.samples, metrics.brier, metrics.log_loss, metrics.accuracy
    );
}
