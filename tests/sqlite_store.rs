use std::sync::Arc;
use std::time::Duration;

use chrono::DateTime;

use matchcast::calibration::{Outcome, Prob3};
use matchcast::clock::ManualClock;
use matchcast::config::EngineConfig;
use matchcast::context::{Importance, MatchContext};
use matchcast::dynamic_calibration::CURVES_KEY;
use matchcast::engine::{ForecastEngine, ISOTONIC_KEY, PredictionRequest};
use matchcast::ensemble::{ModelVote, SubModel};
use matchcast::error::StoreError;
use matchcast::monitor::{BASELINE_KEY, BASELINE_MIN_SAMPLES, DriftSeverity};
use matchcast::store::{self, KeyValueStore, SqliteStore};

fn clock() -> Arc<ManualClock> {
    Arc::new(ManualClock::new(
        DateTime::from_timestamp(1_700_000_000, 0).unwrap(),
    ))
}

fn request(id: usize) -> PredictionRequest {
    let home = 0.35 + 0.002 * (id % 100) as f64;
    let rest = 1.0 - home;
    let p = Prob3::new(home, rest * 0.45, rest * 0.55);
    PredictionRequest {
        match_id: format!("m{id}"),
        votes: [
            ModelVote::new(SubModel::Dense, p),
            ModelVote::new(SubModel::Lstm, p),
            ModelVote::new(SubModel::Cnn, p),
        ],
        context: MatchContext::new("Bundesliga").with_importance(Importance::High),
        expected_goals: None,
        odds: None,
    }
}

#[test]
fn file_store_round_trips_and_expires() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("nested").join("store.sqlite");
    let clock = clock();
    let store = SqliteStore::open(&path, Duration::from_millis(200), clock.clone()).unwrap();

    store
        .set("prediction:a", "{}", Some(Duration::from_secs(90 * 24 * 3600)))
        .unwrap();
    store.hset(CURVES_KEY, "x_medium_good", "{\"v\":1}").unwrap();
    store.hset(CURVES_KEY, "x_medium_good", "{\"v\":2}").unwrap();

    clock.advance(chrono::Duration::days(89));
    assert!(store.get("prediction:a").unwrap().is_some());
    clock.advance(chrono::Duration::days(2));
    assert!(store.get("prediction:a").unwrap().is_none());

    assert_eq!(
        store.hget(CURVES_KEY, "x_medium_good").unwrap().as_deref(),
        Some("{\"v\":2}")
    );
    store.delete(CURVES_KEY).unwrap();
    assert!(store.hgetall(CURVES_KEY).unwrap().is_empty());
}

#[test]
fn engine_state_survives_a_restart() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("engine.sqlite");
    let clock = clock();
    let config = EngineConfig {
        db_path: Some(path.clone()),
        ..EngineConfig::ephemeral()
    };

    {
        let engine = ForecastEngine::open(config.clone(), clock.clone()).unwrap();
        for i in 0..BASELINE_MIN_SAMPLES {
            let forecast = engine.predict(&request(i));
            let actual = if i % 3 == 0 { Outcome::Away } else { Outcome::Home };
            engine.record_result(&forecast.prediction_id, actual).unwrap();
            clock.advance(chrono::Duration::minutes(30));
        }
        assert_eq!(engine.retrain_isotonic(), BASELINE_MIN_SAMPLES);
        assert!(engine.monitor().baseline().is_some());
    }

    let store: Arc<dyn KeyValueStore> =
        Arc::new(SqliteStore::open(&path, Duration::from_millis(200), clock.clone()).unwrap());
    assert!(store.get(ISOTONIC_KEY).unwrap().is_some());
    assert!(store.get(BASELINE_KEY).unwrap().is_some());

    let engine = ForecastEngine::new(config, store.clone(), clock.clone());
    assert!(engine.isotonic().is_trained());
    assert_eq!(engine.isotonic().trained_on(), BASELINE_MIN_SAMPLES);
    assert!(engine.monitor().baseline().is_some());
    // The rolling window itself is in-process only.
    assert_eq!(engine.metrics().total_predictions, 0);
    let drift = engine.detect_drift();
    assert_eq!(drift.severity, DriftSeverity::None);
    assert!(drift.baseline.is_some());

    let summaries = engine.context_summaries();
    assert_eq!(summaries.len(), 1);
    assert_eq!(summaries[0].context_key, "bundesliga_high_good");
    assert_eq!(summaries[0].sample_size, BASELINE_MIN_SAMPLES as u32);
    assert!(summaries[0].mature);

    let forecast = engine.predict(&request(7));
    assert!(forecast.context.applied);
    let record: Option<matchcast::monitor::PredictionRecord> = store::get_json(
        store.as_ref(),
        &format!("prediction:{}", forecast.prediction_id),
    )
    .unwrap();
    assert_eq!(record.unwrap().match_id, "m7");
}

#[test]
fn unusable_parent_directory_is_reported() {
    let dir = tempfile::tempdir().unwrap();
    let blocker = dir.path().join("blocker");
    std::fs::write(&blocker, b"not a directory").unwrap();
    let path = blocker.join("store.sqlite");
    let err = SqliteStore::open(&path, Duration::from_millis(200), clock())
        .err()
        .unwrap();
    match err {
        StoreError::Unavailable(msg) => assert!(msg.contains("blocker")),
        other => panic!("unexpected error: {other}"),
    }
}

#[test]
fn prediction_ids_do_not_collide_across_runs() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("runs.sqlite");
    let config = EngineConfig {
        db_path: Some(path),
        ..EngineConfig::ephemeral()
    };

    let first_id = {
        let engine = ForecastEngine::open(config.clone(), clock()).unwrap();
        engine.predict(&request(1)).prediction_id
    };
    let engine = ForecastEngine::open(config, clock()).unwrap();
    let second_id = engine.predict(&request(1)).prediction_id;

    assert_ne!(first_id, second_id);
    assert!(first_id.starts_with("m1-"));
    // Both runs' records stay in the shared store.
    let store = SqliteStore::open(&dir.path().join("runs.sqlite"), Duration::from_millis(200), clock()).unwrap();
    assert!(store.get(&format!("prediction:{first_id}")).unwrap().is_some());
    assert!(store.get(&format!("prediction:{second_id}")).unwrap().is_some());
}
