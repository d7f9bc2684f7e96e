use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use chrono::DateTime;

use matchcast::calibration::{Outcome, Prob3};
use matchcast::clock::ManualClock;
use matchcast::config::EngineConfig;
use matchcast::context::MatchContext;
use matchcast::engine::{ForecastEngine, PredictionRequest};
use matchcast::ensemble::{ModelVote, SubModel};
use matchcast::error::{MonitorError, StoreError, StoreResult};
use matchcast::store::{KeyValueStore, MemoryStore};

/// Wraps a memory store and fails every call while `down` is set.
struct FlakyStore {
    inner: MemoryStore,
    down: AtomicBool,
    calls: AtomicUsize,
}

impl FlakyStore {
    fn new(clock: Arc<ManualClock>, down: bool) -> Self {
        Self {
            inner: MemoryStore::new(clock),
            down: AtomicBool::new(down),
            calls: AtomicUsize::new(0),
        }
    }

    fn check(&self) -> StoreResult<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.down.load(Ordering::SeqCst) {
            Err(StoreError::Timeout("simulated outage".into()))
        } else {
            Ok(())
        }
    }
}

impl KeyValueStore for FlakyStore {
    fn get(&self, key: &str) -> StoreResult<Option<String>> {
        self.check()?;
        self.inner.get(key)
    }

    fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> StoreResult<()> {
        self.check()?;
        self.inner.set(key, value, ttl)
    }

    fn delete(&self, key: &str) -> StoreResult<()> {
        self.check()?;
        self.inner.delete(key)
    }

    fn hget(&self, key: &str, field: &str) -> StoreResult<Option<String>> {
        self.check()?;
        self.inner.hget(key, field)
    }

    fn hset(&self, key: &str, field: &str, value: &str) -> StoreResult<()> {
        self.check()?;
        self.inner.hset(key, field, value)
    }

    fn hgetall(&self, key: &str) -> StoreResult<Vec<(String, String)>> {
        self.check()?;
        self.inner.hgetall(key)
    }
}

fn clock() -> Arc<ManualClock> {
    Arc::new(ManualClock::new(
        DateTime::from_timestamp(1_700_000_000, 0).unwrap(),
    ))
}

fn config() -> EngineConfig {
    EngineConfig {
        store_retries: 2,
        store_backoff: Duration::ZERO,
        ..EngineConfig::ephemeral()
    }
}

fn request(id: &str) -> PredictionRequest {
    let p = Prob3::new(0.5, 0.3, 0.2);
    PredictionRequest {
        match_id: id.to_string(),
        votes: [
            ModelVote::new(SubModel::Dense, p),
            ModelVote::new(SubModel::Lstm, p),
            ModelVote::new(SubModel::Cnn, p),
        ],
        context: MatchContext::new("Serie A"),
        expected_goals: None,
        odds: None,
    }
}

#[test]
fn outage_still_serves_raw_forecasts() {
    let clock = clock();
    let store = Arc::new(FlakyStore::new(clock.clone(), true));
    let engine = ForecastEngine::new(config(), store.clone(), clock.clone());

    for i in 0..30 {
        let forecast = engine.predict(&request(&format!("m{i}")));
        assert!(!forecast.context.applied);
        assert_eq!(forecast.context.sample_size, 0);
        assert_eq!(forecast.probabilities, forecast.ensemble.probabilities);
        engine
            .record_result(&forecast.prediction_id, Outcome::Home)
            .unwrap();
    }

    // Monitoring lives in process, so it keeps working.
    let metrics = engine.cached_metrics();
    assert_eq!(metrics.total_predictions, 30);
    assert!(engine.context_summaries().is_empty());
    assert!(matches!(
        engine.record_result("m0-missing", Outcome::Home),
        Err(MonitorError::NotFound(_))
    ));
}

#[test]
fn transient_errors_are_retried_a_bounded_number_of_times() {
    let clock = clock();
    let store = Arc::new(FlakyStore::new(clock.clone(), true));
    let engine = ForecastEngine::new(config(), store.clone(), clock.clone());

    store.calls.store(0, Ordering::SeqCst);
    let forecast = engine.predict(&request("m1"));
    assert!(!forecast.context.applied);
    // One curve read plus one record write, each tried three times.
    assert_eq!(store.calls.load(Ordering::SeqCst), 6);
}

#[test]
fn curves_resume_once_the_store_recovers() {
    let clock = clock();
    let store = Arc::new(FlakyStore::new(clock.clone(), false));
    let engine = ForecastEngine::new(config(), store.clone(), clock.clone());

    for i in 0..20 {
        let forecast = engine.predict(&request(&format!("m{i}")));
        engine
            .record_result(&forecast.prediction_id, Outcome::Home)
            .unwrap();
    }
    assert!(engine.predict(&request("warm")).context.applied);

    // Cached curve keeps serving through an outage.
    store.down.store(true, Ordering::SeqCst);
    assert!(engine.predict(&request("cached")).context.applied);

    // Updates during the outage stay in process until the store takes them.
    let forecast = engine.predict(&request("during"));
    engine
        .record_result(&forecast.prediction_id, Outcome::Draw)
        .unwrap();
    store.down.store(false, Ordering::SeqCst);
    let after = engine.predict(&request("after"));
    assert!(after.context.applied);
    assert_eq!(after.context.sample_size, 21);

    // The first write after recovery builds on the outage update.
    engine
        .record_result(&after.prediction_id, Outcome::Home)
        .unwrap();
    engine.dynamic().invalidate_cache();
    let reloaded = engine.predict(&request("reloaded"));
    assert_eq!(reloaded.context.sample_size, 22);
    let summaries = engine.context_summaries();
    assert_eq!(summaries.len(), 1);
    assert_eq!(summaries[0].sample_size, 22);
}
