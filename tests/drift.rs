use std::sync::Arc;

use chrono::DateTime;

use matchcast::calibration::{Outcome, Prob3};
use matchcast::clock::ManualClock;
use matchcast::monitor::{
    DriftSeverity, HealthStatus, MarketOdds, PredictionMonitor, PredictionRecord, RollingMetrics,
    drift_between,
};
use matchcast::store::{MemoryStore, RetryPolicy};

fn monitor(capacity: usize) -> PredictionMonitor {
    let clock = Arc::new(ManualClock::new(
        DateTime::from_timestamp(1_700_000_000, 0).unwrap(),
    ));
    PredictionMonitor::new(
        Arc::new(MemoryStore::new(clock)),
        RetryPolicy::none(),
        capacity,
    )
}

fn home_favourite(id: usize, odds: Option<MarketOdds>) -> PredictionRecord {
    let mut rec = PredictionRecord::new(
        format!("p{id}"),
        format!("m{id}"),
        DateTime::from_timestamp(1_700_000_000 + id as i64, 0).unwrap(),
        Prob3::new(0.55, 0.25, 0.20),
        0.2,
        0.95,
    );
    rec.odds = odds;
    rec
}

#[test]
fn sustained_misses_after_baseline_are_critical() {
    let m = monitor(1000);
    for i in 0..140 {
        m.track_prediction(home_favourite(i, None));
    }
    // 75 of the first 100 land.
    for i in 0..100 {
        let actual = if i % 4 == 0 { Outcome::Draw } else { Outcome::Home };
        m.update_outcome(&format!("p{i}"), actual).unwrap();
    }
    let baseline = m.baseline().unwrap();
    assert!((baseline.accuracy - 0.75).abs() < 1e-12);
    assert_eq!(m.detect_drift().severity, DriftSeverity::None);
    assert_eq!(m.health_check().status, HealthStatus::Healthy);

    for i in 100..140 {
        m.update_outcome(&format!("p{i}"), Outcome::Away).unwrap();
    }
    let report = m.detect_drift();
    // 75 / 140 correct.
    assert!((report.current.accuracy - 75.0 / 140.0).abs() < 1e-12);
    assert!(report.drift_detected);
    assert_eq!(report.severity, DriftSeverity::Critical);
    assert_eq!(report.baseline, Some(baseline));
    assert_eq!(m.health_check().status, HealthStatus::Degraded);
}

#[test]
fn window_accuracy_only_counts_retained_records() {
    let m = monitor(50);
    for i in 0..80 {
        m.track_prediction(home_favourite(i, None));
        let actual = if i < 30 { Outcome::Away } else { Outcome::Home };
        m.update_outcome(&format!("p{i}"), actual).unwrap();
    }
    let metrics = m.metrics();
    assert_eq!(metrics.total_predictions, 50);
    assert_eq!(metrics.accuracy, 1.0);
    assert_eq!(m.records().first().unwrap().id, "p30");
}

#[test]
fn losing_bets_turn_health_critical() {
    let m = monitor(1000);
    let odds = MarketOdds {
        home: 1.9,
        draw: 3.4,
        away: 4.2,
    };
    // 70% hit rate at 1.9 is profitable; the next 30 all lose.
    for i in 0..60 {
        m.track_prediction(home_favourite(i, Some(odds)));
        let actual = if i % 10 < 7 { Outcome::Home } else { Outcome::Away };
        m.update_outcome(&format!("p{i}"), actual).unwrap();
    }
    let healthy = m.metrics();
    assert_eq!(healthy.bets, 60);
    assert!(healthy.roi > 0.0);
    assert_eq!(m.health_check().status, HealthStatus::Healthy);

    for i in 60..90 {
        m.track_prediction(home_favourite(i, Some(odds)));
        m.update_outcome(&format!("p{i}"), Outcome::Draw).unwrap();
    }
    let report = m.health_check();
    assert_eq!(report.status, HealthStatus::Critical);
    assert!(report.metrics.roi < -5.0);
}

#[test]
fn roi_degradation_alone_reaches_critical() {
    let base = RollingMetrics {
        accuracy: 0.70,
        brier_score: 0.15,
        roi: 5.0,
        total_predictions: 200,
        ..RollingMetrics::default()
    };
    let current = RollingMetrics {
        roi: -6.0,
        ..base
    };
    let report = drift_between(&base, &current);
    assert_eq!(report.severity, DriftSeverity::Critical);
    assert!((report.metrics.roi_drift - 11.0).abs() < 1e-9);
}
