use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::calibration::{self, Outcome, Prob3};
use crate::confidence_bands::{self, ConfidenceBandRow};
use crate::error::MonitorError;
use crate::store::{self, KeyValueStore, RetryPolicy};

pub const MAX_PREDICTIONS: usize = 1000;
pub const BASELINE_MIN_SAMPLES: usize = 100;
/// Outcome-known records the current window needs before it is compared with the baseline.
pub const DRIFT_MIN_SAMPLES: usize = BASELINE_MIN_SAMPLES;
pub const HEALTH_MIN_SAMPLES: usize = 50;
pub const ROI_MIN_BETS: usize = 20;

pub const METRICS_KEY: &str = "metrics:accuracy";
pub const BASELINE_KEY: &str = "metrics:baseline";
pub const PREDICTION_TTL: Duration = Duration::from_secs(90 * 24 * 60 * 60);
pub const METRICS_TTL: Duration = Duration::from_secs(60 * 60);

/// Decimal odds offered for each outcome.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MarketOdds {
    pub home: f64,
    pub draw: f64,
    pub away: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PredictionRecord {
    pub id: String,
    pub match_id: String,
    pub timestamp: DateTime<Utc>,
    pub raw_prediction: Prob3,
    pub confidence: f64,
    pub agreement: f64,
    #[serde(default)]
    pub context_key: Option<String>,
    #[serde(default)]
    pub calibrated: Option<Prob3>,
    #[serde(default)]
    pub odds: Option<MarketOdds>,
    #[serde(default)]
    pub outcome: Option<Outcome>,
    #[serde(default)]
    pub correct: Option<bool>,
    #[serde(default)]
    pub brier_score: Option<f64>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct OutcomeStats {
    pub total: usize,
    pub correct: usize,
    pub accuracy: f64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ByOutcome {
    pub home: OutcomeStats,
    pub draw: OutcomeStats,
    pub away: OutcomeStats,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct RollingMetrics {
    pub accuracy: f64,
    pub brier_score: f64,
    /// Percent return on unit stakes placed on the leading outcome.
    pub roi: f64,
    /// Outcome-known records in the window.
    pub total_predictions: usize,
    pub pending: usize,
    pub bets: usize,
    pub by_outcome: ByOutcome,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DriftSeverity {
    None,
    Low,
    Medium,
    High,
    Critical,
}

/// Positive values mean the current window is worse than the baseline.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct DriftMetrics {
    pub accuracy_drift: f64,
    pub brier_drift: f64,
    pub roi_drift: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DriftReport {
    pub drift_detected: bool,
    pub severity: DriftSeverity,
    pub metrics: DriftMetrics,
    pub baseline: Option<RollingMetrics>,
    pub current: RollingMetrics,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Initializing,
    Healthy,
    Degraded,
    Critical,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthReport {
    pub status: HealthStatus,
    pub reasons: Vec<String>,
    pub metrics: RollingMetrics,
}

impl MarketOdds {
    pub fn get(&self, outcome: Outcome) -> f64 {
        match outcome {
            Outcome::Home => self.home,
            Outcome::Draw => self.draw,
            Outcome::Away => self.away,
        }
    }
}

impl PredictionRecord {
    pub fn new(
        id: impl Into<String>,
        match_id: impl Into<String>,
        timestamp: DateTime<Utc>,
        raw_prediction: Prob3,
        confidence: f64,
        agreement: f64,
    ) -> Self {
        Self {
            id: id.into(),
            match_id: match_id.into(),
            timestamp,
            raw_prediction,
            confidence,
            agreement,
            context_key: None,
            calibrated: None,
            odds: None,
            outcome: None,
            correct: None,
            brier_score: None,
        }
    }

    pub fn predicted_outcome(&self) -> Outcome {
        calibration::argmax(self.raw_prediction)
    }

    pub fn is_resolved(&self) -> bool {
        self.outcome.is_some()
    }

    fn resolve(&mut self, actual: Outcome) {
        self.outcome = Some(actual);
        self.correct = Some(self.predicted_outcome() == actual);
        self.brier_score = Some(calibration::brier_score(self.raw_prediction, actual));
    }

    /// Profit on a unit stake at the record's odds, if it has odds and an outcome.
    fn bet_return(&self) -> Option<f64> {
        let odds = self.odds?;
        let correct = self.correct?;
        Some(if correct {
            odds.get(self.predicted_outcome()) - 1.0
        } else {
            -1.0
        })
    }
}

impl OutcomeStats {
    fn finish(mut self) -> Self {
        self.accuracy = if self.total > 0 {
            self.correct as f64 / self.total as f64
        } else {
            0.0
        };
        self
    }
}

impl ByOutcome {
    pub fn get(&self, outcome: Outcome) -> &OutcomeStats {
        match outcome {
            Outcome::Home => &self.home,
            Outcome::Draw => &self.draw,
            Outcome::Away => &self.away,
        }
    }

    fn get_mut(&mut self, outcome: Outcome) -> &mut OutcomeStats {
        match outcome {
            Outcome::Home => &mut self.home,
            Outcome::Draw => &mut self.draw,
            Outcome::Away => &mut self.away,
        }
    }
}

pub fn compute_metrics<'a>(records: impl IntoIterator<Item = &'a PredictionRecord>) -> RollingMetrics {
    let mut out = RollingMetrics::default();
    let mut correct = 0usize;
    let mut brier_sum = 0.0;
    let mut profit = 0.0;

    for record in records {
        let (Some(actual), Some(hit)) = (record.outcome, record.correct) else {
            out.pending += 1;
            continue;
        };
        out.total_predictions += 1;
        if hit {
            correct += 1;
        }
        brier_sum += record
            .brier_score
            .unwrap_or_else(|| calibration::brier_score(record.raw_prediction, actual));

        let stats = out.by_outcome.get_mut(actual);
        stats.total += 1;
        if hit {
            stats.correct += 1;
        }

        if let Some(ret) = record.bet_return() {
            out.bets += 1;
            profit += ret;
        }
    }

    if out.total_predictions > 0 {
        let n = out.total_predictions as f64;
        out.accuracy = correct as f64 / n;
        out.brier_score = brier_sum / n;
    }
    if out.bets > 0 {
        out.roi = 100.0 * profit / out.bets as f64;
    }
    out.by_outcome.home = out.by_outcome.home.finish();
    out.by_outcome.draw = out.by_outcome.draw.finish();
    out.by_outcome.away = out.by_outcome.away.finish();
    out
}

pub fn drift_between(baseline: &RollingMetrics, current: &RollingMetrics) -> DriftReport {
    let metrics = DriftMetrics {
        accuracy_drift: baseline.accuracy - current.accuracy,
        brier_drift: current.brier_score - baseline.brier_score,
        roi_drift: baseline.roi - current.roi,
    };
    let severity = classify_drift(&metrics);
    DriftReport {
        drift_detected: severity != DriftSeverity::None,
        severity,
        metrics,
        baseline: Some(*baseline),
        current: *current,
    }
}

pub fn classify_drift(m: &DriftMetrics) -> DriftSeverity {
    if m.accuracy_drift > 0.10 || m.brier_drift > 0.05 || m.roi_drift > 10.0 {
        DriftSeverity::Critical
    } else if m.accuracy_drift > 0.07 || m.brier_drift > 0.03 || m.roi_drift > 7.0 {
        DriftSeverity::High
    } else if m.accuracy_drift > 0.05 || m.brier_drift > 0.02 || m.roi_drift > 5.0 {
        DriftSeverity::Medium
    } else if m.accuracy_drift > 0.03 || m.brier_drift > 0.01 {
        DriftSeverity::Low
    } else {
        DriftSeverity::None
    }
}

pub fn assess_health(metrics: &RollingMetrics) -> HealthReport {
    let mut reasons = Vec::new();
    if metrics.total_predictions < HEALTH_MIN_SAMPLES {
        reasons.push(format!(
            "{} of {} outcomes needed",
            metrics.total_predictions, HEALTH_MIN_SAMPLES
        ));
        return HealthReport {
            status: HealthStatus::Initializing,
            reasons,
            metrics: *metrics,
        };
    }

    if metrics.accuracy < 0.50 {
        reasons.push(format!("accuracy {:.3} below 0.50", metrics.accuracy));
    }
    if metrics.bets >= ROI_MIN_BETS && metrics.roi < -5.0 {
        reasons.push(format!("roi {:.1}% over {} bets", metrics.roi, metrics.bets));
    }
    if !reasons.is_empty() {
        return HealthReport {
            status: HealthStatus::Critical,
            reasons,
            metrics: *metrics,
        };
    }

    if metrics.accuracy < 0.65 {
        reasons.push(format!("accuracy {:.3} below 0.65", metrics.accuracy));
    }
    if metrics.brier_score > 0.25 {
        reasons.push(format!("brier {:.3} above 0.25", metrics.brier_score));
    }
    let status = if reasons.is_empty() {
        HealthStatus::Healthy
    } else {
        HealthStatus::Degraded
    };
    HealthReport {
        status,
        reasons,
        metrics: *metrics,
    }
}

struct MonitorState {
    records: VecDeque<PredictionRecord>,
    baseline: Option<RollingMetrics>,
    /// Bumped on every resolved outcome; a metrics snapshot taken at an older generation
    /// must not outlive it in the store.
    generation: u64,
}

/// Bounded FIFO window of predictions. One lock guards the window and the baseline; it is
/// released before any store call.
pub struct PredictionMonitor {
    store: Arc<dyn KeyValueStore>,
    retry: RetryPolicy,
    capacity: usize,
    state: Mutex<MonitorState>,
}

impl PredictionMonitor {
    pub fn new(store: Arc<dyn KeyValueStore>, retry: RetryPolicy, capacity: usize) -> Self {
        let baseline = match retry.run("load baseline", || {
            store::get_json::<RollingMetrics>(store.as_ref(), BASELINE_KEY)
        }) {
            Ok(baseline) => baseline,
            Err(err) => {
                warn!(error = %err, "could not load drift baseline, starting without one");
                None
            }
        };
        if baseline.is_some() {
            info!("restored frozen drift baseline");
        }
        Self {
            store,
            retry,
            capacity: capacity.max(1),
            state: Mutex::new(MonitorState {
                records: VecDeque::new(),
                baseline,
                generation: 0,
            }),
        }
    }

    pub fn track_prediction(&self, record: PredictionRecord) {
        {
            let mut state = self.state();
            state.records.retain(|r| r.id != record.id);
            state.records.push_back(record.clone());
            while state.records.len() > self.capacity {
                if let Some(evicted) = state.records.pop_front() {
                    debug!(id = %evicted.id, "evicted oldest prediction");
                }
            }
        }
        self.persist_record(&record);
    }

    pub fn update_outcome(&self, id: &str, actual: Outcome) -> Result<PredictionRecord, MonitorError> {
        let (record, frozen) = {
            let mut state = self.state();
            let record = state
                .records
                .iter_mut()
                .find(|r| r.id == id)
                .ok_or_else(|| MonitorError::NotFound(id.to_string()))?;
            if record.is_resolved() {
                return Err(MonitorError::AlreadyResolved(id.to_string()));
            }
            record.resolve(actual);
            let record = record.clone();
            state.generation += 1;

            let mut frozen = None;
            if state.baseline.is_none() {
                let metrics = compute_metrics(state.records.iter());
                if metrics.total_predictions >= BASELINE_MIN_SAMPLES {
                    state.baseline = Some(metrics);
                    frozen = Some(metrics);
                }
            }
            (record, frozen)
        };

        self.persist_record(&record);
        if let Err(err) = self.retry.run("invalidate metrics", || self.store.delete(METRICS_KEY)) {
            warn!(error = %err, "metrics cache invalidation failed");
        }
        if let Some(baseline) = frozen {
            info!(
                accuracy = baseline.accuracy,
                brier = baseline.brier_score,
                roi = baseline.roi,
                samples = baseline.total_predictions,
                "drift baseline frozen"
            );
            if let Err(err) = self.retry.run("persist baseline", || {
                store::set_json(self.store.as_ref(), BASELINE_KEY, &baseline, None)
            }) {
                warn!(error = %err, "baseline persist failed, kept in process");
            }
        }
        Ok(record)
    }

    pub fn get(&self, id: &str) -> Option<PredictionRecord> {
        self.state().records.iter().find(|r| r.id == id).cloned()
    }

    pub fn metrics(&self) -> RollingMetrics {
        compute_metrics(self.state().records.iter())
    }

    /// Metrics snapshot served from the store cache when fresh, recomputed otherwise.
    pub fn cached_metrics(&self) -> RollingMetrics {
        match self.retry.run("read metrics cache", || {
            store::get_json::<RollingMetrics>(self.store.as_ref(), METRICS_KEY)
        }) {
            Ok(Some(metrics)) => return metrics,
            Ok(None) => {}
            Err(err) => warn!(error = %err, "metrics cache unavailable, recomputing"),
        }
        let (metrics, generation) = {
            let state = self.state();
            (compute_metrics(state.records.iter()), state.generation)
        };
        if let Err(err) = self.retry.run("write metrics cache", || {
            store::set_json(self.store.as_ref(), METRICS_KEY, &metrics, Some(METRICS_TTL))
        }) {
            warn!(error = %err, "metrics cache write failed");
            return metrics;
        }
        // An outcome resolved while we were writing; its invalidation may have run first.
        if self.state().generation != generation {
            debug!("metrics snapshot superseded, dropping it");
            if let Err(err) = self.retry.run("invalidate metrics", || self.store.delete(METRICS_KEY)) {
                warn!(error = %err, "metrics cache invalidation failed");
            }
        }
        metrics
    }

    pub fn baseline(&self) -> Option<RollingMetrics> {
        self.state().baseline
    }

    pub fn detect_drift(&self) -> DriftReport {
        let (baseline, current) = {
            let state = self.state();
            (state.baseline, compute_metrics(state.records.iter()))
        };
        let Some(baseline) = baseline else {
            return DriftReport {
                drift_detected: false,
                severity: DriftSeverity::None,
                metrics: DriftMetrics::default(),
                baseline: None,
                current,
            };
        };
        if current.total_predictions < DRIFT_MIN_SAMPLES {
            debug!(
                resolved = current.total_predictions,
                needed = DRIFT_MIN_SAMPLES,
                "too few outcomes in window to compare with baseline"
            );
            return DriftReport {
                drift_detected: false,
                severity: DriftSeverity::None,
                metrics: DriftMetrics::default(),
                baseline: Some(baseline),
                current,
            };
        }
        let report = drift_between(&baseline, &current);
        if report.severity >= DriftSeverity::High {
            warn!(
                severity = ?report.severity,
                accuracy_drift = report.metrics.accuracy_drift,
                brier_drift = report.metrics.brier_drift,
                roi_drift = report.metrics.roi_drift,
                "model drift detected"
            );
        }
        report
    }

    pub fn health_check(&self) -> HealthReport {
        assess_health(&self.metrics())
    }

    pub fn confidence_bands(&self) -> Vec<ConfidenceBandRow> {
        confidence_bands::band_report(self.state().records.iter())
    }

    pub fn records(&self) -> Vec<PredictionRecord> {
        self.state().records.iter().cloned().collect()
    }

    /// `(raw prediction, outcome)` pairs for every resolved record in the window.
    pub fn resolved_samples(&self) -> (Vec<Prob3>, Vec<Outcome>) {
        self.state()
            .records
            .iter()
            .filter_map(|r| r.outcome.map(|o| (r.raw_prediction, o)))
            .unzip()
    }

    pub fn len(&self) -> usize {
        self.state().records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn state(&self) -> MutexGuard<'_, MonitorState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn persist_record(&self, record: &PredictionRecord) {
        let key = format!("prediction:{}", record.id);
        if let Err(err) = self.retry.run("persist prediction", || {
            store::set_json(self.store.as_ref(), &key, record, Some(PREDICTION_TTL))
        }) {
            warn!(id = %record.id, error = %err, "prediction persist failed");
        }
    }
}
