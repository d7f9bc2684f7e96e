use std::sync::{Arc, RwLock};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::calibration::{Outcome, Prob3};
use crate::clock::Clock;
use crate::config::EngineConfig;
use crate::confidence_bands::ConfidenceBandRow;
use crate::context::MatchContext;
use crate::dynamic_calibration::{ContextCalibration, ContextSummary, DynamicCalibrator};
use crate::ensemble::{self, EnsembleOutput, EnsembleWeights, ModelVote};
use crate::error::MonitorError;
use crate::isotonic::IsotonicCalibrator;
use crate::monitor::{
    DriftReport, HealthReport, MarketOdds, PredictionMonitor, PredictionRecord, RollingMetrics,
};
use crate::poisson::{ExpectedScore, GoalsLine, PoissonPrediction, PoissonScoreModel, Scoreline};
use crate::store::{self, KeyValueStore, MemoryStore, SqliteStore};

pub const ISOTONIC_KEY: &str = "calibration:isotonic";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PredictionRequest {
    pub match_id: String,
    pub votes: [ModelVote; 3],
    pub context: MatchContext,
    #[serde(default)]
    pub expected_goals: Option<ExpectedScore>,
    #[serde(default)]
    pub odds: Option<MarketOdds>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GoalMarkets {
    pub over_2_5: f64,
    pub under_2_5: f64,
    pub btts: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoreForecast {
    pub probs: Prob3,
    pub most_likely_score: Scoreline,
    pub most_likely_prob: f64,
    pub expected_score: ExpectedScore,
    pub top_scores: Vec<(Scoreline, f64)>,
    pub markets: GoalMarkets,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchForecast {
    pub prediction_id: String,
    pub match_id: String,
    pub ensemble: EnsembleOutput,
    pub isotonic: Prob3,
    pub context: ContextCalibration,
    /// What the caller should show.
    pub probabilities: Prob3,
    pub score: Option<ScoreForecast>,
}

impl From<PoissonPrediction> for ScoreForecast {
    fn from(pred: PoissonPrediction) -> Self {
        let markets = GoalMarkets {
            over_2_5: pred.total_goals_probability(2.5, GoalsLine::Over),
            under_2_5: pred.total_goals_probability(2.5, GoalsLine::Under),
            btts: pred.btts_probability(),
        };
        Self {
            probs: pred.probs,
            most_likely_score: pred.most_likely_score,
            most_likely_prob: pred.most_likely_prob,
            expected_score: pred.expected_score,
            top_scores: pred.score_matrix.top_scores(5),
            markets,
        }
    }
}

impl MatchForecast {
    pub fn leading_outcome(&self) -> Outcome {
        crate::calibration::argmax(self.probabilities)
    }
}

pub struct ForecastEngine {
    config: EngineConfig,
    store: Arc<dyn KeyValueStore>,
    clock: Arc<dyn Clock>,
    poisson: PoissonScoreModel,
    isotonic: RwLock<IsotonicCalibrator>,
    dynamic: DynamicCalibrator,
    monitor: PredictionMonitor,
}

impl ForecastEngine {
    pub fn new(config: EngineConfig, store: Arc<dyn KeyValueStore>, clock: Arc<dyn Clock>) -> Self {
        let retry = config.retry_policy();
        let isotonic = match retry.run("load isotonic", || {
            store::get_json::<IsotonicCalibrator>(store.as_ref(), ISOTONIC_KEY)
        }) {
            Ok(Some(cal)) => {
                info!(samples = cal.trained_on(), "restored isotonic calibrator");
                cal
            }
            Ok(None) => IsotonicCalibrator::new(),
            Err(err) => {
                warn!(error = %err, "isotonic state unavailable, starting untrained");
                IsotonicCalibrator::new()
            }
        };

        let dynamic = DynamicCalibrator::new(
            store.clone(),
            clock.clone(),
            retry,
            config.curve_cache_capacity,
            config.curve_cache_ttl_chrono(),
        );
        let monitor = PredictionMonitor::new(store.clone(), retry, config.max_predictions);

        Self {
            config,
            store,
            clock,
            poisson: PoissonScoreModel::new(),
            isotonic: RwLock::new(isotonic),
            dynamic,
            monitor,
        }
    }

    /// Opens the store named by the config (SQLite file, or in-memory when no path).
    pub fn open(config: EngineConfig, clock: Arc<dyn Clock>) -> Result<Self> {
        let store: Arc<dyn KeyValueStore> = match &config.db_path {
            Some(path) => Arc::new(
                SqliteStore::open(path, config.store_timeout, clock.clone())
                    .with_context(|| format!("open store at {}", path.display()))?,
            ),
            None => Arc::new(MemoryStore::new(clock.clone())),
        };
        Ok(Self::new(config, store, clock))
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn weights(&self) -> &EnsembleWeights {
        &self.config.weights
    }

    pub fn predict(&self, request: &PredictionRequest) -> MatchForecast {
        let ensemble = ensemble::combine(&request.votes, &self.config.weights);
        let raw = ensemble.probabilities;

        let isotonic = self
            .isotonic
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .calibrate(raw);
        let context = self.dynamic.calibrate(raw, &request.context);
        let probabilities = if context.applied {
            context.calibrated
        } else {
            isotonic
        };

        let score = request
            .expected_goals
            .map(|xg| ScoreForecast::from(self.poisson.predict(xg.home, xg.away)));

        let now = self.clock.now();
        let prediction_id = format!("{}-{}", request.match_id, Uuid::new_v4());
        let mut record = PredictionRecord::new(
            prediction_id.clone(),
            request.match_id.clone(),
            now,
            raw,
            ensemble.confidence,
            ensemble.agreement,
        );
        record.context_key = Some(context.context_key.clone());
        record.calibrated = Some(probabilities);
        record.odds = request.odds;
        self.monitor.track_prediction(record);

        debug!(
            prediction = %prediction_id,
            context = %context.context_key,
            applied = context.applied,
            confidence = ensemble.confidence,
            "forecast issued"
        );

        MatchForecast {
            prediction_id,
            match_id: request.match_id.clone(),
            ensemble,
            isotonic,
            context,
            probabilities,
            score,
        }
    }

    /// Finalizes a prediction and feeds its context curve.
    pub fn record_result(&self, prediction_id: &str, actual: Outcome) -> Result<PredictionRecord, MonitorError> {
        let record = self.monitor.update_outcome(prediction_id, actual)?;
        if let Some(key) = &record.context_key {
            self.dynamic.record_outcome(key, record.raw_prediction, actual);
        }
        Ok(record)
    }

    /// Refits the global curve on every resolved prediction in the window. Returns the
    /// number of samples used; with none, the current curve is kept.
    pub fn retrain_isotonic(&self) -> usize {
        let (predictions, outcomes) = self.monitor.resolved_samples();
        if predictions.is_empty() {
            debug!("isotonic retrain skipped: no resolved predictions");
            return 0;
        }
        let mut fitted = IsotonicCalibrator::new();
        fitted.train(&predictions, &outcomes);
        let samples = fitted.trained_on();

        if let Err(err) = self.config.retry_policy().run("persist isotonic", || {
            store::set_json(self.store.as_ref(), ISOTONIC_KEY, &fitted, None)
        }) {
            warn!(error = %err, "isotonic persist failed, serving in-process copy");
        }
        *self.isotonic.write().unwrap_or_else(|e| e.into_inner()) = fitted;
        info!(samples, "isotonic calibrator retrained");
        samples
    }

    pub fn isotonic(&self) -> IsotonicCalibrator {
        self.isotonic
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn monitor(&self) -> &PredictionMonitor {
        &self.monitor
    }

    pub fn dynamic(&self) -> &DynamicCalibrator {
        &self.dynamic
    }

    pub fn metrics(&self) -> RollingMetrics {
        self.monitor.metrics()
    }

    pub fn cached_metrics(&self) -> RollingMetrics {
        self.monitor.cached_metrics()
    }

    pub fn detect_drift(&self) -> DriftReport {
        self.monitor.detect_drift()
    }

    pub fn health_check(&self) -> HealthReport {
        self.monitor.health_check()
    }

    pub fn confidence_bands(&self) -> Vec<ConfidenceBandRow> {
        self.monitor.confidence_bands()
    }

    pub fn context_summaries(&self) -> Vec<ContextSummary> {
        match self.dynamic.context_summaries() {
            Ok(rows) => rows,
            Err(err) => {
                warn!(error = %err, "context summaries unavailable");
                Vec::new()
            }
        }
    }
}
