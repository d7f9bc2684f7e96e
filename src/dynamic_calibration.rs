use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::cache::TtlCache;
use crate::calibration::{self, Outcome, Prob3};
use crate::clock::Clock;
use crate::context::MatchContext;
use crate::error::StoreResult;
use crate::store::{self, KeyValueStore, RetryPolicy};

pub const CURVES_KEY: &str = "calibration:curves";
pub const DYNAMIC_BINS: usize = 10;
pub const MIN_SAMPLES: u32 = 20;
pub const MATURE_SAMPLES: u32 = 100;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CalibrationBin {
    pub threshold_midpoint: f64,
    pub predicted: f64,
    pub actual: f64,
    pub count: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutcomeCurve {
    pub bins: Vec<CalibrationBin>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalibrationCurve {
    pub home: OutcomeCurve,
    pub draw: OutcomeCurve,
    pub away: OutcomeCurve,
    pub last_updated: DateTime<Utc>,
    pub sample_size: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextCalibration {
    pub calibrated: Prob3,
    pub confidence: f64,
    pub context_key: String,
    /// False when the raw probabilities were passed through.
    pub applied: bool,
    pub sample_size: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextSummary {
    pub context_key: String,
    pub sample_size: u32,
    pub mature: bool,
    pub calibration_error: f64,
    pub last_updated: DateTime<Utc>,
}

impl Default for OutcomeCurve {
    fn default() -> Self {
        let bins = (0..DYNAMIC_BINS)
            .map(|i| CalibrationBin {
                threshold_midpoint: (i as f64 + 0.5) / DYNAMIC_BINS as f64,
                predicted: 0.0,
                actual: 0.0,
                count: 0,
            })
            .collect();
        Self { bins }
    }
}

impl OutcomeCurve {
    fn observe(&mut self, predicted: f64, actual: f64) {
        let idx = calibration::bin_index(predicted, self.bins.len());
        if let Some(bin) = self.bins.get_mut(idx) {
            bin.predicted += predicted;
            bin.actual += actual;
            bin.count += 1;
        }
    }

    /// Shifts `p` by the observed bias of its bin; empty bins leave it unchanged.
    pub fn map(&self, p: f64) -> f64 {
        let idx = calibration::bin_index(p, self.bins.len());
        match self.bins.get(idx) {
            Some(bin) if bin.count > 0 => {
                let bias = (bin.actual - bin.predicted) / bin.count as f64;
                (p + bias).clamp(0.0, 1.0)
            }
            _ => p,
        }
    }
}

impl CalibrationCurve {
    pub fn empty(now: DateTime<Utc>) -> Self {
        Self {
            home: OutcomeCurve::default(),
            draw: OutcomeCurve::default(),
            away: OutcomeCurve::default(),
            last_updated: now,
            sample_size: 0,
        }
    }

    pub fn curve(&self, outcome: Outcome) -> &OutcomeCurve {
        match outcome {
            Outcome::Home => &self.home,
            Outcome::Draw => &self.draw,
            Outcome::Away => &self.away,
        }
    }

    fn curve_mut(&mut self, outcome: Outcome) -> &mut OutcomeCurve {
        match outcome {
            Outcome::Home => &mut self.home,
            Outcome::Draw => &mut self.draw,
            Outcome::Away => &mut self.away,
        }
    }

    pub fn observe(&mut self, predicted: Prob3, actual: Prob3, now: DateTime<Utc>) {
        for outcome in Outcome::ALL {
            self.curve_mut(outcome)
                .observe(predicted.get(outcome), actual.get(outcome));
        }
        self.sample_size += 1;
        self.last_updated = now;
    }

    pub fn apply(&self, raw: Prob3) -> Prob3 {
        let mapped = Prob3::new(
            self.home.map(raw.home),
            self.draw.map(raw.draw),
            self.away.map(raw.away),
        );
        if mapped.sum() > 0.0 {
            mapped.normalized()
        } else {
            raw
        }
    }

    /// Count-weighted mean of `|predicted/count - actual/count|` over every populated bin.
    pub fn calibration_error(&self) -> f64 {
        let mut abs_diff = 0.0;
        let mut total = 0u64;
        for outcome in Outcome::ALL {
            for bin in &self.curve(outcome).bins {
                if bin.count == 0 {
                    continue;
                }
                abs_diff += (bin.predicted - bin.actual).abs();
                total += bin.count as u64;
            }
        }
        if total == 0 {
            0.0
        } else {
            abs_diff / total as f64
        }
    }
}

/// Per-context recalibration backed by the key-value store.
///
/// Reads go through a bounded in-process cache. Updates for one context are serialized by
/// a key-scoped lock; neither the cache lock nor the key-lock table is held across store
/// calls. Any store failure degrades to passing raw probabilities through.
///
/// Curves whose persist failed are held in `unsynced` until a later write succeeds, so an
/// update made during an outage is carried forward instead of being replaced by the older
/// stored copy.
pub struct DynamicCalibrator {
    store: Arc<dyn KeyValueStore>,
    clock: Arc<dyn Clock>,
    retry: RetryPolicy,
    cache: Mutex<TtlCache<CalibrationCurve>>,
    unsynced: Mutex<HashMap<String, CalibrationCurve>>,
    key_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl DynamicCalibrator {
    pub fn new(
        store: Arc<dyn KeyValueStore>,
        clock: Arc<dyn Clock>,
        retry: RetryPolicy,
        cache_capacity: usize,
        cache_ttl: Duration,
    ) -> Self {
        Self {
            store,
            clock,
            retry,
            cache: Mutex::new(TtlCache::new(cache_capacity, cache_ttl)),
            unsynced: Mutex::new(HashMap::new()),
            key_locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn calibrate(&self, raw: Prob3, context: &MatchContext) -> ContextCalibration {
        self.calibrate_key(raw, &context.key())
    }

    pub fn calibrate_key(&self, raw: Prob3, context_key: &str) -> ContextCalibration {
        let curve = self.load_curve(context_key);
        let sample_size = curve.as_ref().map(|c| c.sample_size).unwrap_or(0);

        match curve {
            Some(curve) if curve.sample_size >= MIN_SAMPLES => ContextCalibration {
                calibrated: curve.apply(raw),
                confidence: 1.0,
                context_key: context_key.to_string(),
                applied: true,
                sample_size,
            },
            _ => ContextCalibration {
                calibrated: raw,
                confidence: sample_size as f64 / MIN_SAMPLES as f64,
                context_key: context_key.to_string(),
                applied: false,
                sample_size,
            },
        }
    }

    /// Folds one realized outcome (`actual` one-hot) into the context's curve and persists
    /// it. Returns the new sample size, or `None` if the update was skipped.
    pub fn update_curve(&self, context_key: &str, predicted: Prob3, actual: Prob3) -> Option<u32> {
        let key_lock = self.key_lock(context_key);
        let _guard = key_lock.lock().unwrap_or_else(|e| e.into_inner());

        let now = self.clock.now();
        let persisted = self.retry.run("load curve", || {
            store::hget_json::<CalibrationCurve>(self.store.as_ref(), CURVES_KEY, context_key)
        });
        let unsynced = self.unsynced(context_key);
        let mut curve = match persisted {
            Ok(stored) => match (stored, unsynced) {
                (Some(stored), Some(local)) if local.sample_size > stored.sample_size => {
                    debug!(
                        context = context_key,
                        stored = stored.sample_size,
                        local = local.sample_size,
                        "store behind in-process curve, resyncing"
                    );
                    local
                }
                (Some(stored), _) => stored,
                (None, Some(local)) => local,
                (None, None) => CalibrationCurve::empty(now),
            },
            Err(err) => match unsynced.or_else(|| self.cached(context_key)) {
                Some(curve) => {
                    warn!(context = context_key, error = %err, "curve read failed, updating in-process copy");
                    curve
                }
                None => {
                    // Never overwrite a persisted curve we could not read.
                    warn!(context = context_key, error = %err, "curve read failed, update skipped");
                    return None;
                }
            },
        };

        curve.observe(predicted, actual, now);
        let sample_size = curve.sample_size;

        let persisted = self.retry.run("persist curve", || {
            store::hset_json(self.store.as_ref(), CURVES_KEY, context_key, &curve)
        });
        {
            let mut unsynced = self.unsynced.lock().unwrap_or_else(|e| e.into_inner());
            match persisted {
                Ok(()) => {
                    unsynced.remove(context_key);
                }
                Err(err) => {
                    warn!(context = context_key, error = %err, "curve persist failed, keeping in-process copy");
                    unsynced.insert(context_key.to_string(), curve.clone());
                }
            }
        }

        self.cache
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(context_key, curve, now);
        debug!(context = context_key, sample_size, "calibration curve updated");
        Some(sample_size)
    }

    pub fn record_outcome(&self, context_key: &str, predicted: Prob3, actual: Outcome) -> Option<u32> {
        self.update_curve(context_key, predicted, calibration::one_hot(actual))
    }

    pub fn curve(&self, context_key: &str) -> Option<CalibrationCurve> {
        self.load_curve(context_key)
    }

    pub fn calibration_error(&self, context_key: &str) -> Option<f64> {
        self.load_curve(context_key).map(|c| c.calibration_error())
    }

    pub fn context_summaries(&self) -> StoreResult<Vec<ContextSummary>> {
        let rows = self
            .retry
            .run("list curves", || self.store.hgetall(CURVES_KEY))?;
        let mut out = Vec::with_capacity(rows.len());
        for (key, raw) in rows {
            match serde_json::from_str::<CalibrationCurve>(&raw) {
                Ok(curve) => out.push(ContextSummary {
                    calibration_error: curve.calibration_error(),
                    mature: curve.sample_size >= MATURE_SAMPLES,
                    sample_size: curve.sample_size,
                    last_updated: curve.last_updated,
                    context_key: key,
                }),
                Err(err) => warn!(context = %key, error = %err, "skipping undecodable curve"),
            }
        }
        Ok(out)
    }

    pub fn invalidate_cache(&self) {
        self.cache.lock().unwrap_or_else(|e| e.into_inner()).clear();
    }

    fn load_curve(&self, context_key: &str) -> Option<CalibrationCurve> {
        if let Some(curve) = self.cached(context_key) {
            return Some(curve);
        }

        let loaded = self.retry.run("load curve", || {
            store::hget_json::<CalibrationCurve>(self.store.as_ref(), CURVES_KEY, context_key)
        });
        let unsynced = self.unsynced(context_key);
        let curve = match loaded {
            Ok(Some(stored)) => match unsynced {
                Some(local) if local.sample_size > stored.sample_size => local,
                _ => stored,
            },
            Ok(None) => unsynced?,
            Err(err) => match unsynced {
                Some(local) => {
                    warn!(context = context_key, error = %err, "calibration store unavailable, serving in-process curve");
                    local
                }
                None => {
                    warn!(context = context_key, error = %err, "calibration store unavailable, passing raw probabilities");
                    return None;
                }
            },
        };
        let now = self.clock.now();
        self.cache
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(context_key, curve.clone(), now);
        Some(curve)
    }

    fn unsynced(&self, context_key: &str) -> Option<CalibrationCurve> {
        self.unsynced
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(context_key)
            .cloned()
    }

    fn cached(&self, context_key: &str) -> Option<CalibrationCurve> {
        let now = self.clock.now();
        self.cache
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(context_key, now)
    }

    fn key_lock(&self, context_key: &str) -> Arc<Mutex<()>> {
        let mut locks = self.key_locks.lock().unwrap_or_else(|e| e.into_inner());
        locks
            .entry(context_key.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }
}
