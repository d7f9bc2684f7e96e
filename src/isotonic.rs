use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::calibration::{Outcome, Prob3};

pub const ISOTONIC_BINS: usize = 20;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct IsotonicBin {
    pub threshold: f64,
    pub calibrated: f64,
    pub count: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IsotonicCalibrator {
    bins: Vec<IsotonicBin>,
    trained_on: usize,
}

impl IsotonicCalibrator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_trained(&self) -> bool {
        !self.bins.is_empty()
    }

    pub fn bins(&self) -> &[IsotonicBin] {
        &self.bins
    }

    pub fn trained_on(&self) -> usize {
        self.trained_on
    }

    /// Refits from scratch on up to `ISOTONIC_BINS` equal-count bins of home probability.
    /// Empty or mismatched input leaves the calibrator untrained.
    pub fn train(&mut self, predictions: &[Prob3], actuals: &[Outcome]) {
        if predictions.is_empty() || predictions.len() != actuals.len() {
            warn!(
                predictions = predictions.len(),
                actuals = actuals.len(),
                "isotonic training skipped: empty or mismatched input"
            );
            self.bins.clear();
            self.trained_on = 0;
            return;
        }

        let mut samples: Vec<(f64, f64)> = predictions
            .iter()
            .zip(actuals)
            .map(|(p, a)| {
                let hit = if *a == Outcome::Home { 1.0 } else { 0.0 };
                (p.home, hit)
            })
            .filter(|(p, _)| p.is_finite())
            .collect();
        samples.sort_by(|a, b| a.0.total_cmp(&b.0));

        let n = samples.len();
        let bin_count = ISOTONIC_BINS.min(n);
        if bin_count == 0 {
            self.bins.clear();
            self.trained_on = 0;
            return;
        }
        let bin_size = n / bin_count;

        let mut raw_bins: Vec<IsotonicBin> = Vec::with_capacity(bin_count);
        for b in 0..bin_count {
            let start = b * bin_size;
            let end = if b == bin_count - 1 { n } else { start + bin_size };
            let chunk = &samples[start..end];
            if chunk.is_empty() {
                continue;
            }
            let count = chunk.len();
            let avg_pred = chunk.iter().map(|(p, _)| p).sum::<f64>() / count as f64;
            let avg_actual = chunk.iter().map(|(_, y)| y).sum::<f64>() / count as f64;
            raw_bins.push(IsotonicBin {
                threshold: avg_pred,
                calibrated: avg_actual,
                count,
            });
        }

        let mut bins = pool_equal_thresholds(raw_bins);
        for i in 1..bins.len() {
            bins[i].calibrated = bins[i].calibrated.max(bins[i - 1].calibrated);
        }

        debug!(samples = n, bins = bins.len(), "isotonic calibrator trained");
        self.bins = bins;
        self.trained_on = n;
    }

    /// Maps the home probability through the fitted curve and rescales draw/away to fill
    /// the remainder in their original ratio. Identity while untrained.
    pub fn calibrate(&self, probs: Prob3) -> Prob3 {
        let Some(home) = self.lookup(probs.home) else {
            return probs;
        };
        let home = home.clamp(0.0, 1.0);
        let remaining = 1.0 - home;
        let rest = probs.draw + probs.away;
        let (draw, away) = if rest > 0.0 {
            (remaining * probs.draw / rest, remaining * probs.away / rest)
        } else {
            (remaining / 2.0, remaining / 2.0)
        };
        Prob3 { home, draw, away }
    }

    fn lookup(&self, p: f64) -> Option<f64> {
        let last = self.bins.last()?;
        Some(
            self.bins
                .iter()
                .find(|bin| bin.threshold >= p)
                .map(|bin| bin.calibrated)
                .unwrap_or(last.calibrated),
        )
    }
}

fn pool_equal_thresholds(bins: Vec<IsotonicBin>) -> Vec<IsotonicBin> {
    let mut out: Vec<IsotonicBin> = Vec::with_capacity(bins.len());
    for bin in bins {
        match out.last_mut() {
            Some(prev) if bin.threshold <= prev.threshold => {
                let total = prev.count + bin.count;
                prev.calibrated = (prev.calibrated * prev.count as f64
                    + bin.calibrated * bin.count as f64)
                    / total as f64;
                prev.count = total;
            }
            _ => out.push(bin),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn p(home: f64) -> Prob3 {
        let rest = 1.0 - home;
        Prob3::new(home, rest * 0.4, rest * 0.6)
    }

    fn synthetic(n: usize) -> (Vec<Prob3>, Vec<Outcome>) {
        // Deterministic: outcome is home whenever a hashed index falls under the prob.
        let mut preds = Vec::with_capacity(n);
        let mut outs = Vec::with_capacity(n);
        for i in 0..n {
            let home = 0.05 + 0.9 * (i as f64 / n as f64);
            let u = ((i * 7919) % 1000) as f64 / 1000.0;
            preds.push(p(home));
            outs.push(if u < home { Outcome::Home } else { Outcome::Away });
        }
        (preds, outs)
    }

    #[test]
    fn untrained_is_identity() {
        let cal = IsotonicCalibrator::new();
        let x = Prob3::new(0.47, 0.31, 0.22);
        assert_eq!(cal.calibrate(x), x);
        assert!(!cal.is_trained());
    }

    #[test]
    fn calibrated_values_are_monotonic() {
        let (preds, outs) = synthetic(500);
        let mut cal = IsotonicCalibrator::new();
        cal.train(&preds, &outs);
        assert!(cal.is_trained());
        assert_eq!(cal.bins().len(), ISOTONIC_BINS);
        for pair in cal.bins().windows(2) {
            assert!(pair[1].calibrated >= pair[0].calibrated);
            assert!(pair[1].threshold > pair[0].threshold);
        }
        assert_eq!(cal.bins().iter().map(|b| b.count).sum::<usize>(), 500);
    }

    #[test]
    fn last_bin_absorbs_remainder() {
        let (preds, outs) = synthetic(47);
        let mut cal = IsotonicCalibrator::new();
        cal.train(&preds, &outs);
        let bins = cal.bins();
        assert_eq!(bins.len(), 20);
        assert_eq!(bins[0].count, 2);
        assert_eq!(bins[19].count, 9);
    }

    #[test]
    fn forward_pass_lifts_dips() {
        // The 0.5 and 0.6 bins see no home wins and get lifted to 1.0.
        let mut preds = Vec::new();
        let mut outs = Vec::new();
        for (home, hit) in [(0.2, true), (0.3, true), (0.5, false), (0.6, false), (0.8, true)] {
            preds.push(p(home));
            outs.push(if hit { Outcome::Home } else { Outcome::Draw });
        }
        let mut cal = IsotonicCalibrator::new();
        cal.train(&preds, &outs);
        let values: Vec<f64> = cal.bins().iter().map(|b| b.calibrated).collect();
        assert_eq!(values, vec![1.0, 1.0, 1.0, 1.0, 1.0]);
    }

    #[test]
    fn duplicate_thresholds_are_pooled() {
        let preds = vec![p(0.4); 6];
        let outs = vec![
            Outcome::Home,
            Outcome::Away,
            Outcome::Home,
            Outcome::Away,
            Outcome::Away,
            Outcome::Away,
        ];
        let mut cal = IsotonicCalibrator::new();
        cal.train(&preds, &outs);
        assert_eq!(cal.bins().len(), 1);
        assert!((cal.bins()[0].calibrated - 2.0 / 6.0).abs() < 1e-12);
        assert_eq!(cal.bins()[0].count, 6);
    }

    #[test]
    fn calibrate_preserves_draw_away_ratio() {
        let (preds, outs) = synthetic(400);
        let mut cal = IsotonicCalibrator::new();
        cal.train(&preds, &outs);
        let input = Prob3::new(0.5, 0.2, 0.3);
        let out = cal.calibrate(input);
        assert!(out.is_normalized(1e-9));
        assert!((out.draw / out.away - 2.0 / 3.0).abs() < 1e-9);

        let degenerate = cal.calibrate(Prob3::new(1.0, 0.0, 0.0));
        assert!((degenerate.draw - degenerate.away).abs() < 1e-12);
        assert!(degenerate.is_normalized(1e-9));
    }

    #[test]
    fn mismatched_training_resets() {
        let (preds, outs) = synthetic(100);
        let mut cal = IsotonicCalibrator::new();
        cal.train(&preds, &outs);
        cal.train(&preds, &outs[..10]);
        assert!(!cal.is_trained());
    }
}

#[cfg(test)]
mod proptest_tests {
    use super::*;
    use proptest::prelude::*;

    fn arb_training_set() -> impl Strategy<Value = (Vec<Prob3>, Vec<Outcome>)> {
        proptest::collection::vec((0.0_f64..=1.0, 0usize..3), 1..400).prop_map(|rows| {
            rows.into_iter()
                .map(|(home, o)| {
                    let rest = 1.0 - home;
                    (Prob3::new(home, rest * 0.45, rest * 0.55), Outcome::ALL[o])
                })
                .unzip()
        })
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(256))]

        #[test]
        fn calibrated_home_is_non_decreasing(
            (preds, outcomes) in arb_training_set(),
            a in 0.0_f64..=1.0,
            b in 0.0_f64..=1.0,
        ) {
            let mut cal = IsotonicCalibrator::new();
            cal.train(&preds, &outcomes);
            prop_assert!(cal.is_trained());

            let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
            let low = cal.calibrate(Prob3::new(lo, (1.0 - lo) / 2.0, (1.0 - lo) / 2.0));
            let high = cal.calibrate(Prob3::new(hi, (1.0 - hi) / 2.0, (1.0 - hi) / 2.0));
            prop_assert!(low.home <= high.home);
            prop_assert!((0.0..=1.0).contains(&low.home));
            prop_assert!((high.sum() - 1.0).abs() < 1e-9);
        }

        #[test]
        fn fitted_bins_are_strictly_ordered(
            (preds, outcomes) in arb_training_set(),
        ) {
            let mut cal = IsotonicCalibrator::new();
            cal.train(&preds, &outcomes);
            prop_assert_eq!(cal.trained_on(), preds.len());
            for pair in cal.bins().windows(2) {
                prop_assert!(pair[0].threshold < pair[1].threshold);
                prop_assert!(pair[0].calibrated <= pair[1].calibrated);
            }
        }
    }
}
