use serde::{Deserialize, Serialize};

use crate::monitor::PredictionRecord;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ConfidenceBand {
    pub label: &'static str,
    /// Inclusive.
    pub lower: f64,
    /// Exclusive; `None` for the top band.
    pub upper: Option<f64>,
    /// Expected accuracy reported for a band with no predictions.
    pub midpoint: f64,
}

pub static BANDS: [ConfidenceBand; 5] = [
    ConfidenceBand {
        label: "Very High",
        lower: 0.85,
        upper: None,
        midpoint: 0.925,
    },
    ConfidenceBand {
        label: "High",
        lower: 0.75,
        upper: Some(0.85),
        midpoint: 0.80,
    },
    ConfidenceBand {
        label: "Medium-High",
        lower: 0.65,
        upper: Some(0.75),
        midpoint: 0.70,
    },
    ConfidenceBand {
        label: "Medium",
        lower: 0.55,
        upper: Some(0.65),
        midpoint: 0.60,
    },
    ConfidenceBand {
        label: "Low",
        lower: f64::NEG_INFINITY,
        upper: Some(0.55),
        midpoint: 0.50,
    },
];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfidenceBandRow {
    pub band: String,
    pub predictions: usize,
    pub correct: usize,
    pub accuracy: f64,
    pub expected_accuracy: f64,
    /// `accuracy - expected_accuracy`; negative means overconfident.
    pub calibration_error: f64,
}

impl ConfidenceBand {
    pub fn contains(&self, confidence: f64) -> bool {
        confidence >= self.lower && self.upper.is_none_or(|u| confidence < u)
    }
}

pub fn band_for(confidence: f64) -> &'static ConfidenceBand {
    &BANDS[band_index(confidence)]
}

fn band_index(confidence: f64) -> usize {
    let c = if confidence.is_finite() { confidence } else { 0.0 };
    BANDS
        .iter()
        .position(|b| b.contains(c))
        .unwrap_or(BANDS.len() - 1)
}

/// Accuracy per confidence band over resolved records, highest band first.
pub fn band_report<'a>(
    records: impl IntoIterator<Item = &'a PredictionRecord>,
) -> Vec<ConfidenceBandRow> {
    let mut counts = [(0usize, 0usize, 0.0f64); 5];
    for record in records {
        let Some(hit) = record.correct else {
            continue;
        };
        let slot = &mut counts[band_index(record.confidence)];
        slot.0 += 1;
        if hit {
            slot.1 += 1;
        }
        slot.2 += record.confidence;
    }

    BANDS
        .iter()
        .zip(counts)
        .map(|(band, (n, correct, conf_sum))| {
            let (accuracy, expected) = if n > 0 {
                (correct as f64 / n as f64, conf_sum / n as f64)
            } else {
                (0.0, band.midpoint)
            };
            ConfidenceBandRow {
                band: band.label.to_string(),
                predictions: n,
                correct,
                accuracy,
                expected_accuracy: expected,
                calibration_error: accuracy - expected,
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use chrono::DateTime;

    use super::*;
    use crate::calibration::{Outcome, Prob3};

    fn resolved(confidence: f64, hit: bool) -> PredictionRecord {
        let mut rec = PredictionRecord::new(
            "p",
            "m",
            DateTime::from_timestamp(0, 0).unwrap(),
            Prob3::new(0.6, 0.2, 0.2),
            confidence,
            1.0,
        );
        rec.outcome = Some(if hit { Outcome::Home } else { Outcome::Away });
        rec.correct = Some(hit);
        rec
    }

    #[test]
    fn band_edges() {
        assert_eq!(band_for(0.85).label, "Very High");
        assert_eq!(band_for(0.8499).label, "High");
        assert_eq!(band_for(0.65).label, "Medium-High");
        assert_eq!(band_for(0.55).label, "Medium");
        assert_eq!(band_for(0.10).label, "Low");
        assert_eq!(band_for(f64::NAN).label, "Low");
    }

    #[test]
    fn overconfident_band_has_negative_error() {
        let records = vec![
            resolved(0.90, true),
            resolved(0.90, false),
            resolved(0.60, true),
        ];
        let report = band_report(records.iter());
        assert_eq!(report.len(), 5);
        let top = &report[0];
        assert_eq!(top.predictions, 2);
        assert!((top.accuracy - 0.5).abs() < 1e-12);
        assert!((top.calibration_error + 0.4).abs() < 1e-9);

        let empty = &report[1];
        assert_eq!(empty.predictions, 0);
        assert_eq!(empty.expected_accuracy, 0.80);
        assert!((empty.calibration_error + 0.80).abs() < 1e-12);
        assert_eq!(report[3].correct, 1);
    }

    #[test]
    fn pending_records_are_skipped() {
        let mut rec = resolved(0.9, true);
        rec.outcome = None;
        rec.correct = None;
        let report = band_report([&rec]);
        assert!(report.iter().all(|r| r.predictions == 0));
    }
}
