use serde::{Deserialize, Serialize};

use crate::calibration::{self, Outcome, Prob3};
use crate::error::ConfigError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SubModel {
    Dense,
    Lstm,
    Cnn,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ModelVote {
    pub model: SubModel,
    pub probs: Prob3,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EnsembleWeights {
    pub dense: f64,
    pub lstm: f64,
    pub cnn: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EnsembleOutput {
    pub probabilities: Prob3,
    /// `max_prob * (1 - entropy / ln 3)`: 0 for uniform, 1 for one-hot.
    pub confidence: f64,
    /// `1 - mean pairwise distance` between the raw votes, floored at 0.
    pub agreement: f64,
}

impl Default for EnsembleWeights {
    fn default() -> Self {
        Self {
            dense: 0.40,
            lstm: 0.35,
            cnn: 0.25,
        }
    }
}

impl EnsembleWeights {
    pub fn normalized(dense: f64, lstm: f64, cnn: f64) -> Result<Self, ConfigError> {
        let values = [dense, lstm, cnn];
        if values.iter().any(|w| !w.is_finite() || *w < 0.0) {
            return Err(ConfigError::InvalidWeights(format!(
                "weights must be finite and non-negative, got {dense},{lstm},{cnn}"
            )));
        }
        let sum: f64 = values.iter().sum();
        if sum <= 0.0 {
            return Err(ConfigError::InvalidWeights(
                "weights sum to zero".to_string(),
            ));
        }
        Ok(Self {
            dense: dense / sum,
            lstm: lstm / sum,
            cnn: cnn / sum,
        })
    }

    pub fn weight_for(&self, model: SubModel) -> f64 {
        match model {
            SubModel::Dense => self.dense,
            SubModel::Lstm => self.lstm,
            SubModel::Cnn => self.cnn,
        }
    }
}

impl ModelVote {
    pub fn new(model: SubModel, probs: Prob3) -> Self {
        Self { model, probs }
    }
}

impl EnsembleOutput {
    pub fn leading_outcome(&self) -> Outcome {
        calibration::argmax(self.probabilities)
    }
}

/// Votes are blended as given; one that does not sum to 1 is not renormalized here.
pub fn combine(votes: &[ModelVote; 3], weights: &EnsembleWeights) -> EnsembleOutput {
    let mut combined = [0.0_f64; 3];
    for vote in votes {
        let w = weights.weight_for(vote.model);
        for (slot, p) in combined.iter_mut().zip(vote.probs.to_array()) {
            *slot += w * p;
        }
    }
    let probabilities = Prob3::from_array(combined);

    EnsembleOutput {
        probabilities,
        confidence: confidence(probabilities),
        agreement: agreement(votes),
    }
}

pub fn entropy(p: Prob3) -> f64 {
    p.to_array()
        .iter()
        .filter(|v| **v > 0.0)
        .map(|v| -v * v.ln())
        .sum()
}

pub fn confidence(p: Prob3) -> f64 {
    let max_entropy = 3.0_f64.ln();
    p.max_prob() * (1.0 - entropy(p) / max_entropy)
}

pub fn agreement(votes: &[ModelVote; 3]) -> f64 {
    let mut total = 0.0;
    let mut pairs = 0usize;
    for i in 0..votes.len() {
        for j in (i + 1)..votes.len() {
            total += euclidean(votes[i].probs, votes[j].probs);
            pairs += 1;
        }
    }
    let avg = total / pairs as f64;
    (1.0 - avg).max(0.0)
}

fn euclidean(a: Prob3, b: Prob3) -> f64 {
    ((a.home - b.home).powi(2) + (a.draw - b.draw).powi(2) + (a.away - b.away).powi(2)).sqrt()
}
