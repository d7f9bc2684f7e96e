use serde::{Deserialize, Serialize};

use crate::calibration::Prob3;

pub const MAX_GOALS: usize = 8;
pub const GRID: usize = MAX_GOALS + 1;

const MIN_XG: f64 = 0.10;
const MAX_XG: f64 = 10.0;
const FACTORIAL_CACHE: usize = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Scoreline {
    pub home: u8,
    pub away: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ExpectedScore {
    pub home: f64,
    pub away: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GoalsLine {
    Over,
    Under,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Home,
    Away,
}

/// Joint scoreline probabilities for 0..=8 goals a side, indexed `[home][away]`.
/// Mass above eight goals is dropped, not redistributed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoreMatrix {
    cells: [[f64; GRID]; GRID],
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PoissonPrediction {
    pub probs: Prob3,
    pub score_matrix: ScoreMatrix,
    pub most_likely_score: Scoreline,
    pub most_likely_prob: f64,
    pub expected_score: ExpectedScore,
}

#[derive(Debug, Clone)]
pub struct PoissonScoreModel {
    factorials: [f64; FACTORIAL_CACHE + 1],
}

impl Default for PoissonScoreModel {
    fn default() -> Self {
        Self::new()
    }
}

impl PoissonScoreModel {
    pub fn new() -> Self {
        let mut factorials = [1.0_f64; FACTORIAL_CACHE + 1];
        for k in 1..=FACTORIAL_CACHE {
            factorials[k] = factorials[k - 1] * k as f64;
        }
        Self { factorials }
    }

    pub fn predict(&self, home_xg: f64, away_xg: f64) -> PoissonPrediction {
        let lambda_home = clamp_xg(home_xg);
        let lambda_away = clamp_xg(away_xg);

        let pmf_h = self.pmf_row(lambda_home);
        let pmf_a = self.pmf_row(lambda_away);

        let mut cells = [[0.0_f64; GRID]; GRID];
        let mut p_home = 0.0;
        let mut p_draw = 0.0;
        let mut p_away = 0.0;
        let mut best = Scoreline { home: 0, away: 0 };
        let mut best_p = f64::NEG_INFINITY;

        for (h, p_h) in pmf_h.iter().enumerate() {
            for (a, p_a) in pmf_a.iter().enumerate() {
                let p = p_h * p_a;
                cells[h][a] = p;
                if h > a {
                    p_home += p;
                } else if h < a {
                    p_away += p;
                } else {
                    p_draw += p;
                }
                // Strict comparison keeps the first cell in row-major order on ties.
                if p > best_p {
                    best_p = p;
                    best = Scoreline {
                        home: h as u8,
                        away: a as u8,
                    };
                }
            }
        }

        let sum = p_home + p_draw + p_away;
        let probs = if sum > 0.0 {
            Prob3::new(p_home / sum, p_draw / sum, p_away / sum)
        } else {
            Prob3::uniform()
        };

        PoissonPrediction {
            probs,
            score_matrix: ScoreMatrix { cells },
            most_likely_score: best,
            most_likely_prob: best_p.max(0.0),
            expected_score: ExpectedScore {
                home: lambda_home,
                away: lambda_away,
            },
        }
    }

    pub fn pmf(&self, k: u32, lambda: f64) -> f64 {
        lambda.powi(k as i32) * (-lambda).exp() / self.factorial(k)
    }

    fn pmf_row(&self, lambda: f64) -> [f64; GRID] {
        let mut out = [0.0_f64; GRID];
        for (k, slot) in out.iter_mut().enumerate() {
            *slot = self.pmf(k as u32, lambda);
        }
        out
    }

    fn factorial(&self, k: u32) -> f64 {
        let k = k as usize;
        if k <= FACTORIAL_CACHE {
            return self.factorials[k];
        }
        (FACTORIAL_CACHE + 1..=k).fold(self.factorials[FACTORIAL_CACHE], |acc, i| acc * i as f64)
    }
}

impl ScoreMatrix {
    pub fn get(&self, home: usize, away: usize) -> f64 {
        if home >= GRID || away >= GRID {
            return 0.0;
        }
        self.cells[home][away]
    }

    pub fn total(&self) -> f64 {
        self.iter().map(|(_, p)| p).sum()
    }

    pub fn iter(&self) -> impl Iterator<Item = (Scoreline, f64)> + '_ {
        self.cells.iter().enumerate().flat_map(|(h, row)| {
            row.iter().enumerate().map(move |(a, p)| {
                (
                    Scoreline {
                        home: h as u8,
                        away: a as u8,
                    },
                    *p,
                )
            })
        })
    }

    pub fn rows(&self) -> &[[f64; GRID]; GRID] {
        &self.cells
    }

    /// Over sums cells with `h + a > threshold`, under sums `h + a < threshold`.
    pub fn total_goals_probability(&self, threshold: f64, line: GoalsLine) -> f64 {
        self.iter()
            .filter(|(s, _)| {
                let total = (s.home + s.away) as f64;
                match line {
                    GoalsLine::Over => total > threshold,
                    GoalsLine::Under => total < threshold,
                }
            })
            .map(|(_, p)| p)
            .sum()
    }

    pub fn btts_probability(&self) -> f64 {
        self.iter()
            .filter(|(s, _)| s.home >= 1 && s.away >= 1)
            .map(|(_, p)| p)
            .sum()
    }

    /// Probability that `side` concedes nothing.
    pub fn clean_sheet_probability(&self, side: Side) -> f64 {
        self.iter()
            .filter(|(s, _)| match side {
                Side::Home => s.away == 0,
                Side::Away => s.home == 0,
            })
            .map(|(_, p)| p)
            .sum()
    }

    pub fn top_scores(&self, n: usize) -> Vec<(Scoreline, f64)> {
        let mut all: Vec<(Scoreline, f64)> = self.iter().collect();
        // Stable sort keeps row-major order among equal probabilities.
        all.sort_by(|a, b| b.1.total_cmp(&a.1));
        all.truncate(n);
        all
    }
}

impl PoissonPrediction {
    pub fn score_probability(&self, home: usize, away: usize) -> f64 {
        self.score_matrix.get(home, away)
    }

    pub fn total_goals_probability(&self, threshold: f64, line: GoalsLine) -> f64 {
        self.score_matrix.total_goals_probability(threshold, line)
    }

    pub fn btts_probability(&self) -> f64 {
        self.score_matrix.btts_probability()
    }
}

fn clamp_xg(xg: f64) -> f64 {
    if !xg.is_finite() {
        return MIN_XG;
    }
    xg.clamp(MIN_XG, MAX_XG)
}
