use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Importance {
    High,
    #[default]
    Medium,
    Low,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Weather {
    #[default]
    Good,
    Moderate,
    Poor,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MatchContext {
    pub league: String,
    #[serde(default)]
    pub importance: Option<Importance>,
    #[serde(default)]
    pub weather: Option<Weather>,
}

static LEAGUE_ALIASES: Lazy<HashMap<&'static str, &'static str>> = Lazy::new(|| {
    HashMap::from([
        ("premier league", "epl"),
        ("english premier league", "epl"),
        ("epl", "epl"),
        ("la liga", "laliga"),
        ("laliga", "laliga"),
        ("primera division", "laliga"),
        ("serie a", "seriea"),
        ("bundesliga", "bundesliga"),
        ("1. bundesliga", "bundesliga"),
        ("ligue 1", "ligue1"),
        ("eredivisie", "eredivisie"),
        ("primeira liga", "primeira"),
        ("liga portugal", "primeira"),
        ("championship", "championship"),
        ("efl championship", "championship"),
        ("champions league", "ucl"),
        ("uefa champions league", "ucl"),
        ("europa league", "uel"),
        ("uefa europa league", "uel"),
        ("world cup", "worldcup"),
        ("fifa world cup", "worldcup"),
        ("mls", "mls"),
        ("major league soccer", "mls"),
    ])
});

impl Importance {
    pub fn as_str(self) -> &'static str {
        match self {
            Importance::High => "high",
            Importance::Medium => "medium",
            Importance::Low => "low",
        }
    }
}

impl Weather {
    pub fn as_str(self) -> &'static str {
        match self {
            Weather::Good => "good",
            Weather::Moderate => "moderate",
            Weather::Poor => "poor",
        }
    }
}

impl FromStr for Importance {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "high" => Ok(Importance::High),
            "medium" => Ok(Importance::Medium),
            "low" => Ok(Importance::Low),
            other => Err(format!("unknown importance {other:?}")),
        }
    }
}

impl FromStr for Weather {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "good" => Ok(Weather::Good),
            "moderate" => Ok(Weather::Moderate),
            "poor" => Ok(Weather::Poor),
            other => Err(format!("unknown weather {other:?}")),
        }
    }
}

impl MatchContext {
    pub fn new(league: impl Into<String>) -> Self {
        Self {
            league: league.into(),
            importance: None,
            weather: None,
        }
    }

    pub fn with_importance(mut self, importance: Importance) -> Self {
        self.importance = Some(importance);
        self
    }

    pub fn with_weather(mut self, weather: Weather) -> Self {
        self.weather = Some(weather);
        self
    }

    /// `{league}_{importance}_{weather}`; the identity of a calibration curve.
    pub fn key(&self) -> String {
        format!(
            "{}_{}_{}",
            normalize_league(&self.league),
            self.importance.unwrap_or_default().as_str(),
            self.weather.unwrap_or_default().as_str()
        )
    }
}

impl fmt::Display for MatchContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.key())
    }
}

pub fn normalize_league(name: &str) -> String {
    let folded = name
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase();
    if let Some(alias) = LEAGUE_ALIASES.get(folded.as_str()) {
        return (*alias).to_string();
    }
    // Underscore is the key separator, so anything non-alphanumeric is dropped.
    let slug: String = folded.chars().filter(|c| c.is_alphanumeric()).collect();
    if slug.is_empty() {
        "unknown".to_string()
    } else {
        slug
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn premier_league_aliases_collapse() {
        assert_eq!(normalize_league("Premier League"), "epl");
        assert_eq!(normalize_league("English  Premier League"), "epl");
        assert_eq!(normalize_league(" EPL "), "epl");
    }

    #[test]
    fn unknown_leagues_are_slugged() {
        assert_eq!(normalize_league("Scottish Premiership"), "scottishpremiership");
        assert_eq!(normalize_league("A-League_Men"), "aleaguemen");
        assert_eq!(normalize_league("  "), "unknown");
    }

    #[test]
    fn key_defaults_importance_and_weather() {
        let ctx = MatchContext::new("La Liga");
        assert_eq!(ctx.key(), "laliga_medium_good");
        let ctx = MatchContext::new("Serie A")
            .with_importance(Importance::High)
            .with_weather(Weather::Poor);
        assert_eq!(ctx.key(), "seriea_high_poor");
    }

    #[test]
    fn parses_labels() {
        assert_eq!("HIGH".parse::<Importance>().unwrap(), Importance::High);
        assert_eq!("moderate".parse::<Weather>().unwrap(), Weather::Moderate);
        assert!("stormy".parse::<Weather>().is_err());
    }

    #[test]
    fn context_deserializes_without_optional_fields() {
        let ctx: MatchContext = serde_json::from_str(r#"{"league":"EPL"}"#).unwrap();
        assert_eq!(ctx.key(), "epl_medium_good");
    }
}
