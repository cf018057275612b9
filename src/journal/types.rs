use crate::stats::key::ModelKey;
use chrono::{DateTime, Utc};

// ── Catalog entities ──

/// A named condition a user marks present/absent for a trade.
/// Identity is `id`; the name may change at any time.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct Factor {
    pub id: String,
    pub name: String,
    pub selected: bool,
    pub order: usize,
}

/// User-curated named combination of factors (live mode only).
/// Factors are held by name, not id.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct Model {
    pub id: String,
    pub name: String,
    pub factors: Vec<String>,
    pub order: usize,
}

// ── Trade outcome ──

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TradeResult {
    Win,
    Lose,
}

impl std::fmt::Display for TradeResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Win => write!(f, "win"),
            Self::Lose => write!(f, "lose"),
        }
    }
}

/// Unit in which trade outcomes are recorded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize, serde::Deserialize)]
pub enum MeasurementMode {
    #[default]
    #[serde(rename = "RR")]
    RiskReward,
    #[serde(rename = "$")]
    Dollar,
    #[serde(rename = "%")]
    Percent,
}

impl std::fmt::Display for MeasurementMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::RiskReward => write!(f, "RR"),
            Self::Dollar => write!(f, "$"),
            Self::Percent => write!(f, "%"),
        }
    }
}

// ── Records ──

/// A manually recorded test-mode trade. Keyed by factor ids.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct TestTrade {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub factor_ids: Vec<String>,
    pub measurement_value: f64,
    pub result: TradeResult,
    #[serde(default)]
    pub notes: Option<String>,
    #[serde(default)]
    pub images: Vec<String>,
}

/// A live-mode trade taken under a curated model.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct LiveTrade {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub model_id: String,
    pub measurement_value: f64,
    pub result: TradeResult,
    /// Reward multiplier (RR) or additive percentage ($, %) applied to wins.
    #[serde(default)]
    pub profit_ratio: Option<f64>,
    #[serde(default)]
    pub notes: Option<String>,
    #[serde(default)]
    pub images: Vec<String>,
}

impl LiveTrade {
    /// Realised magnitude of this trade under `mode`. Always non-negative;
    /// the sign comes from `result`.
    ///
    /// RR scales the value by the ratio. `$` and `%` add the ratio as a
    /// percentage of the value. These two cases stay separate.
    pub fn realized_value(&self, mode: MeasurementMode) -> f64 {
        match (self.result, self.profit_ratio) {
            (TradeResult::Win, Some(ratio)) if ratio.is_finite() => match mode {
                MeasurementMode::RiskReward => self.measurement_value * ratio,
                MeasurementMode::Dollar | MeasurementMode::Percent => {
                    self.measurement_value + self.measurement_value * ratio / 100.0
                }
            },
            _ => self.measurement_value,
        }
    }
}

/// One simulated random draw of a factor subset.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct Iteration {
    pub selected_factor_ids: Vec<String>,
    pub model_key: ModelKey,
}

// ── Sessions ──

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct TestSession {
    pub id: String,
    pub start_time: DateTime<Utc>,
    #[serde(default)]
    pub end_time: Option<DateTime<Utc>>,
    pub measurement_mode: MeasurementMode,
    pub trades: Vec<TestTrade>,
}

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct LiveSession {
    pub id: String,
    pub start_time: DateTime<Utc>,
    #[serde(default)]
    pub end_time: Option<DateTime<Utc>>,
    pub measurement_mode: MeasurementMode,
    pub trades: Vec<LiveTrade>,
}

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct SimulationSession {
    pub id: String,
    pub start_time: DateTime<Utc>,
    #[serde(default)]
    pub end_time: Option<DateTime<Utc>>,
    pub measurement_mode: MeasurementMode,
    pub iteration_count: u32,
    pub min_factors: usize,
    pub max_factors: usize,
    pub iterations: Vec<Iteration>,
}

/// Session kinds that carry annotatable trades.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TradeMode {
    Test,
    Live,
}

/// Globally unique id for every entity created by the journal.
pub fn new_id() -> String {
    uuid::Uuid::new_v4().to_string()
}
