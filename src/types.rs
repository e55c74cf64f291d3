//! Shared types for the Agent Arena.
//!
//! These types form the data model used across all modules: markets
//! tracked locally, agent predictions on those markets, and the derived
//! per-agent performance record.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

// ---------------------------------------------------------------------------
// Side / outcome
// ---------------------------------------------------------------------------

/// One side of a binary market. Also used as a market's final outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Side {
    Yes,
    No,
}

impl Side {
    pub fn as_str(&self) -> &'static str {
        match self {
            Side::Yes => "YES",
            Side::No => "NO",
        }
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Case-insensitive parse of `"YES"` / `"NO"`.
impl std::str::FromStr for Side {
    type Err = ArenaError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_uppercase().as_str() {
            "YES" => Ok(Side::Yes),
            "NO" => Ok(Side::No),
            _ => Err(ArenaError::Parse(format!("unknown side: {s}"))),
        }
    }
}

// ---------------------------------------------------------------------------
// Market
// ---------------------------------------------------------------------------

/// A binary prediction market tracked locally.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Market {
    pub id: String,
    /// Identifier on the source venue (e.g. Polymarket market id).
    pub external_id: String,
    pub slug: String,
    pub question: String,
    pub end_date: DateTime<Utc>,
    pub resolved: bool,
    /// Set exactly when `resolved` is true.
    pub outcome: Option<Side>,
    pub resolved_at: Option<DateTime<Utc>>,
    /// Last observed YES price (0.0–1.0)
    pub yes_price: f64,
    /// Last observed NO price (0.0–1.0)
    pub no_price: f64,
    pub volume: f64,
}

impl fmt::Display for Market {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = match self.outcome {
            Some(outcome) => format!("resolved {outcome}"),
            None => "open".to_string(),
        };
        write!(
            f,
            "[{}] {} (YES: {:.0}¢ | NO: {:.0}¢ | {})",
            self.external_id,
            self.question,
            self.yes_price * 100.0,
            self.no_price * 100.0,
            state,
        )
    }
}

impl Market {
    /// Whether the market's end date has passed.
    pub fn is_past_end(&self, now: DateTime<Utc>) -> bool {
        self.end_date <= now
    }

    /// Whether a resolution cycle should look at this market.
    pub fn is_candidate(&self, now: DateTime<Utc>) -> bool {
        !self.resolved && self.is_past_end(now)
    }
}

/// The fields written when a market transitions to resolved.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MarketResolution {
    pub outcome: Side,
    pub resolved_at: DateTime<Utc>,
    pub final_yes_price: Option<f64>,
    pub final_no_price: Option<f64>,
}

/// Raw market state as reported by an external feed.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MarketSnapshot {
    pub external_id: String,
    pub question: String,
    pub end_date: Option<DateTime<Utc>>,
    pub closed: bool,
    /// Explicit winning-outcome label, if the venue publishes one.
    pub outcome_label: Option<String>,
    /// Final (YES, NO) prices, if parseable.
    pub outcome_prices: Option<(f64, f64)>,
}

// ---------------------------------------------------------------------------
// Prediction
// ---------------------------------------------------------------------------

/// One agent's forecast on one market.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Prediction {
    pub id: String,
    pub agent_id: String,
    pub market_id: String,
    pub side: Side,
    /// Agent self-reported confidence (0–1)
    pub confidence: f64,
    /// Market YES price when the prediction was made.
    pub price_at_prediction: Decimal,
    /// Research spend already incurred for this prediction.
    pub research_cost: Decimal,
    pub created_at: DateTime<Utc>,
    /// `None` until the market resolves. Outcome, correctness and P&L are
    /// written together or not at all.
    pub settlement: Option<PredictionSettlement>,
}

impl fmt::Display for Prediction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} on {} @ {:.2} (conf={:.0}%)",
            self.agent_id,
            self.side,
            self.market_id,
            self.price_at_prediction,
            self.confidence * 100.0,
        )?;
        if let Some(s) = &self.settlement {
            write!(f, " → {s}")?;
        }
        Ok(())
    }
}

impl Prediction {
    pub fn is_settled(&self) -> bool {
        self.settlement.is_some()
    }

    /// Resolution time, if settled.
    pub fn resolved_at(&self) -> Option<DateTime<Utc>> {
        self.settlement.as_ref().map(|s| s.resolved_at)
    }
}

/// Settlement fields of a prediction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PredictionSettlement {
    pub outcome: Side,
    pub correct: bool,
    pub profit_loss: Decimal,
    pub resolved_at: DateTime<Utc>,
}

impl fmt::Display for PredictionSettlement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let sign = if self.profit_loss >= Decimal::ZERO { "+" } else { "" };
        write!(
            f,
            "{} ({}) {sign}${:.2}",
            self.outcome,
            if self.correct { "WON" } else { "LOST" },
            self.profit_loss,
        )
    }
}

// ---------------------------------------------------------------------------
// Agent
// ---------------------------------------------------------------------------

/// Derived performance record of an agent. Always recomputed from the
/// agent's full resolved history.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AgentStats {
    pub resolved_predictions: u64,
    pub correct_predictions: u64,
    /// Percentage, two decimal places.
    pub accuracy: f64,
    /// Percentage of theoretical stake, two decimal places.
    pub roi: f64,
    pub total_profit_loss: Decimal,
    pub current_streak: u64,
    pub longest_streak: u64,
}

impl fmt::Display for AgentStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "resolved={} (W{}) | accuracy={:.2}% | roi={:.2}% | PnL=${:.2} | streak={} (best {})",
            self.resolved_predictions,
            self.correct_predictions,
            self.accuracy,
            self.roi,
            self.total_profit_loss,
            self.current_streak,
            self.longest_streak,
        )
    }
}

/// An autonomous forecaster.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Agent {
    pub id: String,
    pub name: String,
    /// All predictions, resolved or not.
    pub total_predictions: u64,
    pub stats: AgentStats,
}

impl fmt::Display for Agent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} [{}] {}", self.name, self.id, self.stats)
    }
}

impl Agent {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            total_predictions: 0,
            stats: AgentStats::default(),
        }
    }

    pub fn pending_predictions(&self) -> u64 {
        self.total_predictions
            .saturating_sub(self.stats.resolved_predictions)
    }
}

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

/// Domain-specific error types for the arena.
#[derive(Debug, thiserror::Error)]
pub enum ArenaError {
    #[error("Store error: {0}")]
    Store(#[from] crate::storage::StoreError),

    #[error("Feed error: {0}")]
    Feed(#[from] crate::feed::FeedError),

    #[error("Invalid settlement input: {0}")]
    InvalidSettlement(String),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
