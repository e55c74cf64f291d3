//! Settlement calculator.
//!
//! Scores a prediction against its market's outcome under a fixed
//! theoretical stake, so agents are compared on equal footing regardless
//! of what they actually spent.

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};

use crate::types::{ArenaError, Prediction, Side};

/// Default theoretical stake per prediction, in USD.
pub const DEFAULT_STAKE: Decimal = dec!(10);
/// Prices are floored here before computing the payout multiple.
pub const DEFAULT_MIN_PRICE: Decimal = dec!(0.01);

/// Profit/loss formula.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SettlementPolicy {
    /// Win `S * (1/p - 1)`, lose `S`; research cost is deducted either way.
    #[default]
    FixedStake,
    /// Win twice the research cost, lose the research cost.
    ResearchCostMultiple,
}

/// Result of scoring one prediction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Settlement {
    pub correct: bool,
    pub profit_loss: Decimal,
}

#[derive(Debug, Clone)]
pub struct SettlementCalculator {
    policy: SettlementPolicy,
    stake: Decimal,
    min_price: Decimal,
}

impl Default for SettlementCalculator {
    fn default() -> Self {
        Self::new(SettlementPolicy::default(), DEFAULT_STAKE, DEFAULT_MIN_PRICE)
    }
}

impl SettlementCalculator {
    pub fn new(policy: SettlementPolicy, stake: Decimal, min_price: Decimal) -> Self {
        Self {
            policy,
            stake,
            min_price,
        }
    }

    pub fn policy(&self) -> SettlementPolicy {
        self.policy
    }

    /// Theoretical stake `S`; also the ROI denominator per prediction.
    pub fn stake(&self) -> Decimal {
        self.stake
    }

    /// Score a single prediction.
    ///
    /// `price_at_prediction` is clamped into `[min_price, 1]`, which keeps
    /// the payout multiple finite for zero or negative prices.
    pub fn settle(
        &self,
        side: Side,
        outcome: Side,
        price_at_prediction: Decimal,
        research_cost: Decimal,
    ) -> Result<Settlement, ArenaError> {
        if research_cost < Decimal::ZERO {
            return Err(ArenaError::InvalidSettlement(format!(
                "research cost must be non-negative, got {research_cost}"
            )));
        }

        let correct = side == outcome;

        let profit_loss = match self.policy {
            SettlementPolicy::FixedStake => {
                let price = price_at_prediction.clamp(self.min_price, Decimal::ONE);
                let gross = if correct {
                    self.stake * (Decimal::ONE / price - Decimal::ONE)
                } else {
                    -self.stake
                };
                gross - research_cost
            }
            SettlementPolicy::ResearchCostMultiple => {
                if correct {
                    research_cost * dec!(2)
                } else {
                    -research_cost
                }
            }
        };

        Ok(Settlement {
            correct,
            profit_loss: profit_loss.round_dp(4),
        })
    }

    /// Convenience wrapper over [`settle`](Self::settle) for a stored prediction.
    pub fn settle_prediction(
        &self,
        prediction: &Prediction,
        outcome: Side,
    ) -> Result<Settlement, ArenaError> {
        self.settle(
            prediction.side,
            outcome,
            prediction.price_at_prediction,
            prediction.research_cost,
        )
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
