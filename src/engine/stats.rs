//! Agent statistics aggregator.
//!
//! Recomputes an agent's performance record from its complete resolved
//! history. There is no incremental path: the same history always yields
//! the same stats, which lets any cycle repair stats left stale by an
//! earlier partial failure.

use rust_decimal::prelude::*;

use crate::types::{AgentStats, Prediction};

/// Compute stats from an agent's predictions.
///
/// Unsettled predictions are ignored. Settled ones are ordered by
/// resolution time (ties by id) before streaks are counted, so callers may
/// pass history in any order.
pub fn aggregate(history: &[Prediction], stake: Decimal) -> AgentStats {
    let mut settled: Vec<(&Prediction, bool, Decimal)> = history
        .iter()
        .filter_map(|p| p.settlement.as_ref().map(|s| (p, s.correct, s.profit_loss)))
        .collect();
    settled.sort_by(|(a, ..), (b, ..)| {
        a.resolved_at()
            .cmp(&b.resolved_at())
            .then_with(|| a.id.cmp(&b.id))
    });

    let resolved = settled.len() as u64;
    if resolved == 0 {
        return AgentStats::default();
    }

    let correct = settled.iter().filter(|(_, c, _)| *c).count() as u64;
    let total_profit_loss: Decimal = settled.iter().map(|(_, _, pl)| *pl).sum();

    let outcomes: Vec<bool> = settled.iter().map(|(_, c, _)| *c).collect();
    let (current_streak, longest_streak) = streaks(&outcomes);

    AgentStats {
        resolved_predictions: resolved,
        correct_predictions: correct,
        accuracy: percent(Decimal::from(correct), Decimal::from(resolved)),
        roi: percent(total_profit_loss, Decimal::from(resolved) * stake),
        total_profit_loss,
        current_streak,
        longest_streak,
    }
}

/// Winning streaks over outcomes ordered oldest → newest.
///
/// Returns `(current, longest)`. The current streak counts consecutive wins
/// ending at the newest outcome and is zero when the newest is a loss.
pub fn streaks(outcomes: &[bool]) -> (u64, u64) {
    let current = outcomes.iter().rev().take_while(|won| **won).count() as u64;

    let mut longest = 0u64;
    let mut run = 0u64;
    for won in outcomes {
        if *won {
            run += 1;
            longest = longest.max(run);
        } else {
            run = 0;
        }
    }

    (current, longest)
}

/// `100 * num / den` rounded to two places; zero when `den` is zero.
fn percent(num: Decimal, den: Decimal) -> f64 {
    if den.is_zero() {
        return 0.0;
    }
    (Decimal::ONE_HUNDRED * num / den)
        .round_dp(2)
        .to_f64()
        .unwrap_or(0.0)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
