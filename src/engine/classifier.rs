//! Outcome classifier.
//!
//! Decides from a feed snapshot whether a market has concluded and which
//! side won. Ambiguous or malformed snapshots are reported as unresolved.

use serde::{Deserialize, Serialize};

use crate::types::{MarketSnapshot, Side};

/// A YES price at or above this level settles the market YES.
pub const RESOLVED_HIGH: f64 = 0.99;
/// A YES price at or below this level settles the market NO.
pub const RESOLVED_LOW: f64 = 0.01;

/// How resolution is read off a snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionPolicy {
    /// Closed with an explicit winning-outcome label.
    Label,
    /// Closed with final prices pinned to an extreme.
    #[default]
    PriceThreshold,
}

/// Classifier verdict.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Unresolved,
    Resolved(Side),
}

/// Classify a snapshot under the given policy. Pure.
pub fn classify(snapshot: &MarketSnapshot, policy: ResolutionPolicy) -> Verdict {
    if !snapshot.closed {
        return Verdict::Unresolved;
    }

    match policy {
        ResolutionPolicy::Label => match snapshot.outcome_label.as_deref().map(str::trim) {
            Some(label) if !label.is_empty() => Verdict::Resolved(side_from_label(label)),
            _ => Verdict::Unresolved,
        },
        ResolutionPolicy::PriceThreshold => match snapshot.outcome_prices {
            Some((yes, no)) => classify_prices(yes, no),
            None => Verdict::Unresolved,
        },
    }
}

/// `YES` when the label contains "YES" or is "1" / "TRUE", otherwise `NO`.
pub fn side_from_label(label: &str) -> Side {
    let upper = label.trim().to_uppercase();
    if upper.contains("YES") || upper == "1" || upper == "TRUE" {
        Side::Yes
    } else {
        Side::No
    }
}

fn classify_prices(yes: f64, no: f64) -> Verdict {
    let in_range = |p: f64| p.is_finite() && (0.0..=1.0).contains(&p);
    if !in_range(yes) || !in_range(no) {
        return Verdict::Unresolved;
    }

    if yes >= RESOLVED_HIGH {
        Verdict::Resolved(Side::Yes)
    } else if no >= RESOLVED_HIGH || yes <= RESOLVED_LOW {
        Verdict::Resolved(Side::No)
    } else {
        Verdict::Unresolved
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
