//! Resolution cycle orchestrator.
//!
//! One pass: fetch unresolved markets past their end date, ask the feed
//! whether each has concluded, persist the outcome, settle every open
//! prediction on it, and recompute stats for the agents involved. A failure
//! on one market, prediction or agent is recorded and the pass moves on.
//! Only failing to load the candidate list aborts a cycle.
//!
//! Each pass ends by repairing what earlier passes left behind: open
//! predictions on already-resolved markets, and agents whose stored stats
//! lag their settled history.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{BTreeSet, HashSet};
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::engine::classifier::{classify, ResolutionPolicy, Verdict};
use crate::engine::settlement::SettlementCalculator;
use crate::engine::stats;
use crate::feed::{with_retry, FeedError, FetchThrottle, MarketFeed, RetryConfig};
use crate::storage::ResolutionStore;
use crate::types::{AgentStats, ArenaError, Market, MarketResolution, PredictionSettlement, Side};

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct ResolverConfig {
    pub policy: ResolutionPolicy,
    /// Minimum spacing between feed requests.
    pub fetch_delay: Duration,
    /// Wall-clock budget for one cycle. Checked between markets.
    pub cycle_budget: Duration,
    pub retry: RetryConfig,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            policy: ResolutionPolicy::default(),
            fetch_delay: Duration::from_secs(1),
            cycle_budget: Duration::from_secs(300),
            retry: RetryConfig::default(),
        }
    }
}

// ---------------------------------------------------------------------------
// Cycle report
// ---------------------------------------------------------------------------

/// Summary of one resolution cycle. Partial failures show up in `errors`.
#[derive(Debug, Clone, Serialize)]
pub struct CycleReport {
    pub cycle_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub markets_checked: usize,
    pub markets_resolved: usize,
    /// Already-resolved markets whose leftover predictions were settled.
    pub markets_recovered: usize,
    pub predictions_settled: usize,
    pub agents_updated: usize,
    pub errors: Vec<String>,
    pub budget_exhausted: bool,
}

impl CycleReport {
    fn new() -> Self {
        let now = Utc::now();
        Self {
            cycle_id: Uuid::new_v4(),
            started_at: now,
            finished_at: now,
            markets_checked: 0,
            markets_resolved: 0,
            markets_recovered: 0,
            predictions_settled: 0,
            agents_updated: 0,
            errors: Vec::new(),
            budget_exhausted: false,
        }
    }

    pub fn error_count(&self) -> usize {
        self.errors.len()
    }

    fn record_error(&mut self, message: String) {
        warn!(cycle_id = %self.cycle_id, error = %message, "Resolution step failed");
        self.errors.push(message);
    }
}

impl fmt::Display for CycleReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Cycle {}: checked={} resolved={} recovered={} settled={} agents={} errors={}{}",
            self.cycle_id,
            self.markets_checked,
            self.markets_resolved,
            self.markets_recovered,
            self.predictions_settled,
            self.agents_updated,
            self.error_count(),
            if self.budget_exhausted { " (budget exhausted)" } else { "" },
        )
    }
}

// ---------------------------------------------------------------------------
// Resolver
// ---------------------------------------------------------------------------

pub struct Resolver {
    store: Arc<dyn ResolutionStore>,
    feed: Arc<dyn MarketFeed>,
    calculator: SettlementCalculator,
    config: ResolverConfig,
    throttle: FetchThrottle,
}

impl Resolver {
    pub fn new(
        store: Arc<dyn ResolutionStore>,
        feed: Arc<dyn MarketFeed>,
        calculator: SettlementCalculator,
        config: ResolverConfig,
    ) -> Self {
        let throttle = FetchThrottle::new(config.fetch_delay);
        Self {
            store,
            feed,
            calculator,
            config,
            throttle,
        }
    }

    /// Run one cycle against the current time.
    pub async fn run_cycle(&self) -> Result<CycleReport, ArenaError> {
        self.run_cycle_at(Utc::now()).await
    }

    /// Run one cycle, selecting markets whose end date is at or before `now`.
    pub async fn run_cycle_at(&self, now: DateTime<Utc>) -> Result<CycleReport, ArenaError> {
        let clock = Instant::now();
        let mut report = CycleReport::new();

        let candidates = self.store.candidate_markets(now).await?;
        info!(
            cycle_id = %report.cycle_id,
            candidates = candidates.len(),
            policy = ?self.config.policy,
            settlement = ?self.calculator.policy(),
            "Resolution cycle started"
        );

        let mut resolved_here = HashSet::new();
        let mut refreshed = HashSet::new();

        for market in &candidates {
            if clock.elapsed() >= self.config.cycle_budget {
                report.budget_exhausted = true;
                warn!(
                    cycle_id = %report.cycle_id,
                    remaining = candidates.len() - report.markets_checked,
                    "Cycle budget exhausted, deferring remaining markets"
                );
                break;
            }
            report.markets_checked += 1;

            let (outcome, prices) = match self.check_outcome(market).await {
                Ok(Some(found)) => found,
                Ok(None) => continue,
                Err(e) => {
                    report.record_error(format!("market {}: fetch failed: {e}", market.id));
                    continue;
                }
            };

            let resolution = MarketResolution {
                outcome,
                resolved_at: Utc::now(),
                final_yes_price: prices.map(|(yes, _)| yes),
                final_no_price: prices.map(|(_, no)| no),
            };

            match self.store.resolve_market(&market.id, &resolution).await {
                Ok(true) => {
                    report.markets_resolved += 1;
                    resolved_here.insert(market.id.clone());
                    info!(
                        market_id = %market.id,
                        external_id = %market.external_id,
                        outcome = %outcome,
                        question = %market.question,
                        "Market resolved"
                    );
                }
                Ok(false) => {
                    debug!(market_id = %market.id, "Market already resolved by another cycle");
                    continue;
                }
                Err(e) => {
                    report.record_error(format!("market {}: persist outcome failed: {e}", market.id));
                    continue;
                }
            }

            self.settle_market(
                &market.id,
                outcome,
                resolution.resolved_at,
                &mut refreshed,
                &mut report,
            )
            .await;
        }

        if !report.budget_exhausted {
            self.recover(&resolved_here, &mut refreshed, clock, &mut report).await;
        }
        if !report.budget_exhausted {
            self.repair_stats(&refreshed, &mut report).await;
        }

        report.finished_at = Utc::now();
        info!(
            cycle_id = %report.cycle_id,
            checked = report.markets_checked,
            resolved = report.markets_resolved,
            recovered = report.markets_recovered,
            settled = report.predictions_settled,
            agents = report.agents_updated,
            errors = report.error_count(),
            "Resolution cycle complete"
        );

        Ok(report)
    }

    /// Fetch the market from the feed and classify it.
    /// Returns the outcome plus final prices when resolved.
    async fn check_outcome(
        &self,
        market: &Market,
    ) -> Result<Option<(Side, Option<(f64, f64)>)>, FeedError> {
        let external_id = market.external_id.as_str();
        let snapshot = with_retry(&self.config.retry, "fetch_market", || async move {
            self.throttle.wait().await;
            self.feed.fetch_market(external_id).await
        })
        .await?;

        match classify(&snapshot, self.config.policy) {
            Verdict::Resolved(outcome) => Ok(Some((outcome, snapshot.outcome_prices))),
            Verdict::Unresolved => {
                debug!(
                    market_id = %market.id,
                    closed = snapshot.closed,
                    prices = ?snapshot.outcome_prices,
                    "Market not resolved yet"
                );
                Ok(None)
            }
        }
    }

    /// Settle every open prediction on a resolved market, then refresh the
    /// agents whose predictions were settled. Refreshed agents are added to
    /// `refreshed`. Returns how many predictions this call settled.
    async fn settle_market(
        &self,
        market_id: &str,
        outcome: Side,
        resolved_at: DateTime<Utc>,
        refreshed: &mut HashSet<String>,
        report: &mut CycleReport,
    ) -> usize {
        let predictions = match self.store.unsettled_predictions(market_id).await {
            Ok(p) => p,
            Err(e) => {
                report.record_error(format!("market {market_id}: load predictions failed: {e}"));
                return 0;
            }
        };

        let mut touched = BTreeSet::new();
        let mut settled = 0;

        for prediction in &predictions {
            let scored = match self.calculator.settle_prediction(prediction, outcome) {
                Ok(s) => s,
                Err(e) => {
                    report.record_error(format!("prediction {}: {e}", prediction.id));
                    continue;
                }
            };

            let settlement = PredictionSettlement {
                outcome,
                correct: scored.correct,
                profit_loss: scored.profit_loss,
                resolved_at,
            };

            match self.store.settle_prediction(&prediction.id, &settlement).await {
                Ok(true) => {
                    report.predictions_settled += 1;
                    settled += 1;
                    touched.insert(prediction.agent_id.clone());
                    debug!(
                        prediction_id = %prediction.id,
                        agent_id = %prediction.agent_id,
                        side = %prediction.side,
                        correct = scored.correct,
                        profit_loss = %scored.profit_loss,
                        "Prediction settled"
                    );
                }
                Ok(false) => {
                    debug!(prediction_id = %prediction.id, "Prediction already settled");
                }
                Err(e) => {
                    report.record_error(format!("prediction {}: persist failed: {e}", prediction.id));
                }
            }
        }

        for agent_id in touched {
            self.refresh_and_record(&agent_id, report).await;
            refreshed.insert(agent_id);
        }

        settled
    }

    async fn refresh_and_record(&self, agent_id: &str, report: &mut CycleReport) {
        match self.refresh_agent(agent_id).await {
            Ok(stats) => {
                report.agents_updated += 1;
                info!(agent_id = %agent_id, %stats, "Agent stats refreshed");
            }
            Err(e) => {
                report.record_error(format!("agent {agent_id}: stats refresh failed: {e}"));
            }
        }
    }

    /// Recompute an agent's stats from its full resolved history and persist
    /// them. If another cycle already stored stats covering more of the
    /// history, those are kept and returned instead.
    pub async fn refresh_agent(&self, agent_id: &str) -> Result<AgentStats, ArenaError> {
        let history = self.store.resolved_predictions(agent_id).await?;
        let stats = stats::aggregate(&history, self.calculator.stake());
        if self.store.update_agent_stats(agent_id, &stats).await? {
            return Ok(stats);
        }

        debug!(agent_id, resolved = stats.resolved_predictions, "Newer stats already stored");
        let stored = self
            .store
            .get_agent(agent_id)
            .await?
            .map(|agent| agent.stats)
            .unwrap_or(stats);
        Ok(stored)
    }

    /// Settle predictions left open on markets resolved by an earlier,
    /// interrupted cycle. Markets resolved in this cycle are skipped.
    async fn recover(
        &self,
        skip: &HashSet<String>,
        refreshed: &mut HashSet<String>,
        clock: Instant,
        report: &mut CycleReport,
    ) {
        let markets = match self.store.markets_with_unsettled_predictions().await {
            Ok(m) => m,
            Err(e) => {
                report.record_error(format!("recovery scan failed: {e}"));
                return;
            }
        };

        for market in markets.iter().filter(|m| !skip.contains(&m.id)) {
            if clock.elapsed() >= self.config.cycle_budget {
                report.budget_exhausted = true;
                break;
            }

            let Some(outcome) = market.outcome else {
                report.record_error(format!("market {}: resolved without outcome", market.id));
                continue;
            };

            info!(market_id = %market.id, outcome = %outcome, "Recovering unsettled predictions");
            let resolved_at = market.resolved_at.unwrap_or_else(Utc::now);
            let settled = self
                .settle_market(&market.id, outcome, resolved_at, refreshed, report)
                .await;
            if settled > 0 {
                report.markets_recovered += 1;
            }
        }
    }

    /// Refresh agents whose stored stats don't match their settled history,
    /// e.g. after a failed stats write in an earlier cycle. Agents already
    /// refreshed in this cycle are skipped.
    async fn repair_stats(&self, refreshed: &HashSet<String>, report: &mut CycleReport) {
        let stale = match self.store.agents_with_stale_stats().await {
            Ok(ids) => ids,
            Err(e) => {
                report.record_error(format!("stale stats scan failed: {e}"));
                return;
            }
        };

        for agent_id in stale.iter().filter(|id| !refreshed.contains(*id)) {
            info!(agent_id = %agent_id, "Repairing stale agent stats");
            self.refresh_and_record(agent_id, report).await;
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
