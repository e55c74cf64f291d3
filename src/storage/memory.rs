//! In-process store.
//!
//! Backs dry runs (`backend = "memory"`) and tests. All state sits behind
//! one mutex, so each conditional update is atomic.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};

use crate::storage::{ResolutionStore, StoreError};
use crate::types::{Agent, AgentStats, Market, MarketResolution, Prediction, PredictionSettlement};

#[derive(Debug, Default)]
struct MemoryState {
    markets: BTreeMap<String, Market>,
    predictions: BTreeMap<String, Prediction>,
    agents: BTreeMap<String, Agent>,
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn insert_market(&self, market: Market) {
        self.lock().markets.insert(market.id.clone(), market);
    }

    pub fn insert_prediction(&self, prediction: Prediction) {
        self.lock().predictions.insert(prediction.id.clone(), prediction);
    }

    pub fn insert_agent(&self, agent: Agent) {
        self.lock().agents.insert(agent.id.clone(), agent);
    }

    pub fn market(&self, market_id: &str) -> Option<Market> {
        self.lock().markets.get(market_id).cloned()
    }

    pub fn prediction(&self, prediction_id: &str) -> Option<Prediction> {
        self.lock().predictions.get(prediction_id).cloned()
    }

    pub fn predictions(&self) -> Vec<Prediction> {
        self.lock().predictions.values().cloned().collect()
    }
}

fn with_total(state: &MemoryState, agent: &Agent) -> Agent {
    let total = state
        .predictions
        .values()
        .filter(|p| p.agent_id == agent.id)
        .count() as u64;
    Agent {
        total_predictions: total,
        ..agent.clone()
    }
}

#[async_trait]
impl ResolutionStore for MemoryStore {
    async fn candidate_markets(&self, now: DateTime<Utc>) -> Result<Vec<Market>, StoreError> {
        let state = self.lock();
        let mut markets: Vec<Market> = state
            .markets
            .values()
            .filter(|m| m.is_candidate(now))
            .cloned()
            .collect();
        markets.sort_by(|a, b| a.end_date.cmp(&b.end_date).then_with(|| a.id.cmp(&b.id)));
        Ok(markets)
    }

    async fn markets_with_unsettled_predictions(&self) -> Result<Vec<Market>, StoreError> {
        let state = self.lock();
        Ok(state
            .markets
            .values()
            .filter(|m| m.resolved)
            .filter(|m| {
                state
                    .predictions
                    .values()
                    .any(|p| p.market_id == m.id && !p.is_settled())
            })
            .cloned()
            .collect())
    }

    async fn resolve_market(
        &self,
        market_id: &str,
        resolution: &MarketResolution,
    ) -> Result<bool, StoreError> {
        let mut state = self.lock();
        let market = state
            .markets
            .get_mut(market_id)
            .ok_or_else(|| StoreError::NotFound(format!("market {market_id}")))?;

        if market.resolved {
            return Ok(false);
        }

        market.resolved = true;
        market.outcome = Some(resolution.outcome);
        market.resolved_at = Some(resolution.resolved_at);
        if let Some(yes) = resolution.final_yes_price {
            market.yes_price = yes;
        }
        if let Some(no) = resolution.final_no_price {
            market.no_price = no;
        }
        Ok(true)
    }

    async fn unsettled_predictions(&self, market_id: &str) -> Result<Vec<Prediction>, StoreError> {
        let state = self.lock();
        Ok(state
            .predictions
            .values()
            .filter(|p| p.market_id == market_id && !p.is_settled())
            .cloned()
            .collect())
    }

    async fn settle_prediction(
        &self,
        prediction_id: &str,
        settlement: &PredictionSettlement,
    ) -> Result<bool, StoreError> {
        let mut state = self.lock();
        let prediction = state
            .predictions
            .get_mut(prediction_id)
            .ok_or_else(|| StoreError::NotFound(format!("prediction {prediction_id}")))?;

        if prediction.is_settled() {
            return Ok(false);
        }
        prediction.settlement = Some(settlement.clone());
        Ok(true)
    }

    async fn resolved_predictions(&self, agent_id: &str) -> Result<Vec<Prediction>, StoreError> {
        let state = self.lock();
        let mut resolved: Vec<Prediction> = state
            .predictions
            .values()
            .filter(|p| p.agent_id == agent_id && p.is_settled())
            .cloned()
            .collect();
        resolved.sort_by(|a, b| {
            a.resolved_at()
                .cmp(&b.resolved_at())
                .then_with(|| a.id.cmp(&b.id))
        });
        Ok(resolved)
    }

    async fn update_agent_stats(&self, agent_id: &str, stats: &AgentStats) -> Result<bool, StoreError> {
        let mut state = self.lock();
        let agent = state
            .agents
            .get_mut(agent_id)
            .ok_or_else(|| StoreError::NotFound(format!("agent {agent_id}")))?;

        if agent.stats.resolved_predictions > stats.resolved_predictions {
            return Ok(false);
        }
        agent.stats = stats.clone();
        Ok(true)
    }

    async fn agents_with_stale_stats(&self) -> Result<Vec<String>, StoreError> {
        let state = self.lock();
        Ok(state
            .agents
            .values()
            .filter(|a| {
                let settled = state
                    .predictions
                    .values()
                    .filter(|p| p.agent_id == a.id && p.is_settled())
                    .count() as u64;
                a.stats.resolved_predictions < settled
            })
            .map(|a| a.id.clone())
            .collect())
    }

    async fn list_agents(&self) -> Result<Vec<Agent>, StoreError> {
        let state = self.lock();
        Ok(state.agents.values().map(|a| with_total(&state, a)).collect())
    }

    async fn get_agent(&self, agent_id: &str) -> Result<Option<Agent>, StoreError> {
        let state = self.lock();
        Ok(state.agents.get(agent_id).map(|a| with_total(&state, a)))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
