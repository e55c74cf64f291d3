//! Store wrapper that injects failures.
//!
//! Delegates to a `MemoryStore` and fails selected operations on demand,
//! to exercise the cycle's partial-failure paths. Can also park one
//! history read mid-flight so two cycles interleave deterministically.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;

use arena::storage::memory::MemoryStore;
use arena::storage::{ResolutionStore, StoreError};
use arena::types::{Agent, AgentStats, Market, MarketResolution, Prediction, PredictionSettlement};

#[derive(Default)]
struct Faults {
    candidates: bool,
    settle: HashSet<String>,
    agent_update: HashSet<String>,
}

/// A one-shot pause on an agent's history read.
struct HistoryGate {
    agent_id: String,
    paused: Arc<Notify>,
    release: Arc<Notify>,
}

pub struct FlakyStore {
    inner: Arc<MemoryStore>,
    faults: Mutex<Faults>,
    gate: Mutex<Option<HistoryGate>>,
}

impl FlakyStore {
    pub fn new(inner: Arc<MemoryStore>) -> Self {
        Self {
            inner,
            faults: Mutex::new(Faults::default()),
            gate: Mutex::new(None),
        }
    }

    pub fn fail_candidates(&self, on: bool) {
        self.faults.lock().unwrap().candidates = on;
    }

    pub fn fail_settle(&self, prediction_id: &str) {
        self.faults.lock().unwrap().settle.insert(prediction_id.to_string());
    }

    pub fn fail_agent_update(&self, agent_id: &str) {
        self.faults.lock().unwrap().agent_update.insert(agent_id.to_string());
    }

    pub fn heal(&self) {
        *self.faults.lock().unwrap() = Faults::default();
    }

    /// The next history read for `agent_id` takes its snapshot, notifies
    /// `paused`, then waits on `release` before returning that snapshot.
    pub fn pause_history_once(&self, agent_id: &str) -> (Arc<Notify>, Arc<Notify>) {
        let paused = Arc::new(Notify::new());
        let release = Arc::new(Notify::new());
        *self.gate.lock().unwrap() = Some(HistoryGate {
            agent_id: agent_id.to_string(),
            paused: paused.clone(),
            release: release.clone(),
        });
        (paused, release)
    }
}

fn unavailable(what: &str) -> StoreError {
    StoreError::Unavailable(format!("injected failure: {what}"))
}

#[async_trait]
impl ResolutionStore for FlakyStore {
    async fn candidate_markets(&self, now: DateTime<Utc>) -> Result<Vec<Market>, StoreError> {
        if self.faults.lock().unwrap().candidates {
            return Err(unavailable("candidate_markets"));
        }
        self.inner.candidate_markets(now).await
    }

    async fn markets_with_unsettled_predictions(&self) -> Result<Vec<Market>, StoreError> {
        self.inner.markets_with_unsettled_predictions().await
    }

    async fn resolve_market(
        &self,
        market_id: &str,
        resolution: &MarketResolution,
    ) -> Result<bool, StoreError> {
        self.inner.resolve_market(market_id, resolution).await
    }

    async fn unsettled_predictions(&self, market_id: &str) -> Result<Vec<Prediction>, StoreError> {
        self.inner.unsettled_predictions(market_id).await
    }

    async fn settle_prediction(
        &self,
        prediction_id: &str,
        settlement: &PredictionSettlement,
    ) -> Result<bool, StoreError> {
        if self.faults.lock().unwrap().settle.contains(prediction_id) {
            return Err(unavailable("settle_prediction"));
        }
        self.inner.settle_prediction(prediction_id, settlement).await
    }

    async fn resolved_predictions(&self, agent_id: &str) -> Result<Vec<Prediction>, StoreError> {
        let history = self.inner.resolved_predictions(agent_id).await?;
        let gate = {
            let mut gate = self.gate.lock().unwrap();
            match gate.as_ref() {
                Some(g) if g.agent_id == agent_id => gate.take(),
                _ => None,
            }
        };
        if let Some(gate) = gate {
            gate.paused.notify_one();
            gate.release.notified().await;
        }
        Ok(history)
    }

    async fn update_agent_stats(&self, agent_id: &str, stats: &AgentStats) -> Result<bool, StoreError> {
        if self.faults.lock().unwrap().agent_update.contains(agent_id) {
            return Err(unavailable("update_agent_stats"));
        }
        self.inner.update_agent_stats(agent_id, stats).await
    }

    async fn agents_with_stale_stats(&self) -> Result<Vec<String>, StoreError> {
        self.inner.agents_with_stale_stats().await
    }

    async fn list_agents(&self) -> Result<Vec<Agent>, StoreError> {
        self.inner.list_agents().await
    }

    async fn get_agent(&self, agent_id: &str) -> Result<Option<Agent>, StoreError> {
        self.inner.get_agent(agent_id).await
    }
}
