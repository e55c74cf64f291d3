//! Persistence layer.
//!
//! The resolver only talks to storage through `ResolutionStore`. Every
//! write it performs is a single-row conditional update: a market is
//! resolved only if it is still unresolved, and a prediction is settled
//! only if it is still unsettled. Agent stats are only overwritten by a
//! snapshot covering at least as many resolved predictions. Overlapping
//! cycles therefore can't double-resolve, double-settle, or roll stats back.

pub mod memory;
pub mod sqlite;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::types::{Agent, AgentStats, Market, MarketResolution, Prediction, PredictionSettlement};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Corrupt record: {0}")]
    Corrupt(String),

    #[error("Store unavailable: {0}")]
    Unavailable(String),
}

/// Storage operations needed by the resolution cycle and the read API.
#[async_trait]
pub trait ResolutionStore: Send + Sync {
    /// Unresolved markets whose end date is at or before `now`.
    async fn candidate_markets(&self, now: DateTime<Utc>) -> Result<Vec<Market>, StoreError>;

    /// Resolved markets that still have unsettled predictions.
    async fn markets_with_unsettled_predictions(&self) -> Result<Vec<Market>, StoreError>;

    /// Mark a market resolved. Returns `false` without writing if the
    /// market was already resolved.
    async fn resolve_market(
        &self,
        market_id: &str,
        resolution: &MarketResolution,
    ) -> Result<bool, StoreError>;

    async fn unsettled_predictions(&self, market_id: &str) -> Result<Vec<Prediction>, StoreError>;

    /// Write a prediction's settlement. Returns `false` without writing if
    /// the prediction was already settled.
    async fn settle_prediction(
        &self,
        prediction_id: &str,
        settlement: &PredictionSettlement,
    ) -> Result<bool, StoreError>;

    /// Settled predictions of an agent, oldest resolution first.
    async fn resolved_predictions(&self, agent_id: &str) -> Result<Vec<Prediction>, StoreError>;

    /// Write recomputed stats. Returns `false` without writing if the stored
    /// stats already cover more resolved predictions than `stats` does.
    async fn update_agent_stats(&self, agent_id: &str, stats: &AgentStats) -> Result<bool, StoreError>;

    /// Agents whose stored `resolved_predictions` is behind their number of
    /// settled predictions.
    async fn agents_with_stale_stats(&self) -> Result<Vec<String>, StoreError>;

    async fn list_agents(&self) -> Result<Vec<Agent>, StoreError>;

    async fn get_agent(&self, agent_id: &str) -> Result<Option<Agent>, StoreError>;
}
