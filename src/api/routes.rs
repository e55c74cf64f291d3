//! Route handlers for the HTTP API.

use axum::{
    extract::{Path, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use hmac::{Hmac, Mac};
use rust_decimal::Decimal;
use secrecy::{ExposeSecret, SecretString};
use serde::Serialize;
use serde_json::json;
use sha2::Sha256;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{error, info, warn};

use crate::engine::resolver::{CycleReport, Resolver};
use crate::storage::ResolutionStore;
use crate::types::Agent;

// ---------------------------------------------------------------------------
// Shared state
// ---------------------------------------------------------------------------

pub type AppState = Arc<ApiState>;

type HmacSha256 = Hmac<Sha256>;

pub struct ApiState {
    pub resolver: Arc<Resolver>,
    pub store: Arc<dyn ResolutionStore>,
    cron_secret: Option<SecretString>,
    last_report: RwLock<Option<CycleReport>>,
}

impl ApiState {
    pub fn new(
        resolver: Arc<Resolver>,
        store: Arc<dyn ResolutionStore>,
        cron_secret: Option<SecretString>,
    ) -> Self {
        Self {
            resolver,
            store,
            cron_secret,
            last_report: RwLock::new(None),
        }
    }

    /// Remember the most recent cycle report, whoever triggered it.
    pub async fn record_report(&self, report: CycleReport) {
        *self.last_report.write().await = Some(report);
    }

    pub async fn last_report(&self) -> Option<CycleReport> {
        self.last_report.read().await.clone()
    }

    /// Whether the request carries `Authorization: Bearer <cron secret>`.
    /// Always false when no secret is configured.
    fn authorized(&self, headers: &HeaderMap) -> bool {
        let Some(secret) = &self.cron_secret else {
            return false;
        };
        headers
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "))
            .is_some_and(|token| token_matches(secret.expose_secret(), token))
    }
}

/// Constant-time token check. Both sides are MACed under the secret so the
/// comparison runs over equal-length digests.
fn token_matches(secret: &str, presented: &str) -> bool {
    let Ok(mut expected) = HmacSha256::new_from_slice(secret.as_bytes()) else {
        return false;
    };
    expected.update(secret.as_bytes());
    let expected = expected.finalize().into_bytes();

    let Ok(mut mac) = HmacSha256::new_from_slice(secret.as_bytes()) else {
        return false;
    };
    mac.update(presented.as_bytes());
    mac.verify_slice(&expected).is_ok()
}

// ---------------------------------------------------------------------------
// Response types
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
pub struct TriggerResponse {
    pub success: bool,
    pub resolved: usize,
    pub settled: usize,
    pub agents_updated: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub errors: Option<Vec<String>>,
}

impl From<&CycleReport> for TriggerResponse {
    fn from(report: &CycleReport) -> Self {
        Self {
            success: true,
            resolved: report.markets_resolved,
            settled: report.predictions_settled,
            agents_updated: report.agents_updated,
            errors: (!report.errors.is_empty()).then(|| report.errors.clone()),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct LeaderboardEntry {
    pub rank: usize,
    pub agent_id: String,
    pub name: String,
    pub accuracy: f64,
    pub roi: f64,
    pub total_profit_loss: Decimal,
    pub total_predictions: u64,
    pub resolved_predictions: u64,
    pub pending_predictions: u64,
    pub current_streak: u64,
    pub longest_streak: u64,
}

/// Rank agents by ROI, then total P&L, then id.
pub fn rank_agents(mut agents: Vec<Agent>) -> Vec<LeaderboardEntry> {
    agents.sort_by(|a, b| {
        b.stats
            .roi
            .total_cmp(&a.stats.roi)
            .then_with(|| b.stats.total_profit_loss.cmp(&a.stats.total_profit_loss))
            .then_with(|| a.id.cmp(&b.id))
    });

    agents
        .into_iter()
        .enumerate()
        .map(|(i, a)| LeaderboardEntry {
            rank: i + 1,
            pending_predictions: a.pending_predictions(),
            agent_id: a.id,
            name: a.name,
            accuracy: a.stats.accuracy,
            roi: a.stats.roi,
            total_profit_loss: a.stats.total_profit_loss,
            total_predictions: a.total_predictions,
            resolved_predictions: a.stats.resolved_predictions,
            current_streak: a.stats.current_streak,
            longest_streak: a.stats.longest_streak,
        })
        .collect()
}

fn error_response(status: StatusCode, message: impl Into<String>) -> Response {
    (status, Json(json!({ "success": false, "error": message.into() }))).into_response()
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

/// GET|POST /api/cron/resolve-markets
pub async fn resolve_markets(State(state): State<AppState>, headers: HeaderMap) -> Response {
    if !state.authorized(&headers) {
        warn!("Rejected resolution trigger with missing or invalid token");
        return error_response(StatusCode::UNAUTHORIZED, "Unauthorized");
    }

    info!("Resolution cycle triggered over HTTP");
    match state.resolver.run_cycle().await {
        Ok(report) => {
            let body = TriggerResponse::from(&report);
            state.record_report(report).await;
            (StatusCode::OK, Json(body)).into_response()
        }
        Err(e) => {
            error!(error = %e, "Resolution cycle aborted");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
        }
    }
}

/// GET /api/leaderboard
pub async fn get_leaderboard(State(state): State<AppState>) -> Response {
    match state.store.list_agents().await {
        Ok(agents) => Json(rank_agents(agents)).into_response(),
        Err(e) => {
            error!(error = %e, "Failed to load leaderboard");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
        }
    }
}

/// GET /api/agents/:id
pub async fn get_agent(State(state): State<AppState>, Path(agent_id): Path<String>) -> Response {
    match state.store.get_agent(&agent_id).await {
        Ok(Some(agent)) => Json(agent).into_response(),
        Ok(None) => error_response(StatusCode::NOT_FOUND, format!("agent {agent_id} not found")),
        Err(e) => {
            error!(agent_id = %agent_id, error = %e, "Failed to load agent");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
        }
    }
}

/// GET /api/resolution/last
pub async fn get_last_report(State(state): State<AppState>) -> Json<Option<CycleReport>> {
    Json(state.last_report().await)
}

/// GET /health
pub async fn health() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok" }))
}
