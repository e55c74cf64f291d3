//! SQLite store.
//!
//! Markets, predictions and agents live in three tables. Money is stored as
//! TEXT (exact decimal), timestamps as RFC 3339 UTC strings with a fixed
//! layout so they compare correctly as text.

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use rust_decimal::Decimal;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::Row;
use std::str::FromStr;
use tracing::{debug, info};

use crate::storage::{ResolutionStore, StoreError};
use crate::types::{
    Agent, AgentStats, Market, MarketResolution, Prediction, PredictionSettlement, Side,
};

const MARKET_COLUMNS: &str = "id, external_id, slug, question, end_date, resolved, outcome, \
     resolved_at, yes_price, no_price, volume";

const PREDICTION_COLUMNS: &str = "id, agent_id, market_id, side, confidence, price_at_prediction, \
     research_cost, created_at, outcome, correct, profit_loss, resolved_at";

pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Open (creating if missing) a database file and apply the schema.
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::from_str(url)?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;

        let store = Self { pool };
        store.initialize().await?;
        info!(url, "SQLite store ready");
        Ok(store)
    }

    /// A private in-memory database. Pinned to one connection, since every
    /// new SQLite memory connection starts empty.
    pub async fn in_memory() -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?;
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;

        let store = Self { pool };
        store.initialize().await?;
        Ok(store)
    }

    async fn initialize(&self) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS markets (
                id TEXT PRIMARY KEY,
                external_id TEXT NOT NULL,
                slug TEXT NOT NULL DEFAULT '',
                question TEXT NOT NULL,
                end_date TEXT NOT NULL,
                resolved INTEGER NOT NULL DEFAULT 0,
                outcome TEXT,
                resolved_at TEXT,
                yes_price REAL NOT NULL DEFAULT 0.5,
                no_price REAL NOT NULL DEFAULT 0.5,
                volume REAL NOT NULL DEFAULT 0
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS predictions (
                id TEXT PRIMARY KEY,
                agent_id TEXT NOT NULL,
                market_id TEXT NOT NULL,
                side TEXT NOT NULL,
                confidence REAL NOT NULL,
                price_at_prediction TEXT NOT NULL,
                research_cost TEXT NOT NULL DEFAULT '0',
                created_at TEXT NOT NULL,
                outcome TEXT,
                correct INTEGER,
                profit_loss TEXT,
                resolved_at TEXT
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS agents (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                resolved_predictions INTEGER NOT NULL DEFAULT 0,
                correct_predictions INTEGER NOT NULL DEFAULT 0,
                accuracy REAL NOT NULL DEFAULT 0,
                roi REAL NOT NULL DEFAULT 0,
                total_profit_loss TEXT NOT NULL DEFAULT '0',
                current_streak INTEGER NOT NULL DEFAULT 0,
                longest_streak INTEGER NOT NULL DEFAULT 0,
                stats_updated_at TEXT
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_markets_open ON markets(resolved, end_date)")
            .execute(&self.pool)
            .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_predictions_market ON predictions(market_id, outcome)")
            .execute(&self.pool)
            .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_predictions_agent ON predictions(agent_id, resolved_at)")
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    // -- Writes used by market sync / agent runtime -------------------------

    /// Insert a market, or refresh its descriptive fields and prices.
    /// Resolution fields are never touched here.
    pub async fn upsert_market(&self, market: &Market) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO markets (id, external_id, slug, question, end_date, resolved, outcome,
                                 resolved_at, yes_price, no_price, volume)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                external_id = excluded.external_id,
                slug = excluded.slug,
                question = excluded.question,
                end_date = excluded.end_date,
                yes_price = excluded.yes_price,
                no_price = excluded.no_price,
                volume = excluded.volume
            "#,
        )
        .bind(&market.id)
        .bind(&market.external_id)
        .bind(&market.slug)
        .bind(&market.question)
        .bind(ts(market.end_date))
        .bind(market.resolved)
        .bind(market.outcome.map(|o| o.as_str()))
        .bind(market.resolved_at.map(ts))
        .bind(market.yes_price)
        .bind(market.no_price)
        .bind(market.volume)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn insert_prediction(&self, p: &Prediction) -> Result<(), StoreError> {
        let s = p.settlement.as_ref();
        sqlx::query(
            r#"
            INSERT INTO predictions (id, agent_id, market_id, side, confidence, price_at_prediction,
                                     research_cost, created_at, outcome, correct, profit_loss, resolved_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&p.id)
        .bind(&p.agent_id)
        .bind(&p.market_id)
        .bind(p.side.as_str())
        .bind(p.confidence)
        .bind(p.price_at_prediction.to_string())
        .bind(p.research_cost.to_string())
        .bind(ts(p.created_at))
        .bind(s.map(|s| s.outcome.as_str()))
        .bind(s.map(|s| s.correct))
        .bind(s.map(|s| s.profit_loss.to_string()))
        .bind(s.map(|s| ts(s.resolved_at)))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn upsert_agent(&self, agent: &Agent) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO agents (id, name) VALUES (?, ?)
            ON CONFLICT(id) DO UPDATE SET name = excluded.name
            "#,
        )
        .bind(&agent.id)
        .bind(&agent.name)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn fetch_markets(&self, query: &str, bind: Option<String>) -> Result<Vec<Market>, StoreError> {
        let mut q = sqlx::query(query);
        if let Some(value) = bind {
            q = q.bind(value);
        }
        let rows = q.fetch_all(&self.pool).await?;
        rows.iter().map(market_from_row).collect()
    }
}

#[async_trait]
impl ResolutionStore for SqliteStore {
    async fn candidate_markets(&self, now: DateTime<Utc>) -> Result<Vec<Market>, StoreError> {
        let query = format!(
            "SELECT {MARKET_COLUMNS} FROM markets WHERE resolved = 0 AND end_date <= ? ORDER BY end_date, id"
        );
        self.fetch_markets(&query, Some(ts(now))).await
    }

    async fn markets_with_unsettled_predictions(&self) -> Result<Vec<Market>, StoreError> {
        let query = format!(
            "SELECT {MARKET_COLUMNS} FROM markets m WHERE m.resolved = 1 AND EXISTS \
             (SELECT 1 FROM predictions p WHERE p.market_id = m.id AND p.outcome IS NULL) \
             ORDER BY m.resolved_at, m.id"
        );
        self.fetch_markets(&query, None).await
    }

    async fn resolve_market(
        &self,
        market_id: &str,
        resolution: &MarketResolution,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE markets
            SET resolved = 1,
                outcome = ?,
                resolved_at = ?,
                yes_price = COALESCE(?, yes_price),
                no_price = COALESCE(?, no_price)
            WHERE id = ? AND resolved = 0
            "#,
        )
        .bind(resolution.outcome.as_str())
        .bind(ts(resolution.resolved_at))
        .bind(resolution.final_yes_price)
        .bind(resolution.final_no_price)
        .bind(market_id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 1 {
            return Ok(true);
        }

        let exists: Option<(i64,)> = sqlx::query_as("SELECT resolved FROM markets WHERE id = ?")
            .bind(market_id)
            .fetch_optional(&self.pool)
            .await?;
        match exists {
            Some(_) => {
                debug!(market_id, "Market already resolved, skipping write");
                Ok(false)
            }
            None => Err(StoreError::NotFound(format!("market {market_id}"))),
        }
    }

    async fn unsettled_predictions(&self, market_id: &str) -> Result<Vec<Prediction>, StoreError> {
        let query = format!(
            "SELECT {PREDICTION_COLUMNS} FROM predictions WHERE market_id = ? AND outcome IS NULL ORDER BY id"
        );
        let rows = sqlx::query(&query)
            .bind(market_id)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(prediction_from_row).collect()
    }

    async fn settle_prediction(
        &self,
        prediction_id: &str,
        settlement: &PredictionSettlement,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE predictions
            SET outcome = ?, correct = ?, profit_loss = ?, resolved_at = ?
            WHERE id = ? AND outcome IS NULL
            "#,
        )
        .bind(settlement.outcome.as_str())
        .bind(settlement.correct)
        .bind(settlement.profit_loss.to_string())
        .bind(ts(settlement.resolved_at))
        .bind(prediction_id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn resolved_predictions(&self, agent_id: &str) -> Result<Vec<Prediction>, StoreError> {
        let query = format!(
            "SELECT {PREDICTION_COLUMNS} FROM predictions WHERE agent_id = ? AND outcome IS NOT NULL \
             ORDER BY resolved_at, id"
        );
        let rows = sqlx::query(&query)
            .bind(agent_id)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(prediction_from_row).collect()
    }

    async fn update_agent_stats(&self, agent_id: &str, stats: &AgentStats) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE agents
            SET resolved_predictions = ?,
                correct_predictions = ?,
                accuracy = ?,
                roi = ?,
                total_profit_loss = ?,
                current_streak = ?,
                longest_streak = ?,
                stats_updated_at = ?
            WHERE id = ? AND resolved_predictions <= ?
            "#,
        )
        .bind(stats.resolved_predictions as i64)
        .bind(stats.correct_predictions as i64)
        .bind(stats.accuracy)
        .bind(stats.roi)
        .bind(stats.total_profit_loss.to_string())
        .bind(stats.current_streak as i64)
        .bind(stats.longest_streak as i64)
        .bind(ts(Utc::now()))
        .bind(agent_id)
        .bind(stats.resolved_predictions as i64)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 1 {
            return Ok(true);
        }

        let exists = sqlx::query("SELECT 1 FROM agents WHERE id = ?")
            .bind(agent_id)
            .fetch_optional(&self.pool)
            .await?;
        match exists {
            Some(_) => {
                debug!(agent_id, "Newer stats already stored, skipping write");
                Ok(false)
            }
            None => Err(StoreError::NotFound(format!("agent {agent_id}"))),
        }
    }

    async fn agents_with_stale_stats(&self) -> Result<Vec<String>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT a.id FROM agents a
            WHERE a.resolved_predictions < (
                SELECT COUNT(*) FROM predictions p
                WHERE p.agent_id = a.id AND p.outcome IS NOT NULL
            )
            ORDER BY a.id
            "#,
        )
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(|row| row.try_get::<String, _>("id").map_err(StoreError::from))
            .collect()
    }

    async fn list_agents(&self) -> Result<Vec<Agent>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT a.*, (SELECT COUNT(*) FROM predictions p WHERE p.agent_id = a.id) AS total_predictions
            FROM agents a
            ORDER BY a.id
            "#,
        )
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(agent_from_row).collect()
    }

    async fn get_agent(&self, agent_id: &str) -> Result<Option<Agent>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT a.*, (SELECT COUNT(*) FROM predictions p WHERE p.agent_id = a.id) AS total_predictions
            FROM agents a
            WHERE a.id = ?
            "#,
        )
        .bind(agent_id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(agent_from_row).transpose()
    }
}

// ---------------------------------------------------------------------------
// Row mapping
// ---------------------------------------------------------------------------

fn ts(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn parse_ts(s: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| StoreError::Corrupt(format!("bad timestamp {s:?}: {e}")))
}

fn parse_decimal(s: &str) -> Result<Decimal, StoreError> {
    Decimal::from_str(s).map_err(|e| StoreError::Corrupt(format!("bad decimal {s:?}: {e}")))
}

fn parse_side(s: &str) -> Result<Side, StoreError> {
    s.parse::<Side>()
        .map_err(|e| StoreError::Corrupt(e.to_string()))
}

fn market_from_row(row: &SqliteRow) -> Result<Market, StoreError> {
    let outcome: Option<String> = row.try_get("outcome")?;
    let resolved_at: Option<String> = row.try_get("resolved_at")?;
    let end_date: String = row.try_get("end_date")?;
    let resolved: bool = row.try_get("resolved")?;

    let outcome = outcome.as_deref().map(parse_side).transpose()?;
    if resolved && outcome.is_none() {
        let id: String = row.try_get("id")?;
        return Err(StoreError::Corrupt(format!("market {id} resolved without outcome")));
    }

    Ok(Market {
        id: row.try_get("id")?,
        external_id: row.try_get("external_id")?,
        slug: row.try_get("slug")?,
        question: row.try_get("question")?,
        end_date: parse_ts(&end_date)?,
        resolved,
        outcome,
        resolved_at: resolved_at.as_deref().map(parse_ts).transpose()?,
        yes_price: row.try_get("yes_price")?,
        no_price: row.try_get("no_price")?,
        volume: row.try_get("volume")?,
    })
}

fn prediction_from_row(row: &SqliteRow) -> Result<Prediction, StoreError> {
    let id: String = row.try_get("id")?;
    let side: String = row.try_get("side")?;
    let price: String = row.try_get("price_at_prediction")?;
    let research: String = row.try_get("research_cost")?;
    let created_at: String = row.try_get("created_at")?;

    let outcome: Option<String> = row.try_get("outcome")?;
    let correct: Option<bool> = row.try_get("correct")?;
    let profit_loss: Option<String> = row.try_get("profit_loss")?;
    let resolved_at: Option<String> = row.try_get("resolved_at")?;

    let settlement = match (outcome, correct, profit_loss, resolved_at) {
        (None, None, None, None) => None,
        (Some(outcome), Some(correct), Some(pl), Some(at)) => Some(PredictionSettlement {
            outcome: parse_side(&outcome)?,
            correct,
            profit_loss: parse_decimal(&pl)?,
            resolved_at: parse_ts(&at)?,
        }),
        _ => {
            return Err(StoreError::Corrupt(format!(
                "prediction {id} is partially settled"
            )))
        }
    };

    Ok(Prediction {
        agent_id: row.try_get("agent_id")?,
        market_id: row.try_get("market_id")?,
        side: parse_side(&side)?,
        confidence: row.try_get("confidence")?,
        price_at_prediction: parse_decimal(&price)?,
        research_cost: parse_decimal(&research)?,
        created_at: parse_ts(&created_at)?,
        settlement,
        id,
    })
}

fn agent_from_row(row: &SqliteRow) -> Result<Agent, StoreError> {
    let total_profit_loss: String = row.try_get("total_profit_loss")?;
    let count = |col: &str| -> Result<u64, StoreError> {
        let v: i64 = row.try_get(col)?;
        Ok(v.max(0) as u64)
    };

    Ok(Agent {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        total_predictions: count("total_predictions")?,
        stats: AgentStats {
            resolved_predictions: count("resolved_predictions")?,
            correct_predictions: count("correct_predictions")?,
            accuracy: row.try_get("accuracy")?,
            roi: row.try_get("roi")?,
            total_profit_loss: parse_decimal(&total_profit_loss)?,
            current_streak: count("current_streak")?,
            longest_streak: count("longest_streak")?,
        },
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
