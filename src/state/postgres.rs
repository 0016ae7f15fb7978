//! PostgreSQL intent store
//!
//! Intents are shared across processes here, so patches use optimistic
//! concurrency: read the row with its `version`, merge in memory, and write
//! back only if the version is unchanged. A lost race re-reads and retries.

use super::{clamp_limit, IntentStats, IntentStore, ListFilter, Page};
use crate::config::DatabaseConfig;
use crate::error::{DisperserError, DisperserResult};
use crate::intent::{
    ChainDispersal, DepositIntent, DestinationAllocation, IntentPatch, IntentStatus, Patched,
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::types::Json;
use sqlx::{Postgres, QueryBuilder, Row};
use std::time::Duration;
use tracing::{debug, info, warn};

const SELECT_INTENT: &str = r#"
    SELECT id, user_address, source_chain_id, source_tx_hash, source_block_number,
           token_address, token_symbol, amount_in_token_raw, amount_in_usd,
           status, global_phase, allocations, chain_statuses,
           created_at, updated_at, completed_at, version
    FROM deposit_intents
"#;

/// Store backed by PostgreSQL with version-checked patches
pub struct PostgresIntentStore {
    pool: PgPool,
    max_patch_attempts: u32,
    retry_delay: Duration,
}

impl PostgresIntentStore {
    /// Create a new store
    pub async fn new(config: &DatabaseConfig, max_patch_attempts: u32) -> DisperserResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .connect(&config.url)
            .await?;

        Ok(Self {
            pool,
            max_patch_attempts: max_patch_attempts.max(1),
            retry_delay: Duration::from_millis(20),
        })
    }

    /// Run database migrations
    pub async fn run_migrations(&self) -> DisperserResult<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS deposit_intents (
                id VARCHAR(66) PRIMARY KEY,
                user_address VARCHAR(42) NOT NULL,
                source_chain_id BIGINT NOT NULL,
                source_tx_hash VARCHAR(66) NOT NULL,
                source_block_number BIGINT NOT NULL,
                token_address VARCHAR(42) NOT NULL,
                token_symbol VARCHAR(32),
                amount_in_token_raw TEXT NOT NULL,
                amount_in_usd TEXT NOT NULL,
                status VARCHAR(32) NOT NULL,
                global_phase VARCHAR(32) NOT NULL,
                allocations JSONB NOT NULL,
                chain_statuses JSONB NOT NULL,
                created_at TIMESTAMPTZ NOT NULL,
                updated_at TIMESTAMPTZ NOT NULL,
                completed_at TIMESTAMPTZ,
                version BIGINT NOT NULL DEFAULT 0
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_intents_user_created
            ON deposit_intents (LOWER(user_address), created_at DESC)
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_intents_status
            ON deposit_intents (status)
            "#,
        )
        .execute(&self.pool)
        .await?;

        info!("Database migrations complete");
        Ok(())
    }

    async fn fetch(&self, id: &str) -> DisperserResult<Option<DepositIntent>> {
        let row = sqlx::query(&format!("{} WHERE id = $1", SELECT_INTENT))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        row.map(|r| row_to_intent(&r)).transpose()
    }

    /// Write back a merged intent if nobody else bumped the version meanwhile
    async fn compare_and_swap(
        &self,
        intent: &DepositIntent,
        expected_version: u64,
    ) -> DisperserResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE deposit_intents
            SET status = $1, global_phase = $2, chain_statuses = $3,
                updated_at = $4, completed_at = $5, version = $6
            WHERE id = $7 AND version = $8
            "#,
        )
        .bind(intent.status.as_str())
        .bind(intent.global_phase.as_str())
        .bind(Json(&intent.chain_statuses))
        .bind(intent.updated_at)
        .bind(intent.completed_at)
        .bind(intent.version as i64)
        .bind(&intent.id)
        .bind(expected_version as i64)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }
}

#[async_trait]
impl IntentStore for PostgresIntentStore {
    async fn get(&self, id: &str) -> DisperserResult<Option<DepositIntent>> {
        self.fetch(id).await
    }

    async fn create_from_deposit(&self, intent: DepositIntent) -> DisperserResult<DepositIntent> {
        let inserted = sqlx::query(
            r#"
            INSERT INTO deposit_intents (
                id, user_address, source_chain_id, source_tx_hash, source_block_number,
                token_address, token_symbol, amount_in_token_raw, amount_in_usd,
                status, global_phase, allocations, chain_statuses,
                created_at, updated_at, completed_at, version
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17)
            ON CONFLICT (id) DO NOTHING
            "#,
        )
        .bind(&intent.id)
        .bind(&intent.user_address)
        .bind(intent.source_chain_id as i64)
        .bind(&intent.source_tx_hash)
        .bind(intent.source_block_number as i64)
        .bind(&intent.token_address)
        .bind(&intent.token_symbol)
        .bind(&intent.amount_in_token_raw)
        .bind(&intent.amount_in_usd)
        .bind(intent.status.as_str())
        .bind(intent.global_phase.as_str())
        .bind(Json(&intent.allocations))
        .bind(Json(&intent.chain_statuses))
        .bind(intent.created_at)
        .bind(intent.updated_at)
        .bind(intent.completed_at)
        .bind(intent.version as i64)
        .execute(&self.pool)
        .await?
        .rows_affected();

        if inserted == 0 {
            debug!(intent_id = %intent.id, "Intent already exists, returning stored record");
        }

        self.fetch(&intent.id)
            .await?
            .ok_or_else(|| DisperserError::Internal(format!("Intent {} vanished after insert", intent.id)))
    }

    async fn patch(&self, id: &str, patch: IntentPatch) -> DisperserResult<Patched> {
        patch_with_retries(self, id, &patch, self.max_patch_attempts, self.retry_delay).await
    }

    async fn list(
        &self,
        filter: &ListFilter,
        limit: usize,
        cursor: Option<&str>,
    ) -> DisperserResult<Page> {
        let limit = clamp_limit(limit);

        let cursor_position = match cursor {
            Some(c) => self.fetch(c).await?.map(|i| (i.created_at, i.id)),
            None => None,
        };

        let mut query: QueryBuilder<Postgres> = QueryBuilder::new(SELECT_INTENT);
        query.push(" WHERE TRUE");

        if let Some(user) = &filter.user_address {
            query
                .push(" AND LOWER(user_address) = LOWER(")
                .push_bind(user.clone())
                .push(")");
        }
        if let Some(status) = filter.status {
            query.push(" AND status = ").push_bind(status.as_str());
        }
        if let Some((created_at, cursor_id)) = cursor_position {
            query
                .push(" AND (created_at, id) < (")
                .push_bind(created_at)
                .push(", ")
                .push_bind(cursor_id)
                .push(")");
        }

        query
            .push(" ORDER BY created_at DESC, id DESC LIMIT ")
            .push_bind((limit + 1) as i64);

        let rows = query.build().fetch_all(&self.pool).await?;
        let mut items = rows
            .iter()
            .map(row_to_intent)
            .collect::<DisperserResult<Vec<_>>>()?;

        let next_cursor = if items.len() > limit {
            items.truncate(limit);
            items.last().map(|i| i.id.clone())
        } else {
            None
        };

        Ok(Page { items, next_cursor })
    }

    async fn stats(&self) -> DisperserResult<IntentStats> {
        let rows = sqlx::query("SELECT status, COUNT(*) AS n FROM deposit_intents GROUP BY status")
            .fetch_all(&self.pool)
            .await?;

        let mut stats = IntentStats::default();
        for row in rows {
            let status: String = row.get("status");
            let count: i64 = row.get("n");
            stats.record(status.parse()?, count as u64);
        }
        Ok(stats)
    }

    async fn health_check(&self) -> DisperserResult<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}

/// Row access the optimistic patch loop runs against
#[async_trait]
trait VersionedRows: Send + Sync {
    async fn load(&self, id: &str) -> DisperserResult<Option<DepositIntent>>;

    /// Persist `intent` only if the stored version still equals `expected_version`
    async fn store_if_version(
        &self,
        intent: &DepositIntent,
        expected_version: u64,
    ) -> DisperserResult<bool>;
}

#[async_trait]
impl VersionedRows for PostgresIntentStore {
    async fn load(&self, id: &str) -> DisperserResult<Option<DepositIntent>> {
        self.fetch(id).await
    }

    async fn store_if_version(
        &self,
        intent: &DepositIntent,
        expected_version: u64,
    ) -> DisperserResult<bool> {
        self.compare_and_swap(intent, expected_version).await
    }
}

/// Read, merge in memory, write back if nobody else won the race
async fn patch_with_retries<R: VersionedRows + ?Sized>(
    rows: &R,
    id: &str,
    patch: &IntentPatch,
    max_attempts: u32,
    retry_delay: Duration,
) -> DisperserResult<Patched> {
    for attempt in 1..=max_attempts {
        let mut intent = rows
            .load(id)
            .await?
            .ok_or_else(|| DisperserError::IntentNotFound {
                intent_id: id.to_string(),
            })?;

        let expected_version = intent.version;
        let transition = intent.apply(patch, Utc::now())?;
        if !transition.applied {
            return Ok(Patched::new(intent, transition));
        }

        if rows.store_if_version(&intent, expected_version).await? {
            return Ok(Patched::new(intent, transition));
        }

        crate::metrics::record_store_conflict();
        debug!(
            intent_id = %id,
            attempt,
            expected_version,
            "Version conflict, retrying patch"
        );
        tokio::time::sleep(retry_delay * attempt).await;
    }

    warn!(intent_id = %id, attempts = max_attempts, "Patch retries exhausted");
    Err(DisperserError::StoreConflict {
        intent_id: id.to_string(),
        attempts: max_attempts,
    })
}

fn row_to_intent(row: &PgRow) -> DisperserResult<DepositIntent> {
    let status: String = row.try_get("status")?;
    let global_phase: String = row.try_get("global_phase")?;
    let allocations: Json<Vec<DestinationAllocation>> = row.try_get("allocations")?;
    let chain_statuses: Json<Vec<ChainDispersal>> = row.try_get("chain_statuses")?;

    Ok(DepositIntent {
        id: row.try_get("id")?,
        user_address: row.try_get("user_address")?,
        source_chain_id: row.try_get::<i64, _>("source_chain_id")? as u64,
        source_tx_hash: row.try_get("source_tx_hash")?,
        source_block_number: row.try_get::<i64, _>("source_block_number")? as u64,
        token_address: row.try_get("token_address")?,
        token_symbol: row.try_get("token_symbol")?,
        amount_in_token_raw: row.try_get("amount_in_token_raw")?,
        amount_in_usd: row.try_get("amount_in_usd")?,
        status: status.parse::<IntentStatus>()?,
        global_phase: global_phase.parse()?,
        allocations: allocations.0,
        chain_statuses: chain_statuses.0,
        created_at: row.try_get::<DateTime<Utc>, _>("created_at")?,
        updated_at: row.try_get::<DateTime<Utc>, _>("updated_at")?,
        completed_at: row.try_get::<Option<DateTime<Utc>>, _>("completed_at")?,
        version: row.try_get::<i64, _>("version")? as u64,
    })
}
