//! PostgreSQL transaction store

use super::{TransactionDetails, TransactionKey, TransactionStatus, TransactionStore};
use crate::config::DatabaseConfig;
use crate::error::{OrchestratorError, OrchestratorResult};

use async_trait::async_trait;
use ethers::types::Address;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::types::Json;
use sqlx::Row;
use tracing::{debug, info};

/// Store persisting each record as JSONB with its key columns broken out
pub struct PgTransactionStore {
    pool: PgPool,
}

impl PgTransactionStore {
    pub async fn new(config: &DatabaseConfig) -> OrchestratorResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .connect(&config.url)
            .await?;

        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Create tables and indexes if they do not exist yet
    pub async fn run_migrations(&self) -> OrchestratorResult<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS wallet_transactions (
                address VARCHAR(42) NOT NULL,
                chain_id BIGINT NOT NULL,
                id VARCHAR(64) NOT NULL,
                status VARCHAR(20) NOT NULL,
                order_hash VARCHAR(130),
                details JSONB NOT NULL,
                updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                PRIMARY KEY (address, chain_id, id)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_wallet_transactions_order_hash
            ON wallet_transactions (order_hash)
            WHERE order_hash IS NOT NULL
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_wallet_transactions_status
            ON wallet_transactions (address, chain_id, status)
            "#,
        )
        .execute(&self.pool)
        .await?;

        info!("Database migrations complete");
        Ok(())
    }

    pub async fn health_check(&self) -> OrchestratorResult<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    fn temporary_statuses() -> Vec<String> {
        TransactionStatus::TEMPORARY
            .iter()
            .map(|s| s.as_str().to_string())
            .collect()
    }

    fn decode_rows(rows: Vec<sqlx::postgres::PgRow>) -> OrchestratorResult<Vec<TransactionDetails>> {
        rows.into_iter()
            .map(|row| -> OrchestratorResult<TransactionDetails> {
                let Json(details): Json<TransactionDetails> = row.try_get("details")?;
                Ok(details)
            })
            .collect()
    }
}

fn address_key(address: &Address) -> String {
    format!("{:?}", address)
}

#[async_trait]
impl TransactionStore for PgTransactionStore {
    async fn get(&self, key: &TransactionKey) -> OrchestratorResult<Option<TransactionDetails>> {
        let row = sqlx::query(
            "SELECT details FROM wallet_transactions WHERE address = $1 AND chain_id = $2 AND id = $3",
        )
        .bind(address_key(&key.address))
        .bind(key.chain_id as i64)
        .bind(&key.id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|r| {
            r.try_get::<Json<TransactionDetails>, _>("details")
                .map(|Json(d)| d)
                .map_err(OrchestratorError::from)
        })
        .transpose()
    }

    async fn upsert(&self, details: &TransactionDetails) -> OrchestratorResult<()> {
        sqlx::query(
            r#"
            INSERT INTO wallet_transactions (address, chain_id, id, status, order_hash, details, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, NOW())
            ON CONFLICT (address, chain_id, id)
            DO UPDATE SET status = $4, order_hash = $5, details = $6, updated_at = NOW()
            "#,
        )
        .bind(address_key(&details.from))
        .bind(details.chain_id as i64)
        .bind(&details.id)
        .bind(details.status.as_str())
        .bind(details.order_hash.as_deref())
        .bind(Json(details))
        .execute(&self.pool)
        .await?;

        debug!("Stored transaction {} as {}", details.key(), details.status);
        Ok(())
    }

    async fn find_by_order_hash(
        &self,
        order_hash: &str,
    ) -> OrchestratorResult<Option<TransactionDetails>> {
        let rows = sqlx::query(
            "SELECT details FROM wallet_transactions WHERE order_hash = $1 LIMIT 1",
        )
        .bind(order_hash)
        .fetch_all(&self.pool)
        .await?;

        Ok(Self::decode_rows(rows)?.into_iter().next())
    }

    async fn pending_for_account(
        &self,
        address: Address,
        chain_id: u64,
    ) -> OrchestratorResult<Vec<TransactionDetails>> {
        let rows = sqlx::query(
            r#"
            SELECT details FROM wallet_transactions
            WHERE address = $1 AND chain_id = $2 AND status = ANY($3)
            "#,
        )
        .bind(address_key(&address))
        .bind(chain_id as i64)
        .bind(Self::temporary_statuses())
        .fetch_all(&self.pool)
        .await?;

        Self::decode_rows(rows)
    }

    async fn incomplete(&self) -> OrchestratorResult<Vec<TransactionDetails>> {
        let rows = sqlx::query("SELECT details FROM wallet_transactions WHERE status = ANY($1)")
            .bind(Self::temporary_statuses())
            .fetch_all(&self.pool)
            .await?;

        Self::decode_rows(rows)
    }

    async fn find_by_nonce(
        &self,
        address: Address,
        chain_id: u64,
        nonce: u64,
    ) -> OrchestratorResult<Vec<TransactionDetails>> {
        let rows = sqlx::query(
            r#"
            SELECT details FROM wallet_transactions
            WHERE address = $1 AND chain_id = $2
              AND (details -> 'options' ->> 'nonce')::BIGINT = $3
            "#,
        )
        .bind(address_key(&address))
        .bind(chain_id as i64)
        .bind(nonce as i64)
        .fetch_all(&self.pool)
        .await?;

        Self::decode_rows(rows)
    }
}
