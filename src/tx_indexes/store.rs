use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use mockall::automock;
use sqlx::{PgPool, Row};
use thiserror::Error;

use super::{BlockWithTxs, PageCursor};

/// Bounds per-iteration memory and rpc fan-out.
pub const PAGE_SIZE: i64 = 50;

#[derive(Debug, Error)]
pub enum StoreError {
    /// The update target is missing from the store. Fatal, the store's
    /// transaction set disagrees with the block it claims to belong to.
    #[error("no transaction with hash {0} in store")]
    TxNotFound(String),
    #[error(transparent)]
    Db(#[from] sqlx::Error),
}

#[automock]
#[async_trait]
pub trait TxIndexStore {
    /// Size of the backlog before any work is done, for progress reporting.
    async fn unindexed_tx_count(&self) -> sqlx::Result<i64>;
    /// Up to [`PAGE_SIZE`] blocks which have at least one transaction without
    /// an index and no fork markers, ascending by (timestamp, hash), strictly
    /// after the cursor. An empty page means the backlog is drained.
    async fn incomplete_blocks_page(
        &self,
        cursor: Option<PageCursor>,
    ) -> sqlx::Result<Vec<BlockWithTxs>>;
    async fn set_tx_index(&self, tx_hash: &str, index: i32) -> Result<(), StoreError>;
}

pub struct TxIndexStorePostgres {
    db_pool: PgPool,
}

impl TxIndexStorePostgres {
    pub fn new(db_pool: PgPool) -> Self {
        Self { db_pool }
    }
}

#[async_trait]
impl TxIndexStore for TxIndexStorePostgres {
    async fn unindexed_tx_count(&self) -> sqlx::Result<i64> {
        sqlx::query_scalar(
            r#"
            SELECT COUNT(*) FROM transactions
            WHERE "index" IS NULL
            "#,
        )
        .fetch_one(&self.db_pool)
        .await
    }

    async fn incomplete_blocks_page(
        &self,
        cursor: Option<PageCursor>,
    ) -> sqlx::Result<Vec<BlockWithTxs>> {
        let cursor_timestamp: Option<DateTime<Utc>> = cursor.as_ref().map(|c| c.timestamp);
        let cursor_hash: Option<String> = cursor.map(|c| c.block_hash);

        let block_rows = sqlx::query(
            r#"
            SELECT
                hash,
                number,
                timestamp
            FROM
                blocks
            WHERE
                EXISTS (
                    SELECT 1 FROM transactions
                    WHERE transactions.block_hash = blocks.hash
                    AND transactions."index" IS NULL
                )
            AND
                NOT EXISTS (
                    SELECT 1 FROM transaction_forks
                    WHERE transaction_forks.block_hash = blocks.hash
                )
            AND
                ($1::timestamptz IS NULL OR (timestamp, hash) > ($1, $2))
            ORDER BY
                timestamp ASC, hash ASC
            LIMIT $3
            "#,
        )
        .bind(cursor_timestamp)
        .bind(cursor_hash)
        .bind(PAGE_SIZE)
        .fetch_all(&self.db_pool)
        .await?;

        let mut blocks: Vec<BlockWithTxs> = block_rows
            .iter()
            .map(|row| BlockWithTxs {
                hash: row.get("hash"),
                number: row.get("number"),
                timestamp: row.get("timestamp"),
                transaction_hashes: Vec::new(),
            })
            .collect();

        if blocks.is_empty() {
            return Ok(blocks);
        }

        // All transaction hashes for the page's blocks, not only the ones
        // missing an index. Re-deriving the index for every transaction in a
        // candidate block is idempotent and keeps re-runs self-healing.
        let block_hashes: Vec<String> = blocks.iter().map(|block| block.hash.clone()).collect();
        let tx_rows = sqlx::query(
            r#"
            SELECT hash, block_hash FROM transactions
            WHERE block_hash = ANY($1)
            "#,
        )
        .bind(&block_hashes)
        .fetch_all(&self.db_pool)
        .await?;

        let mut txs_by_block: HashMap<String, Vec<String>> = HashMap::new();
        for row in tx_rows {
            txs_by_block
                .entry(row.get("block_hash"))
                .or_default()
                .push(row.get("hash"));
        }

        for block in blocks.iter_mut() {
            if let Some(transaction_hashes) = txs_by_block.remove(&block.hash) {
                block.transaction_hashes = transaction_hashes;
            }
        }

        Ok(blocks)
    }

    async fn set_tx_index(&self, tx_hash: &str, index: i32) -> Result<(), StoreError> {
        let rows_affected = sqlx::query(
            r#"
            UPDATE transactions
            SET "index" = $2
            WHERE hash = $1
            "#,
        )
        .bind(tx_hash)
        .bind(index)
        .execute(&self.db_pool)
        .await?
        .rows_affected();

        if rows_affected == 0 {
            return Err(StoreError::TxNotFound(tx_hash.to_string()));
        }

        Ok(())
    }
}
