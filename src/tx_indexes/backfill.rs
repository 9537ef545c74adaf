use std::collections::HashMap;
use std::time::Instant;

use futures::future::try_join_all;
use pit_wall::Progress;
use thiserror::Error;
use tracing::{debug, info};

use crate::execution_node::{BlockNumber, ExecutionNode, ExecutionNodeBlock, NodeError};

use super::store::{StoreError, TxIndexStore};
use super::{BlockWithTxs, PageCursor};

#[derive(Debug, Error)]
pub enum BackfillError {
    #[error(transparent)]
    Db(#[from] sqlx::Error),
    #[error(transparent)]
    Node(#[from] NodeError),
    #[error(transparent)]
    Store(#[from] StoreError),
    /// The store references a height the node cannot serve.
    #[error("execution node has no block at height {0}")]
    BlockUnavailable(BlockNumber),
    /// The store claims the transaction belongs to a block the chain does not
    /// corroborate. Fatal, this divergence needs investigating, not skipping.
    #[error("db transaction {tx_hash} not found in execution block {block_number}")]
    TxMissingFromChainBlock {
        tx_hash: String,
        block_number: BlockNumber,
    },
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct BackfillSummary {
    pub blocks_processed: u64,
    pub txs_updated: u64,
}

struct TxIndexUpdate {
    tx_hash: String,
    index: i32,
}

fn match_tx_indexes(
    db_block: &BlockWithTxs,
    chain_block: &ExecutionNodeBlock,
) -> Result<Vec<TxIndexUpdate>, BackfillError> {
    let position_by_hash: HashMap<&str, i32> = chain_block
        .transactions
        .iter()
        .enumerate()
        .map(|(position, hash)| (hash.as_str(), position as i32))
        .collect();

    db_block
        .transaction_hashes
        .iter()
        .map(|tx_hash| {
            position_by_hash
                .get(tx_hash.as_str())
                .map(|index| TxIndexUpdate {
                    tx_hash: tx_hash.clone(),
                    index: *index,
                })
                .ok_or_else(|| BackfillError::TxMissingFromChainBlock {
                    tx_hash: tx_hash.clone(),
                    block_number: chain_block.number,
                })
        })
        .collect()
}

/// Walks every stored block which still has transactions without an index,
/// asks the execution node for the block's canonical transaction order, and
/// writes the position of each transaction back to the store.
///
/// Pages are processed strictly sequentially, the cursor only advances after
/// a page's updates have all landed. A killed run loses at most the page in
/// flight, re-running resumes from store state and recomputes identical
/// indexes.
pub async fn backfill_tx_indexes(
    store: &impl TxIndexStore,
    node: &impl ExecutionNode,
) -> Result<BackfillSummary, BackfillError> {
    let backlog_count = store.unindexed_tx_count().await?;
    info!(backlog_count, "starting tx index backfill");

    let mut progress = Progress::new("backfill-tx-indexes", backlog_count.max(0) as u64);
    let mut summary = BackfillSummary::default();
    let mut cursor: Option<PageCursor> = None;

    loop {
        let total_start = Instant::now();

        let db_blocks = store.incomplete_blocks_page(cursor.clone()).await?;

        let (first_number, last_number, next_cursor) = match (db_blocks.first(), db_blocks.last())
        {
            (Some(first), Some(last)) => (first.number, last.number, PageCursor::from(last)),
            _ => {
                info!(
                    blocks_processed = summary.blocks_processed,
                    txs_updated = summary.txs_updated,
                    "all tx indexes updated"
                );
                break;
            }
        };

        debug!(first_number, last_number, "fetching canonical blocks");

        let fetch_start = Instant::now();
        let chain_blocks = try_join_all(db_blocks.iter().map(|db_block| async move {
            node.get_block_by_number(db_block.number)
                .await?
                .ok_or(BackfillError::BlockUnavailable(db_block.number))
        }))
        .await?;
        let fetch_duration = fetch_start.elapsed();

        let updates: Vec<TxIndexUpdate> = db_blocks
            .iter()
            .zip(chain_blocks.iter())
            .map(|(db_block, chain_block)| match_tx_indexes(db_block, chain_block))
            .collect::<Result<Vec<_>, _>>()?
            .into_iter()
            .flatten()
            .collect();

        let update_start = Instant::now();
        try_join_all(
            updates
                .iter()
                .map(|update| store.set_tx_index(&update.tx_hash, update.index)),
        )
        .await?;
        let update_duration = update_start.elapsed();

        summary.blocks_processed += db_blocks.len() as u64;
        summary.txs_updated += updates.len() as u64;
        progress.set_work_done(summary.txs_updated);

        let backlog_pct = if backlog_count > 0 {
            summary.txs_updated as f64 / backlog_count as f64 * 100.0
        } else {
            100.0
        };

        info!(
            first_number,
            last_number,
            txs_updated = updates.len(),
            total_txs_updated = summary.txs_updated,
            "page done in {:.2?} (fetch {:.2?}, update {:.2?}), {:.5}% of backlog, {}",
            total_start.elapsed(),
            fetch_duration,
            update_duration,
            backlog_pct,
            progress.get_progress_string()
        );

        cursor = Some(next_cursor);
    }

    Ok(summary)
}

#[cfg(test)]
mod tests {
    use chrono::{DateTime, Duration, TimeZone, Utc};

    use crate::execution_node::MockExecutionNode;
    use crate::tx_indexes::store::MockTxIndexStore;

    use super::*;

    fn timestamp_at(seconds: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2022, 10, 1, 0, 0, 0).unwrap() + Duration::seconds(seconds)
    }

    fn db_block(hash: &str, number: BlockNumber, seconds: i64, tx_hashes: &[&str]) -> BlockWithTxs {
        BlockWithTxs {
            hash: hash.to_string(),
            number,
            timestamp: timestamp_at(seconds),
            transaction_hashes: tx_hashes.iter().map(|hash| hash.to_string()).collect(),
        }
    }

    fn chain_block(hash: &str, number: BlockNumber, tx_hashes: &[&str]) -> ExecutionNodeBlock {
        ExecutionNodeBlock {
            hash: hash.to_string(),
            number,
            transactions: tx_hashes.iter().map(|hash| hash.to_string()).collect(),
        }
    }

    #[tokio::test]
    async fn backfills_two_blocks_test() {
        let mut mock_store = MockTxIndexStore::new();
        let mut mock_node = MockExecutionNode::new();

        mock_store
            .expect_unindexed_tx_count()
            .times(1)
            .returning(|| Ok(3));

        // The store does not know transaction order, hand them over scrambled.
        let page = vec![
            db_block("0xb100", 100, 0, &["0xb", "0xa"]),
            db_block("0xb101", 101, 12, &["0xc"]),
        ];

        mock_store
            .expect_incomplete_blocks_page()
            .withf(|cursor| cursor.is_none())
            .times(1)
            .returning(move |_| Ok(page.clone()));
        mock_store
            .expect_incomplete_blocks_page()
            .withf(|cursor| {
                *cursor
                    == Some(PageCursor {
                        timestamp: timestamp_at(12),
                        block_hash: "0xb101".to_string(),
                    })
            })
            .times(1)
            .returning(|_| Ok(Vec::new()));

        mock_node
            .expect_get_block_by_number()
            .withf(|number| *number == 100)
            .times(1)
            .returning(|_| Ok(Some(chain_block("0xb100", 100, &["0xa", "0xb"]))));
        mock_node
            .expect_get_block_by_number()
            .withf(|number| *number == 101)
            .times(1)
            .returning(|_| Ok(Some(chain_block("0xb101", 101, &["0xc"]))));

        for (tx_hash, index) in [("0xa", 0), ("0xb", 1), ("0xc", 0)] {
            mock_store
                .expect_set_tx_index()
                .withf(move |hash, i| hash == tx_hash && *i == index)
                .times(1)
                .returning(|_, _| Ok(()));
        }

        let summary = backfill_tx_indexes(&mock_store, &mock_node).await.unwrap();

        assert_eq!(
            summary,
            BackfillSummary {
                blocks_processed: 2,
                txs_updated: 3,
            }
        );
    }

    #[tokio::test]
    async fn empty_backlog_test() {
        let mut mock_store = MockTxIndexStore::new();
        let mut mock_node = MockExecutionNode::new();

        mock_store
            .expect_unindexed_tx_count()
            .times(1)
            .returning(|| Ok(0));
        mock_store
            .expect_incomplete_blocks_page()
            .times(1)
            .returning(|_| Ok(Vec::new()));
        mock_store.expect_set_tx_index().never();
        mock_node.expect_get_block_by_number().never();

        let summary = backfill_tx_indexes(&mock_store, &mock_node).await.unwrap();

        assert_eq!(summary, BackfillSummary::default());
    }

    #[tokio::test]
    async fn aborts_on_tx_missing_from_chain_block_test() {
        let mut mock_store = MockTxIndexStore::new();
        let mut mock_node = MockExecutionNode::new();

        mock_store
            .expect_unindexed_tx_count()
            .times(1)
            .returning(|| Ok(2));

        let page = vec![db_block("0xb100", 100, 0, &["0xa", "0xd"])];
        mock_store
            .expect_incomplete_blocks_page()
            .times(1)
            .returning(move |_| Ok(page.clone()));

        mock_node
            .expect_get_block_by_number()
            .times(1)
            .returning(|_| Ok(Some(chain_block("0xb100", 100, &["0xa", "0xb"]))));

        // No update may land for the faulty page.
        mock_store.expect_set_tx_index().never();

        let err = backfill_tx_indexes(&mock_store, &mock_node)
            .await
            .unwrap_err();

        assert!(matches!(
            &err,
            BackfillError::TxMissingFromChainBlock {
                tx_hash,
                block_number: 100,
            } if tx_hash == "0xd"
        ));
        assert!(err.to_string().contains("0xd"));
        assert!(err.to_string().contains("100"));
    }

    #[tokio::test]
    async fn aborts_on_unavailable_block_test() {
        let mut mock_store = MockTxIndexStore::new();
        let mut mock_node = MockExecutionNode::new();

        mock_store
            .expect_unindexed_tx_count()
            .times(1)
            .returning(|| Ok(1));

        let page = vec![db_block("0xb100", 100, 0, &["0xa"])];
        mock_store
            .expect_incomplete_blocks_page()
            .times(1)
            .returning(move |_| Ok(page.clone()));

        mock_node
            .expect_get_block_by_number()
            .times(1)
            .returning(|_| Ok(None));

        mock_store.expect_set_tx_index().never();

        let err = backfill_tx_indexes(&mock_store, &mock_node)
            .await
            .unwrap_err();

        assert!(matches!(err, BackfillError::BlockUnavailable(100)));
    }

    #[tokio::test]
    async fn advances_cursor_between_pages_test() {
        let mut mock_store = MockTxIndexStore::new();
        let mut mock_node = MockExecutionNode::new();

        mock_store
            .expect_unindexed_tx_count()
            .times(1)
            .returning(|| Ok(2));

        let first_page = vec![db_block("0xb100", 100, 0, &["0xa"])];
        let second_page = vec![db_block("0xb101", 101, 12, &["0xb"])];

        mock_store
            .expect_incomplete_blocks_page()
            .withf(|cursor| cursor.is_none())
            .times(1)
            .returning(move |_| Ok(first_page.clone()));
        mock_store
            .expect_incomplete_blocks_page()
            .withf(|cursor| {
                *cursor
                    == Some(PageCursor {
                        timestamp: timestamp_at(0),
                        block_hash: "0xb100".to_string(),
                    })
            })
            .times(1)
            .returning(move |_| Ok(second_page.clone()));
        mock_store
            .expect_incomplete_blocks_page()
            .withf(|cursor| {
                *cursor
                    == Some(PageCursor {
                        timestamp: timestamp_at(12),
                        block_hash: "0xb101".to_string(),
                    })
            })
            .times(1)
            .returning(|_| Ok(Vec::new()));

        mock_node
            .expect_get_block_by_number()
            .withf(|number| *number == 100)
            .times(1)
            .returning(|_| Ok(Some(chain_block("0xb100", 100, &["0xa"]))));
        mock_node
            .expect_get_block_by_number()
            .withf(|number| *number == 101)
            .times(1)
            .returning(|_| Ok(Some(chain_block("0xb101", 101, &["0xb"]))));

        mock_store
            .expect_set_tx_index()
            .times(2)
            .returning(|_, _| Ok(()));

        let summary = backfill_tx_indexes(&mock_store, &mock_node).await.unwrap();

        assert_eq!(
            summary,
            BackfillSummary {
                blocks_processed: 2,
                txs_updated: 2,
            }
        );
    }
}
