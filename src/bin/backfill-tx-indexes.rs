use anyhow::Result;
use tracing::info;
use tx_index_backfill::{backfill_tx_indexes, db, log, ExecutionNodeHttp, TxIndexStorePostgres};

#[tokio::main]
async fn main() -> Result<()> {
    log::init();

    info!("starting transactions.index backfill script");

    let db_pool = db::get_db_pool("backfill-tx-indexes").await;
    let node = ExecutionNodeHttp::new();
    let store = TxIndexStorePostgres::new(db_pool.clone());

    let result = backfill_tx_indexes(&store, &node).await;

    // Release the pool on every exit path before surfacing the result.
    db_pool.close().await;

    let summary = result?;

    info!(
        blocks_processed = summary.blocks_processed,
        txs_updated = summary.txs_updated,
        "finished transactions.index backfill script"
    );

    Ok(())
}
