mod backfill;
mod store;

use chrono::{DateTime, Utc};

use crate::execution_node::BlockNumber;

pub use backfill::backfill_tx_indexes;
pub use backfill::BackfillError;
pub use backfill::BackfillSummary;

pub use store::MockTxIndexStore;
pub use store::StoreError;
pub use store::TxIndexStore;
pub use store::TxIndexStorePostgres;
pub use store::PAGE_SIZE;

/// A stored block which still has transactions without an index, together
/// with every transaction hash the store associates with it. The store does
/// not know transaction order, `transaction_hashes` is unordered.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BlockWithTxs {
    pub hash: String,
    pub number: BlockNumber,
    pub timestamp: DateTime<Utc>,
    pub transaction_hashes: Vec<String>,
}

/// Resumption point between candidate pages. Cursoring on timestamp alone can
/// skip or repeat a block when two blocks share a timestamp, so the block
/// hash breaks ties.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PageCursor {
    pub timestamp: DateTime<Utc>,
    pub block_hash: String,
}

impl From<&BlockWithTxs> for PageCursor {
    fn from(block: &BlockWithTxs) -> Self {
        Self {
            timestamp: block.timestamp,
            block_hash: block.hash.clone(),
        }
    }
}
