pub mod db;
pub mod env;
pub mod execution_node;
pub mod log;
pub mod tx_indexes;

pub use execution_node::{ExecutionNode, ExecutionNodeHttp};
pub use tx_indexes::{backfill_tx_indexes, TxIndexStore, TxIndexStorePostgres};
