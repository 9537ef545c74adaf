mod decoders;

use std::time::Duration;

use async_trait::async_trait;
use backoff::ExponentialBackoff;
use lazy_static::lazy_static;
use mockall::automock;
use serde::Deserialize;
use serde_json::{json, Value};
use thiserror::Error;
use tracing::{debug, warn};

use crate::env;

use self::decoders::from_i32_hex_str;

// Execution chain blocks come in about once every 12s from genesis. i32 won't overflow until the
// block number passes 2_147_483_648, i.e. for another ~800 years.
pub type BlockNumber = i32;

/// Hash for a block on the execution layer.
pub type BlockHash = String;

lazy_static! {
    static ref EXECUTION_URL: String = env::get_env_var_unsafe("EXECUTION_URL");
}

/// A block as the execution node reports it, with transactions as hashes only.
/// The order of `transactions` is the canonical order within the block.
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionNodeBlock {
    pub hash: BlockHash,
    #[serde(deserialize_with = "from_i32_hex_str")]
    pub number: BlockNumber,
    pub transactions: Vec<String>,
}

#[derive(Debug, Error)]
pub enum NodeError {
    #[error("failed to reach execution node: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("execution node rpc error {code}: {message}")]
    Rpc { code: i32, message: String },
    #[error("execution node returned a malformed block: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("requested block {requested}, execution node returned block {returned}")]
    NumberMismatch {
        requested: BlockNumber,
        returned: BlockNumber,
    },
}

#[derive(Debug, Deserialize)]
struct RpcError {
    code: i32,
    message: String,
}

#[derive(Debug, Deserialize)]
struct RpcResponse {
    result: Option<Value>,
    error: Option<RpcError>,
}

#[automock]
#[async_trait]
pub trait ExecutionNode {
    async fn get_block_by_number(
        &self,
        block_number: BlockNumber,
    ) -> Result<Option<ExecutionNodeBlock>, NodeError>;
}

pub struct ExecutionNodeHttp {
    client: reqwest::Client,
    url: String,
}

impl ExecutionNodeHttp {
    pub fn new() -> Self {
        Self::new_with_url(&EXECUTION_URL)
    }

    pub fn new_with_url(url: &str) -> Self {
        Self {
            client: reqwest::Client::new(),
            url: url.to_string(),
        }
    }

    // Transport faults get retried with backoff, rpc error responses are permanent.
    async fn call(&self, method: &str, params: &Value) -> Result<Value, NodeError> {
        let body = json!({
            "jsonrpc": "2.0",
            "id": 0,
            "method": method,
            "params": params
        });

        let retry_policy = ExponentialBackoff {
            max_elapsed_time: Some(Duration::from_secs(60)),
            ..ExponentialBackoff::default()
        };

        backoff::future::retry(retry_policy, || async {
            debug!(method, "sending request to execution node");

            let response = self
                .client
                .post(&self.url)
                .json(&body)
                .send()
                .await
                .and_then(|res| res.error_for_status())
                .map_err(|err| {
                    // A 4xx won't get better with retrying, 5xx and connection
                    // faults might.
                    if err.status().is_some_and(|status| status.is_client_error()) {
                        warn!(%err, "client error calling execution node");
                        backoff::Error::permanent(NodeError::Transport(err))
                    } else {
                        warn!(%err, "transport error calling execution node, retrying");
                        backoff::Error::transient(NodeError::Transport(err))
                    }
                })?;

            let rpc_response = response.json::<RpcResponse>().await.map_err(|err| {
                warn!(%err, "failed to read execution node response, retrying");
                backoff::Error::transient(NodeError::Transport(err))
            })?;

            match rpc_response.error {
                Some(RpcError { code, message }) => {
                    Err(backoff::Error::permanent(NodeError::Rpc { code, message }))
                }
                None => Ok(rpc_response.result.unwrap_or(Value::Null)),
            }
        })
        .await
    }
}

impl Default for ExecutionNodeHttp {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ExecutionNode for ExecutionNodeHttp {
    async fn get_block_by_number(
        &self,
        block_number: BlockNumber,
    ) -> Result<Option<ExecutionNodeBlock>, NodeError> {
        let hex_number = format!("0x{block_number:x}");

        // `false` asks for transaction hashes only, which is all index assignment needs.
        let value = self
            .call("eth_getBlockByNumber", &json!((hex_number, false)))
            .await?;

        if value.is_null() {
            return Ok(None);
        }

        let block = serde_json::from_value::<ExecutionNodeBlock>(value)?;

        if block.number != block_number {
            return Err(NodeError::NumberMismatch {
                requested: block_number,
                returned: block.number,
            });
        }

        Ok(Some(block))
    }
}
