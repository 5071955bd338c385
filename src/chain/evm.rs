//! EVM JSON-RPC Chain Client
//!
//! Talks to an Ethereum-compatible node over HTTP JSON-RPC. Incoming
//! transfers are found by scanning a window of recent blocks for native
//! value transfers to the watched address.

use async_trait::async_trait;
use reqwest::Client;
use rust_decimal::Decimal;
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use super::{
    confirmations_at, BroadcastOutcome, ChainClient, ChainError, IncomingTransfer,
    SignedTransaction, TxStatus,
};
use crate::types::units::{parse_quantity, to_quantity, wei_to_native};
use crate::types::Chain;

/// JSON-RPC client for one EVM chain
#[derive(Debug)]
pub struct EvmRpcClient {
    client: Client,
    rpc_url: String,
    chain: Chain,
    scan_blocks: u64,
    next_id: AtomicU64,
}

#[derive(Debug, Deserialize)]
struct RpcResponse {
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<RpcErrorBody>,
}

#[derive(Debug, Deserialize)]
struct RpcErrorBody {
    code: i64,
    message: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RpcTransaction {
    hash: String,
    from: String,
    #[serde(default)]
    to: Option<String>,
    value: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RpcBlock {
    number: String,
    #[serde(default)]
    transactions: Vec<RpcTransaction>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RpcReceipt {
    #[serde(default)]
    block_number: Option<String>,
    #[serde(default)]
    status: Option<String>,
}

impl EvmRpcClient {
    /// Create a client for `chain` at `rpc_url`
    pub fn new(
        chain: Chain,
        rpc_url: &str,
        timeout: Duration,
        scan_blocks: u64,
    ) -> Result<Self, ChainError> {
        let client = Client::builder().timeout(timeout).build()?;

        Ok(Self {
            client,
            rpc_url: rpc_url.to_string(),
            chain,
            scan_blocks: scan_blocks.max(1),
            next_id: AtomicU64::new(1),
        })
    }

    pub fn chain(&self) -> Chain {
        self.chain
    }

    pub fn rpc_url(&self) -> &str {
        &self.rpc_url
    }

    /// Chain id reported by the node
    pub async fn get_chain_id(&self) -> Result<u64, ChainError> {
        let value = self.call("eth_chainId", json!([])).await?;
        quantity_u64(&value)
    }

    /// Fail if the node serves a different chain than configured
    pub async fn verify_chain_id(&self, expected: u64) -> Result<(), ChainError> {
        let actual = self.get_chain_id().await?;
        if actual != expected {
            return Err(ChainError::Rpc {
                code: 0,
                message: format!(
                    "{} node reports chain id {}, expected {}",
                    self.chain, actual, expected
                ),
            });
        }
        Ok(())
    }

    async fn call(&self, method: &str, params: Value) -> Result<Value, ChainError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let body = json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": method,
            "params": params,
        });

        let resp = self
            .client
            .post(&self.rpc_url)
            .json(&body)
            .send()
            .await
            .map_err(map_transport)?;

        if !resp.status().is_success() {
            return Err(ChainError::Rpc {
                code: resp.status().as_u16() as i64,
                message: format!("{} returned HTTP {}", method, resp.status()),
            });
        }

        let parsed: RpcResponse = resp.json().await.map_err(map_transport)?;
        if let Some(err) = parsed.error {
            return Err(ChainError::Rpc {
                code: err.code,
                message: err.message,
            });
        }

        Ok(parsed.result.unwrap_or(Value::Null))
    }

    async fn get_block(&self, number: u64) -> Result<Option<RpcBlock>, ChainError> {
        let value = self
            .call("eth_getBlockByNumber", json!([to_quantity(number), true]))
            .await?;
        if value.is_null() {
            return Ok(None);
        }
        serde_json::from_value(value)
            .map(Some)
            .map_err(|e| ChainError::Parse(format!("block {}: {}", number, e)))
    }
}

#[async_trait]
impl ChainClient for EvmRpcClient {
    async fn get_current_height(&self) -> Result<u64, ChainError> {
        let value = self.call("eth_blockNumber", json!([])).await?;
        quantity_u64(&value)
    }

    async fn get_incoming_transactions(
        &self,
        address: &str,
    ) -> Result<Vec<IncomingTransfer>, ChainError> {
        let height = self.get_current_height().await?;
        let start = height.saturating_sub(self.scan_blocks - 1);
        let mut transfers = Vec::new();

        for number in start..=height {
            let Some(block) = self.get_block(number).await? else {
                continue;
            };
            let block_number = parse_u64(&block.number)?;

            for tx in block.transactions {
                let to_watched = tx
                    .to
                    .as_deref()
                    .map(|to| to.eq_ignore_ascii_case(address))
                    .unwrap_or(false);
                if !to_watched {
                    continue;
                }

                let wei = parse_quantity(&tx.value)
                    .ok_or_else(|| ChainError::Parse(format!("value {}", tx.value)))?;
                if wei == 0 {
                    continue;
                }
                let amount = wei_to_native(wei)
                    .ok_or_else(|| ChainError::Parse(format!("value out of range: {}", wei)))?;

                transfers.push(IncomingTransfer {
                    tx_hash: tx.hash,
                    from_address: tx.from,
                    amount,
                    block_number,
                });
            }
        }

        tracing::debug!(
            chain = %self.chain,
            address = %address,
            from_block = start,
            to_block = height,
            found = transfers.len(),
            "Scanned for incoming transfers"
        );

        Ok(transfers)
    }

    async fn get_transaction_status(&self, tx_hash: &str) -> Result<Option<TxStatus>, ChainError> {
        let value = self
            .call("eth_getTransactionReceipt", json!([tx_hash]))
            .await?;
        if value.is_null() {
            return Ok(None);
        }

        let receipt: RpcReceipt = serde_json::from_value(value)
            .map_err(|e| ChainError::Parse(format!("receipt {}: {}", tx_hash, e)))?;

        // Pending transactions have a receipt without a block on some nodes
        let Some(block_hex) = receipt.block_number else {
            return Ok(None);
        };
        let block_number = parse_u64(&block_hex)?;
        let height = self.get_current_height().await?;

        Ok(Some(TxStatus {
            block_number,
            confirmations: confirmations_at(height, block_number),
            succeeded: receipt.status.as_deref().map(|s| s == "0x1").unwrap_or(true),
        }))
    }

    async fn get_balance(&self, address: &str) -> Result<Decimal, ChainError> {
        let value = self
            .call("eth_getBalance", json!([address, "latest"]))
            .await?;
        let raw = value
            .as_str()
            .ok_or_else(|| ChainError::Parse(format!("balance: {}", value)))?;
        let wei =
            parse_quantity(raw).ok_or_else(|| ChainError::Parse(format!("balance {}", raw)))?;

        wei_to_native(wei).ok_or_else(|| ChainError::Parse(format!("balance out of range: {}", wei)))
    }

    async fn broadcast(&self, tx: &SignedTransaction) -> Result<BroadcastOutcome, ChainError> {
        let response = self
            .call("eth_sendRawTransaction", json!([tx.raw_hex]))
            .await;
        broadcast_outcome(response)
    }
}

fn broadcast_outcome(response: Result<Value, ChainError>) -> Result<BroadcastOutcome, ChainError> {
    match response {
        Ok(Value::String(hash)) => Ok(BroadcastOutcome::Accepted(hash)),
        // No error but no hash either: the node may hold the transaction
        Ok(other) => Err(ChainError::UncertainBroadcast(format!(
            "unexpected eth_sendRawTransaction result: {}",
            other
        ))),
        // The node evaluated and refused the transaction
        Err(ChainError::Rpc { code, message }) if code < 0 => {
            Ok(BroadcastOutcome::Rejected(message))
        }
        Err(e) => Err(e),
    }
}

fn map_transport(e: reqwest::Error) -> ChainError {
    if e.is_timeout() {
        ChainError::Timeout
    } else {
        ChainError::Transport(e)
    }
}

fn parse_u64(hex: &str) -> Result<u64, ChainError> {
    parse_quantity(hex)
        .and_then(|v| u64::try_from(v).ok())
        .ok_or_else(|| ChainError::Parse(format!("quantity {}", hex)))
}

fn quantity_u64(value: &Value) -> Result<u64, ChainError> {
    let raw = value
        .as_str()
        .ok_or_else(|| ChainError::Parse(format!("expected hex quantity, got {}", value)))?;
    parse_u64(raw)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quantity_parsing() {
        assert_eq!(quantity_u64(&json!("0x64")).unwrap(), 100);
        assert!(quantity_u64(&json!(100)).is_err());
        assert!(parse_u64("64").is_err());
    }

    #[test]
    fn test_broadcast_outcomes() {
        assert_eq!(
            broadcast_outcome(Ok(json!("0xhash"))).unwrap(),
            BroadcastOutcome::Accepted("0xhash".to_string())
        );
        assert_eq!(
            broadcast_outcome(Err(ChainError::Rpc {
                code: -32000,
                message: "insufficient funds for gas".to_string(),
            }))
            .unwrap(),
            BroadcastOutcome::Rejected("insufficient funds for gas".to_string())
        );
        assert!(matches!(
            broadcast_outcome(Ok(Value::Null)),
            Err(ChainError::UncertainBroadcast(_))
        ));
        assert!(matches!(
            broadcast_outcome(Err(ChainError::Timeout)),
            Err(ChainError::Timeout)
        ));
    }

    #[test]
    fn test_block_deserialization() {
        let block: RpcBlock = serde_json::from_value(json!({
            "number": "0x10",
            "hash": "0xblock",
            "transactions": [
                { "hash": "0xa", "from": "0x1", "to": "0xWATCHED", "value": "0xde0b6b3a7640000" },
                { "hash": "0xb", "from": "0x1", "to": null, "value": "0x0" }
            ]
        }))
        .unwrap();

        assert_eq!(parse_u64(&block.number).unwrap(), 16);
        assert_eq!(block.transactions.len(), 2);
        assert!(block.transactions[1].to.is_none());
        assert_eq!(
            wei_to_native(parse_quantity(&block.transactions[0].value).unwrap()).unwrap(),
            Decimal::ONE
        );
    }

    #[test]
    fn test_receipt_deserialization() {
        let receipt: RpcReceipt = serde_json::from_value(json!({
            "blockNumber": "0x64",
            "status": "0x0",
            "transactionHash": "0xabc"
        }))
        .unwrap();

        assert_eq!(receipt.block_number.as_deref(), Some("0x64"));
        assert_eq!(receipt.status.as_deref(), Some("0x0"));
    }

    #[test]
    fn test_rpc_error_body() {
        let resp: RpcResponse = serde_json::from_value(json!({
            "jsonrpc": "2.0",
            "id": 1,
            "error": { "code": -32000, "message": "insufficient fee" }
        }))
        .unwrap();

        assert!(resp.result.is_none());
        let err = resp.error.unwrap();
        assert_eq!(err.code, -32000);
        assert_eq!(err.message, "insufficient fee");
    }

    #[tokio::test]
    async fn test_unreachable_node_is_transport_error() {
        let client =
            EvmRpcClient::new(Chain::Ethereum, "http://127.0.0.1:9", Duration::from_secs(1), 4)
                .unwrap();
        let result = client.get_current_height().await;
        assert!(matches!(
            result,
            Err(ChainError::Transport(_)) | Err(ChainError::Timeout)
        ));
    }
}
