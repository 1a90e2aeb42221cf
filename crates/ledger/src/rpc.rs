//! JSON-RPC ledger client with endpoint-list failover.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::json;
use sha2::{Digest, Sha256};

use chainvoice_core::{Error, Result};

use crate::{
    AccountInfo, AppliedOperation, Block, BroadcastReceipt, LedgerClient, Operation, WriteKey,
};

const RPC_TIMEOUT: Duration = Duration::from_secs(30);
const TX_EXPIRATION: Duration = Duration::from_secs(60);

#[derive(Clone)]
pub struct RpcLedger {
    endpoints: Vec<String>,
    http_client: reqwest::Client,
}

#[derive(Debug, Deserialize)]
struct RpcResponse<R> {
    result: Option<R>,
    error: Option<RpcError>,
}

#[derive(Debug, Deserialize)]
struct RpcError {
    #[allow(dead_code)]
    code: i64,
    message: String,
}

#[derive(Debug, Deserialize)]
struct DynamicProperties {
    head_block_number: u64,
}

impl RpcLedger {
    pub fn new(endpoints: Vec<String>) -> Result<Arc<Self>> {
        if endpoints.is_empty() {
            return Err(Error::Network("no ledger endpoints configured".to_string()));
        }
        let http_client = reqwest::Client::builder()
            .timeout(RPC_TIMEOUT)
            .tcp_keepalive(Duration::from_secs(60))
            .build()
            .map_err(|e| Error::Network(format!("failed to build http client: {e}")))?;
        Ok(Arc::new(Self {
            endpoints,
            http_client,
        }))
    }

    /// Issue one call, walking the endpoint list until one answers. A
    /// ledger-side rejection is classified from the reported reason text;
    /// transport problems surface as network errors only once every
    /// endpoint has failed.
    async fn call<P: Serialize, R: DeserializeOwned>(&self, method: &str, params: P) -> Result<R> {
        let body = json!({
            "jsonrpc": "2.0",
            "id": 1,
            "method": method,
            "params": params,
        });

        let mut last_err = Error::Network("no ledger endpoints configured".to_string());
        for endpoint in &self.endpoints {
            let sent = self.http_client.post(endpoint).json(&body).send().await;
            let response = match sent {
                Ok(response) => response,
                Err(err) => {
                    tracing::warn!(endpoint, method, error = %err, "ledger endpoint unreachable, failing over");
                    last_err = Error::Network(err.to_string());
                    continue;
                }
            };
            if !response.status().is_success() {
                let status = response.status();
                tracing::warn!(endpoint, method, %status, "ledger endpoint returned an error status");
                last_err = Error::Network(format!("{endpoint} returned {status}"));
                continue;
            }
            let parsed: RpcResponse<R> = response
                .json()
                .await
                .map_err(|e| Error::Network(format!("malformed rpc response: {e}")))?;
            if let Some(err) = parsed.error {
                return Err(Error::classify_broadcast(err.message));
            }
            return parsed
                .result
                .ok_or_else(|| Error::Network("rpc response carried no result".to_string()));
        }
        Err(last_err)
    }
}

#[async_trait]
impl LedgerClient for RpcLedger {
    async fn broadcast(&self, operations: Vec<Operation>, key: &WriteKey) -> Result<BroadcastReceipt> {
        let expiration = chrono::Utc::now() + TX_EXPIRATION;
        let transaction = json!({
            "operations": operations,
            "expiration": expiration.to_rfc3339(),
        });
        let payload = serde_json::to_vec(&transaction)
            .map_err(|e| Error::InvalidTransaction(format!("transaction serialization: {e}")))?;
        let digest = Sha256::digest(&payload);
        let signature = key.sign(&digest);

        let receipt: BroadcastReceipt = self
            .call(
                "chain.broadcast_transaction",
                json!([{ "transaction": transaction, "signature": signature }]),
            )
            .await?;
        tracing::info!(
            transaction_id = %receipt.transaction_id,
            block = receipt.block_number,
            "transaction broadcast to ledger"
        );
        Ok(receipt)
    }

    async fn head_block(&self) -> Result<u64> {
        let props: DynamicProperties = self.call("chain.get_dynamic_properties", json!([])).await?;
        Ok(props.head_block_number)
    }

    async fn get_block(&self, height: u64) -> Result<Option<Block>> {
        self.call("chain.get_block", json!([height])).await
    }

    async fn get_account(&self, handle: &str) -> Result<Option<AccountInfo>> {
        self.call("chain.get_account", json!([handle])).await
    }

    async fn account_history(&self, handle: &str, limit: usize) -> Result<Vec<AppliedOperation>> {
        self.call("chain.get_account_history", json!([handle, limit]))
            .await
    }
}
