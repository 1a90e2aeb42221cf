//! The write/read path between invoice records and ledger entries.
//!
//! Writes encrypt the full record for the issuer/client pair and embed the
//! ciphertext in a carrier entry tagged with the application id plus enough
//! public metadata for discovery without decryption. Reads scan the
//! operator's own history backward; O(history) in the worst case, so they
//! are a cache-miss fallback only.

use std::sync::Arc;

use serde_json::{json, Value};

use chainvoice_core::codec::{self, PrivateKey, PublicKey};
use chainvoice_core::models::{InvoiceDocument, StatusRecord};
use chainvoice_core::{memo, Error, Result};

use crate::directory::{KeyDirectory, KeyLookup};
use crate::{Amount, BroadcastReceipt, LedgerClient, Operation, WriteKey, NOTIFICATION_PING};

/// Where the carrier entry lives on the ledger.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageMode {
    /// Structured side-channel operation.
    SideChannel,
    /// Content post; the permalink becomes the content locator.
    Post,
}

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// The operator's own ledger handle.
    pub operator: String,
    /// Stable application-specific type identifier on every carrier entry.
    pub app_id: String,
    pub mode: StorageMode,
    /// Ledger payload-size ceiling, pre-flighted before encrypting.
    pub max_payload: usize,
    /// How far back the cache-miss history scan reaches.
    pub history_scan_limit: usize,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            operator: String::new(),
            app_id: "chainvoice".to_string(),
            mode: StorageMode::SideChannel,
            max_payload: 8192,
            history_scan_limit: 1000,
        }
    }
}

#[derive(Debug, Clone)]
pub struct StoredRecord {
    pub tx_ref: String,
    pub ciphertext: String,
    pub content_locator: Option<String>,
}

pub struct LedgerGateway {
    client: Arc<dyn LedgerClient>,
    directory: KeyDirectory,
    encryption_key: Option<PrivateKey>,
    write_key: Option<WriteKey>,
    config: GatewayConfig,
}

impl LedgerGateway {
    pub fn new(
        client: Arc<dyn LedgerClient>,
        encryption_key: Option<PrivateKey>,
        write_key: Option<WriteKey>,
        config: GatewayConfig,
    ) -> Self {
        let directory = KeyDirectory::new(client.clone());
        Self {
            client,
            directory,
            encryption_key,
            write_key,
            config,
        }
    }

    pub fn operator(&self) -> &str {
        &self.config.operator
    }

    pub fn client(&self) -> &Arc<dyn LedgerClient> {
        &self.client
    }

    /// Both configured keys, or a missing-key error before any network call.
    fn keys(&self) -> Result<(&PrivateKey, &WriteKey)> {
        let encryption = self
            .encryption_key
            .as_ref()
            .ok_or(Error::MissingKey("encryption key"))?;
        let write = self
            .write_key
            .as_ref()
            .ok_or(Error::MissingKey("write authorization key"))?;
        Ok((encryption, write))
    }

    async fn resolve_recipient(&self, handle: &str) -> Result<PublicKey> {
        match self.directory.resolve(handle).await {
            KeyLookup::Known(key) => Ok(key),
            KeyLookup::Unknown => Err(Error::NotFound(format!(
                "no resolvable encryption key for account {handle}"
            ))),
        }
    }

    /// Encrypt an invoice record and append it to the ledger. The caller owns
    /// cache consistency: on failure no cache row may keep referencing this
    /// write.
    pub async fn store_record(
        &self,
        record: &InvoiceDocument,
        recipient: &str,
    ) -> Result<StoredRecord> {
        let (encryption_key, write_key) = self.keys()?;
        let recipient_key = self.resolve_recipient(recipient).await?;

        let estimated = codec::estimate_ciphertext_len(record)?;
        if estimated > self.config.max_payload {
            return Err(Error::InvalidTransaction(format!(
                "record of {estimated} bytes exceeds the ledger payload ceiling of {}",
                self.config.max_payload
            )));
        }

        let ciphertext = codec::encrypt(record, encryption_key, &recipient_key)?;
        let metadata = json!({
            "app": self.config.app_id,
            "type": "invoice",
            "id": record.id,
            "number": record.number,
            "status": "pending",
            "currency": record.currency,
            "due": record.due_at,
            "recipient": recipient,
        });

        let (operation, content_locator) = match self.config.mode {
            StorageMode::SideChannel => {
                let mut entry = metadata;
                entry["payload"] = Value::String(ciphertext.clone());
                (
                    Operation::Custom {
                        id: self.config.app_id.clone(),
                        author: self.config.operator.clone(),
                        json: entry,
                    },
                    None,
                )
            }
            StorageMode::Post => {
                let permlink = format!("{}-inv-{}", self.config.app_id, record.id);
                let locator = format!("@{}/{}", self.config.operator, permlink);
                (
                    Operation::Post {
                        author: self.config.operator.clone(),
                        permlink,
                        title: format!("Invoice {}", record.number),
                        body: ciphertext.clone(),
                        json_metadata: metadata,
                    },
                    Some(locator),
                )
            }
        };

        let receipt = self.client.broadcast(vec![operation], write_key).await?;
        tracing::info!(
            number = %record.number,
            tx = %receipt.transaction_id,
            recipient,
            "invoice record stored on ledger"
        );
        Ok(StoredRecord {
            tx_ref: receipt.transaction_id,
            ciphertext,
            content_locator,
        })
    }

    /// Append an encrypted status-transition record, with number and status
    /// duplicated in public metadata so the audit trail is discoverable
    /// without decryption.
    pub async fn store_status_update(
        &self,
        update: &StatusRecord,
        recipient: &str,
    ) -> Result<BroadcastReceipt> {
        let (encryption_key, write_key) = self.keys()?;
        let recipient_key = self.resolve_recipient(recipient).await?;
        let ciphertext = codec::encrypt(update, encryption_key, &recipient_key)?;

        let entry = json!({
            "app": self.config.app_id,
            "type": "invoice_status",
            "number": update.number,
            "status": update.status.as_str(),
            "payload": ciphertext,
        });
        let receipt = self
            .client
            .broadcast(
                vec![Operation::Custom {
                    id: self.config.app_id.clone(),
                    author: self.config.operator.clone(),
                    json: entry,
                }],
                write_key,
            )
            .await?;
        tracing::info!(
            number = %update.number,
            status = update.status.as_str(),
            tx = %receipt.transaction_id,
            "status update appended to ledger"
        );
        Ok(receipt)
    }

    /// Cache-miss fallback: scan the operator's history backward for the
    /// carrier entry of `record_id` and return its ciphertext.
    pub async fn fetch_record(&self, record_id: &str) -> Result<Option<String>> {
        let history = self
            .client
            .account_history(&self.config.operator, self.config.history_scan_limit)
            .await?;
        for applied in history.iter().rev() {
            if let Some(ciphertext) = self.record_payload(&applied.operation, record_id) {
                return Ok(Some(ciphertext));
            }
        }
        Ok(None)
    }

    fn record_payload(&self, operation: &Operation, record_id: &str) -> Option<String> {
        match operation {
            Operation::Custom { id, json, .. } if id == &self.config.app_id => {
                if json.get("type").and_then(Value::as_str) == Some("invoice")
                    && json.get("id").and_then(Value::as_str) == Some(record_id)
                {
                    return json
                        .get("payload")
                        .and_then(Value::as_str)
                        .map(str::to_string);
                }
                None
            }
            Operation::Post {
                body,
                json_metadata,
                ..
            } => {
                if json_metadata.get("app").and_then(Value::as_str)
                    == Some(self.config.app_id.as_str())
                    && json_metadata.get("type").and_then(Value::as_str) == Some("invoice")
                    && json_metadata.get("id").and_then(Value::as_str) == Some(record_id)
                {
                    return Some(body.clone());
                }
                None
            }
            _ => None,
        }
    }

    /// Public metadata of every status-update entry for an invoice number,
    /// oldest first. Used by startup reconciliation to decide whether the
    /// ledger already carries a status trail.
    pub async fn fetch_status_updates(&self, number: &str) -> Result<Vec<Value>> {
        let history = self
            .client
            .account_history(&self.config.operator, self.config.history_scan_limit)
            .await?;
        let mut updates = Vec::new();
        for applied in history {
            if let Operation::Custom { id, json, .. } = &applied.operation {
                if id == &self.config.app_id
                    && json.get("type").and_then(Value::as_str) == Some("invoice_status")
                    && json.get("number").and_then(Value::as_str) == Some(number)
                {
                    updates.push(json.clone());
                }
            }
        }
        Ok(updates)
    }

    /// Decrypt a fetched ciphertext with the operator's own key.
    pub fn decrypt_record(&self, ciphertext: &str) -> Result<InvoiceDocument> {
        let key = self
            .encryption_key
            .as_ref()
            .ok_or(Error::MissingKey("encryption key"))?;
        codec::decrypt(ciphertext, key)
    }

    /// Transfer-broadcast primitive.
    pub async fn send_transfer(
        &self,
        to: &str,
        amount: Amount,
        memo: &str,
    ) -> Result<BroadcastReceipt> {
        let write_key = self
            .write_key
            .as_ref()
            .ok_or(Error::MissingKey("write authorization key"))?;
        self.client
            .broadcast(
                vec![Operation::Transfer {
                    from: self.config.operator.clone(),
                    to: to.to_string(),
                    amount,
                    memo: memo.to_string(),
                }],
                write_key,
            )
            .await
    }

    /// The notification-ping convention: a minimal self-transfer whose memo
    /// names the invoice and links the payment page. The monitor excludes it
    /// from payment accounting.
    pub async fn send_notification_ping(&self, number: &str, url: &str) -> Result<BroadcastReceipt> {
        let memo = memo::notification_memo(number, url);
        let receipt = self
            .send_transfer(&self.config.operator, NOTIFICATION_PING, &memo)
            .await?;
        tracing::info!(number, tx = %receipt.transaction_id, "notification ping sent");
        Ok(receipt)
    }
}
