//! Ledger access: the external read/write primitives, the key directory and
//! the gateway that stores encrypted invoice records as ledger entries.
//!
//! The ledger is an append-only, already-finalized oracle. Nothing here
//! validates blocks; they are consumed in forward-only height order.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;

use chainvoice_core::models::Unit;
use chainvoice_core::{Error, Result};

pub mod directory;
pub mod gateway;
pub mod mock;
pub mod rpc;

/// Fixed-point asset amount with three decimal places, the ledger's native
/// precision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Amount {
    pub millis: i64,
    pub unit: Unit,
}

impl Amount {
    pub fn native(value: f64) -> Self {
        Self {
            millis: (value * 1000.0).round() as i64,
            unit: Unit::Native,
        }
    }

    pub fn stable(value: f64) -> Self {
        Self {
            millis: (value * 1000.0).round() as i64,
            unit: Unit::Stable,
        }
    }

    pub fn as_float(&self) -> f64 {
        self.millis as f64 / 1000.0
    }
}

impl fmt::Display for Amount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{:03} {}", self.millis / 1000, self.millis % 1000, self.unit)
    }
}

/// The minimal self-transfer used to surface a notification in the client's
/// transfer history. Never counted as a payment.
pub const NOTIFICATION_PING: Amount = Amount {
    millis: 1,
    unit: Unit::Native,
};

/// Typed ledger operations this core produces and consumes.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Operation {
    Transfer {
        from: String,
        to: String,
        amount: Amount,
        memo: String,
    },
    /// Structured side-channel entry tagged with an application id.
    Custom {
        id: String,
        author: String,
        json: serde_json::Value,
    },
    /// Content post; the permlink doubles as the content locator.
    Post {
        author: String,
        permlink: String,
        title: String,
        body: String,
        json_metadata: serde_json::Value,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BroadcastReceipt {
    pub transaction_id: String,
    pub block_number: u64,
    pub transaction_number: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlockTransaction {
    pub transaction_id: String,
    pub operations: Vec<Operation>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Block {
    pub height: u64,
    pub transactions: Vec<BlockTransaction>,
}

/// One operation as it appeared in an account's history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppliedOperation {
    pub block_number: u64,
    pub transaction_id: String,
    pub operation: Operation,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccountInfo {
    pub handle: String,
    /// Hex-encoded SEC1 public encryption key published by the account.
    pub encryption_key: String,
}

/// Write-authorization key used to sign broadcasts.
#[derive(Clone)]
pub struct WriteKey {
    signing: k256::ecdsa::SigningKey,
}

impl WriteKey {
    pub fn from_hex(s: &str) -> Result<Self> {
        if s.trim().is_empty() {
            return Err(Error::MissingKey("write authorization key"));
        }
        let bytes = hex::decode(s.trim()).map_err(|e| Error::InvalidKey {
            which: "write authorization key",
            reason: e.to_string(),
        })?;
        let signing = k256::ecdsa::SigningKey::from_slice(&bytes).map_err(|e| Error::InvalidKey {
            which: "write authorization key",
            reason: e.to_string(),
        })?;
        Ok(Self { signing })
    }

    pub fn generate() -> Self {
        Self {
            signing: k256::ecdsa::SigningKey::random(&mut rand::rngs::OsRng),
        }
    }

    pub fn sign(&self, payload: &[u8]) -> String {
        use k256::ecdsa::{signature::Signer, Signature};
        let signature: Signature = self.signing.sign(payload);
        hex::encode(signature.to_der())
    }
}

impl fmt::Debug for WriteKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("WriteKey(..)")
    }
}

/// External broadcast/query capability. Implemented by the JSON-RPC client
/// in production and by [`mock::MockLedger`] in tests.
#[async_trait]
pub trait LedgerClient: Send + Sync {
    /// Submit signed operations; returns the assigned transaction reference
    /// or a classified broadcast error.
    async fn broadcast(&self, operations: Vec<Operation>, key: &WriteKey) -> Result<BroadcastReceipt>;

    async fn head_block(&self) -> Result<u64>;

    async fn get_block(&self, height: u64) -> Result<Option<Block>>;

    async fn get_account(&self, handle: &str) -> Result<Option<AccountInfo>>;

    /// Account history, oldest first; used for the reverse cache-miss scan.
    async fn account_history(&self, handle: &str, limit: usize) -> Result<Vec<AppliedOperation>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn amount_rounding_and_display() {
        let amount = Amount::native(6.0);
        assert_eq!(amount.millis, 6000);
        assert_eq!(amount.to_string(), "6.000 NATIVE");
        assert_eq!(Amount::stable(0.1254).millis, 125);
        assert_eq!(NOTIFICATION_PING.to_string(), "0.001 NATIVE");
    }

    #[test]
    fn write_key_material_errors() {
        assert!(matches!(
            WriteKey::from_hex("").unwrap_err(),
            Error::MissingKey("write authorization key")
        ));
        assert!(matches!(
            WriteKey::from_hex("nothex").unwrap_err(),
            Error::InvalidKey { .. }
        ));
    }
}
