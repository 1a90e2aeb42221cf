//! Error taxonomy shared by the codec, the ledger gateway and the monitor.
//!
//! Broadcast failures are classified from the failure reason text reported by
//! the ledger endpoint; `is_broadcast` is the predicate table that treats the
//! specialized kinds as broadcast errors as well.

use thiserror::Error as ThisError;

#[derive(Debug, ThisError)]
pub enum Error {
    /// A required key is absent or blank.
    #[error("missing required key: {0}")]
    MissingKey(&'static str),

    /// Key material is present but malformed.
    #[error("invalid key material for {which}: {reason}")]
    InvalidKey { which: &'static str, reason: String },

    /// The record handed to the codec cannot be serialized.
    #[error("malformed record: {0}")]
    MalformedRecord(String),

    /// Encryption, decryption or post-decode parse failure not attributable
    /// to a specific key.
    #[error("crypto failure: {0}")]
    Crypto(String),

    /// A handle or record could not be resolved.
    #[error("not found: {0}")]
    NotFound(String),

    /// Submission rejected for a reason that matched no specialized kind.
    #[error("broadcast rejected: {0}")]
    Broadcast(String),

    /// Rate-limit or bandwidth exhaustion on the ledger side.
    #[error("insufficient resources: {0}")]
    InsufficientResources(String),

    /// Connectivity or timeout talking to a ledger endpoint.
    #[error("network failure: {0}")]
    Network(String),

    /// The ledger rejected the transaction itself (signature, format).
    #[error("invalid transaction: {0}")]
    InvalidTransaction(String),
}

impl Error {
    pub fn is_broadcast(&self) -> bool {
        matches!(
            self,
            Error::Broadcast(_)
                | Error::InsufficientResources(_)
                | Error::Network(_)
                | Error::InvalidTransaction(_)
        )
    }

    /// Classify a submission failure from its reason text.
    pub fn classify_broadcast(reason: impl Into<String>) -> Self {
        let reason = reason.into();
        let lower = reason.to_lowercase();

        let resource_markers = ["bandwidth", "rate limit", "resource credit", "quota exceeded"];
        let network_markers = [
            "timeout",
            "timed out",
            "connection",
            "unreachable",
            "dns",
            "network",
        ];
        let transaction_markers = [
            "signature",
            "missing authority",
            "serialization",
            "malformed transaction",
            "invalid transaction",
            "expired",
        ];

        if resource_markers.iter().any(|m| lower.contains(m)) {
            Error::InsufficientResources(reason)
        } else if network_markers.iter().any(|m| lower.contains(m)) {
            Error::Network(reason)
        } else if transaction_markers.iter().any(|m| lower.contains(m)) {
            Error::InvalidTransaction(reason)
        } else {
            Error::Broadcast(reason)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_resource_exhaustion() {
        let err = Error::classify_broadcast("account has insufficient bandwidth for this operation");
        assert!(matches!(err, Error::InsufficientResources(_)));
    }

    #[test]
    fn classifies_network_failures() {
        let err = Error::classify_broadcast("connection refused by peer");
        assert!(matches!(err, Error::Network(_)));
        let err = Error::classify_broadcast("request timed out after 30s");
        assert!(matches!(err, Error::Network(_)));
    }

    #[test]
    fn classifies_rejected_transactions() {
        let err = Error::classify_broadcast("transaction signature does not match required authority");
        assert!(matches!(err, Error::InvalidTransaction(_)));
    }

    #[test]
    fn unknown_reasons_fall_back_to_broadcast() {
        let err = Error::classify_broadcast("the ledger said no");
        assert!(matches!(err, Error::Broadcast(_)));
    }

    #[test]
    fn broadcast_predicate_covers_specialized_kinds() {
        assert!(Error::Broadcast("x".into()).is_broadcast());
        assert!(Error::InsufficientResources("x".into()).is_broadcast());
        assert!(Error::Network("x".into()).is_broadcast());
        assert!(Error::InvalidTransaction("x".into()).is_broadcast());
        assert!(!Error::MissingKey("encryption key").is_broadcast());
        assert!(!Error::NotFound("x".into()).is_broadcast());
    }
}
