//! Participant handle to public encryption key resolution.
//!
//! Keys rotate rarely and lookups cost a network round trip, so successful
//! resolutions are cached for the process lifetime. Lookup failures resolve
//! to [`KeyLookup::Unknown`] instead of erroring; callers decide whether an
//! unknown key is fatal.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;

use chainvoice_core::codec::PublicKey;

use crate::LedgerClient;

#[derive(Debug, Clone)]
pub enum KeyLookup {
    Known(PublicKey),
    Unknown,
}

pub struct KeyDirectory {
    client: Arc<dyn LedgerClient>,
    cache: RwLock<HashMap<String, PublicKey>>,
}

impl KeyDirectory {
    pub fn new(client: Arc<dyn LedgerClient>) -> Self {
        Self {
            client,
            cache: RwLock::new(HashMap::new()),
        }
    }

    pub async fn resolve(&self, handle: &str) -> KeyLookup {
        {
            let cache = self.cache.read().await;
            if let Some(key) = cache.get(handle) {
                return KeyLookup::Known(key.clone());
            }
        }

        match self.client.get_account(handle).await {
            Ok(Some(info)) => match PublicKey::from_hex(&info.encryption_key, "account encryption key") {
                Ok(key) => {
                    let mut cache = self.cache.write().await;
                    cache.insert(handle.to_string(), key.clone());
                    KeyLookup::Known(key)
                }
                Err(err) => {
                    tracing::warn!(handle, error = %err, "account publishes unusable encryption key");
                    KeyLookup::Unknown
                }
            },
            Ok(None) => {
                tracing::debug!(handle, "no such account on the ledger");
                KeyLookup::Unknown
            }
            Err(err) => {
                // transient failures are not cached
                tracing::warn!(handle, error = %err, "account lookup failed");
                KeyLookup::Unknown
            }
        }
    }
}
