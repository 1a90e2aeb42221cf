//! Assembly of the runtime object graph from stored settings and keychain
//! secrets. Every component is constructed here and handed down explicitly;
//! nothing in the lower crates reaches for global state.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};

use chainvoice_core::codec::PrivateKey;
use config::Settings;
use ledger::gateway::{GatewayConfig, LedgerGateway, StorageMode};
use ledger::rpc::RpcLedger;
use ledger::WriteKey;
use store::RecordStore;

use crate::monitor::{MonitorConfig, PaymentMonitor};
use crate::InvoiceService;

/// The assembled core: the service for the call surface, the monitor ready
/// to be started.
pub struct App {
    pub service: Arc<InvoiceService>,
    pub monitor: Arc<PaymentMonitor>,
}

/// Build the object graph against the real JSON-RPC ledger.
///
/// Keys are loaded from the OS keychain; an absent secret leaves the
/// corresponding key unset and the gateway reports a missing-key error on
/// the first operation that needs it, so read-only usage works without any
/// provisioning.
pub fn assemble(settings: &Settings) -> Result<App> {
    let client = RpcLedger::new(settings.ledger.endpoints.clone())
        .context("ledger RPC client setup failed")?;

    let encryption_key = match config::get_secret(config::SECRET_ENCRYPTION_KEY) {
        Ok(hex) => Some(PrivateKey::from_hex(&hex, "encryption key")?),
        Err(_) => {
            tracing::warn!("no encryption key in keychain, record writes disabled");
            None
        }
    };
    let write_key = match config::get_secret(config::SECRET_WRITE_AUTHORIZATION_KEY) {
        Ok(hex) => Some(WriteKey::from_hex(&hex)?),
        Err(_) => {
            tracing::warn!("no write authorization key in keychain, broadcasts disabled");
            None
        }
    };

    let gateway = Arc::new(LedgerGateway::new(
        client,
        encryption_key,
        write_key,
        GatewayConfig {
            operator: settings.operator.clone(),
            app_id: settings.ledger.app_id.clone(),
            mode: storage_mode(&settings.ledger.storage_mode)?,
            max_payload: settings.ledger.max_payload,
            history_scan_limit: settings.ledger.history_scan_limit,
        },
    ));

    let record_store =
        Arc::new(RecordStore::open(&settings.cache_path).context("cache store setup failed")?);

    let service = Arc::new(InvoiceService::new(gateway.clone(), record_store.clone()));
    let monitor = Arc::new(PaymentMonitor::new(
        gateway,
        record_store,
        MonitorConfig {
            interval: Duration::from_secs(settings.monitor.scan_interval_secs),
            batch_size: settings.monitor.batch_size,
            epsilon: settings.monitor.payment_epsilon,
        },
    ));

    Ok(App { service, monitor })
}

fn storage_mode(name: &str) -> Result<StorageMode> {
    match name {
        "side_channel" => Ok(StorageMode::SideChannel),
        "post" => Ok(StorageMode::Post),
        other => anyhow::bail!("unknown storage mode: {other}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn storage_mode_names() {
        assert_eq!(storage_mode("side_channel").unwrap(), StorageMode::SideChannel);
        assert_eq!(storage_mode("post").unwrap(), StorageMode::Post);
        assert!(storage_mode("carrier-pigeon").is_err());
    }
}
