//! Orchestration of the invoice write/read path.
//!
//! The ledger is the source of truth; the record store is a derived cache.
//! Creation writes the cache row first, broadcasts the encrypted record, and
//! compensates by deleting the row if the broadcast fails, so the cache never
//! claims an invoice that has no ledger write behind it. Reads serve cached
//! plaintext and fall back to a ledger fetch + decrypt + cache backfill.

pub mod compose;
pub mod monitor;

use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;

use chainvoice_core::models::{
    validate_draft, Invoice, InvoiceDocument, InvoiceDraft, LineItem,
};
use chainvoice_core::{memo, Error};
use ledger::gateway::LedgerGateway;
use ledger::BroadcastReceipt;
use store::RecordStore;

pub struct InvoiceService {
    gateway: Arc<LedgerGateway>,
    store: Arc<RecordStore>,
}

/// Read result: plaintext when the cache holds or the ciphertext decrypts,
/// otherwise the raw ciphertext rather than a failed read.
#[derive(Debug)]
pub enum FetchedInvoice {
    Plain {
        invoice: Invoice,
        items: Vec<LineItem>,
    },
    Opaque {
        id: String,
        ciphertext: String,
    },
}

impl InvoiceService {
    pub fn new(gateway: Arc<LedgerGateway>, store: Arc<RecordStore>) -> Self {
        Self { gateway, store }
    }

    pub fn store(&self) -> &Arc<RecordStore> {
        &self.store
    }

    /// Create an invoice: cache row, ledger broadcast, ledger linkage. On a
    /// failed broadcast the cache row and its items are deleted again.
    pub async fn create_invoice(&self, draft: InvoiceDraft) -> Result<Invoice> {
        if let Err(errors) = validate_draft(&draft) {
            anyhow::bail!("invalid invoice draft: {}", errors.join("; "));
        }

        let id = uuid::Uuid::new_v4().to_string();
        let number = self.store.next_invoice_number()?;
        let (invoice, items) = draft.build(id, number, Utc::now());
        self.store.insert_invoice(&invoice, &items)?;

        let document = InvoiceDocument::new(&invoice, &items);
        match self.gateway.store_record(&document, &invoice.client).await {
            Ok(stored) => {
                self.store.link_ledger_entry(
                    &invoice.id,
                    &stored.tx_ref,
                    stored.content_locator.as_deref(),
                    &stored.ciphertext,
                )?;
                tracing::info!(number = %invoice.number, tx = %stored.tx_ref, "invoice created");
                self.store
                    .get_invoice(&invoice.id)?
                    .context("invoice vanished after creation")
            }
            Err(err) => {
                // compensating deletion: no cache row may reference a write
                // that never happened
                if let Err(cleanup) = self.store.delete_invoice(&invoice.id) {
                    tracing::error!(
                        id = %invoice.id,
                        error = %cleanup,
                        "failed to roll back cache row after broadcast failure"
                    );
                }
                tracing::warn!(number = %invoice.number, error = %err, "invoice broadcast failed");
                Err(err.into())
            }
        }
    }

    /// Serve an invoice from the cache, rehydrating from the ledger on miss.
    pub async fn get_invoice(&self, id: &str) -> Result<FetchedInvoice> {
        if let Some(invoice) = self.store.get_invoice(id)? {
            let items = self.store.items_for_invoice(id)?;
            return Ok(FetchedInvoice::Plain { invoice, items });
        }

        let Some(ciphertext) = self.gateway.fetch_record(id).await? else {
            return Err(Error::NotFound(format!("invoice {id}")).into());
        };
        match self.gateway.decrypt_record(&ciphertext) {
            Ok(document) => {
                let (invoice, items) = document.into_cache_rows();
                self.store.insert_invoice(&invoice, &items)?;
                self.store.set_ciphertext(&invoice.id, &ciphertext)?;
                tracing::info!(id, "cache rehydrated from ledger record");
                let invoice = self
                    .store
                    .get_invoice(id)?
                    .context("invoice vanished after rehydration")?;
                Ok(FetchedInvoice::Plain { invoice, items })
            }
            Err(err) => {
                tracing::warn!(id, error = %err, "decryption failed, returning raw ciphertext");
                Ok(FetchedInvoice::Opaque {
                    id: id.to_string(),
                    ciphertext,
                })
            }
        }
    }

    pub fn list_invoices(&self) -> Result<Vec<Invoice>> {
        self.store.list_invoices()
    }

    /// Discard the cache rows. The ledger record cannot be retracted.
    pub fn delete_invoice(&self, id: &str) -> Result<bool> {
        let deleted = self.store.delete_invoice(id)?;
        if deleted {
            tracing::info!(id, "invoice cache rows deleted; ledger record remains");
        }
        Ok(deleted)
    }

    /// Alert the client by placing a ping in their transfer history.
    pub async fn notify_client(&self, id: &str, url: &str) -> Result<BroadcastReceipt> {
        let invoice = self
            .store
            .get_invoice(id)?
            .ok_or_else(|| Error::NotFound(format!("invoice {id}")))?;
        Ok(self
            .gateway
            .send_notification_ping(&invoice.number, url)
            .await?)
    }

    /// Memo the client should attach when paying.
    pub fn payment_request_memo(&self, invoice: &Invoice) -> String {
        memo::payment_request_memo(&invoice.number)
    }
}
