//! Local cache over an embedded sled database.
//!
//! Every write here is a cache write, never authoritative: the ledger entry
//! referenced by `tx_ref` is the record of truth and the cache can always be
//! rebuilt from it. Relational constraints are carried structurally:
//! UNIQUE(number) by the `invoice_numbers` index tree, UNIQUE(tx id,
//! invoice id) by the payments key `{invoice_id}/{tx_id}`, FK cascade by
//! prefix scans.

use std::path::Path;

use anyhow::{anyhow, Result};
use chrono::Utc;
use sled::Db;

use chainvoice_core::models::{Invoice, InvoiceStatus, LineItem, PaidTotals, Payment, Unit};

const TREE_INVOICES: &str = "invoices";
const TREE_NUMBERS: &str = "invoice_numbers";
const TREE_ITEMS: &str = "invoice_items";
const TREE_PAYMENTS: &str = "payments";
const TREE_CONFIG: &str = "config";

const KEY_LAST_PROCESSED_BLOCK: &str = "last_processed_block";
const KEY_INVOICE_SEQ: &str = "invoice_seq";

pub struct RecordStore {
    db: Db,
}

impl RecordStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        Ok(Self {
            db: sled::open(path)?,
        })
    }

    /// Throwaway in-memory-backed store for tests.
    pub fn temporary() -> Result<Self> {
        Ok(Self {
            db: sled::Config::new().temporary(true).open()?,
        })
    }

    fn invoices(&self) -> Result<sled::Tree> {
        Ok(self.db.open_tree(TREE_INVOICES)?)
    }

    fn numbers(&self) -> Result<sled::Tree> {
        Ok(self.db.open_tree(TREE_NUMBERS)?)
    }

    fn items(&self) -> Result<sled::Tree> {
        Ok(self.db.open_tree(TREE_ITEMS)?)
    }

    fn payments(&self) -> Result<sled::Tree> {
        Ok(self.db.open_tree(TREE_PAYMENTS)?)
    }

    fn config(&self) -> Result<sled::Tree> {
        Ok(self.db.open_tree(TREE_CONFIG)?)
    }

    /// Insert an invoice and its line items. The human-readable number must
    /// be unique; a duplicate fails without touching the cache.
    pub fn insert_invoice(&self, invoice: &Invoice, items: &[LineItem]) -> Result<()> {
        let numbers = self.numbers()?;
        let claimed = numbers.compare_and_swap(
            invoice.number.as_bytes(),
            None as Option<&[u8]>,
            Some(invoice.id.as_bytes()),
        )?;
        if claimed.is_err() {
            return Err(anyhow!("duplicate invoice number: {}", invoice.number));
        }

        self.invoices()?
            .insert(invoice.id.as_bytes(), serde_json::to_vec(invoice)?)?;
        let items_tree = self.items()?;
        for item in items {
            let key = format!("{}/{}", invoice.id, item.id);
            items_tree.insert(key.as_bytes(), serde_json::to_vec(item)?)?;
        }
        Ok(())
    }

    pub fn get_invoice(&self, id: &str) -> Result<Option<Invoice>> {
        match self.invoices()?.get(id.as_bytes())? {
            Some(raw) => Ok(Some(serde_json::from_slice(&raw)?)),
            None => Ok(None),
        }
    }

    pub fn get_invoice_by_number(&self, number: &str) -> Result<Option<Invoice>> {
        match self.numbers()?.get(number.as_bytes())? {
            Some(id) => self.get_invoice(std::str::from_utf8(&id)?),
            None => Ok(None),
        }
    }

    pub fn items_for_invoice(&self, invoice_id: &str) -> Result<Vec<LineItem>> {
        let prefix = format!("{invoice_id}/");
        let mut out = Vec::new();
        for entry in self.items()?.scan_prefix(prefix.as_bytes()) {
            let (_key, raw) = entry?;
            out.push(serde_json::from_slice(&raw)?);
        }
        Ok(out)
    }

    /// All cached invoices, most recently created first.
    pub fn list_invoices(&self) -> Result<Vec<Invoice>> {
        let mut out = Vec::new();
        for entry in self.invoices()?.iter() {
            let (_key, raw) = entry?;
            let invoice: Invoice = serde_json::from_slice(&raw)?;
            out.push(invoice);
        }
        out.sort_by_key(|i| i.created_at);
        out.reverse();
        Ok(out)
    }

    fn update_invoice<F>(&self, id: &str, mut f: F) -> Result<()>
    where
        F: FnMut(&mut Invoice),
    {
        let invoices = self.invoices()?;
        let existing = invoices
            .get(id.as_bytes())?
            .ok_or_else(|| anyhow!("invoice not found: {id}"))?;
        let mut invoice: Invoice = serde_json::from_slice(&existing)?;
        f(&mut invoice);
        invoices.insert(id.as_bytes(), serde_json::to_vec(&invoice)?)?;
        Ok(())
    }

    pub fn set_status(&self, id: &str, status: InvoiceStatus) -> Result<()> {
        self.update_invoice(id, |invoice| {
            invoice.status = status;
            invoice.updated_at = Utc::now();
        })
    }

    /// Record a successful ledger write on the cache row.
    pub fn link_ledger_entry(
        &self,
        id: &str,
        tx_ref: &str,
        content_locator: Option<&str>,
        ciphertext: &str,
    ) -> Result<()> {
        self.update_invoice(id, |invoice| {
            invoice.tx_ref = Some(tx_ref.to_string());
            invoice.content_locator = content_locator.map(str::to_string);
            invoice.ciphertext = Some(ciphertext.to_string());
            invoice.updated_at = Utc::now();
        })
    }

    /// Backfill the ciphertext on a rehydrated cache row.
    pub fn set_ciphertext(&self, id: &str, ciphertext: &str) -> Result<()> {
        self.update_invoice(id, |invoice| {
            invoice.ciphertext = Some(ciphertext.to_string());
        })
    }

    /// Cascade delete: invoice row, number index, line items and payments.
    /// Discards only the cache; the ledger record cannot be retracted.
    pub fn delete_invoice(&self, id: &str) -> Result<bool> {
        let Some(invoice) = self.get_invoice(id)? else {
            return Ok(false);
        };
        self.numbers()?.remove(invoice.number.as_bytes())?;
        self.invoices()?.remove(id.as_bytes())?;
        let prefix = format!("{id}/");
        for tree in [self.items()?, self.payments()?] {
            let keys: Vec<_> = tree
                .scan_prefix(prefix.as_bytes())
                .keys()
                .collect::<std::result::Result<_, _>>()?;
            for key in keys {
                tree.remove(key)?;
            }
        }
        Ok(true)
    }

    /// Insert a payment row keyed by `(invoice id, ledger tx id)`. Returns
    /// whether a row was actually inserted; re-observing the same transfer
    /// is a no-op.
    pub fn record_payment(&self, payment: &Payment) -> Result<bool> {
        let key = format!("{}/{}", payment.invoice_id, payment.tx_id);
        let inserted = self.payments()?.compare_and_swap(
            key.as_bytes(),
            None as Option<&[u8]>,
            Some(serde_json::to_vec(payment)?),
        )?;
        Ok(inserted.is_ok())
    }

    pub fn payments_for_invoice(&self, invoice_id: &str) -> Result<Vec<Payment>> {
        let prefix = format!("{invoice_id}/");
        let mut out = Vec::new();
        for entry in self.payments()?.scan_prefix(prefix.as_bytes()) {
            let (_key, raw) = entry?;
            out.push(serde_json::from_slice(&raw)?);
        }
        Ok(out)
    }

    /// Cumulative paid amounts per unit, recomputed from all rows rather
    /// than incrementally, to stay correct under duplicate observation.
    pub fn paid_totals(&self, invoice_id: &str) -> Result<PaidTotals> {
        let mut totals = PaidTotals::default();
        for payment in self.payments_for_invoice(invoice_id)? {
            match payment.unit {
                Unit::Native => totals.native += payment.amount,
                Unit::Stable => totals.stable += payment.amount,
            }
        }
        Ok(totals)
    }

    /// Highest block height fully processed by the scan loop, if any.
    pub fn last_processed_block(&self) -> Result<Option<u64>> {
        match self.config()?.get(KEY_LAST_PROCESSED_BLOCK)? {
            Some(raw) => {
                let bytes: [u8; 8] = raw
                    .as_ref()
                    .try_into()
                    .map_err(|_| anyhow!("corrupt checkpoint value"))?;
                Ok(Some(u64::from_be_bytes(bytes)))
            }
            None => Ok(None),
        }
    }

    /// Persist the checkpoint. Monotonically non-decreasing; an attempt to
    /// move it backward is ignored.
    pub fn set_last_processed_block(&self, height: u64) -> Result<()> {
        if let Some(current) = self.last_processed_block()? {
            if height < current {
                tracing::warn!(height, current, "refusing to move scan checkpoint backward");
                return Ok(());
            }
        }
        self.config()?
            .insert(KEY_LAST_PROCESSED_BLOCK, height.to_be_bytes().to_vec())?;
        Ok(())
    }

    /// Force the checkpoint to an arbitrary height. Administrative use only
    /// (re-scans are safe because payment recording is idempotent).
    pub fn reset_checkpoint(&self, height: u64) -> Result<()> {
        self.config()?
            .insert(KEY_LAST_PROCESSED_BLOCK, height.to_be_bytes().to_vec())?;
        Ok(())
    }

    /// Next value of the human-readable invoice sequence, as `INV-<n>`.
    pub fn next_invoice_number(&self) -> Result<String> {
        let config = self.config()?;
        let raw = config.update_and_fetch(KEY_INVOICE_SEQ, |old| {
            let next = match old {
                Some(bytes) => {
                    let current: [u8; 8] = bytes.try_into().unwrap_or([0; 8]);
                    u64::from_be_bytes(current) + 1
                }
                None => 1,
            };
            Some(next.to_be_bytes().to_vec())
        })?;
        let raw = raw.ok_or_else(|| anyhow!("sequence update yielded no value"))?;
        let bytes: [u8; 8] = raw
            .as_ref()
            .try_into()
            .map_err(|_| anyhow!("corrupt sequence value"))?;
        Ok(format!("INV-{}", u64::from_be_bytes(bytes)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chainvoice_core::models::{ConversionSnapshot, InvoiceDraft, ItemDraft};

    fn sample_invoice(id: &str, number: &str) -> (Invoice, Vec<LineItem>) {
        let draft = InvoiceDraft {
            client: "acme".to_string(),
            currency: "EUR".to_string(),
            items: vec![ItemDraft {
                description: "consulting".to_string(),
                quantity: 2.0,
                unit_price: 50.0,
            }],
            tax: 21.0,
            due_at: None,
            conversion: ConversionSnapshot {
                native_amount: 10.0,
                stable_amount: 4.0,
                rate: 0.4,
                sampled_at: Utc::now(),
            },
        };
        draft.build(id.to_string(), number.to_string(), Utc::now())
    }

    fn payment(invoice_id: &str, tx_id: &str, amount: f64) -> Payment {
        Payment {
            id: uuid::Uuid::new_v4().to_string(),
            invoice_id: invoice_id.to_string(),
            payer: "acme".to_string(),
            amount,
            unit: Unit::Native,
            block_number: 7,
            tx_id: tx_id.to_string(),
            observed_at: Utc::now(),
        }
    }

    #[test]
    fn invoice_round_trip_and_number_index() {
        let store = RecordStore::temporary().unwrap();
        let (invoice, items) = sample_invoice("id-1", "INV-1");
        store.insert_invoice(&invoice, &items).unwrap();

        let by_id = store.get_invoice("id-1").unwrap().unwrap();
        assert_eq!(by_id.number, "INV-1");
        let by_number = store.get_invoice_by_number("INV-1").unwrap().unwrap();
        assert_eq!(by_number.id, "id-1");
        assert_eq!(store.items_for_invoice("id-1").unwrap().len(), 1);
    }

    #[test]
    fn duplicate_numbers_are_rejected() {
        let store = RecordStore::temporary().unwrap();
        let (first, items) = sample_invoice("id-1", "INV-1");
        store.insert_invoice(&first, &items).unwrap();
        let (second, items) = sample_invoice("id-2", "INV-1");
        assert!(store.insert_invoice(&second, &items).is_err());
        assert!(store.get_invoice("id-2").unwrap().is_none());
    }

    #[test]
    fn payment_recording_is_idempotent() {
        let store = RecordStore::temporary().unwrap();
        let (invoice, items) = sample_invoice("id-1", "INV-1");
        store.insert_invoice(&invoice, &items).unwrap();

        assert!(store.record_payment(&payment("id-1", "tx-a", 6.0)).unwrap());
        assert!(!store.record_payment(&payment("id-1", "tx-a", 6.0)).unwrap());
        assert!(store.record_payment(&payment("id-1", "tx-b", 4.0)).unwrap());

        let rows = store.payments_for_invoice("id-1").unwrap();
        assert_eq!(rows.len(), 2);
        let totals = store.paid_totals("id-1").unwrap();
        assert_eq!(totals.native, 10.0);
        assert_eq!(totals.stable, 0.0);
    }

    #[test]
    fn cascade_delete_removes_items_and_payments() {
        let store = RecordStore::temporary().unwrap();
        let (invoice, items) = sample_invoice("id-1", "INV-1");
        store.insert_invoice(&invoice, &items).unwrap();
        store.record_payment(&payment("id-1", "tx-a", 6.0)).unwrap();

        assert!(store.delete_invoice("id-1").unwrap());
        assert!(store.get_invoice("id-1").unwrap().is_none());
        assert!(store.get_invoice_by_number("INV-1").unwrap().is_none());
        assert!(store.items_for_invoice("id-1").unwrap().is_empty());
        assert!(store.payments_for_invoice("id-1").unwrap().is_empty());
        // the number is free again after deletion
        let (again, items) = sample_invoice("id-9", "INV-1");
        store.insert_invoice(&again, &items).unwrap();
    }

    #[test]
    fn checkpoint_is_monotonic() {
        let store = RecordStore::temporary().unwrap();
        assert_eq!(store.last_processed_block().unwrap(), None);
        store.set_last_processed_block(10).unwrap();
        store.set_last_processed_block(12).unwrap();
        store.set_last_processed_block(11).unwrap(); // ignored
        assert_eq!(store.last_processed_block().unwrap(), Some(12));
        store.reset_checkpoint(5).unwrap();
        assert_eq!(store.last_processed_block().unwrap(), Some(5));
    }

    #[test]
    fn invoice_sequence_increments() {
        let store = RecordStore::temporary().unwrap();
        assert_eq!(store.next_invoice_number().unwrap(), "INV-1");
        assert_eq!(store.next_invoice_number().unwrap(), "INV-2");
        assert_eq!(store.next_invoice_number().unwrap(), "INV-3");
    }

    #[test]
    fn status_updates_touch_updated_at() {
        let store = RecordStore::temporary().unwrap();
        let (invoice, items) = sample_invoice("id-1", "INV-1");
        store.insert_invoice(&invoice, &items).unwrap();

        store.set_status("id-1", InvoiceStatus::Partial).unwrap();
        let updated = store.get_invoice("id-1").unwrap().unwrap();
        assert_eq!(updated.status, InvoiceStatus::Partial);
        assert!(updated.updated_at >= invoice.updated_at);
    }
}
