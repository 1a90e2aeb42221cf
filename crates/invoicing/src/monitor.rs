//! Block-scanning payment monitor.
//!
//! A single periodic background task advances a scan cursor over ledger
//! blocks, extracts transfers addressed to the operator, matches them to
//! invoices by parsing memos, records payments idempotently and drives the
//! invoice status state machine. Status transitions are appended to the
//! ledger first; if that append fails the cache is still updated and the
//! gap is left for reconciliation.
//!
//! The checkpoint is advanced per block, only after the block's transfers
//! are fully processed, so every transfer to the operator is observed at
//! least once across restarts.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use chainvoice_core::models::{advance_status, Invoice, InvoiceStatus, Payment, StatusRecord};
use chainvoice_core::memo;
use ledger::gateway::LedgerGateway;
use ledger::{Amount, Block, Operation, NOTIFICATION_PING};
use store::RecordStore;

#[derive(Debug, Clone)]
pub struct MonitorConfig {
    pub interval: Duration,
    /// Upper bound on blocks processed per tick.
    pub batch_size: u64,
    /// Payment tolerance in native/stable units.
    pub epsilon: f64,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(10),
            batch_size: 100,
            epsilon: 0.01,
        }
    }
}

pub struct PaymentMonitor {
    gateway: Arc<LedgerGateway>,
    store: Arc<RecordStore>,
    config: MonitorConfig,
}

/// Stops the monitor without aborting an in-flight tick.
pub struct MonitorHandle {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl MonitorHandle {
    /// Prevent future ticks and wait for the current one to finish.
    pub async fn stop(self) {
        let _ = self.shutdown.send(true);
        if let Err(err) = self.task.await {
            tracing::error!(error = %err, "payment monitor task failed");
        }
    }
}

impl PaymentMonitor {
    pub fn new(gateway: Arc<LedgerGateway>, store: Arc<RecordStore>, config: MonitorConfig) -> Self {
        Self {
            gateway,
            store,
            config,
        }
    }

    /// Spawn the periodic scan task. Ticks run strictly one at a time: the
    /// loop awaits each tick to completion before asking for the next.
    pub fn start(self: Arc<Self>) -> MonitorHandle {
        let (shutdown, mut stopped) = watch::channel(false);
        let monitor = self;
        let task = tokio::spawn(async move {
            if let Err(err) = monitor.reconcile_status_trail().await {
                tracing::warn!(error = %err, "startup status reconciliation failed");
            }
            let mut interval = tokio::time::interval(monitor.config.interval);
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = stopped.changed() => {
                        if *stopped.borrow() {
                            break;
                        }
                    }
                    _ = interval.tick() => {
                        if let Err(err) = monitor.tick().await {
                            tracing::error!(error = %err, "scan tick failed");
                        }
                    }
                }
            }
            tracing::info!("payment monitor stopped");
        });
        MonitorHandle { shutdown, task }
    }

    /// One scan pass: bounded batch of blocks from checkpoint+1 upward.
    pub async fn tick(&self) -> Result<()> {
        let head = self.gateway.client().head_block().await?;

        let Some(checkpoint) = self.store.last_processed_block()? else {
            // fresh start: skip history rather than scanning the whole chain
            self.store.set_last_processed_block(head)?;
            tracing::info!(height = head, "scan checkpoint initialized at current head");
            return Ok(());
        };
        if head <= checkpoint {
            return Ok(());
        }

        let upper = head.min(checkpoint + self.config.batch_size);
        for height in (checkpoint + 1)..=upper {
            let block = match self.gateway.client().get_block(height).await {
                Ok(Some(block)) => block,
                Ok(None) => {
                    tracing::warn!(height, "block not available yet, stopping batch");
                    break;
                }
                Err(err) => {
                    tracing::warn!(height, error = %err, "block fetch failed, retrying next tick");
                    break;
                }
            };
            if let Err(err) = self.process_block(&block).await {
                // do not advance past the failing block; retry on the next tick
                tracing::warn!(height, error = %err, "block processing failed");
                break;
            }
            self.store.set_last_processed_block(height)?;
        }
        Ok(())
    }

    async fn process_block(&self, block: &Block) -> Result<()> {
        for tx in &block.transactions {
            for operation in &tx.operations {
                let Operation::Transfer {
                    from,
                    to,
                    amount,
                    memo,
                } = operation
                else {
                    continue;
                };
                if to != self.gateway.operator() {
                    continue;
                }
                self.process_transfer(block.height, &tx.transaction_id, from, *amount, memo)
                    .await
                    .with_context(|| format!("transfer {} in block {}", tx.transaction_id, block.height))?;
            }
        }
        Ok(())
    }

    async fn process_transfer(
        &self,
        height: u64,
        tx_id: &str,
        from: &str,
        amount: Amount,
        transfer_memo: &str,
    ) -> Result<()> {
        if self.is_notification_ping(from, amount, transfer_memo) {
            tracing::debug!(tx = tx_id, "skipping self-notification ping");
            return Ok(());
        }
        let Some(number) = memo::extract_invoice_number(transfer_memo) else {
            tracing::debug!(tx = tx_id, memo = transfer_memo, "no invoice reference in memo, ignoring transfer");
            return Ok(());
        };
        let Some(invoice) = self.store.get_invoice_by_number(&number)? else {
            // money observed but not reconcilable; the ledger still holds it
            tracing::info!(number, tx = tx_id, "transfer references an unknown invoice, manual reconciliation required");
            return Ok(());
        };

        let payment = Payment {
            id: uuid::Uuid::new_v4().to_string(),
            invoice_id: invoice.id.clone(),
            payer: from.to_string(),
            amount: amount.as_float(),
            unit: amount.unit,
            block_number: height,
            tx_id: tx_id.to_string(),
            observed_at: Utc::now(),
        };
        if !self.store.record_payment(&payment)? {
            tracing::debug!(tx = tx_id, number = %invoice.number, "payment already recorded");
            return Ok(());
        }
        tracing::info!(number = %invoice.number, %amount, payer = from, "payment recorded");

        self.apply_status(&invoice).await
    }

    async fn apply_status(&self, invoice: &Invoice) -> Result<()> {
        let totals = self.store.paid_totals(&invoice.id)?;
        let next = advance_status(invoice.status, &totals, &invoice.conversion, self.config.epsilon);
        if next == invoice.status {
            return Ok(());
        }
        self.push_status_update(invoice, next, totals.native, totals.stable)
            .await;
        self.store.set_status(&invoice.id, next)?;
        tracing::info!(
            number = %invoice.number,
            from = invoice.status.as_str(),
            to = next.as_str(),
            "invoice status advanced"
        );
        Ok(())
    }

    /// Ledger first, cache regardless: an append failure degrades to a
    /// cache-only update and a warning, never blocks the transition.
    async fn push_status_update(
        &self,
        invoice: &Invoice,
        status: InvoiceStatus,
        paid_native: f64,
        paid_stable: f64,
    ) {
        let update = StatusRecord {
            invoice_id: invoice.id.clone(),
            number: invoice.number.clone(),
            status,
            paid_native,
            paid_stable,
            updated_at: Utc::now(),
        };
        match self.gateway.store_status_update(&update, &invoice.client).await {
            Ok(receipt) => {
                tracing::debug!(tx = %receipt.transaction_id, number = %invoice.number, "status trail extended");
            }
            Err(err) => {
                tracing::warn!(
                    number = %invoice.number,
                    error = %err,
                    "ledger status append failed, falling back to cache-only update"
                );
            }
        }
    }

    /// Invoices transitioned before the status trail existed have no ledger
    /// entries; emit their current status once so the audit trail becomes
    /// complete.
    pub async fn reconcile_status_trail(&self) -> Result<()> {
        for invoice in self.store.list_invoices()? {
            if invoice.status == InvoiceStatus::Pending {
                continue;
            }
            match self.gateway.fetch_status_updates(&invoice.number).await {
                Ok(trail) if trail.is_empty() => {
                    let totals = self.store.paid_totals(&invoice.id)?;
                    tracing::info!(number = %invoice.number, "no status trail on ledger, emitting current status");
                    self.push_status_update(&invoice, invoice.status, totals.native, totals.stable)
                        .await;
                }
                Ok(_) => {}
                Err(err) => {
                    tracing::warn!(number = %invoice.number, error = %err, "status trail lookup failed");
                }
            }
        }
        Ok(())
    }

    /// Self-issued notification pings carry the fixed minimal amount, an
    /// invoice reference and a URL; they alert the client and must never be
    /// counted as payment.
    fn is_notification_ping(&self, from: &str, amount: Amount, transfer_memo: &str) -> bool {
        from == self.gateway.operator()
            && amount == NOTIFICATION_PING
            && memo::extract_invoice_number(transfer_memo).is_some()
            && memo::contains_url(transfer_memo)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::InvoiceService;
    use chainvoice_core::codec::PrivateKey;
    use chainvoice_core::models::{ConversionSnapshot, InvoiceDraft, ItemDraft};
    use ledger::gateway::{GatewayConfig, LedgerGateway};
    use ledger::mock::MockLedger;
    use ledger::WriteKey;

    struct Fixture {
        ledger: Arc<MockLedger>,
        service: InvoiceService,
        monitor: PaymentMonitor,
        store: Arc<RecordStore>,
    }

    fn fixture() -> Fixture {
        let ledger = MockLedger::new();
        let client_key = PrivateKey::generate();
        ledger.register_account("acme", &client_key.public_key().to_hex());

        let gateway = Arc::new(LedgerGateway::new(
            ledger.clone(),
            Some(PrivateKey::generate()),
            Some(WriteKey::generate()),
            GatewayConfig {
                operator: "issuer".to_string(),
                ..GatewayConfig::default()
            },
        ));
        let store = Arc::new(RecordStore::temporary().unwrap());
        let service = InvoiceService::new(gateway.clone(), store.clone());
        let monitor = PaymentMonitor::new(gateway, store.clone(), MonitorConfig::default());
        Fixture {
            ledger,
            service,
            monitor,
            store,
        }
    }

    fn draft() -> InvoiceDraft {
        InvoiceDraft {
            client: "acme".to_string(),
            currency: "EUR".to_string(),
            items: vec![ItemDraft {
                description: "consulting".to_string(),
                quantity: 1.0,
                unit_price: 100.0,
            }],
            tax: 0.0,
            due_at: None,
            conversion: ConversionSnapshot {
                native_amount: 10.0,
                stable_amount: 4.0,
                rate: 0.4,
                sampled_at: Utc::now(),
            },
        }
    }

    /// Run ticks until the checkpoint catches up with the mock head.
    async fn scan_all(fx: &Fixture) {
        // first tick may only initialize the checkpoint
        loop {
            fx.monitor.tick().await.unwrap();
            if fx.store.last_processed_block().unwrap() == Some(fx.ledger.head()) {
                break;
            }
        }
    }

    #[tokio::test]
    async fn fresh_start_skips_history() {
        let fx = fixture();
        fx.ledger
            .push_transfer("acme", "issuer", Amount::native(5.0), "Invoice INV-1");
        fx.monitor.tick().await.unwrap();
        // checkpoint lands on the current head without scanning backwards
        assert_eq!(fx.store.last_processed_block().unwrap(), Some(fx.ledger.head()));
    }

    #[tokio::test]
    async fn partial_then_paid_then_replay() {
        let fx = fixture();
        let invoice = fx.service.create_invoice(draft()).await.unwrap();
        assert_eq!(invoice.number, "INV-1");
        fx.monitor.tick().await.unwrap(); // initialize checkpoint

        fx.ledger
            .push_transfer("acme", "issuer", Amount::native(6.0), "Invoice INV-1");
        scan_all(&fx).await;
        let invoice = fx.store.get_invoice_by_number("INV-1").unwrap().unwrap();
        assert_eq!(invoice.status, InvoiceStatus::Partial);

        // memo conventions are case-insensitive end to end
        fx.ledger
            .push_transfer("acme", "issuer", Amount::native(4.0), "inv-1");
        scan_all(&fx).await;
        let invoice = fx.store.get_invoice_by_number("INV-1").unwrap().unwrap();
        assert_eq!(invoice.status, InvoiceStatus::Paid);
        assert_eq!(fx.store.payments_for_invoice(&invoice.id).unwrap().len(), 2);

        // replay the whole chain: same tx ids, no new rows, status stays paid
        fx.store.reset_checkpoint(0).unwrap();
        scan_all(&fx).await;
        let invoice = fx.store.get_invoice_by_number("INV-1").unwrap().unwrap();
        assert_eq!(invoice.status, InvoiceStatus::Paid);
        assert_eq!(fx.store.payments_for_invoice(&invoice.id).unwrap().len(), 2);
    }

    #[tokio::test]
    async fn status_transitions_are_appended_to_the_ledger() {
        let fx = fixture();
        fx.service.create_invoice(draft()).await.unwrap();
        fx.monitor.tick().await.unwrap();

        fx.ledger
            .push_transfer("acme", "issuer", Amount::stable(4.0), "invoice: INV-1");
        scan_all(&fx).await;

        let trail = fx
            .monitor
            .gateway
            .fetch_status_updates("INV-1")
            .await
            .unwrap();
        assert_eq!(trail.len(), 1);
        assert_eq!(trail[0]["status"], "paid");
    }

    #[tokio::test]
    async fn ledger_append_failure_degrades_to_cache_only() {
        let fx = fixture();
        fx.service.create_invoice(draft()).await.unwrap();
        fx.monitor.tick().await.unwrap();

        fx.ledger
            .push_transfer("acme", "issuer", Amount::native(6.0), "INV-1");
        fx.ledger.fail_broadcasts_with("network unreachable");
        scan_all(&fx).await;

        let invoice = fx.store.get_invoice_by_number("INV-1").unwrap().unwrap();
        assert_eq!(invoice.status, InvoiceStatus::Partial);
        fx.ledger.clear_broadcast_failure();
        assert!(fx
            .monitor
            .gateway
            .fetch_status_updates("INV-1")
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn notification_pings_are_never_payments() {
        let fx = fixture();
        let invoice = fx.service.create_invoice(draft()).await.unwrap();
        fx.monitor.tick().await.unwrap();

        fx.service
            .notify_client(&invoice.id, "https://pay.example.com/INV-1")
            .await
            .unwrap();
        scan_all(&fx).await;

        assert!(fx.store.payments_for_invoice(&invoice.id).unwrap().is_empty());
        let invoice = fx.store.get_invoice_by_number("INV-1").unwrap().unwrap();
        assert_eq!(invoice.status, InvoiceStatus::Pending);
    }

    #[tokio::test]
    async fn unknown_invoices_and_unparseable_memos_are_ignored() {
        let fx = fixture();
        fx.service.create_invoice(draft()).await.unwrap();
        fx.monitor.tick().await.unwrap();

        fx.ledger
            .push_transfer("acme", "issuer", Amount::native(9.0), "Invoice INV-404");
        fx.ledger
            .push_transfer("acme", "issuer", Amount::native(9.0), "thanks for lunch");
        // multibyte memo text must be skipped, not crash the scan
        fx.ledger
            .push_transfer("acme", "issuer", Amount::native(9.0), "paldies aééééé");
        fx.ledger
            .push_transfer("acme", "someone-else", Amount::native(9.0), "Invoice INV-1");
        scan_all(&fx).await;

        let invoice = fx.store.get_invoice_by_number("INV-1").unwrap().unwrap();
        assert_eq!(invoice.status, InvoiceStatus::Pending);
        assert!(fx.store.payments_for_invoice(&invoice.id).unwrap().is_empty());
    }

    #[tokio::test]
    async fn checkpoint_resumes_without_skipping_or_replaying() {
        let fx = fixture();
        fx.service.create_invoice(draft()).await.unwrap();
        fx.monitor.tick().await.unwrap();

        fx.ledger
            .push_transfer("acme", "issuer", Amount::native(2.0), "INV-1");
        scan_all(&fx).await;
        let checkpoint = fx.store.last_processed_block().unwrap().unwrap();
        assert_eq!(checkpoint, fx.ledger.head());

        // a second monitor over the same store picks up where the first left off
        let restarted = PaymentMonitor::new(
            fx.monitor.gateway.clone(),
            fx.store.clone(),
            MonitorConfig::default(),
        );
        fx.ledger
            .push_transfer("acme", "issuer", Amount::native(3.0), "INV-1");
        restarted.tick().await.unwrap();

        let invoice = fx.store.get_invoice_by_number("INV-1").unwrap().unwrap();
        let payments = fx.store.payments_for_invoice(&invoice.id).unwrap();
        assert_eq!(payments.len(), 2);
        let totals = fx.store.paid_totals(&invoice.id).unwrap();
        assert_eq!(totals.native, 5.0);
    }

    #[tokio::test]
    async fn batch_size_bounds_per_tick_work() {
        let fx = fixture();
        let monitor = PaymentMonitor::new(
            fx.monitor.gateway.clone(),
            fx.store.clone(),
            MonitorConfig {
                batch_size: 2,
                ..MonitorConfig::default()
            },
        );
        monitor.tick().await.unwrap(); // checkpoint at head 0
        for _ in 0..5 {
            fx.ledger
                .push_transfer("someone", "issuer", Amount::native(1.0), "no memo match");
        }
        monitor.tick().await.unwrap();
        assert_eq!(fx.store.last_processed_block().unwrap(), Some(2));
        monitor.tick().await.unwrap();
        assert_eq!(fx.store.last_processed_block().unwrap(), Some(4));
        monitor.tick().await.unwrap();
        assert_eq!(fx.store.last_processed_block().unwrap(), Some(5));
    }

    #[tokio::test]
    async fn startup_reconciliation_backfills_the_trail() {
        let fx = fixture();
        let invoice = fx.service.create_invoice(draft()).await.unwrap();
        // simulate a pre-migration invoice: cache says partial, ledger has no trail
        fx.store.set_status(&invoice.id, InvoiceStatus::Partial).unwrap();

        fx.monitor.reconcile_status_trail().await.unwrap();
        let trail = fx
            .monitor
            .gateway
            .fetch_status_updates("INV-1")
            .await
            .unwrap();
        assert_eq!(trail.len(), 1);
        assert_eq!(trail[0]["status"], "partial");

        // a second pass sees the trail and does not duplicate it
        fx.monitor.reconcile_status_trail().await.unwrap();
        assert_eq!(
            fx.monitor
                .gateway
                .fetch_status_updates("INV-1")
                .await
                .unwrap()
                .len(),
            1
        );
    }

    #[tokio::test]
    async fn monitor_stops_cleanly() {
        let fx = fixture();
        let monitor = Arc::new(PaymentMonitor::new(
            fx.monitor.gateway.clone(),
            fx.store.clone(),
            MonitorConfig {
                interval: Duration::from_millis(10),
                ..MonitorConfig::default()
            },
        ));
        let handle = monitor.start();
        tokio::time::sleep(Duration::from_millis(50)).await;
        handle.stop().await;
        // checkpoint was initialized by the running loop
        assert!(fx.store.last_processed_block().unwrap().is_some());
    }
}
