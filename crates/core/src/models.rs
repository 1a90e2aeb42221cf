use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InvoiceStatus {
    Pending,
    Partial,
    Paid,
}

impl InvoiceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            InvoiceStatus::Pending => "pending",
            InvoiceStatus::Partial => "partial",
            InvoiceStatus::Paid => "paid",
        }
    }
}

/// Settlement unit on the ledger: the volatile native asset or its
/// pegged-value counterpart. Either is acceptable for settling an invoice.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Unit {
    Native,
    Stable,
}

impl std::fmt::Display for Unit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Unit::Native => write!(f, "NATIVE"),
            Unit::Stable => write!(f, "STABLE"),
        }
    }
}

/// Ledger-native conversion sampled at invoice-creation time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversionSnapshot {
    pub native_amount: f64,
    pub stable_amount: f64,
    pub rate: f64,
    pub sampled_at: DateTime<Utc>,
}

/// Cache row for an invoice. Everything here is derived: the authoritative
/// record is the encrypted ledger entry referenced by `tx_ref`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Invoice {
    pub id: String,
    pub number: String,
    pub client: String,
    pub subtotal: f64,
    pub tax: f64,
    pub total: f64,
    pub currency: String,
    pub conversion: ConversionSnapshot,
    pub status: InvoiceStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub due_at: Option<DateTime<Utc>>,
    pub tx_ref: Option<String>,
    pub content_locator: Option<String>,
    pub ciphertext: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LineItem {
    pub id: String,
    pub invoice_id: String,
    pub description: String,
    pub quantity: f64,
    pub unit_price: f64,
    pub total: f64,
}

/// Payment observed on the ledger. `(tx_id, invoice_id)` is the natural key;
/// the store enforces at-most-once recording on it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Payment {
    pub id: String,
    pub invoice_id: String,
    pub payer: String,
    pub amount: f64,
    pub unit: Unit,
    pub block_number: u64,
    pub tx_id: String,
    pub observed_at: DateTime<Utc>,
}

/// Cumulative paid amounts per unit, recomputed from all payment rows.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct PaidTotals {
    pub native: f64,
    pub stable: f64,
}

/// The structured record encrypted into the ledger entry. Self-contained so
/// the cache can be rebuilt from the ciphertext alone.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InvoiceDocument {
    pub id: String,
    pub number: String,
    pub client: String,
    pub items: Vec<LineItem>,
    pub subtotal: f64,
    pub tax: f64,
    pub total: f64,
    pub currency: String,
    pub conversion: ConversionSnapshot,
    pub due_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl InvoiceDocument {
    pub fn new(invoice: &Invoice, items: &[LineItem]) -> Self {
        Self {
            id: invoice.id.clone(),
            number: invoice.number.clone(),
            client: invoice.client.clone(),
            items: items.to_vec(),
            subtotal: invoice.subtotal,
            tax: invoice.tax,
            total: invoice.total,
            currency: invoice.currency.clone(),
            conversion: invoice.conversion.clone(),
            due_at: invoice.due_at,
            created_at: invoice.created_at,
        }
    }

    /// Rebuild cache rows from a decrypted document. Payment state is not
    /// part of the document; the rebuilt row starts at `pending` and the
    /// monitor's reconciliation catches it up.
    pub fn into_cache_rows(self) -> (Invoice, Vec<LineItem>) {
        let invoice = Invoice {
            id: self.id,
            number: self.number,
            client: self.client,
            subtotal: self.subtotal,
            tax: self.tax,
            total: self.total,
            currency: self.currency,
            conversion: self.conversion,
            status: InvoiceStatus::Pending,
            created_at: self.created_at,
            updated_at: self.created_at,
            due_at: self.due_at,
            tx_ref: None,
            content_locator: None,
            ciphertext: None,
        };
        (invoice, self.items)
    }
}

/// Status-transition record appended to the ledger so it accumulates an
/// auditable history of transitions, with the totals that justified it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusRecord {
    pub invoice_id: String,
    pub number: String,
    pub status: InvoiceStatus,
    pub paid_native: f64,
    pub paid_stable: f64,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ItemDraft {
    pub description: String,
    pub quantity: f64,
    pub unit_price: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvoiceDraft {
    pub client: String,
    pub currency: String,
    pub items: Vec<ItemDraft>,
    pub tax: f64,
    pub due_at: Option<DateTime<Utc>>,
    pub conversion: ConversionSnapshot,
}

pub fn validate_draft(draft: &InvoiceDraft) -> Result<(), Vec<String>> {
    let mut errs = Vec::new();

    if draft.client.trim().is_empty() {
        errs.push("client handle is mandatory".to_string());
    }
    if draft.currency.len() != 3 {
        errs.push("currency code must be 3 characters (ISO 4217)".to_string());
    }
    if draft.items.is_empty() {
        errs.push("invoice must carry at least one line item".to_string());
    }
    for (i, item) in draft.items.iter().enumerate() {
        if item.description.trim().is_empty() {
            errs.push(format!("line item {}: description is mandatory", i + 1));
        }
        if item.quantity <= 0.0 {
            errs.push(format!("line item {}: quantity must be positive", i + 1));
        }
        if item.unit_price <= 0.0 {
            errs.push(format!("line item {}: unit price must be positive", i + 1));
        }
    }
    if draft.tax < 0.0 {
        errs.push("tax must not be negative".to_string());
    }
    if draft.conversion.rate <= 0.0 {
        errs.push("conversion rate must be positive".to_string());
    }

    if errs.is_empty() {
        Ok(())
    } else {
        Err(errs)
    }
}

impl InvoiceDraft {
    /// Materialize the draft. total = subtotal + tax; subtotal is the sum of
    /// line-item totals; each line-item total is quantity x unit price.
    pub fn build(self, id: String, number: String, now: DateTime<Utc>) -> (Invoice, Vec<LineItem>) {
        let items: Vec<LineItem> = self
            .items
            .into_iter()
            .map(|item| LineItem {
                id: uuid::Uuid::new_v4().to_string(),
                invoice_id: id.clone(),
                total: item.quantity * item.unit_price,
                description: item.description,
                quantity: item.quantity,
                unit_price: item.unit_price,
            })
            .collect();
        let subtotal: f64 = items.iter().map(|i| i.total).sum();
        let invoice = Invoice {
            id,
            number,
            client: self.client,
            subtotal,
            tax: self.tax,
            total: subtotal + self.tax,
            currency: self.currency,
            conversion: self.conversion,
            status: InvoiceStatus::Pending,
            created_at: now,
            updated_at: now,
            due_at: self.due_at,
            tx_ref: None,
            content_locator: None,
            ciphertext: None,
        };
        (invoice, items)
    }
}

/// Advance the payment state machine. Transitions are monotonic forward only:
/// `pending -> partial -> paid`, never backward. An invoice counts as fully
/// paid when the cumulative amount in either unit is within `epsilon` of the
/// expected amount for that unit; the threshold is strict so that exactly
/// `expected - epsilon` does not settle.
pub fn advance_status(
    current: InvoiceStatus,
    paid: &PaidTotals,
    expected: &ConversionSnapshot,
    epsilon: f64,
) -> InvoiceStatus {
    if current == InvoiceStatus::Paid {
        return InvoiceStatus::Paid;
    }
    let native_settles = expected.native_amount > 0.0 && paid.native > expected.native_amount - epsilon;
    let stable_settles = expected.stable_amount > 0.0 && paid.stable > expected.stable_amount - epsilon;
    if native_settles || stable_settles {
        InvoiceStatus::Paid
    } else if paid.native > 0.0 || paid.stable > 0.0 {
        InvoiceStatus::Partial
    } else {
        current
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot(native: f64, stable: f64) -> ConversionSnapshot {
        ConversionSnapshot {
            native_amount: native,
            stable_amount: stable,
            rate: stable / native,
            sampled_at: Utc::now(),
        }
    }

    fn draft() -> InvoiceDraft {
        InvoiceDraft {
            client: "acme".to_string(),
            currency: "EUR".to_string(),
            items: vec![
                ItemDraft {
                    description: "consulting".to_string(),
                    quantity: 2.0,
                    unit_price: 40.0,
                },
                ItemDraft {
                    description: "hosting".to_string(),
                    quantity: 1.0,
                    unit_price: 20.0,
                },
            ],
            tax: 21.0,
            due_at: None,
            conversion: snapshot(10.0, 4.0),
        }
    }

    #[test]
    fn build_computes_totals() {
        let (invoice, items) = draft().build("id-1".into(), "INV-1".into(), Utc::now());
        assert_eq!(items[0].total, 80.0);
        assert_eq!(items[1].total, 20.0);
        assert_eq!(invoice.subtotal, 100.0);
        assert_eq!(invoice.total, 121.0);
        assert_eq!(invoice.status, InvoiceStatus::Pending);
        assert!(items.iter().all(|i| i.invoice_id == "id-1"));
    }

    #[test]
    fn validation_accumulates_errors() {
        let mut d = draft();
        d.client = "  ".into();
        d.items[0].quantity = 0.0;
        d.items[1].unit_price = -5.0;
        let errs = validate_draft(&d).unwrap_err();
        assert_eq!(errs.len(), 3);
    }

    #[test]
    fn partial_then_paid() {
        let expected = snapshot(10.0, 4.0);
        let paid = PaidTotals { native: 6.0, stable: 0.0 };
        let status = advance_status(InvoiceStatus::Pending, &paid, &expected, 0.01);
        assert_eq!(status, InvoiceStatus::Partial);

        let paid = PaidTotals { native: 10.0, stable: 0.0 };
        let status = advance_status(status, &paid, &expected, 0.01);
        assert_eq!(status, InvoiceStatus::Paid);
    }

    #[test]
    fn either_unit_settles() {
        let expected = snapshot(10.0, 4.0);
        let paid = PaidTotals { native: 0.0, stable: 4.0 };
        assert_eq!(
            advance_status(InvoiceStatus::Pending, &paid, &expected, 0.01),
            InvoiceStatus::Paid
        );
    }

    #[test]
    fn tolerance_boundary_is_strict() {
        let expected = snapshot(10.0, 4.0);
        let epsilon = 0.01;

        let at_boundary = PaidTotals { native: 10.0 - epsilon, stable: 0.0 };
        assert_eq!(
            advance_status(InvoiceStatus::Partial, &at_boundary, &expected, epsilon),
            InvoiceStatus::Partial
        );

        let inside = PaidTotals { native: 10.0 - epsilon / 2.0, stable: 0.0 };
        assert_eq!(
            advance_status(InvoiceStatus::Partial, &inside, &expected, epsilon),
            InvoiceStatus::Paid
        );
    }

    #[test]
    fn status_never_regresses() {
        let expected = snapshot(10.0, 4.0);
        let none = PaidTotals::default();
        assert_eq!(
            advance_status(InvoiceStatus::Paid, &none, &expected, 0.01),
            InvoiceStatus::Paid
        );
        assert_eq!(
            advance_status(InvoiceStatus::Partial, &none, &expected, 0.01),
            InvoiceStatus::Partial
        );
    }

    #[test]
    fn document_round_trips_into_cache_rows() {
        let (invoice, items) = draft().build("id-9".into(), "INV-9".into(), Utc::now());
        let doc = InvoiceDocument::new(&invoice, &items);
        let (rebuilt, rebuilt_items) = doc.into_cache_rows();
        assert_eq!(rebuilt.number, "INV-9");
        assert_eq!(rebuilt.total, invoice.total);
        assert_eq!(rebuilt_items, items);
        assert_eq!(rebuilt.status, InvoiceStatus::Pending);
        assert!(rebuilt.tx_ref.is_none());
    }
}
