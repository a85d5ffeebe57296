//! Canonical invoice record produced by the normalizer.

use chrono::NaiveDate;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// One invoice, flattened from the analysis service's nested field tree.
///
/// Every field is optional: a value the source did not contain is `None`
/// and serialises as `null`, never as a placeholder string. Amounts use
/// [`Decimal`] so cents survive the round trip exactly.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InvoiceRecord {
    pub supplier_name: Option<String>,
    pub supplier_address: Option<String>,
    pub purchase_order: Option<String>,
    pub invoice_number: Option<String>,
    /// Invoice date, serialised as `YYYY-MM-DD`.
    pub date: Option<NaiveDate>,
    pub subtotal: Option<Decimal>,
    /// Federal goods and services tax (TPS/GST slot).
    pub tps: Option<Decimal>,
    /// Provincial sales tax (TVQ/QST slot).
    pub tvq: Option<Decimal>,
    pub total: Option<Decimal>,
    /// Line items in the order they appear on the invoice.
    pub lines: Vec<LineItem>,
}

/// One billed line of an invoice.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LineItem {
    pub quantity: Option<Decimal>,
    pub product_code: Option<String>,
    pub description: Option<String>,
    pub unit_price: Option<Decimal>,
    pub amount: Option<Decimal>,
}

/// Envelope used in reformatted result files: `{ "invoice": { … } }`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvoiceEnvelope {
    pub invoice: InvoiceRecord,
}

impl From<InvoiceRecord> for InvoiceEnvelope {
    fn from(invoice: InvoiceRecord) -> Self {
        Self { invoice }
    }
}
