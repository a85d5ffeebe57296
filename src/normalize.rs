//! Result normalizer: nested field-extraction JSON → flat [`InvoiceRecord`].
//!
//! The prebuilt invoice analyzer returns every field wrapped in a typed
//! envelope, e.g.
//!
//! ```json
//! { "fields": { "InvoiceTotal": { "valueCurrency": { "amount": 114.98 } } } }
//! ```
//!
//! Normalization is a set of path lookups over that tree. A lookup never
//! fails: any missing step yields `None`, so a partially recognised invoice
//! still produces a record with the fields that were found.
//!
//! The same shape exists in two spellings. [`Dialect::Rest`] is what the
//! REST API returns; [`Dialect::Sdk`] is the PascalCase form written by the
//! .NET SDK serializer (`Fields`, `ValueList`, `ValueDictionary`, …), which
//! is what older result files on disk contain.

use crate::invoice::{InvoiceRecord, LineItem};
use chrono::NaiveDate;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::str::FromStr;

/// Property names used by one spelling of the analysis result.
#[derive(Debug)]
struct Keys {
    fields: &'static str,
    string: &'static str,
    currency: &'static str,
    amount: &'static str,
    list: &'static str,
    dictionary: &'static str,
    number: &'static str,
    date: &'static str,
    content: &'static str,
}

const REST_KEYS: Keys = Keys {
    fields: "fields",
    string: "valueString",
    currency: "valueCurrency",
    amount: "amount",
    list: "valueArray",
    dictionary: "valueObject",
    number: "valueNumber",
    date: "valueDate",
    content: "content",
};

const SDK_KEYS: Keys = Keys {
    fields: "Fields",
    string: "ValueString",
    currency: "ValueCurrency",
    amount: "Amount",
    list: "ValueList",
    dictionary: "ValueDictionary",
    number: "ValueDouble",
    date: "ValueDate",
    content: "Content",
};

/// Spelling of the nested analysis JSON.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Dialect {
    /// camelCase, as returned by the REST API. (default)
    #[default]
    Rest,
    /// PascalCase, as written by the .NET SDK serializer.
    Sdk,
}

impl Dialect {
    fn keys(self) -> &'static Keys {
        match self {
            Dialect::Rest => &REST_KEYS,
            Dialect::Sdk => &SDK_KEYS,
        }
    }

    /// Guess the dialect from the first document entry found in `value`.
    ///
    /// Falls back to [`Dialect::Rest`] when neither `fields` nor `Fields`
    /// appears anywhere.
    pub fn detect(value: &Value) -> Dialect {
        let mut stack = vec![value];
        while let Some(node) = stack.pop() {
            match node {
                Value::Object(map) => {
                    if map.contains_key(SDK_KEYS.fields) {
                        return Dialect::Sdk;
                    }
                    if map.contains_key(REST_KEYS.fields) {
                        return Dialect::Rest;
                    }
                    stack.extend(map.values());
                }
                Value::Array(items) => stack.extend(items.iter().rev()),
                _ => {}
            }
        }
        Dialect::Rest
    }
}

/// Label needles that assign generic tax lines to the two named tax slots.
///
/// The analyzer reports taxes as an unlabeled list; each entry's printed
/// label (`content`) is matched case-insensitively against these needles.
/// The defaults (`"P"` → TPS, `"V"` → TVQ) are a single-letter heuristic
/// tuned for Québec invoices: "TPS 5%" and "TVQ 9,975%" land in the right
/// slots, but e.g. "PST" also matches the TPS needle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaxSlotRules {
    pub tps_needle: String,
    pub tvq_needle: String,
}

impl Default for TaxSlotRules {
    fn default() -> Self {
        Self {
            tps_needle: "P".to_string(),
            tvq_needle: "V".to_string(),
        }
    }
}

/// Walk `path` property by property starting at `value`.
///
/// Returns `None` as soon as a step is missing or the current node is not
/// an object. An explicit JSON `null` at the end is returned as-is; the
/// typed accessors below treat it as absent.
pub fn lookup<'a>(value: &'a Value, path: &[&str]) -> Option<&'a Value> {
    path.iter()
        .try_fold(value, |node, key| node.as_object()?.get(*key))
}

/// [`lookup`] with a dotted path, e.g. `"fields.InvoiceTotal.valueCurrency.amount"`.
pub fn lookup_dotted<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    if path.is_empty() {
        return Some(value);
    }
    path.split('.')
        .try_fold(value, |node, key| node.as_object()?.get(key))
}

fn as_text(value: Option<&Value>) -> Option<String> {
    value.and_then(Value::as_str).map(str::to_string)
}

fn as_decimal(value: Option<&Value>) -> Option<Decimal> {
    match value? {
        Value::Number(n) => {
            let text = n.to_string();
            Decimal::from_str(&text)
                .or_else(|_| Decimal::from_scientific(&text))
                .ok()
        }
        Value::String(s) => Decimal::from_str(s.trim()).ok(),
        _ => None,
    }
}

fn as_date(value: Option<&Value>) -> Option<NaiveDate> {
    let text = value?.as_str()?;
    // Some payloads carry a full timestamp; the date is the first 10 chars.
    let day = text.get(..10).unwrap_or(text);
    NaiveDate::parse_from_str(day, "%Y-%m-%d").ok()
}

fn field_value<'a>(fields: Option<&'a Value>, name: &str, rest: &[&str]) -> Option<&'a Value> {
    lookup(fields?.as_object()?.get(name)?, rest)
}

fn contains_ignore_case(haystack: &str, needle: &str) -> bool {
    haystack.to_lowercase().contains(&needle.to_lowercase())
}

/// Maps analysis results onto [`InvoiceRecord`]s.
#[derive(Debug, Clone, Default)]
pub struct Normalizer {
    dialect: Dialect,
    tax_rules: TaxSlotRules,
}

impl Normalizer {
    pub fn new(dialect: Dialect) -> Self {
        Self {
            dialect,
            tax_rules: TaxSlotRules::default(),
        }
    }

    pub fn with_tax_rules(mut self, rules: TaxSlotRules) -> Self {
        self.tax_rules = rules;
        self
    }

    pub fn dialect(&self) -> Dialect {
        self.dialect
    }

    /// Normalize every document entry found in `value`.
    ///
    /// Accepted shapes:
    /// * a single entry `{ "fields": { … } }`
    /// * an array of entries (the `documents` array of one analysis)
    /// * a result file `{ "data": [ [entry, …], … ] }`, one inner array per
    ///   analysed source file
    /// * a batch report, whose `data` items wrap the entries in `result`;
    ///   failed items (an `error` and no `result`) are skipped
    ///
    /// Anything else yields an empty vector.
    pub fn normalize(&self, value: &Value) -> Vec<InvoiceRecord> {
        let top: &[Value] = match value {
            Value::Object(map) => match map.get("data") {
                Some(Value::Array(items)) => items,
                _ => std::slice::from_ref(value),
            },
            Value::Array(items) => items,
            _ => &[],
        };

        let mut records = Vec::new();
        for item in top {
            let item = match item.get("result") {
                Some(result) => result,
                None if item.get("error").is_some() => continue,
                None => item,
            };
            match item {
                Value::Array(entries) => records.extend(
                    entries
                        .iter()
                        .filter(|e| e.is_object())
                        .map(|e| self.normalize_document(e)),
                ),
                Value::Object(_) => records.push(self.normalize_document(item)),
                _ => {}
            }
        }
        records
    }

    /// Normalize one detected invoice entry.
    pub fn normalize_document(&self, entry: &Value) -> InvoiceRecord {
        let k = self.dialect.keys();
        let fields = lookup(entry, &[k.fields]);
        let field = |name: &str, rest: &[&str]| field_value(fields, name, rest);

        let taxes: &[Value] = field("TaxDetails", &[k.list])
            .and_then(Value::as_array)
            .map(Vec::as_slice)
            .unwrap_or(&[]);

        let lines = field("Items", &[k.list])
            .and_then(Value::as_array)
            .map(|items| items.iter().map(|item| self.line_item(item)).collect())
            .unwrap_or_default();

        InvoiceRecord {
            supplier_name: as_text(field("VendorName", &[k.string])),
            supplier_address: as_text(field("VendorAddress", &[k.content])),
            purchase_order: as_text(field("PurchaseOrder", &[k.string])),
            invoice_number: as_text(field("InvoiceId", &[k.string])),
            date: as_date(field("InvoiceDate", &[k.date])),
            subtotal: as_decimal(field("SubTotal", &[k.currency, k.amount])),
            tps: self.tax_amount(taxes, &self.tax_rules.tps_needle),
            tvq: self.tax_amount(taxes, &self.tax_rules.tvq_needle),
            total: as_decimal(field("InvoiceTotal", &[k.currency, k.amount])),
            lines,
        }
    }

    /// Amount of the first tax line whose label contains `needle`.
    fn tax_amount(&self, taxes: &[Value], needle: &str) -> Option<Decimal> {
        let k = self.dialect.keys();
        let entry = taxes.iter().find(|t| {
            lookup(t, &[k.content])
                .and_then(Value::as_str)
                .is_some_and(|label| contains_ignore_case(label, needle))
        })?;
        as_decimal(lookup(entry, &[k.dictionary, "Amount", k.currency, k.amount]))
    }

    fn line_item(&self, item: &Value) -> LineItem {
        let k = self.dialect.keys();
        let d = k.dictionary;
        LineItem {
            quantity: as_decimal(lookup(item, &[d, "Quantity", k.number])),
            product_code: as_text(lookup(item, &[d, "ProductCode", k.string])),
            description: as_text(lookup(item, &[d, "Description", k.string])),
            unit_price: as_decimal(lookup(item, &[d, "UnitPrice", k.currency, k.amount])),
            amount: as_decimal(lookup(item, &[d, "Amount", k.currency, k.amount])),
        }
    }
}
