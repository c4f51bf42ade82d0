//! Domain types for the ledger engine.
//!
//! Enums are stored as lowercase TEXT (via `ToSql`/`FromSql`) and serialize
//! to the same strings in the snapshot document, so the database, the backup
//! format and the API all agree on one spelling.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, ValueRef};
use rusqlite::Row;
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Enums
// ---------------------------------------------------------------------------

/// Transaction kind. Direction of the cash/stock/balance effect is encoded
/// here; stored amounts are always positive magnitudes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TransactionKind {
    Sale,
    Purchase,
    Expense,
    Return,
    Adjustment,
    ShiftOpen,
    ShiftClose,
    Capital,
    Withdrawal,
    Settlement,
}

impl TransactionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionKind::Sale => "sale",
            TransactionKind::Purchase => "purchase",
            TransactionKind::Expense => "expense",
            TransactionKind::Return => "return",
            TransactionKind::Adjustment => "adjustment",
            TransactionKind::ShiftOpen => "shift-open",
            TransactionKind::ShiftClose => "shift-close",
            TransactionKind::Capital => "capital",
            TransactionKind::Withdrawal => "withdrawal",
            TransactionKind::Settlement => "settlement",
        }
    }

    /// Reference-id prefix for non-sale transactions (sales use the bare
    /// invoice number).
    pub fn ref_prefix(&self) -> &'static str {
        match self {
            TransactionKind::Sale => "",
            TransactionKind::Purchase => "PUR",
            TransactionKind::Expense => "EXP",
            TransactionKind::Return => "RET",
            TransactionKind::Adjustment => "ADJ",
            TransactionKind::ShiftOpen | TransactionKind::ShiftClose => "SHF",
            TransactionKind::Capital => "CAP",
            TransactionKind::Withdrawal => "WDR",
            TransactionKind::Settlement => "SET",
        }
    }
}

impl FromStr for TransactionKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "sale" => Ok(TransactionKind::Sale),
            "purchase" => Ok(TransactionKind::Purchase),
            "expense" => Ok(TransactionKind::Expense),
            "return" => Ok(TransactionKind::Return),
            "adjustment" => Ok(TransactionKind::Adjustment),
            "shift-open" => Ok(TransactionKind::ShiftOpen),
            "shift-close" => Ok(TransactionKind::ShiftClose),
            "capital" => Ok(TransactionKind::Capital),
            "withdrawal" => Ok(TransactionKind::Withdrawal),
            "settlement" => Ok(TransactionKind::Settlement),
            other => Err(format!("unknown transaction kind: {other}")),
        }
    }
}

impl fmt::Display for TransactionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Payment method. Only `Deferred` is excluded from the treasury fold;
/// `Wallet` and `Instapay` count as received money but are not drawer cash
/// for shift reconciliation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PaymentMethod {
    Cash,
    Wallet,
    Instapay,
    Deferred,
}

impl PaymentMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentMethod::Cash => "cash",
            PaymentMethod::Wallet => "wallet",
            PaymentMethod::Instapay => "instapay",
            PaymentMethod::Deferred => "deferred",
        }
    }

    pub fn is_deferred(&self) -> bool {
        matches!(self, PaymentMethod::Deferred)
    }
}

impl FromStr for PaymentMethod {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "cash" => Ok(PaymentMethod::Cash),
            "wallet" => Ok(PaymentMethod::Wallet),
            "instapay" => Ok(PaymentMethod::Instapay),
            "deferred" => Ok(PaymentMethod::Deferred),
            other => Err(format!("unknown payment method: {other}")),
        }
    }
}

impl fmt::Display for PaymentMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Approval status of a transaction. `Completed` and `Rejected` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransactionStatus {
    Pending,
    Completed,
    Rejected,
}

impl TransactionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionStatus::Pending => "pending",
            TransactionStatus::Completed => "completed",
            TransactionStatus::Rejected => "rejected",
        }
    }
}

impl FromStr for TransactionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(TransactionStatus::Pending),
            "completed" => Ok(TransactionStatus::Completed),
            "rejected" => Ok(TransactionStatus::Rejected),
            other => Err(format!("unknown transaction status: {other}")),
        }
    }
}

/// Which ledger a `related_id` points into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PartyKind {
    Customer,
    Supplier,
}

impl PartyKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            PartyKind::Customer => "customer",
            PartyKind::Supplier => "supplier",
        }
    }
}

impl FromStr for PartyKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "customer" => Ok(PartyKind::Customer),
            "supplier" => Ok(PartyKind::Supplier),
            other => Err(format!("unknown party kind: {other}")),
        }
    }
}

/// Customer trade type: consumers pay immediately, businesses may defer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CustomerType {
    Consumer,
    Business,
}

impl CustomerType {
    pub fn as_str(&self) -> &'static str {
        match self {
            CustomerType::Consumer => "consumer",
            CustomerType::Business => "business",
        }
    }
}

impl FromStr for CustomerType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "consumer" => Ok(CustomerType::Consumer),
            "business" => Ok(CustomerType::Business),
            other => Err(format!("unknown customer type: {other}")),
        }
    }
}

macro_rules! text_sql {
    ($ty:ty) => {
        impl ToSql for $ty {
            fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
                Ok(ToSqlOutput::from(self.as_str()))
            }
        }

        impl FromSql for $ty {
            fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
                let s = value.as_str()?;
                s.parse::<$ty>()
                    .map_err(|e| FromSqlError::Other(e.into()))
            }
        }
    };
}

text_sql!(TransactionKind);
text_sql!(PaymentMethod);
text_sql!(TransactionStatus);
text_sql!(PartyKind);
text_sql!(CustomerType);

// ---------------------------------------------------------------------------
// Cart lines and totals
// ---------------------------------------------------------------------------

/// A snapshot of one cart line at transaction time. Prices are frozen here;
/// later margin/COGS recomputation must never re-read live product state.
///
/// Adjustment transactions reuse this shape with a single line whose
/// `quantity` is the signed diff.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CartLine {
    pub product_id: i64,
    pub name: String,
    pub quantity: f64,
    pub cost_price: f64,
    pub sell_price: f64,
    /// Percentage discount on this line, 0..=100.
    #[serde(default)]
    pub discount: f64,
}

impl CartLine {
    /// Selling price after the line discount.
    pub fn final_price(&self) -> f64 {
        self.sell_price * (1.0 - self.discount / 100.0)
    }

    pub fn line_total(&self) -> f64 {
        self.final_price() * self.quantity
    }
}

/// Cart money breakdown: subtotal, discount, tax on the net, grand total.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CartTotals {
    pub subtotal: f64,
    pub discount: f64,
    pub tax: f64,
    pub total: f64,
}

/// Compute cart totals the way the POS screen does: per-line percentage
/// discounts first, then tax on the discounted net.
pub fn cart_totals(items: &[CartLine], tax_rate: f64) -> CartTotals {
    let subtotal: f64 = items.iter().map(|i| i.sell_price * i.quantity).sum();
    let discount: f64 = items
        .iter()
        .map(|i| i.sell_price * i.quantity * (i.discount / 100.0))
        .sum();
    let net = subtotal - discount;
    let tax = net * (tax_rate / 100.0);
    CartTotals {
        subtotal,
        discount,
        tax,
        total: net + tax,
    }
}

// ---------------------------------------------------------------------------
// Entities
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Product {
    pub id: i64,
    pub sku: String,
    pub name: String,
    pub category: String,
    pub quantity: f64,
    /// Fixed starting point for replay; never changed after creation.
    pub opening_quantity: f64,
    pub cost_price: f64,
    pub sell_price: f64,
    pub unit: String,
    pub min_stock_alert: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Customer {
    pub id: i64,
    pub name: String,
    pub phone: String,
    #[serde(rename = "type")]
    pub customer_type: CustomerType,
    /// Signed ledger value: negative = customer owes us, positive = we owe
    /// the customer (overpayment/credit).
    pub balance: f64,
    pub opening_balance: f64,
    /// Maximum allowed debt for business customers; 0 = unlimited.
    pub credit_limit: f64,
}

impl Customer {
    /// Current debt magnitude (zero when the balance is non-negative).
    pub fn debt(&self) -> f64 {
        if self.balance < 0.0 {
            -self.balance
        } else {
            0.0
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Supplier {
    pub id: i64,
    pub name: String,
    pub phone: String,
    /// Positive = we owe the supplier.
    pub balance: f64,
    pub opening_balance: f64,
}

/// Immutable, append-only transaction record.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Transaction {
    pub id: String,
    pub kind: TransactionKind,
    pub date: String,
    /// Always a positive magnitude; direction is encoded by `kind`.
    pub amount: f64,
    pub payment_method: PaymentMethod,
    pub description: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub related_party: Option<PartyKind>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub related_id: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub items: Option<Vec<CartLine>>,
    pub status: TransactionStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub due_date: Option<String>,
    #[serde(default)]
    pub is_direct_sale: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub shift_id: Option<i64>,
    /// For `return` transactions: the id of the transaction being reversed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reverses: Option<String>,
}

/// Column list matching [`Transaction::from_row`]. Keep the two in sync.
pub const TX_COLUMNS: &str = "id, kind, date, amount, payment_method, description, category, \
     related_party, related_id, items, status, due_date, is_direct_sale, shift_id, reverses";

impl Transaction {
    /// Map a row selected with [`TX_COLUMNS`].
    pub fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        let items_json: Option<String> = row.get(9)?;
        let items = match items_json {
            Some(raw) => serde_json::from_str(&raw)
                .map_err(|e| rusqlite::Error::FromSqlConversionFailure(9, rusqlite::types::Type::Text, e.into()))?,
            None => None,
        };
        Ok(Transaction {
            id: row.get(0)?,
            kind: row.get(1)?,
            date: row.get(2)?,
            amount: row.get(3)?,
            payment_method: row.get(4)?,
            description: row.get(5)?,
            category: row.get(6)?,
            related_party: row.get(7)?,
            related_id: row.get(8)?,
            items,
            status: row.get(10)?,
            due_date: row.get(11)?,
            is_direct_sale: row.get::<_, i64>(12)? != 0,
            shift_id: row.get(13)?,
            reverses: row.get(14)?,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ShiftStatus {
    Open,
    Closed,
}

impl ShiftStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ShiftStatus::Open => "open",
            ShiftStatus::Closed => "closed",
        }
    }
}

impl FromStr for ShiftStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "open" => Ok(ShiftStatus::Open),
            "closed" => Ok(ShiftStatus::Closed),
            other => Err(format!("unknown shift status: {other}")),
        }
    }
}

text_sql!(ShiftStatus);

/// A cashier session. At most one shift is open at any time (enforced by a
/// partial unique index on the shifts table).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Shift {
    pub id: i64,
    pub user_id: i64,
    pub user_name: String,
    pub start_time: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end_time: Option<String>,
    pub start_cash: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end_cash: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expected_cash: Option<f64>,
    pub total_sales: f64,
    pub sales_by_method: BTreeMap<PaymentMethod, f64>,
    pub status: ShiftStatus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QuotationStatus {
    Pending,
    Converted,
}

impl QuotationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            QuotationStatus::Pending => "pending",
            QuotationStatus::Converted => "converted",
        }
    }
}

impl FromStr for QuotationStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(QuotationStatus::Pending),
            "converted" => Ok(QuotationStatus::Converted),
            other => Err(format!("unknown quotation status: {other}")),
        }
    }
}

text_sql!(QuotationStatus);

/// A priced offer that may later become a sale. Never deleted; conversion
/// flips the status and writes a sale transaction.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Quotation {
    pub id: String,
    pub date: String,
    pub customer_id: i64,
    pub customer_name: String,
    pub items: Vec<CartLine>,
    pub total_amount: f64,
    pub status: QuotationStatus,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct User {
    pub id: i64,
    pub username: String,
    pub role: String,
    pub name: String,
}

/// Append-only audit trail entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActivityLogEntry {
    pub id: i64,
    pub date: String,
    pub user_id: i64,
    pub user_name: String,
    pub action: String,
    pub details: String,
}

/// Operator identity stamped on mutating operations.
#[derive(Debug, Clone)]
pub struct Operator {
    pub id: i64,
    pub name: String,
}

impl Operator {
    pub fn new(id: i64, name: impl Into<String>) -> Self {
        Operator {
            id,
            name: name.into(),
        }
    }
}

/// Store-wide settings persisted in the key/value settings table.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoreSettings {
    pub company_name: String,
    pub company_phone: String,
    pub company_address: String,
    pub next_invoice_number: i64,
    pub next_reference_number: i64,
    pub opening_balance: f64,
    /// VAT percentage applied on the discounted net.
    pub tax_rate: f64,
    /// Strict mode: block sales that would push stock negative.
    pub prevent_negative_stock: bool,
    /// Expenses above this amount enter the approval workflow; 0 disables.
    pub expense_approval_threshold: f64,
    pub invoice_terms: String,
}

impl Default for StoreSettings {
    fn default() -> Self {
        StoreSettings {
            company_name: String::new(),
            company_phone: String::new(),
            company_address: String::new(),
            next_invoice_number: 1001,
            next_reference_number: 1,
            opening_balance: 0.0,
            tax_rate: 0.0,
            prevent_negative_stock: false,
            expense_approval_threshold: 0.0,
            invoice_terms: String::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn line(sell: f64, qty: f64, discount: f64) -> CartLine {
        CartLine {
            product_id: 1,
            name: "item".into(),
            quantity: qty,
            cost_price: 10.0,
            sell_price: sell,
            discount,
        }
    }

    #[test]
    fn test_cart_totals_no_tax_no_discount() {
        let totals = cart_totals(&[line(65.0, 1.0, 0.0)], 0.0);
        assert_eq!(totals.subtotal, 65.0);
        assert_eq!(totals.total, 65.0);
    }

    #[test]
    fn test_cart_totals_discount_then_tax() {
        // 2 × 100 = 200, 10% line discount = 20, net 180, 14% tax = 25.2
        let totals = cart_totals(&[line(100.0, 2.0, 10.0)], 14.0);
        assert!((totals.discount - 20.0).abs() < 1e-9);
        assert!((totals.tax - 25.2).abs() < 1e-9);
        assert!((totals.total - 205.2).abs() < 1e-9);
    }

    #[test]
    fn test_final_price_applies_discount() {
        let l = line(50.0, 1.0, 20.0);
        assert!((l.final_price() - 40.0).abs() < 1e-9);
    }

    #[test]
    fn test_kind_round_trips_through_text() {
        for kind in [
            TransactionKind::Sale,
            TransactionKind::ShiftOpen,
            TransactionKind::Settlement,
        ] {
            assert_eq!(kind.as_str().parse::<TransactionKind>().unwrap(), kind);
        }
    }

    #[test]
    fn test_payment_method_serde_spelling() {
        let json = serde_json::to_string(&PaymentMethod::Instapay).unwrap();
        assert_eq!(json, "\"instapay\"");
    }
}
