// 🧱 Dimension Builders - deduplicated current-state snapshots
// Last occurrence per natural key wins; reference joins are explicit left joins on key columns

use crate::error::Result;
use crate::schema::{require_output_schema, SchemaValidator};
use crate::table::{Column, DataType, Table, Value};

/// Source tables each dimension is built from
pub const DIMENSION_SOURCES: [(&str, &[&str]); 7] = [
    ("dim_counterparty", &["counterparty", "address"]),
    ("dim_currency", &["currency"]),
    ("dim_design", &["design"]),
    ("dim_location", &["address"]),
    ("dim_payment_type", &["payment_type"]),
    ("dim_staff", &["staff", "department"]),
    ("dim_transaction", &["transaction"]),
];

/// ISO 4217 names for the currencies the source trades in
const CURRENCY_NAMES: [(&str, &str); 8] = [
    ("GBP", "British Pound"),
    ("USD", "US Dollar"),
    ("EUR", "Euro"),
    ("JPY", "Japanese Yen"),
    ("CHF", "Swiss Franc"),
    ("CAD", "Canadian Dollar"),
    ("AUD", "Australian Dollar"),
    ("CNY", "Chinese Yuan"),
];

pub fn currency_name(code: &str) -> Option<&'static str> {
    CURRENCY_NAMES
        .iter()
        .find(|(iso, _)| iso.eq_ignore_ascii_case(code.trim()))
        .map(|(_, name)| *name)
}

/// Project to the declared output column order and check it
fn finish(table: Table, name: &str, projection: &[(&str, &str)]) -> Result<Table> {
    let schema = require_output_schema(name)?;
    let projected = table.select(name, projection)?;
    let conformed = SchemaValidator::conform(projected, &schema)?;
    tracing::info!(table = name, rows = conformed.len(), "Built dimension");
    Ok(conformed)
}

/// Same columns as the source, one row per key
fn passthrough(source: &Table, key: &str, name: &str) -> Result<Table> {
    let deduped = source.dedup_keep_last(key)?;
    let columns: Vec<(&str, &str)> = source.column_names().into_iter().map(|c| (c, c)).collect();
    finish(deduped, name, &columns)
}

pub fn build_dim_counterparty(counterparty: &Table, address: &Table) -> Result<Table> {
    let counterparty = counterparty.dedup_keep_last("counterparty_id")?;
    let address = address.dedup_keep_last("address_id")?;

    let joined = counterparty.left_join(
        &address,
        "legal_address_id",
        "address_id",
        &[
            ("address_line_1", "counterparty_legal_address_line_1"),
            ("address_line_2", "counterparty_legal_address_line_2"),
            ("district", "counterparty_legal_district"),
            ("city", "counterparty_legal_city"),
            ("postal_code", "counterparty_legal_postal_code"),
            ("country", "counterparty_legal_country"),
            ("phone", "counterparty_legal_phone_number"),
        ],
    )?;

    finish(
        joined,
        "dim_counterparty",
        &[
            ("counterparty_id", "counterparty_id"),
            ("counterparty_legal_name", "counterparty_legal_name"),
            ("counterparty_legal_address_line_1", "counterparty_legal_address_line_1"),
            ("counterparty_legal_address_line_2", "counterparty_legal_address_line_2"),
            ("counterparty_legal_district", "counterparty_legal_district"),
            ("counterparty_legal_city", "counterparty_legal_city"),
            ("counterparty_legal_postal_code", "counterparty_legal_postal_code"),
            ("counterparty_legal_country", "counterparty_legal_country"),
            ("counterparty_legal_phone_number", "counterparty_legal_phone_number"),
        ],
    )
}

pub fn build_dim_currency(currency: &Table) -> Result<Table> {
    let mut deduped = currency.dedup_keep_last("currency_id")?;

    let names = deduped
        .column_values("currency_code")?
        .into_iter()
        .map(|code| match code.as_str().and_then(currency_name) {
            Some(name) => Value::Text(name.to_string()),
            None => Value::Null,
        })
        .collect();
    deduped.add_column(Column::nullable("currency_name", DataType::Text), names)?;

    finish(
        deduped,
        "dim_currency",
        &[
            ("currency_id", "currency_id"),
            ("currency_code", "currency_code"),
            ("currency_name", "currency_name"),
        ],
    )
}

pub fn build_dim_design(design: &Table) -> Result<Table> {
    passthrough(design, "design_id", "dim_design")
}

pub fn build_dim_location(address: &Table) -> Result<Table> {
    let deduped = address.dedup_keep_last("address_id")?;
    finish(
        deduped,
        "dim_location",
        &[
            ("address_id", "location_id"),
            ("address_line_1", "address_line_1"),
            ("address_line_2", "address_line_2"),
            ("district", "district"),
            ("city", "city"),
            ("postal_code", "postal_code"),
            ("country", "country"),
            ("phone", "phone"),
        ],
    )
}

pub fn build_dim_payment_type(payment_type: &Table) -> Result<Table> {
    passthrough(payment_type, "payment_type_id", "dim_payment_type")
}

pub fn build_dim_staff(staff: &Table, department: &Table) -> Result<Table> {
    let staff = staff.dedup_keep_last("staff_id")?;
    let department = department.dedup_keep_last("department_id")?;
    let joined = staff.left_join(&department, "department_id", "department_id", &[])?;

    finish(
        joined,
        "dim_staff",
        &[
            ("staff_id", "staff_id"),
            ("first_name", "first_name"),
            ("last_name", "last_name"),
            ("department_name", "department_name"),
            ("location", "location"),
            ("email_address", "email_address"),
        ],
    )
}

pub fn build_dim_transaction(transaction: &Table) -> Result<Table> {
    passthrough(transaction, "transaction_id", "dim_transaction")
}
