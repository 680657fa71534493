// 📐 Shape Layer - Declared table schemas
// Every table crossing a stage boundary has an ordered, typed, versioned column list

use crate::error::{PipelineError, Result};
use crate::table::{Column, DataType, Table};
use serde::{Deserialize, Serialize};

use DataType::{Boolean, Date, Integer, Real, Text, Time, Timestamp};

// ============================================================================
// DECLARED SCHEMAS
// ============================================================================

type ColumnSpec = (&'static str, DataType, bool);

/// Bumped whenever a declared column list changes
pub const SCHEMA_VERSION: u32 = 1;

/// Source tables tracked by the extractor, in processing order
pub const TRACKED_TABLES: [&str; 11] = [
    "address",
    "counterparty",
    "currency",
    "department",
    "design",
    "payment",
    "payment_type",
    "purchase_order",
    "sales_order",
    "staff",
    "transaction",
];

/// Column the extractor compares against the watermark
pub const CHANGE_COLUMN: &str = "last_updated";

const ADDRESS: &[ColumnSpec] = &[
    ("address_id", Integer, false),
    ("address_line_1", Text, false),
    ("address_line_2", Text, true),
    ("district", Text, true),
    ("city", Text, false),
    ("postal_code", Text, false),
    ("country", Text, false),
    ("phone", Text, false),
];

const COUNTERPARTY: &[ColumnSpec] = &[
    ("counterparty_id", Integer, false),
    ("counterparty_legal_name", Text, false),
    ("legal_address_id", Integer, false),
];

const CURRENCY: &[ColumnSpec] = &[("currency_id", Integer, false), ("currency_code", Text, false)];

const DEPARTMENT: &[ColumnSpec] = &[
    ("department_id", Integer, false),
    ("department_name", Text, false),
    ("location", Text, true),
];

const DESIGN: &[ColumnSpec] = &[
    ("design_id", Integer, false),
    ("design_name", Text, false),
    ("file_location", Text, false),
    ("file_name", Text, false),
];

const PAYMENT: &[ColumnSpec] = &[
    ("payment_id", Integer, false),
    ("created_at", Timestamp, false),
    ("last_updated", Timestamp, false),
    ("transaction_id", Integer, false),
    ("counterparty_id", Integer, false),
    ("payment_amount", Real, false),
    ("currency_id", Integer, false),
    ("payment_type_id", Integer, false),
    ("paid", Boolean, false),
    ("payment_date", Date, false),
];

const PAYMENT_TYPE: &[ColumnSpec] = &[
    ("payment_type_id", Integer, false),
    ("payment_type_name", Text, false),
];

const PURCHASE_ORDER: &[ColumnSpec] = &[
    ("purchase_order_id", Integer, false),
    ("created_at", Timestamp, false),
    ("last_updated", Timestamp, false),
    ("staff_id", Integer, false),
    ("counterparty_id", Integer, false),
    ("item_code", Text, false),
    ("item_quantity", Integer, false),
    ("item_unit_price", Real, false),
    ("currency_id", Integer, false),
    ("agreed_delivery_date", Date, false),
    ("agreed_payment_date", Date, false),
    ("agreed_delivery_location_id", Integer, false),
];

const SALES_ORDER: &[ColumnSpec] = &[
    ("sales_order_id", Integer, false),
    ("created_at", Timestamp, false),
    ("last_updated", Timestamp, false),
    ("design_id", Integer, false),
    ("staff_id", Integer, false),
    ("counterparty_id", Integer, false),
    ("units_sold", Integer, false),
    ("unit_price", Real, false),
    ("currency_id", Integer, false),
    ("agreed_delivery_date", Date, false),
    ("agreed_payment_date", Date, false),
    ("agreed_delivery_location_id", Integer, false),
];

const STAFF: &[ColumnSpec] = &[
    ("staff_id", Integer, false),
    ("first_name", Text, false),
    ("last_name", Text, false),
    ("department_id", Integer, false),
    ("email_address", Text, false),
];

const TRANSACTION: &[ColumnSpec] = &[
    ("transaction_id", Integer, false),
    ("transaction_type", Text, false),
    ("sales_order_id", Integer, true),
    ("purchase_order_id", Integer, true),
];

const DIM_COUNTERPARTY: &[ColumnSpec] = &[
    ("counterparty_id", Integer, false),
    ("counterparty_legal_name", Text, false),
    ("counterparty_legal_address_line_1", Text, true),
    ("counterparty_legal_address_line_2", Text, true),
    ("counterparty_legal_district", Text, true),
    ("counterparty_legal_city", Text, true),
    ("counterparty_legal_postal_code", Text, true),
    ("counterparty_legal_country", Text, true),
    ("counterparty_legal_phone_number", Text, true),
];

const DIM_CURRENCY: &[ColumnSpec] = &[
    ("currency_id", Integer, false),
    ("currency_code", Text, false),
    ("currency_name", Text, true),
];

const DIM_DATE: &[ColumnSpec] = &[
    ("date_id", Integer, false),
    ("year", Integer, false),
    ("month", Integer, false),
    ("day", Integer, false),
    ("day_of_week", Integer, false),
    ("day_name", Text, false),
    ("month_name", Text, false),
    ("quarter", Integer, false),
];

const DIM_LOCATION: &[ColumnSpec] = &[
    ("location_id", Integer, false),
    ("address_line_1", Text, false),
    ("address_line_2", Text, true),
    ("district", Text, true),
    ("city", Text, false),
    ("postal_code", Text, false),
    ("country", Text, false),
    ("phone", Text, false),
];

const DIM_STAFF: &[ColumnSpec] = &[
    ("staff_id", Integer, false),
    ("first_name", Text, false),
    ("last_name", Text, false),
    ("department_name", Text, true),
    ("location", Text, true),
    ("email_address", Text, false),
];

const FACT_SALES_ORDER: &[ColumnSpec] = &[
    ("sales_record_id", Integer, false),
    ("sales_order_id", Integer, false),
    ("created_date", Integer, false),
    ("created_time", Time, false),
    ("last_updated_date", Integer, false),
    ("last_updated_time", Time, false),
    ("sales_staff_id", Integer, false),
    ("counterparty_id", Integer, false),
    ("units_sold", Integer, false),
    ("unit_price", Real, false),
    ("currency_id", Integer, false),
    ("design_id", Integer, false),
    ("agreed_payment_date", Integer, false),
    ("agreed_delivery_date", Integer, false),
    ("agreed_delivery_location_id", Integer, false),
];

const FACT_PURCHASE_ORDER: &[ColumnSpec] = &[
    ("purchase_record_id", Integer, false),
    ("purchase_order_id", Integer, false),
    ("created_date", Integer, false),
    ("created_time", Time, false),
    ("last_updated_date", Integer, false),
    ("last_updated_time", Time, false),
    ("staff_id", Integer, false),
    ("counterparty_id", Integer, false),
    ("item_code", Text, false),
    ("item_quantity", Integer, false),
    ("item_unit_price", Real, false),
    ("currency_id", Integer, false),
    ("agreed_delivery_date", Integer, false),
    ("agreed_payment_date", Integer, false),
    ("agreed_delivery_location_id", Integer, false),
];

const FACT_PAYMENT: &[ColumnSpec] = &[
    ("payment_record_id", Integer, false),
    ("payment_id", Integer, false),
    ("created_date", Integer, false),
    ("created_time", Time, false),
    ("last_updated_date", Integer, false),
    ("last_updated_time", Time, false),
    ("transaction_id", Integer, false),
    ("counterparty_id", Integer, false),
    ("payment_amount", Real, false),
    ("currency_id", Integer, false),
    ("payment_type_id", Integer, false),
    ("paid", Boolean, false),
    ("payment_date", Integer, false),
];

/// Dimension and fact tables produced by the transform stage
pub const OUTPUT_TABLES: [&str; 11] = [
    "dim_counterparty",
    "dim_currency",
    "dim_date",
    "dim_design",
    "dim_location",
    "dim_payment_type",
    "dim_staff",
    "dim_transaction",
    "fact_sales_order",
    "fact_purchase_order",
    "fact_payment",
];

// ============================================================================
// TABLE SCHEMA
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
pub struct TableSchema {
    pub name: String,
    pub version: u32,
    pub columns: Vec<Column>,
    pub primary_key: Vec<String>,
}

impl TableSchema {
    fn from_specs(name: &str, specs: &[ColumnSpec], primary_key: &[&str]) -> Self {
        TableSchema {
            name: name.to_string(),
            version: SCHEMA_VERSION,
            columns: specs
                .iter()
                .map(|(col, data_type, nullable)| Column {
                    name: col.to_string(),
                    data_type: *data_type,
                    nullable: *nullable,
                })
                .collect(),
            primary_key: primary_key.iter().map(|k| k.to_string()).collect(),
        }
    }

    pub fn column_names(&self) -> Vec<&str> {
        self.columns.iter().map(|c| c.name.as_str()).collect()
    }

    /// Empty table with this layout
    pub fn empty_table(&self) -> Table {
        Table::new(&self.name, self.columns.clone())
    }
}

/// Declared schema of a tracked source table
pub fn source_schema(table: &str) -> Option<TableSchema> {
    let (specs, key): (&[ColumnSpec], &str) = match table {
        "address" => (ADDRESS, "address_id"),
        "counterparty" => (COUNTERPARTY, "counterparty_id"),
        "currency" => (CURRENCY, "currency_id"),
        "department" => (DEPARTMENT, "department_id"),
        "design" => (DESIGN, "design_id"),
        "payment" => (PAYMENT, "payment_id"),
        "payment_type" => (PAYMENT_TYPE, "payment_type_id"),
        "purchase_order" => (PURCHASE_ORDER, "purchase_order_id"),
        "sales_order" => (SALES_ORDER, "sales_order_id"),
        "staff" => (STAFF, "staff_id"),
        "transaction" => (TRANSACTION, "transaction_id"),
        _ => return None,
    };
    Some(TableSchema::from_specs(table, specs, &[key]))
}

/// Declared schema of a dimension or fact table
pub fn output_schema(table: &str) -> Option<TableSchema> {
    let (specs, key): (&[ColumnSpec], &str) = match table {
        "dim_counterparty" => (DIM_COUNTERPARTY, "counterparty_id"),
        "dim_currency" => (DIM_CURRENCY, "currency_id"),
        "dim_date" => (DIM_DATE, "date_id"),
        "dim_design" => (DESIGN, "design_id"),
        "dim_location" => (DIM_LOCATION, "location_id"),
        "dim_payment_type" => (PAYMENT_TYPE, "payment_type_id"),
        "dim_staff" => (DIM_STAFF, "staff_id"),
        "dim_transaction" => (TRANSACTION, "transaction_id"),
        "fact_sales_order" => (FACT_SALES_ORDER, "sales_record_id"),
        "fact_purchase_order" => (FACT_PURCHASE_ORDER, "purchase_record_id"),
        "fact_payment" => (FACT_PAYMENT, "payment_record_id"),
        _ => return None,
    };
    Some(TableSchema::from_specs(table, specs, &[key]))
}

pub fn require_source_schema(table: &str) -> Result<TableSchema> {
    source_schema(table)
        .ok_or_else(|| PipelineError::schema(table, "not a tracked source table"))
}

pub fn require_output_schema(table: &str) -> Result<TableSchema> {
    output_schema(table)
        .ok_or_else(|| PipelineError::schema(table, "not a known dimension or fact table"))
}

// ============================================================================
// LOAD STRATEGY
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LoadStrategy {
    /// Delete every existing row, then insert
    Replace,
    /// Insert only
    Append,
    /// Insert, updating non-key columns on primary-key conflict
    Upsert,
}

impl LoadStrategy {
    pub fn name(&self) -> &'static str {
        match self {
            LoadStrategy::Replace => "replace",
            LoadStrategy::Append => "append",
            LoadStrategy::Upsert => "upsert",
        }
    }
}

/// Dimensions and facts are full snapshots; dim_date keeps its keys across runs
pub fn default_load_strategy(table: &str) -> LoadStrategy {
    if table == "dim_date" {
        LoadStrategy::Upsert
    } else {
        LoadStrategy::Replace
    }
}

// ============================================================================
// SCHEMA VALIDATOR
// ============================================================================

#[derive(Debug, Clone)]
pub struct ValidationError {
    pub field: String,
    pub message: String,
    pub context: String,
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}] {}: {}", self.context, self.field, self.message)
    }
}

impl std::error::Error for ValidationError {}

pub type ValidationResult = std::result::Result<(), Vec<ValidationError>>;

pub struct SchemaValidator;

impl SchemaValidator {
    /// Check column names, order, types and nullability against the declared schema
    pub fn validate(table: &Table, schema: &TableSchema) -> ValidationResult {
        let mut errors = Vec::new();
        let error = |field: &str, message: String| ValidationError {
            field: field.to_string(),
            message,
            context: schema.name.clone(),
        };

        let actual = table.column_names();
        let declared = schema.column_names();

        for name in &declared {
            if !actual.contains(name) {
                errors.push(error(*name, "missing column".to_string()));
            }
        }
        for name in &actual {
            if !declared.contains(name) {
                errors.push(error(*name, "undeclared column".to_string()));
            }
        }
        if errors.is_empty() && actual != declared {
            errors.push(error(
                "*",
                format!("column order [{}] differs from declared", actual.join(", ")),
            ));
        }
        if !errors.is_empty() {
            return Err(errors);
        }

        for (idx, declared_col) in schema.columns.iter().enumerate() {
            let actual_col = &table.columns()[idx];
            if actual_col.data_type != declared_col.data_type {
                errors.push(error(
                    &declared_col.name,
                    format!(
                        "declared {}, found {}",
                        declared_col.data_type.name(),
                        actual_col.data_type.name()
                    ),
                ));
                continue;
            }

            for (row_no, row) in table.rows().iter().enumerate() {
                let value = &row[idx];
                match value.data_type() {
                    None if !declared_col.nullable => {
                        errors.push(error(
                            &declared_col.name,
                            format!("null in non-nullable column at row {}", row_no),
                        ));
                        break;
                    }
                    Some(t) if t != declared_col.data_type => {
                        errors.push(error(
                            &declared_col.name,
                            format!("{} value at row {}", t.name(), row_no),
                        ));
                        break;
                    }
                    _ => {}
                }
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }

    /// Validation as a pipeline error, for use with `?`
    pub fn ensure(table: &Table, schema: &TableSchema) -> Result<()> {
        Self::validate(table, schema).map_err(|errors| {
            PipelineError::schema(
                &schema.name,
                errors
                    .iter()
                    .map(|e| format!("{}: {}", e.field, e.message))
                    .collect::<Vec<_>>()
                    .join("; "),
            )
        })
    }

    /// Validate, then relabel the columns with their declared definitions
    pub fn conform(table: Table, schema: &TableSchema) -> Result<Table> {
        Self::ensure(&table, schema)?;
        Table::with_rows(&schema.name, schema.columns.clone(), table.rows().to_vec())
    }
}
