// 📊 Fact Builders - business events keyed into the date dimension
// Timestamps split into date_id + time of day; every date must already be in dim_date

use super::date_dim::DateDimension;
use crate::error::{PipelineError, Result};
use crate::schema::{require_output_schema, SchemaValidator};
use crate::table::{Table, Value};

/// How one fact column is derived from its source row
enum Derive {
    /// Sequential surrogate id starting at 1
    RecordId,
    Keep(&'static str),
    /// date_id of the date part
    DateOf(&'static str),
    /// Time-of-day part of a timestamp
    TimeOf(&'static str),
}

use Derive::{DateOf, Keep, RecordId, TimeOf};

struct FactShape {
    name: &'static str,
    source: &'static str,
    /// In declared output order
    columns: &'static [Derive],
}

const SALES_ORDER: FactShape = FactShape {
    name: "fact_sales_order",
    source: "sales_order",
    columns: &[
        RecordId,
        Keep("sales_order_id"),
        DateOf("created_at"),
        TimeOf("created_at"),
        DateOf("last_updated"),
        TimeOf("last_updated"),
        Keep("staff_id"),
        Keep("counterparty_id"),
        Keep("units_sold"),
        Keep("unit_price"),
        Keep("currency_id"),
        Keep("design_id"),
        DateOf("agreed_payment_date"),
        DateOf("agreed_delivery_date"),
        Keep("agreed_delivery_location_id"),
    ],
};

const PURCHASE_ORDER: FactShape = FactShape {
    name: "fact_purchase_order",
    source: "purchase_order",
    columns: &[
        RecordId,
        Keep("purchase_order_id"),
        DateOf("created_at"),
        TimeOf("created_at"),
        DateOf("last_updated"),
        TimeOf("last_updated"),
        Keep("staff_id"),
        Keep("counterparty_id"),
        Keep("item_code"),
        Keep("item_quantity"),
        Keep("item_unit_price"),
        Keep("currency_id"),
        DateOf("agreed_delivery_date"),
        DateOf("agreed_payment_date"),
        Keep("agreed_delivery_location_id"),
    ],
};

const PAYMENT: FactShape = FactShape {
    name: "fact_payment",
    source: "payment",
    columns: &[
        RecordId,
        Keep("payment_id"),
        DateOf("created_at"),
        TimeOf("created_at"),
        DateOf("last_updated"),
        TimeOf("last_updated"),
        Keep("transaction_id"),
        Keep("counterparty_id"),
        Keep("payment_amount"),
        Keep("currency_id"),
        Keep("payment_type_id"),
        Keep("paid"),
        DateOf("payment_date"),
    ],
};

const SHAPES: [&FactShape; 3] = [&SALES_ORDER, &PURCHASE_ORDER, &PAYMENT];

/// (fact table, source table)
pub fn fact_sources() -> impl Iterator<Item = (&'static str, &'static str)> {
    SHAPES.iter().map(|shape| (shape.name, shape.source))
}

/// Build a fact table from its unified source. Every distinct history row becomes one fact row;
/// a row landed twice (same key, same change time) is the same event and counts once.
pub fn build_fact(name: &str, source: &Table, dates: &DateDimension) -> Result<Table> {
    let shape = SHAPES
        .iter()
        .find(|shape| shape.name == name)
        .ok_or_else(|| PipelineError::schema(name, "not a fact table"))?;
    let schema = require_output_schema(name)?;

    let distinct = source.distinct();
    if distinct.len() < source.len() {
        tracing::warn!(
            table = shape.source,
            repeated = source.len() - distinct.len(),
            "Dropping rows landed more than once"
        );
    }
    let source = &distinct;

    // Resolve source positions once
    let positions = shape
        .columns
        .iter()
        .map(|derive| match derive {
            RecordId => Ok(None),
            Keep(col) | DateOf(col) | TimeOf(col) => source.column_index(col).map(Some),
        })
        .collect::<Result<Vec<_>>>()?;

    let mut rows = Vec::with_capacity(source.len());
    for (row_no, row) in source.rows().iter().enumerate() {
        let mut out = Vec::with_capacity(shape.columns.len());
        for (derive, position) in shape.columns.iter().zip(&positions) {
            let value = match (derive, position) {
                (RecordId, _) => Value::Integer(row_no as i64 + 1),
                (Keep(_), Some(idx)) => row[*idx].clone(),
                (DateOf(col), Some(idx)) => resolve_date(&row[*idx], shape.source, col, dates)?,
                (TimeOf(_), Some(idx)) => row[*idx].as_time().map(Value::Time).unwrap_or(Value::Null),
                (_, None) => Value::Null,
            };
            out.push(value);
        }
        rows.push(out);
    }

    let fact = Table::with_rows(name, schema.columns.clone(), rows)?;
    let fact = SchemaValidator::conform(fact, &schema)?;
    tracing::info!(table = name, rows = fact.len(), "Built fact table");
    Ok(fact)
}

fn resolve_date(value: &Value, table: &str, column: &str, dates: &DateDimension) -> Result<Value> {
    let Some(date) = value.as_date() else {
        return Ok(Value::Null);
    };
    dates
        .id_of(date)
        .map(Value::Integer)
        .ok_or_else(|| PipelineError::CoverageViolation {
            table: table.to_string(),
            column: column.to_string(),
            date: date.to_string(),
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::source_schema;
    use crate::table::DataType;
    use crate::transform::date_dim::{build_date_dimension, decompose};
    use chrono::NaiveDate;

    fn ts(text: &str) -> Value {
        Value::parse(text, DataType::Timestamp).unwrap()
    }

    fn day(text: &str) -> Value {
        Value::parse(text, DataType::Date).unwrap()
    }

    fn payments() -> Table {
        let schema = source_schema("payment").unwrap();
        Table::with_rows(
            "payment",
            schema.columns,
            vec![
                vec![
                    Value::Integer(2),
                    ts("2022-11-03 14:20:52.187"),
                    ts("2022-11-03 14:20:52.187"),
                    Value::Integer(2),
                    Value::Integer(15),
                    Value::Real(552548.62),
                    Value::Integer(2),
                    Value::Integer(3),
                    Value::Boolean(false),
                    day("2022-11-04"),
                ],
                vec![
                    Value::Integer(3),
                    ts("2022-11-03 14:20:52.186"),
                    ts("2022-11-05 09:00:00"),
                    Value::Integer(3),
                    Value::Integer(19),
                    Value::Real(205952.22),
                    Value::Integer(3),
                    Value::Integer(1),
                    Value::Boolean(true),
                    day("2022-11-03"),
                ],
            ],
        )
        .unwrap()
    }

    #[test]
    fn test_payment_fact_shape() {
        let source = payments();
        let dates = build_date_dimension(None, &[&source]).unwrap();
        let fact = build_fact("fact_payment", &source, &dates).unwrap();

        assert_eq!(fact.len(), 2);
        assert_eq!(fact.column_names()[0], "payment_record_id");
        assert_eq!(fact.rows()[0][0], Value::Integer(1));
        assert_eq!(fact.rows()[1][0], Value::Integer(2));
        assert_eq!(fact.rows()[0][3], Value::parse("14:20:52.187", DataType::Time).unwrap());
        assert_eq!(fact.rows()[1][11], Value::Boolean(true));
    }

    fn sales_orders() -> Table {
        let schema = source_schema("sales_order").unwrap();
        Table::with_rows(
            "sales_order",
            schema.columns,
            vec![
                vec![
                    Value::Integer(1),
                    ts("2022-11-03 14:20:52.186"),
                    ts("2022-11-04 10:00:00"),
                    Value::Integer(9),
                    Value::Integer(16),
                    Value::Integer(18),
                    Value::Integer(84754),
                    Value::Real(2.43),
                    Value::Integer(3),
                    day("2022-11-10"),
                    day("2022-11-03"),
                    Value::Integer(4),
                ],
                vec![
                    Value::Integer(2),
                    ts("2022-11-06 08:30:00"),
                    ts("2022-11-06 08:30:00"),
                    Value::Integer(3),
                    Value::Integer(19),
                    Value::Integer(8),
                    Value::Integer(42972),
                    Value::Real(3.94),
                    Value::Integer(2),
                    day("2022-11-07"),
                    day("2022-11-08"),
                    Value::Integer(8),
                ],
            ],
        )
        .unwrap()
    }

    fn purchase_orders() -> Table {
        let schema = source_schema("purchase_order").unwrap();
        Table::with_rows(
            "purchase_order",
            schema.columns,
            vec![vec![
                Value::Integer(1),
                ts("2022-11-03 14:20:52.186"),
                ts("2022-11-09 11:00:00"),
                Value::Integer(12),
                Value::Integer(11),
                Value::Text("ZDOI5EA".to_string()),
                Value::Integer(371),
                Value::Real(361.39),
                Value::Integer(2),
                day("2022-11-09"),
                day("2022-11-07"),
                Value::Integer(6),
            ]],
        )
        .unwrap()
    }

    #[test]
    fn test_every_date_role_resolves_to_its_calendar_row() {
        let sources = [payments(), sales_orders(), purchase_orders()];
        let refs: Vec<&Table> = sources.iter().collect();
        let dates = build_date_dimension(None, &refs).unwrap();
        let dim = dates.to_table().unwrap();

        let mut checked = 0;
        for shape in SHAPES {
            let source = sources.iter().find(|t| t.name() == shape.source).unwrap();
            let fact = build_fact(shape.name, source, &dates).unwrap();
            assert_eq!(fact.len(), source.len());

            for (position, derive) in shape.columns.iter().enumerate() {
                let DateOf(column) = derive else { continue };
                let source_idx = source.column_index(column).unwrap();

                for (fact_row, source_row) in fact.rows().iter().zip(source.rows()) {
                    let id = fact_row[position].as_i64().unwrap();
                    let dim_row = dim.rows().iter().find(|r| r[0] == Value::Integer(id)).unwrap();
                    let attrs = decompose(source_row[source_idx].as_date().unwrap());
                    assert_eq!(dim_row[1], Value::Integer(attrs.year as i64), "{}.{}", shape.name, column);
                    assert_eq!(dim_row[2], Value::Integer(attrs.month as i64), "{}.{}", shape.name, column);
                    assert_eq!(dim_row[3], Value::Integer(attrs.day as i64), "{}.{}", shape.name, column);
                    checked += 1;
                }
            }
        }
        // payment: 3 roles x 2 rows, sales: 4 x 2, purchase: 4 x 1
        assert_eq!(checked, 18);
    }

    #[test]
    fn test_row_landed_twice_is_one_fact() {
        let once = payments();
        let twice = Table::concat("payment", vec![once.clone(), once.clone()]).unwrap();
        let dates = build_date_dimension(None, &[&twice]).unwrap();

        let fact = build_fact("fact_payment", &twice, &dates).unwrap();
        assert_eq!(fact.len(), 2);
        assert_eq!(fact.rows()[1][0], Value::Integer(2));
        assert_eq!(fact.rows()[1][1], Value::Integer(3));
    }

    #[test]
    fn test_missing_date_is_a_coverage_violation() {
        let source = payments();
        let mut dates = DateDimension::new();
        dates.extend([NaiveDate::from_ymd_opt(2022, 11, 3).unwrap()]);

        let err = build_fact("fact_payment", &source, &dates).unwrap_err();
        match err {
            PipelineError::CoverageViolation { table, column, date } => {
                assert_eq!(table, "payment");
                assert_eq!(column, "payment_date");
                assert_eq!(date, "2022-11-04");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_sales_fact_renames_staff() {
        let schema = source_schema("sales_order").unwrap();
        let source = Table::with_rows(
            "sales_order",
            schema.columns,
            vec![vec![
                Value::Integer(1),
                ts("2022-11-03 14:20:52.186"),
                ts("2022-11-03 14:20:52.186"),
                Value::Integer(9),
                Value::Integer(16),
                Value::Integer(18),
                Value::Integer(84754),
                Value::Real(2.43),
                Value::Integer(3),
                day("2022-11-10"),
                day("2022-11-03"),
                Value::Integer(4),
            ]],
        )
        .unwrap();
        let dates = build_date_dimension(None, &[&source]).unwrap();
        let fact = build_fact("fact_sales_order", &source, &dates).unwrap();

        assert_eq!(fact.column_names()[6], "sales_staff_id");
        assert_eq!(fact.rows()[0][6], Value::Integer(16));
        // agreed_payment_date 2022-11-03 is the earliest date
        assert_eq!(fact.rows()[0][12], Value::Integer(1));
        assert_eq!(fact.rows()[0][13], Value::Integer(2));
    }
}
