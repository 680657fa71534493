// 📅 Date Dimension - one row per calendar date seen in any fact source
// Ids are an append-only mapping: known dates keep their id, new dates get the next ones

use crate::error::{PipelineError, Result};
use crate::schema::require_output_schema;
use crate::table::{Table, Value};
use chrono::{Datelike, NaiveDate};
use std::collections::{BTreeMap, BTreeSet};

/// Date-bearing columns harvested from each fact source
pub const DATE_COLUMNS: [(&str, &[&str]); 3] = [
    (
        "sales_order",
        &["created_at", "last_updated", "agreed_delivery_date", "agreed_payment_date"],
    ),
    (
        "purchase_order",
        &["created_at", "last_updated", "agreed_delivery_date", "agreed_payment_date"],
    ),
    ("payment", &["created_at", "last_updated", "payment_date"]),
];

const DAY_NAMES: [&str; 7] = [
    "Monday",
    "Tuesday",
    "Wednesday",
    "Thursday",
    "Friday",
    "Saturday",
    "Sunday",
];

const MONTH_NAMES: [&str; 12] = [
    "January",
    "February",
    "March",
    "April",
    "May",
    "June",
    "July",
    "August",
    "September",
    "October",
    "November",
    "December",
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CalendarAttributes {
    pub year: i32,
    pub month: u32,
    pub day: u32,
    /// Monday = 1 .. Sunday = 7
    pub day_of_week: u32,
    pub day_name: &'static str,
    pub month_name: &'static str,
    pub quarter: u32,
}

pub fn decompose(date: NaiveDate) -> CalendarAttributes {
    let day_of_week = date.weekday().number_from_monday();
    CalendarAttributes {
        year: date.year(),
        month: date.month(),
        day: date.day(),
        day_of_week,
        day_name: DAY_NAMES[(day_of_week - 1) as usize],
        month_name: MONTH_NAMES[date.month0() as usize],
        quarter: date.month0() / 3 + 1,
    }
}

/// Every distinct calendar date in the date-bearing columns of the given sources.
///
/// Tables are recognised by name; time of day is discarded.
pub fn harvest_dates(sources: &[&Table]) -> Result<BTreeSet<NaiveDate>> {
    let mut dates = BTreeSet::new();

    for source in sources {
        let Some((_, columns)) = DATE_COLUMNS.iter().find(|(name, _)| *name == source.name()) else {
            continue;
        };
        for column in columns.iter() {
            for value in source.column_values(column)? {
                if value.is_null() {
                    continue;
                }
                let date = value.as_date().ok_or_else(|| {
                    PipelineError::schema(source.name(), format!("{} holds a non-date value {:?}", column, value))
                })?;
                dates.insert(date);
            }
        }
    }

    Ok(dates)
}

// ============================================================================
// DATE DIMENSION
// ============================================================================

#[derive(Debug, Clone, Default, PartialEq)]
pub struct DateDimension {
    ids: BTreeMap<NaiveDate, i64>,
}

impl DateDimension {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild the mapping from a previously produced dim_date
    pub fn from_table(table: &Table) -> Result<Self> {
        let schema = require_output_schema("dim_date")?;
        let id_idx = table.column_index("date_id")?;
        let year_idx = table.column_index("year")?;
        let month_idx = table.column_index("month")?;
        let day_idx = table.column_index("day")?;

        let mut ids = BTreeMap::new();
        for row in table.rows() {
            let field = |idx: usize| {
                row[idx]
                    .as_i64()
                    .ok_or_else(|| PipelineError::schema(&schema.name, format!("non-integer {:?}", row[idx])))
            };
            let id = field(id_idx)?;
            let date = NaiveDate::from_ymd_opt(field(year_idx)? as i32, field(month_idx)? as u32, field(day_idx)? as u32)
                .ok_or_else(|| PipelineError::schema(&schema.name, format!("date_id {} is not a calendar date", id)))?;
            ids.insert(date, id);
        }

        Ok(DateDimension { ids })
    }

    /// Assign ids to dates not yet mapped, in ascending order after the current maximum.
    /// Returns how many were added.
    pub fn extend(&mut self, dates: impl IntoIterator<Item = NaiveDate>) -> usize {
        let fresh: BTreeSet<NaiveDate> = dates
            .into_iter()
            .filter(|d| !self.ids.contains_key(d))
            .collect();

        let mut next = self.ids.values().copied().max().unwrap_or(0) + 1;
        for date in &fresh {
            self.ids.insert(*date, next);
            next += 1;
        }
        fresh.len()
    }

    pub fn id_of(&self, date: NaiveDate) -> Option<i64> {
        self.ids.get(&date).copied()
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    /// dim_date rows ordered by date_id
    pub fn to_table(&self) -> Result<Table> {
        let mut entries: Vec<(i64, NaiveDate)> = self.ids.iter().map(|(d, id)| (*id, *d)).collect();
        entries.sort();

        let mut table = require_output_schema("dim_date")?.empty_table();
        for (id, date) in entries {
            let attrs = decompose(date);
            table.push_row(vec![
                Value::Integer(id),
                Value::Integer(attrs.year as i64),
                Value::Integer(attrs.month as i64),
                Value::Integer(attrs.day as i64),
                Value::Integer(attrs.day_of_week as i64),
                Value::Text(attrs.day_name.to_string()),
                Value::Text(attrs.month_name.to_string()),
                Value::Integer(attrs.quarter as i64),
            ])?;
        }
        Ok(table)
    }
}

/// Extend `prior` (if any) with every date found in the fact sources
pub fn build_date_dimension(prior: Option<&Table>, sources: &[&Table]) -> Result<DateDimension> {
    let mut dimension = match prior {
        Some(table) => DateDimension::from_table(table)?,
        None => DateDimension::new(),
    };
    let added = dimension.extend(harvest_dates(sources)?);
    tracing::info!(known = dimension.len() - added, added, "Built date dimension");
    Ok(dimension)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::source_schema;

    fn date(text: &str) -> NaiveDate {
        NaiveDate::parse_from_str(text, "%Y-%m-%d").unwrap()
    }

    fn sales_orders(dates: &[&str]) -> Table {
        let schema = source_schema("sales_order").unwrap();
        let mut table = schema.empty_table();
        for (i, d) in dates.iter().enumerate() {
            let ts = Value::parse(&format!("{} 10:15:00", d), crate::table::DataType::Timestamp).unwrap();
            let day = Value::Date(date(d));
            table
                .push_row(vec![
                    Value::Integer(i as i64 + 1),
                    ts.clone(),
                    ts,
                    Value::Integer(1),
                    Value::Integer(1),
                    Value::Integer(1),
                    Value::Integer(10),
                    Value::Real(2.5),
                    Value::Integer(1),
                    day.clone(),
                    day,
                    Value::Integer(1),
                ])
                .unwrap();
        }
        table
    }

    #[test]
    fn test_distinct_dates_get_ids_in_date_order() {
        let orders = sales_orders(&["2024-01-05", "2024-01-03", "2024-01-05"]);
        let dim = build_date_dimension(None, &[&orders]).unwrap();

        assert_eq!(dim.len(), 2);
        assert_eq!(dim.id_of(date("2024-01-03")), Some(1));
        assert_eq!(dim.id_of(date("2024-01-05")), Some(2));

        let table = dim.to_table().unwrap();
        assert_eq!(table.len(), 2);
        assert_eq!(table.rows()[0][0], Value::Integer(1));
        assert_eq!(table.rows()[0][3], Value::Integer(3));
    }

    #[test]
    fn test_known_dates_keep_their_ids() {
        let first = build_date_dimension(None, &[&sales_orders(&["2024-01-05"])]).unwrap();
        let prior = first.to_table().unwrap();

        let second =
            build_date_dimension(Some(&prior), &[&sales_orders(&["2024-01-01", "2024-01-05", "2024-02-01"])])
                .unwrap();

        assert_eq!(second.id_of(date("2024-01-05")), Some(1));
        assert_eq!(second.id_of(date("2024-01-01")), Some(2));
        assert_eq!(second.id_of(date("2024-02-01")), Some(3));
    }

    #[test]
    fn test_decompose() {
        let attrs = decompose(date("2024-01-03"));
        assert_eq!(attrs.year, 2024);
        assert_eq!(attrs.day_of_week, 3);
        assert_eq!(attrs.day_name, "Wednesday");
        assert_eq!(attrs.month_name, "January");
        assert_eq!(attrs.quarter, 1);

        assert_eq!(decompose(date("2023-12-31")).quarter, 4);
        assert_eq!(decompose(date("2023-12-31")).day_name, "Sunday");
    }

    #[test]
    fn test_round_trip_through_table() {
        let dim = build_date_dimension(None, &[&sales_orders(&["2022-11-03", "2023-02-28"])]).unwrap();
        let restored = DateDimension::from_table(&dim.to_table().unwrap()).unwrap();
        assert_eq!(restored, dim);
    }
}
