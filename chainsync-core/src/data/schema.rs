//! Conversion between `RecordSet` and Polars frames.
//!
//! Column dtypes are inferred from the non-null values a column holds:
//!
//! | values            | dtype                 |
//! |-------------------|-----------------------|
//! | Int               | Int64                 |
//! | Int + Float       | Float64               |
//! | Str               | String                |
//! | Bool              | Boolean               |
//! | Date              | Date                  |
//! | Timestamp         | Datetime(ms)          |
//! | only nulls        | Float64               |
//!
//! Any other mix is a `ColumnTypeConflict`.

use chrono::{DateTime, Duration, NaiveDate, NaiveDateTime};
use polars::prelude::*;

use super::store::StoreError;
use crate::domain::{Record, RecordSet, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ColumnKind {
    Empty,
    Bool,
    Int,
    Float,
    Str,
    Date,
    Timestamp,
}

impl ColumnKind {
    fn of(value: &Value) -> ColumnKind {
        match value {
            Value::Null => ColumnKind::Empty,
            Value::Bool(_) => ColumnKind::Bool,
            Value::Int(_) => ColumnKind::Int,
            Value::Float(_) => ColumnKind::Float,
            Value::Str(_) => ColumnKind::Str,
            Value::Date(_) => ColumnKind::Date,
            Value::Timestamp(_) => ColumnKind::Timestamp,
        }
    }

    fn unify(self, other: ColumnKind) -> Option<ColumnKind> {
        use ColumnKind::*;
        match (self, other) {
            (Empty, k) | (k, Empty) => Some(k),
            (Int, Float) | (Float, Int) => Some(Float),
            (a, b) if a == b => Some(a),
            _ => None,
        }
    }
}

fn unix_epoch() -> NaiveDate {
    DateTime::UNIX_EPOCH.date_naive()
}

fn polars_err(context: &'static str) -> impl Fn(PolarsError) -> StoreError {
    move |e| StoreError::Parquet(format!("{context}: {e}"))
}

fn infer_kind(column: &str, rows: &[Record]) -> Result<ColumnKind, StoreError> {
    let mut kind = ColumnKind::Empty;
    for row in rows {
        let value = row.get(column);
        let next = ColumnKind::of(value);
        kind = kind.unify(next).ok_or_else(|| StoreError::ColumnTypeConflict {
            column: column.to_string(),
            detail: format!("{kind:?} and {next:?} values in the same column"),
        })?;
    }
    Ok(kind)
}

fn build_column(name: &str, rows: &[Record]) -> Result<Column, StoreError> {
    let kind = infer_kind(name, rows)?;
    let name: PlSmallStr = name.into();
    let column = match kind {
        ColumnKind::Bool => {
            let v: Vec<Option<bool>> = rows
                .iter()
                .map(|r| match r.get(name.as_str()) {
                    Value::Bool(b) => Some(*b),
                    _ => None,
                })
                .collect();
            Column::new(name, v)
        }
        ColumnKind::Int => {
            let v: Vec<Option<i64>> = rows
                .iter()
                .map(|r| match r.get(name.as_str()) {
                    Value::Int(i) => Some(*i),
                    _ => None,
                })
                .collect();
            Column::new(name, v)
        }
        ColumnKind::Float | ColumnKind::Empty => {
            let v: Vec<Option<f64>> = rows.iter().map(|r| r.get(name.as_str()).as_f64()).collect();
            Column::new(name, v)
        }
        ColumnKind::Str => {
            let v: Vec<Option<String>> = rows
                .iter()
                .map(|r| r.get(name.as_str()).as_str().map(str::to_string))
                .collect();
            Column::new(name, v)
        }
        ColumnKind::Date => {
            let epoch = unix_epoch();
            let v: Vec<Option<i32>> = rows
                .iter()
                .map(|r| match r.get(name.as_str()) {
                    Value::Date(d) => Some((*d - epoch).num_days() as i32),
                    _ => None,
                })
                .collect();
            Column::new(name, v)
                .cast(&DataType::Date)
                .map_err(polars_err("date cast"))?
        }
        ColumnKind::Timestamp => {
            let v: Vec<Option<i64>> = rows
                .iter()
                .map(|r| match r.get(name.as_str()) {
                    Value::Timestamp(t) => Some(t.and_utc().timestamp_millis()),
                    _ => None,
                })
                .collect();
            Column::new(name, v)
                .cast(&DataType::Datetime(TimeUnit::Milliseconds, None))
                .map_err(polars_err("datetime cast"))?
        }
    };
    Ok(column)
}

/// Convert a record set to a frame with columns in header order.
pub fn records_to_dataframe(set: &RecordSet) -> Result<DataFrame, StoreError> {
    let columns = set
        .columns()
        .iter()
        .map(|c| build_column(c, set.rows()))
        .collect::<Result<Vec<_>, _>>()?;
    DataFrame::new(columns).map_err(polars_err("dataframe creation"))
}

/// Read every cell of a column as `Value`s.
pub fn column_values(column: &Column) -> Result<Vec<Value>, StoreError> {
    let values = match column.dtype() {
        DataType::Null => vec![Value::Null; column.len()],
        DataType::Boolean => column
            .bool()
            .map_err(polars_err("bool column"))?
            .into_iter()
            .map(|v| v.map_or(Value::Null, Value::Bool))
            .collect(),
        DataType::Int8
        | DataType::Int16
        | DataType::Int32
        | DataType::Int64
        | DataType::UInt8
        | DataType::UInt16
        | DataType::UInt32
        | DataType::UInt64 => {
            let cast = column
                .cast(&DataType::Int64)
                .map_err(polars_err("int cast"))?;
            cast.i64()
                .map_err(polars_err("int column"))?
                .into_iter()
                .map(|v| v.map_or(Value::Null, Value::Int))
                .collect()
        }
        DataType::Float32 | DataType::Float64 => {
            let cast = column
                .cast(&DataType::Float64)
                .map_err(polars_err("float cast"))?;
            cast.f64()
                .map_err(polars_err("float column"))?
                .into_iter()
                .map(|v| v.map_or(Value::Null, Value::Float))
                .collect()
        }
        DataType::Date => {
            let epoch = unix_epoch();
            let days = column
                .cast(&DataType::Int32)
                .map_err(polars_err("date cast"))?;
            days.i32()
                .map_err(polars_err("date column"))?
                .into_iter()
                .map(|v| {
                    v.and_then(|d| epoch.checked_add_signed(Duration::days(i64::from(d))))
                        .map_or(Value::Null, Value::Date)
                })
                .collect()
        }
        DataType::Datetime(_, _) => {
            let ms = column
                .cast(&DataType::Datetime(TimeUnit::Milliseconds, None))
                .and_then(|c| c.cast(&DataType::Int64))
                .map_err(polars_err("datetime cast"))?;
            ms.i64()
                .map_err(polars_err("datetime column"))?
                .into_iter()
                .map(|v| v.and_then(millis_to_datetime).map_or(Value::Null, Value::Timestamp))
                .collect()
        }
        DataType::String => column
            .str()
            .map_err(polars_err("string column"))?
            .into_iter()
            .map(|v| v.map_or(Value::Null, |s| Value::Str(s.to_string())))
            .collect(),
        _ => {
            let cast = column
                .cast(&DataType::String)
                .map_err(polars_err("string cast"))?;
            cast.str()
                .map_err(polars_err("string column"))?
                .into_iter()
                .map(|v| v.map_or(Value::Null, |s| Value::Str(s.to_string())))
                .collect()
        }
    };
    Ok(values)
}

fn millis_to_datetime(ms: i64) -> Option<NaiveDateTime> {
    DateTime::from_timestamp_millis(ms).map(|dt| dt.naive_utc())
}

/// Convert a frame back into records, keeping its column order.
pub fn dataframe_to_records(df: &DataFrame) -> Result<RecordSet, StoreError> {
    let names: Vec<String> = df
        .get_columns()
        .iter()
        .map(|c| c.name().to_string())
        .collect();
    let values = df
        .get_columns()
        .iter()
        .map(column_values)
        .collect::<Result<Vec<_>, _>>()?;

    let mut set = RecordSet::new(names.iter().cloned());
    for i in 0..df.height() {
        let mut row = Record::new();
        for (name, column) in names.iter().zip(&values) {
            if let Some(v) = column.get(i) {
                row.set(name.as_str(), v.clone());
            }
        }
        set.push(row);
    }
    Ok(set)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn sample() -> RecordSet {
        let ts = date(2024, 1, 2).and_hms_opt(9, 30, 0).unwrap();
        let mut set = RecordSet::new(["date", "timestamp", "close", "volume", "type", "halted", "iv"]);
        set.push(
            Record::new()
                .with("date", date(2024, 1, 2))
                .with("timestamp", ts)
                .with("close", 101.5)
                .with("volume", 1_000i64)
                .with("type", "C")
                .with("halted", Value::Bool(false)),
        );
        set.push(
            Record::new()
                .with("date", date(2024, 1, 3))
                .with("close", 102i64)
                .with("type", "P"),
        );
        set
    }

    #[test]
    fn inferred_dtypes() {
        let df = records_to_dataframe(&sample()).unwrap();
        let schema = df.schema();
        assert_eq!(schema.get("date"), Some(&DataType::Date));
        assert_eq!(
            schema.get("timestamp"),
            Some(&DataType::Datetime(TimeUnit::Milliseconds, None))
        );
        // Int + Float promotes to Float64.
        assert_eq!(schema.get("close"), Some(&DataType::Float64));
        assert_eq!(schema.get("volume"), Some(&DataType::Int64));
        assert_eq!(schema.get("type"), Some(&DataType::String));
        assert_eq!(schema.get("halted"), Some(&DataType::Boolean));
        // Declared but never populated.
        assert_eq!(schema.get("iv"), Some(&DataType::Float64));
    }

    #[test]
    fn frame_back_to_records() {
        let df = records_to_dataframe(&sample()).unwrap();
        let set = dataframe_to_records(&df).unwrap();

        assert_eq!(set.columns(), sample().columns());
        assert_eq!(set.len(), 2);
        assert_eq!(set.rows()[1].get("close"), &Value::Float(102.0));
        assert!(set.rows()[1].get("timestamp").is_null());
        assert_eq!(set.rows()[0].get("date"), &Value::Date(date(2024, 1, 2)));
    }

    #[test]
    fn conflicting_column_types_are_rejected() {
        let set = RecordSet::from_rows(vec![
            Record::new().with("strike", 450.0),
            Record::new().with("strike", "450"),
        ]);
        assert!(matches!(
            records_to_dataframe(&set),
            Err(StoreError::ColumnTypeConflict { .. })
        ));
    }

    #[test]
    fn nanosecond_datetimes_are_read_as_milliseconds() {
        let ns: Vec<i64> = vec![1_704_187_800_000_000_000];
        let col = Column::new("timestamp".into(), ns)
            .cast(&DataType::Datetime(TimeUnit::Nanoseconds, None))
            .unwrap();
        let values = column_values(&col).unwrap();
        assert_eq!(
            values[0],
            Value::Timestamp(date(2024, 1, 2).and_hms_opt(9, 30, 0).unwrap())
        );
    }
}
