//! Bridges between `Table` columns and polars `Series`.
//!
//! Columnar kernels (moments, quantiles, casts, value counts) run on polars;
//! `Table` keeps the row-addressable view the query layer needs.

use polars::prelude::DataType as FrameType;
use polars::prelude::*;

use crate::utils::types::{compare_values, Column, DataType, Value};

/// Float64 view of a column; cells that do not coerce to a number are null
pub fn numeric_series(column: &Column) -> Series {
    Series::new(column.name.as_str().into(), column.numeric_values())
}

/// Typed series for a column. Date-times and mixed cells travel as text.
pub fn to_series(column: &Column) -> Series {
    let name: PlSmallStr = column.name.as_str().into();
    match column.data_type {
        DataType::Integer => {
            let values: Vec<Option<i64>> = column
                .values
                .iter()
                .map(|v| match v {
                    Value::Integer(i) => Some(*i),
                    _ => None,
                })
                .collect();
            Series::new(name, values)
        }
        DataType::Float => numeric_series(column),
        DataType::Boolean => {
            let values: Vec<Option<bool>> = column
                .values
                .iter()
                .map(|v| match v {
                    Value::Boolean(b) => Some(*b),
                    _ => None,
                })
                .collect();
            Series::new(name, values)
        }
        DataType::DateTime | DataType::Text => text_series(column),
    }
}

/// String view of a column using the engine's cell rendering
pub fn text_series(column: &Column) -> Series {
    let values: Vec<Option<String>> = column
        .values
        .iter()
        .map(|v| (!v.is_null()).then(|| v.render()))
        .collect();
    Series::new(column.name.as_str().into(), values)
}

/// Cells of a series as engine values
pub fn series_values(series: &Series) -> PolarsResult<Vec<Value>> {
    let values = match series.dtype() {
        FrameType::Boolean => series
            .bool()?
            .into_iter()
            .map(|v| v.map(Value::Boolean).unwrap_or(Value::Null))
            .collect(),
        FrameType::String => series
            .str()?
            .into_iter()
            .map(|v| v.map(|s| Value::Text(s.to_string())).unwrap_or(Value::Null))
            .collect(),
        dtype if dtype.is_integer() => {
            let ints = series.cast(&FrameType::Int64)?;
            ints.i64()?
                .into_iter()
                .map(|v| v.map(Value::Integer).unwrap_or(Value::Null))
                .collect()
        }
        dtype if dtype.is_float() => {
            let floats = series.cast(&FrameType::Float64)?;
            floats
                .f64()?
                .into_iter()
                .map(|v| v.filter(|f| !f.is_nan()).map(Value::Float).unwrap_or(Value::Null))
                .collect()
        }
        _ => {
            let text = series.cast(&FrameType::String)?;
            text.str()?
                .into_iter()
                .map(|v| v.map(|s| Value::Text(s.to_string())).unwrap_or(Value::Null))
                .collect()
        }
    };
    Ok(values)
}

/// Column rebuilt from a series, type re-inferred
pub fn series_to_column(series: &Series) -> PolarsResult<Column> {
    Ok(Column::new(series.name().to_string(), series_values(series)?))
}

/// Type text cells with polars strict casts: integer, then float.
///
/// Returns `None` when neither cast holds for every present cell.
pub fn cast_numeric_text(name: &str, cells: &[Option<&str>]) -> Option<Vec<Value>> {
    let raw = Series::new(name.into(), cells.to_vec());
    if let Ok(ints) = raw.strict_cast(&FrameType::Int64) {
        return series_values(&ints).ok();
    }
    raw.strict_cast(&FrameType::Float64)
        .ok()
        .and_then(|floats| series_values(&floats).ok())
}

/// Most frequent non-null value of a series, smallest on ties
pub fn series_mode(series: &Series) -> PolarsResult<Option<Value>> {
    let series = series.drop_nulls();
    if series.is_empty() {
        return Ok(None);
    }
    let counted = series.value_counts(false, false, "counts".into(), false)?;
    let values = series_values(counted.column(series.name().as_str())?.as_materialized_series())?;
    let counts = counted.column("counts")?.as_materialized_series().cast(&FrameType::UInt64)?;

    let best = values
        .into_iter()
        .zip(counts.u64()?.into_iter().map(|c| c.unwrap_or(0)))
        .max_by(|(a, ca), (b, cb)| ca.cmp(cb).then_with(|| compare_values(b, a)))
        .map(|(value, _)| value);
    Ok(best)
}

/// Column mode in the column's own value type
pub fn mode(column: &Column) -> PolarsResult<Option<Value>> {
    let best = series_mode(&to_series(column))?;
    Ok(best.map(|value| match column.data_type {
        DataType::DateTime => value.as_datetime().map(Value::DateTime).unwrap_or(value),
        _ => value,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_series_round_trip_keeps_types() {
        let column = Column::new("n", vec![Value::Integer(4), Value::Null, Value::Integer(-2)]);
        let series = to_series(&column);

        assert_eq!(series.dtype(), &FrameType::Int64);
        assert_eq!(series.null_count(), 1);
        assert_eq!(series_to_column(&series).unwrap(), column);
    }

    #[test]
    fn test_numeric_series_coerces_text() {
        let column = Column::new("t", vec![Value::Text("2.5".into()), Value::Text("x".into())]);
        let series = numeric_series(&column);

        assert_eq!(series.dtype(), &FrameType::Float64);
        assert_eq!(series.f64().unwrap().get(0), Some(2.5));
        assert_eq!(series.f64().unwrap().get(1), None);
    }

    #[test]
    fn test_cast_numeric_text() {
        let ints = cast_numeric_text("a", &[Some("1"), None, Some("30")]).unwrap();
        assert_eq!(ints, vec![Value::Integer(1), Value::Null, Value::Integer(30)]);

        let floats = cast_numeric_text("b", &[Some("1"), Some("2.5")]).unwrap();
        assert_eq!(floats, vec![Value::Float(1.0), Value::Float(2.5)]);

        assert!(cast_numeric_text("c", &[Some("1"), Some("one")]).is_none());
    }

    #[test]
    fn test_mode_prefers_smallest_on_ties() {
        let column = Column::new(
            "m",
            vec![Value::Integer(5), Value::Integer(2), Value::Integer(5), Value::Integer(2), Value::Null],
        );
        assert_eq!(mode(&column).unwrap(), Some(Value::Integer(2)));

        let empty = Column::new("e", vec![Value::Null]);
        assert_eq!(mode(&empty).unwrap(), None);
    }
}
