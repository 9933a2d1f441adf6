use chrono::{DateTime, NaiveDate, NaiveDateTime, Timelike};
use serde::{Deserialize, Serialize, Serializer};
use std::cmp::Ordering;
use std::collections::HashSet;
use std::fmt;
use std::hash::{Hash, Hasher};

use crate::utils::error::{TabulaError, TabulaResult};
use crate::utils::frame;

/// Tokens read as missing values when parsing raw text cells
const NULL_TOKENS: &[&str] = &[
    "", "NA", "N/A", "n/a", "NaN", "nan", "-NaN", "null", "NULL", "None", "#N/A", "<NA>",
];

const DATETIME_FORMATS: &[&str] = &[
    "%Y-%m-%d %H:%M:%S",
    "%Y-%m-%dT%H:%M:%S",
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%d %H:%M",
    "%Y-%m-%dT%H:%M",
];

const DATE_FORMATS: &[&str] = &["%Y-%m-%d", "%Y/%m/%d"];

/// Individual cell values
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Integer(i64),
    Float(f64),
    Boolean(bool),
    Text(String),
    DateTime(NaiveDateTime),
}

/// Semantic type inferred for a column
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataType {
    Integer,
    Float,
    Boolean,
    DateTime,
    Text,
}

impl DataType {
    /// Integer and Float columns are numeric
    pub fn is_numeric(&self) -> bool {
        matches!(self, DataType::Integer | DataType::Float)
    }

    pub fn name(&self) -> &'static str {
        match self {
            DataType::Integer => "integer",
            DataType::Float => "float",
            DataType::Boolean => "boolean",
            DataType::DateTime => "datetime",
            DataType::Text => "text",
        }
    }

    /// Infer the type of a column from its non-null values
    pub fn infer(values: &[Value]) -> DataType {
        let mut seen_integer = false;
        let mut seen_float = false;
        let mut seen_boolean = false;
        let mut seen_datetime = false;
        let mut seen_text = false;

        for value in values {
            match value {
                Value::Null => {}
                Value::Float(f) if f.is_nan() => {}
                Value::Integer(_) => seen_integer = true,
                Value::Float(_) => seen_float = true,
                Value::Boolean(_) => seen_boolean = true,
                Value::DateTime(_) => seen_datetime = true,
                Value::Text(_) => seen_text = true,
            }
        }

        let numeric = seen_integer || seen_float;
        let kinds = [numeric, seen_boolean, seen_datetime, seen_text]
            .iter()
            .filter(|seen| **seen)
            .count();

        if kinds != 1 {
            return DataType::Text;
        }
        if numeric {
            if seen_float {
                DataType::Float
            } else {
                DataType::Integer
            }
        } else if seen_boolean {
            DataType::Boolean
        } else if seen_datetime {
            DataType::DateTime
        } else {
            DataType::Text
        }
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl Value {
    /// Null and NaN both count as missing
    pub fn is_null(&self) -> bool {
        match self {
            Value::Null => true,
            Value::Float(f) => f.is_nan(),
            _ => false,
        }
    }

    /// Numeric coercion; values that cannot be read as a number yield `None`
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Integer(i) => Some(*i as f64),
            Value::Float(f) if f.is_nan() => None,
            Value::Float(f) => Some(*f),
            Value::Boolean(b) => Some(if *b { 1.0 } else { 0.0 }),
            Value::Text(s) => s.trim().parse::<f64>().ok().filter(|f| !f.is_nan()),
            Value::Null | Value::DateTime(_) => None,
        }
    }

    /// Date-time coercion for temporal comparisons and type changes
    pub fn as_datetime(&self) -> Option<NaiveDateTime> {
        match self {
            Value::DateTime(dt) => Some(*dt),
            Value::Text(s) => parse_datetime(s),
            _ => None,
        }
    }

    /// Textual rendering used by string operators and flat writers. Null renders empty.
    pub fn render(&self) -> String {
        match self {
            Value::Null => String::new(),
            Value::Integer(i) => i.to_string(),
            Value::Float(f) => format_float(*f),
            Value::Boolean(b) => if *b { "True".to_string() } else { "False".to_string() },
            Value::Text(s) => s.clone(),
            Value::DateTime(dt) => format_datetime(dt),
        }
    }

    /// Convert a JSON value; nested structures are kept as their JSON text
    pub fn from_json(json: &serde_json::Value) -> Value {
        match json {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Bool(b) => Value::Boolean(*b),
            serde_json::Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Value::Integer(i)
                } else if let Some(f) = n.as_f64() {
                    Value::Float(f)
                } else {
                    Value::Text(n.to_string())
                }
            }
            serde_json::Value::String(s) => Value::Text(s.clone()),
            serde_json::Value::Array(_) | serde_json::Value::Object(_) => Value::Text(json.to_string()),
        }
    }

    /// JSON rendering; non-finite floats become null
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Value::Null => serde_json::Value::Null,
            Value::Integer(i) => serde_json::Value::from(*i),
            Value::Float(f) => serde_json::Number::from_f64(*f)
                .map(serde_json::Value::Number)
                .unwrap_or(serde_json::Value::Null),
            Value::Boolean(b) => serde_json::Value::Bool(*b),
            Value::Text(s) => serde_json::Value::String(s.clone()),
            Value::DateTime(dt) => serde_json::Value::String(format_datetime(dt)),
        }
    }

    /// Replace infinities and NaN with null
    pub fn normalize_non_finite(self) -> Value {
        match self {
            Value::Float(f) if !f.is_finite() => Value::Null,
            other => other,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.render())
    }
}

impl Serialize for Value {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Value::Null => serializer.serialize_none(),
            Value::Integer(i) => serializer.serialize_i64(*i),
            Value::Float(f) if f.is_finite() => serializer.serialize_f64(*f),
            Value::Float(_) => serializer.serialize_none(),
            Value::Boolean(b) => serializer.serialize_bool(*b),
            Value::Text(s) => serializer.serialize_str(s),
            Value::DateTime(dt) => serializer.serialize_str(&format_datetime(dt)),
        }
    }
}

fn format_float(f: f64) -> String {
    if f.is_finite() && f.fract() == 0.0 && f.abs() < 1e16 {
        format!("{:.1}", f)
    } else {
        f.to_string()
    }
}

/// Seconds precision unless the value carries a fraction
fn format_datetime(dt: &NaiveDateTime) -> String {
    if dt.nanosecond() == 0 {
        dt.format("%Y-%m-%d %H:%M:%S").to_string()
    } else {
        dt.format("%Y-%m-%d %H:%M:%S%.f").to_string()
    }
}

/// Parse ISO-8601 style dates and date-times
pub fn parse_datetime(raw: &str) -> Option<NaiveDateTime> {
    let s = raw.trim();
    if s.is_empty() {
        return None;
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.naive_utc());
    }
    for format in DATETIME_FORMATS {
        if let Ok(dt) = NaiveDateTime::parse_from_str(s, format) {
            return Some(dt);
        }
    }
    for format in DATE_FORMATS {
        if let Ok(date) = NaiveDate::parse_from_str(s, format) {
            return date.and_hms_opt(0, 0, 0);
        }
    }
    None
}

/// Whether a raw text cell denotes a missing value
pub fn is_null_token(raw: &str) -> bool {
    NULL_TOKENS.contains(&raw.trim())
}

fn parse_bool(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "true" => Some(true),
        "false" => Some(false),
        _ => None,
    }
}

fn numeric_rank(value: &Value) -> u8 {
    match value {
        Value::Null => 0,
        Value::Boolean(_) => 1,
        Value::Integer(_) | Value::Float(_) => 2,
        Value::DateTime(_) => 3,
        Value::Text(_) => 4,
    }
}

fn normalized_f64(f: f64) -> f64 {
    if f == 0.0 {
        0.0
    } else {
        f
    }
}

/// Total order over values: null < boolean < numeric < datetime < text
pub fn compare_values(a: &Value, b: &Value) -> Ordering {
    match (a, b) {
        (Value::Integer(x), Value::Integer(y)) => x.cmp(y),
        (Value::Integer(_) | Value::Float(_), Value::Integer(_) | Value::Float(_)) => {
            let x = a.as_f64().unwrap_or(f64::NAN);
            let y = b.as_f64().unwrap_or(f64::NAN);
            normalized_f64(x).total_cmp(&normalized_f64(y))
        }
        (Value::Boolean(x), Value::Boolean(y)) => x.cmp(y),
        (Value::DateTime(x), Value::DateTime(y)) => x.cmp(y),
        (Value::Text(x), Value::Text(y)) => x.cmp(y),
        _ => numeric_rank(a).cmp(&numeric_rank(b)),
    }
}

/// Hashable, totally ordered wrapper used for grouping, dedup and modes
#[derive(Debug, Clone)]
pub struct ValueKey(pub Value);

impl PartialEq for ValueKey {
    fn eq(&self, other: &Self) -> bool {
        compare_values(&self.0, &other.0) == Ordering::Equal
    }
}

impl Eq for ValueKey {}

impl PartialOrd for ValueKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ValueKey {
    fn cmp(&self, other: &Self) -> Ordering {
        compare_values(&self.0, &other.0)
    }
}

impl Hash for ValueKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        let value = &self.0;
        numeric_rank(value).hash(state);
        match value {
            Value::Null => {}
            Value::Integer(i) => normalized_f64(*i as f64).to_bits().hash(state),
            Value::Float(f) => normalized_f64(*f).to_bits().hash(state),
            Value::Boolean(b) => b.hash(state),
            Value::Text(s) => s.hash(state),
            Value::DateTime(dt) => dt.hash(state),
        }
    }
}

/// A named column of values sharing one inferred type
#[derive(Debug, Clone, PartialEq)]
pub struct Column {
    pub name: String,
    pub data_type: DataType,
    pub values: Vec<Value>,
}

impl Column {
    /// Build a column, inferring its type. Integer values are widened in Float columns.
    pub fn new(name: impl Into<String>, values: Vec<Value>) -> Self {
        let data_type = DataType::infer(&values);
        let values = if data_type == DataType::Float {
            values
                .into_iter()
                .map(|v| match v {
                    Value::Integer(i) => Value::Float(i as f64),
                    other => other,
                })
                .collect()
        } else {
            values
        };
        Self {
            name: name.into(),
            data_type,
            values,
        }
    }

    /// Build a column from raw text cells, inferring the narrowest type that fits every cell
    ///
    /// Integer and float detection are polars strict casts; booleans and
    /// date-times are matched on their text.
    pub fn from_raw_strings(name: impl Into<String>, cells: Vec<Option<String>>) -> Self {
        let name = name.into();
        let cells: Vec<Option<String>> = cells
            .into_iter()
            .map(|cell| cell.filter(|raw| !is_null_token(raw)))
            .collect();
        let trimmed: Vec<Option<&str>> = cells.iter().map(|cell| cell.as_deref().map(str::trim)).collect();
        let present = || trimmed.iter().flatten();

        let values: Vec<Value> = if let Some(numbers) = frame::cast_numeric_text(&name, &trimmed) {
            numbers
        } else if present().all(|raw| parse_bool(raw).is_some()) {
            trimmed
                .iter()
                .map(|cell| cell.and_then(parse_bool).map(Value::Boolean).unwrap_or(Value::Null))
                .collect()
        } else if present().all(|raw| parse_datetime(raw).is_some()) {
            trimmed
                .iter()
                .map(|cell| cell.and_then(parse_datetime).map(Value::DateTime).unwrap_or(Value::Null))
                .collect()
        } else {
            cells
                .into_iter()
                .map(|cell| cell.map(Value::Text).unwrap_or(Value::Null))
                .collect()
        };

        Self::new(name, values)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn null_count(&self) -> usize {
        self.values.iter().filter(|v| v.is_null()).count()
    }

    pub fn non_null_count(&self) -> usize {
        self.len() - self.null_count()
    }

    /// Numeric view of the column, `None` where coercion fails
    pub fn numeric_values(&self) -> Vec<Option<f64>> {
        self.values.iter().map(Value::as_f64).collect()
    }

    /// Coerce to numeric: numeric columns are returned unchanged, failures become null
    pub fn coerce_numeric(&self) -> Column {
        if self.data_type.is_numeric() {
            return self.clone();
        }
        let parsed: Vec<Value> = self
            .values
            .iter()
            .map(|v| match v {
                Value::Integer(i) => Value::Integer(*i),
                Value::Boolean(b) => Value::Integer(i64::from(*b)),
                Value::Text(s) => match s.trim().parse::<i64>() {
                    Ok(i) => Value::Integer(i),
                    Err(_) => v.as_f64().map(Value::Float).unwrap_or(Value::Null),
                },
                other => other.as_f64().map(Value::Float).unwrap_or(Value::Null),
            })
            .collect();
        let mut column = Column::new(self.name.clone(), parsed);
        if !column.data_type.is_numeric() {
            // all null after coercion
            column.data_type = DataType::Float;
        }
        column
    }

    /// New column holding the values at `indices`, in that order
    pub fn take(&self, indices: &[usize]) -> Column {
        Column {
            name: self.name.clone(),
            data_type: self.data_type,
            values: indices.iter().map(|&i| self.values[i].clone()).collect(),
        }
    }
}

/// De-duplicate header names as `name`, `name.1`, `name.2`, ...
pub fn dedupe_column_names(names: Vec<String>) -> Vec<String> {
    let mut seen: HashSet<String> = HashSet::new();
    names
        .into_iter()
        .map(|name| {
            if seen.insert(name.clone()) {
                return name;
            }
            let mut suffix = 1;
            loop {
                let candidate = format!("{}.{}", name, suffix);
                if seen.insert(candidate.clone()) {
                    return candidate;
                }
                suffix += 1;
            }
        })
        .collect()
}

/// In-memory dataset: uniquely named columns sharing a row count
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Table {
    columns: Vec<Column>,
}

impl Table {
    /// Create a table, rejecting ragged columns and duplicate names
    pub fn new(columns: Vec<Column>) -> TabulaResult<Self> {
        if let Some(first) = columns.first() {
            let expected = first.len();
            if let Some(bad) = columns.iter().find(|c| c.len() != expected) {
                return Err(TabulaError::Internal(format!(
                    "Column '{}' has {} rows, expected {}",
                    bad.name,
                    bad.len(),
                    expected
                )));
            }
        }
        let mut names = HashSet::new();
        for column in &columns {
            if !names.insert(column.name.as_str()) {
                return Err(TabulaError::Internal(format!(
                    "Duplicate column name '{}'",
                    column.name
                )));
            }
        }
        Ok(Self { columns })
    }

    pub fn empty() -> Self {
        Self::default()
    }

    /// Build a table from row tuples, inferring column types
    pub fn from_rows(names: Vec<String>, rows: Vec<Vec<Value>>) -> TabulaResult<Self> {
        let width = names.len();
        let mut buckets: Vec<Vec<Value>> = (0..width).map(|_| Vec::with_capacity(rows.len())).collect();
        for (index, row) in rows.into_iter().enumerate() {
            if row.len() != width {
                return Err(TabulaError::Internal(format!(
                    "Row {} has {} values, expected {}",
                    index,
                    row.len(),
                    width
                )));
            }
            for (bucket, value) in buckets.iter_mut().zip(row) {
                bucket.push(value);
            }
        }
        let columns = names
            .into_iter()
            .zip(buckets)
            .map(|(name, values)| Column::new(name, values))
            .collect();
        Self::new(columns)
    }

    pub fn columns(&self) -> &[Column] {
        &self.columns
    }

    pub fn into_columns(self) -> Vec<Column> {
        self.columns
    }

    pub fn column(&self, name: &str) -> Option<&Column> {
        self.columns.iter().find(|c| c.name == name)
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c.name == name)
    }

    pub fn column_names(&self) -> Vec<String> {
        self.columns.iter().map(|c| c.name.clone()).collect()
    }

    pub fn dtypes(&self) -> Vec<(String, DataType)> {
        self.columns.iter().map(|c| (c.name.clone(), c.data_type)).collect()
    }

    pub fn row_count(&self) -> usize {
        self.columns.first().map(Column::len).unwrap_or(0)
    }

    pub fn column_count(&self) -> usize {
        self.columns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.row_count() == 0
    }

    /// Values of one row, in column order
    pub fn row(&self, index: usize) -> Vec<Value> {
        self.columns.iter().map(|c| c.values[index].clone()).collect()
    }

    pub fn rows(&self) -> Vec<Vec<Value>> {
        (0..self.row_count()).map(|i| self.row(i)).collect()
    }

    fn row_key(&self, index: usize) -> Vec<ValueKey> {
        self.columns.iter().map(|c| ValueKey(c.values[index].clone())).collect()
    }

    /// `true` for every row identical to an earlier row across all columns
    pub fn duplicate_mask(&self) -> Vec<bool> {
        let mut seen = HashSet::with_capacity(self.row_count());
        (0..self.row_count()).map(|i| !seen.insert(self.row_key(i))).collect()
    }

    /// New table with the rows at `indices`, in that order
    pub fn take_rows(&self, indices: &[usize]) -> Table {
        Table {
            columns: self.columns.iter().map(|c| c.take(indices)).collect(),
        }
    }

    pub fn head(&self, n: usize) -> Table {
        self.slice(0, n)
    }

    /// Rows in `[start, end)`, clamped to the table
    pub fn slice(&self, start: usize, end: usize) -> Table {
        let end = end.min(self.row_count());
        let start = start.min(end);
        let indices: Vec<usize> = (start..end).collect();
        self.take_rows(&indices)
    }

    /// Swap in a replacement column of the same length
    pub fn replace_column(&mut self, index: usize, column: Column) -> TabulaResult<()> {
        if column.len() != self.row_count() {
            return Err(TabulaError::Internal(format!(
                "Replacement column '{}' has {} rows, expected {}",
                column.name,
                column.len(),
                self.row_count()
            )));
        }
        let clash = self
            .columns
            .iter()
            .enumerate()
            .any(|(i, c)| i != index && c.name == column.name);
        if clash {
            return Err(TabulaError::Internal(format!("Duplicate column name '{}'", column.name)));
        }
        match self.columns.get_mut(index) {
            Some(slot) => {
                *slot = column;
                Ok(())
            }
            None => Err(TabulaError::Internal(format!("Column index {} out of range", index))),
        }
    }

    /// Remove the named columns; unknown names are ignored. Returns how many were removed.
    pub fn drop_columns(&mut self, names: &[String]) -> usize {
        let before = self.columns.len();
        self.columns.retain(|c| !names.contains(&c.name));
        before - self.columns.len()
    }

    /// Replace every non-finite float with null
    pub fn normalize_non_finite(self) -> Table {
        Table {
            columns: self
                .columns
                .into_iter()
                .map(|c| Column {
                    name: c.name,
                    data_type: c.data_type,
                    values: c.values.into_iter().map(Value::normalize_non_finite).collect(),
                })
                .collect(),
        }
    }

    /// Row-oriented JSON records keyed by column name
    pub fn to_records(&self) -> Vec<serde_json::Map<String, serde_json::Value>> {
        (0..self.row_count())
            .map(|i| {
                self.columns
                    .iter()
                    .map(|c| (c.name.clone(), c.values[i].to_json()))
                    .collect()
            })
            .collect()
    }

    pub fn to_row_set(&self) -> RowSet {
        RowSet {
            columns: self.column_names(),
            rows: self.rows(),
        }
    }
}

/// Column names plus positional rows, the router's result shape
#[derive(Debug, Clone, PartialEq, Serialize, Default)]
pub struct RowSet {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Value>>,
}

impl RowSet {
    pub fn row_count(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}
