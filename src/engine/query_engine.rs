use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use tracing::{debug, warn};

use crate::engine::statistics::round_to;
use crate::utils::{
    config::QueryConfig,
    error::{QueryError, TabulaResult},
    types::{compare_values, dedupe_column_names, Column, DataType, Table, Value, ValueKey},
};

/// Filter operators
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FilterOperator {
    Eq,
    Neq,
    Gt,
    Lt,
    Gte,
    Lte,
    Contains,
    NotContains,
}

impl FilterOperator {
    pub fn is_numeric(&self) -> bool {
        matches!(self, FilterOperator::Gt | FilterOperator::Lt | FilterOperator::Gte | FilterOperator::Lte)
    }
}

/// A single filter condition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FilterPredicate {
    pub column: String,
    pub operator: FilterOperator,
    pub value: serde_json::Value,
}

impl FilterPredicate {
    pub fn new(column: impl Into<String>, operator: FilterOperator, value: impl Into<serde_json::Value>) -> Self {
        Self {
            column: column.into(),
            operator,
            value: value.into(),
        }
    }
}

/// Aggregation methods
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AggregationMethod {
    Sum,
    #[serde(alias = "mean")]
    Avg,
    #[serde(alias = "size")]
    Count,
    Min,
    Max,
}

impl AggregationMethod {
    pub fn name(&self) -> &'static str {
        match self {
            AggregationMethod::Sum => "sum",
            AggregationMethod::Avg => "avg",
            AggregationMethod::Count => "count",
            AggregationMethod::Min => "min",
            AggregationMethod::Max => "max",
        }
    }
}

impl fmt::Display for AggregationMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// One aggregate output: the method and, except for `count`, its target column
#[derive(Debug, Clone, PartialEq)]
pub struct AggregationSpec {
    pub target_column: Option<String>,
    pub method: AggregationMethod,
}

impl AggregationSpec {
    fn output_name(&self) -> String {
        self.target_column.clone().unwrap_or_else(|| "count".to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortDirection {
    Asc,
    #[default]
    Desc,
}

/// Query request
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueryRequest {
    #[serde(default)]
    pub filters: Vec<FilterPredicate>,
    #[serde(default)]
    pub group_by: Option<String>,
    #[serde(default)]
    pub agg_column: Option<String>,
    #[serde(default)]
    pub agg_method: Option<AggregationMethod>,
    #[serde(default)]
    pub limit: Option<usize>,
    #[serde(default)]
    pub sort_by: Option<String>,
    #[serde(default)]
    pub sort_direction: Option<SortDirection>,
}

/// Result of a query: the derived table plus row-count metadata
#[derive(Debug, Clone, PartialEq)]
pub struct QueryOutcome {
    pub table: Table,
    pub total_rows: usize,
    pub skipped_filters: Vec<String>,
}

/// Wire form of a query result
#[derive(Debug, Clone, Serialize)]
pub struct QueryResponse {
    pub data: Vec<serde_json::Map<String, serde_json::Value>>,
    pub total_rows_after_filter: usize,
    pub skipped_filters: Vec<String>,
}

impl QueryOutcome {
    pub fn to_response(&self) -> QueryResponse {
        QueryResponse {
            data: self.table.to_records(),
            total_rows_after_filter: self.total_rows,
            skipped_filters: self.skipped_filters.clone(),
        }
    }
}

/// First rows of a table plus its shape
#[derive(Debug, Clone, Serialize)]
pub struct Preview {
    pub columns: Vec<String>,
    pub dtypes: BTreeMap<String, DataType>,
    pub total_rows: usize,
    pub total_columns: usize,
    pub data: Vec<serde_json::Map<String, serde_json::Value>>,
    pub preview_limit: usize,
}

/// Rows in `[start, end)`
#[derive(Debug, Clone, Serialize)]
pub struct RowWindow {
    pub total_rows: usize,
    pub start: usize,
    pub end: usize,
    pub rows: Vec<serde_json::Map<String, serde_json::Value>>,
}

/// Named set of filters selecting one segment of a table
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SegmentFilter {
    pub name: String,
    #[serde(default)]
    pub filters: Vec<FilterPredicate>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ComparisonMetric {
    pub metric: String,
    pub seg1: Value,
    pub seg2: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub diff: Option<f64>,
    pub diff_pct: Option<f64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SegmentComparison {
    pub segment1_name: String,
    pub segment2_name: String,
    pub comparison: Vec<ComparisonMetric>,
}

/// Stateless evaluator of filter / group / sort / limit requests
#[derive(Debug, Clone, Default)]
pub struct QueryEngine {
    config: QueryConfig,
}

impl QueryEngine {
    pub fn new(config: QueryConfig) -> Self {
        Self { config }
    }

    /// Filter, optionally group and aggregate, sort and truncate
    pub fn query(&self, table: &Table, request: &QueryRequest) -> TabulaResult<QueryOutcome> {
        let (filtered, skipped_filters) = apply_filters(table, &request.filters)?;

        let mut result = match (&request.group_by, request.agg_method) {
            (Some(group_by), Some(method)) => {
                if filtered.column_index(group_by).is_none() {
                    return Err(QueryError::UnknownColumn(group_by.clone()).into());
                }
                if method != AggregationMethod::Count && request.agg_column.is_none() {
                    return Err(QueryError::MissingAggregationColumn(method.name().to_string()).into());
                }
                let spec = AggregationSpec {
                    target_column: match method {
                        AggregationMethod::Count => None,
                        _ => request.agg_column.clone(),
                    },
                    method,
                };
                group_aggregate(&filtered, &[group_by.clone()], &[spec])?
            }
            _ => filtered,
        };

        if let Some(sort_by) = &request.sort_by {
            let direction = request.sort_direction.unwrap_or_default();
            result = sort_table(&result, sort_by, direction);
        }

        let total_rows = result.row_count();
        let limit = request.limit.unwrap_or(self.config.default_limit);
        let table = result.head(limit).normalize_non_finite();
        debug!(total_rows, returned = table.row_count(), "Query evaluated");

        Ok(QueryOutcome {
            table,
            total_rows,
            skipped_filters,
        })
    }

    /// First `limit` rows (configured preview size when `None`)
    pub fn preview(&self, table: &Table, limit: Option<usize>) -> Preview {
        let preview_limit = limit.unwrap_or(self.config.preview_limit);
        Preview {
            columns: table.column_names(),
            dtypes: table.dtypes().into_iter().collect(),
            total_rows: table.row_count(),
            total_columns: table.column_count(),
            data: table.head(preview_limit).normalize_non_finite().to_records(),
            preview_limit,
        }
    }

    /// Rows in `[start, end)`, clamped to the table
    pub fn row_window(&self, table: &Table, start: usize, end: usize) -> RowWindow {
        let end = end.min(table.row_count());
        let start = start.min(end);
        RowWindow {
            total_rows: table.row_count(),
            start,
            end,
            rows: table.slice(start, end).normalize_non_finite().to_records(),
        }
    }

    /// Row counts and per-numeric-column means of two independently filtered segments
    pub fn compare_segments(
        &self,
        table: &Table,
        segment1: &SegmentFilter,
        segment2: &SegmentFilter,
    ) -> TabulaResult<SegmentComparison> {
        let (first, _) = apply_filters(table, &segment1.filters)?;
        let (second, _) = apply_filters(table, &segment2.filters)?;

        let n1 = first.row_count();
        let n2 = second.row_count();
        let mut comparison = vec![ComparisonMetric {
            metric: "Row Count".to_string(),
            seg1: Value::Integer(n1 as i64),
            seg2: Value::Integer(n2 as i64),
            diff: None,
            diff_pct: (n1 > 0).then(|| round_to((n2 as f64 - n1 as f64) / n1 as f64 * 100.0, 1)),
        }];

        for column in table.columns().iter().filter(|c| c.data_type.is_numeric()) {
            let (Some(mean1), Some(mean2)) = (column_mean(&first, &column.name), column_mean(&second, &column.name))
            else {
                continue;
            };
            let diff = mean2 - mean1;
            let diff_pct = (mean1 != 0.0).then(|| round_to(diff / mean1 * 100.0, 1));
            comparison.push(ComparisonMetric {
                metric: format!("{} (Avg)", column.name),
                seg1: Value::Float(round_to(mean1, 2)),
                seg2: Value::Float(round_to(mean2, 2)),
                diff: Some(round_to(diff, 2)),
                diff_pct,
            });
        }

        Ok(SegmentComparison {
            segment1_name: segment1.name.clone(),
            segment2_name: segment2.name.clone(),
            comparison,
        })
    }
}

fn column_mean(table: &Table, name: &str) -> Option<f64> {
    let values: Vec<f64> = table.column(name)?.values.iter().filter_map(Value::as_f64).collect();
    if values.is_empty() {
        None
    } else {
        Some(values.iter().sum::<f64>() / values.len() as f64)
    }
}

/// Apply predicates as a conjunction, each against the already narrowed table
///
/// Predicates on unknown columns are skipped and their column names returned.
pub fn apply_filters(table: &Table, filters: &[FilterPredicate]) -> TabulaResult<(Table, Vec<String>)> {
    let mut current = table.clone();
    let mut skipped = Vec::new();

    for filter in filters {
        let Some(index) = current.column_index(&filter.column) else {
            warn!(column = %filter.column, "Skipping filter on unknown column");
            skipped.push(filter.column.clone());
            continue;
        };

        let target = Value::from_json(&filter.value);
        let mask: Vec<bool> = if filter.operator.is_numeric() {
            let threshold = target.as_f64().ok_or_else(|| QueryError::InvalidFilterValue {
                column: filter.column.clone(),
                value: filter.value.to_string(),
            })?;
            let coerced = current.columns()[index].coerce_numeric();
            let mask = coerced
                .values
                .iter()
                .map(|cell| match cell.as_f64() {
                    Some(v) => match filter.operator {
                        FilterOperator::Gt => v > threshold,
                        FilterOperator::Lt => v < threshold,
                        FilterOperator::Gte => v >= threshold,
                        _ => v <= threshold,
                    },
                    None => false,
                })
                .collect();
            current.replace_column(index, coerced)?;
            mask
        } else {
            let needle = target.render().to_lowercase();
            current.columns()[index]
                .values
                .iter()
                .map(|cell| {
                    if cell.is_null() {
                        return false;
                    }
                    match filter.operator {
                        FilterOperator::Eq => cells_equal(cell, &target),
                        FilterOperator::Neq => !cells_equal(cell, &target),
                        FilterOperator::Contains => cell.render().to_lowercase().contains(&needle),
                        _ => !cell.render().to_lowercase().contains(&needle),
                    }
                })
                .collect()
        };

        let keep: Vec<usize> = mask.iter().enumerate().filter(|(_, m)| **m).map(|(i, _)| i).collect();
        current = current.take_rows(&keep);
    }

    Ok((current, skipped))
}

fn cells_equal(cell: &Value, target: &Value) -> bool {
    match (cell, target) {
        (_, Value::Null) => false,
        (Value::Boolean(a), Value::Boolean(b)) => a == b,
        (Value::Boolean(a), Value::Text(s)) => s.eq_ignore_ascii_case(if *a { "true" } else { "false" }),
        (Value::Boolean(_), _) | (_, Value::Boolean(_)) => false,
        (Value::DateTime(a), other) => other.as_datetime().map_or(false, |b| *a == b),
        _ => match (cell.as_f64(), target.as_f64()) {
            (Some(a), Some(b)) => a == b,
            _ => cell.render() == target.render(),
        },
    }
}

/// Stable single-column sort; nulls last in both directions. Unknown columns leave the table unchanged.
pub fn sort_table(table: &Table, column: &str, direction: SortDirection) -> Table {
    let Some(sort_column) = table.column(column) else {
        debug!(column, "Ignoring sort on unknown column");
        return table.clone();
    };

    let values = &sort_column.values;
    let mut order: Vec<usize> = (0..table.row_count()).collect();
    order.sort_by(|&a, &b| match (values[a].is_null(), values[b].is_null()) {
        (true, true) => Ordering::Equal,
        (true, false) => Ordering::Greater,
        (false, true) => Ordering::Less,
        (false, false) => {
            let ordering = compare_values(&values[a], &values[b]);
            match direction {
                SortDirection::Asc => ordering,
                SortDirection::Desc => ordering.reverse(),
            }
        }
    });
    table.take_rows(&order)
}

/// Partition rows by the key columns and compute one output column per aggregation
///
/// Groups come out in ascending key order; rows with a null in any key are
/// dropped. Targets of `sum`/`avg`/`min`/`max` are coerced to numeric first;
/// `count` without a target counts rows, with one it counts non-null values.
pub fn group_aggregate(table: &Table, keys: &[String], aggregations: &[AggregationSpec]) -> TabulaResult<Table> {
    let key_columns: Vec<&Column> = keys
        .iter()
        .map(|k| table.column(k).ok_or_else(|| QueryError::UnknownColumn(k.clone())))
        .collect::<Result<_, _>>()?;

    let mut targets: HashMap<String, Column> = HashMap::new();
    for spec in aggregations {
        let Some(name) = &spec.target_column else {
            if spec.method == AggregationMethod::Count {
                continue;
            }
            return Err(QueryError::MissingAggregationColumn(spec.method.name().to_string()).into());
        };
        if !targets.contains_key(name) {
            let column = table.column(name).ok_or_else(|| QueryError::UnknownColumn(name.clone()))?;
            targets.insert(name.clone(), column.coerce_numeric());
        }
    }

    let mut groups: BTreeMap<Vec<ValueKey>, Vec<usize>> = BTreeMap::new();
    for row in 0..table.row_count() {
        if key_columns.iter().any(|c| c.values[row].is_null()) {
            continue;
        }
        let key: Vec<ValueKey> = key_columns.iter().map(|c| ValueKey(c.values[row].clone())).collect();
        groups.entry(key).or_default().push(row);
    }

    let mut names: Vec<String> = keys.to_vec();
    let mut outputs: Vec<Vec<Value>> = vec![Vec::with_capacity(groups.len()); keys.len()];
    for key in groups.keys() {
        for (slot, part) in outputs.iter_mut().zip(key) {
            slot.push(part.0.clone());
        }
    }

    for spec in aggregations {
        names.push(spec.output_name());
        let values = groups
            .values()
            .map(|rows| match &spec.target_column {
                Some(name) if spec.method == AggregationMethod::Count => table
                    .column(name)
                    .map(|c| Value::Integer(rows.iter().filter(|&&r| !c.values[r].is_null()).count() as i64))
                    .unwrap_or(Value::Null),
                Some(name) => targets.get(name).map(|c| aggregate(c, rows, spec.method)).unwrap_or(Value::Null),
                None => Value::Integer(rows.len() as i64),
            })
            .collect();
        outputs.push(values);
    }

    let columns = dedupe_column_names(names)
        .into_iter()
        .zip(outputs)
        .map(|(name, values)| Column::new(name, values))
        .collect();
    Table::new(columns)
}

fn aggregate(column: &Column, rows: &[usize], method: AggregationMethod) -> Value {
    let present: Vec<&Value> = rows.iter().map(|&r| &column.values[r]).filter(|v| !v.is_null()).collect();

    match method {
        AggregationMethod::Count => Value::Integer(present.len() as i64),
        AggregationMethod::Sum => {
            if column.data_type == DataType::Integer {
                let total = present.iter().try_fold(0i64, |acc, v| match v {
                    Value::Integer(i) => acc.checked_add(*i),
                    _ => None,
                });
                if let Some(total) = total {
                    return Value::Integer(total);
                }
            }
            Value::Float(present.iter().filter_map(|v| v.as_f64()).sum())
        }
        AggregationMethod::Avg => {
            if present.is_empty() {
                Value::Null
            } else {
                let sum: f64 = present.iter().filter_map(|v| v.as_f64()).sum();
                Value::Float(sum / present.len() as f64)
            }
        }
        AggregationMethod::Min => present
            .into_iter()
            .min_by(|a, b| compare_values(a, b))
            .cloned()
            .unwrap_or(Value::Null),
        AggregationMethod::Max => present
            .into_iter()
            .max_by(|a, b| compare_values(a, b))
            .cloned()
            .unwrap_or(Value::Null),
    }
}
