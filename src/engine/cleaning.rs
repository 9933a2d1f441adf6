use polars::prelude::DataType as FrameType;
use polars::prelude::FillNullStrategy;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{info, warn};

use crate::connectors::{FileConnector, SourceDescriptor, SourceFormat};
use crate::engine::loader::Loader;
use crate::utils::{
    error::{CleaningError, TabulaResult},
    frame,
    types::{Column, DataType, Table, Value},
};

/// Wire form of one cleaning step
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperationSpec {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub params: serde_json::Value,
}

impl OperationSpec {
    pub fn new(kind: impl Into<String>, params: serde_json::Value) -> Self {
        Self {
            kind: kind.into(),
            params,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CleaningRequest {
    #[serde(default)]
    pub operations: Vec<OperationSpec>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FillMethod {
    Mean,
    Median,
    Mode,
    Constant,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TargetType {
    Int,
    Float,
    Str,
    #[serde(alias = "datetime")]
    Date,
}

/// A parsed cleaning step
#[derive(Debug, Clone, PartialEq)]
pub enum CleaningOperation {
    DropDuplicates,
    DropNa {
        columns: Vec<String>,
    },
    FillNa {
        columns: Vec<String>,
        method: Option<FillMethod>,
        value: Option<Value>,
    },
    DropCol {
        columns: Vec<String>,
    },
    RenameCol {
        mapping: Vec<(String, String)>,
    },
    ChangeType {
        column: String,
        target: TargetType,
    },
}

#[derive(Deserialize, Default)]
struct ColumnsParams {
    #[serde(default)]
    columns: Vec<String>,
}

#[derive(Deserialize)]
struct FillParams {
    #[serde(default)]
    columns: Vec<String>,
    #[serde(default)]
    method: Option<FillMethod>,
    #[serde(default)]
    value: Option<serde_json::Value>,
}

#[derive(Deserialize)]
struct RenameParams {
    #[serde(alias = "mapper")]
    mapping: serde_json::Map<String, serde_json::Value>,
}

#[derive(Deserialize)]
struct ChangeTypeParams {
    column: String,
    #[serde(rename = "type")]
    target: TargetType,
}

fn params<T: serde::de::DeserializeOwned>(spec: &OperationSpec) -> Result<T, CleaningError> {
    let raw = match &spec.params {
        serde_json::Value::Null => serde_json::Value::Object(serde_json::Map::new()),
        other => other.clone(),
    };
    serde_json::from_value(raw)
        .map_err(|e| CleaningError::InvalidOperation(format!("{}: {}", spec.kind, e)))
}

impl TryFrom<&OperationSpec> for CleaningOperation {
    type Error = CleaningError;

    fn try_from(spec: &OperationSpec) -> Result<Self, Self::Error> {
        match spec.kind.as_str() {
            "drop_duplicates" => Ok(CleaningOperation::DropDuplicates),
            "drop_na" => Ok(CleaningOperation::DropNa {
                columns: params::<ColumnsParams>(spec)?.columns,
            }),
            "fill_na" => {
                let p: FillParams = params(spec)?;
                Ok(CleaningOperation::FillNa {
                    columns: p.columns,
                    method: p.method,
                    value: p.value.as_ref().map(Value::from_json).filter(|v| !v.is_null()),
                })
            }
            "drop_col" => Ok(CleaningOperation::DropCol {
                columns: params::<ColumnsParams>(spec)?.columns,
            }),
            "rename_col" => {
                let p: RenameParams = params(spec)?;
                let mapping = p
                    .mapping
                    .into_iter()
                    .map(|(old, new)| match new {
                        serde_json::Value::String(new) => Ok((old, new)),
                        other => Err(CleaningError::InvalidOperation(format!(
                            "rename_col: new name for '{}' must be a string, got {}",
                            old, other
                        ))),
                    })
                    .collect::<Result<_, _>>()?;
                Ok(CleaningOperation::RenameCol { mapping })
            }
            "change_type" => {
                let p: ChangeTypeParams = params(spec)?;
                Ok(CleaningOperation::ChangeType {
                    column: p.column,
                    target: p.target,
                })
            }
            other => Err(CleaningError::InvalidOperation(format!("Unknown operation type '{}'", other))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SkippedOperation {
    pub index: usize,
    pub kind: String,
    pub reason: String,
}

/// What a batch actually did
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CleaningReport {
    pub applied: usize,
    pub skipped: Vec<SkippedOperation>,
    pub rows_before: usize,
    pub rows_after: usize,
    pub columns_after: Vec<String>,
}

impl CleaningReport {
    pub fn to_response(&self) -> CleaningResponse {
        CleaningResponse {
            status: "success".to_string(),
            message: format!("Applied {} operations", self.applied),
            skipped: self.skipped.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CleaningResponse {
    pub status: String,
    pub message: String,
    pub skipped: Vec<SkippedOperation>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CleaningOutcome {
    pub table: Table,
    pub report: CleaningReport,
}

/// Applies operation batches and writes the result back to the origin file
#[derive(Clone)]
pub struct CleaningPipeline {
    loader: Loader,
    writer: FileConnector,
}

impl CleaningPipeline {
    pub fn new(loader: Loader) -> Self {
        Self::with_writer(loader, FileConnector::new())
    }

    pub fn with_writer(loader: Loader, writer: FileConnector) -> Self {
        Self { loader, writer }
    }

    /// Run `operations` in order over a private copy of `table`
    ///
    /// Operations that fail to parse or to apply are reported and leave the
    /// working table as it was; the rest of the batch still runs.
    pub fn apply(table: &Table, operations: &[OperationSpec]) -> CleaningOutcome {
        let mut current = table.clone();
        let mut report = CleaningReport {
            rows_before: table.row_count(),
            ..Default::default()
        };

        for (index, spec) in operations.iter().enumerate() {
            let result = CleaningOperation::try_from(spec).and_then(|op| apply_operation(&current, &op));
            match result {
                Ok(next) => {
                    current = next;
                    report.applied += 1;
                }
                Err(e) => {
                    warn!(index, kind = %spec.kind, error = %e, "Skipping cleaning operation");
                    report.skipped.push(SkippedOperation {
                        index,
                        kind: spec.kind.clone(),
                        reason: e.to_string(),
                    });
                }
            }
        }

        report.rows_after = current.row_count();
        report.columns_after = current.column_names();
        CleaningOutcome { table: current, report }
    }

    /// Load the full source, clean it, persist it and drop the stale cache entry
    pub async fn clean(&self, source: &SourceDescriptor, operations: &[OperationSpec]) -> TabulaResult<CleaningReport> {
        match source.format {
            SourceFormat::Csv | SourceFormat::Json | SourceFormat::Excel => {}
            SourceFormat::Xml => {
                return Err(CleaningError::PersistenceUnsupported(source.format.tag().to_string()).into());
            }
            _ => return Err(CleaningError::NotFileBacked(source.to_string()).into()),
        }

        let table = self.loader.load(source, None).await?;
        let CleaningOutcome { table, report } = Self::apply(&table, operations);

        self.writer.write_table(source, Arc::new(table)).await?;
        self.loader.invalidate(source);
        info!(
            source = %source,
            applied = report.applied,
            skipped = report.skipped.len(),
            rows = report.rows_after,
            "Cleaned source persisted"
        );
        Ok(report)
    }
}

/// Apply a single parsed operation, returning a new table
pub fn apply_operation(table: &Table, operation: &CleaningOperation) -> Result<Table, CleaningError> {
    match operation {
        CleaningOperation::DropDuplicates => {
            let keep: Vec<usize> = table
                .duplicate_mask()
                .into_iter()
                .enumerate()
                .filter(|(_, duplicate)| !duplicate)
                .map(|(i, _)| i)
                .collect();
            Ok(table.take_rows(&keep))
        }
        CleaningOperation::DropNa { columns } => drop_na(table, columns),
        CleaningOperation::FillNa { columns, method, value } => fill_na(table, columns, *method, value.as_ref()),
        CleaningOperation::DropCol { columns } => {
            let mut next = table.clone();
            next.drop_columns(columns);
            Ok(next)
        }
        CleaningOperation::RenameCol { mapping } => rename(table, mapping),
        CleaningOperation::ChangeType { column, target } => change_type(table, column, *target),
    }
}

fn drop_na(table: &Table, columns: &[String]) -> Result<Table, CleaningError> {
    let subset: Vec<&Column> = if columns.is_empty() {
        table.columns().iter().collect()
    } else {
        columns
            .iter()
            .map(|name| {
                table
                    .column(name)
                    .ok_or_else(|| CleaningError::OperationFailed(format!("Column not found: {}", name)))
            })
            .collect::<Result<_, _>>()?
    };

    let keep: Vec<usize> = (0..table.row_count())
        .filter(|&row| subset.iter().all(|c| !c.values[row].is_null()))
        .collect();
    Ok(table.take_rows(&keep))
}

fn fill_na(table: &Table, columns: &[String], method: Option<FillMethod>, constant: Option<&Value>) -> Result<Table, CleaningError> {
    let targets: Vec<String> = if columns.is_empty() {
        table.column_names()
    } else {
        columns.to_vec()
    };

    let mut next = table.clone();
    for name in targets {
        let Some(index) = next.column_index(&name) else {
            continue;
        };
        let column = &next.columns()[index];
        let numeric = column.data_type.is_numeric();

        let fill = match method {
            Some(FillMethod::Mean) if numeric => frame::numeric_series(column).mean().map(Value::Float),
            Some(FillMethod::Median) if numeric => frame::numeric_series(column).median().map(Value::Float),
            Some(FillMethod::Mode) => frame::mode(column)?,
            _ => None,
        }
        .or_else(|| constant.cloned());

        let Some(fill) = fill else {
            continue;
        };
        let values = column
            .values
            .iter()
            .map(|v| if v.is_null() { fill.clone() } else { v.clone() })
            .collect();
        let filled = Column::new(name.clone(), values);
        next.replace_column(index, filled)
            .map_err(|e| CleaningError::OperationFailed(e.to_string()))?;
    }
    Ok(next)
}

/// Apply the whole mapping at once; only clashes among the final names fail
fn rename(table: &Table, mapping: &[(String, String)]) -> Result<Table, CleaningError> {
    let renamed: Vec<String> = table
        .columns()
        .iter()
        .map(|c| {
            mapping
                .iter()
                .find(|(old, _)| *old == c.name)
                .map_or_else(|| c.name.clone(), |(_, new)| new.clone())
        })
        .collect();

    let mut seen = HashSet::new();
    if let Some(clash) = renamed.iter().find(|name| !seen.insert(name.as_str())) {
        return Err(CleaningError::OperationFailed(format!("Column '{}' already exists", clash)));
    }

    let columns = table
        .columns()
        .iter()
        .zip(renamed)
        .map(|(column, name)| Column {
            name,
            ..column.clone()
        })
        .collect();
    Table::new(columns).map_err(|e| CleaningError::OperationFailed(e.to_string()))
}

fn change_type(table: &Table, name: &str, target: TargetType) -> Result<Table, CleaningError> {
    let index = table
        .column_index(name)
        .ok_or_else(|| CleaningError::OperationFailed(format!("Column not found: {}", name)))?;
    let column = &table.columns()[index];

    let converted = match target {
        TargetType::Int => {
            let source = match column.data_type {
                DataType::Integer => frame::to_series(column),
                _ => frame::numeric_series(column),
            };
            let ints = source
                .fill_null(FillNullStrategy::Zero)?
                .strict_cast(&FrameType::Int64)
                .map_err(|_| {
                    CleaningError::OperationFailed(format!("Values in '{}' do not fit an integer", name))
                })?;
            frame::series_to_column(&ints)?
        }
        TargetType::Float => frame::series_to_column(&frame::numeric_series(column))?,
        TargetType::Str => frame::series_to_column(&frame::text_series(column))?,
        TargetType::Date => Column::new(
            name,
            column
                .values
                .iter()
                .map(|v| v.as_datetime().map(Value::DateTime).unwrap_or(Value::Null))
                .collect(),
        ),
    };

    let mut next = table.clone();
    next.replace_column(index, converted)
        .map_err(|e| CleaningError::OperationFailed(e.to_string()))?;
    Ok(next)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::types::DataType;
    use serde_json::json;

    fn table() -> Table {
        Table::from_rows(
            vec!["id".into(), "score".into(), "city".into()],
            vec![
                vec![Value::Integer(1), Value::Integer(1), Value::Text("Oslo".into())],
                vec![Value::Integer(2), Value::Null, Value::Null],
                vec![Value::Integer(3), Value::Integer(3), Value::Text("Oslo".into())],
                vec![Value::Integer(3), Value::Integer(3), Value::Text("Oslo".into())],
            ],
        )
        .unwrap()
    }

    fn op(kind: &str, params: serde_json::Value) -> OperationSpec {
        OperationSpec::new(kind, params)
    }

    #[test]
    fn test_parse_operations() {
        assert_eq!(
            CleaningOperation::try_from(&op("drop_duplicates", serde_json::Value::Null)).unwrap(),
            CleaningOperation::DropDuplicates
        );
        assert_eq!(
            CleaningOperation::try_from(&op("rename_col", json!({"mapper": {"a": "b"}}))).unwrap(),
            CleaningOperation::RenameCol {
                mapping: vec![("a".to_string(), "b".to_string())]
            }
        );
        assert_eq!(
            CleaningOperation::try_from(&op("change_type", json!({"column": "x", "type": "datetime"}))).unwrap(),
            CleaningOperation::ChangeType {
                column: "x".to_string(),
                target: TargetType::Date
            }
        );
        assert!(CleaningOperation::try_from(&op("explode", json!({}))).is_err());
        assert!(CleaningOperation::try_from(&op("change_type", json!({"column": "x", "type": "uuid"}))).is_err());
    }

    #[test]
    fn test_fill_na_mean() {
        let table = Table::new(vec![Column::new(
            "v",
            vec![Value::Integer(1), Value::Null, Value::Integer(3)],
        )])
        .unwrap();
        let outcome = CleaningPipeline::apply(&table, &[op("fill_na", json!({"method": "mean"}))]);

        assert_eq!(
            outcome.table.columns()[0].values,
            vec![Value::Float(1.0), Value::Float(2.0), Value::Float(3.0)]
        );
        assert_eq!(outcome.report.applied, 1);
    }

    #[test]
    fn test_fill_na_inapplicable_method_falls_back_to_constant() {
        let outcome = CleaningPipeline::apply(
            &table(),
            &[op("fill_na", json!({"columns": ["city", "missing"], "method": "median", "value": "Unknown"}))],
        );

        assert_eq!(outcome.table.column("city").unwrap().values[1], Value::Text("Unknown".into()));
        assert_eq!(outcome.table.column("score").unwrap().values[1], Value::Null);
        assert!(outcome.report.skipped.is_empty());
    }

    #[test]
    fn test_fill_na_mode_and_median() {
        let outcome = CleaningPipeline::apply(
            &table(),
            &[op("fill_na", json!({"columns": ["city"], "method": "mode"})), op("fill_na", json!({"columns": ["score"], "method": "median"}))],
        );

        assert_eq!(outcome.table.column("city").unwrap().values[1], Value::Text("Oslo".into()));
        assert_eq!(outcome.table.column("score").unwrap().values[1], Value::Float(3.0));
    }

    #[test]
    fn test_drop_duplicates_is_idempotent() {
        let once = CleaningPipeline::apply(&table(), &[op("drop_duplicates", json!({}))]).table;
        let twice = CleaningPipeline::apply(&once, &[op("drop_duplicates", json!({}))]).table;

        assert_eq!(once.row_count(), 3);
        assert_eq!(once, twice);
    }

    #[test]
    fn test_drop_na_subset_and_all() {
        let subset = CleaningPipeline::apply(&table(), &[op("drop_na", json!({"columns": ["score"]}))]);
        assert_eq!(subset.table.row_count(), 3);

        let all = CleaningPipeline::apply(&table(), &[op("drop_na", json!({}))]);
        assert_eq!(all.table.column("id").unwrap().values, vec![Value::Integer(1), Value::Integer(3), Value::Integer(3)]);

        let unknown = CleaningPipeline::apply(&table(), &[op("drop_na", json!({"columns": ["nope"]}))]);
        assert_eq!(unknown.report.skipped.len(), 1);
        assert_eq!(unknown.table, table());
    }

    #[test]
    fn test_drop_and_rename_columns() {
        let outcome = CleaningPipeline::apply(
            &table(),
            &[
                op("drop_col", json!({"columns": ["city", "ghost"]})),
                op("rename_col", json!({"mapping": {"score": "points"}})),
            ],
        );
        assert_eq!(outcome.report.columns_after, vec!["id", "points"]);

        let clash = CleaningPipeline::apply(&table(), &[op("rename_col", json!({"mapping": {"score": "id"}}))]);
        assert_eq!(clash.report.skipped[0].kind, "rename_col");
        assert_eq!(clash.table.column_names(), vec!["id", "score", "city"]);
    }

    #[test]
    fn test_rename_applies_mapping_at_once() {
        let swapped = CleaningPipeline::apply(
            &table(),
            &[op("rename_col", json!({"mapping": {"id": "score", "score": "id"}}))],
        );
        assert!(swapped.report.skipped.is_empty());
        assert_eq!(swapped.table.column_names(), vec!["score", "id", "city"]);
        assert_eq!(swapped.table.column("score").unwrap().values[1], Value::Integer(2));
        assert_eq!(swapped.table.column("id").unwrap().values[1], Value::Null);

        let chain = CleaningPipeline::apply(
            &table(),
            &[op("rename_col", json!({"mapping": {"id": "key", "score": "id"}}))],
        );
        assert_eq!(chain.table.column_names(), vec!["key", "id", "city"]);

        let collide = CleaningPipeline::apply(
            &table(),
            &[op("rename_col", json!({"mapping": {"id": "x", "score": "x"}}))],
        );
        assert_eq!(collide.report.skipped.len(), 1);
        assert_eq!(collide.table, table());
    }

    #[test]
    fn test_change_type() {
        let table = Table::new(vec![
            Column::new("raw", vec![Value::Text("1.9".into()), Value::Text("x".into()), Value::Text("-2.5".into())]),
            Column::new("when", vec![Value::Text("2024-01-05".into()), Value::Text("soon".into()), Value::Null]),
        ])
        .unwrap();

        let to_int = CleaningPipeline::apply(&table, &[op("change_type", json!({"column": "raw", "type": "int"}))]);
        assert_eq!(
            to_int.table.column("raw").unwrap().values,
            vec![Value::Integer(1), Value::Integer(0), Value::Integer(-2)]
        );

        let to_float = CleaningPipeline::apply(&table, &[op("change_type", json!({"column": "raw", "type": "float"}))]);
        assert_eq!(to_float.table.column("raw").unwrap().values[1], Value::Null);
        assert_eq!(to_float.table.column("raw").unwrap().data_type, DataType::Float);

        let to_date = CleaningPipeline::apply(&table, &[op("change_type", json!({"column": "when", "type": "date"}))]);
        let when = to_date.table.column("when").unwrap();
        assert_eq!(when.data_type, DataType::DateTime);
        assert_eq!(when.values[1], Value::Null);

        let to_str = CleaningPipeline::apply(&to_int.table, &[op("change_type", json!({"column": "raw", "type": "str"}))]);
        assert_eq!(to_str.table.column("raw").unwrap().values[0], Value::Text("1".into()));
    }

    #[test]
    fn test_change_type_overflow_is_skipped() {
        let table = Table::new(vec![Column::new("big", vec![Value::Float(1e30)])]).unwrap();
        let outcome = CleaningPipeline::apply(&table, &[op("change_type", json!({"column": "big", "type": "int"}))]);

        assert_eq!(outcome.report.applied, 0);
        assert_eq!(outcome.report.skipped[0].index, 0);
        assert_eq!(outcome.table, table);
    }

    #[test]
    fn test_batch_continues_after_failure() {
        let outcome = CleaningPipeline::apply(
            &table(),
            &[
                op("bogus", json!({})),
                op("drop_duplicates", json!({})),
                op("change_type", json!({"column": "ghost", "type": "int"})),
            ],
        );

        assert_eq!(outcome.report.applied, 1);
        let skipped: Vec<usize> = outcome.report.skipped.iter().map(|s| s.index).collect();
        assert_eq!(skipped, vec![0, 2]);
        assert_eq!(outcome.report.rows_before, 4);
        assert_eq!(outcome.report.rows_after, 3);

        let response = serde_json::to_value(outcome.report.to_response()).unwrap();
        assert_eq!(response["status"], "success");
        assert_eq!(response["message"], "Applied 1 operations");
    }

    #[test]
    fn test_apply_never_mutates_input() {
        let original = table();
        let _ = CleaningPipeline::apply(&original, &[op("drop_col", json!({"columns": ["id"]}))]);
        assert_eq!(original, table());
    }
}
