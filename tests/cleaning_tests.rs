use std::fs;
use std::sync::Arc;

use rust_xlsxwriter::Workbook;
use serde_json::json;
use tabula_engine::connectors::{SourceDescriptor, SourceFormat};
use tabula_engine::engine::{CleaningPipeline, EngineBuilder, OperationSpec, TabulaEngine};
use tabula_engine::utils::{
    error::{CleaningError, TabulaError},
    types::{Column, DataType, Table, Value},
};
use tempfile::TempDir;

fn engine() -> TabulaEngine {
    EngineBuilder::new().build().expect("engine")
}

#[test]
fn test_fill_na_mean() {
    let table = Table::new(vec![Column::new("x", vec![Value::Integer(1), Value::Null, Value::Integer(3)])])
        .expect("table");

    let outcome = CleaningPipeline::apply(
        &table,
        &[OperationSpec::new("fill_na", json!({"columns": ["x"], "method": "mean"}))],
    );

    let column = outcome.table.column("x").expect("x");
    assert_eq!(column.data_type, DataType::Float);
    assert_eq!(column.values, vec![Value::Float(1.0), Value::Float(2.0), Value::Float(3.0)]);
    assert_eq!(outcome.report.applied, 1);
}

#[test]
fn test_drop_duplicates_is_idempotent() {
    let table = Table::from_rows(
        vec!["a".to_string(), "b".to_string()],
        vec![
            vec![Value::Integer(1), Value::Text("x".to_string())],
            vec![Value::Integer(1), Value::Text("x".to_string())],
            vec![Value::Integer(2), Value::Null],
            vec![Value::Integer(2), Value::Null],
        ],
    )
    .expect("table");
    let operations = [OperationSpec::new("drop_duplicates", json!({}))];

    let once = CleaningPipeline::apply(&table, &operations).table;
    let twice = CleaningPipeline::apply(&once, &operations).table;

    assert_eq!(once.row_count(), 2);
    assert_eq!(once, twice);
    assert_eq!(table.row_count(), 4);
}

#[tokio::test]
async fn test_clean_persists_and_invalidates_cache() {
    let dir = TempDir::new().expect("temp dir");
    let path = dir.path().join("scores.csv");
    fs::write(&path, "id,score\n1,10\n2,\n3,30\n1,10\n").expect("write csv");
    let source = SourceDescriptor::file(&path, SourceFormat::Csv);
    let engine = engine();

    let before = engine.loader().load(&source, None).await.expect("load");
    assert_eq!(before.row_count(), 4);
    assert!(engine.cache().contains(&source.cache_key()));

    let report = engine
        .clean(
            &source,
            &[
                OperationSpec::new("drop_duplicates", json!(null)),
                OperationSpec::new("fill_na", json!({"columns": ["score"], "method": "mean"})),
                OperationSpec::new("explode", json!({})),
            ],
        )
        .await
        .expect("clean");

    assert_eq!(report.applied, 2);
    assert_eq!(report.skipped.len(), 1);
    assert_eq!(report.skipped[0].index, 2);
    assert_eq!(report.to_response().message, "Applied 2 operations");
    assert!(!engine.cache().contains(&source.cache_key()));

    let after = engine.loader().load(&source, None).await.expect("reload");
    assert!(!Arc::ptr_eq(&before, &after));
    assert_eq!(after.row_count(), 3);
    let scores: Vec<Option<f64>> = after.column("score").expect("score").values.iter().map(Value::as_f64).collect();
    assert_eq!(scores, vec![Some(10.0), Some(20.0), Some(30.0)]);
}

#[tokio::test]
async fn test_clean_json_source_round_trips_records() {
    let dir = TempDir::new().expect("temp dir");
    let path = dir.path().join("people.json");
    fs::write(&path, r#"[{"name": "a", "age": 30}, {"name": "b", "age": null}]"#).expect("write json");
    let source = SourceDescriptor::file(&path, SourceFormat::Json);

    let report = engine()
        .clean(&source, &[OperationSpec::new("drop_na", json!({"columns": ["age"]}))])
        .await
        .expect("clean");
    assert_eq!(report.rows_after, 1);

    let written: serde_json::Value = serde_json::from_str(&fs::read_to_string(&path).expect("read back")).expect("json");
    assert_eq!(written, json!([{"name": "a", "age": 30}]));
}

#[tokio::test]
async fn test_clean_keeps_fractional_seconds() {
    let dir = TempDir::new().expect("temp dir");
    let path = dir.path().join("events.csv");
    fs::write(&path, "id,ts\n1,2024-01-01 10:00:00.5\n2,2024-01-01 10:00:00.75\n").expect("write csv");
    let source = SourceDescriptor::file(&path, SourceFormat::Csv);

    engine()
        .clean(&source, &[OperationSpec::new("drop_duplicates", json!({}))])
        .await
        .expect("clean");

    let written = fs::read_to_string(&path).expect("read back");
    assert_eq!(written, "id,ts\n1,2024-01-01 10:00:00.500\n2,2024-01-01 10:00:00.750\n");
}

#[tokio::test]
async fn test_clean_xlsx_source_writes_workbook_back() {
    let dir = TempDir::new().expect("temp dir");
    let path = dir.path().join("book.xlsx");
    let mut workbook = Workbook::new();
    let sheet = workbook.add_worksheet();
    sheet.write_string(0, 0, "city").expect("header");
    sheet.write_string(0, 1, "visits").expect("header");
    for (row, (city, visits)) in [("Oslo", 3.0), ("Lima", 5.0), ("Oslo", 3.0)].into_iter().enumerate() {
        sheet.write_string(row as u32 + 1, 0, city).expect("cell");
        sheet.write_number(row as u32 + 1, 1, visits).expect("cell");
    }
    workbook.save(&path).expect("save workbook");

    let source = SourceDescriptor::file(&path, SourceFormat::Excel);
    let engine = engine();
    assert_eq!(engine.loader().load(&source, None).await.expect("load").row_count(), 3);

    let report = engine
        .clean(
            &source,
            &[
                OperationSpec::new("drop_duplicates", json!({})),
                OperationSpec::new("rename_col", json!({"mapping": {"visits": "count"}})),
            ],
        )
        .await
        .expect("clean");
    assert_eq!(report.applied, 2);
    assert!(!engine.cache().contains(&source.cache_key()));

    let after = engine.loader().load(&source, None).await.expect("reload");
    assert_eq!(after.column_names(), vec!["city", "count"]);
    assert_eq!(
        after.column("city").expect("city").values,
        vec![Value::Text("Oslo".to_string()), Value::Text("Lima".to_string())]
    );
    assert_eq!(after.column("count").expect("count").values, vec![Value::Integer(3), Value::Integer(5)]);
}

#[tokio::test]
async fn test_clean_rejects_sources_without_write_back() {
    let engine = engine();

    let xml = SourceDescriptor::file("rows.xml", SourceFormat::Xml);
    let result = engine.clean(&xml, &[]).await;
    assert!(matches!(
        result,
        Err(TabulaError::Cleaning(CleaningError::PersistenceUnsupported(_)))
    ));

    let relational = SourceDescriptor::connection(SourceFormat::Postgres, "postgres://localhost/db", "SELECT 1");
    let result = engine.clean(&relational, &[]).await;
    assert!(matches!(result, Err(TabulaError::Cleaning(CleaningError::NotFileBacked(_)))));
}
