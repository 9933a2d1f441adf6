use async_trait::async_trait;
use calamine::{open_workbook_auto, Data, Reader as _};
use csv::{ReaderBuilder, WriterBuilder};
use quick_xml::events::Event;
use quick_xml::Reader as XmlReader;
use rust_xlsxwriter::{Format, Workbook, XlsxError};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::debug;

use crate::connectors::{Connector, ConnectorCapabilities, ConnectorType, SourceDescriptor, SourceFormat};
use crate::utils::{
    error::{CleaningError, DataSourceError, TabulaError, TabulaResult},
    types::{dedupe_column_names, is_null_token, parse_datetime, Column, Table, Value},
};

/// File system connector for CSV, Excel, JSON and XML sources
#[derive(Debug, Clone, Default)]
pub struct FileConnector {
    base_path: Option<PathBuf>,
}

impl FileConnector {
    /// Create a new file connector instance
    pub fn new() -> Self {
        Self { base_path: None }
    }

    /// Resolve relative paths against `base_path`
    pub fn with_base_path(base_path: impl Into<PathBuf>) -> Self {
        Self {
            base_path: Some(base_path.into()),
        }
    }

    fn resolve_path(&self, source: &SourceDescriptor) -> TabulaResult<PathBuf> {
        let path = source.path().ok_or_else(|| {
            DataSourceError::Unreachable(format!("{} source requires a file path", source.format))
        })?;

        Ok(match &self.base_path {
            Some(base) if path.is_relative() => base.join(path),
            _ => path.clone(),
        })
    }

    /// Parse a file of the given format into a table
    pub fn read_table(path: &Path, format: SourceFormat) -> TabulaResult<Table> {
        if !path.exists() {
            return Err(DataSourceError::Unreachable(format!("File not found: {}", path.display())).into());
        }
        if !path.is_file() {
            return Err(DataSourceError::Unreachable(format!("Path is not a file: {}", path.display())).into());
        }

        match format {
            SourceFormat::Csv => {
                let bytes = read_bytes(path)?;
                parse_csv(&bytes)
            }
            SourceFormat::Json => {
                let bytes = read_bytes(path)?;
                let text = String::from_utf8(bytes)
                    .map_err(|e| DataSourceError::Unparsable(format!("JSON is not valid UTF-8: {}", e)))?;
                parse_json(&text)
            }
            SourceFormat::Xml => {
                let bytes = read_bytes(path)?;
                let text = String::from_utf8(bytes)
                    .map_err(|e| DataSourceError::Unparsable(format!("XML is not valid UTF-8: {}", e)))?;
                parse_xml(&text)
            }
            SourceFormat::Excel => parse_excel(path),
            other => Err(DataSourceError::UnsupportedFormat(format!(
                "{} is not a file format",
                other
            ))
            .into()),
        }
    }

    /// Overwrite the origin file with `table`. CSV, JSON and Excel are writable.
    pub async fn write_table(&self, source: &SourceDescriptor, table: Arc<Table>) -> TabulaResult<()> {
        let format = source.format;
        match format {
            SourceFormat::Csv | SourceFormat::Json | SourceFormat::Excel => {}
            SourceFormat::Xml => {
                return Err(CleaningError::PersistenceUnsupported(format.tag().to_string()).into());
            }
            _ => return Err(CleaningError::NotFileBacked(source.to_string()).into()),
        }

        let path = self
            .resolve_path(source)
            .map_err(|_| CleaningError::NotFileBacked(source.to_string()))?;

        tokio::task::spawn_blocking(move || write_file(&path, format, &table))
            .await
            .map_err(|e| TabulaError::Internal(format!("Write task failed: {}", e)))?
    }
}

fn read_bytes(path: &Path) -> TabulaResult<Vec<u8>> {
    fs::read(path).map_err(|e| DataSourceError::Unreachable(format!("Failed to read {}: {}", path.display(), e)).into())
}

/// UTF-8 when valid, Latin-1 otherwise
fn decode_text(bytes: Vec<u8>) -> String {
    match String::from_utf8(bytes) {
        Ok(text) => text,
        Err(err) => err.into_bytes().iter().map(|&b| b as char).collect(),
    }
}

/// Build typed columns from header names and raw string cells
fn columns_from_raw(names: Vec<String>, mut cells: Vec<Vec<Option<String>>>) -> TabulaResult<Table> {
    let names = dedupe_column_names(names);
    cells.resize_with(names.len(), Vec::new);
    let columns = names
        .into_iter()
        .zip(cells)
        .map(|(name, column_cells)| Column::from_raw_strings(name, column_cells))
        .collect();
    Table::new(columns).map_err(|e| DataSourceError::Unparsable(e.to_string()).into())
}

fn parse_csv(bytes: &[u8]) -> TabulaResult<Table> {
    let text = decode_text(bytes.to_vec());
    let mut reader = ReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .from_reader(text.as_bytes());

    let headers = reader
        .headers()
        .map_err(|e| DataSourceError::Unparsable(format!("Failed to read CSV headers: {}", e)))?
        .clone();
    if headers.is_empty() {
        return Err(DataSourceError::Unparsable("No columns to parse from file".to_string()).into());
    }

    let names: Vec<String> = headers
        .iter()
        .enumerate()
        .map(|(i, h)| if h.trim().is_empty() { format!("Unnamed: {}", i) } else { h.to_string() })
        .collect();
    let width = names.len();
    let mut cells: Vec<Vec<Option<String>>> = vec![Vec::new(); width];

    for (line, result) in reader.records().enumerate() {
        let record = result.map_err(|e| DataSourceError::Unparsable(format!("Failed to read CSV record: {}", e)))?;
        if record.len() > width {
            return Err(DataSourceError::Unparsable(format!(
                "Expected {} fields in line {}, saw {}",
                width,
                line + 2,
                record.len()
            ))
            .into());
        }
        for (index, column) in cells.iter_mut().enumerate() {
            column.push(record.get(index).map(str::to_string));
        }
    }

    columns_from_raw(names, cells)
}

fn parse_json(text: &str) -> TabulaResult<Table> {
    match serde_json::from_str::<serde_json::Value>(text) {
        Ok(serde_json::Value::Array(items)) => table_from_records(items),
        Ok(serde_json::Value::Object(object)) => table_from_column_object(object),
        Ok(_) => Err(DataSourceError::Unparsable("JSON must be an array or an object".to_string()).into()),
        Err(_) => parse_json_lines(text),
    }
}

fn parse_json_lines(text: &str) -> TabulaResult<Table> {
    let items = text
        .lines()
        .filter(|line| !line.trim().is_empty())
        .map(serde_json::from_str::<serde_json::Value>)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| DataSourceError::Unparsable(format!("Failed to parse JSON: {}", e)))?;
    table_from_records(items)
}

/// Array of records; columns are the union of keys in first-seen order
fn table_from_records(items: Vec<serde_json::Value>) -> TabulaResult<Table> {
    let mut names: Vec<String> = Vec::new();
    let mut positions: HashMap<String, usize> = HashMap::new();
    let mut buckets: Vec<Vec<Value>> = Vec::new();

    for (row, item) in items.iter().enumerate() {
        match item {
            serde_json::Value::Object(object) => {
                for (key, value) in object {
                    let index = *positions.entry(key.clone()).or_insert_with(|| {
                        names.push(key.clone());
                        buckets.push(vec![Value::Null; row]);
                        names.len() - 1
                    });
                    buckets[index].push(Value::from_json(value));
                }
            }
            scalar => {
                let index = *positions.entry("0".to_string()).or_insert_with(|| {
                    names.push("0".to_string());
                    buckets.push(vec![Value::Null; row]);
                    names.len() - 1
                });
                buckets[index].push(Value::from_json(scalar));
            }
        }
        for bucket in buckets.iter_mut() {
            if bucket.len() < row + 1 {
                bucket.push(Value::Null);
            }
        }
    }

    let columns = names
        .into_iter()
        .zip(buckets)
        .map(|(name, values)| Column::new(name, normalize_text_nulls(values)))
        .collect();
    Table::new(columns).map_err(|e| DataSourceError::Unparsable(e.to_string()).into())
}

/// `{"col": [..]}` or `{"col": {"0": .., "1": ..}}`
fn table_from_column_object(object: serde_json::Map<String, serde_json::Value>) -> TabulaResult<Table> {
    let mut columns = Vec::with_capacity(object.len());
    for (name, values) in object {
        let values: Vec<Value> = match values {
            serde_json::Value::Array(items) => items.iter().map(Value::from_json).collect(),
            serde_json::Value::Object(indexed) => indexed.values().map(Value::from_json).collect(),
            scalar => vec![Value::from_json(&scalar)],
        };
        columns.push(Column::new(name, normalize_text_nulls(values)));
    }
    Table::new(columns).map_err(|e| DataSourceError::Unparsable(format!("Ragged JSON columns: {}", e)).into())
}

fn normalize_text_nulls(values: Vec<Value>) -> Vec<Value> {
    values
        .into_iter()
        .map(|v| match v {
            Value::Text(ref s) if s.is_empty() => Value::Null,
            other => other,
        })
        .collect()
}

/// Children of the root element are rows; attributes and child element text are fields
fn parse_xml(text: &str) -> TabulaResult<Table> {
    let mut reader = XmlReader::from_str(text);
    reader.trim_text(true);

    let mut names: Vec<String> = Vec::new();
    let mut positions: HashMap<String, usize> = HashMap::new();
    let mut rows: Vec<HashMap<usize, String>> = Vec::new();
    let mut depth = 0usize;
    let mut field: Option<usize> = None;

    let mut column_for = |name: String, names: &mut Vec<String>| -> usize {
        *positions.entry(name.clone()).or_insert_with(|| {
            names.push(name);
            names.len() - 1
        })
    };

    loop {
        let event = reader
            .read_event()
            .map_err(|e| DataSourceError::Unparsable(format!("Invalid XML at {}: {}", reader.buffer_position(), e)))?;

        match event {
            Event::Start(element) => {
                depth += 1;
                match depth {
                    2 => {
                        let mut row = HashMap::new();
                        for attribute in element.attributes().flatten() {
                            let key = String::from_utf8_lossy(attribute.key.local_name().as_ref()).to_string();
                            let value = attribute
                                .decode_and_unescape_value(&reader)
                                .map_err(|e| DataSourceError::Unparsable(e.to_string()))?
                                .to_string();
                            row.insert(column_for(key, &mut names), value);
                        }
                        rows.push(row);
                    }
                    3 => {
                        let key = String::from_utf8_lossy(element.local_name().as_ref()).to_string();
                        field = Some(column_for(key, &mut names));
                    }
                    _ => {}
                }
            }
            Event::Empty(element) => match depth + 1 {
                2 => {
                    let mut row = HashMap::new();
                    for attribute in element.attributes().flatten() {
                        let key = String::from_utf8_lossy(attribute.key.local_name().as_ref()).to_string();
                        let value = attribute
                            .decode_and_unescape_value(&reader)
                            .map_err(|e| DataSourceError::Unparsable(e.to_string()))?
                            .to_string();
                        row.insert(column_for(key, &mut names), value);
                    }
                    rows.push(row);
                }
                3 => {
                    let key = String::from_utf8_lossy(element.local_name().as_ref()).to_string();
                    column_for(key, &mut names);
                }
                _ => {}
            },
            Event::Text(content) => {
                if let (3, Some(index), Some(row)) = (depth, field, rows.last_mut()) {
                    let value = content
                        .unescape()
                        .map_err(|e| DataSourceError::Unparsable(e.to_string()))?;
                    row.entry(index).or_default().push_str(&value);
                }
            }
            Event::CData(content) => {
                if let (3, Some(index), Some(row)) = (depth, field, rows.last_mut()) {
                    let value = String::from_utf8_lossy(&content.into_inner()).to_string();
                    row.entry(index).or_default().push_str(&value);
                }
            }
            Event::End(_) => {
                if depth == 3 {
                    field = None;
                }
                depth = depth.saturating_sub(1);
            }
            Event::Eof => break,
            _ => {}
        }
    }

    if names.is_empty() && rows.is_empty() {
        return Err(DataSourceError::Unparsable("XML document has no row elements".to_string()).into());
    }

    let mut cells: Vec<Vec<Option<String>>> = vec![Vec::with_capacity(rows.len()); names.len()];
    for mut row in rows {
        for (index, column) in cells.iter_mut().enumerate() {
            column.push(row.remove(&index));
        }
    }
    columns_from_raw(names, cells)
}

/// First worksheet, first row as header
fn parse_excel(path: &Path) -> TabulaResult<Table> {
    let mut workbook = open_workbook_auto(path)
        .map_err(|e| DataSourceError::Unparsable(format!("Failed to open workbook {}: {}", path.display(), e)))?;

    let range = match workbook.worksheet_range_at(0) {
        Some(range) => range.map_err(|e| DataSourceError::Unparsable(format!("Failed to read worksheet: {}", e)))?,
        None => return Ok(Table::empty()),
    };

    let mut rows = range.rows();
    let Some(header) = rows.next() else {
        return Ok(Table::empty());
    };
    let names: Vec<String> = header
        .iter()
        .enumerate()
        .map(|(i, cell)| match excel_value(cell) {
            Value::Null => format!("Unnamed: {}", i),
            value => value.render(),
        })
        .collect();

    let mut buckets: Vec<Vec<Value>> = vec![Vec::new(); names.len()];
    for row in rows {
        for (index, bucket) in buckets.iter_mut().enumerate() {
            bucket.push(row.get(index).map(excel_value).unwrap_or(Value::Null));
        }
    }

    let columns = dedupe_column_names(names)
        .into_iter()
        .zip(buckets)
        .map(|(name, values)| Column::new(name, integral_floats_as_integers(values)))
        .collect();
    Table::new(columns).map_err(|e| DataSourceError::Unparsable(e.to_string()).into())
}

/// Workbooks store every number as a float; whole-number columns read back as integers
fn integral_floats_as_integers(values: Vec<Value>) -> Vec<Value> {
    let integral = |f: &f64| f.fract() == 0.0 && f.abs() < 9.0e15;
    let all_integral = values.iter().all(|v| match v {
        Value::Float(f) => integral(f),
        Value::Null => true,
        _ => false,
    });
    if !all_integral {
        return values;
    }
    values
        .into_iter()
        .map(|v| match v {
            Value::Float(f) => Value::Integer(f as i64),
            other => other,
        })
        .collect()
}

fn excel_value(cell: &Data) -> Value {
    match cell {
        Data::Int(i) => Value::Integer(*i),
        Data::Float(f) => Value::Float(*f),
        Data::Bool(b) => Value::Boolean(*b),
        Data::String(s) if is_null_token(s) => Value::Null,
        Data::String(s) => Value::Text(s.clone()),
        Data::DateTime(dt) => dt.as_datetime().map(Value::DateTime).unwrap_or(Value::Null),
        Data::DateTimeIso(s) => parse_datetime(s).map(Value::DateTime).unwrap_or_else(|| Value::Text(s.clone())),
        Data::DurationIso(s) => Value::Text(s.clone()),
        Data::Error(_) | Data::Empty => Value::Null,
    }
}

/// Write next to the target and rename over it
fn write_file(path: &Path, format: SourceFormat, table: &Table) -> TabulaResult<()> {
    let staging = path.with_extension(format!("{}.tmp", format.tag()));

    let written = match format {
        SourceFormat::Csv => write_csv(&staging, table),
        SourceFormat::Excel => write_xlsx(&staging, table),
        _ => write_json(&staging, table),
    };
    if let Err(e) = written {
        let _ = fs::remove_file(&staging);
        return Err(e);
    }

    fs::rename(&staging, path).map_err(|e| {
        let _ = fs::remove_file(&staging);
        CleaningError::PersistenceFailed(format!("Failed to replace {}: {}", path.display(), e))
    })?;
    debug!(path = %path.display(), rows = table.row_count(), "Table written to origin");
    Ok(())
}

fn write_csv(path: &Path, table: &Table) -> TabulaResult<()> {
    let failed = |e: csv::Error| CleaningError::PersistenceFailed(format!("Failed to write CSV: {}", e));

    let mut writer = WriterBuilder::new().from_path(path).map_err(failed)?;
    writer.write_record(table.column_names()).map_err(failed)?;
    for index in 0..table.row_count() {
        writer
            .write_record(table.row(index).iter().map(Value::render))
            .map_err(failed)?;
    }
    writer
        .flush()
        .map_err(|e| CleaningError::PersistenceFailed(format!("Failed to flush CSV: {}", e)))?;
    Ok(())
}

fn write_json(path: &Path, table: &Table) -> TabulaResult<()> {
    let file = fs::File::create(path)
        .map_err(|e| CleaningError::PersistenceFailed(format!("Failed to create {}: {}", path.display(), e)))?;
    let writer = std::io::BufWriter::new(file);
    serde_json::to_writer(writer, &table.to_records())
        .map_err(|e| CleaningError::PersistenceFailed(format!("Failed to write JSON: {}", e)))?;
    Ok(())
}

/// Single worksheet, header row first; nulls stay blank
fn write_xlsx(path: &Path, table: &Table) -> TabulaResult<()> {
    let failed = |e: XlsxError| CleaningError::PersistenceFailed(format!("Failed to write workbook: {}", e));

    let mut workbook = Workbook::new();
    let date_format = Format::new().set_num_format("yyyy-mm-dd hh:mm:ss");
    let sheet = workbook.add_worksheet();
    for (col, name) in table.column_names().iter().enumerate() {
        sheet.write_string(0, col as u16, name).map_err(failed)?;
    }
    for (col, column) in table.columns().iter().enumerate() {
        let col = col as u16;
        for (index, value) in column.values.iter().enumerate() {
            let row = index as u32 + 1;
            match value {
                Value::Null => continue,
                Value::Integer(i) => sheet.write_number(row, col, *i as f64),
                Value::Float(f) if !f.is_finite() => continue,
                Value::Float(f) => sheet.write_number(row, col, *f),
                Value::Boolean(b) => sheet.write_boolean(row, col, *b),
                Value::Text(s) => sheet.write_string(row, col, s),
                Value::DateTime(dt) => sheet.write_datetime_with_format(row, col, dt, &date_format),
            }
            .map_err(failed)?;
        }
    }
    workbook.save(path).map_err(failed)?;
    Ok(())
}

#[async_trait]
impl Connector for FileConnector {
    async fn fetch_table(&self, source: &SourceDescriptor) -> TabulaResult<Table> {
        let path = self.resolve_path(source)?;
        let format = source.format;
        debug!(path = %path.display(), format = %format, "Parsing file source");

        tokio::task::spawn_blocking(move || FileConnector::read_table(&path, format))
            .await
            .map_err(|e| TabulaError::Internal(format!("Parse task failed: {}", e)))?
    }

    fn get_connector_type(&self) -> ConnectorType {
        ConnectorType::File
    }

    fn get_capabilities(&self) -> ConnectorCapabilities {
        ConnectorCapabilities {
            supports_sql: false,
            supports_write_back: true,
            supports_pooling: false,
            max_concurrent_queries: None,
        }
    }
}
