use colored::*;
use serde::Serialize;

use crate::cli::cli_args::OutputFormat;
use crate::engine::{CleaningReport, CorrelationReport, SegmentComparison, StatisticsReport};
use crate::utils::types::{RowSet, Value};

/// Formats engine results for CLI output
pub struct OutputFormatter;

impl OutputFormatter {
    /// Format a row set according to the specified format
    pub fn format_rows(rows: &RowSet, format: &OutputFormat) -> String {
        match format {
            OutputFormat::Table => Self::format_table(rows),
            OutputFormat::Json => Self::format_json(&Self::records(rows)),
            OutputFormat::Csv => Self::format_csv(rows),
        }
    }

    /// Build a row set from JSON records, keeping `columns` order
    pub fn rows_from_records(columns: &[String], records: &[serde_json::Map<String, serde_json::Value>]) -> RowSet {
        let rows = records
            .iter()
            .map(|record| {
                columns
                    .iter()
                    .map(|c| record.get(c).map(Value::from_json).unwrap_or(Value::Null))
                    .collect()
            })
            .collect();
        RowSet {
            columns: columns.to_vec(),
            rows,
        }
    }

    pub fn format_profile(report: &StatisticsReport, format: &OutputFormat) -> String {
        if let OutputFormat::Json = format {
            return Self::format_json(report);
        }

        let columns = ["column", "type", "count", "missing", "distinct", "mean", "std", "min", "max"]
            .iter()
            .map(|c| c.to_string())
            .collect();
        let rows = report
            .column_stats
            .iter()
            .map(|(name, stats)| {
                let numeric = |pick: fn(&crate::engine::NumericStats) -> Option<f64>| {
                    stats
                        .numeric
                        .as_ref()
                        .and_then(pick)
                        .map(Value::Float)
                        .unwrap_or(Value::Null)
                };
                vec![
                    Value::Text(name.clone()),
                    Value::Text(stats.data_type.name().to_string()),
                    Value::Integer(stats.count as i64),
                    Value::Integer(stats.missing as i64),
                    Value::Integer(stats.distinct as i64),
                    numeric(|n| n.mean),
                    numeric(|n| n.std),
                    numeric(|n| n.min),
                    numeric(|n| n.max),
                ]
            })
            .collect();
        let grid = RowSet { columns, rows };

        match format {
            OutputFormat::Csv => Self::format_csv(&grid),
            _ => {
                let mut output = format!(
                    "{} {} rows, {} duplicate\n",
                    "Profile:".bold(),
                    report.total_rows,
                    report.duplicate_rows
                );
                output.push_str(&Self::format_table(&grid));
                for message in &report.summary {
                    output.push_str(&format!("  {} {}\n", "•".yellow(), message));
                }
                output
            }
        }
    }

    pub fn format_correlation(report: &CorrelationReport, format: &OutputFormat) -> String {
        if let OutputFormat::Json = format {
            return Self::format_json(report);
        }

        let mut columns = vec!["column".to_string()];
        columns.extend(report.columns.iter().cloned());
        let rows = report
            .columns
            .iter()
            .map(|x| {
                let mut row = vec![Value::Text(x.clone())];
                row.extend(
                    report
                        .columns
                        .iter()
                        .map(|y| report.get(x, y).map(Value::Float).unwrap_or(Value::Null)),
                );
                row
            })
            .collect();
        let grid = RowSet { columns, rows };

        match format {
            OutputFormat::Csv => Self::format_csv(&grid),
            _ => Self::format_table(&grid),
        }
    }

    pub fn format_comparison(comparison: &SegmentComparison, format: &OutputFormat) -> String {
        if let OutputFormat::Json = format {
            return Self::format_json(comparison);
        }

        let columns = vec![
            "metric".to_string(),
            comparison.segment1_name.clone(),
            comparison.segment2_name.clone(),
            "diff".to_string(),
            "diff_pct".to_string(),
        ];
        let rows = comparison
            .comparison
            .iter()
            .map(|m| {
                vec![
                    Value::Text(m.metric.clone()),
                    m.seg1.clone(),
                    m.seg2.clone(),
                    m.diff.map(Value::Float).unwrap_or(Value::Null),
                    m.diff_pct.map(Value::Float).unwrap_or(Value::Null),
                ]
            })
            .collect();
        let grid = RowSet { columns, rows };

        match format {
            OutputFormat::Csv => Self::format_csv(&grid),
            _ => Self::format_table(&grid),
        }
    }

    pub fn format_cleaning(report: &CleaningReport, format: &OutputFormat) -> String {
        if let OutputFormat::Json = format {
            return Self::format_json(&report.to_response());
        }

        let mut output = Self::format_success(&format!(
            "Applied {} operations ({} -> {} rows)",
            report.applied, report.rows_before, report.rows_after
        ));
        output.push('\n');
        for skipped in &report.skipped {
            output.push_str(&format!(
                "  {} #{} {}: {}\n",
                "skipped".yellow(),
                skipped.index,
                skipped.kind,
                skipped.reason
            ));
        }
        output
    }

    /// Pretty JSON of any serializable result
    pub fn format_json<T: Serialize + ?Sized>(value: &T) -> String {
        serde_json::to_string_pretty(value).unwrap_or_else(|_| "{}".to_string())
    }

    fn records(rows: &RowSet) -> Vec<serde_json::Map<String, serde_json::Value>> {
        rows.rows
            .iter()
            .map(|row| {
                rows.columns
                    .iter()
                    .cloned()
                    .zip(row.iter().map(Value::to_json))
                    .collect()
            })
            .collect()
    }

    /// Format rows as a colored table
    fn format_table(rows: &RowSet) -> String {
        if rows.is_empty() {
            return format!("{}\n", "No results found.".dimmed());
        }

        let mut col_widths: Vec<usize> = rows.columns.iter().map(|c| c.chars().count().max(8)).collect();
        for row in &rows.rows {
            for (i, value) in row.iter().enumerate() {
                if let Some(width) = col_widths.get_mut(i) {
                    *width = (*width).max(Self::value_to_string(value).chars().count());
                }
            }
        }

        let mut output = String::new();
        output.push_str(&Self::format_table_separator(&col_widths, true));
        output.push('|');
        for (i, col) in rows.columns.iter().enumerate() {
            output.push_str(&format!(" {} |", Self::pad(col.bold().cyan(), col, col_widths[i])));
        }
        output.push('\n');
        output.push_str(&Self::format_table_separator(&col_widths, false));

        for row in &rows.rows {
            output.push('|');
            for (i, value) in row.iter().enumerate().take(col_widths.len()) {
                let plain = Self::value_to_string(value);
                output.push_str(&format!(" {} |", Self::pad(Self::format_value_colored(value), &plain, col_widths[i])));
            }
            output.push('\n');
        }

        output.push_str(&Self::format_table_separator(&col_widths, true));
        output.push_str(&format!(
            "{} {}\n",
            rows.row_count().to_string().green().bold(),
            if rows.row_count() == 1 { "row" } else { "rows" }
        ));
        output
    }

    // ANSI codes break `{:<width$}`, so pad by the plain text length
    fn pad(colored: ColoredString, plain: &str, width: usize) -> String {
        let fill = width.saturating_sub(plain.chars().count());
        format!("{}{}", colored, " ".repeat(fill))
    }

    fn format_table_separator(col_widths: &[usize], is_border: bool) -> String {
        let edge = if is_border { '+' } else { '|' };
        let mut separator = String::from(edge);
        for &width in col_widths {
            separator.push_str(&"-".repeat(width + 2));
            separator.push(edge);
        }
        separator.push('\n');
        separator
    }

    fn format_csv(rows: &RowSet) -> String {
        let mut writer = csv::Writer::from_writer(Vec::new());
        let written = writer.write_record(&rows.columns).and_then(|_| {
            rows.rows
                .iter()
                .try_for_each(|row| writer.write_record(row.iter().map(Value::render)))
        });
        if let Err(e) = written {
            return Self::format_error(&e);
        }
        writer
            .into_inner()
            .ok()
            .and_then(|bytes| String::from_utf8(bytes).ok())
            .unwrap_or_default()
    }

    fn value_to_string(value: &Value) -> String {
        match value {
            Value::Null => "NULL".to_string(),
            Value::Float(f) => format!("{:.2}", f),
            other => other.render(),
        }
    }

    fn format_value_colored(value: &Value) -> ColoredString {
        match value {
            Value::Text(s) => s.normal(),
            Value::Integer(i) => i.to_string().blue(),
            Value::Float(f) => format!("{:.2}", f).blue(),
            Value::Boolean(true) => "True".green(),
            Value::Boolean(false) => "False".red(),
            Value::DateTime(_) => value.render().yellow(),
            Value::Null => "NULL".dimmed(),
        }
    }

    /// Format error message for CLI display
    pub fn format_error(error: &dyn std::fmt::Display) -> String {
        format!("{} {}", "Error:".red().bold(), error.to_string().red())
    }

    /// Format success message for CLI display
    pub fn format_success(message: &str) -> String {
        format!("{} {}", "Success:".green().bold(), message)
    }

    /// Format info message for CLI display
    pub fn format_info(message: &str) -> String {
        format!("{} {}", "Info:".blue().bold(), message)
    }
}
