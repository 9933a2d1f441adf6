use polars::prelude::*;
use serde::{Serialize, Serializer};
use std::collections::HashMap;
use tracing::debug;

use crate::utils::{
    config::StatisticsConfig,
    frame,
    types::{compare_values, Column, DataType, Table, Value, ValueKey},
};

/// Round half away from zero to `places` decimals
pub fn round_to(value: f64, places: i32) -> f64 {
    let factor = 10f64.powi(places);
    (value * factor).round() / factor
}

/// Tukey fence summary for one numeric column
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OutlierBlock {
    pub count: usize,
    pub indices: Vec<usize>,
    pub lower_bound: f64,
    pub upper_bound: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HistogramBin {
    pub bin: String,
    pub count: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ValueCount {
    pub name: String,
    pub count: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum Distribution {
    Histogram(Vec<HistogramBin>),
    TopValues(Vec<ValueCount>),
}

/// Descriptive statistics only computed for numeric columns
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NumericStats {
    pub mean: Option<f64>,
    pub std: Option<f64>,
    pub min: Option<f64>,
    #[serde(rename = "25%")]
    pub p25: Option<f64>,
    #[serde(rename = "50%")]
    pub p50: Option<f64>,
    pub median: Option<f64>,
    #[serde(rename = "75%")]
    pub p75: Option<f64>,
    pub max: Option<f64>,
    pub zeros: usize,
    pub skew: Option<f64>,
    pub kurtosis: Option<f64>,
    pub outliers: Option<OutlierBlock>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ColumnStats {
    #[serde(rename = "type")]
    pub data_type: DataType,
    pub count: usize,
    pub missing: usize,
    pub distinct: usize,
    pub missing_pct: f64,
    pub distinct_pct: f64,
    #[serde(flatten)]
    pub numeric: Option<NumericStats>,
    pub mode: Option<Value>,
    pub distribution: Option<Distribution>,
}

/// Dataset-level quality flags
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DatasetSummary {
    pub high_missing: Vec<String>,
    pub skewed: Vec<String>,
    pub constant: Vec<String>,
    pub duplicate_rows: usize,
    pub duplicate_pct: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatisticsReport {
    pub total_rows: usize,
    pub duplicate_rows: usize,
    #[serde(serialize_with = "serialize_ordered")]
    pub column_stats: Vec<(String, ColumnStats)>,
    /// Human-readable findings, one sentence each
    pub summary: Vec<String>,
    pub quality: DatasetSummary,
}

impl StatisticsReport {
    pub fn column(&self, name: &str) -> Option<&ColumnStats> {
        self.column_stats.iter().find(|(n, _)| n == name).map(|(_, s)| s)
    }
}

fn serialize_ordered<S: Serializer>(entries: &[(String, ColumnStats)], serializer: S) -> Result<S::Ok, S::Error> {
    serializer.collect_map(entries.iter().map(|(k, v)| (k, v)))
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CorrelationCell {
    pub x: String,
    pub y: String,
    pub value: Option<f64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CorrelationReport {
    pub columns: Vec<String>,
    pub matrix: Vec<CorrelationCell>,
}

impl CorrelationReport {
    pub fn get(&self, x: &str, y: &str) -> Option<f64> {
        self.matrix
            .iter()
            .find(|cell| cell.x == x && cell.y == y)
            .and_then(|cell| cell.value)
    }
}

/// Stateless column profiler
#[derive(Debug, Clone, Default)]
pub struct StatisticsEngine {
    config: StatisticsConfig,
}

impl StatisticsEngine {
    pub fn new(config: StatisticsConfig) -> Self {
        Self { config }
    }

    /// Profile every column and derive dataset-level quality flags
    pub fn profile(&self, table: &Table) -> StatisticsReport {
        let total_rows = table.row_count();
        let column_stats: Vec<(String, ColumnStats)> = table
            .columns()
            .iter()
            .map(|column| (column.name.clone(), self.column_stats(column, total_rows)))
            .collect();

        let duplicate_rows = table.duplicate_mask().into_iter().filter(|d| *d).count();
        let (quality, summary) = self.summarize(table, &column_stats, duplicate_rows);
        debug!(rows = total_rows, columns = table.column_count(), "Profiled table");

        StatisticsReport {
            total_rows,
            duplicate_rows,
            column_stats,
            summary,
            quality,
        }
    }

    fn column_stats(&self, column: &Column, total_rows: usize) -> ColumnStats {
        let missing = column.null_count();
        let distinct = frame::to_series(column).drop_nulls().n_unique().unwrap_or(0);
        let pct = |n: usize| {
            if total_rows == 0 {
                0.0
            } else {
                round_to(n as f64 / total_rows as f64 * 100.0, 2)
            }
        };

        let mut stats = ColumnStats {
            data_type: column.data_type,
            count: column.non_null_count(),
            missing,
            distinct,
            missing_pct: pct(missing),
            distinct_pct: pct(distinct),
            numeric: None,
            mode: None,
            distribution: None,
        };

        if column.data_type.is_numeric() {
            let series = frame::numeric_series(column);
            if let Ok(ca) = series.f64() {
                stats.mode = frame::series_mode(&series).ok().flatten();
                stats.numeric = Some(self.numeric_stats(&series, ca));
                stats.distribution = (ca.len() > ca.null_count()).then(|| Distribution::Histogram(self.histogram(ca)));
            }
        } else {
            let (mode, top) = self.value_counts(column);
            stats.mode = mode.map(|v| Value::Text(v.render()));
            stats.distribution = Some(Distribution::TopValues(top));
        }
        stats
    }

    fn numeric_stats(&self, series: &Series, ca: &Float64Chunked) -> NumericStats {
        let n = ca.len() - ca.null_count();
        let quantile = |q: f64| ca.quantile(q, QuantileMethod::Linear).ok().flatten();
        let q1 = quantile(0.25);
        let median = ca.median();
        let q3 = quantile(0.75);
        let (min, max) = (ca.min(), ca.max());
        let constant = matches!((min, max), (Some(lo), Some(hi)) if lo == hi);

        let present = series.drop_nulls();
        let skew = match n {
            0..=2 => None,
            _ if constant => Some(0.0),
            _ => present.skew(false).ok().flatten(),
        };
        let kurtosis = match n {
            0..=3 => None,
            _ if constant => Some(0.0),
            _ => present.kurtosis(true, false).ok().flatten(),
        };

        let outliers = q1.zip(q3).map(|(q1, q3)| {
            let iqr = q3 - q1;
            let lower_bound = q1 - 1.5 * iqr;
            let upper_bound = q3 + 1.5 * iqr;
            let positions: Vec<usize> = ca
                .into_iter()
                .enumerate()
                .filter_map(|(i, v)| v.filter(|x| *x < lower_bound || *x > upper_bound).map(|_| i))
                .collect();
            OutlierBlock {
                count: positions.len(),
                indices: positions.into_iter().take(self.config.outlier_index_cap).collect(),
                lower_bound,
                upper_bound,
            }
        });

        NumericStats {
            mean: ca.mean(),
            std: ca.std(1).filter(|_| n > 1),
            min,
            p25: q1,
            p50: median,
            median,
            p75: q3,
            max,
            zeros: ca.into_iter().flatten().filter(|x| *x == 0.0).count(),
            skew,
            kurtosis,
            outliers,
        }
    }

    fn histogram(&self, ca: &Float64Chunked) -> Vec<HistogramBin> {
        let bins = self.config.histogram_bins.max(1);
        let (Some(mut lo), Some(mut hi)) = (ca.min(), ca.max()) else {
            return Vec::new();
        };
        if lo == hi {
            lo -= 0.5;
            hi += 0.5;
        }
        let width = (hi - lo) / bins as f64;

        let mut counts = vec![0usize; bins];
        for value in ca.into_iter().flatten() {
            let slot = (((value - lo) / width).floor() as usize).min(bins - 1);
            counts[slot] += 1;
        }

        counts
            .into_iter()
            .enumerate()
            .map(|(i, count)| {
                let start = lo + width * i as f64;
                let end = if i + 1 == bins { hi } else { lo + width * (i + 1) as f64 };
                HistogramBin {
                    bin: format!("{:.2}-{:.2}", start, end),
                    count,
                }
            })
            .collect()
    }

    /// Mode and the most frequent values, by count then first appearance
    fn value_counts(&self, column: &Column) -> (Option<Value>, Vec<ValueCount>) {
        let mut order: Vec<&Value> = Vec::new();
        let mut counts: HashMap<ValueKey, usize> = HashMap::new();
        for value in column.values.iter().filter(|v| !v.is_null()) {
            let entry = counts.entry(ValueKey(value.clone())).or_insert(0);
            if *entry == 0 {
                order.push(value);
            }
            *entry += 1;
        }

        let count_of = |v: &Value| counts.get(&ValueKey(v.clone())).copied().unwrap_or(0);
        let mode = order
            .iter()
            .copied()
            .max_by(|a, b| count_of(a).cmp(&count_of(b)).then_with(|| compare_values(b, a)))
            .cloned();

        let mut ranked: Vec<(usize, &Value)> = order.iter().map(|v| (count_of(v), *v)).collect();
        ranked.sort_by(|a, b| b.0.cmp(&a.0));
        let top = ranked
            .into_iter()
            .take(self.config.top_values)
            .map(|(count, value)| ValueCount {
                name: value.render(),
                count,
            })
            .collect();
        (mode, top)
    }

    fn summarize(&self, table: &Table, stats: &[(String, ColumnStats)], duplicate_rows: usize) -> (DatasetSummary, Vec<String>) {
        let total_rows = table.row_count();
        let limit = self.config.summary_name_limit;
        let listed = |names: &[String]| {
            let shown = names.iter().take(limit).cloned().collect::<Vec<_>>().join(", ");
            if names.len() > limit {
                format!("{}...", shown)
            } else {
                shown
            }
        };

        let high_missing: Vec<String> = stats
            .iter()
            .filter(|(_, s)| s.missing_pct > self.config.missing_threshold_pct)
            .map(|(n, _)| n.clone())
            .collect();
        let skewed: Vec<String> = stats
            .iter()
            .filter(|(_, s)| {
                s.numeric
                    .as_ref()
                    .and_then(|n| n.skew)
                    .map_or(false, |skew| skew.abs() > self.config.skew_threshold)
            })
            .map(|(n, _)| n.clone())
            .collect();
        let constant: Vec<String> = stats.iter().filter(|(_, s)| s.distinct == 1).map(|(n, _)| n.clone()).collect();
        let duplicate_pct = if total_rows == 0 {
            0.0
        } else {
            round_to(duplicate_rows as f64 / total_rows as f64 * 100.0, 1)
        };

        let mut messages = vec![format!(
            "Dataset contains {} rows and {} columns.",
            total_rows,
            table.column_count()
        )];
        if !high_missing.is_empty() {
            messages.push(format!(
                "{} columns have >{}% missing values: {}.",
                high_missing.len(),
                self.config.missing_threshold_pct,
                listed(&high_missing)
            ));
        }
        if !skewed.is_empty() {
            messages.push(format!(
                "{} numeric columns are highly skewed (skew > {}): {}.",
                skewed.len(),
                self.config.skew_threshold,
                listed(&skewed)
            ));
        }
        if !constant.is_empty() {
            messages.push(format!(
                "{} columns contain a single constant value: {}.",
                constant.len(),
                listed(&constant)
            ));
        }
        if duplicate_rows > 0 {
            messages.push(format!(
                "Dataset contains {} duplicate rows ({}%).",
                duplicate_rows, duplicate_pct
            ));
        }

        let summary = DatasetSummary {
            high_missing,
            skewed,
            constant,
            duplicate_rows,
            duplicate_pct,
        };
        (summary, messages)
    }

    /// Pairwise-complete Pearson correlation over the numeric columns
    pub fn correlation(&self, table: &Table) -> CorrelationReport {
        let numeric: Vec<&Column> = table.columns().iter().filter(|c| c.data_type.is_numeric()).collect();
        if numeric.is_empty() {
            return CorrelationReport::default();
        }

        let series: Vec<Series> = numeric.iter().map(|c| frame::numeric_series(c)).collect();
        let k = numeric.len();
        let mut grid = vec![vec![None; k]; k];
        for i in 0..k {
            for j in i..k {
                let r = pearson(&series[i], &series[j]).map(|r| round_to(r, 2));
                grid[i][j] = r;
                grid[j][i] = r;
            }
        }

        let columns: Vec<String> = numeric.iter().map(|c| c.name.clone()).collect();
        let mut matrix = Vec::with_capacity(k * k);
        for (i, x) in columns.iter().enumerate() {
            for (j, y) in columns.iter().enumerate() {
                matrix.push(CorrelationCell {
                    x: x.clone(),
                    y: y.clone(),
                    value: grid[i][j],
                });
            }
        }
        CorrelationReport { columns, matrix }
    }
}

/// Pearson r over the rows where both series are present
fn pearson(xs: &Series, ys: &Series) -> Option<f64> {
    let complete = &xs.is_not_null() & &ys.is_not_null();
    let xs = xs.filter(&complete).ok()?;
    let ys = ys.filter(&complete).ok()?;
    if xs.len() < 2 {
        return None;
    }
    let constant = |s: &Series| s.n_unique().map_or(true, |n| n < 2);
    if constant(&xs) || constant(&ys) {
        return None;
    }
    polars::prelude::cov::pearson_corr(xs.f64().ok()?, ys.f64().ok()?)
        .filter(|r| r.is_finite())
        .map(|r| r.clamp(-1.0, 1.0))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn engine() -> StatisticsEngine {
        StatisticsEngine::new(StatisticsConfig::default())
    }

    fn numeric_table(values: Vec<Value>) -> Table {
        Table::new(vec![Column::new("x", values)]).unwrap()
    }

    fn approx(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-9
    }

    #[test]
    fn test_basic_numeric_stats() {
        let table = numeric_table(vec![
            Value::Integer(1),
            Value::Integer(2),
            Value::Integer(3),
            Value::Integer(4),
            Value::Null,
        ]);
        let report = engine().profile(&table);
        let stats = report.column("x").unwrap();
        let numeric = stats.numeric.as_ref().unwrap();

        assert_eq!(stats.count, 4);
        assert_eq!(stats.missing, 1);
        assert_eq!(stats.missing_pct, 20.0);
        assert_eq!(stats.distinct, 4);
        assert_eq!(numeric.mean, Some(2.5));
        assert!(approx(numeric.std.unwrap(), 1.2909944487358056));
        assert_eq!(numeric.p25, Some(1.75));
        assert_eq!(numeric.median, Some(2.5));
        assert_eq!(numeric.p75, Some(3.25));
        assert!(approx(numeric.skew.unwrap(), 0.0));
        assert!(approx(numeric.kurtosis.unwrap(), -1.2));
        assert_eq!(stats.mode, Some(Value::Float(1.0)));
    }

    #[test]
    fn test_outlier_fences() {
        let mut values: Vec<Value> = (1..=9).map(Value::Integer).collect();
        values.push(Value::Integer(100));
        let report = engine().profile(&numeric_table(values));
        let numeric = report.column("x").unwrap().numeric.as_ref().unwrap();
        let outliers = numeric.outliers.as_ref().unwrap();

        let q1 = numeric.p25.unwrap();
        let q3 = numeric.p75.unwrap();
        let iqr = q3 - q1;
        assert!(approx(outliers.lower_bound, q1 - 1.5 * iqr));
        assert!(approx(outliers.upper_bound, q3 + 1.5 * iqr));
        assert_eq!(outliers.count, 1);
        assert_eq!(outliers.indices, vec![9]);
    }

    #[test]
    fn test_outlier_indices_are_capped() {
        let config = StatisticsConfig {
            outlier_index_cap: 2,
            ..Default::default()
        };
        let mut values: Vec<Value> = vec![Value::Integer(0); 20];
        values.extend([Value::Integer(50), Value::Integer(60), Value::Integer(70)]);
        let report = StatisticsEngine::new(config).profile(&numeric_table(values));
        let outliers = report.column("x").unwrap().numeric.as_ref().unwrap().outliers.clone().unwrap();

        assert_eq!(outliers.count, 3);
        assert_eq!(outliers.indices, vec![20, 21]);
    }

    #[test]
    fn test_histogram_bins() {
        let values: Vec<Value> = (0..=10).map(Value::Integer).collect();
        let report = engine().profile(&numeric_table(values));

        match &report.column("x").unwrap().distribution {
            Some(Distribution::Histogram(bins)) => {
                assert_eq!(bins.len(), 10);
                assert_eq!(bins[0].bin, "0.00-1.00");
                assert_eq!(bins[9].count, 2);
                assert_eq!(bins.iter().map(|b| b.count).sum::<usize>(), 11);
            }
            other => panic!("Expected histogram, got {:?}", other),
        }
    }

    #[test]
    fn test_histogram_constant_column() {
        let report = engine().profile(&numeric_table(vec![Value::Float(3.0); 4]));
        match &report.column("x").unwrap().distribution {
            Some(Distribution::Histogram(bins)) => {
                assert_eq!(bins[0].bin, "2.50-2.60");
                assert_eq!(bins.iter().map(|b| b.count).sum::<usize>(), 4);
            }
            other => panic!("Expected histogram, got {:?}", other),
        }
        assert_eq!(report.quality.constant, vec!["x".to_string()]);
    }

    #[test]
    fn test_top_values_and_mode() {
        let table = Table::new(vec![Column::new(
            "city",
            vec![
                Value::Text("Paris".into()),
                Value::Text("Oslo".into()),
                Value::Text("Oslo".into()),
                Value::Text("Lima".into()),
                Value::Text("Paris".into()),
                Value::Null,
            ],
        )])
        .unwrap();
        let report = engine().profile(&table);
        let stats = report.column("city").unwrap();

        assert!(stats.numeric.is_none());
        assert_eq!(stats.mode, Some(Value::Text("Oslo".into())));
        match &stats.distribution {
            Some(Distribution::TopValues(top)) => {
                let names: Vec<&str> = top.iter().map(|v| v.name.as_str()).collect();
                assert_eq!(names, vec!["Paris", "Oslo", "Lima"]);
                assert_eq!(top[0].count, 2);
            }
            other => panic!("Expected top values, got {:?}", other),
        }
    }

    #[test]
    fn test_booleans_are_not_numeric() {
        let table = Table::new(vec![Column::new(
            "flag",
            vec![Value::Boolean(true), Value::Boolean(false), Value::Boolean(true)],
        )])
        .unwrap();
        let report = engine().profile(&table);

        assert!(report.column("flag").unwrap().numeric.is_none());
        assert!(engine().correlation(&table).columns.is_empty());
    }

    #[test]
    fn test_summary_flags_and_duplicates() {
        let table = Table::from_rows(
            vec!["a".into(), "b".into()],
            vec![
                vec![Value::Integer(1), Value::Null],
                vec![Value::Integer(1), Value::Null],
                vec![Value::Integer(1), Value::Text("z".into())],
                vec![Value::Integer(1), Value::Text("z".into())],
            ],
        )
        .unwrap();
        let report = engine().profile(&table);

        assert_eq!(report.duplicate_rows, 2);
        assert_eq!(report.quality.duplicate_pct, 50.0);
        assert_eq!(report.quality.high_missing, vec!["b".to_string()]);
        assert_eq!(report.quality.constant, vec!["a".to_string(), "b".to_string()]);
        assert!(report.summary[0].contains("4 rows and 2 columns"));
        assert!(report.summary.iter().any(|m| m.contains("2 duplicate rows (50%)")));
    }

    #[test]
    fn test_skewed_column_flagged() {
        let values = vec![1, 1, 1, 1, 2, 2, 3, 50].into_iter().map(Value::Integer).collect();
        let report = engine().profile(&numeric_table(values));

        assert!(report.column("x").unwrap().numeric.as_ref().unwrap().skew.unwrap() > 1.0);
        assert_eq!(report.quality.skewed, vec!["x".to_string()]);
    }

    #[test]
    fn test_report_serialization_shape() {
        let table = Table::from_rows(
            vec!["z".into(), "a".into()],
            vec![vec![Value::Integer(1), Value::Text("x".into())]],
        )
        .unwrap();
        let json = serde_json::to_value(engine().profile(&table)).unwrap();

        let keys: Vec<&String> = json["column_stats"].as_object().unwrap().keys().collect();
        assert_eq!(keys, vec!["z", "a"]);
        assert_eq!(json["column_stats"]["z"]["type"], "integer");
        assert!(json["column_stats"]["z"].get("25%").is_some());
        assert_eq!(json["column_stats"]["a"]["distribution"]["type"], "top_values");
        assert!(json["summary"].is_array());
    }

    #[test]
    fn test_correlation_symmetric_with_unit_diagonal() {
        let table = Table::new(vec![
            Column::new("a", vec![Value::Integer(1), Value::Integer(2), Value::Integer(3), Value::Integer(4)]),
            Column::new("b", vec![Value::Float(2.0), Value::Float(4.1), Value::Float(5.9), Value::Float(8.2)]),
            Column::new("c", vec![Value::Integer(4), Value::Integer(1), Value::Integer(3), Value::Null]),
            Column::new("k", vec![Value::Integer(7); 4]),
        ])
        .unwrap();
        let report = engine().correlation(&table);

        assert_eq!(report.matrix.len(), 16);
        for x in &report.columns {
            for y in &report.columns {
                assert_eq!(report.get(x, y), report.get(y, x));
            }
        }
        assert_eq!(report.get("a", "a"), Some(1.0));
        assert_eq!(report.get("c", "c"), Some(1.0));
        assert_eq!(report.get("k", "k"), None);
        assert_eq!(report.get("a", "k"), None);
        assert!(report.get("a", "b").unwrap() > 0.99);
    }

    #[test]
    fn test_round_to() {
        assert_eq!(round_to(1.23456, 2), 1.23);
        assert_eq!(round_to(-50.04, 1), -50.0);
    }
}
