use anyhow::{anyhow, Context};
use clap::Parser;
use std::path::Path;

use crate::cli::{BackendArg, CliArgs, Commands, OutputFormat, OutputFormatter};
use crate::engine::{
    Backend, CleaningPipeline, FilterOperator, FilterPredicate, OperationSpec, QueryRequest, RouteRequest,
    SegmentFilter, TabulaEngine, TransformSpec,
};
use crate::utils::{config::EngineConfig, logging};

/// Main CLI runner that handles command execution
pub struct CliRunner {
    engine: TabulaEngine,
    verbose: bool,
}

impl CliRunner {
    /// Create a runner over an engine built from `config`
    pub fn new(config: EngineConfig, verbose: bool) -> anyhow::Result<Self> {
        let engine = TabulaEngine::new(config)?;
        Ok(Self { engine, verbose })
    }

    pub fn with_engine(engine: TabulaEngine, verbose: bool) -> Self {
        Self { engine, verbose }
    }

    /// Load the configuration file, or the defaults when none is given
    pub fn load_config(path: Option<&Path>) -> anyhow::Result<EngineConfig> {
        match path {
            Some(path) => Ok(EngineConfig::from_file(path)?),
            None => Ok(EngineConfig::default()),
        }
    }

    /// Execute one command and return its formatted output
    pub async fn run(&self, command: Commands, format: &OutputFormat) -> anyhow::Result<String> {
        match command {
            Commands::Preview { source, limit } => {
                let preview = self.engine.preview(&source.require()?, limit).await?;
                self.info(&format!(
                    "{} rows x {} columns, showing {}",
                    preview.total_rows,
                    preview.total_columns,
                    preview.data.len()
                ));
                Ok(match format {
                    OutputFormat::Json => OutputFormatter::format_json(&preview),
                    _ => OutputFormatter::format_rows(
                        &OutputFormatter::rows_from_records(&preview.columns, &preview.data),
                        format,
                    ),
                })
            }

            Commands::Rows { source, start, end } => {
                let source = source.require()?;
                let window = self.engine.rows(&source, start, end).await?;
                self.info(&format!("rows {}..{} of {}", window.start, window.end, window.total_rows));
                Ok(match format {
                    OutputFormat::Json => OutputFormatter::format_json(&window),
                    _ => {
                        let table = self.engine.loader().load(&source, None).await?;
                        OutputFormatter::format_rows(
                            &OutputFormatter::rows_from_records(&table.column_names(), &window.rows),
                            format,
                        )
                    }
                })
            }

            Commands::Query {
                source,
                filters,
                group_by,
                agg_column,
                agg_method,
                sort_by,
                sort_direction,
                limit,
                request,
            } => {
                let request = match request {
                    Some(raw) => serde_json::from_str(&raw).context("Invalid --request JSON")?,
                    None => QueryRequest {
                        filters: filters.iter().map(|f| parse_filter(f)).collect::<anyhow::Result<_>>()?,
                        group_by,
                        agg_column,
                        agg_method: agg_method.map(|m| parse_tag(&m, "aggregation method")).transpose()?,
                        limit,
                        sort_by,
                        sort_direction: sort_direction.map(|d| parse_tag(&d, "sort direction")).transpose()?,
                    },
                };

                let outcome = self.engine.query(&source.require()?, &request).await?;
                for skipped in &outcome.skipped_filters {
                    self.info(&format!("filter on unknown column '{}' skipped", skipped));
                }
                Ok(match format {
                    OutputFormat::Json => OutputFormatter::format_json(&outcome.to_response()),
                    _ => {
                        self.info(&format!("{} rows matched", outcome.total_rows));
                        OutputFormatter::format_rows(&outcome.table.to_row_set(), format)
                    }
                })
            }

            Commands::Profile { source } => {
                let report = self.engine.profile(&source.require()?).await?;
                Ok(OutputFormatter::format_profile(&report, format))
            }

            Commands::Correlate { source } => {
                let report = self.engine.correlation(&source.require()?).await?;
                Ok(OutputFormatter::format_correlation(&report, format))
            }

            Commands::Compare { source, segment1, segment2 } => {
                let first: SegmentFilter = serde_json::from_str(&segment1).context("Invalid --segment1 JSON")?;
                let second: SegmentFilter = serde_json::from_str(&segment2).context("Invalid --segment2 JSON")?;
                let comparison = self.engine.compare(&source.require()?, &first, &second).await?;
                Ok(OutputFormatter::format_comparison(&comparison, format))
            }

            Commands::Clean { source, operations, dry_run } => {
                let operations: Vec<OperationSpec> =
                    serde_json::from_str(&operations).context("Invalid --operations JSON")?;
                let source = source.require()?;

                if dry_run {
                    let table = self.engine.loader().load(&source, None).await?;
                    let outcome = CleaningPipeline::apply(&table, &operations);
                    let mut output = OutputFormatter::format_cleaning(&outcome.report, format);
                    output.push_str(&OutputFormatter::format_rows(&outcome.table.head(20).to_row_set(), format));
                    return Ok(output);
                }

                let report = self.engine.clean(&source, &operations).await?;
                Ok(OutputFormatter::format_cleaning(&report, format))
            }

            Commands::Sql {
                sql,
                backend,
                source,
                source_sql,
                operations,
            } => {
                let operations: TransformSpec = match operations {
                    Some(raw) => serde_json::from_str(&raw).context("Invalid --operations JSON")?,
                    None => TransformSpec::default(),
                };
                let request = RouteRequest {
                    backend: match backend {
                        BackendArg::Embedded => Backend::Embedded,
                        BackendArg::Relational => Backend::Relational,
                        BackendArg::Transform => Backend::Transform,
                    },
                    sql,
                    source: source.descriptor()?,
                    source_sql,
                    operations,
                };
                self.info(&format!("Routing query to {:?} backend", request.backend));

                let rows = self.engine.execute(&request).await?;
                Ok(OutputFormatter::format_rows(&rows, format))
            }
        }
    }

    fn info(&self, message: &str) {
        if self.verbose {
            eprintln!("{}", OutputFormatter::format_info(message));
        }
    }
}

/// Parse `column:operator:value`; the value may itself contain colons
pub fn parse_filter(raw: &str) -> anyhow::Result<FilterPredicate> {
    let mut parts = raw.splitn(3, ':');
    let (Some(column), Some(operator), Some(value)) = (parts.next(), parts.next(), parts.next()) else {
        return Err(anyhow!("Filter '{}' must look like column:operator:value", raw));
    };
    let operator: FilterOperator = parse_tag(operator, "filter operator")?;
    // Numbers and booleans keep their JSON type so `eq` can compare numerically
    let value = serde_json::from_str::<serde_json::Value>(value)
        .ok()
        .filter(|v| v.is_number() || v.is_boolean())
        .unwrap_or_else(|| serde_json::Value::String(value.to_string()));
    Ok(FilterPredicate::new(column, operator, value))
}

fn parse_tag<T: serde::de::DeserializeOwned>(raw: &str, what: &str) -> anyhow::Result<T> {
    serde_json::from_value(serde_json::Value::String(raw.trim().to_ascii_lowercase()))
        .map_err(|_| anyhow!("Unknown {} '{}'", what, raw))
}

/// Main entry point for CLI execution
pub async fn run_cli() -> anyhow::Result<()> {
    let args = CliArgs::parse();

    let config = match CliRunner::load_config(args.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("{}", OutputFormatter::format_error(&e));
            std::process::exit(1);
        }
    };
    logging::init(&config.logging)?;

    let runner = match CliRunner::new(config, args.verbose) {
        Ok(runner) => runner,
        Err(e) => {
            eprintln!("{}", OutputFormatter::format_error(&e));
            std::process::exit(1);
        }
    };

    match runner.run(args.command, &args.format).await {
        Ok(output) => {
            print!("{}", output);
            Ok(())
        }
        Err(e) => {
            eprintln!("{}", OutputFormatter::format_error(&e));
            std::process::exit(1);
        }
    }
}
