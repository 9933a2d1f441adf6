use clap::{Args, Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

use crate::connectors::{SourceDescriptor, SourceFormat};
use crate::utils::error::{DataSourceError, TabulaResult};

/// Tabula CLI - profile, query and clean tabular data sources
#[derive(Parser, Debug)]
#[command(name = "tabula")]
#[command(about = "In-process tabular analytics engine")]
#[command(version)]
pub struct CliArgs {
    /// Engine configuration file (JSON)
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Output format
    #[arg(short, long, global = true, default_value = "table")]
    pub format: OutputFormat,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

/// Available CLI commands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Show the first rows and column types of a source
    Preview {
        #[command(flatten)]
        source: SourceArgs,

        /// Number of rows to show
        #[arg(short, long)]
        limit: Option<usize>,
    },

    /// Show rows in [start, end)
    Rows {
        #[command(flatten)]
        source: SourceArgs,

        #[arg(long, default_value_t = 0)]
        start: usize,

        #[arg(long, default_value_t = 100)]
        end: usize,
    },

    /// Filter, group, sort and truncate a source
    Query {
        #[command(flatten)]
        source: SourceArgs,

        /// Filter as column:operator:value (repeatable)
        #[arg(long = "filter", value_name = "COL:OP:VALUE")]
        filters: Vec<String>,

        #[arg(long)]
        group_by: Option<String>,

        #[arg(long)]
        agg_column: Option<String>,

        /// sum, avg, mean, count, min or max
        #[arg(long)]
        agg_method: Option<String>,

        #[arg(long)]
        sort_by: Option<String>,

        /// asc or desc
        #[arg(long)]
        sort_direction: Option<String>,

        #[arg(short, long)]
        limit: Option<usize>,

        /// Full request as JSON; overrides the individual flags
        #[arg(long)]
        request: Option<String>,
    },

    /// Per-column statistics and data quality summary
    Profile {
        #[command(flatten)]
        source: SourceArgs,
    },

    /// Pearson correlation matrix of the numeric columns
    Correlate {
        #[command(flatten)]
        source: SourceArgs,
    },

    /// Compare two filtered segments of a source
    Compare {
        #[command(flatten)]
        source: SourceArgs,

        /// First segment as JSON: {"name": ..., "filters": [...]}
        #[arg(long)]
        segment1: String,

        /// Second segment as JSON
        #[arg(long)]
        segment2: String,
    },

    /// Apply cleaning operations and write the result back to the source
    Clean {
        #[command(flatten)]
        source: SourceArgs,

        /// Operations as a JSON array of {"type": ..., "params": {...}}
        #[arg(long)]
        operations: String,

        /// Print the cleaned rows instead of persisting them
        #[arg(long)]
        dry_run: bool,
    },

    /// Run SQL through the embedded, relational or transform backend
    Sql {
        /// SQL to execute
        #[arg(value_name = "SQL")]
        sql: String,

        #[arg(short, long, default_value = "relational")]
        backend: BackendArg,

        #[command(flatten)]
        source: SourceArgs,

        /// SQL run on the relational backend to produce the embedded table
        #[arg(long)]
        source_sql: Option<String>,

        /// Transform operations as JSON: {"fillna": ..., "drop_duplicates": ..., "groupby": ...}
        #[arg(long)]
        operations: Option<String>,
    },
}

/// How a source is located on the command line
#[derive(Args, Debug, Clone, Default)]
pub struct SourceArgs {
    /// Path to a csv, json, xlsx or xml file
    #[arg(long, conflicts_with_all = ["connection", "mock"])]
    pub file: Option<PathBuf>,

    /// Source type; inferred from the file extension when omitted
    #[arg(long = "type", value_name = "TYPE")]
    pub source_type: Option<String>,

    /// Connection string of a relational source
    #[arg(long, requires = "table_query")]
    pub connection: Option<String>,

    /// Query selecting the relational source's rows
    #[arg(long)]
    pub table_query: Option<String>,

    /// Name of a built-in demo table (users, sales)
    #[arg(long, conflicts_with = "connection")]
    pub mock: Option<String>,
}

impl SourceArgs {
    /// The described source, if any locator flag was given
    pub fn descriptor(&self) -> TabulaResult<Option<SourceDescriptor>> {
        if let Some(path) = &self.file {
            let format: SourceFormat = match &self.source_type {
                Some(tag) => tag.parse()?,
                None => {
                    let extension = path
                        .extension()
                        .and_then(|e| e.to_str())
                        .ok_or_else(|| DataSourceError::UnsupportedFormat(path.display().to_string()))?;
                    extension.parse()?
                }
            };
            return Ok(Some(SourceDescriptor::file(path.clone(), format)));
        }

        if let Some(connection_string) = &self.connection {
            let format: SourceFormat = self.source_type.as_deref().unwrap_or("postgres").parse()?;
            let query = self.table_query.clone().unwrap_or_default();
            return Ok(Some(SourceDescriptor::connection(format, connection_string.clone(), query)));
        }

        Ok(self.mock.as_ref().map(SourceDescriptor::mock))
    }

    /// Like [`SourceArgs::descriptor`] but a missing source is an error
    pub fn require(&self) -> TabulaResult<SourceDescriptor> {
        self.descriptor()?.ok_or_else(|| {
            DataSourceError::Unreachable("no source given; use --file, --connection or --mock".to_string()).into()
        })
    }
}

/// Router backend selection
#[derive(ValueEnum, Debug, Clone, Copy)]
pub enum BackendArg {
    #[value(alias = "duckdb")]
    Embedded,
    #[value(alias = "postgres")]
    Relational,
    #[value(alias = "pandas")]
    Transform,
}

/// Output format options
#[derive(ValueEnum, Debug, Clone)]
pub enum OutputFormat {
    /// Formatted table output
    Table,
    /// JSON output
    Json,
    /// CSV output
    Csv,
}

impl std::fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OutputFormat::Table => write!(f, "table"),
            OutputFormat::Json => write!(f, "json"),
            OutputFormat::Csv => write!(f, "csv"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_command_definition_is_valid() {
        CliArgs::command().debug_assert();
    }

    #[test]
    fn test_parse_query_command() {
        let args = CliArgs::try_parse_from([
            "tabula", "query", "--file", "sales.csv", "--filter", "amount:gt:15", "--group-by", "region",
            "--agg-column", "amount", "--agg-method", "sum", "-f", "json",
        ])
        .unwrap();

        assert!(matches!(args.format, OutputFormat::Json));
        match args.command {
            Commands::Query { source, filters, group_by, .. } => {
                assert_eq!(filters, vec!["amount:gt:15".to_string()]);
                assert_eq!(group_by.as_deref(), Some("region"));
                let descriptor = source.require().unwrap();
                assert_eq!(descriptor.format, SourceFormat::Csv);
            }
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn test_source_type_inference() {
        let excel = SourceArgs {
            file: Some(PathBuf::from("book.xlsx")),
            ..Default::default()
        };
        assert_eq!(excel.require().unwrap().format, SourceFormat::Excel);

        let unknown = SourceArgs {
            file: Some(PathBuf::from("notes.txt")),
            ..Default::default()
        };
        assert!(unknown.require().is_err());

        assert!(SourceArgs::default().descriptor().unwrap().is_none());
        assert!(SourceArgs::default().require().is_err());
    }

    #[test]
    fn test_backend_aliases() {
        let args = CliArgs::try_parse_from(["tabula", "sql", "SELECT * FROM df", "--backend", "duckdb", "--mock", "users"])
            .unwrap();
        match args.command {
            Commands::Sql { backend, .. } => assert!(matches!(backend, BackendArg::Embedded)),
            other => panic!("unexpected command {:?}", other),
        }
    }
}
