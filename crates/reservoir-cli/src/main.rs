//! Reservoir CLI
//!
//! Command-line interface for Reservoir - pooled table, reading and
//! snapshot storage.

use std::io::IsTerminal;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use tracing::debug;
use tracing_subscriber::EnvFilter;

use reservoir_core::Store;

mod commands;
mod output;

use commands::reading::PurgeBy;
use output::{Output, OutputFormat};

#[derive(Parser)]
#[command(name = "reservoir")]
#[command(about = "Reservoir - pooled storage for tables, readings and snapshots")]
#[command(version)]
#[command(propagate_version = true)]
struct Cli {
    /// Output as JSON
    #[arg(long, global = true)]
    json: bool,

    /// Quiet mode - minimal output
    #[arg(short, long, global = true)]
    quiet: bool,

    /// Increase log verbosity (-v info, -vv debug, -vvv trace)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Use this config file instead of the default location
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show backend, capabilities and pool status
    Status,
    /// Append, fetch, query and purge readings
    Reading {
        #[command(subcommand)]
        command: ReadingCommands,
    },
    /// Generic table operations
    Table {
        #[command(subcommand)]
        command: TableCommands,
    },
    /// Manage table snapshots
    Snapshot {
        #[command(subcommand)]
        command: SnapshotCommands,
    },
    /// Apply schema descriptors
    Schema {
        #[command(subcommand)]
        command: SchemaCommands,
    },
    /// Show or set configuration
    Config {
        #[command(subcommand)]
        command: Option<ConfigCommands>,
    },
}

#[derive(Subcommand)]
enum ReadingCommands {
    /// Append a batch of readings (`{"readings": [...]}`)
    Append {
        /// File holding the batch, or `-` for stdin
        input: String,
    },
    /// Fetch a block of readings in id order
    Fetch {
        /// First reading id to return
        #[arg(long, default_value_t = 1)]
        from: u64,
        /// Maximum number of readings
        #[arg(short = 'n', long, default_value_t = 100)]
        count: u32,
    },
    /// Query readings with a JSON query document
    Query {
        /// Query document, e.g. '{"where": {...}}'
        #[arg(default_value = "{}")]
        query: String,
    },
    /// Purge readings already forwarded
    Purge {
        #[command(flatten)]
        by: PurgeArgs,
        /// Highest reading id already forwarded
        #[arg(long)]
        sent: u64,
    },
}

#[derive(Args)]
#[group(required = true, multiple = false)]
struct PurgeArgs {
    /// Remove readings older than this many hours
    #[arg(long, value_name = "HOURS")]
    age: Option<u64>,
    /// Keep at most this many newest readings
    #[arg(long, value_name = "LIMIT")]
    rows: Option<u64>,
}

impl PurgeArgs {
    fn purge_by(&self) -> Result<PurgeBy> {
        match (self.age, self.rows) {
            (None, Some(limit)) => Ok(PurgeBy::Rows(limit)),
            (Some(hours), None) => Ok(PurgeBy::Age(hours)),
            _ => anyhow::bail!("Specify exactly one of --age or --rows"),
        }
    }
}

#[derive(Subcommand)]
enum TableCommands {
    /// Insert a row or an `{"inserts": [...]}` batch
    Insert {
        /// Table name, optionally `schema.table`
        table: String,
        /// Row document
        payload: String,
        #[arg(long)]
        schema: Option<String>,
    },
    /// Update rows with a `{"values", "where"}` document
    Update {
        table: String,
        payload: String,
        #[arg(long)]
        schema: Option<String>,
    },
    /// Delete rows matching a `{"where"}` condition
    Delete {
        table: String,
        /// Condition document; empty deletes every row
        #[arg(default_value = "")]
        condition: String,
        #[arg(long)]
        schema: Option<String>,
    },
    /// Query a table
    Query {
        table: String,
        #[arg(default_value = "{}")]
        query: String,
        #[arg(long)]
        schema: Option<String>,
    },
}

#[derive(Subcommand)]
enum SnapshotCommands {
    /// Snapshot a table's schema and rows
    Create { table: String, id: String },
    /// Restore a table from a snapshot
    Load { table: String, id: String },
    /// Delete a snapshot
    #[command(alias = "rm")]
    Delete { table: String, id: String },
    /// List a table's snapshots, oldest first
    #[command(alias = "ls")]
    List { table: String },
}

#[derive(Subcommand)]
enum SchemaCommands {
    /// Create or migrate tables from a descriptor
    Apply {
        /// Descriptor file, or `-` for stdin
        input: String,
        /// Require the descriptor to target this schema
        #[arg(long)]
        schema: Option<String>,
    },
}

#[derive(Subcommand, Clone)]
enum ConfigCommands {
    /// Show current configuration
    Show,
    /// Set a configuration value
    Set {
        /// Configuration key (data_dir, backend, default_schema, pool_size, ...)
        key: String,
        /// Configuration value
        value: String,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);
    let output = Output::new(OutputFormat::from_flags(cli.json, cli.quiet));
    let config_path = cli.config.as_deref();

    // Config commands don't need the store
    if let Commands::Config { command } = &cli.command {
        return match command.clone() {
            Some(ConfigCommands::Show) | None => commands::config::show(config_path, &output),
            Some(ConfigCommands::Set { key, value }) => {
                commands::config::set(&key, &value, config_path, &output)
            }
        };
    }

    let config = commands::config::load(config_path)?;
    let store = Store::open(&config)
        .map_err(commands::describe)
        .context("Failed to open store")?;
    debug!("Opened {} store at {:?}", config.backend, config.data_dir);

    let result = match cli.command {
        Commands::Status => commands::status::show(&store, &config, &output),
        Commands::Reading { command } => handle_reading_command(command, &store, &output),
        Commands::Table { command } => handle_table_command(command, &store, &output),
        Commands::Snapshot { command } => handle_snapshot_command(command, &store, &output),
        Commands::Schema { command } => match command {
            SchemaCommands::Apply { input, schema } => {
                commands::schema::apply(&store, &input, schema.as_deref(), &output)
            }
        },
        Commands::Config { .. } => unreachable!(), // Handled above
    };

    store.shutdown();
    result
}

fn handle_reading_command(command: ReadingCommands, store: &Store, output: &Output) -> Result<()> {
    match command {
        ReadingCommands::Append { input } => commands::reading::append(store, &input, output),
        ReadingCommands::Fetch { from, count } => {
            commands::reading::fetch(store, from, count, output)
        }
        ReadingCommands::Query { query } => commands::reading::query(store, &query, output),
        ReadingCommands::Purge { by, sent } => {
            commands::reading::purge(store, by.purge_by()?, sent, output)
        }
    }
}

fn handle_table_command(command: TableCommands, store: &Store, output: &Output) -> Result<()> {
    match command {
        TableCommands::Insert {
            table,
            payload,
            schema,
        } => commands::table::insert(store, schema.as_deref(), &table, &payload, output),
        TableCommands::Update {
            table,
            payload,
            schema,
        } => commands::table::update(store, schema.as_deref(), &table, &payload, output),
        TableCommands::Delete {
            table,
            condition,
            schema,
        } => commands::table::delete(store, schema.as_deref(), &table, &condition, output),
        TableCommands::Query {
            table,
            query,
            schema,
        } => commands::table::query(store, schema.as_deref(), &table, &query, output),
    }
}

fn handle_snapshot_command(
    command: SnapshotCommands,
    store: &Store,
    output: &Output,
) -> Result<()> {
    match command {
        SnapshotCommands::Create { table, id } => {
            commands::snapshot::create(store, &table, &id, output)
        }
        SnapshotCommands::Load { table, id } => commands::snapshot::load(store, &table, &id, output),
        SnapshotCommands::Delete { table, id } => {
            commands::snapshot::delete(store, &table, &id, output)
        }
        SnapshotCommands::List { table } => commands::snapshot::list(store, &table, output),
    }
}

/// Log to stderr so stdout stays clean for JSON output
///
/// `RUST_LOG` wins when set. Otherwise `RESERVOIR_LOG` sets the level for
/// both crates and `-v` raises it.
fn init_logging(verbose: u8) {
    let log_level = match verbose {
        0 => std::env::var("RESERVOIR_LOG").unwrap_or_else(|_| "warn".to_string()),
        1 => "info".to_string(),
        2 => "debug".to_string(),
        _ => "trace".to_string(),
    };

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!(
            "reservoir_core={},reservoir_cli={}",
            log_level, log_level
        ))
    });

    // Ignore error if already initialized
    let _ = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_ansi(std::io::stderr().is_terminal())
        .with_writer(std::io::stderr)
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_reading_fetch_defaults() {
        let cli = Cli::try_parse_from(["reservoir", "reading", "fetch"]).unwrap();
        match cli.command {
            Commands::Reading {
                command: ReadingCommands::Fetch { from, count },
            } => {
                assert_eq!(from, 1);
                assert_eq!(count, 100);
            }
            _ => panic!("expected reading fetch"),
        }
    }

    #[test]
    fn test_parse_purge_by_rows() {
        let cli = Cli::try_parse_from([
            "reservoir", "reading", "purge", "--rows", "500", "--sent", "42",
        ])
        .unwrap();
        match cli.command {
            Commands::Reading {
                command: ReadingCommands::Purge { by, sent },
            } => {
                assert_eq!(by.purge_by().unwrap(), PurgeBy::Rows(500));
                assert_eq!(sent, 42);
            }
            _ => panic!("expected reading purge"),
        }
    }

    #[test]
    fn test_purge_requires_exactly_one_strategy() {
        assert!(Cli::try_parse_from(["reservoir", "reading", "purge", "--sent", "1"]).is_err());
        assert!(Cli::try_parse_from([
            "reservoir", "reading", "purge", "--age", "1", "--rows", "5", "--sent", "1",
        ])
        .is_err());
        // The watermark is mandatory
        assert!(Cli::try_parse_from(["reservoir", "reading", "purge", "--age", "24"]).is_err());
    }

    #[test]
    fn test_global_flags_after_subcommand() {
        let cli = Cli::try_parse_from([
            "reservoir", "table", "query", "plant.assets", "--json", "-vv",
        ])
        .unwrap();
        assert!(cli.json);
        assert_eq!(cli.verbose, 2);
        match cli.command {
            Commands::Table {
                command: TableCommands::Query { table, query, schema },
            } => {
                assert_eq!(table, "plant.assets");
                assert_eq!(query, "{}");
                assert!(schema.is_none());
            }
            _ => panic!("expected table query"),
        }
    }

    #[test]
    fn test_parse_snapshot_alias() {
        let cli = Cli::try_parse_from(["reservoir", "snapshot", "ls", "assets"]).unwrap();
        assert!(matches!(
            cli.command,
            Commands::Snapshot {
                command: SnapshotCommands::List { .. }
            }
        ));
    }

    #[test]
    fn test_config_without_subcommand() {
        let cli = Cli::try_parse_from(["reservoir", "config"]).unwrap();
        assert!(matches!(cli.command, Commands::Config { command: None }));
    }
}
