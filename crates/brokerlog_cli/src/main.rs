//! brokerlog CLI
//!
//! Offline tools for a stopped broker's transaction state.
//!
//! # Commands
//!
//! - `inspect` - Log header, record counts and prepared transactions
//! - `dump-log` - Decode and print log records
//! - `verify` - Check the log and the prepared store without changing them

mod commands;

use clap::{Parser, Subcommand};
use commands::OutputFormat;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

/// Tools for broker transaction logs.
#[derive(Parser)]
#[command(name = "brokerlog")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to the broker directory
    #[arg(global = true, short, long)]
    path: Option<PathBuf>,

    /// Enable verbose output
    #[arg(global = true, short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show the log header, record counts and prepared transactions
    Inspect {
        /// List every prepared transaction
        #[arg(short, long)]
        transactions: bool,

        /// Output format
        #[arg(short, long, value_enum, default_value_t = OutputFormat::Text)]
        format: OutputFormat,
    },

    /// Print the records of the transaction log
    DumpLog {
        /// Maximum number of records to print
        #[arg(short, long)]
        limit: Option<usize>,

        /// Output format
        #[arg(short, long, value_enum, default_value_t = OutputFormat::Text)]
        format: OutputFormat,
    },

    /// Check the log and the prepared store for damage
    Verify,

    /// Show version information
    Version,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::Inspect {
            transactions,
            format,
        } => {
            let path = cli.path.ok_or("Broker directory required for inspect")?;
            commands::inspect::run(&path, transactions, format)?;
        }
        Commands::DumpLog { limit, format } => {
            let path = cli.path.ok_or("Broker directory required for dump-log")?;
            commands::dump_log::run(&path, limit, format)?;
        }
        Commands::Verify => {
            let path = cli.path.ok_or("Broker directory required for verify")?;
            commands::verify::run(&path)?;
        }
        Commands::Version => {
            println!("brokerlog CLI v{}", env!("CARGO_PKG_VERSION"));
            println!("brokerlog core v{}", brokerlog_core::VERSION);
            println!("record format {}", brokerlog_core::RECORD_FORMAT_VERSION);
        }
    }

    Ok(())
}
