//! # rowpress
//!
//! Turns each row of a CSV file into a PDF document and packages the results
//! into a single download.

mod commands;
mod logging;

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(name = "rowpress")]
#[command(about = "Batch document generation from CSV files")]
#[command(version = env!("CARGO_PKG_VERSION"))]
pub struct Cli {
    /// Configuration file path
    #[arg(short, long, global = true, default_value = "rowpress.json")]
    config: PathBuf,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Submit a CSV file and process it
    Run {
        /// Input CSV file (first record is the header)
        #[arg(value_name = "CSV")]
        input: PathBuf,
        /// Return after submitting instead of waiting for the download
        #[arg(long)]
        no_wait: bool,
    },
    /// Continue a paused or interrupted batch
    Resume {
        #[arg(value_name = "BATCH_ID")]
        batch_id: String,
        #[arg(long)]
        no_wait: bool,
    },
    /// Show progress of a batch
    Status {
        #[arg(value_name = "BATCH_ID")]
        batch_id: String,
        /// Also list every row
        #[arg(long)]
        rows: bool,
        /// Print as JSON
        #[arg(long)]
        json: bool,
    },
    /// List recent batches, newest first
    List {
        #[arg(short, long, default_value_t = rowpress::service::DEFAULT_LIST_LIMIT)]
        limit: u32,
    },
    /// Print the location of a batch's download
    Download {
        #[arg(value_name = "BATCH_ID")]
        batch_id: String,
    },
    /// Delete a batch and its files
    Remove {
        #[arg(value_name = "BATCH_ID")]
        batch_id: String,
        /// Remove even if rows are still in flight
        #[arg(long)]
        force: bool,
    },
    /// Delete one row of a batch and its files
    RemoveRow {
        #[arg(value_name = "ROW_JOB_ID")]
        row_job_id: String,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    logging::init(cli.log_json)?;

    let config = rowpress::load_config(&cli.config)
        .with_context(|| format!("failed to load config from {}", cli.config.display()))?;

    match cli.command {
        Commands::Run { input, no_wait } => commands::run(&config, &input, !no_wait),
        Commands::Resume { batch_id, no_wait } => commands::resume(&config, &batch_id, !no_wait),
        Commands::Status {
            batch_id,
            rows,
            json,
        } => commands::status(&config, &batch_id, rows, json),
        Commands::List { limit } => commands::list(&config, limit),
        Commands::Download { batch_id } => commands::download(&config, &batch_id),
        Commands::Remove { batch_id, force } => commands::remove(&config, &batch_id, force),
        Commands::RemoveRow { row_job_id } => commands::remove_row(&config, &row_job_id),
    }
}
