//! CLI argument parsing for the reservation-import-worker binary.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(
    name = "reservation-import-worker",
    about = "Imports the reservation ledger spreadsheet into PostgreSQL"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand)]
pub enum Command {
    /// Start the worker server (default if no subcommand given)
    Serve,
    /// Run database migrations and exit
    Migrate,
    /// Run one import in the foreground and print its final status
    Import {
        /// Drive item id, `<driveId>!<itemId>`
        #[arg(long)]
        file_id: String,
        /// Last N months including the current one (0 = every month sheet)
        #[arg(long)]
        months: Option<u32>,
        /// Import exactly this sheet, e.g. "Mar. 2025"
        #[arg(long)]
        sheet: Option<String>,
        /// Bypass the download cache
        #[arg(long)]
        refresh: bool,
    },
    /// Reconcile a parsed JSON payload (single sheet or `{sheets: [...]}`)
    ImportJson {
        #[arg(long)]
        file: PathBuf,
    },
    /// Queue one report per owner over bookings created since the last pass
    QueueReports,
    /// Email every approved owner report
    SendReports,
    /// Parse a local workbook and print the drafts as JSON, without touching the database
    Parse {
        #[arg(long)]
        file: PathBuf,
        /// Only this sheet; default is every month sheet
        #[arg(long)]
        sheet: Option<String>,
    },
}
