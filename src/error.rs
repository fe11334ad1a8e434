//! Import error taxonomy
//!
//! Domain errors raised by the import pipeline. Application boundaries
//! (main, handlers, CLI) wrap these in `anyhow` like the rest of the worker.

use chrono::NaiveDate;
use thiserror::Error;
use uuid::Uuid;

/// Errors produced while importing the reservation ledger
#[derive(Debug, Error)]
pub enum ImportError {
    /// Download or authentication failure. Fatal to the whole run.
    #[error("source unavailable: {0}")]
    SourceUnavailable(String),

    /// Malformed or unsupported sheet layout. Isolated to that sheet.
    #[error("sheet '{sheet}' could not be parsed: {reason}")]
    SheetParse { sheet: String, reason: String },

    /// Concurrent write conflict that outlived the retry budget.
    #[error("conflicting write on apartment {apartment_id} at {date} after {attempts} attempts")]
    ReconciliationConflict {
        apartment_id: Uuid,
        date: NaiveDate,
        attempts: u32,
    },

    /// Unparseable value in a single cell. The cell is skipped.
    #[error("invalid value at {cell}: {reason}")]
    Validation { cell: String, reason: String },

    /// Payload handed to the bulk import path is unusable.
    #[error("invalid import payload: {0}")]
    InvalidPayload(String),

    #[error("storage error: {0}")]
    Storage(#[from] sqlx::Error),
}

impl ImportError {
    pub fn sheet_parse(sheet: impl Into<String>, reason: impl Into<String>) -> Self {
        ImportError::SheetParse {
            sheet: sheet.into(),
            reason: reason.into(),
        }
    }

    pub fn validation(cell: impl Into<String>, reason: impl Into<String>) -> Self {
        ImportError::Validation {
            cell: cell.into(),
            reason: reason.into(),
        }
    }

    /// Whether the failed operation may succeed when repeated.
    ///
    /// Unique violations, serialization failures and deadlocks surface when two
    /// imports race on the same apartment; the loser retries.
    pub fn is_retryable(&self) -> bool {
        match self {
            ImportError::ReconciliationConflict { .. } => true,
            ImportError::Storage(sqlx::Error::Database(db)) => matches!(
                db.code().as_deref(),
                Some("23505") | Some("40001") | Some("40P01")
            ),
            ImportError::Storage(sqlx::Error::PoolTimedOut) => true,
            ImportError::Storage(sqlx::Error::Io(_)) => true,
            _ => false,
        }
    }
}

/// Spreadsheet-style cell reference, e.g. `(5, 3)` -> `C5`
pub fn cell_ref(row: u32, col: u32) -> String {
    let mut letters = String::new();
    let mut n = col;
    while n > 0 {
        let rem = (n - 1) % 26;
        letters.insert(0, (b'A' + rem as u8) as char);
        n = (n - 1) / 26;
    }
    format!("{}{}", letters, row)
}
