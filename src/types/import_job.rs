//! Import run types for the trigger / status interfaces
//!
//! A run is one import request, identified by a correlation id, that fans out
//! into one ImportLog row per processed sheet.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{ImportLog, ImportLogStatus};

// ==========================================================================
// Tests First (TDD)
// ==========================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_status_serializes_snake_case() {
        let json = serde_json::to_string(&RunStatus::InProgress).unwrap();
        assert_eq!(json, "\"in_progress\"");
    }

    #[test]
    fn test_terminal_statuses() {
        assert!(RunStatus::Completed.is_terminal());
        assert!(RunStatus::Partial.is_terminal());
        assert!(RunStatus::Failed.is_terminal());
        assert!(!RunStatus::Pending.is_terminal());
        assert!(!RunStatus::Downloading.is_terminal());
        assert!(!RunStatus::Processing.is_terminal());
        assert!(!RunStatus::InProgress.is_terminal());
    }

    #[test]
    fn test_aggregate_all_completed() {
        assert_eq!(aggregate_status(3, 0, 0), RunStatus::Completed);
    }

    #[test]
    fn test_aggregate_all_failed() {
        assert_eq!(aggregate_status(0, 4, 0), RunStatus::Failed);
    }

    #[test]
    fn test_aggregate_mixed_is_partial() {
        assert_eq!(aggregate_status(3, 2, 0), RunStatus::Partial);
    }

    #[test]
    fn test_aggregate_outstanding_work_is_in_progress() {
        assert_eq!(aggregate_status(1, 1, 1), RunStatus::InProgress);
        assert_eq!(aggregate_status(0, 0, 2), RunStatus::InProgress);
    }

    #[test]
    fn test_aggregate_no_sheets_is_pending() {
        assert_eq!(aggregate_status(0, 0, 0), RunStatus::Pending);
    }

    #[test]
    fn test_trigger_request_months_optional() {
        let req: TriggerImportRequest =
            serde_json::from_str(r#"{"file_id": "2124047165A6F26!493036"}"#).unwrap();
        assert!(req.months.is_none());
        assert!(!req.refresh);
        assert!(req.sheet_name.is_none());
    }

    #[test]
    fn test_status_response_omits_empty_error() {
        let response = ImportStatusResponse {
            correlation_id: Uuid::nil(),
            status: RunStatus::Completed,
            total_sheets: 2,
            completed_sheets: 2,
            failed_sheets: 0,
            pending_sheets: 0,
            error: None,
            import_logs: None,
        };
        let json = serde_json::to_string(&response).unwrap();
        assert!(!json.contains("error"));
        assert!(json.contains("\"total_sheets\":2"));
    }

    #[test]
    fn test_sheet_counts_from_logs() {
        let logs = vec![
            log(ImportLogStatus::Completed),
            log(ImportLogStatus::Failed),
            log(ImportLogStatus::InProgress),
            log(ImportLogStatus::Completed),
        ];
        let counts = SheetCounts::from_logs(&logs);
        assert_eq!(counts.completed, 2);
        assert_eq!(counts.failed, 1);
        assert_eq!(counts.pending, 1);
        assert_eq!(counts.total(), 4);
    }

    fn log(status: ImportLogStatus) -> ImportLog {
        ImportLog {
            id: Uuid::new_v4(),
            correlation_id: Some(Uuid::nil()),
            year: 2025,
            month: 3,
            status,
            error_message: None,
            import_date: chrono::Utc::now(),
        }
    }
}

// ==========================================================================
// Run status
// ==========================================================================

/// Status of an import run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Pending,
    Downloading,
    Processing,
    /// Reported when aggregating persisted logs with sheets still outstanding
    InProgress,
    Completed,
    Partial,
    Failed,
}

impl RunStatus {
    /// Polling clients stop once a terminal status is observed
    pub fn is_terminal(&self) -> bool {
        matches!(self, RunStatus::Completed | RunStatus::Partial | RunStatus::Failed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Pending => "pending",
            RunStatus::Downloading => "downloading",
            RunStatus::Processing => "processing",
            RunStatus::InProgress => "in_progress",
            RunStatus::Completed => "completed",
            RunStatus::Partial => "partial",
            RunStatus::Failed => "failed",
        }
    }
}

/// Per-sheet outcome counts of a run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SheetCounts {
    pub completed: u32,
    pub failed: u32,
    pub pending: u32,
}

impl SheetCounts {
    pub fn from_logs(logs: &[ImportLog]) -> Self {
        let mut counts = SheetCounts::default();
        for log in logs {
            match log.status {
                ImportLogStatus::Completed => counts.completed += 1,
                ImportLogStatus::Failed => counts.failed += 1,
                ImportLogStatus::InProgress => counts.pending += 1,
            }
        }
        counts
    }

    pub fn total(&self) -> u32 {
        self.completed + self.failed + self.pending
    }

    pub fn aggregate(&self) -> RunStatus {
        aggregate_status(self.completed, self.failed, self.pending)
    }
}

/// Aggregate per-sheet outcomes into one run status.
///
/// A mix of success and failure is `partial`, never `completed`.
pub fn aggregate_status(completed: u32, failed: u32, pending: u32) -> RunStatus {
    if pending > 0 {
        RunStatus::InProgress
    } else if completed == 0 && failed == 0 {
        RunStatus::Pending
    } else if failed == 0 {
        RunStatus::Completed
    } else if completed == 0 {
        RunStatus::Failed
    } else {
        RunStatus::Partial
    }
}

// ==========================================================================
// Trigger / status interfaces
// ==========================================================================

/// Request to start an import run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TriggerImportRequest {
    /// `"<driveId>!<itemId>"`
    pub file_id: String,
    /// Last N months including the current one
    #[serde(default)]
    pub months: Option<u32>,
    /// Import exactly this sheet instead of a month window
    #[serde(default)]
    pub sheet_name: Option<String>,
    /// Bypass the source cache
    #[serde(default)]
    pub refresh: bool,
}

/// Response when an import run is accepted
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TriggerImportResponse {
    pub correlation_id: Uuid,
    pub status: RunStatus,
    pub message: String,
}

/// Request for the status of a run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImportStatusRequest {
    pub correlation_id: Uuid,
}

/// Per-sheet log as exposed to polling clients
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImportLogSummary {
    pub id: Uuid,
    pub year: i32,
    pub month: i32,
    pub status: ImportLogStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    pub import_date: chrono::DateTime<chrono::Utc>,
}

impl From<&ImportLog> for ImportLogSummary {
    fn from(log: &ImportLog) -> Self {
        Self {
            id: log.id,
            year: log.year,
            month: log.month,
            status: log.status,
            error_message: log.error_message.clone(),
            import_date: log.import_date,
        }
    }
}

/// Status of a run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImportStatusResponse {
    pub correlation_id: Uuid,
    pub status: RunStatus,
    pub total_sheets: u32,
    pub completed_sheets: u32,
    pub failed_sheets: u32,
    pub pending_sheets: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub import_logs: Option<Vec<ImportLogSummary>>,
}

/// Status update published on every run transition
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImportRunStatusUpdate {
    pub correlation_id: Uuid,
    pub timestamp: chrono::DateTime<chrono::Utc>,
    pub status: RunStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ImportRunStatusUpdate {
    pub fn new(correlation_id: Uuid, status: RunStatus, error: Option<String>) -> Self {
        Self {
            correlation_id,
            timestamp: chrono::Utc::now(),
            status,
            error,
        }
    }
}
