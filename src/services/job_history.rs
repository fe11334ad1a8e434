//! Import run history
//!
//! Keeps the most recent finished runs in memory, optionally mirrored to a
//! JSON file so the list survives worker restarts.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

use crate::types::RunStatus;

pub const MAX_HISTORY_SIZE: usize = 100;

/// Outcome of one sheet within a run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SheetOutcome {
    pub sheet_name: String,
    pub succeeded: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default)]
    pub reservations: usize,
    #[serde(default)]
    pub warnings: usize,
}

/// A finished run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunHistoryEntry {
    pub correlation_id: Uuid,
    pub file_id: String,
    pub status: RunStatus,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    pub duration_ms: u64,
    pub error: Option<String>,
    #[serde(default)]
    pub sheets: Vec<SheetOutcome>,
}

/// Response for listing run history
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunHistoryResponse {
    pub runs: Vec<RunHistoryEntry>,
    pub total: usize,
}

/// Newest-first run history
#[derive(Clone, Default)]
pub struct JobHistoryService {
    history: Arc<RwLock<VecDeque<RunHistoryEntry>>>,
    path: Option<PathBuf>,
}

impl JobHistoryService {
    /// In-memory only
    #[cfg(test)]
    pub fn new() -> Self {
        Self::default()
    }

    /// Backed by `path`, loading whatever it already holds
    pub fn with_file(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let mut deque = VecDeque::with_capacity(MAX_HISTORY_SIZE);
        if let Some(loaded) = Self::load_from_disk(&path) {
            deque.extend(loaded.into_iter().take(MAX_HISTORY_SIZE));
            info!("Loaded {} import runs from {}", deque.len(), path.display());
        }
        Self {
            history: Arc::new(RwLock::new(deque)),
            path: Some(path),
        }
    }

    /// Record a run that reached a terminal status
    pub fn record(
        &self,
        correlation_id: Uuid,
        file_id: &str,
        status: RunStatus,
        started_at: DateTime<Utc>,
        error: Option<String>,
        sheets: Vec<SheetOutcome>,
    ) {
        let completed_at = Utc::now();
        let duration_ms = (completed_at - started_at).num_milliseconds().max(0) as u64;

        self.add_entry(RunHistoryEntry {
            correlation_id,
            file_id: file_id.to_string(),
            status,
            started_at,
            completed_at,
            duration_ms,
            error,
            sheets,
        });
    }

    fn add_entry(&self, entry: RunHistoryEntry) {
        let mut history = self.history.write();
        if history.len() >= MAX_HISTORY_SIZE {
            history.pop_back();
        }
        history.push_front(entry);

        if let Some(path) = &self.path {
            Self::save_to_disk(path, &history);
        }
    }

    pub fn get_recent(&self, limit: usize) -> RunHistoryResponse {
        let history = self.history.read();
        RunHistoryResponse {
            runs: history.iter().take(limit).cloned().collect(),
            total: history.len(),
        }
    }

    pub fn get_by_status(&self, status: RunStatus, limit: usize) -> RunHistoryResponse {
        let history = self.history.read();
        let runs: Vec<RunHistoryEntry> = history
            .iter()
            .filter(|r| r.status == status)
            .take(limit)
            .cloned()
            .collect();
        let total = runs.len();
        RunHistoryResponse { runs, total }
    }

    #[cfg(test)]
    pub fn get(&self, correlation_id: Uuid) -> Option<RunHistoryEntry> {
        self.history
            .read()
            .iter()
            .find(|r| r.correlation_id == correlation_id)
            .cloned()
    }

    fn load_from_disk(path: &Path) -> Option<Vec<RunHistoryEntry>> {
        if !path.exists() {
            return None;
        }
        match std::fs::read_to_string(path) {
            Ok(content) => match serde_json::from_str::<Vec<RunHistoryEntry>>(&content) {
                Ok(entries) => Some(entries),
                Err(e) => {
                    warn!("Failed to parse run history file: {}", e);
                    None
                }
            },
            Err(e) => {
                warn!("Failed to read run history file: {}", e);
                None
            }
        }
    }

    fn save_to_disk(path: &Path, history: &VecDeque<RunHistoryEntry>) {
        if let Some(dir) = path.parent() {
            if let Err(e) = std::fs::create_dir_all(dir) {
                warn!("Failed to create run history directory: {}", e);
                return;
            }
        }
        let entries: Vec<&RunHistoryEntry> = history.iter().collect();
        match serde_json::to_string_pretty(&entries) {
            Ok(json) => {
                if let Err(e) = std::fs::write(path, json) {
                    warn!("Failed to write run history file: {}", e);
                }
            }
            Err(e) => warn!("Failed to serialize run history: {}", e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn outcome(name: &str, ok: bool) -> SheetOutcome {
        SheetOutcome {
            sheet_name: name.to_string(),
            succeeded: ok,
            error: (!ok).then(|| "boom".to_string()),
            reservations: 0,
            warnings: 0,
        }
    }

    #[test]
    fn test_record_and_read_back() {
        let service = JobHistoryService::new();
        let id = Uuid::new_v4();
        let started_at = Utc::now() - chrono::Duration::seconds(5);

        service.record(
            id,
            "d!i",
            RunStatus::Partial,
            started_at,
            None,
            vec![outcome("Feb. 2025", true), outcome("Mar. 2025", false)],
        );

        let history = service.get_recent(10);
        assert_eq!(history.total, 1);
        assert_eq!(history.runs[0].correlation_id, id);
        assert_eq!(history.runs[0].status, RunStatus::Partial);
        assert!(history.runs[0].duration_ms >= 5000);
        assert_eq!(service.get(id).unwrap().sheets.len(), 2);
    }

    #[test]
    fn test_history_is_newest_first_and_bounded() {
        let service = JobHistoryService::new();
        let mut last = Uuid::nil();
        for _ in 0..150 {
            last = Uuid::new_v4();
            service.record(last, "d!i", RunStatus::Completed, Utc::now(), None, vec![]);
        }
        let history = service.get_recent(200);
        assert_eq!(history.runs.len(), MAX_HISTORY_SIZE);
        assert_eq!(history.runs[0].correlation_id, last);
    }

    #[test]
    fn test_filter_by_status() {
        let service = JobHistoryService::new();
        service.record(Uuid::new_v4(), "d!i", RunStatus::Completed, Utc::now(), None, vec![]);
        service.record(
            Uuid::new_v4(),
            "d!i",
            RunStatus::Failed,
            Utc::now(),
            Some("source unavailable".into()),
            vec![],
        );
        service.record(Uuid::new_v4(), "d!i", RunStatus::Completed, Utc::now(), None, vec![]);

        assert_eq!(service.get_by_status(RunStatus::Completed, 10).total, 2);
        assert_eq!(service.get_by_status(RunStatus::Failed, 10).runs[0].error.as_deref(), Some("source unavailable"));
    }

    #[test]
    fn test_file_backed_history_survives_restart() {
        let path = std::env::temp_dir()
            .join(format!("run-history-{}", Uuid::new_v4()))
            .join("history.json");
        let id = Uuid::new_v4();

        JobHistoryService::with_file(&path).record(
            id,
            "d!i",
            RunStatus::Completed,
            Utc::now(),
            None,
            vec![outcome("Mar. 2025", true)],
        );

        let reloaded = JobHistoryService::with_file(&path);
        assert_eq!(reloaded.get(id).unwrap().sheets[0].sheet_name, "Mar. 2025");
        if let Some(dir) = path.parent() {
            std::fs::remove_dir_all(dir).ok();
        }
    }
}
