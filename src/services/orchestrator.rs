//! Import job orchestrator
//!
//! A run is one trigger request. It moves through
//! `pending -> downloading -> processing -> completed | partial | failed`:
//!
//! 1. fetch the workbook from the source (failure fails the whole run)
//! 2. decode it, resolve the sheet work list and open one `in_progress`
//!    ImportLog per listed sheet
//! 3. parse sheets with bounded parallelism, results kept in work-list order
//! 4. reconcile sheets oldest first, finishing each sheet's log
//!
//! A failing sheet is recorded in its log and never aborts the run.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use futures::stream::{self, StreamExt};
use parking_lot::{Mutex, RwLock};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::error::ImportError;
use crate::services::entity_builder::build_sheet;
use crate::services::job_history::{JobHistoryService, SheetOutcome, MAX_HISTORY_SIZE};
use crate::services::layout_parser::LayoutParser;
use crate::services::reconciler::Reconciler;
use crate::services::sheet_selector::{select_sheets, SelectedSheet, SheetSelection};
use crate::services::source::{FileId, SpreadsheetSource};
use crate::services::workbook::Workbook;
use crate::types::{
    aggregate_status, ImportLogStatus, ImportLogSummary, ImportRunStatusUpdate,
    ImportStatusResponse, RunStatus, SheetCounts, SheetPayload, TriggerImportRequest,
    TriggerImportResponse,
};

pub const STATUS_SUBJECT_PREFIX: &str = "habitt.import.status";

const NO_SHEETS: &str = "No sheets found for the requested months";

// ==========================================================================
// Status sinks
// ==========================================================================

/// Receives every run status transition
#[async_trait]
pub trait StatusSink: Send + Sync {
    async fn publish(&self, update: &ImportRunStatusUpdate);
}

/// Publishes transitions to `habitt.import.status.<correlation_id>`
pub struct NatsStatusSink {
    client: async_nats::Client,
}

impl NatsStatusSink {
    pub fn new(client: async_nats::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl StatusSink for NatsStatusSink {
    async fn publish(&self, update: &ImportRunStatusUpdate) {
        let subject = format!("{}.{}", STATUS_SUBJECT_PREFIX, update.correlation_id);
        let payload = match serde_json::to_vec(update) {
            Ok(p) => p,
            Err(e) => {
                error!("Failed to serialize status update: {}", e);
                return;
            }
        };
        if let Err(e) = self.client.publish(subject, payload.into()).await {
            warn!("Failed to publish status of run {}: {}", update.correlation_id, e);
        }
    }
}

/// Logs transitions only (CLI runs)
pub struct LogStatusSink;

#[async_trait]
impl StatusSink for LogStatusSink {
    async fn publish(&self, update: &ImportRunStatusUpdate) {
        debug!("Run {} -> {}", update.correlation_id, update.status.as_str());
    }
}

// ==========================================================================
// Run registry
// ==========================================================================

/// Live state of a run known to this process
#[derive(Debug, Clone)]
pub struct RunState {
    pub file_id: String,
    pub status: RunStatus,
    pub total_sheets: u32,
    pub completed: u32,
    pub failed: u32,
    pub error: Option<String>,
    pub started_at: DateTime<Utc>,
}

impl RunState {
    fn new(file_id: &str, status: RunStatus) -> Self {
        Self {
            file_id: file_id.to_string(),
            status,
            total_sheets: 0,
            completed: 0,
            failed: 0,
            error: None,
            started_at: Utc::now(),
        }
    }

    fn pending(&self) -> u32 {
        self.total_sheets.saturating_sub(self.completed + self.failed)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct OrchestratorSettings {
    /// Month window when a request names neither months nor a sheet
    pub default_months: u32,
    /// Sheets parsed at the same time
    pub sheet_concurrency: usize,
    /// Finished runs kept in memory; older ones are answered from the store
    pub retained_runs: usize,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self {
            default_months: 2,
            sheet_concurrency: 2,
            retained_runs: MAX_HISTORY_SIZE,
        }
    }
}

/// Drives import runs and answers status queries
#[derive(Clone)]
pub struct ImportOrchestrator {
    source: Arc<dyn SpreadsheetSource>,
    parser: LayoutParser,
    reconciler: Reconciler,
    sink: Arc<dyn StatusSink>,
    history: JobHistoryService,
    runs: Arc<RwLock<HashMap<Uuid, RunState>>>,
    /// Finished run ids, oldest first
    finished: Arc<Mutex<VecDeque<Uuid>>>,
    settings: OrchestratorSettings,
}

impl ImportOrchestrator {
    pub fn new(
        source: Arc<dyn SpreadsheetSource>,
        parser: LayoutParser,
        reconciler: Reconciler,
        sink: Arc<dyn StatusSink>,
        history: JobHistoryService,
        settings: OrchestratorSettings,
    ) -> Self {
        Self {
            source,
            parser,
            reconciler,
            sink,
            history,
            runs: Arc::new(RwLock::new(HashMap::new())),
            finished: Arc::new(Mutex::new(VecDeque::new())),
            settings,
        }
    }

    pub fn history(&self) -> &JobHistoryService {
        &self.history
    }

    /// Which sheets a request asks for
    pub fn selection_for(&self, request: &TriggerImportRequest) -> SheetSelection {
        if let Some(name) = request.sheet_name.as_deref().filter(|n| !n.trim().is_empty()) {
            return SheetSelection::Named(name.trim().to_string());
        }
        match request.months.unwrap_or(self.settings.default_months) {
            0 => SheetSelection::All,
            n => SheetSelection::LastMonths(n),
        }
    }

    /// Accept a request and run it in the background.
    pub async fn trigger(&self, request: TriggerImportRequest) -> TriggerImportResponse {
        let correlation_id = Uuid::new_v4();

        let file_id: FileId = match request.file_id.parse() {
            Ok(id) => id,
            Err(e) => {
                let message = e.to_string();
                warn!("Rejected import of '{}': {}", request.file_id, message);
                let mut state = RunState::new(&request.file_id, RunStatus::Failed);
                state.error = Some(message.clone());
                self.runs.write().insert(correlation_id, state);
                self.retire(correlation_id);
                return TriggerImportResponse {
                    correlation_id,
                    status: RunStatus::Failed,
                    message,
                };
            }
        };

        let selection = self.selection_for(&request);
        self.register(correlation_id, &file_id);

        let this = self.clone();
        tokio::spawn(async move {
            this.run(correlation_id, file_id, selection, request.refresh)
                .await;
        });

        TriggerImportResponse {
            correlation_id,
            status: RunStatus::Downloading,
            message: "Import started".to_string(),
        }
    }

    /// Run a request in the foreground and return its final status.
    pub async fn run_to_completion(
        &self,
        request: TriggerImportRequest,
    ) -> Result<ImportStatusResponse, ImportError> {
        let file_id: FileId = request.file_id.parse()?;
        let selection = self.selection_for(&request);
        let correlation_id = Uuid::new_v4();

        self.register(correlation_id, &file_id);
        self.run(correlation_id, file_id, selection, request.refresh)
            .await;

        self.status(correlation_id).await?.ok_or_else(|| {
            ImportError::InvalidPayload(format!("run {} vanished", correlation_id))
        })
    }

    /// Mark a run finished and evict the oldest finished runs beyond the cap
    fn retire(&self, correlation_id: Uuid) {
        let evicted: Vec<Uuid> = {
            let mut finished = self.finished.lock();
            finished.push_back(correlation_id);
            let excess = finished.len().saturating_sub(self.settings.retained_runs);
            finished.drain(..excess).collect()
        };
        if !evicted.is_empty() {
            let mut runs = self.runs.write();
            for id in &evicted {
                runs.remove(id);
            }
            debug!("Evicted {} finished runs from memory", evicted.len());
        }
    }

    fn register(&self, correlation_id: Uuid, file_id: &FileId) {
        self.runs.write().insert(
            correlation_id,
            RunState::new(&file_id.to_string(), RunStatus::Pending),
        );
    }

    /// Download, decode and process one run
    pub async fn run(
        &self,
        correlation_id: Uuid,
        file_id: FileId,
        selection: SheetSelection,
        refresh: bool,
    ) -> RunStatus {
        self.set_status(correlation_id, RunStatus::Downloading).await;

        let document = match self.source.fetch(&file_id, refresh).await {
            Ok(doc) => doc,
            Err(e) => return self.fail(correlation_id, e.to_string(), vec![]).await,
        };

        self.set_status(correlation_id, RunStatus::Processing).await;

        let bytes = document.bytes.clone();
        let decoded =
            tokio::task::spawn_blocking(move || Workbook::from_xlsx_bytes(bytes.as_slice())).await;
        let workbook = match decoded {
            Ok(Ok(workbook)) => workbook,
            Ok(Err(e)) => return self.fail(correlation_id, e.to_string(), vec![]).await,
            Err(e) => {
                return self
                    .fail(correlation_id, format!("workbook decoding panicked: {}", e), vec![])
                    .await
            }
        };
        info!(
            "Run {}: '{}' has {} sheets",
            correlation_id,
            document.metadata.name,
            workbook.sheet_names().len()
        );

        self.run_workbook(
            correlation_id,
            Arc::new(workbook),
            &selection,
            Utc::now().date_naive(),
        )
        .await
    }

    /// Process the selected sheets of an already decoded workbook.
    pub async fn run_workbook(
        &self,
        correlation_id: Uuid,
        workbook: Arc<Workbook>,
        selection: &SheetSelection,
        today: NaiveDate,
    ) -> RunStatus {
        let selected = select_sheets(&workbook.sheet_names(), selection, today);
        if selected.is_empty() {
            return self.fail(correlation_id, NO_SHEETS.to_string(), vec![]).await;
        }

        if let Some(state) = self.runs.write().get_mut(&correlation_id) {
            state.total_sheets = selected.len() as u32;
        }
        let log_ids = self.open_sheet_logs(correlation_id, &selected).await;
        self.set_status(correlation_id, RunStatus::Processing).await;
        info!(
            "Run {}: processing {} sheets ({})",
            correlation_id,
            selected.len(),
            selected
                .iter()
                .map(|s| s.name.as_str())
                .collect::<Vec<_>>()
                .join(", ")
        );

        let concurrency = self.settings.sheet_concurrency.max(1);
        let parsed: Vec<(SelectedSheet, Result<(SheetPayload, usize), ImportError>)> =
            stream::iter(selected)
                .map(|sheet| {
                    let workbook = Arc::clone(&workbook);
                    let parser = self.parser.clone();
                    async move {
                        let name = sheet.name.clone();
                        let result = tokio::task::spawn_blocking(move || {
                            parser
                                .parse(&workbook, &name)
                                .map(|report| (build_sheet(&report), report.warnings.len()))
                        })
                        .await
                        .unwrap_or_else(|e| {
                            Err(ImportError::sheet_parse(
                                sheet.name.as_str(),
                                format!("parser panicked: {}", e),
                            ))
                        });
                        (sheet, result)
                    }
                })
                .buffered(concurrency)
                .collect()
                .await;

        let mut outcomes = Vec::with_capacity(parsed.len());
        for ((sheet, result), log_id) in parsed.into_iter().zip(log_ids) {
            let outcome = self
                .reconcile_sheet(correlation_id, &sheet, log_id, result)
                .await;

            if let Some(state) = self.runs.write().get_mut(&correlation_id) {
                if outcome.succeeded {
                    state.completed += 1;
                } else {
                    state.failed += 1;
                }
            }
            outcomes.push(outcome);
        }

        let completed = outcomes.iter().filter(|o| o.succeeded).count() as u32;
        let failed = outcomes.len() as u32 - completed;
        let status = aggregate_status(completed, failed, 0);
        let error = (failed > 0).then(|| {
            format!("{} of {} sheets failed", failed, outcomes.len())
        });

        self.finish(correlation_id, status, error, outcomes).await
    }

    /// Open an `in_progress` log for every listed sheet, in work-list order.
    ///
    /// Persisted logs then describe the whole run even if this process dies
    /// before the last sheet starts.
    async fn open_sheet_logs(
        &self,
        correlation_id: Uuid,
        selected: &[SelectedSheet],
    ) -> Vec<Result<Uuid, String>> {
        let store = self.reconciler.store();
        let mut ids = Vec::with_capacity(selected.len());
        for sheet in selected {
            let id = store
                .create_import_log(Some(correlation_id), sheet.year, sheet.month as i32)
                .await
                .map_err(|e| {
                    error!(
                        "Run {}: cannot create import log for '{}': {}",
                        correlation_id, sheet.name, e
                    );
                    e.to_string()
                });
            ids.push(id);
        }
        ids
    }

    /// Reconcile one parsed sheet and finish its ImportLog
    async fn reconcile_sheet(
        &self,
        correlation_id: Uuid,
        sheet: &SelectedSheet,
        log_id: Result<Uuid, String>,
        parsed: Result<(SheetPayload, usize), ImportError>,
    ) -> SheetOutcome {
        let log_id = match log_id {
            Ok(id) => id,
            Err(message) => return failed_outcome(sheet, message),
        };

        let (payload, warnings) = match parsed {
            Ok(parsed) => parsed,
            Err(e) => {
                warn!("Run {}: sheet '{}' failed: {}", correlation_id, sheet.name, e);
                let outcome = failed_outcome(sheet, e.to_string());
                let message = outcome.error.as_deref();
                self.finish_log(correlation_id, log_id, ImportLogStatus::Failed, message)
                    .await;
                return outcome;
            }
        };

        // A reconcile failure is already recorded on the log
        match self.reconciler.import_reservation_sheet(&payload, log_id).await {
            Ok(summary) => {
                info!(
                    "Run {}: sheet '{}' imported ({} reservations, {} warnings)",
                    correlation_id, sheet.name, summary.reservations, warnings
                );
                self.finish_log(correlation_id, log_id, ImportLogStatus::Completed, None)
                    .await;
                SheetOutcome {
                    sheet_name: sheet.name.clone(),
                    succeeded: true,
                    error: None,
                    reservations: summary.reservations,
                    warnings,
                }
            }
            Err(e) => {
                warn!("Run {}: sheet '{}' failed: {}", correlation_id, sheet.name, e);
                failed_outcome(sheet, e.to_string())
            }
        }
    }

    async fn finish_log(
        &self,
        correlation_id: Uuid,
        log_id: Uuid,
        status: ImportLogStatus,
        error_message: Option<&str>,
    ) {
        if let Err(e) = self
            .reconciler
            .store()
            .finish_import_log(log_id, status, error_message)
            .await
        {
            error!("Run {}: cannot finish import log {}: {}", correlation_id, log_id, e);
        }
    }

    async fn set_status(&self, correlation_id: Uuid, status: RunStatus) {
        if let Some(state) = self.runs.write().get_mut(&correlation_id) {
            state.status = status;
        }
        self.sink
            .publish(&ImportRunStatusUpdate::new(correlation_id, status, None))
            .await;
    }

    async fn fail(
        &self,
        correlation_id: Uuid,
        message: String,
        outcomes: Vec<SheetOutcome>,
    ) -> RunStatus {
        error!("Run {} failed: {}", correlation_id, message);
        self.finish(correlation_id, RunStatus::Failed, Some(message), outcomes)
            .await
    }

    async fn finish(
        &self,
        correlation_id: Uuid,
        status: RunStatus,
        error: Option<String>,
        outcomes: Vec<SheetOutcome>,
    ) -> RunStatus {
        let snapshot = {
            let mut runs = self.runs.write();
            runs.get_mut(&correlation_id).map(|state| {
                state.status = status;
                state.error = error.clone();
                state.clone()
            })
        };

        self.sink
            .publish(&ImportRunStatusUpdate::new(correlation_id, status, error.clone()))
            .await;

        if let Some(state) = snapshot {
            info!(
                "Run {} finished {}: {}/{} sheets completed",
                correlation_id,
                status.as_str(),
                state.completed,
                state.total_sheets
            );
            self.history.record(
                correlation_id,
                &state.file_id,
                status,
                state.started_at,
                error,
                outcomes,
            );
        }
        self.retire(correlation_id);
        status
    }

    /// Status of a run: live state first, persisted logs after a restart.
    ///
    /// `None` when the correlation id is unknown.
    pub async fn status(
        &self,
        correlation_id: Uuid,
    ) -> Result<Option<ImportStatusResponse>, ImportError> {
        let live = self.runs.read().get(&correlation_id).cloned();
        let logs = self.reconciler.store().import_logs(correlation_id).await?;
        let import_logs = (!logs.is_empty())
            .then(|| logs.iter().map(ImportLogSummary::from).collect::<Vec<_>>());

        if let Some(state) = live {
            return Ok(Some(ImportStatusResponse {
                correlation_id,
                status: state.status,
                total_sheets: state.total_sheets,
                completed_sheets: state.completed,
                failed_sheets: state.failed,
                pending_sheets: state.pending(),
                error: state.error,
                import_logs,
            }));
        }

        if logs.is_empty() {
            return Ok(None);
        }

        let counts = SheetCounts::from_logs(&logs);
        let error = logs
            .iter()
            .find(|l| l.status == ImportLogStatus::Failed)
            .and_then(|l| l.error_message.clone());

        Ok(Some(ImportStatusResponse {
            correlation_id,
            status: counts.aggregate(),
            total_sheets: counts.total(),
            completed_sheets: counts.completed,
            failed_sheets: counts.failed,
            pending_sheets: counts.pending,
            error,
            import_logs,
        }))
    }
}

fn failed_outcome(sheet: &SelectedSheet, message: String) -> SheetOutcome {
    SheetOutcome {
        sheet_name: sheet.name.clone(),
        succeeded: false,
        error: Some(message),
        reservations: 0,
        warnings: 0,
    }
}
