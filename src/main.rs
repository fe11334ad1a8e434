//! Reservation import worker
//!
//! Turns the hand-maintained reservation ledger workbook into buildings,
//! apartments, bookings and reservations in PostgreSQL. Serves import
//! requests over NATS, or runs one import from the command line.

mod auth;
mod cli;
mod config;
mod db;
mod error;
mod handlers;
mod services;
mod types;

use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use clap::Parser;
use tracing::{error, info, warn};
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::cli::{Cli, Command};
use crate::config::Config;
use crate::db::queries::PgStore;
use crate::services::continuity::predicate_by_name;
use crate::services::email_sender::{EmailSender, LogEmailSender, ResendEmailSender};
use crate::services::entity_builder::build_sheet;
use crate::services::job_history::JobHistoryService;
use crate::services::layout_parser::LayoutParser;
use crate::services::orchestrator::{
    ImportOrchestrator, LogStatusSink, NatsStatusSink, OrchestratorSettings, StatusSink,
};
use crate::services::owner_reports::OwnerReportService;
use crate::services::reconciler::{Reconciler, RetryPolicy};
use crate::services::reservation_query::ReservationQueryService;
use crate::services::sheet_selector::{select_sheets, SheetSelection};
use crate::services::source::{
    CachedSource, CredentialProvider, GraphDriveSource, LocalFileSource, RefreshTokenProvider,
    SpreadsheetSource, StaticToken,
};
use crate::services::workbook::Workbook;
use crate::types::{ImportPayload, MultiSheetPayload, NamedSheetPayload, TriggerImportRequest};

#[tokio::main]
async fn main() -> Result<()> {
    // Logs directory - use LOGS_DIR env var or default to ../logs (relative to worker)
    let logs_dir = std::env::var("LOGS_DIR").unwrap_or_else(|_| "../logs".to_string());
    std::fs::create_dir_all(&logs_dir).ok();

    // File appender for persistent logs (daily rotation)
    let file_appender = RollingFileAppender::new(Rotation::DAILY, &logs_dir, "import-worker.log");
    let (non_blocking, _guard) = tracing_appender::non_blocking(file_appender);

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG")
                .unwrap_or_else(|_| "info,reservation_import_worker=debug".into()),
        ))
        .with(tracing_subscriber::fmt::layer()) // stdout
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(non_blocking)
                .with_ansi(false),
        ) // file
        .init();

    let cli = Cli::parse();

    // Parsing a local file needs neither configuration nor database
    if let Some(Command::Parse { file, sheet }) = &cli.command {
        return parse_file(file, sheet.as_deref(), &LayoutParser::default());
    }

    let config = Config::from_env()?;
    info!("Configuration loaded");

    let pool = db::create_pool(&config.database_url).await?;
    info!("Connected to PostgreSQL");

    db::run_migrations(&pool).await?;
    db::ensure_color_meanings_synced(&pool).await?;

    let store = Arc::new(PgStore::new(pool));
    let reconciler = Reconciler::new(store.clone())
        .with_rules(config.layout_rules.clone())
        .with_predicate(Arc::from(predicate_by_name(&config.continuity_predicate)))
        .with_retry(RetryPolicy {
            max_retries: config.reconcile_max_retries,
            ..RetryPolicy::default()
        });

    match cli.command {
        Some(Command::Migrate) => {
            info!("Migrations applied, exiting");
            Ok(())
        }
        Some(Command::ImportJson { file }) => {
            let raw = std::fs::read_to_string(&file)
                .with_context(|| format!("cannot read {}", file.display()))?;
            let payload: ImportPayload = serde_json::from_str(&raw).context("invalid payload")?;
            let import_id = reconciler.import_json(&payload).await?;
            println!("{}", serde_json::json!({ "import_id": import_id }));
            Ok(())
        }
        Some(Command::Import {
            file_id,
            months,
            sheet,
            refresh,
        }) => {
            let orchestrator = build_orchestrator(&config, reconciler, Arc::new(LogStatusSink))?;
            let status = orchestrator
                .run_to_completion(TriggerImportRequest {
                    file_id,
                    months,
                    sheet_name: sheet,
                    refresh,
                })
                .await?;
            println!("{}", serde_json::to_string_pretty(&status)?);
            if status.status.is_terminal() && status.failed_sheets == 0 && status.error.is_none() {
                Ok(())
            } else {
                anyhow::bail!("import finished {}", status.status.as_str())
            }
        }
        Some(Command::QueueReports) => {
            let summary = build_reports(&config, store)?.queue_reports(Utc::now()).await?;
            println!("{}", serde_json::to_string_pretty(&summary)?);
            Ok(())
        }
        Some(Command::SendReports) => {
            let summary = build_reports(&config, store)?.send_approved().await?;
            println!("{}", serde_json::to_string_pretty(&summary)?);
            if summary.failed > 0 {
                anyhow::bail!("{} reports could not be sent", summary.failed)
            }
            Ok(())
        }
        Some(Command::Parse { .. }) => Ok(()),
        Some(Command::Serve) | None => serve(config, reconciler).await,
    }
}

async fn serve(config: Config, reconciler: Reconciler) -> Result<()> {
    info!("Starting reservation import worker...");

    // Connect to NATS (supports optional NATS_USER/NATS_PASSWORD auth).
    let nats_client = match (&config.nats_user, &config.nats_password) {
        (Some(user), Some(password)) => {
            async_nats::ConnectOptions::new()
                .user_and_password(user.clone(), password.clone())
                .connect(&config.nats_url)
                .await?
        }
        _ => async_nats::connect(&config.nats_url).await?,
    };
    info!("Connected to NATS at {}", config.nats_url);

    let sink = Arc::new(NatsStatusSink::new(nats_client.clone()));
    let reservations =
        ReservationQueryService::new(Arc::clone(reconciler.store()), config.reservation_query_ttl);
    let orchestrator = build_orchestrator(&config, reconciler, sink)?;
    let ctx = Arc::new(handlers::ImportContext {
        orchestrator,
        reservations,
        jwt_secret: config.jwt_secret.clone(),
    });

    if let Err(e) = handlers::start_handlers(nats_client, ctx).await {
        error!("Handler error: {}", e);
        return Err(e);
    }
    Ok(())
}

fn build_orchestrator(
    config: &Config,
    reconciler: Reconciler,
    sink: Arc<dyn StatusSink>,
) -> Result<ImportOrchestrator> {
    let source = build_source(config)?;
    info!("Spreadsheet source: {}", source.name());

    let history = JobHistoryService::with_file(config.logs_dir.join("import-history.json"));

    Ok(ImportOrchestrator::new(
        source,
        LayoutParser::new(config.layout_rules.clone()),
        reconciler,
        sink,
        history,
        OrchestratorSettings {
            default_months: config.import_default_months,
            sheet_concurrency: config.import_sheet_concurrency,
            ..OrchestratorSettings::default()
        },
    ))
}

/// Resend when an API key is configured, log-only otherwise
fn build_reports(config: &Config, store: Arc<PgStore>) -> Result<OwnerReportService> {
    let sender: Arc<dyn EmailSender> = match &config.resend_api_key {
        Some(key) => {
            let client = reqwest::Client::builder()
                .timeout(std::time::Duration::from_secs(30))
                .build()?;
            Arc::new(ResendEmailSender::new(
                client,
                key.clone(),
                config.email_from_address.clone(),
            ))
        }
        None => {
            warn!("RESEND_API_KEY not set, owner reports are only logged");
            Arc::new(LogEmailSender)
        }
    };
    Ok(OwnerReportService::new(store, sender))
}

/// Local directory when configured, Graph otherwise; cached either way
fn build_source(config: &Config) -> Result<Arc<dyn SpreadsheetSource>> {
    if let Some(dir) = &config.local_source_dir {
        return Ok(Arc::new(CachedSource::new(
            LocalFileSource::new(dir),
            config.source_cache_ttl,
        )));
    }

    let client = reqwest::Client::builder()
        .timeout(std::time::Duration::from_secs(120))
        .build()?;

    let credentials: Arc<dyn CredentialProvider> = match (
        &config.graph_access_token,
        &config.graph_client_id,
        &config.graph_refresh_token,
    ) {
        (_, Some(client_id), Some(refresh_token)) => Arc::new(RefreshTokenProvider::new(
            client.clone(),
            config.graph_token_url.clone(),
            client_id.clone(),
            refresh_token.clone(),
        )),
        (Some(token), _, _) => Arc::new(StaticToken::new(token.clone())),
        _ => anyhow::bail!(
            "No spreadsheet source configured: set LOCAL_SOURCE_DIR, GRAPH_ACCESS_TOKEN, or GRAPH_CLIENT_ID with GRAPH_REFRESH_TOKEN"
        ),
    };
    info!("Graph credentials: {}", credentials.name());

    Ok(Arc::new(CachedSource::new(
        GraphDriveSource::new(&config.graph_base_url, client, credentials),
        config.source_cache_ttl,
    )))
}

/// Print the drafts of a local workbook as a multi-sheet payload
fn parse_file(path: &std::path::Path, sheet: Option<&str>, parser: &LayoutParser) -> Result<()> {
    let bytes = std::fs::read(path).with_context(|| format!("cannot read {}", path.display()))?;
    let workbook = Workbook::from_xlsx_bytes(&bytes)?;

    let selection = match sheet {
        Some(name) => SheetSelection::Named(name.to_string()),
        None => SheetSelection::All,
    };
    let selected = select_sheets(&workbook.sheet_names(), &selection, Utc::now().date_naive());
    if selected.is_empty() {
        anyhow::bail!("No month sheets found in {}", path.display());
    }

    let mut sheets = Vec::with_capacity(selected.len());
    for s in selected {
        match parser.parse(&workbook, &s.name) {
            Ok(report) => {
                for w in &report.warnings {
                    warn!("{} {}: {}", s.name, w.cell, w.message);
                }
                sheets.push(NamedSheetPayload {
                    name: s.name,
                    data: build_sheet(&report),
                });
            }
            Err(e) => error!("{}", e),
        }
    }

    println!(
        "{}",
        serde_json::to_string_pretty(&ImportPayload::Multi(MultiSheetPayload { sheets }))?
    );
    Ok(())
}
