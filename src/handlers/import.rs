//! Import trigger, status and history handlers, plus the reply helpers
//! every handler shares

use std::sync::Arc;

use anyhow::Result;
use async_nats::{Client, Subscriber};
use futures::StreamExt;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, error, warn};
use uuid::Uuid;

use crate::auth;
use crate::services::orchestrator::ImportOrchestrator;
use crate::services::reservation_query::ReservationQueryService;
use crate::types::{
    ErrorResponse, ImportStatusRequest, ListHistoryRequest, Request, RunStatus, SuccessResponse,
    TriggerImportRequest,
};

const DEFAULT_HISTORY_LIMIT: usize = 20;

/// What every import handler needs
pub struct ImportContext {
    pub orchestrator: ImportOrchestrator,
    pub reservations: ReservationQueryService,
    pub jwt_secret: Option<String>,
}

/// Decode and authorize a request, or build the error to reply with
pub(super) fn accept<T: DeserializeOwned>(
    payload: &[u8],
    jwt_secret: Option<&str>,
) -> Result<Request<T>, ErrorResponse> {
    let request: Request<T> = serde_json::from_slice(payload)
        .map_err(|e| ErrorResponse::new(Uuid::nil(), "INVALID_REQUEST", e.to_string()))?;
    auth::authorize(&request, jwt_secret)
        .map_err(|e| ErrorResponse::new(request.id, "UNAUTHORIZED", e.to_string()))?;
    Ok(request)
}

/// Serialize a reply body; failures are logged and the reply dropped
fn encode<T: Serialize>(body: &T) -> Option<Vec<u8>> {
    match serde_json::to_vec(body) {
        Ok(bytes) => Some(bytes),
        Err(e) => {
            error!("Failed to serialize reply: {}", e);
            None
        }
    }
}

/// Publish a reply. A failed reply is logged; the handler keeps serving.
pub(super) async fn reply<T: Serialize>(client: &Client, subject: async_nats::Subject, body: &T) {
    let Some(bytes) = encode(body) else {
        return;
    };
    if let Err(e) = client.publish(subject.clone(), bytes.into()).await {
        error!("Failed to reply on {}: {}", subject, e);
    }
}

/// `"completed"` etc. to a run status
fn parse_status_filter(raw: &str) -> Option<RunStatus> {
    serde_json::from_value(serde_json::Value::String(raw.trim().to_lowercase())).ok()
}

/// Handle `habitt.import.trigger`
pub async fn handle_trigger(
    client: Client,
    mut subscriber: Subscriber,
    ctx: Arc<ImportContext>,
) -> Result<()> {
    while let Some(msg) = subscriber.next().await {
        let Some(reply_to) = msg.reply.clone() else {
            warn!("Trigger request without reply subject");
            continue;
        };

        let request = match accept::<TriggerImportRequest>(&msg.payload, ctx.jwt_secret.as_deref()) {
            Ok(req) => req,
            Err(error) => {
                warn!("Rejected trigger request: {}", error.error.message);
                reply(&client, reply_to, &error).await;
                continue;
            }
        };

        debug!("Trigger for file {}", request.payload.file_id);
        let response = ctx.orchestrator.trigger(request.payload).await;
        reply(&client, reply_to, &SuccessResponse::new(request.id, response)).await;
    }

    Ok(())
}

/// Handle `habitt.import.status`
pub async fn handle_status(
    client: Client,
    mut subscriber: Subscriber,
    ctx: Arc<ImportContext>,
) -> Result<()> {
    while let Some(msg) = subscriber.next().await {
        let Some(reply_to) = msg.reply.clone() else {
            continue;
        };

        let request = match accept::<ImportStatusRequest>(&msg.payload, ctx.jwt_secret.as_deref()) {
            Ok(req) => req,
            Err(error) => {
                reply(&client, reply_to, &error).await;
                continue;
            }
        };

        let correlation_id = request.payload.correlation_id;
        match ctx.orchestrator.status(correlation_id).await {
            Ok(Some(status)) => {
                reply(&client, reply_to, &SuccessResponse::new(request.id, status)).await;
            }
            Ok(None) => {
                let error = ErrorResponse::new(
                    request.id,
                    "NOT_FOUND",
                    format!("No import run {}", correlation_id),
                );
                reply(&client, reply_to, &error).await;
            }
            Err(e) => {
                error!("Status query for {} failed: {}", correlation_id, e);
                let error = ErrorResponse::new(request.id, "DATABASE_ERROR", e.to_string());
                reply(&client, reply_to, &error).await;
            }
        }
    }

    Ok(())
}

/// Handle `habitt.import.history`
pub async fn handle_history(
    client: Client,
    mut subscriber: Subscriber,
    ctx: Arc<ImportContext>,
) -> Result<()> {
    while let Some(msg) = subscriber.next().await {
        let Some(reply_to) = msg.reply.clone() else {
            continue;
        };

        let request = match accept::<ListHistoryRequest>(&msg.payload, ctx.jwt_secret.as_deref()) {
            Ok(req) => req,
            Err(error) => {
                reply(&client, reply_to, &error).await;
                continue;
            }
        };

        let limit = request.payload.limit.unwrap_or(DEFAULT_HISTORY_LIMIT);
        let history = ctx.orchestrator.history();
        let response = match request.payload.status.as_deref() {
            Some(raw) => match parse_status_filter(raw) {
                Some(status) => history.get_by_status(status, limit),
                None => {
                    let error = ErrorResponse::new(
                        request.id,
                        "INVALID_REQUEST",
                        format!("Unknown run status '{}'", raw),
                    );
                    reply(&client, reply_to, &error).await;
                    continue;
                }
            },
            None => history.get_recent(limit),
        };
        reply(&client, reply_to, &SuccessResponse::new(request.id, response)).await;
    }

    Ok(())
}
