//! Stored-reservation query handler

use std::sync::Arc;

use anyhow::Result;
use async_nats::{Client, Subscriber};
use futures::StreamExt;
use tracing::{debug, error};

use super::import::{accept, reply, ImportContext};
use crate::error::ImportError;
use crate::types::{ErrorResponse, ReservationQueryRequest, SuccessResponse};

/// Handle `habitt.reservations.get`
pub async fn handle_query(
    client: Client,
    mut subscriber: Subscriber,
    ctx: Arc<ImportContext>,
) -> Result<()> {
    while let Some(msg) = subscriber.next().await {
        let Some(reply_to) = msg.reply.clone() else {
            continue;
        };

        let request =
            match accept::<ReservationQueryRequest>(&msg.payload, ctx.jwt_secret.as_deref()) {
                Ok(req) => req,
                Err(error) => {
                    reply(&client, reply_to, &error).await;
                    continue;
                }
            };

        let query = &request.payload;
        debug!(
            "Reservations of {}-{:02} for {}",
            query.year,
            query.month,
            query.building.as_deref().unwrap_or("every building")
        );
        match ctx.reservations.query(query).await {
            Ok(response) => {
                reply(&client, reply_to, &SuccessResponse::new(request.id, response)).await;
            }
            Err(e) => {
                let code = error_code(&e);
                if code == "DATABASE_ERROR" {
                    error!("Reservation query failed: {}", e);
                }
                let error = ErrorResponse::new(request.id, code, e.to_string());
                reply(&client, reply_to, &error).await;
            }
        }
    }

    Ok(())
}

fn error_code(error: &ImportError) -> &'static str {
    match error {
        ImportError::InvalidPayload(_) => "INVALID_REQUEST",
        _ => "DATABASE_ERROR",
    }
}
