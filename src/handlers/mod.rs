//! NATS message handlers

pub mod import;
pub mod ping;
pub mod reservations;

use std::sync::Arc;

use anyhow::Result;
use async_nats::Client;
use tokio::select;
use tracing::{error, info, warn};

pub use import::ImportContext;

pub const SUBJECT_PING: &str = "habitt.ping";
pub const SUBJECT_TRIGGER: &str = "habitt.import.trigger";
pub const SUBJECT_STATUS: &str = "habitt.import.status";
pub const SUBJECT_HISTORY: &str = "habitt.import.history";
pub const SUBJECT_RESERVATIONS: &str = "habitt.reservations.get";

/// Subscribe to every subject and serve until one handler stops
pub async fn start_handlers(client: Client, ctx: Arc<ImportContext>) -> Result<()> {
    info!("Starting message handlers...");
    if ctx.jwt_secret.is_none() {
        warn!("JWT_SECRET not set, import subjects accept unauthenticated requests");
    }

    let ping_sub = client.subscribe(SUBJECT_PING).await?;
    let trigger_sub = client.subscribe(SUBJECT_TRIGGER).await?;
    let status_sub = client.subscribe(SUBJECT_STATUS).await?;
    let history_sub = client.subscribe(SUBJECT_HISTORY).await?;
    let reservations_sub = client.subscribe(SUBJECT_RESERVATIONS).await?;

    info!(
        "Subscribed to {}, {}, {}, {}, {}",
        SUBJECT_PING, SUBJECT_TRIGGER, SUBJECT_STATUS, SUBJECT_HISTORY, SUBJECT_RESERVATIONS
    );

    let client_ping = client.clone();
    let ping_handle = tokio::spawn(async move { ping::handle_ping(client_ping, ping_sub).await });

    let client_trigger = client.clone();
    let ctx_trigger = Arc::clone(&ctx);
    let trigger_handle = tokio::spawn(async move {
        import::handle_trigger(client_trigger, trigger_sub, ctx_trigger).await
    });

    let client_status = client.clone();
    let ctx_status = Arc::clone(&ctx);
    let status_handle = tokio::spawn(async move {
        import::handle_status(client_status, status_sub, ctx_status).await
    });

    let client_history = client.clone();
    let ctx_history = Arc::clone(&ctx);
    let history_handle = tokio::spawn(async move {
        import::handle_history(client_history, history_sub, ctx_history).await
    });

    let client_reservations = client.clone();
    let ctx_reservations = Arc::clone(&ctx);
    let reservations_handle = tokio::spawn(async move {
        reservations::handle_query(client_reservations, reservations_sub, ctx_reservations).await
    });

    select! {
        result = ping_handle => {
            error!("Ping handler finished: {:?}", result);
        }
        result = trigger_handle => {
            error!("Import trigger handler finished: {:?}", result);
        }
        result = status_handle => {
            error!("Import status handler finished: {:?}", result);
        }
        result = history_handle => {
            error!("Import history handler finished: {:?}", result);
        }
        result = reservations_handle => {
            error!("Reservation query handler finished: {:?}", result);
        }
    }

    Ok(())
}
