//! Database module

pub mod queries;

use anyhow::{Context, Result};
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use tracing::info;

/// Create the connection pool for the reservation ledger
pub async fn create_pool(database_url: &str) -> Result<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(10)
        .connect(database_url)
        .await
        .context("Failed to connect to PostgreSQL")?;

    Ok(pool)
}

/// Apply the embedded migrations
pub async fn run_migrations(pool: &PgPool) -> Result<()> {
    info!("Applying ledger schema migrations...");
    sqlx::migrate!("./migrations").run(pool).await?;
    info!("Ledger schema up to date");
    Ok(())
}

/// Seed `color_meanings` from the built-in legend.
/// Existing rows get their meaning refreshed; extra rows are left alone.
pub async fn ensure_color_meanings_synced(pool: &PgPool) -> Result<()> {
    let rows = crate::services::colors::legend_rows();
    let added = queries::color::sync_color_meanings(pool, &rows).await?;
    if added > 0 {
        info!("Color legend synced: {} rows, {} added", rows.len(), added);
    }
    Ok(())
}
