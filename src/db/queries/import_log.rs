//! Import log queries

use sqlx::PgPool;
use uuid::Uuid;

use crate::types::{ImportLog, ImportLogStatus};

/// Open a log for one sheet; it starts `in_progress`
pub async fn create_import_log(
    pool: &PgPool,
    correlation_id: Option<Uuid>,
    year: i32,
    month: i32,
) -> Result<Uuid, sqlx::Error> {
    sqlx::query_scalar(
        r#"
        INSERT INTO import_logs (correlation_id, year, month, status)
        VALUES ($1, $2, $3, 'in_progress')
        RETURNING id
        "#,
    )
    .bind(correlation_id)
    .bind(year)
    .bind(month)
    .fetch_one(pool)
    .await
}

/// Move a log to its terminal status
pub async fn finish_import_log(
    pool: &PgPool,
    id: Uuid,
    status: ImportLogStatus,
    error_message: Option<&str>,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        UPDATE import_logs
        SET status = $2, error_message = $3
        WHERE id = $1
        "#,
    )
    .bind(id)
    .bind(status)
    .bind(error_message)
    .execute(pool)
    .await?;
    Ok(())
}

/// All logs of a run, oldest first
pub async fn list_by_correlation(
    pool: &PgPool,
    correlation_id: Uuid,
) -> Result<Vec<ImportLog>, sqlx::Error> {
    sqlx::query_as::<_, ImportLog>(
        r#"
        SELECT id, correlation_id, year, month, status, error_message, import_date
        FROM import_logs
        WHERE correlation_id = $1
        ORDER BY import_date, year, month
        "#,
    )
    .bind(correlation_id)
    .fetch_all(pool)
    .await
}
