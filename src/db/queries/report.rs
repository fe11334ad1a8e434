//! Owner report queries

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use super::PgStore;
use crate::services::owner_reports::ReportStore;
use crate::services::store::StoreResult;
use crate::types::{Communication, CommunicationDraft, ReportBooking};

const REPORT_BOOKING_COLUMNS: &str = r#"
    b.id AS booking_id, o.id AS owner_id, o.name AS owner_name, o.email AS owner_email,
    COALESCE(a.code, a.raw_text) AS apartment, g.name AS guest_name,
    b.check_in, b.check_out, b.nights, b.total_amount, a.admin_fee_percentage
"#;

const COMMUNICATION_COLUMNS: &str = r#"
    c.id, c.owner_id, o.name AS owner_name, c.recipient_email, c.subject, c.content,
    c.custom_message, c.status, c.retry_count, c.report_period_start, c.report_period_end,
    c.created_at
"#;

#[async_trait]
impl ReportStore for PgStore {
    async fn last_run(&self, task: &str, now: DateTime<Utc>) -> StoreResult<DateTime<Utc>> {
        let last = sqlx::query_scalar(
            r#"
            INSERT INTO script_runs (script_name, last_run_at) VALUES ($1, $2)
            ON CONFLICT (script_name) DO UPDATE SET script_name = EXCLUDED.script_name
            RETURNING last_run_at
            "#,
        )
        .bind(task)
        .bind(now)
        .fetch_one(self.pool())
        .await?;
        Ok(last)
    }

    async fn record_run(&self, task: &str, at: DateTime<Utc>) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO script_runs (script_name, last_run_at) VALUES ($1, $2)
            ON CONFLICT (script_name) DO UPDATE SET last_run_at = EXCLUDED.last_run_at
            "#,
        )
        .bind(task)
        .bind(at)
        .execute(self.pool())
        .await?;
        Ok(())
    }

    async fn unreported_bookings(
        &self,
        since: DateTime<Utc>,
        until: DateTime<Utc>,
    ) -> StoreResult<Vec<ReportBooking>> {
        let sql = format!(
            r#"
            SELECT {}
            FROM bookings b
            JOIN apartments a ON a.id = b.apartment_id
            JOIN owners o ON o.id = a.owner_id
            LEFT JOIN guests g ON g.id = b.guest_id
            WHERE b.created_at > $1 AND b.created_at < $2
              AND NOT EXISTS (
                  SELECT 1 FROM booking_communications bc WHERE bc.booking_id = b.id
              )
            ORDER BY o.id, b.check_in
            "#,
            REPORT_BOOKING_COLUMNS
        );
        let rows = sqlx::query_as::<_, ReportBooking>(&sql)
            .bind(since)
            .bind(until)
            .fetch_all(self.pool())
            .await?;
        Ok(rows)
    }

    async fn create_communication(
        &self,
        draft: &CommunicationDraft,
        booking_ids: &[Uuid],
    ) -> StoreResult<Uuid> {
        let mut tx = self.pool().begin().await?;
        let id: Uuid = sqlx::query_scalar(
            r#"
            INSERT INTO communications
                (owner_id, recipient_email, subject, report_period_start, report_period_end)
            VALUES ($1, $2, $3, $4, $5)
            RETURNING id
            "#,
        )
        .bind(draft.owner_id)
        .bind(&draft.recipient_email)
        .bind(&draft.subject)
        .bind(draft.report_period_start)
        .bind(draft.report_period_end)
        .fetch_one(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            INSERT INTO booking_communications (communication_id, booking_id)
            SELECT $1, unnest($2::uuid[])
            "#,
        )
        .bind(id)
        .bind(booking_ids)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(id)
    }

    async fn approved_communications(&self, max_attempts: i32) -> StoreResult<Vec<Communication>> {
        let sql = format!(
            r#"
            SELECT {}
            FROM communications c
            JOIN owners o ON o.id = c.owner_id
            WHERE c.status = 'approved' AND c.retry_count < $1
            ORDER BY c.created_at
            "#,
            COMMUNICATION_COLUMNS
        );
        let rows = sqlx::query_as::<_, Communication>(&sql)
            .bind(max_attempts)
            .fetch_all(self.pool())
            .await?;
        Ok(rows)
    }

    async fn communication_bookings(&self, communication_id: Uuid) -> StoreResult<Vec<ReportBooking>> {
        let sql = format!(
            r#"
            SELECT {}
            FROM booking_communications bc
            JOIN bookings b ON b.id = bc.booking_id
            JOIN apartments a ON a.id = b.apartment_id
            JOIN owners o ON o.id = a.owner_id
            LEFT JOIN guests g ON g.id = b.guest_id
            WHERE bc.communication_id = $1 AND NOT bc.excluded
            ORDER BY b.check_in
            "#,
            REPORT_BOOKING_COLUMNS
        );
        let rows = sqlx::query_as::<_, ReportBooking>(&sql)
            .bind(communication_id)
            .fetch_all(self.pool())
            .await?;
        Ok(rows)
    }

    async fn set_communication_content(&self, communication_id: Uuid, html: &str) -> StoreResult<()> {
        sqlx::query("UPDATE communications SET content = $2 WHERE id = $1")
            .bind(communication_id)
            .bind(html)
            .execute(self.pool())
            .await?;
        Ok(())
    }

    async fn mark_communication_sent(&self, communication_id: Uuid) -> StoreResult<()> {
        sqlx::query("UPDATE communications SET status = 'sent', sent_at = NOW() WHERE id = $1")
            .bind(communication_id)
            .execute(self.pool())
            .await?;
        Ok(())
    }

    async fn mark_communication_failed(&self, communication_id: Uuid) -> StoreResult<()> {
        sqlx::query(
            r#"
            UPDATE communications
            SET status = 'failed', retry_count = retry_count + 1, last_retry_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(communication_id)
        .execute(self.pool())
        .await?;
        Ok(())
    }
}
