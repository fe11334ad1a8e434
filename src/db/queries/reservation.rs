//! PostgreSQL reservation store
//!
//! Lookups are `INSERT ... ON CONFLICT` upserts on the natural keys, filling
//! only columns that are still NULL. Each apartment is written in one
//! transaction that first takes `pg_advisory_xact_lock` on the apartment id,
//! so concurrent workers serialise on the same apartment.

use async_trait::async_trait;
use chrono::NaiveDate;
use sqlx::{PgPool, Postgres, Transaction};
use tracing::debug;
use uuid::Uuid;

use super::import_log;
use crate::error::ImportError;
use crate::services::store::{
    booking_aggregates, BookingIdentity, ReservationStore, StoreResult, StoreTx,
};
use crate::types::{
    Booking, ImportLog, ImportLogStatus, Reservation, ReservationDraft, ReservationListing,
};

const BOOKING_COLUMNS: &str = r#"
    b.id, b.apartment_id, b.guest_id, b.check_in, b.check_out, b.nights,
    b.total_amount, b.reference_code, b.payment_source_id, b.open, g.name AS guest_name
"#;

/// `ReservationStore` over a connection pool
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl ReservationStore for PgStore {
    async fn find_or_create_building(&self, name: &str) -> StoreResult<Uuid> {
        let id = sqlx::query_scalar(
            r#"
            INSERT INTO buildings (name) VALUES ($1)
            ON CONFLICT (name) DO UPDATE SET name = EXCLUDED.name
            RETURNING id
            "#,
        )
        .bind(name)
        .fetch_one(&self.pool)
        .await?;
        Ok(id)
    }

    async fn find_or_create_owner(&self, name: &str) -> StoreResult<Uuid> {
        let id = sqlx::query_scalar(
            r#"
            INSERT INTO owners (name) VALUES ($1)
            ON CONFLICT (name) DO UPDATE SET name = EXCLUDED.name
            RETURNING id
            "#,
        )
        .bind(name)
        .fetch_one(&self.pool)
        .await?;
        Ok(id)
    }

    async fn find_or_create_apartment(
        &self,
        building_id: Uuid,
        raw_text: &str,
        code: Option<&str>,
        owner_id: Option<Uuid>,
    ) -> StoreResult<Uuid> {
        let id = sqlx::query_scalar(
            r#"
            INSERT INTO apartments (building_id, raw_text, code, owner_id)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (building_id, raw_text) DO UPDATE
                SET code     = COALESCE(apartments.code, EXCLUDED.code),
                    owner_id = COALESCE(apartments.owner_id, EXCLUDED.owner_id)
            RETURNING id
            "#,
        )
        .bind(building_id)
        .bind(raw_text)
        .bind(code)
        .bind(owner_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(id)
    }

    async fn find_or_create_guest(&self, name: &str) -> StoreResult<Uuid> {
        let id = sqlx::query_scalar(
            r#"
            INSERT INTO guests (name) VALUES ($1)
            ON CONFLICT (name) DO UPDATE SET name = EXCLUDED.name
            RETURNING id
            "#,
        )
        .bind(name)
        .fetch_one(&self.pool)
        .await?;
        Ok(id)
    }

    async fn find_or_create_payment_source(&self, name: &str) -> StoreResult<Uuid> {
        let id = sqlx::query_scalar(
            r#"
            INSERT INTO payment_sources (name) VALUES ($1)
            ON CONFLICT (name) DO UPDATE SET name = EXCLUDED.name
            RETURNING id
            "#,
        )
        .bind(name)
        .fetch_one(&self.pool)
        .await?;
        Ok(id)
    }

    async fn create_import_log(
        &self,
        correlation_id: Option<Uuid>,
        year: i32,
        month: i32,
    ) -> StoreResult<Uuid> {
        Ok(import_log::create_import_log(&self.pool, correlation_id, year, month).await?)
    }

    async fn finish_import_log(
        &self,
        id: Uuid,
        status: ImportLogStatus,
        error_message: Option<&str>,
    ) -> StoreResult<()> {
        Ok(import_log::finish_import_log(&self.pool, id, status, error_message).await?)
    }

    async fn import_logs(&self, correlation_id: Uuid) -> StoreResult<Vec<ImportLog>> {
        Ok(import_log::list_by_correlation(&self.pool, correlation_id).await?)
    }

    async fn reservations_between(
        &self,
        from: NaiveDate,
        until: NaiveDate,
        building: Option<&str>,
    ) -> StoreResult<Vec<ReservationListing>> {
        let rows = sqlx::query_as::<_, ReservationListing>(
            r#"
            SELECT bu.name AS building, a.raw_text AS apartment, a.code AS apartment_code,
                   r.date, r.rate, r.color_hex, r.comment, r.booking_id,
                   b.check_in, b.check_out, g.name AS guest_name, p.name AS payment_source
            FROM reservations r
            JOIN apartments a ON a.id = r.apartment_id
            JOIN buildings bu ON bu.id = a.building_id
            JOIN bookings b ON b.id = r.booking_id
            LEFT JOIN guests g ON g.id = b.guest_id
            LEFT JOIN payment_sources p ON p.id = b.payment_source_id
            WHERE r.date >= $1 AND r.date < $2
              AND ($3::text IS NULL OR bu.name = $3)
            ORDER BY bu.name, a.raw_text, r.date
            "#,
        )
        .bind(from)
        .bind(until)
        .bind(building)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    async fn begin_apartment(&self, apartment_id: Uuid) -> StoreResult<Box<dyn StoreTx>> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("SELECT pg_advisory_xact_lock(hashtext($1::text))")
            .bind(apartment_id)
            .execute(&mut *tx)
            .await?;
        debug!("Holding advisory lock for apartment {}", apartment_id);
        Ok(Box::new(PgStoreTx { tx, apartment_id }))
    }
}

/// One apartment's write transaction
pub struct PgStoreTx {
    tx: Transaction<'static, Postgres>,
    apartment_id: Uuid,
}

impl PgStoreTx {
    async fn booking(&mut self, id: Uuid) -> StoreResult<Option<Booking>> {
        let sql = format!(
            "SELECT {} FROM bookings b LEFT JOIN guests g ON g.id = b.guest_id WHERE b.id = $1",
            BOOKING_COLUMNS
        );
        let booking = sqlx::query_as::<_, Booking>(&sql)
            .bind(id)
            .fetch_optional(&mut *self.tx)
            .await?;
        Ok(booking)
    }
}

#[async_trait]
impl StoreTx for PgStoreTx {
    async fn reservation_on(&mut self, date: NaiveDate) -> StoreResult<Option<Reservation>> {
        let reservation = sqlx::query_as::<_, Reservation>(
            r#"
            SELECT id, booking_id, apartment_id, date, rate, color_hex, comment
            FROM reservations
            WHERE apartment_id = $1 AND date = $2
            "#,
        )
        .bind(self.apartment_id)
        .bind(date)
        .fetch_optional(&mut *self.tx)
        .await?;
        Ok(reservation)
    }

    async fn booking_for_reservation(&mut self, date: NaiveDate) -> StoreResult<Option<Booking>> {
        let sql = format!(
            r#"
            SELECT {}
            FROM reservations r
            JOIN bookings b ON b.id = r.booking_id
            LEFT JOIN guests g ON g.id = b.guest_id
            WHERE r.apartment_id = $1 AND r.date = $2
            "#,
            BOOKING_COLUMNS
        );
        let booking = sqlx::query_as::<_, Booking>(&sql)
            .bind(self.apartment_id)
            .bind(date)
            .fetch_optional(&mut *self.tx)
            .await?;
        Ok(booking)
    }

    async fn create_booking(
        &mut self,
        check_in: NaiveDate,
        identity: BookingIdentity<'_>,
    ) -> StoreResult<Booking> {
        let id: Uuid = sqlx::query_scalar(
            r#"
            INSERT INTO bookings
                (apartment_id, guest_id, check_in, check_out, nights, total_amount,
                 reference_code, payment_source_id)
            VALUES ($1, $2, $3, $3 + 1, 1, 0, $4, $5)
            RETURNING id
            "#,
        )
        .bind(self.apartment_id)
        .bind(identity.guest_id)
        .bind(check_in)
        .bind(identity.reference_code)
        .bind(identity.payment_source_id)
        .fetch_one(&mut *self.tx)
        .await?;

        self.booking(id)
            .await?
            .ok_or(ImportError::Storage(sqlx::Error::RowNotFound))
    }

    async fn upsert_reservation(
        &mut self,
        booking_id: Uuid,
        draft: &ReservationDraft,
    ) -> StoreResult<Option<Uuid>> {
        let previous: Option<Uuid> = sqlx::query_scalar(
            r#"
            SELECT booking_id FROM reservations
            WHERE apartment_id = $1 AND date = $2
            FOR UPDATE
            "#,
        )
        .bind(self.apartment_id)
        .bind(draft.date)
        .fetch_optional(&mut *self.tx)
        .await?;

        sqlx::query(
            r#"
            INSERT INTO reservations (booking_id, apartment_id, date, rate, color_hex, comment)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (apartment_id, date) DO UPDATE
                SET booking_id = EXCLUDED.booking_id,
                    rate       = EXCLUDED.rate,
                    color_hex  = EXCLUDED.color_hex,
                    comment    = EXCLUDED.comment,
                    updated_at = NOW()
            "#,
        )
        .bind(booking_id)
        .bind(self.apartment_id)
        .bind(draft.date)
        .bind(draft.rate)
        .bind(&draft.color_hex)
        .bind(&draft.comment)
        .execute(&mut *self.tx)
        .await?;

        Ok(previous.filter(|p| *p != booking_id))
    }

    async fn set_booking_identity(
        &mut self,
        booking_id: Uuid,
        identity: BookingIdentity<'_>,
    ) -> StoreResult<()> {
        sqlx::query(
            r#"
            UPDATE bookings
            SET guest_id          = COALESCE(guest_id, $2),
                reference_code    = COALESCE(reference_code, $3),
                payment_source_id = COALESCE(payment_source_id, $4),
                updated_at        = NOW()
            WHERE id = $1
            "#,
        )
        .bind(booking_id)
        .bind(identity.guest_id)
        .bind(identity.reference_code)
        .bind(identity.payment_source_id)
        .execute(&mut *self.tx)
        .await?;
        Ok(())
    }

    async fn recompute_booking(&mut self, booking_id: Uuid) -> StoreResult<Option<Booking>> {
        let reservations = sqlx::query_as::<_, Reservation>(
            r#"
            SELECT id, booking_id, apartment_id, date, rate, color_hex, comment
            FROM reservations
            WHERE booking_id = $1
            ORDER BY date
            "#,
        )
        .bind(booking_id)
        .fetch_all(&mut *self.tx)
        .await?;

        let refs: Vec<&Reservation> = reservations.iter().collect();
        let Some((check_in, check_out, nights, total)) = booking_aggregates(&refs) else {
            sqlx::query("DELETE FROM bookings WHERE id = $1")
                .bind(booking_id)
                .execute(&mut *self.tx)
                .await?;
            debug!("Deleted empty booking {}", booking_id);
            return Ok(None);
        };

        sqlx::query(
            r#"
            UPDATE bookings
            SET check_in = $2, check_out = $3, nights = $4, total_amount = $5, updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(booking_id)
        .bind(check_in)
        .bind(check_out)
        .bind(nights)
        .bind(total)
        .execute(&mut *self.tx)
        .await?;

        self.booking(booking_id).await
    }

    async fn commit(self: Box<Self>) -> StoreResult<()> {
        self.tx.commit().await?;
        Ok(())
    }
}
