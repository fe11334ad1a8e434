//! Persistence abstraction for the reconciler
//!
//! - `PgStore` (db::queries) for production, one transaction per apartment
//! - `memory_store::InMemoryStore` for tests
//!
//! All booking/reservation writes go through a `StoreTx` scoped to a single
//! apartment. Dropping a transaction without `commit` discards its writes.

use async_trait::async_trait;
use chrono::NaiveDate;
use uuid::Uuid;

use crate::error::ImportError;
use crate::types::{
    Booking, ImportLog, ImportLogStatus, Reservation, ReservationDraft, ReservationListing,
};

pub type StoreResult<T> = Result<T, ImportError>;

/// Who booked and through which channel; unset fields leave the booking as is
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BookingIdentity<'a> {
    pub guest_id: Option<Uuid>,
    pub reference_code: Option<&'a str>,
    pub payment_source_id: Option<Uuid>,
}

impl BookingIdentity<'_> {
    pub fn is_empty(&self) -> bool {
        self.guest_id.is_none() && self.reference_code.is_none() && self.payment_source_id.is_none()
    }
}

/// Natural-key lookups and import bookkeeping
#[async_trait]
pub trait ReservationStore: Send + Sync {
    async fn find_or_create_building(&self, name: &str) -> StoreResult<Uuid>;

    async fn find_or_create_owner(&self, name: &str) -> StoreResult<Uuid>;

    /// Keyed by `(building_id, raw_text)`; code and owner only fill gaps
    async fn find_or_create_apartment(
        &self,
        building_id: Uuid,
        raw_text: &str,
        code: Option<&str>,
        owner_id: Option<Uuid>,
    ) -> StoreResult<Uuid>;

    async fn find_or_create_guest(&self, name: &str) -> StoreResult<Uuid>;

    /// Keyed by channel name, e.g. `Airbnb`
    async fn find_or_create_payment_source(&self, name: &str) -> StoreResult<Uuid>;

    async fn create_import_log(
        &self,
        correlation_id: Option<Uuid>,
        year: i32,
        month: i32,
    ) -> StoreResult<Uuid>;

    async fn finish_import_log(
        &self,
        id: Uuid,
        status: ImportLogStatus,
        error_message: Option<&str>,
    ) -> StoreResult<()>;

    /// Logs of a run, oldest first
    async fn import_logs(&self, correlation_id: Uuid) -> StoreResult<Vec<ImportLog>>;

    /// Reservations dated in `[from, until)`, optionally of one building,
    /// ordered by building, apartment and date
    async fn reservations_between(
        &self,
        from: NaiveDate,
        until: NaiveDate,
        building: Option<&str>,
    ) -> StoreResult<Vec<ReservationListing>>;

    /// Open a write transaction holding the apartment's lock
    async fn begin_apartment(&self, apartment_id: Uuid) -> StoreResult<Box<dyn StoreTx>>;
}

/// Booking and reservation writes for one apartment
#[async_trait]
pub trait StoreTx: Send {
    async fn reservation_on(&mut self, date: NaiveDate) -> StoreResult<Option<Reservation>>;

    /// Booking attached to the reservation on `date`, with its guest name
    async fn booking_for_reservation(&mut self, date: NaiveDate) -> StoreResult<Option<Booking>>;

    async fn create_booking(
        &mut self,
        check_in: NaiveDate,
        identity: BookingIdentity<'_>,
    ) -> StoreResult<Booking>;

    /// Insert or refresh the reservation of `draft.date`.
    ///
    /// Returns the booking the reservation was attached to before, when it
    /// differs from `booking_id`.
    async fn upsert_reservation(
        &mut self,
        booking_id: Uuid,
        draft: &ReservationDraft,
    ) -> StoreResult<Option<Uuid>>;

    /// Fill a booking's guest, reference and payment source when still unset
    async fn set_booking_identity(
        &mut self,
        booking_id: Uuid,
        identity: BookingIdentity<'_>,
    ) -> StoreResult<()>;

    /// Recompute check-in/out, nights and total from attached reservations.
    ///
    /// A booking with no reservations left is deleted and `None` returned.
    async fn recompute_booking(&mut self, booking_id: Uuid) -> StoreResult<Option<Booking>>;

    async fn commit(self: Box<Self>) -> StoreResult<()>;
}

/// Aggregates of a booking over its reservations
pub fn booking_aggregates(reservations: &[&Reservation]) -> Option<(NaiveDate, NaiveDate, i32, f64)> {
    let check_in = reservations.iter().map(|r| r.date).min()?;
    let last = reservations.iter().map(|r| r.date).max()?;
    let check_out = last.succ_opt()?;
    let nights = (check_out - check_in).num_days() as i32;
    let total: f64 = reservations.iter().map(|r| r.rate).sum();
    Some((check_in, check_out, nights, total))
}
