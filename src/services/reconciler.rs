//! Reconciliation engine
//!
//! Writes sheet drafts into the store so that replaying the same sheet is a
//! no-op. Each apartment is reconciled in its own transaction, days in
//! ascending order:
//!
//! 1. **extend** the booking of the previous day when it is open and the
//!    same-occupancy predicate accepts the pair
//! 2. otherwise **reuse** the booking already starting on this day (replay)
//! 3. otherwise **mint** a new booking checking in on this day
//!
//! After the last day, a stored stay starting the next day is folded into the
//! last booking when the predicate accepts the pair, so overlapping imports
//! converge whichever commits first.
//!
//! A reservation moved away from a booking leaves that booking recomputed, or
//! deleted once it has no reservations left.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::NaiveDate;
use rand::Rng;
use serde::Serialize;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::ImportError;
use crate::services::apartment_locks::ApartmentLocks;
use crate::services::continuity::{DaySignals, GuestContinuity, SameOccupancy};
use crate::services::entity_builder::{guest_from_comment, reference_from_comment};
use crate::services::store::{BookingIdentity, ReservationStore, StoreTx};
use crate::types::{
    ApartmentDraft, Booking, ImportLogStatus, ImportPayload, LayoutPolicy, LayoutRules,
    Reservation, ReservationDraft, SheetPayload,
};

/// Bounded retry with exponential backoff for transient write failures
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(50),
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (1-based), with up to 50% jitter
    pub fn delay(&self, attempt: u32) -> Duration {
        let base = self.base_delay.saturating_mul(1 << attempt.saturating_sub(1).min(10));
        let jitter_ms = base.as_millis() as u64 / 2;
        let jitter = if jitter_ms > 0 {
            rand::thread_rng().gen_range(0..=jitter_ms)
        } else {
            0
        };
        base + Duration::from_millis(jitter)
    }
}

/// What one reconciliation pass wrote
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileSummary {
    pub buildings: usize,
    pub buildings_skipped: usize,
    pub apartments: usize,
    pub reservations: usize,
    pub bookings_created: usize,
    pub bookings_deleted: usize,
}

impl ReconcileSummary {
    fn absorb(&mut self, other: &ApartmentOutcome) {
        self.apartments += 1;
        self.reservations += other.reservations;
        self.bookings_created += other.bookings_created;
        self.bookings_deleted += other.bookings_deleted;
    }
}

#[derive(Debug, Default)]
struct ApartmentOutcome {
    reservations: usize,
    bookings_created: usize,
    bookings_deleted: usize,
}

/// Reconciles drafts against a `ReservationStore`
#[derive(Clone)]
pub struct Reconciler {
    store: Arc<dyn ReservationStore>,
    locks: ApartmentLocks,
    predicate: Arc<dyn SameOccupancy>,
    rules: LayoutRules,
    retry: RetryPolicy,
}

impl Reconciler {
    pub fn new(store: Arc<dyn ReservationStore>) -> Self {
        Self {
            store,
            locks: ApartmentLocks::default(),
            predicate: Arc::new(GuestContinuity),
            rules: LayoutRules::default(),
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_predicate(mut self, predicate: Arc<dyn SameOccupancy>) -> Self {
        self.predicate = predicate;
        self
    }

    pub fn with_rules(mut self, rules: LayoutRules) -> Self {
        self.rules = rules;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn store(&self) -> &Arc<dyn ReservationStore> {
        &self.store
    }

    /// Reconcile every building of one sheet.
    pub async fn reconcile(&self, sheet: &SheetPayload) -> Result<ReconcileSummary, ImportError> {
        let mut summary = ReconcileSummary::default();

        for building in &sheet.buildings {
            let policy = self.rules.classify(&building.name);
            if policy == LayoutPolicy::Excluded {
                debug!("Excluded building '{}' not reconciled", building.name);
                summary.buildings_skipped += 1;
                continue;
            }

            let building_id = self.store.find_or_create_building(&building.name).await?;
            summary.buildings += 1;

            for apartment in &building.apartments {
                let outcome = self
                    .reconcile_apartment(building_id, policy, apartment)
                    .await?;
                summary.absorb(&outcome);
            }
        }

        info!(
            "Reconciled {}-{:02}: {} apartments, {} reservations, {} bookings created, {} deleted",
            sheet.year,
            sheet.month,
            summary.apartments,
            summary.reservations,
            summary.bookings_created,
            summary.bookings_deleted
        );
        Ok(summary)
    }

    /// Reconcile one sheet under an existing import log.
    ///
    /// A failure is recorded on the log before it is returned; finishing the
    /// log on success is left to the caller, which may have more sheets.
    pub async fn import_reservation_sheet(
        &self,
        sheet: &SheetPayload,
        import_id: Uuid,
    ) -> Result<ReconcileSummary, ImportError> {
        debug!("Import {} reconciling {}-{:02}", import_id, sheet.year, sheet.month);
        match self.reconcile(sheet).await {
            Ok(summary) => Ok(summary),
            Err(e) => {
                warn!("Import {} failed on {}-{:02}: {}", import_id, sheet.year, sheet.month, e);
                let message = e.to_string();
                self.store
                    .finish_import_log(import_id, ImportLogStatus::Failed, Some(&message))
                    .await?;
                Err(e)
            }
        }
    }

    /// Bulk import of parsed JSON: one log for the whole payload.
    pub async fn import_json(&self, payload: &ImportPayload) -> Result<Uuid, ImportError> {
        let sheets = payload.sheets();
        let last = sheets
            .last()
            .ok_or_else(|| ImportError::InvalidPayload("payload contains no sheets".into()))?;
        for sheet in &sheets {
            if !(1..=12).contains(&sheet.month) {
                return Err(ImportError::InvalidPayload(format!(
                    "month {} out of range",
                    sheet.month
                )));
            }
        }

        let import_id = self
            .store
            .create_import_log(None, last.year, last.month as i32)
            .await?;

        for sheet in &sheets {
            self.import_reservation_sheet(sheet, import_id).await?;
        }

        self.store
            .finish_import_log(import_id, ImportLogStatus::Completed, None)
            .await?;
        Ok(import_id)
    }

    async fn reconcile_apartment(
        &self,
        building_id: Uuid,
        policy: LayoutPolicy,
        draft: &ApartmentDraft,
    ) -> Result<ApartmentOutcome, ImportError> {
        let (code, owner) = match policy {
            LayoutPolicy::Miscellaneous => (None, draft.raw_text.trim().to_string()),
            _ => (draft.code.clone(), draft.owner.trim().to_string()),
        };

        let owner_id = if owner.is_empty() {
            None
        } else {
            Some(self.store.find_or_create_owner(&owner).await?)
        };
        let apartment_id = self
            .store
            .find_or_create_apartment(building_id, &draft.raw_text, code.as_deref(), owner_id)
            .await?;

        let mut days: Vec<&ReservationDraft> = draft.reservations.iter().collect();
        days.sort_by_key(|d| d.date);
        if days.is_empty() {
            return Ok(ApartmentOutcome::default());
        }

        let mut names = Lookups::default();
        for name in days.iter().filter_map(|d| d.guest_name.as_deref()) {
            if !names.guests.contains_key(name) {
                let id = self.store.find_or_create_guest(name).await?;
                names.guests.insert(name.to_string(), id);
            }
        }
        for channel in days.iter().filter_map(|d| d.channel.as_deref()) {
            if !names.payment_sources.contains_key(channel) {
                let id = self.store.find_or_create_payment_source(channel).await?;
                names.payment_sources.insert(channel.to_string(), id);
            }
        }

        let _guard = self.locks.acquire(apartment_id).await;
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.write_days(apartment_id, &days, &names).await {
                Ok(outcome) => return Ok(outcome),
                Err(e) if e.is_retryable() && attempt <= self.retry.max_retries => {
                    let delay = self.retry.delay(attempt);
                    warn!(
                        "Apartment {} write failed (attempt {}), retrying in {:?}: {}",
                        apartment_id, attempt, delay, e
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) if e.is_retryable() => {
                    return Err(ImportError::ReconciliationConflict {
                        apartment_id,
                        date: days[0].date,
                        attempts: attempt,
                    });
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn write_days(
        &self,
        apartment_id: Uuid,
        days: &[&ReservationDraft],
        names: &Lookups,
    ) -> Result<ApartmentOutcome, ImportError> {
        let mut tx = self.store.begin_apartment(apartment_id).await?;
        let mut outcome = ApartmentOutcome::default();
        let mut previous: Option<(DaySignals, Booking)> = None;

        for day in days {
            let current = DaySignals {
                date: day.date,
                guest: day.guest_name.clone(),
                reference_code: day.reference_code.clone(),
                rate: day.rate,
                color_hex: day.color_hex.clone(),
            };

            let predecessor = match previous.take() {
                Some(prev) if prev.0.date.succ_opt() == Some(day.date) => Some(prev),
                _ => stored_predecessor(&mut tx, day.date).await?,
            };

            let extend = predecessor.as_ref().and_then(|(signals, booking)| {
                (booking.open && self.predicate.same_occupancy(signals, &current))
                    .then_some(booking.id)
            });

            let identity = names.identity_of(day);
            let booking_id = match extend {
                Some(id) => id,
                None => match tx.booking_for_reservation(day.date).await? {
                    Some(existing) if existing.check_in == day.date => existing.id,
                    _ => {
                        let booking = tx.create_booking(day.date, identity).await?;
                        outcome.bookings_created += 1;
                        booking.id
                    }
                },
            };

            let displaced = tx.upsert_reservation(booking_id, day).await?;
            if !identity.is_empty() {
                tx.set_booking_identity(booking_id, identity).await?;
            }
            if let Some(old) = displaced {
                if tx.recompute_booking(old).await?.is_none() {
                    debug!("Booking {} emptied by re-attachment, deleted", old);
                    outcome.bookings_deleted += 1;
                }
            }

            let booking = tx.recompute_booking(booking_id).await?.ok_or_else(|| {
                ImportError::ReconciliationConflict {
                    apartment_id,
                    date: day.date,
                    attempts: 0,
                }
            })?;
            outcome.reservations += 1;

            previous = Some((carry_identity(current, &booking), booking));
        }

        if let Some((last, booking)) = previous {
            outcome.bookings_deleted += self.absorb_successor(&mut tx, last, &booking).await?;
        }

        tx.commit().await?;
        Ok(outcome)
    }

    /// Re-attach the stored stay that starts the day after `last` when the
    /// predicate says it continues `booking`. Returns how many bookings were
    /// deleted (0 or 1).
    async fn absorb_successor(
        &self,
        tx: &mut Box<dyn StoreTx>,
        last: DaySignals,
        booking: &Booking,
    ) -> Result<usize, ImportError> {
        if !booking.open {
            return Ok(0);
        }
        let Some(first_date) = last.date.succ_opt() else {
            return Ok(0);
        };
        let Some(successor) = tx.booking_for_reservation(first_date).await? else {
            return Ok(0);
        };
        if successor.id == booking.id {
            return Ok(0);
        }
        let Some(first) = tx.reservation_on(first_date).await? else {
            return Ok(0);
        };
        let next = carry_identity(signals_of(&first), &successor);
        if !self.predicate.same_occupancy(&last, &next) {
            return Ok(0);
        }

        let mut date = first_date;
        let mut moved = 0;
        while let Some(reservation) = tx.reservation_on(date).await? {
            if reservation.booking_id != successor.id {
                break;
            }
            tx.upsert_reservation(booking.id, &draft_of(&reservation)).await?;
            moved += 1;
            match date.succ_opt() {
                Some(d) => date = d,
                None => break,
            }
        }

        let identity = BookingIdentity {
            guest_id: successor.guest_id,
            reference_code: successor.reference_code.as_deref(),
            payment_source_id: successor.payment_source_id,
        };
        tx.set_booking_identity(booking.id, identity).await?;
        tx.recompute_booking(booking.id).await?;

        let deleted = tx.recompute_booking(successor.id).await?.is_none();
        debug!(
            "Booking {} absorbed {} days of booking {}{}",
            booking.id,
            moved,
            successor.id,
            if deleted { ", deleted" } else { "" }
        );
        Ok(usize::from(deleted))
    }
}

/// A stored reservation as a draft, for re-attaching it unchanged
fn draft_of(reservation: &Reservation) -> ReservationDraft {
    ReservationDraft {
        date: reservation.date,
        rate: reservation.rate,
        color_hex: reservation.color_hex.clone(),
        comment: reservation.comment.clone(),
        guest_name: None,
        reference_code: None,
        channel: None,
    }
}

/// Guest and payment source ids resolved once per apartment
#[derive(Debug, Default)]
struct Lookups {
    guests: HashMap<String, Uuid>,
    payment_sources: HashMap<String, Uuid>,
}

impl Lookups {
    fn identity_of<'a>(&self, day: &'a ReservationDraft) -> BookingIdentity<'a> {
        BookingIdentity {
            guest_id: day.guest_name.as_deref().and_then(|n| self.guests.get(n).copied()),
            reference_code: day.reference_code.as_deref(),
            payment_source_id: day
                .channel
                .as_deref()
                .and_then(|c| self.payment_sources.get(c).copied()),
        }
    }
}

/// Fill missing identity of a day from the booking it belongs to
fn carry_identity(mut signals: DaySignals, booking: &Booking) -> DaySignals {
    if signals.guest.is_none() {
        signals.guest = booking.guest_name.clone();
    }
    if signals.reference_code.is_none() {
        signals.reference_code = booking.reference_code.clone();
    }
    signals
}

fn signals_of(reservation: &Reservation) -> DaySignals {
    let comment = reservation.comment.as_deref();
    DaySignals {
        date: reservation.date,
        guest: comment.and_then(guest_from_comment),
        reference_code: comment.and_then(reference_from_comment),
        rate: reservation.rate,
        color_hex: reservation.color_hex.clone(),
    }
}

/// The stored day before `date` and its booking, if any
async fn stored_predecessor(
    tx: &mut Box<dyn StoreTx>,
    date: NaiveDate,
) -> Result<Option<(DaySignals, Booking)>, ImportError> {
    let Some(prev_date) = date.pred_opt() else {
        return Ok(None);
    };
    let Some(reservation) = tx.reservation_on(prev_date).await? else {
        return Ok(None);
    };
    let Some(booking) = tx.booking_for_reservation(prev_date).await? else {
        return Ok(None);
    };
    Ok(Some((carry_identity(signals_of(&reservation), &booking), booking)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::continuity::ColorContinuity;
    use crate::services::entity_builder::build_sheet;
    use crate::services::layout_parser::LayoutParser;
    use crate::services::memory_store::InMemoryStore;
    use crate::services::testing::march_ledger;
    use crate::types::{BuildingDraft, MultiSheetPayload, NamedSheetPayload};

    fn d(y: i32, m: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, day).unwrap()
    }

    fn res(date: NaiveDate, rate: f64) -> ReservationDraft {
        ReservationDraft {
            date,
            rate,
            color_hex: None,
            comment: None,
            guest_name: None,
            reference_code: None,
            channel: None,
        }
    }

    fn sheet(year: i32, month: u32, building: &str, apartment: &str, days: Vec<ReservationDraft>) -> SheetPayload {
        let (code, owner) = match apartment.rsplit_once('-') {
            Some((c, o)) => (Some(c.trim().to_string()), o.trim().to_string()),
            None => (Some(apartment.to_string()), String::new()),
        };
        SheetPayload {
            month,
            year,
            buildings: vec![BuildingDraft {
                name: building.to_string(),
                apartments: vec![ApartmentDraft {
                    code,
                    owner,
                    raw_text: apartment.to_string(),
                    reservations: days,
                }],
            }],
        }
    }

    fn fast_retry() -> RetryPolicy {
        RetryPolicy {
            max_retries: 3,
            base_delay: Duration::from_millis(1),
        }
    }

    fn reconciler(store: &InMemoryStore) -> Reconciler {
        Reconciler::new(Arc::new(store.clone())).with_retry(fast_retry())
    }

    fn boundaries(bookings: &[Booking]) -> Vec<(NaiveDate, NaiveDate, f64)> {
        bookings
            .iter()
            .map(|b| (b.check_in, b.check_out, b.total_amount))
            .collect()
    }

    // ==========================================================================
    // End to end over the sample ledger
    // ==========================================================================

    #[tokio::test]
    async fn test_march_ledger_end_to_end() {
        let store = InMemoryStore::new();
        let report = LayoutParser::default().parse_grid(&march_ledger()).unwrap();
        reconciler(&store).reconcile(&build_sheet(&report)).await.unwrap();

        assert!(store.owners().iter().any(|o| o.name == "Jane Doe"));
        let a01 = store.apartment_by_code("A01").unwrap();
        let bookings = store.bookings_for(a01.id);
        assert_eq!(
            boundaries(&bookings),
            vec![
                (d(2025, 3, 1), d(2025, 3, 4), 300.0),
                (d(2025, 3, 5), d(2025, 3, 6), 120.0),
            ]
        );
        assert_eq!(bookings[0].nights, 3);
        assert_eq!(bookings[0].guest_name.as_deref(), Some("Jane Guest"));
        assert_eq!(store.reservations_for(a01.id).len(), 4);
    }

    #[tokio::test]
    async fn test_replay_is_idempotent() {
        let store = InMemoryStore::new();
        let payload = build_sheet(&LayoutParser::default().parse_grid(&march_ledger()).unwrap());
        let r = reconciler(&store);

        r.reconcile(&payload).await.unwrap();
        let a01 = store.apartment_by_code("A01").unwrap();
        let first = store.bookings_for(a01.id);
        let count = store.reservation_count();

        let summary = r.reconcile(&payload).await.unwrap();
        let second = store.bookings_for(a01.id);

        assert_eq!(store.reservation_count(), count);
        assert_eq!(summary.bookings_created, 0);
        assert_eq!(
            first.iter().map(|b| b.id).collect::<Vec<_>>(),
            second.iter().map(|b| b.id).collect::<Vec<_>>()
        );
        assert_eq!(boundaries(&first), boundaries(&second));
        assert_eq!(store.apartments().len(), 3);
        assert_eq!(store.owners().len(), 3);
    }

    // ==========================================================================
    // Continuity
    // ==========================================================================

    #[tokio::test]
    async fn test_gap_starts_new_booking() {
        let store = InMemoryStore::new();
        let days = vec![
            res(d(2025, 1, 1), 100.0),
            res(d(2025, 1, 2), 100.0),
            res(d(2025, 1, 3), 100.0),
            res(d(2025, 1, 5), 100.0),
        ];
        reconciler(&store)
            .reconcile(&sheet(2025, 1, "T", "A - Jane", days))
            .await
            .unwrap();

        let apt = store.apartment_by_code("A").unwrap();
        let bookings = store.bookings_for(apt.id);
        assert_eq!(bookings.len(), 2);
        assert_eq!((bookings[0].check_in, bookings[0].check_out), (d(2025, 1, 1), d(2025, 1, 4)));
        assert_eq!(bookings[1].check_in, d(2025, 1, 5));
    }

    #[tokio::test]
    async fn test_guest_change_splits_contiguous_days() {
        let store = InMemoryStore::new();
        let mut day1 = res(d(2025, 1, 1), 100.0);
        day1.guest_name = Some("Jane".into());
        let day2 = res(d(2025, 1, 2), 100.0);
        let mut day3 = res(d(2025, 1, 3), 90.0);
        day3.guest_name = Some("Carlos".into());

        reconciler(&store)
            .reconcile(&sheet(2025, 1, "T", "A - Owner", vec![day1, day2, day3]))
            .await
            .unwrap();

        let apt = store.apartment_by_code("A").unwrap();
        let bookings = store.bookings_for(apt.id);
        assert_eq!(bookings.len(), 2);
        assert_eq!(bookings[0].nights, 2);
        assert_eq!(bookings[0].guest_name.as_deref(), Some("Jane"));
        assert_eq!(bookings[1].guest_name.as_deref(), Some("Carlos"));
    }

    #[tokio::test]
    async fn test_rate_change_keeps_one_booking() {
        let store = InMemoryStore::new();
        let days = vec![res(d(2025, 1, 1), 100.0), res(d(2025, 1, 2), 150.0)];
        reconciler(&store)
            .reconcile(&sheet(2025, 1, "T", "A - Owner", days))
            .await
            .unwrap();
        let apt = store.apartment_by_code("A").unwrap();
        let bookings = store.bookings_for(apt.id);
        assert_eq!(bookings.len(), 1);
        assert_eq!(bookings[0].total_amount, 250.0);
    }

    #[tokio::test]
    async fn test_color_predicate_is_injectable() {
        let store = InMemoryStore::new();
        let mut day1 = res(d(2025, 1, 1), 100.0);
        day1.color_hex = Some("#FFC000".into());
        let mut day2 = res(d(2025, 1, 2), 100.0);
        day2.color_hex = Some("#548235".into());

        reconciler(&store)
            .with_predicate(Arc::new(ColorContinuity))
            .reconcile(&sheet(2025, 1, "T", "A - Owner", vec![day1, day2]))
            .await
            .unwrap();
        let apt = store.apartment_by_code("A").unwrap();
        assert_eq!(store.bookings_for(apt.id).len(), 2);
    }

    #[tokio::test]
    async fn test_stay_continues_across_month_sheets() {
        let store = InMemoryStore::new();
        let r = reconciler(&store);
        r.reconcile(&sheet(2025, 1, "T", "A - Owner", vec![
            res(d(2025, 1, 30), 100.0),
            res(d(2025, 1, 31), 100.0),
        ]))
        .await
        .unwrap();
        r.reconcile(&sheet(2025, 2, "T", "A - Owner", vec![
            res(d(2025, 2, 1), 100.0),
            res(d(2025, 2, 2), 100.0),
        ]))
        .await
        .unwrap();

        let apt = store.apartment_by_code("A").unwrap();
        let bookings = store.bookings_for(apt.id);
        assert_eq!(bookings.len(), 1);
        assert_eq!((bookings[0].check_in, bookings[0].check_out), (d(2025, 1, 30), d(2025, 2, 3)));
        assert_eq!(bookings[0].nights, 4);
    }

    #[tokio::test]
    async fn test_filled_gap_merges_and_deletes_orphan() {
        let store = InMemoryStore::new();
        let r = reconciler(&store);
        let with_gap = vec![res(d(2025, 1, 1), 100.0), res(d(2025, 1, 3), 100.0)];
        r.reconcile(&sheet(2025, 1, "T", "A - Owner", with_gap)).await.unwrap();
        let apt = store.apartment_by_code("A").unwrap();
        assert_eq!(store.bookings_for(apt.id).len(), 2);

        let filled = vec![
            res(d(2025, 1, 1), 100.0),
            res(d(2025, 1, 2), 100.0),
            res(d(2025, 1, 3), 100.0),
        ];
        let summary = r.reconcile(&sheet(2025, 1, "T", "A - Owner", filled)).await.unwrap();

        let bookings = store.bookings_for(apt.id);
        assert_eq!(bookings.len(), 1);
        assert_eq!(bookings[0].nights, 3);
        assert_eq!(summary.bookings_deleted, 1);
        assert_eq!(store.reservations_for(apt.id).len(), 3);
    }

    #[tokio::test]
    async fn test_refresh_updates_rate_and_comment() {
        let store = InMemoryStore::new();
        let r = reconciler(&store);
        r.reconcile(&sheet(2025, 1, "T", "A - Owner", vec![res(d(2025, 1, 1), 100.0)]))
            .await
            .unwrap();
        let mut changed = res(d(2025, 1, 1), 130.0);
        changed.comment = Some("late checkout".into());
        r.reconcile(&sheet(2025, 1, "T", "A - Owner", vec![changed])).await.unwrap();

        let apt = store.apartment_by_code("A").unwrap();
        let reservations = store.reservations_for(apt.id);
        assert_eq!(reservations.len(), 1);
        assert_eq!(reservations[0].rate, 130.0);
        assert_eq!(reservations[0].comment.as_deref(), Some("late checkout"));
        assert_eq!(store.bookings_for(apt.id)[0].total_amount, 130.0);
    }

    // ==========================================================================
    // Layout rules on the bulk path
    // ==========================================================================

    #[tokio::test]
    async fn test_excluded_building_writes_nothing() {
        let store = InMemoryStore::new();
        let summary = reconciler(&store)
            .reconcile(&sheet(2025, 1, "LIMPIEZAS EXTERNAS", "L1 - Cleaner", vec![
                res(d(2025, 1, 1), 30.0),
            ]))
            .await
            .unwrap();
        assert_eq!(summary.buildings_skipped, 1);
        assert!(store.buildings().is_empty());
        assert!(store.apartments().is_empty());
        assert_eq!(store.reservation_count(), 0);
    }

    #[tokio::test]
    async fn test_miscellaneous_building_forces_null_code() {
        let store = InMemoryStore::new();
        reconciler(&store)
            .reconcile(&sheet(2025, 1, "OTROS APARTAMENTOS", "Casa Playa - Juan Perez", vec![
                res(d(2025, 1, 1), 200.0),
            ]))
            .await
            .unwrap();

        let apartments = store.apartments();
        assert_eq!(apartments.len(), 1);
        assert_eq!(apartments[0].code, None);
        let owner = store.owners().into_iter().find(|o| Some(o.id) == apartments[0].owner_id).unwrap();
        assert_eq!(owner.name, "Casa Playa - Juan Perez");
    }

    #[tokio::test]
    async fn test_channel_sets_payment_source() {
        let store = InMemoryStore::new();
        let day1 = res(d(2025, 1, 1), 100.0);
        let mut day2 = res(d(2025, 1, 2), 100.0);
        day2.channel = Some("Airbnb".into());

        reconciler(&store)
            .reconcile(&sheet(2025, 1, "T", "A - Owner", vec![day1, day2]))
            .await
            .unwrap();

        let airbnb = store.find_or_create_payment_source("Airbnb").await.unwrap();
        let apt = store.apartment_by_code("A").unwrap();
        let bookings = store.bookings_for(apt.id);
        assert_eq!(bookings.len(), 1);
        assert_eq!(bookings[0].payment_source_id, Some(airbnb));
    }

    #[tokio::test]
    async fn test_later_stay_is_absorbed_when_earlier_days_arrive() {
        let store = InMemoryStore::new();
        let r = reconciler(&store);
        r.reconcile(&sheet(2025, 2, "T", "A - Owner", vec![
            res(d(2025, 2, 1), 100.0),
            res(d(2025, 2, 2), 100.0),
        ]))
        .await
        .unwrap();
        let summary = r
            .reconcile(&sheet(2025, 1, "T", "A - Owner", vec![
                res(d(2025, 1, 30), 100.0),
                res(d(2025, 1, 31), 100.0),
            ]))
            .await
            .unwrap();

        let apt = store.apartment_by_code("A").unwrap();
        let bookings = store.bookings_for(apt.id);
        assert_eq!(boundaries(&bookings), vec![(d(2025, 1, 30), d(2025, 2, 3), 400.0)]);
        assert_eq!(summary.bookings_deleted, 1);
    }

    #[tokio::test]
    async fn test_later_stay_of_other_guest_is_kept() {
        let store = InMemoryStore::new();
        let r = reconciler(&store);
        let mut later = res(d(2025, 1, 3), 100.0);
        later.guest_name = Some("Carlos".into());
        r.reconcile(&sheet(2025, 1, "T", "A - Owner", vec![later])).await.unwrap();

        let mut earlier = res(d(2025, 1, 2), 100.0);
        earlier.guest_name = Some("Jane".into());
        r.reconcile(&sheet(2025, 1, "T", "A - Owner", vec![earlier])).await.unwrap();

        let apt = store.apartment_by_code("A").unwrap();
        assert_eq!(store.bookings_for(apt.id).len(), 2);
    }

    // ==========================================================================
    // Concurrency
    // ==========================================================================

    fn stay(from: u32, to: u32) -> SheetPayload {
        let days = (from..=to)
            .map(|day| {
                let mut draft = res(d(2025, 1, day), 100.0);
                draft.guest_name = Some("Jane".into());
                draft
            })
            .collect();
        sheet(2025, 1, "T", "A - Owner", days)
    }

    fn assert_single_contiguous_stay(store: &InMemoryStore) {
        let apt = store.apartment_by_code("A").unwrap();
        let bookings = store.bookings_for(apt.id);
        assert_eq!(boundaries(&bookings), vec![(d(2025, 1, 1), d(2025, 1, 9), 800.0)]);

        let reservations = store.reservations_for(apt.id);
        assert_eq!(reservations.len(), 8);
        assert!(reservations.iter().all(|r| r.booking_id == bookings[0].id));
        assert!(reservations
            .windows(2)
            .all(|w| w[0].date.succ_opt() == Some(w[1].date)));
    }

    #[tokio::test]
    async fn test_overlapping_imports_converge_on_one_booking() {
        let store = InMemoryStore::new();
        // Separate reconcilers share only the store's apartment lock
        let (first, second) = (reconciler(&store), reconciler(&store));
        let early = stay(1, 5);
        let late = stay(3, 8);

        let (a, b) = tokio::join!(first.reconcile(&early), second.reconcile(&late));
        a.unwrap();
        b.unwrap();
        assert_single_contiguous_stay(&store);
    }

    #[tokio::test]
    async fn test_overlapping_imports_converge_in_either_order() {
        let store = InMemoryStore::new();
        let r = reconciler(&store);
        r.reconcile(&stay(3, 8)).await.unwrap();
        r.reconcile(&stay(1, 5)).await.unwrap();
        assert_single_contiguous_stay(&store);

        let other = InMemoryStore::new();
        let r = reconciler(&other);
        r.reconcile(&stay(1, 5)).await.unwrap();
        r.reconcile(&stay(3, 8)).await.unwrap();
        assert_single_contiguous_stay(&other);
    }

    // ==========================================================================
    // Retries and bulk import
    // ==========================================================================

    #[tokio::test]
    async fn test_transient_failure_is_retried() {
        let store = InMemoryStore::new();
        store.fail_next_commits(2);
        reconciler(&store)
            .reconcile(&sheet(2025, 1, "T", "A - Owner", vec![res(d(2025, 1, 1), 100.0)]))
            .await
            .unwrap();
        assert_eq!(store.reservation_count(), 1);
    }

    #[tokio::test]
    async fn test_exhausted_retries_report_conflict() {
        let store = InMemoryStore::new();
        store.fail_next_commits(10);
        let err = reconciler(&store)
            .reconcile(&sheet(2025, 1, "T", "A - Owner", vec![res(d(2025, 1, 1), 100.0)]))
            .await
            .unwrap_err();
        assert!(matches!(err, ImportError::ReconciliationConflict { attempts: 4, .. }));
        assert_eq!(store.reservation_count(), 0);
    }

    #[tokio::test]
    async fn test_import_json_multi_sheet() {
        let store = InMemoryStore::new();
        let payload = ImportPayload::Multi(MultiSheetPayload {
            sheets: vec![
                NamedSheetPayload {
                    name: "Ene. 2025".into(),
                    data: sheet(2025, 1, "T", "A - Owner", vec![res(d(2025, 1, 31), 100.0)]),
                },
                NamedSheetPayload {
                    name: "Feb. 2025".into(),
                    data: sheet(2025, 2, "T", "A - Owner", vec![res(d(2025, 2, 1), 100.0)]),
                },
            ],
        });

        let import_id = reconciler(&store).import_json(&payload).await.unwrap();
        let log = store.import_log(import_id).unwrap();
        assert_eq!(log.status, ImportLogStatus::Completed);
        assert_eq!((log.year, log.month), (2025, 2));
        assert!(log.correlation_id.is_none());

        let apt = store.apartment_by_code("A").unwrap();
        assert_eq!(store.bookings_for(apt.id).len(), 1);
    }

    #[tokio::test]
    async fn test_sheet_failure_is_recorded_on_its_log() {
        let store = InMemoryStore::new();
        let import_id = store.create_import_log(None, 2025, 1).await.unwrap();
        store.fail_next_commits(10);

        let err = reconciler(&store)
            .import_reservation_sheet(
                &sheet(2025, 1, "T", "A - Owner", vec![res(d(2025, 1, 1), 100.0)]),
                import_id,
            )
            .await
            .unwrap_err();

        let log = store.import_log(import_id).unwrap();
        assert_eq!(log.status, ImportLogStatus::Failed);
        assert_eq!(log.error_message, Some(err.to_string()));
    }

    #[tokio::test]
    async fn test_import_json_rejects_bad_month() {
        let store = InMemoryStore::new();
        let payload = ImportPayload::Single(sheet(2025, 13, "T", "A", vec![]));
        let err = reconciler(&store).import_json(&payload).await.unwrap_err();
        assert!(matches!(err, ImportError::InvalidPayload(_)));
    }

    #[test]
    fn test_retry_delay_grows() {
        let policy = RetryPolicy {
            max_retries: 3,
            base_delay: Duration::from_millis(50),
        };
        assert!(policy.delay(1) >= Duration::from_millis(50));
        assert!(policy.delay(1) <= Duration::from_millis(75));
        assert!(policy.delay(3) >= Duration::from_millis(200));
    }
}
