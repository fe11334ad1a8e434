//! Store backed by process memory, for tests
//!
//! Each transaction works on a private copy of one apartment's rows and holds
//! that apartment's async lock until it is committed or dropped.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{NaiveDate, Utc};
use parking_lot::Mutex;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use uuid::Uuid;

use crate::error::ImportError;
use crate::services::store::{
    booking_aggregates, BookingIdentity, ReservationStore, StoreResult, StoreTx,
};
use crate::types::{
    Apartment, Booking, Building, Guest, ImportLog, ImportLogStatus, Owner, Reservation,
    ReservationDraft, ReservationListing,
};

#[derive(Debug, Default, Clone)]
struct Tables {
    buildings: Vec<Building>,
    owners: Vec<Owner>,
    apartments: Vec<Apartment>,
    guests: Vec<Guest>,
    payment_sources: Vec<(Uuid, String)>,
    bookings: Vec<Booking>,
    reservations: Vec<Reservation>,
    import_logs: Vec<ImportLog>,
}

/// Store backed by process memory
#[derive(Clone, Default)]
pub struct InMemoryStore {
    tables: Arc<Mutex<Tables>>,
    apartment_locks: Arc<Mutex<HashMap<Uuid, Arc<AsyncMutex<()>>>>>,
    failing_commits: Arc<Mutex<u32>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `n` commits fail with a transient storage error
    pub fn fail_next_commits(&self, n: u32) {
        *self.failing_commits.lock() = n;
    }

    pub fn buildings(&self) -> Vec<Building> {
        self.tables.lock().buildings.clone()
    }

    pub fn owners(&self) -> Vec<Owner> {
        self.tables.lock().owners.clone()
    }

    pub fn apartments(&self) -> Vec<Apartment> {
        self.tables.lock().apartments.clone()
    }

    pub fn apartment_by_code(&self, code: &str) -> Option<Apartment> {
        self.tables
            .lock()
            .apartments
            .iter()
            .find(|a| a.code.as_deref() == Some(code))
            .cloned()
    }

    /// Bookings of an apartment ordered by check-in, guest names joined
    pub fn bookings_for(&self, apartment_id: Uuid) -> Vec<Booking> {
        let tables = self.tables.lock();
        let mut bookings: Vec<Booking> = tables
            .bookings
            .iter()
            .filter(|b| b.apartment_id == apartment_id)
            .map(|b| with_guest_name(b.clone(), &tables.guests))
            .collect();
        bookings.sort_by_key(|b| b.check_in);
        bookings
    }

    /// Reservations of an apartment ordered by date
    pub fn reservations_for(&self, apartment_id: Uuid) -> Vec<Reservation> {
        let tables = self.tables.lock();
        let mut reservations: Vec<Reservation> = tables
            .reservations
            .iter()
            .filter(|r| r.apartment_id == apartment_id)
            .cloned()
            .collect();
        reservations.sort_by_key(|r| r.date);
        reservations
    }

    pub fn reservation_count(&self) -> usize {
        self.tables.lock().reservations.len()
    }

    pub fn import_log(&self, id: Uuid) -> Option<ImportLog> {
        self.tables
            .lock()
            .import_logs
            .iter()
            .find(|l| l.id == id)
            .cloned()
    }

    fn apartment_lock(&self, apartment_id: Uuid) -> Arc<AsyncMutex<()>> {
        self.apartment_locks
            .lock()
            .entry(apartment_id)
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone()
    }
}

fn with_guest_name(mut booking: Booking, guests: &[Guest]) -> Booking {
    booking.guest_name = booking
        .guest_id
        .and_then(|id| guests.iter().find(|g| g.id == id))
        .map(|g| g.name.clone());
    booking
}

#[async_trait]
impl ReservationStore for InMemoryStore {
    async fn find_or_create_building(&self, name: &str) -> StoreResult<Uuid> {
        let mut tables = self.tables.lock();
        if let Some(b) = tables.buildings.iter().find(|b| b.name == name) {
            return Ok(b.id);
        }
        let id = Uuid::new_v4();
        tables.buildings.push(Building {
            id,
            name: name.to_string(),
            active: true,
        });
        Ok(id)
    }

    async fn find_or_create_owner(&self, name: &str) -> StoreResult<Uuid> {
        let mut tables = self.tables.lock();
        if let Some(o) = tables.owners.iter().find(|o| o.name == name) {
            return Ok(o.id);
        }
        let id = Uuid::new_v4();
        tables.owners.push(Owner {
            id,
            name: name.to_string(),
            email: None,
            phone: None,
            active: true,
        });
        Ok(id)
    }

    async fn find_or_create_apartment(
        &self,
        building_id: Uuid,
        raw_text: &str,
        code: Option<&str>,
        owner_id: Option<Uuid>,
    ) -> StoreResult<Uuid> {
        let mut tables = self.tables.lock();
        if let Some(a) = tables
            .apartments
            .iter_mut()
            .find(|a| a.building_id == building_id && a.raw_text == raw_text)
        {
            if a.code.is_none() {
                a.code = code.map(str::to_string);
            }
            if a.owner_id.is_none() {
                a.owner_id = owner_id;
            }
            return Ok(a.id);
        }
        let id = Uuid::new_v4();
        tables.apartments.push(Apartment {
            id,
            code: code.map(str::to_string),
            raw_text: raw_text.to_string(),
            building_id,
            owner_id,
            active: true,
            admin_fee_percentage: 25.0,
        });
        Ok(id)
    }

    async fn find_or_create_guest(&self, name: &str) -> StoreResult<Uuid> {
        let mut tables = self.tables.lock();
        if let Some(g) = tables.guests.iter().find(|g| g.name == name) {
            return Ok(g.id);
        }
        let id = Uuid::new_v4();
        tables.guests.push(Guest {
            id,
            name: name.to_string(),
            email: None,
            phone: None,
        });
        Ok(id)
    }

    async fn find_or_create_payment_source(&self, name: &str) -> StoreResult<Uuid> {
        let mut tables = self.tables.lock();
        if let Some((id, _)) = tables.payment_sources.iter().find(|(_, n)| n == name) {
            return Ok(*id);
        }
        let id = Uuid::new_v4();
        tables.payment_sources.push((id, name.to_string()));
        Ok(id)
    }

    async fn create_import_log(
        &self,
        correlation_id: Option<Uuid>,
        year: i32,
        month: i32,
    ) -> StoreResult<Uuid> {
        let id = Uuid::new_v4();
        self.tables.lock().import_logs.push(ImportLog {
            id,
            correlation_id,
            year,
            month,
            status: ImportLogStatus::InProgress,
            error_message: None,
            import_date: Utc::now(),
        });
        Ok(id)
    }

    async fn finish_import_log(
        &self,
        id: Uuid,
        status: ImportLogStatus,
        error_message: Option<&str>,
    ) -> StoreResult<()> {
        let mut tables = self.tables.lock();
        if let Some(log) = tables.import_logs.iter_mut().find(|l| l.id == id) {
            log.status = status;
            log.error_message = error_message.map(str::to_string);
        }
        Ok(())
    }

    async fn import_logs(&self, correlation_id: Uuid) -> StoreResult<Vec<ImportLog>> {
        Ok(self
            .tables
            .lock()
            .import_logs
            .iter()
            .filter(|l| l.correlation_id == Some(correlation_id))
            .cloned()
            .collect())
    }

    async fn reservations_between(
        &self,
        from: NaiveDate,
        until: NaiveDate,
        building: Option<&str>,
    ) -> StoreResult<Vec<ReservationListing>> {
        let tables = self.tables.lock();
        let mut rows = Vec::new();
        for r in tables.reservations.iter().filter(|r| r.date >= from && r.date < until) {
            let Some(apartment) = tables.apartments.iter().find(|a| a.id == r.apartment_id) else {
                continue;
            };
            let Some(bu) = tables.buildings.iter().find(|b| b.id == apartment.building_id) else {
                continue;
            };
            if building.is_some_and(|name| name != bu.name) {
                continue;
            }
            let Some(booking) = tables.bookings.iter().find(|b| b.id == r.booking_id) else {
                continue;
            };
            let booking = with_guest_name(booking.clone(), &tables.guests);
            let payment_source = booking
                .payment_source_id
                .and_then(|id| tables.payment_sources.iter().find(|(p, _)| *p == id))
                .map(|(_, name)| name.clone());
            rows.push(ReservationListing {
                building: bu.name.clone(),
                apartment: apartment.raw_text.clone(),
                apartment_code: apartment.code.clone(),
                date: r.date,
                rate: r.rate,
                color_hex: r.color_hex.clone(),
                comment: r.comment.clone(),
                booking_id: booking.id,
                check_in: booking.check_in,
                check_out: booking.check_out,
                guest_name: booking.guest_name,
                payment_source,
            });
        }
        rows.sort_by(|a, b| {
            (&a.building, &a.apartment, a.date).cmp(&(&b.building, &b.apartment, b.date))
        });
        Ok(rows)
    }

    async fn begin_apartment(&self, apartment_id: Uuid) -> StoreResult<Box<dyn StoreTx>> {
        let held = self.apartment_lock(apartment_id).lock_owned().await;
        let (bookings, reservations) = {
            let tables = self.tables.lock();
            (
                tables
                    .bookings
                    .iter()
                    .filter(|b| b.apartment_id == apartment_id)
                    .cloned()
                    .collect(),
                tables
                    .reservations
                    .iter()
                    .filter(|r| r.apartment_id == apartment_id)
                    .cloned()
                    .collect(),
            )
        };
        Ok(Box::new(InMemoryTx {
            store: self.clone(),
            apartment_id,
            bookings,
            reservations,
            _held: held,
        }))
    }
}

/// Works on a private copy of one apartment's rows until commit
struct InMemoryTx {
    store: InMemoryStore,
    apartment_id: Uuid,
    bookings: Vec<Booking>,
    reservations: Vec<Reservation>,
    _held: OwnedMutexGuard<()>,
}

impl InMemoryTx {
    fn booking(&self, id: Uuid) -> Option<Booking> {
        let guests = self.store.tables.lock().guests.clone();
        self.bookings
            .iter()
            .find(|b| b.id == id)
            .map(|b| with_guest_name(b.clone(), &guests))
    }
}

#[async_trait]
impl StoreTx for InMemoryTx {
    async fn reservation_on(&mut self, date: NaiveDate) -> StoreResult<Option<Reservation>> {
        Ok(self.reservations.iter().find(|r| r.date == date).cloned())
    }

    async fn booking_for_reservation(&mut self, date: NaiveDate) -> StoreResult<Option<Booking>> {
        let booking_id = self
            .reservations
            .iter()
            .find(|r| r.date == date)
            .map(|r| r.booking_id);
        Ok(booking_id.and_then(|id| self.booking(id)))
    }

    async fn create_booking(
        &mut self,
        check_in: NaiveDate,
        identity: BookingIdentity<'_>,
    ) -> StoreResult<Booking> {
        let booking = Booking {
            id: Uuid::new_v4(),
            apartment_id: self.apartment_id,
            guest_id: identity.guest_id,
            check_in,
            check_out: check_in.succ_opt().unwrap_or(check_in),
            nights: 1,
            total_amount: 0.0,
            reference_code: identity.reference_code.map(str::to_string),
            payment_source_id: identity.payment_source_id,
            open: true,
            guest_name: None,
        };
        self.bookings.push(booking.clone());
        Ok(self.booking(booking.id).unwrap_or(booking))
    }

    async fn upsert_reservation(
        &mut self,
        booking_id: Uuid,
        draft: &ReservationDraft,
    ) -> StoreResult<Option<Uuid>> {
        if let Some(existing) = self.reservations.iter_mut().find(|r| r.date == draft.date) {
            let previous = existing.booking_id;
            existing.booking_id = booking_id;
            existing.rate = draft.rate;
            existing.color_hex = draft.color_hex.clone();
            existing.comment = draft.comment.clone();
            return Ok((previous != booking_id).then_some(previous));
        }
        self.reservations.push(Reservation {
            id: Uuid::new_v4(),
            booking_id,
            apartment_id: self.apartment_id,
            date: draft.date,
            rate: draft.rate,
            color_hex: draft.color_hex.clone(),
            comment: draft.comment.clone(),
        });
        Ok(None)
    }

    async fn set_booking_identity(
        &mut self,
        booking_id: Uuid,
        identity: BookingIdentity<'_>,
    ) -> StoreResult<()> {
        if let Some(b) = self.bookings.iter_mut().find(|b| b.id == booking_id) {
            if b.guest_id.is_none() {
                b.guest_id = identity.guest_id;
            }
            if b.reference_code.is_none() {
                b.reference_code = identity.reference_code.map(str::to_string);
            }
            if b.payment_source_id.is_none() {
                b.payment_source_id = identity.payment_source_id;
            }
        }
        Ok(())
    }

    async fn recompute_booking(&mut self, booking_id: Uuid) -> StoreResult<Option<Booking>> {
        let attached: Vec<&Reservation> = self
            .reservations
            .iter()
            .filter(|r| r.booking_id == booking_id)
            .collect();

        match booking_aggregates(&attached) {
            Some((check_in, check_out, nights, total)) => {
                if let Some(b) = self.bookings.iter_mut().find(|b| b.id == booking_id) {
                    b.check_in = check_in;
                    b.check_out = check_out;
                    b.nights = nights;
                    b.total_amount = total;
                }
                Ok(self.booking(booking_id))
            }
            None => {
                self.bookings.retain(|b| b.id != booking_id);
                Ok(None)
            }
        }
    }

    async fn commit(self: Box<Self>) -> StoreResult<()> {
        {
            let mut failing = self.store.failing_commits.lock();
            if *failing > 0 {
                *failing -= 1;
                return Err(ImportError::Storage(sqlx::Error::PoolTimedOut));
            }
        }

        let mut tables = self.store.tables.lock();
        let apartment_id = self.apartment_id;
        tables.bookings.retain(|b| b.apartment_id != apartment_id);
        tables.bookings.extend(self.bookings.iter().cloned());
        tables.reservations.retain(|r| r.apartment_id != apartment_id);
        tables.reservations.extend(self.reservations.iter().cloned());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn draft(day: u32, rate: f64) -> ReservationDraft {
        ReservationDraft {
            date: NaiveDate::from_ymd_opt(2025, 3, day).unwrap(),
            rate,
            color_hex: None,
            comment: None,
            guest_name: None,
            reference_code: None,
            channel: None,
        }
    }

    async fn apartment(store: &InMemoryStore) -> Uuid {
        let building = store.find_or_create_building("TORRE").await.unwrap();
        store
            .find_or_create_apartment(building, "A01 - Jane", Some("A01"), None)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_find_or_create_is_idempotent() {
        let store = InMemoryStore::new();
        let a = store.find_or_create_building("TORRE").await.unwrap();
        let b = store.find_or_create_building("TORRE").await.unwrap();
        assert_eq!(a, b);
        assert_eq!(store.buildings().len(), 1);

        let airbnb = store.find_or_create_payment_source("Airbnb").await.unwrap();
        let booking = store.find_or_create_payment_source("Booking.com").await.unwrap();
        assert_ne!(airbnb, booking);
        assert_eq!(store.find_or_create_payment_source("Airbnb").await.unwrap(), airbnb);
    }

    #[tokio::test]
    async fn test_apartment_fields_are_gap_filled_only() {
        let store = InMemoryStore::new();
        let building = store.find_or_create_building("TORRE").await.unwrap();
        let owner = store.find_or_create_owner("Jane").await.unwrap();
        let other = store.find_or_create_owner("Other").await.unwrap();

        let id = store
            .find_or_create_apartment(building, "A01 - Jane", None, Some(owner))
            .await
            .unwrap();
        store
            .find_or_create_apartment(building, "A01 - Jane", Some("A01"), Some(other))
            .await
            .unwrap();

        let apt = store.apartments().into_iter().find(|a| a.id == id).unwrap();
        assert_eq!(apt.code.as_deref(), Some("A01"));
        assert_eq!(apt.owner_id, Some(owner));
    }

    #[tokio::test]
    async fn test_uncommitted_writes_are_discarded() {
        let store = InMemoryStore::new();
        let apt = apartment(&store).await;
        {
            let mut tx = store.begin_apartment(apt).await.unwrap();
            let d = draft(1, 100.0);
            let booking = tx.create_booking(d.date, BookingIdentity::default()).await.unwrap();
            tx.upsert_reservation(booking.id, &d).await.unwrap();
        }
        assert_eq!(store.reservation_count(), 0);
        assert!(store.bookings_for(apt).is_empty());
    }

    #[tokio::test]
    async fn test_recompute_booking_aggregates() {
        let store = InMemoryStore::new();
        let apt = apartment(&store).await;
        let mut tx = store.begin_apartment(apt).await.unwrap();
        let first = draft(1, 100.0);
        let booking = tx.create_booking(first.date, BookingIdentity::default()).await.unwrap();
        for d in [first, draft(2, 100.0), draft(3, 120.0)] {
            tx.upsert_reservation(booking.id, &d).await.unwrap();
        }
        let booking = tx.recompute_booking(booking.id).await.unwrap().unwrap();
        tx.commit().await.unwrap();

        assert_eq!(booking.check_in, NaiveDate::from_ymd_opt(2025, 3, 1).unwrap());
        assert_eq!(booking.check_out, NaiveDate::from_ymd_opt(2025, 3, 4).unwrap());
        assert_eq!(booking.nights, 3);
        assert_eq!(booking.total_amount, 320.0);
    }

    #[tokio::test]
    async fn test_moving_last_reservation_deletes_booking() {
        let store = InMemoryStore::new();
        let apt = apartment(&store).await;
        let mut tx = store.begin_apartment(apt).await.unwrap();
        let d = draft(1, 100.0);
        let old = tx.create_booking(d.date, BookingIdentity::default()).await.unwrap();
        tx.upsert_reservation(old.id, &d).await.unwrap();
        let new = tx.create_booking(d.date, BookingIdentity::default()).await.unwrap();

        let displaced = tx.upsert_reservation(new.id, &d).await.unwrap();
        assert_eq!(displaced, Some(old.id));
        assert!(tx.recompute_booking(old.id).await.unwrap().is_none());
        tx.recompute_booking(new.id).await.unwrap();
        tx.commit().await.unwrap();

        assert_eq!(store.bookings_for(apt).len(), 1);
    }

    #[tokio::test]
    async fn test_booking_identity_joins_guest_name() {
        let store = InMemoryStore::new();
        let apt = apartment(&store).await;
        let guest = store.find_or_create_guest("Jane Guest").await.unwrap();
        let mut tx = store.begin_apartment(apt).await.unwrap();
        let d = draft(1, 100.0);
        let booking = tx.create_booking(d.date, BookingIdentity::default()).await.unwrap();
        tx.upsert_reservation(booking.id, &d).await.unwrap();
        let airbnb = store.find_or_create_payment_source("Airbnb").await.unwrap();
        let first = BookingIdentity {
            guest_id: Some(guest),
            reference_code: Some("HMX4K2PQ"),
            payment_source_id: None,
        };
        tx.set_booking_identity(booking.id, first).await.unwrap();
        let other = store.find_or_create_guest("Other").await.unwrap();
        let second = BookingIdentity {
            guest_id: Some(other),
            reference_code: None,
            payment_source_id: Some(airbnb),
        };
        tx.set_booking_identity(booking.id, second).await.unwrap();

        let found = tx
            .booking_for_reservation(d.date)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(found.guest_name.as_deref(), Some("Jane Guest"));
        assert_eq!(found.reference_code.as_deref(), Some("HMX4K2PQ"));
        assert_eq!(found.payment_source_id, Some(airbnb));
    }

    #[tokio::test]
    async fn test_failing_commit_is_retryable() {
        let store = InMemoryStore::new();
        let apt = apartment(&store).await;
        store.fail_next_commits(1);
        let tx = store.begin_apartment(apt).await.unwrap();
        let err = tx.commit().await.unwrap_err();
        assert!(err.is_retryable());
        let tx = store.begin_apartment(apt).await.unwrap();
        assert!(tx.commit().await.is_ok());
    }

}
