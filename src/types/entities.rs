//! Persisted entities of the reservation ledger

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, Type};
use uuid::Uuid;

/// A property complex
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Building {
    pub id: Uuid,
    pub name: String,
    pub active: bool,
}

/// Apartment owner, recipient of reports
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Owner {
    pub id: Uuid,
    pub name: String,
    pub email: Option<String>,
    pub phone: Option<String>,
    pub active: bool,
}

/// A rentable unit
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Apartment {
    pub id: Uuid,
    /// Always `None` for apartments of the miscellaneous building
    pub code: Option<String>,
    pub raw_text: String,
    pub building_id: Uuid,
    pub owner_id: Option<Uuid>,
    pub active: bool,
    /// Managed outside the importer
    pub admin_fee_percentage: f64,
}

/// Renter
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Guest {
    pub id: Uuid,
    pub name: String,
    pub email: Option<String>,
    pub phone: Option<String>,
}

/// One continuous stay
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Booking {
    pub id: Uuid,
    pub apartment_id: Uuid,
    pub guest_id: Option<Uuid>,
    pub check_in: NaiveDate,
    /// Exclusive: the morning the guest leaves
    pub check_out: NaiveDate,
    pub nights: i32,
    pub total_amount: f64,
    pub reference_code: Option<String>,
    /// Channel the stay was sold through
    pub payment_source_id: Option<Uuid>,
    /// Open bookings may still be extended by later days
    pub open: bool,
    /// Joined from `guests.name`, not a column of `bookings`
    #[sqlx(default)]
    pub guest_name: Option<String>,
}

/// One apartment-day
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Reservation {
    pub id: Uuid,
    pub booking_id: Uuid,
    pub apartment_id: Uuid,
    pub date: NaiveDate,
    pub rate: f64,
    pub color_hex: Option<String>,
    pub comment: Option<String>,
}

/// A stored reservation with its building, apartment and booking
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
#[serde(rename_all = "camelCase")]
pub struct ReservationListing {
    pub building: String,
    pub apartment: String,
    pub apartment_code: Option<String>,
    pub date: NaiveDate,
    pub rate: f64,
    pub color_hex: Option<String>,
    pub comment: Option<String>,
    pub booking_id: Uuid,
    pub check_in: NaiveDate,
    pub check_out: NaiveDate,
    pub guest_name: Option<String>,
    pub payment_source: Option<String>,
}

/// Lookup table for color semantics
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct ColorMeaning {
    pub rgb_hex: String,
    pub meaning: String,
}

/// Status of one processed sheet
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Type)]
#[sqlx(type_name = "import_log_status", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum ImportLogStatus {
    InProgress,
    Completed,
    Failed,
}

/// One row per processed sheet
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct ImportLog {
    pub id: Uuid,
    pub correlation_id: Option<Uuid>,
    pub year: i32,
    pub month: i32,
    pub status: ImportLogStatus,
    pub error_message: Option<String>,
    pub import_date: DateTime<Utc>,
}
