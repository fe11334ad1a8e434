//! Owner report types

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, Type};
use uuid::Uuid;

/// Life cycle of an owner communication; approval happens outside the worker
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Type)]
#[sqlx(type_name = "communication_status", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum CommunicationStatus {
    Pending,
    Approved,
    Sent,
    Failed,
}

/// A booking as it appears in an owner report
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct ReportBooking {
    pub booking_id: Uuid,
    pub owner_id: Uuid,
    pub owner_name: String,
    pub owner_email: Option<String>,
    /// Apartment code, or the row label when there is none
    pub apartment: String,
    pub guest_name: Option<String>,
    pub check_in: NaiveDate,
    pub check_out: NaiveDate,
    pub nights: i32,
    pub total_amount: f64,
    pub admin_fee_percentage: f64,
}

impl ReportBooking {
    pub fn admin_fee(&self) -> f64 {
        self.total_amount * self.admin_fee_percentage / 100.0
    }

    pub fn owner_amount(&self) -> f64 {
        self.total_amount - self.admin_fee()
    }
}

/// New communication, before it is stored
#[derive(Debug, Clone, PartialEq)]
pub struct CommunicationDraft {
    pub owner_id: Uuid,
    pub recipient_email: String,
    pub subject: String,
    pub report_period_start: NaiveDate,
    pub report_period_end: NaiveDate,
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Communication {
    pub id: Uuid,
    pub owner_id: Uuid,
    /// Joined from `owners.name`
    pub owner_name: String,
    pub recipient_email: String,
    pub subject: String,
    /// Rendered HTML, stored on first send
    pub content: Option<String>,
    /// Free text added by whoever approved the report
    pub custom_message: Option<String>,
    pub status: CommunicationStatus,
    pub retry_count: i32,
    pub report_period_start: Option<NaiveDate>,
    pub report_period_end: Option<NaiveDate>,
    pub created_at: DateTime<Utc>,
}
