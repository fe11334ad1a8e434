//! Owner booking reports
//!
//! Two passes, each run on its own schedule:
//! - `queue_reports` collects bookings created since the previous pass (minus
//!   a settling buffer), groups them by apartment owner and stores one pending
//!   communication per owner with those bookings linked to it.
//! - `send_approved` renders and mails every approved communication. A failed
//!   send marks it failed and counts an attempt; it is retried only after it
//!   has been approved again, up to `max_attempts` attempts.

use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, NaiveDate, Utc};
use serde::Serialize;
use tracing::{info, warn};
use uuid::Uuid;

use crate::services::email_sender::{EmailMessage, EmailSender};
use crate::services::store::StoreResult;
use crate::types::{Communication, CommunicationDraft, ReportBooking};

/// Task name under which the queue pass records its runs
pub const QUEUE_TASK: &str = "queue_owner_reports";

/// Persistence of communications and their bookings
#[async_trait]
pub trait ReportStore: Send + Sync {
    /// Previous run of `task`; the first call records `now` and returns it
    async fn last_run(&self, task: &str, now: DateTime<Utc>) -> StoreResult<DateTime<Utc>>;

    async fn record_run(&self, task: &str, at: DateTime<Utc>) -> StoreResult<()>;

    /// Bookings created in `(since, until)` on owned apartments and not yet
    /// linked to any communication, by owner then check-in
    async fn unreported_bookings(
        &self,
        since: DateTime<Utc>,
        until: DateTime<Utc>,
    ) -> StoreResult<Vec<ReportBooking>>;

    /// Store a pending communication with its bookings, all or nothing
    async fn create_communication(
        &self,
        draft: &CommunicationDraft,
        booking_ids: &[Uuid],
    ) -> StoreResult<Uuid>;

    /// Approved communications with fewer than `max_attempts` failed sends
    async fn approved_communications(&self, max_attempts: i32) -> StoreResult<Vec<Communication>>;

    /// Linked bookings not excluded from the report, by check-in
    async fn communication_bookings(&self, communication_id: Uuid) -> StoreResult<Vec<ReportBooking>>;

    async fn set_communication_content(&self, communication_id: Uuid, html: &str) -> StoreResult<()>;

    async fn mark_communication_sent(&self, communication_id: Uuid) -> StoreResult<()>;

    /// Mark failed and count the attempt
    async fn mark_communication_failed(&self, communication_id: Uuid) -> StoreResult<()>;
}

#[derive(Debug, Clone)]
pub struct ReportSettings {
    /// Bookings younger than this wait for the next pass
    pub settle_buffer: Duration,
    pub max_attempts: i32,
}

impl Default for ReportSettings {
    fn default() -> Self {
        Self {
            settle_buffer: Duration::days(1),
            max_attempts: 3,
        }
    }
}

#[derive(Debug, Default, Clone, PartialEq, Serialize)]
pub struct QueueSummary {
    pub bookings: usize,
    pub communications: usize,
    /// Owners left out because no email address is on file
    pub owners_without_email: usize,
}

#[derive(Debug, Default, Clone, PartialEq, Serialize)]
pub struct SendSummary {
    pub sent: usize,
    pub failed: usize,
}

pub struct OwnerReportService {
    store: Arc<dyn ReportStore>,
    sender: Arc<dyn EmailSender>,
    settings: ReportSettings,
}

impl OwnerReportService {
    pub fn new(store: Arc<dyn ReportStore>, sender: Arc<dyn EmailSender>) -> Self {
        Self {
            store,
            sender,
            settings: ReportSettings::default(),
        }
    }

    pub fn with_settings(mut self, settings: ReportSettings) -> Self {
        self.settings = settings;
        self
    }

    pub async fn queue_reports(&self, now: DateTime<Utc>) -> StoreResult<QueueSummary> {
        let since = self.store.last_run(QUEUE_TASK, now).await?;
        let until = now - self.settings.settle_buffer;
        let bookings = self.store.unreported_bookings(since, until).await?;
        info!("{} new bookings created between {} and {}", bookings.len(), since, until);

        let mut summary = QueueSummary {
            bookings: bookings.len(),
            ..Default::default()
        };

        let mut by_owner: BTreeMap<Uuid, Vec<ReportBooking>> = BTreeMap::new();
        for booking in bookings {
            by_owner.entry(booking.owner_id).or_default().push(booking);
        }

        for (owner_id, bookings) in by_owner {
            let Some(draft) = communication_for(owner_id, &bookings) else {
                warn!(
                    "Owner '{}' has {} new bookings but no email address",
                    bookings[0].owner_name,
                    bookings.len()
                );
                summary.owners_without_email += 1;
                continue;
            };
            let ids: Vec<Uuid> = bookings.iter().map(|b| b.booking_id).collect();
            let id = self.store.create_communication(&draft, &ids).await?;
            info!("Queued report {} for {} ({} bookings)", id, draft.recipient_email, ids.len());
            summary.communications += 1;
        }

        // The next pass starts where this one stopped looking
        self.store.record_run(QUEUE_TASK, until.max(since)).await?;
        Ok(summary)
    }

    pub async fn send_approved(&self) -> StoreResult<SendSummary> {
        let communications = self
            .store
            .approved_communications(self.settings.max_attempts)
            .await?;
        info!(
            "{} approved reports to send via {}",
            communications.len(),
            self.sender.name()
        );

        let mut summary = SendSummary::default();
        for communication in communications {
            if self.send_one(&communication).await? {
                summary.sent += 1;
            } else {
                summary.failed += 1;
            }
        }
        Ok(summary)
    }

    async fn send_one(&self, communication: &Communication) -> StoreResult<bool> {
        let bookings = self.store.communication_bookings(communication.id).await?;
        if bookings.is_empty() {
            warn!("Report {} has no bookings left to report", communication.id);
            self.store.mark_communication_failed(communication.id).await?;
            return Ok(false);
        }

        let mut message = OwnerReport {
            communication,
            bookings: &bookings,
        }
        .render();
        match &communication.content {
            Some(html) => message.html = html.clone(),
            None => {
                self.store
                    .set_communication_content(communication.id, &message.html)
                    .await?
            }
        }

        match self.sender.send(message).await {
            Ok(()) => {
                self.store.mark_communication_sent(communication.id).await?;
                info!("Report {} sent to {}", communication.id, communication.recipient_email);
                Ok(true)
            }
            Err(e) => {
                warn!("Report {} not sent: {:#}", communication.id, e);
                self.store.mark_communication_failed(communication.id).await?;
                Ok(false)
            }
        }
    }
}

/// One owner's communication; `None` when the owner has no address
fn communication_for(owner_id: Uuid, bookings: &[ReportBooking]) -> Option<CommunicationDraft> {
    let recipient_email = bookings
        .iter()
        .find_map(|b| b.owner_email.as_deref())
        .map(str::trim)
        .filter(|e| !e.is_empty())?
        .to_string();
    let start = bookings.iter().map(|b| b.check_in).min()?;
    let end = bookings.iter().map(|b| b.check_out).max()?;
    Some(CommunicationDraft {
        owner_id,
        recipient_email,
        subject: report_subject(start, end),
        report_period_start: start,
        report_period_end: end,
    })
}

pub fn report_subject(start: NaiveDate, end: NaiveDate) -> String {
    format!(
        "Nuevas reservas en su propiedad ({} - {})",
        start.format("%d/%m/%Y"),
        end.format("%d/%m/%Y")
    )
}

// =============================================================================
// Report email
// =============================================================================

pub struct OwnerReport<'a> {
    pub communication: &'a Communication,
    pub bookings: &'a [ReportBooking],
}

impl OwnerReport<'_> {
    pub fn render(&self) -> EmailMessage {
        let total: f64 = self.bookings.iter().map(|b| b.total_amount).sum();
        let fee: f64 = self.bookings.iter().map(ReportBooking::admin_fee).sum();
        let owner: f64 = self.bookings.iter().map(ReportBooking::owner_amount).sum();
        let pct = self.bookings.first().map_or(0.0, |b| b.admin_fee_percentage);
        let name = escape_html(&self.communication.owner_name);

        let mut html = format!("<p>Estimado/a {},</p>\n", name);
        html.push_str("<p>Le informamos de las nuevas reservas en su propiedad:</p>\n");
        if let Some(note) = &self.communication.custom_message {
            let _ = writeln!(html, "<p>{}</p>", escape_html(note));
        }
        html.push_str(
            "<table>\n<tr><th>Apartamento</th><th>Huésped</th><th>Entrada</th><th>Salida</th>\
             <th>Noches</th><th>Total</th><th>Comisión</th><th>Propietario</th></tr>\n",
        );

        let mut text = format!(
            "Estimado/a {},\n\nLe informamos de las nuevas reservas en su propiedad:\n\n",
            self.communication.owner_name
        );
        if let Some(note) = &self.communication.custom_message {
            let _ = writeln!(text, "{}\n", note);
        }

        for b in self.bookings {
            let guest = b.guest_name.as_deref().unwrap_or("-");
            let _ = writeln!(
                html,
                "<tr><td>{}</td><td>{}</td><td>{}</td><td>{}</td><td>{}</td>\
                 <td>{:.2} €</td><td>{:.2} €</td><td>{:.2} €</td></tr>",
                escape_html(&b.apartment),
                escape_html(guest),
                b.check_in.format("%d/%m/%Y"),
                b.check_out.format("%d/%m/%Y"),
                b.nights,
                b.total_amount,
                b.admin_fee(),
                b.owner_amount()
            );
            let _ = writeln!(
                text,
                "- {} | {} | {} - {} | {} noches | {:.2} € (comisión {:.2} €, propietario {:.2} €)",
                b.apartment,
                guest,
                b.check_in.format("%d/%m/%Y"),
                b.check_out.format("%d/%m/%Y"),
                b.nights,
                b.total_amount,
                b.admin_fee(),
                b.owner_amount()
            );
        }

        let _ = write!(
            html,
            "</table>\n<p>Total: {:.2} €<br>Comisión de gestión ({:.0}%): {:.2} €<br>\
             Importe propietario: {:.2} €</p>\n",
            total, pct, fee, owner
        );
        let _ = write!(
            text,
            "\nTotal: {:.2} €\nComisión de gestión ({:.0}%): {:.2} €\nImporte propietario: {:.2} €\n",
            total, pct, fee, owner
        );

        EmailMessage {
            to: self.communication.recipient_email.clone(),
            subject: self.communication.subject.clone(),
            html,
            text,
        }
    }
}

fn escape_html(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for c in raw.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(c),
        }
    }
    out
}
