//! Month view of the stored reservations
//!
//! Answers "what is booked in building X during month M" from the store.
//! Answers are cached per building and month until the TTL runs out;
//! `refresh` skips the cache and replaces the entry.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{Datelike, NaiveDate};
use parking_lot::RwLock;
use tracing::{debug, info};

use crate::error::ImportError;
use crate::services::store::ReservationStore;
use crate::types::{ReservationListing, ReservationQueryRequest, ReservationQueryResponse};

pub const DEFAULT_QUERY_TTL: Duration = Duration::from_secs(3600);

struct CachedAnswer {
    reservations: Vec<ReservationListing>,
    stored_at: Instant,
}

pub struct ReservationQueryService {
    store: Arc<dyn ReservationStore>,
    ttl: Duration,
    answers: RwLock<HashMap<String, CachedAnswer>>,
}

impl ReservationQueryService {
    pub fn new(store: Arc<dyn ReservationStore>, ttl: Duration) -> Self {
        Self {
            store,
            ttl,
            answers: RwLock::new(HashMap::new()),
        }
    }

    pub async fn query(
        &self,
        request: &ReservationQueryRequest,
    ) -> Result<ReservationQueryResponse, ImportError> {
        let (from, until) = month_bounds(request.year, request.month)?;
        let building = request
            .building
            .as_deref()
            .map(str::trim)
            .filter(|b| !b.is_empty());
        let key = cache_key(building, request.year, request.month);

        let respond = |reservations, cached| ReservationQueryResponse {
            building: building.map(str::to_string),
            year: request.year,
            month: request.month,
            cached,
            reservations,
        };

        if !request.refresh {
            if let Some(reservations) = self.cached(&key) {
                debug!("Serving cached reservations for {}", key);
                return Ok(respond(reservations, true));
            }
        }

        let reservations = self.store.reservations_between(from, until, building).await?;
        info!("Loaded {} reservations for {}", reservations.len(), key);
        self.answers.write().insert(
            key,
            CachedAnswer {
                reservations: reservations.clone(),
                stored_at: Instant::now(),
            },
        );
        Ok(respond(reservations, false))
    }

    fn cached(&self, key: &str) -> Option<Vec<ReservationListing>> {
        let answers = self.answers.read();
        let answer = answers.get(key)?;
        (answer.stored_at.elapsed() < self.ttl).then(|| answer.reservations.clone())
    }
}

fn cache_key(building: Option<&str>, year: i32, month: u32) -> String {
    format!("{}_{:04}-{:02}", building.unwrap_or("*"), year, month)
}

/// First day of the month and first day of the next
fn month_bounds(year: i32, month: u32) -> Result<(NaiveDate, NaiveDate), ImportError> {
    let from = NaiveDate::from_ymd_opt(year, month, 1).ok_or_else(|| {
        ImportError::InvalidPayload(format!("no such month {}-{:02}", year, month))
    })?;
    let until = if from.month() == 12 {
        NaiveDate::from_ymd_opt(year + 1, 1, 1)
    } else {
        NaiveDate::from_ymd_opt(year, month + 1, 1)
    }
    .ok_or_else(|| ImportError::InvalidPayload(format!("month {}-{:02} out of range", year, month)))?;
    Ok((from, until))
}
