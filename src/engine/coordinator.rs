use std::time::Duration;

use chrono::{TimeDelta, Utc};
use tracing::debug;
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::conflict::{check_no_conflict, validate_reservation};
use super::{Engine, EngineError};

impl Engine {
    /// Book an interval outright. The booking is confirmed on return.
    pub async fn reserve(&self, input: NewReservation) -> Result<Booking, EngineError> {
        let result = self.place(input, None).await;
        record_outcome("confirmed", &result);
        result
    }

    /// Place a pending hold that lapses after `ttl` unless confirmed.
    /// A hold occupies its interval exactly like a confirmed booking.
    pub async fn hold(&self, input: NewReservation, ttl: Duration) -> Result<Booking, EngineError> {
        let result = match validate_ttl(ttl) {
            Ok(ttl) => self.place(input, Some(ttl)).await,
            Err(e) => Err(e),
        };
        record_outcome("pending", &result);
        result
    }

    async fn place(&self, input: NewReservation, ttl: Option<TimeDelta>) -> Result<Booking, EngineError> {
        let court = self.require_court(input.court_id).await?;
        let request = validate_reservation(&court, &input)?;

        let mut section = self.enter(request.key).await?;
        let occupants = section.occupied().await?;
        check_no_conflict(&request.span, &occupants)?;
        if occupants.len() >= MAX_OCCUPANTS_PER_PARTITION {
            return Err(EngineError::LimitExceeded("too many bookings on this court and date"));
        }

        let now = Utc::now();
        let (status, expires_at, kind) = match ttl {
            None => (BookingStatus::Confirmed, None, ChangeKind::Booked),
            Some(ttl) => (BookingStatus::Pending, Some(now + ttl), ChangeKind::Held),
        };
        let booking = Booking {
            id: Ulid::new(),
            court_id: request.key.court_id,
            requester_id: request.requester_id,
            date: request.key.date,
            span: request.span,
            status,
            created_at: now,
            expires_at,
            price: request.price,
        };
        section.insert_booking(booking.clone());
        let seq = section.commit().await?;
        self.notify(ChangeEvent::for_booking(kind, &booking, seq));
        drop(section);

        debug!("booking {} {} {} on {}", booking.id, booking.status, booking.span, request.key);
        Ok(booking)
    }
}

fn validate_ttl(ttl: Duration) -> Result<TimeDelta, EngineError> {
    let secs = ttl.as_secs();
    if !(MIN_HOLD_TTL_SECS..=MAX_HOLD_TTL_SECS).contains(&secs) {
        return Err(EngineError::validation(format!(
            "hold ttl must be between {MIN_HOLD_TTL_SECS} and {MAX_HOLD_TTL_SECS} seconds"
        )));
    }
    TimeDelta::from_std(ttl).map_err(|e| EngineError::validation(e.to_string()))
}

fn record_outcome(kind: &'static str, result: &Result<Booking, EngineError>) {
    let outcome = match result {
        Ok(_) => "ok",
        Err(e) => e.code(),
    };
    metrics::counter!(
        crate::observability::RESERVATIONS_TOTAL,
        "kind" => kind,
        "outcome" => outcome
    )
    .increment(1);
}
