use chrono::NaiveDate;
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::availability::{free_spans, slice_slots};
use super::{Engine, EngineError};

impl Engine {
    /// Free intervals of a court on `date`. Unlocked read: a slot shown free may be taken by
    /// the time it is reserved.
    pub async fn availability(&self, court_id: Ulid, date: NaiveDate) -> Result<Vec<Span>, EngineError> {
        let court = self.require_court(court_id).await?;
        self.free_spans_of(&court, date).await
    }

    /// Free `granularity`-minute cells on a grid anchored at opening time, each with its price.
    pub async fn available_slots(
        &self,
        court_id: Ulid,
        date: NaiveDate,
        granularity: u16,
    ) -> Result<Vec<Slot>, EngineError> {
        if !(MIN_SLOT_MINUTES..=MAX_SLOT_MINUTES).contains(&granularity) {
            return Err(EngineError::validation(format!(
                "granularity must be between {MIN_SLOT_MINUTES} and {MAX_SLOT_MINUTES} minutes"
            )));
        }
        let court = self.require_court(court_id).await?;
        let free = self.free_spans_of(&court, date).await?;
        Ok(slice_slots(&free, court.hours.open, granularity)
            .into_iter()
            .map(|span| Slot {
                span,
                price: court.quote(&span),
            })
            .collect())
    }

    async fn free_spans_of(&self, court: &Court, date: NaiveDate) -> Result<Vec<Span>, EngineError> {
        let window = court.hours.window_on(date).filter(|_| court.active);
        if window.is_none() {
            return Ok(Vec::new());
        }
        let view = self.store.partition(PartitionKey::new(court.id, date)).await?;
        Ok(free_spans(window, &view.occupants()))
    }

    pub async fn booking(&self, id: Ulid) -> Result<Booking, EngineError> {
        self.require_booking(id).await
    }

    pub async fn court(&self, id: Ulid) -> Result<Court, EngineError> {
        self.require_court(id).await
    }

    /// Every booking a requester ever made, oldest date first.
    pub async fn bookings_for_requester(&self, requester_id: &str) -> Result<Vec<Booking>, EngineError> {
        Ok(self.store.bookings_for_requester(requester_id).await?)
    }

    /// All bookings on a court for one date, any status, by start time.
    pub async fn bookings_for_date(&self, court_id: Ulid, date: NaiveDate) -> Result<Vec<Booking>, EngineError> {
        self.require_court(court_id).await?;
        let mut bookings = self
            .store
            .partition(PartitionKey::new(court_id, date))
            .await?
            .bookings;
        bookings.sort_by_key(|b| (b.span.start, b.created_at));
        Ok(bookings)
    }

    pub async fn quote(&self, court_id: Ulid, span: Span) -> Result<Price, EngineError> {
        Ok(self.require_court(court_id).await?.quote(&span))
    }
}
