use chrono::{DateTime, NaiveDateTime, Utc};
use tracing::{debug, info};
use ulid::Ulid;

use crate::limits::MAX_TRANSITION_RETRIES;
use crate::model::*;

use super::conflict::validate_actor;
use super::{Engine, EngineError};

/// Result of a cancel request. `already_cancelled` is set when the call changed nothing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CancelOutcome {
    pub booking: Booking,
    pub already_cancelled: bool,
}

/// What one sweeper pass changed.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SweepReport {
    pub expired: usize,
    pub completed: usize,
}

impl Engine {
    /// `pending -> confirmed`. Fails with `HoldExpired` once the hold has lapsed; the lapsed
    /// hold is released on the spot. Expiry is judged inside the section, so a hold that lapses
    /// while the caller waits for the partition is not confirmed.
    pub async fn confirm(&self, id: Ulid) -> Result<Booking, EngineError> {
        for _ in 0..MAX_TRANSITION_RETRIES {
            let booking = self.require_booking(id).await?;
            ensure_transition(&booking, BookingStatus::Confirmed)?;

            let mut section = self.enter(booking.key()).await?;
            // `expires_at` is fixed while pending; the CAS below proves it still is.
            let expired = booking.is_expired(Utc::now());
            let to = if expired {
                BookingStatus::Cancelled
            } else {
                BookingStatus::Confirmed
            };
            let Some(updated) = section.set_status(id, BookingStatus::Pending, to).await? else {
                continue;
            };
            let seq = section.commit().await?;

            if expired {
                self.notify(ChangeEvent::for_booking(ChangeKind::Cancelled, &updated, seq));
                metrics::counter!(crate::observability::CANCELLATIONS_TOTAL, "reason" => "expired")
                    .increment(1);
                debug!("hold {id} lapsed before confirmation");
                return Err(EngineError::HoldExpired(id));
            }
            self.notify(ChangeEvent::for_booking(ChangeKind::Booked, &updated, seq));
            debug!("hold {id} confirmed");
            return Ok(updated);
        }
        Err(EngineError::Timeout)
    }

    /// `pending|confirmed -> cancelled` on behalf of `actor`. Cancelling a cancelled booking
    /// succeeds without a second change or event.
    pub async fn cancel(&self, id: Ulid, actor: &str) -> Result<CancelOutcome, EngineError> {
        validate_actor(actor)?;
        for _ in 0..MAX_TRANSITION_RETRIES {
            let booking = self.require_booking(id).await?;
            let court = self.require_court(booking.court_id).await?;
            if !self.authorizer.may_cancel(actor, &booking, &court) {
                return Err(EngineError::Unauthorized {
                    actor: actor.to_string(),
                    action: "cancel this booking",
                });
            }
            if booking.status == BookingStatus::Cancelled {
                return Ok(CancelOutcome {
                    booking,
                    already_cancelled: true,
                });
            }
            ensure_transition(&booking, BookingStatus::Cancelled)?;
            if let Some(updated) = self
                .swap_status(&booking, BookingStatus::Cancelled, Some(ChangeKind::Cancelled))
                .await?
            {
                metrics::counter!(crate::observability::CANCELLATIONS_TOTAL, "reason" => "requested")
                    .increment(1);
                debug!("booking {id} cancelled by {actor}");
                return Ok(CancelOutcome {
                    booking: updated,
                    already_cancelled: false,
                });
            }
        }
        Err(EngineError::Timeout)
    }

    /// `confirmed -> completed`.
    pub async fn complete(&self, id: Ulid) -> Result<Booking, EngineError> {
        for _ in 0..MAX_TRANSITION_RETRIES {
            let booking = self.require_booking(id).await?;
            ensure_transition(&booking, BookingStatus::Completed)?;
            if let Some(updated) = self.swap_status(&booking, BookingStatus::Completed, None).await? {
                metrics::counter!(crate::observability::COMPLETIONS_TOTAL).increment(1);
                return Ok(updated);
            }
        }
        Err(EngineError::Timeout)
    }

    /// Release every pending hold whose `expires_at` is at or before `now`.
    pub async fn expire_holds(&self, now: DateTime<Utc>) -> Result<usize, EngineError> {
        let mut released = 0;
        for hold in self.store.bookings_with_status(BookingStatus::Pending).await? {
            if !hold.is_expired(now) {
                continue;
            }
            if self.release_expired(&hold).await?.is_some() {
                info!("reaped expired hold {}", hold.id);
                released += 1;
            }
        }
        if released > 0 {
            metrics::counter!(crate::observability::CANCELLATIONS_TOTAL, "reason" => "expired")
                .increment(released as u64);
        }
        Ok(released)
    }

    /// Complete every confirmed booking whose interval ended at or before local time `now`.
    pub async fn complete_finished(&self, now: NaiveDateTime) -> Result<usize, EngineError> {
        let mut completed = 0;
        for booking in self.store.bookings_with_status(BookingStatus::Confirmed).await? {
            if booking.ends_at() > now {
                continue;
            }
            // Lost races (cancelled meanwhile) are skipped.
            if self.swap_status(&booking, BookingStatus::Completed, None).await?.is_some() {
                completed += 1;
            }
        }
        if completed > 0 {
            metrics::counter!(crate::observability::COMPLETIONS_TOTAL).increment(completed as u64);
        }
        Ok(completed)
    }

    /// One sweeper pass: lapse expired holds, then complete finished bookings.
    pub async fn sweep(&self, now: DateTime<Utc>, local_now: NaiveDateTime) -> Result<SweepReport, EngineError> {
        let expired = self.expire_holds(now).await?;
        let completed = self.complete_finished(local_now).await?;
        Ok(SweepReport { expired, completed })
    }

    async fn release_expired(&self, hold: &Booking) -> Result<Option<Booking>, EngineError> {
        self.swap_status(hold, BookingStatus::Cancelled, Some(ChangeKind::Cancelled))
            .await
    }

    /// Compare-and-set `booking.status -> to` inside the booking's section. `None` when the
    /// status moved since `booking` was read.
    async fn swap_status(
        &self,
        booking: &Booking,
        to: BookingStatus,
        kind: Option<ChangeKind>,
    ) -> Result<Option<Booking>, EngineError> {
        let mut section = self.enter(booking.key()).await?;
        let Some(updated) = section.set_status(booking.id, booking.status, to).await? else {
            return Ok(None);
        };
        let seq = section.commit().await?;
        if let Some(kind) = kind {
            self.notify(ChangeEvent::for_booking(kind, &updated, seq));
        }
        Ok(Some(updated))
    }
}

fn ensure_transition(booking: &Booking, to: BookingStatus) -> Result<(), EngineError> {
    if booking.status.can_transition_to(to) {
        Ok(())
    } else {
        Err(EngineError::InvalidTransition {
            id: booking.id,
            from: booking.status,
            to,
        })
    }
}
