use chrono::NaiveDate;
use tracing::info;
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::conflict::{check_no_conflict, validate_actor};
use super::{Engine, EngineError};

impl Engine {
    /// Publish or replace a court definition. Existing bookings are not re-validated against
    /// new hours.
    pub async fn register_court(&self, court: Court) -> Result<(), EngineError> {
        if court.name.trim().is_empty() {
            return Err(EngineError::validation("court name must not be empty"));
        }
        if court.name.len() > MAX_COURT_NAME_LEN {
            return Err(EngineError::LimitExceeded("court name too long"));
        }
        validate_actor(&court.owner_id)?;
        Span::try_new(court.hours.open, court.hours.close)
            .map_err(|e| EngineError::validation(format!("operating hours: {e}")))?;

        let id = court.id;
        self.store.put_court(court).await?;
        info!("court {id} registered");
        Ok(())
    }

    /// The bookable window on `date`, `None` when the court is closed that day or inactive.
    pub async fn operating_window(&self, court_id: Ulid, date: NaiveDate) -> Result<Option<Span>, EngineError> {
        let court = self.require_court(court_id).await?;
        Ok(court.active.then(|| court.hours.window_on(date)).flatten())
    }

    pub async fn blocked_windows(&self, court_id: Ulid, date: NaiveDate) -> Result<Vec<BlockedWindow>, EngineError> {
        self.require_court(court_id).await?;
        let mut blocks = self
            .store
            .partition(PartitionKey::new(court_id, date))
            .await?
            .blocks;
        blocks.sort_by_key(|b| b.span.start);
        Ok(blocks)
    }

    /// Take an interval out of bookability. Only the court's manager may do this, and only
    /// over intervals no active booking holds.
    pub async fn block_window(&self, actor: &str, input: NewBlock) -> Result<BlockedWindow, EngineError> {
        validate_actor(actor)?;
        if input.reason.len() > MAX_REASON_LEN {
            return Err(EngineError::LimitExceeded("reason too long"));
        }
        let span = Span::try_new(input.start, input.end).map_err(|e| EngineError::validation(e.to_string()))?;
        let court = self.require_court(input.court_id).await?;
        if !self.authorizer.may_manage(actor, &court) {
            return Err(EngineError::Unauthorized {
                actor: actor.to_string(),
                action: "block windows on this court",
            });
        }

        let key = PartitionKey::new(court.id, input.date);
        let mut section = self.enter(key).await?;
        let occupants = section.occupied().await?;
        check_no_conflict(&span, &occupants)?;
        if occupants.len() >= MAX_OCCUPANTS_PER_PARTITION {
            return Err(EngineError::LimitExceeded("too many bookings on this court and date"));
        }

        let block = BlockedWindow {
            id: Ulid::new(),
            court_id: court.id,
            date: input.date,
            span,
            reason: input.reason,
            created_by: actor.to_string(),
        };
        section.insert_block(block.clone());
        let seq = section.commit().await?;
        self.notify(ChangeEvent::for_block(ChangeKind::Blocked, &block, seq));
        drop(section);

        info!("court {} blocked {} on {}", court.id, span, input.date);
        Ok(block)
    }

    /// Remove a blocked window. Only ever frees intervals, so no conflict check is needed.
    pub async fn unblock_window(&self, actor: &str, block_id: Ulid) -> Result<BlockedWindow, EngineError> {
        validate_actor(actor)?;
        let block = self
            .store
            .block(block_id)
            .await?
            .ok_or(EngineError::NotFound(block_id))?;
        let court = self.require_court(block.court_id).await?;
        if !self.authorizer.may_manage(actor, &court) {
            return Err(EngineError::Unauthorized {
                actor: actor.to_string(),
                action: "unblock windows on this court",
            });
        }

        let mut section = self.enter(block.key()).await?;
        let removed = section
            .remove_block(block_id)
            .await?
            .ok_or(EngineError::NotFound(block_id))?;
        let seq = section.commit().await?;
        self.notify(ChangeEvent::for_block(ChangeKind::Unblocked, &removed, seq));
        Ok(removed)
    }
}
