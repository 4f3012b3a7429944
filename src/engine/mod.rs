//! Reservation engine.
//!
//! Every write that can change which intervals of a court are occupied on a date runs inside
//! that `(court, date)` partition's exclusive section, obtained from the [`Store`]. Reads never
//! take the section and may lag in-flight writes.

mod availability;
mod calendar;
mod conflict;
mod coordinator;
mod error;
mod lifecycle;
mod queries;

pub use availability::{free_spans, merge_overlapping, slice_slots, subtract_intervals};
pub use conflict::{first_conflict, has_conflict};
pub use error::EngineError;
pub use lifecycle::{CancelOutcome, SweepReport};

use std::sync::Arc;
use std::time::{Duration, Instant};

use ulid::Ulid;

use crate::auth::{Authorizer, OwnerOrRequester};
use crate::model::*;
use crate::notify::{Outbox, Publisher};
use crate::store::{Section, Store};

const DEFAULT_SECTION_TIMEOUT: Duration = Duration::from_secs(5);

pub struct Engine {
    store: Arc<dyn Store>,
    outbox: Outbox,
    authorizer: Arc<dyn Authorizer>,
    section_timeout: Duration,
}

impl Engine {
    /// Build an engine over `store`, publishing committed changes to `publisher`.
    /// Spawns the notification dispatcher, so this must run inside a tokio runtime.
    pub fn new(store: Arc<dyn Store>, publisher: Arc<dyn Publisher>) -> Self {
        Self {
            store,
            outbox: Outbox::spawn(publisher),
            authorizer: Arc::new(OwnerOrRequester),
            section_timeout: DEFAULT_SECTION_TIMEOUT,
        }
    }

    pub fn with_authorizer(mut self, authorizer: Arc<dyn Authorizer>) -> Self {
        self.authorizer = authorizer;
        self
    }

    pub fn with_section_timeout(mut self, timeout: Duration) -> Self {
        self.section_timeout = timeout;
        self
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    pub(super) async fn require_court(&self, id: Ulid) -> Result<Court, EngineError> {
        self.store.court(id).await?.ok_or(EngineError::NotFound(id))
    }

    pub(super) async fn require_booking(&self, id: Ulid) -> Result<Booking, EngineError> {
        self.store.booking(id).await?.ok_or(EngineError::NotFound(id))
    }

    /// Enter the partition's exclusive section, giving up after the section timeout.
    pub(super) async fn enter(&self, key: PartitionKey) -> Result<Box<dyn Section>, EngineError> {
        let started = Instant::now();
        let section = tokio::time::timeout(self.section_timeout, self.store.enter(key))
            .await
            .map_err(|_| EngineError::Timeout)??;
        metrics::histogram!(crate::observability::SECTION_WAIT_SECONDS)
            .record(started.elapsed().as_secs_f64());
        Ok(section)
    }

    /// Queue a change for publication. Call while the originating section is still held.
    pub(super) fn notify(&self, event: ChangeEvent) {
        self.outbox.enqueue(event);
    }
}
