//! Durable ledger backends.
//!
//! The engine talks to storage only through [`Store`]. The exclusive section that serializes
//! decisions for one `(court, date)` is a store primitive ([`Store::enter`]) so each backend can
//! back it with whatever its medium offers: per-partition async mutexes plus an OS file lock for
//! [`LocalStore`], the same in-process mutexes plus a transaction-scoped advisory lock for
//! `PgStore`.
//!
//! Every write to a partition goes through its section, status changes and block removals
//! included, so each partition has a single commit order.

mod local;
#[cfg(feature = "postgres")]
mod postgres;
mod wal;

pub use local::LocalStore;
#[cfg(feature = "postgres")]
pub use postgres::PgStore;
pub use wal::{Scan, Wal};

use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};
use ulid::Ulid;

use crate::model::*;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("ledger record codec error: {0}")]
    Codec(String),
    #[error("ledger {0} is locked by another process")]
    Locked(PathBuf),
    #[error("WAL writer shut down")]
    WriterGone,
    #[cfg(feature = "postgres")]
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Everything recorded for one partition, regardless of status.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PartitionView {
    pub bookings: Vec<Booking>,
    pub blocks: Vec<BlockedWindow>,
}

impl PartitionView {
    /// Intervals that count for conflict purposes: active bookings and all blocks.
    pub fn occupants(&self) -> Vec<Occupant> {
        let bookings = self
            .bookings
            .iter()
            .filter(|b| b.status.is_active())
            .map(|b| Occupant {
                span: b.span,
                source: OccupantRef::Booking(b.id),
            });
        let blocks = self.blocks.iter().map(|w| Occupant {
            span: w.span,
            source: OccupantRef::Block(w.id),
        });
        let mut occupants: Vec<Occupant> = bookings.chain(blocks).collect();
        occupants.sort_by_key(|o| o.span.start);
        occupants
    }
}

#[async_trait]
pub trait Store: Send + Sync {
    async fn put_court(&self, court: Court) -> StoreResult<()>;

    async fn court(&self, id: Ulid) -> StoreResult<Option<Court>>;

    async fn booking(&self, id: Ulid) -> StoreResult<Option<Booking>>;

    async fn block(&self, id: Ulid) -> StoreResult<Option<BlockedWindow>>;

    /// Unlocked read of a partition. Eventually consistent with in-flight sections.
    async fn partition(&self, key: PartitionKey) -> StoreResult<PartitionView>;

    async fn bookings_for_requester(&self, requester_id: &str) -> StoreResult<Vec<Booking>>;

    async fn bookings_with_status(&self, status: BookingStatus) -> StoreResult<Vec<Booking>>;

    /// Acquire the exclusive section for `key`. Blocks until no other section for the same
    /// partition is held, in this process or any other sharing the ledger.
    async fn enter(&self, key: PartitionKey) -> StoreResult<Box<dyn Section>>;
}

/// A held exclusive section. Writes are staged and become visible only on [`Section::commit`];
/// dropping the section without committing discards them and releases the partition.
#[async_trait]
pub trait Section: Send {
    fn key(&self) -> PartitionKey;

    /// Fresh occupants of the partition, read under the section.
    async fn occupied(&mut self) -> StoreResult<Vec<Occupant>>;

    fn insert_booking(&mut self, booking: Booking);

    fn insert_block(&mut self, block: BlockedWindow);

    /// Compare-and-set a booking's status. Returns the booking as it will read after commit, or
    /// `None` if the booking is unknown, lives in another partition, or is not in `from`.
    async fn set_status(
        &mut self,
        id: Ulid,
        from: BookingStatus,
        to: BookingStatus,
    ) -> StoreResult<Option<Booking>>;

    /// Remove a blocked window of this partition. `None` if there is no such block.
    async fn remove_block(&mut self, id: Ulid) -> StoreResult<Option<BlockedWindow>>;

    /// Make staged writes durable and visible. Returns the partition's new commit sequence.
    /// No other section of this process enters the partition until this one is dropped, so
    /// work done between commit and drop (queuing the change event) keeps commit order.
    /// Backends may refuse further writes after the first commit.
    async fn commit(&mut self) -> StoreResult<u64>;
}

/// In-process exclusion per partition: one async mutex per key, created on first use.
#[derive(Default)]
pub(crate) struct SectionLocks {
    locks: DashMap<PartitionKey, Arc<Mutex<()>>>,
}

impl SectionLocks {
    pub(crate) async fn acquire(&self, key: PartitionKey) -> OwnedMutexGuard<()> {
        let mutex = self.locks.entry(key).or_default().clone();
        mutex.lock_owned().await
    }

    /// Forget mutexes that nobody holds or waits on.
    pub(crate) fn prune(&self) {
        self.locks.retain(|_, m| Arc::strong_count(m) > 1);
    }

    #[cfg(feature = "postgres")]
    pub(crate) fn len(&self) -> usize {
        self.locks.len()
    }
}
