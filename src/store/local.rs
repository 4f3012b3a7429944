use std::fs::{File, OpenOptions};
use std::io;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot, OwnedMutexGuard, RwLock};
use tracing::info;
use ulid::Ulid;

use crate::model::*;

use super::wal::Wal;
use super::{PartitionView, Section, SectionLocks, Store, StoreError, StoreResult};

// ── Group-commit WAL channel ─────────────────────────────

enum WalCommand {
    Append {
        records: Vec<LedgerEvent>,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        records: Vec<LedgerEvent>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

type Pending = (Vec<LedgerEvent>, oneshot::Sender<io::Result<()>>);

/// Background task that owns the WAL and batches appends for group commit.
/// 1. Block until the first Append arrives.
/// 2. Drain every Append already queued (the batch window).
/// 3. One flush_sync for the whole batch, then answer every sender.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        match cmd {
            WalCommand::Append { records, response } => {
                let mut batch = vec![(records, response)];
                let mut deferred = None;
                loop {
                    match rx.try_recv() {
                        Ok(WalCommand::Append { records, response }) => batch.push((records, response)),
                        Ok(other) => {
                            deferred = Some(other);
                            break;
                        }
                        Err(_) => break,
                    }
                }

                metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
                let flush_start = std::time::Instant::now();
                let result = flush_batch(&mut wal, &batch);
                metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
                    .record(flush_start.elapsed().as_secs_f64());
                respond_batch(batch, &result);

                if let Some(other) = deferred {
                    handle_non_append(&mut wal, other);
                }
            }
            other => handle_non_append(&mut wal, other),
        }
    }
}

fn flush_batch(wal: &mut Wal, batch: &[Pending]) -> io::Result<()> {
    let mut append_err = None;
    'outer: for (records, _) in batch {
        for record in records {
            if let Err(e) = wal.append_buffered(record) {
                append_err = Some(e);
                break 'outer;
            }
        }
    }
    // Flush even after an append error so buffered bytes don't bleed into the next batch.
    let flush_err = wal.flush_sync().err();
    match append_err.or(flush_err) {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

fn respond_batch(batch: Vec<Pending>, result: &io::Result<()>) {
    for (_, tx) in batch {
        let r = match result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
}

fn handle_non_append(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { records, response } => {
            let _ = response.send(wal.rewrite(&records));
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { .. } => unreachable!("appends are batched by the caller"),
    }
}

// ── In-memory ledger state ───────────────────────────────

#[derive(Debug, Default)]
struct Partition {
    bookings: Vec<Ulid>,
    blocks: Vec<Ulid>,
    seq: u64,
}

struct Inner {
    courts: DashMap<Ulid, Court>,
    bookings: DashMap<Ulid, Booking>,
    blocks: DashMap<Ulid, BlockedWindow>,
    partitions: DashMap<PartitionKey, Partition>,
    sections: SectionLocks,
    /// Writers hold it shared across append + apply; compaction holds it exclusively.
    gate: RwLock<()>,
    wal_tx: mpsc::Sender<WalCommand>,
    /// Held for the store's lifetime; the OS releases it when the handle closes.
    _lock: File,
}

impl Inner {
    fn apply(&self, record: &LedgerEvent) {
        match record {
            LedgerEvent::CourtRegistered { court } => {
                self.courts.insert(court.id, court.clone());
            }
            LedgerEvent::BlockAdded { block } => {
                let mut part = self.partitions.entry(block.key()).or_default();
                part.blocks.push(block.id);
                part.seq += 1;
                drop(part);
                self.blocks.insert(block.id, block.clone());
            }
            LedgerEvent::BlockRemoved { id } => {
                if let Some((_, block)) = self.blocks.remove(id)
                    && let Some(mut part) = self.partitions.get_mut(&block.key())
                {
                    part.blocks.retain(|b| b != id);
                    part.seq += 1;
                }
            }
            LedgerEvent::BookingCreated { booking } => {
                let mut part = self.partitions.entry(booking.key()).or_default();
                part.bookings.push(booking.id);
                part.seq += 1;
                drop(part);
                self.bookings.insert(booking.id, booking.clone());
            }
            LedgerEvent::StatusChanged { id, status } => {
                let Some(key) = self.bookings.get_mut(id).map(|mut booking| {
                    booking.status = *status;
                    if *status != BookingStatus::Pending {
                        booking.expires_at = None;
                    }
                    Booking::key(&booking)
                }) else {
                    return;
                };
                if let Some(mut part) = self.partitions.get_mut(&key) {
                    part.seq += 1;
                }
            }
        }
    }

    async fn wal_append(&self, records: Vec<LedgerEvent>) -> StoreResult<()> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append { records, response: tx })
            .await
            .map_err(|_| StoreError::WriterGone)?;
        rx.await.map_err(|_| StoreError::WriterGone)?.map_err(StoreError::Io)
    }

    /// Durably record, then apply.
    async fn persist_and_apply(&self, records: Vec<LedgerEvent>) -> StoreResult<()> {
        let _gate = self.gate.read().await;
        self.wal_append(records.clone()).await?;
        for record in &records {
            self.apply(record);
        }
        Ok(())
    }

    fn view(&self, key: &PartitionKey) -> PartitionView {
        let (booking_ids, block_ids) = match self.partitions.get(key) {
            Some(part) => (part.bookings.clone(), part.blocks.clone()),
            None => return PartitionView::default(),
        };
        PartitionView {
            bookings: booking_ids
                .iter()
                .filter_map(|id| self.bookings.get(id).map(|b| b.value().clone()))
                .collect(),
            blocks: block_ids
                .iter()
                .filter_map(|id| self.blocks.get(id).map(|b| b.value().clone()))
                .collect(),
        }
    }

    fn seq(&self, key: &PartitionKey) -> u64 {
        self.partitions.get(key).map_or(0, |p| p.seq)
    }
}

/// Single-node ledger: in-memory indexes rebuilt from a write-ahead log.
///
/// The ledger file is claimed with an exclusive OS lock for the lifetime of the store, so every
/// writer of a given ledger lives in this process and the per-partition mutexes are
/// authoritative. Deployments with several engine processes use `PgStore` instead.
pub struct LocalStore {
    inner: Arc<Inner>,
}

impl LocalStore {
    /// Open or create the ledger at `path`. Must be called inside a tokio runtime.
    pub fn open(path: &Path) -> StoreResult<Self> {
        let lock_path = path.with_extension("lock");
        let lock = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&lock_path)?;
        lock.try_lock().map_err(|_| StoreError::Locked(path.to_path_buf()))?;

        let (wal, records) = Wal::recover(path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let inner = Inner {
            courts: DashMap::new(),
            bookings: DashMap::new(),
            blocks: DashMap::new(),
            partitions: DashMap::new(),
            sections: SectionLocks::default(),
            gate: RwLock::new(()),
            wal_tx,
            _lock: lock,
        };
        for record in &records {
            inner.apply(record);
        }
        info!(
            "ledger {} opened: {} records, {} courts, {} bookings",
            path.display(),
            records.len(),
            inner.courts.len(),
            inner.bookings.len()
        );

        Ok(Self { inner: Arc::new(inner) })
    }

    /// Rewrite the log with only the records needed to rebuild the current state.
    pub async fn compact(&self) -> StoreResult<()> {
        let _gate = self.inner.gate.write().await;

        let mut records: Vec<LedgerEvent> = self
            .inner
            .courts
            .iter()
            .map(|c| LedgerEvent::CourtRegistered { court: c.value().clone() })
            .collect();
        records.extend(self.inner.blocks.iter().map(|b| LedgerEvent::BlockAdded { block: b.value().clone() }));
        let mut bookings: Vec<Booking> = self.inner.bookings.iter().map(|b| b.value().clone()).collect();
        bookings.sort_by_key(|b| b.id);
        records.extend(bookings.into_iter().map(|booking| LedgerEvent::BookingCreated { booking }));

        let (tx, rx) = oneshot::channel();
        self.inner
            .wal_tx
            .send(WalCommand::Compact { records, response: tx })
            .await
            .map_err(|_| StoreError::WriterGone)?;
        rx.await.map_err(|_| StoreError::WriterGone)??;

        self.inner.sections.prune();
        Ok(())
    }

    pub async fn appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .inner
            .wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}

#[async_trait]
impl Store for LocalStore {
    async fn put_court(&self, court: Court) -> StoreResult<()> {
        self.inner
            .persist_and_apply(vec![LedgerEvent::CourtRegistered { court }])
            .await
    }

    async fn court(&self, id: Ulid) -> StoreResult<Option<Court>> {
        Ok(self.inner.courts.get(&id).map(|c| c.value().clone()))
    }

    async fn booking(&self, id: Ulid) -> StoreResult<Option<Booking>> {
        Ok(self.inner.bookings.get(&id).map(|b| b.value().clone()))
    }

    async fn block(&self, id: Ulid) -> StoreResult<Option<BlockedWindow>> {
        Ok(self.inner.blocks.get(&id).map(|b| b.value().clone()))
    }

    async fn partition(&self, key: PartitionKey) -> StoreResult<PartitionView> {
        Ok(self.inner.view(&key))
    }

    async fn bookings_for_requester(&self, requester_id: &str) -> StoreResult<Vec<Booking>> {
        let mut found: Vec<Booking> = self
            .inner
            .bookings
            .iter()
            .filter(|b| b.requester_id == requester_id)
            .map(|b| b.value().clone())
            .collect();
        found.sort_by_key(|b| (b.date, b.span.start));
        Ok(found)
    }

    async fn bookings_with_status(&self, status: BookingStatus) -> StoreResult<Vec<Booking>> {
        Ok(self
            .inner
            .bookings
            .iter()
            .filter(|b| b.status == status)
            .map(|b| b.value().clone())
            .collect())
    }

    async fn enter(&self, key: PartitionKey) -> StoreResult<Box<dyn Section>> {
        let guard = self.inner.sections.acquire(key).await;
        Ok(Box::new(LocalSection {
            inner: self.inner.clone(),
            key,
            staged: Vec::new(),
            _guard: guard,
        }))
    }
}

struct LocalSection {
    inner: Arc<Inner>,
    key: PartitionKey,
    staged: Vec<LedgerEvent>,
    _guard: OwnedMutexGuard<()>,
}

#[async_trait]
impl Section for LocalSection {
    fn key(&self) -> PartitionKey {
        self.key
    }

    async fn occupied(&mut self) -> StoreResult<Vec<Occupant>> {
        Ok(self.inner.view(&self.key).occupants())
    }

    fn insert_booking(&mut self, booking: Booking) {
        debug_assert_eq!(booking.key(), self.key);
        self.staged.push(LedgerEvent::BookingCreated { booking });
    }

    fn insert_block(&mut self, block: BlockedWindow) {
        debug_assert_eq!(block.key(), self.key);
        self.staged.push(LedgerEvent::BlockAdded { block });
    }

    async fn set_status(
        &mut self,
        id: Ulid,
        from: BookingStatus,
        to: BookingStatus,
    ) -> StoreResult<Option<Booking>> {
        let Some(mut booking) = self.inner.bookings.get(&id).map(|b| b.value().clone()) else {
            return Ok(None);
        };
        if booking.key() != self.key || booking.status != from {
            return Ok(None);
        }
        booking.status = to;
        booking.expires_at = None;
        self.staged.push(LedgerEvent::StatusChanged { id, status: to });
        Ok(Some(booking))
    }

    async fn remove_block(&mut self, id: Ulid) -> StoreResult<Option<BlockedWindow>> {
        let block = self
            .inner
            .blocks
            .get(&id)
            .map(|b| b.value().clone())
            .filter(|b| b.key() == self.key);
        if block.is_some() {
            self.staged.push(LedgerEvent::BlockRemoved { id });
        }
        Ok(block)
    }

    async fn commit(&mut self) -> StoreResult<u64> {
        if !self.staged.is_empty() {
            let records = std::mem::take(&mut self.staged);
            self.inner.persist_and_apply(records).await?;
        }
        Ok(self.inner.seq(&self.key))
    }
}
