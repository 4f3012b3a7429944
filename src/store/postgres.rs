//! PostgreSQL ledger.
//!
//! The exclusive section is a transaction holding `pg_advisory_xact_lock` on a hash of the
//! partition key, so every engine process sharing the database serializes on the same
//! `(court, date)`. The advisory lock goes with commit or rollback; dropping an uncommitted
//! section rolls back. Inside one process the section also holds a per-partition mutex until it
//! is dropped, so the engine queues change events in commit order even though the database lock
//! is already gone by then.
//!
//! # Schema
//!
//! ```sql
//! CREATE TABLE courts (id TEXT PRIMARY KEY, doc JSONB NOT NULL);
//! CREATE TABLE bookings (
//!     id TEXT PRIMARY KEY,
//!     court_id TEXT NOT NULL,
//!     requester_id TEXT NOT NULL,
//!     date DATE NOT NULL,
//!     start_min INTEGER NOT NULL,
//!     end_min INTEGER NOT NULL CHECK (start_min < end_min),
//!     status TEXT NOT NULL,
//!     created_at TIMESTAMPTZ NOT NULL,
//!     expires_at TIMESTAMPTZ,
//!     price BIGINT NOT NULL
//! );
//! CREATE INDEX bookings_partition ON bookings (court_id, date);
//! CREATE INDEX bookings_requester ON bookings (requester_id);
//! CREATE TABLE blocked_windows (...);
//! CREATE TABLE partition_seq (court_id TEXT, date DATE, seq BIGINT, PRIMARY KEY (court_id, date));
//! ```

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use sqlx::postgres::{PgPool, PgRow};
use sqlx::types::Json;
use sqlx::{Postgres, Row, Transaction};
use tokio::sync::OwnedMutexGuard;
use ulid::Ulid;

use crate::model::*;

use super::{PartitionView, Section, SectionLocks, Store, StoreError, StoreResult};

const SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS courts (id TEXT PRIMARY KEY, doc JSONB NOT NULL)",
    "CREATE TABLE IF NOT EXISTS bookings (
        id TEXT PRIMARY KEY,
        court_id TEXT NOT NULL,
        requester_id TEXT NOT NULL,
        date DATE NOT NULL,
        start_min INTEGER NOT NULL,
        end_min INTEGER NOT NULL CHECK (start_min < end_min),
        status TEXT NOT NULL,
        created_at TIMESTAMPTZ NOT NULL,
        expires_at TIMESTAMPTZ,
        price BIGINT NOT NULL
    )",
    "CREATE INDEX IF NOT EXISTS bookings_partition ON bookings (court_id, date)",
    "CREATE INDEX IF NOT EXISTS bookings_requester ON bookings (requester_id)",
    "CREATE TABLE IF NOT EXISTS blocked_windows (
        id TEXT PRIMARY KEY,
        court_id TEXT NOT NULL,
        date DATE NOT NULL,
        start_min INTEGER NOT NULL,
        end_min INTEGER NOT NULL CHECK (start_min < end_min),
        reason TEXT NOT NULL,
        created_by TEXT NOT NULL
    )",
    "CREATE INDEX IF NOT EXISTS blocked_windows_partition ON blocked_windows (court_id, date)",
    "CREATE TABLE IF NOT EXISTS partition_seq (
        court_id TEXT NOT NULL,
        date DATE NOT NULL,
        seq BIGINT NOT NULL,
        PRIMARY KEY (court_id, date)
    )",
];

const BOOKING_COLUMNS: &str =
    "id, court_id, requester_id, date, start_min, end_min, status, created_at, expires_at, price";
const BLOCK_COLUMNS: &str = "id, court_id, date, start_min, end_min, reason, created_by";

/// Idle partition mutexes are forgotten once this many have accumulated.
const SECTION_LOCKS_PRUNE_AT: usize = 4096;

#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
    sections: Arc<SectionLocks>,
}

impl PgStore {
    pub async fn connect(url: &str) -> StoreResult<Self> {
        let pool = PgPool::connect(url).await?;
        Ok(Self::new(pool))
    }

    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            sections: Arc::new(SectionLocks::default()),
        }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Create tables and indexes if missing.
    pub async fn migrate(&self) -> StoreResult<()> {
        for stmt in SCHEMA {
            sqlx::query(stmt).execute(&self.pool).await?;
        }
        Ok(())
    }
}

fn codec<E: std::fmt::Display>(e: E) -> StoreError {
    StoreError::Codec(e.to_string())
}

fn parse_ulid(s: &str) -> StoreResult<Ulid> {
    Ulid::from_string(s).map_err(codec)
}

fn span_from_row(row: &PgRow) -> StoreResult<Span> {
    let start: i32 = row.try_get("start_min")?;
    let end: i32 = row.try_get("end_min")?;
    let to_time = |m: i32| {
        u16::try_from(m)
            .ok()
            .and_then(TimeOfDay::from_minutes)
            .ok_or_else(|| StoreError::Codec(format!("minute of day out of range: {m}")))
    };
    Span::try_new(to_time(start)?, to_time(end)?).map_err(codec)
}

fn booking_from_row(row: &PgRow) -> StoreResult<Booking> {
    let id: String = row.try_get("id")?;
    let court_id: String = row.try_get("court_id")?;
    let status: String = row.try_get("status")?;
    let price: i64 = row.try_get("price")?;
    Ok(Booking {
        id: parse_ulid(&id)?,
        court_id: parse_ulid(&court_id)?,
        requester_id: row.try_get("requester_id")?,
        date: row.try_get::<NaiveDate, _>("date")?,
        span: span_from_row(row)?,
        status: status.parse().map_err(StoreError::Codec)?,
        created_at: row.try_get::<DateTime<Utc>, _>("created_at")?,
        expires_at: row.try_get::<Option<DateTime<Utc>>, _>("expires_at")?,
        price: u64::try_from(price).map_err(codec)?,
    })
}

fn block_from_row(row: &PgRow) -> StoreResult<BlockedWindow> {
    let id: String = row.try_get("id")?;
    let court_id: String = row.try_get("court_id")?;
    Ok(BlockedWindow {
        id: parse_ulid(&id)?,
        court_id: parse_ulid(&court_id)?,
        date: row.try_get("date")?,
        span: span_from_row(row)?,
        reason: row.try_get("reason")?,
        created_by: row.try_get("created_by")?,
    })
}

#[async_trait]
impl Store for PgStore {
    async fn put_court(&self, court: Court) -> StoreResult<()> {
        sqlx::query(
            "INSERT INTO courts (id, doc) VALUES ($1, $2)
             ON CONFLICT (id) DO UPDATE SET doc = EXCLUDED.doc",
        )
        .bind(court.id.to_string())
        .bind(Json(&court))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn court(&self, id: Ulid) -> StoreResult<Option<Court>> {
        let row: Option<(Json<Court>,)> = sqlx::query_as("SELECT doc FROM courts WHERE id = $1")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|(Json(court),)| court))
    }

    async fn booking(&self, id: Ulid) -> StoreResult<Option<Booking>> {
        let sql = format!("SELECT {BOOKING_COLUMNS} FROM bookings WHERE id = $1");
        let row = sqlx::query(&sql)
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(booking_from_row).transpose()
    }

    async fn block(&self, id: Ulid) -> StoreResult<Option<BlockedWindow>> {
        let sql = format!("SELECT {BLOCK_COLUMNS} FROM blocked_windows WHERE id = $1");
        let row = sqlx::query(&sql)
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(block_from_row).transpose()
    }

    async fn partition(&self, key: PartitionKey) -> StoreResult<PartitionView> {
        let mut conn = self.pool.acquire().await?;
        read_partition(&mut conn, key).await
    }

    async fn bookings_for_requester(&self, requester_id: &str) -> StoreResult<Vec<Booking>> {
        let sql = format!(
            "SELECT {BOOKING_COLUMNS} FROM bookings WHERE requester_id = $1 ORDER BY date, start_min"
        );
        let rows = sqlx::query(&sql)
            .bind(requester_id)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(booking_from_row).collect()
    }

    async fn bookings_with_status(&self, status: BookingStatus) -> StoreResult<Vec<Booking>> {
        let sql = format!("SELECT {BOOKING_COLUMNS} FROM bookings WHERE status = $1");
        let rows = sqlx::query(&sql)
            .bind(status.as_str())
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(booking_from_row).collect()
    }

    async fn enter(&self, key: PartitionKey) -> StoreResult<Box<dyn Section>> {
        if self.sections.len() > SECTION_LOCKS_PRUNE_AT {
            self.sections.prune();
        }
        let guard = self.sections.acquire(key).await;
        let mut tx = self.pool.begin().await?;
        sqlx::query("SELECT pg_advisory_xact_lock(hashtextextended($1, 0))")
            .bind(key.to_string())
            .execute(&mut *tx)
            .await?;
        Ok(Box::new(PgSection {
            tx: Some(tx),
            key,
            staged: Vec::new(),
            applied: 0,
            _guard: guard,
        }))
    }
}

async fn read_partition(conn: &mut sqlx::PgConnection, key: PartitionKey) -> StoreResult<PartitionView> {
    let sql = format!(
        "SELECT {BOOKING_COLUMNS} FROM bookings WHERE court_id = $1 AND date = $2 ORDER BY start_min"
    );
    let rows = sqlx::query(&sql)
        .bind(key.court_id.to_string())
        .bind(key.date)
        .fetch_all(&mut *conn)
        .await?;
    let bookings = rows.iter().map(booking_from_row).collect::<StoreResult<Vec<_>>>()?;

    let sql = format!(
        "SELECT {BLOCK_COLUMNS} FROM blocked_windows WHERE court_id = $1 AND date = $2 ORDER BY start_min"
    );
    let rows = sqlx::query(&sql)
        .bind(key.court_id.to_string())
        .bind(key.date)
        .fetch_all(&mut *conn)
        .await?;
    let blocks = rows.iter().map(block_from_row).collect::<StoreResult<Vec<_>>>()?;

    Ok(PartitionView { bookings, blocks })
}

enum Staged {
    Booking(Booking),
    Block(BlockedWindow),
}

struct PgSection {
    /// `None` once committed; the advisory lock went with the transaction.
    tx: Option<Transaction<'static, Postgres>>,
    key: PartitionKey,
    staged: Vec<Staged>,
    /// Updates and deletes already issued inside the transaction.
    applied: i64,
    _guard: OwnedMutexGuard<()>,
}

impl PgSection {
    fn tx(&mut self) -> StoreResult<&mut Transaction<'static, Postgres>> {
        self.tx
            .as_mut()
            .ok_or_else(|| StoreError::Codec("section already committed".into()))
    }
}

#[async_trait]
impl Section for PgSection {
    fn key(&self) -> PartitionKey {
        self.key
    }

    async fn occupied(&mut self) -> StoreResult<Vec<Occupant>> {
        let key = self.key;
        let tx = self.tx()?;
        Ok(read_partition(&mut *tx, key).await?.occupants())
    }

    fn insert_booking(&mut self, booking: Booking) {
        self.staged.push(Staged::Booking(booking));
    }

    fn insert_block(&mut self, block: BlockedWindow) {
        self.staged.push(Staged::Block(block));
    }

    async fn set_status(
        &mut self,
        id: Ulid,
        from: BookingStatus,
        to: BookingStatus,
    ) -> StoreResult<Option<Booking>> {
        let key = self.key;
        let sql = format!(
            "UPDATE bookings SET status = $3, expires_at = NULL
             WHERE id = $1 AND status = $2 AND court_id = $4 AND date = $5
             RETURNING {BOOKING_COLUMNS}"
        );
        let tx = self.tx()?;
        let row = sqlx::query(&sql)
            .bind(id.to_string())
            .bind(from.as_str())
            .bind(to.as_str())
            .bind(key.court_id.to_string())
            .bind(key.date)
            .fetch_optional(&mut **tx)
            .await?;
        let booking = row.as_ref().map(booking_from_row).transpose()?;
        if booking.is_some() {
            self.applied += 1;
        }
        Ok(booking)
    }

    async fn remove_block(&mut self, id: Ulid) -> StoreResult<Option<BlockedWindow>> {
        let key = self.key;
        let sql = format!(
            "DELETE FROM blocked_windows WHERE id = $1 AND court_id = $2 AND date = $3
             RETURNING {BLOCK_COLUMNS}"
        );
        let tx = self.tx()?;
        let row = sqlx::query(&sql)
            .bind(id.to_string())
            .bind(key.court_id.to_string())
            .bind(key.date)
            .fetch_optional(&mut **tx)
            .await?;
        let block = row.as_ref().map(block_from_row).transpose()?;
        if block.is_some() {
            self.applied += 1;
        }
        Ok(block)
    }

    async fn commit(&mut self) -> StoreResult<u64> {
        let key = self.key;
        let staged = std::mem::take(&mut self.staged);
        let writes = i64::try_from(staged.len()).map_err(codec)? + std::mem::take(&mut self.applied);
        let tx = self.tx()?;

        for write in staged {
            match write {
                Staged::Booking(b) => {
                    sqlx::query(
                        "INSERT INTO bookings
                         (id, court_id, requester_id, date, start_min, end_min, status, created_at, expires_at, price)
                         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)",
                    )
                    .bind(b.id.to_string())
                    .bind(b.court_id.to_string())
                    .bind(&b.requester_id)
                    .bind(b.date)
                    .bind(i32::from(b.span.start.minutes()))
                    .bind(i32::from(b.span.end.minutes()))
                    .bind(b.status.as_str())
                    .bind(b.created_at)
                    .bind(b.expires_at)
                    .bind(i64::try_from(b.price).map_err(codec)?)
                    .execute(&mut **tx)
                    .await?;
                }
                Staged::Block(w) => {
                    sqlx::query(
                        "INSERT INTO blocked_windows
                         (id, court_id, date, start_min, end_min, reason, created_by)
                         VALUES ($1, $2, $3, $4, $5, $6, $7)",
                    )
                    .bind(w.id.to_string())
                    .bind(w.court_id.to_string())
                    .bind(w.date)
                    .bind(i32::from(w.span.start.minutes()))
                    .bind(i32::from(w.span.end.minutes()))
                    .bind(&w.reason)
                    .bind(&w.created_by)
                    .execute(&mut **tx)
                    .await?;
                }
            }
        }

        let (seq,): (i64,) = sqlx::query_as(
            "INSERT INTO partition_seq (court_id, date, seq) VALUES ($1, $2, $3)
             ON CONFLICT (court_id, date) DO UPDATE SET seq = partition_seq.seq + EXCLUDED.seq
             RETURNING seq",
        )
        .bind(key.court_id.to_string())
        .bind(key.date)
        .bind(writes)
        .fetch_one(&mut **tx)
        .await?;

        if let Some(tx) = self.tx.take() {
            tx.commit().await?;
        }
        u64::try_from(seq).map_err(codec)
    }
}
