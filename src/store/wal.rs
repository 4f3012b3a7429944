//! Append-only ledger file.
//!
//! ```text
//! header:  [b"SGLG"][u16 version][u16 reserved]
//! frame:   [u32 len][u32 crc32(payload)][payload: bincode LedgerEvent]
//! ```
//!
//! A crash can leave a partial frame at the end. [`Wal::recover`] cuts the file back to the last
//! intact frame before appending, so frames written after a crash never sit behind garbage.

use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use tracing::warn;

use crate::limits::MAX_RECORD_LEN;
use crate::model::LedgerEvent;

const MAGIC: [u8; 4] = *b"SGLG";
const FORMAT_VERSION: u16 = 1;
const HEADER_LEN: u64 = 8;
const FRAME_HEADER_LEN: u64 = 8;

fn invalid(msg: impl Into<String>) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, msg.into())
}

fn write_header(writer: &mut impl Write) -> io::Result<()> {
    writer.write_all(&MAGIC)?;
    writer.write_all(&FORMAT_VERSION.to_le_bytes())?;
    writer.write_all(&[0u8; 2])
}

fn write_frame(writer: &mut impl Write, record: &LedgerEvent) -> io::Result<()> {
    let payload = bincode::serialize(record).map_err(|e| invalid(e.to_string()))?;
    if payload.len() > MAX_RECORD_LEN {
        return Err(invalid(format!("ledger record of {} bytes exceeds limit", payload.len())));
    }
    let len = payload.len() as u32;
    writer.write_all(&len.to_le_bytes())?;
    writer.write_all(&crc32fast::hash(&payload).to_le_bytes())?;
    writer.write_all(&payload)
}

/// Result of reading a ledger file front to back.
#[derive(Debug, Default)]
pub struct Scan {
    pub records: Vec<LedgerEvent>,
    /// Byte length of the header plus every intact frame. Anything past it is a torn tail.
    pub intact_len: u64,
}

pub struct Wal {
    writer: BufWriter<File>,
    path: PathBuf,
    appends_since_compact: u64,
}

impl Wal {
    /// Read the ledger at `path`, drop any torn tail from the file, and open it for appends.
    /// A missing or empty file becomes a fresh ledger.
    pub fn recover(path: &Path) -> io::Result<(Self, Vec<LedgerEvent>)> {
        let scan = Self::scan(path)?;
        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(path)?;

        let on_disk = file.metadata()?.len();
        if on_disk > scan.intact_len {
            warn!(
                "ledger {}: discarding {} bytes of torn tail",
                path.display(),
                on_disk - scan.intact_len
            );
            file.set_len(scan.intact_len)?;
        }
        if scan.intact_len == 0 {
            write_header(&mut file)?;
        }
        file.sync_all()?;

        let wal = Self {
            writer: BufWriter::new(file),
            path: path.to_path_buf(),
            appends_since_compact: 0,
        };
        Ok((wal, scan.records))
    }

    /// Every intact record, without touching the file.
    pub fn replay(path: &Path) -> io::Result<Vec<LedgerEvent>> {
        Ok(Self::scan(path)?.records)
    }

    /// Read frames until the end of the file or the first torn, oversized or corrupt frame.
    /// Fails only on I/O errors and on files that are not ledgers of this format version.
    pub fn scan(path: &Path) -> io::Result<Scan> {
        let file = match File::open(path) {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Scan::default()),
            Err(e) => return Err(e),
        };
        let mut reader = BufReader::new(file);

        let mut header = [0u8; HEADER_LEN as usize];
        if !read_full(&mut reader, &mut header)? {
            // Crashed while creating the file.
            return Ok(Scan::default());
        }
        if header[..4] != MAGIC {
            return Err(invalid(format!("{} is not a slotguard ledger", path.display())));
        }
        let version = u16::from_le_bytes([header[4], header[5]]);
        if version != FORMAT_VERSION {
            return Err(invalid(format!(
                "{}: unsupported ledger version {version}",
                path.display()
            )));
        }

        let mut scan = Scan {
            records: Vec::new(),
            intact_len: HEADER_LEN,
        };
        loop {
            let mut frame = [0u8; FRAME_HEADER_LEN as usize];
            if !read_full(&mut reader, &mut frame)? {
                break;
            }
            let len = u32::from_le_bytes([frame[0], frame[1], frame[2], frame[3]]) as usize;
            let crc = u32::from_le_bytes([frame[4], frame[5], frame[6], frame[7]]);
            if len > MAX_RECORD_LEN {
                warn!("ledger {}: frame length {len} over limit, stopping replay", path.display());
                break;
            }
            let mut payload = vec![0u8; len];
            if !read_full(&mut reader, &mut payload)? {
                break;
            }
            if crc != crc32fast::hash(&payload) {
                warn!("ledger {}: checksum mismatch, stopping replay", path.display());
                break;
            }
            let Ok(record) = bincode::deserialize::<LedgerEvent>(&payload) else {
                warn!("ledger {}: undecodable record, stopping replay", path.display());
                break;
            };
            scan.records.push(record);
            scan.intact_len += FRAME_HEADER_LEN + len as u64;
        }
        Ok(scan)
    }

    #[cfg(test)]
    pub fn append(&mut self, record: &LedgerEvent) -> io::Result<()> {
        self.append_buffered(record)?;
        self.flush_sync()
    }

    /// Buffer a record. Nothing is durable until [`Wal::flush_sync`].
    pub fn append_buffered(&mut self, record: &LedgerEvent) -> io::Result<()> {
        write_frame(&mut self.writer, record)?;
        self.appends_since_compact += 1;
        Ok(())
    }

    pub fn flush_sync(&mut self) -> io::Result<()> {
        self.writer.flush()?;
        self.writer.get_ref().sync_all()
    }

    pub fn appends_since_compact(&self) -> u64 {
        self.appends_since_compact
    }

    /// Replace the ledger with `records`: write a sibling file, fsync, rename over.
    pub fn rewrite(&mut self, records: &[LedgerEvent]) -> io::Result<()> {
        let tmp_path = self.path.with_extension("wal.tmp");
        {
            let mut tmp = BufWriter::new(File::create(&tmp_path)?);
            write_header(&mut tmp)?;
            for record in records {
                write_frame(&mut tmp, record)?;
            }
            tmp.flush()?;
            tmp.get_ref().sync_all()?;
        }
        fs::rename(&tmp_path, &self.path)?;
        let file = OpenOptions::new().append(true).open(&self.path)?;
        self.writer = BufWriter::new(file);
        self.appends_since_compact = 0;
        Ok(())
    }
}

/// `Ok(false)` on a short read.
fn read_full(reader: &mut impl Read, buf: &mut [u8]) -> io::Result<bool> {
    match reader.read_exact(buf) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Ok(false),
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::*;
    use chrono::{NaiveDate, Utc};
    use ulid::Ulid;

    fn tmp_path(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("slotguard_test_wal");
        fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        let _ = fs::remove_file(&path);
        path
    }

    fn court() -> Court {
        Court {
            id: Ulid::new(),
            facility_id: Ulid::new(),
            owner_id: "owner-1".into(),
            name: "Court A1".into(),
            hours: OperatingHours::daily(TimeOfDay::hm(6, 0), TimeOfDay::hm(22, 0)),
            price_per_hour: 5000,
            active: true,
        }
    }

    fn booking(court_id: Ulid) -> Booking {
        Booking {
            id: Ulid::new(),
            court_id,
            requester_id: "user-1".into(),
            date: NaiveDate::from_ymd_opt(2030, 3, 4).unwrap(),
            span: Span::new(TimeOfDay::hm(9, 0), TimeOfDay::hm(10, 0)),
            status: BookingStatus::Confirmed,
            created_at: Utc::now(),
            expires_at: None,
            price: 5000,
        }
    }

    fn append_raw(path: &Path, bytes: &[u8]) {
        let mut f = OpenOptions::new().append(true).open(path).unwrap();
        f.write_all(bytes).unwrap();
    }

    #[test]
    fn fresh_ledger_gets_header_and_replays_in_order() {
        let path = tmp_path("fresh.wal");
        let c = court();
        let b = booking(c.id);
        let records = vec![
            LedgerEvent::CourtRegistered { court: c },
            LedgerEvent::BookingCreated { booking: b.clone() },
            LedgerEvent::StatusChanged {
                id: b.id,
                status: BookingStatus::Cancelled,
            },
        ];

        let (mut wal, replayed) = Wal::recover(&path).unwrap();
        assert!(replayed.is_empty());
        for r in &records {
            wal.append(r).unwrap();
        }
        drop(wal);

        assert_eq!(&fs::read(&path).unwrap()[..4], b"SGLG");
        assert_eq!(Wal::replay(&path).unwrap(), records);
    }

    #[test]
    fn missing_file_scans_empty() {
        let scan = Wal::scan(&tmp_path("missing.wal")).unwrap();
        assert!(scan.records.is_empty());
        assert_eq!(scan.intact_len, 0);
    }

    #[test]
    fn torn_tail_is_cut_before_new_appends() {
        let path = tmp_path("torn_then_append.wal");
        let first = LedgerEvent::CourtRegistered { court: court() };
        let second = LedgerEvent::CourtRegistered { court: court() };

        let (mut wal, _) = Wal::recover(&path).unwrap();
        wal.append(&first).unwrap();
        drop(wal);
        let intact = fs::metadata(&path).unwrap().len();
        append_raw(&path, &[7u8; 5]);

        let (mut wal, replayed) = Wal::recover(&path).unwrap();
        assert_eq!(replayed, vec![first.clone()]);
        assert_eq!(fs::metadata(&path).unwrap().len(), intact);
        wal.append(&second).unwrap();
        drop(wal);

        let (_, replayed) = Wal::recover(&path).unwrap();
        assert_eq!(replayed, vec![first, second]);
    }

    #[test]
    fn oversized_length_prefix_ends_replay() {
        let path = tmp_path("oversized.wal");
        let record = LedgerEvent::BlockRemoved { id: Ulid::new() };
        let (mut wal, _) = Wal::recover(&path).unwrap();
        wal.append(&record).unwrap();
        drop(wal);

        let mut frame = Vec::new();
        frame.extend_from_slice(&u32::MAX.to_le_bytes());
        frame.extend_from_slice(&0u32.to_le_bytes());
        append_raw(&path, &frame);

        let scan = Wal::scan(&path).unwrap();
        assert_eq!(scan.records, vec![record]);
        assert!(scan.intact_len < fs::metadata(&path).unwrap().len());
    }

    #[test]
    fn bad_checksum_ends_replay() {
        let path = tmp_path("bad_crc.wal");
        let good = LedgerEvent::BlockRemoved { id: Ulid::new() };
        let (mut wal, _) = Wal::recover(&path).unwrap();
        wal.append(&good).unwrap();
        drop(wal);

        let payload = bincode::serialize(&LedgerEvent::BlockRemoved { id: Ulid::new() }).unwrap();
        let mut frame = Vec::new();
        frame.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        frame.extend_from_slice(&0xDEAD_BEEFu32.to_le_bytes());
        frame.extend_from_slice(&payload);
        append_raw(&path, &frame);

        assert_eq!(Wal::replay(&path).unwrap(), vec![good]);
    }

    #[test]
    fn foreign_file_is_refused() {
        let path = tmp_path("foreign.wal");
        fs::write(&path, b"PGDMP\x01\x0e\x00 not a ledger").unwrap();
        let err = Wal::recover(&path).err().unwrap();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
        // Left untouched.
        assert_eq!(fs::read(&path).unwrap(), b"PGDMP\x01\x0e\x00 not a ledger");
    }

    #[test]
    fn rewrite_replaces_contents_and_keeps_appending() {
        let path = tmp_path("rewrite.wal");
        let c = court();
        let mut b = booking(c.id);

        let (mut wal, _) = Wal::recover(&path).unwrap();
        wal.append(&LedgerEvent::CourtRegistered { court: c.clone() }).unwrap();
        wal.append(&LedgerEvent::BookingCreated { booking: b.clone() }).unwrap();
        wal.append(&LedgerEvent::StatusChanged {
            id: b.id,
            status: BookingStatus::Completed,
        })
        .unwrap();
        assert_eq!(wal.appends_since_compact(), 3);

        b.status = BookingStatus::Completed;
        let compacted = vec![
            LedgerEvent::CourtRegistered { court: c },
            LedgerEvent::BookingCreated { booking: b },
        ];
        wal.rewrite(&compacted).unwrap();
        assert_eq!(wal.appends_since_compact(), 0);

        let extra = LedgerEvent::BlockRemoved { id: Ulid::new() };
        wal.append(&extra).unwrap();
        drop(wal);

        let mut expected = compacted;
        expected.push(extra);
        assert_eq!(Wal::replay(&path).unwrap(), expected);
    }
}
