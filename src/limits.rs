//! Hard caps on untrusted input.

pub const MAX_REQUESTER_ID_LEN: usize = 256;
pub const MAX_COURT_NAME_LEN: usize = 256;
pub const MAX_REASON_LEN: usize = 1024;

/// Active bookings plus blocks on one court for one date.
pub const MAX_OCCUPANTS_PER_PARTITION: usize = 1440;

pub const MIN_HOLD_TTL_SECS: u64 = 30;
pub const MAX_HOLD_TTL_SECS: u64 = 60 * 60;
pub const DEFAULT_HOLD_TTL_SECS: u64 = 10 * 60;

pub const MIN_SLOT_MINUTES: u16 = 5;
pub const MAX_SLOT_MINUTES: u16 = 24 * 60;

/// Largest ledger record accepted on replay. Longer length prefixes are treated as corruption.
pub const MAX_RECORD_LEN: usize = 1024 * 1024;

/// Longest accepted request line on the wire, in bytes.
pub const MAX_LINE_LEN: usize = 64 * 1024;

/// Attempts for a compare-and-set status change before giving up.
pub const MAX_TRANSITION_RETRIES: usize = 8;
