//! Hard caps on input sizes and in-memory growth.

/// Upper bound for `SLOTDESK_HORIZON_WEEKS`.
pub const MAX_HORIZON_WEEKS: u32 = 12;

pub const MAX_NAME_LEN: usize = 128;
pub const MAX_PHONE_LEN: usize = 32;

/// Longest request line accepted by the wire codec.
pub const MAX_LINE_LEN: usize = 8 * 1024;

/// Concurrent booking sessions across all owners.
pub const MAX_SESSIONS: usize = 10_000;

/// Reservations (any status) kept on one kind/date sheet.
pub const MAX_RESERVATIONS_PER_SHEET: usize = 4_096;

pub const MAX_USERS: usize = 1_000_000;
