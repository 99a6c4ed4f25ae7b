use crate::model::Ms;

/// 2000-01-01T00:00:00Z
pub const MIN_VALID_TIMESTAMP_MS: Ms = 946_684_800_000;
/// 2200-01-01T00:00:00Z
pub const MAX_VALID_TIMESTAMP_MS: Ms = 7_258_118_400_000;

pub const MAX_ARTISANS: usize = 100_000;
pub const MAX_CUSTOMERS: usize = 1_000_000;
pub const MAX_RULES_PER_ARTISAN: usize = 1_000;
pub const MAX_BULK_RULES: usize = 500;
pub const MAX_BOOKINGS_PER_ARTISAN: usize = 100_000;

/// Longest single booking: one day.
pub const MAX_BOOKING_MINUTES: u32 = 24 * 60;
/// Widest slot / schedule query, in days.
pub const MAX_QUERY_DAYS: i64 = 62;

pub const MAX_PAGE_SIZE: usize = 100;
pub const DEFAULT_PAGE_SIZE: usize = 20;

pub const MAX_NAME_LEN: usize = 256;
pub const MAX_NOTE_LEN: usize = 2_000;
pub const MAX_IDEMPOTENCY_KEY_LEN: usize = 255;
pub const MAX_IDEMPOTENCY_RECORDS: usize = 500_000;
/// Longest idempotency retention: one year.
pub const MAX_IDEMPOTENCY_TTL_SECS: u64 = 365 * 24 * 60 * 60;

/// UTC-14:00 .. UTC+14:00
pub const MAX_UTC_OFFSET_MINUTES: i32 = 14 * 60;
