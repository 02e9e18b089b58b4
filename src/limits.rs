use crate::model::Ms;

/// 2000-01-01T00:00:00Z
pub const MIN_VALID_TIMESTAMP_MS: Ms = 946_684_800_000;
/// 2100-01-01T00:00:00Z
pub const MAX_VALID_TIMESTAMP_MS: Ms = 4_102_444_800_000;

/// A single booking may not exceed 31 days.
pub const MAX_BOOKING_HOURS: u32 = 31 * 24;

/// Availability/conflict/statistics queries are capped at one year.
pub const MAX_QUERY_WINDOW_MS: Ms = 366 * 24 * 3_600_000;

pub const MAX_SLOTS: usize = 100_000;
pub const MAX_BOOKINGS_PER_SLOT: usize = 50_000;

pub const MAX_SLOT_NUMBER_LEN: usize = 64;
pub const MAX_VEHICLE_NUMBER_LEN: usize = 32;
pub const MAX_USER_ID_LEN: usize = 128;
