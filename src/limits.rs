use crate::model::Ms;

pub const MAX_TENANTS: usize = 1_000;
pub const MAX_TENANT_NAME_LEN: usize = 128;

pub const MAX_ROOMS_PER_TENANT: usize = 10_000;
pub const MAX_RESERVATIONS_PER_ROOM: usize = 100_000;

pub const MAX_NAME_LEN: usize = 256;
pub const MAX_PURPOSE_LEN: usize = 1_024;
pub const MAX_REASON_LEN: usize = 1_024;
pub const MAX_PARTICIPANTS: usize = 100;
pub const MAX_FIELD_LEN: usize = 256;

/// 2000-01-01T00:00:00Z
pub const MIN_VALID_TIMESTAMP_MS: Ms = 946_684_800_000;
/// 2100-01-01T00:00:00Z
pub const MAX_VALID_TIMESTAMP_MS: Ms = 4_102_444_800_000;
/// A reservation may not be booked for longer than a week.
pub const MAX_RESERVATION_DURATION_MS: Ms = 7 * 24 * 3_600_000;
