//! Input bounds enforced at the engine boundary.

/// Longest single booking.
pub const MAX_SLOT_MINUTES: i64 = 12 * 60;

pub const MAX_COURSE_TYPE_LEN: usize = 64;
pub const MAX_REMARK_LEN: usize = 1_024;
pub const MAX_REASON_LEN: usize = 512;
pub const MAX_NAME_LEN: usize = 256;

/// Largest top-up accepted by a single recharge.
pub const MAX_RECHARGE_TIMES: u32 = 10_000;

/// Largest energy amount a single posting may move.
pub const MAX_ENERGY_AMOUNT: i64 = 1_000_000;

pub const MAX_REFERENCE_LEN: usize = 128;
pub const MAX_RULE_CODE_LEN: usize = 64;
