//! Hard caps on tenant-controlled sizes.

pub const MAX_TENANTS: usize = 1024;
pub const MAX_TENANT_NAME_LEN: usize = 128;

pub const MAX_PROGRAMS_PER_TENANT: usize = 10_000;
pub const MAX_TITLE_LEN: usize = 200;
pub const MAX_SLOTS_PER_PROGRAM: usize = 5_000;
/// One row per weekday.
pub const MAX_PATTERN_ROWS: u32 = 7;
pub const MAX_CELLS_PER_ROW: usize = 96;

pub const MAX_USER_ID_LEN: usize = 128;
pub const MAX_REQUEST_ID_LEN: usize = 128;
pub const MAX_PROGRAM_ID_LEN: usize = 256;
pub const MAX_PAYMENT_REF_LEN: usize = 256;
pub const MAX_SLOTS_PER_BOOKING: usize = 64;
pub const MAX_GROUP_SIZE: u32 = 1_000;
