//! Hard limits enforced at the engine boundary.

pub const MAX_RESOURCES: usize = 100_000;
pub const MAX_REQUESTERS: usize = 1_000_000;
pub const MAX_NAME_LEN: usize = 256;
pub const MAX_EMAIL_LEN: usize = 320;
pub const MAX_CAPACITY: u32 = 1_000_000;
/// Removal renumbers the tail, so the queue is kept short.
pub const MAX_WAITLIST_LEN: usize = 10_000;
