//! Fallback values for optional [crate::Config] fields.

pub const DEFAULT_LOG_LEVEL: &str = "info";
pub const DEFAULT_MAILBOX_SIZE: usize = 64;
pub const DEFAULT_NOTICE_BUFFER: usize = 256;
pub const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 5_000;
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 2_000;
pub const DEFAULT_HOUSEKEEPING_INTERVAL_MS: u64 = 5_000;
pub const DEFAULT_IN_ROUND_WATCHDOG_MS: u64 = 8_000;
pub const DEFAULT_BETWEEN_WATCHDOG_MS: u64 = 15_000;
pub const DEFAULT_WATCHDOG_MAX_BACKOFF_MS: u64 = 60_000;
pub const DEFAULT_WATCHDOG_JITTER: bool = true;
pub const DEFAULT_PUSH_ENABLED: bool = true;
pub const DEFAULT_RETRY_ATTEMPTS: usize = 3;
pub const DEFAULT_CANCEL_GRACE_MS: u64 = 30_000;
