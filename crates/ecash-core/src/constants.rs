//! Protocol and runtime constants.

/// Number of fractional units in one whole currency unit.
pub const AMOUNT_FRACTIONAL_BASE: u32 = 100_000_000;

/// Maximum number of fractional digits in an amount string.
pub const AMOUNT_FRACTIONAL_LENGTH: usize = 8;

/// Largest representable whole value (2^52).
pub const AMOUNT_MAX_VALUE: u64 = 1 << 52;

/// Cut-and-choose parameter used when melting a coin.
pub const REFRESH_KAPPA: usize = 3;

/// Initial retry delay in milliseconds.
pub const RETRY_BASE_DELAY_MS: u64 = 200;

/// Multiplier applied per failed attempt.
pub const RETRY_BACKOFF_FACTOR: f64 = 1.5;

/// Upper bound for the random jitter fraction added to each delay.
pub const RETRY_MAX_JITTER: f64 = 0.2;

/// Longest delay between two attempts (one hour).
pub const RETRY_MAX_DELAY_MS: u64 = 60 * 60 * 1000;

/// Default timeout for a single exchange request.
pub const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 5;

/// Crypto workers shut down after this many idle seconds.
pub const DEFAULT_WORKER_IDLE_TIMEOUT_SECS: u64 = 15;

/// Capacity of the wallet notification channel.
pub const DEFAULT_NOTIFICATION_CAPACITY: usize = 256;
