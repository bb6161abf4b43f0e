//! Default constants for unicontact configuration.
//!
//! All magic numbers are centralized here with documentation.

// =============================================================================
// Validation Defaults
// =============================================================================

/// Maximum phone number length in characters.
pub const DEFAULT_MAX_PHONE_LEN: usize = 15;

/// Maximum email length in characters.
pub const DEFAULT_MAX_EMAIL_LEN: usize = 255;

// =============================================================================
// Concurrency Defaults
// =============================================================================

/// Serialize reconciliations that share an email or phone value.
pub const DEFAULT_KEY_LOCKING: bool = true;

// =============================================================================
// Storage Defaults (RocksDB)
// =============================================================================

/// Default number of contacts held in the point-read LRU cache
pub const DEFAULT_CACHE_CAPACITY: usize = 100_000;

// =============================================================================
// Logging Defaults
// =============================================================================

/// Default tracing filter directive when `RUST_LOG` is unset
pub const DEFAULT_LOG_FILTER: &str = "unicontact_rs=info";
