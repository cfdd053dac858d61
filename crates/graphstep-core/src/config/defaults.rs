//! Default values for graphstep configuration.
//!
//! All hardcoded defaults are centralized here for easy maintenance.

// ============================================================================
// File Locations
// ============================================================================

/// Project-local configuration file.
pub const LOCAL_CONFIG_FILE: &str = "graphstep.toml";

/// Directory under the user config dir (`~/.config/graphstep`).
pub const USER_CONFIG_DIR: &str = "graphstep";

/// File name inside [`USER_CONFIG_DIR`].
pub const USER_CONFIG_FILE: &str = "config.toml";

/// Environment variable holding a `dbConfig` JSON object.
pub const DB_CONFIG_ENV: &str = "GRAPHSTEP_DB";

// ============================================================================
// Client Defaults
// ============================================================================

/// Upper bound for a single request to the graph store (30 s).
pub const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 30;

/// Upper bound for establishing a connection (10 s).
pub const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 10;

/// Attempts per request before a transient failure becomes fatal.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 4;

/// First retry delay; doubled on every attempt.
pub const DEFAULT_INITIAL_BACKOFF_MS: u64 = 250;

/// Ceiling for the retry delay.
pub const DEFAULT_MAX_BACKOFF_MS: u64 = 5_000;

/// Tolerance for unit-length checks on quaternions.
pub const QUATERNION_TOLERANCE: f64 = 1e-6;

// ============================================================================
// Estimate Defaults
// ============================================================================

/// Assumed upload throughput (bytes/s).
pub const DEFAULT_UPLOAD_BYTES_PER_SEC: f64 = 1_000_000.0;

/// Assumed download throughput (bytes/s).
pub const DEFAULT_DOWNLOAD_BYTES_PER_SEC: f64 = 2_000_000.0;

/// Average serialized size of a node including its shape payload.
pub const DEFAULT_AVG_NODE_BYTES: f64 = 4_096.0;

/// Average serialized size of a relationship.
pub const DEFAULT_AVG_EDGE_BYTES: f64 = 64.0;
