//! Well-known names and default values.

use std::time::Duration;

// =============================================================================
// RESERVED STREAM TYPES
// =============================================================================

/// Stream type used to fetch a richer policy to overlay on the built-in one.
pub const FETCH_POLICY_STREAM: &str = "fetch_policy";

/// Stream type used to probe for a captive portal.
pub const CAPTIVE_PORTAL_STREAM: &str = "captive_portal_detect";

// =============================================================================
// RETRY
// =============================================================================

/// Name given to the implicit strategy of templates with no retry binding.
pub const SINGLE_ATTEMPT_STRATEGY: &str = "<single-attempt>";

/// Failure number `conceal` is still concealed; `conceal + 1` is the first
/// visible one.
pub const CONCEAL_IS_INCLUSIVE: bool = true;

/// Upper bound for a jitter percentage.
pub const MAX_JITTER_PERCENT: u8 = 100;

// =============================================================================
// SESSION
// =============================================================================

/// Status accepted by HTTP templates without an explicit expectation (2xx).
pub const DEFAULT_HTTP_SUCCESS: std::ops::RangeInclusive<u16> = 200..=299;

/// Redirect range that counts as failure on `http_fail_redirect` templates.
pub const HTTP_REDIRECT: std::ops::RangeInclusive<u16> = 300..=399;

/// Default absolute session timeout (none).
pub const DEFAULT_SESSION_TIMEOUT: Option<Duration> = None;

// =============================================================================
// POLICY FETCH / PROBES
// =============================================================================

/// Largest policy document accepted from the `fetch_policy` stream.
pub const MAX_POLICY_DOCUMENT_SIZE: usize = 256 * 1024;

// =============================================================================
// TRANSPORT
// =============================================================================

/// Default connect timeout of the bundled transport (TCP connect and TLS
/// handshake each).
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Receive buffer size of the bundled transport.
pub const DEFAULT_RECV_BUFFER_SIZE: usize = 16 * 1024;
