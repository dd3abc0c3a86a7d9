//! Application-wide constants for notification-sync.
//!
//! This module centralizes the magic numbers of the sync engine. Values that
//! operators may want to tune are also exposed through [`crate::config::Config`];
//! the constants here are their defaults.
//!
//! # Categories
//!
//! - **Timeouts**: Network and operation timeouts
//! - **Stream**: Reconnection backoff for the event stream
//! - **Session**: Credential renewal bounds
//! - **Inbox**: Listing and buffering sizes

use std::time::Duration;

// ============================================================================
// Timeouts
// ============================================================================

/// HTTP client request timeout for request/response calls.
///
/// A call that exceeds this surfaces as a network failure, never as an
/// authorization failure.
pub const HTTP_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Connect timeout for the long-lived event stream request.
///
/// The stream body itself has no overall timeout since it stays open for
/// the lifetime of the session.
pub const STREAM_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

// ============================================================================
// Stream
// ============================================================================

/// Initial reconnection delay for the event stream.
pub const RECONNECT_BASE_DELAY: Duration = Duration::from_secs(1);

/// Upper bound on the reconnection delay, jitter included.
pub const RECONNECT_MAX_DELAY: Duration = Duration::from_secs(30);

/// Maximum random jitter added to each reconnection delay.
pub const RECONNECT_JITTER: Duration = Duration::from_millis(1000);

// ============================================================================
// Session
// ============================================================================

/// Consecutive failed credential renewals tolerated before giving up.
///
/// The next authorization failure after this many failed renewals propagates
/// as `RenewalExhausted` without attempting another renewal.
pub const MAX_RENEWAL_ATTEMPTS: u32 = 3;

// ============================================================================
// Inbox
// ============================================================================

/// Page size for the listing fetched by a full refresh.
pub const DEFAULT_PAGE_LIMIT: u32 = 20;

/// Capacity of the renewal-exhausted broadcast channel.
pub const RENEWAL_EVENT_CAPACITY: usize = 16;
