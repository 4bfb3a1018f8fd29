//! Error types for Beacon Core

use thiserror::Error;

/// Rejection taxonomy for inbound events
///
/// Every rejection is local and non-fatal: it is reported once to the caller
/// and causes no state change. The server never retries on a client's behalf.
#[derive(Error, Debug)]
pub enum Error {
    /// Missing or malformed required fields
    #[error("invalid request: {0}")]
    Validation(String),

    /// Acting without the required role or authority
    #[error("not permitted: {0}")]
    NotPermitted(String),

    /// Unknown room, unknown target, or stale pending/invitation record
    #[error("not found: {0}")]
    NotFound(String),

    /// Room at maximum membership
    #[error("room is full")]
    RoomFull,
}

pub type Result<T> = std::result::Result<T, Error>;
