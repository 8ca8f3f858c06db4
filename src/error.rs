//! Error types for the server.
//!
//! This module defines the primary error type, `WavemuxError`, for the entire
//! application. Using the `thiserror` crate, it provides a centralized and
//! consistent way to handle the failure classes the server distinguishes:
//!
//! - **`Config`** wraps errors from the `figment` configuration pipeline
//!   (missing files, TOML syntax, type mismatches).
//! - **`Configuration`** represents semantic errors that pass parsing but are
//!   logically invalid (duplicate channel names, exposure out of bounds).
//!   These are caught by the validation step before the server starts.
//! - **`Device`** wraps [`DeviceError`], the channel-scoped hardware failure
//!   class. Device errors never halt the acquisition loop; they produce an
//!   error-status measurement for the affected channel and the cycle moves on.
//! - **`Protocol`** covers malformed handshakes or client requests. It is
//!   session-scoped: the offending session is closed, nothing else is.
//! - **`VersionMismatch`** is the hard handshake failure for a major-version
//!   difference between client and server. Minor differences do not produce
//!   an error at all; they mark the session degraded.
//! - **`BackpressureEviction`** records the hard backpressure ceiling: a
//!   session that stayed above its queue high-water mark past the grace
//!   period and was disconnected for it.
//! - **`UnknownChannel`** rejects a single subscription entry naming a
//!   channel the registry does not know. Remaining entries in the same
//!   request are still honored.
//!
//! By using `#[from]`, `WavemuxError` can be created from underlying error
//! types with the `?` operator throughout the crate.

use std::time::Duration;

use thiserror::Error;

use crate::version::VersionTuple;

/// Convenience alias for results using the application error type.
pub type AppResult<T> = std::result::Result<T, WavemuxError>;

/// Hardware failure raised by a switcher or instrument backend.
///
/// The acquisition loop cares about exactly one property of these: whether
/// the fault is worth a bounded retry with the device still considered
/// healthy, or marks the device unavailable until it reconnects.
#[derive(Error, Debug)]
pub enum DeviceError {
    /// The device rejected or dropped a command but is still reachable.
    #[error("device busy: {0}")]
    Busy(String),

    /// The device did not answer within the bounded wait.
    #[error("device timed out after {0:?}")]
    Timeout(Duration),

    /// The transport to the device is gone.
    #[error("device unreachable: {0}")]
    Unreachable(String),

    /// A select was requested for a position the device does not have.
    #[error("switch position {position} out of range (1..={max})")]
    PositionOutOfRange {
        /// Requested 1-based position.
        position: usize,
        /// Highest position the device reports.
        max: usize,
    },

    /// The device answered with something the protocol grammar cannot parse.
    #[error("unparseable device response: {0:?}")]
    Malformed(String),
}

impl DeviceError {
    /// True when the fault means the device is gone rather than momentarily
    /// unable to serve; fatal faults flip the health state to degraded and
    /// switch the scheduler to its skip-and-continue policy.
    pub fn is_fatal(&self) -> bool {
        matches!(self, DeviceError::Unreachable(_) | DeviceError::Malformed(_))
    }
}

#[derive(Error, Debug)]
pub enum WavemuxError {
    #[error("configuration error: {0}")]
    Config(#[from] figment::Error),

    #[error("configuration validation error: {0}")]
    Configuration(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("wire serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("device error: {0}")]
    Device(#[from] DeviceError),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("client version {client} incompatible with server {server}: major versions differ")]
    VersionMismatch {
        /// Version the client declared in its handshake.
        client: VersionTuple,
        /// Version this server build carries.
        server: VersionTuple,
    },

    #[error("session '{session}' evicted: outbound queue above high-water mark for {sustained:?}")]
    BackpressureEviction {
        /// Client name of the evicted session.
        session: String,
        /// How long the queue stayed above the high-water mark.
        sustained: Duration,
    },

    #[error("unknown channel '{0}'")]
    UnknownChannel(String),

    #[error("sink failure: {0}")]
    Sink(String),

    #[error("feature not enabled: {0}")]
    FeatureNotEnabled(String),

    #[error("scheduler command channel closed")]
    SchedulerGone,
}
