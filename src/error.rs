//! Error types for the bridge.
//!
//! `BridgeError` is the single error type returned by every operation in the
//! crate. Device-level failures carry the offending device name (`target`) so
//! orchestration code can report which device misbehaved without string
//! parsing.
//!
//! ## Error Hierarchy
//!
//! - **Link errors** (`Connection`, `Timeout`): the transport could not deliver
//!   a request or did not receive a reply in time. A link error on a sent
//!   request faults the owning connection; the next `ensure_connected`
//!   re-establishes it.
//! - **Server verdicts** (`NotFound`, `Remote`, `NoData`): the server answered,
//!   but the answer was not a usable value.
//! - **Local refusals** (`Unsupported`, `MoveInProgress`, `Reentrant`): the call
//!   was rejected before any I/O.
//!
//! The enum is `Clone` because one failure is routinely observed by several
//! waiters: every caller sharing a connection attempt, and every holder of a
//! move handle.

use std::time::Duration;
use thiserror::Error;

/// Convenience alias for results using the bridge error type.
pub type Result<T> = std::result::Result<T, BridgeError>;

/// Failures surfaced by transports, the bridge and devices.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum BridgeError {
    /// The endpoint is unreachable, the socket failed, or the link is faulted.
    #[error("Connection error on {endpoint}: {message}")]
    Connection {
        /// `host:port` of the server
        endpoint: String,
        /// What went wrong
        message: String,
    },

    /// No reply, or no settlement, within the allotted time.
    #[error("Timed out after {waited:?}: {context}")]
    Timeout {
        /// The request or operation that timed out
        context: String,
        /// Time budget that was exhausted
        waited: Duration,
    },

    /// The server does not know the named device.
    #[error("'{target}' not found on the server")]
    NotFound {
        /// Server-side device name
        target: String,
    },

    /// The server replied with `success = false`.
    #[error("Server rejected {command} for '{target}': {description}")]
    Remote {
        /// Server-side device name
        target: String,
        /// Command that was rejected
        command: String,
        /// Server-supplied error description
        description: String,
    },

    /// A successful reply carried no data records.
    #[error("No data returned for '{target}'")]
    NoData {
        /// Server-side device name
        target: String,
    },

    /// The device kind does not support the requested operation.
    #[error("'{target}' does not support {operation}")]
    Unsupported {
        /// Local device name
        target: String,
        /// Rejected operation
        operation: String,
    },

    /// A move was requested while a previous one is still pending.
    #[error("Move already in progress on '{target}'")]
    MoveInProgress {
        /// Local device name
        target: String,
    },

    /// The move handle was cancelled by its holder.
    #[error("Move on '{target}' was cancelled")]
    Cancelled {
        /// Local device name
        target: String,
    },

    /// The reply could not be decoded or lacked required fields.
    #[error("Invalid response for '{target}': {message}")]
    InvalidResponse {
        /// Device name, or the command when no device applies
        target: String,
        /// Decoder message
        message: String,
    },

    /// A blocking bridge call was made from a thread that is already driving
    /// an async runtime. Use the async API there instead.
    #[error("Blocking bridge call issued from inside an async context")]
    Reentrant,

    /// The bridge execution context could not be started or has stopped.
    #[error("Bridge runtime error: {0}")]
    Runtime(String),

    /// Semantic configuration error (values parse but are unusable).
    #[error("Configuration validation error: {0}")]
    Configuration(String),
}

impl BridgeError {
    /// Whether this error leaves the underlying socket unusable.
    ///
    /// A REQ socket that sent a request and never saw the reply cannot issue
    /// another request, so both link-level variants count.
    pub fn is_link_fault(&self) -> bool {
        matches!(self, BridgeError::Connection { .. } | BridgeError::Timeout { .. })
    }

    /// Short machine-friendly name of the variant, used as a tracing field.
    pub fn kind(&self) -> &'static str {
        match self {
            BridgeError::Connection { .. } => "connection",
            BridgeError::Timeout { .. } => "timeout",
            BridgeError::NotFound { .. } => "not_found",
            BridgeError::Remote { .. } => "remote",
            BridgeError::NoData { .. } => "no_data",
            BridgeError::Unsupported { .. } => "unsupported",
            BridgeError::MoveInProgress { .. } => "move_in_progress",
            BridgeError::Cancelled { .. } => "cancelled",
            BridgeError::InvalidResponse { .. } => "invalid_response",
            BridgeError::Reentrant => "reentrant",
            BridgeError::Runtime(_) => "runtime",
            BridgeError::Configuration(_) => "configuration",
        }
    }
}
