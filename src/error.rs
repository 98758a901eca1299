//! Error types for the relay.
//!
//! ```text
//! RelayError
//! ├── Transport           read/write failure on one connection (ends that session)
//! ├── Protocol            malformed or unrecognized message (dropped, session continues)
//! ├── Persistence         call store unreachable or write failed (logged, counted)
//! ├── StateInconsistency  hangup with no matching open call (expected race, no-op)
//! ├── IdentityExhausted   no free identifier could be allocated
//! └── LedgerUnavailable   the ledger worker has stopped
//! ```
//!
//! None of these are fatal to the process: relaying messages always wins
//! over completeness of the call log.

use thiserror::Error;

/// Result type alias for relay operations.
pub type Result<T> = std::result::Result<T, RelayError>;

/// Main error type for the relay.
#[derive(Error, Debug)]
pub enum RelayError {
    /// A connection could not be read from or written to.
    #[error("Transport error: {0}")]
    Transport(String),

    /// An inbound frame could not be decoded into a known message.
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// The call store rejected or failed an operation.
    #[error("Persistence error: {0}")]
    Persistence(#[from] rusqlite::Error),

    /// A hangup arrived for which no open call exists.
    #[error("No open call for {from} (to: {})", to.as_deref().unwrap_or("<unspecified>"))]
    StateInconsistency { from: String, to: Option<String> },

    /// Every identifier candidate collided with a live participant.
    #[error("Could not allocate a free identifier after {attempts} attempts")]
    IdentityExhausted { attempts: usize },

    /// The background ledger worker is no longer accepting events.
    #[error("Call ledger is unavailable")]
    LedgerUnavailable,
}

/// Why an inbound frame was rejected.
#[derive(Error, Debug)]
pub enum ProtocolError {
    /// The frame is not valid JSON or does not match the message schema.
    #[error("Malformed message: {0}")]
    Malformed(#[from] serde_json::Error),

    /// The `type` tag is missing or not one clients may send.
    #[error("Unknown message type: {0}")]
    UnknownType(String),

    /// A binary frame arrived; the protocol is text-only.
    #[error("Binary frames are not supported")]
    Binary,
}
