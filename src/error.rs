//! Error types and result handling for pg-capture.
//!
//! This module defines the main error type [`Error`] and a convenience
//! [`Result`] type alias used throughout the crate. Every variant of
//! [`Error`] is fatal to a replication session: it unwinds the receive loop
//! and the session ends in the `Failed` phase. Conditions the loop recovers
//! from on its own (a malformed payload, an unknown relation) are reported
//! with [`DecodeError`](crate::postgres::DecodeError) instead.
//!
//! # Example
//!
//! ```rust
//! use pg_capture::{Error, Result};
//!
//! fn connect_to_database() -> Result<()> {
//!     // Simulating a connection error
//!     Err(Error::Connection("Failed to connect".to_string()))
//! }
//!
//! match connect_to_database() {
//!     Ok(()) => println!("Connected"),
//!     Err(Error::Connection(msg)) => eprintln!("Connection error: {}", msg),
//!     Err(e) => eprintln!("Other error: {}", e),
//! }
//! ```

use thiserror::Error;

/// SQLSTATE reported by the server when an object (such as a replication
/// slot) already exists.
pub const SQLSTATE_DUPLICATE_OBJECT: &str = "42710";

/// The main error type for pg-capture operations.
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration error, typically an invalid or missing setting.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Configuration could not be loaded from its sources.
    #[error("Configuration source error: {0}")]
    ConfigSource(#[from] config::ConfigError),

    /// Connection string could not be parsed.
    #[error("PostgreSQL error: {0}")]
    Postgres(#[from] tokio_postgres::Error),

    /// JSON serialization error when encoding events.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// I/O error on the replication socket or the sink.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Generic connection error not covered by specific types.
    #[error("Connection error: {0}")]
    Connection(String),

    /// Authentication failure with PostgreSQL.
    #[error("Authentication error: {0}")]
    Authentication(String),

    /// The server answered a command with an ErrorResponse.
    #[error("Server error {code}: {message}")]
    Server {
        /// SQLSTATE code
        code: String,
        /// Primary human-readable message
        message: String,
    },

    /// Protocol-level error in the wire framing.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Replication-specific error.
    #[error("Replication error: {message}")]
    Replication {
        /// Description of the replication error
        message: String,
    },

    /// The downstream sink refused or failed to accept an event.
    #[error("Sink error: {0}")]
    Sink(String),

    /// Operation timeout.
    #[error("Timeout error: {message}")]
    Timeout {
        /// Description of what timed out
        message: String,
    },
}

impl Error {
    /// Returns true when the server rejected a command because the target
    /// object already exists.
    pub fn is_already_exists(&self) -> bool {
        match self {
            Error::Server { code, message } => {
                code == SQLSTATE_DUPLICATE_OBJECT || message.contains("already exists")
            }
            _ => false,
        }
    }
}

/// A convenient Result type alias for pg-capture operations.
///
/// This is equivalent to `std::result::Result<T, pg_capture::Error>`.
///
/// # Example
///
/// ```rust
/// use pg_capture::Result;
///
/// fn do_something() -> Result<String> {
///     Ok("Success".to_string())
/// }
/// ```
pub type Result<T> = std::result::Result<T, Error>;
