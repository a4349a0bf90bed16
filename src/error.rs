//! Custom error types for the Imaging Machine client.
//!
//! This module defines the primary error type, `ImError`, for the whole crate.
//! Using the `thiserror` crate, it provides a centralized and consistent way to handle
//! the different kinds of errors that can occur while talking to an Imaging Machine.
//!
//! ## Error Hierarchy
//!
//! `ImError` consolidates the layer-specific errors:
//!
//! - **`Config`**: Wraps errors from `figment`, typically file parsing or type mismatches
//!   in the configuration sources.
//! - **`Configuration`**: Semantic errors in an otherwise well-formed configuration
//!   (e.g. an empty host name or a zero timeout).
//! - **`Adapter`**: Transport failures from the [`crate::hardware`] layer: refused
//!   connections, timeouts, a peer that hung up.
//! - **`Protocol`**: Lines that could not be encoded or decoded.
//! - **`Device`**: The Imaging Machine answered `ERR`. Arguments are validated
//!   device-side, so this is where invalid parameters surface.
//! - **`NotConnected`**: A command was issued after `close_connection`.
//! - **`Script`**: A Rhai tutorial script failed to compile or run.
//!
//! By using `#[from]`, `ImError` can be created from the underlying error types,
//! simplifying error handling throughout the crate with the `?` operator.

use thiserror::Error;

use crate::hardware::adapter::AdapterError;
use crate::protocol::ProtocolError;

/// Convenience alias for results using the crate error type.
pub type ImResult<T> = std::result::Result<T, ImError>;

/// Errors produced by the Imaging Machine client, simulator and tutorials.
#[derive(Error, Debug)]
pub enum ImError {
    /// Configuration sources could not be loaded or deserialized.
    #[error("Configuration error: {0}")]
    Config(#[from] Box<figment::Error>),

    /// Configuration loaded but failed validation.
    #[error("Configuration validation error: {0}")]
    Configuration(String),

    /// Transport-level failure.
    #[error("Adapter error: {0}")]
    Adapter(#[from] AdapterError),

    /// Malformed command or reply line.
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// The device rejected a command.
    #[error("Device rejected {command}: {message}")]
    Device {
        /// Wire name of the rejected command (e.g. `SetObjective`).
        command: &'static str,
        /// Message sent back by the device.
        message: String,
    },

    /// The connection has been closed.
    #[error("Connection to the Imaging Machine is closed")]
    NotConnected,

    /// The device answered `OK` without the value the command returns.
    #[error("Missing value in reply to {0}")]
    MissingValue(&'static str),

    /// Script compilation or execution failed.
    #[error("Script error: {0}")]
    Script(String),

    /// Local I/O failure (reading a script, binding a listener).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<figment::Error> for ImError {
    fn from(err: figment::Error) -> Self {
        ImError::Config(Box::new(err))
    }
}
