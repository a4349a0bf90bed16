//! Line-oriented transport abstraction.
//!
//! The Imaging Machine speaks a half-duplex, one-line-per-message protocol.
//! `HardwareAdapter` hides whether those lines travel over a real TCP socket
//! ([`super::TcpAdapter`]) or a scripted in-memory peer ([`super::MockAdapter`]).

use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;

/// Transport-level failures.
#[derive(Debug, Error)]
pub enum AdapterError {
    /// The adapter has not been connected, or was disconnected.
    #[error("Not connected")]
    NotConnected,

    /// The connection could not be established.
    #[error("Connection to {address} failed: {source}")]
    ConnectionFailed {
        /// `host:port` that was dialled.
        address: String,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// The peer closed the connection while a reply was expected.
    #[error("Connection closed by peer")]
    ConnectionClosed,

    /// No complete line arrived in time.
    #[error("Timed out after {0:?}")]
    Timeout(Duration),

    /// Socket I/O failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Failure injected by a test adapter.
    #[error("Injected failure: {0}")]
    Injected(String),
}

/// Half-duplex line transport to one device.
///
/// Lines are passed without terminator; the adapter appends and strips it.
#[async_trait]
pub trait HardwareAdapter: Send + Sync {
    /// Short adapter name for logs (`"tcp"`, `"mock"`).
    fn name(&self) -> &str;

    /// Open the connection.
    async fn connect(&mut self) -> Result<(), AdapterError>;

    /// Close the connection. Closing an unconnected adapter is a no-op.
    async fn disconnect(&mut self) -> Result<(), AdapterError>;

    /// Whether `connect` succeeded and `disconnect` has not been called.
    fn is_connected(&self) -> bool;

    /// Write one line and wait up to `timeout` for the reply line.
    ///
    /// A failed exchange leaves the adapter disconnected, so a late reply is
    /// never paired with a later request.
    async fn query(&mut self, line: &str, timeout: Duration) -> Result<String, AdapterError>;
}
