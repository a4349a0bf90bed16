//! Hardware adapter implementations
//!
//! This module contains the [`HardwareAdapter`] trait and its implementations,
//! providing the line-level I/O under the Imaging Machine client.

pub mod adapter;
pub mod mock;
pub mod tcp_adapter;

pub use adapter::{AdapterError, HardwareAdapter};
pub use mock::MockAdapter;
pub use tcp_adapter::TcpAdapter;
