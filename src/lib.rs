//! Client library for the Imaging Machine.
//!
//! An Imaging Machine is an automated microscope driven remotely over a line
//! protocol. This crate provides the async client ([`ImagingMachine`]), a
//! simulated device for offline work ([`simulator`]), Rhai scripting
//! ([`scripting`]) and the three tutorial workflows ([`tutorials`]) shipped
//! with the machine: objective movements, autofocus and acquisition.

pub mod config;
pub mod error;
pub mod hardware;
pub mod logging;
pub mod machine;
pub mod naming;
pub mod protocol;
pub mod scripting;
pub mod simulator;
pub mod tutorials;
pub mod types;

pub use error::{ImError, ImResult};
pub use machine::ImagingMachine;
