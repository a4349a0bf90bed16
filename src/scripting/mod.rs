//! Rhai scripting for Imaging Machine sessions.
//!
//! The tutorial workflows ship both as Rust functions ([`crate::tutorials`])
//! and as `.rhai` scripts under `scripts/`, run with `im_control run-script`.
//!
//! ```text
//! ScriptHost (rhai_engine.rs)
//!     ├── Engine with operation limit, print/debug routed to tracing
//!     └── bindings::register_machine
//!             └── MachineHandle, bound to `im` in every script scope
//! ```

pub mod bindings;
pub mod rhai_engine;

pub use bindings::{register_machine, MachineHandle};
pub use rhai_engine::{ScriptHost, MACHINE_VARIABLE};
