//! Tutorial workflows shipped with the Imaging Machine.
//!
//! Each tutorial takes an open [`ImagingMachine`] session, runs one linear
//! sequence of remote calls with the documented example parameters and
//! returns a report for the caller to print. Closing the session is left to
//! the caller so a failed run still releases the device.

pub mod acquire;
pub mod autofocus;
pub mod objective_movements;

use serde::Serialize;
use std::fmt;

pub use acquire::{run as acquire, AcquireReport, DEFAULT_DATASET_DIR};
pub use autofocus::{run as autofocus, AutofocusReport};
pub use objective_movements::{run as objective_movements, MovementReport};

use crate::error::ImResult;
use crate::machine::ImagingMachine;

/// Stage position read back from the device.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct StagePosition {
    /// X in mm.
    pub x_mm: f64,
    /// Y in mm.
    pub y_mm: f64,
    /// Z in µm.
    pub z_um: f64,
}

impl StagePosition {
    pub(crate) async fn read(machine: &ImagingMachine) -> ImResult<Self> {
        Ok(Self {
            x_mm: machine.get_position_x().await?,
            y_mm: machine.get_position_y().await?,
            z_um: machine.get_position_z().await?,
        })
    }
}

impl fmt::Display for StagePosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "X={:.3} mm, Y={:.3} mm, Z={:.1} µm", self.x_mm, self.y_mm, self.z_um)
    }
}
