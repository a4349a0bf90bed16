//! Imaging Machine bindings for Rhai scripts.
//!
//! Scripts see a `MachineHandle` (bound to `im` by [`super::ScriptHost`]) with
//! one method per remote command, named like the Rust client:
//!
//! ```rhai
//! im.set_objective(2);
//! im.move_xy_to(10.123, 30.456);
//! let z = im.run_software_autofocus("bf", 2, 80, 100, 18000.0, 11, 10.0);
//! print(`Z-Focus = ${z} µm`);
//! ```
//!
//! Rhai integers are `i64`; coordinates must be written as floats (`18000.0`).
//! Each call blocks the script thread on the async client, so scripts must run
//! outside the async runtime (see [`super::ScriptHost::execute`]).

use rhai::{Engine, EvalAltResult};
use std::future::Future;
use std::sync::Arc;
use tokio::runtime::Handle;

use crate::error::ImResult;
use crate::machine::ImagingMachine;
use crate::types::{
    Acquisition, AutofocusSettings, CameraRoi, FluoChannels, LightSettings, LightSource, Mode,
    StackSettings,
};

type ScriptResult<T> = Result<T, Box<EvalAltResult>>;

/// Handle to an Imaging Machine session exposed to Rhai
#[derive(Clone)]
pub struct MachineHandle {
    /// Shared client
    pub machine: Arc<ImagingMachine>,
    /// Runtime driving the client's I/O
    pub runtime: Handle,
}

impl MachineHandle {
    /// Wrap `machine`, driving its futures on `runtime`.
    pub fn new(machine: Arc<ImagingMachine>, runtime: Handle) -> Self {
        Self { machine, runtime }
    }

    fn block<T, F>(&self, call: impl FnOnce(Arc<ImagingMachine>) -> F) -> ScriptResult<T>
    where
        F: Future<Output = ImResult<T>>,
    {
        let machine = Arc::clone(&self.machine);
        self.runtime
            .block_on(call(machine))
            .map_err(|e| e.to_string().into())
    }
}

fn int<T: TryFrom<i64>>(what: &str, v: i64) -> ScriptResult<T> {
    T::try_from(v).map_err(|_| format!("{what} {v} is out of range").into())
}

fn light_source(s: &str) -> ScriptResult<LightSource> {
    s.parse().map_err(|e: crate::protocol::ProtocolError| e.to_string().into())
}

fn light_settings(
    channel: i64,
    source: &str,
    filter: i64,
    intensity: i64,
    exposure: i64,
    light_constant_on: bool,
) -> ScriptResult<LightSettings> {
    Ok(LightSettings::new(
        int("channel", channel)?,
        light_source(source)?,
        int("detection filter", filter)?,
        int("intensity", intensity)?,
        int("exposure", exposure)?,
    )
    .with_light_constant_on(light_constant_on))
}

#[allow(clippy::too_many_arguments)]
fn acquisition(
    channel: i64,
    source: &str,
    filter: i64,
    intensity: i64,
    exposure: i64,
    z_center: f64,
    n_slices: i64,
    z_step: f64,
    light_constant_on: bool,
    save_directory: &str,
) -> ScriptResult<Acquisition> {
    let light = light_settings(channel, source, filter, intensity, exposure, light_constant_on)?;
    let stack = StackSettings::new(z_center, int("number of slices", n_slices)?, z_step);
    Ok(Acquisition::builder(light, stack)
        .save_directory(save_directory)
        .build())
}

/// Register `MachineHandle` and its methods on `engine`.
pub fn register_machine(engine: &mut Engine) {
    engine.register_type_with_name::<MachineHandle>("ImagingMachine");

    // Objective and stage
    engine.register_fn("set_objective", |h: &mut MachineHandle, index: i64| -> ScriptResult<()> {
        let index: u8 = int("objective index", index)?;
        h.block(|im| async move { im.set_objective(index).await })
    });
    engine.register_fn("move_xy_to", |h: &mut MachineHandle, x: f64, y: f64| {
        h.block(|im| async move { im.move_xy_to(x, y).await })
    });
    engine.register_fn("move_xy_by", |h: &mut MachineHandle, dx: f64, dy: f64| {
        h.block(|im| async move { im.move_xy_by(dx, dy).await })
    });
    engine.register_fn("move_z_to", |h: &mut MachineHandle, z: f64| {
        h.block(|im| async move { im.move_z_to(z).await })
    });
    engine.register_fn("move_z_by", |h: &mut MachineHandle, dz: f64| {
        h.block(|im| async move { im.move_z_by(dz).await })
    });
    engine.register_fn(
        "move_xyz_to",
        |h: &mut MachineHandle, x: f64, y: f64, z: f64| {
            h.block(|im| async move { im.move_xyz_to(x, y, z).await })
        },
    );

    // Imaging configuration
    engine.register_fn(
        "set_light_source",
        |h: &mut MachineHandle,
         channel: i64,
         source: &str,
         filter: i64,
         intensity: i64,
         exposure: i64,
         light_constant_on: bool|
         -> ScriptResult<()> {
            let light = light_settings(channel, source, filter, intensity, exposure, light_constant_on)?;
            h.block(|im| async move { im.set_light_source(&light).await })
        },
    );
    engine.register_fn(
        "set_fluo_channel",
        |h: &mut MachineHandle,
         channel: i64,
         code: &str,
         filter: i64,
         intensity: i64,
         exposure: i64,
         light_constant_on: bool|
         -> ScriptResult<()> {
            let leds: FluoChannels = code
                .parse()
                .map_err(|e: crate::protocol::ProtocolError| -> Box<EvalAltResult> {
                    e.to_string().into()
                })?;
            let channel: u32 = int("channel", channel)?;
            let filter: u8 = int("detection filter", filter)?;
            let intensity: u8 = int("intensity", intensity)?;
            let exposure: u32 = int("exposure", exposure)?;
            h.block(|im| async move {
                im.set_fluo_channel(channel, leds, filter, intensity, exposure, light_constant_on)
                    .await
            })
        },
    );
    engine.register_fn(
        "set_camera",
        |h: &mut MachineHandle, x: i64, y: i64, width: i64, height: i64, binning: i64| -> ScriptResult<()> {
            let roi = CameraRoi {
                x: int("ROI x", x)?,
                y: int("ROI y", y)?,
                width: int("ROI width", width)?,
                height: int("ROI height", height)?,
                binning: int("binning", binning)?,
            };
            h.block(|im| async move { im.set_camera(roi).await })
        },
    );
    engine.register_fn("reset_camera", |h: &mut MachineHandle| {
        h.block(|im| async move { im.reset_camera().await })
    });

    // Autofocus
    engine.register_fn(
        "run_software_autofocus",
        |h: &mut MachineHandle,
         source: &str,
         filter: i64,
         intensity: i64,
         exposure: i64,
         z_center: f64,
         n_slices: i64,
         z_step: f64|
         -> ScriptResult<f64> {
            let settings = AutofocusSettings {
                light_source: light_source(source)?,
                detection_filter: int("detection filter", filter)?,
                intensity: int("intensity", intensity)?,
                exposure_ms: int("exposure", exposure)?,
                stack: StackSettings::new(z_center, int("number of slices", n_slices)?, z_step),
            };
            h.block(|im| async move { im.run_software_autofocus(&settings).await })
        },
    );
    engine.register_fn(
        "run_hardware_autofocus",
        |h: &mut MachineHandle, objective: i64, filter: i64, z_start: f64| -> ScriptResult<f64> {
            let objective: u8 = int("objective index", objective)?;
            let filter: u8 = int("detection filter", filter)?;
            h.block(|im| async move { im.run_hardware_autofocus(objective, filter, z_start).await })
        },
    );

    // Metadata, project and mode
    engine.register_fn("set_metadata_well_id", |h: &mut MachineHandle, id: &str| {
        let id = id.to_string();
        h.block(|im| async move { im.set_metadata_well_id(&id).await })
    });
    engine.register_fn("set_metadata_subposition", |h: &mut MachineHandle, n: i64| -> ScriptResult<()> {
        let n: u32 = int("subposition", n)?;
        h.block(|im| async move { im.set_metadata_subposition(n).await })
    });
    engine.register_fn("set_metadata_timepoint", |h: &mut MachineHandle, n: i64| -> ScriptResult<()> {
        let n: u32 = int("timepoint", n)?;
        h.block(|im| async move { im.set_metadata_timepoint(n).await })
    });
    engine.register_fn(
        "set_default_project_folder",
        |h: &mut MachineHandle, path: &str| {
            let path = path.to_string();
            h.block(|im| async move { im.set_default_project_folder(&path).await })
        },
    );
    engine.register_fn("set_plate_id", |h: &mut MachineHandle, id: &str| {
        let id = id.to_string();
        h.block(|im| async move { im.set_plate_id(&id).await })
    });
    engine.register_fn("set_mode", |h: &mut MachineHandle, mode: &str| -> ScriptResult<()> {
        let mode: Mode = mode
            .parse()
            .map_err(|e: crate::protocol::ProtocolError| -> Box<EvalAltResult> {
                e.to_string().into()
            })?;
        h.block(|im| async move { im.set_mode(mode).await })
    });

    // Acquisition: 8 arguments (defaults) or the full 10
    engine.register_fn(
        "acquire",
        |h: &mut MachineHandle,
         channel: i64,
         source: &str,
         filter: i64,
         intensity: i64,
         exposure: i64,
         z_center: f64,
         n_slices: i64,
         z_step: f64|
         -> ScriptResult<String> {
            let acq = acquisition(
                channel, source, filter, intensity, exposure, z_center, n_slices, z_step, false, "",
            )?;
            h.block(|im| async move { im.acquire(&acq).await })
        },
    );
    engine.register_fn(
        "acquire",
        |h: &mut MachineHandle,
         channel: i64,
         source: &str,
         filter: i64,
         intensity: i64,
         exposure: i64,
         z_center: f64,
         n_slices: i64,
         z_step: f64,
         light_constant_on: bool,
         save_directory: &str|
         -> ScriptResult<String> {
            let acq = acquisition(
                channel,
                source,
                filter,
                intensity,
                exposure,
                z_center,
                n_slices,
                z_step,
                light_constant_on,
                save_directory,
            )?;
            h.block(|im| async move { im.acquire(&acq).await })
        },
    );

    // Read-back
    engine.register_fn("get_mode", |h: &mut MachineHandle| -> ScriptResult<String> {
        h.block(|im| async move { im.get_mode().await.map(|m| m.to_string()) })
    });
    engine.register_fn("get_objective", |h: &mut MachineHandle| -> ScriptResult<i64> {
        h.block(|im| async move { im.get_objective().await.map(i64::from) })
    });
    engine.register_fn("get_position_x", |h: &mut MachineHandle| -> ScriptResult<f64> {
        h.block(|im| async move { im.get_position_x().await })
    });
    engine.register_fn("get_position_y", |h: &mut MachineHandle| -> ScriptResult<f64> {
        h.block(|im| async move { im.get_position_y().await })
    });
    engine.register_fn("get_position_z", |h: &mut MachineHandle| -> ScriptResult<f64> {
        h.block(|im| async move { im.get_position_z().await })
    });
    engine.register_fn("get_project_folder", |h: &mut MachineHandle| -> ScriptResult<String> {
        h.block(|im| async move { im.get_project_folder().await })
    });
    engine.register_fn("get_plate_id", |h: &mut MachineHandle| -> ScriptResult<String> {
        h.block(|im| async move { im.get_plate_id().await })
    });

    engine.register_fn("close_connection", |h: &mut MachineHandle| {
        h.block(|im| async move { im.close_connection().await })
    });
}
