//! Simulated Imaging Machine
//!
//! Provides a software stand-in for the Imaging Machine so the client and the
//! tutorials can run without hardware. The simulation covers what is
//! observable through the remote-control port:
//!
//! - device-side argument validation (`ERR` replies, state untouched)
//! - live/script mode switching, including the temporary script session of
//!   acquire and autofocus
//! - stage, objective, camera and light state
//! - autofocus against a configurable best-focus plane
//! - the save directory and file names an acquisition would produce
//!
//! No images are written.
//!
//! # Example
//!
//! ```no_run
//! use im_control::config::SimulatorSettings;
//! use im_control::simulator::{SimulatedMachine, SimulatorServer};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let machine = SimulatedMachine::new(&SimulatorSettings::default());
//!     let server = SimulatorServer::bind("127.0.0.1:0", machine).await?;
//!     println!("simulator listening on {}", server.local_addr()?);
//!     server.run().await?;
//!     Ok(())
//! }
//! ```

use chrono::{Local, NaiveDateTime};
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::SimulatorSettings;
use crate::error::ImResult;
use crate::naming::{self, ImageMetadata};
use crate::protocol::{Command, Reply};
use crate::types::{
    Acquisition, AutofocusSettings, CameraRoi, LightSettings, LightSource, Mode, StackSettings,
};

/// Objective slots on the turret.
pub const OBJECTIVE_SLOTS: std::ops::RangeInclusive<u8> = 1..=4;
/// Detection filter slots.
pub const FILTER_SLOTS: std::ops::RangeInclusive<u8> = 1..=4;
/// Stage travel along X in mm.
pub const X_TRAVEL_MM: std::ops::RangeInclusive<f64> = 0.0..=120.0;
/// Stage travel along Y in mm.
pub const Y_TRAVEL_MM: std::ops::RangeInclusive<f64> = 0.0..=80.0;
/// Objective travel along Z in µm.
pub const Z_TRAVEL_UM: std::ops::RangeInclusive<f64> = 0.0..=30_000.0;
/// Largest stack the device accepts, for acquisition and autofocus alike.
pub const MAX_SLICES: u32 = 1000;
/// Acquisitions kept in [`SimulatedMachine::acquisitions`]; older ones are dropped.
pub const ACQUISITION_HISTORY: usize = 256;

/// One acquire command as the device executed it.
#[derive(Debug, Clone, PartialEq)]
pub struct AcquisitionRecord {
    /// Arguments of the acquire command.
    pub acquisition: Acquisition,
    /// Directory the images went to.
    pub directory: String,
    /// File name of every slice, bottom first.
    pub files: Vec<String>,
    /// Mode the device was in when the command arrived.
    pub requested_in: Mode,
    /// Objective used.
    pub objective: u8,
    /// Camera settings used.
    pub camera: CameraRoi,
}

/// State of a simulated Imaging Machine.
#[derive(Debug, Clone)]
pub struct SimulatedMachine {
    mode: Mode,
    objective: u8,
    x_mm: f64,
    y_mm: f64,
    z_um: f64,
    camera: CameraRoi,
    light: Option<LightSettings>,
    metadata: ImageMetadata,
    project_folder: String,
    plate_id: String,
    session_start: Option<NaiveDateTime>,
    focus_z_um: f64,
    hardware_af_range_um: f64,
    acquisitions: Vec<AcquisitionRecord>,
    closed_sessions: usize,
}

type Outcome = Result<Option<String>, String>;

impl SimulatedMachine {
    /// Machine in live mode with objective 1, the stage at the origin and the
    /// focus plane from `settings`.
    pub fn new(settings: &SimulatorSettings) -> Self {
        Self {
            mode: Mode::Live,
            objective: 1,
            x_mm: 0.0,
            y_mm: 0.0,
            z_um: 0.0,
            camera: CameraRoi::full_frame(),
            light: None,
            metadata: ImageMetadata::default(),
            project_folder: settings.project_folder.clone(),
            plate_id: "plate".to_string(),
            session_start: None,
            focus_z_um: settings.focus_z_um,
            hardware_af_range_um: settings.hardware_af_range_um,
            acquisitions: Vec::new(),
            closed_sessions: 0,
        }
    }

    /// Current operating mode.
    pub fn mode(&self) -> Mode {
        self.mode
    }

    /// Selected objective slot.
    pub fn objective(&self) -> u8 {
        self.objective
    }

    /// Stage position as (X mm, Y mm, Z µm).
    pub fn position(&self) -> (f64, f64, f64) {
        (self.x_mm, self.y_mm, self.z_um)
    }

    /// Camera settings.
    pub fn camera(&self) -> CameraRoi {
        self.camera
    }

    /// Last light settings applied with `SetLightSource` / `SetFluoChannel`.
    pub fn light(&self) -> Option<LightSettings> {
        self.light
    }

    /// Metadata tags for the next acquisition.
    pub fn metadata(&self) -> &ImageMetadata {
        &self.metadata
    }

    /// Default project folder.
    pub fn project_folder(&self) -> &str {
        &self.project_folder
    }

    /// Plate ID.
    pub fn plate_id(&self) -> &str {
        &self.plate_id
    }

    /// Every acquisition executed so far.
    pub fn acquisitions(&self) -> &[AcquisitionRecord] {
        &self.acquisitions
    }

    /// Number of `CloseConnection` commands received.
    pub fn closed_sessions(&self) -> usize {
        self.closed_sessions
    }

    /// Best-focus plane in µm.
    pub fn focus_z(&self) -> f64 {
        self.focus_z_um
    }

    /// Move the best-focus plane, e.g. to emulate a different plate.
    pub fn set_focus_z(&mut self, z_um: f64) {
        self.focus_z_um = z_um;
    }

    /// Execute one command and produce the reply the device would send.
    pub fn handle(&mut self, command: Command) -> Reply {
        let name = command.name();
        match self.dispatch(command) {
            Ok(value) => Reply::Ok(value),
            Err(message) => {
                debug!(command = name, %message, "simulator rejected command");
                Reply::Err(message)
            }
        }
    }

    fn dispatch(&mut self, command: Command) -> Outcome {
        match command {
            Command::SetObjective(index) => {
                check_slot("objective index", index, OBJECTIVE_SLOTS)?;
                self.objective = index;
                done()
            }
            Command::MoveXyTo { x, y } => self.move_to(x, y, self.z_um),
            Command::MoveXyBy { dx, dy } => self.move_to(self.x_mm + dx, self.y_mm + dy, self.z_um),
            Command::MoveZTo(z) => self.move_to(self.x_mm, self.y_mm, z),
            Command::MoveZBy(dz) => self.move_to(self.x_mm, self.y_mm, self.z_um + dz),
            Command::MoveXyzTo { x, y, z } => self.move_to(x, y, z),
            Command::SetLightSource(light) => {
                check_light(&light)?;
                self.light = Some(light);
                done()
            }
            Command::SetFluoChannel(light) => {
                if matches!(light.light_source, LightSource::Fluo(leds) if leds.is_empty()) {
                    return Err("no fluorescence LED selected".to_string());
                }
                check_light(&light)?;
                self.light = Some(light);
                done()
            }
            Command::SetCamera(roi) => {
                check_camera(&roi)?;
                self.camera = roi;
                done()
            }
            Command::ResetCamera => {
                self.camera = CameraRoi::full_frame();
                done()
            }
            Command::RunSoftwareAutofocus(af) => self.software_autofocus(&af),
            Command::RunHardwareAutofocus {
                objective,
                detection_filter,
                z_start,
            } => self.hardware_autofocus(objective, detection_filter, z_start),
            Command::SetMetadataWellId(well_id) => {
                if !naming::is_valid_well_id(&well_id) {
                    return Err(format!(
                        "well ID '{well_id}' must be a letter followed by 3 digits"
                    ));
                }
                self.metadata.well_id = well_id;
                done()
            }
            Command::SetMetadataSubposition(subposition) => {
                check_positive("subposition", subposition)?;
                self.metadata.subposition = subposition;
                done()
            }
            Command::SetMetadataTimepoint(timepoint) => {
                check_positive("timepoint", timepoint)?;
                self.metadata.timepoint = timepoint;
                done()
            }
            Command::SetDefaultProjectFolder(path) => {
                if path.trim().is_empty() {
                    return Err("project folder must not be empty".to_string());
                }
                self.project_folder = path;
                done()
            }
            Command::SetPlateId(plate_id) => {
                if plate_id.trim().is_empty() {
                    return Err("plate ID must not be empty".to_string());
                }
                self.plate_id = plate_id;
                done()
            }
            Command::SetMode(Mode::Script) => {
                self.enter_script_mode();
                done()
            }
            Command::SetMode(Mode::Live) => {
                self.enter_live_mode();
                done()
            }
            Command::Acquire(acquisition) => self.acquire(acquisition),
            Command::CloseConnection => {
                self.enter_live_mode();
                self.closed_sessions += 1;
                done()
            }
            Command::GetMode => value(self.mode),
            Command::GetObjective => value(self.objective),
            Command::GetPositionX => value(format!("{:.3}", self.x_mm)),
            Command::GetPositionY => value(format!("{:.3}", self.y_mm)),
            Command::GetPositionZ => value(format!("{:.1}", self.z_um)),
            Command::GetProjectFolder => value(&self.project_folder),
            Command::GetPlateId => value(&self.plate_id),
        }
    }

    fn move_to(&mut self, x: f64, y: f64, z: f64) -> Outcome {
        check_travel("X", x, X_TRAVEL_MM, "mm")?;
        check_travel("Y", y, Y_TRAVEL_MM, "mm")?;
        check_travel("Z", z, Z_TRAVEL_UM, "µm")?;
        self.x_mm = x;
        self.y_mm = y;
        self.z_um = z;
        done()
    }

    fn enter_script_mode(&mut self) {
        if self.mode == Mode::Live {
            self.mode = Mode::Script;
            self.session_start = Some(Local::now().naive_local());
        }
    }

    fn enter_live_mode(&mut self) {
        self.mode = Mode::Live;
        self.session_start = None;
    }

    /// Run `f` in script mode, reverting to live afterwards if the device was live.
    fn in_script_session<T>(&mut self, f: impl FnOnce(&mut Self) -> T) -> T {
        let was_live = self.mode == Mode::Live;
        self.enter_script_mode();
        let result = f(self);
        if was_live {
            self.enter_live_mode();
        }
        result
    }

    fn software_autofocus(&mut self, af: &AutofocusSettings) -> Outcome {
        check_slot("detection filter", af.detection_filter, FILTER_SLOTS)?;
        check_intensity(af.intensity)?;
        check_exposure(af.exposure_ms)?;
        check_stack(&af.stack)?;

        let focus = self.focus_z_um;
        let best = af
            .stack
            .slice_positions()
            .into_iter()
            .min_by(|a, b| (a - focus).abs().total_cmp(&(b - focus).abs()))
            .ok_or_else(|| "empty focus stack".to_string())?;
        check_travel("Z", best, Z_TRAVEL_UM, "µm")?;

        self.in_script_session(|im| im.z_um = best);
        value(format!("{best:.1}"))
    }

    fn hardware_autofocus(&mut self, objective: u8, detection_filter: u8, z_start: f64) -> Outcome {
        check_slot("objective index", objective, OBJECTIVE_SLOTS)?;
        check_slot("detection filter", detection_filter, FILTER_SLOTS)?;
        check_travel("Z", z_start, Z_TRAVEL_UM, "µm")?;

        let focus = self.focus_z_um;
        if (focus - z_start).abs() > self.hardware_af_range_um {
            return Err(format!(
                "focus not found within ±{:.1} µm of {z_start:.1} µm",
                self.hardware_af_range_um
            ));
        }

        self.in_script_session(|im| {
            im.objective = objective;
            im.z_um = focus;
        });
        value(format!("{focus:.1}"))
    }

    fn acquire(&mut self, acquisition: Acquisition) -> Outcome {
        check_light(&acquisition.light)?;
        check_stack(&acquisition.stack)?;
        for z in acquisition.stack.slice_positions() {
            check_travel("Z", z, Z_TRAVEL_UM, "µm")?;
        }

        let requested_in = self.mode;
        let record = self.in_script_session(|im| {
            let directory = match &acquisition.save_directory {
                Some(dir) => dir.clone(),
                None => {
                    let start = im
                        .session_start
                        .unwrap_or_else(|| Local::now().naive_local());
                    Path::new(&im.project_folder)
                        .join(naming::plate_directory(start, &im.plate_id))
                        .display()
                        .to_string()
                }
            };
            let files = acquisition
                .stack
                .slice_positions()
                .into_iter()
                .zip(1u32..)
                .map(|(z, slice)| {
                    naming::image_file_name(&im.metadata, acquisition.light.channel, slice, z)
                })
                .collect();
            AcquisitionRecord {
                acquisition,
                directory,
                files,
                requested_in,
                objective: im.objective,
                camera: im.camera,
            }
        });

        let directory = record.directory.clone();
        if self.acquisitions.len() == ACQUISITION_HISTORY {
            self.acquisitions.remove(0);
        }
        self.acquisitions.push(record);
        value(directory)
    }
}

fn done() -> Outcome {
    Ok(None)
}

fn value(v: impl ToString) -> Outcome {
    Ok(Some(v.to_string()))
}

fn check_slot(what: &str, slot: u8, range: std::ops::RangeInclusive<u8>) -> Result<(), String> {
    if range.contains(&slot) {
        Ok(())
    } else {
        Err(format!(
            "{what} {slot} out of range {}..={}",
            range.start(),
            range.end()
        ))
    }
}

fn check_travel(
    axis: &str,
    target: f64,
    range: std::ops::RangeInclusive<f64>,
    unit: &str,
) -> Result<(), String> {
    if target.is_finite() && range.contains(&target) {
        Ok(())
    } else {
        Err(format!(
            "{axis} target {target} {unit} outside travel range {}..={} {unit}",
            range.start(),
            range.end()
        ))
    }
}

fn check_positive(what: &str, n: u32) -> Result<(), String> {
    if n >= 1 {
        Ok(())
    } else {
        Err(format!("{what} must be at least 1"))
    }
}

fn check_intensity(intensity: u8) -> Result<(), String> {
    if intensity <= 100 {
        Ok(())
    } else {
        Err(format!("intensity {intensity}% above 100%"))
    }
}

fn check_exposure(exposure_ms: u32) -> Result<(), String> {
    if exposure_ms > 0 {
        Ok(())
    } else {
        Err("exposure must be greater than 0 ms".to_string())
    }
}

fn check_light(light: &LightSettings) -> Result<(), String> {
    check_slot("detection filter", light.detection_filter, FILTER_SLOTS)?;
    check_intensity(light.intensity)?;
    check_exposure(light.exposure_ms)
}

fn check_stack(stack: &StackSettings) -> Result<(), String> {
    if stack.n_slices == 0 {
        return Err("number of slices must be at least 1".to_string());
    }
    if stack.n_slices > MAX_SLICES {
        return Err(format!(
            "number of slices {} exceeds the maximum of {MAX_SLICES}",
            stack.n_slices
        ));
    }
    if stack.n_slices > 1 && (stack.z_step.is_nan() || stack.z_step <= 0.0) {
        return Err("z step must be greater than 0 for more than one slice".to_string());
    }
    Ok(())
}

fn check_camera(roi: &CameraRoi) -> Result<(), String> {
    if ![1, 2, 4].contains(&roi.binning) {
        return Err(format!("binning {} not in 1, 2, 4", roi.binning));
    }
    if roi.width == 0 || roi.height == 0 {
        return Err("ROI width and height must be greater than 0".to_string());
    }
    if roi.x.saturating_add(roi.width) > CameraRoi::SENSOR_WIDTH
        || roi.y.saturating_add(roi.height) > CameraRoi::SENSOR_HEIGHT
    {
        return Err(format!(
            "ROI exceeds the {}x{} sensor",
            CameraRoi::SENSOR_WIDTH,
            CameraRoi::SENSOR_HEIGHT
        ));
    }
    Ok(())
}

// =============================================================================
// TCP server
// =============================================================================

/// TCP front-end serving a [`SimulatedMachine`].
///
/// Connections are served concurrently but commands execute one at a time
/// against the shared state, like on the real device.
pub struct SimulatorServer {
    listener: TcpListener,
    state: Arc<Mutex<SimulatedMachine>>,
    latency: Duration,
}

impl SimulatorServer {
    /// Bind the listener. Use port 0 for an ephemeral port.
    pub async fn bind(addr: &str, machine: SimulatedMachine) -> ImResult<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self {
            listener,
            state: Arc::new(Mutex::new(machine)),
            latency: Duration::ZERO,
        })
    }

    /// Delay every command by `latency`.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Address the listener is bound to.
    pub fn local_addr(&self) -> ImResult<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Shared state, for inspection by tests and demos.
    pub fn state(&self) -> Arc<Mutex<SimulatedMachine>> {
        Arc::clone(&self.state)
    }

    /// Accept connections until the task is dropped or the listener fails.
    pub async fn run(self) -> ImResult<()> {
        info!(addr = %self.listener.local_addr()?, "simulated Imaging Machine listening");
        loop {
            let (stream, peer) = self.listener.accept().await?;
            debug!(%peer, "client connected");
            let state = Arc::clone(&self.state);
            let latency = self.latency;
            tokio::spawn(async move {
                if let Err(e) = serve_connection(stream, state, latency).await {
                    warn!(%peer, error = %e, "connection ended with error");
                }
                debug!(%peer, "client disconnected");
            });
        }
    }

    /// Run the accept loop on a background task.
    pub fn spawn(self) -> JoinHandle<ImResult<()>> {
        tokio::spawn(self.run())
    }
}

async fn serve_connection(
    stream: TcpStream,
    state: Arc<Mutex<SimulatedMachine>>,
    latency: Duration,
) -> ImResult<()> {
    let (reader, mut writer) = stream.into_split();
    let mut lines = BufReader::new(reader).lines();

    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }

        let (reply, close) = match Command::parse(&line) {
            Ok(command) => {
                let close = command == Command::CloseConnection;
                let mut machine = state.lock().await;
                if !latency.is_zero() {
                    tokio::time::sleep(latency).await;
                }
                (machine.handle(command), close)
            }
            Err(e) => (Reply::Err(e.to_string()), false),
        };

        writer.write_all(reply.encode().as_bytes()).await?;
        writer.write_all(b"\n").await?;
        writer.flush().await?;

        if close {
            break;
        }
    }
    Ok(())
}
