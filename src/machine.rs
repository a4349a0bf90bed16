//! Imaging Machine remote-control client.
//!
//! [`ImagingMachine`] is the connection handle: one async method per remote
//! command, one request in flight at a time, explicit
//! [`close_connection`](ImagingMachine::close_connection) at the end.
//!
//! # Example Usage
//!
//! ```no_run
//! use im_control::config::ConnectionSettings;
//! use im_control::ImagingMachine;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let im = ImagingMachine::connect(&ConnectionSettings::default()).await?;
//!
//!     im.set_objective(2).await?;
//!     im.move_xy_to(10.123, 30.456).await?;
//!     im.move_z_to(456.1).await?;
//!
//!     im.close_connection().await?;
//!     Ok(())
//! }
//! ```

use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::config::ConnectionSettings;
use crate::error::{ImError, ImResult};
use crate::hardware::{HardwareAdapter, TcpAdapter};
use crate::protocol::{Command, ProtocolError, Reply};
use crate::types::{
    Acquisition, AutofocusSettings, CameraRoi, FluoChannels, LightSettings, LightSource, Mode,
};

/// Session with one Imaging Machine
///
/// All methods take `&self`; requests are serialised internally, so the handle
/// can be shared behind an `Arc`. Arguments are not range-checked here; the
/// device rejects invalid values and the rejection surfaces as
/// [`ImError::Device`].
pub struct ImagingMachine {
    /// Transport, locked for the duration of one request/reply
    adapter: Mutex<Box<dyn HardwareAdapter>>,
    /// Reply timeout for ordinary commands
    read_timeout: Duration,
    /// Reply timeout for autofocus and acquire
    long_read_timeout: Duration,
    /// Set once `close_connection` has run
    closed: AtomicBool,
}

impl ImagingMachine {
    /// Open a TCP session to the machine described by `settings`.
    pub async fn connect(settings: &ConnectionSettings) -> ImResult<Self> {
        let adapter = TcpAdapter::from_settings(settings);
        Self::with_adapter(Box::new(adapter), settings).await
    }

    /// Open a session over an arbitrary adapter, connecting it if needed.
    pub async fn with_adapter(
        mut adapter: Box<dyn HardwareAdapter>,
        settings: &ConnectionSettings,
    ) -> ImResult<Self> {
        if !adapter.is_connected() {
            adapter.connect().await?;
        }
        info!(adapter = adapter.name(), "Imaging Machine session opened");
        Ok(Self {
            adapter: Mutex::new(adapter),
            read_timeout: settings.read_timeout(),
            long_read_timeout: settings.long_read_timeout(),
            closed: AtomicBool::new(false),
        })
    }

    /// Whether `close_connection` has been called.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    async fn round_trip(
        &self,
        adapter: &mut dyn HardwareAdapter,
        command: &Command,
    ) -> ImResult<Option<String>> {
        let name = command.name();
        let line = command.encode();
        let timeout = if command.is_long_running() {
            self.long_read_timeout
        } else {
            self.read_timeout
        };

        debug!(command = name, %line, "request");
        let reply = adapter.query(&line, timeout).await?;

        match Reply::parse(&reply)? {
            Reply::Ok(value) => {
                debug!(command = name, value = value.as_deref().unwrap_or(""), "reply");
                Ok(value)
            }
            Reply::Err(message) => {
                warn!(command = name, %message, "device rejected command");
                Err(ImError::Device {
                    command: name,
                    message,
                })
            }
        }
    }

    async fn execute(&self, command: Command) -> ImResult<Option<String>> {
        let mut adapter = self.adapter.lock().await;
        // Checked under the lock: a call queued behind close_connection must not run
        if self.is_closed() {
            return Err(ImError::NotConnected);
        }
        self.round_trip(adapter.as_mut(), &command).await
    }

    async fn execute_unit(&self, command: Command) -> ImResult<()> {
        self.execute(command).await.map(|_| ())
    }

    async fn execute_value<T: FromStr>(&self, command: Command) -> ImResult<T> {
        let name = command.name();
        let value = self
            .execute(command)
            .await?
            .ok_or(ImError::MissingValue(name))?;
        value.parse().map_err(|_| {
            ProtocolError::InvalidValue(format!("{name} returned '{value}'")).into()
        })
    }

    // -------------------------------------------------------------------------
    // Objective and stage
    // -------------------------------------------------------------------------

    /// Select the objective mounted at slot `index` (1-4, slot 2 is usually the 4X).
    pub async fn set_objective(&self, index: u8) -> ImResult<()> {
        self.execute_unit(Command::SetObjective(index)).await
    }

    /// Move to absolute X/Y in mm (3 decimals are sent).
    pub async fn move_xy_to(&self, x: f64, y: f64) -> ImResult<()> {
        self.execute_unit(Command::MoveXyTo { x, y }).await
    }

    /// Move by dX/dY in mm.
    pub async fn move_xy_by(&self, dx: f64, dy: f64) -> ImResult<()> {
        self.execute_unit(Command::MoveXyBy { dx, dy }).await
    }

    /// Move to absolute Z in µm (1 decimal is sent).
    pub async fn move_z_to(&self, z: f64) -> ImResult<()> {
        self.execute_unit(Command::MoveZTo(z)).await
    }

    /// Move by dZ in µm.
    pub async fn move_z_by(&self, dz: f64) -> ImResult<()> {
        self.execute_unit(Command::MoveZBy(dz)).await
    }

    /// Move X, Y and Z at once. There is no relative variant.
    pub async fn move_xyz_to(&self, x: f64, y: f64, z: f64) -> ImResult<()> {
        self.execute_unit(Command::MoveXyzTo { x, y, z }).await
    }

    // -------------------------------------------------------------------------
    // Imaging configuration
    // -------------------------------------------------------------------------

    /// Switch on a light source (brightfield or fluorescence) with its detection settings.
    pub async fn set_light_source(&self, light: &LightSettings) -> ImResult<()> {
        self.execute_unit(Command::SetLightSource(*light)).await
    }

    /// Switch on the fluorescence LEDs in `leds`.
    pub async fn set_fluo_channel(
        &self,
        channel: u32,
        leds: FluoChannels,
        detection_filter: u8,
        intensity: u8,
        exposure_ms: u32,
        light_constant_on: bool,
    ) -> ImResult<()> {
        let light = LightSettings::new(
            channel,
            LightSource::Fluo(leds),
            detection_filter,
            intensity,
            exposure_ms,
        )
        .with_light_constant_on(light_constant_on);
        self.execute_unit(Command::SetFluoChannel(light)).await
    }

    /// Restrict the camera to a region of interest and/or bin pixels.
    pub async fn set_camera(&self, roi: CameraRoi) -> ImResult<()> {
        self.execute_unit(Command::SetCamera(roi)).await
    }

    /// Restore the full sensor without binning.
    pub async fn reset_camera(&self) -> ImResult<()> {
        self.execute_unit(Command::ResetCamera).await
    }

    // -------------------------------------------------------------------------
    // Autofocus
    // -------------------------------------------------------------------------

    /// Image-based autofocus with the current objective and camera settings.
    ///
    /// Blocks until the device reports the focus Z in µm. The searched range
    /// is `(n_slices - 1) * z_step` around `z_center`.
    pub async fn run_software_autofocus(&self, settings: &AutofocusSettings) -> ImResult<f64> {
        info!(
            light_source = %settings.light_source,
            z_center = settings.stack.z_center,
            n_slices = settings.stack.n_slices,
            z_step = settings.stack.z_step,
            "starting software autofocus"
        );
        let z: f64 = self
            .execute_value(Command::RunSoftwareAutofocus(*settings))
            .await?;
        info!(z_focus = z, "software autofocus done");
        Ok(z)
    }

    /// Autofocus with the dedicated focus sensor, starting the search at `z_start` µm.
    pub async fn run_hardware_autofocus(
        &self,
        objective: u8,
        detection_filter: u8,
        z_start: f64,
    ) -> ImResult<f64> {
        info!(objective, detection_filter, z_start, "starting hardware autofocus");
        let z: f64 = self
            .execute_value(Command::RunHardwareAutofocus {
                objective,
                detection_filter,
                z_start,
            })
            .await?;
        info!(z_focus = z, "hardware autofocus done");
        Ok(z)
    }

    // -------------------------------------------------------------------------
    // Metadata, project and mode
    // -------------------------------------------------------------------------

    /// Well ID tag of the next acquisitions (`"C002"`: a letter and 3 digits).
    pub async fn set_metadata_well_id(&self, well_id: &str) -> ImResult<()> {
        self.execute_unit(Command::SetMetadataWellId(well_id.to_string()))
            .await
    }

    /// Subposition tag of the next acquisitions.
    pub async fn set_metadata_subposition(&self, subposition: u32) -> ImResult<()> {
        self.execute_unit(Command::SetMetadataSubposition(subposition))
            .await
    }

    /// Timepoint tag of the next acquisitions.
    pub async fn set_metadata_timepoint(&self, timepoint: u32) -> ImResult<()> {
        self.execute_unit(Command::SetMetadataTimepoint(timepoint)).await
    }

    /// Folder under which plate directories are created.
    pub async fn set_default_project_folder(&self, path: &str) -> ImResult<()> {
        self.execute_unit(Command::SetDefaultProjectFolder(path.to_string()))
            .await
    }

    /// Plate ID used in plate directory names.
    pub async fn set_plate_id(&self, plate_id: &str) -> ImResult<()> {
        self.execute_unit(Command::SetPlateId(plate_id.to_string()))
            .await
    }

    /// Switch the operating mode.
    ///
    /// Switching takes a few seconds on the device. Switch to
    /// [`Mode::Script`] once before a series of acquisitions, otherwise each
    /// acquire enters and leaves script mode on its own.
    pub async fn set_mode(&self, mode: Mode) -> ImResult<()> {
        self.execute_unit(Command::SetMode(mode)).await
    }

    // -------------------------------------------------------------------------
    // Acquisition
    // -------------------------------------------------------------------------

    /// Acquire a Z-stack and return the directory the images were saved to.
    ///
    /// The device switches to script mode for the acquisition and returns to
    /// live mode afterwards if it was live before.
    pub async fn acquire(&self, acquisition: &Acquisition) -> ImResult<String> {
        info!(
            channel = acquisition.light.channel,
            light_source = %acquisition.light.light_source,
            n_slices = acquisition.stack.n_slices,
            "acquiring"
        );
        let directory: String = self
            .execute_value(Command::Acquire(acquisition.clone()))
            .await?;
        info!(%directory, "acquisition saved");
        Ok(directory)
    }

    // -------------------------------------------------------------------------
    // Read-back
    // -------------------------------------------------------------------------

    /// Current operating mode.
    pub async fn get_mode(&self) -> ImResult<Mode> {
        self.execute_value(Command::GetMode).await
    }

    /// Selected objective slot.
    pub async fn get_objective(&self) -> ImResult<u8> {
        self.execute_value(Command::GetObjective).await
    }

    /// X position in mm.
    pub async fn get_position_x(&self) -> ImResult<f64> {
        self.execute_value(Command::GetPositionX).await
    }

    /// Y position in mm.
    pub async fn get_position_y(&self) -> ImResult<f64> {
        self.execute_value(Command::GetPositionY).await
    }

    /// Z position in µm.
    pub async fn get_position_z(&self) -> ImResult<f64> {
        self.execute_value(Command::GetPositionZ).await
    }

    /// Default project folder.
    pub async fn get_project_folder(&self) -> ImResult<String> {
        Ok(self
            .execute(Command::GetProjectFolder)
            .await?
            .unwrap_or_default())
    }

    /// Plate ID.
    pub async fn get_plate_id(&self) -> ImResult<String> {
        Ok(self.execute(Command::GetPlateId).await?.unwrap_or_default())
    }

    // -------------------------------------------------------------------------
    // Lifecycle
    // -------------------------------------------------------------------------

    /// End the session. The device returns to live mode.
    ///
    /// The transport is closed even if the device does not acknowledge.
    /// Closing twice is a no-op.
    pub async fn close_connection(&self) -> ImResult<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let mut adapter = self.adapter.lock().await;
        let acknowledged = self.round_trip(adapter.as_mut(), &Command::CloseConnection).await;
        adapter.disconnect().await?;
        info!("Imaging Machine session closed");
        acknowledged.map(|_| ())
    }
}

impl Drop for ImagingMachine {
    fn drop(&mut self) {
        if !self.is_closed() {
            warn!("ImagingMachine dropped without close_connection; device may stay in script mode");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::MockAdapter;
    use crate::types::StackSettings;
    use std::sync::Arc;
    use tracing_test::traced_test;

    async fn mock_machine() -> (ImagingMachine, MockAdapter) {
        let observer = MockAdapter::new();
        let im = ImagingMachine::with_adapter(
            Box::new(observer.clone()),
            &ConnectionSettings::default(),
        )
        .await
        .unwrap();
        (im, observer)
    }

    #[tokio::test]
    async fn test_movement_commands_on_the_wire() {
        let (im, mock) = mock_machine().await;

        im.set_objective(2).await.unwrap();
        im.move_xy_to(10.123, 30.456).await.unwrap();
        im.move_xy_by(10.2, -5.5).await.unwrap();
        im.move_z_to(456.1).await.unwrap();
        im.move_z_by(3.3).await.unwrap();
        im.move_xyz_to(10.123, 30.456, 456.1).await.unwrap();

        assert_eq!(
            mock.call_log(),
            vec![
                "SetObjective(2)",
                "MoveXYTo(10.123,30.456)",
                "MoveXYBy(10.200,-5.500)",
                "MoveZTo(456.1)",
                "MoveZBy(3.3)",
                "MoveXYZTo(10.123,30.456,456.1)",
            ]
        );
        im.close_connection().await.unwrap();
    }

    #[tokio::test]
    async fn test_light_and_camera_commands_on_the_wire() {
        let (im, mock) = mock_machine().await;

        let brightfield = LightSettings::new(1, LightSource::Brightfield, 2, 50, 100);
        im.set_light_source(&brightfield).await.unwrap();

        let fluo: FluoChannels = "100000".parse().unwrap();
        im.set_light_source(
            &LightSettings::new(2, LightSource::Fluo(fluo), 2, 80, 150)
                .with_light_constant_on(true),
        )
        .await
        .unwrap();

        let leds: FluoChannels = "010100".parse().unwrap();
        im.set_fluo_channel(3, leds, 1, 60, 200, false).await.unwrap();

        im.set_camera(CameraRoi {
            x: 512,
            y: 256,
            width: 1024,
            height: 768,
            binning: 2,
        })
        .await
        .unwrap();
        im.reset_camera().await.unwrap();

        assert_eq!(
            mock.call_log(),
            vec![
                r#"SetLightSource(1,"brightfield",2,50,100,false)"#,
                r#"SetLightSource(2,"100000",2,80,150,true)"#,
                r#"SetFluoChannel(3,"010100",1,60,200,false)"#,
                "SetCamera(512,256,1024,768,2)",
                "ResetCamera()",
            ]
        );
        im.close_connection().await.unwrap();
    }

    #[tokio::test]
    async fn test_software_autofocus_returns_focus() {
        let (im, mock) = mock_machine().await;
        mock.push_reply("OK 18010.0");

        let z = im
            .run_software_autofocus(&AutofocusSettings {
                light_source: LightSource::Brightfield,
                detection_filter: 2,
                intensity: 80,
                exposure_ms: 100,
                stack: StackSettings::new(18000.0, 11, 10.0),
            })
            .await
            .unwrap();

        assert_eq!(z, 18010.0);
        assert_eq!(
            mock.last_call().unwrap(),
            r#"RunSoftwareAutoFocus("brightfield",2,80,100,18000.0,11,10.0)"#
        );
        im.close_connection().await.unwrap();
    }

    #[tokio::test]
    async fn test_device_error_carries_command_name() {
        let (im, mock) = mock_machine().await;
        mock.push_reply("ERR objective index 7 out of range 1..=4");

        let err = im.set_objective(7).await.unwrap_err();
        match err {
            ImError::Device { command, message } => {
                assert_eq!(command, "SetObjective");
                assert!(message.contains("out of range"));
            }
            other => panic!("unexpected error: {other}"),
        }
        im.close_connection().await.unwrap();
    }

    #[tokio::test]
    async fn test_missing_and_malformed_values() {
        let (im, mock) = mock_machine().await;

        mock.push_reply("OK");
        assert!(matches!(
            im.run_hardware_autofocus(1, 1, 18500.0).await,
            Err(ImError::MissingValue("RunHardwareAutoFocus"))
        ));

        mock.push_reply("OK focused");
        assert!(matches!(
            im.run_hardware_autofocus(1, 1, 18500.0).await,
            Err(ImError::Protocol(ProtocolError::InvalidValue(_)))
        ));

        mock.push_reply("MAYBE");
        assert!(matches!(
            im.get_mode().await,
            Err(ImError::Protocol(ProtocolError::MalformedReply(_)))
        ));
        im.close_connection().await.unwrap();
    }

    #[tokio::test]
    async fn test_read_back_values() {
        let (im, mock) = mock_machine().await;
        mock.push_reply("OK script");
        mock.push_reply("OK 3");
        mock.push_reply("OK 20.323");
        mock.push_reply("OK C:\\data\\projects");

        assert_eq!(im.get_mode().await.unwrap(), Mode::Script);
        assert_eq!(im.get_objective().await.unwrap(), 3);
        assert_eq!(im.get_position_x().await.unwrap(), 20.323);
        assert_eq!(im.get_project_folder().await.unwrap(), "C:\\data\\projects");
        im.close_connection().await.unwrap();
    }

    #[tokio::test]
    async fn test_close_connection_is_final() {
        let (im, mock) = mock_machine().await;

        im.close_connection().await.unwrap();
        assert_eq!(mock.last_call().unwrap(), "CloseConnection()");
        assert!(!mock.is_connected());
        assert!(im.is_closed());

        assert!(matches!(im.reset_camera().await, Err(ImError::NotConnected)));
        // second close is a no-op
        im.close_connection().await.unwrap();
        assert_eq!(mock.call_log().len(), 1);
    }

    #[tokio::test]
    async fn test_call_queued_behind_close_reports_not_connected() {
        let (im, mock) = mock_machine().await;
        let im = Arc::new(im);
        mock.push_reply("OK live");
        mock.set_reply_delay(Duration::from_millis(100));

        // holds the transport while the other calls queue up
        let busy = tokio::spawn({
            let im = Arc::clone(&im);
            async move { im.get_mode().await }
        });
        tokio::time::sleep(Duration::from_millis(20)).await;

        let queued = tokio::spawn({
            let im = Arc::clone(&im);
            async move { im.reset_camera().await }
        });
        tokio::time::sleep(Duration::from_millis(20)).await;

        im.close_connection().await.unwrap();

        assert_eq!(busy.await.unwrap().unwrap(), Mode::Live);
        assert!(matches!(queued.await.unwrap(), Err(ImError::NotConnected)));
        assert_eq!(mock.call_log(), vec!["GetMode()", "CloseConnection()"]);
    }

    #[tokio::test]
    async fn test_close_disconnects_even_on_transport_error() {
        let (im, mock) = mock_machine().await;
        mock.inject_next_failure();

        assert!(matches!(
            im.close_connection().await,
            Err(ImError::Adapter(_))
        ));
        assert!(!mock.is_connected());
        assert!(im.is_closed());
    }

    #[tokio::test]
    #[traced_test]
    async fn test_commands_are_logged() {
        let (im, mock) = mock_machine().await;
        mock.push_reply("ERR well ID must be a letter followed by 3 digits");

        let _ = im.set_metadata_well_id("C2").await;
        assert!(logs_contain("SetMetadataWellId"));
        assert!(logs_contain("device rejected command"));
        im.close_connection().await.unwrap();
    }
}
