//! Z-stack acquisition with metadata.
//!
//! Acquire always runs in script mode. From live mode the device enters
//! script mode, acquires and returns to live, which takes a few seconds, so
//! successive acquisitions should switch to script mode once beforehand.
//!
//! Two ways of choosing where images land are shown:
//!
//! 1. an explicit save directory passed with the acquisition
//! 2. the default project folder plus a plate ID, giving
//!    `<project>/<timestamp>_<plate>` where the timestamp is taken when the
//!    device enters script mode, so every acquisition of the session shares it

use serde::Serialize;
use tracing::info;

use crate::error::ImResult;
use crate::machine::ImagingMachine;
use crate::types::{Acquisition, FluoChannels, LightSettings, LightSource, Mode, StackSettings};

/// Dataset directory used when none is given on the command line.
pub const DEFAULT_DATASET_DIR: &str = r"C:\Users\Default\Desktop\MyDataset";
/// Plate ID of the project-folder acquisitions.
pub const PLATE_ID: &str = "test";

const DETECTION_FILTER: u8 = 2;

fn stack() -> StackSettings {
    StackSettings::new(18_000.0, 20, 10.0)
}

/// Directories reported by the device for each acquisition.
#[derive(Debug, Clone, Serialize)]
pub struct AcquireReport {
    /// Brightfield stack saved in the explicit directory.
    pub explicit_directory: String,
    /// Brightfield stack saved under the plate directory.
    pub brightfield_directory: String,
    /// Fluorescence stack saved under the plate directory.
    pub fluo_directory: String,
}

/// Run the acquisition tutorial, saving under `dataset_dir`.
pub async fn run(machine: &ImagingMachine, dataset_dir: &str) -> ImResult<AcquireReport> {
    machine.set_objective(1).await?;
    // Full frame, no binning
    machine.reset_camera().await?;

    machine.set_metadata_well_id("C002").await?;
    machine.set_metadata_subposition(1).await?;
    machine.set_metadata_timepoint(1).await?;

    // Explicit save directory, created by the device if missing
    let light = LightSettings::new(1, LightSource::Brightfield, DETECTION_FILTER, 50, 100);
    let explicit = Acquisition::builder(light, stack())
        .light_constant_on(false)
        .save_directory(dataset_dir)
        .build();
    let explicit_directory = machine.acquire(&explicit).await?;
    info!(directory = %explicit_directory, "acquired into explicit directory");

    // Default project folder and plate ID
    machine.set_default_project_folder(dataset_dir).await?;
    machine.set_plate_id(PLATE_ID).await?;
    machine.set_mode(Mode::Script).await?;

    machine.set_metadata_well_id("A001").await?;

    // Channel number sets the CO tag of the file names
    let brightfield = LightSettings::new(1, LightSource::Brightfield, DETECTION_FILTER, 50, 100);
    let brightfield_directory = machine
        .acquire(&Acquisition::builder(brightfield, stack()).build())
        .await?;
    info!(directory = %brightfield_directory, "acquired brightfield channel");

    // "100000": first fluorescence LED, kept on instead of blinking
    let first_led = FluoChannels::from_flags([true, false, false, false, false, false]);
    let fluo = LightSettings::new(2, LightSource::Fluo(first_led), DETECTION_FILTER, 80, 150);
    let fluo_directory = machine
        .acquire(
            &Acquisition::builder(fluo, stack())
                .light_constant_on(true)
                .build(),
        )
        .await?;
    info!(directory = %fluo_directory, "acquired fluo channel");

    Ok(AcquireReport {
        explicit_directory,
        brightfield_directory,
        fluo_directory,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConnectionSettings;
    use crate::hardware::MockAdapter;

    #[tokio::test]
    async fn test_acquire_sequence() {
        let mock = MockAdapter::new();
        let machine =
            ImagingMachine::with_adapter(Box::new(mock.clone()), &ConnectionSettings::default())
                .await
                .unwrap();
        for reply in ["OK", "OK", "OK", "OK", "OK", r"OK D:\data"] {
            mock.push_reply(reply);
        }
        for reply in ["OK", "OK", "OK", "OK", r"OK D:\data\20240307_090501_test"] {
            mock.push_reply(reply);
        }
        mock.push_reply(r"OK D:\data\20240307_090501_test");

        let report = run(&machine, r"D:\data").await.unwrap();
        assert_eq!(report.explicit_directory, r"D:\data");
        assert_eq!(report.brightfield_directory, report.fluo_directory);

        let log = mock.call_log();
        assert_eq!(log.len(), 12);
        assert_eq!(log[0], "SetObjective(1)");
        assert_eq!(log[1], "ResetCamera()");
        assert_eq!(log[2], r#"SetMetadataWellId("C002")"#);
        assert_eq!(
            log[5],
            r#"Acquire(1,"brightfield",2,50,100,18000.0,20,10.0,false,"D:\\data")"#
        );
        assert_eq!(log[8], r#"SetMode("script")"#);
        assert_eq!(
            log[10],
            r#"Acquire(1,"brightfield",2,50,100,18000.0,20,10.0,false,"")"#
        );
        assert_eq!(
            log[11],
            r#"Acquire(2,"100000",2,80,150,18000.0,20,10.0,true,"")"#
        );
    }
}
