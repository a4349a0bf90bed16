//! Software and hardware autofocus.
//!
//! Both autofocus commands work in live and script mode and block until the
//! device reports the focus Z. Software autofocus images a Z-stack with the
//! current objective and camera settings; hardware autofocus uses the
//! dedicated focus sensor, so only the objective, filter and start Z matter.

use serde::Serialize;
use tracing::info;

use crate::error::ImResult;
use crate::machine::ImagingMachine;
use crate::types::{AutofocusSettings, LightSource, StackSettings};

/// Objective used for hardware autofocus.
pub const HARDWARE_AF_OBJECTIVE: u8 = 1;
/// Detection filter used for hardware autofocus.
pub const HARDWARE_AF_FILTER: u8 = 1;
/// Start of the hardware autofocus search in µm.
pub const HARDWARE_AF_Z_START_UM: f64 = 18_500.0;

/// Software autofocus settings of the tutorial.
///
/// Brightfield, 11 slices 10 µm apart around Z=18000 µm: 5 slices above and
/// 5 below the center slice.
pub fn software_settings() -> AutofocusSettings {
    AutofocusSettings {
        light_source: LightSource::Brightfield,
        detection_filter: 2,
        intensity: 80,
        exposure_ms: 100,
        stack: StackSettings::new(18_000.0, 11, 10.0),
    }
}

/// Focus positions found by the tutorial.
#[derive(Debug, Clone, Serialize)]
pub struct AutofocusReport {
    /// Z range searched by software autofocus, in µm.
    pub software_search_range_um: f64,
    /// Software autofocus result in µm.
    pub software_z_um: f64,
    /// Hardware autofocus result in µm.
    pub hardware_z_um: f64,
}

/// Run the autofocus tutorial.
pub async fn run(machine: &ImagingMachine) -> ImResult<AutofocusReport> {
    let settings = software_settings();
    info!(
        search_range_um = settings.stack.search_range(),
        "starting software autofocus, focus value will be reported once the search is done"
    );
    let software_z_um = machine.run_software_autofocus(&settings).await?;
    info!("Z-Focus = {software_z_um} µm");

    info!("starting hardware autofocus, focus value will be reported once the search is done");
    let hardware_z_um = machine
        .run_hardware_autofocus(HARDWARE_AF_OBJECTIVE, HARDWARE_AF_FILTER, HARDWARE_AF_Z_START_UM)
        .await?;
    info!("Z-Focus = {hardware_z_um} µm");

    Ok(AutofocusReport {
        software_search_range_um: settings.stack.search_range(),
        software_z_um,
        hardware_z_um,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConnectionSettings;
    use crate::hardware::MockAdapter;

    #[test]
    fn test_search_range() {
        assert_eq!(software_settings().stack.search_range(), 100.0);
    }

    #[tokio::test]
    async fn test_focus_values_are_reported() {
        let mock = MockAdapter::new();
        let machine =
            ImagingMachine::with_adapter(Box::new(mock.clone()), &ConnectionSettings::default())
                .await
                .unwrap();
        mock.push_reply("OK 18040.0");
        mock.push_reply("OK 18042.3");

        let report = run(&machine).await.unwrap();
        assert_eq!(report.software_z_um, 18040.0);
        assert_eq!(report.hardware_z_um, 18042.3);
        assert_eq!(
            mock.call_log(),
            vec![
                r#"RunSoftwareAutoFocus("brightfield",2,80,100,18000.0,11,10.0)"#,
                "RunHardwareAutoFocus(1,1,18500.0)",
            ]
        );
    }
}
