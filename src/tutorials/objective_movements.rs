//! Objective selection and stage movements.
//!
//! Selects the objective in slot 2 (usually the 4X) and moves it across the
//! plate: absolute and relative XY moves, absolute and relative Z moves, then
//! one combined XYZ move. XY are in mm (3 decimals), Z in µm (1 decimal).

use serde::Serialize;
use tracing::info;

use super::StagePosition;
use crate::error::ImResult;
use crate::machine::ImagingMachine;

/// Objective slot used by the tutorial.
pub const OBJECTIVE: u8 = 2;
/// Absolute XY target in mm.
pub const XY_TARGET_MM: (f64, f64) = (10.123, 30.456);
/// Relative XY move in mm.
pub const XY_STEP_MM: (f64, f64) = (10.2, -5.5);
/// Absolute Z target in µm.
pub const Z_TARGET_UM: f64 = 456.1;
/// Relative Z move in µm.
pub const Z_STEP_UM: f64 = 3.3;

/// Positions reached after each stage of the tutorial.
#[derive(Debug, Clone, Serialize)]
pub struct MovementReport {
    /// Objective selected.
    pub objective: u8,
    /// After the absolute then relative XY moves.
    pub after_xy: StagePosition,
    /// After the absolute then relative Z moves.
    pub after_z: StagePosition,
    /// After the combined XYZ move.
    pub final_position: StagePosition,
}

/// Run the objective movements tutorial.
pub async fn run(machine: &ImagingMachine) -> ImResult<MovementReport> {
    machine.set_objective(OBJECTIVE).await?;
    info!(objective = OBJECTIVE, "objective selected");

    let (x, y) = XY_TARGET_MM;
    machine.move_xy_to(x, y).await?;
    machine.move_xy_by(XY_STEP_MM.0, XY_STEP_MM.1).await?;
    let after_xy = StagePosition::read(machine).await?;
    info!(position = %after_xy, "XY moves done");

    machine.move_z_to(Z_TARGET_UM).await?;
    machine.move_z_by(Z_STEP_UM).await?;
    let after_z = StagePosition::read(machine).await?;
    info!(position = %after_z, "Z moves done");

    // Only the absolute version exists for XYZ
    machine.move_xyz_to(x, y, Z_TARGET_UM).await?;
    let final_position = StagePosition::read(machine).await?;
    info!(position = %final_position, "XYZ move done");

    Ok(MovementReport {
        objective: machine.get_objective().await?,
        after_xy,
        after_z,
        final_position,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConnectionSettings;
    use crate::hardware::MockAdapter;

    #[tokio::test]
    async fn test_command_sequence() {
        let mock = MockAdapter::new();
        let machine =
            ImagingMachine::with_adapter(Box::new(mock.clone()), &ConnectionSettings::default())
                .await
                .unwrap();

        // set objective, two XY moves
        for _ in 0..3 {
            mock.push_reply("OK");
        }
        for reply in ["OK 20.323", "OK 24.956", "OK 0.0"] {
            mock.push_reply(reply);
        }
        for _ in 0..2 {
            mock.push_reply("OK");
        }
        for reply in ["OK 20.323", "OK 24.956", "OK 459.4"] {
            mock.push_reply(reply);
        }
        mock.push_reply("OK");
        for reply in ["OK 10.123", "OK 30.456", "OK 456.1", "OK 2"] {
            mock.push_reply(reply);
        }

        let report = run(&machine).await.unwrap();
        assert_eq!(report.objective, 2);
        assert_eq!(report.after_xy.x_mm, 20.323);
        assert_eq!(report.after_z.z_um, 459.4);
        assert_eq!(report.final_position.z_um, 456.1);

        let moves: Vec<String> = mock
            .call_log()
            .into_iter()
            .filter(|line| !line.starts_with("Get"))
            .collect();
        assert_eq!(
            moves,
            vec![
                "SetObjective(2)",
                "MoveXYTo(10.123,30.456)",
                "MoveXYBy(10.200,-5.500)",
                "MoveZTo(456.1)",
                "MoveZBy(3.3)",
                "MoveXYZTo(10.123,30.456,456.1)",
            ]
        );
    }
}
