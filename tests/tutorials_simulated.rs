//! The three tutorials run end to end against the simulated Imaging Machine.

mod common;

use im_control::tutorials;
use im_control::types::{LightSource, Mode};

#[tokio::test]
async fn test_objective_movements_tutorial() {
    let session = common::start_simulator().await;
    let report = tutorials::objective_movements(&session.machine)
        .await
        .unwrap();

    assert_eq!(report.objective, 2);
    assert!((report.after_xy.x_mm - 20.323).abs() < 1e-9);
    assert!((report.after_xy.y_mm - 24.956).abs() < 1e-9);
    assert!((report.after_z.z_um - 459.4).abs() < 1e-9);
    assert_eq!(report.final_position.x_mm, 10.123);
    assert_eq!(report.final_position.y_mm, 30.456);
    assert_eq!(report.final_position.z_um, 456.1);

    session.machine.close_connection().await.unwrap();
    assert_eq!(session.state.lock().await.closed_sessions(), 1);
}

#[tokio::test]
async fn test_autofocus_tutorial() {
    let session = common::start_simulator().await;
    let report = tutorials::autofocus(&session.machine).await.unwrap();

    // Focus plane at 18042 µm: nearest slice of 17950..=18050 by 10
    assert_eq!(report.software_search_range_um, 100.0);
    assert_eq!(report.software_z_um, 18040.0);
    assert_eq!(report.hardware_z_um, 18042.0);

    let state = session.state.lock().await;
    // Autofocus from live mode returns to live
    assert_eq!(state.mode(), Mode::Live);
    assert_eq!(state.objective(), 1);
    assert_eq!(state.position().2, 18042.0);
}

#[tokio::test]
async fn test_acquire_tutorial() {
    let session = common::start_simulator().await;
    let report = tutorials::acquire(&session.machine, "/data/MyDataset")
        .await
        .unwrap();

    assert_eq!(report.explicit_directory, "/data/MyDataset");
    assert!(report
        .brightfield_directory
        .starts_with("/data/MyDataset/"));
    assert!(report.brightfield_directory.ends_with("_test"));
    // Both plate acquisitions share the script session timestamp
    assert_eq!(report.brightfield_directory, report.fluo_directory);

    {
        let state = session.state.lock().await;
        assert_eq!(state.mode(), Mode::Script);
        let records = state.acquisitions();
        assert_eq!(records.len(), 3);

        assert_eq!(records[0].requested_in, Mode::Live);
        assert_eq!(records[0].files.len(), 20);
        assert_eq!(
            records[0].files[0],
            "C002--PO01--LO001--CO1--SL001--Z0179050.tif"
        );

        assert_eq!(records[1].requested_in, Mode::Script);
        assert!(records[1].files[0].starts_with("A001--PO01--LO001--CO1--SL001"));

        let fluo = &records[2];
        assert_eq!(fluo.acquisition.light.channel, 2);
        assert!(matches!(
            fluo.acquisition.light.light_source,
            LightSource::Fluo(leds) if leds.to_string() == "100000"
        ));
        assert!(fluo.acquisition.light.light_constant_on);
        assert!(fluo.acquisition.save_directory.is_none());
        assert!(fluo.files[19].starts_with("A001--PO01--LO001--CO2--SL020"));
    }

    // Closing the connection reverts to live mode
    session.machine.close_connection().await.unwrap();
    assert_eq!(session.state.lock().await.mode(), Mode::Live);
}
