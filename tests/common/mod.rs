#![allow(dead_code)]

use std::sync::Arc;

use im_control::config::{ConnectionSettings, SimulatorSettings};
use im_control::simulator::{SimulatedMachine, SimulatorServer};
use im_control::ImagingMachine;
use tokio::sync::Mutex;

/// Simulator on an ephemeral port and a client session connected to it.
pub struct SimulatedSession {
    pub machine: ImagingMachine,
    pub state: Arc<Mutex<SimulatedMachine>>,
    pub settings: ConnectionSettings,
}

pub async fn start_simulator() -> SimulatedSession {
    let server = SimulatorServer::bind(
        "127.0.0.1:0",
        SimulatedMachine::new(&SimulatorSettings::default()),
    )
    .await
    .expect("bind simulator");
    let addr = server.local_addr().expect("simulator address");
    let state = server.state();
    let _task = server.spawn();

    let settings = ConnectionSettings {
        host: addr.ip().to_string(),
        port: addr.port(),
        ..ConnectionSettings::default()
    };
    let machine = ImagingMachine::connect(&settings)
        .await
        .expect("connect to simulator");
    SimulatedSession {
        machine,
        state,
        settings,
    }
}
