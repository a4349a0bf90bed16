//! `im_control`: run the Imaging Machine tutorials, Rhai scripts or a
//! simulated device from the command line.
//!
//! ```bash
//! im_control --host 192.168.1.20 objective-movements
//! im_control --simulated acquire --dataset-dir /tmp/MyDataset
//! im_control run-script scripts/autofocus.rhai
//! im_control simulate --bind 0.0.0.0:6260
//! im_control --host 192.168.1.20 print-config > im_control.toml
//! ```

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use im_control::config::Settings;
use im_control::error::ImResult;
use im_control::scripting::ScriptHost;
use im_control::simulator::{SimulatedMachine, SimulatorServer};
use im_control::{logging, tutorials, ImagingMachine};

#[derive(Parser, Debug)]
#[command(name = "im_control", version, about = "Imaging Machine remote control")]
struct Cli {
    /// Configuration file (default: im_control.toml if present)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(flatten)]
    target: TargetArgs,

    #[command(subcommand)]
    action: Action,
}

#[derive(Args, Debug)]
struct TargetArgs {
    /// Imaging Machine host, overrides the configuration
    #[arg(long, global = true)]
    host: Option<String>,

    /// Imaging Machine port, overrides the configuration
    #[arg(long, global = true)]
    port: Option<u16>,

    /// Run against an in-process simulated Imaging Machine
    #[arg(long, global = true)]
    simulated: bool,

    /// Print reports as JSON
    #[arg(long, global = true)]
    json: bool,
}

#[derive(Subcommand, Debug)]
enum Action {
    /// Select an objective and move it along X, Y and Z
    ObjectiveMovements,
    /// Run software then hardware autofocus
    Autofocus,
    /// Acquire Z-stacks into an explicit directory and a plate directory
    Acquire {
        /// Directory used both as explicit save directory and project folder
        #[arg(long, default_value = tutorials::DEFAULT_DATASET_DIR)]
        dataset_dir: String,
    },
    /// Run a Rhai script with the session bound to `im`
    RunScript {
        /// Path to the .rhai file
        path: PathBuf,
    },
    /// Print the effective configuration as TOML
    PrintConfig,
    /// Serve a simulated Imaging Machine
    Simulate {
        /// Listen address, overrides the configuration
        #[arg(long)]
        bind: Option<String>,
    },
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut settings = Settings::load(cli.config.as_deref()).context("loading configuration")?;
    if let Some(host) = cli.target.host.clone() {
        settings.connection.host = host;
    }
    if let Some(port) = cli.target.port {
        settings.connection.port = port;
    }
    settings.validate().context("validating configuration")?;
    logging::init(&settings.logging).context("initialising logging")?;

    let target = cli.target;
    match cli.action {
        Action::PrintConfig => print!("{}", settings.to_toml_string()?),
        Action::Simulate { bind } => {
            let addr = bind.unwrap_or_else(|| settings.simulator.bind.clone());
            let server = bind_simulator(&settings, &addr).await?;
            tokio::select! {
                result = server.run() => result.context("simulator stopped")?,
                _ = tokio::signal::ctrl_c() => info!("shutting down simulator"),
            }
        }
        Action::ObjectiveMovements => {
            let (machine, _simulator) = open_session(&mut settings, target.simulated).await?;
            let report = with_session(&machine, tutorials::objective_movements(&machine)).await?;
            if target.json {
                print_json(&report)?;
            } else {
                println!("Objective {} selected", report.objective);
                println!("After XY moves:  {}", report.after_xy);
                println!("After Z moves:   {}", report.after_z);
                println!("After XYZ move:  {}", report.final_position);
            }
        }
        Action::Autofocus => {
            let (machine, _simulator) = open_session(&mut settings, target.simulated).await?;
            let report = with_session(&machine, tutorials::autofocus(&machine)).await?;
            if target.json {
                print_json(&report)?;
            } else {
                println!(
                    "Software autofocus ({} µm search range): Z-Focus = {} µm",
                    report.software_search_range_um, report.software_z_um
                );
                println!("Hardware autofocus: Z-Focus = {} µm", report.hardware_z_um);
            }
        }
        Action::Acquire { dataset_dir } => {
            let (machine, _simulator) = open_session(&mut settings, target.simulated).await?;
            let report =
                with_session(&machine, tutorials::acquire(&machine, &dataset_dir)).await?;
            if target.json {
                print_json(&report)?;
            } else {
                println!("Explicit directory:   {}", report.explicit_directory);
                println!("Brightfield channel:  {}", report.brightfield_directory);
                println!("Fluo channel:         {}", report.fluo_directory);
            }
        }
        Action::RunScript { path } => {
            let (machine, _simulator) = open_session(&mut settings, target.simulated).await?;
            let host = ScriptHost::new(Handle::current(), settings.scripting.max_operations);
            let run = host.execute_file(&path, Arc::clone(&machine));
            let value = with_session(&machine, run)
                .await
                .with_context(|| format!("running {}", path.display()))?;
            if !value.is_unit() {
                println!("{value}");
            }
        }
    }

    Ok(())
}

async fn bind_simulator(settings: &Settings, addr: &str) -> Result<SimulatorServer> {
    let machine = SimulatedMachine::new(&settings.simulator);
    let server = SimulatorServer::bind(addr, machine)
        .await
        .with_context(|| format!("binding simulator to {addr}"))?;
    Ok(server.with_latency(settings.simulator.latency()))
}

/// Connect to the configured machine, or to a simulator spawned in-process.
///
/// The returned task handle keeps the simulator alive for the run.
async fn open_session(
    settings: &mut Settings,
    simulated: bool,
) -> Result<(Arc<ImagingMachine>, Option<JoinHandle<ImResult<()>>>)> {
    let simulator = if simulated {
        let server = bind_simulator(settings, "127.0.0.1:0").await?;
        let addr = server.local_addr()?;
        settings.connection.host = addr.ip().to_string();
        settings.connection.port = addr.port();
        Some(server.spawn())
    } else {
        None
    };

    let connection = &settings.connection;
    let machine = ImagingMachine::connect(connection)
        .await
        .with_context(|| {
            format!(
                "connecting to Imaging Machine at {}:{}",
                connection.host, connection.port
            )
        })?;
    Ok((Arc::new(machine), simulator))
}

/// Await `work`, then close the session whether or not it succeeded.
async fn with_session<T>(
    machine: &ImagingMachine,
    work: impl Future<Output = ImResult<T>>,
) -> Result<T> {
    let result = work.await;
    if let Err(e) = machine.close_connection().await {
        warn!(error = %e, "failed to close connection");
    }
    Ok(result?)
}

fn print_json<T: serde::Serialize>(report: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(report)?);
    Ok(())
}
