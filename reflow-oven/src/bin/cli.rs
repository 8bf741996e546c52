//! Command-line interface for a networked reflow oven.
//!
//! Connects directly to the oven controller, runs one command and
//! disconnects. `monitor` keeps the session open until interrupted.

use std::env;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use tokio::time;
use tokio_stream::StreamExt;
use tokio_stream::wrappers::WatchStream;

use reflow_oven::client::OvenClient;
use reflow_oven::config::{ClientConfig, OvenAddress};
use reflow_oven::engine::SyncEngine;
use reflow_oven::tracing::init_journald_or_stdout;
use reflow_oven::types::{OvenState, ReflowProfile};

/// How long `status` waits for the first snapshot.
const FIRST_STATUS_TIMEOUT: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() -> Result<()> {
    init_journald_or_stdout();

    let args: Vec<String> = env::args().collect();

    if args.len() < 2 {
        usage();
        std::process::exit(1);
    }

    let command = &args[1];
    let profile_arg = || {
        args.get(2)
            .map(String::as_str)
            .context("missing <profile> argument")
    };

    match command.as_str() {
        "status" => cmd_status().await?,
        "monitor" => cmd_monitor().await?,
        "start" => cmd_start(profile_arg()?).await?,
        "send" => cmd_send(profile_arg()?).await?,
        "stop" => cmd_stop().await?,
        "profiles" => cmd_profiles(),
        _ => {
            eprintln!("Unknown command: {}", command);
            eprintln!("Run without arguments to see usage.");
            std::process::exit(1);
        }
    }

    Ok(())
}

fn usage() {
    eprintln!("Usage: reflow-cli <command>");
    eprintln!();
    eprintln!("Commands:");
    eprintln!("  status             Show one status snapshot");
    eprintln!("  monitor            Follow status until Ctrl-C");
    eprintln!("  start <profile>    Upload a profile and start the run");
    eprintln!("  send <profile>     Upload a profile without starting");
    eprintln!("  stop               Abort the current run");
    eprintln!("  profiles           List built-in profiles");
    eprintln!();
    eprintln!("<profile> is a built-in profile name or a path to a JSON file.");
    eprintln!();
    eprintln!("Environment:");
    eprintln!("  REFLOW_OVEN_ADDR           Oven address (default: 192.168.1.100:8080)");
    eprintln!("  REFLOW_CONNECT_TIMEOUT_MS  Connection timeout (default: 5000)");
    eprintln!("  REFLOW_POLL_INTERVAL_MS    Status poll interval (default: 1000)");
    eprintln!("  RUST_LOG                   Log filter (default: info)");
}

/// Connect an engine to the configured oven.
async fn connect() -> Result<SyncEngine<OvenClient>> {
    let addr = OvenAddress::from_env()?;
    let config = ClientConfig::from_env();
    let history_capacity = config.history_capacity;
    let engine = SyncEngine::with_history_capacity(OvenClient::new(config), history_capacity);

    if !engine.connect(&addr.host, addr.port).await {
        bail!("could not connect to oven at {addr}");
    }
    Ok(engine)
}

fn print_state(state: &OvenState) {
    println!(
        "{:>6.1} °C  target {:>6.1} °C  {:<10} {:>5} s",
        state.current_temperature, state.target_temperature, state.stage, state.time_elapsed
    );
}

/// Print the first snapshot the oven reports.
async fn cmd_status() -> Result<()> {
    let engine = connect().await?;
    let mut states = engine.subscribe_oven_state();

    let received = time::timeout(FIRST_STATUS_TIMEOUT, states.changed()).await;
    let state = states.borrow_and_update().clone();
    engine.disconnect().await;

    match received {
        Ok(Ok(())) => {
            print_state(&state);
            Ok(())
        }
        _ => bail!("oven did not report status"),
    }
}

/// Print every snapshot until Ctrl-C or the connection drops.
async fn cmd_monitor() -> Result<()> {
    let engine = connect().await?;
    let mut states = WatchStream::from_changes(engine.subscribe_oven_state());
    let mut connected = engine.subscribe_connected();

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                eprintln!("Interrupted");
                break;
            }
            _ = connected.wait_for(|c| !*c) => {
                eprintln!("Connection to oven lost");
                break;
            }
            Some(state) = states.next() => print_state(&state),
        }
    }

    engine.disconnect().await;
    Ok(())
}

async fn cmd_start(profile_arg: &str) -> Result<()> {
    let profile = ReflowProfile::resolve(profile_arg)?;
    let engine = connect().await?;

    let result = engine.run_profile(&profile).await;
    engine.disconnect().await;
    result.context("starting run")?;

    println!(
        "Started {} ({} stages, {} s hold)",
        profile.name,
        profile.stages.len(),
        profile.total_hold_secs()
    );
    Ok(())
}

async fn cmd_send(profile_arg: &str) -> Result<()> {
    let profile = ReflowProfile::resolve(profile_arg)?;
    let engine = connect().await?;

    let result = engine.send_profile(&profile).await;
    engine.disconnect().await;
    result.context("sending PROFILE")?;

    println!("Uploaded {}", profile.name);
    Ok(())
}

async fn cmd_stop() -> Result<()> {
    let engine = connect().await?;

    let result = engine.stop_oven().await;
    engine.disconnect().await;
    result.context("sending STOP")?;

    println!("Stop requested");
    Ok(())
}

fn cmd_profiles() {
    for profile in ReflowProfile::builtin() {
        println!("{}", profile.name);
        for stage in &profile.stages {
            println!(
                "  - {:<8} {:>6.1} °C for {} s",
                stage.name, stage.target_temperature, stage.duration
            );
        }
    }
}
