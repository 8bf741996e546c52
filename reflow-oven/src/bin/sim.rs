//! Simulated reflow oven for bench testing without hardware.
//!
//! Listens on `REFLOW_SIM_BIND` (default `0.0.0.0:8080`) and runs until
//! Ctrl-C.

use std::env;

use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use reflow_oven::simulator::{OvenSimulator, SimulatorConfig};
use reflow_oven::tracing::init_journald_or_stdout;
use reflow_oven::tracing::prelude::*;

const BIND_ENV: &str = "REFLOW_SIM_BIND";
const DEFAULT_BIND: &str = "0.0.0.0:8080";

#[tokio::main]
async fn main() -> Result<()> {
    init_journald_or_stdout();

    let bind = env::var(BIND_ENV).unwrap_or_else(|_| DEFAULT_BIND.to_string());
    let listener = TcpListener::bind(&bind)
        .await
        .with_context(|| format!("binding {bind}"))?;

    let simulator = OvenSimulator::new(SimulatorConfig::default());
    let shutdown = CancellationToken::new();

    let server = {
        let simulator = simulator.clone();
        let shutdown = shutdown.clone();
        tokio::spawn(async move { simulator.serve(listener, shutdown).await })
    };

    tokio::signal::ctrl_c()
        .await
        .context("waiting for Ctrl-C")?;
    info!("Shutting down");
    shutdown.cancel();
    server.await?;

    Ok(())
}
