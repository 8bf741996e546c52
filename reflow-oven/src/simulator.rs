//! A software oven that speaks the device side of the line protocol.
//!
//! [`OvenModel`] is the thermal state machine, stepped once per simulated
//! second. [`OvenSimulator`] runs the clock and serves any number of TCP
//! clients against one shared model.
//!
//! ```text
//!  IDLE ──START──► HEATING ⇄ SOAKING ... ──► REFLOWING ──► COOLING ──► COMPLETE
//!                     │          │               │            ▲
//!                     └──────────┴─────STOP──────┴────────────┘
//! ```
//!
//! Every stage but the last ramps as `HEATING` and holds as `SOAKING`. The
//! final stage ramps and holds as `REFLOWING`. After it the oven cools to
//! ambient and reports `COMPLETE` until the next `START`.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use strum::Display;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinSet;
use tokio::time::{self, Instant};
use tokio_util::codec::{Framed, LinesCodec, LinesCodecError};
use tokio_util::sync::CancellationToken;

use crate::protocol::{self, Command, Setpoint};
use crate::tracing::prelude::*;
use crate::types::OvenState;

/// Room temperature the oven starts at and cools back to, °C.
pub const AMBIENT_C: f32 = 25.0;

const MAX_COMMAND_LENGTH: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum Phase {
    Idle,
    Heating,
    Soaking,
    Reflowing,
    Cooling,
    Complete,
}

impl Phase {
    pub fn is_running(self) -> bool {
        matches!(self, Phase::Heating | Phase::Soaking | Phase::Reflowing)
    }
}

#[derive(Debug, Clone)]
pub struct SimulatorConfig {
    /// °C gained per step while ramping up.
    pub heat_rate: f32,
    /// °C lost per step while cooling or ramping down.
    pub cool_rate: f32,
    pub ambient: f32,
    /// Wall-clock length of one step.
    pub step: Duration,
}

impl Default for SimulatorConfig {
    fn default() -> Self {
        Self {
            heat_rate: 1.0,
            cool_rate: 0.5,
            ambient: AMBIENT_C,
            step: Duration::from_secs(1),
        }
    }
}

/// Thermal state machine for one oven.
#[derive(Debug)]
pub struct OvenModel {
    config: SimulatorConfig,
    phase: Phase,
    temperature: f32,
    target: f32,

    /// Last profile uploaded with `PROFILE`.
    loaded: Vec<Setpoint>,
    /// Profile of the current run.
    running: Vec<Setpoint>,
    stage: usize,
    /// Steps left at the stage target; `None` while still ramping.
    hold_remaining: Option<u32>,
    elapsed: u64,
}

impl OvenModel {
    pub fn new(config: SimulatorConfig) -> Self {
        Self {
            temperature: config.ambient,
            config,
            phase: Phase::Idle,
            target: 0.0,
            loaded: Vec::new(),
            running: Vec::new(),
            stage: 0,
            hold_remaining: None,
            elapsed: 0,
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn temperature(&self) -> f32 {
        self.temperature
    }

    pub fn target(&self) -> f32 {
        self.target
    }

    /// Seconds since the last `START`, frozen once the run completes.
    pub fn elapsed(&self) -> u64 {
        self.elapsed
    }

    pub fn loaded_profile(&self) -> &[Setpoint] {
        &self.loaded
    }

    pub fn snapshot(&self) -> OvenState {
        let phase = self.phase.to_string();
        OvenState {
            current_temperature: self.temperature,
            target_temperature: self.target,
            stage: phase.clone(),
            time_elapsed: self.elapsed,
            status: phase,
        }
    }

    pub fn status_line(&self) -> String {
        protocol::encode_status_line(
            self.temperature,
            self.target,
            &self.phase.to_string(),
            self.elapsed,
        )
    }

    /// Apply a command. Returns the reply line, if the command has one.
    pub fn handle(&mut self, command: Command) -> Option<String> {
        match command {
            Command::StatusQuery => {}
            Command::Profile(setpoints) => {
                info!(stages = setpoints.len(), "Profile stored");
                self.loaded = setpoints;
                return None;
            }
            Command::Start(setpoints) => self.start(setpoints),
            Command::Stop => self.stop(),
        }
        Some(self.status_line())
    }

    pub fn start(&mut self, setpoints: Vec<Setpoint>) {
        let Some(first) = setpoints.first() else {
            warn!("START without stages ignored");
            return;
        };

        info!(
            stages = setpoints.len(),
            target_c = first.temperature,
            "Run started"
        );
        self.target = first.temperature;
        self.running = setpoints;
        self.stage = 0;
        self.hold_remaining = None;
        self.elapsed = 0;
        self.phase = self.ramp_phase();
    }

    /// Abort the run and cool down. No effect when nothing is running.
    pub fn stop(&mut self) {
        match self.phase {
            Phase::Idle | Phase::Complete => debug!(phase = %self.phase, "STOP ignored"),
            _ => {
                warn!(temp_c = self.temperature, "Run stopped, cooling");
                self.begin_cooling();
            }
        }
    }

    /// Advance the simulation by one step.
    pub fn step(&mut self) {
        match self.phase {
            Phase::Idle | Phase::Complete => {}
            Phase::Cooling => {
                self.elapsed += 1;
                self.temperature = (self.temperature - self.config.cool_rate).max(self.config.ambient);
                if self.temperature <= self.config.ambient {
                    info!(elapsed_s = self.elapsed, "Run complete");
                    self.phase = Phase::Complete;
                }
            }
            Phase::Heating | Phase::Soaking | Phase::Reflowing => {
                self.elapsed += 1;
                match self.hold_remaining {
                    None => self.ramp(),
                    Some(remaining) if remaining <= 1 => self.next_stage(),
                    Some(remaining) => self.hold_remaining = Some(remaining - 1),
                }
            }
        }
    }

    fn ramp(&mut self) {
        let delta = self.target - self.temperature;
        let rate = if delta >= 0.0 {
            self.config.heat_rate
        } else {
            self.config.cool_rate
        };

        if delta.abs() <= rate {
            self.temperature = self.target;
            self.hold_remaining = Some(self.running[self.stage].duration);
            self.phase = self.hold_phase();
            debug!(stage = self.stage, phase = %self.phase, "Stage target reached");
        } else {
            self.temperature += rate.copysign(delta);
        }
    }

    fn next_stage(&mut self) {
        self.stage += 1;
        self.hold_remaining = None;
        match self.running.get(self.stage) {
            Some(setpoint) => {
                self.target = setpoint.temperature;
                self.phase = self.ramp_phase();
                debug!(stage = self.stage, target_c = self.target, "Next stage");
            }
            None => self.begin_cooling(),
        }
    }

    fn begin_cooling(&mut self) {
        self.phase = Phase::Cooling;
        self.target = self.config.ambient;
        self.hold_remaining = None;
    }

    fn is_final_stage(&self) -> bool {
        self.stage + 1 >= self.running.len()
    }

    fn ramp_phase(&self) -> Phase {
        if self.is_final_stage() {
            Phase::Reflowing
        } else {
            Phase::Heating
        }
    }

    fn hold_phase(&self) -> Phase {
        if self.is_final_stage() {
            Phase::Reflowing
        } else {
            Phase::Soaking
        }
    }
}

impl Default for OvenModel {
    fn default() -> Self {
        Self::new(SimulatorConfig::default())
    }
}

/// Serves one [`OvenModel`] over TCP.
#[derive(Clone)]
pub struct OvenSimulator {
    model: Arc<Mutex<OvenModel>>,
    step: Duration,
}

impl OvenSimulator {
    pub fn new(config: SimulatorConfig) -> Self {
        let step = config.step;
        Self {
            model: Arc::new(Mutex::new(OvenModel::new(config))),
            step,
        }
    }

    pub fn snapshot(&self) -> OvenState {
        self.model.lock().snapshot()
    }

    pub fn phase(&self) -> Phase {
        self.model.lock().phase()
    }

    /// Run the clock and accept clients until `shutdown` is cancelled.
    pub async fn serve(&self, listener: TcpListener, shutdown: CancellationToken) {
        if let Ok(addr) = listener.local_addr() {
            info!(%addr, "Simulator listening");
        }

        let clock = tokio::spawn(run_clock(
            Arc::clone(&self.model),
            self.step,
            shutdown.clone(),
        ));
        let mut clients = JoinSet::new();

        loop {
            tokio::select! {
                biased;

                _ = shutdown.cancelled() => break,

                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        clients.spawn(serve_client(
                            stream,
                            peer,
                            Arc::clone(&self.model),
                            shutdown.clone(),
                        ));
                    }
                    Err(e) => warn!(error = %e, "Accept failed"),
                },

                Some(finished) = clients.join_next() => {
                    if let Err(e) = finished {
                        error!(error = %e, "Client task failed");
                    }
                }
            }
        }

        clients.shutdown().await;
        if let Err(e) = clock.await {
            error!(error = %e, "Simulator clock failed");
        }
        info!("Simulator stopped");
    }
}

impl Default for OvenSimulator {
    fn default() -> Self {
        Self::new(SimulatorConfig::default())
    }
}

async fn run_clock(model: Arc<Mutex<OvenModel>>, step: Duration, shutdown: CancellationToken) {
    let mut ticks = time::interval_at(Instant::now() + step, step);
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => return,
            _ = ticks.tick() => model.lock().step(),
        }
    }
}

async fn serve_client(
    stream: TcpStream,
    peer: SocketAddr,
    model: Arc<Mutex<OvenModel>>,
    shutdown: CancellationToken,
) {
    info!(%peer, "Client connected");
    let mut lines = Framed::new(
        stream,
        LinesCodec::new_with_max_length(MAX_COMMAND_LENGTH),
    );

    loop {
        let next = tokio::select! {
            _ = shutdown.cancelled() => break,
            next = lines.next() => next,
        };

        let line = match next {
            Some(Ok(line)) => line,
            Some(Err(LinesCodecError::MaxLineLengthExceeded)) => {
                warn!(%peer, "Discarding over-long command");
                continue;
            }
            Some(Err(LinesCodecError::Io(e))) => {
                debug!(%peer, error = %e, "Client read failed");
                break;
            }
            None => break,
        };

        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        let reply = match Command::parse(line) {
            Ok(command) => {
                trace!(%peer, %command, "Command");
                model.lock().handle(command)
            }
            Err(e) => {
                warn!(%peer, line, error = %e, "Unknown command ignored");
                None
            }
        };

        if let Some(reply) = reply {
            if let Err(e) = lines.send(reply).await {
                debug!(%peer, error = %e, "Client write failed");
                break;
            }
        }
    }

    info!(%peer, "Client disconnected");
}
