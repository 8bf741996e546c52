use serde::{Deserialize, Serialize};

/// Stage and status reported before any telemetry has arrived.
pub const IDLE: &str = "Idle";

/// One telemetry snapshot from the oven.
///
/// Produced by decoding a status line. Snapshots are replaced wholesale,
/// never patched in place.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
pub struct OvenState {
    pub current_temperature: f32,
    pub target_temperature: f32,
    pub stage: String,
    /// Seconds, as reported by the device.
    pub time_elapsed: u64,
    /// Mirrors `stage`; the protocol carries a single field for both.
    pub status: String,
}

impl OvenState {
    /// Whether this is the idle placeholder rather than real telemetry.
    pub fn is_idle(&self) -> bool {
        *self == Self::default()
    }
}

impl Default for OvenState {
    fn default() -> Self {
        Self {
            current_temperature: 0.0,
            target_temperature: 0.0,
            stage: IDLE.to_string(),
            time_elapsed: 0,
            status: IDLE.to_string(),
        }
    }
}
