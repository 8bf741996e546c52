//! Value types shared by the client, the engine and the simulator.

mod history;
mod oven_state;
mod profile;

pub use history::{DEFAULT_HISTORY_CAPACITY, HistoryBuffer, HistoryPoint};
pub use oven_state::OvenState;
pub use profile::{ProfileError, ProfileStage, ReflowProfile};
