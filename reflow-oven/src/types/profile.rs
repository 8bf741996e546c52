//! Reflow profiles and the built-in catalog.

use std::fs;
use std::path::Path;

use anyhow::Context;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// One segment of a reflow curve: ramp to `target_temperature`, then hold
/// for `duration` seconds.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
pub struct ProfileStage {
    pub name: String,
    /// Degrees Celsius.
    pub target_temperature: f32,
    /// Seconds.
    pub duration: u32,
}

impl ProfileStage {
    pub fn new(name: impl Into<String>, target_temperature: f32, duration: u32) -> Self {
        Self {
            name: name.into(),
            target_temperature,
            duration,
        }
    }
}

/// An ordered sequence of stages. Order is execution order.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
pub struct ReflowProfile {
    pub name: String,
    pub stages: Vec<ProfileStage>,
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ProfileError {
    #[error("profile {0:?} has no stages")]
    Empty(String),

    #[error("stage {stage:?} has zero duration")]
    ZeroDuration { stage: String },

    #[error("stage {stage:?} has invalid temperature {temperature}")]
    InvalidTemperature { stage: String, temperature: f32 },
}

impl ReflowProfile {
    pub fn new(name: impl Into<String>, stages: Vec<ProfileStage>) -> Self {
        Self {
            name: name.into(),
            stages,
        }
    }

    /// Lead-free SAC alloys: soak at 150 °C for 90 s, peak at 245 °C.
    pub fn lead_free() -> Self {
        Self::new(
            "Lead-Free",
            vec![
                ProfileStage::new("Soak", 150.0, 90),
                ProfileStage::new("Reflow", 245.0, 30),
            ],
        )
    }

    /// Tin-lead alloys: soak at 140 °C for 60 s, peak at 215 °C.
    pub fn leaded() -> Self {
        Self::new(
            "Leaded",
            vec![
                ProfileStage::new("Soak", 140.0, 60),
                ProfileStage::new("Reflow", 215.0, 45),
            ],
        )
    }

    pub fn builtin() -> Vec<Self> {
        vec![Self::lead_free(), Self::leaded()]
    }

    /// Look up a built-in profile by name, ignoring case, spaces and dashes.
    pub fn find_builtin(name: &str) -> Option<Self> {
        let wanted = normalize(name);
        Self::builtin()
            .into_iter()
            .find(|profile| normalize(&profile.name) == wanted)
    }

    /// Read a profile from a JSON file and validate it.
    pub fn from_json_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let text = fs::read_to_string(path)
            .with_context(|| format!("reading profile {}", path.display()))?;
        let profile: Self = serde_json::from_str(&text)
            .with_context(|| format!("parsing profile {}", path.display()))?;
        profile.validate()?;
        Ok(profile)
    }

    /// A built-in profile by name, or else a JSON file at that path.
    pub fn resolve(name_or_path: &str) -> anyhow::Result<Self> {
        match Self::find_builtin(name_or_path) {
            Some(profile) => Ok(profile),
            None => Self::from_json_file(name_or_path),
        }
    }

    /// Total hold time across all stages, in seconds. Ramp time depends on
    /// the oven and is not included.
    pub fn total_hold_secs(&self) -> u64 {
        self.stages.iter().map(|s| u64::from(s.duration)).sum()
    }

    /// Check the profile is something an oven can run.
    ///
    /// Empty profiles are representable (they encode to a bare `START;`),
    /// so callers should validate before sending.
    pub fn validate(&self) -> Result<(), ProfileError> {
        if self.stages.is_empty() {
            return Err(ProfileError::Empty(self.name.clone()));
        }
        for stage in &self.stages {
            if !stage.target_temperature.is_finite() || stage.target_temperature < 0.0 {
                return Err(ProfileError::InvalidTemperature {
                    stage: stage.name.clone(),
                    temperature: stage.target_temperature,
                });
            }
            if stage.duration == 0 {
                return Err(ProfileError::ZeroDuration {
                    stage: stage.name.clone(),
                });
            }
        }
        Ok(())
    }
}

fn normalize(name: &str) -> String {
    name.chars()
        .filter(|c| c.is_alphanumeric())
        .flat_map(char::to_lowercase)
        .collect()
}
