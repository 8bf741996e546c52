//! Line protocol spoken with the oven controller.
//!
//! Every message is one newline-terminated ASCII line of `;`-separated
//! fields. Newline framing is the transport's job (`LinesCodec`); nothing
//! here touches I/O.
//!
//! ```text
//! client -> device   PROFILE;<t1>;<d1>;<t2>;<d2>...   upload, don't start
//!                    START;<t1>;<d1>;...              upload and run
//!                    STOP                             abort current run
//!                    STATUS?                          request one snapshot
//! device -> client   STATUS;<current>;<target>;<stage>;<elapsed>
//! ```
//!
//! The protocol is asymmetric: status lines are never encoded by the client
//! and commands are never decoded by it. The simulator uses the other half.

use std::fmt;

use crate::error::DecodeError;
use crate::types::{OvenState, ReflowProfile};

const PROFILE: &str = "PROFILE";
const START: &str = "START";
const STOP: &str = "STOP";
const STATUS_QUERY: &str = "STATUS?";
const STATUS: &str = "STATUS";

/// Fields in a complete status line, including the leading token.
const STATUS_FIELDS: usize = 5;

/// A temperature/duration pair as carried on the wire.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Setpoint {
    pub temperature: f32,
    pub duration: u32,
}

/// Client-to-device commands.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Profile(Vec<Setpoint>),
    Start(Vec<Setpoint>),
    Stop,
    StatusQuery,
}

impl Command {
    pub fn profile(profile: &ReflowProfile) -> Self {
        Command::Profile(setpoints(profile))
    }

    pub fn start(profile: &ReflowProfile) -> Self {
        Command::Start(setpoints(profile))
    }

    /// Parse a command line as received by a device.
    pub fn parse(line: &str) -> Result<Self, DecodeError> {
        let line = line.trim();
        match line {
            STOP => return Ok(Command::Stop),
            STATUS_QUERY => return Ok(Command::StatusQuery),
            _ => {}
        }

        let mut fields = line.split(';');
        let head = fields.next().unwrap_or_default();
        let rest: Vec<&str> = fields.filter(|f| !f.is_empty()).collect();

        let build: fn(Vec<Setpoint>) -> Command = match head {
            PROFILE => Command::Profile,
            START => Command::Start,
            other => return Err(DecodeError::UnexpectedToken(other.to_string())),
        };

        if rest.len() % 2 != 0 {
            return Err(DecodeError::MissingFields {
                found: rest.len() + 1,
            });
        }

        let setpoints = rest
            .chunks(2)
            .map(|pair| {
                Ok(Setpoint {
                    temperature: parse_field(pair[0], "temperature")?,
                    duration: parse_field(pair[1], "duration")?,
                })
            })
            .collect::<Result<Vec<_>, DecodeError>>()?;

        Ok(build(setpoints))
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Command::Profile(setpoints) => write_setpoints(f, PROFILE, setpoints),
            Command::Start(setpoints) => write_setpoints(f, START, setpoints),
            Command::Stop => f.write_str(STOP),
            Command::StatusQuery => f.write_str(STATUS_QUERY),
        }
    }
}

fn setpoints(profile: &ReflowProfile) -> Vec<Setpoint> {
    profile
        .stages
        .iter()
        .map(|stage| Setpoint {
            temperature: stage.target_temperature,
            duration: stage.duration,
        })
        .collect()
}

// Empty profiles still get the separator: "PROFILE;".
fn write_setpoints(f: &mut fmt::Formatter<'_>, head: &str, setpoints: &[Setpoint]) -> fmt::Result {
    write!(f, "{head};")?;
    for (i, sp) in setpoints.iter().enumerate() {
        if i > 0 {
            f.write_str(";")?;
        }
        write!(f, "{};{}", format_temperature(sp.temperature), sp.duration)?;
    }
    Ok(())
}

/// Render a temperature with at least one fractional digit.
///
/// Device firmware parses with `%f`, which accepts either form, but
/// `150.0` keeps the payload unambiguous about the field type.
pub fn format_temperature(temperature: f32) -> String {
    let s = temperature.to_string();
    if s.contains('.') || !temperature.is_finite() {
        s
    } else {
        format!("{s}.0")
    }
}

pub fn encode_send_profile(profile: &ReflowProfile) -> String {
    Command::profile(profile).to_string()
}

pub fn encode_start(profile: &ReflowProfile) -> String {
    Command::start(profile).to_string()
}

pub fn encode_stop() -> String {
    Command::Stop.to_string()
}

pub fn encode_status_query() -> String {
    Command::StatusQuery.to_string()
}

/// Decode one status line.
///
/// Field 3 populates both `stage` and `status`; the device reports a single
/// value for the two.
pub fn decode_status_line(line: &str) -> Result<OvenState, DecodeError> {
    let fields: Vec<&str> = line.trim_end_matches(['\r', '\n']).split(';').collect();

    if fields[0] != STATUS {
        return Err(DecodeError::UnexpectedToken(fields[0].to_string()));
    }
    if fields.len() < STATUS_FIELDS {
        return Err(DecodeError::MissingFields {
            found: fields.len(),
        });
    }

    let stage = fields[3].to_string();
    Ok(OvenState {
        current_temperature: parse_field(fields[1], "current temperature")?,
        target_temperature: parse_field(fields[2], "target temperature")?,
        status: stage.clone(),
        stage,
        time_elapsed: elapsed_secs(parse_field(fields[4], "time elapsed")?),
    })
}

/// Firmware counts some stages down and can leave the counter at -1.
fn elapsed_secs(raw: i64) -> u64 {
    u64::try_from(raw).unwrap_or(0)
}

/// Format a status line the way device firmware does (one decimal place).
pub fn encode_status_line(current: f32, target: f32, stage: &str, elapsed: u64) -> String {
    format!("{STATUS};{current:.1};{target:.1};{stage};{elapsed}")
}

fn parse_field<T: std::str::FromStr>(value: &str, field: &'static str) -> Result<T, DecodeError> {
    value.trim().parse().map_err(|_| DecodeError::InvalidNumber {
        field,
        value: value.to_string(),
    })
}
