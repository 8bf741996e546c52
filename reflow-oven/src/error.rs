//! Error types shared across the crate.
//!
//! The taxonomy follows the layers: [`ConnectError`] while establishing a
//! session, [`TransportError`] on an established one, [`DecodeError`] for
//! status lines that don't parse. None of these escape the client as
//! panics; the engine only ever sees them as values.

use std::io;

use thiserror::Error;

use crate::types::ProfileError;

/// Failure to establish a session with the oven.
#[derive(Debug, Error)]
pub enum ConnectError {
    #[error("could not resolve {host}:{port}")]
    Resolve { host: String, port: u16 },

    #[error("connection to {addr} refused")]
    Refused { addr: String },

    #[error("connection to {addr} timed out after {timeout_ms} ms")]
    Timeout { addr: String, timeout_ms: u128 },

    #[error("connection to {addr} failed: {source}")]
    Io {
        addr: String,
        #[source]
        source: io::Error,
    },
}

/// Failure on an established (or expected) session.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("not connected")]
    NotConnected,

    #[error("session closed by peer")]
    Closed,

    #[error("line exceeds {max} bytes")]
    LineTooLong { max: usize },

    #[error("transport I/O error: {0}")]
    Io(#[from] io::Error),
}

/// A status line that could not be turned into an `OvenState`.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("unexpected leading token {0:?}")]
    UnexpectedToken(String),

    #[error("expected at least 5 fields, found {found}")]
    MissingFields { found: usize },

    #[error("invalid {field}: {value:?}")]
    InvalidNumber { field: &'static str, value: String },
}

/// Umbrella error for callers that don't care which layer failed.
#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Connect(#[from] ConnectError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Decode(#[from] DecodeError),

    #[error(transparent)]
    Profile(#[from] ProfileError),
}

pub type Result<T> = std::result::Result<T, Error>;
