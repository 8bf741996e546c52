//! Client-side controller for networked reflow ovens.
//!
//! The crate is layered leaf-first:
//!
//! - [`protocol`] encodes commands and decodes status lines.
//! - [`transport`] owns one TCP session and moves lines across it.
//! - [`client`] drives the session: connect/disconnect, commands, and the
//!   status-polling loop.
//! - [`engine`] subscribes to the client and republishes connection state,
//!   the latest oven snapshot and a bounded temperature history through
//!   watch channels.
//!
//! [`simulator`] implements the device side of the protocol for bench
//! testing without an oven.

pub mod client;
pub mod config;
pub mod engine;
pub mod error;
pub mod protocol;
pub mod simulator;
pub mod tracing;
pub mod transport;
pub mod types;
