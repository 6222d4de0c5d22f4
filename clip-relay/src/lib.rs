//! # clipsync-relay
//!
//! Relay server for clipsync.
//!
//! This crate implements a relay server that:
//! - Accepts TCP connections from devices that cannot reach each other directly
//! - Routes end-to-end encrypted envelopes by target, or to every other device
//! - Forwards pairing challenges and acks between devices that are pairing
//! - Never sees plaintext (the relay is a "dumb pipe")
//!
//! ## Architecture
//!
//! ```text
//! Device A ──┐                        ┌── Device B
//!            │   framed JSON / TCP    │
//!            ├───────────────────────►│
//!            │                        │
//!        ┌───┴────────────────────────┴───┐
//!        │         clipsync-relay         │
//!        │  sessions · limits · metrics   │
//!        └────────────────────────────────┘
//! ```
//!
//! ## Protocol
//!
//! Every frame is a 4-byte big-endian length followed by a JSON envelope.
//! - `register` must be the first frame on a connection
//! - `clipboard` envelopes are forwarded verbatim
//! - `pairing_challenge` / `pairing_ack` are forwarded to their `target`
//! - `error` controls report rate limiting, offline targets and bad frames

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod cleanup;
pub mod config;
pub mod error;
pub mod http;
pub mod limits;
pub mod server;
pub mod session;

pub use config::Config;
pub use error::{ProtocolError, RelayError};
pub use server::{RelayServer, Route};
