//! # clipsync-core
//!
//! Pure logic for clipsync (no I/O, instant tests).
//!
//! This crate holds the parts of clipboard sync that can be decided without
//! touching a socket or a clock:
//! - content fingerprints and the origin flag
//! - the per-device duplicate window
//! - the out-of-band pairing payload
//! - pairing message bodies and state machines
//! - connection liveness and relay reconnect backoff
//!
//! The async I/O is performed by `clipsync-client`, which interprets the
//! states and actions produced here.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod content;
pub mod dedup;
pub mod handshake;
pub mod liveness;
pub mod payload;

pub use content::{ContentFingerprint, ContentItem, ContentPlaintext, Origin};
pub use dedup::{DedupWindow, DEFAULT_DEDUP_WINDOW};
pub use handshake::{
    check_freshness, AckBody, ChallengeBody, InitiatorEvent, InitiatorState, ResponderEvent,
    ResponderState, DEFAULT_TIMESTAMP_TOLERANCE,
};
pub use liveness::{
    calculate_backoff, Action, ConnectionEvent, ConnectionState, Event, Liveness,
    PeerConnectionRecord, TransportKind,
};
pub use payload::{
    key_fingerprint, unix_now_millis, unix_now_secs, PairingError, PairingPayload,
    DEFAULT_PAIRING_TTL,
};
