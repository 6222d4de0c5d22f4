//! # clipsync-client
//!
//! Device-side library for clipsync: end-to-end encrypted clipboard sync
//! between paired devices.
//!
//! ## Features
//!
//! - **Pairing**: X25519 ephemeral-ephemeral key agreement with signed,
//!   timestamped challenge and ack messages
//! - **E2E Encryption**: AES-256-GCM, 96-bit random nonces, sender id as
//!   associated data
//! - **Dual-Send**: every frame goes over the direct link and the relay at the
//!   same time; one success is enough
//! - **Loop Prevention**: origin flags plus a per-device content dedup window
//!
//! ## Example
//!
//! ```ignore
//! use clipsync_client::{FallbackCoordinator, SyncConfig, SyncCoordinator};
//!
//! let fallback = FallbackCoordinator::new(Some(direct), Some(relay));
//! let sync = SyncCoordinator::new(SyncConfig::new(device_id), store, fallback, sink);
//!
//! sync.publish(ContentItem::text("hello")).await?;
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod crypto;
pub mod fallback;
pub mod pairing;
pub mod sync;
pub mod transport;
pub mod trust;

pub use crypto::{
    CryptoError, EphemeralKeyPair, IdentityKeys, NonceSource, SessionKey, KEY_SIZE, NONCE_SIZE,
    TAG_SIZE,
};
pub use fallback::{
    BroadcastReport, Delivery, DualSendError, FallbackCoordinator, DEFAULT_DIRECT_TIMEOUT,
};
pub use pairing::{
    run_initiator, run_responder, ApprovalHandler, AutoApprove, HandshakeError,
    PairingInitiator, PairingOptions, PairingRequest, PairingResponder,
};
pub use sync::{
    ClipboardSink, DropReason, InboundOutcome, PublishOutcome, SyncConfig, SyncCoordinator,
    SyncError, SyncStatsSnapshot,
};
pub use transport::{
    DirectConfig, DirectTransport, FrameReader, InboundFrame, MockTransport, RelayConfig,
    RelayTransport, Transport, TransportError,
};
pub use trust::{MemoryTrustStore, TrustStore, TrustStoreError, TrustedDevice};
