//! Pairing drivers.
//!
//! [`PairingInitiator`] and [`PairingResponder`] run the challenge/ack
//! exchange on top of the pure state machines in `clipsync-core`:
//!
//! ```text
//! Initiator (has B's payload)                 Responder B
//! eph_a, initial = DH(eph_a, B.identity)
//! challenge = seal(initial, sign(body))  ---> initial = DH(B.identity, eph_a)
//!                                             open, verify signature + timestamp
//!                                             ask user
//!                                             eph_b, final = DH(eph_b, eph_a)
//! final = DH(eph_a, eph_b)               <--- ack = seal(initial, sign(body + eph_b))
//! store(B, final)                             store(A, final)
//! ```
//!
//! The final key always depends on both ephemeral keys, so pairing the same
//! two devices twice yields two different keys. Any failure discards the
//! ephemeral keys; a retry starts over with new ones.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use clipsync_core::handshake::random_nonce;
use clipsync_core::{
    check_freshness, key_fingerprint, unix_now_millis, unix_now_secs, AckBody, ChallengeBody,
    InitiatorEvent, InitiatorState, PairingError, PairingPayload, ResponderEvent, ResponderState,
    DEFAULT_TIMESTAMP_TOLERANCE,
};
use clipsync_types::{ControlMessage, DeviceId, Envelope, FrameCodec, SealedPairingMessage};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, info, warn};

use crate::crypto::{
    decrypt, encrypt, verify_signature, CryptoError, EphemeralKeyPair, IdentityKeys, SessionKey,
};
use crate::transport::{write_envelope, FrameReader, TransportError};
use crate::trust::{TrustStore, TrustStoreError, TrustedDevice};

const PAIRING_AAD_DOMAIN: &[u8] = b"clipsync/pairing/v1";

/// Pairing errors.
#[derive(Debug, Error)]
pub enum HandshakeError {
    /// Key agreement, sealing, or signature failure.
    #[error("crypto error: {0}")]
    Crypto(#[from] CryptoError),

    /// Payload or message validation failure (including stale timestamps).
    #[error("{0}")]
    Pairing(#[from] PairingError),

    /// Storing the session key failed.
    #[error("trust store error: {0}")]
    TrustStore(#[from] TrustStoreError),

    /// Transport failure while exchanging messages.
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    /// Message not valid in the current state.
    #[error("unexpected message: {0}")]
    UnexpectedMessage(String),

    /// A message came from a different device than expected.
    #[error("identity mismatch: expected {expected}, got {actual}")]
    IdentityMismatch {
        /// Device we are pairing with.
        expected: DeviceId,
        /// Device the message claims to be from.
        actual: DeviceId,
    },

    /// The ack carried no ephemeral key and legacy acks are disabled.
    #[error("ack without ephemeral key rejected (legacy acks disabled)")]
    LegacyAckRejected,

    /// The user denied the request.
    #[error("pairing request denied")]
    Denied,

    /// No ack arrived in time.
    #[error("pairing timed out")]
    Timeout,
}

/// Pairing behavior knobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PairingOptions {
    /// Maximum clock difference for challenge and ack timestamps.
    pub timestamp_tolerance: Duration,
    /// Accept acks without an ephemeral key, using the initial key as the
    /// session key. Loses forward secrecy; off by default.
    pub allow_legacy_ack: bool,
}

impl Default for PairingOptions {
    fn default() -> Self {
        Self {
            timestamp_tolerance: DEFAULT_TIMESTAMP_TOLERANCE,
            allow_legacy_ack: false,
        }
    }
}

impl PairingOptions {
    /// Set the timestamp tolerance.
    pub fn with_timestamp_tolerance(mut self, tolerance: Duration) -> Self {
        self.timestamp_tolerance = tolerance;
        self
    }

    /// Allow or reject legacy acks.
    pub fn with_legacy_ack(mut self, allow: bool) -> Self {
        self.allow_legacy_ack = allow;
        self
    }
}

/// What the responder shows the user before approving.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PairingRequest {
    /// Requesting device.
    pub device_id: DeviceId,
    /// Requesting device's name.
    pub device_name: String,
    /// Hex SHA-256 of the requester's signing key.
    pub fingerprint: String,
}

/// Decides whether to accept a pairing request.
#[async_trait]
pub trait ApprovalHandler: Send + Sync {
    /// Return `true` to approve.
    async fn approve(&self, request: &PairingRequest) -> bool;
}

/// Approves every request.
#[derive(Debug, Default, Clone, Copy)]
pub struct AutoApprove;

#[async_trait]
impl ApprovalHandler for AutoApprove {
    async fn approve(&self, _request: &PairingRequest) -> bool {
        true
    }
}

/// Associated data binding a sealed pairing message to its routing fields.
fn pairing_aad(sender: &DeviceId, target: &DeviceId) -> Vec<u8> {
    let mut aad = Vec::with_capacity(PAIRING_AAD_DOMAIN.len() + 8 + 64);
    aad.extend_from_slice(PAIRING_AAD_DOMAIN);
    for id in [sender, target] {
        aad.extend_from_slice(&(id.as_bytes().len() as u32).to_be_bytes());
        aad.extend_from_slice(id.as_bytes());
    }
    aad
}

fn open(sealed: &SealedPairingMessage, key: &SessionKey) -> Result<Vec<u8>, CryptoError> {
    decrypt(
        &sealed.ciphertext,
        &sealed.nonce,
        &sealed.tag,
        key,
        &pairing_aad(&sealed.sender, &sealed.target),
    )
}

struct InitiatorAttempt {
    peer: PairingPayload,
    ephemeral: EphemeralKeyPair,
    initial_key: SessionKey,
    challenge_nonce: [u8; 32],
}

/// Drives pairing from the side that scanned the other device's payload.
pub struct PairingInitiator {
    local_id: DeviceId,
    local_name: String,
    identity: Arc<IdentityKeys>,
    store: Arc<dyn TrustStore>,
    options: PairingOptions,
    state: InitiatorState,
    attempt: Option<InitiatorAttempt>,
}

impl PairingInitiator {
    /// Create an idle initiator.
    pub fn new(
        local_id: DeviceId,
        local_name: impl Into<String>,
        identity: Arc<IdentityKeys>,
        store: Arc<dyn TrustStore>,
        options: PairingOptions,
    ) -> Self {
        Self {
            local_id,
            local_name: local_name.into(),
            identity,
            store,
            options,
            state: InitiatorState::Idle,
            attempt: None,
        }
    }

    /// Current state.
    pub fn state(&self) -> &InitiatorState {
        &self.state
    }

    /// Build the sealed challenge for `peer`.
    ///
    /// Rejects stale or tampered payloads before anything is sent.
    pub fn start(&mut self, peer: &PairingPayload) -> Result<ControlMessage, HandshakeError> {
        self.start_at(peer, unix_now_millis())
    }

    fn start_at(
        &mut self,
        peer: &PairingPayload,
        now_ms: u64,
    ) -> Result<ControlMessage, HandshakeError> {
        if self.state.is_terminal() {
            self.state = InitiatorState::Idle;
        }
        if self.state != InitiatorState::Idle {
            return Err(HandshakeError::UnexpectedMessage(
                "pairing already in progress".into(),
            ));
        }

        match self.build_challenge(peer, now_ms) {
            Ok((message, attempt)) => {
                info!(peer = %peer.device_id, "pairing challenge built");
                self.attempt = Some(attempt);
                self.state = std::mem::take(&mut self.state).on_event(InitiatorEvent::ChallengeSent);
                Ok(message)
            }
            Err(e) => {
                self.fail(&e);
                Err(e)
            }
        }
    }

    fn build_challenge(
        &self,
        peer: &PairingPayload,
        now_ms: u64,
    ) -> Result<(ControlMessage, InitiatorAttempt), HandshakeError> {
        peer.validate()?;

        let ephemeral = EphemeralKeyPair::generate();
        let initial_key = ephemeral.agree(&peer.identity_public_key)?;

        let mut body = ChallengeBody {
            device_id: self.local_id.clone(),
            device_name: self.local_name.clone(),
            ephemeral_public_key: ephemeral.public(),
            signing_public_key: self.identity.signing_public(),
            nonce: random_nonce(),
            timestamp: now_ms,
            signature: [0u8; 64],
        };
        body.signature = self.identity.sign(&body.signing_bytes());

        let sealed = encrypt(
            &body.to_bytes()?,
            &initial_key,
            &pairing_aad(&self.local_id, &peer.device_id),
        )?;

        let message = ControlMessage::PairingChallenge(SealedPairingMessage {
            sender: self.local_id.clone(),
            target: peer.device_id.clone(),
            ephemeral_public_key: Some(ephemeral.public()),
            nonce: sealed.nonce,
            tag: sealed.tag,
            ciphertext: sealed.ciphertext,
        });

        let attempt = InitiatorAttempt {
            peer: peer.clone(),
            ephemeral,
            initial_key,
            challenge_nonce: body.nonce,
        };
        Ok((message, attempt))
    }

    /// Record that the transport delivered the challenge.
    pub fn mark_delivered(&mut self) {
        self.state = std::mem::take(&mut self.state).on_event(InitiatorEvent::ChallengeDelivered);
    }

    /// Process the responder's ack and store the session key.
    pub async fn handle_ack(
        &mut self,
        message: &ControlMessage,
    ) -> Result<TrustedDevice, HandshakeError> {
        self.handle_ack_at(message, unix_now_millis()).await
    }

    async fn handle_ack_at(
        &mut self,
        message: &ControlMessage,
        now_ms: u64,
    ) -> Result<TrustedDevice, HandshakeError> {
        if !self.state.accepts_ack() {
            return Err(HandshakeError::UnexpectedMessage(format!(
                "{} while {:?}",
                message.action(),
                self.state
            )));
        }
        let ControlMessage::PairingAck(sealed) = message else {
            let err = HandshakeError::UnexpectedMessage(format!("expected pairing_ack, got {}", message.action()));
            self.fail(&err);
            return Err(err);
        };

        match self.accept_ack(sealed, now_ms).await {
            Ok(device) => {
                if self.state == InitiatorState::ChallengeSent {
                    self.mark_delivered();
                }
                self.state = std::mem::take(&mut self.state).on_event(InitiatorEvent::AckAccepted);
                self.attempt = None;
                info!(peer = %device.device_id, "pairing complete");
                Ok(device)
            }
            Err(e) => {
                self.fail(&e);
                Err(e)
            }
        }
    }

    async fn accept_ack(
        &self,
        sealed: &SealedPairingMessage,
        now_ms: u64,
    ) -> Result<TrustedDevice, HandshakeError> {
        let attempt = self
            .attempt
            .as_ref()
            .ok_or_else(|| HandshakeError::UnexpectedMessage("no pairing attempt".into()))?;
        let peer = &attempt.peer;

        if sealed.sender != peer.device_id {
            return Err(HandshakeError::IdentityMismatch {
                expected: peer.device_id.clone(),
                actual: sealed.sender.clone(),
            });
        }

        let ack = AckBody::from_bytes(&open(sealed, &attempt.initial_key)?)?;
        if ack.device_id != peer.device_id {
            return Err(HandshakeError::IdentityMismatch {
                expected: peer.device_id.clone(),
                actual: ack.device_id,
            });
        }
        if ack.challenge_nonce != attempt.challenge_nonce {
            return Err(HandshakeError::UnexpectedMessage(
                "ack answers a different challenge".into(),
            ));
        }
        verify_signature(&peer.signing_public_key, &ack.signing_bytes(), &ack.signature)?;
        check_freshness(ack.timestamp, now_ms, self.options.timestamp_tolerance)?;

        let session_key = match &ack.ephemeral_public_key {
            Some(responder_ephemeral) => attempt.ephemeral.agree(responder_ephemeral)?,
            None if self.options.allow_legacy_ack => {
                warn!(
                    peer = %peer.device_id,
                    "ack without ephemeral key; using initial key (no forward secrecy)"
                );
                attempt.initial_key.clone()
            }
            None => return Err(HandshakeError::LegacyAckRejected),
        };

        let device = TrustedDevice {
            device_id: peer.device_id.clone(),
            device_name: ack.device_name,
            session_key,
            signing_public_key: peer.signing_public_key,
            fingerprint: key_fingerprint(&peer.signing_public_key),
            paired_at: unix_now_secs(),
        };
        self.store.save(device.clone()).await?;
        Ok(device)
    }

    /// Abort the current attempt and return to `Idle`.
    pub fn cancel(&mut self) {
        self.attempt = None;
        self.state = std::mem::take(&mut self.state).on_event(InitiatorEvent::Cancelled);
        debug!("pairing cancelled by initiator");
    }

    fn fail(&mut self, error: &HandshakeError) {
        warn!(error = %error, "pairing failed");
        self.attempt = None;
        self.state = std::mem::take(&mut self.state).on_event(InitiatorEvent::Failed {
            reason: error.to_string(),
        });
    }
}

struct PendingChallenge {
    challenge: ChallengeBody,
    initial_key: SessionKey,
}

/// Drives pairing from the side that showed its payload.
pub struct PairingResponder {
    local_id: DeviceId,
    local_name: String,
    identity: Arc<IdentityKeys>,
    store: Arc<dyn TrustStore>,
    options: PairingOptions,
    state: ResponderState,
    pending: Option<PendingChallenge>,
    approved: Option<TrustedDevice>,
}

impl PairingResponder {
    /// Create an idle responder.
    pub fn new(
        local_id: DeviceId,
        local_name: impl Into<String>,
        identity: Arc<IdentityKeys>,
        store: Arc<dyn TrustStore>,
        options: PairingOptions,
    ) -> Self {
        Self {
            local_id,
            local_name: local_name.into(),
            identity,
            store,
            options,
            state: ResponderState::Idle,
            pending: None,
            approved: None,
        }
    }

    /// Current state.
    pub fn state(&self) -> &ResponderState {
        &self.state
    }

    /// Open and verify a challenge, returning the request to show the user.
    pub fn receive_challenge(
        &mut self,
        message: &ControlMessage,
    ) -> Result<PairingRequest, HandshakeError> {
        self.receive_challenge_at(message, unix_now_millis())
    }

    fn receive_challenge_at(
        &mut self,
        message: &ControlMessage,
        now_ms: u64,
    ) -> Result<PairingRequest, HandshakeError> {
        if self.state.is_terminal() {
            self.state = ResponderState::Idle;
        }
        if self.state != ResponderState::Idle {
            return Err(HandshakeError::UnexpectedMessage(
                "pairing already in progress".into(),
            ));
        }

        match self.open_challenge(message, now_ms) {
            Ok(pending) => {
                let request = PairingRequest {
                    device_id: pending.challenge.device_id.clone(),
                    device_name: pending.challenge.device_name.clone(),
                    fingerprint: key_fingerprint(&pending.challenge.signing_public_key),
                };
                self.pending = Some(pending);
                self.state = std::mem::take(&mut self.state)
                    .on_event(ResponderEvent::ChallengeVerified)
                    .on_event(ResponderEvent::ApprovalRequested);
                info!(peer = %request.device_id, "pairing request awaiting approval");
                Ok(request)
            }
            Err(e) => {
                self.fail(&e);
                Err(e)
            }
        }
    }

    fn open_challenge(
        &self,
        message: &ControlMessage,
        now_ms: u64,
    ) -> Result<PendingChallenge, HandshakeError> {
        let ControlMessage::PairingChallenge(sealed) = message else {
            return Err(HandshakeError::UnexpectedMessage(format!(
                "expected pairing_challenge, got {}",
                message.action()
            )));
        };
        if sealed.target != self.local_id {
            return Err(HandshakeError::IdentityMismatch {
                expected: self.local_id.clone(),
                actual: sealed.target.clone(),
            });
        }
        let ephemeral = sealed
            .ephemeral_public_key
            .ok_or(PairingError::MissingField("ephemeral_public_key"))?;

        let initial_key = self.identity.agree(&ephemeral)?;
        let challenge = ChallengeBody::from_bytes(&open(sealed, &initial_key)?)?;

        if challenge.device_id != sealed.sender {
            return Err(HandshakeError::IdentityMismatch {
                expected: sealed.sender.clone(),
                actual: challenge.device_id,
            });
        }
        if challenge.ephemeral_public_key != ephemeral {
            return Err(HandshakeError::UnexpectedMessage(
                "sealed ephemeral key differs from cleartext key".into(),
            ));
        }
        verify_signature(
            &challenge.signing_public_key,
            &challenge.signing_bytes(),
            &challenge.signature,
        )?;
        check_freshness(challenge.timestamp, now_ms, self.options.timestamp_tolerance)?;

        Ok(PendingChallenge {
            challenge,
            initial_key,
        })
    }

    /// Approve the pending request and build the ack.
    ///
    /// Nothing is stored yet. Send the returned ack, then call
    /// [`PairingResponder::complete`]; if sending fails, call
    /// [`PairingResponder::cancel`].
    pub fn approve(&mut self) -> Result<ControlMessage, HandshakeError> {
        if self.state != ResponderState::AwaitingApproval {
            return Err(HandshakeError::UnexpectedMessage(format!(
                "approve while {:?}",
                self.state
            )));
        }
        let Some(pending) = self.pending.take() else {
            return Err(HandshakeError::UnexpectedMessage("no pending challenge".into()));
        };

        match self.build_ack(&pending) {
            Ok((ack, device)) => {
                debug!(peer = %device.device_id, "pairing approved, ack built");
                self.approved = Some(device);
                self.state = std::mem::take(&mut self.state).on_event(ResponderEvent::Approved);
                Ok(ack)
            }
            Err(e) => {
                self.fail(&e);
                Err(e)
            }
        }
    }

    /// Store the session key once the ack has gone out.
    pub async fn complete(&mut self) -> Result<TrustedDevice, HandshakeError> {
        if self.state != ResponderState::AckSent {
            return Err(HandshakeError::UnexpectedMessage(format!(
                "complete while {:?}",
                self.state
            )));
        }
        let Some(device) = self.approved.take() else {
            return Err(HandshakeError::UnexpectedMessage("no approved request".into()));
        };

        if let Err(e) = self.store.save(device.clone()).await {
            let err = HandshakeError::from(e);
            self.fail(&err);
            return Err(err);
        }
        self.state = std::mem::take(&mut self.state).on_event(ResponderEvent::KeyStored);
        info!(peer = %device.device_id, "pairing complete");
        Ok(device)
    }

    fn build_ack(
        &self,
        pending: &PendingChallenge,
    ) -> Result<(ControlMessage, TrustedDevice), HandshakeError> {
        let challenge = &pending.challenge;
        let ephemeral = EphemeralKeyPair::generate();
        let session_key = ephemeral.agree(&challenge.ephemeral_public_key)?;

        let mut body = AckBody {
            device_id: self.local_id.clone(),
            device_name: self.local_name.clone(),
            ephemeral_public_key: Some(ephemeral.public()),
            challenge_nonce: challenge.nonce,
            nonce: random_nonce(),
            timestamp: unix_now_millis(),
            signature: [0u8; 64],
        };
        body.signature = self.identity.sign(&body.signing_bytes());

        let sealed = encrypt(
            &body.to_bytes()?,
            &pending.initial_key,
            &pairing_aad(&self.local_id, &challenge.device_id),
        )?;
        let ack = ControlMessage::PairingAck(SealedPairingMessage {
            sender: self.local_id.clone(),
            target: challenge.device_id.clone(),
            ephemeral_public_key: None,
            nonce: sealed.nonce,
            tag: sealed.tag,
            ciphertext: sealed.ciphertext,
        });

        let device = TrustedDevice {
            device_id: challenge.device_id.clone(),
            device_name: challenge.device_name.clone(),
            session_key,
            signing_public_key: challenge.signing_public_key,
            fingerprint: key_fingerprint(&challenge.signing_public_key),
            paired_at: unix_now_secs(),
        };
        Ok((ack, device))
    }

    /// Deny the pending request. No ack is sent.
    pub fn deny(&mut self) {
        self.pending = None;
        self.approved = None;
        self.state = std::mem::take(&mut self.state).on_event(ResponderEvent::Denied);
        info!("pairing request denied");
    }

    /// Abort the current attempt and return to `Idle`.
    pub fn cancel(&mut self) {
        self.pending = None;
        self.approved = None;
        self.state = std::mem::take(&mut self.state).on_event(ResponderEvent::Cancelled);
        debug!("pairing cancelled by responder");
    }

    fn fail(&mut self, error: &HandshakeError) {
        warn!(error = %error, "pairing failed");
        self.pending = None;
        self.approved = None;
        self.state = std::mem::take(&mut self.state).on_event(ResponderEvent::Failed {
            reason: error.to_string(),
        });
    }
}

/// Run the initiator over a framed connection.
///
/// Sends the challenge, then waits up to `ack_timeout` for the ack.
pub async fn run_initiator<R, W>(
    initiator: &mut PairingInitiator,
    peer: &PairingPayload,
    reader: &mut FrameReader<R>,
    writer: &mut W,
    codec: &FrameCodec,
    ack_timeout: Duration,
) -> Result<TrustedDevice, HandshakeError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let challenge = initiator.start(peer)?;
    if let Err(e) = write_envelope(writer, codec, &Envelope::control(challenge)).await {
        let err = HandshakeError::from(e);
        initiator.fail(&err);
        return Err(err);
    }
    initiator.mark_delivered();

    let received = tokio::time::timeout(ack_timeout, async {
        loop {
            match reader.next_envelope().await? {
                Some(envelope) => match envelope.control_message() {
                    Some(control @ ControlMessage::PairingAck(_)) => return Ok(control.clone()),
                    Some(other) => debug!(action = other.action(), "ignoring control during pairing"),
                    None => debug!("ignoring clipboard frame during pairing"),
                },
                None => return Err(TransportError::ConnectionClosed),
            }
        }
    })
    .await;

    let ack = match received {
        Ok(Ok(ack)) => ack,
        Ok(Err(e)) => {
            let err = HandshakeError::from(e);
            initiator.fail(&err);
            return Err(err);
        }
        Err(_) => {
            initiator.fail(&HandshakeError::Timeout);
            return Err(HandshakeError::Timeout);
        }
    };
    initiator.handle_ack(&ack).await
}

/// Run the responder over a framed connection: wait for one challenge, ask
/// `approval`, and answer.
pub async fn run_responder<R, W>(
    responder: &mut PairingResponder,
    approval: &dyn ApprovalHandler,
    reader: &mut FrameReader<R>,
    writer: &mut W,
    codec: &FrameCodec,
) -> Result<TrustedDevice, HandshakeError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let challenge = loop {
        match reader.next_envelope().await? {
            Some(envelope) => match envelope.control_message() {
                Some(control @ ControlMessage::PairingChallenge(_)) => break control.clone(),
                Some(other) => debug!(action = other.action(), "ignoring control while waiting"),
                None => debug!("ignoring clipboard frame while waiting"),
            },
            None => return Err(TransportError::ConnectionClosed.into()),
        }
    };

    let request = responder.receive_challenge(&challenge)?;
    if !approval.approve(&request).await {
        responder.deny();
        return Err(HandshakeError::Denied);
    }

    let ack = responder.approve()?;
    if let Err(e) = write_envelope(writer, codec, &Envelope::control(ack)).await {
        let err = HandshakeError::from(e);
        responder.fail(&err);
        return Err(err);
    }
    responder.complete().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trust::MemoryTrustStore;

    // ===========================================
    // Fixtures
    // ===========================================

    struct Device {
        id: DeviceId,
        identity: Arc<IdentityKeys>,
        store: MemoryTrustStore,
    }

    impl Device {
        fn new(id: &str) -> Self {
            Self {
                id: DeviceId::new(id).unwrap(),
                identity: Arc::new(IdentityKeys::generate()),
                store: MemoryTrustStore::new(),
            }
        }

        fn payload(&self) -> PairingPayload {
            PairingPayload::create(
                self.id.clone(),
                self.id.as_str().to_uppercase(),
                self.identity.agreement_public(),
                self.identity.signing_public(),
            )
        }

        fn initiator(&self, options: PairingOptions) -> PairingInitiator {
            PairingInitiator::new(
                self.id.clone(),
                "Initiator",
                self.identity.clone(),
                Arc::new(self.store.clone()),
                options,
            )
        }

        fn responder(&self, options: PairingOptions) -> PairingResponder {
            PairingResponder::new(
                self.id.clone(),
                "Responder",
                self.identity.clone(),
                Arc::new(self.store.clone()),
                options,
            )
        }
    }

    async fn pair(a: &Device, b: &Device) -> (TrustedDevice, TrustedDevice) {
        let mut initiator = a.initiator(PairingOptions::default());
        let mut responder = b.responder(PairingOptions::default());

        let challenge = initiator.start(&b.payload()).unwrap();
        initiator.mark_delivered();
        responder.receive_challenge(&challenge).unwrap();
        let ack = responder.approve().unwrap();
        assert_eq!(responder.state(), &ResponderState::AckSent);
        let b_view = responder.complete().await.unwrap();
        let a_view = initiator.handle_ack(&ack).await.unwrap();

        assert_eq!(initiator.state(), &InitiatorState::Paired);
        assert_eq!(responder.state(), &ResponderState::Paired);
        (a_view, b_view)
    }

    fn sealed(message: &ControlMessage) -> &SealedPairingMessage {
        match message {
            ControlMessage::PairingChallenge(s) | ControlMessage::PairingAck(s) => s,
            _ => panic!("not a pairing message"),
        }
    }

    // ===========================================
    // Full Exchange
    // ===========================================

    #[tokio::test]
    async fn both_sides_derive_identical_keys() {
        let a = Device::new("mac");
        let b = Device::new("pixel");

        let (a_view, b_view) = pair(&a, &b).await;

        assert_eq!(a_view.device_id, b.id);
        assert_eq!(b_view.device_id, a.id);
        assert_eq!(a_view.session_key, b_view.session_key);
        assert_eq!(a_view.session_key.as_bytes().len(), 32);
        assert_eq!(b_view.fingerprint, a.identity.fingerprint());
    }

    #[tokio::test]
    async fn stored_key_reloads_byte_identical() {
        let a = Device::new("mac");
        let b = Device::new("pixel");

        let (a_view, _) = pair(&a, &b).await;

        let reloaded = b.store.load(&a.id).await.unwrap().unwrap();
        assert_eq!(reloaded.session_key.as_bytes(), a_view.session_key.as_bytes());
    }

    #[tokio::test]
    async fn repairing_rotates_the_session_key() {
        let a = Device::new("mac");
        let b = Device::new("pixel");

        let (first, _) = pair(&a, &b).await;
        let (second, _) = pair(&a, &b).await;

        assert_ne!(first.session_key, second.session_key);
        let stored = a.store.load(&b.id).await.unwrap().unwrap();
        assert_eq!(stored.session_key, second.session_key);
        assert_eq!(a.store.list().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn final_key_differs_from_initial_key() {
        let a = Device::new("mac");
        let b = Device::new("pixel");

        let mut initiator = a.initiator(PairingOptions::default());
        let challenge = initiator.start(&b.payload()).unwrap();
        let eph = sealed(&challenge).ephemeral_public_key.unwrap();
        let initial = b.identity.agree(&eph).unwrap();

        let mut responder = b.responder(PairingOptions::default());
        responder.receive_challenge(&challenge).unwrap();
        let ack = responder.approve().unwrap();
        let device = initiator.handle_ack(&ack).await.unwrap();

        assert_ne!(device.session_key, initial);
    }

    // ===========================================
    // Challenge Validation
    // ===========================================

    #[tokio::test]
    async fn stale_challenge_fails_responder() {
        let a = Device::new("mac");
        let b = Device::new("pixel");

        let mut initiator = a.initiator(PairingOptions::default());
        let challenge = initiator
            .start_at(&b.payload(), unix_now_millis() - 31_000)
            .unwrap();

        let mut responder = b.responder(PairingOptions::default());
        let result = responder.receive_challenge(&challenge);

        assert!(matches!(
            result,
            Err(HandshakeError::Pairing(PairingError::StaleTimestamp { .. }))
        ));
        assert!(matches!(responder.state(), ResponderState::Failed { .. }));
        assert!(responder.approve().is_err());
    }

    #[tokio::test]
    async fn tolerance_is_configurable() {
        let a = Device::new("mac");
        let b = Device::new("pixel");

        let mut initiator = a.initiator(PairingOptions::default());
        let challenge = initiator
            .start_at(&b.payload(), unix_now_millis() - 31_000)
            .unwrap();

        let options = PairingOptions::default().with_timestamp_tolerance(Duration::from_secs(120));
        let mut responder = b.responder(options);
        assert!(responder.receive_challenge(&challenge).is_ok());
    }

    #[tokio::test]
    async fn tampered_challenge_fails_closed() {
        let a = Device::new("mac");
        let b = Device::new("pixel");

        let mut initiator = a.initiator(PairingOptions::default());
        let mut challenge = initiator.start(&b.payload()).unwrap();
        if let ControlMessage::PairingChallenge(s) = &mut challenge {
            s.ciphertext[0] ^= 0x01;
        }

        let mut responder = b.responder(PairingOptions::default());
        assert!(matches!(
            responder.receive_challenge(&challenge),
            Err(HandshakeError::Crypto(CryptoError::DecryptionFailed))
        ));
        assert!(b.store.list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn challenge_for_another_device_rejected() {
        let a = Device::new("mac");
        let b = Device::new("pixel");
        let c = Device::new("ipad");

        let mut initiator = a.initiator(PairingOptions::default());
        let challenge = initiator.start(&b.payload()).unwrap();

        let mut responder = c.responder(PairingOptions::default());
        assert!(matches!(
            responder.receive_challenge(&challenge),
            Err(HandshakeError::IdentityMismatch { .. })
        ));
    }

    #[tokio::test]
    async fn forged_signature_rejected() {
        let a = Device::new("mac");
        let b = Device::new("pixel");
        let mallory = IdentityKeys::generate();

        // Body claims A's signing key but is signed by someone else.
        let eph = EphemeralKeyPair::generate();
        let initial = eph.agree(&b.identity.agreement_public()).unwrap();
        let mut body = ChallengeBody {
            device_id: a.id.clone(),
            device_name: "Mac".into(),
            ephemeral_public_key: eph.public(),
            signing_public_key: a.identity.signing_public(),
            nonce: random_nonce(),
            timestamp: unix_now_millis(),
            signature: [0; 64],
        };
        body.signature = mallory.sign(&body.signing_bytes());
        let s = encrypt(&body.to_bytes().unwrap(), &initial, &pairing_aad(&a.id, &b.id)).unwrap();
        let challenge = ControlMessage::PairingChallenge(SealedPairingMessage {
            sender: a.id.clone(),
            target: b.id.clone(),
            ephemeral_public_key: Some(eph.public()),
            nonce: s.nonce,
            tag: s.tag,
            ciphertext: s.ciphertext,
        });

        let mut responder = b.responder(PairingOptions::default());
        assert!(matches!(
            responder.receive_challenge(&challenge),
            Err(HandshakeError::Crypto(CryptoError::SignatureInvalid))
        ));
    }

    #[tokio::test]
    async fn expired_payload_rejected_before_challenge() {
        let a = Device::new("mac");
        let b = Device::new("pixel");
        let expired = PairingPayload::create_with_ttl(
            b.id.clone(),
            "Pixel",
            b.identity.agreement_public(),
            b.identity.signing_public(),
            Duration::from_secs(0),
        );

        let mut initiator = a.initiator(PairingOptions::default());
        assert!(matches!(
            initiator.start(&expired),
            Err(HandshakeError::Pairing(PairingError::Expired))
        ));
        assert!(matches!(initiator.state(), InitiatorState::Failed { .. }));

        // Retry with a fresh payload starts over.
        assert!(initiator.start(&b.payload()).is_ok());
        assert_eq!(initiator.state(), &InitiatorState::ChallengeSent);
    }

    // ===========================================
    // Ack Validation
    // ===========================================

    #[tokio::test]
    async fn ack_from_wrong_sender_rejected() {
        let a = Device::new("mac");
        let b = Device::new("pixel");

        let mut initiator = a.initiator(PairingOptions::default());
        let mut responder = b.responder(PairingOptions::default());
        let challenge = initiator.start(&b.payload()).unwrap();
        responder.receive_challenge(&challenge).unwrap();
        let mut ack = responder.approve().unwrap();
        if let ControlMessage::PairingAck(s) = &mut ack {
            s.sender = DeviceId::new("ipad").unwrap();
        }

        assert!(matches!(
            initiator.handle_ack(&ack).await,
            Err(HandshakeError::IdentityMismatch { .. })
        ));
        assert!(matches!(initiator.state(), InitiatorState::Failed { .. }));
        assert!(a.store.list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn ack_for_previous_attempt_rejected_after_retry() {
        let a = Device::new("mac");
        let b = Device::new("pixel");

        let mut initiator = a.initiator(PairingOptions::default());
        let mut responder = b.responder(PairingOptions::default());
        let first = initiator.start(&b.payload()).unwrap();
        responder.receive_challenge(&first).unwrap();
        let old_ack = responder.approve().unwrap();

        initiator.cancel();
        assert_eq!(initiator.state(), &InitiatorState::Idle);
        initiator.start(&b.payload()).unwrap();

        // New ephemeral key, new initial key: the old ack no longer opens.
        assert!(matches!(
            initiator.handle_ack(&old_ack).await,
            Err(HandshakeError::Crypto(CryptoError::DecryptionFailed))
        ));
    }

    #[tokio::test]
    async fn ack_after_cancel_is_unexpected() {
        let a = Device::new("mac");
        let b = Device::new("pixel");

        let mut initiator = a.initiator(PairingOptions::default());
        let mut responder = b.responder(PairingOptions::default());
        let challenge = initiator.start(&b.payload()).unwrap();
        responder.receive_challenge(&challenge).unwrap();
        let ack = responder.approve().unwrap();

        initiator.cancel();
        assert!(matches!(
            initiator.handle_ack(&ack).await,
            Err(HandshakeError::UnexpectedMessage(_))
        ));
        assert_eq!(initiator.state(), &InitiatorState::Idle);
    }

    /// Build an ack the way an old responder would: no ephemeral key.
    fn legacy_ack(b: &Device, challenge: &ControlMessage) -> ControlMessage {
        let s = sealed(challenge);
        let initial = b.identity.agree(&s.ephemeral_public_key.unwrap()).unwrap();
        let body = ChallengeBody::from_bytes(&open(s, &initial).unwrap()).unwrap();

        let mut ack = AckBody {
            device_id: b.id.clone(),
            device_name: "Old Pixel".into(),
            ephemeral_public_key: None,
            challenge_nonce: body.nonce,
            nonce: random_nonce(),
            timestamp: unix_now_millis(),
            signature: [0; 64],
        };
        ack.signature = b.identity.sign(&ack.signing_bytes());
        let sealed = encrypt(&ack.to_bytes().unwrap(), &initial, &pairing_aad(&b.id, &s.sender)).unwrap();
        ControlMessage::PairingAck(SealedPairingMessage {
            sender: b.id.clone(),
            target: s.sender.clone(),
            ephemeral_public_key: None,
            nonce: sealed.nonce,
            tag: sealed.tag,
            ciphertext: sealed.ciphertext,
        })
    }

    #[tokio::test]
    async fn legacy_ack_rejected_by_default() {
        let a = Device::new("mac");
        let b = Device::new("pixel");

        let mut initiator = a.initiator(PairingOptions::default());
        let challenge = initiator.start(&b.payload()).unwrap();

        let result = initiator.handle_ack(&legacy_ack(&b, &challenge)).await;
        assert!(matches!(result, Err(HandshakeError::LegacyAckRejected)));
        assert!(a.store.list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn legacy_ack_opt_in_uses_initial_key() {
        // Deliberately weaker path: no forward secrecy.
        let a = Device::new("mac");
        let b = Device::new("pixel");

        let mut initiator = a.initiator(PairingOptions::default().with_legacy_ack(true));
        let challenge = initiator.start(&b.payload()).unwrap();
        let eph = sealed(&challenge).ephemeral_public_key.unwrap();
        let initial = b.identity.agree(&eph).unwrap();

        let device = initiator
            .handle_ack(&legacy_ack(&b, &challenge))
            .await
            .unwrap();
        assert_eq!(device.session_key, initial);
        assert_eq!(initiator.state(), &InitiatorState::Paired);
    }

    // ===========================================
    // Approval
    // ===========================================

    #[tokio::test]
    async fn denial_is_terminal_and_sends_nothing() {
        let a = Device::new("mac");
        let b = Device::new("pixel");

        let mut initiator = a.initiator(PairingOptions::default());
        let mut responder = b.responder(PairingOptions::default());
        let challenge = initiator.start(&b.payload()).unwrap();

        let request = responder.receive_challenge(&challenge).unwrap();
        assert_eq!(request.device_id, a.id);
        assert_eq!(request.fingerprint, a.identity.fingerprint());

        responder.deny();
        assert_eq!(responder.state(), &ResponderState::Denied);
        assert!(responder.approve().is_err());
        assert!(b.store.list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn approval_stores_nothing_until_complete() {
        let a = Device::new("mac");
        let b = Device::new("pixel");

        let mut initiator = a.initiator(PairingOptions::default());
        let mut responder = b.responder(PairingOptions::default());
        let challenge = initiator.start(&b.payload()).unwrap();
        responder.receive_challenge(&challenge).unwrap();

        responder.approve().unwrap();
        assert_eq!(responder.state(), &ResponderState::AckSent);
        assert!(b.store.list().await.unwrap().is_empty());

        responder.cancel();
        assert_eq!(responder.state(), &ResponderState::Idle);
        assert!(responder.complete().await.is_err());
        assert!(b.store.list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn responder_cancel_discards_request() {
        let a = Device::new("mac");
        let b = Device::new("pixel");

        let mut initiator = a.initiator(PairingOptions::default());
        let mut responder = b.responder(PairingOptions::default());
        let challenge = initiator.start(&b.payload()).unwrap();
        responder.receive_challenge(&challenge).unwrap();

        responder.cancel();
        assert_eq!(responder.state(), &ResponderState::Idle);
        assert!(responder.approve().is_err());
    }

    // ===========================================
    // Over A Stream
    // ===========================================

    struct Deny;

    #[async_trait]
    impl ApprovalHandler for Deny {
        async fn approve(&self, _request: &PairingRequest) -> bool {
            false
        }
    }

    #[tokio::test]
    async fn pairing_over_duplex_stream() {
        let a = Device::new("mac");
        let b = Device::new("pixel");
        let codec = FrameCodec::default();

        let (a_io, b_io) = tokio::io::duplex(64 * 1024);
        let (a_read, mut a_write) = tokio::io::split(a_io);
        let (b_read, mut b_write) = tokio::io::split(b_io);
        let mut a_reader = FrameReader::new(a_read, codec.max_frame_len());
        let mut b_reader = FrameReader::new(b_read, codec.max_frame_len());

        let mut initiator = a.initiator(PairingOptions::default());
        let mut responder = b.responder(PairingOptions::default());
        let payload = b.payload();

        let (a_result, b_result) = tokio::join!(
            run_initiator(
                &mut initiator,
                &payload,
                &mut a_reader,
                &mut a_write,
                &codec,
                Duration::from_secs(5)
            ),
            run_responder(&mut responder, &AutoApprove, &mut b_reader, &mut b_write, &codec),
        );

        assert_eq!(a_result.unwrap().session_key, b_result.unwrap().session_key);
    }

    /// Writer whose peer has gone away.
    struct BrokenPipe;

    impl AsyncWrite for BrokenPipe {
        fn poll_write(
            self: std::pin::Pin<&mut Self>,
            _cx: &mut std::task::Context<'_>,
            _buf: &[u8],
        ) -> std::task::Poll<std::io::Result<usize>> {
            std::task::Poll::Ready(Err(std::io::ErrorKind::BrokenPipe.into()))
        }

        fn poll_flush(
            self: std::pin::Pin<&mut Self>,
            _cx: &mut std::task::Context<'_>,
        ) -> std::task::Poll<std::io::Result<()>> {
            std::task::Poll::Ready(Ok(()))
        }

        fn poll_shutdown(
            self: std::pin::Pin<&mut Self>,
            _cx: &mut std::task::Context<'_>,
        ) -> std::task::Poll<std::io::Result<()>> {
            std::task::Poll::Ready(Ok(()))
        }
    }

    #[tokio::test]
    async fn unsent_ack_leaves_no_trust_record() {
        let a = Device::new("mac");
        let b = Device::new("pixel");
        let codec = FrameCodec::default();

        let mut initiator = a.initiator(PairingOptions::default());
        let challenge = initiator.start(&b.payload()).unwrap();

        let (mut feed, b_io) = tokio::io::duplex(64 * 1024);
        write_envelope(&mut feed, &codec, &Envelope::control(challenge))
            .await
            .unwrap();
        let mut reader = FrameReader::new(b_io, codec.max_frame_len());

        let mut responder = b.responder(PairingOptions::default());
        let result =
            run_responder(&mut responder, &AutoApprove, &mut reader, &mut BrokenPipe, &codec).await;

        assert!(matches!(result, Err(HandshakeError::Transport(_))));
        assert!(matches!(responder.state(), ResponderState::Failed { .. }));
        assert!(b.store.load(&a.id).await.unwrap().is_none());
        assert!(b.store.list().await.unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn denied_request_times_out_initiator() {
        let a = Device::new("mac");
        let b = Device::new("pixel");
        let codec = FrameCodec::default();

        let (a_io, b_io) = tokio::io::duplex(64 * 1024);
        let (a_read, mut a_write) = tokio::io::split(a_io);
        let (b_read, mut b_write) = tokio::io::split(b_io);
        let mut a_reader = FrameReader::new(a_read, codec.max_frame_len());
        let mut b_reader = FrameReader::new(b_read, codec.max_frame_len());

        let mut initiator = a.initiator(PairingOptions::default());
        let mut responder = b.responder(PairingOptions::default());
        let payload = b.payload();

        let (a_result, b_result) = tokio::join!(
            run_initiator(
                &mut initiator,
                &payload,
                &mut a_reader,
                &mut a_write,
                &codec,
                Duration::from_secs(5)
            ),
            run_responder(&mut responder, &Deny, &mut b_reader, &mut b_write, &codec),
        );

        assert!(matches!(b_result, Err(HandshakeError::Denied)));
        assert!(matches!(a_result, Err(HandshakeError::Timeout)));
        assert!(matches!(initiator.state(), InitiatorState::Failed { .. }));
    }
}
