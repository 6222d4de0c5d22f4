//! Per-connection session management.
//!
//! A session reads length-prefixed envelopes from one device. The first frame
//! must be `register`; after that every frame is rate limited, checked
//! against the registered identity and routed. Outbound frames are written by
//! a separate task fed from the session's queue.

use crate::error::{ProtocolError, ProtocolResult, RelayError};
use crate::server::{Frame, RelayMetrics, RelayServer, Route};
use clipsync_types::{
    ControlMessage, DeviceId, Envelope, ErrorCode, FrameCodec, FrameDecoder, Payload,
};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};

/// Frames queued per session before new ones are dropped.
const OUTBOUND_QUEUE: usize = 256;

/// How long a closing session waits for its queue to flush.
const WRITER_DRAIN: Duration = Duration::from_secs(2);

const READ_CHUNK: usize = 16 * 1024;

/// A per-connection session.
pub struct Session {
    relay: Arc<RelayServer>,
    stream: TcpStream,
    peer: SocketAddr,
}

impl Session {
    /// Create a new session for a connection.
    pub fn new(relay: Arc<RelayServer>, stream: TcpStream, peer: SocketAddr) -> Self {
        Self {
            relay,
            stream,
            peer,
        }
    }

    /// Run the session until the device disconnects or misbehaves.
    pub async fn run(self) -> Result<(), RelayError> {
        let Session {
            relay,
            stream,
            peer,
        } = self;
        let codec = FrameCodec::new(relay.config().limits.max_frame_len);
        let (read_half, mut write_half) = stream.into_split();
        let mut reader = FrameSource::new(read_half, codec);

        let hello_secs = relay.config().limits.hello_timeout_secs;
        let first = match tokio::time::timeout(Duration::from_secs(hello_secs), reader.next_frame())
            .await
        {
            Ok(frame) => {
                frame.inspect_err(|_| RelayMetrics::incr(&relay.metrics().protocol_errors))?
            }
            Err(_) => {
                tracing::warn!(peer = %peer, "no register within {}s", hello_secs);
                RelayMetrics::incr(&relay.metrics().protocol_errors);
                return Err(ProtocolError::HelloTimeout { secs: hello_secs }.into());
            }
        };
        let Some(first) = first else {
            tracing::debug!(peer = %peer, "connection closed before register");
            return Ok(());
        };

        let Some((device_id, device_name, force)) = parse_register(&first) else {
            RelayMetrics::incr(&relay.metrics().protocol_errors);
            let reply = error_frame(&codec, ErrorCode::NotRegistered, "register required first");
            if let Some(frame) = reply {
                let _ = write_half.write_all(&frame).await;
            }
            return Err(ProtocolError::NotRegistered.into());
        };

        let (outbound, queue) = mpsc::channel(OUTBOUND_QUEUE);
        let registration =
            match relay.register(device_id.clone(), device_name, outbound.clone(), force) {
                Ok(registration) => registration,
                Err(e) => {
                    RelayMetrics::incr(&relay.metrics().protocol_errors);
                    let reply = error_frame(&codec, ErrorCode::AlreadyRegistered, e.to_string());
                    if let Some(frame) = reply {
                        let _ = write_half.write_all(&frame).await;
                    }
                    return Err(e.into());
                }
            };
        tracing::info!(device = %device_id, peer = %peer, force, "device registered");

        let mut writer = tokio::spawn(write_loop(write_half, queue));
        let active = ActiveSession {
            relay: relay.clone(),
            device_id,
            codec,
            outbound,
        };
        let result = active.read_loop(&mut reader, registration.replaced).await;

        relay.unregister(&active.device_id, registration.token);
        tracing::info!(device = %active.device_id, "device disconnected");
        drop(active);
        if tokio::time::timeout(WRITER_DRAIN, &mut writer).await.is_err() {
            writer.abort();
        }

        result.map_err(RelayError::from)
    }
}

struct ActiveSession {
    relay: Arc<RelayServer>,
    device_id: DeviceId,
    codec: FrameCodec,
    outbound: mpsc::Sender<Frame>,
}

impl ActiveSession {
    async fn read_loop(
        &self,
        reader: &mut FrameSource,
        mut replaced: watch::Receiver<bool>,
    ) -> ProtocolResult<()> {
        loop {
            let frame = tokio::select! {
                frame = reader.next_frame() => frame,
                _ = replaced.changed() => {
                    return Err(ProtocolError::Replaced(self.device_id.clone()));
                }
            };
            match frame {
                Ok(Some(payload)) => self.handle_frame(payload),
                Ok(None) => return Ok(()),
                Err(e) => {
                    if matches!(e, ProtocolError::Wire(_)) {
                        RelayMetrics::incr(&self.relay.metrics().protocol_errors);
                        tracing::warn!(device = %self.device_id, error = %e, "closing connection");
                    }
                    return Err(e);
                }
            }
        }
    }

    fn handle_frame(&self, payload: Vec<u8>) {
        if let Err(e) = self.relay.rate_limits().check_message(&self.device_id) {
            RelayMetrics::incr(&self.relay.metrics().rate_limit_hits);
            tracing::warn!(device = %self.device_id, error = %e, "frame rate limited");
            self.reply(ErrorCode::RateLimited, e.to_string());
            return;
        }

        let envelope = match Envelope::from_json_bytes(&payload) {
            Ok(envelope) => envelope,
            Err(e) => {
                self.reject(format!("malformed envelope: {e}"));
                return;
            }
        };

        let (sender, target) = match &envelope.payload {
            Payload::Content(content) => (&content.device_id, content.target.as_ref()),
            Payload::Control(
                ControlMessage::PairingChallenge(sealed) | ControlMessage::PairingAck(sealed),
            ) => (&sealed.sender, Some(&sealed.target)),
            Payload::Control(other) => {
                self.reject(format!("{} is not relayed", other.action()));
                return;
            }
        };
        if *sender != self.device_id {
            tracing::warn!(
                device = %self.device_id,
                claimed = %sender,
                "sender does not match registration, dropping frame"
            );
            self.reject("sender does not match registered device".to_string());
            return;
        }

        let frame: Frame = match self.codec.encode(&payload) {
            Ok(frame) => frame.into(),
            Err(e) => {
                self.reject(e.to_string());
                return;
            }
        };
        match self.relay.route(&self.device_id, target, frame, payload.len()) {
            Route::Delivered(count) => tracing::debug!(
                device = %self.device_id,
                kind = envelope.msg_type.as_str(),
                recipients = count,
                "frame routed"
            ),
            Route::TargetOffline(target) => {
                tracing::warn!(
                    device = %self.device_id,
                    target = %target,
                    "target offline, dropping frame"
                );
                self.reply(ErrorCode::TargetOffline, format!("{target} is not connected"));
            }
        }
    }

    fn reject(&self, message: String) {
        RelayMetrics::incr(&self.relay.metrics().protocol_errors);
        tracing::debug!(device = %self.device_id, reason = %message, "frame rejected");
        self.reply(ErrorCode::InvalidMessage, message);
    }

    fn reply(&self, code: ErrorCode, message: impl Into<String>) {
        if let Some(frame) = error_frame(&self.codec, code, message) {
            let _ = self.outbound.try_send(frame);
        }
    }
}

fn parse_register(payload: &[u8]) -> Option<(DeviceId, Option<String>, bool)> {
    let envelope = Envelope::from_json_bytes(payload).ok()?;
    match envelope.control_message()? {
        ControlMessage::Register {
            device_id,
            device_name,
            force,
        } => Some((device_id.clone(), device_name.clone(), *force)),
        _ => None,
    }
}

fn error_frame(codec: &FrameCodec, code: ErrorCode, message: impl Into<String>) -> Option<Frame> {
    let envelope = Envelope::control(ControlMessage::Error {
        code,
        message: message.into(),
    });
    codec.encode_envelope(&envelope).ok().map(Frame::from)
}

async fn write_loop(mut writer: OwnedWriteHalf, mut queue: mpsc::Receiver<Frame>) {
    while let Some(frame) = queue.recv().await {
        if let Err(e) = writer.write_all(&frame).await {
            tracing::debug!(error = %e, "write failed, stopping writer");
            return;
        }
    }
    let _ = writer.shutdown().await;
}

struct FrameSource {
    inner: OwnedReadHalf,
    decoder: FrameDecoder,
    chunk: Vec<u8>,
}

impl FrameSource {
    fn new(inner: OwnedReadHalf, codec: FrameCodec) -> Self {
        Self {
            inner,
            decoder: FrameDecoder::new(codec.max_frame_len()),
            chunk: vec![0u8; READ_CHUNK],
        }
    }

    /// Next frame payload; `None` once the peer closes.
    async fn next_frame(&mut self) -> ProtocolResult<Option<Vec<u8>>> {
        loop {
            if let Some(frame) = self.decoder.next_frame()? {
                return Ok(Some(frame));
            }
            let n = self.inner.read(&mut self.chunk).await?;
            if n == 0 {
                return Ok(None);
            }
            self.decoder.extend(&self.chunk[..n]);
        }
    }
}
