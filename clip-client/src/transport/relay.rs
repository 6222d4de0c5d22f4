//! Relay client transport.
//!
//! Holds one TCP connection to the relay server. The connection lifecycle is
//! driven by the pure [`ConnectionState`] machine from `clipsync-core`: this
//! module only executes the [`Action`]s it returns and feeds back the
//! resulting [`Event`]s.
//!
//! The relay forwards frames verbatim and routes by the `target` field inside
//! the envelope, so `send` only needs the link to be registered.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use clipsync_core::{
    Action, ConnectionEvent, ConnectionState, Event, Liveness, PeerConnectionRecord,
    TransportKind,
};
use clipsync_types::{ControlMessage, DeviceId, Envelope, FrameCodec, DEFAULT_MAX_FRAME_LEN};
use dashmap::DashMap;
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::framed::{write_envelope, write_frame, FrameReader};
use super::{InboundFrame, Transport, TransportError, EVENT_CHANNEL_CAPACITY};

const OUTBOUND_QUEUE: usize = 256;

/// Relay client settings.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Relay address, `host:port`.
    pub addr: String,
    /// Name sent in the register frame.
    pub device_name: Option<String>,
    /// Largest frame accepted or sent.
    pub max_frame_len: usize,
    /// Budget for TCP connect.
    pub connect_timeout: Duration,
    /// Ask the relay to drop any live session holding this device id.
    pub force_register: bool,
}

impl RelayConfig {
    /// Settings for the relay at `addr`.
    pub fn new(addr: impl Into<String>) -> Self {
        Self {
            addr: addr.into(),
            device_name: None,
            max_frame_len: DEFAULT_MAX_FRAME_LEN,
            connect_timeout: Duration::from_secs(5),
            force_register: false,
        }
    }

    /// Set the name announced at registration.
    pub fn with_device_name(mut self, name: impl Into<String>) -> Self {
        self.device_name = Some(name.into());
        self
    }

    /// Take over an existing relay session for this device id.
    pub fn with_force_register(mut self, force: bool) -> Self {
        self.force_register = force;
        self
    }

    /// Set the maximum frame length.
    pub fn with_max_frame_len(mut self, max: usize) -> Self {
        self.max_frame_len = max;
        self
    }
}

struct RelayInner {
    local_id: DeviceId,
    config: RelayConfig,
    codec: FrameCodec,
    state: Mutex<ConnectionState>,
    outbound: Mutex<Option<mpsc::Sender<Vec<u8>>>>,
    records: DashMap<DeviceId, PeerConnectionRecord>,
    events: broadcast::Sender<ConnectionEvent>,
    inbound: mpsc::Sender<InboundFrame>,
    shutdown: watch::Sender<bool>,
}

/// Link to a relay server with automatic reconnect.
#[derive(Clone)]
pub struct RelayTransport {
    inner: Arc<RelayInner>,
}

impl RelayTransport {
    /// Create an idle transport. Call [`start`](Self::start) to connect.
    pub fn new(local_id: DeviceId, config: RelayConfig, inbound: mpsc::Sender<InboundFrame>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let (shutdown, _) = watch::channel(false);
        let codec = FrameCodec::new(config.max_frame_len);
        Self {
            inner: Arc::new(RelayInner {
                local_id,
                config,
                codec,
                state: Mutex::new(ConnectionState::new()),
                outbound: Mutex::new(None),
                records: DashMap::new(),
                events,
                inbound,
                shutdown,
            }),
        }
    }

    /// Spawn the connection driver.
    pub fn start(&self) -> JoinHandle<()> {
        let inner = self.inner.clone();
        let shutdown = self.inner.shutdown.subscribe();
        tokio::spawn(async move { inner.drive(shutdown).await })
    }

    /// Ask the driver to disconnect and stop reconnecting.
    pub fn shutdown(&self) {
        let _ = self.inner.shutdown.send(true);
    }

    /// Current link state.
    pub fn state(&self) -> ConnectionState {
        self.inner.current_state()
    }

    /// Whether the link is registered.
    pub fn is_connected(&self) -> bool {
        self.inner.current_state().is_connected()
    }
}

enum SessionEnd {
    Lost(String),
    Shutdown,
}

impl RelayInner {
    fn current_state(&self) -> ConnectionState {
        self.state
            .lock()
            .map(|s| s.clone())
            .unwrap_or_else(|e| e.into_inner().clone())
    }

    fn apply(&self, event: Event) -> Vec<Action> {
        let mut guard = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let (next, actions) = std::mem::take(&mut *guard).on_event(event);
        *guard = next;
        actions
    }

    fn set_outbound(&self, outbound: Option<mpsc::Sender<Vec<u8>>>) {
        *self.outbound.lock().unwrap_or_else(|e| e.into_inner()) = outbound;
    }

    fn outbound(&self) -> Option<mpsc::Sender<Vec<u8>>> {
        self.outbound
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    async fn drive(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut stream: Option<TcpStream> = None;
        let mut session_rx: Option<mpsc::Receiver<Vec<u8>>> = None;
        let mut next = Some(Event::ConnectRequested);

        while let Some(event) = next.take() {
            for action in self.apply(event) {
                match action {
                    Action::Connect => {
                        next = Some(match self.connect().await {
                            Ok(s) => {
                                stream = Some(s);
                                Event::ConnectSucceeded
                            }
                            Err(e) => Event::ConnectFailed {
                                error: e.to_string(),
                            },
                        });
                    }
                    Action::SendRegister => {
                        next = Some(match stream.as_mut() {
                            Some(s) => match self.register(s).await {
                                Ok(()) => {
                                    // Open the send queue before anyone can observe `Connected`.
                                    let (tx, rx) = mpsc::channel(OUTBOUND_QUEUE);
                                    self.set_outbound(Some(tx));
                                    session_rx = Some(rx);
                                    Event::Registered
                                }
                                Err(e) => {
                                    stream = None;
                                    Event::RegisterFailed {
                                        error: e.to_string(),
                                    }
                                }
                            },
                            None => Event::RegisterFailed {
                                error: "no connection".into(),
                            },
                        });
                    }
                    Action::StartReconnectTimer { delay } => {
                        debug!(delay_ms = delay.as_millis() as u64, "relay reconnect scheduled");
                        next = Some(tokio::select! {
                            _ = tokio::time::sleep(delay) => Event::ReconnectTimer,
                            _ = shutdown.changed() => Event::DisconnectRequested,
                        });
                    }
                    Action::Disconnect => {
                        stream = None;
                        session_rx = None;
                        self.set_outbound(None);
                    }
                    Action::CancelReconnect => {}
                    Action::Emit(event) => {
                        match &event {
                            ConnectionEvent::RelayConnected => {
                                info!(addr = %self.config.addr, "relay connected")
                            }
                            ConnectionEvent::RelayDisconnected { reason } => {
                                warn!(reason = %reason, "relay disconnected")
                            }
                            ConnectionEvent::RelayReconnectFailed { attempt, error } => {
                                warn!(attempt, error = %error, "relay connect failed")
                            }
                            _ => {}
                        }
                        let _ = self.events.send(event);
                    }
                }
            }

            if next.is_none() && self.current_state().is_connected() {
                if let (Some(s), Some(rx)) = (stream.take(), session_rx.take()) {
                    next = Some(match self.run_session(s, rx, &mut shutdown).await {
                        SessionEnd::Lost(reason) => Event::Disconnected { reason },
                        SessionEnd::Shutdown => Event::DisconnectRequested,
                    });
                }
            }
            if next.is_none()
                && *shutdown.borrow()
                && self.current_state() != ConnectionState::Disconnected
            {
                next = Some(Event::DisconnectRequested);
            }
        }
        debug!("relay driver stopped");
    }

    async fn connect(&self) -> Result<TcpStream, TransportError> {
        let stream = tokio::time::timeout(
            self.config.connect_timeout,
            TcpStream::connect(&self.config.addr),
        )
        .await
        .map_err(|_| TransportError::Timeout)?
        .map_err(|e| TransportError::ConnectionFailed(e.to_string()))?;
        let _ = stream.set_nodelay(true);
        Ok(stream)
    }

    async fn register(&self, stream: &mut TcpStream) -> Result<(), TransportError> {
        let register = ControlMessage::Register {
            device_id: self.local_id.clone(),
            device_name: self.config.device_name.clone(),
            force: self.config.force_register,
        };
        write_envelope(stream, &self.codec, &Envelope::control(register)).await
    }

    async fn run_session(
        &self,
        stream: TcpStream,
        mut rx: mpsc::Receiver<Vec<u8>>,
        shutdown: &mut watch::Receiver<bool>,
    ) -> SessionEnd {
        let (read, mut write) = stream.into_split();
        let mut reader = FrameReader::new(read, self.config.max_frame_len);

        let end = loop {
            tokio::select! {
                frame = reader.next_frame() => match frame {
                    Ok(Some(payload)) => {
                        let frame = InboundFrame {
                            kind: TransportKind::Relay,
                            peer: None,
                            payload,
                        };
                        if self.inbound.send(frame).await.is_err() {
                            break SessionEnd::Shutdown;
                        }
                    }
                    Ok(None) => break SessionEnd::Lost("relay closed connection".into()),
                    Err(e) => break SessionEnd::Lost(e.to_string()),
                },
                Some(payload) = rx.recv() => {
                    if let Err(e) = write_frame(&mut write, &self.codec, &payload).await {
                        break SessionEnd::Lost(e.to_string());
                    }
                }
                _ = shutdown.changed() => break SessionEnd::Shutdown,
            }
        };

        self.set_outbound(None);
        for mut record in self.records.iter_mut() {
            record.set(Liveness::Down);
        }
        end
    }

    fn mark(&self, peer: &DeviceId, liveness: Liveness) {
        self.records
            .entry(peer.clone())
            .or_insert_with(|| PeerConnectionRecord::connecting(peer.clone(), TransportKind::Relay))
            .set(liveness);
    }
}

#[async_trait]
impl Transport for RelayTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Relay
    }

    fn can_reach(&self, _peer: &DeviceId) -> bool {
        self.is_connected()
    }

    async fn send(&self, peer: &DeviceId, payload: &[u8]) -> Result<(), TransportError> {
        let max = self.inner.codec.max_frame_len();
        if payload.len() > max {
            return Err(TransportError::FrameTooLarge {
                len: payload.len(),
                max,
            });
        }
        let Some(outbound) = self.inner.outbound() else {
            self.inner.mark(peer, Liveness::Down);
            return Err(TransportError::NotConnected);
        };
        match outbound.send(payload.to_vec()).await {
            Ok(()) => {
                self.inner.mark(peer, Liveness::Up);
                Ok(())
            }
            Err(_) => {
                self.inner.mark(peer, Liveness::Down);
                Err(TransportError::ConnectionClosed)
            }
        }
    }

    fn subscribe(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.inner.events.subscribe()
    }

    fn records(&self) -> Vec<PeerConnectionRecord> {
        self.inner.records.iter().map(|e| e.value().clone()).collect()
    }
}
