//! Peer sessions: connection lifecycle, handshake driving and the
//! per-peer message loop.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use socket2::{SockRef, TcpKeepalive};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

use xds_primitives::NetworkParams;
use xds_runtime::NodeLifetime;

use xds_runtime::EventBus;

use crate::error::NetworkError;
use crate::events::PeerEvent;
use crate::framing::FramedStream;
use crate::handshake::{Handshake, Negotiated};
use crate::message::NetworkMessage;
use crate::PeerId;

static NEXT_PEER_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Inbound,
    Outbound,
}

/// Connection lifecycle of a peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerState {
    Created,
    Connecting,
    HandShaked,
    Disconnecting,
    Offline,
    Failed,
}

/// Shared, read-mostly view of one peer.
pub struct PeerHandle {
    pub id: PeerId,
    pub addr: SocketAddr,
    pub direction: Direction,
    state: RwLock<PeerState>,
    negotiated: RwLock<Option<Negotiated>>,
    outbox: mpsc::Sender<NetworkMessage>,
}

impl PeerHandle {
    pub fn state(&self) -> PeerState {
        *self.state.read().expect("lock is never poisoned")
    }

    fn set_state(&self, state: PeerState) {
        *self.state.write().expect("lock is never poisoned") = state;
    }

    pub fn negotiated(&self) -> Option<Negotiated> {
        self.negotiated
            .read()
            .expect("lock is never poisoned")
            .clone()
    }

    pub fn supports_proven_headers(&self) -> bool {
        self.negotiated()
            .map(|n| n.supports_proven_headers)
            .unwrap_or(false)
    }

    pub fn start_height(&self) -> i32 {
        self.negotiated().map(|n| n.start_height).unwrap_or(0)
    }

    /// Queue a message for the peer's writer. Fails quietly once the
    /// session is gone.
    pub async fn send(&self, message: NetworkMessage) {
        if self.outbox.send(message).await.is_err() {
            trace!(peer = self.id, "send after session closed");
        }
    }

    pub fn try_send(&self, message: NetworkMessage) {
        if self.outbox.try_send(message).is_err() {
            trace!(peer = self.id, "outbox full or closed, message dropped");
        }
    }

    /// Ask the session loop to wind the connection down.
    pub fn request_disconnect(&self) {
        self.set_state(PeerState::Disconnecting);
    }

    /// A handle with no live session behind it; messages queued on it
    /// go nowhere. Used by behavior tests and tooling.
    pub fn detached(id: PeerId, addr: SocketAddr, direction: Direction) -> Arc<PeerHandle> {
        let (outbox, _closed) = mpsc::channel(1);

        Arc::new(PeerHandle {
            id,
            addr,
            direction,
            state: RwLock::new(PeerState::Created),
            negotiated: RwLock::new(None),
            outbox,
        })
    }
}

/// Handles every message a session produces.
pub trait MessageDispatcher: Send + 'static {
    /// React to one inbound message; returned messages are written
    /// back to the same peer.
    fn dispatch(&mut self, peer: &Arc<PeerHandle>, message: NetworkMessage)
        -> Vec<NetworkMessage>;

    /// The session ended; release per-peer state.
    fn disconnected(&mut self, peer: &Arc<PeerHandle>) {
        let _ = peer;
    }
}

/// A fully handshaked session ready to run its message loop.
pub struct PeerSession {
    handle: Arc<PeerHandle>,
    framed: FramedStream,
    outbox_rx: mpsc::Receiver<NetworkMessage>,
    events: Option<Arc<EventBus<PeerEvent>>>,
}

const OUTBOX_DEPTH: usize = 64;

fn fresh_nonce() -> u64 {
    rand::random()
}

fn apply_keepalive(stream: &TcpStream) {
    let keepalive = TcpKeepalive::new().with_time(Duration::from_secs(60));
    if let Err(err) = SockRef::from(stream).set_tcp_keepalive(&keepalive) {
        warn!(?err, "failed to set TCP keepalive");
    }
}

impl PeerSession {
    /// Dial out and complete the handshake.
    pub async fn connect(
        addr: SocketAddr,
        params: NetworkParams,
        local_height: i32,
        lifetime: &NodeLifetime,
    ) -> Result<Self, NetworkError> {
        let stream = tokio::select! {
            connected = TcpStream::connect(addr) => connected?,
            _ = lifetime.cancelled() => return Err(xds_runtime::Cancelled.into()),
        };

        apply_keepalive(&stream);
        let framed = FramedStream::new(stream, params.magic);

        Self::establish(framed, addr, Direction::Outbound, params, local_height, lifetime).await
    }

    /// Accept one inbound connection and complete the handshake.
    pub async fn accept(
        listener: &TcpListener,
        params: NetworkParams,
        local_height: i32,
        lifetime: &NodeLifetime,
    ) -> Result<Self, NetworkError> {
        let (stream, addr) = tokio::select! {
            accepted = listener.accept() => accepted?,
            _ = lifetime.cancelled() => return Err(xds_runtime::Cancelled.into()),
        };

        apply_keepalive(&stream);
        let framed = FramedStream::new(stream, params.magic);

        Self::establish(framed, addr, Direction::Inbound, params, local_height, lifetime).await
    }

    async fn establish(
        mut framed: FramedStream,
        addr: SocketAddr,
        direction: Direction,
        params: NetworkParams,
        local_height: i32,
        lifetime: &NodeLifetime,
    ) -> Result<Self, NetworkError> {
        let mut handshake = Handshake::new(
            params,
            direction,
            addr,
            local_height,
            fresh_nonce(),
        );

        loop {
            for message in handshake.drain_outbound() {
                framed
                    .write_frame(message.command(), &message.payload())
                    .await?;
            }

            if handshake.is_done() {
                break;
            }

            let (command, payload) = tokio::select! {
                frame = framed.read_frame() => frame?,
                _ = lifetime.cancelled() => return Err(xds_runtime::Cancelled.into()),
            };

            let message = NetworkMessage::from_wire(&command, &payload)?;
            handshake.on_message(message, addr)?;
        }

        let negotiated = handshake
            .negotiated()
            .expect("handshake is done");

        let (outbox_tx, outbox_rx) = mpsc::channel(OUTBOX_DEPTH);

        let handle = Arc::new(PeerHandle {
            id: NEXT_PEER_ID.fetch_add(1, Ordering::Relaxed),
            addr,
            direction,
            state: RwLock::new(PeerState::HandShaked),
            negotiated: RwLock::new(Some(negotiated)),
            outbox: outbox_tx,
        });

        debug!(peer = handle.id, %addr, ?direction, "peer handshaked");

        Ok(Self {
            handle,
            framed,
            outbox_rx,
            events: None,
        })
    }

    /// Attach the peer event bus; traffic and lifecycle events are
    /// published through it.
    pub fn with_events(mut self, events: Arc<EventBus<PeerEvent>>) -> Self {
        self.events = Some(events);
        self
    }

    fn publish(&self, event: PeerEvent) {
        if let Some(events) = &self.events {
            events.publish(event);
        }
    }

    pub fn handle(&self) -> Arc<PeerHandle> {
        self.handle.clone()
    }

    /// Run the session until disconnect or shutdown.
    pub async fn run(
        mut self,
        dispatcher: &mut dyn MessageDispatcher,
        lifetime: &NodeLifetime,
    ) -> Result<(), NetworkError> {
        self.publish(PeerEvent::Connected {
            peer: self.handle.id,
            addr: self.handle.addr,
            direction: self.handle.direction,
        });

        let result = self.message_loop(dispatcher, lifetime).await;

        let final_state = match &result {
            Ok(()) => PeerState::Offline,
            Err(NetworkError::Cancelled(_)) => PeerState::Disconnecting,
            Err(_) => PeerState::Failed,
        };
        self.handle.set_state(final_state);

        self.publish(PeerEvent::Disconnected {
            peer: self.handle.id,
            addr: self.handle.addr,
        });

        dispatcher.disconnected(&self.handle);
        debug!(peer = self.handle.id, ?final_state, "peer session ended");

        result
    }

    async fn write_message(&mut self, message: &NetworkMessage) -> Result<(), NetworkError> {
        match self
            .framed
            .write_frame(message.command(), &message.payload())
            .await
        {
            Ok(()) => {
                self.publish(PeerEvent::MessageSent {
                    peer: self.handle.id,
                    command: message.command(),
                });
                Ok(())
            }
            Err(err) => {
                self.publish(PeerEvent::SendFailure {
                    peer: self.handle.id,
                    command: message.command(),
                });
                Err(err)
            }
        }
    }

    async fn message_loop(
        &mut self,
        dispatcher: &mut dyn MessageDispatcher,
        lifetime: &NodeLifetime,
    ) -> Result<(), NetworkError> {
        loop {
            tokio::select! {
                frame = self.framed.read_frame() => {
                    let (command, payload) = match frame {
                        Ok(frame) => frame,
                        Err(NetworkError::ConnectionClosed) => return Ok(()),
                        Err(err) => return Err(err),
                    };

                    let message = NetworkMessage::from_wire(&command, &payload)?;
                    trace!(peer = self.handle.id, command = message.command(), "dispatching");

                    self.publish(PeerEvent::MessageReceived {
                        peer: self.handle.id,
                        command: message.command(),
                    });

                    for reply in dispatcher.dispatch(&self.handle, message) {
                        self.write_message(&reply).await?;
                    }

                    if self.handle.state() == PeerState::Disconnecting {
                        return Ok(());
                    }
                }
                queued = self.outbox_rx.recv() => {
                    match queued {
                        Some(message) => {
                            self.write_message(&message).await?;
                        }
                        None => return Ok(()),
                    }
                }
                _ = lifetime.cancelled() => {
                    return Err(xds_runtime::Cancelled.into());
                }
            }
        }
    }
}
