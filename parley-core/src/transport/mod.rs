//! Duplex message channel to the remote model.
//!
//! A [`Connector`] performs the handshake and returns a [`RemoteLink`]: a
//! bounded sender for captured audio, a receiver of [`TransportEvent`]s, and
//! a close signal. Everything past the handshake is message passing, so the
//! session never sees sockets. [`LiveConnector`] speaks the Gemini Live
//! websocket protocol; [`memory_link`] wires a session to an in-process peer.

pub mod websocket;

pub use websocket::LiveConnector;

use std::future::Future;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};

use crate::{
    error::{ParleyError, Result},
    protocol::{RealtimeInput, ServerMessage},
};

/// Inbound events the link buffers before the reader is backpressured.
pub const INBOUND_CAPACITY: usize = 64;

pub const DEFAULT_LIVE_URL: &str = "wss://generativelanguage.googleapis.com/ws/google.ai.generativelanguage.v1beta.GenerativeService.BidiGenerateContent";
pub const DEFAULT_MODEL: &str = "gemini-2.5-flash-native-audio-preview-09-2025";
pub const DEFAULT_VOICE: &str = "Kore";

/// Everything that can arrive from the remote after the handshake.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    Message(ServerMessage),
    /// The remote closed the channel.
    Closed { reason: Option<String> },
    /// The channel failed; no further events follow.
    Error(String),
}

/// Model and voice requested in the session handshake.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionSetup {
    pub model: String,
    pub voice_name: Option<String>,
    pub system_instruction: Option<String>,
}

impl Default for SessionSetup {
    fn default() -> Self {
        Self {
            model: DEFAULT_MODEL.into(),
            voice_name: Some(DEFAULT_VOICE.into()),
            system_instruction: None,
        }
    }
}

/// Where and how to reach the remote model.
#[derive(Debug, Clone)]
pub struct RemoteEndpoint {
    pub url: String,
    pub api_key: Option<String>,
    pub setup: SessionSetup,
    /// Bound on socket connect plus setup acknowledgement.
    pub connect_timeout: Duration,
    /// Capacity of the outbound audio queue handed to capture.
    pub outbound_queue: usize,
}

impl Default for RemoteEndpoint {
    fn default() -> Self {
        Self {
            url: DEFAULT_LIVE_URL.into(),
            api_key: None,
            setup: SessionSetup::default(),
            connect_timeout: Duration::from_secs(10),
            outbound_queue: 8,
        }
    }
}

/// Fires the close signal of a link at most once.
#[derive(Debug)]
pub struct LinkCloser(Option<oneshot::Sender<()>>);

impl LinkCloser {
    /// Ask the link to close. Best-effort: a link that is already gone is
    /// not an error.
    pub fn close(&mut self) {
        if let Some(tx) = self.0.take() {
            let _ = tx.send(());
        }
    }

    pub fn is_closed(&self) -> bool {
        self.0.is_none()
    }
}

/// An established duplex channel.
#[derive(Debug)]
pub struct RemoteLink {
    pub outbound: mpsc::Sender<RealtimeInput>,
    pub inbound: mpsc::Receiver<TransportEvent>,
    closer: LinkCloser,
}

impl RemoteLink {
    pub fn new(
        outbound: mpsc::Sender<RealtimeInput>,
        inbound: mpsc::Receiver<TransportEvent>,
        close: oneshot::Sender<()>,
    ) -> Self {
        Self {
            outbound,
            inbound,
            closer: LinkCloser(Some(close)),
        }
    }

    pub fn close(&mut self) {
        self.closer.close();
    }

    pub fn into_parts(
        self,
    ) -> (
        mpsc::Sender<RealtimeInput>,
        mpsc::Receiver<TransportEvent>,
        LinkCloser,
    ) {
        (self.outbound, self.inbound, self.closer)
    }
}

/// Establishes links. Resolves once the remote has acknowledged the setup.
pub trait Connector: Send + Sync {
    fn connect(&self, endpoint: &RemoteEndpoint) -> impl Future<Output = Result<RemoteLink>> + Send;
}

/// The far end of an in-process link.
pub struct RemotePeer {
    received: mpsc::Receiver<RealtimeInput>,
    events: mpsc::Sender<TransportEvent>,
    close_rx: oneshot::Receiver<()>,
    released: bool,
}

impl RemotePeer {
    /// Next captured frame the session sent, or `None` once it stopped.
    pub async fn recv(&mut self) -> Option<RealtimeInput> {
        self.received.recv().await
    }

    pub fn try_recv(&mut self) -> Option<RealtimeInput> {
        self.received.try_recv().ok()
    }

    pub async fn send(&self, message: ServerMessage) -> bool {
        self.events.send(TransportEvent::Message(message)).await.is_ok()
    }

    /// Close from the remote side.
    pub async fn close(&self, reason: Option<&str>) -> bool {
        self.events
            .send(TransportEvent::Closed {
                reason: reason.map(str::to_owned),
            })
            .await
            .is_ok()
    }

    /// Fail the channel from the remote side.
    pub async fn fail(&self, error: &str) -> bool {
        self.events
            .send(TransportEvent::Error(error.to_owned()))
            .await
            .is_ok()
    }

    /// Whether the session has closed or dropped its end.
    pub fn is_released(&mut self) -> bool {
        if !self.released {
            self.released = !matches!(
                self.close_rx.try_recv(),
                Err(oneshot::error::TryRecvError::Empty)
            );
        }
        self.released
    }

    /// Wait until the session closes or drops its end.
    pub async fn released(&mut self) {
        if !self.released {
            let _ = (&mut self.close_rx).await;
            self.released = true;
        }
    }
}

/// A connected pair: the session's link and the remote's end of it.
pub fn memory_link(outbound_queue: usize) -> (RemoteLink, RemotePeer) {
    let (outbound_tx, outbound_rx) = mpsc::channel(outbound_queue.max(1));
    let (event_tx, event_rx) = mpsc::channel(INBOUND_CAPACITY);
    let (close_tx, close_rx) = oneshot::channel();
    (
        RemoteLink::new(outbound_tx, event_rx, close_tx),
        RemotePeer {
            received: outbound_rx,
            events: event_tx,
            close_rx,
            released: false,
        },
    )
}

enum Prepared {
    Link(RemoteLink),
    Refuse(String),
}

/// Connector handing out a prepared in-memory link, once.
pub struct MemoryConnector {
    prepared: Mutex<Option<Prepared>>,
    gate: tokio::sync::Mutex<Option<oneshot::Receiver<()>>>,
}

impl MemoryConnector {
    pub fn new(link: RemoteLink) -> Self {
        Self {
            prepared: Mutex::new(Some(Prepared::Link(link))),
            gate: tokio::sync::Mutex::new(None),
        }
    }

    /// A connector whose handshake always fails with `reason`.
    pub fn refusing(reason: impl Into<String>) -> Self {
        Self {
            prepared: Mutex::new(Some(Prepared::Refuse(reason.into()))),
            gate: tokio::sync::Mutex::new(None),
        }
    }

    /// Hold the handshake open until the returned sender fires (or drops).
    pub fn gated(link: RemoteLink) -> (Self, oneshot::Sender<()>) {
        let (open_tx, open_rx) = oneshot::channel();
        let connector = Self {
            prepared: Mutex::new(Some(Prepared::Link(link))),
            gate: tokio::sync::Mutex::new(Some(open_rx)),
        };
        (connector, open_tx)
    }
}

impl Connector for MemoryConnector {
    async fn connect(&self, _endpoint: &RemoteEndpoint) -> Result<RemoteLink> {
        if let Some(gate) = self.gate.lock().await.take() {
            let _ = gate.await;
        }
        match self.prepared.lock().take() {
            Some(Prepared::Link(link)) => Ok(link),
            Some(Prepared::Refuse(reason)) => Err(ParleyError::Transport(reason)),
            None => Err(ParleyError::Transport("memory link already used".into())),
        }
    }
}
