//! In-memory loopback transport for session tests: the peer half scripts
//! the backend side of the conversation.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::{Mutex as AsyncMutex, mpsc};

use super::{Connector, Transport, TransportError, TransportEvent};

/// Create a connected transport/peer pair.
pub fn pair() -> (MockTransport, MockPeer) {
    let (out_tx, out_rx) = mpsc::unbounded_channel::<String>();
    let (event_tx, event_rx) = mpsc::unbounded_channel::<TransportEvent>();
    let connected = Arc::new(AtomicBool::new(true));
    let client_close = Arc::new(Mutex::new(None));

    let transport = MockTransport {
        out_tx,
        events: AsyncMutex::new(event_rx),
        event_tx: event_tx.clone(),
        connected: connected.clone(),
        client_close: client_close.clone(),
    };
    let peer = MockPeer {
        inbound: AsyncMutex::new(out_rx),
        to_client: event_tx,
        connected,
        client_close,
    };
    (transport, peer)
}

pub struct MockTransport {
    out_tx: mpsc::UnboundedSender<String>,
    events: AsyncMutex<mpsc::UnboundedReceiver<TransportEvent>>,
    event_tx: mpsc::UnboundedSender<TransportEvent>,
    connected: Arc<AtomicBool>,
    client_close: Arc<Mutex<Option<(u16, String)>>>,
}

#[async_trait]
impl Transport for MockTransport {
    async fn send(&self, frame: String) -> Result<(), TransportError> {
        if !self.connected.load(Ordering::SeqCst) {
            return Err(TransportError::ChannelClosed);
        }
        self.out_tx
            .send(frame)
            .map_err(|_| TransportError::ChannelClosed)
    }

    async fn recv(&self) -> Option<TransportEvent> {
        let mut events = self.events.lock().await;
        events.recv().await
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn close(&self, code: u16, reason: &str) {
        self.connected.store(false, Ordering::SeqCst);
        *self.client_close.lock().unwrap() = Some((code, reason.to_string()));
        // Locally initiated closure surfaces through the event stream the
        // same way a peer-initiated one does.
        let _ = self.event_tx.send(TransportEvent::Closed {
            code: Some(code),
            reason: reason.to_string(),
        });
    }
}

/// The scripted backend half of a [`pair`].
pub struct MockPeer {
    inbound: AsyncMutex<mpsc::UnboundedReceiver<String>>,
    to_client: mpsc::UnboundedSender<TransportEvent>,
    connected: Arc<AtomicBool>,
    client_close: Arc<Mutex<Option<(u16, String)>>>,
}

impl MockPeer {
    /// Next raw frame the client transmitted.
    pub async fn recv_frame(&self) -> Option<String> {
        let mut inbound = self.inbound.lock().await;
        inbound.recv().await
    }

    pub fn try_recv_frame(&self) -> Option<String> {
        self.inbound.try_lock().ok()?.try_recv().ok()
    }

    /// Deliver a raw text frame to the client.
    pub fn send_frame(&self, text: impl Into<String>) {
        let _ = self.to_client.send(TransportEvent::Frame(text.into()));
    }

    /// Deliver a JSON-encoded message to the client.
    pub fn send_json<T: Serialize>(&self, message: &T) {
        let text = serde_json::to_string(message).expect("serialize mock frame");
        self.send_frame(text);
    }

    /// Close the connection from the peer side with the given code.
    pub fn close(&self, code: u16, reason: &str) {
        self.connected.store(false, Ordering::SeqCst);
        let _ = self.to_client.send(TransportEvent::Closed {
            code: Some(code),
            reason: reason.to_string(),
        });
    }

    /// Close code the client used, when the client initiated closure.
    pub fn client_close(&self) -> Option<(u16, String)> {
        self.client_close.lock().unwrap().clone()
    }
}

/// Connector returning pre-scripted transports in order, one per attempt.
#[derive(Default)]
pub struct MockConnector {
    scripted: Mutex<VecDeque<MockTransport>>,
    attempts: AtomicUsize,
}

impl MockConnector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, transport: MockTransport) {
        self.scripted.lock().unwrap().push_back(transport);
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Connector for MockConnector {
    async fn connect(&self) -> Result<Box<dyn Transport>, TransportError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        let next = self.scripted.lock().unwrap().pop_front();
        match next {
            Some(transport) => Ok(Box::new(transport)),
            None => Err(TransportError::Setup("no transport scripted".into())),
        }
    }
}
