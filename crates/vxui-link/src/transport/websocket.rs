use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{Mutex as AsyncMutex, mpsc};
use tokio_tungstenite::{
    MaybeTlsStream, WebSocketStream, connect_async,
    tungstenite::Message,
    tungstenite::protocol::frame::coding::CloseCode,
    tungstenite::protocol::CloseFrame,
};
use url::Url;

use super::{Connector, Transport, TransportError, TransportEvent};

/// Dials the backend WebSocket endpoint, one fresh stream per attempt.
pub struct WebSocketConnector {
    url: String,
    connect_timeout: Duration,
}

impl WebSocketConnector {
    pub fn new(url: impl Into<String>, connect_timeout: Duration) -> Self {
        Self {
            url: url.into(),
            connect_timeout,
        }
    }
}

#[async_trait]
impl Connector for WebSocketConnector {
    async fn connect(&self) -> Result<Box<dyn Transport>, TransportError> {
        let url = Url::parse(&self.url)
            .map_err(|err| TransportError::Setup(format!("invalid endpoint '{}': {err}", self.url)))?;
        let connect = connect_async(url.as_str());
        let (stream, _) = tokio::time::timeout(self.connect_timeout, connect)
            .await
            .map_err(|_| TransportError::Timeout)?
            .map_err(|err| TransportError::Setup(format!("websocket connect failed: {err}")))?;
        tracing::debug!(target = "link", url = %url, "websocket connected");
        Ok(Box::new(WebSocketTransport::spawn(stream)))
    }
}

/// WebSocket-backed [`Transport`]: the stream is split into reader and
/// writer tasks bridged by unbounded channels.
pub struct WebSocketTransport {
    out_tx: mpsc::UnboundedSender<Message>,
    events: AsyncMutex<mpsc::UnboundedReceiver<TransportEvent>>,
    connected: Arc<AtomicBool>,
    tasks: Vec<tokio::task::JoinHandle<()>>,
}

impl WebSocketTransport {
    fn spawn(stream: WebSocketStream<MaybeTlsStream<TcpStream>>) -> Self {
        let (mut ws_write, mut ws_read) = stream.split();
        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Message>();
        let (event_tx, event_rx) = mpsc::unbounded_channel::<TransportEvent>();
        let connected = Arc::new(AtomicBool::new(true));

        let writer_connected = connected.clone();
        let writer = tokio::spawn(async move {
            while let Some(message) = out_rx.recv().await {
                if ws_write.send(message).await.is_err() {
                    break;
                }
            }
            writer_connected.store(false, Ordering::SeqCst);
        });

        let reader_connected = connected.clone();
        let reader = tokio::spawn(async move {
            while let Some(message) = ws_read.next().await {
                match message {
                    Ok(Message::Text(text)) => {
                        if event_tx.send(TransportEvent::Frame(text)).is_err() {
                            break;
                        }
                    }
                    Ok(Message::Binary(data)) => {
                        // Some backends frame JSON as binary; same payload.
                        if let Ok(text) = String::from_utf8(data) {
                            if event_tx.send(TransportEvent::Frame(text)).is_err() {
                                break;
                            }
                        }
                    }
                    Ok(Message::Close(frame)) => {
                        let (code, reason) = match frame {
                            Some(frame) => (Some(u16::from(frame.code)), frame.reason.to_string()),
                            None => (None, String::new()),
                        };
                        let _ = event_tx.send(TransportEvent::Closed { code, reason });
                        break;
                    }
                    Ok(_) => {}
                    Err(err) => {
                        tracing::debug!(target = "link", "websocket read error: {err}");
                        let _ = event_tx.send(TransportEvent::Closed {
                            code: None,
                            reason: err.to_string(),
                        });
                        break;
                    }
                }
            }
            reader_connected.store(false, Ordering::SeqCst);
        });

        Self {
            out_tx,
            events: AsyncMutex::new(event_rx),
            connected,
            tasks: vec![writer, reader],
        }
    }
}

#[async_trait]
impl Transport for WebSocketTransport {
    async fn send(&self, frame: String) -> Result<(), TransportError> {
        self.out_tx
            .send(Message::Text(frame))
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
        let frame = CloseFrame {
            code: CloseCode::from(code),
            reason: reason.to_string().into(),
        };
        let _ = self.out_tx.send(Message::Close(Some(frame)));
    }
}

impl Drop for WebSocketTransport {
    fn drop(&mut self) {
        for task in self.tasks.drain(..) {
            task.abort();
        }
    }
}
