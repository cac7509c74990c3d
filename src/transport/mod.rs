use futures_util::{SinkExt, StreamExt};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::Message as WsMessage};

/// Close code reported when the connection drops without a close frame.
const ABNORMAL_CLOSURE: u16 = 1006;

/// Connectivity callbacks, delivered in order over one channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    Connected,
    ConnectionError(String),
    Closed {
        code: u16,
        reason: String,
        clean: bool,
    },
    Message(String),
}

pub type TransportEventSender = mpsc::UnboundedSender<TransportEvent>;
pub type TransportEventReceiver = mpsc::UnboundedReceiver<TransportEvent>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    NotConnected,
    Connect(String),
    Send(String),
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotConnected => write!(f, "transport is not connected"),
            Self::Connect(msg) => write!(f, "connect failed: {msg}"),
            Self::Send(msg) => write!(f, "send failed: {msg}"),
        }
    }
}

impl std::error::Error for TransportError {}

/// A duplex text transport. None of these calls may block: results of
/// `connect` and inbound traffic arrive later as [`TransportEvent`]s.
pub trait Transport: Send {
    fn connect(&mut self, address: &str) -> Result<(), TransportError>;
    fn send(&mut self, payload: String) -> Result<(), TransportError>;
    fn close(&mut self);
    fn is_connected(&self) -> bool;
}

enum Outbound {
    Text(String),
    Close,
}

struct Link {
    outbound: mpsc::UnboundedSender<Outbound>,
    connected: Arc<AtomicBool>,
}

/// WebSocket transport. Each `connect` spawns one I/O task on the current
/// tokio runtime; `close` retires it so none of its later events surface.
pub struct WsTransport {
    events: TransportEventSender,
    generation: Arc<AtomicU64>,
    link: Option<Link>,
}

impl WsTransport {
    pub fn new(events: TransportEventSender) -> Self {
        Self {
            events,
            generation: Arc::new(AtomicU64::new(0)),
            link: None,
        }
    }
}

impl Transport for WsTransport {
    fn connect(&mut self, address: &str) -> Result<(), TransportError> {
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|_| TransportError::Connect("no tokio runtime".to_string()))?;
        self.close();

        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let connected = Arc::new(AtomicBool::new(false));
        let forwarder = EventForwarder {
            events: self.events.clone(),
            current: self.generation.clone(),
            generation,
        };

        runtime.spawn(run_connection(
            address.to_string(),
            outbound_rx,
            connected.clone(),
            forwarder,
        ));
        self.link = Some(Link {
            outbound: outbound_tx,
            connected,
        });
        Ok(())
    }

    fn send(&mut self, payload: String) -> Result<(), TransportError> {
        let link = self.link.as_ref().ok_or(TransportError::NotConnected)?;
        if !link.connected.load(Ordering::SeqCst) {
            return Err(TransportError::NotConnected);
        }
        link.outbound
            .send(Outbound::Text(payload))
            .map_err(|_| TransportError::Send("connection task has exited".to_string()))
    }

    fn close(&mut self) {
        if let Some(link) = self.link.take() {
            self.generation.fetch_add(1, Ordering::SeqCst);
            link.connected.store(false, Ordering::SeqCst);
            let _ = link.outbound.send(Outbound::Close);
        }
    }

    fn is_connected(&self) -> bool {
        self.link
            .as_ref()
            .map(|link| link.connected.load(Ordering::SeqCst))
            .unwrap_or(false)
    }
}

impl Drop for WsTransport {
    fn drop(&mut self) {
        self.close();
    }
}

struct EventForwarder {
    events: TransportEventSender,
    current: Arc<AtomicU64>,
    generation: u64,
}

impl EventForwarder {
    fn emit(&self, event: TransportEvent) -> bool {
        if self.current.load(Ordering::SeqCst) != self.generation {
            return false;
        }
        self.events.send(event).is_ok()
    }
}

async fn run_connection(
    address: String,
    mut outbound: mpsc::UnboundedReceiver<Outbound>,
    connected: Arc<AtomicBool>,
    forwarder: EventForwarder,
) {
    let stream = match connect_async(address.as_str()).await {
        Ok((stream, _response)) => stream,
        Err(err) => {
            tracing::debug!(address = %address, error = %err, "websocket connect failed");
            forwarder.emit(TransportEvent::ConnectionError(err.to_string()));
            return;
        }
    };
    let (mut sink, mut inbound) = stream.split();
    connected.store(true, Ordering::SeqCst);
    forwarder.emit(TransportEvent::Connected);

    let closed = loop {
        tokio::select! {
            out = outbound.recv() => match out {
                Some(Outbound::Text(text)) => {
                    if let Err(err) = sink.send(WsMessage::Text(text)).await {
                        break TransportEvent::Closed {
                            code: ABNORMAL_CLOSURE,
                            reason: err.to_string(),
                            clean: false,
                        };
                    }
                }
                Some(Outbound::Close) | None => {
                    connected.store(false, Ordering::SeqCst);
                    let _ = sink.send(WsMessage::Close(None)).await;
                    let _ = sink.close().await;
                    tracing::debug!(address = %address, "websocket closed locally");
                    return;
                }
            },
            incoming = inbound.next() => match incoming {
                Some(Ok(WsMessage::Text(text))) => {
                    forwarder.emit(TransportEvent::Message(text));
                }
                Some(Ok(WsMessage::Binary(bytes))) => match String::from_utf8(bytes) {
                    Ok(text) => {
                        forwarder.emit(TransportEvent::Message(text));
                    }
                    Err(_) => tracing::warn!("dropping non-utf8 binary frame"),
                },
                Some(Ok(WsMessage::Close(frame))) => {
                    let (code, reason) = frame
                        .map(|frame| (u16::from(frame.code), frame.reason.to_string()))
                        .unwrap_or((1005, String::new()));
                    break TransportEvent::Closed {
                        code,
                        reason,
                        clean: true,
                    };
                }
                Some(Ok(_)) => {}
                Some(Err(err)) => {
                    break TransportEvent::Closed {
                        code: ABNORMAL_CLOSURE,
                        reason: err.to_string(),
                        clean: false,
                    };
                }
                None => {
                    break TransportEvent::Closed {
                        code: ABNORMAL_CLOSURE,
                        reason: "stream ended".to_string(),
                        clean: false,
                    };
                }
            },
        }
    };

    connected.store(false, Ordering::SeqCst);
    forwarder.emit(closed);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn send_before_connect_is_rejected() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut transport = WsTransport::new(tx);
        assert!(!transport.is_connected());
        assert_eq!(
            transport.send("[]".to_string()),
            Err(TransportError::NotConnected)
        );
    }

    #[tokio::test]
    async fn refused_connection_reports_connection_error() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut transport = WsTransport::new(tx);
        transport.connect(&format!("ws://{addr}")).unwrap();

        let event = tokio::time::timeout(std::time::Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(event, TransportEvent::ConnectionError(_)));
        assert!(!transport.is_connected());
    }

    #[tokio::test]
    async fn closed_attempt_emits_nothing() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut transport = WsTransport::new(tx);
        transport.connect(&format!("ws://{addr}")).unwrap();
        transport.close();

        let event = tokio::time::timeout(std::time::Duration::from_millis(300), rx.recv()).await;
        assert!(event.is_err(), "retired connection leaked {event:?}");
    }
}
