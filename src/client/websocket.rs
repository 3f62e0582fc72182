use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::time::interval;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{HeaderName, HeaderValue};
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::connect_async;
use tracing::warn;

use super::{ClientError, ClientResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Connected,
    Reconnecting,
    Disconnected,
}

impl From<u8> for ConnectionState {
    fn from(value: u8) -> Self {
        match value {
            0 => ConnectionState::Connecting,
            1 => ConnectionState::Connected,
            2 => ConnectionState::Reconnecting,
            _ => ConnectionState::Disconnected,
        }
    }
}

impl From<ConnectionState> for u8 {
    fn from(value: ConnectionState) -> Self {
        match value {
            ConnectionState::Connecting => 0,
            ConnectionState::Connected => 1,
            ConnectionState::Reconnecting => 2,
            ConnectionState::Disconnected => 3,
        }
    }
}

/// Per-attempt connection setup: fresh auth headers (Kalshi signatures are
/// timestamped) and the subscription payloads to replay after (re)connect.
pub struct ConnectSpec {
    pub url: String,
    pub headers: Box<dyn Fn() -> ClientResult<Vec<(&'static str, String)>> + Send + Sync>,
    pub on_connect: Box<dyn Fn() -> Vec<Message> + Send + Sync>,
}

impl ConnectSpec {
    pub fn public(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            headers: Box::new(|| Ok(Vec::new())),
            on_connect: Box::new(Vec::new),
        }
    }
}

pub struct WebSocketConnection {
    outbound_tx: mpsc::UnboundedSender<Message>,
    inbound_rx: mpsc::UnboundedReceiver<Message>,
    state: Arc<AtomicU8>,
}

impl WebSocketConnection {
    pub fn sender(&self) -> mpsc::UnboundedSender<Message> {
        self.outbound_tx.clone()
    }

    pub fn receiver(&mut self) -> &mut mpsc::UnboundedReceiver<Message> {
        &mut self.inbound_rx
    }

    pub fn state(&self) -> ConnectionState {
        self.state.load(Ordering::SeqCst).into()
    }
}

async fn handle_connection(
    spec: &ConnectSpec,
    outbound_rx: &mut mpsc::UnboundedReceiver<Message>,
    inbound_tx: &mpsc::UnboundedSender<Message>,
    state: &Arc<AtomicU8>,
) -> ClientResult<()> {
    let mut request = spec
        .url
        .as_str()
        .into_client_request()
        .map_err(ClientError::WebSocket)?;
    for (name, value) in (spec.headers)()? {
        let name = HeaderName::from_bytes(name.as_bytes())
            .map_err(|e| ClientError::Config(format!("bad header name: {e}")))?;
        let value = HeaderValue::from_str(&value)
            .map_err(|e| ClientError::Config(format!("bad header value: {e}")))?;
        request.headers_mut().insert(name, value);
    }

    let (ws_stream, _) = connect_async(request).await?;
    state.store(ConnectionState::Connected.into(), Ordering::SeqCst);

    let (mut write, mut read) = ws_stream.split();

    // Replay subscriptions on every (re)connect.
    for msg in (spec.on_connect)() {
        write.send(msg).await?;
    }

    let mut heartbeat = interval(Duration::from_secs(10));

    loop {
        tokio::select! {
            Some(msg) = outbound_rx.recv() => {
                if let Err(err) = write.send(msg).await {
                    state.store(ConnectionState::Reconnecting.into(), Ordering::SeqCst);
                    return Err(ClientError::WebSocket(err));
                }
            }
            maybe_msg = read.next() => {
                match maybe_msg {
                    Some(Ok(msg)) => {
                        if inbound_tx.send(msg).is_err() {
                            // Receiver dropped; treat as graceful shutdown.
                            state.store(ConnectionState::Disconnected.into(), Ordering::SeqCst);
                            return Ok(());
                        }
                    }
                    Some(Err(err)) => {
                        state.store(ConnectionState::Reconnecting.into(), Ordering::SeqCst);
                        return Err(ClientError::WebSocket(err));
                    }
                    None => {
                        state.store(ConnectionState::Reconnecting.into(), Ordering::SeqCst);
                        return Ok(());
                    }
                }
            }
            _ = heartbeat.tick() => {
                if let Err(err) = write.send(Message::Text("PING".to_string())).await {
                    state.store(ConnectionState::Reconnecting.into(), Ordering::SeqCst);
                    return Err(ClientError::WebSocket(err));
                }
            }
        }
    }
}

/// Connect to a venue websocket with automatic heartbeats and reconnection.
///
/// Spawns a background task that maintains the connection, replays the
/// subscription payloads after every reconnect, and backs off exponentially
/// between attempts. The returned handle exposes a sender for later
/// subscription changes and a receiver for inbound messages.
pub fn connect_with_retries(spec: ConnectSpec) -> WebSocketConnection {
    let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel();
    let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
    let state = Arc::new(AtomicU8::new(ConnectionState::Connecting.into()));

    let state_clone = Arc::clone(&state);
    tokio::spawn(async move {
        let mut attempt: u32 = 0;
        loop {
            state_clone.store(ConnectionState::Connecting.into(), Ordering::SeqCst);

            match handle_connection(&spec, &mut outbound_rx, &inbound_tx, &state_clone).await {
                Ok(()) => {
                    state_clone.store(ConnectionState::Disconnected.into(), Ordering::SeqCst);
                    break;
                }
                Err(err) => {
                    attempt += 1;
                    let backoff_ms = 500u64.saturating_mul(1u64 << attempt.min(5));
                    warn!(
                        target: "bot",
                        url = %spec.url,
                        error = %err,
                        attempt,
                        "websocket dropped; reconnecting"
                    );
                    tokio::time::sleep(Duration::from_millis(backoff_ms.min(8_000))).await;
                    state_clone.store(ConnectionState::Reconnecting.into(), Ordering::SeqCst);
                    continue;
                }
            }
        }
    });

    WebSocketConnection {
        outbound_tx,
        inbound_rx,
        state,
    }
}
