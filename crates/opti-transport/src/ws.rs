//! Persistent-stream adapter speaking `graphql-transport-ws`.
//!
//! Every subscription of one [`WsTransport`] shares a single socket, owned by
//! a spawned connection task. Subscriptions get increasing ids and frames are
//! routed to them by id. The socket is opened when the first subscription
//! starts and closed when the last one ends. After a drop the task reconnects
//! following a [`RetryPolicy`] and re-sends `subscribe` for every live id.
//! Dropping a returned stream sends `complete` for that id only.

use std::collections::BTreeMap;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, Stream, StreamExt};
use serde_json::Value;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

use opti_link::{EventStream, RetryPolicy, StreamTransport, TransportError};
use opti_types::{GraphqlResponse, Operation};

use crate::error::{AdapterError, AdapterResult};
use crate::protocol::{ProtocolMessage, SUBPROTOCOL};

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;
type Event = Result<GraphqlResponse, TransportError>;
type Events = mpsc::UnboundedSender<Event>;

/// Builds a [`WsTransport`].
#[derive(Debug, Clone)]
pub struct WsTransportBuilder {
    endpoint: String,
    connection_params: Option<Value>,
    connect_timeout: Duration,
    ack_timeout: Duration,
    reconnect: RetryPolicy,
}

impl WsTransportBuilder {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            connection_params: None,
            connect_timeout: Duration::from_secs(10),
            ack_timeout: Duration::from_secs(10),
            reconnect: RetryPolicy::default(),
        }
    }

    /// Payload of `connection_init`, e.g. `{"authToken": "..."}`.
    pub fn with_connection_params(mut self, params: Value) -> Self {
        self.connection_params = Some(params);
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_ack_timeout(mut self, timeout: Duration) -> Self {
        self.ack_timeout = timeout;
        self
    }

    /// `max_attempts` bounds consecutive failed connections.
    pub fn with_reconnect(mut self, policy: RetryPolicy) -> Self {
        self.reconnect = policy;
        self
    }

    pub fn build(self) -> AdapterResult<WsTransport> {
        let url = reqwest::Url::parse(&self.endpoint).map_err(|e| AdapterError::InvalidEndpoint {
            endpoint: self.endpoint.clone(),
            reason: e.to_string(),
        })?;
        if !matches!(url.scheme(), "ws" | "wss") {
            return Err(AdapterError::InvalidEndpoint {
                endpoint: self.endpoint,
                reason: "scheme must be ws or wss".into(),
            });
        }
        Ok(WsTransport {
            config: Arc::new(self),
            connection: Arc::new(Mutex::new(None)),
            next_id: Arc::new(AtomicU64::new(1)),
        })
    }
}

/// Shared handle to one `graphql-transport-ws` connection.
///
/// Clones share the connection and the subscription id sequence.
#[derive(Debug, Clone)]
pub struct WsTransport {
    config: Arc<WsTransportBuilder>,
    connection: Arc<Mutex<Option<mpsc::UnboundedSender<Command>>>>,
    next_id: Arc<AtomicU64>,
}

impl WsTransport {
    pub fn builder(endpoint: impl Into<String>) -> WsTransportBuilder {
        WsTransportBuilder::new(endpoint)
    }

    pub fn endpoint(&self) -> &str {
        &self.config.endpoint
    }

    /// Command channel of the connection task, spawning the task if needed.
    fn commands(&self) -> mpsc::UnboundedSender<Command> {
        let mut connection = self.connection.lock().expect("lock poisoned");
        if let Some(commands) = connection.as_ref().filter(|c| !c.is_closed()) {
            return commands.clone();
        }
        let (commands, rx) = mpsc::unbounded_channel();
        tokio::spawn(
            Connection {
                config: self.config.clone(),
                commands: rx,
                active: BTreeMap::new(),
            }
            .run(),
        );
        *connection = Some(commands.clone());
        commands
    }
}

#[async_trait]
impl StreamTransport for WsTransport {
    async fn subscribe(&self, operation: &Operation) -> Result<EventStream, TransportError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let commands = self.commands();
        let (events, rx) = mpsc::unbounded_channel();
        commands
            .send(Command::Subscribe {
                id,
                operation: operation.name().to_string(),
                payload: operation.request_body(),
                events,
            })
            .map_err(|_| TransportError::Closed("connection task stopped".into()))?;
        Ok(Subscription { id, events: rx, commands }.boxed())
    }
}

// ---------------------------------------------------------------------------
// Subscription stream
// ---------------------------------------------------------------------------

enum Command {
    Subscribe {
        id: u64,
        operation: String,
        payload: Value,
        events: Events,
    },
    Unsubscribe(u64),
}

impl std::fmt::Debug for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Subscribe { id, operation, .. } => write!(f, "Subscribe({id}, {operation})"),
            Self::Unsubscribe(id) => write!(f, "Unsubscribe({id})"),
        }
    }
}

/// Events of one subscription; unsubscribes when dropped.
struct Subscription {
    id: u64,
    events: mpsc::UnboundedReceiver<Event>,
    commands: mpsc::UnboundedSender<Command>,
}

impl Stream for Subscription {
    type Item = Event;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Event>> {
        self.events.poll_recv(cx)
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        // The task may already be gone.
        let _ = self.commands.send(Command::Unsubscribe(self.id));
    }
}

// ---------------------------------------------------------------------------
// Connection task
// ---------------------------------------------------------------------------

struct Active {
    operation: String,
    payload: Value,
    events: Events,
}

/// How one socket session ended.
enum SessionEnd {
    /// No subscriptions left; the socket was closed.
    Idle,
    /// Every handle to the transport is gone.
    Shutdown,
    /// The socket went away; `acked` if the session got past the handshake.
    Dropped { acked: bool, reason: String },
    /// Not recoverable by reconnecting.
    Fatal(TransportError),
}

struct Connection {
    config: Arc<WsTransportBuilder>,
    commands: mpsc::UnboundedReceiver<Command>,
    active: BTreeMap<u64, Active>,
}

impl Connection {
    async fn run(mut self) {
        let mut failures: u32 = 0;
        loop {
            if self.active.is_empty() {
                match self.commands.recv().await {
                    Some(command) => {
                        self.apply(command);
                        continue;
                    }
                    None => return,
                }
            }
            match self.session().await {
                SessionEnd::Idle => {
                    debug!(endpoint = %self.config.endpoint, "no subscriptions left, socket closed");
                    failures = 0;
                }
                SessionEnd::Shutdown => return,
                SessionEnd::Fatal(e) => {
                    warn!(endpoint = %self.config.endpoint, error = %e, "connection failed");
                    self.fail_all(e);
                    failures = 0;
                }
                SessionEnd::Dropped { acked, reason } => {
                    if acked {
                        failures = 0;
                    }
                    failures += 1;
                    if self.config.reconnect.max_attempts.is_some_and(|max| failures >= max) {
                        warn!(attempts = failures, reason = %reason, "reconnect exhausted");
                        self.fail_all(TransportError::ReconnectExhausted { attempts: failures });
                        failures = 0;
                        continue;
                    }
                    let delay = self.config.reconnect.delay_for(failures);
                    info!(
                        attempt = failures,
                        subscriptions = self.active.len(),
                        delay_ms = delay.as_millis() as u64,
                        reason = %reason,
                        "reconnecting"
                    );
                    if !self.wait(delay).await {
                        return;
                    }
                }
            }
        }
    }

    /// Sleep before reconnecting while still taking commands. Returns `false`
    /// when every handle is gone.
    async fn wait(&mut self, delay: Duration) -> bool {
        let sleep = tokio::time::sleep(delay);
        tokio::pin!(sleep);
        while !self.active.is_empty() {
            tokio::select! {
                _ = &mut sleep => break,
                command = self.commands.recv() => match command {
                    Some(command) => self.apply(command),
                    None => return false,
                },
            }
        }
        true
    }

    /// Record a command while no socket is open.
    fn apply(&mut self, command: Command) {
        match command {
            Command::Subscribe {
                id,
                operation,
                payload,
                events,
            } => {
                self.active.insert(
                    id,
                    Active {
                        operation,
                        payload,
                        events,
                    },
                );
            }
            Command::Unsubscribe(id) => {
                self.active.remove(&id);
            }
        }
    }

    fn fail_all(&mut self, error: TransportError) {
        for (_, active) in std::mem::take(&mut self.active) {
            let _ = active.events.send(Err(error.clone()));
        }
    }

    async fn session(&mut self) -> SessionEnd {
        let mut socket = match connect(&self.config).await {
            Ok(socket) => socket,
            Err(reason) => return SessionEnd::Dropped { acked: false, reason },
        };

        let init = ProtocolMessage::ConnectionInit {
            payload: self.config.connection_params.clone(),
        };
        if let Err(e) = socket.send(Message::text(init.encode())).await {
            return SessionEnd::Dropped {
                acked: false,
                reason: e.to_string(),
            };
        }
        match tokio::time::timeout(self.config.ack_timeout, await_ack(&mut socket)).await {
            Ok(Ok(())) => {}
            Ok(Err(end)) => return end,
            Err(_) => {
                return SessionEnd::Dropped {
                    acked: false,
                    reason: "connection_ack timed out".into(),
                }
            }
        }

        while let Ok(command) = self.commands.try_recv() {
            self.apply(command);
        }
        if self.active.is_empty() {
            let _ = socket.close(None).await;
            return SessionEnd::Idle;
        }
        info!(
            endpoint = %self.config.endpoint,
            subscriptions = self.active.len(),
            "connected"
        );
        for (id, active) in &self.active {
            if let Err(e) = send_subscribe(&mut socket, *id, &active.payload).await {
                return SessionEnd::Dropped {
                    acked: true,
                    reason: e.to_string(),
                };
            }
        }

        loop {
            tokio::select! {
                command = self.commands.recv() => match command {
                    None => {
                        let _ = socket.close(None).await;
                        return SessionEnd::Shutdown;
                    }
                    Some(Command::Subscribe { id, operation, payload, events }) => {
                        let sent = send_subscribe(&mut socket, id, &payload).await;
                        debug!(operation = %operation, id, "subscribed");
                        self.active.insert(id, Active { operation, payload, events });
                        if let Err(e) = sent {
                            return SessionEnd::Dropped { acked: true, reason: e.to_string() };
                        }
                    }
                    Some(Command::Unsubscribe(id)) => {
                        if let Some(active) = self.active.remove(&id) {
                            debug!(operation = %active.operation, id, "subscription cancelled");
                            let complete = ProtocolMessage::Complete { id: id.to_string() };
                            let _ = socket.send(Message::text(complete.encode())).await;
                        }
                    }
                },
                frame = socket.next() => {
                    let text = match frame {
                        Some(Ok(Message::Text(text))) => text,
                        Some(Ok(Message::Ping(data))) => {
                            let _ = socket.send(Message::Pong(data)).await;
                            continue;
                        }
                        Some(Ok(Message::Close(_))) | None => {
                            return SessionEnd::Dropped { acked: true, reason: "socket closed".into() };
                        }
                        Some(Ok(_)) => continue,
                        Some(Err(e)) => return SessionEnd::Dropped { acked: true, reason: e.to_string() },
                    };
                    let message = match ProtocolMessage::decode(text.as_str()) {
                        Ok(message) => message,
                        Err(e) => {
                            let _ = socket.close(None).await;
                            return SessionEnd::Fatal(TransportError::Protocol(format!("undecodable frame: {e}")));
                        }
                    };
                    self.route(&mut socket, message).await;
                }
            }
            if self.active.is_empty() {
                let _ = socket.close(None).await;
                return SessionEnd::Idle;
            }
        }
    }

    /// Deliver one server frame to the subscription it names.
    async fn route(&mut self, socket: &mut Socket, message: ProtocolMessage) {
        match message {
            ProtocolMessage::Next { id, payload } => {
                let Some(id) = self.known(&id) else {
                    return;
                };
                let delivered = self
                    .active
                    .get(&id)
                    .is_some_and(|active| active.events.send(Ok(payload)).is_ok());
                if !delivered {
                    self.active.remove(&id);
                    let complete = ProtocolMessage::Complete { id: id.to_string() };
                    let _ = socket.send(Message::text(complete.encode())).await;
                }
            }
            ProtocolMessage::Error { id, payload } => {
                if let Some(active) = self.known(&id).and_then(|id| self.active.remove(&id)) {
                    warn!(operation = %active.operation, "subscription rejected");
                    let _ = active.events.send(Ok(GraphqlResponse::errors(payload)));
                }
            }
            ProtocolMessage::Complete { id } => {
                if let Some(active) = self.known(&id).and_then(|id| self.active.remove(&id)) {
                    debug!(operation = %active.operation, "subscription completed");
                }
            }
            ProtocolMessage::Ping { payload } => {
                let pong = ProtocolMessage::Pong { payload };
                let _ = socket.send(Message::text(pong.encode())).await;
            }
            ProtocolMessage::Pong { .. } => {}
            other => debug!(kind = other.kind(), "ignoring frame"),
        }
    }

    /// Parse a frame id, logging ids that match no live subscription.
    fn known(&self, id: &str) -> Option<u64> {
        let parsed = id.parse::<u64>().ok().filter(|id| self.active.contains_key(id));
        if parsed.is_none() {
            debug!(id = %id, "frame for unknown subscription");
        }
        parsed
    }
}

async fn send_subscribe(
    socket: &mut Socket,
    id: u64,
    payload: &Value,
) -> Result<(), tokio_tungstenite::tungstenite::Error> {
    let subscribe = ProtocolMessage::Subscribe {
        id: id.to_string(),
        payload: payload.clone(),
    };
    socket.send(Message::text(subscribe.encode())).await
}

async fn connect(config: &WsTransportBuilder) -> Result<Socket, String> {
    let mut request = config
        .endpoint
        .as_str()
        .into_client_request()
        .map_err(|e| e.to_string())?;
    request
        .headers_mut()
        .insert("sec-websocket-protocol", HeaderValue::from_static(SUBPROTOCOL));

    match tokio::time::timeout(config.connect_timeout, connect_async(request)).await {
        Ok(Ok((socket, _response))) => Ok(socket),
        Ok(Err(e)) => Err(e.to_string()),
        Err(_) => Err("connect timed out".into()),
    }
}

async fn await_ack(socket: &mut Socket) -> Result<(), SessionEnd> {
    loop {
        let text = match socket.next().await {
            Some(Ok(Message::Text(text))) => text,
            Some(Ok(Message::Ping(data))) => {
                let _ = socket.send(Message::Pong(data)).await;
                continue;
            }
            Some(Ok(Message::Close(_))) | None => {
                return Err(SessionEnd::Dropped {
                    acked: false,
                    reason: "closed before connection_ack".into(),
                })
            }
            Some(Ok(_)) => continue,
            Some(Err(e)) => {
                return Err(SessionEnd::Dropped {
                    acked: false,
                    reason: e.to_string(),
                })
            }
        };
        match ProtocolMessage::decode(text.as_str()) {
            Ok(ProtocolMessage::ConnectionAck { .. }) => return Ok(()),
            Ok(ProtocolMessage::Ping { payload }) => {
                let pong = ProtocolMessage::Pong { payload };
                let _ = socket.send(Message::text(pong.encode())).await;
            }
            Ok(other) => {
                return Err(SessionEnd::Fatal(TransportError::Protocol(format!(
                    "expected connection_ack, got {}",
                    other.kind()
                ))))
            }
            Err(e) => {
                return Err(SessionEnd::Fatal(TransportError::Protocol(format!(
                    "undecodable frame: {e}"
                ))))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn requires_websocket_scheme() {
        let err = WsTransport::builder("http://localhost:4000/graphql").build().unwrap_err();
        assert!(matches!(err, AdapterError::InvalidEndpoint { .. }));
        assert!(WsTransport::builder("ws://localhost:4000/graphql").build().is_ok());
    }
}
