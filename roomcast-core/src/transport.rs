//! Signaling transport adapters
//!
//! - [`LocalChannel`]: in-process channel straight into a
//!   [`SignalingProtocolHandler`], used by tests and embedded relays
//! - [`WebSocketServer`] / [`WebSocketChannel`]: JSON frames over WebSocket
//!   (feature `websocket`, on by default)
//!
//! Both server flavours accept the connection through the handler, so the
//! first frame a participant sees is always `existing-producers`, and both
//! disconnect the peer when the connection goes away.

use crate::identity::PeerId;
use crate::protocol_handler::SignalingProtocolHandler;
use crate::signaling::{Notification, Request, Response, SignalingChannel, SignalingError};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;

/// Maximum signaling message size (64KB) to prevent DoS attacks
pub const MAX_SIGNALING_MESSAGE_SIZE: usize = 64 * 1024;

/// Transport configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    /// Largest accepted frame, in bytes
    pub max_message_size: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            max_message_size: MAX_SIGNALING_MESSAGE_SIZE,
        }
    }
}

/// Transport errors
#[derive(Error, Debug)]
pub enum TransportError {
    /// Connection error
    #[error("Connection error: {0}")]
    ConnectionError(String),

    /// Send error
    #[error("Send error: {0}")]
    SendError(String),

    /// Receive error
    #[error("Receive error: {0}")]
    ReceiveError(String),
}

/// In-process signaling channel
///
/// Owns one accepted connection. Closing or dropping the channel disconnects
/// the peer.
pub struct LocalChannel {
    handler: Arc<SignalingProtocolHandler>,
    peer_id: PeerId,
    notifications: Mutex<Option<mpsc::UnboundedReceiver<Notification>>>,
    closed: AtomicBool,
}

impl LocalChannel {
    /// Accept a new connection on `handler`
    ///
    /// # Errors
    ///
    /// Returns `DuplicateConnection` if the id allocation collides
    pub fn connect(handler: Arc<SignalingProtocolHandler>) -> Result<Self, SignalingError> {
        let link = handler.accept()?;
        Ok(Self {
            handler,
            peer_id: link.peer_id,
            notifications: Mutex::new(Some(link.notifications)),
            closed: AtomicBool::new(false),
        })
    }

    /// Connection id the relay assigned
    #[must_use]
    pub fn peer_id(&self) -> PeerId {
        self.peer_id
    }

    /// Disconnect; later requests fail with `ChannelClosed`
    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.handler.disconnect(&self.peer_id);
        }
    }

    /// Whether [`Self::close`] was called
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SignalingChannel for LocalChannel {
    async fn request(&self, request: Request) -> Result<Response, SignalingError> {
        if self.is_closed() {
            return Err(SignalingError::ChannelClosed(self.peer_id.to_string()));
        }
        self.handler.handle_request(self.peer_id, request).await
    }

    fn take_notifications(&self) -> Option<mpsc::UnboundedReceiver<Notification>> {
        self.notifications.lock().take()
    }
}

impl Drop for LocalChannel {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for LocalChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalChannel")
            .field("peer_id", &self.peer_id)
            .field("closed", &self.is_closed())
            .finish()
    }
}

#[cfg(feature = "websocket")]
pub use ws::{WebSocketChannel, WebSocketServer};

#[cfg(feature = "websocket")]
mod ws {
    use super::{TransportConfig, TransportError};
    use crate::protocol_handler::SignalingProtocolHandler;
    use crate::signaling::{
        ClientFrame, ErrorReply, Notification, Request, Response, ServerFrame, SignalingChannel,
        SignalingError,
    };
    use async_trait::async_trait;
    use futures::stream::{SplitSink, SplitStream};
    use futures::{SinkExt, StreamExt};
    use parking_lot::Mutex;
    use serde_json::Value;
    use std::collections::HashMap;
    use std::net::SocketAddr;
    use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
    use std::sync::Arc;
    use tokio::net::{TcpListener, TcpStream};
    use tokio::sync::{mpsc, oneshot, watch};
    use tokio::task::JoinHandle;
    use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
    use tokio_tungstenite::tungstenite::Message;
    use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
    use tracing::{debug, error, info, warn};

    fn ws_config(config: &TransportConfig) -> WebSocketConfig {
        WebSocketConfig {
            max_message_size: Some(config.max_message_size),
            max_frame_size: Some(config.max_message_size),
            ..Default::default()
        }
    }

    fn encode(frame: &ServerFrame) -> Option<Message> {
        match serde_json::to_string(frame) {
            Ok(text) => Some(Message::Text(text)),
            Err(e) => {
                error!("Failed to serialize frame: {}", e);
                None
            }
        }
    }

    /// WebSocket signaling server
    ///
    /// One connection is one peer. Requests on a connection are handled in
    /// arrival order; connections run concurrently.
    pub struct WebSocketServer {
        listener: TcpListener,
        handler: Arc<SignalingProtocolHandler>,
        config: TransportConfig,
        shutdown: watch::Sender<bool>,
    }

    impl WebSocketServer {
        /// Bind the listening socket
        ///
        /// # Errors
        ///
        /// Returns error if the address cannot be bound
        pub async fn bind(
            addr: SocketAddr,
            handler: Arc<SignalingProtocolHandler>,
            config: TransportConfig,
        ) -> Result<Self, TransportError> {
            let listener = TcpListener::bind(addr).await.map_err(|e| {
                TransportError::ConnectionError(format!("Failed to bind {}: {}", addr, e))
            })?;
            let (shutdown, _) = watch::channel(false);
            Ok(Self {
                listener,
                handler,
                config,
                shutdown,
            })
        }

        /// Bound address
        ///
        /// # Errors
        ///
        /// Returns error if the socket has no local address
        pub fn local_addr(&self) -> Result<SocketAddr, TransportError> {
            self.listener
                .local_addr()
                .map_err(|e| TransportError::ConnectionError(e.to_string()))
        }

        /// Handle that stops [`Self::run`]
        #[must_use]
        pub fn shutdown_handle(&self) -> watch::Sender<bool> {
            self.shutdown.clone()
        }

        /// Stop accepting connections
        pub fn stop(&self) {
            self.shutdown.send_replace(true);
            info!("Signaling server shutdown signal sent");
        }

        /// Accept connections until stopped
        pub async fn run(&self) {
            let mut shutdown_rx = self.shutdown.subscribe();
            if *shutdown_rx.borrow() {
                return;
            }
            loop {
                tokio::select! {
                    _ = shutdown_rx.changed() => {
                        if *shutdown_rx.borrow() {
                            info!("Shutting down accept loop");
                            break;
                        }
                    }
                    accepted = self.listener.accept() => match accepted {
                        Ok((stream, addr)) => {
                            let handler = self.handler.clone();
                            let config = self.config.clone();
                            tokio::spawn(async move {
                                if let Err(e) = serve_connection(stream, addr, handler, config).await {
                                    debug!(%addr, error = %e, "Connection ended with error");
                                }
                            });
                        }
                        Err(e) => warn!("Accept failed: {}", e),
                    }
                }
            }
        }
    }

    async fn serve_connection(
        stream: TcpStream,
        addr: SocketAddr,
        handler: Arc<SignalingProtocolHandler>,
        config: TransportConfig,
    ) -> Result<(), TransportError> {
        let ws_stream = tokio_tungstenite::accept_async_with_config(stream, Some(ws_config(&config)))
            .await
            .map_err(|e| TransportError::ConnectionError(format!("Handshake failed: {}", e)))?;
        let link = handler
            .accept()
            .map_err(|e| TransportError::ConnectionError(e.to_string()))?;
        let peer_id = link.peer_id;
        info!(%addr, %peer_id, "WebSocket connection accepted");

        let (ws_tx, mut ws_rx) = ws_stream.split();
        let (out_tx, out_rx) = mpsc::unbounded_channel::<Message>();
        let writer = tokio::spawn(write_frames(ws_tx, out_rx, link.notifications));

        while let Some(msg) = ws_rx.next().await {
            match msg {
                Ok(Message::Text(text)) => {
                    let Some(reply) = answer(&handler, peer_id, &text).await else {
                        continue;
                    };
                    if let Some(message) = encode(&reply) {
                        if out_tx.send(message).is_err() {
                            break;
                        }
                    }
                }
                Ok(Message::Ping(data)) => {
                    let _ = out_tx.send(Message::Pong(data));
                }
                Ok(Message::Close(_)) => {
                    debug!(%peer_id, "Connection closed by client");
                    break;
                }
                Ok(Message::Binary(_)) => warn!(%peer_id, "Ignoring binary frame"),
                Ok(_) => {}
                Err(e) => {
                    debug!(%peer_id, "WebSocket error: {}", e);
                    break;
                }
            }
        }

        handler.disconnect(&peer_id);
        writer.abort();
        Ok(())
    }

    async fn answer(
        handler: &SignalingProtocolHandler,
        peer_id: crate::identity::PeerId,
        text: &str,
    ) -> Option<ServerFrame> {
        let value: Value = match serde_json::from_str(text) {
            Ok(value) => value,
            Err(e) => {
                warn!(%peer_id, "Dropping unparseable frame: {}", e);
                return None;
            }
        };
        let Some(id) = value.get("id").and_then(Value::as_u64) else {
            warn!(%peer_id, "Dropping frame without id");
            return None;
        };
        let outcome = match serde_json::from_value::<ClientFrame>(value) {
            Ok(frame) => match frame.to_request() {
                Ok(request) => handler.handle_request(peer_id, request).await,
                Err(e) => Err(e),
            },
            Err(e) => Err(SignalingError::InvalidRequest(e.to_string())),
        };
        Some(ServerFrame::response(id, &outcome))
    }

    async fn write_frames(
        mut ws_tx: SplitSink<WebSocketStream<TcpStream>, Message>,
        mut out_rx: mpsc::UnboundedReceiver<Message>,
        mut notifications: mpsc::UnboundedReceiver<Notification>,
    ) {
        loop {
            let message = tokio::select! {
                biased;
                Some(notification) = notifications.recv() => {
                    match ServerFrame::notification(&notification) {
                        Ok(frame) => encode(&frame),
                        Err(e) => {
                            error!("Failed to frame notification: {}", e);
                            None
                        }
                    }
                }
                Some(message) = out_rx.recv() => Some(message),
                else => break,
            };
            if let Some(message) = message {
                if let Err(e) = ws_tx.send(message).await {
                    debug!("Failed to send WebSocket message: {}", e);
                    break;
                }
            }
        }
        let _ = ws_tx.close().await;
    }

    type ClientStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
    type Pending = Arc<Mutex<HashMap<u64, oneshot::Sender<Result<Value, ErrorReply>>>>>;

    /// Removes a request's correlation slot when the request future ends,
    /// including when it is dropped on timeout
    struct PendingSlot {
        pending: Pending,
        id: u64,
    }

    impl Drop for PendingSlot {
        fn drop(&mut self) {
            self.pending.lock().remove(&self.id);
        }
    }

    /// WebSocket client end of a signaling connection
    pub struct WebSocketChannel {
        outgoing: mpsc::UnboundedSender<Message>,
        pending: Pending,
        next_id: AtomicU64,
        notifications: Mutex<Option<mpsc::UnboundedReceiver<Notification>>>,
        closed: Arc<AtomicBool>,
        tasks: Vec<JoinHandle<()>>,
    }

    impl WebSocketChannel {
        /// Connect to a relay at `url` (`ws://host:port`)
        ///
        /// # Errors
        ///
        /// Returns error if the connection or handshake fails
        pub async fn connect(url: &str, config: TransportConfig) -> Result<Self, TransportError> {
            info!("Connecting to signaling server: {}", url);
            let (ws_stream, _) =
                tokio_tungstenite::connect_async_with_config(url, Some(ws_config(&config)), false)
                    .await
                    .map_err(|e| {
                        TransportError::ConnectionError(format!("Failed to connect: {}", e))
                    })?;
            let (write, read) = ws_stream.split();

            let (outgoing, out_rx) = mpsc::unbounded_channel();
            let (notify_tx, notify_rx) = mpsc::unbounded_channel();
            let pending: Pending = Arc::new(Mutex::new(HashMap::new()));
            let closed = Arc::new(AtomicBool::new(false));

            let sender = tokio::spawn(Self::sender_task(write, out_rx));
            let receiver = tokio::spawn(Self::receiver_task(
                read,
                pending.clone(),
                notify_tx,
                closed.clone(),
            ));

            Ok(Self {
                outgoing,
                pending,
                next_id: AtomicU64::new(1),
                notifications: Mutex::new(Some(notify_rx)),
                closed,
                tasks: vec![sender, receiver],
            })
        }

        /// Whether the connection is gone
        #[must_use]
        pub fn is_closed(&self) -> bool {
            self.closed.load(Ordering::SeqCst)
        }

        /// Close the connection
        pub fn close(&self) {
            let _ = self.outgoing.send(Message::Close(None));
        }

        /// Requests still waiting for a response
        #[must_use]
        pub fn pending_requests(&self) -> usize {
            self.pending.lock().len()
        }

        async fn sender_task(
            mut write: SplitSink<ClientStream, Message>,
            mut rx: mpsc::UnboundedReceiver<Message>,
        ) {
            while let Some(msg) = rx.recv().await {
                let closing = matches!(msg, Message::Close(_));
                if let Err(e) = write.send(msg).await {
                    debug!("Failed to send WebSocket message: {}", e);
                    break;
                }
                if closing {
                    break;
                }
            }
            debug!("Sender task terminated");
        }

        async fn receiver_task(
            mut read: SplitStream<ClientStream>,
            pending: Pending,
            notifications: mpsc::UnboundedSender<Notification>,
            closed: Arc<AtomicBool>,
        ) {
            while let Some(msg) = read.next().await {
                let text = match msg {
                    Ok(Message::Text(text)) => text,
                    Ok(Message::Close(_)) => break,
                    Ok(_) => continue,
                    Err(e) => {
                        debug!("WebSocket error: {}", e);
                        break;
                    }
                };
                let frame: ServerFrame = match serde_json::from_str(&text) {
                    Ok(frame) => frame,
                    Err(e) => {
                        warn!("Dropping unparseable frame: {}", e);
                        continue;
                    }
                };
                match frame {
                    ServerFrame::Response { id, ok, error } => {
                        let Some(slot) = pending.lock().remove(&id) else {
                            debug!(id, "Discarding response for abandoned request");
                            continue;
                        };
                        let outcome = match error {
                            Some(reply) => Err(reply),
                            None => Ok(ok.unwrap_or(Value::Null)),
                        };
                        let _ = slot.send(outcome);
                    }
                    notification @ ServerFrame::Notification { .. } => {
                        match notification.to_notification() {
                            Ok(n) => {
                                let _ = notifications.send(n);
                            }
                            Err(e) => warn!("Dropping notification: {}", e),
                        }
                    }
                }
            }
            closed.store(true, Ordering::SeqCst);
            pending.lock().clear();
            debug!("Receiver task terminated");
        }
    }

    #[async_trait]
    impl SignalingChannel for WebSocketChannel {
        async fn request(&self, request: Request) -> Result<Response, SignalingError> {
            if self.is_closed() {
                return Err(SignalingError::ChannelClosed("connection closed".to_string()));
            }
            let id = self.next_id.fetch_add(1, Ordering::SeqCst);
            let frame = ClientFrame::new(id, &request)?;
            let text = serde_json::to_string(&frame)
                .map_err(|e| SignalingError::InvalidRequest(e.to_string()))?;

            let (tx, rx) = oneshot::channel();
            self.pending.lock().insert(id, tx);
            let _slot = PendingSlot {
                pending: self.pending.clone(),
                id,
            };
            self.outgoing
                .send(Message::Text(text))
                .map_err(|_| SignalingError::ChannelClosed("sender stopped".to_string()))?;

            match rx.await {
                Ok(Ok(body)) => request.decode_response(body),
                Ok(Err(reply)) => Err(reply.into()),
                Err(_) => Err(SignalingError::ChannelClosed(format!(
                    "connection lost awaiting {}",
                    request.method()
                ))),
            }
        }

        fn take_notifications(&self) -> Option<mpsc::UnboundedReceiver<Notification>> {
            self.notifications.lock().take()
        }
    }

    impl Drop for WebSocketChannel {
        fn drop(&mut self) {
            for task in &self.tasks {
                task.abort();
            }
        }
    }
}
