//! Relay service orchestration

use crate::engine::{EngineRouter, MediaEngine, WebRtcTransportOptions};
use crate::loopback_engine::{LoopbackEngine, LoopbackEngineConfig};
use crate::protocol_handler::{HandlerConfig, SignalingProtocolHandler};
use crate::registry::PeerRegistry;
use crate::transport::TransportConfig;
use crate::types::{default_media_codecs, RtpCapabilities, RtpCodecCapability};
use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::broadcast;

pub use crate::protocol_handler::RelayEvent;

/// Service errors
#[derive(Error, Debug)]
pub enum ServiceError {
    /// Initialization error
    #[error("Initialization error: {0}")]
    InitError(String),

    /// Transport error
    #[error("Transport error: {0}")]
    TransportError(String),
}

/// Relay configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    /// Signaling listen address
    pub listen_addr: SocketAddr,
    /// Codecs the router is created with
    pub media_codecs: Vec<RtpCodecCapability>,
    /// Options for every WebRTC transport
    pub transport: WebRtcTransportOptions,
    /// Signaling handler settings
    pub handler: HandlerConfig,
    /// Signaling framing limits
    pub signaling: TransportConfig,
    /// Settings for the built-in engine
    pub engine: LoopbackEngineConfig,
    /// Relay event channel depth
    pub event_buffer_size: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([0, 0, 0, 0], 8080)),
            media_codecs: default_media_codecs(),
            transport: WebRtcTransportOptions::default(),
            handler: HandlerConfig::default(),
            signaling: TransportConfig::default(),
            engine: LoopbackEngineConfig::default(),
            event_buffer_size: 1000,
        }
    }
}

impl RelayConfig {
    /// Load a JSON configuration file; missing fields take their defaults
    ///
    /// # Errors
    ///
    /// Returns error if the file cannot be read or parsed
    pub fn from_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        let config = serde_json::from_str(&raw)
            .with_context(|| format!("parsing config {}", path.display()))?;
        Ok(config)
    }
}

/// One relayed session: a router, its registry and the signaling handler
pub struct RelayService {
    config: RelayConfig,
    handler: Arc<SignalingProtocolHandler>,
    event_sender: broadcast::Sender<RelayEvent>,
}

impl RelayService {
    /// Create the service on the built-in loopback engine
    ///
    /// # Errors
    ///
    /// Returns error if the router cannot be created
    pub async fn new(config: RelayConfig) -> Result<Self, ServiceError> {
        let engine = LoopbackEngine::with_config(config.engine.clone());
        Self::with_engine(config, &engine).await
    }

    /// Create the service on `engine`
    ///
    /// Router creation failure is fatal: a relay without a router cannot
    /// serve anyone.
    ///
    /// # Errors
    ///
    /// Returns error if the router cannot be created
    #[tracing::instrument(skip(config, engine))]
    pub async fn with_engine(
        config: RelayConfig,
        engine: &dyn MediaEngine,
    ) -> Result<Self, ServiceError> {
        let router = engine
            .create_router(config.media_codecs.clone())
            .await
            .map_err(|e| ServiceError::InitError(format!("router creation failed: {}", e)))?;
        let (event_sender, _) = broadcast::channel(config.event_buffer_size.max(1));
        let handler = Arc::new(SignalingProtocolHandler::new(
            router,
            Arc::new(PeerRegistry::new()),
            config.transport.clone(),
            config.handler.clone(),
            event_sender.clone(),
        ));
        tracing::info!(
            codecs = config.media_codecs.len(),
            "Relay service created"
        );
        Ok(Self {
            config,
            handler,
            event_sender,
        })
    }

    /// Create a builder
    #[must_use]
    pub fn builder() -> RelayServiceBuilder {
        RelayServiceBuilder::new()
    }

    /// Configuration in effect
    #[must_use]
    pub fn config(&self) -> &RelayConfig {
        &self.config
    }

    /// Signaling handler shared by every connection
    #[must_use]
    pub fn handler(&self) -> &Arc<SignalingProtocolHandler> {
        &self.handler
    }

    /// Router driven by this service
    #[must_use]
    pub fn router(&self) -> &Arc<dyn EngineRouter> {
        self.handler.router()
    }

    /// Router codec capability set
    #[must_use]
    pub fn rtp_capabilities(&self) -> RtpCapabilities {
        self.handler.router().rtp_capabilities()
    }

    /// Connected peers
    #[must_use]
    pub fn peer_count(&self) -> usize {
        self.handler.registry().len()
    }

    /// Subscribe to relay events
    #[must_use]
    pub fn subscribe_events(&self) -> broadcast::Receiver<RelayEvent> {
        self.event_sender.subscribe()
    }

    /// Open an in-process connection
    ///
    /// # Errors
    ///
    /// Returns error if the connection cannot be registered
    pub fn connect_local(&self) -> Result<crate::transport::LocalChannel, ServiceError> {
        crate::transport::LocalChannel::connect(self.handler.clone())
            .map_err(|e| ServiceError::TransportError(e.to_string()))
    }

    /// Bind the WebSocket signaling server on the configured address
    ///
    /// # Errors
    ///
    /// Returns error if the address cannot be bound
    #[cfg(feature = "websocket")]
    pub async fn bind(&self) -> Result<crate::transport::WebSocketServer, ServiceError> {
        let server = crate::transport::WebSocketServer::bind(
            self.config.listen_addr,
            self.handler.clone(),
            self.config.signaling.clone(),
        )
        .await
        .map_err(|e| ServiceError::TransportError(e.to_string()))?;
        if let Ok(addr) = server.local_addr() {
            tracing::info!(%addr, "Signaling server listening");
        }
        Ok(server)
    }
}

impl std::fmt::Debug for RelayService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RelayService")
            .field("listen_addr", &self.config.listen_addr)
            .field("peers", &self.peer_count())
            .finish()
    }
}

/// Relay service builder
#[derive(Default)]
pub struct RelayServiceBuilder {
    config: RelayConfig,
    engine: Option<Arc<dyn MediaEngine>>,
}

impl RelayServiceBuilder {
    /// Create new builder
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set configuration
    #[must_use]
    pub fn with_config(mut self, config: RelayConfig) -> Self {
        self.config = config;
        self
    }

    /// Set listen address
    #[must_use]
    pub fn with_listen_addr(mut self, addr: SocketAddr) -> Self {
        self.config.listen_addr = addr;
        self
    }

    /// Set router codecs
    #[must_use]
    pub fn with_media_codecs(mut self, codecs: Vec<RtpCodecCapability>) -> Self {
        self.config.media_codecs = codecs;
        self
    }

    /// Use an external media engine instead of the loopback engine
    #[must_use]
    pub fn with_engine(mut self, engine: Arc<dyn MediaEngine>) -> Self {
        self.engine = Some(engine);
        self
    }

    /// Build the service
    ///
    /// # Errors
    ///
    /// Returns error if service creation fails
    pub async fn build(self) -> Result<RelayService, ServiceError> {
        match self.engine {
            Some(engine) => RelayService::with_engine(self.config, engine.as_ref()).await,
            None => RelayService::new(self.config).await,
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_relay_config_defaults() {
        let config = RelayConfig::default();
        assert_eq!(config.listen_addr.port(), 8080);
        assert_eq!(config.media_codecs.len(), 2);
        assert_eq!(config.handler.engine_timeout_ms, 10_000);
        assert_eq!(config.event_buffer_size, 1000);
    }

    #[test]
    fn test_relay_config_from_file_fills_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"listen_addr": "127.0.0.1:9000", "handler": {{"engine_timeout_ms": 250}}}}"#
        )
        .unwrap();

        let config = RelayConfig::from_file(file.path()).unwrap();
        assert_eq!(config.listen_addr, "127.0.0.1:9000".parse().unwrap());
        assert_eq!(config.handler.engine_timeout_ms, 250);
        assert_eq!(config.media_codecs.len(), 2);
    }

    #[test]
    fn test_relay_config_from_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        assert!(RelayConfig::from_file(dir.path().join("absent.json")).is_err());
    }

    #[tokio::test]
    async fn test_empty_codec_set_is_fatal() {
        let result = RelayService::builder()
            .with_media_codecs(Vec::new())
            .build()
            .await;
        assert!(matches!(result, Err(ServiceError::InitError(_))));
    }

    #[tokio::test]
    async fn test_local_connection_emits_events() {
        let service = RelayService::builder().build().await.unwrap();
        let mut events = service.subscribe_events();
        let channel = service.connect_local().unwrap();
        let peer_id = channel.peer_id();
        assert_eq!(service.peer_count(), 1);
        drop(channel);
        assert_eq!(service.peer_count(), 0);

        assert_eq!(
            events.recv().await.unwrap(),
            RelayEvent::PeerConnected { peer_id }
        );
        assert_eq!(
            events.recv().await.unwrap(),
            RelayEvent::PeerDisconnected { peer_id }
        );
    }
}
