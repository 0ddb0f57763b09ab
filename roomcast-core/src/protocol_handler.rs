//! Signaling protocol handler
//!
//! Turns participant requests into media engine calls and registry
//! mutations, and keeps the registry in step with engine lifecycle events.
//!
//! Each engine object created for a peer gets a watcher task subscribed to
//! its event channel before the object becomes visible in the registry:
//!
//! - transport: DTLS `closed`/`failed` closes it and drops it from the session
//! - producer: `transportclose`/`trackended` closes it and announces
//!   `producer-closed`
//! - consumer: `transportclose`/`producerclose`/`trackended` closes it and
//!   tells its owner with `consumer-closed`
//!
//! Every removal is idempotent, so explicit closes and watcher closes can race
//! freely.

use crate::engine::{
    ConsumerEvent, EngineConsumer, EngineError, EngineProducer, EngineRouter, EngineTransport,
    ProducerEvent, TransportEvent, WebRtcTransportOptions,
};
use crate::identity::PeerId;
use crate::registry::{PeerRegistry, RegistryError};
use crate::session::SessionError;
use crate::signaling::{
    CloseProducerRequest, ConnectTransportRequest, ConsumeRequest, Notification, ProduceRequest,
    Request, Response, ResumeConsumerRequest, SignalingError,
};
use crate::types::{
    ConsumerParams, ConsumerState, DtlsState, ProducerId, ProducerInfo, TransportId,
    TransportState,
};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};

/// Configuration for the signaling protocol handler
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HandlerConfig {
    /// Upper bound for every media engine call, in milliseconds
    pub engine_timeout_ms: u64,
}

impl Default for HandlerConfig {
    fn default() -> Self {
        Self {
            engine_timeout_ms: 10_000,
        }
    }
}

impl HandlerConfig {
    /// Engine call bound as a `Duration`
    #[must_use]
    pub fn engine_timeout(&self) -> Duration {
        Duration::from_millis(self.engine_timeout_ms)
    }
}

/// Operator-facing relay events
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayEvent {
    /// A connection was accepted
    PeerConnected {
        /// New peer
        peer_id: PeerId,
    },
    /// A connection was torn down
    PeerDisconnected {
        /// Departed peer
        peer_id: PeerId,
    },
    /// A producer was published
    ProducerOpened(ProducerInfo),
    /// A producer was closed
    ProducerClosed {
        /// Owning peer
        peer_id: PeerId,
        /// Closed producer
        producer_id: ProducerId,
    },
}

/// Server end of one accepted connection
#[derive(Debug)]
pub struct PeerLink {
    /// Id assigned at accept time
    pub peer_id: PeerId,
    /// Notifications queued for this peer, starting with `existing-producers`
    pub notifications: mpsc::UnboundedReceiver<Notification>,
}

impl From<RegistryError> for SignalingError {
    fn from(err: RegistryError) -> Self {
        match err {
            RegistryError::DuplicateConnection(peer_id) => {
                Self::DuplicateConnection(peer_id.to_string())
            }
            RegistryError::NotFound(peer_id) => Self::PeerNotFound(peer_id.to_string()),
            RegistryError::Session(e) => Self::Engine(e.to_string()),
        }
    }
}

/// Handles signaling requests for every connection of one router
pub struct SignalingProtocolHandler {
    router: Arc<dyn EngineRouter>,
    registry: Arc<PeerRegistry>,
    transport_options: WebRtcTransportOptions,
    config: HandlerConfig,
    events: broadcast::Sender<RelayEvent>,
}

impl SignalingProtocolHandler {
    /// Create a handler
    pub fn new(
        router: Arc<dyn EngineRouter>,
        registry: Arc<PeerRegistry>,
        transport_options: WebRtcTransportOptions,
        config: HandlerConfig,
        events: broadcast::Sender<RelayEvent>,
    ) -> Self {
        Self {
            router,
            registry,
            transport_options,
            config,
            events,
        }
    }

    /// Router this handler drives
    #[must_use]
    pub fn router(&self) -> &Arc<dyn EngineRouter> {
        &self.router
    }

    /// Shared peer registry
    #[must_use]
    pub fn registry(&self) -> &Arc<PeerRegistry> {
        &self.registry
    }

    /// Subscribe to relay events
    #[must_use]
    pub fn subscribe_events(&self) -> broadcast::Receiver<RelayEvent> {
        self.events.subscribe()
    }

    /// Accept a new connection under a fresh id
    ///
    /// # Errors
    ///
    /// Returns `DuplicateConnection` if id allocation collides
    pub fn accept(&self) -> Result<PeerLink, SignalingError> {
        self.accept_as(PeerId::new())
    }

    /// Accept a connection under an id chosen by the transport layer
    ///
    /// # Errors
    ///
    /// Returns `DuplicateConnection` if `peer_id` is already connected
    pub fn accept_as(&self, peer_id: PeerId) -> Result<PeerLink, SignalingError> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.registry.register(peer_id, tx).map_err(|e| {
            warn!(%peer_id, "Connection id registered twice");
            SignalingError::from(e)
        })?;
        info!(%peer_id, peers = self.registry.len(), "Peer connected");
        let _ = self.events.send(RelayEvent::PeerConnected { peer_id });
        Ok(PeerLink {
            peer_id,
            notifications: rx,
        })
    }

    /// Tear down a connection
    ///
    /// Announces `peer-left`, then closes every transport the peer owned,
    /// which closes its producers and consumers in the engine. Idempotent.
    #[tracing::instrument(skip(self, peer_id), fields(peer = %peer_id))]
    pub fn disconnect(&self, peer_id: &PeerId) {
        let Some(mut session) = self.registry.unregister(peer_id) else {
            debug!("Disconnect for unknown peer ignored");
            return;
        };
        let producers = session.producer_infos();
        let consumers = session.consumer_count();
        let transports = session.take_transports();
        let transport_count = transports.len();
        for transport in transports {
            transport.close();
        }
        for producer in producers {
            let _ = self.events.send(RelayEvent::ProducerClosed {
                peer_id: *peer_id,
                producer_id: producer.producer_id,
            });
        }
        info!(
            transports = transport_count,
            consumers, "Peer disconnected"
        );
        let _ = self.events.send(RelayEvent::PeerDisconnected { peer_id: *peer_id });
    }

    /// Handle one request from `peer_id`
    ///
    /// # Errors
    ///
    /// Returns the structured error to report back to this requester only
    #[tracing::instrument(skip(self, peer_id, request), fields(peer = %peer_id, method = request.method()))]
    pub async fn handle_request(
        &self,
        peer_id: PeerId,
        request: Request,
    ) -> Result<Response, SignalingError> {
        if !self.registry.contains(&peer_id) {
            return Err(SignalingError::PeerNotFound(peer_id.to_string()));
        }
        let outcome = match request {
            Request::GetRouterRtpCapabilities => {
                Ok(Response::RtpCapabilities(self.router.rtp_capabilities()))
            }
            Request::CreateTransport => self.create_transport(peer_id).await,
            Request::ConnectTransport(req) => self.connect_transport(peer_id, req).await,
            Request::Produce(req) => self.produce(peer_id, req).await,
            Request::Consume(req) => self.consume(peer_id, req).await,
            Request::ResumeConsumer(req) => self.resume_consumer(peer_id, req).await,
            Request::CloseProducer(req) => self.close_producer(peer_id, req),
        };
        if let Err(e) = &outcome {
            debug!(error = %e, "Request failed");
        }
        outcome
    }

    async fn bounded<T>(
        &self,
        operation: &str,
        call: impl Future<Output = Result<T, EngineError>>,
    ) -> Result<Result<T, EngineError>, SignalingError> {
        let limit = self.config.engine_timeout();
        tokio::time::timeout(limit, call).await.map_err(|_| {
            warn!(operation, ?limit, "Engine call timed out");
            SignalingError::Timeout(format!("{} exceeded {:?}", operation, limit))
        })
    }

    fn owned_transport(
        &self,
        peer_id: &PeerId,
        transport_id: &TransportId,
    ) -> Result<Arc<dyn EngineTransport>, SignalingError> {
        self.registry
            .with_session(peer_id, |s| s.transport(transport_id).map(|e| e.handle.clone()))?
            .ok_or_else(|| SignalingError::UnknownTransport(transport_id.to_string()))
    }

    async fn create_transport(&self, peer_id: PeerId) -> Result<Response, SignalingError> {
        let transport = self
            .bounded(
                "create-transport",
                self.router.create_webrtc_transport(&self.transport_options),
            )
            .await?
            .map_err(|e| SignalingError::Engine(e.to_string()))?;

        let events = transport.subscribe();
        if let Err(e) = self.registry.add_transport(&peer_id, transport.clone()) {
            transport.close();
            return Err(e.into());
        }
        tokio::spawn(watch_transport(
            self.registry.clone(),
            peer_id,
            transport.clone(),
            events,
        ));

        debug!(transport_id = %transport.id(), "Transport created");
        Ok(Response::TransportCreated(transport.params()))
    }

    async fn connect_transport(
        &self,
        peer_id: PeerId,
        req: ConnectTransportRequest,
    ) -> Result<Response, SignalingError> {
        let transport_id = req.transport_id;
        let transport = self
            .registry
            .with_session_mut(&peer_id, |s| {
                s.set_transport_state(&transport_id, TransportState::Connecting)
            })?
            .map_err(|e| match e {
                SessionError::NotOwned(id) => SignalingError::UnknownTransport(id),
                SessionError::InvalidTransition { resource, .. } => SignalingError::InvalidRequest(
                    format!("transport {} already connecting or connected", resource),
                ),
            })?;

        let outcome = match self
            .bounded("connect-transport", transport.connect(req.dtls_parameters))
            .await
        {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(SignalingError::Engine(e.to_string())),
            Err(timeout) => Err(timeout),
        };
        if let Err(e) = outcome {
            transport.close();
            self.registry.remove_transport(&peer_id, &transport_id);
            return Err(e);
        }

        let marked = self.registry.with_session_mut(&peer_id, |s| {
            s.set_transport_state(&transport_id, TransportState::Connected)
        });
        if !matches!(marked, Ok(Ok(_))) {
            debug!(%transport_id, "Transport went away during handshake");
            return Err(SignalingError::UnknownTransport(transport_id.to_string()));
        }
        debug!(%transport_id, "Transport connected");
        Ok(Response::TransportConnected { connected: true })
    }

    async fn produce(
        &self,
        peer_id: PeerId,
        req: ProduceRequest,
    ) -> Result<Response, SignalingError> {
        let transport = self.owned_transport(&peer_id, &req.transport_id)?;
        let producer = self
            .bounded("produce", transport.produce(req.kind, req.rtp_parameters))
            .await?
            .map_err(|e| SignalingError::Engine(e.to_string()))?;

        let events = producer.subscribe();
        let info = match self
            .registry
            .add_producer(&peer_id, req.transport_id, producer.clone())
        {
            Ok(info) => info,
            Err(e) => {
                producer.close();
                return Err(e.into());
            }
        };
        tokio::spawn(watch_producer(
            self.registry.clone(),
            self.events.clone(),
            peer_id,
            producer,
            events,
        ));

        info!(producer_id = %info.producer_id, kind = %info.kind, "Producer opened");
        let _ = self.events.send(RelayEvent::ProducerOpened(info.clone()));
        Ok(Response::Produced {
            id: info.producer_id,
        })
    }

    async fn consume(
        &self,
        peer_id: PeerId,
        req: ConsumeRequest,
    ) -> Result<Response, SignalingError> {
        let transport = self.owned_transport(&peer_id, &req.transport_id)?;
        if self.registry.find_producer(&req.producer_id).is_none() {
            return Err(SignalingError::UnknownProducer(req.producer_id.to_string()));
        }
        if !self
            .router
            .can_consume(&req.producer_id, &req.rtp_capabilities)
        {
            return Err(SignalingError::IncompatibleCapabilities(format!(
                "cannot consume producer {}",
                req.producer_id
            )));
        }

        let consumer = self
            .bounded(
                "consume",
                transport.consume(&req.producer_id, &req.rtp_capabilities, true),
            )
            .await?
            .map_err(|e| match e {
                EngineError::NotFound(_) => {
                    SignalingError::UnknownProducer(req.producer_id.to_string())
                }
                EngineError::UnsupportedCodec(detail) => {
                    SignalingError::IncompatibleCapabilities(detail)
                }
                other => SignalingError::Engine(other.to_string()),
            })?;

        let events = consumer.subscribe();
        if let Err(e) = self
            .registry
            .add_consumer(&peer_id, req.transport_id, consumer.clone())
        {
            consumer.close();
            return Err(e.into());
        }
        let params = ConsumerParams {
            id: consumer.id().clone(),
            producer_id: consumer.producer_id().clone(),
            kind: consumer.kind(),
            rtp_parameters: consumer.rtp_parameters(),
        };
        tokio::spawn(watch_consumer(
            self.registry.clone(),
            peer_id,
            consumer,
            events,
        ));

        debug!(consumer_id = %params.id, producer_id = %params.producer_id, "Consumer created paused");
        Ok(Response::Consumed(params))
    }

    async fn resume_consumer(
        &self,
        peer_id: PeerId,
        req: ResumeConsumerRequest,
    ) -> Result<Response, SignalingError> {
        let consumer_id = req.consumer_id;
        let (consumer, state) = self
            .registry
            .with_session(&peer_id, |s| {
                s.consumer(&consumer_id).map(|e| (e.handle.clone(), e.state))
            })?
            .ok_or_else(|| SignalingError::UnknownConsumer(consumer_id.to_string()))?;
        if state == ConsumerState::Resumed {
            return Ok(Response::ConsumerResumed { resumed: true });
        }

        self.bounded("resume-consumer", consumer.resume())
            .await?
            .map_err(|e| match e {
                EngineError::Closed(_) => SignalingError::UnknownConsumer(consumer_id.to_string()),
                other => SignalingError::Engine(other.to_string()),
            })?;

        self.registry
            .with_session_mut(&peer_id, |s| {
                s.set_consumer_state(&consumer_id, ConsumerState::Resumed)
            })?
            .map_err(|_| SignalingError::UnknownConsumer(consumer_id.to_string()))?;

        debug!(%consumer_id, "Consumer resumed");
        Ok(Response::ConsumerResumed { resumed: true })
    }

    fn close_producer(
        &self,
        peer_id: PeerId,
        req: CloseProducerRequest,
    ) -> Result<Response, SignalingError> {
        let entry = self
            .registry
            .remove_producer(&peer_id, &req.producer_id)
            .ok_or_else(|| SignalingError::UnknownProducer(req.producer_id.to_string()))?;
        entry.handle.close();

        info!(producer_id = %req.producer_id, "Producer closed by owner");
        let _ = self.events.send(RelayEvent::ProducerClosed {
            peer_id,
            producer_id: req.producer_id,
        });
        Ok(Response::ProducerClosed { closed: true })
    }
}

impl std::fmt::Debug for SignalingProtocolHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SignalingProtocolHandler")
            .field("router", &self.router.id())
            .field("registry", &self.registry)
            .field("config", &self.config)
            .finish()
    }
}

async fn watch_transport(
    registry: Arc<PeerRegistry>,
    peer_id: PeerId,
    transport: Arc<dyn EngineTransport>,
    mut events: broadcast::Receiver<TransportEvent>,
) {
    if !transport.is_closed() {
        loop {
            match events.recv().await {
                Ok(TransportEvent::DtlsStateChange(state @ (DtlsState::Closed | DtlsState::Failed))) => {
                    debug!(%peer_id, transport_id = %transport.id(), ?state, "DTLS ended, closing transport");
                    transport.close();
                    break;
                }
                Ok(TransportEvent::Closed) | Err(broadcast::error::RecvError::Closed) => break,
                Ok(TransportEvent::DtlsStateChange(_)) | Err(broadcast::error::RecvError::Lagged(_)) => {
                    if transport.is_closed() {
                        break;
                    }
                }
            }
        }
    }
    registry.remove_transport(&peer_id, transport.id());
}

async fn watch_producer(
    registry: Arc<PeerRegistry>,
    relay_events: broadcast::Sender<RelayEvent>,
    peer_id: PeerId,
    producer: Arc<dyn EngineProducer>,
    mut events: broadcast::Receiver<ProducerEvent>,
) {
    if !producer.is_closed() {
        loop {
            match events.recv().await {
                Ok(reason @ (ProducerEvent::TransportClosed | ProducerEvent::TrackEnded)) => {
                    debug!(%peer_id, producer_id = %producer.id(), ?reason, "Closing producer");
                    producer.close();
                    break;
                }
                Ok(ProducerEvent::Closed) | Err(broadcast::error::RecvError::Closed) => break,
                Err(broadcast::error::RecvError::Lagged(_)) => {
                    if producer.is_closed() {
                        break;
                    }
                }
            }
        }
    }
    if registry.remove_producer(&peer_id, producer.id()).is_some() {
        let _ = relay_events.send(RelayEvent::ProducerClosed {
            peer_id,
            producer_id: producer.id().clone(),
        });
    }
}

async fn watch_consumer(
    registry: Arc<PeerRegistry>,
    peer_id: PeerId,
    consumer: Arc<dyn EngineConsumer>,
    mut events: broadcast::Receiver<ConsumerEvent>,
) {
    if !consumer.is_closed() {
        loop {
            match events.recv().await {
                Ok(
                    reason @ (ConsumerEvent::TransportClosed
                    | ConsumerEvent::ProducerClosed
                    | ConsumerEvent::TrackEnded),
                ) => {
                    debug!(%peer_id, consumer_id = %consumer.id(), ?reason, "Closing consumer");
                    consumer.close();
                    break;
                }
                Ok(ConsumerEvent::Closed) | Err(broadcast::error::RecvError::Closed) => break,
                Err(broadcast::error::RecvError::Lagged(_)) => {
                    if consumer.is_closed() {
                        break;
                    }
                }
            }
        }
    }
    registry.remove_consumer(&peer_id, consumer.id());
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::engine::MediaEngine;
    use crate::loopback_engine::{LoopbackEngine, LoopbackEngineConfig};
    use crate::types::default_media_codecs;

    async fn handler_with(engine: LoopbackEngine, config: HandlerConfig) -> SignalingProtocolHandler {
        let router = engine.create_router(default_media_codecs()).await.unwrap();
        let (events, _) = broadcast::channel(64);
        SignalingProtocolHandler::new(
            router,
            Arc::new(PeerRegistry::new()),
            WebRtcTransportOptions::default(),
            config,
            events,
        )
    }

    #[tokio::test]
    async fn test_request_from_unknown_peer_is_rejected() {
        let handler = handler_with(LoopbackEngine::new(), HandlerConfig::default()).await;
        let result = handler
            .handle_request(PeerId::new(), Request::GetRouterRtpCapabilities)
            .await;
        assert!(matches!(result, Err(SignalingError::PeerNotFound(_))));
    }

    #[tokio::test]
    async fn test_accept_emits_event_and_existing_producers() {
        let handler = handler_with(LoopbackEngine::new(), HandlerConfig::default()).await;
        let mut events = handler.subscribe_events();
        let mut link = handler.accept().unwrap();

        assert_eq!(
            events.recv().await.unwrap(),
            RelayEvent::PeerConnected {
                peer_id: link.peer_id
            }
        );
        assert_eq!(
            link.notifications.recv().await.unwrap(),
            Notification::ExistingProducers {
                producer_ids: Vec::new()
            }
        );
        assert!(matches!(
            handler.accept_as(link.peer_id),
            Err(SignalingError::DuplicateConnection(_))
        ));
    }

    #[tokio::test]
    async fn test_failed_allocation_leaves_no_state() {
        let engine = LoopbackEngine::with_config(LoopbackEngineConfig {
            max_transports: 1,
            ..Default::default()
        });
        let handler = handler_with(engine, HandlerConfig::default()).await;
        let link = handler.accept().unwrap();

        handler
            .handle_request(link.peer_id, Request::CreateTransport)
            .await
            .unwrap();
        let second = handler
            .handle_request(link.peer_id, Request::CreateTransport)
            .await;
        assert!(matches!(second, Err(SignalingError::Engine(_))));
        let count = handler
            .registry()
            .with_session(&link.peer_id, |s| s.transport_count())
            .unwrap();
        assert_eq!(count, 1);
    }

    #[tokio::test]
    async fn test_disconnect_is_idempotent() {
        let handler = handler_with(LoopbackEngine::new(), HandlerConfig::default()).await;
        let link = handler.accept().unwrap();
        handler.disconnect(&link.peer_id);
        handler.disconnect(&link.peer_id);
        assert!(handler.registry().is_empty());
    }

    #[test]
    fn test_handler_config_defaults() {
        let config = HandlerConfig::default();
        assert_eq!(config.engine_timeout(), Duration::from_secs(10));
        let parsed: HandlerConfig = serde_json::from_str(r#"{"engine_timeout_ms": 250}"#).unwrap();
        assert_eq!(parsed.engine_timeout(), Duration::from_millis(250));
    }
}
