//! Media engine adapter
//!
//! The relay never touches RTP itself. Packet forwarding, ICE, DTLS and codec
//! negotiation belong to an external media-routing engine which the core
//! drives through the narrow capability interface defined here.
//!
//! # Object model
//!
//! ```text
//! MediaEngine ──create_router──▶ EngineRouter
//!                                  │ create_webrtc_transport
//!                                  ▼
//!                            EngineTransport ──produce──▶ EngineProducer
//!                                  │
//!                                  └────────consume──────▶ EngineConsumer
//! ```
//!
//! Closing a transport closes every producer and consumer created on it.
//! Closing a producer closes every consumer bound to it. Every close is
//! idempotent and is announced once on the object's event channel.

use crate::types::{
    ConsumerId, DtlsParameters, DtlsState, MediaKind, ProducerId, RtpCapabilities,
    RtpCodecCapability, RtpParameters, TransportId, TransportParams,
};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::broadcast;

/// Engine errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    /// No more transports, ports or workers available
    #[error("Resource exhausted: {0}")]
    ResourceExhausted(String),

    /// Codec not present in the router capability set
    #[error("Unsupported codec: {0}")]
    UnsupportedCodec(String),

    /// Operation not valid in the current object state
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Referenced engine object does not exist
    #[error("Not found: {0}")]
    NotFound(String),

    /// Object already closed
    #[error("Closed: {0}")]
    Closed(String),

    /// Any other engine failure
    #[error("Engine failure: {0}")]
    Internal(String),
}

/// Options for allocating a WebRTC transport
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WebRtcTransportOptions {
    /// Local addresses the transport listens on
    pub listen_ips: Vec<IpAddr>,
    /// Address announced in candidates instead of the listen address
    pub announced_ip: Option<String>,
    /// Offer UDP candidates
    pub enable_udp: bool,
    /// Offer TCP candidates
    pub enable_tcp: bool,
    /// Give UDP candidates higher priority
    pub prefer_udp: bool,
}

impl Default for WebRtcTransportOptions {
    fn default() -> Self {
        Self {
            listen_ips: vec![IpAddr::V4(Ipv4Addr::LOCALHOST)],
            announced_ip: None,
            enable_udp: true,
            enable_tcp: true,
            prefer_udp: true,
        }
    }
}

/// Transport lifecycle events
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportEvent {
    /// DTLS state changed
    DtlsStateChange(DtlsState),
    /// Transport closed
    Closed,
}

/// Producer lifecycle events
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProducerEvent {
    /// The owning transport closed
    TransportClosed,
    /// The source track ended
    TrackEnded,
    /// Producer closed
    Closed,
}

/// Consumer lifecycle events
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumerEvent {
    /// The owning transport closed
    TransportClosed,
    /// The upstream producer closed
    ProducerClosed,
    /// The delivered track ended
    TrackEnded,
    /// Consumer closed
    Closed,
}

/// Entry point of a media engine (one worker)
#[async_trait]
pub trait MediaEngine: Send + Sync {
    /// Create a router restricted to `media_codecs`
    ///
    /// # Errors
    ///
    /// Returns error if the engine cannot allocate a router
    async fn create_router(
        &self,
        media_codecs: Vec<RtpCodecCapability>,
    ) -> Result<Arc<dyn EngineRouter>, EngineError>;
}

/// A router relays producers to consumers within one session
#[async_trait]
pub trait EngineRouter: Send + Sync {
    /// Router id
    fn id(&self) -> &str;

    /// Capability set negotiated for this router
    fn rtp_capabilities(&self) -> RtpCapabilities;

    /// Whether a receiver with `rtp_capabilities` can decode `producer_id`
    fn can_consume(&self, producer_id: &ProducerId, rtp_capabilities: &RtpCapabilities) -> bool;

    /// Allocate a WebRTC transport
    ///
    /// # Errors
    ///
    /// Returns error if allocation fails (e.g. port exhaustion)
    async fn create_webrtc_transport(
        &self,
        options: &WebRtcTransportOptions,
    ) -> Result<Arc<dyn EngineTransport>, EngineError>;
}

/// A negotiated network and security endpoint
#[async_trait]
pub trait EngineTransport: Send + Sync {
    /// Transport id
    fn id(&self) -> &TransportId;

    /// ICE and DTLS parameters for the remote side
    fn params(&self) -> TransportParams;

    /// Current DTLS state
    fn dtls_state(&self) -> DtlsState;

    /// Complete the DTLS handshake with the remote parameters
    ///
    /// # Errors
    ///
    /// Returns error if the transport is closed or already connected
    async fn connect(&self, dtls_parameters: DtlsParameters) -> Result<(), EngineError>;

    /// Create a producer on this transport
    ///
    /// Allowed before `connect` completes; the engine buffers.
    ///
    /// # Errors
    ///
    /// Returns error if the transport is closed or the codec is not routable
    async fn produce(
        &self,
        kind: MediaKind,
        rtp_parameters: RtpParameters,
    ) -> Result<Arc<dyn EngineProducer>, EngineError>;

    /// Create a consumer of `producer_id` on this transport
    ///
    /// # Errors
    ///
    /// Returns error if the producer is unknown or cannot be consumed
    async fn consume(
        &self,
        producer_id: &ProducerId,
        rtp_capabilities: &RtpCapabilities,
        paused: bool,
    ) -> Result<Arc<dyn EngineConsumer>, EngineError>;

    /// Close the transport and everything created on it
    fn close(&self);

    /// Whether the transport is closed
    fn is_closed(&self) -> bool;

    /// Subscribe to lifecycle events
    fn subscribe(&self) -> broadcast::Receiver<TransportEvent>;
}

/// One outbound media source
pub trait EngineProducer: Send + Sync {
    /// Producer id
    fn id(&self) -> &ProducerId;

    /// Media kind
    fn kind(&self) -> MediaKind;

    /// Send parameters
    fn rtp_parameters(&self) -> RtpParameters;

    /// Close the producer and its consumers
    fn close(&self);

    /// Whether the producer is closed
    fn is_closed(&self) -> bool;

    /// Subscribe to lifecycle events
    fn subscribe(&self) -> broadcast::Receiver<ProducerEvent>;
}

/// One inbound media sink bound to a producer
#[async_trait]
pub trait EngineConsumer: Send + Sync {
    /// Consumer id
    fn id(&self) -> &ConsumerId;

    /// Producer this consumer is bound to
    fn producer_id(&self) -> &ProducerId;

    /// Media kind
    fn kind(&self) -> MediaKind;

    /// Receive parameters
    fn rtp_parameters(&self) -> RtpParameters;

    /// Whether media is currently held back
    fn is_paused(&self) -> bool;

    /// Start delivering media
    ///
    /// # Errors
    ///
    /// Returns error if the consumer is closed
    async fn resume(&self) -> Result<(), EngineError>;

    /// Close the consumer
    fn close(&self);

    /// Whether the consumer is closed
    fn is_closed(&self) -> bool;

    /// Subscribe to lifecycle events
    fn subscribe(&self) -> broadcast::Receiver<ConsumerEvent>;
}
