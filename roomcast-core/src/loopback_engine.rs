//! In-process media engine
//!
//! `LoopbackEngine` implements the [`crate::engine`] traits without moving
//! any media. It keeps the full object graph (router, transports, producers,
//! consumers), generates realistic ICE/DTLS parameters, enforces codec
//! compatibility and reproduces the engine's close cascade. The relay binary
//! runs on it for local demos and every integration test drives it.

use crate::engine::{
    ConsumerEvent, EngineConsumer, EngineError, EngineProducer, EngineRouter, EngineTransport,
    MediaEngine, ProducerEvent, TransportEvent, WebRtcTransportOptions,
};
use crate::types::{
    ConsumerId, DtlsFingerprint, DtlsParameters, DtlsRole, DtlsState, IceCandidate,
    IceParameters, MediaKind, ProducerId, Protocol, RtpCapabilities, RtpCodecCapability,
    RtpCodecParameters, RtpEncodingParameters, RtpParameters, TransportId, TransportParams,
};
use async_trait::async_trait;
use parking_lot::Mutex;
use rand::distributions::Alphanumeric;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::broadcast;
use uuid::Uuid;

/// First payload type handed out to codecs without a preference
const DYNAMIC_PAYLOAD_TYPE_START: u8 = 100;

/// Event channel depth per engine object
const EVENT_CHANNEL_CAPACITY: usize = 16;

/// Loopback engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoopbackEngineConfig {
    /// Maximum concurrently open transports per router
    pub max_transports: usize,
    /// First port of the RTC port range
    pub rtc_min_port: u16,
    /// Last port of the RTC port range
    pub rtc_max_port: u16,
}

impl Default for LoopbackEngineConfig {
    fn default() -> Self {
        Self {
            max_transports: 1024,
            rtc_min_port: 40000,
            rtc_max_port: 49999,
        }
    }
}

/// In-process media engine
#[derive(Debug, Clone, Default)]
pub struct LoopbackEngine {
    config: LoopbackEngineConfig,
}

impl LoopbackEngine {
    /// Create an engine with default limits
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an engine with explicit limits
    #[must_use]
    pub fn with_config(config: LoopbackEngineConfig) -> Self {
        Self { config }
    }

    /// Engine configuration
    #[must_use]
    pub fn config(&self) -> &LoopbackEngineConfig {
        &self.config
    }

    /// Create a router and keep its concrete type
    ///
    /// The concrete router exposes lookups for injecting network and track
    /// events into the objects it created.
    ///
    /// # Errors
    ///
    /// Returns error if the codec set is empty or inconsistent
    #[tracing::instrument(skip(self, media_codecs), fields(codecs = media_codecs.len()))]
    pub async fn create_loopback_router(
        &self,
        media_codecs: Vec<RtpCodecCapability>,
    ) -> Result<Arc<LoopbackRouter>, EngineError> {
        if media_codecs.is_empty() {
            return Err(EngineError::UnsupportedCodec(
                "router needs at least one codec".to_string(),
            ));
        }
        if self.config.rtc_min_port > self.config.rtc_max_port {
            return Err(EngineError::Internal(format!(
                "invalid RTC port range {}-{}",
                self.config.rtc_min_port, self.config.rtc_max_port
            )));
        }

        let mut next_dynamic = DYNAMIC_PAYLOAD_TYPE_START;
        let mut taken = HashSet::new();
        let mut codecs = Vec::with_capacity(media_codecs.len());
        for mut codec in media_codecs {
            if !codec.mime_type.to_ascii_lowercase().starts_with(codec.kind.as_str()) {
                return Err(EngineError::UnsupportedCodec(format!(
                    "{} is not a {} codec",
                    codec.mime_type, codec.kind
                )));
            }
            let payload_type = match codec.preferred_payload_type {
                Some(pt) if taken.insert(pt) => pt,
                _ => {
                    while taken.contains(&next_dynamic) {
                        next_dynamic = next_dynamic.wrapping_add(1);
                    }
                    taken.insert(next_dynamic);
                    next_dynamic
                }
            };
            codec.preferred_payload_type = Some(payload_type);
            codecs.push(codec);
        }

        let capabilities = RtpCapabilities {
            codecs,
            header_extensions: Vec::new(),
        };
        let config = self.config.clone();
        let router = Arc::new_cyclic(|weak| LoopbackRouter {
            id: Uuid::new_v4().to_string(),
            capabilities,
            ports: Mutex::new(PortPool::new(&config)),
            transports: Mutex::new(HashMap::new()),
            producers: Mutex::new(HashMap::new()),
            consumers: Mutex::new(HashMap::new()),
            self_ref: weak.clone(),
        });
        tracing::info!(router_id = %router.id, "Router created");
        Ok(router)
    }
}

#[async_trait]
impl MediaEngine for LoopbackEngine {
    async fn create_router(
        &self,
        media_codecs: Vec<RtpCodecCapability>,
    ) -> Result<Arc<dyn EngineRouter>, EngineError> {
        let router: Arc<dyn EngineRouter> = self.create_loopback_router(media_codecs).await?;
        Ok(router)
    }
}

#[derive(Debug)]
struct PortPool {
    min: u16,
    max: u16,
    limit: usize,
    next: u16,
    in_use: HashSet<u16>,
}

impl PortPool {
    fn new(config: &LoopbackEngineConfig) -> Self {
        Self {
            min: config.rtc_min_port,
            max: config.rtc_max_port,
            limit: config.max_transports,
            next: config.rtc_min_port,
            in_use: HashSet::new(),
        }
    }

    fn allocate(&mut self) -> Option<u16> {
        if self.in_use.len() >= self.limit {
            return None;
        }
        let span = usize::from(self.max - self.min) + 1;
        for _ in 0..span {
            let candidate = self.next;
            self.next = if self.next >= self.max {
                self.min
            } else {
                self.next + 1
            };
            if self.in_use.insert(candidate) {
                return Some(candidate);
            }
        }
        None
    }

    fn release(&mut self, port: u16) {
        self.in_use.remove(&port);
    }
}

/// Router of the loopback engine
pub struct LoopbackRouter {
    id: String,
    capabilities: RtpCapabilities,
    ports: Mutex<PortPool>,
    transports: Mutex<HashMap<TransportId, Weak<LoopbackTransport>>>,
    producers: Mutex<HashMap<ProducerId, Weak<LoopbackProducer>>>,
    consumers: Mutex<HashMap<ConsumerId, Weak<LoopbackConsumer>>>,
    self_ref: Weak<LoopbackRouter>,
}

impl LoopbackRouter {
    fn find_producer(&self, producer_id: &ProducerId) -> Option<Arc<LoopbackProducer>> {
        self.producers
            .lock()
            .get(producer_id)
            .and_then(Weak::upgrade)
            .filter(|p| !p.is_closed())
    }

    /// Open transport by id
    #[must_use]
    pub fn transport(&self, transport_id: &TransportId) -> Option<Arc<LoopbackTransport>> {
        self.transports
            .lock()
            .get(transport_id)
            .and_then(Weak::upgrade)
            .filter(|t| !t.is_closed())
    }

    /// Open producer by id
    #[must_use]
    pub fn producer(&self, producer_id: &ProducerId) -> Option<Arc<LoopbackProducer>> {
        self.find_producer(producer_id)
    }

    /// Open consumer by id
    #[must_use]
    pub fn consumer(&self, consumer_id: &ConsumerId) -> Option<Arc<LoopbackConsumer>> {
        self.consumers
            .lock()
            .get(consumer_id)
            .and_then(Weak::upgrade)
            .filter(|c| !c.is_closed())
    }

    fn unregister_transport(&self, transport_id: &TransportId) {
        self.transports.lock().remove(transport_id);
    }

    fn unregister_producer(&self, producer_id: &ProducerId) {
        self.producers.lock().remove(producer_id);
    }

    fn unregister_consumer(&self, consumer_id: &ConsumerId) {
        self.consumers.lock().remove(consumer_id);
    }

    fn release_port(&self, port: u16) {
        self.ports.lock().release(port);
    }

    /// Number of transports currently holding a port
    #[must_use]
    pub fn open_transports(&self) -> usize {
        self.ports.lock().in_use.len()
    }

    /// Number of live producers known to the router
    #[must_use]
    pub fn producer_count(&self) -> usize {
        self.producers
            .lock()
            .values()
            .filter(|p| p.upgrade().is_some_and(|p| !p.is_closed()))
            .count()
    }

    fn router_codec_for(&self, codec: &RtpCodecParameters) -> Option<&RtpCodecCapability> {
        self.capabilities.codecs.iter().find(|c| c.matches(codec))
    }
}

#[async_trait]
impl EngineRouter for LoopbackRouter {
    fn id(&self) -> &str {
        &self.id
    }

    fn rtp_capabilities(&self) -> RtpCapabilities {
        self.capabilities.clone()
    }

    fn can_consume(&self, producer_id: &ProducerId, rtp_capabilities: &RtpCapabilities) -> bool {
        let Some(producer) = self.find_producer(producer_id) else {
            return false;
        };
        producer
            .rtp_parameters
            .primary_codec()
            .is_some_and(|codec| rtp_capabilities.supports(codec))
    }

    #[tracing::instrument(skip(self, options), fields(router_id = %self.id))]
    async fn create_webrtc_transport(
        &self,
        options: &WebRtcTransportOptions,
    ) -> Result<Arc<dyn EngineTransport>, EngineError> {
        if options.listen_ips.is_empty() {
            return Err(EngineError::Internal("no listen IPs configured".to_string()));
        }
        if !options.enable_udp && !options.enable_tcp {
            return Err(EngineError::Internal(
                "neither UDP nor TCP enabled".to_string(),
            ));
        }

        let port = self.ports.lock().allocate().ok_or_else(|| {
            EngineError::ResourceExhausted("no free RTC port for transport".to_string())
        })?;

        let id = TransportId::new();
        let params = TransportParams {
            id: id.clone(),
            ice_parameters: IceParameters {
                username_fragment: random_token(16),
                password: random_token(32),
                ice_lite: true,
            },
            ice_candidates: build_candidates(options, port),
            dtls_parameters: DtlsParameters {
                role: DtlsRole::Auto,
                fingerprints: vec![fingerprint_for(&id)],
            },
        };

        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let transport = Arc::new_cyclic(|weak| LoopbackTransport {
            id,
            params,
            port,
            router: self.self_ref.clone(),
            dtls_state: Mutex::new(DtlsState::New),
            closed: AtomicBool::new(false),
            producers: Mutex::new(Vec::new()),
            consumers: Mutex::new(Vec::new()),
            events,
            self_ref: weak.clone(),
        });
        self.transports
            .lock()
            .insert(transport.id.clone(), Arc::downgrade(&transport));
        tracing::debug!(transport_id = %transport.id, port, "Transport created");
        Ok(transport)
    }
}

fn random_token(len: usize) -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(char::from)
        .collect()
}

fn fingerprint_for(id: &TransportId) -> DtlsFingerprint {
    let digest = blake3::hash(id.as_str().as_bytes());
    let value = digest
        .as_bytes()
        .iter()
        .map(|b| format!("{:02X}", b))
        .collect::<Vec<_>>()
        .join(":");
    DtlsFingerprint {
        algorithm: "sha-256".to_string(),
        value,
    }
}

fn build_candidates(options: &WebRtcTransportOptions, port: u16) -> Vec<IceCandidate> {
    let mut protocols = Vec::new();
    if options.enable_udp {
        protocols.push(Protocol::Udp);
    }
    if options.enable_tcp {
        protocols.push(Protocol::Tcp);
    }

    let mut candidates = Vec::new();
    for (ip_index, ip) in options.listen_ips.iter().enumerate() {
        let announced = options
            .announced_ip
            .clone()
            .unwrap_or_else(|| ip.to_string());
        for protocol in &protocols {
            let preferred = match protocol {
                Protocol::Udp => options.prefer_udp,
                Protocol::Tcp => !options.prefer_udp,
            };
            let base: u32 = if preferred { 1_076_302_079 } else { 1_076_276_479 };
            let index = u32::try_from(ip_index).unwrap_or(u32::MAX);
            candidates.push(IceCandidate {
                foundation: format!("{}{}", protocol_tag(*protocol), ip_index),
                priority: base.saturating_sub(index),
                ip: announced.clone(),
                protocol: *protocol,
                port,
                candidate_type: "host".to_string(),
                tcp_type: matches!(protocol, Protocol::Tcp).then(|| "passive".to_string()),
            });
        }
    }
    candidates
}

fn protocol_tag(protocol: Protocol) -> &'static str {
    match protocol {
        Protocol::Udp => "udpcandidate",
        Protocol::Tcp => "tcpcandidate",
    }
}

/// Transport of the loopback engine
pub struct LoopbackTransport {
    id: TransportId,
    params: TransportParams,
    port: u16,
    router: Weak<LoopbackRouter>,
    dtls_state: Mutex<DtlsState>,
    closed: AtomicBool,
    producers: Mutex<Vec<Arc<LoopbackProducer>>>,
    consumers: Mutex<Vec<Arc<LoopbackConsumer>>>,
    events: broadcast::Sender<TransportEvent>,
    self_ref: Weak<LoopbackTransport>,
}

impl LoopbackTransport {
    /// Inject a DTLS state change as if reported by the network stack
    pub fn report_dtls_state(&self, state: DtlsState) {
        *self.dtls_state.lock() = state;
        let _ = self.events.send(TransportEvent::DtlsStateChange(state));
    }

    /// Open producers created on this transport
    #[must_use]
    pub fn producer_count(&self) -> usize {
        self.producers.lock().len()
    }

    /// Open consumers created on this transport
    #[must_use]
    pub fn consumer_count(&self) -> usize {
        self.consumers.lock().len()
    }

    fn forget_producer(&self, producer_id: &ProducerId) {
        self.producers.lock().retain(|p| p.id != *producer_id);
    }

    fn forget_consumer(&self, consumer_id: &ConsumerId) {
        self.consumers.lock().retain(|c| c.id != *consumer_id);
    }

    fn ensure_open(&self) -> Result<(), EngineError> {
        if self.is_closed() {
            return Err(EngineError::Closed(format!("transport {}", self.id)));
        }
        Ok(())
    }

    fn router(&self) -> Result<Arc<LoopbackRouter>, EngineError> {
        self.router
            .upgrade()
            .ok_or_else(|| EngineError::Closed("router".to_string()))
    }
}

#[async_trait]
impl EngineTransport for LoopbackTransport {
    fn id(&self) -> &TransportId {
        &self.id
    }

    fn params(&self) -> TransportParams {
        self.params.clone()
    }

    fn dtls_state(&self) -> DtlsState {
        *self.dtls_state.lock()
    }

    async fn connect(&self, dtls_parameters: DtlsParameters) -> Result<(), EngineError> {
        self.ensure_open()?;
        {
            let state = self.dtls_state.lock();
            if *state != DtlsState::New {
                return Err(EngineError::InvalidState(format!(
                    "transport {} already connected",
                    self.id
                )));
            }
        }
        if dtls_parameters.fingerprints.is_empty() {
            self.report_dtls_state(DtlsState::Failed);
            return Err(EngineError::InvalidState(
                "remote DTLS parameters carry no fingerprint".to_string(),
            ));
        }
        self.report_dtls_state(DtlsState::Connecting);
        self.report_dtls_state(DtlsState::Connected);
        Ok(())
    }

    async fn produce(
        &self,
        kind: MediaKind,
        rtp_parameters: RtpParameters,
    ) -> Result<Arc<dyn EngineProducer>, EngineError> {
        self.ensure_open()?;
        let router = self.router()?;

        let codec = rtp_parameters
            .primary_codec()
            .ok_or_else(|| EngineError::UnsupportedCodec("no codec in RTP parameters".to_string()))?;
        if !codec.mime_type.to_ascii_lowercase().starts_with(kind.as_str()) {
            return Err(EngineError::UnsupportedCodec(format!(
                "{} does not carry {}",
                codec.mime_type, kind
            )));
        }
        if router.router_codec_for(codec).is_none() {
            return Err(EngineError::UnsupportedCodec(codec.mime_type.clone()));
        }

        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let producer = Arc::new(LoopbackProducer {
            id: ProducerId::new(),
            kind,
            rtp_parameters,
            closed: AtomicBool::new(false),
            consumers: Mutex::new(Vec::new()),
            router: self.router.clone(),
            transport: self.self_ref.clone(),
            events,
        });
        router
            .producers
            .lock()
            .insert(producer.id.clone(), Arc::downgrade(&producer));
        self.producers.lock().push(producer.clone());

        tracing::debug!(transport_id = %self.id, producer_id = %producer.id, %kind, "Producer created");
        Ok(producer)
    }

    async fn consume(
        &self,
        producer_id: &ProducerId,
        rtp_capabilities: &RtpCapabilities,
        paused: bool,
    ) -> Result<Arc<dyn EngineConsumer>, EngineError> {
        self.ensure_open()?;
        let router = self.router()?;
        let producer = router
            .find_producer(producer_id)
            .ok_or_else(|| EngineError::NotFound(format!("producer {}", producer_id)))?;

        let codec = producer
            .rtp_parameters
            .primary_codec()
            .filter(|c| rtp_capabilities.supports(c))
            .ok_or_else(|| {
                EngineError::UnsupportedCodec(format!("cannot consume producer {}", producer_id))
            })?;
        let router_codec = router
            .router_codec_for(codec)
            .ok_or_else(|| EngineError::UnsupportedCodec(codec.mime_type.clone()))?;
        let payload_type = router_codec
            .preferred_payload_type
            .unwrap_or(DYNAMIC_PAYLOAD_TYPE_START);

        let rtp_parameters = RtpParameters {
            mid: None,
            codecs: vec![RtpCodecParameters::from_capability(router_codec, payload_type)],
            header_extensions: Vec::new(),
            encodings: vec![RtpEncodingParameters {
                ssrc: Some(rand::thread_rng().gen()),
                ..Default::default()
            }],
            rtcp: None,
        };

        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let consumer = Arc::new(LoopbackConsumer {
            id: ConsumerId::new(),
            producer_id: producer_id.clone(),
            kind: producer.kind,
            rtp_parameters,
            paused: AtomicBool::new(paused),
            closed: AtomicBool::new(false),
            router: self.router.clone(),
            transport: self.self_ref.clone(),
            producer: Arc::downgrade(&producer),
            events,
        });
        producer.consumers.lock().push(Arc::downgrade(&consumer));
        router
            .consumers
            .lock()
            .insert(consumer.id.clone(), Arc::downgrade(&consumer));
        self.consumers.lock().push(consumer.clone());

        // The producer may have closed while the consumer was being wired up.
        if producer.is_closed() {
            consumer.shutdown(ConsumerEvent::ProducerClosed);
        }

        tracing::debug!(transport_id = %self.id, consumer_id = %consumer.id, %producer_id, "Consumer created");
        Ok(consumer)
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        *self.dtls_state.lock() = DtlsState::Closed;

        let producers = std::mem::take(&mut *self.producers.lock());
        for producer in producers {
            producer.shutdown(ProducerEvent::TransportClosed);
        }
        let consumers = std::mem::take(&mut *self.consumers.lock());
        for consumer in consumers {
            consumer.shutdown(ConsumerEvent::TransportClosed);
        }
        if let Some(router) = self.router.upgrade() {
            router.release_port(self.port);
            router.unregister_transport(&self.id);
        }

        let _ = self.events.send(TransportEvent::Closed);
        tracing::debug!(transport_id = %self.id, "Transport closed");
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn subscribe(&self) -> broadcast::Receiver<TransportEvent> {
        self.events.subscribe()
    }
}

/// Producer of the loopback engine
pub struct LoopbackProducer {
    id: ProducerId,
    kind: MediaKind,
    rtp_parameters: RtpParameters,
    closed: AtomicBool,
    consumers: Mutex<Vec<Weak<LoopbackConsumer>>>,
    router: Weak<LoopbackRouter>,
    transport: Weak<LoopbackTransport>,
    events: broadcast::Sender<ProducerEvent>,
}

impl LoopbackProducer {
    /// Report that the source track ended
    pub fn end_track(&self) {
        if !self.is_closed() {
            let _ = self.events.send(ProducerEvent::TrackEnded);
        }
    }

    fn shutdown(&self, reason: ProducerEvent) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if reason != ProducerEvent::Closed {
            let _ = self.events.send(reason);
        }
        let consumers = std::mem::take(&mut *self.consumers.lock());
        for consumer in consumers.iter().filter_map(Weak::upgrade) {
            consumer.shutdown(ConsumerEvent::ProducerClosed);
        }
        if let Some(router) = self.router.upgrade() {
            router.unregister_producer(&self.id);
        }
        if let Some(transport) = self.transport.upgrade() {
            transport.forget_producer(&self.id);
        }
        let _ = self.events.send(ProducerEvent::Closed);
    }
}

impl EngineProducer for LoopbackProducer {
    fn id(&self) -> &ProducerId {
        &self.id
    }

    fn kind(&self) -> MediaKind {
        self.kind
    }

    fn rtp_parameters(&self) -> RtpParameters {
        self.rtp_parameters.clone()
    }

    fn close(&self) {
        self.shutdown(ProducerEvent::Closed);
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn subscribe(&self) -> broadcast::Receiver<ProducerEvent> {
        self.events.subscribe()
    }
}

/// Consumer of the loopback engine
pub struct LoopbackConsumer {
    id: ConsumerId,
    producer_id: ProducerId,
    kind: MediaKind,
    rtp_parameters: RtpParameters,
    paused: AtomicBool,
    closed: AtomicBool,
    router: Weak<LoopbackRouter>,
    transport: Weak<LoopbackTransport>,
    producer: Weak<LoopbackProducer>,
    events: broadcast::Sender<ConsumerEvent>,
}

impl LoopbackConsumer {
    /// Report that the delivered track ended
    pub fn end_track(&self) {
        if !self.is_closed() {
            let _ = self.events.send(ConsumerEvent::TrackEnded);
        }
    }

    fn shutdown(&self, reason: ConsumerEvent) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if reason != ConsumerEvent::Closed {
            let _ = self.events.send(reason);
        }
        if let Some(router) = self.router.upgrade() {
            router.unregister_consumer(&self.id);
        }
        if let Some(transport) = self.transport.upgrade() {
            transport.forget_consumer(&self.id);
        }
        if let Some(producer) = self.producer.upgrade() {
            producer
                .consumers
                .lock()
                .retain(|c| c.upgrade().is_some_and(|c| c.id != self.id));
        }
        let _ = self.events.send(ConsumerEvent::Closed);
    }
}

#[async_trait]
impl EngineConsumer for LoopbackConsumer {
    fn id(&self) -> &ConsumerId {
        &self.id
    }

    fn producer_id(&self) -> &ProducerId {
        &self.producer_id
    }

    fn kind(&self) -> MediaKind {
        self.kind
    }

    fn rtp_parameters(&self) -> RtpParameters {
        self.rtp_parameters.clone()
    }

    fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    async fn resume(&self) -> Result<(), EngineError> {
        if self.is_closed() {
            return Err(EngineError::Closed(format!("consumer {}", self.id)));
        }
        self.paused.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn close(&self) {
        self.shutdown(ConsumerEvent::Closed);
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn subscribe(&self) -> broadcast::Receiver<ConsumerEvent> {
        self.events.subscribe()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::types::default_media_codecs;

    async fn router() -> Arc<dyn EngineRouter> {
        LoopbackEngine::new()
            .create_router(default_media_codecs())
            .await
            .unwrap()
    }

    fn vp8_parameters(router: &dyn EngineRouter) -> RtpParameters {
        let caps = router.rtp_capabilities();
        let vp8 = caps.codecs_of(MediaKind::Video).next().unwrap();
        RtpParameters {
            codecs: vec![RtpCodecParameters::from_capability(vp8, 97)],
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_router_requires_codecs() {
        let result = LoopbackEngine::new().create_router(Vec::new()).await;
        assert!(matches!(result, Err(EngineError::UnsupportedCodec(_))));
    }

    #[tokio::test]
    async fn test_router_keeps_preferred_payload_types() {
        let router = router().await;
        let pts: Vec<_> = router
            .rtp_capabilities()
            .codecs
            .iter()
            .map(|c| c.preferred_payload_type)
            .collect();
        assert_eq!(pts, vec![Some(96), Some(97)]);
    }

    #[tokio::test]
    async fn test_transport_params_are_populated() {
        let router = router().await;
        let transport = router
            .create_webrtc_transport(&WebRtcTransportOptions::default())
            .await
            .unwrap();
        let params = transport.params();
        assert_eq!(&params.id, transport.id());
        assert_eq!(params.ice_parameters.username_fragment.len(), 16);
        assert_eq!(params.ice_candidates.len(), 2);
        assert_eq!(params.ice_candidates[0].protocol, Protocol::Udp);
        assert!(params.ice_candidates[0].priority > params.ice_candidates[1].priority);
        assert_eq!(params.dtls_parameters.fingerprints[0].value.split(':').count(), 32);
    }

    #[tokio::test]
    async fn test_port_exhaustion_is_an_engine_error() {
        let engine = LoopbackEngine::with_config(LoopbackEngineConfig {
            max_transports: 1,
            ..Default::default()
        });
        let router = engine.create_router(default_media_codecs()).await.unwrap();
        let options = WebRtcTransportOptions::default();
        let first = router.create_webrtc_transport(&options).await.unwrap();
        let second = router.create_webrtc_transport(&options).await;
        assert!(matches!(second, Err(EngineError::ResourceExhausted(_))));

        first.close();
        assert!(router.create_webrtc_transport(&options).await.is_ok());
    }

    #[tokio::test]
    async fn test_connect_is_one_shot() {
        let router = router().await;
        let transport = router
            .create_webrtc_transport(&WebRtcTransportOptions::default())
            .await
            .unwrap();
        let dtls = transport.params().dtls_parameters;
        transport.connect(dtls.clone()).await.unwrap();
        assert_eq!(transport.dtls_state(), DtlsState::Connected);
        assert!(matches!(
            transport.connect(dtls).await,
            Err(EngineError::InvalidState(_))
        ));
    }

    #[tokio::test]
    async fn test_produce_before_connect_is_accepted() {
        let router = router().await;
        let transport = router
            .create_webrtc_transport(&WebRtcTransportOptions::default())
            .await
            .unwrap();
        let producer = transport
            .produce(MediaKind::Video, vp8_parameters(router.as_ref()))
            .await
            .unwrap();
        assert_eq!(producer.kind(), MediaKind::Video);
        assert_eq!(transport.dtls_state(), DtlsState::New);
    }

    #[tokio::test]
    async fn test_produce_rejects_kind_mismatch() {
        let router = router().await;
        let transport = router
            .create_webrtc_transport(&WebRtcTransportOptions::default())
            .await
            .unwrap();
        let result = transport
            .produce(MediaKind::Audio, vp8_parameters(router.as_ref()))
            .await;
        assert!(matches!(result, Err(EngineError::UnsupportedCodec(_))));
    }

    #[tokio::test]
    async fn test_consumer_starts_paused_and_closes_with_producer() {
        let router = router().await;
        let options = WebRtcTransportOptions::default();
        let send = router.create_webrtc_transport(&options).await.unwrap();
        let recv = router.create_webrtc_transport(&options).await.unwrap();
        let producer = send
            .produce(MediaKind::Video, vp8_parameters(router.as_ref()))
            .await
            .unwrap();

        let caps = router.rtp_capabilities();
        assert!(router.can_consume(producer.id(), &caps));
        let consumer = recv.consume(producer.id(), &caps, true).await.unwrap();
        assert!(consumer.is_paused());
        consumer.resume().await.unwrap();
        assert!(!consumer.is_paused());

        let mut events = consumer.subscribe();
        producer.close();
        assert!(consumer.is_closed());
        assert_eq!(events.recv().await.unwrap(), ConsumerEvent::ProducerClosed);
        assert!(!router.can_consume(producer.id(), &caps));
    }

    #[tokio::test]
    async fn test_transport_close_cascades() {
        let router = router().await;
        let transport = router
            .create_webrtc_transport(&WebRtcTransportOptions::default())
            .await
            .unwrap();
        let producer = transport
            .produce(MediaKind::Video, vp8_parameters(router.as_ref()))
            .await
            .unwrap();
        let mut events = producer.subscribe();

        transport.close();
        transport.close();
        assert!(producer.is_closed());
        assert_eq!(events.recv().await.unwrap(), ProducerEvent::TransportClosed);
        assert_eq!(events.recv().await.unwrap(), ProducerEvent::Closed);
    }

    #[tokio::test]
    async fn test_can_consume_rejects_incompatible_capabilities() {
        let router = router().await;
        let transport = router
            .create_webrtc_transport(&WebRtcTransportOptions::default())
            .await
            .unwrap();
        let producer = transport
            .produce(MediaKind::Video, vp8_parameters(router.as_ref()))
            .await
            .unwrap();

        let audio_only = RtpCapabilities {
            codecs: router
                .rtp_capabilities()
                .codecs_of(MediaKind::Audio)
                .cloned()
                .collect(),
            header_extensions: Vec::new(),
        };
        assert!(!router.can_consume(producer.id(), &audio_only));
        assert!(matches!(
            transport.consume(producer.id(), &audio_only, true).await,
            Err(EngineError::UnsupportedCodec(_))
        ));
    }

    #[tokio::test]
    async fn test_closed_objects_leave_their_transport() {
        let router = LoopbackEngine::new()
            .create_loopback_router(default_media_codecs())
            .await
            .unwrap();
        let options = WebRtcTransportOptions::default();
        let send = router.create_webrtc_transport(&options).await.unwrap();
        let recv = router.create_webrtc_transport(&options).await.unwrap();
        let send_handle = router.transport(send.id()).unwrap();
        let recv_handle = router.transport(recv.id()).unwrap();
        let caps = router.rtp_capabilities();

        for _ in 0..3 {
            let producer = send
                .produce(MediaKind::Video, vp8_parameters(&*router))
                .await
                .unwrap();
            let consumer = recv.consume(producer.id(), &caps, true).await.unwrap();
            assert!(router.consumer(consumer.id()).is_some());
            consumer.close();
            assert!(router.consumer(consumer.id()).is_none());
            assert_eq!(recv_handle.consumer_count(), 0);
            assert!(router.producer(producer.id()).unwrap().consumers.lock().is_empty());
            producer.close();
            assert!(router.producer(producer.id()).is_none());
        }
        assert_eq!(send_handle.producer_count(), 0);

        send.close();
        assert!(router.transport(send.id()).is_none());
        assert!(router.transport(recv.id()).is_some());
    }
}
