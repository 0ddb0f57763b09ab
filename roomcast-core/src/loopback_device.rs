//! In-process client device
//!
//! `LoopbackDevice` implements [`Device`] without capturing or rendering
//! anything. It performs the same negotiation a browser device does: codec
//! intersection on load, a lazy `Connect` on the first produce or consume of
//! each transport, and one `Produce` negotiation per published track. Remote
//! tracks it hands out end when their consumer is closed.

use crate::client::{
    Device, DeviceError, LocalConsumer, LocalProducer, Negotiation, NegotiationOutcome,
    Negotiator, ProduceOptions, RecvTransport, SendTransport,
};
use crate::media::MediaTrack;
use crate::signaling::SignalingError;
use crate::types::{
    default_media_codecs, ConsumerId, ConsumerParams, DtlsFingerprint, DtlsParameters, DtlsRole,
    MediaKind, ProducerId, RtpCapabilities, RtpCodecCapability, RtpCodecParameters,
    RtpEncodingParameters, RtpParameters, TransportId, TransportParams,
};
use async_trait::async_trait;
use parking_lot::Mutex;
use rand::Rng;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Weak};

/// Open objects of one transport; each removes itself on close
type Roster<T> = Arc<Mutex<Vec<Arc<T>>>>;

/// Client device that negotiates like a browser but moves no media
pub struct LoopbackDevice {
    supported: Vec<RtpCodecCapability>,
    capabilities: Mutex<Option<RtpCapabilities>>,
}

impl Default for LoopbackDevice {
    fn default() -> Self {
        Self::with_codecs(default_media_codecs())
    }
}

impl LoopbackDevice {
    /// Device supporting Opus and VP8
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Device supporting only `codecs`
    #[must_use]
    pub fn with_codecs(codecs: Vec<RtpCodecCapability>) -> Self {
        Self {
            supported: codecs,
            capabilities: Mutex::new(None),
        }
    }

    fn loaded(&self) -> Result<RtpCapabilities, DeviceError> {
        self.capabilities.lock().clone().ok_or(DeviceError::NotLoaded)
    }
}

impl Device for LoopbackDevice {
    fn load(&self, router_capabilities: RtpCapabilities) -> Result<(), DeviceError> {
        let mut slot = self.capabilities.lock();
        if slot.is_some() {
            return Err(DeviceError::AlreadyLoaded);
        }
        let codecs: Vec<_> = router_capabilities
            .codecs
            .into_iter()
            .filter(|router_codec| {
                self.supported.iter().any(|local| {
                    local.kind == router_codec.kind
                        && local.mime_type.eq_ignore_ascii_case(&router_codec.mime_type)
                        && local.clock_rate == router_codec.clock_rate
                        && local.channels == router_codec.channels
                })
            })
            .collect();
        if codecs.is_empty() {
            return Err(DeviceError::InvalidCapabilities(
                "no codec in common with the router".to_string(),
            ));
        }
        tracing::debug!(codecs = codecs.len(), "Device loaded");
        *slot = Some(RtpCapabilities {
            codecs,
            header_extensions: router_capabilities.header_extensions,
        });
        Ok(())
    }

    fn is_loaded(&self) -> bool {
        self.capabilities.lock().is_some()
    }

    fn rtp_capabilities(&self) -> Result<RtpCapabilities, DeviceError> {
        self.loaded()
    }

    fn can_produce(&self, kind: MediaKind) -> bool {
        self.capabilities
            .lock()
            .as_ref()
            .is_some_and(|caps| caps.has_kind(kind))
    }

    fn create_send_transport(
        &self,
        params: TransportParams,
        negotiator: Arc<dyn Negotiator>,
    ) -> Result<Arc<dyn SendTransport>, DeviceError> {
        let capabilities = self.loaded()?;
        Ok(Arc::new(LoopbackSendTransport::new(
            TransportLink::new(params, negotiator),
            capabilities,
        )))
    }

    fn create_recv_transport(
        &self,
        params: TransportParams,
        negotiator: Arc<dyn Negotiator>,
    ) -> Result<Arc<dyn RecvTransport>, DeviceError> {
        let capabilities = self.loaded()?;
        Ok(Arc::new(LoopbackRecvTransport::new(
            TransportLink::new(params, negotiator),
            capabilities,
        )))
    }
}

/// Negotiation state shared by both transport directions
struct TransportLink {
    params: TransportParams,
    negotiator: Arc<dyn Negotiator>,
    connected: tokio::sync::Mutex<bool>,
    closed: AtomicBool,
}

impl TransportLink {
    fn new(params: TransportParams, negotiator: Arc<dyn Negotiator>) -> Self {
        Self {
            params,
            negotiator,
            connected: tokio::sync::Mutex::new(false),
            closed: AtomicBool::new(false),
        }
    }

    fn id(&self) -> &TransportId {
        &self.params.id
    }

    fn ensure_open(&self) -> Result<(), DeviceError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(DeviceError::TransportClosed(self.id().to_string()));
        }
        Ok(())
    }

    fn local_dtls_parameters(&self) -> DtlsParameters {
        let digest = blake3::hash(format!("client:{}", self.id()).as_bytes());
        let value = digest
            .as_bytes()
            .iter()
            .map(|b| format!("{:02X}", b))
            .collect::<Vec<_>>()
            .join(":");
        DtlsParameters {
            role: DtlsRole::Client,
            fingerprints: vec![DtlsFingerprint {
                algorithm: "sha-256".to_string(),
                value,
            }],
        }
    }

    async fn ensure_connected(&self) -> Result<(), DeviceError> {
        let mut connected = self.connected.lock().await;
        if *connected {
            return Ok(());
        }
        let outcome = self
            .negotiator
            .negotiate(Negotiation::Connect {
                transport_id: self.id().clone(),
                dtls_parameters: self.local_dtls_parameters(),
            })
            .await?;
        if outcome != NegotiationOutcome::Connected {
            return Err(SignalingError::InvalidRequest(format!(
                "unexpected connect outcome {:?}",
                outcome
            ))
            .into());
        }
        *connected = true;
        tracing::debug!(transport_id = %self.id(), "Transport connected");
        Ok(())
    }
}

struct LoopbackSendTransport {
    link: TransportLink,
    capabilities: RtpCapabilities,
    next_mid: AtomicU32,
    producers: Roster<LoopbackProducer>,
}

impl LoopbackSendTransport {
    fn new(link: TransportLink, capabilities: RtpCapabilities) -> Self {
        Self {
            link,
            capabilities,
            next_mid: AtomicU32::new(0),
            producers: Arc::default(),
        }
    }

    fn send_parameters(
        &self,
        codec: &RtpCodecCapability,
        options: &ProduceOptions,
    ) -> RtpParameters {
        let payload_type = codec.preferred_payload_type.unwrap_or(100);
        let mut codec = RtpCodecParameters::from_capability(codec, payload_type);
        if let Some(bitrate) = options.video_google_start_bitrate {
            codec
                .parameters
                .insert("x-google-start-bitrate".to_string(), Value::from(bitrate));
        }

        let mut rng = rand::thread_rng();
        let encodings = if options.encodings.is_empty() {
            vec![RtpEncodingParameters {
                ssrc: Some(rng.gen()),
                ..Default::default()
            }]
        } else {
            options
                .encodings
                .iter()
                .map(|e| RtpEncodingParameters {
                    ssrc: Some(rng.gen()),
                    ..e.clone()
                })
                .collect()
        };

        RtpParameters {
            mid: Some(self.next_mid.fetch_add(1, Ordering::SeqCst).to_string()),
            codecs: vec![codec],
            header_extensions: Vec::new(),
            encodings,
            rtcp: None,
        }
    }
}

#[async_trait]
impl SendTransport for LoopbackSendTransport {
    fn id(&self) -> &TransportId {
        self.link.id()
    }

    async fn produce(
        &self,
        options: ProduceOptions,
    ) -> Result<Arc<dyn LocalProducer>, DeviceError> {
        self.link.ensure_open()?;
        if !options.track.is_live() {
            return Err(DeviceError::TrackEnded(options.track.id().to_string()));
        }
        let kind = options.track.kind();
        let codec = self
            .capabilities
            .codecs_of(kind)
            .next()
            .ok_or(DeviceError::CannotProduce(kind))?;
        let rtp_parameters = self.send_parameters(codec, &options);

        self.link.ensure_connected().await?;
        let outcome = self
            .link
            .negotiator
            .negotiate(Negotiation::Produce {
                transport_id: self.id().clone(),
                kind,
                rtp_parameters,
            })
            .await?;
        let NegotiationOutcome::Produced { producer_id } = outcome else {
            return Err(SignalingError::InvalidRequest(format!(
                "unexpected produce outcome {:?}",
                outcome
            ))
            .into());
        };

        let producer = Arc::new(LoopbackProducer {
            id: producer_id,
            track: options.track,
            closed: AtomicBool::new(false),
            roster: Arc::downgrade(&self.producers),
        });
        self.producers.lock().push(producer.clone());
        Ok(producer)
    }

    fn close(&self) {
        if self.link.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let producers = std::mem::take(&mut *self.producers.lock());
        for producer in producers {
            producer.close();
        }
    }
}

struct LoopbackRecvTransport {
    link: TransportLink,
    capabilities: RtpCapabilities,
    consumers: Roster<LoopbackConsumer>,
}

impl LoopbackRecvTransport {
    fn new(link: TransportLink, capabilities: RtpCapabilities) -> Self {
        Self {
            link,
            capabilities,
            consumers: Arc::default(),
        }
    }
}

#[async_trait]
impl RecvTransport for LoopbackRecvTransport {
    fn id(&self) -> &TransportId {
        self.link.id()
    }

    async fn consume(
        &self,
        params: ConsumerParams,
    ) -> Result<Arc<dyn LocalConsumer>, DeviceError> {
        self.link.ensure_open()?;
        let decodable = params
            .rtp_parameters
            .primary_codec()
            .is_some_and(|codec| self.capabilities.supports(codec));
        if !decodable {
            return Err(DeviceError::InvalidCapabilities(format!(
                "cannot decode consumer {}",
                params.id
            )));
        }
        self.link.ensure_connected().await?;

        let track = MediaTrack::with_id(
            format!("remote-{}", params.id),
            params.kind,
            format!("producer {}", params.producer_id),
        );
        let consumer = Arc::new(LoopbackConsumer {
            id: params.id,
            producer_id: params.producer_id,
            track,
            closed: AtomicBool::new(false),
            roster: Arc::downgrade(&self.consumers),
        });
        self.consumers.lock().push(consumer.clone());
        Ok(consumer)
    }

    fn close(&self) {
        if self.link.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let consumers = std::mem::take(&mut *self.consumers.lock());
        for consumer in consumers {
            consumer.close();
        }
    }
}

struct LoopbackProducer {
    id: ProducerId,
    track: MediaTrack,
    closed: AtomicBool,
    roster: Weak<Mutex<Vec<Arc<LoopbackProducer>>>>,
}

impl LocalProducer for LoopbackProducer {
    fn id(&self) -> &ProducerId {
        &self.id
    }

    fn kind(&self) -> MediaKind {
        self.track.kind()
    }

    fn track(&self) -> &MediaTrack {
        &self.track
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(roster) = self.roster.upgrade() {
            roster.lock().retain(|p| p.id != self.id);
        }
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

struct LoopbackConsumer {
    id: ConsumerId,
    producer_id: ProducerId,
    track: MediaTrack,
    closed: AtomicBool,
    roster: Weak<Mutex<Vec<Arc<LoopbackConsumer>>>>,
}

impl LocalConsumer for LoopbackConsumer {
    fn id(&self) -> &ConsumerId {
        &self.id
    }

    fn producer_id(&self) -> &ProducerId {
        &self.producer_id
    }

    fn kind(&self) -> MediaKind {
        self.track.kind()
    }

    fn track(&self) -> &MediaTrack {
        &self.track
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.track.stop();
        if let Some(roster) = self.roster.upgrade() {
            roster.lock().retain(|c| c.id != self.id);
        }
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}
