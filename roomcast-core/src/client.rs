//! Client-side session controller
//!
//! [`SessionController`] drives one participant: it loads the local device
//! with the relay's codec set, opens one send and one receive transport,
//! publishes local tracks and turns every discovered remote producer into a
//! live track in the [`TrackAggregator`].
//!
//! The local media stack is abstracted as a [`Device`]. Its transports never
//! talk to the relay themselves; when they need the DTLS handshake or a
//! producer id they hand a [`Negotiation`] to the [`Negotiator`] supplied at
//! creation and suspend until it resolves.
//!
//! # Example
//!
//! ```ignore
//! let controller = SessionController::new(channel, device, ClientConfig::default());
//! controller.init().await?;
//! controller.start_producing(&LocalMedia::capture(true, true)).await?;
//! for aggregate in controller.aggregator().aggregates() {
//!     println!("{} has {} tracks", aggregate.peer_id, aggregate.track_count());
//! }
//! ```

use crate::aggregator::TrackAggregator;
use crate::identity::PeerId;
use crate::media::{LocalMedia, MediaTrack};
use crate::signaling::{
    CloseProducerRequest, ConnectTransportRequest, ConsumeRequest, Notification, ProduceRequest,
    Request, Response, ResumeConsumerRequest, SignalingChannel, SignalingError,
};
use crate::types::{
    default_video_encodings, ConsumerId, ConsumerParams, DtlsParameters, MediaKind, ProducerId,
    ProducerInfo, RtpCapabilities, RtpEncodingParameters, RtpParameters, TransportId,
    TransportParams, VIDEO_GOOGLE_START_BITRATE,
};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Local device errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DeviceError {
    /// `load` has not been called
    #[error("Device not loaded")]
    NotLoaded,

    /// `load` called twice
    #[error("Device already loaded")]
    AlreadyLoaded,

    /// Router capabilities unusable
    #[error("Invalid capabilities: {0}")]
    InvalidCapabilities(String),

    /// The device cannot send this kind with the router's codecs
    #[error("Cannot produce {0}")]
    CannotProduce(MediaKind),

    /// Track already ended
    #[error("Track ended: {0}")]
    TrackEnded(String),

    /// Transport closed
    #[error("Transport closed: {0}")]
    TransportClosed(String),

    /// The relay rejected a negotiation
    #[error("Negotiation failed: {0}")]
    Negotiation(#[from] SignalingError),
}

/// Client errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ClientError {
    /// Initialization has not completed
    #[error("Session not ready")]
    NotReady,

    /// Signaling request failed
    #[error("Signaling error: {0}")]
    Signaling(#[from] SignalingError),

    /// Local device failure
    #[error("Device error: {0}")]
    Device(#[from] DeviceError),
}

/// Configuration for the session controller
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Bound for ordinary requests, in milliseconds
    pub request_timeout_ms: u64,
    /// Bound for transport creation, in milliseconds
    pub transport_timeout_ms: u64,
    /// Encodings used for every video producer
    pub video_encodings: Vec<RtpEncodingParameters>,
    /// `videoGoogleStartBitrate` codec option
    pub video_google_start_bitrate: u32,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            request_timeout_ms: 5_000,
            transport_timeout_ms: 10_000,
            video_encodings: default_video_encodings(),
            video_google_start_bitrate: VIDEO_GOOGLE_START_BITRATE,
        }
    }
}

impl ClientConfig {
    /// Request bound as a `Duration`
    #[must_use]
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    /// Transport creation bound as a `Duration`
    #[must_use]
    pub fn transport_timeout(&self) -> Duration {
        Duration::from_millis(self.transport_timeout_ms)
    }
}

/// Something a device transport needs from the relay
#[derive(Debug, Clone, PartialEq)]
pub enum Negotiation {
    /// Complete the DTLS handshake
    Connect {
        /// Transport to connect
        transport_id: TransportId,
        /// Local DTLS parameters
        dtls_parameters: DtlsParameters,
    },
    /// Register a new producer
    Produce {
        /// Send transport
        transport_id: TransportId,
        /// Media kind
        kind: MediaKind,
        /// Send parameters
        rtp_parameters: RtpParameters,
    },
}

/// Answer to a [`Negotiation`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NegotiationOutcome {
    /// Handshake acknowledged
    Connected,
    /// Producer registered under this id
    Produced {
        /// Relay-assigned producer id
        producer_id: ProducerId,
    },
}

/// Answers device negotiations
#[async_trait]
pub trait Negotiator: Send + Sync {
    /// Resolve one negotiation
    ///
    /// # Errors
    ///
    /// Returns the relay's structured error
    async fn negotiate(&self, negotiation: Negotiation)
        -> Result<NegotiationOutcome, SignalingError>;
}

/// Options for publishing one track
#[derive(Debug, Clone)]
pub struct ProduceOptions {
    /// Track to publish
    pub track: MediaTrack,
    /// Encodings (simulcast layers); empty for a single default encoding
    pub encodings: Vec<RtpEncodingParameters>,
    /// Initial video bitrate hint in kbps
    pub video_google_start_bitrate: Option<u32>,
}

/// Local media stack
pub trait Device: Send + Sync {
    /// Load the router's codec set
    ///
    /// # Errors
    ///
    /// Returns error if already loaded or the capabilities are unusable
    fn load(&self, router_capabilities: RtpCapabilities) -> Result<(), DeviceError>;

    /// Whether `load` succeeded
    fn is_loaded(&self) -> bool;

    /// Receive capabilities to send with consume requests
    ///
    /// # Errors
    ///
    /// Returns `NotLoaded` before `load`
    fn rtp_capabilities(&self) -> Result<RtpCapabilities, DeviceError>;

    /// Whether the device can send `kind`
    fn can_produce(&self, kind: MediaKind) -> bool;

    /// Build the local side of a send transport
    ///
    /// # Errors
    ///
    /// Returns `NotLoaded` before `load`
    fn create_send_transport(
        &self,
        params: TransportParams,
        negotiator: Arc<dyn Negotiator>,
    ) -> Result<Arc<dyn SendTransport>, DeviceError>;

    /// Build the local side of a receive transport
    ///
    /// # Errors
    ///
    /// Returns `NotLoaded` before `load`
    fn create_recv_transport(
        &self,
        params: TransportParams,
        negotiator: Arc<dyn Negotiator>,
    ) -> Result<Arc<dyn RecvTransport>, DeviceError>;
}

/// Local side of a send transport
#[async_trait]
pub trait SendTransport: Send + Sync {
    /// Transport id
    fn id(&self) -> &TransportId;

    /// Publish a track; negotiates `Connect` first if this is the first use
    ///
    /// # Errors
    ///
    /// Returns error if negotiation fails or the track cannot be sent
    async fn produce(&self, options: ProduceOptions) -> Result<Arc<dyn LocalProducer>, DeviceError>;

    /// Close the transport and its producers
    fn close(&self);
}

/// Local side of a receive transport
#[async_trait]
pub trait RecvTransport: Send + Sync {
    /// Transport id
    fn id(&self) -> &TransportId;

    /// Bind a consumer the relay created; negotiates `Connect` on first use
    ///
    /// # Errors
    ///
    /// Returns error if negotiation fails
    async fn consume(&self, params: ConsumerParams) -> Result<Arc<dyn LocalConsumer>, DeviceError>;

    /// Close the transport and its consumers
    fn close(&self);
}

/// A published local track
pub trait LocalProducer: Send + Sync {
    /// Relay-assigned id
    fn id(&self) -> &ProducerId;
    /// Media kind
    fn kind(&self) -> MediaKind;
    /// Source track
    fn track(&self) -> &MediaTrack;
    /// Stop sending
    fn close(&self);
    /// Whether closed
    fn is_closed(&self) -> bool;
}

/// A received remote track
pub trait LocalConsumer: Send + Sync {
    /// Relay-assigned id
    fn id(&self) -> &ConsumerId;
    /// Producer being received
    fn producer_id(&self) -> &ProducerId;
    /// Media kind
    fn kind(&self) -> MediaKind;
    /// Delivered track
    fn track(&self) -> &MediaTrack;
    /// Stop receiving; ends the track
    fn close(&self);
    /// Whether closed
    fn is_closed(&self) -> bool;
}

/// [`Negotiator`] backed by a signaling channel
pub struct ChannelNegotiator<C: SignalingChannel> {
    channel: Arc<C>,
    timeout: Duration,
}

impl<C: SignalingChannel> ChannelNegotiator<C> {
    /// Negotiate over `channel`, bounding every request by `timeout`
    pub fn new(channel: Arc<C>, timeout: Duration) -> Self {
        Self { channel, timeout }
    }
}

#[async_trait]
impl<C: SignalingChannel> Negotiator for ChannelNegotiator<C> {
    async fn negotiate(
        &self,
        negotiation: Negotiation,
    ) -> Result<NegotiationOutcome, SignalingError> {
        match negotiation {
            Negotiation::Connect {
                transport_id,
                dtls_parameters,
            } => {
                let request = Request::ConnectTransport(ConnectTransportRequest {
                    transport_id,
                    dtls_parameters,
                });
                bounded_request(self.channel.as_ref(), request, self.timeout).await?;
                Ok(NegotiationOutcome::Connected)
            }
            Negotiation::Produce {
                transport_id,
                kind,
                rtp_parameters,
            } => {
                let request = Request::Produce(ProduceRequest {
                    transport_id,
                    kind,
                    rtp_parameters,
                });
                let producer_id = bounded_request(self.channel.as_ref(), request, self.timeout)
                    .await?
                    .into_producer_id()?;
                Ok(NegotiationOutcome::Produced { producer_id })
            }
        }
    }
}

async fn bounded_request<C: SignalingChannel + ?Sized>(
    channel: &C,
    request: Request,
    limit: Duration,
) -> Result<Response, SignalingError> {
    let method = request.method();
    tokio::time::timeout(limit, channel.request(request))
        .await
        .map_err(|_| SignalingError::Timeout(format!("{} exceeded {:?}", method, limit)))?
}

/// Controller readiness
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControllerState {
    /// Not initialized, or initialization failed; producing is disabled
    NotReady,
    /// Transports open, notifications flowing
    Ready,
    /// Shut down
    Closed,
}

/// Result of publishing one track
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProduceOutcome {
    /// Track kind
    pub kind: MediaKind,
    /// Track id
    pub track_id: String,
    /// Producer id, or why the track was not published
    pub result: Result<ProducerId, ClientError>,
}

/// Per-track results of [`SessionController::start_producing`]
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProduceReport {
    /// One entry per attempted track
    pub outcomes: Vec<ProduceOutcome>,
}

impl ProduceReport {
    /// Producers that were created
    #[must_use]
    pub fn producer_ids(&self) -> Vec<ProducerId> {
        self.outcomes
            .iter()
            .filter_map(|o| o.result.as_ref().ok().cloned())
            .collect()
    }

    /// Tracks that failed
    #[must_use]
    pub fn failures(&self) -> Vec<&ProduceOutcome> {
        self.outcomes.iter().filter(|o| o.result.is_err()).collect()
    }
}

struct RemoteConsumer {
    peer_id: PeerId,
    consumer: Arc<dyn LocalConsumer>,
}

struct Inner<C: SignalingChannel, D: Device> {
    channel: Arc<C>,
    device: D,
    config: ClientConfig,
    aggregator: Arc<TrackAggregator>,
    state: watch::Sender<ControllerState>,
    notifications: Mutex<Option<mpsc::UnboundedReceiver<Notification>>>,
    send_transport: Mutex<Option<Arc<dyn SendTransport>>>,
    recv_transport: Mutex<Option<Arc<dyn RecvTransport>>>,
    producers: Mutex<HashMap<MediaKind, Arc<dyn LocalProducer>>>,
    consumers: Mutex<HashMap<ConsumerId, RemoteConsumer>>,
    notification_task: Mutex<Option<JoinHandle<()>>>,
}

/// Drives one participant's session with the relay
pub struct SessionController<C: SignalingChannel + 'static, D: Device + 'static> {
    inner: Arc<Inner<C, D>>,
}

impl<C: SignalingChannel + 'static, D: Device + 'static> SessionController<C, D> {
    /// Create a controller; call [`Self::init`] before producing
    pub fn new(channel: Arc<C>, device: D, config: ClientConfig) -> Self {
        let (state, _) = watch::channel(ControllerState::NotReady);
        Self {
            inner: Arc::new(Inner {
                channel,
                device,
                config,
                aggregator: Arc::new(TrackAggregator::new()),
                state,
                notifications: Mutex::new(None),
                send_transport: Mutex::new(None),
                recv_transport: Mutex::new(None),
                producers: Mutex::new(HashMap::new()),
                consumers: Mutex::new(HashMap::new()),
                notification_task: Mutex::new(None),
            }),
        }
    }

    /// Current readiness
    #[must_use]
    pub fn state(&self) -> ControllerState {
        *self.inner.state.borrow()
    }

    /// Whether producing is enabled
    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.state() == ControllerState::Ready
    }

    /// Watch readiness changes
    #[must_use]
    pub fn subscribe_state(&self) -> watch::Receiver<ControllerState> {
        self.inner.state.subscribe()
    }

    /// Remote peers' tracks
    #[must_use]
    pub fn aggregator(&self) -> &Arc<TrackAggregator> {
        &self.inner.aggregator
    }

    /// Local device
    #[must_use]
    pub fn device(&self) -> &D {
        &self.inner.device
    }

    /// Ids of the current local producers
    #[must_use]
    pub fn producer_ids(&self) -> Vec<ProducerId> {
        self.inner
            .producers
            .lock()
            .values()
            .map(|p| p.id().clone())
            .collect()
    }

    /// Number of live remote consumers
    #[must_use]
    pub fn consumer_count(&self) -> usize {
        self.inner.consumers.lock().len()
    }

    /// Bring the session up
    ///
    /// Capabilities, device load, send transport, receive transport, then
    /// notification processing. Any failure leaves the controller
    /// `NotReady`; calling again retries from the start.
    ///
    /// # Errors
    ///
    /// Returns the first failing step's error
    pub async fn init(&self) -> Result<(), ClientError> {
        match self.state() {
            ControllerState::Ready => return Ok(()),
            ControllerState::Closed => return Err(ClientError::NotReady),
            ControllerState::NotReady => {}
        }

        {
            let mut slot = self.inner.notifications.lock();
            if slot.is_none() {
                *slot = self.inner.channel.take_notifications();
            }
            if slot.is_none() {
                return Err(SignalingError::ChannelClosed(
                    "notification stream unavailable".to_string(),
                )
                .into());
            }
        }

        match self.bring_up().await {
            Ok(()) => {
                let Some(notifications) = self.inner.notifications.lock().take() else {
                    return Err(ClientError::NotReady);
                };
                let inner = self.inner.clone();
                let task = tokio::spawn(async move { inner.run_notifications(notifications).await });
                *self.inner.notification_task.lock() = Some(task);
                self.inner.state.send_replace(ControllerState::Ready);
                info!("Session ready");
                Ok(())
            }
            Err(e) => {
                warn!(error = %e, "Session initialization failed");
                if let Some(t) = self.inner.send_transport.lock().take() {
                    t.close();
                }
                if let Some(t) = self.inner.recv_transport.lock().take() {
                    t.close();
                }
                self.inner.state.send_replace(ControllerState::NotReady);
                Err(e)
            }
        }
    }

    async fn bring_up(&self) -> Result<(), ClientError> {
        let inner = &self.inner;
        let capabilities = inner
            .request(Request::GetRouterRtpCapabilities, inner.config.request_timeout())
            .await?
            .into_rtp_capabilities()?;
        if !inner.device.is_loaded() {
            inner.device.load(capabilities)?;
        }

        let negotiator: Arc<dyn Negotiator> = Arc::new(ChannelNegotiator::new(
            inner.channel.clone(),
            inner.config.request_timeout(),
        ));

        let send_params = inner
            .request(Request::CreateTransport, inner.config.transport_timeout())
            .await?
            .into_transport_params()?;
        let send = inner
            .device
            .create_send_transport(send_params, negotiator.clone())?;
        debug!(transport_id = %send.id(), "Send transport ready");
        *inner.send_transport.lock() = Some(send);

        let recv_params = inner
            .request(Request::CreateTransport, inner.config.transport_timeout())
            .await?
            .into_transport_params()?;
        let recv = inner.device.create_recv_transport(recv_params, negotiator)?;
        debug!(transport_id = %recv.id(), "Receive transport ready");
        *inner.recv_transport.lock() = Some(recv);
        Ok(())
    }

    /// Publish local tracks, video first
    ///
    /// Each track succeeds or fails on its own; a kind with no track is
    /// simply skipped. A new track replaces the current producer of its kind.
    ///
    /// # Errors
    ///
    /// Returns `NotReady` before init, or the first error if every track failed
    pub async fn start_producing(&self, media: &LocalMedia) -> Result<ProduceReport, ClientError> {
        let send = self
            .inner
            .send_transport
            .lock()
            .clone()
            .filter(|_| self.is_ready())
            .ok_or(ClientError::NotReady)?;

        let mut report = ProduceReport::default();
        for track in media.video_tracks().chain(media.audio_tracks()) {
            let result = self.produce_track(send.as_ref(), track.clone()).await;
            if let Err(e) = &result {
                warn!(kind = %track.kind(), track_id = track.id(), error = %e, "Failed to produce track");
            }
            report.outcomes.push(ProduceOutcome {
                kind: track.kind(),
                track_id: track.id().to_string(),
                result,
            });
        }

        if !report.outcomes.is_empty() && report.outcomes.iter().all(|o| o.result.is_err()) {
            let first = report
                .outcomes
                .into_iter()
                .find_map(|o| o.result.err())
                .unwrap_or(ClientError::NotReady);
            return Err(first);
        }
        Ok(report)
    }

    async fn produce_track(
        &self,
        send: &dyn SendTransport,
        track: MediaTrack,
    ) -> Result<ProducerId, ClientError> {
        let kind = track.kind();
        if !self.inner.device.can_produce(kind) {
            return Err(DeviceError::CannotProduce(kind).into());
        }
        let previous = self.inner.producers.lock().remove(&kind);
        if let Some(previous) = previous {
            debug!(%kind, producer_id = %previous.id(), "Replacing producer");
            self.inner.close_remote_producer(previous).await;
        }

        let options = match kind {
            MediaKind::Video => ProduceOptions {
                track: track.clone(),
                encodings: self.inner.config.video_encodings.clone(),
                video_google_start_bitrate: Some(self.inner.config.video_google_start_bitrate),
            },
            MediaKind::Audio => ProduceOptions {
                track: track.clone(),
                encodings: Vec::new(),
                video_google_start_bitrate: None,
            },
        };
        let producer = send.produce(options).await?;
        let producer_id = producer.id().clone();
        self.inner.producers.lock().insert(kind, producer.clone());

        let inner = Arc::downgrade(&self.inner);
        tokio::spawn(async move {
            producer.track().ended().await;
            let Some(inner) = inner.upgrade() else {
                return;
            };
            let current = {
                let mut producers = inner.producers.lock();
                match producers.get(&kind) {
                    Some(p) if p.id() == producer.id() => producers.remove(&kind),
                    _ => None,
                }
            };
            if let Some(current) = current {
                debug!(%kind, producer_id = %current.id(), "Local track ended");
                inner.close_remote_producer(current).await;
            }
        });

        info!(%kind, %producer_id, "Producing");
        Ok(producer_id)
    }

    /// Stop every local producer
    ///
    /// Safe to call with nothing published.
    ///
    /// # Errors
    ///
    /// Currently infallible; relay-side failures are logged
    pub async fn stop_producing(&self) -> Result<usize, ClientError> {
        let producers: Vec<_> = self.inner.producers.lock().drain().map(|(_, p)| p).collect();
        let count = producers.len();
        for producer in producers {
            self.inner.close_remote_producer(producer).await;
        }
        if count > 0 {
            info!(count, "Stopped producing");
        }
        Ok(count)
    }

    /// Tear the session down
    ///
    /// Every local producer is closed and withdrawn from the relay in the
    /// background. The channel itself is left to its owner.
    pub fn close(&self) {
        if self.inner.state.send_replace(ControllerState::Closed) == ControllerState::Closed {
            return;
        }
        if let Some(task) = self.inner.notification_task.lock().take() {
            task.abort();
        }
        let producers: Vec<_> = self.inner.producers.lock().drain().map(|(_, p)| p).collect();
        for producer in &producers {
            producer.close();
        }
        self.inner
            .withdraw_producers(producers.iter().map(|p| p.id().clone()).collect());
        for (_, remote) in self.inner.consumers.lock().drain() {
            remote.consumer.close();
        }
        if let Some(t) = self.inner.send_transport.lock().take() {
            t.close();
        }
        if let Some(t) = self.inner.recv_transport.lock().take() {
            t.close();
        }
        debug!("Session closed");
    }
}

impl<C: SignalingChannel + 'static, D: Device + 'static> Drop for SessionController<C, D> {
    fn drop(&mut self) {
        self.close();
    }
}

impl<C: SignalingChannel + 'static, D: Device + 'static> Inner<C, D> {
    async fn request(
        &self,
        request: Request,
        limit: Duration,
    ) -> Result<Response, SignalingError> {
        bounded_request(self.channel.as_ref(), request, limit).await
    }

    async fn close_remote_producer(&self, producer: Arc<dyn LocalProducer>) {
        producer.close();
        let request = Request::CloseProducer(CloseProducerRequest {
            producer_id: producer.id().clone(),
        });
        if let Err(e) = self.request(request, self.config.request_timeout()).await {
            debug!(producer_id = %producer.id(), error = %e, "close-producer not acknowledged");
        }
    }

    /// Send `close-producer` for each id without holding the controller
    fn withdraw_producers(&self, producer_ids: Vec<ProducerId>) {
        if producer_ids.is_empty() {
            return;
        }
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            debug!(count = producer_ids.len(), "No runtime, producers released on disconnect");
            return;
        };
        let channel = self.channel.clone();
        let limit = self.config.request_timeout();
        runtime.spawn(async move {
            for producer_id in producer_ids {
                let request = Request::CloseProducer(CloseProducerRequest {
                    producer_id: producer_id.clone(),
                });
                if let Err(e) = bounded_request(channel.as_ref(), request, limit).await {
                    debug!(%producer_id, error = %e, "close-producer not acknowledged");
                }
            }
        });
    }

    async fn run_notifications(
        self: Arc<Self>,
        mut notifications: mpsc::UnboundedReceiver<Notification>,
    ) {
        while let Some(notification) = notifications.recv().await {
            debug!(event = notification.event(), "Notification");
            match notification {
                Notification::ExistingProducers { producer_ids } => {
                    for info in producer_ids {
                        self.clone().subscribe(info).await;
                    }
                }
                Notification::NewProducer(info) => self.clone().subscribe(info).await,
                Notification::PeerLeft { peer_id } => self.forget_peer(&peer_id),
                Notification::ProducerClosed { producer_id } => {
                    // The consumer's own close event removes the track.
                    debug!(%producer_id, "Remote producer closed");
                }
                Notification::ConsumerClosed { consumer_id } => {
                    let removed = self.consumers.lock().remove(&consumer_id);
                    if let Some(remote) = removed {
                        remote.consumer.close();
                    }
                }
            }
        }
        debug!("Notification stream ended");
    }

    async fn subscribe(self: Arc<Self>, info: ProducerInfo) {
        if let Err(e) = self.clone().try_subscribe(&info).await {
            warn!(
                producer_id = %info.producer_id,
                peer_id = %info.peer_id,
                error = %e,
                "Failed to receive remote producer"
            );
        }
    }

    async fn try_subscribe(self: Arc<Self>, info: &ProducerInfo) -> Result<(), ClientError> {
        let recv = self
            .recv_transport
            .lock()
            .clone()
            .ok_or(ClientError::NotReady)?;
        let rtp_capabilities = self.device.rtp_capabilities()?;

        let params = self
            .request(
                Request::Consume(ConsumeRequest {
                    transport_id: recv.id().clone(),
                    producer_id: info.producer_id.clone(),
                    rtp_capabilities,
                }),
                self.config.request_timeout(),
            )
            .await?
            .into_consumer_params()?;
        let consumer = recv.consume(params).await?;

        let resumed = self
            .request(
                Request::ResumeConsumer(ResumeConsumerRequest {
                    consumer_id: consumer.id().clone(),
                }),
                self.config.request_timeout(),
            )
            .await;
        if let Err(e) = resumed {
            consumer.close();
            return Err(e.into());
        }

        let track = consumer.track().clone();
        let kind = consumer.kind();
        let consumer_id = consumer.id().clone();
        self.consumers.lock().insert(
            consumer_id.clone(),
            RemoteConsumer {
                peer_id: info.peer_id,
                consumer: consumer.clone(),
            },
        );
        if !self.aggregator.add_track(info.peer_id, kind, track.clone()) {
            self.consumers.lock().remove(&consumer_id);
            consumer.close();
            return Err(DeviceError::TrackEnded(track.id().to_string()).into());
        }

        let inner = Arc::downgrade(&self);
        let peer_id = info.peer_id;
        tokio::spawn(async move {
            track.ended().await;
            let Some(inner) = inner.upgrade() else {
                return;
            };
            inner.aggregator.remove_track_if(&peer_id, kind, track.id());
            let removed = inner.consumers.lock().remove(&consumer_id);
            if let Some(remote) = removed {
                remote.consumer.close();
            }
        });

        debug!(producer_id = %info.producer_id, peer_id = %info.peer_id, %kind, "Receiving");
        Ok(())
    }

    fn forget_peer(&self, peer_id: &PeerId) {
        self.aggregator.remove_peer(peer_id);
        let closed: Vec<_> = {
            let mut consumers = self.consumers.lock();
            let ids: Vec<_> = consumers
                .iter()
                .filter(|(_, c)| c.peer_id == *peer_id)
                .map(|(id, _)| id.clone())
                .collect();
            ids.into_iter()
                .filter_map(|id| consumers.remove(&id))
                .collect()
        };
        for remote in &closed {
            remote.consumer.close();
        }
        debug!(%peer_id, consumers = closed.len(), "Peer left");
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_client_config_defaults() {
        let config = ClientConfig::default();
        assert_eq!(config.request_timeout(), Duration::from_secs(5));
        assert_eq!(config.transport_timeout(), Duration::from_secs(10));
        assert_eq!(config.video_encodings.len(), 3);
        assert_eq!(config.video_google_start_bitrate, 1000);
    }

    #[test]
    fn test_produce_report_helpers() {
        let report = ProduceReport {
            outcomes: vec![
                ProduceOutcome {
                    kind: MediaKind::Video,
                    track_id: "v".to_string(),
                    result: Ok(ProducerId::from("p-1")),
                },
                ProduceOutcome {
                    kind: MediaKind::Audio,
                    track_id: "a".to_string(),
                    result: Err(DeviceError::CannotProduce(MediaKind::Audio).into()),
                },
            ],
        };
        assert_eq!(report.producer_ids(), vec![ProducerId::from("p-1")]);
        assert_eq!(report.failures().len(), 1);
        assert_eq!(report.failures()[0].kind, MediaKind::Audio);
    }
}
