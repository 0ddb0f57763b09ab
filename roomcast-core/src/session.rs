//! Per-peer session state
//!
//! A [`PeerSession`] owns the transports, producers and consumers created for
//! one connection. Every resource moves through the lifecycle defined by
//! [`TransportState`], [`ProducerState`] and [`ConsumerState`]; illegal
//! transitions are rejected and a resource leaves its map exactly once.

use crate::engine::{EngineConsumer, EngineProducer, EngineTransport};
use crate::identity::PeerId;
use crate::signaling::Notification;
use crate::types::{
    ConsumerId, ConsumerState, MediaKind, ProducerId, ProducerInfo, ProducerState, TransportId,
    TransportState,
};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;

/// Session errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    /// Resource is not owned by this session
    #[error("Not owned: {0}")]
    NotOwned(String),

    /// Lifecycle transition not allowed
    #[error("Invalid transition for {resource}: {from} -> {to}")]
    InvalidTransition {
        /// Resource id
        resource: String,
        /// Current state
        from: String,
        /// Requested state
        to: String,
    },
}

/// Transport owned by a session
#[derive(Clone)]
pub struct TransportEntry {
    /// Engine handle
    pub handle: Arc<dyn EngineTransport>,
    /// Lifecycle state
    pub state: TransportState,
}

/// Producer owned by a session
#[derive(Clone)]
pub struct ProducerEntry {
    /// Engine handle
    pub handle: Arc<dyn EngineProducer>,
    /// Send transport the producer is bound to
    pub transport_id: TransportId,
    /// Lifecycle state
    pub state: ProducerState,
    seq: u64,
}

/// Consumer owned by a session
#[derive(Clone)]
pub struct ConsumerEntry {
    /// Engine handle
    pub handle: Arc<dyn EngineConsumer>,
    /// Receive transport the consumer is bound to
    pub transport_id: TransportId,
    /// Lifecycle state
    pub state: ConsumerState,
}

/// State of one connected peer
#[derive(Clone)]
pub struct PeerSession {
    peer_id: PeerId,
    connected_at: DateTime<Utc>,
    outbound: mpsc::UnboundedSender<Notification>,
    transports: HashMap<TransportId, TransportEntry>,
    producers: HashMap<ProducerId, ProducerEntry>,
    consumers: HashMap<ConsumerId, ConsumerEntry>,
    next_seq: u64,
    pub(crate) join_seq: u64,
}

impl PeerSession {
    /// Create an empty session delivering notifications to `outbound`
    #[must_use]
    pub fn new(peer_id: PeerId, outbound: mpsc::UnboundedSender<Notification>) -> Self {
        Self {
            peer_id,
            connected_at: Utc::now(),
            outbound,
            transports: HashMap::new(),
            producers: HashMap::new(),
            consumers: HashMap::new(),
            next_seq: 0,
            join_seq: 0,
        }
    }

    /// Connection id
    #[must_use]
    pub fn peer_id(&self) -> PeerId {
        self.peer_id
    }

    /// Time the session was created
    #[must_use]
    pub fn connected_at(&self) -> DateTime<Utc> {
        self.connected_at
    }

    /// Queue a notification for this peer
    ///
    /// Returns false if the connection has gone away.
    pub fn notify(&self, notification: Notification) -> bool {
        self.outbound.send(notification).is_ok()
    }

    /// Record a freshly allocated transport
    pub fn add_transport(&mut self, handle: Arc<dyn EngineTransport>) {
        self.transports.insert(
            handle.id().clone(),
            TransportEntry {
                handle,
                state: TransportState::Created,
            },
        );
    }

    /// Transport owned by this session
    #[must_use]
    pub fn transport(&self, transport_id: &TransportId) -> Option<&TransportEntry> {
        self.transports.get(transport_id)
    }

    /// Move a transport to `next`
    ///
    /// # Errors
    ///
    /// Returns error if the transport is not owned or the transition is illegal
    pub fn set_transport_state(
        &mut self,
        transport_id: &TransportId,
        next: TransportState,
    ) -> Result<Arc<dyn EngineTransport>, SessionError> {
        let entry = self
            .transports
            .get_mut(transport_id)
            .ok_or_else(|| SessionError::NotOwned(transport_id.to_string()))?;
        if !entry.state.can_transition_to(next) {
            return Err(SessionError::InvalidTransition {
                resource: transport_id.to_string(),
                from: format!("{:?}", entry.state),
                to: format!("{:?}", next),
            });
        }
        entry.state = next;
        Ok(entry.handle.clone())
    }

    /// Remove a transport, returning it if it was still present
    pub fn remove_transport(&mut self, transport_id: &TransportId) -> Option<TransportEntry> {
        self.transports.remove(transport_id).map(|mut entry| {
            entry.state = TransportState::Closed;
            entry
        })
    }

    /// Remove every transport
    pub fn take_transports(&mut self) -> Vec<Arc<dyn EngineTransport>> {
        self.transports.drain().map(|(_, e)| e.handle).collect()
    }

    /// Number of owned transports
    #[must_use]
    pub fn transport_count(&self) -> usize {
        self.transports.len()
    }

    /// Record a producer the engine has confirmed
    ///
    /// # Errors
    ///
    /// Returns `InvalidTransition` if the engine already closed the producer
    pub fn add_producer(
        &mut self,
        transport_id: TransportId,
        handle: Arc<dyn EngineProducer>,
    ) -> Result<ProducerInfo, SessionError> {
        let current = if handle.is_closed() {
            ProducerState::Closed
        } else {
            ProducerState::Created
        };
        if !current.can_transition_to(ProducerState::Active) {
            return Err(SessionError::InvalidTransition {
                resource: handle.id().to_string(),
                from: format!("{:?}", current),
                to: format!("{:?}", ProducerState::Active),
            });
        }
        let info = ProducerInfo {
            producer_id: handle.id().clone(),
            peer_id: self.peer_id,
            kind: handle.kind(),
        };
        let seq = self.next_seq;
        self.next_seq += 1;
        self.producers.insert(
            info.producer_id.clone(),
            ProducerEntry {
                handle,
                transport_id,
                state: ProducerState::Active,
                seq,
            },
        );
        Ok(info)
    }

    /// Producer owned by this session
    #[must_use]
    pub fn producer(&self, producer_id: &ProducerId) -> Option<&ProducerEntry> {
        self.producers.get(producer_id)
    }

    /// Remove a producer, returning it if it was still present
    pub fn remove_producer(&mut self, producer_id: &ProducerId) -> Option<ProducerEntry> {
        self.producers.remove(producer_id).map(|mut entry| {
            entry.state = ProducerState::Closed;
            entry
        })
    }

    /// Active producers in creation order
    #[must_use]
    pub fn producer_infos(&self) -> Vec<ProducerInfo> {
        let mut entries: Vec<_> = self.producers.values().collect();
        entries.sort_by_key(|e| e.seq);
        entries
            .into_iter()
            .map(|e| ProducerInfo {
                producer_id: e.handle.id().clone(),
                peer_id: self.peer_id,
                kind: e.handle.kind(),
            })
            .collect()
    }

    /// Active producers of one kind
    #[must_use]
    pub fn producers_of(&self, kind: MediaKind) -> Vec<ProducerId> {
        self.producer_infos()
            .into_iter()
            .filter(|p| p.kind == kind)
            .map(|p| p.producer_id)
            .collect()
    }

    /// Record a consumer the engine created paused
    pub fn add_consumer(&mut self, transport_id: TransportId, handle: Arc<dyn EngineConsumer>) {
        let state = if handle.is_paused() {
            ConsumerState::Paused
        } else {
            ConsumerState::Resumed
        };
        self.consumers.insert(
            handle.id().clone(),
            ConsumerEntry {
                handle,
                transport_id,
                state,
            },
        );
    }

    /// Consumer owned by this session
    #[must_use]
    pub fn consumer(&self, consumer_id: &ConsumerId) -> Option<&ConsumerEntry> {
        self.consumers.get(consumer_id)
    }

    /// Move a consumer to `next`
    ///
    /// # Errors
    ///
    /// Returns error if the consumer is not owned or the transition is illegal
    pub fn set_consumer_state(
        &mut self,
        consumer_id: &ConsumerId,
        next: ConsumerState,
    ) -> Result<(), SessionError> {
        let entry = self
            .consumers
            .get_mut(consumer_id)
            .ok_or_else(|| SessionError::NotOwned(consumer_id.to_string()))?;
        if !entry.state.can_transition_to(next) {
            return Err(SessionError::InvalidTransition {
                resource: consumer_id.to_string(),
                from: format!("{:?}", entry.state),
                to: format!("{:?}", next),
            });
        }
        entry.state = next;
        Ok(())
    }

    /// Remove a consumer, returning it if it was still present
    pub fn remove_consumer(&mut self, consumer_id: &ConsumerId) -> Option<ConsumerEntry> {
        self.consumers.remove(consumer_id).map(|mut entry| {
            entry.state = ConsumerState::Closed;
            entry
        })
    }

    /// Ids of the consumers bound to `producer_id`
    #[must_use]
    pub fn consumers_of(&self, producer_id: &ProducerId) -> Vec<ConsumerId> {
        self.consumers
            .iter()
            .filter(|(_, e)| e.handle.producer_id() == producer_id)
            .map(|(id, _)| id.clone())
            .collect()
    }

    /// Ids of every owned consumer
    #[must_use]
    pub fn consumer_ids(&self) -> Vec<ConsumerId> {
        self.consumers.keys().cloned().collect()
    }

    /// Number of owned producers
    #[must_use]
    pub fn producer_count(&self) -> usize {
        self.producers.len()
    }

    /// Number of owned consumers
    #[must_use]
    pub fn consumer_count(&self) -> usize {
        self.consumers.len()
    }
}

impl fmt::Debug for PeerSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PeerSession")
            .field("peer_id", &self.peer_id)
            .field("connected_at", &self.connected_at)
            .field("transports", &self.transports.keys().collect::<Vec<_>>())
            .field("producers", &self.producers.keys().collect::<Vec<_>>())
            .field("consumers", &self.consumers.keys().collect::<Vec<_>>())
            .finish()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::engine::{EngineRouter, MediaEngine, WebRtcTransportOptions};
    use crate::loopback_engine::LoopbackEngine;
    use crate::types::{default_media_codecs, RtpCodecParameters, RtpParameters};

    async fn fixture() -> (Arc<dyn EngineRouter>, PeerSession) {
        let router = LoopbackEngine::new()
            .create_router(default_media_codecs())
            .await
            .unwrap();
        let (tx, _rx) = mpsc::unbounded_channel();
        (router, PeerSession::new(PeerId::new(), tx))
    }

    fn audio_parameters(router: &dyn EngineRouter) -> RtpParameters {
        let caps = router.rtp_capabilities();
        let opus = caps.codecs_of(MediaKind::Audio).next().unwrap();
        RtpParameters {
            codecs: vec![RtpCodecParameters::from_capability(opus, 96)],
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_transport_lifecycle() {
        let (router, mut session) = fixture().await;
        let transport = router
            .create_webrtc_transport(&WebRtcTransportOptions::default())
            .await
            .unwrap();
        let id = transport.id().clone();
        session.add_transport(transport);

        session
            .set_transport_state(&id, TransportState::Connecting)
            .unwrap();
        assert!(matches!(
            session.set_transport_state(&id, TransportState::Connecting),
            Err(SessionError::InvalidTransition { .. })
        ));
        session
            .set_transport_state(&id, TransportState::Connected)
            .unwrap();

        let removed = session.remove_transport(&id).unwrap();
        assert_eq!(removed.state, TransportState::Closed);
        assert!(session.remove_transport(&id).is_none());
        assert!(matches!(
            session.set_transport_state(&id, TransportState::Closed),
            Err(SessionError::NotOwned(_))
        ));
    }

    #[tokio::test]
    async fn test_producer_infos_keep_creation_order() {
        let (router, mut session) = fixture().await;
        let transport = router
            .create_webrtc_transport(&WebRtcTransportOptions::default())
            .await
            .unwrap();
        let mut ids = Vec::new();
        for _ in 0..5 {
            let producer = transport
                .produce(MediaKind::Audio, audio_parameters(router.as_ref()))
                .await
                .unwrap();
            ids.push(
                session
                    .add_producer(transport.id().clone(), producer)
                    .unwrap()
                    .producer_id,
            );
        }
        let listed: Vec<_> = session
            .producer_infos()
            .into_iter()
            .map(|p| p.producer_id)
            .collect();
        assert_eq!(listed, ids);
        assert_eq!(session.producers_of(MediaKind::Video), Vec::<ProducerId>::new());

        assert!(session.remove_producer(&ids[2]).is_some());
        assert!(session.remove_producer(&ids[2]).is_none());
        assert_eq!(session.producer_count(), 4);
    }

    #[tokio::test]
    async fn test_closed_producer_is_not_recorded() {
        let (router, mut session) = fixture().await;
        let transport = router
            .create_webrtc_transport(&WebRtcTransportOptions::default())
            .await
            .unwrap();
        let producer = transport
            .produce(MediaKind::Audio, audio_parameters(router.as_ref()))
            .await
            .unwrap();
        producer.close();

        let result = session.add_producer(transport.id().clone(), producer);
        assert!(matches!(result, Err(SessionError::InvalidTransition { .. })));
        assert_eq!(session.producer_count(), 0);
    }

    #[tokio::test]
    async fn test_consumer_resume_transition() {
        let (router, mut session) = fixture().await;
        let options = WebRtcTransportOptions::default();
        let send = router.create_webrtc_transport(&options).await.unwrap();
        let recv = router.create_webrtc_transport(&options).await.unwrap();
        let producer = send
            .produce(MediaKind::Audio, audio_parameters(router.as_ref()))
            .await
            .unwrap();
        let consumer = recv
            .consume(producer.id(), &router.rtp_capabilities(), true)
            .await
            .unwrap();
        let consumer_id = consumer.id().clone();
        session.add_consumer(recv.id().clone(), consumer);

        assert_eq!(
            session.consumer(&consumer_id).unwrap().state,
            ConsumerState::Paused
        );
        assert_eq!(session.consumers_of(producer.id()), vec![consumer_id.clone()]);
        session
            .set_consumer_state(&consumer_id, ConsumerState::Resumed)
            .unwrap();
        assert!(session
            .set_consumer_state(&consumer_id, ConsumerState::Paused)
            .is_err());
        assert!(session.remove_consumer(&consumer_id).is_some());
        assert_eq!(session.consumer_count(), 0);
    }

    #[test]
    fn test_notify_reports_dead_connection() {
        let (tx, rx) = mpsc::unbounded_channel();
        let session = PeerSession::new(PeerId::new(), tx);
        assert!(session.notify(Notification::PeerLeft {
            peer_id: PeerId::new()
        }));
        drop(rx);
        assert!(!session.notify(Notification::PeerLeft {
            peer_id: PeerId::new()
        }));
    }
}
