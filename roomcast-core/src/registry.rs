//! Peer registry
//!
//! The registry is the only state shared between connections. Every mutation
//! of a [`PeerSession`] goes through it, and every notification that must be
//! ordered relative to a mutation is queued while the write lock is held.
//! That single choke point gives two guarantees:
//!
//! - a joining peer's first notification is `existing-producers`, and no
//!   producer in that snapshot is announced to it again via `new-producer`;
//! - a producer is visible to [`PeerRegistry::list_other_producers`] before
//!   any peer hears about it.

use crate::engine::{EngineConsumer, EngineProducer, EngineTransport};
use crate::identity::PeerId;
use crate::session::{ConsumerEntry, PeerSession, ProducerEntry, SessionError, TransportEntry};
use crate::signaling::Notification;
use crate::types::{ConsumerId, ProducerId, ProducerInfo, TransportId};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;

/// Registry errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    /// Connection id already registered
    #[error("Duplicate connection: {0}")]
    DuplicateConnection(PeerId),

    /// Connection id not registered
    #[error("Peer not found: {0}")]
    NotFound(PeerId),

    /// The session refused the change
    #[error("Session error: {0}")]
    Session(#[from] SessionError),
}

#[derive(Default)]
struct Inner {
    peers: HashMap<PeerId, PeerSession>,
    next_join_seq: u64,
}

impl Inner {
    fn session(&self, peer_id: &PeerId) -> Result<&PeerSession, RegistryError> {
        self.peers
            .get(peer_id)
            .ok_or(RegistryError::NotFound(*peer_id))
    }

    fn session_mut(&mut self, peer_id: &PeerId) -> Result<&mut PeerSession, RegistryError> {
        self.peers
            .get_mut(peer_id)
            .ok_or(RegistryError::NotFound(*peer_id))
    }

    fn others_in_join_order(&self, excluding: &PeerId) -> Vec<&PeerSession> {
        let mut others: Vec<_> = self
            .peers
            .values()
            .filter(|s| s.peer_id() != *excluding)
            .collect();
        others.sort_by_key(|s| s.join_seq);
        others
    }

    fn producers_excluding(&self, excluding: &PeerId) -> Vec<ProducerInfo> {
        self.others_in_join_order(excluding)
            .into_iter()
            .flat_map(PeerSession::producer_infos)
            .collect()
    }

    fn broadcast(&self, from: &PeerId, notification: &Notification) -> usize {
        let mut delivered = 0;
        for session in self.others_in_join_order(from) {
            if session.notify(notification.clone()) {
                delivered += 1;
            }
        }
        delivered
    }
}

/// Process-wide map from connection id to [`PeerSession`]
#[derive(Default)]
pub struct PeerRegistry {
    inner: RwLock<Inner>,
}

impl PeerRegistry {
    /// Create an empty registry
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new connection
    ///
    /// Queues `existing-producers` on `outbound` as the connection's first
    /// notification, under the same lock that inserts the session.
    ///
    /// # Errors
    ///
    /// Returns `DuplicateConnection` if `peer_id` is already registered
    pub fn register(
        &self,
        peer_id: PeerId,
        outbound: mpsc::UnboundedSender<Notification>,
    ) -> Result<PeerSession, RegistryError> {
        let mut inner = self.inner.write();
        if inner.peers.contains_key(&peer_id) {
            return Err(RegistryError::DuplicateConnection(peer_id));
        }

        let mut session = PeerSession::new(peer_id, outbound);
        session.join_seq = inner.next_join_seq;
        inner.next_join_seq += 1;

        let existing = inner.producers_excluding(&peer_id);
        tracing::debug!(%peer_id, existing = existing.len(), "Registering peer");
        session.notify(Notification::ExistingProducers {
            producer_ids: existing,
        });

        inner.peers.insert(peer_id, session.clone());
        Ok(session)
    }

    /// Remove a connection and announce `peer-left` to everyone else
    ///
    /// Idempotent: returns `None` if the peer is not registered. The returned
    /// session still owns its engine handles; the caller closes them.
    pub fn unregister(&self, peer_id: &PeerId) -> Option<PeerSession> {
        let mut inner = self.inner.write();
        let session = inner.peers.remove(peer_id)?;
        let delivered = inner.broadcast(peer_id, &Notification::PeerLeft { peer_id: *peer_id });
        tracing::debug!(%peer_id, delivered, "Unregistered peer");
        Some(session)
    }

    /// Producers of every peer except `excluding`, in join then creation order
    #[must_use]
    pub fn list_other_producers(&self, excluding: &PeerId) -> Vec<ProducerInfo> {
        self.inner.read().producers_excluding(excluding)
    }

    /// Snapshot of one session
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if the peer is not registered
    pub fn get(&self, peer_id: &PeerId) -> Result<PeerSession, RegistryError> {
        self.inner.read().session(peer_id).cloned()
    }

    /// Whether `peer_id` is registered
    #[must_use]
    pub fn contains(&self, peer_id: &PeerId) -> bool {
        self.inner.read().peers.contains_key(peer_id)
    }

    /// Number of registered peers
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.read().peers.len()
    }

    /// Whether no peer is registered
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Registered peers in join order
    #[must_use]
    pub fn peer_ids(&self) -> Vec<PeerId> {
        let inner = self.inner.read();
        let mut sessions: Vec<_> = inner.peers.values().collect();
        sessions.sort_by_key(|s| s.join_seq);
        sessions.into_iter().map(PeerSession::peer_id).collect()
    }

    /// Read one session under the lock
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if the peer is not registered
    pub fn with_session<R>(
        &self,
        peer_id: &PeerId,
        f: impl FnOnce(&PeerSession) -> R,
    ) -> Result<R, RegistryError> {
        let inner = self.inner.read();
        inner.session(peer_id).map(f)
    }

    /// Mutate one session under the lock
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if the peer is not registered
    pub fn with_session_mut<R>(
        &self,
        peer_id: &PeerId,
        f: impl FnOnce(&mut PeerSession) -> R,
    ) -> Result<R, RegistryError> {
        let mut inner = self.inner.write();
        inner.session_mut(peer_id).map(f)
    }

    /// Record a transport for `peer_id`
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if the peer is not registered
    pub fn add_transport(
        &self,
        peer_id: &PeerId,
        transport: Arc<dyn EngineTransport>,
    ) -> Result<(), RegistryError> {
        self.with_session_mut(peer_id, |s| s.add_transport(transport))
    }

    /// Remove a transport; `None` if already gone
    pub fn remove_transport(
        &self,
        peer_id: &PeerId,
        transport_id: &TransportId,
    ) -> Option<TransportEntry> {
        self.with_session_mut(peer_id, |s| s.remove_transport(transport_id))
            .ok()
            .flatten()
    }

    /// Record a producer and announce `new-producer` to every other peer
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if the peer is not registered, or `Session` if the
    /// producer already closed
    pub fn add_producer(
        &self,
        peer_id: &PeerId,
        transport_id: TransportId,
        producer: Arc<dyn EngineProducer>,
    ) -> Result<ProducerInfo, RegistryError> {
        let mut inner = self.inner.write();
        let info = inner
            .session_mut(peer_id)?
            .add_producer(transport_id, producer)?;
        let delivered = inner.broadcast(peer_id, &Notification::NewProducer(info.clone()));
        tracing::debug!(%peer_id, producer_id = %info.producer_id, delivered, "Announced producer");
        Ok(info)
    }

    /// Remove a producer and announce `producer-closed` to every other peer
    ///
    /// The announcement is sent only by the call that actually removes the
    /// producer; later calls return `None` and send nothing.
    pub fn remove_producer(
        &self,
        peer_id: &PeerId,
        producer_id: &ProducerId,
    ) -> Option<ProducerEntry> {
        let mut inner = self.inner.write();
        let entry = inner.session_mut(peer_id).ok()?.remove_producer(producer_id)?;
        let delivered = inner.broadcast(
            peer_id,
            &Notification::ProducerClosed {
                producer_id: producer_id.clone(),
            },
        );
        tracing::debug!(%peer_id, %producer_id, delivered, "Announced producer close");
        Some(entry)
    }

    /// Record a consumer for `peer_id`
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if the peer is not registered
    pub fn add_consumer(
        &self,
        peer_id: &PeerId,
        transport_id: TransportId,
        consumer: Arc<dyn EngineConsumer>,
    ) -> Result<(), RegistryError> {
        self.with_session_mut(peer_id, |s| s.add_consumer(transport_id, consumer))
    }

    /// Remove a consumer and tell its owner with `consumer-closed`
    ///
    /// Nothing is sent to other peers.
    pub fn remove_consumer(
        &self,
        peer_id: &PeerId,
        consumer_id: &ConsumerId,
    ) -> Option<ConsumerEntry> {
        let mut inner = self.inner.write();
        let session = inner.session_mut(peer_id).ok()?;
        let entry = session.remove_consumer(consumer_id)?;
        session.notify(Notification::ConsumerClosed {
            consumer_id: consumer_id.clone(),
        });
        Some(entry)
    }

    /// Discovery entry of a producer owned by any peer
    #[must_use]
    pub fn find_producer(&self, producer_id: &ProducerId) -> Option<ProducerInfo> {
        let inner = self.inner.read();
        inner.peers.values().find_map(|s| {
            s.producer(producer_id).map(|e| ProducerInfo {
                producer_id: producer_id.clone(),
                peer_id: s.peer_id(),
                kind: e.handle.kind(),
            })
        })
    }
}

impl std::fmt::Debug for PeerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerRegistry")
            .field("peers", &self.len())
            .finish()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::engine::{EngineRouter, MediaEngine, WebRtcTransportOptions};
    use crate::loopback_engine::LoopbackEngine;
    use crate::types::{default_media_codecs, MediaKind, RtpCodecParameters, RtpParameters};
    use pretty_assertions::assert_eq;

    struct Peer {
        id: PeerId,
        rx: mpsc::UnboundedReceiver<Notification>,
    }

    impl Peer {
        fn join(registry: &PeerRegistry) -> Self {
            let (tx, rx) = mpsc::unbounded_channel();
            let id = PeerId::new();
            registry.register(id, tx).unwrap();
            Self { id, rx }
        }

        fn drain(&mut self) -> Vec<Notification> {
            let mut out = Vec::new();
            while let Ok(n) = self.rx.try_recv() {
                out.push(n);
            }
            out
        }
    }

    async fn router() -> Arc<dyn EngineRouter> {
        LoopbackEngine::new()
            .create_router(default_media_codecs())
            .await
            .unwrap()
    }

    async fn produce(
        registry: &PeerRegistry,
        router: &Arc<dyn EngineRouter>,
        peer: &PeerId,
        kind: MediaKind,
    ) -> ProducerInfo {
        let transport = router
            .create_webrtc_transport(&WebRtcTransportOptions::default())
            .await
            .unwrap();
        registry.add_transport(peer, transport.clone()).unwrap();
        let caps = router.rtp_capabilities();
        let codec = caps.codecs_of(kind).next().unwrap();
        let producer = transport
            .produce(
                kind,
                RtpParameters {
                    codecs: vec![RtpCodecParameters::from_capability(
                        codec,
                        codec.preferred_payload_type.unwrap(),
                    )],
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        registry
            .add_producer(peer, transport.id().clone(), producer)
            .unwrap()
    }

    #[test]
    fn test_duplicate_registration_is_rejected() {
        let registry = PeerRegistry::new();
        let (tx, _rx) = mpsc::unbounded_channel();
        let id = PeerId::new();
        registry.register(id, tx.clone()).unwrap();
        assert_eq!(
            registry.register(id, tx).unwrap_err(),
            RegistryError::DuplicateConnection(id)
        );
    }

    #[test]
    fn test_unregister_is_idempotent() {
        let registry = PeerRegistry::new();
        let peer = Peer::join(&registry);
        assert!(registry.unregister(&peer.id).is_some());
        assert!(registry.unregister(&peer.id).is_none());
        assert!(registry.is_empty());
        assert!(matches!(
            registry.get(&peer.id),
            Err(RegistryError::NotFound(_))
        ));
    }

    #[test]
    fn test_first_notification_is_existing_producers() {
        let registry = PeerRegistry::new();
        let mut peer = Peer::join(&registry);
        assert_eq!(
            peer.drain(),
            vec![Notification::ExistingProducers {
                producer_ids: Vec::new()
            }]
        );
    }

    #[tokio::test]
    async fn test_late_joiner_sees_snapshot_without_duplicates() {
        let registry = PeerRegistry::new();
        let router = router().await;
        let a = Peer::join(&registry);
        let b = Peer::join(&registry);
        let mut expected = Vec::new();
        for peer in [&a.id, &b.id] {
            expected.push(produce(&registry, &router, peer, MediaKind::Audio).await);
            expected.push(produce(&registry, &router, peer, MediaKind::Video).await);
        }

        let mut c = Peer::join(&registry);
        assert_eq!(
            c.drain(),
            vec![Notification::ExistingProducers {
                producer_ids: expected.clone()
            }]
        );
        assert_eq!(registry.list_other_producers(&c.id), expected);
        assert_eq!(registry.list_other_producers(&a.id).len(), 2);
    }

    #[tokio::test]
    async fn test_new_producer_reaches_others_only() {
        let registry = PeerRegistry::new();
        let router = router().await;
        let mut a = Peer::join(&registry);
        let mut b = Peer::join(&registry);
        a.drain();
        b.drain();

        let info = produce(&registry, &router, &a.id, MediaKind::Video).await;
        assert!(a.drain().is_empty());
        assert_eq!(b.drain(), vec![Notification::NewProducer(info.clone())]);
        assert_eq!(registry.find_producer(&info.producer_id), Some(info));
    }

    #[tokio::test]
    async fn test_closed_producer_is_never_announced() {
        let registry = PeerRegistry::new();
        let router = router().await;
        let a = Peer::join(&registry);
        let mut b = Peer::join(&registry);
        b.drain();
        let transport = router
            .create_webrtc_transport(&WebRtcTransportOptions::default())
            .await
            .unwrap();
        let caps = router.rtp_capabilities();
        let opus = caps.codecs_of(MediaKind::Audio).next().unwrap();
        let producer = transport
            .produce(
                MediaKind::Audio,
                RtpParameters {
                    codecs: vec![RtpCodecParameters::from_capability(opus, 96)],
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        producer.close();

        let result = registry.add_producer(&a.id, transport.id().clone(), producer.clone());
        assert!(matches!(
            result,
            Err(RegistryError::Session(SessionError::InvalidTransition { .. }))
        ));
        assert!(b.drain().is_empty());
        assert!(registry.find_producer(producer.id()).is_none());
    }

    #[tokio::test]
    async fn test_producer_closed_is_announced_once() {
        let registry = PeerRegistry::new();
        let router = router().await;
        let a = Peer::join(&registry);
        let mut b = Peer::join(&registry);
        let info = produce(&registry, &router, &a.id, MediaKind::Audio).await;
        b.drain();

        assert!(registry.remove_producer(&a.id, &info.producer_id).is_some());
        assert!(registry.remove_producer(&a.id, &info.producer_id).is_none());
        assert_eq!(
            b.drain(),
            vec![Notification::ProducerClosed {
                producer_id: info.producer_id
            }]
        );
    }

    #[test]
    fn test_peer_left_reaches_remaining_peers() {
        let registry = PeerRegistry::new();
        let a = Peer::join(&registry);
        let mut b = Peer::join(&registry);
        let mut c = Peer::join(&registry);
        b.drain();
        c.drain();

        registry.unregister(&a.id);
        registry.unregister(&a.id);
        for peer in [&mut b, &mut c] {
            assert_eq!(
                peer.drain(),
                vec![Notification::PeerLeft { peer_id: a.id }]
            );
        }
        assert_eq!(registry.peer_ids(), vec![b.id, c.id]);
    }

    #[tokio::test]
    async fn test_remove_transport_of_other_peer_is_noop() {
        let registry = PeerRegistry::new();
        let router = router().await;
        let a = Peer::join(&registry);
        let b = Peer::join(&registry);
        let transport = router
            .create_webrtc_transport(&WebRtcTransportOptions::default())
            .await
            .unwrap();
        let id = transport.id().clone();
        registry.add_transport(&a.id, transport).unwrap();

        assert!(registry.remove_transport(&b.id, &id).is_none());
        assert_eq!(
            registry.with_session(&a.id, PeerSession::transport_count).unwrap(),
            1
        );
    }
}
