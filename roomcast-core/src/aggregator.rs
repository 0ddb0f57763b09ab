//! Track aggregator
//!
//! Groups inbound tracks by the peer that published them so each remote peer
//! shows up as one playable unit holding at most one audio and one video
//! track. An aggregate exists exactly as long as it holds a track.

use crate::identity::PeerId;
use crate::media::MediaTrack;
use crate::types::MediaKind;
use parking_lot::Mutex;
use tokio::sync::broadcast;

const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Live tracks of one remote peer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemotePeerAggregate {
    /// Publishing peer
    pub peer_id: PeerId,
    /// Audio track, if any
    pub audio: Option<MediaTrack>,
    /// Video track, if any
    pub video: Option<MediaTrack>,
}

impl RemotePeerAggregate {
    fn new(peer_id: PeerId) -> Self {
        Self {
            peer_id,
            audio: None,
            video: None,
        }
    }

    fn slot(&mut self, kind: MediaKind) -> &mut Option<MediaTrack> {
        match kind {
            MediaKind::Audio => &mut self.audio,
            MediaKind::Video => &mut self.video,
        }
    }

    /// Track of one kind
    #[must_use]
    pub fn track(&self, kind: MediaKind) -> Option<&MediaTrack> {
        match kind {
            MediaKind::Audio => self.audio.as_ref(),
            MediaKind::Video => self.video.as_ref(),
        }
    }

    /// Held tracks, audio first
    #[must_use]
    pub fn tracks(&self) -> Vec<&MediaTrack> {
        self.audio.iter().chain(self.video.iter()).collect()
    }

    /// Number of held tracks
    #[must_use]
    pub fn track_count(&self) -> usize {
        usize::from(self.audio.is_some()) + usize::from(self.video.is_some())
    }

    /// Whether no track is held
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.track_count() == 0
    }
}

/// Change notifications for presentation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AggregateEvent {
    /// A peer's aggregate was created or changed
    Changed(RemotePeerAggregate),
    /// A peer's last track went away
    PeerRemoved {
        /// Removed peer
        peer_id: PeerId,
    },
}

/// Peer-keyed collection of inbound tracks
pub struct TrackAggregator {
    peers: Mutex<Vec<RemotePeerAggregate>>,
    events: broadcast::Sender<AggregateEvent>,
}

impl Default for TrackAggregator {
    fn default() -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            peers: Mutex::new(Vec::new()),
            events,
        }
    }
}

impl TrackAggregator {
    /// Create an empty aggregator
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe to aggregate changes
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<AggregateEvent> {
        self.events.subscribe()
    }

    /// Attribute `track` to `peer_id` as its `kind` track
    ///
    /// An ended track is discarded and false is returned. A live track
    /// replaces any previous track of the same kind.
    pub fn add_track(&self, peer_id: PeerId, kind: MediaKind, track: MediaTrack) -> bool {
        if !track.is_live() {
            tracing::debug!(%peer_id, %kind, track_id = track.id(), "Discarding ended track");
            return false;
        }
        let mut peers = self.peers.lock();
        let index = match peers.iter().position(|a| a.peer_id == peer_id) {
            Some(index) => index,
            None => {
                peers.push(RemotePeerAggregate::new(peer_id));
                peers.len() - 1
            }
        };
        let aggregate = &mut peers[index];
        *aggregate.slot(kind) = Some(track);
        let _ = self.events.send(AggregateEvent::Changed(aggregate.clone()));
        true
    }

    /// Drop the `kind` track of `peer_id`
    ///
    /// Returns false if there was nothing to remove.
    pub fn remove_track(&self, peer_id: &PeerId, kind: MediaKind) -> bool {
        self.remove_matching(peer_id, kind, |_| true)
    }

    /// Drop the `kind` track of `peer_id` only if it is `track_id`
    ///
    /// Keeps a replacement track from being removed by its predecessor's
    /// late end event.
    pub fn remove_track_if(&self, peer_id: &PeerId, kind: MediaKind, track_id: &str) -> bool {
        self.remove_matching(peer_id, kind, |t| t.id() == track_id)
    }

    fn remove_matching(
        &self,
        peer_id: &PeerId,
        kind: MediaKind,
        matches: impl FnOnce(&MediaTrack) -> bool,
    ) -> bool {
        let mut peers = self.peers.lock();
        let Some(index) = peers.iter().position(|a| a.peer_id == *peer_id) else {
            return false;
        };
        let slot = peers[index].slot(kind);
        if !slot.as_ref().is_some_and(matches) {
            return false;
        }
        *slot = None;

        if peers[index].is_empty() {
            peers.remove(index);
            let _ = self.events.send(AggregateEvent::PeerRemoved { peer_id: *peer_id });
        } else {
            let _ = self
                .events
                .send(AggregateEvent::Changed(peers[index].clone()));
        }
        true
    }

    /// Drop every track of `peer_id`
    ///
    /// Returns the removed aggregate, if any.
    pub fn remove_peer(&self, peer_id: &PeerId) -> Option<RemotePeerAggregate> {
        let mut peers = self.peers.lock();
        let index = peers.iter().position(|a| a.peer_id == *peer_id)?;
        let removed = peers.remove(index);
        let _ = self.events.send(AggregateEvent::PeerRemoved { peer_id: *peer_id });
        Some(removed)
    }

    /// Visible aggregates in arrival order
    #[must_use]
    pub fn aggregates(&self) -> Vec<RemotePeerAggregate> {
        self.peers.lock().clone()
    }

    /// Aggregate of one peer
    #[must_use]
    pub fn get(&self, peer_id: &PeerId) -> Option<RemotePeerAggregate> {
        self.peers
            .lock()
            .iter()
            .find(|a| a.peer_id == *peer_id)
            .cloned()
    }

    /// One track of one peer
    #[must_use]
    pub fn track(&self, peer_id: &PeerId, kind: MediaKind) -> Option<MediaTrack> {
        self.get(peer_id).and_then(|a| a.track(kind).cloned())
    }

    /// Number of visible aggregates
    #[must_use]
    pub fn len(&self) -> usize {
        self.peers.lock().len()
    }

    /// Whether no aggregate is visible
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl std::fmt::Debug for TrackAggregator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TrackAggregator")
            .field("peers", &*self.peers.lock())
            .finish()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn live(kind: MediaKind) -> MediaTrack {
        MediaTrack::new(kind, "remote")
    }

    #[test]
    fn test_ended_track_is_discarded() {
        let aggregator = TrackAggregator::new();
        let track = live(MediaKind::Video);
        track.stop();
        assert!(!aggregator.add_track(PeerId::new(), MediaKind::Video, track));
        assert!(aggregator.is_empty());
    }

    #[test]
    fn test_add_then_remove_leaves_no_entry() {
        let aggregator = TrackAggregator::new();
        let peer = PeerId::new();
        assert!(aggregator.add_track(peer, MediaKind::Video, live(MediaKind::Video)));
        assert!(aggregator.remove_track(&peer, MediaKind::Video));
        assert!(aggregator.get(&peer).is_none());
        assert!(!aggregator.remove_track(&peer, MediaKind::Video));
    }

    #[test]
    fn test_partial_removal_keeps_aggregate() {
        let aggregator = TrackAggregator::new();
        let peer = PeerId::new();
        aggregator.add_track(peer, MediaKind::Audio, live(MediaKind::Audio));
        aggregator.add_track(peer, MediaKind::Video, live(MediaKind::Video));
        assert_eq!(aggregator.len(), 1);
        assert_eq!(aggregator.get(&peer).unwrap().track_count(), 2);

        aggregator.remove_track(&peer, MediaKind::Video);
        let aggregate = aggregator.get(&peer).unwrap();
        assert!(aggregate.audio.is_some());
        assert!(aggregate.video.is_none());

        aggregator.remove_track(&peer, MediaKind::Audio);
        assert!(aggregator.is_empty());
    }

    #[test]
    fn test_events_follow_mutations() {
        let aggregator = TrackAggregator::new();
        let mut events = aggregator.subscribe();
        let peer = PeerId::new();
        aggregator.add_track(peer, MediaKind::Audio, live(MediaKind::Audio));
        aggregator.add_track(peer, MediaKind::Video, live(MediaKind::Video));
        aggregator.remove_track(&peer, MediaKind::Audio);
        aggregator.remove_track(&peer, MediaKind::Video);
        aggregator.remove_track(&peer, MediaKind::Video);

        let mut seen = Vec::new();
        while let Ok(event) = events.try_recv() {
            seen.push(match event {
                AggregateEvent::Changed(a) => format!("changed:{}", a.track_count()),
                AggregateEvent::PeerRemoved { .. } => "removed".to_string(),
            });
        }
        assert_eq!(seen, vec!["changed:1", "changed:2", "changed:1", "removed"]);
    }

    #[test]
    fn test_remove_track_if_ignores_stale_track() {
        let aggregator = TrackAggregator::new();
        let peer = PeerId::new();
        let old = live(MediaKind::Video);
        let new = live(MediaKind::Video);
        aggregator.add_track(peer, MediaKind::Video, old.clone());
        aggregator.add_track(peer, MediaKind::Video, new.clone());

        assert!(!aggregator.remove_track_if(&peer, MediaKind::Video, old.id()));
        assert_eq!(aggregator.track(&peer, MediaKind::Video), Some(new.clone()));
        assert!(aggregator.remove_track_if(&peer, MediaKind::Video, new.id()));
        assert!(aggregator.is_empty());
    }

    #[test]
    fn test_remove_peer_drops_both_kinds() {
        let aggregator = TrackAggregator::new();
        let a = PeerId::new();
        let b = PeerId::new();
        aggregator.add_track(a, MediaKind::Audio, live(MediaKind::Audio));
        aggregator.add_track(a, MediaKind::Video, live(MediaKind::Video));
        aggregator.add_track(b, MediaKind::Audio, live(MediaKind::Audio));

        assert_eq!(aggregator.remove_peer(&a).unwrap().track_count(), 2);
        assert!(aggregator.remove_peer(&a).is_none());
        let remaining: Vec<_> = aggregator.aggregates().iter().map(|x| x.peer_id).collect();
        assert_eq!(remaining, vec![b]);
    }
}
