//! Media tracks
//!
//! A [`MediaTrack`] is a handle to one audio or video source or sink. Clones
//! share state; stopping any clone ends the track for all of them. The
//! session controller only cares about a track's identity, kind and
//! live/ended state, so that is all this type models.

use crate::types::MediaKind;
use std::fmt;
use std::sync::Arc;
use tokio::sync::watch;
use uuid::Uuid;

/// Ready state of a track
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackState {
    /// Producing or delivering media
    Live,
    /// Terminated, never live again
    Ended,
}

struct TrackInner {
    id: String,
    kind: MediaKind,
    label: String,
    state: watch::Sender<TrackState>,
}

/// Shared handle to one media track
#[derive(Clone)]
pub struct MediaTrack {
    inner: Arc<TrackInner>,
}

impl MediaTrack {
    /// Create a live track with a random id
    pub fn new(kind: MediaKind, label: impl Into<String>) -> Self {
        Self::with_id(Uuid::new_v4().to_string(), kind, label)
    }

    /// Create a live track with a given id
    pub fn with_id(id: impl Into<String>, kind: MediaKind, label: impl Into<String>) -> Self {
        let (state, _) = watch::channel(TrackState::Live);
        Self {
            inner: Arc::new(TrackInner {
                id: id.into(),
                kind,
                label: label.into(),
                state,
            }),
        }
    }

    /// Track id
    #[must_use]
    pub fn id(&self) -> &str {
        &self.inner.id
    }

    /// Media kind
    #[must_use]
    pub fn kind(&self) -> MediaKind {
        self.inner.kind
    }

    /// Human readable label (device name, remote peer, ...)
    #[must_use]
    pub fn label(&self) -> &str {
        &self.inner.label
    }

    /// Current ready state
    #[must_use]
    pub fn state(&self) -> TrackState {
        *self.inner.state.borrow()
    }

    /// Whether the track is live
    #[must_use]
    pub fn is_live(&self) -> bool {
        self.state() == TrackState::Live
    }

    /// End the track
    ///
    /// Returns true if this call ended it, false if it was already ended.
    pub fn stop(&self) -> bool {
        self.inner.state.send_replace(TrackState::Ended) == TrackState::Live
    }

    /// Wait until the track ends
    pub async fn ended(&self) {
        let mut rx = self.inner.state.subscribe();
        let _ = rx.wait_for(|state| *state == TrackState::Ended).await;
    }
}

impl PartialEq for MediaTrack {
    fn eq(&self, other: &Self) -> bool {
        self.inner.id == other.inner.id
    }
}

impl Eq for MediaTrack {}

impl fmt::Debug for MediaTrack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MediaTrack")
            .field("id", &self.inner.id)
            .field("kind", &self.inner.kind)
            .field("label", &self.inner.label)
            .field("state", &self.state())
            .finish()
    }
}

/// Local capture: the tracks a participant publishes
#[derive(Debug, Clone, Default)]
pub struct LocalMedia {
    tracks: Vec<MediaTrack>,
}

impl LocalMedia {
    /// Empty capture
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// One live track per requested kind
    #[must_use]
    pub fn capture(audio: bool, video: bool) -> Self {
        let mut media = Self::new();
        if audio {
            media.add_track(MediaTrack::new(MediaKind::Audio, "microphone"));
        }
        if video {
            media.add_track(MediaTrack::new(MediaKind::Video, "camera"));
        }
        media
    }

    /// Add a track
    pub fn add_track(&mut self, track: MediaTrack) {
        self.tracks.push(track);
    }

    /// Add a track, builder style
    #[must_use]
    pub fn with_track(mut self, track: MediaTrack) -> Self {
        self.add_track(track);
        self
    }

    /// All tracks
    #[must_use]
    pub fn tracks(&self) -> &[MediaTrack] {
        &self.tracks
    }

    /// Audio tracks
    pub fn audio_tracks(&self) -> impl Iterator<Item = &MediaTrack> {
        self.tracks.iter().filter(|t| t.kind() == MediaKind::Audio)
    }

    /// Video tracks
    pub fn video_tracks(&self) -> impl Iterator<Item = &MediaTrack> {
        self.tracks.iter().filter(|t| t.kind() == MediaKind::Video)
    }

    /// Whether there is nothing to publish
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tracks.is_empty()
    }

    /// End every track
    pub fn stop_all(&self) {
        for track in &self.tracks {
            track.stop();
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_stop_is_shared_and_idempotent() {
        let track = MediaTrack::new(MediaKind::Video, "camera");
        let clone = track.clone();
        assert!(clone.is_live());
        assert!(track.stop());
        assert!(!track.stop());
        assert_eq!(clone.state(), TrackState::Ended);
    }

    #[tokio::test]
    async fn test_ended_resolves_after_stop() {
        let track = MediaTrack::new(MediaKind::Audio, "microphone");
        let waiter = {
            let track = track.clone();
            tokio::spawn(async move { track.ended().await })
        };
        track.stop();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();

        // Already ended: returns immediately.
        tokio::time::timeout(Duration::from_millis(100), track.ended())
            .await
            .unwrap();
    }

    #[test]
    fn test_local_media_filters_by_kind() {
        let media = LocalMedia::capture(true, false);
        assert_eq!(media.audio_tracks().count(), 1);
        assert_eq!(media.video_tracks().count(), 0);

        let media = media.with_track(MediaTrack::new(MediaKind::Video, "screen"));
        assert_eq!(media.tracks().len(), 2);
        media.stop_all();
        assert!(media.tracks().iter().all(|t| !t.is_live()));
        assert!(LocalMedia::new().is_empty());
    }
}
