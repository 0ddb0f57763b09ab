//! Aggregates exist exactly while they hold a track

#![allow(clippy::unwrap_used)]

use proptest::prelude::*;
use roomcast_core::{AggregateEvent, MediaKind, MediaTrack, PeerId, TrackAggregator};
use std::collections::{HashMap, HashSet};

#[derive(Debug, Clone)]
enum Op {
    Add { peer: usize, video: bool, live: bool },
    Remove { peer: usize, video: bool },
    RemoveStale { peer: usize, video: bool },
    Forget { peer: usize },
}

fn op() -> impl Strategy<Value = Op> {
    prop_oneof![
        4 => (0..4usize, any::<bool>(), prop::bool::weighted(0.8))
            .prop_map(|(peer, video, live)| Op::Add { peer, video, live }),
        2 => (0..4usize, any::<bool>()).prop_map(|(peer, video)| Op::Remove { peer, video }),
        1 => (0..4usize, any::<bool>()).prop_map(|(peer, video)| Op::RemoveStale { peer, video }),
        1 => (0..4usize).prop_map(|peer| Op::Forget { peer }),
    ]
}

fn kind(video: bool) -> MediaKind {
    if video {
        MediaKind::Video
    } else {
        MediaKind::Audio
    }
}

proptest! {
    #[test]
    fn prop_aggregate_exists_iff_it_holds_a_track(ops in prop::collection::vec(op(), 1..60)) {
        let peers: Vec<PeerId> = (0..4).map(|_| PeerId::new()).collect();
        let aggregator = TrackAggregator::new();
        let mut events = aggregator.subscribe();
        let mut model: HashMap<(usize, MediaKind), String> = HashMap::new();

        for op in ops {
            match op {
                Op::Add { peer, video, live } => {
                    let track = MediaTrack::new(kind(video), "remote");
                    if !live {
                        track.stop();
                    }
                    let id = track.id().to_string();
                    let added = aggregator.add_track(peers[peer], kind(video), track);
                    prop_assert_eq!(added, live);
                    if live {
                        model.insert((peer, kind(video)), id);
                    }
                }
                Op::Remove { peer, video } => {
                    let removed = aggregator.remove_track(&peers[peer], kind(video));
                    prop_assert_eq!(removed, model.remove(&(peer, kind(video))).is_some());
                }
                Op::RemoveStale { peer, video } => {
                    // A track id that was never attributed leaves the slot alone
                    let removed = aggregator.remove_track_if(&peers[peer], kind(video), "stale");
                    prop_assert!(!removed);
                }
                Op::Forget { peer } => {
                    let had = model.keys().any(|(p, _)| *p == peer);
                    prop_assert_eq!(aggregator.remove_peer(&peers[peer]).is_some(), had);
                    model.retain(|(p, _), _| *p != peer);
                }
            }

            let expected: HashSet<PeerId> = model.keys().map(|(p, _)| peers[*p]).collect();
            let actual: HashSet<PeerId> = aggregator.aggregates().iter().map(|a| a.peer_id).collect();
            prop_assert_eq!(&actual, &expected);
            for aggregate in aggregator.aggregates() {
                prop_assert!(!aggregate.is_empty());
            }
            for ((peer, kind), id) in &model {
                let track = aggregator.track(&peers[*peer], *kind).unwrap();
                prop_assert_eq!(track.id(), id.as_str());
            }
        }

        // The last event seen for each peer agrees with the final state
        let mut last: HashMap<PeerId, Option<usize>> = HashMap::new();
        while let Ok(event) = events.try_recv() {
            match event {
                AggregateEvent::Changed(aggregate) => {
                    prop_assert!(!aggregate.is_empty());
                    last.insert(aggregate.peer_id, Some(aggregate.track_count()));
                }
                AggregateEvent::PeerRemoved { peer_id } => {
                    last.insert(peer_id, None);
                }
            }
        }
        for (peer_id, count) in last {
            let current = aggregator.get(&peer_id).map(|a| a.track_count());
            prop_assert_eq!(count, current);
        }
    }
}
