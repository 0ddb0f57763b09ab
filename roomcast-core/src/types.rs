//! Media routing types and data structures
//!
//! The negotiation blobs (`RtpParameters`, `IceParameters`, `DtlsParameters`,
//! ...) follow the mediasoup JSON shape so browsers running a stock
//! mediasoup-client device can talk to the relay unmodified. The relay passes
//! them through to the engine; it only inspects codec entries for the
//! capability check.

use crate::identity::PeerId;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use uuid::Uuid;

macro_rules! opaque_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub String);

        impl $name {
            /// Create a new random id
            #[must_use]
            pub fn new() -> Self {
                Self(Uuid::new_v4().to_string())
            }

            /// Borrow the id as a string slice
            #[must_use]
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_string())
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }
    };
}

opaque_id!(
    /// Engine-assigned transport identifier
    TransportId
);
opaque_id!(
    /// Engine-assigned producer identifier
    ProducerId
);
opaque_id!(
    /// Engine-assigned consumer identifier
    ConsumerId
);

/// Kind of a single media track
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    /// Audio track
    Audio,
    /// Video track
    Video,
}

impl MediaKind {
    /// Lowercase wire name
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Audio => "audio",
            Self::Video => "video",
        }
    }
}

impl fmt::Display for MediaKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// RTCP feedback mechanism supported by a codec
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RtcpFeedback {
    /// Feedback type (`nack`, `ccm`, `goog-remb`, ...)
    #[serde(rename = "type")]
    pub kind: String,
    /// Optional feedback parameter (`pli`, `fir`, ...)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parameter: Option<String>,
}

impl RtcpFeedback {
    /// Feedback entry without a parameter
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            parameter: None,
        }
    }

    /// Feedback entry with a parameter
    pub fn with_parameter(kind: impl Into<String>, parameter: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            parameter: Some(parameter.into()),
        }
    }
}

/// One codec the router (or a device) can handle
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RtpCodecCapability {
    /// Media kind this codec carries
    pub kind: MediaKind,
    /// MIME type, e.g. `audio/opus`
    pub mime_type: String,
    /// RTP clock rate
    pub clock_rate: u32,
    /// Audio channel count
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channels: Option<u8>,
    /// Codec-specific parameters
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub parameters: BTreeMap<String, Value>,
    /// Preferred RTP payload type
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preferred_payload_type: Option<u8>,
    /// Supported RTCP feedback
    #[serde(default)]
    pub rtcp_feedback: Vec<RtcpFeedback>,
}

impl RtpCodecCapability {
    /// Whether this capability describes the same codec as `codec`
    ///
    /// MIME comparison is case-insensitive (`video/VP8` == `video/vp8`).
    #[must_use]
    pub fn matches(&self, codec: &RtpCodecParameters) -> bool {
        self.mime_type.eq_ignore_ascii_case(&codec.mime_type)
            && self.clock_rate == codec.clock_rate
            && (self.kind == MediaKind::Video || self.channels == codec.channels)
    }
}

/// Full capability set of a router or a device
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RtpCapabilities {
    /// Supported codecs
    #[serde(default)]
    pub codecs: Vec<RtpCodecCapability>,
    /// Supported RTP header extensions, passed through untouched
    #[serde(default)]
    pub header_extensions: Vec<Value>,
}

impl RtpCapabilities {
    /// Codecs of one media kind
    pub fn codecs_of(&self, kind: MediaKind) -> impl Iterator<Item = &RtpCodecCapability> {
        self.codecs.iter().filter(move |c| c.kind == kind)
    }

    /// Whether any codec of this set can decode `codec`
    #[must_use]
    pub fn supports(&self, codec: &RtpCodecParameters) -> bool {
        self.codecs.iter().any(|c| c.matches(codec))
    }

    /// Whether this set can carry the given kind at all
    #[must_use]
    pub fn has_kind(&self, kind: MediaKind) -> bool {
        self.codecs_of(kind).next().is_some()
    }
}

/// Concrete codec selected for one RTP stream
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RtpCodecParameters {
    /// MIME type
    pub mime_type: String,
    /// Negotiated payload type
    pub payload_type: u8,
    /// RTP clock rate
    pub clock_rate: u32,
    /// Audio channel count
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channels: Option<u8>,
    /// Codec-specific parameters
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub parameters: BTreeMap<String, Value>,
    /// RTCP feedback in use
    #[serde(default)]
    pub rtcp_feedback: Vec<RtcpFeedback>,
}

impl RtpCodecParameters {
    /// Derive stream parameters from a capability entry
    #[must_use]
    pub fn from_capability(capability: &RtpCodecCapability, payload_type: u8) -> Self {
        Self {
            mime_type: capability.mime_type.clone(),
            payload_type,
            clock_rate: capability.clock_rate,
            channels: capability.channels,
            parameters: capability.parameters.clone(),
            rtcp_feedback: capability.rtcp_feedback.clone(),
        }
    }
}

/// One encoding (simulcast layer) of an RTP stream
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RtpEncodingParameters {
    /// SSRC of this encoding
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ssrc: Option<u32>,
    /// RID of this encoding
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rid: Option<String>,
    /// Upper bitrate bound in bits per second
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_bitrate: Option<u32>,
    /// Scalability mode (`L1T3`, ...)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scalability_mode: Option<String>,
}

/// Send or receive parameters of one RTP stream
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RtpParameters {
    /// Media section id
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mid: Option<String>,
    /// Codecs, first entry is the active one
    #[serde(default)]
    pub codecs: Vec<RtpCodecParameters>,
    /// Header extensions, passed through untouched
    #[serde(default)]
    pub header_extensions: Vec<Value>,
    /// Encodings
    #[serde(default)]
    pub encodings: Vec<RtpEncodingParameters>,
    /// RTCP parameters, passed through untouched
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rtcp: Option<Value>,
}

impl RtpParameters {
    /// Active codec of the stream
    #[must_use]
    pub fn primary_codec(&self) -> Option<&RtpCodecParameters> {
        self.codecs.first()
    }
}

/// ICE credentials of a transport
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceParameters {
    /// ICE username fragment
    pub username_fragment: String,
    /// ICE password
    pub password: String,
    /// Whether the relay runs ICE-lite
    #[serde(default)]
    pub ice_lite: bool,
}

/// Transport protocol of an ICE candidate
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    /// UDP
    Udp,
    /// TCP
    Tcp,
}

/// ICE candidate advertised by the relay
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidate {
    /// Candidate foundation
    pub foundation: String,
    /// Candidate priority
    pub priority: u32,
    /// Listening IP
    pub ip: String,
    /// Protocol
    pub protocol: Protocol,
    /// Listening port
    pub port: u16,
    /// Candidate type, always `host` for a relay
    #[serde(rename = "type")]
    pub candidate_type: String,
    /// TCP candidate type
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tcp_type: Option<String>,
}

/// DTLS role of an endpoint
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DtlsRole {
    /// Decided by the handshake
    #[default]
    Auto,
    /// DTLS client
    Client,
    /// DTLS server
    Server,
}

/// Certificate fingerprint
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DtlsFingerprint {
    /// Hash algorithm, e.g. `sha-256`
    pub algorithm: String,
    /// Colon-separated hex digest
    pub value: String,
}

/// DTLS parameters exchanged in the connect handshake
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DtlsParameters {
    /// Role
    #[serde(default)]
    pub role: DtlsRole,
    /// Certificate fingerprints
    pub fingerprints: Vec<DtlsFingerprint>,
}

/// DTLS handshake state reported by the engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DtlsState {
    /// Not started
    New,
    /// Handshake in progress
    Connecting,
    /// Handshake complete
    Connected,
    /// Handshake failed
    Failed,
    /// Closed by either side
    Closed,
}

/// Parameters a client needs to build its side of a transport
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransportParams {
    /// Transport id
    pub id: TransportId,
    /// ICE credentials
    pub ice_parameters: IceParameters,
    /// Relay candidates
    pub ice_candidates: Vec<IceCandidate>,
    /// Relay DTLS parameters
    pub dtls_parameters: DtlsParameters,
}

/// Direction of a client-side transport
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportDirection {
    /// Carries this peer's outbound media
    Send,
    /// Carries this peer's inbound media
    Recv,
}

/// Discovery entry describing one published producer
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProducerInfo {
    /// Producer id
    pub producer_id: ProducerId,
    /// Owning peer
    pub peer_id: PeerId,
    /// Media kind
    pub kind: MediaKind,
}

/// Parameters returned for a freshly created consumer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsumerParams {
    /// Consumer id
    pub id: ConsumerId,
    /// Producer this consumer is bound to
    pub producer_id: ProducerId,
    /// Media kind
    pub kind: MediaKind,
    /// Receive parameters
    pub rtp_parameters: RtpParameters,
}

/// Transport lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransportState {
    /// Allocated, handshake not started
    Created,
    /// Connect request received
    Connecting,
    /// Handshake acknowledged
    Connected,
    /// Closed
    Closed,
}

impl TransportState {
    /// Whether moving from `self` to `next` is legal
    #[must_use]
    pub fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Created, Self::Connecting)
                | (Self::Connecting, Self::Connected)
                | (Self::Created | Self::Connecting | Self::Connected, Self::Closed)
        )
    }
}

/// Producer lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProducerState {
    /// Requested
    Created,
    /// Confirmed by the engine
    Active,
    /// Closed
    Closed,
}

impl ProducerState {
    /// Whether moving from `self` to `next` is legal
    #[must_use]
    pub fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Created, Self::Active) | (Self::Created | Self::Active, Self::Closed)
        )
    }
}

/// Consumer lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConsumerState {
    /// Requested
    Created,
    /// Created by the engine, no media flowing yet
    Paused,
    /// Resume acknowledged
    Resumed,
    /// Closed
    Closed,
}

impl ConsumerState {
    /// Whether moving from `self` to `next` is legal
    #[must_use]
    pub fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Created, Self::Paused)
                | (Self::Paused, Self::Resumed)
                | (Self::Created | Self::Paused | Self::Resumed, Self::Closed)
        )
    }
}

/// `videoGoogleStartBitrate` codec option used for every video producer
pub const VIDEO_GOOGLE_START_BITRATE: u32 = 1000;

/// Codec set the router is created with
#[must_use]
pub fn default_media_codecs() -> Vec<RtpCodecCapability> {
    let mut vp8_parameters = BTreeMap::new();
    vp8_parameters.insert(
        "x-google-start-bitrate".to_string(),
        Value::from(VIDEO_GOOGLE_START_BITRATE),
    );

    vec![
        RtpCodecCapability {
            kind: MediaKind::Audio,
            mime_type: "audio/opus".to_string(),
            clock_rate: 48000,
            channels: Some(2),
            parameters: BTreeMap::new(),
            preferred_payload_type: Some(96),
            rtcp_feedback: vec![
                RtcpFeedback::new("nack"),
                RtcpFeedback::with_parameter("nack", "pli"),
            ],
        },
        RtpCodecCapability {
            kind: MediaKind::Video,
            mime_type: "video/VP8".to_string(),
            clock_rate: 90000,
            channels: None,
            parameters: vp8_parameters,
            preferred_payload_type: Some(97),
            rtcp_feedback: vec![
                RtcpFeedback::new("nack"),
                RtcpFeedback::with_parameter("ccm", "fir"),
                RtcpFeedback::new("goog-remb"),
            ],
        },
    ]
}

/// Fixed three-layer simulcast set used for video producers
#[must_use]
pub fn default_video_encodings() -> Vec<RtpEncodingParameters> {
    [100_000, 300_000, 900_000]
        .into_iter()
        .map(|bitrate| RtpEncodingParameters {
            max_bitrate: Some(bitrate),
            ..Default::default()
        })
        .collect()
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_opaque_ids_are_unique() {
        assert_ne!(TransportId::new(), TransportId::new());
        assert_ne!(ProducerId::new(), ProducerId::new());
        assert_eq!(ConsumerId::from("c-1").as_str(), "c-1");
    }

    #[test]
    fn test_default_codecs_shape() {
        let codecs = default_media_codecs();
        assert_eq!(codecs.len(), 2);

        let json = serde_json::to_value(&codecs[1]).unwrap();
        assert_eq!(json["mimeType"], "video/VP8");
        assert_eq!(json["clockRate"], 90000);
        assert_eq!(json["preferredPayloadType"], 97);
        assert_eq!(json["parameters"]["x-google-start-bitrate"], 1000);
        assert_eq!(json["rtcpFeedback"][1]["type"], "ccm");
        assert_eq!(json["rtcpFeedback"][1]["parameter"], "fir");
        assert!(json.get("channels").is_none());
    }

    #[test]
    fn test_capability_matching_is_case_insensitive() {
        let caps = RtpCapabilities {
            codecs: default_media_codecs(),
            header_extensions: Vec::new(),
        };
        let vp8 = RtpCodecParameters {
            mime_type: "video/vp8".to_string(),
            payload_type: 101,
            clock_rate: 90000,
            channels: None,
            parameters: BTreeMap::new(),
            rtcp_feedback: Vec::new(),
        };
        assert!(caps.supports(&vp8));

        let h264 = RtpCodecParameters {
            mime_type: "video/H264".to_string(),
            ..vp8.clone()
        };
        assert!(!caps.supports(&h264));

        let mono_opus = RtpCodecParameters {
            mime_type: "audio/opus".to_string(),
            clock_rate: 48000,
            channels: Some(1),
            ..vp8
        };
        assert!(!caps.supports(&mono_opus));
    }

    #[test]
    fn test_transport_state_transitions() {
        use TransportState::*;
        assert!(Created.can_transition_to(Connecting));
        assert!(Connecting.can_transition_to(Connected));
        assert!(Connected.can_transition_to(Closed));
        assert!(Created.can_transition_to(Closed));
        assert!(!Created.can_transition_to(Connected));
        assert!(!Connected.can_transition_to(Connecting));
        assert!(!Closed.can_transition_to(Closed));
    }

    #[test]
    fn test_consumer_state_transitions() {
        use ConsumerState::*;
        assert!(Created.can_transition_to(Paused));
        assert!(Paused.can_transition_to(Resumed));
        assert!(Resumed.can_transition_to(Closed));
        assert!(!Created.can_transition_to(Resumed));
        assert!(!Resumed.can_transition_to(Paused));
    }

    #[test]
    fn test_producer_state_transitions() {
        use ProducerState::*;
        assert!(Created.can_transition_to(Active));
        assert!(Active.can_transition_to(Closed));
        assert!(!Closed.can_transition_to(Active));
    }

    #[test]
    fn test_video_encodings() {
        let encodings = default_video_encodings();
        let bitrates: Vec<_> = encodings.iter().filter_map(|e| e.max_bitrate).collect();
        assert_eq!(bitrates, vec![100_000, 300_000, 900_000]);
    }

    #[test]
    fn test_producer_info_wire_shape() {
        let info = ProducerInfo {
            producer_id: ProducerId::from("p-1"),
            peer_id: PeerId::new(),
            kind: MediaKind::Audio,
        };
        let json = serde_json::to_value(&info).unwrap();
        assert_eq!(json["producerId"], "p-1");
        assert_eq!(json["kind"], "audio");
        assert!(json["peerId"].is_string());
    }
}
