//! Signaling protocol
//!
//! Request/response messages a participant exchanges with the relay, the
//! notifications the relay pushes, and the error taxonomy reported back to a
//! requester.
//!
//! # Wire format
//!
//! ```text
//! client → relay   {"id": 7, "method": "consume", "data": {...}}
//! relay → client   {"type": "response", "id": 7, "ok": {...}}
//!                  {"type": "response", "id": 7, "error": {"code": "...", "message": "..."}}
//!                  {"type": "notification", "event": "new-producer", "data": {...}}
//! ```

use crate::identity::PeerId;
use crate::types::{
    ConsumerId, ConsumerParams, DtlsParameters, MediaKind, ProducerId, ProducerInfo,
    RtpCapabilities, RtpParameters, TransportId, TransportParams,
};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::mpsc;

/// Signaling errors
///
/// Per-request failures travel back to the requester only; they are never
/// broadcast. Unknown-resource errors do not reveal whether the id exists
/// under another peer.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SignalingError {
    /// Transport not owned by the caller
    #[error("Unknown transport: {0}")]
    UnknownTransport(String),

    /// Producer not found
    #[error("Unknown producer: {0}")]
    UnknownProducer(String),

    /// Consumer not owned by the caller
    #[error("Unknown consumer: {0}")]
    UnknownConsumer(String),

    /// Receiver cannot decode the producer's encoding
    #[error("Incompatible capabilities: {0}")]
    IncompatibleCapabilities(String),

    /// Media engine allocation or negotiation failure
    #[error("Engine error: {0}")]
    Engine(String),

    /// No acknowledgement within the bound
    #[error("Timeout: {0}")]
    Timeout(String),

    /// Connection id registered twice
    #[error("Duplicate connection: {0}")]
    DuplicateConnection(String),

    /// Request for a connection that is already torn down
    #[error("Peer not found: {0}")]
    PeerNotFound(String),

    /// Malformed or out-of-order request
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Signaling channel is gone
    #[error("Channel closed: {0}")]
    ChannelClosed(String),
}

impl SignalingError {
    /// Wire code of this error
    #[must_use]
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::UnknownTransport(_) => ErrorCode::UnknownTransport,
            Self::UnknownProducer(_) => ErrorCode::UnknownProducer,
            Self::UnknownConsumer(_) => ErrorCode::UnknownConsumer,
            Self::IncompatibleCapabilities(_) => ErrorCode::IncompatibleCapabilities,
            Self::Engine(_) => ErrorCode::EngineError,
            Self::Timeout(_) => ErrorCode::Timeout,
            Self::DuplicateConnection(_) => ErrorCode::DuplicateConnection,
            Self::PeerNotFound(_) => ErrorCode::PeerNotFound,
            Self::InvalidRequest(_) => ErrorCode::InvalidRequest,
            Self::ChannelClosed(_) => ErrorCode::ChannelClosed,
        }
    }

    fn detail(&self) -> &str {
        match self {
            Self::UnknownTransport(s)
            | Self::UnknownProducer(s)
            | Self::UnknownConsumer(s)
            | Self::IncompatibleCapabilities(s)
            | Self::Engine(s)
            | Self::Timeout(s)
            | Self::DuplicateConnection(s)
            | Self::PeerNotFound(s)
            | Self::InvalidRequest(s)
            | Self::ChannelClosed(s) => s,
        }
    }

    /// Error body sent to the requester
    #[must_use]
    pub fn to_reply(&self) -> ErrorReply {
        ErrorReply {
            code: self.code(),
            message: self.detail().to_string(),
        }
    }
}

/// Wire error codes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorCode {
    /// See [`SignalingError::UnknownTransport`]
    UnknownTransport,
    /// See [`SignalingError::UnknownProducer`]
    UnknownProducer,
    /// See [`SignalingError::UnknownConsumer`]
    UnknownConsumer,
    /// See [`SignalingError::IncompatibleCapabilities`]
    IncompatibleCapabilities,
    /// See [`SignalingError::Engine`]
    EngineError,
    /// See [`SignalingError::Timeout`]
    Timeout,
    /// See [`SignalingError::DuplicateConnection`]
    DuplicateConnection,
    /// See [`SignalingError::PeerNotFound`]
    PeerNotFound,
    /// See [`SignalingError::InvalidRequest`]
    InvalidRequest,
    /// See [`SignalingError::ChannelClosed`]
    ChannelClosed,
}

/// Error body of a failed response
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorReply {
    /// Error code
    pub code: ErrorCode,
    /// Human readable detail
    pub message: String,
}

impl From<ErrorReply> for SignalingError {
    fn from(reply: ErrorReply) -> Self {
        let ErrorReply { code, message } = reply;
        match code {
            ErrorCode::UnknownTransport => Self::UnknownTransport(message),
            ErrorCode::UnknownProducer => Self::UnknownProducer(message),
            ErrorCode::UnknownConsumer => Self::UnknownConsumer(message),
            ErrorCode::IncompatibleCapabilities => Self::IncompatibleCapabilities(message),
            ErrorCode::EngineError => Self::Engine(message),
            ErrorCode::Timeout => Self::Timeout(message),
            ErrorCode::DuplicateConnection => Self::DuplicateConnection(message),
            ErrorCode::PeerNotFound => Self::PeerNotFound(message),
            ErrorCode::InvalidRequest => Self::InvalidRequest(message),
            ErrorCode::ChannelClosed => Self::ChannelClosed(message),
        }
    }
}

/// `connect-transport` payload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectTransportRequest {
    /// Transport to connect
    pub transport_id: TransportId,
    /// Client DTLS parameters
    pub dtls_parameters: DtlsParameters,
}

/// `produce` payload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProduceRequest {
    /// Send transport
    pub transport_id: TransportId,
    /// Media kind
    pub kind: MediaKind,
    /// Send parameters
    pub rtp_parameters: RtpParameters,
}

/// `consume` payload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsumeRequest {
    /// Receive transport
    pub transport_id: TransportId,
    /// Producer to receive
    pub producer_id: ProducerId,
    /// Receiver decode capabilities
    pub rtp_capabilities: RtpCapabilities,
}

/// `resume-consumer` payload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResumeConsumerRequest {
    /// Consumer to resume
    pub consumer_id: ConsumerId,
}

/// `close-producer` payload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CloseProducerRequest {
    /// Producer to close
    pub producer_id: ProducerId,
}

/// Requests a participant sends to the relay
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "method", content = "data", rename_all = "kebab-case")]
pub enum Request {
    /// Router codec capability set
    #[serde(alias = "get-router-rtp-capabilites")]
    GetRouterRtpCapabilities,
    /// Allocate a transport
    CreateTransport,
    /// Complete a transport's DTLS handshake
    ConnectTransport(ConnectTransportRequest),
    /// Publish a track
    Produce(ProduceRequest),
    /// Receive a remote producer
    Consume(ConsumeRequest),
    /// Start media on a paused consumer
    ResumeConsumer(ResumeConsumerRequest),
    /// Stop publishing one producer
    CloseProducer(CloseProducerRequest),
}

impl Request {
    /// Wire method name
    #[must_use]
    pub fn method(&self) -> &'static str {
        match self {
            Self::GetRouterRtpCapabilities => "get-router-rtp-capabilities",
            Self::CreateTransport => "create-transport",
            Self::ConnectTransport(_) => "connect-transport",
            Self::Produce(_) => "produce",
            Self::Consume(_) => "consume",
            Self::ResumeConsumer(_) => "resume-consumer",
            Self::CloseProducer(_) => "close-producer",
        }
    }

    /// Decode the `ok` body of a response to this request
    ///
    /// # Errors
    ///
    /// Returns `InvalidRequest` if the body does not have the expected shape
    pub fn decode_response(&self, body: Value) -> Result<Response, SignalingError> {
        let decoded = match self {
            Self::GetRouterRtpCapabilities => {
                serde_json::from_value(body).map(Response::RtpCapabilities)
            }
            Self::CreateTransport => serde_json::from_value(body).map(Response::TransportCreated),
            Self::ConnectTransport(_) => serde_json::from_value::<ConnectedBody>(body)
                .map(|b| Response::TransportConnected { connected: b.connected }),
            Self::Produce(_) => {
                serde_json::from_value::<ProducedBody>(body).map(|b| Response::Produced { id: b.id })
            }
            Self::Consume(_) => serde_json::from_value(body).map(Response::Consumed),
            Self::ResumeConsumer(_) => serde_json::from_value::<ResumedBody>(body)
                .map(|b| Response::ConsumerResumed { resumed: b.resumed }),
            Self::CloseProducer(_) => serde_json::from_value::<ClosedBody>(body)
                .map(|b| Response::ProducerClosed { closed: b.closed }),
        };
        decoded.map_err(|e| {
            SignalingError::InvalidRequest(format!("malformed {} response: {}", self.method(), e))
        })
    }
}

#[derive(Deserialize)]
struct ConnectedBody {
    connected: bool,
}

#[derive(Deserialize)]
struct ProducedBody {
    id: ProducerId,
}

#[derive(Deserialize)]
struct ResumedBody {
    resumed: bool,
}

#[derive(Deserialize)]
struct ClosedBody {
    closed: bool,
}

/// Successful responses
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Response {
    /// Router codec capability set
    RtpCapabilities(RtpCapabilities),
    /// Parameters of a new transport
    TransportCreated(TransportParams),
    /// Handshake acknowledged
    TransportConnected {
        /// Always true
        connected: bool,
    },
    /// Producer created
    Produced {
        /// Producer id
        id: ProducerId,
    },
    /// Consumer created (paused)
    Consumed(ConsumerParams),
    /// Consumer resumed
    ConsumerResumed {
        /// Always true
        resumed: bool,
    },
    /// Producer closed
    ProducerClosed {
        /// Always true
        closed: bool,
    },
}

impl Response {
    fn unexpected(&self, wanted: &str) -> SignalingError {
        SignalingError::InvalidRequest(format!("expected {} response, got {:?}", wanted, self))
    }

    /// Extract the capability set
    ///
    /// # Errors
    ///
    /// Returns `InvalidRequest` for any other response
    pub fn into_rtp_capabilities(self) -> Result<RtpCapabilities, SignalingError> {
        match self {
            Self::RtpCapabilities(caps) => Ok(caps),
            other => Err(other.unexpected("capabilities")),
        }
    }

    /// Extract transport parameters
    ///
    /// # Errors
    ///
    /// Returns `InvalidRequest` for any other response
    pub fn into_transport_params(self) -> Result<TransportParams, SignalingError> {
        match self {
            Self::TransportCreated(params) => Ok(params),
            other => Err(other.unexpected("create-transport")),
        }
    }

    /// Extract the producer id
    ///
    /// # Errors
    ///
    /// Returns `InvalidRequest` for any other response
    pub fn into_producer_id(self) -> Result<ProducerId, SignalingError> {
        match self {
            Self::Produced { id } => Ok(id),
            other => Err(other.unexpected("produce")),
        }
    }

    /// Extract consumer parameters
    ///
    /// # Errors
    ///
    /// Returns `InvalidRequest` for any other response
    pub fn into_consumer_params(self) -> Result<ConsumerParams, SignalingError> {
        match self {
            Self::Consumed(params) => Ok(params),
            other => Err(other.unexpected("consume")),
        }
    }
}

/// Notifications pushed by the relay
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "kebab-case")]
pub enum Notification {
    /// Producers that existed when the peer joined, sent once as the first
    /// notification of every connection
    ExistingProducers {
        /// Snapshot of the other peers' producers
        #[serde(rename = "producerIds")]
        producer_ids: Vec<ProducerInfo>,
    },
    /// Another peer published a producer
    NewProducer(ProducerInfo),
    /// Another peer's producer closed
    ProducerClosed {
        /// Closed producer
        #[serde(rename = "producerId")]
        producer_id: ProducerId,
    },
    /// Another peer disconnected
    PeerLeft {
        /// Departed peer
        #[serde(rename = "peerId")]
        peer_id: PeerId,
    },
    /// One of this peer's consumers was closed by the relay
    ConsumerClosed {
        /// Closed consumer
        #[serde(rename = "consumerId")]
        consumer_id: ConsumerId,
    },
}

impl Notification {
    /// Wire event name
    #[must_use]
    pub fn event(&self) -> &'static str {
        match self {
            Self::ExistingProducers { .. } => "existing-producers",
            Self::NewProducer(_) => "new-producer",
            Self::ProducerClosed { .. } => "producer-closed",
            Self::PeerLeft { .. } => "peer-left",
            Self::ConsumerClosed { .. } => "consumer-closed",
        }
    }
}

/// Frame sent by a participant
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientFrame {
    /// Correlation id echoed in the response
    pub id: u64,
    /// Method name
    pub method: String,
    /// Method payload
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub data: Value,
}

impl ClientFrame {
    /// Frame a request
    ///
    /// # Errors
    ///
    /// Returns `InvalidRequest` if the request cannot be serialized
    pub fn new(id: u64, request: &Request) -> Result<Self, SignalingError> {
        let mut value = serde_json::to_value(request)
            .map_err(|e| SignalingError::InvalidRequest(e.to_string()))?;
        let data = value.get_mut("data").map(Value::take).unwrap_or(Value::Null);
        Ok(Self {
            id,
            method: request.method().to_string(),
            data,
        })
    }

    /// Decode the framed request
    ///
    /// # Errors
    ///
    /// Returns `InvalidRequest` for an unknown method or malformed payload
    pub fn to_request(&self) -> Result<Request, SignalingError> {
        let mut envelope = serde_json::Map::new();
        envelope.insert("method".to_string(), Value::String(self.method.clone()));
        if !self.data.is_null() {
            envelope.insert("data".to_string(), self.data.clone());
        }
        serde_json::from_value(Value::Object(envelope)).map_err(|e| {
            SignalingError::InvalidRequest(format!("bad {} request: {}", self.method, e))
        })
    }
}

/// Frame sent by the relay
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ServerFrame {
    /// Reply to one request
    Response {
        /// Correlation id of the request
        id: u64,
        /// Success body
        #[serde(default, skip_serializing_if = "Option::is_none")]
        ok: Option<Value>,
        /// Failure body
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<ErrorReply>,
    },
    /// Push notification
    Notification {
        /// Event name
        event: String,
        /// Event payload
        #[serde(default)]
        data: Value,
    },
}

impl ServerFrame {
    /// Frame the outcome of request `id`
    #[must_use]
    pub fn response(id: u64, outcome: &Result<Response, SignalingError>) -> Self {
        match outcome {
            Ok(response) => match serde_json::to_value(response) {
                Ok(body) => Self::Response {
                    id,
                    ok: Some(body),
                    error: None,
                },
                Err(e) => Self::Response {
                    id,
                    ok: None,
                    error: Some(SignalingError::InvalidRequest(e.to_string()).to_reply()),
                },
            },
            Err(err) => Self::Response {
                id,
                ok: None,
                error: Some(err.to_reply()),
            },
        }
    }

    /// Frame a notification
    ///
    /// # Errors
    ///
    /// Returns `InvalidRequest` if the notification cannot be serialized
    pub fn notification(notification: &Notification) -> Result<Self, SignalingError> {
        let mut value = serde_json::to_value(notification)
            .map_err(|e| SignalingError::InvalidRequest(e.to_string()))?;
        let data = value.get_mut("data").map(Value::take).unwrap_or(Value::Null);
        Ok(Self::Notification {
            event: notification.event().to_string(),
            data,
        })
    }

    /// Decode a notification frame
    ///
    /// # Errors
    ///
    /// Returns `InvalidRequest` for a response frame, unknown event or bad payload
    pub fn to_notification(&self) -> Result<Notification, SignalingError> {
        match self {
            Self::Notification { event, data } => {
                let mut envelope = serde_json::Map::new();
                envelope.insert("event".to_string(), Value::String(event.clone()));
                envelope.insert("data".to_string(), data.clone());
                serde_json::from_value(Value::Object(envelope)).map_err(|e| {
                    SignalingError::InvalidRequest(format!("bad {} notification: {}", event, e))
                })
            }
            Self::Response { id, .. } => Err(SignalingError::InvalidRequest(format!(
                "response {} is not a notification",
                id
            ))),
        }
    }
}

/// Client end of a signaling connection
///
/// Implement this for your specific transport (WebSocket, in-process, ...).
/// Requests on one channel may be issued concurrently; each resolves
/// independently.
#[async_trait]
pub trait SignalingChannel: Send + Sync {
    /// Send a request and wait for its response
    ///
    /// # Errors
    ///
    /// Returns the relay's structured error, or `ChannelClosed`
    async fn request(&self, request: Request) -> Result<Response, SignalingError>;

    /// Take the notification stream
    ///
    /// Returns `None` after the first call. Notifications arriving before the
    /// stream is taken are buffered.
    fn take_notifications(&self) -> Option<mpsc::UnboundedReceiver<Notification>>;
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn test_request_frame_shape() {
        let request = Request::ResumeConsumer(ResumeConsumerRequest {
            consumer_id: ConsumerId::from("c-1"),
        });
        let frame = ClientFrame::new(3, &request).unwrap();
        assert_eq!(
            serde_json::to_value(&frame).unwrap(),
            json!({"id": 3, "method": "resume-consumer", "data": {"consumerId": "c-1"}})
        );
        assert_eq!(frame.to_request().unwrap(), request);
    }

    #[test]
    fn test_unit_request_has_no_data() {
        let frame = ClientFrame::new(1, &Request::CreateTransport).unwrap();
        assert_eq!(
            serde_json::to_value(&frame).unwrap(),
            json!({"id": 1, "method": "create-transport"})
        );
        assert_eq!(frame.to_request().unwrap(), Request::CreateTransport);
    }

    #[test]
    fn test_misspelled_capabilities_method_is_accepted() {
        let frame: ClientFrame =
            serde_json::from_value(json!({"id": 1, "method": "get-router-rtp-capabilites"}))
                .unwrap();
        assert_eq!(frame.to_request().unwrap(), Request::GetRouterRtpCapabilities);
    }

    #[test]
    fn test_unknown_method_is_invalid_request() {
        let frame: ClientFrame =
            serde_json::from_value(json!({"id": 1, "method": "delete-everything"})).unwrap();
        assert!(matches!(
            frame.to_request(),
            Err(SignalingError::InvalidRequest(_))
        ));
    }

    #[test]
    fn test_error_response_round_trips_to_error() {
        let err = SignalingError::UnknownConsumer("c-9".to_string());
        let frame = ServerFrame::response(4, &Err(err.clone()));
        let json = serde_json::to_value(&frame).unwrap();
        assert_eq!(
            json,
            json!({"type": "response", "id": 4, "error": {"code": "unknown-consumer", "message": "c-9"}})
        );

        let parsed: ServerFrame = serde_json::from_value(json).unwrap();
        let ServerFrame::Response { error: Some(reply), .. } = parsed else {
            panic!("expected error response");
        };
        assert_eq!(SignalingError::from(reply), err);
    }

    #[test]
    fn test_resume_response_body() {
        let frame = ServerFrame::response(2, &Ok(Response::ConsumerResumed { resumed: true }));
        assert_eq!(
            serde_json::to_value(&frame).unwrap(),
            json!({"type": "response", "id": 2, "ok": {"resumed": true}})
        );
    }

    #[test]
    fn test_decode_response_by_method() {
        let request = Request::Produce(ProduceRequest {
            transport_id: TransportId::from("t-1"),
            kind: MediaKind::Audio,
            rtp_parameters: RtpParameters::default(),
        });
        let response = request.decode_response(json!({"id": "p-1"})).unwrap();
        assert_eq!(response.into_producer_id().unwrap(), ProducerId::from("p-1"));

        assert!(request.decode_response(json!({"resumed": true})).is_err());
    }

    #[test]
    fn test_notification_frames() {
        let peer_id = PeerId::new();
        let notification = Notification::ExistingProducers {
            producer_ids: vec![ProducerInfo {
                producer_id: ProducerId::from("p-1"),
                peer_id,
                kind: MediaKind::Video,
            }],
        };
        let frame = ServerFrame::notification(&notification).unwrap();
        assert_eq!(
            serde_json::to_value(&frame).unwrap(),
            json!({
                "type": "notification",
                "event": "existing-producers",
                "data": {"producerIds": [{"producerId": "p-1", "peerId": peer_id.to_string(), "kind": "video"}]}
            })
        );
        assert_eq!(frame.to_notification().unwrap(), notification);

        let left = Notification::PeerLeft { peer_id };
        let frame = ServerFrame::notification(&left).unwrap();
        assert_eq!(frame.to_notification().unwrap(), left);
    }

    #[test]
    fn test_response_frame_is_not_a_notification() {
        let frame = ServerFrame::response(1, &Ok(Response::ProducerClosed { closed: true }));
        assert!(frame.to_notification().is_err());
    }
}
