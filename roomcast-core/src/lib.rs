//! Roomcast - session orchestration for relayed multi-party audio/video rooms
//!
//! Every participant sends its media once to a central relay (an SFU), which
//! forwards it to every other participant. This crate contains the control
//! plane around the media engine:
//!
//! - **Peer registry**: which connection owns which transports, producers and
//!   consumers, and who must hear about a change
//! - **Signaling protocol handler**: turns participant requests into engine
//!   calls and pushes discovery notifications
//! - **Client session controller**: the participant side, from device load to
//!   one live track per remote peer and kind
//! - **Track aggregator**: groups inbound tracks by remote peer
//!
//! The media engine itself sits behind the [`engine`] traits. A loopback
//! engine and device are included so a whole room can run in one process.
//!
//! # Examples
//!
//! ```rust,no_run
//! use roomcast_core::prelude::*;
//! use std::sync::Arc;
//!
//! # async fn example() -> anyhow::Result<()> {
//! let service = RelayService::builder().build().await?;
//!
//! let channel = Arc::new(service.connect_local()?);
//! let controller = SessionController::new(channel, LoopbackDevice::new(), ClientConfig::default());
//! controller.init().await?;
//! controller.start_producing(&LocalMedia::capture(true, true)).await?;
//! # Ok(())
//! # }
//! ```

#![deny(missing_docs)]
#![deny(unsafe_code)]
#![deny(clippy::panic)]
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![warn(clippy::all)]
#![allow(clippy::pedantic)]
#![allow(clippy::nursery)]
#![allow(clippy::unused_async)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::derivable_impls)]

/// Media routing types and data structures
pub mod types;

/// Connection identity
pub mod identity;

/// Signaling protocol messages and errors
pub mod signaling;

/// Media engine adapter interface
pub mod engine;

/// In-process media engine
pub mod loopback_engine;

/// Per-peer resource ownership and state machines
pub mod session;

/// Registry of connected peers
pub mod registry;

/// Server-side signaling protocol handler
pub mod protocol_handler;

/// Media tracks
pub mod media;

/// Peer-keyed aggregation of inbound tracks
pub mod aggregator;

/// Client-side session controller
pub mod client;

/// In-process client device
pub mod loopback_device;

/// Signaling transport adapters
pub mod transport;

/// Relay service orchestration
pub mod service;

// Re-export main types at crate root
pub use aggregator::{AggregateEvent, RemotePeerAggregate, TrackAggregator};
pub use client::{
    ClientConfig, ClientError, ControllerState, Device, DeviceError, ProduceReport,
    SessionController,
};
pub use engine::{EngineError, MediaEngine, WebRtcTransportOptions};
pub use identity::PeerId;
pub use loopback_device::LoopbackDevice;
pub use loopback_engine::{LoopbackEngine, LoopbackEngineConfig, LoopbackRouter};
pub use media::{LocalMedia, MediaTrack, TrackState};
pub use protocol_handler::{HandlerConfig, PeerLink, RelayEvent, SignalingProtocolHandler};
pub use registry::{PeerRegistry, RegistryError};
pub use service::{RelayConfig, RelayService, RelayServiceBuilder, ServiceError};
pub use session::{PeerSession, SessionError};
pub use signaling::{
    ErrorCode, Notification, Request, Response, SignalingChannel, SignalingError,
};
pub use transport::{LocalChannel, TransportConfig, TransportError};
#[cfg(feature = "websocket")]
pub use transport::{WebSocketChannel, WebSocketServer};
pub use types::*;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::aggregator::{AggregateEvent, RemotePeerAggregate, TrackAggregator};
    pub use crate::client::{ClientConfig, ClientError, ControllerState, SessionController};
    pub use crate::identity::PeerId;
    pub use crate::loopback_device::LoopbackDevice;
    pub use crate::media::{LocalMedia, MediaTrack};
    pub use crate::service::{RelayConfig, RelayEvent, RelayService};
    pub use crate::signaling::{Notification, SignalingChannel, SignalingError};
    pub use crate::transport::LocalChannel;
    #[cfg(feature = "websocket")]
    pub use crate::transport::{WebSocketChannel, WebSocketServer};
    pub use crate::types::{MediaKind, ProducerId, ProducerInfo};
}
