//! Signaling over a real WebSocket connection on localhost

#![cfg(feature = "websocket")]
#![allow(clippy::unwrap_used, clippy::expect_used)]

use roomcast_core::prelude::*;
use roomcast_core::signaling::ConnectTransportRequest;
use roomcast_core::{
    ClientConfig, DtlsFingerprint, DtlsParameters, DtlsRole, Request, TransportConfig, TransportId,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

struct Relay {
    service: RelayService,
    server: Arc<WebSocketServer>,
    accept: JoinHandle<()>,
    url: String,
}

impl Relay {
    async fn start() -> Self {
        let service = RelayService::builder()
            .with_listen_addr("127.0.0.1:0".parse().unwrap())
            .build()
            .await
            .unwrap();
        let server = Arc::new(service.bind().await.unwrap());
        let url = format!("ws://{}", server.local_addr().unwrap());
        let accept = {
            let server = server.clone();
            tokio::spawn(async move { server.run().await })
        };
        Self {
            service,
            server,
            accept,
            url,
        }
    }

    async fn channel(&self) -> Arc<WebSocketChannel> {
        Arc::new(
            WebSocketChannel::connect(&self.url, TransportConfig::default())
                .await
                .unwrap(),
        )
    }
}

async fn eventually(what: &str, mut condition: impl FnMut() -> bool) {
    let reached = tokio::time::timeout(Duration::from_secs(5), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
    assert!(reached.is_ok(), "timed out waiting for {}", what);
}

#[tokio::test]
async fn test_request_response_round_trip() {
    let relay = Relay::start().await;
    let channel = relay.channel().await;

    let capabilities = channel
        .request(Request::GetRouterRtpCapabilities)
        .await
        .unwrap()
        .into_rtp_capabilities()
        .unwrap();
    assert_eq!(capabilities, relay.service.rtp_capabilities());

    let params = channel
        .request(Request::CreateTransport)
        .await
        .unwrap()
        .into_transport_params()
        .unwrap();
    assert!(!params.ice_candidates.is_empty());
    assert_eq!(channel.pending_requests(), 0);
}

#[tokio::test]
async fn test_first_notification_arrives_over_the_wire() {
    let relay = Relay::start().await;
    let channel = relay.channel().await;
    let mut notifications = channel.take_notifications().unwrap();
    assert!(channel.take_notifications().is_none());

    let first = tokio::time::timeout(Duration::from_secs(5), notifications.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(
        first,
        Notification::ExistingProducers {
            producer_ids: Vec::new()
        }
    );
}

#[tokio::test]
async fn test_error_codes_survive_the_wire() {
    let relay = Relay::start().await;
    let channel = relay.channel().await;

    let result = channel
        .request(Request::ConnectTransport(ConnectTransportRequest {
            transport_id: TransportId::from("missing"),
            dtls_parameters: DtlsParameters {
                role: DtlsRole::Client,
                fingerprints: vec![DtlsFingerprint {
                    algorithm: "sha-256".to_string(),
                    value: "00".to_string(),
                }],
            },
        }))
        .await;
    assert!(matches!(result, Err(SignalingError::UnknownTransport(_))));
}

#[tokio::test]
async fn test_sessions_meet_over_websocket() {
    let relay = Relay::start().await;
    let a_channel = relay.channel().await;
    let b_channel = relay.channel().await;
    let a = SessionController::new(
        a_channel.clone(),
        LoopbackDevice::new(),
        ClientConfig::default(),
    );
    let b = SessionController::new(
        b_channel.clone(),
        LoopbackDevice::new(),
        ClientConfig::default(),
    );
    a.init().await.unwrap();
    b.init().await.unwrap();
    assert_eq!(relay.service.peer_count(), 2);

    let report = a
        .start_producing(&LocalMedia::capture(true, true))
        .await
        .unwrap();
    assert_eq!(report.producer_ids().len(), 2);
    eventually("A's tracks at B", || {
        b.aggregator()
            .aggregates()
            .iter()
            .map(|aggregate| aggregate.track_count())
            .sum::<usize>()
            == 2
    })
    .await;

    a.close();
    a_channel.close();
    eventually("A's departure", || relay.service.peer_count() == 1).await;
    eventually("A's aggregate removed", || b.aggregator().is_empty()).await;
    eventually("A's channel closed", || a_channel.is_closed()).await;
    assert!(matches!(
        a_channel.request(Request::GetRouterRtpCapabilities).await,
        Err(SignalingError::ChannelClosed(_))
    ));
}

#[tokio::test]
async fn test_stopped_server_refuses_new_connections() {
    let Relay {
        service,
        server,
        accept,
        url,
    } = Relay::start().await;
    server.stop();
    accept.await.unwrap();
    drop(server);
    drop(service);

    let result = WebSocketChannel::connect(&url, TransportConfig::default()).await;
    assert!(result.is_err());
}
