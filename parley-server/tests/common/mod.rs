#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::Message;
use parley_core::{Envelope, JoinPayload, OfferPayload, PeerId};
use parley_server::config::Config;
use parley_server::hub::{Hub, HubError, JoinOutcome};
use parley_server::peer::Peer;
use parley_server::rtc;
use tokio::sync::mpsc::{self, UnboundedReceiver};
use tokio::task::JoinHandle;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::APIBuilder;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;

pub fn test_config() -> Config {
    Config {
        port: 0,
        max_users_per_room: 25,
        max_rooms: 100,
        chat_history_size: 200,
        // 0/0 leaves the default ephemeral UDP behavior in place for tests.
        udp_min: 0,
        udp_max: 0,
        public_ip_source: String::new(),
        public_ip: None,
        public_ip_recheck_interval: Duration::ZERO,
        public_ip_recheck_rebuild_peers: true,
        trust_proxy: false,
        allowed_origins: Vec::new(),
    }
}

pub fn test_hub() -> Hub {
    Hub::new(&test_config()).expect("failed to build hub")
}

pub fn test_hub_with(f: impl FnOnce(&mut Config)) -> Hub {
    let mut cfg = test_config();
    f(&mut cfg);
    Hub::new(&cfg).expect("failed to build hub")
}

/// An in-process peer whose writer side the test drains.
pub fn test_peer() -> (Arc<Peer>, UnboundedReceiver<Message>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (Peer::new(PeerId::new(), tx), rx)
}

pub fn join_payload(username: &str, channel_name: &str, password: &str) -> JoinPayload {
    JoinPayload {
        username: username.to_owned(),
        channel_name: channel_name.to_owned(),
        password: password.to_owned(),
        invite_token: String::new(),
        session_token: String::new(),
    }
}

/// Wait for the next text frame and parse it as an envelope.
pub async fn recv_envelope(rx: &mut UnboundedReceiver<Message>) -> Envelope {
    loop {
        let msg = tokio::time::timeout(Duration::from_secs(10), rx.recv())
            .await
            .expect("timed out waiting for a frame")
            .expect("writer channel closed");
        if let Message::Text(text) = msg {
            return serde_json::from_str(text.as_str()).expect("invalid envelope");
        }
    }
}

/// Skip frames until an envelope of the given type arrives.
pub async fn recv_kind(rx: &mut UnboundedReceiver<Message>, kind: &str) -> Envelope {
    loop {
        let env = recv_envelope(rx).await;
        if env.kind == kind {
            return env;
        }
    }
}

pub fn drain(rx: &mut UnboundedReceiver<Message>) {
    while rx.try_recv().is_ok() {}
}

/// The connection handler's create flow minus media: create the room and
/// deliver the welcome.
pub async fn create(
    hub: &Hub,
    peer: &Arc<Peer>,
    username: &str,
    channel_name: &str,
    password: &str,
) -> (Arc<parley_server::room::Room>, String) {
    peer.state_mut().name = username.to_owned();
    let (room, session_token) = hub
        .create_room(channel_name, password, peer, None)
        .await
        .expect("create_room failed");
    let welcome = hub.build_welcome(peer, &room, &session_token);
    peer.send_json("welcome", &welcome);
    (room, session_token)
}

/// The connection handler's join flow minus media: join, welcome, fan-out.
pub async fn join(
    hub: &Hub,
    peer: &Arc<Peer>,
    payload: JoinPayload,
) -> Result<JoinOutcome, HubError> {
    let outcome = hub.join_room(payload, peer).await?;
    let welcome = hub.build_welcome(&outcome.peer, &outcome.room, &outcome.session_token);
    outcome.peer.send_json("welcome", &welcome);
    hub.broadcast_room_update(&outcome.room);
    Ok(outcome)
}

pub async fn new_client_pc() -> Arc<RTCPeerConnection> {
    let mut media_engine = MediaEngine::default();
    media_engine
        .register_default_codecs()
        .expect("failed to register codecs");
    let registry = register_default_interceptors(Registry::new(), &mut media_engine)
        .expect("failed to register interceptors");
    let api = APIBuilder::new()
        .with_media_engine(media_engine)
        .with_interceptor_registry(registry)
        .build();
    Arc::new(
        api.new_peer_connection(RTCConfiguration::default())
            .await
            .expect("failed to create client peer connection"),
    )
}

/// Client side of one signaling exchange: apply the server offer, produce an
/// answer.
pub struct TestClient {
    pub pc: Arc<RTCPeerConnection>,
}

impl TestClient {
    pub async fn new() -> Self {
        Self {
            pc: new_client_pc().await,
        }
    }

    pub async fn answer(&self, offer_sdp: String) -> String {
        let offer = RTCSessionDescription::offer(offer_sdp).expect("invalid offer SDP");
        self.pc
            .set_remote_description(offer)
            .await
            .expect("set_remote_description failed");
        let answer = self
            .pc
            .create_answer(None)
            .await
            .expect("create_answer failed");
        self.pc
            .set_local_description(answer.clone())
            .await
            .expect("set_local_description failed");
        answer.sdp
    }
}

/// Drains a peer's writer, answering every server offer like a well-behaved
/// client (a fresh client connection whenever `reset` is set) and forwarding
/// every other envelope for the test to assert on.
pub fn spawn_answer_bot(
    peer: Arc<Peer>,
    mut rx: UnboundedReceiver<Message>,
) -> (JoinHandle<()>, UnboundedReceiver<Envelope>) {
    let (fwd_tx, fwd_rx) = mpsc::unbounded_channel();
    let handle = tokio::spawn(async move {
        let mut client: Option<TestClient> = None;
        while let Some(msg) = rx.recv().await {
            let Message::Text(text) = msg else { continue };
            let Ok(env) = serde_json::from_str::<Envelope>(text.as_str()) else {
                continue;
            };
            if env.kind != "offer" {
                let _ = fwd_tx.send(env);
                continue;
            }
            let offer: OfferPayload =
                serde_json::from_value(env.payload).expect("invalid offer payload");
            if offer.reset || client.is_none() {
                client = Some(TestClient::new().await);
            }
            let sdp = client
                .as_ref()
                .expect("client missing")
                .answer(offer.sdp)
                .await;
            let _ = rtc::handle_answer(&peer, sdp, offer.seq, offer.epoch).await;
        }
    });
    (handle, fwd_rx)
}
