use std::sync::{Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Instant;

use axum::extract::ws::Message;
use parley_core::{Envelope, ErrorCode, ErrorPayload, PeerId, RoomId};
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tracing::warn;
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::track::track_local::track_local_static_rtp::TrackLocalStaticRTP;

pub type Writer = mpsc::UnboundedSender<Message>;

/// Identity, membership and media state of one participant. Guarded by the
/// peer's short identity lock; never held across an await.
#[derive(Debug)]
pub struct PeerState {
    pub name: String,
    pub session_token: Option<String>,
    pub session_created_at: Option<Instant>,
    /// Current room (main or sub-channel id). Retained after a transport drop
    /// so a session-token reconnect can find its way back.
    pub room_id: Option<RoomId>,
    pub main_room_id: Option<RoomId>,
    pub muted: bool,

    pub pc: Option<Arc<RTCPeerConnection>>,
    pub track: Option<Arc<TrackLocalStaticRTP>>,
    /// Bumped on every media-connection (re)creation.
    pub epoch: u64,
    /// Monotonic per epoch.
    pub offer_seq: u64,
    pub pending_renego: bool,
    pub ice_restart_queued: bool,
    pub has_remote_description: bool,
    /// Candidates that arrived before the remote description for this epoch.
    pub pending_candidates: Vec<RTCIceCandidateInit>,
    signal_gate: Option<watch::Sender<bool>>,
}

impl PeerState {
    /// Replace the per-offer signaling-ready handle. Dropping the previous
    /// sender wakes anyone still waiting on an older offer.
    pub fn arm_signal_gate(&mut self) -> watch::Receiver<bool> {
        let (tx, rx) = watch::channel(false);
        self.signal_gate = Some(tx);
        rx
    }

    pub fn fire_signal_gate(&mut self) {
        if let Some(tx) = self.signal_gate.take() {
            let _ = tx.send(true);
        }
    }

    /// Install a freshly created media connection; the epoch bump invalidates
    /// every in-flight answer and candidate of the previous connection.
    pub fn install_media(&mut self, pc: Arc<RTCPeerConnection>, track: Arc<TrackLocalStaticRTP>) {
        self.fire_signal_gate();
        self.pc = Some(pc);
        self.track = Some(track);
        self.epoch += 1;
        self.offer_seq = 0;
        self.pending_renego = false;
        self.ice_restart_queued = false;
        self.has_remote_description = false;
        self.pending_candidates.clear();
    }

    /// Detach the media connection for explicit teardown; returns the handle
    /// so the caller can close it outside the lock.
    pub fn take_media(&mut self) -> Option<Arc<RTCPeerConnection>> {
        self.fire_signal_gate();
        self.track = None;
        self.offer_seq = 0;
        self.pending_renego = false;
        self.ice_restart_queued = false;
        self.has_remote_description = false;
        self.pending_candidates.clear();
        self.pc.take()
    }
}

#[derive(Debug)]
struct WriterSlot {
    tx: Writer,
    generation: u64,
}

/// One live participant. Outbound frames are serialized through an unbounded
/// channel drained by the connection's writer task, so concurrent senders
/// never interleave partial frames.
#[derive(Debug)]
pub struct Peer {
    pub id: PeerId,
    state: RwLock<PeerState>,
    writer: Mutex<WriterSlot>,
    /// Serializes offer construction (held across media-library awaits).
    pub nego: tokio::sync::Mutex<()>,
}

impl Peer {
    pub fn new(id: PeerId, tx: Writer) -> Arc<Self> {
        Arc::new(Self {
            id,
            state: RwLock::new(PeerState {
                name: String::new(),
                session_token: None,
                session_created_at: None,
                room_id: None,
                main_room_id: None,
                muted: false,
                pc: None,
                track: None,
                epoch: 0,
                offer_seq: 0,
                pending_renego: false,
                ice_restart_queued: false,
                has_remote_description: false,
                pending_candidates: Vec::new(),
                signal_gate: None,
            }),
            writer: Mutex::new(WriterSlot { tx, generation: 1 }),
            nego: tokio::sync::Mutex::new(()),
        })
    }

    pub fn state(&self) -> RwLockReadGuard<'_, PeerState> {
        self.state.read().unwrap()
    }

    pub fn state_mut(&self) -> RwLockWriteGuard<'_, PeerState> {
        self.state.write().unwrap()
    }

    /// Re-bind this peer to a new transport (session reconnect). Returns the
    /// new writer generation; removal paths compare generations so a stale
    /// connection's cleanup cannot evict a reconnected peer.
    pub fn set_writer(&self, tx: Writer) -> u64 {
        let mut slot = self.writer.lock().unwrap();
        slot.tx = tx;
        slot.generation += 1;
        slot.generation
    }

    pub fn writer_generation(&self) -> u64 {
        self.writer.lock().unwrap().generation
    }

    pub fn writer(&self) -> Writer {
        self.writer.lock().unwrap().tx.clone()
    }

    pub fn send_json<T: Serialize>(&self, kind: &str, payload: &T) {
        let env = match Envelope::new(kind, payload) {
            Ok(env) => env,
            Err(e) => {
                warn!(peer = %self.id, error = %e, "failed to serialize envelope");
                return;
            }
        };
        let text = match serde_json::to_string(&env) {
            Ok(text) => text,
            Err(e) => {
                warn!(peer = %self.id, error = %e, "failed to serialize envelope");
                return;
            }
        };
        // A send error just means the connection is gone; the read loop will
        // run the removal path.
        let _ = self.writer.lock().unwrap().tx.send(Message::Text(text.into()));
    }

    pub fn send_error(&self, code: ErrorCode, message: &str) {
        self.send_json(
            "error",
            &ErrorPayload {
                code,
                message: message.to_owned(),
            },
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_peer() -> (Arc<Peer>, mpsc::UnboundedReceiver<Message>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Peer::new(PeerId::new(), tx), rx)
    }

    #[test]
    fn send_error_produces_an_error_envelope() {
        let (peer, mut rx) = test_peer();
        peer.send_error(ErrorCode::NameTaken, "Username already taken in this room");
        let Some(Message::Text(text)) = rx.try_recv().ok() else {
            panic!("expected a text frame");
        };
        let env: Envelope = serde_json::from_str(text.as_str()).unwrap();
        assert_eq!(env.kind, "error");
        assert_eq!(env.payload["code"], "NAME_TAKEN");
    }

    #[test]
    fn take_media_resets_counters_but_keeps_the_epoch() {
        let (peer, _rx) = test_peer();
        {
            let mut st = peer.state_mut();
            st.offer_seq = 5;
            st.pending_renego = true;
            st.epoch = 2;
        }
        let mut st = peer.state_mut();
        assert!(st.take_media().is_none());
        assert_eq!(st.offer_seq, 0);
        assert!(!st.pending_renego);
        assert_eq!(st.epoch, 2);
    }

    #[test]
    fn writer_generation_increments_on_rebind() {
        let (peer, _rx) = test_peer();
        assert_eq!(peer.writer_generation(), 1);
        let (tx2, _rx2) = mpsc::unbounded_channel();
        assert_eq!(peer.set_writer(tx2), 2);
        assert_eq!(peer.writer_generation(), 2);
    }
}
