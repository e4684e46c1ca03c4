pub mod error;
pub mod gc;
pub mod invite;

pub use error::HubError;
pub use invite::PendingInvite;

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use parley_core::{
    ChatHistoryPayload, JoinPayload, RoomId, RoomStatePayload, RoomUpdatePayload, WelcomePayload,
};
use rand::Rng;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::Config;
use crate::peer::Peer;
use crate::room::{unix_millis, ChatMessage, Room};
use crate::rtc::{self, RtcConfig, RtcEngine};

pub(crate) const SESSION_MAX_AGE: Duration = Duration::from_secs(24 * 60 * 60);
pub(crate) const INVITE_MAX_AGE: Duration = Duration::from_secs(7 * 24 * 60 * 60);
pub(crate) const ROOM_CREATE_WINDOW: Duration = Duration::from_secs(10 * 60);
pub(crate) const MAX_ROOM_CREATES_PER_IP: usize = 3;
pub(crate) const EMPTY_SUB_TTL: Duration = Duration::from_secs(5 * 60);
pub(crate) const EMPTY_ROOM_TTL: Duration = Duration::from_secs(30 * 60);
pub(crate) const SUB_COUNTDOWN: Duration = Duration::from_secs(5 * 60);
pub(crate) const INVITE_TIMEOUT: Duration = Duration::from_secs(30);
const FULL_NAME_RETRIES: usize = 10;

#[derive(Default)]
pub(crate) struct HubState {
    /// Main rooms only; sub-channels hang off their parent.
    pub(crate) rooms: HashMap<RoomId, Arc<Room>>,
    pub(crate) rooms_by_name: HashMap<String, Arc<Room>>,
    pub(crate) invite_map: HashMap<String, Arc<Room>>,
    pub(crate) session_map: HashMap<String, Arc<Peer>>,
    pub(crate) pending_invites: HashMap<String, PendingInvite>,
    pub(crate) room_creates_per_ip: HashMap<IpAddr, Vec<Instant>>,
}

struct HubInner {
    state: RwLock<HubState>,
    engine: RtcEngine,
    max_users_per_room: usize,
    max_rooms: usize,
    chat_history_size: usize,
}

/// Owns every room, session and pending invite. Lock order, never reversed:
/// Hub state -> Room state -> Peer state. Media-library calls and transport
/// writes always happen after the hub lock is released.
#[derive(Clone)]
pub struct Hub {
    inner: Arc<HubInner>,
}

#[derive(Debug)]
pub struct JoinOutcome {
    /// The main room, for the welcome payload (the peer's current channel may
    /// be one of its sub-channels after a reconnect).
    pub room: Arc<Room>,
    pub session_token: String,
    /// On a session reconnect this is the re-bound existing peer, not the one
    /// the connection handler constructed.
    pub peer: Arc<Peer>,
    pub reconnected: bool,
    pub writer_generation: u64,
}

impl Hub {
    pub fn new(cfg: &Config) -> anyhow::Result<Self> {
        let engine = RtcEngine::new(RtcConfig::from_config(cfg))?;
        info!(
            max_users_per_room = cfg.max_users_per_room,
            max_rooms = cfg.max_rooms,
            chat_history_size = cfg.chat_history_size,
            "hub ready"
        );
        Ok(Self {
            inner: Arc::new(HubInner {
                state: RwLock::new(HubState::default()),
                engine,
                max_users_per_room: cfg.max_users_per_room,
                max_rooms: cfg.max_rooms,
                chat_history_size: cfg.chat_history_size,
            }),
        })
    }

    pub fn engine(&self) -> &RtcEngine {
        &self.inner.engine
    }

    pub(crate) fn state(&self) -> std::sync::RwLockReadGuard<'_, HubState> {
        self.inner.state.read().unwrap()
    }

    pub(crate) fn state_mut(&self) -> std::sync::RwLockWriteGuard<'_, HubState> {
        self.inner.state.write().unwrap()
    }

    pub fn main_rooms(&self) -> Vec<Arc<Room>> {
        self.state().rooms.values().cloned().collect()
    }

    pub fn main_room(&self, id: RoomId) -> Option<Arc<Room>> {
        self.state().rooms.get(&id).cloned()
    }

    /// The channel the peer currently sits in (main room or one of its subs).
    pub fn current_room(&self, peer: &Arc<Peer>) -> Option<Arc<Room>> {
        let (room_id, main_id) = {
            let ps = peer.state();
            (ps.room_id, ps.main_room_id)
        };
        let room_id = room_id?;
        let st = self.state();
        if let Some(room) = st.rooms.get(&room_id) {
            return Some(room.clone());
        }
        main_id
            .and_then(|mid| st.rooms.get(&mid))
            .and_then(|main| main.state().sub_channels.get(&room_id).cloned())
    }

    pub async fn create_room(
        &self,
        channel_name: &str,
        password: &str,
        creator: &Arc<Peer>,
        ip: Option<IpAddr>,
    ) -> Result<(Arc<Room>, String), HubError> {
        let password = password.to_owned();
        let password_hash =
            tokio::task::spawn_blocking(move || bcrypt::hash(password, bcrypt::DEFAULT_COST))
                .await
                .map_err(|e| HubError::Internal(format!("hash task: {e}")))?
                .map_err(|e| HubError::Internal(format!("hash password: {e}")))?;

        let mut st = self.state_mut();

        if st.rooms.len() >= self.inner.max_rooms {
            return Err(HubError::ServerFull);
        }

        if let Some(ip) = ip {
            let now = Instant::now();
            let recent = st.room_creates_per_ip.entry(ip).or_default();
            recent.retain(|t| now.duration_since(*t) < ROOM_CREATE_WINDOW);
            if recent.len() >= MAX_ROOM_CREATES_PER_IP {
                return Err(HubError::CreateRateLimited);
            }
            recent.push(now);
        }

        let mut full_name = None;
        for _ in 0..FULL_NAME_RETRIES {
            let candidate = format!(
                "{}#{:04}",
                channel_name,
                rand::thread_rng().gen_range(0..10_000)
            );
            if !st.rooms_by_name.contains_key(&candidate) {
                full_name = Some(candidate);
                break;
            }
        }
        let Some(full_name) = full_name else {
            return Err(HubError::Internal(
                "could not generate a unique room name".to_owned(),
            ));
        };

        let room_id = RoomId::new();
        let invite_token = Uuid::new_v4().to_string();
        let room = Room::new_main(
            room_id,
            channel_name.to_owned(),
            full_name.clone(),
            invite_token.clone(),
            password_hash,
        );

        let session_token = Uuid::new_v4().to_string();
        {
            let mut ps = creator.state_mut();
            ps.room_id = Some(room_id);
            ps.main_room_id = Some(room_id);
            ps.session_token = Some(session_token.clone());
            ps.session_created_at = Some(Instant::now());
        }
        room.state_mut().add_peer(creator.clone());

        st.rooms.insert(room_id, room.clone());
        st.rooms_by_name.insert(full_name.clone(), room.clone());
        st.invite_map.insert(invite_token, room.clone());
        st.session_map.insert(session_token.clone(), creator.clone());

        info!(room = %full_name, id = %room_id, "room created");
        Ok((room, session_token))
    }

    /// Resolution order: session token, invite token, channel name + password.
    /// The first present credential wins and later ones are not attempted.
    pub async fn join_room(
        &self,
        payload: JoinPayload,
        peer: &Arc<Peer>,
    ) -> Result<JoinOutcome, HubError> {
        if !payload.session_token.is_empty() {
            if let Some(outcome) = self.try_session_reconnect(&payload.session_token, peer) {
                return Ok(outcome);
            }
        }

        let via_invite = !payload.invite_token.is_empty();
        let resolved: Arc<Room> = {
            let mut st = self.state_mut();
            if via_invite {
                let room = st
                    .invite_map
                    .get(&payload.invite_token)
                    .cloned()
                    .ok_or(HubError::ChannelNotFound)?;
                if room.created_at.elapsed() > INVITE_MAX_AGE {
                    st.invite_map.remove(&payload.invite_token);
                    return Err(HubError::InviteExpired);
                }
                room
            } else if !payload.channel_name.is_empty() {
                st.rooms_by_name
                    .get(&payload.channel_name)
                    .cloned()
                    .ok_or(HubError::ChannelNotFound)?
            } else {
                return Err(HubError::MissingJoinCredentials);
            }
        };

        // bcrypt runs outside every lock; admission is re-validated after.
        if !via_invite {
            if payload.password.is_empty() {
                return Err(HubError::PasswordRequired);
            }
            let hash = resolved.password_hash.clone();
            let password = payload.password.clone();
            let ok = tokio::task::spawn_blocking(move || bcrypt::verify(password, &hash))
                .await
                .map_err(|e| HubError::Internal(format!("verify task: {e}")))?
                .map_err(|e| HubError::Internal(format!("verify password: {e}")))?;
            if !ok {
                return Err(HubError::PasswordWrong);
            }
        }

        if resolved.is_sub() {
            return Err(HubError::CannotJoinSubDirectly);
        }

        let session_token = Uuid::new_v4().to_string();
        {
            let mut st = self.state_mut();
            if !st.rooms.contains_key(&resolved.id) {
                return Err(HubError::ChannelNotFound);
            }
            if resolved.occupancy() >= self.inner.max_users_per_room {
                return Err(HubError::ChannelFull);
            }
            if is_name_taken(&resolved, &payload.username) {
                return Err(HubError::NameTaken);
            }

            {
                let mut ps = peer.state_mut();
                ps.name = payload.username.clone();
                ps.room_id = Some(resolved.id);
                ps.main_room_id = Some(resolved.id);
                ps.session_token = Some(session_token.clone());
                ps.session_created_at = Some(Instant::now());
            }
            resolved.state_mut().add_peer(peer.clone());
            st.session_map.insert(session_token.clone(), peer.clone());
        }

        info!(peer = %peer.id, name = %payload.username, room = %resolved.full_name, "peer joined");
        Ok(JoinOutcome {
            room: resolved,
            session_token,
            peer: peer.clone(),
            reconnected: false,
            writer_generation: peer.writer_generation(),
        })
    }

    /// Re-bind an existing peer identity to a new transport. No admission
    /// checks re-run and no new session token is issued.
    fn try_session_reconnect(&self, token: &str, peer: &Arc<Peer>) -> Option<JoinOutcome> {
        let mut st = self.state_mut();
        let existing = st.session_map.get(token)?.clone();

        let expired = existing
            .state()
            .session_created_at
            .map_or(true, |t| t.elapsed() > SESSION_MAX_AGE);
        if expired {
            st.session_map.remove(token);
            return None;
        }

        let (room_id, main_room_id) = {
            let ps = existing.state();
            (ps.room_id, ps.main_room_id)
        };
        let main = main_room_id.and_then(|id| st.rooms.get(&id).cloned())?;
        let current = match room_id? {
            rid if rid == main.id => main.clone(),
            rid => main
                .state()
                .sub_channels
                .get(&rid)
                .cloned()
                .unwrap_or_else(|| main.clone()),
        };

        let generation = existing.set_writer(peer.writer());
        existing.state_mut().room_id = Some(current.id);
        {
            let mut rs = current.state_mut();
            if !rs.peers.contains_key(&existing.id) {
                rs.add_peer(existing.clone());
            }
        }

        info!(peer = %existing.id, "peer reconnected via session token");
        Some(JoinOutcome {
            room: main,
            session_token: token.to_owned(),
            peer: existing,
            reconnected: true,
            writer_generation: generation,
        })
    }

    /// Removal driven by a transport close retains the session entry (and the
    /// peer's remembered room ids) so a reconnect can re-bind; an explicit
    /// leave drops the session immediately.
    pub async fn remove_peer(&self, peer: &Arc<Peer>, retain_session: bool) {
        let (room_id, main_room_id, session_token) = {
            let ps = peer.state();
            (ps.room_id, ps.main_room_id, ps.session_token.clone())
        };

        let Some(room_id) = room_id else {
            if !retain_session {
                if let Some(token) = session_token {
                    self.state_mut().session_map.remove(&token);
                }
            }
            return;
        };

        let (room, main_room) = {
            let mut st = self.state_mut();
            if !retain_session {
                if let Some(token) = &session_token {
                    st.session_map.remove(token);
                }
            }
            let main = main_room_id.and_then(|id| st.rooms.get(&id).cloned());
            let room = match st.rooms.get(&room_id) {
                Some(r) => Some(r.clone()),
                None => main
                    .as_ref()
                    .and_then(|m| m.state().sub_channels.get(&room_id).cloned()),
            };
            (room, main)
        };

        let Some(room) = room else {
            let mut ps = peer.state_mut();
            ps.room_id = None;
            ps.main_room_id = None;
            return;
        };

        room.state_mut().remove_peer(&peer.id);

        rtc::remove_track_from_peers(peer, &room).await;
        rtc::close_peer_connection(peer).await;

        if room.is_sub() {
            self.arm_sub_countdown(&room);
            if let Some(main) = &main_room {
                if room.state().peers.is_empty() {
                    main.state_mut().sub_channels.remove(&room.id);
                }
            }
        }
        if let Some(main) = &main_room {
            self.broadcast_room_update(main);
        }

        if !retain_session {
            let mut ps = peer.state_mut();
            ps.room_id = None;
            ps.main_room_id = None;
        }

        info!(peer = %peer.id, room = %room_id, retained = retain_session, "peer removed");
    }

    /// Cleanup entry point for a closing connection. A reconnect bumps the
    /// peer's writer generation, so a stale connection's cleanup must not
    /// evict the re-bound peer.
    pub async fn remove_peer_if_current(&self, peer: &Arc<Peer>, generation: u64) {
        if peer.writer_generation() != generation {
            debug!(peer = %peer.id, "stale connection cleanup skipped");
            return;
        }
        self.remove_peer(peer, true).await;
    }

    /// Relay opaque ciphertext to the peer's current channel (main or sub)
    /// and append it to that channel's history ring.
    pub fn handle_chat(&self, peer: &Arc<Peer>, ciphertext: String) {
        let (room_id, name) = {
            let ps = peer.state();
            (ps.room_id, ps.name.clone())
        };
        let Some(room_id) = room_id else { return };

        let room = {
            let st = self.state();
            match st.rooms.get(&room_id) {
                Some(r) => Some(r.clone()),
                None => st
                    .rooms
                    .values()
                    .find_map(|r| r.state().sub_channels.get(&room_id).cloned()),
            }
        };
        let Some(room) = room else { return };

        let msg = ChatMessage {
            id: Uuid::new_v4().to_string(),
            user_id: peer.id,
            user_name: name,
            ciphertext,
            timestamp: unix_millis(),
        };
        let out = msg.to_out(Some(room_id));
        room.state_mut().push_chat(msg, self.inner.chat_history_size);
        room.broadcast_to_channel("chat", &out, None);
    }

    pub fn handle_mute(&self, peer: &Arc<Peer>, muted: bool) {
        let main_id = {
            let mut ps = peer.state_mut();
            ps.muted = muted;
            ps.main_room_id
        };
        let Some(main_id) = main_id else { return };
        if let Some(main) = self.main_room(main_id) {
            self.broadcast_room_update(&main);
        }
    }

    /// State delta for everyone reachable from the main room. The snapshot is
    /// taken under the room lock; sends happen afterwards.
    pub fn broadcast_room_update(&self, main: &Arc<Room>) {
        let (users, sub_channels, peers) = main.update_snapshot();
        let update = RoomUpdatePayload {
            users,
            sub_channels,
        };
        for peer in peers {
            peer.send_json("room-update", &update);
        }
    }

    pub fn send_chat_history(&self, peer: &Arc<Peer>, room: &Arc<Room>) {
        peer.send_json(
            "chat-history",
            &ChatHistoryPayload {
                channel_id: room.id,
                messages: room.chat_history_out(),
            },
        );
    }

    pub fn build_welcome(
        &self,
        peer: &Arc<Peer>,
        room: &Arc<Room>,
        session_token: &str,
    ) -> WelcomePayload {
        let (users, sub_channels, _) = room.update_snapshot();
        let chat_history = room.chat_history_out();
        let current_channel_id = peer.state().room_id.unwrap_or(room.id);
        WelcomePayload {
            user_id: peer.id,
            session_token: session_token.to_owned(),
            invite_token: room.invite_token.clone().unwrap_or_default(),
            room_state: RoomStatePayload {
                id: room.id,
                name: room.name.clone(),
                full_name: room.full_name.clone(),
                current_channel_id,
                users,
                sub_channels,
                chat_history,
            },
        }
    }

    /// Swap in a rebuilt media API (public-IP change) and, when asked,
    /// rebuild every live peer connection best-effort.
    pub async fn apply_rtc_config(&self, cfg: RtcConfig, rebuild_peers: bool) {
        if let Err(e) = self.inner.engine.replace(cfg) {
            warn!(error = %e, "failed to rebuild WebRTC API");
            return;
        }
        if !rebuild_peers {
            return;
        }

        let mut targets: Vec<(Arc<Peer>, Arc<Room>)> = Vec::new();
        for main in self.main_rooms() {
            for peer in main.member_peers() {
                if peer.state().pc.is_some() {
                    targets.push((peer, main.clone()));
                }
            }
            let subs: Vec<Arc<Room>> = main.state().sub_channels.values().cloned().collect();
            for sub in subs {
                for peer in sub.member_peers() {
                    if peer.state().pc.is_some() {
                        targets.push((peer, sub.clone()));
                    }
                }
            }
        }
        if targets.is_empty() {
            return;
        }

        info!(count = targets.len(), "rebuilding peer connections for updated WebRTC config");
        for (peer, room) in targets {
            rtc::rebuild_peer_connection(&self.inner.engine, &peer, &room).await;
        }
    }
}

/// A username collides when any peer in the main room or any of its
/// sub-channels already carries it.
pub(crate) fn is_name_taken(main: &Arc<Room>, username: &str) -> bool {
    let st = main.state();
    if st.peers.values().any(|p| p.state().name == username) {
        return true;
    }
    st.sub_channels
        .values()
        .any(|sub| sub.state().peers.values().any(|p| p.state().name == username))
}
