use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use parley_core::{ChatMessageOut, PeerId, RoomId, SubChannelInfo, UserInfo};
use serde::Serialize;

use crate::peer::Peer;

pub fn unix_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

#[derive(Debug, Clone)]
pub struct ChatMessage {
    pub id: String,
    pub user_id: PeerId,
    pub user_name: String,
    pub ciphertext: String,
    pub timestamp: i64,
}

impl ChatMessage {
    pub fn to_out(&self, channel_id: Option<RoomId>) -> ChatMessageOut {
        ChatMessageOut {
            id: self.id.clone(),
            user_id: self.user_id,
            user_name: self.user_name.clone(),
            ciphertext: self.ciphertext.clone(),
            timestamp: self.timestamp,
            channel_id,
        }
    }
}

/// Mutable room state behind the room's read-write lock.
#[derive(Debug)]
pub struct RoomState {
    pub peers: HashMap<PeerId, Arc<Peer>>,
    /// Always empty for sub-channels (depth is capped at 1).
    pub sub_channels: HashMap<RoomId, Arc<Room>>,
    pub chat_history: VecDeque<ChatMessage>,
    /// Set when the last peer leaves; cleared on the next join.
    pub expiry: Option<Instant>,
    /// Unix millis when a 1-occupant sub-channel collapses; 0 when inactive.
    pub countdown_expires_at: i64,
}

impl RoomState {
    pub fn add_peer(&mut self, peer: Arc<Peer>) {
        self.peers.insert(peer.id, peer);
        self.expiry = None;
    }

    pub fn remove_peer(&mut self, id: &PeerId) {
        self.peers.remove(id);
        if self.peers.is_empty() {
            self.expiry = Some(Instant::now());
        }
    }

    pub fn push_chat(&mut self, msg: ChatMessage, cap: usize) {
        self.chat_history.push_back(msg);
        while self.chat_history.len() > cap {
            self.chat_history.pop_front();
        }
    }
}

#[derive(Debug)]
pub struct Room {
    pub id: RoomId,
    pub name: String,
    /// `name#NNNN` for main rooms; sub-channels carry the parent's full name.
    pub full_name: String,
    /// Main rooms only; sub-channels are reachable through their parent.
    pub invite_token: Option<String>,
    pub parent_id: Option<RoomId>,
    pub password_hash: String,
    pub created_at: Instant,
    state: RwLock<RoomState>,
}

impl Room {
    pub fn new_main(
        id: RoomId,
        name: String,
        full_name: String,
        invite_token: String,
        password_hash: String,
    ) -> Arc<Self> {
        Arc::new(Self {
            id,
            name,
            full_name,
            invite_token: Some(invite_token),
            parent_id: None,
            password_hash,
            created_at: Instant::now(),
            state: RwLock::new(RoomState {
                peers: HashMap::new(),
                sub_channels: HashMap::new(),
                chat_history: VecDeque::new(),
                expiry: None,
                countdown_expires_at: 0,
            }),
        })
    }

    /// Sub-channels inherit the parent's password hash and full name.
    pub fn new_sub(id: RoomId, name: String, parent: &Room) -> Arc<Self> {
        Arc::new(Self {
            id,
            name,
            full_name: parent.full_name.clone(),
            invite_token: None,
            parent_id: Some(parent.id),
            password_hash: parent.password_hash.clone(),
            created_at: Instant::now(),
            state: RwLock::new(RoomState {
                peers: HashMap::new(),
                sub_channels: HashMap::new(),
                chat_history: VecDeque::new(),
                expiry: None,
                countdown_expires_at: 0,
            }),
        })
    }

    pub fn is_sub(&self) -> bool {
        self.parent_id.is_some()
    }

    pub fn state(&self) -> RwLockReadGuard<'_, RoomState> {
        self.state.read().unwrap()
    }

    pub fn state_mut(&self) -> RwLockWriteGuard<'_, RoomState> {
        self.state.write().unwrap()
    }

    /// Peers of this channel only (not sub-channels).
    pub fn member_peers(&self) -> Vec<Arc<Peer>> {
        self.state().peers.values().cloned().collect()
    }

    /// Total occupancy across this room and its sub-channels.
    pub fn occupancy(&self) -> usize {
        let st = self.state();
        st.peers.len()
            + st.sub_channels
                .values()
                .map(|sub| sub.state().peers.len())
                .sum::<usize>()
    }

    /// Consistent snapshot for a room-update fan-out: user list (sub-channel
    /// occupants tagged), sub-channel infos, and every reachable peer. Sends
    /// happen after the lock is released.
    pub fn update_snapshot(&self) -> (Vec<UserInfo>, Vec<SubChannelInfo>, Vec<Arc<Peer>>) {
        let st = self.state();

        let mut users = Vec::with_capacity(st.peers.len());
        let mut all_peers: Vec<Arc<Peer>> = st.peers.values().cloned().collect();
        for peer in st.peers.values() {
            users.push(user_info(peer, None));
        }

        let mut subs = Vec::with_capacity(st.sub_channels.len());
        for sub in st.sub_channels.values() {
            let sub_st = sub.state();
            let mut sub_users = Vec::with_capacity(sub_st.peers.len());
            for peer in sub_st.peers.values() {
                users.push(user_info(peer, Some(sub.id)));
                sub_users.push(user_info(peer, None));
                all_peers.push(peer.clone());
            }
            subs.push(SubChannelInfo {
                id: sub.id,
                name: sub.name.clone(),
                users: sub_users,
                expires_at: (sub_st.countdown_expires_at != 0)
                    .then_some(sub_st.countdown_expires_at),
            });
        }

        (users, subs, all_peers)
    }

    pub fn chat_history_out(&self) -> Vec<ChatMessageOut> {
        self.state()
            .chat_history
            .iter()
            .map(|m| m.to_out(None))
            .collect()
    }

    /// Send to every member of this channel (main or sub), minus an optional
    /// exclusion. Snapshot first, send outside the lock.
    pub fn broadcast_to_channel<T: Serialize>(
        &self,
        kind: &str,
        payload: &T,
        exclude: Option<PeerId>,
    ) {
        let peers: Vec<Arc<Peer>> = self
            .state()
            .peers
            .values()
            .filter(|p| Some(p.id) != exclude)
            .cloned()
            .collect();
        for peer in peers {
            peer.send_json(kind, payload);
        }
    }
}

fn user_info(peer: &Arc<Peer>, in_sub_channel: Option<RoomId>) -> UserInfo {
    let st = peer.state();
    UserInfo {
        id: peer.id,
        name: st.name.clone(),
        muted: st.muted,
        in_sub_channel,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    fn named_peer(name: &str) -> Arc<Peer> {
        let (tx, _rx) = mpsc::unbounded_channel();
        let peer = Peer::new(PeerId::new(), tx);
        peer.state_mut().name = name.to_owned();
        peer
    }

    fn chat(n: u32) -> ChatMessage {
        ChatMessage {
            id: n.to_string(),
            user_id: PeerId::new(),
            user_name: "a".into(),
            ciphertext: format!("msg-{n}"),
            timestamp: n as i64,
        }
    }

    #[test]
    fn chat_ring_truncates_oldest() {
        let room = Room::new_main(
            RoomId::new(),
            "Lobby".into(),
            "Lobby#0001".into(),
            "tok".into(),
            "hash".into(),
        );
        let mut st = room.state_mut();
        for n in 0..25 {
            st.push_chat(chat(n), 10);
        }
        assert_eq!(st.chat_history.len(), 10);
        assert_eq!(st.chat_history.front().unwrap().id, "15");
        assert_eq!(st.chat_history.back().unwrap().id, "24");
    }

    #[test]
    fn expiry_is_set_on_empty_and_cleared_on_join() {
        let room = Room::new_main(
            RoomId::new(),
            "Lobby".into(),
            "Lobby#0001".into(),
            "tok".into(),
            "hash".into(),
        );
        let peer = named_peer("a");
        let mut st = room.state_mut();
        st.add_peer(peer.clone());
        assert!(st.expiry.is_none());
        st.remove_peer(&peer.id);
        assert!(st.expiry.is_some());
        st.add_peer(peer);
        assert!(st.expiry.is_none());
    }

    #[test]
    fn update_snapshot_tags_sub_channel_occupants() {
        let main = Room::new_main(
            RoomId::new(),
            "Lobby".into(),
            "Lobby#0001".into(),
            "tok".into(),
            "hash".into(),
        );
        let sub = Room::new_sub(RoomId::new(), "war-room".into(), &main);
        assert_eq!(sub.password_hash, main.password_hash);
        assert_eq!(sub.full_name, main.full_name);

        let a = named_peer("a");
        let b = named_peer("b");
        main.state_mut().add_peer(a.clone());
        sub.state_mut().add_peer(b.clone());
        sub.state_mut().countdown_expires_at = 12345;
        main.state_mut().sub_channels.insert(sub.id, sub.clone());

        let (users, subs, all) = main.update_snapshot();
        assert_eq!(users.len(), 2);
        assert_eq!(all.len(), 2);
        let b_info = users.iter().find(|u| u.id == b.id).unwrap();
        assert_eq!(b_info.in_sub_channel, Some(sub.id));
        let a_info = users.iter().find(|u| u.id == a.id).unwrap();
        assert_eq!(a_info.in_sub_channel, None);
        assert_eq!(subs.len(), 1);
        assert_eq!(subs[0].expires_at, Some(12345));
    }
}
