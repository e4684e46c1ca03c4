use std::sync::Arc;
use std::time::{Duration, Instant};

use parley_core::RoomId;
use tracing::info;

use crate::hub::{
    Hub, EMPTY_ROOM_TTL, EMPTY_SUB_TTL, INVITE_MAX_AGE, ROOM_CREATE_WINDOW, SESSION_MAX_AGE,
};
use crate::peer::Peer;
use crate::room::Room;

const GC_INTERVAL: Duration = Duration::from_secs(60);

pub async fn run(hub: Hub) {
    let mut ticker = tokio::time::interval(GC_INTERVAL);
    ticker.tick().await; // the first tick completes immediately
    loop {
        ticker.tick().await;
        hub.gc_sweep();
    }
}

impl Hub {
    /// Periodic sweep: expired sessions and invites, stale per-IP create
    /// history, lingering sub-channels, and long-empty main rooms.
    pub fn gc_sweep(&self) {
        let now = Instant::now();
        let mut st = self.state_mut();

        st.session_map.retain(|_, peer| {
            peer.state()
                .session_created_at
                .is_some_and(|t| now.duration_since(t) <= SESSION_MAX_AGE)
        });

        st.invite_map
            .retain(|_, room| now.duration_since(room.created_at) <= INVITE_MAX_AGE);

        st.room_creates_per_ip.retain(|_, times| {
            times.retain(|t| now.duration_since(*t) < ROOM_CREATE_WINDOW);
            !times.is_empty()
        });

        let mut dead_rooms: Vec<Arc<Room>> = Vec::new();
        for room in st.rooms.values() {
            let mut rs = room.state_mut();

            let subs: Vec<Arc<Room>> = rs.sub_channels.values().cloned().collect();
            let mut dead_subs: Vec<RoomId> = Vec::new();
            let mut force_moved: Vec<Arc<Peer>> = Vec::new();
            for sub in subs {
                let mut ss = sub.state_mut();
                let expired = ss
                    .expiry
                    .is_some_and(|t| now.duration_since(t) > EMPTY_SUB_TTL);
                if !expired {
                    continue;
                }
                if ss.peers.is_empty() {
                    dead_subs.push(sub.id);
                    info!(sub = %sub.id, "GC: deleted empty sub-channel");
                } else if ss.peers.len() == 1 {
                    // Backstop only: the countdown timer is the path that
                    // rewires media. Membership moves back to the main room.
                    force_moved.extend(ss.peers.values().cloned());
                    ss.peers.clear();
                    dead_subs.push(sub.id);
                    info!(sub = %sub.id, "GC: force-moved last peer from sub-channel to main");
                }
            }
            for sub_id in dead_subs {
                rs.sub_channels.remove(&sub_id);
            }
            for peer in force_moved {
                peer.state_mut().room_id = Some(room.id);
                rs.add_peer(peer);
            }

            let occupancy = rs.peers.len()
                + rs.sub_channels
                    .values()
                    .map(|sub| sub.state().peers.len())
                    .sum::<usize>();
            let room_expired = rs
                .expiry
                .is_some_and(|t| now.duration_since(t) > EMPTY_ROOM_TTL);
            if occupancy == 0 && room_expired {
                dead_rooms.push(room.clone());
            }
        }

        for room in dead_rooms {
            st.rooms.remove(&room.id);
            st.rooms_by_name.remove(&room.full_name);
            if let Some(token) = &room.invite_token {
                st.invite_map.remove(token);
            }
            info!(room = %room.full_name, id = %room.id, "GC: deleted room");
        }
    }
}
