use std::sync::Arc;
use std::time::Instant;

use parley_core::{
    ErrorCode, InviteExpiredPayload, InviteExpiredReason, InviteReqPayload, PeerId, RoomId,
};
use tokio::task::AbortHandle;
use tracing::{info, warn};
use uuid::Uuid;

use crate::hub::{Hub, INVITE_TIMEOUT, SUB_COUNTDOWN};
use crate::peer::Peer;
use crate::room::{unix_millis, Room};
use crate::rtc;

/// An outstanding sub-channel invite. Destroyed on accept, decline, or the
/// 30-second timer, whichever fires first.
pub struct PendingInvite {
    pub id: String,
    pub from: Arc<Peer>,
    pub to: Arc<Peer>,
    pub main_room: Arc<Room>,
    pub channel_name: String,
    pub created_at: Instant,
    pub timer: AbortHandle,
}

impl Hub {
    pub fn handle_sub_invite(&self, from: &Arc<Peer>, target_user_id: PeerId, channel_name: String) {
        let (from_room, from_main) = {
            let ps = from.state();
            (ps.room_id, ps.main_room_id)
        };
        if from_room != from_main {
            from.send_error(ErrorCode::AlreadyInSub, "You are already in a sub-channel");
            return;
        }
        let Some(main) = from_main.and_then(|id| self.main_room(id)) else {
            from.send_error(ErrorCode::InternalError, "Room not found");
            return;
        };

        let target = main.state().peers.get(&target_user_id).cloned();
        let Some(target) = target else {
            from.send_error(ErrorCode::ChannelNotFound, "User not found in main channel");
            return;
        };
        {
            let ps = target.state();
            if ps.room_id != ps.main_room_id {
                from.send_error(
                    ErrorCode::AlreadyInSub,
                    "Target user is already in a sub-channel",
                );
                return;
            }
        }

        let invite_id = Uuid::new_v4().to_string();
        let channel_name = if channel_name.is_empty() {
            "Private".to_owned()
        } else {
            channel_name
        };

        let timer = {
            let hub = self.clone();
            let invite_id = invite_id.clone();
            tokio::spawn(async move {
                tokio::time::sleep(INVITE_TIMEOUT).await;
                hub.expire_invite(&invite_id);
            })
            .abort_handle()
        };

        let invite = PendingInvite {
            id: invite_id.clone(),
            from: from.clone(),
            to: target.clone(),
            main_room: main,
            channel_name: channel_name.clone(),
            created_at: Instant::now(),
            timer,
        };
        self.state_mut().pending_invites.insert(invite_id.clone(), invite);

        let from_name = from.state().name.clone();
        target.send_json(
            "invite-req",
            &InviteReqPayload {
                invite_id,
                from_user_id: from.id,
                from_name,
                channel_name,
            },
        );
    }

    /// Timer entry point: if the invite is still pending, both parties learn
    /// it timed out.
    pub fn expire_invite(&self, invite_id: &str) {
        let invite = self.state_mut().pending_invites.remove(invite_id);
        let Some(invite) = invite else { return };
        let payload = InviteExpiredPayload {
            invite_id: invite_id.to_owned(),
            reason: InviteExpiredReason::Timeout,
        };
        invite.from.send_json("invite-expired", &payload);
        invite.to.send_json("invite-expired", &payload);
    }

    pub async fn handle_sub_response(&self, peer: &Arc<Peer>, invite_id: &str, accepted: bool) {
        let invite = {
            let mut st = self.state_mut();
            let invite = st.pending_invites.remove(invite_id);
            if let Some(invite) = &invite {
                invite.timer.abort();
            }
            invite
        };
        let Some(invite) = invite else {
            peer.send_error(
                ErrorCode::InviteExpired,
                "Invite has expired or was not found",
            );
            return;
        };

        if !accepted {
            invite.from.send_json(
                "invite-expired",
                &InviteExpiredPayload {
                    invite_id: invite_id.to_owned(),
                    reason: InviteExpiredReason::Declined,
                },
            );
            return;
        }

        let main = invite.main_room.clone();
        let sub = Room::new_sub(RoomId::new(), invite.channel_name.clone(), &main);

        // Tracks are saved first; a closed connection can't be queried.
        let from_track = invite.from.state().track.clone();
        let to_track = invite.to.state().track.clone();

        // Close both movers' connections before mutating membership so they
        // don't receive spurious renegotiation offers for connections that
        // are about to be replaced.
        rtc::close_peer_connection(&invite.from).await;
        rtc::close_peer_connection(&invite.to).await;

        if let Some(track) = &from_track {
            rtc::remove_track_from_room_peers(track, &main).await;
        }
        if let Some(track) = &to_track {
            rtc::remove_track_from_room_peers(track, &main).await;
        }

        {
            let mut ms = main.state_mut();
            ms.remove_peer(&invite.from.id);
            ms.remove_peer(&invite.to.id);
            ms.sub_channels.insert(sub.id, sub.clone());
        }
        {
            let mut ss = sub.state_mut();
            invite.from.state_mut().room_id = Some(sub.id);
            ss.add_peer(invite.from.clone());
            invite.to.state_mut().room_id = Some(sub.id);
            ss.add_peer(invite.to.clone());
        }
        info!(sub = %sub.id, room = %main.full_name, "sub-channel created");

        for mover in [&invite.from, &invite.to] {
            if let Err(e) = rtc::create_peer_connection(self.engine(), mover).await {
                warn!(peer = %mover.id, error = %e, "failed to create media connection in sub-channel");
                continue;
            }
            rtc::add_track_to_peers(mover, &sub).await;
            if let Err(e) = rtc::send_offer(mover, &sub).await {
                warn!(peer = %mover.id, error = %e, "failed to send offer in sub-channel");
            }
        }

        self.broadcast_room_update(&main);
    }

    pub async fn handle_move_to_main(&self, peer: &Arc<Peer>) {
        let (room_id, main_id) = {
            let ps = peer.state();
            (ps.room_id, ps.main_room_id)
        };
        let (Some(room_id), Some(main_id)) = (room_id, main_id) else {
            return;
        };
        if room_id == main_id {
            return;
        }
        let Some(main) = self.main_room(main_id) else {
            return;
        };
        let sub = main.state().sub_channels.get(&room_id).cloned();

        if let Some(sub) = &sub {
            rtc::remove_track_from_peers(peer, sub).await;
        }
        rtc::close_peer_connection(peer).await;

        {
            let mut ms = main.state_mut();
            if let Some(sub) = &sub {
                sub.state_mut().remove_peer(&peer.id);
            }
            peer.state_mut().room_id = Some(main_id);
            ms.add_peer(peer.clone());
        }

        if let Some(sub) = &sub {
            self.arm_sub_countdown(sub);
            let mut ms = main.state_mut();
            if sub.state().peers.is_empty() {
                ms.sub_channels.remove(&sub.id);
            }
        }

        match rtc::create_peer_connection(self.engine(), peer).await {
            Ok(()) => {
                rtc::add_track_to_peers(peer, &main).await;
                if let Err(e) = rtc::send_offer(peer, &main).await {
                    warn!(peer = %peer.id, error = %e, "failed to send offer moving to main");
                }
            }
            Err(e) => {
                warn!(peer = %peer.id, error = %e, "failed to create media connection moving to main");
            }
        }

        self.send_chat_history(peer, &main);
        self.broadcast_room_update(&main);
    }

    pub async fn handle_move_to_sub(&self, peer: &Arc<Peer>, target_sub_id: RoomId) {
        let (room_id, main_id) = {
            let ps = peer.state();
            (ps.room_id, ps.main_room_id)
        };
        let (Some(room_id), Some(main_id)) = (room_id, main_id) else {
            peer.send_error(ErrorCode::ChannelNotFound, "Room not found");
            return;
        };
        if room_id == target_sub_id {
            return;
        }
        let Some(main) = self.main_room(main_id) else {
            peer.send_error(ErrorCode::ChannelNotFound, "Room not found");
            return;
        };
        let target_sub = main.state().sub_channels.get(&target_sub_id).cloned();
        let Some(target_sub) = target_sub else {
            peer.send_error(ErrorCode::ChannelNotFound, "Sub-channel not found");
            return;
        };

        let current_sub = if room_id == main_id {
            None
        } else {
            main.state().sub_channels.get(&room_id).cloned()
        };
        if room_id == main_id {
            rtc::remove_track_from_peers(peer, &main).await;
        } else if let Some(current) = &current_sub {
            rtc::remove_track_from_peers(peer, current).await;
        }
        rtc::close_peer_connection(peer).await;

        {
            let mut ms = main.state_mut();
            if room_id == main_id {
                ms.remove_peer(&peer.id);
            } else if let Some(current) = ms.sub_channels.get(&room_id).cloned() {
                current.state_mut().remove_peer(&peer.id);
            }
        }

        if room_id != main_id {
            let old_sub = main.state().sub_channels.get(&room_id).cloned();
            if let Some(old_sub) = old_sub {
                self.arm_sub_countdown(&old_sub);
                let mut ms = main.state_mut();
                if old_sub.state().peers.is_empty() {
                    ms.sub_channels.remove(&room_id);
                }
            }
        }

        peer.state_mut().room_id = Some(target_sub_id);
        target_sub.state_mut().add_peer(peer.clone());

        self.arm_sub_countdown(&target_sub);

        match rtc::create_peer_connection(self.engine(), peer).await {
            Ok(()) => {
                rtc::add_track_to_peers(peer, &target_sub).await;
                if let Err(e) = rtc::send_offer(peer, &target_sub).await {
                    warn!(peer = %peer.id, error = %e, "failed to send offer moving to sub");
                }
            }
            Err(e) => {
                warn!(peer = %peer.id, error = %e, "failed to create media connection moving to sub");
            }
        }

        self.send_chat_history(peer, &target_sub);
        self.broadcast_room_update(&main);
    }

    /// A sub-channel with exactly one occupant gets a 5-minute grace period,
    /// published to clients through the sub-channel info so UIs can render a
    /// progress bar. The count check at fire time implicitly cancels it.
    pub fn arm_sub_countdown(&self, sub: &Arc<Room>) {
        let mut ss = sub.state_mut();
        let count = ss.peers.len();
        if count == 1 {
            if ss.countdown_expires_at == 0 {
                ss.countdown_expires_at = unix_millis() + SUB_COUNTDOWN.as_millis() as i64;
                ss.expiry = Some(Instant::now());

                let hub = self.clone();
                let sub_id = sub.id;
                tokio::spawn(async move {
                    tokio::time::sleep(SUB_COUNTDOWN).await;
                    hub.collapse_expired_sub(sub_id).await;
                });
            }
        } else {
            ss.countdown_expires_at = 0;
            if count >= 2 {
                ss.expiry = None;
            }
        }
    }

    /// Countdown-timer entry point.
    pub async fn collapse_expired_sub(&self, sub_id: RoomId) {
        let found = {
            let st = self.state();
            st.rooms.values().find_map(|main| {
                main.state()
                    .sub_channels
                    .get(&sub_id)
                    .cloned()
                    .map(|sub| (main.clone(), sub))
            })
        };
        let Some((main, sub)) = found else { return };

        let occupants = sub.member_peers();
        match occupants.len() {
            n if n > 1 => {} // more peers joined; the countdown was cancelled
            1 => self.handle_move_to_main(&occupants[0]).await,
            _ => {
                main.state_mut().sub_channels.remove(&sub_id);
                self.broadcast_room_update(&main);
            }
        }
    }
}
