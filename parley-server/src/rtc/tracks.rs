use std::sync::Arc;

use anyhow::Result;
use parley_core::PeerId;
use tracing::{debug, warn};
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_transceiver_direction::RTCRtpTransceiverDirection;
use webrtc::rtp_transceiver::RTCRtpTransceiverInit;
use webrtc::track::track_local::track_local_static_rtp::TrackLocalStaticRTP;
use webrtc::track::track_local::TrackLocal;

use crate::peer::Peer;
use crate::room::Room;
use crate::rtc::connection::{create_peer_connection, spawn_rtcp_drain};
use crate::rtc::engine::RtcEngine;
use crate::rtc::negotiate::negotiate_offer;

/// Initial offer round for a peer that just got a fresh media connection:
/// negotiate the recv-only transceiver first, then attach every other
/// participant's track and, if any were added, run a follow-up round (the
/// deferred-renegotiation loop collapses adjacent rounds).
pub async fn send_offer(peer: &Arc<Peer>, room: &Arc<Room>) -> Result<()> {
    negotiate_offer(peer.clone(), true).await?;
    if add_room_tracks_to_peer(peer, room).await {
        negotiate_offer(peer.clone(), false).await?;
    }
    Ok(())
}

/// Attach `new_peer`'s inbound track as an outbound sender on every other
/// participant of the room, then renegotiate each affected participant.
pub async fn add_track_to_peers(new_peer: &Arc<Peer>, room: &Arc<Room>) {
    let track = new_peer.state().track.clone();
    let Some(track) = track else { return };

    let others: Vec<Arc<Peer>> = room
        .member_peers()
        .into_iter()
        .filter(|p| p.id != new_peer.id)
        .collect();

    let mut needs_renego = Vec::with_capacity(others.len());
    for other in others {
        let pc = other.state().pc.clone();
        let Some(pc) = pc else { continue };
        if has_sender_for_track(&pc, track.id()).await {
            continue;
        }
        match attach_sendonly_track(&pc, &track).await {
            Ok(()) => {
                debug!(to = %other.id, from = %new_peer.id, "attached outbound track");
                needs_renego.push(other);
            }
            Err(e) => {
                warn!(to = %other.id, from = %new_peer.id, error = %e, "failed to attach track");
            }
        }
    }

    spawn_renegotiations(needs_renego);
}

/// Ensure `target` has a sender for every other participant's track. Only
/// mutates transceivers; the caller decides whether to renegotiate. Returns
/// whether anything was added.
pub async fn add_room_tracks_to_peer(target: &Arc<Peer>, room: &Arc<Room>) -> bool {
    let pc = target.state().pc.clone();
    let Some(pc) = pc else { return false };

    let others: Vec<Arc<Peer>> = room
        .member_peers()
        .into_iter()
        .filter(|p| p.id != target.id)
        .collect();

    let mut added_any = false;
    for other in others {
        let track = other.state().track.clone();
        let Some(track) = track else { continue };
        if has_sender_for_track(&pc, track.id()).await {
            continue;
        }
        match attach_sendonly_track(&pc, &track).await {
            Ok(()) => {
                debug!(to = %target.id, from = %other.id, "attached existing track");
                added_any = true;
            }
            Err(e) => {
                warn!(to = %target.id, from = %other.id, error = %e, "failed to attach track");
            }
        }
    }
    added_any
}

/// Detach the leaving peer's track from every other participant in the room
/// and renegotiate the affected ones.
pub async fn remove_track_from_peers(leaving: &Arc<Peer>, room: &Arc<Room>) {
    let track_id = match leaving.state().track.as_ref() {
        Some(track) => track.id().to_owned(),
        None => return,
    };
    detach_track_from_room(&track_id, room, Some(leaving.id)).await;
}

/// Variant for when the track owner's media connection is already closed
/// (sub-channel transitions), so the track must be passed explicitly.
pub async fn remove_track_from_room_peers(track: &Arc<TrackLocalStaticRTP>, room: &Arc<Room>) {
    detach_track_from_room(track.id(), room, None).await;
}

async fn detach_track_from_room(track_id: &str, room: &Arc<Room>, exclude: Option<PeerId>) {
    let peers: Vec<Arc<Peer>> = room
        .member_peers()
        .into_iter()
        .filter(|p| Some(p.id) != exclude)
        .collect();

    let mut needs_renego = Vec::with_capacity(peers.len());
    for peer in peers {
        let pc = peer.state().pc.clone();
        let Some(pc) = pc else { continue };

        let mut removed = false;
        for sender in pc.get_senders().await {
            let matches = match sender.track().await {
                Some(t) => t.id() == track_id,
                None => false,
            };
            if !matches {
                continue;
            }
            if let Err(e) = pc.remove_track(&sender).await {
                warn!(peer = %peer.id, error = %e, "failed to remove track");
                continue;
            }
            removed = true;
        }
        if removed {
            needs_renego.push(peer);
        }
    }

    spawn_renegotiations(needs_renego);
}

/// Rebuild one peer's media connection in place (public-IP change): detach
/// its track everywhere, recreate the connection, re-attach both directions
/// and run a fresh initial offer round.
pub async fn rebuild_peer_connection(engine: &RtcEngine, peer: &Arc<Peer>, room: &Arc<Room>) {
    if !room.state().peers.contains_key(&peer.id) {
        return;
    }

    remove_track_from_peers(peer, room).await;
    crate::rtc::connection::close_peer_connection(peer).await;

    if let Err(e) = create_peer_connection(engine, peer).await {
        warn!(peer = %peer.id, error = %e, "failed to rebuild media connection");
        return;
    }

    add_track_to_peers(peer, room).await;

    let peer = peer.clone();
    let room = room.clone();
    tokio::spawn(async move {
        if let Err(e) = send_offer(&peer, &room).await {
            warn!(peer = %peer.id, error = %e, "failed to send rebuilt offer");
        }
    });
}

async fn attach_sendonly_track(
    pc: &Arc<RTCPeerConnection>,
    track: &Arc<TrackLocalStaticRTP>,
) -> Result<()> {
    let transceiver = pc
        .add_transceiver_from_track(
            track.clone() as Arc<dyn TrackLocal + Send + Sync>,
            Some(RTCRtpTransceiverInit {
                direction: RTCRtpTransceiverDirection::Sendonly,
                send_encodings: vec![],
            }),
        )
        .await?;
    spawn_rtcp_drain(transceiver.sender().await);
    Ok(())
}

async fn has_sender_for_track(pc: &Arc<RTCPeerConnection>, track_id: &str) -> bool {
    for sender in pc.get_senders().await {
        if let Some(track) = sender.track().await {
            if track.id() == track_id {
                return true;
            }
        }
    }
    false
}

fn spawn_renegotiations(peers: Vec<Arc<Peer>>) {
    for peer in peers {
        tokio::spawn(async move {
            if let Err(e) = negotiate_offer(peer.clone(), false).await {
                warn!(peer = %peer.id, error = %e, "renegotiation failed");
            }
        });
    }
}
