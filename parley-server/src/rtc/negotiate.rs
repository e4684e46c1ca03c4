use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use parley_core::{CandidatePayload, OfferPayload};
use tracing::{debug, info, warn};
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::peer_connection::offer_answer_options::RTCOfferOptions;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::signaling_state::RTCSignalingState;
use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;
use webrtc::rtp_transceiver::rtp_transceiver_direction::RTCRtpTransceiverDirection;
use webrtc::rtp_transceiver::RTCRtpTransceiverInit;

use crate::peer::Peer;

const ANSWER_TIMEOUT: Duration = Duration::from_secs(10);

/// Produce an offer for the peer under its negotiation mutex.
///
/// When the signaling state is not stable an in-flight exchange is still
/// running: mark the renegotiation pending and bail out, the answer path
/// re-enters this loop. After an answer arrives, a renegotiation that was
/// requested while we waited runs immediately, collapsing adjacent rounds.
pub async fn negotiate_offer(peer: Arc<Peer>, is_initial: bool) -> Result<()> {
    let mut add_recv_transceiver = is_initial;
    loop {
        let nego = peer.nego.lock().await;

        let (pc, epoch) = {
            let st = peer.state();
            (st.pc.clone(), st.epoch)
        };
        let Some(pc) = pc else {
            anyhow::bail!("no media connection");
        };

        if add_recv_transceiver {
            // Accept this peer's microphone on the first offer of the epoch.
            pc.add_transceiver_from_kind(
                RTPCodecType::Audio,
                Some(RTCRtpTransceiverInit {
                    direction: RTCRtpTransceiverDirection::Recvonly,
                    send_encodings: vec![],
                }),
            )
            .await
            .context("add recv transceiver")?;
            add_recv_transceiver = false;
        }

        if pc.signaling_state() != RTCSignalingState::Stable {
            debug!(
                peer = %peer.id,
                state = %pc.signaling_state(),
                "deferring renegotiation"
            );
            peer.state_mut().pending_renego = true;
            return Ok(());
        }

        let (seq, mut gate) = {
            let mut st = peer.state_mut();
            st.offer_seq += 1;
            st.pending_renego = false;
            let gate = st.arm_signal_gate();
            (st.offer_seq, gate)
        };

        let offer = pc.create_offer(None).await.context("create offer")?;
        pc.set_local_description(offer.clone())
            .await
            .context("set local description")?;

        debug!(peer = %peer.id, seq, epoch, initial = seq == 1, "offer sent");
        peer.send_json(
            "offer",
            &OfferPayload {
                sdp: offer.sdp,
                reset: seq == 1,
                seq,
                epoch,
            },
        );

        drop(nego);

        if tokio::time::timeout(ANSWER_TIMEOUT, gate.changed())
            .await
            .is_err()
        {
            warn!(peer = %peer.id, seq, epoch, "answer timeout");
            return Ok(());
        }

        let needs_renego = {
            let mut st = peer.state_mut();
            std::mem::take(&mut st.pending_renego)
        };
        if !needs_renego {
            return Ok(());
        }
        debug!(peer = %peer.id, "processing deferred renegotiation");
    }
}

/// Apply a client answer. Anything tagged for a previous epoch or a
/// non-current offer is discarded, never reordered.
pub async fn handle_answer(peer: &Arc<Peer>, sdp: String, seq: u64, epoch: u64) -> Result<()> {
    let pc = {
        let st = peer.state();
        let Some(pc) = st.pc.clone() else {
            anyhow::bail!("no media connection");
        };
        if epoch != st.epoch {
            debug!(peer = %peer.id, epoch, current = st.epoch, "discarding stale answer");
            return Ok(());
        }
        if seq != st.offer_seq {
            debug!(peer = %peer.id, seq, current = st.offer_seq, "discarding stale answer");
            return Ok(());
        }
        pc
    };

    let answer = RTCSessionDescription::answer(sdp)?;
    pc.set_remote_description(answer)
        .await
        .context("set remote description")?;

    let buffered = {
        let mut st = peer.state_mut();
        st.has_remote_description = true;
        st.fire_signal_gate();
        std::mem::take(&mut st.pending_candidates)
    };
    for candidate in buffered {
        if let Err(e) = pc.add_ice_candidate(candidate).await {
            warn!(peer = %peer.id, error = %e, "buffered candidate rejected");
        }
    }
    Ok(())
}

/// Apply a trickle candidate. Future-tagged candidates are discarded, late
/// ones for the current epoch are accepted, and candidates arriving before
/// the remote description are buffered until the answer lands.
pub async fn handle_ice_candidate(peer: &Arc<Peer>, payload: CandidatePayload) -> Result<()> {
    let init = RTCIceCandidateInit {
        candidate: payload.candidate,
        sdp_mid: payload.sdp_mid,
        sdp_mline_index: payload.sdp_m_line_index,
        ..Default::default()
    };

    let pc = {
        let mut st = peer.state_mut();
        let Some(pc) = st.pc.clone() else {
            anyhow::bail!("no media connection");
        };
        if payload.epoch != st.epoch {
            debug!(peer = %peer.id, epoch = payload.epoch, current = st.epoch, "discarding stale candidate");
            return Ok(());
        }
        if payload.seq > st.offer_seq {
            debug!(peer = %peer.id, seq = payload.seq, current = st.offer_seq, "discarding future candidate");
            return Ok(());
        }
        if payload.seq < st.offer_seq {
            debug!(peer = %peer.id, seq = payload.seq, current = st.offer_seq, "accepting late candidate");
        }
        if !st.has_remote_description {
            st.pending_candidates.push(init);
            return Ok(());
        }
        pc
    };

    pc.add_ice_candidate(init).await.context("add ice candidate")?;
    Ok(())
}

/// Schedule an ICE restart; at most one is queued per peer at any time.
pub fn queue_ice_restart(peer: &Arc<Peer>, delay: Duration) {
    {
        let mut st = peer.state_mut();
        if st.ice_restart_queued {
            return;
        }
        st.ice_restart_queued = true;
    }
    let peer = peer.clone();
    tokio::spawn(async move {
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        attempt_ice_restart(peer).await;
    });
}

async fn attempt_ice_restart(peer: Arc<Peer>) {
    let nego = peer.nego.lock().await;

    let pc = peer.state().pc.clone();
    let Some(pc) = pc else {
        peer.state_mut().ice_restart_queued = false;
        return;
    };

    let state = pc.connection_state();
    if state == RTCPeerConnectionState::Connected || state == RTCPeerConnectionState::Closed {
        // Recovered (or torn down) while the restart was queued.
        peer.state_mut().ice_restart_queued = false;
        return;
    }

    info!(peer = %peer.id, %state, "attempting ICE restart");

    let offer = match pc
        .create_offer(Some(RTCOfferOptions {
            ice_restart: true,
            ..Default::default()
        }))
        .await
    {
        Ok(offer) => offer,
        Err(e) => {
            warn!(peer = %peer.id, error = %e, "ICE restart offer failed");
            peer.state_mut().ice_restart_queued = false;
            return;
        }
    };
    if let Err(e) = pc.set_local_description(offer.clone()).await {
        warn!(peer = %peer.id, error = %e, "ICE restart set local description failed");
        peer.state_mut().ice_restart_queued = false;
        return;
    }

    let (seq, epoch, mut gate) = {
        let mut st = peer.state_mut();
        st.offer_seq += 1;
        st.pending_renego = false;
        st.ice_restart_queued = false;
        let gate = st.arm_signal_gate();
        (st.offer_seq, st.epoch, gate)
    };

    peer.send_json(
        "offer",
        &OfferPayload {
            sdp: offer.sdp,
            reset: false,
            seq,
            epoch,
        },
    );

    drop(nego);

    match tokio::time::timeout(ANSWER_TIMEOUT, gate.changed()).await {
        Ok(_) => info!(peer = %peer.id, "ICE restart completed"),
        Err(_) => warn!(peer = %peer.id, "ICE restart answer timeout"),
    }
}
