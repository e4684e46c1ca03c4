use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use parley_core::CandidatePayload;
use tracing::{debug, info, warn};
use webrtc::api::media_engine::MIME_TYPE_OPUS;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::rtp_transceiver::rtp_sender::RTCRtpSender;
use webrtc::track::track_local::track_local_static_rtp::TrackLocalStaticRTP;
use webrtc::track::track_local::TrackLocalWriter;
use webrtc::track::track_remote::TrackRemote;

use crate::peer::Peer;
use crate::rtc::engine::RtcEngine;
use crate::rtc::negotiate::queue_ice_restart;

const STATS_LOG_INTERVAL: Duration = Duration::from_secs(5);

/// Build a fresh media connection for a peer: a new RTCPeerConnection, a new
/// owned forwarding track, and a bumped epoch. Every in-flight answer or
/// candidate for the previous connection becomes stale.
pub async fn create_peer_connection(engine: &RtcEngine, peer: &Arc<Peer>) -> Result<()> {
    let api = engine.api();

    let config = RTCConfiguration {
        ice_servers: vec![RTCIceServer {
            urls: vec!["stun:stun.l.google.com:19302".to_owned()],
            ..Default::default()
        }],
        ..Default::default()
    };

    let pc = Arc::new(api.new_peer_connection(config).await?);
    let track = Arc::new(TrackLocalStaticRTP::new(
        RTCRtpCodecCapability {
            mime_type: MIME_TYPE_OPUS.to_owned(),
            ..Default::default()
        },
        format!("audio-{}", peer.id),
        format!("stream-{}", peer.id),
    ));

    {
        let _nego = peer.nego.lock().await;
        peer.state_mut().install_media(pc.clone(), track);
    }

    {
        let peer = peer.clone();
        pc.on_track(Box::new(move |remote, _receiver, _transceiver| {
            let peer = peer.clone();
            Box::pin(async move {
                info!(
                    peer = %peer.id,
                    codec = %remote.codec().capability.mime_type,
                    "inbound track"
                );
                tokio::spawn(forward_inbound_rtp(peer, remote));
            })
        }));
    }

    {
        let peer = peer.clone();
        pc.on_ice_candidate(Box::new(move |candidate| {
            let peer = peer.clone();
            Box::pin(async move {
                let Some(candidate) = candidate else { return };
                let init = match candidate.to_json() {
                    Ok(init) => init,
                    Err(e) => {
                        warn!(peer = %peer.id, error = %e, "failed to serialize candidate");
                        return;
                    }
                };
                let (seq, epoch) = {
                    let st = peer.state();
                    (st.offer_seq, st.epoch)
                };
                peer.send_json(
                    "candidate",
                    &CandidatePayload {
                        candidate: init.candidate,
                        sdp_mid: init.sdp_mid,
                        sdp_m_line_index: init.sdp_mline_index,
                        seq,
                        epoch,
                    },
                );
            })
        }));
    }

    {
        let peer = peer.clone();
        pc.on_peer_connection_state_change(Box::new(move |state| {
            let peer = peer.clone();
            Box::pin(async move {
                debug!(peer = %peer.id, %state, "connection state");
                match state {
                    RTCPeerConnectionState::Connected => {
                        peer.state_mut().ice_restart_queued = false;
                    }
                    RTCPeerConnectionState::Disconnected => {
                        queue_ice_restart(&peer, Duration::from_secs(3));
                    }
                    RTCPeerConnectionState::Failed => {
                        queue_ice_restart(&peer, Duration::ZERO);
                    }
                    _ => {}
                }
            })
        }));
    }

    Ok(())
}

/// Explicit teardown. The counters reset under the negotiation mutex so no
/// offer construction can interleave with the swap; the epoch stays put and
/// is bumped by the next creation.
pub async fn close_peer_connection(peer: &Arc<Peer>) {
    let pc = {
        let _nego = peer.nego.lock().await;
        peer.state_mut().take_media()
    };
    if let Some(pc) = pc {
        if let Err(e) = pc.close().await {
            warn!(peer = %peer.id, error = %e, "close failed");
        }
    }
}

async fn forward_inbound_rtp(peer: Arc<Peer>, remote: Arc<TrackRemote>) {
    let mut last_stats = Instant::now();
    let mut rx_packets = 0u64;
    let mut forwarded = 0u64;
    let mut forward_errors = 0u64;

    loop {
        let (mut pkt, _) = match remote.read_rtp().await {
            Ok(v) => v,
            Err(_) => return,
        };
        rx_packets += 1;

        // Cross-browser peers may negotiate different RTP header extension
        // ids (e.g. Firefox vs Chrome); forwarding them untouched can break
        // decode on receivers, so strip them before re-writing.
        pkt.header.extension = false;
        pkt.header.extension_profile = 0;
        pkt.header.extensions.clear();

        let track = peer.state().track.clone();
        if let Some(track) = track {
            if let Err(e) = track.write_rtp(&pkt).await {
                // The forwarding track may report aggregated write errors for
                // one binding while still delivering to others.
                forward_errors += 1;
                debug!(peer = %peer.id, error = %e, "forward write error");
            } else {
                forwarded += 1;
            }
        }

        if last_stats.elapsed() >= STATS_LOG_INTERVAL {
            info!(
                peer = %peer.id,
                rx = rx_packets,
                forwarded,
                forward_errors,
                "RTP forward stats"
            );
            last_stats = Instant::now();
        }
    }
}

/// Senders accumulate RTCP feedback that must be read, otherwise the write
/// path eventually stalls.
pub fn spawn_rtcp_drain(sender: Arc<RTCRtpSender>) {
    tokio::spawn(async move {
        let mut buf = vec![0u8; 1500];
        while sender.read(&mut buf).await.is_ok() {}
    });
}
