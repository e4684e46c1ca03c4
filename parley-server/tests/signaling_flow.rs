mod common;

use std::sync::Arc;
use std::time::Duration;

use common::*;
use parley_core::{CandidatePayload, OfferPayload};
use parley_server::rtc;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::track::track_local::TrackLocal;

#[tokio::test]
async fn initial_offer_carries_reset_and_stale_answers_are_discarded() {
    let hub = test_hub();
    let (peer, mut rx) = test_peer();
    rtc::create_peer_connection(hub.engine(), &peer)
        .await
        .expect("media failed");
    assert_eq!(peer.state().epoch, 1);

    let negotiation = tokio::spawn(rtc::negotiate_offer(peer.clone(), true));

    let offer_env = recv_kind(&mut rx, "offer").await;
    let offer: OfferPayload = serde_json::from_value(offer_env.payload).unwrap();
    assert!(offer.reset);
    assert_eq!(offer.seq, 1);
    assert_eq!(offer.epoch, 1);

    let client = TestClient::new().await;
    let answer = client.answer(offer.sdp.clone()).await;

    // Prior-epoch and non-current answers are discarded, never applied.
    rtc::handle_answer(&peer, answer.clone(), offer.seq, offer.epoch + 1)
        .await
        .unwrap();
    assert!(!peer.state().has_remote_description);
    rtc::handle_answer(&peer, answer.clone(), offer.seq + 7, offer.epoch)
        .await
        .unwrap();
    assert!(!peer.state().has_remote_description);

    rtc::handle_answer(&peer, answer, offer.seq, offer.epoch)
        .await
        .unwrap();
    tokio::time::timeout(Duration::from_secs(5), negotiation)
        .await
        .expect("negotiation stuck")
        .unwrap()
        .unwrap();
    assert!(peer.state().has_remote_description);
}

#[tokio::test]
async fn renegotiation_defers_until_the_answer_lands() {
    let hub = test_hub();
    let (peer, mut rx) = test_peer();
    rtc::create_peer_connection(hub.engine(), &peer)
        .await
        .expect("media failed");

    let negotiation = tokio::spawn(rtc::negotiate_offer(peer.clone(), true));
    let offer_env = recv_kind(&mut rx, "offer").await;
    let offer: OfferPayload = serde_json::from_value(offer_env.payload).unwrap();

    // A renegotiation request while the first offer is outstanding is
    // deferred rather than sent.
    rtc::negotiate_offer(peer.clone(), false).await.unwrap();
    {
        let st = peer.state();
        assert!(st.pending_renego);
        assert_eq!(st.offer_seq, 1);
    }

    let client = TestClient::new().await;
    let answer = client.answer(offer.sdp).await;
    rtc::handle_answer(&peer, answer, offer.seq, offer.epoch)
        .await
        .unwrap();

    // The waiting loop immediately runs the deferred round.
    let next_env = recv_kind(&mut rx, "offer").await;
    let next: OfferPayload = serde_json::from_value(next_env.payload).unwrap();
    assert_eq!(next.seq, 2);
    assert_eq!(next.epoch, offer.epoch);
    assert!(!next.reset);

    let answer2 = client.answer(next.sdp).await;
    rtc::handle_answer(&peer, answer2, next.seq, next.epoch)
        .await
        .unwrap();
    tokio::time::timeout(Duration::from_secs(5), negotiation)
        .await
        .expect("negotiation stuck")
        .unwrap()
        .unwrap();
}

#[tokio::test]
async fn candidate_staleness_and_pre_answer_buffering() {
    let hub = test_hub();
    let (peer, mut rx) = test_peer();
    rtc::create_peer_connection(hub.engine(), &peer)
        .await
        .expect("media failed");

    let negotiation = tokio::spawn(rtc::negotiate_offer(peer.clone(), true));
    let offer_env = recv_kind(&mut rx, "offer").await;
    let offer: OfferPayload = serde_json::from_value(offer_env.payload).unwrap();

    let candidate = |seq: u64, epoch: u64| CandidatePayload {
        candidate: "candidate:1 1 udp 2130706431 127.0.0.1 54321 typ host".to_owned(),
        sdp_mid: Some("0".to_owned()),
        sdp_m_line_index: Some(0),
        seq,
        epoch,
    };

    // A prior-epoch candidate is dropped outright.
    rtc::handle_ice_candidate(&peer, candidate(offer.seq, offer.epoch + 1))
        .await
        .unwrap();
    assert!(peer.state().pending_candidates.is_empty());

    // A future-tagged candidate is dropped.
    rtc::handle_ice_candidate(&peer, candidate(offer.seq + 3, offer.epoch))
        .await
        .unwrap();
    assert!(peer.state().pending_candidates.is_empty());

    // A current candidate before the answer is buffered, then flushed once
    // the remote description lands.
    rtc::handle_ice_candidate(&peer, candidate(offer.seq, offer.epoch))
        .await
        .unwrap();
    assert_eq!(peer.state().pending_candidates.len(), 1);

    let client = TestClient::new().await;
    let answer = client.answer(offer.sdp).await;
    rtc::handle_answer(&peer, answer, offer.seq, offer.epoch)
        .await
        .unwrap();
    assert!(peer.state().pending_candidates.is_empty());

    tokio::time::timeout(Duration::from_secs(5), negotiation)
        .await
        .expect("negotiation stuck")
        .unwrap()
        .unwrap();

    // Same-epoch candidates keep landing after the exchange.
    rtc::handle_ice_candidate(&peer, candidate(offer.seq, offer.epoch))
        .await
        .unwrap();
}

#[tokio::test]
async fn rebuilding_media_bumps_the_epoch_and_resets_counters() {
    let hub = test_hub();
    let (peer, _rx) = test_peer();
    rtc::create_peer_connection(hub.engine(), &peer)
        .await
        .expect("media failed");
    assert_eq!(peer.state().epoch, 1);

    {
        let mut st = peer.state_mut();
        st.offer_seq = 4;
        st.pending_renego = true;
    }

    rtc::create_peer_connection(hub.engine(), &peer)
        .await
        .expect("rebuild failed");
    {
        let st = peer.state();
        assert_eq!(st.epoch, 2);
        assert_eq!(st.offer_seq, 0);
        assert!(!st.pending_renego);
    }

    rtc::close_peer_connection(&peer).await;
    assert!(peer.state().pc.is_none());
    assert!(peer.state().track.is_none());
}

#[tokio::test]
async fn joining_attaches_tracks_in_both_directions() {
    let hub = test_hub();
    let (alice, alice_rx) = test_peer();
    let (room, _) = create(&hub, &alice, "a", "Lobby", "secret1").await;
    rtc::create_peer_connection(hub.engine(), &alice)
        .await
        .expect("alice media failed");
    let (_abot, _afwd) = spawn_answer_bot(alice.clone(), alice_rx);
    rtc::send_offer(&alice, &room).await.expect("alice offer failed");

    let (bob, bob_rx) = test_peer();
    join(&hub, &bob, join_payload("b", &room.full_name, "secret1"))
        .await
        .expect("join failed");
    let (_bbot, _bfwd) = spawn_answer_bot(bob.clone(), bob_rx);
    rtc::create_peer_connection(hub.engine(), &bob)
        .await
        .expect("bob media failed");
    rtc::add_track_to_peers(&bob, &room).await;
    rtc::send_offer(&bob, &room).await.expect("bob offer failed");

    let alice_pc = alice.state().pc.clone().unwrap();
    let bob_pc = bob.state().pc.clone().unwrap();
    let alice_track = alice.state().track.clone().unwrap();
    let bob_track = bob.state().track.clone().unwrap();

    // Alice's renegotiation for Bob's track runs on a spawned task.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    loop {
        if has_sender(&alice_pc, bob_track.id()).await
            && has_sender(&bob_pc, alice_track.id()).await
        {
            break;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "outbound senders were not attached"
        );
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
}

async fn has_sender(pc: &Arc<RTCPeerConnection>, track_id: &str) -> bool {
    for sender in pc.get_senders().await {
        if let Some(track) = sender.track().await {
            if track.id() == track_id {
                return true;
            }
        }
    }
    false
}
