use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use axum::extract::connect_info::ConnectInfo;
use axum::extract::ws::{close_code, CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use futures::{SinkExt, StreamExt};
use parley_core::{
    AnswerPayload, CandidatePayload, ChatPayload, CreatePayload, Envelope, ErrorCode, JoinPayload,
    MoveToSubPayload, MutePayload, PeerId, SubInvitePayload, SubResponsePayload,
};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::hub::{Hub, HubError};
use crate::peer::Peer;
use crate::rtc;
use crate::signaling::admission::{extract_ip, RateLimiter};
use crate::AppState;

const PING_INTERVAL: Duration = Duration::from_secs(30);
const READ_DEADLINE: Duration = Duration::from_secs(60);
const MESSAGES_PER_SECOND: u32 = 30;
const MAX_RATE_VIOLATIONS: u32 = 50;
const MAX_SDP_BYTES: usize = 100_000;
const MAX_CANDIDATE_BYTES: usize = 2_000;
const MAX_CIPHERTEXT_BYTES: usize = 10_000;

pub async fn ws_handler(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    let ip = extract_ip(&headers, addr, state.cfg.trust_proxy);

    if !state.admission.allow(ip) {
        warn!(security = "conn_rate_limit", %ip, "too many connections");
        return StatusCode::TOO_MANY_REQUESTS.into_response();
    }
    if !origin_allowed(&headers, &state.cfg.allowed_origins) {
        warn!(security = "origin_rejected", %ip, "origin rejected");
        return StatusCode::FORBIDDEN.into_response();
    }

    ws.on_upgrade(move |socket| handle_socket(socket, ip, state))
}

/// An origin header must match the allow-list when one is configured,
/// otherwise it must be same-origin with the request host. Absent origins
/// (non-browser clients) pass.
fn origin_allowed(headers: &HeaderMap, allowed: &[String]) -> bool {
    let Some(origin) = headers.get("origin").and_then(|v| v.to_str().ok()) else {
        return true;
    };
    if !allowed.is_empty() {
        return allowed.iter().any(|o| o == origin);
    }
    let Some(host) = headers.get("host").and_then(|v| v.to_str().ok()) else {
        return false;
    };
    origin == format!("http://{host}") || origin == format!("https://{host}")
}

async fn handle_socket(socket: WebSocket, ip: IpAddr, state: AppState) {
    let (mut ws_tx, mut ws_rx) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<Message>();

    // Single writer task per connection; every outbound frame funnels
    // through it, so senders never interleave.
    let mut writer_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            if ws_tx.send(msg).await.is_err() {
                break;
            }
        }
    });

    let mut peer = Peer::new(PeerId::new(), tx.clone());
    let mut generation = peer.writer_generation();
    info!(peer = %peer.id, %ip, "peer connected");

    let hub = state.hub.clone();
    let mut limiter = RateLimiter::new(MESSAGES_PER_SECOND);
    let mut violations = 0u32;
    let mut ping = tokio::time::interval(PING_INTERVAL);
    ping.tick().await; // the first tick completes immediately

    // Absolute read deadline, pushed forward by every inbound frame (a pong
    // counts just by arriving).
    let mut deadline = tokio::time::Instant::now() + READ_DEADLINE;

    loop {
        tokio::select! {
            _ = ping.tick() => {
                if tx.send(Message::Ping(Vec::new().into())).is_err() {
                    break;
                }
            }
            _ = &mut writer_task => break,
            _ = tokio::time::sleep_until(deadline) => {
                warn!(peer = %peer.id, "keepalive timeout");
                break;
            }
            frame = ws_rx.next() => {
                deadline = tokio::time::Instant::now() + READ_DEADLINE;
                let frame = match frame {
                    None => break,
                    Some(Err(e)) => {
                        debug!(peer = %peer.id, error = %e, "read error");
                        break;
                    }
                    Some(Ok(frame)) => frame,
                };
                let text = match frame {
                    Message::Text(text) => text,
                    Message::Close(_) => break,
                    // Pings are answered by the transport; a pong resets the
                    // read deadline just by arriving.
                    _ => continue,
                };

                if !limiter.allow() {
                    violations += 1;
                    if violations >= MAX_RATE_VIOLATIONS {
                        warn!(security = "rate_abuse", %ip, peer = %peer.id, violations, "closing connection");
                        let _ = tx.send(Message::Close(Some(CloseFrame {
                            code: close_code::POLICY,
                            reason: "Too many requests".into(),
                        })));
                        break;
                    }
                    peer.send_error(ErrorCode::InvalidMessage, "Rate limit exceeded");
                    continue;
                }

                let env: Envelope = match serde_json::from_str(text.as_str()) {
                    Ok(env) => env,
                    Err(_) => {
                        warn!(security = "malformed_json", %ip, peer = %peer.id, "invalid JSON frame");
                        peer.send_error(ErrorCode::InvalidMessage, "Invalid JSON message");
                        continue;
                    }
                };

                // A session reconnect re-binds this connection to an existing
                // peer identity.
                if let Some((rebound, new_generation)) = dispatch(&hub, &peer, ip, env).await {
                    peer = rebound;
                    generation = new_generation;
                }
            }
        }
    }

    hub.remove_peer_if_current(&peer, generation).await;
    writer_task.abort();
    info!(peer = %peer.id, "peer disconnected");
}

async fn dispatch(
    hub: &Hub,
    peer: &Arc<Peer>,
    ip: IpAddr,
    env: Envelope,
) -> Option<(Arc<Peer>, u64)> {
    match env.kind.as_str() {
        "create" => {
            handle_create(hub, peer, ip, env.payload).await;
            None
        }
        "join" => handle_join(hub, peer, ip, env.payload).await,
        "answer" => {
            handle_answer(peer, env.payload).await;
            None
        }
        "candidate" => {
            handle_candidate(peer, env.payload).await;
            None
        }
        "chat" => {
            handle_chat(hub, peer, env.payload);
            None
        }
        "mute" => {
            match serde_json::from_value::<MutePayload>(env.payload) {
                Ok(p) => hub.handle_mute(peer, p.muted),
                Err(_) => peer.send_error(ErrorCode::InvalidMessage, "Invalid mute payload"),
            }
            None
        }
        "sub-invite" => {
            handle_sub_invite(hub, peer, env.payload);
            None
        }
        "sub-response" => {
            match serde_json::from_value::<SubResponsePayload>(env.payload) {
                Ok(p) => hub.handle_sub_response(peer, &p.invite_id, p.accepted).await,
                Err(_) => {
                    peer.send_error(ErrorCode::InvalidMessage, "Invalid sub-response payload")
                }
            }
            None
        }
        "move-to-main" => {
            hub.handle_move_to_main(peer).await;
            None
        }
        "move-to-sub" => {
            match serde_json::from_value::<MoveToSubPayload>(env.payload) {
                Ok(p) => hub.handle_move_to_sub(peer, p.sub_channel_id).await,
                Err(_) => {
                    peer.send_error(ErrorCode::InvalidMessage, "Invalid move-to-sub payload")
                }
            }
            None
        }
        "leave" => {
            hub.remove_peer(peer, false).await;
            None
        }
        other => {
            peer.send_error(
                ErrorCode::InvalidMessage,
                &format!("Unknown message type: {other}"),
            );
            None
        }
    }
}

async fn handle_create(hub: &Hub, peer: &Arc<Peer>, ip: IpAddr, payload: serde_json::Value) {
    let Ok(p) = serde_json::from_value::<CreatePayload>(payload) else {
        peer.send_error(ErrorCode::InvalidMessage, "Invalid create payload");
        return;
    };
    let Some(username) = validate_username(&p.username) else {
        peer.send_error(ErrorCode::InvalidMessage, "Username must be 1-24 characters");
        return;
    };
    if !valid_channel_name(&p.channel_name) {
        peer.send_error(
            ErrorCode::InvalidMessage,
            "Channel name must be 1-30 alphanumeric characters, spaces, or hyphens",
        );
        return;
    }
    if !valid_password(&p.password) {
        peer.send_error(
            ErrorCode::PasswordRequired,
            "Password must be 6-64 characters",
        );
        return;
    }

    peer.state_mut().name = username;

    let channel_name = p.channel_name.trim().to_owned();
    match hub.create_room(&channel_name, &p.password, peer, Some(ip)).await {
        Err(e) => {
            if matches!(e, HubError::ServerFull | HubError::CreateRateLimited) {
                warn!(security = "room_limit", %ip, error = %e, "create rejected");
            }
            peer.send_error(e.code(), &e.to_string());
        }
        Ok((room, session_token)) => {
            let welcome = hub.build_welcome(peer, &room, &session_token);
            peer.send_json("welcome", &welcome);

            if let Err(e) = rtc::create_peer_connection(hub.engine(), peer).await {
                warn!(peer = %peer.id, error = %e, "failed to create media connection");
                return;
            }
            if let Err(e) = rtc::send_offer(peer, &room).await {
                warn!(peer = %peer.id, error = %e, "failed to send offer");
            }
        }
    }
}

async fn handle_join(
    hub: &Hub,
    peer: &Arc<Peer>,
    ip: IpAddr,
    payload: serde_json::Value,
) -> Option<(Arc<Peer>, u64)> {
    let Ok(mut p) = serde_json::from_value::<JoinPayload>(payload) else {
        peer.send_error(ErrorCode::InvalidMessage, "Invalid join payload");
        return None;
    };
    let Some(username) = validate_username(&p.username) else {
        peer.send_error(ErrorCode::InvalidMessage, "Username must be 1-24 characters");
        return None;
    };
    p.username = username;

    if p.invite_token.is_empty() && p.channel_name.is_empty() && p.session_token.is_empty() {
        peer.send_error(
            ErrorCode::InvalidMessage,
            "Must provide channelName, inviteToken, or sessionToken",
        );
        return None;
    }
    if p.invite_token.is_empty()
        && p.session_token.is_empty()
        && !p.password.is_empty()
        && !valid_password(&p.password)
    {
        peer.send_error(ErrorCode::InvalidMessage, "Password must be 6-64 characters");
        return None;
    }

    let channel_name = p.channel_name.clone();
    let outcome = match hub.join_room(p, peer).await {
        Err(e) => {
            if matches!(e, HubError::PasswordWrong) {
                warn!(security = "wrong_password", %ip, channel = %channel_name, "join rejected");
            }
            peer.send_error(e.code(), &e.to_string());
            return None;
        }
        Ok(outcome) => outcome,
    };

    let active = outcome.peer.clone();
    let rebind = outcome
        .reconnected
        .then(|| (active.clone(), outcome.writer_generation));

    let welcome = hub.build_welcome(&active, &outcome.room, &outcome.session_token);
    active.send_json("welcome", &welcome);

    // A reconnected peer may sit in a sub-channel; media wires against the
    // current channel, not the main room.
    let media_room = hub
        .current_room(&active)
        .unwrap_or_else(|| outcome.room.clone());

    // Stale senders of this peer's previous track go away before the rebuild.
    rtc::remove_track_from_peers(&active, &media_room).await;
    rtc::close_peer_connection(&active).await;

    match rtc::create_peer_connection(hub.engine(), &active).await {
        Ok(()) => {
            rtc::add_track_to_peers(&active, &media_room).await;
            if let Err(e) = rtc::send_offer(&active, &media_room).await {
                warn!(peer = %active.id, error = %e, "failed to send offer");
            }
        }
        Err(e) => warn!(peer = %active.id, error = %e, "failed to create media connection"),
    }

    hub.broadcast_room_update(&outcome.room);
    rebind
}

async fn handle_answer(peer: &Arc<Peer>, payload: serde_json::Value) {
    let Ok(p) = serde_json::from_value::<AnswerPayload>(payload) else {
        peer.send_error(ErrorCode::InvalidMessage, "Invalid answer payload");
        return;
    };
    if p.sdp.len() > MAX_SDP_BYTES {
        warn!(security = "oversized_sdp", peer = %peer.id, size = p.sdp.len(), "SDP rejected");
        peer.send_error(ErrorCode::InvalidMessage, "SDP too large");
        return;
    }
    if let Err(e) = rtc::handle_answer(peer, p.sdp, p.seq, p.epoch).await {
        debug!(peer = %peer.id, error = %e, "answer not applied");
    }
}

async fn handle_candidate(peer: &Arc<Peer>, payload: serde_json::Value) {
    let Ok(p) = serde_json::from_value::<CandidatePayload>(payload) else {
        peer.send_error(ErrorCode::InvalidMessage, "Invalid candidate payload");
        return;
    };
    if p.candidate.len() > MAX_CANDIDATE_BYTES {
        warn!(security = "oversized_candidate", peer = %peer.id, size = p.candidate.len(), "candidate rejected");
        peer.send_error(ErrorCode::InvalidMessage, "Candidate too large");
        return;
    }
    if let Err(e) = rtc::handle_ice_candidate(peer, p).await {
        debug!(peer = %peer.id, error = %e, "candidate not applied");
    }
}

fn handle_chat(hub: &Hub, peer: &Arc<Peer>, payload: serde_json::Value) {
    let Ok(p) = serde_json::from_value::<ChatPayload>(payload) else {
        peer.send_error(ErrorCode::InvalidMessage, "Invalid chat payload");
        return;
    };
    // Empty and oversized ciphertexts are silently dropped.
    if p.ciphertext.is_empty() || p.ciphertext.len() > MAX_CIPHERTEXT_BYTES {
        return;
    }
    hub.handle_chat(peer, p.ciphertext);
}

fn handle_sub_invite(hub: &Hub, peer: &Arc<Peer>, payload: serde_json::Value) {
    let Ok(p) = serde_json::from_value::<SubInvitePayload>(payload) else {
        peer.send_error(ErrorCode::InvalidMessage, "Invalid sub-invite payload");
        return;
    };
    if !p.channel_name.is_empty() && !valid_channel_name(&p.channel_name) {
        peer.send_error(
            ErrorCode::InvalidMessage,
            "Channel name must be 1-30 alphanumeric characters, spaces, or hyphens",
        );
        return;
    }
    hub.handle_sub_invite(peer, p.target_user_id, p.channel_name.trim().to_owned());
}

fn validate_username(name: &str) -> Option<String> {
    let name = name.trim();
    if name.is_empty() || name.chars().count() > 24 {
        return None;
    }
    Some(name.to_owned())
}

fn valid_channel_name(name: &str) -> bool {
    let name = name.trim();
    !name.is_empty()
        && name.chars().count() <= 30
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == ' ' || c == '-')
}

fn valid_password(pw: &str) -> bool {
    (6..=64).contains(&pw.len())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn usernames_are_trimmed_and_bounded() {
        assert_eq!(validate_username("  ada  "), Some("ada".to_owned()));
        assert_eq!(validate_username("   "), None);
        assert_eq!(validate_username(&"x".repeat(25)), None);
        // Code points, not bytes.
        assert!(validate_username(&"ü".repeat(24)).is_some());
    }

    #[test]
    fn channel_names_allow_alphanumerics_spaces_hyphens() {
        assert!(valid_channel_name("war-room 2"));
        assert!(!valid_channel_name(""));
        assert!(!valid_channel_name("nope!"));
        assert!(!valid_channel_name(&"a".repeat(31)));
    }

    #[test]
    fn passwords_are_6_to_64_bytes() {
        assert!(!valid_password("short"));
        assert!(valid_password("secret1"));
        assert!(!valid_password(&"p".repeat(65)));
    }

    #[test]
    fn origin_policy_defaults_to_same_origin() {
        let mut headers = HeaderMap::new();
        headers.insert("host", "chat.example.com".parse().unwrap());
        headers.insert("origin", "https://chat.example.com".parse().unwrap());
        assert!(origin_allowed(&headers, &[]));

        headers.insert("origin", "https://evil.example.com".parse().unwrap());
        assert!(!origin_allowed(&headers, &[]));

        // Allow-list overrides same-origin.
        assert!(origin_allowed(
            &headers,
            &["https://evil.example.com".to_owned()]
        ));

        // No origin header at all (non-browser client).
        let bare = HeaderMap::new();
        assert!(origin_allowed(&bare, &[]));
    }
}
