pub mod connection;
pub mod engine;
pub mod negotiate;
pub mod tracks;

pub use connection::{close_peer_connection, create_peer_connection};
pub use engine::{RtcConfig, RtcEngine};
pub use negotiate::{handle_answer, handle_ice_candidate, negotiate_offer};
pub use tracks::{
    add_room_tracks_to_peer, add_track_to_peers, rebuild_peer_connection,
    remove_track_from_peers, remove_track_from_room_peers, send_offer,
};
