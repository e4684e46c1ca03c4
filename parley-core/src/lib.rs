pub mod model;

pub use model::peer::PeerId;
pub use model::room::RoomId;
pub use model::signaling::*;
