pub mod peer;
pub mod room;
pub mod signaling;
