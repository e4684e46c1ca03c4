pub mod config;
pub mod hub;
pub mod peer;
pub mod room;
pub mod rtc;
pub mod signaling;

use std::sync::Arc;

use crate::config::Config;
use crate::hub::Hub;
use crate::signaling::admission::Admission;

#[derive(Clone)]
pub struct AppState {
    pub hub: Hub,
    pub admission: Arc<Admission>,
    pub cfg: Arc<Config>,
}
