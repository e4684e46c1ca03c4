pub mod admission;
pub mod ws_handler;

pub use admission::{extract_ip, Admission, RateLimiter};
pub use ws_handler::ws_handler;
