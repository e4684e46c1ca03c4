use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::http::HeaderMap;
use dashmap::DashMap;

const CONNECTIONS_PER_SECOND: u32 = 3;
const ENTRY_TTL: Duration = Duration::from_secs(5 * 60);
const SWEEP_INTERVAL: Duration = Duration::from_secs(5 * 60);

/// Token bucket refilled once per second. Also used for the per-connection
/// message limit.
pub struct RateLimiter {
    tokens: u32,
    last_reset: Instant,
    max_rate: u32,
}

impl RateLimiter {
    pub fn new(max_rate: u32) -> Self {
        Self {
            tokens: max_rate,
            last_reset: Instant::now(),
            max_rate,
        }
    }

    pub fn allow(&mut self) -> bool {
        let now = Instant::now();
        if now.duration_since(self.last_reset) >= Duration::from_secs(1) {
            self.tokens = self.max_rate;
            self.last_reset = now;
        }
        if self.tokens == 0 {
            return false;
        }
        self.tokens -= 1;
        true
    }
}

struct Entry {
    limiter: RateLimiter,
    last_seen: Instant,
}

/// Per-IP connection admission: 3 new connections per second, entries swept
/// after 5 minutes of inactivity.
pub struct Admission {
    entries: DashMap<IpAddr, Entry>,
}

impl Admission {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            entries: DashMap::new(),
        })
    }

    pub fn allow(&self, ip: IpAddr) -> bool {
        let mut entry = self.entries.entry(ip).or_insert_with(|| Entry {
            limiter: RateLimiter::new(CONNECTIONS_PER_SECOND),
            last_seen: Instant::now(),
        });
        entry.last_seen = Instant::now();
        entry.limiter.allow()
    }

    pub fn sweep(&self) {
        let now = Instant::now();
        self.entries
            .retain(|_, e| now.duration_since(e.last_seen) <= ENTRY_TTL);
    }
}

pub async fn run_sweeper(admission: Arc<Admission>) {
    let mut ticker = tokio::time::interval(SWEEP_INTERVAL);
    ticker.tick().await;
    loop {
        ticker.tick().await;
        admission.sweep();
    }
}

/// Proxy headers are consulted only when proxy trust is enabled; anything
/// unparsable falls back to the socket peer.
pub fn extract_ip(headers: &HeaderMap, addr: SocketAddr, trust_proxy: bool) -> IpAddr {
    if trust_proxy {
        if let Some(xff) = headers.get("x-forwarded-for").and_then(|v| v.to_str().ok()) {
            let first = xff.split(',').next().unwrap_or("").trim();
            if let Ok(ip) = first.parse() {
                return ip;
            }
        }
        if let Some(xri) = headers.get("x-real-ip").and_then(|v| v.to_str().ok()) {
            if let Ok(ip) = xri.trim().parse() {
                return ip;
            }
        }
    }
    addr.ip()
}
