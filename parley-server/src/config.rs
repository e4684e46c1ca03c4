use std::env;
use std::net::{IpAddr, ToSocketAddrs};
use std::time::Duration;

use tracing::{info, warn};

/// Server tunables, read from the environment once at startup. Every numeric
/// value is clamped to its documented bounds so a bad deployment cannot take
/// the process down.
#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub max_users_per_room: usize,
    pub max_rooms: usize,
    pub chat_history_size: usize,
    pub udp_min: u16,
    pub udp_max: u16,
    /// Raw PUBLIC_IP value, kept for periodic re-resolution.
    pub public_ip_source: String,
    /// Resolved PUBLIC_IP (IPv4 preferred). None disables the NAT1-to-1 hint.
    pub public_ip: Option<String>,
    pub public_ip_recheck_interval: Duration,
    pub public_ip_recheck_rebuild_peers: bool,
    pub trust_proxy: bool,
    pub allowed_origins: Vec<String>,
}

impl Config {
    pub fn from_env() -> Self {
        let public_ip_source = env::var("PUBLIC_IP").unwrap_or_default().trim().to_owned();
        let public_ip = resolve_public_ip(&public_ip_source);
        if let Some(ip) = &public_ip {
            info!("PUBLIC_IP: using {ip}");
        }

        let allowed_origins: Vec<String> = env::var("ALLOWED_ORIGINS")
            .unwrap_or_default()
            .split(',')
            .map(|o| o.trim().to_owned())
            .filter(|o| !o.is_empty())
            .collect();
        if !allowed_origins.is_empty() {
            info!("origin allow-list: {allowed_origins:?}");
        }

        Self {
            port: env_u16("PORT", 17223),
            max_users_per_room: env_int_bounded("MAX_USERS_PER_ROOM", 25, 1, 100),
            max_rooms: env_int_bounded("MAX_ROOMS", 100, 1, 10_000),
            chat_history_size: env_int_bounded("CHAT_HISTORY_SIZE", 200, 10, 1000),
            udp_min: env_u16("UDP_MIN", 40_000),
            udp_max: env_u16("UDP_MAX", 40_100),
            public_ip_source,
            public_ip,
            public_ip_recheck_interval: env_duration("PUBLIC_IP_RECHECK_INTERVAL", Duration::ZERO),
            public_ip_recheck_rebuild_peers: env_bool("PUBLIC_IP_RECHECK_REBUILD_PEERS", true),
            trust_proxy: env_bool("TRUST_PROXY", false),
            allowed_origins,
        }
    }
}

/// Resolve a PUBLIC_IP value: a literal IP is used as-is, a hostname is looked
/// up. IPv4 is preferred when a hostname resolves to both A and AAAA records,
/// since candidate advertisement then matches common home-router UDP
/// forwarding setups.
pub fn resolve_public_ip(raw: &str) -> Option<String> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    if raw.parse::<IpAddr>().is_ok() {
        return Some(raw.to_owned());
    }

    let addrs: Vec<IpAddr> = match (raw, 0u16).to_socket_addrs() {
        Ok(it) => it.map(|a| a.ip()).collect(),
        Err(_) => Vec::new(),
    };
    if addrs.is_empty() {
        warn!("PUBLIC_IP={raw:?} is not a valid IP and could not be resolved, NAT1-to-1 disabled");
        return None;
    }
    if let Some(v4) = addrs.iter().find(|a| a.is_ipv4()) {
        info!("PUBLIC_IP: resolved {raw} -> {v4} (preferred IPv4)");
        return Some(v4.to_string());
    }
    info!("PUBLIC_IP: resolved {raw} -> {}", addrs[0]);
    Some(addrs[0].to_string())
}

fn env_u16(key: &str, default: u16) -> u16 {
    parse_u16(env::var(key).ok().as_deref(), default)
}

fn env_int_bounded(key: &str, default: usize, min: usize, max: usize) -> usize {
    parse_int_bounded(env::var(key).ok().as_deref(), default, min, max)
}

fn env_duration(key: &str, default: Duration) -> Duration {
    parse_duration(env::var(key).ok().as_deref(), default)
}

fn env_bool(key: &str, default: bool) -> bool {
    parse_bool(env::var(key).ok().as_deref(), default)
}

fn parse_u16(raw: Option<&str>, default: u16) -> u16 {
    match raw.map(str::trim) {
        Some(v) if !v.is_empty() => v.parse().unwrap_or(default),
        _ => default,
    }
}

fn parse_int_bounded(raw: Option<&str>, default: usize, min: usize, max: usize) -> usize {
    let n = match raw.map(str::trim) {
        Some(v) if !v.is_empty() => v.parse().unwrap_or(default),
        _ => default,
    };
    n.clamp(min, max)
}

/// Accepts either a bare number of seconds or a `humantime`-style suffix
/// subset ("30s", "5m", "1h").
fn parse_duration(raw: Option<&str>, default: Duration) -> Duration {
    let Some(v) = raw.map(str::trim).filter(|v| !v.is_empty()) else {
        return default;
    };
    if let Ok(secs) = v.parse::<u64>() {
        return Duration::from_secs(secs);
    }
    let (num, unit) = v.split_at(v.len().saturating_sub(1));
    let Ok(n) = num.parse::<u64>() else {
        return default;
    };
    match unit {
        "s" => Duration::from_secs(n),
        "m" => Duration::from_secs(n * 60),
        "h" => Duration::from_secs(n * 3600),
        _ => default,
    }
}

fn parse_bool(raw: Option<&str>, default: bool) -> bool {
    match raw.map(|v| v.trim().to_ascii_lowercase()).as_deref() {
        Some("1") | Some("true") | Some("yes") | Some("on") => true,
        Some("0") | Some("false") | Some("no") | Some("off") => false,
        _ => default,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ints_are_clamped_to_bounds() {
        assert_eq!(parse_int_bounded(Some("0"), 25, 1, 100), 1);
        assert_eq!(parse_int_bounded(Some("5000"), 25, 1, 100), 100);
        assert_eq!(parse_int_bounded(Some("42"), 25, 1, 100), 42);
        assert_eq!(parse_int_bounded(None, 25, 1, 100), 25);
        assert_eq!(parse_int_bounded(Some("nope"), 25, 1, 100), 25);
    }

    #[test]
    fn durations_accept_seconds_and_suffixes() {
        assert_eq!(parse_duration(Some("30"), Duration::ZERO), Duration::from_secs(30));
        assert_eq!(parse_duration(Some("5m"), Duration::ZERO), Duration::from_secs(300));
        assert_eq!(parse_duration(Some("1h"), Duration::ZERO), Duration::from_secs(3600));
        assert_eq!(parse_duration(Some("junk"), Duration::from_secs(7)), Duration::from_secs(7));
        assert_eq!(parse_duration(None, Duration::ZERO), Duration::ZERO);
    }

    #[test]
    fn bools_accept_common_spellings() {
        assert!(parse_bool(Some("true"), false));
        assert!(parse_bool(Some("ON"), false));
        assert!(!parse_bool(Some("off"), true));
        assert!(parse_bool(None, true));
        assert!(!parse_bool(Some("banana"), false));
    }

    #[test]
    fn literal_public_ip_passes_through() {
        assert_eq!(resolve_public_ip("203.0.113.7"), Some("203.0.113.7".into()));
        assert_eq!(resolve_public_ip(""), None);
    }
}
