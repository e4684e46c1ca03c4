use std::sync::{Arc, RwLock};

use anyhow::Result;
use tokio::time::MissedTickBehavior;
use tracing::{info, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::setting_engine::SettingEngine;
use webrtc::api::{APIBuilder, API};
use webrtc::ice::udp_network::{EphemeralUDP, UDPNetwork};
use webrtc::ice_transport::ice_candidate_type::RTCIceCandidateType;
use webrtc::interceptor::registry::Registry;

use crate::config::{resolve_public_ip, Config};
use crate::hub::Hub;

/// Media-level tunables the webrtc API is built from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RtcConfig {
    pub public_ip: Option<String>,
    pub udp_min: u16,
    pub udp_max: u16,
}

impl RtcConfig {
    pub fn from_config(cfg: &Config) -> Self {
        Self {
            public_ip: cfg.public_ip.clone(),
            udp_min: cfg.udp_min,
            udp_max: cfg.udp_max,
        }
    }
}

struct Handle {
    api: Arc<API>,
    cfg: RtcConfig,
}

/// Process-wide webrtc API handle: codec registry, default interceptors, the
/// ephemeral UDP port range, and the NAT1-to-1 public-IP hint. Rebuilt when
/// the public-IP monitor observes a change.
pub struct RtcEngine {
    handle: RwLock<Handle>,
}

impl RtcEngine {
    pub fn new(cfg: RtcConfig) -> Result<Self> {
        let api = build_api(&cfg)?;
        Ok(Self {
            handle: RwLock::new(Handle { api, cfg }),
        })
    }

    pub fn api(&self) -> Arc<API> {
        self.handle.read().unwrap().api.clone()
    }

    pub fn config(&self) -> RtcConfig {
        self.handle.read().unwrap().cfg.clone()
    }

    pub fn replace(&self, cfg: RtcConfig) -> Result<()> {
        let api = build_api(&cfg)?;
        let mut handle = self.handle.write().unwrap();
        info!(
            "WebRTC config updated: PUBLIC_IP {:?} -> {:?}, UDP range {}-{}",
            handle.cfg.public_ip, cfg.public_ip, cfg.udp_min, cfg.udp_max
        );
        *handle = Handle { api, cfg };
        Ok(())
    }
}

fn build_api(cfg: &RtcConfig) -> Result<Arc<API>> {
    let mut setting_engine = SettingEngine::default();
    if cfg.udp_min != 0 || cfg.udp_max != 0 {
        let ephemeral = EphemeralUDP::new(cfg.udp_min, cfg.udp_max)?;
        setting_engine.set_udp_network(UDPNetwork::Ephemeral(ephemeral));
    }
    if let Some(ip) = &cfg.public_ip {
        setting_engine.set_nat_1to1_ips(vec![ip.clone()], RTCIceCandidateType::Host);
    }

    let mut media_engine = MediaEngine::default();
    media_engine.register_default_codecs()?;
    let registry = register_default_interceptors(Registry::new(), &mut media_engine)?;

    Ok(Arc::new(
        APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .with_setting_engine(setting_engine)
            .build(),
    ))
}

/// Periodically re-resolves PUBLIC_IP and, on an effective change, rebuilds
/// the API handle and (best-effort) every live peer connection.
pub async fn run_public_ip_monitor(hub: Hub, cfg: Arc<Config>) {
    let source = cfg.public_ip_source.clone();
    if source.is_empty() || cfg.public_ip_recheck_interval.is_zero() {
        return;
    }
    let rebuild_peers = cfg.public_ip_recheck_rebuild_peers;
    info!(
        source,
        interval = ?cfg.public_ip_recheck_interval,
        rebuild_peers,
        "PUBLIC_IP monitor enabled"
    );

    let mut ticker = tokio::time::interval(cfg.public_ip_recheck_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker.tick().await; // the first tick completes immediately

    loop {
        ticker.tick().await;

        let src = source.clone();
        let resolved = tokio::task::spawn_blocking(move || resolve_public_ip(&src))
            .await
            .unwrap_or(None);

        let current = hub.engine().config();
        if resolved.is_none() && current.public_ip.is_some() {
            warn!(
                keeping = ?current.public_ip,
                "PUBLIC_IP resolution temporarily failed, keeping previous IP"
            );
            continue;
        }
        let next = RtcConfig {
            public_ip: resolved,
            ..current.clone()
        };
        if next == current {
            continue;
        }

        hub.apply_rtc_config(next, rebuild_peers).await;
    }
}
