use std::net::SocketAddr;
use std::sync::Arc;

use axum::routing::get;
use axum::Router;
use tracing::{info, Level};

use parley_server::config::Config;
use parley_server::hub::{gc, Hub};
use parley_server::rtc::engine::run_public_ip_monitor;
use parley_server::signaling::admission::{run_sweeper, Admission};
use parley_server::signaling::ws_handler;
use parley_server::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt().with_max_level(Level::INFO).init();

    let cfg = Arc::new(Config::from_env());
    let hub = Hub::new(&cfg)?;

    tokio::spawn(gc::run(hub.clone()));

    let admission = Admission::new();
    tokio::spawn(run_sweeper(admission.clone()));

    if !cfg.public_ip_recheck_interval.is_zero() {
        tokio::spawn(run_public_ip_monitor(hub.clone(), cfg.clone()));
    }

    let state = AppState {
        hub,
        admission,
        cfg: cfg.clone(),
    };

    let app = Router::new()
        .route("/ws", get(ws_handler))
        .with_state(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], cfg.port));
    info!("parley server listening on {addr}");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await?;

    Ok(())
}
