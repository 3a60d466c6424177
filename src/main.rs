use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio::sync::mpsc;
use tracing::{error, info};

use driftwood::cli::{self, Cli, Commands};
use driftwood::config::Config;
use driftwood::delivery::{spawn_delivery_pump, spawn_ui_logger, DownloadsSink};
use driftwood::discovery::{Discovery, LogDiscovery};
use driftwood::engine::Negotiator;
use driftwood::registry::SessionRegistry;
use driftwood::transfer::TransferCodec;
use driftwood::verification::VerificationManager;
use driftwood::webrtc::WebRtcEngine;
use driftwood::websocket::{router, SignalingState};

#[tokio::main]
async fn main() {
    // Default to INFO level if RUST_LOG is not set
    if std::env::var("RUST_LOG").is_err() {
        std::env::set_var("RUST_LOG", "info");
    }
    tracing_subscriber::fmt::init();

    let cli = Cli::parse();

    if let Some(Commands::Pair { url, code, file }) = cli.command {
        if let Err(e) = cli::run_pair_client(url, code, file).await {
            error!("pairing client error: {e}");
            std::process::exit(1);
        }
        return;
    }

    let config = Config::from_env();
    info!("starting driftwood host on port {}", config.port);
    info!("downloads directory: {}", config.download_dir.display());

    let (verification_tx, verification_rx) = mpsc::unbounded_channel();
    let (transfer_tx, transfer_rx) = mpsc::unbounded_channel();
    let (ui_tx, ui_rx) = mpsc::unbounded_channel();

    let registry = Arc::new(SessionRegistry::new());
    let verification = Arc::new(VerificationManager::new(
        Duration::from_secs(config.verification_timeout_seconds),
        verification_tx,
    ));
    let codec = Arc::new(TransferCodec::new(transfer_tx));
    codec.spawn_idle_sweeper(Duration::from_secs(config.transfer_idle_timeout_seconds));
    let negotiator = Arc::new(Negotiator::new(Arc::new(WebRtcEngine::new())));

    spawn_delivery_pump(
        transfer_rx,
        Arc::new(DownloadsSink::new(config.download_dir.clone())),
        ui_tx.clone(),
    );
    spawn_ui_logger(ui_rx);

    let state = SignalingState::new(
        registry,
        verification,
        verification_rx,
        codec,
        negotiator,
        ui_tx,
    );
    let app = router(state);

    let discovery = LogDiscovery::new(config.service_name.clone());
    discovery.advertise(config.port);

    let addr = format!("0.0.0.0:{}", config.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .expect("Failed to bind to address");

    info!("driftwood listening on {addr}");

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await
    .expect("Failed to start server");
}
