//! Customer Screen - live order board for one branch.
//!
//! Keeps an in-memory order set fed by periodic snapshots from the order API
//! and by pushes over a Socket.IO channel, and derives what the screen shows:
//! two lanes (preparing / ready), a one-at-a-time interstitial for each pushed
//! order, and a banner while the channel is down.
//!
//! The binary is a headless renderer: it logs every view change.

pub mod channel;
pub mod config;
pub mod error;
pub mod filter;
pub mod liveness;
pub mod logging;
pub mod order;
pub mod queue;
pub mod session;
pub mod snapshot;
pub mod storage;
pub mod store;

use std::sync::Arc;

use anyhow::Context;
use tracing::{info, warn};

use crate::channel::SocketIoConnector;
use crate::config::ScreenConfig;
use crate::session::{DisplaySession, ScreenContent, ScreenView};
use crate::snapshot::HttpSnapshotFetcher;

pub use crate::error::{Result, ScreenError};

fn log_view(view: &ScreenView) {
    if let Some(banner) = &view.banner {
        warn!(state = ?view.liveness, "{banner}");
    }
    match &view.content {
        ScreenContent::Interstitial(entry) => info!(
            seq = entry.seq,
            number = %entry.order.number,
            status = %entry.order.status,
            "Order notification"
        ),
        ScreenContent::Lanes(lanes) => info!(
            preparing = ?lanes.preparing_numbers(),
            ready = ?lanes.ready_numbers(),
            "Order board"
        ),
    }
}

async fn serve(config: ScreenConfig) -> anyhow::Result<()> {
    let snapshots = Arc::new(HttpSnapshotFetcher::new(&config.api_base_url)?);
    let connector = Arc::new(SocketIoConnector::new(
        &config.socket_base_url,
        &config.branch_id,
        config.branch_key.clone(),
    )?);

    let mut session = DisplaySession::new(config, snapshots, connector);
    let mut view = session.start();
    info!(session_id = %session.id(), "Customer screen running");
    log_view(&view.borrow_and_update());

    loop {
        tokio::select! {
            signal = tokio::signal::ctrl_c() => {
                signal.context("Failed to listen for shutdown signal")?;
                info!("Shutdown requested");
                break;
            }
            changed = view.changed() => {
                if changed.is_err() {
                    warn!("Display session ended unexpectedly");
                    break;
                }
                let current = view.borrow_and_update().clone();
                log_view(&current);
            }
        }
    }

    session.stop().await;
    Ok(())
}

/// Entry point for the `customer-screen` binary. `display_url` is the screen's
/// display URL (`…/display/<branchId>`), when given on the command line.
pub fn run(display_url: Option<String>) -> anyhow::Result<()> {
    let log_dir = logging::init_logging();
    info!(
        version = env!("CARGO_PKG_VERSION"),
        git_sha = env!("BUILD_GIT_SHA"),
        built = env!("BUILD_TIMESTAMP"),
        log_dir = %log_dir.display(),
        "Starting Customer Screen"
    );

    let config = ScreenConfig::from_env(display_url).context("Failed to load configuration")?;
    info!(config = ?config, "Configuration loaded");

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to start async runtime")?;
    runtime.block_on(serve(config))
}
