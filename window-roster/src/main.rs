//! Window Roster - Main entry point
//!
//! This binary keeps the window roster refreshed as a daemon and prints each
//! refresh as a JSON line.

use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;
use window_roster::sources::unavailable::{NoAccessibility, NoCapture, NoSpaces, NoStreams};
use window_roster::sources::window_server::CoreGraphicsWindowServer;
use window_roster::{Config, Providers, RefreshReport, WindowRoster, WindowSummary};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load configuration first so its log level can seed the filter
    let config = Config::load();

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.general.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    info!("Starting Window Roster");
    info!("Configuration path {:?}", Config::default_config_path());

    if !config.general.enabled {
        info!("Roster is disabled in configuration, exiting");
        return Ok(());
    }

    // The window server doubles as the owner source; everything else needs
    // platform permissions this daemon does not request
    let window_server = Arc::new(CoreGraphicsWindowServer::new());
    let providers = Providers {
        primary: Arc::new(NoCapture),
        accessibility: Arc::new(NoAccessibility),
        window_server: window_server.clone(),
        spaces: Arc::new(NoSpaces),
        owners: window_server,
        streams: Arc::new(NoStreams),
    };

    let roster = Arc::new(WindowRoster::new(config.clone(), providers));
    let interval = config.general.refresh_interval();

    let runner = {
        let roster = roster.clone();
        tokio::spawn(async move {
            let printer = roster.clone();
            roster
                .run(interval, move |report| print_refresh(&printer, report))
                .await;
        })
    };

    tokio::signal::ctrl_c().await?;
    info!("Received Ctrl+C, shutting down...");

    roster.shutdown().await;
    if let Err(e) = runner.await {
        error!("Refresh loop ended abnormally: {}", e);
    }

    let status = roster.status();
    info!(
        "Stopped after {} refresh passes, {} windows known",
        status.refresh_passes, status.windows
    );
    Ok(())
}

fn print_refresh(roster: &WindowRoster, report: &RefreshReport) {
    let windows: Vec<WindowSummary> = roster
        .list_windows(None)
        .iter()
        .map(|record| record.summary())
        .collect();

    let line = serde_json::json!({
        "refresh": report,
        "windows": windows,
    });
    println!("{}", line);
}
