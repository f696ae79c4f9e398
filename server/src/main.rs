use clap::Parser;
use log::{error, info, LevelFilter};
use server::command_center::CommandCenter;
use server::config::{load_catalog, ServerArgs, ServerConfig};
use server::monitor::HostSampler;
use server::transport::NetworkServer;
use std::fs::OpenOptions;
use std::sync::Arc;
use tokio::sync::watch;

/// Parses arguments, loads the catalog, then runs the WebSocket server and
/// the command center until interrupted.
#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = ServerConfig::from(ServerArgs::parse());
    init_logging(&config)?;

    let games = match load_catalog(&config.catalog_path) {
        Ok(games) => games,
        Err(e) => {
            error!("critical: {}", e);
            return Err(e.into());
        }
    };

    let server = match NetworkServer::bind(&config.bind_address, config.max_connections).await {
        Ok(server) => server.with_idle_timeout(config.idle_timeout),
        Err(e) => {
            error!("critical: failed to bind {}: {}", config.bind_address, e);
            return Err(e.into());
        }
    };

    let center = Arc::new(CommandCenter::new(
        games,
        Arc::new(server.hub()),
        HostSampler::new(),
        config.center.clone(),
    ));
    center.start();

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut server_handle = tokio::spawn(server.run(center.clone(), shutdown_rx));

    tokio::select! {
        result = &mut server_handle => {
            if let Err(e) = result {
                error!("critical: network task panicked: {}", e);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down gracefully...");
        }
        _ = terminate_signal() => {
            info!("Received SIGTERM, shutting down gracefully...");
        }
    }

    // No frame may reach the center once its shutdown starts.
    let _ = shutdown_tx.send(true);
    if !server_handle.is_finished() {
        let _ = server_handle.await;
    }
    center.shutdown().await;

    info!("Server stopped");
    Ok(())
}

fn init_logging(config: &ServerConfig) -> std::io::Result<()> {
    let level = if config.verbose {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    };

    let mut builder = env_logger::Builder::new();
    builder.filter_level(level).parse_default_env();

    if let Some(path) = &config.log_file {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        builder.target(env_logger::Target::Pipe(Box::new(file)));
    }

    builder.init();
    Ok(())
}

#[cfg(unix)]
async fn terminate_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    match signal(SignalKind::terminate()) {
        Ok(mut sigterm) => {
            sigterm.recv().await;
        }
        Err(e) => {
            error!("Failed to install SIGTERM handler: {}", e);
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(not(unix))]
async fn terminate_signal() {
    std::future::pending::<()>().await;
}
