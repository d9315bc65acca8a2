//! Remoting host binary
//!
//! Publishes the demo objects and serves them until interrupted.

use anyhow::{Context, Result};
use clap::Parser;
use remoting::{Registry, TcpServer};
use remoting_host::{objects, Cli, HostConfig};
use std::sync::Arc;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let config = HostConfig::from_cli(&cli)?;

    let registry = Arc::new(Registry::new());
    if objects::publish(&registry, &config.objects) == 0 {
        warn!("No objects published");
    }

    let tcp = TcpServer::bind(config.server.clone(), Arc::clone(&registry))
        .await
        .context("Failed to bind TCP listener")?;
    tcp.start();
    info!("{}", tcp);

    #[cfg(feature = "http")]
    let http = if config.http {
        let http = remoting::HttpServer::bind(config.server.clone(), Arc::clone(&registry))
            .await
            .context("Failed to bind HTTP listener")?;
        http.start();
        info!("{}", http);
        Some(http)
    } else {
        None
    };

    info!(objects = ?registry.names(), "Host ready, press Ctrl-C to stop");
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to wait for Ctrl-C: {}", e);
    }

    info!("Shutting down");
    tcp.stop().await;
    #[cfg(feature = "http")]
    if let Some(http) = http {
        http.stop().await;
    }
    Ok(())
}
