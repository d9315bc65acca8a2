//! TCP listener serving a registry over binary connections

use crate::config::ServerConfig;
use crate::registry::Registry;
use crate::server::ServerConnection;
use crate::{lock, Result};
use std::fmt;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, info, warn};

/// Accepts TCP connections and serves each with a [`ServerConnection`]
pub struct TcpServer {
    config: ServerConfig,
    registry: Arc<Registry>,
    local_addr: SocketAddr,
    /// Listener until [`TcpServer::start`] hands it to the accept loop
    listener: Mutex<Option<TcpListener>>,
    running: Mutex<Option<(oneshot::Sender<()>, JoinHandle<()>)>>,
}

impl TcpServer {
    /// Bind the listener at `config.host:config.tcp_port`
    pub async fn bind(config: ServerConfig, registry: Arc<Registry>) -> Result<Self> {
        let listener = TcpListener::bind(config.tcp_addr()).await?;
        let local_addr = listener.local_addr()?;
        info!(%local_addr, "TCP listener bound");

        Ok(Self {
            config,
            registry,
            local_addr,
            listener: Mutex::new(Some(listener)),
            running: Mutex::new(None),
        })
    }

    /// Address the listener is bound to
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Registry served to every connection
    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    /// Whether the accept loop is running
    pub fn is_running(&self) -> bool {
        lock(&self.running).is_some()
    }

    /// Start accepting connections in the background.
    ///
    /// Starting twice, or after [`TcpServer::stop`], does nothing.
    pub fn start(&self) {
        let Some(listener) = lock(&self.listener).take() else {
            warn!(port = self.local_addr.port(), "TCP server already started");
            return;
        };

        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let task = tokio::spawn(accept_loop(
            listener,
            Arc::clone(&self.registry),
            self.config.clone(),
            shutdown_rx,
        ));
        *lock(&self.running) = Some((shutdown_tx, task));
        info!(port = self.local_addr.port(), "TCP server started");
    }

    /// Stop accepting and drop every open connection
    pub async fn stop(&self) {
        let Some((shutdown_tx, task)) = lock(&self.running).take() else {
            return;
        };
        let _ = shutdown_tx.send(());
        if let Err(e) = task.await {
            if !e.is_cancelled() {
                error!("Accept loop panicked: {}", e);
            }
        }
        info!(port = self.local_addr.port(), "TCP server stopped");
    }
}

impl fmt::Display for TcpServer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TcpServer {{ Port: {} }}", self.local_addr.port())
    }
}

impl fmt::Debug for TcpServer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TcpServer")
            .field("local_addr", &self.local_addr)
            .field("running", &self.is_running())
            .finish()
    }
}

async fn accept_loop(
    listener: TcpListener,
    registry: Arc<Registry>,
    config: ServerConfig,
    mut shutdown_rx: oneshot::Receiver<()>,
) {
    let mut connections = JoinSet::new();

    loop {
        tokio::select! {
            _ = &mut shutdown_rx => {
                debug!(open = connections.len(), "Shutting down accept loop");
                break;
            }

            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    connections.spawn(serve_stream(stream, peer, Arc::clone(&registry), config.clone()));
                }
                Err(e) => {
                    error!("Accept failed: {}", e);
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            },

            Some(finished) = connections.join_next(), if !connections.is_empty() => {
                if let Err(e) = finished {
                    if e.is_panic() {
                        error!("Connection task panicked: {}", e);
                    }
                }
            }
        }
    }

    connections.shutdown().await;
}

async fn serve_stream(stream: TcpStream, peer: SocketAddr, registry: Arc<Registry>, config: ServerConfig) {
    if let Err(e) = stream.set_nodelay(true) {
        debug!(%peer, "Could not disable Nagle: {}", e);
    }
    let (reader, writer) = stream.into_split();

    match ServerConnection::accept(reader, writer, registry, &config).await {
        Ok(connection) => {
            info!(%peer, session = %connection.session_id(), "Accepted connection");
            if let Err(e) = connection.run().await {
                warn!(%peer, "Connection ended with error: {}", e);
            }
        }
        Err(e) => warn!(%peer, "Failed to set up connection: {}", e),
    }
}
