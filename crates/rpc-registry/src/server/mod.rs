//! Registry server
//!
//! [`RegistryServer`] owns the listener and the [`ServerEngine`]. Like the
//! rest of the crate it is runtime-agnostic: it hands back futures
//! ([`ConnectionHandler::handle`], [`RegistryServer::run_retransmitter`])
//! and leaves spawning to the caller.

mod engine;
mod session;

pub use engine::{ServerEngine, VersionStamp};
pub use session::{Session, SessionTable};

use crate::config::ServerConfig;
use crate::connection::{Connection, DriveOptions, drive};
use crate::error::Result;
use crate::protocol::SERVER_ACCEPTS;
use async_io::Timer;
use async_net::{TcpListener, TcpStream};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info};

/// Registry server
pub struct RegistryServer {
    engine: Arc<ServerEngine>,
    /// The TCP listener
    pub listener: TcpListener,
    config: ServerConfig,
}

impl RegistryServer {
    /// Bind the configured listen address
    pub async fn bind(config: ServerConfig) -> Result<Self> {
        let listener = TcpListener::bind(config.listen_addr.as_str()).await?;
        info!("Registry server listening on {}", listener.local_addr()?);

        Ok(Self {
            engine: Arc::new(ServerEngine::new(&config)),
            listener,
            config,
        })
    }

    /// Address actually bound
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Get the engine reference
    pub fn engine(&self) -> &Arc<ServerEngine> {
        &self.engine
    }

    /// Accept a new connection
    pub async fn accept(&self) -> Result<ConnectionHandler> {
        let (stream, addr) = self.listener.accept().await?;
        debug!("New registry connection from {}", addr);

        Ok(ConnectionHandler {
            stream,
            addr,
            engine: self.engine.clone(),
            options: DriveOptions {
                accepts: SERVER_ACCEPTS,
                max_body_length: self.config.max_body_length,
                reader_idle_timeout: self.config.reader_idle_timeout(),
                heartbeat_interval: None,
                serializer: self.config.serializer,
            },
        })
    }

    /// Periodic ack-timeout scan. Ends once the server is dropped.
    pub fn run_retransmitter(&self) -> impl Future<Output = ()> + Send + 'static {
        let engine = Arc::downgrade(&self.engine);
        let interval = self.config.retransmit_interval();
        async move {
            loop {
                Timer::after(interval).await;
                let Some(engine) = engine.upgrade() else {
                    debug!("Registry server gone, retransmitter exiting");
                    break;
                };
                engine.retransmit_expired(Instant::now());
            }
        }
    }
}

/// Drives one accepted connection
pub struct ConnectionHandler {
    stream: TcpStream,
    addr: SocketAddr,
    engine: Arc<ServerEngine>,
    options: DriveOptions,
}

impl ConnectionHandler {
    /// Peer address
    pub fn remote_addr(&self) -> SocketAddr {
        self.addr
    }

    /// Handle the connection until it closes, then run disconnect cleanup
    pub async fn handle(self) -> Result<()> {
        let (connection, outbound) = Connection::new(self.addr);
        let id = connection.id();
        self.engine.open(connection);

        let engine = self.engine.clone();
        let result = drive(self.stream, outbound, self.options, |envelope| {
            if let Err(e) = engine.handle(id, envelope) {
                error!("Error processing message from {}: {}", self.addr, e);
            }
        })
        .await;

        if let Err(e) = &result {
            error!("Registry connection {} from {} failed: {}", id, self.addr, e);
        }
        self.engine.close(id);
        result
    }
}
