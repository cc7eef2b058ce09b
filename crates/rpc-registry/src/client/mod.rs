//! Registry client
//!
//! [`RegistryClient`] is a cheap, cloneable facade over a [`ClientStub`]
//! (protocol state) and a [`Watchdog`] (reconnect supervision).
//! [`RegistryClient::connect`] performs the first connect and hands back a
//! driver future that keeps the connection alive; the caller decides which
//! executor runs it.

mod stub;
mod watchdog;

pub use stub::{ClientStub, Intent};
pub use watchdog::{MAX_BACKOFF_ATTEMPTS, Watchdog, WatchdogState, backoff_delay};

use crate::config::ClientConfig;
use crate::connection::{Connection, ConnectionId, DriveOptions, drive};
use crate::error::{Error, Result};
use crate::models::{NotifyListener, OfflineListener, Registration, ServiceKey};
use crate::protocol::{CLIENT_ACCEPTS, Envelope};
use async_io::Timer;
use async_net::TcpStream;
use futures::FutureExt;
use futures::channel::mpsc::UnboundedReceiver;
use futures::future::BoxFuture;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

/// Future that supervises a client connection until shutdown
pub type ClientDriver = BoxFuture<'static, ()>;

/// An established socket paired with the connection installed in the stub
struct Link {
    stream: TcpStream,
    id: ConnectionId,
    outbound: UnboundedReceiver<Envelope>,
}

/// Registry client handle
#[derive(Clone)]
pub struct RegistryClient {
    stub: Arc<ClientStub>,
    watchdog: Arc<Watchdog>,
    config: ClientConfig,
}

impl RegistryClient {
    /// Create a client; nothing is sent until [`connect`](Self::connect)
    pub fn new(config: ClientConfig) -> Self {
        Self {
            stub: Arc::new(ClientStub::new(&config)),
            watchdog: Arc::new(Watchdog::new(config.reconnect)),
            config,
        }
    }

    /// Protocol state
    pub fn stub(&self) -> &Arc<ClientStub> {
        &self.stub
    }

    /// Connection supervisor
    pub fn watchdog(&self) -> &Arc<Watchdog> {
        &self.watchdog
    }

    /// Current connection state
    pub fn watchdog_state(&self) -> WatchdogState {
        self.watchdog.state()
    }

    /// Subscribe to `key`; the listener sees every applied push for it
    pub fn subscribe(
        &self,
        key: ServiceKey,
        listener: impl NotifyListener + 'static,
    ) -> Result<()> {
        self.stub.subscribe(key, Arc::new(listener))
    }

    /// Publish a registration, replayed on every reconnect until withdrawn
    pub fn register(&self, registration: Registration) -> Result<()> {
        self.stub.register(registration)
    }

    /// Withdraw a registration
    pub fn unregister(&self, registration: Registration) -> Result<()> {
        self.stub.unregister(registration)
    }

    /// Listen for offline notices
    pub fn on_offline(&self, listener: impl OfflineListener + 'static) {
        self.stub.add_offline_listener(Arc::new(listener));
    }

    /// Last registration list applied for `key`
    pub fn lookup(&self, key: &ServiceKey) -> Vec<Registration> {
        self.stub.lookup(key)
    }

    /// Enable or suppress automatic reconnects
    pub fn set_reconnect(&self, enabled: bool) {
        self.watchdog.set_reconnect(enabled);
    }

    /// Withdraw published registrations, stop reconnecting and close the
    /// connection once queued frames flush.
    ///
    /// Unregisters issued after this are sent without ack tracking.
    pub fn shutdown(&self) {
        info!("Shutting down registry client");
        self.stub.shutdown();
        self.watchdog.close();
    }

    /// Connect to the configured server address
    pub async fn connect_configured(&self) -> Result<ClientDriver> {
        let addr = self.config.resolve_server_addr()?;
        self.connect(addr).await
    }

    /// Connect to `addr`.
    ///
    /// A failed first attempt is reported as [`Error::ConnectFailed`] and
    /// nothing is started. On success the returned future supervises the
    /// connection (reconnecting with backoff) and retransmits unacknowledged
    /// requests until [`shutdown`](Self::shutdown).
    pub async fn connect(&self, addr: SocketAddr) -> Result<ClientDriver> {
        self.watchdog.begin_connect();
        let stream = match TcpStream::connect(addr).await {
            Ok(stream) => stream,
            Err(source) => {
                let _ = self.watchdog.connect_failed();
                return Err(Error::ConnectFailed { addr, source });
            }
        };
        let link = establish(&self.stub, &self.watchdog, stream, addr)?;

        let options = DriveOptions {
            accepts: CLIENT_ACCEPTS,
            max_body_length: self.config.max_body_length,
            reader_idle_timeout: None,
            heartbeat_interval: self.config.heartbeat_interval(),
            serializer: self.config.serializer,
        };
        let supervisor = supervise(
            self.stub.clone(),
            self.watchdog.clone(),
            options,
            addr,
            link,
        );
        let retransmitter = retransmit(
            self.stub.clone(),
            self.watchdog.clone(),
            self.config.clone(),
        );

        Ok(futures::future::join(supervisor, retransmitter)
            .map(|_| ())
            .boxed())
    }
}

fn establish(
    stub: &ClientStub,
    watchdog: &Watchdog,
    stream: TcpStream,
    addr: SocketAddr,
) -> Result<Link> {
    let (connection, outbound) = Connection::new(addr);
    let id = connection.id();
    watchdog.connected();
    stub.connection_active(connection)?;
    Ok(Link {
        stream,
        id,
        outbound,
    })
}

async fn run_link(stub: &ClientStub, link: Link, options: DriveOptions) {
    let Link {
        stream,
        id,
        outbound,
    } = link;
    let result = drive(stream, outbound, options, |envelope| {
        if let Err(e) = stub.handle(envelope) {
            warn!("Error processing registry message: {}", e);
        }
    })
    .await;
    if let Err(e) = result {
        warn!("Registry connection {} failed: {}", id, e);
    }
    stub.connection_inactive(id);
}

async fn supervise(
    stub: Arc<ClientStub>,
    watchdog: Arc<Watchdog>,
    options: DriveOptions,
    addr: SocketAddr,
    first: Link,
) {
    let mut link = Some(first);
    loop {
        let delay = match link.take() {
            Some(current) => {
                run_link(&stub, current, options.clone()).await;
                watchdog.disconnected()
            }
            None => {
                watchdog.begin_connect();
                match TcpStream::connect(addr).await {
                    Ok(stream) => match establish(&stub, &watchdog, stream, addr) {
                        Ok(established) => {
                            info!("Reconnected to registry at {}", addr);
                            link = Some(established);
                            continue;
                        }
                        Err(e) => {
                            warn!("Failed to restore registry state: {}", e);
                            watchdog.disconnected()
                        }
                    },
                    Err(e) => {
                        warn!("Reconnect to {} failed: {}", addr, e);
                        watchdog.connect_failed()
                    }
                }
            }
        };

        if !watchdog.wait(delay).await {
            debug!("Registry client closed, supervisor exiting");
            break;
        }
    }
}

async fn retransmit(stub: Arc<ClientStub>, watchdog: Arc<Watchdog>, config: ClientConfig) {
    let interval = config.retransmit_interval();
    loop {
        Timer::after(interval).await;
        if watchdog.is_closed() {
            break;
        }
        stub.retransmit_expired(Instant::now());
    }
}
