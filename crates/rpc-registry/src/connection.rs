//! Connection handles and the shared socket driver
//!
//! Handlers never touch sockets directly. They push envelopes into a
//! [`Connection`], whose receiving half is drained by [`drive`] on the
//! socket's writer side. That keeps server and client logic testable with
//! nothing more than a channel.

use crate::error::Result;
use crate::protocol::{Envelope, FrameDecoder, MessageKind, SerializerKind, encode};
use async_io::Timer;
use async_net::TcpStream;
use futures::channel::mpsc::{UnboundedReceiver, UnboundedSender, unbounded};
use futures::future::Either;
use futures::{AsyncReadExt, AsyncWriteExt, FutureExt, StreamExt};
use std::fmt;
use std::net::{Shutdown, SocketAddr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::{debug, warn};

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique identity of a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl ConnectionId {
    /// Allocate a fresh id
    pub fn next() -> Self {
        Self(NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Sending half of a live connection
#[derive(Debug, Clone)]
pub struct Connection {
    id: ConnectionId,
    remote_addr: SocketAddr,
    outbound: UnboundedSender<Envelope>,
}

impl Connection {
    /// Create a connection handle and the queue its writer drains
    pub fn new(remote_addr: SocketAddr) -> (Self, UnboundedReceiver<Envelope>) {
        let (outbound, rx) = unbounded();
        (
            Self {
                id: ConnectionId::next(),
                remote_addr,
                outbound,
            },
            rx,
        )
    }

    /// Connection identity
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Peer address
    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    /// Queue an envelope for writing; false if the connection is gone
    pub fn send(&self, envelope: Envelope) -> bool {
        self.outbound.unbounded_send(envelope).is_ok()
    }

    /// Whether the writer is still draining this connection
    pub fn is_active(&self) -> bool {
        !self.outbound.is_closed()
    }

    /// Stop accepting envelopes; the writer flushes what is queued and
    /// then closes the socket
    pub fn close(&self) {
        self.outbound.close_channel();
    }
}

/// Socket driver options
#[derive(Debug, Clone)]
pub(crate) struct DriveOptions {
    /// Message kinds the reader admits
    pub accepts: &'static [MessageKind],
    /// Largest body the reader admits
    pub max_body_length: usize,
    /// Close the connection after this long without inbound bytes
    pub reader_idle_timeout: Option<Duration>,
    /// Write a heartbeat after this long without outbound frames
    pub heartbeat_interval: Option<Duration>,
    /// Serializer stamped on heartbeats
    pub serializer: SerializerKind,
}

/// Pump a socket until either direction finishes.
///
/// Inbound frames are decoded and handed to `on_envelope`; queued outbound
/// envelopes are encoded and written. Returns when the peer closes, the
/// outbound queue is closed, the reader idles out or a decode/I/O error
/// occurs. The socket is shut down before returning.
pub(crate) async fn drive<F>(
    stream: TcpStream,
    outbound: UnboundedReceiver<Envelope>,
    options: DriveOptions,
    mut on_envelope: F,
) -> Result<()>
where
    F: FnMut(Envelope),
{
    let reader = read_frames(stream.clone(), &options, &mut on_envelope);
    let writer = write_frames(stream.clone(), outbound, &options);

    futures::pin_mut!(reader, writer);
    let result = match futures::future::select(reader, writer).await {
        Either::Left((result, _)) => result,
        Either::Right((result, _)) => result,
    };

    let _ = stream.shutdown(Shutdown::Both);
    result
}

async fn read_frames<F>(
    mut stream: TcpStream,
    options: &DriveOptions,
    on_envelope: &mut F,
) -> Result<()>
where
    F: FnMut(Envelope),
{
    let peer = stream.peer_addr().ok();
    let mut decoder = FrameDecoder::new(options.accepts, options.max_body_length);
    let mut buf = vec![0u8; 8192];

    loop {
        let read = match options.reader_idle_timeout {
            Some(idle) => futures::select! {
                read = stream.read(&mut buf).fuse() => read?,
                _ = FutureExt::fuse(Timer::after(idle)) => {
                    warn!("Connection {:?} idle for {:?}, closing", peer, idle);
                    return Ok(());
                }
            },
            None => stream.read(&mut buf).await?,
        };
        if read == 0 {
            debug!("Peer {:?} closed connection", peer);
            return Ok(());
        }
        for envelope in decoder.decode_chunk(&buf[..read])? {
            on_envelope(envelope);
        }
    }
}

async fn write_frames(
    mut stream: TcpStream,
    mut outbound: UnboundedReceiver<Envelope>,
    options: &DriveOptions,
) -> Result<()> {
    loop {
        let next = match options.heartbeat_interval {
            Some(interval) => futures::select! {
                envelope = outbound.next() => envelope,
                _ = FutureExt::fuse(Timer::after(interval)) => Some(Envelope::heartbeat(options.serializer)),
            },
            None => outbound.next().await,
        };
        let Some(envelope) = next else {
            return Ok(());
        };
        stream.write_all(&encode(&envelope)?).await?;
    }
}
