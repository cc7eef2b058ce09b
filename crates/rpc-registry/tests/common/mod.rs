//! Common test utilities for registry integration tests

#![allow(dead_code)]

use futures::channel::mpsc::UnboundedReceiver;
use rpc_registry::{
    Connection, Endpoint, Envelope, MessageKind, Registration, SerializerKind, ServiceKey,
};
use serde::Serialize;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

/// Test timeout for async operations
pub const TEST_TIMEOUT: Duration = Duration::from_secs(10);

/// A connection whose writer side is a plain channel
pub struct ChannelPeer {
    /// Handle given to the engine or stub
    pub connection: Connection,
    rx: UnboundedReceiver<Envelope>,
}

impl ChannelPeer {
    /// Peer at `10.0.0.<host>:<port>`
    pub fn new(host: u8, port: u16) -> Self {
        let addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::new(10, 0, 0, host)), port);
        let (connection, rx) = Connection::new(addr);
        Self { connection, rx }
    }

    /// Everything queued so far
    pub fn drain(&mut self) -> Vec<Envelope> {
        let mut out = Vec::new();
        while let Ok(envelope) = self.rx.try_recv() {
            out.push(envelope);
        }
        out
    }

    /// Drain and keep only envelopes of `kind`
    pub fn drain_kind(&mut self, kind: MessageKind) -> Vec<Envelope> {
        self.drain().into_iter().filter(|e| e.kind == kind).collect()
    }
}

/// Service key `com.example/1.0/<name>`
pub fn key(name: &str) -> ServiceKey {
    ServiceKey::new("com.example", "1.0", name)
}

/// Registration of `key` at `host:port`
pub fn registration(key: &ServiceKey, host: &str, port: u16) -> Registration {
    Registration::new(Endpoint::new(host, port), key.clone())
}

/// JSON envelope carrying `payload`
pub fn request<T: Serialize>(sequence_id: i64, kind: MessageKind, payload: &T) -> Envelope {
    Envelope::new(sequence_id, kind, SerializerKind::Json, payload).unwrap()
}

/// Acknowledgment for `sequence_id`
pub fn ack(sequence_id: i64) -> Envelope {
    Envelope::ack(sequence_id, SerializerKind::Json).unwrap()
}
