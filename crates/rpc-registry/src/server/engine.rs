//! Registry server protocol engine
//!
//! Applies publish, cancel, subscribe and ack messages to the
//! [`RegistryStore`], fans full-state pushes out to subscribed sessions and
//! cascades cleanup when a connection goes away. Nothing here touches a
//! socket: sessions are reached through their [`Connection`] handles.

use super::session::{Session, SessionTable};
use crate::config::ServerConfig;
use crate::connection::{Connection, ConnectionId};
use crate::error::Result;
use crate::ledger::{PendingAck, PendingAckLedger};
use crate::models::{Endpoint, Registration, RegistryPush, ServiceKey};
use crate::protocol::{Envelope, MessageKind, SerializerKind};
use crate::store::RegistryStore;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::{Duration, Instant};
use tracing::{debug, info, trace, warn};

/// Table version a push was taken at
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionStamp {
    /// Service the push belongs to
    pub service_key: ServiceKey,
    /// Version carried by the push
    pub version: i64,
}

type ServerLedger = PendingAckLedger<(i64, ConnectionId), VersionStamp>;

/// Server-side registry state machine
#[derive(Debug)]
pub struct ServerEngine {
    store: RegistryStore,
    sessions: SessionTable,
    pending: ServerLedger,
    sequence: AtomicI64,
    serializer: SerializerKind,
    ack_timeout: Duration,
}

impl ServerEngine {
    /// Create an engine with an empty store
    pub fn new(config: &ServerConfig) -> Self {
        Self {
            store: RegistryStore::new(),
            sessions: SessionTable::new(),
            pending: PendingAckLedger::new(),
            sequence: AtomicI64::new(0),
            serializer: config.serializer,
            ack_timeout: config.ack_timeout(),
        }
    }

    /// Registration state
    pub fn store(&self) -> &RegistryStore {
        &self.store
    }

    /// Live sessions
    pub fn sessions(&self) -> &SessionTable {
        &self.sessions
    }

    /// Number of pushes awaiting acknowledgment
    pub fn pending_acks(&self) -> usize {
        self.pending.len()
    }

    fn next_sequence_id(&self) -> i64 {
        self.sequence.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Start tracking a freshly accepted connection
    pub fn open(&self, connection: Connection) -> Arc<Session> {
        info!(
            "Registry connection {} opened from {}",
            connection.id(),
            connection.remote_addr()
        );
        self.sessions.open(connection)
    }

    /// Apply one inbound envelope
    pub fn handle(&self, id: ConnectionId, envelope: Envelope) -> Result<()> {
        let Some(session) = self.sessions.get(id) else {
            debug!("Dropping {:?} for closed connection {}", envelope.kind, id);
            return Ok(());
        };

        match envelope.kind {
            MessageKind::PublishService => {
                let registration: Registration = envelope.payload()?;
                self.publish(&session, registration)?;
                self.ack(&session, envelope.sequence_id)
            }
            MessageKind::PublishCancelService => {
                let registration: Registration = envelope.payload()?;
                self.publish_cancel(&session, registration)?;
                self.ack(&session, envelope.sequence_id)
            }
            MessageKind::SubscribeService => {
                let key: ServiceKey = envelope.payload()?;
                self.subscribe(&session, key)?;
                self.ack(&session, envelope.sequence_id)
            }
            MessageKind::Ack => {
                if !self.pending.remove_if_present(&(envelope.sequence_id, id)) {
                    trace!("Ack {} from {} matched nothing", envelope.sequence_id, id);
                }
                Ok(())
            }
            MessageKind::Heartbeat => {
                trace!("Heartbeat from {}", id);
                Ok(())
            }
            MessageKind::OfflineNotice => {
                warn!("Ignoring offline notice sent by client {}", id);
                Ok(())
            }
        }
    }

    fn ack(&self, session: &Session, sequence_id: i64) -> Result<()> {
        session
            .connection()
            .send(Envelope::ack(sequence_id, self.serializer)?);
        Ok(())
    }

    fn fill_host(session: &Session, mut registration: Registration) -> Registration {
        if !registration.endpoint.has_host() {
            registration.endpoint.host = session.connection().remote_addr().ip().to_string();
        }
        registration
    }

    fn publish(&self, session: &Session, registration: Registration) -> Result<()> {
        let registration = Self::fill_host(session, registration);
        let key = registration.service_key.clone();
        debug!("Publish {} at {} from {}", key, registration.endpoint, session.id());

        session.publish(registration.clone());
        let mutation = self.store.upsert(&key, registration);
        if mutation.changed {
            self.broadcast(
                MessageKind::PublishService,
                RegistryPush {
                    service_key: key,
                    registrations: mutation.snapshot,
                    version: mutation.version,
                },
            )?;
        }
        Ok(())
    }

    fn publish_cancel(&self, session: &Session, registration: Registration) -> Result<()> {
        let registration = Self::fill_host(session, registration);
        let key = registration.service_key.clone();
        debug!("Cancel {} at {} from {}", key, registration.endpoint, session.id());

        session.unpublish(&registration);
        self.cancel(&key, &registration.endpoint)
    }

    fn cancel(&self, key: &ServiceKey, endpoint: &Endpoint) -> Result<()> {
        let removal = self.store.remove(key, endpoint);
        if removal.removed.is_some() {
            self.broadcast(
                MessageKind::PublishCancelService,
                RegistryPush {
                    service_key: key.clone(),
                    registrations: removal.snapshot,
                    version: removal.version,
                },
            )?;
        }
        Ok(())
    }

    fn subscribe(&self, session: &Session, key: ServiceKey) -> Result<()> {
        debug!("Subscribe {} from {}", key, session.id());
        session.subscribe(key.clone());

        let (registrations, version) = self.store.snapshot(&key);
        if !registrations.is_empty() {
            let push = RegistryPush {
                service_key: key,
                registrations,
                version,
            };
            self.push(session, MessageKind::PublishService, &push)?;
        }
        Ok(())
    }

    fn broadcast(&self, kind: MessageKind, push: RegistryPush) -> Result<()> {
        for session in self.sessions.subscribers_of(&push.service_key) {
            self.push(&session, kind, &push)?;
        }
        Ok(())
    }

    fn push(&self, session: &Session, kind: MessageKind, push: &RegistryPush) -> Result<()> {
        let sequence_id = self.next_sequence_id();
        let envelope = Envelope::new(sequence_id, kind, self.serializer, push)?;
        let key = (sequence_id, session.id());

        self.pending.put(
            key,
            PendingAck::new(
                envelope.clone(),
                session.id(),
                VersionStamp {
                    service_key: push.service_key.clone(),
                    version: push.version,
                },
            ),
        );
        if !session.connection().send(envelope) {
            self.pending.remove_if_present(&key);
        }
        Ok(())
    }

    /// Forget a connection and withdraw everything it published.
    ///
    /// Each withdrawn registration is broadcast as a cancel; afterwards every
    /// subscriber gets one unacknowledged offline notice per endpoint.
    /// Registrations that another live session also published stay in place,
    /// and their endpoints are not reported offline.
    pub fn close(&self, id: ConnectionId) {
        let Some(session) = self.sessions.remove(id) else {
            return;
        };
        session.connection().close();

        // a provider that reconnected before its old socket was noticed dead
        // still owns whatever it republished on the new connection
        let published = session.published_endpoints();
        let endpoints: Vec<Endpoint> = published
            .iter()
            .filter(|endpoint| !self.sessions.any_published_from(endpoint))
            .cloned()
            .collect();
        for endpoint in &published {
            for key in self.store.service_keys_by_endpoint(endpoint) {
                if !session.published_at(&key, endpoint)
                    || self.sessions.any_published_at(&key, endpoint)
                {
                    continue;
                }
                if let Err(e) = self.cancel(&key, endpoint) {
                    warn!("Failed to cancel {} at {}: {}", key, endpoint, e);
                }
            }
        }

        if !endpoints.is_empty() {
            let subscribers = self.sessions.subscribers();
            for endpoint in &endpoints {
                info!("Provider {} went offline", endpoint);
                for subscriber in &subscribers {
                    match Envelope::new(
                        self.next_sequence_id(),
                        MessageKind::OfflineNotice,
                        self.serializer,
                        endpoint,
                    ) {
                        Ok(notice) => {
                            subscriber.connection().send(notice);
                        }
                        Err(e) => warn!("Failed to encode offline notice: {}", e),
                    }
                }
            }
        }

        info!(
            "Registry connection {} from {} closed",
            id,
            session.connection().remote_addr()
        );
    }

    /// Resend pushes that have waited longer than the ack timeout.
    ///
    /// Entries for closed connections and entries whose version has since
    /// been superseded are dropped instead. Returns the number resent.
    pub fn retransmit_expired(&self, now: Instant) -> usize {
        let mut resent = 0;
        self.pending
            .for_each_expired(now, self.ack_timeout, |key, mut pending| {
                let Some(session) = self.sessions.get(pending.connection) else {
                    return;
                };
                if !session.connection().is_active() {
                    return;
                }
                let current = self.store.current_version(&pending.meta.service_key);
                if current > pending.meta.version {
                    debug!(
                        "Dropping stale push {} for {} (version {} < {})",
                        key.0, pending.meta.service_key, pending.meta.version, current
                    );
                    return;
                }

                warn!(
                    "Resending push {} for {} to {}",
                    key.0, pending.meta.service_key, pending.connection
                );
                if session.connection().send(pending.envelope.clone()) {
                    pending.sent_at = now;
                    self.pending.rearm(key, pending);
                    resent += 1;
                }
            });
        resent
    }
}
