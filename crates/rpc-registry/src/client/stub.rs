//! Client-side protocol state
//!
//! Remembers what this process wants subscribed and published independent
//! of any connection, replays it onto every new connection, applies server
//! pushes to a local view and tracks its own requests until acknowledged.

use crate::config::ClientConfig;
use crate::connection::{Connection, ConnectionId};
use crate::error::Result;
use crate::ledger::{PendingAck, PendingAckLedger};
use crate::models::{
    ChildEvent, Endpoint, NotifyEvent, NotifyListener, OfflineListener, Registration,
    RegistryPush, ServiceKey,
};
use crate::protocol::{Envelope, MessageKind, SerializerKind};
use crate::sync::lock;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::{debug, info, trace, warn};

/// What a pending request was for, checked again before any resend
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Intent {
    /// SUBSCRIBE for a key
    Subscribe(ServiceKey),
    /// PUBLISH of a registration
    Publish(Registration),
    /// PUBLISH_CANCEL of a registration
    Cancel(Registration),
}

/// The connection currently in use and what was already sent on it
#[derive(Debug)]
struct ActiveConnection {
    connection: Connection,
    subscribed: HashSet<ServiceKey>,
    published: HashSet<Registration>,
}

#[derive(Debug, Default)]
struct LocalView {
    registrations: Vec<Registration>,
    applied_version: Option<i64>,
}

/// Client protocol state machine
pub struct ClientStub {
    serializer: SerializerKind,
    ack_timeout: Duration,
    sequence: AtomicI64,
    subscriptions: Mutex<HashMap<ServiceKey, Vec<Arc<dyn NotifyListener>>>>,
    published: Mutex<HashSet<Registration>>,
    offline_listeners: Mutex<Vec<Arc<dyn OfflineListener>>>,
    views: Mutex<HashMap<ServiceKey, LocalView>>,
    current: Mutex<Option<ActiveConnection>>,
    pending: PendingAckLedger<i64, Intent>,
    shutting_down: AtomicBool,
}

impl ClientStub {
    /// Create a stub with no desired state
    pub fn new(config: &ClientConfig) -> Self {
        Self {
            serializer: config.serializer,
            ack_timeout: config.ack_timeout(),
            sequence: AtomicI64::new(0),
            subscriptions: Mutex::new(HashMap::new()),
            published: Mutex::new(HashSet::new()),
            offline_listeners: Mutex::new(Vec::new()),
            views: Mutex::new(HashMap::new()),
            current: Mutex::new(None),
            pending: PendingAckLedger::new(),
            shutting_down: AtomicBool::new(false),
        }
    }

    fn next_sequence_id(&self) -> i64 {
        self.sequence.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Requests awaiting acknowledgment
    pub fn pending_acks(&self) -> usize {
        self.pending.len()
    }

    /// Whether a connection is installed
    pub fn is_connected(&self) -> bool {
        lock(&self.current)
            .as_ref()
            .is_some_and(|active| active.connection.is_active())
    }

    /// Service keys this process wants subscribed
    pub fn subscribed_keys(&self) -> Vec<ServiceKey> {
        let mut keys: Vec<ServiceKey> = lock(&self.subscriptions).keys().cloned().collect();
        keys.sort();
        keys
    }

    /// Registrations this process wants published
    pub fn published_registrations(&self) -> Vec<Registration> {
        lock(&self.published).iter().cloned().collect()
    }

    /// Last applied registration list for a key
    pub fn lookup(&self, key: &ServiceKey) -> Vec<Registration> {
        lock(&self.views)
            .get(key)
            .map(|view| view.registrations.clone())
            .unwrap_or_default()
    }

    /// Subscribe to a service and attach a listener
    pub fn subscribe(&self, key: ServiceKey, listener: Arc<dyn NotifyListener>) -> Result<()> {
        lock(&self.subscriptions)
            .entry(key.clone())
            .or_default()
            .push(listener);

        let mut current = lock(&self.current);
        if let Some(active) = current.as_mut() {
            if active.subscribed.insert(key.clone()) {
                self.send_tracked(
                    active,
                    MessageKind::SubscribeService,
                    &key,
                    Intent::Subscribe(key.clone()),
                )?;
            }
        }
        Ok(())
    }

    /// Announce a registration
    pub fn register(&self, registration: Registration) -> Result<()> {
        lock(&self.published).insert(registration.clone());

        let mut current = lock(&self.current);
        if let Some(active) = current.as_mut() {
            if active.published.insert(registration.clone()) {
                self.send_tracked(
                    active,
                    MessageKind::PublishService,
                    &registration,
                    Intent::Publish(registration.clone()),
                )?;
            }
        }
        Ok(())
    }

    /// Withdraw a registration. Fire-and-forget once shutdown has begun.
    pub fn unregister(&self, registration: Registration) -> Result<()> {
        lock(&self.published).remove(&registration);

        let mut current = lock(&self.current);
        if let Some(active) = current.as_mut() {
            active.published.remove(&registration);
            if self.shutting_down.load(Ordering::SeqCst) {
                self.send_untracked(active, MessageKind::PublishCancelService, &registration)?;
            } else {
                self.send_tracked(
                    active,
                    MessageKind::PublishCancelService,
                    &registration,
                    Intent::Cancel(registration.clone()),
                )?;
            }
        }
        Ok(())
    }

    /// Attach an offline listener
    pub fn add_offline_listener(&self, listener: Arc<dyn OfflineListener>) {
        lock(&self.offline_listeners).push(listener);
    }

    fn send_tracked<T: Serialize>(
        &self,
        active: &ActiveConnection,
        kind: MessageKind,
        payload: &T,
        intent: Intent,
    ) -> Result<()> {
        let sequence_id = self.next_sequence_id();
        let envelope = Envelope::new(sequence_id, kind, self.serializer, payload)?;
        self.pending.put(
            sequence_id,
            PendingAck::new(envelope.clone(), active.connection.id(), intent),
        );
        if !active.connection.send(envelope) {
            self.pending.remove_if_present(&sequence_id);
        }
        Ok(())
    }

    fn send_untracked<T: Serialize>(
        &self,
        active: &ActiveConnection,
        kind: MessageKind,
        payload: &T,
    ) -> Result<()> {
        let envelope = Envelope::new(self.next_sequence_id(), kind, self.serializer, payload)?;
        active.connection.send(envelope);
        Ok(())
    }

    /// Install a new connection and replay desired state onto it
    pub fn connection_active(&self, connection: Connection) -> Result<()> {
        if self.shutting_down.load(Ordering::SeqCst) {
            connection.close();
            return Ok(());
        }
        info!(
            "Registry connection {} active to {}",
            connection.id(),
            connection.remote_addr()
        );

        // a restarted registry numbers versions from scratch
        for view in lock(&self.views).values_mut() {
            view.applied_version = None;
        }

        let mut current = lock(&self.current);
        let active = current.insert(ActiveConnection {
            connection,
            subscribed: HashSet::new(),
            published: HashSet::new(),
        });

        for key in self.subscribed_keys() {
            if active.subscribed.insert(key.clone()) {
                debug!("Replaying subscription {}", key);
                self.send_tracked(
                    active,
                    MessageKind::SubscribeService,
                    &key,
                    Intent::Subscribe(key.clone()),
                )?;
            }
        }
        for registration in self.published_registrations() {
            if active.published.insert(registration.clone()) {
                debug!("Replaying registration {}", registration.endpoint);
                self.send_tracked(
                    active,
                    MessageKind::PublishService,
                    &registration,
                    Intent::Publish(registration.clone()),
                )?;
            }
        }
        Ok(())
    }

    /// Forget the connection if it is still the current one
    pub fn connection_inactive(&self, id: ConnectionId) {
        let mut current = lock(&self.current);
        if current.as_ref().is_some_and(|active| active.connection.id() == id) {
            *current = None;
            info!("Registry connection {} inactive", id);
        }
    }

    /// Begin shutdown.
    ///
    /// Published registrations are withdrawn without waiting for acks and
    /// the current connection closes once its queue is flushed. Later
    /// unregisters are not tracked either.
    pub fn shutdown(&self) {
        self.shutting_down.store(true, Ordering::SeqCst);
        let current = lock(&self.current);
        if let Some(active) = current.as_ref() {
            for registration in self.published_registrations() {
                if let Err(e) =
                    self.send_untracked(active, MessageKind::PublishCancelService, &registration)
                {
                    warn!("Failed to withdraw {}: {}", registration.endpoint, e);
                }
            }
            active.connection.close();
        }
    }

    /// Whether shutdown has begun
    pub fn is_shutdown(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst)
    }

    fn reply(&self, envelope: Envelope) {
        if let Some(active) = lock(&self.current).as_ref() {
            active.connection.send(envelope);
        }
    }

    /// Apply one inbound envelope from the server
    pub fn handle(&self, envelope: Envelope) -> Result<()> {
        match envelope.kind {
            MessageKind::PublishService => {
                let push: RegistryPush = envelope.payload()?;
                self.reply(Envelope::ack(envelope.sequence_id, self.serializer)?);
                self.apply(push, ChildEvent::ChildAdded);
            }
            MessageKind::PublishCancelService => {
                let push: RegistryPush = envelope.payload()?;
                self.reply(Envelope::ack(envelope.sequence_id, self.serializer)?);
                self.apply(push, ChildEvent::ChildRemoved);
            }
            MessageKind::OfflineNotice => {
                let endpoint: Endpoint = envelope.payload()?;
                info!("Registry reports {} offline", endpoint);
                let listeners = lock(&self.offline_listeners).clone();
                for listener in listeners {
                    listener.offline(&endpoint);
                }
            }
            MessageKind::Ack => {
                if !self.pending.remove_if_present(&envelope.sequence_id) {
                    trace!("Ack {} matched nothing", envelope.sequence_id);
                }
            }
            MessageKind::Heartbeat => trace!("Heartbeat from registry"),
            MessageKind::SubscribeService => warn!("Ignoring subscribe sent by registry"),
        }
        Ok(())
    }

    /// Apply a push to the local view and tell the listeners.
    ///
    /// Every push carries the full list, so the view is diffed against it:
    /// registrations that disappeared surface as `ChildRemoved` ahead of a
    /// publish push, and registrations that appeared surface as `ChildAdded`
    /// after a cancel push. This keeps listeners in step with `lookup` when
    /// changes were missed across a reconnect.
    fn apply(&self, push: RegistryPush, kind: ChildEvent) {
        let events = {
            let mut views = lock(&self.views);
            let view = views.entry(push.service_key.clone()).or_default();
            if view
                .applied_version
                .is_some_and(|applied| push.version <= applied)
            {
                debug!(
                    "Ignoring push for {} at version {} (applied {:?})",
                    push.service_key, push.version, view.applied_version
                );
                return;
            }

            let removed: Vec<Registration> = view
                .registrations
                .iter()
                .filter(|old| !push.registrations.contains(old))
                .cloned()
                .collect();
            let appeared = push
                .registrations
                .iter()
                .any(|new| !view.registrations.contains(new));

            let event = |kind, registrations| NotifyEvent {
                service_key: push.service_key.clone(),
                registrations,
                version: push.version,
                kind,
            };
            let mut events = Vec::with_capacity(2);
            match kind {
                ChildEvent::ChildAdded => {
                    if !removed.is_empty() {
                        events.push(event(ChildEvent::ChildRemoved, removed));
                    }
                    events.push(event(ChildEvent::ChildAdded, push.registrations.clone()));
                }
                ChildEvent::ChildRemoved => {
                    events.push(event(ChildEvent::ChildRemoved, removed));
                    if appeared {
                        events.push(event(ChildEvent::ChildAdded, push.registrations.clone()));
                    }
                }
            }
            view.registrations = push.registrations;
            view.applied_version = Some(push.version);
            events
        };

        let listeners = lock(&self.subscriptions)
            .get(&push.service_key)
            .cloned()
            .unwrap_or_default();
        for event in &events {
            for listener in &listeners {
                listener.notify(event);
            }
        }
    }

    fn still_wanted(&self, intent: &Intent) -> bool {
        match intent {
            Intent::Subscribe(key) => lock(&self.subscriptions).contains_key(key),
            Intent::Publish(registration) => lock(&self.published).contains(registration),
            Intent::Cancel(registration) => !lock(&self.published).contains(registration),
        }
    }

    /// Resend requests that have waited longer than the ack timeout.
    ///
    /// Requests issued on an older connection are dropped (replay covers
    /// them), as are requests desired state no longer calls for. Returns
    /// the number resent.
    pub fn retransmit_expired(&self, now: Instant) -> usize {
        let mut resent = 0;
        self.pending
            .for_each_expired(now, self.ack_timeout, |sequence_id, mut pending| {
                let current = lock(&self.current);
                let Some(active) = current.as_ref() else {
                    return;
                };
                if active.connection.id() != pending.connection || !active.connection.is_active() {
                    return;
                }
                if !self.still_wanted(&pending.meta) {
                    debug!("Dropping superseded request {}: {:?}", sequence_id, pending.meta);
                    return;
                }

                warn!("Resending request {}: {:?}", sequence_id, pending.meta);
                if active.connection.send(pending.envelope.clone()) {
                    pending.sent_at = now;
                    self.pending.rearm(sequence_id, pending);
                    resent += 1;
                }
            });
        resent
    }
}
