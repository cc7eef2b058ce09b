//! Per-connection session state on the registry server

use crate::connection::{Connection, ConnectionId};
use crate::models::{Endpoint, Registration, ServiceKey};
use crate::sync::{lock, read, write};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::{Arc, Mutex, RwLock};

/// What one connection has subscribed to and published
#[derive(Debug)]
pub struct Session {
    connection: Connection,
    subscribed: Mutex<HashSet<ServiceKey>>,
    published: Mutex<HashSet<Registration>>,
}

impl Session {
    fn new(connection: Connection) -> Self {
        Self {
            connection,
            subscribed: Mutex::new(HashSet::new()),
            published: Mutex::new(HashSet::new()),
        }
    }

    /// Connection this session belongs to
    pub fn connection(&self) -> &Connection {
        &self.connection
    }

    /// Connection identity
    pub fn id(&self) -> ConnectionId {
        self.connection.id()
    }

    /// Tag a subscription; true if it was new
    pub fn subscribe(&self, key: ServiceKey) -> bool {
        lock(&self.subscribed).insert(key)
    }

    /// Whether the connection subscribed to `key`
    pub fn is_subscribed(&self, key: &ServiceKey) -> bool {
        lock(&self.subscribed).contains(key)
    }

    /// Whether the connection subscribed to anything
    pub fn has_subscriptions(&self) -> bool {
        !lock(&self.subscribed).is_empty()
    }

    /// Tag a published registration
    pub fn publish(&self, registration: Registration) -> bool {
        lock(&self.published).insert(registration)
    }

    /// Drop a published registration tag
    pub fn unpublish(&self, registration: &Registration) -> bool {
        lock(&self.published).remove(registration)
    }

    /// Whether this connection published `key` at `endpoint`
    pub fn published_at(&self, key: &ServiceKey, endpoint: &Endpoint) -> bool {
        lock(&self.published)
            .iter()
            .any(|r| &r.service_key == key && &r.endpoint == endpoint)
    }

    /// Distinct endpoints this connection published from
    pub fn published_endpoints(&self) -> Vec<Endpoint> {
        lock(&self.published)
            .iter()
            .map(|r| r.endpoint.clone())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }
}

/// Live sessions keyed by connection
#[derive(Debug, Default)]
pub struct SessionTable {
    sessions: RwLock<HashMap<ConnectionId, Arc<Session>>>,
}

impl SessionTable {
    /// Create an empty table
    pub fn new() -> Self {
        Self::default()
    }

    /// Start tracking a connection
    pub fn open(&self, connection: Connection) -> Arc<Session> {
        let session = Arc::new(Session::new(connection));
        write(&self.sessions).insert(session.id(), session.clone());
        session
    }

    /// Look up a session
    pub fn get(&self, id: ConnectionId) -> Option<Arc<Session>> {
        read(&self.sessions).get(&id).cloned()
    }

    /// Stop tracking a connection
    pub fn remove(&self, id: ConnectionId) -> Option<Arc<Session>> {
        write(&self.sessions).remove(&id)
    }

    /// Sessions subscribed to `key`
    pub fn subscribers_of(&self, key: &ServiceKey) -> Vec<Arc<Session>> {
        read(&self.sessions)
            .values()
            .filter(|session| session.is_subscribed(key))
            .cloned()
            .collect()
    }

    /// Sessions subscribed to anything
    pub fn subscribers(&self) -> Vec<Arc<Session>> {
        read(&self.sessions)
            .values()
            .filter(|session| session.has_subscriptions())
            .cloned()
            .collect()
    }

    /// Whether any live session published `key` at `endpoint`
    pub fn any_published_at(&self, key: &ServiceKey, endpoint: &Endpoint) -> bool {
        read(&self.sessions)
            .values()
            .any(|session| session.published_at(key, endpoint))
    }

    /// Whether any live session published anything from `endpoint`
    pub fn any_published_from(&self, endpoint: &Endpoint) -> bool {
        read(&self.sessions)
            .values()
            .any(|session| session.published_endpoints().contains(endpoint))
    }

    /// Number of live sessions
    pub fn len(&self) -> usize {
        read(&self.sessions).len()
    }

    /// Whether no sessions are live
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
