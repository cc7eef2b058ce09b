//! Data models for the service registry

use serde::{Deserialize, Serialize};
use std::fmt;

/// Identity of a logical service
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ServiceKey {
    /// Service group
    pub group: String,
    /// Service version
    pub version: String,
    /// Service name
    pub name: String,
}

/// Network location of a provider process
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Endpoint {
    /// Hostname or IP; empty means "use the address the publish came from"
    pub host: String,
    /// Port
    pub port: u16,
}

/// A provider's announcement that it serves a service at an endpoint
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Registration {
    /// Where the service is reachable
    pub endpoint: Endpoint,
    /// Which service is offered
    pub service_key: ServiceKey,
    /// Load balancing weight
    pub weight: u32,
    /// Suggested number of connections a consumer should open
    pub connection_count: u32,
}

/// Default load balancing weight
pub const DEFAULT_WEIGHT: u32 = 50;

/// Default suggested connection count
pub const DEFAULT_CONNECTION_COUNT: u32 = 1;

/// Full registration list pushed from the server to a subscriber
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistryPush {
    /// Service the list belongs to
    pub service_key: ServiceKey,
    /// Every registration currently known for the service
    pub registrations: Vec<Registration>,
    /// Table version the list was taken at
    pub version: i64,
}

/// Acknowledgment body
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Acknowledge {
    /// Sequence id being acknowledged
    pub sequence_id: i64,
}

/// Kind of change surfaced to a notify listener
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChildEvent {
    /// Registrations were added
    ChildAdded,
    /// Registrations were removed
    ChildRemoved,
}

/// Event delivered to a [`NotifyListener`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NotifyEvent {
    /// Service that changed
    pub service_key: ServiceKey,
    /// Registrations the event refers to
    pub registrations: Vec<Registration>,
    /// Server-side table version
    pub version: i64,
    /// Added or removed
    pub kind: ChildEvent,
}

/// Receives registration changes for subscribed services
pub trait NotifyListener: Send + Sync {
    /// Called for every applied push
    fn notify(&self, event: &NotifyEvent);
}

impl<F> NotifyListener for F
where
    F: Fn(&NotifyEvent) + Send + Sync,
{
    fn notify(&self, event: &NotifyEvent) {
        self(event)
    }
}

/// Receives provider offline notices
pub trait OfflineListener: Send + Sync {
    /// Called when the registry reports an endpoint as gone
    fn offline(&self, endpoint: &Endpoint);
}

impl<F> OfflineListener for F
where
    F: Fn(&Endpoint) + Send + Sync,
{
    fn offline(&self, endpoint: &Endpoint) {
        self(endpoint)
    }
}

impl ServiceKey {
    /// Create a new service key
    pub fn new(
        group: impl Into<String>,
        version: impl Into<String>,
        name: impl Into<String>,
    ) -> Self {
        Self {
            group: group.into(),
            version: version.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for ServiceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}-{}", self.group, self.version, self.name)
    }
}

impl Endpoint {
    /// Create a new endpoint
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// Whether a host was supplied; the server fills in empty ones
    pub fn has_host(&self) -> bool {
        !self.host.trim().is_empty()
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

impl Registration {
    /// Create a registration with default weight and connection count
    pub fn new(endpoint: Endpoint, service_key: ServiceKey) -> Self {
        Self {
            endpoint,
            service_key,
            weight: DEFAULT_WEIGHT,
            connection_count: DEFAULT_CONNECTION_COUNT,
        }
    }

    /// Set the load balancing weight
    pub fn with_weight(mut self, weight: u32) -> Self {
        self.weight = weight;
        self
    }

    /// Set the suggested connection count
    pub fn with_connection_count(mut self, count: u32) -> Self {
        self.connection_count = count;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_service_key_identity() {
        let a = ServiceKey::new("g", "1.0", "Foo");
        let b = ServiceKey::new("g", "1.0", "Foo");
        let c = ServiceKey::new("g", "2.0", "Foo");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.to_string(), "g-1.0-Foo");
    }

    #[test]
    fn test_registration_builder() {
        let reg = Registration::new(
            Endpoint::new("10.0.0.1", 9000),
            ServiceKey::new("g", "1.0", "Foo"),
        )
        .with_weight(80)
        .with_connection_count(4);
        assert_eq!(reg.weight, 80);
        assert_eq!(reg.connection_count, 4);
        assert!(reg.endpoint.has_host());
        assert!(!Endpoint::new("", 1).has_host());
    }

    #[test]
    fn test_closure_listeners() {
        use std::sync::atomic::{AtomicUsize, Ordering};

        let hits = AtomicUsize::new(0);
        let listener = |_: &Endpoint| {
            hits.fetch_add(1, Ordering::SeqCst);
        };
        listener.offline(&Endpoint::new("h", 1));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }
}
