//! Authoritative registration tables
//!
//! One versioned table per [`ServiceKey`], created lazily on first write,
//! plus a reverse index from [`Endpoint`] to the keys registered there.
//! Every mutation of a table, its version bump, the matching reverse index
//! update and the snapshot handed back for broadcast happen under that
//! table's own lock, so writers on different keys never contend.

use crate::models::{Endpoint, Registration, ServiceKey};
use crate::sync::{lock, read, write};
use std::collections::hash_map::Entry;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, RwLock};
use tracing::debug;

/// Registrations for one service key
#[derive(Debug, Default)]
struct ServiceTable {
    registrations: HashMap<Endpoint, Registration>,
    version: i64,
}

impl ServiceTable {
    fn snapshot(&self) -> Vec<Registration> {
        let mut registrations: Vec<Registration> = self.registrations.values().cloned().collect();
        registrations.sort_by(|a, b| a.endpoint.cmp(&b.endpoint));
        registrations
    }
}

/// Outcome of [`RegistryStore::upsert`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mutation {
    /// Whether the table changed
    pub changed: bool,
    /// Table version after the call
    pub version: i64,
    /// Table contents after the call
    pub snapshot: Vec<Registration>,
}

/// Outcome of [`RegistryStore::remove`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Removal {
    /// The registration that was removed, if any
    pub removed: Option<Registration>,
    /// Table version after the call
    pub version: i64,
    /// Table contents after the call
    pub snapshot: Vec<Registration>,
}

/// In-memory registry state
#[derive(Debug, Default)]
pub struct RegistryStore {
    tables: RwLock<HashMap<ServiceKey, Arc<Mutex<ServiceTable>>>>,
    reverse: Mutex<HashMap<Endpoint, HashSet<ServiceKey>>>,
}

impl RegistryStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    fn table(&self, key: &ServiceKey) -> Arc<Mutex<ServiceTable>> {
        if let Some(table) = read(&self.tables).get(key) {
            return table.clone();
        }
        write(&self.tables).entry(key.clone()).or_default().clone()
    }

    fn existing_table(&self, key: &ServiceKey) -> Option<Arc<Mutex<ServiceTable>>> {
        read(&self.tables).get(key).cloned()
    }

    /// Insert a registration unless one already exists for its endpoint
    pub fn upsert(&self, key: &ServiceKey, registration: Registration) -> Mutation {
        let table = self.table(key);
        let mut table = lock(&table);

        let endpoint = registration.endpoint.clone();
        let changed = match table.registrations.entry(endpoint.clone()) {
            Entry::Vacant(slot) => {
                slot.insert(registration);
                true
            }
            Entry::Occupied(_) => false,
        };

        if changed {
            table.version += 1;
            lock(&self.reverse)
                .entry(endpoint.clone())
                .or_default()
                .insert(key.clone());
            debug!("Registered {} for {} (version {})", endpoint, key, table.version);
        }

        Mutation {
            changed,
            version: table.version,
            snapshot: table.snapshot(),
        }
    }

    /// Remove the registration for an endpoint
    pub fn remove(&self, key: &ServiceKey, endpoint: &Endpoint) -> Removal {
        let Some(table) = self.existing_table(key) else {
            return Removal {
                removed: None,
                version: 0,
                snapshot: Vec::new(),
            };
        };
        let mut table = lock(&table);

        let removed = table.registrations.remove(endpoint);
        if removed.is_some() {
            table.version += 1;
            let mut reverse = lock(&self.reverse);
            if let Some(keys) = reverse.get_mut(endpoint) {
                keys.remove(key);
                if keys.is_empty() {
                    reverse.remove(endpoint);
                }
            }
            debug!("Unregistered {} for {} (version {})", endpoint, key, table.version);
        }

        Removal {
            removed,
            version: table.version,
            snapshot: table.snapshot(),
        }
    }

    /// Current registrations and version for a key
    pub fn snapshot(&self, key: &ServiceKey) -> (Vec<Registration>, i64) {
        match self.existing_table(key) {
            Some(table) => {
                let table = lock(&table);
                (table.snapshot(), table.version)
            }
            None => (Vec::new(), 0),
        }
    }

    /// Current version for a key, 0 if it was never written
    pub fn current_version(&self, key: &ServiceKey) -> i64 {
        self.existing_table(key)
            .map(|table| lock(&table).version)
            .unwrap_or(0)
    }

    /// Keys registered from an endpoint
    pub fn service_keys_by_endpoint(&self, endpoint: &Endpoint) -> Vec<ServiceKey> {
        let mut keys: Vec<ServiceKey> = lock(&self.reverse)
            .get(endpoint)
            .map(|keys| keys.iter().cloned().collect())
            .unwrap_or_default();
        keys.sort();
        keys
    }

    /// Endpoints registered for a key
    pub fn endpoints_by_service(&self, key: &ServiceKey) -> Vec<Endpoint> {
        self.snapshot(key)
            .0
            .into_iter()
            .map(|registration| registration.endpoint)
            .collect()
    }

    /// Every endpoint with at least one registration
    pub fn publisher_endpoints(&self) -> Vec<Endpoint> {
        let mut endpoints: Vec<Endpoint> = lock(&self.reverse).keys().cloned().collect();
        endpoints.sort();
        endpoints
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::collections::BTreeMap;

    fn key(name: &str) -> ServiceKey {
        ServiceKey::new("g", "1.0", name)
    }

    fn reg(port: u16, name: &str) -> Registration {
        Registration::new(Endpoint::new("10.0.0.1", port), key(name))
    }

    #[test]
    fn test_upsert_is_insert_if_absent() {
        let store = RegistryStore::new();
        let foo = key("Foo");

        let first = store.upsert(&foo, reg(9000, "Foo").with_weight(50));
        assert!(first.changed);
        assert_eq!(first.version, 1);
        assert_eq!(first.snapshot.len(), 1);

        let duplicate = store.upsert(&foo, reg(9000, "Foo").with_weight(10));
        assert!(!duplicate.changed);
        assert_eq!(duplicate.version, 1);
        assert_eq!(duplicate.snapshot[0].weight, 50);

        let second = store.upsert(&foo, reg(9001, "Foo"));
        assert!(second.changed);
        assert_eq!(second.version, 2);
        assert_eq!(second.snapshot.len(), 2);
    }

    #[test]
    fn test_remove_and_reverse_index() {
        let store = RegistryStore::new();
        let endpoint = Endpoint::new("10.0.0.1", 9000);
        store.upsert(&key("Foo"), reg(9000, "Foo"));
        store.upsert(&key("Bar"), reg(9000, "Bar"));

        assert_eq!(
            store.service_keys_by_endpoint(&endpoint),
            vec![key("Bar"), key("Foo")]
        );
        assert_eq!(store.publisher_endpoints(), vec![endpoint.clone()]);

        let removal = store.remove(&key("Foo"), &endpoint);
        assert_eq!(removal.removed, Some(reg(9000, "Foo")));
        assert_eq!(removal.version, 2);
        assert!(removal.snapshot.is_empty());

        let again = store.remove(&key("Foo"), &endpoint);
        assert!(again.removed.is_none());
        assert_eq!(again.version, 2);

        store.remove(&key("Bar"), &endpoint);
        assert!(store.service_keys_by_endpoint(&endpoint).is_empty());
        assert!(store.publisher_endpoints().is_empty());
    }

    #[test]
    fn test_unknown_lookups_are_empty() {
        let store = RegistryStore::new();
        assert_eq!(store.snapshot(&key("Nope")), (Vec::new(), 0));
        assert_eq!(store.current_version(&key("Nope")), 0);
        assert!(store.endpoints_by_service(&key("Nope")).is_empty());
        assert!(
            store
                .service_keys_by_endpoint(&Endpoint::new("x", 1))
                .is_empty()
        );
        let removal = store.remove(&key("Nope"), &Endpoint::new("x", 1));
        assert!(removal.removed.is_none());
    }

    #[test]
    fn test_concurrent_writers() {
        let store = Arc::new(RegistryStore::new());
        std::thread::scope(|scope| {
            for t in 0..8u16 {
                let store = store.clone();
                scope.spawn(move || {
                    for i in 0..100u16 {
                        store.upsert(&key("Shared"), reg(t * 100 + i, "Shared"));
                        store.upsert(&key(&format!("Own{t}")), reg(i, &format!("Own{t}")));
                    }
                });
            }
        });

        let (shared, version) = store.snapshot(&key("Shared"));
        assert_eq!(shared.len(), 800);
        assert_eq!(version, 800);
        for t in 0..8 {
            assert_eq!(store.current_version(&key(&format!("Own{t}"))), 100);
        }
    }

    #[derive(Debug, Clone)]
    enum Op {
        Register(u16),
        Unregister(u16),
    }

    fn op_strategy() -> impl Strategy<Value = Vec<Op>> {
        proptest::collection::vec(
            prop_oneof![
                (0u16..6).prop_map(Op::Register),
                (0u16..6).prop_map(Op::Unregister),
            ],
            0..64,
        )
    }

    proptest! {
        #[test]
        fn property_version_counts_structural_changes(ops in op_strategy()) {
            let store = RegistryStore::new();
            let foo = key("Foo");
            let mut model: BTreeMap<u16, Registration> = BTreeMap::new();
            let mut changes = 0i64;

            for op in ops {
                match op {
                    Op::Register(port) => {
                        let expected = !model.contains_key(&port);
                        model.entry(port).or_insert_with(|| reg(port, "Foo"));
                        let mutation = store.upsert(&foo, reg(port, "Foo"));
                        prop_assert_eq!(mutation.changed, expected);
                        if expected {
                            changes += 1;
                        }
                    }
                    Op::Unregister(port) => {
                        let expected = model.remove(&port);
                        let removal = store.remove(&foo, &Endpoint::new("10.0.0.1", port));
                        prop_assert_eq!(&removal.removed, &expected);
                        if expected.is_some() {
                            changes += 1;
                        }
                    }
                }
            }

            let (snapshot, version) = store.snapshot(&foo);
            prop_assert_eq!(version, changes);
            let expected: Vec<Registration> = model.into_values().collect();
            prop_assert_eq!(snapshot, expected);
        }
    }
}
