//! Read-only registry introspection

use crate::models::{Endpoint, ServiceKey};
use crate::server::ServerEngine;
use std::collections::BTreeSet;
use std::net::SocketAddr;

/// Introspection over a running registry
pub trait RegistryMonitor {
    /// Hosts with at least one live registration
    fn publisher_hosts(&self) -> Vec<String>;

    /// Remote addresses of connections holding subscriptions
    fn subscriber_addresses(&self) -> Vec<SocketAddr>;

    /// Endpoints registered for a service
    fn endpoints_by_service(&self, key: &ServiceKey) -> Vec<Endpoint>;

    /// Services registered at an endpoint
    fn service_keys_by_endpoint(&self, endpoint: &Endpoint) -> Vec<ServiceKey>;
}

impl RegistryMonitor for ServerEngine {
    fn publisher_hosts(&self) -> Vec<String> {
        self.store()
            .publisher_endpoints()
            .into_iter()
            .map(|endpoint| endpoint.host)
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }

    fn subscriber_addresses(&self) -> Vec<SocketAddr> {
        let mut addrs: Vec<SocketAddr> = self
            .sessions()
            .subscribers()
            .iter()
            .map(|session| session.connection().remote_addr())
            .collect();
        addrs.sort();
        addrs
    }

    fn endpoints_by_service(&self, key: &ServiceKey) -> Vec<Endpoint> {
        self.store().endpoints_by_service(key)
    }

    fn service_keys_by_endpoint(&self, endpoint: &Endpoint) -> Vec<ServiceKey> {
        self.store().service_keys_by_endpoint(endpoint)
    }
}
