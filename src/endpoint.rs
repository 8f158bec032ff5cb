//! Per-endpoint DNS state.

use parking_lot::{Mutex, MutexGuard};

use crate::dns_cache::DnsCache;
use crate::zombie::{EndpointId, ZombieMappings};

/// DNS history and zombie set of one workload endpoint.
///
/// When both are needed, the history is locked before the zombies.
#[derive(Debug)]
pub struct Endpoint {
    id: EndpointId,
    dns_history: Mutex<DnsCache>,
    dns_zombies: Mutex<ZombieMappings>,
}

impl Endpoint {
    /// Create an endpoint with empty state.
    pub fn new(id: EndpointId, dns_history: DnsCache, dns_zombies: ZombieMappings) -> Self {
        Self {
            id,
            dns_history: Mutex::new(dns_history),
            dns_zombies: Mutex::new(dns_zombies),
        }
    }

    /// Endpoint identifier.
    pub fn id(&self) -> EndpointId {
        self.id
    }

    /// Lock the DNS history.
    pub fn dns_history(&self) -> MutexGuard<'_, DnsCache> {
        self.dns_history.lock()
    }

    /// Lock the zombie set.
    pub fn dns_zombies(&self) -> MutexGuard<'_, ZombieMappings> {
        self.dns_zombies.lock()
    }
}
