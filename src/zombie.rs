//! Mappings evicted from DNS history but still backing identity allocations.
//!
//! A zombie keeps a (name, IP) association alive after its cache entry is
//! gone, so that the identity attributed to it is not released while a
//! selector still authorizes it or a connection is still using it.

use std::collections::{BTreeSet, HashMap};
use std::net::IpAddr;
use std::time::{Duration, Instant};
use tracing::debug;

use crate::selector::{to_fqdn, FqdnSelector};

/// Endpoint identifier, as used by the endpoint manager.
pub type EndpointId = u16;

/// Who still depends on a zombie mapping.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ZombieOwner {
    /// Endpoint whose DNS history held the mapping.
    Endpoint(EndpointId),
    /// Selector that still authorizes the mapping.
    Selector(FqdnSelector),
}

/// A (name, IP) mapping pending deletion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DnsZombieMapping {
    /// Fully-qualified name.
    pub name: String,
    /// Address the name resolved to.
    pub ip: IpAddr,
    /// Claims keeping the mapping alive.
    pub owners: BTreeSet<ZombieOwner>,
    /// When the mapping first became a zombie.
    pub deletion_pending_since: Instant,
    /// Last time the mapping was seen in use.
    pub alive_at: Instant,
}

/// Per-endpoint set of zombie mappings.
#[derive(Debug)]
pub struct ZombieMappings {
    /// Maximum zombies kept; the oldest beyond this die at the next GC. 0 for none.
    max: usize,
    /// How long a zombie may go without being marked alive.
    idle_grace: Duration,
    zombies: HashMap<(String, IpAddr), DnsZombieMapping>,
}

impl Default for ZombieMappings {
    fn default() -> Self {
        Self::new(0, Duration::from_secs(60))
    }
}

impl ZombieMappings {
    /// Create an empty tracker.
    pub fn new(max: usize, idle_grace: Duration) -> Self {
        Self {
            max,
            idle_grace,
            zombies: HashMap::new(),
        }
    }

    /// Record that `owner` still depends on `name` → `ip`.
    pub fn mark_zombie(&mut self, now: Instant, name: &str, ip: IpAddr, owner: ZombieOwner) {
        let name = to_fqdn(name);
        let zombie = self
            .zombies
            .entry((name.clone(), ip))
            .or_insert_with(|| DnsZombieMapping {
                name,
                ip,
                owners: BTreeSet::new(),
                deletion_pending_since: now,
                alive_at: now,
            });
        zombie.owners.insert(owner);
    }

    /// Refresh liveness of every zombie for `ip`, e.g. from connection tracking.
    pub fn mark_alive(&mut self, now: Instant, ip: IpAddr) {
        for zombie in self.zombies.values_mut().filter(|z| z.ip == ip) {
            zombie.alive_at = zombie.alive_at.max(now);
        }
    }

    /// Drop `owner`'s claim. Returns the mapping once no owner remains.
    pub fn release(
        &mut self,
        owner: &ZombieOwner,
        name: &str,
        ip: IpAddr,
    ) -> Option<DnsZombieMapping> {
        let key = (to_fqdn(name), ip);
        let zombie = self.zombies.get_mut(&key)?;
        zombie.owners.remove(owner);
        if !zombie.owners.is_empty() {
            return None;
        }
        debug!(name = %key.0, %ip, "zombie mapping released by last owner");
        self.zombies.remove(&key)
    }

    /// True if a zombie holds `name` → `ip`.
    pub fn claims(&self, name: &str, ip: IpAddr) -> bool {
        self.zombies.contains_key(&(name.to_string(), ip))
    }

    /// Sweep the tracker.
    ///
    /// A zombie dies when `still_selected` no longer matches its name, when
    /// it has been idle longer than the grace period, or when it is among
    /// the oldest beyond the size bound. Returns `(alive, dead)`; dead ones
    /// are removed.
    pub fn gc(
        &mut self,
        now: Instant,
        still_selected: impl Fn(&str, IpAddr) -> bool,
    ) -> (Vec<DnsZombieMapping>, Vec<DnsZombieMapping>) {
        let mut dead_keys: Vec<(String, IpAddr)> = self
            .zombies
            .iter()
            .filter(|(_, z)| {
                !still_selected(&z.name, z.ip) || now.duration_since(z.alive_at) > self.idle_grace
            })
            .map(|(key, _)| key.clone())
            .collect();

        if self.max > 0 {
            let mut survivors: Vec<&DnsZombieMapping> = self
                .zombies
                .iter()
                .filter(|(key, _)| !dead_keys.contains(key))
                .map(|(_, z)| z)
                .collect();
            if survivors.len() > self.max {
                survivors.sort_by_key(|z| (z.alive_at, z.deletion_pending_since));
                let excess = survivors.len() - self.max;
                let oldest: Vec<(String, IpAddr)> = survivors[..excess]
                    .iter()
                    .map(|z| (z.name.clone(), z.ip))
                    .collect();
                dead_keys.extend(oldest);
            }
        }

        let dead: Vec<DnsZombieMapping> = dead_keys
            .iter()
            .filter_map(|key| self.zombies.remove(key))
            .collect();
        let alive: Vec<DnsZombieMapping> = self.zombies.values().cloned().collect();

        if !dead.is_empty() {
            debug!(alive = alive.len(), dead = dead.len(), "zombie GC sweep");
        }
        (alive, dead)
    }

    /// Number of zombies.
    pub fn len(&self) -> usize {
        self.zombies.len()
    }

    /// True if no zombies are tracked.
    pub fn is_empty(&self) -> bool {
        self.zombies.is_empty()
    }

    /// All zombies, in no particular order.
    pub fn dump(&self) -> Vec<DnsZombieMapping> {
        self.zombies.values().cloned().collect()
    }
}
