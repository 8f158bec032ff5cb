//! Orchestration between DNS observations, FQDN selectors and identities.
//!
//! The name manager owns the registered selectors, a process-wide DNS cache
//! fed by every ingested response, and the attribution table. An attribution
//! is one (selector, name, IP) triple; each live attribution holds exactly
//! one allocator reference on the identity of its IP. A selector's identity
//! set is derived from its attributions and pushed whole to the selector
//! cache while the manager lock is held. Allocator calls for DNS responses
//! run with the lock released, so responses for unrelated addresses only
//! contend on the short bookkeeping sections.

use parking_lot::Mutex;
use std::collections::btree_map::Entry;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::net::IpAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::dns_cache::DnsCache;
use crate::error::FqdnError;
use crate::identity::{Identity, IdentityAllocator, NumericIdentity};
use crate::metrics::{self, SelectorChange};
use crate::selector::{to_fqdn, FqdnSelector, SelectorMatcher};
use crate::selector_cache::{SelectorCache, UpdateCompletion};

/// Addresses a name resolved to in one response.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DnsIpRecords {
    /// Smallest TTL among the answers, in seconds.
    pub ttl: u32,
    /// Resolved addresses.
    pub ips: Vec<IpAddr>,
}

/// Bounded-time context of a DNS proxy request.
#[derive(Debug, Clone, Copy, Default)]
pub struct RequestContext {
    deadline: Option<Instant>,
}

impl RequestContext {
    /// Context without a deadline.
    pub fn new() -> Self {
        Self::default()
    }

    /// Context expiring at `deadline`.
    pub fn with_deadline(deadline: Instant) -> Self {
        Self {
            deadline: Some(deadline),
        }
    }

    /// Context expiring `timeout` from now.
    pub fn with_timeout(timeout: Duration) -> Self {
        Self::with_deadline(Instant::now() + timeout)
    }

    /// Deadline, if any.
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// True once the deadline has passed.
    pub fn is_expired(&self) -> bool {
        self.deadline.is_some_and(|d| Instant::now() >= d)
    }
}

/// Result of ingesting one response.
#[derive(Debug, Default)]
pub struct IngestOutcome {
    /// Selectors matching at least one name of the response.
    pub used_selectors: Vec<FqdnSelector>,
    /// Identities referenced by attributions created by this response.
    pub new_identities: Vec<Identity>,
    /// Resolves once selector cache consumers have seen the update.
    pub completion: UpdateCompletion,
}

/// Result of dropping attributions whose DNS data is gone.
#[derive(Debug, Default)]
pub struct ExpireOutcome {
    /// Entries removed from the process-wide cache.
    pub expired_entries: usize,
    /// Attributions released.
    pub released: usize,
    /// Resolves once selector cache consumers have seen the update.
    pub completion: UpdateCompletion,
}

/// Per-selector state.
#[derive(Debug)]
struct SelectorState {
    matcher: SelectorMatcher,
    /// (name, IP) -> identity holding one reference.
    attributions: BTreeMap<(String, IpAddr), NumericIdentity>,
}

impl SelectorState {
    fn identities(&self) -> BTreeSet<NumericIdentity> {
        self.attributions.values().copied().collect()
    }
}

struct NameManagerInner {
    selectors: HashMap<FqdnSelector, SelectorState>,
    cache: DnsCache,
}

/// Maps DNS observations onto selector identity sets.
pub struct NameManager {
    allocator: Arc<dyn IdentityAllocator>,
    selector_cache: Arc<dyn SelectorCache>,
    inner: Mutex<NameManagerInner>,
}

impl NameManager {
    /// Create a name manager around a process-wide `cache` with injected
    /// allocator and selector cache.
    pub fn new(
        cache: DnsCache,
        allocator: Arc<dyn IdentityAllocator>,
        selector_cache: Arc<dyn SelectorCache>,
    ) -> Self {
        Self {
            allocator,
            selector_cache,
            inner: Mutex::new(NameManagerInner {
                selectors: HashMap::new(),
                cache,
            }),
        }
    }

    /// Register a selector and attribute every already-known matching IP.
    ///
    /// Identities are allocated and pushed to the selector cache before this
    /// returns. Registering an existing selector returns its current set.
    pub fn register_selector(
        &self,
        selector: &FqdnSelector,
    ) -> Result<BTreeSet<NumericIdentity>, FqdnError> {
        let matcher = selector.compile().inspect_err(|e| {
            warn!(%selector, error = %e, "rejected FQDN selector");
            metrics::record_selector_change(SelectorChange::Rejected);
        })?;

        let mut inner = self.inner.lock();
        if let Some(state) = inner.selectors.get(selector) {
            debug!(%selector, "FQDN selector already registered");
            return Ok(state.identities());
        }

        let pairs: Vec<(String, IpAddr)> = inner
            .cache
            .names()
            .filter(|name| matcher.matches(name))
            .flat_map(|name| {
                inner
                    .cache
                    .lookup_ips(name)
                    .into_iter()
                    .map(move |ip| (name.to_string(), ip))
            })
            .collect();

        let ips: Vec<IpAddr> = pairs.iter().map(|(_, ip)| *ip).collect();
        let allocated = self.allocate(&ips)?;

        let state = SelectorState {
            matcher,
            attributions: pairs
                .into_iter()
                .zip(allocated.iter().map(|identity| identity.id))
                .collect(),
        };
        let identities = state.identities();
        inner.selectors.insert(selector.clone(), state);

        self.selector_cache.update_selector_identities(
            selector,
            identities.clone(),
            &UpdateCompletion::new(),
        );
        metrics::record_selector_change(SelectorChange::Registered);
        info!(%selector, identities = identities.len(), "registered FQDN selector");
        Ok(identities)
    }

    /// Remove a selector and release every reference it held.
    pub fn unregister_selector(&self, selector: &FqdnSelector) -> UpdateCompletion {
        let done = UpdateCompletion::new();
        let mut inner = self.inner.lock();

        let Some(state) = inner.selectors.remove(selector) else {
            debug!(%selector, "unregister of unknown FQDN selector");
            return done;
        };

        let released: Vec<NumericIdentity> = state.attributions.values().copied().collect();
        self.release(&released);
        self.selector_cache
            .update_selector_identities(selector, BTreeSet::new(), &done);

        metrics::record_selector_change(SelectorChange::Unregistered);
        info!(%selector, released = released.len(), "unregistered FQDN selector");
        done
    }

    /// Restrict a selector to `identities`.
    ///
    /// Attributions whose identity is not in `identities` are dropped and
    /// their references released. Identities without an attribution cannot
    /// be added this way and are ignored.
    pub fn update_selector_identities(
        &self,
        selector: &FqdnSelector,
        identities: &BTreeSet<NumericIdentity>,
    ) -> UpdateCompletion {
        let done = UpdateCompletion::new();
        let mut inner = self.inner.lock();

        let Some(state) = inner.selectors.get_mut(selector) else {
            debug!(%selector, "identity update for unknown FQDN selector");
            return done;
        };

        let mut released = Vec::new();
        state.attributions.retain(|_, id| {
            let keep = identities.contains(id);
            if !keep {
                released.push(*id);
            }
            keep
        });

        let current = state.identities();
        let unknown = identities.difference(&current).count();
        if unknown > 0 {
            debug!(%selector, unknown, "ignoring identities without DNS attribution");
        }

        self.release(&released);
        self.selector_cache
            .update_selector_identities(selector, current, &done);
        done
    }

    /// Feed one DNS response into the selector/identity bookkeeping.
    ///
    /// Callers hold the shard locks for every IP in `records`. The cache
    /// update is kept even when allocation fails. When `ctx` has expired
    /// after allocation, the new attributions are kept but no selector
    /// update is pushed.
    pub fn ingest_dns_records(
        &self,
        ctx: &RequestContext,
        lookup_time: Instant,
        records: &BTreeMap<String, DnsIpRecords>,
    ) -> Result<IngestOutcome, FqdnError> {
        let records = normalize(records);

        let (used_selectors, pending) = {
            let mut inner = self.inner.lock();
            for (name, record) in &records {
                inner.cache.update(lookup_time, name, &record.ips, record.ttl);
            }
            pending_attributions(&inner.selectors, &records)
        };

        let ips: Vec<IpAddr> = pending.iter().map(|(_, _, ip)| *ip).collect();
        let allocated = self.allocate(&ips)?;

        let mut inner = self.inner.lock();
        let mut new_identities: Vec<Identity> = Vec::new();
        let mut surplus: Vec<NumericIdentity> = Vec::new();
        for ((selector, name, ip), identity) in pending.into_iter().zip(allocated) {
            // The selector may have been unregistered, or registration may
            // have attributed the pair, while the lock was released.
            let inserted = match inner.selectors.get_mut(&selector) {
                Some(state) => match state.attributions.entry((name, ip)) {
                    Entry::Vacant(slot) => {
                        slot.insert(identity.id);
                        true
                    }
                    Entry::Occupied(_) => false,
                },
                None => false,
            };
            if !inserted {
                surplus.push(identity.id);
            } else if !new_identities.contains(&identity) {
                new_identities.push(identity);
            }
        }
        if !surplus.is_empty() {
            debug!(surplus = surplus.len(), "releasing attributions lost to a concurrent update");
            self.release(&surplus);
        }

        if ctx.is_expired() {
            warn!(
                selectors = used_selectors.len(),
                "deadline passed before selector update, skipping push"
            );
            return Err(FqdnError::DeadlineExceeded);
        }

        let completion = UpdateCompletion::new();
        for selector in &used_selectors {
            if let Some(state) = inner.selectors.get(selector) {
                self.selector_cache
                    .update_selector_identities(selector, state.identities(), &completion);
            }
        }

        debug!(
            names = records.len(),
            selectors = used_selectors.len(),
            new_identities = new_identities.len(),
            "ingested DNS records"
        );

        Ok(IngestOutcome {
            used_selectors,
            new_identities,
            completion,
        })
    }

    /// True if any registered selector matches `name`.
    pub fn is_selected(&self, name: &str) -> bool {
        let name = to_fqdn(name);
        self.inner
            .lock()
            .selectors
            .values()
            .any(|state| state.matcher.matches(&name))
    }

    /// True if any selector holds an attribution for `name` → `ip`.
    pub fn is_attributed(&self, name: &str, ip: IpAddr) -> bool {
        let key = (to_fqdn(name), ip);
        self.inner
            .lock()
            .selectors
            .values()
            .any(|state| state.attributions.contains_key(&key))
    }

    /// Forget `name` → `ip` everywhere and release its attributions.
    pub fn release_mapping(&self, name: &str, ip: IpAddr) -> UpdateCompletion {
        let name = to_fqdn(name);
        let done = UpdateCompletion::new();
        let mut inner = self.inner.lock();

        inner.cache.remove(&name, ip);
        let released = self.drop_attributions(&mut inner, &done, |pair| {
            pair.0 == name && pair.1 == ip
        });
        if released > 0 {
            debug!(name = %name, %ip, released, "released DNS mapping");
        }
        done
    }

    /// Expire process-wide cache entries nobody references any more and
    /// release attributions whose mapping left the cache.
    ///
    /// `active` holds (name, IP) pairs still present in some endpoint's
    /// history or zombie set.
    pub fn expire_unreferenced(
        &self,
        now: Instant,
        active: &HashSet<(String, IpAddr)>,
    ) -> ExpireOutcome {
        let completion = UpdateCompletion::new();
        let mut inner = self.inner.lock();

        let expired = inner
            .cache
            .prune_with(now, |entry| active.contains(&(entry.name.clone(), entry.ip)));

        let remaining: HashSet<(String, IpAddr)> = inner
            .cache
            .entries()
            .map(|entry| (entry.name.clone(), entry.ip))
            .collect();
        let released = self.drop_attributions(&mut inner, &completion, |pair| {
            !remaining.contains(pair) && !active.contains(pair)
        });

        ExpireOutcome {
            expired_entries: expired.len(),
            released,
            completion,
        }
    }

    /// Drop every process-wide cache entry whose name matches `selector`,
    /// regardless of TTL, and release the attributions of the removed
    /// mappings. Mappings in `keep` stay.
    pub fn force_expire(
        &self,
        selector: &FqdnSelector,
        keep: &HashSet<(String, IpAddr)>,
    ) -> Result<ExpireOutcome, FqdnError> {
        let matcher = selector.compile()?;
        let completion = UpdateCompletion::new();
        let mut inner = self.inner.lock();

        let removed = inner
            .cache
            .force_expire(&matcher, |entry| keep.contains(&(entry.name.clone(), entry.ip)));
        let removed_pairs: HashSet<(String, IpAddr)> =
            removed.iter().map(|e| (e.name.clone(), e.ip)).collect();
        let released =
            self.drop_attributions(&mut inner, &completion, |pair| removed_pairs.contains(pair));

        info!(%selector, removed = removed.len(), released, "force-expired DNS cache entries");
        Ok(ExpireOutcome {
            expired_entries: removed.len(),
            released,
            completion,
        })
    }

    /// Current identity set of `selector`.
    pub fn selector_identities(&self, selector: &FqdnSelector) -> BTreeSet<NumericIdentity> {
        self.inner
            .lock()
            .selectors
            .get(selector)
            .map(SelectorState::identities)
            .unwrap_or_default()
    }

    /// Registered selectors.
    pub fn selectors(&self) -> Vec<FqdnSelector> {
        let mut selectors: Vec<_> = self.inner.lock().selectors.keys().cloned().collect();
        selectors.sort();
        selectors
    }

    /// IPs known for `name` in the process-wide cache, most recent first.
    pub fn lookup(&self, name: &str) -> Vec<IpAddr> {
        self.inner.lock().cache.lookup_ips(name)
    }

    /// Number of live (selector, name, IP) attributions.
    pub fn attribution_count(&self) -> usize {
        self.inner
            .lock()
            .selectors
            .values()
            .map(|state| state.attributions.len())
            .sum()
    }

    /// Number of entries in the process-wide cache.
    pub fn cache_len(&self) -> usize {
        self.inner.lock().cache.len()
    }

    fn allocate(&self, ips: &[IpAddr]) -> Result<Vec<Identity>, FqdnError> {
        if ips.is_empty() {
            return Ok(Vec::new());
        }
        let allocated = self.allocator.allocate_cidrs_for_ips(ips).inspect_err(|e| {
            warn!(ips = ips.len(), error = %e, "identity allocation failed");
        })?;
        metrics::record_identities_allocated(allocated.len());
        Ok(allocated)
    }

    fn release(&self, ids: &[NumericIdentity]) {
        if ids.is_empty() {
            return;
        }
        self.allocator.release_identities(ids);
        metrics::record_identities_released(ids.len());
    }

    /// Drop attributions matching `should_drop`, release them and push every
    /// selector whose set changed. Returns the number released.
    fn drop_attributions(
        &self,
        inner: &mut NameManagerInner,
        done: &UpdateCompletion,
        should_drop: impl Fn(&(String, IpAddr)) -> bool,
    ) -> usize {
        let mut released = Vec::new();
        for (selector, state) in inner.selectors.iter_mut() {
            let before = released.len();
            state.attributions.retain(|pair, id| {
                if should_drop(pair) {
                    released.push(*id);
                    false
                } else {
                    true
                }
            });
            if released.len() != before {
                self.selector_cache
                    .update_selector_identities(selector, state.identities(), done);
            }
        }
        self.release(&released);
        released.len()
    }
}

/// Selectors matching any name in `records`, sorted, and the
/// (selector, name, IP) attributions they do not hold yet.
#[allow(clippy::type_complexity)]
fn pending_attributions(
    selectors: &HashMap<FqdnSelector, SelectorState>,
    records: &BTreeMap<String, DnsIpRecords>,
) -> (Vec<FqdnSelector>, Vec<(FqdnSelector, String, IpAddr)>) {
    let mut used_selectors = Vec::new();
    let mut pending = Vec::new();
    for (selector, state) in selectors {
        let mut used = false;
        for (name, record) in records {
            if !state.matcher.matches(name) {
                continue;
            }
            used = true;
            for ip in &record.ips {
                if !state.attributions.contains_key(&(name.clone(), *ip)) {
                    pending.push((selector.clone(), name.clone(), *ip));
                }
            }
        }
        if used {
            used_selectors.push(selector.clone());
        }
    }
    used_selectors.sort();
    (used_selectors, pending)
}

/// Normalize names and drop duplicate IPs, keeping first-seen order.
fn normalize(records: &BTreeMap<String, DnsIpRecords>) -> BTreeMap<String, DnsIpRecords> {
    let mut normalized: BTreeMap<String, DnsIpRecords> = BTreeMap::new();
    for (name, record) in records {
        let entry = normalized.entry(to_fqdn(name)).or_insert_with(|| DnsIpRecords {
            ttl: record.ttl,
            ips: Vec::new(),
        });
        entry.ttl = entry.ttl.min(record.ttl);
        for ip in &record.ips {
            if !entry.ips.contains(ip) {
                entry.ips.push(*ip);
            }
        }
    }
    normalized
}
