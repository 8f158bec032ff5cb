//! Bounded history of DNS lookups.
//!
//! Each (name, IP) pair has at most one entry. A newer observation replaces
//! the older entry, so repeated identical responses refresh recency and TTL
//! without growing the cache. Entries age out through TTL pruning or the
//! size bounds, least recently observed first.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::net::IpAddr;
use std::time::{Duration, Instant};
use tracing::trace;

use crate::selector::{to_fqdn, SelectorMatcher};
use crate::zombie::ZombieMappings;

/// One observed (name → IP) resolution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DnsRecordEntry {
    /// Fully-qualified, lower-case name.
    pub name: String,
    /// Resolved address.
    pub ip: IpAddr,
    /// Effective TTL in seconds (after the minimum TTL was applied).
    pub ttl: u32,
    /// When the response was observed.
    pub lookup_time: Instant,
    /// When the entry stops being live.
    pub expiration_time: Instant,
}

impl DnsRecordEntry {
    /// True once the TTL has elapsed relative to `now`.
    pub fn is_expired(&self, now: Instant) -> bool {
        now >= self.expiration_time
    }
}

/// Per-endpoint (or process-wide) DNS history.
#[derive(Debug, Default)]
pub struct DnsCache {
    min_ttl: u32,

    /// Total entry bound, 0 for none.
    max_entries: usize,

    /// Distinct IPs kept per name, 0 for none.
    max_ips_per_name: usize,

    next_seq: u64,

    /// Observation sequence -> entry. Least recently observed first.
    entries: BTreeMap<u64, DnsRecordEntry>,

    /// (name, IP) -> sequence of its entry.
    by_pair: HashMap<(String, IpAddr), u64>,

    /// name -> sequences of its entries, one per IP.
    by_name: HashMap<String, BTreeSet<u64>>,
}

impl DnsCache {
    /// Create an unbounded cache enforcing `min_ttl`.
    pub fn new(min_ttl: u32) -> Self {
        Self {
            min_ttl,
            ..Default::default()
        }
    }

    /// Create a cache with a total entry bound and a per-name IP bound.
    pub fn with_limits(min_ttl: u32, max_entries: usize, max_ips_per_name: usize) -> Self {
        Self {
            min_ttl,
            max_entries,
            max_ips_per_name,
            ..Default::default()
        }
    }

    /// Record that `name` resolved to `ips` at `lookup_time`.
    ///
    /// An existing entry for the same (name, IP) is replaced unless it was
    /// observed later than `lookup_time`. Returns the entries evicted to
    /// stay within the bounds.
    pub fn update(
        &mut self,
        lookup_time: Instant,
        name: &str,
        ips: &[IpAddr],
        ttl: u32,
    ) -> Vec<DnsRecordEntry> {
        let name = to_fqdn(name);
        let ttl = ttl.max(self.min_ttl);
        let expiration_time = lookup_time + Duration::from_secs(u64::from(ttl));

        for ip in ips {
            let key = (name.clone(), *ip);
            if let Some(seq) = self.by_pair.get(&key).copied() {
                if self
                    .entries
                    .get(&seq)
                    .is_some_and(|old| old.lookup_time > lookup_time)
                {
                    continue;
                }
                self.remove_seq(seq);
            }

            let seq = self.next_seq;
            self.next_seq += 1;
            self.entries.insert(
                seq,
                DnsRecordEntry {
                    name: name.clone(),
                    ip: *ip,
                    ttl,
                    lookup_time,
                    expiration_time,
                },
            );
            self.by_name.entry(name.clone()).or_default().insert(seq);
            self.by_pair.insert(key, seq);
        }

        let mut evicted = self.enforce_name_limit(&name);
        evicted.extend(self.enforce_max_entries());
        if !evicted.is_empty() {
            trace!(name = %name, evicted = evicted.len(), "evicted DNS history entries");
        }
        evicted
    }

    /// IPs for `name` with TTL and lookup time, most recent first.
    pub fn lookup(&self, name: &str) -> Vec<(IpAddr, u32, Instant)> {
        self.newest_first(&to_fqdn(name))
            .into_iter()
            .map(|entry| (entry.ip, entry.ttl, entry.lookup_time))
            .collect()
    }

    /// IPs for `name`, most recent first.
    pub fn lookup_ips(&self, name: &str) -> Vec<IpAddr> {
        self.lookup(name).into_iter().map(|(ip, _, _)| ip).collect()
    }

    /// Names with at least one entry.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.by_name.keys().map(String::as_str)
    }

    /// True if an entry maps `name` to `ip`.
    pub fn contains(&self, name: &str, ip: IpAddr) -> bool {
        self.by_pair.contains_key(&(name.to_string(), ip))
    }

    /// (name, IP) pairs whose entry is unexpired.
    pub fn live_pairs(&self, now: Instant) -> HashSet<(String, IpAddr)> {
        self.entries
            .values()
            .filter(|e| !e.is_expired(now))
            .map(|e| (e.name.clone(), e.ip))
            .collect()
    }

    /// All entries, least recently observed first.
    pub fn entries(&self) -> impl Iterator<Item = &DnsRecordEntry> {
        self.entries.values()
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True if the cache holds no entries.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Remove expired entries unless a live zombie still claims them.
    pub fn prune(&mut self, now: Instant, zombies: &ZombieMappings) -> Vec<DnsRecordEntry> {
        self.prune_with(now, |entry| zombies.claims(&entry.name, entry.ip))
    }

    /// Remove expired entries for which `keep` returns false.
    pub fn prune_with(
        &mut self,
        now: Instant,
        keep: impl Fn(&DnsRecordEntry) -> bool,
    ) -> Vec<DnsRecordEntry> {
        let expired: Vec<u64> = self
            .entries
            .iter()
            .filter(|(_, e)| e.is_expired(now) && !keep(e))
            .map(|(seq, _)| *seq)
            .collect();

        expired
            .into_iter()
            .filter_map(|seq| self.remove_seq(seq))
            .collect()
    }

    /// Remove the entry mapping `name` to `ip`, if any.
    pub fn remove(&mut self, name: &str, ip: IpAddr) -> Option<DnsRecordEntry> {
        let seq = *self.by_pair.get(&(name.to_string(), ip))?;
        self.remove_seq(seq)
    }

    /// Remove every entry whose name matches, regardless of TTL, unless
    /// `keep` returns true for it.
    pub fn force_expire(
        &mut self,
        matcher: &SelectorMatcher,
        keep: impl Fn(&DnsRecordEntry) -> bool,
    ) -> Vec<DnsRecordEntry> {
        let seqs: Vec<u64> = self
            .by_name
            .iter()
            .filter(|(name, _)| matcher.matches(name))
            .flat_map(|(_, seqs)| seqs.iter().copied())
            .filter(|seq| self.entries.get(seq).is_some_and(|e| !keep(e)))
            .collect();

        seqs.into_iter()
            .filter_map(|seq| self.remove_seq(seq))
            .collect()
    }

    fn newest_first(&self, name: &str) -> Vec<&DnsRecordEntry> {
        let mut entries: Vec<(u64, &DnsRecordEntry)> = self
            .by_name
            .get(name)
            .map(|seqs| {
                seqs.iter()
                    .filter_map(|seq| self.entries.get(seq).map(|e| (*seq, e)))
                    .collect()
            })
            .unwrap_or_default();

        entries.sort_by(|(a_seq, a), (b_seq, b)| {
            b.lookup_time
                .cmp(&a.lookup_time)
                .then_with(|| b_seq.cmp(a_seq))
        });
        entries.into_iter().map(|(_, e)| e).collect()
    }

    fn remove_seq(&mut self, seq: u64) -> Option<DnsRecordEntry> {
        let entry = self.entries.remove(&seq)?;
        if let Some(seqs) = self.by_name.get_mut(&entry.name) {
            seqs.remove(&seq);
            if seqs.is_empty() {
                self.by_name.remove(&entry.name);
            }
        }
        self.by_pair.remove(&(entry.name.clone(), entry.ip));
        Some(entry)
    }

    /// Drop the least recently observed IPs of `name` beyond the per-name bound.
    fn enforce_name_limit(&mut self, name: &str) -> Vec<DnsRecordEntry> {
        let mut evicted = Vec::new();
        if self.max_ips_per_name == 0 {
            return evicted;
        }

        while let Some(seqs) = self.by_name.get(name) {
            if seqs.len() <= self.max_ips_per_name {
                break;
            }
            let Some(oldest) = seqs.first().copied() else {
                break;
            };
            evicted.extend(self.remove_seq(oldest));
        }
        evicted
    }

    fn enforce_max_entries(&mut self) -> Vec<DnsRecordEntry> {
        let mut evicted = Vec::new();
        while self.max_entries > 0 && self.entries.len() > self.max_entries {
            let Some(seq) = self.entries.keys().next().copied() else {
                break;
            };
            evicted.extend(self.remove_seq(seq));
        }
        evicted
    }
}
