//! DNS-proxy facing entry point, endpoint registry and GC lifecycle.

use hickory_proto::op::{Message, MessageType, ResponseCode};
use hickory_proto::xfer::Protocol;
use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::config::FqdnConfig;
use crate::dns_cache::DnsCache;
use crate::endpoint::Endpoint;
use crate::error::FqdnError;
use crate::identity::IdentityAllocator;
use crate::lockpool::ShardLockPool;
use crate::message::{extract_response_ips, ResponseDetails};
use crate::metrics::{self, MessageResult, Timer};
use crate::name_manager::{ExpireOutcome, NameManager, RequestContext};
use crate::selector::FqdnSelector;
use crate::selector_cache::{SelectorCache, UpdateCompletion};
use crate::zombie::{EndpointId, ZombieMappings, ZombieOwner};

/// Interval for emitting state metrics.
const METRICS_INTERVAL: Duration = Duration::from_secs(10);

/// Result of one GC sweep.
#[derive(Debug, Default)]
pub struct GcStats {
    /// Endpoint history entries removed.
    pub expired_entries: usize,
    /// Zombies that died.
    pub dead_zombies: usize,
    /// Process-wide cache entries removed.
    pub expired_global_entries: usize,
    /// Attributions released.
    pub released: usize,
    /// Resolves once selector cache consumers have seen the update.
    pub completion: UpdateCompletion,
}

/// Owns the FQDN identity lifecycle for every endpoint on the node.
pub struct FqdnDaemon {
    config: FqdnConfig,
    name_manager: Arc<NameManager>,
    locks: ShardLockPool,
    endpoints: RwLock<HashMap<EndpointId, Arc<Endpoint>>>,
}

impl FqdnDaemon {
    /// Create a daemon around the injected services.
    pub fn new(
        config: FqdnConfig,
        allocator: Arc<dyn IdentityAllocator>,
        selector_cache: Arc<dyn SelectorCache>,
    ) -> Self {
        let cache = DnsCache::with_limits(
            config.min_ttl,
            config.max_cache_entries,
            config.max_ips_per_name,
        );
        let name_manager = Arc::new(NameManager::new(cache, allocator, selector_cache));
        Self {
            locks: ShardLockPool::new(config.shard_count),
            config,
            name_manager,
            endpoints: RwLock::new(HashMap::new()),
        }
    }

    /// The name manager.
    pub fn name_manager(&self) -> &Arc<NameManager> {
        &self.name_manager
    }

    /// The configuration the daemon runs with.
    pub fn config(&self) -> &FqdnConfig {
        &self.config
    }

    /// Register every selector from the configuration.
    pub fn register_configured_selectors(&self) -> Result<(), FqdnError> {
        for selector in &self.config.selectors {
            self.name_manager.register_selector(selector)?;
        }
        Ok(())
    }

    /// Register one selector.
    pub fn register_selector(&self, selector: &FqdnSelector) -> Result<(), FqdnError> {
        self.name_manager.register_selector(selector).map(|_| ())
    }

    /// Endpoint `id`, created with empty state on first use.
    pub fn endpoint(&self, id: EndpointId) -> Arc<Endpoint> {
        if let Some(endpoint) = self.endpoints.read().get(&id) {
            return endpoint.clone();
        }

        self.endpoints
            .write()
            .entry(id)
            .or_insert_with(|| {
                debug!(endpoint = id, "created endpoint DNS state");
                Arc::new(Endpoint::new(
                    id,
                    DnsCache::with_limits(
                        self.config.min_ttl,
                        self.config.max_entries_per_endpoint,
                        self.config.max_ips_per_name,
                    ),
                    ZombieMappings::new(self.config.max_zombies, self.config.zombie_idle_grace()),
                ))
            })
            .clone()
    }

    /// Endpoint `id`, if known.
    pub fn get_endpoint(&self, id: EndpointId) -> Option<Arc<Endpoint>> {
        self.endpoints.read().get(&id).cloned()
    }

    /// Forget endpoint `id`. Its mappings are released by the next GC once
    /// no other endpoint holds them.
    pub fn remove_endpoint(&self, id: EndpointId) -> Option<Arc<Endpoint>> {
        let removed = self.endpoints.write().remove(&id);
        if removed.is_some() {
            info!(endpoint = id, "removed endpoint DNS state");
        }
        removed
    }

    /// Number of known endpoints.
    pub fn endpoint_count(&self) -> usize {
        self.endpoints.read().len()
    }

    /// Handle a DNS message observed by the proxy on behalf of `endpoint`.
    ///
    /// Non-responses, failed responses and responses without addresses are
    /// ignored. Malformed responses are logged and ignored. When `ctx`
    /// carries a deadline, lock acquisition and the selector push give up
    /// once it passes.
    #[allow(clippy::too_many_arguments)]
    pub fn notify_dns_message(
        &self,
        lookup_time: Instant,
        endpoint: &Endpoint,
        client: SocketAddr,
        server: SocketAddr,
        message: &Message,
        protocol: Protocol,
        is_response: bool,
        ctx: &RequestContext,
    ) -> Result<(), FqdnError> {
        let timer = Timer::start();
        let result = self.handle_dns_message(
            lookup_time,
            endpoint,
            client,
            server,
            message,
            protocol,
            is_response,
            ctx,
        );

        let outcome = match &result {
            Ok(outcome) => *outcome,
            Err(FqdnError::Allocator(_)) => MessageResult::AllocatorError,
            Err(FqdnError::DeadlineExceeded) => MessageResult::DeadlineExceeded,
            Err(_) => MessageResult::Failed,
        };
        metrics::record_dns_message(outcome, timer.elapsed());

        result.map(|_| ())
    }

    /// Like [`notify_dns_message`](Self::notify_dns_message), from raw wire
    /// bytes. Undecodable bytes are logged and ignored.
    pub fn notify_dns_wire(
        &self,
        lookup_time: Instant,
        endpoint: &Endpoint,
        client: SocketAddr,
        server: SocketAddr,
        wire: &[u8],
        protocol: Protocol,
        ctx: &RequestContext,
    ) -> Result<(), FqdnError> {
        let message = match Message::from_vec(wire) {
            Ok(message) => message,
            Err(e) => {
                warn!(
                    endpoint = endpoint.id(),
                    %client,
                    %server,
                    bytes = wire.len(),
                    error = %e,
                    "dropping undecodable DNS message"
                );
                metrics::record_dns_message(MessageResult::Malformed, Duration::ZERO);
                return Ok(());
            }
        };

        let is_response = message.message_type() == MessageType::Response;
        self.notify_dns_message(
            lookup_time,
            endpoint,
            client,
            server,
            &message,
            protocol,
            is_response,
            ctx,
        )
    }

    #[allow(clippy::too_many_arguments)]
    fn handle_dns_message(
        &self,
        lookup_time: Instant,
        endpoint: &Endpoint,
        client: SocketAddr,
        server: SocketAddr,
        message: &Message,
        protocol: Protocol,
        is_response: bool,
        ctx: &RequestContext,
    ) -> Result<MessageResult, FqdnError> {
        if !is_response {
            trace!(endpoint = endpoint.id(), %client, %server, "ignoring DNS request");
            return Ok(MessageResult::Ignored);
        }

        let details = match extract_response_ips(message) {
            Ok(details) => details,
            Err(e) => {
                warn!(
                    endpoint = endpoint.id(),
                    %client,
                    %server,
                    error = %e,
                    "dropping malformed DNS response"
                );
                return Ok(MessageResult::Malformed);
            }
        };

        if details.rcode != ResponseCode::NoError || details.response_ips.is_empty() {
            debug!(
                endpoint = endpoint.id(),
                qname = %details.qname,
                rcode = %details.rcode,
                "ignoring DNS response without addresses"
            );
            return Ok(MessageResult::Ignored);
        }

        debug!(
            endpoint = endpoint.id(),
            qname = %details.qname,
            %server,
            protocol = ?protocol,
            names = details.response_ips.len(),
            "processing DNS response"
        );

        let ips = details.all_ips();
        let work = || self.apply_response(lookup_time, endpoint, &details, ctx);
        match ctx.deadline() {
            Some(deadline) => self.locks.with_locks_until(&ips, deadline, work)??,
            None => self.locks.with_locks(&ips, work)?,
        }
        Ok(MessageResult::Processed)
    }

    /// Update endpoint history, then the name manager. Runs under the shard
    /// locks of every IP in `details`.
    fn apply_response(
        &self,
        lookup_time: Instant,
        endpoint: &Endpoint,
        details: &ResponseDetails,
        ctx: &RequestContext,
    ) -> Result<(), FqdnError> {
        {
            let mut history = endpoint.dns_history();
            let mut evicted = Vec::new();
            for (name, records) in &details.response_ips {
                evicted.extend(history.update(lookup_time, name, &records.ips, records.ttl));
            }

            let mut zombies = endpoint.dns_zombies();
            let owner = ZombieOwner::Endpoint(endpoint.id());
            for (name, records) in &details.response_ips {
                for ip in &records.ips {
                    zombies.release(&owner, name, *ip);
                }
            }
            for entry in evicted {
                if !history.contains(&entry.name, entry.ip)
                    && self.name_manager.is_attributed(&entry.name, entry.ip)
                {
                    zombies.mark_zombie(lookup_time, &entry.name, entry.ip, owner.clone());
                }
            }
        }

        let outcome = self
            .name_manager
            .ingest_dns_records(ctx, lookup_time, &details.response_ips)?;
        debug!(
            endpoint = endpoint.id(),
            qname = %details.qname,
            selectors = outcome.used_selectors.len(),
            new_identities = outcome.new_identities.len(),
            "updated FQDN identities"
        );
        Ok(())
    }

    /// Drop `owner`'s zombie claim on `name` → `ip` held by `endpoint`.
    ///
    /// The attribution is released once no endpoint history or zombie
    /// holds the mapping any more.
    pub fn release_zombie(
        &self,
        endpoint: &Endpoint,
        owner: &ZombieOwner,
        name: &str,
        ip: IpAddr,
    ) -> UpdateCompletion {
        self.locks.with_locks(&[ip], || {
            let released = endpoint.dns_zombies().release(owner, name, ip);
            match released {
                Some(mapping) if !self.is_held(&mapping.name, mapping.ip) => {
                    self.name_manager.release_mapping(&mapping.name, mapping.ip)
                }
                _ => UpdateCompletion::new(),
            }
        })
    }

    /// Refresh every zombie for `ip` on every endpoint, e.g. because
    /// connection tracking still sees traffic to it.
    pub fn mark_alive(&self, now: Instant, ip: IpAddr) {
        let endpoints: Vec<Arc<Endpoint>> = self.endpoints.read().values().cloned().collect();
        for endpoint in endpoints {
            endpoint.dns_zombies().mark_alive(now, ip);
        }
    }

    /// True if any endpoint's history or zombie set holds `name` → `ip`.
    /// Endpoint locks are taken one endpoint at a time.
    fn is_held(&self, name: &str, ip: IpAddr) -> bool {
        let endpoints: Vec<Arc<Endpoint>> = self.endpoints.read().values().cloned().collect();
        endpoints.iter().any(|endpoint| {
            endpoint.dns_history().contains(name, ip) || endpoint.dns_zombies().claims(name, ip)
        })
    }

    /// Run one GC sweep.
    ///
    /// Expired history entries still backing an attribution become zombies.
    /// Zombies that are no longer selected, idle past the grace period or
    /// over the size bound die. Mappings no endpoint holds any more are
    /// expired from the process-wide cache and their attributions released.
    pub fn gc(&self, now: Instant) -> GcStats {
        let timer = Timer::start();
        let endpoints: Vec<Arc<Endpoint>> = self.endpoints.read().values().cloned().collect();

        let mut stats = GcStats::default();
        let mut active: HashSet<(String, IpAddr)> = HashSet::new();

        for endpoint in &endpoints {
            let mut history = endpoint.dns_history();
            let mut zombies = endpoint.dns_zombies();
            let owner = ZombieOwner::Endpoint(endpoint.id());

            let expired = history.prune(now, &zombies);
            stats.expired_entries += expired.len();
            for entry in expired {
                if !history.contains(&entry.name, entry.ip)
                    && self.name_manager.is_attributed(&entry.name, entry.ip)
                {
                    zombies.mark_zombie(now, &entry.name, entry.ip, owner.clone());
                }
            }

            let (alive, dead) = zombies.gc(now, |name, _| self.name_manager.is_selected(name));
            stats.dead_zombies += dead.len();
            for zombie in &dead {
                history.remove(&zombie.name, zombie.ip);
            }

            active.extend(history.live_pairs(now));
            active.extend(alive.into_iter().map(|z| (z.name, z.ip)));
        }

        let outcome = self.name_manager.expire_unreferenced(now, &active);
        stats.expired_global_entries = outcome.expired_entries;
        stats.released = outcome.released;
        stats.completion = outcome.completion;

        metrics::record_gc(stats.expired_entries, stats.dead_zombies, stats.released);
        debug!(
            endpoints = endpoints.len(),
            expired_entries = stats.expired_entries,
            dead_zombies = stats.dead_zombies,
            released = stats.released,
            elapsed_ms = timer.elapsed().as_millis() as u64,
            "FQDN GC sweep"
        );
        stats
    }

    /// Drop every DNS mapping whose name matches `selector` from endpoint
    /// histories and the process-wide cache, regardless of TTL, and release
    /// the attributions behind them. Zombies are left alone and keep their
    /// mappings attributed.
    pub fn force_expire(&self, selector: &FqdnSelector) -> Result<ExpireOutcome, FqdnError> {
        let matcher = selector.compile()?;
        let endpoints: Vec<Arc<Endpoint>> = self.endpoints.read().values().cloned().collect();

        let mut history_entries = 0;
        let mut zombie_pairs: HashSet<(String, IpAddr)> = HashSet::new();
        for endpoint in &endpoints {
            history_entries += endpoint.dns_history().force_expire(&matcher, |_| false).len();
            zombie_pairs.extend(
                endpoint
                    .dns_zombies()
                    .dump()
                    .into_iter()
                    .map(|zombie| (zombie.name, zombie.ip)),
            );
        }

        let outcome = self.name_manager.force_expire(selector, &zombie_pairs)?;
        info!(
            %selector,
            endpoints = endpoints.len(),
            history_entries,
            released = outcome.released,
            "force-expired FQDN mappings"
        );
        Ok(outcome)
    }

    /// Total zombies across endpoints.
    pub fn zombie_count(&self) -> usize {
        let endpoints: Vec<Arc<Endpoint>> = self.endpoints.read().values().cloned().collect();
        endpoints.iter().map(|e| e.dns_zombies().len()).sum()
    }

    /// Emit state gauges.
    pub fn emit_metrics(&self) {
        metrics::record_state_counts(
            self.name_manager.selectors().len(),
            self.endpoint_count(),
            self.name_manager.cache_len(),
            self.zombie_count(),
        );
        metrics::record_attributions(self.name_manager.attribution_count());
    }

    /// Run periodic GC and metrics until `cancel` fires.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        info!(
            gc_interval_secs = self.config.gc_interval_secs,
            shards = self.locks.len(),
            selectors = self.name_manager.selectors().len(),
            "Starting FQDN identity daemon"
        );

        let mut gc_interval =
            tokio::time::interval(self.config.gc_interval().max(Duration::from_secs(1)));
        let mut metrics_interval = tokio::time::interval(METRICS_INTERVAL);
        // Skip the immediate first tick.
        gc_interval.tick().await;

        self.emit_metrics();

        loop {
            tokio::select! {
                _ = gc_interval.tick() => {
                    self.gc(Instant::now());
                }
                _ = metrics_interval.tick() => {
                    self.emit_metrics();
                    debug!(
                        endpoints = self.endpoint_count(),
                        cache_entries = self.name_manager.cache_len(),
                        attributions = self.name_manager.attribution_count(),
                        "emitted state metrics"
                    );
                }
                _ = cancel.cancelled() => {
                    info!("FQDN identity daemon shutting down");
                    return;
                }
            }
        }
    }
}
