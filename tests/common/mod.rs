//! Shared test infrastructure for daemon integration tests.

#![allow(dead_code)]

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use hickory_proto::op::{Message, MessageType, Query, ResponseCode};
use hickory_proto::rr::rdata::{A, AAAA, CNAME};
use hickory_proto::rr::{Name, RData, Record, RecordType};
use hickory_proto::xfer::Protocol;

use fqdn_identity::{
    AllocatorError, Endpoint, FqdnConfig, FqdnDaemon, Identity, IdentityAllocator,
    InMemorySelectorCache, LocalIdentityAllocator, NumericIdentity, RequestContext,
};

// --- Harness ---

/// Daemon wired to in-memory services the test can inspect.
pub struct TestHarness {
    pub daemon: Arc<FqdnDaemon>,
    pub allocator: Arc<LocalIdentityAllocator>,
    pub selector_cache: Arc<InMemorySelectorCache>,
}

impl TestHarness {
    pub fn new() -> Self {
        Self::with_config(FqdnConfig::default())
    }

    pub fn with_config(config: FqdnConfig) -> Self {
        let allocator = Arc::new(LocalIdentityAllocator::new(
            config.identity_range_start,
            config.identity_range_size,
        ));
        let selector_cache = Arc::new(InMemorySelectorCache::new());
        let daemon = Arc::new(FqdnDaemon::new(
            config,
            allocator.clone(),
            selector_cache.clone(),
        ));
        Self {
            daemon,
            allocator,
            selector_cache,
        }
    }

    /// Deliver `message` as a response seen by `endpoint`.
    pub fn notify(
        &self,
        at: Instant,
        endpoint: &Endpoint,
        message: &Message,
    ) -> Result<(), fqdn_identity::FqdnError> {
        self.notify_with(at, endpoint, message, &RequestContext::new())
    }

    pub fn notify_with(
        &self,
        at: Instant,
        endpoint: &Endpoint,
        message: &Message,
        ctx: &RequestContext,
    ) -> Result<(), fqdn_identity::FqdnError> {
        self.daemon.notify_dns_message(
            at,
            endpoint,
            client_addr(),
            server_addr(),
            message,
            Protocol::Udp,
            message.message_type() == MessageType::Response,
            ctx,
        )
    }

    /// Total allocator references across identities.
    pub fn total_refs(&self) -> usize {
        self.allocator.reference_counts().values().sum()
    }

    pub fn identity_count(&self) -> usize {
        self.allocator.reference_counts().len()
    }

    pub fn identity_of(&self, ip: &str) -> Option<NumericIdentity> {
        self.allocator.lookup(&ip.parse().unwrap())
    }
}

// --- Allocators ---

/// Wraps a local allocator, sleeping inside every allocation and recording
/// how many allocations ran at once.
#[derive(Debug, Default)]
pub struct SlowAllocator {
    inner: LocalIdentityAllocator,
    delay: Duration,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl SlowAllocator {
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            ..Default::default()
        }
    }

    /// Highest number of allocations observed running concurrently.
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }
}

impl IdentityAllocator for SlowAllocator {
    fn allocate_cidrs_for_ips(&self, ips: &[IpAddr]) -> Result<Vec<Identity>, AllocatorError> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        std::thread::sleep(self.delay);
        let result = self.inner.allocate_cidrs_for_ips(ips);
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        result
    }

    fn release_identities(&self, ids: &[NumericIdentity]) {
        self.inner.release_identities(ids)
    }

    fn reference_counts(&self) -> HashMap<NumericIdentity, usize> {
        self.inner.reference_counts()
    }
}

/// Allocator whose backend is unreachable.
#[derive(Debug, Default)]
pub struct UnavailableAllocator;

impl IdentityAllocator for UnavailableAllocator {
    fn allocate_cidrs_for_ips(&self, _ips: &[IpAddr]) -> Result<Vec<Identity>, AllocatorError> {
        Err(AllocatorError::Unavailable(
            "identity backend unreachable".to_string(),
        ))
    }

    fn release_identities(&self, _ids: &[NumericIdentity]) {}

    fn reference_counts(&self) -> HashMap<NumericIdentity, usize> {
        HashMap::new()
    }
}

/// Daemon with default config around `allocator`.
pub fn daemon_with(allocator: Arc<dyn IdentityAllocator>) -> Arc<FqdnDaemon> {
    Arc::new(FqdnDaemon::new(
        FqdnConfig::default(),
        allocator,
        Arc::new(InMemorySelectorCache::new()),
    ))
}

/// Deliver `message` to `daemon` as a response seen by `endpoint`.
pub fn notify_daemon(
    daemon: &FqdnDaemon,
    endpoint: &Endpoint,
    message: &Message,
) -> Result<(), fqdn_identity::FqdnError> {
    daemon.notify_dns_message(
        Instant::now(),
        endpoint,
        client_addr(),
        server_addr(),
        message,
        Protocol::Udp,
        true,
        &RequestContext::new(),
    )
}

// --- Addresses ---

pub fn client_addr() -> SocketAddr {
    "10.0.0.1:40000".parse().unwrap()
}

pub fn server_addr() -> SocketAddr {
    "10.0.0.53:53".parse().unwrap()
}

pub fn ip(s: &str) -> IpAddr {
    s.parse().unwrap()
}

// --- Message builders ---

/// Builds DNS responses for one question name.
pub struct ResponseBuilder {
    message: Message,
}

impl ResponseBuilder {
    pub fn new(qname: &str) -> Self {
        let mut message = Message::new();
        message.set_id(4242);
        message.set_message_type(MessageType::Response);
        message.set_response_code(ResponseCode::NoError);
        message.add_query(Query::query(Name::from_str(qname).unwrap(), RecordType::A));
        Self { message }
    }

    pub fn a(mut self, name: &str, ttl: u32, addr: &str) -> Self {
        self.message.add_answer(Record::from_rdata(
            Name::from_str(name).unwrap(),
            ttl,
            RData::A(A(addr.parse().unwrap())),
        ));
        self
    }

    pub fn aaaa(mut self, name: &str, ttl: u32, addr: &str) -> Self {
        self.message.add_answer(Record::from_rdata(
            Name::from_str(name).unwrap(),
            ttl,
            RData::AAAA(AAAA(addr.parse().unwrap())),
        ));
        self
    }

    pub fn cname(mut self, name: &str, ttl: u32, target: &str) -> Self {
        self.message.add_answer(Record::from_rdata(
            Name::from_str(name).unwrap(),
            ttl,
            RData::CNAME(CNAME(Name::from_str(target).unwrap())),
        ));
        self
    }

    pub fn rcode(mut self, rcode: ResponseCode) -> Self {
        self.message.set_response_code(rcode);
        self
    }

    pub fn query(mut self) -> Self {
        self.message.set_message_type(MessageType::Query);
        self
    }

    pub fn build(self) -> Message {
        self.message
    }
}

/// Single-name A response.
pub fn a_response(name: &str, ttl: u32, addrs: &[&str]) -> Message {
    addrs
        .iter()
        .fold(ResponseBuilder::new(name), |b, addr| b.a(name, ttl, addr))
        .build()
}
