//! FQDN identity - DNS-driven identity lifecycle for FQDN network policy.
//!
//! A DNS proxy reports every response it forwards for a workload endpoint.
//! This crate turns those observations into security identities for the
//! returned addresses and keeps the identity sets of FQDN selectors current,
//! so that policy naming `cilium.io` or `*.cilium.io` follows what the
//! names actually resolve to.
//!
//! ## Features
//!
//! - Per-endpoint DNS history with TTL and size bounds
//! - Zombie tracking for mappings evicted while still in use
//! - Exact and wildcard FQDN selectors
//! - Reference-counted identity allocation, one reference per
//!   (selector, name, IP) attribution
//! - 128-way sharded locking so unrelated responses proceed in parallel
//! - Periodic and on-demand garbage collection
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                        fqdn-identity                            │
//! │                                                                 │
//! │  DNS proxy ──▶ notify_dns_message                               │
//! │                     │                                           │
//! │                     ▼                                           │
//! │            ┌──────────────────┐    ┌──────────────────┐         │
//! │            │ Shard Lock Pool  │───▶│ Endpoint history │         │
//! │            │ (per response IP)│    │ + zombies        │         │
//! │            └────────┬─────────┘    └──────────────────┘         │
//! │                     ▼                                           │
//! │            ┌──────────────────┐    ┌──────────────────┐         │
//! │            │  Name Manager    │───▶│ Identity         │         │
//! │            │  (selectors,     │    │ Allocator        │         │
//! │            │   global cache)  │    └──────────────────┘         │
//! │            └────────┬─────────┘                                 │
//! │                     ▼                                           │
//! │            ┌──────────────────┐                                 │
//! │            │ Selector Cache   │──▶ policy engine                │
//! │            └──────────────────┘                                 │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Example Usage
//!
//! ```rust,ignore
//! use fqdn_identity::{FqdnConfig, FqdnDaemon, InMemorySelectorCache, LocalIdentityAllocator};
//! use std::sync::Arc;
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() {
//!     let daemon = Arc::new(FqdnDaemon::new(
//!         FqdnConfig::default(),
//!         Arc::new(LocalIdentityAllocator::default()),
//!         Arc::new(InMemorySelectorCache::new()),
//!     ));
//!
//!     let cancel = CancellationToken::new();
//!     daemon.run(cancel).await;
//! }
//! ```

#![warn(missing_docs)]

pub mod config;
pub mod daemon;
pub mod dns_cache;
pub mod endpoint;
pub mod error;
pub mod identity;
pub mod lockpool;
pub mod message;
pub mod metrics;
pub mod name_manager;
pub mod selector;
pub mod selector_cache;
pub mod telemetry;
pub mod zombie;

// Re-export main types
pub use config::{Config, FqdnConfig, TelemetryConfig};
pub use daemon::{FqdnDaemon, GcStats};
pub use dns_cache::{DnsCache, DnsRecordEntry};
pub use endpoint::Endpoint;
pub use error::{AllocatorError, FqdnError};
pub use identity::{Identity, IdentityAllocator, LocalIdentityAllocator, NumericIdentity};
pub use lockpool::ShardLockPool;
pub use name_manager::{DnsIpRecords, ExpireOutcome, IngestOutcome, NameManager, RequestContext};
pub use selector::{to_fqdn, FqdnSelector, SelectorMatcher};
pub use selector_cache::{InMemorySelectorCache, SelectorCache, SelectorUpdate, UpdateCompletion};
pub use zombie::{DnsZombieMapping, EndpointId, ZombieMappings, ZombieOwner};
