//! Metrics instrumentation for fqdn-identity.
//!
//! All metrics are prefixed with `fqdn.`

use metrics::{counter, gauge, histogram};
use std::time::Instant;

/// Record a DNS message seen by the proxy callback.
pub fn record_dns_message(result: MessageResult, duration: std::time::Duration) {
    let result_str = match result {
        MessageResult::Processed => "processed",
        MessageResult::Ignored => "ignored",
        MessageResult::Malformed => "malformed",
        MessageResult::AllocatorError => "allocator_error",
        MessageResult::DeadlineExceeded => "deadline_exceeded",
        MessageResult::Failed => "failed",
    };

    counter!("fqdn.dns_message.count", "result" => result_str).increment(1);
    histogram!("fqdn.dns_message.duration.seconds", "result" => result_str)
        .record(duration.as_secs_f64());
}

/// Outcome of handling one DNS message.
#[derive(Debug, Clone, Copy)]
pub enum MessageResult {
    /// Response fed into identity bookkeeping.
    Processed,
    /// Not a response, failed rcode, or no addresses.
    Ignored,
    /// Message could not be decoded.
    Malformed,
    /// Identity allocation failed.
    AllocatorError,
    /// Caller's deadline passed.
    DeadlineExceeded,
    /// Any other error.
    Failed,
}

/// Record time spent acquiring shard locks.
pub fn record_lock_wait(shards: usize, duration: std::time::Duration) {
    histogram!("fqdn.shard_lock.wait.seconds").record(duration.as_secs_f64());
    histogram!("fqdn.shard_lock.shards_per_message").record(shards as f64);
}

/// Record identity references taken for new attributions.
pub fn record_identities_allocated(count: usize) {
    counter!("fqdn.identity.allocated.count").increment(count as u64);
}

/// Record identity references released.
pub fn record_identities_released(count: usize) {
    counter!("fqdn.identity.released.count").increment(count as u64);
}

/// Record a selector registration change.
pub fn record_selector_change(change: SelectorChange) {
    let change_str = match change {
        SelectorChange::Registered => "registered",
        SelectorChange::Rejected => "rejected",
        SelectorChange::Unregistered => "unregistered",
    };
    counter!("fqdn.selector.change.count", "change" => change_str).increment(1);
}

/// Selector registration changes.
#[derive(Debug, Clone, Copy)]
pub enum SelectorChange {
    /// Selector added.
    Registered,
    /// Selector failed to compile.
    Rejected,
    /// Selector removed.
    Unregistered,
}

/// Record the result of a GC sweep.
pub fn record_gc(expired_entries: usize, dead_zombies: usize, released: usize) {
    counter!("fqdn.gc.run.count").increment(1);
    counter!("fqdn.gc.expired_entries.count").increment(expired_entries as u64);
    counter!("fqdn.gc.dead_zombies.count").increment(dead_zombies as u64);
    counter!("fqdn.gc.released_attributions.count").increment(released as u64);
}

/// Record state counts (call periodically or on change).
pub fn record_state_counts(selectors: usize, endpoints: usize, cache_entries: usize, zombies: usize) {
    gauge!("fqdn.state.selectors.count").set(selectors as f64);
    gauge!("fqdn.state.endpoints.count").set(endpoints as f64);
    gauge!("fqdn.state.cache_entries.count").set(cache_entries as f64);
    gauge!("fqdn.state.zombies.count").set(zombies as f64);
}

/// Record the number of live (selector, name, IP) attributions.
pub fn record_attributions(count: usize) {
    gauge!("fqdn.state.attributions.count").set(count as f64);
}

/// Helper for timing operations.
pub struct Timer {
    start: Instant,
}

impl Timer {
    /// Start a new timer.
    pub fn start() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    /// Get elapsed duration since timer start.
    pub fn elapsed(&self) -> std::time::Duration {
        self.start.elapsed()
    }
}
