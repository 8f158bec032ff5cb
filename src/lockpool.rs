//! Fixed pool of mutexes selected by hashing response IPs.
//!
//! DNS responses that share an address must not update reference counts
//! concurrently, while responses for unrelated addresses should not wait on
//! each other. Locks are always taken in ascending shard order.

use parking_lot::{Mutex, MutexGuard};
use std::collections::BTreeSet;
use std::net::IpAddr;
use std::time::Instant;
use tracing::trace;

use crate::error::FqdnError;
use crate::metrics::{self, Timer};

/// Default number of shards.
pub const DEFAULT_SHARD_COUNT: usize = 128;

/// Arena of independently lockable shards.
#[derive(Debug)]
pub struct ShardLockPool {
    shards: Box<[Mutex<()>]>,
}

impl Default for ShardLockPool {
    fn default() -> Self {
        Self::new(DEFAULT_SHARD_COUNT)
    }
}

impl ShardLockPool {
    /// Create a pool with `count` shards (at least one).
    pub fn new(count: usize) -> Self {
        let shards = (0..count.max(1)).map(|_| Mutex::new(())).collect();
        Self { shards }
    }

    /// Number of shards.
    pub fn len(&self) -> usize {
        self.shards.len()
    }

    /// Always false; a pool has at least one shard.
    pub fn is_empty(&self) -> bool {
        self.shards.is_empty()
    }

    /// Shard for a single address: the last four octets, big-endian,
    /// modulo the shard count.
    pub fn shard_for(&self, ip: &IpAddr) -> usize {
        let tail = match ip.to_canonical() {
            IpAddr::V4(v4) => v4.octets(),
            IpAddr::V6(v6) => {
                let octets = v6.octets();
                [octets[12], octets[13], octets[14], octets[15]]
            }
        };
        u32::from_be_bytes(tail) as usize % self.shards.len()
    }

    /// Deduplicated shard indices for `ips`, ascending.
    pub fn locks_for(&self, ips: &[IpAddr]) -> Vec<usize> {
        ips.iter()
            .map(|ip| self.shard_for(ip))
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }

    /// Run `f` while holding every shard covering `ips`.
    pub fn with_locks<R>(&self, ips: &[IpAddr], f: impl FnOnce() -> R) -> R {
        let indices = self.locks_for(ips);
        let timer = Timer::start();
        let guards: Vec<MutexGuard<'_, ()>> =
            indices.iter().map(|i| self.shards[*i].lock()).collect();
        metrics::record_lock_wait(guards.len(), timer.elapsed());
        trace!(shards = ?indices, "acquired shard locks");

        let result = f();
        drop(guards);
        result
    }

    /// Like [`with_locks`](Self::with_locks), but gives up once `deadline`
    /// passes. Shards already taken are released and `f` is not run.
    pub fn with_locks_until<R>(
        &self,
        ips: &[IpAddr],
        deadline: Instant,
        f: impl FnOnce() -> R,
    ) -> Result<R, FqdnError> {
        let indices = self.locks_for(ips);
        let timer = Timer::start();
        let mut guards = Vec::with_capacity(indices.len());
        for i in &indices {
            match self.shards[*i].try_lock_until(deadline) {
                Some(guard) => guards.push(guard),
                None => {
                    metrics::record_lock_wait(guards.len(), timer.elapsed());
                    trace!(shard = i, "deadline passed waiting for shard lock");
                    return Err(FqdnError::DeadlineExceeded);
                }
            }
        }
        metrics::record_lock_wait(guards.len(), timer.elapsed());

        let result = f();
        drop(guards);
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ::metrics::{
        Counter, Gauge, Histogram, HistogramFn, Key, KeyName, Metadata, Recorder, SharedString,
        Unit,
    };
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Barrier};
    use std::thread;
    use std::time::Duration;

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    #[test]
    fn test_distinct_last_octets_get_distinct_shards() {
        let pool = ShardLockPool::default();
        let ips: Vec<IpAddr> = (0..64).map(|i| ip(&format!("1.1.1.{i}"))).collect();

        let shards = pool.locks_for(&ips);
        assert_eq!(shards.len(), 64);
        assert_eq!(shards[0], 0);
        assert_eq!(shards[shards.len() - 1], shards.len() - 1);
    }

    #[test]
    fn test_colliding_ips_collapse_to_one_shard() {
        let pool = ShardLockPool::default();
        let ips: Vec<IpAddr> = (0..64).map(|i| ip(&format!("1.{i}.1.1"))).collect();

        assert_eq!(pool.locks_for(&ips), vec![1]);
    }

    #[test]
    fn test_duplicates_collapse_and_order_is_ascending() {
        let pool = ShardLockPool::default();
        let shards = pool.locks_for(&[ip("10.0.0.9"), ip("10.0.0.3"), ip("10.0.0.9")]);
        assert_eq!(shards, vec![3, 9]);
    }

    #[test]
    fn test_shard_is_deterministic_for_ipv6() {
        let pool = ShardLockPool::default();
        let v6 = ip("2001:db8::1:5");
        assert_eq!(pool.shard_for(&v6), pool.shard_for(&v6));
        assert_eq!(pool.shard_for(&v6), 5);
        assert_eq!(pool.shard_for(&ip("::ffff:1.1.1.7")), 7);
    }

    #[test]
    fn test_disjoint_shards_run_in_parallel() {
        let pool = Arc::new(ShardLockPool::default());
        let barrier = Arc::new(Barrier::new(64));

        // Every closure waits for all others while holding its shard; this
        // only completes if no two of them share a lock.
        let handles: Vec<_> = (0..64)
            .map(|i| {
                let pool = pool.clone();
                let barrier = barrier.clone();
                thread::spawn(move || {
                    pool.with_locks(&[ip(&format!("1.1.1.{i}"))], || {
                        barrier.wait();
                    })
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }
    }

    #[test]
    fn test_colliding_shards_are_serialized() {
        let pool = Arc::new(ShardLockPool::default());
        let inside = Arc::new(AtomicUsize::new(0));
        let max_inside = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..64)
            .map(|i| {
                let pool = pool.clone();
                let inside = inside.clone();
                let max_inside = max_inside.clone();
                thread::spawn(move || {
                    pool.with_locks(&[ip(&format!("1.{i}.1.1"))], || {
                        let now = inside.fetch_add(1, Ordering::SeqCst) + 1;
                        max_inside.fetch_max(now, Ordering::SeqCst);
                        thread::sleep(Duration::from_millis(1));
                        inside.fetch_sub(1, Ordering::SeqCst);
                    })
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(max_inside.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_locks_released_after_panic() {
        let pool = Arc::new(ShardLockPool::default());
        let ips = [ip("10.0.0.1")];

        let result = thread::spawn({
            let pool = pool.clone();
            move || pool.with_locks(&ips, || panic!("boom"))
        })
        .join();
        assert!(result.is_err());

        assert_eq!(pool.with_locks(&ips, || 7), 7);
    }

    #[test]
    fn test_deadline_expires_while_shard_held() {
        let pool = ShardLockPool::default();
        let ips = [ip("10.0.0.1")];

        pool.with_locks(&ips, || {
            let deadline = Instant::now() + Duration::from_millis(10);
            let result = pool.with_locks_until(&ips, deadline, || ());
            assert!(matches!(result, Err(FqdnError::DeadlineExceeded)));
        });

        let deadline = Instant::now() + Duration::from_millis(10);
        assert_eq!(pool.with_locks_until(&ips, deadline, || 1).unwrap(), 1);
    }

    /// Collects every histogram sample recorded on the current thread.
    #[derive(Default)]
    struct HistogramCapture {
        samples: Arc<Mutex<Vec<(String, f64)>>>,
    }

    struct CapturedHistogram {
        name: String,
        samples: Arc<Mutex<Vec<(String, f64)>>>,
    }

    impl HistogramFn for CapturedHistogram {
        fn record(&self, value: f64) {
            self.samples.lock().push((self.name.clone(), value));
        }
    }

    impl Recorder for HistogramCapture {
        fn describe_counter(&self, _: KeyName, _: Option<Unit>, _: SharedString) {}
        fn describe_gauge(&self, _: KeyName, _: Option<Unit>, _: SharedString) {}
        fn describe_histogram(&self, _: KeyName, _: Option<Unit>, _: SharedString) {}

        fn register_counter(&self, _: &Key, _: &Metadata<'_>) -> Counter {
            Counter::noop()
        }

        fn register_gauge(&self, _: &Key, _: &Metadata<'_>) -> Gauge {
            Gauge::noop()
        }

        fn register_histogram(&self, key: &Key, _: &Metadata<'_>) -> Histogram {
            Histogram::from_arc(Arc::new(CapturedHistogram {
                name: key.name().to_string(),
                samples: self.samples.clone(),
            }))
        }
    }

    #[test]
    fn test_lock_wait_recorded_when_deadline_expires() {
        let pool = ShardLockPool::default();
        let ips = [ip("10.0.0.1")];
        let capture = HistogramCapture::default();

        pool.with_locks(&ips, || {
            let deadline = Instant::now() + Duration::from_millis(10);
            let result = ::metrics::with_local_recorder(&capture, || {
                pool.with_locks_until(&ips, deadline, || ())
            });
            assert!(matches!(result, Err(FqdnError::DeadlineExceeded)));
        });

        let samples = capture.samples.lock();
        let waits: Vec<f64> = samples
            .iter()
            .filter(|(name, _)| name == "fqdn.shard_lock.wait.seconds")
            .map(|(_, value)| *value)
            .collect();
        assert_eq!(waits.len(), 1);
        assert!(waits[0] >= 0.005, "recorded wait {}", waits[0]);
        assert!(samples
            .iter()
            .any(|(name, value)| name == "fqdn.shard_lock.shards_per_message" && *value == 0.0));
    }
}
