//! Numeric identities and the allocator contract consumed by the name manager.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::net::IpAddr;
use tracing::{debug, warn};

use crate::error::AllocatorError;

/// First identity of the node-local range used for CIDR identities.
pub const LOCAL_IDENTITY_FLAG: u32 = 1 << 24;

/// Numeric token used by the policy-enforcement layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NumericIdentity(pub u32);

impl fmt::Display for NumericIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// An allocated identity together with the address it represents.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    /// Numeric identity.
    pub id: NumericIdentity,
    /// Host address the identity was allocated for.
    pub ip: IpAddr,
}

/// Reference-counted IP → identity allocation.
///
/// Implementations must be safe to call from many threads at once; the
/// name manager does not serialize calls across different IPs.
pub trait IdentityAllocator: Send + Sync {
    /// Allocate (or take another reference on) one identity per IP.
    ///
    /// The result has the same length and order as `ips`. Duplicate IPs
    /// take one reference each.
    fn allocate_cidrs_for_ips(&self, ips: &[IpAddr]) -> Result<Vec<Identity>, AllocatorError>;

    /// Drop one reference per listed identity, deallocating at zero.
    fn release_identities(&self, ids: &[NumericIdentity]);

    /// Snapshot of outstanding references per identity.
    fn reference_counts(&self) -> HashMap<NumericIdentity, usize>;
}

/// In-memory allocator handing out identities from a local range.
#[derive(Debug)]
pub struct LocalIdentityAllocator {
    inner: Mutex<AllocatorInner>,
}

#[derive(Debug)]
struct AllocatorInner {
    start: u32,
    size: u32,

    /// Next never-used offset into the range.
    next: u32,

    /// Numbers returned by deallocation, reused before `next`.
    free: Vec<NumericIdentity>,

    by_ip: HashMap<IpAddr, NumericIdentity>,
    by_id: HashMap<NumericIdentity, IpAddr>,
    refs: HashMap<NumericIdentity, usize>,
}

impl Default for LocalIdentityAllocator {
    fn default() -> Self {
        Self::new(LOCAL_IDENTITY_FLAG, u16::MAX as u32)
    }
}

impl LocalIdentityAllocator {
    /// Create an allocator over `[start, start + size)`.
    pub fn new(start: u32, size: u32) -> Self {
        Self {
            inner: Mutex::new(AllocatorInner {
                start,
                size,
                next: 0,
                free: Vec::new(),
                by_ip: HashMap::new(),
                by_id: HashMap::new(),
                refs: HashMap::new(),
            }),
        }
    }

    /// Identity currently bound to `ip`, if any.
    pub fn lookup(&self, ip: &IpAddr) -> Option<NumericIdentity> {
        self.inner.lock().by_ip.get(ip).copied()
    }

    /// Number of identities currently allocated.
    pub fn allocated_count(&self) -> usize {
        self.inner.lock().refs.len()
    }
}

impl AllocatorInner {
    fn acquire(&mut self, ip: IpAddr) -> Result<NumericIdentity, AllocatorError> {
        if let Some(id) = self.by_ip.get(&ip).copied() {
            *self.refs.entry(id).or_insert(0) += 1;
            return Ok(id);
        }

        let id = match self.free.pop() {
            Some(id) => id,
            None if self.next < self.size => {
                let id = NumericIdentity(self.start + self.next);
                self.next += 1;
                id
            }
            None => {
                return Err(AllocatorError::Exhausted {
                    start: self.start,
                    size: self.size,
                })
            }
        };

        debug!(%ip, identity = %id, "allocated identity");
        self.by_ip.insert(ip, id);
        self.by_id.insert(id, ip);
        self.refs.insert(id, 1);
        Ok(id)
    }

    fn release(&mut self, id: NumericIdentity) {
        let Some(count) = self.refs.get_mut(&id) else {
            warn!(identity = %id, "release of unknown identity");
            return;
        };

        *count -= 1;
        if *count == 0 {
            self.refs.remove(&id);
            if let Some(ip) = self.by_id.remove(&id) {
                self.by_ip.remove(&ip);
                debug!(%ip, identity = %id, "deallocated identity");
            }
            self.free.push(id);
        }
    }
}

impl IdentityAllocator for LocalIdentityAllocator {
    fn allocate_cidrs_for_ips(&self, ips: &[IpAddr]) -> Result<Vec<Identity>, AllocatorError> {
        let mut inner = self.inner.lock();
        let mut result = Vec::with_capacity(ips.len());

        for ip in ips {
            match inner.acquire(*ip) {
                Ok(id) => result.push(Identity { id, ip: *ip }),
                Err(e) => {
                    // All-or-nothing: undo the references taken so far.
                    for identity in &result {
                        inner.release(identity.id);
                    }
                    return Err(e);
                }
            }
        }

        Ok(result)
    }

    fn release_identities(&self, ids: &[NumericIdentity]) {
        let mut inner = self.inner.lock();
        for id in ids {
            inner.release(*id);
        }
    }

    fn reference_counts(&self) -> HashMap<NumericIdentity, usize> {
        self.inner.lock().refs.clone()
    }
}
