//! Selector cache contract and completion tracking for selector updates.
//!
//! The name manager pushes whole identity sets per selector. Consumers of the
//! cache may process the resulting changes asynchronously; an
//! [`UpdateCompletion`] lets the caller wait until they have.

use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Notify};
use tracing::{debug, trace};

use crate::identity::NumericIdentity;
use crate::selector::FqdnSelector;

/// Policy-facing table of selector → identities.
pub trait SelectorCache: Send + Sync {
    /// Replace the identity set of `selector`.
    ///
    /// Consumers that handle the change later hold a token from `done`
    /// until they finish.
    fn update_selector_identities(
        &self,
        selector: &FqdnSelector,
        identities: BTreeSet<NumericIdentity>,
        done: &UpdateCompletion,
    );
}

/// Wait-group style handle resolved when every outstanding token is dropped.
#[derive(Debug, Clone, Default)]
pub struct UpdateCompletion {
    inner: Arc<CompletionInner>,
}

#[derive(Debug, Default)]
struct CompletionInner {
    pending: AtomicUsize,
    notify: Notify,
}

/// Outstanding piece of work tracked by an [`UpdateCompletion`].
#[derive(Debug)]
pub struct CompletionToken {
    inner: Arc<CompletionInner>,
}

impl UpdateCompletion {
    /// Create a handle with no outstanding work.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register one more piece of outstanding work.
    pub fn token(&self) -> CompletionToken {
        self.inner.pending.fetch_add(1, Ordering::AcqRel);
        CompletionToken {
            inner: self.inner.clone(),
        }
    }

    /// True once every issued token has been dropped.
    pub fn is_complete(&self) -> bool {
        self.inner.pending.load(Ordering::Acquire) == 0
    }

    /// Wait until every issued token has been dropped.
    pub async fn wait(&self) {
        loop {
            let notified = self.inner.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.is_complete() {
                return;
            }
            notified.await;
        }
    }
}

impl Drop for CompletionToken {
    fn drop(&mut self) {
        if self.inner.pending.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.inner.notify.notify_waiters();
        }
    }
}

/// Incremental change delivered to selector cache subscribers.
#[derive(Debug)]
pub struct SelectorUpdate {
    /// Selector whose set changed.
    pub selector: FqdnSelector,
    /// Identities that became selected.
    pub added: Vec<NumericIdentity>,
    /// Identities that are no longer selected.
    pub removed: Vec<NumericIdentity>,
    _token: CompletionToken,
}

/// In-memory selector cache.
///
/// Sets are swapped whole so readers never observe a partially applied
/// update. Each effective change is fanned out to subscribers.
#[derive(Debug, Default)]
pub struct InMemorySelectorCache {
    selections: RwLock<HashMap<FqdnSelector, Arc<BTreeSet<NumericIdentity>>>>,
    subscribers: Mutex<Vec<mpsc::UnboundedSender<SelectorUpdate>>>,
}

impl InMemorySelectorCache {
    /// Create an empty cache.
    pub fn new() -> Self {
        Self::default()
    }

    /// Current identities selected by `selector`.
    pub fn selections(&self, selector: &FqdnSelector) -> Arc<BTreeSet<NumericIdentity>> {
        self.selections
            .read()
            .get(selector)
            .cloned()
            .unwrap_or_default()
    }

    /// Number of selectors with a non-empty identity set.
    pub fn selector_count(&self) -> usize {
        self.selections.read().len()
    }

    /// Receive every future change.
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<SelectorUpdate> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers.lock().push(tx);
        rx
    }
}

impl SelectorCache for InMemorySelectorCache {
    fn update_selector_identities(
        &self,
        selector: &FqdnSelector,
        identities: BTreeSet<NumericIdentity>,
        done: &UpdateCompletion,
    ) {
        let (added, removed) = {
            let mut selections = self.selections.write();
            let old = selections.get(selector).cloned().unwrap_or_default();

            let added: Vec<_> = identities.difference(&old).copied().collect();
            let removed: Vec<_> = old.difference(&identities).copied().collect();

            if identities.is_empty() {
                selections.remove(selector);
            } else {
                selections.insert(selector.clone(), Arc::new(identities));
            }
            (added, removed)
        };

        if added.is_empty() && removed.is_empty() {
            trace!(%selector, "selector identities unchanged");
            return;
        }

        debug!(
            %selector,
            added = added.len(),
            removed = removed.len(),
            "updated selector identities"
        );

        let mut subscribers = self.subscribers.lock();
        subscribers.retain(|tx| {
            tx.send(SelectorUpdate {
                selector: selector.clone(),
                added: added.clone(),
                removed: removed.clone(),
                _token: done.token(),
            })
            .is_ok()
        });
    }
}
