//! Listener Registrations
//!
//! A listener registration is the unit representing "something is listening
//! to a node". It owns the activation closure for that relationship and the
//! cleanups that tear it down again.
//!
//! # Reference Counting
//!
//! A registration is shared by every node and edge that depends on it. Each
//! [`ListenerRef`] counts towards the total; strong references and
//! in-flight [`Activation`]s also count as active. Whenever a reference is
//! released and nothing is active any more, the registration is cleaned up:
//! its cleanups run once, in the order they were added, and the closure is
//! dropped. The shared state itself is freed when the last reference goes.
//!
//! Cleanups are arbitrary user code and commonly mutate the graph again,
//! which re-enters the partition that is releasing the reference. They
//! therefore always run with the registration's lock released.

use std::fmt;
use std::mem;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, MutexGuard};
use tracing::trace;

use crate::graph::{Holder, Node};
use crate::transaction::Transaction;

/// Activation closure of a registration.
pub type ListenFn = dyn Fn(&Transaction<'_>, &Arc<Node>, &Arc<Holder>) + Send + Sync;

/// A deferred cleanup action.
pub type Cleanup = Box<dyn FnOnce() + Send>;

/// Unique identifier of a registration, shared by all of its references.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

impl ListenerId {
    fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(0);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

/// Outstanding reference counts of a registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Counts {
    /// Every live reference and activation.
    pub total: usize,
    /// Strong references and activations currently in flight.
    pub active: usize,
}

/// How a [`ListenerRef`] counts towards its registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefKind {
    /// Keeps the registration active.
    Strong,
    /// Keeps the shared state reachable without keeping it active.
    Passive,
}

struct ListenerState {
    counts: Counts,
    func: Option<Arc<ListenFn>>,
    cleanups: Vec<Cleanup>,
}

struct Shared {
    id: ListenerId,
    state: Mutex<ListenerState>,
}

impl Shared {
    fn acquire(&self, kind: RefKind) {
        let mut state = self.state.lock();
        state.counts.total += 1;
        if kind == RefKind::Strong {
            state.counts.active += 1;
        }
    }

    fn release(&self, kind: RefKind) {
        let mut state = self.state.lock();
        assert!(state.counts.total > 0, "listener {:?} released too often", self.id);
        state.counts.total -= 1;
        if kind == RefKind::Strong {
            state.counts.active -= 1;
        }
        self.update_and_unlock(state);
    }

    /// Run cleanup if nothing keeps the registration active, then unlock.
    fn update_and_unlock(&self, mut state: MutexGuard<'_, ListenerState>) {
        if state.func.is_some() && state.counts.active == 0 {
            state.counts.active += 1;
            let func = state.func.take();
            let cleanups = mem::take(&mut state.cleanups);
            trace!(listener = ?self.id, cleanups = cleanups.len(), "cleaning up listener");
            MutexGuard::unlocked(&mut state, move || {
                for cleanup in cleanups {
                    cleanup();
                }
                drop(func);
            });
            state.counts.active -= 1;
        }

        if state.counts.total == 0 {
            trace!(listener = ?self.id, "listener unreferenced");
        }
    }
}

impl Drop for Shared {
    fn drop(&mut self) {
        let state = self.state.get_mut();
        debug_assert_eq!(state.counts, Counts::default());
        debug_assert!(state.func.is_none() && state.cleanups.is_empty());
    }
}

/// An owning reference to a listener registration.
///
/// Cloning keeps the [`RefKind`]; dropping releases the reference and may
/// run the registration's cleanups on the dropping thread.
pub struct ListenerRef {
    shared: Arc<Shared>,
    kind: RefKind,
}

impl ListenerRef {
    /// Create a registration and return its first strong reference.
    pub fn new<F>(func: F) -> Self
    where
        F: Fn(&Transaction<'_>, &Arc<Node>, &Arc<Holder>) + Send + Sync + 'static,
    {
        let func: Arc<ListenFn> = Arc::new(func);
        Self {
            shared: Arc::new(Shared {
                id: ListenerId::new(),
                state: Mutex::new(ListenerState {
                    counts: Counts {
                        total: 1,
                        active: 1,
                    },
                    func: Some(func),
                    cleanups: Vec::new(),
                }),
            }),
            kind: RefKind::Strong,
        }
    }

    fn with_kind(&self, kind: RefKind) -> Self {
        self.shared.acquire(kind);
        Self {
            shared: Arc::clone(&self.shared),
            kind,
        }
    }

    /// A new strong reference to the same registration.
    pub fn strong(&self) -> Self {
        self.with_kind(RefKind::Strong)
    }

    /// A new passive reference to the same registration.
    pub fn passive(&self) -> Self {
        self.with_kind(RefKind::Passive)
    }

    /// How this reference counts.
    pub fn kind(&self) -> RefKind {
        self.kind
    }

    /// Identifier shared by every reference to this registration.
    pub fn id(&self) -> ListenerId {
        self.shared.id
    }

    /// Whether `other` refers to the same registration.
    pub fn ptr_eq(&self, other: &ListenerRef) -> bool {
        Arc::ptr_eq(&self.shared, &other.shared)
    }

    /// Snapshot of the reference counts.
    pub fn counts(&self) -> Counts {
        self.shared.state.lock().counts
    }

    /// Whether the registration has not been cleaned up yet.
    pub fn is_alive(&self) -> bool {
        self.shared.state.lock().func.is_some()
    }

    /// Queue a cleanup action.
    ///
    /// If the registration was already cleaned up the action runs now, on
    /// this thread.
    pub fn add_cleanup<F>(&self, cleanup: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let mut state = self.shared.state.lock();
        if state.func.is_some() {
            state.cleanups.push(Box::new(cleanup));
        } else {
            drop(state);
            cleanup();
        }
    }

    /// Enter the activation path.
    ///
    /// Returns `None` once the registration has been cleaned up. While the
    /// returned guard lives the registration cannot be cleaned up.
    pub fn activate(&self) -> Option<Activation> {
        let mut state = self.shared.state.lock();
        let func = Arc::clone(state.func.as_ref()?);
        state.counts.total += 1;
        state.counts.active += 1;
        Some(Activation {
            shared: Arc::clone(&self.shared),
            func,
        })
    }
}

impl Clone for ListenerRef {
    fn clone(&self) -> Self {
        self.with_kind(self.kind)
    }
}

impl Drop for ListenerRef {
    fn drop(&mut self) {
        self.shared.release(self.kind);
    }
}

impl fmt::Debug for ListenerRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ListenerRef")
            .field("id", &self.shared.id)
            .field("kind", &self.kind)
            .field("counts", &self.counts())
            .finish()
    }
}

/// Guard held while a registration's activation closure is in use.
pub struct Activation {
    shared: Arc<Shared>,
    func: Arc<ListenFn>,
}

impl Activation {
    /// Run the activation closure.
    pub fn invoke(&self, trans: &Transaction<'_>, node: &Arc<Node>, holder: &Arc<Holder>) {
        (self.func)(trans, node, holder)
    }
}

impl Drop for Activation {
    fn drop(&mut self) {
        self.shared.release(RefKind::Strong);
    }
}

impl fmt::Debug for Activation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Activation")
            .field("listener", &self.shared.id)
            .finish()
    }
}
