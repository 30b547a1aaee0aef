//! Partitions
//!
//! A partition is an independent serialization domain. It owns one
//! re-entrant lock, the nesting depth of the transaction open on it, the
//! queue of post-actions and the start hooks. Ordering guarantees hold within
//! one partition; different partitions run independently of each other.
//!
//! # Locking
//!
//! The lock is held for the whole lifetime of an open transaction and is
//! re-entered by nested scopes and by graph mutation from inside callbacks.
//! The mutable state sits in a `RefCell` inside the lock and is only ever
//! borrowed for short bookkeeping, never across user code.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::fmt;
use std::mem;
use std::sync::{Arc, OnceLock};
use std::thread;

use parking_lot::{ReentrantMutex, ReentrantMutexGuard};
use tracing::{debug, error, trace};

use super::handle::Transaction;
use super::scheduler::TransactionImpl;
use crate::config::PartitionConfig;

/// Work deferred until a transaction has fully closed.
pub type PostAction = Box<dyn FnOnce() + Send>;

/// Callback run whenever an outermost transaction opens.
pub type StartHook = Arc<dyn Fn() + Send + Sync>;

pub(crate) type StateGuard<'a> = ReentrantMutexGuard<'a, RefCell<PartitionState>>;

pub(crate) struct PartitionState {
    pub(crate) depth: usize,
    pub(crate) txn: Option<TransactionImpl>,
    pub(crate) shutting_down: bool,
    next_txn_id: u64,
    post_q: VecDeque<PostAction>,
    processing_post: bool,
    on_start_hooks: Vec<StartHook>,
    processing_on_start_hooks: bool,
}

impl PartitionState {
    /// Whether start hooks are running, i.e. a transaction is being opened.
    pub(crate) fn in_start_hooks(&self) -> bool {
        self.processing_on_start_hooks
    }
}

struct PartitionInner {
    config: PartitionConfig,
    state: ReentrantMutex<RefCell<PartitionState>>,
}

impl Drop for PartitionInner {
    fn drop(&mut self) {
        let state = self.state.get_mut().get_mut();
        state.shutting_down = true;
        state.on_start_hooks.clear();
    }
}

/// A serialization domain for transactions.
///
/// Cloning yields another handle to the same partition.
#[derive(Clone)]
pub struct Partition {
    inner: Arc<PartitionInner>,
}

impl Partition {
    /// Create a partition.
    pub fn new(config: PartitionConfig) -> Self {
        Self {
            inner: Arc::new(PartitionInner {
                config,
                state: ReentrantMutex::new(RefCell::new(PartitionState {
                    depth: 0,
                    txn: None,
                    shutting_down: false,
                    next_txn_id: 0,
                    post_q: VecDeque::new(),
                    processing_post: false,
                    on_start_hooks: Vec::new(),
                    processing_on_start_hooks: false,
                })),
            }),
        }
    }

    /// The process-wide default partition, created on first use.
    pub fn global() -> &'static Partition {
        static GLOBAL: OnceLock<Partition> = OnceLock::new();
        GLOBAL.get_or_init(|| Partition::new(PartitionConfig::default().with_name("global")))
    }

    /// The partition's configuration.
    pub fn config(&self) -> &PartitionConfig {
        &self.inner.config
    }

    /// The partition's name.
    pub fn name(&self) -> &str {
        &self.inner.config.name
    }

    /// Whether both handles refer to the same partition.
    pub fn ptr_eq(&self, other: &Partition) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    pub(crate) fn lock(&self) -> StateGuard<'_> {
        self.inner.state.lock()
    }

    /// Run `f` against the partition state. `f` must not call user code.
    pub(crate) fn with_state<R>(&self, f: impl FnOnce(&mut PartitionState) -> R) -> R {
        let guard = self.inner.state.lock();
        let mut state = guard.borrow_mut();
        f(&mut state)
    }

    /// Nesting depth of the transaction open on this partition, as seen by
    /// the calling thread. Blocks while another thread has one open.
    pub fn depth(&self) -> usize {
        self.with_state(|state| state.depth)
    }

    /// Whether [`shutdown`](Self::shutdown) has been called.
    pub fn is_shutting_down(&self) -> bool {
        self.with_state(|state| state.shutting_down)
    }

    /// Number of post-actions waiting to run.
    pub fn pending_posts(&self) -> usize {
        self.with_state(|state| state.post_q.len())
    }

    /// Queue `action` to run once the current transaction has fully closed,
    /// outside the partition lock.
    ///
    /// With no transaction open the action runs right away, through a fresh
    /// empty transaction on the calling thread. Called from inside another
    /// post-action it is queued behind the ones already pending, and from a
    /// start hook it waits for the transaction being opened to close.
    pub fn post<F>(&self, action: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let run_now = {
            let guard = self.lock();
            let mut state = guard.borrow_mut();
            if state.shutting_down {
                trace!(partition = %self.name(), "dropping post action during shutdown");
                return;
            }
            state.post_q.push_back(Box::new(action));
            state.depth == 0 && !state.processing_post && !state.processing_on_start_hooks
        };

        if run_now {
            let mut trans = Transaction::new(self);
            if let Err(err) = trans.close() {
                error!(partition = %self.name(), %err, "failed to close post transaction");
            }
        }
    }

    /// Register a hook run every time an outermost transaction opens,
    /// before any work in it.
    pub fn on_start<F>(&self, hook: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.with_state(|state| {
            if state.shutting_down {
                trace!(partition = %self.name(), "dropping start hook during shutdown");
                return;
            }
            state.on_start_hooks.push(Arc::new(hook));
        });
    }

    /// Stop accepting new work. Already queued work still runs.
    pub fn shutdown(&self) {
        let hooks = self.with_state(|state| {
            state.shutting_down = true;
            mem::take(&mut state.on_start_hooks)
        });
        debug!(partition = %self.name(), "partition shutting down");
        drop(hooks);
    }

    /// Acquire the lock and open (or nest into) the transaction.
    pub(crate) fn enter(&self) -> StateGuard<'_> {
        let guard = self.lock();

        let hooks = {
            let mut state = guard.borrow_mut();
            let run_hooks = state.depth == 0
                && !state.processing_on_start_hooks
                && !state.shutting_down
                && !state.on_start_hooks.is_empty();
            if run_hooks {
                state.processing_on_start_hooks = true;
                Some(state.on_start_hooks.clone())
            } else {
                None
            }
        };

        if let Some(hooks) = hooks {
            let _running = HookRun(&*guard);
            for hook in &hooks {
                hook();
            }
        }

        {
            let mut state = guard.borrow_mut();
            if state.depth == 0 {
                let id = state.next_txn_id;
                state.next_txn_id += 1;
                state.txn = Some(TransactionImpl::new(id));
                debug!(partition = %self.name(), transaction = id, "transaction opened");
            }
            state.depth += 1;
        }

        guard
    }

    /// Run queued post-actions in order, each outside the lock.
    ///
    /// Only one thread drains at a time; posts queued meanwhile are picked
    /// up by the drain already running.
    pub(crate) fn process_post(&self) {
        let start = self.with_state(|state| {
            if state.processing_post {
                false
            } else {
                state.processing_post = true;
                true
            }
        });
        if !start {
            return;
        }

        let _drain = PostDrain(self);
        loop {
            let next = self.with_state(|state| {
                let next = state.post_q.pop_front();
                if next.is_none() {
                    state.processing_post = false;
                }
                next
            });
            match next {
                Some(action) => action(),
                None => break,
            }
        }
    }
}

impl Default for Partition {
    fn default() -> Self {
        Self::new(PartitionConfig::default())
    }
}

impl fmt::Debug for Partition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Partition")
            .field("name", &self.name())
            .finish()
    }
}

/// Clears the hook flag even if a hook panics.
struct HookRun<'a>(&'a RefCell<PartitionState>);

impl Drop for HookRun<'_> {
    fn drop(&mut self) {
        self.0.borrow_mut().processing_on_start_hooks = false;
    }
}

/// Releases the drain flag if a post-action panics.
struct PostDrain<'a>(&'a Partition);

impl Drop for PostDrain<'_> {
    fn drop(&mut self) {
        if thread::panicking() {
            self.0.with_state(|state| state.processing_post = false);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn post_without_transaction_runs_immediately() {
        let partition = Partition::default();
        let ran = Arc::new(AtomicUsize::new(0));

        let counter = Arc::clone(&ran);
        partition.post(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        assert_eq!(ran.load(Ordering::SeqCst), 1);
        assert_eq!(partition.pending_posts(), 0);
        assert_eq!(partition.depth(), 0);
    }

    #[test]
    fn post_inside_transaction_waits_for_close() {
        let partition = Partition::default();
        let ran = Arc::new(AtomicUsize::new(0));

        let mut trans = Transaction::new(&partition);
        let counter = Arc::clone(&ran);
        partition.post(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(ran.load(Ordering::SeqCst), 0);
        assert_eq!(partition.pending_posts(), 1);

        trans.close().unwrap();
        assert_eq!(ran.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn post_from_post_action_runs_in_same_drain() {
        let partition = Partition::default();
        let order = Arc::new(Mutex::new(Vec::new()));

        let mut trans = Transaction::new(&partition);
        let inner_partition = partition.clone();
        let log = Arc::clone(&order);
        trans.post(move || {
            log.lock().push("first");
            let log = Arc::clone(&log);
            inner_partition.post(move || log.lock().push("nested"));
        });
        let log = Arc::clone(&order);
        trans.post(move || log.lock().push("second"));
        trans.close().unwrap();

        assert_eq!(*order.lock(), vec!["first", "second", "nested"]);
    }

    #[test]
    fn start_hooks_run_once_per_outermost_open() {
        let partition = Partition::default();
        let starts = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&starts);
        partition.on_start(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        {
            let _outer = Transaction::new(&partition);
            let _inner = Transaction::new(&partition);
            assert_eq!(partition.depth(), 2);
        }
        assert_eq!(starts.load(Ordering::SeqCst), 1);

        Transaction::run(&partition, |_| {}).unwrap();
        assert_eq!(starts.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn start_hook_may_open_its_own_transaction() {
        let partition = Partition::default();
        let starts = Arc::new(AtomicUsize::new(0));
        let hook_partition = partition.clone();
        let counter = Arc::clone(&starts);
        partition.on_start(move || {
            counter.fetch_add(1, Ordering::SeqCst);
            Transaction::run(&hook_partition, |_| {}).unwrap();
        });

        Transaction::run(&partition, |trans| assert_eq!(trans.depth(), 1)).unwrap();
        assert_eq!(starts.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn post_from_start_hook_waits_for_transaction_close() {
        let partition = Partition::default();
        let order = Arc::new(Mutex::new(Vec::new()));

        let hook_partition = partition.clone();
        let log = Arc::clone(&order);
        partition.on_start(move || {
            let log = Arc::clone(&log);
            hook_partition.post(move || log.lock().push("post"));
        });

        Transaction::run(&partition, |_| order.lock().push("body")).unwrap();
        assert_eq!(*order.lock(), vec!["body", "post"]);
    }

    #[test]
    fn post_inside_hook_transaction_waits_for_outer_close() {
        let partition = Partition::default();
        let order = Arc::new(Mutex::new(Vec::new()));

        let hook_partition = partition.clone();
        let log = Arc::clone(&order);
        partition.on_start(move || {
            let log = Arc::clone(&log);
            Transaction::run(&hook_partition, |trans| {
                trans.post(move || log.lock().push("post"));
            })
            .unwrap();
        });

        Transaction::run(&partition, |_| order.lock().push("body")).unwrap();
        assert_eq!(*order.lock(), vec!["body", "post"]);
        assert_eq!(partition.pending_posts(), 0);
    }

    #[test]
    fn shutdown_drops_new_work() {
        let partition = Partition::default();
        let ran = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&ran);
        partition.on_start(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        partition.shutdown();
        assert!(partition.is_shutting_down());

        let counter = Arc::clone(&ran);
        partition.post(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        Transaction::run(&partition, |_| {}).unwrap();

        assert_eq!(ran.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn global_partition_is_shared() {
        assert!(Partition::global().ptr_eq(Partition::global()));
        assert_eq!(Partition::global().name(), "global");
    }
}
