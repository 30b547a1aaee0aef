//! Transaction Handles
//!
//! A [`Transaction`] is a scope on a partition. Opening one either starts a
//! new transaction or nests into the one already open on the calling thread;
//! only closing the outermost scope processes the queued work.
//!
//! # Closing
//!
//! Closing the outermost scope:
//!
//! 1. runs prioritized actions in `(rank, id)` order, then last-actions,
//!    repeating while either kind of work keeps getting queued
//! 2. discards the per-transaction state and releases the partition lock
//! 3. runs the partition's post-actions, outside the lock
//!
//! Dropping the handle closes it. A handle dropped while unwinding from a
//! panic only unwinds its scope; queued work is discarded.

use std::fmt;
use std::mem;
use std::sync::Arc;
use std::thread;

use tracing::{debug, error, trace, warn};

use super::partition::{Partition, StateGuard};
use super::scheduler::{PrioritizedEntry, TransactionImpl};
use crate::error::{Error, Result};
use crate::graph::{Holder, Node, Payload};

/// A scope on a partition's transaction.
///
/// Holding one keeps the partition locked for the calling thread. The handle
/// owns its close operation and is neither `Clone` nor `Send`.
pub struct Transaction<'p> {
    partition: &'p Partition,
    guard: Option<StateGuard<'p>>,
}

impl<'p> Transaction<'p> {
    /// Open a scope on `partition`.
    ///
    /// Runs the partition's start hooks if this opens a new outermost
    /// transaction.
    pub fn new(partition: &'p Partition) -> Self {
        Self {
            partition,
            guard: Some(partition.enter()),
        }
    }

    /// Open a scope on `partition`, run `f` in it and close it.
    pub fn run<R>(partition: &Partition, f: impl FnOnce(&Transaction<'_>) -> R) -> Result<R> {
        let mut trans = Transaction::new(partition);
        let out = f(&trans);
        trans.close()?;
        Ok(out)
    }

    /// The partition this scope belongs to.
    pub fn partition(&self) -> &'p Partition {
        self.partition
    }

    /// Whether this scope has not been closed yet.
    pub fn is_open(&self) -> bool {
        self.guard.is_some()
    }

    /// Sequence number of the underlying transaction.
    pub fn id(&self) -> Option<u64> {
        self.with_txn(|txn| txn.id())
    }

    /// Current nesting depth of the partition.
    pub fn depth(&self) -> usize {
        self.partition.depth()
    }

    /// How many prioritized actions are executing right now.
    pub fn in_callback(&self) -> usize {
        self.with_txn(|txn| txn.in_callback()).unwrap_or(0)
    }

    fn with_txn<R>(&self, f: impl FnOnce(&mut TransactionImpl) -> R) -> Option<R> {
        if self.guard.is_none() {
            warn!(partition = %self.partition.name(), "transaction handle used after close");
            return None;
        }
        self.partition.with_state(|state| state.txn.as_mut().map(f))
    }

    /// Whether scheduling calls are currently being dropped.
    fn suppressed(&self, what: &str) -> bool {
        let shutting_down = self.partition.with_state(|state| state.shutting_down);
        if shutting_down {
            trace!(partition = %self.partition.name(), what, "dropping work during shutdown");
        }
        shutting_down
    }

    /// Run `action` at `target`'s rank during processing.
    pub fn prioritized<F>(&self, target: &Arc<Node>, action: F)
    where
        F: FnOnce(&Transaction<'_>) + Send + 'static,
    {
        if self.suppressed("prioritized") {
            return;
        }
        self.with_txn(|txn| {
            let id = txn.prioritized(Arc::clone(target), Box::new(action));
            trace!(transaction = txn.id(), entry = id.raw(), node = %target.id(), "scheduled prioritized action");
        });
    }

    /// Run `action` after every prioritized action of this transaction.
    pub fn last<F>(&self, action: F)
    where
        F: FnOnce() + Send + 'static,
    {
        if self.suppressed("last") {
            return;
        }
        self.with_txn(|txn| txn.last(Box::new(action)));
    }

    /// Run `action` once the transaction has fully closed.
    pub fn post<F>(&self, action: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.partition.post(action);
    }

    /// Rebuild the priority order before the next action runs.
    pub fn request_regen(&self) {
        self.with_txn(TransactionImpl::request_regen);
    }

    /// Link `source -> target`, bounded by the partition's configuration.
    ///
    /// Regenerates the priority order when a rank changed.
    pub fn link(&self, source: &Node, holder: &Arc<Holder>, target: &Arc<Node>) -> Result<bool> {
        let limit = self.partition.config().max_rank_visits;
        let changed = source.link_bounded(holder, target, limit)?;
        if changed {
            self.request_regen();
        }
        Ok(changed)
    }

    /// Fire `value` into `node` and deliver it along the node's edges.
    pub fn send(&self, node: &Arc<Node>, value: Payload) {
        if self.guard.is_none() {
            warn!(partition = %self.partition.name(), node = %node.id(), "send on closed transaction ignored");
            return;
        }
        if node.fire(Arc::clone(&value)) {
            let fired = Arc::clone(node);
            // Clearing is bookkeeping, so it is queued even during shutdown.
            self.with_txn(|txn| txn.last(Box::new(move || fired.clear_firings())));
        }
        for target in node.targets() {
            target.holder().handle(self, target.node(), &value);
        }
    }

    /// Close this scope.
    ///
    /// Processing happens only when this is the outermost scope. Closing an
    /// already closed handle does nothing.
    pub fn close(&mut self) -> Result<()> {
        if self.guard.is_none() {
            return Ok(());
        }

        let depth = self.partition.with_state(|state| state.depth);
        match depth {
            0 => {
                self.guard = None;
                Err(Error::UnbalancedClose)
            }
            1 => {
                let unwind = DiscardOnUnwind(self.partition);
                self.process_transactional();
                mem::forget(unwind);

                // Posts queued by a start hook wait for the enclosing
                // transaction, which is still being opened.
                let (finished, drain) = self.partition.with_state(|state| {
                    state.depth = 0;
                    (state.txn.take(), !state.in_start_hooks())
                });
                self.guard = None;
                if let Some(txn) = finished {
                    debug!(partition = %self.partition.name(), transaction = txn.id(), "transaction closed");
                }
                if drain {
                    self.partition.process_post();
                }
                Ok(())
            }
            _ => {
                self.partition.with_state(|state| state.depth -= 1);
                self.guard = None;
                Ok(())
            }
        }
    }

    fn process_transactional(&self) {
        loop {
            while let Some(entry) = self.with_txn(TransactionImpl::pop_next).flatten() {
                let PrioritizedEntry { target, action } = entry;
                self.with_txn(TransactionImpl::enter_callback);
                action(self);
                self.with_txn(TransactionImpl::exit_callback);
                drop(target);
            }

            let last = self.with_txn(TransactionImpl::take_last).unwrap_or_default();
            if last.is_empty() {
                break;
            }
            for action in last {
                action();
            }
        }
    }

    /// Leave the scope without processing anything.
    fn abandon(&mut self) {
        if self.guard.is_none() {
            return;
        }
        let discarded = self.partition.with_state(|state| {
            state.depth = state.depth.saturating_sub(1);
            if state.depth == 0 {
                state.txn.take()
            } else {
                None
            }
        });
        self.guard = None;
        drop(discarded);
    }
}

/// Resets the partition if an action panics during processing.
struct DiscardOnUnwind<'a>(&'a Partition);

impl Drop for DiscardOnUnwind<'_> {
    fn drop(&mut self) {
        let discarded = self.0.with_state(|state| {
            state.depth = 0;
            state.txn.take()
        });
        if let Some(txn) = discarded {
            warn!(partition = %self.0.name(), transaction = txn.id(), pending = txn.pending(), "discarding transaction after panic");
        }
    }
}

impl Drop for Transaction<'_> {
    fn drop(&mut self) {
        if thread::panicking() {
            self.abandon();
            return;
        }
        if let Err(err) = self.close() {
            error!(partition = %self.partition.name(), %err, "failed to close transaction");
        }
    }
}

impl fmt::Debug for Transaction<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transaction")
            .field("partition", &self.partition.name())
            .field("open", &self.is_open())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    fn log() -> Arc<Mutex<Vec<&'static str>>> {
        Arc::new(Mutex::new(Vec::new()))
    }

    #[test]
    fn nested_scope_defers_processing() {
        let partition = Partition::default();
        let node = Arc::new(Node::new());
        let order = log();

        let mut outer = Transaction::new(&partition);
        {
            let mut inner = Transaction::new(&partition);
            let out = Arc::clone(&order);
            inner.prioritized(&node, move |_| out.lock().push("ran"));
            inner.close().unwrap();
        }
        assert!(order.lock().is_empty());

        outer.close().unwrap();
        assert_eq!(*order.lock(), vec!["ran"]);
        assert_eq!(partition.depth(), 0);
    }

    #[test]
    fn closing_twice_is_a_noop() {
        let partition = Partition::default();
        let mut trans = Transaction::new(&partition);
        trans.close().unwrap();
        assert!(!trans.is_open());
        trans.close().unwrap();
        assert_eq!(partition.depth(), 0);
    }

    #[test]
    fn last_runs_after_prioritized() {
        let partition = Partition::default();
        let node = Arc::new(Node::with_rank(7));
        let order = log();

        Transaction::run(&partition, |trans| {
            let out = Arc::clone(&order);
            trans.last(move || out.lock().push("last"));
            let out = Arc::clone(&order);
            trans.prioritized(&node, move |_| out.lock().push("prioritized"));
        })
        .unwrap();

        assert_eq!(*order.lock(), vec!["prioritized", "last"]);
    }

    #[test]
    fn work_queued_by_last_action_still_runs() {
        let partition = Partition::default();
        let node = Arc::new(Node::new());
        let order = log();

        let queued_partition = partition.clone();
        let out = Arc::clone(&order);
        Transaction::run(&partition, move |trans| {
            trans.last(move || {
                out.lock().push("last");
                let trans = Transaction::new(&queued_partition);
                let out = Arc::clone(&out);
                trans.prioritized(&node, move |_| out.lock().push("late"));
            });
        })
        .unwrap();

        assert_eq!(*order.lock(), vec!["last", "late"]);
    }

    #[test]
    fn actions_see_in_callback_depth() {
        let partition = Partition::default();
        let node = Arc::new(Node::new());
        let seen = Arc::new(Mutex::new(None));

        let out = Arc::clone(&seen);
        Transaction::run(&partition, |trans| {
            assert_eq!(trans.in_callback(), 0);
            trans.prioritized(&node, move |trans| *out.lock() = Some(trans.in_callback()));
        })
        .unwrap();

        assert_eq!(*seen.lock(), Some(1));
    }

    #[test]
    fn send_delivers_downstream_and_clears_firings() {
        let partition = Partition::default();
        let a = Arc::new(Node::new());
        let b = Arc::new(Node::new());
        let c = Arc::new(Node::new());

        Transaction::run(&partition, |trans| {
            trans.link(&a, &Arc::new(Holder::forward()), &b).unwrap();
            trans.link(&b, &Arc::new(Holder::forward()), &c).unwrap();
            trans.send(&a, Arc::new(5_u8));
            assert_eq!(c.firings().len(), 1);
            let value = c.firings()[0].downcast_ref::<u8>().copied();
            assert_eq!(value, Some(5));
        })
        .unwrap();

        for node in [&a, &b, &c] {
            assert!(node.firings().is_empty());
        }
    }

    #[test]
    fn panicking_scope_unwinds_depth() {
        let partition = Partition::default();
        let node = Arc::new(Node::new());

        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            let trans = Transaction::new(&partition);
            trans.prioritized(&node, |_| {});
            panic!("boom");
        }));
        assert!(result.is_err());

        assert_eq!(partition.depth(), 0);
        Transaction::run(&partition, |trans| assert_eq!(trans.depth(), 1)).unwrap();
    }

    #[test]
    fn panicking_action_in_dropped_scope_resets_partition() {
        let partition = Partition::default();
        let node = Arc::new(Node::new());

        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            let trans = Transaction::new(&partition);
            trans.prioritized(&node, |_| panic!("action failed"));
        }));
        assert!(result.is_err());
        assert_eq!(partition.depth(), 0);

        let order = log();
        let out = Arc::clone(&order);
        Transaction::run(&partition, |trans| {
            trans.prioritized(&node, move |_| out.lock().push("later"));
        })
        .unwrap();
        assert_eq!(*order.lock(), vec!["later"]);
    }

    #[test]
    fn panicking_action_in_explicit_close_resets_partition() {
        let partition = Partition::default();
        let node = Arc::new(Node::new());

        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            let mut trans = Transaction::new(&partition);
            trans.prioritized(&node, |_| panic!("action failed"));
            trans.close()
        }));
        assert!(result.is_err());

        assert_eq!(partition.depth(), 0);
        Transaction::run(&partition, |trans| {
            assert_eq!(trans.depth(), 1);
            assert_eq!(trans.in_callback(), 0);
        })
        .unwrap();
    }

    #[test]
    fn send_on_closed_handle_fires_nothing() {
        let partition = Partition::default();
        let node = Arc::new(Node::new());

        let mut trans = Transaction::new(&partition);
        trans.close().unwrap();
        trans.send(&node, Arc::new(1_u8));

        assert!(node.firings().is_empty());
    }
}
