//! Transaction Scheduler
//!
//! The scheduler decides the order in which work queued inside a
//! transaction runs. It guarantees that work attached to a node never runs
//! before work attached to something upstream of it.
//!
//! # Algorithm
//!
//! 1. Each prioritized action gets a fresh, monotonically increasing
//!    [`EntryId`] and is keyed by `(target rank, id)`.
//! 2. Processing pops the smallest key, so ranks run in ascending order and
//!    equal ranks run in scheduling order.
//! 3. Linking nodes mid-transaction can raise ranks of targets that already
//!    have work queued. The caller flags that with
//!    [`request_regen`](TransactionImpl::request_regen) and the queue is
//!    rebuilt from the current ranks before the next pop.
//! 4. Once no prioritized work is left, the last-actions run in the order
//!    they were queued.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::fmt;
use std::sync::Arc;

use tracing::trace;

use super::handle::Transaction;
use crate::graph::{Node, Rank};

/// Work scheduled at a node's rank.
pub type Action = Box<dyn FnOnce(&Transaction<'_>) + Send>;

/// Work scheduled after all prioritized actions.
pub type LastAction = Box<dyn FnOnce() + Send>;

/// Sequence number of a prioritized entry; breaks ties between equal ranks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct EntryId(u64);

impl EntryId {
    fn succ(self) -> Self {
        Self(self.0 + 1)
    }

    /// Get the raw ID value.
    pub fn raw(&self) -> u64 {
        self.0
    }
}

/// A queued action and the node whose rank orders it.
pub struct PrioritizedEntry {
    pub(crate) target: Arc<Node>,
    pub(crate) action: Action,
}

impl PrioritizedEntry {
    /// The node this entry is ordered by.
    pub fn target(&self) -> &Arc<Node> {
        &self.target
    }
}

impl fmt::Debug for PrioritizedEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PrioritizedEntry")
            .field("target", &self.target.id())
            .finish()
    }
}

/// Per-transaction scheduling state.
///
/// One instance exists per partition while a transaction is open.
pub struct TransactionImpl {
    id: u64,
    next_entry_id: EntryId,

    /// Source of truth for queued work.
    entries: BTreeMap<EntryId, PrioritizedEntry>,

    /// Processing order. May be stale until regenerated.
    prioritized_q: BTreeSet<(Rank, EntryId)>,

    last_q: VecDeque<LastAction>,
    to_regen: bool,
    in_callback: usize,
}

impl TransactionImpl {
    pub(crate) fn new(id: u64) -> Self {
        Self {
            id,
            next_entry_id: EntryId::default(),
            entries: BTreeMap::new(),
            prioritized_q: BTreeSet::new(),
            last_q: VecDeque::new(),
            to_regen: false,
            in_callback: 0,
        }
    }

    /// Sequence number of this transaction within its partition.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Queue `action` at `target`'s current rank.
    pub fn prioritized(&mut self, target: Arc<Node>, action: Action) -> EntryId {
        let id = self.next_entry_id;
        self.next_entry_id = id.succ();
        self.prioritized_q.insert((target.rank(), id));
        self.entries.insert(id, PrioritizedEntry { target, action });
        id
    }

    /// Queue `action` to run after all prioritized work.
    pub fn last(&mut self, action: LastAction) {
        self.last_q.push_back(action);
    }

    /// Mark the priority order stale; it is rebuilt before the next pop.
    pub fn request_regen(&mut self) {
        self.to_regen = true;
    }

    fn check_regen(&mut self) {
        if !self.to_regen {
            return;
        }
        self.to_regen = false;
        trace!(transaction = self.id, entries = self.entries.len(), "regenerating priority queue");
        self.prioritized_q = self
            .entries
            .iter()
            .map(|(id, entry)| (entry.target.rank(), *id))
            .collect();
    }

    /// Remove and return the next prioritized entry in `(rank, id)` order.
    pub fn pop_next(&mut self) -> Option<PrioritizedEntry> {
        self.check_regen();
        let (_, id) = self.prioritized_q.pop_first()?;
        let Some(entry) = self.entries.remove(&id) else {
            unreachable!("priority queue references missing entry {id:?}");
        };
        Some(entry)
    }

    /// Take every queued last-action, in enqueue order.
    pub fn take_last(&mut self) -> VecDeque<LastAction> {
        std::mem::take(&mut self.last_q)
    }

    /// Number of prioritized entries still queued.
    pub fn pending(&self) -> usize {
        self.entries.len()
    }

    /// Whether neither prioritized nor last work is queued.
    pub fn is_idle(&self) -> bool {
        self.entries.is_empty() && self.last_q.is_empty()
    }

    /// How many prioritized actions are currently executing.
    pub fn in_callback(&self) -> usize {
        self.in_callback
    }

    pub(crate) fn enter_callback(&mut self) {
        self.in_callback += 1;
    }

    pub(crate) fn exit_callback(&mut self) {
        debug_assert!(self.in_callback > 0);
        self.in_callback = self.in_callback.saturating_sub(1);
    }
}

impl fmt::Debug for TransactionImpl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransactionImpl")
            .field("id", &self.id)
            .field("entries", &self.entries.len())
            .field("last", &self.last_q.len())
            .field("to_regen", &self.to_regen)
            .field("in_callback", &self.in_callback)
            .finish()
    }
}
