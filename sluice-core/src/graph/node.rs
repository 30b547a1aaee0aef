//! Graph Nodes
//!
//! This module defines the vertices of the propagation graph and the rank
//! maintenance performed whenever an edge is added.
//!
//! # Ranks
//!
//! Every node carries a rank. For every edge `n -> t` the invariant
//! `t.rank > n.rank` holds, so processing scheduled work in ascending rank
//! order always runs upstream nodes before their dependents. When a new
//! edge would violate the invariant, [`Node::link`] raises the target's rank
//! and pushes the increase through everything downstream of it. Ranks never
//! decrease.
//!
//! The graph must be acyclic. A link that would close a cycle is detected
//! while the increase propagates and rejected with [`Error::Cycle`]; a
//! rejected link leaves all ranks as they were.

use std::collections::HashMap;
use std::fmt;
use std::mem;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use smallvec::SmallVec;
use tracing::warn;

use super::holder::{Holder, OwnerTag, Payload};
use crate::config::DEFAULT_MAX_RANK_VISITS;
use crate::error::{Error, Result};
use crate::listener::{ListenerId, ListenerRef};

/// Topological position of a node. Higher ranks fire later.
pub type Rank = u64;

/// Unique identifier for a node in the propagation graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NodeId(u64);

impl NodeId {
    /// Generate a new unique node ID.
    pub fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(0);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    /// Get the raw ID value.
    pub fn raw(&self) -> u64 {
        self.0
    }
}

impl Default for NodeId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "node#{}", self.0)
    }
}

/// An outgoing edge: the holder that created it and the downstream node.
#[derive(Clone)]
pub struct Target {
    holder: Arc<Holder>,
    node: Arc<Node>,
}

impl Target {
    /// Tag of the registration that created this edge.
    pub fn tag(&self) -> OwnerTag {
        self.holder.tag()
    }

    /// The holder values are delivered through.
    pub fn holder(&self) -> &Arc<Holder> {
        &self.holder
    }

    /// The downstream node.
    pub fn node(&self) -> &Arc<Node> {
        &self.node
    }
}

impl fmt::Debug for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Target")
            .field("tag", &self.tag())
            .field("node", &self.node.id())
            .finish()
    }
}

struct NodeState {
    rank: Rank,

    /// Outgoing edges, most nodes have one or two.
    targets: SmallVec<[Target; 2]>,

    /// Values fired into this node during the current transaction.
    firings: Vec<Payload>,

    /// Upstream registrations this node depends on. Holding them keeps
    /// their cleanup from running while the edge exists.
    sources: Vec<ListenerRef>,

    /// Present while something outside the graph observes this node.
    listen_impl: Option<ListenerRef>,
}

/// A vertex in the propagation graph.
///
/// Nodes are shared through `Arc`. The node's own lock is only held for
/// bookkeeping; no user code runs while it is held and no other node's lock
/// is taken under it.
pub struct Node {
    id: NodeId,
    state: Mutex<NodeState>,
}

impl Node {
    /// Create a node at rank zero.
    pub fn new() -> Self {
        Self::with_rank(0)
    }

    /// Create a node at the given rank.
    pub fn with_rank(rank: Rank) -> Self {
        Self {
            id: NodeId::new(),
            state: Mutex::new(NodeState {
                rank,
                targets: SmallVec::new(),
                firings: Vec::new(),
                sources: Vec::new(),
                listen_impl: None,
            }),
        }
    }

    /// Get the node's ID.
    pub fn id(&self) -> NodeId {
        self.id
    }

    /// Current rank.
    pub fn rank(&self) -> Rank {
        self.state.lock().rank
    }

    /// Snapshot of the outgoing edges, in link order.
    pub fn targets(&self) -> Vec<Target> {
        self.state.lock().targets.to_vec()
    }

    /// Number of outgoing edges.
    pub fn target_count(&self) -> usize {
        self.state.lock().targets.len()
    }

    /// Number of upstream registrations held by this node.
    pub fn source_count(&self) -> usize {
        self.state.lock().sources.len()
    }

    /// Install (or clear) the registration representing external observers.
    ///
    /// Returns the previous one so the caller releases it, outside this
    /// node's lock.
    pub fn set_listen_impl(&self, listener: Option<ListenerRef>) -> Option<ListenerRef> {
        let mut state = self.state.lock();
        mem::replace(&mut state.listen_impl, listener)
    }

    /// Whether an external registration is installed.
    pub fn is_observed(&self) -> bool {
        self.state.lock().listen_impl.is_some()
    }

    /// Stage a value for delivery in the current transaction.
    ///
    /// Returns `true` when this is the first firing since the buffer was
    /// last cleared, in which case the caller must arrange for
    /// [`clear_firings`](Self::clear_firings) at transaction end.
    pub fn fire(&self, value: Payload) -> bool {
        let mut state = self.state.lock();
        let first = state.firings.is_empty();
        state.firings.push(value);
        first
    }

    /// Values fired so far in this transaction.
    pub fn firings(&self) -> Vec<Payload> {
        self.state.lock().firings.clone()
    }

    /// Drop every staged value.
    pub fn clear_firings(&self) {
        let firings = mem::take(&mut self.state.lock().firings);
        drop(firings);
    }

    /// Add an edge `self -> target` owned by `holder`.
    ///
    /// Returns whether the target's rank had to be raised. Callers that
    /// schedule by rank inside a transaction must regenerate their queue
    /// when this returns `true`; [`Transaction::link`] does that.
    ///
    /// [`Transaction::link`]: crate::transaction::Transaction::link
    pub fn link(&self, holder: &Arc<Holder>, target: &Arc<Node>) -> Result<bool> {
        self.link_bounded(holder, target, DEFAULT_MAX_RANK_VISITS)
    }

    /// [`link`](Self::link) with an explicit bound on rank propagation.
    pub fn link_bounded(
        &self,
        holder: &Arc<Holder>,
        target: &Arc<Node>,
        max_visits: usize,
    ) -> Result<bool> {
        if target.id == self.id {
            warn!(node = %self.id, "rejecting self-link");
            return Err(Error::Cycle {
                from: self.id,
                to: self.id,
            });
        }

        let (rank, source) = {
            let state = self.state.lock();
            (state.rank, state.listen_impl.as_ref().map(ListenerRef::strong))
        };

        let changed = target.ensure_bigger_than(self.id, rank, max_visits)?;

        if let Some(source) = source {
            target.state.lock().sources.push(source);
        }
        self.state.lock().targets.push(Target {
            holder: Arc::clone(holder),
            node: Arc::clone(target),
        });

        Ok(changed)
    }

    /// Remove every edge created under `tag`.
    pub fn unlink(&self, tag: OwnerTag) {
        let (removed, listener) = {
            let mut state = self.state.lock();
            let mut removed: SmallVec<[Target; 2]> = SmallVec::new();
            state.targets.retain(|target| {
                if target.tag() == tag {
                    removed.push(target.clone());
                    false
                } else {
                    true
                }
            });
            (removed, state.listen_impl.as_ref().map(ListenerRef::id))
        };

        if let Some(listener) = listener {
            for target in &removed {
                target.node.remove_source(listener);
            }
        }
    }

    /// Release one upstream registration. The reference is dropped after
    /// this node's lock, since releasing it may run cleanups.
    fn remove_source(&self, listener: ListenerId) {
        let removed = {
            let mut state = self.state.lock();
            state
                .sources
                .iter()
                .position(|source| source.id() == listener)
                .map(|index| state.sources.remove(index))
        };
        drop(removed);
    }

    /// Raise this node above `limit` and repair everything downstream.
    ///
    /// New ranks are planned first and only written once the walk finished
    /// without error, so a rejected link leaves every rank untouched.
    fn ensure_bigger_than(
        self: &Arc<Self>,
        origin: NodeId,
        limit: Rank,
        max_visits: usize,
    ) -> Result<bool> {
        let mut planned: HashMap<NodeId, (Arc<Node>, Rank)> = HashMap::new();
        let mut visits = 0usize;
        let mut pending: Vec<(Arc<Node>, Rank)> = vec![(Arc::clone(self), limit)];

        while let Some((node, limit)) = pending.pop() {
            if node.id == origin {
                warn!(from = %origin, to = %self.id, "rejecting link that would create a cycle");
                return Err(Error::Cycle {
                    from: origin,
                    to: self.id,
                });
            }

            let current = match planned.get(&node.id) {
                Some((_, rank)) => *rank,
                None => node.rank(),
            };
            if current > limit {
                continue;
            }
            let rank = limit
                .checked_add(1)
                .ok_or(Error::RankOverflow { node: node.id })?;

            visits += 1;
            if visits > max_visits {
                warn!(origin = %origin, limit = max_visits, "rank propagation bound exceeded");
                return Err(Error::RankPropagationLimit {
                    origin,
                    limit: max_visits,
                });
            }

            let downstream: SmallVec<[Arc<Node>; 4]> = node
                .state
                .lock()
                .targets
                .iter()
                .map(|target| Arc::clone(&target.node))
                .collect();
            pending.extend(downstream.into_iter().map(|next| (next, rank)));
            planned.insert(node.id, (node, rank));
        }

        let changed = planned.contains_key(&self.id);
        for (node, rank) in planned.into_values() {
            node.state.lock().rank = rank;
        }
        Ok(changed)
    }
}

impl Default for Node {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Node {
    fn drop(&mut self) {
        let state = self.state.get_mut();
        if let Some(listener) = state.listen_impl.as_ref().map(ListenerRef::id) {
            for target in &state.targets {
                target.node.remove_source(listener);
            }
        }
    }
}

impl fmt::Debug for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("Node")
            .field("id", &self.id)
            .field("rank", &state.rank)
            .field("targets", &state.targets)
            .field("firings", &state.firings.len())
            .field("sources", &state.sources.len())
            .field("observed", &state.listen_impl.is_some())
            .finish()
    }
}
