//! Edge holders.
//!
//! A holder owns the edges one registration adds to the graph. Its tag is
//! what [`Node::unlink`](super::Node::unlink) matches on, and its handler
//! decides what happens to a value travelling along those edges.

use std::any::Any;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use super::node::Node;
use crate::transaction::Transaction;

/// Type-erased value carried through the graph.
pub type Payload = Arc<dyn Any + Send + Sync>;

/// Callback invoked for each value delivered along a holder's edges.
pub type Handler = dyn Fn(&Transaction<'_>, &Arc<Node>, &Payload) + Send + Sync;

/// Opaque identifier of the registration that created an edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct OwnerTag(u64);

impl OwnerTag {
    /// Generate a new unique tag.
    ///
    /// Uses an atomic counter to ensure uniqueness across threads.
    pub fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(0);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

impl Default for OwnerTag {
    fn default() -> Self {
        Self::new()
    }
}

/// Owner of a set of edges.
pub struct Holder {
    tag: OwnerTag,
    /// `None` forwards values straight into the target node.
    handler: Option<Box<Handler>>,
}

impl Holder {
    /// A holder that delivers values through `handler`.
    pub fn new<F>(handler: F) -> Self
    where
        F: Fn(&Transaction<'_>, &Arc<Node>, &Payload) + Send + Sync + 'static,
    {
        Self {
            tag: OwnerTag::new(),
            handler: Some(Box::new(handler)),
        }
    }

    /// A holder that re-sends every value into the target node.
    pub fn forward() -> Self {
        Self {
            tag: OwnerTag::new(),
            handler: None,
        }
    }

    /// The tag edges created by this holder carry.
    pub fn tag(&self) -> OwnerTag {
        self.tag
    }

    /// Deliver `value` to `target`.
    pub fn handle(&self, trans: &Transaction<'_>, target: &Arc<Node>, value: &Payload) {
        match &self.handler {
            Some(handler) => handler(trans, target, value),
            None => trans.send(target, Arc::clone(value)),
        }
    }
}

impl fmt::Debug for Holder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Holder")
            .field("tag", &self.tag)
            .field("forwarding", &self.handler.is_none())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transaction::Partition;
    use parking_lot::Mutex;

    #[test]
    fn owner_tags_are_unique() {
        let tag1 = OwnerTag::new();
        let tag2 = OwnerTag::new();
        let tag3 = OwnerTag::new();

        assert_ne!(tag1, tag2);
        assert_ne!(tag2, tag3);
        assert_ne!(tag1, tag3);
    }

    #[test]
    fn handler_receives_value_and_target() {
        let partition = Partition::default();
        let target = Arc::new(Node::new());
        let seen = Arc::new(Mutex::new(Vec::new()));

        let log = Arc::clone(&seen);
        let holder = Holder::new(move |_, node, value| {
            let value = *value.downcast_ref::<i32>().unwrap();
            log.lock().push((node.id(), value));
        });

        Transaction::run(&partition, |trans| {
            holder.handle(trans, &target, &(Arc::new(7_i32) as Payload));
        })
        .unwrap();

        assert_eq!(*seen.lock(), vec![(target.id(), 7)]);
    }

    #[test]
    fn forwarding_holder_fires_target() {
        let partition = Partition::default();
        let target = Arc::new(Node::new());
        let holder = Holder::forward();

        Transaction::run(&partition, |trans| {
            holder.handle(trans, &target, &(Arc::new("x") as Payload));
            assert_eq!(target.firings().len(), 1);
        })
        .unwrap();

        // Cleared at transaction end.
        assert!(target.firings().is_empty());
    }
}
