//! Transactions
//!
//! This module implements the transactional scheduler: the logical instant
//! during which every firing in a partition is computed consistently.
//!
//! # Concepts
//!
//! ## Partitions
//!
//! A [`Partition`] is a serialization domain: one re-entrant lock, one
//! nesting depth, one queue of post-actions and one set of start hooks.
//! Work on different partitions proceeds independently.
//!
//! ## Transactions
//!
//! A [`Transaction`] is a scope on a partition. Scopes nest; work queued in
//! any of them is processed when the outermost one closes.
//!
//! ## Ordering
//!
//! Within one transaction:
//!
//! - prioritized actions run in strictly increasing `(rank, id)` order
//! - last-actions run after all prioritized actions, in enqueue order
//! - post-actions run after the lock is released, in enqueue order
//! - start hooks run before any work of a newly opened transaction

mod handle;
mod partition;
mod scheduler;

pub use handle::Transaction;
pub use partition::{Partition, PostAction, StartHook};
pub use scheduler::{Action, EntryId, LastAction, PrioritizedEntry, TransactionImpl};
