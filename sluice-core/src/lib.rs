//! Sluice Core
//!
//! This crate provides the transactional propagation engine underneath the
//! Sluice functional reactive programming library. It implements:
//!
//! - A dependency graph of ranked nodes, kept in topological order as edges
//!   are added
//! - A per-partition transaction scheduler that runs queued work in rank
//!   order, so no observer sees a value computed from stale upstream state
//! - Reference-counted listener registrations whose cleanups run exactly
//!   once, never under a lock
//!
//! The combinators (map, filter, merge, hold, ...) are built on top of this
//! crate and are not part of it.
//!
//! # Architecture
//!
//! - `graph`: nodes, edges, ranks and value delivery
//! - `listener`: listener registration lifecycle
//! - `transaction`: partitions, the scheduler and transaction scopes
//! - `config`: partition settings
//!
//! # Example
//!
//! ```rust
//! use std::sync::Arc;
//! use sluice_core::{Holder, Node, Partition, Transaction};
//!
//! let partition = Partition::default();
//! let a = Arc::new(Node::new());
//! let b = Arc::new(Node::new());
//!
//! Transaction::run(&partition, |trans| {
//!     trans.link(&a, &Arc::new(Holder::forward()), &b).unwrap();
//!
//!     // Scheduled out of order, runs a first because it has the lower rank.
//!     trans.prioritized(&b, |_| println!("b"));
//!     trans.prioritized(&a, |_| println!("a"));
//! })
//! .unwrap();
//! ```

pub mod config;
pub mod error;
pub mod graph;
pub mod listener;
pub mod transaction;

pub use config::PartitionConfig;
pub use error::{Error, Result};
pub use graph::{Holder, Node, NodeId, OwnerTag, Payload, Rank, Target};
pub use listener::{Activation, Counts, ListenerId, ListenerRef, RefKind};
pub use transaction::{Partition, Transaction};
