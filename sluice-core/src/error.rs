//! Error types for the propagation core.
//!
//! Most failures in this crate are contract breaches and are asserted on
//! directly. The variants here cover the cases a caller can provoke and
//! reasonably observe: building a cyclic graph and closing a transaction
//! scope that was never opened.

use thiserror::Error;

use crate::graph::NodeId;

/// Errors reported by graph and transaction operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Error {
    /// Linking `from -> to` would close a cycle. The edge is not added.
    #[error("linking {from} -> {to} would create a cycle")]
    Cycle {
        /// Node the edge starts at.
        from: NodeId,
        /// Node the edge would point to.
        to: NodeId,
    },

    /// Rank propagation visited more nodes than the partition allows.
    #[error("rank propagation from {origin} exceeded {limit} node visits")]
    RankPropagationLimit {
        /// Node whose outgoing edge triggered the propagation.
        origin: NodeId,
        /// The configured visit bound.
        limit: usize,
    },

    /// A rank could not be increased without overflowing.
    #[error("rank of {node} cannot be raised past u64::MAX")]
    RankOverflow {
        /// The node whose rank would overflow.
        node: NodeId,
    },

    /// A transaction scope was closed while the partition had none open.
    #[error("transaction closed more times than it was opened")]
    UnbalancedClose,
}

/// Result type used throughout the crate.
pub type Result<T, E = Error> = std::result::Result<T, E>;
