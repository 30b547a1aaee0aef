//! Propagation Graph
//!
//! This module implements the dependency graph values flow through.
//!
//! # Overview
//!
//! The graph is a directed acyclic graph where:
//!
//! - Nodes are event sources and the intermediate stages built on them
//! - Edges point downstream: a value fired into `n` is delivered along every
//!   edge `n -> t`, through the edge's [`Holder`]
//!
//! Each node has a rank, strictly increasing along every edge. The
//! transaction scheduler orders work by rank, which is what keeps
//! propagation glitch-free: a node never runs before something upstream of
//! it within the same transaction.
//!
//! Nodes are shared through `Arc` and stay alive while any upstream edge,
//! combinator, or external observer refers to them.

mod holder;
mod node;

pub use holder::{Handler, Holder, OwnerTag, Payload};
pub use node::{Node, NodeId, Rank, Target};
