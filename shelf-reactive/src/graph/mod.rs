//! Dependency Graph
//!
//! This module implements the dependency graph that connects signals,
//! computeds and effects, and the scheduler that flushes it.
//!
//! # Overview
//!
//! The dependency graph is a directed acyclic graph (DAG) where:
//!
//! - Nodes represent signals (leaves), computeds and effects (terminals)
//! - Edges point from a value to the computations that read it
//!
//! Edges are not declared up front. They are recorded while a computation
//! runs and rebuilt from scratch every time it reruns, so a branch that is
//! no longer taken stops subscribing to what it used to read.
//!
//! # Design Decisions
//!
//! 1. Nodes live in a generational arena and refer to each other by
//!    [`NodeId`]. A disposed node leaves a dead key behind, never a dangling
//!    reference.
//!
//! 2. Both directions of every edge are stored, so dirty marking walks
//!    observers and re-tracking walks sources without searching.
//!
//! 3. Each node carries a level, an upper bound on its depth. Flushing in
//!    level order is what makes propagation glitch-free.

mod arena;
mod node;
mod scheduler;

pub(crate) use arena::Graph;
pub use node::{Level, NodeId, NodeType};
pub(crate) use node::{Node, NodeKind, Resolve};
pub use scheduler::FlushStats;
pub(crate) use scheduler::{flush_pass, run_until_idle, QueuedCallback, Scheduler};
