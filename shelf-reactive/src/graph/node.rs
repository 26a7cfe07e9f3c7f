//! Graph Nodes
//!
//! This module defines the vertex record shared by signals, computeds and
//! effects. The record carries only graph bookkeeping; typed values live in
//! the cells owned by the public handles, reached through [`NodeKind`].

use std::borrow::Cow;
use std::fmt;
use std::rc::Rc;

use indexmap::IndexSet;
use serde::Serialize;
use slotmap::new_key_type;

use crate::error::Result;
use crate::reactive::Runtime;

new_key_type! {
    /// Stable handle to a node in the graph arena.
    ///
    /// Keys are generational: once a node is disposed its id never resolves
    /// again, even if the slot is reused.
    pub struct NodeId;
}

/// Topological height of a node, used to order flush processing.
///
/// Signals sit at level 0 and computeds start at 1. Effects always sort
/// after every other node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Level(u32);

impl Level {
    /// Level of every signal.
    pub const SOURCE: Level = Level(0);

    /// Initial level of a computed.
    pub const DERIVED: Level = Level(1);

    /// Level of every effect.
    pub const EFFECT: Level = Level(u32::MAX);

    /// Raw level value.
    pub fn get(self) -> u32 {
        self.0
    }

    /// Whether this is the effect level.
    pub fn is_effect(self) -> bool {
        self == Self::EFFECT
    }

    /// The lowest level an observer of this node may have.
    pub(crate) fn above(self) -> Level {
        Level(self.0.saturating_add(1))
    }
}

/// The kind of a node, as reported by diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeType {
    /// A mutable leaf value.
    Signal,
    /// A memoized derived value.
    Computed,
    /// A terminal side effect.
    Effect,
}

impl fmt::Display for NodeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            NodeType::Signal => "signal",
            NodeType::Computed => "computed",
            NodeType::Effect => "effect",
        };
        f.write_str(name)
    }
}

/// Kind-specific behaviour invoked by the scheduler.
pub(crate) trait Resolve {
    /// Recompute (computed) or rerun (effect) the node under tracking.
    fn resolve(&self, rt: &Runtime, id: NodeId) -> Result<()>;
}

/// Tagged node variant. The scheduler dispatches on it in
/// [`Runtime::resolve_node`].
pub(crate) enum NodeKind {
    /// Signals carry no behaviour; their value lives in the handle's cell.
    Signal,
    Computed(Rc<dyn Resolve>),
    Effect(Rc<dyn Resolve>),
}

impl NodeKind {
    pub(crate) fn node_type(&self) -> NodeType {
        match self {
            NodeKind::Signal => NodeType::Signal,
            NodeKind::Computed(_) => NodeType::Computed,
            NodeKind::Effect(_) => NodeType::Effect,
        }
    }

    pub(crate) fn resolver(&self) -> Option<Rc<dyn Resolve>> {
        match self {
            NodeKind::Signal => None,
            NodeKind::Computed(r) | NodeKind::Effect(r) => Some(Rc::clone(r)),
        }
    }
}

/// A vertex in the dependency graph.
pub(crate) struct Node {
    /// Monotonic creation number. Breaks level ties during a flush.
    pub(crate) serial: u64,

    /// Optional debug name.
    pub(crate) name: Option<Cow<'static, str>>,

    /// Upper bound on the node's depth from any signal.
    pub(crate) level: Level,

    /// The cached value (if any) is stale.
    pub(crate) dirty: bool,

    /// The node's compute function or body is running right now.
    pub(crate) computing: bool,

    /// Nodes this node read during its last evaluation.
    pub(crate) sources: IndexSet<NodeId>,

    /// Nodes that read this node during their last evaluation.
    pub(crate) observers: IndexSet<NodeId>,

    pub(crate) kind: NodeKind,
}

impl Node {
    pub(crate) fn new(kind: NodeKind, name: Option<Cow<'static, str>>) -> Self {
        let (level, dirty) = match kind {
            NodeKind::Signal => (Level::SOURCE, false),
            // Start dirty so the first read computes.
            NodeKind::Computed(_) => (Level::DERIVED, true),
            NodeKind::Effect(_) => (Level::EFFECT, true),
        };
        Self {
            serial: 0,
            name,
            level,
            dirty,
            computing: false,
            sources: IndexSet::new(),
            observers: IndexSet::new(),
            kind,
        }
    }

    pub(crate) fn node_type(&self) -> NodeType {
        self.kind.node_type()
    }

    pub(crate) fn is_signal(&self) -> bool {
        matches!(self.kind, NodeKind::Signal)
    }

    /// Human readable label such as `computed#3` or `signal#1 (filter)`.
    pub(crate) fn label(&self) -> String {
        match &self.name {
            Some(name) => format!("{}#{} ({})", self.node_type(), self.serial, name),
            None => format!("{}#{}", self.node_type(), self.serial),
        }
    }
}

impl fmt::Debug for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Node")
            .field("serial", &self.serial)
            .field("name", &self.name)
            .field("type", &self.node_type())
            .field("level", &self.level)
            .field("dirty", &self.dirty)
            .field("sources", &self.sources.len())
            .field("observers", &self.observers.len())
            .finish()
    }
}
