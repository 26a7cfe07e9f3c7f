//! Node Arena
//!
//! All nodes of one runtime live in a generational slot map. Edges are
//! stored on both endpoints (`sources` on the reader, `observers` on the
//! value being read) and every operation here keeps the two sides in sync:
//!
//! `b ∈ a.sources ⇔ a ∈ b.observers`
//!
//! Levels are maintained on edge insertion. When a new edge would put an
//! observer at or below its source, the observer is raised and the raise
//! is pushed downstream. A raise that climbs past the number of nodes ever
//! created can only come from a cycle and is rejected.

use indexmap::IndexSet;
use slotmap::SlotMap;
use smallvec::{smallvec, SmallVec};
use tracing::trace;

use super::node::{Level, Node, NodeId};
use crate::error::{ReactiveError, Result};

/// The dependency graph of one runtime.
#[derive(Debug, Default)]
pub(crate) struct Graph {
    nodes: SlotMap<NodeId, Node>,
    next_serial: u64,
}

impl Graph {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Add a node, assigning its serial.
    pub(crate) fn insert(&mut self, mut node: Node) -> NodeId {
        self.next_serial += 1;
        node.serial = self.next_serial;
        self.nodes.insert(node)
    }

    /// Remove a node and every edge touching it.
    pub(crate) fn remove(&mut self, id: NodeId) -> Option<Node> {
        let node = self.nodes.remove(id)?;
        for source in &node.sources {
            if let Some(source) = self.nodes.get_mut(*source) {
                source.observers.shift_remove(&id);
            }
        }
        for observer in &node.observers {
            if let Some(observer) = self.nodes.get_mut(*observer) {
                observer.sources.shift_remove(&id);
            }
        }
        trace!(serial = node.serial, "node removed");
        Some(node)
    }

    pub(crate) fn get(&self, id: NodeId) -> Option<&Node> {
        self.nodes.get(id)
    }

    pub(crate) fn get_mut(&mut self, id: NodeId) -> Option<&mut Node> {
        self.nodes.get_mut(id)
    }

    /// Look up a node or report it as disposed.
    pub(crate) fn require(&self, id: NodeId) -> Result<&Node> {
        self.nodes.get(id).ok_or_else(|| ReactiveError::Disposed {
            node: format!("{id:?}"),
        })
    }

    pub(crate) fn len(&self) -> usize {
        self.nodes.len()
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = (NodeId, &Node)> {
        self.nodes.iter()
    }

    pub(crate) fn label(&self, id: NodeId) -> String {
        match self.nodes.get(id) {
            Some(node) => node.label(),
            None => format!("{id:?}"),
        }
    }

    /// Record that `observer` read `source`.
    ///
    /// Returns `true` when a new edge was created. A read of a node that is
    /// itself mid-evaluation is a cycle. An observer that has been disposed
    /// (an effect disposing itself from its own body) gains no edge.
    pub(crate) fn link(&mut self, source: NodeId, observer: NodeId) -> Result<bool> {
        if source == observer {
            return Ok(false);
        }

        let src = self.require(source)?;
        if src.computing {
            return Err(ReactiveError::Cycle { node: src.label() });
        }
        let wanted = src.level.above();

        let Some(obs) = self.nodes.get_mut(observer) else {
            return Ok(false);
        };
        if !obs.sources.insert(source) {
            return Ok(false);
        }
        let observer_level = obs.level;

        if let Some(src) = self.nodes.get_mut(source) {
            src.observers.insert(observer);
        }
        trace!(?source, ?observer, "edge linked");

        if !observer_level.is_effect() && observer_level < wanted {
            if let Err(err) = self.raise_level(observer, wanted) {
                self.unlink(source, observer);
                return Err(err);
            }
        }
        Ok(true)
    }

    fn unlink(&mut self, source: NodeId, observer: NodeId) {
        if let Some(src) = self.nodes.get_mut(source) {
            src.observers.shift_remove(&observer);
        }
        if let Some(obs) = self.nodes.get_mut(observer) {
            obs.sources.shift_remove(&source);
        }
    }

    /// Raise `start` to at least `min` and push the raise downstream.
    fn raise_level(&mut self, start: NodeId, min: Level) -> Result<()> {
        let bound = self.next_serial.saturating_add(1);
        let mut work: SmallVec<[(NodeId, Level); 8]> = smallvec![(start, min)];

        while let Some((id, level)) = work.pop() {
            if u64::from(level.get()) > bound {
                return Err(ReactiveError::Cycle {
                    node: self.label(start),
                });
            }
            let Some(node) = self.nodes.get_mut(id) else {
                continue;
            };
            if node.level.is_effect() || node.level >= level {
                continue;
            }
            trace!(
                serial = node.serial,
                from = node.level.get(),
                to = level.get(),
                "level raised"
            );
            node.level = level;
            let next = level.above();
            work.extend(node.observers.iter().map(|&observer| (observer, next)));
        }
        Ok(())
    }

    /// Tear down every source edge of `id`, returning the old sources.
    pub(crate) fn take_sources(&mut self, id: NodeId) -> IndexSet<NodeId> {
        let Some(node) = self.nodes.get_mut(id) else {
            return IndexSet::new();
        };
        let sources = std::mem::take(&mut node.sources);
        for source in &sources {
            if let Some(source) = self.nodes.get_mut(*source) {
                source.observers.shift_remove(&id);
            }
        }
        sources
    }

    /// Re-add edges removed by [`take_sources`](Self::take_sources).
    ///
    /// Levels are left alone: they were consistent when the edges existed.
    pub(crate) fn restore_sources(&mut self, id: NodeId, sources: IndexSet<NodeId>) {
        if !self.nodes.contains_key(id) {
            return;
        }
        for source in sources {
            let Some(src) = self.nodes.get_mut(source) else {
                continue;
            };
            src.observers.insert(id);
            if let Some(node) = self.nodes.get_mut(id) {
                node.sources.insert(source);
            }
        }
    }

    /// Verify edge symmetry and level ordering.
    pub(crate) fn check_invariants(&self) -> Result<()> {
        for (id, node) in &self.nodes {
            for source in &node.sources {
                let src = self.nodes.get(*source).ok_or_else(|| {
                    ReactiveError::Invariant(format!("{} reads a removed node", node.label()))
                })?;
                if !src.observers.contains(&id) {
                    return Err(ReactiveError::Invariant(format!(
                        "{} reads {} but is not among its observers",
                        node.label(),
                        src.label()
                    )));
                }
                if !node.level.is_effect() && node.level <= src.level {
                    return Err(ReactiveError::Invariant(format!(
                        "{} (level {}) is not above its source {} (level {})",
                        node.label(),
                        node.level.get(),
                        src.label(),
                        src.level.get()
                    )));
                }
            }
            for observer in &node.observers {
                let obs = self.nodes.get(*observer).ok_or_else(|| {
                    ReactiveError::Invariant(format!(
                        "{} is observed by a removed node",
                        node.label()
                    ))
                })?;
                if !obs.sources.contains(&id) {
                    return Err(ReactiveError::Invariant(format!(
                        "{} lists {} as observer without the matching source edge",
                        node.label(),
                        obs.label()
                    )));
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::node::{NodeKind, Resolve};
    use crate::reactive::Runtime;
    use std::rc::Rc;

    struct Noop;

    impl Resolve for Noop {
        fn resolve(&self, _rt: &Runtime, _id: NodeId) -> Result<()> {
            Ok(())
        }
    }

    fn computed() -> Node {
        Node::new(NodeKind::Computed(Rc::new(Noop)), None)
    }

    #[test]
    fn insert_assigns_increasing_serials() {
        let mut graph = Graph::new();
        let a = graph.insert(Node::new(NodeKind::Signal, None));
        let b = graph.insert(computed());
        assert!(graph.get(a).unwrap().serial < graph.get(b).unwrap().serial);
        assert_eq!(graph.len(), 2);
    }

    #[test]
    fn link_is_bidirectional_and_raises_levels() {
        let mut graph = Graph::new();
        let signal = graph.insert(Node::new(NodeKind::Signal, None));
        let first = graph.insert(computed());
        let second = graph.insert(computed());

        assert!(graph.link(first, second).unwrap());
        assert!(graph.link(signal, first).unwrap());
        // Linking again is a no-op.
        assert!(!graph.link(signal, first).unwrap());

        assert!(graph.get(signal).unwrap().observers.contains(&first));
        assert!(graph.get(first).unwrap().sources.contains(&signal));
        assert_eq!(graph.get(first).unwrap().level.get(), 1);
        assert_eq!(graph.get(second).unwrap().level.get(), 2);
        graph.check_invariants().unwrap();
    }

    #[test]
    fn raise_propagates_downstream() {
        let mut graph = Graph::new();
        let a = graph.insert(computed());
        let b = graph.insert(computed());
        let c = graph.insert(computed());
        let d = graph.insert(computed());

        graph.link(c, d).unwrap();
        graph.link(b, c).unwrap();
        graph.link(a, b).unwrap();

        assert_eq!(graph.get(d).unwrap().level.get(), 4);
        graph.check_invariants().unwrap();
    }

    #[test]
    fn cyclic_edge_is_rejected_and_undone() {
        let mut graph = Graph::new();
        let a = graph.insert(computed());
        let b = graph.insert(computed());

        graph.link(a, b).unwrap();
        let err = graph.link(b, a).unwrap_err();
        assert!(matches!(err, ReactiveError::Cycle { .. }));
        assert!(!graph.get(a).unwrap().sources.contains(&b));
        assert!(!graph.get(b).unwrap().observers.contains(&a));
    }

    #[test]
    fn reading_a_computing_node_is_a_cycle() {
        let mut graph = Graph::new();
        let a = graph.insert(computed());
        let b = graph.insert(computed());
        graph.get_mut(a).unwrap().computing = true;

        let err = graph.link(a, b).unwrap_err();
        assert!(matches!(err, ReactiveError::Cycle { .. }));
    }

    #[test]
    fn take_and_restore_sources_round_trip() {
        let mut graph = Graph::new();
        let s1 = graph.insert(Node::new(NodeKind::Signal, None));
        let s2 = graph.insert(Node::new(NodeKind::Signal, None));
        let c = graph.insert(computed());
        graph.link(s1, c).unwrap();
        graph.link(s2, c).unwrap();

        let old = graph.take_sources(c);
        assert_eq!(old.len(), 2);
        assert!(graph.get(s1).unwrap().observers.is_empty());
        assert!(graph.get(c).unwrap().sources.is_empty());

        graph.restore_sources(c, old);
        assert!(graph.get(s2).unwrap().observers.contains(&c));
        graph.check_invariants().unwrap();
    }

    #[test]
    fn remove_detaches_both_directions() {
        let mut graph = Graph::new();
        let s = graph.insert(Node::new(NodeKind::Signal, None));
        let c = graph.insert(computed());
        let e = graph.insert(Node::new(NodeKind::Effect(Rc::new(Noop)), None));
        graph.link(s, c).unwrap();
        graph.link(c, e).unwrap();

        graph.remove(c).unwrap();
        assert!(graph.get(c).is_none());
        assert!(graph.get(s).unwrap().observers.is_empty());
        assert!(graph.get(e).unwrap().sources.is_empty());
        assert!(matches!(
            graph.require(c),
            Err(ReactiveError::Disposed { .. })
        ));
        graph.check_invariants().unwrap();
    }

    #[test]
    fn effects_keep_their_level() {
        let mut graph = Graph::new();
        let c = graph.insert(computed());
        let e = graph.insert(Node::new(NodeKind::Effect(Rc::new(Noop)), None));
        graph.link(c, e).unwrap();
        assert!(graph.get(e).unwrap().level.is_effect());
    }
}
