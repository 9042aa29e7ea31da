use std::fmt::{Debug, Formatter};

use crate::node_addr::NodeAddr;

/// An ordered sequence of nodes from a path's owner (index 0) to its terminal node. A discovery
///  request accumulates the path hop by hop, and the destination reverses it to route the reply
///  back to the originator.
#[derive(Clone, Eq, PartialEq)]
pub struct Path(Vec<NodeAddr>);

impl Debug for Path {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "[")?;
        for (i, node) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, " -> ")?;
            }
            write!(f, "{}", node)?;
        }
        write!(f, "]")
    }
}

impl Path {
    pub fn new(owner: NodeAddr) -> Path {
        Path(vec![owner])
    }

    pub fn from_nodes(nodes: Vec<NodeAddr>) -> Path {
        Path(nodes)
    }

    pub fn nodes(&self) -> &[NodeAddr] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn owner(&self) -> Option<NodeAddr> {
        self.0.first().copied()
    }

    pub fn terminal(&self) -> Option<NodeAddr> {
        self.0.last().copied()
    }

    pub fn contains(&self, node: NodeAddr) -> bool {
        self.0.contains(&node)
    }

    /// Appends a node, returning `false` without modifying the path if it is full
    #[must_use]
    pub fn push(&mut self, node: NodeAddr, max_len: usize) -> bool {
        if self.0.len() >= max_len {
            return false;
        }
        self.0.push(node);
        true
    }

    pub fn reversed(&self) -> Path {
        Path(self.0.iter().rev().copied().collect())
    }

    pub fn position_of(&self, node: NodeAddr) -> Option<usize> {
        self.0.iter().position(|n| *n == node)
    }

    /// The node following `node` in this path, i.e. the next hop when forwarding along it
    pub fn hop_after(&self, node: NodeAddr) -> Option<NodeAddr> {
        self.position_of(node)
            .and_then(|idx| self.0.get(idx + 1))
            .copied()
    }
}
