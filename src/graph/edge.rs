//! Directed link announcements.

use std::net::SocketAddr;

use crate::graph::node::NodeName;

/// A directed announcement "`owner` says there is a link `from` -> `to`".
///
/// Edges are symmetric by convention but stored directionally; an edge
/// is active only once both directions are present.
#[derive(Clone, Eq, PartialEq, Debug)]
pub struct Edge {
    pub owner: NodeName,
    pub from: NodeName,
    pub to: NodeName,
    pub weight: u32,
    pub address: Option<SocketAddr>,
    pub options: u32,
    pub serial: u64,
}

impl Edge {
    pub fn new(owner: NodeName, from: NodeName, to: NodeName, weight: u32, address: Option<SocketAddr>, options: u32, serial: u64) -> Self {
        Edge { owner, from, to, weight, address, options, serial }
    }

    /// The tuple flooding dedups on: "edges carry
    /// `(owner, from, to, weight, address, options)`; a repeated
    /// identical tuple is silently dropped."
    fn content_eq(&self, other: &Edge) -> bool {
        self.owner == other.owner
            && self.from == other.from
            && self.to == other.to
            && self.weight == other.weight
            && self.address == other.address
            && self.options == other.options
    }

    /// Whether `incoming` should replace `self` in the graph: a newer
    /// serial always wins, and an identical tuple is a harmless no-op
    /// rather than a rejection (so flooding can treat it as "already
    /// applied" instead of stale).
    pub fn should_apply(current: Option<&Edge>, incoming: &Edge) -> EdgeApplication {
        match current {
            None => EdgeApplication::Fresh,
            Some(cur) if cur.content_eq(incoming) && cur.serial == incoming.serial => EdgeApplication::Duplicate,
            Some(cur) if incoming.serial > cur.serial => EdgeApplication::Fresh,
            Some(_) => EdgeApplication::Stale,
        }
    }
}

#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum EdgeApplication {
    /// Not seen before, or supersedes the stored edge; apply and reflood.
    Fresh,
    /// Identical to what's already stored; idempotent no-op, still floods
    /// are suppressed for it since the receiver has already seen it.
    Duplicate,
    /// Older than what's stored; drop it.
    Stale,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn name(s: &str) -> NodeName {
        NodeName::new(s).unwrap()
    }

    #[test]
    fn fresh_edge_applies_when_absent() {
        let e = Edge::new(name("a"), name("a"), name("b"), 1, None, 0, 1);
        assert_eq!(Edge::should_apply(None, &e), EdgeApplication::Fresh);
    }

    #[test]
    fn identical_tuple_is_duplicate() {
        let e1 = Edge::new(name("a"), name("a"), name("b"), 1, None, 0, 5);
        let e2 = e1.clone();
        assert_eq!(Edge::should_apply(Some(&e1), &e2), EdgeApplication::Duplicate);
    }

    #[test]
    fn lower_serial_is_stale() {
        let cur = Edge::new(name("a"), name("a"), name("b"), 1, None, 0, 5);
        let old = Edge::new(name("a"), name("a"), name("b"), 1, None, 0, 3);
        assert_eq!(Edge::should_apply(Some(&cur), &old), EdgeApplication::Stale);
    }

    #[test]
    fn higher_serial_with_new_weight_is_fresh() {
        let cur = Edge::new(name("a"), name("a"), name("b"), 1, None, 0, 5);
        let newer = Edge::new(name("a"), name("a"), name("b"), 2, None, 0, 6);
        assert_eq!(Edge::should_apply(Some(&cur), &newer), EdgeApplication::Fresh);
    }
}
