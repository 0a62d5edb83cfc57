//! The node/edge graph and its reachability/routing queries.

pub mod edge;
pub mod node;
pub mod subnet;

use std::collections::{HashMap, HashSet, VecDeque};
use std::hash::BuildHasherDefault;
use std::net::IpAddr;

use intmap::IntMap;
use twox_hash::XxHash64;

pub use edge::{Edge, EdgeApplication};
pub use node::{DeviceClass, Node, NodeName};
pub use subnet::{Prefix, Subnet, SubnetTable};

use crate::error::*;

/// Hasher for the hot node/edge maps, keyed by `NodeName` and looked up
/// on every flood and routing decision.
type FastHashMap<K, V> = HashMap<K, V, BuildHasherDefault<XxHash64>>;

/// A status transition fired to the application when a node flips
/// between reachable and unreachable.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum NodeStatus {
    Reachable,
    Unreachable,
}

/// The in-memory directed multigraph of peers.
///
/// Owns the node map (keyed by name), the edge set, and the subnet
/// claims. `self_name` names the distinguished local node, created at
/// open and never removed.
pub struct Graph {
    self_name: NodeName,
    nodes: FastHashMap<NodeName, Node>,
    edges: FastHashMap<(NodeName, NodeName), Edge>,
    subnets: SubnetTable,
    ids_by_name: HashMap<NodeName, u32>,
    names_by_id: IntMap<NodeName>,
    next_id: u32,
}

impl Graph {
    pub fn new(self_name: NodeName) -> Self {
        let mut nodes = FastHashMap::default();
        nodes.insert(self_name.clone(), Node::new(self_name.clone()));
        let mut graph = Graph {
            self_name,
            nodes,
            edges: FastHashMap::default(),
            subnets: SubnetTable::new(),
            ids_by_name: HashMap::new(),
            names_by_id: IntMap::new(),
            next_id: 1,
        };
        graph.ids_by_name.insert(graph.self_name.clone(), 0);
        graph.names_by_id.insert(0u64, graph.self_name.clone());
        graph.nodes.get_mut(&graph.self_name).unwrap().reachable = true;
        graph
    }

    pub fn self_name(&self) -> &NodeName {
        &self.self_name
    }

    pub fn node(&self, name: &NodeName) -> Option<&Node> {
        self.nodes.get(name)
    }

    pub fn node_mut(&mut self, name: &NodeName) -> Option<&mut Node> {
        self.nodes.get_mut(name)
    }

    pub fn nodes(&self) -> impl Iterator<Item = &Node> {
        self.nodes.values()
    }

    pub fn subnets(&self) -> &SubnetTable {
        &self.subnets
    }

    pub fn subnets_mut(&mut self) -> &mut SubnetTable {
        &mut self.subnets
    }

    /// Creates the node if absent; nodes otherwise come into being only
    /// from config load, an edge announcement, or an invitation.
    pub fn ensure_node(&mut self, name: &NodeName) -> &mut Node {
        self.nodes.entry(name.clone()).or_insert_with(|| Node::new(name.clone()))
    }

    /// Removes a node and every edge/subnet it owns or participates in.
    /// `self` can never be removed.
    pub fn remove_node(&mut self, name: &NodeName) -> Result<()> {
        if *name == self.self_name {
            return Err("cannot remove the self node").wrapped(ErrorKind::Inval);
        }
        self.nodes.remove(name);
        self.edges.retain(|(from, to), _| from != name && to != name);
        self.subnets.withdraw_all_owned_by(name);
        self.recompute_reachability()?;
        Ok(())
    }

    /// Applies an `ADD_EDGE` announcement idempotently.
    /// Returns whether the edge should be reflooded (fresh or a genuine
    /// update; a byte-identical duplicate is not reflooded, but is not
    /// an error either).
    pub fn add_edge(&mut self, edge: Edge) -> Result<EdgeApplication> {
        let key = (edge.from.clone(), edge.to.clone());
        let application = Edge::should_apply(self.edges.get(&key), &edge);
        if application == EdgeApplication::Fresh {
            self.ensure_node(&edge.from);
            self.ensure_node(&edge.to);
            self.edges.insert(key, edge);
            self.recompute_reachability()?;
        }
        Ok(application)
    }

    /// Applies a `DEL_EDGE`. Removing one direction makes
    /// the edge inactive even if the reverse direction still exists.
    pub fn del_edge(&mut self, from: &NodeName, to: &NodeName) -> Result<bool> {
        let removed = self.edges.remove(&(from.clone(), to.clone())).is_some();
        if removed {
            self.recompute_reachability()?;
        }
        Ok(removed)
    }

    /// An edge is active only when both directions are announced.
    pub fn is_edge_active(&self, a: &NodeName, b: &NodeName) -> bool {
        self.edges.contains_key(&(a.clone(), b.clone())) && self.edges.contains_key(&(b.clone(), a.clone()))
    }

    pub fn edges(&self) -> impl Iterator<Item = &Edge> {
        self.edges.values()
    }

    /// BFS from `self` over active edges; returns nodes whose
    /// reachability flag flipped, paired with their new status.
    pub fn recompute_reachability(&mut self) -> Result<Vec<(NodeName, NodeStatus)>> {
        let mut reachable: HashSet<NodeName> = HashSet::new();
        let mut queue = VecDeque::new();
        reachable.insert(self.self_name.clone());
        queue.push_back(self.self_name.clone());

        while let Some(current) = queue.pop_front() {
            for neighbour in self.active_neighbours(&current) {
                if reachable.insert(neighbour.clone()) {
                    queue.push_back(neighbour);
                }
            }
        }

        let mut transitions = Vec::new();
        for (name, node) in self.nodes.iter_mut() {
            let now_reachable = reachable.contains(name);
            if now_reachable != node.reachable {
                node.reachable = now_reachable;
                transitions.push((
                    name.clone(),
                    if now_reachable { NodeStatus::Reachable } else { NodeStatus::Unreachable },
                ));
            }
        }
        Ok(transitions)
    }

    fn active_neighbours(&self, name: &NodeName) -> Vec<NodeName> {
        self.edges
            .keys()
            .filter(|(from, _)| from == name)
            .map(|(_, to)| to.clone())
            .filter(|to| self.is_edge_active(name, to))
            .collect()
    }

    /// Shortest path (unweighted hop count, ties broken by ascending
    /// neighbour name) from `self` to `dest`; returns the first hop.
    pub fn next_hop(&self, dest: &NodeName) -> Option<NodeName> {
        if dest == &self.self_name {
            return None;
        }
        let mut visited: HashSet<NodeName> = HashSet::new();
        let mut queue: VecDeque<(NodeName, NodeName)> = VecDeque::new();
        visited.insert(self.self_name.clone());

        let mut first_hops: Vec<NodeName> = self.active_neighbours(&self.self_name);
        first_hops.sort();
        for hop in &first_hops {
            if hop == dest {
                return Some(hop.clone());
            }
            visited.insert(hop.clone());
            queue.push_back((hop.clone(), hop.clone()));
        }

        while let Some((current, first_hop)) = queue.pop_front() {
            let mut neighbours = self.active_neighbours(&current);
            neighbours.sort();
            for neighbour in neighbours {
                if neighbour == *dest {
                    return Some(first_hop);
                }
                if visited.insert(neighbour.clone()) {
                    queue.push_back((neighbour, first_hop.clone()));
                }
            }
        }
        None
    }

    pub fn resolve_subnet(&self, dest: &IpAddr) -> Option<&NodeName> {
        self.subnets.lookup(dest)
    }

    /// Returns the compact numeric id used for `name` on the UDP wire,
    /// allocating a fresh one if this is the first time `name` has been
    /// seen.
    pub fn id_of(&mut self, name: &NodeName) -> u32 {
        if let Some(id) = self.ids_by_name.get(name) {
            return *id;
        }
        let id = self.next_id;
        self.next_id += 1;
        self.ids_by_name.insert(name.clone(), id);
        self.names_by_id.insert(id as u64, name.clone());
        id
    }

    pub fn name_of(&self, id: u32) -> Option<&NodeName> {
        self.names_by_id.get(id as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn name(s: &str) -> NodeName {
        NodeName::new(s).unwrap()
    }

    fn add_symmetric(graph: &mut Graph, a: &str, b: &str, serial: u64) {
        graph.add_edge(Edge::new(name("self"), name(a), name(b), 1, None, 0, serial)).unwrap();
        graph.add_edge(Edge::new(name("self"), name(b), name(a), 1, None, 0, serial)).unwrap();
    }

    #[test]
    fn self_node_starts_reachable() {
        let graph = Graph::new(name("self"));
        assert!(graph.node(&name("self")).unwrap().reachable);
    }

    #[test]
    fn edge_requires_both_directions_to_be_active() {
        let mut graph = Graph::new(name("self"));
        graph.add_edge(Edge::new(name("self"), name("self"), name("b"), 1, None, 0, 1)).unwrap();
        assert!(!graph.is_edge_active(&name("self"), &name("b")));
        assert!(!graph.node(&name("b")).unwrap().reachable);

        graph.add_edge(Edge::new(name("b"), name("b"), name("self"), 1, None, 0, 1)).unwrap();
        assert!(graph.is_edge_active(&name("self"), &name("b")));
        assert!(graph.node(&name("b")).unwrap().reachable);
    }

    #[test]
    fn reachability_converges_regardless_of_application_order() {
        let mut forward = Graph::new(name("self"));
        add_symmetric(&mut forward, "self", "a", 1);
        add_symmetric(&mut forward, "a", "b", 1);

        let mut reverse = Graph::new(name("self"));
        add_symmetric(&mut reverse, "a", "b", 1);
        add_symmetric(&mut reverse, "self", "a", 1);

        assert!(forward.node(&name("b")).unwrap().reachable);
        assert!(reverse.node(&name("b")).unwrap().reachable);
    }

    #[test]
    fn next_hop_picks_shortest_path_with_name_tiebreak() {
        let mut graph = Graph::new(name("self"));
        add_symmetric(&mut graph, "self", "b", 1);
        add_symmetric(&mut graph, "self", "a", 1);
        add_symmetric(&mut graph, "a", "c", 1);

        assert_eq!(graph.next_hop(&name("a")), Some(name("a")));
        assert_eq!(graph.next_hop(&name("c")), Some(name("a")));
    }

    #[test]
    fn deleting_one_direction_deactivates_the_edge() {
        let mut graph = Graph::new(name("self"));
        add_symmetric(&mut graph, "self", "a", 1);
        graph.del_edge(&name("self"), &name("a")).unwrap();
        assert!(!graph.is_edge_active(&name("self"), &name("a")));
        assert!(!graph.node(&name("a")).unwrap().reachable);
    }

    #[test]
    fn node_ids_are_stable_and_bijective() {
        let mut graph = Graph::new(name("self"));
        assert_eq!(graph.id_of(&name("self")), 0);
        let id_a = graph.id_of(&name("a"));
        let id_a_again = graph.id_of(&name("a"));
        assert_eq!(id_a, id_a_again);
        assert_eq!(graph.name_of(id_a), Some(&name("a")));
    }

    #[test]
    fn duplicate_edge_tuple_is_not_reflooded() {
        let mut graph = Graph::new(name("self"));
        let e = Edge::new(name("self"), name("self"), name("a"), 1, None, 0, 1);
        assert_eq!(graph.add_edge(e.clone()).unwrap(), EdgeApplication::Fresh);
        assert_eq!(graph.add_edge(e).unwrap(), EdgeApplication::Duplicate);
    }

    use proptest::prelude::*;

    proptest! {
        /// A star-and-chain mesh of up to 6 nodes ends up with the same
        /// reachable set no matter what order the (symmetric) edges
        /// announcing it are applied in.
        #[test]
        fn reachability_converges_under_arbitrary_edge_order(perm_seed in 0u64..10_000) {
            let node_names = ["a", "b", "c", "d", "e"];
            let links: Vec<(&str, &str)> = vec![("self", "a"), ("a", "b"), ("b", "c"), ("a", "d"), ("d", "e")];

            let mut order: Vec<usize> = (0..links.len()).collect();
            // deterministic pseudo-shuffle keyed on perm_seed, so the
            // property is reproducible without pulling in a shuffle dep
            let mut seed = perm_seed;
            for i in (1..order.len()).rev() {
                seed = seed.wrapping_mul(6364136223846793005).wrapping_add(1);
                let j = (seed % (i as u64 + 1)) as usize;
                order.swap(i, j);
            }

            let mut graph = Graph::new(name("self"));
            for &idx in &order {
                let (a, b) = links[idx];
                add_symmetric(&mut graph, a, b, 1);
            }

            for n in node_names {
                prop_assert!(graph.node(&name(n)).unwrap().reachable);
            }
        }
    }
}
