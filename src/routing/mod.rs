//! Next-hop selection and UDP-vs-relay encapsulation.

use std::collections::VecDeque;
use std::net::SocketAddr;

use crate::error::*;
use crate::graph::{Graph, NodeName};

/// How one outbound datagram to `dest` should be sent.
#[derive(Clone, Debug)]
pub enum Encapsulation {
    /// A direct address is known for the immediate peer and its MTU
    /// path has been probed successfully; send the UDP packet straight
    /// there.
    DirectUdp { peer: NodeName, addr: SocketAddr },
    /// No usable direct address, or `dest` is not an immediate peer;
    /// relay hop-by-hop over the meta-stream to `next_hop`").
    Relay { next_hop: NodeName },
}

/// Picks how to send one datagram toward `dest`.
pub fn route(graph: &Graph, dest: &NodeName) -> Result<Encapsulation> {
    if dest == graph.self_name() {
        return Err("cannot route to self").wrapped(ErrorKind::Inval);
    }

    let is_immediate_peer = graph.is_edge_active(graph.self_name(), dest);
    if is_immediate_peer {
        if let Some(node) = graph.node(dest) {
            if let Some(addr) = node.preferred_udp_address {
                if node.mtu.is_stable() {
                    return Ok(Encapsulation::DirectUdp { peer: dest.clone(), addr });
                }
            }
        }
    }

    match graph.next_hop(dest) {
        Some(next_hop) => Ok(Encapsulation::Relay { next_hop }),
        None => Err("destination is unreachable").wrapped(ErrorKind::NoEnt),
    }
}

/// Bound on the per-peer TX queue.
pub const MAX_QUEUED_DATAGRAMS: usize = 1024;

/// One outbound datagram awaiting transmission to a given peer.
struct Queued {
    dest: NodeName,
    payload: Vec<u8>,
}

/// A simple per-destination FIFO used by the reactor to pace outbound
/// traffic without blocking on socket writability.
#[derive(Default)]
pub struct TxQueue {
    queue: VecDeque<Queued>,
}

impl TxQueue {
    pub fn new() -> Self {
        TxQueue { queue: VecDeque::new() }
    }

    pub fn push(&mut self, dest: NodeName, payload: Vec<u8>) -> Result<()> {
        if self.queue.len() >= MAX_QUEUED_DATAGRAMS {
            return Err("routing transmit queue is full").wrapped(ErrorKind::Busy);
        }
        self.queue.push_back(Queued { dest, payload });
        Ok(())
    }

    pub fn pop(&mut self) -> Option<(NodeName, Vec<u8>)> {
        self.queue.pop_front().map(|q| (q.dest, q.payload))
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::Edge;

    fn name(s: &str) -> NodeName {
        NodeName::new(s).unwrap()
    }

    #[test]
    fn relays_when_no_direct_address_known() {
        let mut graph = Graph::new(name("self"));
        graph.add_edge(Edge::new(name("self"), name("self"), name("a"), 1, None, 0, 1)).unwrap();
        graph.add_edge(Edge::new(name("a"), name("a"), name("self"), 1, None, 0, 1)).unwrap();

        match route(&graph, &name("a")).unwrap() {
            Encapsulation::Relay { next_hop } => assert_eq!(next_hop, name("a")),
            other => panic!("expected relay, got {:?}", other),
        }
    }

    #[test]
    fn rejects_routing_to_self() {
        let graph = Graph::new(name("self"));
        assert!(route(&graph, &name("self")).is_err());
    }

    #[test]
    fn tx_queue_enforces_bound() {
        let mut q = TxQueue::new();
        for _ in 0..MAX_QUEUED_DATAGRAMS {
            q.push(name("a"), vec![0u8]).unwrap();
        }
        assert!(q.push(name("a"), vec![0u8]).is_err());
    }
}
