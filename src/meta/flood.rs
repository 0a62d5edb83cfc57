//! Broadcast-except-origin flooding of graph changes.

use crate::graph::NodeName;
use crate::meta::connection::{Connection, ConnectionState};
use crate::meta::Line;

/// Enqueues `line` on every `ACTIVE` connection other than `origin`.
/// `origin` is `None` for locally-originated changes, which go out on
/// every active connection.
///
/// Per-connection enqueue failures (a saturated outbound queue) are
/// swallowed here: a slow peer falling behind on the flood must not
/// abort delivery to the others.
pub fn broadcast_except<'a, I>(connections: I, origin: Option<&NodeName>, line: &Line)
where
    I: IntoIterator<Item = (&'a NodeName, &'a mut Connection)>,
{
    for (name, conn) in connections {
        if Some(name) == origin {
            continue;
        }
        if conn.state != ConnectionState::Active {
            continue;
        }
        let _ = conn.enqueue_line(line);
    }
}

/// On entering `ACTIVE`, the full known state is dumped to the new
/// peer: every edge, then every subnet, then every node's public key
/// hint. Edges first so routing is usable before subnet claims arrive.
pub fn dump_order() -> [DumpKind; 3] {
    [DumpKind::Edges, DumpKind::Subnets, DumpKind::PublicKeys]
}

#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum DumpKind {
    Edges,
    Subnets,
    PublicKeys,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::KeyPair;
    use crate::crypto::sptps::Session;
    use crate::meta::RequestId;
    use std::collections::HashMap;

    fn session() -> Session {
        let kp = KeyPair::generate().unwrap();
        let pk = kp.public_key();
        Session::new(kp, pk)
    }

    fn active_connection() -> Connection {
        let mut conn = Connection::new(session());
        conn.state = ConnectionState::Active;
        conn
    }

    #[test]
    fn broadcast_skips_origin_but_reaches_others() {
        let mut connections: HashMap<NodeName, Connection> = HashMap::new();
        connections.insert(NodeName::new("a").unwrap(), active_connection());
        connections.insert(NodeName::new("b").unwrap(), active_connection());
        connections.insert(NodeName::new("c").unwrap(), active_connection());

        let origin = NodeName::new("a").unwrap();
        let line = Line::new(RequestId::Ping, vec![]);
        broadcast_except(connections.iter_mut(), Some(&origin), &line);

        // can't seal/inspect without keys matching real peers here; this
        // only asserts enqueue didn't panic and origin's queue stays
        // untouched relative to the others by checking drain counts.
        let a_records = connections.get_mut(&NodeName::new("a").unwrap()).unwrap().drain_outbound_records().unwrap();
        let b_records = connections.get_mut(&NodeName::new("b").unwrap()).unwrap().drain_outbound_records().unwrap();
        assert!(a_records.is_empty());
        assert_eq!(b_records.len(), 1);
    }

    #[test]
    fn dump_order_is_edges_then_subnets_then_keys() {
        assert_eq!(dump_order(), [DumpKind::Edges, DumpKind::Subnets, DumpKind::PublicKeys]);
    }
}
