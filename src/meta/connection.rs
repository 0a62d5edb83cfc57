//! Per-peer meta-connection state machine.

use std::collections::VecDeque;
use std::time::Instant;

use crate::crypto::sptps::{RecordType, Session};
use crate::error::*;
use crate::graph::NodeName;
use crate::meta::{Line, LineReader};

/// Bound on the outbound queue before `send` starts refusing more work
/// for this connection; the same back-pressure discipline channels use
/// applies equally to the meta-queue.
pub const MAX_QUEUED_LINES: usize = 4096;

/// `ALLOCATED -> CONNECTING -> HANDSHAKING -> ACTIVE -> DRAINING -> CLOSED`.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum ConnectionState {
    Allocated,
    Connecting,
    Handshaking,
    Active,
    Draining,
    Closed,
}

/// One live (or being-established) transport association with a peer.
pub struct Connection {
    /// The peer's claimed name; unverified until the handshake
    /// completes and the `ID` exchange confirms it.
    pub peer_name: Option<NodeName>,
    pub state: ConnectionState,
    pub session: Session,
    pub line_reader: LineReader,
    outbound: VecDeque<Vec<u8>>,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub packets_sent: u64,
    pub packets_received: u64,
    pub last_activity: Instant,
}

impl Connection {
    pub fn new(session: Session) -> Self {
        Connection {
            peer_name: None,
            state: ConnectionState::Allocated,
            session,
            line_reader: LineReader::new(),
            outbound: VecDeque::new(),
            bytes_sent: 0,
            bytes_received: 0,
            packets_sent: 0,
            packets_received: 0,
            last_activity: Instant::now(),
        }
    }

    pub fn begin_connecting(&mut self) -> Result<()> {
        self.transition(ConnectionState::Allocated, ConnectionState::Connecting)
    }

    pub fn begin_handshaking(&mut self) -> Result<()> {
        self.transition(ConnectionState::Connecting, ConnectionState::Handshaking)
    }

    pub fn activate(&mut self, peer_name: NodeName) -> Result<()> {
        self.transition(ConnectionState::Handshaking, ConnectionState::Active)?;
        self.peer_name = Some(peer_name);
        Ok(())
    }

    /// Starts the drain on `TERMREQ`, an error, or a timeout.
    pub fn begin_draining(&mut self) {
        if self.state == ConnectionState::Active {
            self.state = ConnectionState::Draining;
        }
    }

    pub fn close(&mut self) {
        self.state = ConnectionState::Closed;
        self.outbound.clear();
    }

    fn transition(&mut self, from: ConnectionState, to: ConnectionState) -> Result<()> {
        if self.state != from {
            return Err(format!("invalid meta-connection transition {:?} -> {:?} from {:?}", from, to, self.state))
                .wrapped(ErrorKind::Inval);
        }
        self.state = to;
        Ok(())
    }

    /// Queues a plaintext line for sealing and transmission. Refuses
    /// once the outbound queue is saturated or the connection is not
    /// active.
    pub fn enqueue_line(&mut self, line: &Line) -> Result<()> {
        if self.state != ConnectionState::Active {
            return Err("connection is not active").wrapped(ErrorKind::Busy);
        }
        if self.outbound.len() >= MAX_QUEUED_LINES {
            return Err("outbound meta-queue is full").wrapped(ErrorKind::Busy);
        }
        let mut text = line.encode().into_bytes();
        text.push(b'\n');
        self.outbound.push_back(text);
        Ok(())
    }

    /// Seals and drains every queued line into wire records ready to write.
    pub fn drain_outbound_records(&mut self) -> Result<Vec<Vec<u8>>> {
        let mut records = Vec::with_capacity(self.outbound.len());
        while let Some(plaintext) = self.outbound.pop_front() {
            let record = self.session.seal(&plaintext)?;
            self.bytes_sent += plaintext.len() as u64;
            self.packets_sent += 1;
            records.push(record);
        }
        Ok(records)
    }

    /// Feeds one raw SPTPS record off the wire; returns any complete
    /// meta-protocol lines it yielded. Handshake-typed records are
    /// consumed by the session and never reach the line reader.
    pub fn receive_record(&mut self, record: &[u8]) -> Result<Vec<Line>> {
        self.last_activity = Instant::now();
        self.bytes_received += record.len() as u64;
        self.packets_received += 1;

        let Some((ty, plaintext)) = self.session.open(record)? else {
            return Ok(Vec::new()); // replayed record, silently dropped
        };
        match ty {
            RecordType::Application => self.line_reader.feed(&plaintext),
            RecordType::Handshake | RecordType::Alert => Ok(Vec::new()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::KeyPair;
    use crate::meta::RequestId;

    fn session_pair() -> (Session, Session) {
        let kp_a = KeyPair::generate().unwrap();
        let kp_b = KeyPair::generate().unwrap();
        let pk_a = kp_a.public_key();
        let pk_b = kp_b.public_key();
        (Session::new(kp_a, pk_b), Session::new(kp_b, pk_a))
    }

    fn established_pair() -> (Session, Session) {
        let (mut a, mut b) = session_pair();
        let (_, kex_a) = a.start().unwrap();

        let p1 = b.handle_handshake(&kex_a).unwrap();
        let kex_b = p1.to_send[0].1.clone();
        let sig_b = p1.to_send[1].1.clone();

        let p2 = a.handle_handshake(&kex_b).unwrap();
        let sig_a = p2.to_send[0].1.clone();

        let p3 = a.handle_handshake(&sig_b).unwrap();
        let ack_a = p3.to_send[0].1.clone();

        let p4 = b.handle_handshake(&sig_a).unwrap();
        let ack_b = p4.to_send[0].1.clone();

        assert!(a.handle_handshake(&ack_b).unwrap().established);
        assert!(b.handle_handshake(&ack_a).unwrap().established);
        (a, b)
    }

    #[test]
    fn state_machine_rejects_out_of_order_transitions() {
        let (session, _) = session_pair();
        let mut conn = Connection::new(session);
        assert!(conn.activate(NodeName::new("peer").unwrap()).is_err());
        conn.begin_connecting().unwrap();
        conn.begin_handshaking().unwrap();
        conn.activate(NodeName::new("peer").unwrap()).unwrap();
        assert_eq!(conn.state, ConnectionState::Active);
    }

    #[test]
    fn enqueue_and_receive_roundtrip() {
        let (sa, sb) = established_pair();
        let mut ca = Connection::new(sa);
        let mut cb = Connection::new(sb);
        ca.state = ConnectionState::Active;
        cb.state = ConnectionState::Active;

        ca.enqueue_line(&Line::new(RequestId::Ping, vec![])).unwrap();
        let records = ca.drain_outbound_records().unwrap();
        assert_eq!(records.len(), 1);

        let lines = cb.receive_record(&records[0]).unwrap();
        assert_eq!(lines.len(), 1);
        assert_eq!(lines[0].id, RequestId::Ping);
    }

    #[test]
    fn enqueue_refused_once_queue_is_full() {
        let (sa, _) = session_pair();
        let mut conn = Connection::new(sa);
        conn.state = ConnectionState::Active;
        for _ in 0..MAX_QUEUED_LINES {
            conn.enqueue_line(&Line::new(RequestId::Ping, vec![])).unwrap();
        }
        assert!(conn.enqueue_line(&Line::new(RequestId::Ping, vec![])).is_err());
    }
}
