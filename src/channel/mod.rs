//! Reliable byte-stream channels multiplexed over one peer session.

pub mod wire;

use std::collections::{BTreeMap, VecDeque};
use std::time::{Duration, Instant};

use crate::error::*;
use crate::graph::NodeName;

/// Directions a channel may be half-closed in.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum Shutdown {
    Read,
    Write,
    Both,
}

#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum ChannelState {
    Opening,
    Open,
    Closed,
}

/// Identifies one channel within a peer session.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug)]
pub struct ChannelId {
    pub local_port: u16,
    pub remote_port: u16,
}

/// Largest payload, in bytes, carried by one channel segment before it
/// is split across SPTPS datagrams.
pub const SEGMENT_SIZE: usize = 1024;

/// How long an unacknowledged segment waits before retransmission.
pub const RETRANSMIT_TIMEOUT: Duration = Duration::from_millis(500);

/// Initial flow-control window advertised to the peer, in bytes.
pub const INITIAL_WINDOW: u32 = 64 * 1024;

struct OutSegment {
    data: Vec<u8>,
    fin: bool,
    sent_at: Instant,
}

/// One reliable stream multiplexed over a peer's SPTPS session.
pub struct Channel {
    pub id: ChannelId,
    pub peer: NodeName,
    pub state: ChannelState,
    read_closed: bool,
    write_closed: bool,

    send_next_seq: u32,
    send_base_seq: u32,
    send_unacked: BTreeMap<u32, OutSegment>,
    send_backlog: VecDeque<u8>,
    peer_window: u32,

    recv_next_seq: u32,
    recv_reorder: BTreeMap<u32, Vec<u8>>,
    recv_ready: VecDeque<u8>,
    local_window: u32,
}

impl Channel {
    pub fn new(id: ChannelId, peer: NodeName) -> Self {
        Channel {
            id,
            peer,
            state: ChannelState::Opening,
            read_closed: false,
            write_closed: false,
            send_next_seq: 0,
            send_base_seq: 0,
            send_unacked: BTreeMap::new(),
            send_backlog: VecDeque::new(),
            peer_window: INITIAL_WINDOW,
            recv_next_seq: 0,
            recv_reorder: BTreeMap::new(),
            recv_ready: VecDeque::new(),
            local_window: INITIAL_WINDOW,
        }
    }

    pub fn mark_open(&mut self) {
        self.state = ChannelState::Open;
    }

    /// Queues `data` for transmission, splitting it into
    /// `SEGMENT_SIZE` segments subject to the peer's advertised window.
    /// Returns the number of bytes actually queued, which may be less
    /// than `data.len()` under back-pressure.
    pub fn send(&mut self, data: &[u8]) -> Result<usize> {
        if self.write_closed || self.state == ChannelState::Closed {
            return Err("channel is not writable").wrapped(ErrorKind::Busy);
        }
        let in_flight = self.send_unacked.values().map(|s| s.data.len() as u32).sum::<u32>();
        let queued = in_flight as usize + self.send_backlog.len();
        let room = (self.peer_window as usize).saturating_sub(queued);
        let accepted = data.len().min(room);
        self.send_backlog.extend(data[..accepted].iter().copied());
        Ok(accepted)
    }

    /// Drains backlog bytes into outbound segments ready to hand to the
    /// session for sealing.
    pub fn drain_segments(&mut self) -> Vec<(u32, Vec<u8>, bool)> {
        let mut segments = Vec::new();
        while !self.send_backlog.is_empty() {
            let take = self.send_backlog.len().min(SEGMENT_SIZE);
            let data: Vec<u8> = self.send_backlog.drain(..take).collect();
            let seq = self.send_next_seq;
            self.send_next_seq += data.len() as u32;
            segments.push((seq, data.clone(), false));
            self.send_unacked.insert(seq, OutSegment { data, fin: false, sent_at: Instant::now() });
        }
        segments
    }

    /// Half- or fully closes the channel by queuing a FIN marker in the
    /// direction(s) given.
    pub fn shutdown(&mut self, how: Shutdown) {
        match how {
            Shutdown::Read => self.read_closed = true,
            Shutdown::Write => {
                self.write_closed = true;
                let seq = self.send_next_seq;
                self.send_unacked.insert(seq, OutSegment { data: Vec::new(), fin: true, sent_at: Instant::now() });
                self.send_next_seq += 1;
            }
            Shutdown::Both => {
                self.shutdown(Shutdown::Read);
                self.shutdown(Shutdown::Write);
            }
        }
        if self.read_closed && self.write_closed {
            self.state = ChannelState::Closed;
        }
    }

    /// Applies a selective ack: every seq in `acked` is removed from
    /// the retransmit buffer.
    pub fn on_ack(&mut self, acked: &[u32]) {
        for seq in acked {
            self.send_unacked.remove(seq);
        }
        self.send_base_seq = self.send_unacked.keys().next().copied().unwrap_or(self.send_next_seq);
    }

    /// Segments overdue for retransmission.
    pub fn segments_to_retransmit(&self, now: Instant) -> Vec<(u32, Vec<u8>)> {
        self.send_unacked
            .iter()
            .filter(|(_, seg)| now.duration_since(seg.sent_at) >= RETRANSMIT_TIMEOUT)
            .map(|(seq, seg)| (*seq, seg.data.clone()))
            .collect()
    }

    /// Accepts one inbound segment, reassembling in-order bytes into
    /// the readable buffer. Out-of-order segments are buffered until
    /// the gap closes.
    pub fn on_segment(&mut self, seq: u32, data: Vec<u8>, fin: bool) {
        if seq < self.recv_next_seq {
            return; // already delivered
        }
        if seq == self.recv_next_seq {
            self.recv_next_seq += data.len() as u32;
            self.recv_ready.extend(data);
            if fin {
                self.read_closed = true;
            }
            while let Some(next) = self.recv_reorder.remove(&self.recv_next_seq) {
                self.recv_next_seq += next.len() as u32;
                self.recv_ready.extend(next);
            }
        } else {
            self.recv_reorder.insert(seq, data);
        }
    }

    pub fn read_available(&mut self) -> Vec<u8> {
        self.recv_ready.drain(..).collect()
    }

    pub fn is_read_closed(&self) -> bool {
        self.read_closed
    }

    pub fn is_write_closed(&self) -> bool {
        self.write_closed
    }
}

/// Incoming channel open request: the application's
/// `channel_accept_cb` decides whether to accept it.
pub struct IncomingOpen {
    pub id: ChannelId,
    pub peer: NodeName,
}

/// Returning `false` from `channel_accept_cb` sends RST and discards
/// any state allocated for the attempt.
pub fn accept_or_reject(open: IncomingOpen, accept: bool) -> Option<Channel> {
    if accept {
        let mut channel = Channel::new(open.id, open.peer);
        channel.mark_open();
        Some(channel)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id() -> ChannelId {
        ChannelId { local_port: 1000, remote_port: 2000 }
    }

    fn peer() -> NodeName {
        NodeName::new("peer").unwrap()
    }

    #[test]
    fn send_respects_peer_window() {
        let mut ch = Channel::new(id(), peer());
        ch.peer_window = 10;
        let accepted = ch.send(&[0u8; 20]).unwrap();
        assert!(accepted <= 10);
    }

    #[test]
    fn segments_reassemble_out_of_order() {
        let mut ch = Channel::new(id(), peer());
        ch.on_segment(5, b"world".to_vec(), false);
        assert!(ch.read_available().is_empty());
        ch.on_segment(0, b"hello".to_vec(), false);
        assert_eq!(ch.read_available(), b"helloworld");
    }

    #[test]
    fn fin_marks_read_closed_once_in_order() {
        let mut ch = Channel::new(id(), peer());
        ch.on_segment(0, b"bye".to_vec(), true);
        assert!(ch.is_read_closed());
    }

    #[test]
    fn ack_clears_retransmit_buffer() {
        let mut ch = Channel::new(id(), peer());
        ch.send(b"hello").unwrap();
        let segments = ch.drain_segments();
        let seqs: Vec<u32> = segments.iter().map(|(s, _, _)| *s).collect();
        ch.on_ack(&seqs);
        assert!(ch.segments_to_retransmit(Instant::now() + RETRANSMIT_TIMEOUT * 2).is_empty());
    }

    #[test]
    fn shutdown_both_closes_channel() {
        let mut ch = Channel::new(id(), peer());
        ch.shutdown(Shutdown::Both);
        assert_eq!(ch.state, ChannelState::Closed);
    }

    #[test]
    fn reject_produces_no_channel() {
        let open = IncomingOpen { id: id(), peer: peer() };
        assert!(accept_or_reject(open, false).is_none());
    }

    use proptest::prelude::*;

    proptest! {
        /// Splitting a byte string into fixed-size segments and feeding
        /// them to `on_segment` in any order reassembles the original
        /// bytes exactly once the gaps close.
        #[test]
        fn segments_reassemble_regardless_of_arrival_order(data in proptest::collection::vec(any::<u8>(), 1..300), seed in 0u64..10_000) {
            const CHUNK: usize = 17;
            let chunks: Vec<(u32, Vec<u8>)> = data
                .chunks(CHUNK)
                .scan(0u32, |seq, chunk| {
                    let this_seq = *seq;
                    *seq += chunk.len() as u32;
                    Some((this_seq, chunk.to_vec()))
                })
                .collect();

            let mut order: Vec<usize> = (0..chunks.len()).collect();
            let mut s = seed;
            for i in (1..order.len()).rev() {
                s = s.wrapping_mul(6364136223846793005).wrapping_add(1);
                let j = (s % (i as u64 + 1)) as usize;
                order.swap(i, j);
            }

            let mut ch = Channel::new(id(), peer());
            for &idx in &order {
                let (seq, bytes) = chunks[idx].clone();
                ch.on_segment(seq, bytes, false);
            }
            prop_assert_eq!(ch.read_available(), data);
        }
    }
}
