//! UDP datagram header framing and MTU discovery.

use crate::error::*;
use crate::graph::node::MtuState;

/// The 12-byte little-endian `(src_node_id, dst_node_id, seq)` header
/// prepended to every UDP datagram, ahead of the SPTPS record.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub struct UdpHeader {
    pub src: u32,
    pub dst: u32,
    pub seq: u32,
}

pub const UDP_HEADER_LEN: usize = 12;

impl UdpHeader {
    pub fn encode(&self) -> [u8; UDP_HEADER_LEN] {
        let mut out = [0u8; UDP_HEADER_LEN];
        out[0..4].copy_from_slice(&self.src.to_le_bytes());
        out[4..8].copy_from_slice(&self.dst.to_le_bytes());
        out[8..12].copy_from_slice(&self.seq.to_le_bytes());
        out
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < UDP_HEADER_LEN {
            return Err("UDP datagram shorter than its header").wrapped(ErrorKind::Protocol);
        }
        Ok(UdpHeader {
            src: u32::from_le_bytes(bytes[0..4].try_into().unwrap()),
            dst: u32::from_le_bytes(bytes[4..8].try_into().unwrap()),
            seq: u32::from_le_bytes(bytes[8..12].try_into().unwrap()),
        })
    }
}

/// Drives the binary-search MTU probe for one peer: probe
/// sizes climb from `min` toward `max`, the peer echoes back the size
/// it received intact, and the high-water mark becomes `discovered`
/// once it survives two probe intervals.
pub struct MtuProber<'a> {
    state: &'a mut MtuState,
}

impl<'a> MtuProber<'a> {
    pub fn new(state: &'a mut MtuState) -> Self {
        MtuProber { state }
    }

    /// The size to pad the next outgoing probe packet to.
    pub fn next_probe_size(&self) -> u16 {
        let low = self.state.discovered.unwrap_or(self.state.min);
        let high = self.state.max;
        if low >= high {
            high
        } else {
            low + (high - low) / 2 + 1
        }
    }

    /// Call when a probe of `size` bytes round-trips successfully.
    pub fn on_probe_acked(&mut self, size: u16) {
        match self.state.discovered {
            Some(current) if size <= current => {
                self.state.probes_survived_at_high_water += 1;
            }
            _ => {
                self.state.discovered = Some(size);
                self.state.min = size;
                self.state.probes_survived_at_high_water = 1;
            }
        }
    }

    /// Call when a probe goes unanswered: the ceiling comes down.
    pub fn on_probe_lost(&mut self, size: u16) {
        if size <= self.state.max {
            self.state.max = size.saturating_sub(1).max(self.state.min);
        }
    }

    pub fn is_stable(&self) -> bool {
        self.state.is_stable()
    }

    /// Path change or long silence: start probing over.
    pub fn reset(&mut self) {
        self.state.reset();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_round_trips() {
        let header = UdpHeader { src: 1, dst: 2, seq: 0xdeadbeef };
        let encoded = header.encode();
        assert_eq!(UdpHeader::decode(&encoded).unwrap(), header);
    }

    #[test]
    fn header_decode_rejects_short_input() {
        assert!(UdpHeader::decode(&[0u8; 4]).is_err());
    }

    #[test]
    fn prober_converges_and_stabilises() {
        let mut mtu = MtuState::new();
        let mut prober = MtuProber::new(&mut mtu);
        for _ in 0..16 {
            if prober.is_stable() {
                break;
            }
            let size = prober.next_probe_size();
            if size <= 1452 {
                prober.on_probe_acked(size);
            } else {
                prober.on_probe_lost(size);
            }
        }
        assert!(prober.is_stable());
        assert!(mtu.discovered.unwrap() <= MtuState::DEFAULT_MAX);
    }

    #[test]
    fn reset_clears_discovered_state() {
        let mut mtu = MtuState::new();
        mtu.discovered = Some(1400);
        mtu.probes_survived_at_high_water = 3;
        let mut prober = MtuProber::new(&mut mtu);
        prober.reset();
        assert!(mtu.discovered.is_none());
        assert_eq!(mtu.min, MtuState::DEFAULT_MIN);
    }
}
