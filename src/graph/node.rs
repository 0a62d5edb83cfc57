//! Peer identities.

use std::collections::HashSet;
use std::fmt;
use std::net::SocketAddr;
use std::time::Instant;

use crate::crypto::PublicKey;
use crate::error::*;

/// A stable peer name: 1-64 printable ASCII bytes, unique within a mesh.
#[derive(Clone, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct NodeName(String);

impl NodeName {
    pub fn new(name: impl Into<String>) -> Result<Self> {
        let name = name.into();
        if name.is_empty() || name.len() > 64 {
            return Err("node name must be 1-64 bytes").wrapped(ErrorKind::Inval);
        }
        if !name.bytes().all(|b| (0x20..=0x7e).contains(&b)) {
            return Err("node name must be printable ASCII").wrapped(ErrorKind::Inval);
        }
        Ok(NodeName(name))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NodeName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for NodeName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeName({:?})", self.0)
    }
}

/// Reachability hint. Influences whether a node originates
/// `REQ_EXTERNAL` and how eagerly peers try to connect to it.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum DeviceClass {
    Backbone,
    Stationary,
    Portable,
    Unknown,
}

impl DeviceClass {
    /// Only `BACKBONE`/`STATIONARY` nodes ask peers for their own
    /// external address.
    pub fn originates_req_external(self) -> bool {
        matches!(self, DeviceClass::Backbone | DeviceClass::Stationary)
    }
}

impl fmt::Display for DeviceClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DeviceClass::Backbone => "BACKBONE",
            DeviceClass::Stationary => "STATIONARY",
            DeviceClass::Portable => "PORTABLE",
            DeviceClass::Unknown => "UNKNOWN",
        };
        f.write_str(s)
    }
}

impl std::str::FromStr for DeviceClass {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "BACKBONE" => Ok(DeviceClass::Backbone),
            "STATIONARY" => Ok(DeviceClass::Stationary),
            "PORTABLE" => Ok(DeviceClass::Portable),
            "UNKNOWN" => Ok(DeviceClass::Unknown),
            _ => Err("unrecognised device class").wrapped(ErrorKind::Inval),
        }
    }
}

/// Path MTU discovery state for the UDP path to one peer.
#[derive(Clone, Debug)]
pub struct MtuState {
    pub min: u16,
    pub max: u16,
    pub discovered: Option<u16>,
    pub probes_survived_at_high_water: u32,
    pub last_probe_at: Option<Instant>,
    pub last_activity_at: Option<Instant>,
}

impl MtuState {
    pub const DEFAULT_MIN: u16 = 512;
    pub const DEFAULT_MAX: u16 = 1452; // 1500 - UDP header - SPTPS overhead

    pub fn new() -> Self {
        MtuState {
            min: Self::DEFAULT_MIN,
            max: Self::DEFAULT_MAX,
            discovered: None,
            probes_survived_at_high_water: 0,
            last_probe_at: None,
            last_activity_at: None,
        }
    }

    /// `mtu` stabilises once the high-water mark survives two probe
    /// intervals.
    pub fn is_stable(&self) -> bool {
        self.probes_survived_at_high_water >= 2
    }

    /// Resets probing back to the lower bound, e.g. on a path change
    /// (first-hop address change) or long UDP silence.
    pub fn reset(&mut self) {
        self.min = Self::DEFAULT_MIN;
        self.discovered = None;
        self.probes_survived_at_high_water = 0;
    }
}

impl Default for MtuState {
    fn default() -> Self {
        Self::new()
    }
}

/// One peer in the mesh.
pub struct Node {
    pub name: NodeName,
    pub pubkey: Option<PublicKey>,
    pub device_class: DeviceClass,
    pub options: u32,
    pub session_version: u32,
    pub addresses: Vec<SocketAddr>,
    pub canonical_hostname: Option<String>,
    pub preferred_udp_address: Option<SocketAddr>,
    pub external_address: Option<SocketAddr>,
    pub mtu: MtuState,
    pub edges: HashSet<NodeName>,
    pub connection: Option<NodeName>,
    pub last_seen: Option<Instant>,
    pub next_probe: Option<Instant>,
    pub reachable: bool,
}

impl Node {
    pub fn new(name: NodeName) -> Self {
        Node {
            name,
            pubkey: None,
            device_class: DeviceClass::Unknown,
            options: 0,
            session_version: 0,
            addresses: Vec::new(),
            canonical_hostname: None,
            preferred_udp_address: None,
            external_address: None,
            mtu: MtuState::new(),
            edges: HashSet::new(),
            connection: None,
            last_seen: None,
            next_probe: None,
            reachable: false,
        }
    }
}

impl fmt::Debug for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Node")
            .field("name", &self.name)
            .field("device_class", &self.device_class)
            .field("reachable", &self.reachable)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_empty_and_oversized_names() {
        assert!(NodeName::new("").is_err());
        assert!(NodeName::new("a".repeat(65)).is_err());
        assert!(NodeName::new("a".repeat(64)).is_ok());
    }

    #[test]
    fn rejects_non_printable_names() {
        assert!(NodeName::new("bad\nname").is_err());
    }

    #[test]
    fn device_class_req_external_origination() {
        assert!(DeviceClass::Backbone.originates_req_external());
        assert!(DeviceClass::Stationary.originates_req_external());
        assert!(!DeviceClass::Portable.originates_req_external());
        assert!(!DeviceClass::Unknown.originates_req_external());
    }
}
