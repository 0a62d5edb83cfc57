//! MAC/IP prefix claims and longest-prefix-match lookup.

use std::net::IpAddr;

use crate::graph::node::NodeName;

/// An IP prefix, independent of the `SocketAddr` port component.
#[derive(Clone, Eq, PartialEq, Debug)]
pub struct Prefix {
    pub addr: IpAddr,
    pub len: u8,
}

impl Prefix {
    pub fn new(addr: IpAddr, len: u8) -> Self {
        Prefix { addr, len }
    }

    fn contains(&self, other: &IpAddr) -> bool {
        match (self.addr, other) {
            (IpAddr::V4(a), IpAddr::V4(b)) => {
                let mask = mask_u32(self.len.min(32));
                u32::from(a) & mask == u32::from(*b) & mask
            }
            (IpAddr::V6(a), IpAddr::V6(b)) => {
                let mask = mask_u128(self.len.min(128));
                u128::from(a) & mask == u128::from(*b) & mask
            }
            _ => false,
        }
    }
}

fn mask_u32(len: u8) -> u32 {
    if len == 0 { 0 } else { u32::MAX << (32 - len as u32) }
}

fn mask_u128(len: u8) -> u128 {
    if len == 0 { 0 } else { u128::MAX << (128 - len as u32) }
}

/// A node's claim to own a prefix. Subnets are owned by exactly one
/// node at a time; the latest announcement wins.
#[derive(Clone, Eq, PartialEq, Debug)]
pub struct Subnet {
    pub owner: NodeName,
    pub prefix: Prefix,
    pub serial: u64,
}

/// Prefix-matching table of all subnets claimed in the mesh, supporting
/// longest-matching-prefix lookup by destination address.
#[derive(Default)]
pub struct SubnetTable {
    entries: Vec<Subnet>,
}

impl SubnetTable {
    pub fn new() -> Self {
        SubnetTable { entries: Vec::new() }
    }

    /// Inserts or replaces the claim for this exact prefix, honouring
    /// "latest announcement wins". Returns `true` if applied.
    pub fn announce(&mut self, subnet: Subnet) -> bool {
        if let Some(existing) = self.entries.iter_mut().find(|s| s.prefix == subnet.prefix) {
            if subnet.serial <= existing.serial {
                return false;
            }
            *existing = subnet;
            return true;
        }
        self.entries.push(subnet);
        true
    }

    pub fn withdraw(&mut self, owner: &NodeName, prefix: &Prefix) {
        self.entries.retain(|s| !(&s.owner == owner && &s.prefix == prefix));
    }

    /// Drops every subnet claimed by `owner`, e.g. when the node is removed.
    pub fn withdraw_all_owned_by(&mut self, owner: &NodeName) {
        self.entries.retain(|s| &s.owner != owner);
    }

    /// Returns the owner of the longest prefix matching `dest`, if any.
    pub fn lookup(&self, dest: &IpAddr) -> Option<&NodeName> {
        self.entries
            .iter()
            .filter(|s| s.prefix.contains(dest))
            .max_by_key(|s| s.prefix.len)
            .map(|s| &s.owner)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Subnet> {
        self.entries.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn name(s: &str) -> NodeName {
        NodeName::new(s).unwrap()
    }

    #[test]
    fn longest_prefix_wins() {
        let mut table = SubnetTable::new();
        table.announce(Subnet {
            owner: name("a"),
            prefix: Prefix::new(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 0)), 8),
            serial: 1,
        });
        table.announce(Subnet {
            owner: name("b"),
            prefix: Prefix::new(IpAddr::V4(Ipv4Addr::new(10, 0, 1, 0)), 24),
            serial: 1,
        });

        let dest = IpAddr::V4(Ipv4Addr::new(10, 0, 1, 42));
        assert_eq!(table.lookup(&dest), Some(&name("b")));

        let dest2 = IpAddr::V4(Ipv4Addr::new(10, 0, 2, 42));
        assert_eq!(table.lookup(&dest2), Some(&name("a")));
    }

    #[test]
    fn stale_announcement_is_ignored() {
        let mut table = SubnetTable::new();
        let prefix = Prefix::new(IpAddr::V4(Ipv4Addr::new(192, 168, 0, 0)), 16);
        table.announce(Subnet { owner: name("a"), prefix: prefix.clone(), serial: 5 });
        let applied = table.announce(Subnet { owner: name("b"), prefix: prefix.clone(), serial: 2 });
        assert!(!applied);
        assert_eq!(table.lookup(&IpAddr::V4(Ipv4Addr::new(192, 168, 1, 1))), Some(&name("a")));
    }

    #[test]
    fn withdraw_all_owned_by_removes_claims() {
        let mut table = SubnetTable::new();
        let prefix = Prefix::new(IpAddr::V4(Ipv4Addr::new(172, 16, 0, 0)), 12);
        table.announce(Subnet { owner: name("a"), prefix: prefix.clone(), serial: 1 });
        table.withdraw_all_owned_by(&name("a"));
        assert_eq!(table.lookup(&IpAddr::V4(Ipv4Addr::new(172, 16, 5, 5))), None);
    }
}
