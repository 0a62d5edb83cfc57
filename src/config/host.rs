//! `hosts/<name>` records: pubkey, addresses, subnets, canonical
//! hostname, plus export/import for out-of-band exchange.

use std::net::SocketAddr;

use crate::config::kv::KvFile;
use crate::crypto::PublicKey;
use crate::error::*;
use crate::graph::node::DeviceClass;
use crate::graph::subnet::Prefix;

/// The contents of one `hosts/<name>` file.
#[derive(Clone, Debug, Default)]
pub struct HostRecord {
    pub addresses: Vec<SocketAddr>,
    pub subnets: Vec<Prefix>,
    pub ecdsa_public_key: Option<PublicKey>,
    pub canonical_address: Option<String>,
    pub device_class: Option<DeviceClass>,
}

impl HostRecord {
    pub fn parse(text: &str) -> Result<Self> {
        let kv = KvFile::parse(text)?;
        let mut record = HostRecord::default();

        for addr in kv.get_all("Address") {
            record.addresses.push(addr.parse().wrapped(ErrorKind::Inval)?);
        }
        for subnet in kv.get_all("Subnet") {
            record.subnets.push(parse_prefix(subnet)?);
        }
        if let Some(key) = kv.get("ECDSAPublicKey") {
            let bytes = base64::decode(key).wrapped(ErrorKind::Inval)?;
            record.ecdsa_public_key = Some(PublicKey::from_bytes(&bytes)?);
        }
        record.canonical_address = kv.get("CanonicalAddress").map(str::to_owned);
        if let Some(class) = kv.get("DeviceClass") {
            record.device_class = Some(class.parse()?);
        }
        Ok(record)
    }

    pub fn render(&self) -> String {
        let mut kv = KvFile::new();
        for addr in &self.addresses {
            kv.push("Address", addr.to_string());
        }
        for subnet in &self.subnets {
            kv.push("Subnet", render_prefix(subnet));
        }
        if let Some(key) = &self.ecdsa_public_key {
            kv.set("ECDSAPublicKey", base64::encode(key.as_bytes()));
        }
        if let Some(addr) = &self.canonical_address {
            kv.set("CanonicalAddress", addr.clone());
        }
        if let Some(class) = self.device_class {
            kv.set("DeviceClass", class.to_string());
        }
        kv.render()
    }

    /// Produces one self-contained blob carrying the owner's name, for
    /// `export()`.
    pub fn export(&self, name: &str) -> String {
        let mut text = format!("Name = {}\n", name);
        text.push_str(&self.render());
        text
    }

    /// Parses a blob produced by `export`, returning the owner's name
    /// alongside the record.
    pub fn import(blob: &str) -> Result<(String, HostRecord)> {
        let kv = KvFile::parse(blob)?;
        let name = kv.get("Name").ok_or_else(|| Error::simple(ErrorKind::Inval))?.to_owned();
        let record = HostRecord::parse(blob)?;
        Ok((name, record))
    }
}

fn parse_prefix(text: &str) -> Result<Prefix> {
    let (addr, len) = text.split_once('/').ok_or(Error::simple(ErrorKind::Inval))?;
    Ok(Prefix::new(addr.parse().wrapped(ErrorKind::Inval)?, len.parse().wrapped(ErrorKind::Inval)?))
}

fn render_prefix(prefix: &Prefix) -> String {
    format!("{}/{}", prefix.addr, prefix.len)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::KeyPair;

    #[test]
    fn render_and_parse_round_trip() {
        let kp = KeyPair::generate().unwrap();
        let record = HostRecord {
            addresses: vec!["203.0.113.5:655".parse().unwrap()],
            subnets: vec![Prefix::new("10.0.0.0".parse().unwrap(), 8)],
            ecdsa_public_key: Some(kp.public_key()),
            canonical_address: Some("example.org".to_string()),
            device_class: Some(DeviceClass::Backbone),
        };
        let text = record.render();
        let parsed = HostRecord::parse(&text).unwrap();
        assert_eq!(parsed.addresses, record.addresses);
        assert_eq!(parsed.canonical_address, record.canonical_address);
        assert_eq!(parsed.device_class, record.device_class);
        assert_eq!(parsed.ecdsa_public_key.unwrap().as_bytes(), record.ecdsa_public_key.unwrap().as_bytes());
    }

    #[test]
    fn export_import_round_trip() {
        let record = HostRecord {
            addresses: vec!["198.51.100.1:655".parse().unwrap()],
            ..HostRecord::default()
        };
        let blob = record.export("foo");
        let (name, parsed) = HostRecord::import(&blob).unwrap();
        assert_eq!(name, "foo");
        assert_eq!(parsed.addresses, record.addresses);
    }
}
