//! The `Key = Value` line grammar shared by `meshlink.conf` and
//! `hosts/<name>`.

use std::collections::HashMap;

use crate::error::*;

/// A parsed key=value file, preserving repeated keys in insertion order
/// (host files may carry several `Address`/`Subnet` lines).
#[derive(Default, Debug)]
pub struct KvFile {
    entries: Vec<(String, String)>,
}

impl KvFile {
    pub fn new() -> Self {
        KvFile { entries: Vec::new() }
    }

    pub fn parse(text: &str) -> Result<Self> {
        let mut entries = Vec::new();
        for (lineno, raw_line) in text.lines().enumerate() {
            let line = raw_line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let (key, value) = line.split_once('=').ok_or_else(|| {
                Error::wrapped(ErrorKind::Protocol, format!("line {}: missing `=`", lineno + 1))
            })?;
            entries.push((key.trim().to_string(), value.trim().to_string()));
        }
        Ok(KvFile { entries })
    }

    pub fn set(&mut self, key: &str, value: impl Into<String>) {
        self.entries.retain(|(k, _)| k != key);
        self.entries.push((key.to_string(), value.into()));
    }

    pub fn push(&mut self, key: &str, value: impl Into<String>) {
        self.entries.push((key.to_string(), value.into()));
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries.iter().find(|(k, _)| k == key).map(|(_, v)| v.as_str())
    }

    pub fn get_all<'a>(&'a self, key: &'a str) -> impl Iterator<Item = &'a str> {
        self.entries.iter().filter(move |(k, _)| k == key).map(|(_, v)| v.as_str())
    }

    pub fn render(&self) -> String {
        let mut out = String::new();
        for (k, v) in &self.entries {
            out.push_str(k);
            out.push_str(" = ");
            out.push_str(v);
            out.push('\n');
        }
        out
    }

    pub fn as_map(&self) -> HashMap<&str, &str> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str())).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_and_renders_round_trip() {
        let text = "Name = foo\nPort = 655\n# a comment\n\nDeviceClass = BACKBONE\n";
        let kv = KvFile::parse(text).unwrap();
        assert_eq!(kv.get("Name"), Some("foo"));
        assert_eq!(kv.get("Port"), Some("655"));
        assert_eq!(kv.get("DeviceClass"), Some("BACKBONE"));
    }

    #[test]
    fn collects_repeated_keys_in_order() {
        let kv = KvFile::parse("Address = 1.2.3.4\nAddress = 5.6.7.8\n").unwrap();
        let all: Vec<_> = kv.get_all("Address").collect();
        assert_eq!(all, vec!["1.2.3.4", "5.6.7.8"]);
    }

    #[test]
    fn rejects_malformed_line() {
        assert!(KvFile::parse("this has no equals sign").is_err());
    }

    #[test]
    fn set_replaces_while_push_appends() {
        let mut kv = KvFile::new();
        kv.push("Address", "1.1.1.1");
        kv.push("Address", "2.2.2.2");
        kv.set("Port", "655");
        kv.set("Port", "656");
        assert_eq!(kv.get_all("Address").count(), 2);
        assert_eq!(kv.get("Port"), Some("656"));
    }
}
