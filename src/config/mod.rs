//! On-disk layout: `meshlink.conf`, `ecdsa_key.priv`, `hosts/<name>`,
//! `invitations/<cookie>`, and the `.lock` advisory lock.

pub mod host;
pub mod invitation;
pub mod kv;

use std::fs::{self, File};
use std::path::{Path, PathBuf};

use crate::error::*;
use crate::graph::node::DeviceClass;
use crate::graph::NodeName;
use kv::KvFile;

pub use host::HostRecord;
pub use invitation::Invitation;

/// `meshlink.conf`: self name, port, device class, options.
#[derive(Clone, Debug)]
pub struct MainConfig {
    pub name: NodeName,
    pub port: u16,
    pub device_class: DeviceClass,
    pub options: u32,
}

impl MainConfig {
    pub fn parse(text: &str) -> Result<Self> {
        let kv = KvFile::parse(text)?;
        let name = NodeName::new(kv.get("Name").ok_or(Error::simple(ErrorKind::Inval))?)?;
        let port = kv.get("Port").unwrap_or("0").parse().wrapped(ErrorKind::Inval)?;
        let device_class = match kv.get("DeviceClass") {
            Some(c) => c.parse()?,
            None => DeviceClass::Unknown,
        };
        let options = kv.get("Options").unwrap_or("0").parse().wrapped(ErrorKind::Inval)?;
        Ok(MainConfig { name, port, device_class, options })
    }

    pub fn render(&self) -> String {
        let mut kv = KvFile::new();
        kv.set("Name", self.name.as_str());
        kv.set("Port", self.port.to_string());
        kv.set("DeviceClass", self.device_class.to_string());
        kv.set("Options", self.options.to_string());
        kv.render()
    }
}

/// Writes `contents` to `path` via a temp-file-then-rename, so a crash
/// mid-write never leaves a half-written config file.
pub fn atomic_write(path: &Path, contents: &str) -> Result<()> {
    let tmp = path.with_extension("tmp");
    fs::write(&tmp, contents).wrapped(ErrorKind::NoMem)?;
    fs::rename(&tmp, path).wrapped(ErrorKind::NoMem)?;
    Ok(())
}

/// Holds the advisory `.lock` file for as long as the confbase is open
///` of the same directory fails with
/// `EBUSY`"). Dropping it releases the lock.
#[derive(Debug)]
pub struct ConfigLock {
    _file: File,
    path: PathBuf,
}

impl Drop for ConfigLock {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.path);
    }
}

/// A confbase directory, opened and locked for the handle's lifetime.
#[derive(Debug)]
pub struct ConfigStore {
    root: PathBuf,
    _lock: ConfigLock,
}

impl ConfigStore {
    /// Opens `root`, creating the expected subdirectories if absent,
    /// and acquires the `.lock` file. Fails with `ErrorKind::Busy` if
    /// another instance already holds it.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(root.join("hosts")).wrapped(ErrorKind::NoMem)?;
        fs::create_dir_all(root.join("invitations")).wrapped(ErrorKind::NoMem)?;

        let lock_path = root.join(".lock");
        let file = File::options()
            .write(true)
            .create_new(true)
            .open(&lock_path)
            .map_err(|e| {
                if e.kind() == std::io::ErrorKind::AlreadyExists {
                    Error::simple(ErrorKind::Busy)
                } else {
                    Error::wrapped(ErrorKind::NoMem, e)
                }
            })?;

        Ok(ConfigStore { root, _lock: ConfigLock { _file: file, path: lock_path } })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn main_config_path(&self) -> PathBuf {
        self.root.join("meshlink.conf")
    }

    fn key_path(&self) -> PathBuf {
        self.root.join("ecdsa_key.priv")
    }

    fn host_path(&self, name: &NodeName) -> PathBuf {
        self.root.join("hosts").join(name.as_str())
    }

    fn invitation_path(&self, cookie: &str) -> PathBuf {
        self.root.join("invitations").join(cookie)
    }

    pub fn key_path_for_load(&self) -> PathBuf {
        self.key_path()
    }

    pub fn load_main_config(&self) -> Result<Option<MainConfig>> {
        let path = self.main_config_path();
        if !path.exists() {
            return Ok(None);
        }
        let text = fs::read_to_string(&path).wrapped(ErrorKind::NoEnt)?;
        Ok(Some(MainConfig::parse(&text)?))
    }

    pub fn save_main_config(&self, config: &MainConfig) -> Result<()> {
        atomic_write(&self.main_config_path(), &config.render())
    }

    pub fn load_host(&self, name: &NodeName) -> Result<Option<HostRecord>> {
        let path = self.host_path(name);
        if !path.exists() {
            return Ok(None);
        }
        let text = fs::read_to_string(&path).wrapped(ErrorKind::NoEnt)?;
        Ok(Some(HostRecord::parse(&text)?))
    }

    pub fn save_host(&self, name: &NodeName, record: &HostRecord) -> Result<()> {
        atomic_write(&self.host_path(name), &record.render())
    }

    pub fn list_hosts(&self) -> Result<Vec<NodeName>> {
        let mut names = Vec::new();
        for entry in fs::read_dir(self.root.join("hosts")).wrapped(ErrorKind::NoEnt)? {
            let entry = entry.wrapped(ErrorKind::NoEnt)?;
            if let Some(name) = entry.file_name().to_str() {
                if let Ok(name) = NodeName::new(name) {
                    names.push(name);
                }
            }
        }
        Ok(names)
    }

    pub fn save_invitation(&self, cookie: &str, invitation: &Invitation) -> Result<()> {
        atomic_write(&self.invitation_path(cookie), &invitation.render())
    }

    pub fn load_invitation(&self, cookie: &str) -> Result<Option<Invitation>> {
        let path = self.invitation_path(cookie);
        if !path.exists() {
            return Ok(None);
        }
        let text = fs::read_to_string(&path).wrapped(ErrorKind::NoEnt)?;
        Ok(Some(Invitation::parse(&text)?))
    }

    pub fn remove_invitation(&self, cookie: &str) -> Result<()> {
        let path = self.invitation_path(cookie);
        if path.exists() {
            fs::remove_file(&path).wrapped(ErrorKind::NoMem)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_twice_fails_busy() {
        let dir = tempfile::tempdir().unwrap();
        let _store = ConfigStore::open(dir.path()).unwrap();
        let err = ConfigStore::open(dir.path()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Busy);
    }

    #[test]
    fn lock_is_released_on_drop() {
        let dir = tempfile::tempdir().unwrap();
        {
            let _store = ConfigStore::open(dir.path()).unwrap();
        }
        let _store2 = ConfigStore::open(dir.path()).unwrap();
    }

    #[test]
    fn main_config_persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let store = ConfigStore::open(dir.path()).unwrap();
        let config = MainConfig {
            name: NodeName::new("foo").unwrap(),
            port: 12345,
            device_class: DeviceClass::Backbone,
            options: 0,
        };
        store.save_main_config(&config).unwrap();
        drop(store);

        let store2 = ConfigStore::open(dir.path()).unwrap();
        let loaded = store2.load_main_config().unwrap().unwrap();
        assert_eq!(loaded.name.as_str(), "foo");
        assert_eq!(loaded.port, 12345);
    }

    #[test]
    fn host_round_trips_through_store() {
        let dir = tempfile::tempdir().unwrap();
        let store = ConfigStore::open(dir.path()).unwrap();
        let name = NodeName::new("bar").unwrap();
        let record = HostRecord { canonical_address: Some("bar.example".into()), ..HostRecord::default() };
        store.save_host(&name, &record).unwrap();
        let loaded = store.load_host(&name).unwrap().unwrap();
        assert_eq!(loaded.canonical_address, record.canonical_address);
        assert_eq!(store.list_hosts().unwrap(), vec![name]);
    }
}
