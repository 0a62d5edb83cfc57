//! Long-term signature keys.
//!
//! Files and wire fields carry the historical name "ECDSA" (`ecdsa_key.priv`,
//! `ECDSAPublicKey`), but this implementation signs with Ed25519 throughout,
//! the long-term signature primitive `ring` actually exposes.

use std::fs;
#[cfg(unix)]
use std::os::unix::fs::PermissionsExt;
use std::path::Path;

use ring::rand::SystemRandom;
use ring::signature::{self, Ed25519KeyPair, KeyPair as _};
use zeroize::Zeroizing;

use crate::error::*;

/// A node's long-term signature keypair.
pub struct KeyPair {
    inner: Ed25519KeyPair,
    pkcs8_bytes: Zeroizing<Vec<u8>>,
}

/// A node's long-term public signature key, as exchanged in the
/// `hosts/<name>` file (`ECDSAPublicKey`) and over the meta-protocol
/// (`REQ_PUBKEY`/`ANS_PUBKEY`).
#[derive(Clone, Eq, PartialEq)]
pub struct PublicKey(Vec<u8>);

/// A detached signature over an arbitrary byte transcript.
#[derive(Clone)]
pub struct Signature(Vec<u8>);

impl KeyPair {
    /// Generates a brand new keypair.
    pub fn generate() -> Result<Self> {
        let rng = SystemRandom::new();
        let pkcs8_bytes = Ed25519KeyPair::generate_pkcs8(&rng)
            .simple_msg(ErrorKind::NoMem, "failed to generate keypair")?;
        let inner = Ed25519KeyPair::from_pkcs8(pkcs8_bytes.as_ref())
            .simple(ErrorKind::Inval)?;
        Ok(KeyPair { inner, pkcs8_bytes: Zeroizing::new(pkcs8_bytes.as_ref().to_vec()) })
    }

    /// Loads `ecdsa_key.priv` from `confbase`, generating and persisting
    /// a fresh one if it doesn't exist yet.
    pub fn load_or_generate(path: &Path) -> Result<Self> {
        if path.exists() {
            let bytes = fs::read(path).wrapped(ErrorKind::NoEnt)?;
            let inner = Ed25519KeyPair::from_pkcs8(&bytes).simple(ErrorKind::Auth)?;
            Ok(KeyPair { inner, pkcs8_bytes: Zeroizing::new(bytes) })
        } else {
            let kp = Self::generate()?;
            kp.save(path)?;
            Ok(kp)
        }
    }

    /// Writes the private key to disk with mode 0600.
    pub fn save(&self, path: &Path) -> Result<()> {
        let tmp = path.with_extension("tmp");
        fs::write(&tmp, self.pkcs8_bytes.as_slice()).wrapped(ErrorKind::NoMem)?;
        #[cfg(unix)]
        {
            let perms = fs::Permissions::from_mode(0o600);
            fs::set_permissions(&tmp, perms).wrapped(ErrorKind::NoMem)?;
        }
        fs::rename(&tmp, path).wrapped(ErrorKind::NoMem)?;
        Ok(())
    }

    pub fn public_key(&self) -> PublicKey {
        PublicKey(self.inner.public_key().as_ref().to_vec())
    }

    pub fn sign(&self, message: &[u8]) -> Signature {
        Signature(self.inner.sign(message).as_ref().to_vec())
    }

    /// Reconstructs an independent copy of this identity from its stored
    /// pkcs8 bytes. `Ed25519KeyPair` isn't `Clone`, and every per-connection
    /// `Session` needs its own owned copy of the long-term key.
    pub fn try_clone(&self) -> Result<Self> {
        let inner = Ed25519KeyPair::from_pkcs8(self.pkcs8_bytes.as_ref()).simple(ErrorKind::Inval)?;
        Ok(KeyPair { inner, pkcs8_bytes: self.pkcs8_bytes.clone() })
    }
}

impl PublicKey {
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != 32 {
            return Err("ed25519 public keys are 32 bytes").wrapped(ErrorKind::Inval);
        }
        Ok(PublicKey(bytes.to_vec()))
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Verifies `signature` over `message` under this public key.
    pub fn verify(&self, message: &[u8], signature: &Signature) -> Result<()> {
        let key = signature::UnparsedPublicKey::new(&signature::ED25519, &self.0);
        key.verify(message, &signature.0)
            .simple(ErrorKind::Auth)
    }
}

impl Signature {
    pub fn from_bytes(bytes: &[u8]) -> Self {
        Signature(bytes.to_vec())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl std::fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "PublicKey({})", crate::crypto::hash::fingerprint(&self.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sign_and_verify_roundtrip() {
        let kp = KeyPair::generate().unwrap();
        let sig = kp.sign(b"hello");
        kp.public_key().verify(b"hello", &sig).unwrap();
    }

    #[test]
    fn verify_rejects_tampered_message() {
        let kp = KeyPair::generate().unwrap();
        let sig = kp.sign(b"hello");
        assert!(kp.public_key().verify(b"goodbye", &sig).is_err());
    }

    #[test]
    fn load_or_generate_persists_identity() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ecdsa_key.priv");
        let kp1 = KeyPair::load_or_generate(&path).unwrap();
        let kp2 = KeyPair::load_or_generate(&path).unwrap();
        assert_eq!(kp1.public_key().as_bytes(), kp2.public_key().as_bytes());
    }
}
