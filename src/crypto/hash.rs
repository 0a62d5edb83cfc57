//! Hashing primitives used outside of SPTPS record framing:
//! transcript digests for the handshake, and fingerprints for
//! invitation issuer keys.

use ring::digest;

use crate::error::*;

/// A SHA-256 digest, used for SPTPS transcript hashing.
#[derive(Copy, Clone, Eq, PartialEq)]
pub struct Digest([u8; Digest::LENGTH]);

impl Digest {
    pub const LENGTH: usize = 32;

    pub fn of(data: &[u8]) -> Self {
        let d = digest::digest(&digest::SHA256, data);
        let mut inner = [0u8; Self::LENGTH];
        inner.copy_from_slice(d.as_ref());
        Self(inner)
    }

    pub fn from_bytes(raw: &[u8]) -> Result<Self> {
        if raw.len() != Self::LENGTH {
            return Err("digest has an invalid length").wrapped(ErrorKind::Inval);
        }
        let mut inner = [0u8; Self::LENGTH];
        inner.copy_from_slice(raw);
        Ok(Self(inner))
    }
}

impl AsRef<[u8]> for Digest {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl std::fmt::Debug for Digest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Digest({})", hex::encode(self.0))
    }
}

/// A short, human-displayable fingerprint of a public key, used when an
/// invitation record needs to commit to the issuer's
/// identity without embedding the full key.
#[cfg(feature = "crypto_hash_blake3_blake3")]
pub fn fingerprint(public_key_bytes: &[u8]) -> String {
    let hash = blake3::hash(public_key_bytes);
    hex::encode(&hash.as_bytes()[..16])
}

#[cfg(not(feature = "crypto_hash_blake3_blake3"))]
pub fn fingerprint(public_key_bytes: &[u8]) -> String {
    hex::encode(&Digest::of(public_key_bytes).as_ref()[..16])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn digest_roundtrip() {
        let d = Digest::of(b"hello mesh");
        let d2 = Digest::from_bytes(d.as_ref()).unwrap();
        assert_eq!(d.as_ref(), d2.as_ref());
    }

    #[test]
    fn fingerprint_is_stable() {
        let a = fingerprint(b"some-public-key-bytes");
        let b = fingerprint(b"some-public-key-bytes");
        assert_eq!(a, b);
        assert_eq!(a.len(), 32);
    }
}
