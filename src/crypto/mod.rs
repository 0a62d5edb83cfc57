//! Cryptographic primitives: long-term identity keys, digests, and the
//! SPTPS transport session.

pub mod hash;
pub mod keys;
pub mod sptps;

pub use hash::Digest;
pub use keys::{KeyPair, PublicKey, Signature};
pub use sptps::{RecordType, Session};
