//! SPTPS — Simple Peer-to-Peer Security.
//!
//! A three-message handshake (`KEX`, `SIG`, `ACK`) establishes a pair of
//! per-direction ChaCha20-Poly1305 keys over an X25519 ephemeral
//! exchange authenticated by the peers' long-term Ed25519 keys; the
//! resulting session then frames application data as
//! `seq(4) || len(2) || type(1) || ciphertext(len) || tag(16)` records,
//! the same record used on both meta-connections and UDP datagrams.

use std::time::{Duration, Instant};

use ring::agreement::{self, EphemeralPrivateKey, UnparsedPublicKey, X25519};
use ring::aead::{Aad, LessSafeKey, Nonce, UnboundKey, CHACHA20_POLY1305};
use ring::hkdf;
use ring::rand::SystemRandom;

use crate::crypto::hash::Digest;
use crate::crypto::keys::{KeyPair, PublicKey, Signature};
use crate::error::*;

/// Width, in packets, of the replay-protection bitmap.
pub const REPLAYWIN: u32 = 32;

/// Records after which a rekey is initiated.
pub const REKEY_RECORDS: u64 = 1 << 20;

/// Wall-clock interval after which a rekey is initiated, even if the
/// record counter hasn't reached `REKEY_RECORDS`.
pub const REKEY_INTERVAL: Duration = Duration::from_secs(3600);

const NONCE_LEN: usize = 12;
const EPHEMERAL_PUB_LEN: usize = 32;
const HS_NONCE_LEN: usize = 16;

/// Record type tag, the `type` field of the record header.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
#[repr(u8)]
pub enum RecordType {
    Application = 0,
    Handshake = 1,
    Alert = 2,
}

impl RecordType {
    fn from_u8(b: u8) -> Result<Self> {
        match b {
            0 => Ok(RecordType::Application),
            1 => Ok(RecordType::Handshake),
            2 => Ok(RecordType::Alert),
            _ => Err("unknown SPTPS record type").wrapped(ErrorKind::Protocol),
        }
    }
}

/// Progress of the handshake state machine.
#[derive(Debug)]
enum HandshakeState {
    /// Waiting to send or receive the first `KEX` message.
    Start,
    /// Sent our `KEX`, waiting for the peer's.
    SentKex { ephemeral_priv: EphemeralPrivateKey, ephemeral_pub: [u8; EPHEMERAL_PUB_LEN], nonce: [u8; HS_NONCE_LEN] },
    /// Exchanged `KEX`, waiting for the peer's `SIG`.
    SentSig,
    /// Exchanged `SIG`, waiting for `ACK`.
    SentAck,
    /// Handshake complete; session is transmitting application records.
    Established,
    /// An AEAD failure or protocol violation occurred.
    Failed,
}

/// One direction's traffic key and sequence state.
struct Direction {
    key: Option<LessSafeKey>,
    seq: u64,
}

impl Direction {
    fn empty() -> Self {
        Direction { key: None, seq: 0 }
    }
}

/// A replay-protection bitmap of width `REPLAYWIN`.
struct ReplayWindow {
    highest: u64,
    seen: u64, // bitmap: bit i => highest - i has been seen
    initialized: bool,
}

impl ReplayWindow {
    fn new() -> Self {
        ReplayWindow { highest: 0, seen: 0, initialized: false }
    }

    /// Returns `true` and marks `seq` seen if it's a fresh, in-window
    /// sequence number; `false` if it must be dropped as a replay or
    /// as too old.
    fn accept(&mut self, seq: u64) -> bool {
        if !self.initialized {
            self.initialized = true;
            self.highest = seq;
            self.seen = 1;
            return true;
        }
        if seq > self.highest {
            let shift = seq - self.highest;
            self.seen = if shift >= 64 { 0 } else { self.seen << shift };
            self.seen |= 1;
            self.highest = seq;
            return true;
        }
        let back = self.highest - seq;
        if back >= REPLAYWIN as u64 {
            return false;
        }
        let mask = 1u64 << back;
        if self.seen & mask != 0 {
            return false;
        }
        self.seen |= mask;
        true
    }
}

/// One end of an authenticated, encrypted SPTPS session.
pub struct Session {
    state: HandshakeState,
    my_key: KeyPair,
    peer_key: PublicKey,
    send: Direction,
    recv: Direction,
    replay: ReplayWindow,
    reassembly: Vec<u8>,
    transcript: Vec<u8>,
    my_kex: Option<Vec<u8>>,
    established_at: Option<Instant>,
    records_since_rekey: u64,
}

/// Output of feeding a handshake message into the session: zero, one,
/// or two messages to send back to the peer in order (a responder
/// answers a `KEX` with its own `KEX` followed by its `SIG`, which
/// can't be collapsed into a single wire message), plus whether the
/// session just became ready.
pub struct HandshakeProgress {
    pub to_send: Vec<(RecordType, Vec<u8>)>,
    pub established: bool,
}

impl Session {
    /// Creates a new session that has not started handshaking yet.
    pub fn new(my_key: KeyPair, peer_key: PublicKey) -> Self {
        Session {
            state: HandshakeState::Start,
            my_key,
            peer_key,
            send: Direction::empty(),
            recv: Direction::empty(),
            replay: ReplayWindow::new(),
            reassembly: Vec::new(),
            transcript: Vec::new(),
            my_kex: None,
            established_at: None,
            records_since_rekey: 0,
        }
    }

    pub fn is_established(&self) -> bool {
        matches!(self.state, HandshakeState::Established)
    }

    pub fn is_failed(&self) -> bool {
        matches!(self.state, HandshakeState::Failed)
    }

    /// Starts the handshake, returning our `KEX` message.
    pub fn start(&mut self) -> Result<(RecordType, Vec<u8>)> {
        if !matches!(self.state, HandshakeState::Start) {
            return Err("handshake already started").wrapped(ErrorKind::Inval);
        }
        let rng = SystemRandom::new();
        let ephemeral_priv = EphemeralPrivateKey::generate(&X25519, &rng)
            .simple(ErrorKind::NoMem)?;
        let ephemeral_pub_slice = ephemeral_priv.compute_public_key()
            .simple(ErrorKind::NoMem)?;
        let mut ephemeral_pub = [0u8; EPHEMERAL_PUB_LEN];
        ephemeral_pub.copy_from_slice(ephemeral_pub_slice.as_ref());

        let mut nonce = [0u8; HS_NONCE_LEN];
        use ring::rand::SecureRandom;
        rng.fill(&mut nonce).simple(ErrorKind::NoMem)?;

        let mut msg = Vec::with_capacity(EPHEMERAL_PUB_LEN + HS_NONCE_LEN + 64);
        msg.extend_from_slice(&ephemeral_pub);
        msg.extend_from_slice(&nonce);
        let sig = self.my_key.sign(&msg);
        msg.extend_from_slice(sig.as_bytes());

        self.my_kex = Some(msg.clone());
        self.state = HandshakeState::SentKex { ephemeral_priv, ephemeral_pub, nonce };
        Ok((RecordType::Handshake, msg))
    }

    /// Feeds one handshake-typed record into the state machine.
    pub fn handle_handshake(&mut self, payload: &[u8]) -> Result<HandshakeProgress> {
        match std::mem::replace(&mut self.state, HandshakeState::Failed) {
            HandshakeState::SentKex { ephemeral_priv, ephemeral_pub, nonce } => {
                self.on_peer_kex(payload, ephemeral_priv, ephemeral_pub, nonce)
            }
            HandshakeState::SentSig => self.on_peer_sig(payload),
            HandshakeState::SentAck => {
                // peer's ACK: nothing further to validate structurally.
                let _ = payload;
                self.state = HandshakeState::Established;
                self.established_at = Some(Instant::now());
                Ok(HandshakeProgress { to_send: Vec::new(), established: true })
            }
            HandshakeState::Start => {
                // we are the responder: this is the peer's KEX. Answer
                // with our own KEX first, then our SIG over the now-known
                // transcript; both go out, in order, before we see the
                // peer's own SIG.
                self.state = HandshakeState::Start;
                let (kind, our_kex) = self.start()?;
                let ephemeral_priv_state = std::mem::replace(&mut self.state, HandshakeState::Failed);
                if let HandshakeState::SentKex { ephemeral_priv, ephemeral_pub, nonce } = ephemeral_priv_state {
                    let progress = self.on_peer_kex(payload, ephemeral_priv, ephemeral_pub, nonce)?;
                    let mut to_send = vec![(kind, our_kex)];
                    to_send.extend(progress.to_send);
                    Ok(HandshakeProgress { to_send, established: progress.established })
                } else {
                    unreachable!("start() always leaves SentKex state")
                }
            }
            other @ (HandshakeState::Established | HandshakeState::Failed) => {
                self.state = other;
                Err("unexpected handshake message").wrapped(ErrorKind::Protocol)
            }
        }
    }

    fn on_peer_kex(
        &mut self,
        peer_kex: &[u8],
        ephemeral_priv: EphemeralPrivateKey,
        my_ephemeral_pub: [u8; EPHEMERAL_PUB_LEN],
        _nonce: [u8; HS_NONCE_LEN],
    ) -> Result<HandshakeProgress> {
        if peer_kex.len() != EPHEMERAL_PUB_LEN + HS_NONCE_LEN + 64 {
            return Err("malformed KEX message").wrapped(ErrorKind::Protocol);
        }
        let (signed_part, sig_bytes) = peer_kex.split_at(EPHEMERAL_PUB_LEN + HS_NONCE_LEN);
        let sig = Signature::from_bytes(sig_bytes);
        self.peer_key.verify(signed_part, &sig).map_err(|e| e.swap_kind(ErrorKind::Auth))?;

        let peer_ephemeral_pub = &signed_part[..EPHEMERAL_PUB_LEN];
        let peer_pub = UnparsedPublicKey::new(&X25519, peer_ephemeral_pub.to_vec());

        // canonical transcript order: lexicographically by raw bytes, so
        // both ends derive identical keys regardless of who dialed.
        let my_kex = self.my_kex.clone().expect("my_kex set by start()");
        self.transcript = if my_kex.as_slice() < peer_kex {
            [my_kex.as_slice(), peer_kex].concat()
        } else {
            [peer_kex, my_kex.as_slice()].concat()
        };
        let transcript_digest = Digest::of(&self.transcript);

        let shared = agreement::agree_ephemeral(
            ephemeral_priv,
            &peer_pub,
            Error::simple(ErrorKind::Protocol),
            |shared_secret| derive_directional_keys(shared_secret, transcript_digest.as_ref(), &my_ephemeral_pub, peer_ephemeral_pub),
        )?;
        let (key_a, key_b) = shared;

        // whichever ephemeral pub key sorts first owns "direction A".
        let we_are_a = my_ephemeral_pub.as_slice() < peer_ephemeral_pub;
        let (send_key, recv_key) = if we_are_a { (key_a, key_b) } else { (key_b, key_a) };
        self.send.key = Some(send_key);
        self.recv.key = Some(recv_key);

        let sig = self.my_key.sign(transcript_digest.as_ref());
        self.state = HandshakeState::SentSig;
        Ok(HandshakeProgress {
            to_send: vec![(RecordType::Handshake, sig.as_bytes().to_vec())],
            established: false,
        })
    }

    fn on_peer_sig(&mut self, payload: &[u8]) -> Result<HandshakeProgress> {
        let transcript_digest = Digest::of(&self.transcript);
        let sig = Signature::from_bytes(payload);
        self.peer_key
            .verify(transcript_digest.as_ref(), &sig)
            .map_err(|e| e.swap_kind(ErrorKind::Auth))?;
        self.state = HandshakeState::SentAck;
        Ok(HandshakeProgress {
            to_send: vec![(RecordType::Handshake, Vec::new())],
            established: false,
        })
    }

    /// Whether a rekey should be initiated.
    pub fn should_rekey(&self) -> bool {
        if !self.is_established() {
            return false;
        }
        if self.records_since_rekey >= REKEY_RECORDS {
            return true;
        }
        match self.established_at {
            Some(t) => t.elapsed() >= REKEY_INTERVAL,
            None => false,
        }
    }

    /// Rekeys the session atomically by restarting the handshake state
    /// machine while the old keys remain live until the new ones take over.
    pub fn rekey(&mut self) -> Result<(RecordType, Vec<u8>)> {
        self.state = HandshakeState::Start;
        self.my_kex = None;
        self.records_since_rekey = 0;
        self.established_at = None;
        self.start()
    }

    /// Seals `plaintext` as one application record.
    pub fn seal(&mut self, plaintext: &[u8]) -> Result<Vec<u8>> {
        self.seal_typed(RecordType::Application, plaintext)
    }

    fn seal_typed(&mut self, ty: RecordType, plaintext: &[u8]) -> Result<Vec<u8>> {
        let key = self.send.key.as_ref().ok_or(Error::simple(ErrorKind::Protocol))?;
        let seq = self.send.seq;
        self.send.seq += 1;
        self.records_since_rekey += 1;

        let mut in_out = plaintext.to_vec();
        let nonce = seq_to_nonce(seq);
        key.seal_in_place_append_tag(Nonce::assume_unique_for_key(nonce), Aad::empty(), &mut in_out)
            .simple(ErrorKind::Protocol)?;

        let mut record = Vec::with_capacity(4 + 2 + 1 + in_out.len());
        record.extend_from_slice(&(seq as u32).to_be_bytes());
        record.extend_from_slice(&(plaintext.len() as u16).to_be_bytes());
        record.push(ty as u8);
        record.extend_from_slice(&in_out);
        Ok(record)
    }

    /// Parses and authenticates one record, returning its type and the
    /// decrypted payload, or `None` if it was a duplicate/replay to be
    /// silently dropped.
    pub fn open(&mut self, record: &[u8]) -> Result<Option<(RecordType, Vec<u8>)>> {
        if record.len() < 4 + 2 + 1 + 16 {
            return Err("record too short").wrapped(ErrorKind::Protocol);
        }
        let seq = u32::from_be_bytes(record[0..4].try_into().unwrap()) as u64;
        let len = u16::from_be_bytes(record[4..6].try_into().unwrap()) as usize;
        let ty = RecordType::from_u8(record[6])?;
        let ciphertext = &record[7..];
        if ciphertext.len() != len + 16 {
            return Err("record length mismatch").wrapped(ErrorKind::Protocol);
        }

        if !self.replay.accept(seq) {
            tracing::warn!(seq, "SPTPS replay window rejected duplicate sequence number");
            return Ok(None);
        }

        let mut buf = ciphertext.to_vec();
        let nonce = seq_to_nonce(seq);
        let open_result = {
            let key = self.recv.key.as_ref().ok_or(Error::simple(ErrorKind::Protocol))?;
            key.open_in_place(Nonce::assume_unique_for_key(nonce), Aad::empty(), &mut buf)
                .map(|pt| pt.to_vec())
        };
        match open_result {
            Ok(plaintext) => Ok(Some((ty, plaintext))),
            Err(_) => {
                self.state = HandshakeState::Failed;
                Err(Error::simple(ErrorKind::Protocol))
            }
        }
    }

    /// Appends decrypted application bytes to the session's reassembly
    /// buffer and drains it; used by the meta-connection line reader
    /// and by channel streams, both of which may span multiple records.
    pub fn push_reassembly(&mut self, bytes: &[u8]) {
        self.reassembly.extend_from_slice(bytes);
    }

    pub fn drain_reassembly(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.reassembly)
    }
}

fn seq_to_nonce(seq: u64) -> [u8; NONCE_LEN] {
    let mut nonce = [0u8; NONCE_LEN];
    nonce[4..].copy_from_slice(&seq.to_be_bytes());
    nonce
}

fn derive_directional_keys(
    shared_secret: &[u8],
    salt: &[u8],
    pub_a: &[u8],
    pub_b: &[u8],
) -> Result<(LessSafeKey, LessSafeKey)> {
    let salt = hkdf::Salt::new(hkdf::HKDF_SHA256, salt);
    let prk = salt.extract(shared_secret);

    let mut info_a = Vec::with_capacity(pub_a.len() + pub_b.len() + 1);
    info_a.extend_from_slice(b"A");
    info_a.extend_from_slice(pub_a);
    info_a.extend_from_slice(pub_b);

    let mut info_b = Vec::with_capacity(pub_a.len() + pub_b.len() + 1);
    info_b.extend_from_slice(b"B");
    info_b.extend_from_slice(pub_a);
    info_b.extend_from_slice(pub_b);

    let key_a = expand_key(&prk, &info_a)?;
    let key_b = expand_key(&prk, &info_b)?;
    Ok((key_a, key_b))
}

/// `hkdf::KeyType` impls must live in this crate (orphan rules), so a
/// one-field marker stands in for `&'static aead::Algorithm` here.
struct Chacha20Poly1305KeyMaterial;

impl hkdf::KeyType for Chacha20Poly1305KeyMaterial {
    fn len(&self) -> usize {
        32
    }
}

fn expand_key(prk: &hkdf::Prk, info: &[u8]) -> Result<LessSafeKey> {
    let info_slice = [info];
    let okm = prk
        .expand(&info_slice, Chacha20Poly1305KeyMaterial)
        .simple(ErrorKind::NoMem)?;
    let mut key_bytes = [0u8; 32];
    okm.fill(&mut key_bytes).simple(ErrorKind::NoMem)?;
    let unbound = UnboundKey::new(&CHACHA20_POLY1305, &key_bytes).simple(ErrorKind::NoMem)?;
    Ok(LessSafeKey::new(unbound))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pair() -> (Session, Session) {
        let kp_a = KeyPair::generate().unwrap();
        let kp_b = KeyPair::generate().unwrap();
        let pk_a = kp_a.public_key();
        let pk_b = kp_b.public_key();
        (Session::new(kp_a, pk_b), Session::new(kp_b, pk_a))
    }

    /// Drives a full handshake to completion. The responder (`b`) never
    /// calls `start()` itself: its first `handle_handshake` answers the
    /// initiator's `KEX` with its own `KEX` followed by its `SIG`.
    fn handshake(a: &mut Session, b: &mut Session) {
        let (_, kex_a) = a.start().unwrap();

        let progress_b = b.handle_handshake(&kex_a).unwrap();
        assert_eq!(progress_b.to_send.len(), 2);
        let kex_b = progress_b.to_send[0].1.clone();
        let sig_b = progress_b.to_send[1].1.clone();

        let progress_a = a.handle_handshake(&kex_b).unwrap();
        let (_, sig_a) = progress_a.to_send.into_iter().next().unwrap();

        let progress_a2 = a.handle_handshake(&sig_b).unwrap();
        let (_, ack_a) = progress_a2.to_send.into_iter().next().unwrap();

        let progress_b2 = b.handle_handshake(&sig_a).unwrap();
        let (_, ack_b) = progress_b2.to_send.into_iter().next().unwrap();

        let progress_a3 = a.handle_handshake(&ack_b).unwrap();
        assert!(progress_a3.established);

        let progress_b3 = b.handle_handshake(&ack_a).unwrap();
        assert!(progress_b3.established);
    }

    #[test]
    fn handshake_establishes_symmetric_session() {
        let (mut a, mut b) = pair();
        handshake(&mut a, &mut b);
        assert!(a.is_established());
        assert!(b.is_established());
    }

    #[test]
    fn seal_open_roundtrip() {
        let (mut a, mut b) = pair();
        handshake(&mut a, &mut b);

        let record = a.seal(b"hello over sptps").unwrap();
        let (ty, plaintext) = b.open(&record).unwrap().unwrap();
        assert_eq!(ty, RecordType::Application);
        assert_eq!(plaintext, b"hello over sptps");
    }

    #[test]
    fn replay_window_drops_duplicate_sequence() {
        let (mut a, mut b) = pair();
        handshake(&mut a, &mut b);

        let record = a.seal(b"once").unwrap();
        assert!(b.open(&record).unwrap().is_some());
        assert!(b.open(&record).unwrap().is_none());
    }

    #[test]
    fn tampered_ciphertext_fails_and_marks_session_failed() {
        let (mut a, mut b) = pair();
        handshake(&mut a, &mut b);

        let mut record = a.seal(b"tamper me").unwrap();
        let last = record.len() - 1;
        record[last] ^= 0xff;
        assert!(b.open(&record).is_err());
        assert!(b.is_failed());
    }

    use proptest::prelude::*;

    proptest! {
        /// Feeding every sequence number in `seqs`, possibly with
        /// repeats, accepts each distinct value exactly once no matter
        /// the order, as long as every value stays within one window of
        /// the largest one present.
        #[test]
        fn replay_window_accepts_each_seq_once_in_any_order(seqs in proptest::collection::vec(0u64..REPLAYWIN as u64, 1..64)) {
            let mut window = ReplayWindow::new();
            window.initialized = true;
            window.highest = REPLAYWIN as u64;
            window.seen = 0;

            let mut accepted = std::collections::HashSet::new();
            for offset in seqs {
                let seq = REPLAYWIN as u64 - offset;
                let first_time = accepted.insert(seq);
                prop_assert_eq!(window.accept(seq), first_time);
            }
        }
    }
}
