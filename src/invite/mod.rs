//! Invitation-based onboarding.

use crate::config::host::HostRecord;
use crate::config::invitation::{generate_cookie, invitation_url, Invitation, DEFAULT_TTL};
use crate::config::kv::KvFile;
use crate::config::ConfigStore;
use crate::crypto::hash::Digest;
use crate::crypto::{KeyPair, PublicKey, Signature};
use crate::error::*;
use crate::graph::{Graph, NodeName};

/// The signed bundle a joiner receives in response to presenting a
/// cookie: `(inviter_name, inviter_pubkey, assigned_name,
/// peer_list)`, authenticated against the cookie commitment.
pub struct InviteBundle {
    pub inviter_name: NodeName,
    pub inviter_pubkey: PublicKey,
    pub assigned_name: NodeName,
    pub peer_list: Vec<(NodeName, HostRecord)>,
    signature: Signature,
}

/// The value the inviter's signature commits to: binds the cookie to
/// the assigned name and the inviter's own key, so a bundle for one
/// invitation cannot be replayed against another.
fn commitment(cookie: &str, assigned_name: &NodeName, inviter_pubkey: &PublicKey) -> Digest {
    let mut buf = Vec::new();
    buf.extend_from_slice(cookie.as_bytes());
    buf.extend_from_slice(assigned_name.as_str().as_bytes());
    buf.extend_from_slice(inviter_pubkey.as_bytes());
    Digest::of(&buf)
}

/// `invite(name)`: generates a cookie, persists the
/// invitation record, and returns `(cookie, url)`.
pub fn invite(
    store: &ConfigStore,
    issuer_key: &KeyPair,
    host: &str,
    port: u16,
    invitee_name: &str,
) -> Result<String> {
    NodeName::new(invitee_name)?;
    let cookie = generate_cookie();
    let fingerprint = crate::crypto::hash::fingerprint(issuer_key.public_key().as_bytes());
    let invitation = Invitation::new(invitee_name, fingerprint, DEFAULT_TTL)?;
    store.save_invitation(&cookie, &invitation)?;
    Ok(invitation_url(host, port, &cookie))
}

/// Builds the signed bundle the inviter's side sends back once a
/// joiner presents a valid, unexpired cookie.
pub fn build_bundle(
    inviter_name: NodeName,
    inviter_key: &KeyPair,
    cookie: &str,
    assigned_name: NodeName,
    peer_list: Vec<(NodeName, HostRecord)>,
) -> InviteBundle {
    let inviter_pubkey = inviter_key.public_key();
    let digest = commitment(cookie, &assigned_name, &inviter_pubkey);
    let signature = inviter_key.sign(digest.as_ref());
    InviteBundle { inviter_name, inviter_pubkey, assigned_name, peer_list, signature }
}

/// Verifies a bundle's signature against the cookie commitment.
pub fn verify_bundle(bundle: &InviteBundle, cookie: &str) -> Result<()> {
    let digest = commitment(cookie, &bundle.assigned_name, &bundle.inviter_pubkey);
    bundle
        .inviter_pubkey
        .verify(digest.as_ref(), &bundle.signature)
        .map_err(|e| e.swap_kind(ErrorKind::Auth))
}

impl InviteBundle {
    /// Serializes the bundle for transmission over the cleartext
    /// join exchange: the same `Key = Value` grammar as the on-disk
    /// config files, with each peer's host record embedded as a
    /// base64 blob so nested records don't collide with the outer
    /// line structure.
    pub fn serialize(&self) -> String {
        let mut kv = KvFile::new();
        kv.set("InviterName", self.inviter_name.as_str().to_string());
        kv.set("InviterPubkey", base64::encode(self.inviter_pubkey.as_bytes()));
        kv.set("AssignedName", self.assigned_name.as_str().to_string());
        kv.set("Signature", base64::encode(self.signature.as_bytes()));
        for (name, record) in &self.peer_list {
            kv.push("Peer", base64::encode(record.export(name.as_str())));
        }
        kv.render()
    }

    pub fn deserialize(text: &str) -> Result<Self> {
        let kv = KvFile::parse(text)?;
        let inviter_name = NodeName::new(kv.get("InviterName").ok_or_else(|| Error::simple(ErrorKind::Inval))?)?;
        let inviter_pubkey_bytes = base64::decode(kv.get("InviterPubkey").ok_or_else(|| Error::simple(ErrorKind::Inval))?).wrapped(ErrorKind::Inval)?;
        let inviter_pubkey = PublicKey::from_bytes(&inviter_pubkey_bytes)?;
        let assigned_name = NodeName::new(kv.get("AssignedName").ok_or_else(|| Error::simple(ErrorKind::Inval))?)?;
        let signature_bytes = base64::decode(kv.get("Signature").ok_or_else(|| Error::simple(ErrorKind::Inval))?).wrapped(ErrorKind::Inval)?;
        let signature = Signature::from_bytes(&signature_bytes);

        let mut peer_list = Vec::new();
        for blob_b64 in kv.get_all("Peer") {
            let blob_bytes = base64::decode(blob_b64).wrapped(ErrorKind::Inval)?;
            let blob = String::from_utf8(blob_bytes).wrapped(ErrorKind::Inval)?;
            let (name, record) = HostRecord::import(&blob)?;
            peer_list.push((NodeName::new(name)?, record));
        }

        Ok(InviteBundle { inviter_name, inviter_pubkey, assigned_name, peer_list, signature })
    }
}

/// `join(url)` is valid only if the local node has no prior peers
///: "enforced by checking `nodes` contains only `self`".
pub fn ensure_can_join(graph: &Graph) -> Result<()> {
    let has_other_nodes = graph.nodes().any(|n| &n.name != graph.self_name());
    if has_other_nodes {
        return Err("join is only valid before any peers are known").wrapped(ErrorKind::Busy);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bundle_round_trips_signature() {
        let inviter_key = KeyPair::generate().unwrap();
        let cookie = generate_cookie();
        let bundle = build_bundle(
            NodeName::new("inviter").unwrap(),
            &inviter_key,
            &cookie,
            NodeName::new("invitee").unwrap(),
            Vec::new(),
        );
        verify_bundle(&bundle, &cookie).unwrap();
    }

    #[test]
    fn bundle_rejects_wrong_cookie() {
        let inviter_key = KeyPair::generate().unwrap();
        let cookie = generate_cookie();
        let bundle = build_bundle(
            NodeName::new("inviter").unwrap(),
            &inviter_key,
            &cookie,
            NodeName::new("invitee").unwrap(),
            Vec::new(),
        );
        assert!(verify_bundle(&bundle, &generate_cookie()).is_err());
    }

    #[test]
    fn bundle_serialize_deserialize_round_trip() {
        let inviter_key = KeyPair::generate().unwrap();
        let cookie = generate_cookie();
        let peer_key = KeyPair::generate().unwrap();
        let peer_record = HostRecord {
            addresses: vec!["203.0.113.9:655".parse().unwrap()],
            ecdsa_public_key: Some(peer_key.public_key()),
            ..HostRecord::default()
        };
        let bundle = build_bundle(
            NodeName::new("inviter").unwrap(),
            &inviter_key,
            &cookie,
            NodeName::new("invitee").unwrap(),
            vec![(NodeName::new("carol").unwrap(), peer_record)],
        );

        let text = bundle.serialize();
        let parsed = InviteBundle::deserialize(&text).unwrap();
        verify_bundle(&parsed, &cookie).unwrap();
        assert_eq!(parsed.inviter_name.as_str(), "inviter");
        assert_eq!(parsed.assigned_name.as_str(), "invitee");
        assert_eq!(parsed.peer_list.len(), 1);
        assert_eq!(parsed.peer_list[0].0.as_str(), "carol");
    }

    #[test]
    fn invite_persists_invitation_and_returns_url() {
        let dir = tempfile::tempdir().unwrap();
        let store = ConfigStore::open(dir.path()).unwrap();
        let key = KeyPair::generate().unwrap();
        let url = invite(&store, &key, "example.org", 655, "alice").unwrap();
        assert!(url.starts_with("meshlink://example.org:655/"));
    }

    #[test]
    fn join_is_refused_once_peers_are_known() {
        let mut graph = Graph::new(NodeName::new("self").unwrap());
        ensure_can_join(&graph).unwrap();
        graph.ensure_node(&NodeName::new("other").unwrap());
        assert!(ensure_can_join(&graph).is_err());
    }
}
