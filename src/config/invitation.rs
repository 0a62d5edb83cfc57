//! Single-use invitation records.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use rand::RngCore;

use crate::config::kv::KvFile;
use crate::error::*;

/// Cookies are 18 random bytes, base64url-encoded to exactly 24
/// characters.
pub const COOKIE_BYTES: usize = 18;
pub const COOKIE_LEN: usize = 24;

/// Default validity window for a freshly issued invitation.
pub const DEFAULT_TTL: Duration = Duration::from_secs(24 * 3600);

/// A server-held record of one outstanding invitation, stored as
/// `invitations/<cookie>`.
#[derive(Clone, Debug)]
pub struct Invitation {
    pub invitee_name: String,
    pub issuer_fingerprint: String,
    pub expires_at_unix: u64,
}

impl Invitation {
    pub fn new(invitee_name: impl Into<String>, issuer_fingerprint: impl Into<String>, ttl: Duration) -> Result<Self> {
        let expires_at = SystemTime::now()
            .checked_add(ttl)
            .ok_or(Error::simple(ErrorKind::Inval))?
            .duration_since(UNIX_EPOCH)
            .simple(ErrorKind::Inval)?
            .as_secs();
        Ok(Invitation {
            invitee_name: invitee_name.into(),
            issuer_fingerprint: issuer_fingerprint.into(),
            expires_at_unix: expires_at,
        })
    }

    pub fn is_expired_at(&self, now_unix: u64) -> bool {
        now_unix >= self.expires_at_unix
    }

    pub fn parse(text: &str) -> Result<Self> {
        let kv = KvFile::parse(text)?;
        let invitee_name = kv.get("InviteeName").ok_or(Error::simple(ErrorKind::Inval))?.to_owned();
        let issuer_fingerprint = kv.get("IssuerFingerprint").ok_or(Error::simple(ErrorKind::Inval))?.to_owned();
        let expires_at_unix = kv
            .get("ExpiresAt")
            .ok_or(Error::simple(ErrorKind::Inval))?
            .parse()
            .wrapped(ErrorKind::Inval)?;
        Ok(Invitation { invitee_name, issuer_fingerprint, expires_at_unix })
    }

    pub fn render(&self) -> String {
        let mut kv = KvFile::new();
        kv.set("InviteeName", self.invitee_name.clone());
        kv.set("IssuerFingerprint", self.issuer_fingerprint.clone());
        kv.set("ExpiresAt", self.expires_at_unix.to_string());
        kv.render()
    }
}

/// Generates a fresh random cookie, used both as the invitation's file
/// name and as the path component of its URL.
pub fn generate_cookie() -> String {
    let mut bytes = [0u8; COOKIE_BYTES];
    rand::thread_rng().fill_bytes(&mut bytes);
    let cookie = base64::encode_config(bytes, base64::URL_SAFE_NO_PAD);
    debug_assert_eq!(cookie.len(), COOKIE_LEN);
    cookie
}

/// Builds the `meshlink://host:port/cookie` URL advertised by `invite()`.
pub fn invitation_url(host: &str, port: u16, cookie: &str) -> String {
    format!("meshlink://{}:{}/{}", host, port, cookie)
}

/// Parses an invitation URL back into its `(host, port, cookie)` parts.
pub fn parse_invitation_url(url: &str) -> Result<(String, u16, String)> {
    let rest = url.strip_prefix("meshlink://").ok_or(Error::simple(ErrorKind::Inval))?;
    let (authority, cookie) = rest.split_once('/').ok_or(Error::simple(ErrorKind::Inval))?;
    if cookie.len() != COOKIE_LEN {
        return Err("invitation cookie must be 24 characters").wrapped(ErrorKind::Inval);
    }
    let (host, port) = authority.rsplit_once(':').ok_or(Error::simple(ErrorKind::Inval))?;
    let port: u16 = port.parse().wrapped(ErrorKind::Inval)?;
    Ok((host.to_string(), port, cookie.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cookie_is_always_24_characters() {
        for _ in 0..16 {
            assert_eq!(generate_cookie().len(), COOKIE_LEN);
        }
    }

    #[test]
    fn url_round_trips() {
        let cookie = generate_cookie();
        let url = invitation_url("example.org", 655, &cookie);
        let (host, port, parsed_cookie) = parse_invitation_url(&url).unwrap();
        assert_eq!(host, "example.org");
        assert_eq!(port, 655);
        assert_eq!(parsed_cookie, cookie);
    }

    #[test]
    fn rejects_malformed_url() {
        assert!(parse_invitation_url("http://example.org/cookie").is_err());
        assert!(parse_invitation_url("meshlink://example.org:655/tooshort").is_err());
    }

    #[test]
    fn invitation_record_round_trips() {
        let inv = Invitation::new("alice", "abcd1234", DEFAULT_TTL).unwrap();
        let text = inv.render();
        let parsed = Invitation::parse(&text).unwrap();
        assert_eq!(parsed.invitee_name, "alice");
        assert_eq!(parsed.issuer_fingerprint, "abcd1234");
        assert!(!parsed.is_expired_at(0));
    }
}
