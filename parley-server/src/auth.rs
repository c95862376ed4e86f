//! Capability keys, user masking and replication link authentication.
//!
//! All three are 40-hex-character SHA-1 digests salted with the cluster's
//! shared magic number. Key derivation is deliberately simple: clients are
//! handed keys by a trusted front end (course web site, admin tool) and the
//! server only ever recomputes and compares.

use sha1::{Digest, Sha1};

use crate::now_ms;

/// Reserved principal used to sign replication auth lines. It can never
/// collide with a real user because user IDs are `[A-Za-z0-9_]+`.
const REMOTE_SERVER: &str = "remote server";

/// Reserved principal whose capability key grants trusted access, meaning
/// real user IDs are not masked in responses. Like [`REMOTE_SERVER`], the
/// leading `!` keeps it out of the user ID alphabet.
pub const SYSTEM_USER: &str = "!system";

/// Outcome of verifying a peer's auth line.
///
/// A bad signature is reported but does not close the link: the receiving
/// side logs and continues, which keeps a cluster limping along through a
/// misconfigured secret instead of silently partitioning it.
#[derive(Debug, PartialEq, Eq)]
pub enum PeerAuth {
    Accepted,
    /// Signature mismatch. Log and continue.
    BadSignature,
    /// Peer clock differs from ours by more than the tolerance. Reject:
    /// skewed clocks break message ordering across the cluster.
    SkewTooLarge(i64),
    /// Line does not look like an auth line at all. Reject.
    Malformed,
}

/// Key derivation context, shared by every subsystem that hashes.
pub struct Keys {
    magic: String,
}

impl Keys {
    pub fn new(magic: &str) -> Self {
        Self {
            magic: magic.to_string(),
        }
    }

    fn sha1_hex(input: &str) -> String {
        let mut hasher = Sha1::new();
        hasher.update(input.as_bytes());
        hex::encode(hasher.finalize())
    }

    /// Capability key for a user/channel tuple. The key is scoped to the
    /// exact identity it was minted for, including `key_time`, so the front
    /// end can expire keys by age alone.
    pub fn key(
        &self,
        channel: &str,
        user: &str,
        display_name: &str,
        extra: &str,
        key_time: i64,
    ) -> String {
        let input = format!(
            "{channel}\n{user}\n{display_name}\n{extra}\n{key_time}\n{}",
            self.magic
        );
        Self::sha1_hex(&input)
    }

    /// One-way masked form of a user ID, shown to untrusted recipients.
    pub fn masked_user(&self, user: &str) -> String {
        Self::sha1_hex(&format!("{user}\n{}", self.magic))
    }

    fn peer_signature(&self, timestamp: i64) -> String {
        Self::sha1_hex(&format!("{REMOTE_SERVER}\n{timestamp}\n{}", self.magic))
    }

    /// First line sent on a fresh outbound replication connection.
    pub fn peer_auth_line(&self) -> String {
        let now = now_ms();
        format!("*{now}*{}", self.peer_signature(now))
    }

    /// Verify the auth line received from a connecting peer.
    pub fn verify_peer_auth(&self, line: &str, skew_ms: i64) -> PeerAuth {
        let rest = match line.strip_prefix('*') {
            Some(rest) => rest,
            None => return PeerAuth::Malformed,
        };
        let (timestamp, signature) = match rest.split_once('*') {
            Some(parts) => parts,
            None => return PeerAuth::Malformed,
        };
        let timestamp: i64 = match timestamp.parse() {
            Ok(t) => t,
            Err(_) => return PeerAuth::Malformed,
        };
        if signature.len() != 40 || !signature.bytes().all(|b| b.is_ascii_hexdigit()) {
            return PeerAuth::Malformed;
        }

        let skew = timestamp - now_ms();
        if skew.abs() > skew_ms {
            return PeerAuth::SkewTooLarge(skew);
        }
        if self.peer_signature(timestamp) != signature {
            return PeerAuth::BadSignature;
        }
        PeerAuth::Accepted
    }
}
