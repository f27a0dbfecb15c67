//! Namespaced control tags for the internal protocol.
//!
//! Multiple logical channels may share one underlying bus, so control
//! messages carry a tag derived from the (base name, channel, namespace)
//! tuple rather than relying on the bus to isolate channels. The tag is
//! a reserved prefix, the base name, and a truncated digest, so a user
//! picking an arbitrary type string cannot collide with it by accident
//! and two channels never trigger each other's control handling.

use sha2::{Digest, Sha256};

/// Reserved prefix; visually distinguishes control tags from user types.
pub const INTERNAL_PREFIX: &str = "@xtalk/";

/// Shared constant mixed into every tag digest.
const TAG_SALT: &str = "crosstalk-control-v1";

/// Control base names.
pub const PRESENCE_REQUEST: &str = "presence-request";
pub const PRESENCE_REPLY: &str = "presence-reply";
pub const REMOTE_CLEAR: &str = "remote-clear";

/// Which control operation an internal tag names.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlKind {
    PresenceRequest,
    PresenceReply,
    RemoteClear,
}

/// Deterministic control tag for one (base, channel, namespace) tuple.
///
/// Fields are length-delimited before hashing so boundary shifts such as
/// `("x-", "")` vs `("x", "-")` produce different digests.
pub fn internal_tag(base: &str, channel: &str, namespace: &str) -> String {
    let mut hasher = Sha256::new();
    for part in [TAG_SALT, base, channel, namespace] {
        hasher.update((part.len() as u64).to_le_bytes());
        hasher.update(part.as_bytes());
    }
    let digest = hasher.finalize();
    let hash: String = digest[..8].iter().map(|b| format!("{b:02x}")).collect();
    format!("{INTERNAL_PREFIX}{base}:{hash}")
}

/// Cheap prefix check for control tags, ours or any other channel's.
pub fn is_internal_tag(kind: &str) -> bool {
    kind.starts_with(INTERNAL_PREFIX)
}

/// The three control tags of one endpoint's channel+namespace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlTags {
    pub presence_request: String,
    pub presence_reply: String,
    pub remote_clear: String,
}

impl ControlTags {
    pub fn for_channel(channel: &str, namespace: &str) -> Self {
        Self {
            presence_request: internal_tag(PRESENCE_REQUEST, channel, namespace),
            presence_reply: internal_tag(PRESENCE_REPLY, channel, namespace),
            remote_clear: internal_tag(REMOTE_CLEAR, channel, namespace),
        }
    }

    /// Match a type string against this channel's control tags.
    ///
    /// `None` for user types and for control tags of other channels or
    /// namespaces (stale incarnations included).
    pub fn classify(&self, kind: &str) -> Option<ControlKind> {
        if kind == self.presence_request {
            Some(ControlKind::PresenceRequest)
        } else if kind == self.presence_reply {
            Some(ControlKind::PresenceReply)
        } else if kind == self.remote_clear {
            Some(ControlKind::RemoteClear)
        } else {
            None
        }
    }
}
