//! Wire envelope: the unit exchanged over the bus and held in state.
//!
//! Wire shape (JSON):
//! ```text
//! { "id": string, "type": string, "message": any,
//!   "timestamp": number, "source": string, "expirationDate"?: number }
//! ```
//! A frame is either one envelope object or an array of them (batch).
//!
//! Envelopes are immutable after construction. Ids combine a random
//! component, the producing endpoint's identity and the creation
//! timestamp, so two envelopes built in the same millisecond never share
//! an id.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::time::{SystemTime, UNIX_EPOCH};
use uuid::Uuid;

use crate::config::SendOptions;

/// Current wall-clock time in milliseconds since the Unix epoch.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// One message on the wire and in endpoint state.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Envelope {
    /// Opaque unique id: random component + origin digest + timestamp.
    pub id: String,
    /// User-chosen category, or an internally namespaced control tag.
    #[serde(rename = "type")]
    pub kind: String,
    /// Caller payload, opaque to the core.
    #[serde(default)]
    pub message: Value,
    /// Creation time, wall-clock milliseconds.
    pub timestamp: u64,
    /// Producing endpoint's self-declared identity.
    pub source: String,
    /// Absolute expiry in wall-clock milliseconds; absent = never expires.
    #[serde(rename = "expirationDate", skip_serializing_if = "Option::is_none")]
    pub expiration: Option<u64>,
}

impl Envelope {
    /// Build a new envelope for transmission.
    ///
    /// Expiry resolution: an absolute expiry wins over a ttl; with
    /// neither, the envelope never expires.
    pub fn build(kind: impl Into<String>, message: Value, source: &str, opts: &SendOptions) -> Self {
        let now = now_millis();
        let expiration = match (opts.expires_at, opts.ttl) {
            (Some(at), _) => Some(at),
            (None, Some(ttl)) => Some(now + ttl.as_millis() as u64),
            (None, None) => None,
        };
        Self {
            id: generate_id(source, now),
            kind: kind.into(),
            message,
            timestamp: now,
            source: source.to_string(),
            expiration,
        }
    }

    /// Structural validation of a raw candidate from the bus.
    ///
    /// `id`, `type` and `source` must be strings and `timestamp` a
    /// number, each checked independently — presence of an `id` alone is
    /// not enough, since unrelated traffic on a shared bus can carry the
    /// right keys with the wrong value types. Returns `None` for anything
    /// malformed; the pipeline drops those silently.
    pub fn from_value(candidate: &Value) -> Option<Self> {
        let obj = candidate.as_object()?;
        let id = obj.get("id")?.as_str()?;
        let kind = obj.get("type")?.as_str()?;
        let source = obj.get("source")?.as_str()?;
        let timestamp = as_millis(obj.get("timestamp")?)?;
        let expiration = match obj.get("expirationDate") {
            None | Some(Value::Null) => None,
            Some(v) => Some(as_millis(v)?),
        };
        let message = obj.get("message").cloned().unwrap_or(Value::Null);
        Some(Self {
            id: id.to_string(),
            kind: kind.to_string(),
            message,
            timestamp,
            source: source.to_string(),
            expiration,
        })
    }

    /// Whether this envelope has expired as of `now` (milliseconds).
    pub fn is_expired(&self, now: u64) -> bool {
        matches!(self.expiration, Some(at) if at < now)
    }
}

/// Interpret a JSON value as non-negative milliseconds.
///
/// Other producers may write timestamps as floats; accept any finite
/// non-negative number.
fn as_millis(value: &Value) -> Option<u64> {
    if let Some(n) = value.as_u64() {
        return Some(n);
    }
    value
        .as_f64()
        .filter(|f| f.is_finite() && *f >= 0.0)
        .map(|f| f as u64)
}

/// Collision-resistant envelope id.
///
/// Random uuid + truncated digest of the origin + creation millis, so
/// ids stay unique per (origin, creation) even within one millisecond.
fn generate_id(source: &str, now: u64) -> String {
    let digest = Sha256::digest(source.as_bytes());
    let origin_part: String = digest[..4].iter().map(|b| format!("{b:02x}")).collect();
    format!("{}-{}-{:x}", Uuid::new_v4().simple(), origin_part, now)
}
