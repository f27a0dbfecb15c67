//! Receive-side guard chain.
//!
//! Every inbound candidate passes the guards in a fixed order; the first
//! failing guard stops processing with no state mutation:
//!
//! ```text
//! raw value ─► shape ─► self-origin ─► control routing ─► allow-list
//!                                          │ (terminates)
//!                                          ▼
//!                                  clear / ping / pong
//!                                          ─► expiry ─► dedup ─► accept
//! ```
//!
//! Control envelopes route before the allow-list and expiry guards, so
//! user-facing policy can never filter the internal protocol. A frame
//! may carry one envelope or an ordered batch; [`frame_items`] unwraps
//! batches into sequential passes through the same chain.

use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};

use serde_json::Value;

use crate::envelope::Envelope;
use crate::tag::{self, ControlKind, ControlTags};

/// Outcome of one candidate's trip through the guard chain.
#[derive(Debug, Clone, PartialEq)]
pub enum Verdict {
    /// Passed every guard; caller appends to state and runs callbacks.
    Accept(Envelope),
    /// One of our channel's control tags; terminate the chain and route.
    Control(ControlKind, Envelope),
    /// Stopped by a guard; nothing was mutated.
    Drop(DropReason),
}

/// Which guard stopped a candidate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    /// Failed structural validation; expected noise on a shared bus.
    Malformed,
    /// Our own envelope echoed back by the bus.
    SelfOrigin,
    /// Internal tag of another channel, namespace or incarnation.
    ForeignControl,
    /// Type not in the configured allow-list.
    NotAllowed,
    /// Already expired at arrival.
    Expired,
    /// Envelope id seen within the deduplication window.
    Duplicate,
}

/// Unwrap a frame into candidates, preserving batch order.
pub fn frame_items(frame: Value) -> Vec<Value> {
    match frame {
        Value::Array(items) => items,
        single => vec![single],
    }
}

/// The guard chain plus the deduplication window it maintains.
pub struct ReceivePipeline {
    identity: String,
    tags: ControlTags,
    dedup_window: Duration,
    /// Envelope id → local receipt time.
    seen: HashMap<String, Instant>,
}

impl ReceivePipeline {
    pub fn new(identity: String, tags: ControlTags, dedup_window: Duration) -> Self {
        Self {
            identity,
            tags,
            dedup_window,
            seen: HashMap::new(),
        }
    }

    /// Run one candidate through the guard chain.
    ///
    /// `now_ms` is the receiver-local clock for the expiry guard.
    /// On acceptance the id's receipt time is recorded; every other
    /// outcome leaves the window untouched.
    pub fn evaluate(&mut self, candidate: &Value, allowed: &HashSet<String>, now_ms: u64) -> Verdict {
        // Guard 1: shape.
        let envelope = match Envelope::from_value(candidate) {
            Some(env) => env,
            None => return Verdict::Drop(DropReason::Malformed),
        };

        // Guard 2: self-origin.
        if envelope.source == self.identity {
            return Verdict::Drop(DropReason::SelfOrigin);
        }

        // Guard 3: control routing, before any user-facing policy.
        if tag::is_internal_tag(&envelope.kind) {
            return match self.tags.classify(&envelope.kind) {
                Some(kind) => Verdict::Control(kind, envelope),
                None => Verdict::Drop(DropReason::ForeignControl),
            };
        }

        // Guard 4: allow-list (non-empty list only).
        if !allowed.is_empty() && !allowed.contains(&envelope.kind) {
            return Verdict::Drop(DropReason::NotAllowed);
        }

        // Guard 5: expiry at arrival.
        if envelope.is_expired(now_ms) {
            return Verdict::Drop(DropReason::Expired);
        }

        // Guard 6: deduplication.
        let now = Instant::now();
        if let Some(receipt) = self.seen.get(&envelope.id) {
            if now.duration_since(*receipt) <= self.dedup_window {
                return Verdict::Drop(DropReason::Duplicate);
            }
        }
        self.seen.insert(envelope.id.clone(), now);

        Verdict::Accept(envelope)
    }

    /// Purge dedup records older than the window; returns how many.
    ///
    /// Independent of message expiry — this only bounds the window's
    /// memory, it never touches accepted messages.
    pub fn purge_seen(&mut self) -> usize {
        let window = self.dedup_window;
        let before = self.seen.len();
        let now = Instant::now();
        self.seen
            .retain(|_, receipt| now.duration_since(*receipt) <= window);
        before - self.seen.len()
    }

    pub fn seen_count(&self) -> usize {
        self.seen.len()
    }
}
