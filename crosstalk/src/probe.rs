//! Presence probing (ping/pong).
//!
//! A probe broadcasts one presence-request, collects presence-reply
//! identities until its timeout fires, then resolves with the collected
//! set. At most one probe is in flight per endpoint; starting another
//! while one runs resolves the second immediately with an empty set —
//! a deliberate no-op so overlapping collectors cannot corrupt each
//! other. Replies landing after the timeout are ignored because the
//! collector is gone by then. The endpoint's event loop owns the timer;
//! this state machine tracks the collector and the deadline.

use std::collections::HashSet;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::Instant;

/// Default collection window when the caller gives none.
pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_millis(500);

struct ProbeRun {
    collector: HashSet<String>,
    deadline: Instant,
    reply: oneshot::Sender<Vec<String>>,
}

#[derive(Default)]
pub struct ProbeState {
    current: Option<ProbeRun>,
}

impl ProbeState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn in_flight(&self) -> bool {
        self.current.is_some()
    }

    /// Start a probe. Returns `false` (leaving the running probe
    /// untouched) when one is already in flight.
    pub fn begin(&mut self, timeout: Duration, reply: oneshot::Sender<Vec<String>>) -> bool {
        if self.current.is_some() {
            return false;
        }
        self.current = Some(ProbeRun {
            collector: HashSet::new(),
            deadline: Instant::now() + timeout,
            reply,
        });
        true
    }

    /// Record one presence-reply identity; idempotent per identity.
    /// Returns whether the identity was newly collected (always `false`
    /// with no probe in flight — late replies land here).
    pub fn observe(&mut self, identity: &str) -> bool {
        match self.current.as_mut() {
            Some(run) => run.collector.insert(identity.to_string()),
            None => false,
        }
    }

    /// Deadline of the running probe's timeout, if any.
    pub fn deadline(&self) -> Option<Instant> {
        self.current.as_ref().map(|run| run.deadline)
    }

    /// Resolve the running probe with its collected identities, sorted
    /// for stable results. Returns how many peers were collected; no-op
    /// without a probe in flight.
    pub fn finish(&mut self) -> usize {
        match self.current.take() {
            Some(run) => {
                let mut peers: Vec<String> = run.collector.into_iter().collect();
                peers.sort();
                let count = peers.len();
                let _ = run.reply.send(peers);
                count
            }
            None => 0,
        }
    }

    /// Teardown path: resolve any running probe as empty and drop its
    /// collector, rather than leaking a waiter.
    pub fn abort(&mut self) {
        if let Some(run) = self.current.take() {
            let _ = run.reply.send(Vec::new());
        }
    }
}
