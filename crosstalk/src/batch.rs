//! Outgoing batch buffer.
//!
//! While a batching window is open, outgoing envelopes accumulate here
//! and leave as one array frame when the window elapses. A transmit
//! failure inside the window poisons it: the buffer is discarded at
//! flush time instead of sending a partial batch, and the flag resets
//! for the next window. The endpoint's event loop owns the timer; this
//! struct only tracks the deadline.

use std::collections::HashSet;
use std::time::Duration;
use tokio::time::Instant;

use crate::envelope::Envelope;

pub struct SendBuffer {
    window: Duration,
    exclude: HashSet<String>,
    pending: Vec<Envelope>,
    deadline: Option<Instant>,
    poisoned: bool,
}

impl SendBuffer {
    pub fn new(window: Duration, exclude: impl IntoIterator<Item = String>) -> Self {
        Self {
            window,
            exclude: exclude.into_iter().collect(),
            pending: Vec::new(),
            deadline: None,
            poisoned: false,
        }
    }

    /// Whether a send of `kind` buffers or transmits immediately.
    pub fn should_buffer(&self, kind: &str) -> bool {
        !self.window.is_zero() && !self.exclude.contains(kind)
    }

    /// Append to the open window, arming the flush deadline if idle.
    pub fn push(&mut self, envelope: Envelope) {
        self.pending.push(envelope);
        if self.deadline.is_none() {
            self.deadline = Some(Instant::now() + self.window);
        }
    }

    /// Deadline of the armed flush timer, if any.
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Mark the current window poisoned after a failed transmit.
    pub fn poison(&mut self) {
        if !self.window.is_zero() {
            self.poisoned = true;
        }
    }

    /// Close the window at timer fire.
    ///
    /// A poisoned window discards its buffer and resets the flag;
    /// otherwise the whole buffer is handed back for transmission.
    pub fn take_flush(&mut self) -> Option<Vec<Envelope>> {
        self.deadline = None;
        if self.poisoned {
            self.poisoned = false;
            self.pending.clear();
            return None;
        }
        if self.pending.is_empty() {
            return None;
        }
        Some(std::mem::take(&mut self.pending))
    }

    /// Final flush at teardown: one last attempt unless the window is
    /// already poisoned. Cancels the armed deadline either way.
    pub fn take_final(&mut self) -> Option<Vec<Envelope>> {
        self.deadline = None;
        if self.poisoned || self.pending.is_empty() {
            self.pending.clear();
            return None;
        }
        Some(std::mem::take(&mut self.pending))
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}
