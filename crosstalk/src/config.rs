//! Endpoint and send-time configuration.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use crate::envelope::Envelope;

/// Per-message callback invoked on acceptance.
///
/// Runs on the endpoint's event loop; a panic inside is isolated and
/// reported through the error slot, never propagated.
pub type MessageCallback = Arc<dyn Fn(&Envelope) + Send + Sync>;

/// Options fixed for the lifetime of one endpoint.
///
/// Construct with struct-update syntax over [`ChannelOptions::default`].
#[derive(Clone)]
pub struct ChannelOptions {
    /// Endpoint identity; generated (uuid) when `None` and held for the
    /// endpoint's lifetime.
    pub identity: Option<String>,
    /// Extra scoping mixed into control tags alongside the channel name.
    pub namespace: String,
    /// Accepted user types; empty = accept all.
    pub allowed_types: Vec<String>,
    /// How long a seen envelope id suppresses redelivery.
    pub dedup_window: Duration,
    /// Outgoing coalescing window; zero disables batching entirely.
    pub batch_window: Duration,
    /// Types that always bypass the batching buffer.
    pub batch_exclude: Vec<String>,
    /// Interval of the housekeeping sweep (expiry + dedup purge).
    pub sweep_interval: Duration,
    /// Keep only the most recently accepted message.
    pub keep_latest_only: bool,
    /// Catch-all acceptance callback.
    pub on_message: Option<MessageCallback>,
    /// Per-type acceptance callbacks; takes precedence over the catch-all.
    pub on_typed_message: HashMap<String, MessageCallback>,
    /// Lifetime of a recoverable error in the observable error slot.
    pub error_ttl: Duration,
    /// Emit debug-level trace events for every protocol step.
    pub verbose: bool,
}

impl Default for ChannelOptions {
    fn default() -> Self {
        Self {
            identity: None,
            namespace: String::new(),
            allowed_types: Vec::new(),
            dedup_window: Duration::from_secs(300),
            batch_window: Duration::ZERO,
            batch_exclude: Vec::new(),
            sweep_interval: Duration::from_secs(10),
            keep_latest_only: false,
            on_message: None,
            on_typed_message: HashMap::new(),
            error_ttl: Duration::from_secs(5),
            verbose: false,
        }
    }
}

impl std::fmt::Debug for ChannelOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelOptions")
            .field("identity", &self.identity)
            .field("namespace", &self.namespace)
            .field("allowed_types", &self.allowed_types)
            .field("dedup_window", &self.dedup_window)
            .field("batch_window", &self.batch_window)
            .field("batch_exclude", &self.batch_exclude)
            .field("sweep_interval", &self.sweep_interval)
            .field("keep_latest_only", &self.keep_latest_only)
            .field("on_message", &self.on_message.is_some())
            .field("on_typed_message", &self.on_typed_message.len())
            .field("error_ttl", &self.error_ttl)
            .field("verbose", &self.verbose)
            .finish()
    }
}

/// Per-send expiry options. An absolute expiry wins over a ttl.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SendOptions {
    /// Relative lifetime from send time.
    pub ttl: Option<Duration>,
    /// Absolute expiry, wall-clock milliseconds.
    pub expires_at: Option<u64>,
}

/// The reconfigurable slice of endpoint options.
///
/// Callbacks and the allow-list may change across the endpoint's life
/// without a close/reopen; the guard chain reads this cell at dispatch
/// time. Only the handle writes it.
#[derive(Clone, Default)]
pub struct LiveOptions {
    pub allowed_types: HashSet<String>,
    pub on_message: Option<MessageCallback>,
    pub on_typed_message: HashMap<String, MessageCallback>,
}

impl LiveOptions {
    pub fn from_options(options: &ChannelOptions) -> Self {
        Self {
            allowed_types: options.allowed_types.iter().cloned().collect(),
            on_message: options.on_message.clone(),
            on_typed_message: options.on_typed_message.clone(),
        }
    }

    /// Callback for an accepted envelope: per-type first, then catch-all.
    pub fn callback_for(&self, kind: &str) -> Option<MessageCallback> {
        self.on_typed_message
            .get(kind)
            .cloned()
            .or_else(|| self.on_message.clone())
    }
}
