//! Broadcast bus seam.
//!
//! The core does not implement a real transport; it assumes a primitive
//! that delivers a posted frame to every endpoint attached to the same
//! named channel, with no ordering or delivery guarantees. [`Transport`]
//! is that seam, and [`MemoryBus`] is the in-process implementation built
//! on tokio broadcast channels: one fan-out channel per name, every
//! attached endpoint gets an independent receiver. Self-delivery is not
//! filtered here — the receive pipeline's origin guard handles it.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast;

/// One encoded frame on the bus: a JSON envelope or an array of them.
pub type Frame = Arc<Vec<u8>>;

/// Bus-level failures.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BusError {
    /// The transport cannot attach a channel in this environment.
    Unavailable(String),
    /// A specific transmit was rejected by the transport.
    TransmitFailed(String),
}

impl std::fmt::Display for BusError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Unavailable(why) => write!(f, "bus unavailable: {why}"),
            Self::TransmitFailed(why) => write!(f, "transmit failed: {why}"),
        }
    }
}

impl std::error::Error for BusError {}

/// External broadcast transport: attach one endpoint to a named channel.
pub trait Transport: Send + Sync {
    fn attach(&self, channel: &str) -> Result<BusConnection, BusError>;
}

/// One endpoint's handle on a channel: transmit side plus a receiver the
/// endpoint takes exactly once and drops on teardown.
pub struct BusConnection {
    tx: broadcast::Sender<Frame>,
    rx: Option<broadcast::Receiver<Frame>>,
    fault: Arc<AtomicBool>,
}

impl BusConnection {
    /// Post a frame to every receiver on the channel.
    ///
    /// Zero receivers is not an error on a broadcast bus; returns how
    /// many receivers got the frame.
    pub fn transmit(&self, frame: Frame) -> Result<usize, BusError> {
        if self.fault.load(Ordering::Relaxed) {
            return Err(BusError::TransmitFailed("injected bus fault".into()));
        }
        Ok(self.tx.send(frame).unwrap_or(0))
    }

    /// Take the inbound receiver. Can only be taken once.
    pub fn take_receiver(&mut self) -> Option<broadcast::Receiver<Frame>> {
        self.rx.take()
    }
}

/// In-process broadcast bus: channel name → fan-out hub.
///
/// Every `attach` on the same name shares one underlying broadcast
/// channel, so a frame posted by any endpoint reaches all others (and
/// the poster's own receiver — the pipeline filters that).
pub struct MemoryBus {
    channels: Mutex<HashMap<String, ChannelHub>>,
    capacity: usize,
}

struct ChannelHub {
    tx: broadcast::Sender<Frame>,
    fault: Arc<AtomicBool>,
}

impl MemoryBus {
    /// `capacity` is the per-receiver frame buffer; lagging receivers
    /// lose oldest frames first, consistent with an at-most-once bus.
    pub fn new(capacity: usize) -> Self {
        Self {
            channels: Mutex::new(HashMap::new()),
            capacity,
        }
    }

    fn lock_channels(&self) -> std::sync::MutexGuard<'_, HashMap<String, ChannelHub>> {
        self.channels
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Number of distinct channel names attached so far.
    pub fn channel_count(&self) -> usize {
        self.lock_channels().len()
    }

    /// Test hook: force every transmit on `channel` to fail (or recover).
    pub fn fail_transmits(&self, channel: &str, failing: bool) {
        let mut channels = self.lock_channels();
        let capacity = self.capacity;
        let hub = channels
            .entry(channel.to_string())
            .or_insert_with(|| ChannelHub::new(capacity));
        hub.fault.store(failing, Ordering::Relaxed);
    }
}

impl Default for MemoryBus {
    fn default() -> Self {
        Self::new(256)
    }
}

impl ChannelHub {
    fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self {
            tx,
            fault: Arc::new(AtomicBool::new(false)),
        }
    }
}

impl Transport for MemoryBus {
    fn attach(&self, channel: &str) -> Result<BusConnection, BusError> {
        let mut channels = self.lock_channels();
        let capacity = self.capacity;
        let hub = channels
            .entry(channel.to_string())
            .or_insert_with(|| ChannelHub::new(capacity));
        Ok(BusConnection {
            tx: hub.tx.clone(),
            rx: Some(hub.tx.subscribe()),
            fault: hub.fault.clone(),
        })
    }
}
