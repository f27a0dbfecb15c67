//! # crosstalk — reliable messaging over an unreliable broadcast bus
//!
//! A messaging core for contexts that can only reach each other through
//! a shared broadcast primitive with no ordering, no addressing and
//! at-most-once delivery. crosstalk layers typed envelopes, filtering,
//! deduplication, expiry, send batching, presence probing and
//! synchronized clearing on top of that bus.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐  send / clear / probe   ┌──────────────┐
//! │ ChannelEnd-  │ ───────────────────────► │ endpoint     │
//! │ point handle │ ◄─────────────────────── │ event loop   │
//! └──────────────┘   state snapshots        └──────┬───────┘
//!                                                  │ frames
//!                                                  ▼
//! ┌───────────┐   ┌──────────────┐   ┌─────────────────────┐
//! │ SendBuffer│   │ ReceivePipe- │   │ Transport (bus seam)│
//! │ (batching)│   │ line (guards)│   │ MemoryBus in-process│
//! └───────────┘   └──────────────┘   └─────────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`envelope`] — JSON wire envelope and id generation
//! - [`tag`] — namespaced internal control tags
//! - [`bus`] — the [`bus::Transport`] seam and in-process [`bus::MemoryBus`]
//! - [`config`] — endpoint and per-send options
//! - [`pipeline`] — the receive-side guard chain
//! - [`batch`] — outgoing coalescing buffer
//! - [`probe`] — presence ping/pong state machine
//! - [`clear`] — local and remote bulk-clear filters
//! - [`endpoint`] — channel lifecycle and the endpoint event loop
//!
//! ## Quick start
//!
//! ```no_run
//! use crosstalk::{ChannelEndpoint, ChannelOptions, MemoryBus};
//!
//! # async fn demo() {
//! let bus = MemoryBus::default();
//! let endpoint = ChannelEndpoint::open(&bus, "room", ChannelOptions::default());
//! endpoint.send("greet", serde_json::json!({"text": "hi"})).unwrap();
//! # }
//! ```

pub mod batch;
pub mod bus;
pub mod clear;
pub mod config;
pub mod endpoint;
pub mod envelope;
pub mod pipeline;
pub mod probe;
pub mod tag;

// Re-exports for convenience
pub use bus::{BusConnection, BusError, Frame, MemoryBus, Transport};
pub use clear::ClearFilter;
pub use config::{ChannelOptions, MessageCallback, SendOptions};
pub use endpoint::{ChannelEndpoint, ChannelError, ChannelStats};
pub use envelope::Envelope;
pub use probe::DEFAULT_PROBE_TIMEOUT;
