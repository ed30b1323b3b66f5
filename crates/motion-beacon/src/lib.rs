//! # motion-beacon
//!
//! A minimal TCP fan-out broadcaster for movement-detection events.
//!
//! A movement sensor (or any other producer) constructs a [`TcpBroadcaster`],
//! learns which ephemeral port the OS handed out, and from then on pushes byte
//! buffers — raw or serialized — to every TCP client currently connected to
//! that port.  Remote consumers (dashboards, alarms, loggers) simply connect
//! and read.
//!
//! The broadcaster is intentionally *not* a message broker:
//!
//! - no topics or subscriptions — every peer receives every buffer;
//! - no framing — repeated broadcasts appear back-to-back on the wire, so
//!   consumers must use a self-delimiting encoding (the typed path writes one
//!   JSON value per call) or expect a single read per connection;
//! - no delivery guarantees beyond a best-effort write — a peer that died is
//!   silently dropped, never reconnected.
//!
//! # Architecture
//!
//! ```text
//! TcpBroadcaster::bind()
//!  └─ binds 0.0.0.0:0, resolves the ephemeral port
//!  └─ spawns the accept loop (Tokio task)
//!       loop: sleep(accept_interval) → accept one peer
//!             → register write half → emit PeerEvent::Connected(read half)
//!
//! caller: broadcast() / broadcast_value::<T>()
//!  └─ prune dead peers → sequential write to each surviving peer
//! ```
//!
//! The accepted stream is split: the broadcaster keeps the write half for
//! fan-out, the owner receives the read half in [`PeerEvent::Connected`] and
//! can immediately start reading from the new peer.

pub mod broadcaster;
pub mod config;

// Re-export the full public surface at the crate root so callers can write
// `motion_beacon::TcpBroadcaster` instead of the module path.
pub use broadcaster::{BroadcastError, PeerEvent, TcpBroadcaster};
pub use config::BroadcasterConfig;
