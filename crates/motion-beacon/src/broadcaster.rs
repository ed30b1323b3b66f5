//! The TCP fan-out broadcaster: listener lifecycle, peer-set maintenance,
//! and the raw/typed broadcast paths.
//!
//! Concurrency model:
//!
//! - One background Tokio task drives acceptance: sleep for the configured
//!   interval, accept a single connection, register it, emit
//!   [`PeerEvent::Connected`], repeat.  Exactly one accept is in flight at any
//!   time.
//! - Broadcast calls run on the caller's task.  The peer set is shared between
//!   the accept task and broadcast callers, so it lives behind a
//!   `tokio::sync::Mutex`.  The lock is held for a whole broadcast, which also
//!   keeps broadcasts peer-sequential: two concurrent broadcasts never
//!   interleave at the per-peer level.
//!
//! Failure policy: a peer whose write fails mid-broadcast is dropped and the
//! broadcast continues with the remaining peers.  Callers observe partial
//! delivery through the returned delivered count, never through an error.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;
use tokio::io::{AsyncWriteExt, Interest};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpListener;
use tokio::runtime::Handle;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio::time;
use tracing::{debug, info, warn};

use crate::config::BroadcasterConfig;

/// Errors surfaced by the broadcaster.
///
/// Transport-level write failures are deliberately absent: a peer whose write
/// fails is dropped from the set and the broadcast carries on (see the module
/// docs for the failure policy).
#[derive(Debug, Error)]
pub enum BroadcastError {
    /// The OS could not allocate the listening socket or its ephemeral port.
    /// Fatal at construction; there is no retry.
    #[error("bind failed on {addr}: {source}")]
    BindFailed {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },
    /// A value on the typed broadcast path could not be encoded to JSON.
    /// Surfaced before any network I/O; no peer receives anything.
    #[error("failed to encode value for broadcast: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Events emitted by the accept task to the broadcaster's owner.
#[derive(Debug)]
pub enum PeerEvent {
    /// A new peer connected.  Emitted exactly once per accepted connection,
    /// before the next accept cycle is armed.
    ///
    /// The accepted stream is split: the broadcaster retains the write half
    /// for fan-out, and `reader` is the owner's half — use it to read
    /// whatever the peer sends (a handshake, acknowledgements, nothing).
    /// Dropping `reader` does not close the connection.
    Connected {
        addr: SocketAddr,
        reader: OwnedReadHalf,
    },
}

/// One connected peer: the address it connected from and the write half the
/// broadcaster keeps for fan-out.
struct Peer {
    addr: SocketAddr,
    writer: OwnedWriteHalf,
}

impl Peer {
    /// Polls the socket's readiness to decide whether the peer is still
    /// connected.  A closed or half-closed socket (FIN or RST received)
    /// reports itself through the read-closed/write-closed readiness flags.
    ///
    /// A healthy idle socket is immediately write-ready, so this resolves
    /// without suspending in the common case.
    async fn is_alive(&self) -> bool {
        match self
            .writer
            .ready(Interest::READABLE | Interest::WRITABLE)
            .await
        {
            Ok(ready) => !ready.is_read_closed() && !ready.is_write_closed(),
            Err(_) => false,
        }
    }
}

/// A TCP fan-out broadcaster bound to an OS-assigned ephemeral port.
///
/// Constructed with [`bind`](TcpBroadcaster::bind); the resolved port is
/// available from [`local_port`](TcpBroadcaster::local_port) and is the only
/// handshake the outside world needs to connect.
///
/// # Examples
///
/// ```rust,no_run
/// use motion_beacon::{BroadcasterConfig, TcpBroadcaster};
///
/// # async fn run() -> Result<(), motion_beacon::BroadcastError> {
/// let (beacon, mut events) = TcpBroadcaster::bind(BroadcasterConfig::default()).await?;
/// println!("listening on port {}", beacon.local_port());
///
/// // ... peers connect; each one shows up on `events` ...
///
/// let delivered = beacon.broadcast(&[0x01, 0x02, 0x03]).await;
/// println!("delivered to {delivered} peer(s)");
/// # Ok(())
/// # }
/// ```
pub struct TcpBroadcaster {
    peers: Arc<Mutex<Vec<Peer>>>,
    local_port: u16,
    /// Runtime handle captured at bind time; drives the `*_blocking` entry
    /// points for callers that live outside the async world.
    runtime: Handle,
    accept_task: JoinHandle<()>,
}

impl TcpBroadcaster {
    /// Binds a listener on `(config.bind_address, 0)`, spawns the accept
    /// loop, and returns the broadcaster together with the receiver for
    /// [`PeerEvent`]s.
    ///
    /// The OS picks the port; read it back with
    /// [`local_port`](TcpBroadcaster::local_port).
    ///
    /// # Errors
    ///
    /// Returns [`BroadcastError::BindFailed`] if the OS cannot allocate the
    /// socket or resolve its local address.
    pub async fn bind(
        config: BroadcasterConfig,
    ) -> Result<(Self, mpsc::Receiver<PeerEvent>), BroadcastError> {
        let bind_addr = SocketAddr::new(config.bind_address, 0);
        let listener = TcpListener::bind(bind_addr)
            .await
            .map_err(|source| BroadcastError::BindFailed {
                addr: bind_addr,
                source,
            })?;
        let local_port = listener
            .local_addr()
            .map_err(|source| BroadcastError::BindFailed {
                addr: bind_addr,
                source,
            })?
            .port();

        let (event_tx, event_rx) = mpsc::channel(32);
        let peers = Arc::new(Mutex::new(Vec::new()));
        let accept_task = tokio::spawn(accept_loop(
            listener,
            Arc::clone(&peers),
            event_tx,
            config.accept_interval,
        ));

        info!("broadcaster listening on port {local_port}");

        let broadcaster = Self {
            peers,
            local_port,
            runtime: Handle::current(),
            accept_task,
        };
        Ok((broadcaster, event_rx))
    }

    /// The OS-assigned port the listener is bound to.  Always nonzero.
    pub fn local_port(&self) -> u16 {
        self.local_port
    }

    /// Number of peers currently tracked.
    ///
    /// Dead peers are only reaped on the next broadcast, so a recently
    /// disconnected peer may still be counted here until then.
    pub async fn peer_count(&self) -> usize {
        self.peers.lock().await.len()
    }

    /// Writes `buf` to every currently live peer, sequentially, in the order
    /// the peers connected.
    ///
    /// Dead peers are pruned before the fan-out starts.  A peer whose write
    /// fails mid-broadcast is dropped and the remaining peers still receive
    /// the buffer.  Returns the number of peers the buffer was delivered to.
    ///
    /// No framing is applied: back-to-back broadcasts produce back-to-back
    /// bytes on the wire.
    pub async fn broadcast(&self, buf: &[u8]) -> usize {
        let mut peers = self.peers.lock().await;
        prune_dead(&mut peers).await;

        let mut delivered = 0;
        let mut i = 0;
        while i < peers.len() {
            match peers[i].writer.write_all(buf).await {
                Ok(()) => {
                    delivered += 1;
                    i += 1;
                }
                Err(e) => {
                    let peer = peers.remove(i);
                    warn!("dropping peer {}: write failed: {e}", peer.addr);
                }
            }
        }
        delivered
    }

    /// Encodes `value` as a single contiguous JSON buffer and broadcasts it.
    ///
    /// Each call writes exactly one JSON value; since JSON is
    /// self-delimiting, consumers can parse a stream of repeated broadcasts
    /// without any extra framing.
    ///
    /// # Errors
    ///
    /// Returns [`BroadcastError::Serialize`] if encoding fails.  The error is
    /// raised before any network I/O — no peer receives a partial value.
    pub async fn broadcast_value<T: Serialize>(
        &self,
        value: &T,
    ) -> Result<usize, BroadcastError> {
        let encoded = serde_json::to_vec(value)?;
        Ok(self.broadcast(&encoded).await)
    }

    /// Blocking variant of [`broadcast`](TcpBroadcaster::broadcast) for
    /// callers outside the async runtime (e.g. a sensor loop running on a
    /// plain thread).
    ///
    /// # Panics
    ///
    /// Panics if called from within an asynchronous execution context; use
    /// [`broadcast`](TcpBroadcaster::broadcast) there instead.
    pub fn broadcast_blocking(&self, buf: &[u8]) -> usize {
        self.runtime.block_on(self.broadcast(buf))
    }

    /// Blocking variant of
    /// [`broadcast_value`](TcpBroadcaster::broadcast_value).
    ///
    /// # Errors
    ///
    /// Returns [`BroadcastError::Serialize`] if encoding fails.
    ///
    /// # Panics
    ///
    /// Panics if called from within an asynchronous execution context.
    pub fn broadcast_value_blocking<T: Serialize>(
        &self,
        value: &T,
    ) -> Result<usize, BroadcastError> {
        self.runtime.block_on(self.broadcast_value(value))
    }

    /// Stops accepting and disconnects every tracked peer.
    ///
    /// Aborting the accept task drops the listener, so new connection
    /// attempts to [`local_port`](TcpBroadcaster::local_port) are refused
    /// shortly after this returns.  Idempotent: calling it again is a no-op.
    pub async fn shutdown(&self) {
        self.accept_task.abort();
        self.peers.lock().await.clear();
        info!("broadcaster on port {} shut down", self.local_port);
    }
}

impl Drop for TcpBroadcaster {
    fn drop(&mut self) {
        // Stop accepting even if the owner never called shutdown(); the
        // aborted task drops the listener and releases the port.
        self.accept_task.abort();
    }
}

/// The background accept loop.
///
/// Mirrors a self-rearming one-shot timer: each cycle sleeps for `interval`,
/// then waits for a single connection to complete acceptance.  The next cycle
/// is armed only after the previous accept resolved and its event was
/// emitted, so at most one accept is ever outstanding.
async fn accept_loop(
    listener: TcpListener,
    peers: Arc<Mutex<Vec<Peer>>>,
    event_tx: mpsc::Sender<PeerEvent>,
    interval: Duration,
) {
    loop {
        time::sleep(interval).await;
        match listener.accept().await {
            Ok((stream, addr)) => {
                debug!("peer connected: {addr}");
                let (reader, writer) = stream.into_split();
                peers.lock().await.push(Peer { addr, writer });
                if event_tx
                    .send(PeerEvent::Connected { addr, reader })
                    .await
                    .is_err()
                {
                    // Owner dropped the receiver; keep accepting anyway so
                    // broadcasts still reach new peers.
                    debug!("peer event receiver dropped");
                }
            }
            Err(e) => warn!("accept failed: {e}"),
        }
    }
}

/// Removes every peer whose connection is no longer alive, preserving the
/// order of the survivors.  This is the only place dead peers are reaped;
/// there is no background health check.
async fn prune_dead(peers: &mut Vec<Peer>) {
    let mut i = 0;
    while i < peers.len() {
        if peers[i].is_alive().await {
            i += 1;
        } else {
            let peer = peers.remove(i);
            debug!("pruning dead peer {}", peer.addr);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use std::net::{IpAddr, Ipv4Addr};

    fn loopback_config() -> BroadcasterConfig {
        BroadcasterConfig {
            bind_address: IpAddr::V4(Ipv4Addr::LOCALHOST),
            accept_interval: Duration::from_millis(50),
        }
    }

    #[tokio::test]
    async fn test_bind_assigns_nonzero_port() {
        let (beacon, _events) = TcpBroadcaster::bind(loopback_config())
            .await
            .expect("bind must succeed on loopback");
        assert_ne!(beacon.local_port(), 0);
    }

    #[tokio::test]
    async fn test_two_broadcasters_get_distinct_ports() {
        let (a, _rx_a) = TcpBroadcaster::bind(loopback_config()).await.unwrap();
        let (b, _rx_b) = TcpBroadcaster::bind(loopback_config()).await.unwrap();
        assert_ne!(a.local_port(), b.local_port());
    }

    #[tokio::test]
    async fn test_broadcast_with_no_peers_delivers_to_nobody() {
        let (beacon, _events) = TcpBroadcaster::bind(loopback_config()).await.unwrap();
        assert_eq!(beacon.broadcast(b"nobody home").await, 0);
        assert_eq!(beacon.peer_count().await, 0);
    }

    #[tokio::test]
    async fn test_broadcast_value_encoding_failure_surfaces_before_io() {
        let (beacon, _events) = TcpBroadcaster::bind(loopback_config()).await.unwrap();

        // JSON object keys must be strings; a tuple key cannot be encoded.
        let mut bad = BTreeMap::new();
        bad.insert((1u8, 2u8), "value");

        let result = beacon.broadcast_value(&bad).await;
        assert!(matches!(result, Err(BroadcastError::Serialize(_))));
    }

    #[tokio::test]
    async fn test_broadcast_value_with_no_peers_returns_zero() {
        let (beacon, _events) = TcpBroadcaster::bind(loopback_config()).await.unwrap();
        let delivered = beacon
            .broadcast_value(&serde_json::json!({ "moving": true }))
            .await
            .expect("plain JSON value must encode");
        assert_eq!(delivered, 0);
    }

    #[tokio::test]
    async fn test_shutdown_is_idempotent() {
        let (beacon, _events) = TcpBroadcaster::bind(loopback_config()).await.unwrap();
        beacon.shutdown().await;
        beacon.shutdown().await;
        assert_eq!(beacon.peer_count().await, 0);
    }
}
