//! Broadcast primitive adapter
//!
//! Wraps whatever cross-context broadcast facility is available behind one
//! `open(name) -> BusChannel` surface so nothing else in the subsystem
//! branches on environment. `SharedBus` models the native facility: every
//! clone of the handle points at the same channel table, and a post from
//! one channel endpoint reaches subscribers on every *other* endpoint of
//! the same name. `LocalBus` is the pure in-process fallback: its table is
//! private, posts loop back to the poster's own subscribers, and nothing
//! ever reaches a genuinely separate context. That degradation is accepted
//! and logged here, not masked.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use dashmap::DashMap;
use tokio::sync::broadcast;
use tracing::{debug, warn};

const CHANNEL_CAPACITY: usize = 64;

static NEXT_ENDPOINT_ID: AtomicU64 = AtomicU64::new(1);

/// Internal frame: payload plus the posting endpoint, so the native path
/// can suppress self-delivery the way a platform broadcast channel does.
#[derive(Debug, Clone)]
struct Envelope {
    origin: u64,
    payload: Bytes,
}

/// A cross-context broadcast transport.
pub trait Broadcast: Send + Sync {
    /// Open a named channel. Channels with the same name interoperate
    /// within the transport's reach.
    fn open(&self, name: &str) -> BusChannel;
}

#[derive(Default)]
struct ChannelTable {
    channels: DashMap<String, broadcast::Sender<Envelope>>,
}

impl ChannelTable {
    fn sender_for(&self, name: &str) -> broadcast::Sender<Envelope> {
        self.channels
            .entry(name.to_string())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .clone()
    }
}

/// The native cross-context facility. Clone the handle into each context;
/// all clones share one channel table. Posts are not delivered back to the
/// endpoint that sent them.
#[derive(Clone, Default)]
pub struct SharedBus {
    table: Arc<ChannelTable>,
}

impl SharedBus {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Broadcast for SharedBus {
    fn open(&self, name: &str) -> BusChannel {
        BusChannel::new(name, self.table.sender_for(name), false)
    }
}

/// In-process fallback used when no cross-context transport exists (e.g. a
/// background worker or a server-rendered pass). Delivery is confined to
/// this bus instance and includes the poster's own subscribers, so callers
/// must apply their own provenance filtering.
pub struct LocalBus {
    table: ChannelTable,
}

impl LocalBus {
    pub fn new() -> Self {
        debug!(
            component = "bus",
            event = "bus.local_fallback",
            "no cross-context transport available; broadcasts stay in-process"
        );
        Self {
            table: ChannelTable::default(),
        }
    }
}

impl Default for LocalBus {
    fn default() -> Self {
        Self::new()
    }
}

impl Broadcast for LocalBus {
    fn open(&self, name: &str) -> BusChannel {
        BusChannel::new(name, self.table.sender_for(name), true)
    }
}

/// One endpoint on a named channel. Cloning shares the endpoint identity,
/// so a clone still does not hear its sibling's posts on the native path.
#[derive(Clone)]
pub struct BusChannel {
    name: String,
    endpoint: u64,
    loopback: bool,
    tx: broadcast::Sender<Envelope>,
    closed: Arc<AtomicBool>,
}

impl BusChannel {
    fn new(name: &str, tx: broadcast::Sender<Envelope>, loopback: bool) -> Self {
        Self {
            name: name.to_string(),
            endpoint: NEXT_ENDPOINT_ID.fetch_add(1, Ordering::Relaxed),
            loopback,
            tx,
            closed: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Post a payload. Fire-and-forget: returns immediately, delivery is
    /// best-effort and never acknowledged. Posting on a closed channel or
    /// a channel with no subscribers is a no-op.
    pub fn post(&self, payload: Bytes) {
        if self.closed.load(Ordering::Relaxed) {
            return;
        }
        let _ = self.tx.send(Envelope {
            origin: self.endpoint,
            payload,
        });
    }

    /// Subscribe to inbound messages on this endpoint.
    pub fn subscribe(&self) -> BusReceiver {
        BusReceiver {
            name: self.name.clone(),
            endpoint: self.endpoint,
            loopback: self.loopback,
            rx: self.tx.subscribe(),
        }
    }

    /// Stop posting from this endpoint. Receivers already subscribed keep
    /// draining whatever was in flight.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Relaxed);
    }
}

/// Inbound side of a channel endpoint.
pub struct BusReceiver {
    name: String,
    endpoint: u64,
    loopback: bool,
    rx: broadcast::Receiver<Envelope>,
}

impl BusReceiver {
    /// Receive the next payload. Returns `None` when the transport itself
    /// is gone. On the native path, posts from this receiver's own endpoint
    /// are skipped; a lagged subscriber skips ahead with a warning rather
    /// than failing.
    pub async fn recv(&mut self) -> Option<Bytes> {
        loop {
            match self.rx.recv().await {
                Ok(envelope) => {
                    if !self.loopback && envelope.origin == self.endpoint {
                        continue;
                    }
                    return Some(envelope.payload);
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(
                        component = "bus",
                        event = "bus.receiver.lagged",
                        channel = %self.name,
                        skipped,
                        "broadcast subscriber lagged, skipped {skipped} messages"
                    );
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}
