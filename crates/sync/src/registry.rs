//! Port registry
//!
//! In-memory map from sandbox port to preview metadata, updated from the
//! lifecycle event stream. The registry is owned exclusively by the
//! synchronizer actor; the outside world sees it only through the
//! observable list (lock-free snapshot + broadcast of updates).

use std::collections::HashMap;
use std::sync::Arc;

use arc_swap::ArcSwap;
use tokio::sync::broadcast;
use tracing::debug;

use portside_protocol::{PortEvent, PreviewId, PreviewInfo};

const LIST_CAPACITY: usize = 64;

pub(crate) struct PortRegistry {
    entries: HashMap<u16, PreviewInfo>,
    snapshot: Arc<ArcSwap<Vec<PreviewInfo>>>,
    list_tx: broadcast::Sender<Vec<PreviewInfo>>,
}

impl PortRegistry {
    pub fn new() -> Self {
        let (list_tx, _) = broadcast::channel(LIST_CAPACITY);
        Self {
            entries: HashMap::new(),
            snapshot: Arc::new(ArcSwap::from_pointee(Vec::new())),
            list_tx,
        }
    }

    /// Lock-free snapshot handle for readers outside the actor.
    pub fn snapshot_arc(&self) -> Arc<ArcSwap<Vec<PreviewInfo>>> {
        Arc::clone(&self.snapshot)
    }

    /// Sender for the observable list; `subscribe()` on it to follow updates.
    pub fn list_tx(&self) -> broadcast::Sender<Vec<PreviewInfo>> {
        self.list_tx.clone()
    }

    /// Current previews, ordered by port.
    pub fn previews(&self) -> Vec<PreviewInfo> {
        let mut list: Vec<PreviewInfo> = self.entries.values().cloned().collect();
        list.sort_by_key(|info| info.port);
        list
    }

    /// Apply a lifecycle event. Returns the affected entry when the event
    /// should trigger an outbound change broadcast (server-ready only;
    /// closure is never broadcast — peers learn of it by timeout of use).
    pub fn apply(&mut self, event: PortEvent) -> Option<PreviewInfo> {
        match event {
            PortEvent::PortOpened { port, url } => {
                let entry = self.entries.entry(port).or_insert_with(|| PreviewInfo {
                    port,
                    ready: false,
                    base_url: String::new(),
                });
                entry.ready = true;
                entry.base_url = url;
                self.publish();
                None
            }
            PortEvent::ServerReady { port, url } => {
                let entry = self.entries.entry(port).or_insert_with(|| PreviewInfo {
                    port,
                    ready: false,
                    base_url: String::new(),
                });
                entry.ready = true;
                if entry.base_url != url {
                    entry.base_url = url;
                }
                let entry = entry.clone();
                self.publish();
                Some(entry)
            }
            PortEvent::PortClosed { port } => {
                if self.entries.remove(&port).is_some() {
                    debug!(
                        component = "registry",
                        event = "registry.port.closed",
                        port,
                        "removed preview for closed port"
                    );
                    self.publish();
                }
                None
            }
        }
    }

    /// Flip the `ready` flag of the preview matching `preview_id` and
    /// republish the list. Returns false when no entry matches (the port
    /// closed while a refresh was pending — a no-op, not an error).
    pub fn set_ready(&mut self, preview_id: &PreviewId, host_suffix: &str, ready: bool) -> bool {
        let entry = self
            .entries
            .values_mut()
            .find(|info| info.preview_id(host_suffix).as_ref() == Some(preview_id));
        match entry {
            Some(info) => {
                info.ready = ready;
                self.publish();
                true
            }
            None => false,
        }
    }

    fn publish(&self) {
        let list = self.previews();
        self.snapshot.store(Arc::new(list.clone()));
        let _ = self.list_tx.send(list);
    }
}
