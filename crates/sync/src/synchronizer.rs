//! Preview synchronizer — owns the port registry, the last-write-wins
//! dedupe map, and the per-preview refresh timers, and processes commands
//! sequentially.
//!
//! Runs as an independent tokio task. External callers communicate via
//! `SynchronizerHandle`, which sends `SyncCommand` messages over an mpsc
//! channel; inbound broadcasts are multiplexed into the same loop, so all
//! three maps are mutated from a single owner and need no locks. Lock-free
//! reads of the observable preview list go through `ArcSwap`.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use bytes::Bytes;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use portside_protocol::{
    now_millis, PortEvent, PreviewId, PreviewInfo, PreviewMessage, PREVIEW_CHANNEL,
    SANDBOX_HOST_SUFFIX,
};

use crate::bus::{Broadcast, BusChannel, BusReceiver};
use crate::registry::PortRegistry;

/// Tunables for one synchronizer instance.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Sandbox-hosting domain suffix previewIds are derived against.
    pub host_suffix: String,
    /// Delay collapsing bursts of change messages into one visible refresh.
    pub debounce: Duration,
    /// Broadcast channel name for preview lifecycle/refresh messages.
    pub preview_channel: String,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            host_suffix: SANDBOX_HOST_SUFFIX.to_string(),
            debounce: Duration::from_millis(300),
            preview_channel: PREVIEW_CHANNEL.to_string(),
        }
    }
}

enum SyncCommand {
    Lifecycle(PortEvent),
    FilesChanged,
    Refresh(PreviewId),
    RefreshAll,
    DebounceFired(PreviewId, u64),
    Close,
}

/// Handle to a running synchronizer (cheap to Clone).
#[derive(Clone)]
pub struct SynchronizerHandle {
    command_tx: mpsc::Sender<SyncCommand>,
    snapshot: Arc<ArcSwap<Vec<PreviewInfo>>>,
    list_tx: broadcast::Sender<Vec<PreviewInfo>>,
}

impl SynchronizerHandle {
    /// Feed one sandbox lifecycle event into the synchronizer.
    pub async fn handle_port_event(&self, event: PortEvent) {
        self.send(SyncCommand::Lifecycle(event)).await;
    }

    /// Local files changed: broadcast a change for every known preview and
    /// refresh them here as well.
    pub async fn notify_files_changed(&self) {
        self.send(SyncCommand::FilesChanged).await;
    }

    /// Schedule a debounced refresh for one preview.
    pub async fn refresh_preview(&self, preview_id: PreviewId) {
        self.send(SyncCommand::Refresh(preview_id)).await;
    }

    /// Schedule a debounced refresh for every known preview.
    pub async fn refresh_all(&self) {
        self.send(SyncCommand::RefreshAll).await;
    }

    /// Lock-free read of the observable preview list.
    pub fn previews(&self) -> Vec<PreviewInfo> {
        self.snapshot.load().as_ref().clone()
    }

    /// Subscribe to observable-list updates.
    pub fn subscribe_previews(&self) -> broadcast::Receiver<Vec<PreviewInfo>> {
        self.list_tx.subscribe()
    }

    /// Tear the synchronizer down: every pending refresh timer is
    /// cancelled and the bus channel is closed.
    pub async fn close(&self) {
        self.send(SyncCommand::Close).await;
    }

    async fn send(&self, cmd: SyncCommand) {
        if self.command_tx.send(cmd).await.is_err() {
            warn!(
                component = "synchronizer",
                event = "sync.command.dropped",
                "synchronizer closed, command dropped"
            );
        }
    }
}

/// The synchronizer actor. Construct with [`PreviewSynchronizer::spawn`].
pub struct PreviewSynchronizer {
    config: SyncConfig,
    registry: PortRegistry,
    channel: BusChannel,
    last_update: HashMap<PreviewId, i64>,
    refresh_timers: HashMap<PreviewId, (u64, JoinHandle<()>)>,
    timer_generation: u64,
    command_tx: mpsc::Sender<SyncCommand>,
}

impl PreviewSynchronizer {
    /// Spawn a synchronizer on `bus` and return a handle to it.
    pub fn spawn(bus: &dyn Broadcast, config: SyncConfig) -> SynchronizerHandle {
        let channel = bus.open(&config.preview_channel);
        let inbound = channel.subscribe();
        let registry = PortRegistry::new();
        let snapshot = registry.snapshot_arc();
        let list_tx = registry.list_tx();
        let (command_tx, command_rx) = mpsc::channel(256);

        let actor = PreviewSynchronizer {
            config,
            registry,
            channel,
            last_update: HashMap::new(),
            refresh_timers: HashMap::new(),
            timer_generation: 0,
            command_tx: command_tx.clone(),
        };
        tokio::spawn(actor_loop(actor, command_rx, inbound));

        SynchronizerHandle {
            command_tx,
            snapshot,
            list_tx,
        }
    }

    async fn handle_command(&mut self, cmd: SyncCommand) {
        match cmd {
            SyncCommand::Lifecycle(event) => {
                debug!(
                    component = "synchronizer",
                    event = "sync.lifecycle",
                    lifecycle = ?event,
                    "applying sandbox lifecycle event"
                );
                if let Some(info) = self.registry.apply(event) {
                    self.broadcast_change(&info);
                }
            }
            SyncCommand::FilesChanged => {
                for info in self.registry.previews() {
                    if let Some(preview_id) = self.broadcast_change(&info) {
                        self.schedule_refresh(preview_id);
                    }
                }
            }
            SyncCommand::Refresh(preview_id) => self.schedule_refresh(preview_id),
            SyncCommand::RefreshAll => {
                for info in self.registry.previews() {
                    if let Some(preview_id) = info.preview_id(&self.config.host_suffix) {
                        self.schedule_refresh(preview_id);
                    }
                }
            }
            SyncCommand::DebounceFired(preview_id, generation) => {
                // A fired command can sit in the queue while a newer change
                // re-arms the timer for the same preview. Only the fire from
                // the currently tracked timer may collapse the window.
                let current = self
                    .refresh_timers
                    .get(&preview_id)
                    .is_some_and(|(gen, _)| *gen == generation);
                if !current {
                    debug!(
                        component = "synchronizer",
                        event = "sync.refresh.superseded",
                        preview_id = %preview_id,
                        "ignoring fire from a superseded refresh timer"
                    );
                    return;
                }
                self.refresh_timers.remove(&preview_id);
                self.toggle_ready(&preview_id).await;
            }
            // Close is intercepted by the actor loop before dispatch.
            SyncCommand::Close => {}
        }
    }

    fn handle_inbound(&mut self, payload: Bytes) {
        let msg = match serde_json::from_slice::<PreviewMessage>(&payload) {
            Ok(msg) => msg,
            Err(err) => {
                debug!(
                    component = "synchronizer",
                    event = "sync.message.unrecognized",
                    error = %err,
                    "dropping unrecognized preview channel payload"
                );
                return;
            }
        };

        match msg {
            PreviewMessage::FileChange {
                preview_id,
                timestamp,
            }
            | PreviewMessage::StateChange {
                preview_id,
                timestamp,
            } => {
                // Last-write-wins on generation time, not arrival order: a
                // late out-of-order message must not un-refresh newer state.
                let stale = self
                    .last_update
                    .get(&preview_id)
                    .is_some_and(|&seen| timestamp <= seen);
                if stale {
                    debug!(
                        component = "synchronizer",
                        event = "sync.message.stale",
                        preview_id = %preview_id,
                        timestamp,
                        "discarding stale change message"
                    );
                    return;
                }
                self.last_update.insert(preview_id.clone(), timestamp);
                self.schedule_refresh(preview_id);
            }
            PreviewMessage::PreviewReady { preview_id, port, url, .. } => {
                // Late-join discovery: a sibling announced a loaded preview
                // we may not have seen the port-ready event for. Upsert is
                // idempotent, so our own surfaces re-announcing is harmless.
                if PreviewId::from_base_url(&url, &self.config.host_suffix).as_ref()
                    != Some(&preview_id)
                {
                    debug!(
                        component = "synchronizer",
                        event = "sync.ready.mismatched_url",
                        preview_id = %preview_id,
                        url = %url,
                        "dropping preview_ready with mismatched URL"
                    );
                    return;
                }
                self.registry.apply(PortEvent::PortOpened { port, url });
            }
        }
    }

    /// Broadcast a file-change for `info` and record its timestamp, unless
    /// the URL yields no identity (expected during sandbox cold-start —
    /// skip silently). Returns the derived id.
    fn broadcast_change(&mut self, info: &PreviewInfo) -> Option<PreviewId> {
        let Some(preview_id) = info.preview_id(&self.config.host_suffix) else {
            debug!(
                component = "synchronizer",
                event = "sync.broadcast.no_identity",
                port = info.port,
                url = %info.base_url,
                "skipping broadcast for unparsable preview URL"
            );
            return None;
        };

        let timestamp = now_millis();
        let seen = self.last_update.entry(preview_id.clone()).or_insert(0);
        *seen = (*seen).max(timestamp);

        let msg = PreviewMessage::FileChange {
            preview_id: preview_id.clone(),
            timestamp,
        };
        match serde_json::to_vec(&msg) {
            Ok(json) => self.channel.post(Bytes::from(json)),
            Err(err) => warn!(
                component = "synchronizer",
                event = "sync.broadcast.encode_failed",
                error = %err,
                "failed to encode change message"
            ),
        }
        Some(preview_id)
    }

    /// At most one pending timer per previewId: scheduling cancels any
    /// prior timer for the same key. This is the only cancellation
    /// primitive in the subsystem.
    fn schedule_refresh(&mut self, preview_id: PreviewId) {
        if let Some((_, timer)) = self.refresh_timers.remove(&preview_id) {
            timer.abort();
        }
        self.timer_generation += 1;
        let generation = self.timer_generation;
        let command_tx = self.command_tx.clone();
        let delay = self.config.debounce;
        let key = preview_id.clone();
        let timer = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = command_tx
                .send(SyncCommand::DebounceFired(key, generation))
                .await;
        });
        self.refresh_timers.insert(preview_id, (generation, timer));
    }

    /// Two-phase visual toggle: ready=false, publish, yield, ready=true,
    /// publish. Forces passive surfaces rendering the observable list to
    /// cold-reload without a dedicated reload message type.
    async fn toggle_ready(&mut self, preview_id: &PreviewId) {
        if !self
            .registry
            .set_ready(preview_id, &self.config.host_suffix, false)
        {
            // Port closed while the refresh was pending.
            return;
        }
        tokio::task::yield_now().await;
        self.registry
            .set_ready(preview_id, &self.config.host_suffix, true);
        debug!(
            component = "synchronizer",
            event = "sync.refresh.toggled",
            preview_id = %preview_id,
            "refreshed preview"
        );
    }

    fn shutdown(self) {
        for (_, (_, timer)) in self.refresh_timers {
            timer.abort();
        }
        self.channel.close();
        debug!(
            component = "synchronizer",
            event = "sync.closed",
            "synchronizer shut down"
        );
    }
}

async fn actor_loop(
    mut actor: PreviewSynchronizer,
    mut command_rx: mpsc::Receiver<SyncCommand>,
    mut inbound: BusReceiver,
) {
    let mut inbound_open = true;
    loop {
        tokio::select! {
            cmd = command_rx.recv() => match cmd {
                Some(SyncCommand::Close) | None => break,
                Some(cmd) => actor.handle_command(cmd).await,
            },
            payload = inbound.recv(), if inbound_open => match payload {
                Some(payload) => actor.handle_inbound(payload),
                // Transport gone: keep serving local commands.
                None => inbound_open = false,
            },
        }
    }
    actor.shutdown();
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::{advance, sleep};

    fn url(label: &str) -> String {
        format!("https://{label}.preview.portside.dev")
    }

    fn change(label: &str, timestamp: i64) -> Bytes {
        let msg = PreviewMessage::FileChange {
            preview_id: PreviewId::from(label),
            timestamp,
        };
        Bytes::from(serde_json::to_vec(&msg).unwrap())
    }

    /// Drain list updates and count ready transitions for the given port.
    fn transitions(
        rx: &mut broadcast::Receiver<Vec<PreviewInfo>>,
        port: u16,
    ) -> Vec<bool> {
        let mut seen = Vec::new();
        while let Ok(list) = rx.try_recv() {
            if let Some(info) = list.iter().find(|info| info.port == port) {
                if seen.last() != Some(&info.ready) {
                    seen.push(info.ready);
                }
            }
        }
        seen
    }

    #[tokio::test(start_paused = true)]
    async fn server_ready_broadcasts_file_change() {
        let bus = crate::bus::SharedBus::new();
        let sync = PreviewSynchronizer::spawn(&bus, SyncConfig::default());
        let peer = bus.open(PREVIEW_CHANNEL);
        let mut peer_rx = peer.subscribe();

        sync.handle_port_event(PortEvent::ServerReady {
            port: 3000,
            url: url("abc"),
        })
        .await;

        let payload = peer_rx.recv().await.expect("broadcast");
        let msg: PreviewMessage = serde_json::from_slice(&payload).unwrap();
        match msg {
            PreviewMessage::FileChange { preview_id, .. } => {
                assert_eq!(preview_id.as_str(), "abc");
            }
            other => panic!("unexpected message: {:?}", other),
        }
        sync.close().await;
    }

    #[tokio::test(start_paused = true)]
    async fn malformed_url_never_broadcasts() {
        let bus = crate::bus::SharedBus::new();
        let sync = PreviewSynchronizer::spawn(&bus, SyncConfig::default());
        let peer = bus.open(PREVIEW_CHANNEL);
        let mut peer_rx = peer.subscribe();

        sync.handle_port_event(PortEvent::ServerReady {
            port: 3000,
            url: "http://localhost:3000".to_string(),
        })
        .await;
        sync.handle_port_event(PortEvent::ServerReady {
            port: 3001,
            url: url("good"),
        })
        .await;

        // The first broadcast that arrives is for the parsable URL.
        let payload = peer_rx.recv().await.expect("broadcast");
        let msg: PreviewMessage = serde_json::from_slice(&payload).unwrap();
        assert_eq!(msg.preview_id().as_str(), "good");
        sync.close().await;
    }

    #[tokio::test(start_paused = true)]
    async fn port_lifecycle_removes_and_reopens() {
        let bus = crate::bus::LocalBus::new();
        let sync = PreviewSynchronizer::spawn(&bus, SyncConfig::default());

        sync.handle_port_event(PortEvent::PortOpened {
            port: 3000,
            url: url("first"),
        })
        .await;
        sync.handle_port_event(PortEvent::PortClosed { port: 3000 }).await;
        sleep(Duration::from_millis(1)).await;
        assert!(sync.previews().is_empty());

        sync.handle_port_event(PortEvent::PortOpened {
            port: 3000,
            url: url("second"),
        })
        .await;
        sleep(Duration::from_millis(1)).await;
        let previews = sync.previews();
        assert_eq!(previews.len(), 1);
        assert_eq!(previews[0].base_url, url("second"));
        assert!(previews[0].ready);
        sync.close().await;
    }

    #[tokio::test(start_paused = true)]
    async fn debounce_collapses_bursts_into_one_refresh() {
        let bus = crate::bus::LocalBus::new();
        let sync = PreviewSynchronizer::spawn(&bus, SyncConfig::default());
        let peer = bus.open(PREVIEW_CHANNEL);

        sync.handle_port_event(PortEvent::PortOpened {
            port: 3000,
            url: url("abc"),
        })
        .await;
        sleep(Duration::from_millis(1)).await;
        let mut list_rx = sync.subscribe_previews();

        // A burst of changes within the debounce window.
        for t in 1..=5 {
            peer.post(change("abc", t));
        }
        sleep(Duration::from_millis(400)).await;

        assert_eq!(transitions(&mut list_rx, 3000), vec![false, true]);
        sync.close().await;
    }

    #[tokio::test(start_paused = true)]
    async fn last_write_wins_in_either_order() {
        let bus = crate::bus::LocalBus::new();
        let sync = PreviewSynchronizer::spawn(&bus, SyncConfig::default());
        let peer = bus.open(PREVIEW_CHANNEL);

        sync.handle_port_event(PortEvent::PortOpened {
            port: 3000,
            url: url("abc"),
        })
        .await;
        sleep(Duration::from_millis(1)).await;
        let mut list_rx = sync.subscribe_previews();

        // Newer message first; the older one must be discarded, producing
        // exactly one refresh for t2.
        peer.post(change("abc", 2_000));
        sleep(Duration::from_millis(400)).await;
        peer.post(change("abc", 1_000));
        sleep(Duration::from_millis(400)).await;

        assert_eq!(transitions(&mut list_rx, 3000), vec![false, true]);
        sync.close().await;
    }

    #[tokio::test(start_paused = true)]
    async fn stale_duplicate_is_discarded() {
        let bus = crate::bus::LocalBus::new();
        let sync = PreviewSynchronizer::spawn(&bus, SyncConfig::default());
        let peer = bus.open(PREVIEW_CHANNEL);

        sync.handle_port_event(PortEvent::PortOpened {
            port: 3000,
            url: url("abc"),
        })
        .await;
        sleep(Duration::from_millis(1)).await;
        let mut list_rx = sync.subscribe_previews();

        peer.post(change("abc", 1_000));
        sleep(Duration::from_millis(400)).await;
        assert_eq!(transitions(&mut list_rx, 3000), vec![false, true]);

        // Exact duplicate: timestamp is not strictly greater, no refresh.
        peer.post(change("abc", 1_000));
        sleep(Duration::from_millis(400)).await;
        assert_eq!(transitions(&mut list_rx, 3000), Vec::<bool>::new());
        sync.close().await;
    }

    #[tokio::test(start_paused = true)]
    async fn scheduling_resets_the_pending_timer() {
        let bus = crate::bus::LocalBus::new();
        let sync = PreviewSynchronizer::spawn(&bus, SyncConfig::default());
        let peer = bus.open(PREVIEW_CHANNEL);

        sync.handle_port_event(PortEvent::PortOpened {
            port: 3000,
            url: url("abc"),
        })
        .await;
        sleep(Duration::from_millis(1)).await;
        let mut list_rx = sync.subscribe_previews();

        peer.post(change("abc", 1));
        sleep(Duration::from_millis(200)).await;
        // Second message re-arms the timer before the first fires.
        peer.post(change("abc", 2));
        sleep(Duration::from_millis(200)).await;
        assert_eq!(transitions(&mut list_rx, 3000), Vec::<bool>::new());

        advance(Duration::from_millis(150)).await;
        sleep(Duration::from_millis(1)).await;
        assert_eq!(transitions(&mut list_rx, 3000), vec![false, true]);
        sync.close().await;
    }

    #[tokio::test(start_paused = true)]
    async fn superseded_timer_fire_does_not_collapse_new_window() {
        let bus = crate::bus::LocalBus::new();
        let sync = PreviewSynchronizer::spawn(&bus, SyncConfig::default());
        let peer = bus.open(PREVIEW_CHANNEL);

        sync.handle_port_event(PortEvent::PortOpened {
            port: 3000,
            url: url("abc"),
        })
        .await;
        sleep(Duration::from_millis(1)).await;
        let mut list_rx = sync.subscribe_previews();

        // Arm a fresh timer, then deliver a fire whose generation belongs
        // to a timer that was already replaced. It must neither toggle nor
        // untrack the live timer.
        peer.post(change("abc", 1));
        sleep(Duration::from_millis(1)).await;
        sync.command_tx
            .send(SyncCommand::DebounceFired(PreviewId::from("abc"), 0))
            .await
            .unwrap();
        sleep(Duration::from_millis(100)).await;
        assert_eq!(transitions(&mut list_rx, 3000), Vec::<bool>::new());

        // The live timer still fires exactly once at the full delay.
        sleep(Duration::from_millis(300)).await;
        assert_eq!(transitions(&mut list_rx, 3000), vec![false, true]);
        sync.close().await;
    }

    #[tokio::test(start_paused = true)]
    async fn preview_ready_performs_late_join_discovery() {
        let bus = crate::bus::SharedBus::new();
        let sync = PreviewSynchronizer::spawn(&bus, SyncConfig::default());
        let peer = bus.open(PREVIEW_CHANNEL);

        let msg = PreviewMessage::PreviewReady {
            preview_id: PreviewId::from("late"),
            port: 4000,
            url: url("late"),
            timestamp: now_millis(),
        };
        peer.post(Bytes::from(serde_json::to_vec(&msg).unwrap()));
        sleep(Duration::from_millis(10)).await;

        let previews = sync.previews();
        assert_eq!(previews.len(), 1);
        assert_eq!(previews[0].port, 4000);
        assert_eq!(previews[0].base_url, url("late"));
        sync.close().await;
    }

    #[tokio::test(start_paused = true)]
    async fn refresh_for_closed_port_is_a_no_op() {
        let bus = crate::bus::LocalBus::new();
        let sync = PreviewSynchronizer::spawn(&bus, SyncConfig::default());
        let peer = bus.open(PREVIEW_CHANNEL);

        sync.handle_port_event(PortEvent::PortOpened {
            port: 3000,
            url: url("abc"),
        })
        .await;
        peer.post(change("abc", 1));
        sync.handle_port_event(PortEvent::PortClosed { port: 3000 }).await;

        sleep(Duration::from_millis(400)).await;
        assert!(sync.previews().is_empty());
        sync.close().await;
    }
}
