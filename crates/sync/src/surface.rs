//! Preview surface
//!
//! Models the embedding surface for one previewId: the current resource
//! locator is exposed as a watch value, and matching change messages force
//! a cold reload by clearing the locator and restoring it — discard and
//! recreate, never an in-place reload, so sandboxed content is never
//! served from cache. Every (re)load is announced with `preview_ready` so
//! siblings that attached late still discover the URL.

use bytes::Bytes;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use portside_protocol::{now_millis, PreviewId, PreviewMessage};

use crate::bus::{Broadcast, BusChannel};
use crate::synchronizer::SyncConfig;

pub struct PreviewSurface {
    preview_id: PreviewId,
    location: watch::Sender<Option<String>>,
    channel: BusChannel,
    listener: JoinHandle<()>,
}

impl PreviewSurface {
    /// Mount a surface for one preview and start listening for refreshes.
    pub fn mount(
        bus: &dyn Broadcast,
        config: &SyncConfig,
        preview_id: PreviewId,
        port: u16,
        url: String,
    ) -> Self {
        let channel = bus.open(&config.preview_channel);
        let mut inbound = channel.subscribe();
        let (location, _) = watch::channel(Some(url.clone()));

        announce_ready(&channel, &preview_id, port, &url);

        let listener_id = preview_id.clone();
        let listener_channel = channel.clone();
        let listener_location = location.clone();
        let listener = tokio::spawn(async move {
            while let Some(payload) = inbound.recv().await {
                let msg = match serde_json::from_slice::<PreviewMessage>(&payload) {
                    Ok(msg) => msg,
                    Err(_) => continue,
                };
                match msg {
                    PreviewMessage::FileChange { preview_id, .. }
                    | PreviewMessage::StateChange { preview_id, .. }
                        if preview_id == listener_id =>
                    {
                        debug!(
                            component = "surface",
                            event = "surface.reload",
                            preview_id = %preview_id,
                            "cold-reloading preview surface"
                        );
                        let _ = listener_location.send(None);
                        tokio::task::yield_now().await;
                        let _ = listener_location.send(Some(url.clone()));
                        announce_ready(&listener_channel, &listener_id, port, &url);
                    }
                    _ => {}
                }
            }
        });

        Self {
            preview_id,
            location,
            channel,
            listener,
        }
    }

    pub fn preview_id(&self) -> &PreviewId {
        &self.preview_id
    }

    /// Follow the surface's resource locator; `None` during a cold reload.
    pub fn location(&self) -> watch::Receiver<Option<String>> {
        self.location.subscribe()
    }

    pub fn close(self) {
        self.listener.abort();
        self.channel.close();
    }
}

fn announce_ready(channel: &BusChannel, preview_id: &PreviewId, port: u16, url: &str) {
    let msg = PreviewMessage::PreviewReady {
        preview_id: preview_id.clone(),
        port,
        url: url.to_string(),
        timestamp: now_millis(),
    };
    match serde_json::to_vec(&msg) {
        Ok(json) => channel.post(Bytes::from(json)),
        Err(err) => warn!(
            component = "surface",
            event = "surface.announce.encode_failed",
            error = %err,
            "failed to encode preview_ready"
        ),
    }
}
