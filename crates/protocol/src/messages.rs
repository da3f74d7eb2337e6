//! Broadcast channel messages
//!
//! Messages are immutable and fire-and-forget: there is no acknowledgment
//! or retry, and peers must tolerate loss, duplication, and reordering.
//! Conflict resolution is last-write-wins on the generation `timestamp`,
//! never on arrival order.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::types::{PreviewId, TabId};

/// Messages exchanged on the preview channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PreviewMessage {
    /// Files backing a preview changed; peers should refresh it.
    FileChange {
        preview_id: PreviewId,
        timestamp: i64,
    },
    /// Non-file state backing a preview changed; same handling as
    /// `FileChange`, kept distinct for observability.
    StateChange {
        preview_id: PreviewId,
        timestamp: i64,
    },
    /// A surface finished loading a preview. Late-join discovery: contexts
    /// that attached after the port-ready event learn the URL from this.
    PreviewReady {
        preview_id: PreviewId,
        port: u16,
        url: String,
        timestamp: i64,
    },
}

impl PreviewMessage {
    /// The previewId this message routes on.
    pub fn preview_id(&self) -> &PreviewId {
        match self {
            Self::FileChange { preview_id, .. }
            | Self::StateChange { preview_id, .. }
            | Self::PreviewReady { preview_id, .. } => preview_id,
        }
    }

    pub fn timestamp(&self) -> i64 {
        match self {
            Self::FileChange { timestamp, .. }
            | Self::StateChange { timestamp, .. }
            | Self::PreviewReady { timestamp, .. } => *timestamp,
        }
    }
}

/// Messages exchanged on the storage channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StorageMessage {
    /// Full snapshot of the persistent key-value store, posted after every
    /// instrumented write. `source` is the writer's tab identity and is the
    /// only defense against replaying our own snapshot.
    StorageSync {
        storage: HashMap<String, String>,
        source: TabId,
        timestamp: i64,
    },
}
