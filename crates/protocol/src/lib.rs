//! Portside Protocol
//!
//! Shared types for the cross-context preview synchronization subsystem.
//! These types are serialized as JSON on the broadcast channels.

use std::time::{SystemTime, UNIX_EPOCH};

// Re-exports
pub mod messages;
pub mod types;

pub use messages::{PreviewMessage, StorageMessage};
pub use types::*;

/// Broadcast channel carrying preview lifecycle/refresh messages.
/// Any context opening the same name interoperates.
pub const PREVIEW_CHANNEL: &str = "portside:preview";

/// Broadcast channel carrying storage mirror snapshots.
pub const STORAGE_CHANNEL: &str = "portside:storage";

/// Fixed sandbox-hosting domain suffix. Preview URLs have the shape
/// `https://{previewId}.{suffix}`; changing this breaks previewId
/// derivation for every peer context.
pub const SANDBOX_HOST_SUFFIX: &str = "preview.portside.dev";

/// Current wall-clock time in milliseconds since the Unix epoch.
/// Used as the generation timestamp on broadcast messages.
pub fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}
