//! Portside
//!
//! Cross-context preview synchronization and storage mirroring. Keeps
//! sibling contexts (tabs/windows sharing one logical session) consistent
//! while each hosts a live preview of a sandboxed application, with
//! nothing stronger than a best-effort, at-most-once, order-agnostic
//! broadcast underneath. The contract is eventually consistent,
//! idempotent, and safe to no-op — never reliable messaging.

pub mod bus;
pub mod logging;
pub mod paths;
pub mod storage;
pub mod surface;
pub mod synchronizer;
pub mod tab;
pub mod watcher;

mod registry;

pub use bus::{Broadcast, BusChannel, BusReceiver, LocalBus, SharedBus};
pub use storage::{KeyValueStore, MemoryStore, SqliteStore, StorageError, StorageMirror};
pub use surface::PreviewSurface;
pub use synchronizer::{PreviewSynchronizer, SyncConfig, SynchronizerHandle};
pub use tab::tab_id;
pub use watcher::ProjectWatcher;
