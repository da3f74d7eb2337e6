//! Storage mirror
//!
//! Intercepts writes to the process-wide persistent key-value store and
//! mirrors them to sibling contexts: after the underlying write completes,
//! a full snapshot of the store is posted on the storage channel tagged
//! with the local tab identity. Inbound snapshots from other tabs are
//! replayed through the store's primitive write path — never through the
//! instrumented wrapper, which would re-broadcast what was just received
//! and loop forever — and then every known preview is refreshed, because
//! there is no way to know which keys a preview depends on.

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex, RwLock};

use bytes::Bytes;
use rusqlite::{params, Connection, OptionalExtension};
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use portside_protocol::{now_millis, StorageMessage, TabId};

use crate::bus::{Broadcast, BusChannel};
use crate::synchronizer::SynchronizerHandle;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("storage database error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("storage backend error: {0}")]
    Backend(String),
}

/// The process-wide persistent key-value store the mirror instruments.
pub trait KeyValueStore: Send + Sync {
    fn get(&self, key: &str) -> Option<String>;
    fn set(&self, key: &str, value: &str) -> Result<(), StorageError>;
    fn keys(&self) -> Vec<String>;
}

/// Volatile store for tests and contexts without a data dir.
#[derive(Default)]
pub struct MemoryStore {
    entries: RwLock<HashMap<String, String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KeyValueStore for MemoryStore {
    fn get(&self, key: &str) -> Option<String> {
        self.entries
            .read()
            .expect("storage lock poisoned")
            .get(key)
            .cloned()
    }

    fn set(&self, key: &str, value: &str) -> Result<(), StorageError> {
        self.entries
            .write()
            .expect("storage lock poisoned")
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn keys(&self) -> Vec<String> {
        self.entries
            .read()
            .expect("storage lock poisoned")
            .keys()
            .cloned()
            .collect()
    }
}

/// Durable store backed by a single `kv` table.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    pub fn open(path: &Path) -> Result<Self, StorageError> {
        let conn = Connection::open(path)?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS kv (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL
            )",
        )?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Open the store at its default location under the data dir.
    pub fn open_default() -> Result<Self, StorageError> {
        Self::open(&crate::paths::db_path())
    }
}

impl KeyValueStore for SqliteStore {
    fn get(&self, key: &str) -> Option<String> {
        let conn = self.conn.lock().expect("storage lock poisoned");
        conn.query_row("SELECT value FROM kv WHERE key = ?1", params![key], |row| {
            row.get(0)
        })
        .optional()
        .ok()
        .flatten()
    }

    fn set(&self, key: &str, value: &str) -> Result<(), StorageError> {
        let conn = self.conn.lock().expect("storage lock poisoned");
        conn.execute(
            "INSERT INTO kv (key, value) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            params![key, value],
        )?;
        Ok(())
    }

    fn keys(&self) -> Vec<String> {
        let conn = self.conn.lock().expect("storage lock poisoned");
        let mut stmt = match conn.prepare("SELECT key FROM kv ORDER BY key") {
            Ok(stmt) => stmt,
            Err(_) => return Vec::new(),
        };
        stmt.query_map([], |row| row.get::<_, String>(0))
            .map(|rows| rows.filter_map(Result::ok).collect())
            .unwrap_or_default()
    }
}

/// The writer-interceptor for the store. One per context; the only
/// authorized instrumentation point for `set`.
pub struct StorageMirror {
    store: Arc<dyn KeyValueStore>,
    channel: BusChannel,
    tab: TabId,
    listener: JoinHandle<()>,
}

impl StorageMirror {
    /// Spawn a mirror using the process-wide tab identity.
    pub fn spawn(
        bus: &dyn Broadcast,
        channel_name: &str,
        store: Arc<dyn KeyValueStore>,
        sync: SynchronizerHandle,
    ) -> Self {
        Self::spawn_with_tab(bus, channel_name, store, sync, crate::tab::tab_id().clone())
    }

    /// Spawn a mirror with an explicit tab identity (tests model several
    /// contexts inside one process).
    pub fn spawn_with_tab(
        bus: &dyn Broadcast,
        channel_name: &str,
        store: Arc<dyn KeyValueStore>,
        sync: SynchronizerHandle,
        tab: TabId,
    ) -> Self {
        let channel = bus.open(channel_name);
        let mut inbound = channel.subscribe();

        let listener_store = Arc::clone(&store);
        let listener_tab = tab.clone();
        let listener = tokio::spawn(async move {
            while let Some(payload) = inbound.recv().await {
                handle_inbound(payload, &listener_store, &listener_tab, &sync).await;
            }
        });

        Self {
            store,
            channel,
            tab,
            listener,
        }
    }

    pub fn get(&self, key: &str) -> Option<String> {
        self.store.get(key)
    }

    pub fn keys(&self) -> Vec<String> {
        self.store.keys()
    }

    /// Instrumented write: the underlying write first, then a full
    /// snapshot broadcast tagged with this tab's identity.
    pub fn set(&self, key: &str, value: &str) -> Result<(), StorageError> {
        self.store.set(key, value)?;
        self.broadcast_snapshot();
        Ok(())
    }

    fn broadcast_snapshot(&self) {
        let storage: HashMap<String, String> = self
            .store
            .keys()
            .into_iter()
            .filter_map(|key| self.store.get(&key).map(|value| (key, value)))
            .collect();
        let msg = StorageMessage::StorageSync {
            storage,
            source: self.tab.clone(),
            timestamp: now_millis(),
        };
        match serde_json::to_vec(&msg) {
            Ok(json) => self.channel.post(Bytes::from(json)),
            Err(err) => warn!(
                component = "storage",
                event = "storage.broadcast.encode_failed",
                error = %err,
                "failed to encode storage snapshot"
            ),
        }
    }

    /// Stop mirroring: the listener exits and the channel closes.
    pub fn close(self) {
        self.listener.abort();
        self.channel.close();
    }
}

async fn handle_inbound(
    payload: Bytes,
    store: &Arc<dyn KeyValueStore>,
    tab: &TabId,
    sync: &SynchronizerHandle,
) {
    let msg = match serde_json::from_slice::<StorageMessage>(&payload) {
        Ok(msg) => msg,
        Err(err) => {
            debug!(
                component = "storage",
                event = "storage.message.unrecognized",
                error = %err,
                "dropping unrecognized storage channel payload"
            );
            return;
        }
    };
    let StorageMessage::StorageSync {
        storage,
        source,
        timestamp,
    } = msg;

    // Self-echo guard. The in-process write path never calls back into
    // this handler, but the fallback bus delivers local posts locally.
    if &source == tab {
        debug!(
            component = "storage",
            event = "storage.sync.self_echo",
            "ignoring own storage snapshot"
        );
        return;
    }

    let mut replayed = 0usize;
    let mut failed = 0usize;
    for (key, value) in &storage {
        // Primitive write path, not the instrumented one: replaying must
        // not re-broadcast what was just received.
        match store.set(key, value) {
            Ok(()) => replayed += 1,
            Err(err) => {
                // One bad entry must not abort the rest of the snapshot.
                failed += 1;
                warn!(
                    component = "storage",
                    event = "storage.replay.key_failed",
                    key = %key,
                    error = %err,
                    "skipping key during snapshot replay"
                );
            }
        }
    }
    debug!(
        component = "storage",
        event = "storage.sync.replayed",
        source = %source,
        timestamp,
        replayed,
        failed,
        "replayed storage snapshot from sibling tab"
    );

    // A mirrored change may affect any preview-rendered state; there is no
    // way to know which keys matter, so refresh them all.
    sync.refresh_all().await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::sleep;

    use portside_protocol::{PortEvent, SANDBOX_HOST_SUFFIX, STORAGE_CHANNEL};

    use crate::bus::{LocalBus, SharedBus};
    use crate::synchronizer::{PreviewSynchronizer, SyncConfig};

    fn url(label: &str) -> String {
        format!("https://{label}.{SANDBOX_HOST_SUFFIX}")
    }

    struct QuotaStore {
        inner: MemoryStore,
        rejected: String,
    }

    impl KeyValueStore for QuotaStore {
        fn get(&self, key: &str) -> Option<String> {
            self.inner.get(key)
        }

        fn set(&self, key: &str, value: &str) -> Result<(), StorageError> {
            if key == self.rejected {
                return Err(StorageError::Backend("quota exceeded".to_string()));
            }
            self.inner.set(key, value)
        }

        fn keys(&self) -> Vec<String> {
            self.inner.keys()
        }
    }

    #[test]
    fn memory_store_roundtrip() {
        let store = MemoryStore::new();
        assert_eq!(store.get("theme"), None);
        store.set("theme", "dark").unwrap();
        assert_eq!(store.get("theme").as_deref(), Some("dark"));
        store.set("theme", "light").unwrap();
        assert_eq!(store.get("theme").as_deref(), Some("light"));
        assert_eq!(store.keys(), vec!["theme".to_string()]);
    }

    #[test]
    fn sqlite_store_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("portside.db");
        let store = SqliteStore::open(&path).unwrap();
        store.set("theme", "dark").unwrap();
        store.set("zoom", "1.5").unwrap();
        store.set("theme", "light").unwrap();
        drop(store);

        // Values survive reopening.
        let store = SqliteStore::open(&path).unwrap();
        assert_eq!(store.get("theme").as_deref(), Some("light"));
        assert_eq!(store.get("zoom").as_deref(), Some("1.5"));
        assert_eq!(store.keys(), vec!["theme".to_string(), "zoom".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn cross_tab_mirror_converges() {
        let bus = SharedBus::new();
        let sync_a = PreviewSynchronizer::spawn(&bus, SyncConfig::default());
        let sync_b = PreviewSynchronizer::spawn(&bus, SyncConfig::default());

        let store_a: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
        let store_b: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
        let mirror_a = StorageMirror::spawn_with_tab(
            &bus,
            STORAGE_CHANNEL,
            Arc::clone(&store_a),
            sync_a.clone(),
            TabId::generate(),
        );
        let mirror_b = StorageMirror::spawn_with_tab(
            &bus,
            STORAGE_CHANNEL,
            Arc::clone(&store_b),
            sync_b.clone(),
            TabId::generate(),
        );

        mirror_a.set("theme", "dark").unwrap();
        mirror_a.set("zoom", "1.5").unwrap();
        sleep(Duration::from_millis(10)).await;

        assert_eq!(mirror_b.get("theme").as_deref(), Some("dark"));
        assert_eq!(mirror_b.get("zoom").as_deref(), Some("1.5"));
        // A's own store was written once, by A itself.
        assert_eq!(mirror_a.get("theme").as_deref(), Some("dark"));

        mirror_a.close();
        mirror_b.close();
        sync_a.close().await;
        sync_b.close().await;
    }

    #[tokio::test(start_paused = true)]
    async fn mirrored_write_refreshes_sibling_previews() {
        let bus = SharedBus::new();
        let sync_a = PreviewSynchronizer::spawn(&bus, SyncConfig::default());
        let sync_b = PreviewSynchronizer::spawn(&bus, SyncConfig::default());

        sync_b
            .handle_port_event(PortEvent::PortOpened {
                port: 3000,
                url: url("abc"),
            })
            .await;
        sleep(Duration::from_millis(1)).await;
        let mut list_rx = sync_b.subscribe_previews();

        let mirror_a = StorageMirror::spawn_with_tab(
            &bus,
            STORAGE_CHANNEL,
            Arc::new(MemoryStore::new()),
            sync_a.clone(),
            TabId::generate(),
        );
        let mirror_b = StorageMirror::spawn_with_tab(
            &bus,
            STORAGE_CHANNEL,
            Arc::new(MemoryStore::new()),
            sync_b.clone(),
            TabId::generate(),
        );

        mirror_a.set("theme", "dark").unwrap();
        sleep(Duration::from_millis(400)).await;

        // B's preview went through the two-phase ready toggle.
        let mut saw_not_ready = false;
        let mut ready_again = false;
        while let Ok(list) = list_rx.try_recv() {
            if let Some(info) = list.iter().find(|info| info.port == 3000) {
                if !info.ready {
                    saw_not_ready = true;
                } else if saw_not_ready {
                    ready_again = true;
                }
            }
        }
        assert!(saw_not_ready && ready_again);

        mirror_a.close();
        mirror_b.close();
        sync_a.close().await;
        sync_b.close().await;
    }

    #[tokio::test(start_paused = true)]
    async fn self_echo_never_triggers_replay_or_refresh() {
        // The fallback bus loops posts back to the poster, so the guard is
        // exercised by a mirror talking to itself.
        let bus = LocalBus::new();
        let sync = PreviewSynchronizer::spawn(&bus, SyncConfig::default());
        sync.handle_port_event(PortEvent::PortOpened {
            port: 3000,
            url: url("abc"),
        })
        .await;
        sleep(Duration::from_millis(1)).await;
        let mut list_rx = sync.subscribe_previews();

        let mirror = StorageMirror::spawn_with_tab(
            &bus,
            STORAGE_CHANNEL,
            Arc::new(MemoryStore::new()),
            sync.clone(),
            TabId::generate(),
        );
        mirror.set("theme", "dark").unwrap();
        sleep(Duration::from_millis(400)).await;

        // No refresh toggle: the echoed snapshot was ignored.
        assert!(list_rx.try_recv().is_err());
        assert_eq!(mirror.get("theme").as_deref(), Some("dark"));

        mirror.close();
        sync.close().await;
    }

    #[tokio::test(start_paused = true)]
    async fn replay_skips_failing_keys() {
        let bus = SharedBus::new();
        let sync_a = PreviewSynchronizer::spawn(&bus, SyncConfig::default());
        let sync_b = PreviewSynchronizer::spawn(&bus, SyncConfig::default());

        let store_b: Arc<dyn KeyValueStore> = Arc::new(QuotaStore {
            inner: MemoryStore::new(),
            rejected: "bad".to_string(),
        });
        let mirror_a = StorageMirror::spawn_with_tab(
            &bus,
            STORAGE_CHANNEL,
            Arc::new(MemoryStore::new()),
            sync_a.clone(),
            TabId::generate(),
        );
        let mirror_b = StorageMirror::spawn_with_tab(
            &bus,
            STORAGE_CHANNEL,
            Arc::clone(&store_b),
            sync_b.clone(),
            TabId::generate(),
        );

        mirror_a.set("bad", "rejected").unwrap();
        mirror_a.set("good", "kept").unwrap();
        sleep(Duration::from_millis(10)).await;

        // The failing key is skipped; the rest of the snapshot lands.
        assert_eq!(mirror_b.get("bad"), None);
        assert_eq!(mirror_b.get("good").as_deref(), Some("kept"));

        mirror_a.close();
        mirror_b.close();
        sync_a.close().await;
        sync_b.close().await;
    }
}
