//! Project file watcher
//!
//! Turns filesystem events under the project root into file-change
//! notifications on the synchronizer, collapsing bursts (a build step
//! touching many files) before notifying. The watcher is a producer for
//! the synchronizer, nothing more; all broadcasting and debouncing of the
//! visible refresh stays in the synchronizer.

use std::path::Path;
use std::time::Duration;

use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::synchronizer::SynchronizerHandle;

const QUIET_WINDOW_MS: u64 = 150;

pub struct ProjectWatcher {
    task: Option<JoinHandle<()>>,
}

impl ProjectWatcher {
    /// Watch `root` recursively and notify `sync` when files change.
    /// A missing root disables the watcher cleanly instead of failing.
    pub fn spawn(root: &Path, sync: SynchronizerHandle) -> anyhow::Result<Self> {
        if !root.exists() {
            info!(
                component = "watcher",
                event = "watcher.root_missing",
                path = %root.display(),
                "project root missing, file watching disabled"
            );
            return Ok(Self { task: None });
        }

        let (tx, mut rx) = mpsc::unbounded_channel::<()>();
        let mut watcher = RecommendedWatcher::new(
            move |res: Result<Event, notify::Error>| match res {
                Ok(event) => {
                    if matches_supported_event_kind(&event.kind) {
                        let _ = tx.send(());
                    }
                }
                Err(err) => {
                    warn!(
                        component = "watcher",
                        event = "watcher.fs_event_error",
                        error = %err,
                        "file watcher event error"
                    );
                }
            },
            notify::Config::default(),
        )?;
        watcher.watch(root, RecursiveMode::Recursive)?;

        info!(
            component = "watcher",
            event = "watcher.started",
            path = %root.display(),
            "watching project root"
        );

        let task = tokio::spawn(async move {
            // Moved in so the watcher lives as long as the task.
            let _watcher = watcher;
            while rx.recv().await.is_some() {
                // Collapse the burst: wait until the tree has been quiet.
                loop {
                    match tokio::time::timeout(
                        Duration::from_millis(QUIET_WINDOW_MS),
                        rx.recv(),
                    )
                    .await
                    {
                        Ok(Some(())) => continue,
                        Ok(None) => return,
                        Err(_) => break,
                    }
                }
                sync.notify_files_changed().await;
            }
        });

        Ok(Self { task: Some(task) })
    }

    pub fn close(self) {
        if let Some(task) = self.task {
            task.abort();
        }
    }
}

fn matches_supported_event_kind(kind: &EventKind) -> bool {
    matches!(
        kind,
        EventKind::Create(_) | EventKind::Modify(_) | EventKind::Remove(_)
    )
}
