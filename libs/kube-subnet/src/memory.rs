//! In-process directory holding node entries in memory.
//!
//! Every change, including patches written through [`DirectoryClient`], is
//! queued as a [`Notification`] and delivered by [`DirectoryCache::run`],
//! the same way a watch would echo writes back from a real cluster.
use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::{Mutex as AsyncMutex, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::directory::{DirectoryCache, DirectoryClient, DirectoryError, NotificationHandler};
use crate::entry::{Entry, EntryPatch, Notification};

/// Node directory kept in process memory, implementing both
/// [`DirectoryCache`] and [`DirectoryClient`]. Clones share the same entries.
#[derive(Debug, Clone)]
pub struct MemoryDirectory {
    inner: Arc<Mutex<MemoryInner>>,
    tx: mpsc::UnboundedSender<Notification>,
    rx: Arc<AsyncMutex<mpsc::UnboundedReceiver<Notification>>>,
    synced: Arc<AtomicBool>,
}

#[derive(Debug, Default)]
struct MemoryInner {
    entries: BTreeMap<String, Entry>,
    version: u64,
    patches: Vec<(String, EntryPatch)>,
    injected: VecDeque<DirectoryError>,
}

impl MemoryInner {
    fn next_version(&mut self) -> String {
        self.version += 1;
        self.version.to_string()
    }
}

impl Default for MemoryDirectory {
    fn default() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            inner: Arc::default(),
            tx,
            rx: Arc::new(AsyncMutex::new(rx)),
            synced: Arc::default(),
        }
    }
}

impl MemoryDirectory {
    /// empty directory, not yet synced
    pub fn new() -> Self {
        Self::default()
    }

    /// Create or replace an entry, as another cluster component would. The
    /// stored entry gets a fresh resource version.
    pub fn apply(&self, mut entry: Entry) -> Entry {
        let mut guard = self.inner.lock();
        entry.resource_version = Some(guard.next_version());
        let notification = match guard.entries.insert(entry.name.clone(), entry.clone()) {
            Some(old) => Notification::Updated {
                old,
                new: entry.clone(),
            },
            None => Notification::Added(entry.clone()),
        };
        self.notify(notification);
        entry
    }

    /// Delete an entry, returning it if it existed
    pub fn remove(&self, name: &str) -> Option<Entry> {
        let mut guard = self.inner.lock();
        let removed = guard.entries.remove(name);
        if let Some(entry) = &removed {
            self.notify(Notification::Deleted(entry.clone()));
        }
        removed
    }

    /// Make the next patch call fail with `err`. Errors queue up in order.
    pub fn inject_patch_error(&self, err: DirectoryError) {
        self.inner.lock().injected.push_back(err);
    }

    /// every patch accepted so far, oldest first
    pub fn patches(&self) -> Vec<(String, EntryPatch)> {
        self.inner.lock().patches.clone()
    }

    /// number of patches accepted so far
    pub fn patch_count(&self) -> usize {
        self.inner.lock().patches.len()
    }

    /// all entries currently stored
    pub fn entries(&self) -> Vec<Entry> {
        self.inner.lock().entries.values().cloned().collect()
    }

    fn notify(&self, notification: Notification) {
        // the receiver lives as long as `self`
        let _ = self.tx.send(notification);
    }
}

#[async_trait]
impl DirectoryCache for MemoryDirectory {
    fn get(&self, name: &str) -> Result<Entry, DirectoryError> {
        self.inner
            .lock()
            .entries
            .get(name)
            .cloned()
            .ok_or_else(|| DirectoryError::NotFound(name.to_owned()))
    }

    fn has_synced(&self) -> bool {
        self.synced.load(Ordering::Acquire)
    }

    async fn run(
        &self,
        handler: Arc<dyn NotificationHandler>,
        token: CancellationToken,
    ) -> Result<(), DirectoryError> {
        let mut rx = self.rx.lock().await;

        // entries present before the loop started make up the initial list
        while let Ok(notification) = rx.try_recv() {
            handler.handle(notification).await;
        }
        self.synced.store(true, Ordering::Release);
        info!("memory directory synced");

        loop {
            tokio::select! {
                _ = token.cancelled() => {
                    debug!("memory directory delivery loop stopping");
                    return Ok(());
                }
                notification = rx.recv() => match notification {
                    Some(notification) => handler.handle(notification).await,
                    None => return Ok(()),
                }
            }
        }
    }
}

#[async_trait]
impl DirectoryClient for MemoryDirectory {
    async fn patch(&self, name: &str, patch: &EntryPatch) -> Result<(), DirectoryError> {
        let mut guard = self.inner.lock();
        if let Some(err) = guard.injected.pop_front() {
            return Err(err);
        }

        let current = guard
            .entries
            .get(name)
            .cloned()
            .ok_or_else(|| DirectoryError::NotFound(name.to_owned()))?;
        if let Some(expected) = &patch.resource_version
            && current.resource_version.as_ref() != Some(expected)
        {
            return Err(DirectoryError::Conflict {
                name: name.to_owned(),
                message: format!(
                    "expected resource version {expected}, found {:?}",
                    current.resource_version
                ),
            });
        }

        let mut updated = current.clone();
        patch.apply_to(&mut updated);
        updated.resource_version = Some(guard.next_version());
        guard.entries.insert(name.to_owned(), updated.clone());
        guard.patches.push((name.to_owned(), patch.clone()));
        debug!(node = name, keys = ?patch.annotations.keys().collect::<Vec<_>>(), "applied patch");

        self.notify(Notification::Updated {
            old: current,
            new: updated,
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::annotations::*;

    #[derive(Debug, Default)]
    struct Recorder {
        seen: Mutex<Vec<Notification>>,
    }

    #[async_trait]
    impl NotificationHandler for Recorder {
        async fn handle(&self, notification: Notification) {
            self.seen.lock().push(notification);
        }
    }

    #[test]
    fn test_apply_and_get() {
        let dir = MemoryDirectory::new();
        assert!(dir.get("node-1").unwrap_err().is_not_found());

        let first = dir.apply(Entry::new("node-1").with_pod_cidr("10.1.0.0/24"));
        let second = dir.apply(Entry::new("node-1").with_pod_cidr("10.1.0.0/24"));
        assert_ne!(first.resource_version, second.resource_version);
        assert_eq!(dir.get("node-1").unwrap(), second);
        assert_eq!(dir.entries().len(), 1);

        assert_eq!(dir.remove("node-1"), Some(second));
        assert_eq!(dir.remove("node-1"), None);
    }

    #[tokio::test]
    async fn test_patch_checks_version() {
        let dir = MemoryDirectory::new();
        let stored = dir.apply(Entry::new("node-1"));

        let mut patch = EntryPatch {
            resource_version: Some("stale".into()),
            ..Default::default()
        };
        patch
            .annotations
            .insert(BACKEND_TYPE.to_owned(), Some("vxlan".into()));
        let err = dir.patch("node-1", &patch).await.unwrap_err();
        assert!(err.is_conflict());
        assert_eq!(dir.patch_count(), 0);

        patch.resource_version = stored.resource_version.clone();
        dir.patch("node-1", &patch).await.unwrap();
        assert_eq!(dir.patch_count(), 1);
        assert_eq!(dir.get("node-1").unwrap().annotation(BACKEND_TYPE), "vxlan");

        assert!(dir.patch("node-2", &patch).await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_injected_errors() {
        let dir = MemoryDirectory::new();
        dir.apply(Entry::new("node-1"));
        dir.inject_patch_error(DirectoryError::Transport("boom".into()));

        let patch = EntryPatch::default();
        assert_eq!(
            dir.patch("node-1", &patch).await,
            Err(DirectoryError::Transport("boom".into()))
        );
        assert!(dir.patch("node-1", &patch).await.is_ok());
    }

    #[tokio::test]
    async fn test_run_delivers_in_order() {
        let dir = MemoryDirectory::new();
        dir.apply(Entry::new("node-1"));
        assert!(!dir.has_synced());

        let recorder = Arc::new(Recorder::default());
        let token = CancellationToken::new();
        let task = tokio::spawn({
            let dir = dir.clone();
            let recorder = recorder.clone();
            let token = token.clone();
            async move { dir.run(recorder, token).await }
        });

        while !dir.has_synced() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        dir.apply(Entry::new("node-1").with_pod_cidr("10.1.0.0/24"));
        dir.remove("node-1");

        while recorder.seen.lock().len() < 3 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        token.cancel();
        task.await.unwrap().unwrap();

        let seen = recorder.seen.lock();
        assert!(matches!(seen[0], Notification::Added(_)));
        assert!(matches!(seen[1], Notification::Updated { .. }));
        assert!(matches!(seen[2], Notification::Deleted(_)));
    }
}
