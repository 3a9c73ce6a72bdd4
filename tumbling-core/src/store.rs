//! Buffer of the windows that are not released yet. Windows are keyed by their start
//! (nanoseconds) and hold the payloads in arrival order plus a header snapshot taken from the
//! first record of the window.
//!
//! Two interchangeable backends exist, an in-memory one and a persistent one backed by an
//! embedded key value store which survives restarts.

use std::path::Path;

use bytes::Bytes;

use crate::Result;
use crate::config::StoreConfig;
use crate::message::{Headers, Record};

/// In-memory window store.
pub(crate) mod memory;

/// Persistent window store on top of sled.
pub(crate) mod persistent;

pub use memory::InMemoryStore;
pub use persistent::PersistentStore;

/// Snapshot of a buffered window.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WindowEntry {
    /// start of the window in nanoseconds
    pub window_start: i64,
    /// headers of the first record buffered for the window
    pub headers: Headers,
    /// payloads in arrival order
    pub payloads: Vec<Bytes>,
}

/// The configured window store.
#[derive(Debug)]
pub enum WindowStore {
    InMemory(InMemoryStore),
    Persistent(PersistentStore),
}

impl WindowStore {
    pub fn new(config: &StoreConfig) -> Result<Self> {
        Ok(match config {
            StoreConfig::Memory => WindowStore::InMemory(InMemoryStore::new()),
            StoreConfig::Persistent { path } => {
                WindowStore::Persistent(PersistentStore::open(path)?)
            }
        })
    }

    pub fn in_memory() -> Self {
        WindowStore::InMemory(InMemoryStore::new())
    }

    pub fn persistent(path: impl AsRef<Path>) -> Result<Self> {
        Ok(WindowStore::Persistent(PersistentStore::open(path)?))
    }

    /// Starts of all the buffered windows, in no particular order.
    pub fn keys(&self) -> Vec<i64> {
        match self {
            WindowStore::InMemory(store) => store.keys(),
            WindowStore::Persistent(store) => store.keys(),
        }
    }

    /// Appends the record to the window, creating the window if it does not exist yet.
    pub fn put(&self, window_start: i64, record: &Record) -> Result<()> {
        match self {
            WindowStore::InMemory(store) => {
                store.put(window_start, record);
                Ok(())
            }
            WindowStore::Persistent(store) => {
                store.put(window_start, &record.headers, &record.payload)
            }
        }
    }

    /// Snapshot of the window, None if it is not buffered.
    pub fn get(&self, window_start: i64) -> Option<WindowEntry> {
        match self {
            WindowStore::InMemory(store) => store.get(window_start),
            WindowStore::Persistent(store) => store.get(window_start),
        }
    }

    /// Removes the window and returns its last snapshot. Only one of concurrent callers gets
    /// the snapshot, the others see None.
    pub fn delete(&self, window_start: i64) -> Option<WindowEntry> {
        match self {
            WindowStore::InMemory(store) => store.delete(window_start),
            WindowStore::Persistent(store) => store.delete(window_start),
        }
    }

    pub fn contains(&self, window_start: i64) -> bool {
        match self {
            WindowStore::InMemory(store) => store.contains(window_start),
            WindowStore::Persistent(store) => store.contains(window_start),
        }
    }

    /// Start of the oldest buffered window.
    pub fn oldest(&self) -> Option<i64> {
        self.keys().into_iter().min()
    }

    pub fn len(&self) -> usize {
        match self {
            WindowStore::InMemory(store) => store.len(),
            WindowStore::Persistent(store) => store.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Makes sure everything written so far is durable, a no-op for the in-memory store.
    pub async fn flush(&self) -> Result<()> {
        match self {
            WindowStore::InMemory(_) => Ok(()),
            WindowStore::Persistent(store) => store.flush().await,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use tempfile::TempDir;

    use super::*;

    fn record(payload: &'static str) -> Record {
        Record::new(payload, Headers::new())
    }

    fn stores() -> (Vec<WindowStore>, TempDir) {
        let dir = TempDir::new().unwrap();
        let stores = vec![
            WindowStore::in_memory(),
            WindowStore::persistent(dir.path().join("windows")).unwrap(),
        ];
        (stores, dir)
    }

    #[test]
    fn test_backends_behave_alike() {
        let (stores, _dir) = stores();
        for store in stores {
            assert!(store.is_empty());
            assert_eq!(store.oldest(), None);

            store.put(20, &record("c")).unwrap();
            store.put(10, &record("a")).unwrap();
            store.put(10, &record("b")).unwrap();

            let mut keys = store.keys();
            keys.sort();
            assert_eq!(keys, vec![10, 20]);
            assert_eq!(store.oldest(), Some(10));
            assert_eq!(store.len(), 2);

            let entry = store.get(10).unwrap();
            assert_eq!(entry.window_start, 10);
            assert_eq!(entry.payloads, vec![Bytes::from("a"), Bytes::from("b")]);
            // get does not remove
            assert!(store.get(10).is_some());

            let entry = store.delete(10).unwrap();
            assert_eq!(entry.payloads.len(), 2);
            assert!(store.delete(10).is_none());
            assert!(store.get(10).is_none());
            assert_eq!(store.keys(), vec![20]);
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_put_and_delete() {
        let (stores, _dir) = stores();
        for store in stores {
            let store = Arc::new(store);
            let mut handles = Vec::new();
            for task in 0..8i64 {
                let store = Arc::clone(&store);
                handles.push(tokio::spawn(async move {
                    for i in 0..50i64 {
                        store.put(i % 5, &record("x")).unwrap();
                        store.put(100 + task, &record("y")).unwrap();
                    }
                }));
            }
            for handle in handles {
                handle.await.unwrap();
            }

            let total: usize = (0..5).map(|k| store.get(k).unwrap().payloads.len()).sum();
            assert_eq!(total, 8 * 50);

            // racing deletes hand out the window exactly once
            let mut deletes = Vec::new();
            for _ in 0..4 {
                let store = Arc::clone(&store);
                deletes.push(tokio::spawn(async move { store.delete(100).is_some() }));
            }
            let mut winners = 0;
            for delete in deletes {
                if delete.await.unwrap() {
                    winners += 1;
                }
            }
            assert_eq!(winners, 1);
        }
    }
}
