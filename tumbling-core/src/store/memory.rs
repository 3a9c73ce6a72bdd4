use bytes::Bytes;
use dashmap::DashMap;

use crate::message::Record;
use crate::store::WindowEntry;

/// Windows kept in a concurrent map, each window being the list of its records in arrival
/// order. Appends only contend on the shard holding the window.
#[derive(Debug, Default)]
pub struct InMemoryStore {
    windows: DashMap<i64, Vec<Record>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn keys(&self) -> Vec<i64> {
        self.windows.iter().map(|w| *w.key()).collect()
    }

    pub(crate) fn put(&self, window_start: i64, record: &Record) {
        self.windows
            .entry(window_start)
            .or_default()
            .push(record.clone());
    }

    pub(crate) fn get(&self, window_start: i64) -> Option<WindowEntry> {
        self.windows
            .get(&window_start)
            .map(|records| snapshot(window_start, records.value()))
    }

    pub(crate) fn delete(&self, window_start: i64) -> Option<WindowEntry> {
        self.windows
            .remove(&window_start)
            .map(|(_, records)| snapshot(window_start, &records))
    }

    pub(crate) fn contains(&self, window_start: i64) -> bool {
        self.windows.contains_key(&window_start)
    }

    pub(crate) fn len(&self) -> usize {
        self.windows.len()
    }
}

fn snapshot(window_start: i64, records: &[Record]) -> WindowEntry {
    WindowEntry {
        window_start,
        headers: records
            .first()
            .map(|r| r.headers.as_ref().clone())
            .unwrap_or_default(),
        payloads: records.iter().map(|r| Bytes::clone(&r.payload)).collect(),
    }
}
