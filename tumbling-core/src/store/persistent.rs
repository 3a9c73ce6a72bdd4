//! Windows persisted in sled. Every window owns two keys, both made of a 3 byte namespace
//! followed by the big endian window start:
//!
//! - `TS:<start>` holds the payloads as `u32` big endian length prefixed frames. Appends go
//!   through the merge operator so a put never reads the existing value back.
//! - `HD:<start>` holds the JSON encoded header snapshot of the first record, restricted to
//!   primitive values. Only the put whose merge created `TS:<start>` writes it, later appends
//!   neither read nor encode headers.
//!
//! A concurrent set mirrors the live window starts so that enumerating windows never touches
//! the disk. It is rebuilt by scanning the `TS:` namespace when the store is opened.

use std::collections::HashMap;
use std::path::Path;

use bytes::{Buf, BufMut, Bytes};
use dashmap::DashSet;
use sled::{Db, IVec};
use tracing::{debug, error, info, warn};

use crate::message::{HeaderValue, Headers};
use crate::store::WindowEntry;
use crate::{Error, Result};

const PAYLOADS_PREFIX: &[u8; 3] = b"TS:";
const HEADERS_PREFIX: &[u8; 3] = b"HD:";
const KEY_LEN: usize = 3 + 8;
const FRAME_LEN_SIZE: usize = 4;

#[derive(Debug)]
pub struct PersistentStore {
    db: Db,
    live: DashSet<i64>,
}

impl PersistentStore {
    /// Opens (or creates) the store and recovers the windows buffered by a previous run.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let db = sled::open(path)?;
        db.set_merge_operator(append_frames);

        let live = DashSet::new();
        for item in db.scan_prefix(PAYLOADS_PREFIX) {
            let (key, _) = item?;
            match window_start_of(&key) {
                Some(window_start) => {
                    live.insert(window_start);
                }
                None => warn!(key = ?key, "Ignoring malformed window key"),
            }
        }
        // snapshots whose payloads were removed under a racing put
        let mut orphans = 0;
        for item in db.scan_prefix(HEADERS_PREFIX) {
            let (key, _) = item?;
            if window_start_of(&key).is_none_or(|start| !live.contains(&start)) {
                db.remove(key)?;
                orphans += 1;
            }
        }
        info!(
            path = %path.display(),
            recovered = live.len(),
            orphans,
            "Opened persistent window store"
        );

        Ok(Self { db, live })
    }

    pub(crate) fn keys(&self) -> Vec<i64> {
        self.live.iter().map(|w| *w).collect()
    }

    pub(crate) fn contains(&self, window_start: i64) -> bool {
        self.live.contains(&window_start)
    }

    pub(crate) fn len(&self) -> usize {
        self.live.len()
    }

    pub(crate) fn put(&self, window_start: i64, headers: &Headers, payload: &[u8]) -> Result<()> {
        self.write(window_start, headers, payload).inspect_err(|e| {
            error!(window_start, ?e, "Failed to persist record into window");
        })
    }

    fn write(&self, window_start: i64, headers: &Headers, payload: &[u8]) -> Result<()> {
        let frame_len = u32::try_from(payload.len())
            .map_err(|_| Error::Store(format!("payload too large: {} bytes", payload.len())))?;

        let mut frame = Vec::with_capacity(FRAME_LEN_SIZE + payload.len());
        frame.put_u32(frame_len);
        frame.put_slice(payload);
        let merged = self.db.merge(key(PAYLOADS_PREFIX, window_start), &frame)?;

        // the merged value being only this frame means this put created the window, it owns the
        // header snapshot and overwrites one left behind by a delete racing an earlier put
        if merged.is_none_or(|merged| merged.len() == frame.len()) {
            let snapshot = serde_json::to_vec(&primitive_headers(headers))?;
            self.db.insert(key(HEADERS_PREFIX, window_start), snapshot)?;
            debug!(window_start, "Persisted header snapshot of new window");
        }

        self.live.insert(window_start);
        Ok(())
    }

    pub(crate) fn get(&self, window_start: i64) -> Option<WindowEntry> {
        let payloads = match self.db.get(key(PAYLOADS_PREFIX, window_start)) {
            Ok(Some(payloads)) => payloads,
            Ok(None) => return None,
            Err(e) => {
                error!(window_start, ?e, "Failed to read window payloads");
                return None;
            }
        };
        let headers = match self.db.get(key(HEADERS_PREFIX, window_start)) {
            Ok(headers) => headers,
            Err(e) => {
                error!(window_start, ?e, "Failed to read window headers");
                None
            }
        };
        snapshot(window_start, headers, &payloads)
    }

    pub(crate) fn delete(&self, window_start: i64) -> Option<WindowEntry> {
        // evicting before removing keeps the mirror a superset of the stored windows when a put
        // races with the delete, a stale entry is dropped by the next delete
        self.live.remove(&window_start);
        // removing the payloads is the linearization point, only one caller sees them
        let payloads = match self.db.remove(key(PAYLOADS_PREFIX, window_start)) {
            Ok(payloads) => payloads,
            Err(e) => {
                error!(window_start, ?e, "Failed to remove window payloads");
                return None;
            }
        };
        let headers = match self.db.remove(key(HEADERS_PREFIX, window_start)) {
            Ok(headers) => headers,
            Err(e) => {
                error!(window_start, ?e, "Failed to remove window headers");
                None
            }
        };

        snapshot(window_start, headers, &payloads?)
    }

    pub(crate) async fn flush(&self) -> Result<()> {
        self.db.flush_async().await?;
        Ok(())
    }
}

fn snapshot(window_start: i64, headers: Option<IVec>, payloads: &[u8]) -> Option<WindowEntry> {
    let payloads = match decode_frames(payloads) {
        Ok(payloads) => payloads,
        Err(e) => {
            error!(window_start, ?e, "Dropping window with corrupted payloads");
            return None;
        }
    };
    let headers = match headers.map(|h| serde_json::from_slice::<Headers>(&h)) {
        Some(Ok(headers)) => headers,
        Some(Err(e)) => {
            warn!(window_start, ?e, "Window header snapshot unreadable, using no headers");
            Headers::new()
        }
        None => Headers::new(),
    };
    Some(WindowEntry {
        window_start,
        headers,
        payloads,
    })
}

fn key(prefix: &[u8; 3], window_start: i64) -> [u8; KEY_LEN] {
    let mut key = [0u8; KEY_LEN];
    key[..3].copy_from_slice(prefix);
    key[3..].copy_from_slice(&window_start.to_be_bytes());
    key
}

fn window_start_of(key: &[u8]) -> Option<i64> {
    let start: [u8; 8] = key.get(3..KEY_LEN)?.try_into().ok()?;
    (key.len() == KEY_LEN).then(|| i64::from_be_bytes(start))
}

/// Frames are self delimiting, appending is plain concatenation.
fn append_frames(_key: &[u8], existing: Option<&[u8]>, frame: &[u8]) -> Option<Vec<u8>> {
    let mut merged = Vec::with_capacity(existing.map_or(0, <[u8]>::len) + frame.len());
    if let Some(existing) = existing {
        merged.extend_from_slice(existing);
    }
    merged.extend_from_slice(frame);
    Some(merged)
}

fn decode_frames(mut raw: &[u8]) -> Result<Vec<Bytes>> {
    let mut payloads = Vec::new();
    while raw.has_remaining() {
        if raw.remaining() < FRAME_LEN_SIZE {
            return Err(Error::Store("truncated frame length".to_string()));
        }
        let len = raw.get_u32() as usize;
        if raw.remaining() < len {
            return Err(Error::Store(format!(
                "truncated frame, expected {len} bytes, found {}",
                raw.remaining()
            )));
        }
        payloads.push(Bytes::copy_from_slice(&raw[..len]));
        raw.advance(len);
    }
    Ok(payloads)
}

fn primitive_headers(headers: &Headers) -> HashMap<&String, &HeaderValue> {
    headers.iter().filter(|(_, v)| v.is_primitive()).collect()
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;

    #[test]
    fn test_key_layout() {
        let k = key(PAYLOADS_PREFIX, 10_000_000_000);
        assert_eq!(&k[..3], b"TS:");
        assert_eq!(&k[3..], &10_000_000_000i64.to_be_bytes());
        assert_eq!(window_start_of(&k), Some(10_000_000_000));
        assert_eq!(window_start_of(b"TS:1"), None);
    }

    #[test]
    fn test_frames() {
        let merged = append_frames(b"k", None, &[0, 0, 0, 1, b'a']).unwrap();
        let merged = append_frames(b"k", Some(&merged), &[0, 0, 0, 0]).unwrap();
        let merged = append_frames(b"k", Some(&merged), &[0, 0, 0, 2, b'b', b'c']).unwrap();
        assert_eq!(
            decode_frames(&merged).unwrap(),
            vec![Bytes::from("a"), Bytes::new(), Bytes::from("bc")]
        );
        assert!(decode_frames(&[0, 0, 0, 5, b'a']).is_err());
        assert!(decode_frames(&[0, 0]).is_err());
    }

    #[test]
    fn test_header_snapshot_filtered() {
        let dir = TempDir::new().unwrap();
        let store = PersistentStore::open(dir.path()).unwrap();

        let mut first = Headers::new();
        first.insert("id".to_string(), "abc".into());
        first.insert("count".to_string(), 3i64.into());
        first.insert("flag".to_string(), true.into());
        first.insert("raw".to_string(), HeaderValue::Bytes(Bytes::from_static(b"\x00\x01")));
        store.put(0, &first, b"a").unwrap();

        let mut second = Headers::new();
        second.insert("id".to_string(), "def".into());
        store.put(0, &second, b"b").unwrap();

        let entry = store.get(0).unwrap();
        assert_eq!(entry.headers.len(), 3);
        assert_eq!(entry.headers["id"], HeaderValue::String("abc".to_string()));
        assert_eq!(entry.headers["count"], HeaderValue::Int(3));
        assert_eq!(entry.headers["flag"], HeaderValue::Bool(true));
        // the binary header is dropped from the snapshot, not the payload
        assert_eq!(entry.payloads, vec![Bytes::from("a"), Bytes::from("b")]);
    }

    #[test]
    fn test_recovers_windows_after_restart() {
        let dir = TempDir::new().unwrap();
        {
            let store = PersistentStore::open(dir.path()).unwrap();
            store.put(0, &Headers::new(), b"a").unwrap();
            store.put(0, &Headers::new(), b"b").unwrap();
            store.put(10, &Headers::new(), b"c").unwrap();
            store.put(20, &Headers::new(), b"d").unwrap();
            assert!(store.delete(20).is_some());
            store.db.flush().unwrap();
        }

        let store = PersistentStore::open(dir.path()).unwrap();
        let mut keys = store.keys();
        keys.sort();
        assert_eq!(keys, vec![0, 10]);
        assert_eq!(
            store.get(0).unwrap().payloads,
            vec![Bytes::from("a"), Bytes::from("b")]
        );

        // appends continue where the previous run stopped
        store.put(0, &Headers::new(), b"e").unwrap();
        assert_eq!(store.delete(0).unwrap().payloads.len(), 3);
    }

    fn headers(id: &str) -> Headers {
        let mut headers = Headers::new();
        headers.insert("id".to_string(), id.into());
        headers
    }

    #[test]
    fn test_window_recreated_over_orphan_snapshot() {
        let dir = TempDir::new().unwrap();
        let store = PersistentStore::open(dir.path()).unwrap();
        store.put(0, &headers("first"), b"a").unwrap();
        assert!(store.delete(0).is_some());

        // a put whose payloads were removed by the delete left its snapshot behind
        let orphan = serde_json::to_vec(&headers("stale")).unwrap();
        store.db.insert(key(HEADERS_PREFIX, 0), orphan).unwrap();

        store.put(0, &headers("second"), b"b").unwrap();
        store.put(0, &headers("third"), b"c").unwrap();
        let entry = store.delete(0).unwrap();
        assert_eq!(entry.headers, headers("second"));
        assert_eq!(entry.payloads, vec![Bytes::from("b"), Bytes::from("c")]);
    }

    #[test]
    fn test_orphan_snapshot_removed_on_open() {
        let dir = TempDir::new().unwrap();
        {
            let store = PersistentStore::open(dir.path()).unwrap();
            store.put(0, &headers("live"), b"a").unwrap();
            let orphan = serde_json::to_vec(&headers("stale")).unwrap();
            store.db.insert(key(HEADERS_PREFIX, 10), orphan).unwrap();
            store.db.flush().unwrap();
        }

        let store = PersistentStore::open(dir.path()).unwrap();
        assert_eq!(store.keys(), vec![0]);
        assert!(store.db.get(key(HEADERS_PREFIX, 10)).unwrap().is_none());
        assert_eq!(store.get(0).unwrap().headers, headers("live"));
    }

    #[test]
    fn test_stale_mirror_entry_dropped_on_delete() {
        let dir = TempDir::new().unwrap();
        let store = PersistentStore::open(dir.path()).unwrap();
        store.put(0, &Headers::new(), b"a").unwrap();
        store.db.remove(key(PAYLOADS_PREFIX, 0)).unwrap();

        assert_eq!(store.keys(), vec![0]);
        assert!(store.get(0).is_none());
        assert_eq!(store.keys(), vec![0]);
        assert!(store.delete(0).is_none());
        assert!(store.keys().is_empty());
    }
}
