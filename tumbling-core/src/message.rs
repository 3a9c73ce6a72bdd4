//! Records flowing into the windowing engine and the output records produced for a released
//! window. Payloads are opaque bytes, the engine only ever looks at a handful of headers.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Event time of the record or of the released window (epoch millis).
pub const EVENT_TIME_HEADER: &str = "eventtime";
/// Watermark propagated by an upstream stage, or the output watermark of a released window.
pub const WATERMARK_HEADER: &str = "watermark";
/// Partition the record was read from.
pub const PARTITION_HEADER: &str = "partition";
pub const WINDOW_START_HEADER: &str = "windowStartTime";
pub const WINDOW_END_HEADER: &str = "windowEndTime";
pub const PARTIAL_HEADER: &str = "partial";

pub type Headers = HashMap<String, HeaderValue>;

/// Value of a record header.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum HeaderValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
    /// Opaque binary value. Kept on the in-memory record but never persisted.
    #[serde(skip)]
    Bytes(Bytes),
}

impl HeaderValue {
    /// Only primitive, string and number values survive in a persisted header snapshot.
    pub fn is_primitive(&self) -> bool {
        !matches!(self, HeaderValue::Bytes(_))
    }

    /// Integer view of the header, numeric strings are accepted.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            HeaderValue::Int(v) => Some(*v),
            HeaderValue::Float(v) => Some(*v as i64),
            HeaderValue::String(s) => s.trim().parse().ok(),
            HeaderValue::Bool(_) | HeaderValue::Bytes(_) => None,
        }
    }
}

impl fmt::Display for HeaderValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HeaderValue::Bool(v) => write!(f, "{v}"),
            HeaderValue::Int(v) => write!(f, "{v}"),
            HeaderValue::Float(v) => write!(f, "{v}"),
            HeaderValue::String(v) => write!(f, "{v}"),
            HeaderValue::Bytes(v) => write!(f, "<{} bytes>", v.len()),
        }
    }
}

impl From<i64> for HeaderValue {
    fn from(value: i64) -> Self {
        HeaderValue::Int(value)
    }
}

impl From<bool> for HeaderValue {
    fn from(value: bool) -> Self {
        HeaderValue::Bool(value)
    }
}

impl From<&str> for HeaderValue {
    fn from(value: &str) -> Self {
        HeaderValue::String(value.to_string())
    }
}

impl From<String> for HeaderValue {
    fn from(value: String) -> Self {
        HeaderValue::String(value)
    }
}

/// The inbound record.
/// NOTE: It is cheap to clone.
#[derive(Debug, Clone, Default)]
pub struct Record {
    /// actual payload of the record, never interpreted by the engine
    pub payload: Bytes,
    /// headers of the record
    pub headers: Arc<Headers>,
}

impl Record {
    pub fn new(payload: impl Into<Bytes>, headers: Headers) -> Self {
        Self {
            payload: payload.into(),
            headers: Arc::new(headers),
        }
    }

    /// Partition id carried by the record, defaults to partition 0.
    pub fn partition(&self) -> u16 {
        self.headers
            .get(PARTITION_HEADER)
            .and_then(HeaderValue::as_i64)
            .and_then(|p| u16::try_from(p).ok())
            .unwrap_or(0)
    }

    /// Watermark already propagated by an upstream stage, if any.
    pub fn upstream_watermark(&self) -> Option<i64> {
        self.headers.get(WATERMARK_HEADER).and_then(HeaderValue::as_i64)
    }
}

/// A record produced out of a released window.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct OutputRecord {
    pub payload: Bytes,
    pub headers: Headers,
}

impl OutputRecord {
    pub fn new(payload: impl Into<Bytes>) -> Self {
        Self {
            payload: payload.into(),
            headers: Headers::new(),
        }
    }

    pub fn with_header(mut self, key: &str, value: impl Into<HeaderValue>) -> Self {
        self.headers.insert(key.to_string(), value.into());
        self
    }

    /// Window bounds (millis) and partial flag, carried by aggregate style outputs.
    pub fn with_window_headers(self, start_ms: i64, end_ms: i64, partial: bool) -> Self {
        self.with_header(WINDOW_START_HEADER, start_ms)
            .with_header(WINDOW_END_HEADER, end_ms)
            .with_header(PARTIAL_HEADER, partial)
    }

    /// Header value as an integer.
    pub fn header_i64(&self, key: &str) -> Option<i64> {
        self.headers.get(key).and_then(HeaderValue::as_i64)
    }
}
