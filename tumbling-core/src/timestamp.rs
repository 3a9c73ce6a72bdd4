//! Event time extraction. The assigner is picked once at startup out of the configuration, a
//! misconfigured assigner stops the processor from starting while a record whose timestamp
//! cannot be extracted is rejected on its own.

use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::config::TimestampConfig;
use crate::message::{EVENT_TIME_HEADER, HeaderValue, Record};
use crate::{Error, Result};

/// Extracts the event time (epoch millis) of a record.
pub trait RecordTimestampAssigner {
    fn extract_timestamp(&self, record: &Record) -> Result<i64>;
}

/// Wall clock at the time the record is processed.
#[derive(Debug, Clone, Default)]
pub struct ProcessingTimeAssigner;

impl RecordTimestampAssigner for ProcessingTimeAssigner {
    fn extract_timestamp(&self, _record: &Record) -> Result<i64> {
        Ok(Utc::now().timestamp_millis())
    }
}

/// Event time carried in a header, either epoch millis or an RFC3339 string.
#[derive(Debug, Clone)]
pub struct HeaderAssigner {
    name: String,
    fallback_to_processing_time: bool,
}

impl HeaderAssigner {
    pub fn new(name: impl Into<String>) -> Result<Self> {
        let name = name.into();
        if name.trim().is_empty() {
            return Err(Error::Config("timestamp header name is empty".to_string()));
        }
        Ok(Self {
            name,
            fallback_to_processing_time: false,
        })
    }

    /// Falls back to the processing time when the header is absent.
    pub fn or_processing_time(mut self) -> Self {
        self.fallback_to_processing_time = true;
        self
    }
}

impl RecordTimestampAssigner for HeaderAssigner {
    fn extract_timestamp(&self, record: &Record) -> Result<i64> {
        match record.headers.get(&self.name) {
            Some(value) => header_millis(value).ok_or_else(|| {
                Error::Timestamp(format!(
                    "header {} has no usable timestamp: {value}",
                    self.name
                ))
            }),
            None if self.fallback_to_processing_time => {
                ProcessingTimeAssigner.extract_timestamp(record)
            }
            None => Err(Error::Timestamp(format!("header {} is missing", self.name))),
        }
    }
}

fn header_millis(value: &HeaderValue) -> Option<i64> {
    match value {
        HeaderValue::String(s) => s.trim().parse().ok().or_else(|| rfc3339_millis(s)),
        other => other.as_i64(),
    }
}

fn rfc3339_millis(s: &str) -> Option<i64> {
    DateTime::parse_from_rfc3339(s.trim())
        .ok()
        .map(|t| t.timestamp_millis())
}

/// Event time read out of a JSON payload.
#[derive(Debug, Clone)]
pub struct JsonPointerAssigner {
    pointer: String,
}

impl JsonPointerAssigner {
    /// Accepts a JSON pointer (`/meta/ts`) or a dotted path (`meta.ts`).
    pub fn new(path: &str) -> Result<Self> {
        let path = path.trim();
        if path.is_empty() || path == "/" || path == "." {
            return Err(Error::Config("timestamp payload pointer is empty".to_string()));
        }
        let pointer = if path.starts_with('/') {
            path.to_string()
        } else {
            format!("/{}", path.split('.').collect::<Vec<_>>().join("/"))
        };
        Ok(Self { pointer })
    }

    pub fn pointer(&self) -> &str {
        &self.pointer
    }
}

impl RecordTimestampAssigner for JsonPointerAssigner {
    fn extract_timestamp(&self, record: &Record) -> Result<i64> {
        let payload: Value = serde_json::from_slice(&record.payload)
            .map_err(|e| Error::Timestamp(format!("payload is not JSON: {e}")))?;
        let value = payload
            .pointer(&self.pointer)
            .ok_or_else(|| Error::Timestamp(format!("{} not found in payload", self.pointer)))?;

        let millis = match value {
            Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
            Value::String(s) => s.trim().parse().ok().or_else(|| rfc3339_millis(s)),
            _ => None,
        };
        millis.ok_or_else(|| {
            Error::Timestamp(format!(
                "{} is not a timestamp: {value}",
                self.pointer
            ))
        })
    }
}

/// The configured assigner.
#[derive(Debug, Clone)]
pub enum TimestampAssigner {
    ProcessingTime(ProcessingTimeAssigner),
    Header(HeaderAssigner),
    JsonPointer(JsonPointerAssigner),
}

impl TryFrom<&TimestampConfig> for TimestampAssigner {
    type Error = Error;

    fn try_from(config: &TimestampConfig) -> Result<Self> {
        Ok(match config {
            TimestampConfig::ProcessingTime => {
                TimestampAssigner::ProcessingTime(ProcessingTimeAssigner)
            }
            TimestampConfig::Header { name } => {
                TimestampAssigner::Header(HeaderAssigner::new(name.as_str())?)
            }
            TimestampConfig::HeaderOrProcessingTime => TimestampAssigner::Header(
                HeaderAssigner::new(EVENT_TIME_HEADER)?.or_processing_time(),
            ),
            TimestampConfig::Payload { pointer } => {
                TimestampAssigner::JsonPointer(JsonPointerAssigner::new(pointer)?)
            }
        })
    }
}

impl RecordTimestampAssigner for TimestampAssigner {
    fn extract_timestamp(&self, record: &Record) -> Result<i64> {
        match self {
            TimestampAssigner::ProcessingTime(a) => a.extract_timestamp(record),
            TimestampAssigner::Header(a) => a.extract_timestamp(record),
            TimestampAssigner::JsonPointer(a) => a.extract_timestamp(record),
        }
    }
}
