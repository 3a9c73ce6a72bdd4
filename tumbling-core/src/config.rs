use std::env;
use std::path::PathBuf;
use std::sync::OnceLock;
use std::time::Duration;

use base64::Engine;
use base64::prelude::BASE64_STANDARD;
use serde::Deserialize;
use tracing::warn;

use crate::Error;
use crate::Result;

const ENV_PROCESSOR_OBJ: &str = "TUMBLING_PROCESSOR_OBJECT";
const DEFAULT_PROCESSOR_NAME: &str = "tumbling-processor";
const DEFAULT_METRICS_PORT: u16 = 9090;
const DEFAULT_STORE_PATH: &str = "/tmp/tumbling-window-data/";
const DEFAULT_EVENT_TIME_HEADER: &str = "eventtime";
/// idle timeout defaults to this many window lengths when not configured.
const DEFAULT_IDLE_TIMEOUT_FACTOR: u32 = 3;

pub fn config() -> &'static Settings {
    static CONF: OnceLock<Settings> = OnceLock::new();
    CONF.get_or_init(|| match Settings::load() {
        Ok(v) => v,
        Err(e) => {
            panic!("Failed to load configuration: {:?}", e);
        }
    })
}

/// What to do with the output of a window that is re-released while its allowed lateness is
/// still running. Interpreted by the window lifecycle, never by the engine.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LateEventMode {
    #[default]
    Drop,
    Upsert,
    SideChannel,
}

/// Backend used for buffering not yet released windows.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum StoreConfig {
    Memory,
    Persistent {
        #[serde(default = "default_store_path")]
        path: PathBuf,
    },
}

impl Default for StoreConfig {
    fn default() -> Self {
        StoreConfig::Memory
    }
}

fn default_store_path() -> PathBuf {
    PathBuf::from(DEFAULT_STORE_PATH)
}

/// How the event time is extracted out of a record.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum TimestampConfig {
    ProcessingTime,
    Header {
        #[serde(default = "default_event_time_header")]
        name: String,
    },
    HeaderOrProcessingTime,
    Payload {
        pointer: String,
    },
}

impl Default for TimestampConfig {
    fn default() -> Self {
        TimestampConfig::HeaderOrProcessingTime
    }
}

fn default_event_time_header() -> String {
    DEFAULT_EVENT_TIME_HEADER.to_string()
}

/// Tumbling window and watermark configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct WindowConfig {
    /// Length of every tumbling window.
    pub length: Duration,
    /// Inactivity after which the oldest window is force released.
    pub idle_timeout: Duration,
    /// Watermark lag behind the observed event times.
    pub max_out_of_orderness: Duration,
    /// Grace period after the window end, zero disables it.
    pub allowed_lateness: Duration,
}

impl WindowConfig {
    pub fn new(length: Duration) -> Self {
        Self {
            length,
            idle_timeout: length * DEFAULT_IDLE_TIMEOUT_FACTOR,
            max_out_of_orderness: Duration::ZERO,
            allowed_lateness: Duration::ZERO,
        }
    }

    pub fn with_idle_timeout(mut self, idle_timeout: Duration) -> Self {
        self.idle_timeout = idle_timeout;
        self
    }

    pub fn with_max_out_of_orderness(mut self, max_out_of_orderness: Duration) -> Self {
        self.max_out_of_orderness = max_out_of_orderness;
        self
    }

    pub fn with_allowed_lateness(mut self, allowed_lateness: Duration) -> Self {
        self.allowed_lateness = allowed_lateness;
        self
    }
}

/// Processor spec as provided (base64 encoded JSON) in the environment.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ProcessorSpec {
    name: Option<String>,
    window: Option<kube::core::Duration>,
    idle_window_timeout: Option<kube::core::Duration>,
    max_out_of_orderness: Option<kube::core::Duration>,
    allowed_lateness: Option<kube::core::Duration>,
    #[serde(default)]
    late_event_mode: LateEventMode,
    #[serde(default)]
    store: StoreConfig,
    #[serde(default)]
    timestamp: TimestampConfig,
    metrics_port: Option<u16>,
}

#[derive(Debug, Clone)]
pub struct Settings {
    pub name: String,
    pub window: WindowConfig,
    pub late_event_mode: LateEventMode,
    pub store: StoreConfig,
    pub timestamp: TimestampConfig,
    pub metrics_port: u16,
}

impl Settings {
    fn load() -> Result<Self> {
        let obj = env::var(ENV_PROCESSOR_OBJ)
            .map_err(|_| Error::Config(format!("{ENV_PROCESSOR_OBJ} is not set")))?;
        Self::from_encoded(&obj)
    }

    /// Builds the settings out of the base64 encoded processor spec.
    pub fn from_encoded(obj: &str) -> Result<Self> {
        let decoded = BASE64_STANDARD
            .decode(obj.trim().as_bytes())
            .map_err(|e| Error::Config(format!("Failed to decode processor spec: {e}")))?;
        let spec: ProcessorSpec = serde_json::from_slice(&decoded)
            .map_err(|e| Error::Config(format!("Failed to parse processor spec: {e}")))?;
        spec.try_into()
    }
}

impl TryFrom<ProcessorSpec> for Settings {
    type Error = Error;

    fn try_from(spec: ProcessorSpec) -> Result<Self> {
        let length = spec
            .window
            .map(Duration::from)
            .ok_or_else(|| Error::Config("window length is required".to_string()))?;
        if length.is_zero() {
            return Err(Error::Config("window length must be positive".to_string()));
        }

        let mut window = WindowConfig::new(length);
        if let Some(idle) = spec.idle_window_timeout.map(Duration::from) {
            window = window.with_idle_timeout(idle);
        }
        if window.idle_timeout.is_zero() {
            return Err(Error::Config(
                "idle window timeout must be positive".to_string(),
            ));
        }
        if window.idle_timeout <= window.length {
            warn!(
                idle_timeout_ms = window.idle_timeout.as_millis(),
                window_ms = window.length.as_millis(),
                "Idle window timeout should exceed the window length, windows may be released partially"
            );
        }
        if let Some(ooo) = spec.max_out_of_orderness.map(Duration::from) {
            window = window.with_max_out_of_orderness(ooo);
        }
        if let Some(lateness) = spec.allowed_lateness.map(Duration::from) {
            window = window.with_allowed_lateness(lateness);
        }

        match &spec.timestamp {
            TimestampConfig::Header { name } if name.trim().is_empty() => {
                return Err(Error::Config("timestamp header name is empty".to_string()));
            }
            TimestampConfig::Payload { pointer } if pointer.trim().is_empty() => {
                return Err(Error::Config("timestamp payload pointer is empty".to_string()));
            }
            _ => {}
        }

        Ok(Settings {
            name: spec
                .name
                .unwrap_or_else(|| DEFAULT_PROCESSOR_NAME.to_string()),
            window,
            late_event_mode: spec.late_event_mode,
            store: spec.store,
            timestamp: spec.timestamp,
            metrics_port: spec.metrics_port.unwrap_or(DEFAULT_METRICS_PORT),
        })
    }
}
