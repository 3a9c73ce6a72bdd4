//! Window lifecycle writing the released windows as JSON lines. A window is aggregated into a
//! single record whose payload is the JSON array of the buffered payloads.

use std::collections::BTreeMap;

use bytes::Bytes;
use serde::Serialize;
use serde_json::Value;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::config::LateEventMode;
use crate::lifecycle::WindowLifecycle;
use crate::message::{HeaderValue, Headers, OutputRecord};
use crate::store::WindowEntry;
use crate::{Error, Result};

#[derive(Serialize)]
struct OutboundRecord<'a> {
    payload: Value,
    headers: BTreeMap<&'a String, &'a HeaderValue>,
}

/// Writes completed windows to `main`, late resends go wherever the [LateEventMode] says.
pub struct JsonLinesLifecycle<W, S> {
    main: Mutex<W>,
    late: Mutex<S>,
    mode: LateEventMode,
}

impl<W, S> JsonLinesLifecycle<W, S>
where
    W: AsyncWrite + Unpin + Send,
    S: AsyncWrite + Unpin + Send,
{
    pub fn new(main: W, late: S, mode: LateEventMode) -> Self {
        Self {
            main: Mutex::new(main),
            late: Mutex::new(late),
            mode,
        }
    }

    pub fn into_inner(self) -> (W, S) {
        (self.main.into_inner(), self.late.into_inner())
    }

    async fn write_to<T>(writer: &Mutex<T>, record: &OutputRecord) -> Result<()>
    where
        T: AsyncWrite + Unpin + Send,
    {
        let mut line = to_json_line(record)?;
        line.push(b'\n');
        let mut writer = writer.lock().await;
        writer
            .write_all(&line)
            .await
            .map_err(|e| Error::Lifecycle(format!("writing output: {e}")))?;
        writer
            .flush()
            .await
            .map_err(|e| Error::Lifecycle(format!("flushing output: {e}")))
    }
}

impl<W, S> WindowLifecycle for JsonLinesLifecycle<W, S>
where
    W: AsyncWrite + Unpin + Send,
    S: AsyncWrite + Unpin + Send,
{
    async fn compute_window_aggregate(
        &self,
        window_start_ms: i64,
        window_end_ms: i64,
        window: &WindowEntry,
        partial: bool,
    ) -> Result<Vec<OutputRecord>> {
        let payloads: Vec<Value> = window.payloads.iter().map(payload_value).collect();
        let payload = serde_json::to_vec(&payloads)
            .map_err(|e| Error::Lifecycle(format!("encoding aggregate: {e}")))?;

        let mut aggregate = OutputRecord::new(payload);
        aggregate.headers = window
            .headers
            .iter()
            .filter(|(_, v)| v.is_primitive())
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect::<Headers>();
        Ok(vec![aggregate.with_window_headers(
            window_start_ms,
            window_end_ms,
            partial,
        )])
    }

    async fn send(
        &self,
        event_time_ms: i64,
        watermark_ms: i64,
        record: OutputRecord,
    ) -> Result<()> {
        debug!(event_time_ms, watermark_ms, "Writing window output");
        Self::write_to(&self.main, &record).await
    }

    async fn handle_late_event(
        &self,
        event_time_ms: i64,
        watermark_ms: i64,
        record: OutputRecord,
    ) -> Result<()> {
        match self.mode {
            LateEventMode::Drop => {
                info!(
                    event_time_ms,
                    watermark_ms, "Dropping output of a window within its allowed lateness"
                );
                Ok(())
            }
            LateEventMode::Upsert => Self::write_to(&self.main, &record).await,
            LateEventMode::SideChannel => Self::write_to(&self.late, &record).await,
        }
    }
}

/// Payloads holding JSON are embedded as is, anything else becomes a string.
fn payload_value(payload: &Bytes) -> Value {
    serde_json::from_slice(payload)
        .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(payload).into_owned()))
}

fn to_json_line(record: &OutputRecord) -> Result<Vec<u8>> {
    let outbound = OutboundRecord {
        payload: payload_value(&record.payload),
        headers: record
            .headers
            .iter()
            .filter(|(_, v)| v.is_primitive())
            .collect(),
    };
    serde_json::to_vec(&outbound).map_err(|e| Error::Lifecycle(format!("encoding output: {e}")))
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::message::{EVENT_TIME_HEADER, PARTIAL_HEADER, WINDOW_END_HEADER};

    fn window() -> WindowEntry {
        let mut headers = Headers::new();
        headers.insert("source".to_string(), "clicks".into());
        headers.insert("raw".to_string(), HeaderValue::Bytes(Bytes::from_static(b"\x01")));
        WindowEntry {
            window_start: 0,
            headers,
            payloads: vec![Bytes::from(r#"{"id":1}"#), Bytes::from("plain")],
        }
    }

    fn lines(raw: &[u8]) -> Vec<Value> {
        String::from_utf8_lossy(raw)
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect()
    }

    #[tokio::test]
    async fn test_aggregate_and_send() {
        let lifecycle = JsonLinesLifecycle::new(Vec::new(), Vec::new(), LateEventMode::Drop);
        let outputs = lifecycle
            .compute_window_aggregate(0, 10_000, &window(), true)
            .await
            .unwrap();
        assert_eq!(outputs.len(), 1);
        let output = outputs[0].clone().with_header(EVENT_TIME_HEADER, 10_000i64);
        assert_eq!(output.header_i64(WINDOW_END_HEADER), Some(10_000));
        assert_eq!(output.headers[PARTIAL_HEADER], HeaderValue::Bool(true));
        assert!(!output.headers.contains_key("raw"));

        lifecycle.send(10_000, 10_000, output).await.unwrap();
        let (main, late) = lifecycle.into_inner();
        assert!(late.is_empty());

        let written = lines(&main);
        assert_eq!(written.len(), 1);
        assert_eq!(written[0]["payload"], json!([{"id": 1}, "plain"]));
        assert_eq!(
            written[0]["headers"],
            json!({
                "eventtime": 10_000,
                "partial": true,
                "source": "clicks",
                "windowEndTime": 10_000,
                "windowStartTime": 0
            })
        );
    }

    #[tokio::test]
    async fn test_late_event_modes() {
        let record = OutputRecord::new("[1]");

        let lifecycle = JsonLinesLifecycle::new(Vec::new(), Vec::new(), LateEventMode::Drop);
        lifecycle.handle_late_event(1, 1, record.clone()).await.unwrap();
        let (main, late) = lifecycle.into_inner();
        assert!(main.is_empty() && late.is_empty());

        let lifecycle = JsonLinesLifecycle::new(Vec::new(), Vec::new(), LateEventMode::Upsert);
        lifecycle.handle_late_event(1, 1, record.clone()).await.unwrap();
        let (main, late) = lifecycle.into_inner();
        assert_eq!(lines(&main).len(), 1);
        assert!(late.is_empty());

        let lifecycle = JsonLinesLifecycle::new(Vec::new(), Vec::new(), LateEventMode::SideChannel);
        lifecycle.handle_late_event(1, 1, record).await.unwrap();
        let (main, late) = lifecycle.into_inner();
        assert!(main.is_empty());
        assert_eq!(lines(&late)[0]["payload"], json!([1]));
    }
}
