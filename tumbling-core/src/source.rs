//! Newline delimited JSON records read from an async reader (stdin for the processor). Each
//! line looks like `{"payload": <any JSON>, "headers": {"eventtime": 1000}}`, string payloads
//! are taken verbatim and every other payload is kept as its JSON text.

use std::sync::Arc;

use bytes::Bytes;
use serde::Deserialize;
use serde_json::Value;
use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use tokio_stream::StreamExt;
use tokio_stream::wrappers::LinesStream;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::lifecycle::WindowLifecycle;
use crate::message::{Headers, Record};
use crate::window::TumblingWindowService;
use crate::{Error, Result};

#[derive(Debug, Deserialize)]
struct InboundRecord {
    payload: Value,
    #[serde(default)]
    headers: Headers,
}

/// Parses one line into a record.
pub fn parse_line(line: &str) -> Result<Record> {
    let inbound: InboundRecord = serde_json::from_str(line)
        .map_err(|e| Error::Source(format!("malformed record: {e}")))?;
    let payload = match inbound.payload {
        Value::String(s) => Bytes::from(s),
        other => Bytes::from(other.to_string()),
    };
    Ok(Record::new(payload, inbound.headers))
}

/// Reads records until the input ends or the token is cancelled and feeds them to the window
/// service. Malformed lines and records without a usable event time are skipped, any other
/// failure stops the source.
pub async fn read_records<R, L>(
    reader: R,
    service: Arc<TumblingWindowService<L>>,
    cancel: CancellationToken,
) -> Result<u64>
where
    R: AsyncBufRead + Unpin,
    L: WindowLifecycle + Sync,
{
    let mut lines = LinesStream::new(reader.lines());
    let mut read = 0u64;

    loop {
        let line = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                info!(read, "Source cancelled");
                break;
            }
            line = lines.next() => line,
        };

        let Some(line) = line else {
            info!(read, "Reached end of input");
            break;
        };
        let line = line.map_err(|e| Error::Source(format!("reading input: {e}")))?;
        if line.trim().is_empty() {
            continue;
        }

        let record = match parse_line(&line) {
            Ok(record) => record,
            Err(e) => {
                warn!(?e, "Skipping malformed input line");
                continue;
            }
        };

        match service.on_new_message(record).await {
            Ok(()) => read += 1,
            Err(e @ Error::Timestamp(_)) => {
                warn!(?e, "Skipping record without a usable event time")
            }
            Err(e) => return Err(e),
        }
    }
    Ok(read)
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::config::WindowConfig;
    use crate::lifecycle::test_utils::RecordingLifecycle;
    use crate::message::{EVENT_TIME_HEADER, HeaderValue};
    use crate::store::WindowStore;
    use crate::timestamp::{HeaderAssigner, TimestampAssigner};

    #[test]
    fn test_parse_line() {
        let record =
            parse_line(r#"{"payload": "plain text", "headers": {"eventtime": 5, "k": "v"}}"#)
                .unwrap();
        assert_eq!(record.payload, Bytes::from("plain text"));
        assert_eq!(record.headers[EVENT_TIME_HEADER], HeaderValue::Int(5));
        assert_eq!(record.headers["k"], HeaderValue::String("v".to_string()));

        let record = parse_line(r#"{"payload": {"id": 1}}"#).unwrap();
        assert_eq!(record.payload, Bytes::from(r#"{"id":1}"#));
        assert!(record.headers.is_empty());

        assert!(matches!(parse_line("{"), Err(Error::Source(_))));
        assert!(matches!(
            parse_line(r#"{"headers": {}}"#),
            Err(Error::Source(_))
        ));
    }

    #[tokio::test]
    async fn test_read_records() {
        let service = Arc::new(
            TumblingWindowService::new(
                "source-test",
                &WindowConfig::new(Duration::from_secs(10)),
                WindowStore::in_memory(),
                TimestampAssigner::Header(HeaderAssigner::new(EVENT_TIME_HEADER).unwrap()),
                RecordingLifecycle::default(),
            )
            .unwrap(),
        );

        let input = [
            r#"{"payload": "a", "headers": {"eventtime": 1000}}"#,
            "not json",
            "",
            r#"{"payload": "no time"}"#,
            r#"{"payload": "b", "headers": {"eventtime": 12000}}"#,
        ]
        .join("\n");

        let read = read_records(
            input.as_bytes(),
            Arc::clone(&service),
            CancellationToken::new(),
        )
        .await
        .unwrap();

        assert_eq!(read, 2);
        let dispatched = service.lifecycle().dispatched();
        assert_eq!(dispatched.len(), 1);
        assert_eq!(dispatched[0].record.payload, Bytes::from("a"));
    }

    #[tokio::test]
    async fn test_cancelled_source_stops() {
        let service = Arc::new(
            TumblingWindowService::new(
                "source-test",
                &WindowConfig::new(Duration::from_secs(10)),
                WindowStore::in_memory(),
                TimestampAssigner::Header(HeaderAssigner::new(EVENT_TIME_HEADER).unwrap()),
                RecordingLifecycle::default(),
            )
            .unwrap(),
        );
        // the writer half stays open so the reader never sees the end of input
        let (_writer, reader) = tokio::io::duplex(64);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let read = read_records(tokio::io::BufReader::new(reader), service, cancel)
            .await
            .unwrap();
        assert_eq!(read, 0);
    }
}
