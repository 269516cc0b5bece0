//! Per-line decoding of structured slow-query log records.
//!
//! The on-disk format is newline-delimited JSON with a `msg` discriminator
//! and a nested `attr` payload (MongoDB 4.4+ structured logging). Decoding is
//! defensive: a line that carries no usable profiling data yields a
//! `Skipped` record, never an error — bad input must not stall or abort the
//! stream.

use crate::domain::{DecodedRecord, Document, ProfileEvent, SkipReason};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::time::Duration;
use tracing::debug;

/// `msg` value marking a profiled slow operation.
pub const SLOW_QUERY_MSG: &str = "Slow query";

#[derive(Debug, Deserialize)]
struct LogEnvelope {
    #[serde(rename = "t", default)]
    timestamp: Option<LogTimestamp>,
    #[serde(default)]
    msg: String,
    #[serde(default)]
    attr: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct LogTimestamp {
    #[serde(rename = "$date")]
    date: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SlowQueryAttributes {
    #[serde(rename = "type", default)]
    op_type: String,
    #[serde(default)]
    ns: String,
    #[serde(default)]
    command: Document,
    #[serde(default)]
    originating_command: Option<Document>,
    #[serde(default)]
    update_obj: Option<Document>,
    #[serde(default)]
    plan_summary: Option<String>,
    #[serde(default)]
    keys_examined: i64,
    #[serde(default)]
    docs_examined: i64,
    #[serde(default)]
    nreturned: i64,
    #[serde(default)]
    reslen: i64,
    #[serde(default)]
    duration_millis: i64,
    #[serde(default)]
    app_name: Option<String>,
    #[serde(default)]
    remote: Option<String>,
}

/// Decodes raw log lines into tagged records.
#[derive(Debug, Default)]
pub struct SlowQueryDecoder;

impl SlowQueryDecoder {
    pub fn new() -> Self {
        Self
    }

    /// Decodes one line. Exactly one record out per line in.
    pub fn decode(&self, line: &[u8]) -> DecodedRecord {
        let text = match std::str::from_utf8(line) {
            Ok(text) => text.trim(),
            Err(_) => return DecodedRecord::Skipped(SkipReason::InvalidJson),
        };
        if text.is_empty() {
            return DecodedRecord::Skipped(SkipReason::EmptyLine);
        }

        let envelope: LogEnvelope = match serde_json::from_str(text) {
            Ok(envelope) => envelope,
            Err(_) => return DecodedRecord::Skipped(SkipReason::InvalidJson),
        };
        if envelope.msg != SLOW_QUERY_MSG {
            return DecodedRecord::Skipped(SkipReason::UnexpectedMessage);
        }

        let attr = envelope.attr.unwrap_or(serde_json::Value::Null);
        let attr: SlowQueryAttributes = match serde_json::from_value(attr) {
            Ok(attr) => attr,
            Err(err) => {
                debug!(error = %err, "slow query attributes failed to decode");
                return DecodedRecord::Skipped(SkipReason::MalformedAttributes);
            }
        };

        let timestamp = envelope
            .timestamp
            .and_then(|t| DateTime::parse_from_rfc3339(&t.date).ok())
            .map(|t| t.with_timezone(&Utc))
            .unwrap_or_else(Utc::now);

        DecodedRecord::Event(Box::new(ProfileEvent {
            ns: attr.ns,
            op_type: attr.op_type,
            timestamp,
            duration: Duration::from_millis(attr.duration_millis.max(0) as u64),
            command: attr.command,
            originating_command: attr.originating_command,
            update_obj: attr.update_obj,
            plan_summary: attr.plan_summary,
            keys_examined: attr.keys_examined,
            docs_examined: attr.docs_examined,
            nreturned: attr.nreturned,
            response_length: attr.reslen,
            app_name: attr.app_name,
            client: attr.remote,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode(line: &str) -> DecodedRecord {
        SlowQueryDecoder::new().decode(line.as_bytes())
    }

    const VALID_LINE: &str = r#"{"t":{"$date":"2024-03-01T12:00:00.123+00:00"},"s":"I","c":"COMMAND","id":51803,"ctx":"conn12","msg":"Slow query","attr":{"type":"command","ns":"shop.orders","command":{"find":"orders","filter":{"status":"open","user_id":42}},"planSummary":"IXSCAN { user_id: 1 }","keysExamined":5,"docsExamined":5,"nreturned":5,"reslen":1320,"remote":"127.0.0.1:51422","durationMillis":137}}"#;

    #[test]
    fn decodes_valid_slow_query_line() {
        let record = decode(VALID_LINE);
        let DecodedRecord::Event(event) = record else {
            panic!("expected an event, got {record:?}");
        };

        assert_eq!(event.ns, "shop.orders");
        assert_eq!(event.op_type, "command");
        assert_eq!(event.duration, Duration::from_millis(137));
        assert_eq!(event.keys_examined, 5);
        assert_eq!(event.nreturned, 5);
        assert_eq!(event.response_length, 1320);
        assert_eq!(event.client.as_deref(), Some("127.0.0.1:51422"));
        assert_eq!(
            event.plan_summary.as_deref(),
            Some("IXSCAN { user_id: 1 }")
        );
        assert_eq!(event.timestamp.to_rfc3339(), "2024-03-01T12:00:00.123+00:00");
    }

    #[test]
    fn command_document_preserves_key_order() {
        let DecodedRecord::Event(event) = decode(VALID_LINE) else {
            panic!("expected an event");
        };
        let keys: Vec<&str> = event.command.keys().map(String::as_str).collect();
        assert_eq!(keys, vec!["find", "filter"]);
    }

    #[test]
    fn empty_line_is_skipped() {
        assert!(matches!(
            decode(""),
            DecodedRecord::Skipped(SkipReason::EmptyLine)
        ));
        assert!(matches!(
            decode("   \n"),
            DecodedRecord::Skipped(SkipReason::EmptyLine)
        ));
    }

    #[test]
    fn invalid_json_is_skipped() {
        assert!(matches!(
            decode("not json at all"),
            DecodedRecord::Skipped(SkipReason::InvalidJson)
        ));
        assert!(matches!(
            decode(r#"{"msg":"Slow query""#),
            DecodedRecord::Skipped(SkipReason::InvalidJson)
        ));
    }

    #[test]
    fn unrelated_message_is_skipped() {
        let line = r#"{"t":{"$date":"2024-03-01T12:00:00.000+00:00"},"msg":"Connection accepted","attr":{"remote":"127.0.0.1:5"}}"#;
        assert!(matches!(
            decode(line),
            DecodedRecord::Skipped(SkipReason::UnexpectedMessage)
        ));
    }

    #[test]
    fn malformed_attributes_are_skipped() {
        // Slow-query marker but no attr payload at all.
        let missing = r#"{"msg":"Slow query"}"#;
        assert!(matches!(
            decode(missing),
            DecodedRecord::Skipped(SkipReason::MalformedAttributes)
        ));

        // Wrong type inside the payload.
        let wrong_type = r#"{"msg":"Slow query","attr":{"ns":"a.b","durationMillis":"fast"}}"#;
        assert!(matches!(
            decode(wrong_type),
            DecodedRecord::Skipped(SkipReason::MalformedAttributes)
        ));
    }

    #[test]
    fn missing_timestamp_falls_back_to_now() {
        let line = r#"{"msg":"Slow query","attr":{"type":"command","ns":"a.b","command":{"ping":1},"durationMillis":5}}"#;
        let DecodedRecord::Event(event) = decode(line) else {
            panic!("expected an event");
        };
        assert!((Utc::now() - event.timestamp).num_seconds().abs() < 60);
    }
}
