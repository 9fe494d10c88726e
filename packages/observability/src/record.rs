//! JSON-lines layer: one object per event.
//!
//! ```text
//! {"ts":"...","level":"INFO","service":"relp-sender","pid":42,
//!  "target":"relp_sender::sender","message":"Sender ended","fields":{...}}
//! ```

use chrono::{SecondsFormat, Utc};
use serde::Serialize;
use serde_json::{Map, Value};
use std::fmt;
use std::io::Write;
use tracing::field::{Field, Visit};
use tracing::{Event, Subscriber};
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::layer::Context;
use tracing_subscriber::Layer;

/// One serialized log line.
#[derive(Debug, Serialize)]
pub struct Record<'a> {
    pub ts: String,
    pub level: &'static str,
    pub service: &'a str,
    pub pid: u32,
    pub target: &'a str,
    pub message: String,
    #[serde(skip_serializing_if = "Map::is_empty")]
    pub fields: Map<String, Value>,
}

#[derive(Default)]
struct Fields {
    message: Option<String>,
    values: Map<String, Value>,
}

impl Fields {
    fn insert(&mut self, field: &Field, value: Value) {
        self.values.insert(field.name().to_string(), value);
    }
}

impl Visit for Fields {
    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        let text = format!("{:?}", value);
        if field.name() == "message" {
            self.message = Some(text);
        } else {
            self.insert(field, Value::String(text));
        }
    }

    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "message" {
            self.message = Some(value.to_string());
        } else {
            self.insert(field, Value::String(value.to_string()));
        }
    }

    fn record_i64(&mut self, field: &Field, value: i64) {
        self.insert(field, value.into());
    }

    fn record_u64(&mut self, field: &Field, value: u64) {
        self.insert(field, value.into());
    }

    fn record_bool(&mut self, field: &Field, value: bool) {
        self.insert(field, value.into());
    }

    fn record_error(&mut self, field: &Field, value: &(dyn std::error::Error + 'static)) {
        self.insert(field, Value::String(value.to_string()));
    }
}

/// Layer writing every event as one JSON line.
pub struct JsonLinesLayer<W> {
    service: String,
    pid: u32,
    make_writer: W,
}

impl<W> JsonLinesLayer<W> {
    pub fn new(service: impl Into<String>, make_writer: W) -> Self {
        Self {
            service: service.into(),
            pid: std::process::id(),
            make_writer,
        }
    }
}

impl<S, W> Layer<S> for JsonLinesLayer<W>
where
    S: Subscriber,
    W: for<'w> MakeWriter<'w> + 'static,
{
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let mut fields = Fields::default();
        event.record(&mut fields);

        let metadata = event.metadata();
        let record = Record {
            ts: Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
            level: metadata.level().as_str(),
            service: &self.service,
            pid: self.pid,
            target: metadata.target(),
            message: fields.message.unwrap_or_default(),
            fields: fields.values,
        };

        if let Ok(line) = serde_json::to_string(&record) {
            let _ = writeln!(self.make_writer.make_writer(), "{}", line);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::file::LogFile;
    use tempfile::tempdir;
    use tracing_subscriber::layer::SubscriberExt;

    #[test]
    fn test_record_omits_empty_fields() {
        let record = Record {
            ts: "2024-03-05T07:08:09.000Z".to_string(),
            level: "INFO",
            service: "relp-sender",
            pid: 7,
            target: "relp_sender::sender",
            message: "Sender ended".to_string(),
            fields: Map::new(),
        };

        let json = serde_json::to_string(&record).unwrap();
        assert!(json.contains("\"service\":\"relp-sender\""));
        assert!(json.contains("\"pid\":7"));
        assert!(!json.contains("fields"));
    }

    #[test]
    fn test_layer_writes_structured_fields() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("sender.jsonl");
        let file = LogFile::open(&path).unwrap();

        let subscriber =
            tracing_subscriber::registry().with(JsonLinesLayer::new("relp-sender", file));
        tracing::subscriber::with_default(subscriber, || {
            tracing::info!(txno = 42u64, host = "collector", "RELP response");
        });

        let content = std::fs::read_to_string(&path).unwrap();
        let line: Value = serde_json::from_str(content.trim()).unwrap();
        assert_eq!(line["level"], "INFO");
        assert_eq!(line["service"], "relp-sender");
        assert_eq!(line["message"], "RELP response");
        assert_eq!(line["fields"]["txno"], 42);
        assert_eq!(line["fields"]["host"], "collector");
    }
}
