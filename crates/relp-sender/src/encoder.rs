//! Record encoder: turns one logical message into one syslog line.
//!
//! Two envelope shapes are produced:
//!
//! ```text
//! legacy:  <PRI>TIMESTAMP HOST TAG: MESSAGE\n
//! rfc5424: <PRI>1 TIMESTAMP HOST TAG PID WORKER - MESSAGE\n
//! ```

use crate::error::SenderResult;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use std::borrow::Cow;

/// Default syslog priority (facility user, severity notice).
pub const DEFAULT_PRIORITY: u16 = 13;

/// Host label used when none is configured.
pub const DEFAULT_HOST_LABEL: &str = "localhost.localdomain";

/// Tag used when none is configured.
pub const DEFAULT_TAG: &str = "my.app";

/// Worker id used in RFC 5424 frames when none is configured.
pub const DEFAULT_WORKER: &str = "master";

/// One logical message handed to the sender.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    /// Plain text.
    Text(String),
    /// Raw bytes, rendered as (lossy) UTF-8.
    Binary(Vec<u8>),
    /// Structured value, rendered as compact JSON.
    Json(serde_json::Value),
}

impl Message {
    /// Build a structured message from any serializable value.
    pub fn json<T: Serialize>(value: &T) -> SenderResult<Self> {
        Ok(Message::Json(serde_json::to_value(value)?))
    }

    fn render(&self) -> Cow<'_, str> {
        match self {
            Message::Text(text) => Cow::Borrowed(text.as_str()),
            Message::Binary(bytes) => String::from_utf8_lossy(bytes),
            Message::Json(value) => Cow::Owned(value.to_string()),
        }
    }
}

impl From<&str> for Message {
    fn from(text: &str) -> Self {
        Message::Text(text.to_string())
    }
}

impl From<String> for Message {
    fn from(text: String) -> Self {
        Message::Text(text)
    }
}

impl From<&[u8]> for Message {
    fn from(bytes: &[u8]) -> Self {
        Message::Binary(bytes.to_vec())
    }
}

impl From<Vec<u8>> for Message {
    fn from(bytes: Vec<u8>) -> Self {
        Message::Binary(bytes)
    }
}

impl From<serde_json::Value> for Message {
    fn from(value: serde_json::Value) -> Self {
        Message::Json(value)
    }
}

/// Per-sender envelope configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EnvelopeOptions {
    /// Syslog priority value.
    pub priority: u16,
    /// Host label written into every frame.
    pub host_label: String,
    /// Tag / application name.
    pub tag: String,
    /// Use the RFC 5424 layout instead of the legacy one.
    pub rfc5424: bool,
    /// Process id for RFC 5424 frames; the current process when unset.
    pub pid: Option<u32>,
    /// Worker id for RFC 5424 frames.
    pub worker: String,
    /// Echo every encoded line to stdout.
    pub debug: bool,
}

impl Default for EnvelopeOptions {
    fn default() -> Self {
        Self {
            priority: DEFAULT_PRIORITY,
            host_label: DEFAULT_HOST_LABEL.to_string(),
            tag: DEFAULT_TAG.to_string(),
            rfc5424: false,
            pid: None,
            worker: DEFAULT_WORKER.to_string(),
            debug: false,
        }
    }
}

/// Encodes messages into syslog lines using fixed envelope options.
#[derive(Debug, Clone)]
pub struct RecordEncoder {
    options: EnvelopeOptions,
}

impl RecordEncoder {
    /// Create an encoder for the given envelope options.
    pub fn new(options: EnvelopeOptions) -> Self {
        Self { options }
    }

    /// The envelope options in use.
    pub fn options(&self) -> &EnvelopeOptions {
        &self.options
    }

    /// Encode a message stamped with the current time.
    ///
    /// The result always ends with exactly one `\n`.
    pub fn encode(&self, message: &Message) -> String {
        self.encode_at(message, Utc::now())
    }

    /// Encode a message stamped with the given time.
    pub fn encode_at(&self, message: &Message, at: DateTime<Utc>) -> String {
        let body = message.render();
        let mut line = self.header(at);
        line.reserve(body.len() + 2);
        line.push(' ');
        line.push_str(&body);
        if !line.ends_with('\n') {
            line.push('\n');
        }
        line
    }

    fn header(&self, at: DateTime<Utc>) -> String {
        let opts = &self.options;
        let timestamp = at.to_rfc3339_opts(SecondsFormat::Millis, true);

        if !opts.rfc5424 {
            return format!(
                "<{}>{} {} {}:",
                opts.priority, timestamp, opts.host_label, opts.tag
            );
        }

        let pid = opts.pid.unwrap_or_else(std::process::id);
        format!(
            "<{}>1 {} {} {} {} {} -",
            opts.priority, timestamp, opts.host_label, opts.tag, pid, opts.worker
        )
    }
}
