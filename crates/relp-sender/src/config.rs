//! Configuration for the sender.
//!
//! [`SenderConfig`] is what [`Sender::connect`](crate::Sender::connect)
//! consumes. [`SenderSettings`] is its on-disk form: read from
//! `~/.relp-sender.json` when present, then overridden from the environment.

use crate::encoder::EnvelopeOptions;
use crate::error::{SenderError, SenderResult};
use crate::relp::RelpOptions;
use crate::transport::{TransportOptions, DEFAULT_HIGH_WATER_MARK};
use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Settings file name, looked up in the home directory.
pub const CONFIG_FILE: &str = ".relp-sender.json";

/// Complete sender configuration.
#[derive(Debug, Clone)]
pub struct SenderConfig {
    /// Where and how to connect.
    pub transport: TransportOptions,

    /// Envelope written around every record.
    pub envelope: EnvelopeOptions,

    /// RELP overlay; plain syslog framing when `None`.
    pub relp: Option<RelpOptions>,

    /// Queued bytes at which writes report backpressure.
    pub high_water_mark: usize,
}

impl SenderConfig {
    /// Plain syslog framing with default envelope options.
    pub fn new(transport: TransportOptions) -> Self {
        Self {
            transport,
            envelope: EnvelopeOptions::default(),
            relp: None,
            high_water_mark: DEFAULT_HIGH_WATER_MARK,
        }
    }

    /// Enable the RELP overlay with default options.
    pub fn with_relp(mut self) -> Self {
        self.relp = Some(RelpOptions::default());
        self
    }

    /// Replace the envelope options.
    pub fn with_envelope(mut self, envelope: EnvelopeOptions) -> Self {
        self.envelope = envelope;
        self
    }
}

/// Sender settings as stored in the settings file.
///
/// PEM material is referenced by path and read by [`into_config`](Self::into_config).
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct SenderSettings {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub tls: bool,
    pub cert: Option<PathBuf>,
    pub key: Option<PathBuf>,
    pub ca: Option<PathBuf>,
    pub insecure: bool,
    pub relp: bool,
    pub relp_software: Option<String>,
    pub high_water_mark: Option<usize>,
    pub envelope: EnvelopeOptions,
}

impl SenderSettings {
    /// Read the settings file from the home directory, if any, then apply
    /// environment overrides.
    pub fn load() -> SenderResult<Self> {
        let mut settings = match default_path() {
            Some(path) if path.exists() => Self::from_file(&path)?,
            _ => Self::default(),
        };
        settings.apply_env()?;
        Ok(settings)
    }

    /// Parse a settings file.
    pub fn from_file(path: &Path) -> SenderResult<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            SenderError::Config(format!("Failed to read {}: {}", path.display(), e))
        })?;
        Ok(serde_json::from_str(&text)?)
    }

    /// Apply `SENDER_*` environment overrides.
    pub fn apply_env(&mut self) -> SenderResult<()> {
        self.apply_vars(|name| std::env::var(name).ok())
    }

    fn apply_vars(&mut self, lookup: impl Fn(&str) -> Option<String>) -> SenderResult<()> {
        if let Some(host) = lookup("SENDER_HOST") {
            self.host = Some(host);
        }
        if let Some(port) = lookup("SENDER_PORT") {
            let port = port
                .parse()
                .map_err(|_| SenderError::Config(format!("Invalid SENDER_PORT: {}", port)))?;
            self.port = Some(port);
        }
        if let Some(cert) = lookup("SENDER_CERT") {
            self.cert = Some(PathBuf::from(cert));
        }
        if let Some(key) = lookup("SENDER_KEY") {
            self.key = Some(PathBuf::from(key));
        }
        if let Some(ca) = lookup("SENDER_CA") {
            self.ca = Some(PathBuf::from(ca));
        }
        if let Some(tag) = lookup("SENDER_TAG") {
            self.envelope.tag = tag;
        }
        if let Some(relp) = lookup("SENDER_RELP") {
            self.relp = parse_flag(&relp);
        }
        if let Some(insecure) = lookup("SENDER_INSECURE") {
            self.insecure = parse_flag(&insecure);
        }
        Ok(())
    }

    /// Resolve into a [`SenderConfig`], reading any PEM files.
    pub fn into_config(self) -> SenderResult<SenderConfig> {
        let port = self
            .port
            .ok_or_else(|| SenderError::Config("No port configured".to_string()))?;

        let transport = TransportOptions {
            host: self.host.unwrap_or_else(|| "localhost".to_string()),
            port,
            tls: self.tls,
            cert: read_pem(self.cert.as_deref())?,
            key: read_pem(self.key.as_deref())?,
            ca: read_pem(self.ca.as_deref())?,
            insecure: self.insecure,
        };

        let relp = self.relp.then(|| match self.relp_software {
            Some(software) => RelpOptions { software },
            None => RelpOptions::default(),
        });

        Ok(SenderConfig {
            transport,
            envelope: self.envelope,
            relp,
            high_water_mark: self.high_water_mark.unwrap_or(DEFAULT_HIGH_WATER_MARK),
        })
    }
}

fn default_path() -> Option<PathBuf> {
    dirs::home_dir().map(|home| home.join(CONFIG_FILE))
}

fn read_pem(path: Option<&Path>) -> SenderResult<Option<Vec<u8>>> {
    path.map(|path| {
        std::fs::read(path).map_err(|e| {
            SenderError::Config(format!("Failed to read {}: {}", path.display(), e))
        })
    })
    .transpose()
}

fn parse_flag(value: &str) -> bool {
    matches!(value.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on")
}
