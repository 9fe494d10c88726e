//! relp-sender binary entry point.
//!
//! Usage: relp-sender --port <port> [--host <host>] [--relp] [--file <path>]
//!
//! Reads newline-delimited events from a file or stdin and forwards each
//! line as one syslog record. Settings come from `~/.relp-sender.json` and
//! `SENDER_*` environment variables; command-line options override both.

use clap::Parser;
use relp_sender::{ResponseCommand, Sender, SenderResult, SenderSettings};
use std::path::PathBuf;
use tracing::{error, info, warn};

/// Forward newline-delimited events to a syslog or RELP receiver.
#[derive(Parser, Debug)]
#[command(name = "relp-sender")]
#[command(about = "Flow-controlled syslog and RELP event sender over TCP or TLS")]
struct Args {
    /// Input file; stdin when omitted.
    #[arg(short, long)]
    file: Option<PathBuf>,

    /// Receiver host.
    #[arg(short = 'H', long)]
    host: Option<String>,

    /// Receiver port.
    #[arg(short, long)]
    port: Option<u16>,

    /// Client private key (PEM).
    #[arg(short, long)]
    key: Option<PathBuf>,

    /// Client certificate chain (PEM).
    #[arg(short, long)]
    cert: Option<PathBuf>,

    /// Certificate authority bundle (PEM).
    #[arg(short = 'a', long)]
    ca: Option<PathBuf>,

    /// Use TLS even without certificate material.
    #[arg(long)]
    tls: bool,

    /// Accept any server certificate.
    #[arg(long)]
    insecure: bool,

    /// Wrap records in RELP transactions.
    #[arg(long)]
    relp: bool,

    /// Emit RFC 5424 records instead of the legacy format.
    #[arg(long)]
    rfc5424: bool,

    /// Syslog tag.
    #[arg(long)]
    tag: Option<String>,

    /// Syslog priority value.
    #[arg(long)]
    priority: Option<u16>,

    /// Echo every encoded record to stdout.
    #[arg(long)]
    debug: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Also append JSON-lines logs to this file.
    #[arg(long, env = "RELP_SENDER_LOG_FILE")]
    log_file: Option<PathBuf>,
}

impl Args {
    fn apply(&self, settings: &mut SenderSettings) {
        if let Some(host) = &self.host {
            settings.host = Some(host.clone());
        }
        if let Some(port) = self.port {
            settings.port = Some(port);
        }
        if let Some(key) = &self.key {
            settings.key = Some(key.clone());
        }
        if let Some(cert) = &self.cert {
            settings.cert = Some(cert.clone());
        }
        if let Some(ca) = &self.ca {
            settings.ca = Some(ca.clone());
        }
        if let Some(tag) = &self.tag {
            settings.envelope.tag = tag.clone();
        }
        if let Some(priority) = self.priority {
            settings.envelope.priority = priority;
        }
        settings.tls |= self.tls;
        settings.insecure |= self.insecure;
        settings.relp |= self.relp;
        settings.envelope.rfc5424 |= self.rfc5424;
        settings.envelope.debug |= self.debug;
    }
}

async fn run(sender: &mut Sender, file: Option<PathBuf>) -> SenderResult<()> {
    let forwarded = match file {
        Some(path) => sender.forward(tokio::fs::File::open(&path).await?).await?,
        None => sender.forward(tokio::io::stdin()).await?,
    };
    info!(bytes = forwarded.bytes, "Input forwarded");

    if sender.is_relp() {
        let close_txno = sender.send_close()?;
        let mut acknowledged = forwarded.acknowledged;

        loop {
            match sender.next_response().await? {
                Some(frame) if frame.command == ResponseCommand::Close => {
                    info!(txno = frame.txno, acknowledged, "Close acknowledged");
                    break;
                }
                Some(frame) if frame.command == ResponseCommand::Syslog => acknowledged += 1,
                Some(_) => {}
                None => {
                    warn!(
                        close_txno,
                        acknowledged, "Connection closed before close acknowledgment"
                    );
                    break;
                }
            }
        }
    }

    sender.end().await
}

#[tokio::main]
async fn main() -> SenderResult<()> {
    let args = Args::parse();

    observability::init_with_config(observability::LogConfig {
        service_name: "relp-sender".into(),
        default_level: args.log_level.clone(),
        log_path: args.log_file.clone(),
        ..Default::default()
    });

    let mut settings = SenderSettings::load()?;
    args.apply(&mut settings);
    let config = settings.into_config()?;

    info!(
        host = %config.transport.host,
        port = config.transport.port,
        kind = ?config.transport.kind(),
        relp = config.relp.is_some(),
        rfc5424 = config.envelope.rfc5424,
        "Configuration loaded"
    );

    let mut sender = Sender::connect(config).await?;

    let ctrl_c = tokio::signal::ctrl_c();

    tokio::select! {
        result = run(&mut sender, args.file) => {
            if let Err(e) = result {
                error!(error = %e, "Sender exited with error");
                return Err(e);
            }
        }
        _ = ctrl_c => {
            info!("Received shutdown signal, exiting...");
        }
    }

    Ok(())
}
