//! Test harness for sender integration tests.
//!
//! Provides:
//! - MockReceiver: a TCP receiver that records every byte it reads, can stop
//!   reading to push backpressure onto the sender, and in RELP mode parses
//!   frames and answers each one with a `200 OK` acknowledgment

use crate::config::SenderConfig;
use crate::transport::TransportOptions;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering as AtomicOrdering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

/// Acknowledgment body sent for every RELP frame.
pub const ACK_BODY: &str = "200 OK";

/// A RELP frame received by the mock receiver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedFrame {
    pub txno: u32,
    pub command: String,
    pub data: Vec<u8>,
}

impl ReceivedFrame {
    pub fn data_str(&self) -> String {
        String::from_utf8_lossy(&self.data).into_owned()
    }
}

/// Mock syslog/RELP receiver on a loopback port.
pub struct MockReceiver {
    listener: Mutex<Option<std::net::TcpListener>>,
    port: u16,
    relp: bool,
    received: Arc<Mutex<Vec<u8>>>,
    frames: Arc<Mutex<Vec<ReceivedFrame>>>,
    paused: Arc<AtomicBool>,
    closed_connections: Arc<AtomicUsize>,
    shutdown: Arc<AtomicBool>,
}

impl MockReceiver {
    /// Plain syslog receiver.
    pub fn new() -> Self {
        Self::bind(false)
    }

    /// Receiver that acknowledges RELP frames.
    pub fn relp() -> Self {
        Self::bind(true)
    }

    fn bind(relp: bool) -> Self {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.set_nonblocking(true).unwrap();
        let port = listener.local_addr().unwrap().port();

        Self {
            listener: Mutex::new(Some(listener)),
            port,
            relp,
            received: Arc::new(Mutex::new(Vec::new())),
            frames: Arc::new(Mutex::new(Vec::new())),
            paused: Arc::new(AtomicBool::new(false)),
            closed_connections: Arc::new(AtomicUsize::new(0)),
            shutdown: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Port the receiver listens on.
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Plain sender configuration pointing at this receiver.
    pub fn config(&self) -> SenderConfig {
        SenderConfig::new(TransportOptions::new("127.0.0.1", self.port))
    }

    /// Stop reading from connections.
    pub fn pause(&self) {
        self.paused.store(true, AtomicOrdering::SeqCst);
    }

    /// Resume reading from connections.
    pub fn resume(&self) {
        self.paused.store(false, AtomicOrdering::SeqCst);
    }

    /// Handle that resumes reading when called from another task.
    pub fn resume_handle(&self) -> Arc<AtomicBool> {
        self.paused.clone()
    }

    /// Every byte received so far, across connections.
    pub fn received(&self) -> Vec<u8> {
        self.received.lock().unwrap().clone()
    }

    /// Received bytes split into lines, without terminators.
    pub fn lines(&self) -> Vec<String> {
        String::from_utf8_lossy(&self.received())
            .lines()
            .map(str::to_string)
            .collect()
    }

    /// Message bodies of received legacy-format lines with the default tag.
    pub fn bodies(&self) -> Vec<String> {
        self.lines().iter().map(|line| body(line).to_string()).collect()
    }

    /// RELP frames received so far.
    pub fn frames(&self) -> Vec<ReceivedFrame> {
        self.frames.lock().unwrap().clone()
    }

    /// Wait until `count` connections have been closed by the sender.
    pub async fn wait_for_eof(&self, count: usize) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while self.closed_connections.load(AtomicOrdering::SeqCst) < count {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("sender never closed the connection");
    }

    /// Wait until at least `count` RELP frames have arrived.
    pub async fn wait_for_frames(&self, count: usize) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while self.frames.lock().unwrap().len() < count {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("frames never arrived");
    }

    /// Signal shutdown.
    pub fn shutdown(&self) {
        self.shutdown.store(true, AtomicOrdering::SeqCst);
    }

    /// Start accepting connections.
    pub async fn start(&self) -> tokio::task::JoinHandle<()> {
        let listener = self
            .listener
            .lock()
            .unwrap()
            .take()
            .expect("receiver already started");
        let listener = TcpListener::from_std(listener).unwrap();

        let relp = self.relp;
        let received = self.received.clone();
        let frames = self.frames.clone();
        let paused = self.paused.clone();
        let closed = self.closed_connections.clone();
        let shutdown = self.shutdown.clone();

        tokio::spawn(async move {
            loop {
                if shutdown.load(AtomicOrdering::SeqCst) {
                    break;
                }

                let accept_result = tokio::select! {
                    result = listener.accept() => result,
                    _ = tokio::time::sleep(Duration::from_millis(100)) => continue,
                };

                if let Ok((stream, _)) = accept_result {
                    let received = received.clone();
                    let frames = frames.clone();
                    let paused = paused.clone();
                    let closed = closed.clone();

                    tokio::spawn(async move {
                        Self::handle_connection(stream, relp, received, frames, paused).await;
                        closed.fetch_add(1, AtomicOrdering::SeqCst);
                    });
                }
            }
        })
    }

    async fn handle_connection(
        mut stream: TcpStream,
        relp: bool,
        received: Arc<Mutex<Vec<u8>>>,
        frames: Arc<Mutex<Vec<ReceivedFrame>>>,
        paused: Arc<AtomicBool>,
    ) {
        let mut buf = vec![0u8; 4096];
        let mut pending = Vec::new();

        loop {
            if paused.load(AtomicOrdering::SeqCst) {
                tokio::time::sleep(Duration::from_millis(10)).await;
                continue;
            }

            let n = match stream.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => n,
            };
            received.lock().unwrap().extend_from_slice(&buf[..n]);

            if !relp {
                continue;
            }

            pending.extend_from_slice(&buf[..n]);
            while let Some((frame, consumed)) = parse_frame(&pending) {
                pending.drain(..consumed);
                let ack = format!("{} rsp {} {}\n", frame.txno, ACK_BODY.len(), ACK_BODY);
                frames.lock().unwrap().push(frame);
                if stream.write_all(ack.as_bytes()).await.is_err() {
                    return;
                }
            }
        }
    }
}

/// Parse one outbound frame: `TXNO SP COMMAND SP DATALEN [SP DATA] LF`.
pub fn parse_frame(buf: &[u8]) -> Option<(ReceivedFrame, usize)> {
    let txno_end = buf.iter().position(|&b| b == b' ')?;
    let txno = std::str::from_utf8(&buf[..txno_end]).ok()?.parse().ok()?;

    let command_start = txno_end + 1;
    let command_end = command_start + buf[command_start..].iter().position(|&b| b == b' ')?;
    let command = String::from_utf8_lossy(&buf[command_start..command_end]).into_owned();

    let len_start = command_end + 1;
    let len_end = len_start
        + buf[len_start..]
            .iter()
            .position(|&b| b == b' ' || b == b'\n')?;
    let len: usize = std::str::from_utf8(&buf[len_start..len_end]).ok()?.parse().ok()?;

    let data_start = if len > 0 { len_end + 1 } else { len_end };
    let data_end = data_start + len;
    if buf.len() <= data_end {
        return None;
    }
    assert_eq!(buf[data_end], b'\n', "frame trailer missing");

    let frame = ReceivedFrame {
        txno,
        command,
        data: buf[data_start..data_end].to_vec(),
    };
    Some((frame, data_end + 1))
}

/// Message body of a legacy line tagged with the default tag.
pub fn body(line: &str) -> &str {
    line.split_once("my.app: ").map_or(line, |(_, body)| body)
}

/// Shared in-memory writer standing in for stdout.
#[derive(Clone, Default)]
pub struct EchoCapture(Arc<Mutex<Vec<u8>>>);

impl EchoCapture {
    /// Captured text split into lines.
    pub fn lines(&self) -> Vec<String> {
        String::from_utf8_lossy(&self.0.lock().unwrap())
            .lines()
            .map(str::to_string)
            .collect()
    }
}

impl std::io::Write for EchoCapture {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}
