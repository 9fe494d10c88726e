//! TCP/TLS transport connection with a write-acceptance signal.
//!
//! The socket is split into two tasks. The writer task drains an outbound
//! queue into the socket; the reader task forwards inbound bytes. The owner
//! sees a non-blocking [`Connection::write`] that reports whether more data
//! should be queued, and a stream of [`ConnectionEvent`]s.

use crate::error::{SenderError, SenderResult};
use crate::tls::TlsClient;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Queued outbound bytes at or above which `write` reports not-accepted.
pub const DEFAULT_HIGH_WATER_MARK: usize = 16 * 1024;

const READ_CHUNK_SIZE: usize = 8192;

/// Transport options for one connection.
#[derive(Debug, Clone)]
pub struct TransportOptions {
    /// Remote host.
    pub host: String,
    /// Remote port.
    pub port: u16,
    /// Force TLS even without certificate material.
    pub tls: bool,
    /// Client certificate chain (PEM).
    pub cert: Option<Vec<u8>>,
    /// Client private key (PEM).
    pub key: Option<Vec<u8>>,
    /// Certificate authority bundle (PEM).
    pub ca: Option<Vec<u8>>,
    /// Accept any server certificate. Unsafe, for experiments only.
    pub insecure: bool,
}

impl TransportOptions {
    /// Plain options for the given host and port.
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            tls: false,
            cert: None,
            key: None,
            ca: None,
            insecure: false,
        }
    }

    /// Transport kind these options select.
    pub fn kind(&self) -> TransportKind {
        if self.tls || self.cert.is_some() || self.ca.is_some() {
            TransportKind::Tls
        } else {
            TransportKind::Plain
        }
    }
}

impl Default for TransportOptions {
    fn default() -> Self {
        Self::new("localhost", 0)
    }
}

/// Transport kind of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    Plain,
    Tls,
}

/// Notification from the socket tasks.
#[derive(Debug)]
pub enum ConnectionEvent {
    /// Inbound bytes.
    Data(Vec<u8>),
    /// Outbound queue emptied after a refused write.
    Drain,
    /// Socket failure; the connection is unusable afterwards.
    Error(std::io::Error),
    /// Peer closed its side of the connection.
    Closed,
}

/// One TCP or TLS connection to a fixed host and port.
pub struct Connection {
    kind: TransportKind,
    outbound: Option<mpsc::UnboundedSender<Vec<u8>>>,
    buffered: Arc<AtomicUsize>,
    needs_drain: Arc<AtomicBool>,
    high_water_mark: usize,
    writer_task: Option<JoinHandle<()>>,
    reader_task: JoinHandle<()>,
}

impl Connection {
    /// Connect to `host:port`, over TLS when the options ask for it.
    ///
    /// Returns the connection and the receiver for its events.
    pub async fn connect(
        options: &TransportOptions,
        high_water_mark: usize,
    ) -> SenderResult<(Self, mpsc::UnboundedReceiver<ConnectionEvent>)> {
        let kind = options.kind();
        let tls_client = match kind {
            TransportKind::Plain => None,
            TransportKind::Tls => Some(TlsClient::new(options)?),
        };

        let tcp = TcpStream::connect((options.host.as_str(), options.port)).await?;
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        let connection = match tls_client {
            None => Self::spawn(tcp, kind, high_water_mark, events_tx),
            Some(client) => {
                let stream = client.handshake(tcp).await?;
                Self::spawn(stream, kind, high_water_mark, events_tx)
            }
        };

        info!(
            host = %options.host,
            port = options.port,
            kind = ?kind,
            "Connected"
        );

        Ok((connection, events_rx))
    }

    fn spawn<S>(
        stream: S,
        kind: TransportKind,
        high_water_mark: usize,
        events: mpsc::UnboundedSender<ConnectionEvent>,
    ) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (read_half, write_half) = tokio::io::split(stream);
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let buffered = Arc::new(AtomicUsize::new(0));
        let needs_drain = Arc::new(AtomicBool::new(false));

        let writer_task = tokio::spawn(write_loop(
            write_half,
            outbound_rx,
            buffered.clone(),
            needs_drain.clone(),
            events.clone(),
        ));
        let reader_task = tokio::spawn(read_loop(read_half, events));

        Self {
            kind,
            outbound: Some(outbound_tx),
            buffered,
            needs_drain,
            high_water_mark,
            writer_task: Some(writer_task),
            reader_task,
        }
    }

    /// Transport kind of this connection.
    pub fn kind(&self) -> TransportKind {
        self.kind
    }

    /// Queue bytes for the socket.
    ///
    /// Never blocks. Returns `Ok(false)` once the queue reaches the
    /// high-water mark; the bytes are still queued, but the caller should
    /// wait for [`ConnectionEvent::Drain`] before writing more.
    pub fn write(&self, bytes: Vec<u8>) -> SenderResult<bool> {
        let outbound = self.outbound.as_ref().ok_or(SenderError::WriteAfterClose)?;

        let len = bytes.len();
        let queued = self.buffered.fetch_add(len, Ordering::SeqCst) + len;

        // The flag must be up before the writer can see these bytes.
        let accepted = queued < self.high_water_mark;
        if !accepted {
            self.needs_drain.store(true, Ordering::SeqCst);
        }

        if outbound.send(bytes).is_err() {
            self.buffered.fetch_sub(len, Ordering::SeqCst);
            self.needs_drain.store(false, Ordering::SeqCst);
            return Err(SenderError::Transport("Socket writer has stopped".to_string()));
        }
        Ok(accepted)
    }

    /// Bytes queued but not yet written to the socket.
    pub fn buffered(&self) -> usize {
        self.buffered.load(Ordering::SeqCst)
    }

    /// Whether a refused write is still waiting for the queue to empty.
    pub fn needs_drain(&self) -> bool {
        self.needs_drain.load(Ordering::SeqCst) && self.buffered() > 0
    }

    /// Whether [`close`](Self::close) has been called.
    pub fn is_closed(&self) -> bool {
        self.outbound.is_none()
    }

    /// Stop accepting writes.
    ///
    /// Everything already queued is still written, then the write side of
    /// the socket is shut down. Inbound data keeps flowing until the peer
    /// closes.
    pub fn close(&mut self) {
        if self.outbound.take().is_some() {
            debug!(buffered = self.buffered(), "Closing connection for writes");
        }
    }

    /// Close for writes and wait until the queue has been flushed.
    pub async fn flushed(&mut self) -> SenderResult<()> {
        self.close();
        if let Some(task) = self.writer_task.take() {
            task.await
                .map_err(|e| SenderError::Transport(format!("Socket writer failed: {}", e)))?;
        }
        Ok(())
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.reader_task.abort();
    }
}

async fn write_loop<S: AsyncWrite>(
    mut writer: WriteHalf<S>,
    mut outbound: mpsc::UnboundedReceiver<Vec<u8>>,
    buffered: Arc<AtomicUsize>,
    needs_drain: Arc<AtomicBool>,
    events: mpsc::UnboundedSender<ConnectionEvent>,
) {
    while let Some(bytes) = outbound.recv().await {
        if let Err(e) = writer.write_all(&bytes).await {
            warn!(error = %e, "Socket write failed");
            let _ = events.send(ConnectionEvent::Error(e));
            return;
        }

        let remaining = buffered.fetch_sub(bytes.len(), Ordering::SeqCst) - bytes.len();
        if remaining == 0 {
            if let Err(e) = writer.flush().await {
                warn!(error = %e, "Socket flush failed");
                let _ = events.send(ConnectionEvent::Error(e));
                return;
            }
            if needs_drain.swap(false, Ordering::SeqCst) {
                let _ = events.send(ConnectionEvent::Drain);
            }
        }
    }

    if let Err(e) = writer.shutdown().await {
        debug!(error = %e, "Socket shutdown failed");
        let _ = events.send(ConnectionEvent::Error(e));
    }
}

async fn read_loop<S: AsyncRead>(
    mut reader: ReadHalf<S>,
    events: mpsc::UnboundedSender<ConnectionEvent>,
) {
    let mut chunk = vec![0u8; READ_CHUNK_SIZE];
    loop {
        match reader.read(&mut chunk).await {
            Ok(0) => {
                debug!("Peer closed connection");
                let _ = events.send(ConnectionEvent::Closed);
                return;
            }
            Ok(n) => {
                if events.send(ConnectionEvent::Data(chunk[..n].to_vec())).is_err() {
                    return;
                }
            }
            Err(e) => {
                warn!(error = %e, "Socket read failed");
                let _ = events.send(ConnectionEvent::Error(e));
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::net::TcpListener;

    #[test]
    fn test_kind_selection() {
        let plain = TransportOptions::new("localhost", 514);
        assert_eq!(plain.kind(), TransportKind::Plain);

        let insecure_only = TransportOptions {
            insecure: true,
            ..plain.clone()
        };
        assert_eq!(insecure_only.kind(), TransportKind::Plain);

        let with_ca = TransportOptions {
            ca: Some(Vec::new()),
            ..plain.clone()
        };
        assert_eq!(with_ca.kind(), TransportKind::Tls);

        let forced = TransportOptions { tls: true, ..plain };
        assert_eq!(forced.kind(), TransportKind::Tls);
    }

    #[tokio::test]
    async fn test_connect_refused() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let result = Connection::connect(&TransportOptions::new("127.0.0.1", port), 1024).await;
        assert!(matches!(result, Err(SenderError::Io(_))));
    }

    #[tokio::test]
    async fn test_write_and_receive_data() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let server = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 5];
            stream.read_exact(&mut buf).await.unwrap();
            stream.write_all(b"pong").await.unwrap();
            buf
        });

        let (connection, mut events) =
            Connection::connect(&TransportOptions::new("127.0.0.1", port), 1024)
                .await
                .unwrap();
        assert!(connection.write(b"ping\n".to_vec()).unwrap());

        assert_eq!(&server.await.unwrap(), b"ping\n");

        let mut inbound = Vec::new();
        while inbound.len() < 4 {
            match events.recv().await.unwrap() {
                ConnectionEvent::Data(data) => inbound.extend(data),
                ConnectionEvent::Drain => {}
                other => panic!("unexpected event {:?}", other),
            }
        }
        assert_eq!(inbound, b"pong");
    }

    #[tokio::test]
    async fn test_write_over_high_water_mark_refused_then_drains() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let server = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut received = Vec::new();
            stream.read_to_end(&mut received).await.unwrap();
            received
        });

        let (mut connection, mut events) =
            Connection::connect(&TransportOptions::new("127.0.0.1", port), 8)
                .await
                .unwrap();

        assert!(!connection.write(b"0123456789".to_vec()).unwrap());

        loop {
            match events.recv().await.unwrap() {
                ConnectionEvent::Drain => break,
                ConnectionEvent::Data(_) => {}
                other => panic!("unexpected event {:?}", other),
            }
        }
        assert!(!connection.needs_drain());
        assert_eq!(connection.buffered(), 0);

        connection.flushed().await.unwrap();
        assert!(connection.is_closed());
        assert!(matches!(
            connection.write(b"late".to_vec()),
            Err(SenderError::WriteAfterClose)
        ));

        assert_eq!(server.await.unwrap(), b"0123456789");
    }

    #[tokio::test]
    async fn test_refusals_share_one_drain() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let server = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut received = Vec::new();
            stream.read_to_end(&mut received).await.unwrap();
            received
        });

        let (mut connection, mut events) =
            Connection::connect(&TransportOptions::new("127.0.0.1", port), 8)
                .await
                .unwrap();

        for chunk in [&b"aaaaaaaa"[..], b"bbbbbbbb", b"cccccccc"] {
            assert!(!connection.write(chunk.to_vec()).unwrap());
        }

        match events.recv().await.unwrap() {
            ConnectionEvent::Drain => {}
            other => panic!("unexpected event {:?}", other),
        }
        assert!(!connection.needs_drain.load(Ordering::SeqCst));

        let extra = tokio::time::timeout(Duration::from_millis(100), events.recv()).await;
        assert!(extra.is_err(), "unexpected event {:?}", extra);

        connection.flushed().await.unwrap();
        assert_eq!(server.await.unwrap(), b"aaaaaaaabbbbbbbbcccccccc");
    }

    #[tokio::test]
    async fn test_bad_tls_material_opens_no_socket() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let options = TransportOptions {
            ca: Some(b"not a certificate".to_vec()),
            ..TransportOptions::new("127.0.0.1", port)
        };
        let result = Connection::connect(&options, 1024).await;
        assert!(matches!(result, Err(SenderError::Config(_))));

        let accepted = tokio::time::timeout(Duration::from_millis(100), listener.accept()).await;
        assert!(accepted.is_err(), "a socket was opened");
    }
}
