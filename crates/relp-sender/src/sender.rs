//! The sender: encoder, backpressure writer and optional RELP session on top
//! of one connection.
//!
//! The sender is driven by its owner. Connection events are processed
//! whenever the owner calls into it: non-blocking calls handle whatever has
//! already arrived, while [`Sender::write`], [`Sender::drained`] and
//! [`Sender::next_event`] wait for more.

use crate::config::SenderConfig;
use crate::encoder::{Message, RecordEncoder};
use crate::error::{SenderError, SenderResult};
use crate::relp::{RelpState, ResponseCommand, ResponseFrame, Txno};
use crate::transport::{Connection, ConnectionEvent, TransportKind};
use crate::writer::{read_line_batch, ChunkEncoding, PendingBuffer};
use std::collections::VecDeque;
use std::io::Write;
use tokio::io::{AsyncRead, BufReader};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TryRecvError;
use tracing::{debug, info, trace, warn};

/// Bytes of whole lines gathered per write when piping a reader.
const PIPE_BATCH_SIZE: usize = 64 * 1024;

/// Outcome of queueing one record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Sent {
    /// `false` when the caller should wait for [`Sender::drained`] before
    /// queueing more. The record itself is queued either way.
    pub accepted: bool,
    /// Transaction number of the frame, when RELP is enabled.
    pub txno: Option<Txno>,
}

/// Counts reported by [`Sender::forward`].
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Forwarded {
    /// Bytes read from the input.
    pub bytes: usize,
    /// RELP event acknowledgments taken while forwarding.
    pub acknowledged: usize,
}

/// Notification surfaced by [`Sender::next_event`].
#[derive(Debug)]
pub enum SenderEvent {
    /// A RELP acknowledgment was correlated.
    Response(ResponseFrame),
    /// The outbound queue emptied after a refused write.
    Drain,
    /// The connection failed.
    Error(SenderError),
    /// The peer closed its side of the connection.
    Closed,
}

/// Event sender over one TCP or TLS connection.
pub struct Sender {
    connection: Connection,
    events: mpsc::UnboundedReceiver<ConnectionEvent>,
    encoder: RecordEncoder,
    relp: Option<RelpState>,
    pending: VecDeque<SenderEvent>,
    drain_queued: bool,
    echo: Option<Box<dyn Write + Send>>,
    failure: Option<String>,
    peer_closed: bool,
    ended: bool,
}

impl Sender {
    /// Connect and, with RELP enabled, send the open handshake.
    ///
    /// The open acknowledgment is not awaited; records may be sent right away.
    pub async fn connect(config: SenderConfig) -> SenderResult<Self> {
        let (connection, events) =
            Connection::connect(&config.transport, config.high_water_mark).await?;

        let mut sender = Self {
            connection,
            events,
            echo: config
                .envelope
                .debug
                .then(|| Box::new(std::io::stdout()) as Box<dyn Write + Send>),
            encoder: RecordEncoder::new(config.envelope),
            relp: None,
            pending: VecDeque::new(),
            drain_queued: false,
            failure: None,
            peer_closed: false,
            ended: false,
        };

        if let Some(options) = config.relp {
            let mut state = RelpState::new();
            let (txno, frame) = state.open_frame(&options.software);
            sender.connection.write(frame)?;
            sender.relp = Some(state);
            debug!(txno, software = %options.software, "Sent RELP open");
        }

        Ok(sender)
    }

    /// Whether the RELP overlay is enabled.
    pub fn is_relp(&self) -> bool {
        self.relp.is_some()
    }

    /// Transport kind of the underlying connection.
    pub fn kind(&self) -> TransportKind {
        self.connection.kind()
    }

    /// RELP session state, when enabled.
    pub fn relp_state(&self) -> Option<&RelpState> {
        self.relp.as_ref()
    }

    /// Bytes queued on the connection but not yet written to the socket.
    pub fn buffered(&self) -> usize {
        self.connection.buffered()
    }

    /// Whether a refused write is still waiting for [`drained`](Self::drained).
    pub fn needs_drain(&self) -> bool {
        self.connection.needs_drain()
    }

    /// Send the debug echo to `writer` instead of stdout.
    ///
    /// Has no effect unless the envelope's `debug` flag is set.
    pub fn set_echo(&mut self, writer: impl Write + Send + 'static) {
        if self.echo.is_some() {
            self.echo = Some(Box::new(writer));
        }
    }

    /// Whether the peer has closed its side of the connection.
    pub fn peer_closed(&self) -> bool {
        self.peer_closed
    }

    /// Encode and queue one record.
    ///
    /// Without RELP, only `accepted` is meaningful. With RELP, the record is
    /// wrapped in a new transaction and its txno is returned; the matching
    /// acknowledgment is held until taken with [`next_event`](Self::next_event)
    /// or [`try_next_event`](Self::try_next_event).
    pub fn send(&mut self, message: impl Into<Message>) -> SenderResult<Sent> {
        self.check_writable()?;
        let line = self.encode(&message.into());

        match self.relp.as_mut() {
            None => {
                let accepted = self.connection.write(line.into_bytes())?;
                Ok(Sent { accepted, txno: None })
            }
            Some(relp) => {
                let (txno, frame) = relp.syslog_frame(without_terminator(&line));
                let accepted = self.connection.write(frame)?;
                trace!(txno, accepted, "Queued RELP frame");
                Ok(Sent {
                    accepted,
                    txno: Some(txno),
                })
            }
        }
    }

    /// Send a record again under an existing txno.
    ///
    /// The transaction counter is not advanced. Fails without touching the
    /// network when RELP is disabled.
    pub fn resend(&mut self, message: impl Into<Message>, txno: Txno) -> SenderResult<Sent> {
        self.require_relp("resend")?;
        self.check_writable()?;

        let line = self.encode(&message.into());
        let frame = RelpState::resend_frame(txno, without_terminator(&line));
        let accepted = self.connection.write(frame)?;
        debug!(txno, accepted, "Resent RELP frame");

        Ok(Sent {
            accepted,
            txno: Some(txno),
        })
    }

    /// Send the RELP close handshake and close the connection for writes
    /// once everything queued has been flushed.
    ///
    /// Acknowledgments keep arriving through [`next_event`](Self::next_event)
    /// until the peer closes.
    pub fn send_close(&mut self) -> SenderResult<Txno> {
        self.require_relp("send_close")?;
        self.check_writable()?;

        let (txno, frame) = match self.relp.as_mut() {
            Some(relp) => relp.close_frame(),
            None => return Err(SenderError::RelpDisabled("send_close")),
        };
        self.connection.write(frame)?;
        self.connection.close();
        self.ended = true;
        info!(txno, "Sent RELP close");

        Ok(txno)
    }

    /// Split a payload into newline-delimited records and send them in order.
    ///
    /// Whenever the connection refuses a write, waits for it to drain before
    /// sending the next record. Resolves once every record has been queued;
    /// a refusal on the last record does not delay completion.
    pub async fn write(&mut self, chunk: &[u8]) -> SenderResult<()> {
        self.check_writable()?;

        let mut pending = PendingBuffer::new(chunk.to_vec());
        let mut records = 0usize;
        while let Some(record) = pending.next_record() {
            let message = Message::from(record);
            let sent = self.send(message)?;
            records += 1;

            if !sent.accepted && !pending.is_empty() {
                debug!(
                    records,
                    remaining = pending.remaining().len(),
                    "Write refused, waiting for drain"
                );
                self.drained().await?;
            }
        }

        trace!(records, "Chunk written");
        Ok(())
    }

    /// Decode a string chunk and [`write`](Self::write) it.
    pub async fn write_encoded(&mut self, text: &str, encoding: ChunkEncoding) -> SenderResult<()> {
        let bytes = encoding.decode(text)?;
        self.write(&bytes).await
    }

    /// Write everything a reader produces, in batches of whole lines.
    ///
    /// Returns the number of bytes read.
    pub async fn pipe<R: AsyncRead + Unpin>(&mut self, reader: R) -> SenderResult<usize> {
        let mut reader = BufReader::new(reader);
        let mut batch = Vec::with_capacity(PIPE_BATCH_SIZE);
        let mut total = 0;

        while read_line_batch(&mut reader, &mut batch, PIPE_BATCH_SIZE).await? > 0 {
            total += batch.len();
            self.write(&batch).await?;
        }

        debug!(bytes = total, "Input exhausted");
        Ok(total)
    }

    /// [`pipe`](Self::pipe) a reader, taking notifications between batches
    /// so acknowledgments do not collect while input is still being read.
    ///
    /// A connection error observed between batches ends the forward.
    pub async fn forward<R: AsyncRead + Unpin>(&mut self, reader: R) -> SenderResult<Forwarded> {
        let mut reader = BufReader::new(reader);
        let mut batch = Vec::with_capacity(PIPE_BATCH_SIZE);
        let mut forwarded = Forwarded::default();

        while read_line_batch(&mut reader, &mut batch, PIPE_BATCH_SIZE).await? > 0 {
            forwarded.bytes += batch.len();
            self.write(&batch).await?;
            forwarded.acknowledged += self.take_acknowledgments()?;
        }

        debug!(
            bytes = forwarded.bytes,
            acknowledged = forwarded.acknowledged,
            "Input exhausted"
        );
        Ok(forwarded)
    }

    /// Wait until a refused write has drained.
    ///
    /// Returns immediately when nothing is waiting to drain. Inbound data is
    /// processed while waiting.
    pub async fn drained(&mut self) -> SenderResult<()> {
        while self.connection.needs_drain() {
            match self.events.recv().await {
                Some(ConnectionEvent::Drain) => {}
                Some(ConnectionEvent::Data(data)) => self.receive(&data),
                Some(ConnectionEvent::Error(e)) => return Err(self.fail(e)),
                Some(ConnectionEvent::Closed) => self.mark_peer_closed(),
                None => return Err(SenderError::ConnectionClosed),
            }
        }
        Ok(())
    }

    /// Wait for the next notification.
    ///
    /// Returns `None` once the connection is fully closed and every
    /// notification has been delivered.
    pub async fn next_event(&mut self) -> Option<SenderEvent> {
        loop {
            if let Some(event) = self.pop_pending() {
                return Some(event);
            }

            match self.events.recv().await? {
                ConnectionEvent::Data(data) => self.receive(&data),
                ConnectionEvent::Drain => return Some(SenderEvent::Drain),
                ConnectionEvent::Error(e) => return Some(SenderEvent::Error(self.fail(e))),
                ConnectionEvent::Closed => {
                    self.peer_closed = true;
                    return Some(SenderEvent::Closed);
                }
            }
        }
    }

    /// Take the next notification that has already arrived, without waiting.
    pub fn try_next_event(&mut self) -> Option<SenderEvent> {
        if let Err(e) = self.pump() {
            return Some(SenderEvent::Error(e));
        }
        self.pop_pending()
    }

    /// Wait for the next RELP acknowledgment.
    ///
    /// Returns `Ok(None)` if the connection closes first.
    pub async fn next_response(&mut self) -> SenderResult<Option<ResponseFrame>> {
        loop {
            match self.next_event().await {
                Some(SenderEvent::Response(frame)) => return Ok(Some(frame)),
                Some(SenderEvent::Error(e)) => return Err(e),
                Some(SenderEvent::Closed) | None => return Ok(None),
                Some(SenderEvent::Drain) => {}
            }
        }
    }

    /// Flush everything queued and close the connection for writes.
    ///
    /// Any later write fails with [`SenderError::WriteAfterClose`].
    pub async fn end(&mut self) -> SenderResult<()> {
        self.ended = true;
        self.connection.flushed().await?;
        self.pump()?;
        if let Some(reason) = &self.failure {
            return Err(SenderError::Transport(reason.clone()));
        }
        info!("Sender ended");
        Ok(())
    }

    /// Consume every notification that has already arrived and count the
    /// event acknowledgments among them.
    fn take_acknowledgments(&mut self) -> SenderResult<usize> {
        let mut acknowledged = 0;
        while let Some(event) = self.try_next_event() {
            match event {
                SenderEvent::Response(frame) => {
                    if !frame.body.starts_with("200") {
                        warn!(txno = frame.txno, body = %frame.body, "RELP transaction refused");
                    }
                    if frame.command == ResponseCommand::Syslog {
                        acknowledged += 1;
                    }
                }
                SenderEvent::Error(e) => return Err(e),
                SenderEvent::Closed => debug!("Peer closed while forwarding"),
                SenderEvent::Drain => {}
            }
        }
        Ok(acknowledged)
    }

    fn encode(&mut self, message: &Message) -> String {
        let line = self.encoder.encode(message);
        if let Some(echo) = self.echo.as_mut() {
            if let Err(e) = writeln!(echo, "{}", line.trim()) {
                warn!(error = %e, "Debug echo failed");
            }
        }
        line
    }

    fn require_relp(&self, operation: &'static str) -> SenderResult<()> {
        if self.relp.is_none() {
            warn!(operation, "RELP operation called without RELP enabled");
            return Err(SenderError::RelpDisabled(operation));
        }
        Ok(())
    }

    fn check_writable(&mut self) -> SenderResult<()> {
        if self.ended || self.connection.is_closed() {
            return Err(SenderError::WriteAfterClose);
        }
        self.pump()?;
        if let Some(reason) = &self.failure {
            return Err(SenderError::Transport(reason.clone()));
        }
        Ok(())
    }

    /// Handle every event that has already arrived, without waiting.
    fn pump(&mut self) -> SenderResult<()> {
        loop {
            match self.events.try_recv() {
                Ok(ConnectionEvent::Data(data)) => self.receive(&data),
                Ok(ConnectionEvent::Drain) => self.queue_drain(),
                Ok(ConnectionEvent::Error(e)) => return Err(self.fail(e)),
                Ok(ConnectionEvent::Closed) => self.mark_peer_closed(),
                Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => return Ok(()),
            }
        }
    }

    fn receive(&mut self, data: &[u8]) {
        let Some(relp) = self.relp.as_mut() else {
            trace!(bytes = data.len(), "Ignoring inbound data without RELP");
            return;
        };

        for frame in relp.receive(data) {
            debug!(
                txno = frame.txno,
                command = frame.command.as_str(),
                body = %frame.body,
                "RELP response"
            );
            self.pending.push_back(SenderEvent::Response(frame));
        }
    }

    /// At most one drain notification waits in the queue at a time.
    fn queue_drain(&mut self) {
        if !self.drain_queued {
            self.drain_queued = true;
            self.pending.push_back(SenderEvent::Drain);
        }
    }

    fn pop_pending(&mut self) -> Option<SenderEvent> {
        let event = self.pending.pop_front()?;
        if matches!(event, SenderEvent::Drain) {
            self.drain_queued = false;
        }
        Some(event)
    }

    fn mark_peer_closed(&mut self) {
        self.peer_closed = true;
        self.pending.push_back(SenderEvent::Closed);
    }

    fn fail(&mut self, error: std::io::Error) -> SenderError {
        warn!(error = %error, "Connection failed");
        self.failure = Some(error.to_string());
        SenderError::Io(error)
    }
}

#[cfg(test)]
impl Sender {
    pub(crate) fn queued_events(&self) -> usize {
        self.pending.len()
    }
}

fn without_terminator(line: &str) -> &[u8] {
    line.strip_suffix('\n').unwrap_or(line).as_bytes()
}
