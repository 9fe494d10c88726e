//! RELP framing and per-connection session state.
//!
//! All frames are ASCII headers followed by an opaque body:
//!
//! ```text
//! outbound: TXNO COMMAND DATALEN DATA\n
//! inbound:  TXNO rsp DATALEN BODY\n
//! ```
//!
//! DATALEN counts the body bytes only. Acknowledgments are correlated to
//! outbound frames purely by TXNO.

/// RELP transaction number.
pub type Txno = u32;

/// Highest txno issued before the counter wraps back to 1.
pub const MAX_TXNO: Txno = 999_999_999;

/// Software identification sent in the open offer.
pub const DEFAULT_RELP_SOFTWARE: &str =
    "relp-sender,0.1.0,https://github.com/relp-sender/relp-sender";

/// Command used for event frames.
pub const COMMAND_SYSLOG: &str = "syslog";

/// Command used for the opening handshake.
pub const COMMAND_OPEN: &str = "open";

/// Command used for the closing handshake.
pub const COMMAND_CLOSE: &str = "close";

/// Fixed body of the close frame.
pub const CLOSE_BODY: &str = "bye";

const RESPONSE_COMMAND: &[u8] = b"rsp";

/// Both TXNO and DATALEN are at most nine digits.
const MAX_DIGITS: usize = 9;

/// RELP session options.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelpOptions {
    /// `relp_software` value offered in the open frame.
    pub software: String,
}

impl Default for RelpOptions {
    fn default() -> Self {
        Self {
            software: DEFAULT_RELP_SOFTWARE.to_string(),
        }
    }
}

/// Which outbound frame an acknowledgment belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseCommand {
    /// Acknowledges the open handshake.
    Open,
    /// Acknowledges the close handshake.
    Close,
    /// Acknowledges an event frame.
    Syslog,
}

impl ResponseCommand {
    /// Wire name of the acknowledged command.
    pub fn as_str(self) -> &'static str {
        match self {
            ResponseCommand::Open => COMMAND_OPEN,
            ResponseCommand::Close => COMMAND_CLOSE,
            ResponseCommand::Syslog => COMMAND_SYSLOG,
        }
    }
}

/// One complete, classified acknowledgment frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseFrame {
    pub txno: Txno,
    pub command: ResponseCommand,
    /// Response body, e.g. `200 OK`.
    pub body: String,
}

/// Build an outbound frame.
pub fn encode_frame(txno: Txno, command: &str, data: &[u8]) -> Vec<u8> {
    let header = format!("{} {} {} ", txno, command, data.len());
    let mut frame = Vec::with_capacity(header.len() + data.len() + 1);
    frame.extend_from_slice(header.as_bytes());
    frame.extend_from_slice(data);
    frame.push(b'\n');
    frame
}

/// Capability text offered in the open frame.
pub fn open_offer(software: &str) -> String {
    format!(
        "relp_version=0\nrelp_software={}\ncommands={}",
        software, COMMAND_SYSLOG
    )
}

/// Read one acknowledgment frame from the start of a buffer.
///
/// Returns `None` if the buffer does not (yet) start with a complete
/// `TXNO rsp DATALEN BODY\n` frame. Returns `Some((txno, body, consumed))`
/// otherwise.
pub fn read_response(buf: &[u8]) -> Option<(Txno, &[u8], usize)> {
    let (txno, pos) = read_number(buf, 0)?;
    let pos = expect_byte(buf, pos, b' ')?;

    let end = pos + RESPONSE_COMMAND.len();
    if buf.get(pos..end)? != RESPONSE_COMMAND {
        return None;
    }
    let pos = expect_byte(buf, end, b' ')?;

    let (len, pos) = read_number(buf, pos)?;
    let len = len as usize;

    // An empty body may omit the separating space.
    if len == 0 && *buf.get(pos)? == b'\n' {
        return Some((txno, &[], pos + 1));
    }

    let body_start = expect_byte(buf, pos, b' ')?;
    let body_end = body_start + len;
    let trailer = expect_byte(buf, body_end, b'\n')?;

    Some((txno, &buf[body_start..body_end], trailer))
}

fn read_number(buf: &[u8], start: usize) -> Option<(u32, usize)> {
    let digits = buf[start.min(buf.len())..]
        .iter()
        .take_while(|b| b.is_ascii_digit())
        .count();
    if digits == 0 || digits > MAX_DIGITS {
        return None;
    }
    let end = start + digits;
    let text = std::str::from_utf8(&buf[start..end]).ok()?;
    Some((text.parse().ok()?, end))
}

fn expect_byte(buf: &[u8], pos: usize, byte: u8) -> Option<usize> {
    (*buf.get(pos)? == byte).then_some(pos + 1)
}

/// Mutable RELP state for one connection.
///
/// Owns the transaction counter, the txnos of the open and close
/// handshakes, and the bytes of not-yet-complete acknowledgments.
#[derive(Debug, Default)]
pub struct RelpState {
    txno: Txno,
    open_txno: Option<Txno>,
    close_txno: Option<Txno>,
    buffer: Vec<u8>,
}

impl RelpState {
    /// Create a fresh session; the first issued txno is 1.
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate the next txno, wrapping after [`MAX_TXNO`].
    pub fn next_txno(&mut self) -> Txno {
        if self.txno >= MAX_TXNO {
            self.txno = 0;
        }
        self.txno += 1;
        self.txno
    }

    /// Last txno issued, 0 if none yet.
    pub fn last_txno(&self) -> Txno {
        self.txno
    }

    /// Txno of the open handshake, once sent.
    pub fn open_txno(&self) -> Option<Txno> {
        self.open_txno
    }

    /// Txno of the close handshake, once sent.
    pub fn close_txno(&self) -> Option<Txno> {
        self.close_txno
    }

    /// Number of buffered inbound bytes not yet forming a complete frame.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Build the open handshake frame and remember its txno.
    pub fn open_frame(&mut self, software: &str) -> (Txno, Vec<u8>) {
        let txno = self.next_txno();
        self.open_txno = Some(txno);
        let frame = encode_frame(txno, COMMAND_OPEN, open_offer(software).as_bytes());
        (txno, frame)
    }

    /// Wrap an event payload under a newly allocated txno.
    pub fn syslog_frame(&mut self, payload: &[u8]) -> (Txno, Vec<u8>) {
        let txno = self.next_txno();
        (txno, encode_frame(txno, COMMAND_SYSLOG, payload))
    }

    /// Wrap an event payload under a caller-supplied txno.
    ///
    /// The counter is left untouched.
    pub fn resend_frame(txno: Txno, payload: &[u8]) -> Vec<u8> {
        encode_frame(txno, COMMAND_SYSLOG, payload)
    }

    /// Build the close handshake frame and remember its txno.
    pub fn close_frame(&mut self) -> (Txno, Vec<u8>) {
        let txno = self.next_txno();
        self.close_txno = Some(txno);
        (txno, encode_frame(txno, COMMAND_CLOSE, CLOSE_BODY.as_bytes()))
    }

    /// Classify an acknowledged txno against the handshake txnos.
    pub fn classify(&self, txno: Txno) -> ResponseCommand {
        if self.open_txno == Some(txno) {
            ResponseCommand::Open
        } else if self.close_txno == Some(txno) {
            ResponseCommand::Close
        } else {
            ResponseCommand::Syslog
        }
    }

    /// Append inbound bytes and return every acknowledgment now complete.
    ///
    /// Incomplete or unrecognised data stays buffered.
    pub fn receive(&mut self, data: &[u8]) -> Vec<ResponseFrame> {
        self.buffer.extend_from_slice(data);

        let mut frames = Vec::new();
        let mut offset = 0;
        while let Some((txno, body, consumed)) = read_response(&self.buffer[offset..]) {
            frames.push(ResponseFrame {
                txno,
                command: self.classify(txno),
                body: String::from_utf8_lossy(body).into_owned(),
            });
            offset += consumed;
        }
        self.buffer.drain(..offset);

        frames
    }

    #[cfg(test)]
    pub(crate) fn with_counter(txno: Txno) -> Self {
        Self {
            txno,
            ..Self::default()
        }
    }
}
