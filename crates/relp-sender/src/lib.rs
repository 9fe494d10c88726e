//! relp-sender: flow-controlled syslog event sender over TCP or TLS.
//!
//! Each logical message becomes one syslog line, optionally wrapped in a
//! RELP transaction frame, and is queued on a single connection whose
//! write-acceptance signal is honoured end to end.
//!
//! # Core Invariants
//!
//! 1. **Ordered**: Records reach the socket in exactly the order they were sent
//! 2. **One Record, One Line**: Every encoded record ends with exactly one newline
//! 3. **Backpressure Honoured**: A refused write suspends multi-record writes until drain
//! 4. **Monotonic Txnos**: RELP frames carry strictly increasing txnos, wrapping after 999999999
//! 5. **No Write After End**: Once ended, every write fails with "write after close"
//!
//! # Architecture
//!
//! ```text
//! Message -> RecordEncoder -> [RelpState frame] -> Connection -> socket
//!                                    ^                  |
//!                                    |_____ acks _______|
//! ```

pub mod config;
pub mod encoder;
pub mod error;
pub mod relp;
pub mod sender;
pub mod tls;
pub mod transport;
pub mod writer;

#[cfg(test)]
mod tests;

pub use config::{SenderConfig, SenderSettings};
pub use encoder::{EnvelopeOptions, Message, RecordEncoder};
pub use error::{SenderError, SenderResult};
pub use relp::{RelpOptions, RelpState, ResponseCommand, ResponseFrame, Txno};
pub use sender::{Forwarded, Sender, SenderEvent, Sent};
pub use transport::{Connection, ConnectionEvent, TransportKind, TransportOptions};
pub use writer::{ChunkEncoding, PendingBuffer};
