//! Integration tests for the sender.
//!
//! - `harness.rs`      - Mock syslog/RELP receiver
//! - `forwarding.rs`   - I. Record forwarding (Rules 1-6)
//! - `backpressure.rs` - II. Backpressure and drain (Rules 7-9)
//! - `relp.rs`         - III. RELP transactions (Rules 10-14)
//! - `lifecycle.rs`    - IV. Lifecycle and failures (Rules 15-18)
//! - `tls.rs`          - V. TLS transport (Rules 19-23)

pub(crate) mod harness;

#[allow(unused_imports)]
pub use harness::MockReceiver;
