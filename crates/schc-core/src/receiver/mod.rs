//! Reassembler state machines.
//!
//! ```text
//!              ┌───────────┐ window complete / ACK ┌─────────┐
//!  fragment ──>│ Receiving │──────────────────────>│ Waiting │
//!              └───────────┘                       └─────────┘
//!                    │  All-1, RCS ok                │      │ retransmission
//!                    v                     new window│      v
//!                  End <── C=1 ACK emitted ──────────┘ ┌──────────────────┐
//!                                                      │ ReceivingMissing │
//!              Error <── RCS mismatch / timeout ───────└──────────────────┘
//! ```
//!
//! The success callback fires when the C=1 ACK is actually handed to the
//! host, not when it is queued; until then a lost ACK can still be re-sent.

mod ack_always;
mod ack_on_error;

pub use ack_always::AckAlwaysReceiver;
pub use ack_on_error::AckOnErrorReceiver;

/// States of a reassembler session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ReceiverState {
    /// Collecting tiles of the current window in FCN countdown order.
    Receiving,
    /// Window acknowledged; expecting retransmissions or the next window.
    Waiting,
    /// Filling bitmap holes from selective retransmissions.
    ReceivingMissing,
    /// Packet delivered.
    End,
    /// Aborted; the exit reason is kept on the session.
    Error,
}

impl ReceiverState {
    pub(crate) fn name(self) -> &'static str {
        match self {
            Self::Receiving => "Receiving",
            Self::Waiting => "Waiting",
            Self::ReceivingMissing => "ReceivingMissing",
            Self::End => "End",
            Self::Error => "Error",
        }
    }
}
