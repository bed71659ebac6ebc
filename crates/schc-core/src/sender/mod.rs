//! Fragmenter state machines.
//!
//! Both LoRaWAN modes share the same state alphabet; what differs is how
//! windows advance. Ack-on-Error streams up to 63 tiles per window and
//! recovers selectively from bitmaps; Ack-Always is stop-and-wait with one
//! tile per window.
//!
//! ```text
//!             ┌─────────┐  window closed / All-1  ┌─────────┐
//!  Initial ──>│ Sending │────────────────────────>│ Waiting │──ACK(C=1)──> End
//!             └─────────┘                         └─────────┘
//!                  ^                                │     │ timer × budget
//!                  │ ACK: window complete           │     └─────────────> Error
//!                  │                    ACK: missing│
//!                  │              ┌───────────┐     │
//!                  └──────────────│ Resending │<────┘
//!                     (next wnd)  └───────────┘
//! ```

mod ack_always;
mod ack_on_error;

pub use ack_always::AckAlwaysSender;
pub use ack_on_error::AckOnErrorSender;

/// States of a fragmenter session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SenderState {
    /// Emitting fresh tiles of the current window.
    Sending,
    /// Window closed; waiting for an ACK or the retransmission timer.
    Waiting,
    /// Re-emitting tiles the last bitmap reported missing.
    Resending,
    /// Final ACK consumed; the packet was delivered.
    End,
    /// Aborted; the exit reason is kept on the session.
    Error,
}

impl SenderState {
    pub(crate) fn name(self) -> &'static str {
        match self {
            Self::Sending => "Sending",
            Self::Waiting => "Waiting",
            Self::Resending => "Resending",
            Self::End => "End",
            Self::Error => "Error",
        }
    }
}
