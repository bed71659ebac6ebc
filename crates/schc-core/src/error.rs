//! Error types for fragmentation sessions.
//!
//! One enum covers both what an API call can return and why a session
//! terminated: a session that entered its Error state keeps the reason and
//! surfaces it on every subsequent call. Transient peer-protocol issues are
//! absorbed into queued messages instead and never reach this type.

use thiserror::Error;

use schc_proto::ProtocolError;

/// Result alias for session operations.
pub type Result<T> = std::result::Result<T, SessionError>;

/// Errors surfaced by fragmentation and reassembly sessions.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    /// Octets did not decode to a SCHC message for this rule. The session
    /// state is untouched.
    #[error("malformed message: {0}")]
    Malformed(#[from] ProtocolError),

    /// A well-formed message arrived in a state that cannot process it.
    #[error("unexpected {message} in {state} state")]
    UnexpectedState {
        /// State the session was in
        state: &'static str,
        /// Kind of message that arrived
        message: &'static str,
    },

    /// The Reassembly Check Sequence did not match.
    #[error("integrity check failed")]
    IntegrityFailed,

    /// The sender ran out of ACK-REQ retries without a conclusive ACK.
    #[error("no conclusive ACK after {attempts} requests")]
    AttemptsExhausted {
        /// Requests made before giving up
        attempts: u32,
    },

    /// The receiver's inactivity timer fired.
    #[error("inactivity timeout")]
    InactivityTimeout,

    /// The peer aborted the session.
    #[error("session aborted by peer")]
    Aborted,

    /// The smallest pending message does not fit the supplied MTU. Not
    /// fatal; retry with a larger MTU.
    #[error("message of {needed} bytes exceeds the {mtu}-byte MTU")]
    NoBudget {
        /// FRMPayload bytes of the smallest pending message
        needed: usize,
        /// MTU the caller offered
        mtu: usize,
    },

    /// The rule ID cannot run a fragmentation session.
    #[error("rule {0} is not supported for fragmentation")]
    NotSupported(u8),
}

impl SessionError {
    /// True when the caller may retry the same call and succeed (today only
    /// an insufficient MTU).
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::NoBudget { .. })
    }
}
