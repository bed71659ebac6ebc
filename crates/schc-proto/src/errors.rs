//! Error types for the SCHC wire layer.
//!
//! Parsing errors are structural: the octets do not form a well-shaped SCHC
//! message for the profile in use. They never carry session state; the
//! fragmentation machines decide what a malformed frame means for a session.

use thiserror::Error;

/// Result alias for wire-layer operations.
pub type Result<T> = std::result::Result<T, ProtocolError>;

/// Errors raised while encoding or parsing SCHC messages.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// Input ended before a required field was complete.
    #[error("message truncated: needed {needed} more bits, {available} available")]
    Truncated {
        /// Bits the parser still had to read
        needed: usize,
        /// Bits left in the input
        available: usize,
    },

    /// Frame length is not a whole number of L2 words.
    #[error("frame of {bits} bits is not a multiple of the {l2_word}-bit L2 word")]
    Misaligned {
        /// Total frame length in bits
        bits: usize,
        /// L2 word size of the profile
        l2_word: usize,
    },

    /// Total length and header bits match no message kind for this rule.
    #[error("no {endpoint} message of rule {rule_id} is {bits} bits long")]
    UnknownShape {
        /// Rule ID the frame was parsed under
        rule_id: u8,
        /// Total frame length in bits (FPort included)
        bits: usize,
        /// Which endpoint attempted the parse
        endpoint: &'static str,
    },

    /// An abort message whose fixed all-ones fields are not all ones.
    #[error("malformed abort: {0}")]
    BadAbort(&'static str),

    /// LoRaWAN rule 22: fragmentation is not possible on this FPort.
    #[error("rule {0} cannot carry fragmented packets")]
    FragmentationNotPossible(u8),

    /// FPort is not one of the fragmentation rules of this profile.
    #[error("rule {0} is not a LoRaWAN fragmentation rule")]
    UnknownRule(u8),
}
