//! LoRaWAN profile parameter tables (RFC 9011).
//!
//! A [`Profile`] is a value object holding every constant the codec and the
//! state machines need for one (profile, rule id) pair: field bit-widths,
//! window and tile geometry, attempt budget and timer durations. All emitted
//! frames are aligned to the profile's L2 word.

use std::time::Duration;

use crate::errors::{ProtocolError, Result};

/// Fragmentation parameters for one LoRaWAN rule ID.
///
/// # Invariants
///
/// - Every message header width plus its padding is a multiple of
///   [`Profile::l2_word`].
/// - `window_size == 2^n - 1` (the all-ones FCN is reserved for the All-1
///   Fragment).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Profile {
    rule_id: u8,
    /// RuleID width in bits (the LoRaWAN FPort byte).
    pub rule_size: usize,
    /// L2 word size in bits; every frame is padded to a multiple of this.
    pub l2_word: usize,
    /// DTag width in bits (0 on both LoRaWAN rules).
    pub t: usize,
    /// W (window index) width in bits.
    pub m: usize,
    /// FCN width in bits.
    pub n: usize,
    /// RCS width in bits.
    pub u: usize,
    /// Tiles per window.
    pub window_size: usize,
    /// Tile size in bits; 0 means the device picks per MTU (Ack-Always).
    pub tile_size: usize,
    /// ACK-REQ retries before the sender aborts.
    pub max_ack_requests: u32,
    /// Receiver gives up after this long without traffic.
    pub inactivity_timeout: Duration,
    /// Sender re-requests an ACK after this long without one.
    pub retransmission_timeout: Duration,
}

impl Profile {
    /// Uplink data transfer, Ack-on-Error mode.
    pub const ACK_ON_ERROR: u8 = 20;

    /// Downlink data transfer, Ack-Always mode.
    pub const ACK_ALWAYS: u8 = 21;

    /// Reserved FPort on which fragmentation is impossible.
    pub const NOT_POSSIBLE: u8 = 22;

    /// Profile for a LoRaWAN fragmentation rule.
    ///
    /// # Errors
    ///
    /// - `ProtocolError::FragmentationNotPossible` for rule 22
    /// - `ProtocolError::UnknownRule` for any other FPort (compression rules
    ///   are not handled by this layer)
    pub fn lorawan(rule_id: u8) -> Result<Self> {
        match rule_id {
            Self::ACK_ON_ERROR => Ok(Self {
                rule_id,
                rule_size: 8,
                l2_word: 8,
                t: 0,
                m: 2,
                n: 6,
                u: 32,
                window_size: 63,
                tile_size: 10 * 8,
                max_ack_requests: 8,
                inactivity_timeout: Duration::from_secs(30),
                retransmission_timeout: Duration::from_secs(5),
            }),
            Self::ACK_ALWAYS => Ok(Self {
                rule_id,
                rule_size: 8,
                l2_word: 8,
                t: 0,
                m: 1,
                n: 1,
                u: 32,
                window_size: 1,
                tile_size: 0,
                max_ack_requests: 8,
                inactivity_timeout: Duration::from_secs(12 * 60 * 60),
                retransmission_timeout: Duration::from_secs(30),
            }),
            Self::NOT_POSSIBLE => Err(ProtocolError::FragmentationNotPossible(rule_id)),
            other => Err(ProtocolError::UnknownRule(other)),
        }
    }

    /// Rule ID (and LoRaWAN FPort) of this profile.
    #[must_use]
    pub fn rule_id(&self) -> u8 {
        self.rule_id
    }

    /// All-ones FCN value marking an All-1 Fragment.
    #[must_use]
    pub fn max_fcn(&self) -> u8 {
        ((1u16 << self.n) - 1) as u8
    }

    /// Mask for wire-encoding the window counter into `m` bits.
    #[must_use]
    pub fn w_mask(&self) -> u16 {
        (1u16 << self.m) - 1
    }

    /// Header bits of a Regular Fragment: RuleID ‖ DTag ‖ W ‖ FCN.
    #[must_use]
    pub fn fragment_header_bits(&self) -> usize {
        self.rule_size + self.t + self.m + self.n
    }

    /// Header bits of an All-1 Fragment: RuleID ‖ DTag ‖ W ‖ FCN ‖ RCS.
    #[must_use]
    pub fn all1_header_bits(&self) -> usize {
        self.fragment_header_bits() + self.u
    }

    /// Header bits of an ACK up to and including C: RuleID ‖ DTag ‖ W ‖ C.
    #[must_use]
    pub fn ack_header_bits(&self) -> usize {
        self.rule_size + self.t + self.m + 1
    }

    /// Zero bits needed to extend `bits` to the next L2 word boundary.
    #[must_use]
    pub fn padding_bits(&self, bits: usize) -> usize {
        (self.l2_word - bits % self.l2_word) % self.l2_word
    }
}
