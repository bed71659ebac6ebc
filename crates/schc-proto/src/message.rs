//! SCHC message types and their bit-exact encodings.
//!
//! Every message is `[Header][Payload][Padding]`: a concatenation of
//! fixed-width bit fields, an optional tile payload, and zero bits up to the
//! next L2 word. On LoRaWAN the RuleID is carried as the FPort byte and
//! excluded from the FRMPayload, so encoders return an `(FPort, FRMPayload)`
//! pair; the concatenated form is derivable from it.
//!
//! The Receiver-Abort deliberately breaks the padding rule: after C it is
//! filled with ones to the word boundary plus one further full word of ones,
//! which keeps it distinguishable from a short ACK even with no DTag.

use bytes::Bytes;

use crate::{
    bits::BitWriter,
    profile::Profile,
};

/// Tile payload of a fragment: a finite bit string with explicit length.
///
/// Tiles are byte strings in practice, but the last tile of a packet with a
/// compression residue may end mid-byte; unused trailing bits of the final
/// byte are zero.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct FragmentPayload {
    bytes: Bytes,
    bit_len: usize,
}

impl FragmentPayload {
    /// Payload covering all of `bytes`.
    #[must_use]
    pub fn from_bytes(bytes: impl Into<Bytes>) -> Self {
        let bytes = bytes.into();
        let bit_len = bytes.len() * 8;
        Self { bytes, bit_len }
    }

    /// Payload covering the first `bit_len` bits of `bytes`.
    #[must_use]
    pub fn from_bits(bytes: impl Into<Bytes>, bit_len: usize) -> Self {
        let bytes = bytes.into();
        debug_assert!(bit_len <= bytes.len() * 8);
        Self { bytes, bit_len }
    }

    /// Length in bits.
    #[must_use]
    pub fn bit_len(&self) -> usize {
        self.bit_len
    }

    /// True for a zero-length payload.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.bit_len == 0
    }

    /// Backing bytes; the last byte may be partially used.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }
}

/// Regular Fragment: one or more tiles of the current window.
///
/// `RuleID ‖ DTag ‖ W ‖ FCN ‖ payload ‖ padding`. The FCN is the number of
/// the first tile carried; the receiver assigns subsequent tiles to the
/// following positions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegularFragment {
    /// Rule ID (FPort).
    pub rule_id: u8,
    /// Datagram tag; absent when the profile has t=0.
    pub dtag: Option<u16>,
    /// Window index, already masked to `m` bits.
    pub w: u16,
    /// FCN of the first carried tile, in `[0, 2^n - 2]`.
    pub fcn: u8,
    /// Concatenated tiles in transmission order.
    pub payload: FragmentPayload,
}

/// All-1 Fragment: last fragment of the last window, carrying the RCS.
///
/// `RuleID ‖ DTag ‖ W ‖ FCN=all-ones ‖ RCS ‖ payload ‖ padding`. The payload
/// is at most one tile.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct All1Fragment {
    /// Rule ID (FPort).
    pub rule_id: u8,
    /// Datagram tag; absent when the profile has t=0.
    pub dtag: Option<u16>,
    /// Window index, already masked to `m` bits.
    pub w: u16,
    /// Reassembly Check Sequence over the padded packet.
    pub rcs: u32,
    /// The final tile; may be empty.
    pub payload: FragmentPayload,
}

/// ACK: integrity bit plus, when C=0, the compressed window bitmap.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ack {
    /// Rule ID (FPort).
    pub rule_id: u8,
    /// Datagram tag; absent when the profile has t=0.
    pub dtag: Option<u16>,
    /// Window index, already masked to `m` bits.
    pub w: u16,
    /// C bit: true when reassembly integrity checked out.
    pub c: bool,
    /// Compressed bitmap; present exactly when `c` is false.
    pub bitmap: Option<Vec<bool>>,
}

/// ACK-REQ: the sender asking the receiver to (re-)confirm a window.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AckReq {
    /// Rule ID (FPort).
    pub rule_id: u8,
    /// Datagram tag; absent when the profile has t=0.
    pub dtag: Option<u16>,
    /// Window index, already masked to `m` bits.
    pub w: u16,
}

/// Sender-Abort: the sender gives up; W and FCN are all ones.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SenderAbort {
    /// Rule ID (FPort).
    pub rule_id: u8,
    /// Datagram tag; absent when the profile has t=0.
    pub dtag: Option<u16>,
}

/// Receiver-Abort: the receiver gives up; W all ones, C=1, ones filler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceiverAbort {
    /// Rule ID (FPort).
    pub rule_id: u8,
    /// Datagram tag; absent when the profile has t=0.
    pub dtag: Option<u16>,
}

/// Every SCHC message the LoRaWAN profile exchanges.
///
/// # Invariants
///
/// - Encoding any variant yields a bit length that is a multiple of the
///   profile's L2 word.
/// - `parse(encode(m)) == m` for the matching endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SchcMessage {
    /// Tiles of the current window.
    Regular(RegularFragment),
    /// Final fragment with the RCS.
    All1(All1Fragment),
    /// Window acknowledgement.
    Ack(Ack),
    /// Acknowledgement request.
    AckReq(AckReq),
    /// Sender gave up.
    SenderAbort(SenderAbort),
    /// Receiver gave up.
    ReceiverAbort(ReceiverAbort),
}

impl SchcMessage {
    /// Human-readable message kind, for logs and error context.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Regular(_) => "Regular Fragment",
            Self::All1(_) => "All-1 Fragment",
            Self::Ack(_) => "ACK",
            Self::AckReq(_) => "ACK-REQ",
            Self::SenderAbort(_) => "Sender-Abort",
            Self::ReceiverAbort(_) => "Receiver-Abort",
        }
    }

    /// Rule ID this message travels under.
    #[must_use]
    pub fn rule_id(&self) -> u8 {
        match self {
            Self::Regular(m) => m.rule_id,
            Self::All1(m) => m.rule_id,
            Self::Ack(m) => m.rule_id,
            Self::AckReq(m) => m.rule_id,
            Self::SenderAbort(m) => m.rule_id,
            Self::ReceiverAbort(m) => m.rule_id,
        }
    }

    /// Total encoded length in bits, padding included.
    #[must_use]
    pub fn bit_len(&self, profile: &Profile) -> usize {
        let unpadded = match self {
            Self::Regular(m) => profile.fragment_header_bits() + m.payload.bit_len(),
            Self::All1(m) => profile.all1_header_bits() + m.payload.bit_len(),
            Self::Ack(m) => {
                profile.ack_header_bits() + m.bitmap.as_ref().map_or(0, Vec::len)
            }
            Self::AckReq(_) | Self::SenderAbort(_) => profile.fragment_header_bits(),
            Self::ReceiverAbort(_) => {
                let header = profile.ack_header_bits();
                return header + profile.padding_bits(header) + profile.l2_word;
            }
        };
        unpadded + profile.padding_bits(unpadded)
    }

    /// FRMPayload length in bytes (the FPort byte is not counted); this is
    /// what an MTU budget is checked against.
    #[must_use]
    pub fn frm_payload_len(&self, profile: &Profile) -> usize {
        self.bit_len(profile) / 8 - profile.rule_size / 8
    }

    /// Encode to the LoRaWAN pair `(FPort, FRMPayload)`.
    #[must_use]
    pub fn to_bytes(&self, profile: &Profile) -> (u8, Bytes) {
        debug_assert_eq!(profile.rule_size, 8);
        debug_assert_eq!(profile.l2_word, 8);

        let mut w = BitWriter::new();
        match self {
            Self::Regular(m) => {
                push_common(&mut w, profile, m.rule_id, m.dtag, m.w);
                w.push_bits(u64::from(m.fcn), profile.n);
                w.push_field(m.payload.as_bytes(), m.payload.bit_len());
                w.pad_to_word(profile.l2_word);
            }
            Self::All1(m) => {
                push_common(&mut w, profile, m.rule_id, m.dtag, m.w);
                w.push_bits(u64::from(profile.max_fcn()), profile.n);
                w.push_bits(u64::from(m.rcs), profile.u);
                w.push_field(m.payload.as_bytes(), m.payload.bit_len());
                w.pad_to_word(profile.l2_word);
            }
            Self::Ack(m) => {
                push_common(&mut w, profile, m.rule_id, m.dtag, m.w);
                w.push_bit(m.c);
                if let Some(bitmap) = &m.bitmap {
                    for &bit in bitmap {
                        w.push_bit(bit);
                    }
                }
                w.pad_to_word(profile.l2_word);
            }
            Self::AckReq(m) => {
                push_common(&mut w, profile, m.rule_id, m.dtag, m.w);
                w.push_bits(0, profile.n);
                w.pad_to_word(profile.l2_word);
            }
            Self::SenderAbort(m) => {
                push_common(&mut w, profile, m.rule_id, m.dtag, u16::MAX);
                w.push_bits(u64::from(profile.max_fcn()), profile.n);
                w.pad_to_word(profile.l2_word);
            }
            Self::ReceiverAbort(m) => {
                push_common(&mut w, profile, m.rule_id, m.dtag, u16::MAX);
                w.push_bit(true);
                let filler = profile.padding_bits(w.len()) + profile.l2_word;
                w.push_repeated(true, filler);
            }
        }

        debug_assert_eq!(w.len() % profile.l2_word, 0);
        debug_assert_eq!(w.len(), self.bit_len(profile));

        let bytes = w.into_bytes();
        (bytes[0], Bytes::copy_from_slice(&bytes[1..]))
    }

    /// Encode to the concatenated `FPort ‖ FRMPayload` octet string.
    #[must_use]
    pub fn to_wire(&self, profile: &Profile) -> Bytes {
        let (fport, payload) = self.to_bytes(profile);
        let mut wire = Vec::with_capacity(1 + payload.len());
        wire.push(fport);
        wire.extend_from_slice(&payload);
        Bytes::from(wire)
    }
}

/// `RuleID ‖ DTag ‖ W` prefix shared by every message.
fn push_common(w: &mut BitWriter, profile: &Profile, rule_id: u8, dtag: Option<u16>, win: u16) {
    w.push_bits(u64::from(rule_id), profile.rule_size);
    if profile.t > 0 {
        w.push_bits(u64::from(dtag.unwrap_or_default()), profile.t);
    }
    w.push_bits(u64::from(win & profile.w_mask()), profile.m);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn uplink() -> Profile {
        Profile::lorawan(Profile::ACK_ON_ERROR).unwrap()
    }

    fn downlink() -> Profile {
        Profile::lorawan(Profile::ACK_ALWAYS).unwrap()
    }

    #[test]
    fn regular_fragment_layout() {
        let profile = uplink();
        let msg = SchcMessage::Regular(RegularFragment {
            rule_id: 20,
            dtag: None,
            w: 0,
            fcn: 62,
            payload: FragmentPayload::from_bytes(vec![0x01; 10]),
        });
        let (fport, payload) = msg.to_bytes(&profile);
        assert_eq!(fport, 20);
        // W=00, FCN=111110
        assert_eq!(payload[0], 0b0011_1110);
        assert_eq!(&payload[1..], &[0x01; 10]);
        assert_eq!(msg.frm_payload_len(&profile), 11);
    }

    #[test]
    fn all1_fragment_carries_rcs_then_tile() {
        let profile = uplink();
        let msg = SchcMessage::All1(All1Fragment {
            rule_id: 20,
            dtag: None,
            w: 0,
            rcs: 0xF7D1_8982,
            payload: FragmentPayload::from_bytes(&b"Hello"[..]),
        });
        let wire = msg.to_wire(&profile);
        assert_eq!(
            wire.as_ref(),
            [&[0x14, 0x3F, 0xF7, 0xD1, 0x89, 0x82][..], b"Hello"].concat()
        );
    }

    #[test]
    fn short_ack_is_two_words() {
        let profile = uplink();
        let msg = SchcMessage::Ack(Ack { rule_id: 20, dtag: None, w: 1, c: true, bitmap: None });
        let wire = msg.to_wire(&profile);
        // W=01, C=1, five zero padding bits
        assert_eq!(wire.as_ref(), &[0x14, 0b0110_0000]);
    }

    #[test]
    fn nak_ack_appends_compressed_bitmap() {
        let profile = uplink();
        let bitmap = vec![true, false, true, true, true];
        let msg = SchcMessage::Ack(Ack {
            rule_id: 20,
            dtag: None,
            w: 0,
            c: false,
            bitmap: Some(bitmap),
        });
        let wire = msg.to_wire(&profile);
        // W=00, C=0, bitmap 10111
        assert_eq!(wire.as_ref(), &[0x14, 0b0001_0111]);
    }

    #[test]
    fn ack_req_is_zero_fcn() {
        let profile = uplink();
        let msg = SchcMessage::AckReq(AckReq { rule_id: 20, dtag: None, w: 2 });
        let wire = msg.to_wire(&profile);
        assert_eq!(wire.as_ref(), &[0x14, 0b1000_0000]);
    }

    #[test]
    fn sender_abort_is_all_ones_w_and_fcn() {
        let profile = uplink();
        let msg = SchcMessage::SenderAbort(SenderAbort { rule_id: 20, dtag: None });
        let wire = msg.to_wire(&profile);
        assert_eq!(wire.as_ref(), &[0x14, 0xFF]);
    }

    #[test]
    fn receiver_abort_fills_an_extra_word_of_ones() {
        let profile = uplink();
        let msg = SchcMessage::ReceiverAbort(ReceiverAbort { rule_id: 20, dtag: None });
        let wire = msg.to_wire(&profile);
        // W=11, C=1, 5 ones to the boundary, then 8 more ones
        assert_eq!(wire.as_ref(), &[0x14, 0xFF, 0xFF]);

        let downlink_abort =
            SchcMessage::ReceiverAbort(ReceiverAbort { rule_id: 21, dtag: None });
        assert_eq!(downlink_abort.to_wire(&downlink()).as_ref(), &[0x15, 0xFF, 0xFF]);
    }

    #[test]
    fn every_encoding_is_word_aligned() {
        let profile = uplink();
        let messages = [
            SchcMessage::Regular(RegularFragment {
                rule_id: 20,
                dtag: None,
                w: 3,
                fcn: 7,
                payload: FragmentPayload::from_bytes(vec![0xAB; 20]),
            }),
            SchcMessage::All1(All1Fragment {
                rule_id: 20,
                dtag: None,
                w: 1,
                rcs: 1,
                payload: FragmentPayload::from_bits(vec![0x80], 3),
            }),
            SchcMessage::Ack(Ack {
                rule_id: 20,
                dtag: None,
                w: 0,
                c: false,
                bitmap: Some(vec![false; 63]),
            }),
            SchcMessage::AckReq(AckReq { rule_id: 20, dtag: None, w: 0 }),
            SchcMessage::SenderAbort(SenderAbort { rule_id: 20, dtag: None }),
            SchcMessage::ReceiverAbort(ReceiverAbort { rule_id: 20, dtag: None }),
        ];
        for msg in messages {
            let wire = msg.to_wire(&profile);
            assert_eq!(msg.bit_len(&profile), wire.len() * 8);
            assert_eq!(wire.len() * 8 % profile.l2_word, 0);
        }
    }

    #[test]
    fn downlink_regular_fragment_is_bit_packed() {
        let profile = downlink();
        // 10 header bits + 14 payload bits land exactly on three words.
        let msg = SchcMessage::Regular(RegularFragment {
            rule_id: 21,
            dtag: None,
            w: 1,
            fcn: 0,
            payload: FragmentPayload::from_bits(vec![0xFF, 0xFC], 14),
        });
        let wire = msg.to_wire(&profile);
        assert_eq!(wire.len(), 3);
        // W=1, FCN=0, then 14 one bits
        assert_eq!(&wire[1..], &[0b1011_1111, 0b1111_1111]);
    }
}
