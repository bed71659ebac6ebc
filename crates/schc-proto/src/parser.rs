//! Octet-string classification and decoding.
//!
//! A LoRaWAN frame arrives as an FPort value (the RuleID) plus FRMPayload
//! octets. Message kind is decided purely from the total bit length and the
//! bits at the FCN/C position, per the profile's classification tables.
//!
//! Parsing is endpoint-aware: a fragment sender only ever receives ACKs and
//! Receiver-Aborts, a reassembler only fragments, ACK-REQs and
//! Sender-Aborts. Some encodings are identical across directions (a 16-bit
//! Sender-Abort and a short C=1 ACK share the same octets once W is all
//! ones), so the endpoint is part of the classification, exactly as each
//! state machine only dispatches the message kinds of its own direction.

use crate::{
    bits::BitReader,
    errors::{ProtocolError, Result},
    message::{
        Ack, AckReq, All1Fragment, FragmentPayload, ReceiverAbort, RegularFragment, SchcMessage,
        SenderAbort,
    },
    profile::Profile,
};

/// Which end of the fragmentation session is parsing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Endpoint {
    /// The fragment sender; expects ACK or Receiver-Abort.
    Fragmenter,
    /// The reassembler; expects fragments, ACK-REQ or Sender-Abort.
    Reassembler,
}

impl Endpoint {
    fn name(self) -> &'static str {
        match self {
            Self::Fragmenter => "fragmenter",
            Self::Reassembler => "reassembler",
        }
    }
}

/// Decode one SCHC message from `(FPort, FRMPayload)`.
///
/// # Errors
///
/// - `ProtocolError::UnknownShape` when length and header bits match no
///   message kind for this rule and endpoint
/// - `ProtocolError::BadAbort` when an abort's fixed all-ones run is broken
/// - `ProtocolError::Truncated` when a field runs past the input
pub fn parse(
    profile: &Profile,
    fport: u8,
    frm_payload: &[u8],
    endpoint: Endpoint,
) -> Result<SchcMessage> {
    debug_assert_eq!(profile.rule_id(), fport);

    let mut frame = Vec::with_capacity(1 + frm_payload.len());
    frame.push(fport);
    frame.extend_from_slice(frm_payload);

    let mut reader = BitReader::new(&frame);
    let total = reader.total_bits();
    if total % profile.l2_word != 0 {
        return Err(ProtocolError::Misaligned { bits: total, l2_word: profile.l2_word });
    }

    let rule_id = reader.read_bits(profile.rule_size)? as u8;
    let dtag = if profile.t > 0 { Some(reader.read_bits(profile.t)? as u16) } else { None };
    let w = reader.read_bits(profile.m)? as u16;

    match endpoint {
        Endpoint::Reassembler => parse_for_reassembler(profile, reader, total, rule_id, dtag, w),
        Endpoint::Fragmenter => parse_for_fragmenter(profile, reader, total, rule_id, dtag, w),
    }
}

/// Fragments, ACK-REQ and Sender-Abort. The cursor sits on the FCN field.
fn parse_for_reassembler(
    profile: &Profile,
    mut reader: BitReader<'_>,
    total: usize,
    rule_id: u8,
    dtag: Option<u16>,
    w: u16,
) -> Result<SchcMessage> {
    let fcn = reader.read_bits(profile.n)? as u8;
    let header = profile.fragment_header_bits();

    if total == header + profile.padding_bits(header) {
        // Header-only frame: ACK-REQ carries an all-zeros FCN, the
        // Sender-Abort all-ones W and FCN.
        if fcn == 0 {
            return Ok(SchcMessage::AckReq(AckReq { rule_id, dtag, w }));
        }
        if w == profile.w_mask() && fcn == profile.max_fcn() {
            return Ok(SchcMessage::SenderAbort(SenderAbort { rule_id, dtag }));
        }
        return Err(ProtocolError::UnknownShape {
            rule_id,
            bits: total,
            endpoint: Endpoint::Reassembler.name(),
        });
    }

    if fcn == profile.max_fcn() {
        let rcs = reader.read_bits(profile.u)? as u32;
        // The All-1 payload is at most one tile; on rules with a fixed tile
        // size the remainder past it is padding.
        let mut payload_bits = reader.remaining();
        if profile.tile_size > 0 {
            payload_bits = payload_bits.min(profile.tile_size);
        }
        let payload = FragmentPayload::from_bits(reader.read_field(payload_bits)?, payload_bits);
        return Ok(SchcMessage::All1(All1Fragment { rule_id, dtag, w, rcs, payload }));
    }

    let payload_bits = reader.remaining();
    let payload = FragmentPayload::from_bits(reader.read_field(payload_bits)?, payload_bits);
    Ok(SchcMessage::Regular(RegularFragment { rule_id, dtag, w, fcn, payload }))
}

/// ACK and Receiver-Abort. The cursor sits on the C bit.
fn parse_for_fragmenter(
    profile: &Profile,
    mut reader: BitReader<'_>,
    total: usize,
    rule_id: u8,
    dtag: Option<u16>,
    w: u16,
) -> Result<SchcMessage> {
    let c = reader.read_bit()?;

    if c {
        // Either a success ACK (zero padding) or a Receiver-Abort (all-ones
        // filler one word longer than the padded header).
        let mut ones = 0usize;
        let mut zeros = 0usize;
        while reader.remaining() > 0 {
            if reader.read_bit()? {
                ones += 1;
            } else {
                zeros += 1;
            }
        }
        if ones == 0 {
            return Ok(SchcMessage::Ack(Ack { rule_id, dtag, w, c: true, bitmap: None }));
        }
        let header = profile.ack_header_bits();
        let filler = profile.padding_bits(header) + profile.l2_word;
        if zeros != 0 || ones != filler {
            return Err(ProtocolError::BadAbort("filler must be all ones, one word past the header"));
        }
        if w != profile.w_mask() {
            return Err(ProtocolError::BadAbort("W must be all ones"));
        }
        return Ok(SchcMessage::ReceiverAbort(ReceiverAbort { rule_id, dtag }));
    }

    // C=0: the rest is the compressed bitmap, truncated to the window size
    // when padding pushed the frame past it.
    let bitmap_bits = reader.remaining().min(profile.window_size);
    let mut bitmap = Vec::with_capacity(bitmap_bits);
    for _ in 0..bitmap_bits {
        bitmap.push(reader.read_bit()?);
    }
    if bitmap.is_empty() {
        return Err(ProtocolError::UnknownShape {
            rule_id,
            bits: total,
            endpoint: Endpoint::Fragmenter.name(),
        });
    }
    Ok(SchcMessage::Ack(Ack { rule_id, dtag, w, c: false, bitmap: Some(bitmap) }))
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
    fn classifies_ack_req() {
        let profile = uplink();
        let parsed = parse(&profile, 20, &[0b1000_0000], Endpoint::Reassembler).unwrap();
        assert_eq!(parsed, SchcMessage::AckReq(AckReq { rule_id: 20, dtag: None, w: 2 }));
    }

    #[test]
    fn classifies_sender_abort() {
        let profile = uplink();
        let parsed = parse(&profile, 20, &[0xFF], Endpoint::Reassembler).unwrap();
        assert_eq!(parsed, SchcMessage::SenderAbort(SenderAbort { rule_id: 20, dtag: None }));
    }

    #[test]
    fn header_only_frame_with_plain_fcn_is_rejected() {
        let profile = uplink();
        let result = parse(&profile, 20, &[0b0000_0001], Endpoint::Reassembler);
        assert!(matches!(result, Err(ProtocolError::UnknownShape { .. })));
    }

    #[test]
    fn classifies_short_success_ack() {
        let profile = uplink();
        let parsed = parse(&profile, 20, &[0b0110_0000], Endpoint::Fragmenter).unwrap();
        assert_eq!(
            parsed,
            SchcMessage::Ack(Ack { rule_id: 20, dtag: None, w: 1, c: true, bitmap: None })
        );
    }

    #[test]
    fn classifies_receiver_abort_and_rejects_torn_filler() {
        let profile = uplink();
        let parsed = parse(&profile, 20, &[0xFF, 0xFF], Endpoint::Fragmenter).unwrap();
        assert_eq!(parsed, SchcMessage::ReceiverAbort(ReceiverAbort { rule_id: 20, dtag: None }));

        let torn = parse(&profile, 20, &[0xFF, 0xFE], Endpoint::Fragmenter);
        assert!(matches!(torn, Err(ProtocolError::BadAbort(_))));

        // C=1 with a wrong W and an abort-length filler is no abort either.
        let wrong_w = parse(&profile, 20, &[0b0011_1111, 0xFF], Endpoint::Fragmenter);
        assert!(matches!(wrong_w, Err(ProtocolError::BadAbort(_))));
    }

    #[test]
    fn classifies_nak_with_bitmap() {
        let profile = uplink();
        // W=00, C=0, 13-bit bitmap with one zero
        let parsed =
            parse(&profile, 20, &[0b0001_1111, 0b1111_1101], Endpoint::Fragmenter).unwrap();
        let SchcMessage::Ack(ack) = parsed else { panic!("expected ACK") };
        assert!(!ack.c);
        let bitmap = ack.bitmap.unwrap();
        assert_eq!(bitmap.len(), 13);
        assert!(!bitmap[11]);
        assert_eq!(bitmap.iter().filter(|&&b| b).count(), 12);
    }

    #[test]
    fn full_width_bitmap_is_truncated_to_window_size() {
        let profile = uplink();
        // 11 header bits + 63 bitmap bits + 6 padding = 80 bits.
        let mut frm = vec![0u8; 9];
        frm[0] = 0b0000_0000;
        let parsed = parse(&profile, 20, &frm, Endpoint::Fragmenter).unwrap();
        let SchcMessage::Ack(ack) = parsed else { panic!("expected ACK") };
        assert_eq!(ack.bitmap.unwrap().len(), 63);
    }

    #[test]
    fn classifies_all1_and_truncates_payload_to_one_tile() {
        let profile = uplink();
        let mut frm = vec![0b0011_1111];
        frm.extend_from_slice(&0xF7D1_8982u32.to_be_bytes());
        frm.extend_from_slice(b"Hello");
        let parsed = parse(&profile, 20, &frm, Endpoint::Reassembler).unwrap();
        let SchcMessage::All1(all1) = parsed else { panic!("expected All-1") };
        assert_eq!(all1.rcs, 0xF7D1_8982);
        assert_eq!(all1.payload.as_bytes(), b"Hello");
        assert_eq!(all1.payload.bit_len(), 40);
    }

    #[test]
    fn classifies_regular_fragment() {
        let profile = uplink();
        let mut frm = vec![0b0011_1110];
        frm.extend_from_slice(&[0x01; 10]);
        let parsed = parse(&profile, 20, &frm, Endpoint::Reassembler).unwrap();
        let SchcMessage::Regular(regular) = parsed else { panic!("expected Regular") };
        assert_eq!(regular.fcn, 62);
        assert_eq!(regular.w, 0);
        assert_eq!(regular.payload.bit_len(), 80);
    }

    #[test]
    fn downlink_16_bit_frames_split_on_the_fcn_bit() {
        let profile = downlink();
        let ack_req = parse(&profile, 21, &[0b1000_0000], Endpoint::Reassembler).unwrap();
        assert_eq!(ack_req, SchcMessage::AckReq(AckReq { rule_id: 21, dtag: None, w: 1 }));

        let abort = parse(&profile, 21, &[0b1100_0000], Endpoint::Reassembler).unwrap();
        assert_eq!(abort, SchcMessage::SenderAbort(SenderAbort { rule_id: 21, dtag: None }));
    }

    #[test]
    fn downlink_final_ack_and_sender_abort_share_octets_across_endpoints() {
        let profile = downlink();
        // W=1, then C=1 (fragmenter) / FCN=1 (reassembler), then zeros.
        let ack = parse(&profile, 21, &[0b1100_0000], Endpoint::Fragmenter).unwrap();
        assert_eq!(
            ack,
            SchcMessage::Ack(Ack { rule_id: 21, dtag: None, w: 1, c: true, bitmap: None })
        );
    }

    #[test]
    fn downlink_nak_carries_single_bit_bitmap() {
        let profile = downlink();
        let parsed = parse(&profile, 21, &[0b0010_0000], Endpoint::Fragmenter).unwrap();
        assert_eq!(
            parsed,
            SchcMessage::Ack(Ack {
                rule_id: 21,
                dtag: None,
                w: 0,
                c: false,
                bitmap: Some(vec![true]),
            })
        );
    }
}
