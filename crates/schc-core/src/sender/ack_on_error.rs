//! Ack-on-Error fragmenter (LoRaWAN uplink, rule 20).

use std::collections::{BTreeMap, VecDeque};

use bytes::Bytes;
use schc_proto::{
    Ack, AckReq, All1Fragment, Bitmap, FragmentPayload, Profile, RegularFragment, SchcMessage,
    SenderAbort, bits::BitWriter,
};
use tracing::{debug, warn};

use crate::{
    alarm::{Alarm, AttemptsCounter},
    error::{Result, SessionError},
    rcs,
    sender::SenderState,
    tile::{Tile, slice_packet},
};

/// Fragmenter for the Ack-on-Error mode.
///
/// Tiles stream out in windows of up to 63; each closed window is confirmed
/// through an ACK-REQ / compressed-bitmap exchange, and missing tiles are
/// re-sent selectively. The last tile travels only inside the All-1
/// Fragment, together with the RCS precomputed over the padded packet.
#[derive(Debug)]
pub struct AckOnErrorSender {
    profile: Profile,
    dtag: Option<u16>,
    state: SenderState,
    /// Tiles not yet sent for the first time, in packet order.
    tiles: VecDeque<Tile>,
    /// Tiles of the current window, keyed by FCN, kept for retransmission.
    sent_tiles: BTreeMap<u8, Tile>,
    /// Expanded per-window bitmaps reported by the peer.
    bitmaps: BTreeMap<u16, Bitmap>,
    window: u16,
    fcn: u8,
    last_window: bool,
    rcs: u32,
    attempts: AttemptsCounter,
    retransmission_timer: Alarm,
    queue: VecDeque<SchcMessage>,
    exit: Option<SessionError>,
}

impl AckOnErrorSender {
    /// Start a session for `packet`. `padding_bits` counts trailing bits of
    /// the last byte that belong to the compression residue padding, not to
    /// the packet; they are excluded from fragmentation but still covered
    /// (as zeros) by the RCS.
    #[must_use]
    pub fn new(profile: Profile, packet: &Bytes, padding_bits: usize, dtag: Option<u16>) -> Self {
        debug_assert!(padding_bits < profile.l2_word);
        let bit_len = packet.len() * 8 - padding_bits;
        let rcs = rcs::compute(packet, bit_len, profile.l2_word);
        let tiles: VecDeque<Tile> = slice_packet(packet, bit_len, &profile).into();
        debug!(
            "Ack-on-Error sender: {} tiles, rcs {:#010x}, rule {}",
            tiles.len(),
            rcs,
            profile.rule_id()
        );
        Self {
            profile,
            dtag,
            state: SenderState::Sending,
            tiles,
            sent_tiles: BTreeMap::new(),
            bitmaps: BTreeMap::new(),
            window: 0,
            fcn: (profile.window_size - 1) as u8,
            last_window: false,
            rcs,
            attempts: AttemptsCounter::new(profile.max_ack_requests),
            retransmission_timer: Alarm::Stopped,
            queue: VecDeque::new(),
            exit: None,
        }
    }

    /// Current state name, for diagnostics.
    #[must_use]
    pub fn state_name(&self) -> &'static str {
        self.state.name()
    }

    /// True in End or Error.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self.state, SenderState::End | SenderState::Error)
    }

    /// What the host should have scheduled for `on_timer`.
    #[must_use]
    pub fn alarm(&self) -> Alarm {
        self.retransmission_timer
    }

    /// Next message to transmit, if any fits `mtu` FRMPayload bytes.
    pub fn generate_message(&mut self, mtu: usize) -> Result<Option<SchcMessage>> {
        match self.state {
            SenderState::Sending => self.generate_sending(mtu),
            SenderState::Resending => self.generate_resending(mtu),
            SenderState::Waiting => self.drain_queue(mtu),
            SenderState::End => Ok(None),
            SenderState::Error => {
                if self.queue.is_empty() {
                    Err(self.exit.clone().unwrap_or(SessionError::Aborted))
                } else {
                    self.drain_queue(mtu)
                }
            }
        }
    }

    /// Feed one parsed inbound message to the machine.
    pub fn receive_message(&mut self, message: &SchcMessage) -> Result<()> {
        match (self.state, message) {
            (SenderState::Error, _) => Err(self.exit.clone().unwrap_or(SessionError::Aborted)),
            (SenderState::End, _) => Err(SessionError::UnexpectedState {
                state: SenderState::End.name(),
                message: message.kind(),
            }),
            (_, SchcMessage::ReceiverAbort(_)) => {
                warn!("receiver aborted the session");
                self.queue.clear();
                self.retransmission_timer.stop();
                self.state = SenderState::Error;
                self.exit = Some(SessionError::Aborted);
                Ok(())
            }
            (SenderState::Waiting, SchcMessage::Ack(ack)) => {
                self.handle_ack(ack);
                Ok(())
            }
            (SenderState::Sending | SenderState::Resending, SchcMessage::Ack(_)) => {
                debug!("ACK received while {}; ignoring", self.state.name());
                Ok(())
            }
            (state, message) => Err(SessionError::UnexpectedState {
                state: state.name(),
                message: message.kind(),
            }),
        }
    }

    /// Retransmission timer fired. Re-requests an ACK until the attempt
    /// budget runs out, then aborts. Idempotent outside Waiting.
    pub fn on_timer(&mut self) {
        if self.state != SenderState::Waiting {
            return;
        }
        if self.attempts.exceeds_max() {
            let attempts = self.attempts.count();
            warn!("no conclusive ACK after {attempts} requests; aborting");
            self.abort(SessionError::AttemptsExhausted { attempts });
        } else {
            self.attempts.increment();
            self.queue.push_back(self.ack_req());
            self.retransmission_timer.arm(self.profile.retransmission_timeout);
        }
    }

    fn generate_sending(&mut self, mtu: usize) -> Result<Option<SchcMessage>> {
        if self.tiles.len() == 1 {
            return self.emit_all1(mtu).map(Some);
        }

        let profile = self.profile;
        let header_bits = profile.fragment_header_bits();
        let first_fcn = self.fcn;
        let mut payload = BitWriter::new();
        let mut window_closed = false;

        while self.tiles.len() > 1 {
            let tile_bits = self.tiles[0].bit_len();
            if !fits(&profile, header_bits + payload.len() + tile_bits, mtu) {
                break;
            }
            let tile = self.tiles.pop_front().ok_or(SessionError::UnexpectedState {
                state: self.state.name(),
                message: "empty tile queue",
            })?;
            payload.push_field(tile.as_bytes(), tile.bit_len());
            debug!("tile fcn {} queued for window {}", self.fcn, self.window);
            self.sent_tiles.insert(self.fcn, tile);
            if self.fcn == 0 {
                window_closed = true;
                break;
            }
            self.fcn -= 1;
        }

        if payload.is_empty() {
            return Err(SessionError::NoBudget {
                needed: frm_bytes(&profile, header_bits + self.tiles[0].bit_len()),
                mtu,
            });
        }

        if window_closed {
            debug!("window {} closed; requesting ACK", self.window);
            self.enter_waiting();
        }

        let bit_len = payload.len();
        Ok(Some(SchcMessage::Regular(RegularFragment {
            rule_id: profile.rule_id(),
            dtag: self.dtag,
            w: self.window & profile.w_mask(),
            fcn: first_fcn,
            payload: FragmentPayload::from_bits(payload.into_bytes(), bit_len),
        })))
    }

    fn generate_resending(&mut self, mtu: usize) -> Result<Option<SchcMessage>> {
        let profile = self.profile;
        let lowest_held = self.sent_tiles.keys().next().copied();
        let Some(bitmap) = self.bitmaps.get_mut(&self.window) else {
            self.enter_waiting();
            return self.drain_queue(mtu);
        };

        // Positions the peer reports missing but we never filled belong to
        // the partial final window; there is nothing to re-send for them.
        let missing: Vec<u8> = bitmap.missing_fcns().collect();
        for fcn in missing {
            if !self.sent_tiles.contains_key(&fcn) {
                bitmap.tile_received(fcn);
            }
        }

        let held_missing: Vec<u8> = bitmap.missing_fcns().collect();
        let Some(&first_fcn) = held_missing.first() else {
            self.enter_waiting();
            return self.drain_queue(mtu);
        };

        if self.last_window && Some(first_fcn) == lowest_held {
            bitmap.tile_received(first_fcn);
            let message = self.reemit_all1(first_fcn, mtu)?;
            return Ok(Some(message));
        }

        let header_bits = profile.fragment_header_bits();
        let mut payload = BitWriter::new();
        for fcn in held_missing {
            if self.last_window && Some(fcn) == lowest_held {
                // The All-1 tile goes out alone, on the next call.
                break;
            }
            let Some(tile) = self.sent_tiles.get(&fcn) else { break };
            if !fits(&profile, header_bits + payload.len() + tile.bit_len(), mtu) {
                break;
            }
            payload.push_field(tile.as_bytes(), tile.bit_len());
            bitmap.tile_received(fcn);
            debug!("re-sending tile fcn {fcn} of window {}", self.window);
        }

        if payload.is_empty() {
            let needed = self
                .sent_tiles
                .get(&first_fcn)
                .map_or(0, |t| frm_bytes(&profile, header_bits + t.bit_len()));
            return Err(SessionError::NoBudget { needed, mtu });
        }

        let round_complete = !bitmap.has_missing();
        if round_complete {
            self.enter_waiting();
        }

        let bit_len = payload.len();
        Ok(Some(SchcMessage::Regular(RegularFragment {
            rule_id: profile.rule_id(),
            dtag: self.dtag,
            w: self.window & profile.w_mask(),
            fcn: first_fcn,
            payload: FragmentPayload::from_bits(payload.into_bytes(), bit_len),
        })))
    }

    /// First transmission of the All-1 Fragment, consuming the last tile.
    fn emit_all1(&mut self, mtu: usize) -> Result<SchcMessage> {
        let profile = self.profile;
        let tile_bits = self.tiles[0].bit_len();
        if !fits(&profile, profile.all1_header_bits() + tile_bits, mtu) {
            return Err(SessionError::NoBudget {
                needed: frm_bytes(&profile, profile.all1_header_bits() + tile_bits),
                mtu,
            });
        }
        let tile = self.tiles.pop_front().ok_or(SessionError::UnexpectedState {
            state: self.state.name(),
            message: "empty tile queue",
        })?;
        let payload = tile.to_payload();
        self.sent_tiles.insert(self.fcn, tile);
        self.last_window = true;
        debug!("emitting All-1 for window {} (last tile fcn {})", self.window, self.fcn);
        self.enter_waiting();
        Ok(SchcMessage::All1(All1Fragment {
            rule_id: profile.rule_id(),
            dtag: self.dtag,
            w: self.window & profile.w_mask(),
            rcs: self.rcs,
            payload,
        }))
    }

    /// Retransmission of the All-1 Fragment from the sent-tile store.
    fn reemit_all1(&mut self, fcn: u8, mtu: usize) -> Result<SchcMessage> {
        let profile = self.profile;
        let tile = self.sent_tiles.get(&fcn).ok_or(SessionError::UnexpectedState {
            state: self.state.name(),
            message: "missing All-1 tile",
        })?;
        if !fits(&profile, profile.all1_header_bits() + tile.bit_len(), mtu) {
            return Err(SessionError::NoBudget {
                needed: frm_bytes(&profile, profile.all1_header_bits() + tile.bit_len()),
                mtu,
            });
        }
        debug!("re-sending All-1 for window {}", self.window);
        let payload = tile.to_payload();
        self.enter_waiting();
        Ok(SchcMessage::All1(All1Fragment {
            rule_id: profile.rule_id(),
            dtag: self.dtag,
            w: self.window & profile.w_mask(),
            rcs: self.rcs,
            payload,
        }))
    }

    fn handle_ack(&mut self, ack: &Ack) {
        let mask = self.profile.w_mask();
        let current = self.window & mask;
        if ack.w != current {
            if self.window > 0 && ack.w == (self.window.wrapping_sub(1) & mask) {
                warn!("stale ACK for window {} (current {}); ignoring", ack.w, current);
            } else {
                warn!("ACK for unknown window {} (current {}); aborting", ack.w, current);
                self.abort(SessionError::UnexpectedState {
                    state: self.state.name(),
                    message: "ACK for a window never sent",
                });
            }
            return;
        }

        if ack.c {
            if self.last_window {
                debug!("final ACK with C=1; transfer complete");
                self.retransmission_timer.stop();
                self.queue.clear();
                self.state = SenderState::End;
            } else {
                // Integrity cannot be known before the All-1 went out.
                warn!("C=1 before the last window; aborting");
                self.abort(SessionError::UnexpectedState {
                    state: self.state.name(),
                    message: "C=1 ACK before the All-1",
                });
            }
            return;
        }

        let Some(compressed) = &ack.bitmap else {
            warn!("C=0 ACK without a bitmap; aborting");
            self.abort(SessionError::UnexpectedState {
                state: self.state.name(),
                message: "C=0 ACK without bitmap",
            });
            return;
        };
        let bitmap = Bitmap::from_compressed(compressed, self.profile.window_size);
        debug!(
            "window {} bitmap: {}/{} tiles confirmed",
            self.window,
            bitmap.received_count(),
            bitmap.len()
        );
        let missing = bitmap.has_missing();
        self.bitmaps.insert(self.window, bitmap);

        if missing {
            self.retransmission_timer.stop();
            self.queue.clear();
            // A responsive peer refreshes the ACK-REQ budget.
            self.attempts.reset();
            self.state = SenderState::Resending;
        } else if self.last_window {
            // Complete bitmap yet C=0: the receiver saw an RCS mismatch.
            warn!("peer reports integrity failure on a complete final window");
            self.abort(SessionError::IntegrityFailed);
        } else {
            debug!("window {} confirmed; advancing", self.window);
            self.sent_tiles.clear();
            self.queue.clear();
            self.retransmission_timer.stop();
            self.attempts.reset();
            self.window += 1;
            self.fcn = (self.profile.window_size - 1) as u8;
            self.state = SenderState::Sending;
        }
    }

    fn drain_queue(&mut self, mtu: usize) -> Result<Option<SchcMessage>> {
        let Some(front) = self.queue.front() else { return Ok(None) };
        let needed = front.frm_payload_len(&self.profile);
        if needed > mtu {
            return Err(SessionError::NoBudget { needed, mtu });
        }
        Ok(self.queue.pop_front())
    }

    /// Close the current exchange: request an ACK and start the timer.
    fn enter_waiting(&mut self) {
        self.queue.push_back(self.ack_req());
        self.retransmission_timer.arm(self.profile.retransmission_timeout);
        self.state = SenderState::Waiting;
    }

    fn ack_req(&self) -> SchcMessage {
        SchcMessage::AckReq(AckReq {
            rule_id: self.profile.rule_id(),
            dtag: self.dtag,
            w: self.window & self.profile.w_mask(),
        })
    }

    fn abort(&mut self, exit: SessionError) {
        self.queue.clear();
        self.queue.push_back(SchcMessage::SenderAbort(SenderAbort {
            rule_id: self.profile.rule_id(),
            dtag: self.dtag,
        }));
        self.retransmission_timer.stop();
        self.state = SenderState::Error;
        self.exit = Some(exit);
    }
}

fn padded(profile: &Profile, bits: usize) -> usize {
    bits + profile.padding_bits(bits)
}

/// FRMPayload bytes of a message of `bits` unpadded bits.
fn frm_bytes(profile: &Profile, bits: usize) -> usize {
    padded(profile, bits) / 8 - profile.rule_size / 8
}

fn fits(profile: &Profile, bits: usize, mtu: usize) -> bool {
    frm_bytes(profile, bits) <= mtu
}

#[cfg(test)]
mod tests {
    use super::*;

    fn uplink() -> Profile {
        Profile::lorawan(Profile::ACK_ON_ERROR).unwrap()
    }

    fn sender(payload: &[u8]) -> AckOnErrorSender {
        AckOnErrorSender::new(uplink(), &Bytes::copy_from_slice(payload), 0, None)
    }

    #[test]
    fn single_tile_goes_straight_to_all1() {
        let mut s = sender(b"Hello");
        let msg = s.generate_message(51).unwrap().unwrap();
        let SchcMessage::All1(all1) = msg else { panic!("expected All-1") };
        assert_eq!(all1.w, 0);
        assert_eq!(all1.rcs, 0xF7D1_8982);
        assert_eq!(all1.payload.as_bytes(), b"Hello");
        assert_eq!(s.state_name(), "Waiting");
    }

    #[test]
    fn mtu_packs_multiple_tiles_per_fragment() {
        // 35 bytes: two full tiles, penultimate, 5-byte last tile.
        let mut s = sender(&[0x11; 35]);
        let msg = s.generate_message(51).unwrap().unwrap();
        let SchcMessage::Regular(regular) = msg else { panic!("expected Regular") };
        assert_eq!(regular.fcn, 62);
        // 51-byte MTU fits 3 tiles of 10 bytes after the 1-byte header.
        assert_eq!(regular.payload.bit_len(), 240);

        let all1 = s.generate_message(51).unwrap().unwrap();
        assert!(matches!(all1, SchcMessage::All1(_)));
        // One ACK-REQ follows, then silence.
        assert!(matches!(s.generate_message(51).unwrap().unwrap(), SchcMessage::AckReq(_)));
        assert_eq!(s.generate_message(51).unwrap(), None);
    }

    #[test]
    fn tiny_mtu_is_rejected_not_fragmented() {
        let mut s = sender(&[0x22; 35]);
        let err = s.generate_message(5).unwrap_err();
        assert!(matches!(err, SessionError::NoBudget { needed: 11, .. }));
    }

    #[test]
    fn full_ack_advances_the_window() {
        // 640 bytes fills window 0 (63 tiles) and spills into window 1.
        let mut s = sender(&[0x33; 640]);
        loop {
            match s.generate_message(51).unwrap() {
                Some(SchcMessage::Regular(_)) => {}
                Some(SchcMessage::AckReq(req)) => {
                    assert_eq!(req.w, 0);
                    break;
                }
                other => panic!("unexpected {other:?}"),
            }
        }
        assert_eq!(s.state_name(), "Waiting");

        // Complete bitmap, C=0: advance to window 1.
        let mut bitmap = Bitmap::new(63);
        for fcn in 0..63 {
            bitmap.tile_received(fcn);
        }
        s.receive_message(&SchcMessage::Ack(Ack {
            rule_id: 20,
            dtag: None,
            w: 0,
            c: false,
            bitmap: Some(bitmap.compress(&uplink())),
        }))
        .unwrap();
        assert_eq!(s.state_name(), "Sending");

        let msg = s.generate_message(51).unwrap().unwrap();
        let SchcMessage::Regular(regular) = msg else { panic!("expected Regular") };
        assert_eq!(regular.w, 1);
        assert_eq!(regular.fcn, 62);
    }

    #[test]
    fn nak_triggers_selective_retransmission() {
        let mut s = sender(&[0x44; 640]);
        while !matches!(s.generate_message(51).unwrap(), Some(SchcMessage::AckReq(_))) {}

        let mut bitmap = Bitmap::new(63);
        for fcn in 0..63 {
            if fcn != 40 {
                bitmap.tile_received(fcn);
            }
        }
        s.receive_message(&SchcMessage::Ack(Ack {
            rule_id: 20,
            dtag: None,
            w: 0,
            c: false,
            bitmap: Some(bitmap.compress(&uplink())),
        }))
        .unwrap();
        assert_eq!(s.state_name(), "Resending");

        let msg = s.generate_message(51).unwrap().unwrap();
        let SchcMessage::Regular(regular) = msg else { panic!("expected Regular") };
        assert_eq!(regular.fcn, 40);
        assert_eq!(regular.payload.bit_len(), 80);
        // Everything re-sent: back to Waiting behind a fresh ACK-REQ.
        assert_eq!(s.state_name(), "Waiting");
        assert!(matches!(s.generate_message(51).unwrap().unwrap(), SchcMessage::AckReq(_)));
    }

    #[test]
    fn premature_c1_ack_aborts() {
        let mut s = sender(&[0x55; 640]);
        while !matches!(s.generate_message(51).unwrap(), Some(SchcMessage::AckReq(_))) {}
        s.receive_message(&SchcMessage::Ack(Ack {
            rule_id: 20,
            dtag: None,
            w: 0,
            c: true,
            bitmap: None,
        }))
        .unwrap();
        assert_eq!(s.state_name(), "Error");
        assert!(matches!(
            s.generate_message(51).unwrap().unwrap(),
            SchcMessage::SenderAbort(_)
        ));
        assert!(s.generate_message(51).is_err());
    }

    #[test]
    fn timer_exhaustion_aborts_with_sender_abort() {
        let mut s = sender(b"Hello");
        let _ = s.generate_message(51).unwrap();
        for _ in 0..8 {
            s.on_timer();
            assert_eq!(s.state_name(), "Waiting");
        }
        s.on_timer();
        assert_eq!(s.state_name(), "Error");
        // Queued ACK-REQs were dropped in favour of the abort.
        assert!(matches!(
            s.generate_message(51).unwrap().unwrap(),
            SchcMessage::SenderAbort(_)
        ));
        assert_eq!(
            s.generate_message(51).unwrap_err(),
            SessionError::AttemptsExhausted { attempts: 8 }
        );
    }

    #[test]
    fn stale_ack_is_ignored_and_future_ack_aborts() {
        let mut s = sender(&[0x66; 640]);
        while !matches!(s.generate_message(51).unwrap(), Some(SchcMessage::AckReq(_))) {}

        let mut full = Bitmap::new(63);
        for fcn in 0..63 {
            full.tile_received(fcn);
        }
        s.receive_message(&SchcMessage::Ack(Ack {
            rule_id: 20,
            dtag: None,
            w: 0,
            c: false,
            bitmap: Some(full.compress(&uplink())),
        }))
        .unwrap();
        while !matches!(s.generate_message(51).unwrap(), Some(SchcMessage::AckReq(_))) {}

        // Window is now 1; an ACK for window 0 is stale.
        s.receive_message(&SchcMessage::Ack(Ack {
            rule_id: 20,
            dtag: None,
            w: 0,
            c: false,
            bitmap: Some(full.compress(&uplink())),
        }))
        .unwrap();
        assert_eq!(s.state_name(), "Waiting");

        // Window 3 was never opened.
        s.receive_message(&SchcMessage::Ack(Ack {
            rule_id: 20,
            dtag: None,
            w: 3,
            c: false,
            bitmap: Some(full.compress(&uplink())),
        }))
        .unwrap();
        assert_eq!(s.state_name(), "Error");
    }
}
