//! Ack-on-Error reassembler (LoRaWAN uplink, rule 20).

use std::collections::{BTreeMap, VecDeque};

use bytes::Bytes;
use schc_proto::{
    Ack, AckReq, All1Fragment, Bitmap, FragmentPayload, Profile, ReceiverAbort, RegularFragment,
    SchcMessage, bits::BitWriter,
};
use tracing::{debug, warn};

use crate::{
    alarm::{Alarm, AttemptsCounter},
    error::{Result, SessionError},
    rcs,
    receiver::ReceiverState,
    tile::Tile,
};

/// Reassembler for the Ack-on-Error mode.
///
/// Tiles are stored by `(window, position)` and concatenated in that order
/// once the All-1 Fragment brings the RCS. Completion is decided by the
/// integrity check, not the bitmap: a partial final window leaves trailing
/// bitmap positions unset without meaning loss, so only a gap below a
/// received tile (or an incomplete earlier window) triggers a NAK.
#[derive(Debug)]
pub struct AckOnErrorReceiver {
    profile: Profile,
    dtag: Option<u16>,
    state: ReceiverState,
    window: u16,
    bitmaps: BTreeMap<u16, Bitmap>,
    /// Tiles by `(window, position)`; the All-1 tile sorts after every
    /// regular position of its window.
    tiles: BTreeMap<(u16, u16), Tile>,
    last_window: bool,
    final_rcs: Option<u32>,
    success: bool,
    delivery: Option<Bytes>,
    queue: VecDeque<SchcMessage>,
    inactivity_timer: Alarm,
    attempts: AttemptsCounter,
    exit: Option<SessionError>,
}

impl AckOnErrorReceiver {
    /// Fresh session; the inactivity alarm is armed immediately.
    #[must_use]
    pub fn new(profile: Profile, dtag: Option<u16>) -> Self {
        let mut bitmaps = BTreeMap::new();
        bitmaps.insert(0, Bitmap::new(profile.window_size));
        let mut inactivity_timer = Alarm::Stopped;
        inactivity_timer.arm(profile.inactivity_timeout);
        Self {
            profile,
            dtag,
            state: ReceiverState::Receiving,
            window: 0,
            bitmaps,
            tiles: BTreeMap::new(),
            last_window: false,
            final_rcs: None,
            success: false,
            delivery: None,
            queue: VecDeque::new(),
            inactivity_timer,
            attempts: AttemptsCounter::new(profile.max_ack_requests),
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
        matches!(self.state, ReceiverState::End | ReceiverState::Error)
    }

    /// What the host should have scheduled for `on_timer`.
    #[must_use]
    pub fn alarm(&self) -> Alarm {
        self.inactivity_timer
    }

    /// Reassembled packet, available once after the C=1 ACK was emitted.
    pub fn take_delivery(&mut self) -> Option<Bytes> {
        self.delivery.take()
    }

    /// Next message to transmit, if any fits `mtu` FRMPayload bytes.
    pub fn generate_message(&mut self, mtu: usize) -> Result<Option<SchcMessage>> {
        if self.state == ReceiverState::End {
            return Ok(None);
        }
        if self.state == ReceiverState::Error && self.queue.is_empty() {
            return Err(self.exit.clone().unwrap_or(SessionError::Aborted));
        }
        let Some(front) = self.queue.front() else { return Ok(None) };
        let needed = front.frm_payload_len(&self.profile);
        if needed > mtu {
            return Err(SessionError::NoBudget { needed, mtu });
        }
        let message = self.queue.pop_front();
        if self.success
            && matches!(message, Some(SchcMessage::Ack(Ack { c: true, .. })))
        {
            debug!("final ACK emitted; delivering packet");
            let (bytes, _) = self.reassemble();
            self.delivery = Some(bytes);
            self.inactivity_timer.stop();
            self.state = ReceiverState::End;
        }
        Ok(message)
    }

    /// Feed one parsed inbound message to the machine.
    pub fn receive_message(&mut self, message: &SchcMessage) -> Result<()> {
        match (self.state, message) {
            (ReceiverState::Error, _) => {
                Err(self.exit.clone().unwrap_or(SessionError::Aborted))
            }
            (ReceiverState::End, _) => Err(SessionError::UnexpectedState {
                state: ReceiverState::End.name(),
                message: message.kind(),
            }),
            (_, SchcMessage::SenderAbort(_)) => {
                warn!("sender aborted the session");
                self.queue.clear();
                self.inactivity_timer.stop();
                self.state = ReceiverState::Error;
                self.exit = Some(SessionError::Aborted);
                Ok(())
            }
            (_, SchcMessage::AckReq(req)) => {
                self.on_ack_req(req);
                Ok(())
            }
            (ReceiverState::Receiving, SchcMessage::Regular(frag)) => {
                self.on_regular_receiving(frag);
                Ok(())
            }
            (ReceiverState::ReceivingMissing, SchcMessage::Regular(frag)) => {
                self.on_regular_missing(frag);
                Ok(())
            }
            (ReceiverState::Waiting, SchcMessage::Regular(frag)) => {
                let mask = self.profile.w_mask();
                if frag.w == self.window & mask {
                    debug!("retransmission for window {}; filling holes", self.window);
                    self.state = ReceiverState::ReceivingMissing;
                    self.on_regular_missing(frag);
                } else if frag.w == (self.window + 1) & mask {
                    self.advance_window();
                    self.state = ReceiverState::Receiving;
                    self.on_regular_receiving(frag);
                } else {
                    warn!("fragment for window {} while at {}; dropping", frag.w, self.window);
                }
                Ok(())
            }
            (_, SchcMessage::All1(frag)) => {
                self.on_all1(frag);
                Ok(())
            }
            (state, message) => Err(SessionError::UnexpectedState {
                state: state.name(),
                message: message.kind(),
            }),
        }
    }

    /// Inactivity timer fired: abort. Idempotent once terminal.
    pub fn on_timer(&mut self) {
        if self.is_terminal() {
            return;
        }
        warn!("inactivity timeout; aborting");
        self.queue.clear();
        self.queue.push_back(SchcMessage::ReceiverAbort(ReceiverAbort {
            rule_id: self.profile.rule_id(),
            dtag: self.dtag,
        }));
        self.inactivity_timer.stop();
        self.state = ReceiverState::Error;
        self.exit = Some(SessionError::InactivityTimeout);
    }

    /// Tiles arriving in FCN countdown order within the current window.
    fn on_regular_receiving(&mut self, frag: &RegularFragment) {
        let mask = self.profile.w_mask();
        if frag.w != self.window & mask {
            debug!("fragment for window {} while receiving {}; dropping", frag.w, self.window);
            return;
        }
        self.touch_timer();

        let window_size = self.profile.window_size as u16;
        let mut fcn = frag.fcn;
        for tile in split_tiles(&frag.payload, self.profile.tile_size) {
            self.tiles.insert((self.window, window_size - 1 - u16::from(fcn)), tile);
            if let Some(bitmap) = self.bitmaps.get_mut(&self.window) {
                bitmap.tile_received(fcn);
            }
            if fcn == 0 {
                debug!("window {} complete; acknowledging", self.window);
                self.enqueue_window_ack(self.window);
                self.state = ReceiverState::Waiting;
                return;
            }
            fcn -= 1;
        }
        debug!("window {}: waiting for fcn {}", self.window, fcn);

        // A straggler retransmission can complete the packet after the
        // All-1 was already seen.
        if self.last_window && self.final_rcs.is_some() && self.loss_detected().is_none() {
            self.validate();
        }
    }

    /// Selective retransmissions: the first tile lands on the FCN carried in
    /// the header, the rest on successive missing positions.
    fn on_regular_missing(&mut self, frag: &RegularFragment) {
        let mask = self.profile.w_mask();
        if frag.w != self.window & mask {
            debug!("fragment for window {} while repairing {}; dropping", frag.w, self.window);
            return;
        }
        self.touch_timer();

        let window_size = self.profile.window_size as u16;
        let mut fcn = Some(frag.fcn);
        for tile in split_tiles(&frag.payload, self.profile.tile_size) {
            let Some(current) = fcn else { break };
            self.tiles.insert((self.window, window_size - 1 - u16::from(current)), tile);
            let next = self.bitmaps.get_mut(&self.window).and_then(|bitmap| {
                bitmap.tile_received(current);
                bitmap.first_missing_fcn()
            });
            debug!("window {}: recovered fcn {}", self.window, current);
            fcn = next;
        }

        if self.last_window && self.final_rcs.is_some() {
            if self.loss_detected().is_none() {
                self.validate();
            }
        } else if self.bitmaps.get(&self.window).is_some_and(|b| !b.has_missing()) {
            debug!("window {} repaired; acknowledging", self.window);
            self.enqueue_window_ack(self.window);
            self.state = ReceiverState::Waiting;
        }
    }

    /// All-1: record the RCS and last tile, then NAK losses or validate.
    fn on_all1(&mut self, frag: &All1Fragment) {
        let mask = self.profile.w_mask();
        if frag.w == (self.window + 1) & mask && self.state == ReceiverState::Waiting {
            self.advance_window();
        } else if frag.w != self.window & mask {
            debug!("All-1 for window {} while at {}; dropping", frag.w, self.window);
            return;
        }
        self.touch_timer();

        self.last_window = true;
        self.final_rcs = Some(frag.rcs);
        if !frag.payload.is_empty() {
            let position = self.profile.window_size as u16;
            self.tiles.insert((self.window, position), frag.payload.clone().into());
        }

        if let Some(lossy) = self.loss_detected() {
            debug!("window {lossy} has lost tiles; requesting retransmission");
            self.enqueue_window_ack(lossy);
            self.state = ReceiverState::Waiting;
        } else {
            self.validate();
        }
    }

    /// Re-ACK on request: the current window, a completed earlier window, or
    /// the final C=1.
    fn on_ack_req(&mut self, req: &AckReq) {
        self.touch_timer();
        if self.success {
            self.enqueue_success_ack();
            return;
        }
        let mask = self.profile.w_mask();
        if req.w == self.window & mask {
            self.enqueue_window_ack(self.window);
            if self.state == ReceiverState::Receiving {
                self.state = ReceiverState::Waiting;
            }
            return;
        }
        let earlier = self
            .bitmaps
            .iter()
            .rev()
            .find(|&(&w, ref bitmap)| w < self.window && w & mask == req.w && !bitmap.has_missing())
            .map(|(&w, _)| w);
        if let Some(w) = earlier {
            debug!("re-acknowledging completed window {w}");
            self.enqueue_window_ack(w);
        } else {
            warn!("ACK-REQ for window {} while at {}; ignoring", req.w, self.window);
        }
    }

    /// First window with an actual loss: any hole in an earlier window, or
    /// a gap below a received tile in the final one (its tail positions may
    /// simply never have been used).
    fn loss_detected(&self) -> Option<u16> {
        for (&w, bitmap) in &self.bitmaps {
            let lossy = if w == self.window && self.last_window {
                bitmap.has_gap()
            } else {
                bitmap.has_missing()
            };
            if lossy {
                return Some(w);
            }
        }
        None
    }

    /// Compare the RCS over everything received against the sender's.
    fn validate(&mut self) {
        let Some(expected) = self.final_rcs else { return };
        let (bytes, bit_len) = self.reassemble();
        let computed = rcs::compute(&bytes, bit_len, self.profile.l2_word);
        if computed == expected {
            debug!("integrity check passed ({computed:#010x})");
            self.success = true;
            self.enqueue_success_ack();
        } else {
            warn!("integrity check failed: sender {expected:#010x}, receiver {computed:#010x}");
            self.queue.clear();
            self.queue.push_back(SchcMessage::ReceiverAbort(ReceiverAbort {
                rule_id: self.profile.rule_id(),
                dtag: self.dtag,
            }));
            self.inactivity_timer.stop();
            self.state = ReceiverState::Error;
            self.exit = Some(SessionError::IntegrityFailed);
        }
    }

    /// Concatenate all tiles in `(window, position)` order.
    fn reassemble(&self) -> (Bytes, usize) {
        let mut out = BitWriter::new();
        for tile in self.tiles.values() {
            out.push_field(tile.as_bytes(), tile.bit_len());
        }
        let bit_len = out.len();
        (Bytes::from(out.into_bytes()), bit_len)
    }

    fn enqueue_window_ack(&mut self, window: u16) {
        let Some(bitmap) = self.bitmaps.get(&window) else { return };
        self.attempts.increment();
        debug!(
            "ACK for window {window}: {}/{} tiles, attempt {}",
            bitmap.received_count(),
            bitmap.len(),
            self.attempts.count()
        );
        self.queue.push_back(SchcMessage::Ack(Ack {
            rule_id: self.profile.rule_id(),
            dtag: self.dtag,
            w: window & self.profile.w_mask(),
            c: false,
            bitmap: Some(bitmap.compress(&self.profile)),
        }));
    }

    fn enqueue_success_ack(&mut self) {
        self.queue.push_back(SchcMessage::Ack(Ack {
            rule_id: self.profile.rule_id(),
            dtag: self.dtag,
            w: self.window & self.profile.w_mask(),
            c: true,
            bitmap: None,
        }));
    }

    fn advance_window(&mut self) {
        self.window += 1;
        debug!("starting reception of window {}", self.window);
        self.bitmaps.insert(self.window, Bitmap::new(self.profile.window_size));
    }

    fn touch_timer(&mut self) {
        self.inactivity_timer.arm(self.profile.inactivity_timeout);
    }
}

/// Cut a fragment payload back into tiles: fixed-size chunks with a
/// possibly shorter final one (the penultimate tile may be short when the
/// packet length was an exact tile multiple).
fn split_tiles(payload: &FragmentPayload, tile_size: usize) -> Vec<Tile> {
    let mut tiles = Vec::new();
    let mut offset = 0;
    while offset < payload.bit_len() {
        let len = tile_size.min(payload.bit_len() - offset);
        tiles.push(Tile::from_packet(payload.as_bytes(), offset, len));
        offset += len;
    }
    tiles
}
