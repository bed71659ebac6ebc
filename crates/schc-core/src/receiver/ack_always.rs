//! Ack-Always reassembler (LoRaWAN downlink, rule 21).

use std::collections::{BTreeMap, VecDeque};

use bytes::Bytes;
use schc_proto::{
    Ack, AckReq, All1Fragment, Profile, ReceiverAbort, RegularFragment, SchcMessage,
    bits::BitWriter,
};
use tracing::{debug, warn};

use crate::{
    alarm::{Alarm, AttemptsCounter},
    error::{Result, SessionError},
    rcs,
    receiver::ReceiverState,
    tile::Tile,
};

/// Reassembler for the Ack-Always mode.
///
/// Stop-and-wait mirror of [`AckAlwaysSender`](crate::sender::AckAlwaysSender):
/// every fragment is one window holding one device-sized tile and is ACKed
/// individually. A duplicate fragment for an already-acknowledged window
/// means the ACK was lost; it is re-acknowledged without storing again.
#[derive(Debug)]
pub struct AckAlwaysReceiver {
    profile: Profile,
    dtag: Option<u16>,
    state: ReceiverState,
    window: u16,
    /// One tile per window, in arrival (and packet) order.
    tiles: BTreeMap<u16, Tile>,
    last_ack: Option<SchcMessage>,
    last_window: bool,
    final_rcs: Option<u32>,
    success: bool,
    delivery: Option<Bytes>,
    queue: VecDeque<SchcMessage>,
    inactivity_timer: Alarm,
    attempts: AttemptsCounter,
    exit: Option<SessionError>,
}

impl AckAlwaysReceiver {
    /// Fresh session; the inactivity alarm is armed immediately.
    #[must_use]
    pub fn new(profile: Profile, dtag: Option<u16>) -> Self {
        let mut inactivity_timer = Alarm::Stopped;
        inactivity_timer.arm(profile.inactivity_timeout);
        Self {
            profile,
            dtag,
            state: ReceiverState::Receiving,
            window: 0,
            tiles: BTreeMap::new(),
            last_ack: None,
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
            (_, SchcMessage::Regular(frag)) => {
                self.on_regular(frag);
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

    /// Re-ACK the window the sender is asking about: the one just
    /// acknowledged, or a NAK for one that never arrived.
    fn on_ack_req(&mut self, req: &AckReq) {
        self.touch_timer();
        if self.success {
            self.enqueue_success_ack();
            return;
        }
        let mask = self.profile.w_mask();
        if req.w == self.window & mask {
            if self.state == ReceiverState::Waiting {
                if let Some(ack) = self.last_ack.clone() {
                    debug!("re-sending last ACK on request");
                    self.queue.push_back(ack);
                    return;
                }
            }
            // Nothing received for this window yet.
            self.enqueue_nak(req.w);
        } else if self.state == ReceiverState::Waiting && req.w == (self.window + 1) & mask {
            debug!("window {} requested before any fragment arrived; NAKing", req.w);
            self.enqueue_nak(req.w);
        } else {
            warn!("ACK-REQ for window {} while at {}; ignoring", req.w, self.window);
        }
    }

    fn on_regular(&mut self, frag: &RegularFragment) {
        let mask = self.profile.w_mask();
        self.touch_timer();

        if self.state == ReceiverState::Waiting && frag.w == self.window & mask {
            // Our ACK was lost; the sender repeated the fragment.
            debug!("duplicate fragment for window {}; re-acknowledging", self.window);
            if let Some(ack) = self.last_ack.clone() {
                self.queue.push_back(ack);
            }
            return;
        }
        if self.state == ReceiverState::Waiting && frag.w == (self.window + 1) & mask {
            self.window += 1;
            self.state = ReceiverState::Receiving;
            debug!("starting reception of window {}", self.window);
        } else if frag.w != self.window & mask {
            warn!("fragment for window {} while at {}; dropping", frag.w, self.window);
            return;
        }

        self.tiles.insert(self.window, frag.payload.clone().into());
        self.enqueue_window_ack();
        self.state = ReceiverState::Waiting;
    }

    fn on_all1(&mut self, frag: &All1Fragment) {
        let mask = self.profile.w_mask();
        self.touch_timer();

        if self.state == ReceiverState::Waiting && frag.w == self.window & mask && self.success {
            debug!("duplicate All-1; re-acknowledging success");
            self.enqueue_success_ack();
            return;
        }
        if self.state == ReceiverState::Waiting && frag.w == (self.window + 1) & mask {
            self.window += 1;
            self.state = ReceiverState::Receiving;
            debug!("starting reception of window {}", self.window);
        } else if frag.w != self.window & mask {
            warn!("All-1 for window {} while at {}; dropping", frag.w, self.window);
            return;
        }

        self.last_window = true;
        self.final_rcs = Some(frag.rcs);
        if !frag.payload.is_empty() {
            self.tiles.insert(self.window, frag.payload.clone().into());
        }

        let (bytes, bit_len) = self.reassemble();
        let computed = rcs::compute(&bytes, bit_len, self.profile.l2_word);
        if computed == frag.rcs {
            debug!("integrity check passed ({computed:#010x})");
            self.success = true;
            self.enqueue_success_ack();
            self.state = ReceiverState::Waiting;
        } else {
            warn!("integrity check failed: sender {:#010x}, receiver {computed:#010x}", frag.rcs);
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

    fn reassemble(&self) -> (Bytes, usize) {
        let mut out = BitWriter::new();
        for tile in self.tiles.values() {
            out.push_field(tile.as_bytes(), tile.bit_len());
        }
        let bit_len = out.len();
        (Bytes::from(out.into_bytes()), bit_len)
    }

    /// Confirm the current window with a one-bit bitmap.
    fn enqueue_window_ack(&mut self) {
        self.attempts.increment();
        let ack = SchcMessage::Ack(Ack {
            rule_id: self.profile.rule_id(),
            dtag: self.dtag,
            w: self.window & self.profile.w_mask(),
            c: false,
            bitmap: Some(vec![true]),
        });
        self.last_ack = Some(ack.clone());
        self.queue.push_back(ack);
    }

    /// Report a window whose fragment never arrived. Not cached as the last
    /// ACK: a later duplicate question must reflect the state by then.
    fn enqueue_nak(&mut self, w: u16) {
        self.attempts.increment();
        self.queue.push_back(SchcMessage::Ack(Ack {
            rule_id: self.profile.rule_id(),
            dtag: self.dtag,
            w,
            c: false,
            bitmap: Some(vec![false]),
        }));
    }

    fn enqueue_success_ack(&mut self) {
        let ack = SchcMessage::Ack(Ack {
            rule_id: self.profile.rule_id(),
            dtag: self.dtag,
            w: self.window & self.profile.w_mask(),
            c: true,
            bitmap: None,
        });
        self.last_ack = Some(ack.clone());
        self.queue.push_back(ack);
    }

    fn touch_timer(&mut self) {
        self.inactivity_timer.arm(self.profile.inactivity_timeout);
    }
}
