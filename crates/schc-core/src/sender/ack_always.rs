//! Ack-Always fragmenter (LoRaWAN downlink, rule 21).

use std::collections::VecDeque;

use bytes::Bytes;
use schc_proto::{
    Ack, AckReq, All1Fragment, Profile, RegularFragment, SchcMessage, SenderAbort,
};
use tracing::{debug, warn};

use crate::{
    alarm::{Alarm, AttemptsCounter},
    error::{Result, SessionError},
    rcs,
    sender::SenderState,
    tile::Tile,
};

/// Fragmenter for the Ack-Always mode.
///
/// Stop-and-wait: each fragment is its own window (W toggles between 0 and
/// 1) and must be acknowledged before the next goes out. Tile size is picked
/// per MTU so that the 10-bit fragment header plus the tile lands exactly on
/// a byte boundary; the All-1 Fragment carries whatever remains.
#[derive(Debug)]
pub struct AckAlwaysSender {
    profile: Profile,
    dtag: Option<u16>,
    state: SenderState,
    packet: Bytes,
    bit_len: usize,
    offset: usize,
    window: u16,
    last_window: bool,
    rcs: u32,
    /// Last fragment sent, kept for retransmission.
    last_fragment: Option<SchcMessage>,
    attempts: AttemptsCounter,
    retransmission_timer: Alarm,
    queue: VecDeque<SchcMessage>,
    exit: Option<SessionError>,
}

impl AckAlwaysSender {
    /// Start a session for `packet`; see
    /// [`AckOnErrorSender::new`](crate::sender::AckOnErrorSender::new) for
    /// the `padding_bits` contract.
    #[must_use]
    pub fn new(profile: Profile, packet: &Bytes, padding_bits: usize, dtag: Option<u16>) -> Self {
        debug_assert!(padding_bits < profile.l2_word);
        let bit_len = packet.len() * 8 - padding_bits;
        let rcs = rcs::compute(packet, bit_len, profile.l2_word);
        debug!("Ack-Always sender: {bit_len} bits, rcs {rcs:#010x}");
        Self {
            profile,
            dtag,
            state: SenderState::Sending,
            packet: packet.clone(),
            bit_len,
            offset: 0,
            window: 0,
            last_window: false,
            rcs,
            last_fragment: None,
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
            SenderState::Sending => self.generate_fragment(mtu).map(Some),
            SenderState::Resending => self.resend_last(mtu).map(Some),
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
            warn!("no ACK after {attempts} requests; aborting");
            self.abort(SessionError::AttemptsExhausted { attempts });
        } else {
            self.attempts.increment();
            self.queue.push_back(SchcMessage::AckReq(AckReq {
                rule_id: self.profile.rule_id(),
                dtag: self.dtag,
                w: self.window & self.profile.w_mask(),
            }));
            self.retransmission_timer.arm(self.profile.retransmission_timeout);
        }
    }

    fn generate_fragment(&mut self, mtu: usize) -> Result<SchcMessage> {
        let profile = self.profile;
        let remaining = self.bit_len - self.offset;
        let budget_bits = mtu * 8 + profile.rule_size;

        let all1_bits = profile.all1_header_bits() + remaining;
        let pad = profile.padding_bits(all1_bits);
        let message = if all1_bits + pad <= budget_bits {
            self.last_window = true;
            let tile = Tile::from_packet(&self.packet, self.offset, remaining);
            self.offset = self.bit_len;
            debug!("emitting All-1 for window {} ({remaining} bits)", self.window);
            SchcMessage::All1(All1Fragment {
                rule_id: profile.rule_id(),
                dtag: self.dtag,
                w: self.window & profile.w_mask(),
                // Without a fixed tile size the peer cannot strip the All-1
                // padding, so the RCS must cover those bits too.
                rcs: self.padded_rcs(pad),
                payload: tile.to_payload(),
            })
        } else {
            // Largest tile with header + tile on a word boundary, leaving at
            // least one bit for the All-1.
            let header = profile.fragment_header_bits();
            let max_aligned = budget_bits.saturating_sub(header);
            let capped = max_aligned.min(remaining - 1);
            let tile_bits = capped.saturating_sub((header + capped) % profile.l2_word);
            if tile_bits == 0 {
                return Err(SessionError::NoBudget {
                    needed: (header + profile.l2_word) / 8,
                    mtu,
                });
            }
            let tile = Tile::from_packet(&self.packet, self.offset, tile_bits);
            self.offset += tile_bits;
            debug!("emitting tile of {tile_bits} bits for window {}", self.window);
            SchcMessage::Regular(RegularFragment {
                rule_id: profile.rule_id(),
                dtag: self.dtag,
                w: self.window & profile.w_mask(),
                fcn: 0,
                payload: tile.to_payload(),
            })
        };

        self.last_fragment = Some(message.clone());
        self.retransmission_timer.arm(profile.retransmission_timeout);
        self.state = SenderState::Waiting;
        Ok(message)
    }

    /// RCS as the peer will compute it: over the packet plus the `pad` zero
    /// bits its reassembly inherits from the All-1 Fragment.
    fn padded_rcs(&self, pad: usize) -> u32 {
        if pad == 0 {
            return self.rcs;
        }
        let covered = self.bit_len + pad;
        let mut bytes = self.packet.to_vec();
        bytes.resize(covered.div_ceil(8), 0);
        rcs::compute(&bytes, covered, self.profile.l2_word)
    }

    fn resend_last(&mut self, mtu: usize) -> Result<SchcMessage> {
        let Some(message) = self.last_fragment.clone() else {
            return Err(SessionError::UnexpectedState {
                state: self.state.name(),
                message: "nothing to re-send",
            });
        };
        let needed = message.frm_payload_len(&self.profile);
        if needed > mtu {
            return Err(SessionError::NoBudget { needed, mtu });
        }
        debug!("re-sending window {} fragment", self.window);
        self.retransmission_timer.arm(self.profile.retransmission_timeout);
        self.state = SenderState::Waiting;
        Ok(message)
    }

    fn handle_ack(&mut self, ack: &Ack) {
        let mask = self.profile.w_mask();
        let current = self.window & mask;
        if ack.w != current {
            warn!("ACK for window {} while at {}; ignoring", ack.w, current);
            return;
        }

        if ack.c {
            if self.last_window {
                debug!("final ACK with C=1; transfer complete");
                self.retransmission_timer.stop();
                self.queue.clear();
                self.state = SenderState::End;
            } else {
                warn!("C=1 before the All-1; aborting");
                self.abort(SessionError::UnexpectedState {
                    state: self.state.name(),
                    message: "C=1 ACK before the All-1",
                });
            }
            return;
        }

        let received = ack.bitmap.as_ref().is_some_and(|bits| bits.first().copied() == Some(true));
        if received {
            if self.last_window {
                // The All-1 is confirmed through C=1 only.
                warn!("C=0 ACK confirming the final window; aborting");
                self.abort(SessionError::IntegrityFailed);
            } else {
                debug!("window {} acknowledged; advancing", self.window);
                self.window += 1;
                self.attempts.reset();
                self.queue.clear();
                self.retransmission_timer.stop();
                self.state = SenderState::Sending;
            }
        } else {
            debug!("window {} reported missing; re-sending", self.window);
            self.queue.clear();
            self.retransmission_timer.stop();
            // A responsive peer refreshes the ACK-REQ budget.
            self.attempts.reset();
            self.state = SenderState::Resending;
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
