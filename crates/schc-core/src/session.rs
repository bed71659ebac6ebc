//! Session facade over the four fragmentation machines.
//!
//! A [`Session`] owns one machine, picked by rule ID and role, and exposes
//! the byte-level API the host drives: `generate_message` / `receive_message`
//! / `on_timer`. Receiver sessions carry a success callback that fires
//! exactly once, with the reassembled packet, when the final C=1 ACK is
//! handed out.

use bytes::Bytes;
use schc_proto::{Endpoint, Profile, SchcMessage, parse};

use crate::{
    alarm::Alarm,
    error::{Result, SessionError},
    receiver::{AckAlwaysReceiver, AckOnErrorReceiver},
    sender::{AckAlwaysSender, AckOnErrorSender},
};

/// Callback invoked with the reassembled packet on success.
pub type SuccessFn = Box<dyn FnMut(Bytes) + Send>;

/// One encoded SCHC message, split the way LoRaWAN carries it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WireMessage {
    /// LoRaWAN FPort (the RuleID).
    pub fport: u8,
    /// FRMPayload octets.
    pub payload: Bytes,
}

impl WireMessage {
    /// Concatenated `FPort ‖ FRMPayload` form.
    #[must_use]
    pub fn to_bytes(&self) -> Bytes {
        let mut out = Vec::with_capacity(1 + self.payload.len());
        out.push(self.fport);
        out.extend_from_slice(&self.payload);
        Bytes::from(out)
    }
}

enum Machine {
    UplinkSender(AckOnErrorSender),
    UplinkReceiver(AckOnErrorReceiver),
    DownlinkSender(AckAlwaysSender),
    DownlinkReceiver(AckAlwaysReceiver),
}

/// One fragmentation or reassembly session for a `(rule_id, dtag)` pair.
pub struct Session {
    profile: Profile,
    dtag: Option<u16>,
    machine: Machine,
    on_success: Option<SuccessFn>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("rule_id", &self.profile.rule_id())
            .field("dtag", &self.dtag)
            .field("state", &self.state_name())
            .finish_non_exhaustive()
    }
}

impl Session {
    /// Fragmenter session for `packet`. `padding_bits` counts trailing
    /// compression-residue bits of the last byte (0 for plain byte
    /// payloads).
    ///
    /// # Errors
    ///
    /// - `SessionError::NotSupported` when the profile's rule has no sender
    ///   machine
    pub fn new_sender(
        profile: Profile,
        packet: &Bytes,
        padding_bits: usize,
        dtag: Option<u16>,
    ) -> Result<Self> {
        let machine = match profile.rule_id() {
            Profile::ACK_ON_ERROR => {
                Machine::UplinkSender(AckOnErrorSender::new(profile, packet, padding_bits, dtag))
            }
            Profile::ACK_ALWAYS => {
                Machine::DownlinkSender(AckAlwaysSender::new(profile, packet, padding_bits, dtag))
            }
            other => return Err(SessionError::NotSupported(other)),
        };
        Ok(Self { profile, dtag, machine, on_success: None })
    }

    /// Reassembler session; `on_success` receives the packet bytes once.
    ///
    /// # Errors
    ///
    /// - `SessionError::NotSupported` when the profile's rule has no
    ///   receiver machine
    pub fn new_receiver(
        profile: Profile,
        dtag: Option<u16>,
        on_success: impl FnMut(Bytes) + Send + 'static,
    ) -> Result<Self> {
        let machine = match profile.rule_id() {
            Profile::ACK_ON_ERROR => {
                Machine::UplinkReceiver(AckOnErrorReceiver::new(profile, dtag))
            }
            Profile::ACK_ALWAYS => {
                Machine::DownlinkReceiver(AckAlwaysReceiver::new(profile, dtag))
            }
            other => return Err(SessionError::NotSupported(other)),
        };
        Ok(Self { profile, dtag, machine, on_success: Some(Box::new(on_success)) })
    }

    /// Profile this session runs under.
    #[must_use]
    pub fn profile(&self) -> &Profile {
        &self.profile
    }

    /// Datagram tag of this session.
    #[must_use]
    pub fn dtag(&self) -> Option<u16> {
        self.dtag
    }

    /// Current state name, for diagnostics.
    #[must_use]
    pub fn state_name(&self) -> &'static str {
        match &self.machine {
            Machine::UplinkSender(m) => m.state_name(),
            Machine::UplinkReceiver(m) => m.state_name(),
            Machine::DownlinkSender(m) => m.state_name(),
            Machine::DownlinkReceiver(m) => m.state_name(),
        }
    }

    /// True once the session reached End or Error.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        match &self.machine {
            Machine::UplinkSender(m) => m.is_terminal(),
            Machine::UplinkReceiver(m) => m.is_terminal(),
            Machine::DownlinkSender(m) => m.is_terminal(),
            Machine::DownlinkReceiver(m) => m.is_terminal(),
        }
    }

    /// One-shot alarm the host should keep scheduled; call [`Self::on_timer`]
    /// when it fires. Re-read after every other call on this session.
    #[must_use]
    pub fn alarm(&self) -> Alarm {
        match &self.machine {
            Machine::UplinkSender(m) => m.alarm(),
            Machine::UplinkReceiver(m) => m.alarm(),
            Machine::DownlinkSender(m) => m.alarm(),
            Machine::DownlinkReceiver(m) => m.alarm(),
        }
    }

    /// Next outbound message fitting `mtu` FRMPayload bytes, fully
    /// serialised. `None` means nothing to send right now; no partial
    /// message is ever produced.
    ///
    /// # Errors
    ///
    /// - `SessionError::NoBudget` when the smallest pending message exceeds
    ///   `mtu`
    /// - the session's exit reason once it is in Error with nothing queued
    pub fn generate_message(&mut self, mtu: usize) -> Result<Option<WireMessage>> {
        let message = match &mut self.machine {
            Machine::UplinkSender(m) => m.generate_message(mtu)?,
            Machine::UplinkReceiver(m) => m.generate_message(mtu)?,
            Machine::DownlinkSender(m) => m.generate_message(mtu)?,
            Machine::DownlinkReceiver(m) => m.generate_message(mtu)?,
        };
        let wire = message.map(|m| {
            let (fport, payload) = m.to_bytes(&self.profile);
            WireMessage { fport, payload }
        });
        self.deliver_if_ready();
        Ok(wire)
    }

    /// Feed inbound FRMPayload octets received on `fport`.
    ///
    /// # Errors
    ///
    /// - `SessionError::Malformed` when the octets decode to no message
    /// - `SessionError::UnexpectedState` when the message cannot be handled
    ///   in the current state (the state is unchanged)
    /// - the session's exit reason once it is terminal
    pub fn receive_message(&mut self, fport: u8, frm_payload: &[u8]) -> Result<()> {
        if fport != self.profile.rule_id() {
            return Err(SessionError::NotSupported(fport));
        }
        let endpoint = match &self.machine {
            Machine::UplinkSender(_) | Machine::DownlinkSender(_) => Endpoint::Fragmenter,
            Machine::UplinkReceiver(_) | Machine::DownlinkReceiver(_) => Endpoint::Reassembler,
        };
        let message: SchcMessage = parse(&self.profile, fport, frm_payload, endpoint)?;
        match &mut self.machine {
            Machine::UplinkSender(m) => m.receive_message(&message),
            Machine::UplinkReceiver(m) => m.receive_message(&message),
            Machine::DownlinkSender(m) => m.receive_message(&message),
            Machine::DownlinkReceiver(m) => m.receive_message(&message),
        }
    }

    /// The host's alarm fired. Idempotent.
    pub fn on_timer(&mut self) {
        match &mut self.machine {
            Machine::UplinkSender(m) => m.on_timer(),
            Machine::UplinkReceiver(m) => m.on_timer(),
            Machine::DownlinkSender(m) => m.on_timer(),
            Machine::DownlinkReceiver(m) => m.on_timer(),
        }
    }

    fn deliver_if_ready(&mut self) {
        let delivery = match &mut self.machine {
            Machine::UplinkReceiver(m) => m.take_delivery(),
            Machine::DownlinkReceiver(m) => m.take_delivery(),
            Machine::UplinkSender(_) | Machine::DownlinkSender(_) => None,
        };
        if let (Some(bytes), Some(on_success)) = (delivery, self.on_success.as_mut()) {
            on_success(bytes);
        }
    }
}
