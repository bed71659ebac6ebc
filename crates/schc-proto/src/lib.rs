//! SCHC (RFC 8724) message formats for the LoRaWAN profile (RFC 9011).
//!
//! This crate is the pure wire layer of the fragmentation engine: profile
//! parameter tables, an MSB-first bit codec, the closed set of SCHC message
//! types with bit-exact encoders, the endpoint-aware parser, and the window
//! bitmap with its ACK compression rule. It holds no session state and does
//! no I/O; the state machines live in `schc-core`.
//!
//! Wire conventions: a SCHC message occupies `FPort = rule_id` plus the
//! FRMPayload octets of a LoRaWAN frame. The first header bit is the MSB of
//! the first octet, and every emitted frame is a whole number of L2 words
//! (bytes, for LoRaWAN).

pub mod bitmap;
pub mod bits;
pub mod errors;
pub mod message;
pub mod parser;
pub mod profile;

pub use bitmap::Bitmap;
pub use errors::ProtocolError;
pub use message::{
    Ack, AckReq, All1Fragment, FragmentPayload, ReceiverAbort, RegularFragment, SchcMessage,
    SenderAbort,
};
pub use parser::{Endpoint, parse};
pub use profile::Profile;
