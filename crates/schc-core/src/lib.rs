//! SCHC fragmentation and reassembly engine (RFC 8724, LoRaWAN profile of
//! RFC 9011).
//!
//! The core transports an opaque packet that exceeds the L2 MTU across a
//! lossy link: the fragmenter slices it into numbered tiles and frames them
//! into bit-packed SCHC messages, the reassembler acknowledges windows
//! through compressed bitmaps, losses are repaired selectively, and a CRC-32
//! Reassembly Check Sequence gates end-to-end integrity.
//!
//! Everything is single-threaded and cooperative: state only moves when the
//! host calls [`Session::receive_message`], [`Session::generate_message`] or
//! [`Session::on_timer`]. No call blocks, no I/O happens inside, and no
//! partial message is ever emitted. Hosts that only want byte-in/byte-out
//! routing use [`SessionHandler`].
//!
//! ```
//! use bytes::Bytes;
//! use schc_core::Session;
//! use schc_proto::Profile;
//!
//! let profile = Profile::lorawan(Profile::ACK_ON_ERROR)?;
//! let mut sender = Session::new_sender(profile, &Bytes::from_static(b"Hello"), 0, None)?;
//! let mut receiver = Session::new_receiver(profile, None, |packet| {
//!     assert_eq!(packet.as_ref(), b"Hello");
//! })?;
//!
//! while let Some(message) = sender.generate_message(51)? {
//!     receiver.receive_message(message.fport, &message.payload)?;
//!     while let Some(reply) = receiver.generate_message(51)? {
//!         sender.receive_message(reply.fport, &reply.payload)?;
//!     }
//!     if sender.is_terminal() {
//!         break;
//!     }
//! }
//! assert!(sender.is_terminal() && receiver.is_terminal());
//! # Ok::<(), schc_core::SessionError>(())
//! ```

pub mod alarm;
pub mod error;
pub mod handler;
pub mod rcs;
pub mod receiver;
pub mod sender;
pub mod session;
pub mod tile;

pub use alarm::{Alarm, AttemptsCounter};
pub use error::SessionError;
pub use handler::{Handled, SessionHandler};
pub use session::{Session, WireMessage};
pub use tile::Tile;
