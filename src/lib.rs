//! A messaging layer on top of an unreliable datagram transport (UDP). It provides type-keyed
//!  dispatch of messages, at-least-once delivery for messages that need it, and transparent
//!  splitting of messages that are too big for a single datagram.
//!
//! ## Design goals
//!
//! * The abstraction is sending / receiving *messages*, i.e. typed chunks of data of arbitrary
//!   (bounded) length
//!   * messages are sent either unreliably (fire-and-forget) or reliably
//!   * each message has a [message::MessageTypeId], and received messages are dispatched to the
//!     handlers registered for their type on the [message_bus::MessageBus]
//! * Reliable messages carry a [receipt::ReceiptSignature], and the receiver acknowledges them
//!   * the sender tracks them in the [repository::MessageRepository] until they are acknowledged
//!     or their TTL expires
//!   * the [repeater::MessageRepeater] re-sends them blindly at a fixed interval while they are
//!     tracked
//!   * the receiver remembers signatures for a while and dispatches re-sent messages only once
//!   * there is no ordering guarantee, neither across peers nor between messages from the same
//!     peer
//!   * applications that need to know if a message was delivered or given up subscribe to
//!     [repository::TrackingEvent]s
//! * Big messages are split into pages and reassembled on the receiving side - see [paging]
//!   * pages of incomplete messages are evicted after a while, and malformed pages are dropped
//!     without affecting other pages
//! * Peers prove knowledge of a shared secret in a handshake before reliable messages are sent
//!   to them
//! * There is a checksum per datagram
//!
//! ## Frame
//!
//! Every datagram contains exactly one frame. All numbers are in network byte order (BE):
//!
//! ```ascii
//! 0: protocol version (u8) - currently 1
//! 1: frame kind (u8):
//!    * 0 MESSAGE
//!    * 1 PAGE
//!    * 2 ACK
//!    * 3 CHALLENGE
//!    * 4 CHALLENGE_RESPONSE
//! 2: CRC-32 (ISO-HDLC) checksum (u32) of all bytes following the checksum
//! 6: frame body, depending on the frame kind
//! ```
//!
//! MESSAGE:
//! ```ascii
//!  0: message type id (u64)
//!  8: flags (u8):
//!     * bit 0: the message has a receipt signature
//!  9: receipt signature (16 bytes) - only if the flag is set
//!  *: payload until the end of the datagram
//! ```
//!
//! PAGE - a fragment of a message that does not fit into a single datagram. A message that fits
//!  is always sent as MESSAGE, so paged messages have at least two pages:
//! ```ascii
//!  0: message type id (u64)
//!  8: flags (u8) - bit 0 (receipt signature) must be set
//!  9: receipt signature (16 bytes) of the paged message
//! 25: page index (u16), zero-based
//! 27: total number of pages (u16)
//! 29: chunk of the message's payload until the end of the datagram
//! ```
//!
//! ACK:
//! ```ascii
//!  0: receipt signature (16 bytes) of the acknowledged message
//! ```
//!
//! CHALLENGE / CHALLENGE_RESPONSE:
//! ```ascii
//!  0: nonce (u64)
//!  8: SHA-256 of the shared secret, the challenger's and the responder's address (IP octets and
//!     port) and the nonce (32 bytes) - CHALLENGE_RESPONSE only
//! ```

pub mod config;
pub mod dedup;
pub mod end_point;
pub mod frame;
pub mod handshake;
pub mod message;
pub mod message_bus;
pub mod paging;
pub mod receipt;
pub mod repeater;
pub mod repository;
pub mod safe_converter;
pub mod test_util;
pub mod transport;
