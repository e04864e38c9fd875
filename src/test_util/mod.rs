//! Utilities for testing code that uses the messaging layer: an in-memory network that connects
//!  end points without sockets, a transport that records what was sent, and a message handler
//!  that records what was received.
//!
//! They are part of the crate's regular code rather than `#[cfg(test)]` so that applications can
//!  use them in their own tests.

pub mod handler;
pub mod network;
pub mod transport;
