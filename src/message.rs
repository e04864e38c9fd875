use std::fmt::{Debug, Formatter};
use bytes::Bytes;
use crate::receipt::ReceiptSignature;


/// A [MessageTypeId] is sent as part of every message to identify its type for dispatch on the
///  receiving side.
///
/// An id is technically a u64, but it is intended to be used as a sequence of up to eight ASCII
///  characters to give it a human-readable name, both for uniqueness and for debugging at the
///  wire level.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct MessageTypeId(pub u64);

impl MessageTypeId {
    pub const fn new(value: &[u8; 8]) -> MessageTypeId {
        Self(u64::from_be_bytes(*value))
    }
}

impl Debug for MessageTypeId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let bytes = self.0.to_be_bytes();
        let used = bytes.iter()
            .position(|&b| b == 0)
            .map(|len| &bytes[..len])
            .unwrap_or(&bytes);

        let string_repr = std::str::from_utf8(used).unwrap_or("???");

        write!(f, "0x{:016X}({:?})", self.0, string_repr)
    }
}


/// The unit of application data. A message without a signature is 'unreliable': it is sent
///  fire-and-forget and never tracked.
#[derive(Clone, Eq, PartialEq)]
pub struct Message {
    pub type_id: MessageTypeId,
    pub signature: Option<ReceiptSignature>,
    pub payload: Bytes,
}

impl Message {
    pub fn unreliable(type_id: MessageTypeId, payload: impl Into<Bytes>) -> Message {
        Message {
            type_id,
            signature: None,
            payload: payload.into(),
        }
    }

    pub fn with_signature(type_id: MessageTypeId, signature: ReceiptSignature, payload: impl Into<Bytes>) -> Message {
        Message {
            type_id,
            signature: Some(signature),
            payload: payload.into(),
        }
    }

    pub fn is_reliable(&self) -> bool {
        self.signature.is_some()
    }
}

impl Debug for Message {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        // payloads can be big - their length is what is useful in logs
        write!(f, "Message{{type:{:?}, signature:{:?}, len:{}}}", self.type_id, self.signature, self.payload.len())
    }
}
