//! Paging makes message size transparent to the rest of the messaging layer: messages that do
//!  not fit into a single datagram are split into [Page]s on the sending side and reassembled
//!  from them on the receiving side.
//!
//! A message that fits into a single datagram is sent as a regular message frame without any
//!  paging overhead. There is no such thing as a 'single page' message on the wire: a page frame
//!  always belongs to a message that was split into at least two pages.

mod reassembler;

pub use reassembler::Reassembler;

use anyhow::bail;
use bytes::Bytes;
use tracing::trace;

use crate::frame::Frame;
use crate::message::{Message, MessageTypeId};
use crate::receipt::ReceiptSignature;
use crate::repository::RepositoryError;
use crate::safe_converter::PrecheckedCast;

/// A fragment of a message that is too big for a single datagram. Pages carry their parent
///  message's type and signature, and the signature is what keeps fragments of different messages
///  apart.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Page {
    pub type_id: MessageTypeId,
    pub signature: ReceiptSignature,
    pub index: u16,
    pub total: u16,
    pub chunk: Bytes,
}

/// Encodes a message into the datagrams that carry it: a single message frame if it fits into
///  `max_datagram_size`, or a sequence of page frames otherwise.
///
/// Paging requires the message to have a signature for correlating the pages.
pub fn split(message: &Message, max_datagram_size: usize) -> anyhow::Result<Vec<Bytes>> {
    if Frame::encoded_message_len(message) <= max_datagram_size {
        return Ok(vec![Frame::Message(message.clone()).encode()]);
    }

    let signature = message.signature
        .ok_or(RepositoryError::MissingReceipt)?;

    if max_datagram_size <= Frame::PAGE_HEADER_LEN {
        bail!("datagram size of {} leaves no room for page payload", max_datagram_size);
    }
    let chunk_size = max_datagram_size - Frame::PAGE_HEADER_LEN;

    let num_pages = message.payload.len().div_ceil(chunk_size);
    if num_pages > u16::MAX as usize {
        bail!("message of length {} would require {} pages, the maximum is {}", message.payload.len(), num_pages, u16::MAX);
    }
    let total: u16 = num_pages.prechecked_cast();

    trace!("splitting {:?} into {} pages", message, total);

    let pages = (0..num_pages)
        .map(|index| {
            let start = index * chunk_size;
            let end = (start + chunk_size).min(message.payload.len());

            Frame::Page(Page {
                type_id: message.type_id,
                signature,
                index: index.prechecked_cast(),
                total,
                chunk: message.payload.slice(start..end),
            }).encode()
        })
        .collect();
    Ok(pages)
}
