use std::fmt::{Debug, Formatter};
use anyhow::{anyhow, bail};
use bitflags::bitflags;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use crc::{Crc, CRC_32_ISO_HDLC};
use num_enum::{IntoPrimitive, TryFromPrimitive};

use crate::message::{Message, MessageTypeId};
use crate::paging::Page;
use crate::receipt::ReceiptSignature;

const CRC: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);

#[derive(Clone, Copy, Eq, PartialEq)]
pub struct Checksum(pub u32);
impl Debug for Checksum {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:08x?}", self.0)
    }
}
impl Checksum {
    pub fn new(body: &[u8]) -> Checksum {
        Checksum(CRC.checksum(body))
    }
}

#[derive(Debug, Clone, Copy, Eq, PartialEq, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum FrameKind {
    Message = 0,
    Page = 1,
    Ack = 2,
    Challenge = 3,
    ChallengeResponse = 4,
}

bitflags! {
    #[derive(Debug, Clone, Copy, Eq, PartialEq)]
    pub struct FrameFlags: u8 {
        const HAS_RECEIPT = 0b0000_0001;
    }
}

/// A [Frame] is everything that travels in a single datagram. See the crate documentation for
///  the wire layout.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum Frame {
    Message(Message),
    Page(Page),
    Ack(ReceiptSignature),
    Challenge { nonce: u64 },
    ChallengeResponse { nonce: u64, digest: [u8; 32] },
}

impl Frame {
    pub const PROTOCOL_VERSION_1: u8 = 1;

    /// version, kind, checksum
    pub const ENVELOPE_LEN: usize = 1 + 1 + 4;
    const CHECKSUM_OFFSET: usize = 2;

    pub const MESSAGE_HEADER_LEN_UNSIGNED: usize = Self::ENVELOPE_LEN + 8 + 1;
    pub const MESSAGE_HEADER_LEN_SIGNED: usize = Self::MESSAGE_HEADER_LEN_UNSIGNED + ReceiptSignature::SERIALIZED_LEN;
    pub const PAGE_HEADER_LEN: usize = Self::MESSAGE_HEADER_LEN_SIGNED + 2 + 2;

    pub fn kind(&self) -> FrameKind {
        match self {
            Frame::Message(_) => FrameKind::Message,
            Frame::Page(_) => FrameKind::Page,
            Frame::Ack(_) => FrameKind::Ack,
            Frame::Challenge { .. } => FrameKind::Challenge,
            Frame::ChallengeResponse { .. } => FrameKind::ChallengeResponse,
        }
    }

    /// the number of bytes a message occupies when encoded in a single (unpaged) frame
    pub fn encoded_message_len(message: &Message) -> usize {
        let header_len = if message.signature.is_some() {
            Self::MESSAGE_HEADER_LEN_SIGNED
        }
        else {
            Self::MESSAGE_HEADER_LEN_UNSIGNED
        };
        header_len + message.payload.len()
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::new();
        self.ser(&mut buf);
        buf.freeze()
    }

    pub fn ser(&self, buf: &mut BytesMut) {
        let start = buf.len();

        buf.put_u8(Self::PROTOCOL_VERSION_1);
        buf.put_u8(self.kind().into());
        buf.put_u32(0); // patched below

        match self {
            Frame::Message(message) => {
                Self::ser_message_header(message.type_id, message.signature, buf);
                buf.put_slice(&message.payload);
            }
            Frame::Page(page) => {
                Self::ser_message_header(page.type_id, Some(page.signature), buf);
                buf.put_u16(page.index);
                buf.put_u16(page.total);
                buf.put_slice(&page.chunk);
            }
            Frame::Ack(signature) => {
                signature.ser(buf);
            }
            Frame::Challenge { nonce } => {
                buf.put_u64(*nonce);
            }
            Frame::ChallengeResponse { nonce, digest } => {
                buf.put_u64(*nonce);
                buf.put_slice(digest);
            }
        }

        let checksum = Checksum::new(&buf[start + Self::ENVELOPE_LEN..]);
        buf[start + Self::CHECKSUM_OFFSET .. start + Self::ENVELOPE_LEN]
            .copy_from_slice(&checksum.0.to_be_bytes());
    }

    fn ser_message_header(type_id: MessageTypeId, signature: Option<ReceiptSignature>, buf: &mut BytesMut) {
        buf.put_u64(type_id.0);
        match signature {
            Some(signature) => {
                buf.put_u8(FrameFlags::HAS_RECEIPT.bits());
                signature.ser(buf);
            }
            None => {
                buf.put_u8(FrameFlags::empty().bits());
            }
        }
    }

    pub fn try_deser(buf: &[u8]) -> anyhow::Result<Frame> {
        if buf.len() < Self::ENVELOPE_LEN {
            bail!("datagram of length {} is too short for a frame", buf.len());
        }
        if buf[0] != Self::PROTOCOL_VERSION_1 {
            bail!("unsupported protocol version {}", buf[0]);
        }
        let kind = FrameKind::try_from(buf[1])
            .map_err(|_| anyhow!("invalid frame kind {}", buf[1]))?;

        let mut checksum_buf = &buf[Self::CHECKSUM_OFFSET..Self::ENVELOPE_LEN];
        let expected_checksum = Checksum(checksum_buf.try_get_u32()?);
        let mut body = &buf[Self::ENVELOPE_LEN..];
        let actual_checksum = Checksum::new(body);
        if expected_checksum != actual_checksum {
            bail!("checksum mismatch: expected {:?}, was {:?}", expected_checksum, actual_checksum);
        }

        let frame = match kind {
            FrameKind::Message => {
                let (type_id, signature) = Self::try_deser_message_header(&mut body)?;
                Frame::Message(Message {
                    type_id,
                    signature,
                    payload: Bytes::copy_from_slice(body),
                })
            }
            FrameKind::Page => {
                let (type_id, signature) = Self::try_deser_message_header(&mut body)?;
                let signature = signature
                    .ok_or_else(|| anyhow!("page without receipt signature"))?;
                let index = body.try_get_u16()?;
                let total = body.try_get_u16()?;
                Frame::Page(Page {
                    type_id,
                    signature,
                    index,
                    total,
                    chunk: Bytes::copy_from_slice(body),
                })
            }
            FrameKind::Ack => {
                let signature = ReceiptSignature::try_deser(&mut body)?;
                Self::ensure_consumed(body)?;
                Frame::Ack(signature)
            }
            FrameKind::Challenge => {
                let nonce = body.try_get_u64()?;
                Self::ensure_consumed(body)?;
                Frame::Challenge { nonce }
            }
            FrameKind::ChallengeResponse => {
                let nonce = body.try_get_u64()?;
                let mut digest = [0u8; 32];
                if body.remaining() < digest.len() {
                    bail!("challenge response digest is truncated");
                }
                body.copy_to_slice(&mut digest);
                Self::ensure_consumed(body)?;
                Frame::ChallengeResponse { nonce, digest }
            }
        };
        Ok(frame)
    }

    fn try_deser_message_header(body: &mut &[u8]) -> anyhow::Result<(MessageTypeId, Option<ReceiptSignature>)> {
        let type_id = MessageTypeId(body.try_get_u64()?);
        let raw_flags = body.try_get_u8()?;
        let flags = FrameFlags::from_bits(raw_flags)
            .ok_or_else(|| anyhow!("unknown frame flags {:#04x}", raw_flags))?;

        let signature = if flags.contains(FrameFlags::HAS_RECEIPT) {
            Some(ReceiptSignature::try_deser(body)?)
        }
        else {
            None
        };
        Ok((type_id, signature))
    }

    fn ensure_consumed(body: &[u8]) -> anyhow::Result<()> {
        if !body.is_empty() {
            bail!("{} trailing bytes after control frame", body.len());
        }
        Ok(())
    }
}
