use std::fmt::{Debug, Display, Formatter};
use bytes::{Buf, BufMut};
#[cfg(test)] use mockall::automock;
use uuid::Uuid;

/// A [ReceiptSignature] identifies a logical message for correlation: acknowledgements refer to
///  it, the repository is keyed by it, and pages carry their parent message's signature so that
///  fragments of different messages are never assembled together.
///
/// Two signatures are equal iff they represent the same logical message. Signatures are values,
///  they are never mutated after creation.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct ReceiptSignature(Uuid);

impl ReceiptSignature {
    pub const SERIALIZED_LEN: usize = 16;

    pub const fn from_u128(raw: u128) -> ReceiptSignature {
        ReceiptSignature(Uuid::from_u128(raw))
    }

    pub fn to_u128(&self) -> u128 {
        self.0.as_u128()
    }

    pub fn ser(&self, buf: &mut impl BufMut) {
        buf.put_slice(self.0.as_bytes());
    }

    pub fn try_deser(buf: &mut impl Buf) -> anyhow::Result<ReceiptSignature> {
        Ok(ReceiptSignature(Uuid::from_u128(buf.try_get_u128()?)))
    }
}

impl Debug for ReceiptSignature {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "Receipt({})", self.0)
    }
}

impl Display for ReceiptSignature {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        Display::fmt(&self.0, f)
    }
}


/// Source of fresh signatures. This is injected rather than hard-wired to allow deterministic
///  signatures in tests.
#[cfg_attr(test, automock)]
pub trait SignatureFactory: Send + Sync + 'static {
    /// Never returns two equal values within the practical lifetime of a process
    fn new_signature(&self) -> ReceiptSignature;
}

/// Random (v4) UUIDs: 122 random bits make collisions practically impossible
pub struct UuidSignatureFactory;
impl SignatureFactory for UuidSignatureFactory {
    fn new_signature(&self) -> ReceiptSignature {
        ReceiptSignature(Uuid::new_v4())
    }
}
