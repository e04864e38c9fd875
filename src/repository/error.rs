use thiserror::Error;

use crate::receipt::ReceiptSignature;

#[derive(Debug, Clone, Copy, Eq, PartialEq, Error)]
pub enum RepositoryError {
    #[error("message has no receipt signature and can not be tracked")]
    MissingReceipt,
    #[error("a message with signature {0} is already tracked")]
    DuplicateSignature(ReceiptSignature),
    #[error("TTL must be positive")]
    InvalidTtl,
    #[error("no message with signature {0} is tracked")]
    NotFound(ReceiptSignature),
}
