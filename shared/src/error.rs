use thiserror::Error;

/// Erros relacionados ao nó e à blockchain
#[derive(Error, Debug)]
pub enum BlockchainError {
    #[error("Invalid transaction: {0}")]
    InvalidTransaction(String),

    #[error("Invalid block: {0}")]
    InvalidBlock(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("No private key available for signing")]
    NoPrivateKey,

    #[error("Peer unreachable: {0}")]
    PeerUnreachable(String),

    #[error("Store error: {0}")]
    StoreError(String),

    #[error("Serialization error: {0}")]
    SerializationError(String),

    #[error("I/O error: {0}")]
    IoError(String),
}
