pub mod address;
pub mod error;
pub mod hash;

pub use address::Address;
pub use error::BlockchainError;
pub use hash::{leading_zero_bits, sha256, sha256d};

pub type Result<T> = std::result::Result<T, BlockchainError>;
