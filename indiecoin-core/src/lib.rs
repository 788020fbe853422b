pub mod block;
pub mod chain;
pub mod miner;
pub mod store;
pub mod transaction;

// Re-exports principais
pub use block::Block;
pub use chain::BlockChain;
pub use miner::{Miner, MinerState, DIFFICULTY_BITS};
pub use store::{default_data_directory, genesis, Genesis, Store};
pub use transaction::{Transaction, TxInput, TxOutput, REWARD};

// Re-exports de tipos compartilhados
pub use shared::{BlockchainError, Result};
