use std::sync::Arc;

use shared::{BlockchainError, Result};

use crate::block::Block;
use crate::store::Store;

/// Fachada somente-leitura sobre o store para os caminhos de consulta do
/// protocolo. Sem cache: cada chamada vai ao sqlite.
#[derive(Clone)]
pub struct BlockChain {
    store: Arc<Store>,
}

impl BlockChain {
    #[must_use]
    pub fn new(store: Arc<Store>) -> Self {
        Self { store }
    }

    /// Bloco pelo hash
    ///
    /// # Errors
    ///
    /// Retorna erro se a consulta falhar
    pub fn get_block(&self, hash: &str) -> Result<Option<Block>> {
        self.store.get_block_by_hash(hash)
    }

    /// Bloco pela altura
    ///
    /// # Errors
    ///
    /// Retorna erro se a consulta falhar
    pub fn get_block_by_height(&self, height: u64) -> Result<Option<Block>> {
        self.store.get_block_by_height(height)
    }

    /// Altura atual da cadeia local
    ///
    /// # Errors
    ///
    /// Retorna erro se a consulta falhar
    pub fn get_height(&self) -> Result<u64> {
        self.store.height()
    }

    /// Bloco na ponta da cadeia
    ///
    /// # Errors
    ///
    /// Retorna erro se a ponta não puder ser carregada
    pub fn tip(&self) -> Result<Block> {
        let height = self.store.height()?;
        self.store
            .get_block_by_height(height)?
            .ok_or_else(|| BlockchainError::NotFound(format!("block at height {height}")))
    }
}
