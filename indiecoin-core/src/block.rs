use chrono::Utc;
use serde::{Deserialize, Serialize};
use shared::{leading_zero_bits, sha256, BlockchainError, Result};

use crate::store::Store;
use crate::transaction::{int_bool, Transaction, REWARD};

/// Preimage canônica de hashing: o bloco sem o campo `hash`, com o
/// `block_hash` de cada transação em branco (ele só é atribuído na
/// gravação, depois que o hash do bloco existe).
#[derive(Serialize)]
struct BlockPreimage<'a> {
    timestamp: i64,
    nonce: u64,
    num_transactions: u32,
    #[serde(with = "int_bool")]
    is_orphan: bool,
    previous_block_hash: &'a str,
    height: u64,
    transactions: &'a [Transaction],
}

/// Bloco IndieCoin: transações seladas por proof-of-work, encadeadas ao
/// bloco anterior pelo hash.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    /// SHA-256 (hex) da serialização canônica, sem o próprio `hash`
    pub hash: String,
    pub timestamp: i64,
    pub nonce: u64,
    pub num_transactions: u32,
    #[serde(with = "int_bool")]
    pub is_orphan: bool,
    pub previous_block_hash: String,
    /// 1 para o bloco gênese, estritamente crescente dali em diante
    pub height: u64,
    pub transactions: Vec<Transaction>,
}

impl Block {
    /// Monta um bloco candidato sobre a ponta atual da cadeia.
    ///
    /// O nonce começa em zero; o minerador o reescreve a cada tentativa.
    ///
    /// # Errors
    ///
    /// Retorna erro se a serialização canônica falhar
    pub fn build(
        previous_block_hash: String,
        height: u64,
        transactions: Vec<Transaction>,
    ) -> Result<Self> {
        let mut block = Self {
            hash: String::new(),
            timestamp: Utc::now().timestamp(),
            nonce: 0,
            num_transactions: transactions.len() as u32,
            is_orphan: false,
            previous_block_hash,
            height,
            transactions,
        };
        block.ensure_hash()?;
        Ok(block)
    }

    /// Desserializa um bloco do JSON de rede, completando hashes de
    /// transações e do próprio bloco quando vierem vazios.
    ///
    /// # Errors
    ///
    /// Retorna erro se o JSON for malformado
    pub fn from_json(json: &str) -> Result<Self> {
        let mut block: Self = serde_json::from_str(json)
            .map_err(|e| BlockchainError::SerializationError(e.to_string()))?;

        for transaction in &mut block.transactions {
            transaction.ensure_hash()?;
        }
        block.ensure_hash()?;
        Ok(block)
    }

    /// Serializa para o JSON de rede.
    ///
    /// # Errors
    ///
    /// Retorna erro se a serialização falhar
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self).map_err(|e| BlockchainError::SerializationError(e.to_string()))
    }

    /// Calcula o hash canônico do bloco
    ///
    /// # Errors
    ///
    /// Retorna erro se a serialização da preimage falhar
    pub fn compute_hash(&self) -> Result<String> {
        // As transações entram na preimage com block_hash em branco
        let transactions: Vec<Transaction> = self
            .transactions
            .iter()
            .cloned()
            .map(|mut tx| {
                tx.block_hash.clear();
                tx
            })
            .collect();

        let preimage = BlockPreimage {
            timestamp: self.timestamp,
            nonce: self.nonce,
            num_transactions: self.num_transactions,
            is_orphan: self.is_orphan,
            previous_block_hash: &self.previous_block_hash,
            height: self.height,
            transactions: &transactions,
        };

        let serialized = serde_json::to_string(&preimage)
            .map_err(|e| BlockchainError::SerializationError(e.to_string()))?;
        Ok(sha256(serialized.as_bytes()))
    }

    /// Preenche `hash` quando o valor presente não é um digest de 64 chars
    ///
    /// # Errors
    ///
    /// Retorna erro se o cálculo do hash falhar
    pub fn ensure_hash(&mut self) -> Result<()> {
        if self.hash.len() != 64 {
            self.hash = self.compute_hash()?;
        }
        Ok(())
    }

    /// Confere se o hash do bloco fica abaixo do alvo de dificuldade
    /// (`bits` bits zero iniciais)
    #[must_use]
    pub fn meets_difficulty(&self, bits: u32) -> bool {
        leading_zero_bits(&self.hash) >= bits
    }

    /// Valida o bloco contra o estado atual do store.
    ///
    /// Exige hash íntegro, contagem de transações correta, exatamente uma
    /// coinbase com output limitado a `REWARD` mais as taxas do bloco,
    /// cada transação válida e, acima do gênese, um pai na altura
    /// imediatamente anterior. O proof-of-work é conferido à parte, na
    /// admissão (`meets_difficulty`).
    ///
    /// # Errors
    ///
    /// Retorna `InvalidBlock` ou o erro da primeira transação inválida
    pub fn validate(&self, store: &Store) -> Result<()> {
        if self.compute_hash()? != self.hash {
            return Err(BlockchainError::InvalidBlock(
                "hash does not match block contents".to_string(),
            ));
        }

        if self.num_transactions as usize != self.transactions.len() {
            return Err(BlockchainError::InvalidBlock(
                "num_transactions does not match transaction list".to_string(),
            ));
        }

        let coinbase_count = self
            .transactions
            .iter()
            .filter(|tx| tx.is_coinbase)
            .count();
        if coinbase_count != 1 {
            return Err(BlockchainError::InvalidBlock(format!(
                "expected exactly one coinbase transaction, found {coinbase_count}"
            )));
        }

        let mut total_fees = 0u64;
        for transaction in &self.transactions {
            transaction.validate(store)?;

            if !transaction.is_coinbase {
                total_fees = total_fees
                    .checked_add(transaction.miner_fee(store)?)
                    .ok_or_else(|| BlockchainError::InvalidBlock("fee overflow".to_string()))?;
            }
        }

        // A coinbase pode pagar no máximo a recompensa mais as taxas
        let coinbase = self
            .transactions
            .iter()
            .find(|tx| tx.is_coinbase)
            .expect("coinbase presence checked above");
        if coinbase.output_sum()? > REWARD + total_fees {
            return Err(BlockchainError::InvalidBlock(
                "coinbase output exceeds reward plus fees".to_string(),
            ));
        }

        if self.height > 1 {
            let parent = store
                .get_block_by_hash(&self.previous_block_hash)?
                .ok_or_else(|| {
                    BlockchainError::InvalidBlock(format!(
                        "previous block {} not found",
                        self.previous_block_hash
                    ))
                })?;

            if parent.height != self.height - 1 {
                return Err(BlockchainError::InvalidBlock(format!(
                    "height {} does not follow parent at {}",
                    self.height, parent.height
                )));
            }
        }

        Ok(())
    }

    /// Persiste o bloco: grava a linha do bloco e, em seguida, cada
    /// transação carregando o hash do bloco dono.
    ///
    /// Retorna `None` quando um bloco com este hash já existia.
    ///
    /// # Errors
    ///
    /// Retorna erro se alguma escrita no store falhar
    pub fn save(&self, store: &Store) -> Result<Option<i64>> {
        let Some(block_id) = store.save_block(self)? else {
            return Ok(None);
        };

        for transaction in &self.transactions {
            let mut owned = transaction.clone();
            owned.block_hash = self.hash.clone();
            store.save_transaction(&owned)?;
        }

        Ok(Some(block_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::genesis;
    use crate::transaction::{TxInput, TxOutput};
    use shared::Address;

    fn second_block() -> Block {
        let coinbase = &genesis().block.transactions[0];
        let address = Address::from_private(&genesis().coinbase_private_key).unwrap();
        let signature = address.sign(coinbase.hash.as_bytes()).unwrap();
        let owner = genesis().coinbase_public_key.clone();

        let spend = Transaction::build(
            vec![TxInput::new(signature, coinbase.hash.clone(), 0)],
            vec![
                TxOutput::new(25, owner.clone()),
                TxOutput::new(25, owner.clone()),
            ],
        )
        .unwrap();

        let reward = Transaction::coinbase(REWARD, owner).unwrap();

        Block::build(genesis().block.hash.clone(), 2, vec![spend, reward]).unwrap()
    }

    #[test]
    fn test_genesis_block_hash_round_trip() {
        let block = &genesis().block;
        assert_eq!(block.compute_hash().unwrap(), block.hash);
    }

    #[test]
    fn test_wire_json_round_trip() {
        let block = &genesis().block;
        let parsed = Block::from_json(&block.to_json().unwrap()).unwrap();

        assert_eq!(&parsed, block);
    }

    #[test]
    fn test_second_block_is_valid() {
        let store = Store::open_in_memory().unwrap();
        let block = second_block();

        block.validate(&store).unwrap();
    }

    #[test]
    fn test_two_coinbases_are_rejected() {
        let store = Store::open_in_memory().unwrap();
        let mut block = second_block();

        let extra = Transaction::coinbase(REWARD, genesis().coinbase_public_key.clone()).unwrap();
        block.transactions.push(extra);
        block.num_transactions += 1;
        block.hash.clear();
        block.ensure_hash().unwrap();

        assert!(matches!(
            block.validate(&store),
            Err(BlockchainError::InvalidBlock(_))
        ));
    }

    #[test]
    fn test_tampered_content_fails_hash_check() {
        let store = Store::open_in_memory().unwrap();
        let mut block = second_block();
        block.nonce += 1;

        assert!(matches!(
            block.validate(&store),
            Err(BlockchainError::InvalidBlock(_))
        ));
    }

    #[test]
    fn test_missing_parent_is_rejected() {
        let store = Store::open_in_memory().unwrap();
        let mut block = second_block();
        block.previous_block_hash = "ff".repeat(32);
        block.hash.clear();
        block.ensure_hash().unwrap();

        assert!(matches!(
            block.validate(&store),
            Err(BlockchainError::InvalidBlock(_))
        ));
    }

    #[test]
    fn test_greedy_coinbase_is_rejected() {
        let store = Store::open_in_memory().unwrap();
        let mut block = second_block();

        // Coinbase pagando mais que recompensa + taxas (taxas = 0)
        block.transactions.retain(|tx| !tx.is_coinbase);
        let greedy =
            Transaction::coinbase(REWARD + 1, genesis().coinbase_public_key.clone()).unwrap();
        block.transactions.push(greedy);
        block.hash.clear();
        block.ensure_hash().unwrap();

        assert!(matches!(
            block.validate(&store),
            Err(BlockchainError::InvalidBlock(_))
        ));
    }

    #[test]
    fn test_difficulty_check() {
        let mut block = genesis().block.clone();

        block.hash = format!("0000000f{}", "ff".repeat(28));
        assert!(block.meets_difficulty(25));
        assert!(!block.meets_difficulty(30));

        block.hash = "ff".repeat(32);
        assert!(!block.meets_difficulty(1));
        assert!(block.meets_difficulty(0));
    }

    #[test]
    fn test_save_and_reload() {
        let store = Store::open_in_memory().unwrap();
        let block = second_block();

        block.save(&store).unwrap().unwrap();

        let reloaded = store.get_block_by_hash(&block.hash).unwrap().unwrap();
        assert_eq!(reloaded.height, 2);
        assert_eq!(reloaded.transactions.len(), 2);
        // Transações recarregadas apontam para o bloco dono
        assert!(reloaded
            .transactions
            .iter()
            .all(|tx| tx.block_hash == block.hash));

        // Segunda gravação é um no-op
        assert!(block.save(&store).unwrap().is_none());
    }
}
