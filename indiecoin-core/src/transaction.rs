use chrono::Utc;
use serde::{Deserialize, Serialize};
use shared::{sha256, Address, BlockchainError, Result};

use crate::store::Store;

/// Recompensa fixa de mineração por bloco
pub const REWARD: u64 = 5;

/// Serialização de booleanos como inteiros `0|1`, o formato que circula
/// na rede e fica gravado no sqlite.
pub(crate) mod int_bool {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &bool, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u8(u8::from(*value))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<bool, D::Error> {
        Ok(u8::deserialize(deserializer)? != 0)
    }
}

/// Output de transação: um valor preso à chave pública autorizada a gastá-lo
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxOutput {
    pub amount: u64,
    /// Chave pública (hex) de quem pode gastar este output
    pub public_key_owner: String,
    #[serde(with = "int_bool")]
    pub unspent: bool,
}

impl TxOutput {
    #[must_use]
    pub const fn new(amount: u64, public_key_owner: String) -> Self {
        Self {
            amount,
            public_key_owner,
            unspent: true,
        }
    }
}

/// Input de transação: referência a um output anterior mais a assinatura
/// que o destrava.
///
/// O input não carrega valor próprio; quantia e dono são resolvidos no
/// store no momento da validação.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxInput {
    /// Assinatura ECDSA (hex) sobre o hash da transação referenciada
    pub signature: String,
    /// Hash da transação cujo output está sendo gasto
    pub hash_transaction: String,
    /// Índice do output dentro da transação referenciada
    pub prev_out_index: u32,
}

impl TxInput {
    #[must_use]
    pub const fn new(signature: String, hash_transaction: String, prev_out_index: u32) -> Self {
        Self {
            signature,
            hash_transaction,
            prev_out_index,
        }
    }

    /// Resolve o output referenciado por este input.
    ///
    /// # Errors
    ///
    /// Retorna `NotFound` se a transação referenciada não existir ou não
    /// tiver um output nesse índice
    pub fn referenced_output(&self, store: &Store) -> Result<TxOutput> {
        let previous = store.get_transaction(&self.hash_transaction)?.ok_or_else(|| {
            BlockchainError::NotFound(format!("transaction {}", self.hash_transaction))
        })?;

        previous
            .tx_outputs
            .get(self.prev_out_index as usize)
            .cloned()
            .ok_or_else(|| {
                BlockchainError::NotFound(format!(
                    "output {} of transaction {}",
                    self.prev_out_index, self.hash_transaction
                ))
            })
    }

    /// Verifica a assinatura deste input contra o dono do output
    /// referenciado, sobre o hash da transação referenciada.
    ///
    /// # Errors
    ///
    /// Retorna erro se a referência não puder ser resolvida
    pub fn validate_signature(&self, store: &Store) -> Result<bool> {
        let output = self.referenced_output(store)?;
        let owner = Address::from_public(&output.public_key_owner)?;

        Ok(owner.verify_signature(&self.signature, self.hash_transaction.as_bytes()))
    }
}

/// Preimage canônica de hashing: a transação sem `hash` e `block_hash`,
/// na ordem de campos do esquema de rede.
#[derive(Serialize)]
struct TxPreimage<'a> {
    num_inputs: u32,
    num_outputs: u32,
    timestamp: i64,
    #[serde(with = "int_bool")]
    is_coinbase: bool,
    #[serde(with = "int_bool")]
    is_orphan: bool,
    tx_inputs: &'a [TxInput],
    tx_outputs: &'a [TxOutput],
}

/// Transação IndieCoin (coinbase ou regular)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    /// SHA-256 (hex) da serialização canônica, sem `hash` e `block_hash`
    pub hash: String,
    /// Hash do bloco dono; vazio até a transação ser minerada
    pub block_hash: String,
    pub num_inputs: u32,
    pub num_outputs: u32,
    /// Segundos desde a época UNIX
    pub timestamp: i64,
    #[serde(with = "int_bool")]
    pub is_coinbase: bool,
    #[serde(with = "int_bool")]
    pub is_orphan: bool,
    pub tx_inputs: Vec<TxInput>,
    pub tx_outputs: Vec<TxOutput>,
}

impl Transaction {
    /// Monta uma transação regular a partir de inputs e outputs,
    /// calculando o hash canônico.
    ///
    /// A construção não valida; `validate` é uma operação separada.
    ///
    /// # Errors
    ///
    /// Retorna erro se a serialização canônica falhar
    pub fn build(tx_inputs: Vec<TxInput>, tx_outputs: Vec<TxOutput>) -> Result<Self> {
        let mut transaction = Self {
            hash: String::new(),
            block_hash: String::new(),
            num_inputs: tx_inputs.len() as u32,
            num_outputs: tx_outputs.len() as u32,
            timestamp: Utc::now().timestamp(),
            is_coinbase: false,
            is_orphan: false,
            tx_inputs,
            tx_outputs,
        };
        transaction.ensure_hash()?;
        Ok(transaction)
    }

    /// Monta a transação coinbase de um bloco: sem inputs, um único
    /// output pagando `amount` ao endereço minerador.
    ///
    /// # Errors
    ///
    /// Retorna erro se a serialização canônica falhar
    pub fn coinbase(amount: u64, public_key_owner: String) -> Result<Self> {
        let mut transaction = Self {
            hash: String::new(),
            block_hash: String::new(),
            num_inputs: 0,
            num_outputs: 1,
            timestamp: Utc::now().timestamp(),
            is_coinbase: true,
            is_orphan: false,
            tx_inputs: vec![],
            tx_outputs: vec![TxOutput::new(amount, public_key_owner)],
        };
        transaction.ensure_hash()?;
        Ok(transaction)
    }

    /// Desserializa uma transação do JSON de rede, completando o hash
    /// quando ele não veio preenchido.
    ///
    /// # Errors
    ///
    /// Retorna erro se o JSON for malformado
    pub fn from_json(json: &str) -> Result<Self> {
        let mut transaction: Self = serde_json::from_str(json)
            .map_err(|e| BlockchainError::SerializationError(e.to_string()))?;
        transaction.ensure_hash()?;
        Ok(transaction)
    }

    /// Serializa para o JSON de rede.
    ///
    /// # Errors
    ///
    /// Retorna erro se a serialização falhar
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self).map_err(|e| BlockchainError::SerializationError(e.to_string()))
    }

    /// Calcula o hash canônico da transação
    ///
    /// # Errors
    ///
    /// Retorna erro se a serialização da preimage falhar
    pub fn compute_hash(&self) -> Result<String> {
        let preimage = TxPreimage {
            num_inputs: self.num_inputs,
            num_outputs: self.num_outputs,
            timestamp: self.timestamp,
            is_coinbase: self.is_coinbase,
            is_orphan: self.is_orphan,
            tx_inputs: &self.tx_inputs,
            tx_outputs: &self.tx_outputs,
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

    /// Soma dos outputs da transação
    ///
    /// # Errors
    ///
    /// Retorna erro em caso de overflow
    pub fn output_sum(&self) -> Result<u64> {
        let mut total = 0u64;
        for output in &self.tx_outputs {
            total = total.checked_add(output.amount).ok_or_else(|| {
                BlockchainError::InvalidTransaction("output amount overflow".to_string())
            })?;
        }
        Ok(total)
    }

    /// Soma dos inputs, resolvendo cada referência no store
    ///
    /// # Errors
    ///
    /// Retorna erro se alguma referência não resolver ou em overflow
    pub fn input_sum(&self, store: &Store) -> Result<u64> {
        let mut total = 0u64;
        for input in &self.tx_inputs {
            let output = input.referenced_output(store)?;
            total = total.checked_add(output.amount).ok_or_else(|| {
                BlockchainError::InvalidTransaction("input amount overflow".to_string())
            })?;
        }
        Ok(total)
    }

    /// Taxa paga ao minerador: soma dos inputs menos soma dos outputs.
    ///
    /// Não é serializada; só interessa na montagem de um candidato.
    ///
    /// # Errors
    ///
    /// Retorna erro se os outputs excederem os inputs
    pub fn miner_fee(&self, store: &Store) -> Result<u64> {
        if self.is_coinbase {
            return Ok(0);
        }

        self.input_sum(store)?
            .checked_sub(self.output_sum()?)
            .ok_or_else(|| {
                BlockchainError::InvalidTransaction("outputs exceed inputs".to_string())
            })
    }

    /// Valida a transação contra o estado atual do store.
    ///
    /// Verifica contagens, resolve cada input para um output ainda não
    /// gasto e confere a assinatura contra o dono desse output. O teto do
    /// output da coinbase é um invariante de bloco, conferido na validação
    /// do bloco onde as taxas são conhecidas.
    ///
    /// # Errors
    ///
    /// Retorna `InvalidTransaction` descrevendo a primeira regra violada
    pub fn validate(&self, store: &Store) -> Result<()> {
        if self.num_inputs as usize != self.tx_inputs.len() {
            return Err(BlockchainError::InvalidTransaction(
                "num_inputs does not match input list".to_string(),
            ));
        }

        if self.num_outputs as usize != self.tx_outputs.len() {
            return Err(BlockchainError::InvalidTransaction(
                "num_outputs does not match output list".to_string(),
            ));
        }

        if self.is_coinbase {
            if self.num_inputs != 0 {
                return Err(BlockchainError::InvalidTransaction(
                    "coinbase transaction cannot have inputs".to_string(),
                ));
            }
            return Ok(());
        }

        if self.num_inputs == 0 {
            return Err(BlockchainError::InvalidTransaction(
                "non-coinbase transaction without inputs".to_string(),
            ));
        }

        for input in &self.tx_inputs {
            let output = input.referenced_output(store)?;

            if !output.unspent {
                return Err(BlockchainError::InvalidTransaction(format!(
                    "output {} of {} already spent",
                    input.prev_out_index, input.hash_transaction
                )));
            }

            if !input.validate_signature(store)? {
                return Err(BlockchainError::InvalidTransaction(format!(
                    "bad signature for output {} of {}",
                    input.prev_out_index, input.hash_transaction
                )));
            }
        }

        if self.input_sum(store)? < self.output_sum()? {
            return Err(BlockchainError::InvalidTransaction(
                "outputs exceed inputs".to_string(),
            ));
        }

        Ok(())
    }
}
