//! Busca de proof-of-work de bloco único, interrompível e reiniciável.
//!
//! O minerador roda numa thread própria e conversa com o nó por uma
//! máquina de estados guardada por mutex, acordada por condvar. A
//! interrupção é uma flag atômica observada entre nonces.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};

use shared::{Address, BlockchainError, Result};
use tracing::{error, info};

use crate::block::Block;
use crate::store::Store;
use crate::transaction::{Transaction, REWARD};

/// Alvo de dificuldade: bits zero iniciais exigidos do hash de um bloco
/// (equivalente a `hash < 2^(256-25)`)
pub const DIFFICULTY_BITS: u32 = 25;

/// Estados do minerador
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MinerState {
    /// Aguardando um candidato
    Idle,
    /// Iterando nonces sobre o candidato atual
    Searching,
    /// Nonce satisfazendo a dificuldade encontrado
    Found,
    /// Interrompido; espera `resume` e um candidato novo
    Interrupted,
    /// Terminal
    Shutdown,
}

struct MinerInner {
    state: MinerState,
    candidate: Option<Block>,
}

struct MinerShared {
    inner: Mutex<MinerInner>,
    wake: Condvar,
    interrupt: AtomicBool,
}

/// Handle clonável do minerador: o nó controla a busca pelos setters
/// enquanto `run` ocupa a thread de mineração.
#[derive(Clone)]
pub struct Miner {
    shared: Arc<MinerShared>,
    address: Address,
    difficulty_bits: u32,
}

impl Miner {
    /// Cria um minerador pagando recompensas ao endereço informado
    #[must_use]
    pub fn new(address: Address) -> Self {
        Self::with_difficulty(address, DIFFICULTY_BITS)
    }

    /// Cria um minerador com alvo de dificuldade próprio (redes de teste)
    #[must_use]
    pub fn with_difficulty(address: Address, difficulty_bits: u32) -> Self {
        Self {
            shared: Arc::new(MinerShared {
                inner: Mutex::new(MinerInner {
                    state: MinerState::Idle,
                    candidate: None,
                }),
                wake: Condvar::new(),
                interrupt: AtomicBool::new(false),
            }),
            address,
            difficulty_bits,
        }
    }

    /// Estado atual da máquina
    #[must_use]
    pub fn state(&self) -> MinerState {
        self.shared.inner.lock().unwrap().state
    }

    /// Alvo de dificuldade deste minerador
    #[must_use]
    pub const fn difficulty_bits(&self) -> u32 {
        self.difficulty_bits
    }

    /// Entrega um candidato novo para a busca
    pub fn set_block(&self, candidate: Block) {
        let mut inner = self.shared.inner.lock().unwrap();
        inner.candidate = Some(candidate);
        self.shared.wake.notify_all();
    }

    /// Interrompe a busca atual; o candidato em mãos é descartado
    pub fn interrupt(&self) {
        self.shared.interrupt.store(true, Ordering::SeqCst);

        let mut inner = self.shared.inner.lock().unwrap();
        if matches!(inner.state, MinerState::Searching | MinerState::Found) {
            inner.state = MinerState::Interrupted;
            inner.candidate = None;
        }
        self.shared.wake.notify_all();
    }

    /// Libera um minerador interrompido para buscar de novo assim que um
    /// candidato for entregue
    pub fn resume(&self) {
        let mut inner = self.shared.inner.lock().unwrap();
        if inner.state == MinerState::Interrupted {
            inner.state = MinerState::Idle;
        }
        self.shared.interrupt.store(false, Ordering::SeqCst);
        self.shared.wake.notify_all();
    }

    /// Encerra o minerador; terminal a partir de qualquer estado
    pub fn shutdown(&self) {
        let mut inner = self.shared.inner.lock().unwrap();
        inner.state = MinerState::Shutdown;
        inner.candidate = None;
        self.shared.interrupt.store(true, Ordering::SeqCst);
        self.shared.wake.notify_all();
    }

    /// Monta um candidato sobre a ponta atual: remove qualquer coinbase do
    /// snapshot do mempool, soma as taxas restantes e acrescenta uma
    /// coinbase pagando `REWARD` mais as taxas ao endereço minerador.
    ///
    /// # Errors
    ///
    /// Retorna erro se a ponta não resolver ou alguma taxa não calcular
    pub fn build_candidate(&self, store: &Store, mempool: &[Transaction]) -> Result<Block> {
        let mut transactions: Vec<Transaction> = mempool
            .iter()
            .filter(|tx| !tx.is_coinbase)
            .cloned()
            .collect();

        let tip_height = store.height()?;
        let tip = store.get_block_by_height(tip_height)?.ok_or_else(|| {
            BlockchainError::NotFound(format!("block at height {tip_height}"))
        })?;

        let mut fees = 0u64;
        for transaction in &transactions {
            fees = fees
                .checked_add(transaction.miner_fee(store)?)
                .ok_or_else(|| BlockchainError::InvalidBlock("fee overflow".to_string()))?;
        }

        let coinbase = Transaction::coinbase(REWARD + fees, self.address.public_key())?;
        transactions.push(coinbase);

        Block::build(tip.hash, tip_height + 1, transactions)
    }

    /// Corpo da thread de mineração. Bloqueia até `shutdown`.
    ///
    /// Cada bloco encontrado é entregue a `on_found`; dali o minerador
    /// fica interrompido até o nó entregar um candidato novo e chamar
    /// `resume`.
    pub fn run<F: Fn(Block)>(&self, on_found: F) {
        loop {
            let Some(candidate) = self.wait_for_candidate() else {
                info!("miner shut down");
                return;
            };

            info!(height = candidate.height, "mining candidate block");

            if let Some(found) = self.search(candidate) {
                // Auto-interrompe antes de entregar: o nó persiste o bloco
                // e religa a busca com resume + candidato novo. Se uma
                // interrupção externa chegou depois do found, o bloco em
                // mãos é descartado.
                let deliver = {
                    let mut inner = self.shared.inner.lock().unwrap();
                    if inner.state == MinerState::Found {
                        inner.state = MinerState::Interrupted;
                        inner.candidate = None;
                        self.shared.interrupt.store(true, Ordering::SeqCst);
                        true
                    } else {
                        false
                    }
                };

                if deliver {
                    info!(hash = %found.hash, nonce = found.nonce, "proof-of-work found");
                    on_found(found);
                }
            }
        }
    }

    /// Espera em Idle até um candidato chegar, devolvendo `None` no
    /// shutdown
    fn wait_for_candidate(&self) -> Option<Block> {
        let mut inner = self.shared.inner.lock().unwrap();
        loop {
            match inner.state {
                MinerState::Shutdown => return None,
                MinerState::Idle => {
                    if let Some(candidate) = inner.candidate.take() {
                        inner.state = MinerState::Searching;
                        self.shared.interrupt.store(false, Ordering::SeqCst);
                        return Some(candidate);
                    }
                }
                _ => {}
            }
            inner = self.shared.wake.wait(inner).unwrap();
        }
    }

    /// Itera nonces até satisfazer a dificuldade ou ser interrompido
    fn search(&self, mut block: Block) -> Option<Block> {
        let mut nonce = 0u64;

        loop {
            // Interrupção observada entre nonces; cooperativa
            if self.shared.interrupt.load(Ordering::SeqCst) {
                return None;
            }

            block.nonce = nonce;
            block.hash = match block.compute_hash() {
                Ok(hash) => hash,
                Err(error) => {
                    error!(%error, "candidate block failed to hash");
                    let mut inner = self.shared.inner.lock().unwrap();
                    if inner.state == MinerState::Searching {
                        inner.state = MinerState::Interrupted;
                        inner.candidate = None;
                    }
                    return None;
                }
            };

            if block.meets_difficulty(self.difficulty_bits) {
                let mut inner = self.shared.inner.lock().unwrap();
                if inner.state != MinerState::Searching {
                    return None;
                }
                inner.state = MinerState::Found;
                return Some(block);
            }

            nonce = nonce.wrapping_add(1);
        }
    }
}
