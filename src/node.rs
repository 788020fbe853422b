//! Protocolo IndieCoin por cima do framework de peers: consultas de
//! bloco e altura, relay de transações e blocos, catch-up de bootstrap e
//! o religamento do minerador quando a cadeia ou o mempool mudam.

use std::sync::{Arc, Mutex};

use indiecoin_core::{Block, BlockChain, Miner, Store, Transaction};
use shared::Result;
use tracing::{debug, error, info, warn};

use crate::network::{Peer, PeerConnection};
use crate::protocol::{self, Response};

/// Nó IndieCoin: estado da moeda pendurado nos handlers do peer
pub struct Node {
    peer: Arc<Peer>,
    store: Arc<Store>,
    chain: BlockChain,
    /// Transações validadas aguardando mineração
    mempool: Mutex<Vec<Transaction>>,
    miner: Mutex<Option<Miner>>,
    difficulty_bits: u32,
}

impl Node {
    /// Cria o nó, registra os handlers da moeda e o roteador de peers
    #[must_use]
    pub fn new(peer: Arc<Peer>, store: Arc<Store>, difficulty_bits: u32) -> Arc<Self> {
        let node = Arc::new(Self {
            chain: BlockChain::new(Arc::clone(&store)),
            peer: Arc::clone(&peer),
            store,
            mempool: Mutex::new(Vec::new()),
            miner: Mutex::new(None),
            difficulty_bits,
        });

        node.install_handlers();

        let table = Arc::clone(&peer);
        peer.add_router(move |peer_id| table.get_peer(peer_id));

        node
    }

    /// Pendura um minerador no nó; os handlers de relay passam a
    /// interrompê-lo e religá-lo
    pub fn set_miner(&self, miner: Miner) {
        *self.miner.lock().unwrap() = Some(miner);
    }

    /// Cópia do mempool atual
    #[must_use]
    pub fn mempool_snapshot(&self) -> Vec<Transaction> {
        self.mempool.lock().unwrap().clone()
    }

    fn install_handlers(self: &Arc<Self>) {
        let node = Arc::clone(self);
        self.peer
            .add_handler(protocol::MAX_BLOCK_HEIGHT, move |conn, _data| {
                node.handle_max_height(conn);
            });

        let node = Arc::clone(self);
        self.peer.add_handler(protocol::BLOCK_GET, move |conn, data| {
            node.handle_block_get(conn, data);
        });

        let node = Arc::clone(self);
        self.peer
            .add_handler(protocol::BLOCK_HEIGHT, move |conn, data| {
                node.handle_block_get(conn, data);
            });

        let node = Arc::clone(self);
        self.peer
            .add_handler(protocol::RELAY_TRANSACTION, move |conn, data| {
                node.handle_relay_transaction(conn, data);
            });

        let node = Arc::clone(self);
        self.peer
            .add_handler(protocol::RELAY_BLOCK, move |conn, data| {
                node.handle_relay_block(conn, data);
            });
    }

    /// `MAXH`: altura atual em texto decimal
    fn handle_max_height(&self, connection: &mut PeerConnection) {
        match self.chain.get_height() {
            Ok(height) => {
                let _ = connection.send_data(protocol::REPLY, &height.to_string());
            }
            Err(error) => {
                error!(%error, "failed to read chain height");
                let _ = connection.send_data(protocol::ERROR, "Block not found");
            }
        }
    }

    /// `BLKG`/`BLKH`: 64 caracteres hexadecimais pedem por hash, qualquer
    /// outra coisa é altura decimal
    fn handle_block_get(&self, connection: &mut PeerConnection, data: &str) {
        let block_id = data.trim();

        let lookup = if block_id.len() == 64 {
            self.chain.get_block(block_id)
        } else {
            match block_id.parse::<u64>() {
                Ok(height) => self.chain.get_block_by_height(height),
                Err(_) => Ok(None),
            }
        };

        match lookup {
            Ok(Some(block)) => match block.to_json() {
                Ok(json) => {
                    let _ = connection.send_data(protocol::REPLY, &json);
                }
                Err(error) => {
                    error!(%error, "failed to serialize block");
                    let _ = connection.send_data(protocol::ERROR, "Block not found");
                }
            },
            Ok(None) => {
                let _ = connection.send_data(protocol::ERROR, "Block not found");
            }
            Err(error) => {
                error!(%error, "block lookup failed");
                let _ = connection.send_data(protocol::ERROR, "Block not found");
            }
        }
    }

    /// `RTXN`: valida, entra no mempool se inédita e repassa aos peers
    fn handle_relay_transaction(&self, connection: &mut PeerConnection, data: &str) {
        let transaction = match Transaction::from_json(data) {
            Ok(transaction) => transaction,
            Err(error) => {
                warn!(%error, "dropping malformed relayed transaction");
                return;
            }
        };

        if let Err(error) = transaction.validate(&self.store) {
            warn!(%error, hash = %transaction.hash, "dropping invalid relayed transaction");
            return;
        }

        {
            let mut mempool = self.mempool.lock().unwrap();

            if mempool.iter().any(|tx| tx.hash == transaction.hash) {
                return;
            }
            match self.store.contains_transaction(&transaction.hash) {
                Ok(true) => return,
                Ok(false) => {}
                Err(error) => {
                    error!(%error, "mempool admission check failed");
                    return;
                }
            }

            info!(hash = %transaction.hash, "transaction queued for mining");
            mempool.push(transaction);
        }

        self.forward_to_peers(
            protocol::RELAY_TRANSACTION,
            data,
            Some(connection.remote_ip()),
        );

        // O mempool mudou: o minerador recomeça com um candidato novo
        self.restart_miner();
    }

    /// `RBLK`: admite um bloco desconhecido, limpa o mempool das suas
    /// transações e repassa aos peers
    fn handle_relay_block(&self, connection: &mut PeerConnection, data: &str) {
        let block = match Block::from_json(data) {
            Ok(block) => block,
            Err(error) => {
                warn!(%error, "dropping malformed relayed block");
                return;
            }
        };

        match self.store.contains_block(&block.hash) {
            // Bloco conhecido: nada a fazer, nenhum repasse
            Ok(true) => return,
            Ok(false) => {}
            Err(error) => {
                error!(%error, "block admission check failed");
                return;
            }
        }

        if let Err(error) = self.admit_block(&block) {
            warn!(%error, hash = %block.hash, "dropping relayed block");
            return;
        }

        if let Some(miner) = self.miner.lock().unwrap().clone() {
            miner.interrupt();
        }

        match block.save(&self.store) {
            Ok(Some(_)) => {}
            // Outra conexão persistiu o mesmo bloco primeiro
            Ok(None) => return,
            Err(error) => {
                error!(%error, hash = %block.hash, "failed to persist relayed block");
                return;
            }
        }

        info!(hash = %block.hash, height = block.height, "block accepted from peer");

        self.purge_mempool(&block);
        self.forward_to_peers(protocol::RELAY_BLOCK, data, Some(connection.remote_ip()));
        self.restart_miner();
    }

    /// Admissão: proof-of-work e validade contra o estado local
    fn admit_block(&self, block: &Block) -> Result<()> {
        if !block.meets_difficulty(self.difficulty_bits) {
            return Err(shared::BlockchainError::InvalidBlock(
                "insufficient proof-of-work".to_string(),
            ));
        }
        block.validate(&self.store)
    }

    /// Persiste e difunde um bloco produzido pelo minerador local
    pub fn accept_mined_block(&self, block: Block) {
        if let Err(error) = self.admit_block(&block) {
            error!(%error, hash = %block.hash, "locally mined block failed admission");
            self.restart_miner();
            return;
        }

        match block.save(&self.store) {
            Ok(Some(_)) => {
                info!(hash = %block.hash, height = block.height, "mined block persisted");
            }
            Ok(None) => {
                debug!(hash = %block.hash, "mined block already known");
                self.restart_miner();
                return;
            }
            Err(error) => {
                error!(%error, "failed to persist mined block");
                self.restart_miner();
                return;
            }
        }

        self.purge_mempool(&block);

        match block.to_json() {
            Ok(json) => self.forward_to_peers(protocol::RELAY_BLOCK, &json, None),
            Err(error) => error!(%error, "failed to serialize mined block for relay"),
        }

        self.restart_miner();
    }

    /// Remove do mempool as transações presentes no bloco aceito
    fn purge_mempool(&self, block: &Block) {
        let mut mempool = self.mempool.lock().unwrap();
        mempool.retain(|tx| !block.transactions.iter().any(|mined| mined.hash == tx.hash));
    }

    /// Entrega ao minerador um candidato fresco sobre a ponta atual e o
    /// religa caso estivesse interrompido
    pub fn restart_miner(&self) {
        let Some(miner) = self.miner.lock().unwrap().clone() else {
            return;
        };

        let snapshot = self.mempool_snapshot();
        match miner.build_candidate(&self.store, &snapshot) {
            Ok(candidate) => {
                miner.set_block(candidate);
                miner.resume();
            }
            Err(error) => error!(%error, "failed to assemble mining candidate"),
        }
    }

    /// Catch-up de bootstrap: pergunta a altura a cada peer inicial e
    /// baixa, do mais alto, os blocos que faltam. Falhas num bloco são
    /// logadas e o catch-up continua.
    pub fn bootstrap(&self) {
        info!("bootstrap in progress");

        let local_height = match self.chain.get_height() {
            Ok(height) => height,
            Err(error) => {
                error!(%error, "cannot bootstrap without local height");
                return;
            }
        };

        let mut best: Option<(String, u64)> = None;
        for peer_id in self.peer.peer_ids() {
            let response = self.request(&peer_id, protocol::MAX_BLOCK_HEIGHT, "");
            if !response.is_successful() {
                warn!(peer_id = %peer_id, "peer did not answer height probe");
                continue;
            }

            let Ok(height) = response.text.trim().parse::<u64>() else {
                warn!(peer_id = %peer_id, text = %response.text, "unparseable height reply");
                continue;
            };

            if height > local_height && best.as_ref().map_or(true, |(_, best)| height > *best) {
                best = Some((peer_id, height));
            }
        }

        let Some((peer_id, target_height)) = best else {
            info!("no peer ahead of local chain");
            return;
        };

        info!(peer_id = %peer_id, target_height, local_height, "updating blockchain");

        for height in (local_height + 1)..=target_height {
            let response = self.request(&peer_id, protocol::BLOCK_HEIGHT, &height.to_string());
            if !response.is_successful() {
                warn!(height, text = %response.text, "peer could not serve block");
                continue;
            }

            let block = match Block::from_json(&response.text) {
                Ok(block) => block,
                Err(error) => {
                    warn!(%error, height, "malformed block during catch-up");
                    continue;
                }
            };

            if let Err(error) = self.admit_block(&block) {
                warn!(%error, height, "rejecting block during catch-up");
                continue;
            }

            if let Err(error) = block.save(&self.store) {
                error!(%error, height, "failed to persist block during catch-up");
                continue;
            }

            self.purge_mempool(&block);
        }

        info!("bootstrap done");
    }

    /// Requisição com resposta a um peer da tabela; falhas viram uma
    /// resposta `ERRO` local
    fn request(&self, peer_id: &str, msg_type: &str, payload: &str) -> Response {
        match self.peer.send_to_peer(peer_id, msg_type, payload, true) {
            Ok(mut responses) if !responses.is_empty() => responses.remove(0),
            Ok(_) => Response::error(format!("no response from {peer_id}")),
            Err(error) => {
                debug!(%error, peer_id = %peer_id, "request failed");
                Response::error(error.to_string())
            }
        }
    }

    /// Difusão fire-and-forget a todos os peers, menos o remetente
    /// (identificado pelo IP de origem, melhor esforço)
    fn forward_to_peers(&self, msg_type: &str, payload: &str, exclude_ip: Option<&str>) {
        for peer_id in self.peer.peer_ids() {
            if let (Some(exclude), Some((host, _))) = (exclude_ip, self.peer.get_peer(&peer_id)) {
                if host == exclude {
                    continue;
                }
            }

            if let Err(error) = self.peer.send_to_peer(peer_id.as_str(), msg_type, payload, false)
            {
                debug!(%error, peer_id = %peer_id, "relay skipped unreachable peer");
            }
        }
    }

    /// Encerramento: drena o listener, sinaliza o minerador; o store
    /// fecha quando o último handle cai
    pub fn shutdown(&self) {
        self.peer.shutdown();
        if let Some(miner) = self.miner.lock().unwrap().clone() {
            miner.shutdown();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use indiecoin_core::{genesis, TxInput, TxOutput, REWARD};
    use shared::Address;
    use std::thread;
    use std::time::{Duration, Instant};

    /// Nó de teste com store em memória e dificuldade zero
    fn started_node() -> (Arc<Node>, Arc<Peer>, u16) {
        let peer = Peer::new("127.0.0.1", 0, 8);
        let store = Arc::new(Store::open_in_memory().unwrap());
        let node = Node::new(Arc::clone(&peer), store, 0);
        peer.start().unwrap();
        (node, Arc::clone(&peer), peer.listen_port())
    }

    fn request(port: u16, msg_type: &str, payload: &str) -> Vec<Response> {
        let client = Peer::new("127.0.0.1", 0, 1);
        client
            .connect_and_send("127.0.0.1", port, msg_type, payload, true)
            .unwrap()
    }

    fn notify(port: u16, msg_type: &str, payload: &str) {
        let client = Peer::new("127.0.0.1", 0, 1);
        client
            .connect_and_send("127.0.0.1", port, msg_type, payload, false)
            .unwrap();
    }

    fn spend_of_genesis(store: &Store, amount: u64) -> Transaction {
        let coinbase = &genesis().block.transactions[0];
        let address = Address::from_private(&genesis().coinbase_private_key).unwrap();
        let signature = address.sign(coinbase.hash.as_bytes()).unwrap();

        let transaction = Transaction::build(
            vec![TxInput::new(signature, coinbase.hash.clone(), 0)],
            vec![TxOutput::new(amount, genesis().coinbase_public_key.clone())],
        )
        .unwrap();
        transaction.validate(store).unwrap();
        transaction
    }

    fn second_block(transactions: Vec<Transaction>) -> Block {
        let mut all = transactions;
        all.push(Transaction::coinbase(REWARD, genesis().coinbase_public_key.clone()).unwrap());
        Block::build(genesis().block.hash.clone(), 2, all).unwrap()
    }

    fn wait_until(what: &str, condition: impl Fn() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(10);
        while !condition() {
            assert!(Instant::now() < deadline, "timed out waiting for {what}");
            thread::sleep(Duration::from_millis(20));
        }
    }

    #[test]
    fn test_max_height_query() {
        let (_node, peer, port) = started_node();

        let responses = request(port, protocol::MAX_BLOCK_HEIGHT, "");
        assert_eq!(responses[0].text, "1");

        peer.shutdown();
    }

    #[test]
    fn test_block_get_by_hash_and_height() {
        let (_node, peer, port) = started_node();

        let by_hash = request(port, protocol::BLOCK_GET, &genesis().block.hash);
        assert!(by_hash[0].is_successful());
        let block = Block::from_json(&by_hash[0].text).unwrap();
        assert_eq!(block.hash, genesis().block.hash);

        let by_height = request(port, protocol::BLOCK_HEIGHT, "1");
        assert!(by_height[0].is_successful());
        assert_eq!(Block::from_json(&by_height[0].text).unwrap().height, 1);

        let missing = request(port, protocol::BLOCK_GET, &"ab".repeat(32));
        assert!(!missing[0].is_successful());
        assert_eq!(missing[0].text, "Block not found");

        let missing = request(port, protocol::BLOCK_HEIGHT, "42");
        assert!(!missing[0].is_successful());

        peer.shutdown();
    }

    #[test]
    fn test_relay_transaction_enters_mempool_once() {
        let (node, peer, port) = started_node();
        let transaction = spend_of_genesis(&node.store, 50);
        let json = transaction.to_json().unwrap();

        notify(port, protocol::RELAY_TRANSACTION, &json);
        wait_until("transaction in mempool", || {
            node.mempool_snapshot().len() == 1
        });

        // Reenvio é descartado em silêncio
        notify(port, protocol::RELAY_TRANSACTION, &json);
        thread::sleep(Duration::from_millis(100));
        assert_eq!(node.mempool_snapshot().len(), 1);

        peer.shutdown();
    }

    #[test]
    fn test_malformed_and_invalid_transactions_are_dropped() {
        let (node, peer, port) = started_node();

        notify(port, protocol::RELAY_TRANSACTION, "not json at all");

        // Assinatura de outra chave: inválida contra o dono do output
        let intruder = Address::generate();
        let coinbase = &genesis().block.transactions[0];
        let signature = intruder.sign(coinbase.hash.as_bytes()).unwrap();
        let forged = Transaction::build(
            vec![TxInput::new(signature, coinbase.hash.clone(), 0)],
            vec![TxOutput::new(50, intruder.public_key())],
        )
        .unwrap();
        notify(port, protocol::RELAY_TRANSACTION, &forged.to_json().unwrap());

        thread::sleep(Duration::from_millis(200));
        assert!(node.mempool_snapshot().is_empty());

        peer.shutdown();
    }

    #[test]
    fn test_relay_block_persists_and_purges_mempool() {
        let (node, peer, port) = started_node();

        let transaction = spend_of_genesis(&node.store, 50);
        notify(
            port,
            protocol::RELAY_TRANSACTION,
            &transaction.to_json().unwrap(),
        );
        wait_until("transaction in mempool", || {
            node.mempool_snapshot().len() == 1
        });

        let block = second_block(vec![transaction]);
        notify(port, protocol::RELAY_BLOCK, &block.to_json().unwrap());
        wait_until("block persisted", || {
            node.store.height().unwrap() == 2
        });

        // Transações mineradas saem do mempool
        assert!(node.mempool_snapshot().is_empty());

        // Reenvio do mesmo bloco não muda nada
        notify(port, protocol::RELAY_BLOCK, &block.to_json().unwrap());
        thread::sleep(Duration::from_millis(100));
        assert_eq!(node.store.height().unwrap(), 2);

        peer.shutdown();
    }

    #[test]
    fn test_tampered_block_is_rejected() {
        let (node, peer, port) = started_node();

        let mut block = second_block(vec![]);
        block.height = 3;

        notify(port, protocol::RELAY_BLOCK, &block.to_json().unwrap());
        thread::sleep(Duration::from_millis(200));
        assert_eq!(node.store.height().unwrap(), 1);

        peer.shutdown();
    }

    #[test]
    fn test_bootstrap_catches_up_to_tallest_peer() {
        // Nó A com a cadeia em 3
        let (node_a, peer_a, port_a) = started_node();
        let block2 = second_block(vec![]);
        block2.save(&node_a.store).unwrap().unwrap();
        // Coinbase para um endereço próprio, para não colidir com a do bloco 2
        let coinbase =
            Transaction::coinbase(REWARD, Address::generate().public_key()).unwrap();
        let block3 = Block::build(block2.hash.clone(), 3, vec![coinbase]).unwrap();
        block3.save(&node_a.store).unwrap().unwrap();
        assert_eq!(node_a.store.height().unwrap(), 3);

        // Nó B novo alcança A
        let (node_b, peer_b, _port_b) = started_node();
        peer_b.add_peer(&format!("127.0.0.1:{port_a}"), "127.0.0.1", port_a);

        node_b.bootstrap();

        assert_eq!(node_b.store.height().unwrap(), 3);
        for height in 1..=3 {
            let ours = node_b.store.get_block_by_height(height).unwrap().unwrap();
            let theirs = node_a.store.get_block_by_height(height).unwrap().unwrap();
            assert_eq!(ours.hash, theirs.hash);
        }

        peer_a.shutdown();
        peer_b.shutdown();
    }

    #[test]
    fn test_bootstrap_survives_unreachable_peer() {
        let (node, peer, _port) = started_node();
        peer.add_peer("ghost:1", "127.0.0.1", 1);

        // Nenhum peer responde: o nó segue com o estado local
        node.bootstrap();
        assert_eq!(node.store.height().unwrap(), 1);

        peer.shutdown();
    }

    #[test]
    fn test_relay_block_forwards_to_other_peers() {
        // A conhece B; B não conhece ninguém. Um bloco entregue a A deve
        // chegar a B pelo repasse.
        let (node_a, peer_a, port_a) = started_node();
        let (node_b, peer_b, port_b) = started_node();

        // Host "localhost" difere do IP do remetente, então não é excluído
        peer_a.add_peer(&format!("localhost:{port_b}"), "localhost", port_b);

        let block = second_block(vec![]);
        notify(port_a, protocol::RELAY_BLOCK, &block.to_json().unwrap());

        wait_until("block reaches A", || node_a.store.height().unwrap() == 2);
        wait_until("block forwarded to B", || {
            node_b.store.height().unwrap() == 2
        });

        peer_a.shutdown();
        peer_b.shutdown();
    }
}
