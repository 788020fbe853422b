//! Framework P2P genérico sobre TCP: tabela de peers limitada, listener
//! com uma thread por conexão, despacho por tipo de mensagem e chamadas
//! de saída com timeout.
//!
//! Cada conexão de entrada carrega exatamente uma requisição; o handler
//! registrado para o tipo escreve zero ou mais respostas e a conexão é
//! fechada em seguida.

use std::collections::HashMap;
use std::io::Write;
use std::net::{TcpListener, TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, AtomicU16, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::thread;
use std::time::Duration;

use shared::{BlockchainError, Result};
use tracing::{debug, info, warn};

use crate::protocol::{self, Response};

/// Timeout de leitura por conexão, entrada e saída
pub const READ_TIMEOUT: Duration = Duration::from_secs(10);
/// Timeout de conexão de saída
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

type Handler = Arc<dyn Fn(&mut PeerConnection, &str) + Send + Sync>;
type Router = Arc<dyn Fn(&str) -> Option<(String, u16)> + Send + Sync>;

/// Uma conexão enquadrada com outro nó
pub struct PeerConnection {
    stream: TcpStream,
    remote_ip: String,
}

impl PeerConnection {
    fn new(stream: TcpStream) -> std::io::Result<Self> {
        stream.set_read_timeout(Some(READ_TIMEOUT))?;
        stream.set_write_timeout(Some(READ_TIMEOUT))?;
        let remote_ip = stream
            .peer_addr()
            .map(|addr| addr.ip().to_string())
            .unwrap_or_default();

        Ok(Self { stream, remote_ip })
    }

    /// Endereço IP da outra ponta
    #[must_use]
    pub fn remote_ip(&self) -> &str {
        &self.remote_ip
    }

    /// Escreve um quadro na conexão.
    ///
    /// # Errors
    ///
    /// Retorna erro se a escrita falhar
    pub fn send_data(&mut self, msg_type: &str, payload: &str) -> Result<()> {
        protocol::write_message(&mut self.stream, msg_type, payload)
    }

    /// Lê o próximo quadro; `None` quando a outra ponta fechou.
    ///
    /// # Errors
    ///
    /// Retorna erro em quadros malformados ou falha de leitura
    pub fn recv_data(&mut self) -> Result<Option<(String, String)>> {
        protocol::read_message(&mut self.stream)
    }
}

/// Nó P2P genérico: identidade, tabela de peers e registro de handlers
pub struct Peer {
    my_id: RwLock<String>,
    bind_addr: String,
    port: u16,
    listen_port: AtomicU16,
    max_peers: usize,
    peers: Mutex<HashMap<String, (String, u16)>>,
    handlers: RwLock<HashMap<String, Handler>>,
    router: RwLock<Option<Router>>,
    stopping: AtomicBool,
}

impl Peer {
    /// Cria o peer com os handlers de membresia já instalados.
    ///
    /// O id canônico é `bind:porta`; com porta 0 ele é reescrito quando o
    /// listener conhecer a porta real.
    #[must_use]
    pub fn new(bind_addr: &str, port: u16, max_peers: usize) -> Arc<Self> {
        let peer = Arc::new(Self {
            my_id: RwLock::new(format!("{bind_addr}:{port}")),
            bind_addr: bind_addr.to_string(),
            port,
            listen_port: AtomicU16::new(port),
            max_peers,
            peers: Mutex::new(HashMap::new()),
            handlers: RwLock::new(HashMap::new()),
            router: RwLock::new(None),
            stopping: AtomicBool::new(false),
        });

        peer.install_membership_handlers();
        peer
    }

    /// Id canônico deste peer (`host:porta`)
    #[must_use]
    pub fn my_id(&self) -> String {
        self.my_id.read().unwrap().clone()
    }

    /// Porta em que o listener está (ou vai ficar) escutando
    #[must_use]
    pub fn listen_port(&self) -> u16 {
        self.listen_port.load(Ordering::SeqCst)
    }

    /// Registra o handler de um tipo de mensagem
    pub fn add_handler<F>(&self, msg_type: &str, handler: F)
    where
        F: Fn(&mut PeerConnection, &str) + Send + Sync + 'static,
    {
        self.handlers
            .write()
            .unwrap()
            .insert(msg_type.to_string(), Arc::new(handler));
    }

    /// Registra o resolvedor de rota usado ao enviar por id lógico
    pub fn add_router<F>(&self, router: F)
    where
        F: Fn(&str) -> Option<(String, u16)> + Send + Sync + 'static,
    {
        *self.router.write().unwrap() = Some(Arc::new(router));
    }

    /// Insere um peer na tabela; falso quando a tabela está cheia ou o id
    /// já existe
    pub fn add_peer(&self, peer_id: &str, host: &str, port: u16) -> bool {
        let mut peers = self.peers.lock().unwrap();
        if peers.len() >= self.max_peers || peers.contains_key(peer_id) {
            return false;
        }
        peers.insert(peer_id.to_string(), (host.to_string(), port));
        true
    }

    /// Remove um peer da tabela
    pub fn remove_peer(&self, peer_id: &str) -> bool {
        self.peers.lock().unwrap().remove(peer_id).is_some()
    }

    /// Rota registrada para um peer
    #[must_use]
    pub fn get_peer(&self, peer_id: &str) -> Option<(String, u16)> {
        self.peers.lock().unwrap().get(peer_id).cloned()
    }

    /// Ids de todos os peers conhecidos
    #[must_use]
    pub fn peer_ids(&self) -> Vec<String> {
        self.peers.lock().unwrap().keys().cloned().collect()
    }

    /// Quantidade de peers na tabela
    #[must_use]
    pub fn num_peers(&self) -> usize {
        self.peers.lock().unwrap().len()
    }

    /// Liga o listener e começa a aceitar conexões numa thread própria.
    ///
    /// # Errors
    ///
    /// Retorna erro fatal se o bind falhar
    pub fn start(self: &Arc<Self>) -> Result<thread::JoinHandle<()>> {
        let listener = TcpListener::bind((self.bind_addr.as_str(), self.port))
            .map_err(|e| BlockchainError::IoError(format!("bind {}: {e}", self.bind_addr)))?;

        // Com porta 0 o sistema escolhe; atualiza identidade e rota
        let bound_port = listener
            .local_addr()
            .map_err(|e| BlockchainError::IoError(e.to_string()))?
            .port();
        self.listen_port.store(bound_port, Ordering::SeqCst);
        *self.my_id.write().unwrap() = format!("{}:{bound_port}", self.bind_addr);

        info!(addr = %format!("{}:{bound_port}", self.bind_addr), "listening for peers");

        let peer = Arc::clone(self);
        Ok(thread::spawn(move || peer.accept_loop(&listener)))
    }

    fn accept_loop(self: Arc<Self>, listener: &TcpListener) {
        for incoming in listener.incoming() {
            if self.stopping.load(Ordering::SeqCst) {
                break;
            }

            match incoming {
                Ok(stream) => {
                    let peer = Arc::clone(&self);
                    thread::spawn(move || peer.handle_connection(stream));
                }
                Err(error) => warn!(%error, "failed to accept connection"),
            }
        }
        info!("peer listener drained");
    }

    fn handle_connection(self: Arc<Self>, stream: TcpStream) {
        let mut connection = match PeerConnection::new(stream) {
            Ok(connection) => connection,
            Err(error) => {
                warn!(%error, "failed to set up inbound connection");
                return;
            }
        };

        let message = match connection.recv_data() {
            Ok(Some(message)) => message,
            // A outra ponta desistiu antes de mandar a requisição
            Ok(None) => return,
            Err(error) => {
                debug!(%error, "dropping malformed inbound request");
                return;
            }
        };

        let (msg_type, payload) = message;
        let handler = self.handlers.read().unwrap().get(&msg_type).cloned();

        match handler {
            Some(handler) => handler(&mut connection, &payload),
            None => {
                debug!(%msg_type, "no handler registered");
                let _ = connection.send_data(protocol::ERROR, "Unknown message type");
            }
        }
    }

    /// Conecta num endereço, envia uma requisição e, se `expect_reply`,
    /// coleta as respostas enquadradas até o EOF.
    ///
    /// # Errors
    ///
    /// Retorna `PeerUnreachable` em falha de conexão, envio ou leitura
    pub fn connect_and_send(
        &self,
        host: &str,
        port: u16,
        msg_type: &str,
        payload: &str,
        expect_reply: bool,
    ) -> Result<Vec<Response>> {
        let address = (host, port)
            .to_socket_addrs()
            .map_err(|e| BlockchainError::PeerUnreachable(format!("{host}:{port}: {e}")))?
            .next()
            .ok_or_else(|| {
                BlockchainError::PeerUnreachable(format!("{host}:{port}: no address"))
            })?;

        let stream = TcpStream::connect_timeout(&address, CONNECT_TIMEOUT)
            .map_err(|e| BlockchainError::PeerUnreachable(format!("{host}:{port}: {e}")))?;
        let mut connection = PeerConnection::new(stream)
            .map_err(|e| BlockchainError::PeerUnreachable(format!("{host}:{port}: {e}")))?;

        connection
            .send_data(msg_type, payload)
            .map_err(|e| BlockchainError::PeerUnreachable(format!("{host}:{port}: {e}")))?;

        if !expect_reply {
            return Ok(vec![]);
        }

        // Sinaliza fim da requisição; o resto da conversa é só leitura
        let _ = connection.stream.flush();
        let _ = connection.stream.shutdown(std::net::Shutdown::Write);

        let mut responses = Vec::new();
        loop {
            match connection.recv_data() {
                Ok(Some((code, text))) => responses.push(Response::new(&code, text)),
                Ok(None) => break,
                Err(error) => {
                    return Err(BlockchainError::PeerUnreachable(format!(
                        "{host}:{port}: {error}"
                    )))
                }
            }
        }

        Ok(responses)
    }

    /// Envia para um peer da tabela pelo id lógico, resolvendo a rota
    /// pelo router registrado.
    ///
    /// # Errors
    ///
    /// Retorna `PeerUnreachable` quando o id não resolve ou o envio falha
    pub fn send_to_peer(
        &self,
        peer_id: &str,
        msg_type: &str,
        payload: &str,
        expect_reply: bool,
    ) -> Result<Vec<Response>> {
        let route = {
            let router = self.router.read().unwrap();
            match router.as_ref() {
                Some(router) => router(peer_id),
                None => self.get_peer(peer_id),
            }
        };

        let Some((host, port)) = route else {
            return Err(BlockchainError::PeerUnreachable(format!(
                "no route to peer {peer_id}"
            )));
        };

        self.connect_and_send(&host, port, msg_type, payload, expect_reply)
    }

    /// Encerra o accept loop
    pub fn shutdown(&self) {
        self.stopping.store(true, Ordering::SeqCst);

        // Acorda o accept bloqueado com uma conexão vazia
        let port = self.listen_port.load(Ordering::SeqCst);
        let host = if self.bind_addr == "0.0.0.0" {
            "127.0.0.1"
        } else {
            self.bind_addr.as_str()
        };
        if let Ok(address) = (host, port).to_socket_addrs().map(|mut a| a.next()) {
            if let Some(address) = address {
                let _ = TcpStream::connect_timeout(&address, CONNECT_TIMEOUT);
            }
        }
    }

    fn install_membership_handlers(self: &Arc<Self>) {
        let peer = Arc::clone(self);
        self.add_handler(protocol::INSERTPEER, move |conn, data| {
            peer.handle_insert_peer(conn, data);
        });

        let peer = Arc::clone(self);
        self.add_handler(protocol::LISTPEERS, move |conn, _data| {
            peer.handle_list_peers(conn);
        });

        let peer = Arc::clone(self);
        self.add_handler(protocol::PEERNAME, move |conn, _data| {
            let _ = conn.send_data(protocol::REPLY, &peer.my_id());
        });

        let peer = Arc::clone(self);
        self.add_handler(protocol::PEERQUIT, move |conn, data| {
            peer.handle_quit(conn, data);
        });
    }

    /// JOIN: payload `"<id> <host> <porta>"`
    fn handle_insert_peer(&self, connection: &mut PeerConnection, data: &str) {
        let fields: Vec<&str> = data.split_whitespace().collect();
        let parsed = match fields.as_slice() {
            [peer_id, host, port] => port
                .parse::<u16>()
                .ok()
                .map(|port| ((*peer_id).to_string(), (*host).to_string(), port)),
            _ => None,
        };

        let Some((peer_id, host, port)) = parsed else {
            warn!(data, "invalid join request");
            let _ = connection.send_data(protocol::ERROR, "Join: incorrect arguments");
            return;
        };

        let mut peers = self.peers.lock().unwrap();

        if peers.len() >= self.max_peers {
            debug!(max_peers = self.max_peers, "peer table full");
            let _ = connection.send_data(protocol::ERROR, "Join: too many peers");
            return;
        }

        if peers.contains_key(&peer_id) || peer_id == self.my_id() {
            let _ = connection.send_data(
                protocol::ERROR,
                &format!("Join: peer already inserted {peer_id}"),
            );
            return;
        }

        peers.insert(peer_id.clone(), (host, port));
        info!(%peer_id, "peer added");
        let _ = connection.send_data(protocol::REPLY, &format!("Join: peer added: {peer_id}"));
    }

    /// LIST: primeira resposta é a contagem, depois uma por peer
    fn handle_list_peers(&self, connection: &mut PeerConnection) {
        let peers = self.peers.lock().unwrap();

        let _ = connection.send_data(protocol::REPLY, &peers.len().to_string());
        for (peer_id, (host, port)) in peers.iter() {
            let _ = connection.send_data(protocol::REPLY, &format!("{peer_id} {host} {port}"));
        }
    }

    /// QUIT: payload `"<id>"`
    fn handle_quit(&self, connection: &mut PeerConnection, data: &str) {
        let peer_id = data.trim();

        if self.remove_peer(peer_id) {
            info!(peer_id, "peer removed");
            let _ =
                connection.send_data(protocol::REPLY, &format!("Quit: peer removed: {peer_id}"));
        } else {
            let _ =
                connection.send_data(protocol::ERROR, &format!("Quit: peer not found: {peer_id}"));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn started_peer(max_peers: usize) -> (Arc<Peer>, thread::JoinHandle<()>) {
        let peer = Peer::new("127.0.0.1", 0, max_peers);
        let handle = peer.start().unwrap();
        (peer, handle)
    }

    #[test]
    fn test_peer_table_is_bounded() {
        let peer = Peer::new("127.0.0.1", 0, 2);

        assert!(peer.add_peer("a:1", "localhost", 1));
        assert!(peer.add_peer("b:2", "localhost", 2));
        assert!(!peer.add_peer("c:3", "localhost", 3));
        assert!(!peer.add_peer("a:1", "localhost", 1));

        assert!(peer.remove_peer("a:1"));
        assert!(peer.add_peer("c:3", "localhost", 3));
        assert_eq!(peer.num_peers(), 2);
    }

    #[test]
    fn test_peername_round_trip() {
        let (peer, _handle) = started_peer(8);

        let responses = peer
            .connect_and_send("127.0.0.1", peer.listen_port(), protocol::PEERNAME, "", true)
            .unwrap();

        assert_eq!(responses.len(), 1);
        assert!(responses[0].is_successful());
        assert_eq!(responses[0].text, peer.my_id());

        peer.shutdown();
    }

    #[test]
    fn test_join_then_list_then_quit() {
        let (peer, _handle) = started_peer(8);
        let port = peer.listen_port();

        let responses = peer
            .connect_and_send(
                "127.0.0.1",
                port,
                protocol::INSERTPEER,
                "other:7001 localhost 7001",
                true,
            )
            .unwrap();
        assert!(responses[0].is_successful());

        // JOIN duplicado é recusado
        let responses = peer
            .connect_and_send(
                "127.0.0.1",
                port,
                protocol::INSERTPEER,
                "other:7001 localhost 7001",
                true,
            )
            .unwrap();
        assert!(!responses[0].is_successful());

        let responses = peer
            .connect_and_send("127.0.0.1", port, protocol::LISTPEERS, "", true)
            .unwrap();
        assert_eq!(responses[0].text, "1");
        assert_eq!(responses[1].text, "other:7001 localhost 7001");

        let responses = peer
            .connect_and_send("127.0.0.1", port, protocol::PEERQUIT, "other:7001", true)
            .unwrap();
        assert!(responses[0].is_successful());
        assert_eq!(peer.num_peers(), 0);

        peer.shutdown();
    }

    #[test]
    fn test_join_beyond_max_peers_is_refused() {
        let (peer, _handle) = started_peer(1);
        let port = peer.listen_port();

        peer.connect_and_send(
            "127.0.0.1",
            port,
            protocol::INSERTPEER,
            "a:1 localhost 7001",
            true,
        )
        .unwrap();

        let responses = peer
            .connect_and_send(
                "127.0.0.1",
                port,
                protocol::INSERTPEER,
                "b:2 localhost 7002",
                true,
            )
            .unwrap();
        assert!(!responses[0].is_successful());
        assert_eq!(responses[0].text, "Join: too many peers");

        peer.shutdown();
    }

    #[test]
    fn test_malformed_join_is_an_error() {
        let (peer, _handle) = started_peer(8);

        let responses = peer
            .connect_and_send(
                "127.0.0.1",
                peer.listen_port(),
                protocol::INSERTPEER,
                "not enough",
                true,
            )
            .unwrap();
        assert!(!responses[0].is_successful());
        assert_eq!(responses[0].text, "Join: incorrect arguments");

        peer.shutdown();
    }

    #[test]
    fn test_unknown_message_type() {
        let (peer, _handle) = started_peer(8);

        let responses = peer
            .connect_and_send("127.0.0.1", peer.listen_port(), "NOPE", "", true)
            .unwrap();
        assert!(!responses[0].is_successful());

        peer.shutdown();
    }

    #[test]
    fn test_unreachable_peer_is_an_error() {
        let peer = Peer::new("127.0.0.1", 0, 8);

        // Porta 1: nada escutando
        let result = peer.connect_and_send("127.0.0.1", 1, protocol::PEERNAME, "", true);
        assert!(matches!(result, Err(BlockchainError::PeerUnreachable(_))));
    }

    #[test]
    fn test_send_by_logical_peer_id() {
        let (peer, _handle) = started_peer(8);
        let port = peer.listen_port();

        peer.add_peer("self", "127.0.0.1", port);
        let table = Arc::clone(&peer);
        peer.add_router(move |peer_id| table.get_peer(peer_id));

        let responses = peer
            .send_to_peer("self", protocol::PEERNAME, "", true)
            .unwrap();
        assert!(responses[0].is_successful());

        assert!(matches!(
            peer.send_to_peer("ghost", protocol::PEERNAME, "", true),
            Err(BlockchainError::PeerUnreachable(_))
        ));

        peer.shutdown();
    }
}
