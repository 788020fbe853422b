//! Formato de mensagem do protocolo IndieCoin.
//!
//! Toda mensagem na rede tem o mesmo quadro:
//!
//! ```text
//! msg_type : 4 bytes ASCII, completados à direita com espaço
//! length   : 4 bytes big-endian sem sinal
//! payload  : `length` bytes UTF-8
//! ```
//!
//! Respostas reusam o quadro com os tipos `REPL` e `ERRO`; uma requisição
//! pode receber uma ou mais respostas seguidas de EOF.

use std::io::{ErrorKind, Read, Write};

use shared::{BlockchainError, Result};

// Operações de membresia da tabela de peers
pub const LISTPEERS: &str = "LIST";
pub const INSERTPEER: &str = "JOIN";
pub const PEERNAME: &str = "NAME";
pub const PEERQUIT: &str = "QUIT";

// Operações da moeda
pub const BLOCK_GET: &str = "BLKG";
pub const BLOCK_HEIGHT: &str = "BLKH";
pub const MAX_BLOCK_HEIGHT: &str = "MAXH";
pub const RELAY_TRANSACTION: &str = "RTXN";
pub const RELAY_BLOCK: &str = "RBLK";

// Códigos de resposta
pub const REPLY: &str = "REPL";
pub const ERROR: &str = "ERRO";

/// Teto de payload aceito num quadro (1 MiB)
pub const MAX_PAYLOAD: u32 = 1024 * 1024;

/// Escreve um quadro completo no stream.
///
/// # Errors
///
/// Retorna erro se o tipo não couber em 4 bytes ASCII, se o payload
/// exceder [`MAX_PAYLOAD`] ou se a escrita falhar
pub fn write_message<W: Write>(writer: &mut W, msg_type: &str, payload: &str) -> Result<()> {
    if msg_type.is_empty() || msg_type.len() > 4 || !msg_type.is_ascii() {
        return Err(BlockchainError::SerializationError(format!(
            "bad message type {msg_type:?}"
        )));
    }

    let payload = payload.as_bytes();
    if payload.len() > MAX_PAYLOAD as usize {
        return Err(BlockchainError::SerializationError(format!(
            "payload of {} bytes exceeds frame limit",
            payload.len()
        )));
    }

    let mut tag = [b' '; 4];
    tag[..msg_type.len()].copy_from_slice(msg_type.as_bytes());

    writer
        .write_all(&tag)
        .and_then(|()| writer.write_all(&(payload.len() as u32).to_be_bytes()))
        .and_then(|()| writer.write_all(payload))
        .and_then(|()| writer.flush())
        .map_err(|e| BlockchainError::IoError(e.to_string()))
}

/// Lê um quadro do stream; `None` num EOF limpo (nenhum byte lido).
///
/// # Errors
///
/// Retorna erro em quadros truncados, payloads acima do teto ou payloads
/// que não sejam UTF-8
pub fn read_message<R: Read>(reader: &mut R) -> Result<Option<(String, String)>> {
    let mut tag = [0u8; 4];
    match reader.read_exact(&mut tag) {
        Ok(()) => {}
        Err(e) if e.kind() == ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(BlockchainError::IoError(e.to_string())),
    }

    let mut length_bytes = [0u8; 4];
    reader
        .read_exact(&mut length_bytes)
        .map_err(|e| BlockchainError::IoError(e.to_string()))?;
    let length = u32::from_be_bytes(length_bytes);

    if length > MAX_PAYLOAD {
        return Err(BlockchainError::SerializationError(format!(
            "payload of {length} bytes exceeds frame limit"
        )));
    }

    let mut payload = vec![0u8; length as usize];
    reader
        .read_exact(&mut payload)
        .map_err(|e| BlockchainError::IoError(e.to_string()))?;

    let msg_type = std::str::from_utf8(&tag)
        .map_err(|e| BlockchainError::SerializationError(e.to_string()))?
        .trim_end()
        .to_string();
    let payload = String::from_utf8(payload)
        .map_err(|e| BlockchainError::SerializationError(e.to_string()))?;

    Ok(Some((msg_type, payload)))
}

/// Resposta de uma requisição a outro nó
#[derive(Debug, Clone)]
pub struct Response {
    pub code: String,
    pub text: String,
}

impl Response {
    #[must_use]
    pub fn new(code: &str, text: String) -> Self {
        Self {
            code: code.to_string(),
            text,
        }
    }

    /// Resposta de erro sintetizada localmente (peer inalcançável etc.)
    #[must_use]
    pub fn error(text: String) -> Self {
        Self::new(ERROR, text)
    }

    /// Falso quando a resposta carrega o código `ERRO`
    #[must_use]
    pub fn is_successful(&self) -> bool {
        self.code != ERROR
    }
}
