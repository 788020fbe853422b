//! Endereços IndieCoin: pares de chaves ECDSA sobre NIST P-521.
//!
//! As chaves circulam pela rede como texto hexadecimal cru: o escalar
//! privado com 66 bytes (132 chars) e o ponto público sem o prefixo SEC1
//! com 132 bytes (264 chars).

use ecdsa::signature::{Signer, Verifier};
use p521::ecdsa::{Signature, SigningKey, VerifyingKey};
use rand::rngs::OsRng;

use crate::{BlockchainError, Result};

/// Par de chaves (ou apenas chave pública) que identifica uma conta.
///
/// Um endereço carregado somente com a chave pública consegue verificar
/// assinaturas mas não assinar.
#[derive(Clone)]
pub struct Address {
    signing_key: Option<SigningKey>,
    verifying_key: VerifyingKey,
}

impl std::fmt::Debug for Address {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Address")
            .field("signing_key", &self.signing_key.is_some())
            .field("verifying_key", &self.public_key())
            .finish()
    }
}

impl Address {
    /// Gera um novo par de chaves na curva P-521
    #[must_use]
    pub fn generate() -> Self {
        let signing_key = SigningKey::random(&mut OsRng);
        let verifying_key = VerifyingKey::from(&signing_key);

        Self {
            signing_key: Some(signing_key),
            verifying_key,
        }
    }

    /// Carrega um endereço a partir do escalar privado em hexadecimal.
    ///
    /// A chave pública correspondente é derivada do escalar.
    ///
    /// # Errors
    ///
    /// Retorna erro se o hexadecimal não representar um escalar válido
    pub fn from_private(private_key_hex: &str) -> Result<Self> {
        let bytes = hex::decode(private_key_hex)
            .map_err(|e| BlockchainError::SerializationError(format!("private key: {e}")))?;

        let signing_key = SigningKey::from_slice(&bytes)
            .map_err(|e| BlockchainError::SerializationError(format!("private key: {e}")))?;
        let verifying_key = VerifyingKey::from(&signing_key);

        Ok(Self {
            signing_key: Some(signing_key),
            verifying_key,
        })
    }

    /// Carrega um endereço somente-verificação a partir do ponto público
    /// em hexadecimal (coordenadas x||y, sem o tag SEC1).
    ///
    /// # Errors
    ///
    /// Retorna erro se o hexadecimal não representar um ponto da curva
    pub fn from_public(public_key_hex: &str) -> Result<Self> {
        let raw = hex::decode(public_key_hex)
            .map_err(|e| BlockchainError::SerializationError(format!("public key: {e}")))?;

        // O ponto cru precisa do tag 0x04 (não comprimido) de volta
        let mut sec1 = Vec::with_capacity(raw.len() + 1);
        sec1.push(0x04);
        sec1.extend_from_slice(&raw);

        let verifying_key = VerifyingKey::from_sec1_bytes(&sec1)
            .map_err(|e| BlockchainError::SerializationError(format!("public key: {e}")))?;

        Ok(Self {
            signing_key: None,
            verifying_key,
        })
    }

    /// Representação hexadecimal da chave pública (264 chars)
    #[must_use]
    pub fn public_key(&self) -> String {
        let point = self.verifying_key.to_encoded_point(false);
        // Descarta o tag SEC1, mantendo apenas x||y
        hex::encode(&point.as_bytes()[1..])
    }

    /// Representação hexadecimal da chave privada, se existir (132 chars)
    #[must_use]
    pub fn private_key(&self) -> Option<String> {
        self.signing_key
            .as_ref()
            .map(|key| hex::encode(key.to_bytes()))
    }

    /// Assina uma mensagem com ECDSA determinístico (RFC 6979).
    ///
    /// # Errors
    ///
    /// Retorna [`BlockchainError::NoPrivateKey`] quando o endereço só
    /// possui a chave pública
    pub fn sign(&self, message: &[u8]) -> Result<String> {
        let key = self
            .signing_key
            .as_ref()
            .ok_or(BlockchainError::NoPrivateKey)?;

        let signature: Signature = key.sign(message);
        Ok(hex::encode(signature.to_bytes()))
    }

    /// Verifica uma assinatura hexadecimal sobre a mensagem.
    ///
    /// Assinaturas malformadas contam como inválidas, nunca como erro.
    #[must_use]
    pub fn verify_signature(&self, signature_hex: &str, message: &[u8]) -> bool {
        let Ok(bytes) = hex::decode(signature_hex) else {
            return false;
        };

        let Ok(signature) = Signature::from_slice(&bytes) else {
            return false;
        };

        self.verifying_key.verify(message, &signature).is_ok()
    }
}
