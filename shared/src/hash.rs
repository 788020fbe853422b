use sha2::{Digest, Sha256};

/// Calcula o digest SHA-256 dos dados e devolve o hex minúsculo (64 chars)
#[must_use]
pub fn sha256(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

/// SHA-256 duplo: aplica SHA-256 sobre o digest hexadecimal do primeiro passo
#[must_use]
pub fn sha256d(data: &[u8]) -> String {
    sha256(sha256(data).as_bytes())
}

/// Conta os bits zero iniciais de um digest hexadecimal.
///
/// Um digest malformado conta como zero bits, o que nunca satisfaz
/// um alvo de dificuldade real.
#[must_use]
pub fn leading_zero_bits(hex_digest: &str) -> u32 {
    let Ok(bytes) = hex::decode(hex_digest) else {
        return 0;
    };

    let mut zeros = 0;
    for &byte in &bytes {
        if byte == 0 {
            zeros += 8;
        } else {
            zeros += byte.leading_zeros();
            break;
        }
    }
    zeros
}
