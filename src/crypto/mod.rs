//! OpenSSL-compatible encryption support.
//!
//! Implements the legacy `EVP_BytesToKey` derivation (SHA-1, three rounds)
//! and AES-256-CBC with PKCS#7 padding, matching what `openssl enc -aes-256-cbc`
//! produced for the backups this scanner has to read. The derivation is
//! cryptographically weak; it is kept strictly for compatibility with
//! existing encrypted artifacts.
//!
//! Encrypted streams carry the OpenSSL header: 16 bytes of which the first 8
//! are the `Salted__` prefix and bytes 8..16 are the salt.

mod stream;

pub use stream::{StreamDecryptor, StreamEncryptor};

use aes::cipher::generic_array::GenericArray;
use aes::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use aes::Aes256;
use sha1::{Digest, Sha1};

pub(crate) type Aes256CbcDec = cbc::Decryptor<Aes256>;
pub(crate) type Aes256CbcEnc = cbc::Encryptor<Aes256>;

/// AES block size in bytes.
pub const BLOCK_SIZE: usize = 16;

/// Size of the `Salted__` header preceding the ciphertext.
pub const SALT_HEADER_SIZE: usize = 16;

const KEY_SIZE: usize = 32;
const IV_SIZE: usize = 16;

/// Failures distinct from cipher-level errors.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum CryptoError {
    #[error("data length {0} is not a positive multiple of the block size")]
    InvalidDataLength(usize),

    #[error("invalid padding")]
    InvalidPadding,

    #[error("data too small to carry a salt header")]
    MissingSaltHeader,
}

/// Key and IV derived from a passphrase the way `EVP_BytesToKey` does with
/// SHA-1 and one iteration: repeated `SHA1(prev ‖ passphrase ‖ salt)` rounds
/// concatenated until 48 bytes are available.
pub(crate) fn derive_key(passphrase: &[u8], salt: &[u8]) -> ([u8; KEY_SIZE], [u8; IV_SIZE]) {
    let mut material = Vec::with_capacity(60);
    let mut prev: Vec<u8> = Vec::new();

    while material.len() < KEY_SIZE + IV_SIZE {
        let mut hasher = Sha1::new();
        hasher.update(&prev);
        hasher.update(passphrase);
        hasher.update(salt);
        prev = hasher.finalize().to_vec();
        material.extend_from_slice(&prev);
    }

    let mut key = [0u8; KEY_SIZE];
    let mut iv = [0u8; IV_SIZE];
    key.copy_from_slice(&material[..KEY_SIZE]);
    iv.copy_from_slice(&material[KEY_SIZE..KEY_SIZE + IV_SIZE]);
    (key, iv)
}

pub(crate) fn pkcs7_unpad(data: &[u8]) -> Result<&[u8], CryptoError> {
    if data.is_empty() || data.len() % BLOCK_SIZE != 0 {
        return Err(CryptoError::InvalidDataLength(data.len()));
    }

    let pad_len = data[data.len() - 1] as usize;
    if pad_len == 0 || pad_len > BLOCK_SIZE {
        return Err(CryptoError::InvalidPadding);
    }

    let pad = &data[data.len() - pad_len..];
    if pad.iter().any(|&b| b as usize != pad_len) {
        return Err(CryptoError::InvalidPadding);
    }

    Ok(&data[..data.len() - pad_len])
}

pub(crate) fn pkcs7_pad(data: &[u8]) -> Vec<u8> {
    let pad_len = BLOCK_SIZE - data.len() % BLOCK_SIZE;
    let mut padded = Vec::with_capacity(data.len() + pad_len);
    padded.extend_from_slice(data);
    padded.extend(std::iter::repeat(pad_len as u8).take(pad_len));
    padded
}

/// One-shot decryption of an OpenSSL-format buffer (`Salted__` header
/// included). Used for the small companion files of the backup password
/// chain; large payloads go through [`StreamDecryptor`].
pub fn decrypt(passphrase: &str, data: &[u8]) -> Result<Vec<u8>, CryptoError> {
    if data.len() < SALT_HEADER_SIZE {
        return Err(CryptoError::MissingSaltHeader);
    }

    let salt = &data[8..SALT_HEADER_SIZE];
    let body = &data[SALT_HEADER_SIZE..];
    if body.is_empty() || body.len() % BLOCK_SIZE != 0 {
        return Err(CryptoError::InvalidDataLength(body.len()));
    }

    let (key, iv) = derive_key(passphrase.as_bytes(), salt);
    let mut cbc = Aes256CbcDec::new(&key.into(), &iv.into());

    let mut buf = body.to_vec();
    for chunk in buf.chunks_exact_mut(BLOCK_SIZE) {
        cbc.decrypt_block_mut(GenericArray::from_mut_slice(chunk));
    }

    pkcs7_unpad(&buf).map(<[u8]>::to_vec)
}

/// One-shot encryption into the OpenSSL format. Counterpart of [`decrypt`],
/// used by tooling and tests to produce fixtures the decryption path accepts.
pub fn encrypt(passphrase: &str, salt: &[u8; 8], data: &[u8]) -> Vec<u8> {
    let (key, iv) = derive_key(passphrase.as_bytes(), salt);
    let mut cbc = Aes256CbcEnc::new(&key.into(), &iv.into());

    let mut buf = pkcs7_pad(data);
    for chunk in buf.chunks_exact_mut(BLOCK_SIZE) {
        cbc.encrypt_block_mut(GenericArray::from_mut_slice(chunk));
    }

    let mut out = Vec::with_capacity(SALT_HEADER_SIZE + buf.len());
    out.extend_from_slice(b"Salted__");
    out.extend_from_slice(salt);
    out.extend_from_slice(&buf);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;

    #[test]
    fn test_known_answer_decryption() {
        let ciphertext = STANDARD
            .decode("V1xFqK8IMvw+SpPDEZYan6W+50DS4RTsMe9zHW4xAcc=")
            .unwrap();

        let mut data = b"Salted__12345678".to_vec();
        data.extend_from_slice(&ciphertext);

        let plaintext = decrypt("passphrase", &data).unwrap();
        assert_eq!(plaintext, b"1234567891234567");
    }

    #[test]
    fn test_roundtrip() {
        let payloads: [&[u8]; 4] = [
            b"",
            b"short",
            b"exactly sixteen!",
            b"a somewhat longer payload crossing several aes blocks for good measure",
        ];

        for payload in payloads {
            let encrypted = encrypt("hunter2", b"saltsalt", payload);
            let decrypted = decrypt("hunter2", &encrypted).unwrap();
            assert_eq!(decrypted, payload, "payload of len {}", payload.len());
        }
    }

    #[test]
    fn test_wrong_passphrase_fails_padding() {
        let encrypted = encrypt("right", b"saltsalt", b"some content");
        // Overwhelmingly likely to produce garbage padding.
        assert!(decrypt("wrong", &encrypted).is_err());
    }

    #[test]
    fn test_rejects_short_and_misaligned_input() {
        assert_eq!(decrypt("p", b"short"), Err(CryptoError::MissingSaltHeader));

        let mut data = b"Salted__12345678".to_vec();
        data.extend_from_slice(&[0u8; 15]);
        assert!(matches!(
            decrypt("p", &data),
            Err(CryptoError::InvalidDataLength(15))
        ));

        let header_only = b"Salted__12345678".to_vec();
        assert!(matches!(
            decrypt("p", &header_only),
            Err(CryptoError::InvalidDataLength(0))
        ));
    }

    #[test]
    fn test_unpad_rejects_bad_padding() {
        assert_eq!(pkcs7_unpad(&[0u8; 16]), Err(CryptoError::InvalidPadding));
        let mut block = [7u8; 16];
        block[15] = 17;
        assert_eq!(pkcs7_unpad(&block), Err(CryptoError::InvalidPadding));
    }
}
