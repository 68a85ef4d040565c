//! Streaming AES-256-CBC engines.
//!
//! The decryptor buffers input and only releases whole blocks, always keeping
//! at least one block back so the final call can strip PKCS#7 padding. Both
//! engines share the chunking rule: each call flushes
//! `BLOCK_SIZE * ((buffered - 1) / BLOCK_SIZE)` bytes.

use aes::cipher::generic_array::GenericArray;
use aes::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit};

use super::{
    derive_key, pkcs7_pad, pkcs7_unpad, Aes256CbcDec, Aes256CbcEnc, CryptoError, BLOCK_SIZE,
};

fn flushable(buffered: usize) -> usize {
    BLOCK_SIZE * (buffered.saturating_sub(1) / BLOCK_SIZE)
}

/// Stateful decryptor for content too large to hold in memory at once.
pub struct StreamDecryptor {
    cbc: Aes256CbcDec,
    pending: Vec<u8>,
}

impl StreamDecryptor {
    /// Build a decryptor from a passphrase and the 8-byte salt read from the
    /// stream header.
    pub fn new(passphrase: &str, salt: &[u8]) -> Self {
        let (key, iv) = derive_key(passphrase.as_bytes(), salt);
        Self {
            cbc: Aes256CbcDec::new(&key.into(), &iv.into()),
            pending: Vec::new(),
        }
    }

    /// Feed ciphertext, returning as many decrypted blocks as can be released
    /// while still holding back the potential padding block.
    pub fn update(&mut self, data: &[u8]) -> Vec<u8> {
        self.pending.extend_from_slice(data);

        let size = flushable(self.pending.len());
        if size == 0 {
            return Vec::new();
        }

        let mut out: Vec<u8> = self.pending.drain(..size).collect();
        for chunk in out.chunks_exact_mut(BLOCK_SIZE) {
            self.cbc.decrypt_block_mut(GenericArray::from_mut_slice(chunk));
        }
        out
    }

    /// Decrypt the held-back tail and strip the PKCS#7 padding.
    pub fn finish(mut self) -> Result<Vec<u8>, CryptoError> {
        if self.pending.is_empty() || self.pending.len() % BLOCK_SIZE != 0 {
            return Err(CryptoError::InvalidDataLength(self.pending.len()));
        }

        let mut tail = std::mem::take(&mut self.pending);
        for chunk in tail.chunks_exact_mut(BLOCK_SIZE) {
            self.cbc.decrypt_block_mut(GenericArray::from_mut_slice(chunk));
        }

        pkcs7_unpad(&tail).map(<[u8]>::to_vec)
    }
}

/// Streaming counterpart of [`StreamDecryptor`]; pads on [`finish`].
///
/// [`finish`]: StreamEncryptor::finish
pub struct StreamEncryptor {
    cbc: Aes256CbcEnc,
    pending: Vec<u8>,
}

impl StreamEncryptor {
    pub fn new(passphrase: &str, salt: &[u8]) -> Self {
        let (key, iv) = derive_key(passphrase.as_bytes(), salt);
        Self {
            cbc: Aes256CbcEnc::new(&key.into(), &iv.into()),
            pending: Vec::new(),
        }
    }

    pub fn update(&mut self, data: &[u8]) -> Vec<u8> {
        self.pending.extend_from_slice(data);

        let size = flushable(self.pending.len());
        if size == 0 {
            return Vec::new();
        }

        let mut out: Vec<u8> = self.pending.drain(..size).collect();
        for chunk in out.chunks_exact_mut(BLOCK_SIZE) {
            self.cbc.encrypt_block_mut(GenericArray::from_mut_slice(chunk));
        }
        out
    }

    pub fn finish(mut self) -> Vec<u8> {
        let mut tail = pkcs7_pad(&std::mem::take(&mut self.pending));
        for chunk in tail.chunks_exact_mut(BLOCK_SIZE) {
            self.cbc.encrypt_block_mut(GenericArray::from_mut_slice(chunk));
        }
        tail
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{decrypt, encrypt, SALT_HEADER_SIZE};

    const SALT: &[u8; 8] = b"abcdefgh";

    #[test]
    fn test_streaming_matches_one_shot_for_any_chunking() {
        let payload: Vec<u8> = (0..10_000u32).map(|i| (i % 251) as u8).collect();
        let encrypted = encrypt("stream-pass", SALT, &payload);
        let body = &encrypted[SALT_HEADER_SIZE..];

        for chunk_size in [1, 7, 16, 17, 1024, body.len()] {
            let mut decryptor = StreamDecryptor::new("stream-pass", SALT);
            let mut output = Vec::new();
            for chunk in body.chunks(chunk_size) {
                output.extend(decryptor.update(chunk));
            }
            output.extend(decryptor.finish().unwrap());

            assert_eq!(output, payload, "chunk size {chunk_size}");
        }
    }

    #[test]
    fn test_update_holds_back_final_block() {
        let encrypted = encrypt("p", SALT, b"0123456789abcdef");
        let body = &encrypted[SALT_HEADER_SIZE..];
        assert_eq!(body.len(), 32);

        let mut decryptor = StreamDecryptor::new("p", SALT);
        // Exactly two blocks buffered: only one may be released.
        assert_eq!(decryptor.update(body).len(), 16);
        assert_eq!(decryptor.finish().unwrap(), b"");
    }

    #[test]
    fn test_encrypt_stream_roundtrip() {
        let payload = b"streamed cleartext across multiple update calls";

        let mut encryptor = StreamEncryptor::new("p", SALT);
        let mut ciphertext = Vec::new();
        for chunk in payload.chunks(5) {
            ciphertext.extend(encryptor.update(chunk));
        }
        ciphertext.extend(encryptor.finish());

        let mut framed = b"Salted__".to_vec();
        framed.extend_from_slice(SALT);
        framed.extend_from_slice(&ciphertext);

        assert_eq!(decrypt("p", &framed).unwrap(), payload);
    }

    #[test]
    fn test_finish_rejects_truncated_stream() {
        let mut decryptor = StreamDecryptor::new("p", SALT);
        decryptor.update(&[0u8; 10]);
        assert!(decryptor.finish().is_err());

        let empty = StreamDecryptor::new("p", SALT);
        assert!(empty.finish().is_err());
    }
}
