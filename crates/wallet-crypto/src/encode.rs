//! Password-based symmetric encryption of small secrets (seeds, imported
//! WIF keys, extended private keys). Mirrors Electrum's `pw_encode`/
//! `pw_decode`: AES-256-CBC under `sha256(sha256(passphrase))`, a random IV
//! prepended to the ciphertext, the whole thing base64-encoded.

use aes::Aes256;
use bitcoin::{
    base64::{prelude::BASE64_STANDARD, Engine as _},
    hashes::{sha256, Hash},
};
use cbc::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use rand::RngCore;

use crate::error::Error;

type Aes256CbcEnc = cbc::Encryptor<Aes256>;
type Aes256CbcDec = cbc::Decryptor<Aes256>;

const IV_LEN: usize = 16;

fn derive_key(passphrase: &str) -> [u8; 32] {
    let once = sha256::Hash::hash(passphrase.as_bytes());
    let twice = sha256::Hash::hash(&once[..]);
    twice.to_byte_array()
}

/// Returns `plaintext` unchanged when `passphrase` is empty; otherwise
/// returns the base64 of `IV || AES-256-CBC(plaintext)` under the
/// passphrase-derived key.
pub fn pw_encode(plaintext: &[u8], passphrase: &str) -> String {
    if passphrase.is_empty() {
        return BASE64_STANDARD.encode(plaintext);
    }

    let key = derive_key(passphrase);
    let mut iv = [0u8; IV_LEN];
    rand::thread_rng().fill_bytes(&mut iv);

    let ciphertext = Aes256CbcEnc::new(&key.into(), &iv.into()).encrypt_padded_vec_mut::<cbc::cipher::block_padding::Pkcs7>(plaintext);

    let mut blob = Vec::with_capacity(IV_LEN + ciphertext.len());
    blob.extend_from_slice(&iv);
    blob.extend_from_slice(&ciphertext);
    BASE64_STANDARD.encode(blob)
}

/// Inverse of [`pw_encode`]. Fails with [`Error::InvalidPassword`] when the
/// passphrase is wrong or the blob is malformed — Electrum collapses both
/// into the same user-facing error and we do the same.
pub fn pw_decode(encoded: &str, passphrase: &str) -> Result<Vec<u8>, Error> {
    let blob = BASE64_STANDARD.decode(encoded)?;

    if passphrase.is_empty() {
        return Ok(blob);
    }

    if blob.len() < IV_LEN {
        return Err(Error::InvalidPassword);
    }
    let (iv, ciphertext) = blob.split_at(IV_LEN);
    let key = derive_key(passphrase);

    Aes256CbcDec::new(&key.into(), iv.into())
        .decrypt_padded_vec_mut::<cbc::cipher::block_padding::Pkcs7>(ciphertext)
        .map_err(|_| Error::InvalidPassword)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrips_with_passphrase() {
        let plaintext = b"01234567890123456789012345678901".to_vec();
        let encoded = pw_encode(&plaintext, "hunter2");
        assert_ne!(encoded.as_bytes(), plaintext.as_slice());
        assert_eq!(pw_decode(&encoded, "hunter2").unwrap(), plaintext);
    }

    #[test]
    fn roundtrips_without_passphrase() {
        let plaintext = b"watch-only has no secret".to_vec();
        let encoded = pw_encode(&plaintext, "");
        assert_eq!(pw_decode(&encoded, "").unwrap(), plaintext);
    }

    #[test]
    fn wrong_passphrase_fails() {
        let encoded = pw_encode(b"top secret", "correct horse");
        assert!(matches!(pw_decode(&encoded, "battery staple"), Err(Error::InvalidPassword)));
    }

    #[test]
    fn each_call_uses_a_fresh_iv() {
        let a = pw_encode(b"same plaintext", "pw");
        let b = pw_encode(b"same plaintext", "pw");
        assert_ne!(a, b);
    }
}
