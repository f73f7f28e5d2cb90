//! Seed encoding/decoding helpers. The wallet's `seed` field is 128 bits of
//! entropy, hex-encoded; it must always round-trip through the 12-word BIP39
//! mnemonic encoder used to present it to the user.

use bip39::{Language, Mnemonic};
use rand::RngCore;

use crate::error::Error;

const ENTROPY_BYTES: usize = 16; // 128 bits -> 12 words

/// Generates 128 bits of fresh entropy, hex-encoded.
pub fn generate_seed() -> String {
    let mut entropy = [0u8; ENTROPY_BYTES];
    rand::thread_rng().fill_bytes(&mut entropy);
    hex::encode(entropy)
}

/// Encodes a hex-encoded seed as its 12-word English mnemonic.
pub fn seed_to_mnemonic(seed_hex: &str) -> Result<String, Error> {
    let entropy = hex::decode(seed_hex).map_err(|_| Error::InvalidSeedHex)?;
    let mnemonic = Mnemonic::from_entropy_in(Language::English, &entropy)?;
    Ok(mnemonic.to_string())
}

/// Decodes a 12-word mnemonic back to its hex-encoded entropy.
pub fn mnemonic_to_seed(mnemonic: &str) -> Result<String, Error> {
    let mnemonic = Mnemonic::parse_in_normalized(Language::English, mnemonic)?;
    Ok(hex::encode(mnemonic.to_entropy()))
}

/// Validates that `seed_hex` round-trips through the mnemonic encoder: hex
/// -> mnemonic -> hex must reproduce the original bytes. Any seed that fails
/// this (corrupt entropy length, non-BIP39-representable bytes) is rejected.
pub fn validate_roundtrip(seed_hex: &str) -> Result<(), Error> {
    let mnemonic = seed_to_mnemonic(seed_hex)?;
    let recovered = mnemonic_to_seed(&mnemonic)?;
    if recovered.eq_ignore_ascii_case(seed_hex) {
        Ok(())
    } else {
        Err(Error::InvalidSeedHex)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_seed_roundtrips() {
        let seed = generate_seed();
        assert!(validate_roundtrip(&seed).is_ok());
    }

    #[test]
    fn mnemonic_has_twelve_words() {
        let seed = generate_seed();
        let mnemonic = seed_to_mnemonic(&seed).unwrap();
        assert_eq!(mnemonic.split_whitespace().count(), 12);
    }

    #[test]
    fn decoding_then_reencoding_yields_same_mnemonic() {
        let seed = generate_seed();
        let mnemonic = seed_to_mnemonic(&seed).unwrap();
        let seed_again = mnemonic_to_seed(&mnemonic).unwrap();
        let mnemonic_again = seed_to_mnemonic(&seed_again).unwrap();
        assert_eq!(mnemonic, mnemonic_again);
    }

    #[test]
    fn garbage_mnemonic_is_rejected() {
        assert!(mnemonic_to_seed("not a valid mnemonic at all nope").is_err());
    }
}
