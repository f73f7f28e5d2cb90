use std::fmt::Debug;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// AES-CBC decryption failed: wrong passphrase, or the ciphertext is
    /// corrupt/truncated. Electrum surfaces both cases as "invalid password".
    #[error("Invalid password")]
    InvalidPassword,
    #[error("Decode error: \n\t{0}")]
    Base64Decode(#[from] bitcoin::base64::DecodeError),
    #[error("Invalid mnemonic: \n\t{0}")]
    Bip39(#[from] bip39::Error),
    #[error("Invalid seed hex")]
    InvalidSeedHex,
}
