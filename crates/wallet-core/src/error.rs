use std::fmt::Debug;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Invalid password")]
    InvalidPassword,
    #[error("This wallet seed is deprecated (seed_version < 4)")]
    DeprecatedSeed,
    #[error("A seed already exists")]
    SeedAlreadyExists,
    #[error("Wallet store is corrupt and cannot be parsed")]
    StoreCorrupt,
    #[error("Address not found: {0}")]
    AddressNotFound(String),
    #[error("Invalid private key")]
    InvalidPrivateKey,
    #[error("Address already in wallet: {0}")]
    AddressAlreadyPresent(String),
    #[error("Not enough funds")]
    InsufficientFunds,
    #[error("Unknown transaction input; provide input_info or synchronize the wallet")]
    UnknownInput,
    #[error("Wallet not synchronized: prevout {0} is not in the transaction cache")]
    NotSynchronized(String),
    #[error("History inconsistent with server: {0}")]
    HistoryInconsistent(String),
    #[error("Indexer reported an error: {0}")]
    NetworkError(String),
    #[error("Account not found: {0}")]
    AccountNotFound(String),
    #[error("Invalid account type: {0}")]
    InvalidAccountType(String),
    #[error("Invalid derivation index")]
    InvalidDerivationIndex,
    #[error("Invalid transaction id")]
    InvalidTxId,
    #[error("Invalid address: {0}")]
    InvalidAddress(String),
    #[error("Transaction encode/decode error: {0}")]
    TransactionEncoding(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("BIP32 error: {0}")]
    Bip32(#[from] bitcoin::bip32::Error),
    #[error("secp256k1 error: {0}")]
    Secp256k1(#[from] bitcoin::secp256k1::Error),
    #[error("crypto error: {0}")]
    Crypto(#[from] wallet_crypto::Error),
}
