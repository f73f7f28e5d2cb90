//! Bitcoin wallet functionality.
//!
//! This crate provides the account model, persistent storage, transaction
//! history tracking, coin selection, and the synchronizer loop that keeps a
//! wallet's view of the chain current, on top of the `bitcoin` and `bip39`
//! crates.

pub mod account;
pub mod error;
pub mod keyid;
pub mod storage;
pub mod synchronizer;
pub mod transaction_builder;
pub mod transactions;
pub mod wallet;

// Type alias for common result type
type Result<T> = std::result::Result<T, error::Error>;
