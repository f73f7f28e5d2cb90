//! Cryptographic primitives for the wallet core: password-based symmetric
//! encryption of small secrets, and seed/mnemonic encoding helpers.

pub mod encode;
pub mod error;
pub mod seed;

pub use encode::{pw_decode, pw_encode};
pub use error::Error;
