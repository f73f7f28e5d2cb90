use serde::{Deserialize, Serialize};

pub mod error;
pub mod utils;

pub const SATOSHI: u64 = 1;
pub const BITCOIN: u64 = 100_000_000 * SATOSHI;

/// External (receiving) address chain vs. internal (change) address chain.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Deserialize, Serialize)]
pub enum ChangeFlag {
    External = 0,
    Internal = 1,
}

impl ChangeFlag {
    pub fn is_change(self) -> bool {
        matches!(self, ChangeFlag::Internal)
    }

    pub fn as_u8(self) -> u8 {
        self as u8
    }
}
