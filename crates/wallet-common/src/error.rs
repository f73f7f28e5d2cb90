use std::fmt::Debug;

// errors shared across the workspace's crates
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Invalid account type: {0}")]
    InvalidAccountType(String),
}
