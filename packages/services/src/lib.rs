#![deny(unused_crate_dependencies)]
pub mod broadcaster;
pub mod nonce_syncer;
pub mod state;
pub mod types;

mod util;

#[cfg(test)]
pub(crate) mod test_utils;

pub use broadcaster::{Broadcaster, Config as BroadcasterConfig};
pub use nonce_syncer::NonceSyncer;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("{0}")]
    Other(String),
    #[error("network error: {0}")]
    Network(String),
    #[error("storage error: {0}")]
    Storage(String),
    #[error("invariant violation: {0}")]
    InvariantViolation(String),
    #[error("insufficient funds: {0}")]
    InsufficientFunds(String),
}

impl From<broadcaster::port::storage::Error> for Error {
    fn from(error: broadcaster::port::storage::Error) -> Self {
        use broadcaster::port::storage::Error as StorageError;
        match error {
            StorageError::InvariantViolation(e) => Self::InvariantViolation(e),
            _ => Self::Storage(error.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
