#![deny(unused_crate_dependencies)]
mod client;
mod estimator;
mod signer;

pub use alloy::{primitives::Address, signers::local::PrivateKeySigner};
pub use client::HttpClient;
pub use estimator::FeeEstimator;
pub use signer::AttemptSigner;
