pub use alloy::primitives::{Address, B256, U256};
pub use chrono::{DateTime, Utc};

mod attempt;
mod chain;
mod checker;
mod send_error;
mod transaction;

pub use attempt::*;
pub use chain::*;
pub use checker::*;
pub use send_error::*;
pub use transaction::*;
