pub mod port;
mod service;

pub use service::{
    Broadcaster, Config, IN_FLIGHT_RECHECK_INTERVAL, TRANSMIT_CHECK_TIMEOUT,
};
