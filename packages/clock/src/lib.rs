#![deny(unused_crate_dependencies)]
use chrono::{DateTime, Utc};
use services::broadcaster::port::Clock;

#[derive(Clone)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}
