use std::time::Duration;

use rand::Rng;

/// Spreads a polling period by ±10 % so workers started together do not
/// hit the database in lockstep.
pub(crate) fn with_jitter(period: Duration) -> Duration {
    let factor = rand::thread_rng().gen_range(0.9..=1.1);
    period.mul_f64(factor)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn jitter_stays_within_ten_percent() {
        let period = Duration::from_secs(10);

        for _ in 0..1000 {
            let jittered = with_jitter(period);
            assert!(jittered >= period.mul_f64(0.9));
            assert!(jittered <= period.mul_f64(1.1));
        }
    }
}
