//! Realtime clock helpers for on-disk timestamps.
//!
//! BTAG write times must be comparable across runs, so they come from the
//! realtime clock; pacing and elapsed-time math use `std::time::Instant`.

use nix::time::{clock_gettime, ClockId};

/// Current realtime epoch as (seconds, microseconds).
pub fn epoch_micros() -> (u32, u32) {
    match clock_gettime(ClockId::CLOCK_REALTIME) {
        Ok(ts) => (ts.tv_sec() as u32, (ts.tv_nsec() / 1_000) as u32),
        Err(_) => (0, 0),
    }
}

/// Current realtime epoch seconds.
pub fn epoch_secs() -> u32 {
    epoch_micros().0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn epoch_is_sane() {
        let (secs, usecs) = epoch_micros();
        // After 2020, before 2100.
        assert!(secs > 1_577_836_800);
        assert!(secs < 4_102_444_800);
        assert!(usecs < 1_000_000);
    }
}
