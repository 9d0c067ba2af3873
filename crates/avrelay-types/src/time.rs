//! Rational time bases for packet timestamps.

use std::fmt;

use serde::{Deserialize, Serialize};

/// A rational time base: one tick lasts `num / den` seconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TimeBase {
    pub num: u32,
    pub den: u32,
}

impl TimeBase {
    /// Millisecond ticks, used by RTMP/FLV.
    pub const MILLIS: TimeBase = TimeBase { num: 1, den: 1000 };

    /// Microsecond ticks.
    pub const MICROS: TimeBase = TimeBase {
        num: 1,
        den: 1_000_000,
    };

    /// Create a time base.
    pub const fn new(num: u32, den: u32) -> Self {
        Self { num, den }
    }

    /// Time base of one tick per unit at `rate` units per second.
    pub const fn per_second(rate: u32) -> Self {
        Self { num: 1, den: rate }
    }

    /// Rescale `ts` from this time base into `to`, rounding to nearest
    /// (halves away from zero).
    pub fn rescale(self, ts: i64, to: TimeBase) -> i64 {
        if self == to {
            return ts;
        }

        let num = ts as i128 * self.num as i128 * to.den as i128;
        let den = self.den as i128 * to.num as i128;
        if den == 0 {
            return 0;
        }

        let half = den / 2;
        let scaled = if num >= 0 {
            (num + half) / den
        } else {
            (num - half) / den
        };

        scaled.clamp(i64::MIN as i128, i64::MAX as i128) as i64
    }

    /// Seconds represented by `ts` ticks.
    pub fn seconds(self, ts: i64) -> f64 {
        if self.den == 0 {
            return 0.0;
        }
        ts as f64 * self.num as f64 / self.den as f64
    }
}

impl fmt::Display for TimeBase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.num, self.den)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rescale_samples_to_millis() {
        let tb = TimeBase::per_second(48000);
        assert_eq!(tb.rescale(1024, TimeBase::MILLIS), 21);
        assert_eq!(tb.rescale(48000, TimeBase::MILLIS), 1000);
        assert_eq!(tb.rescale(0, TimeBase::MILLIS), 0);
    }

    #[test]
    fn test_rescale_rounds_to_nearest() {
        let tb = TimeBase::per_second(30);
        // 1/30 s = 33.33 ms, 2/30 s = 66.67 ms
        assert_eq!(tb.rescale(1, TimeBase::MILLIS), 33);
        assert_eq!(tb.rescale(2, TimeBase::MILLIS), 67);
        assert_eq!(tb.rescale(-2, TimeBase::MILLIS), -67);
    }

    #[test]
    fn test_rescale_identity() {
        let tb = TimeBase::new(1, 90000);
        assert_eq!(tb.rescale(123_456, tb), 123_456);
    }
}
