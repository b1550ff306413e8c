//! Fixed-point time-of-day / elapsed-duration value.
//!
//! Backed by milliseconds so that passing times, sector windows and elapsed
//! splits all share one arithmetic type. Used both as an absolute
//! time-of-day (`HH:MM:SS.fff` since local midnight) and as a plain duration
//! (sector lengths, elapsed splits) depending on context.

use std::fmt;
use std::ops::{Add, Sub};
use std::str::FromStr;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

const MS_PER_SEC: i64 = 1000;
const MS_PER_MIN: i64 = 60 * MS_PER_SEC;
const MS_PER_HOUR: i64 = 60 * MS_PER_MIN;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Tod(i64);

impl Tod {
    pub const ZERO: Tod = Tod(0);

    pub fn from_millis(ms: i64) -> Self {
        Tod(ms)
    }

    pub fn from_secs_f64(secs: f64) -> Self {
        Tod((secs * MS_PER_SEC as f64).round() as i64)
    }

    pub fn as_millis(self) -> i64 {
        self.0
    }

    pub fn as_secs_f64(self) -> f64 {
        self.0 as f64 / MS_PER_SEC as f64
    }

    /// Wall-clock time-of-day for "now", truncated to local midnight.
    pub fn now() -> Self {
        let dur = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        let secs_today = (dur.as_secs() % 86400) as i64;
        Tod(secs_today * MS_PER_SEC + dur.subsec_millis() as i64)
    }

    /// Rounds to the nearest whole second.
    pub fn round(self) -> Self {
        Tod(((self.0 as f64 / MS_PER_SEC as f64).round() as i64) * MS_PER_SEC)
    }

    /// Truncates sub-second precision.
    pub fn truncate(self) -> Self {
        Tod((self.0 / MS_PER_SEC) * MS_PER_SEC)
    }

    /// Truncates to millisecond-precision, keeping at most `places` fractional digits.
    pub fn truncate_places(self, places: u32) -> Self {
        let factor = 10i64.pow(3 - places.min(3));
        Tod((self.0 / factor) * factor)
    }

    /// Snaps to the nearest whole minute (used by sync drift calculation).
    pub fn round60(self) -> Self {
        Tod(((self.0 as f64 / MS_PER_MIN as f64).round() as i64) * MS_PER_MIN)
    }

    pub fn rounded_secs(self, places: u32) -> f64 {
        let factor = 10f64.powi(places as i32);
        (self.as_secs_f64() * factor).round() / factor
    }

    pub fn is_zero(self) -> bool {
        self.0 == 0
    }

    pub fn abs(self) -> Self {
        Tod(self.0.abs())
    }
}

impl Add for Tod {
    type Output = Tod;
    fn add(self, rhs: Tod) -> Tod {
        Tod(self.0 + rhs.0)
    }
}

impl Sub for Tod {
    type Output = Tod;
    fn sub(self, rhs: Tod) -> Tod {
        Tod(self.0 - rhs.0)
    }
}

impl Default for Tod {
    fn default() -> Self {
        Tod::ZERO
    }
}

impl fmt::Display for Tod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let neg = self.0 < 0;
        let total_ms = self.0.unsigned_abs();
        let h = total_ms / (MS_PER_HOUR as u64);
        let m = (total_ms % (MS_PER_HOUR as u64)) / (MS_PER_MIN as u64);
        let s = (total_ms % (MS_PER_MIN as u64)) / (MS_PER_SEC as u64);
        let ms = total_ms % (MS_PER_SEC as u64);
        write!(
            f,
            "{}{:02}:{:02}:{:02}.{:03}",
            if neg { "-" } else { "" },
            h,
            m,
            s,
            ms
        )
    }
}

#[derive(Debug, thiserror::Error)]
#[error("invalid tod string: {0}")]
pub struct TodParseError(String);

impl FromStr for Tod {
    type Err = TodParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let (neg, rest) = match s.strip_prefix('-') {
            Some(rest) => (true, rest),
            None => (false, s),
        };
        let parts: Vec<&str> = rest.split(':').collect();
        if parts.len() != 3 {
            return Err(TodParseError(s.to_string()));
        }
        let h: i64 = parts[0].parse().map_err(|_| TodParseError(s.to_string()))?;
        let m: i64 = parts[1].parse().map_err(|_| TodParseError(s.to_string()))?;
        let sec_f: f64 = parts[2].parse().map_err(|_| TodParseError(s.to_string()))?;
        let ms = h * MS_PER_HOUR + m * MS_PER_MIN + (sec_f * MS_PER_SEC as f64).round() as i64;
        Ok(Tod(if neg { -ms } else { ms }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn formats_zero_padded() {
        let t = Tod::from_secs_f64(3661.5);
        assert_eq!(t.to_string(), "01:01:01.500");
    }

    #[test]
    fn parses_back_what_it_formats() {
        let t = Tod::from_secs_f64(12345.678);
        let rendered = t.to_string();
        let parsed: Tod = rendered.parse().unwrap();
        assert_eq!(t, parsed);
    }

    #[test]
    fn round60_snaps_to_nearest_minute() {
        let t = Tod::from_secs_f64(719.92); // 11:59:59.920 since ... 719.92s
        assert_eq!(t.round60(), Tod::from_secs_f64(720.0));
    }

    #[test]
    fn sub_is_signed() {
        let a = Tod::from_secs_f64(5.0);
        let b = Tod::from_secs_f64(8.0);
        assert_eq!((a - b).as_secs_f64(), -3.0);
    }

    #[test]
    fn ord_compares_by_millis() {
        let a = Tod::from_secs_f64(1.0);
        let b = Tod::from_secs_f64(2.0);
        assert!(a < b);
    }
}
