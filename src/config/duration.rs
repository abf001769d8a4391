//! Duration type with human-readable parsing support.
//!
//! Supports parsing from:
//! - Numbers (interpreted as milliseconds for backward compatibility): `5000`
//! - Strings with suffixes: `"5us"`, `"5ms"`, `"0.1ms"`, `"5s"`, `"5m"`, `"5h"`, `"5d"`
//!
//! This provides backward compatibility with existing numeric configurations
//! while allowing more readable string formats including sub-millisecond precision.

use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;

/// Duration in microseconds with human-readable parsing support.
///
/// Internally stores microseconds to support sub-millisecond precision.
///
/// # Supported formats
/// - Plain numbers: interpreted as milliseconds for backward compatibility (e.g., `5000` = 5 seconds)
/// - `us` suffix: microseconds (e.g., `"100us"` = 100 microseconds)
/// - `ms` suffix: milliseconds, supports decimals (e.g., `"5ms"`, `"0.1ms"` = 100 microseconds)
/// - `s` suffix: seconds (e.g., `"5s"` = 5000 milliseconds)
/// - `m` suffix: minutes (e.g., `"5m"` = 300000 milliseconds)
/// - `h` suffix: hours (e.g., `"1h"` = 3600000 milliseconds)
/// - `d` suffix: days (e.g., `"1d"` = 86400000 milliseconds)
///
/// # Examples
/// ```yaml
/// connect_timeout: 3000        # 3 seconds (backward compatible, interpreted as ms)
/// connect_timeout: "3s"        # 3 seconds (human-readable)
/// connect_timeout: "3000ms"    # 3 seconds (explicit milliseconds)
/// clock_resolution: "0.1ms"    # 100 microseconds (sub-millisecond precision)
/// clock_resolution: "100us"    # 100 microseconds (explicit microseconds)
/// idle_timeout: "5m"           # 5 minutes
/// server_lifetime: "1h"        # 1 hour
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Duration(pub u64);

impl Duration {
    /// Creates a new Duration from microseconds.
    pub const fn from_micros(us: u64) -> Self {
        Duration(us)
    }

    /// Creates a new Duration from milliseconds.
    pub const fn from_millis(ms: u64) -> Self {
        Duration(ms * 1000)
    }

    /// Creates a new Duration from seconds.
    pub const fn from_secs(secs: u64) -> Self {
        Duration(secs * 1_000_000)
    }

    /// Creates a new Duration from minutes.
    pub const fn from_mins(mins: u64) -> Self {
        Duration(mins * 60 * 1_000_000)
    }

    /// Creates a new Duration from hours.
    pub const fn from_hours(hours: u64) -> Self {
        Duration(hours * 60 * 60 * 1_000_000)
    }

    /// Returns the duration in microseconds.
    pub const fn as_micros(&self) -> u64 {
        self.0
    }

    /// Returns the duration in milliseconds (truncated).
    pub const fn as_millis(&self) -> u64 {
        self.0 / 1000
    }

    /// Returns the duration in seconds (truncated).
    pub const fn as_secs(&self) -> u64 {
        self.0 / 1_000_000
    }

    /// Converts to std::time::Duration.
    ///
    /// This is the preferred way to use Duration values with tokio and std APIs.
    ///
    /// # Example
    /// ```ignore
    /// let timeout = config.general.connect_timeout.as_std();
    /// tokio::time::sleep(timeout).await;
    /// ```
    pub const fn as_std(&self) -> std::time::Duration {
        std::time::Duration::from_micros(self.0)
    }
}

impl From<u64> for Duration {
    /// Creates Duration from milliseconds (for backward compatibility).
    fn from(ms: u64) -> Self {
        Duration(ms * 1000)
    }
}

impl From<Duration> for u64 {
    /// Returns Duration in milliseconds (for backward compatibility).
    fn from(d: Duration) -> Self {
        d.0 / 1000
    }
}

impl From<Duration> for std::time::Duration {
    fn from(d: Duration) -> Self {
        std::time::Duration::from_micros(d.0)
    }
}

impl fmt::Display for Duration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl<'de> Deserialize<'de> for Duration {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct DurationVisitor;

        impl<'de> de::Visitor<'de> for DurationVisitor {
            type Value = Duration;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str(
                    "a duration like '5s', '100ms', '0.1ms', '100us', '1h', '30m', '1d' or a number in milliseconds",
                )
            }

            fn visit_u64<E>(self, v: u64) -> Result<Duration, E> {
                // Plain numbers are interpreted as milliseconds for backward compatibility
                // Convert to microseconds (internal representation)
                Ok(Duration(v * 1000))
            }

            fn visit_i64<E>(self, v: i64) -> Result<Duration, E>
            where
                E: de::Error,
            {
                if v < 0 {
                    return Err(E::custom("duration cannot be negative"));
                }
                // Plain numbers are interpreted as milliseconds for backward compatibility
                // Convert to microseconds (internal representation)
                Ok(Duration(v as u64 * 1000))
            }

            fn visit_f64<E>(self, v: f64) -> Result<Duration, E>
            where
                E: de::Error,
            {
                if v < 0.0 {
                    return Err(E::custom("duration cannot be negative"));
                }
                // Plain numbers are interpreted as milliseconds for backward compatibility
                // Convert to microseconds (internal representation)
                Ok(Duration((v * 1000.0) as u64))
            }

            fn visit_str<E>(self, s: &str) -> Result<Duration, E>
            where
                E: de::Error,
            {
                parse_duration(s).map_err(E::custom)
            }
        }

        deserializer.deserialize_any(DurationVisitor)
    }
}

impl Serialize for Duration {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        // Serialize as milliseconds for backward compatibility
        serializer.serialize_u64(self.0 / 1000)
    }
}

/// Parse a duration string into a Duration (stored in microseconds).
///
/// Supports:
/// - Plain numbers (milliseconds for backward compatibility): "5000" = 5 seconds
/// - Microseconds: "100us" = 100 microseconds
/// - Milliseconds (supports decimals): "5ms", "0.1ms" = 100 microseconds
/// - Seconds: "5s" = 5,000,000 microseconds
/// - Minutes: "5m" = 300,000,000 microseconds
/// - Hours: "5h"
/// - Days: "5d"
fn parse_duration(s: &str) -> Result<Duration, String> {
    let s = s.trim();

    // Try parsing as plain number first (backward compatibility - milliseconds)
    if let Ok(ms) = s.parse::<u64>() {
        return Ok(Duration(ms * 1000)); // Convert ms to us
    }

    // Try parsing as float for backward compatibility with decimal milliseconds
    if let Ok(ms) = s.parse::<f64>() {
        if ms < 0.0 {
            return Err("duration cannot be negative".to_string());
        }
        return Ok(Duration((ms * 1000.0) as u64)); // Convert ms to us
    }

    let s_lower = s.to_lowercase();

    // Parse with suffix - multipliers are in microseconds
    let (num_str, multiplier) = if s_lower.ends_with("us") {
        (&s[..s.len() - 2], 1u64) // microseconds
    } else if s_lower.ends_with("ms") {
        (&s[..s.len() - 2], 1000u64) // milliseconds -> microseconds
    } else if s_lower.ends_with('s') {
        (&s[..s.len() - 1], 1_000_000u64) // seconds -> microseconds
    } else if s_lower.ends_with('m') {
        (&s[..s.len() - 1], 60 * 1_000_000u64) // minutes -> microseconds
    } else if s_lower.ends_with('h') {
        (&s[..s.len() - 1], 60 * 60 * 1_000_000u64) // hours -> microseconds
    } else if s_lower.ends_with('d') {
        (&s[..s.len() - 1], 24 * 60 * 60 * 1_000_000u64) // days -> microseconds
    } else {
        return Err(format!(
            "invalid duration format: '{}'. Expected a number or a string with suffix (us, ms, s, m, h, d)",
            s
        ));
    };

    let num_str = num_str.trim();

    // Try parsing as integer first
    if let Ok(num) = num_str.parse::<u64>() {
        return Ok(Duration(num * multiplier));
    }

    // Try parsing as float for decimal support (e.g., "0.1ms")
    let num: f64 = num_str
        .parse()
        .map_err(|_| format!("invalid number in duration: '{}'", num_str))?;

    if num < 0.0 {
        return Err("duration cannot be negative".to_string());
    }

    Ok(Duration((num * multiplier as f64) as u64))
}
