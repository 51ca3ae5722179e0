//! Small helpers shared by the saturday crates
//!
//! - **Byte Size Handling**: human-readable byte sizes ("2M512K") with [`Bytesize`]
//! - **Duration Conversion**: "1h30m15s" / "300ms" style strings to [`Duration`]
//! - **Logging**: [`logging::config_logger`] builds the `slog` root logger injected into
//!   publishers and subscribers
//!
//! ```rust
//! use saturday_utils::{to_bytesize, to_duration, Bytesize};
//!
//! let size = Bytesize::from("2M512K");
//! assert_eq!(size.as_usize(), 2_621_440);
//!
//! let duration = to_duration("1m30s");
//! assert_eq!(duration.map(|d| d.as_secs()), Some(90));
//!
//! assert_eq!(to_bytesize("4M"), 4 * 1024 * 1024);
//! ```

#![deny(unsafe_code)]

use std::fmt;
use std::ops::Deref;
use std::time::Duration;

use serde::{
    de::{self, Deserializer},
    ser::Serializer,
    Deserialize, Serialize,
};

pub mod logging;

const BYTESIZE_K: usize = 1024;
const BYTESIZE_M: usize = 1048576;
const BYTESIZE_G: usize = 1073741824;

/// Human-readable byte size
///
/// ```
/// use saturday_utils::Bytesize;
///
/// let size = Bytesize::from(1024);
/// assert_eq!(size.string(), "1K");
/// ```
#[derive(Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord)]
pub struct Bytesize(pub usize);

impl Bytesize {
    #[inline]
    pub fn as_usize(&self) -> usize {
        self.0
    }

    /// Format to the shortest "xGyMzKwB" form
    ///
    /// ```
    /// let mixed = saturday_utils::Bytesize(2148532224);
    /// assert_eq!(mixed.string(), "2G1M");
    /// ```
    #[inline]
    pub fn string(&self) -> String {
        let mut v = self.0;
        let mut res = String::new();

        let g = v / BYTESIZE_G;
        if g > 0 {
            res.push_str(&format!("{g}G"));
            v %= BYTESIZE_G;
        }

        let m = v / BYTESIZE_M;
        if m > 0 {
            res.push_str(&format!("{m}M"));
            v %= BYTESIZE_M;
        }

        let k = v / BYTESIZE_K;
        if k > 0 {
            res.push_str(&format!("{k}K"));
            v %= BYTESIZE_K;
        }

        if v > 0 || res.is_empty() {
            res.push_str(&format!("{v}B"));
        }

        res
    }
}

impl Deref for Bytesize {
    type Target = usize;
    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl From<usize> for Bytesize {
    fn from(v: usize) -> Self {
        Bytesize(v)
    }
}

impl From<&str> for Bytesize {
    fn from(v: &str) -> Self {
        Bytesize(to_bytesize(v))
    }
}

impl fmt::Debug for Bytesize {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.string())
    }
}

impl fmt::Display for Bytesize {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.string())
    }
}

impl Serialize for Bytesize {
    #[inline]
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&self.string())
    }
}

impl<'de> Deserialize<'de> for Bytesize {
    #[inline]
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let v = to_bytesize(&String::deserialize(deserializer)?);
        Ok(Bytesize(v))
    }
}

/// Parse human-readable byte size string to usize
///
/// ```
/// let bytes = saturday_utils::to_bytesize("2G512K");
/// assert_eq!(bytes, 2148007936);
///
/// let complex = saturday_utils::to_bytesize("1G500M256K1024B");
/// assert_eq!(complex, 1598292992);
/// ```
#[inline]
pub fn to_bytesize(text: &str) -> usize {
    let text = text.to_uppercase().replace("GB", "G").replace("MB", "M").replace("KB", "K");
    text.split_inclusive(['G', 'M', 'K', 'B'])
        .map(|x| {
            let mut chars = x.chars();
            let u = match chars.nth_back(0) {
                None => return 0,
                Some(u) => u,
            };
            let v = match chars.as_str().parse::<usize>() {
                Err(_e) => return 0,
                Ok(v) => v,
            };
            match u {
                'B' => v,
                'K' => v.saturating_mul(BYTESIZE_K),
                'M' => v.saturating_mul(BYTESIZE_M),
                'G' => v.saturating_mul(BYTESIZE_G),
                _ => 0,
            }
        })
        .fold(0, usize::saturating_add)
}

/// Serialize optional Duration in milliseconds ("300ms"), readable by [`to_duration`]
#[inline]
pub fn serialize_duration_option<S>(d: &Option<Duration>, s: S) -> std::result::Result<S::Ok, S::Error>
where
    S: Serializer,
{
    match d {
        Some(d) => format!("{}ms", d.as_millis()).serialize(s),
        None => s.serialize_none(),
    }
}

/// Convert human-readable duration string to Duration, `None` when malformed
///
/// # Supported units:
/// - ms: milliseconds
/// - s: seconds
/// - m: minutes
/// - h: hours
/// - d: days
/// - w: weeks
///
/// A bare number is taken as seconds.
///
/// ```
/// use std::time::Duration;
///
/// let duration = saturday_utils::to_duration("1h30m15s");
/// assert_eq!(duration, Some(Duration::from_secs(5415)));
///
/// let millis = saturday_utils::to_duration("300ms");
/// assert_eq!(millis, Some(Duration::from_millis(300)));
///
/// assert_eq!(saturday_utils::to_duration("15"), Some(Duration::from_secs(15)));
/// assert_eq!(saturday_utils::to_duration("soon"), None);
/// ```
#[inline]
pub fn to_duration(text: &str) -> Option<Duration> {
    let text = text.trim();
    if text.is_empty() {
        return None;
    }
    if let Ok(secs) = text.parse::<u64>() {
        return Some(Duration::from_secs(secs));
    }
    let text = text.to_lowercase().replace("ms", "Y");
    text.split_inclusive(['s', 'm', 'h', 'd', 'w', 'Y'])
        .try_fold(0u64, |ms, x| {
            let mut chars = x.chars();
            let u = chars.nth_back(0)?;
            let v = chars.as_str().parse::<u64>().ok()?;
            let unit = match u {
                'Y' => 1,
                's' => 1000,
                'm' => 60000,
                'h' => 3600000,
                'd' => 86400000,
                'w' => 604800000,
                _ => return None,
            };
            Some(ms.saturating_add(v.saturating_mul(unit)))
        })
        .map(Duration::from_millis)
}

/// Deserialize a byte size given either as a [`Bytesize`] string ("4M") or as a bare
/// integer counted in `unit` bytes.
pub fn deserialize_bytesize_with_unit<'de, D>(
    deserializer: D,
    unit: usize,
) -> std::result::Result<Option<Bytesize>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Int(u64),
        Text(String),
    }

    match Option::<Raw>::deserialize(deserializer)? {
        None => Ok(None),
        Some(Raw::Int(0)) => Ok(None),
        Some(Raw::Int(n)) => {
            let n = usize::try_from(n).map_err(de::Error::custom)?;
            n.checked_mul(unit).map(|v| Some(Bytesize(v))).ok_or_else(|| de::Error::custom("byte size overflow"))
        }
        Some(Raw::Text(s)) => {
            let s = s.trim();
            if s.is_empty() {
                return Ok(None);
            }
            if let Ok(n) = s.parse::<usize>() {
                if n == 0 {
                    return Ok(None);
                }
                return n
                    .checked_mul(unit)
                    .map(|v| Some(Bytesize(v)))
                    .ok_or_else(|| de::Error::custom("byte size overflow"));
            }
            match to_bytesize(s) {
                0 => Err(de::Error::custom(format!("invalid byte size, {s}"))),
                v => Ok(Some(Bytesize(v))),
            }
        }
    }
}
