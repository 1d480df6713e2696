//! Human-readable durations ("45s", "30m", "6h", "1d") for timeouts and
//! sync intervals.

use std::time::Duration;

use anyhow::{Context, Result};
use serde::{de, Deserialize, Deserializer, Serializer};

const UNITS: [(char, u64); 4] = [('d', 86_400), ('h', 3_600), ('m', 60), ('s', 1)];

/// Parse a duration string made of a whole number and a unit suffix.
///
/// Supported units are `d`, `h`, `m` and `s`. Input is case-insensitive and
/// surrounding whitespace is ignored.
///
/// ```
/// use banksync::duration::parse_duration;
/// use std::time::Duration;
///
/// assert_eq!(parse_duration("45s").unwrap(), Duration::from_secs(45));
/// assert_eq!(parse_duration("6h").unwrap(), Duration::from_secs(6 * 3600));
/// ```
pub fn parse_duration(s: &str) -> Result<Duration> {
    let s = s.trim().to_ascii_lowercase();
    let unit = s.chars().last().context("Duration is empty")?;
    let (_, multiplier) = UNITS
        .iter()
        .find(|(suffix, _)| *suffix == unit)
        .context("Duration must end with d, h, m, or s")?;

    let number = &s[..s.len() - unit.len_utf8()];
    let value: u64 = number
        .parse()
        .with_context(|| format!("Invalid number in duration: {s:?}"))?;
    let secs = value
        .checked_mul(*multiplier)
        .context("Duration is too large")?;

    Ok(Duration::from_secs(secs))
}

/// Format a duration using the largest unit that divides it evenly.
pub fn format_duration(d: Duration) -> String {
    let secs = d.as_secs();
    for (suffix, multiplier) in UNITS {
        if secs >= multiplier && secs % multiplier == 0 {
            return format!("{}{suffix}", secs / multiplier);
        }
    }
    format!("{secs}s")
}

/// Serde deserializer for duration strings.
pub fn deserialize_duration<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    let s = String::deserialize(deserializer)?;
    parse_duration(&s).map_err(de::Error::custom)
}

/// Serde serializer producing the same compact form `deserialize_duration` accepts.
pub fn serialize_duration<S>(d: &Duration, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    serializer.serialize_str(&format_duration(*d))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Serialize;

    #[test]
    fn parses_each_unit() {
        assert_eq!(parse_duration("1d").unwrap(), Duration::from_secs(86_400));
        assert_eq!(parse_duration("2h").unwrap(), Duration::from_secs(7_200));
        assert_eq!(parse_duration("30m").unwrap(), Duration::from_secs(1_800));
        assert_eq!(parse_duration("45s").unwrap(), Duration::from_secs(45));
    }

    #[test]
    fn ignores_case_and_whitespace() {
        assert_eq!(parse_duration(" 6H ").unwrap(), Duration::from_secs(6 * 3600));
    }

    #[test]
    fn rejects_bad_input() {
        assert!(parse_duration("").is_err());
        assert!(parse_duration("10").is_err());
        assert!(parse_duration("1w").is_err());
        assert!(parse_duration("-5s").is_err());
        assert!(parse_duration("1.5h").is_err());
        assert!(parse_duration(&format!("{}d", u64::MAX)).is_err());
    }

    #[test]
    fn formats_with_largest_even_unit() {
        assert_eq!(format_duration(Duration::from_secs(86_400)), "1d");
        assert_eq!(format_duration(Duration::from_secs(90)), "90s");
        assert_eq!(format_duration(Duration::from_secs(120)), "2m");
        assert_eq!(format_duration(Duration::ZERO), "0s");
    }

    #[test]
    fn serde_helpers_work_with_toml() {
        #[derive(Deserialize, Serialize)]
        struct Timeouts {
            #[serde(
                deserialize_with = "deserialize_duration",
                serialize_with = "serialize_duration"
            )]
            call: Duration,
        }

        let parsed: Timeouts = toml::from_str(r#"call = "45s""#).unwrap();
        assert_eq!(parsed.call, Duration::from_secs(45));
        assert_eq!(toml::to_string(&parsed).unwrap().trim(), r#"call = "45s""#);
    }
}
