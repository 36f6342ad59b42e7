//! Parsing for CLI duration values (e.g. "30s", "5m", "100m", "2h").

use std::str::FromStr;
use std::time::Duration;

use crate::{CifuzzError, CifuzzResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CifuzzDuration(pub Duration);

impl FromStr for CifuzzDuration {
    type Err = CifuzzError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        parse_duration(s).map(Self)
    }
}

pub fn parse_duration(input: &str) -> CifuzzResult<Duration> {
    let s = input.trim();
    if s.is_empty() {
        return Err(CifuzzError::Usage("empty duration".to_string()));
    }

    let (num_part, unit_part) = split_num_unit(s)?;
    let value: u64 = num_part.parse().map_err(|_| {
        CifuzzError::Usage(format!(
            "invalid duration number: {num_part} (from {input:?})"
        ))
    })?;

    let dur = match unit_part {
        // A bare number is interpreted as seconds.
        "" | "s" => Duration::from_secs(value),
        "ms" => Duration::from_millis(value),
        "m" => Duration::from_secs(value.saturating_mul(60)),
        "h" => Duration::from_secs(value.saturating_mul(60 * 60)),
        _ => {
            return Err(CifuzzError::Usage(format!(
                "invalid duration unit {unit_part:?} (expected ms|s|m|h)"
            )));
        }
    };

    Ok(dur)
}

fn split_num_unit(s: &str) -> CifuzzResult<(&str, &str)> {
    let mut idx = 0usize;
    for (i, ch) in s.char_indices() {
        if ch.is_ascii_digit() {
            idx = i + ch.len_utf8();
            continue;
        }
        idx = i;
        break;
    }

    if idx == 0 {
        return Err(CifuzzError::Usage(format!(
            "invalid duration {s:?} (missing number)"
        )));
    }

    Ok((&s[..idx], &s[idx..]))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_duration_examples() {
        assert_eq!(parse_duration("30s").unwrap(), Duration::from_secs(30));
        assert_eq!(parse_duration("100m").unwrap(), Duration::from_secs(6000));
        assert_eq!(parse_duration("2h").unwrap(), Duration::from_secs(7200));
        assert_eq!(parse_duration("250ms").unwrap(), Duration::from_millis(250));
        assert_eq!(parse_duration("45").unwrap(), Duration::from_secs(45));
    }

    #[test]
    fn parse_duration_rejects_garbage() {
        assert!(parse_duration("").is_err());
        assert!(parse_duration("m5").is_err());
        assert!(parse_duration("5d").is_err());
    }
}
