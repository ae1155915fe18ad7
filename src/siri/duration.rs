//! ISO-8601 duration handling for SIRI heartbeat intervals and preview
//! windows. Covers the `PnYnMnWnDTnHnMnS` calendar form with the usual
//! nominal day counts (a year is 365 days, a month 30).

use lazy_static::lazy_static;
use regex::Regex;

lazy_static! {
    static ref DURATION_RE: Regex = Regex::new(
        r"^P(?:(\d+)Y)?(?:(\d+)M)?(?:(\d+)W)?(?:(\d+)D)?(?:T(?:(\d+)H)?(?:(\d+)M)?(?:(\d+)S)?)?$"
    )
    .unwrap();
}

#[derive(Debug, thiserror::Error)]
#[error("invalid ISO-8601 duration `{0}`")]
pub struct DurationParseError(String);

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IsoDuration {
    pub years: u64,
    pub months: u64,
    pub weeks: u64,
    pub days: u64,
    pub hours: u64,
    pub minutes: u64,
    pub seconds: u64,
}

impl IsoDuration {
    pub fn parse(input: &str) -> Result<Self, DurationParseError> {
        let captures = DURATION_RE
            .captures(input)
            .ok_or_else(|| DurationParseError(input.to_string()))?;

        if captures.iter().skip(1).all(|c| c.is_none()) {
            return Err(DurationParseError(input.to_string()));
        }

        let field = |i: usize| -> u64 {
            captures
                .get(i)
                .and_then(|m| m.as_str().parse().ok())
                .unwrap_or(0)
        };

        Ok(IsoDuration {
            years: field(1),
            months: field(2),
            weeks: field(3),
            days: field(4),
            hours: field(5),
            minutes: field(6),
            seconds: field(7),
        })
    }

    pub fn to_std(self) -> std::time::Duration {
        let days = self.years * 365 + self.months * 30 + self.weeks * 7 + self.days;
        std::time::Duration::from_secs(
            days * 86_400 + self.hours * 3_600 + self.minutes * 60 + self.seconds,
        )
    }
}

impl std::fmt::Display for IsoDuration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "P")?;
        if self.years > 0 {
            write!(f, "{}Y", self.years)?;
        }
        if self.months > 0 {
            write!(f, "{}M", self.months)?;
        }
        if self.weeks > 0 {
            write!(f, "{}W", self.weeks)?;
        }
        if self.days > 0 {
            write!(f, "{}D", self.days)?;
        }
        if self.hours > 0 || self.minutes > 0 || self.seconds > 0 || self.to_std().is_zero() {
            write!(f, "T")?;
            if self.hours > 0 {
                write!(f, "{}H", self.hours)?;
            }
            if self.minutes > 0 {
                write!(f, "{}M", self.minutes)?;
            }
            if self.seconds > 0 || self.to_std().is_zero() {
                write!(f, "{}S", self.seconds)?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn parses_common_intervals() {
        assert_eq!(
            IsoDuration::parse("PT5M").unwrap().to_std(),
            Duration::from_secs(300)
        );
        assert_eq!(
            IsoDuration::parse("PT1M").unwrap().to_std(),
            Duration::from_secs(60)
        );
        assert_eq!(
            IsoDuration::parse("PT30S").unwrap().to_std(),
            Duration::from_secs(30)
        );
        assert_eq!(
            IsoDuration::parse("P1DT2H").unwrap().to_std(),
            Duration::from_secs(86_400 + 7_200)
        );
        assert_eq!(
            IsoDuration::parse("P2W").unwrap().to_std(),
            Duration::from_secs(14 * 86_400)
        );
    }

    #[test]
    fn rejects_malformed_durations() {
        assert!(IsoDuration::parse("").is_err());
        assert!(IsoDuration::parse("P").is_err());
        assert!(IsoDuration::parse("5M").is_err());
        assert!(IsoDuration::parse("PT5X").is_err());
    }

    #[test]
    fn formats_canonically() {
        assert_eq!(IsoDuration::parse("PT5M").unwrap().to_string(), "PT5M");
        assert_eq!(IsoDuration::parse("P1DT2H").unwrap().to_string(), "P1DT2H");
        let round_trip = IsoDuration::parse("PT30M").unwrap().to_string();
        assert_eq!(IsoDuration::parse(&round_trip).unwrap().to_std(), Duration::from_secs(1800));
    }
}
