//! The canonical departure record shared by every stage of the pipeline,
//! together with its sort orders and expiry rules.

use chrono::{DateTime, FixedOffset, Timelike, Utc};
use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};

pub mod display;
pub mod local_time;

lazy_static! {
    static ref SERVICE_NUMBER_RE: Regex =
        Regex::new(r"^([A-Z]+)?(?:([0-9]{1,3})?([A-Z])?)?$").unwrap();
    static ref STAND_RE: Regex =
        Regex::new(r"^180[A-Z0-9][A-Z]{2}(?:BS|IC|IN)([A-Z0-9]{2})[0-9]$").unwrap();
    static ref CLOCK_TIME_RE: Regex = Regex::new(r"^[0-9]{2}:[0-9]{2}$").unwrap();
}

#[derive(Debug, thiserror::Error)]
pub enum DepartureError {
    #[error("invalid service number: {0}")]
    InvalidServiceNumber(String),
    #[error("cannot parse departure time `{value}`: {source}")]
    InvalidDepartureTime {
        value: String,
        source: chrono::ParseError,
    },
    #[error("invalid local clock time `{0}`")]
    InvalidLocalTime(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum JourneyType {
    #[default]
    Bus,
    Train,
    Tram,
}

/// The leading three characters of an ATCO code carry the mode:
/// 910 is heavy rail, 940 is tram, anything else is bus.
pub fn journey_type_for_atcocode(atcocode: &str) -> JourneyType {
    match atcocode.get(0..3) {
        Some("910") => JourneyType::Train,
        Some("940") => JourneyType::Tram,
        _ => JourneyType::Bus,
    }
}

/// Departure contains a unique identifier for the journey at the location,
/// the aimed and expected departure time, the departure location,
/// the destination, the service number and the operator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct Departure {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub recorded_at_time: String,
    #[serde(default)]
    pub journey_type: JourneyType,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub journey_ref: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub aimed_departure_time: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected_departure_time: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub departure_status: Option<String>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub location_atcocode: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stand: Option<String>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub destination_atcocode: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub destination: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub service_number: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub operator_code: String,
}

/// Internal is the collection shape exchanged between pipeline stages.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Internal {
    #[serde(default)]
    pub departures: Vec<Departure>,
}

/// Three-level service number sort key. `None` orders before any value at
/// every level, which gives the prefix/digits/suffix order directly through
/// the derived `Ord`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct ServiceNumberKey {
    pub prefix: Option<String>,
    pub digits: Option<u16>,
    pub suffix: Option<String>,
}

impl Departure {
    /// Returns the effective departure time and whether it is a real-time
    /// estimate (true iff `expectedDepartureTime` is set).
    pub fn departure_time(&self) -> Result<(DateTime<FixedOffset>, bool), DepartureError> {
        if let Some(expected) = &self.expected_departure_time {
            let t = DateTime::parse_from_rfc3339(expected).map_err(|source| {
                DepartureError::InvalidDepartureTime {
                    value: expected.clone(),
                    source,
                }
            })?;
            return Ok((t, true));
        }

        let t = DateTime::parse_from_rfc3339(&self.aimed_departure_time).map_err(|source| {
            DepartureError::InvalidDepartureTime {
                value: self.aimed_departure_time.clone(),
                source,
            }
        })?;
        Ok((t, false))
    }

    /// A bus or tram departure expires once its effective time is strictly
    /// in the past. A rail departure additionally honours its textual
    /// status: "Delayed" never expires, an HH:MM status is a revised time
    /// compared against the current whole minute, and anything else falls
    /// back to the effective time compared against the current whole minute.
    pub fn is_expired(&self, now: DateTime<Utc>) -> Result<bool, DepartureError> {
        let (departure_time, _) = self.departure_time()?;

        if self.journey_type == JourneyType::Train {
            let status = self.departure_status.as_deref().unwrap_or("");

            if status == "Delayed" {
                return Ok(false);
            }

            let now_minute = truncate_to_minute(now);

            if CLOCK_TIME_RE.is_match(status) {
                let revised =
                    local_time::convert_departure_time(&now, departure_time.offset(), status)?;
                return Ok(revised.with_timezone(&Utc) < now_minute);
            }

            return Ok(departure_time.with_timezone(&Utc) < now_minute);
        }

        Ok(departure_time.with_timezone(&Utc) < now)
    }

    /// Decomposes the service number into optional prefix, digits and
    /// suffix. A value the grammar does not cover is an invariant violation.
    pub fn service_number_key(&self) -> Result<ServiceNumberKey, DepartureError> {
        let upper = self.service_number.to_uppercase();
        let captures = SERVICE_NUMBER_RE
            .captures(&upper)
            .ok_or_else(|| DepartureError::InvalidServiceNumber(self.service_number.clone()))?;

        let digits = match captures.get(2) {
            Some(m) => Some(m.as_str().parse::<u16>().map_err(|_| {
                DepartureError::InvalidServiceNumber(self.service_number.clone())
            })?),
            None => None,
        };

        Ok(ServiceNumberKey {
            prefix: captures.get(1).map(|m| m.as_str().to_string()),
            digits,
            suffix: captures.get(3).map(|m| m.as_str().to_string()),
        })
    }

    /// Extracts the bus station stand from the location code when it
    /// matches the stand-stop pattern; a leading zero is stripped down to
    /// the single digit.
    pub fn stand(&self) -> Option<String> {
        let upper = self.location_atcocode.to_uppercase();
        let captures = STAND_RE.captures(&upper)?;
        let stand = captures.get(1)?.as_str();

        match stand.strip_prefix('0') {
            Some(rest) => Some(rest.to_string()),
            None => Some(stand.to_string()),
        }
    }
}

/// Drops every expired departure, preserving order. Returns how many were
/// removed. A record that cannot be evaluated fails the whole batch before
/// anything is removed.
pub fn remove_expired_departures(
    now: DateTime<Utc>,
    departures: &mut Internal,
) -> Result<usize, DepartureError> {
    let mut expired = Vec::with_capacity(departures.departures.len());
    for departure in &departures.departures {
        expired.push(departure.is_expired(now)?);
    }

    let before = departures.departures.len();
    let mut flags = expired.into_iter();
    departures
        .departures
        .retain(|_| !flags.next().unwrap_or(false));

    Ok(before - departures.departures.len())
}

fn truncate_to_minute(t: DateTime<Utc>) -> DateTime<Utc> {
    t - chrono::Duration::seconds(i64::from(t.second()))
        - chrono::Duration::nanoseconds(i64::from(t.nanosecond()))
}

/// Sorts by effective departure time, tie-broken by service number order
/// and finally by journey reference. This is the canonical cached order.
pub fn sort_by_departure_time(departures: &mut Vec<Departure>) -> Result<(), DepartureError> {
    let mut keys = Vec::with_capacity(departures.len());
    for departure in departures.iter() {
        let (t, _) = departure.departure_time()?;
        keys.push((t.with_timezone(&Utc), departure.service_number_key()?));
    }

    let mut keyed: Vec<_> = keys.into_iter().zip(std::mem::take(departures)).collect();
    keyed.sort_by(|(ka, a), (kb, b)| {
        ka.0.cmp(&kb.0)
            .then_with(|| ka.1.cmp(&kb.1))
            .then_with(|| a.journey_ref.cmp(&b.journey_ref))
    });
    departures.extend(keyed.into_iter().map(|(_, d)| d));

    Ok(())
}

/// Sorts by service number order, tie-broken by effective departure time
/// and finally by journey reference.
pub fn sort_by_service_number(departures: &mut Vec<Departure>) -> Result<(), DepartureError> {
    let mut keys = Vec::with_capacity(departures.len());
    for departure in departures.iter() {
        let (t, _) = departure.departure_time()?;
        keys.push((departure.service_number_key()?, t.with_timezone(&Utc)));
    }

    let mut keyed: Vec<_> = keys.into_iter().zip(std::mem::take(departures)).collect();
    keyed.sort_by(|(ka, a), (kb, b)| {
        ka.0.cmp(&kb.0)
            .then_with(|| ka.1.cmp(&kb.1))
            .then_with(|| a.journey_ref.cmp(&b.journey_ref))
    });
    departures.extend(keyed.into_iter().map(|(_, d)| d));

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn departure(service_number: &str, aimed: &str, journey_ref: &str) -> Departure {
        Departure {
            journey_type: JourneyType::Bus,
            journey_ref: journey_ref.to_string(),
            aimed_departure_time: aimed.to_string(),
            service_number: service_number.to_string(),
            ..Departure::default()
        }
    }

    #[test]
    fn journey_type_derives_from_atco_prefix() {
        assert_eq!(
            journey_type_for_atcocode("9100MNCRPIC"),
            JourneyType::Train
        );
        assert_eq!(journey_type_for_atcocode("9400ZZMASTP"), JourneyType::Tram);
        assert_eq!(journey_type_for_atcocode("1800BNIN0C1"), JourneyType::Bus);
        assert_eq!(journey_type_for_atcocode("18"), JourneyType::Bus);
    }

    #[test]
    fn service_number_decomposes() {
        let key = departure("A12B", "", "").service_number_key().unwrap();
        assert_eq!(key.prefix.as_deref(), Some("A"));
        assert_eq!(key.digits, Some(12));
        assert_eq!(key.suffix.as_deref(), Some("B"));

        let key = departure("525", "", "").service_number_key().unwrap();
        assert_eq!(key.prefix, None);
        assert_eq!(key.digits, Some(525));
        assert_eq!(key.suffix, None);

        // A purely alphabetic value is all prefix.
        let key = departure("AB", "", "").service_number_key().unwrap();
        assert_eq!(key.prefix.as_deref(), Some("AB"));
        assert_eq!(key.digits, None);
        assert_eq!(key.suffix, None);

        let key = departure("x39a", "", "").service_number_key().unwrap();
        assert_eq!(key.prefix.as_deref(), Some("X"));
        assert_eq!(key.digits, Some(39));
        assert_eq!(key.suffix.as_deref(), Some("A"));
    }

    #[test]
    fn service_number_rejects_invalid_values() {
        assert!(departure("12/3", "", "").service_number_key().is_err());
        assert!(departure("1234", "", "").service_number_key().is_err());
        assert!(departure("A 12", "", "").service_number_key().is_err());
    }

    #[test]
    fn stand_extracted_from_stand_stops() {
        let mut d = departure("", "", "");

        d.location_atcocode = "1800BNIN0C1".to_string();
        assert_eq!(d.stand().as_deref(), Some("C"));

        d.location_atcocode = "1800SHIC0A2".to_string();
        assert_eq!(d.stand().as_deref(), Some("A"));

        d.location_atcocode = "1800WABS1T3".to_string();
        assert_eq!(d.stand().as_deref(), Some("1T"));

        // An on-street stop is not a stand.
        d.location_atcocode = "1800WA12481".to_string();
        assert_eq!(d.stand(), None);

        d.location_atcocode = "9100MNCRPIC".to_string();
        assert_eq!(d.stand(), None);
    }

    #[test]
    fn departure_time_prefers_expected() {
        let mut d = departure("12", "2023-05-01T10:00:00+01:00", "j1");
        let (t, real_time) = d.departure_time().unwrap();
        assert!(!real_time);
        assert_eq!(t.to_rfc3339(), "2023-05-01T10:00:00+01:00");

        d.expected_departure_time = Some("2023-05-01T10:04:00+01:00".to_string());
        let (t, real_time) = d.departure_time().unwrap();
        assert!(real_time);
        assert_eq!(t.to_rfc3339(), "2023-05-01T10:04:00+01:00");
    }

    #[test]
    fn bus_expiry_is_strictly_before_now() {
        let now = Utc.with_ymd_and_hms(2023, 5, 1, 10, 0, 30).unwrap();

        let d = departure("12", "2023-05-01T10:00:30Z", "j1");
        assert!(!d.is_expired(now).unwrap());

        let d = departure("12", "2023-05-01T10:00:29Z", "j1");
        assert!(d.is_expired(now).unwrap());
    }

    #[test]
    fn rail_expiry_truncates_now_to_the_minute() {
        let now = Utc.with_ymd_and_hms(2023, 5, 1, 10, 0, 45).unwrap();

        let mut d = departure("", "2023-05-01T10:00:00Z", "svc1");
        d.journey_type = JourneyType::Train;
        d.departure_status = Some("On time".to_string());

        // Exactly at the minute boundary is not expired.
        assert!(!d.is_expired(now).unwrap());

        // A minute past the boundary is.
        d.aimed_departure_time = "2023-05-01T09:59:00Z".to_string();
        assert!(d.is_expired(now).unwrap());
    }

    #[test]
    fn rail_delayed_never_expires() {
        let now = Utc.with_ymd_and_hms(2023, 5, 1, 10, 0, 0).unwrap();

        let mut d = departure("", "2023-05-01T08:00:00Z", "svc1");
        d.journey_type = JourneyType::Train;
        d.departure_status = Some("Delayed".to_string());

        assert!(!d.is_expired(now).unwrap());
    }

    #[test]
    fn rail_clock_time_status_is_a_revised_time() {
        let now = Utc.with_ymd_and_hms(2023, 5, 1, 10, 0, 0).unwrap();

        let mut d = departure("", "2023-05-01T09:30:00Z", "svc1");
        d.journey_type = JourneyType::Train;

        // Revised to later than now: still valid.
        d.departure_status = Some("10:30".to_string());
        assert!(!d.is_expired(now).unwrap());

        // Revised to earlier than the current minute: gone.
        d.departure_status = Some("09:45".to_string());
        assert!(d.is_expired(now).unwrap());

        // Revised to exactly the current minute: not expired.
        d.departure_status = Some("10:00".to_string());
        assert!(!d.is_expired(now).unwrap());
    }

    #[test]
    fn sort_by_departure_time_orders_by_effective_time() {
        let mut departures = vec![
            departure("12", "2023-05-01T10:20:00Z", "c"),
            {
                let mut d = departure("12", "2023-05-01T10:30:00Z", "a");
                d.expected_departure_time = Some("2023-05-01T10:05:00Z".to_string());
                d
            },
            departure("12", "2023-05-01T10:10:00Z", "b"),
        ];

        sort_by_departure_time(&mut departures).unwrap();

        let refs: Vec<&str> = departures.iter().map(|d| d.journey_ref.as_str()).collect();
        assert_eq!(refs, vec!["a", "b", "c"]);
    }

    #[test]
    fn sort_ties_break_on_journey_ref() {
        let mut departures = vec![
            departure("12", "2023-05-01T10:00:00Z", "b"),
            departure("12", "2023-05-01T10:00:00Z", "a"),
        ];

        sort_by_departure_time(&mut departures).unwrap();

        assert_eq!(departures[0].journey_ref, "a");
        assert_eq!(departures[1].journey_ref, "b");
    }

    #[test]
    fn service_number_order_is_prefix_digits_suffix() {
        let expected = vec![
            "12", "12A", "12B", "123", "123A", "123B", "A12", "A12A", "A12B", "B12", "B12A",
            "B12B",
        ];

        // Same instant throughout so only the service number decides.
        let mut departures: Vec<Departure> = expected
            .iter()
            .rev()
            .map(|sn| departure(sn, "2023-05-01T10:00:00Z", *sn))
            .collect();

        sort_by_service_number(&mut departures).unwrap();

        let order: Vec<&str> = departures
            .iter()
            .map(|d| d.service_number.as_str())
            .collect();
        assert_eq!(order, expected);
    }

    #[test]
    fn remove_expired_keeps_order_and_counts() {
        let now = Utc.with_ymd_and_hms(2023, 5, 1, 10, 0, 0).unwrap();

        let mut internal = Internal {
            departures: vec![
                departure("12", "2023-05-01T09:58:00Z", "past"),
                departure("12", "2023-05-01T10:05:00Z", "future1"),
                departure("12", "2023-05-01T09:59:00Z", "past2"),
                departure("12", "2023-05-01T10:10:00Z", "future2"),
            ],
        };

        let removed = remove_expired_departures(now, &mut internal).unwrap();

        assert_eq!(removed, 2);
        let refs: Vec<&str> = internal
            .departures
            .iter()
            .map(|d| d.journey_ref.as_str())
            .collect();
        assert_eq!(refs, vec!["future1", "future2"]);
    }

    #[test]
    fn departure_round_trips_through_cache_json() {
        let d = Departure {
            recorded_at_time: "2023-05-01T09:59:00Z".to_string(),
            journey_type: JourneyType::Bus,
            journey_ref: "525_in_2023-05-01_1005".to_string(),
            aimed_departure_time: "2023-05-01T10:05:00Z".to_string(),
            expected_departure_time: Some("2023-05-01T10:07:00Z".to_string()),
            departure_status: None,
            location_atcocode: "1800BNIN0C1".to_string(),
            stand: Some("C".to_string()),
            destination_atcocode: "1800WA12481".to_string(),
            destination: "Hobbiton".to_string(),
            service_number: "525".to_string(),
            operator_code: "VISB".to_string(),
        };

        let encoded = serde_json::to_string(&d).unwrap();
        let decoded: Departure = serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded, d);

        // Unset fields are omitted from the wire form entirely.
        assert!(!encoded.contains("departureStatus"));
    }
}
