//! Conversion of the wall-clock `HH:MM` strings used by the rail upstream
//! into absolute instants.

use chrono::{DateTime, TimeZone, Utc};

use super::DepartureError;

/// Converts a local `HH:MM` departure time into an instant in `zone`.
///
/// The rail upstream provides departures up to two hours into the future,
/// so the clock time is initially assumed to be for the current day. When
/// the candidate lands more than two hours in the past the clock time is
/// for tomorrow; more than two hours in the future and it is for
/// yesterday. The rollover recomputes from the calendar date rather than
/// adding a day's worth of seconds, which keeps the result correct across
/// daylight-saving transitions.
pub fn convert_departure_time<Z: TimeZone>(
    now: &DateTime<Utc>,
    zone: &Z,
    local_time: &str,
) -> Result<DateTime<Z>, DepartureError> {
    if !super::CLOCK_TIME_RE.is_match(local_time) {
        return Err(DepartureError::InvalidLocalTime(local_time.to_string()));
    }

    let (hours_str, mins_str) = local_time
        .split_once(':')
        .ok_or_else(|| DepartureError::InvalidLocalTime(local_time.to_string()))?;
    let hours: u32 = hours_str
        .parse()
        .map_err(|_| DepartureError::InvalidLocalTime(local_time.to_string()))?;
    let mins: u32 = mins_str
        .parse()
        .map_err(|_| DepartureError::InvalidLocalTime(local_time.to_string()))?;

    let local_today = now.with_timezone(zone).date_naive();

    let departing_today = at_clock_time(zone, local_today, hours, mins, local_time)?;

    if now.clone() - departing_today.clone().with_timezone(&Utc) > chrono::Duration::hours(2) {
        let tomorrow = local_today
            .succ_opt()
            .ok_or_else(|| DepartureError::InvalidLocalTime(local_time.to_string()))?;
        return at_clock_time(zone, tomorrow, hours, mins, local_time);
    }

    if departing_today.clone().with_timezone(&Utc) - *now > chrono::Duration::hours(2) {
        let yesterday = local_today
            .pred_opt()
            .ok_or_else(|| DepartureError::InvalidLocalTime(local_time.to_string()))?;
        return at_clock_time(zone, yesterday, hours, mins, local_time);
    }

    Ok(departing_today)
}

fn at_clock_time<Z: TimeZone>(
    zone: &Z,
    date: chrono::NaiveDate,
    hours: u32,
    mins: u32,
    local_time: &str,
) -> Result<DateTime<Z>, DepartureError> {
    let naive = date
        .and_hms_opt(hours, mins, 0)
        .ok_or_else(|| DepartureError::InvalidLocalTime(local_time.to_string()))?;

    zone.from_local_datetime(&naive)
        .earliest()
        .ok_or_else(|| DepartureError::InvalidLocalTime(local_time.to_string()))
}
