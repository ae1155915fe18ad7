//! Builds the "next departures" board for one location from the cached
//! list, backfilling past expired entries at the head of the window.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use lazy_static::lazy_static;
use regex::Regex;

use departures_service::departures::display::{DepartureDisplay, Output};
use departures_service::departures::{
    journey_type_for_atcocode, Departure, DepartureError, Internal,
};
use departures_service::repository::{KeyValueStore, StoreError};

lazy_static! {
    static ref ATCOCODE_RE: Regex = Regex::new(r"^[A-Z0-9]{8,12}$").unwrap();
}

#[derive(Debug, thiserror::Error)]
pub enum PresenterError {
    #[error("atcocode value `{0}` is not valid")]
    InvalidAtcocode(String),
    #[error("top value `{0}` is not valid")]
    InvalidTop(String),
    #[error("cache error: {0}")]
    Store(#[from] StoreError),
    #[error("cannot unmarshal cached record: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("invalid departure data: {0}")]
    Departure(#[from] DepartureError),
}

impl PresenterError {
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            PresenterError::InvalidAtcocode(_) | PresenterError::InvalidTop(_)
        )
    }
}

pub struct Presenter {
    pub store: Arc<dyn KeyValueStore>,
}

impl Presenter {
    pub async fn board(
        &self,
        atcocode: &str,
        top: Option<&str>,
    ) -> Result<Output, PresenterError> {
        let top_str = top.unwrap_or("10");
        let top: i64 = top_str
            .parse()
            .map_err(|_| PresenterError::InvalidTop(top_str.to_string()))?;

        if !validate_atcocode(atcocode) {
            return Err(PresenterError::InvalidAtcocode(atcocode.to_string()));
        }
        if top < 1 {
            return Err(PresenterError::InvalidTop(top_str.to_string()));
        }

        let now = Utc::now();
        let mut departures = Internal::default();
        let mut start = 0i64;
        let mut end = top;

        // The cached list is sorted ascending, so expiry is a contiguous
        // prefix of each window. Advance the window until the board is
        // full or the cache has nothing more to give.
        loop {
            self.assign_next_departures(&mut departures, atcocode, start, end)
                .await?;

            let removed = remove_expired_from_head(now, &mut departures)?;

            if removed == 0 || departures.departures.len() as i64 == top {
                break;
            }

            start += top;
            end += removed;
        }

        let mut output = Output {
            journey_type: journey_type_for_atcocode(atcocode),
            departures: Vec::with_capacity(departures.departures.len()),
        };

        for departure in &departures.departures {
            output.departures.push(DepartureDisplay {
                departure_time: transform_departure_time(now, departure)?,
                stand: departure.stand.clone(),
                service_number: departure.service_number.clone(),
                destination: departure.destination.clone(),
                departure_status: departure.departure_status.clone(),
            });
        }

        Ok(output)
    }

    async fn assign_next_departures(
        &self,
        departures: &mut Internal,
        atcocode: &str,
        start: i64,
        end: i64,
    ) -> Result<(), PresenterError> {
        log::debug!("assign next departures for {atcocode} (start: {start}; end: {end})");

        let records = self.store.list_range(atcocode, start, end - 1).await?;
        for record in records {
            departures.departures.push(serde_json::from_str(&record)?);
        }
        Ok(())
    }
}

fn validate_atcocode(atcocode: &str) -> bool {
    ATCOCODE_RE.is_match(&atcocode.to_uppercase())
}

/// Removes the expired prefix, trusting ascending order, and reports how
/// many entries went.
fn remove_expired_from_head(
    now: DateTime<Utc>,
    departures: &mut Internal,
) -> Result<i64, PresenterError> {
    let mut expired = 0usize;
    for departure in &departures.departures {
        if !departure.is_expired(now)? {
            break;
        }
        expired += 1;
    }

    log::debug!("removed {expired} expired departure(s)");

    departures.departures.drain(0..expired);
    Ok(expired as i64)
}

/// Real-time entries render as a countdown ("Approaching" when due),
/// scheduled entries as the aimed wall-clock time.
fn transform_departure_time(
    now: DateTime<Utc>,
    departure: &Departure,
) -> Result<String, PresenterError> {
    let (departure_time, is_real_time) = departure.departure_time()?;

    if is_real_time {
        let wait = (departure_time.with_timezone(&Utc) - now).num_minutes();

        if wait == 0 {
            return Ok("Approaching".to_string());
        }

        let unit = if wait == 1 { "min" } else { "mins" };
        return Ok(format!("{wait} {unit}"));
    }

    Ok(departure_time.format("%H:%M").to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, SecondsFormat, TimeZone};
    use departures_service::departures::JourneyType;
    use departures_service::repository::memory::MemoryStore;

    fn departure(journey_ref: &str, aimed: DateTime<Utc>, expected: Option<DateTime<Utc>>) -> Departure {
        Departure {
            journey_type: JourneyType::Bus,
            journey_ref: journey_ref.to_string(),
            aimed_departure_time: aimed.to_rfc3339_opts(SecondsFormat::Secs, true),
            expected_departure_time: expected
                .map(|t| t.to_rfc3339_opts(SecondsFormat::Secs, true)),
            service_number: "12".to_string(),
            destination: "Hobbiton".to_string(),
            ..Departure::default()
        }
    }

    fn seeded(store: &MemoryStore, key: &str, departures: Vec<Departure>) {
        store.set_list(
            key,
            departures
                .iter()
                .map(|d| serde_json::to_string(d).unwrap())
                .collect(),
        );
    }

    #[test]
    fn atcocode_validation() {
        assert!(validate_atcocode("1800BNIN0C1"));
        assert!(validate_atcocode("9100MNCRPIC"));
        assert!(validate_atcocode("1800bnin0c1"));
        assert!(!validate_atcocode("1800"));
        assert!(!validate_atcocode("1800BNIN0C1TOOLONG"));
        assert!(!validate_atcocode("1800 BNIN"));
    }

    #[test]
    fn countdown_formatting() {
        let now = Utc.with_ymd_and_hms(2023, 5, 1, 10, 0, 0).unwrap();

        let d = departure("j", now + Duration::minutes(9), Some(now + Duration::seconds(30)));
        assert_eq!(transform_departure_time(now, &d).unwrap(), "Approaching");

        let d = departure("j", now, Some(now + Duration::seconds(90)));
        assert_eq!(transform_departure_time(now, &d).unwrap(), "1 min");

        let d = departure("j", now, Some(now + Duration::minutes(7)));
        assert_eq!(transform_departure_time(now, &d).unwrap(), "7 mins");
    }

    #[test]
    fn scheduled_times_render_as_wall_clock() {
        let now = Utc.with_ymd_and_hms(2023, 5, 1, 10, 0, 0).unwrap();

        let mut d = departure("j", now + Duration::minutes(30), None);
        assert_eq!(transform_departure_time(now, &d).unwrap(), "10:30");

        // The aimed time keeps its own offset.
        d.aimed_departure_time = "2023-05-01T11:45:00+01:00".to_string();
        assert_eq!(transform_departure_time(now, &d).unwrap(), "11:45");
    }

    #[tokio::test]
    async fn backfills_past_an_expired_head_entry() {
        let store = Arc::new(MemoryStore::new());
        let now = Utc::now();

        // Four cached entries; the first expired five seconds ago.
        seeded(
            &store,
            "1800BNIN0C1",
            vec![
                departure("expired", now - Duration::minutes(10), Some(now - Duration::seconds(5))),
                departure("a", now + Duration::minutes(5), None),
                departure("b", now + Duration::minutes(10), None),
                departure("c", now + Duration::minutes(15), None),
            ],
        );

        let presenter = Presenter {
            store: store as Arc<dyn KeyValueStore>,
        };

        let output = presenter.board("1800BNIN0C1", Some("3")).await.unwrap();

        assert_eq!(output.journey_type, JourneyType::Bus);
        assert_eq!(output.departures.len(), 3);

        // All three are scheduled entries rendered as wall-clock times.
        for row in &output.departures {
            assert_eq!(row.departure_time.len(), 5);
            assert!(row.departure_time.contains(':'));
        }
    }

    #[tokio::test]
    async fn backfill_stops_when_the_cache_is_exhausted() {
        let store = Arc::new(MemoryStore::new());
        let now = Utc::now();

        seeded(
            &store,
            "1800BNIN0C1",
            vec![
                departure("expired", now - Duration::minutes(10), Some(now - Duration::seconds(5))),
                departure("a", now + Duration::minutes(5), None),
            ],
        );

        let presenter = Presenter {
            store: store as Arc<dyn KeyValueStore>,
        };

        let output = presenter.board("1800BNIN0C1", Some("3")).await.unwrap();
        assert_eq!(output.departures.len(), 1);
    }

    #[tokio::test]
    async fn empty_cache_yields_an_empty_board() {
        let presenter = Presenter {
            store: Arc::new(MemoryStore::new()) as Arc<dyn KeyValueStore>,
        };

        let output = presenter.board("1800BNIN0C1", None).await.unwrap();
        assert_eq!(output.departures.len(), 0);
        assert_eq!(output.journey_type, JourneyType::Bus);
    }

    #[tokio::test]
    async fn validation_failures_name_the_offending_value() {
        let presenter = Presenter {
            store: Arc::new(MemoryStore::new()) as Arc<dyn KeyValueStore>,
        };

        let err = presenter.board("bad", None).await.unwrap_err();
        assert!(err.is_validation());
        assert_eq!(err.to_string(), "atcocode value `bad` is not valid");

        let err = presenter.board("1800BNIN0C1", Some("0")).await.unwrap_err();
        assert!(err.is_validation());

        let err = presenter
            .board("1800BNIN0C1", Some("ten"))
            .await
            .unwrap_err();
        assert!(err.is_validation());
    }

    #[tokio::test]
    async fn rail_boards_keep_the_departure_status() {
        let store = Arc::new(MemoryStore::new());
        let now = Utc::now();

        let mut d = departure("svc-1", now + Duration::minutes(20), None);
        d.journey_type = JourneyType::Train;
        d.departure_status = Some("On time".to_string());
        d.stand = Some("13".to_string());
        seeded(&store, "9100MNCRPIC", vec![d]);

        let presenter = Presenter {
            store: store as Arc<dyn KeyValueStore>,
        };

        let output = presenter.board("9100MNCRPIC", None).await.unwrap();
        assert_eq!(output.journey_type, JourneyType::Train);
        assert_eq!(output.departures[0].departure_status.as_deref(), Some("On time"));
        assert_eq!(output.departures[0].stand.as_deref(), Some("13"));
    }
}
