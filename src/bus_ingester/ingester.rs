//! Merges polled bus departures into the per-location cache: rewrite
//! destinations from the reference data, group by stop and stop area, and
//! atomically replace each affected list.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::Utc;
use futures::future::join_all;

use departures_service::departures::{
    remove_expired_departures, sort_by_departure_time, Departure, DepartureError, Internal,
};
use departures_service::pubsub::SnsEvent;
use departures_service::repository::{KeyValueStore, StoreError};

#[derive(Debug, thiserror::Error)]
pub enum IngestError {
    #[error("could not unmarshal new departures: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("invalid departure data: {0}")]
    Departure(#[from] DepartureError),
    #[error("cache error for location `{location}`: {source}")]
    Store {
        location: String,
        #[source]
        source: StoreError,
    },
    #[error("cannot look up reference data: {0}")]
    Reference(#[from] StoreError),
    #[error("an error occurred performing a concurrent operation: see previous log output")]
    Aggregate,
}

/// Reference lookups memoised for the lifetime of one event; a miss is
/// cached as a miss.
#[derive(Default)]
struct Memos {
    circular_services: Mutex<HashMap<String, Option<String>>>,
    locality_names: Mutex<HashMap<String, Option<String>>>,
    stops_in_area: Mutex<HashMap<String, Option<String>>>,
}

pub struct Ingester {
    pub departures: Arc<dyn KeyValueStore>,
    pub locality_names: Arc<dyn KeyValueStore>,
    pub stops_in_area: Arc<dyn KeyValueStore>,
    pub circular_services: Arc<dyn KeyValueStore>,
}

impl Ingester {
    /// Processes every record in the event concurrently and returns a
    /// single aggregate failure if any of them failed.
    pub async fn handle(&self, event: SnsEvent) -> Result<(), IngestError> {
        log::debug!("handle event with {} record(s)", event.records.len());

        let memos = Memos::default();

        let results = join_all(
            event
                .records
                .iter()
                .map(|record| self.process_record(&record.sns.message, &memos)),
        )
        .await;

        let mut failed = false;
        for errors in results {
            for error in errors {
                log::error!("{error}");
                failed = true;
            }
        }

        if failed {
            return Err(IngestError::Aggregate);
        }

        log::debug!("handle completed");
        Ok(())
    }

    async fn process_record(&self, message: &str, memos: &Memos) -> Vec<IngestError> {
        let mut new_departures: Internal = match serde_json::from_str(message) {
            Ok(departures) => departures,
            Err(e) => return vec![IngestError::Decode(e)],
        };

        if let Err(e) = remove_expired_departures(Utc::now(), &mut new_departures) {
            return vec![IngestError::Departure(e)];
        }

        if let Err(e) = self.update_destination_names(&mut new_departures, memos).await {
            return vec![e];
        }

        // Both groupings complete before any location is touched.
        let grouped_by_stop = group_by_stop(&new_departures);
        let grouped_by_stop_area = match self.group_by_stop_area(&new_departures, memos).await {
            Ok(groups) => groups,
            Err(e) => return vec![e],
        };

        let stop_updates = async {
            join_all(
                grouped_by_stop
                    .into_iter()
                    .map(|(location, departures)| self.ingest_location(location, departures)),
            )
            .await
        };

        let stop_area_updates = async {
            join_all(
                grouped_by_stop_area
                    .into_iter()
                    .map(|(location, departures)| self.ingest_location(location, departures)),
            )
            .await
        };

        let (stop_results, stop_area_results) = tokio::join!(stop_updates, stop_area_updates);

        stop_results
            .into_iter()
            .chain(stop_area_results)
            .filter_map(Result::err)
            .collect()
    }

    /// A circular service is displayed with its curated description; a
    /// point-to-point service gets the locality name of its destination
    /// stop. When neither is known the upstream name stands.
    async fn update_destination_names(
        &self,
        departures: &mut Internal,
        memos: &Memos,
    ) -> Result<(), IngestError> {
        for departure in departures.departures.iter_mut() {
            let circular_key = format!("{}{}", departure.operator_code, departure.service_number);
            let circular = lookup(
                self.circular_services.as_ref(),
                &memos.circular_services,
                &circular_key,
            )
            .await?;

            if let Some(description) = circular {
                log::debug!(
                    "service {} {} is a circular service",
                    departure.operator_code,
                    departure.service_number
                );
                departure.destination = description;
                continue;
            }

            let locality = lookup(
                self.locality_names.as_ref(),
                &memos.locality_names,
                &departure.destination_atcocode,
            )
            .await?;

            if let Some(name) = locality {
                departure.destination = name;
                continue;
            }

            log::info!(
                "destination not updated for service {} {} going to {}; output is {}",
                departure.operator_code,
                departure.service_number,
                departure.destination_atcocode,
                departure.destination
            );
        }

        Ok(())
    }

    async fn group_by_stop_area(
        &self,
        departures: &Internal,
        memos: &Memos,
    ) -> Result<HashMap<String, Vec<Departure>>, IngestError> {
        let mut grouped: HashMap<String, Vec<Departure>> = HashMap::new();

        for departure in &departures.departures {
            let stop_area = lookup(
                self.stops_in_area.as_ref(),
                &memos.stops_in_area,
                &departure.location_atcocode,
            )
            .await?;

            match stop_area {
                Some(area) => {
                    grouped.entry(area).or_default().push(departure.clone());
                }
                None => {
                    log::debug!(
                        "location `{}` is not in a stop area",
                        departure.location_atcocode
                    );
                }
            }
        }

        Ok(grouped)
    }

    async fn ingest_location(
        &self,
        location: String,
        new_departures: Vec<Departure>,
    ) -> Result<(), IngestError> {
        log::debug!("ingest location `{location}`");

        let mut departures = self.departures_from_cache(&location).await?;

        combine_cached_and_new(&mut departures, new_departures);

        remove_expired_departures(Utc::now(), &mut departures)?;
        sort_by_departure_time(&mut departures.departures)?;

        self.update_cached_data(&location, &departures).await
    }

    async fn departures_from_cache(&self, location: &str) -> Result<Internal, IngestError> {
        let len = self
            .departures
            .list_len(location)
            .await
            .map_err(|source| IngestError::Store {
                location: location.to_string(),
                source,
            })?;

        log::debug!("{len} cached record(s) for key `{location}`");

        let mut cached = Internal::default();
        if len == 0 {
            return Ok(cached);
        }

        let records = self
            .departures
            .list_range(location, 0, len - 1)
            .await
            .map_err(|source| IngestError::Store {
                location: location.to_string(),
                source,
            })?;

        for record in records {
            let departure: Departure = serde_json::from_str(&record)?;
            cached.departures.push(departure);
        }

        Ok(cached)
    }

    async fn update_cached_data(
        &self,
        location: &str,
        departures: &Internal,
    ) -> Result<(), IngestError> {
        log::debug!(
            "update cached data for location `{}` (total {} departure(s))",
            location,
            departures.departures.len()
        );

        let mut values = Vec::with_capacity(departures.departures.len());
        for departure in &departures.departures {
            values.push(serde_json::to_string(departure)?);
        }

        self.departures
            .replace_list(location, values)
            .await
            .map_err(|source| IngestError::Store {
                location: location.to_string(),
                source,
            })
    }
}

async fn lookup(
    store: &dyn KeyValueStore,
    memo: &Mutex<HashMap<String, Option<String>>>,
    key: &str,
) -> Result<Option<String>, StoreError> {
    if let Some(cached) = memo.lock().expect("memo lock").get(key) {
        return Ok(cached.clone());
    }

    let value = store.get(key).await?;
    memo.lock()
        .expect("memo lock")
        .insert(key.to_string(), value.clone());

    Ok(value)
}

fn group_by_stop(departures: &Internal) -> HashMap<String, Vec<Departure>> {
    let mut grouped: HashMap<String, Vec<Departure>> = HashMap::new();
    for departure in &departures.departures {
        grouped
            .entry(departure.location_atcocode.clone())
            .or_default()
            .push(departure.clone());
    }
    grouped
}

/// Upstream refreshes supersede cached records with the same journey ref;
/// genuinely new records are appended.
fn combine_cached_and_new(departures: &mut Internal, new_departures: Vec<Departure>) {
    let mut new_by_ref: HashMap<String, Departure> = new_departures
        .into_iter()
        .map(|d| (d.journey_ref.clone(), d))
        .collect();

    for cached in departures.departures.iter_mut() {
        if let Some(update) = new_by_ref.remove(&cached.journey_ref) {
            log::debug!("existing departure for {}; replacing", cached.journey_ref);
            *cached = update;
        }
    }

    departures.departures.extend(new_by_ref.into_values());
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, SecondsFormat};
    use departures_service::departures::JourneyType;
    use departures_service::repository::memory::MemoryStore;

    fn rfc3339_in(minutes: i64) -> String {
        (Utc::now() + Duration::minutes(minutes)).to_rfc3339_opts(SecondsFormat::Secs, true)
    }

    fn bus_departure(
        journey_ref: &str,
        location: &str,
        operator: &str,
        service: &str,
        destination_atco: &str,
        destination: &str,
        minutes_from_now: i64,
    ) -> Departure {
        Departure {
            recorded_at_time: rfc3339_in(-1),
            journey_type: JourneyType::Bus,
            journey_ref: journey_ref.to_string(),
            aimed_departure_time: rfc3339_in(minutes_from_now),
            location_atcocode: location.to_string(),
            destination_atcocode: destination_atco.to_string(),
            destination: destination.to_string(),
            service_number: service.to_string(),
            operator_code: operator.to_string(),
            ..Departure::default()
        }
    }

    struct Fixture {
        departures: Arc<MemoryStore>,
        ingester: Ingester,
    }

    fn fixture() -> Fixture {
        let departures = Arc::new(MemoryStore::new());
        let locality_names = Arc::new(MemoryStore::new());
        let stops_in_area = Arc::new(MemoryStore::new());
        let circular_services = Arc::new(MemoryStore::new());

        locality_names.set("1800WA12481", "Hobbiton");
        circular_services.set("VISB525", "Mordor circular");
        stops_in_area.set("1800BNIN0C1", "1800BNIN");

        let ingester = Ingester {
            departures: Arc::clone(&departures) as Arc<dyn KeyValueStore>,
            locality_names,
            stops_in_area,
            circular_services,
        };

        Fixture {
            departures,
            ingester,
        }
    }

    fn event_with(departures: Vec<Departure>) -> SnsEvent {
        let message = serde_json::to_string(&Internal { departures }).unwrap();
        SnsEvent::with_messages(vec![message])
    }

    fn cached(store: &MemoryStore, location: &str) -> Vec<Departure> {
        store
            .list(location)
            .iter()
            .map(|record| serde_json::from_str(record).unwrap())
            .collect()
    }

    #[tokio::test]
    async fn destinations_rewritten_and_grouped_into_stop_and_stop_area() {
        let f = fixture();

        let event = event_with(vec![
            bus_departure(
                "534_in_2023-05-01_1",
                "1800BNIN0C1",
                "ANWE",
                "534",
                "1800WA12481",
                "Turning Circle",
                5,
            ),
            bus_departure(
                "525_in_2023-05-01_2",
                "1800BNIN0C1",
                "VISB",
                "525",
                "1800BNIN0C1",
                "Hobbiton Interchange",
                10,
            ),
        ]);

        f.ingester.handle(event).await.unwrap();

        for location in ["1800BNIN0C1", "1800BNIN"] {
            let list = cached(&f.departures, location);
            assert_eq!(list.len(), 2, "cache at {location}");
            assert_eq!(list[0].destination, "Hobbiton");
            assert_eq!(list[0].service_number, "534");
            assert_eq!(list[1].destination, "Mordor circular");
            assert_eq!(list[1].service_number, "525");
        }
    }

    #[tokio::test]
    async fn expired_cached_entries_are_removed_on_merge() {
        let f = fixture();

        // Two departures already in the past: one bus, one cancelled rail.
        let past_bus = bus_departure(
            "old-bus",
            "1800SJ11291",
            "ANWE",
            "534",
            "1800WA12481",
            "Hobbiton",
            -2,
        );
        let mut past_rail = bus_departure("old-rail", "1800SJ11291", "NT", "", "", "Crewe", -2);
        past_rail.journey_type = JourneyType::Train;
        past_rail.departure_status = Some("Cancelled".to_string());

        f.departures.set_list(
            "1800SJ11291",
            vec![
                serde_json::to_string(&past_bus).unwrap(),
                serde_json::to_string(&past_rail).unwrap(),
            ],
        );

        let event = event_with(vec![bus_departure(
            "new",
            "1800SJ11291",
            "ANWE",
            "534",
            "1800WA12481",
            "Hobbiton",
            5,
        )]);

        f.ingester.handle(event).await.unwrap();

        let list = cached(&f.departures, "1800SJ11291");
        let refs: Vec<&str> = list.iter().map(|d| d.journey_ref.as_str()).collect();
        assert_eq!(refs, vec!["new"]);
    }

    #[tokio::test]
    async fn merge_replaces_matching_journey_refs_and_appends_the_rest() {
        let f = fixture();

        let mut original = bus_departure(
            "534_in_2023-05-01_1",
            "1800SJ11291",
            "ANWE",
            "534",
            "1800WA12481",
            "Hobbiton",
            5,
        );
        original.expected_departure_time = None;
        f.departures
            .set_list("1800SJ11291", vec![serde_json::to_string(&original).unwrap()]);

        let mut refresh = original.clone();
        refresh.expected_departure_time = Some(rfc3339_in(7));
        refresh.destination = "Turning Circle".to_string();

        let addition = bus_departure(
            "535_in_2023-05-01_9",
            "1800SJ11291",
            "ANWE",
            "535",
            "1800WA12481",
            "Turning Circle",
            9,
        );

        f.ingester
            .handle(event_with(vec![refresh, addition]))
            .await
            .unwrap();

        let list = cached(&f.departures, "1800SJ11291");
        assert_eq!(list.len(), 2);

        // The refreshed record replaced the cached one wholesale (with its
        // destination rewritten from the locality names on the way in).
        assert_eq!(list[0].journey_ref, "534_in_2023-05-01_1");
        assert!(list[0].expected_departure_time.is_some());
        assert_eq!(list[0].destination, "Hobbiton");
        assert_eq!(list[1].journey_ref, "535_in_2023-05-01_9");

        // No duplicated journey refs survive a merge.
        let mut refs: Vec<&str> = list.iter().map(|d| d.journey_ref.as_str()).collect();
        refs.dedup();
        assert_eq!(refs.len(), 2);
    }

    #[tokio::test]
    async fn ingest_is_idempotent() {
        let f = fixture();

        let event = event_with(vec![
            bus_departure(
                "a",
                "1800SJ11291",
                "ANWE",
                "534",
                "1800WA12481",
                "Hobbiton",
                5,
            ),
            bus_departure(
                "b",
                "1800SJ11291",
                "ANWE",
                "535",
                "1800WA12481",
                "Hobbiton",
                3,
            ),
        ]);

        f.ingester.handle(event.clone()).await.unwrap();
        let first = f.departures.list("1800SJ11291");

        f.ingester.handle(event).await.unwrap();
        let second = f.departures.list("1800SJ11291");

        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn cached_list_is_sorted_by_departure_time() {
        let f = fixture();

        let event = event_with(vec![
            bus_departure("late", "1800SJ11291", "ANWE", "1", "X", "A", 30),
            bus_departure("soon", "1800SJ11291", "ANWE", "2", "X", "B", 5),
            bus_departure("mid", "1800SJ11291", "ANWE", "3", "X", "C", 15),
        ]);

        f.ingester.handle(event).await.unwrap();

        let list = cached(&f.departures, "1800SJ11291");
        let refs: Vec<&str> = list.iter().map(|d| d.journey_ref.as_str()).collect();
        assert_eq!(refs, vec!["soon", "mid", "late"]);
    }

    #[tokio::test]
    async fn undecodable_record_fails_the_invocation() {
        let f = fixture();

        let event = SnsEvent::with_messages(vec!["{not json".to_string()]);

        let err = f.ingester.handle(event).await.unwrap_err();
        assert!(matches!(err, IngestError::Aggregate));
    }
}
