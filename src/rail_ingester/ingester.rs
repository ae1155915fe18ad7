//! Turns polled station boards into cached rail departures: wall-clock
//! times become absolute instants, multiple destinations collapse into one
//! display string, and the location's list is rewritten whole.

use std::sync::Arc;

use chrono::{DateTime, SecondsFormat, Utc};
use chrono_tz::Tz;
use futures::future::join_all;

use departures_service::departures::{
    local_time::convert_departure_time, remove_expired_departures, sort_by_departure_time,
    Departure, DepartureError, Internal, JourneyType,
};
use departures_service::nationalrail::{ArrayOfServiceLocations, StationBoard};
use departures_service::pubsub::SnsEvent;
use departures_service::repository::{KeyValueStore, StoreError};

#[derive(Debug, thiserror::Error)]
pub enum RailIngestError {
    #[error("could not unmarshal departures into a station board: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("station board CRS code is missing")]
    MissingCrs,
    #[error("could not get ATCO code for {0}")]
    UnknownCrs(String),
    #[error("{field} value is missing for {service}")]
    MissingField { field: String, service: String },
    #[error("empty location name in destination for {0}")]
    EmptyLocationName(String),
    #[error("cannot read departure time for {service}: {source}")]
    DepartureTime {
        service: String,
        #[source]
        source: DepartureError,
    },
    #[error("invalid departure data: {0}")]
    Departure(#[from] DepartureError),
    #[error("cache error: {0}")]
    Store(#[from] StoreError),
    #[error("an error occurred performing a concurrent operation: see previous log output")]
    Aggregate,
}

pub struct RailIngester {
    pub departures: Arc<dyn KeyValueStore>,
    pub rail_references: Arc<dyn KeyValueStore>,
    pub time_zone: Tz,
}

impl RailIngester {
    pub async fn handle(&self, event: SnsEvent) -> Result<(), RailIngestError> {
        log::debug!("handle event with {} record(s)", event.records.len());

        let results = join_all(
            event
                .records
                .iter()
                .map(|record| self.process_record(&record.sns.message)),
        )
        .await;

        let mut failed = false;
        for result in results {
            if let Err(e) = result {
                log::error!("{e}");
                failed = true;
            }
        }

        if failed {
            return Err(RailIngestError::Aggregate);
        }

        log::debug!("handle completed");
        Ok(())
    }

    async fn process_record(&self, message: &str) -> Result<(), RailIngestError> {
        let board: StationBoard = serde_json::from_str(message)?;

        if board.crs.is_empty() {
            return Err(RailIngestError::MissingCrs);
        }

        let atcocode = self
            .rail_references
            .get(&board.crs)
            .await?
            .ok_or_else(|| RailIngestError::UnknownCrs(board.crs.clone()))?;

        let mut departures = transform_to_internal(Utc::now(), &self.time_zone, &board, &atcocode)?;

        remove_expired_departures(Utc::now(), &mut departures)?;
        sort_by_departure_time(&mut departures.departures)?;

        self.update_cached_data(&atcocode, &departures).await
    }

    async fn update_cached_data(
        &self,
        location: &str,
        departures: &Internal,
    ) -> Result<(), RailIngestError> {
        log::debug!(
            "update cached data for location `{}` (total {} departure(s))",
            location,
            departures.departures.len()
        );

        let mut values = Vec::with_capacity(departures.departures.len());
        for departure in &departures.departures {
            values.push(serde_json::to_string(departure)?);
        }

        Ok(self.departures.replace_list(location, values).await?)
    }
}

fn require<'a>(
    value: &'a Option<String>,
    field: &str,
    service: &str,
) -> Result<&'a str, RailIngestError> {
    value.as_deref().ok_or_else(|| RailIngestError::MissingField {
        field: field.to_string(),
        service: service.to_string(),
    })
}

pub fn transform_to_internal(
    now: DateTime<Utc>,
    time_zone: &Tz,
    board: &StationBoard,
    location_atcocode: &str,
) -> Result<Internal, RailIngestError> {
    let platform_available = board.platform_available.unwrap_or(false);
    let recorded_at_time = board
        .generated_at
        .map(|t| t.to_rfc3339_opts(SecondsFormat::Secs, true))
        .unwrap_or_default();

    let mut departures = Internal::default();

    let Some(train_services) = &board.train_services else {
        return Ok(departures);
    };

    for service in &train_services.service {
        let service_id = service
            .service_id
            .as_deref()
            .ok_or_else(|| RailIngestError::MissingField {
                field: "ServiceID".to_string(),
                service: "station board".to_string(),
            })?;

        let std = require(&service.std, "Std", service_id)?;
        let etd = require(&service.etd, "Etd", service_id)?;
        let operator_code = require(&service.operator_code, "OperatorCode", service_id)?;
        let destination = service
            .destination
            .as_ref()
            .ok_or_else(|| RailIngestError::MissingField {
                field: "Destination".to_string(),
                service: service_id.to_string(),
            })?;

        let aimed_departure_time =
            convert_departure_time(&now, time_zone, std).map_err(|source| {
                RailIngestError::DepartureTime {
                    service: service_id.to_string(),
                    source,
                }
            })?;

        let mut departure = Departure {
            recorded_at_time: recorded_at_time.clone(),
            journey_type: JourneyType::Train,
            journey_ref: service_id.to_string(),
            aimed_departure_time: aimed_departure_time.to_rfc3339_opts(SecondsFormat::Secs, false),
            departure_status: Some(etd.to_string()),
            location_atcocode: location_atcocode.to_string(),
            destination: convert_destination(destination, service_id)?,
            operator_code: operator_code.to_string(),
            ..Departure::default()
        };

        if platform_available {
            if let Some(platform) = &service.platform {
                departure.stand = Some(platform.clone());
            }
        }

        departures.departures.push(departure);
    }

    Ok(departures)
}

/// Joins multiple destinations with `" + "`. A `Via` qualifier is appended
/// verbatim after a single space.
fn convert_destination(
    locations: &ArrayOfServiceLocations,
    service_id: &str,
) -> Result<String, RailIngestError> {
    let mut destinations = Vec::with_capacity(locations.location.len());

    for location in &locations.location {
        let name = location
            .location_name
            .as_deref()
            .ok_or_else(|| RailIngestError::EmptyLocationName(service_id.to_string()))?;

        let mut destination = name.to_string();
        if !location.via.is_empty() {
            destination.push(' ');
            destination.push_str(&location.via);
        }

        destinations.push(destination);
    }

    Ok(destinations.join(" + "))
}
