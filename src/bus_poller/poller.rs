//! One poll: build the StopMonitoring request, filter the visits, map to
//! the internal model and publish.

use chrono::{DateTime, SecondsFormat, Utc};
use std::sync::Arc;

use departures_service::departures::{Departure, Internal, JourneyType};
use departures_service::optis::{MonitoredCall, MonitoredVehicleJourney, OptisError, Siri, StopMonitoringApi};
use departures_service::pubsub::{PublishError, Publisher};
use departures_service::siri::duration::IsoDuration;

#[derive(Debug, thiserror::Error)]
pub enum BusPollerError {
    #[error("request to OPTIS failed with status `{status}`: {source}")]
    Optis {
        status: u16,
        #[source]
        source: OptisError,
    },
    #[error("request to OPTIS failed: no stop monitoring delivery")]
    NoDelivery,
    #[error("cannot marshal JSON from departures: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("cannot publish departures: {0}")]
    Publish(#[from] PublishError),
}

pub struct BusPoller {
    pub api: Arc<dyn StopMonitoringApi>,
    pub publisher: Arc<dyn Publisher>,
    pub requestor_ref: String,
    pub preview_interval: IsoDuration,
    pub maximum_stop_visits: i64,
}

impl BusPoller {
    pub async fn handle(&self, atcocode: &str) -> Result<(), BusPollerError> {
        log::debug!("poll for `{atcocode}`");

        let siri_request = self.create_siri_request(atcocode, Utc::now());

        let mut siri = self
            .api
            .request(&siri_request)
            .await
            .map_err(|source| BusPollerError::Optis {
                status: source.status_hint(),
                source,
            })?;

        check_has_departures(&siri)?;
        filter(&mut siri);

        let departures = transform(&siri);

        let message = serde_json::to_string(&departures)?;
        self.publisher.publish(&message).await?;

        Ok(())
    }

    fn create_siri_request(&self, monitoring_ref: &str, now: DateTime<Utc>) -> String {
        let request_timestamp = now.to_rfc3339_opts(SecondsFormat::Secs, true);
        format!(
            r#"<?xml version="1.0" encoding="UTF-8" ?>
<Siri xmlns="http://www.siri.org.uk/siri" xmlns:xsi="http://www.w3.org/2001/XMLSchema-instance" version = "1.3" xsi:schemaLocation = "http://www.siri.org.uk/siri">
    <ServiceRequest>
        <RequestTimestamp>{request_timestamp}</RequestTimestamp>
        <RequestorRef>{requestor_ref}</RequestorRef>
        <StopMonitoringRequest version="1.3">
            <RequestTimestamp>{request_timestamp}</RequestTimestamp>
            <MonitoringRef>{monitoring_ref}</MonitoringRef>
            <PreviewInterval>{preview_interval}</PreviewInterval>
            <MaximumStopVisits>{maximum_stop_visits}</MaximumStopVisits>
        </StopMonitoringRequest>
    </ServiceRequest>
</Siri>"#,
            request_timestamp = request_timestamp,
            requestor_ref = self.requestor_ref,
            monitoring_ref = monitoring_ref,
            preview_interval = self.preview_interval,
            maximum_stop_visits = self.maximum_stop_visits,
        )
    }
}

fn check_has_departures(siri: &Siri) -> Result<(), BusPollerError> {
    let status = siri
        .service_delivery
        .as_ref()
        .and_then(|d| d.stop_monitoring_delivery.as_ref())
        .and_then(|d| d.status);

    if status != Some(true) {
        return Err(BusPollerError::NoDelivery);
    }
    Ok(())
}

/// Keeps a visit iff it has a departure time, is not flagged erroneous and
/// is not cancelled.
fn filter(siri: &mut Siri) {
    let Some(delivery) = siri
        .service_delivery
        .as_mut()
        .and_then(|d| d.stop_monitoring_delivery.as_mut())
    else {
        return;
    };

    let initial_len = delivery.monitored_stop_visit.len();

    delivery.monitored_stop_visit.retain(|visit| {
        let journey = &visit.monitored_vehicle_journey;
        let keep = has_departure_time(&journey.monitored_call)
            && !erroneous_record(journey)
            && !cancelled_journey(journey);
        if keep {
            log::debug!("include JourneyRef {}", journey_identity(journey));
        } else {
            log::debug!("exclude JourneyRef {}", journey_identity(journey));
        }
        keep
    });

    log::debug!(
        "filter - {} records remain; {} records filtered",
        delivery.monitored_stop_visit.len(),
        initial_len - delivery.monitored_stop_visit.len()
    );
}

fn journey_identity(journey: &MonitoredVehicleJourney) -> String {
    [
        journey.line_ref.as_str(),
        journey.direction_ref.as_str(),
        journey.framed_vehicle_journey_ref.data_frame_ref.as_str(),
        journey
            .framed_vehicle_journey_ref
            .dated_vehicle_journey_ref
            .as_str(),
    ]
    .join("_")
}

fn has_departure_time(call: &MonitoredCall) -> bool {
    call.expected_departure_time.is_some() || call.aimed_departure_time.is_some()
}

/// A visit whose stop-call aimed time precedes the journey's origin aimed
/// time is upstream garbage.
fn erroneous_record(journey: &MonitoredVehicleJourney) -> bool {
    let erroneous = match (
        journey.monitored_call.aimed_departure_time,
        journey.origin_aimed_departure_time,
    ) {
        (Some(aimed), Some(origin)) => aimed < origin,
        (None, Some(_)) => true,
        (_, None) => false,
    };

    if erroneous {
        log::warn!(
            "erroneous record: AimedDepartureTime {:?} is before OriginAimedDepartureTime {:?}",
            journey.monitored_call.aimed_departure_time,
            journey.origin_aimed_departure_time
        );
    }
    erroneous
}

fn cancelled_journey(journey: &MonitoredVehicleJourney) -> bool {
    let cancelled = journey.monitored_call.departure_status == "cancelled";
    if cancelled {
        log::info!(
            "cancelled journey at {}: {} scheduled to depart at {:?}",
            journey.monitored_call.stop_point_ref,
            journey.line_ref,
            journey.monitored_call.aimed_departure_time
        );
    }
    cancelled
}

fn transform(siri: &Siri) -> Internal {
    let mut departures = Internal::default();

    let Some(delivery) = siri
        .service_delivery
        .as_ref()
        .and_then(|d| d.stop_monitoring_delivery.as_ref())
    else {
        return departures;
    };

    for visit in &delivery.monitored_stop_visit {
        let journey = &visit.monitored_vehicle_journey;
        let call = &journey.monitored_call;

        let mut departure = Departure {
            recorded_at_time: visit
                .recorded_at_time
                .map(|t| t.to_rfc3339_opts(SecondsFormat::Secs, true))
                .unwrap_or_default(),
            journey_type: JourneyType::Bus,
            journey_ref: journey_identity(journey),
            aimed_departure_time: call
                .aimed_departure_time
                .map(|t| t.to_rfc3339_opts(SecondsFormat::Secs, true))
                .unwrap_or_default(),
            location_atcocode: call.stop_point_ref.clone(),
            destination_atcocode: journey.destination_ref.clone(),
            destination: journey.destination_name.clone(),
            service_number: journey.line_ref.clone(),
            operator_code: visit.extensions.national_operator_code.clone(),
            ..Departure::default()
        };

        if let Some(expected) = call.expected_departure_time {
            departure.expected_departure_time =
                Some(expected.to_rfc3339_opts(SecondsFormat::Secs, true));
        }

        departure.stand = departure.stand();

        departures.departures.push(departure);
    }

    departures
}
