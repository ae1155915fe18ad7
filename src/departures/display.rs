//! Human-facing board shapes produced by the presenter.

use serde::{Deserialize, Serialize};

use super::JourneyType;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Output {
    pub journey_type: JourneyType,
    pub departures: Vec<DepartureDisplay>,
}

/// One board row. The departure time is either a countdown for real-time
/// data or `HH:MM` for scheduled data; the status string is used for rail
/// departures ("On time", "Delayed", "Cancelled", or a revised time).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DepartureDisplay {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub departure_time: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stand: Option<String>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub service_number: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub destination: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub departure_status: Option<String>,
}
